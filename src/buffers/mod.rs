pub mod atomic_map;
pub mod buffer_pool;
pub mod fixed_buffer;
pub mod shared_buffer;
