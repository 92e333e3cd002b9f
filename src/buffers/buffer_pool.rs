use std::sync::Mutex;
use tracing::{debug, trace};

use crate::buffers::fixed_buffer::FixedBuf;

/// A bounded pool of read buffers. Acquiring from an empty pool allocates a fresh buffer,
///  releasing into a full pool discards the buffer - the pool never blocks and never grows
///  beyond its configured bound.
pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> BufferPool {
        BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn acquire(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        FixedBuf::new(self.buf_size)
    }

    pub fn release(&self, mut buffer: FixedBuf) {
        if buffer.capacity() != self.buf_size {
            // e.g. a default-initialized placeholder - there is no safe way to pool it
            debug!("released buffer does not have the pool's capacity of {} bytes - discarding", self.buf_size);
            return;
        }

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("pool is full: discarding returned buffer");
        }
    }
}
