//! Reference-counted views of pooled read buffers.
//!
//! Inbound data is read from the socket into pooled [`FixedBuf`]s. A single socket read may
//!  contain the tail of one message, several complete messages and the head of another, so a
//!  buffer's lifetime is decoupled from any single message: every message event holds views of
//!  the buffers its bytes live in, and the buffer returns to its pool only once the last view
//!  is dropped.

use std::fmt::{Debug, Formatter};
use std::mem;
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::buffers::buffer_pool::BufferPool;
use crate::buffers::fixed_buffer::FixedBuf;

struct SharedCore {
    data: FixedBuf,
    pool: Arc<BufferPool>,
    refs: AtomicIsize,
}

impl Drop for SharedCore {
    fn drop(&mut self) {
        self.pool.release(mem::take(&mut self.data));
    }
}

/// One owned view of a pooled buffer. [`SharedBuffer::attach`] creates further views; dropping
///  the last view returns the underlying buffer to its pool.
///
/// Disposal is tied to ownership, so releasing a view twice is not expressible. The explicit
///  reference count is kept regardless: it is asserted to never go below zero, making any
///  future bookkeeping bug a loud programming error instead of a silent pool corruption.
pub struct SharedBuffer {
    core: Arc<SharedCore>,
}

impl SharedBuffer {
    pub fn new(data: FixedBuf, pool: Arc<BufferPool>) -> SharedBuffer {
        SharedBuffer {
            core: Arc::new(SharedCore {
                data,
                pool,
                refs: AtomicIsize::new(1),
            }),
        }
    }

    /// create an additional owned view of the same underlying buffer
    pub fn attach(&self) -> SharedBuffer {
        let prev = self.core.refs.fetch_add(1, Ordering::Relaxed);
        assert!(prev > 0, "this is a bug: attach on a disposed shared buffer");
        SharedBuffer {
            core: self.core.clone(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.core.data.as_ref()
    }

    pub fn len(&self) -> usize {
        self.core.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.core.data.is_empty()
    }

    /// create a view of a byte range of this buffer, attaching to keep the buffer alive
    pub fn slice(&self, range: Range<usize>) -> SharedSlice {
        assert!(range.end <= self.len() && range.start <= range.end);
        SharedSlice {
            buf: self.attach(),
            range,
        }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        let prev = self.core.refs.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "this is a bug: shared buffer reference count dropped below zero");
    }
}

impl Debug for SharedBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedBuffer(len={}, refs={})", self.len(), self.core.refs.load(Ordering::Relaxed))
    }
}

/// A view of a contiguous byte range of a [`SharedBuffer`]. Messages spanning several pooled
///  buffers are represented as one slice per buffer, each keeping exactly its own buffer alive.
pub struct SharedSlice {
    buf: SharedBuffer,
    range: Range<usize>,
}

impl SharedSlice {
    pub fn len(&self) -> usize {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

impl AsRef<[u8]> for SharedSlice {
    fn as_ref(&self) -> &[u8] {
        &self.buf.as_slice()[self.range.clone()]
    }
}

impl Debug for SharedSlice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.as_ref().fmt(f)
    }
}
