//! A bounded pool of recyclable scratch buffers.
//!
//! The record transform borrows two buffers per batch (parcel and
//! wrapper scratch), sized to the batch maxima. Pooling keeps those
//! large allocations off the per-batch path. Buffers are grouped in
//! power-of-two size classes; a request larger than the largest class
//! falls back to a plain allocation that is not recycled.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

const MIN_CLASS: usize = 1 << 10; // 1 KiB
const MAX_CLASS: usize = 1 << 24; // 16 MiB

pub struct BufferPool {
    classes: Vec<SizeClass>,
    per_class_limit: usize,
}

struct SizeClass {
    size: usize,
    free: std::sync::Mutex<Vec<BytesMut>>,
}

impl BufferPool {
    /// A pool retaining at most `per_class_limit` buffers per size
    /// class.
    pub fn new(per_class_limit: usize) -> Arc<Self> {
        let mut classes = Vec::new();
        let mut size = MIN_CLASS;
        while size <= MAX_CLASS {
            classes.push(SizeClass {
                size,
                free: std::sync::Mutex::new(Vec::new()),
            });
            size <<= 1;
        }
        Arc::new(BufferPool {
            classes,
            per_class_limit,
        })
    }

    /// A cleared buffer with capacity for at least `size` bytes.
    pub fn acquire(self: &Arc<Self>, size: usize) -> PooledBuffer {
        let Some(class) = self.classes.iter().position(|c| c.size >= size) else {
            metrics::counter!("enseal_pool_fallback_allocations").increment(1);
            return PooledBuffer {
                buf: Some(BytesMut::with_capacity(size)),
                class: None,
                pool: self.clone(),
            };
        };

        let buf = {
            let mut free = self.classes[class].free.lock().unwrap();
            free.pop()
        }
        .unwrap_or_else(|| BytesMut::with_capacity(self.classes[class].size));

        PooledBuffer {
            buf: Some(buf),
            class: Some(class),
            pool: self.clone(),
        }
    }

    fn release(&self, class: usize, mut buf: BytesMut) {
        // A buffer that donated its storage (e.g. via split/freeze) is
        // not worth pooling again.
        if buf.capacity() < self.classes[class].size {
            return;
        }
        buf.clear();

        let mut free = self.classes[class].free.lock().unwrap();
        if free.len() < self.per_class_limit {
            free.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.classes
            .iter()
            .map(|c| c.free.lock().unwrap().len())
            .sum()
    }
}

/// A borrowed buffer. Dropping it returns the storage to the pool;
/// the guard owns the buffer, so a double release cannot be expressed.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Some(class)) = (self.buf.take(), self.class) {
            self.pool.release(class, buf);
        }
    }
}
