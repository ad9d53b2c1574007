use crate::core::constants::MAX_PAGE_SIZE;
use std::sync::Mutex;

/// Recycles zeroed scratch buffers for page encoding.
///
/// Files opened with different page sizes share the pool; a buffer is resized
/// on the way out instead of keeping one pool per size.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_size: usize,
}

impl BufferPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_size,
        }
    }

    /// Zero-filled buffer of exactly `len` bytes.
    pub fn get(&self, len: usize) -> Vec<u8> {
        let recycled = match self.buffers.lock() {
            Ok(mut buffers) => buffers.pop(),
            Err(_) => None,
        };
        match recycled {
            Some(mut buf) => {
                buf.resize(len, 0);
                buf
            }
            None => vec![0u8; len],
        }
    }

    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_PAGE_SIZE {
            return;
        }

        if let Ok(mut buffers) = self.buffers.lock() {
            if buffers.len() < self.max_size {
                buf.clear();
                buffers.push(buf);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }
}

static NODE_ENCODE_POOL: once_cell::sync::Lazy<BufferPool> =
    once_cell::sync::Lazy::new(|| BufferPool::new(64));

/// Scratch buffer for serializing a B-tree node into a page work area.
pub fn get_node_buffer(len: usize) -> Vec<u8> {
    NODE_ENCODE_POOL.get(len)
}

pub fn put_node_buffer(buf: Vec<u8>) {
    NODE_ENCODE_POOL.put(buf);
}

static PAGE_BUFFER_POOL: once_cell::sync::Lazy<BufferPool> =
    once_cell::sync::Lazy::new(|| BufferPool::new(128));

/// Scratch buffer for whole-page reads and overflow chunks.
pub fn get_page_buffer(len: usize) -> Vec<u8> {
    PAGE_BUFFER_POOL.get(len)
}

pub fn put_page_buffer(buf: Vec<u8>) {
    PAGE_BUFFER_POOL.put(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycled_buffers_come_back_zeroed() {
        let pool = BufferPool::new(4);

        let mut buf = pool.get(512);
        assert_eq!(buf.len(), 512);
        buf.fill(0xAB);
        pool.put(buf);
        assert_eq!(pool.len(), 1);

        let again = pool.get(256);
        assert_eq!(again.len(), 256);
        assert!(again.iter().all(|&b| b == 0));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_max_size() {
        let pool = BufferPool::new(2);
        let bufs: Vec<Vec<u8>> = (0..3).map(|_| pool.get(64)).collect();
        for b in bufs {
            pool.put(b);
        }
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn test_global_pools() {
        let buf = get_node_buffer(4032);
        assert_eq!(buf.len(), 4032);
        put_node_buffer(buf);

        let page = get_page_buffer(4096);
        assert_eq!(page.len(), 4096);
        put_page_buffer(page);
    }
}
