//! Pooled byte buffers and the buffer-size policy shared by read and write
//! paths.
//!
//! Buffers are kept in power-of-two size classes. Sizes requested by the
//! compaction are rounded to a small set of classes so the pools stay warm and
//! memory does not fragment into many distinct allocation sizes.

use std::ops::{Deref, DerefMut};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

const MIN_CLASS_SHIFT: u32 = 10; // 1 KiB
const MAX_CLASS_SHIFT: u32 = 28; // 256 MiB
const CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
/// Buffers retained per size class.
const MAX_RETAINED: usize = 8;

pub const MIN_BUFFER_SIZE: usize = 64 << 10;
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

static POOLS: Lazy<Vec<Mutex<Vec<Vec<u8>>>>> =
    Lazy::new(|| (0..CLASSES).map(|_| Mutex::new(Vec::new())).collect());

fn class_of(capacity: usize) -> Option<usize> {
    let shift = capacity.max(1).next_power_of_two().trailing_zeros();
    let shift = shift.max(MIN_CLASS_SHIFT);
    (shift <= MAX_CLASS_SHIFT).then(|| (shift - MIN_CLASS_SHIFT) as usize)
}

/// A byte buffer borrowed from the pool; returned on drop.
#[derive(Debug, Default)]
pub struct PooledBuffer {
    buf: Vec<u8>,
}

impl PooledBuffer {
    /// Take a zero-length buffer with capacity of at least `size` bytes.
    pub fn get(size: usize) -> Self {
        let Some(class) = class_of(size) else {
            return Self {
                buf: Vec::with_capacity(size),
            };
        };
        let buf = POOLS[class]
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(1 << (class as u32 + MIN_CLASS_SHIFT)));
        Self { buf }
    }

    /// Detach the buffer from the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Return a detached buffer to the pool.
    pub fn put(mut buf: Vec<u8>) {
        // Only exact class sizes are pooled, so `get` never sees a short buffer.
        if buf.capacity() == 0 || !buf.capacity().is_power_of_two() {
            return;
        }
        if let Some(class) = class_of(buf.capacity()) {
            if 1 << (class as u32 + MIN_CLASS_SHIFT) != buf.capacity() {
                return;
            }
            buf.clear();
            let mut pool = POOLS[class].lock();
            if pool.len() < MAX_RETAINED {
                pool.push(buf);
            }
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        PooledBuffer::put(buf);
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

/// Round `size` up to a power of two within `[MIN_BUFFER_SIZE, MAX_BUFFER_SIZE]`.
pub fn buffer_size_class(size: u64) -> usize {
    let size = usize::try_from(size).unwrap_or(MAX_BUFFER_SIZE);
    size.max(1)
        .checked_next_power_of_two()
        .unwrap_or(MAX_BUFFER_SIZE)
        .clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
}

/// Page buffer size for a profile table estimated at `size` bytes.
pub fn estimate_page_buffer_size(size: u64) -> usize {
    buffer_size_class(size)
}

/// Bytes fetched from the end of a parquet section when opening it, in the
/// hope of getting the whole footer in a single request.
pub fn estimate_footer_size(size: u64) -> u64 {
    const MIN_FOOTER: u64 = 32 << 10;
    const MAX_FOOTER: u64 = 512 << 10;
    (size / 10000).clamp(MIN_FOOTER, MAX_FOOTER).min(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes_are_bounded() {
        assert_eq!(buffer_size_class(0), MIN_BUFFER_SIZE);
        assert_eq!(buffer_size_class(1), MIN_BUFFER_SIZE);
        assert_eq!(buffer_size_class(64 << 10), 64 << 10);
        assert_eq!(buffer_size_class((64 << 10) + 1), 128 << 10);
        assert_eq!(buffer_size_class(300 << 10), 512 << 10);
        assert_eq!(buffer_size_class(1 << 30), MAX_BUFFER_SIZE);
        assert_eq!(buffer_size_class(u64::MAX), MAX_BUFFER_SIZE);

        let mut distinct: Vec<usize> = (0..(8u64 << 20))
            .step_by(4099)
            .map(estimate_page_buffer_size)
            .collect();
        distinct.dedup();
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn footer_estimate() {
        assert_eq!(estimate_footer_size(0), 0);
        assert_eq!(estimate_footer_size(1000), 1000);
        assert_eq!(estimate_footer_size(10 << 20), 32 << 10);
        assert_eq!(estimate_footer_size(1 << 40), 512 << 10);
    }

    #[test]
    fn pooled_buffers_are_reused() {
        let mut buf = PooledBuffer::get(3000);
        assert!(buf.capacity() >= 3000);
        assert!(buf.is_empty());
        buf.extend_from_slice(b"hello");
        drop(buf);

        let buf = PooledBuffer::get(4096);
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), 4096);

        let odd = PooledBuffer::get(0).into_inner();
        PooledBuffer::put(odd);
    }
}
