//! Fixed-capacity sample buffers and the pool they are allocated from
//!
//! A [`SampleBuffer`] is a block of 16-bit PCM addressed as bytes (the unit the
//! devices speak) or as samples (the unit the effect speaks). The valid
//! length is tracked separately from the capacity: a freshly freed buffer
//! has length 0, a freshly captured one has length == capacity.
//!
//! All buffers are allocated once by [`SampleBufferPool`] and then only moved
//! between queues as `Box<SampleBuffer>`, so the hot path never allocates.

use crate::error::{EngineError, EngineResult};

/// Smallest pool that can keep both devices busy
pub const MIN_POOL_BUFFERS: usize = 2;

/// One device buffer worth of interleaved 16-bit PCM
pub struct SampleBuffer {
    samples: Box<[i16]>,
    capacity: usize,
    len: usize,
}

impl SampleBuffer {
    /// Allocate a zero-filled buffer of `capacity` bytes
    ///
    /// Storage is padded to whole samples; the reported capacity is exactly
    /// what was asked for.
    pub fn new(capacity: usize) -> Self {
        let sample_count = capacity.div_ceil(std::mem::size_of::<i16>());
        Self {
            samples: vec![0i16; sample_count].into_boxed_slice(),
            capacity,
            len: 0,
        }
    }

    /// A zero-filled buffer whose valid length already covers its capacity
    pub fn silence(capacity: usize) -> Self {
        let mut buffer = Self::new(capacity);
        buffer.len = capacity;
        buffer
    }

    /// Capacity in bytes
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Valid bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the valid length, clamped to capacity
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity);
    }

    /// Mark the whole buffer as valid (a device completed a full fill)
    #[inline]
    pub fn mark_full(&mut self) {
        self.len = self.capacity;
    }

    /// Forget the contents without touching the samples
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Whole buffer as bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<i16, u8>(&self.samples[..])[..self.capacity]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<i16, u8>(&mut self.samples[..])[..self.capacity]
    }

    /// Only the valid bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.as_bytes()[..self.len]
    }

    /// Whole buffer as samples
    #[inline]
    pub fn samples(&self) -> &[i16] {
        &self.samples[..self.capacity / std::mem::size_of::<i16>()]
    }

    #[inline]
    pub fn samples_mut(&mut self) -> &mut [i16] {
        let count = self.capacity / std::mem::size_of::<i16>();
        &mut self.samples[..count]
    }

    /// Zero every sample
    pub fn fill_silence(&mut self) {
        self.samples.fill(0);
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish()
    }
}

/// The preallocated set of buffers an engine circulates
///
/// Created once at engine construction; its buffers are moved into the
/// free queue and never allocated again for the life of the engine.
#[derive(Debug)]
pub struct SampleBufferPool {
    buffers: Vec<Box<SampleBuffer>>,
    buffer_bytes: usize,
}

impl SampleBufferPool {
    /// Allocate `count` buffers of `buffer_bytes` each
    pub fn allocate(count: usize, buffer_bytes: usize) -> EngineResult<Self> {
        if count < MIN_POOL_BUFFERS {
            return Err(EngineError::PoolAllocation {
                requested: count,
                reason: format!("at least {} buffers are required", MIN_POOL_BUFFERS),
            });
        }
        if buffer_bytes == 0 {
            return Err(EngineError::PoolAllocation {
                requested: count,
                reason: "buffers cannot be empty".to_string(),
            });
        }

        let mut buffers = Vec::new();
        buffers
            .try_reserve_exact(count)
            .map_err(|e| EngineError::PoolAllocation {
                requested: count,
                reason: e.to_string(),
            })?;
        buffers.extend((0..count).map(|_| Box::new(SampleBuffer::new(buffer_bytes))));

        log::debug!(
            "Allocated sample buffer pool: {} x {} bytes",
            count,
            buffer_bytes
        );

        Ok(Self {
            buffers,
            buffer_bytes,
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Capacity of every buffer in the pool, in bytes
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_bytes
    }

    /// Hand out every buffer, leaving the pool empty
    pub fn drain(&mut self) -> impl Iterator<Item = Box<SampleBuffer>> + '_ {
        self.buffers.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_empty_and_zeroed() {
        let buffer = SampleBuffer::new(480);
        assert_eq!(buffer.capacity(), 480);
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_bytes().len(), 480);
        assert_eq!(buffer.samples().len(), 240);
        assert!(buffer.as_bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_silence_is_full_length() {
        let silence = SampleBuffer::silence(64);
        assert_eq!(silence.len(), 64);
        assert_eq!(silence.data().len(), 64);
        assert!(silence.samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_set_len_clamps_to_capacity() {
        let mut buffer = SampleBuffer::new(16);
        buffer.set_len(100);
        assert_eq!(buffer.len(), 16);
        buffer.clear();
        assert_eq!(buffer.len(), 0);
        buffer.mark_full();
        assert_eq!(buffer.len(), 16);
    }

    #[test]
    fn test_byte_and_sample_views_alias() {
        let mut buffer = SampleBuffer::new(8);
        buffer.samples_mut()[1] = 0x0102;
        let bytes = buffer.as_bytes();
        let expected = 0x0102i16.to_ne_bytes();
        assert_eq!(&bytes[2..4], &expected);
    }

    #[test]
    fn test_odd_capacity_is_padded_internally() {
        let mut buffer = SampleBuffer::new(5);
        assert_eq!(buffer.as_bytes_mut().len(), 5);
        assert_eq!(buffer.samples().len(), 2);
    }

    #[test]
    fn test_pool_allocates_distinct_buffers() {
        let mut pool = SampleBufferPool::allocate(8, 256).unwrap();
        assert_eq!(pool.len(), 8);
        assert_eq!(pool.buffer_bytes(), 256);

        let buffers: Vec<_> = pool.drain().collect();
        assert!(pool.is_empty());
        let mut addrs: Vec<_> = buffers.iter().map(|b| b.as_bytes().as_ptr()).collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 8);
        assert!(buffers.iter().all(|b| b.capacity() == 256 && b.is_empty()));
    }

    #[test]
    fn test_pool_rejects_fewer_than_two_buffers() {
        assert!(matches!(
            SampleBufferPool::allocate(1, 256),
            Err(EngineError::PoolAllocation { requested: 1, .. })
        ));
        assert!(SampleBufferPool::allocate(4, 0).is_err());
    }
}
