//! Analysis windows shared between the audio thread and the level meter

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

/// Thread-safe ring buffer holding the most recent samples of one audio path.
///
/// Writers never block on a full buffer: the oldest samples are dropped, so
/// the buffer always holds the latest `capacity` samples. Clones share the
/// same storage.
#[derive(Clone)]
pub struct AudioRingBuffer {
    buffer: Arc<Mutex<HeapRb<f32>>>,
}

impl AudioRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(HeapRb::new(capacity.max(1)))),
        }
    }

    /// Append samples, evicting the oldest ones when full
    pub fn write(&self, samples: &[f32]) {
        let mut buffer = self.buffer.lock();
        let capacity = buffer.capacity().get();

        // Only the tail can survive anyway
        let start = samples.len().saturating_sub(capacity);
        for &sample in &samples[start..] {
            if buffer.try_push(sample).is_err() {
                let _ = buffer.try_pop();
                let _ = buffer.try_push(sample);
            }
        }
    }

    /// Copy the window, oldest first, without consuming it
    pub fn snapshot(&self) -> Vec<f32> {
        self.buffer.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    pub fn clear(&self) {
        self.buffer.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.buffer.lock().capacity().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_keeps_latest() {
        let window = AudioRingBuffer::new(10);
        let data: Vec<f32> = (0..25).map(|i| i as f32).collect();

        window.write(&data);

        let expected: Vec<f32> = (15..25).map(|i| i as f32).collect();
        assert_eq!(window.snapshot(), expected);
        assert_eq!(window.len(), 10);
    }

    #[test]
    fn test_small_writes_slide_the_window() {
        let window = AudioRingBuffer::new(4);
        for chunk in [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]] {
            window.write(&chunk);
        }
        assert_eq!(window.snapshot(), vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_snapshot_does_not_consume() {
        let window = AudioRingBuffer::new(8);
        window.write(&[0.1, 0.2, 0.3]);

        assert_eq!(window.snapshot(), vec![0.1, 0.2, 0.3]);
        assert_eq!(window.len(), 3);

        window.write(&[0.4]);
        assert_eq!(window.snapshot(), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_clones_share_storage() {
        let writer = AudioRingBuffer::new(4);
        let reader = writer.clone();

        writer.write(&[1.0, 2.0]);
        assert_eq!(reader.snapshot(), vec![1.0, 2.0]);

        reader.clear();
        assert!(writer.is_empty());
        assert_eq!(writer.capacity(), 4);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let window = AudioRingBuffer::new(0);
        window.write(&[1.0, 2.0]);
        assert_eq!(window.snapshot(), vec![2.0]);
    }
}
