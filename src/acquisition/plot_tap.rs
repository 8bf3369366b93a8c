//! Lossy live-view ring buffer.
//!
//! The acquisition callback copies one selected channel into a [`PlotRing`]
//! behind a `try_lock`: when a reader holds the lock the chunk is simply not
//! shown. The ring never applies backpressure and never touches the
//! double-buffer handoff.

use std::sync::Arc;

use parking_lot::Mutex;

use super::channel_group::SampleChunk;

/// Shared handle to a task's plot ring.
pub type PlotTap = Arc<Mutex<PlotRing>>;

/// Fixed-capacity circular buffer of scalar samples.
#[derive(Debug, Clone)]
pub struct PlotRing {
    data: Vec<f64>,
    write_index: usize,
    filled: bool,
}

/// Summary of the current window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub len: usize,
}

impl PlotRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            write_index: 0,
            filled: false,
        }
    }

    pub fn shared(capacity: usize) -> PlotTap {
        Arc::new(Mutex::new(Self::new(capacity)))
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        if self.filled {
            self.data.len()
        } else {
            self.write_index
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `channel` of `chunk` in at the write index, wrapping around.
    pub fn write_column(&mut self, chunk: &SampleChunk<'_>, channel: usize) {
        let capacity = self.data.len();
        if capacity == 0 {
            return;
        }
        for value in chunk.column(channel) {
            self.data[self.write_index] = value;
            self.write_index += 1;
            if self.write_index == capacity {
                self.write_index = 0;
                self.filled = true;
            }
        }
    }

    /// Samples from oldest to newest.
    pub fn snapshot(&self) -> Vec<f64> {
        if self.filled {
            let mut out = Vec::with_capacity(self.data.len());
            out.extend_from_slice(&self.data[self.write_index..]);
            out.extend_from_slice(&self.data[..self.write_index]);
            out
        } else {
            self.data[..self.write_index].to_vec()
        }
    }

    pub fn latest(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let capacity = self.data.len();
        Some(self.data[(self.write_index + capacity - 1) % capacity])
    }

    pub fn stats(&self) -> Option<WindowStats> {
        let last = self.latest()?;
        let window = self.snapshot();
        let (min, max) = window
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            });
        Some(WindowStats {
            min,
            max,
            last,
            len: window.len(),
        })
    }

    /// Forget all samples.
    pub fn clear(&mut self) {
        self.write_index = 0;
        self.filled = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_and_snapshots_oldest_first() {
        let mut ring = PlotRing::new(4);
        let first = [1.0, 100.0, 2.0, 200.0, 3.0, 300.0];
        ring.write_column(&SampleChunk::new(&first, 2), 0);
        assert_eq!(ring.snapshot(), vec![1.0, 2.0, 3.0]);

        let second = [4.0, 400.0, 5.0, 500.0];
        ring.write_column(&SampleChunk::new(&second, 2), 0);
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.snapshot(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(ring.latest(), Some(5.0));
    }

    #[test]
    fn stats_over_window() {
        let mut ring = PlotRing::new(8);
        let data = [0.5, -1.5, 2.5];
        ring.write_column(&SampleChunk::new(&data, 1), 0);
        let stats = ring.stats().unwrap();
        assert_eq!(stats.min, -1.5);
        assert_eq!(stats.max, 2.5);
        assert_eq!(stats.last, 2.5);
        assert_eq!(stats.len, 3);
    }

    #[test]
    fn empty_ring_has_no_stats() {
        let mut ring = PlotRing::new(4);
        assert!(ring.stats().is_none());
        ring.write_column(&SampleChunk::new(&[1.0], 1), 0);
        ring.clear();
        assert!(ring.is_empty());
    }
}
