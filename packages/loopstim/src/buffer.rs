// Circular sample storage and consumer queues
//
// `CircularSampleBuffer` holds the last `N` samples of every analog channel plus
// the derived marker channels. It has a single writer (the acquisition loop)
// and is only ever touched under the frame-state mutex, so it needs no
// interior synchronization of its own.
//
// `DropOldestQueue` is the hand-off to consumers that must never slow the
// producer down: when full, the oldest item is discarded.

use crate::types::{MarkerChannel, PersistedChunk, ANALOG_CHANNELS, MARKER_CHANNELS};
use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Fixed-capacity ring of analog and marker samples
#[derive(Debug, Clone)]
pub struct CircularSampleBuffer {
    capacity: usize,
    analog: Vec<Vec<f64>>,
    markers: [Vec<f64>; MARKER_CHANNELS],
    write_index: usize,
}

/// Copy of a window of the ring, oldest sample first
#[derive(Debug, Clone, PartialEq)]
pub struct BufferWindow {
    pub samples: Vec<Vec<f64>>,
    pub markers: [Vec<f64>; MARKER_CHANNELS],
}

impl From<BufferWindow> for PersistedChunk {
    fn from(window: BufferWindow) -> Self {
        PersistedChunk {
            samples: window.samples,
            markers: window.markers,
        }
    }
}

impl CircularSampleBuffer {
    /// Allocate a zero-filled buffer of `capacity` samples per channel
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");
        Self {
            capacity,
            analog: vec![vec![0.0; capacity]; ANALOG_CHANNELS],
            markers: std::array::from_fn(|_| vec![0.0; capacity]),
            write_index: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Index the next chunk will be written at
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Zero every marker channel over `range`
    pub fn clear_markers(&mut self, range: Range<usize>) {
        assert!(range.end <= self.capacity, "marker range {:?} outside buffer", range);
        for marker in self.markers.iter_mut() {
            marker[range.clone()].fill(0.0);
        }
    }

    /// Store `samples[ch][src]` at `at_index`; the block must not wrap
    pub fn write(&mut self, at_index: usize, samples: &[Vec<f64>], src: Range<usize>) {
        let len = src.len();
        assert_eq!(samples.len(), ANALOG_CHANNELS, "chunk must carry every analog channel");
        assert!(
            at_index + len <= self.capacity,
            "write of {} samples at {} crosses the buffer end ({})",
            len,
            at_index,
            self.capacity
        );
        for (dst, channel) in self.analog.iter_mut().zip(samples) {
            dst[at_index..at_index + len].copy_from_slice(&channel[src.clone()]);
        }
        self.write_index = (at_index + len) % self.capacity;
    }

    pub fn mark(&mut self, marker: MarkerChannel, index: usize, value: f64) {
        assert!(index < self.capacity, "marker index {} outside buffer", index);
        self.markers[marker.index()][index] = value;
    }

    pub fn marker_at(&self, marker: MarkerChannel, index: usize) -> f64 {
        self.markers[marker.index()][index]
    }

    pub fn analog(&self, channel: usize) -> &[f64] {
        &self.analog[channel]
    }

    pub fn marker(&self, marker: MarkerChannel) -> &[f64] {
        &self.markers[marker.index()]
    }

    /// Copy `length` samples starting at `from_index`, following the wrap
    pub fn read(&self, from_index: usize, length: usize) -> BufferWindow {
        assert!(from_index < self.capacity, "read index {} outside buffer", from_index);
        assert!(length <= self.capacity, "read of {} exceeds buffer", length);

        let first = length.min(self.capacity - from_index);
        let rest = length - first;
        let copy = |src: &Vec<f64>| {
            let mut out = Vec::with_capacity(length);
            out.extend_from_slice(&src[from_index..from_index + first]);
            out.extend_from_slice(&src[..rest]);
            out
        };

        BufferWindow {
            samples: self.analog.iter().map(copy).collect(),
            markers: std::array::from_fn(|m| copy(&self.markers[m])),
        }
    }
}

/// Counters for a drop-oldest queue
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueMetrics {
    pub total_pushed: u64,
    pub total_popped: u64,
    pub total_dropped: u64,
    pub current_size: usize,
    pub peak_size: usize,
    pub capacity: usize,
}

/// Bounded lock-free queue that discards its oldest item when full
pub struct DropOldestQueue<T> {
    queue: ArrayQueue<T>,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
    total_dropped: AtomicU64,
    peak_size: AtomicUsize,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
        }
    }

    /// Push without ever blocking; returns true if an older item was discarded
    pub fn push(&self, item: T) -> bool {
        let displaced = self.queue.force_push(item).is_some();
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        if displaced {
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.peak_size.fetch_max(self.queue.len(), Ordering::Relaxed);
        displaced
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop().inspect(|_| {
            self.total_popped.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Drain up to `max_items`, oldest first
    pub fn drain(&self, max_items: usize) -> Vec<T> {
        let mut items = Vec::with_capacity(max_items.min(self.queue.len()));
        while items.len() < max_items {
            match self.pop() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            total_pushed: self.total_pushed.load(Ordering::Relaxed),
            total_popped: self.total_popped.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            peak_size: self.peak_size.load(Ordering::Relaxed),
            capacity: self.queue.capacity(),
        }
    }
}
