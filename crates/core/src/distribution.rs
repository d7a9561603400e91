//! The shared conversion and fan-out point every branch attaches to.
//!
//! ```text
//!                           ┌── tap 1 ──► LeakyQueue (branch A)
//! producer ──► to_i420 ──► ├── tap 2 ──► LeakyQueue (branch B)
//!                           └── tap 3     (acquired, not yet linked)
//! ```
//!
//! Frames are converted once and shared between taps behind an `Arc`.
//! Pushing into a tap never blocks since every branch queue drops its
//! oldest entry when full, and an acquired tap with no consumer is simply
//! skipped. The tap table lock is held only to snapshot the linked queues
//! or to insert/remove an entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::convert;
use crate::error::{LinkStep, Result, SinkError};
use crate::media::{PixelLayout, VideoFormat, VideoFrame};
use crate::queue::LeakyQueue;

/// Queue type a tap delivers into.
pub type FrameQueue = LeakyQueue<Arc<VideoFrame>>;

/// Opaque handle to one output of the distribution stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapId(u64);

impl fmt::Display for TapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tap{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_rejected: AtomicU64,
    deliveries: AtomicU64,
}

/// Snapshot of the stage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DistributionStats {
    pub frames_in: u64,
    /// Frames dropped because their size did not match the input format.
    pub frames_rejected: u64,
    /// Sum over frames of the number of taps each frame was delivered to.
    pub deliveries: u64,
}

pub struct DistributionStage {
    input: VideoFormat,
    output: VideoFormat,
    taps: RwLock<HashMap<TapId, Option<Arc<FrameQueue>>>>,
    next_id: AtomicU64,
    max_taps: Option<usize>,
    counters: Counters,
}

impl DistributionStage {
    /// Create a stage converting `input` into I420.
    pub fn new(input: VideoFormat) -> Result<Self> {
        input.validate()?;
        let output = input.with_layout(PixelLayout::I420);
        tracing::debug!(%input, %output, "distribution stage created");
        Ok(Self {
            input,
            output,
            taps: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_taps: None,
            counters: Counters::default(),
        })
    }

    /// Limit the number of simultaneously acquired taps.
    pub fn with_max_taps(mut self, max: Option<usize>) -> Self {
        self.max_taps = max;
        self
    }

    pub fn input_format(&self) -> VideoFormat {
        self.input
    }

    /// Format delivered to every tap.
    pub fn output_format(&self) -> VideoFormat {
        self.output
    }

    /// Reserve a new output. The tap is unconnected until
    /// [`link_tap`](Self::link_tap) is called.
    pub fn acquire_tap(&self) -> Result<TapId> {
        let mut taps = self.taps.write();
        if let Some(max) = self.max_taps
            && taps.len() >= max
        {
            return Err(SinkError::resource(
                "distribution tap",
                format!("limit of {max} taps reached"),
            ));
        }
        let id = TapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        taps.insert(id, None);
        tracing::debug!(tap = %id, taps = taps.len(), "tap acquired");
        Ok(id)
    }

    /// Connect `queue` to an acquired, unconnected tap.
    pub fn link_tap(&self, id: TapId, queue: Arc<FrameQueue>) -> Result<()> {
        let mut taps = self.taps.write();
        match taps.get_mut(&id) {
            Some(slot) if slot.is_none() => {
                *slot = Some(queue);
                tracing::debug!(tap = %id, "tap linked");
                Ok(())
            }
            Some(_) => Err(SinkError::link(
                LinkStep::TapToQueue,
                format!("{id} is already linked"),
            )),
            None => Err(SinkError::link(
                LinkStep::TapToQueue,
                format!("{id} is not acquired"),
            )),
        }
    }

    /// Disconnect a tap's consumer. Returns `true` if it was linked.
    pub fn unlink_tap(&self, id: TapId) -> bool {
        let mut taps = self.taps.write();
        match taps.get_mut(&id) {
            Some(slot) => {
                let was_linked = slot.take().is_some();
                if was_linked {
                    tracing::debug!(tap = %id, "tap unlinked");
                }
                was_linked
            }
            None => false,
        }
    }

    /// Release a tap. Returns `false` if it was not held.
    pub fn release_tap(&self, id: TapId) -> bool {
        let mut taps = self.taps.write();
        let released = taps.remove(&id).is_some();
        if released {
            tracing::debug!(tap = %id, taps = taps.len(), "tap released");
        }
        released
    }

    /// Number of acquired taps, linked or not.
    pub fn tap_count(&self) -> usize {
        self.taps.read().len()
    }

    pub fn linked_count(&self) -> usize {
        self.taps.read().values().filter(|q| q.is_some()).count()
    }

    /// Convert one producer frame and hand it to every linked tap.
    ///
    /// Returns the number of taps the frame was delivered to. A frame that
    /// does not match the input format is dropped with a warning.
    pub fn push(&self, frame: VideoFrame) -> usize {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);

        let sinks: Vec<Arc<FrameQueue>> = self.taps.read().values().flatten().cloned().collect();

        let expected = self.input.frame_size();
        if frame.data.len() != expected {
            self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                got = frame.data.len(),
                expected,
                format = %self.input,
                "dropping frame with unexpected size"
            );
            return 0;
        }
        if sinks.is_empty() {
            return 0;
        }

        let frame = if self.input.layout == PixelLayout::I420 {
            frame
        } else {
            match convert::to_i420(self.input.layout, self.input.width, self.input.height, &frame.data) {
                Ok(data) => VideoFrame { data, ..frame },
                Err(e) => {
                    self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "dropping frame");
                    return 0;
                }
            }
        };

        let frame = Arc::new(frame);
        let mut delivered = 0;
        for sink in &sinks {
            if sink.push(Arc::clone(&frame)) {
                delivered += 1;
            }
        }
        self.counters
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        tracing::trace!(delivered, "frame distributed");
        delivered
    }

    pub fn stats(&self) -> DistributionStats {
        DistributionStats {
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_rejected: self.counters.frames_rejected.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for DistributionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionStage")
            .field("input", &self.input)
            .field("taps", &self.tap_count())
            .finish()
    }
}
