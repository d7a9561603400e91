//! Per-client branch construction, teardown and bookkeeping.
//!
//! A branch is the chain feeding one peer:
//!
//! ```text
//! tap ──► LeakyQueue ──► Encoder ──► Packetizer ──► TransportEndpoint
//!                     └──────── worker thread ────────┘
//! ```
//!
//! [`BranchBuilder::build`] either returns a fully linked, running branch
//! or leaves nothing behind: every resource acquired along the way is
//! recorded in a [`Rollback`] guard that undoes it on any early return.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::clients::ClientCodecTable;
use crate::codec::Codec;
use crate::distribution::{DistributionStage, FrameQueue, TapId};
use crate::endpoint::{EndpointConfig, EndpointProvider, TrackDescription, TransportEndpoint};
use crate::error::{LinkStep, Result, SinkError};
use crate::media::{self, Encoder, Packetizer, PacketizerKind, VideoFormat, VideoFrame};
use crate::queue::Pop;
use crate::registry::{CapabilityRegistry, EncoderSelection};
use crate::tuning;

/// How long the worker waits on its queue before re-checking for shutdown.
const WORKER_POLL: Duration = Duration::from_millis(100);

/// Public view of a live branch.
#[derive(Debug, Clone)]
pub struct BranchHandle {
    pub client_id: String,
    pub codec: Codec,
    pub encoder_id: String,
    pub packetizer: PacketizerKind,
    pub tap: TapId,
    pub endpoint: Arc<dyn TransportEndpoint>,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_encoded: AtomicU64,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
    encode_errors: AtomicU64,
}

/// Counters of one branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchStats {
    pub frames_in: u64,
    /// Frames discarded by the drop-oldest queue.
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub encode_errors: u64,
}

/// A linked, running branch. Owned by the [`BranchArena`].
pub(crate) struct Branch {
    client_id: String,
    codec: Codec,
    encoder_id: String,
    packetizer: PacketizerKind,
    tap: TapId,
    queue: Arc<FrameQueue>,
    endpoint: Arc<dyn TransportEndpoint>,
    counters: Arc<Counters>,
    worker: Option<JoinHandle<()>>,
}

impl Branch {
    pub(crate) fn handle(&self) -> BranchHandle {
        BranchHandle {
            client_id: self.client_id.clone(),
            codec: self.codec,
            encoder_id: self.encoder_id.clone(),
            packetizer: self.packetizer,
            tap: self.tap,
            endpoint: Arc::clone(&self.endpoint),
        }
    }

    pub(crate) fn stats(&self) -> BranchStats {
        let c = &self.counters;
        BranchStats {
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_dropped: self.queue.stats().dropped,
            frames_encoded: c.frames_encoded.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            encode_errors: c.encode_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker, unlink in reverse construction order, release the
    /// tap and drop the client's table entry.
    pub(crate) fn teardown(mut self, stage: &DistributionStage, clients: &ClientCodecTable) {
        self.queue.close();
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::warn!(client_id = %self.client_id, "branch worker panicked");
        }
        self.endpoint.remove_track();
        stage.unlink_tap(self.tap);
        stage.release_tap(self.tap);
        self.endpoint.close();
        clients.remove(&self.client_id);

        let stats = self.stats();
        tracing::info!(
            client_id = %self.client_id,
            codec = %self.codec,
            tap = %self.tap,
            frames = stats.frames_in,
            dropped = stats.frames_dropped,
            packets = stats.packets_sent,
            "branch torn down"
        );
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("client_id", &self.client_id)
            .field("codec", &self.codec)
            .field("encoder_id", &self.encoder_id)
            .field("tap", &self.tap)
            .finish()
    }
}

/// Something to undo if the build does not complete.
enum Undo {
    CodecEntry,
    Endpoint(Arc<dyn TransportEndpoint>),
    Tap(TapId),
    TapLink(TapId),
    Track(Arc<dyn TransportEndpoint>),
}

/// Records completed build steps and reverts them on drop unless
/// committed. Running elements are stopped first, then the remaining
/// steps are undone in reverse order.
struct Rollback<'a> {
    client_id: &'a str,
    stage: &'a DistributionStage,
    clients: &'a ClientCodecTable,
    queues: Vec<Arc<FrameQueue>>,
    steps: Vec<Undo>,
    committed: bool,
}

impl<'a> Rollback<'a> {
    fn new(client_id: &'a str, stage: &'a DistributionStage, clients: &'a ClientCodecTable) -> Self {
        Self {
            client_id,
            stage,
            clients,
            queues: Vec::new(),
            steps: Vec::new(),
            committed: false,
        }
    }

    fn push(&mut self, undo: Undo) {
        self.steps.push(undo);
    }

    fn stop_on_failure(&mut self, queue: Arc<FrameQueue>) {
        self.queues.push(queue);
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        tracing::debug!(client_id = self.client_id, steps = self.steps.len(), "rolling back branch");
        for queue in self.queues.drain(..) {
            queue.close();
        }
        while let Some(step) = self.steps.pop() {
            match step {
                Undo::Track(endpoint) => endpoint.remove_track(),
                Undo::TapLink(tap) => {
                    self.stage.unlink_tap(tap);
                }
                Undo::Tap(tap) => {
                    self.stage.release_tap(tap);
                }
                Undo::Endpoint(endpoint) => endpoint.close(),
                Undo::CodecEntry => {
                    self.clients.remove(self.client_id);
                }
            }
        }
    }
}

/// Builds branches against the shared pipeline resources.
pub(crate) struct BranchBuilder<'a> {
    pub stage: &'a DistributionStage,
    pub clients: &'a ClientCodecTable,
    pub registry: &'a CapabilityRegistry,
    pub endpoints: &'a dyn EndpointProvider,
    pub stun_server: &'a str,
    pub queue_capacity: usize,
    pub default_codec: Codec,
}

impl BranchBuilder<'_> {
    /// Construct, link and start the branch for `client_id`.
    ///
    /// `preference` is the client's codec, `None` meaning the default.
    pub(crate) fn build(&self, client_id: &str, preference: Option<Codec>) -> Result<Branch> {
        let mut rollback = Rollback::new(client_id, self.stage, self.clients);

        // 1. Effective codec.
        let requested = preference.unwrap_or(self.default_codec);
        self.clients.set(client_id, requested);
        rollback.push(Undo::CodecEntry);

        // 2. Encoder and packetizer.
        let selection = self.resolve(client_id, requested)?;
        let codec = selection.codec;
        let descriptor = codec.descriptor();

        // 3. Instantiate.
        let endpoint = self
            .endpoints
            .create(&EndpointConfig {
                client_id: client_id.to_string(),
                stun_server: self.stun_server.to_string(),
            })
            .map_err(|e| SinkError::resource("transport endpoint", e.to_string()))?;
        rollback.push(Undo::Endpoint(Arc::clone(&endpoint)));

        let queue = Arc::new(FrameQueue::new(self.queue_capacity));
        rollback.stop_on_failure(Arc::clone(&queue));

        let mut encoder = selection
            .create_encoder()
            .map_err(|e| SinkError::resource("encoder", format!("{}: {e}", selection.encoder_id)))?;
        let mut packetizer = selection.packetizer.create(descriptor.payload_type);

        // 4. Tap.
        let tap = self.stage.acquire_tap()?;
        rollback.push(Undo::Tap(tap));

        // 5. Link.
        self.stage.link_tap(tap, Arc::clone(&queue))?;
        rollback.push(Undo::TapLink(tap));

        let format = self.stage.output_format();
        encoder
            .configure(&format)
            .map_err(|e| SinkError::link(LinkStep::QueueToEncoder, e.to_string()))?;

        if encoder.codec() != packetizer.codec() {
            return Err(SinkError::link(
                LinkStep::EncoderToPacketizer,
                format!(
                    "{} produces {}, {} expects {}",
                    encoder.id(),
                    encoder.codec(),
                    selection.packetizer.id(),
                    packetizer.codec()
                ),
            ));
        }

        let track = TrackDescription {
            codec,
            payload_type: packetizer.payload_type(),
            clock_rate: packetizer.clock_rate(),
            ssrc: packetizer.ssrc(),
            sdp_attributes: packetizer.sdp_attributes(),
        };
        endpoint
            .add_track(&track)
            .map_err(|e| SinkError::link(LinkStep::PacketizerToEndpoint, e.to_string()))?;
        rollback.push(Undo::Track(Arc::clone(&endpoint)));

        // 7. Best effort.
        let steps = tuning::plan(codec, &selection.encoder_id);
        let report = tuning::apply(client_id, &steps, encoder.as_mut(), packetizer.as_mut());

        // 8. Start processing.
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            client_id: client_id.to_string(),
            queue: Arc::clone(&queue),
            encoder,
            packetizer,
            endpoint: Arc::clone(&endpoint),
            counters: Arc::clone(&counters),
            format,
        };
        let worker = thread::Builder::new()
            .name(format!("branch-{client_id}"))
            .spawn(move || worker.run())
            .map_err(|e| SinkError::resource("branch worker", e.to_string()))?;

        rollback.commit();
        self.clients.attach_branch(client_id, tap);

        tracing::info!(
            client_id,
            codec = %codec,
            encoder = %selection.encoder_id,
            packetizer = selection.packetizer.id(),
            tap = %tap,
            tuned = report.applied,
            tuning_failed = report.failed,
            "branch linked"
        );

        Ok(Branch {
            client_id: client_id.to_string(),
            codec,
            encoder_id: selection.encoder_id,
            packetizer: selection.packetizer,
            tap,
            queue,
            endpoint,
            counters,
            worker: Some(worker),
        })
    }

    /// Select an encoder for `requested`, falling back to the default codec
    /// once.
    fn resolve(&self, client_id: &str, requested: Codec) -> Result<EncoderSelection> {
        if let Some(selection) = self.registry.select_encoder(requested.descriptor()) {
            return Ok(selection);
        }
        if requested == self.default_codec {
            return Err(SinkError::Capability {
                requested,
                fallback: None,
            });
        }

        tracing::warn!(
            client_id,
            requested = %requested,
            fallback = %self.default_codec,
            "no encoder for requested codec, falling back to default"
        );
        match self.registry.select_encoder(self.default_codec.descriptor()) {
            Some(selection) => {
                self.clients.set(client_id, self.default_codec);
                Ok(selection)
            }
            None => Err(SinkError::Capability {
                requested,
                fallback: Some(self.default_codec),
            }),
        }
    }
}

/// Encode/packetize/send loop of one branch.
struct Worker {
    client_id: String,
    queue: Arc<FrameQueue>,
    encoder: Box<dyn Encoder>,
    packetizer: Box<dyn Packetizer>,
    endpoint: Arc<dyn TransportEndpoint>,
    counters: Arc<Counters>,
    format: VideoFormat,
}

impl Worker {
    fn run(mut self) {
        tracing::debug!(client_id = %self.client_id, "branch worker started");
        loop {
            match self.queue.pop_timeout(WORKER_POLL) {
                Pop::Item(frame) => self.process(&frame),
                Pop::Timeout => continue,
                Pop::Closed => break,
            }
        }
        tracing::debug!(client_id = %self.client_id, "branch worker exited");
    }

    fn process(&mut self, frame: &VideoFrame) {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);

        let encoded = match self.encoder.encode(frame) {
            Ok(Some(encoded)) => encoded,
            Ok(None) => return,
            Err(e) => {
                let n = self.counters.encode_errors.fetch_add(1, Ordering::Relaxed);
                if n == 0 {
                    tracing::warn!(client_id = %self.client_id, error = %e, "encode failed");
                } else {
                    tracing::debug!(client_id = %self.client_id, error = %e, "encode failed");
                }
                return;
            }
        };
        self.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);

        let increment = encoded
            .duration
            .or(frame.duration)
            .map(media::duration_to_rtp)
            .unwrap_or_else(|| self.format.rtp_increment());
        let packets = self.packetizer.packetize(&encoded.data, increment);

        tracing::trace!(
            client_id = %self.client_id,
            bytes = encoded.data.len(),
            keyframe = encoded.keyframe,
            packets = packets.len(),
            "data flowing through packetizer"
        );

        for packet in &packets {
            match self.endpoint.send_rtp(packet) {
                Ok(()) => {
                    self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let n = self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    if n == 0 {
                        tracing::warn!(client_id = %self.client_id, error = %e, "RTP send failed");
                    }
                }
            }
        }
    }
}

type Slot = Arc<Mutex<Option<Branch>>>;

fn is_live(slot: &Slot) -> bool {
    slot.try_lock().is_some_and(|branch| branch.is_some())
}

/// Live branches indexed by client id.
///
/// Each client has its own slot lock, so a teardown racing an in-flight
/// build for the same client waits for the build to finish, while
/// different clients never contend beyond the brief map lookup. Lock order
/// is slot, then map.
#[derive(Default)]
pub(crate) struct BranchArena {
    slots: Mutex<HashMap<String, Slot>>,
}

impl BranchArena {
    /// Run `f` with exclusive access to the client's slot.
    ///
    /// With `create` a missing slot is inserted; otherwise `None` is
    /// returned for unknown clients. Slots left empty are removed.
    pub(crate) fn with_slot<R>(
        &self,
        client_id: &str,
        create: bool,
        f: impl FnOnce(&mut Option<Branch>) -> R,
    ) -> Option<R> {
        loop {
            let slot = {
                let mut slots = self.slots.lock();
                match slots.get(client_id) {
                    Some(slot) => Arc::clone(slot),
                    None if create => {
                        let slot: Slot = Arc::new(Mutex::new(None));
                        slots.insert(client_id.to_string(), Arc::clone(&slot));
                        slot
                    }
                    None => return None,
                }
            };

            let mut branch = slot.lock();
            let retired = !self
                .slots
                .lock()
                .get(client_id)
                .is_some_and(|s| Arc::ptr_eq(s, &slot));
            if retired {
                continue;
            }

            let result = f(&mut branch);

            if branch.is_none() {
                let mut slots = self.slots.lock();
                if slots.get(client_id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(client_id);
                }
            }
            return Some(result);
        }
    }

    fn snapshot(&self) -> Vec<(String, Slot)> {
        self.slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Clients with a live branch. Slots locked by an in-flight build or
    /// teardown are skipped rather than waited on.
    pub(crate) fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, slot)| is_live(slot))
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of live branches, without waiting on busy slots.
    pub(crate) fn len(&self) -> usize {
        self.snapshot().iter().filter(|(_, slot)| is_live(slot)).count()
    }

    /// Tear down the client's branch. Returns `false` if there was none.
    pub(crate) fn teardown(
        &self,
        client_id: &str,
        stage: &DistributionStage,
        clients: &ClientCodecTable,
    ) -> bool {
        self.with_slot(client_id, false, |slot| match slot.take() {
            Some(branch) => {
                branch.teardown(stage, clients);
                true
            }
            None => false,
        })
        .unwrap_or(false)
    }

    /// Tear down every branch. Returns the number removed.
    pub(crate) fn teardown_all(&self, stage: &DistributionStage, clients: &ClientCodecTable) -> usize {
        self.snapshot()
            .into_iter()
            .filter(|(id, _)| self.teardown(id, stage, clients))
            .count()
    }
}
