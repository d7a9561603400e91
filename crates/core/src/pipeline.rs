//! The fan-out pipeline: lifecycle, shared resources and the branch API.
//!
//! A [`Pipeline`] owns one [`DistributionStage`], the encoder registry,
//! the client table and every live branch. The producer calls
//! [`push_frame`](Pipeline::push_frame) from its own thread; the signaling
//! collaborator builds and tears down branches through
//! [`endpoint_factory`](Pipeline::endpoint_factory); the host drives
//! [`activate`](Pipeline::activate) / [`deactivate`](Pipeline::deactivate).
//!
//! Branch builds hold the lifecycle lock for reading for their whole
//! duration, so deactivation waits for in-flight builds and then tears
//! everything down before returning. [`Pipeline::state`] reads the lock
//! recursively, so collaborators called during a build may query it even
//! while a deactivation is queued.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::branch::{BranchArena, BranchBuilder, BranchHandle, BranchStats};
use crate::clients::ClientCodecTable;
use crate::codec::Codec;
use crate::distribution::{DistributionStage, DistributionStats};
use crate::endpoint::{EndpointProvider, TransportEndpointFactory};
use crate::error::{Result, SinkError};
use crate::lifecycle::{self, Effect, LifecycleEvent, PipelineState};
use crate::media::{VideoFormat, VideoFrame};
use crate::registry::{CapabilityRegistry, EncoderProvider};
use crate::service::AncillaryService;

/// Pipeline configuration.
///
/// Read-only once the pipeline is built, except the default codec which
/// can be changed through [`Pipeline::set_default_codec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Address the ancillary services bind to.
    pub bind_address: String,
    /// Page delivery port. `0` picks an ephemeral port.
    pub http_port: u16,
    /// Signaling port. `0` picks an ephemeral port.
    pub ws_port: u16,
    /// STUN server handed to every transport endpoint.
    pub stun_server: String,
    /// Default codec name for clients without a usable preference.
    pub video_codec: String,
    /// Buffers held per branch before the oldest is dropped.
    pub queue_capacity: usize,
    /// Maximum simultaneous branches. `None` means unbounded.
    pub max_clients: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
            ws_port: 8081,
            stun_server: "stun://stun.l.google.com:19302".to_string(),
            video_codec: "vp8".to_string(),
            queue_capacity: 200,
            max_clients: None,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if Codec::from_name(&self.video_codec).is_none() {
            return Err(SinkError::InvalidConfig(format!(
                "unknown video codec '{}'",
                self.video_codec
            )));
        }
        if self.http_port != 0 && self.http_port == self.ws_port {
            return Err(SinkError::InvalidConfig(format!(
                "http and signaling ports are both {}",
                self.http_port
            )));
        }
        if self.queue_capacity == 0 {
            return Err(SinkError::InvalidConfig(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.max_clients == Some(0) {
            return Err(SinkError::InvalidConfig(
                "max clients must be at least 1".to_string(),
            ));
        }
        if self.bind_address.trim().is_empty() {
            return Err(SinkError::InvalidConfig("empty bind address".to_string()));
        }
        Ok(())
    }

    /// The default codec, already validated.
    fn default_codec(&self) -> Result<Codec> {
        Codec::from_name(&self.video_codec)
            .ok_or_else(|| SinkError::InvalidConfig(format!("unknown video codec '{}'", self.video_codec)))
    }
}

/// Assembles a [`Pipeline`].
pub struct PipelineBuilder {
    settings: Settings,
    input: Option<VideoFormat>,
    encoders: Vec<EncoderProvider>,
    endpoints: Option<Arc<dyn EndpointProvider>>,
    services: Vec<Box<dyn AncillaryService>>,
}

impl PipelineBuilder {
    fn new() -> Self {
        Self {
            settings: Settings::default(),
            input: None,
            encoders: Vec::new(),
            endpoints: None,
            services: Vec::new(),
        }
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Format of the producer's raw feed.
    pub fn input(mut self, format: VideoFormat) -> Self {
        self.input = Some(format);
        self
    }

    /// Register an encoder implementation. Registration order breaks rank
    /// ties.
    pub fn encoder(mut self, provider: EncoderProvider) -> Self {
        self.encoders.push(provider);
        self
    }

    pub fn encoders(mut self, providers: impl IntoIterator<Item = EncoderProvider>) -> Self {
        self.encoders.extend(providers);
        self
    }

    pub fn endpoint_provider(mut self, provider: Arc<dyn EndpointProvider>) -> Self {
        self.endpoints = Some(provider);
        self
    }

    /// Add a service started on activation (in order) and stopped on
    /// deactivation (in reverse).
    pub fn service(mut self, service: Box<dyn AncillaryService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.settings.validate()?;
        let default_codec = self.settings.default_codec()?;
        let input = self
            .input
            .ok_or_else(|| SinkError::InvalidConfig("input format not set".to_string()))?;
        let endpoints = self
            .endpoints
            .ok_or_else(|| SinkError::InvalidConfig("no endpoint provider".to_string()))?;

        let stage = DistributionStage::new(input)?.with_max_taps(self.settings.max_clients);
        let registry = CapabilityRegistry::new(self.encoders);

        tracing::info!(
            input = %input,
            encoders = registry.len(),
            services = self.services.len(),
            default_codec = %default_codec,
            "pipeline built"
        );

        Ok(Pipeline {
            inner: Arc::new(Inner {
                settings: self.settings,
                default_codec: RwLock::new(default_codec),
                registry,
                stage,
                clients: ClientCodecTable::new(),
                endpoints,
                arena: BranchArena::default(),
                state: RwLock::new(PipelineState::Idle),
                services: Mutex::new(self.services),
            }),
        })
    }
}

struct Inner {
    settings: Settings,
    default_codec: RwLock<Codec>,
    registry: CapabilityRegistry,
    stage: DistributionStage,
    clients: ClientCodecTable,
    endpoints: Arc<dyn EndpointProvider>,
    arena: BranchArena,
    state: RwLock<PipelineState>,
    services: Mutex<Vec<Box<dyn AncillaryService>>>,
}

/// Shared handle to the pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn state(&self) -> PipelineState {
        *self.inner.state.read_recursive()
    }

    /// A handle that does not keep the pipeline alive. Hand this to
    /// services and callbacks the pipeline itself owns.
    pub fn downgrade(&self) -> WeakPipeline {
        WeakPipeline {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Start ancillary services and begin accepting branch builds.
    ///
    /// No-op while already `Starting` or `Active`. If a service fails to
    /// start, those already started are stopped in reverse order, the
    /// pipeline returns to `Idle` and the error is returned; a later call
    /// may retry.
    pub fn activate(&self) -> Result<()> {
        let mut state = self.inner.state.write();
        let Some(step) = lifecycle::transition(*state, LifecycleEvent::Activate) else {
            tracing::debug!(state = %*state, "activate ignored");
            return Ok(());
        };
        *state = step.next;
        tracing::info!(state = %*state, "pipeline activating");

        let mut result = Ok(());
        for effect in &step.effects {
            if *effect == Effect::StartServices {
                result = self.start_services();
            }
        }

        let event = match result {
            Ok(()) => LifecycleEvent::ServicesReady,
            Err(_) => LifecycleEvent::ServicesFailed,
        };
        if let Some(step) = lifecycle::transition(*state, event) {
            *state = step.next;
        }

        match &result {
            Ok(()) => tracing::info!(state = %*state, "pipeline active"),
            Err(e) => tracing::error!(state = %*state, error = %e, "pipeline activation failed"),
        }
        result
    }

    fn start_services(&self) -> Result<()> {
        let mut services = self.inner.services.lock();
        for idx in 0..services.len() {
            if let Err(e) = services[idx].start(&self.inner.settings) {
                for started in services[..idx].iter_mut().rev() {
                    started.stop();
                }
                return Err(match e {
                    SinkError::Lifecycle { .. } => e,
                    other => SinkError::Lifecycle {
                        service: services[idx].name().to_string(),
                        reason: other.to_string(),
                    },
                });
            }
            tracing::debug!(service = services[idx].name(), "service started");
        }
        Ok(())
    }

    fn stop_services(&self) {
        let mut services = self.inner.services.lock();
        for service in services.iter_mut().rev() {
            service.stop();
            tracing::debug!(service = service.name(), "service stopped");
        }
    }

    /// Stop services and tear down every branch, then return to `Idle`.
    ///
    /// Waits for in-flight builds. No-op while `Idle` or `Stopping`.
    pub fn deactivate(&self) {
        let mut state = self.inner.state.write();
        let Some(step) = lifecycle::transition(*state, LifecycleEvent::Deactivate) else {
            tracing::debug!(state = %*state, "deactivate ignored");
            return;
        };
        *state = step.next;
        tracing::info!(state = %*state, "pipeline deactivating");

        for effect in &step.effects {
            match effect {
                Effect::StopServices => self.stop_services(),
                Effect::TeardownBranches => {
                    let removed = self
                        .inner
                        .arena
                        .teardown_all(&self.inner.stage, &self.inner.clients);
                    tracing::debug!(branches = removed, "branches torn down");
                }
                Effect::StartServices => {}
            }
        }

        if let Some(step) = lifecycle::transition(*state, LifecycleEvent::ServicesStopped) {
            *state = step.next;
        }
        tracing::info!(state = %*state, "pipeline idle");
    }

    /// Build (or rebuild) the branch for `client_id`.
    ///
    /// `codec_preference` is matched against the codec table; unknown names
    /// count as no preference. An existing branch for the client is torn
    /// down first.
    pub fn build_branch(&self, client_id: &str, codec_preference: Option<&str>) -> Result<BranchHandle> {
        let state = self.inner.state.read();
        if *state != PipelineState::Active {
            tracing::warn!(client_id, state = %*state, "branch build rejected");
            return Err(SinkError::NotActive);
        }

        let preference = codec_preference.and_then(|name| {
            let codec = Codec::from_name(name);
            if codec.is_none() {
                tracing::warn!(client_id, codec = name, "unknown codec preference ignored");
            }
            codec
        });

        let inner = &*self.inner;
        let builder = BranchBuilder {
            stage: &inner.stage,
            clients: &inner.clients,
            registry: &inner.registry,
            endpoints: inner.endpoints.as_ref(),
            stun_server: &inner.settings.stun_server,
            queue_capacity: inner.settings.queue_capacity,
            default_codec: self.default_codec(),
        };

        let result = inner
            .arena
            .with_slot(client_id, true, |slot| {
                if let Some(old) = slot.take() {
                    tracing::info!(client_id, "replacing existing branch");
                    old.teardown(&inner.stage, &inner.clients);
                }
                let branch = builder.build(client_id, preference)?;
                let handle = branch.handle();
                *slot = Some(branch);
                Ok(handle)
            })
            .unwrap_or_else(|| Err(SinkError::resource("branch slot", "client slot unavailable")));

        if let Err(e) = &result {
            tracing::error!(client_id, error = %e, "branch build failed");
        }
        drop(state);
        result
    }

    /// Tear down the client's branch. Returns `false` if it had none.
    pub fn teardown_branch(&self, client_id: &str) -> bool {
        let removed = self
            .inner
            .arena
            .teardown(client_id, &self.inner.stage, &self.inner.clients);
        if !removed {
            tracing::debug!(client_id, "no branch to tear down");
        }
        removed
    }

    /// Feed one raw frame from the producer. Returns the number of
    /// branches it was delivered to.
    pub fn push_frame(&self, frame: VideoFrame) -> usize {
        self.inner.stage.push(frame)
    }

    pub fn default_codec(&self) -> Codec {
        *self.inner.default_codec.read()
    }

    /// Change the default codec for subsequently built branches.
    pub fn set_default_codec(&self, name: &str) -> Result<Codec> {
        let codec = Codec::from_name(name)
            .ok_or_else(|| SinkError::InvalidConfig(format!("unknown video codec '{name}'")))?;
        let previous = std::mem::replace(&mut *self.inner.default_codec.write(), codec);
        if previous != codec {
            tracing::info!(from = %previous, to = %codec, "default codec changed");
        }
        Ok(codec)
    }

    pub fn endpoint_factory(&self) -> TransportEndpointFactory {
        TransportEndpointFactory::new(self.clone())
    }

    pub fn input_format(&self) -> VideoFormat {
        self.inner.stage.input_format()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    pub fn clients(&self) -> &ClientCodecTable {
        &self.inner.clients
    }

    pub fn client_codec(&self, client_id: &str) -> Option<Codec> {
        self.inner.clients.get(client_id)
    }

    pub fn tap_count(&self) -> usize {
        self.inner.stage.tap_count()
    }

    /// Branches currently live. Clients with a build in flight are not
    /// counted.
    pub fn live_branches(&self) -> usize {
        self.inner.arena.len()
    }

    pub fn branch_clients(&self) -> Vec<String> {
        self.inner.arena.client_ids()
    }

    /// Counters of the client's branch. Waits for an in-flight build of
    /// the same client.
    pub fn branch_stats(&self, client_id: &str) -> Option<BranchStats> {
        self.inner
            .arena
            .with_slot(client_id, false, |slot| slot.as_ref().map(|b| b.stats()))
            .flatten()
    }

    pub fn distribution_stats(&self) -> DistributionStats {
        self.inner.stage.stats()
    }
}

/// Non-owning handle from [`Pipeline::downgrade`].
#[derive(Clone)]
pub struct WeakPipeline {
    inner: Weak<Inner>,
}

impl WeakPipeline {
    /// The pipeline, if it is still alive.
    pub fn upgrade(&self) -> Option<Pipeline> {
        self.inner.upgrade().map(|inner| Pipeline { inner })
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("branches", &self.live_branches())
            .field("taps", &self.tap_count())
            .finish()
    }
}
