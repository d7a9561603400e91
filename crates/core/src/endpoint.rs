//! Transport endpoint abstraction and the signaling-facing factory.
//!
//! The endpoint itself (ICE, DTLS, SDP exchange) is supplied by the host
//! through an [`EndpointProvider`]. The core only creates it, registers the
//! outgoing track once the branch is linked, and feeds it RTP.

use std::fmt;
use std::sync::Arc;

use crate::codec::Codec;
use crate::error::Result;
use crate::pipeline::Pipeline;

/// Parameters an endpoint is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub client_id: String,
    /// STUN server URI, e.g. `stun://stun.l.google.com:19302`.
    pub stun_server: String,
}

/// Description of the outgoing video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDescription {
    pub codec: Codec,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub ssrc: u32,
    /// SDP media-level attributes from the packetizer.
    pub sdp_attributes: Vec<String>,
}

/// A per-client WebRTC transport.
pub trait TransportEndpoint: Send + Sync {
    fn client_id(&self) -> &str;

    /// Register the media the branch will send. Failure fails the final
    /// link of the branch.
    fn add_track(&self, track: &TrackDescription) -> Result<()>;

    fn remove_track(&self);

    /// Deliver one RTP packet.
    fn send_rtp(&self, packet: &[u8]) -> Result<()>;

    /// Release the transport. Called exactly once per endpoint.
    fn close(&self);
}

impl fmt::Debug for dyn TransportEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEndpoint")
            .field("client_id", &self.client_id())
            .finish()
    }
}

/// Creates transport endpoints on behalf of the core.
///
/// `create` runs inside a branch build. It may read the pipeline state but
/// must not build, tear down or deactivate through the same pipeline.
pub trait EndpointProvider: Send + Sync {
    fn create(&self, config: &EndpointConfig) -> Result<Arc<dyn TransportEndpoint>>;
}

/// Entry point for the signaling collaborator.
///
/// `build` is called when a peer connects, `teardown` when it goes away.
/// Failures are logged and reported as `None`; they never affect other
/// clients.
#[derive(Clone)]
pub struct TransportEndpointFactory {
    pipeline: Pipeline,
}

impl TransportEndpointFactory {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Build a branch for `client_id` and return its endpoint for
    /// offer/answer and ICE exchange.
    pub fn build(
        &self,
        client_id: &str,
        codec_preference: Option<&str>,
    ) -> Option<Arc<dyn TransportEndpoint>> {
        match self.pipeline.build_branch(client_id, codec_preference) {
            Ok(handle) => Some(handle.endpoint),
            Err(e) => {
                tracing::error!(client_id, error = %e, "endpoint creation failed");
                None
            }
        }
    }

    /// Tear down the client's branch, if any. Safe to call repeatedly.
    pub fn teardown(&self, client_id: &str) {
        self.pipeline.teardown_branch(client_id);
    }
}
