//! Per-client WebRTC fan-out of one live raw video feed.
//!
//! ```text
//! producer ──► DistributionStage ──┬──► branch(a): queue ► encoder ► packetizer ► endpoint
//!                                  ├──► branch(b): ...
//!                                  └──► ...
//! ```
//!
//! Each connecting client gets its own branch with the codec it asked for
//! (or the default), built and torn down at runtime without disturbing
//! the others. See [`Pipeline`] for the entry points.

pub mod branch;
pub mod clients;
pub mod codec;
pub mod convert;
pub mod distribution;
pub mod endpoint;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod service;
pub mod testing;
pub mod tuning;

pub use branch::{BranchHandle, BranchStats};
pub use clients::{ClientCodecTable, ClientRecord};
pub use codec::{Codec, CodecDescriptor};
pub use distribution::{DistributionStage, DistributionStats, TapId};
pub use endpoint::{
    EndpointConfig, EndpointProvider, TrackDescription, TransportEndpoint, TransportEndpointFactory,
};
pub use error::{LinkStep, Result, SinkError};
pub use lifecycle::PipelineState;
pub use media::{EncodedFrame, Encoder, Packetizer, PixelLayout, VideoFormat, VideoFrame};
pub use pipeline::{Pipeline, PipelineBuilder, Settings, WeakPipeline};
pub use registry::{CapabilityRegistry, EncoderFactory, EncoderProvider, EncoderSelection};
pub use service::{AncillaryService, ConnectionHandler, ServicePort, TcpService};
