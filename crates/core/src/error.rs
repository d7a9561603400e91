//! Error types for the web sink core.

use std::fmt;

use crate::codec::Codec;

/// Errors that can occur while building branches or driving the pipeline.
///
/// Variants map to the failure classes of the fan-out stack:
///
/// - **Capability**: [`Capability`](Self::Capability): no encoder can
///   produce the requested (or fallback) codec.
/// - **Construction**: [`Link`](Self::Link) and [`Resource`](Self::Resource):
///   a branch could not be assembled; the build is rolled back.
/// - **Lifecycle**: [`Lifecycle`](Self::Lifecycle),
///   [`NotActive`](Self::NotActive): ancillary services or pipeline state.
/// - **Input**: [`UnsupportedFormat`](Self::UnsupportedFormat): the raw
///   producer feed cannot be reformatted.
/// - **Tuning**: [`Property`](Self::Property): never fatal, logged only.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No registered encoder produces the codec, even after the single
    /// fallback to the default codec.
    #[error("no encoder available for {requested}{}", fallback_suffix(.fallback))]
    Capability {
        requested: Codec,
        fallback: Option<Codec>,
    },

    /// A link in the per-client element chain could not be established.
    #[error("failed to link {step}: {reason}")]
    Link { step: LinkStep, reason: String },

    /// A tap, element instance, or transport endpoint could not be obtained.
    #[error("{what} unavailable: {reason}")]
    Resource { what: &'static str, reason: String },

    /// An ancillary service failed to start.
    #[error("service '{service}' failed: {reason}")]
    Lifecycle { service: String, reason: String },

    /// Branch builds are only accepted while the pipeline is `Active`.
    #[error("pipeline not active")]
    NotActive,

    /// The producer's raw layout cannot be converted for the encoders.
    #[error("unsupported raw format: {0}")]
    UnsupportedFormat(String),

    /// An element rejected a property during best-effort tuning.
    #[error("property '{name}' rejected: {reason}")]
    Property { name: String, reason: String },

    /// A configuration value is out of range or unknown.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn fallback_suffix(fallback: &Option<Codec>) -> String {
    match fallback {
        Some(codec) => format!(" (fallback {codec} also unavailable)"),
        None => String::new(),
    }
}

impl SinkError {
    pub(crate) fn link(step: LinkStep, reason: impl Into<String>) -> Self {
        Self::Link {
            step,
            reason: reason.into(),
        }
    }

    pub(crate) fn resource(what: &'static str, reason: impl Into<String>) -> Self {
        Self::Resource {
            what,
            reason: reason.into(),
        }
    }

    /// Rejection used by elements for property names they do not know.
    pub fn unknown_property(name: &str) -> Self {
        Self::Property {
            name: name.to_string(),
            reason: "no such property".to_string(),
        }
    }
}

/// The link of a branch chain, in construction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    /// Distribution tap → buffer stage.
    TapToQueue,
    /// Buffer stage → encoder (raw format negotiation).
    QueueToEncoder,
    /// Encoder → packetizer (codec agreement).
    EncoderToPacketizer,
    /// Packetizer → transport endpoint (track registration).
    PacketizerToEndpoint,
}

impl fmt::Display for LinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TapToQueue => write!(f, "tap to queue"),
            Self::QueueToEncoder => write!(f, "queue to encoder"),
            Self::EncoderToPacketizer => write!(f, "encoder to packetizer"),
            Self::PacketizerToEndpoint => write!(f, "packetizer to endpoint"),
        }
    }
}

/// Convenience alias for `Result<T, SinkError>`.
pub type Result<T> = std::result::Result<T, SinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_message_mentions_fallback() {
        let err = SinkError::Capability {
            requested: Codec::H264,
            fallback: Some(Codec::Vp8),
        };
        assert_eq!(
            err.to_string(),
            "no encoder available for h264 (fallback vp8 also unavailable)"
        );

        let err = SinkError::Capability {
            requested: Codec::Vp8,
            fallback: None,
        };
        assert_eq!(err.to_string(), "no encoder available for vp8");
    }

    #[test]
    fn link_message_names_step() {
        let err = SinkError::link(LinkStep::EncoderToPacketizer, "codec mismatch");
        assert_eq!(
            err.to_string(),
            "failed to link encoder to packetizer: codec mismatch"
        );
    }
}
