//! Encoder discovery and rank-based selection.
//!
//! Providers are registered once when the pipeline is built. The registry
//! indexes them per codec up front so selection is a read-only lookup that
//! any number of concurrent branch builds can perform without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::codec::{Codec, CodecDescriptor, codec_for_media_type};
use crate::error::Result;
use crate::media::{Encoder, PacketizerKind};

/// Constructor for encoder instances of one implementation.
pub trait EncoderFactory: Send + Sync {
    fn create(&self, codec: Codec) -> Result<Box<dyn Encoder>>;
}

impl<F> EncoderFactory for F
where
    F: Fn(Codec) -> Result<Box<dyn Encoder>> + Send + Sync,
{
    fn create(&self, codec: Codec) -> Result<Box<dyn Encoder>> {
        self(codec)
    }
}

/// One locally available encoder implementation.
#[derive(Clone)]
pub struct EncoderProvider {
    id: String,
    /// Media types the implementation can produce (`"video/x-h264"`, ...).
    outputs: Vec<String>,
    rank: u32,
    factory: Arc<dyn EncoderFactory>,
}

impl EncoderProvider {
    pub fn new(
        id: impl Into<String>,
        outputs: Vec<String>,
        rank: u32,
        factory: Arc<dyn EncoderFactory>,
    ) -> Self {
        Self {
            id: id.into(),
            outputs,
            rank,
            factory,
        }
    }

    /// Provider declaring the target media types of `codecs`.
    pub fn for_codecs(
        id: impl Into<String>,
        codecs: &[Codec],
        rank: u32,
        factory: Arc<dyn EncoderFactory>,
    ) -> Self {
        let outputs = codecs.iter().map(|c| c.media_type().to_string()).collect();
        Self::new(id, outputs, rank, factory)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn can_produce(&self, codec: Codec) -> bool {
        self.outputs.iter().any(|o| o == codec.media_type())
    }

    pub fn create(&self, codec: Codec) -> Result<Box<dyn Encoder>> {
        self.factory.create(codec)
    }
}

impl fmt::Debug for EncoderProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncoderProvider")
            .field("id", &self.id)
            .field("outputs", &self.outputs)
            .field("rank", &self.rank)
            .finish()
    }
}

/// A provider that matched a codec query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCandidate {
    pub encoder_id: String,
    pub codec: Codec,
    pub rank: u32,
}

/// The winning encoder for a codec plus the packetizer that frames it.
#[derive(Debug, Clone)]
pub struct EncoderSelection {
    pub codec: Codec,
    pub encoder_id: String,
    pub packetizer: PacketizerKind,
    pub rank: u32,
    provider: EncoderProvider,
}

impl EncoderSelection {
    pub fn create_encoder(&self) -> Result<Box<dyn Encoder>> {
        self.provider.create(self.codec)
    }
}

#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    providers: Vec<EncoderProvider>,
    /// Indices into `providers`, best first.
    by_codec: HashMap<Codec, Vec<usize>>,
}

impl CapabilityRegistry {
    pub fn new(providers: Vec<EncoderProvider>) -> Self {
        let mut by_codec: HashMap<Codec, Vec<usize>> = HashMap::new();
        for (idx, provider) in providers.iter().enumerate() {
            let mut matched = false;
            for output in &provider.outputs {
                match codec_for_media_type(output) {
                    Some(codec) => {
                        let entry = by_codec.entry(codec).or_default();
                        if !entry.contains(&idx) {
                            entry.push(idx);
                        }
                        matched = true;
                    }
                    None => tracing::debug!(
                        encoder = %provider.id,
                        output = %output,
                        "ignoring output outside the codec table"
                    ),
                }
            }
            if !matched {
                tracing::warn!(encoder = %provider.id, "encoder produces no known codec");
            }
        }

        // Stable: equal ranks keep registration order.
        for indices in by_codec.values_mut() {
            indices.sort_by(|&a, &b| providers[b].rank.cmp(&providers[a].rank));
        }

        for codec in Codec::ALL {
            let count = by_codec.get(&codec).map_or(0, Vec::len);
            tracing::debug!(%codec, encoders = count, "encoder index built");
        }

        Self {
            providers,
            by_codec,
        }
    }

    /// All providers able to produce `codec`, best first.
    pub fn candidates(&self, codec: Codec) -> Vec<EncoderCandidate> {
        self.by_codec
            .get(&codec)
            .into_iter()
            .flatten()
            .map(|&idx| {
                let p = &self.providers[idx];
                EncoderCandidate {
                    encoder_id: p.id.clone(),
                    codec,
                    rank: p.rank,
                }
            })
            .collect()
    }

    /// Highest-ranked encoder for the codec, paired with its packetizer.
    pub fn select_encoder(&self, descriptor: &CodecDescriptor) -> Option<EncoderSelection> {
        let idx = *self.by_codec.get(&descriptor.codec)?.first()?;
        let provider = &self.providers[idx];
        tracing::debug!(
            codec = %descriptor.codec,
            encoder = %provider.id,
            rank = provider.rank,
            packetizer = descriptor.packetizer.id(),
            "encoder selected"
        );
        Some(EncoderSelection {
            codec: descriptor.codec,
            encoder_id: provider.id.clone(),
            packetizer: descriptor.packetizer,
            rank: provider.rank,
            provider: provider.clone(),
        })
    }

    pub fn supports(&self, codec: Codec) -> bool {
        self.by_codec.get(&codec).is_some_and(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;

    fn unavailable() -> Arc<dyn EncoderFactory> {
        Arc::new(|codec: Codec| -> Result<Box<dyn Encoder>> {
            Err(SinkError::resource("encoder", format!("{codec} not built in")))
        })
    }

    fn provider(id: &str, codecs: &[Codec], rank: u32) -> EncoderProvider {
        EncoderProvider::for_codecs(id, codecs, rank, unavailable())
    }

    #[test]
    fn highest_rank_wins() {
        let reg = CapabilityRegistry::new(vec![
            provider("openh264enc", &[Codec::H264], 64),
            provider("x264enc", &[Codec::H264], 256),
            provider("vp8enc", &[Codec::Vp8], 128),
        ]);
        let sel = reg.select_encoder(Codec::H264.descriptor()).unwrap();
        assert_eq!(sel.encoder_id, "x264enc");
        assert_eq!(sel.packetizer, PacketizerKind::H264);
    }

    #[test]
    fn ties_keep_registration_order() {
        let reg = CapabilityRegistry::new(vec![
            provider("first", &[Codec::Vp9], 100),
            provider("second", &[Codec::Vp9], 100),
        ]);
        let ids: Vec<_> = reg
            .candidates(Codec::Vp9)
            .into_iter()
            .map(|c| c.encoder_id)
            .collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn no_match_returns_none() {
        let reg = CapabilityRegistry::new(vec![provider("vp8enc", &[Codec::Vp8], 128)]);
        assert!(reg.select_encoder(Codec::Av1.descriptor()).is_none());
        assert!(!reg.supports(Codec::Av1));
        assert!(reg.candidates(Codec::Av1).is_empty());
    }

    #[test]
    fn multi_codec_provider_and_unknown_outputs() {
        let reg = CapabilityRegistry::new(vec![EncoderProvider::new(
            "multienc",
            vec!["video/x-vp8".into(), "video/x-raw".into(), "video/x-vp9".into()],
            10,
            unavailable(),
        )]);
        assert!(reg.supports(Codec::Vp8));
        assert!(reg.supports(Codec::Vp9));
        assert!(!reg.supports(Codec::H264));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn selection_creates_through_provider() {
        let reg = CapabilityRegistry::new(vec![provider("vp8enc", &[Codec::Vp8], 1)]);
        let sel = reg.select_encoder(Codec::Vp8.descriptor()).unwrap();
        assert!(matches!(sel.create_encoder(), Err(SinkError::Resource { .. })));
    }
}
