//! Best-effort codec tuning applied once a branch is linked.
//!
//! Tuning is a plain list of property assignments. Every step that fails
//! is logged and skipped; nothing here can fail a branch.

use crate::codec::Codec;
use crate::media::{Encoder, Packetizer, PropertyValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningTarget {
    Encoder,
    Packetizer,
}

/// One property assignment, with an optional alternative tried when the
/// element rejects the first.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningStep {
    pub target: TuningTarget,
    pub property: &'static str,
    pub value: PropertyValue,
    pub fallback: Option<(&'static str, PropertyValue)>,
}

impl TuningStep {
    fn encoder(property: &'static str, value: impl Into<PropertyValue>) -> Self {
        Self {
            target: TuningTarget::Encoder,
            property,
            value: value.into(),
            fallback: None,
        }
    }

    fn packetizer(property: &'static str, value: impl Into<PropertyValue>) -> Self {
        Self {
            target: TuningTarget::Packetizer,
            property,
            value: value.into(),
            fallback: None,
        }
    }

    fn or_else(mut self, property: &'static str, value: impl Into<PropertyValue>) -> Self {
        self.fallback = Some((property, value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum H264Family {
    X264,
    Nvenc,
    Vaapi,
}

/// Encoder family, recognised from the implementation id.
fn h264_family(encoder_id: &str) -> Option<H264Family> {
    if encoder_id.contains("x264") {
        Some(H264Family::X264)
    } else if encoder_id.contains("nvh264") {
        Some(H264Family::Nvenc)
    } else if encoder_id.contains("vaapi") {
        Some(H264Family::Vaapi)
    } else {
        None
    }
}

/// Low-latency settings for `codec` produced by `encoder_id`.
pub fn plan(codec: Codec, encoder_id: &str) -> Vec<TuningStep> {
    let mut steps = Vec::new();
    match codec {
        Codec::H264 => {
            match h264_family(encoder_id) {
                Some(H264Family::X264) => {
                    steps.push(TuningStep::encoder("key-int-max", 30));
                    steps.push(TuningStep::encoder("bitrate", 2000));
                }
                Some(H264Family::Nvenc) => {
                    steps.push(
                        TuningStep::encoder("preset", "low-latency").or_else("rc-mode", "cbr"),
                    );
                    steps.push(TuningStep::encoder("zerolatency", true));
                }
                Some(H264Family::Vaapi) => {
                    steps.push(TuningStep::encoder("rate-control", "cbr"));
                    steps.push(TuningStep::encoder("bitrate", 2000));
                    steps.push(TuningStep::encoder("keyframe-period", 30));
                }
                None => {}
            }
            steps.push(TuningStep::packetizer("config-interval", -1));
            steps.push(TuningStep::packetizer("aggregate-mode", "zero-latency"));
        }
        Codec::Vp8 | Codec::Vp9 => {
            steps.push(TuningStep::encoder("deadline", 1));
            steps.push(TuningStep::encoder("keyframe-max-dist", 30));
        }
        Codec::Av1 => {}
    }
    steps
}

/// Outcome of [`apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TuningReport {
    pub applied: usize,
    pub failed: usize,
}

/// Apply `steps`, logging rejected properties at `warn`.
pub fn apply(
    client_id: &str,
    steps: &[TuningStep],
    encoder: &mut dyn Encoder,
    packetizer: &mut dyn Packetizer,
) -> TuningReport {
    let mut report = TuningReport::default();
    for step in steps {
        let mut set = |name: &str, value: &PropertyValue| match step.target {
            TuningTarget::Encoder => encoder.set_property(name, value),
            TuningTarget::Packetizer => packetizer.set_property(name, value),
        };

        let result = match set(step.property, &step.value) {
            Ok(()) => Ok(()),
            Err(first) => match &step.fallback {
                Some((name, value)) => {
                    tracing::debug!(client_id, property = step.property, error = %first, fallback = *name, "trying fallback property");
                    set(name, value)
                }
                None => Err(first),
            },
        };

        match result {
            Ok(()) => {
                report.applied += 1;
                tracing::debug!(client_id, target = ?step.target, property = step.property, value = %step.value, "tuned");
            }
            Err(e) => {
                report.failed += 1;
                tracing::warn!(client_id, target = ?step.target, property = step.property, error = %e, "tuning step skipped");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SinkError};
    use crate::media::h264::{AggregateMode, H264Packetizer};
    use crate::media::{EncodedFrame, VideoFormat, VideoFrame};

    /// Accepts only the listed property names.
    struct Picky(Vec<&'static str>, Vec<String>);

    impl Encoder for Picky {
        fn id(&self) -> &str {
            "picky"
        }
        fn codec(&self) -> Codec {
            Codec::H264
        }
        fn configure(&mut self, _: &VideoFormat) -> Result<()> {
            Ok(())
        }
        fn encode(&mut self, _: &VideoFrame) -> Result<Option<EncodedFrame>> {
            Ok(None)
        }
        fn set_property(&mut self, name: &str, _: &PropertyValue) -> Result<()> {
            if self.0.contains(&name) {
                self.1.push(name.to_string());
                Ok(())
            } else {
                Err(SinkError::unknown_property(name))
            }
        }
    }

    fn names(steps: &[TuningStep]) -> Vec<&'static str> {
        steps.iter().map(|s| s.property).collect()
    }

    #[test]
    fn h264_plans_per_family() {
        assert_eq!(
            names(&plan(Codec::H264, "x264enc")),
            vec!["key-int-max", "bitrate", "config-interval", "aggregate-mode"]
        );
        assert_eq!(
            names(&plan(Codec::H264, "nvh264enc")),
            vec!["preset", "zerolatency", "config-interval", "aggregate-mode"]
        );
        assert_eq!(
            names(&plan(Codec::H264, "vaapih264enc")),
            vec!["rate-control", "bitrate", "keyframe-period", "config-interval", "aggregate-mode"]
        );
        assert_eq!(
            names(&plan(Codec::H264, "openh264enc")),
            vec!["config-interval", "aggregate-mode"]
        );
    }

    #[test]
    fn vp_codecs_get_realtime_deadline() {
        assert_eq!(names(&plan(Codec::Vp8, "vp8enc")), vec!["deadline", "keyframe-max-dist"]);
        assert_eq!(names(&plan(Codec::Vp9, "vp9enc")), vec!["deadline", "keyframe-max-dist"]);
        assert!(plan(Codec::Av1, "rav1enc").is_empty());
    }

    #[test]
    fn fallback_property_is_tried() {
        let mut enc = Picky(vec!["rc-mode", "zerolatency"], Vec::new());
        let mut pay = H264Packetizer::new(102, 1);
        let report = apply("c", &plan(Codec::H264, "nvh264enc"), &mut enc, &mut pay);

        assert_eq!(report, TuningReport { applied: 4, failed: 0 });
        assert_eq!(enc.1, vec!["rc-mode", "zerolatency"]);
        assert_eq!(pay.config_interval(), -1);
        assert_eq!(pay.aggregate_mode(), AggregateMode::ZeroLatency);
    }

    #[test]
    fn failures_are_counted_not_fatal() {
        let mut enc = Picky(vec![], Vec::new());
        let mut pay = H264Packetizer::new(102, 1);
        let report = apply("c", &plan(Codec::H264, "x264enc"), &mut enc, &mut pay);
        assert_eq!(report, TuningReport { applied: 2, failed: 2 });
    }
}
