//! Media types, element traits, and RTP packetization.
//!
//! A branch moves data through three kinds of element:
//!
//! ```text
//! VideoFrame (raw) ──► Encoder ──► EncodedFrame ──► Packetizer ──► RTP packets
//! ```
//!
//! Encoders are supplied by the host through the
//! [`CapabilityRegistry`](crate::registry::CapabilityRegistry); packetizers
//! are implemented here, one per codec in the static table:
//!
//! | Codec | Module   | Payload format |
//! |-------|----------|----------------|
//! | VP8   | [`vp8`]  | RFC 7741       |
//! | H.264 | [`h264`] | RFC 6184       |
//! | VP9   | [`vp9`]  | RFC 9628       |
//! | AV1   | [`av1`]  | AOM RTP AV1    |
//!
//! The RTP fixed header shared by all of them lives in [`rtp`].

pub mod av1;
pub mod h264;
pub mod rtp;
pub mod vp8;
pub mod vp9;

use std::fmt;
use std::time::Duration;

use crate::codec::Codec;
use crate::error::{Result, SinkError};

/// RTP clock rate used for every video payload format.
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Default RTP payload budget in bytes (header excluded).
pub const DEFAULT_MTU: usize = 1200;

/// Raw pixel layouts accepted from the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Packed R, G, B, A.
    Rgba,
    /// Packed R, G, B.
    Rgb,
    /// Planar Y, U, V at 4:2:0.
    I420,
    /// Planar Y, V, U at 4:2:0.
    Yv12,
    /// Packed Y0 U Y1 V at 4:2:2.
    Yuy2,
    /// Packed U Y0 V Y1 at 4:2:2.
    Uyvy,
    /// Y plane followed by interleaved U/V at 4:2:0.
    Nv12,
    /// Y plane followed by interleaved V/U at 4:2:0.
    Nv21,
}

impl PixelLayout {
    pub const ALL: [PixelLayout; 8] = [
        PixelLayout::Rgba,
        PixelLayout::Rgb,
        PixelLayout::I420,
        PixelLayout::Yv12,
        PixelLayout::Yuy2,
        PixelLayout::Uyvy,
        PixelLayout::Nv12,
        PixelLayout::Nv21,
    ];

    pub fn name(self) -> &'static str {
        match self {
            PixelLayout::Rgba => "RGBA",
            PixelLayout::Rgb => "RGB",
            PixelLayout::I420 => "I420",
            PixelLayout::Yv12 => "YV12",
            PixelLayout::Yuy2 => "YUY2",
            PixelLayout::Uyvy => "UYVY",
            PixelLayout::Nv12 => "NV12",
            PixelLayout::Nv21 => "NV21",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|l| l.name().eq_ignore_ascii_case(name.trim()))
    }

    /// Size in bytes of one tightly packed frame (no row padding).
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        match self {
            PixelLayout::Rgba => w * h * 4,
            PixelLayout::Rgb => w * h * 3,
            PixelLayout::I420 | PixelLayout::Yv12 => w * h + 2 * cw * ch,
            PixelLayout::Nv12 | PixelLayout::Nv21 => w * h + 2 * cw * ch,
            PixelLayout::Yuy2 | PixelLayout::Uyvy => 4 * cw * h,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Format of the raw feed, negotiated once when the pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub layout: PixelLayout,
    pub width: u32,
    pub height: u32,
    /// Frames per second as a `(numerator, denominator)` fraction.
    pub framerate: (u32, u32),
}

impl VideoFormat {
    pub fn new(layout: PixelLayout, width: u32, height: u32, framerate: (u32, u32)) -> Self {
        Self {
            layout,
            width,
            height,
            framerate,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.layout.frame_size(self.width, self.height)
    }

    /// Same geometry and rate with a different pixel layout.
    pub fn with_layout(&self, layout: PixelLayout) -> Self {
        Self { layout, ..*self }
    }

    /// Nominal duration of one frame, if the framerate is well formed.
    pub fn frame_duration(&self) -> Option<Duration> {
        let (num, den) = self.framerate;
        if num == 0 || den == 0 {
            return None;
        }
        Some(Duration::from_nanos(
            (den as u64 * 1_000_000_000) / num as u64,
        ))
    }

    /// RTP timestamp increment per frame at [`VIDEO_CLOCK_RATE`].
    pub fn rtp_increment(&self) -> u32 {
        let (num, den) = self.framerate;
        if num == 0 {
            return VIDEO_CLOCK_RATE / 30;
        }
        ((VIDEO_CLOCK_RATE as u64 * den as u64) / num as u64) as u32
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(SinkError::UnsupportedFormat(format!(
                "{}x{} has a zero dimension",
                self.width, self.height
            )));
        }
        if self.framerate.0 == 0 || self.framerate.1 == 0 {
            return Err(SinkError::UnsupportedFormat(format!(
                "framerate {}/{} is not a positive rate",
                self.framerate.0, self.framerate.1
            )));
        }
        Ok(())
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} @ {}/{}",
            self.layout, self.width, self.height, self.framerate.0, self.framerate.1
        )
    }
}

/// One raw frame from the producer.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    /// Presentation timestamp relative to the start of the stream.
    pub pts: Option<Duration>,
    pub duration: Option<Duration>,
}

impl VideoFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            pts: None,
            duration: None,
        }
    }

    pub fn with_timing(mut self, pts: Duration, duration: Duration) -> Self {
        self.pts = Some(pts);
        self.duration = Some(duration);
        self
    }
}

/// Output of an [`Encoder`]: one access unit / temporal unit.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub keyframe: bool,
    pub duration: Option<Duration>,
}

/// Value of an element property set during codec tuning.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v as i64)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Str(v) => f.write_str(v),
        }
    }
}

/// A video encoder instance owned by exactly one branch.
///
/// Implementations come from the host (hardware or software codecs);
/// the core only drives them.
pub trait Encoder: Send {
    /// Identifier of the implementation (e.g. `"x264enc"`).
    fn id(&self) -> &str;

    /// Codec this instance produces.
    fn codec(&self) -> Codec;

    /// Accept the raw input format. Called while linking the buffer stage
    /// to the encoder; an error fails the link.
    fn configure(&mut self, input: &VideoFormat) -> Result<()>;

    /// Encode one raw frame. `Ok(None)` means the encoder buffered it.
    fn encode(&mut self, frame: &VideoFrame) -> Result<Option<EncodedFrame>>;

    /// Set an implementation-specific property.
    fn set_property(&mut self, name: &str, _value: &PropertyValue) -> Result<()> {
        Err(SinkError::unknown_property(name))
    }
}

/// Codec-specific RTP packetizer.
///
/// Each packetizer composes an [`rtp::RtpHeader`] and implements the
/// payload format of its codec. One instance per branch, so sequence
/// numbers and SSRCs are independent per client.
pub trait Packetizer: Send {
    /// Split one encoded frame into complete RTP packets (header included).
    ///
    /// `timestamp_increment` advances the RTP timestamp after this frame,
    /// normally `90000 / fps`.
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>>;

    /// Codec this packetizer frames.
    fn codec(&self) -> Codec;

    /// RTP payload type number.
    fn payload_type(&self) -> u8;

    /// Synchronization source of the outgoing stream.
    fn ssrc(&self) -> u32;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32 {
        VIDEO_CLOCK_RATE
    }

    /// SDP media-level attributes (`a=rtpmap`, `a=fmtp`, ...).
    fn sdp_attributes(&self) -> Vec<String>;

    /// Set a payloader property (`config-interval`, ...).
    fn set_property(&mut self, name: &str, _value: &PropertyValue) -> Result<()> {
        Err(SinkError::unknown_property(name))
    }
}

/// Packetizer selection key from the codec table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketizerKind {
    Vp8,
    H264,
    Vp9,
    Av1,
}

impl PacketizerKind {
    /// Stable identifier, used in logs.
    pub fn id(self) -> &'static str {
        match self {
            PacketizerKind::Vp8 => "rtpvp8pay",
            PacketizerKind::H264 => "rtph264pay",
            PacketizerKind::Vp9 => "rtpvp9pay",
            PacketizerKind::Av1 => "rtpav1pay",
        }
    }

    /// Instantiate a packetizer with a random SSRC.
    pub fn create(self, payload_type: u8) -> Box<dyn Packetizer> {
        match self {
            PacketizerKind::Vp8 => Box::new(vp8::Vp8Packetizer::with_random_ssrc(payload_type)),
            PacketizerKind::H264 => Box::new(h264::H264Packetizer::with_random_ssrc(payload_type)),
            PacketizerKind::Vp9 => Box::new(vp9::Vp9Packetizer::with_random_ssrc(payload_type)),
            PacketizerKind::Av1 => Box::new(av1::Av1Packetizer::with_random_ssrc(payload_type)),
        }
    }
}

/// Convert a buffer duration into RTP clock ticks, rounding to nearest.
pub fn duration_to_rtp(duration: Duration) -> u32 {
    let nanos = duration.as_nanos() as u64;
    ((nanos * VIDEO_CLOCK_RATE as u64 + 500_000_000) / 1_000_000_000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelLayout::Rgba.frame_size(4, 2), 32);
        assert_eq!(PixelLayout::Rgb.frame_size(4, 2), 24);
        assert_eq!(PixelLayout::I420.frame_size(4, 2), 8 + 2 * 2);
        assert_eq!(PixelLayout::Nv21.frame_size(4, 2), 8 + 4);
        assert_eq!(PixelLayout::Yuy2.frame_size(4, 2), 16);
        // Odd dimensions round chroma up.
        assert_eq!(PixelLayout::I420.frame_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn layout_names_round_trip() {
        for layout in PixelLayout::ALL {
            assert_eq!(PixelLayout::from_name(layout.name()), Some(layout));
        }
        assert_eq!(PixelLayout::from_name("nv12"), Some(PixelLayout::Nv12));
        assert_eq!(PixelLayout::from_name("BGRx"), None);
    }

    #[test]
    fn rtp_increment_from_framerate() {
        let f = VideoFormat::new(PixelLayout::I420, 640, 480, (30, 1));
        assert_eq!(f.rtp_increment(), 3000);
        let f = VideoFormat::new(PixelLayout::I420, 640, 480, (30000, 1001));
        assert_eq!(f.rtp_increment(), 3003);
    }

    #[test]
    fn duration_conversion_rounds() {
        assert_eq!(duration_to_rtp(Duration::from_millis(40)), 3600);
        assert_eq!(duration_to_rtp(Duration::from_nanos(33_333_333)), 3000);
    }

    #[test]
    fn validate_rejects_degenerate_formats() {
        assert!(VideoFormat::new(PixelLayout::I420, 0, 480, (30, 1)).validate().is_err());
        assert!(VideoFormat::new(PixelLayout::I420, 640, 480, (0, 1)).validate().is_err());
        assert!(VideoFormat::new(PixelLayout::I420, 640, 480, (30, 1)).validate().is_ok());
    }
}
