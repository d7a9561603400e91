//! Deterministic stand-ins for the host-supplied collaborators.
//!
//! Used by the test suites and by the `simulate` CLI command:
//!
//! - [`TestPattern`] generates raw frames in any accepted layout.
//! - [`SyntheticEncoders`] hands out encoders emitting codec-shaped
//!   bitstreams (Annex B H.264, VP8/VP9 frame headers, AV1 OBUs).
//! - [`RecordingEndpoints`] creates endpoints that record what they
//!   receive and can be told to fail.
//! - [`NoopService`] is an ancillary service that can be told to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::codec::Codec;
use crate::endpoint::{EndpointConfig, EndpointProvider, TrackDescription, TransportEndpoint};
use crate::error::{LinkStep, Result, SinkError};
use crate::media::{EncodedFrame, Encoder, PropertyValue, VideoFormat, VideoFrame};
use crate::pipeline::Settings;
use crate::registry::{EncoderFactory, EncoderProvider};
use crate::service::AncillaryService;

/// Moving gradient in the producer's layout.
#[derive(Debug)]
pub struct TestPattern {
    format: VideoFormat,
    frame: u64,
}

impl TestPattern {
    pub fn new(format: VideoFormat) -> Self {
        Self { format, frame: 0 }
    }

    pub fn next_frame(&mut self) -> VideoFrame {
        let size = self.format.frame_size();
        let shift = self.frame as usize;
        let data = (0..size).map(|i| ((i + shift) % 251) as u8).collect();

        let duration = self.format.frame_duration().unwrap_or(Duration::from_millis(33));
        let pts = duration * self.frame as u32;
        self.frame += 1;
        VideoFrame::new(data).with_timing(pts, duration)
    }
}

#[derive(Debug, Default)]
struct EncoderKnobs {
    fail_create: AtomicBool,
    fail_configure: AtomicBool,
    wrong_codec: AtomicBool,
    reject_properties: AtomicBool,
    created: AtomicUsize,
    properties: Mutex<Vec<(String, String, PropertyValue)>>,
}

/// Factory of synthetic encoders sharing one set of failure knobs.
#[derive(Debug, Clone)]
pub struct SyntheticEncoders {
    knobs: Arc<EncoderKnobs>,
    keyframe_interval: u64,
}

impl Default for SyntheticEncoders {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticEncoders {
    pub fn new() -> Self {
        Self {
            knobs: Arc::new(EncoderKnobs::default()),
            keyframe_interval: 30,
        }
    }

    pub fn with_keyframe_interval(mut self, frames: u64) -> Self {
        self.keyframe_interval = frames.max(1);
        self
    }

    /// Provider `id` producing `codecs` at `rank`.
    pub fn provider(&self, id: &str, codecs: &[Codec], rank: u32) -> EncoderProvider {
        let factory = SyntheticFactory {
            id: id.to_string(),
            knobs: Arc::clone(&self.knobs),
            keyframe_interval: self.keyframe_interval,
        };
        EncoderProvider::for_codecs(id, codecs, rank, Arc::new(factory))
    }

    pub fn fail_create(&self, fail: bool) {
        self.knobs.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_configure(&self, fail: bool) {
        self.knobs.fail_configure.store(fail, Ordering::SeqCst);
    }

    /// Make encoders report a codec other than the one requested.
    pub fn wrong_codec(&self, wrong: bool) {
        self.knobs.wrong_codec.store(wrong, Ordering::SeqCst);
    }

    pub fn reject_properties(&self, reject: bool) {
        self.knobs.reject_properties.store(reject, Ordering::SeqCst);
    }

    /// Encoder instances created so far.
    pub fn created(&self) -> usize {
        self.knobs.created.load(Ordering::SeqCst)
    }

    /// `(encoder id, property, value)` accepted so far.
    pub fn properties(&self) -> Vec<(String, String, PropertyValue)> {
        self.knobs.properties.lock().clone()
    }
}

struct SyntheticFactory {
    id: String,
    knobs: Arc<EncoderKnobs>,
    keyframe_interval: u64,
}

impl EncoderFactory for SyntheticFactory {
    fn create(&self, codec: Codec) -> Result<Box<dyn Encoder>> {
        if self.knobs.fail_create.load(Ordering::SeqCst) {
            return Err(SinkError::resource("encoder", format!("{} refused to start", self.id)));
        }
        self.knobs.created.fetch_add(1, Ordering::SeqCst);
        let codec = if self.knobs.wrong_codec.load(Ordering::SeqCst) {
            match codec {
                Codec::Vp8 => Codec::Vp9,
                _ => Codec::Vp8,
            }
        } else {
            codec
        };
        Ok(Box::new(SyntheticEncoder {
            id: self.id.clone(),
            codec,
            knobs: Arc::clone(&self.knobs),
            keyframe_interval: self.keyframe_interval,
            frames: 0,
            input: None,
        }))
    }
}

/// Encoder emitting a minimal, well-formed bitstream of its codec.
struct SyntheticEncoder {
    id: String,
    codec: Codec,
    knobs: Arc<EncoderKnobs>,
    keyframe_interval: u64,
    frames: u64,
    input: Option<VideoFormat>,
}

const H264_SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16, 0xe8];
const H264_PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

impl SyntheticEncoder {
    /// Compressed payload: every 16th input byte.
    fn payload(frame: &VideoFrame) -> Vec<u8> {
        frame.data.iter().step_by(16).copied().collect()
    }

    fn bitstream(&self, keyframe: bool, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 32);
        match self.codec {
            Codec::H264 => {
                if keyframe {
                    for nal in [H264_SPS, H264_PPS] {
                        out.extend_from_slice(&[0, 0, 0, 1]);
                        out.extend_from_slice(nal);
                    }
                }
                out.extend_from_slice(&[0, 0, 0, 1, if keyframe { 0x65 } else { 0x41 }]);
                // Keep the slice free of start-code emulation.
                out.extend(body.iter().map(|b| b | 0x80));
            }
            Codec::Vp8 => {
                // Frame tag bit 0 clear on keyframes, then the start code.
                let header: &[u8] = if keyframe {
                    &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a]
                } else {
                    &[0x11, 0x02, 0x00]
                };
                out.extend_from_slice(header);
                out.extend_from_slice(body);
            }
            Codec::Vp9 => {
                out.push(if keyframe { 0x80 } else { 0x84 });
                out.extend_from_slice(body);
            }
            Codec::Av1 => {
                out.extend_from_slice(&[0x12, 0x00]);
                if keyframe {
                    out.extend_from_slice(&[0x0A, 0x03, 0x00, 0x00, 0x00]);
                }
                out.push(0x32);
                push_leb128(&mut out, body.len());
                out.extend_from_slice(body);
            }
        }
        out
    }
}

fn push_leb128(out: &mut Vec<u8>, mut value: usize) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

impl Encoder for SyntheticEncoder {
    fn id(&self) -> &str {
        &self.id
    }

    fn codec(&self) -> Codec {
        self.codec
    }

    fn configure(&mut self, input: &VideoFormat) -> Result<()> {
        if self.knobs.fail_configure.load(Ordering::SeqCst) {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} cannot accept {input}",
                self.id
            )));
        }
        self.input = Some(*input);
        Ok(())
    }

    fn encode(&mut self, frame: &VideoFrame) -> Result<Option<EncodedFrame>> {
        let Some(input) = self.input else {
            return Err(SinkError::link(
                LinkStep::QueueToEncoder,
                "encoder not configured",
            ));
        };
        if frame.data.len() != input.frame_size() {
            return Err(SinkError::UnsupportedFormat(format!(
                "{} bytes is not one {input} frame",
                frame.data.len()
            )));
        }
        let keyframe = self.frames % self.keyframe_interval == 0;
        self.frames += 1;
        let data = self.bitstream(keyframe, &Self::payload(frame));
        Ok(Some(EncodedFrame {
            data,
            keyframe,
            duration: frame.duration,
        }))
    }

    fn set_property(&mut self, name: &str, value: &PropertyValue) -> Result<()> {
        if self.knobs.reject_properties.load(Ordering::SeqCst) {
            return Err(SinkError::unknown_property(name));
        }
        self.knobs
            .properties
            .lock()
            .push((self.id.clone(), name.to_string(), value.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct EndpointRecord {
    config: EndpointConfig,
    track: Option<TrackDescription>,
    packets: Arc<AtomicU64>,
    closed: bool,
}

#[derive(Debug, Default)]
struct EndpointState {
    fail_create: AtomicBool,
    fail_add_track: AtomicBool,
    records: Mutex<Vec<EndpointRecord>>,
}

/// Endpoint provider that records every endpoint it creates.
///
/// Lookups by client id return the most recent endpoint of that client.
#[derive(Debug, Clone, Default)]
pub struct RecordingEndpoints {
    state: Arc<EndpointState>,
}

impl RecordingEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_add_track(&self, fail: bool) {
        self.state.fail_add_track.store(fail, Ordering::SeqCst);
    }

    /// Endpoints created so far.
    pub fn created(&self) -> usize {
        self.state.records.lock().len()
    }

    /// Endpoints created and not yet closed.
    pub fn open(&self) -> usize {
        self.state.records.lock().iter().filter(|r| !r.closed).count()
    }

    fn latest<T>(&self, client_id: &str, f: impl FnOnce(&EndpointRecord) -> T) -> Option<T> {
        self.state
            .records
            .lock()
            .iter()
            .rev()
            .find(|r| r.config.client_id == client_id)
            .map(f)
    }

    pub fn config(&self, client_id: &str) -> Option<EndpointConfig> {
        self.latest(client_id, |r| r.config.clone())
    }

    pub fn track(&self, client_id: &str) -> Option<TrackDescription> {
        self.latest(client_id, |r| r.track.clone()).flatten()
    }

    pub fn packets(&self, client_id: &str) -> u64 {
        self.latest(client_id, |r| r.packets.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn is_closed(&self, client_id: &str) -> bool {
        self.latest(client_id, |r| r.closed).unwrap_or(false)
    }
}

impl EndpointProvider for RecordingEndpoints {
    fn create(&self, config: &EndpointConfig) -> Result<Arc<dyn TransportEndpoint>> {
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(SinkError::resource("transport endpoint", "provider refused"));
        }
        let packets = Arc::new(AtomicU64::new(0));
        let mut records = self.state.records.lock();
        records.push(EndpointRecord {
            config: config.clone(),
            track: None,
            packets: Arc::clone(&packets),
            closed: false,
        });
        Ok(Arc::new(RecordingEndpoint {
            client_id: config.client_id.clone(),
            index: records.len() - 1,
            packets,
            state: Arc::clone(&self.state),
        }))
    }
}

struct RecordingEndpoint {
    client_id: String,
    index: usize,
    packets: Arc<AtomicU64>,
    state: Arc<EndpointState>,
}

impl RecordingEndpoint {
    fn update(&self, f: impl FnOnce(&mut EndpointRecord)) {
        if let Some(record) = self.state.records.lock().get_mut(self.index) {
            f(record);
        }
    }
}

impl TransportEndpoint for RecordingEndpoint {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn add_track(&self, track: &TrackDescription) -> Result<()> {
        if self.state.fail_add_track.load(Ordering::SeqCst) {
            return Err(SinkError::resource("track", "endpoint rejected the track"));
        }
        self.update(|r| r.track = Some(track.clone()));
        Ok(())
    }

    fn remove_track(&self) {
        self.update(|r| r.track = None);
    }

    fn send_rtp(&self, _packet: &[u8]) -> Result<()> {
        self.packets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        self.update(|r| r.closed = true);
    }
}

/// Start/stop counters of a [`NoopService`], readable after the service
/// has been handed to a pipeline.
#[derive(Debug, Clone, Default)]
pub struct ServiceProbe {
    started: Arc<AtomicUsize>,
    stopped: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl ServiceProbe {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Make subsequent starts fail.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.started() > self.stopped()
    }
}

/// Ancillary service that does nothing but count.
#[derive(Debug)]
pub struct NoopService {
    name: String,
    probe: ServiceProbe,
}

impl NoopService {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            probe: ServiceProbe::default(),
        }
    }

    pub fn probe(&self) -> ServiceProbe {
        self.probe.clone()
    }
}

impl AncillaryService for NoopService {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, _settings: &Settings) -> Result<()> {
        if self.probe.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Lifecycle {
                service: self.name.clone(),
                reason: "configured to fail".to_string(),
            });
        }
        self.probe.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.probe.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelLayout;
    use crate::media::av1::parse_obus;
    use crate::media::h264::H264Packetizer;
    use crate::media::vp9;

    fn encoder(codec: Codec) -> Box<dyn Encoder> {
        let encoders = SyntheticEncoders::new().with_keyframe_interval(2);
        let mut enc = encoders.provider("synth", &[codec], 1).create(codec).unwrap();
        enc.configure(&VideoFormat::new(PixelLayout::I420, 16, 16, (30, 1)))
            .unwrap();
        enc
    }

    fn frame() -> VideoFrame {
        TestPattern::new(VideoFormat::new(PixelLayout::I420, 16, 16, (30, 1))).next_frame()
    }

    #[test]
    fn pattern_matches_format() {
        let format = VideoFormat::new(PixelLayout::Yuy2, 8, 4, (25, 1));
        let mut pattern = TestPattern::new(format);
        let a = pattern.next_frame();
        let b = pattern.next_frame();
        assert_eq!(a.data.len(), format.frame_size());
        assert_ne!(a.data, b.data);
        assert_eq!(b.pts, Some(Duration::from_millis(40)));
    }

    #[test]
    fn h264_stream_is_annex_b() {
        let mut enc = encoder(Codec::H264);
        let key = enc.encode(&frame()).unwrap().unwrap();
        assert!(key.keyframe);
        let nals = H264Packetizer::extract_nal_units(&key.data);
        let types: Vec<u8> = nals.iter().map(|n| n[0] & 0x1F).collect();
        assert_eq!(types, vec![7, 8, 5]);

        let delta = enc.encode(&frame()).unwrap().unwrap();
        assert!(!delta.keyframe);
        assert_eq!(H264Packetizer::extract_nal_units(&delta.data).len(), 1);
    }

    #[test]
    fn vp9_and_av1_streams_parse() {
        let mut enc = encoder(Codec::Vp9);
        assert!(vp9::is_keyframe(&enc.encode(&frame()).unwrap().unwrap().data));
        assert!(!vp9::is_keyframe(&enc.encode(&frame()).unwrap().unwrap().data));

        let mut enc = encoder(Codec::Av1);
        let obus = parse_obus(&enc.encode(&frame()).unwrap().unwrap().data);
        let types: Vec<u8> = obus.iter().map(|o| o.obu_type).collect();
        assert_eq!(types, vec![2, 1, 6]);
    }

    #[test]
    fn encoder_knobs() {
        let encoders = SyntheticEncoders::new();
        let provider = encoders.provider("synth", &[Codec::Vp8], 1);

        encoders.fail_create(true);
        assert!(provider.create(Codec::Vp8).is_err());
        encoders.fail_create(false);

        encoders.wrong_codec(true);
        assert_eq!(provider.create(Codec::Vp8).unwrap().codec(), Codec::Vp9);
        assert_eq!(encoders.created(), 1);
    }

    #[test]
    fn recording_endpoint_tracks_lifecycle() {
        let endpoints = RecordingEndpoints::new();
        let ep = endpoints
            .create(&EndpointConfig {
                client_id: "a".into(),
                stun_server: "stun://x:1".into(),
            })
            .unwrap();
        ep.send_rtp(&[0; 12]).unwrap();
        assert_eq!(endpoints.packets("a"), 1);
        assert_eq!(endpoints.open(), 1);
        ep.close();
        assert!(endpoints.is_closed("a"));
        assert_eq!(endpoints.open(), 0);
    }

    #[test]
    fn noop_service_counts() {
        let mut svc = NoopService::new("http");
        let probe = svc.probe();
        svc.start(&Settings::default()).unwrap();
        assert!(probe.is_running());
        svc.stop();
        probe.fail(true);
        assert!(svc.start(&Settings::default()).is_err());
        assert_eq!((probe.started(), probe.stopped()), (1, 1));
    }
}
