//! Integration tests: branch construction, fallback, rollback and teardown
//! driven through the public `Pipeline` API with the synthetic doubles.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use websink::media::PropertyValue;
use websink::testing::{RecordingEndpoints, SyntheticEncoders, TestPattern};
use websink::{
    Codec, EndpointConfig, EndpointProvider, LinkStep, Pipeline, PipelineState, PixelLayout,
    Settings, SinkError, TransportEndpoint, VideoFormat,
};

fn input() -> VideoFormat {
    VideoFormat::new(PixelLayout::Rgb, 32, 16, (30, 1))
}

struct Harness {
    pipeline: Pipeline,
    encoders: SyntheticEncoders,
    endpoints: RecordingEndpoints,
}

impl Harness {
    fn with_codecs(codecs: &[(&str, Codec, u32)], settings: Settings) -> Self {
        let encoders = SyntheticEncoders::new();
        let endpoints = RecordingEndpoints::new();
        let mut builder = Pipeline::builder()
            .settings(settings)
            .input(input())
            .endpoint_provider(Arc::new(endpoints.clone()));
        for (id, codec, rank) in codecs {
            builder = builder.encoder(encoders.provider(id, &[*codec], *rank));
        }
        let pipeline = builder.build().expect("pipeline build");
        pipeline.activate().expect("activate");
        Self {
            pipeline,
            encoders,
            endpoints,
        }
    }

    fn all_codecs() -> Self {
        Self::with_codecs(
            &[
                ("vp8enc", Codec::Vp8, 256),
                ("x264enc", Codec::H264, 256),
                ("vp9enc", Codec::Vp9, 256),
                ("rav1enc", Codec::Av1, 128),
            ],
            Settings::default(),
        )
    }

    /// Table size and tap count, which a failed build must leave unchanged.
    fn footprint(&self) -> (usize, usize) {
        (self.pipeline.clients().len(), self.pipeline.tap_count())
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn build_fallback_teardown_and_deactivate() {
    let h = Harness::all_codecs();
    let p = &h.pipeline;

    let a = p.build_branch("A", Some("vp8")).expect("build A");
    assert_eq!(a.codec, Codec::Vp8);
    assert_eq!(p.tap_count(), 1);

    let b = p.build_branch("B", Some("unknown-codec")).expect("build B");
    assert_eq!(b.codec, Codec::Vp8);
    assert_eq!(p.tap_count(), 2);

    p.teardown_branch("A");
    assert_eq!(p.tap_count(), 1);
    assert_eq!(p.clients().client_ids(), vec!["B".to_string()]);
    assert!(h.endpoints.is_closed("A"));

    p.deactivate();
    assert_eq!(p.tap_count(), 0);
    assert_eq!(p.state(), PipelineState::Idle);
    assert!(p.clients().is_empty());
    assert_eq!(h.endpoints.open(), 0);
}

#[test]
fn no_encoder_for_requested_or_default() {
    let h = Harness::with_codecs(&[("vp9enc", Codec::Vp9, 256)], Settings::default());
    let err = h.pipeline.build_branch("A", Some("h264")).unwrap_err();
    assert!(matches!(
        err,
        SinkError::Capability {
            requested: Codec::H264,
            fallback: Some(Codec::Vp8)
        }
    ));
    assert_eq!(h.footprint(), (0, 0));
    assert_eq!(h.endpoints.created(), 0);
}

#[test]
fn default_codec_without_encoder_fails_without_fallback() {
    let h = Harness::with_codecs(&[("x264enc", Codec::H264, 256)], Settings::default());
    let err = h.pipeline.build_branch("A", None).unwrap_err();
    assert!(matches!(
        err,
        SinkError::Capability {
            requested: Codec::Vp8,
            fallback: None
        }
    ));
    assert_eq!(h.footprint(), (0, 0));
}

#[test]
fn fallback_records_effective_codec() {
    let h = Harness::with_codecs(&[("vp8enc", Codec::Vp8, 256)], Settings::default());
    let branch = h.pipeline.build_branch("A", Some("av1")).expect("fallback build");
    assert_eq!(branch.codec, Codec::Vp8);
    assert_eq!(h.pipeline.client_codec("A"), Some(Codec::Vp8));
    assert_eq!(h.endpoints.track("A").unwrap().payload_type, 96);
}

#[test]
fn each_client_gets_its_codec() {
    let h = Harness::all_codecs();
    let p = &h.pipeline;
    for (client, codec, pt) in [("a", "vp8", 96), ("b", "h264", 102), ("c", "vp9", 98), ("d", "av1", 45)] {
        let handle = p.build_branch(client, Some(codec)).expect("build");
        assert_eq!(handle.codec.name(), codec);
        assert_eq!(h.endpoints.track(client).unwrap().payload_type, pt);
    }
    assert_eq!(p.tap_count(), 4);
    assert_eq!(p.live_branches(), 4);
    p.deactivate();
}

#[test]
fn frames_fan_out_to_every_branch() {
    let h = Harness::all_codecs();
    let p = &h.pipeline;
    let clients = ["a", "b", "c", "d"];
    for (client, codec) in clients.iter().zip(["vp8", "h264", "vp9", "av1"]) {
        p.build_branch(client, Some(codec)).expect("build");
    }

    let mut pattern = TestPattern::new(input());
    for _ in 0..10 {
        assert_eq!(p.push_frame(pattern.next_frame()), 4);
    }
    assert!(wait_until(|| clients.iter().all(|c| h.endpoints.packets(c) > 0)));

    let stats = p.distribution_stats();
    assert_eq!(stats.frames_in, 10);
    assert_eq!(stats.deliveries, 40);
    for client in clients {
        let branch = p.branch_stats(client).unwrap();
        assert_eq!(branch.encode_errors, 0);
        assert!(branch.frames_encoded > 0);
    }
    p.deactivate();
}

#[test]
fn wrong_size_frame_is_dropped() {
    let h = Harness::all_codecs();
    h.pipeline.build_branch("a", None).expect("build");
    assert_eq!(h.pipeline.push_frame(websink::VideoFrame::new(vec![0; 7])), 0);
    assert_eq!(h.pipeline.distribution_stats().frames_rejected, 1);
}

#[test]
fn every_failed_step_leaves_no_trace() {
    let h = Harness::all_codecs();
    h.pipeline.build_branch("keep", Some("vp9")).expect("build");
    let before = h.footprint();

    h.endpoints.fail_create(true);
    let err = h.pipeline.build_branch("x", Some("h264")).unwrap_err();
    assert!(matches!(err, SinkError::Resource { .. }), "{err}");
    assert_eq!(h.footprint(), before);
    h.endpoints.fail_create(false);

    h.encoders.fail_create(true);
    let err = h.pipeline.build_branch("x", Some("h264")).unwrap_err();
    assert!(matches!(err, SinkError::Resource { what: "encoder", .. }), "{err}");
    assert_eq!(h.footprint(), before);
    assert!(h.endpoints.is_closed("x"));
    h.encoders.fail_create(false);

    h.encoders.fail_configure(true);
    let err = h.pipeline.build_branch("x", Some("h264")).unwrap_err();
    assert!(matches!(err, SinkError::Link { step: LinkStep::QueueToEncoder, .. }), "{err}");
    assert_eq!(h.footprint(), before);
    h.encoders.fail_configure(false);

    h.encoders.wrong_codec(true);
    let err = h.pipeline.build_branch("x", Some("h264")).unwrap_err();
    assert!(matches!(err, SinkError::Link { step: LinkStep::EncoderToPacketizer, .. }), "{err}");
    assert_eq!(h.footprint(), before);
    h.encoders.wrong_codec(false);

    h.endpoints.fail_add_track(true);
    let err = h.pipeline.build_branch("x", Some("h264")).unwrap_err();
    assert!(matches!(err, SinkError::Link { step: LinkStep::PacketizerToEndpoint, .. }), "{err}");
    assert_eq!(h.footprint(), before);
    h.endpoints.fail_add_track(false);

    // Only the kept branch's endpoint is still open.
    assert_eq!(h.endpoints.open(), 1);
    assert_eq!(h.pipeline.live_branches(), 1);
    assert!(h.pipeline.build_branch("x", Some("h264")).is_ok());
}

#[test]
fn client_limit_is_a_resource_error() {
    let settings = Settings {
        max_clients: Some(2),
        ..Settings::default()
    };
    let h = Harness::with_codecs(&[("vp8enc", Codec::Vp8, 256)], settings);
    h.pipeline.build_branch("a", None).expect("a");
    h.pipeline.build_branch("b", None).expect("b");

    let err = h.pipeline.build_branch("c", None).unwrap_err();
    assert!(matches!(err, SinkError::Resource { .. }), "{err}");
    assert_eq!(h.footprint(), (2, 2));
    assert!(h.endpoints.is_closed("c"));

    h.pipeline.teardown_branch("a");
    assert!(h.pipeline.build_branch("c", None).is_ok());
}

#[test]
fn tuning_failures_do_not_fail_the_build() {
    let h = Harness::all_codecs();
    h.encoders.reject_properties(true);
    let branch = h.pipeline.build_branch("a", Some("h264")).expect("build");
    assert_eq!(branch.encoder_id, "x264enc");
    assert!(h.encoders.properties().is_empty());

    h.encoders.reject_properties(false);
    h.pipeline.build_branch("b", Some("h264")).expect("build");
    let props = h.encoders.properties();
    assert!(props.contains(&("x264enc".to_string(), "key-int-max".to_string(), PropertyValue::Int(30))));
    assert!(props.contains(&("x264enc".to_string(), "bitrate".to_string(), PropertyValue::Int(2000))));
}

#[test]
fn highest_rank_encoder_wins() {
    let h = Harness::with_codecs(
        &[
            ("openh264enc", Codec::H264, 128),
            ("nvh264enc", Codec::H264, 384),
            ("x264enc", Codec::H264, 256),
        ],
        Settings::default(),
    );
    let branch = h.pipeline.build_branch("a", Some("H264")).expect("build");
    assert_eq!(branch.encoder_id, "nvh264enc");
}

#[test]
fn renegotiation_replaces_the_branch() {
    let h = Harness::all_codecs();
    let p = &h.pipeline;
    p.build_branch("a", Some("vp8")).expect("first");
    let second = p.build_branch("a", Some("h264")).expect("second");
    assert_eq!(second.codec, Codec::H264);
    assert_eq!(p.tap_count(), 1);
    assert_eq!(p.client_codec("a"), Some(Codec::H264));
    assert_eq!(h.endpoints.created(), 2);
    assert_eq!(h.endpoints.open(), 1);
}

#[test]
fn teardown_is_idempotent() {
    let h = Harness::all_codecs();
    let factory = h.pipeline.endpoint_factory();
    assert!(factory.build("a", Some("vp9")).is_some());
    factory.teardown("a");
    factory.teardown("a");
    factory.teardown("never-built");
    assert_eq!(h.footprint(), (0, 0));
}

#[test]
fn factory_reports_failure_as_none() {
    let h = Harness::with_codecs(&[], Settings::default());
    let factory = h.pipeline.endpoint_factory();
    assert!(factory.build("a", Some("vp8")).is_none());
    assert_eq!(h.footprint(), (0, 0));
}

#[test]
fn default_codec_change_applies_to_new_branches() {
    let h = Harness::all_codecs();
    let p = &h.pipeline;
    let before = p.build_branch("a", None).expect("a");
    p.set_default_codec("vp9").expect("set default");
    let after = p.build_branch("b", None).expect("b");
    assert_eq!(before.codec, Codec::Vp8);
    assert_eq!(after.codec, Codec::Vp9);
    assert_eq!(p.client_codec("a"), Some(Codec::Vp8));
}

#[test]
fn concurrent_builds_and_teardowns() {
    let h = Harness::all_codecs();
    let p = &h.pipeline;
    let codecs = ["vp8", "h264", "vp9", "av1"];

    thread::scope(|s| {
        for i in 0..16 {
            s.spawn(move || {
                let client = format!("client-{i}");
                p.build_branch(&client, Some(codecs[i % codecs.len()])).expect("build");
            });
        }
    });
    assert_eq!(p.tap_count(), 16);
    assert_eq!(p.live_branches(), 16);

    let mut pattern = TestPattern::new(input());
    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..20 {
                p.push_frame(pattern.next_frame());
            }
        });
        for i in (0..16).step_by(2) {
            s.spawn(move || {
                assert!(p.teardown_branch(&format!("client-{i}")));
            });
        }
    });
    assert_eq!(p.tap_count(), 8);
    assert_eq!(p.clients().len(), 8);
    assert_eq!(h.endpoints.open(), 8);

    p.deactivate();
    assert_eq!(h.footprint(), (0, 0));
}

#[test]
fn deactivate_while_producing() {
    let h = Harness::all_codecs();
    let p = h.pipeline.clone();
    for i in 0..4 {
        p.build_branch(&format!("c{i}"), None).expect("build");
    }

    let producer = {
        let p = p.clone();
        thread::spawn(move || {
            let mut pattern = TestPattern::new(input());
            let mut delivered = 0;
            for _ in 0..200 {
                delivered += p.push_frame(pattern.next_frame());
            }
            delivered
        })
    };
    thread::sleep(Duration::from_millis(20));
    p.deactivate();
    producer.join().expect("producer");

    assert_eq!(p.state(), PipelineState::Idle);
    assert_eq!(p.tap_count(), 0);
    assert_eq!(p.live_branches(), 0);
    assert_eq!(h.endpoints.open(), 0);
    assert!(matches!(p.build_branch("late", None), Err(SinkError::NotActive)));
}

/// Endpoint provider that takes its time, keeping a build in flight.
struct SlowEndpoints {
    inner: RecordingEndpoints,
    delay: Duration,
}

impl EndpointProvider for SlowEndpoints {
    fn create(&self, config: &EndpointConfig) -> websink::Result<Arc<dyn TransportEndpoint>> {
        thread::sleep(self.delay);
        self.inner.create(config)
    }
}

#[test]
fn teardown_waits_for_in_flight_build() {
    let encoders = SyntheticEncoders::new();
    let endpoints = RecordingEndpoints::new();
    let pipeline = Pipeline::builder()
        .input(input())
        .encoder(encoders.provider("vp8enc", &[Codec::Vp8], 256))
        .endpoint_provider(Arc::new(SlowEndpoints {
            inner: endpoints.clone(),
            delay: Duration::from_millis(300),
        }))
        .build()
        .expect("pipeline build");
    pipeline.activate().expect("activate");

    let builder = {
        let pipeline = pipeline.clone();
        thread::spawn(move || pipeline.build_branch("a", None).is_ok())
    };
    thread::sleep(Duration::from_millis(50));
    let torn = pipeline.teardown_branch("a");
    let built = builder.join().expect("build thread");

    assert!(built);
    assert!(torn);
    assert_eq!(
        (pipeline.tap_count(), pipeline.clients().len(), endpoints.open()),
        (0, 0, 0)
    );
    assert_eq!(endpoints.created(), 1);
}
