use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use websink::testing::{RecordingEndpoints, SyntheticEncoders, TestPattern};
use websink::{
    Codec, ConnectionHandler, EncoderProvider, Pipeline, PixelLayout, ServicePort, Settings,
    TcpService, VideoFormat, WeakPipeline,
};

#[derive(Parser)]
#[command(
    name = "websink",
    about = "Per-client WebRTC fan-out of a raw video feed"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show which encoder would serve a codec request
    Probe(ProbeArgs),
    /// Run the pipeline against synthetic encoders and endpoints
    Simulate(SimulateArgs),
}

#[derive(Args)]
struct ProbeArgs {
    /// Requested codec (vp8, h264, vp9, av1)
    #[arg(long)]
    codec: String,

    /// Codec used when the request cannot be served
    #[arg(long, default_value = "vp8")]
    default_codec: String,

    /// Available encoder as id:codec[+codec]:rank, repeatable
    #[arg(long = "encoder", value_parser = parse_encoder)]
    encoders: Vec<EncoderSpec>,
}

#[derive(Args)]
struct SettingsArgs {
    /// Address the HTTP and signaling services bind to
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: String,

    /// Page delivery port (0 for ephemeral)
    #[arg(long, default_value_t = 8080)]
    http_port: u16,

    /// Signaling port (0 for ephemeral)
    #[arg(long, default_value_t = 8081)]
    ws_port: u16,

    #[arg(long, default_value = "stun://stun.l.google.com:19302")]
    stun_server: String,

    /// Default codec for clients without a usable preference
    #[arg(long, default_value = "vp8")]
    video_codec: String,

    /// Frames buffered per client before the oldest is dropped
    #[arg(long, default_value_t = 200)]
    queue_capacity: usize,

    /// Maximum simultaneous clients
    #[arg(long)]
    max_clients: Option<usize>,
}

impl SettingsArgs {
    fn into_settings(self) -> Settings {
        Settings {
            bind_address: self.bind_address,
            http_port: self.http_port,
            ws_port: self.ws_port,
            stun_server: self.stun_server,
            video_codec: self.video_codec,
            queue_capacity: self.queue_capacity,
            max_clients: self.max_clients,
        }
    }
}

#[derive(Args)]
struct SimulateArgs {
    #[command(flatten)]
    settings: SettingsArgs,

    /// Client codec preferences, one client per entry (`-` for the default)
    #[arg(long, value_delimiter = ',', default_value = "vp8,h264,vp9,av1")]
    clients: Vec<String>,

    /// How long to produce frames
    #[arg(long, default_value_t = 3)]
    seconds: u64,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(long, default_value_t = 320)]
    width: u32,

    #[arg(long, default_value_t = 240)]
    height: u32,

    /// Raw layout of the producer feed (rgba, rgb, i420, yv12, yuy2, uyvy, nv12, nv21)
    #[arg(long, default_value = "rgb", value_parser = parse_layout)]
    format: PixelLayout,
}

#[derive(Clone)]
struct EncoderSpec {
    id: String,
    codecs: Vec<Codec>,
    rank: u32,
}

fn parse_encoder(s: &str) -> Result<EncoderSpec, String> {
    let mut parts = s.split(':');
    let (Some(id), Some(codecs), Some(rank), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected id:codec[+codec]:rank, got '{s}'"));
    };
    let codecs = codecs
        .split('+')
        .map(|c| Codec::from_name(c).ok_or_else(|| format!("unknown codec '{c}'")))
        .collect::<Result<Vec<_>, _>>()?;
    let rank = rank
        .parse::<u32>()
        .map_err(|e| format!("invalid rank '{rank}': {e}"))?;
    Ok(EncoderSpec {
        id: id.to_string(),
        codecs,
        rank,
    })
}

fn parse_layout(s: &str) -> Result<PixelLayout, String> {
    PixelLayout::from_name(s).ok_or_else(|| format!("unknown pixel layout '{s}'"))
}

fn default_encoders() -> Vec<EncoderSpec> {
    [
        ("vp8enc", Codec::Vp8, 256),
        ("x264enc", Codec::H264, 256),
        ("vp9enc", Codec::Vp9, 256),
        ("rav1enc", Codec::Av1, 128),
    ]
    .into_iter()
    .map(|(id, codec, rank)| EncoderSpec {
        id: id.to_string(),
        codecs: vec![codec],
        rank,
    })
    .collect()
}

fn providers(encoders: &SyntheticEncoders, specs: &[EncoderSpec]) -> Vec<EncoderProvider> {
    specs
        .iter()
        .map(|spec| encoders.provider(&spec.id, &spec.codecs, spec.rank))
        .collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Probe(args) => probe(args),
        Command::Simulate(args) => simulate(args),
    };
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn probe(args: ProbeArgs) -> websink::Result<()> {
    let specs = if args.encoders.is_empty() {
        default_encoders()
    } else {
        args.encoders
    };
    let encoders = SyntheticEncoders::new();
    let registry = websink::CapabilityRegistry::new(providers(&encoders, &specs));

    let Some(requested) = Codec::from_name(&args.codec) else {
        println!("'{}' is not in the codec table, the default applies", args.codec);
        return probe_default(&registry, &args.default_codec);
    };

    for candidate in registry.candidates(requested) {
        println!("  {:<16} rank {}", candidate.encoder_id, candidate.rank);
    }
    match registry.select_encoder(requested.descriptor()) {
        Some(selection) => {
            print_selection(&selection);
            Ok(())
        }
        None => {
            println!("no encoder for {requested}");
            probe_default(&registry, &args.default_codec)
        }
    }
}

fn probe_default(registry: &websink::CapabilityRegistry, name: &str) -> websink::Result<()> {
    let codec = Codec::from_name(name)
        .ok_or_else(|| websink::SinkError::InvalidConfig(format!("unknown video codec '{name}'")))?;
    match registry.select_encoder(codec.descriptor()) {
        Some(selection) => {
            print_selection(&selection);
            Ok(())
        }
        None => Err(websink::SinkError::Capability {
            requested: codec,
            fallback: None,
        }),
    }
}

fn print_selection(selection: &websink::EncoderSelection) {
    println!(
        "{} -> {} (rank {}) -> {} pt {}",
        selection.codec,
        selection.encoder_id,
        selection.rank,
        selection.packetizer.id(),
        selection.codec.descriptor().payload_type
    );
}

/// Answers every request with a one-line plain-text status.
fn status_handler(pipeline: Arc<OnceLock<WeakPipeline>>) -> Arc<dyn ConnectionHandler> {
    Arc::new(move |stream: TcpStream, peer: SocketAddr| {
        let Some(pipeline) = pipeline.get().and_then(WeakPipeline::upgrade) else {
            return;
        };
        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).is_err() {
            return;
        }
        let body = format!(
            "{} branches, clients: {}\n",
            pipeline.live_branches(),
            pipeline.branch_clients().join(", ")
        );
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        if let Err(e) = (&stream).write_all(response.as_bytes()) {
            tracing::debug!(%peer, error = %e, "status write failed");
        }
    })
}

/// Builds and tears down branches from `build <client> [codec]` and
/// `teardown <client>` lines.
fn signaling_handler(pipeline: Arc<OnceLock<WeakPipeline>>) -> Arc<dyn ConnectionHandler> {
    Arc::new(move |stream: TcpStream, peer: SocketAddr| {
        let Some(pipeline) = pipeline.get().and_then(WeakPipeline::upgrade) else {
            return;
        };
        let factory = pipeline.endpoint_factory();
        let reader = BufReader::new(&stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let mut words = line.split_whitespace();
            let reply = match (words.next(), words.next(), words.next()) {
                (Some("build"), Some(client), codec) => match factory.build(client, codec) {
                    Some(_) => format!("ok {client}\n"),
                    None => format!("error {client}\n"),
                },
                (Some("teardown"), Some(client), None) => {
                    factory.teardown(client);
                    format!("ok {client}\n")
                }
                _ => "error unknown command\n".to_string(),
            };
            if (&stream).write_all(reply.as_bytes()).is_err() {
                break;
            }
        }
        tracing::debug!(%peer, "signaling connection closed");
    })
}

fn simulate(args: SimulateArgs) -> websink::Result<()> {
    let settings = args.settings.into_settings();
    let format = VideoFormat::new(args.format, args.width, args.height, (args.fps, 1));
    let encoders = SyntheticEncoders::new();
    let endpoints = RecordingEndpoints::new();

    // The connection handlers need the pipeline that owns them.
    let shared: Arc<OnceLock<WeakPipeline>> = Arc::new(OnceLock::new());
    let pipeline = Pipeline::builder()
        .settings(settings)
        .input(format)
        .encoders(providers(&encoders, &default_encoders()))
        .endpoint_provider(Arc::new(endpoints.clone()))
        .service(Box::new(TcpService::new(
            "http",
            ServicePort::Http,
            status_handler(Arc::clone(&shared)),
        )))
        .service(Box::new(TcpService::new(
            "signaling",
            ServicePort::Signaling,
            signaling_handler(Arc::clone(&shared)),
        )))
        .build()?;
    let _ = shared.set(pipeline.downgrade());
    pipeline.activate()?;

    let factory = pipeline.endpoint_factory();
    for (idx, codec) in args.clients.iter().enumerate() {
        let client = format!("client-{idx}");
        let preference = Some(codec.as_str()).filter(|c| *c != "-");
        match factory.build(&client, preference) {
            Some(_) => println!(
                "{client}: asked {codec}, got {}",
                pipeline
                    .client_codec(&client)
                    .map_or("?", |c| c.name())
            ),
            None => println!("{client}: asked {codec}, failed"),
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let pipeline = pipeline.clone();
        let stop = Arc::clone(&stop);
        let interval = format.frame_duration().unwrap_or(Duration::from_millis(33));
        thread::spawn(move || {
            let mut pattern = TestPattern::new(format);
            let mut frames = 0u64;
            while !stop.load(Ordering::SeqCst) {
                let started = Instant::now();
                pipeline.push_frame(pattern.next_frame());
                frames += 1;
                if let Some(rest) = interval.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
            frames
        })
    };

    thread::sleep(Duration::from_secs(args.seconds));
    stop.store(true, Ordering::SeqCst);
    let frames = producer.join().unwrap_or(0);

    let dist = pipeline.distribution_stats();
    println!(
        "produced {frames} frames, {} rejected, {} deliveries",
        dist.frames_rejected, dist.deliveries
    );
    for client in pipeline.branch_clients() {
        if let Some(stats) = pipeline.branch_stats(&client) {
            println!(
                "{client}: {} in, {} dropped, {} encoded, {} packets sent",
                stats.frames_in, stats.frames_dropped, stats.frames_encoded, stats.packets_sent
            );
        }
    }

    pipeline.deactivate();
    Ok(())
}
