//! A2DP Media - simulated streaming session
//!
//! Runs the media engine against a tone or PCM file feed, a counting
//! transport and a session layer that completes transitions immediately.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use a2dp_media::engine::io::{PcmRingFeed, StreamState};
use a2dp_media::sim::{
    spawn_feeder, CountingSink, CountingTransport, FeedInput, SimulatedSession, ToneGenerator,
};
use a2dp_media::{
    Collaborators, ControlCommand, EngineConfig, EngineHandle, LinkCapabilities, MediaEngine,
    PeerRole,
};
use anyhow::{Context, Result};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    control: Option<PathBuf>,
    tone_hz: Option<f64>,
    seconds: Option<u64>,
    edr: bool,
    json: bool,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("a2dp_media=info".parse()?)
                .add_directive("a2dp_media_core=info".parse()?),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    println!(
        "A2DP Media v{} (built {}) - simulated session",
        a2dp_media::VERSION,
        a2dp_media::BUILD_DATE
    );
    println!();

    run(options)
}

fn parse_args() -> Result<Option<Options>> {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    let value = |i: usize, flag: &str| -> Result<String> {
        args.get(i + 1)
            .cloned()
            .with_context(|| format!("{flag} requires a value"))
    };

    while i < args.len() {
        match args[i].as_str() {
            "--version" | "-v" => {
                println!("a2dp-media {}", a2dp_media::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--config" | "-c" => {
                options.config = Some(value(i, "--config")?.into());
                i += 1;
            }
            "--input" | "-i" => {
                options.input = Some(value(i, "--input")?.into());
                i += 1;
            }
            "--output" | "-o" => {
                options.output = Some(value(i, "--output")?.into());
                i += 1;
            }
            "--control" => {
                options.control = Some(value(i, "--control")?.into());
                i += 1;
            }
            "--tone" => {
                let raw = value(i, "--tone")?;
                options.tone_hz = Some(
                    raw.parse()
                        .with_context(|| format!("Invalid tone frequency: {raw}"))?,
                );
                i += 1;
            }
            "--seconds" | "-s" => {
                let raw = value(i, "--seconds")?;
                options.seconds = Some(
                    raw.parse()
                        .with_context(|| format!("Invalid duration: {raw}"))?,
                );
                i += 1;
            }
            "--edr" => options.edr = true,
            "--json" => options.json = true,
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(None);
            }
        }
        i += 1;
    }
    Ok(Some(options))
}

fn print_help() {
    println!("Usage: a2dp-media [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH     Engine config (JSON); defaults when missing");
    println!("  -i, --input PATH      Raw PCM input in the feeding format (default: tone)");
    println!("      --tone HZ         Tone frequency when no input file is given (default: 440)");
    println!("  -o, --output PATH     Record encoded packets to PATH");
    println!("      --control PATH    Listen for a control channel on a Unix socket");
    println!("  -s, --seconds N       Stop after N seconds (default: run until Ctrl+C)");
    println!("      --edr             Treat the peer as EDR capable");
    println!("      --json            Print the final statistics as JSON");
    println!("  -v, --version         Show version");
    println!("  -h, --help            Show this help");
    println!();
    println!("Without --control the stream is started immediately.");
}

fn run(options: Options) -> Result<()> {
    let config = match &options.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::default(),
    };
    config.validate().context("Invalid engine config")?;
    let feeding = config.feeding;
    let tick = Duration::from_millis(config.tx_tick_ms);

    // Eight ticks of headroom between the feeder and the pacer
    let ring_bytes = feeding.bytes_per_tick(config.tx_tick_ms) as usize * 8;
    let (writer, feed) = PcmRingFeed::new(ring_bytes);

    let transport = match &options.output {
        Some(path) => CountingTransport::with_output(path)
            .with_context(|| format!("Failed to create {}", path.display()))?,
        None => CountingTransport::new(),
    };
    let counters = transport.counters();
    let session = SimulatedSession::new(StreamState::Ready);

    let mut engine = MediaEngine::new(
        config.clone(),
        Collaborators {
            feeding: Box::new(feed),
            sink: Box::new(CountingSink::default()),
            transport: Box::new(transport),
            session: Box::new(session.clone()),
        },
    )?;
    let handle = engine.handle();
    session.bind(handle.clone());
    engine.start()?;

    let link = LinkCapabilities {
        edr: options.edr,
        edr_3mbps: false,
    };
    handle.set_peer(PeerRole::Sink, link);
    match handle.configure(config.encoder, feeding) {
        Ok(encoder) => println!(
            "Encoder: {} Hz, {:?}, bitpool {}, {} kbps",
            encoder.sampling_frequency.hz(),
            encoder.channel_mode,
            encoder.bitpool,
            encoder.bitrate_kbps
        ),
        Err(e) => warn!(error = %e, "Configuration rejected, using defaults"),
    }

    let input = match &options.input {
        Some(path) => FeedInput::file(path)
            .with_context(|| format!("Failed to open {}", path.display()))?,
        None => FeedInput::Tone(ToneGenerator::new(options.tone_hz.unwrap_or(440.0), feeding)),
    };
    let (stop_feeder, feeder_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let feeder = spawn_feeder(input, writer, feeding, tick, feeder_stop_rx)?;

    match &options.control {
        Some(path) => listen_for_control(path, handle.clone())?,
        None => handle.send_command(ControlCommand::Start as u8),
    }

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    println!("Streaming. Press Ctrl+C to stop.");
    println!("────────────────────────────────────────");

    let started = Instant::now();
    let deadline = options.seconds.map(Duration::from_secs);
    let mut last_status = String::new();
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        std::thread::sleep(Duration::from_millis(500));

        match handle.stats_snapshot() {
            Ok(snapshot) => {
                let status_line = format!(
                    "Packets: {:>7} | Frames: {:>8} | Underruns: {:>4} | Dropped: {:>4} | Queue: {:>2} | Streaming: {}",
                    counters.packets(),
                    counters.frames(),
                    snapshot.stats.underrun_count,
                    snapshot.stats.tx_dropped_packets,
                    snapshot.tx_queue_len,
                    snapshot.streaming
                );
                // Only print if changed (reduce spam)
                if status_line != last_status {
                    println!("{}", status_line);
                    last_status = status_line;
                }
            }
            Err(e) => error!(error = %e, "Failed to read statistics"),
        }
    }

    println!();
    println!("Stopping...");
    if options.control.is_none() {
        handle.send_command(ControlCommand::Stop as u8);
        std::thread::sleep(tick * 2);
    }
    let snapshot = handle.stats_snapshot();
    drop(stop_feeder);
    if feeder.join().is_err() {
        error!("Feeder thread panicked");
    }
    engine.stop()?;

    match snapshot {
        Ok(snapshot) if options.json => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        Ok(snapshot) => println!("{}", snapshot),
        Err(e) => warn!(error = %e, "No final statistics"),
    }
    println!(
        "Transport: {} packets, {} frames, {} bytes",
        counters.packets(),
        counters.frames(),
        counters.bytes()
    );
    println!("Done.");
    Ok(())
}

#[cfg(unix)]
fn listen_for_control(path: &std::path::Path, handle: EngineHandle) -> Result<()> {
    use std::os::unix::net::UnixListener;

    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    info!(path = %path.display(), "Waiting for control connections");

    std::thread::Builder::new()
        .name("control_listener".into())
        .spawn(move || {
            for stream in listener.incoming() {
                let attached = stream.and_then(|reader| {
                    let writer = reader.try_clone()?;
                    Ok((reader, writer))
                });
                match attached {
                    Ok((reader, writer)) => {
                        if let Err(e) = handle.attach_control(reader, writer) {
                            error!(error = %e, "Failed to attach control channel");
                        }
                    }
                    Err(e) => warn!(error = %e, "Control connection failed"),
                }
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
fn listen_for_control(_path: &std::path::Path, _handle: EngineHandle) -> Result<()> {
    anyhow::bail!("Control sockets require a Unix platform")
}
