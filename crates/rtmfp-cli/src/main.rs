//! RTMFP CLI - play, publish and relay FLV over RTMFP from the command line
//!
//! Connects to an RTMFP server, then plays or publishes a stream directly,
//! through a peer or through a NetGroup.

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rtmfp_client::{
    ClientError, Event, GroupConfig, Handle, Interrupt, Invoker, Parameters, RtmfpConfig,
    StreamRole,
};
use rtmfp_core::flv::FlvReader;
use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Pause between reads when nothing is buffered
const READ_IDLE: Duration = Duration::from_millis(20);

const CHUNK_SIZE: usize = 64 * 1024;

/// RTMFP - Secure Real-Time Media Flow Protocol client
#[derive(Parser)]
#[command(name = "rtmfp")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true, env = "RTMFP_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a stream from the server
    Play {
        /// Server URL, e.g. rtmfp://localhost/live
        url: String,

        /// Stream name
        stream: String,

        /// FLV output file, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Publish an FLV file to the server, or to peers with --p2p
    Publish {
        /// Server URL
        url: String,

        /// Stream name
        stream: String,

        /// FLV input file, `-` for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Publish directly to peers
        #[arg(long)]
        p2p: bool,

        /// Send audio without retransmission
        #[arg(long)]
        unreliable_audio: bool,

        /// Send video without retransmission
        #[arg(long)]
        unreliable_video: bool,
    },

    /// Play a stream directly from a peer
    Peer {
        /// Server URL used for the rendezvous
        url: String,

        /// Peer ID of the publisher (64 hex digits)
        peer_id: String,

        /// Stream name
        stream: String,

        /// FLV output file, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: PathBuf,
    },

    /// Play or publish a stream through a NetGroup
    Group {
        /// Server URL
        url: String,

        /// Stream name
        stream: String,

        /// Group specifier, overrides the config file
        #[arg(short, long)]
        net_group: Option<String>,

        /// Publish the input file instead of playing
        #[arg(long)]
        publish: bool,

        /// FLV file: input when publishing, output otherwise; `-` for stdio
        #[arg(short, long, default_value = "-")]
        file: PathBuf,

        /// URL of a publication to play when the group stays silent
        #[arg(long)]
        fallback: Option<String>,
    },

    /// Show version and system info
    Info,
}

/// Contents of the configuration file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CliConfig {
    parameters: Parameters,
    group: GroupConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.log_level, cli.json_logs)?;

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => CliConfig::default(),
    };

    if let Commands::Info = cli.command {
        print_info();
        return Ok(());
    }

    let invoker = Arc::new(Invoker::new(config.parameters.clone()).context("Failed to start RTMFP")?);

    // Handle Ctrl+C
    let handler = invoker.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        handler.interrupt(Interrupt::Application);
    })
    .context("Failed to set Ctrl+C handler")?;

    let result = run(&invoker, cli.command, config.group);
    invoker.terminate();
    match result {
        Err(e) if is_shutdown(&e) => {
            eprintln!("{}", "Stopped".yellow());
            Ok(())
        }
        other => other,
    }
}

fn run(invoker: &Invoker, command: Commands, group: GroupConfig) -> Result<()> {
    match command {
        Commands::Play {
            url,
            stream,
            output,
        } => {
            let ctx = connect(invoker, &url)?;
            let media = invoker.add_stream(ctx, StreamRole::Play, &stream, true, true, false)?;
            eprintln!("{} Playing {}", "OK".green().bold(), stream.yellow());
            drain(invoker, ctx, media, &output)?;
            close(invoker, ctx);
        }

        Commands::Publish {
            url,
            stream,
            input,
            p2p,
            unreliable_audio,
            unreliable_video,
        } => {
            let ctx = connect(invoker, &url)?;
            let role = if p2p {
                StreamRole::P2pPublish
            } else {
                StreamRole::Publish
            };
            invoker.add_stream(ctx, role, &stream, !unreliable_audio, !unreliable_video, true)?;
            eprintln!("{} Publishing {}", "OK".green().bold(), stream.yellow());
            feed(invoker, ctx, &input)?;
            invoker.close_publication(ctx, &stream)?;
            close(invoker, ctx);
        }

        Commands::Peer {
            url,
            peer_id,
            stream,
            output,
        } => {
            let ctx = connect(invoker, &url)?;
            let media = invoker.connect2_peer(ctx, &peer_id, &stream, true)?;
            eprintln!(
                "{} Playing {} from peer {}",
                "OK".green().bold(),
                stream.yellow(),
                peer_id.chars().take(16).collect::<String>()
            );
            drain(invoker, ctx, media, &output)?;
            close(invoker, ctx);
        }

        Commands::Group {
            url,
            stream,
            net_group,
            publish,
            file,
            fallback,
        } => {
            let group = GroupConfig {
                net_group: net_group.unwrap_or(group.net_group),
                is_publisher: publish,
                is_blocking: publish || group.is_blocking,
                ..group
            };
            let connection = RtmfpConfig::default();
            let ctx = connect(invoker, &url)?;
            let media = invoker.connect2_group(
                ctx,
                &stream,
                &connection,
                group,
                true,
                true,
                fallback.as_deref(),
            )?;
            if publish {
                eprintln!("{} Publishing {} to the group", "OK".green().bold(), stream.yellow());
                feed(invoker, ctx, &file)?;
            } else {
                eprintln!("{} Joined the group, playing {}", "OK".green().bold(), stream.yellow());
                drain(invoker, ctx, media, &file)?;
            }
            close(invoker, ctx);
        }

        Commands::Info => print_info(),
    }

    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    // stdout may carry FLV, logs go to stderr
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact().with_writer(io::stderr))
            .init();
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<CliConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: CliConfig =
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))?;
    debug!("Loaded configuration from {}: {:?}", path.display(), config);
    Ok(config)
}

fn is_shutdown(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<ClientError>()
        .is_some_and(|e| e.is_interrupt() || e.is_precondition())
}

fn connect(invoker: &Invoker, url: &str) -> Result<Handle> {
    eprintln!("{} Connecting to {}", "RTMFP".cyan().bold(), url);
    let ctx = invoker.connect(url, RtmfpConfig::default())?;
    let events = invoker.wait_for_event(ctx, Event::Connected.into())?;
    debug!("Connection {} events {:?}", ctx, events);
    eprintln!("{} Connected", "OK".green().bold());
    Ok(ctx)
}

fn close(invoker: &Invoker, ctx: Handle) {
    if let Err(e) = invoker.remove_connection(ctx, true) {
        warn!("Close failed: {}", e);
    }
}

fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(BufWriter::new(io::stdout())));
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(Box::new(BufWriter::new(file)))
}

fn open_input(path: &Path) -> Result<Box<dyn Read>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin()));
    }
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(Box::new(file))
}

/// Copy a played stream to `output` until the connection ends
fn drain(invoker: &Invoker, ctx: Handle, media: u16, output: &Path) -> Result<()> {
    let mut output = open_output(output)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        match invoker.read(ctx, media, &mut buf) {
            Ok(0) => {
                output.flush()?;
                thread::sleep(READ_IDLE);
            }
            Ok(read) => {
                output.write_all(&buf[..read])?;
                total += read as u64;
            }
            Err(e) if e.is_interrupt() || e.is_precondition() => break,
            Err(e) => return Err(e).context("Read failed"),
        }
    }
    output.flush()?;
    eprintln!("{} {} bytes received", "Done".green().bold(), total);
    Ok(())
}

/// Publish an FLV byte stream, pacing tags by their timestamps
fn feed(invoker: &Invoker, ctx: Handle, input: &Path) -> Result<()> {
    let mut input = open_input(input)?;
    let mut reader = FlvReader::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut encoded = BytesMut::new();
    let mut first: Option<(Instant, u32)> = None;
    let mut tags = 0u64;

    loop {
        let read = input.read(&mut chunk)?;
        if read == 0 {
            break;
        }
        reader.push(&chunk[..read]);
        while let Some(tag) = reader.next_tag()? {
            let (start, origin) = *first.get_or_insert((Instant::now(), tag.time));
            let due = start + Duration::from_millis(tag.time.saturating_sub(origin) as u64);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            encoded.clear();
            tag.encode(&mut encoded);
            invoker.write(ctx, &encoded)?;
            tags += 1;
        }
    }

    if reader.pending() > 0 {
        bail!("Input ends inside a tag ({} bytes left)", reader.pending());
    }
    eprintln!("{} {} tags sent", "Done".green().bold(), tags);
    Ok(())
}

fn print_info() {
    println!(
        "{}",
        "RTMFP - Secure Real-Time Media Flow Protocol".cyan().bold()
    );
    println!();
    println!("Version:    {}", env!("CARGO_PKG_VERSION"));
    println!("Platform:   {}", std::env::consts::OS);
    println!("Arch:       {}", std::env::consts::ARCH);
    println!();
    println!("{}", "Modes:".green());
    println!("  - Play and publish through a server");
    println!("  - Direct peer-to-peer play (P2P publish on the other side)");
    println!("  - NetGroup multicast with fallback to a server publication");
    println!();
    println!("{}", "Examples:".green());
    println!("  rtmfp play rtmfp://localhost/live cam -o cam.flv");
    println!("  rtmfp publish rtmfp://localhost/live cam -i cam.flv --p2p");
    println!("  rtmfp peer rtmfp://localhost/live <peer id> cam > cam.flv");
    println!("  rtmfp group rtmfp://localhost/live cam -n G:0101... --publish -f cam.flv");
}
