use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use ftcomm_transport::telemetry::{init_json_tracing, init_tracing};
use ftcomm_transport::{Client, ClientOptions, MessageType, Server, ServerOptions};
use parking_lot::Mutex;

#[derive(Parser)]
#[command(name = "ftcomm-probe")]
#[command(about = "Smoke-test an ftcomm transport endpoint", long_about = None)]
struct Cli {
    /// Emit JSON log lines.
    #[arg(long, env = "FTCOMM_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a server that answers echo frames.
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:9600")]
        listen: String,
        /// Server options file (.toml or .json); overrides --listen.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Seconds to run; 0 runs until killed.
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
    /// Connect as a rank and time echo round trips.
    Ping {
        #[arg(short, long, default_value = "127.0.0.1:9600")]
        server: String,
        #[arg(short, long, default_value = "0")]
        rank: u64,
        #[arg(short = 'n', long, default_value = "5")]
        count: u32,
        #[arg(long, default_value = "64")]
        size: usize,
        /// Client options file (.toml or .json); overrides --server and --rank.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json {
        init_json_tracing();
    } else {
        init_tracing();
    }

    match cli.command {
        Command::Serve {
            listen,
            config,
            duration,
        } => serve(listen, config, duration),
        Command::Ping {
            server,
            rank,
            count,
            size,
            config,
        } => ping(server, rank, count, size, config),
    }
}

fn serve(listen: String, config: Option<PathBuf>, duration: u64) -> Result<()> {
    let options = match config {
        Some(path) => ServerOptions::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServerOptions::new(listen),
    };
    let server = Server::new(options);
    server.register_request_handler(MessageType::Echo, |ctx| {
        if let Err(err) = ctx.reply(MessageType::Echo, 0, ctx.body().clone()) {
            tracing::warn!(rank = ctx.rank(), error = %err, "echo reply failed");
        }
    })?;
    server.register_request_handler(MessageType::Heartbeat, |ctx| {
        tracing::debug!(rank = ctx.rank(), "heartbeat");
    })?;
    server.set_link_broken_hook(|rank, link_id| {
        tracing::info!(rank, link_id, "rank disconnected");
    })?;
    server.start().context("starting server")?;

    let started = Instant::now();
    loop {
        thread::sleep(Duration::from_secs(5));
        let stats = server.stats();
        tracing::info!(
            links = stats.links,
            frames_in = stats.frames_in,
            frames_out = stats.frames_out,
            broken = stats.broken_links,
            "server stats"
        );
        if duration > 0 && started.elapsed() >= Duration::from_secs(duration) {
            break;
        }
    }
    server.stop();
    Ok(())
}

fn ping(server: String, rank: u64, count: u32, size: usize, config: Option<PathBuf>) -> Result<()> {
    let options = match config {
        Some(path) => ClientOptions::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientOptions::new(server, rank),
    };
    let client = Client::new(options);
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    client.register_request_handler(MessageType::Echo, move |ctx| {
        let _ = tx.lock().send(ctx.frame().header.seq_no);
    })?;
    client.start().context("connecting")?;

    let body = Bytes::from(vec![0xA5u8; size]);
    let mut total = Duration::ZERO;
    for i in 0..count {
        let sent = Instant::now();
        client.send(MessageType::Echo, body.clone())?;
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(_) => {
                let rtt = sent.elapsed();
                total += rtt;
                println!("echo {i}: {size} bytes in {:.3} ms", rtt.as_secs_f64() * 1000.0);
            }
            Err(_) => bail!("echo {i} timed out"),
        }
    }
    if count > 0 {
        println!("average {:.3} ms", total.as_secs_f64() * 1000.0 / count as f64);
    }
    client.stop();
    Ok(())
}
