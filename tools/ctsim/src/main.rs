//! ctsim - exercise a CT channel against the mock firmware
//!
//! Commands:
//! - `ctsim roundtrip` - Run blocking request/response rounds
//! - `ctsim storm` - Flood the channel with G2H events
//! - `ctsim cycle` - Drive disable/re-enable cycles under traffic
//!
//! Every command prints a channel snapshot on completion, which makes the
//! tool handy for eyeballing cursor movement and credit accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use guc_ct::mock::{MockGuc, MockReply};
use guc_ct::{CtChannel, CtConfig, EventSink};
use log::info;

#[derive(Parser)]
#[command(name = "ctsim")]
#[command(version)]
#[command(about = "CT channel simulator backed by mock firmware", long_about = None)]
struct Cli {
    /// H2G ring capacity in words (power of two)
    #[arg(long, default_value_t = 1024)]
    h2g_words: u32,

    /// G2H ring capacity in words (power of two)
    #[arg(long, default_value_t = 1024)]
    g2h_words: u32,

    /// Response timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run blocking request/response rounds against an echo firmware
    Roundtrip {
        /// Number of rounds
        #[arg(short, long, default_value_t = 1000)]
        rounds: u32,

        /// Payload length in words
        #[arg(short, long, default_value_t = 4)]
        payload: usize,
    },

    /// Flood the channel with G2H events and count deliveries
    Storm {
        /// Number of events to inject
        #[arg(short, long, default_value_t = 1000)]
        events: u32,
    },

    /// Alternate traffic with disable/re-enable transitions
    Cycle {
        /// Number of disable/enable cycles
        #[arg(short, long, default_value_t = 10)]
        cycles: u32,
    },
}

/// Sink counting every delivery, fast or queued.
struct CountingSink {
    delivered: AtomicUsize,
}

impl EventSink for CountingSink {
    fn event(&self, _action: u32, _payload: &[u32]) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cfg = CtConfig {
        h2g_words: cli.h2g_words,
        g2h_words: cli.g2h_words,
        response_timeout: Duration::from_millis(cli.timeout_ms),
        ..CtConfig::default()
    };

    match cli.command {
        Commands::Roundtrip { rounds, payload } => run_roundtrip(cfg, rounds, payload),
        Commands::Storm { events } => run_storm(cfg, events),
        Commands::Cycle { cycles } => run_cycle(cfg, cycles),
    }
}

fn run_roundtrip(cfg: CtConfig, rounds: u32, payload: usize) -> Result<()> {
    let ct = CtChannel::new(Box::new(guc_ct::NullSink));
    ct.init(cfg).context("channel init failed")?;
    ct.enable().context("channel enable failed")?;
    let _fw = MockGuc::echo(Arc::clone(&ct));

    let request: Vec<u32> = (0..payload as u32).collect();
    let mut response = vec![0u32; payload];
    let start = Instant::now();

    for round in 0..rounds {
        let len = ct
            .send_recv(0x1000 + (round & 0xFF), &request, Some(&mut response))
            .with_context(|| format!("round {round} failed"))?;
        if len != payload || response[..len] != request[..] {
            bail!("round {round}: echo mismatch ({len} words)");
        }
    }

    let elapsed = start.elapsed();
    info!(
        "{} round trips in {:.2?} ({:.1} us/round)",
        rounds,
        elapsed,
        elapsed.as_micros() as f64 / rounds.max(1) as f64
    );
    println!("{}", ct.snapshot_capture(false));
    Ok(())
}

fn run_storm(cfg: CtConfig, events: u32) -> Result<()> {
    let sink = Arc::new(CountingSink {
        delivered: AtomicUsize::new(0),
    });
    let ct = CtChannel::new(Box::new(Arc::clone(&sink)));
    ct.init(cfg).context("channel init failed")?;
    ct.enable().context("channel enable failed")?;
    let fw = MockGuc::spawn(Arc::clone(&ct), Box::new(|_, _| MockReply::Ignore));

    let start = Instant::now();
    let mut injected = 0u32;
    while injected < events {
        // Back off when the mock cannot take more until the worker drains.
        match fw.inject_event(0x5000 + (injected & 0xFF), &[injected]) {
            Ok(()) => injected += 1,
            Err(_) => std::thread::sleep(Duration::from_micros(200)),
        }
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while sink.delivered.load(Ordering::Relaxed) < events as usize {
        if Instant::now() > deadline {
            bail!(
                "storm stalled: {}/{} events delivered",
                sink.delivered.load(Ordering::Relaxed),
                events
            );
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    info!("{} events delivered in {:.2?}", events, start.elapsed());
    println!("{}", ct.snapshot_capture(false));
    Ok(())
}

fn run_cycle(cfg: CtConfig, cycles: u32) -> Result<()> {
    let ct = CtChannel::new(Box::new(guc_ct::NullSink));
    ct.init(cfg).context("channel init failed")?;
    let _fw = MockGuc::echo(Arc::clone(&ct));

    let survivors = Arc::new(Mutex::new(0u32));
    for cycle in 0..cycles {
        ct.enable().with_context(|| format!("enable #{cycle}"))?;

        let mut buf = [0u32; 2];
        let len = ct
            .send_recv(0x2000, &[cycle, cycle ^ 0xFFFF], Some(&mut buf))
            .with_context(|| format!("round trip in cycle {cycle}"))?;
        if len != 2 {
            bail!("cycle {cycle}: short echo ({len} words)");
        }
        *survivors.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        ct.disable();
        if ct.send_block(0x2001, &[cycle]).is_ok() {
            bail!("cycle {cycle}: send succeeded on disabled channel");
        }
    }

    info!(
        "{} cycles completed, {} round trips survived",
        cycles,
        survivors.lock().unwrap_or_else(|e| e.into_inner())
    );
    println!("{}", ct.snapshot_capture(false));
    Ok(())
}
