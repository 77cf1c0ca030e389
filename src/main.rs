//! CLI entry point. Hand-rolled argument parsing, matching the
//! teacher's `CLI/src/main.rs` style (`args.iter().any(...)` flag
//! checks) rather than pulling in an argument-parsing crate for three
//! subcommands.

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use tlscope::config::Config;
use tlscope::events::RuntimeEvent;
use tlscope::graph::TopologyGraph;
use tlscope::log as tlscope_log;
use tlscope::persistence::NoopSink;
use tlscope::runtime::{self, StartOptions};

fn usage() -> &'static str {
    "usage:\n  \
     tlscope scan [--subnet A.B.C] [--start N] [--end M] [--timeout MS] [--concurrency N]\n  \
     tlscope start [--username X] [--interface I] [--no-capture]\n  \
     tlscope uitest [Simple|Complex|StressTest]"
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().cloned() else {
        eprintln!("{}", usage());
        std::process::exit(1);
    };

    let cfg = Config::load_or_default();
    if let Err(e) = tlscope_log::setup_logger(&cfg.logging) {
        eprintln!("failed to initialize logging: {e}");
    }

    let result = match command.as_str() {
        "scan" => run_scan_command(&args[1..], cfg).await,
        "start" => run_start_command(&args[1..], cfg).await,
        "uitest" => run_uitest_command(&args[1..]),
        _ => {
            eprintln!("unknown command: {command}\n{}", usage());
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        log::error!("fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run_scan_command(args: &[String], mut cfg: Config) -> Result<()> {
    let args: Vec<String> = args.to_vec();
    if let Some(subnet) = arg_value(&args, "--subnet") {
        cfg.scan.subnet = Some(subnet);
    }
    if let Some(start) = arg_value(&args, "--start") {
        cfg.scan.host_range_start = start.parse().map_err(|_| anyhow::anyhow!("--start must be 0-255"))?;
    }
    if let Some(end) = arg_value(&args, "--end") {
        cfg.scan.host_range_end = end.parse().map_err(|_| anyhow::anyhow!("--end must be 0-255"))?;
    }
    if let Some(timeout) = arg_value(&args, "--timeout") {
        cfg.scan.timeout_ms = timeout.parse().map_err(|_| anyhow::anyhow!("--timeout must be an integer number of ms"))?;
    }
    if let Some(concurrency) = arg_value(&args, "--concurrency") {
        cfg.scan.concurrency = concurrency.parse().map_err(|_| anyhow::anyhow!("--concurrency must be a positive integer"))?;
    }
    if cfg.scan.host_range_start > cfg.scan.host_range_end {
        bail!("--start must not be greater than --end");
    }

    let graph = Arc::new(Mutex::new(TopologyGraph::new()));
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<RuntimeEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_scan_event(&event);
        }
    });

    let summary = runtime::run_scan(&cfg, graph, events_tx).await;
    let _ = printer.await;

    println!(
        "scan complete: {}/{} hosts responded on {} in {} ms",
        summary.responsive_hosts, summary.total_scanned, summary.subnet, summary.duration_ms
    );
    Ok(())
}

fn print_scan_event(event: &RuntimeEvent) {
    match event {
        RuntimeEvent::ScanStarted { subnet, total_hosts } => {
            println!("scanning {subnet} ({total_hosts} hosts)");
        }
        RuntimeEvent::ScanHostResponded { ip, rtt_ms } => {
            println!("  {ip} responded in {rtt_ms} ms");
        }
        RuntimeEvent::Log(log_event) => {
            log::log!(log_event.level, "{}", log_event.message);
        }
        _ => {}
    }
}

async fn run_start_command(args: &[String], mut cfg: Config) -> Result<()> {
    let args: Vec<String> = args.to_vec();
    if let Some(username) = arg_value(&args, "--username") {
        cfg.overlay.username = username;
    }
    if let Some(interface) = arg_value(&args, "--interface") {
        cfg.capture.interface = Some(interface);
    }
    let no_capture = args.iter().any(|a| a == "--no-capture");

    let handle = tokio::runtime::Handle::current();
    let (runtime_handle, mut events_rx) = runtime::spawn_runtime(&handle, Box::new(NoopSink));

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_runtime_event(&event);
        }
    });

    runtime_handle.start(StartOptions { config: cfg, no_capture }).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    runtime_handle.shutdown().await?;
    let _ = printer.await;
    Ok(())
}

fn print_runtime_event(event: &RuntimeEvent) {
    match event {
        RuntimeEvent::Status(status) => println!("[status] {status}"),
        RuntimeEvent::DeviceDiscovered { key } => println!("[device] discovered {key}"),
        RuntimeEvent::DeviceUpdated { key } => println!("[device] updated {key}"),
        RuntimeEvent::ConnectionDetected { source, destination, protocol } => {
            println!("[connection] {source} -> {destination} ({protocol})");
        }
        RuntimeEvent::GatewayChanged { key, role } => println!("[gateway] {key} is now {role}"),
        RuntimeEvent::PeerDiscovered { username, ip } => println!("[peer] discovered {username} at {ip}"),
        RuntimeEvent::PeerConnected { username } => println!("[peer] connected {username}"),
        RuntimeEvent::PeerDisconnected { username } => println!("[peer] disconnected {username}"),
        RuntimeEvent::PeerVerified { username } => println!("[peer] verified {username}"),
        RuntimeEvent::PeerRejected { username, reason } => println!("[peer] rejected {username}: {reason}"),
        RuntimeEvent::Error(message) => log::error!("{message}"),
        RuntimeEvent::Log(log_event) => log::log!(log_event.level, "{}", log_event.message),
        RuntimeEvent::ScanStarted { .. } | RuntimeEvent::ScanHostResponded { .. } | RuntimeEvent::ScanCompleted { .. } => {}
    }
}

/// The interactive terminal UI is an external collaborator built on top
/// of this library's event stream; this subcommand only validates its
/// argument and confirms the chosen scenario exists, so scripts that
/// smoke-test the CLI surface still get a meaningful exit code.
fn run_uitest_command(args: &[String]) -> Result<()> {
    let scenario = args.first().map(String::as_str).unwrap_or("Simple");
    match scenario {
        "Simple" | "Complex" | "StressTest" => {
            println!("uitest scenario '{scenario}' is handled by the external terminal UI, not the core library");
            Ok(())
        }
        other => bail!("unknown uitest scenario: {other} (expected Simple, Complex, or StressTest)"),
    }
}
