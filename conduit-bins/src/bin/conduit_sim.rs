//! Simulated connectivity run
//!
//! Spawns a number of managed connections against randomized in-process
//! brokers, plays the platform side (acknowledging inbound signals and
//! publishing outbound ones) and reports per-connection statistics.

use anyhow::{ensure, Result};
use clap::Parser;
use conduit_bins::common::{init_logging, load_config, print_stats, CommonArgs};
use conduit_bins::simulated::{roll, JsonMapper, SettlementCounters, SimulatedDriver, SimulationConfig};
use conduit_core::ack::{Acknowledgement, CollectedOutcome};
use conduit_core::core::{AckLabel, ConnectionSpec, OutboundSignal, SourceSpec, TargetSpec};
use conduit_core::dispatch::ForwardedSignal;
use conduit_core::{ConnectionActor, ConnectionHandle};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run managed connections against simulated brokers")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Number of connections
    #[arg(long, default_value_t = 2)]
    connections: usize,

    /// Inbound messages per consumer and second
    #[arg(long, default_value_t = 5)]
    rate: u64,

    #[arg(long, default_value_t = 0.2)]
    connect_failure_rate: f64,

    /// Chance per second that an established connection drops
    #[arg(long, default_value_t = 0.02)]
    drop_probability: f64,

    /// Chance that the platform answers an acknowledgement with 503
    #[arg(long, default_value_t = 0.05)]
    ack_failure_rate: f64,

    #[arg(long, default_value_t = 0.05)]
    publish_failure_rate: f64,

    /// Outbound signals published per connection and second
    #[arg(long, default_value_t = 1)]
    publish_rate: u64,

    /// Stop after this many seconds (default: until Ctrl+C)
    #[arg(long)]
    duration_secs: Option<u64>,

    #[arg(long, default_value_t = 10)]
    report_interval_secs: u64,
}

impl Args {
    fn validate(&self) -> Result<()> {
        ensure!(self.connections > 0, "--connections must be at least 1");
        for (name, rate) in [
            ("--connect-failure-rate", self.connect_failure_rate),
            ("--drop-probability", self.drop_probability),
            ("--ack-failure-rate", self.ack_failure_rate),
            ("--publish-failure-rate", self.publish_failure_rate),
        ] {
            ensure!((0.0..=1.0).contains(&rate), "{name} must be between 0 and 1, got {rate}");
        }
        Ok(())
    }

    fn simulation(&self) -> SimulationConfig {
        SimulationConfig {
            connect_failure_rate: self.connect_failure_rate,
            drop_probability: self.drop_probability,
            publish_failure_rate: self.publish_failure_rate,
            messages_per_second: self.rate,
            ..Default::default()
        }
    }
}

fn simulated_spec(index: usize) -> ConnectionSpec {
    let id = format!("sim-{index}");
    let mut spec = ConnectionSpec::new(id.clone(), "simulated", format!("sim://broker-{index}:5672"));
    spec.sources.push(SourceSpec {
        addresses: vec![format!("{id}.telemetry")],
        consumer_count: 1,
    });
    spec.targets.push(TargetSpec {
        address: format!("{id}.events"),
        topics: vec![],
        issued_ack_label: Some(AckLabel::new(format!("{id}-published"))),
    });
    spec.announce_close = true;
    spec
}

/// Answer every requested acknowledgement, failing some at random
async fn run_platform(handle: ConnectionHandle, mut forwarded: mpsc::UnboundedReceiver<ForwardedSignal>, failure_rate: f64) {
    while let Some(ForwardedSignal {
        signal,
        acknowledgements,
    }) = forwarded.recv().await
    {
        if acknowledgements.is_none() {
            continue;
        }
        for label in &signal.requested_acks {
            let status = if roll(failure_rate) { 503 } else { 200 };
            handle.acknowledge(Acknowledgement::new(Some(label.clone()), signal.correlation_id.clone(), status));
        }
    }
}

/// Publish a heartbeat signal periodically and tally its acknowledgements
async fn run_publisher(handle: ConnectionHandle, per_second: u64) {
    let (tx, mut responses) = mpsc::unbounded_channel();
    let mut ticker = tokio::time::interval(Duration::from_millis(1000 / per_second.max(1)));
    let mut sequence: u64 = 0;
    let (mut acked, mut failed) = (0u64, 0u64);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                let signal = OutboundSignal::new("simulation.heartbeat", json!({ "sequence": sequence }))
                    .with_responses(tx.clone());
                if !handle.publish(signal) {
                    return;
                }
            }
            Some(outcome) = responses.recv() => {
                match outcome {
                    CollectedOutcome::Acknowledgement(ack) if ack.is_success() => acked += 1,
                    _ => failed += 1,
                }
                if (acked + failed) % 100 == 0 {
                    info!(connection_id = %handle.connection_id(), acked, failed, "Publish acknowledgements");
                }
            }
        }
    }
}

async fn report(handles: &[ConnectionHandle]) {
    for handle in handles {
        match handle.retrieve_status().await {
            Ok(status) => info!(
                connection_id = %status.connection_id,
                live = %status.live_status,
                recovery = ?status.recovery_status,
                failures = status.failure_count,
                "Connection status"
            ),
            Err(failure) => warn!(%failure, "Status retrieval failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;
    let config = Arc::new(load_config(&args.common)?);
    init_logging(&config)?;

    info!("=== Conduit Simulated Connectivity ===");
    info!("Connections: {}", args.connections);
    info!("Inbound rate: {} msg/s per consumer", args.rate);
    info!(
        "Failure rates: connect {:.2}, drop {:.2}/s, ack {:.2}, publish {:.2}",
        args.connect_failure_rate, args.drop_probability, args.ack_failure_rate, args.publish_failure_rate
    );
    info!("Max reconnect tries: {}", config.client.max_tries);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down...");
        let _ = shutdown_tx.send(true);
    })?;

    let counters = Arc::new(SettlementCounters::default());
    let mapper = Arc::new(JsonMapper);
    let mut handles = Vec::with_capacity(args.connections);
    let mut tasks = Vec::new();

    for index in 0..args.connections {
        let spec = simulated_spec(index);
        let driver = Arc::new(SimulatedDriver::new(args.simulation(), counters.clone()));
        let (tx, forwarded) = mpsc::unbounded_channel();
        let handle = ConnectionActor::spawn(spec.clone(), driver, mapper.clone(), tx, config.clone())?;

        match handle.test(spec).await {
            Ok(_) => info!(connection_id = %handle.connection_id(), "Connection test passed"),
            Err(failure) => warn!(%failure, "Connection test failed"),
        }
        match handle.open().await {
            Ok(_) => info!(connection_id = %handle.connection_id(), "Connection open"),
            Err(failure) => warn!(%failure, "Open failed, connection stays manageable"),
        }

        tasks.push(tokio::spawn(run_platform(handle.clone(), forwarded, args.ack_failure_rate)));
        if args.publish_rate > 0 {
            tasks.push(tokio::spawn(run_publisher(handle.clone(), args.publish_rate)));
        }
        handles.push(handle);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
    ticker.tick().await;
    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = ticker.tick() => report(&handles).await,
            _ = &mut deadline => {
                info!("Simulation duration elapsed");
                break;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    for handle in &handles {
        match handle.retrieve_metrics().await {
            Ok(stats) => {
                print_stats(&stats);
                if args.common.metrics {
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
            Err(failure) => warn!(%failure, "Metrics retrieval failed"),
        }
    }

    for handle in &handles {
        if let Err(failure) = handle.shutdown().await {
            warn!(%failure, "Shutdown failed");
        }
        if tokio::time::timeout(Duration::from_secs(5), handle.terminated()).await.is_err() {
            warn!(connection_id = %handle.connection_id(), "Connection did not terminate");
        }
    }
    for task in tasks {
        task.abort();
    }

    let (settled, redelivered, dropped) = counters.snapshot();
    info!("=== Sources ===");
    info!("Settled: {settled}, redelivered: {redelivered}, dropped: {dropped}");
    info!("Simulation stopped");

    Ok(())
}
