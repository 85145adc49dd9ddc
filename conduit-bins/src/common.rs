//! Common utilities for all binaries
//!
//! Shared initialization, CLI parsing, and setup code.

use anyhow::Result;
use clap::Args;
use conduit_core::monitoring::MetricsSnapshot;
use conduit_core::utils::init_logger;
use conduit_core::ConnectivityConfig;
use std::path::PathBuf;

/// Common CLI arguments for all binaries
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// JSON configuration file; defaults plus CONDUIT_* variables when omitted
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    pub json_logs: bool,

    /// Print Prometheus metrics on exit
    #[arg(long)]
    pub metrics: bool,
}

/// Load configuration and apply CLI overrides
pub fn load_config(args: &CommonArgs) -> Result<ConnectivityConfig> {
    let mut config = match &args.config {
        Some(path) => ConnectivityConfig::load(path)?,
        None => ConnectivityConfig::from_env()?,
    };

    if let Some(level) = &args.log_level {
        config.logging.log_level = level.clone();
    }
    if args.json_logs {
        config.logging.json_logs = true;
    }
    config.validate()?;

    Ok(config)
}

/// Initialize tracing/logging
pub fn init_logging(config: &ConnectivityConfig) -> Result<()> {
    init_logger(&config.logging.log_level, config.logging.json_logs)
}

/// Print final statistics
pub fn print_stats(stats: &MetricsSnapshot) {
    tracing::info!("=== Connection {} ===", stats.connection_id);
    tracing::info!("Consumed: {}", stats.inbound_consumed);
    tracing::info!("Settled: {}", stats.inbound_settled);
    tracing::info!(
        "Rejected: {} redelivered, {} dropped",
        stats.inbound_rejected_redeliver,
        stats.inbound_rejected_drop
    );
    tracing::info!("Dropped on backpressure: {}", stats.inbound_dropped_backpressure);
    tracing::info!("Published: {} ({} failed)", stats.outbound_published, stats.outbound_failed);
    tracing::info!("Reconnect attempts: {}", stats.reconnect_attempts);

    let decided = stats.inbound_settled + stats.inbound_rejected_redeliver + stats.inbound_rejected_drop;
    if decided > 0 {
        let settle_rate = (stats.inbound_settled as f64 / decided as f64) * 100.0;
        tracing::info!("Settle rate: {:.2}%", settle_rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_log_level() {
        let args = CommonArgs {
            config: None,
            log_level: Some("debug".to_string()),
            json_logs: true,
            metrics: false,
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.logging.log_level, "debug");
        assert!(config.logging.json_logs);
    }

    #[test]
    fn test_invalid_cli_log_level_rejected() {
        let args = CommonArgs {
            config: None,
            log_level: Some("loud".to_string()),
            json_logs: false,
            metrics: false,
        };
        assert!(load_config(&args).is_err());
    }
}
