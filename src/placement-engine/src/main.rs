//! Placement Engine: marketplace ad-slot allocation with second-price
//! charging, seller wallets, and campaign budgets.
//!
//! The binary replays marketplace fixtures end to end and validates slot
//! targeting rules before they are deployed.

mod simulate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use placement_core::config::AppConfig;
use placement_core::event_bus::{EventSink, PlacementEvent};
use placement_core::rules::RuleExpr;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "placement-engine")]
#[command(about = "Marketplace ad placement engine: slot auctions, wallets, and budgets")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); environment variables override it
    #[arg(long, global = true, env = "PLACEMENT_ENGINE_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, global = true, env = "PLACEMENT_ENGINE__NODE_ID")]
    node_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a marketplace fixture through allocation and settlement
    Simulate {
        #[arg(long)]
        fixture: PathBuf,

        /// Pretty-print the JSON summary
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
    /// Check a slot targeting rule written as JSON
    ValidateRule {
        #[arg(long)]
        file: PathBuf,
    },
}

/// Forwards placement events to the log.
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: PlacementEvent) {
        debug!(
            event_type = ?event.event_type,
            subject = %event.subject,
            detail = %event.detail,
            "Placement event"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "placement_engine=info,placement_billing=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    config.validate()?;

    info!(
        node_id = %config.node_id,
        quality_weight = config.auction.quality_weight,
        relevance_weight = config.auction.relevance_weight,
        warning_threshold_pct = config.budget.warning_threshold_pct,
        metrics_enabled = config.metrics.enabled,
        "Configuration loaded"
    );

    if config.metrics.enabled {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics.port))
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(port = config.metrics.port, "Prometheus exporter listening");
    }

    match cli.command {
        Command::Simulate { fixture, pretty } => {
            let raw = std::fs::read_to_string(&fixture)
                .with_context(|| format!("failed to read fixture {}", fixture.display()))?;
            let fixture = simulate::Fixture::from_json(&raw)?;
            let summary = simulate::run(fixture, &config, Arc::new(LogSink)).await?;
            let out = if pretty {
                serde_json::to_string_pretty(&summary)?
            } else {
                serde_json::to_string(&summary)?
            };
            println!("{out}");
        }
        Command::ValidateRule { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read rule {}", file.display()))?;
            RuleExpr::from_json(&raw)?;
            info!(file = %file.display(), "Rule is valid");
            println!("OK");
        }
    }

    Ok(())
}
