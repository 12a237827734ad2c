use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{PlacementError, PlacementResult};

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `PLACEMENT_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub auction: AuctionConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuctionConfig {
    /// Weight of normalized quality in the rank multiplier.
    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,
    /// Weight of request relevance in the rank multiplier.
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,
    /// Lower bound on the rank multiplier so rank always grows with bid.
    #[serde(default = "default_min_weighted_quality")]
    pub min_weighted_quality: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualityConfig {
    /// Pseudo-impressions of prior evidence added to every ad's CTR.
    #[serde(default = "default_prior_impressions")]
    pub prior_impressions: f64,
    /// Pseudo-clicks of prior evidence added to every ad's conversion rate.
    #[serde(default = "default_prior_clicks")]
    pub prior_clicks: f64,
    /// CTR (fraction) that maps to the neutral historical score of 5.
    #[serde(default = "default_target_ctr")]
    pub target_ctr: f64,
    /// Conversion rate (fraction) that maps to the neutral score of 5.
    #[serde(default = "default_target_cvr")]
    pub target_cvr: f64,
    /// Impressions at which history and creative carry equal weight.
    #[serde(default = "default_confidence_impressions")]
    pub confidence_impressions: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_warning_threshold_pct")]
    pub warning_threshold_pct: f64,
    /// Remaining budget at or below which eligibility treats a campaign as
    /// exhausted, covering spend that lands between snapshot refreshes.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    #[serde(default = "default_snapshot_refresh_ms")]
    pub snapshot_refresh_ms: u64,
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    /// How long a confirmation event id is remembered for duplicate
    /// detection. Replays older than this are treated as new events.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "placement-01".to_string()
}
fn default_quality_weight() -> f64 {
    0.7
}
fn default_relevance_weight() -> f64 {
    0.3
}
fn default_min_weighted_quality() -> f64 {
    0.01
}
fn default_prior_impressions() -> f64 {
    100.0
}
fn default_prior_clicks() -> f64 {
    10.0
}
fn default_target_ctr() -> f64 {
    0.02
}
fn default_target_cvr() -> f64 {
    0.05
}
fn default_confidence_impressions() -> f64 {
    1000.0
}
fn default_warning_threshold_pct() -> f64 {
    80.0
}
fn default_safety_margin() -> f64 {
    0.0
}
fn default_snapshot_refresh_ms() -> u64 {
    500
}
fn default_max_cas_retries() -> u32 {
    5
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_dedup_window_secs() -> u64 {
    86_400
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            quality_weight: default_quality_weight(),
            relevance_weight: default_relevance_weight(),
            min_weighted_quality: default_min_weighted_quality(),
        }
    }
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            prior_impressions: default_prior_impressions(),
            prior_clicks: default_prior_clicks(),
            target_ctr: default_target_ctr(),
            target_cvr: default_target_cvr(),
            confidence_impressions: default_confidence_impressions(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            warning_threshold_pct: default_warning_threshold_pct(),
            safety_margin: default_safety_margin(),
            snapshot_refresh_ms: default_snapshot_refresh_ms(),
            max_cas_retries: default_max_cas_retries(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
            default_currency: default_currency(),
        }
    }
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            auction: AuctionConfig::default(),
            quality: QualityConfig::default(),
            budget: BudgetConfig::default(),
            wallet: WalletConfig::default(),
            settlement: SettlementConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl BudgetConfig {
    pub fn safety_margin_decimal(&self) -> Decimal {
        Decimal::from_f64(self.safety_margin).unwrap_or(Decimal::ZERO)
    }

    pub fn warning_threshold_decimal(&self) -> Decimal {
        Decimal::from_f64(self.warning_threshold_pct).unwrap_or(Decimal::from(80))
    }
}

impl AppConfig {
    /// Load configuration from an optional TOML file, then environment variables.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("PLACEMENT_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn validate(&self) -> PlacementResult<()> {
        let a = &self.auction;
        if a.quality_weight < 0.0 || a.relevance_weight < 0.0 {
            return Err(PlacementError::Config(
                "auction weights must be non-negative".into(),
            ));
        }
        if ((a.quality_weight + a.relevance_weight) - 1.0).abs() > 1e-9 {
            return Err(PlacementError::Config(format!(
                "auction weights must sum to 1, got {} + {}",
                a.quality_weight, a.relevance_weight
            )));
        }
        if !(a.min_weighted_quality > 0.0 && a.min_weighted_quality <= 1.0) {
            return Err(PlacementError::Config(
                "min_weighted_quality must be in (0, 1]".into(),
            ));
        }
        let q = &self.quality;
        if q.target_ctr <= 0.0 || q.target_cvr <= 0.0 {
            return Err(PlacementError::Config("quality targets must be positive".into()));
        }
        if q.prior_impressions <= 0.0 || q.prior_clicks <= 0.0 || q.confidence_impressions <= 0.0 {
            return Err(PlacementError::Config(
                "quality prior and confidence masses must be positive".into(),
            ));
        }
        let b = &self.budget;
        if !(b.warning_threshold_pct > 0.0 && b.warning_threshold_pct < 100.0) {
            return Err(PlacementError::Config(
                "budget warning threshold must be in (0, 100)".into(),
            ));
        }
        if b.safety_margin < 0.0 || !b.safety_margin.is_finite() {
            return Err(PlacementError::Config("budget safety margin must be >= 0".into()));
        }
        if self.wallet.max_cas_retries == 0 || b.max_cas_retries == 0 {
            return Err(PlacementError::Config("CAS retries must be at least 1".into()));
        }
        if self.settlement.dedup_window_secs == 0 {
            return Err(PlacementError::Config(
                "settlement dedup window must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}
