use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::zones::Zone;
use crate::models::{Side, StrategyMode, Trend};

/// Unweighted components, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub zone: f64,
    pub reaction: f64,
    pub alignment: f64,
    pub htf_zone: f64,
    pub freshness: f64,
    #[serde(default)]
    pub indicators: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub side: Side,
    pub confluence_score: f64,
    pub zone: Zone,
    pub mode: StrategyMode,
    pub timestamp: DateTime<Utc>,
    /// Every trend timeframe agrees with `side`.
    pub aligned: bool,
    pub fresh_flip: bool,
    /// Counter-zone entry after a failed breakout.
    #[serde(default)]
    pub reversal: bool,
    /// Trend of the context timeframe when one is configured.
    #[serde(default)]
    pub context: Option<Trend>,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub breakdown: ScoreBreakdown,
    pub reason: String,
}

impl Signal {
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}
