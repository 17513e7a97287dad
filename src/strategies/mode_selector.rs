use serde::{Deserialize, Serialize};

use crate::config::{AdaptiveConfig, Config};
use crate::models::StrategyMode;
use crate::strategies::signals::Signal;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    Act,
    Hold(String),
}

impl Decision {
    pub fn is_act(&self) -> bool {
        matches!(self, Decision::Act)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeThresholds {
    pub trend_follow: f64,
    pub aggressive: f64,
}

impl ModeThresholds {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            trend_follow: cfg.trend_follow_threshold,
            aggressive: cfg.aggressive_threshold,
        }
    }

    /// Shift both thresholds by ATR relative to the proximity band: volatile
    /// markets need less confluence, quiet ones more.
    pub fn adapted(&self, atr: f64, proximity: f64, cfg: &AdaptiveConfig) -> Self {
        if cfg.shift <= 0.0 || proximity <= 0.0 || !atr.is_finite() {
            return *self;
        }
        let ratio = atr / proximity;
        let delta = if ratio >= cfg.high_ratio {
            -cfg.shift
        } else if ratio <= cfg.low_ratio {
            cfg.shift
        } else {
            return *self;
        };
        Self {
            trend_follow: (self.trend_follow + delta).clamp(0.0, 1.0),
            aggressive: (self.aggressive + delta).clamp(0.0, 1.0),
        }
    }
}

/// Trend-follow needs every trend timeframe aligned and the higher
/// threshold. Aggressive acts on the trading timeframe alone once the lower
/// threshold is met. In both modes the context trend must not oppose the
/// entry, and a reversal needs it to agree outright.
pub fn decide(signal: &Signal, mode: StrategyMode, thresholds: &ModeThresholds) -> Decision {
    let score = signal.confluence_score;
    let floor = thresholds.trend_follow.min(thresholds.aggressive);
    if score < floor {
        return Decision::Hold(format!("score {:.2} below {:.2}", score, floor));
    }

    if let Some(context) = signal.context {
        let agrees = context.to_side() == Some(signal.side);
        if signal.reversal && !agrees {
            return Decision::Hold(format!("context trend {} does not confirm reversal", context));
        }
        if context.to_side().is_some_and(|s| s != signal.side) {
            return Decision::Hold(format!("context trend {} opposes {}", context, signal.side));
        }
    }

    match mode {
        StrategyMode::TrendFollow => {
            if !signal.aligned {
                Decision::Hold("trend timeframes not aligned".to_string())
            } else if score < thresholds.trend_follow {
                Decision::Hold(format!(
                    "score {:.2} below trend-follow threshold {:.2}",
                    score, thresholds.trend_follow
                ))
            } else {
                Decision::Act
            }
        }
        StrategyMode::Aggressive => {
            if score < thresholds.aggressive {
                Decision::Hold(format!(
                    "score {:.2} below aggressive threshold {:.2}",
                    score, thresholds.aggressive
                ))
            } else {
                Decision::Act
            }
        }
    }
}
