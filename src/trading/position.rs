use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ExecutionConfig;
use crate::models::{CloseReason, OrderStatus, Side, StrategyMode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub client_tag: String,
    pub side: Side,
    pub lot_size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub status: OrderStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub broker_order_id: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// A filled order under management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Client tag of the order that opened it.
    pub order_ref: String,
    pub position_id: String,
    pub side: Side,
    pub lot_size: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Last stop set by trailing, if trailing has started.
    pub trailing_stop_price: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub mode: Option<StrategyMode>,
    pub score: Option<f64>,
    pub reason: String,
    /// Account value of a one-unit price move for the whole position size.
    pub value_per_point: f64,
}

impl Position {
    pub fn unrealized(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.side.sign() * self.value_per_point
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub position: Position,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    pub fn is_win(&self) -> bool {
        self.pnl > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingSettings {
    /// Favourable move before trailing starts.
    pub trigger: f64,
    /// Minimum advance per update.
    pub step: f64,
    /// Gap kept between price and the stop.
    pub distance: f64,
}

impl From<&ExecutionConfig> for TrailingSettings {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            trigger: cfg.trailing_trigger,
            step: cfg.trailing_step,
            distance: cfg.trailing_distance,
        }
    }
}

/// New stop for a position, or `None` when it should stay put. The result
/// is always at least one step more favourable than `current_stop`.
pub fn next_trailing_stop(
    side: Side,
    entry: f64,
    current_stop: f64,
    price: f64,
    settings: &TrailingSettings,
) -> Option<f64> {
    let s = side.sign();
    let profit = (price - entry) * s;
    if profit < settings.trigger {
        return None;
    }
    let candidate = price - s * settings.distance;
    let advance = (candidate - current_stop) * s;
    if advance >= settings.step && advance > 0.0 {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: TrailingSettings = TrailingSettings {
        trigger: 3.0,
        step: 1.0,
        distance: 1.0,
    };

    #[test]
    fn waits_for_trigger() {
        assert_eq!(next_trailing_stop(Side::Buy, 100.0, 98.0, 102.5, &T), None);
        assert_eq!(next_trailing_stop(Side::Buy, 100.0, 98.0, 103.0, &T), Some(102.0));
        assert_eq!(next_trailing_stop(Side::Sell, 100.0, 102.0, 97.0, &T), Some(98.0));
    }

    #[test]
    fn requires_full_step() {
        assert_eq!(next_trailing_stop(Side::Buy, 100.0, 102.0, 103.5, &T), None);
        assert_eq!(next_trailing_stop(Side::Buy, 100.0, 102.0, 104.0, &T), Some(103.0));
    }

    #[test]
    fn stop_never_loosens_over_any_path() {
        // Deterministic pseudo-random walk for both sides.
        for side in [Side::Buy, Side::Sell] {
            let mut seed: u64 = 0x2545_F491_4F6C_DD1D;
            let entry = 1000.0;
            let mut stop = entry - side.sign() * 20.0;
            let mut price = entry;
            for _ in 0..5000 {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let delta = (seed % 2001) as f64 / 100.0 - 10.0;
                price += delta;
                if let Some(next) = next_trailing_stop(side, entry, stop, price, &T) {
                    assert!((next - stop) * side.sign() >= T.step - 1e-9);
                    stop = next;
                }
            }
        }
    }
}
