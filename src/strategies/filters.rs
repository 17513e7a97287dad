//! Indicator confirmations on the entry timeframe.

use serde::{Deserialize, Serialize};

use crate::config::IndicatorConfig;
use crate::core::indicators::{macd, rsi, vwap};
use crate::models::{CandleSeries, Side};

/// Which indicators agree with a side. Missing data never confirms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IndicatorVotes {
    pub macd: bool,
    pub rsi: bool,
    pub vwap: bool,
}

impl IndicatorVotes {
    pub fn evaluate(bars: &CandleSeries, price: f64, side: Side, cfg: &IndicatorConfig) -> Self {
        let closes = bars.closes();
        Self {
            macd: macd_cross(&closes, side, cfg),
            rsi: rsi_confirms(&closes, side, cfg),
            vwap: vwap(bars.as_slice()).is_some_and(|v| match side {
                Side::Buy => price > v,
                Side::Sell => price < v,
            }),
        }
    }

    pub fn all(&self) -> bool {
        self.macd && self.rsi && self.vwap
    }

    pub fn fraction(&self) -> f64 {
        [self.macd, self.rsi, self.vwap].iter().filter(|v| **v).count() as f64 / 3.0
    }
}

/// MACD line crossed its signal line on the latest bar.
fn macd_cross(closes: &[f64], side: Side, cfg: &IndicatorConfig) -> bool {
    let Some(m) = macd(closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal) else {
        return false;
    };
    let n = m.line.len();
    if n < 2 {
        return false;
    }
    let (prev, curr) = (m.line[n - 2] - m.signal[n - 2], m.line[n - 1] - m.signal[n - 1]);
    match side {
        Side::Buy => prev < 0.0 && curr > 0.0,
        Side::Sell => prev > 0.0 && curr < 0.0,
    }
}

/// Oversold or rising for buys, overbought or falling for sells.
fn rsi_confirms(closes: &[f64], side: Side, cfg: &IndicatorConfig) -> bool {
    let values = rsi(closes, cfg.rsi_period);
    let [.., prev, curr] = values.as_slice() else {
        return false;
    };
    match side {
        Side::Buy => *curr < cfg.rsi_oversold || curr > prev,
        Side::Sell => *curr > cfg.rsi_overbought || curr < prev,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{default_test_config, make_candles};

    fn series(closes: &[f64]) -> CandleSeries {
        let data: Vec<(f64, f64, f64, f64)> = closes.iter().map(|&c| (c, c + 0.5, c - 0.5, c)).collect();
        make_candles(&data)
    }

    #[test]
    fn short_history_confirms_nothing() {
        let cfg = default_test_config().indicators;
        let bars = series(&[100.0, 101.0, 102.0]);
        let votes = IndicatorVotes::evaluate(&bars, 101.5, Side::Buy, &cfg);
        assert!(!votes.macd);
        assert!(!votes.rsi);
        // VWAP needs only volume.
        assert!(votes.vwap);
        assert!((votes.fraction() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn macd_crosses_up_after_decline_reverses() {
        let cfg = default_test_config().indicators;
        let mut closes: Vec<f64> = (0..40).map(|i| 140.0 - i as f64).collect();
        let bars = series(&closes);
        assert!(!IndicatorVotes::evaluate(&bars, 100.0, Side::Buy, &cfg).macd);

        // Sharp rally: the first bar where the line clears the signal.
        let mut crossed = false;
        for i in 0..15 {
            closes.push(101.0 + 3.0 * i as f64);
            let m = macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal).unwrap();
            let n = m.line.len();
            if m.line[n - 1] > m.signal[n - 1] {
                crossed = true;
                assert!(IndicatorVotes::evaluate(&series(&closes), 150.0, Side::Buy, &cfg).macd);
                assert!(!IndicatorVotes::evaluate(&series(&closes), 150.0, Side::Sell, &cfg).macd);
                break;
            }
        }
        assert!(crossed);
    }

    #[test]
    fn rsi_and_vwap_follow_direction() {
        let cfg = default_test_config().indicators;
        let mut closes: Vec<f64> = (0..25).map(|i| 100.0 + i as f64).collect();
        closes.extend([123.0, 126.0]);
        let bars = series(&closes);
        let buy = IndicatorVotes::evaluate(&bars, 126.0, Side::Buy, &cfg);
        assert!(buy.rsi);
        assert!(buy.vwap);
        let sell = IndicatorVotes::evaluate(&bars, 126.0, Side::Sell, &cfg);
        // Still overbought after the dip.
        assert!(sell.rsi);
        assert!(!sell.vwap);
        assert!(!sell.all());
    }
}
