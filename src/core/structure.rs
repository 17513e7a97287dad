use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TrendConfig;
use crate::core::indicators::sma;
use crate::models::{Candle, CandleSeries, SwingType, Timeframe, Trend};

/// A swing extreme, usable once `lookback` bars have closed after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Swing {
    pub index: usize,
    pub kind: SwingType,
    pub price: f64,
}

/// Current direction of one timeframe, recomputed every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendState {
    pub timeframe: Timeframe,
    pub direction: Trend,
    pub as_of: DateTime<Utc>,
}

/// Breaks of structure considered when voting on direction.
const RECENT_BREAKS: usize = 3;

pub fn swings(bars: &[Candle], lookback: usize) -> Vec<Swing> {
    if bars.len() <= lookback * 2 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for i in lookback..bars.len() - lookback {
        if is_swing(bars, i, lookback, SwingType::High) {
            out.push(Swing {
                index: i,
                kind: SwingType::High,
                price: bars[i].high,
            });
        }
        if is_swing(bars, i, lookback, SwingType::Low) {
            out.push(Swing {
                index: i,
                kind: SwingType::Low,
                price: bars[i].low,
            });
        }
    }
    out
}

/// Majority of the last few breaks of structure. A close beyond the latest
/// confirmed swing high is a bullish break, beyond the latest swing low a
/// bearish one; each level breaks at most once.
pub fn structure_trend(bars: &[Candle], lookback: usize) -> Trend {
    let mut pending = swings(bars, lookback).into_iter().peekable();
    let mut high: Option<f64> = None;
    let mut low: Option<f64> = None;
    let mut breaks: Vec<Trend> = Vec::new();

    for (i, bar) in bars.iter().enumerate() {
        while let Some(s) = pending.next_if(|s| s.index + lookback <= i) {
            match s.kind {
                SwingType::High => high = Some(s.price),
                SwingType::Low => low = Some(s.price),
            }
        }
        if high.is_some_and(|h| bar.close > h) {
            breaks.push(Trend::Up);
            high = None;
        }
        if low.is_some_and(|l| bar.close < l) {
            breaks.push(Trend::Down);
            low = None;
        }
    }

    let recent = &breaks[breaks.len().saturating_sub(RECENT_BREAKS)..];
    let up = recent.iter().filter(|t| **t == Trend::Up).count();
    let down = recent.len() - up;
    match up.cmp(&down) {
        std::cmp::Ordering::Greater => Trend::Up,
        std::cmp::Ordering::Less => Trend::Down,
        std::cmp::Ordering::Equal => Trend::Flat,
    }
}

/// Bar `i` is the extreme of the `lb` bars on either side (ties allowed).
pub fn is_swing(bars: &[Candle], i: usize, lb: usize, kind: SwingType) -> bool {
    let lo = i.saturating_sub(lb);
    let hi = (i + lb).min(bars.len().saturating_sub(1));
    match kind {
        SwingType::High => bars[lo..=hi].iter().all(|c| c.high <= bars[i].high),
        SwingType::Low => bars[lo..=hi].iter().all(|c| c.low >= bars[i].low),
    }
}

/// Close relative to its moving average, with a relative dead band.
pub fn ma_trend(candles: &CandleSeries, period: usize, flat_band: f64) -> Trend {
    let closes = candles.closes();
    let (Some(ma), Some(close)) = (sma(&closes, period), closes.last().copied()) else {
        return Trend::Flat;
    };
    if close > ma * (1.0 + flat_band) {
        Trend::Up
    } else if close < ma * (1.0 - flat_band) {
        Trend::Down
    } else {
        Trend::Flat
    }
}

/// A flat average wins; structure without breaks defers to the average;
/// opposing reads cancel out.
pub fn combine_trends(ma: Trend, structure: Trend) -> Trend {
    match (ma, structure) {
        (Trend::Flat, _) => Trend::Flat,
        (m, Trend::Flat) => m,
        (m, s) if m == s => m,
        _ => Trend::Flat,
    }
}

pub fn derive_trend(tf: Timeframe, candles: &CandleSeries, cfg: &TrendConfig) -> Option<TrendState> {
    let last = candles.last()?;
    let ma = ma_trend(candles, cfg.ma_period, cfg.flat_band);
    let structure = structure_trend(candles.as_slice(), cfg.structure_lookback);
    Some(TrendState {
        timeframe: tf,
        direction: combine_trends(ma, structure),
        as_of: last.timestamp,
    })
}
