use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed OHLC bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
}

impl Candle {
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn total_range(&self) -> f64 {
        self.high - self.low
    }

    pub fn upper_wick(&self) -> f64 {
        self.high - self.close.max(self.open)
    }

    pub fn lower_wick(&self) -> f64 {
        self.close.min(self.open) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    pub fn body_top(&self) -> f64 {
        self.close.max(self.open)
    }

    pub fn body_bottom(&self) -> f64 {
        self.close.min(self.open)
    }
}

/// Ordered (oldest first) run of bars for one timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// The newest `n` bars.
    pub fn tail(&self, n: usize) -> CandleSeries {
        let start = self.candles.len().saturating_sub(n);
        CandleSeries::new(self.candles[start..].to_vec())
    }

    pub fn as_slice(&self) -> &[Candle] {
        &self.candles
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    /// Bars strictly newer than `ts`, or every bar when `ts` is `None`.
    pub fn newer_than(&self, ts: Option<DateTime<Utc>>) -> Vec<Candle> {
        match ts {
            None => self.candles.clone(),
            Some(t) => self
                .candles
                .iter()
                .filter(|c| c.timestamp > t)
                .cloned()
                .collect(),
        }
    }

    pub fn push(&mut self, candle: Candle) {
        self.candles.push(candle);
    }

    /// Drop bars from the front until at most `cap` remain.
    pub fn truncate_front(&mut self, cap: usize) {
        if self.candles.len() > cap {
            let excess = self.candles.len() - cap;
            self.candles.drain(..excess);
        }
    }
}

impl std::ops::Index<usize> for CandleSeries {
    type Output = Candle;
    fn index(&self, index: usize) -> &Self::Output {
        &self.candles[index]
    }
}

impl IntoIterator for CandleSeries {
    type Item = Candle;
    type IntoIter = std::vec::IntoIter<Candle>;
    fn into_iter(self) -> Self::IntoIter {
        self.candles.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_candles;

    fn hammer() -> Candle {
        Candle {
            timestamp: Utc::now(),
            open: 100.0,
            high: 103.0,
            low: 90.0,
            close: 102.0,
            volume: 1.0,
        }
    }

    #[test]
    fn candle_geometry() {
        let c = hammer();
        assert!((c.body() - 2.0).abs() < 1e-9);
        assert!((c.total_range() - 13.0).abs() < 1e-9);
        assert!((c.upper_wick() - 1.0).abs() < 1e-9);
        assert!((c.lower_wick() - 10.0).abs() < 1e-9);
        assert!(c.is_bullish());
        assert!((c.body_top() - 102.0).abs() < 1e-9);
        assert!((c.body_bottom() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn newer_than_filters_by_timestamp() {
        let s = make_candles(&[
            (100.0, 105.0, 95.0, 102.0),
            (102.0, 108.0, 100.0, 106.0),
            (106.0, 112.0, 104.0, 110.0),
        ]);
        assert_eq!(s.newer_than(None).len(), 3);
        let cut = s[0].timestamp;
        let newer = s.newer_than(Some(cut));
        assert_eq!(newer.len(), 2);
        assert!((newer[0].open - 102.0).abs() < 1e-9);
        assert!(s.newer_than(Some(s[2].timestamp)).is_empty());
    }

    #[test]
    fn truncate_front_keeps_latest() {
        let mut s = make_candles(&[
            (1.0, 2.0, 0.5, 1.5),
            (2.0, 3.0, 1.5, 2.5),
            (3.0, 4.0, 2.5, 3.5),
        ]);
        s.truncate_front(2);
        assert_eq!(s.len(), 2);
        assert!((s[0].open - 2.0).abs() < 1e-9);
        assert_eq!(s.last().map(|c| c.close), Some(3.5));
    }
}
