use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::exchange::MarketData;
use crate::models::{Candle, CandleSeries, Quote, Timeframe};

/// Market data that replays pre-loaded bars. A cursor controls which bars
/// are visible: only bars that have closed by the cursor are returned.
/// Quotes are synthesised from the last visible close of the quote
/// timeframe plus a fixed spread.
pub struct ReplayFeed {
    data: HashMap<Timeframe, Vec<Candle>>,
    now: RwLock<DateTime<Utc>>,
    quote_tf: Timeframe,
    spread: f64,
}

impl ReplayFeed {
    pub fn new(quote_tf: Timeframe, spread: f64) -> Self {
        Self {
            data: HashMap::new(),
            now: RwLock::new(DateTime::<Utc>::MIN_UTC),
            quote_tf,
            spread,
        }
    }

    /// Candles must be sorted oldest-first.
    pub fn load(&mut self, tf: Timeframe, candles: Vec<Candle>) {
        self.data.insert(tf, candles);
    }

    pub fn set_time(&self, t: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = t;
        }
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.now.read().map(|n| *n).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Latest moment at which every loaded bar has closed.
    pub fn latest_time(&self) -> Option<DateTime<Utc>> {
        self.data
            .iter()
            .filter_map(|(tf, v)| v.last().map(|c| close_time(c, *tf)))
            .max()
    }

    fn visible_candles(&self, tf: Timeframe, limit: usize) -> CandleSeries {
        let Some(all) = self.data.get(&tf) else {
            return CandleSeries::default();
        };
        let now = self.current_time();
        let end = all.partition_point(|c| close_time(c, tf) <= now);
        let start = end.saturating_sub(limit);
        CandleSeries::new(all[start..end].to_vec())
    }
}

fn close_time(c: &Candle, tf: Timeframe) -> DateTime<Utc> {
    c.timestamp + chrono::Duration::seconds(tf.as_seconds() as i64)
}

#[async_trait]
impl MarketData for ReplayFeed {
    async fn fetch_bars(&self, tf: Timeframe, count: usize) -> Result<CandleSeries> {
        Ok(self.visible_candles(tf, count))
    }

    async fn get_quote(&self) -> Result<Quote> {
        let series = self.visible_candles(self.quote_tf, 1);
        let last = series.last().context("No price data at current time")?;
        Ok(Quote {
            bid: last.close,
            ask: last.close + self.spread,
            time: self.current_time(),
        })
    }
}
