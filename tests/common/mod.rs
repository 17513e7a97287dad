#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use zone_trader::config::{
    AdaptiveConfig, Config, ExecutionConfig, FalseBreakoutConfig, GuardConfig, IndicatorConfig, ScoreWeights,
    TrendConfig, ZoneConfig,
};
use zone_trader::error::BrokerError;
use zone_trader::exchange::{Broker, BrokerPosition, MarketData, SubmitRequest, SubmitResult};
use zone_trader::models::{AccountInfo, Candle, CandleSeries, Quote, StrategyMode, SymbolSpec, Timeframe};
use zone_trader::notify::{EventKind, NotificationEvent, NotificationSink};

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Candles from (open, high, low, close) tuples spaced one `tf` bar apart.
pub fn make_tf_candles(tf: Timeframe, data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let step = tf.as_seconds() as i64;
    let candles: Vec<Candle> = data
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle {
            timestamp: base_time() + Duration::seconds(step * i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        })
        .collect();
    CandleSeries::new(candles)
}

pub fn quote_at(bid: f64, ask: f64, hours: i64) -> Quote {
    Quote {
        bid,
        ask,
        time: base_time() + Duration::hours(hours),
    }
}

pub fn symbol_spec() -> SymbolSpec {
    SymbolSpec {
        point: 0.01,
        min_lot: 0.01,
        max_lot: 100.0,
        lot_step: 0.01,
        pip_value: 1.0,
        stops_level: 0.0,
    }
}

pub fn test_config() -> Config {
    Config {
        symbol: "TEST".to_string(),
        bridge_url: "http://127.0.0.1:0".to_string(),
        bridge_secret: String::new(),
        telegram_bot_token: String::new(),
        telegram_chat_id: String::new(),
        telegram_quiet: false,
        paper_trade: true,
        initial_balance: 1000.0,
        strategy_mode: StrategyMode::TrendFollow,
        trend_follow_threshold: 0.7,
        aggressive_threshold: 0.5,
        entry_tf: Timeframe::M1,
        zones: ZoneConfig {
            timeframes: vec![Timeframe::H1, Timeframe::H4],
            trading_tf: Timeframe::H1,
            swing_size: 2,
            lookback: 50,
            flip_displacement: 2.0,
            invalidation_bars: 3,
            max_touches: 3,
            proximity: 1.0,
            fresh_flip_bars: 3,
            max_zones_per_tf: 10,
        },
        trend: TrendConfig {
            timeframes: vec![Timeframe::H1, Timeframe::H4],
            ma_period: 10,
            flat_band: 0.0005,
            structure_lookback: 2,
        },
        weights: ScoreWeights {
            zone: 0.30,
            reaction: 0.25,
            alignment: 0.30,
            htf_zone: 0.10,
            freshness: 0.05,
            indicators: 0.0,
        },
        indicators: IndicatorConfig {
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
        },
        adaptive: AdaptiveConfig {
            shift: 0.0,
            high_ratio: 2.0,
            low_ratio: 0.8,
        },
        false_breakout: FalseBreakoutConfig {
            enabled: false,
            min_penetration: 1.0,
        },
        context_tf: None,
        atr_period: 5,
        sl_buffer: 0.5,
        trend_stop_atr_mult: 2.0,
        aggressive_stop_atr_mult: 1.0,
        tp_ratio: 2.0,
        risk_fraction: 0.01,
        guard: GuardConfig {
            max_daily_loss: 0.05,
            max_drawdown: 0.10,
        },
        execution: ExecutionConfig {
            max_spread: 0.5,
            max_slippage: 0.5,
            max_retries: 3,
            retry_backoff_ms: 5,
            order_timeout_ms: 100,
            trailing_trigger: 3.0,
            trailing_step: 1.0,
            trailing_distance: 1.0,
            stops_level_mult: 1.2,
            magic: 77775,
            max_quote_age_ms: 0,
        },
        poll_interval_secs: 1,
        data_timeout_ms: 200,
        notify_timeout_ms: 100,
        summary_time: (23, 58),
        summary_tz: "UTC".to_string(),
        log_dir: std::env::temp_dir()
            .join("zone_trader_it")
            .to_string_lossy()
            .to_string(),
        log_level: "ERROR".to_string(),
    }
}

/// Market data served from whatever the test last stored. Queued quotes
/// are handed out one per request before falling back to the stored one.
pub struct MockMarket {
    bars: Mutex<HashMap<Timeframe, CandleSeries>>,
    quote: Mutex<Quote>,
    queued: Mutex<VecDeque<Quote>>,
    quote_calls: AtomicUsize,
}

impl MockMarket {
    pub fn new(quote: Quote) -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
            quote: Mutex::new(quote),
            queued: Mutex::new(VecDeque::new()),
            quote_calls: AtomicUsize::new(0),
        }
    }

    pub fn push_quotes(&self, quotes: &[Quote]) {
        self.queued.lock().unwrap().extend(quotes.iter().copied());
    }

    pub fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn set_bars(&self, tf: Timeframe, series: CandleSeries) {
        self.bars.lock().unwrap().insert(tf, series);
    }

    pub fn set_quote(&self, quote: Quote) {
        *self.quote.lock().unwrap() = quote;
    }
}

#[async_trait]
impl MarketData for MockMarket {
    async fn fetch_bars(&self, tf: Timeframe, count: usize) -> Result<CandleSeries> {
        self.bars
            .lock()
            .unwrap()
            .get(&tf)
            .map(|s| s.tail(count))
            .ok_or_else(|| anyhow!("no {} data", tf))
    }

    async fn get_quote(&self) -> Result<Quote> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(q) = self.queued.lock().unwrap().pop_front() {
            return Ok(q);
        }
        Ok(*self.quote.lock().unwrap())
    }
}

#[derive(Debug, Clone)]
pub enum SubmitScript {
    Fill,
    Reject { code: i64, retryable: bool },
    /// Never answers. With `fill` the order still lands at the broker.
    Hang { fill: bool },
}

/// Broker whose submit responses are scripted per call. Calls beyond the
/// script fill normally.
pub struct MockBroker {
    script: Mutex<VecDeque<SubmitScript>>,
    positions: Mutex<Vec<BrokerPosition>>,
    submit_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fill_delay: std::time::Duration,
    next_id: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBroker {
    pub fn new(script: Vec<SubmitScript>) -> Self {
        Self::with_delay(script, std::time::Duration::ZERO)
    }

    pub fn with_delay(script: Vec<SubmitScript>, fill_delay: std::time::Duration) -> Self {
        Self {
            script: Mutex::new(script.into()),
            positions: Mutex::new(Vec::new()),
            submit_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fill_delay,
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn positions(&self) -> Vec<BrokerPosition> {
        self.positions.lock().unwrap().clone()
    }

    fn open(&self, req: &SubmitRequest) -> SubmitResult {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.positions.lock().unwrap().push(BrokerPosition {
            position_id: id.clone(),
            side: req.side,
            lot: req.lot,
            entry_price: req.entry_price,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            client_tag: Some(req.client_tag.clone()),
            opened_at: base_time(),
        });
        SubmitResult {
            broker_order_id: format!("o{}", id),
            position_id: id,
            fill_price: req.entry_price,
            filled_at: base_time(),
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitResult, BrokerError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self.script.lock().unwrap().pop_front().unwrap_or(SubmitScript::Fill);
        if !self.fill_delay.is_zero() {
            tokio::time::sleep(self.fill_delay).await;
        }
        match step {
            SubmitScript::Fill => Ok(self.open(req)),
            SubmitScript::Reject { code, retryable } => Err(BrokerError::Rejected {
                code,
                reason: format!("scripted reject {}", code),
                retryable,
            }),
            SubmitScript::Hang { fill } => {
                if fill {
                    self.open(req);
                }
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                Err(BrokerError::Timeout)
            }
        }
    }

    async fn modify_stop(&self, position_id: &str, new_stop: f64) -> Result<(), BrokerError> {
        let mut positions = self.positions.lock().unwrap();
        match positions.iter_mut().find(|p| p.position_id == position_id) {
            Some(p) => {
                p.stop_loss = new_stop;
                Ok(())
            }
            None => Err(BrokerError::Rejected {
                code: 10013,
                reason: "unknown position".to_string(),
                retryable: false,
            }),
        }
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        Ok(self.positions())
    }

    async fn account_info(&self) -> Result<AccountInfo, BrokerError> {
        Ok(AccountInfo {
            balance: 1000.0,
            equity: 1000.0,
        })
    }

    async fn symbol_spec(&self) -> Result<SymbolSpec, BrokerError> {
        Ok(symbol_spec())
    }
}

/// Keeps every event it is handed.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<NotificationEvent>>,
}

impl RecordingSink {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn events_of(&self, kind: EventKind) -> Vec<NotificationEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Poll until an event of `kind` arrives or a second passes.
    pub async fn wait_for(&self, kind: EventKind) -> bool {
        for _ in 0..100 {
            if self.kinds().contains(&kind) {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Never finishes a delivery.
pub struct SlowSink;

#[async_trait]
impl NotificationSink for SlowSink {
    fn name(&self) -> &str {
        "slow"
    }

    async fn deliver(&self, _event: &NotificationEvent) -> Result<()> {
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(())
    }
}
