use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{Config, SharedConfig};
use crate::core::indicators::atr;
use crate::core::structure::{derive_trend, TrendState};
use crate::core::zones::{ZoneChange, ZoneTracker};
use crate::error::{BrokerError, EngineError};
use crate::exchange::{Broker, MarketData};
use crate::models::{CandleSeries, Quote, SymbolSpec, Timeframe};
use crate::notify::{EventKind, NotificationEvent, Notifier};
use crate::strategies::confluence::{ConfluenceScorer, ScoreContext};
use crate::strategies::mode_selector::{decide, Decision, ModeThresholds};
use crate::strategies::signals::Signal;
use crate::trading::executor::{ExecutionOutcome, OrderExecutor};
use crate::trading::guard::{EquityGuard, GuardVerdict};
use crate::trading::journal::{SkipCode, SummarySchedule, TradeJournal};
use crate::trading::position::ClosedTrade;
use crate::trading::risk_sizer::{self, RiskParameters};

/// Bars per timeframe plus the quote, all fetched in the same cycle.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub bars: HashMap<Timeframe, CandleSeries>,
    pub quote: Quote,
}

/// What one cycle saw and did.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub zone_changes: Vec<ZoneChange>,
    pub signal: Option<Signal>,
    pub decision: Option<Decision>,
    pub outcome: Option<ExecutionOutcome>,
    pub closed: Option<ClosedTrade>,
    /// New entries were blocked by the equity guard or shutdown.
    pub entries_blocked: bool,
}

enum Fetched {
    Bars(Timeframe, CandleSeries),
    Quote(Quote),
}

pub struct TradeEngine {
    config: SharedConfig,
    market: Arc<dyn MarketData>,
    broker: Arc<dyn Broker>,
    executor: Arc<OrderExecutor>,
    notifier: Notifier,
    spec: SymbolSpec,
    tracker: ZoneTracker,
    scorer: ConfluenceScorer,
    thresholds: ModeThresholds,
    journal: TradeJournal,
    guard: EquityGuard,
    schedule: SummarySchedule,
    trends: BTreeMap<Timeframe, TrendState>,
    shutdown: watch::Receiver<bool>,
    seeded: bool,
    cycles: u64,
    last_skip: Option<String>,
}

impl TradeEngine {
    /// Fails only on startup problems: bad configuration or a broker that
    /// cannot describe the symbol.
    pub async fn new(
        config: SharedConfig,
        market: Arc<dyn MarketData>,
        broker: Arc<dyn Broker>,
        notifier: Notifier,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let cfg = config.read().await.clone();
        cfg.validate()?;

        let spec = tokio::time::timeout(cfg.execution.order_timeout(), broker.symbol_spec())
            .await
            .context("symbol spec request timed out")?
            .context("failed to load symbol spec")?;

        let executor = Arc::new(OrderExecutor::new(&cfg, Arc::clone(&broker), notifier.clone(), spec));
        let engine = Self {
            market,
            broker,
            executor,
            notifier,
            spec,
            tracker: ZoneTracker::new(cfg.zones.clone()),
            scorer: ConfluenceScorer::from_config(&cfg),
            thresholds: ModeThresholds::from_config(&cfg),
            journal: TradeJournal::new(&cfg),
            guard: EquityGuard::new(cfg.guard.clone(), cfg.timezone()),
            schedule: SummarySchedule::new(&cfg),
            trends: BTreeMap::new(),
            shutdown,
            seeded: false,
            cycles: 0,
            last_skip: None,
            config,
        };
        engine.print_banner(&cfg);
        Ok(engine)
    }

    pub fn with_journal(mut self, journal: TradeJournal) -> Self {
        self.journal = journal;
        self
    }

    pub fn executor(&self) -> Arc<OrderExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn tracker(&self) -> &ZoneTracker {
        &self.tracker
    }

    pub fn journal(&self) -> &TradeJournal {
        &self.journal
    }

    pub fn trends(&self) -> &BTreeMap<Timeframe, TrendState> {
        &self.trends
    }

    fn print_banner(&self, cfg: &Config) {
        info!("{}", "=".repeat(60));
        info!("Zone trader starting up");
        info!("Mode: {}", if cfg.paper_trade { "PAPER TRADING" } else { "LIVE TRADING" });
        info!("Symbol: {}", cfg.symbol);
        info!("Strategy: {}", cfg.strategy_mode);
        info!(
            "Zones: {:?} (trading {}) | Trend: {:?} | Entry: {}",
            cfg.zones.timeframes, cfg.zones.trading_tf, cfg.trend.timeframes, cfg.entry_tf
        );
        info!(
            "Context: {} | False breakouts: {} | Adaptive shift: {}",
            cfg.context_tf.map_or("off".to_string(), |tf| tf.to_string()),
            if cfg.false_breakout.enabled { "on" } else { "off" },
            cfg.adaptive.shift
        );
        info!(
            "Risk: {:.2}% per trade | Max spread {} | Max slippage {}",
            cfg.risk_fraction * 100.0,
            cfg.execution.max_spread,
            cfg.execution.max_slippage
        );
        info!(
            "Lots: min {} max {} step {} | Pip value {}",
            self.spec.min_lot, self.spec.max_lot, self.spec.lot_step, self.spec.pip_value
        );
        info!("{}", "=".repeat(60));
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Engine is now running. Press Ctrl+C to stop.");
        let interval = self.config.read().await.poll_interval();

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_cycle().await {
                warn!("Cycle {} skipped: {}", self.cycles, e);
            }
            // Only the idle wait races the shutdown signal, so an order in
            // flight always resolves before we stop.
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn emit(&self, kind: EventKind, message: String, payload: serde_json::Value) {
        self.notifier.notify(NotificationEvent::new(kind, message, payload));
    }

    /// One full poll: snapshot, zones, trends, position upkeep, then at most
    /// one new decision.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let cfg = self.config.read().await.clone();
        self.cycles += 1;
        let mut report = CycleReport::default();

        let snapshot = self.fetch_snapshot(&cfg).await?;
        let quote = snapshot.quote;

        report.zone_changes = self.update_zones(&cfg, &snapshot);
        self.update_trends(&cfg, &snapshot);

        let mut broker_ok = true;
        match self.executor.sync_positions(&quote).await {
            Ok(sync) => {
                if sync.adopted {
                    info!("Managing position adopted from broker");
                }
                if let Some(trade) = &sync.closed {
                    self.journal.record_close(trade);
                }
                report.closed = sync.closed;
            }
            Err(e) => {
                warn!("Position sync failed: {}", e);
                broker_ok = false;
            }
        }
        if broker_ok {
            if let Err(e) = self.executor.manage_trailing(&quote).await {
                warn!("Trailing update failed: {}", e);
            }
        }

        if let Some(date) = self.schedule.due(quote.time) {
            let summary = self.journal.summary_for(date, self.schedule.timezone());
            summary.log();
            self.emit(EventKind::Summary, summary.message(), serde_json::to_value(&summary).unwrap_or_default());
        }

        if self.stopping() || !broker_ok {
            report.entries_blocked = true;
            return Ok(report);
        }

        let account = match with_timeout(cfg.execution.order_timeout(), self.broker.account_info()).await {
            Ok(a) => a,
            Err(e) => {
                warn!("Account info unavailable: {}", e);
                report.entries_blocked = true;
                return Ok(report);
            }
        };
        if let GuardVerdict::Halted { reason, newly } = self.guard.check(account.equity, quote.time) {
            if newly {
                self.emit(
                    EventKind::Halt,
                    format!("New entries halted for today: {}", reason),
                    json!({ "equity": account.equity, "reason": reason }),
                );
            }
            report.entries_blocked = true;
            return Ok(report);
        }

        let trading_atr = snapshot
            .bars
            .get(&cfg.zones.trading_tf)
            .map_or(0.0, |s| atr(s, cfg.atr_period));
        let Some(signal) = self.score(&cfg, &snapshot, trading_atr) else {
            return Ok(report);
        };
        let thresholds = self.thresholds.adapted(trading_atr, cfg.zones.proximity, &cfg.adaptive);
        if thresholds != self.thresholds {
            debug!(
                "ATR {:.5} moves thresholds to {:.2}/{:.2}",
                trading_atr, thresholds.trend_follow, thresholds.aggressive
            );
        }
        let decision = decide(&signal, cfg.strategy_mode, &thresholds);
        report.signal = Some(signal.clone());
        report.decision = Some(decision.clone());

        if let Decision::Hold(reason) = &decision {
            debug!("Hold {} score {:.3}: {}", signal.side, signal.confluence_score, reason);
            self.report_skip(&cfg, &signal, SkipCode::Hold, reason);
            return Ok(report);
        }

        let params = RiskParameters::new(account.balance, cfg.risk_fraction, signal.stop_distance(), &self.spec);
        let lot = match risk_sizer::size(&params) {
            Ok(lot) => lot,
            Err(e) => {
                warn!("Sizing aborted ({}): {}", e.kind(), e);
                self.report_skip(&cfg, &signal, SkipCode::Sizing, &e.to_string());
                return Ok(report);
            }
        };

        if !self.executor.has_position().await {
            self.log_signal(&signal, lot);
            self.emit(
                EventKind::Signal,
                format!(
                    "{} {} score {:.2} ({}) zone {} {:.5}-{:.5}",
                    signal.side,
                    cfg.symbol,
                    signal.confluence_score,
                    signal.mode,
                    signal.zone.timeframe,
                    signal.zone.price_low,
                    signal.zone.price_high
                ),
                serde_json::to_value(&signal).unwrap_or_default(),
            );
        }

        // Gates and the order are priced from a quote taken now, not the
        // one the snapshot was scored on.
        let live = match self.live_quote(&cfg).await {
            Ok(q) => q,
            Err(reason) => {
                warn!("No usable quote for execution: {}", reason);
                self.report_skip(&cfg, &signal, SkipCode::Quote, &reason);
                report.outcome = Some(ExecutionOutcome::Dropped(reason));
                return Ok(report);
            }
        };

        match self.executor.execute(&signal, lot, &live).await {
            Ok(outcome) => {
                match &outcome {
                    ExecutionOutcome::Filled(position) => {
                        self.journal.record_open(position);
                        self.last_skip = None;
                    }
                    // The executor already announced the drop.
                    ExecutionOutcome::Dropped(reason) => {
                        self.skip(&signal, SkipCode::Gate, reason);
                    }
                    ExecutionOutcome::Tightened { .. } | ExecutionOutcome::Ignored(_) => {}
                }
                report.outcome = Some(outcome);
            }
            Err(e) => {
                warn!("Execution failed ({}): {}", e.kind(), e);
                self.report_skip(&cfg, &signal, SkipCode::Execution, &format!("{}: {}", e.kind(), e));
            }
        }
        Ok(report)
    }

    /// Fresh quote for the order, rejected when older than the configured age.
    async fn live_quote(&self, cfg: &Config) -> Result<Quote, String> {
        let quote = match tokio::time::timeout(cfg.data_timeout(), self.market.get_quote()).await {
            Ok(Ok(q)) => q,
            Ok(Err(e)) => return Err(format!("quote unavailable: {}", e)),
            Err(_) => return Err(format!("quote timed out after {:?}", cfg.data_timeout())),
        };
        if let Some(max_age) = cfg.execution.max_quote_age() {
            let age = Utc::now() - quote.time;
            if age > max_age {
                return Err(format!(
                    "quote is {}ms old (max {}ms)",
                    age.num_milliseconds(),
                    max_age.num_milliseconds()
                ));
            }
        }
        Ok(quote)
    }

    /// Fetch every timeframe and the quote concurrently. Any failure or
    /// timeout discards the whole snapshot.
    async fn fetch_snapshot(&self, cfg: &Config) -> Result<MarketSnapshot, EngineError> {
        let limit = cfg.data_timeout();
        let count = cfg.bars_needed();
        let mut set: JoinSet<Result<Fetched, EngineError>> = JoinSet::new();

        for tf in cfg.fetch_timeframes() {
            let market = Arc::clone(&self.market);
            set.spawn(async move {
                match tokio::time::timeout(limit, market.fetch_bars(tf, count)).await {
                    Ok(Ok(series)) if series.is_empty() => {
                        Err(EngineError::DataUnavailable(format!("no {} bars", tf)))
                    }
                    Ok(Ok(series)) => Ok(Fetched::Bars(tf, series)),
                    Ok(Err(e)) => Err(EngineError::DataUnavailable(format!("{} bars: {}", tf, e))),
                    Err(_) => Err(EngineError::data_timeout(Some(tf))),
                }
            });
        }
        let market = Arc::clone(&self.market);
        set.spawn(async move {
            match tokio::time::timeout(limit, market.get_quote()).await {
                Ok(Ok(q)) => Ok(Fetched::Quote(q)),
                Ok(Err(e)) => Err(EngineError::DataUnavailable(format!("quote: {}", e))),
                Err(_) => Err(EngineError::data_timeout(None)),
            }
        });

        let mut bars = HashMap::new();
        let mut quote = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(Fetched::Bars(tf, series))) => {
                    bars.insert(tf, series);
                }
                Ok(Ok(Fetched::Quote(q))) => quote = Some(q),
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(EngineError::DataUnavailable(format!("fetch task failed: {}", e))),
            }
        }
        let quote = quote.ok_or_else(|| EngineError::data_timeout(None))?;
        Ok(MarketSnapshot { bars, quote })
    }

    /// Feed bars the tracker has not seen yet. The first cycle only seeds
    /// history and stays quiet.
    fn update_zones(&mut self, cfg: &Config, snapshot: &MarketSnapshot) -> Vec<ZoneChange> {
        let mut all = Vec::new();
        for &tf in &cfg.zones.timeframes {
            let Some(series) = snapshot.bars.get(&tf) else {
                continue;
            };
            for bar in series.newer_than(self.tracker.last_bar_time(tf)) {
                all.extend(self.tracker.update(tf, bar));
            }
        }

        if self.seeded {
            for change in all.iter().filter(|c| c.is_transition()) {
                let message = describe_change(change);
                info!("🧱 {}", message);
                self.emit(EventKind::Zone, message, serde_json::to_value(change).unwrap_or_default());
            }
        } else {
            let total: usize = cfg.zones.timeframes.iter().map(|tf| self.tracker.zones(*tf).len()).sum();
            info!("Zone tracker seeded with {} active zone(s)", total);
            self.seeded = true;
        }
        all
    }

    fn update_trends(&mut self, cfg: &Config, snapshot: &MarketSnapshot) {
        for &tf in cfg.trend.timeframes.iter().chain(cfg.context_tf.iter()) {
            if let Some(state) = snapshot.bars.get(&tf).and_then(|s| derive_trend(tf, s, &cfg.trend)) {
                if self.trends.get(&tf).map(|t| t.direction) != Some(state.direction) {
                    info!("Trend {} is now {}", tf, state.direction);
                }
                self.trends.insert(tf, state);
            }
        }
    }

    fn score(&self, cfg: &Config, snapshot: &MarketSnapshot, trading_atr: f64) -> Option<Signal> {
        let trading_bars = snapshot.bars.get(&cfg.zones.trading_tf)?;
        let entry_bars = snapshot.bars.get(&cfg.entry_tf)?;
        let zones = self.tracker.snapshot();
        let context = cfg
            .context_tf
            .and_then(|tf| self.trends.get(&tf))
            .map(|t| t.direction);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &self.trends,
            quote: &snapshot.quote,
            entry_bars,
            trading_bars,
            context,
            atr: trading_atr,
            as_of: snapshot.quote.time,
        };
        self.scorer.score(&ctx)
    }

    /// Journal a decision that produced no order, once per zone, side and
    /// code. Returns whether it was new.
    fn skip(&mut self, signal: &Signal, code: SkipCode, reason: &str) -> bool {
        let key = format!("{}:{}:{}", signal.zone.id, signal.side, code);
        if self.last_skip.as_deref() == Some(key.as_str()) {
            return false;
        }
        self.journal.record_skip(
            signal.timestamp,
            Some(signal.side),
            Some(signal.confluence_score),
            code,
            reason,
        );
        self.last_skip = Some(key);
        true
    }

    fn report_skip(&mut self, cfg: &Config, signal: &Signal, code: SkipCode, reason: &str) {
        if !self.skip(signal, code, reason) {
            return;
        }
        self.emit(
            EventKind::Dropped,
            format!("{} {} not taken ({}): {}", signal.side, cfg.symbol, code, reason),
            json!({
                "side": signal.side,
                "score": signal.confluence_score,
                "zone_id": signal.zone.id,
                "code": code,
                "reason": reason,
            }),
        );
    }

    fn log_signal(&self, signal: &Signal, lot: f64) {
        let b = &signal.breakdown;
        info!("{}", "=".repeat(60));
        info!("SIGNAL {} ({})", signal.side.as_str().to_uppercase(), signal.mode);
        info!(
            "  Zone: {} {} {:.5}-{:.5} (touches {})",
            signal.zone.timeframe, signal.zone.kind, signal.zone.price_low, signal.zone.price_high, signal.zone.touches
        );
        info!("  Entry: {:.5}", signal.entry_price);
        info!("  Stop Loss: {:.5}", signal.stop_loss);
        info!("  Take Profit: {:.5}", signal.take_profit);
        info!("  Lot: {}", lot);
        info!(
            "  Score: {:.3} [zone {:.2} reaction {:.2} align {:.2} htf {:.2} fresh {:.2} ind {:.2}]",
            signal.confluence_score, b.zone, b.reaction, b.alignment, b.htf_zone, b.freshness, b.indicators
        );
        info!("  Reason: {}", signal.reason);
        info!("{}", "=".repeat(60));
    }

    async fn print_status(&self) {
        info!("Cycles: {}", self.cycles);
        for (tf, t) in &self.trends {
            info!("Trend {}: {}", tf, t.direction);
        }
        match self.executor.position().await {
            Some(p) => info!(
                "Open: {} {} {} @ {:.5} SL {:.5} TP {:.5}",
                p.position_id, p.side, p.lot_size, p.entry_price, p.stop_loss, p.take_profit
            ),
            None => info!("Open: none"),
        }
        match with_timeout(Duration::from_secs(2), self.broker.account_info()).await {
            Ok(a) => info!("Balance: {:.2} | Equity: {:.2}", a.balance, a.equity),
            Err(e) => debug!("Account info unavailable: {}", e),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down...");
        self.print_status().await;
        let today = now_in(self.schedule.timezone());
        let summary = self.journal.summary_for(today, self.schedule.timezone());
        summary.log();
        self.emit(EventKind::Summary, summary.message(), serde_json::to_value(&summary).unwrap_or_default());
        self.notifier.drain().await;
        info!("Engine stopped.");
    }
}

fn now_in(tz: chrono_tz::Tz) -> chrono::NaiveDate {
    Utc::now().with_timezone(&tz).date_naive()
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, BrokerError>>,
) -> Result<T, BrokerError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(r) => r,
        Err(_) => Err(BrokerError::Timeout),
    }
}

fn describe_change(change: &ZoneChange) -> String {
    match change {
        ZoneChange::Flipped { from, to } => format!(
            "{} {} zone {:.5}-{:.5} flipped to {}",
            from.timeframe, from.kind, from.price_low, from.price_high, to.kind
        ),
        ZoneChange::Invalidated { zone, reason } => format!(
            "{} {} zone {:.5}-{:.5} invalidated ({:?})",
            zone.timeframe, zone.kind, zone.price_low, zone.price_high, reason
        ),
        ZoneChange::Created { zone } => format!("{} {} zone created", zone.timeframe, zone.kind),
        ZoneChange::Merged { into, absorbed } => {
            format!("{} {} zone absorbed {:?}", into.timeframe, into.kind, absorbed)
        }
        ZoneChange::Touched { zone } => format!("{} {} zone touched", zone.timeframe, zone.kind),
    }
}

