//! Order submission and position management for one instrument.
//!
//! Every order-mutating broker call happens while holding the executor's
//! state lock, so overlapping cycles can never race two submissions or a
//! submission and a stop update.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, ExecutionConfig};
use crate::error::{BrokerError, EngineError};
use crate::exchange::{Broker, BrokerPosition, SubmitRequest, SubmitResult};
use crate::models::{CloseReason, OrderStatus, Quote, SymbolSpec};
use crate::notify::{EventKind, NotificationEvent, Notifier};
use crate::strategies::signals::Signal;
use crate::trading::position::{next_trailing_stop, ClosedTrade, Order, Position, TrailingSettings};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled(Position),
    /// A gate refused the signal before anything was sent.
    Dropped(String),
    /// A position was already open and the signal moved its stop closer.
    Tightened { position_id: String, new_stop: f64 },
    /// A position was already open and the signal changed nothing.
    Ignored(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub closed: Option<ClosedTrade>,
    /// Local stop/target were overwritten from the broker.
    pub corrected: bool,
    /// A position of ours was found at the broker with no local record.
    pub adopted: bool,
}

struct ExecutorState {
    position: Option<Position>,
    last_order: Option<Order>,
    next_order_id: u64,
}

enum SubmitAttempt {
    Done(SubmitResult),
    Adopted(BrokerPosition),
    Failed(BrokerError),
}

pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
    notifier: Notifier,
    cfg: ExecutionConfig,
    spec: SymbolSpec,
    symbol: String,
    state: Mutex<ExecutorState>,
}

impl OrderExecutor {
    pub fn new(cfg: &Config, broker: Arc<dyn Broker>, notifier: Notifier, spec: SymbolSpec) -> Self {
        Self {
            broker,
            notifier,
            cfg: cfg.execution.clone(),
            spec,
            symbol: cfg.symbol.clone(),
            state: Mutex::new(ExecutorState {
                position: None,
                last_order: None,
                next_order_id: Utc::now().timestamp().max(1) as u64,
            }),
        }
    }

    pub async fn position(&self) -> Option<Position> {
        self.state.lock().await.position.clone()
    }

    pub async fn has_position(&self) -> bool {
        self.state.lock().await.position.is_some()
    }

    /// The most recent order, whatever its final status.
    pub async fn last_order(&self) -> Option<Order> {
        self.state.lock().await.last_order.clone()
    }

    fn min_stop_distance(&self) -> f64 {
        self.spec.stops_level * self.cfg.stops_level_mult
    }

    fn emit(&self, kind: EventKind, message: String, payload: serde_json::Value) {
        self.notifier.notify(NotificationEvent::new(kind, message, payload));
    }

    fn drop_signal(&self, signal: &Signal, reason: String) -> ExecutionOutcome {
        info!("Signal dropped: {}", reason);
        self.emit(
            EventKind::Dropped,
            format!("{} {} dropped: {}", signal.side, self.symbol, reason),
            json!({
                "side": signal.side,
                "score": signal.confluence_score,
                "zone_id": signal.zone.id,
                "reason": reason,
            }),
        );
        ExecutionOutcome::Dropped(reason)
    }

    /// Turn an actionable signal into at most one open position.
    pub async fn execute(
        &self,
        signal: &Signal,
        lot: f64,
        quote: &Quote,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut state = self.state.lock().await;

        if state.position.is_some() {
            return self.tighten_existing(&mut state, signal, quote).await;
        }

        let spread = quote.spread();
        if spread > self.cfg.max_spread {
            let reason = format!("spread {:.5} above max {:.5}", spread, self.cfg.max_spread);
            return Ok(self.drop_signal(signal, reason));
        }
        let price = quote.entry_price(signal.side);
        let slippage = (price - signal.entry_price).abs();
        if slippage > self.cfg.max_slippage {
            let reason = format!(
                "price moved {:.5} from signal entry {:.5} (max {:.5})",
                slippage, signal.entry_price, self.cfg.max_slippage
            );
            return Ok(self.drop_signal(signal, reason));
        }

        let (stop_loss, take_profit) = self.respect_stops_level(signal, price);
        state.next_order_id += 1;
        let order_id = state.next_order_id;
        let mut order = Order {
            id: order_id,
            client_tag: format!("{}-{}", self.cfg.magic, order_id),
            side: signal.side,
            lot_size: lot,
            entry_price: price,
            stop_loss,
            take_profit,
            status: OrderStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            broker_order_id: None,
            last_error: None,
        };
        let req = SubmitRequest {
            side: order.side,
            lot,
            entry_price: price,
            stop_loss,
            take_profit,
            client_tag: order.client_tag.clone(),
            magic: self.cfg.magic,
            deviation: self.cfg.max_slippage,
        };

        let max_attempts = self.cfg.max_retries + 1;
        let result = loop {
            order.attempts += 1;
            order.status = OrderStatus::Submitted;
            info!(
                "Submitting {} {} {} lot @ {:.5} SL {:.5} TP {:.5} (attempt {}/{})",
                order.client_tag, order.side, lot, price, stop_loss, take_profit,
                order.attempts, max_attempts
            );

            let err = match self.submit_once(&req).await {
                SubmitAttempt::Done(res) => break Ok(FillSource::Submitted(res)),
                SubmitAttempt::Adopted(bp) => break Ok(FillSource::Reconciled(bp)),
                SubmitAttempt::Failed(e) => e,
            };

            order.last_error = Some(err.to_string());
            let is_final = !err.is_transient() || order.attempts >= max_attempts;
            self.emit(
                EventKind::Reject,
                format!("{} {} rejected: {}", order.side, self.symbol, err),
                json!({
                    "client_tag": order.client_tag,
                    "attempt": order.attempts,
                    "final": is_final,
                    "error": err.to_string(),
                }),
            );
            if is_final {
                order.status = OrderStatus::Rejected;
                break Err(err);
            }
            order.status = OrderStatus::Retried;
            let delay = self.cfg.backoff(order.attempts);
            warn!("Order {} attempt {} failed: {}; retrying in {:?}", order.client_tag, order.attempts, err, delay);
            tokio::time::sleep(delay).await;
        };

        match result {
            Ok(source) => {
                let position = self.open_position(&mut order, signal, source);
                info!(
                    "✅ Filled {} {} {} lot @ {:.5} (position {})",
                    order.client_tag, position.side, position.lot_size, position.entry_price, position.position_id
                );
                self.emit(
                    EventKind::Fill,
                    format!(
                        "{} {} {} @ {:.5} SL {:.5} TP {:.5}",
                        position.side, position.lot_size, self.symbol,
                        position.entry_price, position.stop_loss, position.take_profit
                    ),
                    serde_json::to_value(&position).unwrap_or_default(),
                );
                state.position = Some(position.clone());
                state.last_order = Some(order);
                Ok(ExecutionOutcome::Filled(position))
            }
            Err(err) => {
                let attempts = order.attempts;
                warn!("Order {} abandoned after {} attempt(s): {}", order.client_tag, attempts, err);
                state.last_order = Some(order);
                Err(EngineError::BrokerRejectedFinal {
                    attempts,
                    reason: err.to_string(),
                })
            }
        }
    }

    /// One submit call under the order timeout. An unknown outcome is
    /// resolved against the broker's open positions before anything else.
    async fn submit_once(&self, req: &SubmitRequest) -> SubmitAttempt {
        let outcome = match tokio::time::timeout(self.cfg.order_timeout(), self.broker.submit_order(req)).await {
            Ok(r) => r,
            Err(_) => Err(BrokerError::Timeout),
        };
        match outcome {
            Ok(res) => SubmitAttempt::Done(res),
            Err(BrokerError::Timeout) => {
                warn!("Submit of {} timed out; checking broker positions", req.client_tag);
                match self.fetch_positions().await {
                    Ok(positions) => {
                        match positions.into_iter().find(|p| p.client_tag.as_deref() == Some(req.client_tag.as_str())) {
                            Some(bp) => SubmitAttempt::Adopted(bp),
                            None => SubmitAttempt::Failed(BrokerError::Timeout),
                        }
                    }
                    Err(e) => SubmitAttempt::Failed(BrokerError::Protocol(format!(
                        "submit outcome unknown, reconciliation failed: {}",
                        e
                    ))),
                }
            }
            Err(e) => SubmitAttempt::Failed(e),
        }
    }

    async fn fetch_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        match tokio::time::timeout(self.cfg.order_timeout(), self.broker.get_open_positions()).await {
            Ok(r) => r,
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    fn respect_stops_level(&self, signal: &Signal, price: f64) -> (f64, f64) {
        let min = self.min_stop_distance();
        let s = signal.side.sign();
        let mut sl = signal.stop_loss;
        let mut tp = signal.take_profit;
        if (price - sl) * s < min {
            sl = price - s * min;
            debug!("Stop widened to {:.5} for broker stops level", sl);
        }
        if (tp - price) * s < min {
            tp = price + s * min;
            debug!("Target widened to {:.5} for broker stops level", tp);
        }
        (sl, tp)
    }

    fn open_position(&self, order: &mut Order, signal: &Signal, source: FillSource) -> Position {
        order.status = OrderStatus::Filled;
        let (position_id, entry, opened_at, sl, tp) = match source {
            FillSource::Submitted(res) => {
                order.broker_order_id = Some(res.broker_order_id);
                (res.position_id, res.fill_price, res.filled_at, order.stop_loss, order.take_profit)
            }
            FillSource::Reconciled(bp) => {
                info!("Order {} found filled at broker after timeout", order.client_tag);
                (bp.position_id, bp.entry_price, bp.opened_at, bp.stop_loss, bp.take_profit)
            }
        };
        Position {
            order_ref: order.client_tag.clone(),
            position_id,
            side: order.side,
            lot_size: order.lot_size,
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            trailing_stop_price: None,
            opened_at,
            mode: Some(signal.mode),
            score: Some(signal.confluence_score),
            reason: signal.reason.clone(),
            value_per_point: order.lot_size * self.spec.pip_value,
        }
    }

    async fn tighten_existing(
        &self,
        state: &mut ExecutorState,
        signal: &Signal,
        quote: &Quote,
    ) -> Result<ExecutionOutcome, EngineError> {
        let Some(pos) = state.position.as_mut() else {
            return Ok(ExecutionOutcome::Ignored("no position".to_string()));
        };
        if signal.side != pos.side {
            return Ok(ExecutionOutcome::Ignored(format!(
                "{} position {} already open",
                pos.side, pos.position_id
            )));
        }
        let s = pos.side.sign();
        let price = quote.exit_price(pos.side);
        let candidate = signal.stop_loss;
        let tighter = (candidate - pos.stop_loss) * s > 0.0;
        let valid = (price - candidate) * s >= self.min_stop_distance().max(f64::EPSILON);
        if !tighter || !valid {
            return Ok(ExecutionOutcome::Ignored(format!(
                "position {} already open",
                pos.position_id
            )));
        }

        self.modify_stop(&pos.position_id, candidate).await?;
        info!("Tightened stop on {} to {:.5} from new signal", pos.position_id, candidate);
        pos.stop_loss = candidate;
        pos.trailing_stop_price = Some(candidate);
        let position_id = pos.position_id.clone();
        self.emit(
            EventKind::Trail,
            format!("{} stop tightened to {:.5}", position_id, candidate),
            json!({ "position_id": position_id, "new_stop": candidate, "source": "signal" }),
        );
        Ok(ExecutionOutcome::Tightened {
            position_id,
            new_stop: candidate,
        })
    }

    async fn modify_stop(&self, position_id: &str, new_stop: f64) -> Result<(), EngineError> {
        let res = match tokio::time::timeout(
            self.cfg.order_timeout(),
            self.broker.modify_stop(position_id, new_stop),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(BrokerError::Timeout),
        };
        res.map_err(|e| {
            if e.is_transient() {
                EngineError::BrokerTransient(e)
            } else {
                EngineError::BrokerRejectedFinal {
                    attempts: 1,
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Advance the open position's stop when price has moved far enough.
    /// Returns the new stop when one was set.
    pub async fn manage_trailing(&self, quote: &Quote) -> Result<Option<f64>, EngineError> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.position.as_mut() else {
            return Ok(None);
        };
        let price = quote.exit_price(pos.side);
        let settings = TrailingSettings::from(&self.cfg);
        let Some(new_stop) = next_trailing_stop(pos.side, pos.entry_price, pos.stop_loss, price, &settings)
        else {
            return Ok(None);
        };
        if (price - new_stop) * pos.side.sign() < self.min_stop_distance() {
            debug!("Trailing stop {:.5} inside broker stops level, waiting", new_stop);
            return Ok(None);
        }

        self.modify_stop(&pos.position_id, new_stop).await?;
        let old = pos.stop_loss;
        pos.stop_loss = new_stop;
        pos.trailing_stop_price = Some(new_stop);
        info!("🔄 Trailing stop {} {:.5} -> {:.5} (price {:.5})", pos.position_id, old, new_stop, price);
        self.emit(
            EventKind::Trail,
            format!("{} stop {:.5} -> {:.5}", pos.position_id, old, new_stop),
            json!({
                "position_id": pos.position_id,
                "old_stop": old,
                "new_stop": new_stop,
                "price": price,
            }),
        );
        Ok(Some(new_stop))
    }

    /// Bring local position state in line with the broker. The broker wins
    /// every disagreement.
    pub async fn sync_positions(&self, quote: &Quote) -> Result<SyncReport, EngineError> {
        let mut state = self.state.lock().await;
        let positions = self.fetch_positions().await.map_err(EngineError::BrokerTransient)?;
        let prefix = format!("{}-", self.cfg.magic);
        let mut ours: Vec<BrokerPosition> = positions
            .into_iter()
            .filter(|p| p.client_tag.as_deref().is_some_and(|t| t.starts_with(&prefix)))
            .collect();
        let mut report = SyncReport::default();

        match state.position.take() {
            Some(mut local) => match ours.iter().find(|p| p.position_id == local.position_id) {
                Some(remote) => {
                    let differs = (remote.stop_loss - local.stop_loss).abs() > 1e-9
                        || (remote.take_profit - local.take_profit).abs() > 1e-9
                        || (remote.lot - local.lot_size).abs() > 1e-9;
                    if differs {
                        let mismatch = EngineError::ReconciliationMismatch(format!(
                            "{} local SL {:.5} TP {:.5} lot {} vs broker SL {:.5} TP {:.5} lot {}",
                            local.position_id, local.stop_loss, local.take_profit, local.lot_size,
                            remote.stop_loss, remote.take_profit, remote.lot
                        ));
                        warn!("{}", mismatch);
                        local.stop_loss = remote.stop_loss;
                        local.take_profit = remote.take_profit;
                        local.lot_size = remote.lot;
                        local.value_per_point = remote.lot * self.spec.pip_value;
                        report.corrected = true;
                    }
                    state.position = Some(local);
                }
                None => {
                    let trade = self.close_locally(local, quote).await;
                    report.closed = Some(trade);
                }
            },
            None => {
                if let Some(remote) = ours.pop() {
                    if !ours.is_empty() {
                        warn!("{} extra position(s) of ours at broker; managing {}", ours.len(), remote.position_id);
                    }
                    warn!(
                        "{}",
                        EngineError::ReconciliationMismatch(format!(
                            "broker holds {} with no local record; adopting",
                            remote.position_id
                        ))
                    );
                    state.position = Some(self.adopt(remote));
                    report.adopted = true;
                }
            }
        }
        Ok(report)
    }

    fn adopt(&self, remote: BrokerPosition) -> Position {
        Position {
            order_ref: remote.client_tag.clone().unwrap_or_default(),
            position_id: remote.position_id,
            side: remote.side,
            lot_size: remote.lot,
            entry_price: remote.entry_price,
            stop_loss: remote.stop_loss,
            take_profit: remote.take_profit,
            trailing_stop_price: None,
            opened_at: remote.opened_at,
            mode: None,
            score: None,
            reason: "adopted from broker".to_string(),
            value_per_point: remote.lot * self.spec.pip_value,
        }
    }

    async fn close_locally(&self, position: Position, quote: &Quote) -> ClosedTrade {
        let deal = match tokio::time::timeout(
            self.cfg.order_timeout(),
            self.broker.closed_deal(&position.position_id),
        )
        .await
        {
            Ok(Ok(d)) => d,
            Ok(Err(e)) => {
                debug!("No close history for {}: {}", position.position_id, e);
                None
            }
            Err(_) => None,
        };

        let trade = match deal {
            Some(d) => ClosedTrade {
                exit_price: d.exit_price,
                pnl: d.pnl,
                reason: d.reason,
                closed_at: d.closed_at,
                position,
            },
            None => {
                let (exit_price, reason) = infer_exit(&position, quote);
                ClosedTrade {
                    exit_price,
                    pnl: round2(position.unrealized(exit_price)),
                    reason,
                    closed_at: quote.time,
                    position,
                }
            }
        };

        let icon = if trade.is_win() { "✅" } else { "❌" };
        info!(
            "{} Closed {} {} @ {:.5} ({}) pnl {:+.2}",
            icon, trade.position.position_id, trade.position.side, trade.exit_price, trade.reason, trade.pnl
        );
        self.emit(
            EventKind::Close,
            format!(
                "{} {} closed @ {:.5} ({}) pnl {:+.2}",
                trade.position.side, self.symbol, trade.exit_price, trade.reason, trade.pnl
            ),
            serde_json::to_value(&trade).unwrap_or_default(),
        );
        trade
    }
}

enum FillSource {
    Submitted(SubmitResult),
    Reconciled(BrokerPosition),
}

/// Best guess at how a position closed when the broker keeps no history.
fn infer_exit(position: &Position, quote: &Quote) -> (f64, CloseReason) {
    let s = position.side.sign();
    let price = quote.exit_price(position.side);
    if (price - position.stop_loss) * s <= 0.0 {
        (position.stop_loss, CloseReason::StopLoss)
    } else if (price - position.take_profit) * s >= 0.0 {
        (position.take_profit, CloseReason::TakeProfit)
    } else {
        (price, CloseReason::External)
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{PaperBroker, ReplayFeed};
    use crate::core::zones::Zone;
    use crate::models::{Side, StrategyMode, Timeframe};
    use crate::strategies::signals::ScoreBreakdown;
    use crate::test_helpers::{base_time, default_test_config, make_quote, make_tf_candles, test_symbol_spec};

    fn zone() -> Zone {
        serde_json::from_value(json!({
            "id": 1,
            "timeframe": "H1",
            "price_low": 98.0,
            "price_high": 100.0,
            "kind": "demand",
            "created_at": base_time(),
            "status": "active",
            "touches": 1,
            "age_bars": 4,
            "flipped_from": null
        }))
        .unwrap()
    }

    fn signal(entry: f64, sl: f64, tp: f64) -> Signal {
        Signal {
            side: Side::Buy,
            confluence_score: 0.8,
            zone: zone(),
            mode: StrategyMode::TrendFollow,
            timestamp: base_time(),
            aligned: true,
            fresh_flip: false,
            reversal: false,
            context: None,
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            breakdown: ScoreBreakdown::default(),
            reason: "demand H1 + pin bar".to_string(),
        }
    }

    fn paper(closes: &[f64], minute: i64) -> (Arc<ReplayFeed>, Arc<PaperBroker>) {
        let data: Vec<(f64, f64, f64, f64)> = closes.iter().map(|&c| (c, c + 0.2, c - 0.2, c)).collect();
        let mut feed = ReplayFeed::new(Timeframe::M1, 0.1);
        feed.load(Timeframe::M1, make_tf_candles(Timeframe::M1, &data).as_slice().to_vec());
        feed.set_time(base_time() + chrono::Duration::minutes(minute));
        let feed = Arc::new(feed);
        let broker = Arc::new(PaperBroker::ephemeral(1000.0, feed.clone(), test_symbol_spec()));
        (feed, broker)
    }

    fn executor(broker: Arc<PaperBroker>) -> OrderExecutor {
        OrderExecutor::new(&default_test_config(), broker, Notifier::silent(), test_symbol_spec())
    }

    #[tokio::test]
    async fn fills_then_ignores_second_signal() {
        let (_feed, broker) = paper(&[100.0], 1);
        let ex = executor(broker.clone());
        let q = make_quote(100.0, 100.1);

        let out = ex.execute(&signal(100.1, 97.5, 105.3), 0.1, &q).await.unwrap();
        assert!(matches!(out, ExecutionOutcome::Filled(_)));
        let order = ex.last_order().await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.attempts, 1);
        assert!(order.client_tag.starts_with("77775-"));

        // Same stop: nothing to tighten.
        let out = ex.execute(&signal(100.1, 97.5, 105.3), 0.1, &q).await.unwrap();
        assert!(matches!(out, ExecutionOutcome::Ignored(_)));
        assert_eq!(broker.get_open_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_signal_only_tightens_stop() {
        let (_feed, broker) = paper(&[100.0], 1);
        let ex = executor(broker.clone());
        let q = make_quote(100.0, 100.1);
        ex.execute(&signal(100.1, 97.5, 105.3), 0.1, &q).await.unwrap();

        let out = ex.execute(&signal(100.1, 98.5, 105.3), 0.1, &q).await.unwrap();
        assert!(matches!(out, ExecutionOutcome::Tightened { new_stop, .. } if (new_stop - 98.5).abs() < 1e-9));
        let remote = broker.get_open_positions().await.unwrap();
        assert_eq!(remote.len(), 1);
        assert!((remote[0].stop_loss - 98.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn wide_spread_and_slippage_drop() {
        let (_feed, broker) = paper(&[100.0], 1);
        let ex = executor(broker.clone());

        let out = ex
            .execute(&signal(100.1, 97.5, 105.3), 0.1, &make_quote(100.0, 101.0))
            .await
            .unwrap();
        assert!(matches!(out, ExecutionOutcome::Dropped(r) if r.contains("spread")));

        let out = ex
            .execute(&signal(99.0, 97.5, 105.3), 0.1, &make_quote(100.0, 100.1))
            .await
            .unwrap();
        assert!(matches!(out, ExecutionOutcome::Dropped(_)));
        assert!(broker.get_open_positions().await.unwrap().is_empty());
        assert!(ex.last_order().await.is_none());
    }

    #[tokio::test]
    async fn hard_rejection_is_final_without_retry() {
        let (_feed, broker) = paper(&[100.0], 1);
        let ex = executor(broker);
        // Below the broker minimum volume.
        let err = ex
            .execute(&signal(100.1, 97.5, 105.3), 0.001, &make_quote(100.0, 100.1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BrokerRejectedFinal { attempts: 1, .. }));
        assert_eq!(ex.last_order().await.unwrap().status, OrderStatus::Rejected);
        assert!(!ex.has_position().await);
    }

    #[tokio::test]
    async fn trails_and_detects_close() {
        let (feed, broker) = paper(&[100.0, 103.0, 104.5, 101.0], 1);
        let ex = executor(broker.clone());
        ex.execute(&signal(100.1, 97.5, 110.0), 0.1, &make_quote(100.0, 100.1))
            .await
            .unwrap();

        // Bid 103.0: profit 2.9 below the 3.0 trigger.
        feed.set_time(base_time() + chrono::Duration::minutes(2));
        assert_eq!(ex.manage_trailing(&make_quote(103.0, 103.1)).await.unwrap(), None);

        // Bid 104.5: stop to 103.5.
        feed.set_time(base_time() + chrono::Duration::minutes(3));
        let new_stop = ex.manage_trailing(&make_quote(104.5, 104.6)).await.unwrap();
        assert_eq!(new_stop, Some(103.5));
        assert_eq!(ex.position().await.unwrap().trailing_stop_price, Some(103.5));

        // Bid 101.0 crosses the trailed stop.
        feed.set_time(base_time() + chrono::Duration::minutes(4));
        let report = ex.sync_positions(&make_quote(101.0, 101.1)).await.unwrap();
        let trade = report.closed.unwrap();
        assert_eq!(trade.reason, CloseReason::StopLoss);
        assert!((trade.exit_price - 103.5).abs() < 1e-9);
        assert!(trade.is_win());
        assert!(!ex.has_position().await);
    }

    #[tokio::test]
    async fn adopts_tagged_orphan_position() {
        let (_feed, broker) = paper(&[100.0], 1);
        broker
            .submit_order(&SubmitRequest {
                side: Side::Sell,
                lot: 0.2,
                entry_price: 100.0,
                stop_loss: 102.0,
                take_profit: 96.0,
                client_tag: "77775-42".to_string(),
                magic: 77775,
                deviation: 0.5,
            })
            .await
            .unwrap();
        let ex = executor(broker);
        let report = ex.sync_positions(&make_quote(100.0, 100.1)).await.unwrap();
        assert!(report.adopted);
        let pos = ex.position().await.unwrap();
        assert_eq!(pos.side, Side::Sell);
        assert_eq!(pos.order_ref, "77775-42");
    }

    #[test]
    fn infers_exit_reason_from_quote() {
        let pos = Position {
            order_ref: "77775-1".into(),
            position_id: "1".into(),
            side: Side::Buy,
            lot_size: 0.1,
            entry_price: 100.0,
            stop_loss: 98.0,
            take_profit: 104.0,
            trailing_stop_price: None,
            opened_at: base_time(),
            mode: None,
            score: None,
            reason: String::new(),
            value_per_point: 0.1,
        };
        assert_eq!(infer_exit(&pos, &make_quote(97.9, 98.0)), (98.0, CloseReason::StopLoss));
        assert_eq!(infer_exit(&pos, &make_quote(104.2, 104.3)), (104.0, CloseReason::TakeProfit));
        assert_eq!(infer_exit(&pos, &make_quote(101.0, 101.1)).1, CloseReason::External);
    }
}
