use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::BrokerError;
use crate::exchange::{Broker, BrokerPosition, ClosedDeal, MarketData, SubmitRequest, SubmitResult};
use crate::models::{AccountInfo, CloseReason, Quote, Side, SymbolSpec};

const RETCODE_REQUOTE: i64 = 10004;
const RETCODE_INVALID_REQUEST: i64 = 10013;
const RETCODE_INVALID_VOLUME: i64 = 10014;
const RETCODE_INVALID_STOPS: i64 = 10016;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PaperState {
    balance: f64,
    order_counter: u64,
    positions: Vec<BrokerPosition>,
    history: Vec<ClosedDeal>,
    #[serde(skip)]
    last_quote: Option<Quote>,
}

/// Simulated broker: fills at the live quote, enforces volume and stop
/// distance limits, closes positions when the quote crosses stop or target.
pub struct PaperBroker {
    market: Arc<dyn MarketData>,
    spec: SymbolSpec,
    state: Mutex<PaperState>,
    state_file: Option<String>,
}

impl PaperBroker {
    pub fn new(cfg: &Config, market: Arc<dyn MarketData>, spec: SymbolSpec) -> Self {
        let broker = Self {
            market,
            spec,
            state: Mutex::new(PaperState {
                balance: cfg.initial_balance,
                ..PaperState::default()
            }),
            state_file: Some(format!("{}/paper_broker.json", cfg.log_dir)),
        };
        broker.load_state();
        broker
    }

    /// A broker that starts from `balance` and never touches disk.
    pub fn ephemeral(balance: f64, market: Arc<dyn MarketData>, spec: SymbolSpec) -> Self {
        Self {
            market,
            spec,
            state: Mutex::new(PaperState {
                balance,
                ..PaperState::default()
            }),
            state_file: None,
        }
    }

    pub fn balance(&self) -> f64 {
        self.state.lock().map(|s| s.balance).unwrap_or(0.0)
    }

    async fn quote(&self) -> Result<Quote, BrokerError> {
        let quote = self
            .market
            .get_quote()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        if let Ok(mut state) = self.state.lock() {
            state.last_quote = Some(quote);
        }
        Ok(quote)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PaperState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Protocol("paper state poisoned".to_string()))
    }

    fn pnl(&self, side: Side, entry: f64, exit: f64, lot: f64) -> f64 {
        round2((exit - entry) * side.sign() * lot * self.spec.pip_value)
    }

    /// Close every position whose stop or target the quote has crossed.
    fn check_positions(&self, state: &mut PaperState, quote: &Quote) -> Vec<ClosedDeal> {
        let mut closed = Vec::new();
        let mut still_open = Vec::with_capacity(state.positions.len());

        for pos in state.positions.drain(..) {
            let mark = quote.exit_price(pos.side);
            let s = pos.side.sign();
            let hit_sl = pos.stop_loss > 0.0 && (mark - pos.stop_loss) * s <= 0.0;
            let hit_tp = pos.take_profit > 0.0 && (mark - pos.take_profit) * s >= 0.0;

            let exit = if hit_sl {
                Some((pos.stop_loss, CloseReason::StopLoss))
            } else if hit_tp {
                Some((pos.take_profit, CloseReason::TakeProfit))
            } else {
                None
            };

            match exit {
                Some((price, reason)) => {
                    let pnl = self.pnl(pos.side, pos.entry_price, price, pos.lot);
                    closed.push(ClosedDeal {
                        position_id: pos.position_id.clone(),
                        exit_price: price,
                        pnl,
                        reason,
                        closed_at: quote.time,
                    });
                }
                None => still_open.push(pos),
            }
        }

        state.positions = still_open;
        for deal in &closed {
            state.balance = round2(state.balance + deal.pnl);
            info!(
                "Paper close {} at {:.5} ({}) pnl {:+.2}",
                deal.position_id, deal.exit_price, deal.reason, deal.pnl
            );
        }
        state.history.extend(closed.iter().cloned());
        closed
    }

    fn save_state(&self, state: &PaperState) {
        let Some(file) = &self.state_file else {
            return;
        };
        let _ = fs::create_dir_all(Path::new(file).parent().unwrap_or(Path::new("logs")));
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = fs::write(file, json) {
                    warn!("Failed to write paper state: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize paper state: {}", e),
        }
    }

    fn load_state(&self) {
        let Some(file) = &self.state_file else {
            return;
        };
        let Ok(content) = fs::read_to_string(file) else {
            return;
        };
        match serde_json::from_str::<PaperState>(&content) {
            Ok(loaded) => {
                if let Ok(mut state) = self.state.lock() {
                    info!(
                        "Loaded paper state: balance {:.2}, {} open position(s)",
                        loaded.balance,
                        loaded.positions.len()
                    );
                    *state = loaded;
                }
            }
            Err(e) => warn!("Ignoring unreadable paper state {}: {}", file, e),
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitResult, BrokerError> {
        let quote = self.quote().await?;
        let fill = quote.entry_price(req.side);

        if (fill - req.entry_price).abs() > req.deviation {
            return Err(BrokerError::Rejected {
                code: RETCODE_REQUOTE,
                reason: format!("requote: {:.5} vs requested {:.5}", fill, req.entry_price),
                retryable: true,
            });
        }
        if req.lot < self.spec.min_lot || req.lot > self.spec.max_lot {
            return Err(BrokerError::Rejected {
                code: RETCODE_INVALID_VOLUME,
                reason: format!("invalid volume {}", req.lot),
                retryable: false,
            });
        }
        let min_dist = self.spec.stops_level;
        let s = req.side.sign();
        if (fill - req.stop_loss) * s < min_dist || (req.take_profit - fill) * s < min_dist {
            return Err(BrokerError::Rejected {
                code: RETCODE_INVALID_STOPS,
                reason: "invalid stops".to_string(),
                retryable: false,
            });
        }

        let mut state = self.lock()?;
        state.order_counter += 1;
        let id = state.order_counter.to_string();
        state.positions.push(BrokerPosition {
            position_id: id.clone(),
            side: req.side,
            lot: req.lot,
            entry_price: fill,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            client_tag: Some(req.client_tag.clone()),
            opened_at: quote.time,
        });
        self.save_state(&state);
        info!(
            "Paper fill {} {} {} at {:.5} (SL {:.5} TP {:.5})",
            req.client_tag, req.side, req.lot, fill, req.stop_loss, req.take_profit
        );

        Ok(SubmitResult {
            broker_order_id: id.clone(),
            position_id: id,
            fill_price: fill,
            filled_at: quote.time,
        })
    }

    async fn modify_stop(&self, position_id: &str, new_stop: f64) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let pos = state
            .positions
            .iter_mut()
            .find(|p| p.position_id == position_id)
            .ok_or_else(|| BrokerError::Rejected {
                code: RETCODE_INVALID_REQUEST,
                reason: format!("position {} not found", position_id),
                retryable: false,
            })?;
        pos.stop_loss = new_stop;
        self.save_state(&state);
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let quote = self.quote().await?;
        let mut state = self.lock()?;
        let closed = self.check_positions(&mut state, &quote);
        if !closed.is_empty() {
            self.save_state(&state);
        }
        Ok(state.positions.clone())
    }

    async fn account_info(&self) -> Result<AccountInfo, BrokerError> {
        let state = self.lock()?;
        let unrealized: f64 = match &state.last_quote {
            Some(q) => state
                .positions
                .iter()
                .map(|p| self.pnl(p.side, p.entry_price, q.exit_price(p.side), p.lot))
                .sum(),
            None => 0.0,
        };
        Ok(AccountInfo {
            balance: state.balance,
            equity: round2(state.balance + unrealized),
        })
    }

    async fn symbol_spec(&self) -> Result<SymbolSpec, BrokerError> {
        Ok(self.spec)
    }

    async fn closed_deal(&self, position_id: &str) -> Result<Option<ClosedDeal>, BrokerError> {
        let state = self.lock()?;
        Ok(state
            .history
            .iter()
            .find(|d| d.position_id == position_id)
            .cloned())
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
