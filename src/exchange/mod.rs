pub mod bridge;
pub mod paper;
pub mod replay;

pub use bridge::BridgeClient;
pub use paper::PaperBroker;
pub use replay::ReplayFeed;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::models::{AccountInfo, CandleSeries, CloseReason, Quote, Side, SymbolSpec, Timeframe};

/// Source of completed bars and live quotes for one instrument.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Up to `count` completed bars, oldest first.
    async fn fetch_bars(&self, tf: Timeframe, count: usize) -> Result<CandleSeries>;
    async fn get_quote(&self) -> Result<Quote>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub side: Side,
    pub lot: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// `<magic>-<local id>`; lets reconciliation recognise our own fills.
    pub client_tag: String,
    pub magic: u64,
    /// Largest acceptable distance between `entry_price` and the fill.
    pub deviation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub broker_order_id: String,
    pub position_id: String,
    pub fill_price: f64,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub position_id: String,
    pub side: Side,
    pub lot: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    #[serde(default)]
    pub client_tag: Option<String>,
    pub opened_at: DateTime<Utc>,
}

/// Final state of a position the broker no longer reports as open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedDeal {
    pub position_id: String,
    pub exit_price: f64,
    pub pnl: f64,
    pub reason: CloseReason,
    pub closed_at: DateTime<Utc>,
}

/// Order and position endpoint for one instrument.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitResult, BrokerError>;
    async fn modify_stop(&self, position_id: &str, new_stop: f64) -> Result<(), BrokerError>;
    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
    async fn account_info(&self) -> Result<AccountInfo, BrokerError>;
    async fn symbol_spec(&self) -> Result<SymbolSpec, BrokerError>;

    /// Exit details of a closed position, when the broker keeps history.
    async fn closed_deal(&self, _position_id: &str) -> Result<Option<ClosedDeal>, BrokerError> {
        Ok(None)
    }
}
