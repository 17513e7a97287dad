//! HTTP client for the terminal bridge that fronts the broker terminal.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::BrokerError;
use crate::exchange::{Broker, BrokerPosition, ClosedDeal, MarketData, SubmitRequest, SubmitResult};
use crate::models::{
    AccountInfo, Candle, CandleSeries, CloseReason, Quote, Side, SymbolSpec, Timeframe,
};

const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);
const BAR_CACHE_TTL: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const TOKEN_TTL_SECS: u64 = 120;

const RETCODE_DONE: i64 = 10009;
const RETCODE_PLACED: i64 = 10008;

/// Requote, price changed, price off, timeout, connection, too many requests.
const RETRYABLE_RETCODES: &[i64] = &[10004, 10020, 10021, 10012, 10031, 10024];

#[derive(Debug, Serialize)]
struct JwtClaims {
    sub: String,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    bars: Vec<RawBar>,
}

#[derive(Debug, Deserialize)]
struct RawBar {
    time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    tick_volume: f64,
}

#[derive(Debug, Deserialize)]
struct RawQuote {
    bid: f64,
    ask: f64,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct TradeResponse {
    retcode: i64,
    #[serde(default)]
    order: u64,
    #[serde(default)]
    position: u64,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    comment: String,
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    ticket: u64,
    #[serde(rename = "type")]
    kind: i64,
    volume: f64,
    price_open: f64,
    sl: f64,
    tp: f64,
    #[serde(default)]
    comment: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct RawSymbol {
    point: f64,
    volume_min: f64,
    volume_max: f64,
    volume_step: f64,
    trade_tick_value: f64,
    trade_tick_size: f64,
    #[serde(default)]
    trade_stops_level: f64,
}

#[derive(Debug, Deserialize)]
struct RawHistory {
    closed: bool,
    #[serde(default)]
    price: f64,
    #[serde(default)]
    profit: f64,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    time: i64,
}

#[derive(Default)]
struct ClientState {
    last_request: Option<Instant>,
    cache: HashMap<String, (Instant, CandleSeries)>,
}

pub struct BridgeClient {
    client: Client,
    base_url: String,
    secret: String,
    symbol: String,
    state: Mutex<ClientState>,
}

impl BridgeClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: cfg.bridge_url.trim_end_matches('/').to_string(),
            secret: cfg.bridge_secret.clone(),
            symbol: cfg.symbol.clone(),
            state: Mutex::new(ClientState::default()),
        })
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        let claims = JwtClaims {
            sub: "zone-trader".to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECS,
        };
        let key = EncodingKey::from_secret(self.secret.as_bytes());
        encode(&Header::new(Algorithm::HS256), &claims, &key).context("Failed to encode JWT")
    }

    async fn rate_limit(&self) {
        let wait = {
            let mut state = self.state.lock().await;
            let wait = state
                .last_request
                .map(|last| MIN_REQUEST_INTERVAL.saturating_sub(last.elapsed()))
                .unwrap_or_default();
            state.last_request = Some(Instant::now() + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BrokerError> {
        self.rate_limit().await;
        let jwt = self
            .generate_jwt()
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;

        let resp = req
            .header("Authorization", format!("Bearer {}", jwt))
            .send()
            .await
            .map_err(map_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(BrokerError::Connection(format!("bridge {}: {}", status, body)));
            }
            return Err(BrokerError::Protocol(format!("bridge {}: {}", status, body)));
        }

        resp.json::<T>()
            .await
            .map_err(|e| BrokerError::Protocol(format!("decode: {}", e)))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn fetch_bars(&self, tf: Timeframe, count: usize) -> Result<CandleSeries> {
        let cache_key = format!("{}_{}_{}", self.symbol, tf, count);
        {
            let state = self.state.lock().await;
            if let Some((cached_at, series)) = state.cache.get(&cache_key) {
                if cached_at.elapsed() < BAR_CACHE_TTL {
                    return Ok(series.clone());
                }
            }
        }

        // One extra bar: the terminal includes the one still forming.
        let req = self.client.get(self.url("/bars")).query(&[
            ("symbol", self.symbol.clone()),
            ("timeframe", tf.as_str().to_string()),
            ("count", (count + 1).to_string()),
        ]);
        let data: BarsResponse = self
            .send(req)
            .await
            .with_context(|| format!("Failed to fetch {} bars", tf))?;

        let mut candles: Vec<Candle> = data
            .bars
            .into_iter()
            .filter_map(|rb| {
                Some(Candle {
                    timestamp: DateTime::from_timestamp(rb.time, 0)?,
                    open: rb.open,
                    high: rb.high,
                    low: rb.low,
                    close: rb.close,
                    volume: rb.tick_volume,
                })
            })
            .collect();
        candles.sort_by_key(|c| c.timestamp);

        let now = Utc::now();
        if let Some(last) = candles.last() {
            let closes_at = last.timestamp + chrono::Duration::seconds(tf.as_seconds() as i64);
            if closes_at > now {
                candles.pop();
            }
        }
        let mut series = CandleSeries::new(candles);
        series.truncate_front(count);

        self.state
            .lock()
            .await
            .cache
            .insert(cache_key, (Instant::now(), series.clone()));

        Ok(series)
    }

    pub async fn get_quote(&self) -> Result<Quote> {
        let req = self
            .client
            .get(self.url("/quote"))
            .query(&[("symbol", self.symbol.as_str())]);
        let raw: RawQuote = self.send(req).await.context("Failed to fetch quote")?;
        if raw.bid <= 0.0 || raw.ask <= 0.0 {
            bail!("Empty quote for {}", self.symbol);
        }
        Ok(Quote {
            bid: raw.bid,
            ask: raw.ask,
            time: DateTime::from_timestamp(raw.time, 0).unwrap_or_else(Utc::now),
        })
    }
}

fn map_transport(e: reqwest::Error) -> BrokerError {
    if e.is_timeout() {
        BrokerError::Timeout
    } else {
        BrokerError::Connection(e.to_string())
    }
}

fn map_retcode(retcode: i64, comment: &str) -> BrokerError {
    BrokerError::Rejected {
        code: retcode,
        reason: if comment.is_empty() {
            format!("retcode {}", retcode)
        } else {
            comment.to_string()
        },
        retryable: RETRYABLE_RETCODES.contains(&retcode),
    }
}

fn parse_close_reason(s: &str) -> CloseReason {
    match s.to_lowercase().as_str() {
        "sl" | "stop_loss" => CloseReason::StopLoss,
        "tp" | "take_profit" => CloseReason::TakeProfit,
        _ => CloseReason::External,
    }
}

#[async_trait]
impl MarketData for BridgeClient {
    async fn fetch_bars(&self, tf: Timeframe, count: usize) -> Result<CandleSeries> {
        BridgeClient::fetch_bars(self, tf, count).await
    }

    async fn get_quote(&self) -> Result<Quote> {
        BridgeClient::get_quote(self).await
    }
}

#[async_trait]
impl Broker for BridgeClient {
    async fn submit_order(&self, req: &SubmitRequest) -> Result<SubmitResult, BrokerError> {
        let body = serde_json::json!({
            "symbol": self.symbol,
            "side": req.side,
            "volume": req.lot,
            "price": req.entry_price,
            "sl": req.stop_loss,
            "tp": req.take_profit,
            "magic": req.magic,
            "comment": req.client_tag,
            "deviation": req.deviation,
            "type_filling": "FOK",
        });
        let resp: TradeResponse = self
            .send(self.client.post(self.url("/orders")).json(&body))
            .await?;

        if resp.retcode != RETCODE_DONE && resp.retcode != RETCODE_PLACED {
            warn!("Bridge rejected {}: {} {}", req.client_tag, resp.retcode, resp.comment);
            return Err(map_retcode(resp.retcode, &resp.comment));
        }
        debug!("Bridge filled {} as order {}", req.client_tag, resp.order);

        Ok(SubmitResult {
            broker_order_id: resp.order.to_string(),
            position_id: if resp.position != 0 {
                resp.position.to_string()
            } else {
                resp.order.to_string()
            },
            fill_price: if resp.price > 0.0 { resp.price } else { req.entry_price },
            filled_at: Utc::now(),
        })
    }

    async fn modify_stop(&self, position_id: &str, new_stop: f64) -> Result<(), BrokerError> {
        let body = serde_json::json!({ "symbol": self.symbol, "sl": new_stop });
        let path = format!("/positions/{}/sl", position_id);
        let resp: TradeResponse = self
            .send(self.client.post(self.url(&path)).json(&body))
            .await?;
        if resp.retcode != RETCODE_DONE {
            return Err(map_retcode(resp.retcode, &resp.comment));
        }
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let req = self
            .client
            .get(self.url("/positions"))
            .query(&[("symbol", self.symbol.as_str())]);
        let resp: PositionsResponse = self.send(req).await?;

        Ok(resp
            .positions
            .into_iter()
            .map(|p| BrokerPosition {
                position_id: p.ticket.to_string(),
                side: if p.kind == 0 { Side::Buy } else { Side::Sell },
                lot: p.volume,
                entry_price: p.price_open,
                stop_loss: p.sl,
                take_profit: p.tp,
                client_tag: (!p.comment.is_empty()).then_some(p.comment),
                opened_at: DateTime::from_timestamp(p.time, 0).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    async fn account_info(&self) -> Result<AccountInfo, BrokerError> {
        self.send(self.client.get(self.url("/account"))).await
    }

    async fn symbol_spec(&self) -> Result<SymbolSpec, BrokerError> {
        let req = self
            .client
            .get(self.url("/symbol"))
            .query(&[("symbol", self.symbol.as_str())]);
        let raw: RawSymbol = self.send(req).await?;
        if raw.trade_tick_size <= 0.0 {
            return Err(BrokerError::Protocol("symbol has zero tick size".to_string()));
        }
        Ok(SymbolSpec {
            point: raw.point,
            min_lot: raw.volume_min,
            max_lot: raw.volume_max,
            lot_step: raw.volume_step,
            pip_value: raw.trade_tick_value / raw.trade_tick_size,
            stops_level: raw.trade_stops_level * raw.point,
        })
    }

    async fn closed_deal(&self, position_id: &str) -> Result<Option<ClosedDeal>, BrokerError> {
        let path = format!("/history/positions/{}", position_id);
        let raw: RawHistory = self.send(self.client.get(self.url(&path))).await?;
        if !raw.closed {
            return Ok(None);
        }
        Ok(Some(ClosedDeal {
            position_id: position_id.to_string(),
            exit_price: raw.price,
            pnl: raw.profit,
            reason: parse_close_reason(&raw.reason),
            closed_at: DateTime::from_timestamp(raw.time, 0).unwrap_or_else(Utc::now),
        }))
    }
}
