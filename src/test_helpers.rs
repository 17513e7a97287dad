use chrono::{DateTime, Duration, Utc};

use crate::config::{
    AdaptiveConfig, Config, ExecutionConfig, FalseBreakoutConfig, GuardConfig, IndicatorConfig, ScoreWeights,
    TrendConfig, ZoneConfig,
};
use crate::models::{Candle, CandleSeries, Quote, StrategyMode, SymbolSpec, Timeframe};

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-15T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Create candles from (open, high, low, close) tuples with auto-incrementing 1m timestamps.
pub fn make_candles(data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    make_tf_candles(Timeframe::M1, data)
}

/// Same as [`make_candles`] but spaced one `tf` bar apart.
pub fn make_tf_candles(tf: Timeframe, data: &[(f64, f64, f64, f64)]) -> CandleSeries {
    let base = base_time();
    let step = tf.as_seconds() as i64;

    let candles: Vec<Candle> = data
        .iter()
        .enumerate()
        .map(|(i, &(o, h, l, c))| Candle {
            timestamp: base + Duration::seconds(step * i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        })
        .collect();

    CandleSeries::new(candles)
}

/// Create n rising (bullish) candles starting from `start` price.
pub fn make_bullish_trend(n: usize, start: f64) -> CandleSeries {
    let base = base_time();

    let candles: Vec<Candle> = (0..n)
        .map(|i| {
            let open = start + i as f64 * 10.0;
            let close = open + 8.0;
            Candle {
                timestamp: base + Duration::minutes(i as i64),
                open,
                high: close + 2.0,
                low: open - 1.0,
                close,
                volume: 100.0,
            }
        })
        .collect();

    CandleSeries::new(candles)
}

/// Create n falling (bearish) candles starting from `start` price.
pub fn make_bearish_trend(n: usize, start: f64) -> CandleSeries {
    let base = base_time();

    let candles: Vec<Candle> = (0..n)
        .map(|i| {
            let open = start - i as f64 * 10.0;
            let close = open - 8.0;
            Candle {
                timestamp: base + Duration::minutes(i as i64),
                open,
                high: open + 1.0,
                low: close - 2.0,
                close,
                volume: 100.0,
            }
        })
        .collect();

    CandleSeries::new(candles)
}

pub fn make_quote(bid: f64, ask: f64) -> Quote {
    Quote {
        bid,
        ask,
        time: base_time(),
    }
}

pub fn test_symbol_spec() -> SymbolSpec {
    SymbolSpec {
        point: 0.01,
        min_lot: 0.01,
        max_lot: 100.0,
        lot_step: 0.01,
        pip_value: 1.0,
        stops_level: 0.0,
    }
}

/// A Config suitable for testing: paper mode, prices around 100, temp log dir.
pub fn default_test_config() -> Config {
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
            retry_backoff_ms: 10,
            order_timeout_ms: 200,
            trailing_trigger: 3.0,
            trailing_step: 1.0,
            trailing_distance: 1.0,
            stops_level_mult: 1.2,
            magic: 77775,
            max_quote_age_ms: 0,
        },
        poll_interval_secs: 1,
        data_timeout_ms: 200,
        notify_timeout_ms: 200,
        summary_time: (23, 58),
        summary_tz: "UTC".to_string(),
        log_dir: std::env::temp_dir()
            .join("zone_trader_test")
            .to_string_lossy()
            .to_string(),
        log_level: "ERROR".to_string(),
    }
}
