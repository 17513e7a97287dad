use crate::models::{StrategyMode, Timeframe};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub type SharedConfig = Arc<RwLock<Config>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Timeframes whose zones are tracked.
    pub timeframes: Vec<Timeframe>,
    /// Timeframe whose zones can originate a signal.
    pub trading_tf: Timeframe,
    /// Bars on each side of a pivot.
    pub swing_size: usize,
    /// Bounded history kept per timeframe.
    pub lookback: usize,
    /// Close beyond the zone edge (price units) that flips a zone.
    pub flip_displacement: f64,
    /// Bars a breached zone has to react before it is invalidated.
    pub invalidation_bars: usize,
    /// Touches after which a zone is exhausted.
    pub max_touches: u32,
    /// Distance from the band (price units) still counted as interacting.
    pub proximity: f64,
    /// A flipped zone younger than this many bars counts as a fresh flip.
    pub fresh_flip_bars: usize,
    pub max_zones_per_tf: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendConfig {
    pub timeframes: Vec<Timeframe>,
    pub ma_period: usize,
    /// Relative band around the moving average treated as flat.
    pub flat_band: f64,
    pub structure_lookback: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub zone: f64,
    pub reaction: f64,
    pub alignment: f64,
    pub htf_zone: f64,
    pub freshness: f64,
    /// MACD, RSI and VWAP confirmation, scored as the share that agree.
    pub indicators: f64,
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.zone + self.reaction + self.alignment + self.htf_zone + self.freshness + self.indicators
    }
}

/// Periods and levels of the confirming indicators on the entry timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub rsi_period: usize,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
}

/// Threshold shift driven by volatility. ATR is compared with the zone
/// proximity band: at or above `high_ratio` the thresholds drop by
/// `shift`, at or below `low_ratio` they rise by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Zero disables the adjustment.
    pub shift: f64,
    pub high_ratio: f64,
    pub low_ratio: f64,
}

/// Reversal entries when a zone is broken and immediately reclaimed by an
/// engulfing bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FalseBreakoutConfig {
    pub enabled: bool,
    /// Close beyond the zone edge (price units) the breakout bar needs.
    pub min_penetration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub max_spread: f64,
    pub max_slippage: f64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub order_timeout_ms: u64,
    /// Profit (price units) before trailing starts.
    pub trailing_trigger: f64,
    /// Minimum advance (price units) of a trailing stop update.
    pub trailing_step: f64,
    /// Distance (price units) the trailing stop keeps behind price.
    pub trailing_distance: f64,
    /// Stops are kept at least `stops_level * stops_level_mult` from entry.
    pub stops_level_mult: f64,
    pub magic: u64,
    /// Oldest live quote (ms) an order may be priced from. Zero disables.
    pub max_quote_age_ms: u64,
}

impl ExecutionConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    pub fn max_quote_age(&self) -> Option<chrono::Duration> {
        (self.max_quote_age_ms > 0).then(|| chrono::Duration::milliseconds(self.max_quote_age_ms as i64))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Fraction of start-of-day equity.
    pub max_daily_loss: f64,
    /// Fraction of peak equity.
    pub max_drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Instrument & connectivity
    pub symbol: String,
    pub bridge_url: String,
    pub bridge_secret: String,
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub telegram_quiet: bool,

    // Paper trading
    pub paper_trade: bool,
    pub initial_balance: f64,

    // Strategy
    pub strategy_mode: StrategyMode,
    pub trend_follow_threshold: f64,
    pub aggressive_threshold: f64,
    pub entry_tf: Timeframe,
    pub zones: ZoneConfig,
    pub trend: TrendConfig,
    pub weights: ScoreWeights,
    pub indicators: IndicatorConfig,
    pub adaptive: AdaptiveConfig,
    pub false_breakout: FalseBreakoutConfig,
    /// Lower timeframe whose trend must not oppose an entry.
    pub context_tf: Option<Timeframe>,

    // Stops & targets
    pub atr_period: usize,
    pub sl_buffer: f64,
    pub trend_stop_atr_mult: f64,
    pub aggressive_stop_atr_mult: f64,
    pub tp_ratio: f64,

    // Risk
    pub risk_fraction: f64,
    pub guard: GuardConfig,

    pub execution: ExecutionConfig,

    // Timing
    pub poll_interval_secs: u64,
    pub data_timeout_ms: u64,
    pub notify_timeout_ms: u64,
    pub summary_time: (u32, u32),
    pub summary_tz: String,

    // Logging
    pub log_dir: String,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let env = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let num = |key: &str, default: f64| -> f64 {
            env(key, "").parse().unwrap_or(default)
        };
        let int = |key: &str, default: u64| -> u64 {
            env(key, "").parse().unwrap_or(default)
        };

        let trading_tf = Timeframe::from_str_loose(&env("TRADING_TF", "H1")).unwrap_or(Timeframe::H1);
        let mut zone_tfs = Timeframe::parse_list(&env("ZONE_TFS", "H1,H4"));
        if !zone_tfs.contains(&trading_tf) {
            zone_tfs.push(trading_tf);
            zone_tfs.sort();
        }

        let summary_time = env("SUMMARY_TIME", "23:58")
            .split_once(':')
            .and_then(|(h, m)| Some((h.parse().ok()?, m.parse().ok()?)))
            .unwrap_or((23, 58));

        Config {
            symbol: env("SYMBOL", "Volatility 75 Index"),
            bridge_url: env("BRIDGE_URL", "http://127.0.0.1:8787"),
            bridge_secret: env("BRIDGE_SECRET", ""),
            telegram_bot_token: env("TELEGRAM_BOT_TOKEN", ""),
            telegram_chat_id: env("TELEGRAM_CHAT_ID", ""),
            telegram_quiet: env("TELEGRAM_QUIET", "false").to_lowercase() == "true",
            paper_trade: env("PAPER_TRADE", "true").to_lowercase() == "true",
            initial_balance: num("INITIAL_BALANCE", 1000.0),
            strategy_mode: StrategyMode::from_str_loose(&env("STRATEGY_MODE", "trend_follow"))
                .unwrap_or(StrategyMode::TrendFollow),
            trend_follow_threshold: num("TREND_FOLLOW_THRESHOLD", 0.7),
            aggressive_threshold: num("AGGRESSIVE_THRESHOLD", 0.5),
            entry_tf: Timeframe::from_str_loose(&env("ENTRY_TF", "M1")).unwrap_or(Timeframe::M1),
            zones: ZoneConfig {
                timeframes: zone_tfs,
                trading_tf,
                swing_size: int("ZONE_SWING_SIZE", 5) as usize,
                lookback: int("ZONE_LOOKBACK", 100) as usize,
                flip_displacement: num("ZONE_FLIP_DISPLACEMENT", 20000.0),
                invalidation_bars: int("ZONE_INVALIDATION_BARS", 3) as usize,
                max_touches: int("ZONE_MAX_TOUCHES", 3) as u32,
                proximity: num("ZONE_PROXIMITY", 30000.0),
                fresh_flip_bars: int("ZONE_FRESH_FLIP_BARS", 3) as usize,
                max_zones_per_tf: int("ZONE_MAX_PER_TF", 20) as usize,
            },
            trend: TrendConfig {
                timeframes: Timeframe::parse_list(&env("TREND_TFS", "H1,H4")),
                ma_period: int("TREND_MA_PERIOD", 50) as usize,
                flat_band: num("TREND_FLAT_BAND", 0.0005),
                structure_lookback: int("TREND_STRUCTURE_LOOKBACK", 5) as usize,
            },
            weights: ScoreWeights {
                zone: num("WEIGHT_ZONE", 0.30),
                reaction: num("WEIGHT_REACTION", 0.25),
                alignment: num("WEIGHT_ALIGNMENT", 0.30),
                htf_zone: num("WEIGHT_HTF_ZONE", 0.10),
                freshness: num("WEIGHT_FRESHNESS", 0.05),
                indicators: num("WEIGHT_INDICATORS", 0.15),
            },
            indicators: IndicatorConfig {
                macd_fast: int("MACD_FAST", 12) as usize,
                macd_slow: int("MACD_SLOW", 26) as usize,
                macd_signal: int("MACD_SIGNAL", 9) as usize,
                rsi_period: int("RSI_PERIOD", 14) as usize,
                rsi_oversold: num("RSI_OVERSOLD", 30.0),
                rsi_overbought: num("RSI_OVERBOUGHT", 70.0),
            },
            adaptive: AdaptiveConfig {
                shift: num("ADAPTIVE_THRESHOLD_SHIFT", 0.1),
                high_ratio: num("ADAPTIVE_HIGH_ATR_RATIO", 2.0),
                low_ratio: num("ADAPTIVE_LOW_ATR_RATIO", 0.8),
            },
            false_breakout: FalseBreakoutConfig {
                enabled: env("FALSE_BREAKOUT", "true").to_lowercase() == "true",
                min_penetration: num("FALSE_BREAKOUT_MIN_PENETRATION", 10000.0),
            },
            context_tf: Timeframe::from_str_loose(&env("CONTEXT_TF", "M5")),
            atr_period: int("ATR_PERIOD", 14) as usize,
            sl_buffer: num("SL_BUFFER", 15000.0),
            trend_stop_atr_mult: num("TREND_STOP_ATR_MULT", 2.0),
            aggressive_stop_atr_mult: num("AGGRESSIVE_STOP_ATR_MULT", 1.0),
            tp_ratio: num("TP_RATIO", 2.0),
            risk_fraction: num("RISK_FRACTION", 0.01),
            guard: GuardConfig {
                max_daily_loss: num("MAX_DAILY_LOSS", 0.05),
                max_drawdown: num("MAX_DRAWDOWN", 0.10),
            },
            execution: ExecutionConfig {
                max_spread: num("MAX_SPREAD", 5000.0),
                max_slippage: num("MAX_SLIPPAGE", 5000.0),
                max_retries: int("MAX_RETRIES", 3) as u32,
                retry_backoff_ms: int("RETRY_BACKOFF_MS", 500),
                order_timeout_ms: int("ORDER_TIMEOUT_MS", 5000),
                trailing_trigger: num("TRAILING_TRIGGER", 3000.0),
                trailing_step: num("TRAILING_STEP", 1000.0),
                trailing_distance: num("TRAILING_DISTANCE", 1000.0),
                stops_level_mult: num("STOPS_LEVEL_MULT", 1.2),
                magic: int("MAGIC", 77775),
                max_quote_age_ms: int("MAX_QUOTE_AGE_MS", 5000),
            },
            poll_interval_secs: int("POLL_INTERVAL_SECS", 5),
            data_timeout_ms: int("DATA_TIMEOUT_MS", 3000),
            notify_timeout_ms: int("NOTIFY_TIMEOUT_MS", 5000),
            summary_time,
            summary_tz: env("SUMMARY_TZ", "UTC"),
            log_dir: env("LOG_DIR", "logs"),
            log_level: env("LOG_LEVEL", "INFO"),
        }
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    /// Timezone for the trading day. `validate` rejects unknown names.
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.summary_tz.parse().unwrap_or(chrono_tz::UTC)
    }

    /// Every timeframe the control loop has to fetch each cycle.
    pub fn fetch_timeframes(&self) -> Vec<Timeframe> {
        let mut tfs: Vec<Timeframe> = self
            .zones
            .timeframes
            .iter()
            .chain(self.trend.timeframes.iter())
            .copied()
            .collect();
        tfs.push(self.entry_tf);
        tfs.extend(self.context_tf);
        tfs.sort();
        tfs.dedup();
        tfs
    }

    /// Bars requested per timeframe: enough for zones, the MA, the ATR
    /// and the indicators.
    pub fn bars_needed(&self) -> usize {
        self.zones
            .lookback
            .max(self.trend.ma_period + 1)
            .max(self.atr_period + 1)
            .max(self.indicators.macd_slow + self.indicators.macd_signal + 1)
            .max(self.indicators.rsi_period + 2)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.risk_fraction > 0.0 && self.risk_fraction <= 0.1) {
            bail!("RISK_FRACTION must be in (0, 0.1], got {}", self.risk_fraction);
        }
        if self.weights.total() <= 0.0
            || [
                self.weights.zone,
                self.weights.reaction,
                self.weights.alignment,
                self.weights.htf_zone,
                self.weights.freshness,
                self.weights.indicators,
            ]
            .iter()
            .any(|w| *w < 0.0)
        {
            bail!("score weights must be non-negative with a positive sum");
        }
        for (name, t) in [
            ("TREND_FOLLOW_THRESHOLD", self.trend_follow_threshold),
            ("AGGRESSIVE_THRESHOLD", self.aggressive_threshold),
        ] {
            if !(0.0..=1.0).contains(&t) {
                bail!("{} must be within [0, 1], got {}", name, t);
            }
        }
        if self.aggressive_threshold > self.trend_follow_threshold {
            bail!("AGGRESSIVE_THRESHOLD must not exceed TREND_FOLLOW_THRESHOLD");
        }
        if self.trend.timeframes.is_empty() {
            bail!("TREND_TFS must name at least one timeframe");
        }
        if self.zones.swing_size == 0 || self.zones.lookback <= self.zones.swing_size * 2 {
            bail!("ZONE_LOOKBACK must exceed twice ZONE_SWING_SIZE");
        }
        if self.zones.invalidation_bars == 0 {
            bail!("ZONE_INVALIDATION_BARS must be at least 1");
        }
        if self.execution.trailing_step <= 0.0 || self.execution.trailing_distance <= 0.0 {
            bail!("TRAILING_STEP and TRAILING_DISTANCE must be positive");
        }
        if self.execution.max_spread <= 0.0 {
            bail!("MAX_SPREAD must be positive");
        }
        let ind = &self.indicators;
        if ind.macd_fast == 0 || ind.macd_fast >= ind.macd_slow || ind.macd_signal == 0 || ind.rsi_period == 0 {
            bail!("MACD_FAST must be below MACD_SLOW and all indicator periods positive");
        }
        if self.adaptive.shift < 0.0 || self.adaptive.low_ratio >= self.adaptive.high_ratio {
            bail!("ADAPTIVE_THRESHOLD_SHIFT must be non-negative and the low ATR ratio below the high one");
        }
        if self.tp_ratio <= 0.0 {
            bail!("TP_RATIO must be positive");
        }
        if self.summary_tz.parse::<chrono_tz::Tz>().is_err() {
            bail!("SUMMARY_TZ '{}' is not a known timezone", self.summary_tz);
        }
        if !self.paper_trade && self.bridge_secret.is_empty() {
            bail!("BRIDGE_SECRET is required for live trading");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::default_test_config;

    #[test]
    fn default_test_config_is_valid() {
        default_test_config().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let mut cfg = default_test_config();
        cfg.aggressive_threshold = 0.9;
        cfg.trend_follow_threshold = 0.6;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_timezone() {
        let mut cfg = default_test_config();
        cfg.summary_tz = "Mars/Olympus".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fetch_timeframes_is_union() {
        let mut cfg = default_test_config();
        let tfs = cfg.fetch_timeframes();
        assert_eq!(tfs, vec![Timeframe::M1, Timeframe::H1, Timeframe::H4]);

        cfg.context_tf = Some(Timeframe::M5);
        assert_eq!(
            cfg.fetch_timeframes(),
            vec![Timeframe::M1, Timeframe::M5, Timeframe::H1, Timeframe::H4]
        );
    }

    #[test]
    fn quote_age_zero_disables_check() {
        let mut cfg = default_test_config();
        cfg.execution.max_quote_age_ms = 0;
        assert!(cfg.execution.max_quote_age().is_none());
        cfg.execution.max_quote_age_ms = 1500;
        assert_eq!(cfg.execution.max_quote_age(), Some(chrono::Duration::milliseconds(1500)));
    }

    #[test]
    fn rejects_inverted_macd_periods() {
        let mut cfg = default_test_config();
        cfg.indicators.macd_fast = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn backoff_doubles() {
        let cfg = default_test_config();
        assert_eq!(cfg.execution.backoff(1), Duration::from_millis(cfg.execution.retry_backoff_ms));
        assert_eq!(
            cfg.execution.backoff(3),
            Duration::from_millis(cfg.execution.retry_backoff_ms * 4)
        );
    }
}
