//! Zone and trend confluence scoring.
//!
//! Scoring is a pure function of the snapshot it is given: no clock reads,
//! no randomness, and candidates are ranked with a total order so equal
//! inputs always produce the same signal.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::config::{Config, FalseBreakoutConfig, IndicatorConfig, ScoreWeights};
use crate::core::patterns::{detect_reaction, is_engulfing};
use crate::core::structure::TrendState;
use crate::core::zones::{Zone, ZoneSnapshot};
use crate::models::{CandleSeries, Quote, Side, StrategyMode, Timeframe, Trend, ZoneKind, ZoneStatus};
use crate::strategies::filters::IndicatorVotes;
use crate::strategies::signals::{ScoreBreakdown, Signal};

/// Bars of the entry timeframe inspected for a reaction pattern.
const REACTION_BARS: usize = 5;

/// Everything the scorer looks at for one decision.
pub struct ScoreContext<'a> {
    pub zones: &'a ZoneSnapshot,
    pub trends: &'a BTreeMap<Timeframe, TrendState>,
    pub quote: &'a Quote,
    pub entry_bars: &'a CandleSeries,
    /// Completed bars of the trading timeframe.
    pub trading_bars: &'a CandleSeries,
    pub context: Option<Trend>,
    /// ATR of the trading timeframe.
    pub atr: f64,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConfluenceScorer {
    pub weights: ScoreWeights,
    pub mode: StrategyMode,
    pub trading_tf: Timeframe,
    pub trend_timeframes: Vec<Timeframe>,
    pub proximity: f64,
    pub fresh_flip_bars: usize,
    pub sl_buffer: f64,
    pub stop_atr_mult: f64,
    pub tp_ratio: f64,
    pub indicators: IndicatorConfig,
    pub false_breakout: FalseBreakoutConfig,
}

struct Candidate<'a> {
    zone: &'a Zone,
    side: Side,
    distance: f64,
    score: f64,
    breakdown: ScoreBreakdown,
    aligned: bool,
    fresh_flip: bool,
    votes: IndicatorVotes,
    /// Extreme of the breakout bars the reversal stop sits beyond.
    reversal: Option<f64>,
}

impl ConfluenceScorer {
    pub fn from_config(cfg: &Config) -> Self {
        let stop_atr_mult = match cfg.strategy_mode {
            StrategyMode::TrendFollow => cfg.trend_stop_atr_mult,
            StrategyMode::Aggressive => cfg.aggressive_stop_atr_mult,
        };
        Self {
            weights: cfg.weights.clone(),
            mode: cfg.strategy_mode,
            trading_tf: cfg.zones.trading_tf,
            trend_timeframes: cfg.trend.timeframes.clone(),
            proximity: cfg.zones.proximity,
            fresh_flip_bars: cfg.zones.fresh_flip_bars,
            sl_buffer: cfg.sl_buffer,
            stop_atr_mult,
            tp_ratio: cfg.tp_ratio,
            indicators: cfg.indicators.clone(),
            false_breakout: cfg.false_breakout.clone(),
        }
    }

    /// Best signal from active trading-timeframe zones interacting with
    /// price, or `None` when no zone does.
    pub fn score(&self, ctx: &ScoreContext<'_>) -> Option<Signal> {
        let price = ctx.quote.mid();
        let trading = ctx.zones.get(&self.trading_tf)?;

        let active = || trading.iter().filter(|z| z.status == ZoneStatus::Active);
        let mut candidates: Vec<Candidate<'_>> = active()
            .filter(|z| z.distance(price) <= self.proximity)
            .map(|z| self.evaluate(z, z.kind.side(), price, ctx))
            .collect();
        candidates.extend(active().filter_map(|z| self.false_breakout(z, price, ctx)));

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then(a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal))
                .then(b.zone.id.cmp(&a.zone.id))
        });

        candidates
            .into_iter()
            .find_map(|c| self.build_signal(c, ctx))
    }

    fn evaluate<'z>(&self, zone: &'z Zone, side: Side, price: f64, ctx: &ScoreContext<'_>) -> Candidate<'z> {
        let distance = zone.distance(price);

        let zone_c = if distance == 0.0 { 1.0 } else { 0.5 };

        let recent = ctx.entry_bars.tail(REACTION_BARS);
        let reaction_c = detect_reaction(recent.as_slice(), side)
            .map(|p| p.strength())
            .unwrap_or(0.0);

        let (alignment_c, aligned) = self.alignment(side, ctx.trends);

        let htf_c = if ctx
            .zones
            .iter()
            .filter(|(tf, _)| **tf > self.trading_tf)
            .flat_map(|(_, zones)| zones.iter())
            .any(|z| {
                z.status == ZoneStatus::Active
                    && z.kind.side() == side
                    && z.distance(price) <= self.proximity
            }) {
            1.0
        } else {
            0.0
        };

        let fresh_flip = zone.is_fresh_flip(self.fresh_flip_bars);
        let freshness_c = if zone.touches <= 2 || fresh_flip { 1.0 } else { 0.0 };

        let votes = IndicatorVotes::evaluate(ctx.entry_bars, price, side, &self.indicators);
        let indicators_c = votes.fraction();

        let breakdown = ScoreBreakdown {
            zone: zone_c,
            reaction: reaction_c,
            alignment: alignment_c,
            htf_zone: htf_c,
            freshness: freshness_c,
            indicators: indicators_c,
        };
        let w = &self.weights;
        let total = w.total();
        let raw = w.zone * zone_c
            + w.reaction * reaction_c
            + w.alignment * alignment_c
            + w.htf_zone * htf_c
            + w.freshness * freshness_c
            + w.indicators * indicators_c;
        let score = if total > 0.0 { (raw / total).clamp(0.0, 1.0) } else { 0.0 };

        Candidate {
            zone,
            side,
            distance,
            score,
            breakdown,
            aligned,
            fresh_flip,
            votes,
            reversal: None,
        }
    }

    /// A zone broken by the last trading bar with an engulfing close beyond
    /// its edge offers an entry the other way. Only taken while every trend
    /// timeframe is flat and all indicators agree.
    fn false_breakout<'z>(&self, zone: &'z Zone, price: f64, ctx: &ScoreContext<'_>) -> Option<Candidate<'z>> {
        if !self.false_breakout.enabled {
            return None;
        }
        let [.., prev, curr] = ctx.trading_bars.as_slice() else {
            return None;
        };
        let side = zone.kind.inverted().side();
        let (crossed, penetration) = match zone.kind {
            ZoneKind::Demand => (
                prev.close > zone.price_low && curr.close < zone.price_low,
                zone.price_low - curr.close,
            ),
            ZoneKind::Supply => (
                prev.close < zone.price_high && curr.close > zone.price_high,
                curr.close - zone.price_high,
            ),
        };
        if !crossed || penetration < self.false_breakout.min_penetration || !is_engulfing(prev, curr, side) {
            return None;
        }
        let trending = self
            .trend_timeframes
            .iter()
            .any(|tf| ctx.trends.get(tf).is_some_and(|t| t.direction != Trend::Flat));
        if trending {
            return None;
        }

        let mut c = self.evaluate(zone, side, price, ctx);
        if !c.votes.all() {
            return None;
        }
        c.reversal = Some(match side {
            Side::Buy => prev.low.min(curr.low),
            Side::Sell => prev.high.max(curr.high),
        });
        Some(c)
    }

    /// Share of trend timeframes agreeing with `side`; any opposing
    /// timeframe zeroes it.
    fn alignment(&self, side: Side, trends: &BTreeMap<Timeframe, TrendState>) -> (f64, bool) {
        if self.trend_timeframes.is_empty() {
            return (0.0, false);
        }
        let mut agree = 0usize;
        for tf in &self.trend_timeframes {
            match trends.get(tf).and_then(|t| t.direction.to_side()) {
                Some(s) if s == side => agree += 1,
                Some(_) => return (0.0, false),
                None => {}
            }
        }
        let n = self.trend_timeframes.len();
        (agree as f64 / n as f64, agree == n)
    }

    fn build_signal(&self, c: Candidate<'_>, ctx: &ScoreContext<'_>) -> Option<Signal> {
        let entry = ctx.quote.entry_price(c.side);
        let stop = match (c.reversal, c.side) {
            (Some(extreme), side) => extreme - side.sign() * self.sl_buffer,
            (None, Side::Buy) => c.zone.price_low - self.sl_buffer.max(self.stop_atr_mult * ctx.atr),
            (None, Side::Sell) => c.zone.price_high + self.sl_buffer.max(self.stop_atr_mult * ctx.atr),
        };
        let risk = (entry - stop) * c.side.sign();
        if !risk.is_finite() || risk <= 0.0 {
            return None;
        }
        let take_profit = entry + c.side.sign() * self.tp_ratio * risk;

        let reason = format!(
            "{}{} {} zone {:.5}-{:.5} (touches {}{}) score {:.2} [zone {:.1} reaction {:.1} align {:.2} htf {:.0} fresh {:.0} ind {:.2}]",
            if c.reversal.is_some() { "false breakout of " } else { "" },
            self.trading_tf,
            c.zone.kind,
            c.zone.price_low,
            c.zone.price_high,
            c.zone.touches,
            if c.fresh_flip { ", fresh flip" } else { "" },
            c.score,
            c.breakdown.zone,
            c.breakdown.reaction,
            c.breakdown.alignment,
            c.breakdown.htf_zone,
            c.breakdown.freshness,
            c.breakdown.indicators,
        );

        Some(Signal {
            side: c.side,
            confluence_score: c.score,
            zone: c.zone.clone(),
            mode: self.mode,
            timestamp: ctx.as_of,
            aligned: c.aligned,
            fresh_flip: c.fresh_flip,
            reversal: c.reversal.is_some(),
            context: ctx.context,
            entry_price: entry,
            stop_loss: stop,
            take_profit,
            breakdown: c.breakdown,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::zones::ZoneTracker;
    use crate::models::{Trend, ZoneKind};
    use crate::test_helpers::{base_time, default_test_config, make_candles, make_quote, make_tf_candles};

    const DEMAND_SEED: [(f64, f64, f64, f64); 5] = [
        (106.0, 107.0, 104.5, 105.0),
        (105.0, 105.5, 102.5, 103.0),
        (103.0, 104.0, 100.0, 103.5),
        (103.5, 105.0, 102.0, 104.5),
        (104.5, 106.0, 103.5, 105.5),
    ];

    fn demand_snapshot(tfs: &[Timeframe]) -> ZoneSnapshot {
        let mut tracker = ZoneTracker::new(default_test_config().zones);
        for tf in tfs {
            for bar in make_tf_candles(*tf, &DEMAND_SEED) {
                tracker.update(*tf, bar);
            }
        }
        tracker.snapshot()
    }

    fn trends(h1: Trend, h4: Trend) -> BTreeMap<Timeframe, TrendState> {
        let mut m = BTreeMap::new();
        for (tf, d) in [(Timeframe::H1, h1), (Timeframe::H4, h4)] {
            m.insert(
                tf,
                TrendState {
                    timeframe: tf,
                    direction: d,
                    as_of: base_time(),
                },
            );
        }
        m
    }

    fn scorer() -> ConfluenceScorer {
        ConfluenceScorer::from_config(&default_test_config())
    }

    #[test]
    fn no_zone_interaction_yields_none() {
        let zones = demand_snapshot(&[Timeframe::H1]);
        let t = trends(Trend::Up, Trend::Up);
        let quote = make_quote(110.0, 110.2);
        let bars = make_candles(&[(110.0, 110.5, 109.5, 110.1)]);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &bars,
            trading_bars: &bars,
            context: None,
            atr: 0.0,
            as_of: base_time(),
        };
        assert!(scorer().score(&ctx).is_none());
    }

    #[test]
    fn aligned_demand_with_reaction_scores_high() {
        let zones = demand_snapshot(&[Timeframe::H1, Timeframe::H4]);
        let t = trends(Trend::Up, Trend::Up);
        let quote = make_quote(101.9, 102.1);
        // Bullish pin bar on the entry timeframe.
        let bars = make_candles(&[(101.0, 102.2, 98.5, 102.0)]);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &bars,
            trading_bars: &bars,
            context: None,
            atr: 0.1,
            as_of: base_time(),
        };
        let signal = scorer().score(&ctx).expect("signal");
        assert_eq!(signal.side, Side::Buy);
        assert_eq!(signal.zone.kind, ZoneKind::Demand);
        assert!(signal.aligned);
        assert!((signal.confluence_score - 1.0).abs() < 1e-9, "{}", signal.confluence_score);
        assert!((signal.entry_price - 102.1).abs() < 1e-9);
        // Stop below the zone by the configured buffer.
        assert!((signal.stop_loss - 99.5).abs() < 1e-9);
        let risk = signal.entry_price - signal.stop_loss;
        assert!((signal.take_profit - (signal.entry_price + 2.0 * risk)).abs() < 1e-9);
        assert_eq!(signal.timestamp, base_time());
    }

    #[test]
    fn opposing_trend_zeroes_alignment() {
        let zones = demand_snapshot(&[Timeframe::H1]);
        let t = trends(Trend::Up, Trend::Down);
        let quote = make_quote(101.9, 102.1);
        let bars = make_candles(&[(102.0, 102.3, 101.95, 102.25)]);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &bars,
            trading_bars: &bars,
            context: None,
            atr: 0.1,
            as_of: base_time(),
        };
        let signal = scorer().score(&ctx).expect("signal");
        assert!(!signal.aligned);
        assert_eq!(signal.breakdown.alignment, 0.0);
        assert_eq!(signal.breakdown.htf_zone, 0.0);
        // zone 0.30 + freshness 0.05 out of 1.0
        assert!((signal.confluence_score - 0.35).abs() < 1e-9);
    }

    #[test]
    fn score_is_deterministic() {
        let zones = demand_snapshot(&[Timeframe::H1, Timeframe::H4]);
        let t = trends(Trend::Up, Trend::Flat);
        let quote = make_quote(103.4, 103.6);
        let bars = make_candles(&[(103.0, 103.8, 102.0, 103.5), (103.5, 104.0, 103.0, 103.4)]);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &bars,
            trading_bars: &bars,
            context: None,
            atr: 0.4,
            as_of: base_time(),
        };
        let s = scorer();
        let first = s.score(&ctx);
        for _ in 0..10 {
            assert_eq!(s.score(&ctx), first);
        }
        let first = first.expect("signal within proximity");
        assert!((first.breakdown.zone - 0.5).abs() < 1e-9);
        assert!((first.breakdown.alignment - 0.5).abs() < 1e-9);
    }

    #[test]
    fn aggressive_mode_uses_tighter_stop() {
        let zones = demand_snapshot(&[Timeframe::H1]);
        let t = trends(Trend::Up, Trend::Up);
        let quote = make_quote(101.9, 102.1);
        let bars = make_candles(&[(102.0, 102.3, 101.95, 102.25)]);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &bars,
            trading_bars: &bars,
            context: None,
            atr: 1.0,
            as_of: base_time(),
        };
        let mut cfg = default_test_config();
        let conservative = ConfluenceScorer::from_config(&cfg).score(&ctx).unwrap();
        cfg.strategy_mode = StrategyMode::Aggressive;
        let aggressive = ConfluenceScorer::from_config(&cfg).score(&ctx).unwrap();
        assert_eq!(aggressive.mode, StrategyMode::Aggressive);
        assert!(aggressive.stop_distance() < conservative.stop_distance());
    }

    #[test]
    fn indicator_weight_counts_confirming_share() {
        let zones = demand_snapshot(&[Timeframe::H1]);
        let t = trends(Trend::Up, Trend::Down);
        // Mid 102.3 sits above the entry bar's VWAP; MACD and RSI lack history.
        let quote = make_quote(102.2, 102.4);
        let bars = make_candles(&[(102.0, 102.3, 101.95, 102.25)]);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &bars,
            trading_bars: &bars,
            context: None,
            atr: 0.1,
            as_of: base_time(),
        };
        let mut cfg = default_test_config();
        cfg.weights.indicators = 0.15;
        let signal = ConfluenceScorer::from_config(&cfg).score(&ctx).expect("signal");
        assert!((signal.breakdown.indicators - 1.0 / 3.0).abs() < 1e-9);
        assert!((signal.confluence_score - 0.40 / 1.15).abs() < 1e-9, "{}", signal.confluence_score);
    }

    /// Rising closes followed by a decline, cut at the first bar whose MACD
    /// line falls under its signal line.
    fn bearish_cross_bars() -> CandleSeries {
        let cfg = default_test_config().indicators;
        let mut closes: Vec<f64> = (0..=40).map(|i| 100.0 + i as f64).collect();
        loop {
            let last = closes[closes.len() - 1];
            closes.push(last - 2.0);
            let m = crate::core::indicators::macd(&closes, cfg.macd_fast, cfg.macd_slow, cfg.macd_signal)
                .expect("enough closes");
            if m.line[m.line.len() - 1] < m.signal[m.signal.len() - 1] {
                break;
            }
        }
        let data: Vec<(f64, f64, f64, f64)> = closes.iter().map(|&c| (c, c + 0.5, c - 0.5, c)).collect();
        make_candles(&data)
    }

    fn breakout_scorer() -> ConfluenceScorer {
        let mut cfg = default_test_config();
        cfg.false_breakout.enabled = true;
        ConfluenceScorer::from_config(&cfg)
    }

    #[test]
    fn failed_demand_zone_offers_reversal_sell() {
        let zones = demand_snapshot(&[Timeframe::H1]);
        let t = trends(Trend::Flat, Trend::Flat);
        // Close above the zone, then a bearish engulfing close 1.2 below it.
        let trading = make_tf_candles(
            Timeframe::H1,
            &[(101.0, 101.6, 100.8, 101.5), (101.7, 101.8, 98.5, 98.8)],
        );
        let entry = bearish_cross_bars();
        let quote = make_quote(98.6, 98.8);
        let ctx = ScoreContext {
            zones: &zones,
            trends: &t,
            quote: &quote,
            entry_bars: &entry,
            trading_bars: &trading,
            context: Some(Trend::Down),
            atr: 1.0,
            as_of: base_time(),
        };

        let signal = breakout_scorer().score(&ctx).expect("reversal");
        assert_eq!(signal.side, Side::Sell);
        assert_eq!(signal.zone.kind, ZoneKind::Demand);
        assert!(signal.reversal);
        assert_eq!(signal.context, Some(Trend::Down));
        assert!((signal.breakdown.indicators - 1.0).abs() < 1e-9);
        // Beyond the higher of the two breakout bars.
        assert!((signal.stop_loss - 102.3).abs() < 1e-9);
        assert!((signal.entry_price - 98.6).abs() < 1e-9);
        assert!(signal.take_profit < signal.entry_price);
        assert!(signal.reason.starts_with("false breakout"));

        // Disabled, the same bars yield nothing: price is outside proximity.
        assert!(scorer().score(&ctx).is_none());
    }

    #[test]
    fn reversal_needs_flat_trend_and_real_penetration() {
        let zones = demand_snapshot(&[Timeframe::H1]);
        let entry = bearish_cross_bars();
        let quote = make_quote(98.6, 98.8);

        let trending = trends(Trend::Flat, Trend::Down);
        let trading = make_tf_candles(
            Timeframe::H1,
            &[(101.0, 101.6, 100.8, 101.5), (101.7, 101.8, 98.5, 98.8)],
        );
        let ctx = ScoreContext {
            zones: &zones,
            trends: &trending,
            quote: &quote,
            entry_bars: &entry,
            trading_bars: &trading,
            context: None,
            atr: 1.0,
            as_of: base_time(),
        };
        assert!(breakout_scorer().score(&ctx).is_none());

        let flat = trends(Trend::Flat, Trend::Flat);
        let shallow = make_tf_candles(
            Timeframe::H1,
            &[(101.0, 101.6, 100.8, 101.5), (101.7, 101.8, 99.4, 99.6)],
        );
        let ctx = ScoreContext {
            zones: &zones,
            trends: &flat,
            quote: &quote,
            entry_bars: &entry,
            trading_bars: &shallow,
            context: None,
            atr: 1.0,
            as_of: base_time(),
        };
        assert!(breakout_scorer().score(&ctx).is_none());
    }
}
