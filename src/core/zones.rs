//! Supply/demand zone lifecycle per timeframe.
//!
//! Zones are created from completed pivots, merged when they overlap a newer
//! zone of the same kind, flipped when price closes through them with enough
//! displacement, and invalidated when a breach is not reclaimed in time or
//! the zone has been touched too often.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::ZoneConfig;
use crate::models::{Candle, CandleSeries, SwingType, Timeframe, ZoneKind, ZoneStatus};

/// Active zones by timeframe, ordered so iteration is deterministic.
pub type ZoneSnapshot = BTreeMap<Timeframe, Vec<Zone>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: u64,
    pub timeframe: Timeframe,
    pub price_low: f64,
    pub price_high: f64,
    pub kind: ZoneKind,
    pub created_at: DateTime<Utc>,
    pub status: ZoneStatus,
    pub touches: u32,
    /// Bars of this timeframe seen since the zone formed.
    pub age_bars: usize,
    /// Id of the zone this one was flipped from.
    pub flipped_from: Option<u64>,
    #[serde(skip)]
    breach_bars: usize,
    #[serde(skip)]
    was_inside: bool,
}

impl Zone {
    pub fn contains(&self, price: f64) -> bool {
        price >= self.price_low && price <= self.price_high
    }

    /// Zero inside the band, otherwise the gap to the nearest edge.
    pub fn distance(&self, price: f64) -> f64 {
        if price < self.price_low {
            self.price_low - price
        } else if price > self.price_high {
            price - self.price_high
        } else {
            0.0
        }
    }

    pub fn overlaps(&self, other: &Zone) -> bool {
        self.price_low <= other.price_high && other.price_low <= self.price_high
    }

    pub fn intersects(&self, bar: &Candle) -> bool {
        bar.low <= self.price_high && bar.high >= self.price_low
    }

    pub fn mid(&self) -> f64 {
        (self.price_low + self.price_high) / 2.0
    }

    pub fn is_fresh_flip(&self, window: usize) -> bool {
        self.flipped_from.is_some() && self.age_bars <= window
    }

    /// Advance the zone by one completed bar.
    fn react(&mut self, bar: &Candle, cfg: &ZoneConfig) -> Reaction {
        let beyond = match self.kind {
            ZoneKind::Demand => self.price_low - bar.close,
            ZoneKind::Supply => bar.close - self.price_high,
        };
        let inside = self.intersects(bar);

        if beyond > 0.0 {
            let breaking_body = match self.kind {
                ZoneKind::Demand => bar.is_bearish(),
                ZoneKind::Supply => bar.is_bullish(),
            };
            if breaking_body && beyond >= cfg.flip_displacement {
                return Reaction::Flip;
            }
            self.breach_bars += 1;
            self.was_inside = inside;
            if self.breach_bars >= cfg.invalidation_bars {
                return Reaction::Invalidate(InvalidationReason::NoReaction);
            }
            return Reaction::Held;
        }

        self.breach_bars = 0;
        let entered = inside && !self.was_inside;
        self.was_inside = inside;
        if entered {
            self.touches += 1;
            if self.touches > cfg.max_touches {
                return Reaction::Invalidate(InvalidationReason::Exhausted);
            }
            return Reaction::Touched;
        }
        Reaction::Held
    }
}

enum Reaction {
    Held,
    Touched,
    Flip,
    Invalidate(InvalidationReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// Closed beyond the zone and did not reclaim it in time.
    NoReaction,
    /// Touched more often than allowed.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum ZoneChange {
    Created { zone: Zone },
    Merged { into: Zone, absorbed: Vec<u64> },
    Touched { zone: Zone },
    Flipped { from: Zone, to: Zone },
    Invalidated { zone: Zone, reason: InvalidationReason },
}

impl ZoneChange {
    pub fn timeframe(&self) -> Timeframe {
        match self {
            ZoneChange::Created { zone }
            | ZoneChange::Touched { zone }
            | ZoneChange::Invalidated { zone, .. } => zone.timeframe,
            ZoneChange::Merged { into, .. } => into.timeframe,
            ZoneChange::Flipped { to, .. } => to.timeframe,
        }
    }

    /// Flips and invalidations are worth telling someone about.
    pub fn is_transition(&self) -> bool {
        matches!(self, ZoneChange::Flipped { .. } | ZoneChange::Invalidated { .. })
    }
}

pub struct ZoneTracker {
    cfg: ZoneConfig,
    windows: HashMap<Timeframe, CandleSeries>,
    zones: HashMap<Timeframe, Vec<Zone>>,
    next_id: u64,
}

impl ZoneTracker {
    pub fn new(cfg: ZoneConfig) -> Self {
        Self {
            cfg,
            windows: HashMap::new(),
            zones: HashMap::new(),
            next_id: 1,
        }
    }

    /// Feed one completed bar. Bars not newer than the last one seen for
    /// `tf` are ignored.
    pub fn update(&mut self, tf: Timeframe, bar: Candle) -> Vec<ZoneChange> {
        let window = self.windows.entry(tf).or_default();
        if let Some(last) = window.last() {
            if bar.timestamp <= last.timestamp {
                return Vec::new();
            }
        }
        window.push(bar.clone());
        window.truncate_front(self.cfg.lookback);

        let mut changes = Vec::new();
        self.evaluate_existing(tf, &bar, &mut changes);

        for zone in self.detect_pivot_zones(tf) {
            self.insert_zone(tf, zone, true, &mut changes);
        }
        self.enforce_cap(tf);

        for change in &changes {
            debug!("Zone {} {:?}", tf, change);
        }
        changes
    }

    pub fn zones(&self, tf: Timeframe) -> &[Zone] {
        self.zones.get(&tf).map(|z| z.as_slice()).unwrap_or(&[])
    }

    pub fn snapshot(&self) -> ZoneSnapshot {
        self.zones
            .iter()
            .map(|(tf, zones)| (*tf, zones.clone()))
            .collect()
    }

    pub fn last_bar_time(&self, tf: Timeframe) -> Option<DateTime<Utc>> {
        self.windows.get(&tf).and_then(|w| w.last()).map(|c| c.timestamp)
    }

    pub fn window(&self, tf: Timeframe) -> Option<&CandleSeries> {
        self.windows.get(&tf)
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn evaluate_existing(&mut self, tf: Timeframe, bar: &Candle, changes: &mut Vec<ZoneChange>) {
        let zones = self.zones.entry(tf).or_default();
        let mut survivors = Vec::with_capacity(zones.len());
        let mut flipped = Vec::new();

        for mut zone in zones.drain(..) {
            zone.age_bars += 1;
            match zone.react(bar, &self.cfg) {
                Reaction::Held => survivors.push(zone),
                Reaction::Touched => {
                    changes.push(ZoneChange::Touched { zone: zone.clone() });
                    survivors.push(zone);
                }
                Reaction::Invalidate(reason) => {
                    zone.status = ZoneStatus::Invalidated;
                    changes.push(ZoneChange::Invalidated { zone, reason });
                }
                Reaction::Flip => {
                    zone.status = ZoneStatus::Flipped;
                    flipped.push(zone);
                }
            }
        }
        *zones = survivors;

        for old in flipped {
            let new = Zone {
                id: self.alloc_id(),
                timeframe: tf,
                price_low: old.price_low,
                price_high: old.price_high,
                kind: old.kind.inverted(),
                created_at: bar.timestamp,
                status: ZoneStatus::Active,
                touches: 0,
                age_bars: 0,
                flipped_from: Some(old.id),
                breach_bars: 0,
                was_inside: false,
            };
            changes.push(ZoneChange::Flipped {
                from: old,
                to: new.clone(),
            });
            self.insert_zone(tf, new, false, changes);
        }
    }

    /// A pivot is confirmed once `swing_size` bars have closed after it.
    fn detect_pivot_zones(&mut self, tf: Timeframe) -> Vec<Zone> {
        let s = self.cfg.swing_size;
        let Some(window) = self.windows.get(&tf) else {
            return Vec::new();
        };
        let bars = window.as_slice();
        if s == 0 || bars.len() < 2 * s + 1 {
            return Vec::new();
        }
        let p = bars.len() - 1 - s;
        let pivot = bars[p].clone();
        let last_inside = |low: f64, high: f64| {
            bars.last()
                .map(|c| c.low <= high && c.high >= low)
                .unwrap_or(false)
        };

        let mut bands = Vec::new();
        if strict_extreme(bars, p, s, SwingType::High) {
            let low = pivot.body_top();
            bands.push((ZoneKind::Supply, low, pivot.high, last_inside(low, pivot.high)));
        }
        if strict_extreme(bars, p, s, SwingType::Low) {
            let high = pivot.body_bottom();
            bands.push((ZoneKind::Demand, pivot.low, high, last_inside(pivot.low, high)));
        }

        bands
            .into_iter()
            .map(|(kind, low, high, inside)| Zone {
                id: self.alloc_id(),
                timeframe: tf,
                price_low: low,
                price_high: high,
                kind,
                created_at: pivot.timestamp,
                status: ZoneStatus::Active,
                touches: 0,
                age_bars: s,
                flipped_from: None,
                breach_bars: 0,
                was_inside: inside,
            })
            .collect()
    }

    /// Insert `zone`, absorbing any active zone of the same kind it overlaps.
    fn insert_zone(&mut self, tf: Timeframe, zone: Zone, created: bool, changes: &mut Vec<ZoneChange>) {
        let zones = self.zones.entry(tf).or_default();
        let (overlapping, mut rest): (Vec<Zone>, Vec<Zone>) = zones
            .drain(..)
            .partition(|z| z.kind == zone.kind && z.overlaps(&zone));

        let mut merged = zone;
        let mut absorbed = Vec::with_capacity(overlapping.len());
        for z in overlapping {
            merged.price_low = merged.price_low.min(z.price_low);
            merged.price_high = merged.price_high.max(z.price_high);
            merged.touches = merged.touches.max(z.touches);
            absorbed.push(z.id);
        }

        rest.push(merged.clone());
        *zones = rest;

        if created {
            changes.push(ZoneChange::Created { zone: merged.clone() });
        }
        if !absorbed.is_empty() {
            changes.push(ZoneChange::Merged {
                into: merged,
                absorbed,
            });
        }
    }

    fn enforce_cap(&mut self, tf: Timeframe) {
        let cap = self.cfg.max_zones_per_tf.max(1);
        if let Some(zones) = self.zones.get_mut(&tf) {
            if zones.len() > cap {
                zones.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                let excess = zones.len() - cap;
                let evicted: Vec<u64> = zones.drain(..excess).map(|z| z.id).collect();
                debug!("Zone cap on {}: evicted {:?}", tf, evicted);
            }
        }
    }
}

/// Bar `p` is strictly beyond every other bar within `s` on each side.
fn strict_extreme(bars: &[Candle], p: usize, s: usize, kind: SwingType) -> bool {
    let lo = p.saturating_sub(s);
    let hi = (p + s).min(bars.len() - 1);
    if p < s {
        return false;
    }
    (lo..=hi).filter(|&j| j != p).all(|j| match kind {
        SwingType::High => bars[j].high < bars[p].high,
        SwingType::Low => bars[j].low > bars[p].low,
    })
}
