//! Price-action confirmation used as the scorer's reaction component.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{Candle, Side};

const PIN_BAR_RATIO: f64 = 2.0;
const WICK_REJECTION_RATIO: f64 = 1.5;
const STAR_BODY_RATIO: f64 = 0.5;
const RECTANGLE_BARS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    PinBar,
    Engulfing,
    MorningStar,
    EveningStar,
    Rectangle,
    WickRejection,
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pattern::PinBar => "pin_bar",
            Pattern::Engulfing => "engulfing",
            Pattern::MorningStar => "morning_star",
            Pattern::EveningStar => "evening_star",
            Pattern::Rectangle => "rectangle",
            Pattern::WickRejection => "wick_rejection",
        };
        write!(f, "{}", s)
    }
}

impl Pattern {
    /// Full patterns count as a complete reaction; a lone wick only half.
    pub fn strength(self) -> f64 {
        match self {
            Pattern::WickRejection => 0.5,
            _ => 1.0,
        }
    }
}

pub fn is_pin_bar(c: &Candle, side: Side) -> bool {
    let body = c.body();
    match side {
        Side::Buy => c.lower_wick() > body * PIN_BAR_RATIO && c.upper_wick() < body && c.is_bullish(),
        Side::Sell => c.upper_wick() > body * PIN_BAR_RATIO && c.lower_wick() < body && c.is_bearish(),
    }
}

/// Second body opens beyond the first close and closes beyond the first open.
pub fn is_engulfing(prev: &Candle, curr: &Candle, side: Side) -> bool {
    if prev.body() == 0.0 || curr.body() <= prev.body() {
        return false;
    }
    match side {
        Side::Buy => {
            prev.is_bearish() && curr.is_bullish() && curr.open <= prev.close && curr.close > prev.open
        }
        Side::Sell => {
            prev.is_bullish() && curr.is_bearish() && curr.open >= prev.close && curr.close < prev.open
        }
    }
}

pub fn is_morning_star(c1: &Candle, c2: &Candle, c3: &Candle) -> bool {
    c1.is_bearish()
        && c2.body() < c1.body() * STAR_BODY_RATIO
        && c3.is_bullish()
        && c3.close > (c1.open + c1.close) / 2.0
}

pub fn is_evening_star(c1: &Candle, c2: &Candle, c3: &Candle) -> bool {
    c1.is_bullish()
        && c2.body() < c1.body() * STAR_BODY_RATIO
        && c3.is_bearish()
        && c3.close < (c1.open + c1.close) / 2.0
}

/// Tight consolidation: total range under twice the average body, drifting
/// against `side` (a pause before the reversal resumes).
pub fn is_rectangle(bars: &[Candle], side: Side) -> bool {
    let (Some(first), Some(last)) = (bars.first(), bars.last()) else {
        return false;
    };
    let hi = bars.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let lo = bars.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    let avg_body = bars.iter().map(|c| c.body()).sum::<f64>() / bars.len() as f64;
    let tight = hi - lo < avg_body * 2.0;
    match side {
        Side::Buy => tight && first.close > last.close,
        Side::Sell => tight && first.close < last.close,
    }
}

pub fn has_wick_rejection(c: &Candle, side: Side) -> bool {
    let body = c.body();
    if body == 0.0 {
        return false;
    }
    match side {
        Side::Buy => c.lower_wick() / body >= WICK_REJECTION_RATIO,
        Side::Sell => c.upper_wick() / body >= WICK_REJECTION_RATIO,
    }
}

/// Strongest reaction in favour of `side` formed by the most recent bars.
pub fn detect_reaction(bars: &[Candle], side: Side) -> Option<Pattern> {
    let n = bars.len();
    let last = bars.last()?;

    if n >= 3 {
        let (c1, c2, c3) = (&bars[n - 3], &bars[n - 2], &bars[n - 1]);
        match side {
            Side::Buy if is_morning_star(c1, c2, c3) => return Some(Pattern::MorningStar),
            Side::Sell if is_evening_star(c1, c2, c3) => return Some(Pattern::EveningStar),
            _ => {}
        }
    }
    if n >= 2 && is_engulfing(&bars[n - 2], last, side) {
        return Some(Pattern::Engulfing);
    }
    if is_pin_bar(last, side) {
        return Some(Pattern::PinBar);
    }
    if n >= RECTANGLE_BARS && is_rectangle(&bars[n - RECTANGLE_BARS..], side) {
        return Some(Pattern::Rectangle);
    }
    if has_wick_rejection(last, side) {
        return Some(Pattern::WickRejection);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::make_candles;

    #[test]
    fn pin_bar_both_sides() {
        let s = make_candles(&[
            (100.0, 101.2, 95.0, 101.0), // long lower wick, bullish
            (100.0, 106.0, 98.8, 99.0),  // long upper wick, bearish
        ]);
        assert!(is_pin_bar(&s[0], Side::Buy));
        assert!(!is_pin_bar(&s[0], Side::Sell));
        assert!(is_pin_bar(&s[1], Side::Sell));
    }

    #[test]
    fn engulfing_requires_larger_opposite_body() {
        let s = make_candles(&[
            (102.0, 102.5, 99.5, 100.0),
            (99.8, 104.0, 99.5, 103.0),
            (103.0, 103.5, 102.0, 102.5),
        ]);
        assert!(is_engulfing(&s[0], &s[1], Side::Buy));
        assert!(!is_engulfing(&s[0], &s[1], Side::Sell));
        assert!(!is_engulfing(&s[1], &s[2], Side::Sell));
    }

    #[test]
    fn morning_star_detected_as_reaction() {
        let s = make_candles(&[
            (110.0, 110.5, 101.5, 102.0),
            (101.5, 102.0, 100.0, 101.0),
            (101.0, 108.5, 100.5, 108.0),
        ]);
        assert!(is_morning_star(&s[0], &s[1], &s[2]));
        assert_eq!(detect_reaction(s.as_slice(), Side::Buy), Some(Pattern::MorningStar));
    }

    #[test]
    fn wick_only_is_weaker() {
        // Lower wick 1.6x body, upper wick larger than body: no pin bar.
        let s = make_candles(&[(100.0, 103.0, 98.4, 101.0)]);
        assert!(!is_pin_bar(&s[0], Side::Buy));
        assert_eq!(detect_reaction(s.as_slice(), Side::Buy), Some(Pattern::WickRejection));
        assert_eq!(Pattern::WickRejection.strength(), 0.5);
        assert_eq!(Pattern::Engulfing.strength(), 1.0);
    }

    #[test]
    fn no_reaction_on_plain_trend_bar() {
        let s = make_candles(&[(100.0, 105.2, 99.8, 105.0)]);
        assert_eq!(detect_reaction(s.as_slice(), Side::Buy), None);
        assert_eq!(detect_reaction(&[], Side::Sell), None);
    }
}
