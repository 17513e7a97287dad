use crate::models::{Candle, CandleSeries};

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let slice = &values[values.len() - period..];
    Some(slice.iter().sum::<f64>() / period as f64)
}

pub fn true_range(curr: &Candle, prev: Option<&Candle>) -> f64 {
    let hl = curr.high - curr.low;
    match prev {
        Some(p) => hl
            .max((curr.high - p.close).abs())
            .max((curr.low - p.close).abs()),
        None => hl,
    }
}

/// Average true range over the last `period` bars. With fewer bars than
/// `period` the last bar's range is returned.
pub fn atr(candles: &CandleSeries, period: usize) -> f64 {
    if period == 0 || candles.len() < period {
        return candles.last().map_or(0.0, |c| c.total_range());
    }

    let bars = candles.as_slice();
    let trs: Vec<f64> = bars
        .iter()
        .enumerate()
        .map(|(i, c)| true_range(c, if i == 0 { None } else { bars.get(i - 1) }))
        .collect();

    let start = trs.len().saturating_sub(period);
    let slice = &trs[start..];
    slice.iter().sum::<f64>() / slice.len() as f64
}

/// Exponential moving average series seeded with the SMA of the first
/// `period` values. Empty when there are fewer values than `period`.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut prev = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(prev);
    for v in &values[period..] {
        prev += k * (v - prev);
        out.push(prev);
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Macd {
    pub line: Vec<f64>,
    /// Same length as `line`; both end at the latest close.
    pub signal: Vec<f64>,
}

pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<Macd> {
    if fast == 0 || fast >= slow {
        return None;
    }
    let fast_ema = ema(closes, fast);
    let slow_ema = ema(closes, slow);
    if slow_ema.is_empty() {
        return None;
    }
    let offset = fast_ema.len() - slow_ema.len();
    let line: Vec<f64> = slow_ema
        .iter()
        .zip(&fast_ema[offset..])
        .map(|(s, f)| f - s)
        .collect();
    let signal = ema(&line, signal);
    if signal.is_empty() {
        return None;
    }
    let line = line[line.len() - signal.len()..].to_vec();
    Some(Macd { line, signal })
}

/// Wilder RSI series. Empty until `period + 1` closes are available.
pub fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() <= period {
        return Vec::new();
    }
    let p = period as f64;
    let value = |gain: f64, loss: f64| {
        if loss == 0.0 {
            if gain == 0.0 { 50.0 } else { 100.0 }
        } else {
            100.0 - 100.0 / (1.0 + gain / loss)
        }
    };

    let (mut gain, mut loss) = closes[..=period]
        .windows(2)
        .map(|w| w[1] - w[0])
        .fold((0.0, 0.0), |(g, l), d| (g + d.max(0.0), l + (-d).max(0.0)));
    gain /= p;
    loss /= p;

    let mut out = vec![value(gain, loss)];
    for w in closes[period..].windows(2) {
        let d = w[1] - w[0];
        gain = (gain * (p - 1.0) + d.max(0.0)) / p;
        loss = (loss * (p - 1.0) + (-d).max(0.0)) / p;
        out.push(value(gain, loss));
    }
    out
}

/// Volume-weighted typical price. `None` without volume.
pub fn vwap(candles: &[Candle]) -> Option<f64> {
    let (pv, volume) = candles.iter().fold((0.0, 0.0), |(pv, v), c| {
        let typical = (c.high + c.low + c.close) / 3.0;
        (pv + typical * c.volume, v + c.volume)
    });
    (volume > 0.0).then(|| pv / volume)
}
