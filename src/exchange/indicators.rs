//! Latest-bar indicator values derived from a candle series.
//!
//! Every function returns `None` when the series is too short, so the
//! resulting feature vector simply omits that indicator.

use crate::error::FeatureError;
use crate::models::features as f;
use crate::models::{CandleSeries, FeatureVector, Timeframe};

/// Full EMA series seeded with the SMA of the first `period` values.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);
    for v in &values[period..] {
        let prev = out[out.len() - 1];
        out.push(alpha * v + (1.0 - alpha) * prev);
    }
    out
}

pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Wilder RSI.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }
    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let mut avg_gain = changes[..period].iter().filter(|c| **c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss = -changes[..period].iter().filter(|c| **c < 0.0).sum::<f64>() / period as f64;

    let alpha = 1.0 / period as f64;
    for ch in &changes[period..] {
        avg_gain = alpha * ch.max(0.0) + (1.0 - alpha) * avg_gain;
        avg_loss = alpha * (-ch).max(0.0) + (1.0 - alpha) * avg_loss;
    }

    Some(if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    })
}

/// (macd, signal, histogram)
pub fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<(f64, f64, f64)> {
    if fast == 0 || fast >= slow {
        return None;
    }
    let fast_s = ema_series(closes, fast);
    let slow_s = ema_series(closes, slow);
    if slow_s.is_empty() {
        return None;
    }
    // align the fast series to the slow one's first bar
    let offset = slow - fast;
    let line: Vec<f64> = slow_s
        .iter()
        .enumerate()
        .map(|(i, s)| fast_s[i + offset] - s)
        .collect();
    let sig = ema(&line, signal)?;
    let last = *line.last()?;
    Some((last, sig, last - sig))
}

/// (upper, middle, lower)
pub fn bollinger(closes: &[f64], period: usize, k: f64) -> Option<(f64, f64, f64)> {
    let mid = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let var = window.iter().map(|c| (c - mid).powi(2)).sum::<f64>() / period as f64;
    let sd = var.sqrt();
    Some((mid + k * sd, mid, mid - k * sd))
}

/// (%K, %D) with %D the SMA of the last `d` %K values.
pub fn stochastic(series: &CandleSeries, k: usize, d: usize) -> Option<(f64, f64)> {
    let candles = series.as_slice();
    if k == 0 || d == 0 || candles.len() < k + d - 1 {
        return None;
    }
    let mut ks = Vec::with_capacity(d);
    for end in (candles.len() - d + 1)..=candles.len() {
        let window = &candles[end - k..end];
        let hh = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
        let close = window[window.len() - 1].close;
        let range = hh - ll;
        ks.push(if range > 0.0 { (close - ll) / range * 100.0 } else { 50.0 });
    }
    let pct_k = *ks.last()?;
    let pct_d = ks.iter().sum::<f64>() / ks.len() as f64;
    Some((pct_k, pct_d))
}

/// Wilder ATR.
pub fn atr(series: &CandleSeries, period: usize) -> Option<f64> {
    let candles = series.as_slice();
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let trs: Vec<f64> = candles
        .windows(2)
        .map(|w| w[1].true_range(w[0].close))
        .collect();
    let mut value = trs[..period].iter().sum::<f64>() / period as f64;
    for tr in &trs[period..] {
        value = (value * (period as f64 - 1.0) + tr) / period as f64;
    }
    Some(value)
}

/// Compute the feature vector for the latest bar of `series`.
pub fn compute_features(
    symbol: &str,
    timeframe: Timeframe,
    series: &CandleSeries,
) -> Result<FeatureVector, FeatureError> {
    let last = series.last().ok_or(FeatureError::Empty)?;
    let closes = series.closes();
    let volumes = series.volumes();

    let mut fv = FeatureVector::new(symbol, timeframe, last.timestamp).with(f::CLOSE, last.close);

    if let Some(v) = rsi(&closes, 14) {
        fv.insert(f::RSI, v);
    }
    if let Some(v) = ema(&closes, 12) {
        fv.insert(f::EMA_FAST, v);
    }
    if let Some(v) = ema(&closes, 26) {
        fv.insert(f::EMA_SLOW, v);
    }
    if let Some((line, sig, hist)) = macd(&closes, 12, 26, 9) {
        fv.insert(f::MACD, line);
        fv.insert(f::MACD_SIGNAL, sig);
        fv.insert(f::MACD_HIST, hist);
    }
    if let Some((upper, _, lower)) = bollinger(&closes, 20, 2.0) {
        fv.insert(f::BB_UPPER, upper);
        fv.insert(f::BB_LOWER, lower);
    }
    if let Some((k, d)) = stochastic(series, 14, 3) {
        fv.insert(f::STOCH_K, k);
        fv.insert(f::STOCH_D, d);
    }
    if let Some(v) = atr(series, 14) {
        fv.insert(f::ATR, v);
    }
    if let Some(avg) = sma(&volumes, 20).filter(|a| *a > 0.0) {
        fv.insert(f::VOLUME_RATIO, last.volume / avg);
    }
    if closes.len() > 5 {
        let base = closes[closes.len() - 6];
        if base > 0.0 {
            fv.insert(f::RETURN_5, last.close / base - 1.0);
        }
    }

    fv.validate()?;
    Ok(fv)
}
