// Technical indicators module
// Implements SMA, RSI and Bollinger bands for the decision functions

/// Simple Moving Average over the most recent `period` prices.
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Relative Strength Index over the most recent `period` price changes.
///
/// Values above ~70 flag an overextended move, below ~30 an oversold one.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let mut gain_sum = 0.0;
    let mut loss_sum = 0.0;

    let window = &prices[prices.len() - period - 1..];
    for pair in window.windows(2) {
        let change = pair[1] - pair[0];
        if change > 0.0 {
            gain_sum += change;
        } else {
            loss_sum += -change;
        }
    }

    if loss_sum == 0.0 {
        return Some(100.0);
    }

    let rs = (gain_sum / period as f64) / (loss_sum / period as f64);
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Bollinger bands over the most recent `period` prices.
///
/// Returns (middle, upper, lower) with the bands `k_stddev` standard
/// deviations away from the middle SMA.
pub fn calculate_bollinger(
    prices: &[f64],
    period: usize,
    k_stddev: f64,
) -> Option<(f64, f64, f64)> {
    let middle = calculate_sma(prices, period)?;

    let variance = prices
        .iter()
        .rev()
        .take(period)
        .map(|p| (p - middle).powi(2))
        .sum::<f64>()
        / period as f64;
    let stddev = variance.sqrt();

    Some((middle, middle + k_stddev * stddev, middle - k_stddev * stddev))
}
