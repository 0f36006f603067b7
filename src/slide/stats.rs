//! Robust aggregation of a window of timing samples

/// Mean of the interquartile band `[3n/8, 5n/8)` of an already sorted window
///
/// The band holds `n/4` samples; both tails are dropped so that the
/// cache-hot floor and preemption spikes do not move the result.
pub fn trimmed_mean(sorted: &[i64]) -> i64 {
    let len = sorted.len();
    let band = len / 4;
    if band == 0 {
        return 0;
    }
    let sum: i128 = sorted[len * 3 / 8..len * 5 / 8]
        .iter()
        .map(|&s| s as i128)
        .sum();
    (sum / band as i128) as i64
}
