use crate::model::LatencySummary;
use hdrhistogram::Histogram;

/// Highest recordable latency: one hour, in microseconds.
const MAX_LATENCY_US: u64 = 3_600_000_000;

/// Summarise latency samples given in milliseconds.
///
/// Quantiles come from an HDR histogram at microsecond resolution; min, max and
/// mean are exact. Jitter is the standard deviation and needs at least two samples.
pub fn latency_summary(samples_ms: &[f64]) -> LatencySummary {
    if samples_ms.is_empty() {
        return LatencySummary::default();
    }

    let n = samples_ms.len() as f64;
    let mean = samples_ms.iter().sum::<f64>() / n;
    let min = samples_ms.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let jitter = (samples_ms.len() >= 2).then(|| {
        let var = samples_ms.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    });

    let quantiles = Histogram::<u64>::new_with_bounds(1, MAX_LATENCY_US, 3)
        .ok()
        .map(|mut hist| {
            for ms in samples_ms {
                hist.saturating_record((ms * 1000.0).round().max(1.0) as u64);
            }
            let at = |q: f64| hist.value_at_quantile(q) as f64 / 1000.0;
            (at(0.25), at(0.5), at(0.75))
        });

    LatencySummary {
        samples: samples_ms.len() as u64,
        min_ms: Some(min),
        mean_ms: Some(mean),
        median_ms: quantiles.map(|(_, median, _)| median),
        p25_ms: quantiles.map(|(p25, _, _)| p25),
        p75_ms: quantiles.map(|(_, _, p75)| p75),
        max_ms: Some(max),
        jitter_ms: jitter,
    }
}
