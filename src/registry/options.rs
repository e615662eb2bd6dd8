//! Bucket and quantile settings applied to auto-created instruments
//!
//! The operation stream carries no bucket or quantile parameters, so every
//! histogram and summary created from it shares these defaults.

use std::time::Duration;

use tracing::warn;

use crate::config::InstrumentsConfig;

/// Quantiles reported by summaries unless configured otherwise
pub const DEFAULT_SUMMARY_QUANTILES: &[f64] = &[0.01, 0.05, 0.5, 0.9, 0.95, 0.99, 0.999];

/// Sliding window age for summary observations
pub const DEFAULT_SUMMARY_MAX_AGE: Duration = Duration::from_secs(600);

/// Upper bound on retained observations per summary series
pub const DEFAULT_SUMMARY_MAX_SAMPLES: usize = 1024;

/// Help text for instruments created from the operation stream
pub const DEFAULT_HELP: &str = "Metric created from the operation stream";

/// Summary window configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOpts {
    /// Reported quantiles, each in `0.0..=1.0`
    pub quantiles: Vec<f64>,
    /// Observations older than this are dropped from quantile computation
    pub max_age: Duration,
    /// Maximum observations kept per series
    pub max_samples: usize,
}

impl Default for SummaryOpts {
    fn default() -> Self {
        Self {
            quantiles: DEFAULT_SUMMARY_QUANTILES.to_vec(),
            max_age: DEFAULT_SUMMARY_MAX_AGE,
            max_samples: DEFAULT_SUMMARY_MAX_SAMPLES,
        }
    }
}

/// Options for instruments created by the registry
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentOptions {
    /// Upper bounds for histogram buckets
    pub histogram_buckets: Vec<f64>,
    /// Summary window settings
    pub summary: SummaryOpts,
}

impl Default for InstrumentOptions {
    fn default() -> Self {
        Self {
            histogram_buckets: prometheus::DEFAULT_BUCKETS.to_vec(),
            summary: SummaryOpts::default(),
        }
    }
}

impl InstrumentOptions {
    /// Build options from the `[instruments]` config table.
    ///
    /// Invalid bucket or quantile lists fall back to the defaults and log a
    /// warning rather than failing startup.
    pub fn from_config(config: &InstrumentsConfig) -> Self {
        let histogram_buckets = Self::validate_buckets(
            config.histogram_buckets.clone(),
            prometheus::DEFAULT_BUCKETS,
        );
        let quantiles =
            Self::validate_quantiles(config.summary_quantiles.clone(), DEFAULT_SUMMARY_QUANTILES);

        let max_samples = if config.summary_max_samples == 0 {
            warn!("summary_max_samples is zero, falling back to default");
            DEFAULT_SUMMARY_MAX_SAMPLES
        } else {
            config.summary_max_samples
        };

        let max_age = if config.summary_max_age_secs == 0 {
            warn!("summary_max_age_secs is zero, falling back to default");
            DEFAULT_SUMMARY_MAX_AGE
        } else {
            Duration::from_secs(config.summary_max_age_secs)
        };

        Self {
            histogram_buckets,
            summary: SummaryOpts {
                quantiles,
                max_age,
                max_samples,
            },
        }
    }

    pub(crate) fn validate_buckets(buckets: Option<Vec<f64>>, default: &[f64]) -> Vec<f64> {
        let Some(buckets) = buckets else {
            return default.to_vec();
        };

        if buckets.is_empty() {
            warn!("histogram_buckets is empty, falling back to default buckets");
            return default.to_vec();
        }

        if buckets.iter().any(|b| !b.is_finite()) {
            warn!("histogram_buckets contains non-finite values, falling back to default buckets");
            return default.to_vec();
        }

        if !buckets.windows(2).all(|w| w[0] < w[1]) {
            warn!(
                "histogram_buckets is not sorted in ascending order or contains duplicates, falling back to default buckets"
            );
            return default.to_vec();
        }

        buckets
    }

    pub(crate) fn validate_quantiles(quantiles: Option<Vec<f64>>, default: &[f64]) -> Vec<f64> {
        let Some(quantiles) = quantiles else {
            return default.to_vec();
        };

        if quantiles.is_empty() || quantiles.iter().any(|q| !(0.0..=1.0).contains(q)) {
            warn!("summary_quantiles must be non-empty and within [0, 1], falling back to default");
            return default.to_vec();
        }

        let mut quantiles = quantiles;
        quantiles.sort_by(|a, b| a.total_cmp(b));
        quantiles.dedup();
        quantiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_buckets_none() {
        let result = InstrumentOptions::validate_buckets(None, prometheus::DEFAULT_BUCKETS);
        assert_eq!(result, prometheus::DEFAULT_BUCKETS.to_vec());
    }

    #[test]
    fn test_validate_buckets_custom() {
        let custom = vec![0.1, 1.0, 10.0];
        let result = InstrumentOptions::validate_buckets(Some(custom.clone()), &[1.0]);
        assert_eq!(result, custom);
    }

    #[test]
    fn test_validate_buckets_unsorted_falls_back() {
        let result = InstrumentOptions::validate_buckets(Some(vec![5.0, 1.0]), &[1.0, 2.0]);
        assert_eq!(result, vec![1.0, 2.0]);

        let result = InstrumentOptions::validate_buckets(Some(vec![1.0, 1.0]), &[1.0, 2.0]);
        assert_eq!(result, vec![1.0, 2.0]);
    }

    #[test]
    fn test_validate_quantiles_out_of_range() {
        let result =
            InstrumentOptions::validate_quantiles(Some(vec![0.5, 1.5]), DEFAULT_SUMMARY_QUANTILES);
        assert_eq!(result, DEFAULT_SUMMARY_QUANTILES.to_vec());
    }

    #[test]
    fn test_validate_quantiles_sorted_and_deduped() {
        let result = InstrumentOptions::validate_quantiles(Some(vec![0.9, 0.5, 0.9]), &[0.5]);
        assert_eq!(result, vec![0.5, 0.9]);
    }

    #[test]
    fn test_from_config_zero_limits_use_defaults() {
        let config = InstrumentsConfig {
            summary_max_samples: 0,
            summary_max_age_secs: 0,
            ..Default::default()
        };
        let options = InstrumentOptions::from_config(&config);
        assert_eq!(options.summary.max_samples, DEFAULT_SUMMARY_MAX_SAMPLES);
        assert_eq!(options.summary.max_age, DEFAULT_SUMMARY_MAX_AGE);
    }
}
