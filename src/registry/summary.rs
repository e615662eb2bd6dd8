//! Summary instrument
//!
//! The prometheus crate ships no summary type, so summaries are kept here and
//! written to the exposition text next to the encoder output. Each label
//! combination keeps a total count, a running sum and a sliding window of
//! recent observations from which quantiles are computed at render time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write;
use std::time::Instant;

use parking_lot::Mutex;
use prometheus::core::Desc;

use super::options::SummaryOpts;
use crate::error::{Error, Result};

/// Per-series state
#[derive(Debug, Default)]
struct SeriesState {
    count: u64,
    sum: f64,
    window: VecDeque<(Instant, f64)>,
}

impl SeriesState {
    fn observe(&mut self, value: f64, now: Instant, opts: &SummaryOpts) {
        self.count += 1;
        self.sum += value;
        self.window.push_back((now, value));
        while self.window.len() > opts.max_samples {
            self.window.pop_front();
        }
        self.prune(now, opts);
    }

    fn prune(&mut self, now: Instant, opts: &SummaryOpts) {
        while let Some((at, _)) = self.window.front() {
            if now.saturating_duration_since(*at) > opts.max_age {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Quantiles over the current window; NaN when the window is empty
    fn quantiles(&self, quantiles: &[f64]) -> Vec<(f64, f64)> {
        let mut values: Vec<f64> = self.window.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.total_cmp(b));

        quantiles
            .iter()
            .map(|&q| {
                if values.is_empty() {
                    return (q, f64::NAN);
                }
                let rank = (q * values.len() as f64).ceil() as usize;
                let idx = rank.saturating_sub(1).min(values.len() - 1);
                (q, values[idx])
            })
            .collect()
    }
}

/// Summary with one sub-series per label-value combination
#[derive(Debug)]
pub struct SummaryVec {
    name: String,
    help: String,
    label_names: Vec<String>,
    opts: SummaryOpts,
    series: Mutex<BTreeMap<Vec<String>, SeriesState>>,
}

impl SummaryVec {
    /// Create a summary; names are validated with the same rules the
    /// prometheus crate applies to its own collectors.
    pub fn new(name: &str, help: &str, label_names: &[String], opts: SummaryOpts) -> Result<Self> {
        Desc::new(
            name.to_string(),
            help.to_string(),
            label_names.to_vec(),
            HashMap::new(),
        )?;

        if label_names.iter().any(|l| l == "quantile") {
            return Err(Error::Prometheus(prometheus::Error::Msg(
                "`quantile` is not allowed as label name in summaries".to_string(),
            )));
        }

        Ok(Self {
            name: name.to_string(),
            help: help.to_string(),
            label_names: label_names.to_vec(),
            opts,
            series: Mutex::new(BTreeMap::new()),
        })
    }

    /// Label values ordered like `label_names`
    fn series_key(&self, labels: &HashMap<&str, &str>) -> Result<Vec<String>> {
        if labels.len() != self.label_names.len() {
            return Err(Error::Prometheus(prometheus::Error::InconsistentCardinality {
                expect: self.label_names.len(),
                got: labels.len(),
            }));
        }

        self.label_names
            .iter()
            .map(|name| {
                labels.get(name.as_str()).map(|v| v.to_string()).ok_or_else(|| {
                    Error::Prometheus(prometheus::Error::Msg(format!(
                        "label name {} missing in label map",
                        name
                    )))
                })
            })
            .collect()
    }

    /// Record one observation
    pub fn observe(&self, labels: &HashMap<&str, &str>, value: f64) -> Result<()> {
        let key = self.series_key(labels)?;
        let now = Instant::now();
        self.series
            .lock()
            .entry(key)
            .or_default()
            .observe(value, now, &self.opts);
        Ok(())
    }

    /// Delete one sub-series; returns whether it existed
    pub fn remove(&self, labels: &HashMap<&str, &str>) -> Result<bool> {
        let key = self.series_key(labels)?;
        Ok(self.series.lock().remove(&key).is_some())
    }

    /// Delete every sub-series
    pub fn reset(&self) {
        self.series.lock().clear();
    }

    /// Number of live sub-series
    pub fn series_count(&self) -> usize {
        self.series.lock().len()
    }

    /// Total observation count of one sub-series
    pub fn sample_count(&self, labels: &HashMap<&str, &str>) -> Option<u64> {
        let key = self.series_key(labels).ok()?;
        self.series.lock().get(&key).map(|s| s.count)
    }

    /// Append this summary in text exposition format.
    ///
    /// Writes nothing when there is no sub-series, matching how the encoder
    /// skips empty metric families.
    pub fn encode_text(&self, output: &mut String) {
        let now = Instant::now();
        let mut series = self.series.lock();
        if series.is_empty() {
            return;
        }

        let _ = writeln!(output, "# HELP {} {}", self.name, escape_help(&self.help));
        let _ = writeln!(output, "# TYPE {} summary", self.name);

        for (values, state) in series.iter_mut() {
            state.prune(now, &self.opts);
            let pairs: Vec<(&str, String)> = self
                .label_names
                .iter()
                .map(String::as_str)
                .zip(values.iter().cloned())
                .collect();

            for (q, v) in state.quantiles(&self.opts.quantiles) {
                let mut with_quantile = pairs.clone();
                with_quantile.push(("quantile", q.to_string()));
                let _ = writeln!(
                    output,
                    "{}{} {}",
                    self.name,
                    format_labels(&with_quantile),
                    format_value(v)
                );
            }
            let _ = writeln!(
                output,
                "{}_sum{} {}",
                self.name,
                format_labels(&pairs),
                format_value(state.sum)
            );
            let _ = writeln!(
                output,
                "{}_count{} {}",
                self.name,
                format_labels(&pairs),
                state.count
            );
        }
    }
}

fn format_labels(pairs: &[(&str, String)]) -> String {
    if pairs.is_empty() {
        return String::new();
    }
    let body: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    format!("{{{}}}", body.join(","))
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

fn escape_label_value(v: &str) -> String {
    v.replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('\n', r"\n")
}

fn escape_help(h: &str) -> String {
    h.replace('\\', r"\\").replace('\n', r"\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn labels<'a>(pairs: &[(&'a str, &'a str)]) -> HashMap<&'a str, &'a str> {
        pairs.iter().cloned().collect()
    }

    fn summary(label_names: &[&str]) -> SummaryVec {
        let names: Vec<String> = label_names.iter().map(|s| s.to_string()).collect();
        SummaryVec::new("latency_seconds", "Request latency", &names, SummaryOpts::default())
            .unwrap()
    }

    #[test]
    fn test_rejects_invalid_names() {
        assert!(SummaryVec::new("bad-name", "help", &[], SummaryOpts::default()).is_err());
        assert!(SummaryVec::new(
            "ok_name",
            "help",
            &["quantile".to_string()],
            SummaryOpts::default()
        )
        .is_err());
    }

    #[test]
    fn test_observe_and_encode() {
        let s = summary(&["route"]);
        let l = labels(&[("route", "/a")]);
        for v in 1..=100 {
            s.observe(&l, v as f64).unwrap();
        }

        let mut out = String::new();
        s.encode_text(&mut out);

        assert!(out.contains("# TYPE latency_seconds summary"));
        assert!(out.contains("latency_seconds{route=\"/a\",quantile=\"0.5\"} 50"));
        assert!(out.contains("latency_seconds{route=\"/a\",quantile=\"0.99\"} 99"));
        assert!(out.contains("latency_seconds_sum{route=\"/a\"} 5050"));
        assert!(out.contains("latency_seconds_count{route=\"/a\"} 100"));
    }

    #[test]
    fn test_window_is_bounded() {
        let opts = SummaryOpts {
            quantiles: vec![0.5],
            max_age: Duration::from_secs(600),
            max_samples: 3,
        };
        let s = SummaryVec::new("w", "help", &[], opts).unwrap();
        let l = HashMap::new();
        for v in [100.0, 1.0, 2.0, 3.0] {
            s.observe(&l, v).unwrap();
        }

        let mut out = String::new();
        s.encode_text(&mut out);
        // 100.0 left the window but still counts towards sum and count
        assert!(out.contains("w{quantile=\"0.5\"} 2"));
        assert!(out.contains("w_sum 106"));
        assert!(out.contains("w_count 4"));
    }

    #[test]
    fn test_remove_and_reset() {
        let s = summary(&["route"]);
        s.observe(&labels(&[("route", "/a")]), 1.0).unwrap();
        s.observe(&labels(&[("route", "/b")]), 1.0).unwrap();

        assert!(s.remove(&labels(&[("route", "/a")])).unwrap());
        assert!(!s.remove(&labels(&[("route", "/a")])).unwrap());
        assert_eq!(s.series_count(), 1);
        assert_eq!(s.sample_count(&labels(&[("route", "/b")])), Some(1));

        s.reset();
        let mut out = String::new();
        s.encode_text(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_label_mismatch_is_error() {
        let s = summary(&["route"]);
        assert!(s.observe(&labels(&[("path", "/a")]), 1.0).is_err());
        assert!(s.observe(&HashMap::new(), 1.0).is_err());
    }

    #[test]
    fn test_label_value_escaping() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
        assert_eq!(format_value(f64::NAN), "NaN");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
    }
}
