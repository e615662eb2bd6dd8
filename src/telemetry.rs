//! Head position telemetry
//!
//! Turns the source's position/clock signal into three gauges:
//! `head_position`, `head_timestamp` and `head_time_drift`.

use std::sync::Arc;

use prometheus::Gauge;
use tracing::{trace, warn};

use crate::dispatcher::unix_now_secs;
use crate::error::{Error, Result};
use crate::registry::{InstrumentHandle, InstrumentRegistry, Shape};
use crate::types::{MetricKind, PositionClockSignal};

/// Gauge holding the last processed position
pub const HEAD_POSITION: &str = "head_position";
/// Gauge holding the source timestamp of the last processed position
pub const HEAD_TIMESTAMP: &str = "head_timestamp";
/// Gauge holding how far the source clock lags behind the local clock
pub const HEAD_TIME_DRIFT: &str = "head_time_drift";

/// Updates the head gauges from clock signals
pub struct ClockTelemetry {
    registry: Arc<InstrumentRegistry>,
}

impl ClockTelemetry {
    /// Create an updater writing into `registry`
    pub fn new(registry: Arc<InstrumentRegistry>) -> Self {
        Self { registry }
    }

    /// Apply a signal against the current wall clock
    pub fn observe(&self, signal: &PositionClockSignal) -> Result<()> {
        self.observe_at(signal, unix_now_secs())
    }

    /// Apply a signal against an explicit wall clock (seconds since epoch).
    ///
    /// Drift is `now - timestamp`, clamped at zero when the source runs ahead.
    /// Positions are not checked for monotonicity. Each gauge is updated on
    /// its own; when one cannot be (its name is taken by another shape) the
    /// others are still set and the first failure is returned.
    pub fn observe_at(&self, signal: &PositionClockSignal, now_secs: f64) -> Result<()> {
        let drift = (now_secs - signal.timestamp_seconds as f64).max(0.0);

        let updates = [
            (
                HEAD_POSITION,
                "Last processed source position",
                signal.position as f64,
            ),
            (
                HEAD_TIMESTAMP,
                "Source timestamp of the last processed position",
                signal.timestamp_seconds as f64,
            ),
            (
                HEAD_TIME_DRIFT,
                "Seconds the last processed position lags the local clock",
                drift,
            ),
        ];

        let mut first_error = None;
        for (name, help, value) in updates {
            match self.gauge(name, help) {
                Ok(gauge) => gauge.set(value),
                Err(e) => {
                    warn!(gauge = name, error = %e, "Head gauge not updated");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        trace!(
            position = signal.position,
            timestamp = signal.timestamp_seconds,
            drift,
            "Head telemetry updated"
        );
        Ok(())
    }

    fn gauge(&self, name: &str, help: &str) -> Result<Gauge> {
        let instrument =
            self.registry
                .get_or_create_with_help::<&str>(name, MetricKind::Gauge, &[], help)?;
        match instrument.handle() {
            InstrumentHandle::Gauge(vec) => Ok(vec.get_metric_with_label_values(&[])?),
            // get_or_create already enforced the gauge shape
            _ => Err(Error::ShapeConflict {
                name: name.to_string(),
                existing: instrument.shape().clone(),
                requested: Shape::new(MetricKind::Gauge, Vec::<String>::new()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gauge_value(registry: &InstrumentRegistry, name: &str) -> f64 {
        match registry.get(name).unwrap().handle() {
            InstrumentHandle::Gauge(g) => g.with_label_values(&[]).get(),
            _ => panic!("not a gauge"),
        }
    }

    #[test]
    fn test_sets_position_and_timestamp() {
        let registry = Arc::new(InstrumentRegistry::default());
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));

        telemetry
            .observe_at(&PositionClockSignal::new(1200, 1_700_000_000), 1_700_000_000.0)
            .unwrap();

        assert_eq!(gauge_value(&registry, HEAD_POSITION), 1200.0);
        assert_eq!(gauge_value(&registry, HEAD_TIMESTAMP), 1_700_000_000.0);
        assert_eq!(gauge_value(&registry, HEAD_TIME_DRIFT), 0.0);
    }

    #[test]
    fn test_drift_behind_wall_clock() {
        let registry = Arc::new(InstrumentRegistry::default());
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));
        let now = 1_700_000_100.0;

        telemetry
            .observe_at(&PositionClockSignal::new(1, 1_700_000_095), now)
            .unwrap();
        assert_eq!(gauge_value(&registry, HEAD_TIME_DRIFT), 5.0);
    }

    #[test]
    fn test_future_timestamp_clamps_to_zero() {
        let registry = Arc::new(InstrumentRegistry::default());
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));
        let now = 1_700_000_100.0;

        telemetry
            .observe_at(&PositionClockSignal::new(1, 1_700_000_110), now)
            .unwrap();
        assert_eq!(gauge_value(&registry, HEAD_TIME_DRIFT), 0.0);
    }

    #[test]
    fn test_repeated_signals_overwrite() {
        let registry = Arc::new(InstrumentRegistry::default());
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));

        telemetry
            .observe_at(&PositionClockSignal::new(10, 100), 100.0)
            .unwrap();
        // Going backwards is accepted as-is
        telemetry
            .observe_at(&PositionClockSignal::new(5, 90), 100.0)
            .unwrap();

        assert_eq!(gauge_value(&registry, HEAD_POSITION), 5.0);
        assert_eq!(gauge_value(&registry, HEAD_TIME_DRIFT), 10.0);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_live_clock() {
        let registry = Arc::new(InstrumentRegistry::default());
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));
        let ts = unix_now_secs() as i64 - 5;

        telemetry.observe(&PositionClockSignal::new(1, ts)).unwrap();
        let drift = gauge_value(&registry, HEAD_TIME_DRIFT);
        assert!((5.0..7.0).contains(&drift));
    }

    #[test]
    fn test_conflicting_head_gauge_is_error() {
        let registry = Arc::new(InstrumentRegistry::default());
        registry
            .get_or_create::<&str>(HEAD_POSITION, MetricKind::Counter, &[])
            .unwrap();
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));

        assert!(matches!(
            telemetry.observe_at(&PositionClockSignal::new(1, 1), 1.0),
            Err(Error::ShapeConflict { .. })
        ));
    }

    #[test]
    fn test_conflicting_head_gauge_does_not_block_others() {
        let registry = Arc::new(InstrumentRegistry::default());
        registry
            .get_or_create::<&str>(HEAD_POSITION, MetricKind::Counter, &[])
            .unwrap();
        let telemetry = ClockTelemetry::new(Arc::clone(&registry));

        let result = telemetry.observe_at(&PositionClockSignal::new(42, 1_000), 1_003.0);
        assert!(matches!(result, Err(Error::ShapeConflict { ref name, .. }) if name == HEAD_POSITION));

        assert_eq!(gauge_value(&registry, HEAD_TIMESTAMP), 1_000.0);
        assert_eq!(gauge_value(&registry, HEAD_TIME_DRIFT), 3.0);
        assert_eq!(registry.get(HEAD_POSITION).unwrap().kind(), MetricKind::Counter);
    }
}
