//! Sliding-window telemetry aggregation.
//!
//! Each tracked quantity keeps a time-bounded window of `(timestamp, value)`
//! samples; derived metrics are recomputed from the windows on every request,
//! never cached. Throughput and efficiency divide by elapsed time measured
//! from the window's first retained sample, so they shift as old samples
//! evict; downstream dashboards already account for that.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Window used for the rolling power-consumption average.
fn consumption_average_window() -> Duration {
    Duration::minutes(60)
}

/// A quantity tracked by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Instantaneous power draw, kW
    PowerConsumption,
    /// Cutting speed, device units
    CuttingSpeed,
    /// Cumulative produced-piece counter
    PiecesCount,
}

/// Metrics derived from the current window state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedMetrics {
    /// Mean power consumption over the last 60 minutes, kW
    pub average_consumption: f64,
    /// Mean cutting speed over the full retained window
    pub average_cutting_speed: f64,
    /// Pieces produced per kWh consumed within the window
    pub efficiency_rate: f64,
    /// Pieces produced per hour within the window
    pub pieces_per_hour: f64,
    /// Latest value of the piece counter
    pub total_pieces: i64,
    /// Share of wall-clock time the machine was active, percent
    pub uptime_percentage: f64,
    /// Active time since aggregator creation or last reset, seconds
    pub active_seconds: i64,
}

/// Sliding-time-window accumulator for operational metrics.
#[derive(Debug)]
pub struct TelemetryAggregator {
    window: Duration,
    consumption: VecDeque<(DateTime<Utc>, f64)>,
    speed: VecDeque<(DateTime<Utc>, f64)>,
    pieces: VecDeque<(DateTime<Utc>, f64)>,
    started_at: DateTime<Utc>,
    total_downtime: Duration,
    last_activity: Option<(DateTime<Utc>, bool)>,
}

impl TelemetryAggregator {
    /// Create an aggregator retaining samples for `window`.
    #[must_use]
    pub fn new(window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            window,
            consumption: VecDeque::new(),
            speed: VecDeque::new(),
            pieces: VecDeque::new(),
            started_at: now,
            total_downtime: Duration::zero(),
            last_activity: None,
        }
    }

    /// Append a sample to a quantity's window.
    ///
    /// Samples older than the newest one already in that window are dropped
    /// (windows are monotonically non-decreasing in timestamp). Every append
    /// evicts samples older than `timestamp - window` from all windows.
    pub fn record_sample(&mut self, quantity: Quantity, timestamp: DateTime<Utc>, value: f64) {
        let window = match quantity {
            Quantity::PowerConsumption => &mut self.consumption,
            Quantity::CuttingSpeed => &mut self.speed,
            Quantity::PiecesCount => &mut self.pieces,
        };

        if let Some(&(newest, _)) = window.back() {
            if timestamp < newest {
                tracing::debug!(?quantity, %timestamp, "Dropping out-of-order sample");
                return;
            }
        }
        window.push_back((timestamp, value));

        self.evict(timestamp);
    }

    /// Record an activity transition used for downtime accounting.
    ///
    /// Downtime accrues over intervals during which the machine was
    /// inactive, measured between consecutive activity reports.
    pub fn record_activity(&mut self, timestamp: DateTime<Utc>, active: bool) {
        if let Some((previous_at, previously_active)) = self.last_activity {
            if !previously_active && timestamp > previous_at {
                self.total_downtime = self.total_downtime + (timestamp - previous_at);
            }
        }
        self.last_activity = Some((timestamp, active));
    }

    /// Compute the derived metrics from the current window state.
    ///
    /// Pure with respect to the aggregator: repeated calls with no new
    /// samples return identical results. Empty windows and zero elapsed
    /// time yield `0`, never a division fault.
    #[must_use]
    pub fn compute(&self, now: DateTime<Utc>) -> ProcessedMetrics {
        let average_consumption = {
            let threshold = now - consumption_average_window();
            mean(self.consumption.iter().filter(|(t, _)| *t >= threshold).map(|(_, v)| *v))
        };

        let average_cutting_speed = mean(self.speed.iter().map(|(_, v)| *v));

        let pieces_diff = match (self.pieces.front(), self.pieces.back()) {
            (Some((_, first)), Some((_, last))) => last - first,
            _ => 0.0,
        };

        let efficiency_rate = {
            let total_kwh: f64 = self.consumption.iter().map(|(_, v)| *v).sum::<f64>() / 3600.0;
            if total_kwh > 0.0 {
                pieces_diff / total_kwh
            } else {
                0.0
            }
        };

        let pieces_per_hour = if self.pieces.len() < 2 {
            0.0
        } else {
            let first = self.pieces.front().map(|(t, _)| *t).unwrap_or(now);
            let last = self.pieces.back().map(|(t, _)| *t).unwrap_or(now);
            let elapsed_hours = (last - first).num_milliseconds() as f64 / 3_600_000.0;
            if elapsed_hours > 0.0 {
                pieces_diff / elapsed_hours
            } else {
                0.0
            }
        };

        let total_pieces = self.pieces.back().map_or(0, |(_, v)| *v as i64);

        // Extend an open inactive interval up to `now` in the computed view
        // only; the accumulator itself moves on the next activity report.
        let mut downtime = self.total_downtime;
        if let Some((at, false)) = self.last_activity {
            if now > at {
                downtime = downtime + (now - at);
            }
        }

        let total_elapsed = now - self.started_at;
        let uptime = (total_elapsed - downtime).max(Duration::zero());
        let uptime_percentage = if total_elapsed > Duration::zero() {
            uptime.num_milliseconds() as f64 / total_elapsed.num_milliseconds() as f64 * 100.0
        } else {
            0.0
        };

        ProcessedMetrics {
            average_consumption,
            average_cutting_speed,
            efficiency_rate,
            pieces_per_hour,
            total_pieces,
            uptime_percentage,
            active_seconds: uptime.num_seconds(),
        }
    }

    /// Clear all windows and restart uptime accounting.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.consumption.clear();
        self.speed.clear();
        self.pieces.clear();
        self.started_at = now;
        self.total_downtime = Duration::zero();
        self.last_activity = None;
    }

    /// Number of retained samples across all windows.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.consumption.len() + self.speed.len() + self.pieces.len()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let threshold = now - self.window;
        for window in [&mut self.consumption, &mut self.speed, &mut self.pieces] {
            while window.front().is_some_and(|(t, _)| *t < threshold) {
                window.pop_front();
            }
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in values {
        sum += v;
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
