//! Spend accounting over rolling calendar windows
//!
//! Tracks hourly, daily, and monthly totals plus a lifetime sum. Windows
//! roll lazily: a record landing past a boundary replaces the stale window
//! instead of anything running on a timer. Reads treat a stale window as
//! zero. In-memory only; totals vanish with the adapter.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
        .single()
        .unwrap_or(ts)
}

fn day_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
        .single()
        .unwrap_or(ts)
}

fn month_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(ts)
}

/// Accumulated spend within one calendar window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostWindow {
    /// Boundary the window opened on
    pub started_at: DateTime<Utc>,
    /// Dollars spent since the boundary
    pub total: f64,
    /// Calls recorded since the boundary
    pub requests: u64,
}

impl CostWindow {
    fn opened(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            total: 0.0,
            requests: 0,
        }
    }
}

/// Point-in-time view of all windows
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CostSnapshot {
    pub hourly: f64,
    pub daily: f64,
    pub monthly: f64,
    pub lifetime: f64,
}

/// Rolling spend accumulator
#[derive(Debug, Clone)]
pub struct CostTracker {
    hour: CostWindow,
    day: CostWindow,
    month: CostWindow,
    lifetime: f64,
}

impl CostTracker {
    /// Create a tracker with all windows opened now
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            hour: CostWindow::opened(hour_start(now)),
            day: CostWindow::opened(day_start(now)),
            month: CostWindow::opened(month_start(now)),
            lifetime: 0.0,
        }
    }

    /// Record spend at the current wall-clock time
    pub fn record(&mut self, cost: f64) {
        self.record_at(Utc::now(), cost);
    }

    /// Record spend at an explicit time, rolling any window whose boundary
    /// has passed
    pub fn record_at(&mut self, now: DateTime<Utc>, cost: f64) {
        let hs = hour_start(now);
        if self.hour.started_at != hs {
            self.hour = CostWindow::opened(hs);
        }
        let ds = day_start(now);
        if self.day.started_at != ds {
            self.day = CostWindow::opened(ds);
        }
        let ms = month_start(now);
        if self.month.started_at != ms {
            self.month = CostWindow::opened(ms);
        }

        self.hour.total += cost;
        self.hour.requests += 1;
        self.day.total += cost;
        self.day.requests += 1;
        self.month.total += cost;
        self.month.requests += 1;
        self.lifetime += cost;
    }

    /// Spend in the hour containing `now`
    pub fn hour_total_at(&self, now: DateTime<Utc>) -> f64 {
        if self.hour.started_at == hour_start(now) {
            self.hour.total
        } else {
            0.0
        }
    }

    /// Spend in the current wall-clock hour
    pub fn hour_total(&self) -> f64 {
        self.hour_total_at(Utc::now())
    }

    /// Spend in the day containing `now`
    pub fn day_total_at(&self, now: DateTime<Utc>) -> f64 {
        if self.day.started_at == day_start(now) {
            self.day.total
        } else {
            0.0
        }
    }

    /// Spend in the month containing `now`
    pub fn month_total_at(&self, now: DateTime<Utc>) -> f64 {
        if self.month.started_at == month_start(now) {
            self.month.total
        } else {
            0.0
        }
    }

    /// Total spend over the tracker's lifetime
    pub fn lifetime_total(&self) -> f64 {
        self.lifetime
    }

    /// All windows as seen at `now`
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> CostSnapshot {
        CostSnapshot {
            hourly: self.hour_total_at(now),
            daily: self.day_total_at(now),
            monthly: self.month_total_at(now),
            lifetime: self.lifetime,
        }
    }

    /// All windows as seen right now
    pub fn snapshot(&self) -> CostSnapshot {
        self.snapshot_at(Utc::now())
    }
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}
