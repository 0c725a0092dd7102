//! Period-scoped spend tracking with one-shot threshold signals
//!
//! Accumulates completion costs against an optional limit within a rolling
//! calendar period (hour, day, or month). Crossing 80% of the limit raises
//! the warning signal once per period, crossing the limit the exceeded
//! signal once per period. The period rolls lazily when a record lands past
//! the boundary, clearing totals and re-arming both signals.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Fraction of the limit at which the warning fires
const WARNING_FRACTION: f64 = 0.8;

/// Calendar window spend is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Hourly,
    Daily,
    Monthly,
}

impl BudgetPeriod {
    /// Boundary the period containing `ts` opened on
    fn start_of(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let start = match self {
            BudgetPeriod::Hourly => {
                Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), 0, 0)
            }
            BudgetPeriod::Daily => Utc.with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0),
            BudgetPeriod::Monthly => Utc.with_ymd_and_hms(ts.year(), ts.month(), 1, 0, 0, 0),
        };
        start.single().unwrap_or(ts)
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetPeriod::Hourly => write!(f, "hourly"),
            BudgetPeriod::Daily => write!(f, "daily"),
            BudgetPeriod::Monthly => write!(f, "monthly"),
        }
    }
}

/// Budget settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Dollars allowed per period; `None` disables the signals
    pub limit: Option<f64>,
    /// Window the limit applies to
    pub period: BudgetPeriod,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit: None,
            period: BudgetPeriod::Daily,
        }
    }
}

/// Threshold crossings produced by one recorded spend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BudgetCrossings {
    /// This record pushed spend past 80% of the limit
    pub warning: bool,
    /// This record pushed spend past the limit
    pub exceeded: bool,
}

/// Point-in-time budget view
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Dollars spent this period
    pub spent: f64,
    /// Calls recorded this period
    pub requests: u64,
    /// Configured limit, if any
    pub limit: Option<f64>,
    /// Boundary the current period opened on
    pub period_started_at: DateTime<Utc>,
}

/// Rolling spend accumulator with one-shot threshold signals
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: BudgetConfig,
    period_started_at: DateTime<Utc>,
    spent: f64,
    requests: u64,
    warned: bool,
    exceeded: bool,
}

impl BudgetTracker {
    /// Create a tracker with the current period open
    pub fn new(config: BudgetConfig) -> Self {
        let period_started_at = config.period.start_of(Utc::now());
        Self {
            config,
            period_started_at,
            spent: 0.0,
            requests: 0,
            warned: false,
            exceeded: false,
        }
    }

    /// Record spend at the current wall-clock time
    pub fn record(&mut self, cost: f64) -> BudgetCrossings {
        self.record_at(Utc::now(), cost)
    }

    /// Record spend at an explicit time, rolling the period first when its
    /// boundary has passed
    pub fn record_at(&mut self, now: DateTime<Utc>, cost: f64) -> BudgetCrossings {
        self.roll_if_needed(now);
        self.spent += cost;
        self.requests += 1;

        let mut crossings = BudgetCrossings::default();
        if let Some(limit) = self.config.limit {
            if !self.warned && self.spent >= limit * WARNING_FRACTION {
                self.warned = true;
                crossings.warning = true;
            }
            if !self.exceeded && self.spent >= limit {
                self.exceeded = true;
                crossings.exceeded = true;
            }
        }
        crossings
    }

    fn roll_if_needed(&mut self, now: DateTime<Utc>) {
        let start = self.config.period.start_of(now);
        if start != self.period_started_at {
            self.period_started_at = start;
            self.spent = 0.0;
            self.requests = 0;
            self.warned = false;
            self.exceeded = false;
        }
    }

    /// Spend in the period containing `now`, zero when the tracked period
    /// is stale
    pub fn spent_at(&self, now: DateTime<Utc>) -> f64 {
        if self.config.period.start_of(now) == self.period_started_at {
            self.spent
        } else {
            0.0
        }
    }

    /// Spend in the current period
    pub fn spent(&self) -> f64 {
        self.spent_at(Utc::now())
    }

    /// Budget settings
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Current view of the tracker
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            spent: self.spent,
            requests: self.requests,
            limit: self.config.limit,
            period_started_at: self.period_started_at,
        }
    }
}
