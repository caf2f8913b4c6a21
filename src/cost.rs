//! Spend tracking and pre-flight budget admission.
//!
//! The [`CostGovernor`] is the only owner of budget state. Callers obtain an
//! [`Admission`] before an external call; the admission reserves the
//! estimated cost so concurrent checks cannot both pass against room for one.
//! A [`CostRecord`] can only be written by settling an admission, so a
//! rejected check never produces a record.
//!
//! Admission uses the estimate and recording uses the actual cost, so the
//! rolling sums may exceed a cap by the estimation error of in-flight calls.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{BudgetConfig, CostConfig};
use crate::error::{BudgetWindow, OrchestratorError, Result};

/// Estimates the cost of a call before it is made.
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, service: &str, operation: &str) -> f64;
}

/// Flat per-call rates looked up by `service.operation`, then `service`,
/// then a default.
#[derive(Debug, Clone, Default)]
pub struct FlatRateEstimator {
    rates: HashMap<String, f64>,
    default: f64,
}

impl FlatRateEstimator {
    pub fn new(rates: HashMap<String, f64>, default: f64) -> Self {
        Self { rates, default }
    }

    pub fn from_config(config: &CostConfig) -> Self {
        Self::new(config.rates.clone(), config.default)
    }
}

impl CostEstimator for FlatRateEstimator {
    fn estimate(&self, service: &str, operation: &str) -> f64 {
        self.rates
            .get(&format!("{service}.{operation}"))
            .or_else(|| self.rates.get(service))
            .copied()
            .unwrap_or(self.default)
    }
}

/// One external call attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRecord {
    pub service: String,
    pub operation: String,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub latency_ms: u64,
    pub success: bool,
}

/// Snapshot of caps and spend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub daily_cap: f64,
    pub monthly_cap: f64,
    pub daily_spend: f64,
    pub monthly_spend: f64,
    /// Estimates admitted but not yet settled.
    pub reserved: f64,
}

/// How a call attempt ended, for the cost record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOutcome {
    pub success: bool,
    pub latency_ms: u64,
}

#[derive(Debug, Default)]
struct Ledger {
    records: Vec<CostRecord>,
    pending: HashMap<u64, f64>,
    next_reservation: u64,
    file: Option<PathBuf>,
}

impl Ledger {
    fn spend(&self, window: BudgetWindow, now: DateTime<Utc>) -> f64 {
        self.records
            .iter()
            .filter(|r| in_window(r.timestamp, window, now))
            .map(|r| r.actual_cost)
            .sum()
    }

    fn reserved(&self) -> f64 {
        self.pending.values().sum()
    }

    /// Drops records older than the monthly window; nothing outside it is
    /// ever summed. Records arrive in time order, so the oldest is first.
    fn prune(&mut self, now: DateTime<Utc>) {
        if self
            .records
            .first()
            .is_some_and(|r| !in_window(r.timestamp, BudgetWindow::Monthly, now))
        {
            self.records
                .retain(|r| in_window(r.timestamp, BudgetWindow::Monthly, now));
        }
    }

    fn persist(&self, record: &CostRecord) -> Result<()> {
        if let Some(path) = &self.file {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }
}

fn in_window(ts: DateTime<Utc>, window: BudgetWindow, now: DateTime<Utc>) -> bool {
    match window {
        BudgetWindow::Daily => ts.date_naive() == now.date_naive(),
        BudgetWindow::Monthly => ts.year() == now.year() && ts.month() == now.month(),
    }
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks spend against daily and monthly caps.
#[derive(Clone)]
pub struct CostGovernor {
    caps: BudgetConfig,
    estimator: Arc<dyn CostEstimator>,
    ledger: Arc<Mutex<Ledger>>,
}

impl std::fmt::Debug for CostGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostGovernor")
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

impl CostGovernor {
    /// In-memory governor.
    pub fn new(caps: BudgetConfig, estimator: Arc<dyn CostEstimator>) -> Self {
        Self {
            caps,
            estimator,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// Governor persisted to a JSON-lines ledger. Records from the current
    /// month are loaded so spend survives restarts; unreadable lines are
    /// skipped with a warning.
    pub fn open(caps: BudgetConfig, estimator: Arc<dyn CostEstimator>, path: &Path) -> Result<Self> {
        let now = Utc::now();
        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CostRecord>(&line) {
                    Ok(record) if in_window(record.timestamp, BudgetWindow::Monthly, now) => {
                        records.push(record)
                    }
                    Ok(_) => {}
                    Err(e) => warn!(line = n + 1, error = %e, "skipping malformed ledger line"),
                }
            }
        } else if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(records = records.len(), path = %path.display(), "cost ledger loaded");

        let governor = Self::new(caps, estimator);
        {
            let mut ledger = lock(&governor.ledger);
            ledger.records = records;
            ledger.file = Some(path.to_path_buf());
        }
        Ok(governor)
    }

    pub fn estimate(&self, service: &str, operation: &str) -> f64 {
        self.estimator.estimate(service, operation)
    }

    /// Pre-flight check without reserving anything.
    pub fn check_budget(&self, service: &str, operation: &str, estimated_cost: f64) -> Result<()> {
        let ledger = lock(&self.ledger);
        self.check_locked(&ledger, service, operation, estimated_cost, Utc::now())
    }

    /// Checks the budget for the estimated cost and reserves it.
    pub fn admit(&self, service: &str, operation: &str, run_id: &str) -> Result<Admission> {
        let estimate = self.estimate(service, operation);
        self.admit_with_estimate(service, operation, run_id, estimate)
    }

    pub fn admit_with_estimate(
        &self,
        service: &str,
        operation: &str,
        run_id: &str,
        estimated_cost: f64,
    ) -> Result<Admission> {
        let mut ledger = lock(&self.ledger);
        self.check_locked(&ledger, service, operation, estimated_cost, Utc::now())?;

        let id = ledger.next_reservation;
        ledger.next_reservation += 1;
        ledger.pending.insert(id, estimated_cost);
        debug!(service, operation, estimated_cost, run_id, "budget admitted");

        Ok(Admission {
            ledger: Arc::clone(&self.ledger),
            reservation: id,
            service: service.to_string(),
            operation: operation.to_string(),
            run_id: run_id.to_string(),
            estimated_cost,
            released: false,
        })
    }

    /// Records the actual cost of an admitted call and releases its reservation.
    ///
    /// The spend is counted in memory before the ledger write. A write that
    /// fails is logged; the call already happened and its cost still counts
    /// against the caps for the life of the process.
    pub fn record_cost(
        &self,
        mut admission: Admission,
        actual_cost: f64,
        outcome: CallOutcome,
    ) -> CostRecord {
        let record = CostRecord {
            service: admission.service.clone(),
            operation: admission.operation.clone(),
            estimated_cost: admission.estimated_cost,
            actual_cost,
            timestamp: Utc::now(),
            run_id: admission.run_id.clone(),
            latency_ms: outcome.latency_ms,
            success: outcome.success,
        };

        let mut ledger = lock(&self.ledger);
        ledger.prune(record.timestamp);
        ledger.records.push(record.clone());
        ledger.pending.remove(&admission.reservation);
        admission.released = true;
        if let Err(e) = ledger.persist(&record) {
            warn!(
                service = %record.service,
                run_id = %record.run_id,
                actual_cost,
                error = %e,
                "failed to persist cost record, spend kept in memory only"
            );
        }
        debug!(
            service = %record.service,
            operation = %record.operation,
            actual_cost,
            success = outcome.success,
            "cost recorded"
        );
        record
    }

    pub fn daily_spend(&self) -> f64 {
        lock(&self.ledger).spend(BudgetWindow::Daily, Utc::now())
    }

    pub fn monthly_spend(&self) -> f64 {
        lock(&self.ledger).spend(BudgetWindow::Monthly, Utc::now())
    }

    /// Total actual spend recorded for one run.
    pub fn run_spend(&self, run_id: &str) -> f64 {
        lock(&self.ledger)
            .records
            .iter()
            .filter(|r| r.run_id == run_id)
            .map(|r| r.actual_cost)
            .sum()
    }

    /// Records in the current monthly window.
    pub fn records(&self) -> Vec<CostRecord> {
        lock(&self.ledger).records.clone()
    }

    pub fn state(&self) -> BudgetState {
        let now = Utc::now();
        let ledger = lock(&self.ledger);
        BudgetState {
            daily_cap: self.caps.daily_cap,
            monthly_cap: self.caps.monthly_cap,
            daily_spend: ledger.spend(BudgetWindow::Daily, now),
            monthly_spend: ledger.spend(BudgetWindow::Monthly, now),
            reserved: ledger.reserved(),
        }
    }

    fn check_locked(
        &self,
        ledger: &Ledger,
        service: &str,
        operation: &str,
        estimated_cost: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let reserved = ledger.reserved();
        let windows = [
            (BudgetWindow::Daily, self.caps.daily_cap),
            (BudgetWindow::Monthly, self.caps.monthly_cap),
        ];
        for (window, cap) in windows {
            let spend = ledger.spend(window, now) + reserved;
            if spend + estimated_cost > cap {
                warn!(service, operation, %window, spend, estimated_cost, cap, "budget exceeded");
                return Err(OrchestratorError::BudgetExceeded {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    window,
                    spend,
                    estimate: estimated_cost,
                    cap,
                });
            }
        }
        Ok(())
    }
}

/// A passed admission check holding its estimate as reserved spend.
///
/// Dropping it without settling (the call never happened) releases the
/// reservation and writes nothing.
#[derive(Debug)]
pub struct Admission {
    ledger: Arc<Mutex<Ledger>>,
    reservation: u64,
    service: String,
    operation: String,
    run_id: String,
    estimated_cost: f64,
    released: bool,
}

impl Admission {
    pub fn estimated_cost(&self) -> f64 {
        self.estimated_cost
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.released {
            lock(&self.ledger).pending.remove(&self.reservation);
        }
    }
}
