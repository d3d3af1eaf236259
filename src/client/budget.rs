// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error-budget tracking per service.
//!
//! The client reports the outcome of every logical call as a
//! [`BudgetEvent`] over an unbounded channel. Sending never blocks and a
//! closed channel is ignored, so the tracker can never affect a caller.
//!
//! ```
//! use matchcast_client::client::ErrorBudgetTracker;
//!
//! let tracker = ErrorBudgetTracker::default();
//! let report = tracker.track("backend", true);
//! assert!(report.is_healthy);
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Default reliability target (99.9 %).
pub const DEFAULT_TARGET_RELIABILITY: f64 = 0.999;

/// Outcome of one logical call to a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetEvent {
    pub service: String,
    pub success: bool,
}

/// Sending half used by the client.
///
/// Unbounded, so a receiver that is kept but never drained grows without
/// limit. Drain it with [`ErrorBudgetTracker::spawn_consumer`].
pub type BudgetSink = mpsc::UnboundedSender<BudgetEvent>;

/// Result of recording one outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetReport {
    pub error_rate: f64,
    /// Allowed error rate minus observed error rate. Negative when exhausted.
    pub budget_remaining: f64,
    pub is_healthy: bool,
}

/// Accumulated counts for one service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetStatus {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub budget_remaining: f64,
    pub target_reliability: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    total: u64,
    failed: u64,
}

impl Counts {
    fn error_rate(self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

/// Tracks failure ratios against a reliability target.
#[derive(Debug)]
pub struct ErrorBudgetTracker {
    target_reliability: f64,
    budgets: Mutex<BTreeMap<String, Counts>>,
}

impl Default for ErrorBudgetTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_RELIABILITY)
    }
}

impl ErrorBudgetTracker {
    /// `target_reliability` is clamped to `[0, 1]`.
    #[must_use]
    pub fn new(target_reliability: f64) -> Self {
        Self {
            target_reliability: target_reliability.clamp(0.0, 1.0),
            budgets: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Counts>> {
        self.budgets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The allowed error rate.
    #[must_use]
    pub fn budget(&self) -> f64 {
        1.0 - self.target_reliability
    }

    /// Record one outcome for `service`.
    pub fn track(&self, service: &str, success: bool) -> BudgetReport {
        let counts = {
            let mut budgets = self.lock();
            let counts = budgets.entry(service.to_string()).or_default();
            counts.total += 1;
            if !success {
                counts.failed += 1;
            }
            *counts
        };

        let budget = self.budget();
        let error_rate = counts.error_rate();
        let budget_remaining = budget - error_rate;

        if budget_remaining < 0.0 {
            error!(
                service,
                error_rate_pct = error_rate * 100.0,
                target_pct = budget * 100.0,
                "Error budget exhausted"
            );
        } else if budget_remaining < budget * 0.2 {
            warn!(
                service,
                remaining_pct = budget_remaining * 100.0,
                "Error budget low"
            );
        }

        BudgetReport {
            error_rate,
            budget_remaining,
            is_healthy: budget_remaining >= 0.0,
        }
    }

    #[must_use]
    pub fn status(&self, service: &str) -> Option<BudgetStatus> {
        let counts = *self.lock().get(service)?;
        let error_rate = counts.error_rate();
        Some(BudgetStatus {
            total_requests: counts.total,
            failed_requests: counts.failed,
            error_rate,
            budget_remaining: self.budget() - error_rate,
            target_reliability: self.target_reliability,
        })
    }

    /// Forget one service, or every service when `None`.
    pub fn reset(&self, service: Option<&str>) {
        let mut budgets = self.lock();
        match service {
            Some(name) => {
                budgets.remove(name);
            }
            None => budgets.clear(),
        }
    }

    /// A sink/receiver pair for wiring a client to a tracker.
    #[must_use]
    pub fn channel() -> (BudgetSink, mpsc::UnboundedReceiver<BudgetEvent>) {
        mpsc::unbounded_channel()
    }

    /// Drain `events` into this tracker until every sender is dropped.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<BudgetEvent>,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                tracker.track(&event.service, event.success);
            }
            debug!("Error budget consumer finished");
        })
    }
}
