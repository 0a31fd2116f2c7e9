//! Pool wait report

use crate::group::WorkerExit;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

/// Worker completion information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub idx: usize,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub exit: Option<WorkerExit>,
}

/// What the coordinator observed while supervising its pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: Vec<WorkerSummary>,
    pub duration: Duration,
    /// A termination signal was forwarded to the group.
    pub interrupted: bool,
}

impl PoolReport {
    /// Workers that did not exit cleanly.
    pub fn failed(&self) -> impl Iterator<Item = &WorkerSummary> {
        self.workers
            .iter()
            .filter(|worker| !worker.exit.is_some_and(|exit| exit.success()))
    }

    /// True when every worker exited cleanly, or the pool was shut down on request.
    pub fn succeeded(&self) -> bool {
        self.interrupted || self.failed().next().is_none()
    }

    pub fn log(&self) {
        info!(
            "Worker pool finished: {} workers, {} failed, {:.1}s{}",
            self.workers.len(),
            self.failed().count(),
            self.duration.as_secs_f64(),
            if self.interrupted { " (interrupted)" } else { "" }
        );

        for worker in &self.workers {
            let uptime = Utc::now().signed_duration_since(worker.started_at);
            match worker.exit {
                Some(exit) if exit.success() => info!(
                    "worker {} pid={} {} after {:.1}s",
                    worker.idx,
                    worker.pid,
                    exit,
                    uptime.num_milliseconds() as f64 / 1000.0
                ),
                Some(exit) => warn!("worker {} pid={} {}", worker.idx, worker.pid, exit),
                None => warn!("worker {} pid={} exit not observed", worker.idx, worker.pid),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(idx: usize, exit: Option<WorkerExit>) -> WorkerSummary {
        WorkerSummary {
            idx,
            pid: 100 + idx as u32,
            started_at: Utc::now(),
            exit,
        }
    }

    #[test]
    fn test_empty_report_succeeds() {
        assert!(PoolReport::default().succeeded());
    }

    #[test]
    fn test_failed_workers() {
        let report = PoolReport {
            workers: vec![
                summary(0, Some(WorkerExit::Code(0))),
                summary(1, Some(WorkerExit::Code(1))),
                summary(2, Some(WorkerExit::Signal(9))),
                summary(3, None),
            ],
            ..PoolReport::default()
        };
        let failed: Vec<usize> = report.failed().map(|w| w.idx).collect();
        assert_eq!(failed, vec![1, 2, 3]);
        assert!(!report.succeeded());

        let interrupted = PoolReport {
            interrupted: true,
            ..report
        };
        assert!(interrupted.succeeded());
    }
}
