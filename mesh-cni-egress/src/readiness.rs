use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub ready: bool,
}

/// Collects readiness from the agent's components.
pub trait HealthAggregator: Send + Sync {
    /// A zero `timeout` means reports never go stale.
    fn register_reporter(&self, name: &str, reports_ready: bool, timeout: Duration);
    fn report(&self, name: &str, report: HealthReport);
}

#[derive(Debug)]
struct Reporter {
    reports_ready: bool,
    timeout: Duration,
    last: Option<(Instant, HealthReport)>,
}

impl Reporter {
    fn ready(&self, now: Instant) -> bool {
        if !self.reports_ready {
            return true;
        }
        match self.last {
            Some((at, report)) => {
                report.ready && (self.timeout.is_zero() || now.duration_since(at) <= self.timeout)
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Readiness {
    reporters: Mutex<BTreeMap<String, Reporter>>,
}

impl Readiness {
    pub fn ready(&self) -> bool {
        let now = Instant::now();
        self.reporters
            .lock()
            .unwrap()
            .values()
            .all(|reporter| reporter.ready(now))
    }

    /// Per reporter readiness, in name order.
    pub fn summary(&self) -> Vec<(String, bool)> {
        let now = Instant::now();
        self.reporters
            .lock()
            .unwrap()
            .iter()
            .map(|(name, reporter)| (name.clone(), reporter.ready(now)))
            .collect()
    }
}

impl HealthAggregator for Readiness {
    fn register_reporter(&self, name: &str, reports_ready: bool, timeout: Duration) {
        self.reporters.lock().unwrap().insert(
            name.to_string(),
            Reporter {
                reports_ready,
                timeout,
                last: None,
            },
        );
    }

    fn report(&self, name: &str, report: HealthReport) {
        match self.reporters.lock().unwrap().get_mut(name) {
            Some(reporter) => reporter.last = Some((Instant::now(), report)),
            None => debug!(reporter = %name, "report from unregistered reporter"),
        }
    }
}
