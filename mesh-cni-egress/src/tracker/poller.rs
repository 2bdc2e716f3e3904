use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::GatewayHealth;
use crate::tracker::EgwHealthReport;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub(crate) struct ProbeSettings {
    pub interval: Duration,
    pub fail_count: u32,
    client: reqwest::Client,
}

impl ProbeSettings {
    pub fn new(interval: Duration, fail_count: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| Error::Other(format!("failed to build probe client: {e}")))?;
        Ok(Self {
            interval,
            fail_count: fail_count.max(1),
            client,
        })
    }

    fn timeout(&self) -> Duration {
        self.interval.mul_f64(0.9)
    }

    fn jittered_interval(&self) -> Duration {
        self.interval.mul_f64(rand::rng().random_range(0.95..=1.05))
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PollTarget {
    pub pool_id: String,
    pub addr: IpAddr,
    pub port: u16,
    pub nonce: u64,
}

/// Probes one gateway until cancelled. Up is reported straight away, a
/// failure only after `fail_count` probes in a row, and nothing is sent
/// unless the reported value changes.
pub(crate) async fn run(
    target: PollTarget,
    settings: ProbeSettings,
    tx: mpsc::Sender<EgwHealthReport>,
    cancel: CancellationToken,
) {
    let url = format!(
        "http://{}/readiness",
        SocketAddr::new(target.addr, target.port)
    );
    info!(pool = %target.pool_id, %url, nonce = target.nonce, "starting gateway health poller");

    let mut reported = GatewayHealth::Unknown;
    let mut failures = 0u32;
    loop {
        let health = tokio::select! {
            _ = cancel.cancelled() => break,
            health = probe(&settings.client, &url, settings.timeout()) => health,
        };

        let visible = match health {
            GatewayHealth::Up => {
                failures = 0;
                GatewayHealth::Up
            }
            _ => {
                failures += 1;
                if failures >= settings.fail_count {
                    GatewayHealth::ProbeFailed
                } else {
                    reported
                }
            }
        };

        if visible != reported {
            reported = visible;
            let report = EgwHealthReport {
                pool_id: target.pool_id.clone(),
                addr: target.addr,
                nonce: target.nonce,
                health: visible,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = tx.send(report) => {
                    if sent.is_err() {
                        debug!(%url, "health report channel closed");
                        break;
                    }
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(settings.jittered_interval()) => {}
        }
    }
    debug!(pool = %target.pool_id, %url, nonce = target.nonce, "gateway health poller stopped");
}

async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> GatewayHealth {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => GatewayHealth::Up,
        Ok(resp) => {
            debug!(%url, status = %resp.status(), "gateway readiness probe failed");
            GatewayHealth::ProbeFailed
        }
        Err(e) => {
            debug!(%url, "gateway readiness probe failed: {e}");
            GatewayHealth::ProbeFailed
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_check_timings() -> crate::Result<()> {
        let settings = ProbeSettings::new(Duration::from_secs(10), 0)?;
        assert_eq!(settings.fail_count, 1);
        assert_eq!(settings.timeout(), Duration::from_secs(9));
        for _ in 0..50 {
            let interval = settings.jittered_interval();
            assert!(interval >= Duration::from_millis(9_499));
            assert!(interval <= Duration::from_millis(10_501));
        }
        Ok(())
    }
}
