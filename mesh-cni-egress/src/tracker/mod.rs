//! Gateway pool membership plus one health poller per gateway that exposes a
//! health port.

mod poller;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::Result;
use crate::gateway::{GatewayHealth, GatewaysByIp};
use crate::tracker::poller::{PollTarget, ProbeSettings};

/// Sent by a poller when the health it reports for a gateway changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EgwHealthReport {
    pub pool_id: String,
    pub addr: IpAddr,
    pub nonce: u64,
    pub health: GatewayHealth,
}

struct Poller {
    nonce: u64,
    port: u16,
    cancel: CancellationToken,
    // Last accepted report, outlives the gateway record it was applied to.
    health: GatewayHealth,
    failed_at: Option<DateTime<Utc>>,
}

pub struct GatewayTracker {
    pools: BTreeMap<String, GatewaysByIp>,
    pollers: ahash::HashMap<(String, IpAddr), Poller>,
    dirty: BTreeSet<String>,
    next_nonce: u64,
    settings: ProbeSettings,
    report_tx: mpsc::Sender<EgwHealthReport>,
    cancel: CancellationToken,
}

impl GatewayTracker {
    /// Pollers are spawned onto the current tokio runtime and cancelled
    /// together with `cancel`.
    pub fn new(
        report_tx: mpsc::Sender<EgwHealthReport>,
        poll_interval: Duration,
        poll_fail_count: u32,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            pools: BTreeMap::new(),
            pollers: ahash::HashMap::default(),
            dirty: BTreeSet::new(),
            next_nonce: 0,
            settings: ProbeSettings::new(poll_interval, poll_fail_count)?,
            report_tx,
            cancel,
        })
    }

    pub fn on_ip_set_update<S: AsRef<str>>(&mut self, id: &str, members: &[S]) {
        debug!(pool = %id, members = members.len(), "gateway pool replaced");
        self.pools
            .entry(id.to_string())
            .or_default()
            .replace_members(members);
        self.dirty.insert(id.to_string());
    }

    /// Deltas for pools we have never seen are dropped.
    pub fn on_ip_set_delta_update<S: AsRef<str>>(&mut self, id: &str, added: &[S], removed: &[S]) {
        let Some(pool) = self.pools.get_mut(id) else {
            debug!(pool = %id, "ignoring delta for unknown gateway pool");
            return;
        };
        pool.apply_delta(added, removed);
        self.dirty.insert(id.to_string());
    }

    pub fn on_ip_set_remove(&mut self, id: &str) {
        if self.pools.remove(id).is_some() {
            debug!(pool = %id, "gateway pool removed");
            self.dirty.insert(id.to_string());
        }
    }

    /// Applies a poller's report. Reports from pollers that have since been
    /// stopped or replaced are ignored. A report for a gateway that is
    /// currently missing from its pool is kept by the poller and applied
    /// when the gateway comes back before the poller is stopped.
    pub fn on_egw_health_report(&mut self, report: EgwHealthReport) -> bool {
        let key = (report.pool_id, report.addr);
        let poller = match self.pollers.get_mut(&key) {
            Some(poller) if poller.nonce == report.nonce => poller,
            _ => {
                debug!(pool = %key.0, addr = %key.1, nonce = report.nonce, "ignoring stale health report");
                return false;
            }
        };
        poller.health = report.health;
        poller.failed_at = match report.health {
            GatewayHealth::ProbeFailed => Some(Utc::now()),
            _ => None,
        };
        let failed_at = poller.failed_at;

        let (pool_id, addr) = key;
        let Some(gateway) = self
            .pools
            .get_mut(&pool_id)
            .and_then(|pool| pool.get_mut(&addr))
        else {
            debug!(pool = %pool_id, %addr, health = %report.health, "holding health report for absent gateway");
            return false;
        };

        info!(pool = %pool_id, %addr, health = %report.health, "gateway health changed");
        gateway.health_status = report.health;
        gateway.health_failed_at = failed_at;
        self.dirty.insert(pool_id);
        true
    }

    /// Brings the pollers of every dirty pool in line with its membership
    /// and hands the dirty pool ids to the caller.
    pub fn update_pollers_get_and_clear_dirty_set_ids(&mut self) -> BTreeSet<String> {
        let dirty = std::mem::take(&mut self.dirty);
        for id in &dirty {
            self.sync_pollers(id);
        }
        dirty
    }

    pub fn gateways_by_id(&self, id: &str) -> Option<&GatewaysByIp> {
        self.pools.get(id)
    }

    pub fn pools(&self) -> impl Iterator<Item = (&String, &GatewaysByIp)> {
        self.pools.iter()
    }

    pub fn num_pollers(&self) -> usize {
        self.pollers.len()
    }

    pub fn stop_all(&mut self) {
        for (_, poller) in self.pollers.drain() {
            poller.cancel.cancel();
        }
    }

    fn sync_pollers(&mut self, id: &str) {
        let wanted: BTreeMap<IpAddr, u16> = self
            .pools
            .get(id)
            .map(|pool| {
                pool.iter()
                    .filter(|gw| gw.health_port != 0)
                    .map(|gw| (gw.addr, gw.health_port))
                    .collect()
            })
            .unwrap_or_default();

        // Stopped pollers are not awaited; the nonce check drops anything
        // they still manage to send.
        self.pollers.retain(|(pool_id, addr), poller| {
            if pool_id != id || wanted.get(addr) == Some(&poller.port) {
                return true;
            }
            debug!(pool = %pool_id, %addr, nonce = poller.nonce, "stopping gateway health poller");
            poller.cancel.cancel();
            false
        });

        // A gateway removed and re-added since the last sync comes back as a
        // fresh record; give it the health its surviving poller last saw.
        if let Some(pool) = self.pools.get_mut(id) {
            for ((pool_id, addr), poller) in &self.pollers {
                if pool_id != id {
                    continue;
                }
                if let Some(gateway) = pool.get_mut(addr) {
                    gateway.health_status = poller.health;
                    gateway.health_failed_at = poller.failed_at;
                }
            }
        }

        for (addr, port) in wanted {
            let key = (id.to_string(), addr);
            if self.pollers.contains_key(&key) {
                continue;
            }
            let nonce = self.next_nonce;
            self.next_nonce += 1;
            let cancel = self.cancel.child_token();
            let target = PollTarget {
                pool_id: id.to_string(),
                addr,
                port,
                nonce,
            };
            tokio::spawn(poller::run(
                target,
                self.settings.clone(),
                self.report_tx.clone(),
                cancel.clone(),
            ));
            self.pollers.insert(
                key,
                Poller {
                    nonce,
                    port,
                    cancel,
                    health: GatewayHealth::Unknown,
                    failed_at: None,
                },
            );
        }
    }
}

impl Drop for GatewayTracker {
    fn drop(&mut self) {
        self.stop_all();
    }
}
