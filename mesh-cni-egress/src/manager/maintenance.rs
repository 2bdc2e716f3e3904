use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::Result;
use crate::manager::EgressIpManager;
use crate::table::EgressTable;
use crate::tracker::GatewayTracker;
use crate::update::WorkloadEndpoint;

/// The terminating gateway a workload was last told about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MaintenanceWindow {
    pub addr: IpAddr,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl EgressIpManager {
    /// Tells every workload about the terminating gateway it depends on
    /// whose maintenance ends last. Only changes are reported, and a
    /// window is remembered once the callback accepted it.
    pub(super) fn notify_maintenance_windows(&mut self, now: DateTime<Utc>) -> Result<()> {
        let active = &self.active_workloads;
        self.maintenance_windows.retain(|id, _| active.contains_key(id));

        let mut last_err = None;
        for (id, workload) in &self.active_workloads {
            let table = self
                .workload_tables
                .get(id)
                .and_then(|index| self.tables.get(index));
            let latest = latest_terminating_hop(&self.tracker, workload, table, now);
            if self.maintenance_windows.get(id) == latest.as_ref() {
                continue;
            }

            let (namespace, name) = match id.namespace_and_name() {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(workload = %id, "cannot report maintenance window: {e}");
                    continue;
                }
            };
            let result = match &latest {
                Some(window) => self.dataplane.status.maintenance_window(
                    namespace,
                    name,
                    Some(window.addr),
                    window.started,
                    window.finished,
                ),
                None => self
                    .dataplane
                    .status
                    .maintenance_window(namespace, name, None, None, None),
            };
            match result {
                Ok(()) => {
                    info!(workload = %id, gateway = ?latest.as_ref().map(|w| w.addr), "reported gateway maintenance window");
                    match latest {
                        Some(window) => {
                            self.maintenance_windows.insert(id.clone(), window);
                        }
                        None => {
                            self.maintenance_windows.remove(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(workload = %id, "failed to report gateway maintenance window: {e}");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn latest_terminating_hop(
    tracker: &GatewayTracker,
    workload: &WorkloadEndpoint,
    table: Option<&EgressTable>,
    now: DateTime<Utc>,
) -> Option<MaintenanceWindow> {
    let hops = table?.next_hops();
    workload
        .egress_rules
        .iter()
        .filter(|rule| !rule.throws_to_main())
        .filter_map(|rule| tracker.gateways_by_id(&rule.ip_set_id))
        .filter_map(|pool| pool.filtered_by_hops(&hops).latest_terminating(now).cloned())
        .reduce(|latest, gw| {
            if gw.maintenance_finished > latest.maintenance_finished
                || (gw.maintenance_finished == latest.maintenance_finished && gw.addr < latest.addr)
            {
                gw
            } else {
                latest
            }
        })
        .map(|gw| MaintenanceWindow {
            addr: gw.addr,
            started: gw.maintenance_started,
            finished: gw.maintenance_finished,
        })
}
