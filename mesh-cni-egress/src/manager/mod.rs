//! Steers workload egress traffic through gateway pools.
//!
//! Updates are buffered by [`EgressIpManager::on_update`] and applied in
//! batches by [`EgressIpManager::complete_deferred_work`], which programs
//! policy routing rules, one routing table per workload and the VXLAN FDB.

mod maintenance;

use std::collections::{BTreeMap, BTreeSet};
use std::iter;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::dataplane::{
    AddressFamily, IpSetKind, IpSetMetadata, IpSetsDataplane, MacAddr, RouteInterface,
    RouteRules, RouteRulesFactory, RouteTable, RouteTableFactory, Rule, StatusCallback, Vtep,
    VtepSink,
};
use crate::gateway::{Gateway, GatewaysByIp};
use crate::hops::{candidate_gateways, select_next_hops, workload_num_hops};
use crate::kernel::{DesiredHops, DesiredWorkload, InitialKernelState};
use crate::manager::maintenance::MaintenanceWindow;
use crate::metrics::EgressMetrics;
use crate::node::NodeState;
use crate::readiness::{HealthAggregator, HealthReport};
use crate::table::{EgressRoute, EgressTable, TableIndexStack, diff_rules};
use crate::tracker::{EgwHealthReport, GatewayTracker};
use crate::update::{EgressGatewayRule, EgressUpdate, WorkloadEndpoint, WorkloadEndpointId};
use crate::{Error, Result};

pub const HEALTH_REPORTER_NAME: &str = "egress-networking-in-sync";
pub const HEALTH_PORTS_SET_ID: &str = "egress-gw-health-ports";

/// Kernel and control plane collaborators.
pub struct Dataplane {
    pub route_tables: Box<dyn RouteTableFactory>,
    pub route_rules: Box<dyn RouteRulesFactory>,
    pub ip_sets: Box<dyn IpSetsDataplane>,
    pub vteps: Box<dyn VtepSink>,
    pub status: Box<dyn StatusCallback>,
    pub health: Arc<dyn HealthAggregator>,
}

pub struct EgressIpManager {
    config: ManagerConfig,
    dataplane: Dataplane,
    node: Arc<NodeState>,
    tracker: GatewayTracker,

    route_rules: Option<Box<dyn RouteRules>>,
    table_index_set: BTreeSet<u32>,
    free_tables: TableIndexStack,
    route_tables: BTreeMap<u32, Box<dyn RouteTable>>,
    tables: BTreeMap<u32, EgressTable>,

    active_workloads: BTreeMap<WorkloadEndpointId, WorkloadEndpoint>,
    workload_tables: BTreeMap<WorkloadEndpointId, u32>,
    workload_rules: BTreeMap<WorkloadEndpointId, BTreeSet<Rule>>,
    pending_workloads: BTreeMap<WorkloadEndpointId, Option<WorkloadEndpoint>>,
    dirty_pools: BTreeSet<String>,
    maintenance_windows: BTreeMap<WorkloadEndpointId, MaintenanceWindow>,
    maintenance_retry: bool,

    initial_state: Option<InitialKernelState>,
    kernel_state_read: bool,
    health_ports_published: bool,
    last_update_failed: bool,

    rng: StdRng,
    metrics: EgressMetrics,
}

impl EgressIpManager {
    pub fn new(
        config: ManagerConfig,
        dataplane: Dataplane,
        node: Arc<NodeState>,
        report_tx: mpsc::Sender<EgwHealthReport>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let tracker = GatewayTracker::new(
            report_tx,
            config.poll_interval,
            config.poll_fail_count,
            cancel,
        )?;
        let table_index_set: BTreeSet<u32> = config.table_indices.clone().collect();
        let rng = match config.hop_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        dataplane
            .health
            .register_reporter(HEALTH_REPORTER_NAME, true, Duration::ZERO);
        let metrics = EgressMetrics::new(&config.hostname);

        Ok(Self {
            free_tables: TableIndexStack::new(table_index_set.iter().copied()),
            table_index_set,
            config,
            dataplane,
            node,
            tracker,
            route_rules: None,
            route_tables: BTreeMap::new(),
            tables: BTreeMap::new(),
            active_workloads: BTreeMap::new(),
            workload_tables: BTreeMap::new(),
            workload_rules: BTreeMap::new(),
            pending_workloads: BTreeMap::new(),
            dirty_pools: BTreeSet::new(),
            maintenance_windows: BTreeMap::new(),
            maintenance_retry: false,
            initial_state: None,
            kernel_state_read: false,
            health_ports_published: false,
            last_update_failed: false,
            rng,
            metrics,
        })
    }

    pub fn on_update(&mut self, update: EgressUpdate) {
        match update {
            EgressUpdate::IpSetUpdate { id, kind, members } => {
                if kind != IpSetKind::EgressGateways {
                    return;
                }
                self.tracker.on_ip_set_update(&id, members.as_slice());
            }
            EgressUpdate::IpSetDeltaUpdate { id, added, removed } => {
                self.tracker
                    .on_ip_set_delta_update(&id, added.as_slice(), removed.as_slice());
            }
            EgressUpdate::IpSetRemove { id } => {
                self.tracker.on_ip_set_remove(&id);
            }
            EgressUpdate::WorkloadEndpointUpdate { id, endpoint } => {
                debug!(workload = %id, "workload endpoint update");
                self.pending_workloads.insert(id, Some(endpoint));
            }
            EgressUpdate::WorkloadEndpointRemove { id } => {
                debug!(workload = %id, "workload endpoint removed");
                self.pending_workloads.insert(id, None);
            }
            EgressUpdate::HostMetadataUpdate {
                hostname,
                ipv4_addr,
            } => {
                if hostname == self.config.hostname {
                    debug!(%ipv4_addr, "local host address update");
                    self.node.set_node_ip(ipv4_addr);
                }
                return;
            }
        }
        self.node.mark_unblocking_update();
    }

    pub fn on_health_report(&mut self, report: EgwHealthReport) {
        let health = report.health;
        if self.tracker.on_egw_health_report(report) {
            self.metrics.count_health_report(health);
            self.node.mark_unblocking_update();
        }
    }

    /// Runs a reconciliation pass, retrying once on failure, and reports
    /// the outcome to the health aggregator.
    ///
    /// After a failed pass nothing is attempted until an update arrives that
    /// could change the outcome.
    pub fn complete_deferred_work(&mut self) -> Result<()> {
        let unblocked = self.node.take_unblocking_update();
        if self.last_update_failed && !unblocked {
            debug!("previous egress pass failed, waiting for an unblocking update");
            self.report_health(false);
            return Ok(());
        }

        let mut result = self.reconcile();
        if let Err(e) = &result
            && !e.is_not_ready()
        {
            warn!("egress pass failed, retrying: {e}");
            result = self.reconcile();
        }

        self.last_update_failed = result.is_err();
        self.report_health(result.is_ok());
        if let Err(e) = &result {
            self.metrics.count_failure(e);
        }
        result
    }

    pub fn node_state(&self) -> Arc<NodeState> {
        self.node.clone()
    }

    /// Route tables for the dataplane syncer. Tables stay here after their
    /// workload is gone so that flushed routes are still applied.
    pub fn route_tables_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn RouteTable>> {
        self.route_tables.values_mut()
    }

    pub fn route_rules_mut(&mut self) -> Option<&mut (dyn RouteRules + 'static)> {
        self.route_rules.as_deref_mut()
    }

    pub fn workload_table(&self, id: &WorkloadEndpointId) -> Option<&EgressTable> {
        self.workload_tables
            .get(id)
            .and_then(|index| self.tables.get(index))
    }

    pub fn gateways(&self, pool_id: &str) -> Option<&GatewaysByIp> {
        self.tracker.gateways_by_id(pool_id)
    }

    pub fn stop(&mut self) {
        self.tracker.stop_all();
    }

    fn report_health(&self, ready: bool) {
        self.dataplane
            .health
            .report(HEALTH_REPORTER_NAME, HealthReport { ready });
    }

    fn reconcile(&mut self) -> Result<()> {
        let _measure = self.metrics.count_and_measure();
        self.dirty_pools
            .extend(self.tracker.update_pollers_get_and_clear_dirty_set_ids());

        if self.kernel_state_read
            && self.dirty_pools.is_empty()
            && self.pending_workloads.is_empty()
            && !self.maintenance_retry
        {
            return Ok(());
        }

        if !self.health_ports_published || !self.dirty_pools.is_empty() {
            self.publish_health_ports();
            self.health_ports_published = true;
        }

        let link_index = self
            .node
            .vxlan_link_index()
            .ok_or(Error::VxlanDeviceNotConfigured)?;

        if self.route_rules.is_none() {
            let indices: Vec<u32> = self.table_index_set.iter().copied().collect();
            let route_rules = self.dataplane.route_rules.new_route_rules(
                &indices,
                self.config.rule_priority,
                self.config.mark,
            )?;
            self.route_rules = Some(route_rules);
        }

        if !self.dirty_pools.is_empty() {
            self.update_vteps();
        }

        if !self.kernel_state_read {
            self.read_initial_kernel_state()?;
        }

        let now = Utc::now();
        let mut last_err = None;
        self.process_gateway_updates(now, link_index);
        if let Err(e) = self.process_workload_updates(now, link_index) {
            last_err = Some(e);
        }
        match self.notify_maintenance_windows(now) {
            Ok(()) => self.maintenance_retry = false,
            Err(e) => {
                self.maintenance_retry = true;
                last_err = Some(e);
            }
        }
        if self.initial_state.is_some() {
            self.cleanup_initial_kernel_state();
        }

        self.metrics
            .route_tables_in_use
            .set(i64::try_from(self.tables.len()).unwrap_or(i64::MAX));
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn publish_health_ports(&mut self) {
        let members: BTreeSet<String> = self
            .tracker
            .pools()
            .flat_map(|(_, pool)| pool.iter())
            .filter(|gw| gw.health_port != 0)
            .map(|gw| format!("{},tcp:{}", gw.addr, gw.health_port))
            .collect();
        debug!(members = members.len(), "publishing gateway health port set");
        self.dataplane.ip_sets.add_or_replace_ip_set(
            IpSetMetadata {
                set_id: HEALTH_PORTS_SET_ID.into(),
                kind: IpSetKind::HashIpPort,
            },
            members.into_iter().collect(),
        );
    }

    fn update_vteps(&mut self) {
        let vteps: BTreeSet<Vtep> = self
            .tracker
            .pools()
            .flat_map(|(_, pool)| pool.iter())
            .filter_map(|gw| {
                MacAddr::for_gateway(gw.addr).map(|tunnel_mac| Vtep {
                    tunnel_mac,
                    tunnel_ip: gw.addr,
                    host_ip: gw.addr,
                })
            })
            .collect();
        debug!(vteps = vteps.len(), "updating egress gateway vteps");
        self.dataplane.vteps.set_vteps(vteps.into_iter().collect());
    }

    fn read_initial_kernel_state(&mut self) -> Result<()> {
        let route_rules = self
            .route_rules
            .as_deref_mut()
            .ok_or(Error::RouteRulesNotInitialized)?;
        let (state, route_tables) = InitialKernelState::read(
            route_rules,
            self.dataplane.route_tables.as_mut(),
            &self.table_index_set,
            &self.config.vxlan_device,
            self.config.rule_priority,
            self.config.mark,
        )?;
        for (index, route_table) in route_tables {
            self.route_tables.entry(index).or_insert(route_table);
        }
        self.free_tables.remove(&state.table_indices());
        self.initial_state = Some(state);
        self.kernel_state_read = true;
        Ok(())
    }

    /// Flushes whatever the previous run left that no workload claimed.
    fn cleanup_initial_kernel_state(&mut self) {
        let Some(state) = self.initial_state.take() else {
            return;
        };
        if let Some(route_rules) = self.route_rules.as_mut() {
            for rule in state.unused_rules() {
                info!(%rule, "removing stale egress rule");
                route_rules.remove_rule(rule);
            }
        }
        for table in state.unused_tables() {
            info!(table = table.index, "flushing stale egress route table");
            self.flush_table(table);
            self.free_tables.push(table.index);
        }
    }

    /// Re-resolves routes that use a changed pool, but only where the
    /// current hops are no longer good enough.
    fn process_gateway_updates(&mut self, now: DateTime<Utc>, link_index: u32) {
        let dirty = std::mem::take(&mut self.dirty_pools);
        if dirty.is_empty() {
            return;
        }
        let affected: Vec<(WorkloadEndpointId, Vec<EgressGatewayRule>)> = self
            .active_workloads
            .iter()
            .filter(|(_, workload)| dirty.iter().any(|id| workload.uses_pool(id)))
            .map(|(id, workload)| (id.clone(), workload.egress_rules.clone()))
            .collect();

        for (id, rules) in affected {
            let Some(&index) = self.workload_tables.get(&id) else {
                continue;
            };
            let Some(mut table) = self.tables.remove(&index) else {
                continue;
            };

            let mut seen = BTreeSet::new();
            let mut changed = false;
            for rule in &rules {
                let dst = rule.destination();
                if !seen.insert(dst) || rule.throws_to_main() || !dirty.contains(&rule.ip_set_id)
                {
                    continue;
                }
                if !self.route_drifted(rule, table.routes.get(&dst), now) {
                    continue;
                }
                table.routes.remove(&dst);
                let route = self.resolve_route(rule, &table, now);
                info!(workload = %id, table = index, destination = %dst, ?route, "recomputed egress next hops");
                table.routes.insert(dst, route);
                changed = true;
            }

            if changed {
                self.program_table(&table, link_index);
            }
            self.tables.insert(index, table);
        }
    }

    /// A route needs new hops when it has fewer than it should, or when one
    /// of them left the pool or failed its health check. Terminating hops
    /// are kept so their flows can drain.
    fn route_drifted(
        &self,
        rule: &EgressGatewayRule,
        current: Option<&EgressRoute>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(EgressRoute::NextHops(hops)) = current else {
            return true;
        };
        let empty = GatewaysByIp::default();
        let pool = self
            .tracker
            .gateways_by_id(&rule.ip_set_id)
            .unwrap_or(&empty);
        let candidates = candidate_gateways(pool, rule.prefer_local, &self.config.hostname, now);
        let desired = workload_num_hops(rule.max_next_hops, candidates.len());
        hops.len() < desired || hops.iter().any(|hop| pool.get(hop).is_none_or(Gateway::is_failed))
    }

    fn process_workload_updates(&mut self, now: DateTime<Utc>, link_index: u32) -> Result<()> {
        let pending = std::mem::take(&mut self.pending_workloads);

        // Workloads that can keep their table from a previous run go first
        // so fresh allocations never take an index that is about to be
        // adopted.
        let mut remaining = BTreeMap::new();
        let mut last_err = None;
        for (id, update) in pending {
            if self.initial_state.is_some()
                && let Some(endpoint) = &update
                && endpoint.uses_egress()
                && !self.active_workloads.contains_key(&id)
            {
                let desired = self.desired_workload(endpoint, now);
                let reserved = self
                    .initial_state
                    .as_mut()
                    .and_then(|state| state.reserve(&desired));
                if let Some(index) = reserved {
                    info!(workload = %id, table = index, "reusing existing egress route table");
                    if let Err(e) = self.adopt_workload(&id, endpoint, index, link_index) {
                        warn!(workload = %id, "failed to adopt egress route table: {e}");
                        last_err = Some(e);
                    }
                    self.active_workloads.insert(id, endpoint.clone());
                    continue;
                }
            }
            remaining.insert(id, update);
        }

        for (id, update) in remaining {
            if let Err(e) = self.apply_workload_update(&id, update.clone(), now, link_index) {
                warn!(workload = %id, "failed to update egress workload: {e}");
                self.pending_workloads.insert(id, update);
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_workload_update(
        &mut self,
        id: &WorkloadEndpointId,
        update: Option<WorkloadEndpoint>,
        now: DateTime<Utc>,
        link_index: u32,
    ) -> Result<()> {
        let old = self.active_workloads.get(id).cloned();
        let new = update.filter(WorkloadEndpoint::uses_egress);
        match (old, new) {
            (None, None) => Ok(()),
            (Some(_), None) => {
                self.delete_workload(id);
                Ok(())
            }
            (None, Some(new)) => {
                self.create_workload(id, &new, now, link_index)?;
                self.active_workloads.insert(id.clone(), new);
                Ok(())
            }
            (Some(old), Some(new)) if old.egress_rules != new.egress_rules => {
                self.delete_workload(id);
                self.create_workload(id, &new, now, link_index)?;
                self.active_workloads.insert(id.clone(), new);
                Ok(())
            }
            (Some(old), Some(new)) => {
                if old.ipv4_nets != new.ipv4_nets
                    && let Some(&index) = self.workload_tables.get(id)
                {
                    self.sync_rules(id, &new, index)?;
                }
                self.active_workloads.insert(id.clone(), new);
                Ok(())
            }
        }
    }

    fn create_workload(
        &mut self,
        id: &WorkloadEndpointId,
        endpoint: &WorkloadEndpoint,
        now: DateTime<Utc>,
        link_index: u32,
    ) -> Result<()> {
        let index = self.free_tables.pop()?;
        let table = self.build_table(index, endpoint, now);
        info!(workload = %id, table = index, "assigned egress route table");
        self.program_table(&table, link_index);
        self.tables.insert(index, table);
        self.workload_tables.insert(id.clone(), index);
        self.sync_rules(id, endpoint, index)
    }

    fn adopt_workload(
        &mut self,
        id: &WorkloadEndpointId,
        endpoint: &WorkloadEndpoint,
        index: u32,
        link_index: u32,
    ) -> Result<()> {
        let table = self
            .initial_state
            .as_ref()
            .and_then(|state| state.table(index))
            .cloned()
            .ok_or_else(|| Error::Other(format!("table {index} was not reserved")))?;
        self.program_table(&table, link_index);
        self.tables.insert(index, table);
        self.workload_tables.insert(id.clone(), index);
        self.sync_rules(id, endpoint, index)
    }

    fn delete_workload(&mut self, id: &WorkloadEndpointId) {
        self.active_workloads.remove(id);
        if let Some(rules) = self.workload_rules.remove(id)
            && let Some(route_rules) = self.route_rules.as_mut()
        {
            for rule in &rules {
                route_rules.remove_rule(rule);
            }
        }
        if let Some(index) = self.workload_tables.remove(id) {
            if let Some(table) = self.tables.remove(&index) {
                self.flush_table(&table);
            }
            self.free_tables.push(index);
            info!(workload = %id, table = index, "released egress route table");
        }
    }

    fn build_table(
        &mut self,
        index: u32,
        endpoint: &WorkloadEndpoint,
        now: DateTime<Utc>,
    ) -> EgressTable {
        let mut table = EgressTable::new(index);
        for rule in &endpoint.egress_rules {
            let dst = rule.destination();
            if table.routes.contains_key(&dst) {
                warn!(table = index, destination = %dst, "ignoring duplicate egress destination");
                continue;
            }
            let route = self.resolve_route(rule, &table, now);
            table.routes.insert(dst, route);
        }
        table
    }

    /// Resolves one rule against its pool. `table` is the workload's own
    /// table while it is being built and counts towards gateway usage.
    fn resolve_route(
        &mut self,
        rule: &EgressGatewayRule,
        table: &EgressTable,
        now: DateTime<Utc>,
    ) -> EgressRoute {
        if rule.throws_to_main() {
            return EgressRoute::ThrowToMain;
        }
        let empty = GatewaysByIp::default();
        let pool = self
            .tracker
            .gateways_by_id(&rule.ip_set_id)
            .unwrap_or(&empty);
        let candidates =
            candidate_gateways(pool, rule.prefer_local, &self.config.hostname, now).addrs();
        let num_hops = workload_num_hops(rule.max_next_hops, candidates.len());
        let tables = self.tables.values().chain(iter::once(table));
        EgressRoute::NextHops(select_next_hops(
            &candidates,
            tables,
            num_hops,
            &mut self.rng,
        ))
    }

    fn desired_workload(&self, endpoint: &WorkloadEndpoint, now: DateTime<Utc>) -> DesiredWorkload {
        let mut routes = BTreeMap::new();
        for rule in &endpoint.egress_rules {
            let dst = rule.destination();
            if routes.contains_key(&dst) {
                continue;
            }
            let hops = if rule.throws_to_main() {
                DesiredHops::Throw
            } else {
                let empty = GatewaysByIp::default();
                let pool = self
                    .tracker
                    .gateways_by_id(&rule.ip_set_id)
                    .unwrap_or(&empty);
                let candidates =
                    candidate_gateways(pool, rule.prefer_local, &self.config.hostname, now);
                DesiredHops::Hops {
                    num_hops: workload_num_hops(rule.max_next_hops, candidates.len()),
                    candidates: candidates.addrs().into_iter().collect(),
                }
            };
            routes.insert(dst, hops);
        }
        DesiredWorkload {
            srcs: workload_srcs(endpoint).collect(),
            priority: self.config.rule_priority,
            mark: self.config.mark,
            routes,
        }
    }

    fn sync_rules(
        &mut self,
        id: &WorkloadEndpointId,
        endpoint: &WorkloadEndpoint,
        index: u32,
    ) -> Result<()> {
        let desired: BTreeSet<Rule> = workload_srcs(endpoint)
            .map(|src| Rule {
                priority: self.config.rule_priority,
                family: AddressFamily::V4,
                src: Some(src),
                mark: self.config.mark,
                table: index,
            })
            .collect();
        let route_rules = self
            .route_rules
            .as_mut()
            .ok_or(Error::RouteRulesNotInitialized)?;
        let current = self.workload_rules.remove(id).unwrap_or_default();
        let (to_add, to_remove) = diff_rules(&current, &desired);
        for rule in to_remove {
            route_rules.remove_rule(rule);
        }
        for rule in to_add {
            route_rules.set_rule(*rule);
        }
        self.workload_rules.insert(id.clone(), desired);
        Ok(())
    }

    fn vxlan_iface(&self) -> RouteInterface {
        RouteInterface::Named(self.config.vxlan_device.clone())
    }

    fn route_table(&mut self, index: u32) -> &mut Box<dyn RouteTable> {
        let factory = &mut self.dataplane.route_tables;
        self.route_tables
            .entry(index)
            .or_insert_with(|| factory.new_route_table(index))
    }

    fn program_table(&mut self, table: &EgressTable, link_index: u32) {
        let vxlan = self.vxlan_iface();
        let (none, on_vxlan) = table.targets(link_index);
        let route_table = self.route_table(table.index);
        route_table.set_routes(&RouteInterface::None, none);
        route_table.set_routes(&vxlan, on_vxlan);
    }

    fn flush_table(&mut self, table: &EgressTable) {
        let vxlan = self.vxlan_iface();
        let route_table = self.route_table(table.index);
        for cidr in table.routes.keys() {
            route_table.route_remove(&RouteInterface::None, *cidr);
            route_table.route_remove(&vxlan, *cidr);
        }
    }
}

impl Drop for EgressIpManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn workload_srcs(endpoint: &WorkloadEndpoint) -> impl Iterator<Item = IpNetwork> + '_ {
    endpoint
        .ipv4_nets
        .iter()
        .filter(|net| net.is_ipv4())
        .copied()
}
