//! In-memory stand-ins for the kernel collaborators. Every fake is a cheap
//! handle onto shared state so tests can inspect what the manager did.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;

use crate::dataplane::{
    IpSetMetadata, IpSetsDataplane, RouteInterface, RouteRules, RouteRulesFactory, RouteTable,
    RouteTableFactory, RouteTarget, Rule, StatusCallback, Vtep, VtepSink,
};
use crate::{Error, Result};

#[derive(Default)]
struct RulesState {
    rules: BTreeSet<Rule>,
    fail_init: bool,
    ops: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeRouteRules {
    state: Arc<Mutex<RulesState>>,
}

impl FakeRouteRules {
    pub fn insert(&mut self, rule: Rule) {
        self.state.lock().unwrap().rules.insert(rule);
    }

    pub fn fail_init(&mut self) {
        self.state.lock().unwrap().fail_init = true;
    }

    pub fn rules(&self) -> BTreeSet<Rule> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn has_rule(&self, src: &str, table: u32) -> bool {
        let src: IpNetwork = src.parse().unwrap();
        self.rules()
            .iter()
            .any(|rule| rule.src == Some(src) && rule.table == table)
    }

    pub fn ops(&self) -> usize {
        self.state.lock().unwrap().ops
    }
}

impl RouteRules for FakeRouteRules {
    fn init_from_kernel(&mut self) -> Result<()> {
        if self.state.lock().unwrap().fail_init {
            return Err(Error::KernelRead("rule dump failed".into()));
        }
        Ok(())
    }

    fn get_all_active_rules(&self) -> Vec<Rule> {
        self.rules().into_iter().collect()
    }

    fn set_rule(&mut self, rule: Rule) {
        let mut state = self.state.lock().unwrap();
        if state.rules.insert(rule) {
            state.ops += 1;
        }
    }

    fn remove_rule(&mut self, rule: &Rule) {
        let mut state = self.state.lock().unwrap();
        if state.rules.remove(rule) {
            state.ops += 1;
        }
    }
}

impl RouteRulesFactory for FakeRouteRules {
    fn new_route_rules(
        &mut self,
        _table_indices: &[u32],
        _priority: u32,
        _mark: u32,
    ) -> Result<Box<dyn RouteRules>> {
        Ok(Box::new(self.clone()))
    }
}

type Routes = ahash::HashMap<RouteInterface, BTreeMap<IpNetwork, RouteTarget>>;

#[derive(Default)]
struct TablesState {
    tables: ahash::HashMap<u32, Routes>,
    unreadable: BTreeSet<u32>,
    created: Vec<u32>,
    ops: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeRouteTableFactory {
    state: Arc<Mutex<TablesState>>,
}

impl FakeRouteTableFactory {
    /// Pretends `targets` are already programmed in the kernel.
    pub fn seed(&mut self, index: u32, iface: &RouteInterface, targets: Vec<RouteTarget>) {
        let mut state = self.state.lock().unwrap();
        let routes = state.tables.entry(index).or_default();
        let by_cidr = routes.entry(iface.clone()).or_default();
        for target in targets {
            by_cidr.insert(target.cidr(), target);
        }
    }

    pub fn fail_reads(&mut self, index: u32) {
        self.state.lock().unwrap().unreadable.insert(index);
    }

    pub fn routes(&self, index: u32, iface: &RouteInterface) -> Vec<RouteTarget> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&index)
            .and_then(|routes| routes.get(iface))
            .map(|by_cidr| by_cidr.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Indices with at least one route on any interface.
    pub fn non_empty_tables(&self) -> BTreeSet<u32> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .iter()
            .filter(|(_, routes)| routes.values().any(|by_cidr| !by_cidr.is_empty()))
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn created(&self) -> Vec<u32> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn ops(&self) -> usize {
        self.state.lock().unwrap().ops
    }
}

impl RouteTableFactory for FakeRouteTableFactory {
    fn new_route_table(&mut self, index: u32) -> Box<dyn RouteTable> {
        self.state.lock().unwrap().created.push(index);
        Box::new(FakeRouteTable {
            index,
            state: self.state.clone(),
        })
    }
}

struct FakeRouteTable {
    index: u32,
    state: Arc<Mutex<TablesState>>,
}

impl RouteTable for FakeRouteTable {
    fn index(&self) -> u32 {
        self.index
    }

    fn set_routes(&mut self, iface: &RouteInterface, targets: Vec<RouteTarget>) {
        let mut state = self.state.lock().unwrap();
        let next: BTreeMap<IpNetwork, RouteTarget> =
            targets.into_iter().map(|t| (t.cidr(), t)).collect();
        let routes = state.tables.entry(self.index).or_default();
        let current = routes.entry(iface.clone()).or_default();
        if *current != next {
            *current = next;
            state.ops += 1;
        }
    }

    fn route_remove(&mut self, iface: &RouteInterface, cidr: IpNetwork) {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .tables
            .get_mut(&self.index)
            .and_then(|routes| routes.get_mut(iface))
            .and_then(|by_cidr| by_cidr.remove(&cidr))
            .is_some();
        if removed {
            state.ops += 1;
        }
    }

    fn read_routes_from_kernel(&self, iface: &RouteInterface) -> Result<Vec<RouteTarget>> {
        let state = self.state.lock().unwrap();
        if state.unreadable.contains(&self.index) {
            return Err(Error::KernelRead(format!("table {} unreadable", self.index)));
        }
        Ok(state
            .tables
            .get(&self.index)
            .and_then(|routes| routes.get(iface))
            .map(|by_cidr| by_cidr.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeIpSets {
    sets: Arc<Mutex<BTreeMap<String, Vec<String>>>>,
}

impl FakeIpSets {
    pub fn members(&self, id: &str) -> Option<Vec<String>> {
        self.sets.lock().unwrap().get(id).cloned()
    }
}

impl IpSetsDataplane for FakeIpSets {
    fn add_or_replace_ip_set(&mut self, metadata: IpSetMetadata, members: Vec<String>) {
        self.sets.lock().unwrap().insert(metadata.set_id, members);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeVteps {
    vteps: Arc<Mutex<Option<Vec<Vtep>>>>,
}

impl FakeVteps {
    pub fn vteps(&self) -> Option<Vec<Vtep>> {
        self.vteps.lock().unwrap().clone()
    }
}

impl VtepSink for FakeVteps {
    fn set_vteps(&mut self, vteps: Vec<Vtep>) {
        *self.vteps.lock().unwrap() = Some(vteps);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Notification {
    pub namespace: String,
    pub name: String,
    pub addr: Option<IpAddr>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeStatusCallback {
    notifications: Arc<Mutex<Vec<Notification>>>,
    fail: Arc<Mutex<bool>>,
}

impl FakeStatusCallback {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl StatusCallback for FakeStatusCallback {
    fn maintenance_window(
        &mut self,
        namespace: &str,
        name: &str,
        addr: Option<IpAddr>,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if *self.fail.lock().unwrap() {
            return Err(Error::StatusCallback("annotation rejected".into()));
        }
        self.notifications.lock().unwrap().push(Notification {
            namespace: namespace.into(),
            name: name.into(),
            addr,
            started,
            finished,
        });
        Ok(())
    }
}
