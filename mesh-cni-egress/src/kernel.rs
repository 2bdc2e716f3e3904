//! Adoption of routing rules and tables left behind by a previous run.
//!
//! The first pass after a restart reads our rules and the tables they point
//! at. Workloads whose desired state is already programmed keep their table
//! untouched. Whatever nobody claims is flushed at the end of that pass.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;
use tracing::{debug, info, warn};

use crate::Error;
use crate::Result;
use crate::dataplane::{
    AddressFamily, RouteInterface, RouteRules, RouteTable, RouteTableFactory, Rule,
};
use crate::table::{EgressRoute, EgressTable};

/// What a route for one destination should look like.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DesiredHops {
    Throw,
    Hops {
        num_hops: usize,
        candidates: BTreeSet<IpAddr>,
    },
}

/// Everything needed to decide whether kernel state already serves a
/// workload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredWorkload {
    pub srcs: BTreeSet<IpNetwork>,
    pub priority: u32,
    pub mark: u32,
    pub routes: BTreeMap<IpNetwork, DesiredHops>,
}

/// True when `rules` and `table` are exactly what `desired` would program.
pub fn workload_matches(desired: &DesiredWorkload, rules: &[&Rule], table: &EgressTable) -> bool {
    let srcs: BTreeSet<IpNetwork> = rules.iter().filter_map(|rule| rule.src).collect();
    if srcs != desired.srcs || rules.len() != desired.srcs.len() {
        return false;
    }
    let rules_match = rules.iter().all(|rule| {
        rule.priority == desired.priority
            && rule.mark == desired.mark
            && rule.family == AddressFamily::V4
            && rule.table == table.index
    });
    rules_match && table_matches(table, &desired.routes)
}

fn table_matches(table: &EgressTable, desired: &BTreeMap<IpNetwork, DesiredHops>) -> bool {
    table.routes.len() == desired.len()
        && desired.iter().all(|(dst, want)| {
            match (table.routes.get(dst), want) {
                (Some(EgressRoute::ThrowToMain), DesiredHops::Throw) => true,
                (
                    Some(EgressRoute::NextHops(hops)),
                    DesiredHops::Hops {
                        num_hops,
                        candidates,
                    },
                ) => hops.len() == *num_hops && hops.is_subset(candidates),
                _ => false,
            }
        })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelRule {
    pub rule: Rule,
    pub used: bool,
}

#[derive(Debug, Default)]
pub struct InitialKernelState {
    rules: Vec<KernelRule>,
    tables: BTreeMap<u32, EgressTable>,
}

impl InitialKernelState {
    /// Reads our rules and the tables they reference. Failing to list rules
    /// is fatal for the pass. Rules that cannot belong to a workload are
    /// deleted straight away, unreadable tables are skipped.
    ///
    /// Every route table object created while reading is handed back so the
    /// caller can keep programming through it.
    pub fn read(
        route_rules: &mut dyn RouteRules,
        factory: &mut dyn RouteTableFactory,
        table_indices: &BTreeSet<u32>,
        vxlan_device: &str,
        priority: u32,
        mark: u32,
    ) -> Result<(Self, BTreeMap<u32, Box<dyn RouteTable>>)> {
        route_rules
            .init_from_kernel()
            .map_err(|e| Error::KernelRead(format!("failed to list egress rules: {e}")))?;

        let mut state = Self::default();
        for rule in route_rules.get_all_active_rules() {
            let ours = rule.src.is_some()
                && rule.family == AddressFamily::V4
                && rule.priority == priority
                && rule.mark == mark
                && table_indices.contains(&rule.table);
            if ours {
                state.rules.push(KernelRule { rule, used: false });
            } else {
                warn!(%rule, "removing malformed egress rule");
                route_rules.remove_rule(&rule);
            }
        }

        let referenced: BTreeSet<u32> = state.rules.iter().map(|r| r.rule.table).collect();
        let mut route_tables = BTreeMap::new();
        let ifaces = [
            RouteInterface::Named(vxlan_device.to_string()),
            RouteInterface::None,
        ];
        for index in referenced {
            let route_table = factory.new_route_table(index);
            let mut table = EgressTable::new(index);
            let mut readable = true;
            for iface in &ifaces {
                match route_table.read_routes_from_kernel(iface) {
                    Ok(targets) => {
                        for target in targets {
                            if let Some(route) = EgressRoute::from_target(&target) {
                                table.routes.insert(target.cidr(), route);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(table = index, ?iface, "failed to read egress routes: {e}");
                        readable = false;
                    }
                }
            }
            if readable && !table.routes.is_empty() {
                debug!(table = index, routes = table.routes.len(), "found existing egress table");
                state.tables.insert(index, table);
            }
            route_tables.insert(index, route_table);
        }
        info!(
            rules = state.rules.len(),
            tables = state.tables.len(),
            "read initial egress kernel state"
        );
        Ok((state, route_tables))
    }

    /// Table indices that must not be handed out until cleanup.
    pub fn table_indices(&self) -> BTreeSet<u32> {
        self.tables.keys().copied().collect()
    }

    /// Claims the rules and table that already serve `desired`, returning
    /// the table index.
    pub fn reserve(&mut self, desired: &DesiredWorkload) -> Option<u32> {
        if desired.srcs.is_empty() {
            return None;
        }
        let candidates: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, kr)| !kr.used && kr.rule.src.is_some_and(|src| desired.srcs.contains(&src)))
            .map(|(i, _)| i)
            .collect();
        let index = self.rules.get(*candidates.first()?)?.rule.table;
        let table = self.tables.get(&index).filter(|table| !table.used)?;
        let rules: Vec<&Rule> = candidates.iter().map(|i| &self.rules[*i].rule).collect();
        if !workload_matches(desired, &rules, table) {
            return None;
        }

        for i in candidates {
            self.rules[i].used = true;
        }
        let table = self.tables.get_mut(&index)?;
        table.used = true;
        Some(index)
    }

    /// The adopted table, if `index` was reserved.
    pub fn table(&self, index: u32) -> Option<&EgressTable> {
        self.tables.get(&index).filter(|table| table.used)
    }

    pub fn unused_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|kr| !kr.used).map(|kr| &kr.rule)
    }

    pub fn unused_tables(&self) -> impl Iterator<Item = &EgressTable> {
        self.tables.values().filter(|table| !table.used)
    }
}
