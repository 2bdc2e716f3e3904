use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::dataplane::{NextHop, RouteTarget, Rule, VxlanNextHop};
use crate::{Error, Result};

/// Resolved route for one destination of a workload's table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressRoute {
    ThrowToMain,
    /// An empty set is programmed as unreachable.
    NextHops(BTreeSet<IpAddr>),
}

impl EgressRoute {
    pub fn next_hops(&self) -> Option<&BTreeSet<IpAddr>> {
        match self {
            EgressRoute::ThrowToMain => None,
            EgressRoute::NextHops(hops) => Some(hops),
        }
    }

    /// Reads back a route we programmed. Anything else is not ours.
    pub fn from_target(target: &RouteTarget) -> Option<Self> {
        match target {
            RouteTarget::Throw { .. } => Some(EgressRoute::ThrowToMain),
            RouteTarget::Unreachable { .. } => Some(EgressRoute::NextHops(BTreeSet::new())),
            RouteTarget::Vxlan {
                next_hop: VxlanNextHop::Single(gw),
                ..
            } => Some(EgressRoute::NextHops(BTreeSet::from([*gw]))),
            RouteTarget::Vxlan {
                next_hop: VxlanNextHop::Multipath(hops),
                ..
            } => Some(EgressRoute::NextHops(
                hops.iter().map(|hop| hop.gateway).collect(),
            )),
            RouteTarget::LinkLocalUnicast { .. } | RouteTarget::GlobalUnicast { .. } => None,
        }
    }

    /// Builds the kernel target. Returns whether it belongs on the VXLAN
    /// device rather than on no interface.
    pub fn to_target(&self, cidr: IpNetwork, vxlan_link_index: u32) -> (RouteTarget, bool) {
        match self {
            EgressRoute::ThrowToMain => (RouteTarget::Throw { cidr }, false),
            EgressRoute::NextHops(hops) => match hops.len() {
                0 => (RouteTarget::Unreachable { cidr }, false),
                1 => {
                    let gw = hops.iter().next().copied();
                    match gw {
                        Some(gw) => (
                            RouteTarget::Vxlan {
                                cidr,
                                next_hop: VxlanNextHop::Single(gw),
                            },
                            true,
                        ),
                        None => (RouteTarget::Unreachable { cidr }, false),
                    }
                }
                _ => {
                    let multipath = hops
                        .iter()
                        .map(|gateway| NextHop {
                            gateway: *gateway,
                            link_index: vxlan_link_index,
                        })
                        .collect();
                    (
                        RouteTarget::Vxlan {
                            cidr,
                            next_hop: VxlanNextHop::Multipath(multipath),
                        },
                        false,
                    )
                }
            },
        }
    }
}

/// Routes held in one kernel routing table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EgressTable {
    pub index: u32,
    pub routes: BTreeMap<IpNetwork, EgressRoute>,
    pub used: bool,
}

impl EgressTable {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Every gateway referenced by any route of this table.
    pub fn next_hops(&self) -> BTreeSet<IpAddr> {
        self.routes
            .values()
            .filter_map(EgressRoute::next_hops)
            .flatten()
            .copied()
            .collect()
    }

    /// Kernel targets split into (no interface, VXLAN device).
    pub fn targets(&self, vxlan_link_index: u32) -> (Vec<RouteTarget>, Vec<RouteTarget>) {
        let mut none = Vec::new();
        let mut vxlan = Vec::new();
        for (cidr, route) in &self.routes {
            match route.to_target(*cidr, vxlan_link_index) {
                (target, true) => vxlan.push(target),
                (target, false) => none.push(target),
            }
        }
        (none, vxlan)
    }
}

/// Free routing table indices. The most recently released index is handed
/// out first.
#[derive(Clone, Debug, Default)]
pub struct TableIndexStack {
    stack: Vec<u32>,
}

impl TableIndexStack {
    /// Builds the stack so that the lowest index is popped first.
    pub fn new(indices: impl IntoIterator<Item = u32>) -> Self {
        let mut stack: Vec<u32> = indices.into_iter().collect();
        stack.sort_unstable_by(|a, b| b.cmp(a));
        stack.dedup();
        Self { stack }
    }

    pub fn pop(&mut self) -> Result<u32> {
        self.stack.pop().ok_or(Error::InsufficientRouteTables)
    }

    pub fn push(&mut self, index: u32) {
        self.stack.push(index);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Drops indices already claimed by kernel state, keeping the order of
    /// the rest.
    pub fn remove(&mut self, indices: &BTreeSet<u32>) {
        self.stack.retain(|index| !indices.contains(index));
    }
}

/// Add/remove deltas needed to move the kernel from `current` to `desired`.
pub fn diff_rules<'a>(
    current: &'a BTreeSet<Rule>,
    desired: &'a BTreeSet<Rule>,
) -> (Vec<&'a Rule>, Vec<&'a Rule>) {
    let to_add = desired.difference(current).collect();
    let to_remove = current.difference(desired).collect();
    (to_add, to_remove)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dataplane::AddressFamily;

    #[test]
    fn test_stack_is_lifo() -> crate::Result<()> {
        let mut stack = TableIndexStack::new(1..=3);
        assert_eq!(stack.pop()?, 1);
        assert_eq!(stack.pop()?, 2);
        stack.push(1);
        assert_eq!(stack.pop()?, 1);
        assert_eq!(stack.pop()?, 3);
        assert!(matches!(stack.pop(), Err(Error::InsufficientRouteTables)));
        Ok(())
    }

    #[test]
    fn test_stack_remove_reserved() -> crate::Result<()> {
        let mut stack = TableIndexStack::new([5, 1, 3, 2, 4]);
        stack.remove(&BTreeSet::from([2, 4]));
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.pop()?, 1);
        assert_eq!(stack.pop()?, 3);
        assert_eq!(stack.pop()?, 5);
        assert!(stack.is_empty());
        Ok(())
    }

    fn rule(src: &str, table: u32) -> Rule {
        Rule {
            priority: 100,
            family: AddressFamily::V4,
            src: Some(src.parse().unwrap()),
            mark: 0x200,
            table,
        }
    }

    #[test]
    fn test_table_targets() {
        let hop = |s: &str| -> IpAddr { s.parse().unwrap() };
        let mut table = EgressTable::new(7);
        table.routes.insert(
            "0.0.0.0/0".parse().unwrap(),
            EgressRoute::NextHops(BTreeSet::from([hop("10.0.0.1"), hop("10.0.0.2")])),
        );
        table.routes.insert(
            "192.168.0.0/16".parse().unwrap(),
            EgressRoute::NextHops(BTreeSet::from([hop("10.0.0.3")])),
        );
        table
            .routes
            .insert("172.16.0.0/12".parse().unwrap(), EgressRoute::ThrowToMain);
        table.routes.insert(
            "10.10.0.0/16".parse().unwrap(),
            EgressRoute::NextHops(BTreeSet::new()),
        );

        let (none, vxlan) = table.targets(42);
        assert_eq!(none.len(), 3);
        assert_eq!(
            vxlan,
            vec![RouteTarget::Vxlan {
                cidr: "192.168.0.0/16".parse().unwrap(),
                next_hop: VxlanNextHop::Single(hop("10.0.0.3")),
            }]
        );
        assert!(none.contains(&RouteTarget::Vxlan {
            cidr: "0.0.0.0/0".parse().unwrap(),
            next_hop: VxlanNextHop::Multipath(vec![
                NextHop {
                    gateway: hop("10.0.0.1"),
                    link_index: 42
                },
                NextHop {
                    gateway: hop("10.0.0.2"),
                    link_index: 42
                },
            ]),
        }));
        for target in none.iter().chain(vxlan.iter()) {
            assert_eq!(
                EgressRoute::from_target(target).as_ref(),
                table.routes.get(&target.cidr())
            );
        }
        assert_eq!(
            table.next_hops(),
            BTreeSet::from([hop("10.0.0.1"), hop("10.0.0.2"), hop("10.0.0.3")])
        );
    }

    #[test]
    fn test_diff_rules() {
        let current = BTreeSet::from([rule("10.0.0.1/32", 1), rule("10.0.0.2/32", 1)]);
        let desired = BTreeSet::from([rule("10.0.0.2/32", 1), rule("10.0.0.3/32", 1)]);
        let (add, remove) = diff_rules(&current, &desired);
        assert_eq!(add, vec![&rule("10.0.0.3/32", 1)]);
        assert_eq!(remove, vec![&rule("10.0.0.1/32", 1)]);

        let (add, remove) = diff_rules(&desired, &desired);
        assert!(add.is_empty() && remove.is_empty());
    }
}
