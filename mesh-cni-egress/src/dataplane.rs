//! Kernel-facing collaborators. The manager only ever talks to the kernel
//! through these traits so it can run against in-memory fakes.

use std::fmt::Display;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;

use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteInterface {
    None,
    Named(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NextHop {
    pub gateway: IpAddr,
    pub link_index: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VxlanNextHop {
    Single(IpAddr),
    Multipath(Vec<NextHop>),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    LinkLocalUnicast { cidr: IpNetwork },
    GlobalUnicast { cidr: IpNetwork, gateway: Option<IpAddr> },
    Vxlan { cidr: IpNetwork, next_hop: VxlanNextHop },
    Throw { cidr: IpNetwork },
    Unreachable { cidr: IpNetwork },
}

impl RouteTarget {
    pub fn cidr(&self) -> IpNetwork {
        match self {
            RouteTarget::LinkLocalUnicast { cidr }
            | RouteTarget::GlobalUnicast { cidr, .. }
            | RouteTarget::Vxlan { cidr, .. }
            | RouteTarget::Throw { cidr }
            | RouteTarget::Unreachable { cidr } => *cidr,
        }
    }
}

/// A single kernel routing table. Tables are never dropped by the manager
/// once created so that flushed routes still reach the kernel.
pub trait RouteTable: Send {
    fn index(&self) -> u32;
    /// Replaces every route of this table on `iface`.
    fn set_routes(&mut self, iface: &RouteInterface, targets: Vec<RouteTarget>);
    fn route_remove(&mut self, iface: &RouteInterface, cidr: IpNetwork);
    fn read_routes_from_kernel(&self, iface: &RouteInterface) -> Result<Vec<RouteTarget>>;
}

pub trait RouteTableFactory: Send {
    fn new_route_table(&mut self, index: u32) -> Box<dyn RouteTable>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

/// Identity of a kernel policy routing rule. `src` is `None` when the kernel
/// returned a rule we cannot attribute to a workload address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rule {
    pub priority: u32,
    pub family: AddressFamily,
    pub src: Option<IpNetwork>,
    pub mark: u32,
    pub table: u32,
}

impl Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.src {
            Some(src) => write!(
                f,
                "{} from {src} fwmark {:#x} lookup {}",
                self.priority, self.mark, self.table
            ),
            None => write!(
                f,
                "{} fwmark {:#x} lookup {}",
                self.priority, self.mark, self.table
            ),
        }
    }
}

/// Policy routing rules in the manager's priority and mark space.
pub trait RouteRules: Send {
    fn init_from_kernel(&mut self) -> Result<()>;
    fn get_all_active_rules(&self) -> Vec<Rule>;
    fn set_rule(&mut self, rule: Rule);
    fn remove_rule(&mut self, rule: &Rule);
}

pub trait RouteRulesFactory: Send {
    fn new_route_rules(
        &mut self,
        table_indices: &[u32],
        priority: u32,
        mark: u32,
    ) -> Result<Box<dyn RouteRules>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IpSetKind {
    HashIp,
    HashIpPort,
    EgressGateways,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSetMetadata {
    pub set_id: String,
    pub kind: IpSetKind,
}

pub trait IpSetsDataplane: Send {
    fn add_or_replace_ip_set(&mut self, metadata: IpSetMetadata, members: Vec<String>);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Deterministic tunnel MAC for a gateway: `a2:2a` followed by the IPv4
    /// octets.
    pub fn for_gateway(addr: IpAddr) -> Option<Self> {
        match addr {
            IpAddr::V4(v4) => {
                let [a, b, c, d] = v4.octets();
                Some(Self([0xa2, 0x2a, a, b, c, d]))
            }
            IpAddr::V6(_) => None,
        }
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Vtep {
    pub tunnel_mac: MacAddr,
    pub tunnel_ip: IpAddr,
    pub host_ip: IpAddr,
}

/// VXLAN forwarding database. `set_vteps` replaces the full set.
pub trait VtepSink: Send {
    fn set_vteps(&mut self, vteps: Vec<Vtep>);
}

/// Annotates a workload with the terminating gateway it currently depends on.
/// `addr` is `None` once the workload no longer depends on one.
pub trait StatusCallback: Send {
    fn maintenance_window(
        &mut self,
        namespace: &str,
        name: &str,
        addr: Option<IpAddr>,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

impl<F> StatusCallback for F
where
    F: FnMut(&str, &str, Option<IpAddr>, Option<DateTime<Utc>>, Option<DateTime<Utc>>) -> Result<()>
        + Send,
{
    fn maintenance_window(
        &mut self,
        namespace: &str,
        name: &str,
        addr: Option<IpAddr>,
        started: Option<DateTime<Utc>>,
        finished: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self(namespace, name, addr, started, finished)
    }
}
