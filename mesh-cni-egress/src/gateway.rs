use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use tracing::warn;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum GatewayHealth {
    #[default]
    Unknown,
    Up,
    ProbeFailed,
}

impl Display for GatewayHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayHealth::Unknown => write!(f, "unknown"),
            GatewayHealth::Up => write!(f, "up"),
            GatewayHealth::ProbeFailed => write!(f, "probe-failed"),
        }
    }
}

/// A single egress gateway as seen through its pool's membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gateway {
    pub addr: IpAddr,
    pub health_port: u16,
    pub maintenance_started: Option<DateTime<Utc>>,
    pub maintenance_finished: Option<DateTime<Utc>>,
    pub hostname: String,
    pub health_status: GatewayHealth,
    pub health_failed_at: Option<DateTime<Utc>>,
}

impl Gateway {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            health_port: 0,
            maintenance_started: None,
            maintenance_finished: None,
            hostname: String::new(),
            health_status: GatewayHealth::Unknown,
            health_failed_at: None,
        }
    }

    /// Parses a pool member of the form
    /// `cidr[,maintenanceStart,maintenanceFinish,healthPort,hostname]`.
    ///
    /// Only the address is mandatory. Bad timestamps or ports are logged and
    /// left at their zero value.
    pub fn from_member(member: &str) -> Result<Self> {
        let fields: Vec<&str> = member.split(',').collect();
        if fields.len() != 1 && fields.len() != 5 {
            return Err(Error::InvalidMember(format!(
                "expected 1 or 5 fields, got {}: {member}",
                fields.len()
            )));
        }
        let mut gateway = Gateway::new(parse_addr(fields[0])?);
        if fields.len() == 1 {
            return Ok(gateway);
        }

        gateway.maintenance_started = parse_timestamp(member, fields[1]);
        gateway.maintenance_finished = parse_timestamp(member, fields[2]);
        gateway.health_port = match fields[3].trim() {
            "" => 0,
            port => port.parse().unwrap_or_else(|e| {
                warn!(%member, %port, "invalid gateway health port: {e}");
                0
            }),
        };
        gateway.hostname = fields[4].trim().to_string();
        Ok(gateway)
    }

    /// True while `now` falls inside the maintenance window.
    pub fn is_terminating(&self, now: DateTime<Utc>) -> bool {
        let Some(finished) = self.maintenance_finished else {
            return false;
        };
        let started = self.maintenance_started.unwrap_or(DateTime::<Utc>::MIN_UTC);
        now >= started && now <= finished
    }

    pub fn is_failed(&self) -> bool {
        self.health_port != 0 && self.health_status == GatewayHealth::ProbeFailed
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminating(now) && !self.is_failed()
    }

    fn carry_health_from(&mut self, previous: &Gateway) {
        self.health_status = previous.health_status;
        self.health_failed_at = previous.health_failed_at;
    }
}

fn parse_addr(field: &str) -> Result<IpAddr> {
    let field = field.trim();
    if field.contains('/') {
        Ok(field.parse::<IpNetwork>()?.ip())
    } else {
        Ok(field.parse::<IpAddr>()?)
    }
}

fn parse_timestamp(member: &str, field: &str) -> Option<DateTime<Utc>> {
    let field = field.trim();
    if field.is_empty() {
        return None;
    }
    match DateTime::parse_from_rfc3339(&field.to_uppercase()) {
        // Year one is how upstream encodes an unset time.
        Ok(ts) if ts.timestamp() <= ZERO_TIME_UNIX => None,
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(e) => {
            warn!(%member, timestamp = %field, "invalid maintenance timestamp: {e}");
            None
        }
    }
}

/// 0001-01-01T00:00:00Z
const ZERO_TIME_UNIX: i64 = -62_135_596_800;

/// Gateways of one pool keyed by address. Views return new sets and never
/// mutate the pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GatewaysByIp(BTreeMap<IpAddr, Gateway>);

impl GatewaysByIp {
    pub fn from_members<S: AsRef<str>>(members: &[S]) -> Self {
        let mut gateways = Self::default();
        for member in members {
            match Gateway::from_member(member.as_ref()) {
                Ok(gw) => {
                    gateways.0.insert(gw.addr, gw);
                }
                Err(e) => warn!("skipping gateway member: {e}"),
            }
        }
        gateways
    }

    /// Replaces the membership while keeping the last known health of
    /// addresses that stay in the pool.
    pub(crate) fn replace_members<S: AsRef<str>>(&mut self, members: &[S]) {
        let mut next = Self::from_members(members);
        for (addr, gw) in next.0.iter_mut() {
            if let Some(previous) = self.0.get(addr) {
                gw.carry_health_from(previous);
            }
        }
        *self = next;
    }

    /// Removals go first so that an address present in both lists is
    /// updated rather than dropped.
    pub(crate) fn apply_delta<S: AsRef<str>>(&mut self, added: &[S], removed: &[S]) {
        let mut removed_health = BTreeMap::new();
        for member in removed {
            match Gateway::from_member(member.as_ref()) {
                Ok(gw) => {
                    if let Some(previous) = self.0.remove(&gw.addr) {
                        removed_health.insert(previous.addr, previous);
                    }
                }
                Err(e) => warn!("skipping removed gateway member: {e}"),
            }
        }
        for (addr, mut gw) in Self::from_members(added).0 {
            if let Some(previous) = removed_health.get(&addr) {
                gw.carry_health_from(previous);
            }
            self.0.insert(addr, gw);
        }
    }

    pub(crate) fn get_mut(&mut self, addr: &IpAddr) -> Option<&mut Gateway> {
        self.0.get_mut(addr)
    }

    pub fn get(&self, addr: &IpAddr) -> Option<&Gateway> {
        self.0.get(addr)
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.0.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gateway> {
        self.0.values()
    }

    /// Addresses in ascending order.
    pub fn addrs(&self) -> Vec<IpAddr> {
        self.0.keys().copied().collect()
    }

    fn filter(&self, keep: impl Fn(&Gateway) -> bool) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(_, gw)| keep(gw))
                .map(|(addr, gw)| (*addr, gw.clone()))
                .collect(),
        )
    }

    pub fn active(&self, now: DateTime<Utc>) -> Self {
        self.filter(|gw| gw.is_active(now))
    }

    pub fn terminating(&self, now: DateTime<Utc>) -> Self {
        self.filter(|gw| gw.is_terminating(now))
    }

    pub fn failed(&self) -> Self {
        self.filter(Gateway::is_failed)
    }

    pub fn local(&self, hostname: &str) -> Self {
        self.filter(|gw| gw.hostname == hostname)
    }

    pub fn filtered_by_hops(&self, hops: &BTreeSet<IpAddr>) -> Self {
        self.filter(|gw| hops.contains(&gw.addr))
    }

    /// The gateway whose maintenance window ends last. Ties keep the lowest
    /// address.
    pub fn latest_terminating(&self, now: DateTime<Utc>) -> Option<&Gateway> {
        self.0
            .values()
            .filter(|gw| gw.is_terminating(now))
            .fold(None, |latest: Option<&Gateway>, gw| match latest {
                Some(l) if l.maintenance_finished >= gw.maintenance_finished => Some(l),
                _ => Some(gw),
            })
    }
}
