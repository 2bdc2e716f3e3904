//! Events the manager consumes from the agent's calculation graph.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::{IpNetwork, Ipv4Network};

use crate::dataplane::IpSetKind;
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkloadEndpointId {
    pub orchestrator_id: String,
    /// `namespace/name` of the owning pod.
    pub workload_id: String,
    pub endpoint_id: String,
}

impl WorkloadEndpointId {
    pub fn namespace_and_name(&self) -> Result<(&str, &str)> {
        match self.workload_id.split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok((namespace, name))
            }
            _ => Err(Error::InvalidWorkloadId(self.workload_id.clone())),
        }
    }
}

impl Display for WorkloadEndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.orchestrator_id, self.workload_id, self.endpoint_id
        )
    }
}

/// Routes a workload's traffic to `destination` through a gateway pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EgressGatewayRule {
    /// Empty means hand the destination back to the main table.
    pub ip_set_id: String,
    /// `None` means the default route.
    pub destination: Option<IpNetwork>,
    /// Zero means every active gateway.
    pub max_next_hops: usize,
    pub prefer_local: bool,
}

impl EgressGatewayRule {
    pub fn destination(&self) -> IpNetwork {
        self.destination.unwrap_or(DEFAULT_DESTINATION)
    }

    pub fn throws_to_main(&self) -> bool {
        self.ip_set_id.is_empty()
    }
}

const DEFAULT_DESTINATION: IpNetwork =
    match Ipv4Network::new_checked(Ipv4Addr::UNSPECIFIED, 0) {
        Some(net) => IpNetwork::V4(net),
        None => panic!("invalid default destination"),
    };

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadEndpoint {
    pub ipv4_nets: Vec<IpNetwork>,
    pub egress_rules: Vec<EgressGatewayRule>,
}

impl WorkloadEndpoint {
    pub fn uses_egress(&self) -> bool {
        !self.egress_rules.is_empty()
    }

    pub fn uses_pool(&self, id: &str) -> bool {
        self.egress_rules.iter().any(|rule| rule.ip_set_id == id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressUpdate {
    IpSetUpdate {
        id: String,
        kind: IpSetKind,
        members: Vec<String>,
    },
    IpSetDeltaUpdate {
        id: String,
        added: Vec<String>,
        removed: Vec<String>,
    },
    IpSetRemove {
        id: String,
    },
    WorkloadEndpointUpdate {
        id: WorkloadEndpointId,
        endpoint: WorkloadEndpoint,
    },
    WorkloadEndpointRemove {
        id: WorkloadEndpointId,
    },
    HostMetadataUpdate {
        hostname: String,
        ipv4_addr: IpAddr,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    fn id(workload_id: &str) -> WorkloadEndpointId {
        WorkloadEndpointId {
            orchestrator_id: "k8s".into(),
            workload_id: workload_id.into(),
            endpoint_id: "eth0".into(),
        }
    }

    #[test]
    fn test_namespace_and_name() -> crate::Result<()> {
        assert_eq!(id("default/pod-1").namespace_and_name()?, ("default", "pod-1"));
        assert!(id("pod-1").namespace_and_name().is_err());
        assert!(id("/pod-1").namespace_and_name().is_err());
        Ok(())
    }

    #[test]
    fn test_rule_destination_defaults() {
        let rule = EgressGatewayRule::default();
        assert_eq!(rule.destination().to_string(), "0.0.0.0/0");
        assert!(rule.throws_to_main());
    }
}
