use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("ran out of egress route tables, increase the egress route table range")]
    InsufficientRouteTables,

    #[error("egress vxlan device not configured yet")]
    VxlanDeviceNotConfigured,

    #[error("egress route rules not initialized")]
    RouteRulesNotInitialized,

    #[error("failed to read kernel state: {0}")]
    KernelRead(String),

    #[error("invalid gateway member: {0}")]
    InvalidMember(String),

    #[error("invalid workload id: {0}")]
    InvalidWorkloadId(String),

    #[error("status callback failed: {0}")]
    StatusCallback(String),

    #[error("invalid ip network: {0}")]
    InvalidIpNetwork(#[from] ipnetwork::IpNetworkError),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("unable to send event due to channel error")]
    ChannelError,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::InsufficientRouteTables => "insufficient_route_tables",
            Error::VxlanDeviceNotConfigured => "vxlan_device_not_configured",
            Error::RouteRulesNotInitialized => "route_rules_not_initialized",
            Error::KernelRead(_) => "kernel_read",
            Error::InvalidMember(_) => "invalid_member",
            Error::InvalidWorkloadId(_) => "invalid_workload_id",
            Error::StatusCallback(_) => "status_callback",
            Error::InvalidIpNetwork(_) => "invalid_ip_network",
            Error::AddrParseError(_) => "addr_parse",
            Error::IoError(_) => "io",
            Error::ChannelError => "channel",
            Error::Other(_) => "other",
        }
        .into()
    }

    /// Errors that only mean the node is still coming up.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Error::VxlanDeviceNotConfigured | Error::RouteRulesNotInitialized
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
