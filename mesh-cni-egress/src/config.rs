use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::time::Duration;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct EgressArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Kernel routing tables handed out to egress workloads, e.g. `1-250`
    #[arg(
        long,
        env = "EGRESS_ROUTE_TABLE_RANGE",
        default_value = "1-250",
        value_parser = parse_table_range
    )]
    pub egress_route_table_range: RangeInclusive<u32>,

    /// Priority of the egress policy routing rules
    #[arg(long, env = "EGRESS_RULE_PRIORITY", default_value_t = 100)]
    pub egress_rule_priority: u32,

    /// Firewall mark carried by egress traffic
    #[arg(long, env = "EGRESS_FWMARK", default_value = "0x200", value_parser = parse_mark)]
    pub egress_fwmark: u32,

    /// VXLAN device used to reach egress gateways
    #[arg(long, env = "EGRESS_VXLAN_DEVICE", default_value = "egress.vxlan")]
    pub egress_vxlan_device: String,

    /// Interval between gateway readiness probes
    #[arg(
        long,
        env = "EGRESS_GATEWAY_POLL_INTERVAL",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub egress_gateway_poll_interval: Duration,

    /// Consecutive failed probes before a gateway is considered down
    #[arg(long, env = "EGRESS_GATEWAY_POLL_FAILURE_COUNT", default_value_t = 3)]
    pub egress_gateway_poll_failure_count: u32,

    /// Listener for egress readiness and metrics
    #[arg(long, env = "EGRESS_READINESS_ADDRESS", default_value = "0.0.0.0:9099")]
    pub egress_readiness_address: SocketAddr,

    /// Fixed seed for next hop shuffling
    #[arg(long, env = "EGRESS_HOP_SEED")]
    pub egress_hop_seed: Option<u64>,
}

/// Settings the manager needs, detached from the CLI.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub hostname: String,
    pub table_indices: RangeInclusive<u32>,
    pub rule_priority: u32,
    pub mark: u32,
    pub vxlan_device: String,
    pub poll_interval: Duration,
    pub poll_fail_count: u32,
    pub hop_seed: Option<u64>,
}

impl From<&EgressArgs> for ManagerConfig {
    fn from(args: &EgressArgs) -> Self {
        Self {
            hostname: args.node_name.clone(),
            table_indices: args.egress_route_table_range.clone(),
            rule_priority: args.egress_rule_priority,
            mark: args.egress_fwmark,
            vxlan_device: args.egress_vxlan_device.clone(),
            poll_interval: args.egress_gateway_poll_interval,
            poll_fail_count: args.egress_gateway_poll_failure_count,
            hop_seed: args.egress_hop_seed,
        }
    }
}

fn parse_table_range(s: &str) -> Result<RangeInclusive<u32>, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected <start>-<end>, got {s}"))?;
    let start: u32 = start.trim().parse().map_err(|e| format!("{e}"))?;
    let end: u32 = end.trim().parse().map_err(|e| format!("{e}"))?;
    if start == 0 || start > end {
        return Err(format!("invalid route table range {s}"));
    }
    Ok(start..=end)
}

fn parse_mark(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    match parsed {
        Ok(0) => Err("egress mark must be non-zero".into()),
        Ok(mark) => Ok(mark),
        Err(e) => Err(format!("invalid mark {s}: {e}")),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let value: u64 = value.parse().map_err(|e| format!("invalid duration {s}: {e}"))?;
    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        _ => return Err(format!("invalid duration unit in {s}")),
    };
    if duration.is_zero() {
        return Err("duration must be non-zero".into());
    }
    Ok(duration)
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        egress: EgressArgs,
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["agent", "--node-name", "node0"]);
        let config = ManagerConfig::from(&cli.egress);
        assert_eq!(config.hostname, "node0");
        assert_eq!(config.table_indices, 1..=250);
        assert_eq!(config.mark, 0x200);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.poll_fail_count, 3);
        assert_eq!(config.hop_seed, None);
    }

    #[test]
    fn test_overrides() {
        let cli = Cli::parse_from([
            "agent",
            "--node-name",
            "node0",
            "--egress-route-table-range",
            "10-20",
            "--egress-fwmark",
            "1024",
            "--egress-gateway-poll-interval",
            "500ms",
            "--egress-hop-seed",
            "7",
        ]);
        let config = ManagerConfig::from(&cli.egress);
        assert_eq!(config.table_indices, 10..=20);
        assert_eq!(config.mark, 1024);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.hop_seed, Some(7));
    }

    #[test]
    fn test_parsers_reject_garbage() {
        assert!(parse_table_range("20-10").is_err());
        assert!(parse_table_range("0-10").is_err());
        assert!(parse_table_range("10").is_err());
        assert!(parse_mark("0").is_err());
        assert!(parse_mark("0xzz").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5h").is_err());
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration("15"), Ok(Duration::from_secs(15)));
    }
}
