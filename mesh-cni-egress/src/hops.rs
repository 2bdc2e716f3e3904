use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::seq::SliceRandom;

use crate::gateway::GatewaysByIp;
use crate::table::EgressTable;

/// Number of hops a route should get. A `max` of zero means all of them.
pub fn workload_num_hops(max: usize, active: usize) -> usize {
    if max == 0 || max > active {
        active
    } else {
        max
    }
}

/// Active gateways a route may pick from. With `prefer_local` the local
/// active gateways win as long as there is at least one.
pub fn candidate_gateways(
    pool: &GatewaysByIp,
    prefer_local: bool,
    hostname: &str,
    now: DateTime<Utc>,
) -> GatewaysByIp {
    let active = pool.active(now);
    if prefer_local {
        let local = active.local(hostname);
        if !local.is_empty() {
            return local;
        }
    }
    active
}

/// Candidates grouped by how many tables already route through them. Each
/// tier is in address order.
pub fn usage_map<'a>(
    candidates: &[IpAddr],
    tables: impl IntoIterator<Item = &'a EgressTable>,
) -> BTreeMap<usize, Vec<IpAddr>> {
    let mut counts: BTreeMap<IpAddr, usize> = candidates.iter().map(|addr| (*addr, 0)).collect();
    for table in tables {
        for hop in table.next_hops() {
            if let Some(count) = counts.get_mut(&hop) {
                *count += 1;
            }
        }
    }

    let mut usage: BTreeMap<usize, Vec<IpAddr>> = BTreeMap::new();
    for (addr, count) in counts {
        usage.entry(count).or_default().push(addr);
    }
    usage
}

/// Picks the `num_hops` least used candidates. Ties inside a usage tier are
/// broken by a shuffle.
pub fn select_next_hops<'a, R: Rng + ?Sized>(
    candidates: &[IpAddr],
    tables: impl IntoIterator<Item = &'a EgressTable>,
    num_hops: usize,
    rng: &mut R,
) -> BTreeSet<IpAddr> {
    let mut selected = BTreeSet::new();
    for (_, mut tier) in usage_map(candidates, tables) {
        tier.shuffle(rng);
        for addr in tier {
            if selected.len() == num_hops {
                return selected;
            }
            selected.insert(addr);
        }
    }
    selected
}

#[cfg(test)]
mod test {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::table::EgressRoute;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn table(index: u32, hops: &[&str]) -> EgressTable {
        let mut table = EgressTable::new(index);
        table.routes.insert(
            "0.0.0.0/0".parse().unwrap(),
            EgressRoute::NextHops(hops.iter().map(|h| ip(h)).collect()),
        );
        table
    }

    #[test]
    fn test_workload_num_hops() {
        assert_eq!(workload_num_hops(0, 3), 3);
        assert_eq!(workload_num_hops(1, 3), 1);
        assert_eq!(workload_num_hops(3, 3), 3);
        assert_eq!(workload_num_hops(5, 3), 3);
        assert_eq!(workload_num_hops(2, 0), 0);
    }

    #[test]
    fn test_usage_map() {
        let candidates = [ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")];
        let tables = [
            table(1, &["10.0.0.1", "10.0.0.2"]),
            table(2, &["10.0.0.1"]),
            table(3, &["10.0.0.9"]),
        ];
        let usage = usage_map(&candidates, &tables);
        assert_eq!(
            usage,
            BTreeMap::from([
                (0, vec![ip("10.0.0.3")]),
                (1, vec![ip("10.0.0.2")]),
                (2, vec![ip("10.0.0.1")]),
            ])
        );
    }

    #[test]
    fn test_select_prefers_least_used() {
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = [ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")];
        let tables = [table(1, &["10.0.0.1", "10.0.0.2"]), table(2, &["10.0.0.1"])];

        let hops = select_next_hops(&candidates, &tables, 2, &mut rng);
        assert_eq!(hops, BTreeSet::from([ip("10.0.0.2"), ip("10.0.0.3")]));

        let hops = select_next_hops(&candidates, &tables, 0, &mut rng);
        assert!(hops.is_empty());

        let hops = select_next_hops(&candidates, &tables, 10, &mut rng);
        assert_eq!(hops.len(), 3);
    }

    #[test]
    fn test_select_spreads_evenly() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = [ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")];
        let mut tables: Vec<EgressTable> = Vec::new();
        for index in 0..6 {
            let hops = select_next_hops(&candidates, &tables, 1, &mut rng);
            let mut t = EgressTable::new(index);
            t.routes
                .insert("0.0.0.0/0".parse().unwrap(), EgressRoute::NextHops(hops));
            tables.push(t);
        }
        let usage = usage_map(&candidates, &tables);
        assert_eq!(usage.len(), 1);
        assert_eq!(usage.get(&2).map(Vec::len), Some(3));
    }

    #[test]
    fn test_select_is_reproducible_per_seed() {
        let candidates: Vec<IpAddr> = (1..=8).map(|i| ip(&format!("10.0.0.{i}"))).collect();
        let pick = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            select_next_hops(&candidates, std::iter::empty(), 3, &mut rng)
        };
        assert_eq!(pick(42), pick(42));
    }

    #[test]
    fn test_candidate_gateways_prefer_local() {
        let now = Utc::now();
        let pool = GatewaysByIp::from_members(&[
            "10.0.0.1/32,,,0,host0",
            "10.0.0.2/32,,,0,host1",
            "10.0.0.3/32,,,0,host1",
        ]);
        assert_eq!(
            candidate_gateways(&pool, true, "host1", now).addrs(),
            vec![ip("10.0.0.2"), ip("10.0.0.3")]
        );
        assert_eq!(candidate_gateways(&pool, false, "host1", now).len(), 3);
        assert_eq!(candidate_gateways(&pool, true, "host9", now).len(), 3);
    }
}
