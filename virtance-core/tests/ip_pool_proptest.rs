//! Property-based tests for address candidates and allocation

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};

use ipnet::Ipv4Net;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;
use virtance_core::{
    ip_pool::{ipv4_candidates, IpVersion, PoolType},
    test_helpers::Fixture,
};

// Strategy for generating IPv4 networks small enough to enumerate
fn subnet_strategy() -> impl Strategy<Value = Ipv4Net> {
    (any::<u32>(), 22u8..=32).prop_map(|(addr, prefix)| {
        Ipv4Net::new(Ipv4Addr::from(addr), prefix)
            .unwrap()
            .trunc()
    })
}

proptest! {
    #[test]
    fn candidates_stay_inside_the_usable_range(net in subnet_strategy(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let candidates = ipv4_candidates(&net, &mut rng);

        let first = u32::from(net.network());
        let last = u32::from(net.broadcast());
        let total = u64::from(last - first) + 1;
        let expected = total.saturating_sub(4) as usize;
        prop_assert_eq!(candidates.len(), expected);

        let unique: HashSet<_> = candidates.iter().collect();
        prop_assert_eq!(unique.len(), candidates.len());
        for addr in candidates {
            let n = u32::from(addr);
            prop_assert!(n >= first + 2 && n <= last - 2);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn allocations_never_collide(virtances in 1usize..16, seed in any::<u64>()) {
        let fx = Fixture::new();
        // twelve usable addresses
        fx.add_pool(PoolType::Private, "10.20.0.0/28", "10.20.0.1");
        let allocator = fx.allocator();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut seen: HashSet<IpAddr> = HashSet::new();
        let mut exhausted = 0;
        for _ in 0..virtances {
            let v = fx.add_virtance();
            match allocator
                .allocate_with_rng(&v, PoolType::Private, IpVersion::V4, &mut rng)
                .unwrap()
            {
                Some(a) => prop_assert!(seen.insert(a.address)),
                None => exhausted += 1,
            }
        }
        prop_assert_eq!(seen.len(), virtances.min(12));
        prop_assert_eq!(exhausted, virtances.saturating_sub(12));
    }
}
