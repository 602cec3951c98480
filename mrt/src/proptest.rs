// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for oif computation, RP selection and catalog
//! consistency.

#[cfg(test)]
mod proptest {
    use crate::rpset::rp_hash;
    use crate::test::{harness, rp_spec, G1, G2, S1, VIF_LAN, VIF_LAN2};
    use crate::types::{mask_from_len, Interfaces, MrtKey, Prefix4, VifSet};
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn vifset_strategy() -> impl Strategy<Value = VifSet> {
        any::<u32>().prop_map(VifSet::from_bits)
    }

    fn interfaces_strategy() -> impl Strategy<Value = Interfaces> {
        (
            vifset_strategy(),
            vifset_strategy(),
            vifset_strategy(),
            vifset_strategy(),
        )
            .prop_map(|(joined, pruned, leaves, asserted)| Interfaces {
                joined,
                pruned,
                leaves,
                asserted,
            })
    }

    #[derive(Debug, Clone)]
    enum Op {
        AddLeaf(usize, bool, bool),
        DeleteLeaf(usize, bool, bool),
        Delete(bool, bool),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..2, any::<bool>(), any::<bool>())
                .prop_map(|(v, s, g)| Op::AddLeaf(v, s, g)),
            (0usize..2, any::<bool>(), any::<bool>())
                .prop_map(|(v, s, g)| Op::DeleteLeaf(v, s, g)),
            (any::<bool>(), any::<bool>()).prop_map(|(s, g)| Op::Delete(s, g)),
        ]
    }

    proptest! {
        /// Property: adding a leaf never removes an oif, and the new leaf
        /// forwards unless it is asserted.
        #[test]
        fn prop_leaves_monotonic(
            inherited in vifset_strategy(),
            ifs in interfaces_strategy(),
            vif in 0usize..32,
        ) {
            let before = ifs.apply(inherited);
            let mut more = ifs;
            more.leaves.insert(vif);
            let after = more.apply(inherited);

            prop_assert_eq!(after & before, before);
            prop_assert_eq!(after.contains(vif), !ifs.asserted.contains(vif));
        }

        /// Property: asserted interfaces never forward.
        #[test]
        fn prop_asserted_excluded(
            inherited in vifset_strategy(),
            ifs in interfaces_strategy(),
        ) {
            prop_assert!((ifs.apply(inherited) & ifs.asserted).is_empty());
        }

        /// Property: the RP hash is deterministic and fits in 31 bits.
        #[test]
        fn prop_rp_hash_range(
            g in any::<u32>(),
            rp in any::<u32>(),
            len in 0u8..=32,
        ) {
            let (g, rp) = (Ipv4Addr::from(g), Ipv4Addr::from(rp));
            let h = rp_hash(g, mask_from_len(len), rp);
            prop_assert!(h < 1 << 31);
            prop_assert_eq!(h, rp_hash(g, mask_from_len(len), rp));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Property: the selected RP always has the lowest priority among
        /// the RPs covering the group.
        #[test]
        fn prop_lowest_priority_selected(
            priorities in prop::collection::vec(0u8..4, 1..6),
            low in any::<u16>(),
        ) {
            let mut h = harness("proptest_rp_priority");
            let prefix: Prefix4 = "226.0.0.0/8".parse().expect("prefix");
            for (i, p) in priorities.iter().enumerate() {
                let rp = Ipv4Addr::new(10, 0, 1, 10 + i as u8);
                h.engine
                    .add_rp_grp_entry(&rp_spec(rp, prefix, *p))
                    .expect("add edge");
            }
            let [a, b] = low.to_be_bytes();
            let group = Ipv4Addr::new(226, 0, a, b);
            let chosen = h.engine.rp_grp_match(group).expect("match");
            let best = priorities.iter().copied().min().expect("nonempty");
            let index = usize::from(chosen.rp.octets()[3] - 10);
            prop_assert_eq!(priorities[index], best);
        }

        /// Property: any sequence of membership changes and deletions keeps
        /// the chains, edge threads and cache owners consistent, and
        /// deleting every route leaves no source or group entry behind.
        #[test]
        fn prop_catalog_consistent(
            ops in prop::collection::vec(op_strategy(), 1..24),
        ) {
            let mut h = harness("proptest_catalog");
            let vifs = [VIF_LAN, VIF_LAN2];
            for op in ops {
                match op {
                    Op::AddLeaf(v, specific, first) => {
                        let g = if first { G1 } else { G2 };
                        let s = specific.then_some(S1);
                        h.engine.add_leaf(vifs[v], s, g).expect("add leaf");
                    }
                    Op::DeleteLeaf(v, specific, first) => {
                        let g = if first { G1 } else { G2 };
                        let s = specific.then_some(S1);
                        h.engine
                            .delete_leaf(vifs[v], s, g)
                            .expect("delete leaf");
                    }
                    Op::Delete(specific, first) => {
                        let g = if first { G1 } else { G2 };
                        let key = if specific {
                            MrtKey::sg(S1, g)
                        } else {
                            MrtKey::wc(g)
                        };
                        h.engine.delete_mrtentry(&key);
                    }
                }
                prop_assert_eq!(h.engine.audit(), Ok(()));
            }

            let keys: Vec<MrtKey> =
                h.engine.routes().map(|(k, _)| *k).collect();
            for key in keys {
                h.engine.delete_mrtentry(&key);
            }
            prop_assert_eq!(h.engine.route_count(), 0);
            prop_assert_eq!(h.engine.sources().count(), 0);
            prop_assert_eq!(h.engine.groups().count(), 0);
            prop_assert_eq!(h.engine.audit(), Ok(()));
        }
    }
}
