//! Property tests: a held Root pins each reachable object once per
//! reference, and dropping the Root gives every reference back.

use std::sync::Arc;

use cxo::{encode_root_payload, ContentStore, Keypair, MemoryNetwork, Node};
use cxo_testkit::generators::{Graph, GraphParams};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn node() -> Node {
    Node::builder()
        .transport(Arc::new(MemoryNetwork::new()))
        .spawn()
        .await
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_publish_pins_once_per_edge(params: GraphParams) {
        let graph = Graph::from_params(&params);
        let owner = Keypair::from_seed(&[7; 32]);

        let (counts, after_release, unreachable) = runtime().block_on(async {
            let node = node().await;
            node.publish(&owner, 0, encode_root_payload(&graph.root_refs), graph.objects.values())
                .await
                .unwrap();

            let counts: Vec<(u32, u32)> = graph
                .expected_refcounts()
                .into_iter()
                .map(|(hash, want)| (want, node.cxds().get(&hash, 0).unwrap().1))
                .collect();

            let reachable = graph.reachable();
            let unreachable = (0..graph.hashes.len())
                .filter(|i| !reachable.contains(i))
                .filter(|&i| node.cxds().get(&graph.hashes[i], 0).is_ok())
                .count();

            assert_eq!(node.del_roots_before(owner.public_key(), 0, 1).await.unwrap(), 1);
            let after_release: Vec<u32> = graph
                .hashes
                .iter()
                .filter_map(|h| node.cxds().get(h, 0).ok().map(|(_, rc)| rc))
                .collect();

            node.close().await.unwrap();
            (counts, after_release, unreachable)
        });

        for (want, got) in counts {
            prop_assert_eq!(want, got);
        }
        prop_assert_eq!(unreachable, 0);
        prop_assert!(after_release.iter().all(|&rc| rc == 0));
    }

    #[test]
    fn test_republishing_shares_objects(params: GraphParams) {
        let graph = Graph::from_params(&params);
        let owner = Keypair::from_seed(&[8; 32]);

        let (first, second) = runtime().block_on(async {
            let node = node().await;
            let payload = encode_root_payload(&graph.root_refs);
            node.publish(&owner, 0, payload.clone(), graph.objects.values())
                .await
                .unwrap();
            // Everything is stored now; the second Root needs nothing new.
            node.publish(&owner, 0, payload, Vec::new()).await.unwrap();

            let rcs = |node: &Node| -> Vec<u32> {
                graph
                    .root_refs
                    .iter()
                    .map(|h| node.cxds().get(h, 0).unwrap().1)
                    .collect()
            };
            let second = rcs(&node);
            node.del_roots_before(owner.public_key(), 0, 1).await.unwrap();
            let first = rcs(&node);
            node.close().await.unwrap();
            (first, second)
        });

        // Each Root adds its own edge; deeper edges are taken once.
        for (one, two) in first.iter().zip(&second) {
            prop_assert_eq!(one + 1, *two);
        }
    }
}
