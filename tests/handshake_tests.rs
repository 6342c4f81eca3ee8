// End-to-end handshake tests over the deterministic in-process radio.
//
// These cover the three-way HELLO / HELLOACK / ACK exchange between real
// nodes, including the concurrent-discovery tie-break, capacity bounds,
// and the scheme-refusal path.

use apkes_core::{Config, KeyingScheme, NeighborIds, NeighborStatus};
use apkes_crypto::Key128;
use apkes_integration_tests::{SimNet, build_node, fast_config};
use apkes_store::{MemFlash, NonVolatile, StoreError};
use std::time::Duration;

#[test]
fn test_two_nodes_establish_equal_keys() {
    let mut net = SimNet::new(2, &fast_config());
    net.bootstrap_all();
    net.run_until(Duration::from_secs(600));

    let a = net.neighbor(1, 2).expect("node 1 knows node 2");
    let b = net.neighbor(2, 1).expect("node 2 knows node 1");
    assert_eq!(a.status, NeighborStatus::Permanent);
    assert_eq!(b.status, NeighborStatus::Permanent);
    assert_eq!(a.pairwise_key, b.pairwise_key, "negotiated keys agree");

    // First peer on each side takes index 0, and the advertised index
    // comes back as the other side's foreign index.
    assert_eq!(a.local_index, 0);
    assert_eq!(b.local_index, 0);
    assert_eq!(a.foreign_index, b.local_index);
    assert_eq!(b.foreign_index, a.local_index);

    // Short addresses travelled inside the update-form payloads.
    assert_eq!(a.ids.short_addr.as_u16(), 2);
    assert_eq!(b.ids.short_addr.as_u16(), 1);

    assert!(net.node(1).apkes.is_bootstrapped());
    assert!(net.node(2).apkes.is_bootstrapped());
}

#[test]
fn test_mesh_pairs_completely() {
    let mut net = SimNet::new(4, &fast_config());
    net.bootstrap_all();
    net.run_until(Duration::from_secs(600));

    for a in 1..=4u8 {
        assert_eq!(
            net.node(a).apkes.neighbors().count(),
            3,
            "node {a} pairs with all others"
        );
        for b in 1..=4u8 {
            if a == b {
                continue;
            }
            let forward = net.pairwise_key(a, b).expect("key stored");
            let reverse = net.pairwise_key(b, a).expect("key stored");
            assert_eq!(forward, reverse, "pair ({a},{b}) agrees");
        }
    }

    // Keys differ across pairs: a compromise of one link leaks nothing
    // about another.
    let ab = net.pairwise_key(1, 2).unwrap();
    let ac = net.pairwise_key(1, 3).unwrap();
    let bc = net.pairwise_key(2, 3).unwrap();
    assert_ne!(ab, ac);
    assert_ne!(ab, bc);
}

#[test]
fn test_hello_burst_bounded_by_tentative_pool() {
    let config = Config {
        max_tentative: 2,
        ..fast_config()
    };
    let mut net = SimNet::new(6, &config);
    net.bootstrap_all();

    // Right after the simultaneous HELLO burst, node 1 heard five peers
    // but only holds slots for two in-flight handshakes.
    let tentative = net
        .node(1)
        .apkes
        .neighbors()
        .iter()
        .filter(|n| n.status != NeighborStatus::Permanent)
        .count();
    assert_eq!(net.node(1).apkes.neighbors().count(), 2);
    assert_eq!(tentative, 2);
}

#[test]
fn test_full_table_rejects_extra_peers() {
    let config = Config {
        max_neighbors: 3,
        max_tentative: 1,
        ..fast_config()
    };
    let mut net = SimNet::new(6, &config);
    net.bootstrap_all();
    net.run_until(Duration::from_secs(600));

    for index in 1..=6u8 {
        let node = net.node(index);
        assert!(
            node.apkes.neighbors().count() <= 3,
            "node {index} stays within its pool"
        );
        for n in node.apkes.neighbors().iter() {
            if n.status == NeighborStatus::Permanent {
                assert!(n.expiration_time > net.clock.get(), "permanent entries live");
            }
        }
    }
}

struct RefusingScheme;

impl KeyingScheme for RefusingScheme {
    fn init(&mut self, _flash: &mut dyn NonVolatile) -> Result<(), StoreError> {
        Ok(())
    }

    fn secret_with_hello_sender(&self, _ids: &NeighborIds) -> Option<Key128> {
        None
    }

    fn secret_with_helloack_sender(&self, _ids: &NeighborIds) -> Option<Key128> {
        None
    }
}

#[test]
fn test_scheme_without_secrets_never_pairs() {
    let config = fast_config();
    let clock = std::rc::Rc::new(std::cell::Cell::new(Duration::ZERO));
    let nodes = vec![
        build_node(
            1,
            config.clone(),
            clock.clone(),
            Box::new(MemFlash::new()),
            Box::new(RefusingScheme),
        ),
        build_node(
            2,
            config,
            clock.clone(),
            Box::new(MemFlash::new()),
            Box::new(RefusingScheme),
        ),
    ];
    let mut net = SimNet { clock, nodes };
    net.bootstrap_all();
    net.run_until(Duration::from_secs(60));

    for index in 1..=2u8 {
        for n in net.node(index).apkes.neighbors().iter() {
            assert_ne!(
                n.status,
                NeighborStatus::Permanent,
                "no pairwise key without a scheme secret"
            );
        }
        assert!(!net.node(index).apkes.is_bootstrapped());
    }
}
