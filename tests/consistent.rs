//! Key placement across pool changes.

use std::collections::HashMap;

use crucible_memcache::{Client, Config, Distribution, MemoryCluster, MemoryTransport};

const FIVE: [&str; 5] = [
    "cache-1:11211",
    "cache-2:11211",
    "cache-3:11211",
    "cache-4:11211",
    "cache-5:11211",
];

fn client(servers: &[&str], config: &Config) -> Client<MemoryTransport> {
    let cluster = MemoryCluster::with_servers(servers);
    Client::new(servers, config, cluster.transport()).unwrap()
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("object:{i}")).collect()
}

fn placement(client: &mut Client<MemoryTransport>, keys: &[String]) -> Vec<String> {
    keys.iter().map(|k| client.server_for(k).unwrap()).collect()
}

fn moved(before: &[String], after: &[String]) -> usize {
    before.iter().zip(after).filter(|(a, b)| a != b).count()
}

#[test]
fn removing_a_server_keeps_most_keys_readable() {
    let cluster = MemoryCluster::with_servers(&FIVE);
    let config = Config::default();
    let mut five = Client::new(&FIVE, &config, cluster.transport()).unwrap();
    let keys = keys(500);
    for key in &keys {
        five.set_raw(key, key.as_bytes(), None).unwrap();
    }

    let mut four = Client::new(&FIVE[..4], &config, cluster.transport()).unwrap();
    let found: HashMap<String, _> = four.get_multi_raw(&keys).unwrap();
    let misses = keys.len() - found.len();
    assert!(misses < keys.len() / 3, "{misses} of {} keys lost", keys.len());
    for (key, value) in &found {
        assert_eq!(&value[..], key.as_bytes());
    }
}

#[test]
fn dropping_from_five_to_four_servers_loses_under_a_third() {
    let cluster = MemoryCluster::with_servers(&FIVE);
    let keys = keys(44);
    let mut five = Client::new(&FIVE, &Config::default(), cluster.transport()).unwrap();
    for key in &keys {
        five.set_raw(key, b"value", None).unwrap();
    }

    let mut four = Client::new(&FIVE[..4], &Config::default(), cluster.transport()).unwrap();
    let failures = keys
        .iter()
        .filter(|key| matches!(four.get_raw(key), Err(crucible_memcache::Error::NotFound { .. })))
        .count();
    assert!(failures * 3 < keys.len(), "{failures} misses");
}

#[test]
fn only_the_removed_servers_keys_move() {
    let keys = keys(1000);
    for n in 4..=5 {
        let mut full = client(&FIVE[..n], &Config::default());
        let mut reduced = client(&FIVE[..n - 1], &Config::default());
        let before = placement(&mut full, &keys);
        let after = placement(&mut reduced, &keys);

        let removed = FIVE[n - 1];
        for (old, new) in before.iter().zip(&after) {
            if old != removed {
                assert_eq!(old, new);
            }
        }
        assert!(moved(&before, &after) < keys.len() / 2);
    }
}

#[test]
fn modula_remaps_most_keys() {
    let config = Config {
        distribution: Distribution::Modula,
        ..Default::default()
    };
    let keys = keys(1000);
    let before = placement(&mut client(&FIVE, &config), &keys);
    let after = placement(&mut client(&FIVE[..4], &config), &keys);
    assert!(moved(&before, &after) > keys.len() / 2);
}

#[test]
fn placement_is_deterministic() {
    let keys = keys(200);
    for distribution in [Distribution::Modula, Distribution::Consistent] {
        let config = Config {
            distribution,
            ..Default::default()
        };
        let first = placement(&mut client(&FIVE, &config), &keys);
        let second = placement(&mut client(&FIVE, &config), &keys);
        assert_eq!(first, second, "{distribution:?}");
    }
}

#[test]
fn heavier_servers_own_more_keys() {
    let servers = ["cache-1:11211:3", "cache-2:11211", "cache-3:11211"];
    let mut client = client(&servers, &Config::default());
    let mut owned: HashMap<String, usize> = HashMap::new();
    for server in placement(&mut client, &keys(1000)) {
        *owned.entry(server).or_default() += 1;
    }
    let heavy = owned["cache-1:11211"];
    assert!(heavy > owned["cache-2:11211"]);
    assert!(heavy > owned["cache-3:11211"]);
    assert!(heavy > 400, "{owned:?}");
}

#[test]
fn unweighted_ring_ignores_weights() {
    let weighted = ["cache-1:11211:3", "cache-2:11211", "cache-3:11211"];
    let plain = ["cache-1:11211", "cache-2:11211", "cache-3:11211"];
    let config = Config {
        ketama_weighted: false,
        ..Default::default()
    };
    let keys = keys(300);
    assert_eq!(
        placement(&mut client(&weighted, &config), &keys),
        placement(&mut client(&plain, &config), &keys),
    );
}

#[test]
fn ring_does_not_depend_on_server_order() {
    let mut shuffled = FIVE;
    shuffled.reverse();
    shuffled.swap(0, 2);
    let keys = keys(300);
    assert_eq!(
        placement(&mut client(&FIVE, &Config::default()), &keys),
        placement(&mut client(&shuffled, &Config::default()), &keys),
    );
}

#[test]
fn sort_hosts_makes_modula_order_independent() {
    let mut shuffled = FIVE;
    shuffled.reverse();
    let keys = keys(300);

    let sorted = Config {
        distribution: Distribution::Modula,
        sort_hosts: true,
        ..Default::default()
    };
    assert_eq!(
        placement(&mut client(&FIVE, &sorted), &keys),
        placement(&mut client(&shuffled, &sorted), &keys),
    );

    let unsorted = Config {
        distribution: Distribution::Modula,
        ..Default::default()
    };
    assert_ne!(
        placement(&mut client(&FIVE, &unsorted), &keys),
        placement(&mut client(&shuffled, &unsorted), &keys),
    );
}

#[test]
fn prefix_is_not_hashed_by_default() {
    let keys = keys(200);
    let prefixed = Config {
        prefix_key: Some("app:".into()),
        ..Default::default()
    };
    assert_eq!(
        placement(&mut client(&FIVE, &Config::default()), &keys),
        placement(&mut client(&FIVE, &prefixed), &keys),
    );

    let hashed = Config {
        prefix_key: Some("app:".into()),
        hash_with_prefix_key: true,
        ..Default::default()
    };
    assert_ne!(
        placement(&mut client(&FIVE, &Config::default()), &keys),
        placement(&mut client(&FIVE, &hashed), &keys),
    );
}
