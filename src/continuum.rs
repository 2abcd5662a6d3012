//! Ketama continuum.
//!
//! Every server contributes a fixed number of points to a ring of 32-bit
//! hashes. A key is owned by the first point at or after its hash, wrapping
//! to the first point. Removing a server only moves the keys that landed on
//! its points, which is what keeps remapping bounded when membership changes.
//!
//! Point generation depends only on the server list, the weights, and the hash
//! function, so independently built continuums from the same configuration are
//! identical.

use crate::hash::HashKind;
use crate::server::ServerSpec;

/// Points per server when weights are ignored.
pub const POINTS_PER_SERVER: u32 = 100;

/// Points per unit of weight in weighted mode. Each MD5 digest yields four.
pub const POINTS_PER_WEIGHT: u32 = 160;

const POINTS_PER_DIGEST: u32 = 4;

/// One point on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub hash: u32,
    pub server: usize,
}

/// Sorted ring of points. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuum {
    points: Vec<Point>,
    members: Vec<bool>,
}

impl Continuum {
    /// Build the ring for the servers whose `members` flag is set.
    ///
    /// `members` is indexed like `servers`.
    pub fn build(servers: &[ServerSpec], members: &[bool], weighted: bool, hash: HashKind) -> Self {
        let count: usize = servers
            .iter()
            .zip(members)
            .filter(|(_, m)| **m)
            .map(|(s, _)| points_for(s, weighted) as usize)
            .sum();
        let mut points = Vec::with_capacity(count);

        for (index, server) in servers.iter().enumerate() {
            if !members.get(index).copied().unwrap_or(false) {
                continue;
            }
            if weighted {
                for seed in 0..points_for(server, true) / POINTS_PER_DIGEST {
                    let digest = md5::compute(server.point_seed(seed).as_bytes()).0;
                    for chunk in digest.chunks_exact(4) {
                        points.push(Point {
                            hash: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                            server: index,
                        });
                    }
                }
            } else {
                for seed in 0..POINTS_PER_SERVER {
                    points.push(Point {
                        hash: hash.hash(server.point_seed(seed).as_bytes()),
                        server: index,
                    });
                }
            }
        }

        // tie-break on server index so equal hashes sort the same way everywhere
        points.sort_unstable_by_key(|p| (p.hash, p.server));

        Self {
            points,
            members: members.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// The membership this ring was built for.
    pub fn members(&self) -> &[bool] {
        &self.members
    }

    /// Index of the first point with `hash >= key_hash`, wrapping to 0.
    pub fn position(&self, key_hash: u32) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let idx = self.points.partition_point(|p| p.hash < key_hash);
        Some(if idx == self.points.len() { 0 } else { idx })
    }

    /// Servers in clockwise order from `key_hash`, each listed once.
    pub fn candidates(&self, key_hash: u32) -> Vec<usize> {
        let mut out: Vec<usize> = Vec::new();
        let Some(start) = self.position(key_hash) else {
            return out;
        };
        for step in 0..self.points.len() {
            let server = self.points[(start + step) % self.points.len()].server;
            if !out.contains(&server) {
                out.push(server);
            }
        }
        out
    }

    /// First server clockwise from `key_hash` for which `usable` holds.
    ///
    /// Walks at most one full turn of the ring.
    pub fn route(&self, key_hash: u32, usable: impl Fn(usize) -> bool) -> Option<usize> {
        let start = self.position(key_hash)?;
        (0..self.points.len())
            .map(|step| self.points[(start + step) % self.points.len()].server)
            .find(|server| usable(*server))
    }
}

/// Number of points `server` contributes.
pub fn points_for(server: &ServerSpec, weighted: bool) -> u32 {
    if weighted {
        POINTS_PER_WEIGHT.saturating_mul(server.weight())
    } else {
        POINTS_PER_SERVER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(specs: &[&str]) -> Vec<ServerSpec> {
        specs.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn point_count_matches_weights() {
        let list = servers(&["a:1:1", "b:1:2", "c:1:3"]);
        let ring = Continuum::build(&list, &[true; 3], true, HashKind::Md5);
        assert_eq!(ring.len(), 160 * 6);

        let ring = Continuum::build(&list, &[true, false, true], true, HashKind::Md5);
        assert_eq!(ring.len(), 160 * 4);

        let ring = Continuum::build(&list, &[true; 3], false, HashKind::Fnv1_32);
        assert_eq!(ring.len(), 300);
    }

    #[test]
    fn sorted_and_deterministic() {
        let list = servers(&["a", "b", "c", "d"]);
        let one = Continuum::build(&list, &[true; 4], true, HashKind::Fnv1_32);
        let two = Continuum::build(&list, &[true; 4], true, HashKind::Fnv1_32);
        assert_eq!(one, two);
        assert!(one.points().windows(2).all(|w| w[0].hash <= w[1].hash));
    }

    #[test]
    fn wraps_past_last_point() {
        let list = servers(&["a", "b"]);
        let ring = Continuum::build(&list, &[true; 2], false, HashKind::Fnv1_32);
        let last = ring.points().last().unwrap().hash;
        if last < u32::MAX {
            assert_eq!(ring.position(last + 1), Some(0));
        }
        assert_eq!(ring.position(0), Some(0));
    }

    #[test]
    fn route_skips_unusable_servers() {
        let list = servers(&["a", "b", "c"]);
        let ring = Continuum::build(&list, &[true; 3], true, HashKind::Fnv1_32);
        for i in 0..200u32 {
            let h = HashKind::Fnv1_32.hash(format!("key-{i}").as_bytes());
            let owner = ring.route(h, |_| true).unwrap();
            let fallback = ring.route(h, |s| s != owner).unwrap();
            assert_ne!(owner, fallback);
            assert_eq!(ring.candidates(h)[0], owner);
            assert_eq!(ring.candidates(h)[1], fallback);
        }
    }

    #[test]
    fn route_gives_up_after_full_turn() {
        let list = servers(&["a", "b"]);
        let ring = Continuum::build(&list, &[true; 2], true, HashKind::Fnv1_32);
        assert_eq!(ring.route(12345, |_| false), None);
    }

    #[test]
    fn filtered_ring_matches_rebuilt_ring() {
        let list = servers(&["a", "b", "c", "d", "e"]);
        let full = Continuum::build(&list, &[true; 5], true, HashKind::Fnv1_32);
        let live = [true, true, false, true, true];
        let without_c = Continuum::build(&list, &live, true, HashKind::Fnv1_32);
        for i in 0..500u32 {
            let h = HashKind::Fnv1_32.hash(format!("k{i}").as_bytes());
            assert_eq!(full.route(h, |s| s != 2), without_c.route(h, |_| true));
        }
    }

    #[test]
    fn empty_ring() {
        let list = servers(&["a"]);
        let ring = Continuum::build(&list, &[false], true, HashKind::Fnv1_32);
        assert!(ring.is_empty());
        assert_eq!(ring.position(1), None);
        assert!(ring.candidates(1).is_empty());
    }
}
