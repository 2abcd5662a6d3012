//! Key distribution strategies.
//!
//! Routing is a pure function of the key hash and a [`PoolView`]: the same
//! hash and view always yield the same server.

use serde::Deserialize;

use crate::continuum::Continuum;

/// How keys are spread over the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    /// `hash % servers`.
    Modula,
    /// Ketama hash ring.
    #[default]
    #[serde(alias = "ketama", alias = "consistent_ketama")]
    Consistent,
    /// A random live server per request.
    Random,
}

/// How ejected servers affect routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadServers {
    /// Only live servers take part: modula divides by the live count and the
    /// ring is rebuilt without ejected servers.
    #[default]
    Aware,
    /// The full membership is kept. Modula keys owned by an ejected server
    /// fail with `ServerIsMarkedDead`; ring lookups walk past ejected points.
    Transparent,
}

/// Snapshot of the pool that routing decisions are made against.
#[derive(Debug, Clone, Copy)]
pub struct PoolView<'a> {
    /// `live[i]` is true when server `i` may receive requests.
    pub live: &'a [bool],
    /// Present for consistent distribution.
    pub continuum: Option<&'a Continuum>,
}

impl PoolView<'_> {
    fn live_indices(&self) -> Vec<usize> {
        self.live
            .iter()
            .enumerate()
            .filter_map(|(i, live)| live.then_some(i))
            .collect()
    }

    fn is_live(&self, index: usize) -> bool {
        self.live.get(index).copied().unwrap_or(false)
    }
}

/// Why a key could not be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    AllServersDown,
    /// The owning server (by index) is ejected and there is no fallback.
    MarkedDead(usize),
}

/// Pick the server for `key_hash`.
///
/// For [`Distribution::Random`] the caller passes a random value as the hash.
pub fn route(
    distribution: Distribution,
    dead_servers: DeadServers,
    key_hash: u32,
    view: PoolView<'_>,
) -> Result<usize, RouteError> {
    match distribution {
        Distribution::Consistent => view
            .continuum
            .and_then(|ring| ring.route(key_hash, |s| view.is_live(s)))
            .ok_or(RouteError::AllServersDown),
        Distribution::Modula if dead_servers == DeadServers::Transparent => {
            if view.live.is_empty() || !view.live.iter().any(|l| *l) {
                return Err(RouteError::AllServersDown);
            }
            let index = key_hash as usize % view.live.len();
            if view.is_live(index) {
                Ok(index)
            } else {
                Err(RouteError::MarkedDead(index))
            }
        }
        Distribution::Modula | Distribution::Random => {
            let live = view.live_indices();
            if live.is_empty() {
                return Err(RouteError::AllServersDown);
            }
            Ok(live[key_hash as usize % live.len()])
        }
    }
}

/// Live servers in the order they would be tried for `key_hash`.
///
/// Modula and random distribution have no stable secondary choice, so they
/// yield at most one candidate.
pub fn candidates(
    distribution: Distribution,
    dead_servers: DeadServers,
    key_hash: u32,
    view: PoolView<'_>,
) -> Vec<usize> {
    match distribution {
        Distribution::Consistent => view
            .continuum
            .map(|ring| {
                ring.candidates(key_hash)
                    .into_iter()
                    .filter(|s| view.is_live(*s))
                    .collect()
            })
            .unwrap_or_default(),
        _ => route(distribution, dead_servers, key_hash, view)
            .map(|s| vec![s])
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashKind;
    use crate::server::ServerSpec;

    fn ring(n: usize) -> Continuum {
        let servers: Vec<ServerSpec> = (0..n)
            .map(|i| format!("cache-{i}").parse().unwrap())
            .collect();
        Continuum::build(&servers, &vec![true; n], true, HashKind::Fnv1_32)
    }

    #[test]
    fn modula_uses_all_servers() {
        let live = [true, true, true];
        let view = PoolView {
            live: &live,
            continuum: None,
        };
        for h in 0..9u32 {
            assert_eq!(
                route(Distribution::Modula, DeadServers::Aware, h, view),
                Ok(h as usize % 3)
            );
        }
    }

    #[test]
    fn modula_aware_remaps_onto_live_subset() {
        let live = [true, false, true];
        let view = PoolView {
            live: &live,
            continuum: None,
        };
        assert_eq!(route(Distribution::Modula, DeadServers::Aware, 0, view), Ok(0));
        assert_eq!(route(Distribution::Modula, DeadServers::Aware, 1, view), Ok(2));
        assert_eq!(route(Distribution::Modula, DeadServers::Aware, 2, view), Ok(0));
    }

    #[test]
    fn modula_transparent_reports_dead_owner() {
        let live = [true, false, true];
        let view = PoolView {
            live: &live,
            continuum: None,
        };
        assert_eq!(
            route(Distribution::Modula, DeadServers::Transparent, 1, view),
            Err(RouteError::MarkedDead(1))
        );
        assert_eq!(
            route(Distribution::Modula, DeadServers::Transparent, 2, view),
            Ok(2)
        );
        assert!(candidates(Distribution::Modula, DeadServers::Transparent, 1, view).is_empty());
    }

    #[test]
    fn all_down() {
        let live = [false, false];
        let r = ring(2);
        let view = PoolView {
            live: &live,
            continuum: Some(&r),
        };
        for dist in [Distribution::Modula, Distribution::Consistent, Distribution::Random] {
            for mode in [DeadServers::Aware, DeadServers::Transparent] {
                assert_eq!(route(dist, mode, 7, view), Err(RouteError::AllServersDown));
            }
        }
    }

    #[test]
    fn consistent_skips_dead_points() {
        let r = ring(4);
        let all = [true; 4];
        for i in 0..100u32 {
            let h = HashKind::Fnv1_32.hash(format!("key{i}").as_bytes());
            let owner = route(
                Distribution::Consistent,
                DeadServers::Transparent,
                h,
                PoolView {
                    live: &all,
                    continuum: Some(&r),
                },
            )
            .unwrap();
            let mut live = all;
            live[owner] = false;
            let view = PoolView {
                live: &live,
                continuum: Some(&r),
            };
            let next = route(Distribution::Consistent, DeadServers::Transparent, h, view).unwrap();
            assert_ne!(next, owner);
            assert_eq!(
                candidates(Distribution::Consistent, DeadServers::Transparent, h, view)[0],
                next
            );
        }
    }

    #[test]
    fn deserializes_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            distribution: Distribution,
        }
        for (text, expected) in [
            ("modula", Distribution::Modula),
            ("consistent", Distribution::Consistent),
            ("ketama", Distribution::Consistent),
            ("consistent_ketama", Distribution::Consistent),
            ("random", Distribution::Random),
        ] {
            let w: Wrapper = toml::from_str(&format!("distribution = \"{text}\"")).unwrap();
            assert_eq!(w.distribution, expected);
        }
    }
}
