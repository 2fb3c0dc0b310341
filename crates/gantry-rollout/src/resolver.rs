//! Weighted traffic resolution.
//!
//! The data plane calls `resolve` once per unit of traffic against its
//! latest route snapshot. Each call draws a uniform value in [0, 100) and
//! picks the candidate when the draw lands under the candidate weight, so
//! the realized split converges to the configured weight over many draws.
//! Per-request randomness was chosen over session-consistent hashing;
//! only statistical conformance is required.

use rand::Rng;

use gantry_state::{Route, VersionId};

/// Pick a version for one unit of traffic.
pub fn resolve(route: &Route) -> VersionId {
    resolve_with(route, rand::thread_rng().gen_range(0..100))
}

/// Deterministic core of `resolve`: `draw` must be in [0, 100).
pub fn resolve_with(route: &Route, draw: u8) -> VersionId {
    debug_assert!(draw < 100);
    match route.candidate_version {
        Some(candidate) if draw < route.candidate_weight => candidate,
        _ => route.stable_version,
    }
}
