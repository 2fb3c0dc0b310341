//! redb table definitions for the Gantry state store.
//!
//! Versions and deployments use `u64` keys (monotonic ids); routes use the
//! route name; history uses a composite string key
//! `{route}:{deployment_id:020}:{seq:06}` so a prefix scan over a route name
//! yields its transitions in append order.

use redb::TableDefinition;

/// Immutable version records keyed by version id.
pub const VERSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("versions");

/// Route records keyed by route name.
pub const ROUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("routes");

/// Deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("deployments");

/// Append-only transition history keyed by `{route}:{deployment_id:020}:{seq:06}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

/// Monotonic counters (`next_version`, `next_deployment`, `hist:{id}`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
