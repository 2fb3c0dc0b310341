//! StateStore — redb-backed state persistence for Gantry.
//!
//! Provides typed operations over the version registry, routes,
//! deployment records, and the append-only transition history. All values
//! are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).
//!
//! Route writes (`set_weights`, `promote_route`, `revert_route`) are
//! compare-and-swap on the route's `revision` token. The check and the
//! write happen inside a single redb write transaction, so a stale token
//! aborts without mutating anything.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(ROUTES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Bump and return the named monotonic counter, inside `txn`.
    fn next_id(txn: &WriteTransaction, counter: &str) -> StateResult<u64> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let current = meta
            .get(counter)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        let id = current + 1;
        meta.insert(counter, id).map_err(map_err!(Write))?;
        Ok(id)
    }

    // ── Version registry ───────────────────────────────────────────

    /// Register a new immutable version for an artifact.
    ///
    /// The fingerprint is the hex SHA-256 of the artifact ref; registering
    /// an artifact whose fingerprint matches an `Active` version fails with
    /// `DuplicateArtifact`.
    pub fn register_version(&self, artifact_ref: &str, now: u64) -> StateResult<Version> {
        let fingerprint = hex::encode(Sha256::digest(artifact_ref.as_bytes()));

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version;
        {
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;

            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let existing: Version =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if existing.status == VersionStatus::Active && existing.fingerprint == fingerprint {
                    return Err(StateError::DuplicateArtifact {
                        fingerprint,
                        existing: existing.id,
                    });
                }
            }

            let id = Self::next_id(&txn, "next_version")?;
            version = Version {
                id,
                artifact_ref: artifact_ref.to_string(),
                fingerprint,
                created_at: now,
                status: VersionStatus::Active,
            };
            let value = serde_json::to_vec(&version).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = version.id, "version registered");
        Ok(version)
    }

    /// Get a version by id.
    pub fn get_version(&self, id: VersionId) -> StateResult<Option<Version>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let version: Version =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    /// List all registered versions.
    pub fn list_versions(&self) -> StateResult<Vec<Version>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let version: Version =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(version);
        }
        Ok(results)
    }

    /// Versions currently referenced by a route (stable + candidate).
    pub fn referenced_versions(&self, route_name: &str) -> StateResult<Vec<Version>> {
        let route = self
            .get_route(route_name)?
            .ok_or_else(|| StateError::NotFound(format!("route '{route_name}'")))?;
        let mut ids = vec![route.stable_version];
        if let Some(candidate) = route.candidate_version {
            ids.push(candidate);
        }
        let mut results = Vec::new();
        for id in ids {
            if let Some(version) = self.get_version(id)? {
                results.push(version);
            }
        }
        Ok(results)
    }

    /// Mark a version as rolled back after a failed rollout.
    pub fn mark_version_rolled_back(&self, id: VersionId) -> StateResult<()> {
        self.set_version_status(id, VersionStatus::RolledBack)
    }

    fn set_version_status(&self, id: VersionId, status: VersionStatus) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let mut version: Version = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("version {id}"))),
            };
            version.status = status;
            let value = serde_json::to_vec(&version).map_err(map_err!(Serialize))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Version ids referenced by any route or any non-terminal deployment.
    ///
    /// These are hard references: garbage collection never touches them and
    /// `purge_version` refuses them.
    fn hard_referenced(&self) -> StateResult<HashSet<VersionId>> {
        let mut refs = HashSet::new();
        for route in self.list_routes()? {
            refs.insert(route.stable_version);
            if let Some(candidate) = route.candidate_version {
                refs.insert(candidate);
            }
        }
        for deployment in self.list_deployments()? {
            if !deployment.is_terminal() {
                refs.insert(deployment.from_version);
                refs.insert(deployment.to_version);
            }
        }
        Ok(refs)
    }

    /// Version ids named by the audit trail (any deployment record).
    fn audit_referenced(&self) -> StateResult<HashSet<VersionId>> {
        let mut refs = HashSet::new();
        for deployment in self.list_deployments()? {
            refs.insert(deployment.from_version);
            refs.insert(deployment.to_version);
        }
        Ok(refs)
    }

    /// Tombstone versions older than the horizon that nothing references.
    ///
    /// Versions named by the audit trail are skipped; only `purge_version`
    /// removes those. Returns the number of versions tombstoned.
    pub fn garbage_collect_versions(&self, horizon_secs: u64, now: u64) -> StateResult<u32> {
        let hard = self.hard_referenced()?;
        let audit = self.audit_referenced()?;
        let cutoff = now.saturating_sub(horizon_secs);

        let mut collected = 0;
        for version in self.list_versions()? {
            if version.status == VersionStatus::Deleted {
                continue;
            }
            if version.created_at > cutoff {
                continue;
            }
            if hard.contains(&version.id) || audit.contains(&version.id) {
                continue;
            }
            self.set_version_status(version.id, VersionStatus::Deleted)?;
            collected += 1;
        }
        if collected > 0 {
            debug!(collected, "version garbage collection completed");
        }
        Ok(collected)
    }

    /// Remove a version record outright, audit references notwithstanding.
    ///
    /// Fails with `StillReferenced` while a route or a non-terminal
    /// deployment names the version.
    pub fn purge_version(&self, id: VersionId) -> StateResult<()> {
        if self.hard_referenced()?.contains(&id) {
            return Err(StateError::StillReferenced(
                id,
                "route or active deployment".to_string(),
            ));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !existed {
            return Err(StateError::NotFound(format!("version {id}")));
        }
        debug!(id, "version purged");
        Ok(())
    }

    // ── Routes ─────────────────────────────────────────────────────

    /// Create a route pointing all traffic at an active initial version.
    ///
    /// Names must be non-empty and must not contain `:`, the delimiter
    /// of the history table's composite keys.
    pub fn create_route(&self, name: &str, initial_version: VersionId, now: u64) -> StateResult<Route> {
        if name.is_empty() || name.contains(':') {
            return Err(StateError::InvalidRouteName(name.to_string()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let route;
        {
            let versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            Self::require_active_version(&versions, initial_version)?;

            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            if table.get(name).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(format!("route '{name}'")));
            }

            route = Route {
                name: name.to_string(),
                stable_version: initial_version,
                candidate_version: None,
                candidate_weight: 0,
                revision: 0,
                updated_at: now,
            };
            let value = serde_json::to_vec(&route).map_err(map_err!(Serialize))?;
            table.insert(name, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, version = initial_version, "route created");
        Ok(route)
    }

    /// Get a route by name.
    pub fn get_route(&self, name: &str) -> StateResult<Option<Route>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let route: Route =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(route))
            }
            None => Ok(None),
        }
    }

    /// List all routes.
    pub fn list_routes(&self) -> StateResult<Vec<Route>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let route: Route =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(route);
        }
        Ok(results)
    }

    /// Point `candidate_weight` percent of traffic at a candidate version.
    ///
    /// CAS write: fails with `ConcurrentModification` if `expected_revision`
    /// is stale, leaving the route untouched.
    pub fn set_weights(
        &self,
        name: &str,
        candidate_version: VersionId,
        candidate_weight: u8,
        expected_revision: u64,
        now: u64,
    ) -> StateResult<Route> {
        if candidate_weight > 100 {
            return Err(StateError::InvalidWeight(candidate_weight));
        }
        self.mutate_route(name, expected_revision, |route, versions| {
            Self::require_active_version(versions, candidate_version)?;
            route.candidate_version = Some(candidate_version);
            route.candidate_weight = candidate_weight;
            route.updated_at = now;
            Ok(())
        })
    }

    /// Finalize the candidate as the new stable version.
    ///
    /// Stable becomes the candidate, the candidate slot empties, and the
    /// weight returns to zero. The old stable version stays registered.
    pub fn promote_route(&self, name: &str, expected_revision: u64, now: u64) -> StateResult<Route> {
        self.mutate_route(name, expected_revision, |route, _| {
            let candidate = route
                .candidate_version
                .ok_or_else(|| StateError::NoCandidate(route.name.clone()))?;
            route.stable_version = candidate;
            route.candidate_version = None;
            route.candidate_weight = 0;
            route.updated_at = now;
            Ok(())
        })
    }

    /// Drop the candidate and return all traffic to stable.
    pub fn revert_route(&self, name: &str, expected_revision: u64, now: u64) -> StateResult<Route> {
        self.mutate_route(name, expected_revision, |route, _| {
            route.candidate_version = None;
            route.candidate_weight = 0;
            route.updated_at = now;
            Ok(())
        })
    }

    /// Shared CAS skeleton for route writes. Checks the revision token,
    /// applies `mutate`, bumps the revision, and commits — all in one
    /// write transaction.
    fn mutate_route(
        &self,
        name: &str,
        expected_revision: u64,
        mutate: impl FnOnce(&mut Route, &redb::Table<'_, u64, &'static [u8]>) -> StateResult<()>,
    ) -> StateResult<Route> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let route;
        {
            let versions = txn.open_table(VERSIONS).map_err(map_err!(Table))?;
            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            let mut current: Route = match table.get(name).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(StateError::NotFound(format!("route '{name}'"))),
            };

            if current.revision != expected_revision {
                return Err(StateError::ConcurrentModification {
                    route: name.to_string(),
                    expected: expected_revision,
                    actual: current.revision,
                });
            }

            mutate(&mut current, &versions)?;
            current.revision += 1;

            let value = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            table.insert(name, value.as_slice()).map_err(map_err!(Write))?;
            route = current;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, revision = route.revision, weight = route.candidate_weight, "route updated");
        Ok(route)
    }

    fn require_active_version(
        versions: &redb::Table<'_, u64, &'static [u8]>,
        id: VersionId,
    ) -> StateResult<()> {
        let version: Version = match versions.get(id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            None => return Err(StateError::NotFound(format!("version {id}"))),
        };
        if version.status != VersionStatus::Active {
            return Err(StateError::VersionNotActive(id));
        }
        Ok(())
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Persist a new deployment record, assigning its id.
    pub fn create_deployment(&self, mut record: DeploymentRecord) -> StateResult<DeploymentRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let id = Self::next_id(&txn, "next_deployment")?;
            record.id = id;
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = record.id, route = %record.route, "deployment created");
        Ok(record)
    }

    /// Update an existing deployment record in place.
    pub fn update_deployment(&self, record: &DeploymentRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if table.get(record.id).map_err(map_err!(Read))?.is_none() {
                return Err(StateError::NotFound(format!("deployment {}", record.id)));
            }
            table
                .insert(record.id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a deployment by id.
    pub fn get_deployment(&self, id: DeploymentId) -> StateResult<Option<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: DeploymentRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all deployment records.
    pub fn list_deployments(&self) -> StateResult<Vec<DeploymentRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// The non-terminal deployment on a route, if one exists.
    ///
    /// At most one is ever admitted per route.
    pub fn active_deployment_for_route(&self, route: &str) -> StateResult<Option<DeploymentRecord>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .find(|d| d.route == route && !d.is_terminal()))
    }

    // ── History ────────────────────────────────────────────────────

    /// Append a transition to the audit log, assigning its sequence number.
    ///
    /// History is append-only: records are never updated or deleted.
    pub fn append_history(&self, mut record: TransitionRecord) -> StateResult<TransitionRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let counter = format!("hist:{}", record.deployment_id);
            record.seq = Self::next_id(&txn, &counter)?;
            let key = record.table_key();
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let mut table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// All transitions recorded for a route, in append order per deployment.
    pub fn list_history(&self, route: &str) -> StateResult<Vec<TransitionRecord>> {
        let prefix = format!("{route}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: TransitionRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    /// All transitions recorded for one deployment, in append order.
    pub fn list_history_for_deployment(
        &self,
        id: DeploymentId,
    ) -> StateResult<Vec<TransitionRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(HISTORY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: TransitionRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if record.deployment_id == id {
                results.push(record);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> HealthPolicy {
        HealthPolicy {
            metric_ref: "error_rate".to_string(),
            threshold: 5.0,
            evaluation_window_secs: 60,
            min_data_points: 3,
            missing_data_policy: MissingDataPolicy::NotBreaching,
        }
    }

    fn test_deployment(route: &str, from: VersionId, to: VersionId) -> DeploymentRecord {
        DeploymentRecord {
            id: 0,
            route: route.to_string(),
            from_version: from,
            to_version: to,
            schedule: vec![
                Stage { weight: 10, bake_secs: 60 },
                Stage { weight: 100, bake_secs: 60 },
            ],
            policy: test_policy(),
            stage_index: 0,
            status: DeploymentStatus::Pending,
            started_at: 1000,
            ended_at: None,
            rollback_reason: None,
            last_verdict: None,
            failure: None,
        }
    }

    // ── Version registry ───────────────────────────────────────────

    #[test]
    fn register_assigns_monotonic_ids() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("oci://app:v1", 1000).unwrap();
        let v2 = store.register_version("oci://app:v2", 1001).unwrap();

        assert_eq!(v1.id, 1);
        assert_eq!(v2.id, 2);
        assert_eq!(v1.status, VersionStatus::Active);
        assert_ne!(v1.fingerprint, v2.fingerprint);
    }

    #[test]
    fn register_duplicate_active_artifact_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        store.register_version("oci://app:v1", 1000).unwrap();

        let err = store.register_version("oci://app:v1", 1001).unwrap_err();
        assert!(matches!(err, StateError::DuplicateArtifact { existing: 1, .. }));
    }

    #[test]
    fn register_same_artifact_after_rollback_allowed() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("oci://app:v1", 1000).unwrap();
        store.mark_version_rolled_back(v1.id).unwrap();

        // No longer active, so the fingerprint is free again.
        let v2 = store.register_version("oci://app:v1", 1001).unwrap();
        assert_eq!(v2.id, 2);
    }

    #[test]
    fn get_nonexistent_version_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_version(42).unwrap().is_none());
    }

    #[test]
    fn referenced_versions_cover_stable_and_candidate() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();
        store.set_weights("api", v2.id, 10, 0, 1001).unwrap();

        let refs = store.referenced_versions("api").unwrap();
        let ids: Vec<u64> = refs.iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![v1.id, v2.id]);
    }

    // ── Garbage collection ─────────────────────────────────────────

    #[test]
    fn gc_skips_route_referenced_versions() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();

        let collected = store.garbage_collect_versions(0, 5000).unwrap();
        assert_eq!(collected, 0);
        assert_eq!(store.get_version(v1.id).unwrap().unwrap().status, VersionStatus::Active);
    }

    #[test]
    fn gc_tombstones_old_unreferenced_versions() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 4900).unwrap();

        // Horizon of 200s at now=5000: v1 (age 4000) is eligible, v2 (age 100) is not.
        let collected = store.garbage_collect_versions(200, 5000).unwrap();
        assert_eq!(collected, 1);
        assert_eq!(store.get_version(v1.id).unwrap().unwrap().status, VersionStatus::Deleted);
        assert_eq!(store.get_version(v2.id).unwrap().unwrap().status, VersionStatus::Active);
    }

    #[test]
    fn gc_skips_versions_named_by_audit_trail() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();

        // A terminal deployment names both versions; neither route nor
        // active deployment references them anymore.
        let mut dep = test_deployment("api", v1.id, v2.id);
        dep.status = DeploymentStatus::RolledBack;
        store.create_deployment(dep).unwrap();

        let collected = store.garbage_collect_versions(0, 9000).unwrap();
        assert_eq!(collected, 0);
    }

    #[test]
    fn purge_removes_audit_named_version() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        let mut dep = test_deployment("api", v1.id, v2.id);
        dep.status = DeploymentStatus::RolledBack;
        store.create_deployment(dep).unwrap();

        store.purge_version(v2.id).unwrap();
        assert!(store.get_version(v2.id).unwrap().is_none());
    }

    #[test]
    fn purge_refuses_route_referenced_version() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();

        let err = store.purge_version(v1.id).unwrap_err();
        assert!(matches!(err, StateError::StillReferenced(_, _)));
    }

    // ── Routes ─────────────────────────────────────────────────────

    #[test]
    fn create_route_points_all_traffic_at_stable() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let route = store.create_route("api", v1.id, 1000).unwrap();

        assert_eq!(route.stable_version, v1.id);
        assert_eq!(route.candidate_weight, 0);
        assert_eq!(route.stable_weight(), 100);
        assert_eq!(route.revision, 0);
        assert!(!route.has_candidate());
    }

    #[test]
    fn create_route_duplicate_name_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();

        let err = store.create_route("api", v1.id, 1001).unwrap_err();
        assert!(matches!(err, StateError::AlreadyExists(_)));
    }

    #[test]
    fn create_route_name_with_colon_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();

        // A ':' in the name would let the history prefix scan for "api"
        // pick up records of "api:canary".
        for bad in ["api:canary", ":", ""] {
            let err = store.create_route(bad, v1.id, 1000).unwrap_err();
            assert!(matches!(err, StateError::InvalidRouteName(_)));
        }
        assert!(store.list_routes().unwrap().is_empty());
    }

    #[test]
    fn create_route_unknown_version_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.create_route("api", 99, 1000).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn set_weights_increments_revision() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();

        let route = store.set_weights("api", v2.id, 25, 0, 1001).unwrap();
        assert_eq!(route.candidate_version, Some(v2.id));
        assert_eq!(route.candidate_weight, 25);
        assert_eq!(route.stable_weight(), 75);
        assert_eq!(route.revision, 1);
    }

    #[test]
    fn set_weights_stale_revision_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();
        store.set_weights("api", v2.id, 10, 0, 1001).unwrap();

        // Replay with the stale token.
        let err = store.set_weights("api", v2.id, 50, 0, 1002).unwrap_err();
        assert!(matches!(
            err,
            StateError::ConcurrentModification { expected: 0, actual: 1, .. }
        ));

        // The route is untouched by the failed write.
        let route = store.get_route("api").unwrap().unwrap();
        assert_eq!(route.candidate_weight, 10);
        assert_eq!(route.revision, 1);
    }

    #[test]
    fn set_weights_over_hundred_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();

        let err = store.set_weights("api", v2.id, 101, 0, 1001).unwrap_err();
        assert!(matches!(err, StateError::InvalidWeight(101)));
    }

    #[test]
    fn set_weights_inactive_candidate_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();
        store.mark_version_rolled_back(v2.id).unwrap();

        let err = store.set_weights("api", v2.id, 10, 0, 1001).unwrap_err();
        assert!(matches!(err, StateError::VersionNotActive(_)));
    }

    #[test]
    fn promote_swaps_stable_and_clears_candidate() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();
        store.set_weights("api", v2.id, 100, 0, 1001).unwrap();

        let route = store.promote_route("api", 1, 1002).unwrap();
        assert_eq!(route.stable_version, v2.id);
        assert_eq!(route.candidate_version, None);
        assert_eq!(route.candidate_weight, 0);
        assert_eq!(route.revision, 2);

        // The prior stable stays registered for audit.
        assert!(store.get_version(v1.id).unwrap().is_some());
    }

    #[test]
    fn promote_without_candidate_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();

        let err = store.promote_route("api", 0, 1001).unwrap_err();
        assert!(matches!(err, StateError::NoCandidate(_)));
    }

    #[test]
    fn revert_clears_candidate_keeps_stable() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();
        store.set_weights("api", v2.id, 40, 0, 1001).unwrap();

        let route = store.revert_route("api", 1, 1002).unwrap();
        assert_eq!(route.stable_version, v1.id);
        assert_eq!(route.candidate_version, None);
        assert_eq!(route.candidate_weight, 0);
        assert_eq!(route.stable_weight(), 100);
    }

    #[test]
    fn revert_stale_revision_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let v1 = store.register_version("v1", 1000).unwrap();
        let v2 = store.register_version("v2", 1000).unwrap();
        store.create_route("api", v1.id, 1000).unwrap();
        store.set_weights("api", v2.id, 40, 0, 1001).unwrap();

        let err = store.revert_route("api", 0, 1002).unwrap_err();
        assert!(matches!(err, StateError::ConcurrentModification { .. }));
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployment_create_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let created = store.create_deployment(test_deployment("api", 1, 2)).unwrap();
        assert_eq!(created.id, 1);

        let fetched = store.get_deployment(1).unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[test]
    fn deployment_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut dep = store.create_deployment(test_deployment("api", 1, 2)).unwrap();

        dep.status = DeploymentStatus::Baking;
        dep.stage_index = 1;
        store.update_deployment(&dep).unwrap();

        let fetched = store.get_deployment(dep.id).unwrap().unwrap();
        assert_eq!(fetched.status, DeploymentStatus::Baking);
        assert_eq!(fetched.stage_index, 1);
    }

    #[test]
    fn deployment_update_unknown_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let dep = test_deployment("api", 1, 2);
        let err = store.update_deployment(&dep).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn active_deployment_ignores_terminal_records() {
        let store = StateStore::open_in_memory().unwrap();

        let mut done = test_deployment("api", 1, 2);
        done.status = DeploymentStatus::Succeeded;
        store.create_deployment(done).unwrap();

        assert!(store.active_deployment_for_route("api").unwrap().is_none());

        let active = store.create_deployment(test_deployment("api", 2, 3)).unwrap();
        let found = store.active_deployment_for_route("api").unwrap().unwrap();
        assert_eq!(found.id, active.id);

        // Other routes are unaffected.
        assert!(store.active_deployment_for_route("web").unwrap().is_none());
    }

    // ── History ────────────────────────────────────────────────────

    fn transition(
        deployment_id: u64,
        route: &str,
        from: DeploymentStatus,
        to: DeploymentStatus,
    ) -> TransitionRecord {
        TransitionRecord {
            deployment_id,
            route: route.to_string(),
            seq: 0,
            at: 1000,
            from_status: from,
            to_status: to,
            detail: String::new(),
            evidence: None,
        }
    }

    #[test]
    fn history_appends_in_sequence() {
        let store = StateStore::open_in_memory().unwrap();
        use DeploymentStatus::*;

        let a = store.append_history(transition(1, "api", Pending, Shifting)).unwrap();
        let b = store.append_history(transition(1, "api", Shifting, Baking)).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);

        let records = store.list_history("api").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].to_status, Shifting);
        assert_eq!(records[1].to_status, Baking);
    }

    #[test]
    fn history_scoped_by_route_and_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        use DeploymentStatus::*;

        store.append_history(transition(1, "api", Pending, Shifting)).unwrap();
        store.append_history(transition(2, "api", Pending, Shifting)).unwrap();
        store.append_history(transition(3, "web", Pending, Shifting)).unwrap();

        assert_eq!(store.list_history("api").unwrap().len(), 2);
        assert_eq!(store.list_history("web").unwrap().len(), 1);
        assert_eq!(store.list_history_for_deployment(2).unwrap().len(), 1);
        assert!(store.list_history("other").unwrap().is_empty());
    }

    #[test]
    fn history_preserves_rollback_evidence() {
        let store = StateStore::open_in_memory().unwrap();
        use DeploymentStatus::*;

        let mut rec = transition(1, "api", Baking, RolledBack);
        rec.detail = "health breach at stage 0".to_string();
        rec.evidence = Some(VerdictRecord {
            kind: VerdictKind::Breaching,
            at: 1500,
            window_start: 1440,
            window_end: 1500,
            sample: Some(MetricSample { count: 120, aggregate: 9.3 }),
            error: None,
        });
        store.append_history(rec).unwrap();

        let records = store.list_history_for_deployment(1).unwrap();
        let evidence = records[0].evidence.as_ref().unwrap();
        assert_eq!(evidence.kind, VerdictKind::Breaching);
        assert_eq!(evidence.sample.unwrap().count, 120);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let v1 = store.register_version("oci://app:v1", 1000).unwrap();
            store.create_route("api", v1.id, 1000).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let route = store.get_route("api").unwrap().unwrap();
        assert_eq!(route.stable_version, 1);

        // Counters survive too: the next version id continues the sequence.
        let v2 = store.register_version("oci://app:v2", 2000).unwrap();
        assert_eq!(v2.id, 2);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_versions().unwrap().is_empty());
        assert!(store.list_routes().unwrap().is_empty());
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(store.list_history("any").unwrap().is_empty());
        assert!(store.get_route("any").unwrap().is_none());
        assert!(store.active_deployment_for_route("any").unwrap().is_none());
        assert_eq!(store.garbage_collect_versions(0, 1000).unwrap(), 0);
    }
}
