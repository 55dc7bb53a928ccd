use crate::backup::{BackupEntry, BackupInfo, BackupManager, BackupValidation};
use crate::config::{Durability, StoreConfig};
use crate::crypto::{AesGcmCipher, Cipher};
use crate::error::{Result, SealDbError};
use crate::links::{Adjacency, LinkGraph, LinkViolation, RepairReport};
use crate::persistence::{PersistedState, PersistenceCoordinator};
use crate::query::{
    search, Filter, QueryBuilder, QueryEngine, QueryOptions, QueryOutcome, SearchOptions, SearchQuery,
    SearchResult,
};
use crate::schema::Schema;
use crate::validation::{ValidationEngine, Validator};
use crate::value::values_equal;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Counters reported by [`Store::stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub total_keys: usize,
    pub schemas: usize,
    pub validators: usize,
    /// Keys with at least one outgoing link.
    pub links: usize,
    /// Total number of link edges.
    pub linked_pairs: usize,
    pub query_cache_size: usize,
    pub path: PathBuf,
    pub durability: Durability,
    /// Unsaved changes are pending.
    pub dirty: bool,
}

struct StoreState {
    documents: Map<String, Value>,
    validation: ValidationEngine,
    links: LinkGraph,
    queries: QueryEngine,
    persistence: PersistenceCoordinator,
    backups: BackupManager,
    durability: Durability,
    dirty: bool,
}

impl StoreState {
    fn empty(persistence: PersistenceCoordinator, durability: Durability) -> Self {
        StoreState {
            documents: Map::new(),
            validation: ValidationEngine::new(),
            links: LinkGraph::new(),
            queries: QueryEngine::new(),
            backups: BackupManager::new(persistence.path()),
            persistence,
            durability,
            dirty: false,
        }
    }

    fn apply(&mut self, state: PersistedState) {
        self.documents = state.data;
        self.validation.import(state.schemas, state.validators);
        self.links = LinkGraph::from_tables(state.links, state.linked_to);
    }

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            data: self.documents.clone(),
            schemas: self.validation.schemas().clone(),
            validators: self.validation.export_validators(),
            links: self.links.all_links().clone(),
            linked_to: self.links.all_linked_to().clone(),
        }
    }

    fn persist(&mut self) -> Result<()> {
        self.persistence.save(&self.snapshot())?;
        self.dirty = false;
        Ok(())
    }

    /// Called after every in-memory mutation.
    fn commit(&mut self, operation: &str) -> Result<()> {
        self.dirty = true;
        match self.durability {
            Durability::Deferred => Ok(()),
            Durability::Immediate => self
                .persist()
                .map_err(|e| SealDbError::not_persisted(operation, e)),
        }
    }
}

/// An encrypted single-file document store.
///
/// All state sits behind one mutex, so each public operation (validate, mutate,
/// persist) is atomic with respect to other callers of the same `Store`. Share it
/// across threads with `Arc<Store>`. Validator and query callbacks run while the
/// lock is held and must not call back into the store.
pub struct Store {
    inner: Mutex<StoreState>,
}

impl Store {
    /// Open (or create) the store described by `config` using AES-256-GCM.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let cipher = AesGcmCipher::new(&config.secret_key)?;
        Self::open_with_cipher(config, Box::new(cipher))
    }

    /// Open with a caller-provided encryption service. `config.secret_key` is not used.
    pub fn open_with_cipher(config: StoreConfig, cipher: Box<dyn Cipher>) -> Result<Self> {
        if config.path.as_os_str().is_empty() {
            return Err(SealDbError::Config("Database path is required".into()));
        }

        let persistence = PersistenceCoordinator::new(&config.path, cipher);
        let loaded = match persistence.load() {
            Ok(loaded) => loaded,
            Err(e @ SealDbError::CorruptState { .. }) if config.reset_on_corrupt => {
                log::warn!("{e}; starting with an empty store");
                None
            }
            Err(e) => return Err(e),
        };

        let mut state = StoreState::empty(persistence, config.durability);
        if let Some(loaded) = loaded {
            state.apply(loaded);
        }

        log::info!(
            "Opened store {} ({} keys, {} durability)",
            config.path.display(),
            state.documents.len(),
            config.durability
        );
        Ok(Store {
            inner: Mutex::new(state),
        })
    }

    // ── Documents ────────────────────────────────────────────────────

    /// Validate `value` against the schema for `key` and store the processed form.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        check_key(key)?;
        let mut state = self.inner.lock();
        let processed = state.validation.validate_and_process(key, value)?;
        state.documents.insert(key.to_string(), processed);
        state.commit("set")
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().documents.get(key).cloned()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.lock().documents.contains_key(key)
    }

    /// Delete `key` and, transitively, every key it links to. Returns `false` when
    /// `key` did not exist.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.inner.lock();
        if !state.documents.contains_key(key) {
            return Ok(false);
        }

        let mut worklist = vec![key.to_string()];
        let mut visited: IndexSet<String> = IndexSet::new();
        while let Some(current) = worklist.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            state.documents.shift_remove(&current);
            for target in state.links.remove_key(&current) {
                if state.documents.contains_key(&target) && !visited.contains(&target) {
                    worklist.push(target);
                }
            }
        }

        if visited.len() > 1 {
            log::debug!("Deleting '{key}' cascaded to {} linked keys", visited.len() - 1);
        }
        state.commit("delete")?;
        Ok(true)
    }

    /// Remove every document, schema, validator, link and cached query.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.documents.clear();
        state.validation.clear_schemas();
        state.validation.clear_validators();
        state.links.clear();
        state.queries.clear_cache();
        state.commit("clear")
    }

    /// Append to the list at `key`, creating it (or wrapping an existing scalar)
    /// as needed. Returns the new length.
    pub fn push(&self, key: &str, value: Value) -> Result<usize> {
        check_key(key)?;
        let mut state = self.inner.lock();
        let element = state.validation.validate_and_process(key, value)?;

        let len = match state.documents.get_mut(key) {
            Some(Value::Array(items)) => {
                items.push(element);
                items.len()
            }
            Some(existing) => {
                let previous = existing.take();
                *existing = Value::Array(vec![previous, element]);
                2
            }
            None => {
                state.documents.insert(key.to_string(), Value::Array(vec![element]));
                1
            }
        };
        state.commit("push")?;
        Ok(len)
    }

    /// Remove every element equal to `value` from the list at `key`.
    /// Returns whether anything was removed.
    pub fn pull(&self, key: &str, value: &Value) -> Result<bool> {
        let mut state = self.inner.lock();
        let removed = match state.documents.get_mut(key) {
            Some(Value::Array(items)) => {
                let before = items.len();
                items.retain(|item| !values_equal(item, value));
                before != items.len()
            }
            _ => false,
        };
        if removed {
            state.commit("pull")?;
        }
        Ok(removed)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().documents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().documents.is_empty()
    }

    pub fn fetch_all(&self) -> Map<String, Value> {
        self.inner.lock().documents.clone()
    }

    // ── Schemas & validators ─────────────────────────────────────────

    pub fn set_schema(&self, key: &str, schema: Value) -> Result<()> {
        let mut state = self.inner.lock();
        state.validation.set_schema(key, schema)?;
        state.commit("set_schema")
    }

    pub fn get_schema(&self, key: &str) -> Option<Schema> {
        self.inner.lock().validation.get_schema(key).cloned()
    }

    pub fn remove_schema(&self, key: &str) -> Result<bool> {
        let mut state = self.inner.lock();
        let removed = state.validation.remove_schema(key);
        if removed {
            state.commit("remove_schema")?;
        }
        Ok(removed)
    }

    pub fn schemas(&self) -> IndexMap<String, Schema> {
        self.inner.lock().validation.schemas().clone()
    }

    /// Remove every schema. Cached query results are dropped as well.
    pub fn clear_schemas(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.validation.clear_schemas();
        state.queries.clear_cache();
        state.commit("clear_schemas")
    }

    /// Register (or rebind after a reload) a named validator.
    pub fn add_validator<V>(&self, name: &str, validator: V) -> Result<()>
    where
        V: Validator + 'static,
    {
        let mut state = self.inner.lock();
        state.validation.add_validator(name, validator)?;
        state.commit("add_validator")
    }

    pub fn remove_validator(&self, name: &str) -> Result<bool> {
        let mut state = self.inner.lock();
        let removed = state.validation.remove_validator(name);
        if removed {
            state.commit("remove_validator")?;
        }
        Ok(removed)
    }

    pub fn validator_names(&self) -> Vec<String> {
        self.inner.lock().validation.validator_names()
    }

    /// Whether a callback is bound for `name` in this process. Names loaded from
    /// disk stay unbound until [`Store::add_validator`] is called again.
    pub fn is_validator_bound(&self, name: &str) -> bool {
        self.inner.lock().validation.is_validator_bound(name)
    }

    pub fn clear_validators(&self) -> Result<()> {
        let mut state = self.inner.lock();
        state.validation.clear_validators();
        state.commit("clear_validators")
    }

    // ── Links ────────────────────────────────────────────────────────

    /// Link `source → target`. Deleting `source` later also deletes `target`.
    pub fn link(&self, source: &str, target: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let StoreState { links, documents, .. } = &mut *state;
        links.link(source, target, documents)?;
        state.commit("link")
    }

    pub fn unlink(&self, source: &str, target: &str) -> Result<bool> {
        let mut state = self.inner.lock();
        let removed = state.links.unlink(source, target);
        if removed {
            state.commit("unlink")?;
        }
        Ok(removed)
    }

    pub fn links(&self, key: &str) -> Vec<String> {
        self.inner.lock().links.links(key)
    }

    pub fn linked_to(&self, key: &str) -> Vec<String> {
        self.inner.lock().links.linked_to(key)
    }

    pub fn neighbors(&self, key: &str) -> Vec<String> {
        self.inner.lock().links.neighbors(key)
    }

    pub fn is_linked(&self, source: &str, target: &str) -> bool {
        self.inner.lock().links.is_linked(source, target)
    }

    pub fn all_links(&self) -> Adjacency {
        self.inner.lock().links.all_links().clone()
    }

    pub fn all_linked_to(&self) -> Adjacency {
        self.inner.lock().links.all_linked_to().clone()
    }

    pub fn validate_link_integrity(&self) -> Vec<LinkViolation> {
        let state = self.inner.lock();
        state.links.validate_integrity(&state.documents)
    }

    pub fn repair_link_integrity(&self) -> Result<RepairReport> {
        let mut state = self.inner.lock();
        let StoreState { links, documents, .. } = &mut *state;
        let report = links.repair_integrity(documents);
        if report.removed > 0 {
            log::info!(
                "Link repair removed {} dangling edges ({} sources trimmed)",
                report.removed,
                report.fixed
            );
            state.commit("repair_link_integrity")?;
        }
        Ok(report)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn search(&self, query: &SearchQuery, options: &SearchOptions) -> Vec<SearchResult> {
        let state = self.inner.lock();
        search(query, &state.documents, options)
    }

    pub fn query(&self, filter: &Filter, options: &QueryOptions) -> QueryOutcome {
        let mut state = self.inner.lock();
        let StoreState { queries, documents, .. } = &mut *state;
        queries.query(filter, documents, options)
    }

    pub fn natural_query(&self, text: &str, options: &QueryOptions) -> QueryOutcome {
        let mut state = self.inner.lock();
        let StoreState { queries, documents, .. } = &mut *state;
        queries.natural_query(text, documents, options)
    }

    pub fn query_builder(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    pub fn clear_query_cache(&self) {
        self.inner.lock().queries.clear_cache();
    }

    pub fn remove_query_cache_entry(&self, cache_key: &str) -> bool {
        self.inner.lock().queries.remove_cache_entry(cache_key)
    }

    // ── Backups ──────────────────────────────────────────────────────

    /// Save, then copy the database file. See [`BackupManager::backup`].
    pub fn backup(&self, target: Option<&Path>, include_metadata: bool) -> Result<PathBuf> {
        let mut state = self.inner.lock();
        state.persist()?;
        state.backups.backup(target, include_metadata)
    }

    /// Replace the database with a backup and reload it. The backup must decrypt
    /// under the current key; otherwise nothing is changed.
    pub fn restore(&self, source: &Path, backup_current: bool) -> Result<Option<PathBuf>> {
        let mut state = self.inner.lock();
        let restored = state.persistence.load_from(source)?.unwrap_or_default();
        let safety_copy = state.backups.restore(source, backup_current)?;

        state.apply(restored);
        state.queries.clear_cache();
        state.dirty = false;
        Ok(safety_copy)
    }

    pub fn list_backups(&self, dir: Option<&Path>) -> Result<Vec<BackupEntry>> {
        self.inner.lock().backups.list_backups(dir)
    }

    pub fn cleanup_backups(
        &self,
        dir: Option<&Path>,
        max_age_days: Option<u32>,
        max_count: Option<usize>,
    ) -> Result<usize> {
        self.inner.lock().backups.cleanup_backups(dir, max_age_days, max_count)
    }

    pub fn validate_backup(&self, path: &Path) -> BackupValidation {
        self.inner.lock().backups.validate_backup(path)
    }

    pub fn backup_info(&self, path: &Path) -> Result<BackupInfo> {
        self.inner.lock().backups.backup_info(path)
    }

    // ── Maintenance ──────────────────────────────────────────────────

    /// Re-encrypt the database under a new secret.
    pub fn rotate_key(&self, new_secret: &str) -> Result<()> {
        let cipher = AesGcmCipher::new(new_secret)?;
        self.rotate_cipher(Box::new(cipher))
    }

    /// Swap the encryption service and save. If the save fails the store keeps the
    /// new cipher while the file is still under the old one; the error is
    /// [`SealDbError::NotPersisted`] and [`Store::flush`] retries.
    pub fn rotate_cipher(&self, cipher: Box<dyn Cipher>) -> Result<()> {
        let mut state = self.inner.lock();
        state.persistence.set_cipher(cipher);
        log::info!("Rotated encryption key for {}", state.persistence.path().display());
        state.commit("rotate_key")
    }

    /// Write pending changes. A no-op when nothing is dirty.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.inner.lock();
        if state.dirty {
            state.persist()?;
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().persistence.path().to_path_buf()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.inner.lock();
        StoreStats {
            total_keys: state.documents.len(),
            schemas: state.validation.schemas().len(),
            validators: state.validation.validator_count(),
            links: state.links.all_links().len(),
            linked_pairs: state.links.edge_count(),
            query_cache_size: state.queries.cache_size(),
            path: state.persistence.path().to_path_buf(),
            durability: state.durability,
            dirty: state.dirty,
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let state = self.inner.get_mut();
        if state.dirty {
            if let Err(e) = state.persist() {
                log::warn!(
                    "Unsaved changes to {} were lost on close: {e}",
                    state.persistence.path().display()
                );
            }
        }
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("stats", &self.stats()).finish()
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(SealDbError::validation("", "key must be a non-empty string"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SortSpec;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup_test_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::new(tmp.path().join("test.db"), "test-secret")).unwrap();
        (tmp, store)
    }

    fn reopen(tmp: &TempDir, secret: &str) -> Result<Store> {
        Store::open(StoreConfig::new(tmp.path().join("test.db"), secret))
    }

    #[test]
    fn test_store_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Store>();
    }

    #[test]
    fn test_unset_keys() {
        let (_tmp, store) = setup_test_store();
        assert_eq!(store.get("nope"), None);
        assert!(!store.exists("nope"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_get_and_reopen() {
        let (tmp, store) = setup_test_store();
        store.set("user:1", json!({"name": "Ann", "age": 31})).unwrap();
        store.set("counter", json!(7)).unwrap();
        assert_eq!(store.get("user:1"), Some(json!({"name": "Ann", "age": 31})));
        assert_eq!(store.keys(), vec!["user:1", "counter"]);
        drop(store);

        let store = reopen(&tmp, "test-secret").unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("counter"), Some(json!(7)));
    }

    #[test]
    fn test_empty_key_rejected() {
        let (_tmp, store) = setup_test_store();
        match store.set("", json!(1)) {
            Err(SealDbError::Validation { path, message }) => {
                assert_eq!(path, "");
                assert_eq!(message, "key must be a non-empty string");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_schema_defaults_and_rejection() {
        let (_tmp, store) = setup_test_store();
        store
            .set_schema(
                "user:",
                json!({
                    "name": {"type": "string", "required": true},
                    "role": {"type": "string", "default": "member"}
                }),
            )
            .unwrap();

        store.set("user:1", json!({"name": "Ann"})).unwrap();
        let stored = store.get("user:1").unwrap();
        assert_eq!(stored, json!({"name": "Ann", "role": "member"}));

        // Setting the same value again is idempotent
        store.set("user:1", json!({"name": "Ann"})).unwrap();
        assert_eq!(store.get("user:1").unwrap(), stored);

        let err = store.set("user:2", json!({"role": "admin"})).unwrap_err();
        assert!(matches!(err, SealDbError::Validation { ref path, .. } if path == "user:2.name"));
        assert!(!store.exists("user:2"));
    }

    #[test]
    fn test_link_and_cycle_delete() {
        let (_tmp, store) = setup_test_store();
        store.set("a", json!(1)).unwrap();
        assert!(matches!(store.link("a", "b"), Err(SealDbError::Link(_))));

        store.set("b", json!(2)).unwrap();
        store.set("c", json!(3)).unwrap();
        store.link("a", "b").unwrap();
        store.link("a", "b").unwrap();
        store.link("b", "a").unwrap();
        assert_eq!(store.links("a"), vec!["b"]);
        assert_eq!(store.linked_to("b"), vec!["a"]);
        assert_eq!(store.stats().linked_pairs, 2);

        assert!(store.delete("a").unwrap());
        assert!(!store.exists("a"));
        assert!(!store.exists("b"));
        assert!(store.exists("c"));
        assert!(store.all_links().is_empty());
        assert!(store.all_linked_to().is_empty());
        assert!(!store.delete("a").unwrap());
    }

    #[test]
    fn test_cascade_follows_chain_only_forward() {
        let (_tmp, store) = setup_test_store();
        for key in ["post", "comment", "reply", "author"] {
            store.set(key, json!({})).unwrap();
        }
        store.link("post", "comment").unwrap();
        store.link("comment", "reply").unwrap();
        store.link("author", "post").unwrap();

        store.delete("post").unwrap();
        assert_eq!(store.keys(), vec!["author"]);
        assert!(store.links("author").is_empty());
    }

    #[test]
    fn test_push_and_pull() {
        let (_tmp, store) = setup_test_store();
        assert_eq!(store.push("list", json!("a")).unwrap(), 1);
        assert_eq!(store.push("list", json!("b")).unwrap(), 2);
        store.push("list", json!("a")).unwrap();
        assert_eq!(store.get("list"), Some(json!(["a", "b", "a"])));

        store.set("scalar", json!(5)).unwrap();
        assert_eq!(store.push("scalar", json!(6)).unwrap(), 2);
        assert_eq!(store.get("scalar"), Some(json!([5, 6])));

        assert!(store.pull("list", &json!("a")).unwrap());
        assert_eq!(store.get("list"), Some(json!(["b"])));
        assert!(!store.pull("list", &json!("zzz")).unwrap());
        assert!(!store.pull("missing", &json!(1)).unwrap());
    }

    #[test]
    fn test_push_validates_element() {
        let (_tmp, store) = setup_test_store();
        store.set_schema("scores", json!({"type": "number", "min": 0})).unwrap();
        store.push("scores", json!(3)).unwrap();
        assert!(store.push("scores", json!(-1)).is_err());
        assert_eq!(store.get("scores"), Some(json!([3])));
    }

    #[test]
    fn test_query_surface() {
        let (_tmp, store) = setup_test_store();
        store.set("x", json!({"age": 5})).unwrap();
        store.set("y", json!({"age": 20})).unwrap();

        let outcome = store.query(&json!({"age": {"$gt": 10}}).into(), &QueryOptions::default());
        assert_eq!(outcome.into_results(), vec![json!({"_key": "y", "age": 20})]);

        store.set("a", json!({"n": 3})).unwrap();
        store.set("b", json!({"n": 1})).unwrap();
        let options = QueryOptions::default().sort(SortSpec::Field("n".into())).limit(1);
        let outcome = store.query(&json!({"n": {"$exists": true}}).into(), &options);
        assert_eq!(outcome.into_results(), vec![json!({"_key": "b", "n": 1})]);

        let outcome = store.natural_query("age less than 10", &QueryOptions::default());
        assert_eq!(outcome.results().len(), 1);

        let hits = store.search(&"20".into(), &SearchOptions::default());
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_query_cache_survives_writes_until_clear() {
        let (_tmp, store) = setup_test_store();
        store.set("a", json!({"n": 1})).unwrap();
        let options = QueryOptions::default().cache_key("all");
        assert_eq!(store.query(&Filter::default(), &options).results().len(), 1);

        store.set("b", json!({"n": 2})).unwrap();
        assert_eq!(store.query(&Filter::default(), &options).results().len(), 1);
        assert_eq!(store.stats().query_cache_size, 1);

        store.clear().unwrap();
        assert_eq!(store.stats().query_cache_size, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear_schemas_drops_query_cache() {
        let (_tmp, store) = setup_test_store();
        store.set_schema("user:", json!({"name": {"type": "string"}})).unwrap();
        store.set("user:1", json!({"name": "Ann"})).unwrap();
        let options = QueryOptions::default().cache_key("users");
        assert_eq!(store.query(&Filter::default(), &options).results().len(), 1);
        assert_eq!(store.stats().query_cache_size, 1);

        store.remove_schema("user:").unwrap();
        assert_eq!(store.stats().query_cache_size, 1);

        store.clear_schemas().unwrap();
        assert_eq!(store.stats().query_cache_size, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_validators_survive_as_names() {
        let (tmp, store) = setup_test_store();
        store
            .add_validator("isEmail", |v: &Value, _: &str| {
                v.as_str().map(|s| s.contains('@')).unwrap_or(false)
            })
            .unwrap();
        store
            .set_schema("contact", json!({"email": {"type": "string", "validator": "isEmail"}}))
            .unwrap();
        store.set("contact", json!({"email": "a@b.c"})).unwrap();
        assert!(store.set("contact", json!({"email": "nope"})).is_err());
        drop(store);

        let store = reopen(&tmp, "test-secret").unwrap();
        assert_eq!(store.validator_names(), vec!["isEmail"]);
        assert!(!store.is_validator_bound("isEmail"));
        let err = store.set("contact", json!({"email": "x@y.z"})).unwrap_err();
        assert!(err.to_string().contains("isEmail"));

        store
            .add_validator("isEmail", |v: &Value, _: &str| v.as_str().is_some())
            .unwrap();
        store.set("contact", json!({"email": "x@y.z"})).unwrap();
    }

    #[test]
    fn test_integrity_repair_after_external_edit() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.db");

        // Write a file whose link tables reference keys that no longer exist
        let mut state = PersistedState::default();
        state.data.insert("a".into(), json!(1));
        state.data.insert("b".into(), json!(2));
        for (source, target) in [("a", "b"), ("a", "gone"), ("ghost", "a")] {
            state.links.entry(source.into()).or_default().insert(target.into());
            state.linked_to.entry(target.into()).or_default().insert(source.into());
        }
        PersistenceCoordinator::new(&path, Box::new(AesGcmCipher::new("k").unwrap()))
            .save(&state)
            .unwrap();

        let store = Store::open(StoreConfig::new(&path, "k")).unwrap();
        let violations = store.validate_link_integrity();
        assert_eq!(
            violations,
            vec![
                LinkViolation::MissingTarget { source: "a".into(), target: "gone".into() },
                LinkViolation::MissingSource { source: "ghost".into(), target: "a".into() },
            ]
        );

        let report = store.repair_link_integrity().unwrap();
        assert_eq!(report, RepairReport { removed: 2, fixed: 1 });
        assert!(store.validate_link_integrity().is_empty());
        assert_eq!(store.links("a"), vec!["b"]);
        assert!(store.linked_to("a").is_empty());
    }

    #[test]
    fn test_corrupt_file_fails_unless_reset() {
        let (tmp, store) = setup_test_store();
        store.set("a", json!(1)).unwrap();
        drop(store);

        assert!(matches!(
            reopen(&tmp, "other-secret"),
            Err(SealDbError::CorruptState { .. })
        ));

        let config = StoreConfig::new(tmp.path().join("test.db"), "other-secret").reset_on_corrupt(true);
        let store = Store::open(config).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_rotate_key() {
        let (tmp, store) = setup_test_store();
        store.set("a", json!("secret data")).unwrap();
        store.rotate_key("new-secret").unwrap();
        drop(store);

        assert!(reopen(&tmp, "test-secret").is_err());
        let store = reopen(&tmp, "new-secret").unwrap();
        assert_eq!(store.get("a"), Some(json!("secret data")));
    }

    #[test]
    fn test_failed_save_is_not_persisted() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let store = Store::open(StoreConfig::new(dir.join("test.db"), "k")).unwrap();
        store.set("a", json!(1)).unwrap();

        // Replace the data directory with a plain file so saving cannot succeed
        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::write(&dir, b"in the way").unwrap();

        let err = store.set("b", json!(2)).unwrap_err();
        assert!(err.is_unsaved());
        assert_eq!(store.get("b"), Some(json!(2)));
        assert!(store.stats().dirty);

        std::fs::remove_file(&dir).unwrap();
        store.flush().unwrap();
        assert!(!store.stats().dirty);
        drop(store);

        let store = Store::open(StoreConfig::new(dir.join("test.db"), "k")).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_failed_rotation_keeps_old_file_until_flush() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("data");
        let parked = tmp.path().join("parked");
        let path = dir.join("test.db");
        let store = Store::open(StoreConfig::new(&path, "old-secret")).unwrap();
        store.set("a", json!("secret data")).unwrap();

        std::fs::rename(&dir, &parked).unwrap();
        std::fs::write(&dir, b"in the way").unwrap();

        let err = store.rotate_key("new-secret").unwrap_err();
        assert!(err.is_unsaved());
        assert!(store.stats().dirty);

        std::fs::remove_file(&dir).unwrap();
        std::fs::rename(&parked, &dir).unwrap();

        // The file on disk is still under the old key
        let old = Store::open(StoreConfig::new(&path, "old-secret")).unwrap();
        assert_eq!(old.get("a"), Some(json!("secret data")));
        drop(old);

        store.flush().unwrap();
        assert!(!store.stats().dirty);
        drop(store);

        assert!(matches!(
            Store::open(StoreConfig::new(&path, "old-secret")),
            Err(SealDbError::CorruptState { .. })
        ));
        let store = Store::open(StoreConfig::new(&path, "new-secret")).unwrap();
        assert_eq!(store.get("a"), Some(json!("secret data")));
    }

    #[test]
    fn test_deferred_durability() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.db");
        let config = StoreConfig::new(&path, "k").durability(Durability::Deferred);

        let store = Store::open(config.clone()).unwrap();
        store.set("a", json!(1)).unwrap();
        assert!(!path.exists());
        assert!(store.stats().dirty);

        store.flush().unwrap();
        assert!(path.exists());
        assert!(!store.stats().dirty);

        // Pending changes are written when the store is dropped
        store.set("b", json!(2)).unwrap();
        drop(store);
        let store = Store::open(config).unwrap();
        assert_eq!(store.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_backup_and_restore() {
        let (tmp, store) = setup_test_store();
        store.set("a", json!(1)).unwrap();
        let backup = store.backup(None, true).unwrap();

        store.set("b", json!(2)).unwrap();
        store.delete("a").unwrap();

        let safety = store.restore(&backup, true).unwrap();
        assert!(safety.is_some());
        assert_eq!(store.keys(), vec!["a"]);
        assert_eq!(store.list_backups(None).unwrap().len(), 2);
        assert!(store.validate_backup(&backup).valid);
        assert!(store.backup_info(&backup).unwrap().metadata.is_some());

        // A backup from a different key is rejected without touching the database
        let foreign = tmp.path().join("foreign.backup.1");
        std::fs::write(&foreign, b"not ours, but long enough to look like ciphertext").unwrap();
        assert!(matches!(
            store.restore(&foreign, false),
            Err(SealDbError::CorruptState { .. })
        ));
        assert_eq!(store.keys(), vec!["a"]);
    }

    #[test]
    fn test_concurrent_writers() {
        let (_tmp, store) = setup_test_store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        store.push("log", json!(format!("{t}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.get("log").unwrap().as_array().unwrap().len(), 20);
    }

    #[test]
    fn test_stats() {
        let (_tmp, store) = setup_test_store();
        store.set("a", json!(1)).unwrap();
        store.set("b", json!(1)).unwrap();
        store.link("a", "b").unwrap();
        store.set_schema("a", json!({"type": "number"})).unwrap();

        let stats = store.stats();
        assert_eq!(stats.total_keys, 2);
        assert_eq!(stats.schemas, 1);
        assert_eq!(stats.links, 1);
        assert_eq!(stats.linked_pairs, 1);
        assert_eq!(stats.durability, Durability::Immediate);
        assert!(!stats.dirty);
    }
}
