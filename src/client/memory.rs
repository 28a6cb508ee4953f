//! In-memory cluster store
//!
//! `MemoryClient` behaves like a small API server: objects are keyed by
//! kind and name, carry a resource version, honor merge patches and can take
//! several polls to disappear after a delete. Every call is recorded so tests
//! can assert on exactly what the engine did.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ClientError, ClusterClient, ObjectKey, Selector};
use crate::config::DeletionPropagation;

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
];

/// Client verb, used for error injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
}

/// A recorded client call
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(ObjectKey),
    List(Selector),
    Create(ObjectKey),
    Update(ObjectKey),
    Patch(ObjectKey, Value),
    Delete(ObjectKey, DeletionPropagation),
}

impl Call {
    pub fn verb(&self) -> Verb {
        match self {
            Call::Get(_) => Verb::Get,
            Call::List(_) => Verb::List,
            Call::Create(_) => Verb::Create,
            Call::Update(_) => Verb::Update,
            Call::Patch(..) => Verb::Patch,
            Call::Delete(..) => Verb::Delete,
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    /// Objects being deleted, with the number of reads before they vanish
    terminating: BTreeMap<ObjectKey, u32>,
    calls: Vec<Call>,
    injected: HashMap<Verb, Vec<ClientError>>,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn take_injected(&mut self, verb: Verb) -> Option<ClientError> {
        let queue = self.injected.get_mut(&verb)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Count one read against terminating objects, dropping those whose time is up
    fn tick(&mut self, key: &ObjectKey) {
        if let Some(remaining) = self.terminating.get_mut(key) {
            if *remaining == 0 {
                self.terminating.remove(key);
                self.objects.remove(key);
            } else {
                *remaining -= 1;
            }
        }
    }
}

/// In-memory `ClusterClient`
#[derive(Clone)]
pub struct MemoryClient {
    state: Arc<Mutex<State>>,
    cluster_scoped: Arc<HashSet<String>>,
    deletion_delay: u32,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            cluster_scoped: Arc::new(CLUSTER_SCOPED_KINDS.iter().map(|k| k.to_string()).collect()),
            deletion_delay: 0,
        }
    }

    /// Keep deleted objects readable for `reads` more reads
    pub fn with_deletion_delay(mut self, reads: u32) -> Self {
        self.deletion_delay = reads;
        self
    }

    /// Treat `kind` as cluster-scoped
    pub fn with_cluster_scoped_kind(mut self, kind: impl Into<String>) -> Self {
        let mut kinds = (*self.cluster_scoped).clone();
        kinds.insert(kind.into());
        self.cluster_scoped = Arc::new(kinds);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn normalize(&self, mut key: ObjectKey) -> ObjectKey {
        if self.cluster_scoped.contains(&key.kind) {
            key.namespace = None;
        }
        key
    }

    fn key_of(&self, obj: &Value) -> Result<ObjectKey, ClientError> {
        Ok(self.normalize(ObjectKey::from_object(obj)?))
    }

    /// Seed an object without recording a call
    ///
    /// Documents without apiVersion, kind or name are ignored.
    pub fn insert(&self, mut obj: Value) {
        let Ok(key) = self.key_of(&obj) else {
            return;
        };
        let mut state = self.lock();
        let rv = state.next_version();
        stamp(&mut obj, &rv);
        state.terminating.remove(&key);
        state.objects.insert(key, obj);
    }

    /// Make the next call of `verb` fail with `err`; queued errors fire in order
    pub fn fail_next(&self, verb: Verb, err: ClientError) {
        self.lock().injected.entry(verb).or_default().push(err);
    }

    /// Snapshot of a stored object
    pub fn object(&self, key: &ObjectKey) -> Option<Value> {
        let key = self.normalize(key.clone());
        self.lock().objects.get(&key).cloned()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.object(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every recorded call, oldest first
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls of `verb`
    pub fn count(&self, verb: Verb) -> usize {
        self.lock().calls.iter().filter(|c| c.verb() == verb).count()
    }

    /// Keys passed to delete calls, in call order
    pub fn deleted_keys(&self) -> Vec<ObjectKey> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Delete(key, _) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }
}

fn stamp(obj: &mut Value, resource_version: &str) {
    if let Some(root) = obj.as_object_mut() {
        let meta = root
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert(
                "resourceVersion".to_string(),
                Value::String(resource_version.to_string()),
            );
            meta.entry("uid")
                .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
        }
    }
}

#[async_trait]
impl ClusterClient for MemoryClient {
    async fn get(&self, key: &ObjectKey) -> Result<Value, ClientError> {
        let key = self.normalize(key.clone());
        let mut state = self.lock();
        state.calls.push(Call::Get(key.clone()));
        if let Some(err) = state.take_injected(Verb::Get) {
            return Err(err);
        }
        state.tick(&key);
        state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<Value>, ClientError> {
        let mut state = self.lock();
        state.calls.push(Call::List(selector.clone()));
        if let Some(err) = state.take_injected(Verb::List) {
            return Err(err);
        }
        let keys: BTreeSet<ObjectKey> = state.terminating.keys().cloned().collect();
        for key in &keys {
            state.tick(key);
        }
        Ok(state
            .objects
            .values()
            .filter(|obj| selector.matches(obj))
            .cloned()
            .collect())
    }

    async fn create(&self, obj: &Value, dry_run: bool) -> Result<Value, ClientError> {
        let key = self.key_of(obj)?;
        let mut state = self.lock();
        state.calls.push(Call::Create(key.clone()));
        if let Some(err) = state.take_injected(Verb::Create) {
            return Err(err);
        }
        if state.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(key.to_string()));
        }
        let mut stored = obj.clone();
        if dry_run {
            stamp(&mut stored, "0");
            return Ok(stored);
        }
        let rv = state.next_version();
        stamp(&mut stored, &rv);
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &Value) -> Result<Value, ClientError> {
        let key = self.key_of(obj)?;
        let mut state = self.lock();
        state.calls.push(Call::Update(key.clone()));
        if let Some(err) = state.take_injected(Verb::Update) {
            return Err(err);
        }
        let current = state
            .objects
            .get(&key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        if let Some(rv) = obj.pointer("/metadata/resourceVersion") {
            if current.pointer("/metadata/resourceVersion") != Some(rv) {
                return Err(ClientError::Conflict(key.to_string()));
            }
        }
        let mut stored = obj.clone();
        let rv = state.next_version();
        stamp(&mut stored, &rv);
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &Value,
        dry_run: bool,
    ) -> Result<Value, ClientError> {
        let key = self.normalize(key.clone());
        let mut state = self.lock();
        state.calls.push(Call::Patch(key.clone(), patch.clone()));
        if let Some(err) = state.take_injected(Verb::Patch) {
            return Err(err);
        }
        let mut stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        if let Some(rv) = patch.pointer("/metadata/resourceVersion") {
            if stored.pointer("/metadata/resourceVersion") != Some(rv) {
                return Err(ClientError::Conflict(key.to_string()));
            }
        }
        json_patch::merge(&mut stored, patch);
        if dry_run {
            return Ok(stored);
        }
        let rv = state.next_version();
        stamp(&mut stored, &rv);
        state.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        key: &ObjectKey,
        propagation: DeletionPropagation,
    ) -> Result<(), ClientError> {
        let key = self.normalize(key.clone());
        let mut state = self.lock();
        state.calls.push(Call::Delete(key.clone(), propagation));
        if let Some(err) = state.take_injected(Verb::Delete) {
            return Err(err);
        }
        if !state.objects.contains_key(&key) {
            return Err(ClientError::NotFound(key.to_string()));
        }
        if self.deletion_delay == 0 {
            state.objects.remove(&key);
        } else if !state.terminating.contains_key(&key) {
            state.terminating.insert(key, self.deletion_delay);
        }
        Ok(())
    }

    async fn is_namespaced(&self, _api_version: &str, kind: &str) -> Result<bool, ClientError> {
        Ok(!self.cluster_scoped.contains(kind))
    }
}
