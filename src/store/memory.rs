//! In-process [`Store`] used by tests and local dry runs
//!
//! Mimics the parts of API server behavior the reconciler depends on:
//! resourceVersion preconditions, deletion markers held open by finalizers,
//! and owner-reference garbage collection. Every write is recorded so callers
//! can assert on write amplification.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use super::{NamespacedName, Store, StoreError, StoreResult};
use crate::crd::App;

/// Store call, used to target fault injection and to label recorded writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOperation {
    GetApp,
    SetAppFinalizers,
    GetWorkload,
    CreateWorkload,
    UpdateWorkload,
    DeleteWorkload,
}

/// A mutation performed through the [`Store`] interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub operation: StoreOperation,
    pub key: NamespacedName,
}

#[derive(Default)]
struct State {
    apps: BTreeMap<NamespacedName, App>,
    workloads: BTreeMap<NamespacedName, Deployment>,
    writes: Vec<WriteRecord>,
    faults: HashMap<StoreOperation, VecDeque<StoreError>>,
    last_version: u64,
    last_uid: u64,
}

impl State {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    fn stamp_new(&mut self, meta: &mut ObjectMeta) {
        if meta.uid.is_none() {
            self.last_uid += 1;
            meta.uid = Some(format!("uid-{}", self.last_uid));
        }
        meta.resource_version = Some(self.next_version());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Time(Utc::now()));
    }

    fn take_fault(&mut self, op: StoreOperation) -> StoreResult<()> {
        match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record(&mut self, operation: StoreOperation, key: &NamespacedName) {
        self.writes.push(WriteRecord {
            operation,
            key: key.clone(),
        });
    }

    /// Drop an App and, when enabled, every Deployment it controls
    fn remove_app(&mut self, key: &NamespacedName, garbage_collection: bool) {
        let Some(app) = self.apps.remove(key) else {
            return;
        };
        if !garbage_collection {
            return;
        }
        let Some(uid) = app.metadata.uid else {
            return;
        };
        self.workloads.retain(|wkey, workload| {
            let owned = wkey.namespace == key.namespace
                && workload
                    .metadata
                    .owner_references
                    .iter()
                    .flatten()
                    .any(|r| r.controller == Some(true) && r.uid == uid);
            !owned
        });
    }
}

/// In-memory cluster store
pub struct MemoryStore {
    state: Mutex<State>,
    garbage_collection: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with owner-reference garbage collection enabled
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            garbage_collection: true,
        }
    }

    /// Store that never cascades App deletion to owned objects
    pub fn without_garbage_collection() -> Self {
        Self {
            state: Mutex::new(State::default()),
            garbage_collection: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an App as if a user had created it. Not recorded as a write.
    pub fn insert_app(&self, mut app: App) -> App {
        let mut state = self.lock();
        state.stamp_new(&mut app.metadata);
        state.apps.insert(NamespacedName::of(&app), app.clone());
        app
    }

    /// Replace an App's spec as if a user had edited it. Not recorded as a write.
    pub fn edit_app(&self, key: &NamespacedName, edit: impl FnOnce(&mut App)) -> Option<App> {
        let mut state = self.lock();
        let version = state.next_version();
        let app = state.apps.get_mut(key)?;
        edit(app);
        app.metadata.resource_version = Some(version);
        app.metadata.generation = Some(app.metadata.generation.unwrap_or(0) + 1);
        Some(app.clone())
    }

    /// Request deletion of an App as a user would. With finalizers present
    /// the App stays, carrying a deletion marker; otherwise it is removed.
    pub fn delete_app(&self, key: &NamespacedName) {
        let mut state = self.lock();
        let version = state.next_version();
        let held = match state.apps.get_mut(key) {
            Some(app) if app.finalizers().is_empty() => false,
            Some(app) => {
                if app.metadata.deletion_timestamp.is_none() {
                    app.metadata.deletion_timestamp = Some(Time(Utc::now()));
                    app.metadata.resource_version = Some(version);
                }
                true
            }
            None => return,
        };
        if !held {
            state.remove_app(key, self.garbage_collection);
        }
    }

    /// Seed a Deployment as if it had been created out of band. Not recorded.
    pub fn insert_workload(&self, mut workload: Deployment) -> Deployment {
        let mut state = self.lock();
        state.stamp_new(&mut workload.metadata);
        state
            .workloads
            .insert(NamespacedName::of(&workload), workload.clone());
        workload
    }

    /// Mutate a stored Deployment out of band. Not recorded as a write.
    pub fn edit_workload(
        &self,
        key: &NamespacedName,
        edit: impl FnOnce(&mut Deployment),
    ) -> Option<Deployment> {
        let mut state = self.lock();
        let version = state.next_version();
        let workload = state.workloads.get_mut(key)?;
        edit(workload);
        workload.metadata.resource_version = Some(version);
        Some(workload.clone())
    }

    pub fn app(&self, key: &NamespacedName) -> Option<App> {
        self.lock().apps.get(key).cloned()
    }

    pub fn workload(&self, key: &NamespacedName) -> Option<Deployment> {
        self.lock().workloads.get(key).cloned()
    }

    /// All writes performed through the [`Store`] interface, oldest first
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Make the next call of `operation` fail with `err`. Faults queue up
    /// and are consumed one per call.
    pub fn fail_next(&self, operation: StoreOperation, err: StoreError) {
        self.lock()
            .faults
            .entry(operation)
            .or_default()
            .push_back(err);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_app(&self, key: &NamespacedName) -> StoreResult<App> {
        let mut state = self.lock();
        state.take_fault(StoreOperation::GetApp)?;
        state.apps.get(key).cloned().ok_or(StoreError::NotFound {
            kind: "App",
            key: key.clone(),
        })
    }

    async fn set_app_finalizers(&self, app: &App, finalizers: Vec<String>) -> StoreResult<App> {
        let key = NamespacedName::of(app);
        let mut state = self.lock();
        state.take_fault(StoreOperation::SetAppFinalizers)?;

        let version = state.next_version();
        let stored = state.apps.get_mut(&key).ok_or(StoreError::NotFound {
            kind: "App",
            key: key.clone(),
        })?;
        if app.metadata.resource_version.is_some()
            && app.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(StoreError::Conflict {
                kind: "App",
                key,
                message: "the object has been modified".to_string(),
            });
        }

        stored.metadata.finalizers = if finalizers.is_empty() {
            None
        } else {
            Some(finalizers)
        };
        stored.metadata.resource_version = Some(version);
        let updated = stored.clone();
        state.record(StoreOperation::SetAppFinalizers, &key);

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            state.remove_app(&key, self.garbage_collection);
        }
        Ok(updated)
    }

    async fn get_workload(&self, key: &NamespacedName) -> StoreResult<Deployment> {
        let mut state = self.lock();
        state.take_fault(StoreOperation::GetWorkload)?;
        state.workloads.get(key).cloned().ok_or(StoreError::NotFound {
            kind: "Deployment",
            key: key.clone(),
        })
    }

    async fn create_workload(&self, workload: &Deployment) -> StoreResult<Deployment> {
        let key = NamespacedName::of(workload);
        let mut state = self.lock();
        state.take_fault(StoreOperation::CreateWorkload)?;

        if state.workloads.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: "Deployment",
                key,
                message: "already exists".to_string(),
            });
        }

        let mut created = workload.clone();
        state.stamp_new(&mut created.metadata);
        state.workloads.insert(key.clone(), created.clone());
        state.record(StoreOperation::CreateWorkload, &key);
        Ok(created)
    }

    async fn update_workload(&self, workload: &Deployment) -> StoreResult<Deployment> {
        let key = NamespacedName::of(workload);
        let mut state = self.lock();
        state.take_fault(StoreOperation::UpdateWorkload)?;

        let version = state.next_version();
        let stored = state.workloads.get_mut(&key).ok_or(StoreError::NotFound {
            kind: "Deployment",
            key: key.clone(),
        })?;
        if workload.metadata.resource_version.is_some()
            && workload.metadata.resource_version != stored.metadata.resource_version
        {
            return Err(StoreError::Conflict {
                kind: "Deployment",
                key,
                message: "the object has been modified".to_string(),
            });
        }

        let spec_changed = stored.spec != workload.spec;
        let generation = stored.metadata.generation.unwrap_or(1);
        let mut updated = workload.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        updated.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        updated.metadata.resource_version = Some(version);
        updated.metadata.generation = Some(if spec_changed {
            generation + 1
        } else {
            generation
        });
        *stored = updated.clone();
        state.record(StoreOperation::UpdateWorkload, &key);
        Ok(updated)
    }

    async fn delete_workload(&self, key: &NamespacedName) -> StoreResult<()> {
        let mut state = self.lock();
        state.take_fault(StoreOperation::DeleteWorkload)?;

        if state.workloads.remove(key).is_none() {
            return Err(StoreError::NotFound {
                kind: "Deployment",
                key: key.clone(),
            });
        }
        state.record(StoreOperation::DeleteWorkload, key);
        Ok(())
    }
}
