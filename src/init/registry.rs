//! Priority-ordered initializers run before a worker starts its body.

use super::function::{FunctionInstance, InitValue};
use super::policy::{DuplicatePolicy, Resolution};
use crate::error::{Error, Result};
use crate::worker::panic_handler::capture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Priority used when none is given. Lower runs first.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Which startup an initializer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitScope {
    /// Once per worker process (a pool slot).
    Process,
    /// Once per worker thread.
    Thread,
}

impl fmt::Display for InitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitScope::Process => f.write_str("process"),
            InitScope::Thread => f.write_str("thread"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitializerEntry {
    instance: FunctionInstance,
    priority: i32,
    scope: InitScope,
    seq: u64,
}

impl InitializerEntry {
    pub fn name(&self) -> &str {
        self.instance.name()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn scope(&self) -> InitScope {
        self.scope
    }

    fn sort_key(&self) -> (i32, u64) {
        (self.priority, self.seq)
    }
}

/// Registry of initializers, bucketed by scope and kept sorted by
/// `(priority, registration order)`.
///
/// One instance is created by the top-level owner and shared (`Arc`) with
/// every [`WorkerManager`](crate::WorkerManager) and
/// [`TaskPool`](crate::TaskPool) it builds.
#[derive(Debug)]
pub struct InitializerRegistry {
    policy: DuplicatePolicy,
    process: RwLock<Vec<InitializerEntry>>,
    thread: RwLock<Vec<InitializerEntry>>,
    next_seq: AtomicU64,
}

impl InitializerRegistry {
    pub fn new() -> Self {
        Self::with_policy(DuplicatePolicy::default())
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            process: RwLock::new(Vec::new()),
            thread: RwLock::new(Vec::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    fn bucket(&self, scope: InitScope) -> &RwLock<Vec<InitializerEntry>> {
        match scope {
            InitScope::Process => &self.process,
            InitScope::Thread => &self.thread,
        }
    }

    /// Register with [`DEFAULT_PRIORITY`].
    pub fn register<F, V>(&self, scope: InitScope, name: impl Into<String>, f: F) -> Result<Option<String>>
    where
        F: Fn() -> Result<V> + Send + Sync + 'static,
        V: Any + Send + Sync,
    {
        self.register_with_priority(scope, name, DEFAULT_PRIORITY, f)
    }

    pub fn register_with_priority<F, V>(
        &self,
        scope: InitScope,
        name: impl Into<String>,
        priority: i32,
        f: F,
    ) -> Result<Option<String>>
    where
        F: Fn() -> Result<V> + Send + Sync + 'static,
        V: Any + Send + Sync,
    {
        self.register_instance(scope, priority, FunctionInstance::new(name, f))
    }

    /// Register a callable without an explicit name; its type name is used.
    pub fn register_unnamed<F, V>(&self, scope: InitScope, priority: i32, f: F) -> Result<Option<String>>
    where
        F: Fn() -> Result<V> + Send + Sync + 'static,
        V: Any + Send + Sync,
    {
        let name = std::any::type_name::<F>();
        self.register_with_priority(scope, name, priority, f)
    }

    /// Returns the name the entry was stored under, or `None` when the
    /// registry's policy ignored a duplicate.
    pub fn register_instance(
        &self,
        scope: InitScope,
        priority: i32,
        instance: FunctionInstance,
    ) -> Result<Option<String>> {
        let mut entries = self.bucket(scope).write();

        let resolution = self
            .policy
            .resolve(|k| entries.iter().any(|e| e.name() == k), instance.name());

        match resolution {
            Resolution::Insert(name) => {
                let entry = InitializerEntry {
                    instance: instance.renamed(name.clone()),
                    priority,
                    scope,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                };
                insert_sorted(&mut entries, entry);
                tracing::debug!(%scope, name = %name, priority, "registered initializer");
                Ok(Some(name))
            }
            Resolution::Replace(name) => {
                // Overwriting keeps the original registration slot.
                let seq = entries
                    .iter()
                    .position(|e| e.name() == name)
                    .map(|idx| entries.remove(idx).seq)
                    .unwrap_or_else(|| self.next_seq.fetch_add(1, Ordering::Relaxed));
                let entry = InitializerEntry {
                    instance: instance.renamed(name.clone()),
                    priority,
                    scope,
                    seq,
                };
                insert_sorted(&mut entries, entry);
                tracing::debug!(%scope, name = %name, priority, "replaced initializer");
                Ok(Some(name))
            }
            Resolution::Skip => {
                tracing::debug!(%scope, name = instance.name(), "ignored duplicate initializer");
                Ok(None)
            }
            Resolution::Reject => Err(Error::DuplicateInitializer {
                name: instance.name().to_string(),
                scope,
            }),
        }
    }

    /// Remove an initializer by name. Returns whether one was removed.
    pub fn deregister(&self, scope: InitScope, name: &str) -> bool {
        let mut entries = self.bucket(scope).write();
        let before = entries.len();
        entries.retain(|e| e.name() != name);
        entries.len() != before
    }

    /// Names in execution order.
    pub fn names(&self, scope: InitScope) -> Vec<String> {
        self.bucket(scope)
            .read()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    pub fn entries(&self, scope: InitScope) -> Vec<InitializerEntry> {
        self.bucket(scope).read().clone()
    }

    pub fn len(&self, scope: InitScope) -> usize {
        self.bucket(scope).read().len()
    }

    pub fn is_empty(&self, scope: InitScope) -> bool {
        self.bucket(scope).read().is_empty()
    }

    pub fn clear(&self, scope: InitScope) {
        self.bucket(scope).write().clear();
    }

    /// Run every initializer of `scope` in order and collect their values.
    ///
    /// Stops at the first failure (error or panic) and reports it as
    /// [`Error::InitializerFailure`]; later initializers do not run.
    pub fn execute_all(&self, scope: InitScope) -> Result<HashMap<String, InitValue>> {
        // Snapshot so initializers run without the lock held.
        let entries: Vec<FunctionInstance> = self
            .bucket(scope)
            .read()
            .iter()
            .map(|e| e.instance.clone())
            .collect();

        let mut results = HashMap::with_capacity(entries.len());

        for instance in entries {
            let name = instance.name().to_string();
            tracing::trace!(%scope, name = %name, "running initializer");

            let message = match capture(|| instance.call()) {
                Ok(Ok(value)) => {
                    results.insert(name, value);
                    continue;
                }
                Ok(Err(err)) => err.to_string(),
                Err(info) => info.to_string(),
            };

            tracing::warn!(%scope, name = %name, error = %message, "initializer failed");
            return Err(Error::InitializerFailure {
                name,
                scope,
                message,
            });
        }

        Ok(results)
    }
}

impl Default for InitializerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn insert_sorted(entries: &mut Vec<InitializerEntry>, entry: InitializerEntry) {
    let key = entry.sort_key();
    let idx = entries.partition_point(|e| e.sort_key() <= key);
    entries.insert(idx, entry);
}
