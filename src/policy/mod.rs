//! Compiled policy cache with hot reload
//!
//! Wraps a [`FileCache`]: each policy file is compiled on first use and
//! recompiled whenever the file cache hands out different content than the
//! artifact was compiled from. Compilation for a
//! given name happens under that name's slot lock, so reading the file and
//! replacing the compiled artifact never interleave with another reload of
//! the same name.
//!
//! Every module exposes its package through the query `x = data.<package>`;
//! evaluation returns the `x` binding of the first result set.

pub mod engine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::filecache::FileCache;
pub use engine::{Bindings, PolicyEngine, PreparedQuery, RegorusEngine};

/// Variable every policy query binds its package document to
pub const RESULT_BINDING: &str = "x";

/// Evaluates a named policy against a JSON input
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Validator: Send + Sync {
    /// Result document of policy `name`, `None` when the policy is absent or
    /// produced no result
    async fn validate(&self, name: &str, input: Value) -> Result<Option<Value>>;
}

/// A policy file compiled into a prepared query
#[derive(Clone)]
pub struct CompiledPolicy {
    /// File name the policy was loaded from
    pub name: String,
    /// Package declared by the source
    pub package: String,
    source: Arc<[u8]>,
    query: Arc<dyn PreparedQuery>,
}

impl std::fmt::Debug for CompiledPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPolicy")
            .field("name", &self.name)
            .field("package", &self.package)
            .finish_non_exhaustive()
    }
}

type Slot = Arc<Mutex<Option<CompiledPolicy>>>;

struct Inner {
    files: FileCache,
    engine: Arc<dyn PolicyEngine>,
    slots: Mutex<HashMap<String, Slot>>,
    entry_policy: String,
    ready: AtomicBool,
    debug: bool,
}

/// Shared handle to the compiled policies
#[derive(Clone)]
pub struct PolicyCache {
    inner: Arc<Inner>,
}

impl PolicyCache {
    /// Create a cache compiling files from `files` with `engine`
    ///
    /// `entry_policy` names the file that gates [`PolicyCache::ready`]. With
    /// `debug` set, every evaluation logs its input and result.
    pub fn new(
        files: FileCache,
        engine: Arc<dyn PolicyEngine>,
        entry_policy: impl Into<String>,
        debug: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                files,
                engine,
                slots: Mutex::new(HashMap::new()),
                entry_policy: entry_policy.into(),
                ready: AtomicBool::new(false),
                debug,
            }),
        }
    }

    /// Name of the policy evaluated per request
    pub fn entry_policy(&self) -> &str {
        &self.inner.entry_policy
    }

    /// Whether the entry policy has compiled at least once
    pub fn ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    /// Names of the currently compiled policies, sorted
    pub fn info(&self) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .inner
            .slots
            .lock()
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();

        let mut names: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    /// Compiled policy for `name`, compiling it if the file changed
    ///
    /// Returns `Ok(None)` when the file does not exist; any previously
    /// compiled artifact for it is dropped.
    pub fn get_rego(&self, name: &str) -> Result<Option<CompiledPolicy>> {
        let slot = self.slot(name);
        let mut compiled = slot.lock();

        let lookup = self.inner.files.get(name)?;
        let Some(data) = lookup.data else {
            if compiled.take().is_some() {
                info!(policy = %name, "policy removed");
            }
            return Ok(None);
        };

        if let Some(policy) = compiled.as_ref() {
            if Arc::ptr_eq(&policy.source, &data) {
                return Ok(Some(policy.clone()));
            }
        }

        // A failed compile must not leave the previous version serving.
        *compiled = None;

        let source = std::str::from_utf8(&data).map_err(|e| Error::PolicyCompile {
            name: name.to_string(),
            reason: format!("source is not valid UTF-8: {e}"),
        })?;
        let package = extract_package(source).ok_or_else(|| Error::PolicyCompile {
            name: name.to_string(),
            reason: "no package declaration found".into(),
        })?;

        let query = format!("{RESULT_BINDING} = data.{package}");
        let prepared = self.inner.engine.prepare(&query, name, source)?;

        let policy = CompiledPolicy {
            name: name.to_string(),
            package: package.to_string(),
            source: Arc::clone(&data),
            query: prepared,
        };
        *compiled = Some(policy.clone());

        if name == self.inner.entry_policy {
            self.inner.ready.store(true, Ordering::Release);
        }
        info!(policy = %name, package = %package, "policy compiled");
        Ok(Some(policy))
    }

    /// Blocking evaluation of policy `name`
    #[instrument(skip(self, input), fields(policy = %name))]
    pub fn evaluate(&self, name: &str, input: &Value) -> Result<Option<Value>> {
        let Some(policy) = self.get_rego(name)? else {
            warn!("policy not found");
            return Ok(None);
        };

        if self.inner.debug {
            debug!(input = %input, "policy input");
        }

        let result = policy
            .query
            .eval(input)?
            .into_iter()
            .next()
            .and_then(|mut bindings| bindings.remove(RESULT_BINDING));

        if self.inner.debug {
            match &result {
                Some(result) => debug!(result = %result, "policy result"),
                None => debug!("policy produced no result"),
            }
        }
        Ok(result)
    }

    /// Compile every existing policy file and recompile on change
    pub fn watch(&self) -> Result<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.files.add_callback(Arc::new(move |name: &str| {
            if let Some(inner) = weak.upgrade() {
                PolicyCache { inner }.reload(name);
            }
        }));
        self.inner.files.watch()
    }

    /// Stop following policy changes
    pub fn close(&self) {
        self.inner.files.close();
    }

    fn reload(&self, name: &str) {
        info!(policy = %name, "policy change detected, reloading");
        match self.get_rego(name) {
            Ok(Some(_)) => {}
            Ok(None) => debug!(policy = %name, "policy no longer present"),
            Err(e) => error!(policy = %name, error = %e, "policy reload failed"),
        }
    }

    fn slot(&self, name: &str) -> Slot {
        Arc::clone(
            self.inner
                .slots
                .lock()
                .entry(name.to_string())
                .or_default(),
        )
    }
}

#[async_trait]
impl Validator for PolicyCache {
    async fn validate(&self, name: &str, input: Value) -> Result<Option<Value>> {
        let cache = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || cache.evaluate(&name, &input))
            .await
            .map_err(|e| Error::Internal(format!("policy evaluation task failed: {e}")))?
    }
}

/// Package declared by the first `package` line of `source`
pub fn extract_package(source: &str) -> Option<&str> {
    source
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("package "))
        .map(str::trim)
        .filter(|package| !package.is_empty())
}
