//! Shared resource pools with blocking, all-or-nothing allocation.
//!
//! A [`ResourcePool`] is a named, ordered set of units (for example a list of
//! test devices or port ranges). Tests request either specific units by name
//! or any `N` free units. Requests that can never be satisfied are rejected
//! up front by [`ResourcePool::check`]; satisfiable requests block in
//! [`ResourcePool::obtain`] until enough units are free.
//!
//! ```text
//!  worker A ──obtain(2)──► [u0 u1 u2] ──► holds u0,u1
//!  worker B ──obtain(2)──► waits on Condvar ...
//!  worker A ──release────► notify_all ──► worker B holds u0,u1 (or u1,u2)
//! ```
//!
//! All state mutation happens under one mutex per pool.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How often a blocked waiter wakes up to observe cancellation.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that can occur when requesting resources.
///
/// The first five variants are *structural*: the request can never succeed
/// against this pool. `Cancelled` and `TimedOut` are raised while waiting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("Unknown resource pool '{0}'")]
    UnknownPool(String),

    #[error("Pool '{pool}' has no unit named '{unit}'")]
    UnknownUnit { pool: String, unit: String },

    #[error("Unit '{unit}' requested more than once from pool '{pool}'")]
    DuplicateUnit { pool: String, unit: String },

    #[error("Requested {requested} units from pool '{pool}' which only has {size}")]
    TooMany {
        pool: String,
        requested: usize,
        size: usize,
    },

    #[error("Invalid request for pool '{pool}': {message}")]
    InvalidRequest { pool: String, message: String },

    #[error("Cancelled while waiting for pool '{0}'")]
    Cancelled(String),

    #[error("Timed out after {waited:?} waiting for pool '{pool}'")]
    TimedOut { pool: String, waited: Duration },
}

impl ResourceError {
    /// Returns true if the request can never be satisfied.
    pub fn is_structural(&self) -> bool {
        !matches!(
            self,
            ResourceError::Cancelled(_) | ResourceError::TimedOut { .. }
        )
    }
}

/// One allocatable unit of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub name: String,
    pub value: Value,
}

impl Unit {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Which units a request wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Selector {
    /// Any `n` currently free units.
    Count(usize),
    /// Exactly these units.
    Names(Vec<String>),
}

/// A test's request against one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRequest {
    pub pool: String,
    pub selector: Selector,
    /// Variable the obtained unit values are bound to.
    pub as_var: String,
}

/// A named pool of units guarded by a mutex and condition variable.
#[derive(Debug)]
pub struct ResourcePool {
    name: String,
    units: Vec<Unit>,
    held: Mutex<Vec<bool>>,
    released: Condvar,
}

impl ResourcePool {
    /// Creates a pool with every unit free.
    pub fn new(name: impl Into<String>, units: Vec<Unit>) -> Self {
        let held = vec![false; units.len()];
        Self {
            name: name.into(),
            units,
            held: Mutex::new(held),
            released: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of units, free or held.
    pub fn size(&self) -> usize {
        self.units.len()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Number of units not currently held.
    pub fn free_count(&self) -> usize {
        self.lock().iter().filter(|held| !**held).count()
    }

    /// Validates a selector against the pool's static shape.
    pub fn check(&self, selector: &Selector) -> Result<(), ResourceError> {
        match selector {
            Selector::Count(0) => Err(ResourceError::InvalidRequest {
                pool: self.name.clone(),
                message: "count must be at least 1".to_string(),
            }),
            Selector::Count(n) if *n > self.units.len() => Err(ResourceError::TooMany {
                pool: self.name.clone(),
                requested: *n,
                size: self.units.len(),
            }),
            Selector::Count(_) => Ok(()),
            Selector::Names(names) => {
                if names.is_empty() {
                    return Err(ResourceError::InvalidRequest {
                        pool: self.name.clone(),
                        message: "names must not be empty".to_string(),
                    });
                }
                let mut seen = HashSet::new();
                for name in names {
                    if !seen.insert(name.as_str()) {
                        return Err(ResourceError::DuplicateUnit {
                            pool: self.name.clone(),
                            unit: name.clone(),
                        });
                    }
                    if self.index_of(name).is_none() {
                        return Err(ResourceError::UnknownUnit {
                            pool: self.name.clone(),
                            unit: name.clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Takes the selected units without waiting, if they are all free.
    pub fn try_obtain(&self, selector: &Selector) -> Result<Option<Vec<Unit>>, ResourceError> {
        self.check(selector)?;
        let mut held = self.lock();
        Ok(self.take(&mut held, selector).map(|indices| self.units_at(&indices)))
    }

    /// Takes the selected units, blocking until they are free.
    ///
    /// Structural errors are returned immediately. While waiting, the call
    /// returns [`ResourceError::Cancelled`] once `cancel` fires and
    /// [`ResourceError::TimedOut`] once `timeout` (if any) elapses.
    pub fn obtain(
        &self,
        selector: &Selector,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<Unit>, ResourceError> {
        self.obtain_indices(selector, cancel, timeout)
            .map(|indices| self.units_at(&indices))
    }

    /// Returns units to the pool and wakes every waiter.
    ///
    /// Units are matched by name; names this pool does not know are ignored.
    pub fn release(&self, units: &[Unit]) {
        let indices: Vec<usize> = units.iter().filter_map(|u| self.index_of(&u.name)).collect();
        self.release_indices(&indices);
    }

    fn obtain_indices(
        &self,
        selector: &Selector,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<usize>, ResourceError> {
        self.check(selector)?;

        let start = Instant::now();
        let mut held = self.lock();
        loop {
            if let Some(indices) = self.take(&mut held, selector) {
                return Ok(indices);
            }
            if cancel.is_cancelled() {
                return Err(ResourceError::Cancelled(self.name.clone()));
            }

            let mut wait = WAIT_POLL_INTERVAL;
            if let Some(limit) = timeout {
                let waited = start.elapsed();
                if waited >= limit {
                    return Err(ResourceError::TimedOut {
                        pool: self.name.clone(),
                        waited,
                    });
                }
                wait = wait.min(limit - waited);
            }

            debug!("Waiting for units of pool '{}'", self.name);
            held = self
                .released
                .wait_timeout(held, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    fn release_indices(&self, indices: &[usize]) {
        let mut held = self.lock();
        for &idx in indices {
            if let Some(slot) = held.get_mut(idx) {
                *slot = false;
            }
        }
        drop(held);
        self.released.notify_all();
    }

    fn take(&self, held: &mut [bool], selector: &Selector) -> Option<Vec<usize>> {
        let indices: Vec<usize> = match selector {
            Selector::Count(n) => {
                let free: Vec<usize> = (0..held.len()).filter(|&i| !held[i]).take(*n).collect();
                if free.len() < *n {
                    return None;
                }
                free
            }
            Selector::Names(names) => {
                let indices: Vec<usize> = names.iter().filter_map(|n| self.index_of(n)).collect();
                if indices.iter().any(|&i| held[i]) {
                    return None;
                }
                indices
            }
        };
        for &i in &indices {
            held[i] = true;
        }
        Some(indices)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.units.iter().position(|u| u.name == name)
    }

    fn units_at(&self, indices: &[usize]) -> Vec<Unit> {
        indices.iter().map(|&i| self.units[i].clone()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<bool>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Units held by a test; returned to their pool when dropped.
#[derive(Debug)]
pub struct ResourceGuard {
    pool: Arc<ResourcePool>,
    indices: Vec<usize>,
    units: Vec<Unit>,
    as_var: String,
}

impl ResourceGuard {
    pub fn pool(&self) -> &str {
        self.pool.name()
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Variable name the units should be bound to.
    pub fn as_var(&self) -> &str {
        &self.as_var
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        debug!(
            "Releasing {} unit(s) of pool '{}'",
            self.indices.len(),
            self.pool.name()
        );
        self.pool.release_indices(&self.indices);
    }
}

/// Every pool of a run, by name.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    pools: BTreeMap<String, Arc<ResourcePool>>,
}

impl ResourceRegistry {
    /// Builds fresh pools (all units free) from their definitions.
    pub fn from_definitions(definitions: &BTreeMap<String, Vec<Unit>>) -> Self {
        let pools = definitions
            .iter()
            .map(|(name, units)| {
                (
                    name.clone(),
                    Arc::new(ResourcePool::new(name.clone(), units.clone())),
                )
            })
            .collect();
        Self { pools }
    }

    pub fn pool(&self, name: &str) -> Result<&Arc<ResourcePool>, ResourceError> {
        self.pools
            .get(name)
            .ok_or_else(|| ResourceError::UnknownPool(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Validates a test's complete set of requests.
    pub fn check(&self, requests: &[ResourceRequest]) -> Result<(), ResourceError> {
        let mut pools = HashSet::new();
        for request in requests {
            if !pools.insert(request.pool.as_str()) {
                return Err(ResourceError::InvalidRequest {
                    pool: request.pool.clone(),
                    message: "pool requested more than once by the same test".to_string(),
                });
            }
            self.pool(&request.pool)?.check(&request.selector)?;
        }
        Ok(())
    }

    /// Obtains every request, in pool-name order, blocking as needed.
    ///
    /// On failure, units already taken are released before returning.
    pub fn obtain_all(
        &self,
        requests: &[ResourceRequest],
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Vec<ResourceGuard>, ResourceError> {
        self.check(requests)?;

        let mut ordered: Vec<&ResourceRequest> = requests.iter().collect();
        ordered.sort_by(|a, b| a.pool.cmp(&b.pool));

        let mut guards = Vec::with_capacity(ordered.len());
        for request in ordered {
            let pool = self.pool(&request.pool)?;
            let indices = pool.obtain_indices(&request.selector, cancel, timeout)?;
            guards.push(ResourceGuard {
                pool: Arc::clone(pool),
                units: pool.units_at(&indices),
                indices,
                as_var: request.as_var.clone(),
            });
        }
        Ok(guards)
    }
}
