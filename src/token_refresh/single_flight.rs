//! Per-connection single-flight coordination
//!
//! At most one refresh runs per connection. The first caller spawns the refresh as
//! its own task; every caller that arrives while it runs awaits the same shared
//! result. The map lock is only taken to look up, insert or remove entries and is
//! never held across an await. Keys with no refresh running and no recorded
//! failure hold no memory.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use serde::Serialize;

use crate::error::RefreshError;
use crate::models::{Connection, ConnectionKey};

type SharedRefresh = Shared<BoxFuture<'static, Result<Connection, RefreshError>>>;

/// Transient refresh state of one connection
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Refreshing {
        started_at: DateTime<Utc>,
    },
    Failed {
        #[serde(serialize_with = "serialize_error")]
        last_error: RefreshError,
        at: DateTime<Utc>,
    },
}

fn serialize_error<S: serde::Serializer>(error: &RefreshError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Whether a caller started the refresh or joined one already running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Joined,
}

struct InFlight {
    started_at: DateTime<Utc>,
    future: SharedRefresh,
}

struct Failure {
    error: RefreshError,
    at: DateTime<Utc>,
}

struct Inner {
    in_flight: HashMap<ConnectionKey, InFlight>,
    failures: LruCache<ConnectionKey, Failure>,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("RefreshCoordinator")
            .field("in_flight", &inner.in_flight.len())
            .field("failures", &inner.failures.len())
            .finish()
    }
}

impl RefreshCoordinator {
    /// Coordinator remembering at most `failure_history` failed keys
    pub fn new(failure_history: usize) -> Self {
        let capacity = NonZeroUsize::new(failure_history).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                in_flight: HashMap::new(),
                failures: LruCache::new(capacity),
            })),
        }
    }

    /// Run `start`'s future for `key` unless a refresh is already in flight, in which
    /// case await that one instead. `start` is only invoked by the leader.
    pub async fn run<F, Fut>(
        &self,
        key: ConnectionKey,
        start: F,
    ) -> (Result<Connection, RefreshError>, FlightRole)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection, RefreshError>> + Send + 'static,
    {
        let (future, role) = {
            let mut inner = self.lock();
            match inner.in_flight.get(&key) {
                Some(flight) => (flight.future.clone(), FlightRole::Joined),
                None => {
                    let future = self.spawn(key.clone(), start());
                    inner.in_flight.insert(
                        key,
                        InFlight {
                            started_at: Utc::now(),
                            future: future.clone(),
                        },
                    );
                    (future, FlightRole::Leader)
                }
            }
        };

        (future.await, role)
    }

    /// Current state of `key`
    pub fn state(&self, key: &ConnectionKey) -> RefreshState {
        let inner = self.lock();
        if let Some(flight) = inner.in_flight.get(key) {
            return RefreshState::Refreshing {
                started_at: flight.started_at,
            };
        }
        match inner.failures.peek(key) {
            Some(failure) => RefreshState::Failed {
                last_error: failure.error.clone(),
                at: failure.at,
            },
            None => RefreshState::Idle,
        }
    }

    /// Number of refreshes currently running
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Spawns the refresh so that a cancelled caller cannot cancel it for the others.
    fn spawn<Fut>(&self, key: ConnectionKey, work: Fut) -> SharedRefresh
    where
        Fut: Future<Output = Result<Connection, RefreshError>> + Send + 'static,
    {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            // Runs if the work panics; the normal path settles explicitly below.
            let cleanup = scopeguard::guard((coordinator, key), |(coordinator, key)| {
                coordinator.lock().in_flight.remove(&key);
            });
            let result = work.await;
            let (coordinator, key) = scopeguard::ScopeGuard::into_inner(cleanup);
            coordinator.settle(&key, &result);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|join_error| Err(RefreshError::Aborted(join_error.to_string())))
        }
        .boxed()
        .shared()
    }

    fn settle(&self, key: &ConnectionKey, result: &Result<Connection, RefreshError>) {
        let mut inner = self.lock();
        inner.in_flight.remove(key);
        match result {
            Ok(_) => {
                inner.failures.pop(key);
            }
            Err(error) => {
                inner.failures.put(
                    key.clone(),
                    Failure {
                        error: error.clone(),
                        at: Utc::now(),
                    },
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
