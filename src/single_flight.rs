//! Single-flight load collapser.
//!
//! At most one computation runs per key: the first caller installs a shared
//! future, every concurrent caller for the same key awaits that same future
//! and observes the same bytes or the same error. The entry is removed when
//! the computation settles, whatever the outcome, so a later call starts
//! fresh and a returned `None` or an error is never sticky.
//!
//! The map holds weak handles. If every waiter is cancelled the computation
//! is dropped with them, and the dead entry is replaced on the next call.

use crate::error::CacheError;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, Shared, WeakShared};
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Serialized outcome shared between collapsed waiters.
pub(crate) type FlightOutput = Result<Option<Bytes>, CacheError>;

type Flight = Shared<BoxFuture<'static, FlightOutput>>;

pub(crate) struct SingleFlight {
    inflight: Arc<DashMap<String, WeakShared<BoxFuture<'static, FlightOutput>>>>,
}

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
        }
    }

    /// Number of keys currently in flight.
    pub(crate) fn len(&self) -> usize {
        self.inflight.len()
    }

    /// Join the in-flight computation for `key`, or start `make()` as the
    /// new one.
    pub(crate) async fn run<F, Fut>(&self, key: &str, make: F) -> FlightOutput
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = FlightOutput> + Send + 'static,
    {
        let flight = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => match occupied.get().upgrade() {
                Some(existing) => existing,
                // Every previous waiter was cancelled; start over.
                None => {
                    let fresh = self.install(key, make());
                    if let Some(weak) = fresh.downgrade() {
                        occupied.insert(weak);
                    }
                    fresh
                }
            },
            Entry::Vacant(vacant) => {
                let fresh = self.install(key, make());
                if let Some(weak) = fresh.downgrade() {
                    vacant.insert(weak);
                }
                fresh
            }
        };

        flight.await
    }

    /// Wrap the computation so it unregisters itself once it settles. The
    /// removal runs inside the single execution, while the entry still maps
    /// to this flight, so it can never unregister a successor.
    fn install<Fut>(&self, key: &str, computation: Fut) -> Flight
    where
        Fut: Future<Output = FlightOutput> + Send + 'static,
    {
        let map = Arc::clone(&self.inflight);
        let key = key.to_string();
        async move {
            let result = computation.await;
            map.remove(&key);
            result
        }
        .boxed()
        .shared()
    }
}
