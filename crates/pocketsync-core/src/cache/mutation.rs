//! Optimistic mutations with rollback.
//!
//! Each mutation moves through `Issued -> Applied -> Committed | RolledBack`.
//! The optimistic value is written to the store before the remote write
//! starts, so subscribers see the change immediately. Mutations of the same
//! key are queued: the next one snapshots the store only after the previous
//! one has committed or rolled back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use super::clock::Clock;
use super::collaborators::RemoteWriter;
use super::dedup::RequestDeduplicator;
use super::error::CacheError;
use super::invalidation::InvalidationGraph;
use super::keys::CacheKey;
use super::store::{EntrySnapshot, EntryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Issued,
    Applied,
    Committed,
    RolledBack,
}

/// A pending write, alive until the remote operation settles.
#[derive(Debug, Clone)]
pub struct MutationIntent<V> {
    pub key: CacheKey,
    /// Name of the remote operation, for logs and errors.
    pub operation: String,
    /// Store state right before the optimistic write.
    pub previous: EntrySnapshot<V>,
    pub optimistic: V,
}

#[derive(Debug, Clone)]
pub struct MutationOutcome<V> {
    /// Value held by the store after commit.
    pub value: V,
    /// Keys resolved by the invalidation graph and marked stale.
    pub invalidated: Vec<CacheKey>,
}

pub struct MutationCoordinator<V> {
    store: Arc<EntryStore<V>>,
    dedup: Arc<RequestDeduplicator<V>>,
    graph: InvalidationGraph,
    clock: Arc<dyn Clock>,
    queues: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl<V> MutationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<EntryStore<V>>,
        dedup: Arc<RequestDeduplicator<V>>,
        graph: InvalidationGraph,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dedup,
            graph,
            clock,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue_for(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.queues().entry(key.clone()).or_default())
    }

    /// Drop the queue for `key` once nobody else holds or waits on it.
    fn release_queue(&self, key: &CacheKey, queue: Arc<tokio::sync::Mutex<()>>) {
        let mut queues = self.queues();
        let idle = queues
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, &queue) && Arc::strong_count(&queue) == 2);
        if idle {
            queues.remove(key);
        }
    }

    /// Apply `apply` optimistically to `key`, then persist it with `writer`.
    ///
    /// `apply` receives the current value (if any) and returns the value to
    /// show until the backend answers. On failure the entry is restored to
    /// its exact previous state and no dependent key is touched.
    pub async fn mutate<F>(
        &self,
        key: &CacheKey,
        operation: &str,
        apply: F,
        writer: &dyn RemoteWriter<V>,
    ) -> Result<MutationOutcome<V>, CacheError>
    where
        F: FnOnce(Option<&V>) -> V + Send,
    {
        let queue = self.queue_for(key);
        let turn = Arc::clone(&queue).lock_owned().await;
        let result = self.mutate_in_turn(key, operation, apply, writer).await;
        drop(turn);
        self.release_queue(key, queue);
        result
    }

    async fn mutate_in_turn<F>(
        &self,
        key: &CacheKey,
        operation: &str,
        apply: F,
        writer: &dyn RemoteWriter<V>,
    ) -> Result<MutationOutcome<V>, CacheError>
    where
        F: FnOnce(Option<&V>) -> V + Send,
    {
        let generation = self.store.generation();

        let previous = self.store.get(key);
        let optimistic = apply(previous.value.as_ref());
        let intent = MutationIntent {
            key: key.clone(),
            operation: operation.to_string(),
            previous,
            optimistic,
        };
        debug!(key = %key, operation, phase = ?MutationPhase::Issued, "Mutation issued");

        self.store.write(key, intent.optimistic.clone(), self.clock.now());
        debug!(key = %key, operation, phase = ?MutationPhase::Applied, "Optimistic value applied");

        let result = writer.write(&intent).await;
        let disposed = self.store.generation() != generation;

        match result {
            Ok(authoritative) => {
                if disposed {
                    debug!(key = %key, operation, "Cache disposed during mutation, skipping commit");
                    return Ok(MutationOutcome {
                        value: authoritative.unwrap_or(intent.optimistic),
                        invalidated: Vec::new(),
                    });
                }

                let value = match authoritative {
                    Some(value) => {
                        self.store.write(key, value.clone(), self.clock.now());
                        value
                    }
                    None => intent.optimistic,
                };

                let known = self.store.keys();
                let invalidated: Vec<CacheKey> = self.graph.on_committed(key, &known).into_iter().collect();
                for dependent in &invalidated {
                    self.store.mark_stale(dependent);
                }

                info!(
                    key = %key,
                    operation,
                    phase = ?MutationPhase::Committed,
                    invalidated = invalidated.len(),
                    "Mutation committed"
                );
                Ok(MutationOutcome { value, invalidated })
            }
            Err(e) => {
                if !disposed {
                    let fetch_pending = self.dedup.is_pending(key);
                    self.store.restore(key, &intent.previous, fetch_pending);
                }
                warn!(
                    key = %key,
                    operation,
                    phase = ?MutationPhase::RolledBack,
                    error = %e,
                    "Mutation failed, rolled back"
                );
                Err(CacheError::MutationFailure {
                    key: key.clone(),
                    operation: intent.operation,
                    source: Arc::new(e),
                })
            }
        }
    }

    /// Drop the per-key queues. Mutations already waiting keep their turn.
    pub fn clear(&self) {
        self.queues().clear();
    }
}
