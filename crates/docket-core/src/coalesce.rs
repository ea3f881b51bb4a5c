//! Collapses identical in-flight queries of one session into one execution.

use crate::error::Result;
use crate::value::{Parameters, Row};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::debug;

/// SQL text plus its bound parameters. The digest is computed on first use
/// and never recomputed.
#[derive(Debug, Clone)]
pub struct QueryKey {
    sql: String,
    params: Parameters,
    digest: OnceLock<u64>,
}

impl QueryKey {
    pub fn new(sql: impl Into<String>, params: Parameters) -> Self {
        Self {
            sql: sql.into(),
            params,
            digest: OnceLock::new(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    fn digest(&self) -> u64 {
        *self.digest.get_or_init(|| {
            let mut h = DefaultHasher::new();
            self.sql.hash(&mut h);
            self.params.hash(&mut h);
            h.finish()
        })
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest() == other.digest() && self.sql == other.sql && self.params == other.params
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.digest());
    }
}

type Shared = Arc<OnceCell<Arc<Vec<Row>>>>;

#[derive(Default)]
pub struct QueryCoalescer {
    inflight: Mutex<HashMap<QueryKey, Shared>>,
}

impl QueryCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `run` unless an identical query is already in flight, in which
    /// case wait for and share its result.
    pub async fn produce<F, Fut>(&self, key: QueryKey, run: F) -> Result<Arc<Vec<Row>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Row>>>,
    {
        let (cell, _leader) = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(cell) => {
                    debug!(sql = key.sql(), "coalesced query");
                    (cell.clone(), None)
                }
                None => {
                    let cell = Shared::default();
                    inflight.insert(key.clone(), cell.clone());
                    (
                        cell.clone(),
                        Some(Leader {
                            coalescer: self,
                            key,
                            cell,
                        }),
                    )
                }
            }
        };
        cell.get_or_try_init(|| async { run().await.map(Arc::new) })
            .await
            .cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Forget every entry; called when the owning session commits or closes.
    pub fn clear(&self) {
        self.inflight.lock().clear();
    }
}

/// Removes the entry of the caller that created it, even if that caller is
/// dropped before its query finishes. An entry inserted by a later leader
/// after a `clear` is left alone.
struct Leader<'a> {
    coalescer: &'a QueryCoalescer,
    key: QueryKey,
    cell: Shared,
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        let mut inflight = self.coalescer.inflight.lock();
        if inflight
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.cell))
        {
            inflight.remove(&self.key);
        }
    }
}
