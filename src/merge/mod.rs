//! Merge engine: fan a record out into independent sub-fetches and fan
//! them back into one emission.
//!
//! A record-producing crawl can issue any number of concurrent sub-fetches
//! (product page, reviews, pricing API). Each is registered under its merge
//! fingerprint; as completions resolve, the pending set shrinks, and the
//! record is emitted downstream exactly once, when the set empties. One
//! engine serves one job execution.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::fetch::{FetchError, FetchRequest};
use crate::record::{ProductRecord, SharedRecord};

#[derive(Debug, Error)]
pub enum MergeError {
    /// The pending set must never grow again after reaching zero. Hitting
    /// this means a sub-fetch was issued against an already-emitted record.
    #[error("Merge group {0} was already emitted")]
    GroupAlreadyEmitted(Uuid),
    #[error("Request carries no merge metadata")]
    NotMergeRequest,
}

#[derive(Debug)]
struct GroupState {
    record: SharedRecord,
    pending: HashSet<String>,
}

/// Per-job merge bookkeeping.
#[derive(Debug, Default)]
pub struct MergeEngine {
    groups: Mutex<HashMap<Uuid, GroupState>>,
    emitted: Mutex<HashSet<Uuid>>,
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sub-fetch before dispatching it.
    ///
    /// Creates the group's bookkeeping on first use and adds the fetch's
    /// merge fingerprint to the pending set. Non-merge requests are
    /// rejected; callers only register bound fetches.
    pub async fn register(&self, request: &FetchRequest) -> Result<(), MergeError> {
        let meta = request.merge.as_ref().ok_or(MergeError::NotMergeRequest)?;

        if self.emitted.lock().await.contains(&meta.group_id) {
            tracing::error!(
                group = %meta.group_id,
                url = %request.url,
                "Sub-fetch registered against an already-emitted record"
            );
            return Err(MergeError::GroupAlreadyEmitted(meta.group_id));
        }

        let fingerprint = request.merge_fingerprint();
        let mut groups = self.groups.lock().await;
        let group = groups.entry(meta.group_id).or_insert_with(|| {
            tracing::debug!(group = %meta.group_id, "Creating merge group");
            GroupState {
                record: meta.record.clone(),
                pending: HashSet::new(),
            }
        });
        tracing::debug!(group = %meta.group_id, %fingerprint, "Registering sub-fetch");
        group.pending.insert(fingerprint);
        Ok(())
    }

    /// Resolve a completed sub-fetch.
    ///
    /// Removes the fetch's fingerprint from its group's pending set. If the
    /// set is now empty, the record is emitted: a snapshot is returned and
    /// the group's bookkeeping discarded. Non-merge requests pass through
    /// unaffected (`None`).
    pub async fn resolve(&self, request: &FetchRequest) -> Option<ProductRecord> {
        let meta = request.merge.as_ref()?;
        let fingerprint = request.merge_fingerprint();

        let record = {
            let mut groups = self.groups.lock().await;
            let Some(group) = groups.get_mut(&meta.group_id) else {
                tracing::warn!(
                    group = %meta.group_id,
                    url = %request.url,
                    "Resolving sub-fetch for unknown merge group"
                );
                return None;
            };
            if !group.pending.remove(&fingerprint) {
                tracing::warn!(
                    group = %meta.group_id,
                    %fingerprint,
                    "Resolved fingerprint was not pending"
                );
            }
            if !group.pending.is_empty() {
                return None;
            }
            let group = groups.remove(&meta.group_id)?;
            group.record
        };

        self.emitted.lock().await.insert(meta.group_id);
        let snapshot = record.lock().await.clone();
        tracing::debug!(group = %meta.group_id, "Merge group complete, emitting record");
        Some(snapshot)
    }

    /// Handle a sub-fetch that failed at the transport layer.
    ///
    /// Only the record's initial fetch may propagate the error and fail the
    /// whole record. Later sub-fetch failures are swallowed (logged) and
    /// the fetch resolved, so one optional enrichment fetch cannot sink an
    /// otherwise-complete record. Non-merge requests propagate unchanged.
    pub async fn abandon_on_http_error(
        &self,
        request: &FetchRequest,
        error: FetchError,
    ) -> Result<Option<ProductRecord>, FetchError> {
        match &request.merge {
            Some(meta) if !meta.initial => {
                tracing::warn!(
                    group = %meta.group_id,
                    url = %request.url,
                    "Swallowing non-initial sub-fetch failure: {}",
                    error
                );
                Ok(self.resolve(request).await)
            }
            _ => Err(error),
        }
    }

    /// Number of groups still awaiting sub-fetches.
    pub async fn open_groups(&self) -> usize {
        self.groups.lock().await.len()
    }

    /// Log any unfinished groups as leaked work. Called on job teardown.
    pub async fn shutdown(&self) {
        let mut groups = self.groups.lock().await;
        for (group_id, state) in groups.drain() {
            tracing::warn!(
                group = %group_id,
                pending = state.pending.len(),
                "Merge group leaked at shutdown; record was never emitted"
            );
        }
    }
}
