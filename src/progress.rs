//! Progress persistence per (route, device) pair.
//!
//! Saving filters the collected set down to well-formed piece ids and stamps
//! completion and update times. Loading intersects the stored set with the
//! route's current pieces, so progress survives pieces being added or
//! removed between sessions.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::RemoteStore;
use crate::Result;

/// Persisted progress of one device on one route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub route_id: String,
    pub device_id: String,
    pub collected_ids: Vec<String>,
    /// Set iff every piece was collected at save time
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Result of a save: the record that was built and whether the store took it.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedProgress {
    pub record: ProgressRecord,
    /// False when a newer record was already stored and the write was skipped
    pub applied: bool,
}

/// Whether an id has the shape of a piece identifier (a UUID).
///
/// Legacy or malformed ids fail this check and are never persisted.
pub fn is_valid_piece_id(id: &str) -> bool {
    Uuid::parse_str(id).is_ok()
}

/// Saves and restores collected sets through a [`RemoteStore`].
pub struct ProgressSync<S: RemoteStore> {
    store: S,
}

impl<S: RemoteStore> ProgressSync<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persist `collected` for (route, device), stamped with the current time.
    ///
    /// `piece_count` is the route's current number of pieces; the record is
    /// marked complete when every one of them is in the saved set.
    pub fn save(
        &self,
        route_id: &str,
        device_id: &str,
        collected: &HashSet<String>,
        piece_count: usize,
    ) -> Result<SavedProgress> {
        self.save_at(route_id, device_id, collected, piece_count, Utc::now())
    }

    /// [`save`](Self::save) with an explicit update time.
    pub fn save_at(
        &self,
        route_id: &str,
        device_id: &str,
        collected: &HashSet<String>,
        piece_count: usize,
        now: DateTime<Utc>,
    ) -> Result<SavedProgress> {
        let mut collected_ids: Vec<String> = collected
            .iter()
            .filter(|id| is_valid_piece_id(id))
            .cloned()
            .collect();
        collected_ids.sort();

        let dropped = collected.len() - collected_ids.len();
        if dropped > 0 {
            debug!("[ProgressSync] Dropped {} malformed piece id(s)", dropped);
        }

        let complete = piece_count > 0 && collected_ids.len() == piece_count;
        let record = ProgressRecord {
            route_id: route_id.to_string(),
            device_id: device_id.to_string(),
            collected_ids,
            completed_at: complete.then_some(now),
            updated_at: now,
        };

        let applied = self.store.upsert_progress(&record)?;
        if applied {
            debug!(
                "[ProgressSync] Saved {}/{} pieces for {}/{}",
                record.collected_ids.len(),
                piece_count,
                route_id,
                device_id
            );
        } else {
            warn!(
                "[ProgressSync] Newer progress already stored for {}/{}, write skipped",
                route_id, device_id
            );
        }
        Ok(SavedProgress { record, applied })
    }

    /// Restore the collected set for (route, device), limited to `valid_piece_ids`.
    pub fn load(
        &self,
        route_id: &str,
        device_id: &str,
        valid_piece_ids: &HashSet<String>,
    ) -> Result<HashSet<String>> {
        let Some(record) = self.store.select_progress(route_id, device_id)? else {
            return Ok(HashSet::new());
        };

        let stored = record.collected_ids.len();
        let restored: HashSet<String> = record
            .collected_ids
            .into_iter()
            .filter(|id| valid_piece_ids.contains(id))
            .collect();

        info!(
            "[ProgressSync] Restored {} piece(s) for {}/{} ({} stale)",
            restored.len(),
            route_id,
            device_id,
            stored - restored.len()
        );
        Ok(restored)
    }
}
