//! Remote store abstraction.
//!
//! The core only needs upsert-by-key, select-by-key and ordered
//! select-by-parent over three record kinds: routes, pieces and progress.
//! [`MemoryStore`] is the always-available implementation; SQLite and REST
//! backends live behind the `persistence` and `http` features.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};

use crate::progress::ProgressRecord;
use crate::{Piece, Result, Route, WalkError};

/// Backing store for routes, pieces and per-device progress.
///
/// Calls are synchronous; async backends block on their own runtime.
pub trait RemoteStore {
    /// Insert or replace a route record. `route.pieces` is not stored.
    fn upsert_route(&self, route: &Route) -> Result<()>;

    /// Fetch a route record (without pieces).
    fn select_route(&self, route_id: &str) -> Result<Option<Route>>;

    /// Insert or replace a piece of a route, keyed by piece id.
    fn upsert_piece(&self, route_id: &str, piece: &Piece) -> Result<()>;

    /// Remove a piece. Missing pieces are not an error.
    fn delete_piece(&self, route_id: &str, piece_id: &str) -> Result<()>;

    /// Pieces of a route ordered by `order`.
    fn select_pieces(&self, route_id: &str) -> Result<Vec<Piece>>;

    /// Upsert keyed by (route, device).
    ///
    /// Returns false, without writing, when the stored record has a newer
    /// `updated_at` than `record`.
    fn upsert_progress(&self, record: &ProgressRecord) -> Result<bool>;

    fn select_progress(&self, route_id: &str, device_id: &str) -> Result<Option<ProgressRecord>>;
}

impl<S: RemoteStore + ?Sized> RemoteStore for Arc<S> {
    fn upsert_route(&self, route: &Route) -> Result<()> {
        (**self).upsert_route(route)
    }

    fn select_route(&self, route_id: &str) -> Result<Option<Route>> {
        (**self).select_route(route_id)
    }

    fn upsert_piece(&self, route_id: &str, piece: &Piece) -> Result<()> {
        (**self).upsert_piece(route_id, piece)
    }

    fn delete_piece(&self, route_id: &str, piece_id: &str) -> Result<()> {
        (**self).delete_piece(route_id, piece_id)
    }

    fn select_pieces(&self, route_id: &str) -> Result<Vec<Piece>> {
        (**self).select_pieces(route_id)
    }

    fn upsert_progress(&self, record: &ProgressRecord) -> Result<bool> {
        (**self).upsert_progress(record)
    }

    fn select_progress(&self, route_id: &str, device_id: &str) -> Result<Option<ProgressRecord>> {
        (**self).select_progress(route_id, device_id)
    }
}

/// Write a route and its pieces, deleting stored pieces no longer on the route.
///
/// Progress records are left alone; stale ids are pruned when progress is loaded.
pub fn publish_route<S: RemoteStore + ?Sized>(store: &S, route: &Route) -> Result<()> {
    store.upsert_route(route)?;
    for piece in &route.pieces {
        store.upsert_piece(&route.id, piece)?;
    }

    let current = route.piece_ids();
    let stored = store.select_pieces(&route.id)?;
    let mut removed = 0;
    for piece in stored.iter().filter(|p| !current.contains(&p.id)) {
        store.delete_piece(&route.id, &piece.id)?;
        removed += 1;
    }

    info!(
        "[RemoteStore] Published route {} ({} pieces, {} removed)",
        route.id,
        route.pieces.len(),
        removed
    );
    Ok(())
}

// ============================================================================
// In-memory Store
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    routes: HashMap<String, Route>,
    /// route id -> piece id -> piece
    pieces: HashMap<String, HashMap<String, Piece>>,
    progress: HashMap<(String, String), ProgressRecord>,
    fail_writes: bool,
    fail_reads: bool,
}

/// Process-local store. Used by tests and offline hosts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `RemoteWriteFailed`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Make every subsequent read fail with `RemoteReadFailed`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Number of stored progress records.
    pub fn progress_count(&self) -> usize {
        self.lock().progress.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn writable(&self) -> Result<MutexGuard<'_, Tables>> {
        let tables = self.lock();
        if tables.fail_writes {
            return Err(WalkError::remote_write("memory store is refusing writes"));
        }
        Ok(tables)
    }

    fn readable(&self) -> Result<MutexGuard<'_, Tables>> {
        let tables = self.lock();
        if tables.fail_reads {
            return Err(WalkError::remote_read("memory store is refusing reads"));
        }
        Ok(tables)
    }
}

impl RemoteStore for MemoryStore {
    fn upsert_route(&self, route: &Route) -> Result<()> {
        let mut stored = route.clone();
        stored.pieces.clear();
        self.writable()?.routes.insert(route.id.clone(), stored);
        Ok(())
    }

    fn select_route(&self, route_id: &str) -> Result<Option<Route>> {
        Ok(self.readable()?.routes.get(route_id).cloned())
    }

    fn upsert_piece(&self, route_id: &str, piece: &Piece) -> Result<()> {
        self.writable()?
            .pieces
            .entry(route_id.to_string())
            .or_default()
            .insert(piece.id.clone(), piece.clone());
        Ok(())
    }

    fn delete_piece(&self, route_id: &str, piece_id: &str) -> Result<()> {
        if let Some(pieces) = self.writable()?.pieces.get_mut(route_id) {
            pieces.remove(piece_id);
        }
        Ok(())
    }

    fn select_pieces(&self, route_id: &str) -> Result<Vec<Piece>> {
        let tables = self.readable()?;
        let mut pieces: Vec<Piece> = tables
            .pieces
            .get(route_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default();
        pieces.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        Ok(pieces)
    }

    fn upsert_progress(&self, record: &ProgressRecord) -> Result<bool> {
        let mut tables = self.writable()?;
        let key = (record.route_id.clone(), record.device_id.clone());
        if let Some(existing) = tables.progress.get(&key) {
            if existing.updated_at > record.updated_at {
                debug!(
                    "[RemoteStore] Ignoring stale progress for {}/{}",
                    record.route_id, record.device_id
                );
                return Ok(false);
            }
        }
        tables.progress.insert(key, record.clone());
        Ok(true)
    }

    fn select_progress(&self, route_id: &str, device_id: &str) -> Result<Option<ProgressRecord>> {
        Ok(self
            .readable()?
            .progress
            .get(&(route_id.to_string(), device_id.to_string()))
            .cloned())
    }
}

// ============================================================================
// Tests
// ============================================================================
