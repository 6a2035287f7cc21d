//! # Collection Engine
//!
//! Stateful proximity detector that turns position samples into piece
//! collections, exactly once per piece.
//!
//! ## Architecture
//!
//! The engine keeps:
//! - The selected route's pieces, with an R-tree over their coordinates
//! - The collected set (grows only, cleared by [`CollectionEngine::reset`])
//! - The watch state: `Idle`, or `Watching` an active [`PositionWatch`]
//! - Listeners notified of every change
//!
//! All state is mutated from a single event path: the host either calls
//! [`CollectionEngine::on_position`] directly or drains the active watch with
//! [`CollectionEngine::poll`]. Samples are applied in arrival order, so a
//! `reset()` issued between two samples is seen by the second one.

use std::collections::HashSet;
use std::sync::mpsc::TryRecvError;
use std::sync::Mutex;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use rstar::{RTree, RTreeObject, AABB};

use crate::geo_utils::{distance_meters, meters_to_lat_degrees, meters_to_lng_degrees};
use crate::position::{PositionEvent, PositionSample, PositionSource, PositionWatch};
use crate::{Coordinate, Piece, Result, WalkError};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for proximity collection.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct CollectionConfig {
    /// Maximum distance (meters) at which a piece is collected, inclusive.
    /// Default: 30.0 meters
    pub collection_radius_m: f64,

    /// Samples whose fix time is more than this far behind the newest
    /// applied sample are ignored as stale.
    /// Default: 30000 ms
    pub max_sample_age_ms: i64,

    /// Samples with a worse reported accuracy are ignored.
    /// Default: None (accept any accuracy)
    pub max_accuracy_m: Option<f64>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            collection_radius_m: 30.0,
            max_sample_age_ms: 30_000,
            max_accuracy_m: None,
        }
    }
}

impl CollectionConfig {
    /// Reject radii that could never collect anything sensibly.
    pub fn validate(&self) -> Result<()> {
        validate_radius(self.collection_radius_m)?;
        if self.max_sample_age_ms < 0 {
            return Err(WalkError::ConfigError {
                message: format!("max_sample_age_ms must be >= 0, got {}", self.max_sample_age_ms),
            });
        }
        Ok(())
    }
}

fn validate_radius(radius_m: f64) -> Result<()> {
    if !radius_m.is_finite() || radius_m <= 0.0 {
        return Err(WalkError::ConfigError {
            message: format!("collection radius must be a positive number of meters, got {}", radius_m),
        });
    }
    Ok(())
}

// ============================================================================
// Events
// ============================================================================

/// Result of a sample that changed the collected set.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionUpdate {
    /// Pieces collected by this sample, in piece order
    pub newly_collected: Vec<String>,
    /// The full collected set after this sample
    pub collected: HashSet<String>,
    /// Every piece of the route is now collected
    pub completed: bool,
}

/// Change notifications emitted to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    Collected {
        newly_collected: Vec<String>,
        collected: HashSet<String>,
    },
    /// The collected set now equals the full piece set
    Completed,
    Reset,
    /// A transient position failure; collected state is retained
    PositionError(String),
    WatchStarted,
    WatchStopped,
}

/// Token returned by [`CollectionEngine::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&CollectionEvent) + Send>;

// ============================================================================
// Spatial Index
// ============================================================================

/// Piece coordinate wrapper for R-tree indexing
#[derive(Debug, Clone)]
struct PieceEntry {
    index: usize,
    lat: f64,
    lng: f64,
}

impl RTreeObject for PieceEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

enum WatchState {
    Idle,
    Watching(PositionWatch),
}

// ============================================================================
// Collection Engine
// ============================================================================

/// The proximity collection engine.
pub struct CollectionEngine {
    route_id: Option<String>,
    pieces: Vec<Piece>,
    piece_index: RTree<PieceEntry>,
    collected: HashSet<String>,

    config: CollectionConfig,
    state: WatchState,

    listeners: Vec<(ListenerId, Listener)>,
    next_listener_id: u64,

    /// Fix time of the newest applied sample
    newest_sample_ms: Option<i64>,
    /// Bumped on every change to the collected set
    revision: u64,
}

impl CollectionEngine {
    /// Create an idle engine with default configuration.
    pub fn new() -> Self {
        Self {
            route_id: None,
            pieces: Vec::new(),
            piece_index: RTree::new(),
            collected: HashSet::new(),
            config: CollectionConfig::default(),
            state: WatchState::Idle,
            listeners: Vec::new(),
            next_listener_id: 0,
            newest_sample_ms: None,
            revision: 0,
        }
    }

    /// Create an idle engine with custom configuration.
    pub fn with_config(config: CollectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new()
        })
    }

    // ========================================================================
    // Route & Pieces
    // ========================================================================

    /// Select a route for the walk.
    ///
    /// `initial_collected` is the restored progress; ids that do not match a
    /// piece are dropped.
    pub fn select_route(&mut self, route_id: &str, pieces: Vec<Piece>, initial_collected: HashSet<String>) {
        self.route_id = Some(route_id.to_string());
        self.collected = initial_collected;
        self.newest_sample_ms = None;
        self.install_pieces(pieces);
        self.revision += 1;
        info!(
            "[CollectionEngine] Selected route {} ({} pieces, {} already collected)",
            route_id,
            self.pieces.len(),
            self.collected.len()
        );
    }

    /// Deselect the route. Stops any active watch.
    pub fn clear_route(&mut self) {
        self.stop();
        self.route_id = None;
        self.pieces.clear();
        self.piece_index = RTree::new();
        self.collected.clear();
        self.newest_sample_ms = None;
        self.revision += 1;
    }

    /// Replace the piece list (admin edits between samples).
    ///
    /// Collected ids that no longer reference a piece are pruned. If the edit
    /// leaves every remaining piece collected, `Completed` is emitted.
    pub fn set_pieces(&mut self, pieces: Vec<Piece>) {
        let before = self.collected.len();
        let was_complete = self.is_complete();
        self.install_pieces(pieces);

        let complete = self.is_complete();
        if self.collected.len() != before || complete != was_complete {
            self.revision += 1;
        }
        if complete && !was_complete {
            info!("[CollectionEngine] All remaining pieces collected after edit");
            self.emit(CollectionEvent::Completed);
        }
    }

    fn install_pieces(&mut self, pieces: Vec<Piece>) {
        let entries: Vec<PieceEntry> = pieces
            .iter()
            .enumerate()
            .map(|(index, p)| PieceEntry {
                index,
                lat: p.lat,
                lng: p.lng,
            })
            .collect();
        self.piece_index = RTree::bulk_load(entries);

        let ids: HashSet<&str> = pieces.iter().map(|p| p.id.as_str()).collect();
        let before = self.collected.len();
        self.collected.retain(|id| ids.contains(id.as_str()));
        if self.collected.len() != before {
            debug!(
                "[CollectionEngine] Pruned {} stale collected ids",
                before - self.collected.len()
            );
        }
        self.pieces = pieces;
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route_id.as_deref()
    }

    pub fn pieces(&self) -> &[Piece] {
        &self.pieces
    }

    pub fn collected(&self) -> &HashSet<String> {
        &self.collected
    }

    pub fn is_collected(&self, piece_id: &str) -> bool {
        self.collected.contains(piece_id)
    }

    /// (collected, total) piece counts.
    pub fn progress(&self) -> (usize, usize) {
        (self.collected.len(), self.pieces.len())
    }

    /// Every piece of a non-empty route is collected.
    pub fn is_complete(&self) -> bool {
        !self.pieces.is_empty() && self.collected.len() == self.pieces.len()
    }

    /// Counter bumped on every change to the collected set.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    // ========================================================================
    // Collection
    // ========================================================================

    /// Apply a position.
    ///
    /// Every uncollected piece within the collection radius (inclusive) is
    /// collected in one set-union. Returns `None` if nothing changed.
    pub fn on_position(&mut self, pos: &Coordinate) -> Option<CollectionUpdate> {
        let radius = self.config.collection_radius_m;
        let mut qualifying: Vec<&Piece> = self
            .candidate_indices(pos, radius)
            .into_iter()
            .map(|i| &self.pieces[i])
            .filter(|p| !self.collected.contains(&p.id))
            .filter(|p| distance_meters(pos, &p.coordinate()) <= radius)
            .collect();

        if qualifying.is_empty() {
            return None;
        }

        qualifying.sort_by_key(|p| p.order);
        let newly_collected: Vec<String> = qualifying.iter().map(|p| p.id.clone()).collect();

        self.collected.extend(newly_collected.iter().cloned());
        self.revision += 1;

        let completed = self.is_complete();
        info!(
            "[CollectionEngine] Collected {} piece(s), {}/{}",
            newly_collected.len(),
            self.collected.len(),
            self.pieces.len()
        );

        let update = CollectionUpdate {
            newly_collected,
            collected: self.collected.clone(),
            completed,
        };

        self.emit(CollectionEvent::Collected {
            newly_collected: update.newly_collected.clone(),
            collected: update.collected.clone(),
        });
        if completed {
            info!("[CollectionEngine] All pieces collected");
            self.emit(CollectionEvent::Completed);
        }

        Some(update)
    }

    /// Apply a sample from a position source, honouring the staleness and
    /// accuracy filters.
    pub fn on_sample(&mut self, sample: &PositionSample) -> Option<CollectionUpdate> {
        if let (Some(max_accuracy), Some(accuracy)) = (self.config.max_accuracy_m, sample.accuracy_m) {
            if accuracy > max_accuracy {
                debug!(
                    "[CollectionEngine] Ignoring sample with accuracy {:.0}m (max {:.0}m)",
                    accuracy, max_accuracy
                );
                return None;
            }
        }

        if let Some(newest) = self.newest_sample_ms {
            let behind = newest.saturating_sub(sample.timestamp_ms);
            if behind > self.config.max_sample_age_ms {
                debug!(
                    "[CollectionEngine] Ignoring stale sample ({}ms behind newest)",
                    behind
                );
                return None;
            }
        }
        self.newest_sample_ms = Some(
            self.newest_sample_ms
                .map_or(sample.timestamp_ms, |n| n.max(sample.timestamp_ms)),
        );

        self.on_position(&sample.coordinate)
    }

    /// Indices of pieces that may lie within `radius` of `pos`.
    ///
    /// The envelope is conservative, so the haversine check afterwards gives
    /// the same result as testing every piece.
    fn candidate_indices(&self, pos: &Coordinate, radius: f64) -> Vec<usize> {
        let lat_band = meters_to_lat_degrees(radius) * 1.0001 + 1e-9;
        let lng_band = meters_to_lng_degrees(radius, pos.lat).map(|band| band * 1.0001 + 1e-9);

        match lng_band {
            Some(lng_band) if pos.lng - lng_band >= -180.0 && pos.lng + lng_band <= 180.0 => {
                let envelope = AABB::from_corners(
                    [pos.lng - lng_band, pos.lat - lat_band],
                    [pos.lng + lng_band, pos.lat + lat_band],
                );
                self.piece_index
                    .locate_in_envelope_intersecting(&envelope)
                    .map(|entry| entry.index)
                    .collect()
            }
            // Polar or antimeridian neighbourhoods: check every piece
            _ => (0..self.pieces.len()).collect(),
        }
    }

    /// Clear the collected set.
    ///
    /// Hosts that persist progress must save the empty set afterwards
    /// ([`crate::WalkSession::reset`] does this).
    pub fn reset(&mut self) {
        self.collected.clear();
        self.newest_sample_ms = None;
        self.revision += 1;
        info!("[CollectionEngine] Progress reset");
        self.emit(CollectionEvent::Reset);
    }

    // ========================================================================
    // Watching
    // ========================================================================

    /// Start watching a position source (Idle -> Watching).
    ///
    /// Fails with [`WalkError::NoRouteSelected`] or
    /// [`WalkError::PositionUnavailable`] and stays Idle.
    pub fn start(&mut self, source: &mut dyn PositionSource) -> Result<()> {
        if self.route_id.is_none() {
            return Err(WalkError::NoRouteSelected);
        }
        if !source.is_available() {
            return Err(WalkError::PositionUnavailable {
                message: "position source is not available".to_string(),
            });
        }

        let watch = source.watch()?;
        // Release a previous subscription before replacing it
        self.stop();
        self.state = WatchState::Watching(watch);
        info!("[CollectionEngine] Watching positions");
        self.emit(CollectionEvent::WatchStarted);
        Ok(())
    }

    /// Stop watching (Watching -> Idle). No-op when already Idle.
    pub fn stop(&mut self) {
        if let WatchState::Watching(watch) = std::mem::replace(&mut self.state, WatchState::Idle) {
            watch.cancel();
            info!("[CollectionEngine] Stopped watching positions");
            self.emit(CollectionEvent::WatchStopped);
        }
    }

    pub fn is_watching(&self) -> bool {
        matches!(self.state, WatchState::Watching(_))
    }

    /// Drain every queued event of the active watch, in arrival order.
    ///
    /// Errors are reported as [`CollectionEvent::PositionError`]; a stream
    /// that ends returns the engine to Idle. Returns the number of samples
    /// applied.
    pub fn poll(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let next = match &self.state {
                WatchState::Watching(watch) => watch.try_next(),
                WatchState::Idle => break,
            };

            match next {
                Ok(PositionEvent::Sample(sample)) => {
                    self.on_sample(&sample);
                    applied += 1;
                }
                Ok(PositionEvent::Error(message)) => {
                    warn!("[CollectionEngine] Position error: {}", message);
                    self.emit(CollectionEvent::PositionError(message));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("[CollectionEngine] Position stream ended");
                    self.stop();
                    break;
                }
            }
        }
        applied
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Change the collection radius at runtime.
    pub fn set_collection_radius(&mut self, radius_m: f64) -> Result<()> {
        validate_radius(radius_m)?;
        info!("[CollectionEngine] Collection radius set to {:.1}m", radius_m);
        self.config.collection_radius_m = radius_m;
        Ok(())
    }

    pub fn collection_radius(&self) -> f64 {
        self.config.collection_radius_m
    }

    pub fn set_config(&mut self, config: CollectionConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Register a change listener.
    pub fn subscribe<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&CollectionEvent) + Send + 'static,
    {
        self.next_listener_id += 1;
        let id = ListenerId(self.next_listener_id);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: CollectionEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }
}

impl Default for CollectionEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global Singleton
// ============================================================================

/// Global engine instance.
///
/// This singleton allows FFI calls to access a shared engine without
/// passing state back and forth across the FFI boundary.
pub static ENGINE: Lazy<Mutex<CollectionEngine>> = Lazy::new(|| Mutex::new(CollectionEngine::new()));

/// Get a lock on the global engine.
pub fn with_engine<F, R>(f: F) -> R
where
    F: FnOnce(&mut CollectionEngine) -> R,
{
    let mut engine = match ENGINE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut engine)
}

// ============================================================================
// FFI Exports
// ============================================================================

#[cfg(feature = "ffi")]
pub mod engine_ffi {
    use super::*;
    use crate::tiling::{compute_grid, Grid};
    use log::info;

    /// Initialize the engine (call once at app startup).
    #[uniffi::export]
    pub fn walk_init() {
        crate::init_logging();
        info!("[CollectionEngine] Initialized");
    }

    /// Select a route. Pieces are a JSON array of pieces, collected ids the
    /// restored progress. Returns false if the JSON is malformed.
    #[uniffi::export]
    pub fn walk_select_route_json(route_id: String, pieces_json: String, collected_ids: Vec<String>) -> bool {
        match serde_json::from_str::<Vec<Piece>>(&pieces_json) {
            Ok(pieces) => {
                with_engine(|e| e.select_route(&route_id, pieces, collected_ids.into_iter().collect()));
                true
            }
            Err(err) => {
                warn!("[CollectionEngine] Rejected pieces JSON: {}", err);
                false
            }
        }
    }

    /// Replace the piece list of the selected route.
    #[uniffi::export]
    pub fn walk_set_pieces_json(pieces_json: String) -> bool {
        match serde_json::from_str::<Vec<Piece>>(&pieces_json) {
            Ok(pieces) => {
                with_engine(|e| e.set_pieces(pieces));
                true
            }
            Err(err) => {
                warn!("[CollectionEngine] Rejected pieces JSON: {}", err);
                false
            }
        }
    }

    /// Apply a platform location fix. Returns the ids collected by it.
    #[uniffi::export]
    pub fn walk_push_position(lat: f64, lng: f64, accuracy_m: Option<f64>) -> Vec<String> {
        let sample = PositionSample {
            coordinate: Coordinate::new(lat, lng),
            accuracy_m,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        with_engine(|e| e.on_sample(&sample))
            .map(|update| update.newly_collected)
            .unwrap_or_default()
    }

    /// Ids of every collected piece.
    #[uniffi::export]
    pub fn walk_collected_ids() -> Vec<String> {
        with_engine(|e| e.collected().iter().cloned().collect())
    }

    /// Whether every piece is collected.
    #[uniffi::export]
    pub fn walk_is_complete() -> bool {
        with_engine(|e| e.is_complete())
    }

    /// Clear the collected set.
    #[uniffi::export]
    pub fn walk_reset() {
        with_engine(|e| e.reset());
    }

    /// Change the collection radius. Returns false if the radius is invalid.
    #[uniffi::export]
    pub fn walk_set_collection_radius(radius_m: f64) -> bool {
        with_engine(|e| e.set_collection_radius(radius_m)).is_ok()
    }

    /// Grid the puzzle image would be sliced into for a piece count.
    #[uniffi::export]
    pub fn walk_compute_grid(piece_count: u32) -> Grid {
        compute_grid(piece_count as usize)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ChannelPositionSource;
    use std::sync::{Arc, Mutex};

    /// Offset a coordinate north by `meters`.
    fn north_of(origin: Coordinate, meters: f64) -> Coordinate {
        Coordinate::new(origin.lat + meters_to_lat_degrees(meters), origin.lng)
    }

    fn origin() -> Coordinate {
        Coordinate::new(51.5074, -0.1278)
    }

    fn sample_pieces() -> Vec<Piece> {
        vec![
            Piece::new("p1", origin(), 1),
            Piece::new("p2", north_of(origin(), 200.0), 2),
            Piece::new("p3", north_of(origin(), 400.0), 3),
        ]
    }

    fn engine_with_pieces() -> CollectionEngine {
        let mut engine = CollectionEngine::new();
        engine.select_route("route-1", sample_pieces(), HashSet::new());
        engine
    }

    #[test]
    fn test_far_position_collects_nothing() {
        let mut engine = engine_with_pieces();
        assert!(engine.on_position(&north_of(origin(), -1000.0)).is_none());
        assert!(engine.collected().is_empty());
    }

    #[test]
    fn test_collects_within_radius() {
        let mut engine = engine_with_pieces();
        let update = engine.on_position(&north_of(origin(), 10.0)).unwrap();
        assert_eq!(update.newly_collected, vec!["p1".to_string()]);
        assert!(!update.completed);
        assert!(engine.is_collected("p1"));
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let mut engine = engine_with_pieces();
        let pos = north_of(origin(), -50.0);
        let exact = distance_meters(&pos, &origin());
        engine.set_collection_radius(exact).unwrap();

        let update = engine.on_position(&pos);
        assert!(update.is_some());
        assert!(engine.is_collected("p1"));
    }

    #[test]
    fn test_collection_is_idempotent() {
        let mut engine = engine_with_pieces();
        assert!(engine.on_position(&origin()).is_some());
        let revision = engine.revision();
        assert!(engine.on_position(&origin()).is_none());
        assert_eq!(engine.revision(), revision);
        assert_eq!(engine.collected().len(), 1);
    }

    #[test]
    fn test_single_sample_collects_all_qualifying() {
        let mut engine = CollectionEngine::new();
        let pieces = vec![
            Piece::new("b", north_of(origin(), 5.0), 2),
            Piece::new("a", north_of(origin(), -5.0), 1),
            Piece::new("far", north_of(origin(), 500.0), 3),
        ];
        engine.select_route("r", pieces, HashSet::new());

        let update = engine.on_position(&origin()).unwrap();
        assert_eq!(update.newly_collected, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(update.collected.len(), 2);
    }

    #[test]
    fn test_completion_signaled() {
        let mut engine = engine_with_pieces();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        engine.on_position(&origin());
        engine.on_position(&north_of(origin(), 200.0));
        let update = engine.on_position(&north_of(origin(), 400.0)).unwrap();

        assert!(update.completed);
        assert!(engine.is_complete());
        let events = events.lock().unwrap();
        assert_eq!(events.iter().filter(|e| **e == CollectionEvent::Completed).count(), 1);
        assert_eq!(events.last(), Some(&CollectionEvent::Completed));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut engine = engine_with_pieces();
        engine.on_position(&origin());
        engine.reset();
        assert!(engine.collected().is_empty());
        assert_eq!(engine.progress(), (0, 3));

        // Collectable again after reset
        assert!(engine.on_position(&origin()).is_some());
    }

    #[test]
    fn test_select_route_filters_stale_progress() {
        let mut engine = CollectionEngine::new();
        let restored: HashSet<String> = ["p1", "deleted"].iter().map(|s| s.to_string()).collect();
        engine.select_route("route-1", sample_pieces(), restored);
        assert_eq!(engine.collected().len(), 1);
        assert!(engine.is_collected("p1"));
    }

    #[test]
    fn test_set_pieces_prunes_removed() {
        let mut engine = engine_with_pieces();
        engine.on_position(&origin());
        engine.set_pieces(sample_pieces().into_iter().skip(1).collect());
        assert!(engine.collected().is_empty());
        assert_eq!(engine.progress(), (0, 2));
    }

    #[test]
    fn test_removing_last_uncollected_piece_completes() {
        let mut engine = engine_with_pieces();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        engine.subscribe(move |e| sink.lock().unwrap().push(e.clone()));

        engine.on_position(&origin());
        engine.on_position(&north_of(origin(), 200.0));
        let revision = engine.revision();

        engine.set_pieces(sample_pieces().into_iter().take(2).collect());
        assert!(engine.is_complete());
        assert!(engine.revision() > revision);
        assert_eq!(events.lock().unwrap().last(), Some(&CollectionEvent::Completed));

        // Unchanged pieces do not signal again
        engine.set_pieces(sample_pieces().into_iter().take(2).collect());
        let completed = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == CollectionEvent::Completed)
            .count();
        assert_eq!(completed, 1);
    }

    #[test]
    fn test_extreme_timestamps_do_not_overflow() {
        let mut engine = engine_with_pieces();
        assert!(engine.on_sample(&PositionSample::new(north_of(origin(), -1000.0), i64::MAX)).is_none());
        // Far behind the newest fix, treated as stale
        assert!(engine.on_sample(&PositionSample::new(origin(), i64::MIN)).is_none());
        assert!(engine.collected().is_empty());
    }

    #[test]
    fn test_empty_route_never_complete() {
        let mut engine = CollectionEngine::new();
        engine.select_route("r", Vec::new(), HashSet::new());
        assert!(engine.on_position(&origin()).is_none());
        assert!(!engine.is_complete());
    }

    #[test]
    fn test_index_matches_full_scan_near_antimeridian() {
        let mut engine = CollectionEngine::new();
        let west = Coordinate::new(0.0, 179.9999);
        let east = Coordinate::new(0.0, -179.9999);
        engine.select_route("r", vec![Piece::new("east", east, 1)], HashSet::new());
        // ~22m apart across the antimeridian
        assert!(engine.on_position(&west).is_some());
    }

    #[test]
    fn test_invalid_radius_rejected() {
        let mut engine = CollectionEngine::new();
        assert!(matches!(engine.set_collection_radius(0.0), Err(WalkError::ConfigError { .. })));
        assert!(engine.set_collection_radius(f64::NAN).is_err());
        assert_eq!(engine.collection_radius(), 30.0);
        assert!(CollectionEngine::with_config(CollectionConfig {
            collection_radius_m: -1.0,
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_accuracy_and_staleness_filters() {
        let mut engine = CollectionEngine::with_config(CollectionConfig {
            max_accuracy_m: Some(50.0),
            max_sample_age_ms: 1_000,
            ..Default::default()
        })
        .unwrap();
        engine.select_route("route-1", sample_pieces(), HashSet::new());

        let inaccurate = PositionSample::new(origin(), 10_000).with_accuracy(120.0);
        assert!(engine.on_sample(&inaccurate).is_none());

        let newer = PositionSample::new(north_of(origin(), -1000.0), 10_000);
        assert!(engine.on_sample(&newer).is_none());

        let stale = PositionSample::new(origin(), 5_000);
        assert!(engine.on_sample(&stale).is_none());
        assert!(engine.collected().is_empty());

        let fresh = PositionSample::new(origin(), 10_500).with_accuracy(8.0);
        assert!(engine.on_sample(&fresh).is_some());
    }

    #[test]
    fn test_start_requires_route() {
        let (mut source, _feed) = ChannelPositionSource::new();
        let mut engine = CollectionEngine::new();
        assert_eq!(engine.start(&mut source), Err(WalkError::NoRouteSelected));
        assert!(!engine.is_watching());
    }

    #[test]
    fn test_start_requires_available_source() {
        let (mut source, feed) = ChannelPositionSource::new();
        feed.set_available(false);
        let mut engine = engine_with_pieces();
        assert!(matches!(
            engine.start(&mut source),
            Err(WalkError::PositionUnavailable { .. })
        ));
        assert!(!engine.is_watching());
    }

    #[test]
    fn test_watch_poll_stop() {
        let (mut source, feed) = ChannelPositionSource::new();
        let mut engine = engine_with_pieces();
        engine.start(&mut source).unwrap();
        assert!(engine.is_watching());

        feed.push(PositionSample::new(north_of(origin(), -1000.0), 1));
        feed.push_error("temporary signal loss");
        feed.push(PositionSample::new(origin(), 2));

        assert_eq!(engine.poll(), 2);
        assert!(engine.is_collected("p1"));
        assert!(engine.is_watching());

        engine.stop();
        assert!(!engine.is_watching());
        assert!(!feed.has_subscriber());
        // Stopping twice is a no-op
        engine.stop();
        assert_eq!(engine.poll(), 0);
    }

    #[test]
    fn test_position_error_retains_state() {
        let (mut source, feed) = ChannelPositionSource::new();
        let mut engine = engine_with_pieces();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        engine.subscribe(move |e| {
            if let CollectionEvent::PositionError(msg) = e {
                sink.lock().unwrap().push(msg.clone());
            }
        });

        engine.on_position(&origin());
        engine.start(&mut source).unwrap();
        feed.push_error("timeout");
        engine.poll();

        assert_eq!(*errors.lock().unwrap(), vec!["timeout".to_string()]);
        assert!(engine.is_collected("p1"));
        assert!(engine.is_watching());
    }

    #[test]
    fn test_ended_stream_returns_to_idle() {
        let (mut source, feed) = ChannelPositionSource::new();
        let mut engine = engine_with_pieces();
        engine.start(&mut source).unwrap();
        feed.push(PositionSample::new(origin(), 1));
        feed.close();

        assert_eq!(engine.poll(), 1);
        assert!(!engine.is_watching());
        assert!(engine.is_collected("p1"));
    }

    #[test]
    fn test_reset_between_samples_is_observed() {
        let (mut source, feed) = ChannelPositionSource::new();
        let mut engine = engine_with_pieces();
        engine.start(&mut source).unwrap();

        feed.push(PositionSample::new(origin(), 1));
        engine.poll();
        engine.reset();
        feed.push(PositionSample::new(north_of(origin(), 200.0), 2));
        engine.poll();

        let collected: Vec<&String> = engine.collected().iter().collect();
        assert_eq!(collected, vec!["p2"]);
    }

    #[test]
    fn test_unsubscribe() {
        let mut engine = engine_with_pieces();
        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        let id = engine.subscribe(move |_| *sink.lock().unwrap() += 1);

        engine.reset();
        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));
        engine.reset();

        assert_eq!(*count.lock().unwrap(), 1);
    }
}
