//! # Puzzle Walk
//!
//! GPS-anchored puzzle collection for walking routes.
//!
//! An admin places puzzle pieces along a route; a walker collects them by
//! physical proximity and the route's puzzle image is revealed fragment by
//! fragment as pieces are gathered.
//!
//! This library provides:
//! - Haversine distance math ([`geo_utils`])
//! - A proximity collection engine with at-most-once semantics ([`collection`])
//! - Deterministic image tiling keyed to piece order ([`tiling`])
//! - Progress persistence per (route, device) pair ([`progress`], [`store`])
//!
//! ## Features
//!
//! - **`parallel`** - Encode puzzle fragments in parallel with rayon
//! - **`persistence`** - SQLite-backed remote store
//! - **`http`** - REST-backed remote store
//! - **`ffi`** - Enable FFI bindings for mobile platforms (iOS/Android)
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use puzzle_walk::{CollectionEngine, Coordinate, Route};
//!
//! let mut route = Route::new("route-1", "Harbour loop", Coordinate::new(51.5074, -0.1278), 500.0);
//! route.add_piece(Coordinate::new(51.5074, -0.1278));
//! route.add_piece(Coordinate::new(51.5090, -0.1300));
//!
//! let mut engine = CollectionEngine::new();
//! engine.select_route(&route.id, route.pieces.clone(), Default::default());
//!
//! let update = engine.on_position(&Coordinate::new(51.5074, -0.1278));
//! assert_eq!(update.map(|u| u.newly_collected.len()), Some(1));
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, WalkError};

// Geographic utilities (distance, framing)
pub mod geo_utils;
pub use geo_utils::distance_meters;

// Position sources and cancellable watches
pub mod position;
pub use position::{
    ChannelPositionSource, PositionEvent, PositionFeed, PositionSample, PositionSource,
    PositionWatch,
};

// Proximity collection engine (singleton-capable, like the rest of the state)
pub mod collection;
pub use collection::{
    with_engine, CollectionConfig, CollectionEngine, CollectionEvent, CollectionUpdate,
    ListenerId, ENGINE,
};

// Image tiling: grid policy, slicing, fragment assignment
pub mod tiling;
pub use tiling::{
    assign_fragments, compose_reveal, compute_grid, slice, Fragment, FragmentAssignment, Grid,
    PuzzleTiler, SliceKey, SourceImage, TileConfig, TileOutcome,
};

// Remote store abstraction and in-memory implementation
pub mod store;
pub use store::{publish_route, MemoryStore, RemoteStore};

// Progress synchronizer
pub mod progress;
pub use progress::{is_valid_piece_id, ProgressRecord, ProgressSync, SavedProgress};

// Device identity provider
pub mod identity;
pub use identity::{DeviceIdentityProvider, FileDeviceIdentity, StaticDeviceIdentity};

// Walk session (engine + synchronizer + tiler composition)
pub mod session;
pub use session::{SessionEvent, WalkSession};

// Human-readable route export/import
pub mod export;
pub use export::{export_route, import_route, ImportedRoute, RouteExport};

// SQLite-backed store
#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "persistence")]
pub use persistence::SqliteStore;

// REST-backed store
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{RestConfig, RestStore};

#[cfg(feature = "ffi")]
uniffi::setup_scaffolding!();

/// Initialize logging for Android (only used in FFI)
#[cfg(all(feature = "ffi", target_os = "android"))]
pub(crate) fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("PuzzleWalkRust"),
    );
}

#[cfg(all(feature = "ffi", not(target_os = "android")))]
pub(crate) fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate in degrees.
///
/// # Example
/// ```
/// use puzzle_walk::Coordinate;
/// let point = Coordinate::new(51.5074, -0.1278); // London
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    /// Create a new coordinate.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check if the coordinate is finite and within WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lng >= -180.0
            && self.lng <= 180.0
    }
}

/// A GPS-anchored collectible unit tied to one image fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Piece {
    /// Opaque unique token (UUID for pieces placed through [`Route::add_piece`])
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    /// 1-based display/slice order; fragment index = order - 1
    pub order: u32,
    /// Reference to the assigned fragment image, if any
    pub image_fragment_url: Option<String>,
}

impl Piece {
    /// Create a piece without a fragment.
    pub fn new(id: impl Into<String>, coordinate: Coordinate, order: u32) -> Self {
        Self {
            id: id.into(),
            lat: coordinate.lat,
            lng: coordinate.lng,
            order,
            image_fragment_url: None,
        }
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }
}

/// A walking route with its pieces.
///
/// `center` and `radius_m` are descriptive (map framing only); they do not
/// bound where pieces can be collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub name: String,
    pub center: Coordinate,
    pub radius_m: f64,
    /// Reference to the source puzzle image (storage key or URL)
    #[serde(default)]
    pub puzzle_image_ref: Option<String>,
    /// Grid the puzzle image was last sliced with
    #[serde(default)]
    pub grid: Option<tiling::Grid>,
    /// Pieces are stored and transported separately from the route record
    #[serde(skip)]
    pub pieces: Vec<Piece>,
}

impl Route {
    /// Create an empty route.
    pub fn new(id: impl Into<String>, name: impl Into<String>, center: Coordinate, radius_m: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            center,
            radius_m,
            puzzle_image_ref: None,
            grid: None,
            pieces: Vec::new(),
        }
    }

    /// Place a new piece at the given coordinate.
    ///
    /// The piece gets a fresh UUID and is appended at the end of the order.
    pub fn add_piece(&mut self, coordinate: Coordinate) -> &Piece {
        self.renumber_pieces();
        let order = self.pieces.len() as u32 + 1;
        self.pieces
            .push(Piece::new(Uuid::new_v4().to_string(), coordinate, order));
        &self.pieces[self.pieces.len() - 1]
    }

    /// Delete a piece. Remaining pieces are renumbered densely.
    ///
    /// Returns false if no piece had the given id.
    pub fn remove_piece(&mut self, piece_id: &str) -> bool {
        let before = self.pieces.len();
        self.pieces.retain(|p| p.id != piece_id);
        if self.pieces.len() == before {
            return false;
        }
        self.renumber_pieces();
        true
    }

    /// Reassign orders densely (1..N), keeping the current relative order.
    /// Ties are broken by id so the result is deterministic.
    pub fn renumber_pieces(&mut self) {
        self.pieces
            .sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        for (i, piece) in self.pieces.iter_mut().enumerate() {
            piece.order = i as u32 + 1;
        }
    }

    /// Ids of the current pieces (the valid set for progress restore).
    pub fn piece_ids(&self) -> std::collections::HashSet<String> {
        self.pieces.iter().map(|p| p.id.clone()).collect()
    }

    /// Recompute the descriptive center and radius from the piece positions.
    ///
    /// The radius covers the farthest piece plus `padding_m`.
    /// No-op for a route without pieces.
    pub fn frame_pieces(&mut self, padding_m: f64) {
        let coords: Vec<Coordinate> = self.pieces.iter().map(|p| p.coordinate()).collect();
        if let Some(center) = geo_utils::bounding_center(&coords) {
            let farthest = coords
                .iter()
                .map(|c| distance_meters(&center, c))
                .fold(0.0, f64::max);
            self.center = center;
            self.radius_m = farthest + padding_m.max(0.0);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_route() -> Route {
        let mut route = Route::new("route-1", "Test", Coordinate::new(51.5074, -0.1278), 100.0);
        route.add_piece(Coordinate::new(51.5074, -0.1278));
        route.add_piece(Coordinate::new(51.5080, -0.1290));
        route.add_piece(Coordinate::new(51.5090, -0.1300));
        route
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(51.5074, -0.1278).is_valid());
        assert!(!Coordinate::new(91.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, 181.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_add_piece_assigns_next_order() {
        let route = sample_route();
        let orders: Vec<u32> = route.pieces.iter().map(|p| p.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(route.pieces.iter().all(|p| is_valid_piece_id(&p.id)));
    }

    #[test]
    fn test_remove_piece_renumbers_densely() {
        let mut route = sample_route();
        let middle = route.pieces[1].id.clone();
        let last = route.pieces[2].id.clone();

        assert!(route.remove_piece(&middle));
        assert!(!route.remove_piece(&middle));

        assert_eq!(route.pieces.len(), 2);
        assert_eq!(route.pieces[1].id, last);
        assert_eq!(route.pieces[1].order, 2);
    }

    #[test]
    fn test_renumber_fills_gaps() {
        let mut route = Route::new("r", "R", Coordinate::new(0.0, 0.0), 10.0);
        route.pieces.push(Piece::new("b", Coordinate::new(0.0, 0.0), 7));
        route.pieces.push(Piece::new("a", Coordinate::new(0.0, 0.0), 3));
        route.pieces.push(Piece::new("c", Coordinate::new(0.0, 0.0), 7));
        route.renumber_pieces();

        let ids: Vec<&str> = route.pieces.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let orders: Vec<u32> = route.pieces.iter().map(|p| p.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn test_frame_pieces() {
        let mut route = sample_route();
        route.center = Coordinate::new(0.0, 0.0);
        route.frame_pieces(25.0);

        assert!((route.center.lat - 51.5082).abs() < 1e-9);
        assert!((route.center.lng - (-0.1289)).abs() < 1e-9);
        assert!(route.radius_m > 25.0);
        for piece in &route.pieces {
            assert!(distance_meters(&route.center, &piece.coordinate()) <= route.radius_m);
        }
    }

    #[test]
    fn test_frame_pieces_empty_route_is_noop() {
        let mut route = Route::new("r", "R", Coordinate::new(1.0, 2.0), 10.0);
        route.frame_pieces(25.0);
        assert_eq!(route.center, Coordinate::new(1.0, 2.0));
        assert_eq!(route.radius_m, 10.0);
    }
}
