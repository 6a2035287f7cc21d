//! Walk session: the collection engine, progress sync and puzzle tiler
//! working together for one device.
//!
//! The session owns the local state. Every change to the collected set is
//! written through the [`ProgressSync`]; write failures are queued as
//! [`SessionEvent::SyncFailed`] and never roll back local progress.
//!
//! Events queue until the host calls [`WalkSession::take_events`]. The queue
//! holds at most [`MAX_QUEUED_EVENTS`]; older events are dropped first.

use std::collections::{HashSet, VecDeque};

use log::{debug, info, warn};

use crate::collection::{CollectionConfig, CollectionEngine};
use crate::identity::DeviceIdentityProvider;
use crate::position::{PositionSample, PositionSource};
use crate::progress::ProgressSync;
use crate::store::RemoteStore;
use crate::tiling::{
    assign_fragments, compose_reveal, Fragment, FragmentAssignment, PuzzleTiler, SliceKey, SourceImage,
};
use crate::{Result, Route, WalkError};

pub const MAX_QUEUED_EVENTS: usize = 256;

/// Things the host should surface to the walker or operator.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Progress was written to the store
    ProgressSaved {
        collected: usize,
        total: usize,
        completed: bool,
    },
    /// The store already held newer progress for this device; nothing was written
    ProgressSuperseded { collected: usize, total: usize },
    /// Reading or writing progress failed; local state is unchanged
    SyncFailed(WalkError),
    /// Grid and piece count disagree after tiling
    FragmentMismatch(FragmentAssignment),
}

pub struct WalkSession<S: RemoteStore> {
    engine: CollectionEngine,
    sync: ProgressSync<S>,
    device_id: String,
    route: Option<Route>,
    tiler: PuzzleTiler,
    image: Option<SourceImage>,
    /// Tiling whose fragments are currently assigned to the pieces
    applied_key: Option<SliceKey>,
    persisted_revision: u64,
    events: VecDeque<SessionEvent>,
}

impl<S: RemoteStore> WalkSession<S> {
    pub fn new(store: S, identity: &dyn DeviceIdentityProvider) -> Result<Self> {
        Self::with_config(store, identity, CollectionConfig::default())
    }

    pub fn with_config(
        store: S,
        identity: &dyn DeviceIdentityProvider,
        config: CollectionConfig,
    ) -> Result<Self> {
        let device_id = identity.device_id()?;
        let engine = CollectionEngine::with_config(config)?;
        Ok(Self {
            persisted_revision: engine.revision(),
            engine,
            sync: ProgressSync::new(store),
            device_id,
            route: None,
            tiler: PuzzleTiler::new(),
            image: None,
            applied_key: None,
            events: VecDeque::new(),
        })
    }

    // ========================================================================
    // Route Selection
    // ========================================================================

    /// Load a route with its pieces and restore this device's progress.
    ///
    /// Stops any active walk. If progress cannot be read the walk starts
    /// empty and a `SyncFailed` event is queued.
    pub fn select_route(&mut self, route_id: &str) -> Result<()> {
        let store = self.sync.store();
        let mut route = store.select_route(route_id)?.ok_or(WalkError::NoRouteSelected)?;
        route.pieces = store.select_pieces(route_id)?;

        let restored = match self.sync.load(route_id, &self.device_id, &route.piece_ids()) {
            Ok(ids) => ids,
            Err(e) => {
                warn!("[WalkSession] Could not restore progress for {}: {}", route_id, e);
                self.push_event(SessionEvent::SyncFailed(e));
                HashSet::new()
            }
        };

        self.engine.stop();
        self.engine.select_route(route_id, route.pieces.clone(), restored);
        self.persisted_revision = self.engine.revision();
        self.image = None;
        self.applied_key = None;
        self.route = Some(route);

        info!(
            "[WalkSession] Route {} ready for device {}",
            route_id, self.device_id
        );
        Ok(())
    }

    /// Re-read the route's pieces after admin edits.
    ///
    /// Collected ids of removed pieces are pruned. With an image attached the
    /// fragments are reassigned by order, and the image is re-sliced if the
    /// piece count changed.
    pub fn reload_pieces(&mut self) -> Result<()> {
        let Some(route_id) = self.route.as_ref().map(|r| r.id.clone()) else {
            return Err(WalkError::NoRouteSelected);
        };
        let pieces = self.sync.store().select_pieces(&route_id)?;
        if let Some(route) = self.route.as_mut() {
            route.pieces = pieces.clone();
        }
        self.engine.set_pieces(pieces);
        if self.image.is_some() {
            self.retile()?;
        }
        self.persist_if_changed();
        Ok(())
    }

    /// Attach the route's puzzle image and slice it for the current pieces.
    ///
    /// On failure the previous image and fragments stay in place.
    pub fn set_puzzle_image(&mut self, image: SourceImage) -> Result<()> {
        if self.route.is_none() {
            return Err(WalkError::NoRouteSelected);
        }
        let previous = self.image.replace(image);
        if let Err(e) = self.retile() {
            self.image = previous;
            return Err(e);
        }
        Ok(())
    }

    fn retile(&mut self) -> Result<()> {
        let (Some(route), Some(image)) = (self.route.as_mut(), self.image.as_ref()) else {
            return Ok(());
        };
        // The tiler only re-slices when the key changes; assignment always runs
        let outcome = self.tiler.tile(image, route.pieces.len())?;
        let assignment = assign_fragments(&mut route.pieces, &outcome.fragments);
        route.grid = Some(outcome.key.grid);
        self.engine.set_pieces(route.pieces.clone());

        let new_key = self.applied_key.as_ref() != Some(&outcome.key);
        self.applied_key = Some(outcome.key);
        if new_key && !assignment.is_consistent() {
            self.push_event(SessionEvent::FragmentMismatch(assignment));
        }
        Ok(())
    }

    // ========================================================================
    // Walking
    // ========================================================================

    pub fn start(&mut self, source: &mut dyn PositionSource) -> Result<()> {
        self.engine.start(source)
    }

    pub fn stop(&mut self) {
        self.engine.stop();
        self.persist_if_changed();
    }

    /// Apply queued positions and persist the result. Returns samples applied.
    pub fn poll(&mut self) -> usize {
        let applied = self.engine.poll();
        self.persist_if_changed();
        applied
    }

    /// Apply a single sample directly (hosts without a watch).
    pub fn on_sample(&mut self, sample: &PositionSample) {
        self.engine.on_sample(sample);
        self.persist_if_changed();
    }

    /// Clear the collected set locally and in the store.
    pub fn reset(&mut self) {
        self.engine.reset();
        self.persist_if_changed();
    }

    fn persist_if_changed(&mut self) {
        if self.engine.revision() == self.persisted_revision {
            return;
        }
        self.persisted_revision = self.engine.revision();
        let Some(route_id) = self.engine.route_id() else {
            return;
        };

        let (collected, total) = self.engine.progress();
        match self
            .sync
            .save(route_id, &self.device_id, self.engine.collected(), total)
        {
            Ok(saved) if saved.applied => self.push_event(SessionEvent::ProgressSaved {
                collected,
                total,
                completed: saved.record.is_complete(),
            }),
            Ok(_) => self.push_event(SessionEvent::ProgressSuperseded { collected, total }),
            Err(e) => {
                warn!("[WalkSession] Progress not saved: {}", e);
                self.push_event(SessionEvent::SyncFailed(e));
            }
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.len() == MAX_QUEUED_EVENTS {
            self.events.pop_front();
            debug!("[WalkSession] Event queue full, dropped oldest event");
        }
        self.events.push_back(event);
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn engine(&self) -> &CollectionEngine {
        &self.engine
    }

    /// Engine access for listener registration and runtime tuning.
    pub fn engine_mut(&mut self) -> &mut CollectionEngine {
        &mut self.engine
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn store(&self) -> &S {
        self.sync.store()
    }

    /// Drain queued session events.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    /// Fragments whose piece has been collected, in fragment order.
    ///
    /// Empty until an image is attached to the selected route.
    pub fn revealed_fragments(&self) -> Vec<&Fragment> {
        let Some(fragments) = self.applied_fragments() else {
            return Vec::new();
        };
        let revealed = self.revealed_orders();
        fragments
            .iter()
            .filter(|f| revealed.contains(&f.index))
            .collect()
    }

    /// The puzzle with uncollected cells masked, as PNG.
    pub fn reveal_preview(&self) -> Result<Vec<u8>> {
        let image = self.image.as_ref().ok_or_else(|| WalkError::ImageLoadFailed {
            message: "no puzzle image attached".to_string(),
        })?;
        let grid = self
            .applied_key
            .as_ref()
            .map(|key| key.grid)
            .ok_or_else(|| WalkError::ImageLoadFailed {
                message: "puzzle image has not been sliced".to_string(),
            })?;
        compose_reveal(&image.decode()?, grid, &self.revealed_orders())
    }

    /// The tiler's fragments, if they belong to this route's current image.
    fn applied_fragments(&self) -> Option<&[Fragment]> {
        self.image.as_ref()?;
        let key = self.applied_key.as_ref()?;
        if self.tiler.current_key() != Some(key) {
            return None;
        }
        self.tiler.current_fragments()
    }

    fn revealed_orders(&self) -> HashSet<u32> {
        self.engine
            .pieces()
            .iter()
            .filter(|p| self.engine.is_collected(&p.id))
            .map(|p| p.order)
            .collect()
    }
}
