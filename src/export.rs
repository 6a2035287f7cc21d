//! Human-readable route export and import.
//!
//! A route travels as pretty-printed JSON holding the route record, its
//! pieces, the grid and the puzzle image as base64. Import validates the
//! whole document before producing anything.

use std::collections::HashSet;

use base64::Engine;
use log::info;
use serde::{Deserialize, Serialize};

use crate::tiling::{Grid, SourceImage};
use crate::{Piece, Result, Route, WalkError};

/// Current export document version.
pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteExport {
    pub version: u32,
    pub route: Route,
    pub pieces: Vec<Piece>,
    /// Source image bytes, base64 (standard alphabet)
    #[serde(default)]
    pub puzzle_image: Option<String>,
    #[serde(default)]
    pub grid: Option<Grid>,
}

/// A validated import.
#[derive(Debug, Clone)]
pub struct ImportedRoute {
    /// Route with its pieces attached, ordered 1..N
    pub route: Route,
    pub puzzle_image: Option<SourceImage>,
}

/// Serialize a route, its pieces and optional puzzle image.
pub fn export_route(route: &Route, puzzle_image: Option<&SourceImage>) -> Result<String> {
    let mut pieces = route.pieces.clone();
    pieces.sort_by_key(|p| p.order);

    let document = RouteExport {
        version: EXPORT_VERSION,
        route: route.clone(),
        pieces,
        puzzle_image: puzzle_image
            .map(|image| base64::engine::general_purpose::STANDARD.encode(image.bytes())),
        grid: route.grid,
    };

    serde_json::to_string_pretty(&document).map_err(|e| WalkError::Internal {
        message: format!("Failed to serialize route: {}", e),
    })
}

fn invalid(message: impl Into<String>) -> WalkError {
    WalkError::InvalidImport {
        message: message.into(),
    }
}

/// Parse and validate an export document.
///
/// Any problem yields `InvalidImport`; nothing is returned partially.
pub fn import_route(json: &str) -> Result<ImportedRoute> {
    let document: RouteExport =
        serde_json::from_str(json).map_err(|e| invalid(format!("malformed document: {}", e)))?;

    if document.version != EXPORT_VERSION {
        return Err(invalid(format!("unsupported version {}", document.version)));
    }
    if document.route.id.trim().is_empty() {
        return Err(invalid("route id is empty"));
    }
    if !document.route.center.is_valid() {
        return Err(invalid("route center is not a valid coordinate"));
    }

    let mut pieces = document.pieces;
    pieces.sort_by_key(|p| p.order);

    let mut seen = HashSet::new();
    for (i, piece) in pieces.iter().enumerate() {
        if piece.id.is_empty() || !seen.insert(piece.id.as_str()) {
            return Err(invalid(format!("duplicate or empty piece id {:?}", piece.id)));
        }
        if piece.order != i as u32 + 1 {
            return Err(invalid("piece orders must be 1..N without gaps"));
        }
        if !piece.coordinate().is_valid() {
            return Err(invalid(format!("piece {} has an invalid coordinate", piece.id)));
        }
    }

    if let Some(grid) = document.grid {
        if grid.cols == 0 || (grid.rows == 0 && !pieces.is_empty()) {
            return Err(invalid(format!("grid {}x{} holds no fragments", grid.cols, grid.rows)));
        }
    }

    let puzzle_image = match document.puzzle_image {
        Some(encoded) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| invalid(format!("puzzle image is not valid base64: {}", e)))?;
            Some(SourceImage::from_bytes(bytes))
        }
        None => None,
    };

    let mut route = document.route;
    route.grid = document.grid;
    route.pieces = pieces;

    info!(
        "[RouteExport] Imported route {} ({} pieces, image: {})",
        route.id,
        route.pieces.len(),
        puzzle_image.is_some()
    );
    Ok(ImportedRoute { route, puzzle_image })
}
