//! Puzzle image tiling.
//!
//! Cuts a source image into a `cols x rows` grid of equally sized fragments
//! and hands fragment `k` (row-major, 0-based) to the piece with
//! `order == k + 1`. Tiling is memoized on a [`SliceKey`] so the same
//! (image, piece count, grid) is never sliced twice.

use std::collections::HashSet;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use log::{info, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::{Piece, Result, WalkError};

/// Color used to mask cells whose piece has not been collected yet
const MASK_COLOR: [u8; 4] = [128, 128, 128, 255];

// ============================================================================
// Grid Policy
// ============================================================================

/// Partition of the puzzle image into fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Grid {
    pub cols: u32,
    pub rows: u32,
}

impl Grid {
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }

    /// Number of fragments the grid produces.
    pub fn cell_count(&self) -> u32 {
        self.cols * self.rows
    }
}

/// Grid for a piece count: `cols = ceil(sqrt(max(1, n)))`, `rows = ceil(n / cols)`.
///
/// Always `cols * rows >= n`; the layout is as square as possible and
/// leans wider when it cannot be square.
///
/// # Example
/// ```
/// use puzzle_walk::{compute_grid, Grid};
///
/// assert_eq!(compute_grid(9), Grid::new(3, 3));
/// assert_eq!(compute_grid(10), Grid::new(4, 3));
/// ```
pub fn compute_grid(piece_count: usize) -> Grid {
    let n = piece_count.max(1) as u64;

    // Integer ceil(sqrt(n)), corrected for float rounding
    let mut cols = (n as f64).sqrt().ceil() as u64;
    while cols > 1 && (cols - 1) * (cols - 1) >= n {
        cols -= 1;
    }
    while cols * cols < n {
        cols += 1;
    }

    let rows = (piece_count as u64 + cols - 1) / cols;
    Grid::new(cols as u32, rows as u32)
}

// ============================================================================
// Source Images & Fragments
// ============================================================================

/// A user-supplied puzzle image, identified by the SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    identity: String,
    bytes: Arc<Vec<u8>>,
}

impl SourceImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let digest = Sha256::digest(&bytes);
        let identity = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self {
            identity,
            bytes: Arc::new(bytes),
        }
    }

    /// Read an image file. I/O failures surface as `ImageLoadFailed`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| WalkError::ImageLoadFailed {
            message: format!("{}: {}", path.display(), e),
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Content hash used as the image identity in slice keys.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn decode(&self) -> Result<DynamicImage> {
        image::load_from_memory(&self.bytes).map_err(|e| WalkError::ImageDecodeFailed {
            message: e.to_string(),
        })
    }
}

/// One cell of the sliced image, encoded as a standalone PNG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 1-based row-major position; matches the order of its piece
    pub index: u32,
    pub width: u32,
    pub height: u32,
    pub png: Vec<u8>,
}

impl Fragment {
    /// The fragment as a `data:` URL, usable as a piece's fragment reference.
    pub fn data_url(&self) -> String {
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.png)
        )
    }
}

fn encode_png(img: &RgbaImage) -> Result<Vec<u8>> {
    let mut png = Vec::new();
    img.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| WalkError::ImageEncodeFailed {
            message: e.to_string(),
        })?;
    Ok(png)
}

/// Cell size of a grid over an image. Remainder pixels are dropped.
fn cell_size(width: u32, height: u32, grid: Grid) -> Result<(u32, u32)> {
    let tile_w = width / grid.cols;
    let tile_h = height / grid.rows;
    if tile_w == 0 || tile_h == 0 {
        return Err(WalkError::ImageLoadFailed {
            message: format!(
                "image {}x{} is too small for a {}x{} grid",
                width, height, grid.cols, grid.rows
            ),
        });
    }
    Ok((tile_w, tile_h))
}

/// Slice an image into `grid.cols * grid.rows` fragments in row-major order.
///
/// Cells are `floor(width / cols) x floor(height / rows)`; pixels beyond the
/// last full cell are dropped. Either every fragment is produced or an error
/// is returned.
pub fn slice(image: &DynamicImage, grid: Grid) -> Result<Vec<Fragment>> {
    if grid.cell_count() == 0 {
        return Ok(Vec::new());
    }

    let (width, height) = image.dimensions();
    let (tile_w, tile_h) = cell_size(width, height, grid)?;
    let rgba = image.to_rgba8();

    let cut = |k: u32| -> Result<Fragment> {
        let col = k % grid.cols;
        let row = k / grid.cols;
        let cell = image::imageops::crop_imm(&rgba, col * tile_w, row * tile_h, tile_w, tile_h).to_image();
        Ok(Fragment {
            index: k + 1,
            width: tile_w,
            height: tile_h,
            png: encode_png(&cell)?,
        })
    };

    #[cfg(feature = "parallel")]
    let fragments: Result<Vec<Fragment>> = (0..grid.cell_count()).into_par_iter().map(cut).collect();

    #[cfg(not(feature = "parallel"))]
    let fragments: Result<Vec<Fragment>> = (0..grid.cell_count()).map(cut).collect();

    fragments
}

// ============================================================================
// Fragment Assignment & Reveal
// ============================================================================

/// Outcome of handing fragments to pieces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentAssignment {
    /// Pieces that received a fragment
    pub assigned: usize,
    /// Fragment indices no piece maps to (grid larger than piece count)
    pub unused_fragments: Vec<u32>,
    /// Pieces whose order has no fragment; their reference is cleared
    pub pieces_without_fragment: Vec<String>,
}

impl FragmentAssignment {
    /// Grid and piece count line up exactly.
    pub fn is_consistent(&self) -> bool {
        self.unused_fragments.is_empty() && self.pieces_without_fragment.is_empty()
    }
}

/// Set each piece's fragment reference to the fragment at `order - 1`.
///
/// Mismatches are reported, not corrected.
pub fn assign_fragments(pieces: &mut [Piece], fragments: &[Fragment]) -> FragmentAssignment {
    let mut assignment = FragmentAssignment::default();
    let mut used: HashSet<u32> = HashSet::new();

    for piece in pieces.iter_mut() {
        let fragment = piece
            .order
            .checked_sub(1)
            .and_then(|k| fragments.get(k as usize));
        match fragment {
            Some(fragment) => {
                piece.image_fragment_url = Some(fragment.data_url());
                used.insert(fragment.index);
                assignment.assigned += 1;
            }
            None => {
                piece.image_fragment_url = None;
                assignment.pieces_without_fragment.push(piece.id.clone());
            }
        }
    }

    assignment.unused_fragments = fragments
        .iter()
        .map(|f| f.index)
        .filter(|index| !used.contains(index))
        .collect();

    if !assignment.is_consistent() {
        warn!(
            "[PuzzleTiler] {} fragment(s) unused, {} piece(s) without fragment",
            assignment.unused_fragments.len(),
            assignment.pieces_without_fragment.len()
        );
    }
    assignment
}

/// Render the puzzle with every unrevealed cell masked, as PNG.
///
/// `revealed` holds the 1-based orders whose piece is collected.
pub fn compose_reveal(image: &DynamicImage, grid: Grid, revealed: &HashSet<u32>) -> Result<Vec<u8>> {
    let mut canvas = image.to_rgba8();
    if grid.cell_count() > 0 {
        let (tile_w, tile_h) = cell_size(canvas.width(), canvas.height(), grid)?;
        for k in 0..grid.cell_count() {
            if revealed.contains(&(k + 1)) {
                continue;
            }
            let x0 = (k % grid.cols) * tile_w;
            let y0 = (k / grid.cols) * tile_h;
            for y in y0..y0 + tile_h {
                for x in x0..x0 + tile_w {
                    canvas.put_pixel(x, y, Rgba(MASK_COLOR));
                }
            }
        }
    }
    encode_png(&canvas)
}

// ============================================================================
// Memoized Tiler
// ============================================================================

/// Configuration for the tiler.
#[derive(Debug, Clone)]
pub struct TileConfig {
    /// Number of fragment sets kept for recently used slice keys.
    /// Default: 8
    pub cache_capacity: usize,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self { cache_capacity: 8 }
    }
}

/// Cache key for a tiling: (image identity, piece count, grid).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SliceKey {
    pub image_identity: String,
    pub piece_count: usize,
    pub grid: Grid,
}

/// Result of [`PuzzleTiler::tile`].
#[derive(Debug, Clone)]
pub struct TileOutcome {
    pub key: SliceKey,
    pub fragments: Arc<Vec<Fragment>>,
    /// False when the fragments came from the cache
    pub recomputed: bool,
}

/// Slices puzzle images on demand, memoized by [`SliceKey`].
pub struct PuzzleTiler {
    cache: LruCache<SliceKey, Arc<Vec<Fragment>>>,
    current: Option<(SliceKey, Arc<Vec<Fragment>>)>,
    slices_computed: u64,
}

impl PuzzleTiler {
    pub fn new() -> Self {
        Self::with_config(TileConfig::default())
    }

    pub fn with_config(config: TileConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            current: None,
            slices_computed: 0,
        }
    }

    /// Fragments for `image` at `piece_count`, slicing only if this slice key
    /// has not been computed yet.
    ///
    /// On failure the current fragment set is left untouched.
    pub fn tile(&mut self, image: &SourceImage, piece_count: usize) -> Result<TileOutcome> {
        let key = SliceKey {
            image_identity: image.identity().to_string(),
            piece_count,
            grid: compute_grid(piece_count),
        };

        if let Some((current_key, fragments)) = &self.current {
            if *current_key == key {
                return Ok(TileOutcome {
                    key,
                    fragments: Arc::clone(fragments),
                    recomputed: false,
                });
            }
        }

        if let Some(fragments) = self.cache.get(&key).cloned() {
            info!(
                "[PuzzleTiler] Reusing cached {}x{} tiling",
                key.grid.cols, key.grid.rows
            );
            self.current = Some((key.clone(), Arc::clone(&fragments)));
            return Ok(TileOutcome {
                key,
                fragments,
                recomputed: false,
            });
        }

        let decoded = image.decode()?;
        let fragments = Arc::new(slice(&decoded, key.grid)?);
        self.slices_computed += 1;
        info!(
            "[PuzzleTiler] Sliced {}x{} image into {}x{} grid ({} fragments, {} pieces)",
            decoded.width(),
            decoded.height(),
            key.grid.cols,
            key.grid.rows,
            fragments.len(),
            piece_count
        );

        self.cache.put(key.clone(), Arc::clone(&fragments));
        self.current = Some((key.clone(), Arc::clone(&fragments)));
        Ok(TileOutcome {
            key,
            fragments,
            recomputed: true,
        })
    }

    /// Fragments of the most recent successful tiling.
    pub fn current_fragments(&self) -> Option<&[Fragment]> {
        self.current.as_ref().map(|(_, fragments)| fragments.as_slice())
    }

    pub fn current_key(&self) -> Option<&SliceKey> {
        self.current.as_ref().map(|(key, _)| key)
    }

    /// Number of times an image was actually sliced.
    pub fn slices_computed(&self) -> u64 {
        self.slices_computed
    }

    /// Forget every cached tiling.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.current = None;
    }
}

impl Default for PuzzleTiler {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Coordinate;

    /// Image whose pixel color encodes which 100px cell it belongs to.
    fn cell_coded_image(width: u32, height: u32) -> DynamicImage {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x / 100) as u8 * 40, (y / 100) as u8 * 40, 200, 255])
        });
        DynamicImage::ImageRgba8(img)
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        cell_coded_image(width, height)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn pieces(count: u32) -> Vec<Piece> {
        (1..=count)
            .map(|i| Piece::new(format!("p{}", i), Coordinate::new(0.0, 0.0), i))
            .collect()
    }

    #[test]
    fn test_compute_grid_examples() {
        assert_eq!(compute_grid(9), Grid::new(3, 3));
        assert_eq!(compute_grid(10), Grid::new(4, 3));
        assert_eq!(compute_grid(6), Grid::new(3, 2));
        assert_eq!(compute_grid(1), Grid::new(1, 1));
        assert_eq!(compute_grid(2), Grid::new(2, 1));
    }

    #[test]
    fn test_compute_grid_covers_count() {
        for n in 0..500 {
            let grid = compute_grid(n);
            assert!(grid.cell_count() as usize >= n, "n={}", n);
            assert!(grid.cols >= grid.rows, "n={} gave {:?}", n, grid);
        }
    }

    #[test]
    fn test_compute_grid_zero_pieces() {
        let grid = compute_grid(0);
        assert_eq!(grid.cols, 1);
        assert_eq!(grid.cell_count(), 0);
    }

    #[test]
    fn test_slice_300_square() {
        let image = cell_coded_image(300, 300);
        let fragments = slice(&image, Grid::new(3, 3)).unwrap();

        assert_eq!(fragments.len(), 9);
        for (k, fragment) in fragments.iter().enumerate() {
            assert_eq!(fragment.index, k as u32 + 1);
            assert_eq!((fragment.width, fragment.height), (100, 100));

            let decoded = image::load_from_memory(&fragment.png).unwrap().to_rgba8();
            assert_eq!(decoded.dimensions(), (100, 100));
            let expected_col = (k % 3) as u8;
            let expected_row = (k / 3) as u8;
            assert_eq!(decoded.get_pixel(50, 50).0, [expected_col * 40, expected_row * 40, 200, 255]);
        }
    }

    #[test]
    fn test_slice_drops_remainder() {
        let image = cell_coded_image(310, 205);
        let fragments = slice(&image, Grid::new(3, 2)).unwrap();
        assert_eq!(fragments.len(), 6);
        assert!(fragments.iter().all(|f| f.width == 103 && f.height == 102));
    }

    #[test]
    fn test_slice_too_small_image() {
        let image = cell_coded_image(2, 2);
        assert!(matches!(
            slice(&image, Grid::new(3, 3)),
            Err(WalkError::ImageLoadFailed { .. })
        ));
    }

    #[test]
    fn test_fragment_data_url() {
        let fragment = Fragment {
            index: 1,
            width: 1,
            height: 1,
            png: vec![0x89, 0x50, 0x4E, 0x47],
        };
        assert_eq!(fragment.data_url(), "data:image/png;base64,iVBORw==");
    }

    #[test]
    fn test_assign_exact() {
        let image = cell_coded_image(300, 200);
        let fragments = slice(&image, compute_grid(6)).unwrap();
        let mut pieces = pieces(6);
        let assignment = assign_fragments(&mut pieces, &fragments);

        assert!(assignment.is_consistent());
        assert_eq!(assignment.assigned, 6);
        for piece in &pieces {
            let expected = fragments[piece.order as usize - 1].data_url();
            assert_eq!(piece.image_fragment_url.as_deref(), Some(expected.as_str()));
        }
    }

    #[test]
    fn test_assign_surplus_fragments() {
        let image = cell_coded_image(400, 300);
        // 10 pieces -> 4x3 grid -> 12 fragments
        let fragments = slice(&image, compute_grid(10)).unwrap();
        let mut pieces = pieces(10);
        let assignment = assign_fragments(&mut pieces, &fragments);

        assert_eq!(assignment.assigned, 10);
        assert_eq!(assignment.unused_fragments, vec![11, 12]);
        assert!(assignment.pieces_without_fragment.is_empty());
    }

    #[test]
    fn test_assign_deficit_clears_reference() {
        let image = cell_coded_image(200, 200);
        let fragments = slice(&image, Grid::new(2, 2)).unwrap();
        let mut pieces = pieces(5);
        pieces[4].image_fragment_url = Some("stale".to_string());

        let assignment = assign_fragments(&mut pieces, &fragments);
        assert_eq!(assignment.assigned, 4);
        assert_eq!(assignment.pieces_without_fragment, vec!["p5".to_string()]);
        assert!(pieces[4].image_fragment_url.is_none());
    }

    #[test]
    fn test_tiler_memoizes_slice_key() {
        let image = SourceImage::from_bytes(png_bytes(300, 300));
        let mut tiler = PuzzleTiler::new();

        let first = tiler.tile(&image, 9).unwrap();
        assert!(first.recomputed);
        assert_eq!(first.fragments.len(), 9);

        let second = tiler.tile(&image, 9).unwrap();
        assert!(!second.recomputed);
        assert!(Arc::ptr_eq(&first.fragments, &second.fragments));
        assert_eq!(tiler.slices_computed(), 1);
    }

    #[test]
    fn test_tiler_reslices_on_count_change() {
        let image = SourceImage::from_bytes(png_bytes(300, 300));
        let mut tiler = PuzzleTiler::new();

        tiler.tile(&image, 9).unwrap();
        let outcome = tiler.tile(&image, 10).unwrap();
        assert!(outcome.recomputed);
        assert_eq!(outcome.key.grid, Grid::new(4, 3));
        assert_eq!(outcome.fragments.len(), 12);

        // Back to 9: served from cache
        let outcome = tiler.tile(&image, 9).unwrap();
        assert!(!outcome.recomputed);
        assert_eq!(tiler.slices_computed(), 2);
    }

    #[test]
    fn test_tiler_failure_keeps_previous() {
        let good = SourceImage::from_bytes(png_bytes(300, 300));
        let bad = SourceImage::from_bytes(b"not an image".to_vec());
        let mut tiler = PuzzleTiler::new();

        let first = tiler.tile(&good, 4).unwrap();
        let err = tiler.tile(&bad, 4).unwrap_err();
        assert!(matches!(err, WalkError::ImageDecodeFailed { .. }));
        assert_eq!(tiler.current_key(), Some(&first.key));
        assert_eq!(tiler.current_fragments().map(|f| f.len()), Some(4));
    }

    #[test]
    fn test_source_image_identity() {
        let a = SourceImage::from_bytes(png_bytes(100, 100));
        let b = SourceImage::from_bytes(png_bytes(100, 100));
        let c = SourceImage::from_bytes(png_bytes(200, 100));
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a.identity(), c.identity());
        assert_eq!(a.identity().len(), 64);
    }

    #[test]
    fn test_source_image_missing_file() {
        let result = SourceImage::from_path(Path::new("/definitely/not/here.png"));
        assert!(matches!(result, Err(WalkError::ImageLoadFailed { .. })));
    }

    #[test]
    fn test_compose_reveal_masks_unrevealed() {
        let image = cell_coded_image(200, 200);
        let revealed: HashSet<u32> = [1, 4].into_iter().collect();
        let png = compose_reveal(&image, Grid::new(2, 2), &revealed).unwrap();
        let out = image::load_from_memory(&png).unwrap().to_rgba8();

        assert_eq!(out.get_pixel(50, 50).0, [0, 0, 200, 255]);
        assert_eq!(out.get_pixel(150, 50).0, MASK_COLOR);
        assert_eq!(out.get_pixel(50, 150).0, MASK_COLOR);
        assert_eq!(out.get_pixel(150, 150).0, [40, 40, 200, 255]);
    }
}
