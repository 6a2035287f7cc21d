//! SQLite-backed remote store.
//!
//! Routes, pieces and progress live in three tables. Progress is unique per
//! (route, device) and the upsert refuses to overwrite a newer record, so
//! writes completing out of order cannot roll progress back.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};

use crate::progress::ProgressRecord;
use crate::store::RemoteStore;
use crate::tiling::Grid;
use crate::{Coordinate, Piece, Result, Route, WalkError};

pub struct SqliteStore {
    db: Mutex<Connection>,
    db_path: String,
}

impl SqliteStore {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) a store at the given database path.
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Connection::open(db_path).map_err(WalkError::remote_read)?;
        Self::init_schema(&db).map_err(WalkError::remote_write)?;
        info!("[SqliteStore] Opened {}", db_path);

        Ok(Self {
            db: Mutex::new(db),
            db_path: db_path.to_string(),
        })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> SqlResult<()> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS routes (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                center_lat REAL NOT NULL,
                center_lng REAL NOT NULL,
                radius_m REAL NOT NULL,
                puzzle_image_ref TEXT,
                grid_cols INTEGER,
                grid_rows INTEGER
            );

            CREATE TABLE IF NOT EXISTS pieces (
                id TEXT PRIMARY KEY,
                route_id TEXT NOT NULL REFERENCES routes(id) ON DELETE CASCADE,
                lat REAL NOT NULL,
                lng REAL NOT NULL,
                piece_order INTEGER NOT NULL,
                fragment_ref TEXT
            );

            -- Collected ids are a JSON array of strings
            CREATE TABLE IF NOT EXISTS progress (
                route_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                collected_ids TEXT NOT NULL,
                completed_at TEXT,
                updated_at TEXT NOT NULL,
                UNIQUE(route_id, device_id)
            );

            CREATE INDEX IF NOT EXISTS idx_pieces_route ON pieces(route_id, piece_order);
            "#,
        )
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| WalkError::remote_read(format!("bad timestamp {:?}: {}", text, e)))
}

fn route_from_row(row: &Row<'_>) -> SqlResult<Route> {
    let cols: Option<u32> = row.get(6)?;
    let rows: Option<u32> = row.get(7)?;
    let mut route = Route::new(
        row.get::<_, String>(0)?,
        row.get::<_, String>(1)?,
        Coordinate::new(row.get(2)?, row.get(3)?),
        row.get(4)?,
    );
    route.puzzle_image_ref = row.get(5)?;
    route.grid = cols.zip(rows).map(|(cols, rows)| Grid::new(cols, rows));
    Ok(route)
}

fn piece_from_row(row: &Row<'_>) -> SqlResult<Piece> {
    Ok(Piece {
        id: row.get(0)?,
        lat: row.get(1)?,
        lng: row.get(2)?,
        order: row.get(3)?,
        image_fragment_url: row.get(4)?,
    })
}

impl RemoteStore for SqliteStore {
    fn upsert_route(&self, route: &Route) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO routes (id, name, center_lat, center_lng, radius_m, puzzle_image_ref, grid_cols, grid_rows)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    center_lat = excluded.center_lat,
                    center_lng = excluded.center_lng,
                    radius_m = excluded.radius_m,
                    puzzle_image_ref = excluded.puzzle_image_ref,
                    grid_cols = excluded.grid_cols,
                    grid_rows = excluded.grid_rows",
                params![
                    route.id,
                    route.name,
                    route.center.lat,
                    route.center.lng,
                    route.radius_m,
                    route.puzzle_image_ref,
                    route.grid.map(|g| g.cols),
                    route.grid.map(|g| g.rows),
                ],
            )
            .map_err(WalkError::remote_write)?;
        Ok(())
    }

    fn select_route(&self, route_id: &str) -> Result<Option<Route>> {
        self.conn()
            .query_row(
                "SELECT id, name, center_lat, center_lng, radius_m, puzzle_image_ref, grid_cols, grid_rows
                 FROM routes WHERE id = ?",
                params![route_id],
                route_from_row,
            )
            .optional()
            .map_err(WalkError::remote_read)
    }

    fn upsert_piece(&self, route_id: &str, piece: &Piece) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO pieces (id, route_id, lat, lng, piece_order, fragment_ref)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    route_id = excluded.route_id,
                    lat = excluded.lat,
                    lng = excluded.lng,
                    piece_order = excluded.piece_order,
                    fragment_ref = excluded.fragment_ref",
                params![
                    piece.id,
                    route_id,
                    piece.lat,
                    piece.lng,
                    piece.order,
                    piece.image_fragment_url,
                ],
            )
            .map_err(WalkError::remote_write)?;
        Ok(())
    }

    fn delete_piece(&self, route_id: &str, piece_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM pieces WHERE route_id = ? AND id = ?",
                params![route_id, piece_id],
            )
            .map_err(WalkError::remote_write)?;
        Ok(())
    }

    fn select_pieces(&self, route_id: &str) -> Result<Vec<Piece>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, lat, lng, piece_order, fragment_ref FROM pieces
                 WHERE route_id = ? ORDER BY piece_order ASC, id ASC",
            )
            .map_err(WalkError::remote_read)?;
        let pieces = stmt
            .query_map(params![route_id], piece_from_row)
            .map_err(WalkError::remote_read)?
            .collect::<SqlResult<Vec<Piece>>>()
            .map_err(WalkError::remote_read)?;
        Ok(pieces)
    }

    fn upsert_progress(&self, record: &ProgressRecord) -> Result<bool> {
        let ids = serde_json::to_string(&record.collected_ids).map_err(WalkError::remote_write)?;
        let changed = self
            .conn()
            .execute(
                "INSERT INTO progress (route_id, device_id, collected_ids, completed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(route_id, device_id) DO UPDATE SET
                    collected_ids = excluded.collected_ids,
                    completed_at = excluded.completed_at,
                    updated_at = excluded.updated_at
                 WHERE excluded.updated_at >= progress.updated_at",
                params![
                    record.route_id,
                    record.device_id,
                    ids,
                    record.completed_at.as_ref().map(format_timestamp),
                    format_timestamp(&record.updated_at),
                ],
            )
            .map_err(WalkError::remote_write)?;

        if changed == 0 {
            debug!(
                "[SqliteStore] Stale progress for {}/{} not applied",
                record.route_id, record.device_id
            );
        }
        Ok(changed > 0)
    }

    fn select_progress(&self, route_id: &str, device_id: &str) -> Result<Option<ProgressRecord>> {
        let row = self
            .conn()
            .query_row(
                "SELECT collected_ids, completed_at, updated_at FROM progress
                 WHERE route_id = ? AND device_id = ?",
                params![route_id, device_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(WalkError::remote_read)?;

        let Some((ids, completed_at, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(ProgressRecord {
            route_id: route_id.to_string(),
            device_id: device_id.to_string(),
            collected_ids: serde_json::from_str(&ids).map_err(WalkError::remote_read)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            updated_at: parse_timestamp(&updated_at)?,
        }))
    }
}

// ============================================================================
// Tests
// ============================================================================
