//! REST-backed remote store (PostgREST dialect).
//!
//! Tables are exposed as `/routes`, `/pieces` and `/progress`. Reads filter
//! with `column=eq.value`, upserts POST with `on_conflict` and
//! `Prefer: resolution=merge-duplicates`. Requests are retried with
//! exponential backoff on 429 and connection errors.
//!
//! The store is synchronous: it owns a tokio runtime and blocks on it, so
//! it must not be called from inside another tokio runtime.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;

use crate::progress::ProgressRecord;
use crate::store::RemoteStore;
use crate::tiling::Grid;
use crate::{Coordinate, Piece, Result, Route, WalkError};

const MAX_RETRIES: u32 = 3;

/// Connection settings for [`RestStore`].
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Base URL of the REST endpoint, e.g. `https://example.org/rest/v1`
    pub base_url: String,
    /// Sent as both `apikey` and bearer token
    pub api_key: String,
    /// Per-request timeout in seconds.
    /// Default: 15
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            api_key: String::new(),
            timeout_secs: 15,
        }
    }
}

// ============================================================================
// Wire Rows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RouteRow {
    id: String,
    name: String,
    center_lat: f64,
    center_lng: f64,
    radius_m: f64,
    puzzle_image_ref: Option<String>,
    grid_cols: Option<u32>,
    grid_rows: Option<u32>,
}

impl From<&Route> for RouteRow {
    fn from(route: &Route) -> Self {
        Self {
            id: route.id.clone(),
            name: route.name.clone(),
            center_lat: route.center.lat,
            center_lng: route.center.lng,
            radius_m: route.radius_m,
            puzzle_image_ref: route.puzzle_image_ref.clone(),
            grid_cols: route.grid.map(|g| g.cols),
            grid_rows: route.grid.map(|g| g.rows),
        }
    }
}

impl From<RouteRow> for Route {
    fn from(row: RouteRow) -> Self {
        let mut route = Route::new(row.id, row.name, Coordinate::new(row.center_lat, row.center_lng), row.radius_m);
        route.puzzle_image_ref = row.puzzle_image_ref;
        route.grid = row.grid_cols.zip(row.grid_rows).map(|(c, r)| Grid::new(c, r));
        route
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct PieceRow {
    id: String,
    route_id: String,
    lat: f64,
    lng: f64,
    piece_order: u32,
    fragment_ref: Option<String>,
}

impl PieceRow {
    fn new(route_id: &str, piece: &Piece) -> Self {
        Self {
            id: piece.id.clone(),
            route_id: route_id.to_string(),
            lat: piece.lat,
            lng: piece.lng,
            piece_order: piece.order,
            fragment_ref: piece.image_fragment_url.clone(),
        }
    }
}

impl From<PieceRow> for Piece {
    fn from(row: PieceRow) -> Self {
        Piece {
            id: row.id,
            lat: row.lat,
            lng: row.lng,
            order: row.piece_order,
            image_fragment_url: row.fragment_ref,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProgressRow {
    route_id: String,
    device_id: String,
    collected_ids: Vec<String>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<&ProgressRecord> for ProgressRow {
    fn from(record: &ProgressRecord) -> Self {
        Self {
            route_id: record.route_id.clone(),
            device_id: record.device_id.clone(),
            collected_ids: record.collected_ids.clone(),
            completed_at: record.completed_at,
            updated_at: record.updated_at,
        }
    }
}

impl From<ProgressRow> for ProgressRecord {
    fn from(row: ProgressRow) -> Self {
        ProgressRecord {
            route_id: row.route_id,
            device_id: row.device_id,
            collected_ids: row.collected_ids,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        }
    }
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

/// Backoff before retry number `attempt` (1-based): 1s, 2s, 4s...
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * (1 << attempt.min(5)))
}

// ============================================================================
// Store
// ============================================================================

pub struct RestStore {
    client: Client,
    config: RestConfig,
    runtime: Runtime,
}

impl RestStore {
    pub fn new(config: RestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| WalkError::ConfigError {
                message: format!("Failed to create HTTP client: {}", e),
            })?;
        let runtime = Runtime::new().map_err(|e| WalkError::Internal {
            message: format!("Failed to create tokio runtime: {}", e),
        })?;

        info!("[RestStore] Using {}", config.base_url);
        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn url(&self, table: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
    }

    fn block_on<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.runtime.block_on(fut)
    }

    /// Send a request, retrying on 429 and transport errors.
    ///
    /// Errors are plain messages; callers classify them as read or write.
    async fn send<F>(&self, build: F) -> std::result::Result<Response, String>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        loop {
            match self.authorized(build()).send().await {
                Ok(resp) if resp.status() == StatusCode::TOO_MANY_REQUESTS => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err("Max retries exceeded (429)".to_string());
                    }
                    let wait = backoff(retries);
                    warn!("[RestStore] 429, retry {} after {:?}", retries, wait);
                    tokio::time::sleep(wait).await;
                }
                Ok(resp) if !resp.status().is_success() => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(format!("HTTP {}: {}", status, body));
                }
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(format!("Request error: {}", e));
                    }
                    let wait = backoff(retries);
                    warn!("[RestStore] Request error: {}, retry {} after {:?}", e, retries, wait);
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    async fn select<T: serde::de::DeserializeOwned>(&self, table: &str, query: &[(&str, String)]) -> Result<Vec<T>> {
        let url = self.url(table);
        let resp = self
            .send(|| self.client.get(&url).query(query))
            .await
            .map_err(WalkError::remote_read)?;
        resp.json::<Vec<T>>().await.map_err(WalkError::remote_read)
    }

    async fn upsert<T: Serialize>(&self, table: &str, on_conflict: &str, row: &T) -> Result<()> {
        let url = self.url(table);
        self.send(|| {
            self.client
                .post(&url)
                .query(&[("on_conflict", on_conflict)])
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(&[row])
        })
        .await
        .map_err(WalkError::remote_write)?;
        Ok(())
    }
}

impl RemoteStore for RestStore {
    fn upsert_route(&self, route: &Route) -> Result<()> {
        self.block_on(self.upsert("routes", "id", &RouteRow::from(route)))
    }

    fn select_route(&self, route_id: &str) -> Result<Option<Route>> {
        let rows: Vec<RouteRow> = self.block_on(self.select("routes", &[("id", eq(route_id))]))?;
        Ok(rows.into_iter().next().map(Route::from))
    }

    fn upsert_piece(&self, route_id: &str, piece: &Piece) -> Result<()> {
        self.block_on(self.upsert("pieces", "id", &PieceRow::new(route_id, piece)))
    }

    fn delete_piece(&self, route_id: &str, piece_id: &str) -> Result<()> {
        let url = self.url("pieces");
        let query = [("route_id", eq(route_id)), ("id", eq(piece_id))];
        self.block_on(async {
            self.send(|| self.client.delete(&url).query(&query))
                .await
                .map_err(WalkError::remote_write)?;
            Ok(())
        })
    }

    fn select_pieces(&self, route_id: &str) -> Result<Vec<Piece>> {
        let rows: Vec<PieceRow> = self.block_on(self.select(
            "pieces",
            &[
                ("route_id", eq(route_id)),
                ("order", "piece_order.asc,id.asc".to_string()),
            ],
        ))?;
        Ok(rows.into_iter().map(Piece::from).collect())
    }

    fn upsert_progress(&self, record: &ProgressRecord) -> Result<bool> {
        // Read-compare-write; concurrent writers can still interleave
        if let Some(existing) = self.select_progress(&record.route_id, &record.device_id)? {
            if existing.updated_at > record.updated_at {
                debug!(
                    "[RestStore] Stale progress for {}/{} not applied",
                    record.route_id, record.device_id
                );
                return Ok(false);
            }
        }
        self.block_on(self.upsert("progress", "route_id,device_id", &ProgressRow::from(record)))?;
        Ok(true)
    }

    fn select_progress(&self, route_id: &str, device_id: &str) -> Result<Option<ProgressRecord>> {
        let rows: Vec<ProgressRow> = self.block_on(self.select(
            "progress",
            &[("route_id", eq(route_id)), ("device_id", eq(device_id))],
        ))?;
        Ok(rows.into_iter().next().map(ProgressRecord::from))
    }
}
