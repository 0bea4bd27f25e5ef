use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{FleetError, FleetResult};
use crate::types::{
    CaptureMetadata, CapturePicture, CaptureRequest, CaptureSet, DeviceId, PictureEvent,
    PictureStatus,
};

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait CaptureStore: Send + Sync {
    async fn create_set(&self, name: &str) -> FleetResult<CaptureSet>;

    async fn get_set(&self, set_id: Uuid) -> FleetResult<Option<CaptureSet>>;

    /// Completion is monotonic; completing twice is a no-op.
    async fn complete_set(&self, set_id: Uuid) -> FleetResult<()>;

    /// Persist a new request with one picture row per device. An active
    /// request of the same type in the same set is deactivated first.
    async fn insert_request(
        &self,
        request: &CaptureRequest,
        pictures: &[CapturePicture],
    ) -> FleetResult<()>;

    async fn get_request(&self, request_id: Uuid) -> FleetResult<Option<CaptureRequest>>;

    async fn list_active_requests(&self, set_id: Uuid) -> FleetResult<Vec<CaptureRequest>>;

    async fn list_pictures(&self, request_id: Uuid) -> FleetResult<Vec<CapturePicture>>;

    /// Apply `event` to one picture. Returns the new status, or `None` when
    /// the picture does not exist or the event does not apply to its status.
    async fn apply_picture_event(
        &self,
        request_id: Uuid,
        device: &DeviceId,
        event: PictureEvent,
        detail: Option<String>,
    ) -> FleetResult<Option<PictureStatus>>;

    async fn record_metadata(
        &self,
        request_id: Uuid,
        device: &DeviceId,
        metadata: &CaptureMetadata,
    ) -> FleetResult<()>;
}

impl ToSql for DeviceId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DeviceId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        DeviceId::parse(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for PictureStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PictureStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: FleetError| FromSqlError::Other(Box::new(e)))
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS capture_sets (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id BLOB NOT NULL UNIQUE,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        completed INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS capture_requests (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id BLOB NOT NULL UNIQUE,
        created_at TEXT NOT NULL,
        capture_at TEXT NOT NULL,
        capture_type TEXT NOT NULL,
        active INTEGER NOT NULL,
        set_id BLOB REFERENCES capture_sets(id)
    );
    CREATE TABLE IF NOT EXISTS capture_pictures (
        request_id BLOB NOT NULL REFERENCES capture_requests(id),
        device_id TEXT NOT NULL,
        status TEXT NOT NULL,
        detail TEXT,
        exposure_us INTEGER,
        gain REAL,
        sensor_timestamp_us INTEGER,
        taken_at TEXT,
        PRIMARY KEY (request_id, device_id)
    );
";

const REQUEST_COLUMNS: &str = "id, created_at, capture_at, capture_type, active, set_id";

const PICTURE_COLUMNS: &str =
    "request_id, device_id, status, detail, exposure_us, gain, sensor_timestamp_us, taken_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<CaptureRequest> {
    Ok(CaptureRequest {
        id: row.get(0)?,
        created_at: row.get(1)?,
        capture_at: row.get(2)?,
        capture_type: row.get(3)?,
        active: row.get(4)?,
        set_id: row.get(5)?,
    })
}

fn picture_from_row(row: &Row<'_>) -> rusqlite::Result<CapturePicture> {
    Ok(CapturePicture {
        request_id: row.get(0)?,
        device_id: row.get(1)?,
        status: row.get(2)?,
        detail: row.get(3)?,
        metadata: CaptureMetadata {
            exposure_us: row.get(4)?,
            gain: row.get(5)?,
            sensor_timestamp_us: row.get(6)?,
            taken_at: row.get(7)?,
        },
    })
}

fn set_from_row(row: &Row<'_>) -> rusqlite::Result<CaptureSet> {
    Ok(CaptureSet {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        completed: row.get(3)?,
    })
}

/// SQLite-backed [`CaptureStore`]. Statements are short, so they run inline
/// on the calling task behind a plain mutex.
pub struct SqliteCaptureStore {
    conn: Mutex<Connection>,
}

impl SqliteCaptureStore {
    pub fn open(path: impl AsRef<Path>) -> FleetResult<Self> {
        let path = path.as_ref();
        info!("Initializing capture database at {}", path.display());
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> FleetResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> FleetResult<Self> {
        conn.execute_batch(SCHEMA)?;
        debug!("capture database schema ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CaptureStore for SqliteCaptureStore {
    async fn create_set(&self, name: &str) -> FleetResult<CaptureSet> {
        let set = CaptureSet {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
            completed: false,
        };
        self.conn().execute(
            "INSERT INTO capture_sets (id, name, created_at, completed) VALUES (?1, ?2, ?3, 0)",
            params![set.id, set.name, set.created_at],
        )?;
        info!(set_id = %set.id, name = %set.name, "Created capture set");
        Ok(set)
    }

    async fn get_set(&self, set_id: Uuid) -> FleetResult<Option<CaptureSet>> {
        let set = self
            .conn()
            .query_row(
                "SELECT id, name, created_at, completed FROM capture_sets WHERE id = ?1",
                params![set_id],
                set_from_row,
            )
            .optional()?;
        Ok(set)
    }

    async fn complete_set(&self, set_id: Uuid) -> FleetResult<()> {
        let updated = self.conn().execute(
            "UPDATE capture_sets SET completed = 1 WHERE id = ?1",
            params![set_id],
        )?;
        if updated == 0 {
            return Err(FleetError::SetNotFound(set_id));
        }
        Ok(())
    }

    async fn insert_request(
        &self,
        request: &CaptureRequest,
        pictures: &[CapturePicture],
    ) -> FleetResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        if let Some(set_id) = request.set_id {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM capture_sets WHERE id = ?1)",
                params![set_id],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(FleetError::SetNotFound(set_id));
            }
            if request.active {
                let superseded = tx.execute(
                    "UPDATE capture_requests SET active = 0
                     WHERE set_id = ?1 AND capture_type = ?2 AND active = 1",
                    params![set_id, request.capture_type],
                )?;
                if superseded > 0 {
                    info!(%set_id, capture_type = %request.capture_type, "Deactivated superseded capture request");
                }
            }
        }

        tx.execute(
            "INSERT INTO capture_requests (id, created_at, capture_at, capture_type, active, set_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                request.id,
                request.created_at,
                request.capture_at,
                request.capture_type,
                request.active,
                request.set_id,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO capture_pictures (request_id, device_id, status, detail,
                     exposure_us, gain, sensor_timestamp_us, taken_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for picture in pictures {
                stmt.execute(params![
                    request.id,
                    picture.device_id,
                    picture.status,
                    picture.detail,
                    picture.metadata.exposure_us,
                    picture.metadata.gain,
                    picture.metadata.sensor_timestamp_us,
                    picture.metadata.taken_at,
                ])?;
            }
        }

        tx.commit()?;
        info!(
            request_id = %request.id,
            capture_type = %request.capture_type,
            pictures = pictures.len(),
            "Stored capture request"
        );
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> FleetResult<Option<CaptureRequest>> {
        let sql = format!("SELECT {} FROM capture_requests WHERE id = ?1", REQUEST_COLUMNS);
        let request = self
            .conn()
            .query_row(&sql, params![request_id], request_from_row)
            .optional()?;
        Ok(request)
    }

    async fn list_active_requests(&self, set_id: Uuid) -> FleetResult<Vec<CaptureRequest>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM capture_requests WHERE set_id = ?1 AND active = 1 ORDER BY seq",
            REQUEST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let requests = stmt
            .query_map(params![set_id], request_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    async fn list_pictures(&self, request_id: Uuid) -> FleetResult<Vec<CapturePicture>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM capture_pictures WHERE request_id = ?1 ORDER BY rowid",
            PICTURE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let pictures = stmt
            .query_map(params![request_id], picture_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pictures)
    }

    async fn apply_picture_event(
        &self,
        request_id: Uuid,
        device: &DeviceId,
        event: PictureEvent,
        detail: Option<String>,
    ) -> FleetResult<Option<PictureStatus>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<PictureStatus> = tx
            .query_row(
                "SELECT status FROM capture_pictures WHERE request_id = ?1 AND device_id = ?2",
                params![request_id, device],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            debug!(%request_id, device_id = %device, ?event, "no picture row for event");
            return Ok(None);
        };
        let Some(next) = current.apply(event) else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE capture_pictures SET status = ?3, detail = COALESCE(?4, detail)
             WHERE request_id = ?1 AND device_id = ?2",
            params![request_id, device, next, detail],
        )?;
        tx.commit()?;
        Ok(Some(next))
    }

    async fn record_metadata(
        &self,
        request_id: Uuid,
        device: &DeviceId,
        metadata: &CaptureMetadata,
    ) -> FleetResult<()> {
        self.conn().execute(
            "UPDATE capture_pictures
             SET exposure_us = ?3, gain = ?4, sensor_timestamp_us = ?5, taken_at = ?6
             WHERE request_id = ?1 AND device_id = ?2",
            params![
                request_id,
                device,
                metadata.exposure_us,
                metadata.gain,
                metadata.sensor_timestamp_us,
                metadata.taken_at,
            ],
        )?;
        Ok(())
    }
}
