use serde::{Deserialize, Serialize};

/// Connection state of the live simulator position link.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

/// How an acquisition job orders and sizes its tiles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    Manual,
    /// Direction-aware acquisition: ordering and LOD biased along the
    /// current heading.
    Daa,
}

/// One position snapshot from the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub lat_deg: f64,
    pub lon_deg: f64,
    pub altitude_msl_ft: f64,
    pub ground_elevation_ft: f64,
    pub heading_deg: f64,
    pub speed_mph: f64,
}

impl PositionFix {
    /// Height above ground, floored at zero.
    pub fn agl_ft(&self) -> f64 {
        (self.altitude_msl_ft - self.ground_elevation_ft).max(0.0)
    }
}

/// Per-chunk download state as shown in the UI grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Progress of one active tile, pushed to WebSocket clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileProgressMsg {
    pub id: u64,
    pub size_id: u8,
    pub total_chunks: u32,
    pub chunks_completed: u32,
    /// Row-major `cols x cols` grid of chunk states, top row first.
    pub grid: Vec<Vec<ChunkState>>,
    pub downloaded_bytes: u64,
    /// Unix milliseconds when the tile was queued.
    pub start_ms: u64,
    pub status: String,
}

/// Session-wide download totals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SessionTotalsMsg {
    pub pending: i64,
    pub done: u64,
    pub failed: u64,
    pub files_downloaded: u64,
    pub bytes_downloaded: u64,
}

/// `POST /api/start-job` request body. Either `icao` or `lat`+`lon`
/// selects the center.
#[derive(Debug, Clone, Deserialize)]
pub struct StartJobRequest {
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub icao: Option<String>,
    pub radius: f64,
    pub size: u8,
    pub over: u8,
    pub sdwn: Option<u8>,
    pub mode: Option<AcquisitionMode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartJobResponse {
    #[serde(rename = "jobId")]
    pub job_id: u64,
    pub lat: f64,
    pub lon: f64,
    pub radius: f64,
}

/// Rectangle used by `POST /api/fill-holes`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FillSettings {
    pub size: u8,
    pub over: u8,
    pub sdwn: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FillHolesRequest {
    pub bounds: Bounds,
    pub settings: FillSettings,
}

/// `GET /api/fgfs-status` response.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FgfsStatus {
    pub active: bool,
    pub lat: f64,
    pub lon: f64,
    pub heading: f64,
    pub altitude: f64,
    pub speed: f64,
}
