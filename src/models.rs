use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub window: WindowConfig,

    pub backend: BackendConfig,

    #[serde(default = "default_markers_path")]
    pub markers_path: PathBuf,

    #[serde(default)]
    pub dev: DevConfig,

    #[serde(default)]
    pub questions: Vec<Question>,
}

fn default_markers_path() -> PathBuf {
    "markers.json".into()
}

#[derive(Clone, Debug, Deserialize)]
pub struct WindowConfig {
    /// Civil date of day zero, midnight local.
    pub start_date: NaiveDate,
    pub total_days: u32,
    /// IANA zone name, e.g. "Europe/London".
    pub tz: String,
    pub open_hour: u32,
    pub close_hour: u32,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Local { dir: PathBuf },
    Remote { endpoint: String },
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct DevConfig {
    /// Opt-in clock override file. Leave unset in production.
    pub override_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Question {
    pub question: String,
    pub choices: Vec<String>,
    pub answer_index: usize,
    /// Shown when the visitor picks a wrong choice.
    pub explain: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Entry {
    pub name: String,
    pub ip: String,
    pub ts: DateTime<Utc>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Winner {
    pub name: String,
    pub ts: DateTime<Utc>,
}

/// Where today sits relative to the answering window.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    Finished,
    WinnerAnnounced,
    Waiting,
    Closed,
    Open,
}

/// Best-effort visitor identity: reported public address plus an optional
/// per-browser token. Advisory only, never a security boundary.
#[derive(Clone, Debug)]
pub struct VisitorIdentity {
    pub ip: String,
    pub device: Option<String>,
}

impl VisitorIdentity {
    pub fn new(ip: impl Into<String>, device: Option<String>) -> VisitorIdentity {
        VisitorIdentity {
            ip: ip.into(),
            device,
        }
    }
}
