//src/collaborators.rs
//! Interfaces of everything the session engine talks to but does not own:
//! the remote backend, local storage, dialogs, connectivity and time.
//! They are passed in at construction so the engine never reaches for
//! ambient globals.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::cell::Cell;
use std::rc::Rc;
use thiserror::Error;

use crate::db::DbError;
use crate::finish::{FinishPayload, PostCheckin};
use crate::model::{lenient, Session, Workout};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,
    #[error("Network request failed: {0}")]
    Transport(String),
    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Invalid server response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether sending the same request again later can succeed. Client
    /// errors (4xx other than timeout / rate limit) are rejections of the
    /// request itself.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => !matches!(*status, 400..=499) || matches!(*status, 408 | 429),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CurrentUser {
    #[serde(deserialize_with = "lenient::text")]
    pub id: String,
}

/// A completed session as stored remotely. `notes` holds the serialized
/// finish payload (either a JSON string or an already-decoded object).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoredSessionRow {
    #[serde(deserialize_with = "lenient::text")]
    pub id: String,
    pub notes: Option<serde_json::Value>,
    #[serde(deserialize_with = "lenient::opt_text")]
    pub date: Option<String>,
    #[serde(deserialize_with = "lenient::opt_text")]
    pub created_at: Option<String>,
}

#[async_trait(?Send)]
pub trait AuthProvider {
    async fn current_user(&self) -> Result<CurrentUser, RemoteError>;
}

#[async_trait(?Send)]
pub trait HistorySource {
    /// Most recent completed (non-template) sessions first.
    async fn list_recent_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSessionRow>, RemoteError>;
}

#[async_trait(?Send)]
pub trait FinishEndpoint {
    async fn submit_finish(&self, payload: &FinishPayload) -> Result<(), RemoteError>;
}

/// Fire-and-forget: implementations must not block and must swallow failures.
pub trait InsightsGenerator {
    fn request_insights(&self, workout_id: &str);
}

#[async_trait(?Send)]
pub trait WorkoutStore {
    async fn update_workout(&self, workout_id: &str, workout: &Workout) -> Result<(), RemoteError>;
}

#[async_trait(?Send)]
pub trait InviteSender {
    async fn send_invite(&self, target_user: &str, workout: &Workout) -> Result<(), RemoteError>;
}

pub trait Connectivity {
    fn is_online(&self) -> bool;
}

pub trait OfflineQueue {
    /// Durably stores the payload; returns the queue entry id.
    fn enqueue(&self, payload: &FinishPayload) -> Result<String, DbError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBlob {
    pub value: String,
    pub written_at: DateTime<Utc>,
}

/// Local key-value cache. Must never fail the caller: implementations log
/// and degrade to "absent" / "not written".
pub trait KvCache {
    fn read(&self, key: &str) -> Option<CachedBlob>;
    fn write(&self, key: &str, value: &str, written_at: DateTime<Utc>);
}

/// User dialogs. Declining or dismissing a prompt must resolve, not hang.
#[async_trait(?Send)]
pub trait Prompter {
    async fn confirm(&self, title: &str, message: &str) -> bool;
    async fn alert(&self, message: &str);
    /// `None` when the user skipped the check-in.
    async fn post_checkin(&self) -> Option<PostCheckin>;
}

pub trait FinishListener {
    fn on_finish(&self, session: Option<&Session>, show_report: bool);
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Connectivity flag flipped by the host when the platform reports changes.
#[derive(Debug)]
pub struct NetworkStatus {
    online: Cell<bool>,
}

impl NetworkStatus {
    #[must_use]
    pub const fn new(online: bool) -> Self {
        Self {
            online: Cell::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.set(online);
    }
}

impl Connectivity for NetworkStatus {
    fn is_online(&self) -> bool {
        self.online.get()
    }
}

/// Everything the engine needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Rc<dyn AuthProvider>,
    pub history: Rc<dyn HistorySource>,
    pub finish: Rc<dyn FinishEndpoint>,
    pub insights: Rc<dyn InsightsGenerator>,
    pub workouts: Rc<dyn WorkoutStore>,
    pub invites: Rc<dyn InviteSender>,
    pub connectivity: Rc<dyn Connectivity>,
    pub queue: Rc<dyn OfflineQueue>,
    pub cache: Rc<dyn KvCache>,
    pub prompter: Rc<dyn Prompter>,
    pub listener: Rc<dyn FinishListener>,
    pub clock: Rc<dyn Clock>,
}
