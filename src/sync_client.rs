use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::collaborators::{
    AuthProvider, CurrentUser, FinishEndpoint, HistorySource, InsightsGenerator, InviteSender,
    RemoteError, StoredSessionRow, WorkoutStore,
};
use crate::finish::FinishPayload;
use crate::model::Workout;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Envelope most endpoints answer with: `{ ok, error }` plus data.
#[derive(Deserialize, Debug, Default)]
#[serde(default)]
struct AckResponse {
    ok: Option<bool>,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum SessionResponse {
    Bare(CurrentUser),
    Wrapped { user: Option<CurrentUser> },
}

#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum RecentSessionsResponse {
    Bare(Vec<StoredSessionRow>),
    Wrapped {
        #[serde(alias = "sessions", alias = "data")]
        rows: Vec<StoredSessionRow>,
    },
}

fn map_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_decode() {
        RemoteError::InvalidResponse(err.to_string())
    } else {
        RemoteError::Transport(err.to_string())
    }
}

/// Turns non-2xx responses into [`RemoteError`], keeping the server's message.
async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(RemoteError::Unauthenticated);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Could not read error body".to_string());
    let message = serde_json::from_str::<AckResponse>(&body)
        .ok()
        .and_then(|ack| ack.error)
        .unwrap_or(body);
    error!("Request failed with status: {}. Body: {}", status, message);
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Reads an `{ ok, error }` acknowledgement. A missing `ok` counts as success.
async fn read_ack(response: Response) -> Result<(), RemoteError> {
    let status = response.status().as_u16();
    let ack: AckResponse = response.json().await.unwrap_or_default();
    if ack.ok == Some(false) {
        return Err(RemoteError::Status {
            status,
            message: ack.error.unwrap_or_else(|| "Request rejected".to_string()),
        });
    }
    Ok(())
}

/// Body of a finish submission: the session plus the key the server uses to
/// drop duplicate deliveries.
fn finish_body(payload: &FinishPayload) -> serde_json::Value {
    json!({ "session": payload, "idempotencyKey": payload.idempotency_key })
}

/// HTTP implementation of the remote collaborators.
#[derive(Clone)]
pub struct RemoteClient {
    http_client: Client,
    server_url: String,
    api_token: Option<String>,
}

impl RemoteClient {
    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be built (TLS backend init).
    pub fn new(server_url: &str, api_token: Option<String>) -> Result<Self, RemoteError> {
        Self::with_timeout(server_url, api_token, DEFAULT_REQUEST_TIMEOUT)
    }

    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be built.
    pub fn with_timeout(
        server_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(map_transport)?;
        Ok(Self {
            http_client,
            server_url: server_url.trim_end_matches('/').to_string(),
            api_token: api_token.filter(|t| !t.trim().is_empty()),
        })
    }

    #[must_use]
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport)?;
        check_status(response).await
    }
}

#[async_trait(?Send)]
impl AuthProvider for RemoteClient {
    async fn current_user(&self) -> Result<CurrentUser, RemoteError> {
        let url = self.url("/api/auth/session");
        debug!("GET {}", url);
        let response = self.send(self.http_client.get(&url)).await?;
        let body: SessionResponse = response.json().await.map_err(map_transport)?;
        match body {
            SessionResponse::Bare(user) | SessionResponse::Wrapped { user: Some(user) } => {
                if user.id.is_empty() {
                    Err(RemoteError::Unauthenticated)
                } else {
                    Ok(user)
                }
            }
            SessionResponse::Wrapped { user: None } => Err(RemoteError::Unauthenticated),
        }
    }
}

#[async_trait(?Send)]
impl HistorySource for RemoteClient {
    async fn list_recent_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredSessionRow>, RemoteError> {
        let url = self.url("/api/workouts/history");
        info!("Fetching up to {} recent sessions from {}", limit, url);
        let request = self
            .http_client
            .get(&url)
            .query(&[("userId", user_id.to_string()), ("limit", limit.to_string())]);
        let response = self.send(request).await?;
        let rows = match response.json().await.map_err(map_transport)? {
            RecentSessionsResponse::Wrapped { rows } | RecentSessionsResponse::Bare(rows) => rows,
        };
        debug!("Received {} session rows", rows.len());
        Ok(rows)
    }
}

#[async_trait(?Send)]
impl FinishEndpoint for RemoteClient {
    async fn submit_finish(&self, payload: &FinishPayload) -> Result<(), RemoteError> {
        let url = self.url("/api/workouts/finish");
        info!(
            "Submitting finished session '{}' ({} exercises, {} logs) to {}",
            payload.workout_title,
            payload.exercises.len(),
            payload.logs.len(),
            url
        );
        let request = self
            .http_client
            .post(&url)
            .header("Idempotency-Key", payload.idempotency_key.as_str())
            .json(&finish_body(payload));
        let response = self.send(request).await?;
        read_ack(response).await
    }
}

#[async_trait(?Send)]
impl WorkoutStore for RemoteClient {
    async fn update_workout(&self, workout_id: &str, workout: &Workout) -> Result<(), RemoteError> {
        let url = self.url("/api/workouts/update");
        debug!("PATCH {} for workout {}", url, workout_id);
        let body = json!({ "id": workout_id, "workout": workout });
        let response = self.send(self.http_client.patch(&url).json(&body)).await?;
        read_ack(response).await
    }
}

#[async_trait(?Send)]
impl InviteSender for RemoteClient {
    async fn send_invite(&self, target_user: &str, workout: &Workout) -> Result<(), RemoteError> {
        let url = self.url("/api/team/invite");
        debug!("POST {} for user {}", url, target_user);
        let body = json!({ "targetUser": target_user, "workout": workout });
        let response = self.send(self.http_client.post(&url).json(&body)).await?;
        read_ack(response).await
    }
}

impl InsightsGenerator for RemoteClient {
    /// Spawns the request on the current tokio runtime; the result is only logged.
    fn request_insights(&self, workout_id: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; skipping insights for workout {}", workout_id);
            return;
        };
        let request = self
            .authorize(self.http_client.post(self.url("/api/ai/post-workout-insights")))
            .json(&json!({ "workoutId": workout_id }));
        let workout_id = workout_id.to_string();
        handle.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Insights requested for workout {}", workout_id);
                }
                Ok(response) => {
                    warn!("Insights for workout {} failed: {}", workout_id, response.status());
                }
                Err(e) => warn!("Insights for workout {} failed: {}", workout_id, e),
            }
        });
    }
}
