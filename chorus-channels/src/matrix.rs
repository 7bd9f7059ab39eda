use crate::traits::RoomClient;
use crate::types::{EventId, RoomId, RoomMessage, RoomMessageKind, UserId};
use anyhow::{Result, anyhow};
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result of a password login or registration: everything needed to build a
/// [`MatrixClient`] and to persist the token back into the persona config.
#[derive(Debug, Clone)]
pub struct MatrixCredentials {
    pub user_id: UserId,
    pub access_token: String,
}

#[derive(Clone)]
pub struct MatrixClient {
    http: reqwest::Client,
    homeserver_url: String,
    access_token: String,
    user_id: UserId,
    sync_timeout_ms: u64,
}

impl MatrixClient {
    pub fn new(homeserver_url: &str, access_token: &str, user_id: &str) -> Result<Self> {
        let homeserver_url = normalize_homeserver_url(homeserver_url)?;
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("matrix access token is required"));
        }
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(anyhow!("matrix user id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            homeserver_url,
            access_token: access_token.to_string(),
            user_id: UserId::new(user_id),
            sync_timeout_ms: 30_000,
        })
    }

    pub fn with_sync_timeout_ms(mut self, sync_timeout_ms: u64) -> Self {
        self.sync_timeout_ms = sync_timeout_ms.max(1);
        self
    }

    /// Log in with username/password, returning the token to persist.
    pub async fn login(
        homeserver_url: &str,
        username: &str,
        password: &str,
    ) -> Result<MatrixCredentials> {
        let base = normalize_homeserver_url(homeserver_url)?;
        let payload = serde_json::json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": username },
            "password": password,
        });
        auth_request(&base, "/_matrix/client/v3/login", payload).await
    }

    /// Register a fresh account with username/password, returning the token
    /// to persist.
    pub async fn register(
        homeserver_url: &str,
        username: &str,
        password: &str,
    ) -> Result<MatrixCredentials> {
        let base = normalize_homeserver_url(homeserver_url)?;
        let payload = serde_json::json!({
            "username": username,
            "password": password,
            "auth": { "type": "m.login.dummy" },
            "inhibit_login": false,
        });
        auth_request(&base, "/_matrix/client/v3/register", payload).await
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}{}", self.homeserver_url, path))
            .map_err(|e| anyhow!("invalid matrix API URL path {path:?}: {e}"))
    }

    async fn put_json(&self, path: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let url = self.api_url(path)?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        check_matrix_response(path, response).await
    }

    async fn post_json(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = self.api_url(path)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.access_token)
            .json(payload)
            .send()
            .await?;
        check_matrix_response(path, response).await
    }
}

#[async_trait::async_trait]
impl RoomClient for MatrixClient {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn start(&self, tx: mpsc::Sender<RoomMessage>) -> Result<()> {
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(error) = client.run_sync_loop(tx).await {
                tracing::error!(%error, "matrix sync loop exited");
            }
        });
        Ok(())
    }

    async fn send_text(&self, room: &RoomId, body: &str) -> Result<EventId> {
        let body = body.trim();
        if body.is_empty() {
            return Err(anyhow!("message body is empty"));
        }
        let txn_id = Uuid::new_v4();
        let payload = serde_json::json!({ "msgtype": "m.text", "body": body });
        let response = self
            .put_json(
                &format!("/_matrix/client/v3/rooms/{room}/send/m.room.message/{txn_id}"),
                &payload,
            )
            .await?;
        let event_id = response
            .get("event_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("matrix send response missing event_id"))?;
        Ok(EventId::new(event_id))
    }

    async fn send_reaction(&self, room: &RoomId, event: &EventId, key: &str) -> Result<()> {
        let txn_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event.as_str(),
                "key": key,
            }
        });
        self.put_json(
            &format!("/_matrix/client/v3/rooms/{room}/send/m.reaction/{txn_id}"),
            &payload,
        )
        .await?;
        Ok(())
    }

    async fn send_read_receipt(&self, room: &RoomId, event: &EventId) -> Result<()> {
        self.post_json(
            &format!("/_matrix/client/v3/rooms/{room}/receipt/m.read/{event}"),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }

    async fn set_typing(&self, room: &RoomId, active: bool, timeout: Duration) -> Result<()> {
        let payload = if active {
            serde_json::json!({ "typing": true, "timeout": timeout.as_millis() as u64 })
        } else {
            serde_json::json!({ "typing": false })
        };
        self.put_json(
            &format!("/_matrix/client/v3/rooms/{room}/typing/{}", self.user_id),
            &payload,
        )
        .await?;
        Ok(())
    }
}

impl MatrixClient {
    #[tracing::instrument(level = "info", skip_all, fields(user_id = %self.user_id))]
    async fn run_sync_loop(&self, tx: mpsc::Sender<RoomMessage>) -> Result<()> {
        // Seed the since-token so startup does not replay room history.
        let mut since_token: Option<String> = None;
        loop {
            match self.sync_once(since_token.as_deref()).await {
                Ok(sync) => {
                    let backfill = since_token.is_none();
                    since_token = Some(sync.next_batch.clone());
                    self.join_invited_rooms(&sync).await;
                    if backfill {
                        tracing::info!("matrix sync token seeded");
                        continue;
                    }
                    self.emit_sync_events(&sync, &tx).await?;
                }
                Err(error) => {
                    tracing::warn!(%error, "matrix sync failed; retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn sync_once(&self, since: Option<&str>) -> Result<MatrixSyncResponse> {
        let url = self.api_url("/_matrix/client/v3/sync")?;
        let timeout = self.sync_timeout_ms.to_string();
        let mut request = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .timeout(Duration::from_millis(self.sync_timeout_ms + 30_000))
            .query(&[("timeout", timeout.as_str())]);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("matrix sync failed: status={status} body={body}"));
        }
        Ok(response.json().await?)
    }

    async fn join_invited_rooms(&self, sync: &MatrixSyncResponse) {
        for room_id in sync.rooms.invite.keys() {
            match self
                .post_json(
                    &format!("/_matrix/client/v3/rooms/{room_id}/join"),
                    &serde_json::json!({}),
                )
                .await
            {
                Ok(_) => tracing::info!(%room_id, "joined room on invite"),
                Err(error) => tracing::warn!(%room_id, %error, "failed to join invited room"),
            }
        }
    }

    async fn emit_sync_events(
        &self,
        sync: &MatrixSyncResponse,
        tx: &mpsc::Sender<RoomMessage>,
    ) -> Result<()> {
        for (room_id, room_state) in &sync.rooms.join {
            for event in &room_state.timeline.events {
                let Some(message) = room_message_from_event(room_id, event, &self.user_id) else {
                    continue;
                };
                tx.send(message)
                    .await
                    .map_err(|e| anyhow!("matrix inbound queue closed: {e}"))?;
            }
        }
        Ok(())
    }
}

async fn auth_request(
    base: &str,
    path: &str,
    payload: serde_json::Value,
) -> Result<MatrixCredentials> {
    let response = reqwest::Client::new()
        .post(format!("{base}{path}"))
        .json(&payload)
        .send()
        .await?;
    let status = response.status();
    let body: MatrixAuthResponse = response.json().await?;
    if !status.is_success() {
        return Err(anyhow!(
            "matrix auth failed: status={} errcode={} error={}",
            status,
            body.errcode.unwrap_or_else(|| "unknown".to_string()),
            body.error.unwrap_or_else(|| "unknown".to_string())
        ));
    }
    match (body.user_id, body.access_token) {
        (Some(user_id), Some(access_token)) => Ok(MatrixCredentials {
            user_id: UserId::new(user_id),
            access_token,
        }),
        _ => Err(anyhow!("matrix auth response missing credentials")),
    }
}

async fn check_matrix_response(
    path: &str,
    response: reqwest::Response,
) -> Result<serde_json::Value> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if !status.is_success() {
        let errcode = body.get("errcode").and_then(|v| v.as_str()).unwrap_or("unknown");
        let error = body.get("error").and_then(|v| v.as_str()).unwrap_or("unknown");
        return Err(anyhow!(
            "matrix request {path} failed: status={status} errcode={errcode} error={error}"
        ));
    }
    Ok(body)
}

fn normalize_homeserver_url(raw: &str) -> Result<String> {
    let normalized = raw.trim().trim_end_matches('/').to_string();
    if normalized.is_empty() {
        return Err(anyhow!("matrix homeserver URL is required"));
    }
    let parsed =
        Url::parse(&normalized).map_err(|e| anyhow!("invalid matrix homeserver URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => Ok(normalized),
        other => Err(anyhow!(
            "invalid matrix homeserver URL scheme: {other} (expected http or https)"
        )),
    }
}

/// Convert a raw sync event into a [`RoomMessage`], filtering out anything
/// the runtime should never see: non-message events, redacted bodies,
/// unknown msgtypes, and the persona's own messages.
fn room_message_from_event(
    room_id: &str,
    event: &MatrixEvent,
    self_user_id: &UserId,
) -> Option<RoomMessage> {
    if event.event_type != "m.room.message" {
        return None;
    }
    let event_id = event.event_id.as_deref()?;
    let sender = event.sender.as_deref()?;
    if sender == self_user_id.as_str() {
        return None;
    }
    let kind = match event.content.get("msgtype").and_then(|v| v.as_str()) {
        Some("m.text") => RoomMessageKind::Text,
        Some("m.emote") => RoomMessageKind::Emote,
        _ => return None,
    };
    let body = event.content.get("body")?.as_str()?;
    if body.trim().is_empty() {
        return None;
    }
    Some(RoomMessage {
        room_id: RoomId::new(room_id),
        event_id: EventId::new(event_id),
        sender: UserId::new(sender),
        kind,
        body: body.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct MatrixSyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: MatrixSyncRooms,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixSyncRooms {
    #[serde(default)]
    join: HashMap<String, MatrixSyncJoinedRoom>,
    #[serde(default)]
    invite: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixSyncJoinedRoom {
    #[serde(default)]
    timeline: MatrixSyncTimeline,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixSyncTimeline {
    #[serde(default)]
    events: Vec<MatrixEvent>,
}

#[derive(Debug, Clone, Deserialize)]
struct MatrixEvent {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MatrixAuthResponse {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
}
