use log::{debug, error, info, warn};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::library::LibraryItem;
use crate::session::{Chapter, ItemKind, Marker, MediaItem};
use crate::APP_NAME;

const PLEX_TV_API: &str = "https://plex.tv/api/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Companion ports by product, for the direct-connection fallback.
const CLIENT_PORTS: [(&str, u16); 7] = [
    ("Plex for Roku", 8324),
    ("Plex for Android (TV)", 32500),
    ("Plex for Android (Mobile)", 32500),
    ("Plex for iOS", 32500),
    ("Plex for Apple TV", 32500),
    ("Plex for Windows", 32700),
    ("Plex for Mac", 32700),
];

/// Products that only answer commands proxied through the server.
pub const PROXY_ONLY: [&str; 4] =
    ["Plex Web", "Plex for Windows", "Plex for Mac", "Plex for Linux"];

const DEFAULT_CLIENT_PORT: u16 = 32500;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no plex server settings specified, please update your configuration file")]
    NotConfigured,
    #[error("unable to authenticate with plex.tv: {0}")]
    Authentication(String),
    #[error("server {0} not found on plex.tv account")]
    ServerNotFound(String),
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),
    #[error("unexpected response from server: {0}")]
    UnexpectedResponse(String),
}

/// Failures from player command RPCs, split the way the engine reacts to
/// them: timeouts rebuild the session, bad requests suppress the tick.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("request timed out")]
    Timeout(#[source] reqwest::Error),
    #[error("player rejected the command: {0}")]
    BadRequest(String),
    #[error("player not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl CommandError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            CommandError::Timeout(e)
        } else {
            CommandError::Transport(e)
        }
    }
}

/// Player identity as carried on a session snapshot.
#[derive(Debug, Clone)]
pub struct PlayerDescriptor {
    pub title: String,
    pub product: String,
    pub version: String,
    pub machine_identifier: String,
    pub address: String,
    pub state: String,
}

/// A registered, addressable player. Commands go through the server unless a
/// direct base URL has been configured or discovered.
#[derive(Debug, Clone)]
pub struct PlayerHandle {
    pub title: String,
    pub product: String,
    pub machine_identifier: String,
    pub address: String,
    pub base_url: Option<String>,
    pub proxy_through_server: bool,
}

#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: Option<i64>,
    pub title: String,
}

/// Snapshot of one active playback session from `/status/sessions`.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_key: i64,
    pub media: MediaItem,
    pub player: PlayerDescriptor,
    pub user: UserInfo,
    pub view_offset: i64,
    pub location: String,
    pub play_queue_item_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PlayQueue {
    pub id: i64,
    pub selected_item_id: Option<i64>,
    pub items: Vec<PlayQueueItem>,
}

#[derive(Debug, Clone)]
pub struct PlayQueueItem {
    pub rating_key: i64,
    pub play_queue_item_id: Option<i64>,
    pub title: String,
}

impl PlayQueue {
    pub fn position_of(&self, rating_key: i64) -> Option<usize> {
        self.items.iter().position(|i| i.rating_key == rating_key)
    }
}

pub struct PlexServer {
    base_url: String,
    host: String,
    port: u16,
    token: String,
    machine_identifier: String,
    friendly_name: String,
    client: Client,
    accept_invalid_certs: bool,
    command_id: AtomicU64,
    players: Mutex<HashMap<String, PlayerHandle>>,
}

impl PlexServer {
    /// Connect using the plex.tv account when a username and server name are
    /// configured (token first, password fallback), otherwise directly to the
    /// configured address with the token.
    pub async fn connect(config: &crate::config::Config) -> Result<Self, ServerError> {
        let plex_tv = &config.plex_tv;
        let server = &config.server;

        if plex_tv.username.is_empty() && server.address.is_empty() {
            return Err(ServerError::NotConfigured);
        }

        let accept_invalid_certs = config.security.ignore_certs;
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        if !plex_tv.username.is_empty() && !plex_tv.servername.is_empty() {
            match Self::connect_via_account(&client, config, accept_invalid_certs).await {
                Ok(server) => {
                    info!(
                        "Connected to Plex server {} using plex.tv account",
                        server.friendly_name
                    );
                    if !config.server.address.is_empty() {
                        debug!("Connected using plex.tv account, ignoring manual server settings");
                    }
                    return Ok(server);
                }
                Err(e) => warn!("Error connecting via plex.tv account: {}", e),
            }
        }

        if !server.address.is_empty() && !plex_tv.token.is_empty() {
            let protocol = if server.ssl { "https" } else { "http" };
            let address = strip_address(&server.address);
            let base_url = format!("{}://{}:{}", protocol, address, server.port);
            let connected = Self::from_base_url(
                client,
                base_url,
                plex_tv.token.clone(),
                accept_invalid_certs,
            )
            .await?;
            info!(
                "Connected to Plex server {} using server settings",
                connected.friendly_name
            );
            return Ok(connected);
        }

        Err(ServerError::NotConfigured)
    }

    async fn connect_via_account(
        client: &Client,
        config: &crate::config::Config,
        accept_invalid_certs: bool,
    ) -> Result<Self, ServerError> {
        let plex_tv = &config.plex_tv;

        let mut token = None;
        if !plex_tv.token.is_empty()
            && Self::validate_token(client, &plex_tv.token).await
        {
            token = Some(plex_tv.token.clone());
        } else if !plex_tv.token.is_empty() {
            debug!("Unable to connect using token, falling back to password");
        }
        if token.is_none() && !plex_tv.password.is_empty() {
            token = Self::sign_in(client, &plex_tv.username, &plex_tv.password).await;
        }
        let token = token.ok_or_else(|| {
            ServerError::Authentication("no usable token or password".to_string())
        })?;

        let resources: Vec<PlexResource> = client
            .get(format!("{}/resources", PLEX_TV_API))
            .header("Accept", "application/json")
            .header("X-Plex-Token", &token)
            .header("X-Plex-Client-Identifier", APP_NAME)
            .query(&[("includeHttps", "1"), ("includeRelay", "1")])
            .send()
            .await?
            .json()
            .await?;

        let resource = resources
            .into_iter()
            .filter(|r| r.provides.contains("server"))
            .find(|r| r.name == plex_tv.servername)
            .ok_or_else(|| ServerError::ServerNotFound(plex_tv.servername.clone()))?;

        let access_token = resource.access_token.unwrap_or(token);

        // Prefer local connections, they are the ones the skipper can reach
        // players through with the least latency.
        let mut connections = resource.connections;
        connections.sort_by_key(|c| !c.local);

        for conn in connections {
            match Self::from_base_url(
                client.clone(),
                conn.uri.trim_end_matches('/').to_string(),
                access_token.clone(),
                accept_invalid_certs,
            )
            .await
            {
                Ok(server) => return Ok(server),
                Err(e) => debug!("Connection to {} failed: {}", conn.uri, e),
            }
        }

        Err(ServerError::ServerNotFound(plex_tv.servername.clone()))
    }

    async fn validate_token(client: &Client, token: &str) -> bool {
        client
            .get(format!("{}/user", PLEX_TV_API))
            .header("Accept", "application/json")
            .header("X-Plex-Token", token)
            .header("X-Plex-Client-Identifier", APP_NAME)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn sign_in(client: &Client, username: &str, password: &str) -> Option<String> {
        let response = client
            .post(format!("{}/users/signin", PLEX_TV_API))
            .header("Accept", "application/json")
            .header("X-Plex-Client-Identifier", APP_NAME)
            .form(&[("login", username), ("password", password)])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            debug!("Unable to connect using username/password");
            return None;
        }
        let json: serde_json::Value = response.json().await.ok()?;
        json["authToken"].as_str().map(String::from)
    }

    async fn from_base_url(
        client: Client,
        base_url: String,
        token: String,
        accept_invalid_certs: bool,
    ) -> Result<Self, ServerError> {
        let identity: IdentityResponse = client
            .get(format!("{}/", base_url))
            .header("Accept", "application/json")
            .header("X-Plex-Token", &token)
            .send()
            .await?
            .json()
            .await?;

        let url = url::Url::parse(&base_url)
            .map_err(|e| ServerError::UnexpectedResponse(e.to_string()))?;
        let host = url.host_str().unwrap_or_default().to_string();
        let port = url.port_or_known_default().unwrap_or(32400);

        Ok(PlexServer {
            base_url,
            host,
            port,
            token,
            machine_identifier: identity.media_container.machine_identifier,
            friendly_name: identity.media_container.friendly_name,
            client,
            accept_invalid_certs,
            command_id: AtomicU64::new(1),
            players: Mutex::new(HashMap::new()),
        })
    }

    pub fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    pub fn accept_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }

    /// The websocket notification endpoint for the alert listener.
    pub fn websocket_url(&self) -> String {
        let ws_base = self
            .base_url
            .replacen("http", "ws", 1);
        format!("{}/:/websockets/notifications?X-Plex-Token={}", ws_base, self.token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ServerError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Accept", "application/json")
            .header("X-Plex-Token", &self.token)
            .header("X-Plex-Client-Identifier", APP_NAME)
            .query(params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServerError::UnexpectedResponse(format!(
                "{} returned {}",
                path,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Snapshot of the currently active playback sessions.
    pub async fn sessions(&self) -> Result<Vec<SessionRecord>, ServerError> {
        let response: MetadataResponse = self.get_json("/status/sessions", &[]).await?;
        Ok(response
            .media_container
            .metadata
            .into_iter()
            .filter_map(SessionMetadata::into_record)
            .collect())
    }

    pub async fn session_by_key(&self, session_key: i64) -> Option<SessionRecord> {
        match self.sessions().await {
            Ok(sessions) => sessions.into_iter().find(|s| s.session_key == session_key),
            Err(e) => {
                error!("Error fetching sessions: {}", e);
                None
            }
        }
    }

    /// Walk the whole library: top-level items plus every season and episode
    /// of every show. Used once at startup to build the identifier index.
    pub async fn library_items(&self) -> Result<Vec<LibraryItem>, ServerError> {
        let sections: SectionsResponse = self.get_json("/library/sections", &[]).await?;
        let mut items = Vec::new();

        for section in sections.media_container.directory {
            let path = format!("/library/sections/{}/all", section.key);
            let response: MetadataResponse = match self.get_json(&path, &[]).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("Unable to list section {}: {}", section.title, e);
                    continue;
                }
            };
            for meta in response.media_container.metadata {
                let is_show = meta.media_type.as_deref() == Some("show");
                let Some(item) = meta.into_library_item() else { continue };
                let rating_key = item.rating_key;
                items.push(item);
                if is_show {
                    self.collect_show_children(rating_key, &mut items).await;
                }
            }
        }

        Ok(items)
    }

    async fn collect_show_children(&self, show_key: i64, items: &mut Vec<LibraryItem>) {
        let children = format!("/library/metadata/{}/children", show_key);
        if let Ok(response) = self.get_json::<MetadataResponse>(&children, &[]).await {
            items.extend(
                response
                    .media_container
                    .metadata
                    .into_iter()
                    .filter_map(SessionMetadata::into_library_item),
            );
        }
        let leaves = format!("/library/metadata/{}/allLeaves", show_key);
        if let Ok(response) = self.get_json::<MetadataResponse>(&leaves, &[]).await {
            items.extend(
                response
                    .media_container
                    .metadata
                    .into_iter()
                    .filter_map(SessionMetadata::into_library_item),
            );
        }
    }

    /// One library item with its markers and chapters included.
    pub async fn item_metadata(&self, rating_key: i64) -> Result<Option<MediaItem>, ServerError> {
        let path = format!("/library/metadata/{}", rating_key);
        let response: MetadataResponse = self
            .get_json(&path, &[("includeMarkers", "1".to_string())])
            .await?;
        Ok(response
            .media_container
            .metadata
            .into_iter()
            .next()
            .and_then(SessionMetadata::into_media_item))
    }

    pub async fn play_queue(&self, id: i64) -> Result<PlayQueue, ServerError> {
        let path = format!("/playQueues/{}", id);
        let response: PlayQueueResponse =
            self.get_json(&path, &[("own", "1".to_string())]).await?;
        Ok(response.media_container.into_play_queue())
    }

    /// Build a new play queue over `items` starting at `start_key`.
    pub async fn create_play_queue(
        &self,
        items: &[i64],
        start_key: i64,
    ) -> Result<PlayQueue, ServerError> {
        let keys: Vec<String> = items.iter().map(|k| k.to_string()).collect();
        let uri = format!(
            "server://{}/com.plexapp.plugins.library/library/metadata/{}",
            self.machine_identifier,
            keys.join(",")
        );
        let response = self
            .client
            .post(format!("{}/playQueues", self.base_url))
            .header("Accept", "application/json")
            .header("X-Plex-Token", &self.token)
            .header("X-Plex-Client-Identifier", APP_NAME)
            .query(&[
                ("type", "video".to_string()),
                ("uri", uri),
                ("key", format!("/library/metadata/{}", start_key)),
                ("shuffle", "0".to_string()),
                ("repeat", "0".to_string()),
                ("continuous", "0".to_string()),
                ("own", "1".to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServerError::UnexpectedResponse(format!(
                "playQueues returned {}",
                response.status()
            )));
        }
        let response: PlayQueueResponse = response.json().await?;
        Ok(response.media_container.into_play_queue())
    }

    /// Register (or refresh) a player in the server-scoped registry. A custom
    /// base URL pins the player to a direct connection; otherwise commands
    /// proxy through the server.
    pub fn register_player(&self, descriptor: &PlayerDescriptor, base_override: Option<&str>) {
        let handle = match base_override {
            Some(base) => {
                let base = base.trim_end_matches('/');
                let base_url = if base.starts_with("http://") || base.starts_with("https://") {
                    base.to_string()
                } else {
                    format!("http://{}", base)
                };
                debug!(
                    "Overriding player {} with custom baseURL {}, will not proxy through server",
                    descriptor.title, base_url
                );
                PlayerHandle {
                    title: descriptor.title.clone(),
                    product: descriptor.product.clone(),
                    machine_identifier: descriptor.machine_identifier.clone(),
                    address: descriptor.address.clone(),
                    base_url: Some(base_url),
                    proxy_through_server: false,
                }
            }
            None => PlayerHandle {
                title: descriptor.title.clone(),
                product: descriptor.product.clone(),
                machine_identifier: descriptor.machine_identifier.clone(),
                address: descriptor.address.clone(),
                base_url: None,
                proxy_through_server: true,
            },
        };
        self.players
            .lock()
            .unwrap()
            .insert(descriptor.machine_identifier.clone(), handle);
    }

    pub fn player(&self, machine_identifier: &str) -> Option<PlayerHandle> {
        self.players.lock().unwrap().get(machine_identifier).cloned()
    }

    /// Downgrade a proxied player to a direct companion connection, used as
    /// the fallback after a proxied command is rejected. Proxy-only products
    /// have nothing to fall back on.
    pub async fn fallback_direct(&self, player: &PlayerHandle) -> Option<PlayerHandle> {
        if PROXY_ONLY.contains(&player.product.as_str()) {
            debug!(
                "Player {} ({}) does not support direct connections, nothing to fall back upon",
                player.title, player.product
            );
            return None;
        }
        if !player.proxy_through_server {
            debug!(
                "Player {} ({}) is already not proxying through server, no fallback options left",
                player.title, player.product
            );
            return None;
        }

        let port = self
            .client_port(&player.machine_identifier)
            .await
            .or_else(|| {
                CLIENT_PORTS
                    .iter()
                    .find(|(product, _)| *product == player.product)
                    .map(|(_, port)| *port)
            })
            .unwrap_or(DEFAULT_CLIENT_PORT);

        let base_url = format!("http://{}:{}", player.address, port);
        debug!(
            "Modifying client for direct connection using baseURL {} for player {}",
            base_url, player.title
        );
        let handle = PlayerHandle {
            base_url: Some(base_url),
            proxy_through_server: false,
            ..player.clone()
        };
        self.players
            .lock()
            .unwrap()
            .insert(handle.machine_identifier.clone(), handle.clone());
        Some(handle)
    }

    async fn client_port(&self, machine_identifier: &str) -> Option<u16> {
        let response: ClientsResponse = self.get_json("/clients", &[]).await.ok()?;
        response
            .media_container
            .server
            .into_iter()
            .find(|c| c.machine_identifier == machine_identifier)
            .and_then(|c| c.port)
            .map(|p| p as u16)
    }

    async fn player_request(
        &self,
        player: &PlayerHandle,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String, CommandError> {
        let command_id = self.command_id.fetch_add(1, Ordering::Relaxed);
        let base = match (&player.base_url, player.proxy_through_server) {
            (Some(base), false) => base.as_str(),
            _ => self.base_url.as_str(),
        };
        let response = self
            .client
            .get(format!("{}{}", base, path))
            .header("X-Plex-Token", &self.token)
            .header("X-Plex-Client-Identifier", APP_NAME)
            .header("X-Plex-Target-Client-Identifier", &player.machine_identifier)
            .query(params)
            .query(&[("commandID", command_id.to_string())])
            .send()
            .await
            .map_err(CommandError::from_reqwest)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => Err(CommandError::NotFound(format!(
                "unable to find player with identifier {}: {}",
                player.machine_identifier, body
            ))),
            StatusCode::BAD_REQUEST => Err(CommandError::BadRequest(body)),
            StatusCode::FORBIDDEN => {
                Err(CommandError::BadRequest(format!("HTTP Error 403: Forbidden: {}", body)))
            }
            s if s.is_success() => Ok(body),
            s => Err(CommandError::BadRequest(format!("{}: {}", s, body))),
        }
    }

    pub async fn seek_player(
        &self,
        player: &PlayerHandle,
        offset: i64,
    ) -> Result<(), CommandError> {
        // Players that answer with malformed XML here still seek; the body is
        // ignored on purpose.
        self.player_request(
            player,
            "/player/playback/seekTo",
            &[("offset", offset.to_string()), ("type", "video".to_string())],
        )
        .await
        .map(|_| ())
    }

    pub async fn set_player_volume(
        &self,
        player: &PlayerHandle,
        volume: u8,
    ) -> Result<(), CommandError> {
        self.player_request(
            player,
            "/player/playback/setParameters",
            &[("volume", volume.to_string()), ("type", "video".to_string())],
        )
        .await
        .map(|_| ())
    }

    pub async fn stop_player(&self, player: &PlayerHandle) -> Result<(), CommandError> {
        self.player_request(
            player,
            "/player/playback/stop",
            &[("type", "video".to_string())],
        )
        .await
        .map(|_| ())
    }

    pub async fn play_media(
        &self,
        player: &PlayerHandle,
        queue: &PlayQueue,
        start_key: i64,
    ) -> Result<(), CommandError> {
        self.player_request(
            player,
            "/player/playback/playMedia",
            &[
                ("machineIdentifier", self.machine_identifier.clone()),
                ("address", self.host.clone()),
                ("port", self.port.to_string()),
                ("key", format!("/library/metadata/{}", start_key)),
                ("offset", "0".to_string()),
                (
                    "containerKey",
                    format!("/playQueues/{}?window=100&own=1", queue.id),
                ),
            ],
        )
        .await
        .map(|_| ())
    }

    /// The player's current volume from its timeline, if it reports one.
    /// Unparseable timeline responses read as "no volume available".
    pub async fn player_volume(&self, player: &PlayerHandle) -> Result<Option<u8>, CommandError> {
        let body = self
            .player_request(
                player,
                "/player/timeline/poll",
                &[("wait", "0".to_string())],
            )
            .await?;
        Ok(parse_timeline_volume(&body))
    }
}

fn strip_address(address: &str) -> &str {
    let mut address = address;
    for prefix in ["http://", "https://"] {
        if let Some(stripped) = address.strip_prefix(prefix) {
            address = stripped;
        }
    }
    address.trim_end_matches('/')
}

fn parse_timeline_volume(body: &str) -> Option<u8> {
    let container: TimelineContainer = quick_xml::de::from_str(body).ok()?;
    container
        .timelines
        .iter()
        .find(|t| t.timeline_type.as_deref() == Some("video") && t.volume.is_some())
        .or_else(|| container.timelines.iter().find(|t| t.volume.is_some()))
        .and_then(|t| t.volume)
}

// Plex ratingKeys and sessionKeys arrive as JSON strings; numbers are
// accepted too for good measure.
fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdentityResponse {
    media_container: IdentityContainer,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityContainer {
    machine_identifier: String,
    #[serde(default)]
    friendly_name: String,
}

#[derive(Deserialize)]
struct PlexResource {
    name: String,
    provides: String,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(default)]
    connections: Vec<PlexConnection>,
}

#[derive(Deserialize)]
struct PlexConnection {
    uri: String,
    #[serde(default)]
    local: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SectionsResponse {
    media_container: SectionsContainer,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SectionsContainer {
    #[serde(default)]
    directory: Vec<SectionEntry>,
}

#[derive(Deserialize)]
struct SectionEntry {
    key: String,
    title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataResponse {
    media_container: MetadataContainer,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataContainer {
    #[serde(default)]
    metadata: Vec<SessionMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionMetadata {
    #[serde(default, deserialize_with = "de_opt_i64")]
    session_key: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    rating_key: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    parent_rating_key: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    grandparent_rating_key: Option<i64>,
    #[serde(rename = "type")]
    media_type: Option<String>,
    title: Option<String>,
    grandparent_title: Option<String>,
    parent_index: Option<u32>,
    index: Option<u32>,
    duration: Option<i64>,
    view_offset: Option<i64>,
    view_count: Option<u64>,
    library_section_title: Option<String>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    play_queue_item_id: Option<i64>,
    #[serde(rename = "Marker", default)]
    markers: Vec<MarkerEntry>,
    #[serde(rename = "Chapter", default)]
    chapters: Vec<ChapterEntry>,
    #[serde(rename = "Guid", default)]
    guids: Vec<GuidTag>,
    #[serde(rename = "Player")]
    player: Option<PlayerEntry>,
    #[serde(rename = "User")]
    user: Option<UserEntry>,
    #[serde(rename = "Session")]
    session: Option<SessionEntry>,
}

impl SessionMetadata {
    fn into_record(self) -> Option<SessionRecord> {
        let session_key = self.session_key?;
        let player = self.player.as_ref()?;
        let player = PlayerDescriptor {
            title: player.title.clone().unwrap_or_else(|| "Player".to_string()),
            product: player.product.clone().unwrap_or_default(),
            version: player.version.clone().unwrap_or_default(),
            machine_identifier: player.machine_identifier.clone()?,
            address: player.address.clone().unwrap_or_default(),
            state: player.state.clone().unwrap_or_default(),
        };
        let user = UserInfo {
            id: self.user.as_ref().and_then(|u| u.id),
            title: self
                .user
                .as_ref()
                .map(|u| u.title.clone())
                .unwrap_or_default(),
        };
        let location = self
            .session
            .as_ref()
            .and_then(|s| s.location.clone())
            .unwrap_or_default();
        let view_offset = self.view_offset.unwrap_or(0);
        let play_queue_item_id = self.play_queue_item_id;
        Some(SessionRecord {
            session_key,
            media: self.into_media_item()?,
            player,
            user,
            view_offset,
            location,
            play_queue_item_id,
        })
    }

    fn into_media_item(self) -> Option<MediaItem> {
        let rating_key = self.rating_key?;
        let kind = match self.media_type.as_deref() {
            Some("movie") => ItemKind::Movie,
            Some("episode") => ItemKind::Episode {
                parent_key: self.parent_rating_key,
                grandparent_key: self.grandparent_rating_key,
                season: self.parent_index,
                episode: self.index,
            },
            Some("season") => ItemKind::Season { parent_key: self.parent_rating_key },
            Some("show") => ItemKind::Show,
            Some(other) => ItemKind::Other(other.to_string()),
            None => return None,
        };
        Some(MediaItem {
            rating_key,
            kind,
            title: self.title.unwrap_or_default(),
            grandparent_title: self.grandparent_title,
            duration: self.duration.unwrap_or(0),
            watched: self.view_count.unwrap_or(0) > 0,
            markers: self
                .markers
                .into_iter()
                .map(|m| Marker {
                    marker_type: m.marker_type.unwrap_or_default(),
                    start: m.start_time_offset,
                    end: m.end_time_offset,
                })
                .collect(),
            chapters: self
                .chapters
                .into_iter()
                .map(|c| Chapter {
                    title: c.tag.unwrap_or_default(),
                    start: c.start_time_offset,
                    end: c.end_time_offset,
                })
                .collect(),
            library_section: self.library_section_title,
            guids: self.guids.into_iter().map(|g| g.id).collect(),
        })
    }

    fn into_library_item(self) -> Option<LibraryItem> {
        let rating_key = self.rating_key?;
        Some(LibraryItem {
            rating_key,
            kind: self.media_type.unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            guids: self.guids.into_iter().map(|g| g.id).collect(),
            parent_key: self.parent_rating_key,
            grandparent_key: self.grandparent_rating_key,
            season_number: self.parent_index,
            episode_number: self.index,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkerEntry {
    #[serde(rename = "type")]
    marker_type: Option<String>,
    #[serde(default)]
    start_time_offset: i64,
    #[serde(default)]
    end_time_offset: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterEntry {
    tag: Option<String>,
    #[serde(default)]
    start_time_offset: i64,
    #[serde(default)]
    end_time_offset: i64,
}

#[derive(Deserialize)]
struct GuidTag {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerEntry {
    title: Option<String>,
    product: Option<String>,
    version: Option<String>,
    machine_identifier: Option<String>,
    address: Option<String>,
    state: Option<String>,
}

#[derive(Deserialize)]
struct UserEntry {
    #[serde(default, deserialize_with = "de_opt_i64")]
    id: Option<i64>,
    #[serde(default)]
    title: String,
}

#[derive(Deserialize)]
struct SessionEntry {
    location: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlayQueueResponse {
    media_container: PlayQueueContainer,
}

#[derive(Deserialize)]
struct PlayQueueContainer {
    #[serde(rename = "playQueueID", default)]
    play_queue_id: i64,
    #[serde(rename = "playQueueSelectedItemID")]
    selected_item_id: Option<i64>,
    #[serde(rename = "Metadata", default)]
    metadata: Vec<PlayQueueEntry>,
}

impl PlayQueueContainer {
    fn into_play_queue(self) -> PlayQueue {
        PlayQueue {
            id: self.play_queue_id,
            selected_item_id: self.selected_item_id,
            items: self
                .metadata
                .into_iter()
                .filter_map(|m| {
                    Some(PlayQueueItem {
                        rating_key: m.rating_key?,
                        play_queue_item_id: m.play_queue_item_id,
                        title: m.title.unwrap_or_default(),
                    })
                })
                .collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayQueueEntry {
    #[serde(default, deserialize_with = "de_opt_i64")]
    rating_key: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_i64")]
    play_queue_item_id: Option<i64>,
    title: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClientsResponse {
    media_container: ClientsContainer,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClientsContainer {
    #[serde(default)]
    server: Vec<ClientEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientEntry {
    machine_identifier: String,
    #[serde(default, deserialize_with = "de_opt_i64")]
    port: Option<i64>,
}

#[derive(Deserialize)]
struct TimelineContainer {
    #[serde(rename = "Timeline", default)]
    timelines: Vec<TimelineEntry>,
}

#[derive(Deserialize)]
struct TimelineEntry {
    #[serde(rename = "@type")]
    timeline_type: Option<String>,
    #[serde(rename = "@volume")]
    volume: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_metadata_parses_string_keys() {
        let doc = r#"{
            "MediaContainer": {
                "Metadata": [{
                    "sessionKey": "93",
                    "ratingKey": "32881",
                    "parentRatingKey": "32000",
                    "grandparentRatingKey": "31000",
                    "type": "episode",
                    "title": "Pilot",
                    "grandparentTitle": "Some Show",
                    "parentIndex": 1,
                    "index": 1,
                    "duration": 1500000,
                    "viewOffset": 2000,
                    "viewCount": 1,
                    "librarySectionTitle": "TV Shows",
                    "Marker": [{"type": "intro", "startTimeOffset": 1000, "endTimeOffset": 2000}],
                    "Chapter": [{"tag": "Opening", "startTimeOffset": 0, "endTimeOffset": 30000}],
                    "Guid": [{"id": "tmdb://1399"}],
                    "Player": {
                        "title": "Living Room",
                        "product": "Plex for Apple TV",
                        "machineIdentifier": "client-1",
                        "address": "10.0.0.2",
                        "state": "playing"
                    },
                    "User": {"id": "1", "title": "viewer"},
                    "Session": {"location": "lan"}
                }]
            }
        }"#;
        let parsed: MetadataResponse = serde_json::from_str(doc).unwrap();
        let record = parsed
            .media_container
            .metadata
            .into_iter()
            .next()
            .unwrap()
            .into_record()
            .unwrap();
        assert_eq!(record.session_key, 93);
        assert_eq!(record.media.rating_key, 32881);
        assert_eq!(record.location, "lan");
        assert!(record.media.watched);
        assert_eq!(record.media.markers[0].marker_type, "intro");
        assert_eq!(record.media.chapters[0].title, "Opening");
        assert!(matches!(
            record.media.kind,
            ItemKind::Episode { season: Some(1), episode: Some(1), .. }
        ));
    }

    #[test]
    fn timeline_volume_parses_from_xml() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
            <MediaContainer commandID="4">
                <Timeline type="music" state="stopped"/>
                <Timeline type="video" state="playing" time="1000" volume="85"/>
            </MediaContainer>"#;
        assert_eq!(parse_timeline_volume(body), Some(85));
    }

    #[test]
    fn malformed_timeline_reads_as_no_volume() {
        assert_eq!(parse_timeline_volume("<not<valid<xml"), None);
        assert_eq!(parse_timeline_volume(""), None);
    }

    #[test]
    fn play_queue_position_lookup() {
        let queue = PlayQueue {
            id: 7,
            selected_item_id: None,
            items: vec![
                PlayQueueItem { rating_key: 1, play_queue_item_id: Some(10), title: "a".into() },
                PlayQueueItem { rating_key: 2, play_queue_item_id: Some(11), title: "b".into() },
            ],
        };
        assert_eq!(queue.position_of(2), Some(1));
        assert_eq!(queue.position_of(9), None);
    }

    #[test]
    fn address_stripping() {
        assert_eq!(strip_address("https://plex.local/"), "plex.local");
        assert_eq!(strip_address("http://10.0.0.5"), "10.0.0.5");
        assert_eq!(strip_address("plex.local"), "plex.local");
    }
}
