use log::{debug, error};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, SkipMode};
use crate::custom_entries::{CustomEntries, CustomMarker, RawMarker};
use crate::server::{PlayerDescriptor, SessionRecord, UserInfo};

/// A session is considered finished once it is past this share of the item.
pub const DURATION_TOLERANCE: f64 = 0.995;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Buffering,
}

impl PlaybackState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "playing" => Some(PlaybackState::Playing),
            "paused" => Some(PlaybackState::Paused),
            "stopped" => Some(PlaybackState::Stopped),
            "buffering" => Some(PlaybackState::Buffering),
            _ => None,
        }
    }
}

/// The media variants the server reports. Episodes carry their season/show
/// ancestry so the rule layering can walk grandparent, parent, item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Movie,
    Episode {
        parent_key: Option<i64>,
        grandparent_key: Option<i64>,
        season: Option<u32>,
        episode: Option<u32>,
    },
    Season {
        parent_key: Option<i64>,
    },
    Show,
    Other(String),
}

impl ItemKind {
    pub fn type_name(&self) -> &str {
        match self {
            ItemKind::Movie => "movie",
            ItemKind::Episode { .. } => "episode",
            ItemKind::Season { .. } => "season",
            ItemKind::Show => "show",
            ItemKind::Other(name) => name,
        }
    }
}

/// A typed half-open range on the item, as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub marker_type: String,
    pub start: i64,
    pub end: i64,
}

/// A titled half-open range, separately modeled by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone)]
pub struct MediaItem {
    pub rating_key: i64,
    pub kind: ItemKind,
    pub title: String,
    pub grandparent_title: Option<String>,
    pub duration: i64,
    pub watched: bool,
    pub markers: Vec<Marker>,
    pub chapters: Vec<Chapter>,
    pub library_section: Option<String>,
    pub guids: Vec<String>,
}

impl MediaItem {
    /// Ancestor keys in layering order: grandparent, then parent, then the
    /// item itself.
    pub fn layer_keys(&self) -> Vec<i64> {
        let mut keys = Vec::with_capacity(3);
        if let ItemKind::Episode { parent_key, grandparent_key, .. } = &self.kind {
            if let Some(gp) = grandparent_key {
                keys.push(*gp);
            }
            if let Some(p) = parent_key {
                keys.push(*p);
            }
        }
        if let ItemKind::Season { parent_key: Some(p) } = &self.kind {
            keys.push(*p);
        }
        keys.push(self.rating_key);
        keys
    }

    pub fn season_episode(&self) -> Option<(u32, u32)> {
        match self.kind {
            ItemKind::Episode { season: Some(s), episode: Some(e), .. } => Some((s, e)),
            _ => None,
        }
    }
}

/// Identity of one in-flight playback. `session_key` alone is not unique
/// across reconnects, so the client identifier is part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub session_key: i64,
    pub client_identifier: String,
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.session_key, self.client_identifier)
    }
}

/// One tracked playback session: identity, resolved effective rules,
/// projected position, and the seek interlock.
#[derive(Debug, Clone)]
pub struct MediaSession {
    pub id: SessionId,
    pub media: Arc<MediaItem>,
    pub player: PlayerDescriptor,
    pub user: UserInfo,
    pub play_queue_id: i64,

    pub state: PlaybackState,
    pub ended: bool,
    view_offset: i64,

    pub seek_origin: i64,
    pub seek_target: i64,

    pub left_offset: i64,
    pub right_offset: i64,
    pub offset_tags: Vec<String>,
    pub tags: Vec<String>,
    pub mode: SkipMode,
    pub skip_next: bool,
    pub command_delay: Option<u64>,

    pub custom_only: bool,
    pub custom_markers: Vec<CustomMarker>,
    pub markers: Vec<Marker>,
    pub chapters: Vec<Chapter>,
    pub last_chapter: Option<Chapter>,

    pub cached_volume: u8,
    pub lowering_volume: bool,

    pub last_update: Instant,
    pub last_alert: Instant,
    pub last_seek: Option<Instant>,
}

impl MediaSession {
    pub fn new(
        record: SessionRecord,
        state: PlaybackState,
        play_queue_id: i64,
        config: &Config,
        custom: &CustomEntries,
    ) -> Self {
        let media = Arc::new(record.media);
        let mut session = MediaSession {
            id: SessionId {
                session_key: record.session_key,
                client_identifier: record.player.machine_identifier.clone(),
            },
            media: Arc::clone(&media),
            player: record.player,
            user: record.user,
            play_queue_id,
            state,
            ended: false,
            view_offset: record.view_offset,
            seek_origin: 0,
            seek_target: 0,
            left_offset: 0,
            right_offset: 0,
            offset_tags: config.offsets.tags.clone(),
            tags: config.skip.tags.clone(),
            mode: config.skip.mode,
            skip_next: config.skip.next,
            command_delay: None,
            custom_only: false,
            custom_markers: Vec::new(),
            markers: Vec::new(),
            chapters: Vec::new(),
            last_chapter: None,
            cached_volume: config.volume.high,
            lowering_volume: false,
            last_update: Instant::now(),
            last_alert: Instant::now(),
            last_seek: None,
        };
        session.apply_custom_entries(custom);
        session.update_markers();
        session.last_chapter = media.chapters.last().cloned();
        session
    }

    /// Layer the custom-entries document over the config defaults:
    /// grandparent, then parent, then the item itself, with per-player
    /// overlays last. Lower-priority markers survive a more specific layer
    /// only when their cascade bit is set.
    fn apply_custom_entries(&mut self, custom: &CustomEntries) {
        let mut collected: Vec<(RawMarker, i64)> = Vec::new();

        for key in self.media.layer_keys() {
            if let Some(markers) = custom.markers_for(key) {
                let kept: Vec<(RawMarker, i64)> =
                    collected.iter().filter(|(m, _)| m.cascade_enabled()).cloned().collect();
                if kept.len() != collected.len() {
                    debug!(
                        "Better markers found for key {}, clearing {} previous marker(s)",
                        key,
                        collected.len() - kept.len()
                    );
                }
                collected = kept;
                for marker in markers {
                    collected.push((marker.clone(), key));
                }
            }
            if let Some(offsets) = custom.offsets_for(key) {
                if let Some(start) = offsets.start {
                    self.left_offset = start;
                }
                if let Some(end) = offsets.end {
                    self.right_offset = end;
                }
                if let Some(tags) = &offsets.tags {
                    self.offset_tags = tags.clone();
                }
            }
            if let Some(tags) = custom.tags_for(key) {
                self.tags = tags.to_vec();
            }
            if let Some(mode) = custom.mode_for_key(key) {
                self.mode = mode;
            }
        }

        let title = self.player.title.clone();
        let identifier = self.id.client_identifier.clone();
        if let Some(mode) = custom.mode_for_client(&title, &identifier) {
            self.mode = mode;
        }
        if let Some(delay) = custom.command_delay_for_client(&title, &identifier) {
            self.command_delay = Some(delay);
        }
        if custom.allowed.skip_next_matches(&title, &identifier) {
            self.skip_next = true;
        }
        if custom.blocked.skip_next_matches(&title, &identifier) {
            self.skip_next = false;
        }

        for tag in self.tags.iter_mut() {
            *tag = tag.to_lowercase();
        }
        for tag in self.offset_tags.iter_mut() {
            *tag = tag.to_lowercase();
        }

        let duration = (self.media.duration > 0).then_some(self.media.duration);
        for (raw, key) in collected {
            match CustomMarker::try_parse(&raw, key, duration, self.mode) {
                Ok(marker) => {
                    let duplicate = self.custom_markers.iter().any(|m| {
                        m.start == marker.start && m.end == marker.end && m.mode == marker.mode
                    });
                    if !duplicate {
                        debug!("Found custom marker {}-{} for {}", marker.start, marker.end, self.id);
                        self.custom_markers.push(marker);
                    }
                }
                Err(e) => error!("Invalid custom marker data for key {}: {}", key, e),
            }
        }
    }

    /// Refilter the server's markers and chapters against the current tag
    /// set. Sessions tracked for their custom markers only never use them.
    pub fn update_markers(&mut self) {
        if self.custom_only {
            self.markers.clear();
            self.chapters.clear();
            self.last_chapter = None;
            return;
        }
        self.markers = self
            .media
            .markers
            .iter()
            .filter(|m| tag_match(&self.tags, "m:", &m.marker_type))
            .cloned()
            .collect();
        self.chapters = self
            .media
            .chapters
            .iter()
            .filter(|c| tag_match(&self.tags, "c:", &c.title))
            .cloned()
            .collect();
    }

    pub fn set_custom_only(&mut self) {
        self.custom_only = true;
        self.update_markers();
    }

    /// Strip everything but the safe tags, dropping custom markers whose
    /// type is not safe. Used by the binge inhibitor and first-episode gate.
    pub fn downgrade_to_safe_tags(&mut self, safe_tags: &[String]) {
        self.tags.retain(|t| safe_tags.contains(t));
        self.custom_markers.retain(|m| safe_tags.contains(&m.marker_type));
        self.update_markers();
    }

    pub fn seeking(&self) -> bool {
        self.seek_target > 0
    }

    /// The projected playhead: the stored offset advanced by wall-clock time
    /// while playing, capped at the item duration.
    pub fn view_offset(&self) -> i64 {
        let mut offset = self.view_offset;
        if self.state == PlaybackState::Playing {
            offset += self.last_update.elapsed().as_millis() as i64;
        }
        if self.media.duration > 0 {
            offset = offset.min(self.media.duration);
        }
        offset
    }

    pub fn since_last_alert(&self) -> Duration {
        self.last_alert.elapsed()
    }

    /// Reconcile an incoming alert with any in-flight seek. While seeking,
    /// an offset at or past the target confirms the seek, an offset before
    /// the origin is the user seeking manually, and anything inside the
    /// window is a stale report and is rejected.
    pub fn update_offset(&mut self, offset: i64, state: PlaybackState) -> bool {
        if self.seeking() {
            if offset >= self.seek_target {
                debug!(
                    "Seek successful for {}, offset {} meets target {}",
                    self.id, offset, self.seek_target
                );
                self.clear_seek();
            } else if offset < self.seek_origin {
                debug!(
                    "Offset {} below seek origin {} for {}, treating as a manual seek",
                    offset, self.seek_origin, self.id
                );
                self.clear_seek();
            } else {
                debug!("Skipping update, session {} is actively seeking", self.id);
                return false;
            }
        }

        self.view_offset = offset;
        self.state = state;
        self.last_update = Instant::now();
        self.last_alert = Instant::now();

        if !self.ended
            && matches!(state, PlaybackState::Paused | PlaybackState::Stopped)
            && self.media.duration > 0
            && offset >= end_threshold(self.media.duration)
        {
            self.ended = true;
        }
        true
    }

    pub fn set_ended(&mut self) {
        self.ended = true;
    }

    /// Record an issued seek. The stored offset jumps to the target so that
    /// later alerts are judged against where the player is heading.
    pub fn begin_seek(&mut self, target: i64) {
        self.seek_origin = self.view_offset().min(target);
        self.seek_target = target;
        self.view_offset = target;
        self.last_update = Instant::now();
        self.last_seek = Some(Instant::now());
    }

    pub fn clear_seek(&mut self) {
        self.seek_origin = 0;
        self.seek_target = 0;
    }

    pub fn update_volume(&mut self, cached: u8, lowering: bool) {
        self.cached_volume = cached;
        self.lowering_volume = lowering;
    }

    pub fn past_end_threshold(&self) -> bool {
        self.media.duration > 0 && self.view_offset() >= end_threshold(self.media.duration)
    }
}

impl fmt::Display for MediaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.media.grandparent_title, self.media.season_episode()) {
            (Some(show), Some((season, episode))) => write!(
                f,
                "{} [{}] ({} S{:02}E{:02} - {}) {}",
                self.id.session_key,
                self.media.rating_key,
                show,
                season,
                episode,
                self.media.title,
                self.player.title
            ),
            _ => write!(
                f,
                "{} [{}] ({}) {}",
                self.id.session_key, self.media.rating_key, self.media.title, self.player.title
            ),
        }
    }
}

pub fn end_threshold(duration: i64) -> i64 {
    (duration as f64 * DURATION_TOLERANCE).round() as i64
}

fn tag_match(tags: &[String], prefix: &str, value: &str) -> bool {
    let value = value.to_lowercase();
    tags.iter().any(|t| *t == value || *t == format!("{prefix}{value}"))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::server::{PlayerDescriptor, SessionRecord, UserInfo};

    pub fn movie(rating_key: i64, duration: i64) -> MediaItem {
        MediaItem {
            rating_key,
            kind: ItemKind::Movie,
            title: "Some Movie".to_string(),
            grandparent_title: None,
            duration,
            watched: true,
            markers: Vec::new(),
            chapters: Vec::new(),
            library_section: Some("Movies".to_string()),
            guids: Vec::new(),
        }
    }

    pub fn episode(rating_key: i64, parent: i64, grandparent: i64, season: u32, number: u32) -> MediaItem {
        MediaItem {
            rating_key,
            kind: ItemKind::Episode {
                parent_key: Some(parent),
                grandparent_key: Some(grandparent),
                season: Some(season),
                episode: Some(number),
            },
            title: format!("Episode {number}"),
            grandparent_title: Some("Some Show".to_string()),
            duration: 1_500_000,
            watched: true,
            markers: Vec::new(),
            chapters: Vec::new(),
            library_section: Some("TV Shows".to_string()),
            guids: Vec::new(),
        }
    }

    pub fn record(media: MediaItem, session_key: i64, client: &str) -> SessionRecord {
        SessionRecord {
            session_key,
            media,
            player: PlayerDescriptor {
                title: "Living Room".to_string(),
                product: "Plex for Apple TV".to_string(),
                version: "8.0".to_string(),
                machine_identifier: client.to_string(),
                address: "10.0.0.2".to_string(),
                state: "playing".to_string(),
            },
            user: UserInfo { id: Some(1), title: "viewer".to_string() },
            view_offset: 0,
            location: "lan".to_string(),
            play_queue_item_id: None,
        }
    }

    pub fn session(media: MediaItem, config: &Config, custom: &CustomEntries) -> MediaSession {
        MediaSession::new(
            record(media, 1, "client-1"),
            PlaybackState::Playing,
            0,
            config,
            custom,
        )
    }
}
