use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::binge::BingeInhibitor;
use crate::commander::Commander;
use crate::config::{Config, FirstEpisode, SkipMode};
use crate::custom_entries::CustomEntries;
use crate::library::LibraryIndex;
use crate::listener::{AlertEvent, AlertListener, PlaySessionAlert};
use crate::server::{PlayerDescriptor, PlexServer};
use crate::session::{MediaSession, PlaybackState, SessionId};

/// Sessions with no alert for this long are dropped and rebuilt on the next
/// alert.
pub const TIMEOUT: Duration = Duration::from_secs(30);

pub const IGNORED_CAP: usize = 200;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Client versions past the point where Plex removed "Advertise as Player";
/// these can no longer be commanded at all.
const BROKEN_CLIENTS: [(&str, &str); 4] = [
    ("Plex Web", "4.83.2"),
    ("Plex for Windows", "1.46.1"),
    ("Plex for Mac", "1.46.1"),
    ("Plex for Linux", "1.46.1"),
];

/// Bounded list of session identities the engine refuses to track.
#[derive(Debug, Default)]
pub struct IgnoreList {
    entries: Vec<SessionId>,
}

impl IgnoreList {
    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains(id)
    }

    /// Append, most recent last, trimming the oldest entries past the cap.
    pub fn insert(&mut self, id: SessionId) {
        self.entries.retain(|e| e != &id);
        self.entries.push(id);
        if self.entries.len() > IGNORED_CAP {
            let excess = self.entries.len() - IGNORED_CAP;
            self.entries.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// State shared between the alert path, the tick loop, and command workers.
/// Critical sections are small; a plain mutex per table is enough.
#[derive(Default)]
pub struct SharedState {
    pub sessions: Mutex<HashMap<SessionId, MediaSession>>,
    pub ignored: Mutex<IgnoreList>,
}

impl SharedState {
    pub fn new() -> Arc<Self> {
        Arc::new(SharedState::default())
    }

    pub fn is_ignored(&self, id: &SessionId) -> bool {
        self.ignored.lock().unwrap().contains(id)
    }

    pub fn ignore(&self, id: SessionId) {
        let mut ignored = self.ignored.lock().unwrap();
        ignored.insert(id);
        debug!("Ignored list now holds {} entries", ignored.len());
    }

    pub fn remove_session(&self, id: &SessionId) -> Option<MediaSession> {
        let mut sessions = self.sessions.lock().unwrap();
        let removed = sessions.remove(id);
        if let Some(ref session) = removed {
            debug!("Deleting session {}, sessions: {}", session, sessions.len());
        }
        removed
    }

    /// A machine runs one session at a time; a new session on a known client
    /// evicts whatever it was playing before.
    pub fn purge_machine(&self, machine_identifier: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        let stale: Vec<SessionId> = sessions
            .keys()
            .filter(|k| k.client_identifier == machine_identifier)
            .cloned()
            .collect();
        for id in stale {
            if let Some(old) = sessions.remove(&id) {
                info!(
                    "Session {} shares player ({}) with a new session, deleting old session",
                    old, machine_identifier
                );
            }
        }
    }

    /// Park a session in the buffering state so the tick stops retrying it
    /// until the next alert refreshes it.
    pub fn mark_buffering(&self, id: &SessionId) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(id) {
            session.state = PlaybackState::Buffering;
            session.clear_seek();
        }
    }
}

enum Command {
    Seek(i64),
    Volume(u8, bool),
}

/// The playback session tracker and skip/volume decision engine.
pub struct Skipper {
    server: Arc<PlexServer>,
    config: Arc<Config>,
    custom: CustomEntries,
    state: Arc<SharedState>,
    binge: Arc<BingeInhibitor>,
    commander: Arc<Commander>,
    verbose: bool,
}

impl Skipper {
    pub async fn new(server: Arc<PlexServer>, config: Arc<Config>, mut custom: CustomEntries) -> Self {
        if custom.needs_guid_resolution() {
            debug!("Custom entries contain GUIDs that need ratingKey resolution");
            match server.library_items().await {
                Ok(items) => custom.convert_to_rating_keys(&LibraryIndex::build(items)),
                Err(e) => error!("Unable to walk library for GUID resolution: {}", e),
            }
        }

        debug!(
            "Skipper init with leftOffset {} rightOffset {}",
            config.offsets.start, config.offsets.end
        );
        debug!("Offset tags {:?}", config.offsets.tags);
        debug!("Operating in {:?} mode", config.skip.mode);
        debug!("Skip tags {:?}", config.skip.tags);
        debug!("Skip S01E01 {:?}", config.skip.first_episode_series);
        debug!("Skip S**E01 {:?}", config.skip.first_episode_season);
        debug!("Skip last chapter {}", config.skip.last_chapter);

        let state = SharedState::new();
        let binge = Arc::new(BingeInhibitor::new(&config));
        let commander = Commander::new(
            Arc::clone(&server),
            Arc::clone(&state),
            Arc::clone(&binge),
            Arc::clone(&config),
        );

        Skipper {
            server,
            config,
            custom,
            state,
            binge,
            commander,
            verbose: Config::verbose(),
        }
    }

    /// Drive the engine until cancelled: a listener worker feeds alerts while
    /// the 1 Hz tick inspects every tracked session. A dead listener is
    /// restarted unless shutdown has been requested.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Skipper initiated and ready");
        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let listener = AlertListener::start(
                self.server.websocket_url(),
                self.server.accept_invalid_certs(),
                tx,
            );
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut alive = true;
            while alive {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Stopping listener");
                        listener.stop();
                        return;
                    }
                    event = rx.recv() => match event {
                        Some(AlertEvent::Alert(alert)) => self.process_alert(alert).await,
                        Some(AlertEvent::Error(e)) => error!("Alert listener error: {}", e),
                        None => alive = false,
                    },
                    _ = ticker.tick() => self.tick().await,
                }
            }

            warn!(
                "Alert listener disconnected, reconnecting in {}s",
                RECONNECT_DELAY.as_secs()
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn tick(&self) {
        self.binge.clean();
        let ids: Vec<SessionId> = {
            let sessions = self.state.sessions.lock().unwrap();
            sessions.keys().cloned().collect()
        };
        for id in ids {
            self.check_session(&id).await;
        }
    }

    /// One inspection pass over a session: timeout removal, then the skip and
    /// volume rules, then end-of-item handling.
    async fn check_session(&self, id: &SessionId) {
        let mut commands: Vec<Command> = Vec::new();
        let mut remove = false;
        {
            let mut sessions = self.state.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(id) else { return };

            if session.since_last_alert() > TIMEOUT {
                debug!(
                    "Session {} hasn't been updated in {} seconds",
                    session,
                    TIMEOUT.as_secs()
                );
                remove = true;
            } else if session.state == PlaybackState::Buffering {
                // Leave it alone until the next alert.
            } else {
                let left = if session.left_offset != 0 {
                    session.left_offset
                } else {
                    self.config.offsets.start
                };
                let right = if session.right_offset != 0 {
                    session.right_offset
                } else {
                    self.config.offsets.end
                };

                if let Some(target) =
                    skip_target(session, left, right, self.config.skip.last_chapter)
                {
                    if !session.seeking() {
                        commands.push(Command::Seek(target));
                    }
                }

                let should_lower =
                    should_lower_volume(session, left, right, self.config.skip.last_chapter);
                if !session.lowering_volume && should_lower {
                    info!(
                        "viewOffset {} is a low volume area for media {}, lowering volume to {}",
                        session.view_offset(),
                        session,
                        self.config.volume.low
                    );
                    commands.push(Command::Volume(self.config.volume.low, true));
                } else if session.lowering_volume && !should_lower {
                    info!(
                        "Leaving low volume area for media {}, raising volume to {}",
                        session, session.cached_volume
                    );
                    commands.push(Command::Volume(session.cached_volume, false));
                }

                if session.skip_next && session.ended && session.past_end_threshold() {
                    if !session.seeking() {
                        info!(
                            "Found ended session {} that has reached the end of its duration with skip-next enabled, will skip to next",
                            session
                        );
                        commands.push(Command::Seek(session.media.duration));
                    }
                } else if session.ended {
                    debug!(
                        "Session {} has been marked as ended with viewOffset {}, removing",
                        session,
                        session.view_offset()
                    );
                    remove = true;
                }
            }
        }

        if remove {
            self.state.remove_session(id);
            return;
        }
        for command in commands {
            match command {
                Command::Seek(target) => self.commander.seek(id.clone(), target),
                Command::Volume(level, lowering) => {
                    self.commander.set_volume(id.clone(), level, lowering)
                }
            }
        }
    }

    pub async fn process_alert(&self, alert: PlaySessionAlert) {
        let Some(state) = PlaybackState::parse(&alert.state) else { return };
        let id = SessionId {
            session_key: alert.session_key,
            client_identifier: alert.client_identifier.clone(),
        };

        if self.state.is_ignored(&id) {
            if self.verbose {
                debug!("Ignoring session {}", id);
            }
            return;
        }

        let tracked = self.state.sessions.lock().unwrap().contains_key(&id);
        if tracked {
            self.update_tracked(&id, &alert, state).await;
            return;
        }

        let Some(record) = self.server.session_by_key(alert.session_key).await else {
            if self.verbose {
                debug!("No server session found for alert {}", id);
            }
            return;
        };
        if self.verbose {
            debug!(
                "Alert for {} with state {} viewOffset {} playQueueID {} location {}",
                id, alert.state, alert.view_offset, alert.play_queue_id, record.location
            );
        }
        if record.location != "lan" {
            return;
        }

        let mut session =
            MediaSession::new(record, state, alert.play_queue_id, &self.config, &self.custom);
        if blocked_client_user(&session, &self.custom) {
            self.ignore_session(session);
        } else if should_add(&mut session, &self.config, &self.custom) {
            self.add_session(session).await;
        } else if !session.custom_markers.is_empty() {
            session.set_custom_only();
            self.add_session(session).await;
        } else {
            self.ignore_session(session);
        }
    }

    async fn update_tracked(&self, id: &SessionId, alert: &PlaySessionAlert, state: PlaybackState) {
        let check_gone = {
            let mut sessions = self.state.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(id) else { return };
            session.update_offset(alert.view_offset, state);
            self.binge.observe(session, false);
            !session.ended
                && matches!(state, PlaybackState::Paused | PlaybackState::Stopped)
        };

        // A paused or stopped session the server no longer reports has ended.
        if check_gone && self.server.session_by_key(id.session_key).await.is_none() {
            let mut sessions = self.state.sessions.lock().unwrap();
            if let Some(session) = sessions.get_mut(id) {
                session.set_ended();
            }
        }
    }

    async fn add_session(&self, mut session: MediaSession) {
        if !valid_player(&session.player) {
            info!("Session {} has no accessible player, it will be ignored", session);
            self.ignore_session(session);
            return;
        }

        let base_override = self
            .custom
            .client_base_url(&session.player.title, &session.id.client_identifier)
            .map(str::to_string);
        self.server.register_player(&session.player, base_override.as_deref());

        let has_next = self.queue_has_next(&session).await;
        self.binge.observe(&mut session, has_next);

        self.state.purge_machine(&session.id.client_identifier);

        let id = session.id.clone();
        {
            let mut sessions = self.state.sessions.lock().unwrap();
            if session.custom_only {
                info!(
                    "Found blocked session {} viewOffset {} {} on {}, using custom markers only, sessions: {}",
                    session,
                    session.view_offset(),
                    session.user.title,
                    session.player.product,
                    sessions.len()
                );
            } else {
                info!(
                    "Found new session {} viewOffset {} {} on {}, sessions: {}",
                    session,
                    session.view_offset(),
                    session.user.title,
                    session.player.product,
                    sessions.len()
                );
            }
            sessions.insert(id.clone(), session);
        }
        // One immediate pass so markers already in range fire without waiting
        // for the next tick.
        self.check_session(&id).await;
    }

    fn ignore_session(&self, session: MediaSession) {
        self.state.purge_machine(&session.id.client_identifier);
        debug!("Ignoring session {} {}", session, session.user.title);
        self.state.ignore(session.id);
    }

    async fn queue_has_next(&self, session: &MediaSession) -> bool {
        if session.play_queue_id <= 0 {
            return false;
        }
        match self.server.play_queue(session.play_queue_id).await {
            Ok(queue) => queue
                .position_of(session.media.rating_key)
                .map(|pos| pos + 1 < queue.items.len())
                .unwrap_or(false),
            Err(e) => {
                debug!(
                    "Unable to fetch play queue {} for {}: {}",
                    session.play_queue_id, session.id, e
                );
                false
            }
        }
    }
}

/// First matching skippable range for the session's projected position, in
/// fixed precedence order: custom markers, the last-chapter rule, chapters,
/// then server markers. Returns the seek target.
pub(crate) fn skip_target(
    session: &MediaSession,
    left_offset: i64,
    right_offset: i64,
    last_chapter_ratio: f64,
) -> Option<i64> {
    if session.state != PlaybackState::Playing {
        return None;
    }
    let offset = session.view_offset();

    for marker in session.custom_markers.iter().filter(|m| m.mode == SkipMode::Skip) {
        if marker.start <= offset && offset < marker.end {
            info!(
                "Found a custom marker for media {} with range {}-{} and viewOffset {} ({})",
                session, marker.start, marker.end, offset, marker.key
            );
            return Some(marker.end);
        }
    }

    if session.mode != SkipMode::Skip {
        return None;
    }

    let duration = session.media.duration;
    if last_chapter_ratio > 0.0 && duration > 0 {
        if let Some(last) = &session.last_chapter {
            if (last.start as f64 / duration as f64) > last_chapter_ratio
                && last.start <= offset
                && offset < last.end
            {
                info!(
                    "Found a valid last chapter for media {} with range {}-{} and viewOffset {} with skip-last-chapter enabled",
                    session, last.start, last.end, offset
                );
                return Some(duration);
            }
        }
    }

    for chapter in &session.chapters {
        if chapter.start <= offset && offset < chapter.end {
            info!(
                "Found skippable chapter {} for media {} with range {}-{} and viewOffset {}",
                chapter.title, session, chapter.start, chapter.end, offset
            );
            return Some(chapter.end);
        }
    }

    for marker in &session.markers {
        let offsets_apply = session
            .offset_tags
            .contains(&marker.marker_type.to_lowercase());
        let (lo, ro) = if offsets_apply { (left_offset, right_offset) } else { (0, 0) };
        // Markers that begin before the left offset keep their raw start, so
        // a cold open at 0 still matches from the first second.
        let start = if marker.start < lo { marker.start } else { marker.start + lo };
        if start <= offset && offset < marker.end {
            info!(
                "Found skippable marker {} for media {} with range {}(+{})-{}(+{}) and viewOffset {}",
                marker.marker_type, session, marker.start, lo, marker.end, ro, offset
            );
            return Some(marker.end + ro);
        }
    }
    None
}

/// Whether the projected position sits inside a volume-lowering range,
/// mirroring the skip rule order over mode=volume markers.
pub(crate) fn should_lower_volume(
    session: &MediaSession,
    left_offset: i64,
    right_offset: i64,
    last_chapter_ratio: f64,
) -> bool {
    if session.state != PlaybackState::Playing {
        return false;
    }
    let offset = session.view_offset();

    for marker in session.custom_markers.iter().filter(|m| m.mode == SkipMode::Volume) {
        if marker.start <= offset && offset < marker.end {
            return true;
        }
    }

    if session.mode != SkipMode::Volume {
        return false;
    }

    let duration = session.media.duration;
    if last_chapter_ratio > 0.0 && duration > 0 {
        if let Some(last) = &session.last_chapter {
            if (last.start as f64 / duration as f64) > last_chapter_ratio
                && last.start <= offset
                && offset < last.end
            {
                return true;
            }
        }
    }

    for chapter in &session.chapters {
        if chapter.start <= offset && offset < chapter.end {
            return true;
        }
    }

    for marker in &session.markers {
        let offsets_apply = session
            .offset_tags
            .contains(&marker.marker_type.to_lowercase());
        let (lo, _ro) = if offsets_apply { (left_offset, right_offset) } else { (0, 0) };
        let start = if marker.start < lo { marker.start } else { marker.start + lo };
        if start <= offset && offset < marker.end {
            return true;
        }
    }
    false
}

/// Allow/block lists for users and players, checked before admission.
pub(crate) fn blocked_client_user(session: &MediaSession, custom: &CustomEntries) -> bool {
    let user = &session.user.title;
    if custom.blocked.users.contains(user) {
        debug!("Blocking {} based on blocked user {}", session, user);
        return true;
    }
    if !custom.allowed.users.is_empty() && !custom.allowed.users.contains(user) {
        debug!("Blocking {} based on no allowed user {}", session, user);
        return true;
    }

    let title = &session.player.title;
    let identifier = &session.id.client_identifier;
    if !custom.allowed.clients.is_empty()
        && !custom.allowed.contains_client(title, identifier)
    {
        debug!("Blocking {} based on no allowed player {} {}", session, title, identifier);
        return true;
    }
    if custom.blocked.contains_client(title, identifier) {
        debug!("Blocking {} based on blocked player {} {}", session, title, identifier);
        return true;
    }
    false
}

fn first_episode_gate(setting: FirstEpisode, watched: bool) -> bool {
    match setting {
        FirstEpisode::Never => true,
        FirstEpisode::Watched => !watched,
        FirstEpisode::Always => false,
    }
}

/// The admission predicate. May downgrade the session to its safe tags for
/// first episodes instead of rejecting it outright.
pub(crate) fn should_add(
    session: &mut MediaSession,
    config: &Config,
    custom: &CustomEntries,
) -> bool {
    let media = Arc::clone(&session.media);

    if !config.skip.types.iter().any(|t| t == media.kind.type_name()) {
        debug!(
            "Blocking {} of type {} as its not on the approved type list {:?}",
            session,
            media.kind.type_name(),
            config.skip.types
        );
        return false;
    }

    if let Some(library) = &media.library_section {
        if config.skip.ignored_libraries.contains(&library.to_lowercase()) {
            debug!(
                "Blocking {} in library {} as its library is on the ignored list",
                session, library
            );
            return false;
        }
    }

    let mut downgrade = false;
    if let Some((season, episode)) = media.season_episode() {
        if episode == 1 {
            downgrade |= first_episode_gate(config.skip.first_episode_season, media.watched);
            if season == 1 {
                downgrade |= first_episode_gate(config.skip.first_episode_series, media.watched);
            }
        }
    }

    // Key lists, most specific level first. A block only beats an allow when
    // both match at the same level.
    let mut levels = media.layer_keys();
    levels.reverse();
    let mut decision: Option<bool> = None;
    for key in levels {
        if custom.blocked.contains_key(key) {
            debug!("Blocking {} for key {}", session, key);
            decision = Some(false);
            break;
        }
        if custom.allowed.contains_key(key) {
            debug!("Allowing {} for key {}", session, key);
            decision = Some(true);
            break;
        }
    }
    match decision {
        Some(false) => return false,
        Some(true) => {}
        None if !custom.allowed.keys.is_empty() => {
            debug!("Blocking {}, not on allowed list", session);
            return false;
        }
        None => {}
    }

    if !config.skip.unwatched && !media.watched {
        debug!("Blocking {}, unwatched and skip-unwatched is disabled", session);
        return false;
    }

    if downgrade {
        debug!(
            "First episode for {}, stripping to safe tags {:?}",
            session, config.skip.binge_safe_tags
        );
        session.downgrade_to_safe_tags(&config.skip.binge_safe_tags);
    }
    true
}

/// Reject players the server cannot command at all.
pub(crate) fn valid_player(player: &PlayerDescriptor) -> bool {
    if player.machine_identifier.is_empty() {
        return false;
    }
    if let Some((_, bad)) = BROKEN_CLIENTS.iter().find(|(p, _)| *p == player.product) {
        if !player.version.is_empty() && version_at_least(&player.version, bad) {
            error!(
                "Bad {} version {}: the Plex team removed 'Advertise as Player' from this client, it cannot be remote controlled",
                player.product, player.version
            );
            return false;
        }
    }
    true
}

/// Numeric dotted-version comparison; anything after a dash is ignored.
fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.split('-')
            .next()
            .unwrap_or("")
            .split('.')
            .map(|p| p.parse().unwrap_or(0))
            .collect()
    };
    let a = parse(version);
    let b = parse(minimum);
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x != y {
            return x > y;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_fixtures::{episode, movie, record, session};
    use crate::session::{Chapter, Marker};

    fn custom(doc: &str) -> CustomEntries {
        serde_json::from_str(doc).unwrap()
    }

    fn playing_at(session: &mut MediaSession, offset: i64) {
        assert!(session.update_offset(offset, PlaybackState::Playing));
    }

    #[test]
    fn basic_intro_skip() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        let mut s = session(media, &config, &CustomEntries::default());
        playing_at(&mut s, 32_000);

        assert_eq!(skip_target(&s, 2000, 0, 0.0), Some(60_000));
    }

    #[test]
    fn left_offset_delays_the_match() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        let mut s = session(media, &config, &CustomEntries::default());
        playing_at(&mut s, 31_000);

        // 31s is before start+leftOffset, no match yet.
        assert_eq!(skip_target(&s, 2000, 0, 0.0), None);
    }

    #[test]
    fn markers_before_the_left_offset_keep_their_raw_start() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 0, end: 20_000 }];
        let mut s = session(media, &config, &CustomEntries::default());
        playing_at(&mut s, 500);

        assert_eq!(skip_target(&s, 3000, 1000, 0.0), Some(21_000));
    }

    #[test]
    fn right_offset_extends_the_target() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        let mut s = session(media, &config, &CustomEntries::default());
        playing_at(&mut s, 40_000);

        assert_eq!(skip_target(&s, 2000, 1500, 0.0), Some(61_500));
    }

    #[test]
    fn offsets_only_apply_to_offset_tagged_markers() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers =
            vec![Marker { marker_type: "credits".to_string(), start: 30_000, end: 60_000 }];
        let mut s = session(media, &config, &CustomEntries::default());
        playing_at(&mut s, 30_500);

        // Default offset tags only cover intro; credits matches unshifted.
        assert_eq!(skip_target(&s, 5000, 1500, 0.0), Some(60_000));
    }

    #[test]
    fn chapter_wins_over_marker() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        media.chapters =
            vec![Chapter { title: "advertisement".to_string(), start: 25_000, end: 45_000 }];
        let doc = custom(r#"{"tags": {"1": ["intro", "advertisement"]}}"#);
        let mut s = session(media, &config, &doc);
        playing_at(&mut s, 26_000);

        assert_eq!(skip_target(&s, 2000, 0, 0.0), Some(45_000));
    }

    #[test]
    fn custom_marker_wins_over_everything() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        let doc = custom(r#"{"markers": {"1": [{"start": 31000, "end": 35000}]}}"#);
        let mut s = session(media, &config, &doc);
        playing_at(&mut s, 33_000);

        assert_eq!(skip_target(&s, 0, 0, 0.0), Some(35_000));
    }

    #[test]
    fn custom_markers_fire_even_in_volume_mode() {
        let mut config = Config::default();
        config.skip.mode = SkipMode::Volume;
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        let doc = custom(r#"{"markers": {"1": [{"start": 31000, "end": 35000, "mode": "skip"}]}}"#);
        let mut s = session(media, &config, &doc);
        playing_at(&mut s, 33_000);

        // The custom skip marker still seeks, but the server marker, gated on
        // the session mode, does not.
        assert_eq!(skip_target(&s, 0, 0, 0.0), Some(35_000));
        playing_at(&mut s, 40_000);
        assert_eq!(skip_target(&s, 0, 0, 0.0), None);
        assert!(should_lower_volume(&s, 0, 0, 0.0));
    }

    #[test]
    fn last_chapter_rule_seeks_to_the_end() {
        let config = Config::default();
        let mut media = movie(1, 1_000_000);
        media.chapters = vec![
            Chapter { title: "Main".to_string(), start: 0, end: 900_000 },
            Chapter { title: "End Credits".to_string(), start: 900_000, end: 1_000_000 },
        ];
        let mut s = session(media, &config, &CustomEntries::default());
        playing_at(&mut s, 910_000);

        // Ratio 0.8: the last chapter starts at 90% of the item, so it fires.
        assert_eq!(skip_target(&s, 0, 0, 0.8), Some(1_000_000));
        // Ratio 0.95: 90% is not past it, no match.
        assert_eq!(skip_target(&s, 0, 0, 0.95), None);
    }

    #[test]
    fn nothing_fires_while_paused() {
        let config = Config::default();
        let mut media = movie(1, 1_500_000);
        media.markers = vec![Marker { marker_type: "intro".to_string(), start: 30_000, end: 60_000 }];
        let mut s = session(media, &config, &CustomEntries::default());
        assert!(s.update_offset(40_000, PlaybackState::Paused));

        assert_eq!(skip_target(&s, 0, 0, 0.0), None);
        assert!(!should_lower_volume(&s, 0, 0, 0.0));
    }

    #[test]
    fn volume_mode_lowers_inside_markers() {
        let mut config = Config::default();
        config.skip.mode = SkipMode::Volume;
        let mut media = movie(1, 1_500_000);
        media.markers =
            vec![Marker { marker_type: "commercial".to_string(), start: 30_000, end: 60_000 }];
        let mut s = session(media, &config, &CustomEntries::default());

        playing_at(&mut s, 31_000);
        assert!(should_lower_volume(&s, 0, 0, 0.0));
        assert_eq!(skip_target(&s, 0, 0, 0.0), None);

        playing_at(&mut s, 61_000);
        assert!(!should_lower_volume(&s, 0, 0, 0.0));
    }

    #[test]
    fn first_episode_downgrade_keeps_safe_tags() {
        let mut config = Config::default();
        config.skip.first_episode_series = FirstEpisode::Never;
        config.skip.binge_safe_tags = vec!["credits".to_string()];
        let mut media = episode(111, 200, 300, 1, 1);
        media.markers = vec![
            Marker { marker_type: "intro".to_string(), start: 0, end: 30_000 },
            Marker { marker_type: "credits".to_string(), start: 1_400_000, end: 1_500_000 },
        ];
        let mut s = session(media, &config, &CustomEntries::default());

        assert!(should_add(&mut s, &config, &CustomEntries::default()));
        assert_eq!(s.tags, ["credits"]);
        assert_eq!(s.markers.len(), 1);
        assert_eq!(s.markers[0].marker_type, "credits");

        playing_at(&mut s, 10_000);
        assert_eq!(skip_target(&s, 0, 0, 0.0), None);
        playing_at(&mut s, 1_400_500);
        assert_eq!(skip_target(&s, 0, 0, 0.0), Some(1_500_000));
    }

    #[test]
    fn type_and_library_gates() {
        let mut config = Config::default();
        config.skip.types = vec!["episode".to_string()];
        let mut s = session(movie(1, 1_000), &config, &CustomEntries::default());
        assert!(!should_add(&mut s, &config, &CustomEntries::default()));

        let mut config = Config::default();
        config.skip.ignored_libraries = vec!["movies".to_string()];
        let mut s = session(movie(1, 1_000), &config, &CustomEntries::default());
        assert!(!should_add(&mut s, &config, &CustomEntries::default()));
    }

    #[test]
    fn unwatched_gate() {
        let mut config = Config::default();
        config.skip.unwatched = false;
        let mut media = movie(1, 1_000);
        media.watched = false;
        let mut s = session(media, &config, &CustomEntries::default());
        assert!(!should_add(&mut s, &config, &CustomEntries::default()));

        config.skip.unwatched = true;
        let mut media = movie(1, 1_000);
        media.watched = false;
        let mut s = session(media, &config, &CustomEntries::default());
        assert!(should_add(&mut s, &config, &CustomEntries::default()));
    }

    #[test]
    fn key_lists_decide_at_the_most_specific_level() {
        let config = Config::default();

        // Item allowed, ancestor blocked: the item level wins.
        let doc = custom(r#"{"allowed": {"keys": [111]}, "blocked": {"keys": [300]}}"#);
        let mut s = session(episode(111, 200, 300, 1, 5), &config, &doc);
        assert!(should_add(&mut s, &config, &doc));

        // Ancestor blocked and nothing more specific: blocked.
        let doc = custom(r#"{"blocked": {"keys": [300]}}"#);
        let mut s = session(episode(111, 200, 300, 1, 5), &config, &doc);
        assert!(!should_add(&mut s, &config, &doc));

        // Same level carries block over allow.
        let doc = custom(r#"{"allowed": {"keys": [111]}, "blocked": {"keys": [111]}}"#);
        let mut s = session(episode(111, 200, 300, 1, 5), &config, &doc);
        assert!(!should_add(&mut s, &config, &doc));

        // Allow list present but nothing matches: blocked.
        let doc = custom(r#"{"allowed": {"keys": [9999]}}"#);
        let mut s = session(episode(111, 200, 300, 1, 5), &config, &doc);
        assert!(!should_add(&mut s, &config, &doc));
    }

    #[test]
    fn blocked_users_and_clients() {
        let config = Config::default();

        let doc = custom(r#"{"blocked": {"users": ["viewer"]}}"#);
        let s = session(movie(1, 1_000), &config, &doc);
        assert!(blocked_client_user(&s, &doc));

        let doc = custom(r#"{"allowed": {"users": ["someone-else"]}}"#);
        let s = session(movie(1, 1_000), &config, &doc);
        assert!(blocked_client_user(&s, &doc));

        let doc = custom(r#"{"allowed": {"clients": ["client-1"]}}"#);
        let s = session(movie(1, 1_000), &config, &doc);
        assert!(!blocked_client_user(&s, &doc));

        let doc = custom(r#"{"blocked": {"clients": ["Living Room"]}}"#);
        let s = session(movie(1, 1_000), &config, &doc);
        assert!(blocked_client_user(&s, &doc));
    }

    #[test]
    fn ignore_list_trims_to_cap() {
        let mut list = IgnoreList::default();
        for n in 0..205 {
            list.insert(SessionId { session_key: n, client_identifier: format!("client-{n}") });
        }
        assert_eq!(list.len(), IGNORED_CAP);
        for n in 0..5 {
            assert!(!list.contains(&SessionId {
                session_key: n,
                client_identifier: format!("client-{n}"),
            }));
        }
        assert!(list.contains(&SessionId {
            session_key: 204,
            client_identifier: "client-204".to_string(),
        }));
    }

    #[test]
    fn reignoring_moves_an_entry_to_the_back() {
        let mut list = IgnoreList::default();
        let early = SessionId { session_key: 0, client_identifier: "c0".to_string() };
        list.insert(early.clone());
        for n in 1..IGNORED_CAP as i64 {
            list.insert(SessionId { session_key: n, client_identifier: format!("c{n}") });
        }
        list.insert(early.clone());
        list.insert(SessionId { session_key: 999, client_identifier: "c999".to_string() });
        assert!(list.contains(&early));
    }

    #[test]
    fn one_session_per_machine() {
        let config = Config::default();
        let state = SharedState::new();
        let first = MediaSession::new(
            record(movie(1, 1_000), 10, "client-1"),
            PlaybackState::Playing,
            0,
            &config,
            &CustomEntries::default(),
        );
        state.sessions.lock().unwrap().insert(first.id.clone(), first);

        state.purge_machine("client-1");
        assert!(state.sessions.lock().unwrap().is_empty());
    }

    #[test]
    fn broken_client_versions_are_rejected() {
        let mut player = PlayerDescriptor {
            title: "Desktop".to_string(),
            product: "Plex for Windows".to_string(),
            version: "1.46.1.4949-abc123".to_string(),
            machine_identifier: "m1".to_string(),
            address: "10.0.0.3".to_string(),
            state: "playing".to_string(),
        };
        assert!(!valid_player(&player));

        player.version = "1.45.0".to_string();
        assert!(valid_player(&player));

        player.product = "Plex for Apple TV".to_string();
        player.version = "99.0".to_string();
        assert!(valid_player(&player));
    }

    #[test]
    fn version_comparison() {
        assert!(version_at_least("4.83.2", "4.83.2"));
        assert!(version_at_least("4.84.0", "4.83.2"));
        assert!(version_at_least("1.46.1-abcd", "1.46.1"));
        assert!(!version_at_least("4.83.1", "4.83.2"));
        assert!(!version_at_least("1.45", "1.46.1"));
    }
}
