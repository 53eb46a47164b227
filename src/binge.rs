use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::session::{ItemKind, MediaSession, PlaybackState};

/// Binge starters idle longer than this are forgotten.
const BINGE_TIMEOUT: Duration = Duration::from_secs(300);

/// One binge-watch in progress on a client: which episode is current, how
/// many episodes have actually been watched, and how many auto-advances have
/// fired in a row.
#[derive(Debug)]
struct BingeSession {
    user: String,
    show_key: Option<i64>,
    current_key: i64,
    current_duration: i64,
    current_progress: i64,
    count: u32,
    advances: u32,
    last_update: Instant,
}

impl BingeSession {
    fn new(session: &MediaSession) -> Self {
        BingeSession {
            user: session.user.title.clone(),
            show_key: show_key(session),
            current_key: session.media.rating_key,
            current_duration: session.media.duration,
            current_progress: session.view_offset(),
            count: 1,
            advances: 0,
            last_update: Instant::now(),
        }
    }

    fn watched_enough(&self) -> bool {
        self.current_duration > 0 && self.current_progress * 2 >= self.current_duration
    }

    fn remaining(&self, block_count: u32) -> u32 {
        block_count.saturating_sub(self.count)
    }
}

fn show_key(session: &MediaSession) -> Option<i64> {
    match session.media.kind {
        ItemKind::Episode { grandparent_key, .. } => grandparent_key,
        _ => None,
    }
}

/// Suppresses skipping for the first N episodes of a binge-watch so intros
/// still play, by stripping everything but the safe tags from the session.
pub struct BingeInhibitor {
    block_count: u32,
    safe_tags: Vec<String>,
    same_show_only: bool,
    skip_next_max: u32,
    sessions: Mutex<HashMap<String, BingeSession>>,
}

impl BingeInhibitor {
    pub fn new(config: &Config) -> Self {
        BingeInhibitor {
            block_count: config.skip.binge,
            safe_tags: config.skip.binge_safe_tags.clone(),
            same_show_only: config.skip.binge_same_show_only,
            skip_next_max: config.skip.skip_next_max,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.block_count > 0
    }

    /// Track a session update. `has_next` reports whether the play queue has
    /// another item after the current one; a binge only starts when it does.
    /// Applies the safe-tag downgrade to the session while the block holds.
    pub fn observe(&self, session: &mut MediaSession, has_next: bool) {
        if !self.enabled() {
            return;
        }
        if matches!(session.state, PlaybackState::Paused | PlaybackState::Stopped) {
            return;
        }

        let client = session.id.client_identifier.clone();
        let mut sessions = self.sessions.lock().unwrap();
        let same_user = sessions
            .get(&client)
            .is_some_and(|b| b.user == session.user.title);

        let blocked = if same_user {
            let Some(binge) = sessions.get_mut(&client) else { return };
            if self.same_show_only
                && binge.show_key.is_some()
                && show_key(session) != binge.show_key
            {
                debug!("Binge starter for {} switched shows, restarting", client);
                *binge = BingeSession::new(session);
            } else if binge.current_key != session.media.rating_key {
                if binge.watched_enough() {
                    binge.count += 1;
                } else {
                    // Channel surfing does not advance the binge, and a
                    // manual episode change breaks the auto-advance run.
                    binge.advances = 0;
                }
                binge.current_key = session.media.rating_key;
                binge.current_duration = session.media.duration;
                binge.current_progress = session.view_offset();
                debug!(
                    "Updating binge starter ({}) for {}, remaining {}",
                    if binge.count <= self.block_count { "active" } else { "inactive" },
                    client,
                    binge.remaining(self.block_count)
                );
            } else {
                binge.current_progress = binge.current_progress.max(session.view_offset());
            }
            binge.last_update = Instant::now();
            binge.count <= self.block_count
        } else {
            if !matches!(session.media.kind, ItemKind::Episode { .. }) || !has_next {
                return;
            }
            let binge = BingeSession::new(session);
            let blocked = binge.count <= self.block_count;
            debug!(
                "Creating binge starter ({}) for {}, remaining {}",
                if blocked { "active" } else { "inactive" },
                client,
                binge.remaining(self.block_count)
            );
            sessions.insert(client, binge);
            blocked
        };

        if blocked {
            session.downgrade_to_safe_tags(&self.safe_tags);
        }
    }

    /// Record an auto-advance issued for this client.
    pub fn register_advance(&self, client_identifier: &str) {
        if let Some(binge) = self.sessions.lock().unwrap().get_mut(client_identifier) {
            binge.advances += 1;
        }
    }

    /// Whether further skip-to-next advances are blocked for this client.
    pub fn advance_blocked(&self, client_identifier: &str) -> bool {
        if self.skip_next_max == 0 {
            return false;
        }
        self.sessions
            .lock()
            .unwrap()
            .get(client_identifier)
            .map(|b| b.advances >= self.skip_next_max)
            .unwrap_or(false)
    }

    /// Drop binge starters that have not been updated recently.
    pub fn clean(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|client, binge| {
            let keep = binge.last_update.elapsed() <= BINGE_TIMEOUT;
            if !keep {
                debug!("Binge starter for {} timed out, removing", client);
            }
            keep
        });
    }

    #[cfg(test)]
    fn count_for(&self, client: &str) -> Option<u32> {
        self.sessions.lock().unwrap().get(client).map(|b| b.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::custom_entries::CustomEntries;
    use crate::session::test_fixtures::{episode, record};
    use crate::session::Marker;

    fn binge_config(block: u32) -> Config {
        let mut config = Config::default();
        config.skip.binge = block;
        config.skip.binge_safe_tags = vec!["commercial".to_string()];
        config.skip.binge_same_show_only = false;
        config
    }

    fn episode_session(config: &Config, number: u32, show: i64) -> MediaSession {
        let mut media = episode(1000 + number as i64, 110, show, 1, number);
        media.markers = vec![
            Marker { marker_type: "intro".to_string(), start: 0, end: 30_000 },
            Marker { marker_type: "commercial".to_string(), start: 60_000, end: 90_000 },
        ];
        MediaSession::new(
            record(media, number as i64, "client-1"),
            PlaybackState::Playing,
            5,
            config,
            &CustomEntries::default(),
        )
    }

    fn watch_to_end(inhibitor: &BingeInhibitor, session: &mut MediaSession) {
        // Report progress past the halfway point before switching episodes.
        let _ = session.update_offset(session.media.duration - 1000, PlaybackState::Playing);
        inhibitor.observe(session, true);
    }

    #[test]
    fn first_episodes_are_downgraded_to_safe_tags() {
        let config = binge_config(3);
        let inhibitor = BingeInhibitor::new(&config);

        for number in 1..=3 {
            let mut session = episode_session(&config, number, 300);
            inhibitor.observe(&mut session, true);
            assert_eq!(session.tags, ["commercial"], "episode {number}");
            assert_eq!(session.markers.len(), 1, "episode {number}");
            assert_eq!(session.markers[0].marker_type, "commercial");
            watch_to_end(&inhibitor, &mut session);
        }

        let mut fourth = episode_session(&config, 4, 300);
        inhibitor.observe(&mut fourth, true);
        assert!(fourth.tags.contains(&"intro".to_string()));
        assert_eq!(fourth.markers.len(), 2);
    }

    #[test]
    fn unwatched_switches_do_not_advance_the_count() {
        let config = binge_config(2);
        let inhibitor = BingeInhibitor::new(&config);

        let mut first = episode_session(&config, 1, 300);
        inhibitor.observe(&mut first, true);
        assert_eq!(inhibitor.count_for("client-1"), Some(1));

        // Switch after watching almost nothing.
        let mut second = episode_session(&config, 2, 300);
        inhibitor.observe(&mut second, true);
        assert_eq!(inhibitor.count_for("client-1"), Some(1));
    }

    #[test]
    fn no_binge_without_a_next_item() {
        let config = binge_config(3);
        let inhibitor = BingeInhibitor::new(&config);

        let mut session = episode_session(&config, 1, 300);
        inhibitor.observe(&mut session, false);
        assert!(session.tags.contains(&"intro".to_string()));
        assert_eq!(inhibitor.count_for("client-1"), None);
    }

    #[test]
    fn same_show_constraint_restarts_on_show_change() {
        let mut config = binge_config(1);
        config.skip.binge_same_show_only = true;
        let inhibitor = BingeInhibitor::new(&config);

        let mut first = episode_session(&config, 1, 300);
        inhibitor.observe(&mut first, true);
        watch_to_end(&inhibitor, &mut first);

        let mut other_show = episode_session(&config, 2, 999);
        inhibitor.observe(&mut other_show, true);
        assert_eq!(inhibitor.count_for("client-1"), Some(1));
    }

    #[test]
    fn skip_next_max_blocks_after_consecutive_advances() {
        let mut config = binge_config(1);
        config.skip.skip_next_max = 2;
        let inhibitor = BingeInhibitor::new(&config);

        let mut session = episode_session(&config, 1, 300);
        inhibitor.observe(&mut session, true);

        assert!(!inhibitor.advance_blocked("client-1"));
        inhibitor.register_advance("client-1");
        assert!(!inhibitor.advance_blocked("client-1"));
        inhibitor.register_advance("client-1");
        assert!(inhibitor.advance_blocked("client-1"));
    }

    #[test]
    fn paused_updates_are_ignored() {
        let config = binge_config(3);
        let inhibitor = BingeInhibitor::new(&config);

        let mut session = episode_session(&config, 1, 300);
        let _ = session.update_offset(0, PlaybackState::Paused);
        inhibitor.observe(&mut session, true);
        assert_eq!(inhibitor.count_for("client-1"), None);
    }

    #[test]
    fn disabled_inhibitor_leaves_sessions_alone() {
        let config = binge_config(0);
        let inhibitor = BingeInhibitor::new(&config);

        let mut session = episode_session(&config, 1, 300);
        inhibitor.observe(&mut session, true);
        assert!(session.tags.contains(&"intro".to_string()));
        assert!(!inhibitor.enabled());
    }
}
