use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::binge::BingeInhibitor;
use crate::config::Config;
use crate::server::{CommandError, PlayerHandle, PlexServer};
use crate::session::SessionId;
use crate::skipper::SharedState;

/// Upper bound on concurrently running command workers, so a storm of alerts
/// against slow players cannot fork without limit.
const MAX_COMMAND_WORKERS: usize = 8;

/// Some players misbehave when asked to seek exactly to the end; this much
/// is held back per product.
const CREDIT_SKIP_FIX: [(&str, i64); 1] = [("Plex for Roku", 1500)];

fn end_fudge(product: &str) -> i64 {
    CREDIT_SKIP_FIX
        .iter()
        .find(|(p, _)| *p == product)
        .map(|(_, f)| *f)
        .unwrap_or(0)
}

enum SeekPlan {
    Seek { target: i64 },
    Advance,
    Done,
}

/// Stateless player command helpers. Every RPC runs on its own short-lived
/// worker so the tick loop never blocks on the network; workers are gated by
/// a small semaphore.
pub struct Commander {
    server: Arc<PlexServer>,
    state: Arc<SharedState>,
    binge: Arc<BingeInhibitor>,
    config: Arc<Config>,
    permits: Arc<Semaphore>,
}

impl Commander {
    pub fn new(
        server: Arc<PlexServer>,
        state: Arc<SharedState>,
        binge: Arc<BingeInhibitor>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Commander {
            server,
            state,
            binge,
            config,
            permits: Arc::new(Semaphore::new(MAX_COMMAND_WORKERS)),
        })
    }

    /// Seek the session's player to `target`. With skip-next set and a target
    /// at or past the end of the item this becomes a play-queue advance.
    pub fn seek(self: &Arc<Self>, id: SessionId, target: i64) {
        let commander = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = commander.permits.acquire().await else { return };
            commander.run_seek(id, target).await;
        });
    }

    /// Set the player volume, caching the previous level on the session so it
    /// can be restored once the range has passed.
    pub fn set_volume(self: &Arc<Self>, id: SessionId, level: u8, lowering: bool) {
        let commander = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_permit) = commander.permits.acquire().await else { return };
            commander.run_volume(id, level, lowering).await;
        });
    }

    async fn run_seek(&self, id: SessionId, target: i64) {
        let plan = {
            let mut sessions = self.state.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&id) else { return };
            if session.seeking() {
                return;
            }
            let duration = session.media.duration;
            if session.skip_next && duration > 0 && target >= duration {
                SeekPlan::Advance
            } else {
                let fudge = end_fudge(&session.player.product);
                let mut target = target;
                if duration > 0 && target >= duration - fudge {
                    debug!(
                        "Target {} is greater or equal to duration {}(-{}), adjusting to match",
                        target, duration, fudge
                    );
                    target = duration - fudge;
                }
                if target <= session.view_offset() {
                    debug!(
                        "Target {} is less than or equal to current viewOffset {}, ignoring",
                        target,
                        session.view_offset()
                    );
                    SeekPlan::Done
                } else {
                    info!(
                        "Seeking {} player playing {} from {} to {}",
                        session.player.product,
                        session,
                        session.view_offset(),
                        target
                    );
                    session.begin_seek(target);
                    SeekPlan::Seek { target }
                }
            }
        };

        match plan {
            SeekPlan::Done => {}
            SeekPlan::Seek { target } => {
                let Some(player) = self.player_for(&id) else { return };
                let result = self.with_fallback(&player, |p| {
                    let server = Arc::clone(&self.server);
                    async move { server.seek_player(&p, target).await }
                })
                .await;
                self.settle(&id, result);
            }
            SeekPlan::Advance => self.advance_next(id).await,
        }
    }

    /// Advance to the next item in the play queue: the session is removed and
    /// ignored so later alerts for it do not re-trigger, then the player is
    /// handed a fresh queue starting at the next item.
    async fn advance_next(&self, id: SessionId) {
        let Some(session) = self.state.remove_session(&id) else { return };
        self.state.ignore(id.clone());

        let Some(player) = self.player_for(&id) else { return };

        if self.binge.advance_blocked(&id.client_identifier) {
            info!(
                "Session {} reached the skip-next limit, stopping playback",
                session
            );
            if let Err(e) = self.server.stop_player(&player).await {
                warn!("Error stopping player {}: {}", player.title, e);
            }
            return;
        }

        let queue = match self.server.play_queue(session.play_queue_id).await {
            Ok(queue) => Some(queue),
            Err(e) => {
                warn!(
                    "Unable to get play queue {} data from server: {}",
                    session.play_queue_id, e
                );
                None
            }
        };

        let next = queue.as_ref().and_then(|q| {
            let pos = q.position_of(session.media.rating_key)?;
            q.items.get(pos + 1)
        });

        let Some(next) = next else {
            // No queue data or already the last item; seek to the end instead
            // of looping the same episode.
            debug!("Seek target is the end but no next item available, seeking to duration");
            let target = session.media.duration - end_fudge(&player.product);
            if let Err(e) = self.server.seek_player(&player, target).await {
                warn!("Error seeking player {}: {}", player.title, e);
            }
            return;
        };

        let keys: Vec<i64> = queue
            .as_ref()
            .map(|q| q.items.iter().map(|i| i.rating_key).collect())
            .unwrap_or_default();
        let next_key = next.rating_key;

        let new_queue = match self.server.create_play_queue(&keys, next_key).await {
            Ok(q) => q,
            Err(e) => {
                warn!("Unable to create play queue starting at {}: {}", next_key, e);
                return;
            }
        };
        debug!("Created new play queue {} with start item {}", new_queue.id, next_key);

        self.binge.register_advance(&id.client_identifier);

        let delay = Duration::from_millis(
            session.command_delay.unwrap_or(self.config.offsets.command),
        );
        tokio::time::sleep(delay).await;
        if let Err(e) = self.server.stop_player(&player).await {
            warn!("Error stopping player {}: {}", player.title, e);
        }
        tokio::time::sleep(delay).await;
        if let Err(e) = self.server.play_media(&player, &new_queue, next_key).await {
            warn!("Error starting new play queue on {}: {}", player.title, e);
        }
    }

    async fn run_volume(&self, id: SessionId, level: u8, lowering: bool) {
        let Some(player) = self.player_for(&id) else { return };

        let previous = match self.server.player_volume(&player).await {
            Ok(Some(volume)) => volume,
            _ => {
                let fallback = if lowering {
                    self.config.volume.high
                } else {
                    self.config.volume.low
                };
                debug!(
                    "Unable to read timeline volume for player {}, will restore to {}",
                    player.product, fallback
                );
                fallback
            }
        };

        {
            let mut sessions = self.state.sessions.lock().unwrap();
            let Some(session) = sessions.get_mut(&id) else { return };
            info!(
                "Setting {} player volume playing {} from {} to {}",
                player.product, session, previous, level
            );
            session.update_volume(previous, lowering);
        }

        let result = self.with_fallback(&player, |p| {
            let server = Arc::clone(&self.server);
            async move { server.set_player_volume(&p, level).await }
        })
        .await;
        self.settle(&id, result);
    }

    fn player_for(&self, id: &SessionId) -> Option<PlayerHandle> {
        let player = self.server.player(&id.client_identifier);
        if player.is_none() {
            debug!("Session {} has no registered player", id);
        }
        player
    }

    /// Run a command, falling back once to a direct companion connection when
    /// the proxied command is rejected.
    async fn with_fallback<F, Fut>(&self, player: &PlayerHandle, command: F) -> Result<(), CommandError>
    where
        F: Fn(PlayerHandle) -> Fut,
        Fut: std::future::Future<Output = Result<(), CommandError>>,
    {
        match command(player.clone()).await {
            Err(e @ (CommandError::BadRequest(_) | CommandError::NotFound(_))) => {
                log_command_error(&e, &player.title);
                match self.server.fallback_direct(player).await {
                    Some(direct) => command(direct).await,
                    None => Err(e),
                }
            }
            other => other,
        }
    }

    /// Shared failure handling: timeouts and transport errors remove the
    /// session so the next alert rebuilds it; rejections park it in the
    /// buffering state so this tick stops retrying.
    fn settle(&self, id: &SessionId, result: Result<(), CommandError>) {
        match result {
            Ok(()) => {}
            Err(CommandError::Timeout(_)) | Err(CommandError::Transport(_)) => {
                debug!(
                    "Transport error, removing {} from cache to prevent false triggers, will be restored with next sync",
                    id
                );
                self.state.remove_session(id);
            }
            Err(e) => {
                error!("Command failed for session {}: {}", id, e);
                self.state.mark_buffering(id);
            }
        }
    }
}

fn log_command_error(error: &CommandError, player: &str) {
    let message = error.to_string();
    if message.contains("unable to find player") {
        error!(
            "Player {} was not found; check that 'Advertise as Player' (network discovery) is enabled in the client settings",
            player
        );
    } else if message.contains("403") {
        error!(
            "Player {} refused the command (403 Forbidden); the client may not allow remote control from this account",
            player
        );
    } else {
        error!("Command error for player {}: {}", player, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fudge_applies_per_product() {
        assert_eq!(end_fudge("Plex for Roku"), 1500);
        assert_eq!(end_fudge("Plex for Apple TV"), 0);
    }
}
