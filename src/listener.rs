use futures_util::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Deserializer};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tokio_util::sync::CancellationToken;

/// One playback state notification from the server's event stream.
#[derive(Debug, Clone)]
pub struct PlaySessionAlert {
    pub session_key: i64,
    pub client_identifier: String,
    pub state: String,
    pub view_offset: i64,
    pub play_queue_id: i64,
}

#[derive(Debug)]
pub enum AlertEvent {
    Alert(PlaySessionAlert),
    Error(String),
}

/// Persistent subscription to the server's websocket notification stream,
/// running on its own worker. Messages and transport errors are forwarded to
/// the engine; closing the channel signals that the listener died and it is
/// the engine's call whether to reconnect.
pub struct AlertListener {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl AlertListener {
    pub fn start(
        url: String,
        accept_invalid_certs: bool,
        tx: mpsc::UnboundedSender<AlertEvent>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            run_listener(url, accept_invalid_certs, tx, token).await;
        });
        AlertListener { shutdown, handle }
    }

    /// Close the socket; the worker terminates within one pending read.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_listener(
    url: String,
    accept_invalid_certs: bool,
    tx: mpsc::UnboundedSender<AlertEvent>,
    shutdown: CancellationToken,
) {
    let connector = if accept_invalid_certs {
        match native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
        {
            Ok(c) => Some(Connector::NativeTls(c)),
            Err(e) => {
                let _ = tx.send(AlertEvent::Error(format!("tls setup failed: {e}")));
                return;
            }
        }
    } else {
        None
    };

    let connected = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = connect_async_tls_with_config(url.as_str(), None, false, connector) => result,
    };

    let mut stream = match connected {
        Ok((stream, _)) => stream,
        Err(e) => {
            let _ = tx.send(AlertEvent::Error(format!("websocket connect failed: {e}")));
            return;
        }
    };

    info!("Alert listener connected");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Alert listener stopping");
                let _ = stream.close(None).await;
                return;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for alert in parse_alerts(&text) {
                        let _ = tx.send(AlertEvent::Alert(alert));
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Alert stream closed by server");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = tx.send(AlertEvent::Error(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// Extract the playing notifications from one websocket frame. Anything that
/// is not a playing notification, or does not parse, is ignored.
fn parse_alerts(text: &str) -> Vec<PlaySessionAlert> {
    let Ok(frame) = serde_json::from_str::<WsFrame>(text) else {
        return Vec::new();
    };
    let Some(container) = frame.container else {
        return Vec::new();
    };
    if container.kind != "playing" {
        return Vec::new();
    }
    container
        .notifications
        .into_iter()
        .filter_map(|n| {
            Some(PlaySessionAlert {
                session_key: n.session_key?,
                client_identifier: n.client_identifier?,
                state: n.state?,
                view_offset: n.view_offset.unwrap_or(0),
                play_queue_id: n.play_queue_id.unwrap_or(0),
            })
        })
        .collect()
}

fn de_opt_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }))
}

#[derive(Deserialize)]
struct WsFrame {
    #[serde(rename = "NotificationContainer")]
    container: Option<NotificationContainer>,
}

#[derive(Deserialize)]
struct NotificationContainer {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(rename = "PlaySessionStateNotification", default)]
    notifications: Vec<PlayNotification>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayNotification {
    #[serde(default, deserialize_with = "de_opt_i64")]
    session_key: Option<i64>,
    client_identifier: Option<String>,
    state: Option<String>,
    view_offset: Option<i64>,
    #[serde(rename = "playQueueID", default, deserialize_with = "de_opt_i64")]
    play_queue_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playing_notifications_are_extracted() {
        let frame = r#"{
            "NotificationContainer": {
                "type": "playing",
                "size": 1,
                "PlaySessionStateNotification": [{
                    "sessionKey": "93",
                    "clientIdentifier": "client-1",
                    "guid": "",
                    "ratingKey": "32881",
                    "viewOffset": 32000,
                    "playQueueID": 7,
                    "state": "playing"
                }]
            }
        }"#;
        let alerts = parse_alerts(frame);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].session_key, 93);
        assert_eq!(alerts[0].client_identifier, "client-1");
        assert_eq!(alerts[0].view_offset, 32_000);
        assert_eq!(alerts[0].play_queue_id, 7);
        assert_eq!(alerts[0].state, "playing");
    }

    #[test]
    fn other_notification_types_are_ignored() {
        let frame = r#"{"NotificationContainer": {"type": "timeline", "TimelineEntry": []}}"#;
        assert!(parse_alerts(frame).is_empty());
        assert!(parse_alerts("not json").is_empty());
        assert!(parse_alerts("{}").is_empty());
    }

    #[test]
    fn missing_optional_fields_default() {
        let frame = r#"{
            "NotificationContainer": {
                "type": "playing",
                "PlaySessionStateNotification": [{
                    "sessionKey": 5,
                    "clientIdentifier": "c",
                    "state": "paused"
                }]
            }
        }"#;
        let alerts = parse_alerts(frame);
        assert_eq!(alerts[0].view_offset, 0);
        assert_eq!(alerts[0].play_queue_id, 0);
    }
}
