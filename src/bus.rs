//! Session-bus client for MPRIS endpoints.
//!
//! `PlayerBus` is what the rest of the daemon talks to; `MprisBus` is the
//! zbus implementation. It shares one session connection and opens a fresh
//! one after the old one breaks.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use zbus::fdo::DBusProxy;
use zbus::zvariant::{DynamicType, ObjectPath, OwnedValue, Value};
use zbus::{CacheProperties, Connection, Proxy, ProxyBuilder};

use crate::error::{RemoteError, Result};
use crate::model::{PlaybackState, PlayerMethod, PlayerSnapshot};

pub const MPRIS_PREFIX: &str = "org.mpris.MediaPlayer2.";
pub const MPRIS_PATH: &str = "/org/mpris/MediaPlayer2";
pub const MPRIS_ROOT: &str = "org.mpris.MediaPlayer2";
pub const MPRIS_PLAYER: &str = "org.mpris.MediaPlayer2.Player";

const NO_TRACK: &str = "/org/mpris/MediaPlayer2/TrackList/NoTrack";

#[async_trait]
pub trait PlayerBus: Send + Sync {
    /// Every endpoint under the MPRIS namespace, sorted by bus name. An
    /// endpoint that fails or stalls is skipped, not fatal.
    async fn enumerate(&self) -> Result<Vec<PlayerSnapshot>>;

    async fn invoke(&self, endpoint: &str, method: PlayerMethod) -> Result<()>;

    async fn seek(&self, endpoint: &str, delta_ms: i64) -> Result<()>;

    async fn set_position(
        &self,
        endpoint: &str,
        track_id: Option<&str>,
        target_ms: i64,
    ) -> Result<()>;
}

pub struct MprisBus {
    // `None` after a transport failure; the next call reconnects.
    conn: Mutex<Option<Connection>>,
    endpoint_timeout: Duration,
}

impl MprisBus {
    pub async fn session(endpoint_timeout: Duration) -> Result<Self> {
        let conn = Connection::session().await?;
        Ok(Self::new(conn, endpoint_timeout))
    }

    #[must_use]
    pub fn new(conn: Connection, endpoint_timeout: Duration) -> Self {
        Self {
            conn: Mutex::new(Some(conn)),
            endpoint_timeout,
        }
    }

    async fn connection(&self) -> zbus::Result<Connection> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Connection::session().await?;
        info!("session bus reconnected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn discard_if_broken(&self, err: &zbus::Error) {
        if is_transport_error(err) {
            warn!(%err, "session bus connection lost, reconnecting on next call");
            self.conn.lock().await.take();
        }
    }

    async fn call<B>(&self, endpoint: &str, method: &'static str, body: &B) -> Result<()>
    where
        B: serde::Serialize + DynamicType + Sync,
    {
        let conn = self
            .connection()
            .await
            .map_err(|err| RemoteError::control(method, err))?;
        if let Err(err) = call_on(&conn, endpoint, method, body).await {
            self.discard_if_broken(&err).await;
            return Err(RemoteError::control(method, err));
        }
        Ok(())
    }
}

#[async_trait]
impl PlayerBus for MprisBus {
    async fn enumerate(&self) -> Result<Vec<PlayerSnapshot>> {
        let conn = self.connection().await?;
        let names = match player_names(&conn).await {
            Ok(names) => names,
            Err(err) => {
                self.discard_if_broken(&err).await;
                return Err(err.into());
            }
        };
        let players = gather(&names, self.endpoint_timeout, |name| {
            fetch_player(&conn, name)
        })
        .await;
        Ok(players)
    }

    async fn invoke(&self, endpoint: &str, method: PlayerMethod) -> Result<()> {
        self.call(endpoint, method.member(), &()).await
    }

    async fn seek(&self, endpoint: &str, delta_ms: i64) -> Result<()> {
        self.call(endpoint, "Seek", &(millis_to_micros(delta_ms),))
            .await
    }

    async fn set_position(
        &self,
        endpoint: &str,
        track_id: Option<&str>,
        target_ms: i64,
    ) -> Result<()> {
        let track_id = usable_track_id(track_id).ok_or(RemoteError::MissingTrackId)?;
        let path = ObjectPath::try_from(track_id).map_err(|_| RemoteError::MissingTrackId)?;
        self.call(endpoint, "SetPosition", &(path, millis_to_micros(target_ms)))
            .await
    }
}

/// Errors that mean the socket itself is gone, as opposed to a player
/// rejecting a call.
fn is_transport_error(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::InputOutput(_))
}

async fn player_names(conn: &Connection) -> zbus::Result<Vec<String>> {
    let dbus = DBusProxy::new(conn).await?;
    let mut names: Vec<String> = dbus
        .list_names()
        .await
        .map_err(zbus::Error::from)?
        .into_iter()
        .map(|name| name.as_str().to_owned())
        .filter(|name| name.starts_with(MPRIS_PREFIX))
        .collect();
    names.sort();
    Ok(names)
}

/// Fetches every endpoint concurrently, each under its own deadline. Failed
/// and stalled endpoints are logged and left out; order follows `names`.
async fn gather<'a, F, Fut, E>(
    names: &'a [String],
    limit: Duration,
    fetch: F,
) -> Vec<PlayerSnapshot>
where
    F: Fn(&'a str) -> Fut,
    Fut: Future<Output = std::result::Result<PlayerSnapshot, E>>,
    E: Display,
{
    let fetched = join_all(names.iter().map(|name| timeout(limit, fetch(name)))).await;
    names
        .iter()
        .zip(fetched)
        .filter_map(|(name, result)| match result {
            Ok(Ok(snapshot)) => Some(snapshot),
            Ok(Err(err)) => {
                warn!(player = %name, %err, "skipping player");
                None
            }
            Err(_) => {
                warn!(player = %name, ?limit, "player did not answer, skipping");
                None
            }
        })
        .collect()
}

// Proxies are short-lived, so property caching would only add match rules.
async fn proxy<'a>(
    conn: &Connection,
    endpoint: &'a str,
    interface: &'static str,
) -> zbus::Result<Proxy<'a>> {
    ProxyBuilder::new_bare(conn)
        .destination(endpoint)?
        .path(MPRIS_PATH)?
        .interface(interface)?
        .cache_properties(CacheProperties::No)
        .build()
        .await
}

async fn call_on<B>(
    conn: &Connection,
    endpoint: &str,
    method: &'static str,
    body: &B,
) -> zbus::Result<()>
where
    B: serde::Serialize + DynamicType + Sync,
{
    proxy(conn, endpoint, MPRIS_PLAYER)
        .await?
        .call_method(method, body)
        .await?;
    Ok(())
}

async fn fetch_player(conn: &Connection, endpoint: &str) -> zbus::Result<PlayerSnapshot> {
    let root = proxy(conn, endpoint, MPRIS_ROOT).await?;
    let player = proxy(conn, endpoint, MPRIS_PLAYER).await?;

    let identity: String = root.get_property("Identity").await?;
    let status: String = player.get_property("PlaybackStatus").await?;
    let can_control: bool = player.get_property("CanControl").await?;

    let mut snapshot = PlayerSnapshot {
        endpoint_id: endpoint.to_string(),
        display_name: identity,
        playback_state: PlaybackState::parse(&status),
        can_control,
        ..PlayerSnapshot::default()
    };

    match player
        .get_property::<HashMap<String, OwnedValue>>("Metadata")
        .await
    {
        Ok(metadata) => apply_metadata(&mut snapshot, &metadata),
        Err(err) => debug!(player = %endpoint, %err, "metadata unavailable"),
    }
    if let Ok(position) = player.get_property::<i64>("Position").await {
        snapshot.position_ms = micros_to_millis(position);
    }

    Ok(snapshot)
}

fn usable_track_id(track_id: Option<&str>) -> Option<&str> {
    track_id.filter(|id| !id.is_empty() && *id != NO_TRACK)
}

/// Bus positions are microseconds; truncate toward zero, drop negatives.
#[must_use]
pub fn micros_to_millis(micros: i64) -> Option<u64> {
    u64::try_from(micros).ok().map(|us| us / 1000)
}

#[must_use]
pub const fn millis_to_micros(millis: i64) -> i64 {
    millis.saturating_mul(1000)
}

fn apply_metadata(snapshot: &mut PlayerSnapshot, metadata: &HashMap<String, OwnedValue>) {
    let text = |key: &str| metadata.get(key).and_then(|v| value_string(v));

    snapshot.title = text("xesam:title").unwrap_or_default();
    snapshot.album = text("xesam:album").unwrap_or_default();
    snapshot.artist = metadata
        .get("xesam:artist")
        .and_then(|v| first_string(v))
        .unwrap_or_default();
    snapshot.source_url = text("xesam:url").filter(|s| !s.is_empty());
    snapshot.art_source = text("mpris:artUrl").filter(|s| !s.is_empty());
    snapshot.track_id = text("mpris:trackid").filter(|s| !s.is_empty());
    snapshot.length_ms = metadata
        .get("mpris:length")
        .and_then(|v| value_i64(v))
        .and_then(micros_to_millis);
}

fn value_string(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.as_str().to_string()),
        Value::ObjectPath(p) => Some(p.as_str().to_string()),
        Value::Value(inner) => value_string(inner),
        _ => None,
    }
}

// Some players send xesam:artist as a plain string instead of a list.
fn first_string(value: &Value<'_>) -> Option<String> {
    if let Ok(list) = Vec::<String>::try_from(value.clone()) {
        return list.into_iter().find(|s| !s.trim().is_empty());
    }
    value_string(value).filter(|s| !s.trim().is_empty())
}

fn value_i64(value: &Value<'_>) -> Option<i64> {
    match value {
        Value::I64(n) => Some(*n),
        Value::U64(n) => i64::try_from(*n).ok(),
        Value::I32(n) => Some(i64::from(*n)),
        Value::U32(n) => Some(i64::from(*n)),
        Value::I16(n) => Some(i64::from(*n)),
        Value::U16(n) => Some(i64::from(*n)),
        Value::Value(inner) => value_i64(inner),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_truncate_never_round_up() {
        assert_eq!(micros_to_millis(1_999_999), Some(1_999));
        assert_eq!(micros_to_millis(999), Some(0));
        assert_eq!(micros_to_millis(0), Some(0));
        assert_eq!(micros_to_millis(-5), None);
    }

    #[test]
    fn millis_scale_to_micros() {
        assert_eq!(millis_to_micros(-10_000), -10_000_000);
        assert_eq!(millis_to_micros(i64::MAX), i64::MAX);
    }

    #[test]
    fn no_track_sentinel_is_not_usable() {
        assert_eq!(usable_track_id(Some(NO_TRACK)), None);
        assert_eq!(usable_track_id(Some("")), None);
        assert_eq!(usable_track_id(None), None);
        assert_eq!(
            usable_track_id(Some("/org/mpris/MediaPlayer2/Track/7")),
            Some("/org/mpris/MediaPlayer2/Track/7")
        );
    }

    #[test]
    fn integer_widths_are_accepted() {
        assert_eq!(value_i64(&Value::I64(42)), Some(42));
        assert_eq!(value_i64(&Value::U64(42)), Some(42));
        assert_eq!(value_i64(&Value::I32(-3)), Some(-3));
        assert_eq!(value_i64(&Value::Bool(true)), None);
    }

    fn snapshot(endpoint: &str) -> PlayerSnapshot {
        PlayerSnapshot {
            endpoint_id: endpoint.to_string(),
            playback_state: PlaybackState::Playing,
            ..PlayerSnapshot::default()
        }
    }

    #[tokio::test]
    async fn stalled_endpoint_is_skipped_not_fatal() {
        let names: Vec<String> = ["a.healthy", "b.hung", "c.broken", "d.healthy"]
            .iter()
            .map(|n| format!("{MPRIS_PREFIX}{n}"))
            .collect();
        let started = std::time::Instant::now();
        let players = timeout(
            Duration::from_secs(2),
            gather(&names, Duration::from_millis(100), |name| async move {
                if name.ends_with("hung") {
                    std::future::pending::<()>().await;
                }
                if name.ends_with("broken") {
                    return Err("no reply".to_string());
                }
                Ok(snapshot(name))
            }),
        )
        .await
        .expect("gather finishes on its own");

        let ids: Vec<_> = players.iter().map(|p| p.endpoint_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "org.mpris.MediaPlayer2.a.healthy",
                "org.mpris.MediaPlayer2.d.healthy"
            ]
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn only_io_failures_drop_the_connection() {
        let broken = zbus::Error::InputOutput(std::sync::Arc::new(std::io::Error::from(
            std::io::ErrorKind::BrokenPipe,
        )));
        assert!(is_transport_error(&broken));
        assert!(!is_transport_error(&zbus::Error::Unsupported));
        assert!(!is_transport_error(&zbus::Error::InvalidReply));
    }
}
