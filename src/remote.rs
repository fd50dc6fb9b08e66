//! The daemon context: bus, art cache, selection memory and hub, owned
//! together and handed to every request handler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::bus::PlayerBus;
use crate::cache::{proxy_path, ArtCache};
use crate::error::{RemoteError, Result};
use crate::hub::{Hub, HubTimeouts, PlayerSource};
use crate::model::{
    ControlAction, ControlReport, PlayerMethod, PlayerSnapshot, SeekRequest,
};
use crate::selector::{self, SelectionMemory};

pub struct Remote {
    bus: Arc<dyn PlayerBus>,
    art: ArtCache,
    memory: SelectionMemory,
    hub: Hub,
    call_timeout: Duration,
}

impl Remote {
    pub fn new(
        bus: Arc<dyn PlayerBus>,
        art: ArtCache,
        call_timeout: Duration,
        hub_timeouts: HubTimeouts,
    ) -> Self {
        Self {
            bus,
            art,
            memory: SelectionMemory::new(),
            hub: Hub::new(hub_timeouts),
            call_timeout,
        }
    }

    #[must_use]
    pub const fn hub(&self) -> &Hub {
        &self.hub
    }

    #[must_use]
    pub const fn art(&self) -> &ArtCache {
        &self.art
    }

    #[must_use]
    pub const fn selection(&self) -> &SelectionMemory {
        &self.memory
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>> + Send) -> Result<T> {
        timeout(self.call_timeout, call)
            .await
            .map_err(|_| RemoteError::Timeout(self.call_timeout))?
    }

    /// Current players with artwork proxied and the auto choice flagged.
    pub async fn list_players(&self) -> Result<Vec<PlayerSnapshot>> {
        let mut players = self.bounded(self.bus.enumerate()).await?;

        let keys = join_all(players.iter().map(|p| async move {
            match p.art_source.as_deref() {
                Some(source) => self.art.proxy(source).await,
                None => None,
            }
        }))
        .await;
        for (player, key) in players.iter_mut().zip(keys) {
            player.art_proxy_path = key.as_deref().map(proxy_path);
        }

        selector::mark_active(&mut players, self.memory.last().as_deref());
        Ok(players)
    }

    /// Resolves an optional player reference; empty means auto-select.
    pub async fn resolve(&self, preferred: Option<&str>) -> Result<PlayerSnapshot> {
        let players = self.list_players().await?;
        selector::select(&players, preferred, &self.memory)
    }

    /// Pauses a playing player, plays anything else, and falls back to the
    /// `PlayPause` toggle when the preferred method is not implemented.
    pub async fn play_pause(&self, preferred: Option<&str>) -> Result<ControlReport> {
        let player = self.resolve(preferred).await?;
        let (method, mut action) = if player.is_playing() {
            (PlayerMethod::Pause, ControlAction::Pause)
        } else {
            (PlayerMethod::Play, ControlAction::Play)
        };

        if let Err(first) = self.bounded(self.bus.invoke(&player.endpoint_id, method)).await {
            debug!(player = %player.endpoint_id, err = %first, "falling back to PlayPause");
            self.bounded(self.bus.invoke(&player.endpoint_id, PlayerMethod::PlayPause))
                .await
                .map_err(|second| {
                    RemoteError::control(
                        method.member(),
                        format!("{first} (fallback PlayPause also failed: {second})"),
                    )
                })?;
            action = ControlAction::Toggle;
        }

        Ok(self.acted(&player, ControlReport::ok(&player, action)))
    }

    pub async fn next(&self, preferred: Option<&str>) -> Result<ControlReport> {
        self.simple(preferred, PlayerMethod::Next, ControlAction::Next)
            .await
    }

    pub async fn previous(&self, preferred: Option<&str>) -> Result<ControlReport> {
        self.simple(preferred, PlayerMethod::Previous, ControlAction::Previous)
            .await
    }

    async fn simple(
        &self,
        preferred: Option<&str>,
        method: PlayerMethod,
        action: ControlAction,
    ) -> Result<ControlReport> {
        let player = self.resolve(preferred).await?;
        self.bounded(self.bus.invoke(&player.endpoint_id, method))
            .await?;
        Ok(self.acted(&player, ControlReport::ok(&player, action)))
    }

    /// Absolute seek when `target_ms` is given, relative otherwise. A failed
    /// absolute seek retries relatively if a delta was supplied too.
    pub async fn seek(&self, preferred: Option<&str>, request: SeekRequest) -> Result<ControlReport> {
        if request.delta_ms.is_none() && request.target_ms.is_none() {
            return Err(RemoteError::InvalidRequest("delta_ms or target_ms required"));
        }
        let player = self.resolve(preferred).await?;
        let endpoint = player.endpoint_id.as_str();

        if let Some(target) = request.target_ms {
            let absolute = self
                .bounded(
                    self.bus
                        .set_position(endpoint, player.track_id.as_deref(), target),
                )
                .await;
            if let Err(err) = absolute {
                let Some(delta) = request.delta_ms else {
                    return Err(err);
                };
                debug!(player = %endpoint, %err, "absolute seek failed, seeking relatively");
                self.bounded(self.bus.seek(endpoint, delta)).await?;
            }
        } else if let Some(delta) = request.delta_ms {
            self.bounded(self.bus.seek(endpoint, delta)).await?;
        }

        let mut report = ControlReport::ok(&player, ControlAction::Seek);
        report.delta_ms = request.delta_ms;
        report.target_ms = request.target_ms;
        Ok(self.acted(&player, report))
    }

    fn acted(&self, player: &PlayerSnapshot, report: ControlReport) -> ControlReport {
        self.memory.remember(&player.endpoint_id);
        self.hub.trigger();
        info!(player = %player.endpoint_id, action = ?report.action, "control");
        report
    }
}

#[async_trait]
impl PlayerSource for Remote {
    async fn list_players(&self) -> Result<Vec<PlayerSnapshot>> {
        Self::list_players(self).await
    }

    fn memory(&self) -> &SelectionMemory {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlaybackState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBus {
        players: Vec<PlayerSnapshot>,
        unsupported: Vec<&'static str>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeBus {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls").clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().expect("calls").push(call);
        }
    }

    #[async_trait]
    impl PlayerBus for FakeBus {
        async fn enumerate(&self) -> Result<Vec<PlayerSnapshot>> {
            Ok(self.players.clone())
        }

        async fn invoke(&self, endpoint: &str, method: PlayerMethod) -> Result<()> {
            self.record(format!("{endpoint}:{}", method.member()));
            if self.unsupported.contains(&method.member()) {
                return Err(RemoteError::control(method.member(), "UnknownMethod"));
            }
            Ok(())
        }

        async fn seek(&self, endpoint: &str, delta_ms: i64) -> Result<()> {
            self.record(format!("{endpoint}:Seek({delta_ms})"));
            Ok(())
        }

        async fn set_position(
            &self,
            endpoint: &str,
            track_id: Option<&str>,
            target_ms: i64,
        ) -> Result<()> {
            let track_id = track_id.ok_or(RemoteError::MissingTrackId)?;
            self.record(format!("{endpoint}:SetPosition({track_id},{target_ms})"));
            Ok(())
        }
    }

    fn player(id: &str, state: PlaybackState) -> PlayerSnapshot {
        PlayerSnapshot {
            endpoint_id: id.to_string(),
            display_name: id.to_uppercase(),
            playback_state: state,
            can_control: true,
            ..PlayerSnapshot::default()
        }
    }

    fn remote(bus: FakeBus) -> (Arc<FakeBus>, Remote, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("cache dir");
        let bus = Arc::new(bus);
        let art = ArtCache::new(dir.path(), vec![dir.path().to_path_buf()]);
        let remote = Remote::new(
            bus.clone(),
            art,
            Duration::from_secs(1),
            HubTimeouts::default(),
        );
        (bus, remote, dir)
    }

    #[tokio::test]
    async fn toggle_pauses_a_playing_player() {
        let (bus, remote, _dir) = remote(FakeBus {
            players: vec![player("a", PlaybackState::Playing)],
            ..FakeBus::default()
        });
        let report = remote.play_pause(None).await.expect("toggle");
        assert_eq!(report.action, ControlAction::Pause);
        assert_eq!(report.player, "A");
        assert_eq!(bus.calls(), vec!["a:Pause"]);
        assert_eq!(remote.selection().last().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn toggle_falls_back_to_play_pause() {
        let (bus, remote, _dir) = remote(FakeBus {
            players: vec![player("a", PlaybackState::Paused)],
            unsupported: vec!["Play"],
            ..FakeBus::default()
        });
        let report = remote.play_pause(Some("a")).await.expect("toggle");
        assert_eq!(report.action, ControlAction::Toggle);
        assert_eq!(bus.calls(), vec!["a:Play", "a:PlayPause"]);
    }

    #[tokio::test]
    async fn toggle_surfaces_error_when_fallback_fails() {
        let (_bus, remote, _dir) = remote(FakeBus {
            players: vec![player("a", PlaybackState::Paused)],
            unsupported: vec!["Play", "PlayPause"],
            ..FakeBus::default()
        });
        let err = remote.play_pause(None).await.expect_err("must fail");
        assert!(matches!(err, RemoteError::Control { method: "Play", .. }));
        assert_eq!(remote.selection().last(), None);
    }

    #[tokio::test]
    async fn next_remembers_the_controlled_player() {
        let (bus, remote, _dir) = remote(FakeBus {
            players: vec![
                player("a", PlaybackState::Paused),
                player("b", PlaybackState::Stopped),
            ],
            ..FakeBus::default()
        });
        remote.next(Some("B")).await.expect("next");
        assert_eq!(bus.calls(), vec!["b:Next"]);
        assert_eq!(remote.selection().last().as_deref(), Some("b"));

        // Auto mode now sticks with b even though a is paused.
        let chosen = remote.resolve(None).await.expect("resolve");
        assert_eq!(chosen.endpoint_id, "b");
    }

    #[tokio::test]
    async fn absolute_seek_without_track_falls_back_to_delta() {
        let (bus, remote, _dir) = remote(FakeBus {
            players: vec![player("a", PlaybackState::Playing)],
            ..FakeBus::default()
        });
        let report = remote
            .seek(
                None,
                SeekRequest {
                    delta_ms: Some(-5_000),
                    target_ms: Some(60_000),
                },
            )
            .await
            .expect("seek");
        assert_eq!(report.action, ControlAction::Seek);
        assert_eq!(bus.calls(), vec!["a:Seek(-5000)"]);
    }

    #[tokio::test]
    async fn absolute_seek_without_track_or_delta_fails() {
        let (_bus, remote, _dir) = remote(FakeBus {
            players: vec![player("a", PlaybackState::Playing)],
            ..FakeBus::default()
        });
        let err = remote
            .seek(
                None,
                SeekRequest {
                    delta_ms: None,
                    target_ms: Some(60_000),
                },
            )
            .await
            .expect_err("must fail");
        assert!(matches!(err, RemoteError::MissingTrackId));
    }

    #[tokio::test]
    async fn absolute_seek_uses_track_id() {
        let mut a = player("a", PlaybackState::Playing);
        a.track_id = Some("/track/1".into());
        let (bus, remote, _dir) = remote(FakeBus {
            players: vec![a],
            ..FakeBus::default()
        });
        remote
            .seek(
                None,
                SeekRequest {
                    delta_ms: None,
                    target_ms: Some(1_000),
                },
            )
            .await
            .expect("seek");
        assert_eq!(bus.calls(), vec!["a:SetPosition(/track/1,1000)"]);
    }

    #[tokio::test]
    async fn empty_seek_is_rejected_before_touching_the_bus() {
        let (bus, remote, _dir) = remote(FakeBus::default());
        let err = remote
            .seek(None, SeekRequest::default())
            .await
            .expect_err("must fail");
        assert!(matches!(err, RemoteError::InvalidRequest(_)));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn list_players_flags_active_and_proxies_local_art() {
        let (_bus, remote, dir) = {
            let dir = tempfile::tempdir().expect("dir");
            let art_path = dir.path().join("cover.png");
            std::fs::write(&art_path, b"png").expect("write art");
            let mut b = player("b", PlaybackState::Paused);
            b.art_source = Some(
                url::Url::from_file_path(&art_path)
                    .expect("url")
                    .to_string(),
            );
            let mut c = player("c", PlaybackState::Stopped);
            c.art_source = Some("https://example.com/c.jpg".into());
            let bus = Arc::new(FakeBus {
                players: vec![player("a", PlaybackState::Stopped), b, c],
                ..FakeBus::default()
            });
            let art = ArtCache::new(dir.path().join("cache"), vec![dir.path().to_path_buf()]);
            let remote = Remote::new(
                bus.clone(),
                art,
                Duration::from_secs(1),
                HubTimeouts::default(),
            );
            (bus, remote, dir)
        };

        let players = remote.list_players().await.expect("list");
        let active: Vec<_> = players
            .iter()
            .filter(|p| p.is_active)
            .map(|p| p.endpoint_id.as_str())
            .collect();
        assert_eq!(active, vec!["b"]);

        let proxied = players[1].art_proxy_path.as_deref().expect("proxied");
        assert!(proxied.starts_with("/art/"));
        let key = proxied.trim_start_matches("/art/");
        let served = remote.art().serve(key).await.expect("serve");
        assert_eq!(served.bytes.as_ref(), b"png");
        assert_eq!(players[2].art_proxy_path, None);
        assert!(dir.path().join("cache").join(key).exists());
    }
}
