//! Player snapshots and control vocabulary.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    #[default]
    Unknown,
}

impl PlaybackState {
    /// Parses an MPRIS `PlaybackStatus` string, ignoring case.
    #[must_use]
    pub fn parse(status: &str) -> Self {
        let status = status.trim();
        if status.eq_ignore_ascii_case("playing") {
            Self::Playing
        } else if status.eq_ignore_ascii_case("paused") {
            Self::Paused
        } else if status.eq_ignore_ascii_case("stopped") {
            Self::Stopped
        } else {
            Self::Unknown
        }
    }
}

/// Point-in-time view of one media endpoint. Built fresh on every
/// enumeration; `endpoint_id` is the only durable identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PlayerSnapshot {
    #[serde(rename = "bus_name")]
    pub endpoint_id: String,
    #[serde(rename = "identity")]
    pub display_name: String,
    #[serde(rename = "playback_status")]
    pub playback_state: PlaybackState,
    pub can_control: bool,
    pub is_active: bool,
    #[serde(rename = "position_millis", skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<u64>,
    #[serde(rename = "length_millis", skip_serializing_if = "Option::is_none")]
    pub length_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub artist: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub album: String,
    #[serde(rename = "url", skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(rename = "art_url", skip_serializing_if = "Option::is_none")]
    pub art_source: Option<String>,
    #[serde(rename = "art_url_proxy", skip_serializing_if = "Option::is_none")]
    pub art_proxy_path: Option<String>,
}

impl PlayerSnapshot {
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.playback_state == PlaybackState::Playing
    }

    /// True when `reference` names this player by bus name or identity.
    #[must_use]
    pub fn matches(&self, reference: &str) -> bool {
        self.endpoint_id == reference || self.display_name == reference
    }
}

/// Zero-argument methods of `org.mpris.MediaPlayer2.Player`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerMethod {
    Play,
    Pause,
    PlayPause,
    Next,
    Previous,
}

impl PlayerMethod {
    #[must_use]
    pub const fn member(self) -> &'static str {
        match self {
            Self::Play => "Play",
            Self::Pause => "Pause",
            Self::PlayPause => "PlayPause",
            Self::Next => "Next",
            Self::Previous => "Previous",
        }
    }
}

/// Which path a control request actually took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    Seek,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlReport {
    pub player: String,
    pub action: ControlAction,
    #[serde(rename = "delta", skip_serializing_if = "Option::is_none")]
    pub delta_ms: Option<i64>,
    #[serde(rename = "target", skip_serializing_if = "Option::is_none")]
    pub target_ms: Option<i64>,
    pub status: &'static str,
}

impl ControlReport {
    pub(crate) fn ok(player: &PlayerSnapshot, action: ControlAction) -> Self {
        Self {
            player: player.display_name.clone(),
            action,
            delta_ms: None,
            target_ms: None,
            status: "ok",
        }
    }
}

/// Body of a seek request; at least one field must be present.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SeekRequest {
    #[serde(default)]
    pub delta_ms: Option<i64>,
    #[serde(default)]
    pub target_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn playback_state_parses_case_insensitively() {
        assert_eq!(PlaybackState::parse("Playing"), PlaybackState::Playing);
        assert_eq!(PlaybackState::parse("paused"), PlaybackState::Paused);
        assert_eq!(PlaybackState::parse(" STOPPED "), PlaybackState::Stopped);
        assert_eq!(PlaybackState::parse("Buffering"), PlaybackState::Unknown);
    }

    #[test]
    fn snapshot_serializes_with_wire_names() {
        let snapshot = PlayerSnapshot {
            endpoint_id: "org.mpris.MediaPlayer2.mpv".into(),
            display_name: "mpv".into(),
            playback_state: PlaybackState::Paused,
            position_ms: Some(1500),
            ..PlayerSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(json["bus_name"], "org.mpris.MediaPlayer2.mpv");
        assert_eq!(json["identity"], "mpv");
        assert_eq!(json["playback_status"], "Paused");
        assert_eq!(json["position_millis"], 1500);
        assert!(json.get("title").is_none());
        assert!(json.get("art_url_proxy").is_none());
    }
}
