//! Player selection: which endpoint answers a request.
//!
//! An explicit reference yields to any player that is currently playing,
//! even when the reference names a different endpoint.

use std::sync::{PoisonError, RwLock};

use crate::error::{RemoteError, Result};
use crate::model::{PlaybackState, PlayerSnapshot};

/// Endpoint id of the player the daemon last routed a control action to, or
/// last resolved while it was playing. Never cleared.
#[derive(Debug, Default)]
pub struct SelectionMemory {
    last: RwLock<Option<String>>,
}

impl SelectionMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last(&self) -> Option<String> {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn remember(&self, endpoint_id: &str) {
        let mut last = self.last.write().unwrap_or_else(PoisonError::into_inner);
        if last.as_deref() != Some(endpoint_id) {
            *last = Some(endpoint_id.to_string());
        }
    }
}

/// Resolves `preferred` (or auto mode when empty) against `players`.
///
/// A result that is playing is written back to `memory`.
pub fn select(
    players: &[PlayerSnapshot],
    preferred: Option<&str>,
    memory: &SelectionMemory,
) -> Result<PlayerSnapshot> {
    if players.is_empty() {
        return Err(RemoteError::NoPlayers);
    }

    let chosen = match preferred.filter(|r| !r.is_empty()) {
        Some(reference) => {
            let matched = players
                .iter()
                .find(|p| p.matches(reference))
                .ok_or_else(|| RemoteError::NotFound(reference.to_string()))?;
            players.iter().find(|p| p.is_playing()).unwrap_or(matched)
        }
        None => auto_pick(players, memory.last().as_deref()).ok_or(RemoteError::NoPlayers)?,
    };

    if chosen.is_playing() {
        memory.remember(&chosen.endpoint_id);
    }
    Ok(chosen.clone())
}

/// Auto-mode precedence: remembered and playing, any playing, remembered,
/// first paused, first.
#[must_use]
pub fn auto_pick<'a>(
    players: &'a [PlayerSnapshot],
    last: Option<&str>,
) -> Option<&'a PlayerSnapshot> {
    let remembered = last.and_then(|id| players.iter().find(|p| p.endpoint_id == id));

    remembered
        .filter(|p| p.is_playing())
        .or_else(|| players.iter().find(|p| p.is_playing()))
        .or(remembered)
        .or_else(|| {
            players
                .iter()
                .find(|p| p.playback_state == PlaybackState::Paused)
        })
        .or_else(|| players.first())
}

/// Flags the player auto mode would pick, without touching the memory.
pub fn mark_active(players: &mut [PlayerSnapshot], last: Option<&str>) {
    let active = auto_pick(players, last).map(|p| p.endpoint_id.clone());
    for player in players.iter_mut() {
        player.is_active = active.as_deref() == Some(player.endpoint_id.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str, state: PlaybackState) -> PlayerSnapshot {
        PlayerSnapshot {
            endpoint_id: format!("org.mpris.MediaPlayer2.{id}"),
            display_name: id.to_string(),
            playback_state: state,
            ..PlayerSnapshot::default()
        }
    }

    fn bus(id: &str) -> String {
        format!("org.mpris.MediaPlayer2.{id}")
    }

    #[test]
    fn empty_list_is_no_players_regardless_of_memory() {
        let memory = SelectionMemory::new();
        memory.remember(&bus("a"));
        assert!(matches!(
            select(&[], None, &memory),
            Err(RemoteError::NoPlayers)
        ));
        assert!(matches!(
            select(&[], Some("a"), &memory),
            Err(RemoteError::NoPlayers)
        ));
    }

    #[test]
    fn playing_wins_over_remembered_paused() {
        let players = [
            player("a", PlaybackState::Paused),
            player("b", PlaybackState::Playing),
        ];
        let memory = SelectionMemory::new();
        memory.remember(&bus("a"));

        let chosen = select(&players, None, &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("b"));
        assert_eq!(memory.last(), Some(bus("b")));
    }

    #[test]
    fn explicit_paused_match_leaves_memory_unset() {
        let players = [player("a", PlaybackState::Paused)];
        let memory = SelectionMemory::new();

        let chosen = select(&players, Some("a"), &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("a"));
        assert_eq!(memory.last(), None);
    }

    #[test]
    fn explicit_reference_yields_to_playing_player() {
        let players = [
            player("a", PlaybackState::Paused),
            player("b", PlaybackState::Playing),
        ];
        let memory = SelectionMemory::new();

        let chosen = select(&players, Some(&bus("a")), &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("b"));
    }

    #[test]
    fn unknown_reference_is_not_found() {
        let players = [player("a", PlaybackState::Playing)];
        let memory = SelectionMemory::new();
        match select(&players, Some("vlc"), &memory) {
            Err(RemoteError::NotFound(reference)) => assert_eq!(reference, "vlc"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn empty_reference_means_auto() {
        let players = [
            player("a", PlaybackState::Stopped),
            player("b", PlaybackState::Paused),
        ];
        let memory = SelectionMemory::new();
        let chosen = select(&players, Some(""), &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("b"));
    }

    #[test]
    fn remembered_playing_beats_other_playing() {
        let players = [
            player("a", PlaybackState::Playing),
            player("b", PlaybackState::Playing),
        ];
        let memory = SelectionMemory::new();
        memory.remember(&bus("b"));
        let chosen = select(&players, None, &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("b"));
    }

    #[test]
    fn remembered_idle_player_beats_first_paused() {
        let players = [
            player("a", PlaybackState::Paused),
            player("b", PlaybackState::Stopped),
        ];
        let memory = SelectionMemory::new();
        memory.remember(&bus("b"));
        let chosen = select(&players, None, &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("b"));
        assert_eq!(memory.last(), Some(bus("b")));
    }

    #[test]
    fn falls_back_to_first_player() {
        let players = [
            player("a", PlaybackState::Stopped),
            player("b", PlaybackState::Unknown),
        ];
        let memory = SelectionMemory::new();
        memory.remember(&bus("gone"));
        let chosen = select(&players, None, &memory).expect("select");
        assert_eq!(chosen.endpoint_id, bus("a"));
    }

    #[test]
    fn auto_mode_returns_playing_for_every_order() {
        let states = [
            PlaybackState::Paused,
            PlaybackState::Stopped,
            PlaybackState::Playing,
            PlaybackState::Unknown,
        ];
        let orders: [[usize; 4]; 6] = [
            [0, 1, 2, 3],
            [2, 0, 1, 3],
            [1, 3, 0, 2],
            [3, 2, 1, 0],
            [0, 2, 3, 1],
            [3, 1, 0, 2],
        ];
        for order in orders {
            let players: Vec<_> = order
                .iter()
                .map(|&i| player(&format!("p{i}"), states[i]))
                .collect();
            for remembered in [None, Some(bus("p0")), Some(bus("p1"))] {
                let memory = SelectionMemory::new();
                if let Some(id) = &remembered {
                    memory.remember(id);
                }
                let chosen = select(&players, None, &memory).expect("select");
                assert!(chosen.is_playing(), "order {order:?} picked {chosen:?}");
            }
        }
    }

    #[test]
    fn mark_active_flags_exactly_the_auto_choice() {
        let mut players = vec![
            player("a", PlaybackState::Paused),
            player("b", PlaybackState::Stopped),
        ];
        mark_active(&mut players, Some(&bus("b")));
        assert!(!players[0].is_active);
        assert!(players[1].is_active);

        mark_active(&mut players, None);
        assert!(players[0].is_active);
        assert!(!players[1].is_active);
    }
}
