//! Default sink volume through `wpctl`, falling back to `pactl`.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_VOLUME: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeState {
    pub backend: &'static str,
    /// 1.0 is 100%.
    pub volume: f64,
    pub muted: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct VolumeRequest {
    #[serde(default)]
    pub absolute: Option<f64>,
    #[serde(default)]
    pub delta: Option<f64>,
    #[serde(default)]
    pub mute: Option<bool>,
}

impl VolumeRequest {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.absolute.is_none() && self.delta.is_none() && self.mute.is_none()
    }

    /// New volume for `current`, or `None` when only mute changes.
    /// `absolute` wins over `delta`.
    #[must_use]
    pub fn target(&self, current: f64) -> Option<f64> {
        let wanted = match (self.absolute, self.delta) {
            (Some(absolute), _) => absolute,
            (None, Some(delta)) => current + delta,
            (None, None) => return None,
        };
        Some(clamp(wanted))
    }
}

fn clamp(volume: f64) -> f64 {
    if volume.is_nan() {
        return 0.0;
    }
    volume.clamp(0.0, MAX_VOLUME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Wpctl,
    Pactl,
}

impl Backend {
    const fn name(self) -> &'static str {
        match self {
            Self::Wpctl => "wpctl",
            Self::Pactl => "pactl",
        }
    }

    async fn get(self) -> Result<VolumeState> {
        let (volume, muted) = match self {
            Self::Wpctl => {
                let out = run("wpctl", &["get-volume", "@DEFAULT_AUDIO_SINK@"]).await?;
                parse_wpctl(&out)?
            }
            Self::Pactl => {
                let out = run("pactl", &["get-sink-volume", "@DEFAULT_SINK@"]).await?;
                let muted = run("pactl", &["get-sink-mute", "@DEFAULT_SINK@"])
                    .await
                    .map(|out| parse_pactl_mute(&out))
                    .unwrap_or(false);
                (parse_pactl(&out)?, muted)
            }
        };
        Ok(VolumeState {
            backend: self.name(),
            volume,
            muted,
        })
    }

    async fn set(self, req: VolumeRequest) -> Result<VolumeState> {
        let mut state = self.get().await?;

        if let Some(mute) = req.mute {
            let flag = if mute { "1" } else { "0" };
            match self {
                Self::Wpctl => run("wpctl", &["set-mute", "@DEFAULT_AUDIO_SINK@", flag]).await?,
                Self::Pactl => run("pactl", &["set-sink-mute", "@DEFAULT_SINK@", flag]).await?,
            };
            state.muted = mute;
        }

        if let Some(volume) = req.target(state.volume) {
            match self {
                Self::Wpctl => {
                    let value = format!("{volume:.3}");
                    run(
                        "wpctl",
                        &["set-volume", "--limit", "1.5", "@DEFAULT_AUDIO_SINK@", &value],
                    )
                    .await?
                }
                Self::Pactl => {
                    let percent = pactl_percent(volume);
                    run("pactl", &["set-sink-volume", "@DEFAULT_SINK@", &percent]).await?
                }
            };
            state.volume = volume;
        }

        Ok(state)
    }
}

pub async fn get() -> Result<VolumeState> {
    match Backend::Wpctl.get().await {
        Ok(state) => Ok(state),
        Err(err) => {
            debug!(%err, "wpctl unavailable, trying pactl");
            Backend::Pactl.get().await.context("get volume")
        }
    }
}

pub async fn set(req: VolumeRequest) -> Result<VolumeState> {
    if req.is_empty() {
        bail!("provide absolute, delta, or mute");
    }
    match Backend::Wpctl.set(req).await {
        Ok(state) => Ok(state),
        Err(err) => {
            debug!(%err, "wpctl unavailable, trying pactl");
            Backend::Pactl.set(req).await.context("set volume")
        }
    }
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let out = timeout(COMMAND_TIMEOUT, child)
        .await
        .map_err(|_| anyhow!("{program} timed out"))?
        .with_context(|| format!("spawn {program}"))?;
    if !out.status.success() {
        bail!(
            "{program} {args:?}: {} ({})",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// `Volume: 0.38 [MUTED]`
fn parse_wpctl(out: &str) -> Result<(f64, bool)> {
    let re = Regex::new(r"Volume:\s*([0-9]+(?:\.[0-9]+)?)")?;
    let caps = re
        .captures(out)
        .ok_or_else(|| anyhow!("unexpected wpctl output: {out:?}"))?;
    let volume: f64 = caps[1].parse().context("parse wpctl volume")?;
    Ok((volume, out.to_ascii_uppercase().contains("MUTED")))
}

/// `Volume: front-left: 65536 / 100% / 0.00 dB, ...`; the first channel wins.
fn pactl_percent(volume: f64) -> String {
    format!("{:.0}%", volume * 100.0)
}

fn parse_pactl(out: &str) -> Result<f64> {
    let re = Regex::new(r"/\s*([0-9]+)%")?;
    let caps = re
        .captures(out)
        .ok_or_else(|| anyhow!("unexpected pactl output: {out:?}"))?;
    let percent: u32 = caps[1].parse().context("parse pactl percent")?;
    Ok(f64::from(percent) / 100.0)
}

fn parse_pactl_mute(out: &str) -> bool {
    out.to_ascii_lowercase().contains("yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wpctl_output_parses() {
        assert_eq!(parse_wpctl("Volume: 0.38 [MUTED]").expect("parse"), (0.38, true));
        assert_eq!(parse_wpctl("Volume: 1.04").expect("parse"), (1.04, false));
        assert!(parse_wpctl("Volume:").is_err());
    }

    #[test]
    fn pactl_percent_rounds_to_whole_steps() {
        assert_eq!(pactl_percent(0.0), "0%");
        assert_eq!(pactl_percent(0.456), "46%");
        assert_eq!(pactl_percent(1.5), "150%");
    }

    #[test]
    fn pactl_output_parses_first_channel() {
        let out = "Volume: front-left: 42598 /  65% / -11.23 dB,   front-right: 45875 /  70% / -9.30 dB\n        balance 0.00";
        assert!((parse_pactl(out).expect("parse") - 0.65).abs() < f64::EPSILON);
        assert!(parse_pactl("no channels").is_err());
        assert!(parse_pactl_mute("Mute: yes"));
        assert!(!parse_pactl_mute("Mute: no"));
    }

    #[test]
    fn target_clamps_and_prefers_absolute() {
        let req = VolumeRequest {
            absolute: Some(0.5),
            delta: Some(0.2),
            mute: None,
        };
        assert_eq!(req.target(0.9), Some(0.5));

        let up = VolumeRequest {
            delta: Some(0.5),
            ..VolumeRequest::default()
        };
        assert_eq!(up.target(1.3), Some(MAX_VOLUME));

        let down = VolumeRequest {
            delta: Some(-1.0),
            ..VolumeRequest::default()
        };
        assert_eq!(down.target(0.3), Some(0.0));

        let mute_only = VolumeRequest {
            mute: Some(true),
            ..VolumeRequest::default()
        };
        assert_eq!(mute_only.target(0.3), None);
        assert!(!mute_only.is_empty());
        assert!(VolumeRequest::default().is_empty());
    }

    #[tokio::test]
    async fn empty_request_is_rejected_before_running_anything() {
        assert!(set(VolumeRequest::default()).await.is_err());
    }
}
