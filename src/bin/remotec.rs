use std::env;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Method};
use serde_json::{json, Value};

const DEFAULT_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, PartialEq)]
enum Cmd {
    Players,
    Status,
    PlayPause,
    Next,
    Previous,
    Seek(i64),
    SetPosition(i64),
    VolumeGet,
    VolumeSet(Value),
}

impl Cmd {
    fn request(&self) -> (Method, &'static str, Option<Value>) {
        match self {
            Self::Players => (Method::GET, "/players", None),
            Self::Status => (Method::GET, "/player/status", None),
            Self::PlayPause => (Method::POST, "/player/playpause", None),
            Self::Next => (Method::POST, "/player/next", None),
            Self::Previous => (Method::POST, "/player/prev", None),
            Self::Seek(delta) => (Method::POST, "/player/seek", Some(json!({ "delta_ms": delta }))),
            Self::SetPosition(target) => (
                Method::POST,
                "/player/seek",
                Some(json!({ "target_ms": target })),
            ),
            Self::VolumeGet => (Method::GET, "/volume", None),
            Self::VolumeSet(body) => (Method::POST, "/volume", Some(body.clone())),
        }
    }
}

fn usage() {
    eprintln!(
        "{}",
        r#"Usage:
  remotec players
  remotec status [--player <name>]
  remotec play-pause [--player <name>]
  remotec next [--player <name>]
  remotec previous [--player <name>]
  remotec seek <offset-ms> [--player <name>]
  remotec set-position <ms> [--player <name>]
  remotec volume [get | set <factor> | delta <factor> | mute | unmute]

Environment:
  REMOTED_URL    daemon address (default http://127.0.0.1:8080)
  REMOTED_TOKEN  shared secret, sent as a bearer token
"#
    );
}

/// Pulls `--player <name>` out of `args`, wherever it appears.
fn take_player(args: &mut Vec<String>) -> Option<String> {
    let mut player = None;
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--player" && i + 1 < args.len() {
            player = Some(args.remove(i + 1));
            args.remove(i);
        } else {
            i += 1;
        }
    }
    player
}

fn parse_cmd(mut args: Vec<String>) -> Result<Cmd> {
    if args.is_empty() {
        bail!("missing command");
    }
    let cmd = args.remove(0);
    let arg = |n: usize| -> Result<&str> {
        args.get(n)
            .map(String::as_str)
            .with_context(|| format!("{cmd}: missing argument"))
    };
    let cmd = match cmd.as_str() {
        "players" => Cmd::Players,
        "status" => Cmd::Status,
        "play-pause" => Cmd::PlayPause,
        "next" => Cmd::Next,
        "previous" => Cmd::Previous,
        "seek" => Cmd::Seek(arg(0)?.parse().context("seek: offset must be integer ms")?),
        "set-position" => Cmd::SetPosition(
            arg(0)?
                .parse()
                .context("set-position: position must be integer ms")?,
        ),
        "volume" => match args.first().map(String::as_str).unwrap_or("get") {
            "get" => Cmd::VolumeGet,
            "set" => Cmd::VolumeSet(json!({ "absolute": parse_factor(arg(1)?)? })),
            "delta" => Cmd::VolumeSet(json!({ "delta": parse_factor(arg(1)?)? })),
            "mute" => Cmd::VolumeSet(json!({ "mute": true })),
            "unmute" => Cmd::VolumeSet(json!({ "mute": false })),
            other => bail!("volume: unknown action {other:?}"),
        },
        other => bail!("unknown command {other:?}"),
    };
    Ok(cmd)
}

fn parse_factor(s: &str) -> Result<f64> {
    s.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .with_context(|| format!("invalid volume {s:?}"))
}

/// `artist - title [state]`, dropping the separator when a side is empty.
fn format_label(player: &Value) -> String {
    let text = |key: &str| player.get(key).and_then(Value::as_str).unwrap_or("");
    let (artist, title) = (text("artist"), text("title"));
    let sep = if !artist.is_empty() && !title.is_empty() { " - " } else { "" };
    let mut out = format!("{artist}{sep}{title}");
    let state = text("playback_status");
    if !state.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&format!("[{state}]"));
    }
    out
}

fn print_players(players: &Value) {
    for player in players.as_array().into_iter().flatten() {
        let active = player.get("is_active").and_then(Value::as_bool) == Some(true);
        let name = player.get("identity").and_then(Value::as_str).unwrap_or("?");
        let bus = player.get("bus_name").and_then(Value::as_str).unwrap_or("");
        println!(
            "{} {name} ({bus}) {}",
            if active { "*" } else { " " },
            format_label(player)
        );
    }
}

async fn run(cmd: Cmd, player: Option<String>) -> Result<()> {
    let base = env::var("REMOTED_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let token = env::var("REMOTED_TOKEN").ok().filter(|t| !t.is_empty());
    let (method, path, body) = cmd.request();

    let client = Client::new();
    let mut req = client.request(method, format!("{}{path}", base.trim_end_matches('/')));
    if let Some(player) = &player {
        req = req.query(&[("player", player)]);
    }
    if let Some(token) = &token {
        req = req.bearer_auth(token);
    }
    if let Some(body) = &body {
        req = req.json(body);
    }

    let resp = req.send().await.with_context(|| format!("connect {base}"))?;
    let status = resp.status();
    let text = resp.text().await.context("read response")?;
    if !status.is_success() {
        bail!("{status}: {}", text.trim());
    }

    let value: Value = serde_json::from_str(&text).context("decode response")?;
    match cmd {
        Cmd::Players => print_players(&value),
        Cmd::Status => println!("{}", format_label(&value)),
        _ => println!("{value}"),
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut args: Vec<String> = env::args().skip(1).collect();
    let player = take_player(&mut args);
    let cmd = match parse_cmd(args) {
        Ok(cmd) => cmd,
        Err(err) => {
            eprintln!("remotec: {err:#}");
            usage();
            std::process::exit(2);
        }
    };
    if let Err(err) = run(cmd, player).await {
        eprintln!("remotec: {err:#}");
        std::process::exit(1);
    }
}
