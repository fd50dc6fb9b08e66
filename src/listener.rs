//! Bus signal subscription feeding the hub's trigger.
//!
//! Property changes on the MPRIS object path and ownership changes of names
//! in the MPRIS namespace both fire the trigger. A message whose header or
//! body does not decode fires it as well.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::fdo::DBusProxy;
use zbus::zvariant::OwnedValue;
use zbus::{Connection, Message, MessageStream, MessageType};

use crate::bus::{MPRIS_PATH, MPRIS_PLAYER, MPRIS_PREFIX, MPRIS_ROOT};
use crate::error::Result;
use crate::hub::Trigger;

const DBUS_IFACE: &str = "org.freedesktop.DBus";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

const MATCH_RULES: [&str; 3] = [
    "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged',arg0namespace='org.mpris.MediaPlayer2'",
    "type='signal',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged',path='/org/mpris/MediaPlayer2',arg0='org.mpris.MediaPlayer2.Player'",
    "type='signal',interface='org.freedesktop.DBus.Properties',member='PropertiesChanged',path='/org/mpris/MediaPlayer2',arg0='org.mpris.MediaPlayer2'",
];

const MAX_BACKOFF: u64 = 30;

/// What a signal header says about the player set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    NameOwnerChanged,
    PropertiesChanged,
    Other,
}

impl SignalKind {
    #[must_use]
    pub fn classify(interface: Option<&str>, member: Option<&str>, path: Option<&str>) -> Self {
        match (interface, member) {
            (Some(DBUS_IFACE), Some("NameOwnerChanged")) => Self::NameOwnerChanged,
            (Some(PROPERTIES_IFACE), Some("PropertiesChanged")) if path == Some(MPRIS_PATH) => {
                Self::PropertiesChanged
            }
            _ => Self::Other,
        }
    }
}

/// Body check for a classified signal; `None` means the body did not decode.
#[must_use]
pub fn body_is_relevant(kind: SignalKind, first_arg: Option<&str>) -> bool {
    match (kind, first_arg) {
        (SignalKind::Other, _) => false,
        (_, None) => true,
        (SignalKind::NameOwnerChanged, Some(name)) => name.starts_with(MPRIS_PREFIX),
        (SignalKind::PropertiesChanged, Some(iface)) => iface == MPRIS_PLAYER || iface == MPRIS_ROOT,
    }
}

/// Spawns the listener on its own session connection. It reconnects with
/// backoff until `cancel` fires.
pub fn spawn(trigger: Trigger, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { run(trigger, cancel).await })
}

pub async fn run(trigger: Trigger, cancel: CancellationToken) {
    let mut backoff: u64 = 1;

    loop {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = listen(&trigger) => outcome,
        };

        let delay = match outcome {
            Ok(()) => {
                backoff = 1;
                Duration::from_millis(500)
            }
            Err(err) => {
                let delay = Duration::from_millis(backoff.min(MAX_BACKOFF) * 200);
                warn!(%err, ?delay, "signal listener lost the bus, reconnecting");
                backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                delay
            }
        };

        tokio::select! {
            () = cancel.cancelled() => return,
            () = sleep(delay) => {}
        }
    }
}

async fn listen(trigger: &Trigger) -> Result<()> {
    let conn = Connection::session().await?;
    let dbus = DBusProxy::new(&conn).await?;
    for rule in MATCH_RULES {
        dbus.add_match(rule).await.map_err(zbus::Error::from)?;
    }
    let mut stream = MessageStream::from(&conn);
    info!("subscribed to player signals");

    // Players may have come and gone while we were disconnected.
    trigger.fire();

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(msg) => {
                if is_player_signal(&msg) {
                    trigger.fire();
                }
            }
            Err(err) => {
                debug!(%err, "undecodable bus message");
                trigger.fire();
            }
        }
    }
    Ok(())
}

fn is_player_signal(msg: &Message) -> bool {
    let Ok(hdr) = msg.header() else {
        return true;
    };
    if !matches!(hdr.message_type(), Ok(MessageType::Signal)) {
        return false;
    }
    let interface = hdr.interface().ok().flatten().map(|i| i.as_str().to_string());
    let member = hdr.member().ok().flatten().map(|m| m.as_str().to_string());
    let path = hdr.path().ok().flatten().map(|p| p.as_str().to_string());

    let kind = SignalKind::classify(interface.as_deref(), member.as_deref(), path.as_deref());
    let first_arg = match kind {
        SignalKind::NameOwnerChanged => msg
            .body::<(String, String, String)>()
            .ok()
            .map(|(name, _, _)| name),
        SignalKind::PropertiesChanged => msg
            .body::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
            .ok()
            .map(|(iface, _, _)| iface),
        SignalKind::Other => return false,
    };
    body_is_relevant(kind, first_arg.as_deref())
}
