//! Link event monitoring
//!
//! Subscribes to link state changes by reading `ip monitor link` output
//! line by line. Events for interfaces that groups are bound to trigger the
//! route re-installation hook.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// A link appeared, changed state, or went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Interface name
    pub name: String,
    /// Whether the link is up after the event
    pub up: bool,
}

/// Parse one `ip monitor link` line into an event.
///
/// Lines look like `3: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 ...`,
/// with deletions prefixed by `Deleted`.
#[must_use]
pub fn parse_link_event(line: &str) -> Option<LinkEvent> {
    let line = line.trim_start();
    let (deleted, rest) = match line.strip_prefix("Deleted ") {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let mut parts = rest.splitn(3, ':');
    parts.next()?.trim().parse::<u32>().ok()?;
    let name = parts.next()?.trim();
    // veth-style names carry a peer suffix: "veth0@if5"
    let name = name.split('@').next()?.to_string();
    if name.is_empty() {
        return None;
    }

    let flags = parts.next()?;
    let flags = flags.split('<').nth(1)?.split('>').next()?;
    let up = !deleted
        && flags.split(',').any(|f| f == "UP")
        && flags.split(',').any(|f| f == "LOWER_UP");

    Some(LinkEvent { name, up })
}

/// Spawn the monitor subprocess and stream its events until the token
/// fires. The channel closes when the monitor exits.
pub fn spawn_link_monitor(
    token: CancellationToken,
) -> std::io::Result<mpsc::Receiver<LinkEvent>> {
    let (tx, rx) = mpsc::channel(16);

    let mut child = tokio::process::Command::new("ip")
        .args(["monitor", "link"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("link monitor stdout not captured"))?;

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!("link monitor stopping");
                    let _ = child.kill().await;
                    break;
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_link_event(&line) {
                            debug!(iface = %event.name, up = event.up, "link event");
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {
                        error!("link monitor stream ended");
                        break;
                    }
                    Err(err) => {
                        error!(%err, "link monitor read error");
                        break;
                    }
                }
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_up_event() {
        let event = parse_link_event(
            "3: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN",
        )
        .unwrap();
        assert_eq!(event.name, "wg0");
        assert!(event.up);
    }

    #[test]
    fn test_parse_down_event() {
        let event = parse_link_event(
            "2: eth1: <NO-CARRIER,BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq state DOWN",
        )
        .unwrap();
        assert_eq!(event.name, "eth1");
        assert!(!event.up, "LOWER_UP missing means no carrier");
    }

    #[test]
    fn test_parse_deleted_event() {
        let event = parse_link_event(
            "Deleted 7: wg1: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue",
        )
        .unwrap();
        assert_eq!(event.name, "wg1");
        assert!(!event.up);
    }

    #[test]
    fn test_parse_veth_peer_suffix() {
        let event = parse_link_event(
            "11: veth-wan@if10: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue",
        )
        .unwrap();
        assert_eq!(event.name, "veth-wan");
        assert!(event.up);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_link_event("").is_none());
        assert!(parse_link_event("not a link line").is_none());
        assert!(parse_link_event("3: wg0 no flags here").is_none());
    }
}
