//! Transport-agnostic helpers for whatever serves the coordinator over HTTP.
//!
//! Nothing here touches the store; it only interprets request metadata and
//! coordinator answers.

use std::net::IpAddr;

use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    lease::{
        coordinator::{ContainerLockStatus, ContainerStatus},
        ContainerId, LeaseKey,
    },
    registry::ContainerState,
};

/// Picks the client address the way a reverse proxy reports it: the first
/// hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer. Values
/// that are not IP addresses are skipped.
pub fn client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<IpAddr>,
) -> Option<IpAddr> {
    if let Some(chain) = forwarded_for {
        if let Some(ip) = chain.split(',').next().and_then(parse_ip) {
            debug!(%ip, chain, "client ip from X-Forwarded-For");
            return Some(ip);
        }
    }
    if let Some(ip) = real_ip.and_then(parse_ip) {
        debug!(%ip, "client ip from X-Real-IP");
        return Some(ip);
    }
    if peer.is_none() {
        warn!(?forwarded_for, ?real_ip, "unable to determine client ip");
    }
    peer
}

/// [`client_ip`] as a lease key.
pub fn lease_key(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<IpAddr>,
) -> Option<LeaseKey> {
    client_ip(forwarded_for, real_ip, peer).map(|ip| LeaseKey::new(ip.to_string()))
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.trim().parse().ok()
}

/// What a container's button should offer to a particular viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ButtonState {
    Connect,
    InUse { by: LeaseKey },
    /// The viewer already holds another container.
    Elsewhere { holding: ContainerId },
    Stopped,
    Loading,
}

impl ButtonState {
    /// Decides the button for `viewer`. `viewer_holds` is the container the
    /// viewer currently leases, if any: one active container per client wins
    /// over any individual container's availability.
    pub fn for_viewer(
        status: &ContainerStatus,
        viewer: Option<&LeaseKey>,
        viewer_holds: Option<&ContainerId>,
    ) -> Self {
        Self::decide(
            &status.id,
            Some(&status.state),
            status.locked_by.as_ref(),
            viewer,
            viewer_holds,
        )
    }

    pub fn for_lock_status(
        status: &ContainerLockStatus,
        viewer: Option<&LeaseKey>,
        viewer_holds: Option<&ContainerId>,
    ) -> Self {
        Self::decide(
            &status.id,
            status.state.as_ref(),
            status.locked_by.as_ref(),
            viewer,
            viewer_holds,
        )
    }

    fn decide(
        id: &ContainerId,
        state: Option<&ContainerState>,
        locked_by: Option<&LeaseKey>,
        viewer: Option<&LeaseKey>,
        viewer_holds: Option<&ContainerId>,
    ) -> Self {
        if let Some(holder) = locked_by {
            return if viewer == Some(holder) && state == Some(&ContainerState::Running) {
                ButtonState::Connect
            } else if viewer == Some(holder) {
                ButtonState::Loading
            } else {
                ButtonState::InUse { by: holder.clone() }
            };
        }
        if let Some(holding) = viewer_holds {
            if holding != id {
                return ButtonState::Elsewhere {
                    holding: holding.clone(),
                };
            }
        }
        match state {
            Some(ContainerState::Running) => ButtonState::Connect,
            Some(ContainerState::Exited) => ButtonState::Stopped,
            _ => ButtonState::Loading,
        }
    }

    pub fn is_clickable(&self) -> bool {
        matches!(self, ButtonState::Connect)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn status(id: &str, state: ContainerState, locked_by: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            id: ContainerId::from(id),
            name: id.to_string(),
            state,
            locked_by: locked_by.map(LeaseKey::from),
        }
    }

    #[test]
    fn forwarded_for_wins() {
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let ip = client_ip(Some(" 203.0.113.9, 10.0.0.2"), Some("198.51.100.1"), peer);
        assert_eq!(ip, "203.0.113.9".parse().ok());
    }

    #[test]
    fn invalid_headers_fall_through() {
        let peer = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(
            client_ip(Some("garbage"), Some("198.51.100.1"), peer),
            "198.51.100.1".parse().ok()
        );
        assert_eq!(client_ip(Some(""), Some("nope"), peer), peer);
        assert_eq!(client_ip(None, None, None), None);
    }

    #[test]
    fn lease_key_accepts_ipv6() {
        let key = lease_key(Some("2001:db8::1"), None, None).unwrap();
        assert_eq!(key.as_str(), "2001:db8::1");
    }

    #[test]
    fn free_running_container_is_clickable() {
        let viewer = LeaseKey::from("1.1.1.1");
        let button = ButtonState::for_viewer(
            &status("c1", ContainerState::Running, None),
            Some(&viewer),
            None,
        );
        assert!(button.is_clickable());
    }

    #[test]
    fn locked_container_is_only_clickable_for_its_holder() {
        let row = status("c1", ContainerState::Running, Some("1.1.1.1"));
        let holder = LeaseKey::from("1.1.1.1");
        let other = LeaseKey::from("2.2.2.2");

        assert!(ButtonState::for_viewer(&row, Some(&holder), Some(&row.id)).is_clickable());
        assert_eq!(
            ButtonState::for_viewer(&row, Some(&other), None),
            ButtonState::InUse { by: holder }
        );
    }

    #[test]
    fn viewer_with_a_container_cannot_pick_another() {
        let viewer = LeaseKey::from("1.1.1.1");
        let mine = ContainerId::from("c1");
        let button = ButtonState::for_viewer(
            &status("c2", ContainerState::Running, None),
            Some(&viewer),
            Some(&mine),
        );
        assert_eq!(button, ButtonState::Elsewhere { holding: mine });
        assert!(!button.is_clickable());
    }

    #[test]
    fn stopped_and_unknown_containers() {
        assert_eq!(
            ButtonState::for_viewer(&status("c1", ContainerState::Exited, None), None, None),
            ButtonState::Stopped
        );
        let missing = ContainerLockStatus {
            id: ContainerId::from("gone"),
            name: None,
            state: None,
            locked_by: None,
        };
        assert_eq!(
            ButtonState::for_lock_status(&missing, None, None),
            ButtonState::Loading
        );
    }
}
