//! Socket construction: resolve, bind, and configure multicast/broadcast.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Grounded on the teacher's `bind_and_send` (resolve via
//! `tokio::net::lookup_host`, bind a fresh `UdpSocket`, fall through
//! candidate addresses on error) — extended with the multicast/broadcast
//! setup spec §4.13/§9 requires. `tokio::net::UdpSocket` has no API for
//! `IP_MULTICAST_IF`/`SO_BROADCAST` before bind, so the socket is built with
//! `socket2` and handed to `tokio` via `UdpSocket::from_std`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;

use crate::error::{Error, Result};

/// Resolve `target` (host, port) to its first IPv4 address. Multicast setup
/// below is IPv4-only, matching the `IP_MULTICAST_IF`/`IP_ADD_MEMBERSHIP`
/// pair named in spec §9; dual-stack clusters are out of scope.
async fn resolve_v4(target: (&str, u16)) -> Result<SocketAddrV4> {
    let mut addrs = lookup_host(target).await.map_err(Error::Config)?;
    addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            Error::Config(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{}:{} did not resolve to an IPv4 address", target.0, target.1),
            ))
        })
}

/// A bound, role-configured cluster socket plus the two addresses it talks
/// to: the resolved master unicast address and the resolved slave group
/// address (possibly multicast, possibly the limited broadcast address).
pub struct ClusterSocket {
    /// The underlying datagram socket, already bound and (for multicast
    /// groups) already joined/interfaced.
    pub socket: UdpSocket,
    /// Resolved master unicast address.
    pub master_addr: SocketAddrV4,
    /// Resolved slave group address, or the limited broadcast address if
    /// `slave_group` was not in the multicast range.
    pub slave_group_addr: SocketAddrV4,
    /// Whether `slave_group_addr` is a true multicast address (as opposed
    /// to broadcast).
    pub is_multicast: bool,
}

impl ClusterSocket {
    /// Resolve `master_host`/`slave_group`, bind a UDP socket on `bind_port`
    /// (the master's own port on the master; an ephemeral port on a slave),
    /// and configure multicast or broadcast per §9's one-shot-at-construction
    /// rule.
    ///
    /// `is_master` selects `set_multicast_if_v4` (master) vs.
    /// `join_multicast_v4` (slave) when the group is a real multicast
    /// address.
    pub async fn new(
        master_host: &str,
        master_port: u16,
        slave_group: &str,
        slave_port: u16,
        is_master: bool,
    ) -> Result<Self> {
        let master_addr = resolve_v4((master_host, master_port)).await?;
        let slave_group_resolved = resolve_v4((slave_group, slave_port)).await?;
        let is_multicast = slave_group_resolved.ip().is_multicast();

        // A slave must bind the same port the master sends the group's
        // traffic to in order to receive it once it has joined the group;
        // an ephemeral port would only work for the unicast reply path.
        let bind_port = if is_master { master_port } else { slave_port };
        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bind_port);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(Error::Config)?;
        socket.set_reuse_address(true).map_err(Error::Config)?;
        socket.set_nonblocking(true).map_err(Error::Config)?;
        socket.bind(&bind_addr.into()).map_err(Error::Config)?;

        if is_multicast {
            if is_master {
                socket
                    .set_multicast_if_v4(master_addr.ip())
                    .map_err(Error::Config)?;
                debug!(interface = %master_addr.ip(), "set outgoing multicast interface");
            } else {
                socket
                    .join_multicast_v4(slave_group_resolved.ip(), &Ipv4Addr::UNSPECIFIED)
                    .map_err(Error::Config)?;
                debug!(group = %slave_group_resolved.ip(), "joined multicast group");
            }
        } else {
            socket.set_broadcast(true).map_err(Error::Config)?;
            debug!("slave group is not multicast; enabled SO_BROADCAST");
        }

        let socket = UdpSocket::from_std(socket.into()).map_err(Error::Config)?;
        let slave_group_addr = if is_multicast {
            slave_group_resolved
        } else {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, slave_port)
        };

        Ok(Self {
            socket,
            master_addr,
            slave_group_addr,
            is_multicast,
        })
    }
}

/// Local helper so call sites can build a [`SocketAddr`] from either
/// resolved address without repeating the `V4` wrapping.
#[must_use]
pub fn as_socket_addr(addr: SocketAddrV4) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(*addr.ip()), addr.port())
}
