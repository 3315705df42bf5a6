//! Multicast endpoint: join/leave the group, raw datagram socket shared by the
//! receive loop and the send path.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::Config;

/// Group membership plus the socket bound to the group port.
pub struct MulticastEndpoint {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    interface: u32,
}

impl MulticastEndpoint {
    /// Bind the group port and join the group. Any failure here is fatal for the node.
    pub fn join(cfg: &Config) -> io::Result<Self> {
        let socket = match cfg.group {
            IpAddr::V4(g) => join_v4(g, cfg)?,
            IpAddr::V6(g) => join_v6(g, cfg)?,
        };
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let group = match cfg.group {
            IpAddr::V4(g) => SocketAddr::new(IpAddr::V4(g), cfg.port),
            IpAddr::V6(g) => SocketAddr::V6(SocketAddrV6::new(g, cfg.port, 0, cfg.interface)),
        };
        Ok(Self {
            socket: Arc::new(socket),
            group,
            interface: cfg.interface,
        })
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Destination for everything we send.
    pub fn group(&self) -> SocketAddr {
        self.group
    }

    pub fn leave(&self) -> io::Result<()> {
        match self.group.ip() {
            IpAddr::V4(g) => self.socket.leave_multicast_v4(g, Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(g) => self.socket.leave_multicast_v6(&g, self.interface),
        }
    }
}

fn reusable(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    // Several nodes on one host share the group port.
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    Ok(socket)
}

fn join_v4(group: Ipv4Addr, cfg: &Config) -> io::Result<Socket> {
    let socket = reusable(Domain::IPV4)?;
    socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), cfg.port).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(cfg.ttl)?;
    socket.set_multicast_loop_v4(!cfg.suppress_loopback)?;
    Ok(socket)
}

fn join_v6(group: Ipv6Addr, cfg: &Config) -> io::Result<Socket> {
    let socket = reusable(Domain::IPV6)?;
    socket.set_only_v6(true)?;
    socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), cfg.port).into())?;
    socket.join_multicast_v6(&group, cfg.interface)?;
    if cfg.interface != 0 {
        socket.set_multicast_if_v6(cfg.interface)?;
    }
    socket.set_multicast_hops_v6(cfg.ttl)?;
    socket.set_multicast_loop_v6(!cfg.suppress_loopback)?;
    Ok(socket)
}
