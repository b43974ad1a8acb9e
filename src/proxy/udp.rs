//! UDP listener with transparent source
//!
//! Replies must leave with the source address the client originally sent
//! to, so the listener reads the destination of every datagram from a
//! per-packet control message (`IP_PKTINFO` / `IPV6_RECVPKTINFO`) and
//! writes the reply with a matching source-selection control message. On a
//! dual-stack socket the client family decides which control-message
//! namespace the reply uses, with v4-mapped addresses unmapped as needed.
//!
//! The receive loop runs on a blocking thread with a one-second read
//! timeout, checking the cancellation token between reads; each datagram is
//! processed as its own task on the runtime.

use std::io::{IoSlice, IoSliceMut};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::socket::{
    recvmsg, sendmsg, sockopt, setsockopt, ControlMessage, ControlMessageOwned, MsgFlags,
    SockaddrIn, SockaddrIn6, SockaddrStorage,
};
use socket2::{Domain, Socket, Type};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{DnsMitmProxy, DnsProxyError, Transport, MAX_DNS_MESSAGE_SIZE};

/// Poll interval of the receive loop; bounds how long cancellation can go
/// unobserved.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiving side of the proxy's UDP transport.
pub struct ProxyUdpListener {
    socket: Arc<Socket>,
}

impl ProxyUdpListener {
    /// Bind the socket and enable per-packet destination reporting.
    ///
    /// # Errors
    ///
    /// Returns [`DnsProxyError::Bind`] when socket setup fails.
    pub fn bind(addr: SocketAddr) -> Result<Self, DnsProxyError> {
        let bind = |err: String| DnsProxyError::Bind {
            addr: addr.to_string(),
            reason: err,
        };

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(|e| bind(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| bind(e.to_string()))?;

        if addr.is_ipv6() {
            socket.set_only_v6(false).map_err(|e| bind(e.to_string()))?;
            setsockopt(&socket, sockopt::Ipv6RecvPacketInfo, &true)
                .map_err(|e| bind(format!("IPV6_RECVPKTINFO: {e}")))?;
        }
        // IP_PKTINFO also covers v4-mapped traffic on a dual-stack socket.
        if let Err(err) = setsockopt(&socket, sockopt::Ipv4PacketInfo, &true) {
            if addr.is_ipv4() {
                return Err(bind(format!("IP_PKTINFO: {err}")));
            }
        }

        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| bind(e.to_string()))?;
        socket.bind(&addr.into()).map_err(|e| bind(e.to_string()))?;

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| std::io::Error::other("socket address is not inet"))
    }

    /// Receive datagrams until the token fires.
    pub async fn run(
        self,
        proxy: Arc<DnsMitmProxy>,
        token: CancellationToken,
    ) -> Result<(), DnsProxyError> {
        let handle = Handle::current();
        let socket = self.socket;
        tokio::task::spawn_blocking(move || recv_loop(&socket, &proxy, &token, &handle))
            .await
            .map_err(|e| DnsProxyError::upstream(format!("UDP listener task: {e}")))?
    }
}

fn recv_loop(
    socket: &Arc<Socket>,
    proxy: &Arc<DnsMitmProxy>,
    token: &CancellationToken,
    handle: &Handle,
) -> Result<(), DnsProxyError> {
    let fd = socket.as_raw_fd();
    let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];
    let mut cmsg_space = nix::cmsg_space!(libc::in6_pktinfo, libc::in_pktinfo);

    while !token.is_cancelled() {
        let (bytes, client, dst) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = match recvmsg::<SockaddrStorage>(
                fd,
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            ) {
                Ok(msg) => msg,
                Err(Errno::EAGAIN | Errno::EINTR) => continue,
                Err(err) => {
                    error!(%err, "UDP recvmsg error");
                    continue;
                }
            };

            let dst = msg.cmsgs().ok().and_then(|cmsgs| {
                cmsgs.into_iter().find_map(|cmsg| match cmsg {
                    ControlMessageOwned::Ipv6PacketInfo(info) => Some(std::net::IpAddr::V6(
                        std::net::Ipv6Addr::from(info.ipi6_addr.s6_addr),
                    )),
                    ControlMessageOwned::Ipv4PacketInfo(info) => Some(std::net::IpAddr::V4(
                        std::net::Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes()),
                    )),
                    _ => None,
                })
            });
            let client = msg.address.as_ref().and_then(storage_to_std);
            (msg.bytes, client, dst)
        };

        let Some(client) = client else {
            error!("UDP client address is not an inet address");
            continue;
        };
        let Some(dst) = dst else {
            error!("no destination address in control message");
            continue;
        };

        let data = buf[..bytes].to_vec();
        let proxy = proxy.clone();
        let socket = socket.clone();
        handle.spawn(async move {
            handle_packet(proxy, socket, data, client, dst).await;
        });
    }

    debug!("UDP listener stopping");
    Ok(())
}

async fn handle_packet(
    proxy: Arc<DnsMitmProxy>,
    socket: Arc<Socket>,
    data: Vec<u8>,
    client: SocketAddr,
    dst: std::net::IpAddr,
) {
    let resp = match proxy.process_request(client, &data, Transport::Udp).await {
        Ok(resp) => resp,
        Err(DnsProxyError::Timeout) => {
            warn!(%client, "request deadline exceeded");
            return;
        }
        Err(err) => {
            error!(%client, %err, "failed to process request");
            return;
        }
    };

    if let Err(err) = send_reply(&socket, &resp, client, dst) {
        error!(%client, %err, "failed to send response");
    }
}

fn storage_to_std(addr: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(sin6) = addr.as_sockaddr_in6() {
        return Some(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )));
    }
    if let Some(sin) = addr.as_sockaddr_in() {
        return Some(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())));
    }
    None
}

/// Send `payload` to `client` with `dst` as the packet's source address.
fn send_reply(
    socket: &Socket,
    payload: &[u8],
    client: SocketAddr,
    dst: std::net::IpAddr,
) -> nix::Result<()> {
    let fd = socket.as_raw_fd();
    let iov = [IoSlice::new(payload)];

    let client_is_v4 = match client {
        SocketAddr::V4(_) => true,
        SocketAddr::V6(sa) => sa.ip().to_ipv4_mapped().is_some(),
    };

    if client_is_v4 {
        let src = match dst {
            std::net::IpAddr::V4(v4) => v4,
            std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped().ok_or(Errno::EADDRNOTAVAIL)?,
        };
        let pktinfo = libc::in_pktinfo {
            ipi_ifindex: 0,
            ipi_spec_dst: libc::in_addr {
                s_addr: u32::from_ne_bytes(src.octets()),
            },
            ipi_addr: libc::in_addr { s_addr: 0 },
        };
        let cmsgs = [ControlMessage::Ipv4PacketInfo(&pktinfo)];
        match client {
            SocketAddr::V4(sa) => {
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&SockaddrIn::from(sa)))?;
            }
            SocketAddr::V6(sa) => {
                sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&SockaddrIn6::from(sa)))?;
            }
        }
    } else {
        let src = match dst {
            std::net::IpAddr::V6(v6) => v6,
            std::net::IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        };
        let pktinfo = libc::in6_pktinfo {
            ipi6_ifindex: 0,
            ipi6_addr: libc::in6_addr {
                s6_addr: src.octets(),
            },
        };
        let cmsgs = [ControlMessage::Ipv6PacketInfo(&pktinfo)];
        let SocketAddr::V6(sa) = client else {
            return Err(Errno::EAFNOSUPPORT);
        };
        sendmsg(fd, &iov, &cmsgs, MsgFlags::empty(), Some(&SockaddrIn6::from(sa)))?;
    }

    Ok(())
}
