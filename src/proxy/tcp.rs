//! TCP listener
//!
//! DNS over TCP per RFC 1035 §4.2.2: each message is prefixed with a
//! two-byte big-endian length. A connection may carry multiple requests;
//! any I/O failure or deadline closes only that connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ErrorKind};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{DnsMitmProxy, DnsProxyError, Transport, MAX_DNS_MESSAGE_SIZE};

/// Accepting side of the proxy's TCP transport.
pub struct ProxyTcpListener {
    listener: std::net::TcpListener,
}

impl ProxyTcpListener {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns [`DnsProxyError::Bind`] on bind failure.
    pub async fn bind(addr: SocketAddr) -> Result<Self, DnsProxyError> {
        let listener = std::net::TcpListener::bind(addr).map_err(|e| DnsProxyError::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        listener
            .set_nonblocking(true)
            .map_err(DnsProxyError::from)?;
        Ok(Self { listener })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the token fires.
    pub async fn run(
        self,
        proxy: Arc<DnsMitmProxy>,
        token: CancellationToken,
    ) -> Result<(), DnsProxyError> {
        let listener = TcpListener::from_std(self.listener)?;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!("TCP listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            trace!(%peer, "accepted DNS TCP client");
                            let proxy = proxy.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_client(&proxy, stream, peer).await {
                                    debug!(%peer, %err, "TCP client closed with error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(%err, "TCP accept error");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
    }
}

async fn handle_client(
    proxy: &DnsMitmProxy,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), DnsProxyError> {
    let mut len_buf = [0u8; 2];

    loop {
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            continue;
        }

        let mut req = vec![0u8; len];
        stream.read_exact(&mut req).await?;

        let resp = match proxy.process_request(peer, &req, Transport::Tcp).await {
            Ok(resp) => resp,
            Err(DnsProxyError::Timeout) => {
                warn!(%peer, "request deadline exceeded");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let resp_len = u16::try_from(resp.len())
            .map_err(|_| DnsProxyError::MessageTooLarge(resp.len()))?;
        stream.write_all(&resp_len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}

// The request size cap for TCP is structural: the length prefix is 16 bits,
// so nothing larger than MAX_DNS_MESSAGE_SIZE can be framed.
const _: () = assert!(u16::MAX as usize == MAX_DNS_MESSAGE_SIZE);
