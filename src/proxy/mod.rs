//! Transparent DNS proxy
//!
//! Listens on UDP and TCP simultaneously and forwards each DNS exchange to
//! a single upstream, exposing pre/post hooks that can rewrite the request,
//! synthesize a response without upstream contact, or replace the upstream
//! response. The proxy is message-transparent wherever no hook edits.
//!
//! UDP replies preserve the original destination address as their source
//! (transparent source), which keeps the client's view of the server
//! identity intact when intercepted traffic is redirected here.

mod pool;
mod tcp;
mod udp;

pub use pool::ConnPool;
pub use tcp::ProxyTcpListener;
pub use udp::ProxyUdpListener;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::DnsProxyError;

/// Maximum DNS message size on either transport.
pub const MAX_DNS_MESSAGE_SIZE: usize = 65535;

/// Transport a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Datagram transport
    Udp,
    /// Stream transport, RFC 1035 length-prefixed
    Tcp,
}

impl Transport {
    /// Lowercase name for logging.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

/// Outcome of the request hook.
#[derive(Debug, Default)]
pub struct RequestAction {
    /// Forward this message upstream instead of the original
    pub rewrite: Option<Message>,
    /// Answer the client with this message, skipping upstream entirely
    pub answer: Option<Message>,
}

/// Pre/post hooks over the proxied exchange.
///
/// Default implementations are pass-through, so implementors override only
/// the sides they care about.
#[async_trait]
pub trait DnsInterceptor: Send + Sync {
    /// Inspect a parsed request before it is forwarded.
    async fn request(
        &self,
        _client: SocketAddr,
        _req: &Message,
        _transport: Transport,
    ) -> Result<RequestAction, DnsProxyError> {
        Ok(RequestAction::default())
    }

    /// Inspect a parsed response before it is returned to the client.
    /// Returning `Some` replaces the response on the wire.
    async fn response(
        &self,
        _client: SocketAddr,
        _req: &Message,
        _resp: &Message,
        _transport: Transport,
    ) -> Result<Option<Message>, DnsProxyError> {
        Ok(None)
    }
}

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Upstream forwarder address
    pub upstream: SocketAddr,
    /// Maximum idle upstream connections per transport
    pub max_idle_conns: usize,
    /// Maximum concurrent in-flight requests
    pub max_concurrent: usize,
    /// Per-request deadline covering upstream dial and I/O
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: SocketAddr::from(([127, 0, 0, 1], 53)),
            max_idle_conns: 10,
            max_concurrent: 100,
            request_timeout: Duration::from_secs(5),
        }
    }
}

enum UpstreamConn {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

/// The proxy core: upstream pools, concurrency limit, hook dispatch.
pub struct DnsMitmProxy {
    upstream: SocketAddr,
    interceptor: Option<Arc<dyn DnsInterceptor>>,
    tcp_pool: ConnPool<TcpStream>,
    udp_pool: ConnPool<UdpSocket>,
    limiter: Semaphore,
    request_timeout: Duration,
}

impl DnsMitmProxy {
    /// Create a proxy with an optional interceptor.
    #[must_use]
    pub fn new(config: &ProxyConfig, interceptor: Option<Arc<dyn DnsInterceptor>>) -> Self {
        Self {
            upstream: config.upstream,
            interceptor,
            tcp_pool: ConnPool::new(config.max_idle_conns),
            udp_pool: ConnPool::new(config.max_idle_conns),
            limiter: Semaphore::new(config.max_concurrent),
            request_timeout: config.request_timeout,
        }
    }

    /// Shut the upstream pools down, closing every idle connection.
    pub fn close(&self) {
        self.tcp_pool.close();
        self.udp_pool.close();
    }

    /// Bind both listeners and serve until the token fires.
    ///
    /// # Errors
    ///
    /// Returns the bind error, or the first listener failure.
    pub async fn serve(
        self: Arc<Self>,
        listen: SocketAddr,
        token: CancellationToken,
    ) -> Result<(), DnsProxyError> {
        let udp = ProxyUdpListener::bind(listen)?;
        let tcp = ProxyTcpListener::bind(listen).await?;
        info!(%listen, upstream = %self.upstream, "DNS proxy listening");

        let udp_task = tokio::spawn(udp.run(self.clone(), token.clone()));
        let tcp_task = tokio::spawn(tcp.run(self.clone(), token.clone()));

        let (udp_result, tcp_result) = tokio::join!(udp_task, tcp_task);
        self.close();

        for result in [udp_result, tcp_result] {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Err(err),
                Err(join_err) => return Err(DnsProxyError::upstream(join_err)),
            }
        }
        Ok(())
    }

    /// Run one request through the full pipeline under the concurrency
    /// limit and per-request deadline. Returns the bytes to send back to
    /// the client.
    pub async fn process_request(
        &self,
        client: SocketAddr,
        req: &[u8],
        transport: Transport,
    ) -> Result<Vec<u8>, DnsProxyError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| DnsProxyError::PoolClosed)?;

        tokio::time::timeout(self.request_timeout, self.process_inner(client, req, transport))
            .await
            .map_err(|_| DnsProxyError::Timeout)?
    }

    async fn process_inner(
        &self,
        client: SocketAddr,
        req: &[u8],
        transport: Transport,
    ) -> Result<Vec<u8>, DnsProxyError> {
        if req.len() > MAX_DNS_MESSAGE_SIZE {
            return Err(DnsProxyError::MessageTooLarge(req.len()));
        }

        let Some(interceptor) = self.interceptor.as_ref() else {
            let (resp, conn) = self.exchange(req, transport).await?;
            self.release(conn);
            return Ok(resp);
        };

        let mut req_msg = Message::from_vec(req).map_err(DnsProxyError::protocol)?;

        let action = interceptor
            .request(client, &req_msg, transport)
            .await
            .map_err(|e| DnsProxyError::Hook(e.to_string()))?;
        if let Some(answer) = action.answer {
            return answer.to_vec().map_err(DnsProxyError::protocol);
        }

        let forward = match action.rewrite {
            Some(rewrite) => {
                let bytes = rewrite.to_vec().map_err(DnsProxyError::protocol)?;
                req_msg = rewrite;
                bytes
            }
            None => req.to_vec(),
        };

        let (resp_bytes, conn) = self.exchange(&forward, transport).await?;

        // A malformed upstream response poisons the connection: close it
        // instead of returning it to the pool.
        let resp_msg = match Message::from_vec(&resp_bytes) {
            Ok(msg) => {
                self.release(conn);
                msg
            }
            Err(err) => {
                drop(conn);
                return Err(DnsProxyError::protocol(err));
            }
        };

        let replaced = interceptor
            .response(client, &req_msg, &resp_msg, transport)
            .await
            .map_err(|e| DnsProxyError::Hook(e.to_string()))?;
        match replaced {
            Some(msg) => msg.to_vec().map_err(DnsProxyError::protocol),
            None => Ok(resp_bytes),
        }
    }

    fn release(&self, conn: UpstreamConn) {
        match conn {
            UpstreamConn::Tcp(stream) => self.tcp_pool.put(stream),
            UpstreamConn::Udp(socket) => self.udp_pool.put(socket),
        }
    }

    async fn exchange(
        &self,
        payload: &[u8],
        transport: Transport,
    ) -> Result<(Vec<u8>, UpstreamConn), DnsProxyError> {
        match transport {
            Transport::Tcp => {
                let mut stream = match self.tcp_pool.get()? {
                    Some(stream) => stream,
                    None => TcpStream::connect(self.upstream)
                        .await
                        .map_err(|e| DnsProxyError::upstream(format!("dial: {e}")))?,
                };

                let len = u16::try_from(payload.len())
                    .map_err(|_| DnsProxyError::MessageTooLarge(payload.len()))?;
                stream.write_all(&len.to_be_bytes()).await?;
                stream.write_all(payload).await?;

                let mut len_buf = [0u8; 2];
                stream.read_exact(&mut len_buf).await?;
                let resp_len = usize::from(u16::from_be_bytes(len_buf));
                let mut resp = vec![0u8; resp_len];
                stream.read_exact(&mut resp).await?;

                Ok((resp, UpstreamConn::Tcp(stream)))
            }
            Transport::Udp => {
                let socket = match self.udp_pool.get()? {
                    Some(socket) => socket,
                    None => {
                        let bind_addr: SocketAddr = if self.upstream.is_ipv6() {
                            "[::]:0".parse().expect("valid literal")
                        } else {
                            "0.0.0.0:0".parse().expect("valid literal")
                        };
                        let socket = UdpSocket::bind(bind_addr)
                            .await
                            .map_err(|e| DnsProxyError::upstream(format!("bind: {e}")))?;
                        socket
                            .connect(self.upstream)
                            .await
                            .map_err(|e| DnsProxyError::upstream(format!("connect: {e}")))?;
                        socket
                    }
                };

                socket.send(payload).await?;
                let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];
                let n = socket.recv(&mut buf).await?;
                buf.truncate(n);

                Ok((buf, UpstreamConn::Udp(socket)))
            }
        }
    }
}

impl std::fmt::Debug for DnsMitmProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsMitmProxy")
            .field("upstream", &self.upstream)
            .field("hooked", &self.interceptor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;

    fn query(domain: &str, id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(domain).unwrap(), RecordType::A));
        msg
    }

    fn answer_for(req: &Message, addr: [u8; 4]) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        for q in req.queries() {
            msg.add_query(q.clone());
            msg.add_answer(Record::from_rdata(
                q.name().clone(),
                60,
                RData::A(A::new(addr[0], addr[1], addr[2], addr[3])),
            ));
        }
        msg
    }

    /// Minimal upstream: answers every query with a fixed A record.
    async fn stub_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let req = Message::from_vec(&buf[..n]).unwrap();
                let resp = answer_for(&req, [1, 2, 3, 4]).to_vec().unwrap();
                let _ = socket.send_to(&resp, peer).await;
            }
        });
        addr
    }

    fn client() -> SocketAddr {
        "127.0.0.1:55555".parse().unwrap()
    }

    #[tokio::test]
    async fn test_passthrough_without_interceptor() {
        let upstream = stub_upstream().await;
        let proxy = DnsMitmProxy::new(
            &ProxyConfig {
                upstream,
                ..ProxyConfig::default()
            },
            None,
        );

        let req = query("example.com.", 0x1234).to_vec().unwrap();
        let resp = proxy
            .process_request(client(), &req, Transport::Udp)
            .await
            .unwrap();
        let msg = Message::from_vec(&resp).unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_udp_connection_reused_via_pool() {
        let upstream = stub_upstream().await;
        let proxy = DnsMitmProxy::new(
            &ProxyConfig {
                upstream,
                ..ProxyConfig::default()
            },
            None,
        );

        let req = query("example.com.", 1).to_vec().unwrap();
        proxy
            .process_request(client(), &req, Transport::Udp)
            .await
            .unwrap();
        assert_eq!(proxy.udp_pool.idle_len(), 1);
        proxy
            .process_request(client(), &req, Transport::Udp)
            .await
            .unwrap();
        assert_eq!(proxy.udp_pool.idle_len(), 1, "socket is reused, not re-dialed");
    }

    struct SynthesizingHook;

    #[async_trait]
    impl DnsInterceptor for SynthesizingHook {
        async fn request(
            &self,
            _client: SocketAddr,
            req: &Message,
            _transport: Transport,
        ) -> Result<RequestAction, DnsProxyError> {
            let mut answer = Message::new();
            answer.set_id(req.id());
            answer.set_message_type(MessageType::Response);
            answer.set_response_code(ResponseCode::NXDomain);
            Ok(RequestAction {
                rewrite: None,
                answer: Some(answer),
            })
        }
    }

    #[tokio::test]
    async fn test_synthesized_answer_skips_upstream() {
        // Upstream points at a dead port: any contact would fail or hang.
        let proxy = DnsMitmProxy::new(
            &ProxyConfig {
                upstream: "127.0.0.1:1".parse().unwrap(),
                request_timeout: Duration::from_millis(300),
                ..ProxyConfig::default()
            },
            Some(Arc::new(SynthesizingHook)),
        );

        let req = query("example.com.", 0xbeef).to_vec().unwrap();
        let resp = proxy
            .process_request(client(), &req, Transport::Udp)
            .await
            .unwrap();
        let msg = Message::from_vec(&resp).unwrap();
        assert_eq!(msg.id(), 0xbeef);
        assert_eq!(msg.response_code(), ResponseCode::NXDomain);
    }

    struct ReplacingHook;

    #[async_trait]
    impl DnsInterceptor for ReplacingHook {
        async fn response(
            &self,
            _client: SocketAddr,
            req: &Message,
            _resp: &Message,
            _transport: Transport,
        ) -> Result<Option<Message>, DnsProxyError> {
            Ok(Some(answer_for(req, [9, 9, 9, 9])))
        }
    }

    #[tokio::test]
    async fn test_response_hook_replaces_answer() {
        let upstream = stub_upstream().await;
        let proxy = DnsMitmProxy::new(
            &ProxyConfig {
                upstream,
                ..ProxyConfig::default()
            },
            Some(Arc::new(ReplacingHook)),
        );

        let req = query("example.com.", 7).to_vec().unwrap();
        let resp = proxy
            .process_request(client(), &req, Transport::Udp)
            .await
            .unwrap();
        let msg = Message::from_vec(&resp).unwrap();
        let RData::A(a) = msg.answers()[0].data().unwrap() else {
            panic!("expected A record");
        };
        assert_eq!(a.0.octets(), [9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn test_malformed_request_rejected_with_hook() {
        let upstream = stub_upstream().await;
        let proxy = DnsMitmProxy::new(
            &ProxyConfig {
                upstream,
                ..ProxyConfig::default()
            },
            Some(Arc::new(ReplacingHook)),
        );

        let err = proxy
            .process_request(client(), &[0xff, 0x00, 0x01], Transport::Udp)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_timeout_on_silent_upstream() {
        // Upstream that receives but never answers; kept alive for the
        // duration of the test so the port stays bound and mute.
        let _silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = _silent.local_addr().unwrap();

        let proxy = DnsMitmProxy::new(
            &ProxyConfig {
                upstream,
                request_timeout: Duration::from_millis(200),
                ..ProxyConfig::default()
            },
            None,
        );

        let req = query("example.com.", 1).to_vec().unwrap();
        let err = proxy
            .process_request(client(), &req, Transport::Udp)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProxyError::Timeout));
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let proxy = DnsMitmProxy::new(&ProxyConfig::default(), None);
        let huge = vec![0u8; MAX_DNS_MESSAGE_SIZE + 1];
        let err = proxy
            .process_request(client(), &huge, Transport::Tcp)
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProxyError::MessageTooLarge(_)));
    }
}
