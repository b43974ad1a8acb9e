//! DNS hook handlers
//!
//! The proxy calls these around every exchange. The request side can
//! short-circuit PTR questions with a synthesized NXDOMAIN; the response
//! side feeds every observed A/AAAA/CNAME into the records cache and the
//! per-group fast paths, then optionally strips AAAA records before the
//! answer reaches the client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tracing::{debug, error, info, warn};

use super::GroupRegistry;
use crate::error::DnsProxyError;
use crate::proxy::{DnsInterceptor, RequestAction, Transport};
use crate::records::RecordsCache;

/// Hook implementation wiring the proxy into the cache and the groups.
#[derive(Clone)]
pub struct DnsEventHandler {
    disable_fake_ptr: bool,
    disable_drop_aaaa: bool,
    additional_ttl: u32,
    cache: Arc<RecordsCache>,
    groups: Arc<GroupRegistry>,
}

impl DnsEventHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        disable_fake_ptr: bool,
        disable_drop_aaaa: bool,
        additional_ttl: u32,
        cache: Arc<RecordsCache>,
        groups: Arc<GroupRegistry>,
    ) -> Self {
        Self {
            disable_fake_ptr,
            disable_drop_aaaa,
            additional_ttl,
            cache,
            groups,
        }
    }

    /// Feed every answer record into the cache and the group fast paths.
    pub fn handle_message(&self, msg: &Message, client: SocketAddr, transport: Transport) {
        if msg.response_code() != ResponseCode::NoError {
            warn!(id = msg.id(), %client, network = transport.as_str(),
                "unprocessable response");
            return;
        }

        for record in msg.answers() {
            let Some(data) = record.data() else { continue };
            match data {
                RData::A(a) => {
                    self.process_address(record.name(), a.0.into(), record.ttl(), client);
                }
                RData::AAAA(aaaa) => {
                    self.process_address(record.name(), aaaa.0.into(), record.ttl(), client);
                }
                RData::CNAME(cname) => {
                    self.process_cname(record.name(), &cname.0, record.ttl(), client);
                }
                _ => {}
            }
        }
    }

    fn process_address(&self, name: &Name, addr: std::net::IpAddr, ttl: u32, client: SocketAddr) {
        let owner = normalize_name(name);
        let total_ttl = ttl.saturating_add(self.additional_ttl);

        debug!(name = %owner, %addr, ttl, %client, "processing address record");
        self.cache.add_address(&owner, addr, total_ttl);

        let names = self.cache.get_aliases(&owner);
        for group in self.groups.snapshot() {
            match group.add_if_matched(&names, addr, total_ttl) {
                Ok(true) => {
                    info!(name = %owner, %addr, group = %group.id(), "added to routing");
                }
                Ok(false) => {}
                Err(err) => {
                    error!(name = %owner, %addr, group = %group.id(), %err,
                        "failed to add subnet");
                }
            }
        }
    }

    fn process_cname(&self, name: &Name, target: &Name, ttl: u32, client: SocketAddr) {
        let owner = normalize_name(name);
        let target = normalize_name(target);
        let total_ttl = ttl.saturating_add(self.additional_ttl);

        debug!(name = %owner, cname = %target, ttl, %client, "processing CNAME record");
        self.cache.add_alias(&owner, &target, total_ttl);

        // Everything already cached behind the canonical name becomes
        // eligible immediately, with whatever lifetime it has left.
        let now = Instant::now();
        let addresses = self.cache.get_addresses(&owner);
        let names = self.cache.get_aliases(&owner);
        for group in self.groups.snapshot() {
            for record in &addresses {
                let remaining = record.remaining_ttl(now);
                if remaining == 0 {
                    continue;
                }
                match group.add_if_matched(&names, record.addr, remaining) {
                    Ok(true) => {
                        debug!(addr = %record.addr, cname = %target, group = %group.id(),
                            "added subnet via alias");
                    }
                    Ok(false) => break,
                    Err(err) => {
                        error!(addr = %record.addr, group = %group.id(), %err,
                            "failed to add subnet");
                    }
                }
            }
        }
    }
}

/// Lower-case a wire name and drop the trailing root dot.
fn normalize_name(name: &Name) -> String {
    let mut text = name.to_ascii().to_ascii_lowercase();
    if text.ends_with('.') {
        text.pop();
    }
    text
}

#[async_trait]
impl DnsInterceptor for DnsEventHandler {
    async fn request(
        &self,
        client: SocketAddr,
        req: &Message,
        transport: Transport,
    ) -> Result<RequestAction, DnsProxyError> {
        for query in req.queries() {
            info!(id = req.id(), name = %query.name(),
                qtype = u16::from(query.query_type()), %client,
                network = transport.as_str(), "requested record");
        }

        if !self.disable_fake_ptr
            && req.queries().len() == 1
            && req.queries()[0].query_type() == RecordType::PTR
        {
            let mut answer = Message::new();
            answer.set_id(req.id());
            answer.set_message_type(MessageType::Response);
            answer.set_recursion_available(true);
            answer.set_response_code(ResponseCode::NXDomain);
            for query in req.queries() {
                answer.add_query(query.clone());
            }
            return Ok(RequestAction {
                rewrite: None,
                answer: Some(answer),
            });
        }

        Ok(RequestAction::default())
    }

    async fn response(
        &self,
        client: SocketAddr,
        _req: &Message,
        resp: &Message,
        transport: Transport,
    ) -> Result<Option<Message>, DnsProxyError> {
        // Cache and group inserts go through the blocking kernel seams.
        let handler = self.clone();
        let msg = resp.clone();
        tokio::task::spawn_blocking(move || handler.handle_message(&msg, client, transport))
            .await
            .map_err(|e| DnsProxyError::Hook(e.to_string()))?;

        if self.disable_drop_aaaa {
            return Ok(None);
        }

        let mut modified = resp.clone();
        let answers = modified.take_answers();
        let kept: Vec<_> = answers
            .into_iter()
            .filter(|record| record.record_type() != RecordType::AAAA)
            .collect();
        modified.insert_answers(kept);
        Ok(Some(modified))
    }
}
