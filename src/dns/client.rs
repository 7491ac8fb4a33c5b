//! Direct queries against a single chosen nameserver.
//!
//! The resolver rotates through a pool of public nameservers, so it needs to
//! aim each query at one specific server rather than at whatever the system
//! resolver is configured with. [`UdpNameserverClient`] builds the query in
//! wire format with `hickory-proto`, sends it over UDP port 53 and maps the
//! reply onto an [`Answer`] or a [`DnsError`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use tokio::net::UdpSocket;
use tracing::{debug, instrument};

use super::cache::{Answer, CacheKey};
use super::error::DnsError;

/// Default per-query timeout.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest reply accepted over UDP (EDNS-sized).
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

const DNS_PORT: u16 = 53;

/// Sends one query to one nameserver.
#[async_trait]
pub trait NameserverClient: Send + Sync + std::fmt::Debug {
    /// Resolves `key` using only `nameserver`.
    ///
    /// # Errors
    ///
    /// Returns a [`DnsError`] for transport failures, timeouts and answers
    /// that carry no address.
    async fn query(&self, nameserver: IpAddr, key: &CacheKey) -> Result<Answer, DnsError>;
}

/// Plain DNS-over-UDP client.
#[derive(Debug, Clone)]
pub struct UdpNameserverClient {
    timeout: Duration,
}

impl Default for UdpNameserverClient {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TIMEOUT)
    }
}

impl UdpNameserverClient {
    /// Creates a client with the given per-query timeout.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_query(key: &CacheKey) -> Result<(u16, Vec<u8>), DnsError> {
        let name = Name::from_str(&key.name).map_err(|e| DnsError::InvalidName {
            name: key.name.clone(),
            reason: e.to_string(),
        })?;

        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(key.record_type);
        query.set_query_class(key.record_class);

        let id = rand::random::<u16>();
        let mut message = Message::new(id, MessageType::Query, OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(query);

        let mut buf = Vec::with_capacity(512);
        let mut encoder = BinEncoder::new(&mut buf);
        message.emit(&mut encoder).map_err(|e| DnsError::InvalidName {
            name: key.name.clone(),
            reason: e.to_string(),
        })?;
        Ok((id, buf))
    }

    async fn exchange(&self, nameserver: IpAddr, request: &[u8]) -> Result<Vec<u8>, DnsError> {
        let bind_addr: SocketAddr = match nameserver {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let io_err = |source| DnsError::Io { nameserver, source };

        let socket = UdpSocket::bind(bind_addr).await.map_err(io_err)?;
        socket
            .connect((nameserver, DNS_PORT))
            .await
            .map_err(io_err)?;
        socket.send(request).await.map_err(io_err)?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
        let received = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Timeout { nameserver })?
            .map_err(io_err)?;
        buf.truncate(received);
        Ok(buf)
    }
}

#[async_trait]
impl NameserverClient for UdpNameserverClient {
    #[instrument(level = "debug", skip(self), fields(name = %key.name))]
    async fn query(&self, nameserver: IpAddr, key: &CacheKey) -> Result<Answer, DnsError> {
        let (id, request) = Self::build_query(key)?;
        let reply = self.exchange(nameserver, &request).await?;
        let message = Message::from_vec(&reply).map_err(|e| DnsError::Malformed {
            nameserver,
            reason: e.to_string(),
        })?;
        if message.id() != id {
            return Err(DnsError::Malformed {
                nameserver,
                reason: format!("reply id {} does not match query id {id}", message.id()),
            });
        }
        answer_from_message(&message, key, nameserver)
    }
}

fn answer_from_message(
    message: &Message,
    key: &CacheKey,
    nameserver: IpAddr,
) -> Result<Answer, DnsError> {
    match message.response_code() {
        ResponseCode::NoError => {}
        ResponseCode::NXDomain => {
            return Err(DnsError::NxDomain {
                name: key.name.clone(),
            });
        }
        other => {
            return Err(DnsError::ServerFailure {
                name: key.name.clone(),
                nameserver,
                rcode: format!("{other:?}").to_uppercase(),
            });
        }
    }

    let mut addresses = Vec::new();
    let mut ttl: Option<u32> = None;
    for record in message.answers() {
        let address = match record.data() {
            RData::A(a) => IpAddr::V4(a.0),
            RData::AAAA(aaaa) => IpAddr::V6(aaaa.0),
            _ => continue,
        };
        ttl = Some(ttl.map_or(record.ttl(), |current| current.min(record.ttl())));
        addresses.push(address);
    }

    if addresses.is_empty() {
        return Err(DnsError::NoAnswer {
            name: key.name.clone(),
        });
    }

    debug!(%nameserver, addresses = addresses.len(), "nameserver answered");
    Ok(Answer {
        name: key.name.clone(),
        addresses,
        ttl,
        nameserver: Some(nameserver),
    })
}
