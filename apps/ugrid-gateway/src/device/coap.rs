//! Minimal confirmable CoAP client over UDP.

use super::{DeviceResource, DeviceTransport, Endpoint, StatePayload};
use crate::codec::{ContentFormat, CONTENT_FORMAT_CBOR};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use coap_lite::{CoapOption, MessageClass, MessageType, Packet, RequestType, ResponseType};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use url::Host;

const MAX_DATAGRAM: usize = 1500;
const DEFAULT_RETRANSMIT: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct CoapTransport {
    timeout: Duration,
    retransmit: Duration,
    message_id: AtomicU16,
    token: AtomicU32,
}

impl CoapTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            retransmit: DEFAULT_RETRANSMIT.min(timeout),
            message_id: AtomicU16::new(std::process::id() as u16),
            token: AtomicU32::new(1),
        }
    }

    async fn resolve(&self, endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
        let port = endpoint.port();
        let io_err = |source| TransportError::Io {
            target: endpoint.authority(),
            source,
        };
        match endpoint.host() {
            Some(Host::Ipv4(ip)) => Ok(SocketAddr::new(IpAddr::V4(ip), port)),
            Some(Host::Ipv6(ip)) => Ok(SocketAddr::new(IpAddr::V6(ip), port)),
            Some(Host::Domain(name)) => {
                let name = name.trim_start_matches('[').trim_end_matches(']');
                if let Ok(ip) = name.parse::<IpAddr>() {
                    return Ok(SocketAddr::new(ip, port));
                }
                tokio::net::lookup_host((name, port))
                    .await
                    .map_err(io_err)?
                    .next()
                    .ok_or_else(|| TransportError::InvalidUri {
                        uri: endpoint.state_uri.to_string(),
                        reason: format!("{name} did not resolve"),
                    })
            }
            None => Err(TransportError::InvalidUri {
                uri: endpoint.state_uri.to_string(),
                reason: "missing host".to_string(),
            }),
        }
    }

    fn request(
        &self,
        method: RequestType,
        path: &[String],
        accept: Option<u16>,
        body: Vec<u8>,
    ) -> Packet {
        let mut packet = Packet::new();
        packet.header.set_type(MessageType::Confirmable);
        packet.header.code = MessageClass::Request(method);
        packet.header.message_id = self.message_id.fetch_add(1, Ordering::Relaxed);
        packet.set_token(self.token.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec());
        for segment in path {
            packet.add_option(CoapOption::UriPath, segment.as_bytes().to_vec());
        }
        if let Some(format) = accept {
            packet.add_option(CoapOption::Accept, encode_uint(format));
        }
        packet.payload = body;
        packet
    }

    /// Sends a confirmable request and waits for the matching response,
    /// retransmitting until the first ACK or the overall timeout.
    async fn exchange(&self, endpoint: &Endpoint, request: Packet) -> Result<Packet, TransportError> {
        let target = endpoint.authority();
        let io_err = |source| TransportError::Io {
            target: target.clone(),
            source,
        };
        let addr = self.resolve(endpoint).await?;
        let bind: SocketAddr = if addr.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(io_err)?;
        socket.connect(addr).await.map_err(io_err)?;

        let bytes = request
            .to_bytes()
            .map_err(|err| TransportError::Malformed(format!("{err:?}")))?;
        let token = request.get_token().to_vec();
        let message_id = request.header.message_id;

        let deadline = Instant::now() + self.timeout;
        let mut acknowledged = false;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        socket.send(&bytes).await.map_err(io_err)?;
        let mut next_send = Instant::now() + self.retransmit;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout {
                    target: target.clone(),
                    timeout: self.timeout,
                });
            }
            let wake = if acknowledged { deadline } else { next_send.min(deadline) };
            let received = tokio::time::timeout_at(wake, socket.recv(&mut buf)).await;
            let len = match received {
                Ok(result) => result.map_err(io_err)?,
                Err(_) => {
                    if !acknowledged && Instant::now() < deadline {
                        tracing::debug!(device = %target, "retransmitting CoAP request");
                        socket.send(&bytes).await.map_err(io_err)?;
                        next_send = Instant::now() + self.retransmit;
                    }
                    continue;
                }
            };

            let response = match Packet::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    tracing::debug!(device = %target, error = ?err, "ignoring undecodable datagram");
                    continue;
                }
            };

            let is_ack = response.header.get_type() == MessageType::Acknowledgement;
            if is_ack && response.header.message_id == message_id {
                acknowledged = true;
                if response.header.code == MessageClass::Empty {
                    // Separate response follows.
                    continue;
                }
            }
            if response.get_token() != token.as_slice() {
                continue;
            }
            if response.header.get_type() == MessageType::Confirmable {
                acknowledge(&socket, &response).await;
            }
            return check_status(&target, response);
        }
    }
}

async fn acknowledge(socket: &UdpSocket, response: &Packet) {
    let mut ack = Packet::new();
    ack.header.set_type(MessageType::Acknowledgement);
    ack.header.code = MessageClass::Empty;
    ack.header.message_id = response.header.message_id;
    match ack.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = socket.send(&bytes).await {
                tracing::debug!(error = %err, "failed to acknowledge separate response");
            }
        }
        Err(err) => tracing::debug!(error = ?err, "failed to encode ACK"),
    }
}

fn check_status(target: &str, response: Packet) -> Result<Packet, TransportError> {
    match response.header.code {
        MessageClass::Response(
            ResponseType::Content
            | ResponseType::Changed
            | ResponseType::Created
            | ResponseType::Deleted
            | ResponseType::Valid,
        ) => Ok(response),
        MessageClass::Response(code) => Err(TransportError::Status {
            target: target.to_string(),
            code: format!("{code:?}"),
        }),
        other => Err(TransportError::Malformed(format!(
            "unexpected message class {other:?} from {target}"
        ))),
    }
}

fn encode_uint(value: u16) -> Vec<u8> {
    value
        .to_be_bytes()
        .into_iter()
        .skip_while(|byte| *byte == 0)
        .collect()
}

fn decode_uint(raw: &[u8]) -> Option<u16> {
    if raw.len() > 2 {
        return None;
    }
    Some(raw.iter().fold(0u16, |acc, byte| (acc << 8) | u16::from(*byte)))
}

fn content_format(packet: &Packet) -> Option<ContentFormat> {
    packet
        .get_option(CoapOption::ContentFormat)
        .and_then(|values| values.front())
        .and_then(|raw| decode_uint(raw))
        .and_then(ContentFormat::from_coap)
}

#[async_trait]
impl DeviceTransport for CoapTransport {
    async fn fetch_state(&self, endpoint: &Endpoint) -> Result<StatePayload, TransportError> {
        let path = DeviceResource::State.path(endpoint);
        let request = self.request(RequestType::Get, &path, Some(CONTENT_FORMAT_CBOR), Vec::new());
        let response = self.exchange(endpoint, request).await?;
        Ok(StatePayload {
            content_format: content_format(&response),
            body: Bytes::from(response.payload),
        })
    }

    async fn put(
        &self,
        endpoint: &Endpoint,
        resource: DeviceResource,
        body: Vec<u8>,
    ) -> Result<(), TransportError> {
        let path = resource.path(endpoint);
        let request = self.request(RequestType::Put, &path, None, body);
        self.exchange(endpoint, request).await?;
        Ok(())
    }
}
