//! CoAP connection manager.
//!
//! A compact RFC 7252 front door over UDP: enough of the codec to read the
//! header, token, Uri-Path options, and payload of a request, and to write a
//! piggybacked response. Malformed datagrams are dropped, and a task that
//! ends in `Drop` sends nothing at all — silence is valid CoAP behaviour.
use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use eyre::{Context as _, Result};
use http::Method;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::{
    core::{
        context::SystemCounters,
        inout::Input,
        looper::LooperHandle,
        router::RouterRoot,
        status::Status,
        task::{Protocol, Reply, Task},
    },
    utils::shutdown::ShutdownToken,
};

const COAP_VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
const OPTION_URI_PATH: u16 = 11;

/// 2.05 Content
const CODE_CONTENT: u8 = 0x45;
/// 4.04 Not Found
const CODE_NOT_FOUND: u8 = 0x84;
/// 5.00 Internal Server Error
const CODE_INTERNAL: u8 = 0xA0;
/// 5.03 Service Unavailable
const CODE_UNAVAILABLE: u8 = 0xA3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoapError {
    #[error("datagram truncated")]
    Truncated,

    #[error("unsupported CoAP version {0}")]
    BadVersion(u8),

    #[error("invalid token length {0}")]
    BadTokenLength(u8),

    #[error("reserved option nibble")]
    ReservedOption,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapType {
    Confirmable,
    NonConfirmable,
    Ack,
    Reset,
}

/// One parsed CoAP message (request side only carries what routing needs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    pub mtype: CoapType,
    pub code: u8,
    pub message_id: u16,
    pub token: Vec<u8>,
    pub uri_path: String,
    pub payload: Bytes,
}

impl CoapMessage {
    /// Parse a datagram. Only the options routing needs (Uri-Path) are
    /// interpreted; others are skipped.
    pub fn parse(datagram: &[u8]) -> Result<Self, CoapError> {
        if datagram.len() < 4 {
            return Err(CoapError::Truncated);
        }
        let version = datagram[0] >> 6;
        if version != COAP_VERSION {
            return Err(CoapError::BadVersion(version));
        }
        let mtype = match (datagram[0] >> 4) & 0x03 {
            0 => CoapType::Confirmable,
            1 => CoapType::NonConfirmable,
            2 => CoapType::Ack,
            _ => CoapType::Reset,
        };
        let token_len = (datagram[0] & 0x0F) as usize;
        if token_len > 8 {
            return Err(CoapError::BadTokenLength(token_len as u8));
        }
        let code = datagram[1];
        let message_id = u16::from_be_bytes([datagram[2], datagram[3]]);

        let mut pos = 4;
        if datagram.len() < pos + token_len {
            return Err(CoapError::Truncated);
        }
        let token = datagram[pos..pos + token_len].to_vec();
        pos += token_len;

        let mut option_number: u16 = 0;
        let mut path_segments: Vec<String> = Vec::new();
        while pos < datagram.len() {
            let byte = datagram[pos];
            if byte == PAYLOAD_MARKER {
                pos += 1;
                break;
            }
            pos += 1;

            let delta = Self::read_option_field(datagram, &mut pos, byte >> 4)?;
            let length = Self::read_option_field(datagram, &mut pos, byte & 0x0F)? as usize;
            option_number = option_number.saturating_add(delta);

            if datagram.len() < pos + length {
                return Err(CoapError::Truncated);
            }
            if option_number == OPTION_URI_PATH {
                path_segments
                    .push(String::from_utf8_lossy(&datagram[pos..pos + length]).into_owned());
            }
            pos += length;
        }

        let payload = Bytes::copy_from_slice(&datagram[pos.min(datagram.len())..]);
        Ok(Self {
            mtype,
            code,
            message_id,
            token,
            uri_path: format!("/{}", path_segments.join("/")),
            payload,
        })
    }

    fn read_option_field(datagram: &[u8], pos: &mut usize, nibble: u8) -> Result<u16, CoapError> {
        match nibble {
            0..=12 => Ok(nibble as u16),
            13 => {
                let ext = *datagram.get(*pos).ok_or(CoapError::Truncated)?;
                *pos += 1;
                Ok(ext as u16 + 13)
            }
            14 => {
                if datagram.len() < *pos + 2 {
                    return Err(CoapError::Truncated);
                }
                let ext = u16::from_be_bytes([datagram[*pos], datagram[*pos + 1]]);
                *pos += 2;
                Ok(ext.saturating_add(269))
            }
            _ => Err(CoapError::ReservedOption),
        }
    }

    /// Request method, when this message is a request at all.
    pub fn method(&self) -> Option<Method> {
        match self.code {
            0x01 => Some(Method::GET),
            0x02 => Some(Method::POST),
            0x03 => Some(Method::PUT),
            0x04 => Some(Method::DELETE),
            _ => None,
        }
    }

    /// Encode a response to this message: a piggybacked ACK for confirmable
    /// requests, non-confirmable otherwise. The token is echoed back.
    pub fn response(&self, code: u8, payload: &[u8]) -> Vec<u8> {
        let response_type: u8 = match self.mtype {
            CoapType::Confirmable => 2,
            _ => 1,
        };
        let mut out = Vec::with_capacity(4 + self.token.len() + 1 + payload.len());
        out.push((COAP_VERSION << 6) | (response_type << 4) | (self.token.len() as u8));
        out.push(code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.token);
        if !payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(payload);
        }
        out
    }
}

pub struct CoapConnectionManager {
    router: Arc<RouterRoot>,
    looper: LooperHandle,
    connection_timeout: Duration,
}

impl CoapConnectionManager {
    pub fn new(router: Arc<RouterRoot>, looper: LooperHandle, connection_timeout: Duration) -> Self {
        Self {
            router,
            looper,
            connection_timeout,
        }
    }

    /// Bind and serve until the shutdown token fires.
    pub async fn serve(self: Arc<Self>, addr: &str, mut shutdown: ShutdownToken) -> Result<()> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("cannot bind CoAP socket to {addr}"))?,
        );
        tracing::info!(%addr, "CoAP connection manager listening");

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!("CoAP recv failed: {e}");
                            continue;
                        }
                    };
                    let message = match CoapMessage::parse(&buf[..len]) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::debug!(%peer, "dropping malformed CoAP datagram: {e}");
                            continue;
                        }
                    };
                    self.clone().handle(Arc::clone(&socket), peer, message);
                }
                _ = shutdown.wait() => break,
            }
        }
        tracing::info!("CoAP connection manager stopped");
        Ok(())
    }

    /// Route one request and answer it from a spawned task so the receive
    /// loop never blocks.
    fn handle(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        peer: std::net::SocketAddr,
        message: CoapMessage,
    ) {
        SystemCounters::bump(&self.looper.counters().coap_requests);

        let Some(method) = message.method() else {
            // Not a request (an ACK, RST, or a response); nothing to route.
            return;
        };

        let Some(route) = self.router.resolve(&method, &message.uri_path) else {
            tracing::debug!(%peer, path = %message.uri_path, "no CoAP route matched");
            let reply = message.response(CODE_NOT_FOUND, &[]);
            tokio::spawn(async move {
                let _ = socket.send_to(&reply, peer).await;
            });
            return;
        };

        let (task, reply_rx) = Task::new_client(
            self.looper.global(),
            self.looper.api(),
            route,
            Input::new(message.payload.clone()),
            Protocol::Coap,
        );
        let task_id = task.id;

        if !self.looper.submit(task) {
            let reply = message.response(CODE_UNAVAILABLE, &[]);
            tokio::spawn(async move {
                let _ = socket.send_to(&reply, peer).await;
            });
            return;
        }

        let timeout = self.connection_timeout;
        tokio::spawn(async move {
            let reply = match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) | Err(_) => {
                    tracing::warn!(task = task_id, %peer, "no reply for CoAP task");
                    let datagram = message.response(CODE_INTERNAL, &[]);
                    let _ = socket.send_to(&datagram, peer).await;
                    return;
                }
            };
            if let Some(datagram) = encode_reply(&message, &reply) {
                let _ = socket.send_to(&datagram, peer).await;
            }
        });
    }
}

/// Status → CoAP mapping. `Drop` produces no datagram at all.
fn encode_reply(message: &CoapMessage, reply: &Reply) -> Option<Vec<u8>> {
    match reply.status {
        Status::Ok | Status::Again => Some(message.response(CODE_CONTENT, reply.body.as_bytes())),
        Status::Error | Status::InternalError => {
            Some(message.response(CODE_INTERNAL, reply.error_message.as_bytes()))
        }
        Status::Busy => Some(message.response(CODE_UNAVAILABLE, &[])),
        Status::Drop => None,
        _ => Some(message.response(CODE_INTERNAL, &[])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// GET /health, confirmable, message id 0x1234, token [0xAB].
    fn sample_request() -> Vec<u8> {
        vec![
            0x41, // version 1, CON, token length 1
            0x01, // 0.01 GET
            0x12, 0x34, // message id
            0xAB, // token
            0xB6, // option delta 11 (Uri-Path), length 6
            b'h', b'e', b'a', b'l', b't', b'h',
        ]
    }

    #[test]
    fn parses_a_get_request() {
        let message = CoapMessage::parse(&sample_request()).unwrap();
        assert_eq!(message.mtype, CoapType::Confirmable);
        assert_eq!(message.method(), Some(Method::GET));
        assert_eq!(message.message_id, 0x1234);
        assert_eq!(message.token, vec![0xAB]);
        assert_eq!(message.uri_path, "/health");
        assert!(message.payload.is_empty());
    }

    #[test]
    fn parses_multi_segment_path_and_payload() {
        let mut datagram = vec![
            0x51, // version 1, NON, token length 1
            0x02, // 0.02 POST
            0x00, 0x01, 0x07, // message id, token
            0xB4, b'n', b'o', b'd', b'e', // Uri-Path "node"
            0x03, b'r', b'p', b'c', // Uri-Path "rpc" (delta 0)
        ];
        datagram.push(PAYLOAD_MARKER);
        datagram.extend_from_slice(b"{}");

        let message = CoapMessage::parse(&datagram).unwrap();
        assert_eq!(message.uri_path, "/node/rpc");
        assert_eq!(message.payload.as_ref(), b"{}");
        assert_eq!(message.method(), Some(Method::POST));
    }

    #[test]
    fn malformed_datagrams_are_rejected() {
        assert_eq!(CoapMessage::parse(&[0x41]), Err(CoapError::Truncated));
        // version 2
        assert_eq!(
            CoapMessage::parse(&[0x81, 0x01, 0x00, 0x01]),
            Err(CoapError::BadVersion(2))
        );
        // token length 9
        assert_eq!(
            CoapMessage::parse(&[0x49, 0x01, 0x00, 0x01]),
            Err(CoapError::BadTokenLength(9))
        );
        // option claims more bytes than the datagram has
        assert_eq!(
            CoapMessage::parse(&[0x40, 0x01, 0x00, 0x01, 0xB6, b'x']),
            Err(CoapError::Truncated)
        );
    }

    #[test]
    fn confirmable_request_gets_piggybacked_ack() {
        let message = CoapMessage::parse(&sample_request()).unwrap();
        let response = message.response(CODE_CONTENT, b"ok");
        // ACK, token echoed, same message id, payload after the marker.
        assert_eq!(response[0], 0x61);
        assert_eq!(response[1], CODE_CONTENT);
        assert_eq!(&response[2..4], &[0x12, 0x34]);
        assert_eq!(response[4], 0xAB);
        assert_eq!(response[5], PAYLOAD_MARKER);
        assert_eq!(&response[6..], b"ok");
    }

    #[test]
    fn drop_status_is_silent() {
        let message = CoapMessage::parse(&sample_request()).unwrap();
        let reply = Reply {
            status: Status::Drop,
            body: String::new(),
            error_code: 0,
            error_message: String::new(),
        };
        assert!(encode_reply(&message, &reply).is_none());

        let ok = Reply {
            status: Status::Ok,
            body: "x".to_string(),
            error_code: 0,
            error_message: String::new(),
        };
        assert!(encode_reply(&message, &ok).is_some());
    }
}
