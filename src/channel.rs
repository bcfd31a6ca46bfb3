//! Channels and the protocol fields exchanged over them

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::ModelElement;
use crate::error::TransportError;
use crate::window::{ResponseWindow, ViewWindow};

/// Transport negotiated for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Stateless requests, no server session
    #[default]
    None,
    Http,
    HttpTcp,
}

impl TransportKind {
    /// Whether requests over this transport open a server-side session
    pub fn is_stateful(&self) -> bool {
        !matches!(self, TransportKind::None)
    }

    /// Parses the names used in channel requests
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(TransportKind::None),
            "http" => Some(TransportKind::Http),
            "http-tcp" => Some(TransportKind::HttpTcp),
            _ => None,
        }
    }
}

/// Request fields of one round trip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestFields {
    pub target: String,
    /// Server target id, once known
    pub target_id: Option<String>,
    /// Server channel id the request travels on
    pub channel_id: Option<String>,
    /// Asks the server to open a channel of this kind
    pub new_channel: Option<TransportKind>,
    /// Server channel ids to close
    pub close_channels: Vec<String>,
    pub window: Option<ViewWindow>,
    /// Client cache model, sent when the server keeps no session for us
    pub model: Vec<ModelElement>,
    /// Only headers and metadata are wanted
    pub metadata_only: bool,
    /// Precinct data-bins the response is limited to, all of the window's
    /// when empty
    pub need: Vec<u64>,
}

/// One precinct data segment of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub id: u64,
    /// Layer count held once this segment is appended
    pub layers: u32,
    pub payload: Vec<u8>,
}

/// Response fields of one round trip
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseFields {
    /// Server channel id assigned to a new channel
    pub channel_id: Option<String>,
    pub transport: Option<TransportKind>,
    pub target_id: Option<String>,
    /// Window fields the server changed
    pub window: ResponseWindow,
    pub header_bytes: u64,
    pub main_header: Option<Vec<u8>>,
    pub data: Vec<DataSegment>,
}

impl ResponseFields {
    /// Payload bytes carried by the data segments
    pub fn body_bytes(&self) -> u64 {
        let data: u64 = self.data.iter().map(|s| s.payload.len() as u64).sum();
        data + self.main_header.as_ref().map_or(0, |h| h.len() as u64)
    }
}

/// Performs protocol round trips with a server
pub trait Transport: Send + Sync {
    fn send(&self, request: &RequestFields) -> Result<ResponseFields, TransportError>;
}

/// One negotiated transport endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    local_id: String,
    server_id: Option<String>,
    transport: TransportKind,
    keep_alive: bool,
    bytes_header: u64,
    bytes_body: u64,
}

impl Channel {
    /// Creates an unestablished channel with a random local id
    pub fn new(transport: TransportKind, keep_alive: bool) -> Self {
        Self {
            local_id: format!("{:032x}", rand::random::<u128>()),
            server_id: None,
            transport,
            keep_alive,
            bytes_header: 0,
            bytes_body: 0,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_established(&self) -> bool {
        self.server_id.is_some()
    }

    pub fn bytes_header(&self) -> u64 {
        self.bytes_header
    }

    pub fn bytes_body(&self) -> u64 {
        self.bytes_body
    }

    /// Fills in the channel fields of `request` and performs the round trip
    ///
    /// An unestablished channel asks for a new server channel; the server id
    /// from the response establishes it.
    pub fn send(
        &mut self,
        transport: &dyn Transport,
        mut request: RequestFields,
    ) -> Result<ResponseFields, TransportError> {
        match &self.server_id {
            Some(id) => request.channel_id = Some(id.clone()),
            None if self.transport.is_stateful() => request.new_channel = Some(self.transport),
            None => {}
        }

        let response = transport.send(&request)?;
        self.bytes_header += response.header_bytes;
        self.bytes_body += response.body_bytes();

        if let Some(id) = &response.channel_id {
            if self.server_id.as_deref() != Some(id.as_str()) {
                debug!(local = %self.local_id, server = %id, "Channel established");
                self.server_id = Some(id.clone());
            }
            if let Some(kind) = response.transport {
                self.transport = kind;
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        requests: Mutex<Vec<RequestFields>>,
        assign: Option<String>,
    }

    impl Transport for Recorder {
        fn send(&self, request: &RequestFields) -> Result<ResponseFields, TransportError> {
            self.requests.lock().push(request.clone());
            Ok(ResponseFields {
                channel_id: self.assign.clone(),
                transport: self.assign.as_ref().map(|_| TransportKind::Http),
                header_bytes: 10,
                data: vec![DataSegment {
                    id: 1,
                    layers: 1,
                    payload: vec![0; 32],
                }],
                ..ResponseFields::default()
            })
        }
    }

    #[test]
    fn test_local_ids_are_unique_hex() {
        let a = Channel::new(TransportKind::Http, true);
        let b = Channel::new(TransportKind::Http, true);
        assert_ne!(a.local_id(), b.local_id());
        assert_eq!(a.local_id().len(), 32);
        assert!(a.local_id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_first_send_establishes_channel() {
        let server = Recorder {
            requests: Mutex::new(Vec::new()),
            assign: Some("cid7".to_string()),
        };
        let mut channel = Channel::new(TransportKind::Http, true);
        assert!(!channel.is_established());

        channel.send(&server, RequestFields::default()).unwrap();
        assert_eq!(channel.server_id(), Some("cid7"));
        channel.send(&server, RequestFields::default()).unwrap();

        let requests = server.requests.lock();
        assert_eq!(requests[0].new_channel, Some(TransportKind::Http));
        assert_eq!(requests[0].channel_id, None);
        assert_eq!(requests[1].new_channel, None);
        assert_eq!(requests[1].channel_id.as_deref(), Some("cid7"));
        assert_eq!(channel.bytes_header(), 20);
        assert_eq!(channel.bytes_body(), 64);
    }

    #[test]
    fn test_stateless_channel_never_asks_for_session() {
        let server = Recorder {
            requests: Mutex::new(Vec::new()),
            assign: None,
        };
        let mut channel = Channel::new(TransportKind::None, false);
        channel.send(&server, RequestFields::default()).unwrap();
        assert_eq!(server.requests.lock()[0].new_channel, None);
        assert!(!channel.is_established());
    }

    #[test]
    fn test_transport_names() {
        assert_eq!(TransportKind::from_name("http-tcp"), Some(TransportKind::HttpTcp));
        assert_eq!(TransportKind::from_name("udp"), None);
        assert!(!TransportKind::None.is_stateful());
    }
}
