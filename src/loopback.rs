//! In-process server for a [`RegularCodestream`]
//!
//! Keeps, per server channel, a model of what the client holds and only sends
//! layers missing from it. Stateless requests, and the request opening a
//! channel, are answered against the cache model carried by the request.
//! Layer payloads are synthetic: layer `l` of a precinct weighs
//! `LAYER_BYTES * l` bytes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{Amount, ModelElement};
use crate::channel::{DataSegment, RequestFields, ResponseFields, Transport, TransportKind};
use crate::codestream::RegularCodestream;
use crate::error::TransportError;
use crate::window::{ResponseWindow, ViewWindow};

/// Payload bytes of the first layer of a precinct
pub const LAYER_BYTES: usize = 64;

/// Fixed per-response header overhead reported to channels
const HEADER_BYTES: u64 = 48;

/// Serves one target from memory
pub struct LoopbackTransport {
    geometry: RegularCodestream,
    target: String,
    target_id: String,
    sessions: Mutex<HashMap<String, HashMap<u64, u32>>>,
    next_channel: AtomicU64,
    requests: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(target: impl Into<String>, geometry: RegularCodestream) -> Self {
        let target = target.into();
        Self {
            target_id: format!("{}-{:08x}", target, rand::random::<u32>()),
            target,
            geometry,
            sessions: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(0),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn geometry(&self) -> &RegularCodestream {
        &self.geometry
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Round trips served so far
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Server channels currently open
    pub fn open_channels(&self) -> usize {
        self.sessions.lock().len()
    }

    fn payload(id: u64, layer: u32) -> Vec<u8> {
        vec![(id % 251) as u8; LAYER_BYTES * layer as usize]
    }

    /// Layers fully covered by `bytes` cumulative payload bytes
    fn layers_in_bytes(&self, bytes: u64) -> u32 {
        let mut total = 0u64;
        for layer in 1..=self.geometry.number_of_layers {
            total += (LAYER_BYTES * layer as usize) as u64;
            if total > bytes {
                return layer - 1;
            }
        }
        self.geometry.number_of_layers
    }

    /// Client holdings described by a stateless request's cache model
    fn model_from_elements(&self, elements: &[ModelElement]) -> HashMap<u64, u32> {
        let max = self.geometry.number_of_layers;
        let mut model = HashMap::new();
        for element in elements {
            match element {
                ModelElement::Explicit { id, amount } => {
                    let layers = match amount {
                        None => max,
                        Some(Amount::Layers(n)) => *n,
                        Some(Amount::Bytes(b)) => self.layers_in_bytes(*b),
                    };
                    model.insert(*id, layers.min(max));
                }
                ModelElement::Implicit {
                    tiles,
                    components,
                    resolutions,
                    precincts,
                    layers,
                } => {
                    let layers = layers.unwrap_or(max).min(max);
                    for t in tiles.first..=tiles.last {
                        for c in components.first..=components.last {
                            for r in resolutions.first..=resolutions.last {
                                for p in precincts.first..=precincts.last {
                                    let id = self.geometry.in_class_id(t as u32, c as u32, r as u32, p);
                                    model.insert(id, layers);
                                }
                            }
                        }
                    }
                }
            }
        }
        model
    }

    /// Appends every layer of `window` missing from `model`, restricted to
    /// the `need` data-bins when any are named
    fn serve_window(
        &self,
        window: &ViewWindow,
        need: &[u64],
        model: &mut HashMap<u64, u32>,
        response: &mut ResponseFields,
    ) -> Result<(), TransportError> {
        let resolved = window
            .resolve(&self.geometry)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        if Some(resolved.frame) != window.frame_size {
            let exact = resolved.to_view_window();
            response.window.frame_size = exact.frame_size;
            response.window.region_offset = exact.region_offset;
            response.window.region_size = exact.region_size;
        }
        if window.layers.map_or(false, |l| l != resolved.layers) {
            response.window.layers = Some(resolved.layers);
        }

        for info in resolved.precincts(&self.geometry) {
            let id = info.address.id;
            if !need.is_empty() && !need.contains(&id) {
                continue;
            }
            let held = model.get(&id).copied().unwrap_or(0);
            for layer in held + 1..=resolved.layers {
                response.data.push(DataSegment {
                    id,
                    layers: layer,
                    payload: Self::payload(id, layer),
                });
            }
            if resolved.layers > held {
                model.insert(id, resolved.layers);
            }
        }
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, request: &RequestFields) -> Result<ResponseFields, TransportError> {
        self.requests.fetch_add(1, Ordering::SeqCst);

        let known_target = request.target == self.target
            || request.target_id.as_deref() == Some(self.target_id.as_str());
        if !known_target {
            return Err(TransportError::Status(404));
        }

        let mut sessions = self.sessions.lock();
        for id in &request.close_channels {
            if sessions.remove(id).is_some() {
                debug!(channel = %id, "Loopback channel closed");
            }
        }

        let mut response = ResponseFields {
            target_id: Some(self.target_id.clone()),
            header_bytes: HEADER_BYTES,
            window: ResponseWindow::default(),
            ..ResponseFields::default()
        };

        let channel_id = match (&request.channel_id, request.new_channel) {
            (Some(id), _) => {
                if !sessions.contains_key(id) {
                    return Err(TransportError::Protocol(format!("unknown channel {}", id)));
                }
                Some(id.clone())
            }
            (None, Some(kind)) if kind.is_stateful() => {
                let id = format!("cid{}", self.next_channel.fetch_add(1, Ordering::SeqCst));
                sessions.insert(id.clone(), self.model_from_elements(&request.model));
                response.channel_id = Some(id.clone());
                response.transport = Some(kind);
                Some(id)
            }
            _ => None,
        };

        let wants_window = request.window.as_ref().map_or(false, |w| w.has_region());
        if request.metadata_only || !wants_window {
            if request.close_channels.is_empty() || request.metadata_only {
                let header = self
                    .geometry
                    .main_header()
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                response.main_header = Some(header);
            }
            return Ok(response);
        }

        if let Some(window) = &request.window {
            match channel_id.as_ref().and_then(|id| sessions.get_mut(id)) {
                Some(model) => self.serve_window(window, &request.need, model, &mut response)?,
                None => {
                    let mut model = self.model_from_elements(&request.model);
                    self.serve_window(window, &request.need, &mut model, &mut response)?;
                }
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, Size};

    fn server() -> LoopbackTransport {
        LoopbackTransport::new(
            "map.jp2",
            RegularCodestream::new(1024, 1024)
                .with_levels(3)
                .with_precinct_exp(8, 8)
                .with_layers(4),
        )
    }

    fn window_request(channel_id: Option<String>, new_channel: Option<TransportKind>) -> RequestFields {
        RequestFields {
            target: "map.jp2".to_string(),
            channel_id,
            new_channel,
            window: Some(
                ViewWindow::region(Size::new(128, 128), Point::new(0, 0), Size::new(128, 128))
                    .with_layers(2),
            ),
            ..RequestFields::default()
        }
    }

    #[test]
    fn test_unknown_target() {
        let request = RequestFields {
            target: "other.jp2".to_string(),
            ..RequestFields::default()
        };
        assert_eq!(server().send(&request), Err(TransportError::Status(404)));
    }

    #[test]
    fn test_metadata_request_returns_header() {
        let server = server();
        let request = RequestFields {
            target: "map.jp2".to_string(),
            metadata_only: true,
            ..RequestFields::default()
        };
        let response = server.send(&request).unwrap();
        let header = response.main_header.unwrap();
        assert_eq!(RegularCodestream::from_header(&header).unwrap(), *server.geometry());
        assert!(response.data.is_empty());
        assert_eq!(server.requests(), 1);
    }

    #[test]
    fn test_stateful_channel_sends_each_layer_once() {
        let server = server();
        let first = server
            .send(&window_request(None, Some(TransportKind::Http)))
            .unwrap();
        let cid = first.channel_id.clone().unwrap();
        // one coarsest precinct, two layers
        assert_eq!(first.data.len(), 2);
        assert_eq!(first.data[1].layers, 2);
        assert_eq!(first.data[1].payload.len(), 2 * LAYER_BYTES);

        let again = server.send(&window_request(Some(cid), None)).unwrap();
        assert!(again.data.is_empty());
        assert_eq!(server.open_channels(), 1);
    }

    #[test]
    fn test_stateless_request_honors_cache_model() {
        let server = server();
        let mut request = window_request(None, None);
        request.model = vec![ModelElement::Explicit {
            id: 0,
            amount: Some(Amount::Layers(1)),
        }];
        let response = server.send(&request).unwrap();
        assert!(response.channel_id.is_none());
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].layers, 2);

        request.model = vec![ModelElement::Explicit {
            id: 0,
            amount: Some(Amount::Bytes(LAYER_BYTES as u64 * 3)),
        }];
        assert!(server.send(&request).unwrap().data.is_empty());
    }

    #[test]
    fn test_response_window_reports_actual_frame() {
        let server = server();
        let mut request = window_request(None, None);
        request.window = Some(
            ViewWindow::region(Size::new(600, 600), Point::new(0, 0), Size::new(600, 600))
                .with_layers(9),
        );
        let response = server.send(&request).unwrap();
        assert_eq!(response.window.frame_size, Some(Size::new(512, 512)));
        assert_eq!(response.window.layers, Some(4));
    }

    #[test]
    fn test_need_limits_response() {
        let server = server();
        let mut request = window_request(None, None);
        // full frame at resolution 1 overlaps precincts 0 and 1
        request.window = Some(
            ViewWindow::region(Size::new(256, 256), Point::new(0, 0), Size::new(256, 256))
                .with_layers(1),
        );
        assert_eq!(server.send(&request).unwrap().data.len(), 2);

        request.need = vec![1];
        let response = server.send(&request).unwrap();
        assert_eq!(response.data.len(), 1);
        assert_eq!(response.data[0].id, 1);
    }

    #[test]
    fn test_close_channel() {
        let server = server();
        let cid = server
            .send(&window_request(None, Some(TransportKind::Http)))
            .unwrap()
            .channel_id
            .unwrap();
        let close = RequestFields {
            target: "map.jp2".to_string(),
            close_channels: vec![cid.clone()],
            ..RequestFields::default()
        };
        let response = server.send(&close).unwrap();
        assert!(response.main_header.is_none());
        assert_eq!(server.open_channels(), 0);
        assert!(server.send(&window_request(Some(cid), None)).is_err());
    }
}
