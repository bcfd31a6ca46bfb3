//! Shared fixtures for unit tests

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{RequestFields, ResponseFields, Transport};
use crate::codestream::RegularCodestream;
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::loopback::LoopbackTransport;
use crate::session::Session;

pub(crate) const TARGET: &str = "map.jp2";

/// 1024x1024, 3 levels, 256x256 precincts (1, 1, 4, 16 per resolution), 4 layers
pub(crate) fn geometry() -> RegularCodestream {
    RegularCodestream::new(1024, 1024)
        .with_levels(3)
        .with_precinct_exp(8, 8)
        .with_layers(4)
}

/// Loopback server that records requests and fails on demand
pub(crate) struct ScriptedTransport {
    pub(crate) inner: LoopbackTransport,
    pub(crate) requests: Mutex<Vec<RequestFields>>,
    /// Requests still to fail with a timeout
    pub(crate) failures_left: AtomicU32,
    /// Fail every request carrying a window
    pub(crate) fail_windows: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new(geometry: RegularCodestream) -> Self {
        Self {
            inner: LoopbackTransport::new(TARGET, geometry),
            requests: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(0),
            fail_windows: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Requests that asked for a window region
    pub(crate) fn window_requests(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.window.as_ref().map_or(false, |w| w.has_region()))
            .count()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &RequestFields) -> Result<ResponseFields, TransportError> {
        self.requests.lock().push(request.clone());
        let scripted = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(TransportError::Timeout);
        }
        if self.fail_windows.load(Ordering::SeqCst) && request.window.is_some() {
            return Err(TransportError::Connection("scripted failure".to_string()));
        }
        self.inner.send(request)
    }
}

/// Session over a scripted loopback server of [`geometry`]
pub(crate) fn session(config: ClientConfig) -> (Arc<Session>, Arc<ScriptedTransport>) {
    session_with(config, geometry())
}

pub(crate) fn session_with(
    config: ClientConfig,
    geometry: RegularCodestream,
) -> (Arc<Session>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new(geometry));
    let session = Session::new(config, transport.clone()).unwrap();
    (Arc::new(session), transport)
}

pub(crate) fn config() -> ClientConfig {
    ClientConfig::new(TARGET)
}
