//! Client session: channels, target state and foreground fetches
//!
//! A [`Session`] is shared as `Arc<Session>` between foreground callers and the
//! prefetch thread. Every network exchange happens under the session lock;
//! ledger and availability queries never take it.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheDescriptor, DescriptorForm, DescriptorQualifier, PrecinctLedger};
use crate::channel::{Channel, RequestFields, ResponseFields, Transport};
use crate::codestream::{CodestreamIndex, HeaderParser, PrecinctAddress, RegularHeaderParser};
use crate::config::ClientConfig;
use crate::coordinator::PrefetchGate;
use crate::decoder::{CoverageDecoder, Decoder};
use crate::error::{Error, Result};
use crate::history::WoiHistory;
use crate::prefetch::engine::precinct_window;
use crate::prefetch::PrefetchEngine;
use crate::speed::ThroughputMeter;
use crate::types::{Point, Size};
use crate::window::{ComponentRange, ResolvedWindow, ResponseWindow, ViewWindow};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Uninitialized,
    /// Main header parsed, no window served yet
    HeaderFetched,
    Ready,
    Closed,
}

/// A window expressed directly in codestream terms
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionRequest {
    /// All components when unset
    pub components: Option<ComponentRange>,
    pub discard_levels: u32,
    pub offset: Point,
    pub size: Size,
    /// All layers when unset
    pub layers: Option<u32>,
}

impl RegionRequest {
    /// Equivalent view window on the frame at `discard_levels`
    pub fn to_view_window(&self, index: &dyn CodestreamIndex) -> ViewWindow {
        let discard = self.discard_levels.min(index.max_discard_levels());
        let mut window = ViewWindow::region(index.frame_size(discard), self.offset, self.size)
            .with_components(self.components.into_iter().collect());
        window.layers = self.layers;
        window
    }
}

/// Output of [`Session::get_window`]
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWindow {
    /// Window actually delivered
    pub window: ViewWindow,
    pub pixels: Vec<u8>,
}

struct SessionState {
    phase: SessionPhase,
    channels: Vec<Channel>,
    target_id: Option<String>,
    response_window: ViewWindow,
    main_header: Option<Vec<u8>>,
    cache_descriptor: CacheDescriptor,
}

/// Stateful connection to one target
pub struct Session {
    config: ClientConfig,
    state: Mutex<SessionState>,
    ledger: Arc<PrecinctLedger>,
    history: Mutex<WoiHistory>,
    gate: Arc<PrefetchGate>,
    index: RwLock<Option<Arc<dyn CodestreamIndex>>>,
    transport: Arc<dyn Transport>,
    parser: Arc<dyn HeaderParser>,
    decoder: Arc<dyn Decoder>,
    meter: ThroughputMeter,
}

impl Session {
    /// Creates a session reading [`RegularCodestream`](crate::codestream::RegularCodestream)
    /// headers and rendering with [`CoverageDecoder`]
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        info!(target_name = %config.target, transport = ?config.channel_transport, "Creating session");
        Ok(Self {
            state: Mutex::new(SessionState {
                phase: SessionPhase::Uninitialized,
                channels: Vec::new(),
                target_id: None,
                response_window: ViewWindow::new(),
                main_header: None,
                cache_descriptor: config.cache_descriptor,
            }),
            ledger: Arc::new(PrecinctLedger::new()),
            history: Mutex::new(WoiHistory::new(config.history_capacity)),
            gate: Arc::new(PrefetchGate::new()),
            index: RwLock::new(None),
            transport,
            parser: Arc::new(RegularHeaderParser),
            decoder: Arc::new(CoverageDecoder),
            meter: ThroughputMeter::new(),
            config,
        })
    }

    pub fn with_parser(mut self, parser: Arc<dyn HeaderParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Makes sure the data of `window` is held, fetching what is missing
    ///
    /// # Arguments
    ///
    /// * `window` - Requested window; an unset frame means the full image
    /// * `record_history` - Whether the window feeds the movement predictor
    pub fn fetch_window(&self, window: &ViewWindow, record_history: bool) -> Result<()> {
        let _foreground = self.gate.foreground();
        let mut state = self.state.lock();
        self.fetch_window_locked(&mut state, window, record_history).map(|_| ())
    }

    /// Fetches a window, then renders it with the decoder
    ///
    /// The session lock is held from the request until the cache limit is
    /// enforced, so the delivered window is the one of this call.
    pub fn get_window(&self, window: &ViewWindow, record_history: bool) -> Result<DecodedWindow> {
        let _foreground = self.gate.foreground();
        let mut state = self.state.lock();
        let index = self.fetch_window_locked(&mut state, window, record_history)?;
        let delivered = state.response_window.clone();
        let pixels = self
            .decoder
            .decode(window, &delivered, &self.ledger, index.as_ref())?;

        let evicted = self.ledger.manage(self.config.max_cache_bytes);
        if evicted > 0 {
            self.invalidate_channels(&mut state);
        }
        Ok(DecodedWindow {
            window: delivered,
            pixels,
        })
    }

    fn fetch_window_locked(
        &self,
        state: &mut SessionState,
        window: &ViewWindow,
        record_history: bool,
    ) -> Result<Arc<dyn CodestreamIndex>> {
        ensure_open(state)?;
        if record_history {
            self.history.lock().record(window.clone());
        }

        let index = self.ensure_header(state)?;
        let resolved = window.resolve(index.as_ref())?;
        if !self.config.reuse_cache {
            self.ledger.reset();
        }

        let exact = resolved.to_view_window();
        if self.ledger.is_in_cache(&resolved, index.as_ref()) {
            debug!(discard_levels = resolved.discard_levels, "Window already cached");
            state.response_window = exact;
            state.phase = SessionPhase::Ready;
            return Ok(index);
        }

        let changed = self.exchange(state, &resolved, index.as_ref(), None)?;
        state.response_window = exact;
        state.response_window.merge_response(&changed);
        state.phase = SessionPhase::Ready;
        Ok(index)
    }

    /// [`Session::fetch_window`] for a window given in codestream terms
    pub fn fetch_region(&self, region: &RegionRequest, record_history: bool) -> Result<()> {
        let window = self.region_window(region)?;
        self.fetch_window(&window, record_history)
    }

    /// [`Session::get_window`] for a window given in codestream terms
    pub fn get_region(&self, region: &RegionRequest, record_history: bool) -> Result<DecodedWindow> {
        let window = self.region_window(region)?;
        self.get_window(&window, record_history)
    }

    fn region_window(&self, region: &RegionRequest) -> Result<ViewWindow> {
        self.get_main_header()?;
        let index = self.require_index()?;
        Ok(region.to_view_window(index.as_ref()))
    }

    /// Downloads and parses the main header if not done yet
    pub fn get_main_header(&self) -> Result<()> {
        let _foreground = self.gate.foreground();
        let mut state = self.state.lock();
        ensure_open(&state)?;
        self.ensure_header(&mut state).map(|_| ())
    }

    /// Fetch on behalf of the prefetcher
    ///
    /// Leaves history, the coordinator and the delivered window alone, and
    /// never resets the ledger. Returns whether anything was requested.
    pub fn fetch_quiet(&self, window: &ViewWindow) -> Result<bool> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        let index = self.require_index()?;
        let resolved = window.resolve(index.as_ref())?;
        if self.ledger.is_in_cache(&resolved, index.as_ref()) {
            return Ok(false);
        }
        self.exchange(&mut state, &resolved, index.as_ref(), None)?;
        Ok(true)
    }

    /// Quiet fetch of the first `layers` layers of one precinct
    ///
    /// The request is limited to that precinct's data-bin, so the coarser
    /// precincts overlapping its bounds are neither expected nor sent.
    pub fn fetch_precinct(&self, address: &PrecinctAddress, layers: u32) -> Result<bool> {
        let mut state = self.state.lock();
        ensure_open(&state)?;
        let index = self.require_index()?;
        if self.ledger.is_available(address.id, layers) {
            return Ok(false);
        }
        let window = precinct_window(index.as_ref(), address, layers).ok_or_else(|| {
            Error::Codestream(format!("precinct {} has no bounds", address.id))
        })?;
        let resolved = window.resolve(index.as_ref())?;
        self.exchange(&mut state, &resolved, index.as_ref(), Some(address))?;
        Ok(true)
    }

    /// Closes every established server channel and ends the session
    ///
    /// Without an established channel nothing is sent.
    pub fn close_session(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Closed {
            return Ok(());
        }

        let result = self.close_channels(&mut state);
        state.phase = SessionPhase::Closed;
        self.gate.set_trigger(false);
        info!(target_name = %self.config.target, "Session closed");
        if let Err(e) = &result {
            warn!(error = %e, "Channel close request failed");
        }
        result
    }

    /// Local id of the channel the next request would use, creating one if
    /// needed
    pub fn manage_channels(&self) -> String {
        let mut state = self.state.lock();
        let slot = self.select_channel(&mut state);
        state.channels[slot].local_id().to_string()
    }

    /// Whether `layers` layers of precinct `id` are held
    pub fn is_available(&self, id: u64, layers: u32) -> bool {
        self.ledger.is_available(id, layers)
    }

    /// Whether `window` could be rendered without network I/O
    pub fn is_window_available(&self, window: &ViewWindow) -> Result<bool> {
        let index = match self.index() {
            Some(index) => index,
            None => return Ok(false),
        };
        let resolved = window.resolve(index.as_ref())?;
        Ok(self.ledger.is_in_cache(&resolved, index.as_ref()))
    }

    /// Recent download throughput in bytes per second
    pub fn speed(&self) -> f64 {
        self.meter.speed()
    }

    pub fn save_cache<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.ledger.save(path)
    }

    pub fn load_cache<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.ledger.load(path)
    }

    /// Cache model format used while no server session exists
    pub fn set_cache_descriptor(
        &self,
        form: DescriptorForm,
        qualifier: DescriptorQualifier,
    ) -> Result<()> {
        let descriptor = CacheDescriptor::new(form, qualifier)?;
        self.state.lock().cache_descriptor = descriptor;
        Ok(())
    }

    /// Spawns the prefetch thread, `None` when prefetching is disabled
    pub fn start_prefetch(self: &Arc<Self>) -> Result<Option<PrefetchEngine>> {
        if !self.config.prefetch.enabled {
            return Ok(None);
        }
        PrefetchEngine::start(Arc::clone(self)).map(Some)
    }

    /// Recorded windows, oldest first
    pub fn history(&self) -> Vec<ViewWindow> {
        self.history.lock().snapshot()
    }

    /// Window delivered by the last foreground fetch
    pub fn response_window(&self) -> ViewWindow {
        self.state.lock().response_window.clone()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn main_header(&self) -> Option<Vec<u8>> {
        self.state.lock().main_header.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<PrecinctLedger> {
        &self.ledger
    }

    pub fn gate(&self) -> &Arc<PrefetchGate> {
        &self.gate
    }

    /// Codestream geometry, once the main header is known
    pub fn index(&self) -> Option<Arc<dyn CodestreamIndex>> {
        self.index.read().clone()
    }

    fn require_index(&self) -> Result<Arc<dyn CodestreamIndex>> {
        self.index()
            .ok_or_else(|| Error::Codestream("main header not fetched yet".to_string()))
    }

    /// Sends one request closing every established server channel, then
    /// forgets all channels
    fn close_channels(&self, state: &mut SessionState) -> Result<()> {
        let close: Vec<String> = state
            .channels
            .iter()
            .filter_map(|c| c.server_id().map(str::to_string))
            .collect();
        state.channels.clear();
        if close.is_empty() {
            return Ok(());
        }

        let request = RequestFields {
            target: self.config.target.clone(),
            target_id: state.target_id.clone(),
            close_channels: close,
            ..RequestFields::default()
        };
        self.transport
            .send(&request)
            .map(|_| ())
            .map_err(|source| Error::Fetch { source })
    }

    /// Drops the server channels after the ledger evicted data they assume
    /// we hold
    ///
    /// The next request opens a new channel and carries a cache model built
    /// from what the ledger still holds.
    fn invalidate_channels(&self, state: &mut SessionState) {
        if !state.channels.iter().any(Channel::is_established) {
            return;
        }
        debug!(channels = state.channels.len(), "Cache evicted, resetting server channels");
        if let Err(e) = self.close_channels(state) {
            warn!(error = %e, "Channel close request failed");
        }
    }

    /// Prefers an established channel, then any channel, then a new one
    fn select_channel(&self, state: &mut SessionState) -> usize {
        if let Some(slot) = state.channels.iter().position(Channel::is_established) {
            return slot;
        }
        if !state.channels.is_empty() {
            return 0;
        }
        let channel = Channel::new(self.config.channel_transport, self.config.keep_alive);
        debug!(local = %channel.local_id(), "Created channel");
        state.channels.push(channel);
        state.channels.len() - 1
    }

    fn ensure_header(&self, state: &mut SessionState) -> Result<Arc<dyn CodestreamIndex>> {
        if let Some(index) = self.index() {
            return Ok(index);
        }

        let attempts = self.config.header_attempts;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.request_header(state) {
                Ok(index) => return Ok(index),
                Err(e) if attempt < attempts => {
                    warn!(attempt, error = %e, "Main header request failed, retrying");
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Giving up on main header");
                    return Err(Error::MainHeaderUnavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
            }
        }
    }

    fn request_header(&self, state: &mut SessionState) -> Result<Arc<dyn CodestreamIndex>> {
        let request = RequestFields {
            target: self.config.target.clone(),
            target_id: state.target_id.clone(),
            metadata_only: true,
            ..RequestFields::default()
        };
        let response = self.round_trip(state, request)?;
        let header = response
            .main_header
            .ok_or_else(|| Error::Codestream("response carried no main header".to_string()))?;

        let index = self.parser.parse(&header)?;
        self.ledger.attach_index(index.clone());
        *self.index.write() = Some(index.clone());
        state.main_header = Some(header);
        state.phase = SessionPhase::HeaderFetched;

        let size = index.image_size();
        info!(
            width = size.width,
            height = size.height,
            layers = index.num_layers(),
            "Main header received"
        );
        Ok(index)
    }

    /// Requests the missing data of a resolved window and records what came
    /// back; returns the window fields the server changed
    ///
    /// With `only` set, the request is limited to that one precinct.
    fn exchange(
        &self,
        state: &mut SessionState,
        resolved: &ResolvedWindow,
        index: &dyn CodestreamIndex,
        only: Option<&PrecinctAddress>,
    ) -> Result<ResponseWindow> {
        let need = match only {
            Some(address) => {
                self.ledger.expect(*address, resolved.layers);
                vec![address.id]
            }
            None => {
                for info in resolved.precincts(index) {
                    self.ledger.expect(info.address, resolved.layers);
                }
                Vec::new()
            }
        };

        let slot = self.select_channel(state);
        let model = if state.channels[slot].is_established() {
            Vec::new()
        } else {
            self.ledger
                .cache_descriptor(resolved, index, state.cache_descriptor)?
        };
        let request = RequestFields {
            target: self.config.target.clone(),
            target_id: state.target_id.clone(),
            window: Some(resolved.to_view_window()),
            model,
            need,
            ..RequestFields::default()
        };

        let response = self.round_trip(state, request)?;
        let mut fresh = 0;
        for segment in &response.data {
            if self.ledger.record_segment(segment.id, segment.layers, &segment.payload) {
                fresh += 1;
            }
        }
        debug!(
            segments = response.data.len(),
            fresh,
            total_bytes = self.ledger.total_bytes(),
            "Window data received"
        );
        Ok(response.window)
    }

    /// One request over the selected channel, with bookkeeping
    fn round_trip(&self, state: &mut SessionState, request: RequestFields) -> Result<ResponseFields> {
        let slot = self.select_channel(state);
        let started = Instant::now();
        let response = state.channels[slot]
            .send(self.transport.as_ref(), request)
            .map_err(|source| {
                warn!(error = %source, "Request failed");
                Error::Fetch { source }
            })?;
        self.meter
            .record(response.header_bytes + response.body_bytes(), started.elapsed());

        if let Some(id) = &response.target_id {
            if state.target_id.as_ref() != Some(id) {
                debug!(target_id = %id, "Target identified");
                state.target_id = Some(id.clone());
            }
        }
        if !state.channels[slot].keep_alive() {
            let channel = state.channels.remove(slot);
            debug!(local = %channel.local_id(), "Released channel");
        }
        Ok(response)
    }
}

fn ensure_open(state: &SessionState) -> Result<()> {
    if state.phase == SessionPhase::Closed {
        Err(Error::SessionClosed)
    } else {
        Ok(())
    }
}
