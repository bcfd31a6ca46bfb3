//! Precinct cache ledger: what has already been received from the server

pub mod descriptor;
pub mod persist;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::codestream::{CodestreamIndex, PrecinctAddress};
use crate::window::ResolvedWindow;

pub use descriptor::{Amount, CacheDescriptor, DescriptorForm, DescriptorQualifier, IndexSpan, ModelElement};

/// Access log entries tolerated per live entry before the log is compacted
const ACCESS_LOG_SLACK: usize = 4;

/// Progress record of one precinct data-bin
#[derive(Debug, Clone, PartialEq)]
pub struct PrecinctEntry {
    /// Known once the codestream geometry is available
    pub address: Option<PrecinctAddress>,
    pub start_layer: u32,
    /// Highest layer count requested so far
    pub end_layer: u32,
    /// Layers fully received, never decreases
    pub delivered_layers: u32,
    pub bytes_received: u64,
    /// Concatenated layer payloads
    pub data: Vec<u8>,
    last_access: u64,
}

impl PrecinctEntry {
    fn new(address: Option<PrecinctAddress>) -> Self {
        Self {
            address,
            start_layer: 0,
            end_layer: 0,
            delivered_layers: 0,
            bytes_received: 0,
            data: Vec::new(),
            last_access: 0,
        }
    }
}

/// Ledger statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStats {
    /// Number of tracked precincts
    pub entries: usize,
    /// Total payload bytes received
    pub total_bytes: u64,
    /// Precincts holding every layer of the codestream
    pub complete: usize,
}

/// Lock-free record of received precinct layers
///
/// Reads never block foreground or prefetch callers; entries are evicted in
/// least-recently-used order by [`PrecinctLedger::manage`].
pub struct PrecinctLedger {
    entries: DashMap<u64, PrecinctEntry>,
    access_log: SegQueue<(u64, u64)>,
    clock: AtomicU64,
    total_bytes: AtomicU64,
    max_layers: AtomicU32,
    index: RwLock<Option<Arc<dyn CodestreamIndex>>>,
}

impl PrecinctLedger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            access_log: SegQueue::new(),
            clock: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            max_layers: AtomicU32::new(0),
            index: RwLock::new(None),
        }
    }

    /// Makes the codestream geometry available for identifier decomposition
    pub fn attach_index(&self, index: Arc<dyn CodestreamIndex>) {
        self.max_layers.store(index.num_layers(), Ordering::Relaxed);
        *self.index.write() = Some(index);
    }

    fn max_layers(&self) -> Option<u32> {
        match self.max_layers.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    fn clamp_layers(&self, layers: u32) -> u32 {
        self.max_layers().map_or(layers, |max| layers.min(max))
    }

    fn locate(&self, id: u64) -> Option<PrecinctAddress> {
        self.index.read().as_ref().and_then(|index| index.locate(id))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn touch(&self, id: u64, entry: &mut PrecinctEntry) {
        let tick = self.tick();
        entry.last_access = tick;
        self.access_log.push((id, tick));
    }

    /// Layers of `id` already received, 0 if unknown
    pub fn delivered_layers(&self, id: u64) -> u32 {
        self.entries.get(&id).map_or(0, |e| e.delivered_layers)
    }

    /// Whether at least `layers` layers of `id` are held
    pub fn is_available(&self, id: u64, layers: u32) -> bool {
        self.delivered_layers(id) >= self.clamp_layers(layers)
    }

    /// Copy of the entry for `id`
    pub fn entry(&self, id: u64) -> Option<PrecinctEntry> {
        self.entries.get(&id).map(|e| e.clone())
    }

    /// Payload bytes received for `id`
    pub fn payload(&self, id: u64) -> Option<Vec<u8>> {
        self.entries.get(&id).map(|e| e.data.clone())
    }

    /// Notes that `layers` layers of a precinct have been asked for
    pub fn expect(&self, address: PrecinctAddress, layers: u32) {
        let layers = self.clamp_layers(layers);
        let mut entry = self
            .entries
            .entry(address.id)
            .or_insert_with(|| PrecinctEntry::new(Some(address)));
        if entry.address.is_none() {
            entry.address = Some(address);
        }
        entry.end_layer = entry.end_layer.max(layers);
    }

    /// Records that `layers` layers of `id` are complete and `bytes` more
    /// bytes arrived; delivered layers never decrease
    pub fn mark_received(&self, id: u64, layers: u32, bytes: u64) {
        let layers = self.clamp_layers(layers);
        let address = if self.entries.contains_key(&id) {
            None
        } else {
            self.locate(id)
        };
        let mut entry = self
            .entries
            .entry(id)
            .or_insert_with(|| PrecinctEntry::new(address));
        entry.delivered_layers = entry.delivered_layers.max(layers);
        entry.end_layer = entry.end_layer.max(entry.delivered_layers);
        entry.bytes_received += bytes;
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.touch(id, &mut entry);
    }

    /// Stores the payload of a layer increment
    ///
    /// Returns `false` when the increment was already held.
    pub fn record_segment(&self, id: u64, layers: u32, payload: &[u8]) -> bool {
        if layers <= self.delivered_layers(id) {
            return false;
        }
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.data.extend_from_slice(payload);
        } else {
            let mut entry = PrecinctEntry::new(self.locate(id));
            entry.data.extend_from_slice(payload);
            self.entries.insert(id, entry);
        }
        self.mark_received(id, layers, payload.len() as u64);
        true
    }

    /// True iff every precinct of the window holds the requested layers
    pub fn is_in_cache(&self, window: &ResolvedWindow, index: &dyn CodestreamIndex) -> bool {
        if window.layers == 0 {
            return true;
        }
        let precincts = window.precincts(index);
        let satisfied = precincts
            .iter()
            .all(|p| self.delivered_layers(p.address.id) >= window.layers);
        if satisfied {
            for p in &precincts {
                if let Some(mut entry) = self.entries.get_mut(&p.address.id) {
                    self.touch(p.address.id, &mut entry);
                }
            }
        }
        satisfied
    }

    /// Forgets everything; used on target switches and when reuse is disabled
    pub fn reset(&self) {
        self.entries.clear();
        while self.access_log.pop().is_some() {}
        self.total_bytes.store(0, Ordering::Relaxed);
        debug!("Precinct ledger reset");
    }

    /// Evicts least recently used entries until at most `max_bytes` are held
    ///
    /// Returns the number of evicted precincts.
    pub fn manage(&self, max_bytes: Option<u64>) -> usize {
        if self.access_log.len() > ACCESS_LOG_SLACK * self.entries.len().max(1) {
            self.compact_access_log();
        }

        let limit = match max_bytes {
            Some(limit) => limit,
            None => return 0,
        };

        let mut evicted = 0;
        while self.total_bytes.load(Ordering::Relaxed) > limit {
            let (id, tick) = match self.access_log.pop() {
                Some(item) => item,
                None => break,
            };
            let removed = self
                .entries
                .remove_if(&id, |_, entry| entry.last_access == tick);
            if let Some((_, entry)) = removed {
                self.total_bytes
                    .fetch_sub(entry.bytes_received, Ordering::Relaxed);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.entries.len(),
                total_bytes = self.total_bytes(),
                "Evicted precincts from ledger"
            );
        }
        evicted
    }

    /// Drops access log records superseded by a later access
    fn compact_access_log(&self) {
        let mut live = Vec::with_capacity(self.entries.len());
        while let Some((id, tick)) = self.access_log.pop() {
            let current = self
                .entries
                .get(&id)
                .map_or(false, |e| e.last_access == tick);
            if current {
                live.push((id, tick));
            }
        }
        for item in live {
            self.access_log.push(item);
        }
    }

    /// Replaces an entry wholesale if it holds more layers than the current one
    pub(crate) fn merge_entry(&self, id: u64, mut incoming: PrecinctEntry) -> bool {
        let current = self.delivered_layers(id);
        if incoming.delivered_layers <= current && self.entries.contains_key(&id) {
            return false;
        }
        if incoming.address.is_none() {
            incoming.address = self.locate(id);
        }
        let added = incoming.bytes_received;
        self.touch(id, &mut incoming);
        if let Some(old) = self.entries.insert(id, incoming) {
            self.total_bytes
                .fetch_sub(old.bytes_received, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(added, Ordering::Relaxed);
        true
    }

    /// Identifiers currently tracked
    pub fn ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the current number of tracked precincts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the ledger is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Returns ledger statistics
    pub fn stats(&self) -> LedgerStats {
        let max = self.max_layers();
        let complete = self
            .entries
            .iter()
            .filter(|e| max.map_or(false, |m| e.delivered_layers >= m))
            .count();

        LedgerStats {
            entries: self.entries.len(),
            total_bytes: self.total_bytes(),
            complete,
        }
    }
}

impl Default for PrecinctLedger {
    fn default() -> Self {
        Self::new()
    }
}
