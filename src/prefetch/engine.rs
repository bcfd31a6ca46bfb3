//! Background prefetch thread

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::predictor::{Candidate, CandidateMap, Prediction, Predictor};
use super::scaling::ScalingModel;
use super::slope::{OverlapPenalty, SlopeTable};
use crate::codestream::{CodestreamIndex, PrecinctAddress};
use crate::config::PrefetchConfig;
use crate::coordinator::PrefetchGate;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::window::{ComponentRange, ViewWindow};

/// What the prefetch thread is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    ComputingCandidates,
    Fetching,
    Stopped,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EngineState::Idle,
            1 => EngineState::ComputingCandidates,
            2 => EngineState::Fetching,
            _ => EngineState::Stopped,
        }
    }
}

/// Prefetch counters since the engine started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub cycles: u64,
    /// Cycles whose scan ran to the end
    pub completed: u64,
    /// Cycles dropped because of foreground activity
    pub aborted: u64,
    /// Cycles without a window to predict from
    pub abandoned: u64,
    pub layers_fetched: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    cycles: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
    abandoned: AtomicU64,
    layers_fetched: AtomicU64,
    failures: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Handle on the prefetch thread of a session
///
/// The thread runs one cycle per burst of foreground activity: it waits until
/// no foreground fetch is active, predicts the precincts the next windows will
/// need, and pulls their layers in order of decreasing value until the
/// prediction goes stale.
pub struct PrefetchEngine {
    shared: Arc<Shared>,
    gate: Arc<PrefetchGate>,
    handle: Option<JoinHandle<()>>,
}

impl PrefetchEngine {
    /// Spawns the prefetch thread for `session`
    ///
    /// Fails when the configured scaling model cannot be read.
    pub fn start(session: Arc<Session>) -> Result<Self> {
        let config = session.config().prefetch.clone();
        let scaling = match &config.scaling_model {
            Some(path) => Some(ScalingModel::from_file(path)?),
            None => None,
        };

        let gate = Arc::clone(session.gate());
        gate.reopen();
        let shared = Arc::new(Shared::default());
        let worker = Worker {
            session,
            config,
            scaling,
            shared: Arc::clone(&shared),
        };
        let handle = thread::Builder::new()
            .name("jpip-prefetch".to_string())
            .spawn(move || worker.run())?;

        info!("Prefetch engine started");
        Ok(Self {
            shared,
            gate,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PrefetchStats {
        let s = &self.shared;
        PrefetchStats {
            cycles: s.cycles.load(Ordering::Relaxed),
            completed: s.completed.load(Ordering::Relaxed),
            aborted: s.aborted.load(Ordering::Relaxed),
            abandoned: s.abandoned.load(Ordering::Relaxed),
            layers_fetched: s.layers_fetched.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
        }
    }

    /// Stops the thread from any state and waits for it
    pub fn finish(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => return,
        };
        self.shared.stop.store(true, Ordering::Release);
        self.gate.shutdown();
        if handle.join().is_err() {
            warn!("Prefetch thread panicked");
        }
        self.shared.set_state(EngineState::Stopped);
        info!(stats = ?self.stats(), "Prefetch engine stopped");
    }
}

impl Drop for PrefetchEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    session: Arc<Session>,
    config: PrefetchConfig,
    scaling: Option<ScalingModel>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(self) {
        let gate = Arc::clone(self.session.gate());
        loop {
            // a foreground call may start while waiting for changes
            if !gate.await_clearance() || !gate.consume_pending_changes() || !gate.await_clearance() {
                break;
            }
            if self.shared.stopped() {
                break;
            }
            match self.cycle(&gate) {
                Ok(()) => {}
                Err(Error::SessionClosed) => {
                    debug!("Session closed, prefetch thread exiting");
                    break;
                }
                Err(e) => warn!(error = %e, "Prefetch cycle failed"),
            }
            self.shared.set_state(EngineState::Idle);
        }
        self.shared.set_state(EngineState::Stopped);
    }

    fn cycle(&self, gate: &PrefetchGate) -> Result<()> {
        self.shared.cycles.fetch_add(1, Ordering::Relaxed);
        let cancelled = || gate.has_pending_changes() || self.shared.stopped();

        let (index, history) = match self.session.index() {
            Some(index) => (index, self.session.history()),
            None => {
                self.shared.abandoned.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        if history.is_empty() {
            self.shared.abandoned.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.shared.set_state(EngineState::ComputingCandidates);
        let slopes = SlopeTable::for_index(index.as_ref());
        let penalty = OverlapPenalty::new(&slopes, self.config.penalty_buckets, self.config.penalty_step);
        let predictor = Predictor::new(
            index.as_ref(),
            self.session.ledger(),
            &self.config,
            penalty,
            self.scaling.as_ref(),
        );
        let mut candidates = match predictor.candidates(&history, cancelled) {
            Ok(candidates) => candidates,
            Err(Prediction::Abandoned) => {
                debug!("No window to predict from");
                self.shared.abandoned.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(Prediction::Aborted) => {
                self.shared.aborted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };
        debug!(candidates = candidates.len(), strategy = ?self.config.strategy, "Prefetch candidates ready");

        self.shared.set_state(EngineState::Fetching);
        let outcome = slope_scan(
            &mut candidates,
            &slopes,
            |candidate, layers| self.fetch_layer(candidate, layers),
            cancelled,
        )?;

        self.shared
            .layers_fetched
            .fetch_add(outcome.fetched as u64, Ordering::Relaxed);
        self.shared
            .failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
        if outcome.cancelled {
            self.shared.aborted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            rounds = outcome.rounds,
            fetched = outcome.fetched,
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            "Prefetch cycle done"
        );
        Ok(())
    }

    fn fetch_layer(&self, candidate: &Candidate, layers: u32) -> Result<bool> {
        let address = &candidate.address;
        if self.session.is_available(address.id, layers) {
            return Ok(false);
        }
        trace!(id = address.id, layers, weight = candidate.weight, "Prefetching precinct layer");
        self.session.fetch_precinct(address, layers)
    }
}

/// Window holding exactly one precinct at its native resolution
pub fn precinct_window(
    index: &dyn CodestreamIndex,
    address: &PrecinctAddress,
    layers: u32,
) -> Option<ViewWindow> {
    let discard_levels = index.native_discard_levels(address);
    let bounds = index.precinct_bounds(address, discard_levels)?;
    Some(
        ViewWindow::region(index.frame_size(discard_levels), bounds.offset(), bounds.size())
            .with_components(vec![ComponentRange::single(address.component)])
            .with_layers(layers),
    )
}

/// Result of one [`slope_scan`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub rounds: usize,
    pub fetched: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Advances candidates layer by layer in order of decreasing slope
///
/// A candidate's next slope is the slope of its next layer times its weight.
/// Each round advances every candidate whose next slope reaches the current
/// threshold, calling `fetch` with the layer count it now targets, then lowers
/// the threshold to the largest next slope left. `fetch` reports whether it
/// went to the network. Failed candidates are dropped for the rest of the
/// scan; fatal errors end it.
pub fn slope_scan<F, C>(
    candidates: &mut CandidateMap,
    slopes: &SlopeTable,
    mut fetch: F,
    cancelled: C,
) -> Result<ScanOutcome>
where
    F: FnMut(&Candidate, u32) -> Result<bool>,
    C: Fn() -> bool,
{
    let next = |c: &Candidate| {
        if c.failed {
            f64::NEG_INFINITY
        } else {
            slopes.slope(c.layers) * c.weight
        }
    };

    let mut outcome = ScanOutcome::default();
    let mut threshold = candidates.values().map(next).fold(f64::NEG_INFINITY, f64::max);
    while threshold > f64::NEG_INFINITY {
        if cancelled() {
            outcome.cancelled = true;
            return Ok(outcome);
        }
        outcome.rounds += 1;

        let mut highest = f64::NEG_INFINITY;
        for candidate in candidates.values_mut() {
            let slope = next(candidate);
            if slope > f64::NEG_INFINITY && slope >= threshold {
                candidate.layers += 1;
                match fetch(candidate, candidate.layers) {
                    Ok(true) => outcome.fetched += 1,
                    Ok(false) => {}
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(id = candidate.address.id, error = %e, "Prefetch failed");
                        candidate.failed = true;
                        outcome.failed += 1;
                    }
                }
                if cancelled() {
                    outcome.cancelled = true;
                    return Ok(outcome);
                }
            }
            highest = highest.max(next(candidate));
        }
        threshold = highest;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::RegularCodestream;
    use crate::config::PrefetchConfig;
    use crate::error::TransportError;
    use crate::test_support::{config, geometry, session};
    use crate::types::{Point, Rect, Size};
    use std::cell::Cell;
    use std::time::{Duration, Instant};

    fn candidate(id: u64, weight: f64) -> Candidate {
        Candidate {
            address: PrecinctAddress {
                id,
                tile: 0,
                component: 0,
                resolution: 3,
                precinct: id,
            },
            weight,
            layers: 0,
            failed: false,
        }
    }

    fn map(candidates: &[Candidate]) -> CandidateMap {
        candidates.iter().map(|c| (c.address.id, *c)).collect()
    }

    #[test]
    fn test_uniform_scan_finishes_within_max_layers_rounds() {
        let slopes = SlopeTable::from_ratios(&[], 4);
        let mut candidates = map(&[candidate(1, 1.0), candidate(2, 1.0), candidate(3, 1.0)]);
        let mut calls = 0;
        let outcome = slope_scan(
            &mut candidates,
            &slopes,
            |_, _| {
                calls += 1;
                Ok(true)
            },
            || false,
        )
        .unwrap();

        assert!(outcome.rounds <= 4);
        assert_eq!(outcome.fetched, 12);
        assert_eq!(calls, 12);
        assert!(!outcome.cancelled);
        assert!(candidates.values().all(|c| c.layers == 4));
    }

    #[test]
    fn test_heavier_candidate_goes_first() {
        let slopes = SlopeTable::from_ratios(&[], 4);
        let mut candidates = map(&[candidate(1, 0.1), candidate(2, 1.0)]);
        let mut order = Vec::new();
        slope_scan(
            &mut candidates,
            &slopes,
            |c, layers| {
                order.push((c.address.id, layers));
                Ok(true)
            },
            || false,
        )
        .unwrap();

        assert_eq!(order[0], (2, 1));
        assert_eq!(order.len(), 8);
        assert!(candidates.values().all(|c| c.layers == 4));
    }

    #[test]
    fn test_failed_candidate_not_retried() {
        let slopes = SlopeTable::from_ratios(&[], 4);
        let mut candidates = map(&[candidate(1, 1.0), candidate(2, 1.0)]);
        let mut attempts_on_one = 0;
        let outcome = slope_scan(
            &mut candidates,
            &slopes,
            |c, _| {
                if c.address.id == 1 {
                    attempts_on_one += 1;
                    Err(TransportError::Timeout.into())
                } else {
                    Ok(true)
                }
            },
            || false,
        )
        .unwrap();

        assert_eq!(attempts_on_one, 1);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.fetched, 4);
        assert!(candidates[&1].failed);
        assert_eq!(candidates[&2].layers, 4);
    }

    #[test]
    fn test_fatal_error_ends_scan() {
        let slopes = SlopeTable::from_ratios(&[], 4);
        let mut candidates = map(&[candidate(1, 1.0)]);
        let result = slope_scan(&mut candidates, &slopes, |_, _| Err(Error::SessionClosed), || false);
        assert!(matches!(result, Err(Error::SessionClosed)));
    }

    #[test]
    fn test_cancel_stops_after_current_layer() {
        let slopes = SlopeTable::from_ratios(&[], 4);
        let mut candidates = map(&[candidate(1, 1.0), candidate(2, 1.0)]);
        let fetched = Cell::new(0);
        let outcome = slope_scan(
            &mut candidates,
            &slopes,
            |_, _| {
                fetched.set(fetched.get() + 1);
                Ok(true)
            },
            || fetched.get() > 0,
        )
        .unwrap();

        assert!(outcome.cancelled);
        assert_eq!(fetched.get(), 1);
    }

    #[test]
    fn test_empty_map_does_nothing() {
        let slopes = SlopeTable::from_ratios(&[], 4);
        let mut candidates = CandidateMap::new();
        let outcome = slope_scan(&mut candidates, &slopes, |_, _| Ok(true), || false).unwrap();
        assert_eq!(outcome, ScanOutcome::default());
    }

    #[test]
    fn test_precinct_window_native_resolution() {
        let g: RegularCodestream = geometry();
        let id = g.in_class_id(0, 0, 2, 3);
        let address = g.locate(id).unwrap();
        let window = precinct_window(&g, &address, 2).unwrap();
        assert_eq!(window.frame_size, Some(Size::new(512, 512)));
        assert_eq!(window.region_rect(), Some(Rect::new(256, 256, 256, 256)));
        assert_eq!(window.layers, Some(2));
    }

    fn wait_for(engine: &PrefetchEngine, done: impl Fn(&PrefetchStats) -> bool) -> PrefetchStats {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let stats = engine.stats();
            if done(&stats) || Instant::now() > deadline {
                return stats;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_disabled_prefetch_starts_nothing() {
        let mut cfg = config();
        cfg.prefetch = PrefetchConfig::disabled();
        let (session, _) = session(cfg);
        assert!(session.start_prefetch().unwrap().is_none());
    }

    #[test]
    fn test_engine_prefetches_neighbors() {
        let (session, transport) = session(config());
        let engine = session.start_prefetch().unwrap().unwrap();

        let window = ViewWindow::region(Size::new(1024, 1024), Point::new(256, 256), Size::new(256, 256));
        session.get_window(&window, true).unwrap();
        let stats = wait_for(&engine, |s| s.completed >= 1);
        assert_eq!(stats.completed, 1);
        assert!(stats.layers_fetched > 0);

        let g = geometry();
        let right = g.in_class_id(0, 0, 3, 4 + 2);
        assert!(session.is_available(right, 4));
        assert!(transport.window_requests() > 1);
        assert_eq!(session.history().len(), 1);

        engine.finish();
    }

    #[test]
    fn test_finish_without_activity() {
        let (session, _) = session(config());
        let engine = session.start_prefetch().unwrap().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        engine.finish();
        assert!(session.gate().is_shut_down());
    }

    #[test]
    fn test_engine_restarts_after_finish() {
        let (session, _) = session(config());
        session.start_prefetch().unwrap().unwrap().finish();

        let engine = session.start_prefetch().unwrap().unwrap();
        let window = ViewWindow::region(Size::new(512, 512), Point::new(128, 128), Size::new(128, 128));
        session.fetch_window(&window, true).unwrap();
        let stats = wait_for(&engine, |s| s.completed >= 1);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn test_missing_scaling_model_fails_start() {
        let mut cfg = config();
        cfg.prefetch.scaling_model = Some("/nonexistent/scaling.csv".into());
        let (session, _) = session(cfg);
        assert!(session.start_prefetch().is_err());
    }
}
