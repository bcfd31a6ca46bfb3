//! Window prediction: which precincts the user is likely to need next

use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::trace;

use super::scaling::ScalingModel;
use super::slope::OverlapPenalty;
use crate::cache::PrecinctLedger;
use crate::codestream::{CodestreamIndex, PrecinctAddress};
use crate::config::{PrefetchConfig, PrefetchStrategy};
use crate::movement::{Direction, MovementModel};
use crate::types::{Rect, Size};
use crate::window::{ResolvedWindow, ViewWindow};

/// A precinct worth prefetching
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub address: PrecinctAddress,
    /// Accumulated relevance
    pub weight: f64,
    /// Layers held or already scheduled
    pub layers: u32,
    /// Fetch failed this cycle, not retried
    pub failed: bool,
}

/// Candidate precincts keyed by in-class identifier
pub type CandidateMap = BTreeMap<u64, Candidate>;

/// Why no candidates came out of a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    /// History holds nothing to predict from
    Abandoned,
    /// Foreground activity made the computation stale
    Aborted,
}

/// Box enclosing every windowed history entry, on the largest frame among them
///
/// Every precinct of the result weighs the same. `None` when no entry has a
/// region.
pub fn bounding_box(history: &[ViewWindow], index: &dyn CodestreamIndex) -> Option<ResolvedWindow> {
    let resolved: Vec<ResolvedWindow> = history
        .iter()
        .filter_map(|w| w.resolve(index).ok())
        .filter(|w| w.region.is_some())
        .collect();

    let reference = resolved
        .iter()
        .max_by_key(|w| w.frame.pixel_count())?
        .clone();

    let mut region: Option<Rect> = None;
    let mut components = Vec::new();
    let mut layers = 0;
    for window in &resolved {
        let scaled = match window.region {
            Some(r) => scale_rect(&r, window.frame, reference.frame),
            None => continue,
        };
        region = Some(match region {
            Some(acc) => acc.union(&scaled),
            None => scaled,
        });
        components.extend_from_slice(&window.components);
        layers = layers.max(window.layers);
    }
    components.sort_unstable();
    components.dedup();

    Some(ResolvedWindow {
        region,
        components,
        layers,
        ..reference
    })
}

/// Maps a rectangle of frame `from` onto frame `to`, rounding outwards
fn scale_rect(rect: &Rect, from: Size, to: Size) -> Rect {
    if from == to {
        return *rect;
    }
    let x0 = rect.x * to.width / from.width;
    let y0 = rect.y * to.height / from.height;
    let x1 = (rect.right() * to.width).div_ceil(from.width).min(to.width);
    let y1 = (rect.bottom() * to.height).div_ceil(from.height).min(to.height);
    Rect::from_corners(x0, y0, x1.max(x0 + 1), y1.max(y0 + 1))
}

/// Windows reachable from `window` in one movement
///
/// Pans shift the region by its own size and are only kept when the shifted
/// region lies entirely inside the frame. Zooms move one resolution level up or down,
/// keeping the region size and centering it on the old region's midpoint.
pub fn neighbor_windows(
    window: &ResolvedWindow,
    index: &dyn CodestreamIndex,
) -> Vec<(Direction, ResolvedWindow)> {
    let region = match window.region {
        Some(region) => region,
        None => return Vec::new(),
    };
    let mut neighbors = Vec::with_capacity(10);

    for direction in Direction::PANS {
        let (dx, dy) = match direction.shift() {
            Some(shift) => shift,
            None => continue,
        };
        let x = region.x as i64 + dx * region.width as i64;
        let y = region.y as i64 + dy * region.height as i64;
        if let Some(shifted) = Rect::within_frame(x, y, region.width, region.height, window.frame) {
            neighbors.push((
                direction,
                ResolvedWindow {
                    region: Some(shifted),
                    ..window.clone()
                },
            ));
        }
    }

    if window.discard_levels > 0 {
        neighbors.push((Direction::ZoomIn, zoomed(window, &region, window.discard_levels - 1, index)));
    }
    if window.discard_levels < index.max_discard_levels() {
        neighbors.push((Direction::ZoomOut, zoomed(window, &region, window.discard_levels + 1, index)));
    }
    neighbors
}

fn zoomed(
    window: &ResolvedWindow,
    region: &Rect,
    discard_levels: u32,
    index: &dyn CodestreamIndex,
) -> ResolvedWindow {
    let frame = index.frame_size(discard_levels);
    let center_x = (region.x * 2 + region.width) * frame.width / (2 * window.frame.width);
    let center_y = (region.y * 2 + region.height) * frame.height / (2 * window.frame.height);
    let width = region.width.min(frame.width);
    let height = region.height.min(frame.height);
    let x = center_x.saturating_sub(width / 2).min(frame.width - width);
    let y = center_y.saturating_sub(height / 2).min(frame.height - height);
    ResolvedWindow {
        discard_levels,
        frame,
        region: Some(Rect::new(x, y, width, height)),
        ..window.clone()
    }
}

/// Turns history into weighted candidate precincts
pub struct Predictor<'a> {
    index: &'a dyn CodestreamIndex,
    ledger: &'a PrecinctLedger,
    strategy: PrefetchStrategy,
    movement: &'a MovementModel,
    penalty: OverlapPenalty,
    scaling: Option<&'a ScalingModel>,
}

/// One precinct of one predicted window
struct Hit {
    address: PrecinctAddress,
    overlap: f64,
    weight: f64,
}

impl<'a> Predictor<'a> {
    pub fn new(
        index: &'a dyn CodestreamIndex,
        ledger: &'a PrecinctLedger,
        config: &'a PrefetchConfig,
        penalty: OverlapPenalty,
        scaling: Option<&'a ScalingModel>,
    ) -> Self {
        Self {
            index,
            ledger,
            strategy: config.strategy,
            movement: &config.movement,
            penalty,
            scaling,
        }
    }

    /// Builds the candidate map for `history`
    ///
    /// `cancelled` is polled after every accumulated precinct; once it returns
    /// true the partial map is dropped.
    pub fn candidates<F>(&self, history: &[ViewWindow], cancelled: F) -> Result<CandidateMap, Prediction>
    where
        F: Fn() -> bool,
    {
        let windows: Vec<(f64, ResolvedWindow)> = match self.strategy {
            PrefetchStrategy::BoundingBox => match bounding_box(history, self.index) {
                Some(window) => vec![(1.0, window)],
                None => return Err(Prediction::Abandoned),
            },
            PrefetchStrategy::WeightedWoi => {
                let windowed: Vec<ResolvedWindow> = history
                    .iter()
                    .filter(|w| w.has_region())
                    .filter_map(|w| w.resolve(self.index).ok())
                    .collect();
                if windowed.is_empty() {
                    return Err(Prediction::Abandoned);
                }
                windowed
                    .iter()
                    .flat_map(|w| neighbor_windows(w, self.index))
                    .map(|(direction, w)| (self.movement.weight(direction), w))
                    .filter(|(weight, _)| *weight > 0.0)
                    .collect()
            }
        };

        let uniform = self.strategy == PrefetchStrategy::BoundingBox;
        let hits: Vec<Vec<Hit>> = windows
            .par_iter()
            .map(|(weight, window)| self.hits(*weight, window))
            .collect();

        let max_layers = self.index.num_layers();
        let mut candidates = CandidateMap::new();
        for hit in hits.into_iter().flatten() {
            let id = hit.address.id;
            let delivered = self.ledger.delivered_layers(id);
            if delivered < max_layers {
                let relevance = if uniform {
                    1.0
                } else {
                    self.relevance(id, hit.overlap) * hit.weight
                };
                let candidate = candidates.entry(id).or_insert(Candidate {
                    address: hit.address,
                    weight: 0.0,
                    layers: delivered,
                    failed: false,
                });
                candidate.weight = if uniform { relevance } else { candidate.weight + relevance };
            }
            if cancelled() {
                trace!(accumulated = candidates.len(), "Candidate computation aborted");
                return Err(Prediction::Aborted);
            }
        }

        candidates.retain(|_, c| c.weight > 0.0);
        Ok(candidates)
    }

    fn hits(&self, weight: f64, window: &ResolvedWindow) -> Vec<Hit> {
        let region = match window.region {
            Some(region) => region,
            None => return Vec::new(),
        };
        window
            .precincts(self.index)
            .into_iter()
            .map(|info| Hit {
                address: info.address,
                overlap: info.bounds.coverage_by(&region),
                weight,
            })
            .collect()
    }

    fn relevance(&self, id: u64, overlap: f64) -> f64 {
        match self.scaling.and_then(|s| s.value(id)) {
            Some(value) => value,
            None => 1.0 - self.penalty.penalty(overlap),
        }
    }
}
