//! Rate-distortion slopes of quality layers

use crate::codestream::CodestreamIndex;

/// Rate of the first layer when the codestream gives no compression ratios
const DEFAULT_FIRST_RATE: f64 = 0.0625;

/// Normalized distortion-rate slope of every quality layer
///
/// `slope(l)` is the value of adding layer `l + 1` to a precinct holding `l`
/// layers. The first layer has slope 1 and slopes never increase.
#[derive(Debug, Clone, PartialEq)]
pub struct SlopeTable {
    slopes: Vec<f64>,
}

impl SlopeTable {
    /// Slopes from per-layer compression ratios
    ///
    /// Layer `l` is assumed to reach rate `1 / ratios[l]` with distortion
    /// `2^(-2 * rate)`. Ratios that are missing, not positive or not one per
    /// layer fall back to rates doubling from layer to layer.
    pub fn from_ratios(ratios: &[f64], layers: u32) -> Self {
        let layers = layers as usize;
        let usable = ratios.len() == layers && ratios.iter().all(|r| r.is_finite() && *r > 0.0);
        let rates: Vec<f64> = if usable {
            ratios.iter().map(|r| 1.0 / r).collect()
        } else {
            (0..layers)
                .map(|l| DEFAULT_FIRST_RATE * 2f64.powi(l as i32))
                .collect()
        };

        let distortion = |rate: f64| 2f64.powf(-2.0 * rate);
        let mut slopes = Vec::with_capacity(layers);
        let mut previous_rate = 0.0;
        let mut ceiling = f64::INFINITY;
        for rate in rates {
            let slope = if rate > previous_rate {
                (distortion(previous_rate) - distortion(rate)) / (rate - previous_rate)
            } else {
                ceiling
            };
            ceiling = ceiling.min(slope);
            slopes.push(ceiling);
            previous_rate = previous_rate.max(rate);
        }

        if let Some(&first) = slopes.first() {
            if first.is_finite() && first > 0.0 {
                for slope in &mut slopes {
                    *slope /= first;
                }
            } else {
                slopes.iter_mut().for_each(|s| *s = 1.0);
            }
        }
        Self { slopes }
    }

    pub fn for_index(index: &dyn CodestreamIndex) -> Self {
        Self::from_ratios(&index.layer_compression_ratios(), index.num_layers())
    }

    /// Slope of the next layer after `delivered`, `-inf` when none is left
    pub fn slope(&self, delivered: u32) -> f64 {
        self.slopes
            .get(delivered as usize)
            .copied()
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn len(&self) -> usize {
        self.slopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slopes.is_empty()
    }

    /// Spreads the slopes over `buckets` values by linear interpolation
    pub fn resequence(&self, buckets: usize) -> Vec<f64> {
        let n = self.slopes.len();
        if buckets == 0 || n == 0 {
            return Vec::new();
        }
        if buckets == 1 || n == 1 {
            return vec![self.slopes[0]; buckets];
        }
        (0..buckets)
            .map(|k| {
                let position = k as f64 * (n - 1) as f64 / (buckets - 1) as f64;
                let low = position.floor() as usize;
                let high = (low + 1).min(n - 1);
                let fraction = position - low as f64;
                self.slopes[low] + (self.slopes[high] - self.slopes[low]) * fraction
            })
            .collect()
    }
}

/// Penalty for precincts only partially covered by a predicted window
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapPenalty {
    thresholds: Vec<f64>,
    step: f64,
}

impl OverlapPenalty {
    pub fn new(slopes: &SlopeTable, buckets: usize, step: f64) -> Self {
        Self {
            thresholds: slopes.resequence(buckets),
            step,
        }
    }

    /// `step` times the number of thresholds above `overlap`
    pub fn penalty(&self, overlap: f64) -> f64 {
        let k = self.thresholds.iter().filter(|&&t| t > overlap).count();
        self.step * k as f64
    }

    pub fn thresholds(&self) -> &[f64] {
        &self.thresholds
    }
}
