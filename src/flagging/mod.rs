// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-datum validity weights and flag propagation.
//!
//! Each chunk solve owns a [`FlagPropagator`]: it folds the input flags and
//! noise weights into per-iteration effective weights in \[0, 1\], applies
//! an optional robust down-weighting of outliers, and accumulates flags the
//! solver raises. Flags are additive only: once a datum is flagged it
//! stays flagged for the rest of the solve pass, although down-weighting
//! may drive a datum's effective weight to zero without flagging it.

#[cfg(test)]
mod tests;

use ndarray::{azip, prelude::*};
use serde::{Deserialize, Serialize};

use crate::io::ChunkVis;

/// The robust-statistics kernel used to down-weight outliers. The exact
/// formula is a pluggable strategy; this is the closed set currently
/// offered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobustKernel {
    /// No down-weighting; effective weights are the normalised noise
    /// weights.
    #[default]
    Disabled,

    /// A Huber-style factor: residuals within `threshold` standard
    /// deviations keep full weight, larger ones are scaled by
    /// `threshold / u` where `u` is the normalised residual magnitude.
    Huber { threshold: f64 },
}

impl RobustKernel {
    /// The weight multiplier for a residual magnitude `u`, normalised by
    /// the previous iteration's weighted RMS.
    pub fn factor(self, u: f64) -> f64 {
        match self {
            RobustKernel::Disabled => 1.0,
            RobustKernel::Huber { threshold } => {
                if u <= threshold || u == 0.0 {
                    1.0
                } else {
                    (threshold / u).min(1.0)
                }
            }
        }
    }
}

/// Flag and weight state for one chunk solve.
pub struct FlagPropagator {
    /// Accumulated flags, dimensions (timestep, channel, baseline).
    /// Monotonic: bits are only ever set.
    flags: Array3<bool>,

    /// Noise weights normalised into \[0, 1\], zeroed wherever `flags` is
    /// set. Kept consistent with `flags` by [`FlagPropagator::flag`].
    base_weights: Array3<f32>,

    kernel: RobustKernel,
}

impl FlagPropagator {
    /// Build the initial weight state from a chunk's input flags and noise
    /// weights. Data that is non-finite, or whose noise weight is not a
    /// positive finite number, is flagged up front.
    pub fn new(vis: &ChunkVis, kernel: RobustKernel) -> FlagPropagator {
        let mut flags = vis.flags.clone();
        azip!((flag in &mut flags, data in &vis.data, model in &vis.model, &w in &vis.weights) {
            if !(w.is_finite() && w > 0.0)
                || data.any_nan()
                || model.any_nan()
            {
                *flag = true;
            }
        });

        let max_weight = vis
            .weights
            .iter()
            .zip(flags.iter())
            .filter(|(_, &flag)| !flag)
            .map(|(&w, _)| w)
            .fold(0.0_f32, f32::max);

        let mut base_weights = Array3::zeros(vis.weights.dim());
        if max_weight > 0.0 {
            azip!((base in &mut base_weights, &w in &vis.weights, &flag in &flags) {
                if !flag {
                    *base = w / max_weight;
                }
            });
        }

        FlagPropagator {
            flags,
            base_weights,
            kernel,
        }
    }

    pub fn flags(&self) -> &Array3<bool> {
        &self.flags
    }

    pub fn num_flagged(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    pub fn flagged_fraction(&self) -> f64 {
        let len = self.flags.len();
        if len == 0 {
            return 0.0;
        }
        self.num_flagged() as f64 / len as f64
    }

    /// Whether no datum carries any weight; such a chunk is skipped without
    /// a solver invocation.
    pub fn all_flagged(&self) -> bool {
        !self.base_weights.iter().any(|&w| w > 0.0)
    }

    /// Flag a single datum. Additive only; the datum's weight becomes and
    /// stays zero.
    pub fn flag(&mut self, timestep: usize, channel: usize, baseline: usize) {
        self.flags[(timestep, channel, baseline)] = true;
        self.base_weights[(timestep, channel, baseline)] = 0.0;
    }

    /// Flag every datum of `ant` within the given local timestep/channel
    /// ranges. Used after a terminal solver state for antennas whose
    /// solution could not be constrained.
    pub fn flag_antenna(
        &mut self,
        ant: usize,
        timesteps: std::ops::Range<usize>,
        channels: std::ops::Range<usize>,
        baseline_pairs: &[(usize, usize)],
    ) {
        for (bl, &(ant1, ant2)) in baseline_pairs.iter().enumerate() {
            if ant1 != ant && ant2 != ant {
                continue;
            }
            for t in timesteps.clone() {
                for f in channels.clone() {
                    self.flag(t, f, bl);
                }
            }
        }
    }

    /// Compute the effective per-datum weights for one solver iteration.
    ///
    /// `prev_residuals` holds the per-datum residual magnitudes of the
    /// *previous* iteration; `None` on the first iteration, where no robust
    /// factor is applied.
    pub fn iteration_weights(&self, prev_residuals: Option<&Array3<f64>>, out: &mut Array3<f32>) {
        debug_assert_eq!(out.dim(), self.base_weights.dim());
        match (self.kernel, prev_residuals) {
            (RobustKernel::Disabled, _) | (_, None) => out.assign(&self.base_weights),
            (kernel, Some(resid)) => {
                let rms = self.weighted_rms(resid);
                if rms > 0.0 {
                    azip!((w in out, &base in &self.base_weights, &r in resid) {
                        *w = base * kernel.factor(r / rms) as f32;
                    });
                } else {
                    out.assign(&self.base_weights);
                }
            }
        }
    }

    /// The base-weighted RMS of a residual-magnitude array over unflagged
    /// data.
    fn weighted_rms(&self, residuals: &Array3<f64>) -> f64 {
        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        azip!((&base in &self.base_weights, &r in residuals) {
            let w = base as f64;
            sum += w * r * r;
            weight_sum += w;
        });
        if weight_sum > 0.0 {
            (sum / weight_sum).sqrt()
        } else {
            0.0
        }
    }

    /// The total base weight each antenna carries in each (time, frequency)
    /// solution-interval cell of the given widths. An antenna with a zero
    /// total for a cell cannot be solved there.
    pub fn antenna_cell_weights(
        &self,
        time_interval: usize,
        freq_interval: usize,
        num_ants: usize,
        baseline_pairs: &[(usize, usize)],
    ) -> Array3<f64> {
        let (num_t, num_f, _) = self.base_weights.dim();
        let num_t_ints = crate::math::ceil_div(num_t, time_interval);
        let num_f_ints = crate::math::ceil_div(num_f, freq_interval);
        let mut totals = Array3::zeros((num_t_ints, num_f_ints, num_ants));
        for ((t, f, bl), &base) in self.base_weights.indexed_iter() {
            if base <= 0.0 {
                continue;
            }
            let (ant1, ant2) = baseline_pairs[bl];
            let cell = (t / time_interval, f / freq_interval);
            totals[(cell.0, cell.1, ant1)] += base as f64;
            totals[(cell.0, cell.1, ant2)] += base as f64;
        }
        totals
    }

    /// Consume the propagator, yielding the final flag cube for the chunk.
    pub fn into_flags(self) -> Array3<bool> {
        self.flags
    }
}
