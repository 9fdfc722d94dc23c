// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Observation metadata used by the solver engine.

use hifitime::{Duration, Epoch};
use vec1::Vec1;

use crate::math::{baseline_pairs, num_cross_baselines};

/// The extents and coordinates of the observation being calibrated.
///
/// This is metadata only; the visibilities themselves are served chunk by
/// chunk through a [`VisAccess`](crate::io::VisAccess) implementation. All
/// index spaces in the engine (timesteps, channels, baselines, antennas) are
/// defined against this context.
#[derive(Debug, Clone)]
pub struct ObsContext {
    /// The total number of antennas in the array, including any that the
    /// input flags remove entirely.
    pub num_ants: usize,

    /// The timestamps (centroids) of all timesteps, ascendingly sorted.
    pub timestamps: Vec1<Epoch>,

    /// The time resolution of the observation.
    pub time_res: Duration,

    /// The centroid frequencies of all fine channels, ascendingly sorted
    /// \[Hz\].
    pub freqs: Vec1<f64>,

    /// The frequency resolution of the observation \[Hz\].
    pub freq_res: f64,
}

impl ObsContext {
    pub fn num_timesteps(&self) -> usize {
        self.timestamps.len()
    }

    pub fn num_channels(&self) -> usize {
        self.freqs.len()
    }

    /// The number of cross-correlation baselines. Auto-correlations are not
    /// used for calibration.
    pub fn num_cross_baselines(&self) -> usize {
        num_cross_baselines(self.num_ants)
    }

    /// The (antenna1, antenna2) pair behind every baseline index, in
    /// upper-triangle order.
    pub fn baseline_pairs(&self) -> Vec<(usize, usize)> {
        baseline_pairs(self.num_ants)
    }
}
