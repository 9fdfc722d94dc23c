// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolveOptsError {
    #[error("max_iterations is 0; at least one iteration is required")]
    NoIterations,

    #[error("The convergence tolerance {0} isn't a positive finite number")]
    BadTolerance(f64),

    #[error("The step size {0} must lie in (0, 1]")]
    BadStepSize(f64),

    #[error("divergence_iters is 0; at least one rising iteration must be observed before declaring divergence")]
    NoDivergenceIters,

    #[error("The reference antenna {ant} doesn't exist; the array has {num_ants} antennas")]
    RefAntOutOfRange { ant: usize, num_ants: usize },
}
