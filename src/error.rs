// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all chaincal-related errors.

use thiserror::Error;

use crate::chain::ChainError;
use crate::io::VisAccessError;
use crate::planning::PlanningError;
use crate::solutions::AssemblyError;
use crate::solver::SolveOptsError;

#[derive(Error, Debug)]
pub enum ChaincalError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    SolveOpts(#[from] SolveOptsError),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    VisAccess(#[from] VisAccessError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}
