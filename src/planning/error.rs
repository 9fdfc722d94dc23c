// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlanningError {
    #[error("The chunk element budget is 0; cannot plan any chunks")]
    ZeroBudget,

    #[error("The observation has no timesteps, channels or baselines to calibrate")]
    EmptyExtent,

    #[error(
        "A single (timestep, channel) cell holds {num_baselines} baselines, more than the chunk \
         budget of {budget} elements; the baseline dimension cannot be subdivided"
    )]
    BaselinesExceedBudget { num_baselines: usize, budget: usize },

    #[error(
        "The minimal solution-interval-aligned block ({block_timesteps} timesteps × \
         {block_channels} channels × {num_baselines} baselines = {block_elems} elements) exceeds \
         the chunk budget of {budget} elements; reduce solution-interval widths or raise the budget"
    )]
    IntervalBlockExceedsBudget {
        block_timesteps: usize,
        block_channels: usize,
        num_baselines: usize,
        block_elems: usize,
        budget: usize,
    },
}
