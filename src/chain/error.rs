// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("The gain-term chain is empty; at least one term is required")]
    Empty,

    #[error("Gain term '{name}' appears more than once in the chain; term names must be unique")]
    DuplicateName { name: String },

    #[error("Gain term '{name}' has a time solution-interval width of 0; widths must be at least 1 timestep")]
    ZeroTimeInterval { name: String },

    #[error("Gain term '{name}' has a frequency solution-interval width of 0; widths must be at least 1 channel")]
    ZeroFreqInterval { name: String },
}
