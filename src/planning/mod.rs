// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Partitioning an observation into solver chunks.
//!
//! A chunk is the unit of work handed to one solver invocation: a contiguous
//! (time range, channel range) sub-grid carrying every cross-correlation
//! baseline. Chunk boundaries are multiples of the least common multiple of
//! all chain terms' solution-interval widths, so a chunk never spans a
//! partial solution interval for any term (the final chunk along each axis
//! may contain a ragged final interval, which belongs to it alone).

mod error;

pub use error::PlanningError;

use std::fmt;
use std::ops::Range;

use log::debug;
use serde::{Deserialize, Serialize};
use vec1::Vec1;

use crate::chain::TermChain;
use crate::context::ObsContext;

/// A chunk's position in the planned (time, frequency) grid. Ordering is
/// lexicographic, time-major; the assembler uses this order to break ties
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub time: usize,
    pub freq: usize,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "t{:03}f{:03}", self.time, self.freq)
    }
}

/// An independent unit of observation data assigned to one solver
/// invocation. Immutable once planned.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,

    /// The global timestep indices this chunk covers.
    pub timesteps: Range<usize>,

    /// The global channel indices this chunk covers.
    pub channels: Range<usize>,
}

impl Chunk {
    pub fn num_timesteps(&self) -> usize {
        self.timesteps.end - self.timesteps.start
    }

    pub fn num_channels(&self) -> usize {
        self.channels.end - self.channels.start
    }

    /// The number of visibility elements in this chunk.
    pub fn num_elems(&self, num_baselines: usize) -> usize {
        self.num_timesteps() * self.num_channels() * num_baselines
    }
}

/// Plan the chunk grid for an observation and gain chain, keeping every
/// chunk under `max_chunk_elems` visibility elements.
///
/// When the whole observation fits in the budget a single chunk is
/// produced. Otherwise the time axis is subdivided first (down to the
/// interval-aligned minimum), then frequency; the baseline dimension is
/// never split, because the solver needs complete baseline sets per
/// (time, frequency) cell to keep the per-antenna systems well conditioned.
pub fn plan_chunks(
    obs: &ObsContext,
    chain: &TermChain,
    max_chunk_elems: usize,
) -> Result<Vec1<Chunk>, PlanningError> {
    if max_chunk_elems == 0 {
        return Err(PlanningError::ZeroBudget);
    }
    let num_timesteps = obs.num_timesteps();
    let num_channels = obs.num_channels();
    let num_baselines = obs.num_cross_baselines();
    if num_timesteps == 0 || num_channels == 0 || num_baselines == 0 {
        return Err(PlanningError::EmptyExtent);
    }
    if num_baselines > max_chunk_elems {
        return Err(PlanningError::BaselinesExceedBudget {
            num_baselines,
            budget: max_chunk_elems,
        });
    }

    // The smallest legal chunk dimensions: one interval-aligned block,
    // clipped to the observation extent.
    let block_t = chain.lcm_time_interval().min(num_timesteps);
    let block_f = chain.lcm_freq_interval().min(num_channels);
    if block_t * block_f * num_baselines > max_chunk_elems {
        return Err(PlanningError::IntervalBlockExceedsBudget {
            block_timesteps: block_t,
            block_channels: block_f,
            num_baselines,
            block_elems: block_t * block_f * num_baselines,
            budget: max_chunk_elems,
        });
    }

    // Subdivide time first: the largest block-aligned time span that fits
    // the budget with all channels. Only if even a single time block is too
    // big do we also subdivide frequency.
    let chunk_t = {
        let max_t = max_chunk_elems / (num_channels * num_baselines).max(1);
        let aligned = (max_t / block_t) * block_t;
        aligned.clamp(0, num_timesteps)
    };
    let (chunk_t, chunk_f) = if chunk_t >= block_t {
        (chunk_t.min(num_timesteps), num_channels)
    } else {
        let max_f = max_chunk_elems / (block_t * num_baselines);
        let aligned = ((max_f / block_f) * block_f).min(num_channels);
        // The minimal block fits the budget, so at least one frequency
        // block fits alongside the minimal time block.
        (block_t, aligned.max(block_f).min(num_channels))
    };

    let mut chunks = vec![];
    for (i_time, t_start) in (0..num_timesteps).step_by(chunk_t).enumerate() {
        let t_end = (t_start + chunk_t).min(num_timesteps);
        for (i_freq, f_start) in (0..num_channels).step_by(chunk_f).enumerate() {
            let f_end = (f_start + chunk_f).min(num_channels);
            chunks.push(Chunk {
                id: ChunkId {
                    time: i_time,
                    freq: i_freq,
                },
                timesteps: t_start..t_end,
                channels: f_start..f_end,
            });
        }
    }
    debug!(
        "Planned {} chunk(s) ({} × {} grid) of up to {} timesteps × {} channels × {} baselines",
        chunks.len(),
        chunks.last().map(|c| c.id.time + 1).unwrap_or(0),
        chunks.last().map(|c| c.id.freq + 1).unwrap_or(0),
        chunk_t,
        chunk_f,
        num_baselines
    );

    Ok(Vec1::try_from_vec(chunks).expect("extent is non-empty, so at least one chunk was planned"))
}
