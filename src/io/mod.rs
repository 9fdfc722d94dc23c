// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The chunk-addressable visibility accessor.
//!
//! The engine never touches the underlying columnar dataset; an external
//! collaborator implements [`VisAccess`] and serves dimensionally-aligned
//! arrays per chunk. [`MemoryVisAccess`] is the in-memory implementation
//! used by tests and simulated observations.

mod error;

pub use error::VisAccessError;

use marlu::Jones;
use ndarray::prelude::*;

use crate::planning::Chunk;

/// The visibilities, model visibilities, noise weights and flags for one
/// chunk. All arrays have dimensions (timestep, channel, baseline) and are
/// aligned with each other; `verify_shape` enforces this against the chunk
/// descriptor before any solve begins.
pub struct ChunkVis {
    /// Observed visibilities.
    pub data: Array3<Jones<f32>>,

    /// Model visibilities predicted for the same sub-grid.
    pub model: Array3<Jones<f32>>,

    /// Per-datum noise weights (inverse variance, arbitrary scale; the
    /// solver normalises them).
    pub weights: Array3<f32>,

    /// Per-datum input flags. `true` means the datum takes no part in
    /// calibration.
    pub flags: Array3<bool>,
}

impl ChunkVis {
    /// Check every array against the chunk descriptor. A mismatch is fatal
    /// for the chunk (the scheduler logs it and marks the chunk's cells
    /// unsolved), but never for the run.
    pub fn verify_shape(&self, chunk: &Chunk, num_baselines: usize) -> Result<(), VisAccessError> {
        let want = (chunk.num_timesteps(), chunk.num_channels(), num_baselines);
        for (name, dim) in [
            ("data", self.data.dim()),
            ("model", self.model.dim()),
            ("weights", self.weights.dim()),
            ("flags", self.flags.dim()),
        ] {
            if dim != want {
                return Err(VisAccessError::ShapeMismatch {
                    chunk: chunk.id.to_string(),
                    array: name,
                    got_t: dim.0,
                    got_f: dim.1,
                    got_bl: dim.2,
                    want_t: want.0,
                    want_f: want.1,
                    want_bl: want.2,
                });
            }
        }
        Ok(())
    }
}

/// Chunk-addressable access to an observation's visibilities. Implementors
/// must be thread-safe; the scheduler reads chunks from worker threads.
pub trait VisAccess: Send + Sync {
    fn read_chunk(&self, chunk: &Chunk) -> Result<ChunkVis, VisAccessError>;
}

/// A [`VisAccess`] over full-extent in-memory arrays.
pub struct MemoryVisAccess {
    data: Array3<Jones<f32>>,
    model: Array3<Jones<f32>>,
    weights: Array3<f32>,
    flags: Array3<bool>,
}

impl MemoryVisAccess {
    /// All arrays must share the dimensions (timestep, channel, baseline).
    pub fn new(
        data: Array3<Jones<f32>>,
        model: Array3<Jones<f32>>,
        weights: Array3<f32>,
        flags: Array3<bool>,
    ) -> Result<MemoryVisAccess, VisAccessError> {
        let dim = data.dim();
        for (name, other) in [
            ("model", model.dim()),
            ("weights", weights.dim()),
            ("flags", flags.dim()),
        ] {
            if other != dim {
                return Err(VisAccessError::MismatchedArrays {
                    data: dim,
                    other: name,
                    other_dim: other,
                });
            }
        }
        Ok(MemoryVisAccess {
            data,
            model,
            weights,
            flags,
        })
    }

    /// Unflagged, unit-weight access for simulated data.
    pub fn new_unflagged(
        data: Array3<Jones<f32>>,
        model: Array3<Jones<f32>>,
    ) -> Result<MemoryVisAccess, VisAccessError> {
        let dim = data.dim();
        Self::new(
            data,
            model,
            Array3::ones(dim),
            Array3::from_elem(dim, false),
        )
    }
}

impl VisAccess for MemoryVisAccess {
    fn read_chunk(&self, chunk: &Chunk) -> Result<ChunkVis, VisAccessError> {
        let (num_t, num_f, _) = self.data.dim();
        if chunk.timesteps.end > num_t || chunk.channels.end > num_f {
            return Err(VisAccessError::OutOfRange {
                chunk: chunk.id.to_string(),
                want_t: chunk.timesteps.clone(),
                want_f: chunk.channels.clone(),
                num_t,
                num_f,
            });
        }
        let range = s![chunk.timesteps.clone(), chunk.channels.clone(), ..];
        Ok(ChunkVis {
            data: self.data.slice(range).to_owned(),
            model: self.model.slice(range).to_owned(),
            weights: self.weights.slice(range).to_owned(),
            flags: self.flags.slice(range).to_owned(),
        })
    }
}
