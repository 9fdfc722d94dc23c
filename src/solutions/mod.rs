// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The global solution table and the assembler that builds it.
//!
//! Chunk results arrive in completion order; the assembler is the single
//! writer that merges them into per-term parameter grids keyed by
//! (antenna, time interval, frequency interval). After the join barrier a
//! fallback pass fills cells no chunk could solve from their nearest solved
//! neighbours (in time, then frequency), or with identity gains. Nothing is
//! left undefined, and every such cell is flagged.

mod error;

pub use error::AssemblyError;

use hifitime::Epoch;
use indexmap::IndexMap;
use log::{debug, warn};
use marlu::Jones;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use vec1::Vec1;

use crate::chain::{TermChain, TermKind};
use crate::context::ObsContext;
use crate::io::ChunkVis;
use crate::planning::{Chunk, ChunkId};
use crate::solver::{ChunkSolution, SolveStatus};

/// The provenance of one (term, antenna, interval) solution cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SolutionFlag {
    /// Solved by a converged chunk.
    Solved,

    /// Solved, but the chunk didn't meet the convergence criteria
    /// (iteration cap, divergence or cancellation).
    NonConverged,

    /// Copied from the nearest solved neighbouring interval.
    Fallback,

    /// No neighbour existed either; the cell holds the default identity
    /// gain.
    Unsolved,
}

impl SolutionFlag {
    /// Whether the cell holds a gain actually estimated from data.
    pub fn is_estimate(self) -> bool {
        matches!(self, SolutionFlag::Solved | SolutionFlag::NonConverged)
    }
}

/// Per-chunk information for the diagnostic summary. A completed run
/// reports one of these for every planned chunk; silent partial failure is
/// not an option.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkDiagnostic {
    pub chunk: ChunkId,
    pub status: SolveStatus,
    pub iterations: u32,
    pub residual_norm: f64,

    /// The fraction of (term, interval, antenna) entries this chunk solved.
    pub solved_fraction: f64,

    /// The fraction of the chunk's data flagged by the end of the solve.
    pub flagged_fraction: f64,

    /// Present when the chunk failed outright (e.g. mis-shaped data).
    pub note: Option<String>,
}

/// One term's solved parameters over the whole observation.
pub struct TermSolutions {
    pub kind: TermKind,
    pub time_interval: usize,
    pub freq_interval: usize,

    /// Packed real parameters, dimensions (time interval, freq interval,
    /// antenna, parameter). Never contains non-finite values.
    pub params: Array4<f64>,

    /// Dimensions (time interval, freq interval, antenna).
    pub flags: Array3<SolutionFlag>,

    /// The winning residual norm per (time, freq) cell; infinite where no
    /// chunk produced an estimate. Used for the overlap tie-break.
    residual_norms: Array2<f64>,

    /// The chunk that won each cell.
    winners: Array2<Option<ChunkId>>,
}

impl TermSolutions {
    pub fn num_time_ints(&self) -> usize {
        self.params.len_of(Axis(0))
    }

    pub fn num_freq_ints(&self) -> usize {
        self.params.len_of(Axis(1))
    }

    pub fn num_ants(&self) -> usize {
        self.params.len_of(Axis(2))
    }

    fn params_at(&self, t_int: usize, f_int: usize, ant: usize) -> Vec<f64> {
        self.params.slice(s![t_int, f_int, ant, ..]).to_vec()
    }

    /// The Jones matrix stored for a solution-interval cell.
    pub fn jones_at(&self, t_int: usize, f_int: usize, ant: usize) -> Jones<f64> {
        self.kind.jones_from_params(&self.params_at(t_int, f_int, ant))
    }

    /// The Jones matrix applying to a (timestep, channel) coordinate:
    /// nearest-interval lookup, clamped at the edges.
    pub fn jones_for(&self, timestep: usize, channel: usize, ant: usize) -> Jones<f64> {
        let t_int = (timestep / self.time_interval).min(self.num_time_ints() - 1);
        let f_int = (channel / self.freq_interval).min(self.num_freq_ints() - 1);
        self.jones_at(t_int, f_int, ant)
    }

    /// Sample the term at fractional (timestep, channel) coordinates,
    /// linearly interpolating the packed parameters between neighbouring
    /// interval centroids (clamped to nearest at the edges).
    pub fn sample_at(&self, timestep: f64, channel: f64, ant: usize) -> Jones<f64> {
        let (t0, t1, tw) = interp_cells(timestep, self.time_interval, self.num_time_ints());
        let (f0, f1, fw) = interp_cells(channel, self.freq_interval, self.num_freq_ints());
        let n = self.kind.num_params();
        let mut params = vec![0.0; n];
        for (cell_t, weight_t) in [(t0, 1.0 - tw), (t1, tw)] {
            for (cell_f, weight_f) in [(f0, 1.0 - fw), (f1, fw)] {
                let w = weight_t * weight_f;
                if w == 0.0 {
                    continue;
                }
                let p = self.params.slice(s![cell_t, cell_f, ant, ..]);
                for (out, &v) in params.iter_mut().zip(p.iter()) {
                    *out += w * v;
                }
            }
        }
        self.kind.jones_from_params(&params)
    }
}

/// For a fractional data coordinate, the two bracketing interval indices
/// and the weight of the upper one.
fn interp_cells(coord: f64, interval: usize, num_ints: usize) -> (usize, usize, f64) {
    // Interval centroids sit at (i + 0.5) * interval in data coordinates.
    let pos = coord / interval as f64 - 0.5;
    if pos <= 0.0 || num_ints == 1 {
        return (0, 0, 0.0);
    }
    let below = pos.floor() as usize;
    if below + 1 >= num_ints {
        return (num_ints - 1, num_ints - 1, 0.0);
    }
    (below, below + 1, pos - below as f64)
}

/// Corrected and residual visibilities for a chunk of data, produced from a
/// finalised [`SolutionTable`].
pub struct VisOutputs {
    /// `A_p^{-1} D A_q^{-H}`: the data with the solved gains removed.
    pub corrected: Array3<Jones<f32>>,

    /// `D − A_p M A_q^H`: the data minus the gain-corrupted model.
    pub residual: Array3<Jones<f32>>,
}

/// The finalised, immutable solution table: per-term parameter grids plus
/// the diagnostic records of every chunk.
pub struct SolutionTable {
    terms: IndexMap<String, TermSolutions>,

    /// The observation timestamps the time intervals are defined against.
    pub timestamps: Vec1<Epoch>,

    /// The observation channel frequencies \[Hz\].
    pub freqs: Vec1<f64>,

    diagnostics: Vec<ChunkDiagnostic>,
}

impl SolutionTable {
    pub fn term(&self, name: &str) -> Option<&TermSolutions> {
        self.terms.get(name)
    }

    /// The terms in chain order.
    pub fn iter_terms(&self) -> impl Iterator<Item = (&str, &TermSolutions)> {
        self.terms.iter().map(|(name, term)| (name.as_str(), term))
    }

    pub fn diagnostics(&self) -> &[ChunkDiagnostic] {
        &self.diagnostics
    }

    /// The number of cells that never received an estimate (flagged
    /// `Fallback` or `Unsolved`).
    pub fn num_fallback_cells(&self) -> usize {
        self.terms
            .values()
            .map(|t| t.flags.iter().filter(|f| !f.is_estimate()).count())
            .sum()
    }

    /// The chain product `A_p = T1·T2·…·Tn` for a (timestep, channel,
    /// antenna) coordinate.
    pub fn chain_gain(&self, timestep: usize, channel: usize, ant: usize) -> Jones<f64> {
        let mut gain = Jones::identity();
        for term in self.terms.values() {
            gain = gain * term.jones_for(timestep, channel, ant);
        }
        gain
    }

    /// Compute corrected and residual visibilities for one chunk's data.
    /// Data whose gains cannot be inverted is passed through uncorrected.
    pub fn apply(
        &self,
        vis: &ChunkVis,
        chunk: &Chunk,
        baseline_pairs: &[(usize, usize)],
    ) -> VisOutputs {
        let dim = vis.data.dim();
        let mut corrected = vis.data.clone();
        let mut residual = vis.data.clone();
        for ((t, f, bl), datum) in vis.data.indexed_iter() {
            let (ant1, ant2) = baseline_pairs[bl];
            let (global_t, global_f) = (chunk.timesteps.start + t, chunk.channels.start + f);
            let a1 = self.chain_gain(global_t, global_f, ant1);
            let a2 = self.chain_gain(global_t, global_f, ant2);
            let d = Jones::<f64>::from(*datum);
            let m = Jones::<f64>::from(vis.model[(t, f, bl)]);

            residual[(t, f, bl)] = Jones::<f32>::from(d - a1 * m * a2.h());
            let c = a1.inv() * d * a2.inv().h();
            if !c.any_nan() {
                corrected[(t, f, bl)] = Jones::<f32>::from(c);
            }
        }
        debug_assert_eq!(corrected.dim(), dim);
        VisOutputs {
            corrected,
            residual,
        }
    }
}

/// The single writer that merges chunk results into a [`SolutionTable`].
pub struct SolutionAssembler {
    chain: TermChain,
    num_ants: usize,
    timestamps: Vec1<Epoch>,
    freqs: Vec1<f64>,
    terms: IndexMap<String, TermSolutions>,
    diagnostics: Vec<ChunkDiagnostic>,
}

impl SolutionAssembler {
    pub fn new(obs: &ObsContext, chain: &TermChain) -> SolutionAssembler {
        let num_ants = obs.num_ants;
        let terms = chain
            .terms()
            .iter()
            .map(|term| {
                let num_t = term.num_time_ints(obs.num_timesteps());
                let num_f = term.num_freq_ints(obs.num_channels());
                let num_params = term.kind.num_params();
                let mut params = Array4::zeros((num_t, num_f, num_ants, num_params));
                let identity = identity_params(term.kind);
                for mut p in params.rows_mut() {
                    p.assign(&aview1(&identity));
                }
                (
                    term.name.clone(),
                    TermSolutions {
                        kind: term.kind,
                        time_interval: term.time_interval,
                        freq_interval: term.freq_interval,
                        params,
                        flags: Array3::from_elem((num_t, num_f, num_ants), SolutionFlag::Unsolved),
                        residual_norms: Array2::from_elem((num_t, num_f), f64::INFINITY),
                        winners: Array2::from_elem((num_t, num_f), None),
                    },
                )
            })
            .collect();
        SolutionAssembler {
            chain: chain.clone(),
            num_ants,
            timestamps: obs.timestamps.clone(),
            freqs: obs.freqs.clone(),
            terms,
            diagnostics: vec![],
        }
    }

    /// Record a chunk that never produced a solution (data access or shape
    /// failure). Its cells stay unsolved for the fallback pass.
    pub fn record_failure(&mut self, chunk: &Chunk, note: String) {
        warn!("Chunk {}: {note}", chunk.id);
        self.diagnostics.push(ChunkDiagnostic {
            chunk: chunk.id,
            status: SolveStatus::Failed,
            iterations: 0,
            residual_norm: 0.0,
            solved_fraction: 0.0,
            flagged_fraction: 0.0,
            note: Some(note),
        });
    }

    /// Merge one chunk's result. Results may arrive in any order; when two
    /// chunks cover the same cell the one with the lower residual norm wins,
    /// with the lexicographically smaller chunk id breaking exact ties.
    pub fn absorb(&mut self, solution: ChunkSolution) -> Result<(), AssemblyError> {
        if solution.terms.len() != self.chain.len() {
            return Err(AssemblyError::TermCountMismatch {
                chunk: solution.chunk.id.to_string(),
                got: solution.terms.len(),
                expected: self.chain.len(),
            });
        }

        self.diagnostics.push(ChunkDiagnostic {
            chunk: solution.chunk.id,
            status: solution.status,
            iterations: solution.iterations,
            residual_norm: solution.residual_norm,
            solved_fraction: solution.solved_fraction,
            flagged_fraction: {
                let len = solution.flags.len();
                if len == 0 {
                    0.0
                } else {
                    solution.flags.iter().filter(|&&f| f).count() as f64 / len as f64
                }
            },
            note: None,
        });

        // Skipped, failed and immediately-cancelled chunks carry no
        // estimates. A warm-started chunk converging without iterating does:
        // its initial parameters already fit the data.
        if solution.iterations == 0 && !solution.status.converged() {
            return Ok(());
        }

        let chunk = &solution.chunk;
        let ant_flag = match solution.status {
            SolveStatus::Converged => SolutionFlag::Solved,
            _ => SolutionFlag::NonConverged,
        };

        for (chain_term, result) in self.chain.terms().iter().zip(solution.terms.iter()) {
            let table = self
                .terms
                .get_mut(&chain_term.name)
                .expect("assembler terms mirror the chain");
            let t_offset = chunk.timesteps.start / chain_term.time_interval;
            let f_offset = chunk.channels.start / chain_term.freq_interval;
            let (num_local_t, num_local_f, _) = result.jones.dim();

            for local_t in 0..num_local_t {
                for local_f in 0..num_local_f {
                    let (t_int, f_int) = (t_offset + local_t, f_offset + local_f);
                    let held = table.residual_norms[(t_int, f_int)];
                    let wins = solution.residual_norm < held
                        || (solution.residual_norm == held
                            && table.winners[(t_int, f_int)]
                                .map(|w| chunk.id < w)
                                .unwrap_or(true));
                    if !wins {
                        debug!(
                            "Chunk {} lost cell ({t_int}, {f_int}) of term '{}' to chunk {}",
                            chunk.id,
                            chain_term.name,
                            table.winners[(t_int, f_int)]
                                .map(|w| w.to_string())
                                .unwrap_or_else(|| "<none>".to_string()),
                        );
                        continue;
                    }
                    table.residual_norms[(t_int, f_int)] = solution.residual_norm;
                    table.winners[(t_int, f_int)] = Some(chunk.id);

                    for ant in 0..self.num_ants {
                        let idx = (t_int, f_int, ant);
                        if result.unsolved[(local_t, local_f, ant)] {
                            table.flags[idx] = SolutionFlag::Unsolved;
                            let identity = identity_params(chain_term.kind);
                            table
                                .params
                                .slice_mut(s![t_int, f_int, ant, ..])
                                .assign(&aview1(&identity));
                        } else {
                            table.flags[idx] = ant_flag;
                            let jones = result.jones[(local_t, local_f, ant)];
                            let mut packed = vec![0.0; chain_term.kind.num_params()];
                            chain_term.kind.params_from_jones(jones, &mut packed);
                            table
                                .params
                                .slice_mut(s![t_int, f_int, ant, ..])
                                .assign(&aview1(&packed));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the fallback pass and freeze the table. Fails only if some term
    /// received no estimate anywhere, total coverage loss that fallback
    /// cannot paper over.
    pub fn finalise(mut self) -> Result<SolutionTable, AssemblyError> {
        for (name, term) in self.terms.iter_mut() {
            if !term.flags.iter().any(|f| f.is_estimate()) {
                return Err(AssemblyError::TermNeverSolved { name: name.clone() });
            }

            // Sources are the cells holding real estimates, snapshotted so a
            // fallback never copies another fallback.
            let sources = term.flags.clone();
            let (num_t, num_f, num_ants) = term.flags.dim();
            let mut num_filled = 0;
            for t_int in 0..num_t {
                for f_int in 0..num_f {
                    for ant in 0..num_ants {
                        if term.flags[(t_int, f_int, ant)] != SolutionFlag::Unsolved {
                            continue;
                        }
                        // Nearest solved interval in time, then frequency.
                        let source = nearest_source(&sources, t_int, f_int, ant, num_t, Axis(0))
                            .or_else(|| nearest_source(&sources, t_int, f_int, ant, num_f, Axis(1)));
                        if let Some((src_t, src_f)) = source {
                            let src = term.params.slice(s![src_t, src_f, ant, ..]).to_owned();
                            term.params
                                .slice_mut(s![t_int, f_int, ant, ..])
                                .assign(&src);
                            term.flags[(t_int, f_int, ant)] = SolutionFlag::Fallback;
                            num_filled += 1;
                        }
                        // No neighbour at all: the identity parameters from
                        // construction stand, still flagged unsolved.
                    }
                }
            }
            if num_filled > 0 {
                debug!("Term '{name}': filled {num_filled} cell(s) from neighbouring intervals");
            }
        }

        Ok(SolutionTable {
            terms: self.terms,
            timestamps: self.timestamps,
            freqs: self.freqs,
            diagnostics: self.diagnostics,
        })
    }
}

/// The packed identity-gain parameters for a term kind.
fn identity_params(kind: TermKind) -> Vec<f64> {
    let mut params = vec![0.0; kind.num_params()];
    kind.params_from_jones(Jones::identity(), &mut params);
    params
}

/// Search outwards along one axis for the nearest cell holding a real
/// estimate for this antenna, preferring the earlier side on ties.
fn nearest_source(
    flags: &Array3<SolutionFlag>,
    t_int: usize,
    f_int: usize,
    ant: usize,
    axis_len: usize,
    axis: Axis,
) -> Option<(usize, usize)> {
    let pos = if axis == Axis(0) { t_int } else { f_int };
    for dist in 1..axis_len {
        for candidate in [pos.checked_sub(dist), Some(pos + dist)].into_iter().flatten() {
            if candidate >= axis_len {
                continue;
            }
            let idx = if axis == Axis(0) {
                (candidate, f_int, ant)
            } else {
                (t_int, candidate, ant)
            };
            if flags[idx].is_estimate() {
                return Some((idx.0, idx.1));
            }
        }
    }
    None
}
