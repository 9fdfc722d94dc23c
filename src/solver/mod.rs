// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The per-chunk iterative solver.
//!
//! Each chunk is solved by alternating StefCal-style updates over the gain
//! chain: for every term in order, the other terms are held fixed, the
//! per-antenna normal-equation blocks are accumulated over all weighted
//! baselines, and a damped, parameterisation-constrained update is applied.
//! The accumulator algebra follows equation 11 of Mitchell et al. 2008
//! <https://ui.adsabs.harvard.edu/abs/2008ISTSP...2..707M/abstract>,
//! generalised to carry per-datum weights and a chain of terms.
//!
//! This code runs inside one worker thread; nothing here is internally
//! parallel, which keeps per-chunk convergence deterministic.

mod error;
#[cfg(test)]
mod tests;

pub use error::SolveOptsError;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use itertools::izip;
use log::{debug, trace};
use marlu::{c64, Jones};
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::chain::{GainTerm, InitPolicy, TermChain};
use crate::flagging::{FlagPropagator, RobustKernel};
use crate::io::ChunkVis;
use crate::math::cexp;
use crate::planning::Chunk;

/// Settings for the iterative solve, validated before any chunk runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveOpts {
    /// The iteration cap per chunk.
    pub max_iterations: u32,

    /// Convergence is declared when the relative residual-norm decrease
    /// stays below this for two consecutive iterations.
    pub stop_tolerance: f64,

    /// Convergence is also declared outright when the weighted residual
    /// norm falls below this.
    pub abs_tolerance: f64,

    /// The number of consecutive residual-norm increases after which the
    /// solve is declared diverged.
    pub divergence_iters: u32,

    /// The damping factor applied to each update, in (0, 1]. 0.5 is the
    /// classic StefCal choice; 1.0 applies undamped updates.
    pub step_size: f64,

    /// If set, the phases of scalar terms (phase-only, diagonal) are
    /// re-referenced to this antenna after the solve, fixing the per-cell
    /// phase gauge.
    pub reference_antenna: Option<usize>,

    /// The outlier down-weighting strategy.
    pub robust: RobustKernel,

    /// An optional wall-clock budget per chunk. Exceeding it ends the solve
    /// with the best state so far, as if the iteration cap had been hit.
    pub timeout: Option<Duration>,
}

impl Default for SolveOpts {
    fn default() -> SolveOpts {
        SolveOpts {
            max_iterations: 50,
            stop_tolerance: 1e-6,
            abs_tolerance: 1e-10,
            divergence_iters: 3,
            step_size: 0.5,
            reference_antenna: None,
            robust: RobustKernel::default(),
            timeout: None,
        }
    }
}

impl SolveOpts {
    pub fn validate(&self, num_ants: usize) -> Result<(), SolveOptsError> {
        if self.max_iterations == 0 {
            return Err(SolveOptsError::NoIterations);
        }
        for &tol in &[self.stop_tolerance, self.abs_tolerance] {
            if !(tol.is_finite() && tol > 0.0) {
                return Err(SolveOptsError::BadTolerance(tol));
            }
        }
        if !(self.step_size > 0.0 && self.step_size <= 1.0) {
            return Err(SolveOptsError::BadStepSize(self.step_size));
        }
        if self.divergence_iters == 0 {
            return Err(SolveOptsError::NoDivergenceIters);
        }
        if let Some(ant) = self.reference_antenna {
            if ant >= num_ants {
                return Err(SolveOptsError::RefAntOutOfRange { ant, num_ants });
            }
        }
        Ok(())
    }
}

/// The terminal state of a chunk solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    /// The convergence criteria were met.
    Converged,

    /// The iteration cap (or wall-clock budget) was reached; the result is
    /// the best available estimate.
    MaxIterReached,

    /// The residual norm rose for too many consecutive iterations, or a
    /// non-finite value appeared; the result is the last finite state.
    Diverged,

    /// The chunk carried no unflagged data, so no iteration ran.
    Skipped,

    /// The solve was cancelled cooperatively between iterations.
    Cancelled,

    /// The chunk could not be solved at all (e.g. its data had the wrong
    /// shape). Only the scheduler produces this.
    Failed,
}

impl SolveStatus {
    /// Whether the solve converged. Anything else leaves `non_converged`
    /// set in the diagnostics.
    pub fn converged(self) -> bool {
        matches!(self, SolveStatus::Converged)
    }
}

/// A cooperative cancellation token, checked at the top of every solver
/// iteration. Cancelling affects in-flight and queued chunks; completed
/// chunks keep their results.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<AtomicCell<bool>>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load()
    }
}

/// One term's final state for a chunk.
pub(crate) struct TermResult {
    /// Dimensions (time interval, freq interval, antenna). Entries marked
    /// unsolved hold identity; non-finite values never appear here.
    pub(crate) jones: Array3<Jones<f64>>,

    /// Which (interval, antenna) entries could not be solved.
    pub(crate) unsolved: Array3<bool>,
}

/// The outcome of solving (or skipping) one chunk.
pub struct ChunkSolution {
    pub chunk: Chunk,
    pub(crate) terms: Vec<TermResult>,
    pub status: SolveStatus,
    pub iterations: u32,
    pub residual_norm: f64,

    /// The fraction of (term, interval, antenna) entries that were solved.
    pub solved_fraction: f64,

    /// The chunk's final per-datum flags, input flags plus any the solve
    /// raised.
    pub flags: Array3<bool>,
}

/// Initial values for a chunk with a completed time predecessor: per term,
/// the predecessor's final time-interval row, dimensions (freq interval,
/// antenna).
pub(crate) struct WarmStart {
    pub(crate) per_term: Vec<Array2<Jones<f64>>>,
}

impl WarmStart {
    pub(crate) fn from_solution(solution: &ChunkSolution) -> WarmStart {
        WarmStart {
            per_term: solution
                .terms
                .iter()
                .map(|term| {
                    let last = term.jones.len_of(Axis(0)) - 1;
                    term.jones.slice(s![last, .., ..]).to_owned()
                })
                .collect(),
        }
    }
}

/// Maps a chunk's local (timestep, channel) indices onto one term's local
/// solution-interval cells.
struct TermLayout {
    t_map: Vec<usize>,
    f_map: Vec<usize>,
    num_t_ints: usize,
    num_f_ints: usize,
}

impl TermLayout {
    fn new(chunk: &Chunk, term: &GainTerm) -> TermLayout {
        let t_offset = chunk.timesteps.start / term.time_interval;
        let t_map: Vec<usize> = chunk
            .timesteps
            .clone()
            .map(|t| t / term.time_interval - t_offset)
            .collect();
        let f_offset = chunk.channels.start / term.freq_interval;
        let f_map: Vec<usize> = chunk
            .channels
            .clone()
            .map(|f| f / term.freq_interval - f_offset)
            .collect();
        let num_t_ints = t_map.last().map(|&c| c + 1).unwrap_or(0);
        let num_f_ints = f_map.last().map(|&c| c + 1).unwrap_or(0);
        TermLayout {
            t_map,
            f_map,
            num_t_ints,
            num_f_ints,
        }
    }

    /// The local timestep range behind a local time-interval cell.
    fn t_range(&self, cell: usize) -> std::ops::Range<usize> {
        let start = self.t_map.iter().position(|&c| c == cell).unwrap_or(0);
        let end = self.t_map.iter().rposition(|&c| c == cell).map(|i| i + 1).unwrap_or(0);
        start..end
    }

    fn f_range(&self, cell: usize) -> std::ops::Range<usize> {
        let start = self.f_map.iter().position(|&c| c == cell).unwrap_or(0);
        let end = self.f_map.iter().rposition(|&c| c == cell).map(|i| i + 1).unwrap_or(0);
        start..end
    }
}

/// Multiply every element of a scalar-diagonal Jones matrix by a unit
/// complex number. Used for reference-antenna phase rotation.
fn rotate(jones: Jones<f64>, rot: c64) -> Jones<f64> {
    Jones::from([jones[0] * rot, jones[1] * rot, jones[2] * rot, jones[3] * rot])
}

/// Solve one chunk over the whole gain chain. Always returns a solution;
/// numerical trouble is contained here and reported through the status and
/// the per-antenna unsolved masks, never as non-finite values.
#[allow(clippy::too_many_arguments)]
pub(crate) fn solve_chunk(
    chunk: &Chunk,
    vis: &ChunkVis,
    mut prop: FlagPropagator,
    chain: &TermChain,
    num_ants: usize,
    baseline_pairs: &[(usize, usize)],
    opts: &SolveOpts,
    warm: Option<&WarmStart>,
    cancel: &CancelToken,
) -> ChunkSolution {
    let start_time = Instant::now();
    let (num_t, num_f, num_bl) = vis.data.dim();
    debug_assert_eq!(num_bl, baseline_pairs.len());

    if prop.all_flagged() {
        debug!("Chunk {}: entirely flagged, skipping the solve", chunk.id);
        return skipped_solution(chunk, chain, num_ants, prop.into_flags(), SolveStatus::Skipped);
    }

    let layouts: Vec<TermLayout> = chain
        .terms()
        .iter()
        .map(|term| TermLayout::new(chunk, term))
        .collect();

    // Working copies of the visibilities in double precision.
    let data = vis.data.mapv(|j| Jones::<f64>::from(j));
    let model = vis.model.mapv(|j| Jones::<f64>::from(j));

    // Per-term parameter state, identity or warm-started.
    let mut states: Vec<Array3<Jones<f64>>> = chain
        .terms()
        .iter()
        .zip(layouts.iter())
        .enumerate()
        .map(|(i_term, (term, layout))| {
            let mut state = Array3::from_elem(
                (layout.num_t_ints, layout.num_f_ints, num_ants),
                Jones::identity(),
            );
            if term.initial == InitPolicy::WarmStart {
                if let Some(row) = warm.and_then(|w| w.per_term.get(i_term)) {
                    if row.dim() == (layout.num_f_ints, num_ants) {
                        for mut t_row in state.outer_iter_mut() {
                            t_row.assign(row);
                        }
                    }
                }
            }
            state
        })
        .collect();
    let mut failed: Vec<Array3<bool>> = layouts
        .iter()
        .map(|l| Array3::from_elem((l.num_t_ints, l.num_f_ints, num_ants), false))
        .collect();

    // Normal-equation accumulators, reused across iterations.
    let mut tops: Vec<Array3<Jones<f64>>> = layouts
        .iter()
        .map(|l| Array3::default((l.num_t_ints, l.num_f_ints, num_ants)))
        .collect();
    let mut bots = tops.clone();

    let mut weights = Array3::zeros((num_t, num_f, num_bl));
    let mut resid_prev = Array3::zeros((num_t, num_f, num_bl));
    let mut resid_cur = Array3::zeros((num_t, num_f, num_bl));

    // The pre-iteration residual norm is the baseline for convergence
    // tracking and for reverting bad steps.
    prop.iteration_weights(None, &mut weights);
    let initial_norm = compute_residuals(
        &data,
        &model,
        &states,
        &layouts,
        baseline_pairs,
        &weights,
        &mut resid_cur,
    );
    let mut best_norm = initial_norm;
    let mut best_states = states.clone();
    let mut prev_norm = initial_norm;
    let mut status = if initial_norm <= opts.abs_tolerance {
        Some(SolveStatus::Converged)
    } else {
        None
    };

    let mut iterations = 0;
    let mut stall_count = 0u32;
    let mut rise_count = 0u32;
    while status.is_none() && iterations < opts.max_iterations {
        if cancel.is_cancelled() {
            if iterations == 0 {
                return skipped_solution(
                    chunk,
                    chain,
                    num_ants,
                    prop.into_flags(),
                    SolveStatus::Cancelled,
                );
            }
            status = Some(SolveStatus::Cancelled);
            break;
        }
        if let Some(timeout) = opts.timeout {
            if start_time.elapsed() >= timeout {
                debug!("Chunk {}: wall-clock budget exhausted", chunk.id);
                status = Some(SolveStatus::MaxIterReached);
                break;
            }
        }
        iterations += 1;

        std::mem::swap(&mut resid_prev, &mut resid_cur);
        let prev = if iterations == 1 { None } else { Some(&resid_prev) };
        prop.iteration_weights(prev, &mut weights);

        // Block-coordinate pass over the chain.
        for i_term in 0..chain.len() {
            update_term(
                i_term,
                chain,
                &data,
                &model,
                &mut states,
                &mut failed,
                &layouts,
                baseline_pairs,
                &weights,
                &mut tops[i_term],
                &mut bots[i_term],
                opts.step_size,
            );
        }

        // If every antenna of some term failed, no further update can
        // succeed; bail out with what we have.
        if failed.iter().any(|f| f.iter().all(|&x| x)) {
            debug!("Chunk {}: all antenna solutions failed", chunk.id);
            status = Some(SolveStatus::Diverged);
            break;
        }

        let norm = compute_residuals(
            &data,
            &model,
            &states,
            &layouts,
            baseline_pairs,
            &weights,
            &mut resid_cur,
        );
        trace!("Chunk {}: iteration {iterations}, residual norm {norm:e}", chunk.id);

        if !norm.is_finite() {
            status = Some(SolveStatus::Diverged);
            break;
        }
        if norm < best_norm {
            best_norm = norm;
            for (best, state) in best_states.iter_mut().zip(states.iter()) {
                best.assign(state);
            }
        }
        if norm <= opts.abs_tolerance {
            status = Some(SolveStatus::Converged);
            break;
        }
        let rel_decrease = if prev_norm > 0.0 {
            (prev_norm - norm) / prev_norm
        } else {
            0.0
        };
        if rel_decrease.abs() < opts.stop_tolerance {
            // Stalled: the norm changed by less than the tolerance in either
            // direction (numerical noise at the residual floor included).
            rise_count = 0;
            stall_count += 1;
            if stall_count >= 2 {
                status = Some(SolveStatus::Converged);
            }
        } else if norm <= prev_norm {
            stall_count = 0;
            rise_count = 0;
        } else {
            stall_count = 0;
            rise_count += 1;
            if rise_count >= opts.divergence_iters {
                debug!(
                    "Chunk {}: residual norm rose for {rise_count} consecutive iterations, reverting",
                    chunk.id
                );
                status = Some(SolveStatus::Diverged);
            }
        }
        prev_norm = norm;
    }
    let status = status.unwrap_or(SolveStatus::MaxIterReached);

    // Whatever the terminal state, the reported parameters are the best
    // finite state observed.
    states = best_states;

    finalise(
        chunk, prop, chain, num_ants, baseline_pairs, opts, states, failed, status, iterations,
        best_norm, layouts,
    )
}

/// Accumulate one term's weighted normal-equation blocks and apply a
/// damped, constrained update, holding all other terms fixed.
#[allow(clippy::too_many_arguments)]
fn update_term(
    i_term: usize,
    chain: &TermChain,
    data: &Array3<Jones<f64>>,
    model: &Array3<Jones<f64>>,
    states: &mut [Array3<Jones<f64>>],
    failed: &mut [Array3<bool>],
    layouts: &[TermLayout],
    baseline_pairs: &[(usize, usize)],
    weights: &Array3<f32>,
    top: &mut Array3<Jones<f64>>,
    bot: &mut Array3<Jones<f64>>,
    step_size: f64,
) {
    let kind = chain.terms()[i_term].kind;
    top.fill(Jones::default());
    bot.fill(Jones::default());

    for ((t, f, bl), &weight) in weights.indexed_iter() {
        if weight <= 0.0 {
            continue;
        }
        let w = f64::from(weight);
        let (ant1, ant2) = baseline_pairs[bl];

        // Fold the preceding terms into the data and the following terms
        // into the model, leaving only this term between them.
        let mut d = data[(t, f, bl)];
        let mut m = model[(t, f, bl)];
        for (j, (state, layout)) in states.iter().zip(layouts.iter()).enumerate() {
            if j == i_term {
                continue;
            }
            let g1 = state[(layout.t_map[t], layout.f_map[f], ant1)];
            let g2 = state[(layout.t_map[t], layout.f_map[f], ant2)];
            if j < i_term {
                d = g1.inv() * d * g2.inv().h();
            } else {
                m = g1 * m * g2.h();
            }
        }
        if d.any_nan() {
            continue;
        }

        let layout = &layouts[i_term];
        let cell = (layout.t_map[t], layout.f_map[f]);
        let state = &states[i_term];

        // Antenna 1: ( D G2 M^H ) against ( (G2 M^H)^H (G2 M^H) ).
        let z = state[(cell.0, cell.1, ant2)] * m.h();
        top[(cell.0, cell.1, ant1)] += (d * z) * w;
        bot[(cell.0, cell.1, ant1)] += (z.h() * z) * w;

        // Antenna 2: ( D^H G1 M ) against ( (G1 M)^H (G1 M) ).
        let z = state[(cell.0, cell.1, ant1)] * m;
        top[(cell.0, cell.1, ant2)] += (d.h() * z) * w;
        bot[(cell.0, cell.1, ant2)] += (z.h() * z) * w;
    }

    // Damped, constrained update per (cell, antenna). Singular systems mark
    // the antenna failed for that cell; its previous value is kept so that
    // no non-finite value can enter the state.
    let state = &mut states[i_term];
    let failed = &mut failed[i_term];
    for ((idx, gain), (&top, &bot)) in state
        .indexed_iter_mut()
        .zip(top.iter().zip(bot.iter()))
    {
        if failed[idx] {
            continue;
        }
        let candidate = kind.constrain(top * bot.inv());
        if candidate.any_nan() {
            failed[idx] = true;
            continue;
        }
        let mixed = *gain * (1.0 - step_size) + candidate * step_size;
        let damped = kind.constrain(mixed);
        *gain = if damped.any_nan() { candidate } else { damped };
    }
}

/// The weighted RMS residual norm over a chunk, also storing each datum's
/// residual magnitude for the next iteration's robust weighting.
fn compute_residuals(
    data: &Array3<Jones<f64>>,
    model: &Array3<Jones<f64>>,
    states: &[Array3<Jones<f64>>],
    layouts: &[TermLayout],
    baseline_pairs: &[(usize, usize)],
    weights: &Array3<f32>,
    resid_mag: &mut Array3<f64>,
) -> f64 {
    let mut sum = 0.0;
    let mut weight_sum = 0.0;
    for ((t, f, bl), mag) in resid_mag.indexed_iter_mut() {
        // Zero-weight data is excluded entirely; it may be non-finite, and
        // even multiplied by zero that would poison the norm.
        let w = f64::from(weights[(t, f, bl)]);
        if w <= 0.0 {
            *mag = 0.0;
            continue;
        }
        let (ant1, ant2) = baseline_pairs[bl];
        let mut a1 = Jones::identity();
        let mut a2 = Jones::identity();
        for (state, layout) in states.iter().zip(layouts.iter()) {
            a1 = a1 * state[(layout.t_map[t], layout.f_map[f], ant1)];
            a2 = a2 * state[(layout.t_map[t], layout.f_map[f], ant2)];
        }
        let r = data[(t, f, bl)] - a1 * model[(t, f, bl)] * a2.h();
        let mag2 = r[0].norm_sqr() + r[1].norm_sqr() + r[2].norm_sqr() + r[3].norm_sqr();
        *mag = mag2.sqrt();
        sum += w * mag2;
        weight_sum += w;
    }
    if weight_sum > 0.0 {
        (sum / weight_sum).sqrt()
    } else {
        0.0
    }
}

/// Turn the terminal solver state into a [`ChunkSolution`]: re-reference
/// phases, merge the failure and zero-weight masks, replace unsolved
/// entries with identity and raise flags for them.
#[allow(clippy::too_many_arguments)]
fn finalise(
    chunk: &Chunk,
    mut prop: FlagPropagator,
    chain: &TermChain,
    num_ants: usize,
    baseline_pairs: &[(usize, usize)],
    opts: &SolveOpts,
    mut states: Vec<Array3<Jones<f64>>>,
    failed: Vec<Array3<bool>>,
    status: SolveStatus,
    iterations: u32,
    residual_norm: f64,
    layouts: Vec<TermLayout>,
) -> ChunkSolution {
    let mut terms = Vec::with_capacity(chain.len());
    let mut num_entries = 0usize;
    let mut num_unsolved = 0usize;

    for (term, mut state, failed, layout) in
        izip!(chain.terms().iter(), states.drain(..), failed.into_iter(), layouts.iter())
    {
        // An antenna with no effective weight over a whole solution
        // interval cannot be solved there, whether or not the update loop
        // noticed.
        let cell_weights = prop.antenna_cell_weights(
            term.time_interval,
            term.freq_interval,
            num_ants,
            baseline_pairs,
        );
        let mut unsolved = failed;
        for (idx, unsolved) in unsolved.indexed_iter_mut() {
            if cell_weights[idx] <= 0.0 {
                *unsolved = true;
            }
            if state[idx].any_nan() {
                *unsolved = true;
            }
        }

        // Reference-antenna phase rotation for the scalar kinds.
        if let Some(ref_ant) = opts.reference_antenna {
            if term.kind.num_params() <= 2 {
                for t_cell in 0..layout.num_t_ints {
                    for f_cell in 0..layout.num_f_ints {
                        if unsolved[(t_cell, f_cell, ref_ant)] {
                            continue;
                        }
                        let ref_phase = state[(t_cell, f_cell, ref_ant)][0].arg();
                        let rot = cexp(-ref_phase);
                        for ant in 0..num_ants {
                            let idx = (t_cell, f_cell, ant);
                            state[idx] = rotate(state[idx], rot);
                        }
                    }
                }
            }
        }

        // Unsolved entries carry identity, never NaN; the assembler's
        // fallback pass replaces them where a neighbour exists. Their data
        // is flagged so downstream consumers see the loss.
        for ((t_cell, f_cell, ant), &u) in unsolved.indexed_iter() {
            if u {
                state[(t_cell, f_cell, ant)] = Jones::identity();
                prop.flag_antenna(
                    ant,
                    layout.t_range(t_cell),
                    layout.f_range(f_cell),
                    baseline_pairs,
                );
            }
        }

        num_entries += unsolved.len();
        num_unsolved += unsolved.iter().filter(|&&u| u).count();
        terms.push(TermResult {
            jones: state,
            unsolved,
        });
    }

    let solved_fraction = if num_entries > 0 {
        1.0 - num_unsolved as f64 / num_entries as f64
    } else {
        0.0
    };
    ChunkSolution {
        chunk: chunk.clone(),
        terms,
        status,
        iterations,
        residual_norm,
        solved_fraction,
        flags: prop.into_flags(),
    }
}

/// A solution for a chunk that never ran: identity parameters, everything
/// unsolved.
pub(crate) fn skipped_solution(
    chunk: &Chunk,
    chain: &TermChain,
    num_ants: usize,
    flags: Array3<bool>,
    status: SolveStatus,
) -> ChunkSolution {
    let terms = chain
        .terms()
        .iter()
        .map(|term| {
            let layout = TermLayout::new(chunk, term);
            let dim = (layout.num_t_ints, layout.num_f_ints, num_ants);
            TermResult {
                jones: Array3::from_elem(dim, Jones::identity()),
                unsolved: Array3::from_elem(dim, true),
            }
        })
        .collect();
    ChunkSolution {
        chunk: chunk.clone(),
        terms,
        status,
        iterations: 0,
        residual_norm: 0.0,
        solved_fraction: 0.0,
        flags,
    }
}
