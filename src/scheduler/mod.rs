// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dispatching chunk solves across worker threads.
//!
//! Chunks are nodes of a dependency DAG. Without warm starting the graph
//! has no edges and every chunk is immediately eligible; with warm starting
//! each chunk depends on the chunk covering the preceding time intervals of
//! the same frequency range, whose final solutions seed its parameters.
//! Ready chunks are fed to scoped worker threads over a channel, results
//! come back over another, and the single-threaded dispatch loop both
//! unlocks dependants and feeds the assembler, the only writer of the
//! solution table. The table is only finalised once every chunk has
//! completed or definitively failed.


use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, RecvTimeoutError};
use crossbeam_utils::atomic::AtomicCell;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use scopeguard::defer_on_unwind;

use crate::chain::TermChain;
use crate::context::ObsContext;
use crate::error::ChaincalError;
use crate::flagging::FlagPropagator;
use crate::io::{VisAccess, VisAccessError};
use crate::planning::{plan_chunks, Chunk, ChunkId};
use crate::solutions::{SolutionAssembler, SolutionTable};
use crate::solver::{solve_chunk, CancelToken, ChunkSolution, SolveOpts, WarmStart};
use crate::PROGRESS_BARS;

/// The warm-start dependency DAG over chunk ids.
pub struct DependencyGraph {
    /// Chunks unlocked by each chunk's completion.
    children: HashMap<ChunkId, Vec<ChunkId>>,

    /// The number of unfinished dependencies per chunk.
    num_pending: HashMap<ChunkId, usize>,
}

impl DependencyGraph {
    /// Build the DAG for a chunk plan. `warm_start` decides whether time
    /// edges exist at all.
    pub fn new(chunks: &[Chunk], warm_start: bool) -> DependencyGraph {
        let mut children: HashMap<ChunkId, Vec<ChunkId>> = HashMap::new();
        let mut num_pending: HashMap<ChunkId, usize> = HashMap::new();
        for chunk in chunks {
            let mut pending = 0;
            if warm_start && chunk.id.time > 0 {
                let parent = ChunkId {
                    time: chunk.id.time - 1,
                    freq: chunk.id.freq,
                };
                children.entry(parent).or_default().push(chunk.id);
                pending = 1;
            }
            num_pending.insert(chunk.id, pending);
        }
        DependencyGraph {
            children,
            num_pending,
        }
    }

    pub fn children_of(&self, id: ChunkId) -> &[ChunkId] {
        self.children.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn num_dependencies(&self, id: ChunkId) -> usize {
        self.num_pending.get(&id).copied().unwrap_or(0)
    }
}

struct Task {
    chunk: Chunk,
    warm: Option<Arc<WarmStart>>,
}

enum Outcome {
    Solved(Box<ChunkSolution>),
    Failed { chunk: Chunk, error: VisAccessError },
}

/// Calibrate a whole observation: plan the chunk grid, solve every chunk
/// across the available parallelism (respecting warm-start ordering), and
/// assemble the merged, fallback-filled solution table.
///
/// Per-chunk failures are isolated: they're logged, recorded in the
/// diagnostics and their cells are filled by the assembler's fallback pass.
/// Only configuration errors (surfaced before any chunk runs) and total
/// coverage loss abort the run.
pub fn run_solve(
    accessor: &dyn VisAccess,
    obs: &ObsContext,
    chain: &TermChain,
    opts: &SolveOpts,
    max_chunk_elems: usize,
    cancel: &CancelToken,
) -> Result<SolutionTable, ChaincalError> {
    opts.validate(obs.num_ants)?;
    let chunks = plan_chunks(obs, chain, max_chunk_elems)?;
    let warm_start = chain.warm_start();
    let graph = DependencyGraph::new(&chunks, warm_start);
    let baseline_pairs = obs.baseline_pairs();

    let total = chunks.len();
    let num_workers = rayon::current_num_threads().clamp(1, total);
    info!(
        "Solving {total} chunk(s) with {num_workers} worker(s){}",
        if warm_start { ", warm-started in time" } else { "" }
    );

    let (task_tx, task_rx) = unbounded::<Task>();
    let (result_tx, result_rx) = unbounded::<Outcome>();
    let panicked = AtomicCell::new(false);
    let mut assembler = SolutionAssembler::new(obs, chain);
    let progress = make_progress_bar(total);

    thread::scope(|scope| -> Result<(), ChaincalError> {
        for i in 0..num_workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let panicked = &panicked;
            let baseline_pairs = baseline_pairs.as_slice();
            thread::Builder::new()
                .name(format!("solver-{i}"))
                .spawn_scoped(scope, move || {
                    defer_on_unwind! { panicked.store(true); }
                    for task in task_rx.iter() {
                        let Task { chunk, warm } = task;
                        let outcome = match accessor
                            .read_chunk(&chunk)
                            .and_then(|vis| vis.verify_shape(&chunk, baseline_pairs.len()).map(|()| vis))
                        {
                            Err(error) => Outcome::Failed { chunk, error },
                            Ok(vis) => {
                                let prop = FlagPropagator::new(&vis, opts.robust);
                                Outcome::Solved(Box::new(solve_chunk(
                                    &chunk,
                                    &vis,
                                    prop,
                                    chain,
                                    obs.num_ants,
                                    baseline_pairs,
                                    opts,
                                    warm.as_deref(),
                                    cancel,
                                )))
                            }
                        };
                        if result_tx.send(outcome).is_err() {
                            return;
                        }
                    }
                })
                .expect("OS can create threads");
        }
        // The dispatch loop holds the only remaining sender ends.
        drop(result_tx);

        // Seed every chunk without dependencies.
        let mut waiting: HashMap<ChunkId, Chunk> = HashMap::new();
        for chunk in chunks.iter() {
            if graph.num_dependencies(chunk.id) == 0 {
                task_tx
                    .send(Task {
                        chunk: chunk.clone(),
                        warm: None,
                    })
                    .expect("workers outlive dispatch");
            } else {
                waiting.insert(chunk.id, chunk.clone());
            }
        }

        let mut num_pending: HashMap<ChunkId, usize> = chunks
            .iter()
            .map(|c| (c.id, graph.num_dependencies(c.id)))
            .collect();
        let mut warm_starts: HashMap<ChunkId, Arc<WarmStart>> = HashMap::new();
        let mut completed: Vec<ChunkId> = Vec::with_capacity(total);

        while completed.len() < total {
            let outcome = match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => {
                    if panicked.load() {
                        // A worker died; stop waiting for results that will
                        // never arrive. Unfinished chunks are recorded below.
                        break;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let finished_id = match outcome {
                Outcome::Solved(solution) => {
                    let id = solution.chunk.id;
                    debug!(
                        "Chunk {id}: {} after {} iteration(s), residual norm {:e}",
                        solution.status, solution.iterations, solution.residual_norm
                    );
                    if warm_start {
                        warm_starts.insert(id, Arc::new(WarmStart::from_solution(&solution)));
                    }
                    assembler.absorb(*solution)?;
                    id
                }
                Outcome::Failed { chunk, error } => {
                    let id = chunk.id;
                    assembler.record_failure(&chunk, error.to_string());
                    id
                }
            };
            completed.push(finished_id);
            progress.inc(1);

            for &child in graph.children_of(finished_id) {
                let pending = num_pending
                    .get_mut(&child)
                    .expect("children are planned chunks");
                *pending -= 1;
                if *pending == 0 {
                    let chunk = waiting.remove(&child).expect("child not yet dispatched");
                    let warm = warm_starts
                        .get(&ChunkId {
                            time: child.time - 1,
                            freq: child.freq,
                        })
                        .cloned();
                    task_tx
                        .send(Task { chunk, warm })
                        .expect("workers outlive dispatch");
                }
            }
        }
        // Closing the task channel lets the workers drain and exit.
        drop(task_tx);

        // Anything not completed by now is a definitive failure.
        for chunk in chunks.iter() {
            if !completed.contains(&chunk.id) {
                assembler.record_failure(chunk, "solver worker died before completion".to_string());
            }
        }
        Ok(())
    })?;
    progress.finish_and_clear();

    let table = assembler.finalise()?;
    let num_fallback = table.num_fallback_cells();
    if num_fallback > 0 {
        info!("{num_fallback} solution cell(s) were filled by fallback");
    }
    Ok(table)
}

fn make_progress_bar(num_chunks: usize) -> ProgressBar {
    ProgressBar::with_draw_target(
        Some(num_chunks as _),
        if PROGRESS_BARS.load() {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        },
    )
    .with_style(
        ProgressStyle::default_bar()
            .template("{msg}: [{wide_bar:.blue}] {pos:3}/{len:3} ({elapsed_precise}<{eta_precise})")
            .unwrap()
            .progress_chars("=> "),
    )
    .with_position(0)
    .with_message("Solving chunks")
}
