// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Solver scenario tests on synthetic visibilities.

use approx::assert_abs_diff_eq;
use marlu::Jones;
use ndarray::prelude::*;

use super::*;
use crate::chain::TermKind;
use crate::math::baseline_pairs;
use crate::tests::{corrupted_data, one_chunk, phase_gain, term, unflagged_vis};

fn solve_simple(
    vis: &ChunkVis,
    chain: &TermChain,
    num_ants: usize,
    opts: &SolveOpts,
    warm: Option<&WarmStart>,
) -> ChunkSolution {
    let (num_t, num_f, _) = vis.data.dim();
    let chunk = one_chunk(num_t, num_f);
    let pairs = baseline_pairs(num_ants);
    let prop = FlagPropagator::new(vis, opts.robust);
    solve_chunk(
        &chunk,
        vis,
        prop,
        chain,
        num_ants,
        &pairs,
        opts,
        warm,
        &CancelToken::new(),
    )
}

/// Data "four times as bright as the model": the per-antenna solutions
/// should be scalar 2s, as data and model are per baseline but gains are
/// per antenna.
#[test]
fn test_solve_trivial_amplitude() {
    let num_ants = 5;
    let num_bl = baseline_pairs(num_ants).len();
    let dim = (1, 1, num_bl);
    let data = Array3::from_elem(dim, Jones::identity() * 4.0);
    let model = Array3::from_elem(dim, Jones::identity());
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![term("G", TermKind::Diagonal, 1, 1)]).unwrap();
    let opts = SolveOpts::default();
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    assert_eq!(solution.status, SolveStatus::Converged);
    assert!(solution.iterations <= opts.max_iterations);
    assert!(solution.residual_norm < 1e-8);
    assert_abs_diff_eq!(solution.solved_fraction, 1.0);
    for ant in 0..num_ants {
        let jones = solution.terms[0].jones[(0, 0, ant)];
        assert_abs_diff_eq!(jones, Jones::identity() * 2.0, epsilon = 1e-6);
        assert!(!solution.terms[0].unsolved[(0, 0, ant)]);
    }
}

/// The known-gain round trip: antenna 2 carries a 0.3 rad phase offset,
/// everything else is zero. With a reference antenna the offset is
/// recovered to well within 1e-3.
#[test]
fn test_phase_offset_recovery() {
    let num_ants = 10;
    let pairs = baseline_pairs(num_ants);
    let dim = (1, 1, pairs.len());
    let model = Array3::from_elem(dim, Jones::identity());
    let data = corrupted_data(&model, &pairs, |_, _, ant| {
        phase_gain(if ant == 2 { 0.3 } else { 0.0 })
    });
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![term("P", TermKind::PhaseOnly, 1, 1)]).unwrap();
    let opts = SolveOpts {
        reference_antenna: Some(0),
        max_iterations: 100,
        ..Default::default()
    };
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    assert_eq!(solution.status, SolveStatus::Converged);
    for ant in 0..num_ants {
        assert!(!solution.terms[0].unsolved[(0, 0, ant)], "antenna {ant} unsolved");
        let est = solution.terms[0].jones[(0, 0, ant)][0].arg();
        let truth = if ant == 2 { 0.3 } else { 0.0 };
        assert!(
            (est - truth).abs() < 1e-3,
            "antenna {ant}: estimated {est}, expected {truth}"
        );
    }
}

/// End-to-end scenario: 10 antennas, one solution interval, phase-only
/// term, zero noise, known (distinct) true phases. Everything converges
/// and nothing is left `non_converged`.
#[test]
fn test_known_phases_all_converge() {
    let num_ants = 10;
    let pairs = baseline_pairs(num_ants);
    let dim = (1, 1, pairs.len());
    let model = Array3::from_elem(dim, Jones::identity());
    let truth = |ant: usize| 0.05 * ant as f64 - 0.2;
    let data = corrupted_data(&model, &pairs, |_, _, ant| phase_gain(truth(ant)));
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![term("P", TermKind::PhaseOnly, 1, 1)]).unwrap();
    let opts = SolveOpts {
        reference_antenna: Some(0),
        max_iterations: 100,
        ..Default::default()
    };
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    assert!(solution.status.converged());
    assert_abs_diff_eq!(solution.solved_fraction, 1.0);
    // Phases are recovered relative to the reference antenna.
    for ant in 0..num_ants {
        let est = solution.terms[0].jones[(0, 0, ant)][0].arg();
        let expected = truth(ant) - truth(0);
        assert!(
            (est - expected).abs() < 1e-4,
            "antenna {ant}: estimated {est}, expected {expected}"
        );
    }
}

/// Re-running an already-converged chunk from its own solutions is a fixed
/// point: the residual norm cannot meaningfully decrease further.
#[test]
fn test_warm_start_idempotence() {
    let num_ants = 6;
    let pairs = baseline_pairs(num_ants);
    let dim = (2, 2, pairs.len());
    let model = Array3::from_elem(dim, Jones::identity());
    let data = corrupted_data(&model, &pairs, |_, _, ant| phase_gain(0.1 * ant as f64));
    let vis = unflagged_vis(data, model);

    let mut warm_term = term("P", TermKind::PhaseOnly, 2, 2);
    warm_term.initial = crate::chain::InitPolicy::WarmStart;
    let chain = TermChain::new(vec![warm_term]).unwrap();
    let opts = SolveOpts {
        max_iterations: 100,
        ..Default::default()
    };

    let first = solve_simple(&vis, &chain, num_ants, &opts, None);
    assert_eq!(first.status, SolveStatus::Converged);

    let warm = WarmStart::from_solution(&first);
    let second = solve_simple(&vis, &chain, num_ants, &opts, Some(&warm));
    assert_eq!(second.status, SolveStatus::Converged);
    // Fixed point: no meaningful further decrease, and very few iterations.
    assert!(second.residual_norm <= first.residual_norm + 1e-12);
    assert!(second.iterations <= first.iterations);
}

/// A solve over multiple solution intervals recovers a different gain in
/// each cell.
#[test]
fn test_multiple_solution_intervals() {
    let num_ants = 6;
    let pairs = baseline_pairs(num_ants);
    // 4 timesteps, 2 channels; time interval 2 and freq interval 2 give a
    // 2×1 cell grid.
    let dim = (4, 2, pairs.len());
    let model = Array3::from_elem(dim, Jones::identity());
    let cell_phase = |t: usize, ant: usize| {
        let base = if t < 2 { 0.2 } else { -0.4 };
        if ant == 1 {
            base
        } else {
            0.0
        }
    };
    let data = corrupted_data(&model, &pairs, |t, _, ant| phase_gain(cell_phase(t, ant)));
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![term("P", TermKind::PhaseOnly, 2, 2)]).unwrap();
    let opts = SolveOpts {
        reference_antenna: Some(0),
        max_iterations: 100,
        ..Default::default()
    };
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    assert_eq!(solution.status, SolveStatus::Converged);
    assert_eq!(solution.terms[0].jones.dim(), (2, 1, num_ants));
    let est_first = solution.terms[0].jones[(0, 0, 1)][0].arg();
    let est_second = solution.terms[0].jones[(1, 0, 1)][0].arg();
    assert!((est_first - 0.2).abs() < 1e-4, "got {est_first}");
    assert!((est_second + 0.4).abs() < 1e-4, "got {est_second}");
}

/// A two-term chain (slow diagonal gain × per-channel phase) drives the
/// combined residual to zero without any non-finite values.
#[test]
fn test_two_term_chain_converges() {
    let num_ants = 8;
    let pairs = baseline_pairs(num_ants);
    let dim = (2, 4, pairs.len());
    let model = Array3::from_elem(dim, Jones::identity());
    let data = corrupted_data(&model, &pairs, |_, f, ant| {
        let amp = 1.0 + 0.1 * ant as f64;
        let theta = 0.05 * ant as f64 + 0.02 * f as f64;
        Jones::from([
            marlu::c64::from_polar(amp, theta),
            marlu::c64::default(),
            marlu::c64::default(),
            marlu::c64::from_polar(amp, theta),
        ])
    });
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![
        term("G", TermKind::Diagonal, 2, 4),
        term("P", TermKind::PhaseOnly, 2, 1),
    ])
    .unwrap();
    let opts = SolveOpts {
        max_iterations: 200,
        ..Default::default()
    };
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    assert_eq!(solution.status, SolveStatus::Converged);
    // The single-precision input quantises the injected gains, so the
    // residual plateaus near the f32 epsilon rather than reaching zero.
    assert!(solution.residual_norm < 1e-5, "residual {:e}", solution.residual_norm);
    for term_result in &solution.terms {
        for jones in term_result.jones.iter() {
            assert!(!jones.any_nan());
        }
    }
}

/// A full-Jones term recovers an injected polarised gain.
#[test]
fn test_full_jones_recovery() {
    let num_ants = 6;
    let pairs = baseline_pairs(num_ants);
    let dim = (1, 1, pairs.len());
    // A polarised model keeps the full 2×2 system well conditioned.
    let model = Array3::from_elem(
        dim,
        Jones::<f32>::from(Jones::from([
            marlu::c64::new(1.0, 0.0),
            marlu::c64::new(0.1, 0.05),
            marlu::c64::new(0.1, -0.05),
            marlu::c64::new(0.8, 0.0),
        ])),
    );
    let gain = |ant: usize| {
        Jones::from([
            marlu::c64::new(1.0 + 0.05 * ant as f64, 0.02 * ant as f64),
            marlu::c64::default(),
            marlu::c64::default(),
            marlu::c64::new(1.0 - 0.03 * ant as f64, -0.01 * ant as f64),
        ])
    };
    let data = corrupted_data(&model, &pairs, |_, _, ant| gain(ant));
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![term("J", TermKind::FullJones, 1, 1)]).unwrap();
    let opts = SolveOpts {
        max_iterations: 200,
        ..Default::default()
    };
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    assert_eq!(solution.status, SolveStatus::Converged);
    assert!(solution.residual_norm < 1e-5);
}

/// Divergence containment: a chunk whose model is identically zero can't
/// constrain anything. The solve must terminate with every antenna failed
/// and no non-finite value anywhere.
#[test]
fn test_divergence_containment() {
    let num_ants = 5;
    let pairs = baseline_pairs(num_ants);
    let dim = (1, 1, pairs.len());
    let data = Array3::from_elem(dim, Jones::identity() * 3.0);
    let model = Array3::from_elem(dim, Jones::default());
    let vis = unflagged_vis(data, model);

    let chain = TermChain::new(vec![term("G", TermKind::Diagonal, 1, 1)]).unwrap();
    let solution = solve_simple(&vis, &chain, num_ants, &SolveOpts::default(), None);

    assert!(matches!(
        solution.status,
        SolveStatus::Diverged | SolveStatus::MaxIterReached
    ));
    for term_result in &solution.terms {
        for (idx, jones) in term_result.jones.indexed_iter() {
            assert!(!jones.any_nan());
            assert!(term_result.unsolved[idx]);
            // Unsolved entries fall back to identity.
            assert_abs_diff_eq!(*jones, Jones::identity());
        }
    }
}

/// A chunk with everything flagged produces no solver invocation.
#[test]
fn test_fully_flagged_chunk_is_skipped() {
    let num_ants = 4;
    let pairs = baseline_pairs(num_ants);
    let dim = (2, 2, pairs.len());
    let mut vis = unflagged_vis(
        Array3::from_elem(dim, Jones::identity()),
        Array3::from_elem(dim, Jones::identity()),
    );
    vis.flags.fill(true);

    let chain = TermChain::new(vec![term("G", TermKind::Diagonal, 2, 2)]).unwrap();
    let solution = solve_simple(&vis, &chain, num_ants, &SolveOpts::default(), None);

    assert_eq!(solution.status, SolveStatus::Skipped);
    assert_eq!(solution.iterations, 0);
    assert_abs_diff_eq!(solution.solved_fraction, 0.0);
    assert!(solution.terms[0].unsolved.iter().all(|&u| u));
}

/// Solver-raised flags are a superset of the input flags.
#[test]
fn test_output_flags_superset_of_input() {
    let num_ants = 5;
    let pairs = baseline_pairs(num_ants);
    let dim = (2, 2, pairs.len());
    let model = Array3::from_elem(dim, Jones::identity());
    let data = corrupted_data(&model, &pairs, |_, _, ant| phase_gain(0.1 * ant as f64));
    let mut vis = unflagged_vis(data, model);
    vis.flags[(0, 0, 3)] = true;
    vis.flags[(1, 1, 0)] = true;

    let chain = TermChain::new(vec![term("P", TermKind::PhaseOnly, 2, 2)]).unwrap();
    let opts = SolveOpts {
        max_iterations: 100,
        ..Default::default()
    };
    let input_flags = vis.flags.clone();
    let solution = solve_simple(&vis, &chain, num_ants, &opts, None);

    for (idx, &flag) in input_flags.indexed_iter() {
        if flag {
            assert!(solution.flags[idx], "input flag at {idx:?} was cleared");
        }
    }
}

/// A pre-cancelled token stops the solve before the first iteration.
#[test]
fn test_cancelled_before_first_iteration() {
    let num_ants = 4;
    let pairs = baseline_pairs(num_ants);
    let dim = (1, 1, pairs.len());
    let vis = unflagged_vis(
        Array3::from_elem(dim, Jones::identity() * 2.0),
        Array3::from_elem(dim, Jones::identity()),
    );
    let chain = TermChain::new(vec![term("G", TermKind::Diagonal, 1, 1)]).unwrap();
    let chunk = one_chunk(1, 1);
    let prop = FlagPropagator::new(&vis, RobustKernel::Disabled);
    let cancel = CancelToken::new();
    cancel.cancel();

    let solution = solve_chunk(
        &chunk,
        &vis,
        prop,
        &chain,
        num_ants,
        &pairs,
        &SolveOpts::default(),
        None,
        &cancel,
    );
    assert_eq!(solution.status, SolveStatus::Cancelled);
    assert_eq!(solution.iterations, 0);
    assert!(solution.terms[0].unsolved.iter().all(|&u| u));
}

#[test]
fn test_opts_validation() {
    let good = SolveOpts::default();
    assert!(good.validate(8).is_ok());

    let opts = SolveOpts {
        max_iterations: 0,
        ..Default::default()
    };
    assert!(matches!(opts.validate(8), Err(SolveOptsError::NoIterations)));

    let opts = SolveOpts {
        stop_tolerance: -1.0,
        ..Default::default()
    };
    assert!(matches!(opts.validate(8), Err(SolveOptsError::BadTolerance(_))));

    let opts = SolveOpts {
        step_size: 1.5,
        ..Default::default()
    };
    assert!(matches!(opts.validate(8), Err(SolveOptsError::BadStepSize(_))));

    let opts = SolveOpts {
        divergence_iters: 0,
        ..Default::default()
    };
    assert!(matches!(
        opts.validate(8),
        Err(SolveOptsError::NoDivergenceIters)
    ));

    let opts = SolveOpts {
        reference_antenna: Some(8),
        ..Default::default()
    };
    assert!(matches!(
        opts.validate(8),
        Err(SolveOptsError::RefAntOutOfRange { .. })
    ));
}
