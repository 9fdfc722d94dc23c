// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use approx::assert_abs_diff_eq;
use marlu::Jones;
use ndarray::prelude::*;

use super::*;
use crate::math::baseline_pairs;

fn unflagged_vis(dim: (usize, usize, usize)) -> ChunkVis {
    ChunkVis {
        data: Array3::from_elem(dim, Jones::identity()),
        model: Array3::from_elem(dim, Jones::identity()),
        weights: Array3::ones(dim),
        flags: Array3::from_elem(dim, false),
    }
}

#[test]
fn test_weights_are_normalised_and_zero_when_flagged() {
    let dim = (2, 2, 3);
    let mut vis = unflagged_vis(dim);
    vis.weights.fill(4.0);
    vis.weights[(0, 0, 0)] = 2.0;
    vis.flags[(1, 1, 2)] = true;

    let prop = FlagPropagator::new(&vis, RobustKernel::Disabled);
    let mut weights = Array3::zeros(dim);
    prop.iteration_weights(None, &mut weights);

    assert_abs_diff_eq!(weights[(0, 0, 0)], 0.5);
    assert_abs_diff_eq!(weights[(0, 0, 1)], 1.0);
    assert_abs_diff_eq!(weights[(1, 1, 2)], 0.0);
    assert!(weights.iter().all(|&w| (0.0..=1.0).contains(&w)));
}

#[test]
fn test_broken_data_is_flagged_up_front() {
    let dim = (1, 1, 3);
    let mut vis = unflagged_vis(dim);
    vis.data[(0, 0, 0)] = Jones::nan();
    vis.weights[(0, 0, 1)] = 0.0;
    vis.weights[(0, 0, 2)] = f32::NAN;

    let prop = FlagPropagator::new(&vis, RobustKernel::Disabled);
    assert_eq!(prop.num_flagged(), 3);
    assert!(prop.all_flagged());
}

#[test]
fn test_flags_are_monotonic() {
    let dim = (2, 2, 3);
    let vis = unflagged_vis(dim);
    let mut prop = FlagPropagator::new(&vis, RobustKernel::Disabled);

    let mut seen: Vec<(usize, usize, usize)> = vec![];
    for &datum in &[(0, 0, 1), (1, 0, 2), (0, 0, 1)] {
        prop.flag(datum.0, datum.1, datum.2);
        seen.push(datum);
        // Every previously-flagged datum is still flagged.
        for &(t, f, bl) in &seen {
            assert!(prop.flags()[(t, f, bl)]);
        }
    }
    assert_eq!(prop.num_flagged(), 2);

    let mut weights = Array3::zeros(dim);
    prop.iteration_weights(None, &mut weights);
    assert_abs_diff_eq!(weights[(0, 0, 1)], 0.0);
    assert_abs_diff_eq!(weights[(1, 0, 2)], 0.0);
}

#[test]
fn test_huber_factor() {
    let kernel = RobustKernel::Huber { threshold: 3.0 };
    assert_abs_diff_eq!(kernel.factor(0.0), 1.0);
    assert_abs_diff_eq!(kernel.factor(3.0), 1.0);
    assert_abs_diff_eq!(kernel.factor(6.0), 0.5);
    assert!(kernel.factor(1e9) > 0.0);
    assert_abs_diff_eq!(RobustKernel::Disabled.factor(1e9), 1.0);
}

#[test]
fn test_outliers_are_down_weighted_from_previous_residuals() {
    let dim = (1, 1, 6);
    let vis = unflagged_vis(dim);
    let prop = FlagPropagator::new(&vis, RobustKernel::Huber { threshold: 2.0 });

    let mut resid = Array3::from_elem(dim, 1.0);
    resid[(0, 0, 5)] = 100.0;

    // First iteration: no robust factor.
    let mut weights = Array3::zeros(dim);
    prop.iteration_weights(None, &mut weights);
    assert_abs_diff_eq!(weights[(0, 0, 5)], 1.0);

    // Subsequent iterations: the outlier loses weight, inliers keep theirs.
    prop.iteration_weights(Some(&resid), &mut weights);
    assert!(weights[(0, 0, 5)] < 0.9);
    assert!(weights[(0, 0, 5)] > 0.0);
    assert_abs_diff_eq!(weights[(0, 0, 0)], 1.0);
}

#[test]
fn test_antenna_cell_weights() {
    let num_ants = 4;
    let pairs = baseline_pairs(num_ants);
    let dim = (4, 2, pairs.len());
    let mut vis = unflagged_vis(dim);
    // Flag every baseline involving antenna 2 in the first two timesteps.
    for (bl, &(a1, a2)) in pairs.iter().enumerate() {
        if a1 == 2 || a2 == 2 {
            for t in 0..2 {
                for f in 0..2 {
                    vis.flags[(t, f, bl)] = true;
                }
            }
        }
    }

    let prop = FlagPropagator::new(&vis, RobustKernel::Disabled);
    // Time interval 2, freq interval 2: cells (0..2) × (0..1).
    let totals = prop.antenna_cell_weights(2, 2, num_ants, &pairs);
    assert_eq!(totals.dim(), (2, 1, num_ants));
    // Antenna 2 has no weight in the first time cell but full weight in the
    // second.
    assert_abs_diff_eq!(totals[(0, 0, 2)], 0.0);
    assert!(totals[(1, 0, 2)] > 0.0);
    // Other antennas keep weight everywhere.
    assert!(totals[(0, 0, 0)] > 0.0);
}

#[test]
fn test_flag_antenna_zeroes_its_baselines() {
    let num_ants = 3;
    let pairs = baseline_pairs(num_ants);
    let dim = (2, 2, pairs.len());
    let vis = unflagged_vis(dim);
    let mut prop = FlagPropagator::new(&vis, RobustKernel::Disabled);

    prop.flag_antenna(0, 0..2, 0..2, &pairs);
    // Baselines (0,1) and (0,2) are gone, (1,2) survives.
    let totals = prop.antenna_cell_weights(2, 2, num_ants, &pairs);
    assert_abs_diff_eq!(totals[(0, 0, 0)], 0.0);
    assert!(totals[(0, 0, 1)] > 0.0);
    assert!(totals[(0, 0, 2)] > 0.0);
    assert!(!prop.all_flagged());
}
