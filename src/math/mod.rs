// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Some helper mathematics.


use num_complex::Complex64;

/// Complex exponential. The argument is assumed to be purely imaginary.
///
/// This function doesn't actually use complex numbers; it just returns the
/// real and imag components from Euler's formula (i.e. e^{ix} = cos{x} + i
/// sin{x}).
#[inline]
pub(crate) fn cexp(x: f64) -> Complex64 {
    let (im, re) = x.sin_cos();
    Complex64::new(re, im)
}

/// Integer division rounding up. Used for counting ragged solution intervals.
#[inline]
pub(crate) fn ceil_div(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

pub(crate) fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Least common multiple. Interval widths are small, so overflow isn't a
/// practical concern here.
pub(crate) fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}

/// The number of cross-correlation baselines formed by `num_ants` antennas.
#[inline]
pub(crate) fn num_cross_baselines(num_ants: usize) -> usize {
    num_ants * num_ants.saturating_sub(1) / 2
}

/// The (antenna1, antenna2) pair for every cross-correlation baseline, in
/// the standard upper-triangle order (antenna1 < antenna2).
pub(crate) fn baseline_pairs(num_ants: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(num_cross_baselines(num_ants));
    for ant1 in 0..num_ants {
        for ant2 in ant1 + 1..num_ants {
            pairs.push((ant1, ant2));
        }
    }
    pairs
}
