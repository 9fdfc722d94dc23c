// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisAccessError {
    #[error(
        "Chunk {chunk}: {array} has shape ({got_t}, {got_f}, {got_bl}), but the chunk descriptor \
         requires ({want_t}, {want_f}, {want_bl})"
    )]
    ShapeMismatch {
        chunk: String,
        array: &'static str,
        got_t: usize,
        got_f: usize,
        got_bl: usize,
        want_t: usize,
        want_f: usize,
        want_bl: usize,
    },

    #[error("Chunk {chunk}: requested timesteps {want_t:?} and channels {want_f:?} lie outside the stored extent ({num_t} timesteps, {num_f} channels)")]
    OutOfRange {
        chunk: String,
        want_t: std::ops::Range<usize>,
        want_f: std::ops::Range<usize>,
        num_t: usize,
        num_f: usize,
    },

    #[error("Visibility arrays disagree on their dimensions: data is {data:?}, {other} is {other_dim:?}")]
    MismatchedArrays {
        data: (usize, usize, usize),
        other: &'static str,
        other_dim: (usize, usize, usize),
    },
}
