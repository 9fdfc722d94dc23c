// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error(
        "Gain term '{name}' was not solved in any chunk; the solution table has no coverage for \
         it at all. This usually means the planner and the chain configuration disagree, or that \
         every chunk failed"
    )]
    TermNeverSolved { name: String },

    #[error(
        "Chunk {chunk} returned {got} term result(s), but the chain defines {expected} term(s)"
    )]
    TermCountMismatch {
        chunk: String,
        got: usize,
        expected: usize,
    },
}
