// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Distributed chained-gain calibration for radio interferometer visibility
data.

chaincal estimates per-antenna, per-interval complex gain corrections
("Jones terms") that best explain observed visibilities against model
visibilities, by iterative weighted least squares. An observation is
partitioned into independent chunks aligned to the solution intervals of an
ordered chain of gain terms; each chunk is solved by damped StefCal-style
iteration; per-chunk results are merged into a single solution table with
deterministic tie-breaks and nearest-neighbour fallback for anything that
could not be solved.

Reading the underlying dataset, configuration loading, plotting and
solution persistence are left to collaborating crates; this one takes a
[`VisAccess`] implementation and a validated [`TermChain`] and returns a
[`SolutionTable`].
*/

pub mod chain;
pub mod context;
mod error;
pub mod flagging;
pub mod io;
pub(crate) mod math;
pub mod planning;
pub mod scheduler;
pub mod solutions;
pub mod solver;

// Re-exports.
pub use chain::{GainTerm, InitPolicy, TermChain, TermKind};
pub use context::ObsContext;
pub use error::ChaincalError;
pub use flagging::RobustKernel;
pub use io::{ChunkVis, MemoryVisAccess, VisAccess};
pub use planning::{plan_chunks, Chunk, ChunkId};
pub use scheduler::run_solve;
pub use solutions::{ChunkDiagnostic, SolutionFlag, SolutionTable};
pub use solver::{CancelToken, SolveOpts, SolveStatus};

use crossbeam_utils::atomic::AtomicCell;

/// Are progress bars enabled? The calling application decides; bars draw to
/// stdout when enabled and are hidden otherwise.
pub static PROGRESS_BARS: AtomicCell<bool> = AtomicCell::new(false);
