// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Gain-term chain configuration.
//!
//! A calibration run solves an ordered chain of antenna-based gain terms.
//! Terms compose multiplicatively: for antennas `p` and `q`, the corrected
//! model visibility is `A_p M_pq A_q^H` where `A = T1·T2·…·Tn` is the
//! product of every term's gain for that antenna. Each term constrains its
//! gains to a parameterisation (phase-only, diagonal, full Jones) and is
//! solved over its own time/frequency solution intervals.

mod error;

pub use error::ChainError;

use marlu::{c64, Jones};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};
use vec1::Vec1;

use crate::math::{cexp, ceil_div, lcm};

/// The parameterisation of a gain term. This is a closed set; new
/// parameterisations are new variants, all dispatched through the same
/// residual/update primitives in the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TermKind {
    /// A unit-modulus scalar gain per antenna: 1 real parameter (phase).
    PhaseOnly,

    /// A complex scalar gain applied to both polarisations: 2 real
    /// parameters (amplitude, phase).
    Diagonal,

    /// A full 2×2 complex Jones matrix: 8 real parameters (four re/im
    /// pairs in row-major order).
    FullJones,
}

impl TermKind {
    /// The number of free real parameters per antenna per solution interval.
    pub fn num_params(self) -> usize {
        match self {
            TermKind::PhaseOnly => 1,
            TermKind::Diagonal => 2,
            TermKind::FullJones => 8,
        }
    }

    /// Build the working Jones matrix from a packed real parameter vector.
    ///
    /// The slice length must be [`TermKind::num_params`].
    pub fn jones_from_params(self, params: &[f64]) -> Jones<f64> {
        assert_eq!(params.len(), self.num_params());
        match self {
            TermKind::PhaseOnly => {
                let g = cexp(params[0]);
                Jones::from([g, c64::default(), c64::default(), g])
            }
            TermKind::Diagonal => {
                let g = cexp(params[1]) * params[0];
                Jones::from([g, c64::default(), c64::default(), g])
            }
            TermKind::FullJones => Jones::from([
                c64::new(params[0], params[1]),
                c64::new(params[2], params[3]),
                c64::new(params[4], params[5]),
                c64::new(params[6], params[7]),
            ]),
        }
    }

    /// Pack a constrained working Jones matrix into a real parameter vector.
    ///
    /// The slice length must be [`TermKind::num_params`]. The input must
    /// already satisfy the parameterisation (see [`TermKind::constrain`]);
    /// for the scalar kinds only the first diagonal element is inspected.
    pub fn params_from_jones(self, jones: Jones<f64>, params: &mut [f64]) {
        assert_eq!(params.len(), self.num_params());
        match self {
            TermKind::PhaseOnly => params[0] = jones[0].arg(),
            TermKind::Diagonal => {
                params[0] = jones[0].norm();
                params[1] = jones[0].arg();
            }
            TermKind::FullJones => {
                for (i, p) in params.chunks_exact_mut(2).enumerate() {
                    p[0] = jones[i].re;
                    p[1] = jones[i].im;
                }
            }
        }
    }

    /// Project an unconstrained update candidate onto this term's
    /// parameterisation. Returns a NaN Jones matrix if the candidate is
    /// degenerate for the parameterisation (e.g. a zero scalar gain, which
    /// has no phase); callers treat that antenna as failed.
    pub(crate) fn constrain(self, candidate: Jones<f64>) -> Jones<f64> {
        match self {
            TermKind::FullJones => candidate,
            TermKind::Diagonal => {
                let g = (candidate[0] + candidate[3]) * 0.5;
                Jones::from([g, c64::default(), c64::default(), g])
            }
            TermKind::PhaseOnly => {
                let g = (candidate[0] + candidate[3]) * 0.5;
                let norm = g.norm();
                if norm > 0.0 && norm.is_finite() {
                    let g = g / norm;
                    Jones::from([g, c64::default(), c64::default(), g])
                } else {
                    Jones::nan()
                }
            }
        }
    }
}

/// How a term's parameters are initialised for a chunk that has a completed
/// predecessor in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPolicy {
    /// Always start from unity gain / zero phase.
    #[default]
    Identity,

    /// Start from the final solutions of the chunk covering the preceding
    /// time intervals (same frequency range). Falls back to identity when
    /// no predecessor exists or the predecessor failed.
    WarmStart,
}

/// One gain term in the chain. Immutable configuration, shared read-only by
/// all concurrent chunk solves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GainTerm {
    /// The term's unique name, e.g. "G" or "bandpass".
    pub name: String,

    pub kind: TermKind,

    /// The time solution-interval width in timesteps. Parameters are
    /// constant over each interval.
    pub time_interval: usize,

    /// The frequency solution-interval width in channels.
    pub freq_interval: usize,

    #[serde(default)]
    pub initial: InitPolicy,
}

impl GainTerm {
    /// The number of this term's time solution intervals across
    /// `num_timesteps`. The final interval may be ragged.
    pub fn num_time_ints(&self, num_timesteps: usize) -> usize {
        ceil_div(num_timesteps, self.time_interval)
    }

    /// The number of this term's frequency solution intervals across
    /// `num_channels`. The final interval may be ragged.
    pub fn num_freq_ints(&self, num_channels: usize) -> usize {
        ceil_div(num_channels, self.freq_interval)
    }
}

/// The ordered, validated gain-term chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermChain {
    terms: Vec1<GainTerm>,
}

impl TermChain {
    /// Validate a chain definition. Fails if the chain is empty, a name is
    /// repeated, or any solution-interval width is zero.
    pub fn new(terms: Vec<GainTerm>) -> Result<TermChain, ChainError> {
        let terms = Vec1::try_from_vec(terms).map_err(|_| ChainError::Empty)?;
        for (i, term) in terms.iter().enumerate() {
            if term.time_interval == 0 {
                return Err(ChainError::ZeroTimeInterval {
                    name: term.name.clone(),
                });
            }
            if term.freq_interval == 0 {
                return Err(ChainError::ZeroFreqInterval {
                    name: term.name.clone(),
                });
            }
            if terms.iter().skip(i + 1).any(|t| t.name == term.name) {
                return Err(ChainError::DuplicateName {
                    name: term.name.clone(),
                });
            }
        }
        Ok(TermChain { terms })
    }

    pub fn terms(&self) -> &[GainTerm] {
        &self.terms
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, name: &str) -> Option<&GainTerm> {
        self.terms.iter().find(|t| t.name == name)
    }

    /// The least common multiple of all terms' time-interval widths. Chunk
    /// boundaries along time are multiples of this, so that no chunk spans a
    /// partial solution interval for any term.
    pub fn lcm_time_interval(&self) -> usize {
        self.terms.iter().fold(1, |acc, t| lcm(acc, t.time_interval))
    }

    /// As [`TermChain::lcm_time_interval`], but along frequency.
    pub fn lcm_freq_interval(&self) -> usize {
        self.terms.iter().fold(1, |acc, t| lcm(acc, t.freq_interval))
    }

    /// Whether any term warm-starts from its time predecessor. This decides
    /// whether the scheduler's dependency graph has edges at all.
    pub fn warm_start(&self) -> bool {
        self.terms.iter().any(|t| t.initial == InitPolicy::WarmStart)
    }
}
