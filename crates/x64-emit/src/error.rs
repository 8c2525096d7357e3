//! Error types for encoding-contract violations.
//!
//! Every failure mode in this crate is a programming-contract violation:
//! inputs come from trusted compiler logic that has already validated them,
//! so nothing here is transient and nothing is retried.  Each violation
//! carries the precise values involved so the root cause is visible at the
//! failure site instead of surfacing later as corrupt machine code.

use alloc::string::String;
use core::fmt;

use crate::attr::Width;

/// Encoding-contract violation with a precise diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// An `Address` was constructed with an index/scale pairing that
    /// violates `index.is_valid() == (scale != NoScale)`.
    InconsistentAddress {
        /// Description of the violated pairing.
        detail: String,
    },

    /// A displacement (or a constant folded into one) does not fit the
    /// signed 32-bit displacement field.
    DisplacementOverflow {
        /// The displacement value that overflowed.
        value: i64,
    },

    /// `plus_disp` was asked to merge a register-carrying displacement into
    /// an address that already has an index register.
    CompetingIndex,

    /// A register encoding was requested in a prefix family that cannot
    /// express it (e.g. encoding ≥ 16 forced into a legacy/VEX form).
    RegisterOutOfRange {
        /// The register encoding that could not be expressed.
        encoding: u8,
        /// The prefix family that was structurally unable to express it.
        family: &'static str,
    },

    /// The requested feature set (opmask, broadcast, 512-bit length, …)
    /// conflicts with the prefix family the instruction is pinned to.
    EncodingConflict {
        /// Description of the conflicting request.
        detail: String,
    },

    /// An immediate does not fit the operand width declared by the active
    /// configuration (e.g. an 8-byte immediate under a 32-bit width).
    ImmediateOverflow {
        /// The immediate value.
        value: i64,
        /// The declared operand width.
        width: Width,
    },

    /// The catalog has no descriptor for the mnemonic.
    UnknownMnemonic {
        /// The mnemonic that was not recognized.
        mnemonic: String,
    },

    /// The descriptor exists but does not admit the supplied operand shape.
    InvalidOperands {
        /// The mnemonic being encoded.
        mnemonic: String,
        /// Description of why the operands are invalid.
        detail: String,
    },

    /// A rip-relative form cannot reach the literal's target and the caller
    /// must materialize the address into a register instead.
    UnreachableTarget {
        /// The literal's target address.
        target: u64,
    },
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmitError::InconsistentAddress { detail } => {
                write!(f, "inconsistent address: {}", detail)
            }
            EmitError::DisplacementOverflow { value } => {
                write!(f, "displacement {} does not fit a signed 32-bit field", value)
            }
            EmitError::CompetingIndex => {
                write!(f, "competing indexes: address already carries an index register")
            }
            EmitError::RegisterOutOfRange { encoding, family } => {
                write!(
                    f,
                    "register encoding {} cannot be expressed by a {} prefix",
                    encoding, family
                )
            }
            EmitError::EncodingConflict { detail } => {
                write!(f, "encoding conflict: {}", detail)
            }
            EmitError::ImmediateOverflow { value, width } => {
                write!(
                    f,
                    "immediate {} does not fit the declared {} operand width",
                    value, width
                )
            }
            EmitError::UnknownMnemonic { mnemonic } => {
                write!(f, "unknown mnemonic '{}'", mnemonic)
            }
            EmitError::InvalidOperands { mnemonic, detail } => {
                write!(f, "invalid operands for '{}': {}", mnemonic, detail)
            }
            EmitError::UnreachableTarget { target } => {
                write!(
                    f,
                    "target {:#x} is not reachable rip-relative; materialize it into a register",
                    target
                )
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for EmitError {}
