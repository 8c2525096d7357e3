//! Relocation model.
//!
//! The engine never patches addresses itself: every embedded relocatable
//! value produces exactly one [`RelocEntry`] describing where the bytes were
//! written and how a later link/patch step must interpret them.

/// What the relocated value refers to.  Carried on operands, recorded on
/// entries, and otherwise uninterpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocKind {
    /// No relocation: the embedded value is final.
    #[default]
    None,
    /// A call into runtime support code.
    RuntimeCall,
    /// An address of data outside the code buffer.
    ExternalWord,
    /// An address inside the code buffer being produced.
    InternalWord,
}

/// How the patcher locates and rewrites the embedded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RelocFormat {
    /// Embedded 32-bit or 64-bit immediate operand.
    Imm,
    /// Embedded 32-bit displacement or absolute address.
    Disp32,
    /// Embedded 32-bit self-relative displacement (call/jump target).
    Call32,
    /// Embedded 32-bit compressed-pointer immediate.
    NarrowOopImm,
}

/// An opaque relocation descriptor attached to an operand: the kind plus the
/// final target address.  [`RelocKind::None`] means the operand carries no
/// relocatable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelocationHolder {
    kind: RelocKind,
    target: u64,
}

impl RelocationHolder {
    /// The empty holder (no relocation).
    pub const NONE: RelocationHolder = RelocationHolder {
        kind: RelocKind::None,
        target: 0,
    };

    /// A holder for the given kind and target address.
    #[must_use]
    pub const fn new(kind: RelocKind, target: u64) -> Self {
        Self { kind, target }
    }

    /// The relocation kind.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> RelocKind {
        self.kind
    }

    /// The target address.
    #[inline]
    #[must_use]
    pub const fn target(&self) -> u64 {
        self.target
    }

    /// Whether this holder carries a real relocation.
    #[inline]
    #[must_use]
    pub const fn is_some(&self) -> bool {
        !matches!(self.kind, RelocKind::None)
    }
}

/// One recorded relocation: the byte offset where the value was written,
/// the kind, and the patch format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RelocEntry {
    /// Byte offset within the code buffer where the relocated value starts.
    pub offset: usize,
    /// The relocation kind from the originating operand.
    pub kind: RelocKind,
    /// How the patcher must interpret the bytes at `offset`.
    pub format: RelocFormat,
    /// The target address the patcher resolves against.
    pub target: u64,
}
