//! Per-instruction encoding configuration.
//!
//! An [`InstructionAttr`] is built on the stack immediately before one
//! instruction is encoded, attached to the encoder for exactly that
//! instruction, and released when its scope ends.  The attach/release cycle
//! is owned by the RAII guard in the emission engine, so no configuration
//! can leak into the next instruction's encoding.

use core::fmt;

use crate::reg::KReg;

/// Operand width for general-purpose forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// 8-bit.
    B,
    /// 16-bit.
    W,
    /// 32-bit.
    D,
    /// 64-bit.
    Q,
}

impl Width {
    /// Width in bits.
    #[inline]
    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Width::B => 8,
            Width::W => 16,
            Width::D => 32,
            Width::Q => 64,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Width::B => "byte",
            Width::W => "word",
            Width::D => "dword",
            Width::Q => "qword",
        };
        write!(f, "{}", s)
    }
}

/// Vector length applied in VEX/EVEX encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VectorLen {
    /// 128-bit (XMM).
    L128,
    /// 256-bit (YMM).
    L256,
    /// 512-bit (ZMM).
    L512,
    /// Scalar or non-vector instruction.
    NoVec,
}

impl VectorLen {
    /// The EVEX `L'L` field value.  `NoVec` encodes as 128-bit.
    #[inline]
    #[must_use]
    pub(crate) fn ll_bits(self) -> u8 {
        match self {
            VectorLen::L128 | VectorLen::NoVec => 0,
            VectorLen::L256 => 1,
            VectorLen::L512 => 2,
        }
    }

    /// Vector width in bytes (16/32/64); `NoVec` counts as 16.
    #[inline]
    #[must_use]
    pub(crate) fn bytes(self) -> i32 {
        16 << self.ll_bits()
    }
}

/// EVEX tuple type: the memory-access shape used to derive the element size
/// for compressed-displacement arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TupleType {
    /// Full vector, broadcast-capable.
    Fv,
    /// Half vector.
    Hv,
    /// Full vector memory.
    Fvm,
    /// Tuple1 scalar (element size from input size).
    T1s,
    /// Tuple1 fixed (32- or 64-bit element).
    T1f,
    /// Tuple2.
    T2,
    /// Tuple4.
    T4,
    /// Tuple8.
    T8,
    /// Half vector memory.
    Hvm,
    /// Quarter vector memory.
    Qvm,
    /// Eighth vector memory.
    Ovm,
    /// Fixed 128-bit memory.
    M128,
    /// MOVDDUP-style duplicate.
    Dup,
    /// No compressed-displacement scaling.
    NoScale,
}

/// Memory-operand input size in bits, for tuple types whose element size
/// depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSize {
    /// 8-bit elements.
    Bits8,
    /// 16-bit elements.
    Bits16,
    /// 32-bit elements.
    Bits32,
    /// 64-bit elements.
    Bits64,
    /// Not applicable.
    NoBits,
}

/// Per-instruction encoding configuration: vector length, operand width,
/// prefix-family eligibility, masking mode, and the EVEX address attributes
/// used for compressed-displacement math.
///
/// Immutable once emission begins: the engine decides promotion/demotion
/// exactly once at the start of an instruction and every subsequent byte is
/// emitted under that decision.
#[derive(Debug, Clone)]
pub struct InstructionAttr {
    rex_vex_w: bool,
    legacy_mode: bool,
    no_reg_mask: bool,
    uses_vl: bool,
    rex_vex_w_reverted: bool,
    is_evex_instruction: bool,
    clear_context: bool,
    extended_context: bool,
    no_flags: bool,
    vector_len: VectorLen,
    tuple_type: TupleType,
    input_size: InputSize,
    embedded_opmask: u8,
}

impl InstructionAttr {
    /// Build a configuration for one instruction.
    ///
    /// * `vector_len` — vector length for VEX/EVEX encoding.
    /// * `rex_vex_w` — operand width: false for 32 bits or less, true for
    ///   64-bit or specially defined widths.
    /// * `legacy_mode` — the instruction must stay in a pre-AVX-512 family.
    /// * `no_reg_mask` — masking disabled: `k0` is used when EVEX is chosen.
    /// * `uses_vl` — the instruction is vector-length sensitive.
    #[must_use]
    pub fn new(
        vector_len: VectorLen,
        rex_vex_w: bool,
        legacy_mode: bool,
        no_reg_mask: bool,
        uses_vl: bool,
    ) -> Self {
        Self {
            rex_vex_w,
            legacy_mode,
            no_reg_mask,
            uses_vl,
            rex_vex_w_reverted: false,
            is_evex_instruction: false,
            clear_context: true,
            extended_context: false,
            no_flags: false,
            vector_len,
            tuple_type: TupleType::NoScale,
            input_size: InputSize::NoBits,
            embedded_opmask: 0,
        }
    }

    // ── queries ─────────────────────────────────────────────────────────

    /// The W bit (operand width).
    #[inline]
    #[must_use]
    pub fn is_rex_vex_w(&self) -> bool {
        self.rex_vex_w
    }

    /// Whether the instruction is pinned to a legacy/VEX family.
    #[inline]
    #[must_use]
    pub fn is_legacy_mode(&self) -> bool {
        self.legacy_mode
    }

    /// Whether masking is disabled for this instruction.
    #[inline]
    #[must_use]
    pub fn is_no_reg_mask(&self) -> bool {
        self.no_reg_mask
    }

    /// Whether the instruction is vector-length sensitive.
    #[inline]
    #[must_use]
    pub fn uses_vl(&self) -> bool {
        self.uses_vl
    }

    /// Whether the W bit was reverted for an AVX encoding.
    #[inline]
    #[must_use]
    pub fn is_rex_vex_w_reverted(&self) -> bool {
        self.rex_vex_w_reverted
    }

    /// Whether the instruction has been promoted to EVEX.
    #[inline]
    #[must_use]
    pub fn is_evex_instruction(&self) -> bool {
        self.is_evex_instruction
    }

    /// Whether masked lanes are zeroed (true) or merged (false).
    #[inline]
    #[must_use]
    pub fn is_clear_context(&self) -> bool {
        self.clear_context
    }

    /// Whether broadcast/embedded-rounding context is active.
    #[inline]
    #[must_use]
    pub fn is_extended_context(&self) -> bool {
        self.extended_context
    }

    /// Whether the APX flag-suppressing variant was requested.
    #[inline]
    #[must_use]
    pub fn is_no_flags(&self) -> bool {
        self.no_flags
    }

    /// The vector length.
    #[inline]
    #[must_use]
    pub fn vector_len(&self) -> VectorLen {
        self.vector_len
    }

    /// The EVEX tuple type.
    #[inline]
    #[must_use]
    pub fn tuple_type(&self) -> TupleType {
        self.tuple_type
    }

    /// The memory-operand input size.
    #[inline]
    #[must_use]
    pub fn input_size(&self) -> InputSize {
        self.input_size
    }

    /// The embedded opmask register specifier (0 = unmasked / `k0`).
    #[inline]
    #[must_use]
    pub fn embedded_opmask(&self) -> u8 {
        self.embedded_opmask
    }

    // ── setters (builder style, used while configuring one instruction) ─

    /// Override the vector length.
    pub fn set_vector_len(&mut self, vector_len: VectorLen) {
        self.vector_len = vector_len;
    }

    /// Set the W bit from later shape analysis.
    pub fn set_rex_vex_w(&mut self, state: bool) {
        self.rex_vex_w = state;
    }

    /// Mark the W bit as reverted for an AVX encoding.
    pub fn set_rex_vex_w_reverted(&mut self) {
        self.rex_vex_w_reverted = true;
    }

    /// Pin the instruction to a legacy/VEX family.
    pub fn set_is_legacy_mode(&mut self) {
        self.legacy_mode = true;
    }

    /// Promote the instruction to EVEX.
    pub fn set_is_evex_instruction(&mut self) {
        self.is_evex_instruction = true;
    }

    /// Use merge semantics for masked lanes instead of zeroing.
    pub fn reset_is_clear_context(&mut self) {
        self.clear_context = false;
    }

    /// Activate broadcast/embedded-rounding context.
    pub fn set_extended_context(&mut self) {
        self.extended_context = true;
    }

    /// Request the APX flag-suppressing variant.  Forces promotion: the
    /// no-flags form only exists in the extended families, so it is never
    /// demoted for code size.
    pub fn set_no_flags(&mut self) {
        self.no_flags = true;
    }

    /// Set the address attributes used for compressed-displacement math.
    pub fn set_address_attributes(&mut self, tuple_type: TupleType, input_size: InputSize) {
        self.tuple_type = tuple_type;
        self.input_size = input_size;
    }

    /// Set the embedded opmask register specifier.
    pub fn set_embedded_opmask_register_specifier(&mut self, mask: KReg) {
        self.embedded_opmask = mask.encoding() & 0x7;
    }

    // ── compressed-displacement arithmetic ──────────────────────────────

    /// The element size in bytes that a compressed 1-byte displacement is
    /// scaled by, derived from tuple type × input size × vector length
    /// (broadcast narrows the full-vector tuple to one element).  Returns
    /// `None` when the tuple type does not compress.
    #[must_use]
    pub fn disp_multiplier(&self) -> Option<i32> {
        let vlen = self.vector_len;
        let mult = match self.tuple_type {
            TupleType::Fv => {
                if self.extended_context {
                    // Broadcast: one element feeds all lanes.
                    match self.input_size {
                        InputSize::Bits32 => 4,
                        InputSize::Bits64 => 8,
                        _ => return None,
                    }
                } else {
                    vlen.bytes()
                }
            }
            TupleType::Hv => vlen.bytes() / 2,
            TupleType::Fvm => vlen.bytes(),
            TupleType::T1s => match self.input_size {
                InputSize::Bits8 => 1,
                InputSize::Bits16 => 2,
                InputSize::Bits32 => 4,
                InputSize::Bits64 => 8,
                InputSize::NoBits => return None,
            },
            TupleType::T1f => match self.input_size {
                InputSize::Bits32 => 4,
                InputSize::Bits64 => 8,
                _ => return None,
            },
            TupleType::T2 => {
                if self.rex_vex_w {
                    16
                } else {
                    8
                }
            }
            TupleType::T4 => {
                if self.rex_vex_w {
                    32
                } else {
                    16
                }
            }
            TupleType::T8 => 32,
            TupleType::Hvm => vlen.bytes() / 2,
            TupleType::Qvm => vlen.bytes() / 4,
            TupleType::Ovm => vlen.bytes() / 8,
            TupleType::M128 => 16,
            TupleType::Dup => vlen.bytes() / 2,
            TupleType::NoScale => return None,
        };
        Some(mult.max(1))
    }
}
