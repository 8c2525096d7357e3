//! Memory-operand model: base + index×scale + displacement addresses and
//! relocatable address literals.
//!
//! These are pure data.  All encoding decisions (prefix family, ModRM/SIB
//! layout, displacement width) live in the emission engine; the types here
//! only enforce the structural invariants every construction path must
//! uphold — most importantly `index.is_valid() == (scale != NoScale)`.

use crate::error::EmitError;
use crate::reg::{Gpr, Xmm, NOREG, XNOREG};
use crate::reloc::{RelocKind, RelocationHolder};

// ─── ScaleFactor ────────────────────────────────────────────────────────

/// SIB scale factor.  The numeric values are the SIB `ss` field encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ScaleFactor {
    /// No index register participates.
    NoScale = -1,
    /// ×1
    Times1 = 0,
    /// ×2
    Times2 = 1,
    /// ×4
    Times4 = 2,
    /// ×8
    Times8 = 3,
}

impl ScaleFactor {
    /// The scale for an element of `size` bytes (1, 2, 4, or 8).
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two in `1..=8`.
    #[must_use]
    pub fn times(size: i32) -> ScaleFactor {
        match size {
            1 => ScaleFactor::Times1,
            2 => ScaleFactor::Times2,
            4 => ScaleFactor::Times4,
            8 => ScaleFactor::Times8,
            _ => panic!("bad scale size {}", size),
        }
    }

    /// The element size in bytes.
    ///
    /// # Panics
    ///
    /// Panics on [`ScaleFactor::NoScale`].
    #[must_use]
    pub fn scale_size(self) -> i32 {
        assert!(self != ScaleFactor::NoScale, "scale_size on NoScale");
        1 << (self as i32)
    }

    /// The SIB `ss` bits.  `NoScale` maps to 0 (the no-index SIB form).
    #[inline]
    #[must_use]
    pub(crate) fn ss_bits(self) -> u8 {
        match self {
            ScaleFactor::NoScale | ScaleFactor::Times1 => 0,
            ScaleFactor::Times2 => 1,
            ScaleFactor::Times4 => 2,
            ScaleFactor::Times8 => 3,
        }
    }
}

// ─── RegisterOrConstant ─────────────────────────────────────────────────

/// Either a register or a known constant — used for index operands the
/// upper layers may have constant-folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOrConstant {
    /// A register index.
    Register(Gpr),
    /// A constant index, folded into the displacement at construction.
    Constant(i64),
}

impl RegisterOrConstant {
    /// The register, or [`NOREG`] for a constant.
    #[inline]
    #[must_use]
    pub fn register_or_noreg(self) -> Gpr {
        match self {
            RegisterOrConstant::Register(r) => r,
            RegisterOrConstant::Constant(_) => NOREG,
        }
    }

    /// The constant, or 0 for a register.
    #[inline]
    #[must_use]
    pub fn constant_or_zero(self) -> i64 {
        match self {
            RegisterOrConstant::Register(_) => 0,
            RegisterOrConstant::Constant(c) => c,
        }
    }

    /// Whether this is the register form.
    #[inline]
    #[must_use]
    pub fn is_register(self) -> bool {
        matches!(self, RegisterOrConstant::Register(_))
    }
}

// ─── Address ────────────────────────────────────────────────────────────

/// One memory operand in base + index×scale + displacement form, or an
/// absolute / rip-relative location identified by its relocation descriptor.
///
/// Invariant, enforced at every construction path:
/// `index().is_valid() == (scale() != ScaleFactor::NoScale)` (likewise for
/// the vector-index form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    base: Gpr,
    index: Gpr,
    xmm_index: Xmm,
    scale: ScaleFactor,
    disp: i32,
    rspec: RelocationHolder,
}

impl Address {
    /// `[base]`
    #[must_use]
    pub fn base(base: Gpr) -> Address {
        Address::base_disp(base, 0)
    }

    /// `[base + disp]`
    #[must_use]
    pub fn base_disp(base: Gpr, disp: i32) -> Address {
        Address {
            base,
            index: NOREG,
            xmm_index: XNOREG,
            scale: ScaleFactor::NoScale,
            disp,
            rspec: RelocationHolder::NONE,
        }
    }

    /// `[base + index*scale + disp]`
    ///
    /// # Errors
    ///
    /// [`EmitError::InconsistentAddress`] unless the index is valid exactly
    /// when a scale is given.
    pub fn base_index(
        base: Gpr,
        index: Gpr,
        scale: ScaleFactor,
        disp: i32,
    ) -> Result<Address, EmitError> {
        check_index_scale(index.is_valid(), scale)?;
        Ok(Address {
            base,
            index,
            xmm_index: XNOREG,
            scale,
            disp,
            rspec: RelocationHolder::NONE,
        })
    }

    /// `[base + index*scale + disp]` where the index may already have been
    /// folded to a constant.  A constant index is merged into the
    /// displacement as `constant × scale_size`, range-checked against the
    /// signed 32-bit displacement field.
    ///
    /// # Errors
    ///
    /// [`EmitError::DisplacementOverflow`] if the fold leaves the i32 range,
    /// [`EmitError::InconsistentAddress`] on a bad index/scale pairing.
    pub fn base_index_or_const(
        base: Gpr,
        index: RegisterOrConstant,
        scale: ScaleFactor,
        disp: i32,
    ) -> Result<Address, EmitError> {
        let reg = index.register_or_noreg();
        let folded =
            i64::from(disp) + index.constant_or_zero() * i64::from(scale_size_or_one(scale));
        let disp = i32::try_from(folded)
            .map_err(|_| EmitError::DisplacementOverflow { value: folded })?;
        let scale = if index.is_register() {
            scale
        } else {
            ScaleFactor::NoScale
        };
        check_index_scale(reg.is_valid(), scale)?;
        Ok(Address {
            base,
            index: reg,
            xmm_index: XNOREG,
            scale,
            disp,
            rspec: RelocationHolder::NONE,
        })
    }

    /// `[base + xmm_index*scale + disp]` — the gather/scatter form.
    ///
    /// # Errors
    ///
    /// [`EmitError::InconsistentAddress`] unless the index is valid exactly
    /// when a scale is given.
    pub fn base_xmm_index(
        base: Gpr,
        index: Xmm,
        scale: ScaleFactor,
        disp: i32,
    ) -> Result<Address, EmitError> {
        check_index_scale(index.is_valid(), scale)?;
        Ok(Address {
            base,
            index: NOREG,
            xmm_index: index,
            scale,
            disp,
            rspec: RelocationHolder::NONE,
        })
    }

    /// `[disp32]` — absolute, no base or index.
    #[must_use]
    pub fn absolute(disp: i32) -> Address {
        Address::base_disp(NOREG, disp)
    }

    /// A rip-relative or absolute location carrying a relocation.  With no
    /// base and no index, a non-empty relocation selects the rip-relative
    /// ModRM form and the displacement is patched later.
    #[must_use]
    pub fn rip_relative(disp: i32, rspec: RelocationHolder) -> Address {
        Address {
            base: NOREG,
            index: NOREG,
            xmm_index: XNOREG,
            scale: ScaleFactor::NoScale,
            disp,
            rspec,
        }
    }

    /// The same address carrying the given relocation descriptor.
    #[must_use]
    pub fn with_rspec(mut self, rspec: RelocationHolder) -> Address {
        self.rspec = rspec;
        self
    }

    /// A copy with `disp` added to the displacement.
    ///
    /// # Errors
    ///
    /// [`EmitError::DisplacementOverflow`] if the sum leaves the signed
    /// 32-bit range; the displacement never wraps.
    pub fn plus_disp(&self, disp: i32) -> Result<Address, EmitError> {
        let mut a = *self;
        a.disp = self.disp.checked_add(disp).ok_or(EmitError::DisplacementOverflow {
            value: i64::from(self.disp) + i64::from(disp),
        })?;
        Ok(a)
    }

    /// A copy with a register-or-constant displacement added.  The constant
    /// form folds `constant × scale_size` into the displacement; the
    /// register form installs the register as the index, which is rejected
    /// when the address already has one.
    ///
    /// # Errors
    ///
    /// [`EmitError::CompetingIndex`] if a register displacement meets an
    /// existing index; [`EmitError::DisplacementOverflow`] on an i32
    /// overflow of the fold.
    pub fn plus_disp_or_index(
        &self,
        disp: RegisterOrConstant,
        scale: ScaleFactor,
    ) -> Result<Address, EmitError> {
        let folded =
            i64::from(self.disp) + disp.constant_or_zero() * i64::from(scale_size_or_one(scale));
        let mut a = *self;
        a.disp = i32::try_from(folded)
            .map_err(|_| EmitError::DisplacementOverflow { value: folded })?;
        if let RegisterOrConstant::Register(reg) = disp {
            if self.index.is_valid() || self.xmm_index.is_valid() {
                return Err(EmitError::CompetingIndex);
            }
            a.index = reg;
            a.scale = scale;
            check_index_scale(a.index.is_valid(), a.scale)?;
        }
        Ok(a)
    }

    /// Structural comparison of base, index, scale, and displacement.
    /// Relocation metadata is disregarded.
    #[must_use]
    pub fn is_same_address(&self, other: &Address) -> bool {
        self.base == other.base
            && self.index == other.index
            && self.xmm_index == other.xmm_index
            && self.scale == other.scale
            && self.disp == other.disp
    }

    /// Whether `reg` participates in this address as base or index.
    #[must_use]
    pub fn uses(&self, reg: Gpr) -> bool {
        self.base == reg || self.index == reg
    }

    /// The base register, or [`NOREG`].
    #[inline]
    #[must_use]
    pub fn base_reg(&self) -> Gpr {
        self.base
    }

    /// The general-purpose index register, or [`NOREG`].
    #[inline]
    #[must_use]
    pub fn index_reg(&self) -> Gpr {
        self.index
    }

    /// The vector index register, or [`XNOREG`].
    #[inline]
    #[must_use]
    pub fn xmm_index_reg(&self) -> Xmm {
        self.xmm_index
    }

    /// The scale factor.
    #[inline]
    #[must_use]
    pub fn scale(&self) -> ScaleFactor {
        self.scale
    }

    /// The byte displacement.
    #[inline]
    #[must_use]
    pub fn disp(&self) -> i32 {
        self.disp
    }

    /// The embedded relocation descriptor.
    #[inline]
    #[must_use]
    pub fn rspec(&self) -> RelocationHolder {
        self.rspec
    }

    /// Whether the gather/scatter vector-index form is in use.
    #[inline]
    #[must_use]
    pub fn is_xmm_index(&self) -> bool {
        self.xmm_index.is_valid()
    }
}

fn check_index_scale(index_valid: bool, scale: ScaleFactor) -> Result<(), EmitError> {
    if index_valid == (scale != ScaleFactor::NoScale) {
        Ok(())
    } else {
        Err(EmitError::InconsistentAddress {
            detail: alloc::format!(
                "index {} but scale is {:?}",
                if index_valid { "present" } else { "absent" },
                scale
            ),
        })
    }
}

// A constant folded under NoScale still contributes `constant × 1`.
fn scale_size_or_one(scale: ScaleFactor) -> i32 {
    if scale == ScaleFactor::NoScale {
        1
    } else {
        scale.scale_size()
    }
}

// ─── AddressLiteral ─────────────────────────────────────────────────────

/// An absolute target address with its relocation kind, plus a flag
/// distinguishing "the address of this target" (lvalue) from "the value at
/// this target".  Immutable after construction except through [`addr`],
/// which returns an lvalue copy.
///
/// [`addr`]: AddressLiteral::addr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLiteral {
    rspec: RelocationHolder,
    is_lval: bool,
    target: u64,
}

impl AddressLiteral {
    /// A literal with an explicit relocation kind.
    #[must_use]
    pub fn new(target: u64, kind: RelocKind) -> Self {
        Self {
            rspec: RelocationHolder::new(kind, target),
            is_lval: false,
            target,
        }
    }

    /// A call target in runtime support code.
    #[must_use]
    pub fn runtime_call(target: u64) -> Self {
        Self::new(target, RelocKind::RuntimeCall)
    }

    /// An address of data outside the code buffer.  Targets in the first
    /// page are sometimes magic values rather than addresses and get no
    /// relocation.
    #[must_use]
    pub fn external_word(target: u64) -> Self {
        let kind = if target < 4096 {
            RelocKind::None
        } else {
            RelocKind::ExternalWord
        };
        Self::new(target, kind)
    }

    /// An address inside the code buffer being produced.
    #[must_use]
    pub fn internal_word(target: u64) -> Self {
        Self::new(target, RelocKind::InternalWord)
    }

    /// A copy referring to the address of the target rather than the value
    /// stored there.
    #[must_use]
    pub fn addr(&self) -> Self {
        let mut a = *self;
        a.is_lval = true;
        a
    }

    /// The target address.
    #[inline]
    #[must_use]
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Whether this literal refers to the target's address (lvalue).
    #[inline]
    #[must_use]
    pub fn is_lval(&self) -> bool {
        self.is_lval
    }

    /// The relocation descriptor.
    #[inline]
    #[must_use]
    pub fn rspec(&self) -> RelocationHolder {
        self.rspec
    }
}
