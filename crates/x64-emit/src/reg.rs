//! Register identities.
//!
//! Registers are opaque IDs exposing only a numeric encoding and a validity
//! test — the upper compiler layers own naming, classes, and allocation.
//! General-purpose encodings run 0–31 (16–31 are the APX extended GPRs),
//! vector encodings run 0–31 (16–31 require EVEX/REX2-capable prefixes), and
//! opmask encodings run 0–7.

use core::fmt;

/// A general-purpose register identity (encoding 0–31), or the invalid
/// sentinel [`NOREG`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(i8);

/// The invalid general-purpose register.
pub const NOREG: Gpr = Gpr(-1);

impl Gpr {
    /// Construct from a raw encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not in `0..32`.
    #[must_use]
    pub const fn new(enc: u8) -> Self {
        assert!(enc < 32, "GPR encoding out of range");
        Gpr(enc as i8)
    }

    /// Whether this is a real register (not [`NOREG`]).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The numeric encoding.
    ///
    /// # Panics
    ///
    /// Panics on [`NOREG`].
    #[inline]
    #[must_use]
    pub const fn encoding(self) -> u8 {
        assert!(self.0 >= 0, "encoding() on invalid register");
        self.0 as u8
    }

    /// Low 3 bits of the encoding (the ModRM/SIB field value).
    #[inline]
    #[must_use]
    pub const fn low3(self) -> u8 {
        self.encoding() & 7
    }

    /// Whether the encoding needs one extension bit (REX.R/X/B or the
    /// equivalent VEX/EVEX bit): encoding 8–15.
    #[inline]
    #[must_use]
    pub const fn needs_rex(self) -> bool {
        self.is_valid() && (self.encoding() & 8) == 8
    }

    /// Whether the encoding needs a second extension bit (REX2/EVEX only):
    /// encoding 16–31.
    #[inline]
    #[must_use]
    pub const fn needs_rex2(self) -> bool {
        self.is_valid() && self.encoding() >= 16
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "r{}", self.0)
        } else {
            write!(f, "noreg")
        }
    }
}

pub const RAX: Gpr = Gpr(0);
pub const RCX: Gpr = Gpr(1);
pub const RDX: Gpr = Gpr(2);
pub const RBX: Gpr = Gpr(3);
pub const RSP: Gpr = Gpr(4);
pub const RBP: Gpr = Gpr(5);
pub const RSI: Gpr = Gpr(6);
pub const RDI: Gpr = Gpr(7);
pub const R8: Gpr = Gpr(8);
pub const R9: Gpr = Gpr(9);
pub const R10: Gpr = Gpr(10);
pub const R11: Gpr = Gpr(11);
pub const R12: Gpr = Gpr(12);
pub const R13: Gpr = Gpr(13);
pub const R14: Gpr = Gpr(14);
pub const R15: Gpr = Gpr(15);
pub const R16: Gpr = Gpr(16);
pub const R17: Gpr = Gpr(17);
pub const R18: Gpr = Gpr(18);
pub const R19: Gpr = Gpr(19);
pub const R20: Gpr = Gpr(20);
pub const R21: Gpr = Gpr(21);
pub const R22: Gpr = Gpr(22);
pub const R23: Gpr = Gpr(23);
pub const R24: Gpr = Gpr(24);
pub const R25: Gpr = Gpr(25);
pub const R26: Gpr = Gpr(26);
pub const R27: Gpr = Gpr(27);
pub const R28: Gpr = Gpr(28);
pub const R29: Gpr = Gpr(29);
pub const R30: Gpr = Gpr(30);
pub const R31: Gpr = Gpr(31);

/// A vector register identity (encoding 0–31).  The operand width
/// (XMM/YMM/ZMM view) is decided by the instruction's configuration, not by
/// the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(i8);

/// The invalid vector register.
pub const XNOREG: Xmm = Xmm(-1);

impl Xmm {
    /// Construct from a raw encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not in `0..32`.
    #[must_use]
    pub const fn new(enc: u8) -> Self {
        assert!(enc < 32, "XMM encoding out of range");
        Xmm(enc as i8)
    }

    /// Whether this is a real register (not [`XNOREG`]).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The numeric encoding.
    ///
    /// # Panics
    ///
    /// Panics on [`XNOREG`].
    #[inline]
    #[must_use]
    pub const fn encoding(self) -> u8 {
        assert!(self.0 >= 0, "encoding() on invalid register");
        self.0 as u8
    }

    /// Low 3 bits of the encoding.
    #[inline]
    #[must_use]
    pub const fn low3(self) -> u8 {
        self.encoding() & 7
    }

    /// Whether the encoding needs one extension bit: encoding 8–15.
    #[inline]
    #[must_use]
    pub const fn needs_rex(self) -> bool {
        self.is_valid() && (self.encoding() & 8) == 8
    }

    /// Whether the encoding needs a second extension bit (EVEX-only range):
    /// encoding 16–31.
    #[inline]
    #[must_use]
    pub const fn needs_rex2(self) -> bool {
        self.is_valid() && self.encoding() >= 16
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "xmm{}", self.0)
        } else {
            write!(f, "xnoreg")
        }
    }
}

pub const XMM0: Xmm = Xmm(0);
pub const XMM1: Xmm = Xmm(1);
pub const XMM2: Xmm = Xmm(2);
pub const XMM3: Xmm = Xmm(3);
pub const XMM4: Xmm = Xmm(4);
pub const XMM5: Xmm = Xmm(5);
pub const XMM6: Xmm = Xmm(6);
pub const XMM7: Xmm = Xmm(7);
pub const XMM8: Xmm = Xmm(8);
pub const XMM9: Xmm = Xmm(9);
pub const XMM10: Xmm = Xmm(10);
pub const XMM11: Xmm = Xmm(11);
pub const XMM12: Xmm = Xmm(12);
pub const XMM13: Xmm = Xmm(13);
pub const XMM14: Xmm = Xmm(14);
pub const XMM15: Xmm = Xmm(15);
pub const XMM16: Xmm = Xmm(16);
pub const XMM17: Xmm = Xmm(17);
pub const XMM18: Xmm = Xmm(18);
pub const XMM19: Xmm = Xmm(19);
pub const XMM20: Xmm = Xmm(20);
pub const XMM21: Xmm = Xmm(21);
pub const XMM22: Xmm = Xmm(22);
pub const XMM23: Xmm = Xmm(23);
pub const XMM24: Xmm = Xmm(24);
pub const XMM25: Xmm = Xmm(25);
pub const XMM26: Xmm = Xmm(26);
pub const XMM27: Xmm = Xmm(27);
pub const XMM28: Xmm = Xmm(28);
pub const XMM29: Xmm = Xmm(29);
pub const XMM30: Xmm = Xmm(30);
pub const XMM31: Xmm = Xmm(31);

/// An opmask (predicate) register identity, `k0`–`k7`.
///
/// `k0` is the "no masking" specifier: it cannot be used as a real
/// predicate, so an embedded opmask field of 0 means unmasked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KReg(i8);

/// The invalid opmask register.
pub const KNOREG: KReg = KReg(-1);

impl KReg {
    /// Construct from a raw encoding.
    ///
    /// # Panics
    ///
    /// Panics if `enc` is not in `0..8`.
    #[must_use]
    pub const fn new(enc: u8) -> Self {
        assert!(enc < 8, "opmask encoding out of range");
        KReg(enc as i8)
    }

    /// Whether this is a real register (not [`KNOREG`]).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// The numeric encoding.
    ///
    /// # Panics
    ///
    /// Panics on [`KNOREG`].
    #[inline]
    #[must_use]
    pub const fn encoding(self) -> u8 {
        assert!(self.0 >= 0, "encoding() on invalid register");
        self.0 as u8
    }
}

impl fmt::Display for KReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "k{}", self.0)
        } else {
            write!(f, "knoreg")
        }
    }
}

pub const K0: KReg = KReg(0);
pub const K1: KReg = KReg(1);
pub const K2: KReg = KReg(2);
pub const K3: KReg = KReg(3);
pub const K4: KReg = KReg(4);
pub const K5: KReg = KReg(5);
pub const K6: KReg = KReg(6);
pub const K7: KReg = KReg(7);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_extension_predicates() {
        assert!(!RAX.needs_rex());
        assert!(!RDI.needs_rex());
        assert!(R8.needs_rex());
        assert!(R15.needs_rex());
        assert!(!R15.needs_rex2());
        assert!(!R16.needs_rex());
        assert!(R16.needs_rex2());
        assert!(R31.needs_rex2());
        assert!(!NOREG.needs_rex());
        assert!(!NOREG.needs_rex2());
    }

    #[test]
    fn gpr_low3_wraps_at_eight() {
        assert_eq!(RSP.low3(), 4);
        assert_eq!(R12.low3(), 4);
        assert_eq!(RBP.low3(), 5);
        assert_eq!(R13.low3(), 5);
        assert_eq!(R31.low3(), 7);
    }

    #[test]
    fn invalid_registers() {
        assert!(!NOREG.is_valid());
        assert!(!XNOREG.is_valid());
        assert!(!KNOREG.is_valid());
        assert!(K0.is_valid());
    }

    #[test]
    fn xmm_evex_range() {
        assert!(XMM15.needs_rex());
        assert!(!XMM15.needs_rex2());
        assert!(XMM16.needs_rex2());
        assert!(XMM31.needs_rex2());
    }
}
