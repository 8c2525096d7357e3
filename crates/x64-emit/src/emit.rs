//! The prefix / ModRM / SIB emission engine.
//!
//! Given resolved operand encodings and the active [`InstructionAttr`], the
//! engine emits exactly one prefix family — legacy (optional REX), REX2,
//! VEX, or EVEX — followed by the opcode-map bytes, a ModR/M byte, a SIB
//! byte when the addressing form requires one, the smallest exact
//! displacement (or the EVEX-compressed 1-byte form), and any immediate.
//! Every relocatable value yields exactly one relocation record at exactly
//! the offset where its bytes were written.
//!
//! The family is decided once, at the start of an instruction, and every
//! byte after that is emitted under the same decision.

use crate::attr::{InstructionAttr, Width};
use crate::buffer::CodeBuffer;
use crate::error::EmitError;
use crate::operand::{Address, AddressLiteral, ScaleFactor};
use crate::reg::Gpr;
use crate::reloc::{RelocFormat, RelocKind, RelocationHolder};

/// Longest legal x86 instruction; used when projecting a worst-case
/// rip-relative origin for reachability checks.
const MAX_INSN_LEN: usize = 15;

// ─── Prefix families ────────────────────────────────────────────────────

/// The four mutually exclusive prefix families.  Exactly one is selected
/// per instruction; mixing families within one instruction is impossible by
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixFamily {
    /// No prefix or a classic REX byte; registers 0–15.
    Legacy,
    /// The two-byte REX2 prefix (`D5 xx`); registers 0–31, maps 0 and 1.
    Rex2,
    /// 2/3-byte VEX; registers 0–15, vector lengths 128/256.
    Vex,
    /// 4-byte EVEX; registers 0–31, opmask/broadcast/rounding, compressed
    /// displacement.
    Evex,
}

impl PrefixFamily {
    /// Human-readable family name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            PrefixFamily::Legacy => "legacy",
            PrefixFamily::Rex2 => "REX2",
            PrefixFamily::Vex => "VEX",
            PrefixFamily::Evex => "EVEX",
        }
    }
}

/// Opcode map: the escape-byte sequence of the legacy encoding, or the map
/// field of the VEX/EVEX/REX2 encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeMap {
    /// One-byte opcodes.
    Map0,
    /// `0F` escape.
    Map0F,
    /// `0F 38` escape.
    Map0F38,
    /// `0F 3A` escape.
    Map0F3A,
    /// APX extended-EVEX map 4 (promoted one-byte GP opcodes); has no
    /// legacy escape and is expressible only under EVEX.
    Map4,
}

impl OpcodeMap {
    /// The VEX `m-mmmm` / EVEX `mmm` field value.
    #[inline]
    #[must_use]
    pub(crate) fn map_bits(self) -> u8 {
        match self {
            OpcodeMap::Map0 => 0,
            OpcodeMap::Map0F => 1,
            OpcodeMap::Map0F38 => 2,
            OpcodeMap::Map0F3A => 3,
            OpcodeMap::Map4 => 4,
        }
    }

    /// The legacy escape bytes.
    #[inline]
    #[must_use]
    pub(crate) fn escape(self) -> &'static [u8] {
        match self {
            OpcodeMap::Map0 | OpcodeMap::Map4 => &[],
            OpcodeMap::Map0F => &[0x0F],
            OpcodeMap::Map0F38 => &[0x0F, 0x38],
            OpcodeMap::Map0F3A => &[0x0F, 0x3A],
        }
    }
}

/// Mandatory SIMD prefix: a literal byte in legacy encodings, the `pp`
/// field in VEX/EVEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimdPrefix {
    /// No mandatory prefix.
    None,
    /// `66`
    P66,
    /// `F3`
    PF3,
    /// `F2`
    PF2,
}

impl SimdPrefix {
    /// The VEX/EVEX `pp` field value.
    #[inline]
    #[must_use]
    pub(crate) fn pp_bits(self) -> u8 {
        match self {
            SimdPrefix::None => 0b00,
            SimdPrefix::P66 => 0b01,
            SimdPrefix::PF3 => 0b10,
            SimdPrefix::PF2 => 0b11,
        }
    }

    /// The legacy prefix byte, if any.
    #[inline]
    #[must_use]
    pub(crate) fn legacy_byte(self) -> Option<u8> {
        match self {
            SimdPrefix::None => None,
            SimdPrefix::P66 => Some(0x66),
            SimdPrefix::PF3 => Some(0xF3),
            SimdPrefix::PF2 => Some(0xF2),
        }
    }
}

// ─── Byte assembly helpers ──────────────────────────────────────────────

/// Build a REX byte (`0x40 | WRXB`).
#[inline]
pub(crate) fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    let mut val: u8 = 0x40;
    if w {
        val |= 0x08;
    }
    if r {
        val |= 0x04;
    }
    if x {
        val |= 0x02;
    }
    if b {
        val |= 0x01;
    }
    val
}

/// Whether a REX prefix with at least one flag is needed.
#[inline]
pub(crate) fn needs_rex(w: bool, r: bool, x: bool, b: bool) -> bool {
    w || r || x || b
}

/// Build a ModR/M byte.
#[inline]
pub(crate) fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// Build a SIB byte from raw `ss` bits.
#[inline]
pub(crate) fn sib(ss: u8, index: u8, base: u8) -> u8 {
    (ss << 6) | ((index & 7) << 3) | (base & 7)
}

#[inline]
fn is_i8(v: i32) -> bool {
    i8::try_from(v).is_ok()
}

// REX2 payload bits (second byte of the `D5 xx` prefix).
const REX2_B: u8 = 0x01;
const REX2_X: u8 = 0x02;
const REX2_R: u8 = 0x04;
const REX2_W: u8 = 0x08;
const REX2_B4: u8 = 0x10;
const REX2_X4: u8 = 0x20;
const REX2_R4: u8 = 0x40;
const REX2_M0: u8 = 0x80;

/// REX2 payload for one role given its full 0–31 encoding.
#[inline]
fn rex2_role_bits(enc: Option<u8>, bit3: u8, bit4: u8) -> u8 {
    match enc {
        Some(e) => {
            let mut bits = 0;
            if e & 0x08 != 0 {
                bits |= bit3;
            }
            if e & 0x10 != 0 {
                bits |= bit4;
            }
            bits
        }
        None => 0,
    }
}

// ─── The capability surface ─────────────────────────────────────────────

/// Raw byte-emission capability.
///
/// Exposed deliberately as a trait so the codegen layer that legitimately
/// needs low-level access (macro-expanded sequences, stub padding) can take
/// `&mut dyn RawEmit` instead of being granted access to the whole encoder.
pub trait RawEmit {
    /// Current write position in the output buffer.
    fn position(&self) -> usize;
    /// Append one byte.
    fn emit_u8(&mut self, b: u8);
    /// Append a 16-bit value, little-endian.
    fn emit_u16(&mut self, v: u16);
    /// Append a 32-bit value, little-endian.
    fn emit_u32(&mut self, v: u32);
    /// Append a 64-bit value, little-endian.
    fn emit_u64(&mut self, v: u64);
}

// ─── Assembler ──────────────────────────────────────────────────────────

/// The encoder: borrows one caller-owned [`CodeBuffer`] exclusively and
/// appends instruction bytes and relocation records to it.
///
/// One instance per compilation thread and buffer; there is no internal
/// synchronization and no suspension — encoding is a finite synchronous
/// computation.
#[derive(Debug)]
pub struct Assembler<'a> {
    code: &'a mut CodeBuffer,
    attributes: Option<InstructionAttr>,
}

/// RAII guard binding an [`InstructionAttr`] to the encoder for exactly one
/// instruction.  Dropping the guard clears the active-attributes slot on
/// every exit path, including early `?` returns, so configuration can never
/// leak into the next instruction.
#[derive(Debug)]
pub struct AttrScope<'s, 'a> {
    asm: &'s mut Assembler<'a>,
}

impl<'a> core::ops::Deref for AttrScope<'_, 'a> {
    type Target = Assembler<'a>;
    #[inline]
    fn deref(&self) -> &Assembler<'a> {
        self.asm
    }
}

impl<'a> core::ops::DerefMut for AttrScope<'_, 'a> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Assembler<'a> {
        self.asm
    }
}

impl Drop for AttrScope<'_, '_> {
    fn drop(&mut self) {
        self.asm.attributes = None;
    }
}

impl RawEmit for Assembler<'_> {
    #[inline]
    fn position(&self) -> usize {
        self.code.position()
    }
    #[inline]
    fn emit_u8(&mut self, b: u8) {
        self.code.emit_u8(b);
    }
    #[inline]
    fn emit_u16(&mut self, v: u16) {
        self.code.emit_u16(v);
    }
    #[inline]
    fn emit_u32(&mut self, v: u32) {
        self.code.emit_u32(v);
    }
    #[inline]
    fn emit_u64(&mut self, v: u64) {
        self.code.emit_u64(v);
    }
}

impl<'a> Assembler<'a> {
    /// Borrow `code` exclusively for encoding.
    pub fn new(code: &'a mut CodeBuffer) -> Self {
        Self {
            code,
            attributes: None,
        }
    }

    /// The underlying buffer.
    #[inline]
    #[must_use]
    pub fn code(&self) -> &CodeBuffer {
        self.code
    }

    /// Attach `attr` for the next instruction.  The returned guard is the
    /// only handle to the encoder until it drops, and dropping it clears
    /// the slot.
    pub fn attach(&mut self, attr: InstructionAttr) -> AttrScope<'_, 'a> {
        self.attributes = Some(attr);
        AttrScope { asm: self }
    }

    /// The active attributes, if an instruction is being encoded.
    #[inline]
    #[must_use]
    pub fn attributes(&self) -> Option<&InstructionAttr> {
        self.attributes.as_ref()
    }

    #[inline]
    pub(crate) fn attributes_mut(&mut self) -> Option<&mut InstructionAttr> {
        self.attributes.as_mut()
    }

    // ── general-purpose prefix selection ────────────────────────────────

    /// Select and emit the prefix for a reg,reg form.  Registers with
    /// encodings ≥ 16 promote the instruction to REX2; otherwise the
    /// narrowest legal legacy form (possibly REX-less) is used.
    pub fn gp_prefix_rr(
        &mut self,
        w: bool,
        reg: Gpr,
        rm: Gpr,
        map: OpcodeMap,
    ) -> Result<PrefixFamily, EmitError> {
        if reg.needs_rex2() || rm.needs_rex2() {
            self.check_rex2_map(map, &[reg, rm])?;
            let mut bits = if w { REX2_W } else { 0 };
            if reg.is_valid() {
                bits |= rex2_role_bits(Some(reg.encoding()), REX2_R, REX2_R4);
            }
            if rm.is_valid() {
                bits |= rex2_role_bits(Some(rm.encoding()), REX2_B, REX2_B4);
            }
            if map == OpcodeMap::Map0F {
                bits |= REX2_M0;
            }
            self.emit_u8(0xD5);
            self.emit_u8(bits);
            Ok(PrefixFamily::Rex2)
        } else {
            let r = reg.needs_rex();
            let b = rm.needs_rex();
            if needs_rex(w, r, false, b) {
                self.emit_u8(rex(w, r, false, b));
            }
            Ok(PrefixFamily::Legacy)
        }
    }

    /// Select and emit the prefix for a reg,mem form (`reg` may be
    /// [`crate::reg::NOREG`] for /digit forms).
    pub fn gp_prefix_mem(
        &mut self,
        w: bool,
        reg: Gpr,
        adr: &Address,
        map: OpcodeMap,
    ) -> Result<PrefixFamily, EmitError> {
        let base = adr.base_reg();
        let index = adr.index_reg();
        if reg.needs_rex2() || base.needs_rex2() || index.needs_rex2() {
            self.check_rex2_map(map, &[reg, base, index])?;
            let mut bits = if w { REX2_W } else { 0 };
            if reg.is_valid() {
                bits |= rex2_role_bits(Some(reg.encoding()), REX2_R, REX2_R4);
            }
            if base.is_valid() {
                bits |= rex2_role_bits(Some(base.encoding()), REX2_B, REX2_B4);
            }
            if index.is_valid() {
                bits |= rex2_role_bits(Some(index.encoding()), REX2_X, REX2_X4);
            }
            if map == OpcodeMap::Map0F {
                bits |= REX2_M0;
            }
            self.emit_u8(0xD5);
            self.emit_u8(bits);
            Ok(PrefixFamily::Rex2)
        } else {
            let r = reg.needs_rex();
            let x = index.needs_rex();
            let b = base.needs_rex();
            if needs_rex(w, r, x, b) {
                self.emit_u8(rex(w, r, x, b));
            }
            Ok(PrefixFamily::Legacy)
        }
    }

    /// Select and emit the prefix for an opcode-embedded register form
    /// (`push`/`pop`/`B8+rd`-style, register in the opcode's low 3 bits).
    pub fn gp_prefix_opreg(
        &mut self,
        w: bool,
        rm: Gpr,
        map: OpcodeMap,
    ) -> Result<PrefixFamily, EmitError> {
        self.gp_prefix_rr(w, crate::reg::NOREG, rm, map)
    }

    // REX2 expresses only maps 0 and 1; a map2/map3 instruction with an
    // extended register cannot be REX2-encoded.
    fn check_rex2_map(&self, map: OpcodeMap, regs: &[Gpr]) -> Result<(), EmitError> {
        if matches!(map, OpcodeMap::Map0 | OpcodeMap::Map0F) {
            return Ok(());
        }
        let enc = regs
            .iter()
            .find(|r| r.needs_rex2())
            .map_or(16, |r| r.encoding());
        Err(EmitError::RegisterOutOfRange {
            encoding: enc,
            family: "legacy",
        })
    }

    /// Emit the opcode-map bytes appropriate to the selected family, then
    /// the opcode itself.  Under REX2 the map-1 escape byte is omitted (the
    /// map lives in the prefix); under VEX/EVEX the map is always encoded
    /// in the prefix.
    pub fn emit_opcode(&mut self, family: PrefixFamily, map: OpcodeMap, opcode: u8) {
        match family {
            PrefixFamily::Legacy => {
                for &b in map.escape() {
                    self.emit_u8(b);
                }
                self.emit_u8(opcode);
            }
            PrefixFamily::Rex2 | PrefixFamily::Vex | PrefixFamily::Evex => {
                self.emit_u8(opcode);
            }
        }
    }

    // ── vector prefix selection ─────────────────────────────────────────

    /// Whether the active configuration and operand encodings force EVEX.
    fn evex_required(&self, encs: &[u8]) -> bool {
        let attr = self.attributes.as_ref();
        let forced = attr.is_some_and(|a| {
            a.is_evex_instruction()
                || a.embedded_opmask() != 0
                || a.is_extended_context()
                || a.vector_len() == crate::attr::VectorLen::L512
                || a.is_no_flags()
        });
        forced || encs.iter().any(|&e| e >= 16)
    }

    /// Select and emit the vector prefix for a reg,nds,reg form, deciding
    /// VEX-vs-EVEX once.  Returns the family and the ready-to-emit ModR/M
    /// byte (`mod`=11).
    ///
    /// Promotion: any encoding ≥ 16, an opmask, broadcast/rounding context,
    /// or a 512-bit length selects EVEX.  Demotion: everything else uses
    /// the shortest VEX form (2-byte when the map is `0F`, W=0, and no
    /// extension bit is needed on the r/m side) — pure code size, never
    /// semantics.
    pub fn vex_prefix_and_encode(
        &mut self,
        dst_enc: u8,
        nds_enc: u8,
        src_enc: u8,
        pre: SimdPrefix,
        map: OpcodeMap,
    ) -> Result<(PrefixFamily, u8), EmitError> {
        let w = self.attr_w();
        if self.evex_required(&[dst_enc, nds_enc, src_enc]) {
            self.require_promotable("vector operand")?;
            if let Some(a) = self.attributes_mut() {
                a.set_is_evex_instruction();
            }
            self.evex_prefix(
                dst_enc, nds_enc, None, Some(src_enc), pre, map, w, /*b_bit=*/ false,
            )?;
            Ok((PrefixFamily::Evex, modrm(0b11, dst_enc, src_enc)))
        } else {
            let l = self.attr_l256();
            self.vex_prefix(
                dst_enc & 8 != 0,
                false,
                src_enc & 8 != 0,
                nds_enc,
                pre,
                map,
                w,
                l,
            );
            Ok((PrefixFamily::Vex, modrm(0b11, dst_enc, src_enc)))
        }
    }

    /// Select and emit the vector prefix for a reg,nds,mem form.  The
    /// ModR/M/SIB/displacement must follow via [`Assembler::emit_operand`].
    pub fn vex_prefix_mem(
        &mut self,
        xreg_enc: u8,
        nds_enc: u8,
        adr: &Address,
        pre: SimdPrefix,
        map: OpcodeMap,
    ) -> Result<PrefixFamily, EmitError> {
        let base = adr.base_reg();
        let index = adr.index_reg();
        let xidx = adr.xmm_index_reg();
        let mut encs = alloc::vec![xreg_enc, nds_enc];
        if base.is_valid() {
            encs.push(base.encoding());
        }
        if index.is_valid() {
            encs.push(index.encoding());
        }
        if xidx.is_valid() {
            encs.push(xidx.encoding());
        }
        let w = self.attr_w();
        if self.evex_required(&encs) {
            self.require_promotable("memory operand")?;
            let b_bit = self
                .attributes
                .as_ref()
                .is_some_and(InstructionAttr::is_extended_context);
            if let Some(a) = self.attributes_mut() {
                a.set_is_evex_instruction();
            }
            self.evex_prefix(xreg_enc, nds_enc, Some(adr), None, pre, map, w, b_bit)?;
            Ok(PrefixFamily::Evex)
        } else {
            let x = index.needs_rex() || xidx.needs_rex();
            let b = base.needs_rex();
            let l = self.attr_l256();
            self.vex_prefix(xreg_enc & 8 != 0, x, b, nds_enc, pre, map, w, l);
            Ok(PrefixFamily::Vex)
        }
    }

    /// Extended-EVEX prefix for a promoted general-purpose reg,reg form
    /// (APX map 4, used by the flag-suppressed variants).  Returns the
    /// family and the ready-to-emit ModR/M byte.
    pub(crate) fn eevex_gp_prefix_rr(
        &mut self,
        reg_enc: u8,
        rm_enc: u8,
        pre: SimdPrefix,
    ) -> Result<(PrefixFamily, u8), EmitError> {
        self.require_promotable("flag-suppressed variant")?;
        if let Some(a) = self.attributes_mut() {
            a.set_is_evex_instruction();
        }
        let w = self.attr_w();
        self.evex_prefix(
            reg_enc,
            0,
            None,
            Some(rm_enc),
            pre,
            OpcodeMap::Map4,
            w,
            false,
        )?;
        Ok((PrefixFamily::Evex, modrm(0b11, reg_enc, rm_enc)))
    }

    /// Legacy SSE prefix for a reg,mem form: mandatory prefix byte, REX if
    /// required, escape bytes handled by [`Assembler::emit_opcode`].
    pub fn simd_prefix_legacy_mem(
        &mut self,
        xreg_enc: u8,
        adr: &Address,
        pre: SimdPrefix,
    ) -> Result<PrefixFamily, EmitError> {
        self.check_legacy_enc(xreg_enc)?;
        let base = adr.base_reg();
        let index = adr.index_reg();
        if base.needs_rex2() || index.needs_rex2() {
            let enc = if base.needs_rex2() {
                base.encoding()
            } else {
                index.encoding()
            };
            return Err(EmitError::RegisterOutOfRange {
                encoding: enc,
                family: "legacy SSE",
            });
        }
        if let Some(b) = pre.legacy_byte() {
            self.emit_u8(b);
        }
        let w = self.attr_w();
        let r = xreg_enc & 8 != 0;
        let x = index.needs_rex();
        let b = base.needs_rex();
        if needs_rex(w, r, x, b) {
            self.emit_u8(rex(w, r, x, b));
        }
        Ok(PrefixFamily::Legacy)
    }

    /// Legacy SSE prefix for a reg,reg form.
    pub fn simd_prefix_legacy_rr(
        &mut self,
        reg_enc: u8,
        rm_enc: u8,
        pre: SimdPrefix,
    ) -> Result<PrefixFamily, EmitError> {
        self.check_legacy_enc(reg_enc)?;
        self.check_legacy_enc(rm_enc)?;
        if let Some(b) = pre.legacy_byte() {
            self.emit_u8(b);
        }
        let w = self.attr_w();
        let r = reg_enc & 8 != 0;
        let b = rm_enc & 8 != 0;
        if needs_rex(w, r, false, b) {
            self.emit_u8(rex(w, r, false, b));
        }
        Ok(PrefixFamily::Legacy)
    }

    fn check_legacy_enc(&self, enc: u8) -> Result<(), EmitError> {
        if enc >= 16 {
            return Err(EmitError::RegisterOutOfRange {
                encoding: enc,
                family: "legacy SSE",
            });
        }
        Ok(())
    }

    // A legacy-pinned instruction cannot be promoted; reaching this with a
    // promotion trigger is a contract violation, not a fallback site.
    fn require_promotable(&self, what: &str) -> Result<(), EmitError> {
        if self
            .attributes
            .as_ref()
            .is_some_and(InstructionAttr::is_legacy_mode)
        {
            return Err(EmitError::EncodingConflict {
                detail: alloc::format!(
                    "{} requires EVEX but the instruction is pinned to a legacy family",
                    what
                ),
            });
        }
        Ok(())
    }

    #[inline]
    fn attr_w(&self) -> bool {
        self.attributes
            .as_ref()
            .is_some_and(InstructionAttr::is_rex_vex_w)
    }

    #[inline]
    fn attr_l256(&self) -> bool {
        self.attributes
            .as_ref()
            .is_some_and(|a| a.vector_len() == crate::attr::VectorLen::L256)
    }

    /// Emit the most compact VEX prefix: 2-byte when the map is `0F`, W=0,
    /// and neither X nor B extension is needed; 3-byte otherwise.
    #[allow(clippy::too_many_arguments)]
    fn vex_prefix(
        &mut self,
        r: bool,
        x: bool,
        b: bool,
        nds_enc: u8,
        pre: SimdPrefix,
        map: OpcodeMap,
        w: bool,
        l: bool,
    ) {
        let pp = pre.pp_bits();
        let mmmmm = map.map_bits();
        if mmmmm == 1 && !w && !x && !b {
            // C5 [~R vvvv L pp]
            let byte1 = (if r { 0 } else { 0x80 })
                | (((!nds_enc) & 0x0F) << 3)
                | (if l { 0x04 } else { 0 })
                | (pp & 0x03);
            self.emit_u8(0xC5);
            self.emit_u8(byte1);
        } else {
            // C4 [~R ~X ~B mmmmm] [W vvvv L pp]
            let byte1 = (if r { 0 } else { 0x80 })
                | (if x { 0 } else { 0x40 })
                | (if b { 0 } else { 0x20 })
                | (mmmmm & 0x1F);
            let byte2 = (if w { 0x80 } else { 0 })
                | (((!nds_enc) & 0x0F) << 3)
                | (if l { 0x04 } else { 0 })
                | (pp & 0x03);
            self.emit_u8(0xC4);
            self.emit_u8(byte1);
            self.emit_u8(byte2);
        }
    }

    /// Emit the 4-byte EVEX prefix.  `adr` carries the memory-side
    /// extension bits for reg,mem forms; `rm_enc` the r/m register for
    /// reg,reg forms.
    #[allow(clippy::too_many_arguments)]
    fn evex_prefix(
        &mut self,
        reg_enc: u8,
        nds_enc: u8,
        adr: Option<&Address>,
        rm_enc: Option<u8>,
        pre: SimdPrefix,
        map: OpcodeMap,
        w: bool,
        b_bit: bool,
    ) -> Result<(), EmitError> {
        let attr = self.attributes.as_ref().ok_or(EmitError::EncodingConflict {
            detail: alloc::string::String::from("EVEX emission without attached attributes"),
        })?;

        let r = reg_enc & 0x08 != 0;
        let r_prime = reg_enc & 0x10 != 0;
        let v_prime = nds_enc & 0x10 != 0;

        // X/B and the APX fourth bits depend on the r/m side's shape.
        let (x, b, x4, b4) = match (adr, rm_enc) {
            (Some(a), _) => {
                let base = a.base_reg();
                let index = a.index_reg();
                let xidx = a.xmm_index_reg();
                let x = index.needs_rex() || xidx.needs_rex();
                let b = base.needs_rex();
                // A vector index's bit 4 travels in EVEX.V'; a GPR index's
                // travels in the APX X4 slot.
                let x4 = index.needs_rex2();
                let b4 = base.needs_rex2();
                (x, b, x4, b4)
            }
            (None, Some(e)) => {
                // reg,reg form: r/m bit 3 in B, bit 4 in X (EVEX quirk).
                (e & 0x10 != 0, e & 0x08 != 0, false, false)
            }
            (None, None) => (false, false, false, false),
        };

        let v_prime = v_prime
            || adr.is_some_and(|a| a.xmm_index_reg().needs_rex2());

        let z = attr.is_clear_context() && attr.embedded_opmask() != 0;
        let ll = attr.vector_len().ll_bits();
        let aaa = attr.embedded_opmask();
        let nf = attr.is_no_flags();
        let pp = pre.pp_bits();
        let mm = map.map_bits();

        // P0: ~R ~X ~B ~R' B4 mmm.  B4 is stored straight (0 = no fourth
        // bit) so pre-APX encodings keep their classic byte values.
        let p0 = (if r { 0 } else { 0x80 })
            | (if x { 0 } else { 0x40 })
            | (if b { 0 } else { 0x20 })
            | (if r_prime { 0 } else { 0x10 })
            | (if b4 { 0x08 } else { 0 })
            | (mm & 0x07);

        // P1: W ~v3 ~v2 ~v1 ~v0 ~X4 pp.  ~X4 occupies the formerly fixed-1
        // bit, again keeping classic encodings byte-identical.
        let p1 = (if w { 0x80 } else { 0 })
            | (((!nds_enc) & 0x0F) << 3)
            | (if x4 { 0 } else { 0x04 })
            | (pp & 0x03);

        // P2: z L'L b ~V' aaa.  Promoted GP forms carry no opmask, so the
        // APX NF bit reuses aaa bit 2 there.
        let mut p2 = (if z { 0x80 } else { 0 })
            | ((ll & 0x03) << 5)
            | (if b_bit { 0x10 } else { 0 })
            | (if v_prime { 0 } else { 0x08 })
            | (aaa & 0x07);
        if nf && aaa == 0 {
            p2 |= 0x04;
        }

        self.emit_u8(0x62);
        self.emit_u8(p0);
        self.emit_u8(p1);
        self.emit_u8(p2);
        Ok(())
    }

    // ── ModRM / SIB / displacement ──────────────────────────────────────

    /// Emit ModR/M (+ SIB) and the displacement for `adr`, with `reg_enc`'s
    /// low 3 bits in the reg field.  `post_addr_length` is the number of
    /// immediate bytes that will follow the displacement and is needed to
    /// aim rip-relative displacements at the end of the instruction.
    ///
    /// Structural exception cases reproduced exactly:
    /// * base with low bits `100` (RSP/R12/R20/R28) always takes a SIB byte
    ///   with the no-index field, even with no real index;
    /// * no base with a relocation takes the rip-relative
    ///   `mod=00,rm=101,disp32` form;
    /// * no base and no relocation takes the absolute
    ///   `mod=00,rm=100,SIB(base=101)` disp32 form;
    /// * base with low bits `101` (RBP/R13/…) and zero displacement still
    ///   takes `mod=01` with a zero disp8.
    pub fn emit_operand(
        &mut self,
        reg_enc: u8,
        adr: &Address,
        post_addr_length: usize,
    ) -> Result<(), EmitError> {
        let base = adr.base_reg();
        let index_low3 = if adr.index_reg().is_valid() {
            Some(adr.index_reg().low3())
        } else if adr.xmm_index_reg().is_valid() {
            Some(adr.xmm_index_reg().low3())
        } else {
            None
        };
        let disp = adr.disp();
        let rspec = adr.rspec();

        if base.is_valid() {
            if adr.index_reg().is_valid() && adr.index_reg().low3() == 4
                && !adr.index_reg().needs_rex() && !adr.index_reg().needs_rex2()
            {
                // SIB index field 100 with no X extension means "no index";
                // RSP itself can never be an index register.
                return Err(EmitError::InconsistentAddress {
                    detail: alloc::string::String::from("RSP cannot be an index register"),
                });
            }
            let need_sib = index_low3.is_some() || base.low3() == 4;
            let ss = adr.scale().ss_bits();
            let idx = index_low3.unwrap_or(0b100);

            if disp == 0 && base.low3() != 5 && !rspec.is_some() {
                // mod=00: no displacement.
                if need_sib {
                    self.emit_u8(modrm(0b00, reg_enc, 0b100));
                    self.emit_u8(sib(ss, idx, base.low3()));
                } else {
                    self.emit_u8(modrm(0b00, reg_enc, base.low3()));
                }
            } else if !rspec.is_some() {
                if let Some(d8) = self.disp8_form(disp) {
                    // mod=01: one displacement byte (possibly compressed).
                    if need_sib {
                        self.emit_u8(modrm(0b01, reg_enc, 0b100));
                        self.emit_u8(sib(ss, idx, base.low3()));
                    } else {
                        self.emit_u8(modrm(0b01, reg_enc, base.low3()));
                    }
                    self.emit_u8(d8 as u8);
                } else {
                    // mod=10: full 32-bit displacement.
                    if need_sib {
                        self.emit_u8(modrm(0b10, reg_enc, 0b100));
                        self.emit_u8(sib(ss, idx, base.low3()));
                    } else {
                        self.emit_u8(modrm(0b10, reg_enc, base.low3()));
                    }
                    self.emit_u32(disp as u32);
                }
            } else {
                // Relocated displacement: always the full 32-bit field.
                if need_sib {
                    self.emit_u8(modrm(0b10, reg_enc, 0b100));
                    self.emit_u8(sib(ss, idx, base.low3()));
                } else {
                    self.emit_u8(modrm(0b10, reg_enc, base.low3()));
                }
                self.code
                    .relocate_here(rspec.kind(), RelocFormat::Disp32, rspec.target());
                self.emit_u32(disp as u32);
            }
        } else if let Some(idx) = index_low3 {
            // [index*scale + disp32]: no base, mod=00, SIB base field 101.
            debug_assert!(adr.scale() != ScaleFactor::NoScale);
            self.emit_u8(modrm(0b00, reg_enc, 0b100));
            self.emit_u8(sib(adr.scale().ss_bits(), idx, 0b101));
            if rspec.is_some() {
                self.code
                    .relocate_here(rspec.kind(), RelocFormat::Disp32, rspec.target());
            }
            self.emit_u32(disp as u32);
        } else if rspec.is_some() {
            // [rip + disp32]: aimed at the end of the instruction.  The
            // range check runs before any byte or record lands, so an
            // unreachable target leaves the buffer untouched.
            let next = self
                .code
                .base()
                .wrapping_add((self.code.position() + 1 + 4 + post_addr_length) as u64);
            let delta = i64::wrapping_sub(rspec.target() as i64, next as i64);
            let rel = i32::try_from(delta).map_err(|_| EmitError::UnreachableTarget {
                target: rspec.target(),
            })?;
            self.emit_u8(modrm(0b00, reg_enc, 0b101));
            self.code
                .relocate_here(rspec.kind(), RelocFormat::Disp32, rspec.target());
            self.emit_u32(rel as u32);
        } else {
            // [disp32] absolute: needs the SIB no-base form in 64-bit mode.
            self.emit_u8(modrm(0b00, reg_enc, 0b100));
            self.emit_u8(sib(0, 0b100, 0b101));
            self.emit_u32(disp as u32);
        }
        Ok(())
    }

    /// The 1-byte displacement to emit under `mod=01`, if one exists.
    ///
    /// EVEX instructions with a compressing tuple type use the compressed
    /// form: representable iff the displacement is an exact multiple of the
    /// element size and the quotient fits a signed byte — checked with
    /// exact integer arithmetic, never approximated.  Everything else uses
    /// a plain signed-byte check.
    fn disp8_form(&self, disp: i32) -> Option<i8> {
        if let Some(attr) = self.attributes.as_ref() {
            if attr.is_evex_instruction() {
                if let Some(mult) = attr.disp_multiplier() {
                    if disp % mult != 0 {
                        return None;
                    }
                    let q = disp / mult;
                    return i8::try_from(q).ok();
                }
            }
        }
        if is_i8(disp) {
            Some(disp as i8)
        } else {
            None
        }
    }

    // ── immediates and relocated data ───────────────────────────────────

    /// Emit a 32-bit value, recording one relocation when `rspec` carries
    /// one.
    pub fn emit_data32(&mut self, data: i32, rspec: RelocationHolder, format: RelocFormat) {
        if rspec.is_some() {
            self.code.relocate_here(rspec.kind(), format, rspec.target());
        }
        self.emit_u32(data as u32);
    }

    /// Emit a 64-bit value, recording one relocation when `rspec` carries
    /// one.
    ///
    /// # Errors
    ///
    /// [`EmitError::ImmediateOverflow`] when the active configuration
    /// declares a 32-bit (or narrower) operand width: an 8-byte embedding
    /// is only legal for forms that define it, never a silent truncation.
    pub fn emit_data64(
        &mut self,
        data: i64,
        rspec: RelocationHolder,
        format: RelocFormat,
    ) -> Result<(), EmitError> {
        if let Some(attr) = self.attributes.as_ref() {
            if !attr.is_rex_vex_w() {
                return Err(EmitError::ImmediateOverflow {
                    value: data,
                    width: Width::D,
                });
            }
        }
        if rspec.is_some() {
            self.code.relocate_here(rspec.kind(), format, rspec.target());
        }
        self.emit_u64(data as u64);
        Ok(())
    }

    // ── relocatable-literal resolution ──────────────────────────────────

    /// Whether a rip-relative 32-bit displacement can reach `lit` from any
    /// byte of the instruction about to be emitted (worst case over the
    /// longest legal instruction).
    #[must_use]
    pub fn reachable(&self, lit: &AddressLiteral) -> bool {
        if lit.rspec().kind() == RelocKind::InternalWord {
            // Same buffer: the distance is bounded by the blob size.
            return true;
        }
        let target = lit.target() as i64;
        let here = self.code.base().wrapping_add(self.code.position() as u64) as i64;
        let lo = target.wrapping_sub(here.wrapping_add(MAX_INSN_LEN as i64));
        let hi = target.wrapping_sub(here);
        i32::try_from(lo).is_ok() && i32::try_from(hi).is_ok()
    }

    /// Conservative variant: only true when the target's placement relative
    /// to this buffer is already fixed.  Targets still awaiting final
    /// placement must be assumed worst-case until resolved.
    #[must_use]
    pub fn always_reachable(&self, lit: &AddressLiteral) -> bool {
        lit.rspec().kind() == RelocKind::InternalWord
    }

    /// The rip-relative operand for `lit`, when reachable.
    ///
    /// # Errors
    ///
    /// [`EmitError::UnreachableTarget`] when the displacement cannot fit;
    /// materializing the address into a register is then the caller's job.
    pub fn as_rip_operand(&self, lit: &AddressLiteral) -> Result<Address, EmitError> {
        if !self.reachable(lit) {
            return Err(EmitError::UnreachableTarget {
                target: lit.target(),
            });
        }
        Ok(Address::rip_relative(0, lit.rspec()))
    }
}
