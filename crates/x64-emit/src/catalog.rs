//! The data-driven instruction catalog.
//!
//! Instead of one hand-written entry point per mnemonic, each instruction is
//! a row in a static descriptor table: opcode map, opcodes per operand
//! direction, the `/digit` extension, the mandatory SIMD prefix, and a flag
//! set describing which operand shapes and encoding features the form
//! supports.  [`Insn`] is the caller-facing builder; [`Assembler::encode`]
//! looks the mnemonic up and drives the emission engine from the row.
//!
//! Register-to-register forms use the RM direction (`reg ← r/m`), so
//! `add rax, rbx` is `48 03 C3`, not `48 01 D8`.

use alloc::string::ToString;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::attr::{InputSize, InstructionAttr, TupleType, VectorLen, Width};
use crate::emit::{Assembler, OpcodeMap, RawEmit, SimdPrefix};
use crate::error::EmitError;
use crate::operand::{Address, AddressLiteral};
use crate::reg::{Gpr, KReg, Xmm};
use crate::reloc::RelocFormat;

bitflags! {
    /// Operand shapes and encoding features a descriptor supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsnFlags: u32 {
        /// `reg, reg` (RM direction).
        const RR = 1 << 0;
        /// `reg, mem`.
        const RM = 1 << 1;
        /// `mem, reg`.
        const MR = 1 << 2;
        /// `reg, imm`.
        const RI = 1 << 3;
        /// `mem, imm`.
        const MI = 1 << 4;
        /// Single r/m operand through the `/digit` field.
        const UNARY = 1 << 5;
        /// Register embedded in the opcode's low 3 bits.
        const OPREG = 1 << 6;
        /// 64-bit form exists (REX.W / VEX.W / EVEX.W).
        const W_OK = 1 << 7;
        /// Sign-extended 1-byte immediate alternative (`83 /digit` style).
        const IMM8 = 1 << 8;
        /// Immediate is always one byte (shift counts).
        const IMM8_ONLY = 1 << 9;
        /// Full 8-byte immediate form (`B8+rd`).
        const IMM64 = 1 << 10;
        /// Three-operand VEX/EVEX form with an NDS source.
        const NDS = 1 << 11;
        /// Opmask predication and zeroing are legal.
        const MASK = 1 << 12;
        /// Embedded memory broadcast is legal.
        const BCAST = 1 << 13;
        /// APX flag-suppressed variant exists (promoted map-4 form).
        const NF = 1 << 14;
        /// Vector form (operands are XMM identities).
        const VEC = 1 << 15;
        /// Legacy-SSE vector form (no VEX/EVEX, registers 0-15 only).
        const SSE = 1 << 16;
    }
}

/// One catalog row.
#[derive(Debug, Clone, Copy)]
pub struct InsnDescriptor {
    pub mnemonic: &'static str,
    pub map: OpcodeMap,
    pub pre: SimdPrefix,
    /// Opcode for the RM direction (also RR, and the NDS vector form).
    pub op_rm: u8,
    /// Opcode for the MR direction.
    pub op_mr: u8,
    /// Opcode for the immediate form.
    pub op_imm: u8,
    /// Opcode for the sign-extended imm8 form ([`InsnFlags::IMM8`]).
    pub op_imm8: u8,
    /// ModRM reg-field extension for immediate and unary forms.
    pub digit: u8,
    pub flags: InsnFlags,
    pub tuple: TupleType,
    pub input: InputSize,
}

const fn gp(
    mnemonic: &'static str,
    op_rm: u8,
    op_mr: u8,
    op_imm: u8,
    op_imm8: u8,
    digit: u8,
    flags: InsnFlags,
) -> InsnDescriptor {
    InsnDescriptor {
        mnemonic,
        map: OpcodeMap::Map0,
        pre: SimdPrefix::None,
        op_rm,
        op_mr,
        op_imm,
        op_imm8,
        digit,
        flags,
        tuple: TupleType::NoScale,
        input: InputSize::NoBits,
    }
}

const fn vec(
    mnemonic: &'static str,
    map: OpcodeMap,
    pre: SimdPrefix,
    op_rm: u8,
    op_mr: u8,
    flags: InsnFlags,
    tuple: TupleType,
    input: InputSize,
) -> InsnDescriptor {
    InsnDescriptor {
        mnemonic,
        map,
        pre,
        op_rm,
        op_mr,
        op_imm: 0,
        op_imm8: 0,
        digit: 0,
        flags,
        tuple,
        input,
    }
}

// Shape shorthands used below.
const ALU: InsnFlags = InsnFlags::RR
    .union(InsnFlags::RM)
    .union(InsnFlags::MR)
    .union(InsnFlags::RI)
    .union(InsnFlags::MI)
    .union(InsnFlags::IMM8)
    .union(InsnFlags::W_OK)
    .union(InsnFlags::NF);
const SHIFT: InsnFlags = InsnFlags::RI
    .union(InsnFlags::MI)
    .union(InsnFlags::IMM8_ONLY)
    .union(InsnFlags::W_OK)
    .union(InsnFlags::NF);
const UN: InsnFlags = InsnFlags::UNARY.union(InsnFlags::W_OK).union(InsnFlags::NF);
const AVX: InsnFlags = InsnFlags::VEC
    .union(InsnFlags::NDS)
    .union(InsnFlags::RR)
    .union(InsnFlags::RM)
    .union(InsnFlags::MASK)
    .union(InsnFlags::BCAST);
const SSE_RM: InsnFlags = InsnFlags::VEC
    .union(InsnFlags::SSE)
    .union(InsnFlags::RR)
    .union(InsnFlags::RM);

/// The instruction table.  Kept sorted by mnemonic for readability; lookup
/// is a linear scan, which is adequate at this size and keeps rows `const`.
static CATALOG: &[InsnDescriptor] = &[
    gp("adc", 0x13, 0x11, 0x81, 0x83, 2, ALU),
    gp("add", 0x03, 0x01, 0x81, 0x83, 0, ALU),
    vec(
        "addsd",
        OpcodeMap::Map0F,
        SimdPrefix::PF2,
        0x58,
        0,
        SSE_RM,
        TupleType::T1s,
        InputSize::Bits64,
    ),
    vec(
        "addss",
        OpcodeMap::Map0F,
        SimdPrefix::PF3,
        0x58,
        0,
        SSE_RM,
        TupleType::T1s,
        InputSize::Bits32,
    ),
    gp("and", 0x23, 0x21, 0x81, 0x83, 4, ALU),
    gp(
        "cmp",
        0x3B,
        0x39,
        0x81,
        0x83,
        7,
        ALU.difference(InsnFlags::NF),
    ),
    gp("dec", 0, 0, 0xFF, 0, 1, UN),
    gp("imul", 0xAF, 0, 0, 0, 0, {
        InsnFlags::RR
            .union(InsnFlags::RM)
            .union(InsnFlags::W_OK)
            .union(InsnFlags::NF)
    })
    .with_map(OpcodeMap::Map0F),
    gp("inc", 0, 0, 0xFF, 0, 0, UN),
    gp("lea", 0x8D, 0, 0, 0, 0, InsnFlags::RM.union(InsnFlags::W_OK)),
    gp(
        "mov",
        0x8B,
        0x89,
        0xC7,
        0,
        0,
        InsnFlags::RR
            .union(InsnFlags::RM)
            .union(InsnFlags::MR)
            .union(InsnFlags::RI)
            .union(InsnFlags::MI)
            .union(InsnFlags::IMM64)
            .union(InsnFlags::W_OK),
    ),
    vec(
        "movsd",
        OpcodeMap::Map0F,
        SimdPrefix::PF2,
        0x10,
        0x11,
        SSE_RM.union(InsnFlags::MR),
        TupleType::T1s,
        InputSize::Bits64,
    ),
    vec(
        "movss",
        OpcodeMap::Map0F,
        SimdPrefix::PF3,
        0x10,
        0x11,
        SSE_RM.union(InsnFlags::MR),
        TupleType::T1s,
        InputSize::Bits32,
    ),
    gp("movsxb", 0xBE, 0, 0, 0, 0, InsnFlags::RR.union(InsnFlags::RM).union(InsnFlags::W_OK))
        .with_map(OpcodeMap::Map0F),
    gp("movsxd", 0x63, 0, 0, 0, 0, InsnFlags::RR.union(InsnFlags::RM).union(InsnFlags::W_OK)),
    gp("movsxw", 0xBF, 0, 0, 0, 0, InsnFlags::RR.union(InsnFlags::RM).union(InsnFlags::W_OK))
        .with_map(OpcodeMap::Map0F),
    gp("movzxb", 0xB6, 0, 0, 0, 0, InsnFlags::RR.union(InsnFlags::RM).union(InsnFlags::W_OK))
        .with_map(OpcodeMap::Map0F),
    gp("movzxw", 0xB7, 0, 0, 0, 0, InsnFlags::RR.union(InsnFlags::RM).union(InsnFlags::W_OK))
        .with_map(OpcodeMap::Map0F),
    vec(
        "mulsd",
        OpcodeMap::Map0F,
        SimdPrefix::PF2,
        0x59,
        0,
        SSE_RM,
        TupleType::T1s,
        InputSize::Bits64,
    ),
    vec(
        "mulss",
        OpcodeMap::Map0F,
        SimdPrefix::PF3,
        0x59,
        0,
        SSE_RM,
        TupleType::T1s,
        InputSize::Bits32,
    ),
    gp("neg", 0, 0, 0xF7, 0, 3, UN),
    gp("not", 0, 0, 0xF7, 0, 2, UN.difference(InsnFlags::NF)),
    gp("or", 0x0B, 0x09, 0x81, 0x83, 1, ALU),
    gp(
        "pop",
        0,
        0,
        0x8F,
        0,
        0,
        InsnFlags::OPREG.union(InsnFlags::UNARY),
    )
    .with_opreg_base(0x58),
    gp(
        "push",
        0,
        0,
        0xFF,
        0,
        6,
        InsnFlags::OPREG.union(InsnFlags::UNARY),
    )
    .with_opreg_base(0x50),
    gp("sar", 0, 0, 0xC1, 0, 7, SHIFT),
    gp("sbb", 0x1B, 0x19, 0x81, 0x83, 3, ALU),
    gp("shl", 0, 0, 0xC1, 0, 4, SHIFT),
    gp("shr", 0, 0, 0xC1, 0, 5, SHIFT),
    gp("sub", 0x2B, 0x29, 0x81, 0x83, 5, ALU),
    // test reg,reg is commutative, so the RR arm reuses the 85 /r opcode.
    gp(
        "test",
        0x85,
        0x85,
        0xF7,
        0,
        0,
        InsnFlags::MR
            .union(InsnFlags::RR)
            .union(InsnFlags::RI)
            .union(InsnFlags::MI)
            .union(InsnFlags::W_OK),
    ),
    vec(
        "vaddpd",
        OpcodeMap::Map0F,
        SimdPrefix::P66,
        0x58,
        0,
        AVX.union(InsnFlags::W_OK),
        TupleType::Fv,
        InputSize::Bits64,
    ),
    vec(
        "vaddps",
        OpcodeMap::Map0F,
        SimdPrefix::None,
        0x58,
        0,
        AVX,
        TupleType::Fv,
        InputSize::Bits32,
    ),
    vec(
        "vaddsd",
        OpcodeMap::Map0F,
        SimdPrefix::PF2,
        0x58,
        0,
        AVX.difference(InsnFlags::BCAST).union(InsnFlags::W_OK),
        TupleType::T1s,
        InputSize::Bits64,
    ),
    vec(
        "vaddss",
        OpcodeMap::Map0F,
        SimdPrefix::PF3,
        0x58,
        0,
        AVX.difference(InsnFlags::BCAST),
        TupleType::T1s,
        InputSize::Bits32,
    ),
    vec(
        "vmovdqu",
        OpcodeMap::Map0F,
        SimdPrefix::PF3,
        0x6F,
        0x7F,
        InsnFlags::VEC
            .union(InsnFlags::RR)
            .union(InsnFlags::RM)
            .union(InsnFlags::MR)
            .union(InsnFlags::MASK),
        TupleType::Fvm,
        InputSize::Bits32,
    ),
    vec(
        "vpaddd",
        OpcodeMap::Map0F,
        SimdPrefix::P66,
        0xFE,
        0,
        AVX,
        TupleType::Fv,
        InputSize::Bits32,
    ),
    vec(
        "vpaddq",
        OpcodeMap::Map0F,
        SimdPrefix::P66,
        0xD4,
        0,
        AVX.union(InsnFlags::W_OK),
        TupleType::Fv,
        InputSize::Bits64,
    ),
    gp("xor", 0x33, 0x31, 0x81, 0x83, 6, ALU),
];

impl InsnDescriptor {
    const fn with_map(mut self, map: OpcodeMap) -> Self {
        self.map = map;
        self
    }

    // The opcode-embedded-register base rides in the otherwise unused RM
    // slot for OPREG rows.
    const fn with_opreg_base(mut self, base: u8) -> Self {
        self.op_rm = base;
        self
    }

    fn find(mnemonic: &str) -> Result<&'static InsnDescriptor, EmitError> {
        CATALOG
            .iter()
            .find(|d| d.mnemonic == mnemonic)
            .ok_or_else(|| EmitError::UnknownMnemonic {
                mnemonic: mnemonic.to_string(),
            })
    }
}

/// One instruction operand.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Gpr(Gpr),
    Xmm(Xmm),
    Mem(Address),
    Imm(i64),
}

impl From<Gpr> for Operand {
    fn from(r: Gpr) -> Self {
        Operand::Gpr(r)
    }
}
impl From<Xmm> for Operand {
    fn from(r: Xmm) -> Self {
        Operand::Xmm(r)
    }
}
impl From<Address> for Operand {
    fn from(a: Address) -> Self {
        Operand::Mem(a)
    }
}
impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Operand::Imm(v)
    }
}
impl From<i32> for Operand {
    fn from(v: i32) -> Self {
        Operand::Imm(i64::from(v))
    }
}

/// Builder for one instruction: mnemonic, operands in assembly order
/// (destination first), and the optional encoding requests that map onto
/// [`InstructionAttr`].
#[derive(Debug, Clone)]
pub struct Insn {
    mnemonic: &'static str,
    operands: Vec<Operand>,
    width: Width,
    vector_len: VectorLen,
    mask: KReg,
    zeroing: bool,
    broadcast: bool,
    no_flags: bool,
}

impl Insn {
    /// Start building an instruction.
    #[must_use]
    pub fn new(mnemonic: &'static str) -> Self {
        Self {
            mnemonic,
            operands: Vec::new(),
            width: Width::D,
            vector_len: VectorLen::NoVec,
            mask: crate::reg::KNOREG,
            zeroing: false,
            broadcast: false,
            no_flags: false,
        }
    }

    /// Append an operand (destination first).
    #[must_use]
    pub fn op(mut self, operand: impl Into<Operand>) -> Self {
        self.operands.push(operand.into());
        self
    }

    /// Operand width for general-purpose forms; the default is 32-bit.
    #[must_use]
    pub fn width(mut self, width: Width) -> Self {
        self.width = width;
        self
    }

    /// Vector length for VEX/EVEX forms.
    #[must_use]
    pub fn vector_len(mut self, vl: VectorLen) -> Self {
        self.vector_len = vl;
        self
    }

    /// Predicate the instruction on an opmask register (promotes to EVEX).
    #[must_use]
    pub fn mask(mut self, k: KReg) -> Self {
        self.mask = k;
        self
    }

    /// Zero masked-off lanes instead of merging.
    #[must_use]
    pub fn zeroing(mut self) -> Self {
        self.zeroing = true;
        self
    }

    /// Broadcast the memory operand's element across all lanes.
    #[must_use]
    pub fn broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }

    /// Use the APX flag-suppressed variant (promotes to extended EVEX).
    #[must_use]
    pub fn no_flags(mut self) -> Self {
        self.no_flags = true;
        self
    }
}

// Width of the sign-extended immediate field for a given operand width.
fn imm_field(width: Width, value: i64) -> Result<(Width, u8), EmitError> {
    let field = match width {
        Width::B => Width::B,
        Width::W => Width::W,
        Width::D | Width::Q => Width::D,
    };
    let fits = match field {
        Width::B => i8::try_from(value).is_ok(),
        Width::W => i16::try_from(value).is_ok(),
        _ => i32::try_from(value).is_ok(),
    };
    if !fits {
        return Err(EmitError::ImmediateOverflow {
            value,
            width: field,
        });
    }
    Ok((field, (field.bits() / 8) as u8))
}

impl Assembler<'_> {
    /// Encode one instruction from its catalog row.
    ///
    /// # Errors
    ///
    /// [`EmitError::UnknownMnemonic`] for a mnemonic with no row,
    /// [`EmitError::InvalidOperands`] when the operand shape has no form in
    /// the row, and any error surfaced by the emission engine.
    pub fn encode(&mut self, insn: &Insn) -> Result<(), EmitError> {
        let desc = InsnDescriptor::find(insn.mnemonic)?;
        let vector = desc.flags.contains(InsnFlags::VEC);

        let mut attr = if vector && !desc.flags.contains(InsnFlags::SSE) {
            InstructionAttr::new(
                insn.vector_len,
                desc.flags.contains(InsnFlags::W_OK) && insn.width == Width::Q,
                false,
                !desc.flags.contains(InsnFlags::MASK),
                true,
            )
        } else {
            // The no-flags variant only exists in the extended families, so
            // it must not be pinned legacy.
            InstructionAttr::new(
                VectorLen::NoVec,
                insn.width == Width::Q,
                !insn.no_flags,
                true,
                false,
            )
        };
        attr.set_address_attributes(desc.tuple, desc.input);
        if insn.mask.is_valid() {
            self.check_shape(desc, InsnFlags::MASK, insn)?;
            attr.set_embedded_opmask_register_specifier(insn.mask);
            if !insn.zeroing {
                attr.reset_is_clear_context();
            }
        }
        if insn.broadcast {
            self.check_shape(desc, InsnFlags::BCAST, insn)?;
            // EVEX.b only means "broadcast" for a memory source; honoring
            // the request on a register form would silently encode the
            // plain operation.
            if !insn
                .operands
                .iter()
                .any(|o| matches!(o, Operand::Mem(_)))
            {
                return Err(EmitError::InvalidOperands {
                    mnemonic: insn.mnemonic.to_string(),
                    detail: "broadcast requires a memory source".to_string(),
                });
            }
            attr.set_extended_context();
        }
        if insn.no_flags {
            self.check_shape(desc, InsnFlags::NF, insn)?;
            attr.set_no_flags();
        }

        let mut scope = self.attach(attr);
        let r = if vector {
            scope.encode_vector(desc, insn)
        } else {
            scope.encode_gp(desc, insn)
        };
        drop(scope);
        r
    }

    fn check_shape(
        &self,
        desc: &InsnDescriptor,
        need: InsnFlags,
        insn: &Insn,
    ) -> Result<(), EmitError> {
        if desc.flags.contains(need) {
            Ok(())
        } else {
            Err(EmitError::InvalidOperands {
                mnemonic: insn.mnemonic.to_string(),
                detail: "requested feature has no form for this instruction".to_string(),
            })
        }
    }

    fn shape_error(&self, insn: &Insn) -> EmitError {
        EmitError::InvalidOperands {
            mnemonic: insn.mnemonic.to_string(),
            detail: "no form matches this operand shape".to_string(),
        }
    }

    // ── general-purpose forms ───────────────────────────────────────────

    fn encode_gp(&mut self, desc: &InsnDescriptor, insn: &Insn) -> Result<(), EmitError> {
        if insn.no_flags {
            return self.encode_gp_nf(desc, insn);
        }
        let w = insn.width == Width::Q;
        if insn.width == Width::W {
            self.emit_u8(0x66);
        }
        match *insn.operands.as_slice() {
            [Operand::Gpr(dst), Operand::Gpr(src)] if desc.flags.contains(InsnFlags::RR) => {
                self.byte_form_rex(insn.width, &[dst, src]);
                let fam = self.gp_prefix_rr(w, dst, src, desc.map)?;
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_rm, insn.width));
                self.emit_u8(crate::emit::modrm(0b11, dst.low3(), src.low3()));
                Ok(())
            }
            [Operand::Gpr(dst), Operand::Mem(ref adr)] if desc.flags.contains(InsnFlags::RM) => {
                self.byte_form_rex(insn.width, &[dst]);
                let fam = self.gp_prefix_mem(w, dst, adr, desc.map)?;
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_rm, insn.width));
                self.emit_operand(dst.low3(), adr, 0)
            }
            [Operand::Mem(ref adr), Operand::Gpr(src)] if desc.flags.contains(InsnFlags::MR) => {
                self.byte_form_rex(insn.width, &[src]);
                let fam = self.gp_prefix_mem(w, src, adr, desc.map)?;
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_mr, insn.width));
                self.emit_operand(src.low3(), adr, 0)
            }
            [Operand::Gpr(dst), Operand::Imm(value)] if desc.flags.contains(InsnFlags::RI) => {
                self.encode_gp_reg_imm(desc, insn, dst, value)
            }
            [Operand::Mem(ref adr), Operand::Imm(value)] if desc.flags.contains(InsnFlags::MI) => {
                self.encode_gp_mem_imm(desc, insn, adr, value)
            }
            [Operand::Gpr(rm)] if desc.flags.contains(InsnFlags::OPREG) => {
                // push/pop are 64-bit by default in long mode: no REX.W.
                let fam = self.gp_prefix_opreg(false, rm, desc.map)?;
                self.emit_opcode(fam, desc.map, desc.op_rm + rm.low3());
                Ok(())
            }
            [Operand::Gpr(rm)] if desc.flags.contains(InsnFlags::UNARY) => {
                self.byte_form_rex(insn.width, &[rm]);
                let fam = self.gp_prefix_rr(w, crate::reg::NOREG, rm, desc.map)?;
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_imm, insn.width));
                self.emit_u8(crate::emit::modrm(0b11, desc.digit, rm.low3()));
                Ok(())
            }
            [Operand::Mem(ref adr)] if desc.flags.contains(InsnFlags::UNARY) => {
                let fam = self.gp_prefix_mem(w, crate::reg::NOREG, adr, desc.map)?;
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_imm, insn.width));
                self.emit_operand(desc.digit, adr, 0)
            }
            _ => Err(self.shape_error(insn)),
        }
    }

    fn encode_gp_reg_imm(
        &mut self,
        desc: &InsnDescriptor,
        insn: &Insn,
        dst: Gpr,
        value: i64,
    ) -> Result<(), EmitError> {
        let w = insn.width == Width::Q;
        self.byte_form_rex(insn.width, &[dst]);

        // The only legal 8-byte embedding: the B8+rd full-width move.
        if desc.flags.contains(InsnFlags::IMM64)
            && insn.width == Width::Q
            && i32::try_from(value).is_err()
        {
            let fam = self.gp_prefix_opreg(true, dst, desc.map)?;
            self.emit_opcode(fam, desc.map, 0xB8 + dst.low3());
            return self.emit_data64(value, crate::reloc::RelocationHolder::NONE, RelocFormat::Imm);
        }

        if desc.flags.contains(InsnFlags::IMM8_ONLY) {
            let imm = i8::try_from(value).map_err(|_| EmitError::ImmediateOverflow {
                value,
                width: Width::B,
            })?;
            let fam = self.gp_prefix_rr(w, crate::reg::NOREG, dst, desc.map)?;
            if imm == 1 {
                // shift-by-one short form
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, 0xD1, insn.width));
                self.emit_u8(crate::emit::modrm(0b11, desc.digit, dst.low3()));
            } else {
                self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_imm, insn.width));
                self.emit_u8(crate::emit::modrm(0b11, desc.digit, dst.low3()));
                self.emit_u8(imm as u8);
            }
            return Ok(());
        }

        // Validate before any byte is written: an oversized immediate must
        // fail fast, never leave a half-emitted instruction behind.
        imm_field(insn.width, value)?;
        let use_imm8 = desc.flags.contains(InsnFlags::IMM8)
            && insn.width != Width::B
            && i8::try_from(value).is_ok();
        let fam = self.gp_prefix_rr(w, crate::reg::NOREG, dst, desc.map)?;
        if use_imm8 {
            self.emit_opcode(fam, desc.map, desc.op_imm8);
            self.emit_u8(crate::emit::modrm(0b11, desc.digit, dst.low3()));
            self.emit_u8(value as u8);
        } else {
            self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_imm, insn.width));
            self.emit_u8(crate::emit::modrm(0b11, desc.digit, dst.low3()));
            self.emit_imm_field(insn.width, value)?;
        }
        Ok(())
    }

    fn encode_gp_mem_imm(
        &mut self,
        desc: &InsnDescriptor,
        insn: &Insn,
        adr: &Address,
        value: i64,
    ) -> Result<(), EmitError> {
        let w = insn.width == Width::Q;
        let use_imm8 = desc.flags.contains(InsnFlags::IMM8)
            && insn.width != Width::B
            && i8::try_from(value).is_ok();
        let imm8_only = desc.flags.contains(InsnFlags::IMM8_ONLY);
        if imm8_only {
            i8::try_from(value).map_err(|_| EmitError::ImmediateOverflow {
                value,
                width: Width::B,
            })?;
        } else {
            imm_field(insn.width, value)?;
        }
        let fam = self.gp_prefix_mem(w, crate::reg::NOREG, adr, desc.map)?;
        if imm8_only && value == 1 {
            // shift-by-one short form
            self.emit_opcode(fam, desc.map, self.width_opcode(desc, 0xD1, insn.width));
            self.emit_operand(desc.digit, adr, 0)?;
        } else if use_imm8 || imm8_only {
            let imm = value as i8;
            let opcode = if imm8_only { desc.op_imm } else { desc.op_imm8 };
            self.emit_opcode(fam, desc.map, self.width_opcode(desc, opcode, insn.width));
            self.emit_operand(desc.digit, adr, 1)?;
            self.emit_u8(imm as u8);
        } else {
            let (_, bytes) = imm_field(insn.width, value)?;
            self.emit_opcode(fam, desc.map, self.width_opcode(desc, desc.op_imm, insn.width));
            self.emit_operand(desc.digit, adr, usize::from(bytes))?;
            self.emit_imm_field(insn.width, value)?;
        }
        Ok(())
    }

    // APX flag-suppressed GP form: promoted to extended EVEX, map 4,
    // destination in vvvv is not modeled (NDD is out of scope), so the
    // two-operand NF form reuses the classic ModRM shape under the 62
    // prefix.  Never demoted: suppressing flag writes is semantics, not
    // code size.
    fn encode_gp_nf(&mut self, desc: &InsnDescriptor, insn: &Insn) -> Result<(), EmitError> {
        match *insn.operands.as_slice() {
            [Operand::Gpr(dst), Operand::Gpr(src)] if desc.flags.contains(InsnFlags::RR) => {
                let (fam, mrm) =
                    self.eevex_gp_prefix_rr(dst.encoding(), src.encoding(), desc.pre)?;
                self.emit_opcode(fam, OpcodeMap::Map4, self.width_opcode(desc, desc.op_rm, insn.width));
                self.emit_u8(mrm);
                Ok(())
            }
            [Operand::Gpr(rm)] if desc.flags.contains(InsnFlags::UNARY) => {
                let (fam, mrm) = self.eevex_gp_prefix_rr(desc.digit, rm.encoding(), desc.pre)?;
                self.emit_opcode(fam, OpcodeMap::Map4, self.width_opcode(desc, desc.op_imm, insn.width));
                self.emit_u8(mrm);
                Ok(())
            }
            _ => Err(self.shape_error(insn)),
        }
    }

    fn width_opcode(&self, desc: &InsnDescriptor, opcode: u8, width: Width) -> u8 {
        // One-byte-operand map-0 GP forms use the adjacent even opcode.
        if width == Width::B && opcode > 0 && desc.map == OpcodeMap::Map0 {
            opcode & !1
        } else {
            opcode
        }
    }

    // SPL/BPL/SIL/DIL need a flag-less REX to avoid the AH..BH aliases.
    fn byte_form_rex(&mut self, width: Width, regs: &[Gpr]) {
        if width != Width::B {
            return;
        }
        let needs_plain = regs
            .iter()
            .any(|r| r.is_valid() && (4..8).contains(&r.encoding()));
        let any_bits = regs
            .iter()
            .any(|r| r.needs_rex() || r.needs_rex2());
        if needs_plain && !any_bits {
            self.emit_u8(0x40);
        }
    }

    fn emit_imm_field(&mut self, width: Width, value: i64) -> Result<(), EmitError> {
        let (field, _) = imm_field(width, value)?;
        match field {
            Width::B => self.emit_u8(value as u8),
            Width::W => self.emit_u16(value as u16),
            _ => self.emit_u32(value as u32),
        }
        Ok(())
    }

    // ── vector forms ────────────────────────────────────────────────────

    fn encode_vector(&mut self, desc: &InsnDescriptor, insn: &Insn) -> Result<(), EmitError> {
        if desc.flags.contains(InsnFlags::SSE) {
            return self.encode_sse(desc, insn);
        }
        match *insn.operands.as_slice() {
            [Operand::Xmm(dst), Operand::Xmm(nds), Operand::Xmm(src)]
                if desc.flags.contains(InsnFlags::NDS) && desc.flags.contains(InsnFlags::RR) =>
            {
                let (fam, mrm) = self.vex_prefix_and_encode(
                    dst.encoding(),
                    nds.encoding(),
                    src.encoding(),
                    desc.pre,
                    desc.map,
                )?;
                self.emit_opcode(fam, desc.map, desc.op_rm);
                self.emit_u8(mrm);
                Ok(())
            }
            [Operand::Xmm(dst), Operand::Xmm(nds), Operand::Mem(ref adr)]
                if desc.flags.contains(InsnFlags::NDS) && desc.flags.contains(InsnFlags::RM) =>
            {
                let fam =
                    self.vex_prefix_mem(dst.encoding(), nds.encoding(), adr, desc.pre, desc.map)?;
                self.emit_opcode(fam, desc.map, desc.op_rm);
                self.emit_operand(dst.low3(), adr, 0)
            }
            // Two-operand moves: no NDS source, vvvv stays 0b1111.
            [Operand::Xmm(dst), Operand::Xmm(src)] if desc.flags.contains(InsnFlags::RR) => {
                let (fam, mrm) =
                    self.vex_prefix_and_encode(dst.encoding(), 0, src.encoding(), desc.pre, desc.map)?;
                self.emit_opcode(fam, desc.map, desc.op_rm);
                self.emit_u8(mrm);
                Ok(())
            }
            [Operand::Xmm(dst), Operand::Mem(ref adr)] if desc.flags.contains(InsnFlags::RM) => {
                let fam = self.vex_prefix_mem(dst.encoding(), 0, adr, desc.pre, desc.map)?;
                self.emit_opcode(fam, desc.map, desc.op_rm);
                self.emit_operand(dst.low3(), adr, 0)
            }
            [Operand::Mem(ref adr), Operand::Xmm(src)] if desc.flags.contains(InsnFlags::MR) => {
                let fam = self.vex_prefix_mem(src.encoding(), 0, adr, desc.pre, desc.map)?;
                self.emit_opcode(fam, desc.map, desc.op_mr);
                self.emit_operand(src.low3(), adr, 0)
            }
            _ => Err(self.shape_error(insn)),
        }
    }

    fn encode_sse(&mut self, desc: &InsnDescriptor, insn: &Insn) -> Result<(), EmitError> {
        match *insn.operands.as_slice() {
            [Operand::Xmm(dst), Operand::Xmm(src)] if desc.flags.contains(InsnFlags::RR) => {
                let fam = self.simd_prefix_legacy_rr(dst.encoding(), src.encoding(), desc.pre)?;
                self.emit_opcode(fam, desc.map, desc.op_rm);
                self.emit_u8(crate::emit::modrm(0b11, dst.low3(), src.low3()));
                Ok(())
            }
            [Operand::Xmm(dst), Operand::Mem(ref adr)] if desc.flags.contains(InsnFlags::RM) => {
                let fam = self.simd_prefix_legacy_mem(dst.encoding(), adr, desc.pre)?;
                self.emit_opcode(fam, desc.map, desc.op_rm);
                self.emit_operand(dst.low3(), adr, 0)
            }
            [Operand::Mem(ref adr), Operand::Xmm(src)] if desc.flags.contains(InsnFlags::MR) => {
                let fam = self.simd_prefix_legacy_mem(src.encoding(), adr, desc.pre)?;
                self.emit_opcode(fam, desc.map, desc.op_mr);
                self.emit_operand(src.low3(), adr, 0)
            }
            _ => Err(self.shape_error(insn)),
        }
    }

    // ── control flow with relocated targets ─────────────────────────────

    /// `call rel32` to a relocatable literal.  The 32-bit field is the
    /// self-relative displacement from the end of the instruction; one
    /// `Call32` relocation is recorded at the field's offset.
    pub fn call_literal(&mut self, lit: &AddressLiteral) -> Result<(), EmitError> {
        self.relative_branch(0xE8, lit)
    }

    /// `jmp rel32` to a relocatable literal.
    pub fn jmp_literal(&mut self, lit: &AddressLiteral) -> Result<(), EmitError> {
        self.relative_branch(0xE9, lit)
    }

    // The range check runs before the opcode byte lands: an unreachable
    // target must leave the buffer untouched.
    fn relative_branch(&mut self, opcode: u8, lit: &AddressLiteral) -> Result<(), EmitError> {
        let next = self
            .code()
            .base()
            .wrapping_add((self.position() + 1 + 4) as u64);
        let delta = i64::wrapping_sub(lit.target() as i64, next as i64);
        let rel = i32::try_from(delta).map_err(|_| EmitError::UnreachableTarget {
            target: lit.target(),
        })?;
        self.emit_u8(opcode);
        self.emit_data32(rel, lit.rspec(), RelocFormat::Call32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CodeBuffer;
    use crate::reg::{K1, R10, R16, RAX, RBP, RBX, RCX, RDX, RSP, XMM0, XMM1, XMM17, XMM2, XMM3};
    use crate::reloc::RelocKind;

    fn assemble(insn: &Insn) -> Result<alloc::vec::Vec<u8>, EmitError> {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        asm.encode(insn)?;
        Ok(buf.bytes().to_vec())
    }

    #[test]
    fn mov_low_regs_is_rexless() {
        // Encodings 0 and 7 with 32-bit width: opcode + ModRM only.
        let bytes = assemble(&Insn::new("mov").op(RAX).op(crate::reg::RDI)).unwrap();
        assert_eq!(bytes, [0x8B, 0xC7]);
    }

    #[test]
    fn mov_qword_rr() {
        let bytes = assemble(&Insn::new("mov").op(RAX).op(RBX).width(Width::Q)).unwrap();
        assert_eq!(bytes, [0x48, 0x8B, 0xC3]);
    }

    #[test]
    fn mov_with_encoding_15_forces_prefix() {
        let plain = assemble(&Insn::new("mov").op(RAX).op(RBX)).unwrap();
        let ext = assemble(&Insn::new("mov").op(RAX).op(crate::reg::R15)).unwrap();
        assert_eq!(plain.len() + 1, ext.len());
        assert_eq!(ext[0], 0x41);
    }

    #[test]
    fn add_rr_uses_rm_direction() {
        let bytes = assemble(&Insn::new("add").op(RAX).op(RBX).width(Width::Q)).unwrap();
        assert_eq!(bytes, [0x48, 0x03, 0xC3]);
    }

    #[test]
    fn add_imm8_shortens() {
        let bytes = assemble(&Insn::new("add").op(RCX).op(5)).unwrap();
        assert_eq!(bytes, [0x83, 0xC1, 0x05]);
    }

    #[test]
    fn add_imm32_when_wide() {
        let bytes = assemble(&Insn::new("add").op(RCX).op(0x1234)).unwrap();
        assert_eq!(bytes, [0x81, 0xC1, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn mov_imm64_uses_opreg_form() {
        let bytes = assemble(
            &Insn::new("mov")
                .op(RDX)
                .op(0x1122_3344_5566_7788i64)
                .width(Width::Q),
        )
        .unwrap();
        assert_eq!(
            bytes,
            [0x48, 0xBA, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn mov_imm64_under_dword_width_fails() {
        let err = assemble(&Insn::new("mov").op(RDX).op(0x1_0000_0000i64)).unwrap_err();
        assert!(matches!(err, EmitError::ImmediateOverflow { .. }));
    }

    #[test]
    fn mov_mem_base_rsp_gets_sib() {
        let bytes =
            assemble(&Insn::new("mov").op(RAX).op(Address::base(RSP)).width(Width::Q)).unwrap();
        assert_eq!(bytes, [0x48, 0x8B, 0x04, 0x24]);
    }

    #[test]
    fn mov_mem_base_rbp_gets_disp8_zero() {
        let bytes =
            assemble(&Insn::new("mov").op(RAX).op(Address::base(RBP)).width(Width::Q)).unwrap();
        assert_eq!(bytes, [0x48, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn push_pop_extended() {
        let bytes = assemble(&Insn::new("push").op(R10)).unwrap();
        assert_eq!(bytes, [0x41, 0x52]);
        let bytes = assemble(&Insn::new("pop").op(R10)).unwrap();
        assert_eq!(bytes, [0x41, 0x5A]);
    }

    #[test]
    fn push_apx_register_uses_rex2() {
        let bytes = assemble(&Insn::new("push").op(R16)).unwrap();
        assert_eq!(bytes, [0xD5, 0x10, 0x50]);
    }

    #[test]
    fn movzx_under_rex2_drops_escape() {
        // movzx is map 1; under REX2 the 0F escape moves into the prefix.
        let legacy = assemble(&Insn::new("movzxb").op(RAX).op(RBX)).unwrap();
        assert_eq!(legacy, [0x0F, 0xB6, 0xC3]);
        let rex2 = assemble(&Insn::new("movzxb").op(RAX).op(R16)).unwrap();
        assert_eq!(rex2, [0xD5, 0x90, 0xB6, 0xC0]);
    }

    #[test]
    fn shift_by_one_uses_short_form() {
        let bytes = assemble(&Insn::new("shl").op(RAX).op(1)).unwrap();
        assert_eq!(bytes, [0xD1, 0xE0]);
        let bytes = assemble(&Insn::new("shl").op(RAX).op(4)).unwrap();
        assert_eq!(bytes, [0xC1, 0xE0, 0x04]);
    }

    #[test]
    fn shift_memory_by_one_uses_short_form() {
        let bytes = assemble(&Insn::new("shl").op(Address::base(RAX)).op(1)).unwrap();
        assert_eq!(bytes, [0xD1, 0x20]);
        let bytes = assemble(
            &Insn::new("shl").op(Address::base(RAX)).op(1).width(Width::B),
        )
        .unwrap();
        assert_eq!(bytes, [0xD0, 0x20]);
        let bytes = assemble(&Insn::new("shl").op(Address::base(RAX)).op(4)).unwrap();
        assert_eq!(bytes, [0xC1, 0x20, 0x04]);
    }

    #[test]
    fn lea_rejects_reg_source() {
        let err = assemble(&Insn::new("lea").op(RAX).op(RBX)).unwrap_err();
        assert!(matches!(err, EmitError::InvalidOperands { .. }));
    }

    #[test]
    fn unknown_mnemonic() {
        let err = assemble(&Insn::new("frobnicate").op(RAX)).unwrap_err();
        assert!(matches!(err, EmitError::UnknownMnemonic { .. }));
    }

    #[test]
    fn addss_legacy_sse() {
        let bytes = assemble(&Insn::new("addss").op(XMM0).op(XMM1)).unwrap();
        assert_eq!(bytes, [0xF3, 0x0F, 0x58, 0xC1]);
    }

    #[test]
    fn addss_rejects_evex_only_register() {
        let err = assemble(&Insn::new("addss").op(XMM0).op(XMM17)).unwrap_err();
        assert!(matches!(err, EmitError::RegisterOutOfRange { .. }));
    }

    #[test]
    fn vaddps_vex128() {
        let bytes = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(XMM2)
                .vector_len(VectorLen::L128),
        )
        .unwrap();
        // C5 [~R=1 vvvv=~1 L=0 pp=0] 58 /r
        assert_eq!(bytes, [0xC5, 0xF0, 0x58, 0xC2]);
    }

    #[test]
    fn vaddps_zmm_promotes_to_evex() {
        let bytes = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(XMM2)
                .vector_len(VectorLen::L512),
        )
        .unwrap();
        assert_eq!(bytes[0], 0x62);
        // P2 carries L'L = 10.
        assert_eq!(bytes[3] & 0x60, 0x40);
        assert_eq!(bytes[4..], [0x58, 0xC2]);
    }

    #[test]
    fn vaddps_extended_register_promotes_to_evex() {
        let bytes = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(XMM17)
                .vector_len(VectorLen::L128),
        )
        .unwrap();
        assert_eq!(bytes[0], 0x62);
    }

    #[test]
    fn masked_vaddps_sets_aaa_and_z() {
        let merge = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(XMM2)
                .vector_len(VectorLen::L512)
                .mask(K1),
        )
        .unwrap();
        assert_eq!(merge[0], 0x62);
        assert_eq!(merge[3] & 0x07, 1);
        assert_eq!(merge[3] & 0x80, 0);

        let zero = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(XMM2)
                .vector_len(VectorLen::L512)
                .mask(K1)
                .zeroing(),
        )
        .unwrap();
        assert_eq!(zero[3] & 0x80, 0x80);
    }

    #[test]
    fn broadcast_sets_b_bit() {
        let bytes = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(Address::base(RAX))
                .vector_len(VectorLen::L512)
                .broadcast(),
        )
        .unwrap();
        assert_eq!(bytes[0], 0x62);
        assert_eq!(bytes[3] & 0x10, 0x10);
    }

    #[test]
    fn broadcast_on_register_form_is_rejected() {
        // A register source cannot carry EVEX.b-as-broadcast; honoring the
        // request would silently encode the plain operation.
        let err = assemble(
            &Insn::new("vaddps")
                .op(XMM0)
                .op(XMM1)
                .op(XMM2)
                .vector_len(VectorLen::L512)
                .broadcast(),
        )
        .unwrap_err();
        assert!(matches!(err, EmitError::InvalidOperands { .. }));
    }

    #[test]
    fn no_flags_add_promotes_to_eevex_map4() {
        let bytes = assemble(
            &Insn::new("add")
                .op(RAX)
                .op(RBX)
                .width(Width::Q)
                .no_flags(),
        )
        .unwrap();
        // 62, P0 map=4, P1 W=1 vvvv=~0, P2 NF, opcode, modrm — and the
        // same request is never demoted back to the 3-byte legacy form.
        assert_eq!(bytes[0], 0x62);
        assert_eq!(bytes[1] & 0x07, 0x04);
        assert_eq!(bytes[2] & 0x80, 0x80);
        assert_eq!(bytes[3] & 0x04, 0x04);
        assert_eq!(bytes[4..], [0x03, 0xC3]);
        assert_ne!(bytes, [0x48, 0x03, 0xC3]);
    }

    #[test]
    fn cmp_has_no_flag_suppressed_form() {
        let err = assemble(&Insn::new("cmp").op(RAX).op(RBX).no_flags()).unwrap_err();
        assert!(matches!(err, EmitError::InvalidOperands { .. }));
    }

    #[test]
    fn call_literal_records_call32_reloc() {
        let mut buf = CodeBuffer::with_base(0x40_0000);
        let mut asm = Assembler::new(&mut buf);
        let lit = AddressLiteral::runtime_call(0x40_8000);
        asm.call_literal(&lit).unwrap();
        assert_eq!(buf.bytes()[0], 0xE8);
        let rel = (0x8000 - 5i32).to_le_bytes();
        assert_eq!(&buf.bytes()[1..5], &rel);
        assert_eq!(buf.relocs().len(), 1);
        assert_eq!(buf.relocs()[0].offset, 1);
        assert_eq!(buf.relocs()[0].kind, RelocKind::RuntimeCall);
        assert_eq!(buf.relocs()[0].format, RelocFormat::Call32);
    }

    #[test]
    fn unreachable_branch_leaves_buffer_untouched() {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        let far = AddressLiteral::runtime_call((i64::from(i32::MAX) as u64) + 64);
        assert!(matches!(
            asm.call_literal(&far),
            Err(EmitError::UnreachableTarget { .. })
        ));
        assert!(matches!(
            asm.jmp_literal(&far),
            Err(EmitError::UnreachableTarget { .. })
        ));
        assert!(buf.bytes().is_empty());
        assert!(buf.relocs().is_empty());
    }

    #[test]
    fn byte_width_uses_even_opcode_and_plain_rex() {
        let bytes = assemble(&Insn::new("add").op(RAX).op(RBX).width(Width::B)).unwrap();
        assert_eq!(bytes, [0x02, 0xC3]);
        // SIL as a byte operand needs the flag-less REX.
        let bytes = assemble(
            &Insn::new("add")
                .op(crate::reg::RSI)
                .op(RBX)
                .width(Width::B),
        )
        .unwrap();
        assert_eq!(bytes, [0x40, 0x02, 0xF3]);
    }

    #[test]
    fn word_width_gets_operand_size_prefix() {
        let bytes = assemble(&Insn::new("add").op(RAX).op(RBX).width(Width::W)).unwrap();
        assert_eq!(bytes, [0x66, 0x03, 0xC3]);
    }

    #[test]
    fn vmovdqu_store_direction() {
        let bytes = assemble(
            &Insn::new("vmovdqu")
                .op(Address::base(RAX))
                .op(XMM3)
                .vector_len(VectorLen::L128),
        )
        .unwrap();
        assert_eq!(bytes, [0xC5, 0xFA, 0x7F, 0x18]);
    }

    #[test]
    fn attributes_cleared_after_encode() {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        asm.encode(&Insn::new("add").op(RAX).op(RBX)).unwrap();
        assert!(asm.attributes().is_none());
        let _ = asm.encode(&Insn::new("lea").op(RAX).op(RBX));
        assert!(asm.attributes().is_none());
    }
}
