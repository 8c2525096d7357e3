//! Golden-byte encoding tests.
//!
//! Each test pins the exact byte sequence for a representative instruction
//! form, covering the structural ModRM/SIB exception cases, the prefix
//! family boundaries, and the EVEX compressed-displacement and APX
//! flag-suppression rules whose behavior is fixed by observed encodings.

use x64_emit::reg::{
    NOREG, R12, R13, R15, R16, R31, R8, RAX, RBP, RBX, RCX, RDI, RSI, RSP, XMM0, XMM1, XMM2,
};
use x64_emit::{
    Address, AddressLiteral, Assembler, CodeBuffer, EmitError, Insn, RelocFormat, RelocKind,
    RelocationHolder, ScaleFactor, VectorLen, Width,
};

fn encode(insn: &Insn) -> Vec<u8> {
    let mut buf = CodeBuffer::new();
    let mut asm = Assembler::new(&mut buf);
    asm.encode(insn)
        .unwrap_or_else(|e| panic!("encoding failed: {e}"));
    buf.bytes().to_vec()
}

fn encode_err(insn: &Insn) -> EmitError {
    let mut buf = CodeBuffer::new();
    let mut asm = Assembler::new(&mut buf);
    asm.encode(insn).unwrap_err()
}

// ─── Prefix family boundaries ───────────────────────────────────────────

#[test]
fn mov_between_low_encodings_has_no_prefix() {
    // Both encodings below 8, 64-bit width not requested: opcode + ModRM.
    for (dst, src, modrm) in [(RAX, RDI, 0xC7u8), (RCX, RBX, 0xCB), (RSI, RAX, 0xF0)] {
        assert_eq!(encode(&Insn::new("mov").op(dst).op(src)), [0x8B, modrm]);
    }
}

#[test]
fn mov_with_encoding_15_grows_by_exactly_one_prefix_byte() {
    let low = encode(&Insn::new("mov").op(RAX).op(RBX).width(Width::Q));
    let high = encode(&Insn::new("mov").op(RAX).op(R15).width(Width::Q));
    assert_eq!(low, [0x48, 0x8B, 0xC3]);
    assert_eq!(high, [0x49, 0x8B, 0xC7]);
}

#[test]
fn encoding_31_takes_rex2_never_legacy() {
    let bytes = encode(&Insn::new("mov").op(RAX).op(R31).width(Width::Q));
    // D5 payload: W | B (bit 3) | B4 (bit 4).
    assert_eq!(bytes, [0xD5, 0x19, 0x8B, 0xC7]);
}

#[test]
fn rex2_with_extended_base_and_index() {
    let adr = Address::base_index(R16, R31, ScaleFactor::Times8, 8).unwrap();
    let bytes = encode(&Insn::new("mov").op(RAX).op(adr).width(Width::Q));
    // Payload: W | B4 (base 16) | X | X4 (index 31).
    assert_eq!(bytes[..2], [0xD5, 0x3A]);
    assert_eq!(bytes[2], 0x8B);
    // modrm(01, rax, sib) + sib(times8, r31, r16) + disp8.
    assert_eq!(bytes[3..], [0x44, 0xF8, 0x08]);
}

// ─── ModRM / SIB exception cases ────────────────────────────────────────

#[test]
fn rsp_family_base_always_emits_sib() {
    for base in [RSP, R12] {
        let bytes = encode(&Insn::new("mov").op(RAX).op(Address::base(base)).width(Width::Q));
        // REX, opcode, modrm with rm=100, SIB with no-index field.
        assert_eq!(bytes.len(), 4);
        assert_eq!(bytes[2] & 0x07, 0b100);
        assert_eq!((bytes[3] >> 3) & 0x07, 0b100);
    }
}

#[test]
fn rbp_family_base_with_zero_disp_takes_disp8() {
    for base in [RBP, R13] {
        let bytes = encode(&Insn::new("mov").op(RAX).op(Address::base(base)).width(Width::Q));
        assert_eq!(bytes[2] >> 6, 0b01);
        assert_eq!(*bytes.last().unwrap(), 0x00);
    }
}

#[test]
fn displacement_uses_smallest_exact_fit() {
    let d8 = encode(&Insn::new("mov").op(RAX).op(Address::base_disp(RCX, -128)));
    assert_eq!(d8, [0x8B, 0x41, 0x80]);
    let d32 = encode(&Insn::new("mov").op(RAX).op(Address::base_disp(RCX, -129)));
    assert_eq!(d32, [0x8B, 0x81, 0x7F, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn no_base_form_is_sib_absolute() {
    let bytes = encode(&Insn::new("mov").op(RAX).op(Address::absolute(0x12345678)));
    assert_eq!(bytes, [0x8B, 0x04, 0x25, 0x78, 0x56, 0x34, 0x12]);
}

#[test]
fn index_without_base_keeps_scale() {
    let adr = Address::base_index(NOREG, RSI, ScaleFactor::Times4, 0x10).unwrap();
    let bytes = encode(&Insn::new("lea").op(RAX).op(adr).width(Width::Q));
    assert_eq!(bytes, [0x48, 0x8D, 0x04, 0xB5, 0x10, 0x00, 0x00, 0x00]);
}

// ─── Immediates ─────────────────────────────────────────────────────────

#[test]
fn eight_byte_immediate_requires_qword_width() {
    let err = encode_err(&Insn::new("mov").op(RAX).op(0x1_0000_0000_i64));
    assert!(matches!(err, EmitError::ImmediateOverflow { .. }));

    let ok = encode(&Insn::new("mov").op(RAX).op(0x1_0000_0000_i64).width(Width::Q));
    assert_eq!(ok, [0x48, 0xB8, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn small_qword_immediate_stays_four_bytes() {
    // Fits i32: sign-extended C7 /0 form, not the 10-byte B8 form.
    let bytes = encode(&Insn::new("mov").op(RAX).op(42).width(Width::Q));
    assert_eq!(bytes, [0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00]);
}

#[test]
fn alu_immediate_width_break_at_i8() {
    assert_eq!(encode(&Insn::new("sub").op(RAX).op(127)), [0x83, 0xE8, 0x7F]);
    assert_eq!(
        encode(&Insn::new("sub").op(RAX).op(128)),
        [0x81, 0xE8, 0x80, 0x00, 0x00, 0x00]
    );
}

#[test]
fn memory_immediate_is_little_endian() {
    let bytes = encode(
        &Insn::new("mov")
            .op(Address::base_disp(RAX, 8))
            .op(0x0A0B0C0D)
            .width(Width::Q),
    );
    assert_eq!(bytes, [0x48, 0xC7, 0x40, 0x08, 0x0D, 0x0C, 0x0B, 0x0A]);
}

// ─── EVEX demotion and APX no-flags precedence ──────────────────────────

#[test]
fn plain_alu_demotes_to_shortest_legacy_form() {
    assert_eq!(
        encode(&Insn::new("add").op(RAX).op(RBX).width(Width::Q)),
        [0x48, 0x03, 0xC3]
    );
    assert_eq!(encode(&Insn::new("add").op(RAX).op(RBX)), [0x03, 0xC3]);
}

#[test]
fn no_flags_request_is_never_demoted() {
    // Even with all-low registers where a 2-byte legacy form exists, the
    // flag-suppressed variant keeps the 6-byte extended-EVEX encoding:
    // suppressing flag writes is semantics, not code size.
    let bytes = encode(&Insn::new("add").op(RAX).op(RBX).no_flags());
    assert_eq!(bytes, [0x62, 0xF4, 0x7C, 0x0C, 0x03, 0xC3]);
}

#[test]
fn no_flags_qword() {
    let bytes = encode(&Insn::new("add").op(RAX).op(RBX).width(Width::Q).no_flags());
    assert_eq!(bytes, [0x62, 0xF4, 0xFC, 0x0C, 0x03, 0xC3]);
}

#[test]
fn no_flags_with_extended_register() {
    let bytes = encode(&Insn::new("sub").op(RAX).op(R8).width(Width::Q).no_flags());
    // r8 as r/m sets B in P0.
    assert_eq!(bytes, [0x62, 0xD4, 0xFC, 0x0C, 0x2B, 0xC0]);
}

// ─── Vector encodings ───────────────────────────────────────────────────

#[test]
fn vex_two_byte_form_when_possible() {
    let bytes = encode(
        &Insn::new("vaddps")
            .op(XMM0)
            .op(XMM1)
            .op(XMM2)
            .vector_len(VectorLen::L128),
    );
    assert_eq!(bytes, [0xC5, 0xF0, 0x58, 0xC2]);
}

#[test]
fn vex_three_byte_form_when_b_needed() {
    let bytes = encode(
        &Insn::new("vaddps")
            .op(XMM0)
            .op(XMM1)
            .op(x64_emit::reg::XMM8)
            .vector_len(VectorLen::L128),
    );
    // C4 [~R ~X ~B mmmmm] [W vvvv L pp]
    assert_eq!(bytes, [0xC4, 0xC1, 0x70, 0x58, 0xC0]);
}

#[test]
fn zmm_length_promotes_to_evex() {
    let bytes = encode(
        &Insn::new("vaddps")
            .op(XMM0)
            .op(XMM1)
            .op(XMM2)
            .vector_len(VectorLen::L512),
    );
    assert_eq!(bytes, [0x62, 0xF1, 0x74, 0x48, 0x58, 0xC2]);
}

#[test]
fn evex_compressed_disp8() {
    // Full-vector tuple at 512 bits: element 64 bytes, so +256 is disp8=4.
    let bytes = encode(
        &Insn::new("vaddps")
            .op(XMM0)
            .op(XMM1)
            .op(Address::base_disp(RAX, 256))
            .vector_len(VectorLen::L512),
    );
    assert_eq!(bytes, [0x62, 0xF1, 0x74, 0x48, 0x58, 0x40, 0x04]);
}

#[test]
fn evex_uncompressible_disp_takes_full_field() {
    // +100 fits i8 but is not a multiple of 64: full disp32.
    let bytes = encode(
        &Insn::new("vaddps")
            .op(XMM0)
            .op(XMM1)
            .op(Address::base_disp(RAX, 100))
            .vector_len(VectorLen::L512),
    );
    assert_eq!(
        bytes,
        [0x62, 0xF1, 0x74, 0x48, 0x58, 0x80, 0x64, 0x00, 0x00, 0x00]
    );
}

// ─── Relocations ────────────────────────────────────────────────────────

#[test]
fn relocated_displacement_pins_offset_and_full_field() {
    let mut buf = CodeBuffer::new();
    let mut asm = Assembler::new(&mut buf);
    let adr = Address::base_disp(RAX, 4)
        .with_rspec(RelocationHolder::new(RelocKind::ExternalWord, 0xDEAD_F000));
    asm.encode(&Insn::new("mov").op(RCX).op(adr).width(Width::Q))
        .unwrap();
    // REX + opcode + modrm, then the relocated 4-byte displacement.
    assert_eq!(buf.bytes()[..3], [0x48, 0x8B, 0x88]);
    assert_eq!(buf.bytes()[3..], [0x04, 0x00, 0x00, 0x00]);
    assert_eq!(buf.relocs().len(), 1);
    assert_eq!(buf.relocs()[0].offset, 3);
    assert_eq!(buf.relocs()[0].format, RelocFormat::Disp32);
    assert_eq!(buf.relocs()[0].target, 0xDEAD_F000);
}

#[test]
fn rip_relative_disp_accounts_for_trailing_immediate() {
    let mut buf = CodeBuffer::with_base(0x1000);
    let mut asm = Assembler::new(&mut buf);
    let adr = Address::rip_relative(0, RelocationHolder::new(RelocKind::InternalWord, 0x2000));
    asm.encode(&Insn::new("mov").op(adr).op(7)).unwrap();
    // C7 05 <disp32> <imm32>; the displacement aims past the immediate.
    assert_eq!(buf.bytes()[..2], [0xC7, 0x05]);
    let disp = i32::from_le_bytes(buf.bytes()[2..6].try_into().unwrap());
    let insn_end = 0x1000 + buf.bytes().len() as i32;
    assert_eq!(disp, 0x2000 - insn_end);
    assert_eq!(buf.bytes()[6..], [0x07, 0x00, 0x00, 0x00]);
    assert_eq!(buf.relocs().len(), 1);
    assert_eq!(buf.relocs()[0].offset, 2);
}

#[test]
fn call_beyond_disp32_range_fails() {
    let mut buf = CodeBuffer::with_base(0);
    let mut asm = Assembler::new(&mut buf);
    let far = AddressLiteral::runtime_call(u64::from(u32::MAX) + 0x10_0000);
    assert!(matches!(
        asm.call_literal(&far),
        Err(EmitError::UnreachableTarget { .. })
    ));
    // A failed branch leaves no stray opcode byte or relocation behind.
    assert!(buf.bytes().is_empty());
    assert!(buf.relocs().is_empty());
}

#[test]
fn each_relocatable_value_yields_exactly_one_record() {
    let mut buf = CodeBuffer::with_base(0x4000);
    let mut asm = Assembler::new(&mut buf);
    asm.encode(&Insn::new("add").op(RAX).op(RBX)).unwrap();
    asm.call_literal(&AddressLiteral::runtime_call(0x8000)).unwrap();
    asm.encode(&Insn::new("sub").op(RAX).op(5)).unwrap();
    asm.call_literal(&AddressLiteral::runtime_call(0x9000)).unwrap();
    assert_eq!(buf.relocs().len(), 2);
    assert!(buf.relocs()[0].offset < buf.relocs()[1].offset);
    assert_eq!(buf.relocs()[0].kind, RelocKind::RuntimeCall);
}
