//! Property-based tests using proptest.
//!
//! These tests verify encoder invariants across large, randomly generated
//! input spaces — complementing the targeted golden-byte tests and the
//! iced-x86 cross-validation suite.

use proptest::prelude::*;
use x64_emit::reg::{Gpr, RAX, RCX};
use x64_emit::{
    Address, Assembler, AttrScope, CodeBuffer, EmitError, InputSize, Insn, InstructionAttr,
    TupleType, VectorLen, Width,
};

// ── Strategies ──────────────────────────────────────────────────────────

/// Compressing tuple configurations and the element size each implies at
/// 512-bit length.
fn tuple_and_element() -> impl Strategy<Value = (TupleType, InputSize, i32)> {
    prop::sample::select(vec![
        (TupleType::Fv, InputSize::Bits32, 64),
        (TupleType::Fv, InputSize::Bits64, 64),
        (TupleType::Fvm, InputSize::NoBits, 64),
        (TupleType::Hv, InputSize::Bits32, 32),
        (TupleType::T1s, InputSize::Bits8, 1),
        (TupleType::T1s, InputSize::Bits16, 2),
        (TupleType::T1s, InputSize::Bits32, 4),
        (TupleType::T1s, InputSize::Bits64, 8),
        (TupleType::M128, InputSize::NoBits, 16),
        (TupleType::Qvm, InputSize::NoBits, 16),
        (TupleType::Ovm, InputSize::NoBits, 8),
    ])
}

/// Displacements biased toward the compression boundaries.
fn arb_disp() -> impl Strategy<Value = i32> {
    prop_oneof![
        any::<i32>(),
        -0x2100i32..0x2100,
        prop::sample::select(vec![
            0, 1, -1, 63, 64, 65, 127, 128, -128, -129, 0x1FC0, 0x2000, -0x2000, -0x2040,
            i32::MAX, i32::MIN,
        ]),
    ]
}

fn emit_mem(scope: &mut AttrScope<'_, '_>, disp: i32) -> Result<(), EmitError> {
    // base RCX: low3 = 1, no SIB, so the byte count isolates the
    // displacement field width.
    scope.emit_operand(0, &Address::base_disp(RCX, disp), 0)
}

proptest! {
    /// For element size S and displacement D, the 1-byte form is chosen
    /// iff D % S == 0 and D / S fits a signed byte; otherwise the full
    /// 4-byte field is used and carries D exactly.
    #[test]
    fn compressed_displacement_predicate(
        (tuple, input, element) in tuple_and_element(),
        disp in arb_disp(),
    ) {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        let mut attr = InstructionAttr::new(VectorLen::L512, input == InputSize::Bits64, false, false, true);
        attr.set_address_attributes(tuple, input);
        attr.set_is_evex_instruction();
        let mut scope = asm.attach(attr);
        emit_mem(&mut scope, disp).unwrap();
        drop(scope);

        let compressible = disp % element == 0 && i8::try_from(disp / element).is_ok();
        if disp == 0 {
            // mod=00, no displacement field at all.
            prop_assert_eq!(buf.bytes().len(), 1);
        } else if compressible {
            prop_assert_eq!(buf.bytes().len(), 2);
            prop_assert_eq!(buf.bytes()[1] as i8 as i32, disp / element);
        } else {
            prop_assert_eq!(buf.bytes().len(), 5);
            let raw = i32::from_le_bytes(buf.bytes()[1..5].try_into().unwrap());
            prop_assert_eq!(raw, disp);
        }
    }

    /// Without EVEX in play the same ladder applies with element size 1.
    #[test]
    fn plain_displacement_smallest_exact_fit(disp in arb_disp()) {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        asm.emit_operand(0, &Address::base_disp(RCX, disp), 0).unwrap();
        let expected = if disp == 0 {
            1
        } else if i8::try_from(disp).is_ok() {
            2
        } else {
            5
        };
        prop_assert_eq!(buf.bytes().len(), expected);
    }

    /// Exhaustive family selection: encodings below 8 emit no prefix,
    /// 8..16 emit exactly one REX byte, and 16..32 always take the REX2
    /// escape — never a bare legacy form.
    #[test]
    fn prefix_family_by_encoding(a in 0u8..32, b in 0u8..32) {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        asm.gp_prefix_rr(false, Gpr::new(a), Gpr::new(b), x64_emit::OpcodeMap::Map0).unwrap();
        let bytes = buf.bytes();
        if a >= 16 || b >= 16 {
            prop_assert_eq!(bytes[0], 0xD5);
            prop_assert_eq!(bytes.len(), 2);
        } else if a >= 8 || b >= 8 {
            prop_assert_eq!(bytes.len(), 1);
            prop_assert_eq!(bytes[0] & 0xF0, 0x40);
        } else {
            prop_assert!(bytes.is_empty());
        }
    }

    /// Displacement folding is checked arithmetic: `plus_disp` either
    /// yields the exact sum or reports an overflow, never wraps.
    #[test]
    fn plus_disp_checked(d1 in any::<i32>(), d2 in any::<i32>()) {
        let adr = Address::base_disp(RAX, d1);
        match (adr.plus_disp(d2), d1.checked_add(d2)) {
            (Ok(a), Some(sum)) => prop_assert_eq!(a.disp(), sum),
            (Err(EmitError::DisplacementOverflow { .. }), None) => {}
            (got, want) => prop_assert!(false, "mismatch: {got:?} vs {want:?}"),
        }
    }

    /// The ALU immediate form switches from 3 to 6 bytes exactly at the
    /// signed-byte boundary.
    #[test]
    fn alu_immediate_width_selection(value in any::<i32>()) {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        asm.encode(&Insn::new("add").op(RCX).op(value)).unwrap();
        let expected = if i8::try_from(value).is_ok() { 3 } else { 6 };
        prop_assert_eq!(buf.bytes().len(), expected);
    }

    /// Promoted no-flags forms are fixed-size regardless of how small the
    /// legacy rendition would be.
    #[test]
    fn no_flags_never_demotes(a in 0u8..16, b in 0u8..16) {
        let mut buf = CodeBuffer::new();
        let mut asm = Assembler::new(&mut buf);
        asm.encode(
            &Insn::new("add").op(Gpr::new(a)).op(Gpr::new(b)).width(Width::Q).no_flags(),
        ).unwrap();
        prop_assert_eq!(buf.bytes().len(), 6);
        prop_assert_eq!(buf.bytes()[0], 0x62);
    }
}
