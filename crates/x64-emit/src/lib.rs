//! # x64-emit — x86-64 Machine-Code Emission Engine
//!
//! `x64-emit` encodes x86-64 instructions directly into a growable code
//! buffer, the way a JIT compiler backend needs them: given an instruction
//! shape, its operand registers or memory operand, and an encoding
//! configuration, it produces the minimal legal byte sequence — prefixes,
//! opcode, ModR/M, SIB, displacement, immediate — and records relocation
//! metadata for every embedded address that must later be patched.
//!
//! ## Quick Start
//!
//! ```rust
//! use x64_emit::{Assembler, CodeBuffer, Insn, Width};
//! use x64_emit::reg::{RAX, RBX};
//!
//! let mut buf = CodeBuffer::new();
//! let mut asm = Assembler::new(&mut buf);
//! asm.encode(&Insn::new("add").op(RAX).op(RBX).width(Width::Q)).unwrap();
//! assert_eq!(buf.bytes(), [0x48, 0x03, 0xC3]);
//! ```
//!
//! ## Features
//!
//! - **All four prefix families** — legacy/REX, REX2, VEX, EVEX — selected
//!   once per instruction, never mixed.
//! - **32 architectural registers** — APX extended GPRs and EVEX upper
//!   vector registers, with automatic promotion to a family that can
//!   express them.
//! - **EVEX compressed displacement** — exact tuple-type arithmetic, never
//!   approximated.
//! - **Relocation records** — one record per embedded relocatable value, at
//!   exactly the offset where its bytes were written.
//! - **`no_std` + `alloc`** — usable inside a runtime with no OS surface.

#![cfg_attr(not(feature = "std"), no_std)]
#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An instruction encoder intentionally performs many narrowing /
// sign-changing casts between integer widths (i32→u8, i64→u32, etc.) and
// uses dense hex literals without separators (0xC5, 0x0F38).  The lints
// below are expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::bool_to_int_with_if,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::fn_params_excessive_bools,
    clippy::too_many_lines,
    clippy::unused_self,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc
)]

extern crate alloc;

/// Per-instruction encoding configuration: widths, vector length, masking,
/// and compressed-displacement parameters.
pub mod attr;
/// The caller-owned growable code buffer and its relocation list.
pub mod buffer;
/// Data-driven instruction catalog and the `Insn` builder.
pub mod catalog;
/// Prefix / ModR/M / SIB emission engine.
pub mod emit;
/// Error types.
pub mod error;
/// Memory-operand model: `Address`, `AddressLiteral`, scale factors.
pub mod operand;
/// Register identities (GPR / vector / opmask).
pub mod reg;
/// Relocation kinds, formats, and records.
pub mod reloc;

// Re-exports
pub use attr::{InputSize, InstructionAttr, TupleType, VectorLen, Width};
pub use buffer::CodeBuffer;
pub use catalog::{Insn, InsnDescriptor, InsnFlags, Operand};
pub use emit::{Assembler, AttrScope, OpcodeMap, PrefixFamily, RawEmit, SimdPrefix};
pub use error::EmitError;
pub use operand::{Address, AddressLiteral, RegisterOrConstant, ScaleFactor};
pub use reg::{Gpr, KReg, Xmm};
pub use reloc::{RelocEntry, RelocFormat, RelocKind, RelocationHolder};
