//! The growable code buffer.
//!
//! The buffer is owned by the caller (the compilation controlling one code
//! blob) and only borrowed by the encoder.  It holds the emitted bytes, the
//! ordered relocation list, and the address the first byte is assumed to
//! land at — reachability decisions for rip-relative literals are made
//! against that assumed placement.

use alloc::vec::Vec;

use crate::reloc::{RelocEntry, RelocFormat, RelocKind};

/// A caller-owned, growable machine-code buffer with its relocation list.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    relocs: Vec<RelocEntry>,
    base: u64,
}

impl CodeBuffer {
    /// An empty buffer assumed to be placed at address 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_base(0)
    }

    /// An empty buffer assumed to be placed at `base`.
    #[must_use]
    pub fn with_base(base: u64) -> Self {
        Self {
            bytes: Vec::new(),
            relocs: Vec::new(),
            base,
        }
    }

    /// The assumed address of byte 0.
    #[inline]
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Current write position (number of bytes emitted so far).
    #[inline]
    #[must_use]
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    /// The emitted bytes.
    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The recorded relocations, in emission order.
    #[inline]
    #[must_use]
    pub fn relocs(&self) -> &[RelocEntry] {
        &self.relocs
    }

    /// Append one byte.
    #[inline]
    pub fn emit_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    /// Append a 16-bit value, little-endian.
    #[inline]
    pub fn emit_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a 32-bit value, little-endian.
    #[inline]
    pub fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a 64-bit value, little-endian.
    #[inline]
    pub fn emit_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Record a relocation whose value starts at the current position.
    /// Must be called immediately before the value bytes are emitted so the
    /// stored offset matches where they land.
    #[inline]
    pub fn relocate_here(&mut self, kind: RelocKind, format: RelocFormat, target: u64) {
        let offset = self.position();
        self.relocs.push(RelocEntry {
            offset,
            kind,
            format,
            target,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_primitives() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xAA);
        buf.emit_u16(0x1122);
        buf.emit_u32(0x3344_5566);
        buf.emit_u64(0x8899_AABB_CCDD_EEFF);
        assert_eq!(
            buf.bytes(),
            [
                0xAA, 0x22, 0x11, 0x66, 0x55, 0x44, 0x33, 0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA,
                0x99, 0x88
            ]
        );
        assert_eq!(buf.position(), 15);
    }

    #[test]
    fn relocation_offset_matches_write_position() {
        let mut buf = CodeBuffer::with_base(0x1000);
        buf.emit_u8(0x48);
        buf.emit_u8(0x8B);
        buf.relocate_here(RelocKind::ExternalWord, RelocFormat::Disp32, 0x2000);
        buf.emit_u32(0);
        assert_eq!(buf.relocs().len(), 1);
        assert_eq!(buf.relocs()[0].offset, 2);
        assert_eq!(buf.relocs()[0].target, 0x2000);
        assert_eq!(buf.base(), 0x1000);
    }
}
