//! Machine code buffer.
//!
//! Append-only during emission; individual sites are overwritten through the
//! `patch_*` methods once the resolver knows final addresses.

/// Machine code buffer for emitting instructions
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
        }
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit multiple bytes
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a 32-bit little-endian value
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit little-endian value
    #[inline]
    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Read back a 32-bit little-endian word at the given offset
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.code[offset],
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
        ])
    }

    /// Patch a 32-bit word at the given offset
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Patch a signed 32-bit value at the given offset
    pub fn patch_i32(&mut self, offset: usize, value: i32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Take ownership of the generated code
    pub fn into_code(self) -> Vec<u8> {
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_and_offset() {
        let mut buf = CodeBuffer::new();
        assert_eq!(buf.offset(), 0);
        buf.emit(0x90);
        buf.emit_u32(0xD503201F);
        buf.emit_bytes(&[0xC3]);
        assert_eq!(buf.offset(), 6);
        assert_eq!(buf.code(), &[0x90, 0x1F, 0x20, 0x03, 0xD5, 0xC3]);
    }

    #[test]
    fn test_patch_roundtrip() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        buf.patch_i32(0, -8);
        assert_eq!(buf.read_u32(0), (-8i32) as u32);
        buf.patch_u32(0, 0x14000001);
        assert_eq!(buf.read_u32(0), 0x14000001);
    }
}
