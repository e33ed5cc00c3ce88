//! Byte buffer for one image section.

/// A buffer for laying out stored structures.
#[derive(Debug, Default, Clone)]
pub struct SectionBuffer {
    bytes: Vec<u8>,
}

impl SectionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pad with zeros up to a multiple of `align`.
    pub fn align_to(&mut self, align: usize) {
        let aligned = self.bytes.len().next_multiple_of(align.max(1));
        self.bytes.resize(aligned, 0);
    }

    /// Append `data` at the next `align` boundary and return its offset.
    pub fn emit_aligned(&mut self, data: &[u8], align: usize) -> usize {
        self.align_to(align);
        let offset = self.bytes.len();
        self.bytes.extend_from_slice(data);
        offset
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
