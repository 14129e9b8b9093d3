//! PE file access.
//!
//! Narrow contract on purpose: load a file into memory, enumerate section
//! headers, and locate one by name. Everything else about the image (import
//! tables, relocations, resource directory contents) is irrelevant to the
//! Builder and deliberately not exposed here.

use goblin::pe::PE;

use crate::error::BuilderError;

/// A section's extent inside the on-disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionExtent {
    pub raw_file_offset: u32,
    pub raw_size: u32,
    pub virtual_address: u32,
    pub virtual_size: u32,
}

impl SectionExtent {
    pub fn raw_range(&self) -> std::ops::Range<usize> {
        self.raw_file_offset as usize..(self.raw_file_offset as usize + self.raw_size as usize)
    }
}

/// An in-memory PE image the Builder can inspect and patch in place.
pub struct Image {
    pub bytes: Vec<u8>,
}

impl Image {
    pub fn open(path: &std::path::Path) -> Result<Self, BuilderError> {
        let bytes = std::fs::read(path)?;
        Ok(Image { bytes })
    }

    /// Locate a section by its ASCII name (e.g. `.nano`). PE section names
    /// are stored as fixed 8-byte, NUL-padded ASCII, so the name is
    /// truncated to that length before comparison, matching
    /// `IMAGE_SECTION_HEADER::Name` semantics.
    pub fn find_section(&self, name: &str) -> Result<SectionExtent, BuilderError> {
        let pe = PE::parse(&self.bytes)?;
        pe.sections
            .iter()
            .find(|s| s.name().map(|n| n == name).unwrap_or(false))
            .map(|s| SectionExtent {
                raw_file_offset: s.pointer_to_raw_data,
                raw_size: s.size_of_raw_data,
                virtual_address: s.virtual_address,
                virtual_size: s.virtual_size,
            })
            .ok_or_else(|| BuilderError::SectionNotFound { name: name.to_string() })
    }

    pub fn section_bytes_mut(&mut self, extent: &SectionExtent) -> &mut [u8] {
        &mut self.bytes[extent.raw_range()]
    }

    pub fn section_bytes(&self, extent: &SectionExtent) -> &[u8] {
        &self.bytes[extent.raw_range()]
    }

    pub fn write_to(&self, path: &std::path::Path) -> Result<(), BuilderError> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn raw_range_covers_section_bytes() {
        let extent = SectionExtent { raw_file_offset: 0x400, raw_size: 4, virtual_address: 0x1000, virtual_size: 4 };
        assert_eq!(extent.raw_range(), 0x400..0x404);
    }
}
