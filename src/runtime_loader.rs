//! Runtime image introspection and resource loading.
//!
//! Unlike `pe.rs` (which parses a well-formed on-disk file with `goblin`),
//! this module reads headers directly out of the *currently loaded* image
//! in this process's own address space. A loaded module's raw-offset
//! fields no longer correspond to file layout (sections are expanded to
//! `section_alignment`, not `file_alignment`), so the on-disk parser can't
//! be reused here. The header walk is done by hand, the same way the
//! original C++ `PEImage` collaborator reads `IMAGE_NT_HEADERS` straight
//! out of `GetModuleHandle`'s return value.

use scroll::{Pread, LE};

use crate::error::RuntimeError;

const DOS_HEADER_E_LFANEW_OFFSET: usize = 0x3c;
const SECTION_HEADER_SIZE: usize = 40;

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSection {
    pub virtual_address: u32,
    pub virtual_size: u32,
}

impl RuntimeSection {
    /// `[image_base + va, image_base + va + virtual_size)`, the extent the
    /// Tracer bounds-checks every trapped IP against.
    pub fn runtime_range(&self, image_base: u64) -> std::ops::Range<u64> {
        let start = image_base + self.virtual_address as u64;
        start..start + self.virtual_size as u64
    }
}

/// Read the section table directly out of memory starting at `image_base`.
///
/// # Safety
/// `image_base` must be the base address of a valid, fully-mapped PE image
/// in this process (e.g. the return value of `GetModuleHandle`).
pub unsafe fn read_sections(image_base: u64) -> Result<Vec<(String, RuntimeSection)>, RuntimeError> {
    // A generous upper bound on header size; real PE headers are always
    // well within this, and we only ever read forward from `image_base`.
    const HEADER_VIEW_SIZE: usize = 4096;
    let header_bytes = std::slice::from_raw_parts(image_base as *const u8, HEADER_VIEW_SIZE);

    let e_lfanew: u32 = header_bytes
        .pread_with(DOS_HEADER_E_LFANEW_OFFSET, LE)
        .map_err(RuntimeError::EnvelopeMismatch)?;
    let nt_offset = e_lfanew as usize;

    // signature(4) + Machine(2) + NumberOfSections(2) + ... up to SizeOfOptionalHeader
    let number_of_sections: u16 = header_bytes
        .pread_with(nt_offset + 4 + 2, LE)
        .map_err(RuntimeError::EnvelopeMismatch)?;
    let size_of_optional_header: u16 = header_bytes
        .pread_with(nt_offset + 4 + 16, LE)
        .map_err(RuntimeError::EnvelopeMismatch)?;

    let section_table_offset = nt_offset + 4 + 20 + size_of_optional_header as usize;

    let mut sections = Vec::with_capacity(number_of_sections as usize);
    for i in 0..number_of_sections as usize {
        let base = section_table_offset + i * SECTION_HEADER_SIZE;
        let name_bytes = &header_bytes[base..base + 8];
        let name = String::from_utf8_lossy(name_bytes)
            .trim_end_matches('\0')
            .to_string();
        let virtual_size: u32 = header_bytes.pread_with(base + 8, LE).map_err(RuntimeError::EnvelopeMismatch)?;
        let virtual_address: u32 = header_bytes.pread_with(base + 12, LE).map_err(RuntimeError::EnvelopeMismatch)?;
        sections.push((name, RuntimeSection { virtual_address, virtual_size }));
    }
    Ok(sections)
}

/// Locate `name` among the currently loaded image's sections.
///
/// # Safety
/// Same precondition as [`read_sections`].
pub unsafe fn find_section(image_base: u64, name: &str) -> Result<RuntimeSection, RuntimeError> {
    read_sections(image_base)?
        .into_iter()
        .find(|(section_name, _)| section_name == name)
        .map(|(_, section)| section)
        .ok_or_else(|| RuntimeError::SectionMissing { name: name.to_string() })
}

#[cfg(windows)]
pub fn load_nanomite_resource() -> Result<Vec<u8>, RuntimeError> {
    use windows_sys::Win32::System::LibraryLoader::{
        FindResourceW, GetModuleHandleW, LoadResource, LockResource, SizeofResource,
    };

    const RT_RCDATA: u16 = 10;

    unsafe {
        let module = GetModuleHandleW(std::ptr::null());
        let resource_handle = FindResourceW(
            module,
            crate::resource::NANOMITE_RESOURCE_ID as *const u16 as *const _,
            RT_RCDATA as *const u16 as *const _,
        );
        if resource_handle == 0 {
            return Err(RuntimeError::ResourceMissing);
        }

        let size = SizeofResource(module, resource_handle);
        if size == 0 {
            return Err(RuntimeError::ResourceMissing);
        }

        let resource_data_handle = LoadResource(module, resource_handle);
        if resource_data_handle == 0 {
            return Err(RuntimeError::ResourceMissing);
        }

        let data_ptr = LockResource(resource_data_handle);
        if data_ptr.is_null() {
            return Err(RuntimeError::ResourceMissing);
        }

        let slice = std::slice::from_raw_parts(data_ptr as *const u8, size as usize);
        Ok(slice.to_vec())
    }
}

#[cfg(not(windows))]
pub fn load_nanomite_resource() -> Result<Vec<u8>, RuntimeError> {
    Err(RuntimeError::UnsupportedPlatform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn runtime_range_is_relative_to_image_base() {
        let section = RuntimeSection { virtual_address: 0x1000, virtual_size: 0x200 };
        let range = section.runtime_range(0x1_0000_0000);
        assert_eq!(range, 0x1_0000_1000..0x1_0000_1200);
    }
}
