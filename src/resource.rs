//! Resource attachment.
//!
//! Windows-only: embeds the serialized [`crate::nanomite::NanomiteTable`]
//! into the output image as an `RT_RCDATA` resource under a fixed integer
//! id. `BeginUpdateResource`/`UpdateResource`/`EndUpdateResource` already
//! give atomic open-update-commit semantics at the OS level. On any
//! intermediate failure we explicitly discard (`EndUpdateResourceW` with
//! `fDiscard = TRUE`) rather than let a half-written update land on disk.

use crate::error::BuilderError;

/// Resource id the Tracer looks for at runtime.
pub const NANOMITE_RESOURCE_ID: u16 = 1234;

const RT_RCDATA: u16 = 10;

#[cfg(windows)]
pub fn attach(image_path: &std::path::Path, blob: &[u8]) -> Result<(), BuilderError> {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::System::LibraryLoader::{
        BeginUpdateResourceW, EndUpdateResourceW, UpdateResourceW,
    };

    let wide_path: Vec<u16> = image_path
        .as_os_str()
        .encode_wide()
        .chain(std::iter::once(0))
        .collect();

    // SAFETY: wide_path is NUL-terminated and kept alive for the duration
    // of the update transaction below.
    let update_handle = unsafe { BeginUpdateResourceW(wide_path.as_ptr(), 0) };
    if update_handle == 0 {
        return Err(BuilderError::ResourceAttach(
            "BeginUpdateResourceW failed".to_string(),
        ));
    }

    // SAFETY: update_handle was just validated non-null above; resource id
    // and type are MAKEINTRESOURCE-style small integers cast to pointers,
    // the conventional pattern for integer resource identifiers.
    let update_ok = unsafe {
        UpdateResourceW(
            update_handle,
            RT_RCDATA as *const u16 as *const _,
            NANOMITE_RESOURCE_ID as *const u16 as *const _,
            make_lang_id_neutral(),
            blob.as_ptr() as *mut _,
            blob.len() as u32,
        )
    };

    if update_ok == 0 {
        // Discard the half-applied transaction rather than commit it.
        unsafe { EndUpdateResourceW(update_handle, 1) };
        return Err(BuilderError::ResourceAttach(
            "UpdateResourceW failed".to_string(),
        ));
    }

    // SAFETY: same handle, committing this time (fDiscard = FALSE).
    let commit_ok = unsafe { EndUpdateResourceW(update_handle, 0) };
    if commit_ok == 0 {
        return Err(BuilderError::ResourceAttach(
            "EndUpdateResourceW failed to commit".to_string(),
        ));
    }

    Ok(())
}

#[cfg(not(windows))]
pub fn attach(_image_path: &std::path::Path, _blob: &[u8]) -> Result<(), BuilderError> {
    Err(BuilderError::ResourceAttach(
        "resource attachment requires a Windows host (RT_RCDATA update APIs)".to_string(),
    ))
}

/// `MAKELANGID(LANG_NEUTRAL, SUBLANG_NEUTRAL)`. Both sub-fields are zero.
fn make_lang_id_neutral() -> u16 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn resource_id_matches_spec() {
        assert_eq!(NANOMITE_RESOURCE_ID, 1234);
    }
}
