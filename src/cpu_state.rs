//! CPU state abstraction.
//!
//! Three operations, arch-selected at build time: read/write the faulting
//! thread's instruction pointer, and read the counter register `JCXZ`
//! needs. `windows-sys`'s `CONTEXT` struct already has different field sets
//! per target arch (`Rip`/`Rcx` on x64, `Eip`/`Ecx` on x86). This module
//! is the one seam that hides that from the Tracer.

#[cfg(windows)]
use windows_sys::Win32::System::Diagnostics::Debug::CONTEXT;

#[cfg(windows)]
pub unsafe fn read_instruction_pointer(context: *const CONTEXT) -> u64 {
    #[cfg(target_pointer_width = "64")]
    {
        (*context).Rip
    }
    #[cfg(target_pointer_width = "32")]
    {
        (*context).Eip as u64
    }
}

#[cfg(windows)]
pub unsafe fn write_instruction_pointer(context: *mut CONTEXT, value: u64) {
    #[cfg(target_pointer_width = "64")]
    {
        (*context).Rip = value;
    }
    #[cfg(target_pointer_width = "32")]
    {
        (*context).Eip = value as u32;
    }
}

/// Full-width counter register. The instruction itself only ever tests the
/// 16-bit `CX` sub-register, but this matches the reference implementation's
/// behavior of comparing the full architectural register.
#[cfg(windows)]
pub unsafe fn read_counter_register(context: *const CONTEXT) -> u64 {
    #[cfg(target_pointer_width = "64")]
    {
        (*context).Rcx
    }
    #[cfg(target_pointer_width = "32")]
    {
        (*context).Ecx as u64
    }
}

#[cfg(windows)]
pub unsafe fn read_flags_register(context: *const CONTEXT) -> u32 {
    (*context).EFlags
}
