//! The Tracer.
//!
//! Process-singleton by necessity: the OS's vectored-exception-handler
//! callback carries no user-data pointer, so the handler has nowhere else
//! to reach its lookup table from but process-global state. Mutation of
//! that state happens only on the controlling thread, inside `start`/`stop`,
//! never inside the handler itself. The handler does a single atomic
//! pointer load and then only reads.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use log::{debug, info};

use crate::branch::{self, Flags};
use crate::error::RuntimeError;
use crate::nanomite::NanomiteRecord;
use crate::runtime_loader::{self, RuntimeSection};

struct TracerState {
    image_base: u64,
    section_range: Range<u64>,
    index: HashMap<u32, NanomiteRecord>,
}

static ACTIVE: AtomicPtr<TracerState> = AtomicPtr::new(std::ptr::null_mut());
static HANDLER_HANDLE: Mutex<Option<usize>> = Mutex::new(None);

/// Locate the protected section, load its metadata resource, and start
/// trapping breakpoints inside it. Convenience wrapper around
/// [`start_tracing`] for the common case of "trace the currently loaded
/// image's named section".
#[cfg(windows)]
pub fn start(section_name: &str) -> Result<(), RuntimeError> {
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;

    // SAFETY: GetModuleHandleW(NULL) returns the base of the current
    // process's own executable, always a valid mapped image.
    let image_base = unsafe { GetModuleHandleW(std::ptr::null()) } as u64;
    // SAFETY: image_base is a valid loaded module as established above.
    let section = unsafe { runtime_loader::find_section(image_base, section_name)? };
    let blob = runtime_loader::load_nanomite_resource()?;
    let table = crate::nanomite::NanomiteTable::from_bytes(&blob)?;

    info!(
        "tracing section {section_name:?}: {} records loaded",
        table.records.len()
    );
    start_tracing(image_base, section, &table)
}

#[cfg(not(windows))]
pub fn start(_section_name: &str) -> Result<(), RuntimeError> {
    Err(RuntimeError::UnsupportedPlatform)
}

/// Install the handler and activate `table` for `section` within
/// `image_base`'s address space. Safe to call again after [`stop`].
pub fn start_tracing(image_base: u64, section: RuntimeSection, table: &crate::nanomite::NanomiteTable) -> Result<(), RuntimeError> {
    let state = Box::new(TracerState {
        image_base,
        section_range: section.runtime_range(image_base),
        index: table.index(),
    });
    let previous = ACTIVE.swap(Box::into_raw(state), Ordering::Release);
    if !previous.is_null() {
        // SAFETY: nothing still references a state that was only ever
        // reachable through ACTIVE, and callers are required not to
        // overlap start/stop with protected-code execution.
        unsafe { drop(Box::from_raw(previous)) };
    }

    install_handler()
}

/// Unregister the handler and drop all tracer state. Must not be called
/// while any thread may be executing inside the protected section.
/// Enforcing that is the host's job.
pub fn stop_tracing() {
    let previous = ACTIVE.swap(std::ptr::null_mut(), Ordering::Release);
    if !previous.is_null() {
        // SAFETY: see start_tracing.
        unsafe { drop(Box::from_raw(previous)) };
    }
    uninstall_handler();
    debug!("tracing stopped");
}

#[cfg(windows)]
fn install_handler() -> Result<(), RuntimeError> {
    use windows_sys::Win32::System::Diagnostics::Debug::AddVectoredExceptionHandler;

    let mut guard = HANDLER_HANDLE.lock().unwrap();
    if guard.is_some() {
        return Ok(());
    }
    // SAFETY: veh_callback matches the required extern "system" signature
    // and never panics/unwinds across the FFI boundary.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(veh_callback)) };
    if handle.is_null() {
        return Err(RuntimeError::UnsupportedPlatform);
    }
    *guard = Some(handle as usize);
    Ok(())
}

#[cfg(not(windows))]
fn install_handler() -> Result<(), RuntimeError> {
    Err(RuntimeError::UnsupportedPlatform)
}

#[cfg(windows)]
fn uninstall_handler() {
    use windows_sys::Win32::System::Diagnostics::Debug::RemoveVectoredExceptionHandler;

    let mut guard = HANDLER_HANDLE.lock().unwrap();
    if let Some(handle) = guard.take() {
        // SAFETY: handle was returned by a prior AddVectoredExceptionHandler
        // call and has not been removed since.
        unsafe {
            RemoveVectoredExceptionHandler(handle as *const std::ffi::c_void);
        }
    }
}

#[cfg(not(windows))]
fn uninstall_handler() {}

const EXCEPTION_BREAKPOINT: i32 = 0x8000_0003u32 as i32;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// First-chance handler. No allocation, no locking, no I/O. Reads only
/// from the process-wide index via a single atomic load. A miss (the
/// trapped IP isn't in the protected section, or isn't in the table) falls
/// back to searching the next handler in the chain.
#[cfg(windows)]
unsafe extern "system" fn veh_callback(
    exception_info: *mut windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS,
) -> i32 {
    let record = (*exception_info).ExceptionRecord;
    if (*record).ExceptionCode != EXCEPTION_BREAKPOINT {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let state_ptr = ACTIVE.load(Ordering::Acquire);
    if state_ptr.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }
    let state = &*state_ptr;

    let context = (*exception_info).ContextRecord;
    let ip = crate::cpu_state::read_instruction_pointer(context);

    if !state.section_range.contains(&ip) {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    let rva = (ip - state.image_base) as u32;
    let Some(nanomite) = state.index.get(&rva) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    if resolve(nanomite, context) {
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}

/// Evaluate the branch and rewrite IP. Split out from the callback purely
/// so it's unit-testable without a real `CONTEXT`/`EXCEPTION_POINTERS`.
#[cfg(windows)]
unsafe fn resolve(
    nanomite: &NanomiteRecord,
    context: *mut windows_sys::Win32::System::Diagnostics::Debug::CONTEXT,
) -> bool {
    let ip = crate::cpu_state::read_instruction_pointer(context);
    let eflags = crate::cpu_state::read_flags_register(context);
    let cx = crate::cpu_state::read_counter_register(context);

    let flags = Flags::from_register(eflags);
    let taken = branch::evaluate(nanomite.kind(), flags, cx);

    let new_ip = if taken {
        (ip as i64 + nanomite.opcode_length as i64 + nanomite.signed_displacement() as i64) as u64
    } else {
        ip + nanomite.opcode_length as u64
    };
    crate::cpu_state::write_instruction_pointer(context, new_ip);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::branch::BranchKind;
    use crate::nanomite::NanomiteRecord;

    /// Mirrors the IP-rewrite arithmetic `resolve` performs, without
    /// needing a real CONTEXT.
    fn next_ip(ip: u64, nanomite: &NanomiteRecord, taken: bool) -> u64 {
        if taken {
            (ip as i64 + nanomite.opcode_length as i64 + nanomite.signed_displacement() as i64) as u64
        } else {
            ip + nanomite.opcode_length as u64
        }
    }

    #[test]
    fn short_forward_branch_taken() {
        let record = NanomiteRecord { rva: 0, jump_type: BranchKind::Je as u32, jump_length: 0x7f, opcode_length: 2 };
        assert_eq!(next_ip(0x1000, &record, true), 0x1000 + 2 + 127);
    }

    #[test]
    fn short_backward_branch_taken() {
        let record = NanomiteRecord { rva: 0, jump_type: BranchKind::Jne as u32, jump_length: 0x80, opcode_length: 2 };
        assert_eq!(next_ip(0x1000, &record, true), 0x1000 + 2 - 128);
    }

    #[test]
    fn not_taken_only_advances_by_opcode_length() {
        let record = NanomiteRecord { rva: 0, jump_type: BranchKind::Je as u32, jump_length: 0x05, opcode_length: 2 };
        assert_eq!(next_ip(0x10, &record, false), 0x12);
    }

    #[test]
    fn unconditional_jump_end_to_end_scenario() {
        // EB 02 90 90 patched to CC rr 90 90.
        let record = NanomiteRecord { rva: 0x1000, jump_type: BranchKind::Jmp as u32, jump_length: 0x02, opcode_length: 2 };
        let taken = branch::evaluate(record.kind(), Flags::default(), 0);
        assert!(taken);
        assert_eq!(next_ip(0x1000, &record, taken), 0x1004);
    }
}
