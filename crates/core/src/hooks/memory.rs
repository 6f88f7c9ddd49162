//! Page-protection and code-write primitives
//!
//! Every mutation of host code runs the same bracket: unprotect, write,
//! flush the instruction cache, reprotect. Failing to restore the prior
//! protection is logged and tolerated; the written patch is already live.

use std::ffi::c_void;

use tracing::warn;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE,
    PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::Threading::GetCurrentProcess;

use crate::manifest::Address;

use super::emitter::jmp_bytes;
use super::InstallError;

const NOP: u8 = 0x90;

/// Makes `[addr, addr+len)` read/write/execute, returning the protection
/// that was in place before.
///
/// # Safety
/// `addr` must point at committed pages of this process.
pub unsafe fn unprotect(addr: Address, len: usize) -> Result<PAGE_PROTECTION_FLAGS, InstallError> {
    let mut prior = PAGE_PROTECTION_FLAGS::default();
    VirtualProtect(
        addr as usize as *const c_void,
        len,
        PAGE_EXECUTE_READWRITE,
        &mut prior,
    )
    .map(|()| prior)
    .map_err(|_| InstallError::MemoryProtect { addr, len })
}

/// Puts the protection returned by [`unprotect`] back. Failure is logged
/// and reported, not raised: the patch already landed.
///
/// # Safety
/// Same range the matching [`unprotect`] covered.
pub unsafe fn reprotect(addr: Address, len: usize, prior: PAGE_PROTECTION_FLAGS) -> bool {
    let mut dummy = PAGE_PROTECTION_FLAGS::default();
    let ok = VirtualProtect(addr as usize as *const c_void, len, prior, &mut dummy).is_ok();
    if !ok {
        warn!("failed to restore page protection at {:#010x}", addr);
    }
    ok
}

/// Copies `bytes` into host memory at `addr`.
///
/// # Safety
/// The caller has unprotected `[addr, addr + bytes.len())` and no host
/// thread is executing inside that window.
pub unsafe fn write(addr: Address, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as usize as *mut u8, bytes.len());
}

/// Invalidates the CPU instruction cache over `[addr, addr+len)`.
pub fn flush_icache(addr: *const u8, len: usize) -> bool {
    // SAFETY: current-process handle plus a range we just wrote.
    let ok = unsafe { FlushInstructionCache(GetCurrentProcess(), Some(addr as *const c_void), len) }
        .is_ok();
    if !ok {
        warn!("FlushInstructionCache failed at {:p}", addr);
    }
    ok
}

/// The full unprotect/write/flush/reprotect bracket for `bytes` at `addr`.
///
/// # Safety
/// `addr` must lie in the host image and no host thread may be executing
/// inside the written window.
pub unsafe fn patch_bytes(addr: Address, bytes: &[u8]) -> Result<(), InstallError> {
    let prior = unprotect(addr, bytes.len())?;
    write(addr, bytes);
    flush_icache(addr as usize as *const u8, bytes.len());
    reprotect(addr, bytes.len(), prior);
    Ok(())
}

/// Writes a 5-byte relative `JMP` at `site` targeting `target`.
///
/// # Safety
/// As [`patch_bytes`].
pub unsafe fn write_jump(site: Address, target: Address) -> Result<(), InstallError> {
    patch_bytes(site, &jmp_bytes(site, target))
}

/// NOP-fills `[addr, addr+len)` so no partial instruction survives behind a
/// shorter patch.
///
/// # Safety
/// As [`patch_bytes`].
pub unsafe fn write_nops(addr: Address, len: usize) -> Result<(), InstallError> {
    if len == 0 {
        return Ok(());
    }
    patch_bytes(addr, &vec![NOP; len])
}

/// Commits a fresh read/write/execute region of at least `size` bytes.
pub fn alloc_executable(size: usize) -> Option<*mut u8> {
    // SAFETY: anonymous commit; a null result is handled below.
    let ptr = unsafe {
        VirtualAlloc(
            None,
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if ptr.is_null() {
        None
    } else {
        Some(ptr as *mut u8)
    }
}

/// Releases a region obtained from [`alloc_executable`].
///
/// # Safety
/// `ptr` must have come from [`alloc_executable`] and not been freed since.
pub unsafe fn free_executable(ptr: *mut u8) {
    if let Err(err) = VirtualFree(ptr as *mut c_void, 0, MEM_RELEASE) {
        warn!("VirtualFree({:p}) failed: {}", ptr, err.message());
    }
}
