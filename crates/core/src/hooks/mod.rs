//! Hook installation machinery
//!
//! `emitter` and `wrapper` are pure byte-level code generation and run on
//! any host; `memory` talks to the Win32 virtual-memory API and only exists
//! on the one target the emitted code is for.

pub mod emitter;
#[cfg(all(windows, target_arch = "x86"))]
pub mod memory;
pub mod verify;
pub mod wrapper;

use crate::manifest::Address;

/// Errors that abort installation of a single hook. None of them stop the
/// installer from attempting the remaining hooks.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    /// The bytes at the site did not match the manifest's signature.
    #[error("original bytes mismatch at {site:#010x} - wrong host build?")]
    BuildMismatch { site: Address },

    /// The auxiliary DLL could not be loaded.
    #[error("failed to load module '{path}': {reason}")]
    ModuleLoad { path: String, reason: String },

    /// The hook function is not exported by the loaded DLL.
    #[error("symbol '{name}' not found in '{module}'")]
    SymbolResolve { name: String, module: String },

    /// No executable page for the wrapper or raw code block.
    #[error("failed to allocate {size} bytes of executable memory")]
    Alloc { size: usize },

    /// Page protection could not be changed before a write. The only error
    /// that can leave a site half-written if it occurs mid-sequence.
    #[error("failed to change page protection at {addr:#010x} ({len} bytes)")]
    MemoryProtect { addr: Address, len: usize },
}
