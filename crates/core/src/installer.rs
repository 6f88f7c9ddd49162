//! Patch orchestration and the process-global installed state
//!
//! The installer walks the manifest in declaration order. Hook-level
//! failures (verification, module load, symbol lookup, allocation) abort
//! that hook only; the remaining hooks still install. Everything acquired
//! along the way (module handles, wrapper pages, raw code blocks) is owned
//! here and released in reverse order at process detach.

use std::ffi::CString;

use tracing::{error, info, warn};
use windows::core::PCSTR;
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryA};

use crate::hooks::wrapper::WrapperArena;
use crate::hooks::{memory, verify, InstallError};
use crate::manifest::{Address, HookKind, HookSpec, Manifest, BUILD_ENV_VAR};

struct LoadedModule {
    path: String,
    handle: HMODULE,
}

pub struct Installer {
    modules: Vec<LoadedModule>,
    wrappers: WrapperArena,
    raw_blocks: WrapperArena,
}

// SAFETY: module handles and executable pages are process-global resources;
// the installer touches them only during install and teardown, both of which
// run on the thread driving the module lifecycle.
unsafe impl Send for Installer {}

impl Installer {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            wrappers: WrapperArena::new(),
            raw_blocks: WrapperArena::new(),
        }
    }

    /// Publishes the build-identity token and installs every hook in
    /// manifest order. Returns the installed/failed counts.
    ///
    /// # Safety
    /// Every `site` in the manifest must lie in the host image, and no host
    /// thread may be executing inside a patched window while this runs.
    pub unsafe fn install_all(&mut self, manifest: &Manifest) -> (usize, usize) {
        // Hook DLL initialisers key their per-build address databases off
        // this variable, so it has to land before the first LoadLibrary.
        match &manifest.target_build {
            Some(build) => {
                std::env::set_var(BUILD_ENV_VAR, build);
                info!("published {}={}", BUILD_ENV_VAR, build);
            }
            None => warn!("manifest declares no target_build; {} stays unset", BUILD_ENV_VAR),
        }

        let mut installed = 0;
        let mut failed = 0;
        for spec in &manifest.hooks {
            match self.install_hook(spec) {
                Ok(()) => installed += 1,
                Err(err) => {
                    failed += 1;
                    error!("patch '{}' @ {:#010x}: {}", spec.id, spec.site, err);
                }
            }
        }
        info!("{} patch entries installed, {} failed", installed, failed);
        (installed, failed)
    }

    unsafe fn install_hook(&mut self, spec: &HookSpec) -> Result<(), InstallError> {
        match spec.kind {
            HookKind::ModuleOnly => {
                let path = spec.module_path.as_deref().unwrap_or_default();
                self.load_module(path)?;
                info!("patch '{}': loaded module {}", spec.id, path);
                Ok(())
            }
            HookKind::SimpleReplace => {
                verify_site(spec)?;
                memory::patch_bytes(spec.site, &spec.replacement)?;
                info!(
                    "patch '{}': replaced {} bytes at {:#010x}",
                    spec.id,
                    spec.replacement.len(),
                    spec.site
                );
                Ok(())
            }
            HookKind::RawBlock => {
                verify_site(spec)?;
                let block = self.raw_blocks.generate_raw_block(spec)?;
                divert_site(spec, block)?;
                info!(
                    "patch '{}': raw code block at {:#010x} -> {:#010x}",
                    spec.id, spec.site, block
                );
                Ok(())
            }
            HookKind::Detour => {
                verify_site(spec)?;
                // Validation guarantees both fields for detours.
                let path = spec.module_path.as_deref().unwrap_or_default();
                let symbol = spec.symbol_name.as_deref().unwrap_or_default();
                let handle = self.load_module(path)?;
                let hook_fn = resolve_symbol(handle, path, symbol)?;
                let stub = self.wrappers.generate_detour(spec, hook_fn)?;
                divert_site(spec, stub)?;
                info!(
                    "patch '{}': detour at {:#010x} -> {} (stub {:#010x})",
                    spec.id, spec.site, symbol, stub
                );
                Ok(())
            }
        }
    }

    /// Loads an auxiliary DLL, reusing the handle if this run already
    /// loaded the same path.
    fn load_module(&mut self, path: &str) -> Result<HMODULE, InstallError> {
        if let Some(loaded) = self.modules.iter().find(|m| m.path == path) {
            return Ok(loaded.handle);
        }

        let c_path = CString::new(path).map_err(|_| InstallError::ModuleLoad {
            path: path.to_owned(),
            reason: "path contains an interior NUL".to_owned(),
        })?;
        // SAFETY: nul-terminated string that outlives the call.
        let handle = unsafe { LoadLibraryA(PCSTR(c_path.as_ptr() as *const u8)) }.map_err(
            |err| InstallError::ModuleLoad {
                path: path.to_owned(),
                reason: err.message(),
            },
        )?;

        self.modules.push(LoadedModule {
            path: path.to_owned(),
            handle,
        });
        Ok(handle)
    }

    /// Releases wrapper pages, raw code blocks and module handles, most
    /// recently acquired first. Idempotent.
    pub fn shutdown(&mut self) {
        self.raw_blocks.release_all();
        self.wrappers.release_all();
        while let Some(module) = self.modules.pop() {
            // SAFETY: handle came from LoadLibraryA and is freed exactly once.
            if let Err(err) = unsafe { FreeLibrary(module.handle) } {
                warn!("FreeLibrary({}) failed: {}", module.path, err.message());
            }
        }
    }

    pub fn wrapper_count(&self) -> usize {
        self.wrappers.page_count() + self.raw_blocks.page_count()
    }
}

impl Drop for Installer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Gate every mutating kind on the manifest's byte signature. A mismatch
/// means the manifest was written for a different host build.
unsafe fn verify_site(spec: &HookSpec) -> Result<(), InstallError> {
    if verify::verify(spec.site, &spec.original) {
        Ok(())
    } else {
        Err(InstallError::BuildMismatch { site: spec.site })
    }
}

/// Points the site at `target` with a 5-byte JMP and NOP-pads whatever is
/// left of the stolen bytes, each in its own protection bracket.
unsafe fn divert_site(spec: &HookSpec, target: Address) -> Result<(), InstallError> {
    memory::write_jump(spec.site, target)?;
    if spec.original.len() > 5 {
        memory::write_nops(spec.site.wrapping_add(5), spec.original.len() - 5)?;
    }
    Ok(())
}

fn resolve_symbol(handle: HMODULE, module: &str, name: &str) -> Result<Address, InstallError> {
    let c_name = CString::new(name).map_err(|_| InstallError::SymbolResolve {
        name: name.to_owned(),
        module: module.to_owned(),
    })?;
    // SAFETY: live module handle and a nul-terminated export name.
    match unsafe { GetProcAddress(handle, PCSTR(c_name.as_ptr() as *const u8)) } {
        Some(f) => Ok(f as usize as Address),
        None => Err(InstallError::SymbolResolve {
            name: name.to_owned(),
            module: module.to_owned(),
        }),
    }
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}
