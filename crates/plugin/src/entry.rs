//! Process attach/detach plumbing

use std::ffi::c_void;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{error, info};
use windows::Win32::Foundation::{BOOL, HMODULE, MAX_PATH};
use windows::Win32::System::LibraryLoader::{DisableThreadLibraryCalls, GetModuleFileNameA};
use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

use hookforge_core::manifest::{Manifest, MANIFEST_FILE_NAME};
use hookforge_core::Installer;

const LOG_FILE_NAME: &str = "hookforge.log";
const LOG_ENV_VAR: &str = "HOOKFORGE_LOG";

/// The engine state for this process, created at attach and torn down at
/// detach. No host thread races this: the loader serialises DllMain.
static ENGINE: Mutex<Option<Installer>> = Mutex::new(None);

#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn DllMain(
    module: HMODULE,
    reason: u32,
    _reserved: *mut c_void,
) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            let _ = DisableThreadLibraryCalls(module);
            BOOL::from(attach(module))
        }
        DLL_PROCESS_DETACH => {
            detach();
            BOOL::from(true)
        }
        _ => BOOL::from(true),
    }
}

/// Reads the manifest next to our own DLL and runs the installer. Returns
/// `false` (failing the load) only for process-level problems: an
/// unreadable or unusable manifest. Hook-level failures are already logged
/// and isolated by the installer.
unsafe fn attach(module: HMODULE) -> bool {
    let Some(dir) = module_directory(module) else {
        return false;
    };
    init_logging(&dir);
    info!("hookforge attaching, working directory {}", dir.display());

    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let manifest = match Manifest::load(&manifest_path) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!("{}: {}", manifest_path.display(), err);
            return false;
        }
    };

    let mut installer = Installer::new();
    // SAFETY: the manifest's sites are verified against this host build
    // before any write, and DllMain runs before the host reaches any
    // patched window.
    installer.install_all(&manifest);
    *ENGINE.lock() = Some(installer);
    true
}

fn detach() {
    if let Some(mut installer) = ENGINE.lock().take() {
        info!(
            "hookforge detaching, releasing {} stub pages",
            installer.wrapper_count()
        );
        installer.shutdown();
    }
}

/// Directory holding the engine DLL itself; the manifest and the log file
/// sit next to it.
fn module_directory(module: HMODULE) -> Option<PathBuf> {
    let mut raw = [0u8; MAX_PATH as usize];
    // SAFETY: `module` is the live handle DllMain was invoked with.
    let len = unsafe { GetModuleFileNameA(Some(module), &mut raw) } as usize;
    if len == 0 || len >= raw.len() {
        return None;
    }
    let path = PathBuf::from(String::from_utf8_lossy(&raw[..len]).into_owned());
    path.parent().map(Path::to_path_buf)
}

/// There is no console inside the host, so the subscriber writes to a file
/// next to the DLL. Level comes from `HOOKFORGE_LOG`, defaulting to info.
fn init_logging(dir: &Path) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));

    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))
    {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init();
        }
        Err(_) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .try_init();
        }
    }
}
