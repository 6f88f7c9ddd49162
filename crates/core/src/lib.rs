//! hookforge core - runtime binary patching for IA-32/Win32 hosts
//!
//! The engine is injected into a 32-bit host process. At load time it reads
//! a declarative TOML manifest, verifies target byte signatures against the
//! expected host build, emits small machine-code wrapper stubs at runtime
//! and rewrites the host's instruction stream so control transfers through
//! those stubs into hook functions exported by auxiliary DLLs.
//!
//! Manifest handling and code generation are host-independent and carry the
//! test suite; the layers that touch the host process (`hooks::memory`,
//! [`installer`]) only exist on the one target the emitted code is for.

pub mod hooks;
#[cfg(all(windows, target_arch = "x86"))]
pub mod installer;
pub mod manifest;

pub use hooks::InstallError;
#[cfg(all(windows, target_arch = "x86"))]
pub use installer::Installer;
pub use manifest::{
    Address, HookKind, HookParameter, HookSpec, Manifest, ManifestError, ParameterSource,
    ParameterType, RegisterName, BUILD_ENV_VAR, MANIFEST_FILE_NAME,
};
