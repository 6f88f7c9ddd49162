//! Patch manifest data model
//!
//! A manifest is a TOML document sitting next to the engine DLL. It names an
//! optional build-identity token for the host binary and an ordered list of
//! patch groups, each carrying the hooks to install. Deserialisation and
//! per-hook validation live in `parse`; this module defines the typed model
//! the rest of the engine consumes.

mod parse;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// File name the engine looks for next to its own DLL.
pub const MANIFEST_FILE_NAME: &str = "hookforge.toml";

/// Environment variable that receives the manifest's `target_build` token
/// before any hook DLL gets a chance to run.
pub const BUILD_ENV_VAR: &str = "HOOKFORGE_TARGET_BUILD";

/// A 32-bit virtual address in the host process.
pub type Address = u32;

/// Manifest-level errors
///
/// Per-hook schema violations are not errors: they reject that hook with a
/// warning and parsing continues with the remainder.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Failed to read the manifest file
    #[error("failed to read manifest: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid TOML
    #[error("failed to parse manifest TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// Every declared hook was rejected, or none were declared
    #[error("manifest contains no usable patch entries")]
    Empty,
}

/// How a single hook rewrites the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Install a generated stub that saves CPU state, calls a hook function
    /// from an auxiliary DLL, restores state, replays the overwritten
    /// instructions and resumes.
    Detour,

    /// Overwrite the site in place with bytes of identical length. No stub,
    /// no DLL.
    SimpleReplace,

    /// Copy a caller-supplied assembly payload into an executable page,
    /// append a jump back past the overwritten instructions, and divert the
    /// site into the page.
    RawBlock,

    /// Only load an auxiliary DLL; no site is patched.
    ModuleOnly,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookKind::Detour => "detour",
            HookKind::SimpleReplace => "simple",
            HookKind::RawBlock => "replace",
            HookKind::ModuleOnly => "module-only",
        };
        f.write_str(name)
    }
}

/// One of the eight IA-32 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterName {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

impl RegisterName {
    /// The order POPAD restores registers in. The ESP slot is discarded, not
    /// loaded, which the selective-restore path reproduces.
    pub const POPAD_ORDER: [RegisterName; 8] = [
        RegisterName::Edi,
        RegisterName::Esi,
        RegisterName::Ebp,
        RegisterName::Esp,
        RegisterName::Ebx,
        RegisterName::Edx,
        RegisterName::Ecx,
        RegisterName::Eax,
    ];

    /// Slot index of this register inside the PUSHAD frame, counting up from
    /// the lowest address (EDI sits at the bottom, EAX at the top).
    pub(crate) fn pushad_slot(self) -> u32 {
        match self {
            RegisterName::Edi => 0,
            RegisterName::Esi => 1,
            RegisterName::Ebp => 2,
            RegisterName::Esp => 3,
            RegisterName::Ebx => 4,
            RegisterName::Edx => 5,
            RegisterName::Ecx => 6,
            RegisterName::Eax => 7,
        }
    }

    /// One-byte `POP r32` opcode.
    pub(crate) fn pop_opcode(self) -> u8 {
        match self {
            RegisterName::Eax => 0x58,
            RegisterName::Ecx => 0x59,
            RegisterName::Edx => 0x5A,
            RegisterName::Ebx => 0x5B,
            RegisterName::Esp => 0x5C,
            RegisterName::Ebp => 0x5D,
            RegisterName::Esi => 0x5E,
            RegisterName::Edi => 0x5F,
        }
    }
}

impl FromStr for RegisterName {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "eax" => Ok(RegisterName::Eax),
            "ebx" => Ok(RegisterName::Ebx),
            "ecx" => Ok(RegisterName::Ecx),
            "edx" => Ok(RegisterName::Edx),
            "esi" => Ok(RegisterName::Esi),
            "edi" => Ok(RegisterName::Edi),
            "ebp" => Ok(RegisterName::Ebp),
            "esp" => Ok(RegisterName::Esp),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RegisterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterName::Eax => "eax",
            RegisterName::Ebx => "ebx",
            RegisterName::Ecx => "ecx",
            RegisterName::Edx => "edx",
            RegisterName::Esi => "esi",
            RegisterName::Edi => "edi",
            RegisterName::Ebp => "ebp",
            RegisterName::Esp => "esp",
        };
        f.write_str(name)
    }
}

/// Where a marshalled hook parameter is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterSource {
    /// The value a GPR held when control was diverted, read from the
    /// wrapper's saved-state frame.
    Register(RegisterName),

    /// `[ESP + offset]` of the interrupted frame, where `offset` is the
    /// displacement from the host's ESP at the moment of diversion.
    StackOffset(i32),
}

impl ParameterSource {
    /// Parses the textual forms `"eax"`, `"esp+4"`, `"esp-8"`
    /// (case-insensitive). A bare `"esp"` is not a valid source: the stack
    /// pointer is only meaningful with an explicit displacement.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("esp") {
            if rest.starts_with('+') || rest.starts_with('-') {
                return rest.parse::<i32>().ok().map(ParameterSource::StackOffset);
            }
            return None;
        }
        match lower.parse::<RegisterName>() {
            Ok(reg) => Some(ParameterSource::Register(reg)),
            Err(()) => None,
        }
    }
}

/// Declared type of a hook parameter.
///
/// Informational for now: every parameter is marshalled as a 4-byte push
/// regardless of its declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    Int32,
    Uint32,
    Pointer,
    Float32,
    Byte,
    Short,
}

impl FromStr for ParameterType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "int" => Ok(ParameterType::Int32),
            "uint" => Ok(ParameterType::Uint32),
            "pointer" => Ok(ParameterType::Pointer),
            "float" => Ok(ParameterType::Float32),
            "byte" => Ok(ParameterType::Byte),
            "short" => Ok(ParameterType::Short),
            _ => Err(()),
        }
    }
}

/// One argument to marshal into the hook-function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookParameter {
    pub source: ParameterSource,
    pub ty: ParameterType,
}

/// The validated record for one hook, created at manifest parse and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct HookSpec {
    /// Group id, informational (shows up in logs).
    pub id: String,

    /// Address in host code to divert. Zero for [`HookKind::ModuleOnly`].
    pub site: Address,

    /// Expected bytes at `site`, verified before any mutation. For detours
    /// these are also the stolen instructions replayed by the wrapper.
    pub original: Vec<u8>,

    /// Replacement payload. In-place bytes for [`HookKind::SimpleReplace`],
    /// raw assembly for [`HookKind::RawBlock`], empty otherwise.
    pub replacement: Vec<u8>,

    /// Auxiliary DLL path, for kinds that load one.
    pub module_path: Option<String>,

    /// Exported symbol to resolve in the auxiliary DLL.
    pub symbol_name: Option<String>,

    pub kind: HookKind,

    /// Emit PUSHAD/POPAD around the hook call.
    pub preserve_regs: bool,

    /// Emit PUSHFD/POPFD around the hook call.
    pub preserve_flags: bool,

    /// Registers the hook may permanently mutate: their saved copies are
    /// discarded instead of popped back. Deduplicated, at most eight.
    pub exclude_from_restore: Vec<RegisterName>,

    /// Arguments to marshal, in declaration order.
    pub parameters: Vec<HookParameter>,

    /// Skip replaying the stolen instructions and resume directly at
    /// `site + original.len()`.
    pub skip_original: bool,
}

impl HookSpec {
    /// Address execution resumes at once the hook is done.
    pub fn resume_address(&self) -> Address {
        self.site.wrapping_add(self.original.len() as u32)
    }

    pub fn restores(&self, reg: RegisterName) -> bool {
        self.preserve_regs && !self.exclude_from_restore.contains(&reg)
    }
}

/// A parsed manifest: the build-identity token plus every hook that survived
/// validation, in declaration order.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub target_build: Option<String>,
    pub hooks: Vec<HookSpec>,
}

impl Manifest {
    /// Reads and parses the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parses a manifest document. Hooks that violate the schema are dropped
    /// with a warning; an empty result is an error.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<Self, ManifestError> {
        parse::parse_manifest(text)
    }
}
