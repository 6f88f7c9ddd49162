//! TOML deserialisation and per-hook validation
//!
//! The raw serde model below mirrors the document shape loosely (every field
//! optional) so a hook that is missing a required field rejects that hook,
//! not the whole document. Scalars that accept two spellings (addresses and
//! bytes as integers or hex strings) are untagged enums.

use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    HookKind, HookParameter, HookSpec, Manifest, ManifestError, ParameterSource, ParameterType,
    RegisterName,
};

#[derive(Debug, Deserialize)]
struct RawManifest {
    target_build: Option<String>,
    #[serde(default)]
    patches: Vec<RawGroup>,
}

#[derive(Debug, Deserialize)]
struct RawGroup {
    id: Option<String>,
    dll: Option<String>,
    #[serde(default)]
    hooks: Vec<RawHook>,
}

#[derive(Debug, Deserialize)]
struct RawHook {
    address: Option<RawScalar>,
    #[serde(rename = "type")]
    kind: Option<String>,
    function: Option<String>,
    original_bytes: Option<Vec<RawScalar>>,
    replacement_bytes: Option<Vec<RawScalar>>,
    preserve_registers: Option<bool>,
    preserve_flags: Option<bool>,
    #[serde(default)]
    exclude_from_restore: Vec<String>,
    skip_original: Option<bool>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    source: String,
    #[serde(rename = "type")]
    ty: String,
}

/// An integer, or a hex string with or without a `0x` prefix.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(i64),
    Text(String),
}

impl RawScalar {
    fn as_address(&self) -> Option<u32> {
        match self {
            RawScalar::Int(v) => u32::try_from(*v).ok(),
            RawScalar::Text(s) => parse_hex(s),
        }
    }

    fn as_byte(&self) -> Option<u8> {
        match self {
            RawScalar::Int(v) => u8::try_from(*v).ok(),
            RawScalar::Text(s) => parse_hex(s).and_then(|v| u8::try_from(v).ok()),
        }
    }
}

fn parse_hex(s: &str) -> Option<u32> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).ok()
}

fn parse_bytes(raw: &[RawScalar]) -> Option<Vec<u8>> {
    raw.iter().map(RawScalar::as_byte).collect()
}

pub(super) fn parse_manifest(text: &str) -> Result<Manifest, ManifestError> {
    let raw: RawManifest = toml::from_str(text)?;

    let mut hooks = Vec::new();
    for group in raw.patches {
        let id = group.id.unwrap_or_default();

        if group.hooks.is_empty() {
            // A group with a DLL and no hooks is a module-only install.
            match group.dll {
                Some(dll) => {
                    debug!("patch '{}' has no hooks, loading DLL only", id);
                    hooks.push(HookSpec {
                        id,
                        site: 0,
                        original: Vec::new(),
                        replacement: Vec::new(),
                        module_path: Some(dll),
                        symbol_name: None,
                        kind: HookKind::ModuleOnly,
                        preserve_regs: true,
                        preserve_flags: true,
                        exclude_from_restore: Vec::new(),
                        parameters: Vec::new(),
                        skip_original: false,
                    });
                }
                None => warn!("patch '{}' has no hooks and no dll, skipping", id),
            }
            continue;
        }

        for hook in group.hooks {
            if let Some(spec) = validate_hook(&id, group.dll.as_deref(), hook) {
                hooks.push(spec);
            }
        }
    }

    if hooks.is_empty() {
        return Err(ManifestError::Empty);
    }

    debug!("manifest yielded {} patch entries", hooks.len());
    Ok(Manifest {
        target_build: raw.target_build,
        hooks,
    })
}

/// Checks one hook table against the rules for its kind. Returns `None` (and
/// warns) on any violation so the remaining hooks still parse.
fn validate_hook(group: &str, dll: Option<&str>, raw: RawHook) -> Option<HookSpec> {
    let site = match raw.address.as_ref().and_then(RawScalar::as_address) {
        Some(addr) => addr,
        None => {
            warn!("patch '{}': hook has a missing or invalid address", group);
            return None;
        }
    };

    let kind = match raw.kind.as_deref() {
        None => HookKind::Detour,
        Some(s) if s.eq_ignore_ascii_case("detour") => HookKind::Detour,
        Some(s) if s.eq_ignore_ascii_case("simple") => HookKind::SimpleReplace,
        Some(s) if s.eq_ignore_ascii_case("replace") => HookKind::RawBlock,
        Some(other) => {
            warn!(
                "patch '{}' @ {:#010x}: unknown hook type '{}', defaulting to detour",
                group, site, other
            );
            HookKind::Detour
        }
    };

    let original = match raw.original_bytes.as_deref().map(parse_bytes) {
        Some(Some(bytes)) if !bytes.is_empty() => bytes,
        Some(Some(_)) => {
            warn!("patch '{}' @ {:#010x}: original_bytes is empty", group, site);
            return None;
        }
        Some(None) => {
            warn!(
                "patch '{}' @ {:#010x}: original_bytes has a value outside 0-255",
                group, site
            );
            return None;
        }
        None => {
            warn!("patch '{}' @ {:#010x}: missing original_bytes", group, site);
            return None;
        }
    };

    // Anything that installs a 5-byte JMP needs at least 5 bytes to overwrite.
    if matches!(kind, HookKind::Detour | HookKind::RawBlock) && original.len() < 5 {
        warn!(
            "patch '{}' @ {:#010x}: {} hook needs at least 5 original bytes, got {}",
            group,
            site,
            kind,
            original.len()
        );
        return None;
    }

    let replacement = match kind {
        HookKind::SimpleReplace | HookKind::RawBlock => {
            let bytes = match raw.replacement_bytes.as_deref().map(parse_bytes) {
                Some(Some(bytes)) => bytes,
                Some(None) => {
                    warn!(
                        "patch '{}' @ {:#010x}: replacement_bytes has a value outside 0-255",
                        group, site
                    );
                    return None;
                }
                None => {
                    warn!(
                        "patch '{}' @ {:#010x}: {} hook missing replacement_bytes",
                        group, site, kind
                    );
                    return None;
                }
            };
            if kind == HookKind::SimpleReplace && bytes.len() != original.len() {
                warn!(
                    "patch '{}' @ {:#010x}: replacement_bytes length {} != original_bytes length {}",
                    group,
                    site,
                    bytes.len(),
                    original.len()
                );
                return None;
            }
            if bytes.is_empty() {
                warn!(
                    "patch '{}' @ {:#010x}: replacement_bytes is empty",
                    group, site
                );
                return None;
            }
            bytes
        }
        HookKind::Detour | HookKind::ModuleOnly => Vec::new(),
    };

    let (module_path, symbol_name) = match kind {
        HookKind::Detour => {
            let dll = match dll {
                Some(path) => path.to_owned(),
                None => {
                    warn!(
                        "patch '{}' @ {:#010x}: detour hook requires a 'dll' field on the patch",
                        group, site
                    );
                    return None;
                }
            };
            let function = match raw.function {
                Some(name) => name,
                None => {
                    warn!(
                        "patch '{}' @ {:#010x}: detour hook missing 'function'",
                        group, site
                    );
                    return None;
                }
            };
            (Some(dll), Some(function))
        }
        _ => (None, None),
    };

    let preserve_regs = raw.preserve_registers.unwrap_or(true);
    let preserve_flags = raw.preserve_flags.unwrap_or(true);

    let mut exclude_from_restore = Vec::new();
    for name in &raw.exclude_from_restore {
        match name.parse::<RegisterName>() {
            Ok(reg) => {
                if !exclude_from_restore.contains(&reg) {
                    exclude_from_restore.push(reg);
                }
            }
            Err(()) => {
                warn!(
                    "patch '{}' @ {:#010x}: unknown register '{}' in exclude_from_restore",
                    group, site, name
                );
                return None;
            }
        }
    }

    let mut parameters = Vec::new();
    for param in &raw.parameters {
        let source = match ParameterSource::parse(&param.source) {
            Some(source) => source,
            None => {
                warn!(
                    "patch '{}' @ {:#010x}: unrecognised parameter source '{}'",
                    group, site, param.source
                );
                return None;
            }
        };
        let ty = match param.ty.parse::<ParameterType>() {
            Ok(ty) => ty,
            Err(()) => {
                warn!(
                    "patch '{}' @ {:#010x}: unrecognised parameter type '{}'",
                    group, site, param.ty
                );
                return None;
            }
        };
        // A register parameter reads the saved-state frame, which only
        // exists when registers are preserved.
        if matches!(source, ParameterSource::Register(_)) && !preserve_regs {
            warn!(
                "patch '{}' @ {:#010x}: register parameter '{}' requires preserve_registers",
                group, site, param.source
            );
            return None;
        }
        parameters.push(HookParameter { source, ty });
    }

    Some(HookSpec {
        id: group.to_owned(),
        site,
        original,
        replacement,
        module_path,
        symbol_name,
        kind,
        preserve_regs,
        preserve_flags,
        exclude_from_restore,
        parameters,
        skip_original: raw.skip_original.unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Manifest {
        Manifest::from_str(text).expect("manifest should parse")
    }

    #[test]
    fn test_full_document() {
        let manifest = parse(
            r#"
            target_build = "3f9a1c"

            [[patches]]
            id = "speed-fix"
            dll = "patches/speed.dll"

            [[patches.hooks]]
            address = "0x402000"
            type = "detour"
            function = "OnUpdate"
            original_bytes = [0x8B, 0xEC, 0x83, 0xEC, 0x10, 0x90]
            parameters = [
                { source = "eax", type = "int" },
                { source = "esp+4", type = "pointer" },
            ]

            [[patches]]
            id = "byte-flip"

            [[patches.hooks]]
            address = 0x401000
            type = "simple"
            original_bytes = [0x75, 0x0A]
            replacement_bytes = [0xEB, 0x0A]
            "#,
        );

        assert_eq!(manifest.target_build.as_deref(), Some("3f9a1c"));
        assert_eq!(manifest.hooks.len(), 2);

        let detour = &manifest.hooks[0];
        assert_eq!(detour.kind, HookKind::Detour);
        assert_eq!(detour.site, 0x0040_2000);
        assert_eq!(detour.original.len(), 6);
        assert_eq!(detour.module_path.as_deref(), Some("patches/speed.dll"));
        assert_eq!(detour.symbol_name.as_deref(), Some("OnUpdate"));
        assert_eq!(detour.parameters.len(), 2);
        assert_eq!(
            detour.parameters[0].source,
            ParameterSource::Register(RegisterName::Eax)
        );
        assert_eq!(detour.parameters[1].source, ParameterSource::StackOffset(4));
        assert!(detour.preserve_regs);
        assert!(detour.preserve_flags);
        assert!(!detour.skip_original);

        let simple = &manifest.hooks[1];
        assert_eq!(simple.kind, HookKind::SimpleReplace);
        assert_eq!(simple.site, 0x0040_1000);
        assert_eq!(simple.replacement, vec![0xEB, 0x0A]);
    }

    #[test]
    fn test_address_and_byte_spellings() {
        let manifest = parse(
            r#"
            [[patches]]
            [[patches.hooks]]
            address = "401000"
            type = "simple"
            original_bytes = ["0x75", 10]
            replacement_bytes = [0xEB, "0x0A"]
            "#,
        );
        let hook = &manifest.hooks[0];
        assert_eq!(hook.site, 0x0040_1000);
        assert_eq!(hook.original, vec![0x75, 0x0A]);
        assert_eq!(hook.replacement, vec![0xEB, 0x0A]);
    }

    #[test]
    fn test_module_only_group() {
        let manifest = parse(
            r#"
            [[patches]]
            id = "extender"
            dll = "patches/extender.dll"
            "#,
        );
        assert_eq!(manifest.hooks.len(), 1);
        assert_eq!(manifest.hooks[0].kind, HookKind::ModuleOnly);
        assert_eq!(
            manifest.hooks[0].module_path.as_deref(),
            Some("patches/extender.dll")
        );
    }

    #[test]
    fn test_raw_block_hook() {
        let manifest = parse(
            r#"
            [[patches]]
            [[patches.hooks]]
            address = "0x403000"
            type = "replace"
            original_bytes = [1, 2, 3, 4, 5, 6, 7, 8]
            replacement_bytes = [0x40, 0x40, 0x40]
            "#,
        );
        let hook = &manifest.hooks[0];
        assert_eq!(hook.kind, HookKind::RawBlock);
        assert_eq!(hook.replacement.len(), 3);
        assert_eq!(hook.resume_address(), 0x0040_3008);
    }

    #[test]
    fn test_unknown_kind_downgrades_to_detour() {
        let manifest = parse(
            r#"
            [[patches]]
            dll = "p.dll"
            [[patches.hooks]]
            address = "0x402000"
            type = "trampoline"
            function = "Hook"
            original_bytes = [1, 2, 3, 4, 5]
            "#,
        );
        assert_eq!(manifest.hooks[0].kind, HookKind::Detour);
    }

    #[test]
    fn test_bad_hooks_are_skipped_not_fatal() {
        // First hook: replacement length mismatch. Second: too few original
        // bytes for a JMP. Third is fine.
        let manifest = parse(
            r#"
            [[patches]]
            dll = "p.dll"
            [[patches.hooks]]
            address = "0x401000"
            type = "simple"
            original_bytes = [0x75, 0x0A]
            replacement_bytes = [0xEB]

            [[patches.hooks]]
            address = "0x402000"
            function = "Hook"
            original_bytes = [0x90, 0x90]

            [[patches.hooks]]
            address = "0x403000"
            function = "Hook"
            original_bytes = [1, 2, 3, 4, 5]
            "#,
        );
        assert_eq!(manifest.hooks.len(), 1);
        assert_eq!(manifest.hooks[0].site, 0x0040_3000);
    }

    #[test]
    fn test_detour_requires_dll_and_function() {
        let err = Manifest::from_str(
            r#"
            [[patches]]
            [[patches.hooks]]
            address = "0x402000"
            function = "Hook"
            original_bytes = [1, 2, 3, 4, 5]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Empty));

        let err = Manifest::from_str(
            r#"
            [[patches]]
            dll = "p.dll"
            [[patches.hooks]]
            address = "0x402000"
            original_bytes = [1, 2, 3, 4, 5]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Empty));
    }

    #[test]
    fn test_bad_parameters_reject_hook() {
        for (source, ty) in [("xmm0", "int"), ("eax", "vector"), ("esp", "int")] {
            let text = format!(
                r#"
                [[patches]]
                dll = "p.dll"
                [[patches.hooks]]
                address = "0x402000"
                function = "Hook"
                original_bytes = [1, 2, 3, 4, 5]
                parameters = [{{ source = "{source}", type = "{ty}" }}]
                "#
            );
            let err = Manifest::from_str(&text).unwrap_err();
            assert!(matches!(err, ManifestError::Empty), "{source}/{ty}");
        }
    }

    #[test]
    fn test_register_parameter_requires_preserved_registers() {
        let err = Manifest::from_str(
            r#"
            [[patches]]
            dll = "p.dll"
            [[patches.hooks]]
            address = "0x402000"
            function = "Hook"
            original_bytes = [1, 2, 3, 4, 5]
            preserve_registers = false
            parameters = [{ source = "eax", type = "int" }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Empty));
    }

    #[test]
    fn test_exclude_list_parses_and_dedups() {
        let manifest = parse(
            r#"
            [[patches]]
            dll = "p.dll"
            [[patches.hooks]]
            address = "0x402000"
            function = "Hook"
            original_bytes = [1, 2, 3, 4, 5]
            exclude_from_restore = ["EAX", "edx", "eax"]
            "#,
        );
        assert_eq!(
            manifest.hooks[0].exclude_from_restore,
            vec![RegisterName::Eax, RegisterName::Edx]
        );
        assert!(!manifest.hooks[0].restores(RegisterName::Eax));
        assert!(manifest.hooks[0].restores(RegisterName::Ecx));
    }

    #[test]
    fn test_unknown_exclude_register_rejects_hook() {
        let err = Manifest::from_str(
            r#"
            [[patches]]
            dll = "p.dll"
            [[patches.hooks]]
            address = "0x402000"
            function = "Hook"
            original_bytes = [1, 2, 3, 4, 5]
            exclude_from_restore = ["r8d"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Empty));
    }

    #[test]
    fn test_empty_manifest_is_an_error() {
        assert!(matches!(
            Manifest::from_str("").unwrap_err(),
            ManifestError::Empty
        ));
        assert!(matches!(
            Manifest::from_str("target_build = \"abc\"").unwrap_err(),
            ManifestError::Empty
        ));
    }

    #[test]
    fn test_parameter_source_forms() {
        assert_eq!(
            ParameterSource::parse("EDX"),
            Some(ParameterSource::Register(RegisterName::Edx))
        );
        assert_eq!(
            ParameterSource::parse("esp+16"),
            Some(ParameterSource::StackOffset(16))
        );
        assert_eq!(
            ParameterSource::parse("esp-8"),
            Some(ParameterSource::StackOffset(-8))
        );
        assert_eq!(ParameterSource::parse("esp"), None);
        assert_eq!(ParameterSource::parse("esp+"), None);
        assert_eq!(ParameterSource::parse("rip"), None);
    }

    #[test]
    fn test_byte_out_of_range_rejects_hook() {
        let err = Manifest::from_str(
            r#"
            [[patches]]
            [[patches.hooks]]
            address = "0x401000"
            type = "simple"
            original_bytes = [300, 1]
            replacement_bytes = [0, 1]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Empty));
    }
}
