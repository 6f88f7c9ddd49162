//! Manifest-to-stub pipeline tests
//!
//! Drives manifest text through parsing and wrapper emission the way the
//! installer does, then checks the bytes that would land at the site and in
//! the executable pages.

use hookforge_core::hooks::emitter::{jmp_bytes, CodeEmitter};
use hookforge_core::hooks::verify::expected_matches;
use hookforge_core::hooks::wrapper::{
    detour_stub_capacity, emit_detour_stub, emit_raw_block, raw_block_capacity,
};
use hookforge_core::manifest::{HookKind, HookSpec, Manifest};

const STUB_BASE: u32 = 0x1100_0000;
const HOOK_FN: u32 = 0x1000_0000;

fn emit_detour(spec: &HookSpec) -> Vec<u8> {
    let mut buf = vec![0u8; detour_stub_capacity(spec)];
    let mut em = CodeEmitter::new(&mut buf, STUB_BASE);
    emit_detour_stub(&mut em, spec, HOOK_FN);
    let len = em.pos();
    buf.truncate(len);
    buf
}

/// The bytes the installer writes over the site: a JMP to the stub page and
/// NOP padding over whatever is left of the stolen bytes.
fn site_bytes(spec: &HookSpec, target: u32) -> Vec<u8> {
    let mut bytes = jmp_bytes(spec.site, target).to_vec();
    bytes.resize(spec.original.len().max(5), 0x90);
    bytes
}

fn decoded_jmp_target(bytes: &[u8], opcode_addr: u32) -> u32 {
    assert_eq!(bytes[0], 0xE9);
    let disp = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    opcode_addr.wrapping_add(5).wrapping_add(disp as u32)
}

const DOCUMENT: &str = r#"
target_build = "9c2f4a6d"

[[patches]]
id = "frame-detour"
dll = "patches/frame.dll"

[[patches.hooks]]
address = "0x402000"
function = "OnFrame"
original_bytes = [0x8B, 0xEC, 0x83, 0xEC, 0x10, 0x90]
parameters = [{ source = "eax", type = "int" }]

[[patches]]
id = "byte-flip"

[[patches.hooks]]
address = "0x401000"
type = "simple"
original_bytes = [0x75, 0x0A]
replacement_bytes = [0xEB, 0x0A]

[[patches]]
id = "raw-patch"

[[patches.hooks]]
address = "0x403000"
type = "replace"
original_bytes = [1, 2, 3, 4, 5, 6, 7, 8]
replacement_bytes = [0x40, 0x48, 0x90]

[[patches]]
id = "extender"
dll = "patches/extender.dll"
"#;

#[test]
fn manifest_round_trips_every_kind() {
    let manifest = Manifest::from_str(DOCUMENT).unwrap();
    assert_eq!(manifest.target_build.as_deref(), Some("9c2f4a6d"));

    let kinds: Vec<_> = manifest.hooks.iter().map(|h| h.kind).collect();
    assert_eq!(
        kinds,
        vec![
            HookKind::Detour,
            HookKind::SimpleReplace,
            HookKind::RawBlock,
            HookKind::ModuleOnly,
        ]
    );
}

#[test]
fn detour_site_gets_jmp_and_nop_padding() {
    let manifest = Manifest::from_str(DOCUMENT).unwrap();
    let detour = &manifest.hooks[0];

    let site = site_bytes(detour, STUB_BASE);
    assert_eq!(site.len(), 6);
    assert_eq!(decoded_jmp_target(&site, detour.site), STUB_BASE);
    assert_eq!(site[5], 0x90);
}

#[test]
fn detour_stub_calls_hook_and_replays_original() {
    let manifest = Manifest::from_str(DOCUMENT).unwrap();
    let detour = &manifest.hooks[0];
    let stub = emit_detour(detour);

    // Prologue, anchor, then the register parameter load from the EAX slot.
    assert_eq!(&stub[..4], &[0x60, 0x9C, 0x89, 0xE3]);
    assert_eq!(&stub[4..8], &[0x8B, 0x4B, 0x20, 0x51]);
    assert_eq!(stub[8], 0xE8);

    // The stolen instructions replay right before the return jump.
    let replay_at = stub.len() - 5 - detour.original.len();
    assert_eq!(&stub[replay_at..stub.len() - 5], &detour.original[..]);
    let jmp_addr = STUB_BASE + (stub.len() as u32 - 5);
    assert_eq!(
        decoded_jmp_target(&stub[stub.len() - 5..], jmp_addr),
        detour.resume_address()
    );
}

#[test]
fn simple_replace_swaps_equal_length_bytes() {
    let manifest = Manifest::from_str(DOCUMENT).unwrap();
    let simple = &manifest.hooks[1];

    // The installer writes exactly the replacement window, nothing more.
    assert_eq!(simple.replacement.len(), simple.original.len());
    assert_eq!(simple.replacement, vec![0xEB, 0x0A]);
}

#[test]
fn raw_block_page_ends_with_return_jump() {
    let manifest = Manifest::from_str(DOCUMENT).unwrap();
    let raw = &manifest.hooks[2];

    let mut page = vec![0u8; raw_block_capacity(raw.replacement.len())];
    let mut em = CodeEmitter::new(&mut page, STUB_BASE);
    emit_raw_block(&mut em, &raw.replacement, raw.resume_address());
    assert_eq!(em.pos(), page.len());

    assert_eq!(&page[..3], &raw.replacement[..]);
    assert_eq!(
        decoded_jmp_target(&page[3..], STUB_BASE + 3),
        raw.site + raw.original.len() as u32
    );

    // The site keeps a 5-byte JMP plus three NOPs over the 8 stolen bytes.
    let site = site_bytes(raw, STUB_BASE);
    assert_eq!(&site[5..], &[0x90, 0x90, 0x90]);
}

#[test]
fn verification_rejects_mismatched_build() {
    let manifest = Manifest::from_str(DOCUMENT).unwrap();
    let simple = &manifest.hooks[1];

    // What a different host build would present at the site.
    let wrong_build = [0x74, 0x0A];
    assert!(!expected_matches(&wrong_build, &simple.original));
    assert!(expected_matches(&[0x75, 0x0A, 0xCC], &simple.original));
}
