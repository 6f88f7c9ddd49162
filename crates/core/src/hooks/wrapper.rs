//! Runtime wrapper-stub generation
//!
//! A detour wrapper is the machine-code bridge between a patched site and a
//! hook function: save CPU state, marshal the declared parameters out of the
//! saved frame, call the hook, restore state, replay the stolen instructions
//! and jump back. Emission is pure byte generation over [`CodeEmitter`] so
//! the layout is testable anywhere; executable pages are owned by
//! [`WrapperArena`] on the real target.
//!
//! Stub layout for a full save/restore detour:
//!
//! ```text
//!   PUSHAD                      ; preserve_regs
//!   PUSHFD                      ; preserve_flags
//!   MOV  EBX, ESP               ; anchor the saved-state frame
//!   MOV  ECX, [EBX+32]          ; per parameter, reverse order
//!   PUSH ECX
//!   CALL hook                   ; E8 rel32
//!   ADD  ESP, 4*n               ; caller cleanup
//!   MOV  ESP, EBX               ; undo pushes even if the hook moved ESP
//!   POPFD
//!   POPAD                       ; or selective pops
//!   <original bytes>            ; unless skip_original
//!   JMP  site + len(original)   ; E9 rel32
//! ```

use crate::manifest::{Address, HookSpec, ParameterSource, RegisterName};

use super::emitter::CodeEmitter;

/// Conservative capacity for a detour stub's page: fixed overhead, ten bytes
/// per selectively-restored register, and room to replay the stolen bytes.
pub fn detour_stub_capacity(spec: &HookSpec) -> usize {
    128 + 10 * spec.exclude_from_restore.len() + 2 * spec.original.len()
}

/// Capacity for a raw code block: the payload plus its return jump.
pub fn raw_block_capacity(payload_len: usize) -> usize {
    payload_len + 5
}

/// Bytes the prologue pushed in front of the interrupted frame.
fn saved_state_size(spec: &HookSpec) -> i32 {
    let mut size = 0;
    if spec.preserve_regs {
        size += 32;
    }
    if spec.preserve_flags {
        size += 4;
    }
    size
}

/// Displacement of a saved register slot from EBX. EFLAGS sits at the bottom
/// of the frame when preserved, shifting every PUSHAD slot up by four.
fn saved_slot_offset(spec: &HookSpec, reg: RegisterName) -> u8 {
    let base = if spec.preserve_flags { 4 } else { 0 };
    (base + 4 * reg.pushad_slot()) as u8
}

/// Emits the full detour wrapper for `spec`, calling `hook_fn`.
pub fn emit_detour_stub(em: &mut CodeEmitter<'_>, spec: &HookSpec, hook_fn: Address) {
    if spec.preserve_regs {
        em.byte(0x60); // PUSHAD
    }
    if spec.preserve_flags {
        em.byte(0x9C); // PUSHFD
    }

    // EBX anchors the saved-state frame for the rest of the stub. ESP itself
    // stays put: lowering it here would have the parameter pushes land on
    // top of the saved registers.
    em.bytes(&[0x89, 0xE3]); // MOV EBX, ESP

    // Push parameters in reverse declaration order, so the hook (cdecl,
    // right-to-left) reads them in the order the manifest wrote them. ECX is
    // caller-saved and free as scratch.
    let mut pushed: i32 = 0;
    for param in spec.parameters.iter().rev() {
        match param.source {
            ParameterSource::Register(reg) => {
                em.bytes(&[0x8B, 0x4B, saved_slot_offset(spec, reg)]); // MOV ECX, [EBX+disp8]
            }
            ParameterSource::StackOffset(user) => {
                // Each push already made shifts the live ESP another four
                // bytes away from the interrupted frame.
                let disp = saved_state_size(spec) + user + 4 * pushed;
                emit_load_ecx_from_esp(em, disp);
            }
        }
        em.byte(0x51); // PUSH ECX
        pushed += 1;
    }

    em.call_rel32(hook_fn);

    let param_bytes = 4 * spec.parameters.len() as i32;
    if param_bytes > 0 {
        emit_add_esp(em, param_bytes);
    }

    // Undo the parameter pushes even if the hook clobbered ESP.
    em.bytes(&[0x89, 0xDC]); // MOV ESP, EBX

    if spec.preserve_flags {
        em.byte(0x9D); // POPFD
    }
    if spec.preserve_regs {
        if spec.exclude_from_restore.is_empty() {
            em.byte(0x61); // POPAD
        } else {
            // Expand POPAD so excluded registers keep the hook's value.
            // The ESP slot is discarded either way, as POPAD itself does.
            for reg in RegisterName::POPAD_ORDER {
                if reg == RegisterName::Esp || !spec.restores(reg) {
                    em.bytes(&[0x83, 0xC4, 0x04]); // ADD ESP, 4
                } else {
                    em.byte(reg.pop_opcode());
                }
            }
        }
    }

    // Replay the instructions the site JMP overwrote, then rejoin the host.
    // The manifest guarantees they end on an instruction boundary.
    if !spec.skip_original {
        em.bytes(&spec.original);
    }
    em.jmp_rel32(spec.resume_address());
}

/// Emits a raw code block: the caller-supplied payload followed by the jump
/// back past the overwritten site bytes.
pub fn emit_raw_block(em: &mut CodeEmitter<'_>, payload: &[u8], resume: Address) {
    em.bytes(payload);
    em.jmp_rel32(resume);
}

fn emit_load_ecx_from_esp(em: &mut CodeEmitter<'_>, disp: i32) {
    if disp == 0 {
        em.bytes(&[0x8B, 0x0C, 0x24]); // MOV ECX, [ESP]
    } else if (-128..=127).contains(&disp) {
        em.bytes(&[0x8B, 0x4C, 0x24, disp as u8]); // MOV ECX, [ESP+disp8]
    } else {
        em.bytes(&[0x8B, 0x8C, 0x24]); // MOV ECX, [ESP+disp32]
        em.dword(disp as u32);
    }
}

fn emit_add_esp(em: &mut CodeEmitter<'_>, bytes: i32) {
    if bytes <= 127 {
        em.bytes(&[0x83, 0xC4, bytes as u8]); // ADD ESP, imm8
    } else {
        em.bytes(&[0x81, 0xC4]); // ADD ESP, imm32
        em.dword(bytes as u32);
    }
}

#[cfg(all(windows, target_arch = "x86"))]
mod arena {
    use tracing::debug;

    use crate::manifest::{Address, HookSpec};

    use super::super::emitter::CodeEmitter;
    use super::super::{memory, InstallError};
    use super::{detour_stub_capacity, emit_detour_stub, emit_raw_block, raw_block_capacity};

    struct ExecPage {
        ptr: *mut u8,
        #[allow(dead_code)]
        capacity: usize,
        #[allow(dead_code)]
        used: usize,
    }

    /// Owns every executable page the engine emits into. Pages are freed in
    /// reverse allocation order at teardown and never while hooks are live.
    pub struct WrapperArena {
        pages: Vec<ExecPage>,
    }

    // SAFETY: the arena holds raw pointers only to pages it allocated and
    // owns exclusively; install and teardown both run on the loader thread.
    unsafe impl Send for WrapperArena {}

    impl WrapperArena {
        pub fn new() -> Self {
            Self { pages: Vec::new() }
        }

        /// Emits the detour wrapper for `spec` into a fresh executable page
        /// and returns its entry address.
        pub fn generate_detour(
            &mut self,
            spec: &HookSpec,
            hook_fn: Address,
        ) -> Result<Address, InstallError> {
            let capacity = detour_stub_capacity(spec);
            self.emit_page(capacity, |em| emit_detour_stub(em, spec, hook_fn))
        }

        /// Copies the raw payload into a fresh executable page, appending
        /// the jump back to `spec.resume_address()`.
        pub fn generate_raw_block(&mut self, spec: &HookSpec) -> Result<Address, InstallError> {
            let capacity = raw_block_capacity(spec.replacement.len());
            self.emit_page(capacity, |em| {
                emit_raw_block(em, &spec.replacement, spec.resume_address())
            })
        }

        fn emit_page(
            &mut self,
            capacity: usize,
            emit: impl FnOnce(&mut CodeEmitter<'_>),
        ) -> Result<Address, InstallError> {
            let ptr = memory::alloc_executable(capacity)
                .ok_or(InstallError::Alloc { size: capacity })?;
            let base = ptr as usize as Address;

            // SAFETY: a freshly committed RWX region of `capacity` bytes,
            // not yet reachable by anything else.
            let buf = unsafe { std::slice::from_raw_parts_mut(ptr, capacity) };
            let mut em = CodeEmitter::new(buf, base);
            emit(&mut em);
            let used = em.pos();

            memory::flush_icache(ptr, used);
            self.pages.push(ExecPage {
                ptr,
                capacity,
                used,
            });
            debug!("emitted {} byte stub at {:#010x}", used, base);
            Ok(base)
        }

        /// Frees every page, most recent first.
        pub fn release_all(&mut self) {
            while let Some(page) = self.pages.pop() {
                // SAFETY: allocated by `alloc_executable`, freed exactly once.
                unsafe { memory::free_executable(page.ptr) };
            }
        }

        pub fn page_count(&self) -> usize {
            self.pages.len()
        }
    }
}

#[cfg(all(windows, target_arch = "x86"))]
pub use arena::WrapperArena;
