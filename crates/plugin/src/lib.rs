//! hookforge loader - the DllMain lifecycle shell
//!
//! This crate is the cdylib the host process loads. Process attach drives
//! manifest discovery and patch installation; process detach releases the
//! engine's pages and module handles. Everything lives behind the one real
//! target: a 32-bit Windows host.

#[cfg(all(windows, target_arch = "x86"))]
mod entry;
