//! # Symbol Resolution
//!
//! Converts sampled instruction pointers into [`ResolvedFrame`]s: function
//! name, offset into the function, source file and line.
//!
//! ## Address Translation
//!
//! Executables and shared objects are position independent, so the runtime
//! address is first rebased onto the module:
//!
//! ```text
//! offset = runtime address - module load base
//! ```
//!
//! The offset is then moved into the ELF's own address space (adding the
//! virtual address of its first loadable segment, zero for PIE objects) and
//! looked up in the DWARF tables with `addr2line`, with the ELF symbol table as
//! a fallback when no DWARF exists.
//!
//! ## Inlining
//!
//! One instruction can belong to several logical functions at once. DWARF
//! records the inline tree, and [`resolve`] expands it into one frame per
//! inlined call site, innermost first, the physical function last.
//!
//! ## Return Addresses
//!
//! Every callchain entry after the first is a return address, which points
//! one past the call. [`resolve_chain`] looks those up at `address - 1` so
//! the caller frame names the call site and its inline tree.
//!
//! ## Caching
//!
//! Results are cached per (module, offset) inside the
//! [`Session`](crate::session::Session) and dropped when the module unloads.
//!
//! **Libraries used**:
//! - `object`: ELF parsing, symbol tables, segment layout
//! - `gimli`: DWARF section loading
//! - `addr2line`: line tables and inline frame expansion
//! - `rustc-demangle`: Rust symbol demangling (C++ goes through `addr2line`)

mod cache;
pub mod debug_info;
pub mod frame;
pub mod symbolizer;

pub(crate) use cache::SymbolCache;
pub use debug_info::{DebugInfoLoader, DwarfSymbols, ElfLoader, SymbolFrame, SymbolSource};
pub use frame::ResolvedFrame;
pub use symbolizer::{demangle_symbol, resolve, resolve_chain, resolve_return_address};
