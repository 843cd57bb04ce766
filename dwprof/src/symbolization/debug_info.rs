//! Debug metadata backends
//!
//! [`DwarfSymbols`] owns everything parsed out of one ELF file: the
//! `addr2line` context over its DWARF sections and a sorted copy of its symbol
//! table. The file bytes are copied into reference-counted section buffers, so
//! nothing borrows from the file after construction and dropping the value
//! releases all of it.

use addr2line::Context;
use anyhow::{Context as _, Result};
use gimli::{EndianRcSlice, RunTimeEndian};
use log::{debug, warn};
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::symbolizer::demangle_symbol;
use crate::domain::Pid;
use crate::session::Module;

/// Symbol information for one address, as reported by a [`SymbolSource`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolFrame {
    pub function: Option<String>,
    pub offset: Option<u64>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

/// Debug metadata of one module
pub trait SymbolSource {
    /// Frames covering a module-relative offset, innermost first
    ///
    /// Returns an empty vector when nothing covers the offset.
    fn lookup(&self, offset: u64) -> Vec<SymbolFrame>;
}

/// Opens the debug metadata of a module
pub trait DebugInfoLoader {
    /// Returns `None` when the module has no usable metadata
    fn load(&self, module: &Module) -> Option<Box<dyn SymbolSource>>;
}

/// Loads ELF/DWARF metadata from the module's file on disk
///
/// Falls back to `/proc/<pid>/root/<path>` so modules of processes running in
/// another mount namespace (containers) still resolve.
#[derive(Debug, Clone, Copy)]
pub struct ElfLoader {
    pid: Pid,
}

impl ElfLoader {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    fn candidates(&self, path: &Path) -> [PathBuf; 2] {
        let relative = path.strip_prefix("/").unwrap_or(path);
        [path.to_path_buf(), PathBuf::from(format!("/proc/{}/root", self.pid.0)).join(relative)]
    }
}

impl DebugInfoLoader for ElfLoader {
    fn load(&self, module: &Module) -> Option<Box<dyn SymbolSource>> {
        for candidate in self.candidates(&module.path) {
            match DwarfSymbols::from_file(&candidate) {
                Ok(symbols) => {
                    debug!(
                        "Loaded debug info for {} (dwarf: {}, symbols: {})",
                        candidate.display(),
                        symbols.has_dwarf(),
                        symbols.symbol_count()
                    );
                    return Some(Box::new(symbols));
                }
                Err(e) => debug!("Cannot load {}: {e:#}", candidate.display()),
            }
        }

        warn!("No debug info for {}, frames will show raw addresses", module.path.display());
        None
    }
}

#[derive(Debug, Clone)]
struct ElfSymbol {
    address: u64,
    size: u64,
    name: String,
}

/// DWARF line/inline tables plus the ELF symbol table of one file
pub struct DwarfSymbols {
    ctx: Option<Context<EndianRcSlice<RunTimeEndian>>>,
    symbols: Vec<ElfSymbol>,
    /// Virtual address of file offset 0 in the ELF's own address space
    image_base: u64,
}

impl DwarfSymbols {
    /// Read and parse an ELF file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::parse(&data)
    }

    /// Parse an in-memory ELF image
    ///
    /// Missing DWARF is not an error: the symbol table alone still names
    /// functions.
    ///
    /// # Errors
    /// Returns an error if the bytes are not an object file or the DWARF
    /// sections are malformed
    pub fn parse(data: &[u8]) -> Result<Self> {
        let obj = object::File::parse(data).context("Failed to parse object file")?;

        let has_dwarf = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
        let ctx = if has_dwarf {
            let endian =
                if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

            let load_section =
                |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                    let data = obj
                        .section_by_name(id.name())
                        .and_then(|section| section.uncompressed_data().ok())
                        .unwrap_or(Cow::Borrowed(&[][..]));
                    Ok(EndianRcSlice::new(Rc::from(&*data), endian))
                };

            let dwarf = gimli::Dwarf::load(&load_section)?;
            Some(Context::from_dwarf(dwarf).context("Failed to load DWARF debug information")?)
        } else {
            None
        };

        let mut symbols = collect_text_symbols(obj.symbols());
        if symbols.is_empty() {
            symbols = collect_text_symbols(obj.dynamic_symbols());
        }
        symbols.sort_by_key(|s| s.address);
        symbols.dedup_by_key(|s| s.address);

        let image_base = obj
            .segments()
            .map(|segment| (segment.file_range().0, segment.address()))
            .min_by_key(|(file_offset, _)| *file_offset)
            .map_or(0, |(file_offset, address)| address.wrapping_sub(file_offset));

        Ok(Self { ctx, symbols, image_base })
    }

    #[must_use]
    pub fn has_dwarf(&self) -> bool {
        self.ctx.is_some()
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    fn symbol_at(&self, svma: u64) -> Option<&ElfSymbol> {
        let idx = self.symbols.partition_point(|s| s.address <= svma);
        let symbol = self.symbols.get(idx.checked_sub(1)?)?;
        (symbol.size == 0 || svma < symbol.address.saturating_add(symbol.size)).then_some(symbol)
    }
}

fn collect_text_symbols<'data, S: ObjectSymbol<'data>>(
    symbols: impl Iterator<Item = S>,
) -> Vec<ElfSymbol> {
    symbols
        .filter(|s| s.kind() == SymbolKind::Text && s.address() != 0)
        .filter_map(|s| {
            let name = s.name().ok()?;
            (!name.is_empty()).then(|| ElfSymbol {
                address: s.address(),
                size: s.size(),
                name: name.to_string(),
            })
        })
        .collect()
}

impl SymbolSource for DwarfSymbols {
    fn lookup(&self, offset: u64) -> Vec<SymbolFrame> {
        let svma = offset.wrapping_add(self.image_base);
        let mut frames = Vec::new();

        if let Some(ctx) = &self.ctx {
            if let Ok(mut frame_iter) = ctx.find_frames(svma).skip_all_loads() {
                while let Ok(Some(frame)) = frame_iter.next() {
                    let function =
                        frame.function.and_then(|f| f.demangle().ok().map(|s| s.to_string()));

                    let (file, line) = frame
                        .location
                        .map_or((None, None), |loc| (loc.file.map(str::to_string), loc.line));

                    frames.push(SymbolFrame { function, offset: None, file, line });
                }
            }
        }

        // The symbol table knows where the physical function starts, which
        // DWARF frames don't report; attach the offset to the outermost frame.
        if let Some(symbol) = self.symbol_at(svma) {
            let offset = svma - symbol.address;
            if let Some(outer) = frames.last_mut() {
                outer.offset = Some(offset);
                if outer.function.is_none() {
                    outer.function = Some(demangle_symbol(&symbol.name));
                }
            } else {
                frames.push(SymbolFrame {
                    function: Some(demangle_symbol(&symbol.name)),
                    offset: Some(offset),
                    file: None,
                    line: None,
                });
            }
        }

        frames
    }
}
