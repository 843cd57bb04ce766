//! # Debug-Info Session
//!
//! A [`Session`] is the long-lived handle onto one traced process. It owns:
//!
//! - the live module list (executables and shared objects mapped executable),
//! - one debug-info handle per module, opened lazily on first use,
//! - the resolved-frame cache keyed by module and module-relative offset.
//!
//! ## Module Lifetime
//!
//! Shared libraries come and go during a long trace. A stale module list
//! silently misattributes samples, so [`Session::refresh`] re-reads the module
//! map and evicts every cache entry belonging to a module that disappeared.
//! The symbolizer triggers a refresh on its own when an address misses every
//! module, at most once per sampling batch (see [`Session::begin_batch`]).
//!
//! ## Ownership
//!
//! Resolved frames copy the module's path and range out of the session by
//! value, so they stay valid after the session is dropped. Dropping the
//! session releases every debug-info handle.
//!
//! Debug-info handles are reference counted per thread, so a session stays on
//! the thread that opened it. Trace from several threads by opening one
//! session per thread.

pub mod memory_maps;

use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;

use crate::domain::{AttachError, Pid};
use crate::symbolization::{DebugInfoLoader, ElfLoader, ResolvedFrame, SymbolCache};

pub use memory_maps::{modules_from_maps, parse_maps_line, MapsEntry, MemoryRange, ProcMaps};

/// A loaded executable or shared library
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Module {
    pub path: Arc<Path>,
    pub range: MemoryRange,
    /// Runtime address corresponding to file offset 0
    pub load_base: u64,
}

impl Module {
    /// Module-relative offset of a runtime address
    #[must_use]
    pub fn offset_of(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.load_base)
    }
}

/// Provides the current module list of a process
pub trait ModuleSource {
    /// Snapshot the executable modules, sorted by start address
    ///
    /// # Errors
    /// Returns an [`AttachError`] when the process is gone or unreadable
    fn modules(&self) -> Result<Vec<Module>, AttachError>;
}

/// Outcome of a [`Session::refresh`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub loaded: usize,
    pub unloaded: usize,
}

/// Live view of one traced process's modules and debug information
pub struct Session {
    pid: Pid,
    source: Box<dyn ModuleSource>,
    loader: Box<dyn DebugInfoLoader>,
    modules: Vec<Module>,
    symbols: SymbolCache,
    refreshed_this_batch: bool,
    refresh_count: u64,
    detached: Option<AttachError>,
}

impl Session {
    /// Attach to a running process through `/proc/<pid>/maps`
    ///
    /// # Errors
    /// Returns an [`AttachError`] if the process does not exist or its
    /// module map cannot be read
    pub fn open(pid: Pid) -> Result<Self, AttachError> {
        Self::with_sources(pid, Box::new(ProcMaps::new(pid)), Box::new(ElfLoader::new(pid)))
    }

    /// Attach with caller-provided module and debug-info sources
    ///
    /// # Errors
    /// Propagates the initial [`ModuleSource::modules`] failure
    pub fn with_sources(
        pid: Pid,
        source: Box<dyn ModuleSource>,
        loader: Box<dyn DebugInfoLoader>,
    ) -> Result<Self, AttachError> {
        let mut modules = source.modules()?;
        modules.sort_by_key(|module| module.range);
        info!("Attached to {pid}: {} executable modules", modules.len());

        Ok(Self {
            pid,
            source,
            loader,
            modules,
            symbols: SymbolCache::default(),
            refreshed_this_batch: false,
            refresh_count: 0,
            detached: None,
        })
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current module snapshot, sorted by start address
    #[must_use]
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Number of refreshes performed over the session's life
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count
    }

    /// Start a new sampling batch, re-arming refresh-on-miss
    pub fn begin_batch(&mut self) {
        self.refreshed_this_batch = false;
    }

    /// Whether the module list was already refreshed in this batch
    #[must_use]
    pub fn refreshed_this_batch(&self) -> bool {
        self.refreshed_this_batch
    }

    /// The error that detached this session, if a refresh failed
    #[must_use]
    pub fn detached(&self) -> Option<&AttachError> {
        self.detached.as_ref()
    }

    /// Fail with the detaching error, if any
    ///
    /// # Errors
    /// Returns the [`AttachError`] recorded by the failed refresh
    pub fn check_attached(&self) -> Result<(), AttachError> {
        match &self.detached {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Re-read the module map and evict caches of unloaded modules
    ///
    /// # Errors
    /// Returns an [`AttachError`] when the process can no longer be read. The
    /// session is then detached and stops refreshing.
    pub fn refresh(&mut self) -> Result<RefreshSummary, AttachError> {
        self.refreshed_this_batch = true;
        self.refresh_count += 1;

        let mut fresh = match self.source.modules() {
            Ok(modules) => modules,
            Err(err) => {
                warn!("Refreshing modules of {} failed: {err}", self.pid);
                self.detached = Some(err.clone());
                return Err(err);
            }
        };
        fresh.sort_by_key(|module| module.range);

        let mut summary = RefreshSummary::default();
        for old in &self.modules {
            if !fresh.contains(old) {
                debug!("Module unloaded: {} at 0x{:x}", old.path.display(), old.range.start);
                self.symbols.evict(old);
                summary.unloaded += 1;
            }
        }
        summary.loaded = fresh.iter().filter(|m| !self.modules.contains(m)).count();

        if summary.loaded > 0 || summary.unloaded > 0 {
            info!(
                "Module map of {} changed: {} loaded, {} unloaded",
                self.pid, summary.loaded, summary.unloaded
            );
        }

        self.modules = fresh;
        Ok(summary)
    }

    /// Find the module whose range contains `addr`
    ///
    /// A module's range spans all of its mappings, so a small library can be
    /// mapped into a hole of a larger one. The closest start wins; when it
    /// ends before `addr` the earlier modules are scanned for an enclosing one.
    #[must_use]
    pub fn find_module(&self, addr: u64) -> Option<&Module> {
        let idx = self.modules.partition_point(|m| m.range.start <= addr);
        let (candidate, earlier) = self.modules[..idx].split_last()?;
        if candidate.range.contains(addr) {
            return Some(candidate);
        }
        earlier.iter().rev().find(|m| m.range.contains(addr))
    }

    /// Frames for `addr` looked up at `lookup`, served from the cache when
    /// possible
    pub(crate) fn frames_at(
        &mut self,
        module: &Module,
        addr: u64,
        lookup: u64,
    ) -> Vec<ResolvedFrame> {
        self.symbols.frames(self.loader.as_ref(), module, addr, lookup)
    }

    /// Number of cached (module, offset) entries
    #[must_use]
    pub fn cached_frames(&self) -> usize {
        self.symbols.len()
    }
}
