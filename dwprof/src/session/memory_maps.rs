//! Memory mapping utilities for process address space analysis
//!
//! Parses `/proc/<pid>/maps` into the module list a [`Session`](super::Session)
//! resolves addresses against. Every file-backed path with at least one
//! executable mapping becomes one [`Module`]; its range spans all mappings of
//! that path so PIE executables and shared objects are covered end to end.

use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{Module, ModuleSource};
use crate::domain::{AttachError, Pid};

/// Memory range of a loaded module in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One parsed line of `/proc/<pid>/maps`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub range: MemoryRange,
    pub executable: bool,
    pub offset: u64,
    pub path: Option<PathBuf>,
}

/// Parse a single maps line: `start-end perms offset dev inode [pathname]`
///
/// Returns `None` for lines that don't follow the format. Pseudo paths such as
/// `[vdso]` or `[stack]` are reported without a path.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<MapsEntry> {
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let pathname = fields.next().unwrap_or("").trim_start();

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    let path = if pathname.is_empty() || pathname.starts_with('[') {
        None
    } else {
        let pathname = pathname.strip_suffix(" (deleted)").unwrap_or(pathname);
        Some(PathBuf::from(pathname))
    };

    Some(MapsEntry {
        range: MemoryRange { start, end },
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        offset,
        path,
    })
}

/// Build the module list from the contents of a maps file
///
/// Mappings are grouped by path. A group becomes a module only if one of its
/// mappings is executable. The load base is the start of the lowest mapping
/// minus its file offset. The result is sorted by start address.
#[must_use]
pub fn modules_from_maps(maps: &str) -> Vec<Module> {
    struct Group {
        range: MemoryRange,
        lowest_offset: u64,
        executable: bool,
    }

    let mut groups: BTreeMap<PathBuf, Group> = BTreeMap::new();

    for entry in maps.lines().filter_map(parse_maps_line) {
        let Some(path) = entry.path else {
            continue;
        };

        groups
            .entry(path)
            .and_modify(|group| {
                if entry.range.start < group.range.start {
                    group.range.start = entry.range.start;
                    group.lowest_offset = entry.offset;
                }
                group.range.end = group.range.end.max(entry.range.end);
                group.executable |= entry.executable;
            })
            .or_insert(Group {
                range: entry.range,
                lowest_offset: entry.offset,
                executable: entry.executable,
            });
    }

    let mut modules: Vec<Module> = groups
        .into_iter()
        .filter(|(_, group)| group.executable)
        .map(|(path, group)| Module {
            path: Arc::from(path.as_path()),
            range: group.range,
            load_base: group.range.start.wrapping_sub(group.lowest_offset),
        })
        .collect();

    modules.sort_by_key(|module| module.range);
    modules
}

/// Module source backed by `/proc/<pid>/maps`
#[derive(Debug, Clone)]
pub struct ProcMaps {
    pid: Pid,
    maps_path: PathBuf,
}

impl ProcMaps {
    #[must_use]
    pub fn new(pid: Pid) -> Self {
        Self { pid, maps_path: PathBuf::from(format!("/proc/{}/maps", pid.0)) }
    }

    /// Read maps from an arbitrary file (replayed captures, fixtures)
    #[must_use]
    pub fn from_file(pid: Pid, maps_path: impl AsRef<Path>) -> Self {
        Self { pid, maps_path: maps_path.as_ref().to_path_buf() }
    }
}

impl ModuleSource for ProcMaps {
    fn modules(&self) -> Result<Vec<Module>, AttachError> {
        let maps =
            fs::read_to_string(&self.maps_path).map_err(|e| AttachError::from_io(self.pid, &e))?;

        let modules = modules_from_maps(&maps);
        debug!("{} executable modules mapped in {}", modules.len(), self.pid);
        Ok(modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c6a00000-55d0c6a02000 r--p 00000000 08:01 1311 /usr/bin/app
55d0c6a02000-55d0c6a08000 r-xp 00002000 08:01 1311 /usr/bin/app
55d0c6a08000-55d0c6a0a000 r--p 00008000 08:01 1311 /usr/bin/app
55d0c7000000-55d0c7021000 rw-p 00000000 00:00 0    [heap]
7f1e2a000000-7f1e2a028000 r--p 00000000 08:01 2222 /usr/lib/libc.so.6
7f1e2a028000-7f1e2a1bd000 r-xp 00028000 08:01 2222 /usr/lib/libc.so.6
7f1e2a300000-7f1e2a301000 r--p 00000000 08:01 3333 /usr/share/locale/data
7f1e2b000000-7f1e2b001000 r-xp 00000000 08:01 4444 /tmp/my lib.so (deleted)
7ffd5e5f0000-7ffd5e5f2000 r-xp 00000000 00:00 0    [vdso]
";

    #[test]
    fn test_memory_range_contains() {
        let range = MemoryRange { start: 0x1000, end: 0x2000 };

        assert!(range.contains(0x1000));
        assert!(range.contains(0x1500));
        assert!(range.contains(0x1FFF));
        assert!(!range.contains(0x0FFF));
        assert!(!range.contains(0x2000));
        assert!(!range.contains(0x2001));
    }

    #[test]
    fn test_parse_maps_line_fields() {
        let entry =
            parse_maps_line("7f1e2a028000-7f1e2a1bd000 r-xp 00028000 08:01 2222 /usr/lib/libc.so.6")
                .unwrap();
        assert_eq!(entry.range, MemoryRange { start: 0x7f1e_2a02_8000, end: 0x7f1e_2a1b_d000 });
        assert!(entry.executable);
        assert_eq!(entry.offset, 0x28000);
        assert_eq!(entry.path.as_deref(), Some(Path::new("/usr/lib/libc.so.6")));
    }

    #[test]
    fn test_parse_maps_line_rejects_garbage() {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("not a maps line").is_none());
    }

    #[test]
    fn test_modules_merge_mappings_per_path() {
        let modules = modules_from_maps(MAPS);
        let paths: Vec<_> = modules.iter().map(|m| m.path.to_path_buf()).collect();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/usr/bin/app"),
                PathBuf::from("/usr/lib/libc.so.6"),
                PathBuf::from("/tmp/my lib.so"),
            ]
        );

        let app = &modules[0];
        assert_eq!(app.range, MemoryRange { start: 0x55d0_c6a0_0000, end: 0x55d0_c6a0_a000 });
        assert_eq!(app.load_base, 0x55d0_c6a0_0000);
    }

    #[test]
    fn test_modules_skip_non_executable_and_anonymous() {
        let modules = modules_from_maps(MAPS);
        assert!(modules.iter().all(|m| m.path.as_ref() != Path::new("/usr/share/locale/data")));
        assert!(modules.iter().all(|m| !m.path.to_string_lossy().starts_with('[')));
    }

    #[test]
    fn test_load_base_uses_lowest_mapping_offset() {
        let maps = "\
7f0000001000-7f0000003000 r-xp 00001000 08:01 1 /lib/odd.so
7f0000003000-7f0000004000 r--p 00003000 08:01 1 /lib/odd.so
";
        let modules = modules_from_maps(maps);
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].load_base, 0x7f00_0000_0000);
    }

    #[test]
    fn test_proc_maps_self() {
        let pid = Pid(i32::try_from(std::process::id()).unwrap());
        let modules = ProcMaps::new(pid).modules().expect("own maps should be readable");

        let exe = std::env::current_exe().unwrap();
        assert!(
            modules.iter().any(|m| m.path.as_ref() == exe.as_path()),
            "test binary should appear among its own modules"
        );
    }

    #[test]
    fn test_proc_maps_missing_process() {
        let result = ProcMaps::new(Pid(999_999_999)).modules();
        assert_eq!(result.unwrap_err(), AttachError::ProcessNotFound(Pid(999_999_999)));
    }
}
