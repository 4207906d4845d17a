//! Address attribution and symbol interning.
//!
//! The symbolizer is the single point through which sample attribution state
//! is interned: `(pid, ip)` pairs become function identifiers, branch stacks
//! become stack identifiers, and data addresses become data-object
//! identifiers. Newly interned stacks and data objects accumulate until the
//! flush cycle drains them toward the sink.
//!
//! Address mapping consults JIT override ranges first, then a lazily
//! refreshed `/proc/<pid>/maps` cache. Line-level resolution shells out to
//! `addr2line`; a host without it degrades to hex function names. Resolution
//! never fails: unmapped addresses produce a synthetic location built from
//! the process comm.

use std::collections::HashMap;
use std::process::Command;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::clock::monotonic_ns;
use crate::sampler::event::BranchStack;

/// Proc-maps cache lifetime before a lazy re-read.
const MAPS_TTL_NS: u64 = 5_000_000_000;

/// A resolved code location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeLocation {
    pub binary: String,
    pub function: String,
    pub source_file: String,
    pub line: u32,
}

/// A resolved data object (mapping-granular unless registered explicitly).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataObject {
    pub mapping: String,
    pub base: u64,
    pub offset: u64,
    pub permissions: String,
    pub name: String,
    pub type_name: String,
    pub size: u64,
}

/// An interned data object together with its identifier.
#[derive(Debug, Clone, Default)]
pub struct DataSymbol {
    pub id: u64,
    pub object: DataObject,
}

/// An interned call stack together with its identifier.
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    pub id: u64,
    pub frames: Vec<CodeLocation>,
}

#[derive(Debug, Clone)]
struct MemoryRegion {
    start: u64,
    end: u64,
    file_offset: u64,
    path: String,
    perms: String,
}

struct OverrideRegion {
    start: u64,
    end: u64,
    region: MemoryRegion,
}

struct DataOverride {
    start: u64,
    end: u64,
    object: DataObject,
}

#[derive(Default)]
struct ProcMapCache {
    regions: Vec<MemoryRegion>,
    last_refresh_ns: u64,
}

#[derive(Default)]
struct Inner {
    intern_table: HashMap<(u32, u64), CodeLocation>,
    proc_maps: HashMap<u32, ProcMapCache>,
    stack_table: HashMap<u64, StackTrace>,
    dirty_stacks: Vec<u64>,
    data_table: HashMap<u64, DataSymbol>,
    dirty_data: Vec<u64>,
    jit_regions: HashMap<u32, Vec<OverrideRegion>>,
    data_overrides: HashMap<u32, Vec<DataOverride>>,
}

/// Interning symbolizer shared by the aggregator and the detectors.
#[derive(Default)]
pub struct Symbolizer {
    inner: Mutex<Inner>,
}

impl Symbolizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve one instruction pointer to a code location, cached per
    /// `(pid, ip)`.
    pub fn resolve(&self, pid: u32, ip: u64) -> CodeLocation {
        {
            let inner = self.inner.lock();
            if let Some(loc) = inner.intern_table.get(&(pid, ip)) {
                return loc.clone();
            }
        }

        let loc = self.build_location(pid, ip);

        let mut inner = self.inner.lock();
        inner
            .intern_table
            .entry((pid, ip))
            .or_insert_with(|| loc.clone());
        loc
    }

    /// Intern the function at `ip` and return its identifier.
    pub fn intern_function(&self, pid: u32, ip: u64) -> u64 {
        let loc = self.resolve(pid, ip);
        let text = format!(
            "{}|{}|{}:{}",
            loc.binary, loc.function, loc.source_file, loc.line
        );
        digest64(&text, ip)
    }

    /// Intern the call stack rooted at `ip` with the given branch edges and
    /// return its identifier. First interning of a stack marks it dirty for
    /// the next drain.
    pub fn intern_stack(&self, pid: u32, ip: u64, branches: &BranchStack) -> u64 {
        let mut frames = Vec::with_capacity(1 + branches.len());
        frames.push(self.resolve(pid, ip));
        for edge in branches {
            if edge.from == 0 {
                continue;
            }
            frames.push(self.resolve(pid, edge.from));
        }

        let mut text = String::new();
        for frame in &frames {
            text.push_str(&format!(
                "{}|{}|{}:{};",
                frame.binary, frame.function, frame.source_file, frame.line
            ));
        }
        let stack_id = digest64(&text, ip);

        let mut inner = self.inner.lock();
        if !inner.stack_table.contains_key(&stack_id) {
            inner.stack_table.insert(
                stack_id,
                StackTrace {
                    id: stack_id,
                    frames,
                },
            );
            inner.dirty_stacks.push(stack_id);
        }

        stack_id
    }

    /// Resolve a data address to its containing object without interning.
    pub fn resolve_data(&self, pid: u32, addr: u64) -> DataObject {
        let region = {
            let mut inner = self.inner.lock();
            if let Some(obj) = lookup_data_override(&inner, pid, addr) {
                return obj;
            }
            match map_address(&mut inner, pid, addr) {
                Some(region) => {
                    auto_register_region(&mut inner, pid, &region);
                    if let Some(obj) = lookup_data_override(&inner, pid, addr) {
                        return obj;
                    }
                    region
                }
                None => {
                    return DataObject {
                        mapping: "[unknown]".to_string(),
                        offset: addr,
                        ..DataObject::default()
                    };
                }
            }
        };

        DataObject {
            mapping: region.path.clone(),
            base: region.start,
            offset: addr - region.start,
            permissions: region.perms,
            ..DataObject::default()
        }
    }

    /// Intern the data object containing `addr` and return its identifier.
    /// Address zero interns nothing and returns 0.
    pub fn intern_data_object(&self, pid: u32, addr: u64) -> u64 {
        if addr == 0 {
            return 0;
        }

        let obj = self.resolve_data(pid, addr);
        let text = format!("{}|{}|{:x}", obj.mapping, obj.permissions, obj.base);
        let id = digest64(&text, addr);

        let mut inner = self.inner.lock();
        if !inner.data_table.contains_key(&id) {
            inner.data_table.insert(id, DataSymbol { id, object: obj });
            inner.dirty_data.push(id);
        }

        id
    }

    /// Take every stack interned since the previous drain.
    pub fn drain_new_stacks(&self) -> Vec<StackTrace> {
        let mut inner = self.inner.lock();
        let dirty = std::mem::take(&mut inner.dirty_stacks);
        dirty
            .iter()
            .filter_map(|id| inner.stack_table.get(id).cloned())
            .collect()
    }

    /// Take every data object interned since the previous drain.
    pub fn drain_new_data_objects(&self) -> Vec<DataSymbol> {
        let mut inner = self.inner.lock();
        let dirty = std::mem::take(&mut inner.dirty_data);
        dirty
            .iter()
            .filter_map(|id| inner.data_table.get(id).cloned())
            .collect()
    }

    /// Register a JIT code range for a process; overlapping earlier ranges
    /// are replaced.
    pub fn register_jit(&self, pid: u32, start: u64, end: u64, path: &str, build_id: &str) {
        if pid == 0 || start == 0 || end <= start {
            return;
        }
        let mut region_path = if path.is_empty() {
            format!("[jit:{pid}]")
        } else {
            path.to_string()
        };
        if !build_id.is_empty() {
            region_path.push('#');
            region_path.push_str(build_id);
        }
        let region = MemoryRegion {
            start,
            end,
            file_offset: 0,
            path: region_path,
            perms: "r-xp".to_string(),
        };

        let mut inner = self.inner.lock();
        let entries = inner.jit_regions.entry(pid).or_default();
        entries.retain(|existing| existing.end <= start || existing.start >= end);
        entries.push(OverrideRegion { start, end, region });
    }

    /// Register an explicit data object for a process; overlapping earlier
    /// registrations are replaced.
    pub fn register_data(&self, pid: u32, address: u64, name: &str, type_name: &str, size: u64) {
        if pid == 0 || address == 0 {
            return;
        }
        let length = size.max(1);
        let object = DataObject {
            mapping: if name.is_empty() {
                "[user-data]".to_string()
            } else {
                name.to_string()
            },
            base: address,
            offset: 0,
            permissions: "rw-p".to_string(),
            name: name.to_string(),
            type_name: type_name.to_string(),
            size: length,
        };
        let over = DataOverride {
            start: address,
            end: address + length,
            object,
        };

        let mut inner = self.inner.lock();
        let entries = inner.data_overrides.entry(pid).or_default();
        entries.retain(|existing| existing.end <= over.start || existing.start >= over.end);
        entries.push(over);
    }

    /// Forget all cached state for an exited process.
    pub fn drop_process(&self, pid: u32) {
        let mut inner = self.inner.lock();
        inner.proc_maps.remove(&pid);
        inner.jit_regions.remove(&pid);
        inner.data_overrides.remove(&pid);
        inner.intern_table.retain(|(p, _), _| *p != pid);
    }

    fn build_location(&self, pid: u32, ip: u64) -> CodeLocation {
        let region = {
            let mut inner = self.inner.lock();
            match map_address(&mut inner, pid, ip) {
                Some(region) => region,
                None => {
                    return CodeLocation {
                        binary: read_comm(pid),
                        function: format!("{ip:#x}"),
                        source_file: "<unknown>".to_string(),
                        line: 0,
                    };
                }
            }
        };
        symbolize_address(&region, ip)
    }
}

fn digest64(text: &str, fallback: u64) -> u64 {
    let hash = Sha256::digest(text.as_bytes());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&hash[..8]);
    let id = u64::from_le_bytes(buf);
    if id != 0 {
        id
    } else if fallback != 0 {
        fallback
    } else {
        1
    }
}

fn read_comm(pid: u32) -> String {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn lookup_data_override(inner: &Inner, pid: u32, addr: u64) -> Option<DataObject> {
    let entries = inner.data_overrides.get(&pid)?;
    for entry in entries {
        if addr >= entry.start && addr < entry.end {
            let mut object = entry.object.clone();
            object.base = entry.start;
            object.offset = addr - entry.start;
            if entry.end > entry.start {
                object.size = entry.end - entry.start;
            }
            return Some(object);
        }
    }
    None
}

fn lookup_jit_region(inner: &Inner, pid: u32, ip: u64) -> Option<MemoryRegion> {
    let entries = inner.jit_regions.get(&pid)?;
    entries
        .iter()
        .find(|entry| ip >= entry.start && ip < entry.end)
        .map(|entry| entry.region.clone())
}

fn map_address(inner: &mut Inner, pid: u32, ip: u64) -> Option<MemoryRegion> {
    if let Some(region) = lookup_jit_region(inner, pid, ip) {
        return Some(region);
    }

    let now = monotonic_ns();
    let stale = match inner.proc_maps.get(&pid) {
        Some(cache) => {
            cache.regions.is_empty() || now.saturating_sub(cache.last_refresh_ns) > MAPS_TTL_NS
        }
        None => true,
    };
    if stale && !refresh_proc_maps(inner, pid) {
        return None;
    }

    if let Some(region) = find_region(inner, pid, ip) {
        return Some(region);
    }

    // Miss on a fresh-enough cache: the mapping may have appeared since the
    // last read, so force one re-read before giving up.
    if !refresh_proc_maps(inner, pid) {
        return None;
    }
    find_region(inner, pid, ip)
}

fn find_region(inner: &Inner, pid: u32, ip: u64) -> Option<MemoryRegion> {
    inner
        .proc_maps
        .get(&pid)?
        .regions
        .iter()
        .find(|region| ip >= region.start && ip < region.end)
        .cloned()
}

fn refresh_proc_maps(inner: &mut Inner, pid: u32) -> bool {
    let data = match std::fs::read_to_string(format!("/proc/{pid}/maps")) {
        Ok(data) => data,
        Err(_) => return false,
    };

    let mut regions = Vec::new();
    for line in data.lines() {
        if let Some(region) = parse_maps_line(line) {
            regions.push(region);
        }
    }

    inner.proc_maps.insert(
        pid,
        ProcMapCache {
            regions,
            last_refresh_ns: monotonic_ns(),
        },
    );
    true
}

fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perms = parts.next()?;
    let offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let path: String = parts.collect::<Vec<_>>().join(" ");
    if path.is_empty() {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    Some(MemoryRegion {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        file_offset: u64::from_str_radix(offset, 16).ok()?,
        path,
        perms: perms.to_string(),
    })
}

fn auto_register_region(inner: &mut Inner, pid: u32, region: &MemoryRegion) {
    if region.path.is_empty() || region.end <= region.start {
        return;
    }
    let entries = inner.data_overrides.entry(pid).or_default();
    let covered = entries.iter().any(|entry| {
        region.start >= entry.start
            && region.end <= entry.end
            && entry.object.mapping == region.path
    });
    if covered {
        return;
    }

    entries.push(DataOverride {
        start: region.start,
        end: region.end,
        object: DataObject {
            mapping: region.path.clone(),
            base: region.start,
            offset: 0,
            permissions: region.perms.clone(),
            name: region.path.clone(),
            type_name: "mapping".to_string(),
            size: region.end - region.start,
        },
    });
}

fn symbolize_address(region: &MemoryRegion, ip: u64) -> CodeLocation {
    let mut loc = CodeLocation {
        binary: region.path.clone(),
        ..CodeLocation::default()
    };
    let rel = region.file_offset + (ip - region.start);

    let output = Command::new("addr2line")
        .arg("-C")
        .arg("-f")
        .arg("-e")
        .arg(&region.path)
        .arg(format!("{rel:#x}"))
        .output();

    if let Ok(output) = output {
        let text = String::from_utf8_lossy(&output.stdout);
        let mut lines = text.lines();
        if let Some(function) = lines.next() {
            loc.function = function.trim().to_string();
        }
        if let Some(file_line) = lines.next() {
            match file_line.rsplit_once(':') {
                Some((file, line_part)) => {
                    loc.source_file = file.to_string();
                    loc.line = line_part.trim().parse().unwrap_or(0);
                }
                None => loc.source_file = file_line.to_string(),
            }
        }
    }

    if loc.function.is_empty() || loc.function == "??" {
        loc.function = format!("{ip:#x}");
    }
    if loc.source_file.is_empty() || loc.source_file.starts_with("??") {
        loc.source_file = region.path.clone();
    }
    loc
}
