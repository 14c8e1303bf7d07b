//! Scripted host implementations for tests and examples.
//!
//! A [`ScriptedIsa`] maps addresses straight to [`DecodedOp`]s, so test
//! programs are written as instruction scripts instead of encoded bytes;
//! the byte image underneath only matters for jump-table contents and
//! pad-pattern checks.

use std::collections::BTreeMap;

use carve_asm::DecodedOp;

use crate::host::{Disassembler, FlagItem, Image, MapSpan, SectionInfo, Xref, XrefKind, XrefSink};

/// Disassembler that replays a fixed address → op script.
#[derive(Debug, Default, Clone)]
pub struct ScriptedIsa {
    ops: BTreeMap<u64, DecodedOp>,
}

impl ScriptedIsa {
    /// An empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one op at its own address.
    pub fn put(&mut self, op: DecodedOp) -> &mut Self {
        self.ops.insert(op.addr, op);
        self
    }

    /// Script a straight run of ops starting at `addr`, laying each out
    /// after the previous one. Returns the first unused address.
    pub fn seq(&mut self, addr: u64, ops: impl IntoIterator<Item = DecodedOp>) -> u64 {
        let mut at = addr;
        for mut op in ops {
            op.addr = at;
            at += u64::from(op.size);
            self.ops.insert(op.addr, op);
        }
        at
    }
}

impl Disassembler for ScriptedIsa {
    fn decode(&self, addr: u64, _bytes: &[u8]) -> Option<DecodedOp> {
        self.ops.get(&addr).cloned()
    }
}

/// A single contiguous byte image.
#[derive(Debug, Clone)]
pub struct FlatImage {
    base: u64,
    bytes: Vec<u8>,
    sections: Vec<SectionInfo>,
}

impl FlatImage {
    /// An image of `bytes` mapped at `base`.
    pub fn new(base: u64, bytes: Vec<u8>) -> Self {
        Self {
            base,
            bytes,
            sections: Vec::new(),
        }
    }

    /// A zero-filled image of `len` bytes mapped at `base`.
    pub fn zeroed(base: u64, len: usize) -> Self {
        Self::new(base, vec![0; len])
    }

    /// Declare a named section.
    pub fn with_section(mut self, name: &str, from: u64, to: u64) -> Self {
        self.sections.push(SectionInfo {
            name: name.into(),
            from,
            to,
        });
        self
    }

    /// Overwrite bytes at `addr`.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) {
        let off = (addr - self.base) as usize;
        self.bytes[off..off + bytes.len()].copy_from_slice(bytes);
    }

    /// Write a little-endian u32 at `addr`.
    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Write a little-endian u64 at `addr`.
    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

impl Image for FlatImage {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize {
        if addr < self.base || addr >= self.end() {
            return 0;
        }
        let off = (addr - self.base) as usize;
        let n = buf.len().min(self.bytes.len() - off);
        buf[..n].copy_from_slice(&self.bytes[off..off + n]);
        n
    }

    fn is_valid(&self, addr: u64, _exec: bool) -> bool {
        addr >= self.base && addr < self.end()
    }

    fn map_at(&self, addr: u64) -> Option<MapSpan> {
        self.is_valid(addr, false).then(|| MapSpan {
            from: self.base,
            to: self.end(),
        })
    }

    fn section_at(&self, addr: u64) -> Option<SectionInfo> {
        self.sections
            .iter()
            .find(|s| addr >= s.from && addr < s.to)
            .cloned()
    }
}

/// Flag store backed by plain maps, recording everything it is given.
#[derive(Debug, Default, Clone)]
pub struct RecordingFlags {
    flags: BTreeMap<u64, FlagItem>,
    noreturns: Vec<u64>,
    bits_hints: Vec<(u64, u8)>,
}

impl RecordingFlags {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed a flag.
    pub fn with_flag(mut self, name: &str, addr: u64, size: u64) -> Self {
        self.flags.insert(
            addr,
            FlagItem {
                name: name.into(),
                size,
            },
        );
        self
    }

    /// Mark `addr` as noreturn.
    pub fn with_noreturn(mut self, addr: u64) -> Self {
        self.noreturns.push(addr);
        self
    }

    /// All flags set so far, by address.
    pub fn all(&self) -> impl Iterator<Item = (u64, &FlagItem)> {
        self.flags.iter().map(|(&a, f)| (a, f))
    }

    /// Names of flags set at `addr`.
    pub fn names_at(&self, addr: u64) -> Vec<&str> {
        self.flags
            .get(&addr)
            .map(|f| f.name.as_str())
            .into_iter()
            .collect()
    }

    /// Whether some flag name at any address starts with `prefix`.
    pub fn any_named(&self, prefix: &str) -> bool {
        self.flags.values().any(|f| f.name.starts_with(prefix))
    }

    /// Recorded decode-width hints.
    pub fn bits_hints(&self) -> &[(u64, u8)] {
        &self.bits_hints
    }
}

impl crate::host::FlagSink for RecordingFlags {
    fn get_at(&self, addr: u64, closest: bool) -> Option<FlagItem> {
        if let Some(f) = self.flags.get(&addr) {
            return Some(f.clone());
        }
        if closest {
            return self.flags.range(..=addr).next_back().map(|(_, f)| f.clone());
        }
        None
    }

    fn set(&mut self, name: &str, addr: u64, size: u64) {
        self.flags.insert(
            addr,
            FlagItem {
                name: name.into(),
                size,
            },
        );
    }

    fn exist_at(&self, prefix: &str, addr: u64) -> bool {
        self.flags
            .get(&addr)
            .is_some_and(|f| f.name.starts_with(prefix))
    }

    fn is_noreturn(&self, addr: u64) -> bool {
        self.noreturns.contains(&addr)
    }

    fn set_bits_hint(&mut self, addr: u64, bits: u8) {
        self.bits_hints.push((addr, bits));
    }
}

/// Xref store backed by a plain vector.
#[derive(Debug, Default, Clone)]
pub struct RecordingXrefs {
    refs: Vec<Xref>,
}

impl RecordingXrefs {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded, in insertion order.
    pub fn all(&self) -> &[Xref] {
        &self.refs
    }

    /// Recorded refs of one kind.
    pub fn of_kind(&self, kind: XrefKind) -> Vec<Xref> {
        self.refs.iter().filter(|r| r.kind == kind).copied().collect()
    }
}

impl XrefSink for RecordingXrefs {
    fn set(&mut self, from: u64, to: u64, kind: XrefKind) {
        let xref = Xref { from, to, kind };
        if !self.refs.contains(&xref) {
            self.refs.push(xref);
        }
    }

    fn delete(&mut self, from: u64, to: u64, kind: XrefKind) {
        self.refs
            .retain(|r| !(r.from == from && r.to == to && r.kind == kind));
    }

    fn refs_in(&self, from: u64, to: u64) -> Vec<Xref> {
        self.refs
            .iter()
            .filter(|r| r.from >= from && r.from < to)
            .copied()
            .collect()
    }
}
