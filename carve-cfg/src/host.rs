//! Traits the host implements around the core.
//!
//! The core consumes a disassembler and a loaded image, and produces
//! flags and xrefs. Each seam is one trait with the handful of calls the
//! walker actually makes; anything richer stays on the host side.

use carve_asm::DecodedOp;

/// Decodes one instruction.
pub trait Disassembler {
    /// Decode the instruction at `addr` from `bytes`. `None` when the
    /// bytes do not form a valid encoding.
    fn decode(&self, addr: u64, bytes: &[u8]) -> Option<DecodedOp>;
}

/// A mapped region of the loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSpan {
    /// First mapped address.
    pub from: u64,
    /// First address past the map.
    pub to: u64,
}

impl MapSpan {
    /// Whether `addr` lies inside the map.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.from && addr < self.to
    }
}

/// A named section of the loaded binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionInfo {
    /// Section name as the loader reports it (`.plt`, `__stubs`, ...).
    pub name: String,
    /// First address of the section.
    pub from: u64,
    /// First address past the section.
    pub to: u64,
}

/// Byte-level view of the loaded image.
pub trait Image {
    /// Read up to `buf.len()` bytes at `addr`; returns the count read.
    /// Unreadable tails are left untouched in `buf`.
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize;

    /// Whether `addr` is mapped (and executable, when `exec` is set).
    fn is_valid(&self, addr: u64, exec: bool) -> bool;

    /// The memory map containing `addr`.
    fn map_at(&self, addr: u64) -> Option<MapSpan>;

    /// The binary section containing `addr`.
    fn section_at(&self, addr: u64) -> Option<SectionInfo>;
}

/// A flag: a named address with an optional extent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagItem {
    /// Flag name (`sym.main`, `imp.printf`, `case.0x3000.2`, ...).
    pub name: String,
    /// Extent in bytes; zero-size flags are plain markers.
    pub size: u64,
}

/// The flag/symbol database.
pub trait FlagSink {
    /// The flag at `addr`, or the closest one at/below when `closest`.
    fn get_at(&self, addr: u64, closest: bool) -> Option<FlagItem>;

    /// Register a flag.
    fn set(&mut self, name: &str, addr: u64, size: u64);

    /// Whether a flag whose name starts with `prefix` exists at `addr`.
    fn exist_at(&self, prefix: &str, addr: u64) -> bool;

    /// Whether the function or import at `addr` is known never to return.
    fn is_noreturn(&self, addr: u64) -> bool;

    /// Forward a decode-width hint for code at `addr`.
    fn set_bits_hint(&mut self, addr: u64, bits: u8);
}

/// Kind tag of a cross-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XrefKind {
    /// Jump or other code-to-code reference.
    Code,
    /// Call site.
    Call,
    /// Data access.
    Data,
}

/// A recorded cross-reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xref {
    /// Address the reference is made from.
    pub from: u64,
    /// Address referenced.
    pub to: u64,
    /// Reference kind.
    pub kind: XrefKind,
}

/// The shared cross-reference store.
pub trait XrefSink {
    /// Record a reference.
    fn set(&mut self, from: u64, to: u64, kind: XrefKind);

    /// Drop a previously recorded reference.
    fn delete(&mut self, from: u64, to: u64, kind: XrefKind);

    /// All references whose source lies in `[from, to)`.
    fn refs_in(&self, from: u64, to: u64) -> Vec<Xref>;
}
