//! Line-oriented annotation stream.
//!
//! Discovery appends UI commands here as a side effect: block and edge
//! declarations, data annotations, flags, comments. The textual grammar
//! is an external contract consumed verbatim by the host shell.

use core::fmt::Write;

/// Accumulated annotation commands.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Annotations {
    buf: String,
}

impl Annotations {
    /// An empty stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accumulated command text.
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the accumulated text, leaving the stream empty.
    pub fn take(&mut self) -> String {
        core::mem::take(&mut self.buf)
    }

    /// `afb+ <fcn> <addr> <size>` — declare a block.
    pub fn block(&mut self, fcn: u64, addr: u64, size: u64) {
        let _ = writeln!(self.buf, "afb+ 0x{fcn:x} 0x{addr:x} {size}");
    }

    /// `afbe <from> <to>` — declare a block edge.
    pub fn edge(&mut self, from: u64, to: u64) {
        let _ = writeln!(self.buf, "afbe 0x{from:x} 0x{to:x}");
    }

    /// `axc <target> <site>` — declare a code xref.
    pub fn code_xref(&mut self, target: u64, site: u64) {
        let _ = writeln!(self.buf, "axc 0x{target:x} 0x{site:x}");
    }

    /// `Cd <size> @ <addr>` — annotate a datum of the given width.
    pub fn datum(&mut self, size: u64, addr: u64) {
        let _ = writeln!(self.buf, "Cd {size} @ 0x{addr:08x}");
    }

    /// `f <name> <size> @ <addr>` — register a flag.
    pub fn flag(&mut self, name: &str, size: u64, addr: u64) {
        let _ = writeln!(self.buf, "f {name} {size} @ 0x{addr:08x}");
    }

    /// `CCu <text> @ <addr>` — attach a user comment.
    pub fn comment(&mut self, text: &str, addr: u64) {
        let _ = writeln!(self.buf, "CCu {text} @ 0x{addr:x}");
    }

    /// Flag name of case `index` of the switch at `switch_addr`.
    pub fn case_flag(switch_addr: u64, index: u64) -> String {
        format!("case.0x{switch_addr:x}.{index}")
    }

    /// Flag name of the default case landing at `addr`.
    pub fn default_flag(addr: u64) -> String {
        format!("case.default.0x{addr:x}")
    }

    /// Flag name of the switch site itself.
    pub fn switch_flag(addr: u64) -> String {
        format!("switch.0x{addr:08x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_grammar() {
        let mut a = Annotations::new();
        a.block(0x1000, 0x1010, 12);
        a.edge(0x1010, 0x1040);
        a.code_xref(0x1040, 0x1010);
        a.datum(4, 0x2000);
        a.flag(&Annotations::case_flag(0x1010, 2), 1, 0x1048);
        a.comment("switch table (4 cases) at 0x2000", 0x1010);
        assert_eq!(
            a.as_str(),
            "afb+ 0x1000 0x1010 12\n\
             afbe 0x1010 0x1040\n\
             axc 0x1040 0x1010\n\
             Cd 4 @ 0x00002000\n\
             f case.0x1010.2 1 @ 0x00001048\n\
             CCu switch table (4 cases) at 0x2000 @ 0x1010\n"
        );
    }

    #[test]
    fn flag_names() {
        assert_eq!(Annotations::case_flag(0x3000, 3), "case.0x3000.3");
        assert_eq!(Annotations::default_flag(0x30a0), "case.default.0x30a0");
        assert_eq!(Annotations::switch_flag(0x3000), "switch.0x00003000");
    }

    #[test]
    fn take_drains() {
        let mut a = Annotations::new();
        a.edge(1, 2);
        assert!(!a.is_empty());
        let text = a.take();
        assert!(text.starts_with("afbe"));
        assert!(a.is_empty());
    }
}
