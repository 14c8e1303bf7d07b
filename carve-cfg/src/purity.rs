//! Transitive purity analysis.
//!
//! A function is pure iff it records no data reference and everything it
//! calls (directly or transitively, through call and code refs) is pure.
//! A function is marked visited *before* its callees recurse, so a cycle
//! reads the in-progress entry as tentatively pure; any impurity found
//! anywhere in the cycle still flips every caller on the path, because
//! the caller re-reads the callee's bit after recursion. Self-recursion
//! alone therefore never breaks purity.

use hashbrown::HashSet;

use crate::{
    catalog::FcnId,
    host::{Disassembler, FlagSink, Image, XrefKind, XrefSink},
    walk::Analyzer,
};

/// Memoized purity of a registered function. The cached bit is reused
/// until the function changes structurally.
pub(crate) fn purity_of<D, I, F, X>(anal: &mut Analyzer<D, I, F, X>, id: FcnId) -> bool
where
    D: Disassembler,
    I: Image,
    F: FlagSink,
    X: XrefSink,
{
    let Some(fcn) = anal.catalog.get(id) else {
        return false;
    };
    if fcn.has_changed {
        let mut visited = HashSet::new();
        check_purity(anal, &mut visited, id);
        if let Some(fcn) = anal.catalog.get_mut(id) {
            fcn.has_changed = false;
        }
    }
    anal.catalog.get(id).is_some_and(|f| f.is_pure)
}

fn check_purity<D, I, F, X>(
    anal: &mut Analyzer<D, I, F, X>,
    visited: &mut HashSet<u64>,
    id: FcnId,
) where
    D: Disassembler,
    I: Image,
    F: FlagSink,
    X: XrefSink,
{
    let Some(fcn) = anal.catalog.get(id) else {
        return;
    };
    let (addr, end) = (fcn.addr, fcn.end().max(fcn.addr + 1));
    visited.insert(addr);
    if let Some(fcn) = anal.catalog.get_mut(id) {
        fcn.is_pure = true;
    }

    for r in anal.xrefs.refs_in(addr, end) {
        match r.kind {
            XrefKind::Call | XrefKind::Code => {
                let Some(callee) = anal.catalog.containing(r.to) else {
                    continue;
                };
                let callee_addr = match anal.catalog.get(callee) {
                    Some(f) => f.addr,
                    None => continue,
                };
                if !visited.contains(&callee_addr) {
                    check_purity(anal, visited, callee);
                }
                if !anal.catalog.get(callee).is_some_and(|f| f.is_pure) {
                    if let Some(fcn) = anal.catalog.get_mut(id) {
                        fcn.is_pure = false;
                    }
                    break;
                }
            }
            XrefKind::Data => {
                if let Some(fcn) = anal.catalog.get_mut(id) {
                    fcn.is_pure = false;
                }
                break;
            }
        }
    }
}
