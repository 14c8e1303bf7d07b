//! The function catalogue.
//!
//! Owns every discovered [`Function`] in a slot arena and keeps the
//! interval [`FunctionIndex`] in lockstep: a function is indexed iff its
//! slot is live. All extent changes go through the catalog so the index
//! augmentation never goes stale.

use crate::{function::Function, function::FunctionKind, index::FunctionIndex};

/// Stable handle to a function owned by a [`Catalog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FcnId(usize);

impl FcnId {
    /// Build a handle from a raw slot number. Only meaningful against
    /// the catalog that produced the number.
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// The raw slot number.
    pub fn raw(self) -> usize {
        self.0
    }
}

/// The catalogue of discovered functions.
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    slots: Vec<Option<Function>>,
    free: Vec<usize>,
    index: FunctionIndex,
}

impl Catalog {
    /// An empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live functions.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no function is registered.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Register a function. Fails (returning the function back) when the
    /// entry address is already taken.
    pub fn insert(&mut self, fcn: Function) -> Result<FcnId, Function> {
        if self.index.find_exact(fcn.addr).is_some() {
            return Err(fcn);
        }
        let (addr, size) = (fcn.addr, fcn.size());
        let slot = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(fcn);
                i
            }
            None => {
                self.slots.push(Some(fcn));
                self.slots.len() - 1
            }
        };
        let id = FcnId(slot);
        self.index.insert(addr, size, id);
        Ok(id)
    }

    /// Borrow a function.
    pub fn get(&self, id: FcnId) -> Option<&Function> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    /// Borrow a function mutably. Extent changes must go through
    /// [`Catalog::set_size`] or [`Catalog::resize`] instead.
    pub fn get_mut(&mut self, id: FcnId) -> Option<&mut Function> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Take a function out of its slot for heavy mutation; pair with
    /// [`Catalog::restore`]. The index entry stays put meanwhile.
    pub(crate) fn take(&mut self, id: FcnId) -> Option<Function> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    /// Put a taken function back and re-sync its index extent.
    pub(crate) fn restore(&mut self, id: FcnId, fcn: Function) {
        let (addr, size) = (fcn.addr, fcn.size());
        self.slots[id.0] = Some(fcn);
        self.index.update_size(addr, size);
    }

    /// Set a function's stored extent, updating the index augmentation.
    pub fn set_size(&mut self, id: FcnId, size: u64) {
        if let Some(fcn) = self.slots.get_mut(id.0).and_then(Option::as_mut) {
            fcn.set_size(size);
            self.index.update_size(fcn.addr, size);
        }
    }

    /// Resize a function (trimming blocks and successors), keeping the
    /// index in sync.
    pub fn resize(&mut self, id: FcnId, new_size: u64) -> bool {
        let Some(fcn) = self.slots.get_mut(id.0).and_then(Option::as_mut) else {
            return false;
        };
        if !fcn.resize(new_size) {
            return false;
        }
        self.index.update_size(fcn.addr, new_size);
        true
    }

    /// Remove one function.
    pub fn remove(&mut self, id: FcnId) -> Option<Function> {
        let fcn = self.slots.get_mut(id.0).and_then(Option::take)?;
        self.index.delete(fcn.addr, fcn.size());
        self.free.push(id.0);
        Some(fcn)
    }

    /// The function whose entry is exactly `addr`.
    pub fn at(&self, addr: u64) -> Option<FcnId> {
        self.index.find_exact(addr)
    }

    /// The function containing `addr` (entry match or block coverage).
    pub fn containing(&self, addr: u64) -> Option<FcnId> {
        self.index
            .iter_intersecting(addr, addr.saturating_add(1))
            .find(|&id| self.get(id).is_some_and(|f| f.is_in(addr)))
    }

    /// The function with the smallest entry strictly above `addr`.
    pub fn next_after(&self, addr: u64) -> Option<FcnId> {
        self.index
            .iter()
            .map(|(a, _, id)| (a, id))
            .filter(|&(a, _)| a > addr)
            .min_by_key(|&(a, _)| a)
            .map(|(_, id)| id)
    }

    /// Number of functions whose entry lies in `[from, to)`.
    pub fn count_in(&self, from: u64, to: u64) -> usize {
        self.index
            .iter()
            .filter(|&(a, _, _)| a >= from && a < to)
            .count()
    }

    /// The first function with the given display name.
    pub fn find_name(&self, name: &str) -> Option<FcnId> {
        self.iter()
            .find(|(_, f)| f.name == name)
            .map(|(id, _)| id)
    }

    /// Live functions, ascending by entry address.
    pub fn iter(&self) -> impl Iterator<Item = (FcnId, &Function)> + '_ {
        self.index
            .iter()
            .filter_map(move |(_, _, id)| self.get(id).map(|f| (id, f)))
    }

    /// Functions whose extent intersects `[from, to)`, ascending.
    pub fn intersecting(&self, from: u64, to: u64) -> impl Iterator<Item = FcnId> + '_ {
        self.index.iter_intersecting(from, to)
    }

    /// Remove every function that contains `addr` (or starts there).
    pub fn remove_at(&mut self, addr: u64) -> usize {
        let victims: Vec<FcnId> = self
            .iter()
            .filter(|(_, f)| f.addr == addr || f.is_in(addr))
            .map(|(id, _)| id)
            .collect();
        let n = victims.len();
        for id in victims {
            self.remove(id);
        }
        n
    }

    /// Remove every `Location`-kind function covered by the function
    /// owning `addr`, then the owner itself.
    pub fn remove_locs_at(&mut self, addr: u64) -> bool {
        let Some(owner) = self.containing(addr) else {
            return false;
        };
        let span = {
            let f = self.get(owner).expect("containing returned a live id");
            (f.addr, f.end())
        };
        let victims: Vec<FcnId> = self
            .iter()
            .filter(|(id, f)| {
                *id != owner && f.kind == FunctionKind::Location && f.addr >= span.0 && f.addr < span.1
            })
            .map(|(id, _)| id)
            .collect();
        for id in victims {
            self.remove(id);
        }
        self.remove_at(addr);
        true
    }

    /// Shrink `id` if it straddles the entry of the next function.
    pub fn fit(&mut self, id: FcnId) {
        let Some((addr, end)) = self.get(id).map(|f| (f.addr, f.end())) else {
            return;
        };
        if let Some(next) = self.next_after(addr) {
            let next_addr = self.get(next).map(|f| f.addr).unwrap_or(u64::MAX);
            if end > next_addr {
                self.resize(id, next_addr - addr);
            }
        }
    }

    /// Run [`Catalog::fit`] over every function.
    pub fn fit_overlaps(&mut self) {
        let ids: Vec<FcnId> = self.iter().map(|(id, _)| id).collect();
        for id in ids {
            self.fit(id);
        }
    }
}
