// Copyright 2022 Oxide Computer Company

//! IPv4 DIR-24-8: a 16 Mi-entry table direct-indexed by the top 24 bits
//! of the address, with 256-entry overflow tables (TBL8s) hung off cells
//! that carry prefixes longer than /24. Lookup is one memory reference
//! for the common case and two past a TBL8 pointer.
//!
//! Cells are one word: empty, a direct route with the next-hop packed in
//! the low 30 bits, or a TBL8 pointer flagged in bit 31. Packing the
//! next-hop into the cell is what caps this backend's next-hop range at
//! 30 bits. A companion byte per cell records the length of the prefix
//! that wrote it, which is how a shorter prefix knows to leave a longer
//! one's cells alone on insert and how delete finds the cells to restore.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::pool::{NodePool, CHILD_MASK, VALID_FLAG};
use crate::simd;

const TBL24_CELLS: usize = 1 << 24;

// Bit 31, reserved in the packed entry layout, marks a TBL8 pointer here.
const TBL8_FLAG: u32 = 0x8000_0000;

/// Largest next-hop a DIR-24-8 cell can carry.
pub const DIR24_MAX_NEXT_HOP: u32 = CHILD_MASK;

#[inline]
fn is_direct(cell: u32) -> bool {
    cell & VALID_FLAG != 0
}

#[inline]
fn is_tbl8(cell: u32) -> bool {
    cell & TBL8_FLAG != 0
}

#[inline]
fn payload(cell: u32) -> u32 {
    cell & CHILD_MASK
}

#[inline]
fn direct(next_hop: u32) -> u32 {
    VALID_FLAG | next_hop
}

#[inline]
fn mask_u32(addr: u32, len: u8) -> u32 {
    debug_assert!(len >= 1 && len <= 32);
    addr & (u32::MAX << (32 - len))
}

pub struct Dir24 {
    tbl24: Vec<u32>,
    lens24: Vec<u8>,
    pool: NodePool,
    routes: BTreeMap<(u8, u32), u32>,
}

impl Dir24 {
    pub fn new() -> Self {
        Dir24 {
            tbl24: vec![0; TBL24_CELLS],
            lens24: vec![0; TBL24_CELLS],
            pool: NodePool::new(),
            routes: BTreeMap::new(),
        }
    }

    /// Insert a prefix. The address is a host-order word already masked to
    /// `len` bits (1 ..= 32; the default route never reaches the table).
    /// Returns true when the prefix was not previously present.
    pub fn add(&mut self, addr: u32, len: u8, next_hop: u32) -> Result<bool, Error> {
        debug_assert!(len >= 1 && len <= 32);
        debug_assert_eq!(addr, mask_u32(addr, len));
        if next_hop > DIR24_MAX_NEXT_HOP {
            return Err(Error::NextHopRange(next_hop));
        }
        if len <= 24 {
            let base = (addr >> 8) as usize;
            let count = 1usize << (24 - len);
            for i in base..base + count {
                let cell = self.tbl24[i];
                if is_tbl8(cell) {
                    // the cell's routes live in its TBL8; fill through it
                    let node = self.pool.node_mut(payload(cell));
                    for j in 0..256 {
                        if !node.entries[j].is_valid() || node.lens[j] <= len {
                            node.entries[j].set_word(direct(next_hop));
                            node.lens[j] = len;
                        }
                    }
                } else if !is_direct(cell) || self.lens24[i] <= len {
                    self.tbl24[i] = direct(next_hop);
                    self.lens24[i] = len;
                }
            }
        } else {
            let i = (addr >> 8) as usize;
            let tbl8 = if is_tbl8(self.tbl24[i]) {
                payload(self.tbl24[i])
            } else {
                // split: seed a fresh TBL8 from the direct cell, then
                // publish the pointer; allocation failure leaves the
                // table untouched
                let idx = self.pool.allocate()?;
                let seed = self.tbl24[i];
                let seed_len = self.lens24[i];
                if is_direct(seed) {
                    let node = self.pool.node_mut(idx);
                    for j in 0..256 {
                        node.entries[j].set_word(seed);
                        node.lens[j] = seed_len;
                    }
                }
                self.tbl24[i] = TBL8_FLAG | idx;
                self.lens24[i] = 0;
                idx
            };
            let base = (addr & 0xff) as usize;
            let count = 1usize << (32 - len);
            let node = self.pool.node_mut(tbl8);
            for j in base..base + count {
                if !node.entries[j].is_valid() || node.lens[j] <= len {
                    node.entries[j].set_word(direct(next_hop));
                    node.lens[j] = len;
                }
            }
        }
        Ok(self.routes.insert((len, addr), next_hop).is_none())
    }

    /// Remove a prefix, restoring every cell it owned from the longest
    /// covering registered prefix, if any. Returns false when the prefix
    /// was never added.
    pub fn delete(&mut self, addr: u32, len: u8) -> bool {
        debug_assert!(len >= 1 && len <= 32);
        if self.routes.remove(&(len, addr)).is_none() {
            return false;
        }
        let cover = self.covering(addr, len);

        if len <= 24 {
            let base = (addr >> 8) as usize;
            let count = 1usize << (24 - len);
            for i in base..base + count {
                let cell = self.tbl24[i];
                if is_tbl8(cell) {
                    let node = self.pool.node_mut(payload(cell));
                    for j in 0..256 {
                        if node.entries[j].is_valid() && node.lens[j] == len {
                            match cover {
                                Some((l, nh)) => {
                                    node.entries[j].set_word(direct(nh));
                                    node.lens[j] = l;
                                }
                                None => {
                                    node.entries[j].set_word(0);
                                    node.lens[j] = 0;
                                }
                            }
                        }
                    }
                } else if is_direct(cell) && self.lens24[i] == len {
                    match cover {
                        Some((l, nh)) => {
                            self.tbl24[i] = direct(nh);
                            self.lens24[i] = l;
                        }
                        None => {
                            self.tbl24[i] = 0;
                            self.lens24[i] = 0;
                        }
                    }
                }
            }
        } else {
            let i = (addr >> 8) as usize;
            let cell = self.tbl24[i];
            if !is_tbl8(cell) {
                debug_assert!(false, "registered route missing from table");
                return true;
            }
            let tbl8 = payload(cell);
            let base = (addr & 0xff) as usize;
            let count = 1usize << (32 - len);
            let node = self.pool.node_mut(tbl8);
            for j in base..base + count {
                if node.entries[j].is_valid() && node.lens[j] == len {
                    match cover {
                        Some((l, nh)) => {
                            node.entries[j].set_word(direct(nh));
                            node.lens[j] = l;
                        }
                        None => {
                            node.entries[j].set_word(0);
                            node.lens[j] = 0;
                        }
                    }
                }
            }
            self.maybe_collapse(i, tbl8);
        }
        true
    }

    /// Longest registered prefix shorter than `len` covering `addr`,
    /// walked in decreasing length order. TBL8 cells materialize coverage
    /// of every length, so any shorter covering prefix is a candidate.
    fn covering(&self, addr: u32, len: u8) -> Option<(u8, u32)> {
        for l in (1..len).rev() {
            if let Some(&nh) = self.routes.get(&(l, mask_u32(addr, l))) {
                return Some((l, nh));
            }
        }
        None
    }

    /// Fold a TBL8 back into its TBL24 cell when it no longer earns its
    /// keep: all-empty becomes an empty cell, uniform coverage by a /24-
    /// or-shorter prefix becomes a direct cell again. Anything owned by a
    /// longer prefix keeps the TBL8.
    fn maybe_collapse(&mut self, i: usize, tbl8: u32) {
        let node = self.pool.node(tbl8);
        let first = node.entries[0].word();
        let first_len = node.lens[0];
        let mut empty = true;
        let mut uniform = true;
        for j in 0..256 {
            let w = node.entries[j].word();
            if w != 0 {
                empty = false;
            }
            if w != first || node.lens[j] != first_len {
                uniform = false;
            }
            if !empty && !uniform {
                return;
            }
        }
        if empty {
            self.pool.free(tbl8);
            self.tbl24[i] = 0;
            self.lens24[i] = 0;
        } else if uniform && is_direct(first) && first_len <= 24 {
            self.pool.free(tbl8);
            self.tbl24[i] = first;
            self.lens24[i] = first_len;
        }
    }

    /// Longest-prefix lookup of a host-order address. `miss` is returned
    /// when no cell matches.
    #[inline]
    pub fn lookup(&self, addr: u32, miss: u32) -> u32 {
        let cell = self.tbl24[(addr >> 8) as usize];
        if is_direct(cell) {
            return payload(cell);
        }
        if is_tbl8(cell) {
            let w = self.pool.node(payload(cell)).entries[(addr & 0xff) as usize].word();
            if w & VALID_FLAG != 0 {
                return w & CHILD_MASK;
            }
        }
        miss
    }

    pub(crate) fn lookup_batch_scalar(&self, addrs: &[u32], out: &mut [u32], miss: u32) {
        for (a, o) in addrs.iter().zip(out.iter_mut()) {
            *o = self.lookup(*a, miss);
        }
    }

    /// Interleaved batch walk: prefetch the TBL24 cells for all lanes,
    /// resolve the direct hits, then prefetch and resolve the TBL8 cells
    /// for lanes that need the second reference.
    pub(crate) fn lookup_batch_lanes<const LANES: usize>(
        &self,
        addrs: &[u32],
        out: &mut [u32],
        miss: u32,
    ) {
        let n = addrs.len().min(out.len());
        let full = n - n % LANES;
        let mut base = 0;
        while base < full {
            let lane = &addrs[base..base + LANES];
            for a in lane.iter() {
                simd::prefetch(&self.tbl24[(a >> 8) as usize]);
            }
            let mut tbl8 = [0u32; LANES];
            for l in 0..LANES {
                let cell = self.tbl24[(lane[l] >> 8) as usize];
                out[base + l] = if is_direct(cell) {
                    payload(cell)
                } else {
                    if is_tbl8(cell) {
                        tbl8[l] = payload(cell);
                        simd::prefetch(
                            &self.pool.node(tbl8[l]).entries[(lane[l] & 0xff) as usize],
                        );
                    }
                    miss
                };
            }
            for l in 0..LANES {
                if tbl8[l] != 0 {
                    let w =
                        self.pool.node(tbl8[l]).entries[(lane[l] & 0xff) as usize].word();
                    if w & VALID_FLAG != 0 {
                        out[base + l] = w & CHILD_MASK;
                    }
                }
            }
            base += LANES;
        }
        self.lookup_batch_scalar(&addrs[full..n], &mut out[full..n], miss);
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn nodes_in_use(&self) -> usize {
        self.pool.in_use()
    }

    pub fn nodes_allocated(&self) -> usize {
        self.pool.allocated()
    }

    pub fn memory_bytes(&self) -> usize {
        self.pool.memory_bytes()
            + self.tbl24.capacity() * std::mem::size_of::<u32>()
            + self.lens24.capacity()
    }

    /// Registered prefixes, shortest first, addresses as host-order words.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u8, u32)> + '_ {
        self.routes.iter().map(|(&(len, addr), &nh)| (addr, len, nh))
    }
}

impl Default for Dir24 {
    fn default() -> Self {
        Self::new()
    }
}
