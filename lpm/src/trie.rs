// Copyright 2022 Oxide Computer Company

//! Multibit stride tries.
//!
//! One generic structure covers three backends: a direct-indexed first
//! level over the top `FIRST_BITS` bits of the address, then 256-way pool
//! nodes consuming 8 bits each down to `BYTES * 8` bits total.
//!
//! A prefix of length `L` is *expanded* on insert: the final partial
//! stride writes the next-hop into every sibling entry the prefix covers,
//! so lookup never walks ancestors. It just records the most recent valid
//! entry on the way down and returns the deepest one seen. Owner lengths
//! (one byte per entry) arbitrate overlapping expansions: a cell written
//! by a longer prefix refuses a shorter one.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::pool::{Entry, NodePool};
use crate::simd;

/// IPv4 four-level 8-bit stride trie.
pub type Ipv4Stride8 = StrideTrie<8, 4>;

/// IPv6 table with a 65 536-entry first level over the top 16 bits.
pub type Ipv6Wide16 = StrideTrie<16, 16>;

/// IPv6 sixteen-level 8-bit stride trie.
pub type Ipv6Stride8 = StrideTrie<8, 16>;

pub struct StrideTrie<const FIRST_BITS: usize, const BYTES: usize> {
    first: Vec<Entry>,
    first_lens: Vec<u8>,
    pool: NodePool,
    // registered prefixes, keyed (len, masked address); decreasing-length
    // walks over this map drive delete-restore
    routes: BTreeMap<(u8, [u8; BYTES]), u32>,
}

impl<const FIRST_BITS: usize, const BYTES: usize> StrideTrie<FIRST_BITS, BYTES> {
    const FIRST_BYTES: usize = FIRST_BITS / 8;

    pub const MAX_LEN: u8 = (BYTES * 8) as u8;

    pub fn new() -> Self {
        StrideTrie {
            first: vec![Entry::default(); 1 << FIRST_BITS],
            first_lens: vec![0; 1 << FIRST_BITS],
            pool: NodePool::new(),
            routes: BTreeMap::new(),
        }
    }

    #[inline]
    fn first_index(addr: &[u8; BYTES]) -> usize {
        let mut idx = 0usize;
        for b in &addr[..Self::FIRST_BYTES] {
            idx = (idx << 8) | *b as usize;
        }
        idx
    }

    /// Strides past the first level a prefix of length `len` occupies.
    #[inline]
    fn strides(len: u8) -> usize {
        (len as usize - FIRST_BITS).div_ceil(8)
    }

    /// Insert a prefix. The address must already be masked to `len` bits
    /// (1 ..= `MAX_LEN`; the default route never reaches the trie).
    /// Returns true when the prefix was not previously present.
    pub fn add(&mut self, addr: [u8; BYTES], len: u8, next_hop: u32) -> Result<bool, Error> {
        debug_assert!(len >= 1 && len <= Self::MAX_LEN);
        if len as usize <= FIRST_BITS {
            let base = Self::first_index(&addr);
            let count = 1usize << (FIRST_BITS - len as usize);
            for i in base..base + count {
                if !self.first[i].is_valid() || self.first_lens[i] <= len {
                    self.first[i].set_route(next_hop);
                    self.first_lens[i] = len;
                }
            }
        } else {
            let strides = Self::strides(len);
            let fi = Self::first_index(&addr);
            let mut node_idx = self.first[fi].child();
            if node_idx == 0 {
                node_idx = self.pool.allocate()?;
                self.first[fi].set_child(node_idx);
            }
            let mut byte = Self::FIRST_BYTES;
            for _ in 1..strides {
                let b = addr[byte] as usize;
                let next = self.pool.node(node_idx).entries[b].child();
                node_idx = if next == 0 {
                    let n = self.pool.allocate()?;
                    self.pool.node_mut(node_idx).entries[b].set_child(n);
                    n
                } else {
                    next
                };
                byte += 1;
            }
            let rem = len as usize - FIRST_BITS - 8 * (strides - 1);
            let base = addr[byte] as usize;
            let count = 1usize << (8 - rem);
            let node = self.pool.node_mut(node_idx);
            for i in base..base + count {
                if !node.entries[i].is_valid() || node.lens[i] <= len {
                    node.entries[i].set_route(next_hop);
                    node.lens[i] = len;
                }
            }
        }
        Ok(self.routes.insert((len, addr), next_hop).is_none())
    }

    /// Remove a prefix, restoring the cells it owned from the longest
    /// covering prefix in the same stride group, if any. Returns false
    /// when the prefix was never added.
    pub fn delete(&mut self, addr: [u8; BYTES], len: u8) -> bool {
        debug_assert!(len >= 1 && len <= Self::MAX_LEN);
        if self.routes.remove(&(len, addr)).is_none() {
            return false;
        }
        let cover = self.covering_in_group(&addr, len);

        if len as usize <= FIRST_BITS {
            let base = Self::first_index(&addr);
            let count = 1usize << (FIRST_BITS - len as usize);
            for i in base..base + count {
                if self.first[i].is_valid() && self.first_lens[i] == len {
                    match cover {
                        Some((l, nh)) => {
                            self.first[i].set_route(nh);
                            self.first_lens[i] = l;
                        }
                        None => {
                            self.first[i].clear_route();
                            self.first_lens[i] = 0;
                        }
                    }
                }
            }
            return true;
        }

        let strides = Self::strides(len);
        let fi = Self::first_index(&addr);
        let mut node_idx = self.first[fi].child();
        let mut path: Vec<(u32, usize)> = Vec::with_capacity(strides);
        let mut byte = Self::FIRST_BYTES;
        for _ in 1..strides {
            if node_idx == 0 {
                debug_assert!(false, "registered route missing from trie");
                return true;
            }
            let b = addr[byte] as usize;
            path.push((node_idx, b));
            node_idx = self.pool.node(node_idx).entries[b].child();
            byte += 1;
        }
        if node_idx == 0 {
            debug_assert!(false, "registered route missing from trie");
            return true;
        }

        let rem = len as usize - FIRST_BITS - 8 * (strides - 1);
        let base = addr[byte] as usize;
        let count = 1usize << (8 - rem);
        let node = self.pool.node_mut(node_idx);
        for i in base..base + count {
            if node.entries[i].is_valid() && node.lens[i] == len {
                match cover {
                    Some((l, nh)) => {
                        node.entries[i].set_route(nh);
                        node.lens[i] = l;
                    }
                    None => {
                        node.entries[i].clear_route();
                        node.lens[i] = 0;
                    }
                }
            }
        }
        self.prune(fi, &path, node_idx);
        true
    }

    /// Longest covering prefix whose expansion lands in the same stride
    /// group as a prefix of length `len`. Covering prefixes of shallower
    /// groups already sit at shallower cells and need no rewrite.
    fn covering_in_group(&self, addr: &[u8; BYTES], len: u8) -> Option<(u8, u32)> {
        let group_low = if len as usize <= FIRST_BITS {
            0
        } else {
            (FIRST_BITS + 8 * ((len as usize - FIRST_BITS - 1) / 8)) as u8
        };
        for l in ((group_low + 1)..len).rev() {
            let mut key = *addr;
            crate::mask_bytes(&mut key, l);
            if let Some(&nh) = self.routes.get(&(l, key)) {
                return Some((l, nh));
            }
        }
        None
    }

    /// Free nodes left without routes or children after a delete, walking
    /// the recorded descent path back toward the first level.
    fn prune(&mut self, first_index: usize, path: &[(u32, usize)], leaf: u32) {
        let mut child = leaf;
        if !self.pool.node(child).is_unused() {
            return;
        }
        for &(node_idx, b) in path.iter().rev() {
            self.pool.free(child);
            let node = self.pool.node_mut(node_idx);
            node.entries[b].set_child(0);
            if !node.is_unused() {
                return;
            }
            child = node_idx;
        }
        self.pool.free(child);
        self.first[first_index].set_child(0);
    }

    /// Longest-prefix lookup. `miss` (typically the default route or the
    /// invalid sentinel) is returned when nothing deeper matches.
    #[inline]
    pub fn lookup(&self, addr: &[u8; BYTES], miss: u32) -> u32 {
        let e = self.first[Self::first_index(addr)];
        let mut best = if e.is_valid() { e.next_hop() } else { miss };
        let mut node = e.child();
        let mut byte = Self::FIRST_BYTES;
        while node != 0 && byte < BYTES {
            let ent = self.pool.node(node).entries[addr[byte] as usize];
            if ent.is_valid() {
                best = ent.next_hop();
            }
            node = ent.child();
            byte += 1;
        }
        best
    }

    pub(crate) fn lookup_batch_scalar(&self, addrs: &[[u8; BYTES]], out: &mut [u32], miss: u32) {
        for (a, o) in addrs.iter().zip(out.iter_mut()) {
            *o = self.lookup(a, miss);
        }
    }

    /// Interleaved batch walk. At each depth the loop first issues a
    /// prefetch for every still-active lane's next entry, then performs
    /// the loads and updates, so the memory latency of up to `LANES`
    /// dependent chains overlaps. Stragglers fall through to the scalar
    /// loop.
    pub(crate) fn lookup_batch_lanes<const LANES: usize>(
        &self,
        addrs: &[[u8; BYTES]],
        out: &mut [u32],
        miss: u32,
    ) {
        let n = addrs.len().min(out.len());
        let full = n - n % LANES;
        let mut base = 0;
        while base < full {
            let lane = &addrs[base..base + LANES];
            let mut best = [miss; LANES];
            let mut node = [0u32; LANES];
            for a in lane.iter() {
                simd::prefetch(&self.first[Self::first_index(a)]);
            }
            for l in 0..LANES {
                let e = self.first[Self::first_index(&lane[l])];
                if e.is_valid() {
                    best[l] = e.next_hop();
                }
                node[l] = e.child();
            }
            let mut byte = Self::FIRST_BYTES;
            while byte < BYTES {
                let mut active = false;
                for l in 0..LANES {
                    if node[l] != 0 {
                        simd::prefetch(&self.pool.node(node[l]).entries[lane[l][byte] as usize]);
                        active = true;
                    }
                }
                if !active {
                    break;
                }
                for l in 0..LANES {
                    if node[l] != 0 {
                        let ent = self.pool.node(node[l]).entries[lane[l][byte] as usize];
                        if ent.is_valid() {
                            best[l] = ent.next_hop();
                        }
                        node[l] = ent.child();
                    }
                }
                byte += 1;
            }
            out[base..base + LANES].copy_from_slice(&best);
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
            + self.first.capacity() * std::mem::size_of::<Entry>()
            + self.first_lens.capacity()
    }

    /// Registered prefixes, shortest first.
    pub fn iter(&self) -> impl Iterator<Item = ([u8; BYTES], u8, u32)> + '_ {
        self.routes.iter().map(|(&(len, addr), &nh)| (addr, len, nh))
    }
}

impl<const FIRST_BITS: usize, const BYTES: usize> Default for StrideTrie<FIRST_BITS, BYTES> {
    fn default() -> Self {
        Self::new()
    }
}
