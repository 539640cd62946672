// Copyright 2022 Oxide Computer Company

//! In-memory longest-prefix-match routing tables.
//!
//! A table maps IPv4 or IPv6 prefixes to 32-bit next-hop identifiers and
//! answers point queries with the next-hop of the most specific matching
//! prefix. Four backends share one handle type:
//!
//! - [`Lpm::ipv4_dir24`] — DIR-24-8: a 16 Mi-entry level direct-indexed by
//!   the top 24 bits plus 256-entry overflow tables. One memory reference
//!   for routes up to /24, two past that. Next-hops are capped at 30 bits
//!   ([`DIR24_MAX_NEXT_HOP`]) because the cell packs the next-hop and its
//!   flags into a single word.
//! - [`Lpm::ipv4_stride8`] — four-level 256-way trie.
//! - [`Lpm::ipv6_wide16`] — 65 536-entry first level over the top 16 bits,
//!   256-way nodes for bits 16..128.
//! - [`Lpm::ipv6_stride8`] — sixteen-level 256-way trie.
//!
//! Addresses are bytes in network order (most significant first) at the
//! byte-array calls; the `u32` IPv4 calls take host-order words. Host bits
//! beyond the prefix length are masked silently on add and delete.
//!
//! Tables are single-writer. Concurrent readers are safe on their own;
//! a writer must be serialized against everything else by the caller, a
//! reader-writer lock around the handle being the expected shape.
//!
//! Batch lookups bind to the widest interleaved walk the CPU supports
//! (up to 16 concurrent walks with AVX-512) the first time one runs, and
//! fall back to a scalar loop everywhere else.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use slog::{debug, info, o, Drain};

pub mod error;

mod batch;
mod dir24;
mod pool;
mod simd;
mod trie;

pub use dir24::DIR24_MAX_NEXT_HOP;
pub use error::Error;
pub use simd::{active as batch_isa, Isa};

use dir24::Dir24;
use trie::{Ipv4Stride8, Ipv6Stride8, Ipv6Wide16};

/// Returned by every lookup that matches nothing, default route included.
/// A caller that stores this value as a real next-hop loses the
/// distinction; that is accepted.
pub const INVALID_NEXT_HOP: u32 = 0xffff_ffff;

/// Table variant selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    Ipv4Dir24,
    Ipv4Stride8,
    Ipv6Wide16,
    Ipv6Stride8,
}

impl Backend {
    pub fn is_ipv6(self) -> bool {
        matches!(self, Backend::Ipv6Wide16 | Backend::Ipv6Stride8)
    }

    pub fn max_prefix_len(self) -> u8 {
        if self.is_ipv6() {
            128
        } else {
            32
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Backend::Ipv4Dir24 => "ipv4-dir24",
            Backend::Ipv4Stride8 => "ipv4-8stride",
            Backend::Ipv6Wide16 => "ipv6-wide16",
            Backend::Ipv6Stride8 => "ipv6-8stride",
        }
    }
}

/// An address plus a length, denoting the set of addresses sharing that
/// many high-order bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Prefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl Prefix {
    pub fn new(addr: IpAddr, len: u8) -> Self {
        Self { addr, len }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Counters reported by [`Lpm::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct TableStats {
    pub backend: &'static str,
    pub batch_isa: &'static str,
    pub prefixes: usize,
    pub has_default_route: bool,
    pub nodes_in_use: usize,
    pub nodes_allocated: usize,
    pub memory_bytes: usize,
}

enum Inner {
    Dir24(Dir24),
    V4Stride(Ipv4Stride8),
    Wide16(Ipv6Wide16),
    V6Stride(Ipv6Stride8),
}

/// A routing table. See the crate docs for the backend variants.
pub struct Lpm {
    kind: Backend,
    inner: Inner,
    default_route: Option<u32>,
    prefix_count: usize,
    log: slog::Logger,
}

fn default_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, o!())
}

// Byte-array batch calls convert through a fixed stack buffer this many
// addresses at a time.
const CONVERT_CHUNK: usize = 256;

/// Zero every bit past the first `len`.
pub(crate) fn mask_bytes(addr: &mut [u8], len: u8) {
    let len = len as usize;
    let full = len / 8;
    let rem = len % 8;
    if full >= addr.len() {
        return;
    }
    let mut i = full;
    if rem != 0 {
        addr[i] &= 0xff << (8 - rem);
        i += 1;
    }
    for b in &mut addr[i..] {
        *b = 0;
    }
}

impl Lpm {
    pub fn new(kind: Backend) -> Self {
        Self::with_logger(kind, default_logger())
    }

    /// Create a table that logs through the caller's logger.
    pub fn with_logger(kind: Backend, log: slog::Logger) -> Self {
        let inner = match kind {
            Backend::Ipv4Dir24 => Inner::Dir24(Dir24::new()),
            Backend::Ipv4Stride8 => Inner::V4Stride(Ipv4Stride8::new()),
            Backend::Ipv6Wide16 => Inner::Wide16(Ipv6Wide16::new()),
            Backend::Ipv6Stride8 => Inner::V6Stride(Ipv6Stride8::new()),
        };
        debug!(log, "table created"; "backend" => kind.name());
        Lpm {
            kind,
            inner,
            default_route: None,
            prefix_count: 0,
            log,
        }
    }

    pub fn ipv4_dir24() -> Self {
        Self::new(Backend::Ipv4Dir24)
    }

    pub fn ipv4_stride8() -> Self {
        Self::new(Backend::Ipv4Stride8)
    }

    pub fn ipv6_wide16() -> Self {
        Self::new(Backend::Ipv6Wide16)
    }

    pub fn ipv6_stride8() -> Self {
        Self::new(Backend::Ipv6Stride8)
    }

    pub fn kind(&self) -> Backend {
        self.kind
    }

    fn family_check(&self, addr: IpAddr) -> Result<(), Error> {
        if self.kind.is_ipv6() != addr.is_ipv6() {
            return Err(Error::AddressFamily);
        }
        Ok(())
    }

    /// Insert a prefix or overwrite its next-hop if already present. Host
    /// bits beyond `prefix.len` are masked silently. A `/0` prefix sets
    /// the default route, which answers any lookup nothing longer matches.
    pub fn add(&mut self, prefix: Prefix, next_hop: u32) -> Result<(), Error> {
        let len = prefix.len;
        let max = self.kind.max_prefix_len();
        if len > max {
            return Err(Error::InvalidPrefixLength { len, max });
        }
        self.family_check(prefix.addr)?;
        if len == 0 {
            if self.kind == Backend::Ipv4Dir24 && next_hop > DIR24_MAX_NEXT_HOP {
                return Err(Error::NextHopRange(next_hop));
            }
            if self.default_route.replace(next_hop).is_none() {
                self.prefix_count += 1;
            }
            return Ok(());
        }
        let new = match (&mut self.inner, prefix.addr) {
            (Inner::Dir24(t), IpAddr::V4(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.add(u32::from_be_bytes(bytes), len, next_hop)?
            }
            (Inner::V4Stride(t), IpAddr::V4(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.add(bytes, len, next_hop)?
            }
            (Inner::Wide16(t), IpAddr::V6(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.add(bytes, len, next_hop)?
            }
            (Inner::V6Stride(t), IpAddr::V6(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.add(bytes, len, next_hop)?
            }
            _ => return Err(Error::AddressFamily),
        };
        if new {
            self.prefix_count += 1;
        }
        Ok(())
    }

    /// Remove a prefix. `Ok(false)` reports a prefix that was never added;
    /// that is not an error. Lookups shadowed by the removed prefix revert
    /// to the next-longest covering route.
    pub fn delete(&mut self, prefix: Prefix) -> Result<bool, Error> {
        let len = prefix.len;
        let max = self.kind.max_prefix_len();
        if len > max {
            return Err(Error::InvalidPrefixLength { len, max });
        }
        self.family_check(prefix.addr)?;
        if len == 0 {
            let had = self.default_route.take().is_some();
            if had {
                self.prefix_count -= 1;
            }
            return Ok(had);
        }
        let removed = match (&mut self.inner, prefix.addr) {
            (Inner::Dir24(t), IpAddr::V4(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.delete(u32::from_be_bytes(bytes), len)
            }
            (Inner::V4Stride(t), IpAddr::V4(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.delete(bytes, len)
            }
            (Inner::Wide16(t), IpAddr::V6(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.delete(bytes, len)
            }
            (Inner::V6Stride(t), IpAddr::V6(a)) => {
                let mut bytes = a.octets();
                mask_bytes(&mut bytes, len);
                t.delete(bytes, len)
            }
            _ => return Err(Error::AddressFamily),
        };
        if removed {
            self.prefix_count -= 1;
        }
        Ok(removed)
    }

    #[inline]
    fn miss(&self) -> u32 {
        self.default_route.unwrap_or(INVALID_NEXT_HOP)
    }

    /// Longest-prefix lookup of a host-order IPv4 address. Returns
    /// [`INVALID_NEXT_HOP`] when nothing matches, or always on an IPv6
    /// table.
    pub fn lookup_ipv4(&self, addr: u32) -> u32 {
        match &self.inner {
            Inner::Dir24(t) => t.lookup(addr, self.miss()),
            Inner::V4Stride(t) => t.lookup(&addr.to_be_bytes(), self.miss()),
            _ => INVALID_NEXT_HOP,
        }
    }

    /// [`Lpm::lookup_ipv4`] for an address in network order, most
    /// significant byte first.
    pub fn lookup_ipv4_bytes(&self, addr: [u8; 4]) -> u32 {
        self.lookup_ipv4(u32::from_be_bytes(addr))
    }

    /// Longest-prefix lookup of an IPv6 address in network order. Returns
    /// [`INVALID_NEXT_HOP`] when nothing matches, or always on an IPv4
    /// table.
    pub fn lookup_ipv6(&self, addr: [u8; 16]) -> u32 {
        match &self.inner {
            Inner::Wide16(t) => t.lookup(&addr, self.miss()),
            Inner::V6Stride(t) => t.lookup(&addr, self.miss()),
            _ => INVALID_NEXT_HOP,
        }
    }

    /// Family-dispatching convenience over the fixed-width lookups.
    pub fn lookup(&self, addr: IpAddr) -> u32 {
        match addr {
            IpAddr::V4(a) => self.lookup_ipv4_bytes(a.octets()),
            IpAddr::V6(a) => self.lookup_ipv6(a.octets()),
        }
    }

    /// Batch lookup of host-order IPv4 addresses. Processes
    /// `min(addrs.len(), out.len())` entries; each output slot receives
    /// exactly what the single lookup of the same address would return.
    pub fn lookup_batch_ipv4(&self, addrs: &[u32], out: &mut [u32]) {
        let n = addrs.len().min(out.len());
        let (addrs, out) = (&addrs[..n], &mut out[..n]);
        match &self.inner {
            Inner::Dir24(t) => batch::dir24_batch(t, addrs, out, self.miss()),
            Inner::V4Stride(t) => {
                let mut buf = [[0u8; 4]; CONVERT_CHUNK];
                for (a, o) in addrs.chunks(CONVERT_CHUNK).zip(out.chunks_mut(CONVERT_CHUNK)) {
                    for (i, v) in a.iter().enumerate() {
                        buf[i] = v.to_be_bytes();
                    }
                    batch::v4_stride_batch(t, &buf[..a.len()], o, self.miss());
                }
            }
            _ => out.fill(INVALID_NEXT_HOP),
        }
    }

    /// Batch lookup of network-order IPv4 addresses.
    pub fn lookup_batch_ipv4_bytes(&self, addrs: &[[u8; 4]], out: &mut [u32]) {
        let n = addrs.len().min(out.len());
        let (addrs, out) = (&addrs[..n], &mut out[..n]);
        match &self.inner {
            Inner::Dir24(t) => {
                let mut buf = [0u32; CONVERT_CHUNK];
                for (a, o) in addrs.chunks(CONVERT_CHUNK).zip(out.chunks_mut(CONVERT_CHUNK)) {
                    for (i, v) in a.iter().enumerate() {
                        buf[i] = u32::from_be_bytes(*v);
                    }
                    batch::dir24_batch(t, &buf[..a.len()], o, self.miss());
                }
            }
            Inner::V4Stride(t) => batch::v4_stride_batch(t, addrs, out, self.miss()),
            _ => out.fill(INVALID_NEXT_HOP),
        }
    }

    /// Batch lookup of network-order IPv6 addresses.
    pub fn lookup_batch_ipv6(&self, addrs: &[[u8; 16]], out: &mut [u32]) {
        let n = addrs.len().min(out.len());
        let (addrs, out) = (&addrs[..n], &mut out[..n]);
        match &self.inner {
            Inner::Wide16(t) => batch::wide16_batch(t, addrs, out, self.miss()),
            Inner::V6Stride(t) => batch::v6_stride_batch(t, addrs, out, self.miss()),
            _ => out.fill(INVALID_NEXT_HOP),
        }
    }

    /// Number of registered prefixes, the default route included.
    pub fn len(&self) -> usize {
        self.prefix_count
    }

    pub fn is_empty(&self) -> bool {
        self.prefix_count == 0
    }

    /// Snapshot of the registered prefixes and their next-hops, shortest
    /// first.
    pub fn prefixes(&self) -> Vec<(Prefix, u32)> {
        let mut v = Vec::with_capacity(self.prefix_count);
        if let Some(nh) = self.default_route {
            let addr: IpAddr = if self.kind.is_ipv6() {
                Ipv6Addr::UNSPECIFIED.into()
            } else {
                Ipv4Addr::UNSPECIFIED.into()
            };
            v.push((Prefix { addr, len: 0 }, nh));
        }
        match &self.inner {
            Inner::Dir24(t) => v.extend(t.iter().map(|(a, len, nh)| {
                (Prefix { addr: IpAddr::V4(a.to_be_bytes().into()), len }, nh)
            })),
            Inner::V4Stride(t) => v.extend(
                t.iter()
                    .map(|(a, len, nh)| (Prefix { addr: IpAddr::V4(a.into()), len }, nh)),
            ),
            Inner::Wide16(t) => v.extend(
                t.iter()
                    .map(|(a, len, nh)| (Prefix { addr: IpAddr::V6(a.into()), len }, nh)),
            ),
            Inner::V6Stride(t) => v.extend(
                t.iter()
                    .map(|(a, len, nh)| (Prefix { addr: IpAddr::V6(a.into()), len }, nh)),
            ),
        }
        v
    }

    pub fn stats(&self) -> TableStats {
        let (nodes_in_use, nodes_allocated, memory_bytes) = match &self.inner {
            Inner::Dir24(t) => (t.nodes_in_use(), t.nodes_allocated(), t.memory_bytes()),
            Inner::V4Stride(t) => (t.nodes_in_use(), t.nodes_allocated(), t.memory_bytes()),
            Inner::Wide16(t) => (t.nodes_in_use(), t.nodes_allocated(), t.memory_bytes()),
            Inner::V6Stride(t) => (t.nodes_in_use(), t.nodes_allocated(), t.memory_bytes()),
        };
        TableStats {
            backend: self.kind.name(),
            batch_isa: simd::active().name(),
            prefixes: self.prefix_count,
            has_default_route: self.default_route.is_some(),
            nodes_in_use,
            nodes_allocated,
            memory_bytes,
        }
    }

    /// Emit the table counters through the table's logger.
    pub fn print_stats(&self) {
        let s = self.stats();
        info!(self.log, "table stats";
            "backend" => s.backend,
            "batch_isa" => s.batch_isa,
            "prefixes" => s.prefixes,
            "default_route" => s.has_default_route,
            "nodes_in_use" => s.nodes_in_use,
            "nodes_allocated" => s.nodes_allocated,
            "memory_bytes" => s.memory_bytes
        );
    }

    /// Render the table counters as JSON.
    pub fn dump(&self) -> String {
        serde_json::to_string_pretty(&self.stats()).unwrap_or_default()
    }
}

/// The library version, as recorded by the package manifest.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn table(kind: Backend) -> Lpm {
        Lpm::with_logger(kind, slog::Logger::root(slog::Discard, o!()))
    }

    fn p(s: &str, len: u8) -> Prefix {
        Prefix::new(s.parse().unwrap(), len)
    }

    const V4_BACKENDS: [Backend; 2] = [Backend::Ipv4Dir24, Backend::Ipv4Stride8];
    const V6_BACKENDS: [Backend; 2] = [Backend::Ipv6Wide16, Backend::Ipv6Stride8];

    #[test]
    fn v4_nested_with_default() -> Result<(), anyhow::Error> {
        for kind in V4_BACKENDS {
            let mut t = table(kind);
            t.add(p("192.168.0.0", 16), 100)?;
            t.add(p("192.168.1.0", 24), 200)?;
            t.add(p("0.0.0.0", 0), 1)?;

            assert_eq!(t.lookup("192.168.1.5".parse()?), 200);
            assert_eq!(t.lookup("192.168.2.5".parse()?), 100);
            assert_eq!(t.lookup("10.0.0.1".parse()?), 1);
            assert_eq!(t.len(), 3);
        }
        Ok(())
    }

    #[test]
    fn v4_host_route() -> Result<(), anyhow::Error> {
        for kind in V4_BACKENDS {
            let mut t = table(kind);
            t.add(p("192.168.1.1", 32), 100)?;
            assert_eq!(t.lookup("192.168.1.1".parse()?), 100);
            assert_eq!(t.lookup("192.168.1.2".parse()?), INVALID_NEXT_HOP);
        }
        Ok(())
    }

    #[test]
    fn v4_delete_reverts() -> Result<(), anyhow::Error> {
        for kind in V4_BACKENDS {
            let mut t = table(kind);
            t.add(p("10.0.0.0", 8), 100)?;
            t.add(p("10.1.0.0", 16), 200)?;
            assert!(t.delete(p("10.1.0.0", 16))?);
            assert_eq!(t.lookup("10.1.1.1".parse()?), 100);
            assert!(!t.delete(p("10.1.0.0", 16))?);
            assert_eq!(t.len(), 1);
        }
        Ok(())
    }

    #[test]
    fn v6_nested_prefixes() -> Result<(), anyhow::Error> {
        for kind in V6_BACKENDS {
            let mut t = table(kind);
            t.add(p("2001:db8::", 32), 100)?;
            t.add(p("2001:db8:1::", 48), 200)?;

            assert_eq!(t.lookup("2001:db8:1::1".parse()?), 200);
            assert_eq!(t.lookup("2001:db8:2::1".parse()?), 100);
            assert_eq!(t.lookup("2001:dead::1".parse()?), INVALID_NEXT_HOP);
        }
        Ok(())
    }

    #[test]
    fn v6_default_route_fallback() -> Result<(), anyhow::Error> {
        for kind in V6_BACKENDS {
            let mut t = table(kind);
            t.add(p("::", 0), 999)?;
            t.add(p("fe80::", 10), 300)?;

            assert_eq!(t.lookup("fe80::1".parse()?), 300);
            assert_eq!(t.lookup("2607:f8b0::1".parse()?), 999);

            assert!(t.delete(p("::", 0))?);
            assert_eq!(t.lookup("2607:f8b0::1".parse()?), INVALID_NEXT_HOP);
            assert_eq!(t.lookup("fe80::1".parse()?), 300);
        }
        Ok(())
    }

    #[test]
    fn overwrite_keeps_latest() -> Result<(), anyhow::Error> {
        for kind in [
            Backend::Ipv4Dir24,
            Backend::Ipv4Stride8,
            Backend::Ipv6Wide16,
            Backend::Ipv6Stride8,
        ] {
            let mut t = table(kind);
            let pfx = if kind.is_ipv6() {
                p("2001:db8::", 32)
            } else {
                p("10.0.0.0", 8)
            };
            t.add(pfx, 1)?;
            t.add(pfx, 2)?;
            assert_eq!(t.len(), 1);
            let probe = pfx.addr;
            assert_eq!(t.lookup(probe), 2);
        }
        Ok(())
    }

    #[test]
    fn host_bits_masked_silently() -> Result<(), anyhow::Error> {
        for kind in V4_BACKENDS {
            let mut t = table(kind);
            // non-zero host bits are accepted and ignored
            t.add(p("192.168.0.1", 16), 100)?;
            assert_eq!(t.lookup("192.168.77.1".parse()?), 100);
            assert!(t.delete(p("192.168.200.200", 16))?);
            assert_eq!(t.lookup("192.168.77.1".parse()?), INVALID_NEXT_HOP);
        }
        Ok(())
    }

    #[test]
    fn validation_errors() {
        let mut v4 = table(Backend::Ipv4Dir24);
        assert_eq!(
            v4.add(p("10.0.0.0", 33), 1),
            Err(Error::InvalidPrefixLength { len: 33, max: 32 })
        );
        assert_eq!(v4.add(p("2001:db8::", 32), 1), Err(Error::AddressFamily));
        assert_eq!(
            v4.add(p("10.0.0.0", 8), DIR24_MAX_NEXT_HOP + 1),
            Err(Error::NextHopRange(DIR24_MAX_NEXT_HOP + 1))
        );
        assert_eq!(
            v4.add(p("0.0.0.0", 0), INVALID_NEXT_HOP),
            Err(Error::NextHopRange(INVALID_NEXT_HOP))
        );

        let mut v6 = table(Backend::Ipv6Stride8);
        assert_eq!(
            v6.delete(p("2001:db8::", 129)),
            Err(Error::InvalidPrefixLength { len: 129, max: 128 })
        );
        assert_eq!(v6.delete(p("10.0.0.0", 8)), Err(Error::AddressFamily));

        // lookups against the wrong family cannot match
        assert_eq!(v4.lookup_ipv6([0u8; 16]), INVALID_NEXT_HOP);
        assert_eq!(v6.lookup_ipv4(0x0a000001), INVALID_NEXT_HOP);
    }

    fn random_v4_tables(ops: usize, seed: u64) -> (Lpm, Lpm) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut a = table(Backend::Ipv4Dir24);
        let mut b = table(Backend::Ipv4Stride8);
        let mut inserted: Vec<Prefix> = Vec::new();
        for i in 0..ops {
            if !inserted.is_empty() && rng.random_range(0..4) == 0 {
                let pfx = inserted.swap_remove(rng.random_range(0..inserted.len()));
                let ra = a.delete(pfx).unwrap();
                let rb = b.delete(pfx).unwrap();
                assert_eq!(ra, rb);
            } else {
                let len = rng.random_range(0..=32u8);
                let addr = Ipv4Addr::from(rng.random::<u32>());
                let pfx = Prefix::new(addr.into(), len);
                let nh = i as u32;
                a.add(pfx, nh).unwrap();
                b.add(pfx, nh).unwrap();
                inserted.push(pfx);
            }
        }
        assert_eq!(a.len(), b.len());
        (a, b)
    }

    #[test]
    fn backend_equivalence_v4() {
        let (a, b) = random_v4_tables(600, 47);
        let mut rng = StdRng::seed_from_u64(48);
        for _ in 0..2000 {
            let addr = rng.random::<u32>();
            assert_eq!(a.lookup_ipv4(addr), b.lookup_ipv4(addr), "addr {:#x}", addr);
        }
    }

    #[test]
    fn backend_equivalence_v6() {
        let mut rng = StdRng::seed_from_u64(47);
        let mut a = table(Backend::Ipv6Wide16);
        let mut b = table(Backend::Ipv6Stride8);
        let mut inserted: Vec<Prefix> = Vec::new();
        for i in 0..400 {
            if !inserted.is_empty() && rng.random_range(0..4) == 0 {
                let pfx = inserted.swap_remove(rng.random_range(0..inserted.len()));
                assert_eq!(a.delete(pfx).unwrap(), b.delete(pfx).unwrap());
            } else {
                let len = rng.random_range(0..=128u8);
                // cluster the high bytes so probes actually collide
                let mut bytes = rng.random::<u128>().to_be_bytes();
                bytes[0] = 0x20;
                bytes[1] = rng.random_range(0..4);
                let pfx = Prefix::new(Ipv6Addr::from(bytes).into(), len);
                a.add(pfx, i).unwrap();
                b.add(pfx, i).unwrap();
                inserted.push(pfx);
            }
        }
        for _ in 0..2000 {
            let mut bytes = rng.random::<u128>().to_be_bytes();
            bytes[0] = 0x20;
            bytes[1] = rng.random_range(0..4);
            assert_eq!(a.lookup_ipv6(bytes), b.lookup_ipv6(bytes));
        }
    }

    #[test]
    fn batch_matches_single_v4() {
        let mut rng = StdRng::seed_from_u64(1701);
        for kind in V4_BACKENDS {
            let mut t = table(kind);
            for i in 0..10_000u32 {
                let addr = Ipv4Addr::from(rng.random::<u32>() & 0xffff_ff00);
                t.add(Prefix::new(addr.into(), 24), i).unwrap();
            }

            let addrs: Vec<u32> = (0..1000).map(|_| rng.random::<u32>()).collect();
            let single: Vec<u32> = addrs.iter().map(|&a| t.lookup_ipv4(a)).collect();

            let mut out = vec![0u32; addrs.len()];
            t.lookup_batch_ipv4(&addrs, &mut out);
            assert_eq!(single, out);

            let byte_addrs: Vec<[u8; 4]> = addrs.iter().map(|a| a.to_be_bytes()).collect();
            let mut out = vec![0u32; addrs.len()];
            t.lookup_batch_ipv4_bytes(&byte_addrs, &mut out);
            assert_eq!(single, out);
        }
    }

    #[test]
    fn batch_matches_single_v6() {
        let mut rng = StdRng::seed_from_u64(1702);
        for kind in V6_BACKENDS {
            let mut t = table(kind);
            t.add(p("::", 0), 7).unwrap();
            for i in 0..2000u32 {
                let mut bytes = rng.random::<u128>().to_be_bytes();
                bytes[0] = 0xfd;
                bytes[1] = rng.random_range(0..2);
                t.add(Prefix::new(Ipv6Addr::from(bytes).into(), 48), i).unwrap();
            }

            let addrs: Vec<[u8; 16]> = (0..1000)
                .map(|_| {
                    let mut bytes = rng.random::<u128>().to_be_bytes();
                    bytes[0] = 0xfd;
                    bytes[1] = rng.random_range(0..2);
                    bytes
                })
                .collect();
            let single: Vec<u32> = addrs.iter().map(|a| t.lookup_ipv6(*a)).collect();

            let mut out = vec![0u32; addrs.len()];
            t.lookup_batch_ipv6(&addrs, &mut out);
            assert_eq!(single, out);
        }
    }

    #[test]
    fn batch_handles_short_output() {
        let mut t = table(Backend::Ipv4Dir24);
        t.add(p("10.0.0.0", 8), 100).unwrap();
        let addrs = [0x0a000001u32, 0x0a000002, 0x0b000001];
        let mut out = [0u32; 2];
        t.lookup_batch_ipv4(&addrs, &mut out);
        assert_eq!(out, [100, 100]);
    }

    #[test]
    fn word_and_byte_lookups_agree() -> Result<(), anyhow::Error> {
        let mut t = table(Backend::Ipv4Dir24);
        t.add(p("172.16.0.0", 12), 100)?;
        let addr: Ipv4Addr = "172.16.5.5".parse()?;
        assert_eq!(t.lookup_ipv4(u32::from(addr)), 100);
        assert_eq!(t.lookup_ipv4_bytes(addr.octets()), 100);
        assert_eq!(t.lookup(addr.into()), 100);
        Ok(())
    }

    #[test]
    fn stats_and_dump() -> Result<(), anyhow::Error> {
        let mut t = table(Backend::Ipv6Wide16);
        t.add(p("2001:db8::", 32), 100)?;
        t.add(p("::", 0), 1)?;

        let s = t.stats();
        assert_eq!(s.backend, "ipv6-wide16");
        assert_eq!(s.prefixes, 2);
        assert!(s.has_default_route);
        assert!(s.nodes_in_use >= 1);
        assert!(s.memory_bytes > 0);
        assert!(t.dump().contains("ipv6-wide16"));
        t.print_stats();
        Ok(())
    }

    #[test]
    fn prefix_snapshot() -> Result<(), anyhow::Error> {
        let mut t = table(Backend::Ipv4Stride8);
        t.add(p("10.1.0.0", 16), 200)?;
        t.add(p("10.0.0.0", 8), 100)?;
        t.add(p("0.0.0.0", 0), 1)?;

        let got = t.prefixes();
        assert_eq!(
            got,
            vec![
                (p("0.0.0.0", 0), 1),
                (p("10.0.0.0", 8), 100),
                (p("10.1.0.0", 16), 200),
            ]
        );
        Ok(())
    }

    #[test]
    fn mask_bytes_truncates() {
        let mut b = [0xff, 0xff, 0xff, 0xff];
        mask_bytes(&mut b, 12);
        assert_eq!(b, [0xff, 0xf0, 0, 0]);
        let mut b = [0xff, 0xff, 0xff, 0xff];
        mask_bytes(&mut b, 32);
        assert_eq!(b, [0xff; 4]);
        let mut b = [0xff, 0xff, 0xff, 0xff];
        mask_bytes(&mut b, 0);
        assert_eq!(b, [0; 4]);
    }

    #[test]
    fn version_string() {
        assert_eq!(version(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn prefix_display() {
        assert_eq!(p("10.0.0.0", 8).to_string(), "10.0.0.0/8");
        assert_eq!(p("2001:db8::", 32).to_string(), "2001:db8::/32");
    }
}
