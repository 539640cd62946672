//! Binds each batch entry point to the fastest ISA the CPU offers.
//!
//! The interleaved walks themselves live on the backends; this module
//! stamps out the `#[target_feature]` wrappers that pin each walk to an
//! ISA level and the dispatch functions that pick one at run time. The
//! scalar path is always present and is the only path off x86.

use crate::dir24::Dir24;
use crate::trie::{Ipv4Stride8, Ipv6Stride8, Ipv6Wide16};

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod wrappers {
    use super::*;

    macro_rules! isa_wrappers {
        ($name:ident, $table:ty, $addr:ty) => {
            pub(crate) mod $name {
                use super::*;

                #[target_feature(enable = "sse2")]
                pub unsafe fn sse2(t: &$table, addrs: &[$addr], out: &mut [u32], miss: u32) {
                    t.lookup_batch_lanes::<4>(addrs, out, miss)
                }

                #[target_feature(enable = "sse4.2")]
                pub unsafe fn sse42(t: &$table, addrs: &[$addr], out: &mut [u32], miss: u32) {
                    t.lookup_batch_lanes::<4>(addrs, out, miss)
                }

                #[target_feature(enable = "avx")]
                pub unsafe fn avx(t: &$table, addrs: &[$addr], out: &mut [u32], miss: u32) {
                    t.lookup_batch_lanes::<8>(addrs, out, miss)
                }

                #[target_feature(enable = "avx2")]
                pub unsafe fn avx2(t: &$table, addrs: &[$addr], out: &mut [u32], miss: u32) {
                    t.lookup_batch_lanes::<8>(addrs, out, miss)
                }

                #[target_feature(enable = "avx512f")]
                pub unsafe fn avx512(t: &$table, addrs: &[$addr], out: &mut [u32], miss: u32) {
                    t.lookup_batch_lanes::<16>(addrs, out, miss)
                }
            }
        };
    }

    isa_wrappers!(dir24, Dir24, u32);
    isa_wrappers!(v4_stride, Ipv4Stride8, [u8; 4]);
    isa_wrappers!(wide16, Ipv6Wide16, [u8; 16]);
    isa_wrappers!(v6_stride, Ipv6Stride8, [u8; 16]);
}

macro_rules! dispatch {
    ($name:ident, $table:ty, $addr:ty, $m:ident) => {
        pub(crate) fn $name(t: &$table, addrs: &[$addr], out: &mut [u32], miss: u32) {
            // detection result is cached; every path below was verified
            // available before it is taken
            match crate::simd::active() {
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                crate::simd::Isa::Avx512 => unsafe { wrappers::$m::avx512(t, addrs, out, miss) },
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                crate::simd::Isa::Avx2 => unsafe { wrappers::$m::avx2(t, addrs, out, miss) },
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                crate::simd::Isa::Avx => unsafe { wrappers::$m::avx(t, addrs, out, miss) },
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                crate::simd::Isa::Sse42 => unsafe { wrappers::$m::sse42(t, addrs, out, miss) },
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                crate::simd::Isa::Sse2 => unsafe { wrappers::$m::sse2(t, addrs, out, miss) },
                _ => t.lookup_batch_scalar(addrs, out, miss),
            }
        }
    };
}

dispatch!(dir24_batch, Dir24, u32, dir24);
dispatch!(v4_stride_batch, Ipv4Stride8, [u8; 4], v4_stride);
dispatch!(wide16_batch, Ipv6Wide16, [u8; 16], wide16);
dispatch!(v6_stride_batch, Ipv6Stride8, [u8; 16], v6_stride);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::INVALID_NEXT_HOP;

    // The dispatched path must agree with the scalar loop on whatever CPU
    // the tests land on.
    #[test]
    fn dispatched_matches_scalar() {
        let mut t = Dir24::new();
        t.add(0x0a000000, 8, 100).unwrap();
        t.add(0xc0a80000, 16, 200).unwrap();
        t.add(0xc0a80100, 24, 300).unwrap();

        let addrs: Vec<u32> = (0..97).map(|i| 0xc0a80000 + i * 1031).collect();
        let mut scalar = vec![0u32; addrs.len()];
        t.lookup_batch_scalar(&addrs, &mut scalar, INVALID_NEXT_HOP);

        let mut dispatched = vec![0u32; addrs.len()];
        dir24_batch(&t, &addrs, &mut dispatched, INVALID_NEXT_HOP);
        assert_eq!(scalar, dispatched);
    }
}
