use std::fmt;

/// Errors surfaced by table mutation. Lookups never fail; a lookup that
/// matches nothing returns [`crate::INVALID_NEXT_HOP`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Prefix length exceeds what the backend can store.
    InvalidPrefixLength { len: u8, max: u8 },
    /// Prefix family does not match the table family.
    AddressFamily,
    /// Next-hop does not fit the 30 bits a DIR-24-8 cell carries.
    NextHopRange(u32),
    /// The node pool is out of 30-bit indices.
    AllocationFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidPrefixLength { len, max } => {
                write!(f, "prefix length {} exceeds backend maximum {}", len, max)
            }
            Error::AddressFamily => {
                write!(f, "address family does not match the table")
            }
            Error::NextHopRange(nh) => {
                write!(f, "next-hop {:#x} exceeds the 30-bit dir24 ceiling", nh)
            }
            Error::AllocationFailure => write!(f, "node pool exhausted"),
        }
    }
}

impl std::error::Error for Error {}
