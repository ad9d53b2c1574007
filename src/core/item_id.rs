//! Tuple id helpers.
//!
//! A tuple id is the 16-bit slot identifier of a record inside a record page.
//! The top bit marks a forwarding link, the next bit a relocated record. The
//! remaining 14 bits carry the ordinal.

pub const LINK_FLAG: u16 = 0x8000;
pub const RELOCATED_FLAG: u16 = 0x4000;
pub const ID_MASK: u16 = 0x3FFF;

/// Largest ordinal a page may hand out. `ID_MASK` itself is reserved.
pub const MAX_ID: u16 = 0x3FFE;

/// Once a page hands out ordinals past this, its document wants a defragmentation.
pub const DEFRAG_LIMIT: u16 = 0x2FFE;

/// "No tuple id assigned yet" as stored in a page header.
pub const UNKNOWN_ID: i16 = -1;

#[inline]
pub fn get_id(tid: u16) -> u16 {
    tid & ID_MASK
}

#[inline]
pub fn is_link(tid: u16) -> bool {
    tid & LINK_FLAG != 0
}

#[inline]
pub fn set_is_link(tid: u16) -> u16 {
    tid | LINK_FLAG
}

#[inline]
pub fn is_relocated(tid: u16) -> bool {
    tid & RELOCATED_FLAG != 0
}

#[inline]
pub fn set_is_relocated(tid: u16) -> u16 {
    tid | RELOCATED_FLAG
}

/// Ordinal comparison, ignoring flag bits on both sides.
#[inline]
pub fn matches(a: u16, b: u16) -> bool {
    get_id(a) == get_id(b)
}
