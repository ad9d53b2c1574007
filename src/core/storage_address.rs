use crate::core::constants::{PageNum, KEY_NOT_FOUND};

/// Packs a page number and tuple id into a single 64-bit record pointer.
///
/// Bits 16..48 hold the page, bits 0..16 the tuple id including its flags.
#[inline]
pub fn create_pointer(page: PageNum, tid: u16) -> u64 {
    ((page & 0xFFFF_FFFF) << 16) | tid as u64
}

#[inline]
pub fn page_from_pointer(pointer: u64) -> PageNum {
    (pointer >> 16) & 0xFFFF_FFFF
}

#[inline]
pub fn tid_from_pointer(pointer: u64) -> u16 {
    (pointer & 0xFFFF) as u16
}

#[inline]
pub fn is_valid(pointer: u64) -> bool {
    pointer != KEY_NOT_FOUND
}

/// `page:tid` rendering used in log messages and page dumps.
pub fn to_display(pointer: u64) -> String {
    if !is_valid(pointer) {
        return "none".to_string();
    }
    format!("{}:{}", page_from_pointer(pointer), tid_from_pointer(pointer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item_id;

    #[test]
    fn test_pointer_packing() {
        let p = create_pointer(123_456, 42);
        assert_eq!(page_from_pointer(p), 123_456);
        assert_eq!(tid_from_pointer(p), 42);
        assert_eq!(to_display(p), "123456:42");
    }

    #[test]
    fn test_flags_survive_packing() {
        let tid = item_id::set_is_relocated(7);
        let p = create_pointer(3, tid);
        assert!(item_id::is_relocated(tid_from_pointer(p)));
        assert_eq!(item_id::get_id(tid_from_pointer(p)), 7);
    }

    #[test]
    fn test_not_found_sentinel() {
        assert!(!is_valid(KEY_NOT_FOUND));
        assert_eq!(to_display(KEY_NOT_FOUND), "none");
    }
}
