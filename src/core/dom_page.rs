//! Record page layout.
//!
//! A record page extends the B-tree page header with
//! `record_count u16 | data_length u32 | next_data_page u64 |
//! prev_data_page u64 | current_tid i16`. The work area holds slots packed
//! back to back:
//!
//! ```text
//! record:    tid u16 | len u16 | [back_link u64 if relocated] | payload
//! overflow:  tid u16 | 0 u16   | [back_link u64 if relocated] | head page u64
//! link:      tid u16 (LINK flag) | forward pointer u64
//! ```

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::item_id;
use crate::core::paged::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64, Page};
use crate::core::storage_address;
use std::fmt::Write as _;

const OFF_RECORD_COUNT: usize = BTREE_PAGE_HEADER_LEN;
const OFF_DATA_LENGTH: usize = BTREE_PAGE_HEADER_LEN + 2;
const OFF_NEXT_DATA_PAGE: usize = BTREE_PAGE_HEADER_LEN + 6;
const OFF_PREV_DATA_PAGE: usize = BTREE_PAGE_HEADER_LEN + 14;
const OFF_CURRENT_TID: usize = BTREE_PAGE_HEADER_LEN + 22;

/// Bytes taken by a link slot.
pub const LINK_SLOT_LEN: usize = LENGTH_TID + LENGTH_FORWARD_LOCATION;

/// One parsed slot of a record page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Offset of the tid in the work area.
    pub offset: usize,
    /// Stored tid including its flag bits.
    pub tid: u16,
    /// Stored length field. `OVERFLOW_LENGTH` for overflow records, unused for links.
    pub stored_len: u16,
}

impl Slot {
    pub fn id(&self) -> u16 {
        item_id::get_id(self.tid)
    }

    pub fn is_link(&self) -> bool {
        item_id::is_link(self.tid)
    }

    pub fn is_relocated(&self) -> bool {
        !self.is_link() && item_id::is_relocated(self.tid)
    }

    pub fn is_overflow(&self) -> bool {
        !self.is_link() && self.stored_len == OVERFLOW_LENGTH
    }

    /// Bytes of payload held in the page. Eight for links and overflow records.
    pub fn value_len(&self) -> usize {
        if self.is_link() {
            LENGTH_LINK
        } else if self.is_overflow() {
            LENGTH_OVERFLOW_LOCATION
        } else {
            self.stored_len as usize
        }
    }

    /// Offset of the back link of a relocated record.
    pub fn back_link_offset(&self) -> Option<usize> {
        if self.is_relocated() {
            Some(self.offset + LENGTH_TID + LENGTH_DATA_LENGTH)
        } else {
            None
        }
    }

    /// Offset of the payload, the overflow head or the link target.
    pub fn payload_offset(&self) -> usize {
        if self.is_link() {
            return self.offset + LENGTH_TID;
        }
        let mut off = self.offset + LENGTH_TID + LENGTH_DATA_LENGTH;
        if self.is_relocated() {
            off += LENGTH_ORIGINAL_LOCATION;
        }
        off
    }

    pub fn end(&self) -> usize {
        self.payload_offset() + self.value_len()
    }

    pub fn len(&self) -> usize {
        self.end() - self.offset
    }
}

/// Record page view over a raw [`Page`].
#[derive(Clone, Debug)]
pub struct DomPage {
    page: Page,
}

impl DomPage {
    /// Wraps a page without touching its contents.
    pub fn wrap(page: Page) -> Self {
        Self { page }
    }

    /// Resets `page` to an empty record page with no neighbours.
    pub fn init(mut page: Page) -> Self {
        page.clear();
        page.set_status(RECORD);
        page.set_next_page(NO_PAGE);
        let mut dom = Self { page };
        dom.set_record_count(0);
        dom.set_data_length(0);
        dom.set_next_data_page(NO_PAGE);
        dom.set_prev_data_page(NO_PAGE);
        dom.put_current_tid(item_id::UNKNOWN_ID);
        dom
    }

    pub fn num(&self) -> PageNum {
        self.page.num()
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub fn into_page(self) -> Page {
        self.page
    }

    pub fn status(&self) -> u8 {
        self.page.status()
    }

    pub fn set_status(&mut self, status: u8) {
        self.page.set_status(status);
    }

    pub fn lsn(&self) -> Lsn {
        self.page.lsn()
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.page.set_lsn(lsn);
    }

    pub(crate) fn page_mut(&mut self) -> &mut Page {
        &mut self.page
    }

    pub fn record_count(&self) -> u16 {
        get_u16(self.page.header_bytes(), OFF_RECORD_COUNT)
    }

    pub fn set_record_count(&mut self, count: u16) {
        put_u16(self.page.header_bytes_mut(), OFF_RECORD_COUNT, count);
    }

    pub fn inc_record_count(&mut self) {
        let count = self.record_count().saturating_add(1);
        self.set_record_count(count);
    }

    pub fn dec_record_count(&mut self) {
        let count = self.record_count().saturating_sub(1);
        self.set_record_count(count);
    }

    pub fn data_length(&self) -> usize {
        get_u32(self.page.header_bytes(), OFF_DATA_LENGTH) as usize
    }

    /// Sets the used length of the work area. Keeps the generic page header in step.
    pub fn set_data_length(&mut self, len: usize) {
        put_u32(self.page.header_bytes_mut(), OFF_DATA_LENGTH, len as u32);
        self.page.set_data_len(len);
    }

    pub fn next_data_page(&self) -> PageNum {
        get_u64(self.page.header_bytes(), OFF_NEXT_DATA_PAGE)
    }

    pub fn set_next_data_page(&mut self, page: PageNum) {
        put_u64(self.page.header_bytes_mut(), OFF_NEXT_DATA_PAGE, page);
    }

    pub fn prev_data_page(&self) -> PageNum {
        get_u64(self.page.header_bytes(), OFF_PREV_DATA_PAGE)
    }

    pub fn set_prev_data_page(&mut self, page: PageNum) {
        put_u64(self.page.header_bytes_mut(), OFF_PREV_DATA_PAGE, page);
    }

    /// Highest ordinal handed out so far, `UNKNOWN_ID` for none.
    pub fn current_tid(&self) -> i16 {
        get_u16(self.page.header_bytes(), OFF_CURRENT_TID) as i16
    }

    fn put_current_tid(&mut self, tid: i16) {
        put_u16(self.page.header_bytes_mut(), OFF_CURRENT_TID, tid as u16);
    }

    pub fn set_current_tid(&mut self, tid: i16) -> Result<()> {
        if tid > item_id::MAX_ID as i16 {
            return Err(Error::corruption(
                "dom",
                self.num(),
                format!("tuple id {} exceeds the maximum", tid),
            ));
        }
        self.put_current_tid(tid);
        Ok(())
    }

    /// Hands out the next ordinal.
    pub fn next_tid(&mut self) -> Result<u16> {
        let tid = self.current_tid().wrapping_add(1);
        if tid < 0 || tid as u16 >= item_id::ID_MASK {
            return Err(Error::corruption("dom", self.num(), "no spare ids on page"));
        }
        self.put_current_tid(tid);
        Ok(tid as u16)
    }

    /// True while another ordinal can be handed out.
    pub fn has_room(&self) -> bool {
        self.current_tid() < item_id::MAX_ID as i16
    }

    pub fn work_size(&self) -> usize {
        self.page.work().len()
    }

    pub fn free_space(&self) -> usize {
        self.work_size().saturating_sub(self.data_length())
    }

    /// Used part of the work area.
    pub fn data(&self) -> &[u8] {
        let len = self.data_length().min(self.work_size());
        &self.page.work()[..len]
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        get_u64(self.page.work(), offset)
    }

    pub fn write_u64(&mut self, offset: usize, v: u64) {
        put_u64(self.page.work_mut(), offset, v);
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.page.work()[offset..offset + len]
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        &mut self.page.work_mut()[offset..offset + len]
    }

    /// Parses the slot starting at `offset`.
    pub fn slot_at(&self, offset: usize) -> Result<Slot> {
        parse_slot(self.data(), offset).ok_or_else(|| {
            Error::corruption(
                "dom",
                self.num(),
                format!(
                    "malformed record at offset {} (data length {})",
                    offset,
                    self.data_length()
                ),
            )
        })
    }

    /// Slots in physical order, starting at `from`.
    pub fn slots_from(&self, from: usize) -> Slots<'_> {
        slots_of(self.data(), self.num(), from)
    }

    pub fn slots(&self) -> Slots<'_> {
        self.slots_from(0)
    }

    /// Looks up the slot carrying ordinal `tid`, links included.
    pub fn find_slot(&self, tid: u16) -> Result<Option<Slot>> {
        for slot in self.slots() {
            let slot = slot?;
            if item_id::matches(slot.tid, tid) {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    pub fn count_records(&self) -> Result<u16> {
        let mut count = 0u16;
        for slot in self.slots() {
            slot?;
            count += 1;
        }
        Ok(count)
    }

    /// Recounts the slots and raises the current tid to the largest ordinal found.
    pub fn clean_up(&mut self) -> Result<()> {
        let mut count = 0u16;
        let mut max_id: i16 = item_id::UNKNOWN_ID;
        for slot in self.slots() {
            let slot = slot?;
            count += 1;
            max_id = max_id.max(slot.id() as i16);
        }
        self.set_record_count(count);
        if max_id > self.current_tid() {
            self.set_current_tid(max_id)?;
        }
        Ok(())
    }

    /// Appends `bytes` to the used area and returns the offset written at.
    pub fn append(&mut self, bytes: &[u8]) -> Result<usize> {
        let offset = self.data_length();
        self.insert_at(offset, bytes)?;
        Ok(offset)
    }

    /// Inserts `bytes` at `offset`, shifting the tail right.
    pub fn insert_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let len = self.data_length();
        if offset > len || len + bytes.len() > self.work_size() {
            return Err(Error::corruption(
                "dom",
                self.num(),
                format!(
                    "cannot insert {} bytes at {} (data length {}, work size {})",
                    bytes.len(),
                    offset,
                    len,
                    self.work_size()
                ),
            ));
        }
        let work = self.page.work_mut();
        work.copy_within(offset..len, offset + bytes.len());
        work[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.set_data_length(len + bytes.len());
        Ok(())
    }

    /// Cuts `count` bytes at `offset`, shifting the tail left.
    pub fn remove_at(&mut self, offset: usize, count: usize) -> Result<()> {
        let len = self.data_length();
        if offset + count > len {
            return Err(Error::corruption(
                "dom",
                self.num(),
                format!(
                    "cannot remove {} bytes at {} (data length {})",
                    count, offset, len
                ),
            ));
        }
        let work = self.page.work_mut();
        work.copy_within(offset + count..len, offset);
        work[len - count..len].fill(0);
        self.set_data_length(len - count);
        Ok(())
    }

    /// Drops everything from `len` on.
    pub fn truncate(&mut self, len: usize) {
        let old = self.data_length();
        if len < old {
            self.page.work_mut()[len..old].fill(0);
            self.set_data_length(len);
        }
    }

    /// Replaces the used area.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        self.page.set_data(data)?;
        self.set_data_length(data.len());
        Ok(())
    }

    pub fn header_summary(&self) -> String {
        format!(
            "page {}: status {}, lsn {}, records {}, data length {}, prev {}, next {}, tid {}",
            self.num(),
            self.status(),
            self.lsn(),
            self.record_count(),
            self.data_length(),
            page_str(self.prev_data_page()),
            page_str(self.next_data_page()),
            self.current_tid()
        )
    }

    /// One line per slot: `offset tid kind`.
    pub fn describe_slots(&self) -> String {
        let mut out = String::new();
        for slot in self.slots() {
            let slot = match slot {
                Ok(s) => s,
                Err(e) => {
                    let _ = writeln!(out, "  !! {}", e);
                    break;
                }
            };
            let _ = write!(out, "  {:>5} {:>5}", slot.offset, slot.id());
            if slot.is_link() {
                let _ = writeln!(
                    out,
                    " L -> {}",
                    storage_address::to_display(self.read_u64(slot.payload_offset()))
                );
                continue;
            }
            if let Some(off) = slot.back_link_offset() {
                let _ = write!(
                    out,
                    " R <- {}",
                    storage_address::to_display(self.read_u64(off))
                );
            }
            if slot.is_overflow() {
                let _ = writeln!(out, " O @{}", self.read_u64(slot.payload_offset()));
            } else {
                let _ = writeln!(out, " [{} bytes]", slot.value_len());
            }
        }
        out
    }
}

/// Slots of a detached copy of a page's used area, e.g. the pre-split image.
pub fn slots_of(data: &[u8], page: PageNum, from: usize) -> Slots<'_> {
    Slots {
        data,
        page,
        pos: from,
    }
}

/// Iterator over the slots of a page, see [`DomPage::slots_from`].
pub struct Slots<'a> {
    data: &'a [u8],
    page: PageNum,
    pos: usize,
}

impl<'a> Iterator for Slots<'a> {
    type Item = Result<Slot>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        match parse_slot(self.data, self.pos) {
            Some(slot) => {
                self.pos = slot.end();
                Some(Ok(slot))
            }
            None => {
                let offset = self.pos;
                self.pos = self.data.len();
                Some(Err(Error::corruption(
                    "dom",
                    self.page,
                    format!("malformed record at offset {}", offset),
                )))
            }
        }
    }
}

fn parse_slot(data: &[u8], offset: usize) -> Option<Slot> {
    if offset + LENGTH_TID > data.len() {
        return None;
    }
    let tid = get_u16(data, offset);
    let stored_len = if item_id::is_link(tid) {
        0
    } else {
        if offset + LENGTH_TID + LENGTH_DATA_LENGTH > data.len() {
            return None;
        }
        get_u16(data, offset + LENGTH_TID)
    };
    let slot = Slot {
        offset,
        tid,
        stored_len,
    };
    // === CORRUPTION DETECTION VALIDATION ===
    if slot.end() > data.len() {
        return None;
    }
    Some(slot)
}

fn page_str(page: PageNum) -> String {
    if page == NO_PAGE {
        "-".to_string()
    } else {
        page.to_string()
    }
}

/// Serializes a plain or overflow record.
pub fn encode_record(tid: u16, payload: &[u8], is_overflow: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_TID + LENGTH_DATA_LENGTH + payload.len());
    out.extend_from_slice(&tid.to_be_bytes());
    let len = if is_overflow {
        OVERFLOW_LENGTH
    } else {
        payload.len() as u16
    };
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Serializes a relocated record carrying the pointer of its original slot.
pub fn encode_moved(tid: u16, payload: &[u8], back_link: u64, is_overflow: bool) -> Vec<u8> {
    let tid = item_id::set_is_relocated(item_id::get_id(tid));
    let mut out = Vec::with_capacity(
        LENGTH_TID + LENGTH_DATA_LENGTH + LENGTH_ORIGINAL_LOCATION + payload.len(),
    );
    out.extend_from_slice(&tid.to_be_bytes());
    let len = if is_overflow {
        OVERFLOW_LENGTH
    } else {
        payload.len() as u16
    };
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&back_link.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Serializes a forwarding link.
pub fn encode_link(tid: u16, link: u64) -> Vec<u8> {
    let tid = item_id::set_is_link(item_id::get_id(tid));
    let mut out = Vec::with_capacity(LINK_SLOT_LEN);
    out.extend_from_slice(&tid.to_be_bytes());
    out.extend_from_slice(&link.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank(num: PageNum, page_size: usize) -> DomPage {
        DomPage::init(Page::from_raw(
            num,
            vec![0u8; page_size],
            DEFAULT_PAGE_HEADER_SIZE,
        ))
    }

    #[test]
    fn test_init_header() {
        let page = blank(3, 256);
        assert_eq!(page.status(), RECORD);
        assert_eq!(page.record_count(), 0);
        assert_eq!(page.data_length(), 0);
        assert_eq!(page.next_data_page(), NO_PAGE);
        assert_eq!(page.prev_data_page(), NO_PAGE);
        assert_eq!(page.current_tid(), item_id::UNKNOWN_ID);
        assert_eq!(page.work_size(), 256 - DEFAULT_PAGE_HEADER_SIZE);
    }

    #[test]
    fn test_header_offsets() {
        let mut page = blank(1, 256);
        page.set_record_count(7);
        page.set_data_length(40);
        page.set_next_data_page(9);
        page.set_prev_data_page(4);
        page.set_current_tid(12).unwrap();

        let header = page.page().header_bytes();
        assert_eq!(get_u16(header, 31), 7);
        assert_eq!(get_u32(header, 33), 40);
        assert_eq!(get_u64(header, 37), 9);
        assert_eq!(get_u64(header, 45), 4);
        assert_eq!(get_u16(header, 53), 12);
        assert_eq!(page.page().data_len(), 40);
    }

    #[test]
    fn test_tid_allocation() {
        let mut page = blank(1, 256);
        assert_eq!(page.next_tid().unwrap(), 0);
        assert_eq!(page.next_tid().unwrap(), 1);

        page.set_current_tid(item_id::MAX_ID as i16 - 1).unwrap();
        assert!(page.has_room());
        assert_eq!(page.next_tid().unwrap(), item_id::MAX_ID);
        assert!(!page.has_room());
        assert!(page.next_tid().is_err());
        assert!(page.set_current_tid(item_id::MAX_ID as i16 + 1).is_err());
    }

    #[test]
    fn test_slot_layouts() {
        let mut page = blank(2, 512);
        page.append(&encode_record(0, b"hello", false)).unwrap();
        page.append(&encode_record(1, &42u64.to_be_bytes(), true)).unwrap();
        page.append(&encode_link(2, storage_address::create_pointer(9, 4)))
            .unwrap();
        page.append(&encode_moved(3, b"abc", storage_address::create_pointer(1, 3), false))
            .unwrap();

        let slots: Vec<Slot> = page.slots().map(|s| s.unwrap()).collect();
        assert_eq!(slots.len(), 4);

        assert_eq!(slots[0].offset, 0);
        assert_eq!(slots[0].value_len(), 5);
        assert_eq!(slots[0].len(), 9);

        assert!(slots[1].is_overflow());
        assert_eq!(page.read_u64(slots[1].payload_offset()), 42);

        assert!(slots[2].is_link());
        assert_eq!(slots[2].len(), LINK_SLOT_LEN);
        assert_eq!(
            page.read_u64(slots[2].payload_offset()),
            storage_address::create_pointer(9, 4)
        );

        assert!(slots[3].is_relocated());
        assert_eq!(
            page.read_u64(slots[3].back_link_offset().unwrap()),
            storage_address::create_pointer(1, 3)
        );
        assert_eq!(page.bytes(slots[3].payload_offset(), 3), b"abc");
        assert_eq!(slots[3].end(), page.data_length());
    }

    #[test]
    fn test_find_slot_ignores_flags() {
        let mut page = blank(2, 256);
        page.append(&encode_record(0, b"a", false)).unwrap();
        page.append(&encode_link(5, 1)).unwrap();

        let slot = page.find_slot(5).unwrap().unwrap();
        assert!(slot.is_link());
        assert_eq!(slot.offset, 5);
        assert!(page.find_slot(1).unwrap().is_none());
    }

    #[test]
    fn test_insert_and_remove_shift() {
        let mut page = blank(2, 256);
        page.append(&encode_record(0, b"aa", false)).unwrap();
        page.append(&encode_record(2, b"cc", false)).unwrap();
        page.insert_at(6, &encode_record(1, b"bb", false)).unwrap();

        let ids: Vec<u16> = page.slots().map(|s| s.unwrap().id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let slot = page.find_slot(1).unwrap().unwrap();
        page.remove_at(slot.offset, slot.len()).unwrap();
        let ids: Vec<u16> = page.slots().map(|s| s.unwrap().id()).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(page.data_length(), 12);
        assert!(page.page().work()[12..18].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_insert_beyond_work_area_fails() {
        let mut page = blank(2, 256);
        let big = vec![1u8; page.work_size() - 4];
        page.append(&encode_record(0, &big, false)).unwrap();
        assert!(page.append(&encode_record(1, b"x", false)).is_err());
    }

    #[test]
    fn test_clean_up_never_lowers_tid() {
        let mut page = blank(2, 256);
        page.set_current_tid(9).unwrap();
        page.append(&encode_record(3, b"x", false)).unwrap();
        page.append(&encode_link(11, 5)).unwrap();
        page.clean_up().unwrap();
        assert_eq!(page.record_count(), 2);
        assert_eq!(page.current_tid(), 11);

        page.truncate(5);
        page.clean_up().unwrap();
        assert_eq!(page.record_count(), 1);
        assert_eq!(page.current_tid(), 11);
    }

    #[test]
    fn test_malformed_slot_is_corruption() {
        let mut page = blank(2, 256);
        page.append(&encode_record(0, b"abcd", false)).unwrap();
        put_u16(page.bytes_mut(2, 2), 0, 200);
        let err = page.slots().next().unwrap().unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
        assert!(page.count_records().is_err());
    }

    #[test]
    fn test_describe_slots() {
        let mut page = blank(2, 256);
        page.append(&encode_record(0, b"abcd", false)).unwrap();
        page.append(&encode_link(1, storage_address::create_pointer(4, 1)))
            .unwrap();
        let text = page.describe_slots();
        assert!(text.contains("[4 bytes]"));
        assert!(text.contains("L -> 4:1"));
    }
}
