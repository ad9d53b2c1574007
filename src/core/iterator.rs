//! Sequential access to the records of a document.
//!
//! [`NodeIterator`] yields records in document order, stepping over the
//! forwarding links a page split leaves behind; the relocated records they
//! point at follow later in the chain at their document position.
//! [`RawNodeIterator`] yields every slot as stored.

use crate::core::constants::*;
use crate::core::dom_page::{DomPage, Slot};
use crate::core::errors::*;
use crate::core::item_id;
use crate::core::record_store::RecordStore;
use crate::core::storage_address::{self, create_pointer};
use crate::core::value::Value;

/// Position within a page chain.
struct Cursor<'a> {
    store: &'a RecordStore,
    page: Option<DomPage>,
    offset: usize,
    hops: usize,
}

impl<'a> Cursor<'a> {
    fn new(store: &'a RecordStore) -> Self {
        Self {
            store,
            page: None,
            offset: 0,
            hops: 0,
        }
    }

    fn seek(&mut self, pointer: u64, skip_links: bool) -> Result<bool> {
        self.hops = 0;
        match self.store.find_record(pointer, skip_links)? {
            Some(rec) => {
                self.offset = rec.slot.offset;
                self.page = Some(rec.page);
                Ok(true)
            }
            None => {
                log::warn!(
                    "iterator seek: no record at {}",
                    storage_address::to_display(pointer)
                );
                self.page = None;
                Ok(false)
            }
        }
    }

    fn seek_page(&mut self, num: PageNum) -> Result<()> {
        self.hops = 0;
        self.offset = 0;
        self.page = Some(self.store.read_dom(num)?);
        Ok(())
    }

    /// Next slot in chain order, moving to the following page when the
    /// current one is exhausted.
    fn advance(&mut self) -> Result<Option<Slot>> {
        loop {
            let page = match self.page.as_ref() {
                Some(page) => page,
                None => return Ok(None),
            };
            if self.offset < page.data_length() {
                let slot = page.slot_at(self.offset)?;
                self.offset = slot.end();
                return Ok(Some(slot));
            }

            let (num, next) = (page.num(), page.next_data_page());
            if next == NO_PAGE {
                self.page = None;
                return Ok(None);
            }
            self.hops += 1;
            // === CORRUPTION DETECTION VALIDATION ===
            if next == num || self.hops > MAX_CHAIN_LENGTH {
                self.page = None;
                return Err(self.store.corrupt(num, "page chain does not terminate"));
            }
            self.page = Some(self.store.read_dom(next)?);
            self.offset = 0;
        }
    }

    fn page(&self) -> Option<&DomPage> {
        self.page.as_ref()
    }

    fn stop(&mut self) {
        self.page = None;
    }
}

/// Iterates record values in document order, starting at a given record.
///
/// The first item is the start record itself. Items carry the record's
/// logical address, which for relocated records is the original one.
pub struct NodeIterator<'a> {
    cursor: Cursor<'a>,
}

impl<'a> NodeIterator<'a> {
    pub fn new(store: &'a RecordStore, start: u64) -> Result<Self> {
        let mut it = Self {
            cursor: Cursor::new(store),
        };
        it.seek(start)?;
        Ok(it)
    }

    /// Repositions on the record at `pointer`. Returns false, leaving the
    /// iterator exhausted, when no record lives there.
    pub fn seek(&mut self, pointer: u64) -> Result<bool> {
        self.cursor.seek(pointer, true)
    }

    /// Page the iterator currently reads from.
    pub fn current_page(&self) -> Option<PageNum> {
        self.cursor.page().map(|p| p.num())
    }

    fn next_value(&mut self) -> Result<Option<Value>> {
        while let Some(slot) = self.cursor.advance()? {
            if slot.is_link() {
                continue;
            }
            if let Some(page) = self.cursor.page() {
                return self.cursor.store.slot_value(page, &slot).map(Some);
            }
        }
        Ok(None)
    }
}

impl<'a> Iterator for NodeIterator<'a> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_value() {
            Ok(value) => value.map(Ok),
            Err(e) => {
                self.cursor.stop();
                Some(Err(e))
            }
        }
    }
}

/// One slot as stored on its page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub page: PageNum,
    /// Tuple id including link and relocation flags.
    pub tid: u16,
    /// Original address of a relocated record.
    pub back_link: Option<u64>,
    pub is_overflow: bool,
    /// Stored payload: the value, the overflow head or the link target.
    pub data: Vec<u8>,
}

impl RawRecord {
    pub fn id(&self) -> u16 {
        item_id::get_id(self.tid)
    }

    pub fn is_link(&self) -> bool {
        item_id::is_link(self.tid)
    }

    pub fn is_relocated(&self) -> bool {
        item_id::is_relocated(self.tid)
    }

    /// Physical address of this slot.
    pub fn address(&self) -> u64 {
        create_pointer(self.page, self.id())
    }
}

/// Iterates every slot of a page chain in physical order, links included.
pub struct RawNodeIterator<'a> {
    cursor: Cursor<'a>,
}

impl<'a> RawNodeIterator<'a> {
    /// Starts at the slot addressed by `start` without following links.
    pub fn new(store: &'a RecordStore, start: u64) -> Result<Self> {
        let mut it = Self {
            cursor: Cursor::new(store),
        };
        it.seek(start)?;
        Ok(it)
    }

    /// Starts at the first slot of `page`.
    pub fn from_page(store: &'a RecordStore, page: PageNum) -> Result<Self> {
        let mut cursor = Cursor::new(store);
        cursor.seek_page(page)?;
        Ok(Self { cursor })
    }

    pub fn seek(&mut self, pointer: u64) -> Result<bool> {
        self.cursor.seek(pointer, false)
    }

    pub fn current_page(&self) -> Option<PageNum> {
        self.cursor.page().map(|p| p.num())
    }

    fn next_record(&mut self) -> Result<Option<RawRecord>> {
        let slot = match self.cursor.advance()? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let page = match self.cursor.page() {
            Some(page) => page,
            None => return Ok(None),
        };
        Ok(Some(RawRecord {
            page: page.num(),
            tid: slot.tid,
            back_link: slot.back_link_offset().map(|off| page.read_u64(off)),
            is_overflow: slot.is_overflow(),
            data: page.bytes(slot.payload_offset(), slot.value_len()).to_vec(),
        }))
    }
}

impl<'a> Iterator for RawNodeIterator<'a> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.cursor.stop();
                Some(Err(e))
            }
        }
    }
}
