use crate::core::btree::BTreeIndex;
use crate::core::constants::*;
use crate::core::dom_page::{
    encode_link, encode_moved, encode_record, slots_of, DomPage, Slot, LINK_SLOT_LEN,
};
use crate::core::errors::*;
use crate::core::index_query::IndexQuery;
use crate::core::item_id;
use crate::core::journal::{Journal, Txn};
use crate::core::loggable::{LogEntry, LogRecord};
use crate::core::options::StoreOptions;
use crate::core::paged::{get_u64, Page, PagedFile, PagedStore};
use crate::core::recovery;
use crate::core::stats::{BufferStats, StoreStats};
use crate::core::storage_address::{self, create_pointer, page_from_pointer, tid_from_pointer};
use crate::core::value::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on pages visited while resolving one address.
const MAX_LOOKUP_HOPS: usize = 4096;

/// Per-writer state while a document is appended with [`RecordStore::add`].
///
/// Each concurrent writer holds its own session so the pages of different
/// documents never interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSession {
    current_page: PageNum,
    page_count: usize,
    split_count: usize,
    defrag_required: bool,
}

impl Default for WriterSession {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterSession {
    pub fn new() -> Self {
        Self {
            current_page: NO_PAGE,
            page_count: 0,
            split_count: 0,
            defrag_required: false,
        }
    }

    /// Continues appending after the records already on `page`.
    pub fn resume_at(page: PageNum) -> Self {
        Self {
            current_page: page,
            ..Self::new()
        }
    }

    pub fn current_page(&self) -> Option<PageNum> {
        if self.current_page == NO_PAGE {
            None
        } else {
            Some(self.current_page)
        }
    }

    /// Pages started on behalf of this session.
    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn split_count(&self) -> usize {
        self.split_count
    }

    /// Set once a page of the document handed out tids past `DEFRAG_LIMIT`.
    pub fn needs_defrag(&self) -> bool {
        self.defrag_required
    }
}

/// A resolved record: the page holding it and its slot.
#[derive(Debug, Clone)]
pub struct RecordPos {
    pub page: DomPage,
    pub slot: Slot,
}

impl RecordPos {
    pub fn address(&self) -> u64 {
        create_pointer(self.page.num(), self.slot.id())
    }
}

/// Journal file used next to a store file.
pub fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".journal");
    PathBuf::from(name)
}

/// Document node store.
///
/// Records live in chains of record pages, one chain per document, in
/// document order. A B-tree in the same file maps caller keys to record
/// addresses. Callers serialize writers of one document.
pub struct RecordStore {
    index: BTreeIndex,
    file: Arc<PagedFile>,
    journal: Option<Arc<Journal>>,
    recovery_enabled: bool,
}

impl RecordStore {
    /// Opens or creates a store. With recovery enabled a journal is kept at
    /// [`journal_path`] and replayed here when it still holds records.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = Arc::new(PagedFile::open(path, options, DOM_FORMAT_VERSION)?);
        let journal = if options.recovery_enabled && !file.is_read_only() {
            let journal = Journal::open(journal_path(path), options)?;
            journal.set_metrics(file.metrics().clone());
            Some(Arc::new(journal))
        } else {
            None
        };
        let is_new = file.is_new();
        let store = Self::with_parts(file, journal, options)?;
        if is_new && !store.file.is_read_only() {
            store.file.flush()?;
        }

        if let Some(journal) = store.journal.as_ref() {
            if !journal.is_empty() {
                log::info!(
                    "journal {} holds {} records, running recovery",
                    journal.path().display(),
                    journal.record_count()
                );
                recovery::recover(&store)?;
            }
        }
        Ok(store)
    }

    /// Store over an already opened file and journal.
    pub fn with_parts(
        file: Arc<PagedFile>,
        journal: Option<Arc<Journal>>,
        options: &StoreOptions,
    ) -> Result<Self> {
        let index = BTreeIndex::with_file(file.clone(), journal.clone(), options)?;
        Ok(Self {
            index,
            file,
            journal,
            recovery_enabled: options.recovery_enabled,
        })
    }

    pub fn file(&self) -> &Arc<PagedFile> {
        &self.file
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    pub fn index(&self) -> &BTreeIndex {
        &self.index
    }

    pub fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.file.is_read_only() {
            return Err(Error::read_only(operation));
        }
        Ok(())
    }

    // Transactions

    pub fn begin(&self) -> Result<Txn> {
        match self.journal.as_ref() {
            Some(journal) => journal.begin(),
            None => Err(Error::Other(
                "transactions need a journal; recovery is disabled".to_string(),
            )),
        }
    }

    pub fn commit(&self, txn: &Txn) -> Result<()> {
        match self.journal.as_ref() {
            Some(journal) => journal.commit(txn),
            None => Ok(()),
        }
    }

    /// Undoes every change of `txn` newest first, flushes the pages and
    /// marks the transaction aborted.
    pub fn rollback(&self, txn: &Txn) -> Result<()> {
        let journal = match self.journal.as_ref() {
            Some(journal) => journal,
            None => return Ok(()),
        };
        let records = journal.records_of(txn)?;
        log::info!(
            "rolling back transaction {} ({} records)",
            txn.id(),
            records.len()
        );
        for record in records.iter().rev() {
            self.undo(record)?;
        }
        self.index.flush()?;
        journal.abort(txn)
    }

    pub(crate) fn log_to(
        &self,
        txn: Option<&Txn>,
        page: &mut Page,
        entry: impl FnOnce() -> LogEntry,
    ) -> Result<()> {
        if let (Some(txn), Some(journal), true) = (txn, self.journal.as_ref(), self.recovery_enabled)
        {
            let lsn = journal.write(txn, &entry())?;
            page.set_lsn(lsn);
        }
        Ok(())
    }

    /// Corruption error for `num`, logged together with a dump of the page.
    pub(crate) fn corrupt(&self, num: PageNum, details: impl Into<String>) -> Error {
        let details = details.into();
        match self.file.dump_page(num) {
            Ok(dump) => log::error!("corrupt page {}: {}\n{}", num, details, dump),
            Err(_) => log::error!("corrupt page {}: {}", num, details),
        }
        Error::corruption("dom", num, details)
    }

    // Page helpers

    pub(crate) fn read_dom(&self, num: PageNum) -> Result<DomPage> {
        let page = self.file.read_page(num)?;
        // === CORRUPTION DETECTION VALIDATION ===
        if page.status() != RECORD {
            return Err(self.corrupt(
                num,
                format!("expected a record page, found status {}", page.status()),
            ));
        }
        Ok(DomPage::wrap(page))
    }

    fn write_dom(&self, page: &DomPage) -> Result<()> {
        self.file.write_page(page.page())
    }

    /// Allocates and journals a fresh record page. The caller writes it.
    fn new_record_page(
        &self,
        txn: Option<&Txn>,
        prev: PageNum,
        next: PageNum,
        next_tid: i16,
    ) -> Result<DomPage> {
        let mut page = DomPage::init(self.file.get_free_page(true)?);
        page.set_prev_data_page(prev);
        page.set_next_data_page(next);
        page.set_current_tid(next_tid)?;
        let num = page.num();
        self.log_to(txn, page.page_mut(), || LogEntry::CreatePage {
            page: num,
            prev_page: prev,
            next_page: next,
            next_tid,
        })?;
        log::debug!("created record page {} (prev {}, next {})", num, prev, next);
        Ok(page)
    }

    /// Rewrites the chain links of `page`, journaling old and new values.
    fn relink(
        &self,
        txn: Option<&Txn>,
        page: &mut DomPage,
        prev: Option<PageNum>,
        next: Option<PageNum>,
    ) -> Result<()> {
        let (old_prev, old_next) = (page.prev_data_page(), page.next_data_page());
        let new_prev = prev.unwrap_or(old_prev);
        let new_next = next.unwrap_or(old_next);
        let num = page.num();
        self.log_to(txn, page.page_mut(), || LogEntry::UpdateHeader {
            page: num,
            prev_page: new_prev,
            next_page: new_next,
            old_prev,
            old_next,
        })?;
        page.set_prev_data_page(new_prev);
        page.set_next_data_page(new_next);
        Ok(())
    }

    /// Splices a new page into the chain right after `page`. `page` and its
    /// old successor are written; the new page is returned unwritten.
    fn append_page_after(
        &self,
        txn: Option<&Txn>,
        mut page: DomPage,
        next_tid: i16,
    ) -> Result<DomPage> {
        let old_next = page.next_data_page();
        let new_page = self.new_record_page(txn, page.num(), old_next, next_tid)?;
        self.relink(txn, &mut page, None, Some(new_page.num()))?;
        self.write_dom(&page)?;
        if old_next != NO_PAGE {
            let mut next = self.read_dom(old_next)?;
            self.relink(txn, &mut next, Some(new_page.num()), None)?;
            self.write_dom(&next)?;
        }
        Ok(new_page)
    }

    /// Detaches an empty page from its chain and frees it.
    fn remove_page(&self, num: PageNum, prev: PageNum, next: PageNum) -> Result<()> {
        if next != NO_PAGE {
            let mut page = self.read_dom(next)?;
            page.set_prev_data_page(prev);
            self.write_dom(&page)?;
        }
        if prev != NO_PAGE {
            let mut page = self.read_dom(prev)?;
            page.set_next_data_page(next);
            self.write_dom(&page)?;
        }
        self.file.unlink_page(num)?;
        log::debug!("released empty record page {}", num);
        Ok(())
    }

    /// Journals the removal of an empty page and frees it.
    fn release_if_empty(&self, txn: Option<&Txn>, mut page: DomPage) -> Result<()> {
        if page.data_length() > 0 {
            return self.write_dom(&page);
        }
        let (num, prev, next) = (page.num(), page.prev_data_page(), page.next_data_page());
        self.log_to(txn, page.page_mut(), || LogEntry::RemoveEmptyPage {
            page: num,
            prev_page: prev,
            next_page: next,
        })?;
        self.remove_page(num, prev, next)
    }

    fn session_page(&self, txn: Option<&Txn>, session: &mut WriterSession) -> Result<DomPage> {
        if session.current_page != NO_PAGE {
            let page = self.file.read_page(session.current_page)?;
            if page.status() == RECORD {
                return Ok(DomPage::wrap(page));
            }
            log::debug!(
                "page {} of writer session was released, starting a new one",
                session.current_page
            );
        }
        let page = self.new_record_page(txn, NO_PAGE, NO_PAGE, item_id::UNKNOWN_ID)?;
        session.current_page = page.num();
        session.page_count += 1;
        Ok(page)
    }

    /// Moves `value` to an overflow chain when it cannot live in a slot.
    fn prepare_payload(&self, txn: Option<&Txn>, value: &[u8]) -> Result<(Vec<u8>, bool)> {
        if value.is_empty() {
            return Err(Error::EmptyValue);
        }
        if value.len() + LENGTH_TID + LENGTH_DATA_LENGTH > self.file.work_size() {
            let (head, _) = self.write_overflow(txn, value)?;
            return Ok((head.to_be_bytes().to_vec(), true));
        }
        Ok((value.to_vec(), false))
    }

    // Writes

    /// Appends a record to the document being written by `session` and
    /// returns its address.
    pub fn add(&self, txn: Option<&Txn>, session: &mut WriterSession, value: &[u8]) -> Result<u64> {
        self.check_writable("add record")?;
        let (payload, is_overflow) = self.prepare_payload(txn, value)?;
        let needed = LENGTH_TID + LENGTH_DATA_LENGTH + payload.len();

        let mut page = self.session_page(txn, session)?;
        if page.data_length() + needed > page.work_size() || !page.has_room() {
            page = self.append_page_after(txn, page, item_id::UNKNOWN_ID)?;
            session.current_page = page.num();
            session.page_count += 1;
        }

        let tid = page.next_tid()?;
        let num = page.num();
        self.log_to(txn, page.page_mut(), || LogEntry::AddValue {
            page: num,
            tid,
            value: payload.clone(),
            is_overflow,
        })?;
        page.append(&encode_record(tid, &payload, is_overflow))?;
        page.inc_record_count();
        self.write_dom(&page)?;

        self.file.inc_record_count()?;
        self.file.metrics().record_added();
        Ok(create_pointer(num, tid))
    }

    /// Stores `value` and indexes it under `key`.
    pub fn put(
        &self,
        txn: Option<&Txn>,
        session: &mut WriterSession,
        key: &Value,
        value: &[u8],
    ) -> Result<u64> {
        let pointer = self.add(txn, session, value)?;
        self.index.add_value(txn, key, pointer)?;
        Ok(pointer)
    }

    /// Inserts `value` directly after the record at `address` in document
    /// order and returns the new record's address.
    pub fn insert_after(
        &self,
        txn: Option<&Txn>,
        mut session: Option<&mut WriterSession>,
        address: u64,
        value: &[u8],
    ) -> Result<u64> {
        self.check_writable("insert record")?;
        let (payload, is_overflow) = self.prepare_payload(txn, value)?;
        let needed = LENGTH_TID + LENGTH_DATA_LENGTH + payload.len();

        let rec = self.find_record(address, true)?.ok_or_else(|| {
            log::warn!(
                "insert after {}: record not found",
                storage_address::to_display(address)
            );
            Error::NotFound
        })?;
        let mut offset = rec.slot.end();
        let mut page = rec.page;
        let work = page.work_size();

        if offset < page.data_length() {
            if page.data_length() + needed > work || !page.has_room() {
                let (split, split_offset, created) = self.split_data_page(txn, page, offset)?;
                page = split;
                offset = split_offset;
                if let Some(s) = session.as_deref_mut() {
                    s.split_count += 1;
                    s.page_count += created;
                }
                if offset + needed > work || !page.has_room() {
                    let next_tid = page.current_tid();
                    page = self.append_page_after(txn, page, next_tid)?;
                    offset = 0;
                    if let Some(s) = session.as_deref_mut() {
                        s.page_count += 1;
                    }
                }
            }
        } else if page.data_length() + needed > work || !page.has_room() {
            let next_tid = page.current_tid();
            page = self.append_page_after(txn, page, next_tid)?;
            offset = 0;
            if let Some(s) = session.as_deref_mut() {
                s.page_count += 1;
            }
        }

        let tid = page.next_tid()?;
        let num = page.num();
        self.log_to(txn, page.page_mut(), || LogEntry::InsertRecord {
            page: num,
            offset: offset as u32,
            tid,
            value: payload.clone(),
            is_overflow,
        })?;
        page.insert_at(offset, &encode_record(tid, &payload, is_overflow))?;
        page.inc_record_count();
        if page.current_tid() >= item_id::DEFRAG_LIMIT as i16 {
            if let Some(s) = session.as_deref_mut() {
                if !s.defrag_required {
                    log::debug!("page {} passed the defragmentation limit", num);
                }
                s.defrag_required = true;
            }
        }
        self.write_dom(&page)?;

        self.file.inc_record_count()?;
        self.file.metrics().record_added();
        Ok(create_pointer(num, tid))
    }

    /// Resolves `key` and inserts after the record it points to.
    pub fn insert_after_key(
        &self,
        txn: Option<&Txn>,
        session: Option<&mut WriterSession>,
        key: &Value,
        value: &[u8],
    ) -> Result<Option<u64>> {
        match self.find_value(key)? {
            Some(address) => self.insert_after(txn, session, address, value).map(Some),
            None => Ok(None),
        }
    }

    /// Spills a page that ran out of room for forwarding links.
    fn spill_page(&self, txn: Option<&Txn>, mut target: DomPage, next_tid: i16) -> Result<DomPage> {
        let spill = self.new_record_page(txn, target.num(), target.next_data_page(), next_tid)?;
        self.relink(txn, &mut target, None, Some(spill.num()))?;
        target.clean_up()?;
        self.write_dom(&target)?;
        Ok(spill)
    }

    /// Points the link slot at `link_address` to `forward`.
    fn retarget_link(&self, txn: Option<&Txn>, link_address: u64, forward: u64) -> Result<()> {
        let rec = self.find_record(link_address, false)?;
        let (mut page, slot) = match rec {
            Some(RecordPos { page, slot }) if slot.is_link() => (page, slot),
            _ => {
                return Err(self.corrupt(
                    page_from_pointer(link_address),
                    format!(
                        "link {} of a relocated record is missing",
                        storage_address::to_display(link_address)
                    ),
                ))
            }
        };
        let offset = slot.payload_offset();
        let old_link = page.read_u64(offset);
        let num = page.num();
        self.log_to(txn, page.page_mut(), || LogEntry::UpdateLink {
            page: num,
            offset: offset as u32,
            link: forward,
            old_link,
        })?;
        page.write_u64(offset, forward);
        self.write_dom(&page)
    }

    /// Moves every record at or after `split_offset` to new pages, leaving a
    /// forwarding link behind for each. Returns the page that now ends the
    /// kept part, the offset to insert at, and the number of pages created.
    ///
    /// Nothing moves when only links follow the split point.
    fn split_data_page(
        &self,
        txn: Option<&Txn>,
        mut page: DomPage,
        split_offset: usize,
    ) -> Result<(DomPage, usize, usize)> {
        let mut has_records = false;
        for slot in page.slots_from(split_offset) {
            if !slot?.is_link() {
                has_records = true;
                break;
            }
        }
        if !has_records {
            let len = page.data_length();
            return Ok((page, len, 0));
        }

        let work = page.work_size();
        let page_num = page.num();
        let old_data = page.data().to_vec();
        self.log_to(txn, page.page_mut(), || LogEntry::SplitPage {
            page: page_num,
            split_offset: split_offset as u32,
            old_data: old_data.clone(),
        })?;
        page.truncate(split_offset);
        self.file.metrics().page_split();
        log::debug!("splitting record page {} at offset {}", page_num, split_offset);

        let next_tid = page.current_tid();
        let mut created = 1;
        let mut split = self.new_record_page(txn, page_num, NO_PAGE, next_tid)?;
        let first_split = split.num();
        let mut target = page;

        for slot in slots_of(&old_data, page_num, split_offset) {
            let slot = slot?;
            if slot.is_link() {
                if target.data_length() + LINK_SLOT_LEN > work {
                    target = self.spill_page(txn, target, next_tid)?;
                    created += 1;
                }
                let link = get_u64(&old_data, slot.payload_offset());
                let (target_num, tid) = (target.num(), slot.tid);
                self.log_to(txn, target.page_mut(), || LogEntry::AddLink {
                    page: target_num,
                    tid,
                    link,
                })?;
                target.append(&encode_link(tid, link))?;
                target.inc_record_count();
                continue;
            }

            let stored = &old_data[slot.payload_offset()..slot.end()];
            let moved_head;
            let (payload, is_overflow) = if !slot.is_overflow()
                && LENGTH_TID + LENGTH_DATA_LENGTH + LENGTH_ORIGINAL_LOCATION + stored.len() > work
            {
                let (head, _) = self.write_overflow(txn, stored)?;
                moved_head = head.to_be_bytes();
                (&moved_head[..], true)
            } else {
                (stored, slot.is_overflow())
            };
            let moved_len =
                LENGTH_TID + LENGTH_DATA_LENGTH + LENGTH_ORIGINAL_LOCATION + payload.len();

            if split.data_length() + moved_len > work {
                let next = self.new_record_page(txn, split.num(), NO_PAGE, next_tid)?;
                created += 1;
                self.relink(txn, &mut split, None, Some(next.num()))?;
                split.clean_up()?;
                self.write_dom(&split)?;
                split = next;
            }

            let id = slot.id();
            let back_link = match slot.back_link_offset() {
                Some(off) => {
                    let back_link = get_u64(&old_data, off);
                    self.retarget_link(txn, back_link, create_pointer(split.num(), id))?;
                    back_link
                }
                None => {
                    if target.data_length() + LINK_SLOT_LEN > work {
                        target = self.spill_page(txn, target, next_tid)?;
                        created += 1;
                    }
                    create_pointer(target.num(), id)
                }
            };

            let split_num = split.num();
            self.log_to(txn, split.page_mut(), || LogEntry::AddMovedValue {
                page: split_num,
                tid: slot.tid,
                value: payload.to_vec(),
                back_link,
                is_overflow,
            })?;
            split.append(&encode_moved(id, payload, back_link, is_overflow))?;
            split.inc_record_count();
            self.file.metrics().record_relocated();

            if !slot.is_relocated() {
                let link = create_pointer(split_num, id);
                let target_num = target.num();
                self.log_to(txn, target.page_mut(), || LogEntry::AddLink {
                    page: target_num,
                    tid: id,
                    link,
                })?;
                target.append(&encode_link(id, link))?;
                target.inc_record_count();
            }
        }

        let last_split = split.num();
        let after = target.next_data_page();
        self.relink(txn, &mut split, None, Some(after))?;
        split.clean_up()?;
        if last_split == first_split {
            self.relink(txn, &mut split, Some(target.num()), None)?;
            self.write_dom(&split)?;
        } else {
            self.write_dom(&split)?;
            let mut first = self.read_dom(first_split)?;
            self.relink(txn, &mut first, Some(target.num()), None)?;
            self.write_dom(&first)?;
        }
        if after != NO_PAGE {
            let mut next = self.read_dom(after)?;
            self.relink(txn, &mut next, Some(last_split), None)?;
            self.write_dom(&next)?;
        }
        self.relink(txn, &mut target, None, Some(first_split))?;
        target.clean_up()?;
        self.write_dom(&target)?;

        let offset = target.data_length();
        Ok((target, offset, created))
    }

    /// Overwrites a record in place. The new value must have the stored length.
    pub fn update(&self, txn: Option<&Txn>, pointer: u64, value: &[u8]) -> Result<()> {
        self.check_writable("update record")?;
        let RecordPos { mut page, slot } =
            self.find_record(pointer, true)?.ok_or(Error::NotFound)?;
        let num = page.num();
        let offset = slot.payload_offset();

        if slot.is_overflow() {
            let head = page.read_u64(offset);
            let old_len = self.read_overflow(head)?.len();
            if old_len != value.len() {
                return Err(Error::LengthMismatch {
                    expected: old_len,
                    actual: value.len(),
                });
            }
            let (new_head, _) = self.write_overflow(txn, value)?;
            self.log_to(txn, page.page_mut(), || LogEntry::UpdateValue {
                page: num,
                tid: slot.tid,
                value: new_head.to_be_bytes().to_vec(),
                old_value: head.to_be_bytes().to_vec(),
            })?;
            page.write_u64(offset, new_head);
            self.write_dom(&page)?;
            self.delete_overflow(txn, head)?;
            return Ok(());
        }

        if value.len() != slot.value_len() {
            return Err(Error::LengthMismatch {
                expected: slot.value_len(),
                actual: value.len(),
            });
        }
        let old_value = page.bytes(offset, value.len()).to_vec();
        self.log_to(txn, page.page_mut(), || LogEntry::UpdateValue {
            page: num,
            tid: slot.tid,
            value: value.to_vec(),
            old_value,
        })?;
        page.bytes_mut(offset, value.len()).copy_from_slice(value);
        self.write_dom(&page)
    }

    /// Updates the record indexed under `key`. False when the key is unknown.
    pub fn update_by_key(&self, txn: Option<&Txn>, key: &Value, value: &[u8]) -> Result<bool> {
        match self.find_value(key)? {
            Some(pointer) => {
                self.update(txn, pointer, value)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Excises the record at `pointer`. A relocated record takes its link
    /// with it, an overflow record its chain. Pages left empty are freed.
    pub fn remove_node(&self, txn: Option<&Txn>, pointer: u64) -> Result<()> {
        self.check_writable("remove record")?;
        let rec = self.find_record(pointer, true)?.ok_or_else(|| {
            log::warn!(
                "remove {}: record not found",
                storage_address::to_display(pointer)
            );
            Error::NotFound
        })?;

        let mut back_link = 0;
        let rec = match rec.slot.back_link_offset() {
            Some(off) => {
                back_link = rec.page.read_u64(off);
                let address = rec.address();
                self.remove_link(txn, back_link)?;
                // The link page may have been a neighbour of this one
                self.find_record(address, false)?.ok_or_else(|| {
                    self.corrupt(page_from_pointer(address), "relocated record vanished")
                })?
            }
            None => rec,
        };

        let RecordPos { mut page, slot } = rec;
        let payload = page.bytes(slot.payload_offset(), slot.value_len()).to_vec();
        if slot.is_overflow() {
            self.delete_overflow(txn, get_u64(&payload, 0))?;
        }

        let num = page.num();
        self.log_to(txn, page.page_mut(), || LogEntry::RemoveValue {
            page: num,
            tid: slot.tid,
            offset: slot.offset as u32,
            old_data: payload,
            is_overflow: slot.is_overflow(),
            back_link,
        })?;
        page.remove_at(slot.offset, slot.len())?;
        page.dec_record_count();
        self.file.dec_record_count()?;
        self.file.metrics().record_removed();
        self.release_if_empty(txn, page)
    }

    /// Excises the link slot at `pointer`.
    fn remove_link(&self, txn: Option<&Txn>, pointer: u64) -> Result<()> {
        let (mut page, slot) = match self.find_record(pointer, false)? {
            Some(RecordPos { page, slot }) if slot.is_link() => (page, slot),
            _ => {
                return Err(self.corrupt(
                    page_from_pointer(pointer),
                    format!("no link slot at {}", storage_address::to_display(pointer)),
                ))
            }
        };
        let num = page.num();
        let link = page.bytes(slot.payload_offset(), LENGTH_LINK).to_vec();
        self.log_to(txn, page.page_mut(), || LogEntry::RemoveValue {
            page: num,
            tid: slot.tid,
            offset: slot.offset as u32,
            old_data: link,
            is_overflow: false,
            back_link: 0,
        })?;
        page.remove_at(slot.offset, slot.len())?;
        page.dec_record_count();
        self.release_if_empty(txn, page)
    }

    /// Removes the record and its index entry.
    pub fn remove(&self, txn: Option<&Txn>, key: &Value, pointer: u64) -> Result<()> {
        self.remove_node(txn, pointer)?;
        self.index.remove_value(txn, key)?;
        Ok(())
    }

    /// Removes the record indexed under `key`. False when the key is unknown.
    pub fn remove_by_key(&self, txn: Option<&Txn>, key: &Value) -> Result<bool> {
        match self.find_value(key)? {
            Some(pointer) => {
                self.remove(txn, key, pointer)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Frees the whole page chain starting at the page of `pointer`.
    /// Returns the number of pages released.
    pub fn remove_all(&self, txn: Option<&Txn>, pointer: u64) -> Result<usize> {
        self.check_writable("remove document")?;
        let first = page_from_pointer(pointer);
        let mut num = first;
        let mut count = 0;
        while num != NO_PAGE {
            if count >= MAX_CHAIN_LENGTH {
                return Err(self.corrupt(first, "page chain does not terminate"));
            }
            let mut page = self.read_dom(num)?;
            let next = page.next_data_page();
            if next == num {
                return Err(self.corrupt(num, "page links to itself"));
            }
            let (prev, old_data, old_tid, old_record_count) = (
                page.prev_data_page(),
                page.data().to_vec(),
                page.current_tid(),
                page.record_count(),
            );
            self.log_to(txn, page.page_mut(), || LogEntry::RemovePage {
                page: num,
                prev_page: prev,
                next_page: next,
                old_data,
                old_tid,
                old_record_count,
            })?;
            for _ in 0..old_record_count {
                self.file.dec_record_count()?;
            }
            self.file.unlink_page(num)?;
            count += 1;
            num = next;
        }
        log::debug!("removed {} pages starting at {}", count, first);
        Ok(count)
    }

    // Binary resources

    /// Stores a binary resource as an overflow chain. Returns the head page
    /// and the number of pages.
    pub fn add_binary(&self, txn: Option<&Txn>, data: &[u8]) -> Result<(PageNum, usize)> {
        self.check_writable("add binary")?;
        self.write_overflow(txn, data)
    }

    pub fn add_binary_stream(
        &self,
        txn: Option<&Txn>,
        mut reader: impl Read,
    ) -> Result<(PageNum, usize)> {
        self.check_writable("add binary")?;
        self.write_overflow_stream(txn, &mut reader)
    }

    pub fn get_binary(&self, page: PageNum) -> Result<Vec<u8>> {
        self.read_overflow(page)
    }

    /// Streams a binary resource into `out`. Returns the byte count.
    pub fn read_binary(&self, page: PageNum, mut out: impl Write) -> Result<u64> {
        self.stream_overflow(page, &mut out)
    }

    pub fn remove_binary(&self, txn: Option<&Txn>, page: PageNum) -> Result<usize> {
        self.check_writable("remove binary")?;
        self.delete_overflow(txn, page)
    }

    // Reads

    /// Resolves `pointer` to its record. Links are followed when
    /// `skip_links` is set. A tid missing from its page is looked up in the
    /// following pages, where split pages park forwarding links.
    pub fn find_record(&self, pointer: u64, skip_links: bool) -> Result<Option<RecordPos>> {
        if !storage_address::is_valid(pointer) {
            return Ok(None);
        }
        let mut num = page_from_pointer(pointer);
        let mut tid = tid_from_pointer(pointer);
        let mut followed_link = false;
        let mut searching = false;
        let mut hops = 0;

        while num != NO_PAGE {
            hops += 1;
            if hops > MAX_LOOKUP_HOPS {
                return Err(self.corrupt(num, "address lookup does not terminate"));
            }
            if num >= self.file.total_count() {
                return Ok(None);
            }
            let page = self.file.read_page(num)?;
            if page.status() != RECORD {
                return Ok(None);
            }
            let page = DomPage::wrap(page);
            match page.find_slot(tid)? {
                Some(slot) if searching && !slot.is_link() => return Ok(None),
                Some(slot) if slot.is_link() && skip_links => {
                    if followed_link {
                        return Err(self.corrupt(num, "forwarding link points at another link"));
                    }
                    let forward = page.read_u64(slot.payload_offset());
                    if page_from_pointer(forward) == num {
                        return Err(self.corrupt(num, "forwarding link points at its own page"));
                    }
                    followed_link = true;
                    searching = false;
                    num = page_from_pointer(forward);
                    tid = tid_from_pointer(forward);
                }
                Some(slot) => return Ok(Some(RecordPos { page, slot })),
                None => {
                    if followed_link {
                        return Ok(None);
                    }
                    let next = page.next_data_page();
                    if next == num {
                        return Err(self.corrupt(num, "page links to itself"));
                    }
                    // A stale address may resolve to a later link that reuses its tid.
                    searching = true;
                    num = next;
                }
            }
        }
        Ok(None)
    }

    /// Payload of a resolved slot, with its logical address attached.
    pub(crate) fn slot_value(&self, page: &DomPage, slot: &Slot) -> Result<Value> {
        let address = match slot.back_link_offset() {
            Some(off) => page.read_u64(off),
            None => create_pointer(page.num(), slot.id()),
        };
        let data = if slot.is_overflow() {
            self.read_overflow(page.read_u64(slot.payload_offset()))?
        } else {
            page.bytes(slot.payload_offset(), slot.value_len()).to_vec()
        };
        Ok(Value::with_address(data, address))
    }

    /// Record at `pointer`, `None` when nothing lives there.
    pub fn get(&self, pointer: u64) -> Result<Option<Value>> {
        match self.find_record(pointer, true)? {
            Some(rec) => {
                let mut value = self.slot_value(&rec.page, &rec.slot)?;
                value.set_address(pointer);
                Ok(Some(value))
            }
            None => {
                log::debug!("no record at {}", storage_address::to_display(pointer));
                Ok(None)
            }
        }
    }

    pub fn get_by_key(&self, key: &Value) -> Result<Option<Value>> {
        match self.find_value(key)? {
            Some(pointer) => self.get(pointer),
            None => Ok(None),
        }
    }

    /// Address indexed under `key`.
    pub fn find_value(&self, key: &Value) -> Result<Option<u64>> {
        let pointer = self.index.find_value(key)?;
        Ok(if pointer == KEY_NOT_FOUND {
            None
        } else {
            Some(pointer)
        })
    }

    /// Keys matching `query`, in key order.
    pub fn find_keys(&self, query: &IndexQuery) -> Result<Vec<Value>> {
        let mut keys = Vec::new();
        self.index.query(query, |key, _| {
            keys.push(key.clone());
            true
        })?;
        Ok(keys)
    }

    /// Records whose keys match `query`, in key order. Dangling index
    /// entries are skipped.
    pub fn find_values(&self, query: &IndexQuery) -> Result<Vec<Value>> {
        let mut pointers = Vec::new();
        self.index.query(query, |_, pointer| {
            pointers.push(pointer);
            true
        })?;
        let mut values = Vec::with_capacity(pointers.len());
        for pointer in pointers {
            match self.get(pointer)? {
                Some(value) => values.push(value),
                None => log::warn!(
                    "index entry points at missing record {}",
                    storage_address::to_display(pointer)
                ),
            }
        }
        Ok(values)
    }

    /// Forgets the current page of `session`; the next add starts a new chain.
    pub fn close_document(&self, session: &mut WriterSession) {
        if let Some(page) = session.current_page() {
            log::debug!(
                "closing document ending at page {} ({} pages)",
                page,
                session.page_count
            );
        }
        session.current_page = NO_PAGE;
    }

    // Diagnostics

    /// Pages of the chain starting at `first`, checking that the prev and
    /// next links agree.
    pub fn page_chain(&self, first: PageNum) -> Result<Vec<PageNum>> {
        let mut pages = Vec::new();
        let mut prev = NO_PAGE;
        let mut num = first;
        while num != NO_PAGE {
            if pages.len() >= MAX_CHAIN_LENGTH || pages.contains(&num) {
                return Err(self.corrupt(num, "page chain contains a cycle"));
            }
            let page = self.read_dom(num)?;
            if page.prev_data_page() != prev {
                return Err(self.corrupt(
                    num,
                    format!(
                        "prev link {} does not match predecessor {}",
                        page.prev_data_page(),
                        prev
                    ),
                ));
            }
            pages.push(num);
            prev = num;
            num = page.next_data_page();
        }
        Ok(pages)
    }

    /// Header line plus one line per slot of a record page.
    pub fn debug_page_contents(&self, num: PageNum) -> Result<String> {
        let page = self.read_dom(num)?;
        Ok(format!("{}\n{}", page.header_summary(), page.describe_slots()))
    }

    /// Generic and record header of a page with a hex dump of its bytes.
    pub fn dump_page_header(&self, num: PageNum) -> Result<String> {
        let page = DomPage::wrap(self.file.read_page(num)?);
        Ok(format!("{}\n{}", page.header_summary(), self.file.dump_page(num)?))
    }

    pub fn stats(&self) -> StoreStats {
        self.file.metrics().snapshot()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.file.buffer_stats()
    }

    /// Number of records stored, as kept in the file header.
    pub fn record_count(&self) -> u64 {
        self.file.header().record_count
    }

    // Durability

    /// Writes the journal, then every dirty page and the header.
    pub fn flush(&self) -> Result<()> {
        if let Some(journal) = self.journal.as_ref() {
            journal.flush()?;
        }
        self.index.flush()
    }

    /// Flushes and truncates the journal.
    pub fn checkpoint(&self) -> Result<()> {
        self.flush()?;
        if let Some(journal) = self.journal.as_ref() {
            journal.checkpoint()?;
            log::debug!("checkpoint of {}", self.file.path().display());
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if !self.file.is_read_only() {
            self.checkpoint()?;
        }
        if let Some(journal) = self.journal.as_ref() {
            journal.close()?;
        }
        self.index.close()
    }

    // Recovery

    fn page_for_redo(&self, record: &LogRecord, num: PageNum) -> Result<Option<DomPage>> {
        self.file.ensure_allocated(num)?;
        let page = self.file.read_page(num)?;
        if page.lsn() == LSN_INVALID || record.lsn <= page.lsn() {
            return Ok(None);
        }
        Ok(Some(DomPage::wrap(page)))
    }

    fn slot_for_replay(&self, page: &DomPage, tid: u16) -> Result<Slot> {
        page.find_slot(tid)?.ok_or_else(|| {
            self.corrupt(
                page.num(),
                format!("record {} missing during replay", item_id::get_id(tid)),
            )
        })
    }

    fn raise_tid(page: &mut DomPage, tid: u16) -> Result<()> {
        let id = item_id::get_id(tid) as i16;
        if id > page.current_tid() {
            page.set_current_tid(id)?;
        }
        Ok(())
    }

    /// Gives back the newest tid when the record that took it is undone.
    fn release_tid(page: &mut DomPage, tid: u16) -> Result<()> {
        let id = item_id::get_id(tid) as i16;
        if page.current_tid() == id {
            page.set_current_tid(id - 1)?;
        }
        Ok(())
    }

    /// Reapplies a journaled change unless the page already carries it.
    pub fn redo(&self, record: &LogRecord) -> Result<()> {
        if record.entry.is_control() {
            return Ok(());
        }
        if record.entry.is_btree() {
            return self.index.redo(record);
        }
        let lsn = record.lsn;
        let applied = match &record.entry {
            LogEntry::CreatePage {
                page,
                prev_page,
                next_page,
                next_tid,
            } => {
                self.file.ensure_allocated(*page)?;
                let current = self.file.read_page(*page)?;
                if current.lsn() != LSN_INVALID && lsn <= current.lsn() {
                    false
                } else {
                    self.file.reclaim_free_page(*page)?;
                    let mut dp = DomPage::init(self.file.new_page(*page));
                    dp.set_prev_data_page(*prev_page);
                    dp.set_next_data_page(*next_page);
                    dp.set_current_tid(*next_tid)?;
                    dp.set_lsn(lsn);
                    self.write_dom(&dp)?;
                    true
                }
            }
            LogEntry::WriteOverflow {
                page,
                next_page,
                value,
            } => {
                self.file.ensure_allocated(*page)?;
                let current = self.file.read_page(*page)?;
                if current.lsn() != LSN_INVALID && lsn <= current.lsn() {
                    false
                } else {
                    self.file.reclaim_free_page(*page)?;
                    self.restore_overflow_page(*page, *next_page, value, Some(lsn))?;
                    true
                }
            }
            LogEntry::RemoveOverflow { page, .. } | LogEntry::RemovePage { page, .. } => {
                match self.page_for_redo(record, *page)? {
                    Some(_) => {
                        self.file.unlink_page(*page)?;
                        true
                    }
                    None => false,
                }
            }
            LogEntry::RemoveEmptyPage {
                page,
                prev_page,
                next_page,
            } => match self.page_for_redo(record, *page)? {
                Some(_) => {
                    self.remove_page(*page, *prev_page, *next_page)?;
                    true
                }
                None => false,
            },
            entry => {
                let num = entry.page().unwrap_or(NO_PAGE);
                match self.page_for_redo(record, num)? {
                    Some(mut dp) => {
                        self.redo_in_page(&mut dp, entry)?;
                        dp.set_lsn(lsn);
                        self.write_dom(&dp)?;
                        true
                    }
                    None => false,
                }
            }
        };
        if applied {
            self.file.metrics().redo();
        }
        Ok(())
    }

    fn redo_in_page(&self, page: &mut DomPage, entry: &LogEntry) -> Result<()> {
        match entry {
            LogEntry::AddValue {
                tid,
                value,
                is_overflow,
                ..
            } => {
                page.append(&encode_record(*tid, value, *is_overflow))?;
                page.inc_record_count();
                Self::raise_tid(page, *tid)?;
            }
            LogEntry::InsertRecord {
                offset,
                tid,
                value,
                is_overflow,
                ..
            } => {
                page.insert_at(*offset as usize, &encode_record(*tid, value, *is_overflow))?;
                page.inc_record_count();
                Self::raise_tid(page, *tid)?;
            }
            LogEntry::RemoveValue { tid, .. } => {
                let slot = self.slot_for_replay(page, *tid)?;
                page.remove_at(slot.offset, slot.len())?;
                page.dec_record_count();
            }
            LogEntry::UpdateValue { tid, value, .. } => {
                let slot = self.slot_for_replay(page, *tid)?;
                if slot.value_len() != value.len() {
                    return Err(self.corrupt(page.num(), "update length differs from record"));
                }
                page.bytes_mut(slot.payload_offset(), value.len())
                    .copy_from_slice(value);
            }
            LogEntry::SplitPage { split_offset, .. } => {
                page.truncate(*split_offset as usize);
                page.clean_up()?;
            }
            LogEntry::AddLink { tid, link, .. } => {
                page.append(&encode_link(*tid, *link))?;
                page.inc_record_count();
                Self::raise_tid(page, *tid)?;
            }
            LogEntry::AddMovedValue {
                tid,
                value,
                back_link,
                is_overflow,
                ..
            } => {
                page.append(&encode_moved(*tid, value, *back_link, *is_overflow))?;
                page.inc_record_count();
                Self::raise_tid(page, *tid)?;
            }
            LogEntry::UpdateHeader {
                prev_page,
                next_page,
                ..
            } => {
                page.set_prev_data_page(*prev_page);
                page.set_next_data_page(*next_page);
            }
            LogEntry::UpdateLink { offset, link, .. } => {
                page.write_u64(*offset as usize, *link);
            }
            other => {
                return Err(self.corrupt(page.num(), format!("cannot redo {}", other)));
            }
        }
        Ok(())
    }

    /// Restores a page freed by a change that is being undone.
    fn reclaim_page(&self, num: PageNum, prev: PageNum, next: PageNum) -> Result<DomPage> {
        self.file.reclaim_free_page(num)?;
        let mut page = DomPage::init(self.file.new_page(num));
        page.set_prev_data_page(prev);
        page.set_next_data_page(next);
        Ok(page)
    }

    /// Reverses a journaled change using the old state it carries.
    pub fn undo(&self, record: &LogRecord) -> Result<()> {
        if record.entry.is_control() {
            return Ok(());
        }
        if record.entry.is_btree() {
            self.index.undo(record)?;
            self.file.metrics().undo();
            return Ok(());
        }
        match &record.entry {
            LogEntry::CreatePage { page, .. } | LogEntry::WriteOverflow { page, .. } => {
                self.file.unlink_page(*page)?;
            }
            LogEntry::RemoveOverflow {
                page,
                next_page,
                old_data,
            } => {
                self.file.reclaim_free_page(*page)?;
                self.restore_overflow_page(*page, *next_page, old_data, None)?;
            }
            LogEntry::RemoveEmptyPage {
                page,
                prev_page,
                next_page,
            } => {
                let restored = self.reclaim_page(*page, *prev_page, *next_page)?;
                self.write_dom(&restored)?;
                if *prev_page != NO_PAGE {
                    let mut prev = self.read_dom(*prev_page)?;
                    prev.set_next_data_page(*page);
                    self.write_dom(&prev)?;
                }
                if *next_page != NO_PAGE {
                    let mut next = self.read_dom(*next_page)?;
                    next.set_prev_data_page(*page);
                    self.write_dom(&next)?;
                }
            }
            LogEntry::RemovePage {
                page,
                prev_page,
                next_page,
                old_data,
                old_tid,
                old_record_count,
            } => {
                let mut restored = self.reclaim_page(*page, *prev_page, *next_page)?;
                restored.set_data(old_data)?;
                restored.set_current_tid(*old_tid)?;
                restored.set_record_count(*old_record_count);
                self.write_dom(&restored)?;
                for _ in 0..*old_record_count {
                    self.file.inc_record_count()?;
                }
            }
            entry => {
                let num = entry.page().unwrap_or(NO_PAGE);
                let mut page = self.read_dom(num)?;
                self.undo_in_page(&mut page, entry)?;
                self.write_dom(&page)?;
                match entry {
                    LogEntry::AddValue { .. } | LogEntry::InsertRecord { .. } => {
                        self.file.dec_record_count()?
                    }
                    LogEntry::RemoveValue { tid, .. } if !item_id::is_link(*tid) => {
                        self.file.inc_record_count()?
                    }
                    _ => {}
                }
            }
        }
        self.file.metrics().undo();
        Ok(())
    }

    fn undo_in_page(&self, page: &mut DomPage, entry: &LogEntry) -> Result<()> {
        match entry {
            LogEntry::AddValue { tid, .. } => {
                let slot = self.slot_for_replay(page, *tid)?;
                page.remove_at(slot.offset, slot.len())?;
                page.dec_record_count();
                Self::release_tid(page, *tid)?;
            }
            LogEntry::AddLink { tid, .. } | LogEntry::AddMovedValue { tid, .. } => {
                let slot = self.slot_for_replay(page, *tid)?;
                page.remove_at(slot.offset, slot.len())?;
                page.dec_record_count();
            }
            LogEntry::InsertRecord { offset, tid, .. } => {
                let slot = page.slot_at(*offset as usize)?;
                if !item_id::matches(slot.tid, *tid) {
                    return Err(self.corrupt(
                        page.num(),
                        format!("expected record {} at offset {}", tid, offset),
                    ));
                }
                page.remove_at(slot.offset, slot.len())?;
                page.dec_record_count();
                Self::release_tid(page, *tid)?;
            }
            LogEntry::RemoveValue {
                tid,
                offset,
                old_data,
                is_overflow,
                back_link,
                ..
            } => {
                let bytes = if item_id::is_link(*tid) {
                    encode_link(*tid, get_u64(old_data, 0))
                } else if item_id::is_relocated(*tid) {
                    encode_moved(*tid, old_data, *back_link, *is_overflow)
                } else {
                    encode_record(*tid, old_data, *is_overflow)
                };
                page.insert_at(*offset as usize, &bytes)?;
                page.inc_record_count();
                Self::raise_tid(page, *tid)?;
            }
            LogEntry::UpdateValue { tid, old_value, .. } => {
                let slot = self.slot_for_replay(page, *tid)?;
                page.bytes_mut(slot.payload_offset(), old_value.len())
                    .copy_from_slice(old_value);
            }
            LogEntry::SplitPage { old_data, .. } => {
                page.set_data(old_data)?;
                page.clean_up()?;
            }
            LogEntry::UpdateHeader {
                old_prev, old_next, ..
            } => {
                page.set_prev_data_page(*old_prev);
                page.set_next_data_page(*old_next);
            }
            LogEntry::UpdateLink {
                offset, old_link, ..
            } => {
                page.write_u64(*offset as usize, *old_link);
            }
            other => {
                return Err(self.corrupt(page.num(), format!("cannot undo {}", other)));
            }
        }
        Ok(())
    }
}
