//! Overflow page chains.
//!
//! Values too large for a record slot, and binary resources, are stored as
//! a chain of `OVERFLOW` pages linked through the generic `next_page` field.
//! Each page carries one work-size chunk.

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::journal::Txn;
use crate::core::loggable::LogEntry;
use crate::core::paged::{Page, PagedStore};
use crate::core::record_store::RecordStore;
use std::io::{ErrorKind, Read, Write};

/// Reads until `buf` is full or the reader is exhausted.
fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

impl RecordStore {
    fn create_overflow_page(&self) -> Result<Page> {
        let mut page = self.file().get_free_page(true)?;
        page.clear();
        page.set_status(OVERFLOW);
        page.set_next_page(NO_PAGE);
        self.file().metrics().overflow_page();
        Ok(page)
    }

    fn write_chunk(
        &self,
        txn: Option<&Txn>,
        page: &mut Page,
        chunk: &[u8],
        next: PageNum,
    ) -> Result<()> {
        page.set_status(OVERFLOW);
        page.set_data(chunk)?;
        page.set_next_page(next);
        let num = page.num();
        self.log_to(txn, page, || LogEntry::WriteOverflow {
            page: num,
            next_page: next,
            value: chunk.to_vec(),
        })?;
        self.file().write_page(page)
    }

    /// Writes `data` to a new chain. Returns the head page and the number of
    /// pages used. An empty buffer still takes one page.
    pub(crate) fn write_overflow(&self, txn: Option<&Txn>, data: &[u8]) -> Result<(PageNum, usize)> {
        let work = self.file().work_size();
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(work).collect()
        };

        let mut page = self.create_overflow_page()?;
        let head = page.num();
        for (i, chunk) in chunks.iter().enumerate() {
            let next = if i + 1 < chunks.len() {
                Some(self.create_overflow_page()?)
            } else {
                None
            };
            let next_num = next.as_ref().map(|p| p.num()).unwrap_or(NO_PAGE);
            self.write_chunk(txn, &mut page, chunk, next_num)?;
            if let Some(next) = next {
                page = next;
            }
        }
        log::debug!(
            "wrote {} bytes to overflow chain at {} ({} pages)",
            data.len(),
            head,
            chunks.len()
        );
        Ok((head, chunks.len()))
    }

    /// Streams `reader` into a new chain. One chunk is held back until the
    /// next read shows whether it is the last, so the final page is always
    /// the one carrying a partial (or exactly full) chunk.
    pub(crate) fn write_overflow_stream(
        &self,
        txn: Option<&Txn>,
        reader: &mut dyn Read,
    ) -> Result<(PageNum, usize)> {
        let work = self.file().work_size();
        let mut current = vec![0u8; work];
        let mut spare = vec![0u8; work];
        let mut len = fill(reader, &mut current)?;

        let mut page = self.create_overflow_page()?;
        let head = page.num();
        let mut count = 0;
        let mut total = 0u64;
        loop {
            let next_len = if len == work {
                fill(reader, &mut spare)?
            } else {
                0
            };
            count += 1;
            total += len as u64;
            if next_len == 0 {
                self.write_chunk(txn, &mut page, &current[..len], NO_PAGE)?;
                break;
            }
            let next = self.create_overflow_page()?;
            self.write_chunk(txn, &mut page, &current[..len], next.num())?;
            page = next;
            std::mem::swap(&mut current, &mut spare);
            len = next_len;
        }
        log::debug!(
            "streamed {} bytes to overflow chain at {} ({} pages)",
            total,
            head,
            count
        );
        Ok((head, count))
    }

    fn overflow_page(&self, num: PageNum) -> Result<Page> {
        let page = self.file().read_page(num)?;
        // === CORRUPTION DETECTION VALIDATION ===
        if page.status() != OVERFLOW {
            return Err(self.corrupt(
                num,
                format!("expected an overflow page, found status {}", page.status()),
            ));
        }
        Ok(page)
    }

    /// Copies the chain starting at `head` into `out`. Returns the byte count.
    pub(crate) fn stream_overflow(&self, head: PageNum, out: &mut dyn Write) -> Result<u64> {
        let mut num = head;
        let mut total = 0u64;
        let mut hops = 0usize;
        while num != NO_PAGE {
            hops += 1;
            // === CORRUPTION DETECTION VALIDATION ===
            if hops > MAX_CHAIN_LENGTH {
                return Err(self.corrupt(head, "overflow chain does not terminate"));
            }
            let page = self.overflow_page(num)?;
            out.write_all(page.data())?;
            total += page.data().len() as u64;
            num = page.next_page();
        }
        Ok(total)
    }

    pub(crate) fn read_overflow(&self, head: PageNum) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.stream_overflow(head, &mut out)?;
        Ok(out)
    }

    /// Frees every page of the chain, journaling each page's content.
    pub(crate) fn delete_overflow(&self, txn: Option<&Txn>, head: PageNum) -> Result<usize> {
        let mut num = head;
        let mut count = 0usize;
        while num != NO_PAGE {
            // === CORRUPTION DETECTION VALIDATION ===
            if count >= MAX_CHAIN_LENGTH {
                return Err(self.corrupt(head, "overflow chain does not terminate"));
            }
            let mut page = self.overflow_page(num)?;
            let next = page.next_page();
            let old_data = page.data().to_vec();
            self.log_to(txn, &mut page, || LogEntry::RemoveOverflow {
                page: num,
                next_page: next,
                old_data,
            })?;
            self.file().unlink_page(num)?;
            count += 1;
            num = next;
        }
        log::debug!("removed overflow chain at {} ({} pages)", head, count);
        Ok(count)
    }

    /// Rewrites one chain page, for redo of a write and undo of a removal.
    pub(crate) fn restore_overflow_page(
        &self,
        num: PageNum,
        next: PageNum,
        data: &[u8],
        lsn: Option<Lsn>,
    ) -> Result<()> {
        let mut page = self.file().new_page(num);
        page.set_status(OVERFLOW);
        page.set_data(data)?;
        page.set_next_page(next);
        if let Some(lsn) = lsn {
            page.set_lsn(lsn);
        }
        self.file().write_page(&page)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::errors::Error;
    use crate::core::options::StoreOptions;
    use crate::core::paged::PagedStore;
    use crate::core::record_store::RecordStore;
    use std::fs;

    fn cleanup(path: &str) {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(format!("{}.lock", path));
        let _ = fs::remove_file(format!("{}.journal", path));
    }

    fn options() -> StoreOptions {
        StoreOptions {
            page_size: 256,
            recovery_enabled: false,
            ..Default::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_chunk_boundaries() {
        let path = "/tmp/test_overflow_chunks.dbx";
        cleanup(path);

        let store = RecordStore::open(path, &options()).unwrap();
        let work = store.file().work_size();
        for (len, pages) in [(work - 1, 1), (work, 1), (work + 1, 2), (3 * work + 17, 4)] {
            let data = pattern(len);
            let (head, count) = store.write_overflow(None, &data).unwrap();
            assert_eq!(count, pages, "page count for {} bytes", len);
            assert_eq!(store.read_overflow(head).unwrap(), data);
        }

        drop(store);
        cleanup(path);
    }

    #[test]
    fn test_stream_matches_buffer_write() {
        let path = "/tmp/test_overflow_stream.dbx";
        cleanup(path);

        let store = RecordStore::open(path, &options()).unwrap();
        let work = store.file().work_size();
        for len in [0, 1, work, 2 * work, 2 * work + 5] {
            let data = pattern(len);
            let (head, count) = store
                .write_overflow_stream(None, &mut data.as_slice())
                .unwrap();
            assert_eq!(count, std::cmp::max(1, (len + work - 1) / work));
            let mut out = Vec::new();
            assert_eq!(store.stream_overflow(head, &mut out).unwrap(), len as u64);
            assert_eq!(out, data);
        }

        drop(store);
        cleanup(path);
    }

    #[test]
    fn test_delete_returns_pages_to_free_list() {
        let path = "/tmp/test_overflow_delete.dbx";
        cleanup(path);

        let store = RecordStore::open(path, &options()).unwrap();
        let work = store.file().work_size();
        let (head, count) = store.write_overflow(None, &pattern(2 * work + 1)).unwrap();
        assert_eq!(store.delete_overflow(None, head).unwrap(), count);

        let free = store.file().free_pages().unwrap();
        assert_eq!(free.len(), count);
        assert!(free.contains(&head));
        assert!(store.read_overflow(head).is_err());

        drop(store);
        cleanup(path);
    }

    #[test]
    fn test_cyclic_chain_is_corruption() {
        let path = "/tmp/test_overflow_cycle.dbx";
        cleanup(path);

        let store = RecordStore::open(path, &options()).unwrap();
        let work = store.file().work_size();
        let (head, count) = store.write_overflow(None, &pattern(2 * work)).unwrap();
        assert_eq!(count, 2);
        let tail = store.file().read_page(head).unwrap().next_page();
        let mut page = store.file().read_page(tail).unwrap();
        page.set_next_page(head);
        store.file().write_page(&page).unwrap();

        assert!(matches!(
            store.stream_overflow(head, &mut std::io::sink()),
            Err(Error::Corruption { .. })
        ));
        assert!(matches!(
            store.delete_overflow(None, head),
            Err(Error::Corruption { .. })
        ));

        drop(store);
        cleanup(path);
    }
}
