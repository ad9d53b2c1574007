use crate::core::buffer_pool::{get_page_buffer, put_page_buffer};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::options::StoreOptions;
use crate::core::page_cache::{PageCache, PinGuard};
use crate::core::stats::{BufferStats, StoreMetrics};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

// Generic page header layout
pub(crate) const OFF_STATUS: usize = 0;
pub(crate) const OFF_DATA_LEN: usize = 1;
pub(crate) const OFF_NEXT_PAGE: usize = 5;
pub(crate) const OFF_LSN: usize = 13;

#[inline]
pub(crate) fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

#[inline]
pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

#[inline]
pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}

#[inline]
pub(crate) fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

/// Global metadata stored at offset 0 of every paged file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    pub version: u16,
    /// Bytes reserved for this header; equal to the page size.
    pub header_size: u16,
    pub page_size: u32,
    /// Pages currently in use.
    pub page_count: u64,
    /// Pages ever allocated, including those on the free list.
    pub total_count: u64,
    pub first_free: PageNum,
    pub last_free: PageNum,
    pub page_header_size: u8,
    pub max_key_size: u16,
    pub record_count: u64,
    /// Root of the B-tree living in this file.
    pub root_page: PageNum,
    /// Fixed B-tree key length, -1 for variable length keys.
    pub fixed_key_len: i16,
    dirty: bool,
}

impl FileHeader {
    pub fn new(version: u16, options: &StoreOptions) -> Self {
        let work = options.page_size - options.page_header_size;
        Self {
            version,
            header_size: options.page_size as u16,
            page_size: options.page_size as u32,
            page_count: 0,
            total_count: 0,
            first_free: NO_PAGE,
            last_free: NO_PAGE,
            page_header_size: options.page_header_size as u8,
            max_key_size: (work / 2).saturating_sub(MIN_SPACE_PER_KEY) as u16,
            record_count: 0,
            root_page: 0,
            fixed_key_len: options.fixed_key_len,
            dirty: true,
        }
    }

    pub fn work_size(&self) -> usize {
        self.page_size as usize - self.page_header_size as usize
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.header_size as usize];
        let mut offset = 0;

        put_u16(&mut buf, offset, self.version);
        offset += 2;
        put_u16(&mut buf, offset, self.header_size);
        offset += 2;
        put_u32(&mut buf, offset, self.page_size);
        offset += 4;
        put_u64(&mut buf, offset, self.page_count);
        offset += 8;
        put_u64(&mut buf, offset, self.total_count);
        offset += 8;
        put_u64(&mut buf, offset, self.first_free);
        offset += 8;
        put_u64(&mut buf, offset, self.last_free);
        offset += 8;
        buf[offset] = self.page_header_size;
        offset += 1;
        put_u16(&mut buf, offset, self.max_key_size);
        offset += 2;
        put_u64(&mut buf, offset, self.record_count);
        offset += 8;

        debug_assert_eq!(offset, FILE_HEADER_LEN);

        put_u64(&mut buf, offset, self.root_page);
        offset += 8;
        put_u16(&mut buf, offset, self.fixed_key_len as u16);

        buf
    }

    fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < BTREE_FILE_HEADER_LEN {
            return Err(Error::DataCorruption {
                details: format!("file header truncated: {} bytes", data.len()),
            });
        }

        let mut offset = 0;
        let version = get_u16(data, offset);
        offset += 2;
        let header_size = get_u16(data, offset);
        offset += 2;
        let page_size = get_u32(data, offset);
        offset += 4;
        let page_count = get_u64(data, offset);
        offset += 8;
        let total_count = get_u64(data, offset);
        offset += 8;
        let first_free = get_u64(data, offset);
        offset += 8;
        let last_free = get_u64(data, offset);
        offset += 8;
        let page_header_size = data[offset];
        offset += 1;
        let max_key_size = get_u16(data, offset);
        offset += 2;
        let record_count = get_u64(data, offset);
        offset += 8;
        let root_page = get_u64(data, offset);
        offset += 8;
        let fixed_key_len = get_u16(data, offset) as i16;

        Ok(Self {
            version,
            header_size,
            page_size,
            page_count,
            total_count,
            first_free,
            last_free,
            page_header_size,
            max_key_size,
            record_count,
            root_page,
            fixed_key_len,
            dirty: false,
        })
    }
}

/// Decoded copy of the generic part of a page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub status: u8,
    pub data_len: u32,
    pub next_page: PageNum,
    pub lsn: Lsn,
}

/// In-memory image of one page: header area followed by the work area.
#[derive(Clone)]
pub struct Page {
    num: PageNum,
    buf: Vec<u8>,
    header_size: usize,
}

impl Page {
    pub(crate) fn from_raw(num: PageNum, buf: Vec<u8>, header_size: usize) -> Self {
        Self {
            num,
            buf,
            header_size,
        }
    }

    pub fn num(&self) -> PageNum {
        self.num
    }

    pub fn header(&self) -> PageHeader {
        PageHeader {
            status: self.status(),
            data_len: get_u32(&self.buf, OFF_DATA_LEN),
            next_page: self.next_page(),
            lsn: self.lsn(),
        }
    }

    pub fn status(&self) -> u8 {
        self.buf[OFF_STATUS]
    }

    pub fn set_status(&mut self, status: u8) {
        self.buf[OFF_STATUS] = status;
    }

    pub fn data_len(&self) -> usize {
        get_u32(&self.buf, OFF_DATA_LEN) as usize
    }

    pub fn set_data_len(&mut self, len: usize) {
        put_u32(&mut self.buf, OFF_DATA_LEN, len as u32);
    }

    pub fn next_page(&self) -> PageNum {
        get_u64(&self.buf, OFF_NEXT_PAGE)
    }

    pub fn set_next_page(&mut self, next: PageNum) {
        put_u64(&mut self.buf, OFF_NEXT_PAGE, next);
    }

    pub fn lsn(&self) -> Lsn {
        get_u64(&self.buf, OFF_LSN)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        put_u64(&mut self.buf, OFF_LSN, lsn);
    }

    pub(crate) fn header_bytes(&self) -> &[u8] {
        &self.buf[..self.header_size]
    }

    pub(crate) fn header_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.header_size]
    }

    pub fn work(&self) -> &[u8] {
        &self.buf[self.header_size..]
    }

    pub fn work_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.header_size..]
    }

    /// The first `data_len` bytes of the work area.
    pub fn data(&self) -> &[u8] {
        let work = self.work();
        &work[..self.data_len().min(work.len())]
    }

    /// Replaces the work area. Writing more than the work size is a logic error.
    pub fn set_data(&mut self, data: &[u8]) -> Result<()> {
        let work_size = self.buf.len() - self.header_size;
        if data.len() > work_size {
            return Err(Error::ValueTooLarge {
                len: data.len(),
                max: work_size,
            });
        }
        let work = self.work_mut();
        work[..data.len()].copy_from_slice(data);
        work[data.len()..].fill(0);
        self.set_data_len(data.len());
        Ok(())
    }

    /// Zero-fills header and work area.
    pub fn clear(&mut self) {
        self.buf.fill(0);
    }

    pub(crate) fn raw(&self) -> &[u8] {
        &self.buf
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("num", &self.num)
            .field("header", &self.header())
            .finish()
    }
}

/// Page allocation, release and raw read/write.
///
/// The B-tree and the record store are written against this capability
/// rather than a concrete file.
pub trait PagedStore {
    fn page_size(&self) -> usize;
    fn work_size(&self) -> usize;
    fn is_read_only(&self) -> bool;
    fn read_page(&self, num: PageNum) -> Result<Page>;
    fn write_page(&self, page: &Page) -> Result<()>;
    fn get_free_page(&self, reuse_deleted: bool) -> Result<Page>;
    fn unlink_page(&self, num: PageNum) -> Result<()>;
    fn flush(&self) -> Result<()>;
}

pub struct PagedFile {
    path: PathBuf,
    file: Arc<Mutex<File>>,
    _lock_file: Option<File>,
    header: RwLock<FileHeader>,
    cache: PageCache,
    read_only: bool,
    is_new: bool,
    metrics: Arc<StoreMetrics>,
}

impl PagedFile {
    /// Opens `path`, creating it with a fresh header when missing.
    ///
    /// An existing file must carry `version`, otherwise the open fails with
    /// [`Error::FormatIncompatible`]. The page size of an existing file wins
    /// over the one in `options`.
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions, version: u16) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let mut read_only = options.read_only;

        if read_only && !exists {
            return Err(Error::Io(format!("{} does not exist", path.display())));
        }

        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let mut lock_opts = OpenOptions::new();
        lock_opts.read(true).write(true).create(true);
        #[cfg(unix)]
        lock_opts.mode(options.file_permissions);

        let lock_file = if read_only {
            // Shared lock is advisory for readers; a writer holding it does not stop us
            match lock_opts.open(&lock_path) {
                Ok(lock_file) => match fs2::FileExt::try_lock_shared(&lock_file) {
                    Ok(()) => Some(lock_file),
                    Err(e) => {
                        log::warn!("{} is being written elsewhere ({})", path.display(), e);
                        None
                    }
                },
                Err(_) => None,
            }
        } else {
            let lock_file = lock_opts.open(&lock_path)?;
            match fs2::FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => Some(lock_file),
                Err(e) => {
                    if !exists {
                        return Err(e.into());
                    }
                    log::warn!(
                        "{} is locked by another writer ({}), opening read-only",
                        path.display(),
                        e
                    );
                    read_only = true;
                    None
                }
            }
        };

        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            let mut file_opts = OpenOptions::new();
            file_opts.read(true).write(true).create(true);
            #[cfg(unix)]
            file_opts.mode(options.file_permissions);
            file_opts.open(&path)?
        };

        let mut paged = Self {
            path,
            file: Arc::new(Mutex::new(file)),
            _lock_file: lock_file,
            header: RwLock::new(FileHeader::new(version, options)),
            cache: PageCache::new(options.cache_size),
            read_only,
            is_new: !exists,
            metrics: Arc::new(StoreMetrics::new()),
        };

        if exists {
            paged.read_header(version)?;
        } else {
            paged.write_header()?;
            log::debug!("created paged file {}", paged.path.display());
        }

        Ok(paged)
    }

    fn read_header(&mut self, version: u16) -> Result<()> {
        let mut file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.file".to_string() })?;

        let file_size = file.seek(SeekFrom::End(0))?;
        if file_size < BTREE_FILE_HEADER_LEN as u64 {
            return Err(Error::DataCorruption {
                details: format!("file too small for a header: {} bytes", file_size),
            });
        }
        file.seek(SeekFrom::Start(0))?;
        let mut buf = vec![0u8; BTREE_FILE_HEADER_LEN];
        file.read_exact(&mut buf)?;
        drop(file);

        let header = FileHeader::deserialize(&buf)?;

        // === CORRUPTION DETECTION VALIDATION ===

        // 1. Storage format must match what the caller was built for
        if header.version != version {
            return Err(Error::FormatIncompatible {
                expected: version,
                found: header.version,
            });
        }

        // 2. Page size must be one we can address
        let page_size = header.page_size as usize;
        if page_size % 8 != 0 || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::InvalidPageSize(page_size));
        }

        // 3. Header occupies exactly one page
        if header.header_size as usize != page_size {
            return Err(Error::DataCorruption {
                details: format!(
                    "header size {} does not match page size {}",
                    header.header_size, page_size
                ),
            });
        }

        // 4. Page header must fit the record page layout and leave room for data
        let phs = header.page_header_size as usize;
        if phs < DOM_PAGE_HEADER_LEN || phs >= page_size / 2 {
            return Err(Error::DataCorruption {
                details: format!("invalid page header size {}", phs),
            });
        }

        // 5. Pages in use cannot exceed pages allocated
        if header.page_count > header.total_count {
            return Err(Error::DataCorruption {
                details: format!(
                    "page_count {} exceeds total_count {}",
                    header.page_count, header.total_count
                ),
            });
        }

        // 6. Free list ends must point inside the file
        for (name, page) in [("first_free", header.first_free), ("last_free", header.last_free)] {
            if page != NO_PAGE && page >= header.total_count {
                return Err(Error::DataCorruption {
                    details: format!(
                        "invalid {}: page {} (must be < total_count {})",
                        name, page, header.total_count
                    ),
                });
            }
        }

        // 7. Root must be an allocated page once anything was allocated
        if header.total_count > 0 && header.root_page >= header.total_count {
            return Err(Error::DataCorruption {
                details: format!(
                    "invalid root_page {} (must be < total_count {})",
                    header.root_page, header.total_count
                ),
            });
        }

        // === END VALIDATION ===

        *self.header.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.header".to_string() })? = header;
        Ok(())
    }

    pub fn write_header(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::read_only("write file header"));
        }

        let data = {
            let mut header = self.header.write()
                .map_err(|_| Error::LockPoisoned { lock_name: "paged.header".to_string() })?;
            header.dirty = false;
            header.serialize()
        };

        let mut file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.file".to_string() })?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&data)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when this open created the file.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn header(&self) -> FileHeader {
        self.header.read().recover_poison().clone()
    }

    /// Mutates the in-memory header and marks it dirty.
    pub fn update_header<R>(&self, f: impl FnOnce(&mut FileHeader) -> R) -> Result<R> {
        if self.read_only {
            return Err(Error::read_only("update file header"));
        }
        let mut header = self.header.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.header".to_string() })?;
        let r = f(&mut header);
        header.dirty = true;
        Ok(r)
    }

    pub fn page_header_size(&self) -> usize {
        self.header.read().recover_poison().page_header_size as usize
    }

    pub fn total_count(&self) -> u64 {
        self.header.read().recover_poison().total_count
    }

    pub fn max_key_size(&self) -> usize {
        self.header.read().recover_poison().max_key_size as usize
    }

    pub fn page_offset(&self, num: PageNum) -> u64 {
        let header = self.header.read().recover_poison();
        header.header_size as u64 + num * header.page_size as u64
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.cache.stats()
    }

    pub fn pin(&self, num: PageNum) -> PinGuard<'_> {
        self.cache.pin(num)
    }

    pub(crate) fn add_pin(&self, num: PageNum) {
        self.cache.add_pin(num);
    }

    pub(crate) fn unpin(&self, num: PageNum) {
        self.cache.unpin(num);
    }

    pub fn is_cached(&self, num: PageNum) -> bool {
        self.cache.contains(num)
    }

    pub fn is_dirty(&self, num: PageNum) -> bool {
        self.cache.is_dirty(num)
    }

    /// Blank image for page `num`, not yet written anywhere.
    pub fn new_page(&self, num: PageNum) -> Page {
        let header = self.header.read().recover_poison();
        Page::from_raw(
            num,
            vec![0u8; header.page_size as usize],
            header.page_header_size as usize,
        )
    }

    fn read_from_disk(&self, num: PageNum) -> Result<Vec<u8>> {
        let page_size = self.header.read().recover_poison().page_size as usize;
        let offset = self.page_offset(num);
        let mut buf = get_page_buffer(page_size);

        let mut file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.file".to_string() })?;
        file.seek(SeekFrom::Start(offset))?;

        // A page past the end of the file reads as zeros
        let mut filled = 0;
        while filled < page_size {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        Ok(buf)
    }

    /// Page numbers on the free list, head first.
    pub fn free_pages(&self) -> Result<Vec<PageNum>> {
        let (mut num, total) = {
            let header = self.header.read().recover_poison();
            (header.first_free, header.total_count)
        };
        let mut pages = Vec::new();
        while num != NO_PAGE {
            if pages.len() as u64 > total {
                return Err(Error::corruption("paged", num, "cycle in free page list"));
            }
            pages.push(num);
            num = self.read_page(num)?.next_page();
        }
        Ok(pages)
    }

    /// Takes `num` off the free list so redo or undo can bring it back into
    /// use. The rest of the list stays intact. Returns whether it was listed.
    pub fn reclaim_free_page(&self, num: PageNum) -> Result<bool> {
        let (mut cursor, total) = {
            let header = self.header.read().recover_poison();
            (header.first_free, header.total_count)
        };
        let mut prev: Option<Page> = None;
        let mut visited = 0u64;
        while cursor != NO_PAGE {
            visited += 1;
            // === CORRUPTION DETECTION VALIDATION ===
            if visited > total {
                return Err(Error::corruption("paged", cursor, "cycle in free page list"));
            }
            let page = self.read_page(cursor)?;
            if page.status() != UNUSED {
                log::warn!(
                    "free list of {} reaches page {} with status {}",
                    self.path.display(),
                    cursor,
                    page.status()
                );
                return Ok(false);
            }
            if cursor != num {
                cursor = page.next_page();
                prev = Some(page);
                continue;
            }

            let next = page.next_page();
            let prev_num = prev.as_ref().map(|p| p.num()).unwrap_or(NO_PAGE);
            if let Some(mut prev) = prev {
                prev.set_next_page(next);
                self.write_page(&prev)?;
            }
            self.update_header(|h| {
                if prev_num == NO_PAGE {
                    h.first_free = next;
                }
                if h.last_free == num {
                    h.last_free = prev_num;
                }
                h.page_count += 1;
            })?;
            self.write_header()?;
            log::debug!("reclaimed free page {} in {}", num, self.path.display());
            return Ok(true);
        }
        Ok(false)
    }

    /// Grows `total_count` so that `num` counts as allocated.
    pub fn ensure_allocated(&self, num: PageNum) -> Result<()> {
        let total = self.total_count();
        if num != NO_PAGE && num >= total {
            self.update_header(|h| {
                h.page_count += num + 1 - h.total_count;
                h.total_count = num + 1;
            })?;
        }
        Ok(())
    }

    pub fn inc_record_count(&self) -> Result<()> {
        self.update_header(|h| h.record_count += 1)
    }

    pub fn dec_record_count(&self) -> Result<()> {
        self.update_header(|h| h.record_count = h.record_count.saturating_sub(1))
    }

    /// Drops the cached image of a page without writing it.
    pub fn evict(&self, num: PageNum) {
        self.cache.remove(num);
    }

    /// Hex dump of the raw page bytes.
    pub fn dump_page(&self, num: PageNum) -> Result<String> {
        let page = self.read_page(num)?;
        Ok(hex_dump(page.raw()))
    }

    /// Writes dirty pages in ascending order, batching consecutive runs.
    fn write_dirty_pages(&self) -> Result<()> {
        let dirty = self.cache.dirty_pages();
        if dirty.is_empty() {
            return Ok(());
        }

        let pages: Vec<(PageNum, Vec<u8>)> = dirty
            .iter()
            .filter_map(|&num| self.cache.peek(num).map(|data| (num, data)))
            .collect();

        let mut file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.file".to_string() })?;

        let mut batch_start = 0;
        while batch_start < pages.len() {
            let mut batch_end = batch_start;
            while batch_end + 1 < pages.len() && pages[batch_end + 1].0 == pages[batch_end].0 + 1 {
                batch_end += 1;
            }

            let offset = self.page_offset(pages[batch_start].0);
            file.seek(SeekFrom::Start(offset))?;
            if batch_start == batch_end {
                file.write_all(&pages[batch_start].1)?;
            } else {
                let mut batch = Vec::with_capacity(pages[batch_start].1.len() * (batch_end - batch_start + 1));
                for (_, data) in &pages[batch_start..=batch_end] {
                    batch.extend_from_slice(data);
                }
                file.write_all(&batch)?;
            }
            for _ in batch_start..=batch_end {
                self.metrics.page_written();
            }

            batch_start = batch_end + 1;
        }
        drop(file);

        for (num, data) in pages {
            self.cache.clear_dirty(num);
            put_page_buffer(data);
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "paged.file".to_string() })?;
        file.sync_data()?;
        Ok(())
    }

    /// Flushes and releases clean pages from the cache.
    pub fn close(&self) -> Result<()> {
        if !self.read_only {
            self.flush()?;
        }
        self.cache.shrink();
        Ok(())
    }
}

impl PagedStore for PagedFile {
    fn page_size(&self) -> usize {
        self.header.read().recover_poison().page_size as usize
    }

    fn work_size(&self) -> usize {
        self.header.read().recover_poison().work_size()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_page(&self, num: PageNum) -> Result<Page> {
        if num == NO_PAGE {
            return Err(Error::corruption("paged", num, "illegal page number"));
        }
        let header_size = self.page_header_size();

        if let Some(data) = self.cache.get(num) {
            self.metrics.cache_hit();
            return Ok(Page::from_raw(num, data, header_size));
        }
        self.metrics.cache_miss();

        let data = self.read_from_disk(num)?;
        self.cache.put(num, data.clone());
        Ok(Page::from_raw(num, data, header_size))
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        if self.read_only {
            return Err(Error::read_only("write page"));
        }
        let page_size = self.page_size();
        if page.raw().len() != page_size {
            return Err(Error::InvalidPageSize(page.raw().len()));
        }
        if page.data_len() > page_size - self.page_header_size() {
            return Err(Error::ValueTooLarge {
                len: page.data_len(),
                max: page_size - self.page_header_size(),
            });
        }
        self.cache.put_dirty(page.num(), page.raw().to_vec());
        Ok(())
    }

    fn get_free_page(&self, reuse_deleted: bool) -> Result<Page> {
        if self.read_only {
            return Err(Error::read_only("allocate page"));
        }

        let (num, reused) = {
            let mut header = self.header.write()
                .map_err(|_| Error::LockPoisoned { lock_name: "paged.header".to_string() })?;
            let first_free = header.first_free;
            if reuse_deleted && first_free != NO_PAGE {
                drop(header);
                let free = self.read_page(first_free)?;
                let mut header = self.header.write()
                    .map_err(|_| Error::LockPoisoned { lock_name: "paged.header".to_string() })?;
                header.first_free = free.next_page();
                if header.first_free == NO_PAGE {
                    header.last_free = NO_PAGE;
                }
                header.page_count += 1;
                header.dirty = true;
                (first_free, true)
            } else {
                let num = header.total_count;
                if num >= i32::MAX as u64 {
                    return Err(Error::Other(format!("page limit reached: {}", num)));
                }
                header.total_count = num + 1;
                header.page_count += 1;
                header.dirty = true;
                (num, false)
            }
        };

        let mut page = self.read_page(num)?;
        page.set_next_page(NO_PAGE);
        page.set_status(UNUSED);
        self.write_header()?;

        if reused {
            self.metrics.page_reused();
            log::debug!("reusing free page {} in {}", num, self.path.display());
        } else {
            self.metrics.page_allocated();
            log::debug!("allocated page {} in {}", num, self.path.display());
        }
        Ok(page)
    }

    /// Pushes a single page onto the head of the free list, zero-filled.
    fn unlink_page(&self, num: PageNum) -> Result<()> {
        if self.read_only {
            return Err(Error::read_only("free page"));
        }
        let mut page = self.new_page(num);
        page.set_status(UNUSED);
        page.set_lsn(LSN_INVALID);

        {
            let mut header = self.header.write()
                .map_err(|_| Error::LockPoisoned { lock_name: "paged.header".to_string() })?;
            page.set_next_page(header.first_free);
            header.first_free = num;
            if header.last_free == NO_PAGE {
                header.last_free = num;
            }
            header.page_count = header.page_count.saturating_sub(1);
            header.dirty = true;
        }

        self.write_page(&page)?;
        self.metrics.page_freed();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.write_dirty_pages()?;
        if self.header.read().recover_poison().dirty {
            self.write_header()?;
        }
        self.sync()
    }
}

/// Space separated hex bytes, 16 per line.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, b) in data.iter().enumerate() {
        let _ = write!(out, "{:02x}", b);
        out.push(if i % 16 == 15 { '\n' } else { ' ' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cleanup(path: &str) {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(format!("{}.lock", path));
    }

    fn small_options() -> StoreOptions {
        StoreOptions::default().with_page_size(512).with_cache_size(8)
    }

    #[test]
    fn test_header_serialization() {
        let mut header = FileHeader::new(7, &StoreOptions::default());
        header.total_count = 12;
        header.first_free = 3;
        header.root_page = 9;
        let data = header.serialize();
        assert_eq!(data.len(), DEFAULT_PAGE_SIZE);

        let parsed = FileHeader::deserialize(&data).unwrap();
        assert_eq!(parsed.version, 7);
        assert_eq!(parsed.total_count, 12);
        assert_eq!(parsed.first_free, 3);
        assert_eq!(parsed.last_free, NO_PAGE);
        assert_eq!(parsed.root_page, 9);
        assert_eq!(parsed.fixed_key_len, -1);
        assert_eq!(parsed.max_key_size as usize, (4096 - 64) / 2 - MIN_SPACE_PER_KEY);
    }

    #[test]
    fn test_header_is_big_endian() {
        let header = FileHeader::new(0x0102, &StoreOptions::default());
        let data = header.serialize();
        assert_eq!(&data[0..2], &[0x01, 0x02]);
        assert_eq!(&data[4..8], &4096u32.to_be_bytes());
    }

    #[test]
    fn test_create_and_reopen() {
        let path = "/tmp/test_paged_create.dbx";
        cleanup(path);

        {
            let paged = PagedFile::open(path, &small_options(), 3).unwrap();
            assert!(paged.is_new());
            let mut page = paged.get_free_page(true).unwrap();
            assert_eq!(page.num(), 0);
            page.set_status(RECORD);
            page.set_data(b"hello").unwrap();
            paged.write_page(&page).unwrap();
            paged.close().unwrap();
        }

        {
            let paged = PagedFile::open(path, &small_options(), 3).unwrap();
            assert!(!paged.is_new());
            assert_eq!(paged.total_count(), 1);
            let page = paged.read_page(0).unwrap();
            assert_eq!(page.status(), RECORD);
            assert_eq!(page.data(), b"hello");
            assert_eq!(paged.page_offset(1), 512 + 512);
        }

        cleanup(path);
    }

    #[test]
    fn test_version_mismatch() {
        let path = "/tmp/test_paged_version.dbx";
        cleanup(path);

        drop(PagedFile::open(path, &small_options(), 3).unwrap());
        let err = PagedFile::open(path, &small_options(), 4).err().unwrap();
        assert!(matches!(err, Error::FormatIncompatible { expected: 4, found: 3 }));

        cleanup(path);
    }

    #[test]
    fn test_free_page_reuse_is_lifo() {
        let path = "/tmp/test_paged_free_lifo.dbx";
        cleanup(path);

        let paged = PagedFile::open(path, &small_options(), 1).unwrap();
        let pages: Vec<PageNum> = (0..4)
            .map(|_| {
                let mut p = paged.get_free_page(true).unwrap();
                p.set_status(RECORD);
                paged.write_page(&p).unwrap();
                p.num()
            })
            .collect();
        assert_eq!(pages, vec![0, 1, 2, 3]);

        paged.unlink_page(1).unwrap();
        paged.unlink_page(2).unwrap();
        assert_eq!(paged.free_pages().unwrap(), vec![2, 1]);
        assert_eq!(paged.header().page_count, 2);

        let reused = paged.get_free_page(true).unwrap();
        assert_eq!(reused.num(), 2);
        assert_eq!(reused.status(), UNUSED);
        assert_eq!(paged.get_free_page(false).unwrap().num(), 4);
        assert_eq!(paged.get_free_page(true).unwrap().num(), 1);
        assert_eq!(paged.header().first_free, NO_PAGE);
        assert_eq!(paged.header().last_free, NO_PAGE);

        cleanup(path);
    }

    #[test]
    fn test_reclaim_keeps_rest_of_free_list() {
        let path = "/tmp/test_paged_reclaim.dbx";
        cleanup(path);

        let paged = PagedFile::open(path, &small_options(), 1).unwrap();
        for _ in 0..5 {
            let mut p = paged.get_free_page(true).unwrap();
            p.set_status(RECORD);
            paged.write_page(&p).unwrap();
        }
        for num in [1, 2, 3, 4] {
            paged.unlink_page(num).unwrap();
        }
        assert_eq!(paged.free_pages().unwrap(), vec![4, 3, 2, 1]);
        assert_eq!(paged.header().page_count, 1);

        // middle
        assert!(paged.reclaim_free_page(3).unwrap());
        assert_eq!(paged.free_pages().unwrap(), vec![4, 2, 1]);
        // tail
        assert!(paged.reclaim_free_page(1).unwrap());
        assert_eq!(paged.free_pages().unwrap(), vec![4, 2]);
        assert_eq!(paged.header().last_free, 2);
        // head
        assert!(paged.reclaim_free_page(4).unwrap());
        assert_eq!(paged.free_pages().unwrap(), vec![2]);
        assert_eq!(paged.header().first_free, 2);
        assert_eq!(paged.header().page_count, 4);

        assert!(!paged.reclaim_free_page(0).unwrap());
        assert_eq!(paged.free_pages().unwrap(), vec![2]);

        assert_eq!(paged.get_free_page(true).unwrap().num(), 2);
        assert_eq!(paged.header().first_free, NO_PAGE);
        assert_eq!(paged.header().last_free, NO_PAGE);
        assert_eq!(paged.get_free_page(true).unwrap().num(), 5);

        cleanup(path);
    }

    #[test]
    fn test_unlinked_page_is_zeroed() {
        let path = "/tmp/test_paged_unlink_zero.dbx";
        cleanup(path);

        let paged = PagedFile::open(path, &small_options(), 1).unwrap();
        let mut page = paged.get_free_page(true).unwrap();
        page.set_status(RECORD);
        page.set_lsn(77);
        page.set_data(&[0xAA; 100]).unwrap();
        paged.write_page(&page).unwrap();

        paged.unlink_page(page.num()).unwrap();
        let freed = paged.read_page(page.num()).unwrap();
        assert_eq!(freed.status(), UNUSED);
        assert_eq!(freed.lsn(), LSN_INVALID);
        assert!(freed.work().iter().all(|&b| b == 0));

        cleanup(path);
    }

    #[test]
    fn test_data_larger_than_work_size_is_rejected() {
        let path = "/tmp/test_paged_too_large.dbx";
        cleanup(path);

        let paged = PagedFile::open(path, &small_options(), 1).unwrap();
        let mut page = paged.get_free_page(true).unwrap();
        let err = page.set_data(&vec![1u8; 512]).unwrap_err();
        assert!(matches!(err, Error::ValueTooLarge { len: 512, max: 448 }));

        cleanup(path);
    }

    #[test]
    fn test_read_beyond_eof_is_zero_page() {
        let path = "/tmp/test_paged_eof.dbx";
        cleanup(path);

        let paged = PagedFile::open(path, &small_options(), 1).unwrap();
        paged.ensure_allocated(9).unwrap();
        assert_eq!(paged.total_count(), 10);
        let page = paged.read_page(9).unwrap();
        assert_eq!(page.status(), UNUSED);
        assert_eq!(page.lsn(), LSN_INVALID);

        cleanup(path);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let path = "/tmp/test_paged_readonly.dbx";
        cleanup(path);

        {
            let paged = PagedFile::open(path, &small_options(), 1).unwrap();
            paged.get_free_page(true).unwrap();
            paged.close().unwrap();
        }

        let paged = PagedFile::open(path, &small_options().read_only(true), 1).unwrap();
        assert!(paged.is_read_only());
        let err = paged.get_free_page(true).unwrap_err();
        assert!(matches!(err, Error::DatabaseReadOnly { .. }));
        let page = paged.read_page(0).unwrap();
        assert!(matches!(paged.write_page(&page), Err(Error::DatabaseReadOnly { .. })));

        cleanup(path);
    }

    #[test]
    fn test_second_writer_falls_back_to_read_only() {
        let path = "/tmp/test_paged_lock.dbx";
        cleanup(path);

        let first = PagedFile::open(path, &small_options(), 1).unwrap();
        assert!(!first.is_read_only());
        let second = PagedFile::open(path, &small_options(), 1).unwrap();
        assert!(second.is_read_only());

        drop(second);
        drop(first);
        cleanup(path);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x00, 0xff, 0x10]), "00 ff 10 ");
    }
}
