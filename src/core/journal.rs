use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::loggable::{LogEntry, LogRecord};
use crate::core::options::StoreOptions;
use crate::core::stats::StoreMetrics;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

/// len(4) crc(4)
const RECORD_PREFIX_SIZE: usize = 8;
/// lsn(8) txn(8)
const RECORD_FIXED_BODY: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct JournalHeader {
    pub magic: [u8; 4],
    pub version: u32,
    /// LSN handed to the first record after the last truncation.
    pub base_lsn: Lsn,
    pub next_txn: TransactionID,
}

/// Handle of an open transaction. Mutating calls that receive one are journaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Txn {
    id: TransactionID,
}

impl Txn {
    pub fn id(&self) -> TransactionID {
        self.id
    }
}

struct JournalInner {
    file: File,
    writer: BufWriter<File>,
    header: JournalHeader,
    next_lsn: Lsn,
    /// Offset one past the last complete record.
    end_offset: u64,
    record_count: u64,
}

/// Append-only redo/undo journal.
///
/// Records are `[len u32][crc u32][lsn u64][txn u64][entry]`, big-endian;
/// the CRC covers everything after itself. A torn or damaged tail found on
/// open is cut off.
pub struct Journal {
    path: PathBuf,
    inner: Arc<Mutex<JournalInner>>,
    metrics: Arc<RwLock<Option<Arc<StoreMetrics>>>>,
    sync_on_commit: bool,
}

impl Journal {
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let is_new = !path.exists() || std::fs::metadata(&path)?.len() == 0;

        let mut file_opts = OpenOptions::new();
        file_opts.read(true).write(true).create(true);
        #[cfg(unix)]
        file_opts.mode(options.file_permissions);
        let file = file_opts.open(&path)?;

        let writer_file = file.try_clone()?;
        let writer = BufWriter::with_capacity(JOURNAL_BUFFER_SIZE, writer_file);

        let mut inner = JournalInner {
            file,
            writer,
            header: JournalHeader {
                magic: JOURNAL_MAGIC,
                version: JOURNAL_VERSION,
                base_lsn: 1,
                next_txn: 1,
            },
            next_lsn: 1,
            end_offset: JOURNAL_HEADER_SIZE as u64,
            record_count: 0,
        };

        if is_new {
            inner.write_header()?;
        } else {
            inner.header = inner.read_header()?;
            inner.next_lsn = inner.header.base_lsn;
            inner.scan()?;
        }

        log::debug!(
            "opened journal {} ({} records, next lsn {})",
            path.display(),
            inner.record_count,
            inner.next_lsn
        );

        Ok(Journal {
            path,
            inner: Arc::new(Mutex::new(inner)),
            metrics: Arc::new(RwLock::new(None)),
            sync_on_commit: options.sync_on_commit,
        })
    }

    pub(crate) fn set_metrics(&self, metrics: Arc<StoreMetrics>) {
        if let Ok(mut m) = self.metrics.write() {
            *m = Some(metrics);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a transaction and journals its start record.
    pub fn begin(&self) -> Result<Txn> {
        let id = {
            let mut inner = self.lock()?;
            let id = inner.header.next_txn;
            inner.header.next_txn += 1;
            id
        };
        let txn = Txn { id };
        self.append(id, &LogEntry::TxnStart)?;
        Ok(txn)
    }

    /// Appends one record for `txn` and returns its LSN.
    pub fn write(&self, txn: &Txn, entry: &LogEntry) -> Result<Lsn> {
        self.append(txn.id, entry)
    }

    pub fn commit(&self, txn: &Txn) -> Result<()> {
        self.append(txn.id, &LogEntry::TxnCommit)?;
        if self.sync_on_commit {
            self.sync()
        } else {
            self.flush()
        }
    }

    pub fn abort(&self, txn: &Txn) -> Result<()> {
        self.append(txn.id, &LogEntry::TxnAbort)?;
        self.flush()
    }

    fn append(&self, txn_id: TransactionID, entry: &LogEntry) -> Result<Lsn> {
        let payload = entry.encode();
        let body_len = RECORD_FIXED_BODY + payload.len();

        let mut inner = self.lock()?;
        let lsn = inner.next_lsn;

        let mut data = Vec::with_capacity(RECORD_PREFIX_SIZE + body_len);
        data.extend_from_slice(&(body_len as u32).to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);
        data.extend_from_slice(&lsn.to_be_bytes());
        data.extend_from_slice(&txn_id.to_be_bytes());
        data.extend_from_slice(&payload);
        let crc = crc32fast::hash(&data[RECORD_PREFIX_SIZE..]);
        data[4..8].copy_from_slice(&crc.to_be_bytes());

        inner.writer.write_all(&data)?;
        inner.end_offset += data.len() as u64;
        inner.next_lsn += 1;
        inner.record_count += 1;

        // Track metrics after releasing the inner lock
        drop(inner);
        if let Ok(m) = self.metrics.read() {
            if let Some(metrics) = m.as_ref() {
                metrics.journal_write(data.len());
            }
        }

        Ok(lsn)
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.writer.flush()?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.writer.flush()?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Every intact record in log order.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let mut inner = self.lock()?;
        inner.writer.flush()?;
        let end = inner.end_offset;
        let (records, _) = inner.read_range(end)?;
        // Reader and writer share one file offset
        inner.writer.get_mut().seek(SeekFrom::Start(end))?;
        Ok(records)
    }

    /// Records written on behalf of one transaction, in log order.
    pub fn records_of(&self, txn: &Txn) -> Result<Vec<LogRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.txn_id == txn.id)
            .collect())
    }

    /// Drops every record. The next LSN survives in the header so page LSNs
    /// written before the truncation stay older than anything logged after it.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.writer.flush()?;
        inner.header.base_lsn = inner.next_lsn;
        inner.file.set_len(JOURNAL_HEADER_SIZE as u64)?;
        inner.write_header()?;
        inner.end_offset = JOURNAL_HEADER_SIZE as u64;
        inner.record_count = 0;
        log::debug!(
            "truncated journal {} at lsn {}",
            self.path.display(),
            inner.next_lsn
        );
        Ok(())
    }

    /// Writes a checkpoint record, syncs and truncates.
    pub fn checkpoint(&self) -> Result<()> {
        self.append(0, &LogEntry::Checkpoint)?;
        self.sync()?;
        self.truncate()
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().map(|inner| inner.next_lsn).unwrap_or(LSN_INVALID)
    }

    pub fn record_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.record_count).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, JournalInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "journal.inner".to_string() })
    }
}

impl JournalInner {
    fn write_header(&mut self) -> Result<()> {
        let mut data = vec![0u8; JOURNAL_HEADER_SIZE];
        data[0..4].copy_from_slice(&self.header.magic);
        data[4..8].copy_from_slice(&self.header.version.to_be_bytes());
        data[8..16].copy_from_slice(&self.header.base_lsn.to_be_bytes());
        data[16..24].copy_from_slice(&self.header.next_txn.to_be_bytes());

        self.writer.flush()?;
        self.writer.get_mut().seek(SeekFrom::Start(0))?;
        self.writer.write_all(&data)?;
        self.writer.flush()?;
        self.writer.get_mut().seek(SeekFrom::End(0))?;
        self.file.sync_all()?;
        Ok(())
    }

    fn read_header(&mut self) -> Result<JournalHeader> {
        let mut data = vec![0u8; JOURNAL_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(0))?;
        self.file
            .read_exact(&mut data)
            .map_err(|_| Error::JournalCorrupted("header truncated".to_string()))?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if magic != JOURNAL_MAGIC {
            return Err(Error::JournalCorrupted(format!("bad magic {:02x?}", magic)));
        }

        let version = u32::from_be_bytes(data[4..8].try_into()?);
        if version != JOURNAL_VERSION {
            return Err(Error::JournalCorrupted(format!(
                "unsupported journal version {}",
                version
            )));
        }

        Ok(JournalHeader {
            magic,
            version,
            base_lsn: u64::from_be_bytes(data[8..16].try_into()?),
            next_txn: u64::from_be_bytes(data[16..24].try_into()?),
        })
    }

    /// Finds the end of the intact records, cutting off a damaged tail.
    fn scan(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let (records, end) = self.read_range(file_len)?;

        for record in &records {
            self.next_lsn = self.next_lsn.max(record.lsn + 1);
            self.header.next_txn = self.header.next_txn.max(record.txn_id + 1);
        }

        if end < file_len {
            log::warn!(
                "journal has {} damaged trailing bytes after lsn {}, truncating",
                file_len - end,
                self.next_lsn.saturating_sub(1)
            );
            self.file.set_len(end)?;
            self.file.sync_all()?;
        }

        self.end_offset = end;
        self.record_count = records.len() as u64;
        self.writer.get_mut().seek(SeekFrom::Start(end))?;
        Ok(())
    }

    /// Decodes records up to `end`; also returns the offset after the last good one.
    fn read_range(&mut self, end: u64) -> Result<(Vec<LogRecord>, u64)> {
        self.file.seek(SeekFrom::Start(JOURNAL_HEADER_SIZE as u64))?;
        let mut reader = BufReader::with_capacity(JOURNAL_BUFFER_SIZE, &mut self.file);
        let mut offset = JOURNAL_HEADER_SIZE as u64;
        let mut records = Vec::new();
        let mut prefix = [0u8; RECORD_PREFIX_SIZE];

        while offset + RECORD_PREFIX_SIZE as u64 <= end {
            if reader.read_exact(&mut prefix).is_err() {
                break;
            }
            let body_len = u32::from_be_bytes(prefix[0..4].try_into()?) as usize;
            let crc = u32::from_be_bytes(prefix[4..8].try_into()?);
            if body_len < RECORD_FIXED_BODY + 1
                || offset + (RECORD_PREFIX_SIZE + body_len) as u64 > end
            {
                break;
            }

            let mut body = vec![0u8; body_len];
            if reader.read_exact(&mut body).is_err() {
                break;
            }
            let lsn = u64::from_be_bytes(body[0..8].try_into()?);
            if crc32fast::hash(&body) != crc {
                log::warn!("{}", Error::JournalChecksum { lsn });
                break;
            }

            let txn_id = u64::from_be_bytes(body[8..16].try_into()?);
            let entry = match LogEntry::decode(&body[RECORD_FIXED_BODY..]) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("undecodable journal record at lsn {}: {}", lsn, e);
                    break;
                }
            };

            records.push(LogRecord { lsn, txn_id, entry });
            offset += (RECORD_PREFIX_SIZE + body_len) as u64;
        }

        Ok((records, offset))
    }
}
