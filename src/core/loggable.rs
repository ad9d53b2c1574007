//! Journal record payloads.
//!
//! Every page-level mutation of the record store and the B-tree has one
//! variant here. A variant carries enough to redo the change on a page whose
//! LSN is older than the record, and to undo it during rollback.

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::storage_address;
use crate::core::value::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    TxnStart,
    TxnCommit,
    TxnAbort,
    Checkpoint,

    CreatePage {
        page: PageNum,
        prev_page: PageNum,
        next_page: PageNum,
        next_tid: i16,
    },
    AddValue {
        page: PageNum,
        tid: u16,
        value: Vec<u8>,
        is_overflow: bool,
    },
    RemoveValue {
        page: PageNum,
        tid: u16,
        offset: u32,
        old_data: Vec<u8>,
        is_overflow: bool,
        back_link: u64,
    },
    RemoveEmptyPage {
        page: PageNum,
        prev_page: PageNum,
        next_page: PageNum,
    },
    UpdateValue {
        page: PageNum,
        tid: u16,
        value: Vec<u8>,
        old_value: Vec<u8>,
    },
    RemovePage {
        page: PageNum,
        prev_page: PageNum,
        next_page: PageNum,
        old_data: Vec<u8>,
        old_tid: i16,
        old_record_count: u16,
    },
    WriteOverflow {
        page: PageNum,
        next_page: PageNum,
        value: Vec<u8>,
    },
    RemoveOverflow {
        page: PageNum,
        next_page: PageNum,
        old_data: Vec<u8>,
    },
    InsertRecord {
        page: PageNum,
        offset: u32,
        tid: u16,
        value: Vec<u8>,
        is_overflow: bool,
    },
    SplitPage {
        page: PageNum,
        split_offset: u32,
        old_data: Vec<u8>,
    },
    AddLink {
        page: PageNum,
        tid: u16,
        link: u64,
    },
    AddMovedValue {
        page: PageNum,
        tid: u16,
        value: Vec<u8>,
        back_link: u64,
        is_overflow: bool,
    },
    UpdateHeader {
        page: PageNum,
        prev_page: PageNum,
        next_page: PageNum,
        old_prev: PageNum,
        old_next: PageNum,
    },
    UpdateLink {
        page: PageNum,
        offset: u32,
        link: u64,
        old_link: u64,
    },

    BTreeInsertValue {
        page: PageNum,
        idx: u16,
        key: Value,
        pointer_idx: u16,
        pointer: u64,
    },
    BTreeCreateNode {
        page: PageNum,
        status: u8,
        parent: PageNum,
    },
    BTreeUpdatePage {
        page: PageNum,
        prefix: Value,
        keys: Vec<Value>,
        pointers: Vec<u64>,
    },
    BTreeSetParent {
        page: PageNum,
        parent: PageNum,
    },
    BTreeUpdateValue {
        page: PageNum,
        idx: u16,
        key: Value,
        pointer: u64,
        old_pointer: u64,
    },
    BTreeRemoveValue {
        page: PageNum,
        idx: u16,
        old_key: Value,
        old_pointer: u64,
    },
    BTreeSetLink {
        page: PageNum,
        next_page: PageNum,
    },
}

/// One decoded journal record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TransactionID,
    pub entry: LogEntry,
}

impl LogRecord {
    pub fn dump(&self) -> String {
        format!("[{}] txn {}: {}", self.lsn, self.txn_id, self.entry)
    }
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new(tag: u8) -> Self {
        Self { buf: vec![tag] }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(v as u8)
    }

    /// Length-prefixed bytes.
    fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        self
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::DataCorruption {
                details: format!(
                    "journal record truncated: need {} bytes at {}, have {}",
                    n,
                    self.pos,
                    self.data.len()
                ),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into()?))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into()?))
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn value(&mut self) -> Result<Value> {
        Ok(Value::new(self.bytes()?))
    }
}

impl LogEntry {
    pub fn tag(&self) -> u8 {
        match self {
            LogEntry::TxnStart => LOG_TXN_START,
            LogEntry::TxnCommit => LOG_TXN_COMMIT,
            LogEntry::TxnAbort => LOG_TXN_ABORT,
            LogEntry::Checkpoint => LOG_CHECKPOINT,
            LogEntry::CreatePage { .. } => LOG_CREATE_PAGE,
            LogEntry::AddValue { .. } => LOG_ADD_VALUE,
            LogEntry::RemoveValue { .. } => LOG_REMOVE_VALUE,
            LogEntry::RemoveEmptyPage { .. } => LOG_REMOVE_EMPTY_PAGE,
            LogEntry::UpdateValue { .. } => LOG_UPDATE_VALUE,
            LogEntry::RemovePage { .. } => LOG_REMOVE_PAGE,
            LogEntry::WriteOverflow { .. } => LOG_WRITE_OVERFLOW,
            LogEntry::RemoveOverflow { .. } => LOG_REMOVE_OVERFLOW,
            LogEntry::InsertRecord { .. } => LOG_INSERT_RECORD,
            LogEntry::SplitPage { .. } => LOG_SPLIT_PAGE,
            LogEntry::AddLink { .. } => LOG_ADD_LINK,
            LogEntry::AddMovedValue { .. } => LOG_ADD_MOVED_VALUE,
            LogEntry::UpdateHeader { .. } => LOG_UPDATE_HEADER,
            LogEntry::UpdateLink { .. } => LOG_UPDATE_LINK,
            LogEntry::BTreeInsertValue { .. } => LOG_BT_INSERT_VALUE,
            LogEntry::BTreeCreateNode { .. } => LOG_BT_CREATE_NODE,
            LogEntry::BTreeUpdatePage { .. } => LOG_BT_UPDATE_PAGE,
            LogEntry::BTreeSetParent { .. } => LOG_BT_SET_PARENT,
            LogEntry::BTreeUpdateValue { .. } => LOG_BT_UPDATE_VALUE,
            LogEntry::BTreeRemoveValue { .. } => LOG_BT_REMOVE_VALUE,
            LogEntry::BTreeSetLink { .. } => LOG_BT_SET_LINK,
        }
    }

    /// Page the record applies to; `None` for transaction control records.
    pub fn page(&self) -> Option<PageNum> {
        match self {
            LogEntry::TxnStart | LogEntry::TxnCommit | LogEntry::TxnAbort | LogEntry::Checkpoint => None,
            LogEntry::CreatePage { page, .. } => Some(*page),
            LogEntry::AddValue { page, .. }
            | LogEntry::RemoveValue { page, .. }
            | LogEntry::RemoveEmptyPage { page, .. }
            | LogEntry::UpdateValue { page, .. }
            | LogEntry::RemovePage { page, .. }
            | LogEntry::WriteOverflow { page, .. }
            | LogEntry::RemoveOverflow { page, .. }
            | LogEntry::InsertRecord { page, .. }
            | LogEntry::SplitPage { page, .. }
            | LogEntry::AddLink { page, .. }
            | LogEntry::AddMovedValue { page, .. }
            | LogEntry::UpdateHeader { page, .. }
            | LogEntry::UpdateLink { page, .. }
            | LogEntry::BTreeInsertValue { page, .. }
            | LogEntry::BTreeCreateNode { page, .. }
            | LogEntry::BTreeUpdatePage { page, .. }
            | LogEntry::BTreeSetParent { page, .. }
            | LogEntry::BTreeUpdateValue { page, .. }
            | LogEntry::BTreeRemoveValue { page, .. }
            | LogEntry::BTreeSetLink { page, .. } => Some(*page),
        }
    }

    pub fn is_btree(&self) -> bool {
        (LOG_BT_INSERT_VALUE..=LOG_BT_SET_LINK).contains(&self.tag())
    }

    pub fn is_control(&self) -> bool {
        self.page().is_none()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new(self.tag());
        match self {
            LogEntry::TxnStart | LogEntry::TxnCommit | LogEntry::TxnAbort | LogEntry::Checkpoint => {}
            LogEntry::CreatePage {
                page,
                prev_page,
                next_page,
                next_tid,
            } => {
                e.u64(*page).u64(*prev_page).u64(*next_page).u16(*next_tid as u16);
            }
            LogEntry::AddValue {
                page,
                tid,
                value,
                is_overflow,
            } => {
                e.u64(*page).u16(*tid).bool(*is_overflow).bytes(value);
            }
            LogEntry::RemoveValue {
                page,
                tid,
                offset,
                old_data,
                is_overflow,
                back_link,
            } => {
                e.u64(*page)
                    .u16(*tid)
                    .u32(*offset)
                    .bool(*is_overflow)
                    .u64(*back_link)
                    .bytes(old_data);
            }
            LogEntry::RemoveEmptyPage {
                page,
                prev_page,
                next_page,
            } => {
                e.u64(*page).u64(*prev_page).u64(*next_page);
            }
            LogEntry::UpdateValue {
                page,
                tid,
                value,
                old_value,
            } => {
                e.u64(*page).u16(*tid).bytes(value).bytes(old_value);
            }
            LogEntry::RemovePage {
                page,
                prev_page,
                next_page,
                old_data,
                old_tid,
                old_record_count,
            } => {
                e.u64(*page)
                    .u64(*prev_page)
                    .u64(*next_page)
                    .u16(*old_tid as u16)
                    .u16(*old_record_count)
                    .bytes(old_data);
            }
            LogEntry::WriteOverflow {
                page,
                next_page,
                value,
            } => {
                e.u64(*page).u64(*next_page).bytes(value);
            }
            LogEntry::RemoveOverflow {
                page,
                next_page,
                old_data,
            } => {
                e.u64(*page).u64(*next_page).bytes(old_data);
            }
            LogEntry::InsertRecord {
                page,
                offset,
                tid,
                value,
                is_overflow,
            } => {
                e.u64(*page).u32(*offset).u16(*tid).bool(*is_overflow).bytes(value);
            }
            LogEntry::SplitPage {
                page,
                split_offset,
                old_data,
            } => {
                e.u64(*page).u32(*split_offset).bytes(old_data);
            }
            LogEntry::AddLink { page, tid, link } => {
                e.u64(*page).u16(*tid).u64(*link);
            }
            LogEntry::AddMovedValue {
                page,
                tid,
                value,
                back_link,
                is_overflow,
            } => {
                e.u64(*page)
                    .u16(*tid)
                    .u64(*back_link)
                    .bool(*is_overflow)
                    .bytes(value);
            }
            LogEntry::UpdateHeader {
                page,
                prev_page,
                next_page,
                old_prev,
                old_next,
            } => {
                e.u64(*page)
                    .u64(*prev_page)
                    .u64(*next_page)
                    .u64(*old_prev)
                    .u64(*old_next);
            }
            LogEntry::UpdateLink {
                page,
                offset,
                link,
                old_link,
            } => {
                e.u64(*page).u32(*offset).u64(*link).u64(*old_link);
            }
            LogEntry::BTreeInsertValue {
                page,
                idx,
                key,
                pointer_idx,
                pointer,
            } => {
                e.u64(*page)
                    .u16(*idx)
                    .u16(*pointer_idx)
                    .u64(*pointer)
                    .bytes(key.as_bytes());
            }
            LogEntry::BTreeCreateNode {
                page,
                status,
                parent,
            } => {
                e.u64(*page).u8(*status).u64(*parent);
            }
            LogEntry::BTreeUpdatePage {
                page,
                prefix,
                keys,
                pointers,
            } => {
                e.u64(*page).bytes(prefix.as_bytes()).u16(keys.len() as u16);
                for key in keys {
                    e.bytes(key.as_bytes());
                }
                e.u16(pointers.len() as u16);
                for p in pointers {
                    e.u64(*p);
                }
            }
            LogEntry::BTreeSetParent { page, parent } => {
                e.u64(*page).u64(*parent);
            }
            LogEntry::BTreeUpdateValue {
                page,
                idx,
                key,
                pointer,
                old_pointer,
            } => {
                e.u64(*page)
                    .u16(*idx)
                    .u64(*pointer)
                    .u64(*old_pointer)
                    .bytes(key.as_bytes());
            }
            LogEntry::BTreeRemoveValue {
                page,
                idx,
                old_key,
                old_pointer,
            } => {
                e.u64(*page).u16(*idx).u64(*old_pointer).bytes(old_key.as_bytes());
            }
            LogEntry::BTreeSetLink { page, next_page } => {
                e.u64(*page).u64(*next_page);
            }
        }
        e.buf
    }

    pub fn decode(data: &[u8]) -> Result<LogEntry> {
        let mut d = Decoder { data, pos: 0 };
        let tag = d.u8()?;
        let entry = match tag {
            LOG_TXN_START => LogEntry::TxnStart,
            LOG_TXN_COMMIT => LogEntry::TxnCommit,
            LOG_TXN_ABORT => LogEntry::TxnAbort,
            LOG_CHECKPOINT => LogEntry::Checkpoint,
            LOG_CREATE_PAGE => LogEntry::CreatePage {
                page: d.u64()?,
                prev_page: d.u64()?,
                next_page: d.u64()?,
                next_tid: d.i16()?,
            },
            LOG_ADD_VALUE => LogEntry::AddValue {
                page: d.u64()?,
                tid: d.u16()?,
                is_overflow: d.bool()?,
                value: d.bytes()?,
            },
            LOG_REMOVE_VALUE => LogEntry::RemoveValue {
                page: d.u64()?,
                tid: d.u16()?,
                offset: d.u32()?,
                is_overflow: d.bool()?,
                back_link: d.u64()?,
                old_data: d.bytes()?,
            },
            LOG_REMOVE_EMPTY_PAGE => LogEntry::RemoveEmptyPage {
                page: d.u64()?,
                prev_page: d.u64()?,
                next_page: d.u64()?,
            },
            LOG_UPDATE_VALUE => LogEntry::UpdateValue {
                page: d.u64()?,
                tid: d.u16()?,
                value: d.bytes()?,
                old_value: d.bytes()?,
            },
            LOG_REMOVE_PAGE => LogEntry::RemovePage {
                page: d.u64()?,
                prev_page: d.u64()?,
                next_page: d.u64()?,
                old_tid: d.i16()?,
                old_record_count: d.u16()?,
                old_data: d.bytes()?,
            },
            LOG_WRITE_OVERFLOW => LogEntry::WriteOverflow {
                page: d.u64()?,
                next_page: d.u64()?,
                value: d.bytes()?,
            },
            LOG_REMOVE_OVERFLOW => LogEntry::RemoveOverflow {
                page: d.u64()?,
                next_page: d.u64()?,
                old_data: d.bytes()?,
            },
            LOG_INSERT_RECORD => LogEntry::InsertRecord {
                page: d.u64()?,
                offset: d.u32()?,
                tid: d.u16()?,
                is_overflow: d.bool()?,
                value: d.bytes()?,
            },
            LOG_SPLIT_PAGE => LogEntry::SplitPage {
                page: d.u64()?,
                split_offset: d.u32()?,
                old_data: d.bytes()?,
            },
            LOG_ADD_LINK => LogEntry::AddLink {
                page: d.u64()?,
                tid: d.u16()?,
                link: d.u64()?,
            },
            LOG_ADD_MOVED_VALUE => LogEntry::AddMovedValue {
                page: d.u64()?,
                tid: d.u16()?,
                back_link: d.u64()?,
                is_overflow: d.bool()?,
                value: d.bytes()?,
            },
            LOG_UPDATE_HEADER => LogEntry::UpdateHeader {
                page: d.u64()?,
                prev_page: d.u64()?,
                next_page: d.u64()?,
                old_prev: d.u64()?,
                old_next: d.u64()?,
            },
            LOG_UPDATE_LINK => LogEntry::UpdateLink {
                page: d.u64()?,
                offset: d.u32()?,
                link: d.u64()?,
                old_link: d.u64()?,
            },
            LOG_BT_INSERT_VALUE => LogEntry::BTreeInsertValue {
                page: d.u64()?,
                idx: d.u16()?,
                pointer_idx: d.u16()?,
                pointer: d.u64()?,
                key: d.value()?,
            },
            LOG_BT_CREATE_NODE => LogEntry::BTreeCreateNode {
                page: d.u64()?,
                status: d.u8()?,
                parent: d.u64()?,
            },
            LOG_BT_UPDATE_PAGE => {
                let page = d.u64()?;
                let prefix = d.value()?;
                let n_keys = d.u16()? as usize;
                let mut keys = Vec::with_capacity(n_keys);
                for _ in 0..n_keys {
                    keys.push(d.value()?);
                }
                let n_ptrs = d.u16()? as usize;
                let mut pointers = Vec::with_capacity(n_ptrs);
                for _ in 0..n_ptrs {
                    pointers.push(d.u64()?);
                }
                LogEntry::BTreeUpdatePage {
                    page,
                    prefix,
                    keys,
                    pointers,
                }
            }
            LOG_BT_SET_PARENT => LogEntry::BTreeSetParent {
                page: d.u64()?,
                parent: d.u64()?,
            },
            LOG_BT_UPDATE_VALUE => LogEntry::BTreeUpdateValue {
                page: d.u64()?,
                idx: d.u16()?,
                pointer: d.u64()?,
                old_pointer: d.u64()?,
                key: d.value()?,
            },
            LOG_BT_REMOVE_VALUE => LogEntry::BTreeRemoveValue {
                page: d.u64()?,
                idx: d.u16()?,
                old_pointer: d.u64()?,
                old_key: d.value()?,
            },
            LOG_BT_SET_LINK => LogEntry::BTreeSetLink {
                page: d.u64()?,
                next_page: d.u64()?,
            },
            other => return Err(Error::InvalidLogEntry { tag: other }),
        };

        if d.pos != data.len() {
            return Err(Error::DataCorruption {
                details: format!(
                    "{} trailing bytes after journal record {:#04x}",
                    data.len() - d.pos,
                    tag
                ),
            });
        }
        Ok(entry)
    }
}

fn page_str(page: PageNum) -> String {
    if page == NO_PAGE {
        "-".to_string()
    } else {
        page.to_string()
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::TxnStart => write!(f, "start"),
            LogEntry::TxnCommit => write!(f, "commit"),
            LogEntry::TxnAbort => write!(f, "abort"),
            LogEntry::Checkpoint => write!(f, "checkpoint"),
            LogEntry::CreatePage {
                page,
                prev_page,
                next_page,
                ..
            } => write!(
                f,
                "create page {} (prev {}, next {})",
                page,
                page_str(*prev_page),
                page_str(*next_page)
            ),
            LogEntry::AddValue {
                page, tid, value, ..
            } => write!(f, "add value {}:{} ({} bytes)", page, tid, value.len()),
            LogEntry::RemoveValue {
                page,
                tid,
                offset,
                ..
            } => write!(f, "remove value {}:{} at {}", page, tid, offset),
            LogEntry::RemoveEmptyPage { page, .. } => write!(f, "remove empty page {}", page),
            LogEntry::UpdateValue {
                page, tid, value, ..
            } => write!(f, "update value {}:{} ({} bytes)", page, tid, value.len()),
            LogEntry::RemovePage { page, .. } => write!(f, "remove page {}", page),
            LogEntry::WriteOverflow {
                page, next_page, ..
            } => write!(f, "write overflow {} -> {}", page, page_str(*next_page)),
            LogEntry::RemoveOverflow { page, .. } => write!(f, "remove overflow {}", page),
            LogEntry::InsertRecord {
                page,
                offset,
                tid,
                ..
            } => write!(f, "insert {}:{} at {}", page, tid, offset),
            LogEntry::SplitPage {
                page, split_offset, ..
            } => write!(f, "split page {} at {}", page, split_offset),
            LogEntry::AddLink { page, tid, link } => write!(
                f,
                "add link {}:{} -> {}",
                page,
                tid,
                storage_address::to_display(*link)
            ),
            LogEntry::AddMovedValue {
                page,
                tid,
                back_link,
                ..
            } => write!(
                f,
                "add moved value {}:{} from {}",
                page,
                tid,
                storage_address::to_display(*back_link)
            ),
            LogEntry::UpdateHeader {
                page,
                prev_page,
                next_page,
                ..
            } => write!(
                f,
                "update header {} (prev {}, next {})",
                page,
                page_str(*prev_page),
                page_str(*next_page)
            ),
            LogEntry::UpdateLink {
                page, offset, link, ..
            } => write!(
                f,
                "update link {} at {} -> {}",
                page,
                offset,
                storage_address::to_display(*link)
            ),
            LogEntry::BTreeInsertValue { page, idx, key, .. } => {
                write!(f, "btree insert {:?} into {} at {}", key, page, idx)
            }
            LogEntry::BTreeCreateNode { page, status, .. } => {
                write!(f, "btree create node {} (status {})", page, status)
            }
            LogEntry::BTreeUpdatePage { page, keys, .. } => {
                write!(f, "btree update page {} ({} keys)", page, keys.len())
            }
            LogEntry::BTreeSetParent { page, parent } => {
                write!(f, "btree set parent of {} to {}", page, page_str(*parent))
            }
            LogEntry::BTreeUpdateValue { page, idx, key, .. } => {
                write!(f, "btree update {:?} in {} at {}", key, page, idx)
            }
            LogEntry::BTreeRemoveValue {
                page, idx, old_key, ..
            } => write!(f, "btree remove {:?} from {} at {}", old_key, page, idx),
            LogEntry::BTreeSetLink { page, next_page } => {
                write!(f, "btree link {} -> {}", page, page_str(*next_page))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_follow_registry() {
        assert_eq!(
            LogEntry::CreatePage {
                page: 1,
                prev_page: NO_PAGE,
                next_page: NO_PAGE,
                next_tid: -1
            }
            .tag(),
            0x10
        );
        assert_eq!(
            LogEntry::UpdateLink {
                page: 1,
                offset: 0,
                link: 0,
                old_link: 0
            }
            .tag(),
            0x1D
        );
        let bt = LogEntry::BTreeSetLink {
            page: 3,
            next_page: NO_PAGE,
        };
        assert_eq!(bt.tag(), 0x26);
        assert!(bt.is_btree());
        assert!(LogEntry::TxnCommit.is_control());
    }

    #[test]
    fn test_encode_decode_preserves_fields() {
        let entries = vec![
            LogEntry::TxnStart,
            LogEntry::RemoveValue {
                page: 4,
                tid: 0x4003,
                offset: 120,
                old_data: vec![1, 2, 3],
                is_overflow: false,
                back_link: 0x0001_0002,
            },
            LogEntry::RemovePage {
                page: 9,
                prev_page: 8,
                next_page: NO_PAGE,
                old_data: vec![7; 40],
                old_tid: 12,
                old_record_count: 3,
            },
            LogEntry::BTreeUpdatePage {
                page: 2,
                prefix: Value::from("ab"),
                keys: vec![Value::EMPTY, Value::from("c")],
                pointers: vec![1, 5, 9],
            },
        ];
        for entry in entries {
            let decoded = LogEntry::decode(&entry.encode()).unwrap();
            assert_eq!(decoded, entry);
        }
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let err = LogEntry::decode(&[0x7F]).unwrap_err();
        assert!(matches!(err, Error::InvalidLogEntry { tag: 0x7F }));
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let mut data = LogEntry::AddLink {
            page: 1,
            tid: 2,
            link: 3,
        }
        .encode();
        data.pop();
        assert!(matches!(
            LogEntry::decode(&data),
            Err(Error::DataCorruption { .. })
        ));
    }

    #[test]
    fn test_display() {
        let entry = LogEntry::AddLink {
            page: 5,
            tid: 2,
            link: storage_address::create_pointer(7, 1),
        };
        assert_eq!(entry.to_string(), "add link 5:2 -> 7:1");
    }
}
