pub type PageNum = u64;

pub type Lsn = u64;

pub type TransactionID = u64;

/// Null page reference. Encodes as all-ones (-1) on disk.
pub const NO_PAGE: PageNum = u64::MAX;

/// Sentinel pointer for "no such key / record".
pub const KEY_NOT_FOUND: u64 = u64::MAX;

pub const LSN_INVALID: Lsn = 0;

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 256;
/// The file header occupies one page and records its own size in 16 bits.
pub const MAX_PAGE_SIZE: usize = 32768;
pub const DEFAULT_PAGE_HEADER_SIZE: usize = 64;
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Reserved per key when deriving the max key size from the work size.
pub const MIN_SPACE_PER_KEY: usize = 32;

// Page status bytes
pub const UNUSED: u8 = 0;
pub const LEAF: u8 = 1;
pub const BRANCH: u8 = 2;
pub const RECORD: u8 = 20;
pub const OVERFLOW: u8 = 126;

// On-disk format versions
pub const BTREE_FORMAT_VERSION: u16 = 2;
pub const DOM_FORMAT_VERSION: u16 = 10;

/// Size of the serialized file header, before the page area padding.
pub const FILE_HEADER_LEN: usize = 51;
/// B-tree extension of the file header: root page (8) and fixed key length (2).
pub const BTREE_FILE_HEADER_LEN: usize = FILE_HEADER_LEN + 10;

/// status(1) data_len(4) next_page(8) lsn(8)
pub const PAGE_HEADER_LEN: usize = 21;
/// parent_page(8) value_count(2)
pub const BTREE_PAGE_HEADER_LEN: usize = PAGE_HEADER_LEN + 10;
/// record_count(2) data_length(4) next_data_page(8) prev_data_page(8) current_tid(2)
pub const DOM_PAGE_HEADER_LEN: usize = BTREE_PAGE_HEADER_LEN + 24;

// Record framing inside a record page
pub const LENGTH_TID: usize = 2;
pub const LENGTH_DATA_LENGTH: usize = 2;
pub const LENGTH_LINK: usize = 8;
pub const LENGTH_FORWARD_LOCATION: usize = 8;
pub const LENGTH_ORIGINAL_LOCATION: usize = 8;
pub const LENGTH_OVERFLOW_LOCATION: usize = 8;

/// Stored length marking a record whose payload lives in an overflow chain.
pub const OVERFLOW_LENGTH: u16 = 0;

// Journal record type tags, record store
pub const LOG_CREATE_PAGE: u8 = 0x10;
pub const LOG_ADD_VALUE: u8 = 0x11;
pub const LOG_REMOVE_VALUE: u8 = 0x12;
pub const LOG_REMOVE_EMPTY_PAGE: u8 = 0x13;
pub const LOG_UPDATE_VALUE: u8 = 0x14;
pub const LOG_REMOVE_PAGE: u8 = 0x15;
pub const LOG_WRITE_OVERFLOW: u8 = 0x16;
pub const LOG_REMOVE_OVERFLOW: u8 = 0x17;
pub const LOG_INSERT_RECORD: u8 = 0x18;
pub const LOG_SPLIT_PAGE: u8 = 0x19;
pub const LOG_ADD_LINK: u8 = 0x1A;
pub const LOG_ADD_MOVED_VALUE: u8 = 0x1B;
pub const LOG_UPDATE_HEADER: u8 = 0x1C;
pub const LOG_UPDATE_LINK: u8 = 0x1D;

// Journal record type tags, B-tree
pub const LOG_BT_INSERT_VALUE: u8 = 0x20;
pub const LOG_BT_CREATE_NODE: u8 = 0x21;
pub const LOG_BT_UPDATE_PAGE: u8 = 0x22;
pub const LOG_BT_SET_PARENT: u8 = 0x23;
pub const LOG_BT_UPDATE_VALUE: u8 = 0x24;
pub const LOG_BT_REMOVE_VALUE: u8 = 0x25;
pub const LOG_BT_SET_LINK: u8 = 0x26;

// Journal control records
pub const LOG_TXN_START: u8 = 0x01;
pub const LOG_TXN_COMMIT: u8 = 0x02;
pub const LOG_TXN_ABORT: u8 = 0x03;
pub const LOG_CHECKPOINT: u8 = 0x04;

pub const JOURNAL_MAGIC: [u8; 4] = *b"DJNL";
pub const JOURNAL_VERSION: u32 = 1;
pub const JOURNAL_HEADER_SIZE: usize = 24;
pub const JOURNAL_BUFFER_SIZE: usize = 64 * 1024;

/// Hard stop when walking page chains, guards against cycles.
pub const MAX_CHAIN_LENGTH: usize = 250_000;
