pub mod core;

pub use core::{
    BTreeIndex, BufferStats, IndexQuery, Journal, LogEntry, LogRecord, NodeIterator, Operator,
    Page, PagedFile, PagedStore, RawNodeIterator, RawRecord, RecordStore, RecoveryReport,
    StoreOptions, StoreStats, TreeStatistics, Txn, Value, WriterSession,
};
pub use core::errors::{Error, Result};
pub use core::node_value::{get_node_value, NodeType};
pub use core::recovery::recover;
pub use core::storage_address::{create_pointer, page_from_pointer, tid_from_pointer};
