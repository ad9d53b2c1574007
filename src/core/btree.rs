use crate::core::buffer_pool::{get_node_buffer, put_node_buffer};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::index_query::{IndexQuery, Operator};
use crate::core::journal::{Journal, Txn};
use crate::core::loggable::{LogEntry, LogRecord};
use crate::core::options::StoreOptions;
use crate::core::paged::{get_u16, get_u64, put_u16, put_u64, Page, PagedFile, PagedStore};
use crate::core::stats::TreeStatistics;
use crate::core::value::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

// B-tree page header, following the generic one
const OFF_PARENT: usize = PAGE_HEADER_LEN;
const OFF_VALUE_COUNT: usize = PAGE_HEADER_LEN + 8;

/// Leaf keys longer than this share nothing with their predecessor on disk.
const MAX_LEAF_PREFIX: usize = i8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Branch,
    Leaf,
}

impl NodeType {
    fn from_status(status: u8) -> Option<Self> {
        match status {
            BRANCH => Some(NodeType::Branch),
            LEAF => Some(NodeType::Leaf),
            _ => None,
        }
    }

    fn status(self) -> u8 {
        match self {
            NodeType::Branch => BRANCH,
            NodeType::Leaf => LEAF,
        }
    }
}

/// Decoded B-tree page.
///
/// Branch keys are stored without the page-wide `prefix`; leaf keys are
/// always complete. Branches hold one more pointer than keys.
#[derive(Clone)]
pub(crate) struct Node {
    page: Page,
    kind: NodeType,
    prefix: Value,
    keys: Vec<Value>,
    ptrs: Vec<u64>,
}

#[inline]
fn child_index(found: std::result::Result<usize, usize>) -> usize {
    match found {
        Ok(i) => i + 1,
        Err(i) => i,
    }
}

impl Node {
    fn blank(mut page: Page, kind: NodeType, parent: PageNum) -> Self {
        page.set_status(kind.status());
        page.set_next_page(NO_PAGE);
        put_u64(page.header_bytes_mut(), OFF_PARENT, parent);
        Node {
            page,
            kind,
            prefix: Value::EMPTY,
            keys: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    fn decode(page: Page, fixed_len: i16) -> Result<Self> {
        let num = page.num();
        let kind = NodeType::from_status(page.status()).ok_or_else(|| {
            Error::corruption(
                "btree",
                num,
                format!("page status {} is not a tree node", page.status()),
            )
        })?;

        let data = page.data();
        let truncated = |what: &str, p: usize| {
            Error::corruption(
                "btree",
                num,
                format!("node data truncated reading {} at offset {}", what, p),
            )
        };

        let mut p = 0;
        let mut prefix = Value::EMPTY;
        if kind == NodeType::Branch {
            if data.len() < 2 {
                return Err(truncated("prefix length", p));
            }
            let len = get_u16(data, p) as usize;
            p += 2;
            let bytes = data.get(p..p + len).ok_or_else(|| truncated("prefix", p))?;
            prefix = Value::from_slice(bytes);
            p += len;
        }

        let n_keys = get_u16(page.header_bytes(), OFF_VALUE_COUNT) as usize;
        let mut keys: Vec<Value> = Vec::with_capacity(n_keys);
        for i in 0..n_keys {
            let size = if fixed_len < 0 {
                let bytes = data.get(p..p + 2).ok_or_else(|| truncated("key length", p))?;
                p += 2;
                get_u16(bytes, 0) as usize
            } else if kind == NodeType::Branch {
                (fixed_len as usize).checked_sub(prefix.len()).ok_or_else(|| {
                    Error::corruption("btree", num, "branch prefix longer than fixed key")
                })?
            } else {
                fixed_len as usize
            };

            if kind == NodeType::Leaf && i > 0 {
                let shared = *data.get(p).ok_or_else(|| truncated("key prefix", p))? as usize;
                p += 1;
                if shared > size || shared > keys[i - 1].len() {
                    return Err(Error::corruption(
                        "btree",
                        num,
                        format!("key {} shares {} bytes with a shorter neighbour", i, shared),
                    ));
                }
                let rest = data
                    .get(p..p + size - shared)
                    .ok_or_else(|| truncated("key", p))?;
                let mut key = Vec::with_capacity(size);
                key.extend_from_slice(&keys[i - 1].as_bytes()[..shared]);
                key.extend_from_slice(rest);
                keys.push(Value::new(key));
                p += size - shared;
            } else {
                let bytes = data.get(p..p + size).ok_or_else(|| truncated("key", p))?;
                keys.push(Value::from_slice(bytes));
                p += size;
            }
        }

        let n_ptrs = match kind {
            NodeType::Branch => n_keys + 1,
            NodeType::Leaf => n_keys,
        };
        let mut ptrs = Vec::with_capacity(n_ptrs);
        for _ in 0..n_ptrs {
            let bytes = data.get(p..p + 8).ok_or_else(|| truncated("pointer", p))?;
            ptrs.push(get_u64(bytes, 0));
            p += 8;
        }

        Ok(Node {
            page,
            kind,
            prefix,
            keys,
            ptrs,
        })
    }

    fn num(&self) -> PageNum {
        self.page.num()
    }

    fn is_leaf(&self) -> bool {
        self.kind == NodeType::Leaf
    }

    fn parent(&self) -> PageNum {
        get_u64(self.page.header_bytes(), OFF_PARENT)
    }

    fn set_parent(&mut self, parent: PageNum) {
        put_u64(self.page.header_bytes_mut(), OFF_PARENT, parent);
    }

    fn next_page(&self) -> PageNum {
        self.page.next_page()
    }

    /// Bytes key `i` of a leaf shares with key `i - 1` on disk.
    fn leaf_prefix_len(&self, i: usize) -> usize {
        let shared = self.keys[i].common_prefix(&self.keys[i - 1]);
        if shared > MAX_LEAF_PREFIX {
            0
        } else {
            shared
        }
    }

    fn key_len_on_disk(&self, i: usize) -> usize {
        if self.is_leaf() && i > 0 {
            self.keys[i].len() - self.leaf_prefix_len(i)
        } else {
            self.keys[i].len()
        }
    }

    fn key_data_len(&self) -> usize {
        (0..self.keys.len()).map(|i| self.key_len_on_disk(i)).sum()
    }

    /// Encoded size of the node in the page work area.
    fn data_len(&self, fixed_len: i16) -> usize {
        let mut len = self.ptrs.len() * 8 + self.key_data_len();
        if fixed_len < 0 {
            len += 2 * self.keys.len();
        }
        match self.kind {
            NodeType::Branch => len += 2 + self.prefix.len(),
            NodeType::Leaf => len += self.keys.len().saturating_sub(1),
        }
        len
    }

    fn encode(&self, fixed_len: i16, buf: &mut Vec<u8>) {
        if self.kind == NodeType::Branch {
            buf.extend_from_slice(&(self.prefix.len() as u16).to_be_bytes());
            buf.extend_from_slice(self.prefix.as_bytes());
        }
        for (i, key) in self.keys.iter().enumerate() {
            if fixed_len < 0 {
                buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
            }
            if self.is_leaf() && i > 0 {
                let shared = self.leaf_prefix_len(i);
                buf.push(shared as u8);
                buf.extend_from_slice(&key.as_bytes()[shared..]);
            } else {
                buf.extend_from_slice(key.as_bytes());
            }
        }
        for ptr in &self.ptrs {
            buf.extend_from_slice(&ptr.to_be_bytes());
        }
    }

    /// Binary search for `key`, taking the branch prefix into account.
    fn search_key(&self, key: &Value) -> std::result::Result<usize, usize> {
        if self.kind == NodeType::Branch && !self.prefix.is_empty() {
            let n = self.keys.len();
            if key.len() < self.prefix.len() {
                return if key <= &self.prefix { Err(0) } else { Err(n) };
            }
            return match key.compare_prefix(&self.prefix) {
                Ordering::Less => Err(0),
                Ordering::Greater => Err(n),
                Ordering::Equal => self.keys.binary_search(&key.strip_prefix(self.prefix.len())),
            };
        }
        self.keys.binary_search(key)
    }

    fn child_for(&self, key: &Value) -> Result<PageNum> {
        let idx = child_index(self.search_key(key));
        self.ptrs.get(idx).copied().ok_or_else(|| {
            Error::corruption(
                "btree",
                self.num(),
                format!("child index {} out of {} pointers", idx, self.ptrs.len()),
            )
        })
    }

    /// Inserts a key at `idx`. Branch keys are stripped of the node prefix,
    /// shrinking it first if `key` does not share all of it.
    fn insert_key(&mut self, key: Value, idx: usize) {
        let key = if self.kind == NodeType::Branch {
            if self.keys.is_empty() {
                self.prefix = key;
                Value::EMPTY
            } else {
                let shared = key.common_prefix(&self.prefix);
                if shared < self.prefix.len() {
                    self.shrink_prefix(shared);
                }
                key.strip_prefix(shared)
            }
        } else {
            key
        };
        self.keys.insert(idx, key);
    }

    /// Moves bytes shared by every key into the prefix.
    fn grow_prefix(&mut self) {
        match self.keys.len() {
            0 => {}
            1 => {
                if !self.keys[0].is_empty() {
                    self.prefix = self.prefix.concat(&self.keys[0]);
                    self.keys[0] = Value::EMPTY;
                }
            }
            _ => {
                let first = &self.keys[0];
                let add = self.keys[1..]
                    .iter()
                    .map(|k| first.common_prefix(k))
                    .min()
                    .unwrap_or(0);
                if add > 0 {
                    self.prefix = self.prefix.concat(&first.head(add));
                    for key in self.keys.iter_mut() {
                        *key = key.strip_prefix(add);
                    }
                }
            }
        }
    }

    fn shrink_prefix(&mut self, new_len: usize) {
        let moved = self.prefix.strip_prefix(new_len);
        for key in self.keys.iter_mut() {
            *key = moved.concat(key);
        }
        self.prefix = self.prefix.head(new_len);
    }

    /// Split point near the byte median of the keys, or at `preferred` if
    /// that comes first.
    fn pivot(&self, preferred: Option<usize>, work_size: usize) -> usize {
        let n = self.keys.len();
        if n == 2 {
            return 1;
        }
        let total = self.key_data_len();
        let mut current = 0;
        let mut pivot = n - 1;
        for i in 0..n - 1 {
            current += self.key_len_on_disk(i);
            if current > total / 2 || Some(i + 1) == preferred {
                pivot = if current > work_size { i } else { i + 1 };
                break;
            }
        }
        pivot.clamp(1, n - 1)
    }

    fn full_key(&self, i: usize) -> Value {
        match self.kind {
            NodeType::Branch => self.prefix.concat(&self.keys[i]),
            NodeType::Leaf => self.keys[i].clone(),
        }
    }
}

fn dump_value(value: &Value) -> String {
    if value.as_bytes().iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        value.to_string()
    } else {
        value
            .as_bytes()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Result of a sequential scan over every tree page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeInfo {
    /// Leaf that no other leaf links to.
    pub first_page: PageNum,
    pub leaf_pages: usize,
    pub branch_pages: usize,
}

/// Paged B+-tree mapping byte keys to 64-bit pointers.
pub struct BTreeIndex {
    file: Arc<PagedFile>,
    journal: Option<Arc<Journal>>,
    fixed_len: i16,
    split_factor: f64,
    recovery_enabled: bool,
    root: Mutex<PageNum>,
    /// Nodes between a split and their promotion that do not fit a page yet.
    overfull: Mutex<HashMap<PageNum, Node>>,
}

impl BTreeIndex {
    /// Opens a standalone B-tree file.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let file = Arc::new(PagedFile::open(path, options, BTREE_FORMAT_VERSION)?);
        Self::with_file(file, None, options)
    }

    /// B-tree living in `file`, creating the root leaf if the file is empty.
    pub fn with_file(
        file: Arc<PagedFile>,
        journal: Option<Arc<Journal>>,
        options: &StoreOptions,
    ) -> Result<Self> {
        let header = file.header();
        let tree = BTreeIndex {
            fixed_len: header.fixed_key_len,
            split_factor: options.split_factor,
            recovery_enabled: options.recovery_enabled,
            root: Mutex::new(header.root_page),
            overfull: Mutex::new(HashMap::new()),
            file,
            journal,
        };

        if header.total_count == 0 {
            let page = tree.file.get_free_page(true)?;
            let root = Node::blank(page, NodeType::Leaf, NO_PAGE);
            tree.write_node(root.clone())?;
            tree.set_root(root.num())?;
            log::debug!("created root leaf {} in {}", root.num(), tree.file.path().display());
        } else {
            tree.file.add_pin(header.root_page);
        }
        Ok(tree)
    }

    pub fn file(&self) -> &Arc<PagedFile> {
        &self.file
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    pub fn root_page(&self) -> PageNum {
        *self.root.lock().recover_poison()
    }

    fn set_root(&self, num: PageNum) -> Result<()> {
        let old = {
            let mut root = self.root.lock().recover_poison();
            std::mem::replace(&mut *root, num)
        };
        if old != num {
            self.file.unpin(old);
        }
        self.file.add_pin(num);
        self.file.update_header(|h| h.root_page = num)?;
        self.file.write_header()
    }

    fn work_size(&self) -> usize {
        self.file.work_size()
    }

    fn read_node(&self, num: PageNum) -> Result<Node> {
        if let Some(node) = self.overfull.lock().recover_poison().get(&num) {
            return Ok(node.clone());
        }
        Node::decode(self.file.read_page(num)?, self.fixed_len)
    }

    /// Encodes the node into its page. A node that does not fit yet is kept
    /// aside until a split shrinks it.
    fn write_node(&self, mut node: Node) -> Result<()> {
        debug_assert_eq!(
            node.ptrs.len(),
            node.keys.len() + (node.kind == NodeType::Branch) as usize
        );
        let len = node.data_len(self.fixed_len);
        let num = node.num();
        if len > self.work_size() {
            log::debug!("node {} needs {} bytes, holding until split", num, len);
            self.overfull.lock().recover_poison().insert(num, node);
            return Ok(());
        }

        let mut buf = get_node_buffer(0);
        node.encode(self.fixed_len, &mut buf);
        debug_assert_eq!(buf.len(), len);
        put_u16(node.page.header_bytes_mut(), OFF_VALUE_COUNT, node.keys.len() as u16);
        node.page.set_data(&buf)?;
        put_node_buffer(buf);

        self.file.write_page(&node.page)?;
        self.overfull.lock().recover_poison().remove(&num);
        Ok(())
    }

    fn create_node(
        &self,
        txn: Option<&Txn>,
        kind: NodeType,
        parent: PageNum,
        reuse_deleted: bool,
    ) -> Result<Node> {
        let page = self.file.get_free_page(reuse_deleted)?;
        let num = page.num();
        let mut node = Node::blank(page, kind, parent);
        if kind == NodeType::Leaf {
            self.log_to(txn, &mut node.page, || LogEntry::BTreeCreateNode {
                page: num,
                status: LEAF,
                parent,
            })?;
        }
        Ok(node)
    }

    /// Journals `entry` and stamps its LSN on the page, when logging applies.
    fn log_to(
        &self,
        txn: Option<&Txn>,
        page: &mut Page,
        entry: impl FnOnce() -> LogEntry,
    ) -> Result<()> {
        if let (Some(txn), Some(journal), true) = (txn, self.journal.as_ref(), self.recovery_enabled) {
            let lsn = journal.write(txn, &entry())?;
            page.set_lsn(lsn);
        }
        Ok(())
    }

    fn check_key(&self, key: &Value) -> Result<()> {
        if self.fixed_len > 0 && key.len() != self.fixed_len as usize {
            return Err(Error::LengthMismatch {
                expected: self.fixed_len as usize,
                actual: key.len(),
            });
        }
        let max = self.file.max_key_size();
        if key.len() > max {
            return Err(Error::ValueTooLarge { len: key.len(), max });
        }
        Ok(())
    }

    /// Inserts or replaces `key`. Returns the previous pointer, or
    /// [`KEY_NOT_FOUND`] for a new key.
    pub fn add_value(&self, txn: Option<&Txn>, key: &Value, pointer: u64) -> Result<u64> {
        if self.file.is_read_only() {
            return Err(Error::read_only("btree add value"));
        }
        self.check_key(key)?;
        self.add_value_at(txn, self.root_page(), key, pointer)
    }

    fn add_value_at(&self, txn: Option<&Txn>, num: PageNum, key: &Value, pointer: u64) -> Result<u64> {
        let mut node = self.read_node(num)?;
        if !node.is_leaf() {
            let child = node.child_for(key)?;
            let _pin = self.file.pin(num);
            return self.add_value_at(txn, child, key, pointer);
        }

        let _pin = self.file.pin(num);
        match node.search_key(key) {
            Ok(idx) => {
                let old = node.ptrs[idx];
                self.log_to(txn, &mut node.page, || LogEntry::BTreeUpdateValue {
                    page: num,
                    idx: idx as u16,
                    key: key.clone(),
                    pointer,
                    old_pointer: old,
                })?;
                node.ptrs[idx] = pointer;
                self.write_node(node)?;
                Ok(old)
            }
            Err(idx) => {
                self.log_to(txn, &mut node.page, || LogEntry::BTreeInsertValue {
                    page: num,
                    idx: idx as u16,
                    key: key.clone(),
                    pointer_idx: idx as u16,
                    pointer,
                })?;
                node.insert_key(key.clone(), idx);
                node.ptrs.insert(idx, pointer);

                if node.data_len(self.fixed_len) > self.work_size() {
                    let n = node.keys.len();
                    let preferred = if self.split_factor > 0.0
                        && idx as f64 > n as f64 * self.split_factor
                        && key.len() < self.work_size() / 4
                    {
                        Some(if idx == 0 { 1 } else { idx })
                    } else {
                        None
                    };
                    self.split(txn, node, preferred)?;
                } else {
                    self.write_node(node)?;
                }
                Ok(KEY_NOT_FOUND)
            }
        }
    }

    /// Removes `key`, returning its pointer or [`KEY_NOT_FOUND`].
    pub fn remove_value(&self, txn: Option<&Txn>, key: &Value) -> Result<u64> {
        if self.file.is_read_only() {
            return Err(Error::read_only("btree remove value"));
        }
        let num = self.find_leaf(key)?;
        let _pin = self.file.pin(num);
        let mut node = self.read_node(num)?;
        match node.search_key(key) {
            Ok(idx) => {
                let old = node.ptrs[idx];
                self.log_to(txn, &mut node.page, || LogEntry::BTreeRemoveValue {
                    page: num,
                    idx: idx as u16,
                    old_key: key.clone(),
                    old_pointer: old,
                })?;
                node.keys.remove(idx);
                node.ptrs.remove(idx);
                self.write_node(node)?;
                Ok(old)
            }
            Err(_) => Ok(KEY_NOT_FOUND),
        }
    }

    pub fn find_value(&self, key: &Value) -> Result<u64> {
        let node = self.read_node(self.find_leaf(key)?)?;
        Ok(match node.search_key(key) {
            Ok(idx) => node.ptrs[idx],
            Err(_) => KEY_NOT_FOUND,
        })
    }

    /// Leaf that holds `key` or would hold it.
    fn find_leaf(&self, key: &Value) -> Result<PageNum> {
        let mut num = self.root_page();
        for _ in 0..MAX_CHAIN_LENGTH {
            let node = self.read_node(num)?;
            if node.is_leaf() {
                return Ok(num);
            }
            num = node.child_for(key)?;
        }
        Err(Error::corruption("btree", num, "tree deeper than any valid tree"))
    }

    fn first_leaf(&self) -> Result<PageNum> {
        let mut num = self.root_page();
        for _ in 0..MAX_CHAIN_LENGTH {
            let node = self.read_node(num)?;
            if node.is_leaf() {
                return Ok(num);
            }
            num = *node
                .ptrs
                .first()
                .ok_or_else(|| Error::corruption("btree", num, "branch without children"))?;
        }
        Err(Error::corruption("btree", num, "tree deeper than any valid tree"))
    }

    fn split(&self, txn: Option<&Txn>, mut node: Node, preferred: Option<usize>) -> Result<()> {
        let num = node.num();
        let _pin = self.file.pin(num);
        if node.keys.len() < 2 {
            return Err(Error::corruption(
                "btree",
                num,
                format!("cannot split a node with {} keys", node.keys.len()),
            ));
        }

        let pivot = node.pivot(preferred, self.work_size());
        let (right_keys, right_ptrs, separator) = match node.kind {
            NodeType::Branch => {
                let right_keys = node.keys.split_off(pivot + 1);
                let right_ptrs = node.ptrs.split_off(pivot + 1);
                let sep = node.keys.pop().unwrap_or(Value::EMPTY);
                (right_keys, right_ptrs, node.prefix.concat(&sep))
            }
            NodeType::Leaf => {
                let right_keys = node.keys.split_off(pivot);
                let right_ptrs = node.ptrs.split_off(pivot);
                let sep = right_keys[0].clone();
                (right_keys, right_ptrs, sep)
            }
        };

        let is_leaf = node.is_leaf();
        if is_leaf {
            let (prefix, keys, ptrs) = (node.prefix.clone(), node.keys.clone(), node.ptrs.clone());
            self.log_to(txn, &mut node.page, || LogEntry::BTreeUpdatePage {
                page: num,
                prefix,
                keys,
                pointers: ptrs,
            })?;
        }
        self.file.metrics().page_split();

        let parent_num = node.parent();
        if parent_num == NO_PAGE {
            let mut parent = self.create_node(None, NodeType::Branch, NO_PAGE, false)?;
            let parent_num = parent.num();
            if is_leaf {
                self.log_to(txn, &mut node.page, || LogEntry::BTreeSetParent {
                    page: num,
                    parent: parent_num,
                })?;
            }
            node.set_parent(parent_num);

            let mut right = self.create_node(txn, node.kind, parent_num, false)?;
            let right_num = right.num();
            right.keys = right_keys;
            right.ptrs = right_ptrs;
            if is_leaf {
                self.log_to(txn, &mut node.page, || LogEntry::BTreeSetLink {
                    page: num,
                    next_page: right_num,
                })?;
                node.page.set_next_page(right_num);
                self.log_update_page(txn, &mut right)?;
            } else {
                right.prefix = node.prefix.clone();
                right.grow_prefix();
            }

            parent.prefix = separator;
            parent.keys = vec![Value::EMPTY];
            parent.ptrs = vec![num, right_num];
            self.write_node(parent)?;
            self.set_root(parent_num)?;
            log::debug!("root split: new root {} over {} and {}", parent_num, num, right_num);

            self.write_node(node)?;
            if !is_leaf {
                self.set_as_parent(&right)?;
            }
            self.write_node(right)?;
        } else {
            let mut right = self.create_node(txn, node.kind, parent_num, false)?;
            let right_num = right.num();
            right.keys = right_keys;
            right.ptrs = right_ptrs;
            if is_leaf {
                let old_next = node.next_page();
                self.log_to(txn, &mut right.page, || LogEntry::BTreeSetLink {
                    page: right_num,
                    next_page: old_next,
                })?;
                self.log_to(txn, &mut node.page, || LogEntry::BTreeSetLink {
                    page: num,
                    next_page: right_num,
                })?;
                right.page.set_next_page(old_next);
                node.page.set_next_page(right_num);
                self.log_update_page(txn, &mut right)?;
            } else {
                right.prefix = node.prefix.clone();
                right.grow_prefix();
            }

            self.write_node(node)?;
            if !is_leaf {
                self.set_as_parent(&right)?;
            }
            self.write_node(right)?;

            self.promote(txn, parent_num, separator, right_num)?;
        }

        self.split_if_overfull(txn, num)
    }

    fn log_update_page(&self, txn: Option<&Txn>, node: &mut Node) -> Result<()> {
        let num = node.num();
        let (prefix, keys, ptrs) = (node.prefix.clone(), node.keys.clone(), node.ptrs.clone());
        self.log_to(txn, &mut node.page, || LogEntry::BTreeUpdatePage {
            page: num,
            prefix,
            keys,
            pointers: ptrs,
        })
    }

    /// Splits every node still held aside, starting with `first`.
    fn split_if_overfull(&self, txn: Option<&Txn>, first: PageNum) -> Result<()> {
        let mut pending = vec![first];
        loop {
            let num = match pending.pop() {
                Some(num) => num,
                None => {
                    let overfull = self.overfull.lock().recover_poison();
                    match overfull.keys().min().copied() {
                        Some(num) => num,
                        None => return Ok(()),
                    }
                }
            };
            let held = self.overfull.lock().recover_poison().remove(&num);
            if let Some(node) = held {
                log::debug!("node {} requires another split", num);
                self.split(txn, node, None)?;
            }
        }
    }

    fn promote(&self, txn: Option<&Txn>, parent_num: PageNum, key: Value, right: PageNum) -> Result<()> {
        let _pin = self.file.pin(parent_num);
        let mut parent = self.read_node(parent_num)?;
        if parent.is_leaf() {
            return Err(Error::corruption(
                "btree",
                parent_num,
                "promotion target is a leaf",
            ));
        }
        let idx = child_index(parent.search_key(&key));
        parent.insert_key(key, idx);
        parent.ptrs.insert(idx + 1, right);
        self.set_parent(right, parent_num)?;

        if parent.data_len(self.fixed_len) > self.work_size() {
            self.split(txn, parent, None)
        } else {
            self.write_node(parent)
        }
    }

    fn set_parent(&self, num: PageNum, parent: PageNum) -> Result<()> {
        let mut node = self.read_node(num)?;
        if node.parent() != parent {
            node.set_parent(parent);
            self.write_node(node)?;
        }
        Ok(())
    }

    fn set_as_parent(&self, node: &Node) -> Result<()> {
        if node.is_leaf() {
            return Ok(());
        }
        for &child in &node.ptrs {
            self.set_parent(child, node.num())?;
        }
        Ok(())
    }

    /// Visits every leaf key from `start` along the leaf chain until `visit`
    /// returns false.
    fn scan_leaves(&self, start: PageNum, visit: &mut dyn FnMut(&Value, u64) -> bool) -> Result<()> {
        let mut num = start;
        let mut hops = 0;
        while num != NO_PAGE {
            hops += 1;
            if hops > MAX_CHAIN_LENGTH {
                return Err(Error::corruption("btree", num, "cycle in leaf chain"));
            }
            let node = self.read_node(num)?;
            if !node.is_leaf() {
                return Err(Error::corruption("btree", num, "branch page in leaf chain"));
            }
            for (key, ptr) in node.keys.iter().zip(node.ptrs.iter()) {
                if !visit(key, *ptr) {
                    return Ok(());
                }
            }
            num = node.next_page();
        }
        Ok(())
    }

    fn start_leaf(&self, bound: Option<&Value>) -> Result<PageNum> {
        match bound {
            Some(key) => self.find_leaf(key),
            None => self.first_leaf(),
        }
    }

    /// Calls `callback` for every key matching `query`, in key order.
    /// Returning false from the callback ends the scan.
    pub fn query<F>(&self, query: &IndexQuery, mut callback: F) -> Result<()>
    where
        F: FnMut(&Value, u64) -> bool,
    {
        let query = query.normalized();
        let start = self.start_leaf(query.lower_bound())?;
        self.scan_leaves(start, &mut |key, ptr| {
            if query.past_end(key) {
                return false;
            }
            if query.test_value(key) {
                return callback(key, ptr);
            }
            true
        })
    }

    /// Like [`BTreeIndex::query`], restricted to keys starting with `prefix`.
    pub fn query_prefix<F>(&self, prefix: &Value, query: &IndexQuery, mut callback: F) -> Result<()>
    where
        F: FnMut(&Value, u64) -> bool,
    {
        let query = query.normalized();
        let start_key = match query.lower_bound() {
            Some(bound) if bound > prefix => bound.clone(),
            _ => prefix.clone(),
        };
        let start = self.find_leaf(&start_key)?;
        self.scan_leaves(start, &mut |key, ptr| {
            if key.compare_prefix(prefix) == Ordering::Greater || query.past_end(key) {
                return false;
            }
            if key.starts_with(prefix) && query.test_value(key) {
                return callback(key, ptr);
            }
            true
        })
    }

    /// Removes every key matching `query`, reporting each to `callback`
    /// before it goes. Returns the number of keys removed.
    pub fn remove_query<F>(&self, txn: Option<&Txn>, query: &IndexQuery, mut callback: F) -> Result<usize>
    where
        F: FnMut(&Value, u64) -> bool,
    {
        if self.file.is_read_only() {
            return Err(Error::read_only("btree remove"));
        }
        let query = query.normalized();
        let mut num = self.start_leaf(query.lower_bound())?;
        let mut removed = 0;
        let mut hops = 0;

        while num != NO_PAGE {
            hops += 1;
            if hops > MAX_CHAIN_LENGTH {
                return Err(Error::corruption("btree", num, "cycle in leaf chain"));
            }
            let _pin = self.file.pin(num);
            let mut node = self.read_node(num)?;
            let mut changed = false;
            let mut done = false;
            let mut i = 0;

            while i < node.keys.len() {
                if query.past_end(&node.keys[i]) {
                    done = true;
                    break;
                }
                if !query.test_value(&node.keys[i]) {
                    i += 1;
                    continue;
                }
                let key = node.keys[i].clone();
                let ptr = node.ptrs[i];
                self.log_to(txn, &mut node.page, || LogEntry::BTreeRemoveValue {
                    page: num,
                    idx: i as u16,
                    old_key: key.clone(),
                    old_pointer: ptr,
                })?;
                node.keys.remove(i);
                node.ptrs.remove(i);
                changed = true;
                removed += 1;
                if !callback(&key, ptr) {
                    done = true;
                    break;
                }
            }

            let next = node.next_page();
            if changed {
                self.write_node(node)?;
            }
            if done {
                break;
            }
            num = next;
        }
        Ok(removed)
    }

    /// Tests every leaf in page order, ignoring the tree structure.
    pub fn raw_scan<F>(&self, query: Option<&IndexQuery>, mut callback: F) -> Result<()>
    where
        F: FnMut(&Value, u64) -> bool,
    {
        for num in 0..self.file.total_count() {
            let page = self.file.read_page(num)?;
            if page.status() != LEAF {
                continue;
            }
            let node = Node::decode(page, self.fixed_len)?;
            for (key, ptr) in node.keys.iter().zip(node.ptrs.iter()) {
                if query.map_or(true, |q| q.test_value(key)) && !callback(key, *ptr) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    pub fn find_values_by_prefix(&self, prefix: &Value) -> Result<Vec<(Value, u64)>> {
        let mut found = Vec::new();
        self.query(
            &IndexQuery::new(Operator::TruncRight, prefix.clone()),
            |key, ptr| {
                found.push((key.clone(), ptr));
                true
            },
        )?;
        Ok(found)
    }

    pub fn tree_statistics(&self) -> Result<TreeStatistics> {
        let mut stats = TreeStatistics::default();
        self.collect_statistics(self.root_page(), 1, &mut stats)?;
        Ok(stats)
    }

    fn collect_statistics(&self, num: PageNum, depth: usize, stats: &mut TreeStatistics) -> Result<()> {
        let node = self.read_node(num)?;
        stats.depth = stats.depth.max(depth);
        if node.is_leaf() {
            stats.leaf_pages += 1;
            stats.entries += node.keys.len() as u64;
            return Ok(());
        }
        stats.branch_pages += 1;
        for &child in &node.ptrs {
            self.collect_statistics(child, depth + 1, stats)?;
        }
        Ok(())
    }

    /// Writes a human readable rendering of the tree, root first.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        self.dump_node(self.root_page(), out)
    }

    fn dump_node(&self, num: PageNum, out: &mut dyn Write) -> Result<()> {
        let node = self.read_node(num)?;
        if num == self.root_page() {
            write!(out, "ROOT: ")?;
        }
        write!(out, "{}: {}: ", num, if node.is_leaf() { "LEAF" } else { "BRANCH" })?;
        if !node.is_leaf() {
            write!(out, "PREFIX: {}: ", dump_value(&node.prefix))?;
        }
        let next = node.next_page();
        if next == NO_PAGE {
            write!(out, "NEXT: -1: ")?;
        } else {
            write!(out, "NEXT: {}: ", next)?;
        }
        let keys: Vec<String> = node.keys.iter().map(dump_value).collect();
        writeln!(out, "{}", keys.join(" "))?;
        if !node.is_leaf() {
            let ptrs: Vec<String> = node.ptrs.iter().map(|p| p.to_string()).collect();
            writeln!(out, "{}", ptrs.join(" "))?;
        }
        writeln!(out, "{}", "-".repeat(60))?;
        if !node.is_leaf() {
            for &child in &node.ptrs {
                self.dump_node(child, out)?;
            }
        }
        Ok(())
    }

    /// Reads every page in file order, locating the head of the leaf chain.
    /// With `remove_branches` the branch pages go back on the free list.
    pub fn scan_tree(&self, remove_branches: bool) -> Result<TreeInfo> {
        let mut leaves = Vec::new();
        let mut linked = HashSet::new();
        let mut branches = Vec::new();

        for num in 0..self.file.total_count() {
            let page = self.file.read_page(num)?;
            match page.status() {
                LEAF => {
                    leaves.push(num);
                    if page.next_page() != NO_PAGE {
                        linked.insert(page.next_page());
                    }
                }
                BRANCH => branches.push(num),
                _ => {}
            }
        }

        let heads: Vec<PageNum> = leaves.iter().copied().filter(|p| !linked.contains(p)).collect();
        if heads.len() > 1 {
            log::error!("found multiple leaf chain heads: {:?}", heads);
            return Err(Error::corruption(
                "btree",
                heads[0],
                format!("more than one start page found: {:?}", heads),
            ));
        }

        if remove_branches {
            let root = self.root_page();
            if branches.contains(&root) {
                self.file.unpin(root);
            }
            for &num in &branches {
                self.overfull.lock().recover_poison().remove(&num);
                self.file.unlink_page(num)?;
            }
        }

        Ok(TreeInfo {
            first_page: heads.first().copied().unwrap_or(NO_PAGE),
            leaf_pages: leaves.len(),
            branch_pages: branches.len(),
        })
    }

    /// Regenerates the branch levels from the leaf chain.
    pub fn rebuild(&self, remove_branches: bool) -> Result<()> {
        let info = self.scan_tree(remove_branches)?;
        log::info!(
            "rebuilding {} from {} leaf pages",
            self.file.path().display(),
            info.leaf_pages
        );

        if info.first_page == NO_PAGE {
            let root = self.create_node(None, NodeType::Leaf, NO_PAGE, true)?;
            let num = root.num();
            self.write_node(root)?;
            return self.set_root(num);
        }

        if info.leaf_pages == 1 {
            self.set_parent(info.first_page, NO_PAGE)?;
            return self.set_root(info.first_page);
        }

        let mut root = self.create_node(None, NodeType::Branch, NO_PAGE, false)?;
        let root_num = root.num();
        root.ptrs = vec![info.first_page];
        self.write_node(root)?;
        self.set_root(root_num)?;
        self.set_parent(info.first_page, root_num)?;

        let mut next = self.read_node(info.first_page)?.next_page();
        let mut hops = 0;
        while next != NO_PAGE {
            hops += 1;
            if hops > MAX_CHAIN_LENGTH {
                return Err(Error::corruption("btree", next, "cycle in leaf chain"));
            }
            let node = self.read_node(next)?;
            let num = next;
            next = node.next_page();
            let key = match node.keys.first() {
                Some(key) => key.clone(),
                None => continue,
            };
            let parent = self.find_parent(&key)?;
            self.promote(None, parent, key, num)?;
        }
        Ok(())
    }

    /// Lowest branch on the search path of `key`.
    fn find_parent(&self, key: &Value) -> Result<PageNum> {
        let mut num = self.root_page();
        let mut last = num;
        for _ in 0..MAX_CHAIN_LENGTH {
            let node = self.read_node(num)?;
            if node.is_leaf() {
                if last == num {
                    return Err(Error::corruption("btree", num, "no branch above leaf"));
                }
                return Ok(last);
            }
            last = num;
            num = node.child_for(key)?;
        }
        Err(Error::corruption("btree", num, "tree deeper than any valid tree"))
    }

    /// Number of nodes held aside because they do not fit a page.
    pub fn pending_splits(&self) -> usize {
        self.overfull.lock().recover_poison().len()
    }

    pub fn flush(&self) -> Result<()> {
        if self.pending_splits() > 0 {
            return Err(Error::corruption(
                "btree",
                self.root_page(),
                "flush with unsplit nodes",
            ));
        }
        self.file.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.file.unpin(self.root_page());
        self.file.close()
    }

    // Recovery

    fn requires_redo(record: &LogRecord, page: &Page) -> bool {
        record.lsn > page.lsn()
    }

    fn node_for_redo(&self, record: &LogRecord, num: PageNum) -> Result<Option<Node>> {
        self.file.ensure_allocated(num)?;
        let page = self.file.read_page(num)?;
        if !Self::requires_redo(record, &page) {
            return Ok(None);
        }
        Node::decode(page, self.fixed_len).map(Some)
    }

    fn redo_failure(&self, num: PageNum, details: String) -> Error {
        let mut dump = Vec::new();
        if self.dump(&mut dump).is_ok() {
            log::warn!("tree at redo failure:\n{}", String::from_utf8_lossy(&dump));
        }
        Error::corruption("btree", num, details)
    }

    /// Reapplies a journaled B-tree change unless the page already has it.
    pub fn redo(&self, record: &LogRecord) -> Result<()> {
        let lsn = record.lsn;
        match &record.entry {
            LogEntry::BTreeCreateNode { page, status, parent } => {
                self.file.ensure_allocated(*page)?;
                let current = self.file.read_page(*page)?;
                let is_node = matches!(current.status(), BRANCH | LEAF);
                if is_node && current.lsn() != LSN_INVALID && !Self::requires_redo(record, &current) {
                    return Ok(());
                }
                self.file.reclaim_free_page(*page)?;
                let kind = NodeType::from_status(*status).ok_or_else(|| {
                    Error::corruption("btree", *page, format!("bad node status {}", status))
                })?;
                let mut node = Node::blank(self.file.new_page(*page), kind, *parent);
                node.page.set_lsn(lsn);
                self.write_node(node)?;
            }
            LogEntry::BTreeInsertValue {
                page,
                idx,
                key,
                pointer_idx,
                pointer,
            } => {
                if let Some(mut node) = self.node_for_redo(record, *page)? {
                    let (idx, pidx) = (*idx as usize, *pointer_idx as usize);
                    if idx > node.keys.len() || pidx > node.ptrs.len() {
                        return Err(self.redo_failure(
                            *page,
                            format!("insert at {} into {} keys", idx, node.keys.len()),
                        ));
                    }
                    node.insert_key(key.clone(), idx);
                    node.ptrs.insert(pidx, *pointer);
                    node.page.set_lsn(lsn);
                    self.write_node(node)?;
                }
            }
            LogEntry::BTreeUpdateValue {
                page, idx, pointer, ..
            } => {
                if let Some(mut node) = self.node_for_redo(record, *page)? {
                    if node.page.lsn() == LSN_INVALID {
                        return Ok(());
                    }
                    let idx = *idx as usize;
                    if idx >= node.ptrs.len() {
                        return Err(self.redo_failure(
                            *page,
                            format!("update at {} of {} pointers", idx, node.ptrs.len()),
                        ));
                    }
                    node.ptrs[idx] = *pointer;
                    node.page.set_lsn(lsn);
                    self.write_node(node)?;
                }
            }
            LogEntry::BTreeRemoveValue { page, idx, .. } => {
                if let Some(mut node) = self.node_for_redo(record, *page)? {
                    if node.page.lsn() == LSN_INVALID {
                        return Ok(());
                    }
                    let idx = *idx as usize;
                    if idx >= node.keys.len() {
                        return Err(self.redo_failure(
                            *page,
                            format!("remove at {} of {} keys", idx, node.keys.len()),
                        ));
                    }
                    node.keys.remove(idx);
                    node.ptrs.remove(idx);
                    node.page.set_lsn(lsn);
                    self.write_node(node)?;
                }
            }
            LogEntry::BTreeUpdatePage {
                page,
                prefix,
                keys,
                pointers,
            } => {
                if let Some(mut node) = self.node_for_redo(record, *page)? {
                    node.prefix = prefix.clone();
                    node.keys = keys.clone();
                    node.ptrs = pointers.clone();
                    node.page.set_lsn(lsn);
                    self.write_node(node)?;
                }
            }
            LogEntry::BTreeSetParent { page, parent } => {
                if let Some(mut node) = self.node_for_redo(record, *page)? {
                    node.set_parent(*parent);
                    node.page.set_lsn(lsn);
                    self.write_node(node)?;
                }
            }
            LogEntry::BTreeSetLink { page, next_page } => {
                if let Some(mut node) = self.node_for_redo(record, *page)? {
                    node.page.set_next_page(*next_page);
                    node.page.set_lsn(lsn);
                    self.write_node(node)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Reverses a journaled B-tree change by key, wherever the key lives now.
    pub fn undo(&self, record: &LogRecord) -> Result<()> {
        match &record.entry {
            LogEntry::BTreeInsertValue { key, .. } => {
                self.remove_value(None, key)?;
            }
            LogEntry::BTreeUpdateValue {
                key, old_pointer, ..
            } => {
                self.add_value(None, key, *old_pointer)?;
            }
            LogEntry::BTreeRemoveValue {
                old_key,
                old_pointer,
                ..
            } => {
                self.add_value(None, old_key, *old_pointer)?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn cleanup(path: &str) {
        let _ = fs::remove_file(path);
        let _ = fs::remove_file(format!("{}.lock", path));
    }

    fn leaf(keys: &[&str]) -> Node {
        let page = Page::from_raw(1, vec![0u8; 512], 64);
        let mut node = Node::blank(page, NodeType::Leaf, NO_PAGE);
        for (i, k) in keys.iter().enumerate() {
            node.keys.push(Value::from(*k));
            node.ptrs.push(i as u64);
        }
        node
    }

    fn reencode(node: &Node, fixed_len: i16) -> Node {
        let mut page = node.page.clone();
        let mut buf = Vec::new();
        node.encode(fixed_len, &mut buf);
        assert_eq!(buf.len(), node.data_len(fixed_len));
        put_u16(page.header_bytes_mut(), OFF_VALUE_COUNT, node.keys.len() as u16);
        page.set_data(&buf).unwrap();
        Node::decode(page, fixed_len).unwrap()
    }

    #[test]
    fn test_leaf_keys_share_prefix_with_predecessor() {
        let node = leaf(&["document", "documents", "dog"]);
        // 3 ptrs, 3 length fields, "document" + (1 + "s") + (1 + "g")
        assert_eq!(node.data_len(-1), 24 + 6 + 8 + 2 + 2);

        let decoded = reencode(&node, -1);
        assert_eq!(decoded.keys, node.keys);
        assert_eq!(decoded.ptrs, node.ptrs);
    }

    #[test]
    fn test_fixed_length_keys_omit_length() {
        let node = leaf(&["aaaa", "aabb", "bbbb"]);
        assert_eq!(node.data_len(4), 24 + 4 + (1 + 2) + (1 + 4));
        let decoded = reencode(&node, 4);
        assert_eq!(decoded.keys, node.keys);
    }

    #[test]
    fn test_branch_prefix_search() {
        let page = Page::from_raw(2, vec![0u8; 512], 64);
        let mut node = Node::blank(page, NodeType::Branch, NO_PAGE);
        node.prefix = Value::from("m");
        node.keys = vec![Value::EMPTY];
        node.ptrs = vec![10, 11];

        assert_eq!(node.child_for(&Value::from("a")).unwrap(), 10);
        assert_eq!(node.child_for(&Value::from("m")).unwrap(), 11);
        assert_eq!(node.child_for(&Value::from("mz")).unwrap(), 11);
        assert_eq!(node.child_for(&Value::from("z")).unwrap(), 11);

        let decoded = reencode(&node, -1);
        assert_eq!(decoded.prefix, Value::from("m"));
        assert_eq!(decoded.ptrs, vec![10, 11]);
    }

    #[test]
    fn test_insert_key_shrinks_branch_prefix() {
        let page = Page::from_raw(2, vec![0u8; 512], 64);
        let mut node = Node::blank(page, NodeType::Branch, NO_PAGE);
        node.insert_key(Value::from("abc"), 0);
        assert_eq!(node.prefix, Value::from("abc"));
        assert_eq!(node.keys, vec![Value::EMPTY]);

        node.insert_key(Value::from("abz"), 1);
        assert_eq!(node.prefix, Value::from("ab"));
        assert_eq!(node.keys, vec![Value::from("c"), Value::from("z")]);
        assert_eq!(node.full_key(1), Value::from("abz"));
    }

    #[test]
    fn test_grow_prefix() {
        let page = Page::from_raw(2, vec![0u8; 512], 64);
        let mut node = Node::blank(page, NodeType::Branch, NO_PAGE);
        node.prefix = Value::from("x");
        node.keys = vec![Value::from("key1"), Value::from("key2"), Value::from("kez")];
        node.grow_prefix();
        assert_eq!(node.prefix, Value::from("xke"));
        assert_eq!(node.keys, vec![Value::from("y1"), Value::from("y2"), Value::from("z")]);

        node.keys = vec![Value::from("q")];
        node.grow_prefix();
        assert_eq!(node.prefix, Value::from("xkeq"));
        assert_eq!(node.keys, vec![Value::EMPTY]);
    }

    #[test]
    fn test_pivot_near_byte_median() {
        let node = leaf(&["a", "b", "c", "d", "e", "f"]);
        let pivot = node.pivot(None, 1000);
        assert!((2..=4).contains(&pivot));
        assert_eq!(leaf(&["a", "b"]).pivot(None, 1000), 1);
        assert_eq!(node.pivot(Some(1), 1000), 1);
    }

    #[test]
    fn test_corrupt_node_is_reported() {
        let mut page = Page::from_raw(5, vec![0u8; 256], 64);
        page.set_status(LEAF);
        put_u16(page.header_bytes_mut(), OFF_VALUE_COUNT, 3);
        page.set_data(&[0, 1]).unwrap();
        assert!(matches!(
            Node::decode(page, -1),
            Err(Error::Corruption { page_num: 5, .. })
        ));
    }

    #[test]
    fn test_add_find_remove() {
        let path = "/tmp/test_btree_basic.dbx";
        cleanup(path);

        let tree = BTreeIndex::open(path, &StoreOptions::default()).unwrap();
        assert_eq!(tree.add_value(None, &Value::from("k1"), 100).unwrap(), KEY_NOT_FOUND);
        assert_eq!(tree.add_value(None, &Value::from("k2"), 200).unwrap(), KEY_NOT_FOUND);
        assert_eq!(tree.add_value(None, &Value::from("k1"), 101).unwrap(), 100);

        assert_eq!(tree.find_value(&Value::from("k1")).unwrap(), 101);
        assert_eq!(tree.find_value(&Value::from("k3")).unwrap(), KEY_NOT_FOUND);
        assert_eq!(tree.remove_value(None, &Value::from("k2")).unwrap(), 200);
        assert_eq!(tree.remove_value(None, &Value::from("k2")).unwrap(), KEY_NOT_FOUND);
        tree.close().unwrap();

        cleanup(path);
    }

    #[test]
    fn test_key_limits() {
        let path = "/tmp/test_btree_limits.dbx";
        cleanup(path);

        let tree = BTreeIndex::open(path, &StoreOptions::default()).unwrap();
        let max = tree.file().max_key_size();
        let big = Value::new(vec![7u8; max + 1]);
        assert!(matches!(
            tree.add_value(None, &big, 1),
            Err(Error::ValueTooLarge { .. })
        ));
        drop(tree);
        cleanup(path);

        let mut opts = StoreOptions::default();
        opts.fixed_key_len = 4;
        let tree = BTreeIndex::open(path, &opts).unwrap();
        assert!(matches!(
            tree.add_value(None, &Value::from("abc"), 1),
            Err(Error::LengthMismatch { expected: 4, actual: 3 })
        ));
        tree.add_value(None, &Value::from("abcd"), 1).unwrap();

        cleanup(path);
    }

    #[test]
    fn test_query_operators() {
        let path = "/tmp/test_btree_query.dbx";
        cleanup(path);

        let mut opts = StoreOptions::default().with_page_size(256);
        opts.page_header_size = 64;
        let tree = BTreeIndex::open(path, &opts).unwrap();
        for i in 0..200u64 {
            tree.add_value(None, &Value::from(format!("key{:03}", i).as_str()), i).unwrap();
        }

        let collect = |q: IndexQuery| {
            let mut out = Vec::new();
            tree.query(&q, |_, p| {
                out.push(p);
                true
            })
            .unwrap();
            out
        };

        assert_eq!(collect(IndexQuery::new(Operator::Eq, "key042")), vec![42]);
        assert_eq!(collect(IndexQuery::new(Operator::Lt, "key003")), vec![0, 1, 2]);
        assert_eq!(collect(IndexQuery::new(Operator::Geq, "key197")), vec![197, 198, 199]);
        assert_eq!(
            collect(IndexQuery::between(Operator::Bw, "key010", "key013")),
            vec![10, 11, 12, 13]
        );
        assert_eq!(collect(IndexQuery::new(Operator::TruncRight, "key15")).len(), 10);
        assert_eq!(collect(IndexQuery::new(Operator::Neq, "key000")).len(), 199);
        assert_eq!(
            collect(IndexQuery::set(
                Operator::In,
                vec![Value::from("key150"), Value::from("key005")]
            )),
            vec![5, 150]
        );

        let mut first_two = Vec::new();
        tree.query(&IndexQuery::any(), |_, p| {
            first_two.push(p);
            first_two.len() < 2
        })
        .unwrap();
        assert_eq!(first_two, vec![0, 1]);

        cleanup(path);
    }
}
