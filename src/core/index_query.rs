use crate::core::value::Value;
use std::cmp::Ordering;

static EMPTY_VALUE: Value = Value::EMPTY;

/// Comparison operators understood by [`IndexQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Geq,
    Lt,
    Leq,
    /// Between, both ends inclusive.
    Bw,
    /// Between, both ends exclusive.
    Bwx,
    Nbw,
    Nbwx,
    In,
    Nin,
    /// Keys starting with the query value.
    TruncRight,
    /// Keys ending with the query value.
    TruncLeft,
    /// Half-open range `[from, to)`.
    Range,
    Any,
}

impl Operator {
    pub fn is_negated(self) -> bool {
        matches!(self, Operator::Neq | Operator::Nbw | Operator::Nbwx | Operator::Nin)
    }
}

/// A key predicate evaluated against B-tree keys.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    op: Operator,
    values: Vec<Value>,
}

impl IndexQuery {
    pub fn new(op: Operator, value: impl Into<Value>) -> Self {
        Self {
            op,
            values: vec![value.into()],
        }
    }

    pub fn between(op: Operator, from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self {
            op,
            values: vec![from.into(), to.into()],
        }
    }

    /// Set membership query for `In` / `Nin`. Values are kept sorted.
    pub fn set(op: Operator, mut values: Vec<Value>) -> Self {
        values.sort();
        values.dedup();
        Self { op, values }
    }

    pub fn any() -> Self {
        Self {
            op: Operator::Any,
            values: Vec::new(),
        }
    }

    pub fn operator(&self) -> Operator {
        self.op
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    fn first(&self) -> &Value {
        self.values.first().unwrap_or(&EMPTY_VALUE)
    }

    fn last(&self) -> &Value {
        self.values.last().unwrap_or(&EMPTY_VALUE)
    }

    pub fn test_value(&self, key: &Value) -> bool {
        match self.op {
            Operator::Eq => key == self.first(),
            Operator::Neq => key != self.first(),
            Operator::Gt => key > self.first(),
            Operator::Geq => key >= self.first(),
            Operator::Lt => key < self.first(),
            Operator::Leq => key <= self.first(),
            Operator::Bw => key >= self.first() && key <= self.last(),
            Operator::Bwx => key > self.first() && key < self.last(),
            Operator::Nbw => !(key >= self.first() && key <= self.last()),
            Operator::Nbwx => !(key > self.first() && key < self.last()),
            Operator::In => self.values.binary_search(key).is_ok(),
            Operator::Nin => self.values.binary_search(key).is_err(),
            Operator::TruncRight => key.starts_with(self.first()),
            Operator::TruncLeft => key.as_bytes().ends_with(self.first().as_bytes()),
            Operator::Range => key >= self.first() && key < self.last(),
            Operator::Any => true,
        }
    }

    /// Rewrites a right-truncation into the equivalent bounded `Range`.
    /// A query value made only of 0xFF bytes has no upper bound and stays as is.
    pub fn normalized(&self) -> IndexQuery {
        if self.op != Operator::TruncRight {
            return self.clone();
        }
        match successor(self.first()) {
            Some(upper) => IndexQuery::between(Operator::Range, self.first().clone(), upper),
            None => self.clone(),
        }
    }

    /// Smallest key that can match, or `None` when the scan has to start
    /// at the first leaf.
    pub(crate) fn lower_bound(&self) -> Option<&Value> {
        match self.op {
            Operator::Eq
            | Operator::Gt
            | Operator::Geq
            | Operator::Bw
            | Operator::Bwx
            | Operator::In
            | Operator::TruncRight
            | Operator::Range => self.values.first(),
            _ => None,
        }
    }

    /// True once `key` and every key after it in order can no longer match.
    pub(crate) fn past_end(&self, key: &Value) -> bool {
        match self.op {
            Operator::Eq | Operator::Leq | Operator::Bw | Operator::In => key > self.last(),
            Operator::Lt | Operator::Bwx | Operator::Range => key >= self.last(),
            Operator::TruncRight => {
                key.compare_prefix(self.first()) == Ordering::Greater
            }
            _ => false,
        }
    }
}

/// Smallest byte string greater than every string starting with `prefix`.
pub fn successor(prefix: &Value) -> Option<Value> {
    let mut data = prefix.as_bytes().to_vec();
    while let Some(&last) = data.last() {
        if last == 0xFF {
            data.pop();
        } else {
            let n = data.len();
            data[n - 1] = last + 1;
            return Some(Value::new(data));
        }
    }
    None
}
