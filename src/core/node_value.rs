//! Stored node layout and string-value extraction.
//!
//! Every node record starts with a signature byte: the node type in the top
//! three bits, `0x10` when a namespace block follows, and in the low two
//! bits the width of the name id (0, 1, 2 or 4 bytes). Then comes the node
//! id as a 16-bit unit count (bits) followed by its bytes.
//!
//! ```text
//! element    sig | children u32 | node id | attr count u16 | name id | [ns]
//! text/cdata sig | node id | content
//! comment    sig | node id | content
//! pi         sig | node id | target len u32 | target | data
//! attribute  sig | node id | name id | [ns] | value
//! ns block   ns id u16 | prefix len u16 | prefix
//! ```
//!
//! An element's children follow it in document order, attributes first,
//! so the subtree of an element is the run of records after it.

use crate::core::errors::*;
use crate::core::iterator::NodeIterator;
use crate::core::paged::{get_u16, get_u32, put_u16, put_u32};
use crate::core::record_store::RecordStore;

pub const LENGTH_SIGNATURE: usize = 1;
pub const LENGTH_NODE_ID_UNITS: usize = 2;
pub const LENGTH_CHILD_COUNT: usize = 4;
pub const LENGTH_ATTR_COUNT: usize = 2;
pub const LENGTH_NS_ID: usize = 2;
pub const LENGTH_PREFIX_LENGTH: usize = 2;
pub const LENGTH_TARGET_LENGTH: usize = 4;

pub const NAMESPACE_FLAG: u8 = 0x10;
pub const DIRTY_FLAG: u8 = 0x08;
const SIZE_TYPE_MASK: u8 = 0x03;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Text = 0,
    Element = 1,
    ProcessingInstruction = 2,
    Comment = 3,
    Attribute = 4,
    CData = 5,
}

impl NodeType {
    pub fn from_signature(signature: u8) -> Result<NodeType> {
        Ok(match signature >> 5 {
            0 => NodeType::Text,
            1 => NodeType::Element,
            2 => NodeType::ProcessingInstruction,
            3 => NodeType::Comment,
            4 => NodeType::Attribute,
            5 => NodeType::CData,
            other => {
                return Err(Error::DataCorruption {
                    details: format!("unknown node type {} in signature {:#04x}", other, signature),
                })
            }
        })
    }

    fn signature(self) -> u8 {
        (self as u8) << 5
    }
}

fn size_type(name_id: u32) -> u8 {
    if name_id == 0 {
        0
    } else if name_id <= u8::MAX as u32 {
        1
    } else if name_id <= u16::MAX as u32 {
        2
    } else {
        3
    }
}

fn size_type_len(size_type: u8) -> usize {
    match size_type & SIZE_TYPE_MASK {
        0 => 0,
        1 => 1,
        2 => 2,
        _ => 4,
    }
}

fn truncated(what: &str) -> Error {
    Error::DataCorruption {
        details: format!("stored node truncated in {}", what),
    }
}

// Encoding

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    let at = buf.len();
    buf.resize(at + 2, 0);
    put_u16(buf, at, v);
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let at = buf.len();
    buf.resize(at + 4, 0);
    put_u32(buf, at, v);
}

fn push_node_id(buf: &mut Vec<u8>, node_id: &[u8]) {
    push_u16(buf, (node_id.len() * 8) as u16);
    buf.extend_from_slice(node_id);
}

fn push_name_id(buf: &mut Vec<u8>, name_id: u32) {
    match size_type(name_id) {
        0 => {}
        1 => buf.push(name_id as u8),
        2 => push_u16(buf, name_id as u16),
        _ => push_u32(buf, name_id),
    }
}

fn push_namespace(buf: &mut Vec<u8>, ns_id: u16, prefix: &str) {
    push_u16(buf, ns_id);
    push_u16(buf, prefix.len() as u16);
    buf.extend_from_slice(prefix.as_bytes());
}

fn element_record(
    node_id: &[u8],
    children: u32,
    attributes: u16,
    name_id: u32,
    namespace: Option<(u16, &str)>,
) -> Vec<u8> {
    let mut sig = NodeType::Element.signature() | size_type(name_id);
    if namespace.is_some() {
        sig |= NAMESPACE_FLAG;
    }
    let mut buf = vec![sig];
    push_u32(&mut buf, children);
    push_node_id(&mut buf, node_id);
    push_u16(&mut buf, attributes);
    push_name_id(&mut buf, name_id);
    if let Some((ns_id, prefix)) = namespace {
        push_namespace(&mut buf, ns_id, prefix);
    }
    buf
}

/// Element with `children` child records, of which the first `attributes`
/// are attributes.
pub fn element(node_id: &[u8], children: u32, attributes: u16, name_id: u32) -> Vec<u8> {
    element_record(node_id, children, attributes, name_id, None)
}

pub fn element_ns(
    node_id: &[u8],
    children: u32,
    attributes: u16,
    name_id: u32,
    ns_id: u16,
    prefix: &str,
) -> Vec<u8> {
    element_record(node_id, children, attributes, name_id, Some((ns_id, prefix)))
}

fn character_record(node_type: NodeType, node_id: &[u8], content: &str) -> Vec<u8> {
    let mut buf = vec![node_type.signature()];
    push_node_id(&mut buf, node_id);
    buf.extend_from_slice(content.as_bytes());
    buf
}

pub fn text(node_id: &[u8], content: &str) -> Vec<u8> {
    character_record(NodeType::Text, node_id, content)
}

pub fn cdata(node_id: &[u8], content: &str) -> Vec<u8> {
    character_record(NodeType::CData, node_id, content)
}

pub fn comment(node_id: &[u8], content: &str) -> Vec<u8> {
    character_record(NodeType::Comment, node_id, content)
}

pub fn processing_instruction(node_id: &[u8], target: &str, data: &str) -> Vec<u8> {
    let mut buf = vec![NodeType::ProcessingInstruction.signature()];
    push_node_id(&mut buf, node_id);
    push_u32(&mut buf, target.len() as u32);
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(data.as_bytes());
    buf
}

pub fn attribute(node_id: &[u8], name_id: u32, value: &str) -> Vec<u8> {
    let mut buf = vec![NodeType::Attribute.signature() | size_type(name_id)];
    push_node_id(&mut buf, node_id);
    push_name_id(&mut buf, name_id);
    buf.extend_from_slice(value.as_bytes());
    buf
}

pub fn attribute_ns(node_id: &[u8], name_id: u32, ns_id: u16, prefix: &str, value: &str) -> Vec<u8> {
    let mut buf = vec![NodeType::Attribute.signature() | size_type(name_id) | NAMESPACE_FLAG];
    push_node_id(&mut buf, node_id);
    push_name_id(&mut buf, name_id);
    push_namespace(&mut buf, ns_id, prefix);
    buf.extend_from_slice(value.as_bytes());
    buf
}

// Decoding

/// Type of a stored node record.
pub fn node_type(data: &[u8]) -> Result<NodeType> {
    match data.first() {
        Some(sig) => NodeType::from_signature(*sig),
        None => Err(truncated("signature")),
    }
}

/// Offset just past the node id that starts at `offset`.
fn skip_node_id(data: &[u8], offset: usize) -> Result<usize> {
    if offset + LENGTH_NODE_ID_UNITS > data.len() {
        return Err(truncated("node id"));
    }
    let units = get_u16(data, offset) as usize;
    let end = offset + LENGTH_NODE_ID_UNITS + (units + 7) / 8;
    if end > data.len() {
        return Err(truncated("node id"));
    }
    Ok(end)
}

/// Node id bytes of a stored node.
pub fn node_id(data: &[u8]) -> Result<&[u8]> {
    let start = match node_type(data)? {
        NodeType::Element => LENGTH_SIGNATURE + LENGTH_CHILD_COUNT,
        _ => LENGTH_SIGNATURE,
    };
    let end = skip_node_id(data, start)?;
    Ok(&data[start + LENGTH_NODE_ID_UNITS..end])
}

/// Child and attribute counts of a stored element.
pub fn element_counts(data: &[u8]) -> Result<(u32, u16)> {
    if node_type(data)? != NodeType::Element {
        return Err(Error::DataCorruption {
            details: "record is not an element".to_string(),
        });
    }
    if data.len() < LENGTH_SIGNATURE + LENGTH_CHILD_COUNT {
        return Err(truncated("child count"));
    }
    let children = get_u32(data, LENGTH_SIGNATURE);
    let offset = skip_node_id(data, LENGTH_SIGNATURE + LENGTH_CHILD_COUNT)?;
    if offset + LENGTH_ATTR_COUNT > data.len() {
        return Err(truncated("attribute count"));
    }
    Ok((children, get_u16(data, offset)))
}

fn attribute_value(data: &[u8]) -> Result<&[u8]> {
    let sig = data[0];
    let mut offset = skip_node_id(data, LENGTH_SIGNATURE)?;
    offset += size_type_len(sig);
    if sig & NAMESPACE_FLAG != 0 {
        offset += LENGTH_NS_ID;
        if offset + LENGTH_PREFIX_LENGTH > data.len() {
            return Err(truncated("attribute prefix"));
        }
        let prefix_len = get_u16(data, offset) as usize;
        offset += LENGTH_PREFIX_LENGTH + prefix_len;
    }
    data.get(offset..).ok_or_else(|| truncated("attribute value"))
}

fn pi_data(data: &[u8]) -> Result<&[u8]> {
    let offset = skip_node_id(data, LENGTH_SIGNATURE)?;
    if offset + LENGTH_TARGET_LENGTH > data.len() {
        return Err(truncated("pi target"));
    }
    let target_len = get_u32(data, offset) as usize;
    data.get(offset + LENGTH_TARGET_LENGTH + target_len..)
        .ok_or_else(|| truncated("pi data"))
}

fn character_content(data: &[u8]) -> Result<&[u8]> {
    let offset = skip_node_id(data, LENGTH_SIGNATURE)?;
    Ok(&data[offset..])
}

// String value

/// String value of the node at `pointer` and its descendants, read straight
/// from the stored records. With `add_whitespace`, a space follows each child
/// of an element that has more than one non-attribute child.
///
/// Returns `None` when no record lives at `pointer`.
pub fn get_node_value(
    store: &RecordStore,
    pointer: u64,
    add_whitespace: bool,
) -> Result<Option<String>> {
    let mut it = NodeIterator::new(store, pointer)?;
    if it.current_page().is_none() {
        return Ok(None);
    }
    let mut out = Vec::new();
    collect_value(&mut it, &mut out, true, add_whitespace)?;
    Ok(Some(String::from_utf8_lossy(&out).into_owned()))
}

fn collect_value(
    it: &mut NodeIterator<'_>,
    out: &mut Vec<u8>,
    is_top: bool,
    add_whitespace: bool,
) -> Result<()> {
    let value = match it.next() {
        Some(value) => value?,
        None => {
            return Err(Error::DataCorruption {
                details: "document ended inside an element".to_string(),
            })
        }
    };
    let data = value.as_bytes();
    match node_type(data)? {
        NodeType::Element => {
            let (children, attributes) = element_counts(data)?;
            let extra_space = add_whitespace && children as i64 - attributes as i64 > 1;
            for _ in 0..children {
                collect_value(it, out, false, add_whitespace)?;
                if extra_space {
                    out.push(b' ');
                }
            }
        }
        NodeType::Text | NodeType::CData => out.extend_from_slice(character_content(data)?),
        NodeType::ProcessingInstruction => out.extend_from_slice(pi_data(data)?),
        NodeType::Attribute if is_top => out.extend_from_slice(attribute_value(data)?),
        NodeType::Comment if is_top => out.extend_from_slice(character_content(data)?),
        NodeType::Attribute | NodeType::Comment => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures() {
        assert_eq!(text(&[1], "x")[0], 0x00);
        assert_eq!(element(&[1], 0, 0, 0)[0], 0x20);
        assert_eq!(element(&[1], 0, 0, 7)[0], 0x21);
        assert_eq!(element(&[1], 0, 0, 300)[0], 0x22);
        assert_eq!(element_ns(&[1], 0, 0, 70_000, 3, "x")[0], 0x33);
        assert_eq!(attribute(&[1], 2, "v")[0], 0x81);
        assert_eq!(node_type(&cdata(&[1], "c")).unwrap(), NodeType::CData);
        assert!(node_type(&[0xE0]).is_err());
        assert!(node_type(&[]).is_err());
    }

    #[test]
    fn test_decode_fields() {
        let id = [0x12, 0x34];
        let el = element_ns(&id, 5, 2, 9, 1, "xs");
        assert_eq!(node_id(&el).unwrap(), &id);
        assert_eq!(element_counts(&el).unwrap(), (5, 2));

        let attr = attribute_ns(&id, 400, 1, "xs", "value");
        assert_eq!(attribute_value(&attr).unwrap(), b"value");

        let pi = processing_instruction(&id, "target", "data here");
        assert_eq!(pi_data(&pi).unwrap(), b"data here");
        assert_eq!(character_content(&comment(&id, "note")).unwrap(), b"note");

        assert!(element_counts(&text(&id, "t")).is_err());
        assert!(node_id(&[0x00, 0x00, 0x40]).is_err());
    }
}
