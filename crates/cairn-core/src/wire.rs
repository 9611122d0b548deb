//! Wire-format helpers: encoding, validated decoding, and constructors for
//! the generated messages.
//!
//! prost merges a oneof last-wins, so a `SubDirEntry` carrying both `hash`
//! and `inline` would decode without complaint. Decoding therefore scans the
//! raw tags first and rejects anything but exactly one content tag.

use std::collections::HashSet;

use prost::Message;

use crate::error::{CairnError, CairnResult};
use crate::proto::sub_dir_entry::Content;
use crate::proto::{DirEntry, FileEntry, Snapshot, SubDirEntry};

/// Deepest chain of inline directories the builder will produce.
///
/// Each inline level costs two message levels, and prost refuses to decode
/// past 100 nested messages.
pub const MAX_INLINE_DEPTH: u32 = 32;

const WIRE_VARINT: u64 = 0;
const WIRE_FIXED64: u64 = 1;
const WIRE_LEN: u64 = 2;
const WIRE_FIXED32: u64 = 5;

impl SubDirEntry {
    /// A subdirectory stored standalone and referenced by its content id.
    pub fn hashed(name: impl Into<String>, hash: impl Into<String>) -> Self {
        SubDirEntry {
            name: name.into(),
            content: Some(Content::Hash(hash.into())),
        }
    }

    /// A subdirectory embedded in its parent.
    pub fn inlined(name: impl Into<String>, entry: DirEntry) -> Self {
        SubDirEntry {
            name: name.into(),
            content: Some(Content::Inline(Box::new(entry))),
        }
    }

    /// The content choice, or `CorruptEntry` if neither branch is set.
    pub fn content(&self) -> CairnResult<&Content> {
        self.content.as_ref().ok_or_else(|| {
            CairnError::corrupt(format!("sub dir '{}' has neither hash nor inline", self.name))
        })
    }
}

impl DirEntry {
    /// An empty directory (no children, size 0).
    pub fn empty() -> Self {
        DirEntry::default()
    }

    /// Sort children by name so that equal trees encode to equal bytes.
    pub fn sort_children(&mut self) {
        self.sub_dir.sort_by(|a, b| a.name.cmp(&b.name));
        self.file.sort_by(|a, b| a.name.cmp(&b.name));
    }

    pub fn find_file(&self, name: &str) -> Option<&FileEntry> {
        self.file.iter().find(|f| f.name == name)
    }

    pub fn find_sub_dir(&self, name: &str) -> Option<&SubDirEntry> {
        self.sub_dir.iter().find(|d| d.name == name)
    }

    /// Number of directly nested inline levels below this entry.
    pub fn inline_depth(&self) -> u32 {
        self.sub_dir
            .iter()
            .filter_map(|d| match &d.content {
                Some(Content::Inline(child)) => Some(1 + child.inline_depth()),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }
}

pub fn encode_dir_entry(entry: &DirEntry) -> Vec<u8> {
    entry.encode_to_vec()
}

pub fn encode_snapshot(snapshot: &Snapshot) -> Vec<u8> {
    snapshot.encode_to_vec()
}

/// Decode a DirEntry, rejecting malformed oneofs and structural violations.
pub fn decode_dir_entry(bytes: &[u8]) -> CairnResult<DirEntry> {
    scan_dir_entry(bytes, 0)?;
    let entry = DirEntry::decode(bytes)
        .map_err(|e| CairnError::corrupt(format!("decoding dir entry: {e}")))?;
    validate_dir_entry(&entry)?;
    Ok(entry)
}

pub fn decode_snapshot(bytes: &[u8]) -> CairnResult<Snapshot> {
    let snapshot = Snapshot::decode(bytes)
        .map_err(|e| CairnError::corrupt(format!("decoding snapshot: {e}")))?;
    if snapshot.root_hash.is_empty() {
        return Err(CairnError::corrupt("snapshot without root hash"));
    }
    if snapshot.finished < snapshot.started {
        return Err(CairnError::corrupt(format!(
            "snapshot finished ({}) before it started ({})",
            snapshot.finished, snapshot.started
        )));
    }
    Ok(snapshot)
}

/// Check the invariants a decoded DirEntry must hold.
///
/// Inline children are checked recursively. A hash-referenced child's size is
/// only known once it is resolved, so for directories with such children the
/// aggregate size is checked as a lower bound here; the tree walker checks
/// the exact sum once those children are resolved.
pub fn validate_dir_entry(entry: &DirEntry) -> CairnResult<()> {
    let mut names = HashSet::with_capacity(entry.sub_dir.len() + entry.file.len());
    let mut known: u64 = 0;
    let mut exact = true;

    for file in &entry.file {
        validate_name(&file.name)?;
        if !names.insert(file.name.as_str()) {
            return Err(CairnError::corrupt(format!("duplicate entry name '{}'", file.name)));
        }
        known = known
            .checked_add(file.size)
            .ok_or_else(|| CairnError::corrupt("directory size overflows u64"))?;
    }

    for sub in &entry.sub_dir {
        validate_name(&sub.name)?;
        if !names.insert(sub.name.as_str()) {
            return Err(CairnError::corrupt(format!("duplicate entry name '{}'", sub.name)));
        }
        match sub.content()? {
            Content::Inline(child) => {
                validate_dir_entry(child)?;
                known = known
                    .checked_add(child.size)
                    .ok_or_else(|| CairnError::corrupt("directory size overflows u64"))?;
            }
            Content::Hash(hash) => {
                if hash.is_empty() {
                    return Err(CairnError::corrupt(format!(
                        "sub dir '{}' has an empty hash",
                        sub.name
                    )));
                }
                exact = false;
            }
        }
    }

    let consistent = if exact {
        entry.size == known
    } else {
        entry.size >= known
    };
    if !consistent {
        return Err(CairnError::corrupt(format!(
            "directory size {} does not match its contents ({known})",
            entry.size
        )));
    }
    Ok(())
}

/// Entry names are single path components.
pub fn validate_name(name: &str) -> CairnResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(CairnError::corrupt(format!("invalid entry name {name:?}")));
    }
    Ok(())
}

fn scan_dir_entry(mut buf: &[u8], depth: u32) -> CairnResult<()> {
    if depth > MAX_INLINE_DEPTH * 2 {
        return Err(CairnError::corrupt("inline directories nested too deeply"));
    }
    while !buf.is_empty() {
        let (field, wire_type) = read_key(&mut buf)?;
        if field == 1 && wire_type == WIRE_LEN {
            let body = read_len_delimited(&mut buf)?;
            scan_sub_dir(body, depth)?;
        } else {
            skip_field(wire_type, &mut buf)?;
        }
    }
    Ok(())
}

fn scan_sub_dir(mut buf: &[u8], depth: u32) -> CairnResult<()> {
    let mut content_tags = 0u32;
    while !buf.is_empty() {
        let (field, wire_type) = read_key(&mut buf)?;
        match (field, wire_type) {
            (2, WIRE_LEN) => {
                read_len_delimited(&mut buf)?;
                content_tags += 1;
            }
            (3, WIRE_LEN) => {
                let body = read_len_delimited(&mut buf)?;
                content_tags += 1;
                scan_dir_entry(body, depth + 1)?;
            }
            _ => skip_field(wire_type, &mut buf)?,
        }
    }
    match content_tags {
        1 => Ok(()),
        0 => Err(CairnError::corrupt("sub dir entry has neither hash nor inline")),
        n => Err(CairnError::corrupt(format!(
            "sub dir entry has {n} content fields, expected exactly one"
        ))),
    }
}

fn read_varint(buf: &mut &[u8]) -> CairnResult<u64> {
    prost::encoding::decode_varint(buf)
        .map_err(|e| CairnError::corrupt(format!("malformed varint: {e}")))
}

fn read_key(buf: &mut &[u8]) -> CairnResult<(u64, u64)> {
    let key = read_varint(buf)?;
    Ok((key >> 3, key & 0x7))
}

fn read_len_delimited<'a>(buf: &mut &'a [u8]) -> CairnResult<&'a [u8]> {
    let len = read_varint(buf)?;
    let len = usize::try_from(len).map_err(|_| CairnError::corrupt("length overflows usize"))?;
    take(buf, len)
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> CairnResult<&'a [u8]> {
    if len > buf.len() {
        return Err(CairnError::corrupt("truncated field"));
    }
    let (head, rest) = buf.split_at(len);
    *buf = rest;
    Ok(head)
}

fn skip_field(wire_type: u64, buf: &mut &[u8]) -> CairnResult<()> {
    match wire_type {
        WIRE_VARINT => read_varint(buf).map(|_| ()),
        WIRE_FIXED64 => take(buf, 8).map(|_| ()),
        WIRE_LEN => read_len_delimited(buf).map(|_| ()),
        WIRE_FIXED32 => take(buf, 4).map(|_| ()),
        other => Err(CairnError::corrupt(format!("unsupported wire type {other}"))),
    }
}
