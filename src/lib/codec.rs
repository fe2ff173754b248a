//! Byte layouts for stored rows and transferred payloads.
//!
//! A row key is `depth:u32 | parent:u64 | flag:u8 | discriminator:u64`, all
//! big endian. Rows that share a depth and parent therefore share a 12 byte
//! stem and sit next to each other in the column family. The discriminator is
//! a hash of the full key for grouped rows and the unique id for ungrouped
//! rows.

use std::{
    fmt,
    io::{self, Read, Write},
};

use xxhash_rust::xxh3::xxh3_64;

use crate::{
    error::{Result, StoreError},
    expression::Generator,
    key::Key,
};

pub const STEM_LEN: usize = 12;
pub const ROW_KEY_LEN: usize = STEM_LEN + 1 + 8;

const GROUP_FLAG: u8 = 1;
const UNGROUPED_FLAG: u8 = 0;

/// Prefix shared by every row stored at `depth` beneath the key serialised
/// as `parent_key_bytes`.
pub fn key_stem(depth: usize, parent_key_bytes: &[u8]) -> [u8; STEM_LEN] {
    let mut stem = [0u8; STEM_LEN];
    stem[..4].copy_from_slice(&(depth as u32).to_be_bytes());
    stem[4..].copy_from_slice(&xxh3_64(parent_key_bytes).to_be_bytes());
    stem
}

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    bytes: [u8; ROW_KEY_LEN],
}

impl RowKey {
    pub fn grouped(depth: usize, parent_key_bytes: &[u8], key_bytes: &[u8]) -> Self {
        Self::build(depth, parent_key_bytes, GROUP_FLAG, xxh3_64(key_bytes))
    }

    pub fn ungrouped(depth: usize, parent_key_bytes: &[u8], unique_id: u64) -> Self {
        Self::build(depth, parent_key_bytes, UNGROUPED_FLAG, unique_id)
    }

    fn build(depth: usize, parent_key_bytes: &[u8], flag: u8, discriminator: u64) -> Self {
        let mut bytes = [0u8; ROW_KEY_LEN];
        bytes[..STEM_LEN].copy_from_slice(&key_stem(depth, parent_key_bytes));
        bytes[STEM_LEN] = flag;
        bytes[STEM_LEN + 1..].copy_from_slice(&discriminator.to_be_bytes());
        Self { bytes }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; ROW_KEY_LEN] = bytes.try_into().map_err(|_| {
            StoreError::Serialization(format!(
                "row key must be {ROW_KEY_LEN} bytes, found {}",
                bytes.len()
            ))
        })?;
        match bytes[STEM_LEN] {
            GROUP_FLAG | UNGROUPED_FLAG => Ok(Self { bytes }),
            other => Err(StoreError::Serialization(format!(
                "invalid row key group flag {other}"
            ))),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn stem(&self) -> &[u8] {
        &self.bytes[..STEM_LEN]
    }

    pub fn depth(&self) -> usize {
        let mut depth = [0u8; 4];
        depth.copy_from_slice(&self.bytes[..4]);
        u32::from_be_bytes(depth) as usize
    }

    pub fn is_group(&self) -> bool {
        self.bytes[STEM_LEN] == GROUP_FLAG
    }

    fn discriminator(&self) -> u64 {
        let mut value = [0u8; 8];
        value.copy_from_slice(&self.bytes[STEM_LEN + 1..]);
        u64::from_be_bytes(value)
    }

    pub fn unique_id(&self) -> Option<u64> {
        (!self.is_group()).then(|| self.discriminator())
    }

    /// Copy of an ungrouped key carrying a new unique id. Grouped keys are
    /// returned unchanged.
    pub fn make_unique(&self, unique_id: u64) -> Self {
        if self.is_group() {
            return self.clone();
        }
        let mut bytes = self.bytes;
        bytes[STEM_LEN + 1..].copy_from_slice(&unique_id.to_be_bytes());
        Self { bytes }
    }
}

impl fmt::Debug for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowKey({self})")
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_group() { "group" } else { "row" };
        write!(
            f,
            "{}:{:016x}:{kind}:{:016x}",
            self.depth(),
            u64::from_be_bytes(self.bytes[4..STEM_LEN].try_into().unwrap_or_default()),
            self.discriminator()
        )
    }
}

/// One logical entry inside a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub full_key: &'a [u8],
    pub generators: &'a [u8],
}

/// Iterates the `{len, key, len, generators}` entries of a stored value.
pub struct ValueEntries<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ValueEntries<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read_section(&mut self) -> Result<&'a [u8]> {
        let header = self
            .bytes
            .get(self.offset..self.offset + 4)
            .ok_or_else(|| truncated(self.offset))?;
        let mut len = [0u8; 4];
        len.copy_from_slice(header);
        let len = u32::from_be_bytes(len) as usize;
        let start = self.offset + 4;
        let section = self
            .bytes
            .get(start..start + len)
            .ok_or_else(|| truncated(start))?;
        self.offset = start + len;
        Ok(section)
    }
}

impl<'a> Iterator for ValueEntries<'a> {
    type Item = Result<EntryRef<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let entry = self.read_section().and_then(|full_key| {
            let generators = self.read_section()?;
            Ok(EntryRef {
                full_key,
                generators,
            })
        });
        if entry.is_err() {
            self.offset = self.bytes.len();
        }
        Some(entry)
    }
}

fn truncated(offset: usize) -> StoreError {
    StoreError::Serialization(format!("stored value truncated at byte {offset}"))
}

/// Appends one entry in the stored value layout.
pub fn write_entry(buffer: &mut Vec<u8>, full_key: &[u8], generators: &[u8]) {
    buffer.reserve(8 + full_key.len() + generators.len());
    buffer.extend_from_slice(&(full_key.len() as u32).to_be_bytes());
    buffer.extend_from_slice(full_key);
    buffer.extend_from_slice(&(generators.len() as u32).to_be_bytes());
    buffer.extend_from_slice(generators);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowValue {
    bytes: Vec<u8>,
}

impl RowValue {
    pub fn new(full_key: &[u8], generators: &[u8]) -> Self {
        let mut bytes = Vec::new();
        write_entry(&mut bytes, full_key, generators);
        Self { bytes }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn entries(&self) -> ValueEntries<'_> {
        ValueEntries::new(&self.bytes)
    }
}

/// Converts keys and generator arrays to and from their stored bytes.
#[derive(Debug, Clone, Copy)]
pub struct ItemSerialiser {
    field_count: usize,
}

impl ItemSerialiser {
    pub fn new(field_count: usize) -> Self {
        Self { field_count }
    }

    pub fn key_bytes(&self, key: &Key) -> Result<Vec<u8>> {
        Ok(bincode::serialize(key)?)
    }

    pub fn to_key(&self, bytes: &[u8]) -> Result<Key> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn generator_bytes(&self, generators: &[Option<Generator>]) -> Result<Vec<u8>> {
        Ok(bincode::serialize(generators)?)
    }

    pub fn read_generators(&self, bytes: &[u8]) -> Result<Vec<Option<Generator>>> {
        let generators: Vec<Option<Generator>> = bincode::deserialize(bytes)?;
        if generators.len() != self.field_count {
            return Err(StoreError::Serialization(format!(
                "expected {} generators, found {}",
                self.field_count,
                generators.len()
            )));
        }
        Ok(generators)
    }
}

/// Writes a big endian `i32` length followed by the bytes.
pub fn write_block<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    let len = i32::try_from(bytes.len()).map_err(|_| {
        StoreError::Serialization(format!("block of {} bytes is too large", bytes.len()))
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(bytes)?;
    Ok(())
}

pub fn read_i32<R: Read + ?Sized>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn read_block<R: Read + ?Sized>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_i32(reader)?;
    let len = usize::try_from(len)
        .map_err(|_| StoreError::Serialization(format!("negative block length {len}")))?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// Appends one `{keyLen, key, valLen, val}` record to a payload blob.
pub fn write_record(blob: &mut Vec<u8>, key: &[u8], value: &[u8]) -> Result<()> {
    write_block(blob, key)?;
    write_block(blob, value)
}

/// Reads the next record from a payload blob, `None` once it is exhausted.
pub fn read_record(cursor: &mut io::Cursor<&[u8]>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    if cursor.position() as usize >= cursor.get_ref().len() {
        return Ok(None);
    }
    let key = read_block(cursor)?;
    let value = read_block(cursor)?;
    Ok(Some((key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{key::KeyPart, val::Val};

    fn serialiser() -> ItemSerialiser {
        ItemSerialiser::new(2)
    }

    #[test]
    fn children_share_the_parent_stem() {
        let ser = serialiser();
        let parent = Key::root().resolve(KeyPart::Group(vec![Val::from("A")]));
        let parent_bytes = ser.key_bytes(&parent).expect("serialise parent");
        let child = parent.resolve(KeyPart::Group(vec![Val::from("x")]));
        let child_bytes = ser.key_bytes(&child).expect("serialise child");

        let grouped = RowKey::grouped(1, &parent_bytes, &child_bytes);
        let ungrouped = RowKey::ungrouped(1, &parent_bytes, 42);
        let stem = key_stem(1, &parent_bytes);

        assert!(grouped.as_bytes().starts_with(&stem));
        assert!(ungrouped.as_bytes().starts_with(&stem));
        assert!(grouped.is_group());
        assert_eq!(ungrouped.unique_id(), Some(42));
        assert_eq!(grouped.unique_id(), None);
        assert_eq!(grouped.depth(), 1);
        assert!(!RowKey::grouped(2, &parent_bytes, &child_bytes)
            .as_bytes()
            .starts_with(&stem));
    }

    #[test]
    fn make_unique_only_touches_ungrouped_keys() {
        let row = RowKey::ungrouped(0, &[], 1);
        let fresh = row.make_unique(7);
        assert_eq!(fresh.unique_id(), Some(7));
        assert_eq!(fresh.stem(), row.stem());

        let group = RowKey::grouped(0, &[], b"k");
        assert_eq!(group.make_unique(7), group);
    }

    #[test]
    fn row_key_rejects_bad_lengths_and_flags() {
        assert!(RowKey::from_bytes(&[0u8; 5]).is_err());
        let mut bytes = RowKey::grouped(0, &[], b"k").as_bytes().to_vec();
        assert!(RowKey::from_bytes(&bytes).is_ok());
        bytes[STEM_LEN] = 9;
        assert!(RowKey::from_bytes(&bytes).is_err());
    }

    #[test]
    fn value_entries_walk_every_entry() {
        let mut bytes = RowValue::new(b"key-one", b"gen-one").as_bytes().to_vec();
        write_entry(&mut bytes, b"key-two", b"");
        let value = RowValue::from_bytes(bytes);

        let entries: Vec<_> = value
            .entries()
            .collect::<Result<Vec<_>>>()
            .expect("entries decode");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].full_key, b"key-one");
        assert_eq!(entries[0].generators, b"gen-one");
        assert_eq!(entries[1].full_key, b"key-two");
        assert!(entries[1].generators.is_empty());
    }

    #[test]
    fn truncated_values_report_an_error() {
        let bytes = RowValue::new(b"key", b"generators").as_bytes().to_vec();
        let truncated = &bytes[..bytes.len() - 3];
        let mut entries = ValueEntries::new(truncated);
        assert!(entries.next().expect("one result").is_err());
        assert!(entries.next().is_none());
    }

    #[test]
    fn generator_arrays_are_length_checked() {
        let ser = serialiser();
        let bytes = ser
            .generator_bytes(&[Some(Generator::Count(2)), None])
            .expect("serialise generators");
        let decoded = ser.read_generators(&bytes).expect("decode generators");
        assert_eq!(decoded, vec![Some(Generator::Count(2)), None]);

        let wrong = ItemSerialiser::new(3);
        assert!(wrong.read_generators(&bytes).is_err());
    }

    #[test]
    fn payload_records_use_i32_lengths() {
        let mut blob = Vec::new();
        write_record(&mut blob, b"ab", b"xyz").expect("write record");
        assert_eq!(&blob[..4], &2i32.to_be_bytes());
        assert_eq!(&blob[6..10], &3i32.to_be_bytes());

        let mut cursor = io::Cursor::new(blob.as_slice());
        let (key, value) = read_record(&mut cursor)
            .expect("read record")
            .expect("record present");
        assert_eq!(key, b"ab");
        assert_eq!(value, b"xyz");
        assert!(read_record(&mut cursor).expect("read end").is_none());
    }
}
