//! Decoding of the records stored in the dump streams.
//!
//! Every record kind implements [`Record`] and reads its fields one by one
//! with a [`FieldReader`]; nothing gets reinterpreted from raw memory. A stream
//! with the wrong shape decodes to an empty value rather than an error: dump
//! producers routinely omit or truncate optional streams.
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::map::ByteSource;
use crate::structs::{CountHeader, LocationDescriptor32};

/// Size of the length prefix of a string.
const STRING_LENGTH_PREFIX: usize = 4;

/// A bounds-checked little-endian reader over a byte slice. Every accessor
/// returns `None` instead of reading past the end.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// How many bytes have been consumed.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// How many bytes are left.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Read the next `len` bytes.
    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;

        Some(slice)
    }

    /// Skip over padding / fields nobody cares about.
    pub fn skip(&mut self, len: usize) -> Option<()> {
        self.bytes(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.bytes(N)?.try_into().ok()
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.array().map(u8::from_le_bytes)
    }

    pub fn u16(&mut self) -> Option<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Option<u64> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_le_bytes)
    }
}

/// A fixed-size record of the dump format.
pub trait Record: Sized {
    /// Size of the record on disk.
    const SIZE: usize;

    /// Read the fields of the record. The reader is positioned at its first
    /// byte and has at least [`Record::SIZE`] bytes.
    fn read(reader: &mut FieldReader) -> Option<Self>;

    /// Decode a record off the start of `bytes`, returning it with the amount
    /// of bytes it spans.
    fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let mut reader = FieldReader::new(bytes.get(..Self::SIZE)?);
        let record = Self::read(&mut reader)?;

        Some((record, Self::SIZE))
    }
}

/// The header of a homogeneous list of records; it knows how many elements
/// follow.
pub trait ListHeader: Record {
    fn count(&self) -> u64;
}

/// Decode a single record stored at `location`. A missing stream, or one whose
/// size isn't exactly the record's, decodes to the default value.
pub fn decode_struct<T, S>(source: &mut S, location: Option<LocationDescriptor32>) -> Result<T>
where
    T: Record + Default,
    S: ByteSource,
{
    let Some(location) = location else {
        return Ok(T::default());
    };

    if location.data_size as usize != T::SIZE {
        warn!(
            size = location.data_size,
            expected = T::SIZE,
            "record has an unexpected size, ignoring it"
        );
        return Ok(T::default());
    }

    let bytes = source.get(location.rva.into(), T::SIZE)?;

    Ok(T::decode(bytes).map(|(record, _)| record).unwrap_or_default())
}

/// Decode a list of `T` prefixed by a `H` header that carries the count. The
/// stream must be exactly `H::SIZE + count * T::SIZE` bytes long, otherwise the
/// list is empty. Nothing past the declared size is ever read.
pub fn decode_list<H, T, S>(source: &mut S, location: Option<LocationDescriptor32>) -> Result<Vec<T>>
where
    H: ListHeader,
    T: Record,
    S: ByteSource,
{
    let Some(location) = location else {
        return Ok(Vec::new());
    };

    let data_size = location.data_size as usize;
    if data_size < H::SIZE {
        warn!(size = data_size, "list is too small for its header, ignoring it");
        return Ok(Vec::new());
    }

    // Nothing past the header is read until its count agrees with the size.
    let rva = u64::from(location.rva);
    let Some((header, header_size)) = H::decode(source.get(rva, H::SIZE)?) else {
        return Ok(Vec::new());
    };

    let count = header.count();
    let expected = count
        .checked_mul(T::SIZE as u64)
        .and_then(|size| size.checked_add(H::SIZE as u64));
    if expected != Some(data_size as u64) {
        warn!(
            count,
            size = data_size,
            element_size = T::SIZE,
            "list size doesn't match its count, ignoring it"
        );
        return Ok(Vec::new());
    }

    let bytes = source.get(rva, data_size)?;
    let records = bytes[header_size..]
        .chunks_exact(T::SIZE)
        .map(|chunk| T::decode(chunk).map(|(record, _)| record))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();

    debug!(count, "decoded list");

    Ok(records)
}

/// Decode a list of `T` prefixed by a 32-bit count.
pub fn decode_counted_list<T, S>(
    source: &mut S,
    location: Option<LocationDescriptor32>,
) -> Result<Vec<T>>
where
    T: Record,
    S: ByteSource,
{
    decode_list::<CountHeader, T, S>(source, location)
}

/// Read a string made of a 32-bit byte length followed by UTF-16 code units.
///
/// `probe` bytes are read first; if the length says the string is longer, it is
/// read again with the exact size.
pub fn read_string<S: ByteSource>(source: &mut S, rva: u64, probe: usize) -> Result<String> {
    let probe = probe.max(STRING_LENGTH_PREFIX);
    let bytes = source.get_clamped(rva, probe)?;
    let Some(length) = FieldReader::new(bytes).u32() else {
        return Err(Error::OutOfRange {
            offset: rva,
            len: STRING_LENGTH_PREFIX as u64,
            file_size: source.file_size(),
        });
    };

    // This doesn't remap when the probe already covered the whole string.
    let total = STRING_LENGTH_PREFIX.saturating_add(length as usize);
    let bytes = source.get(rva, total)?;

    Ok(utf16_string_from_slice(&bytes[STRING_LENGTH_PREFIX..]))
}

/// Copy the blob a location descriptor points to. An empty location gives an
/// empty blob, whatever its rva.
pub fn read_blob<S: ByteSource>(source: &mut S, location: LocationDescriptor32) -> Result<Vec<u8>> {
    if location.data_size == 0 {
        return Ok(Vec::new());
    }

    let bytes = source.get(location.rva.into(), location.data_size as usize)?;

    Ok(bytes.to_vec())
}

/// Convert a slice of bytes into a Rust string. Code units that can't be
/// decoded become U+FFFD and a trailing odd byte is ignored.
fn utf16_string_from_slice(slice: &[u8]) -> String {
    // Iterate over chunks of 2 bytes to yield u16's.
    let iter = slice
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]));

    char::decode_utf16(iter)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Pair {
        a: u32,
        b: u16,
    }

    impl Record for Pair {
        const SIZE: usize = 8;

        fn read(reader: &mut FieldReader) -> Option<Self> {
            let a = reader.u32()?;
            let b = reader.u16()?;
            reader.skip(2)?;

            Some(Self { a, b })
        }
    }

    fn location(rva: u32, data_size: u32) -> Option<LocationDescriptor32> {
        Some(LocationDescriptor32 { data_size, rva })
    }

    fn pairs(count: u32) -> Vec<u8> {
        let mut bytes = count.to_le_bytes().to_vec();
        for i in 0..count {
            bytes.extend_from_slice(&(0x100 + i).to_le_bytes());
            bytes.extend_from_slice(&(i as u16).to_le_bytes());
            bytes.extend_from_slice(&[0xcc, 0xcc]);
        }

        bytes
    }

    #[test]
    fn field_reader() {
        let bytes = [1, 0, 2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0, 4];
        let mut reader = FieldReader::new(&bytes);

        assert_eq!(reader.u16(), Some(1));
        assert_eq!(reader.u32(), Some(2));
        assert_eq!(reader.u64(), Some(3));
        assert_eq!(reader.position(), 14);
        assert_eq!(reader.u16(), None);
        assert_eq!(reader.remaining(), 1);
        assert_eq!(reader.u8(), Some(4));
        assert_eq!(reader.u8(), None);
    }

    #[test]
    fn single_record() {
        let bytes = pairs(1);
        let mut source = bytes.as_slice();

        let pair = decode_struct::<Pair, _>(&mut source, location(4, 8)).unwrap();
        assert_eq!(pair, Pair { a: 0x100, b: 0 });

        // Wrong size or no stream: default value.
        let pair = decode_struct::<Pair, _>(&mut source, location(4, 7)).unwrap();
        assert_eq!(pair, Pair::default());
        let pair = decode_struct::<Pair, _>(&mut source, None).unwrap();
        assert_eq!(pair, Pair::default());
    }

    #[test]
    fn counted_list() {
        let bytes = pairs(3);
        let mut source = bytes.as_slice();

        let list = decode_counted_list::<Pair, _>(&mut source, location(0, 4 + 3 * 8)).unwrap();
        assert_eq!(
            list,
            [
                Pair { a: 0x100, b: 0 },
                Pair { a: 0x101, b: 1 },
                Pair { a: 0x102, b: 2 }
            ]
        );
    }

    #[test]
    fn list_size_mismatch_is_empty() {
        let bytes = pairs(3);
        let mut source = bytes.as_slice();

        // One byte short, one byte too many.
        for size in [4 + 3 * 8 - 1, 4 + 2 * 8] {
            let list = decode_counted_list::<Pair, _>(&mut source, location(0, size)).unwrap();
            assert!(list.is_empty());
        }

        let mut bytes = pairs(3);
        bytes.push(0);
        let mut source = bytes.as_slice();
        let list = decode_counted_list::<Pair, _>(&mut source, location(0, 4 + 3 * 8 + 1)).unwrap();
        assert!(list.is_empty());

        // Too small for the header.
        let list = decode_counted_list::<Pair, _>(&mut source, location(0, 3)).unwrap();
        assert!(list.is_empty());
        let list = decode_counted_list::<Pair, _>(&mut source, None).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn huge_counts_are_empty() {
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let mut source = bytes.as_slice();

        let list = decode_counted_list::<Pair, _>(&mut source, location(0, 12)).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn list_out_of_file_is_an_error() {
        // The size matches the count, but the records aren't all there.
        let bytes = pairs(3);
        let mut source = &bytes[..20];

        assert!(matches!(
            decode_counted_list::<Pair, _>(&mut source, location(0, 4 + 3 * 8)),
            Err(Error::OutOfRange { .. })
        ));

        // The header itself is past the end.
        let mut source = bytes.as_slice();
        assert!(matches!(
            decode_counted_list::<Pair, _>(&mut source, location(0x100, 12)),
            Err(Error::OutOfRange { .. })
        ));
    }

    #[test]
    fn mismatched_list_past_the_end_is_empty() {
        let bytes = pairs(1);
        let mut source = bytes.as_slice();

        let list = decode_counted_list::<Pair, _>(&mut source, location(0, 0x10_0000)).unwrap();
        assert!(list.is_empty());
    }

    fn string_at(padding: usize, s: &str) -> Vec<u8> {
        let units = s.encode_utf16().collect::<Vec<_>>();
        let mut bytes = vec![0xaa; padding];
        bytes.extend_from_slice(&((units.len() * 2) as u32).to_le_bytes());
        for unit in units {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }

        bytes
    }

    #[test]
    fn strings() {
        let bytes = string_at(3, "ntdll.dll");
        let mut source = bytes.as_slice();

        assert_eq!(read_string(&mut source, 3, 4096).unwrap(), "ntdll.dll");
    }

    #[test]
    fn strings_longer_than_the_probe() {
        let name = "a".repeat(5000);
        let bytes = string_at(0, &name);
        let mut source = bytes.as_slice();

        assert_eq!(read_string(&mut source, 0, 4096).unwrap(), name);
        assert_eq!(read_string(&mut source, 0, 0).unwrap(), name);
    }

    #[test]
    fn truncated_strings() {
        let mut bytes = string_at(0, "abc");
        bytes.pop();
        let mut source = bytes.as_slice();
        assert!(read_string(&mut source, 0, 4096).is_err());

        let bytes = [2, 0];
        let mut source = bytes.as_slice();
        assert!(read_string(&mut source, 0, 4096).is_err());
    }

    #[test]
    fn invalid_utf16_is_replaced() {
        let mut bytes = 4u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0xd800u16.to_le_bytes());
        bytes.extend_from_slice(&u16::from(b'x').to_le_bytes());
        let mut source = bytes.as_slice();

        assert_eq!(read_string(&mut source, 0, 4096).unwrap(), "\u{fffd}x");
    }

    #[test]
    fn blobs() {
        let bytes = [1, 2, 3, 4, 5];
        let mut source = bytes.as_slice();

        assert_eq!(
            read_blob(
                &mut source,
                LocationDescriptor32 {
                    data_size: 2,
                    rva: 3
                }
            )
            .unwrap(),
            [4, 5]
        );

        // The rva of an empty blob isn't looked at.
        assert!(read_blob(
            &mut source,
            LocationDescriptor32 {
                data_size: 0,
                rva: 0xdead
            }
        )
        .unwrap()
        .is_empty());

        assert!(read_blob(
            &mut source,
            LocationDescriptor32 {
                data_size: 6,
                rva: 0
            }
        )
        .is_err());
    }
}
