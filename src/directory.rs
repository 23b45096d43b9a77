//! The dump header and the stream directory that follows it.
use tracing::debug;

use crate::decode::Record;
use crate::error::{Error, Result};
use crate::map::ByteSource;
use crate::structs::{Directory, Header, LocationDescriptor32, StreamType, EXPECTED_DUMP_SIGNATURE};

/// Maps stream types to where they are stored in the dump.
#[derive(Debug, Clone)]
pub struct StreamDirectory {
    header: Header,
    entries: Vec<Directory>,
}

impl StreamDirectory {
    /// Parse the header at the start of the dump and the directory it points
    /// to.
    pub fn parse<S: ByteSource>(source: &mut S) -> Result<Self> {
        let file_size = source.file_size();
        let bytes = source.get(0, Header::SIZE)?;
        let (header, _) = Header::decode(bytes).ok_or(Error::OutOfRange {
            offset: 0,
            len: Header::SIZE as u64,
            file_size,
        })?;

        // If we don't see the expected signature, bail.
        if header.signature != EXPECTED_DUMP_SIGNATURE {
            return Err(Error::InvalidSignature(header.signature));
        }

        let rva = u64::from(header.stream_directory_rva);
        let len = (header.number_of_streams as usize)
            .checked_mul(Directory::SIZE)
            .ok_or(Error::OutOfRange {
                offset: rva,
                len: u64::MAX,
                file_size,
            })?;

        let entries = source
            .get(rva, len)?
            .chunks_exact(Directory::SIZE)
            .filter_map(|chunk| Directory::decode(chunk).map(|(entry, _)| entry))
            .collect::<Vec<_>>();

        debug!(
            streams = entries.len(),
            rva = header.stream_directory_rva,
            "parsed stream directory"
        );

        Ok(Self { header, entries })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Every entry, in the order the dump declares them.
    pub fn entries(&self) -> &[Directory] {
        &self.entries
    }

    /// Find where `stream_type` is stored. More than one entry for the same
    /// type is an error: the directory is structural, there's no way to pick
    /// one.
    pub fn resolve(&self, stream_type: StreamType) -> Result<Option<LocationDescriptor32>> {
        let raw = stream_type as u32;
        let mut matches = self
            .entries
            .iter()
            .filter(|entry| entry.stream_type == raw);

        let Some(entry) = matches.next() else {
            debug!(stream = ?stream_type, "stream not present");
            return Ok(None);
        };

        if matches.next().is_some() {
            return Err(Error::AmbiguousStream(raw));
        }

        debug!(
            stream = ?stream_type,
            rva = entry.location.rva,
            size = entry.location.data_size,
            "resolved stream"
        );

        Ok(Some(entry.location))
    }
}
