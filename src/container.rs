//! The binary container a [`Dump`] is persisted in.
//!
//! ```text
//! u32        format version
//! u64 * 4    end offset of every section, in [`SectionKind`] order
//! ...        Info | Modules | Threads | MemoryRegions
//! ```
//!
//! Sections are written back to back right after the table, so a section
//! starts where the previous one ends. Each end offset is backpatched once
//! its section is complete, which means a reader can locate and decode any
//! section on its own once it has read the table.
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::{fs, ops, path};

use chrono::{DateTime, Utc};
use strum::{EnumCount, EnumIter, IntoStaticStr};
use tracing::{debug, trace, warn};

use crate::decode::FieldReader;
use crate::error::{Error, Result};
use crate::model::{
    Architecture, Dump, DumpType, MemoryProtection, MemoryRegion, MemoryState, MemoryType, Module,
    ModuleVersion, Thread,
};

/// Version written at the start of every container.
pub const FORMAT_VERSION: u32 = 1;

/// .NET-style ticks: 100ns intervals since 0001-01-01.
const TICKS_PER_SECOND: i64 = 10_000_000;
const NANOS_PER_TICK: i64 = 100;
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// The sections of a container, in the order they are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr)]
pub enum SectionKind {
    Info,
    Modules,
    Threads,
    MemoryRegions,
}

impl SectionKind {
    fn index(self) -> usize {
        self as usize
    }

    /// Where the end offset of this section is stored.
    fn slot_offset(self) -> u64 {
        4 + 8 * self.index() as u64
    }

    fn name(self) -> &'static str {
        self.into()
    }
}

/// Offset of the first section, right past the offset table.
pub const SECTIONS_START: u64 = 4 + 8 * SectionKind::COUNT as u64;

/// Convert a date into ticks.
pub fn to_ticks(date: DateTime<Utc>) -> i64 {
    UNIX_EPOCH_TICKS
        + date.timestamp() * TICKS_PER_SECOND
        + i64::from(date.timestamp_subsec_nanos()) / NANOS_PER_TICK
}

/// Convert ticks into a date, if it is representable.
pub fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let seconds = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = since_epoch.rem_euclid(TICKS_PER_SECOND) * NANOS_PER_TICK;

    DateTime::from_timestamp(seconds, nanos as u32)
}

fn malformed(kind: SectionKind, message: impl Into<String>) -> Error {
    Error::MalformedSection {
        section: kind.name(),
        message: message.into(),
    }
}

/// Writes the offset table and hands out one [`SectionWriter`] at a time.
#[derive(Debug)]
pub struct ContainerWriter<W: Write + Seek> {
    inner: W,
    /// Where the next section starts.
    end: u64,
    /// Index of the first kind that can still be opened.
    next: usize,
}

impl<W: Write + Seek> ContainerWriter<W> {
    /// Write the version and a zeroed offset table.
    pub fn new(mut inner: W) -> Result<Self> {
        inner.seek(SeekFrom::Start(0))?;
        inner.write_all(&FORMAT_VERSION.to_le_bytes())?;
        inner.write_all(&[0; 8 * SectionKind::COUNT])?;

        Ok(Self {
            inner,
            end: SECTIONS_START,
            next: 0,
        })
    }

    /// Open the section `kind`. Sections are laid out in [`SectionKind`] order:
    /// some can be skipped, but none can be written after a later one.
    ///
    /// The returned writer borrows the container, so
    /// no other section can be opened until it is [ended](SectionWriter::end):
    ///
    /// ```compile_fail
    /// use std::io::Cursor;
    /// use dump_analyze::{ContainerWriter, SectionKind};
    ///
    /// let mut container = ContainerWriter::new(Cursor::new(Vec::new())).unwrap();
    /// let info = container.begin_section(SectionKind::Info).unwrap();
    /// let modules = container.begin_section(SectionKind::Modules).unwrap();
    /// info.end().unwrap();
    /// modules.end().unwrap();
    /// ```
    pub fn begin_section(&mut self, kind: SectionKind) -> Result<SectionWriter<'_, W>> {
        if kind.index() < self.next {
            return Err(malformed(kind, "section is written out of order"));
        }

        self.inner.seek(SeekFrom::Start(self.end))?;
        trace!(section = kind.name(), start = self.end, "section opened");

        Ok(SectionWriter {
            container: self,
            kind,
        })
    }

    /// Flush and give back the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.inner.flush()?;

        Ok(self.inner)
    }
}

/// Writes the content of one section.
#[derive(Debug)]
pub struct SectionWriter<'c, W: Write + Seek> {
    container: &'c mut ContainerWriter<W>,
    kind: SectionKind,
}

impl<'c, W: Write + Seek> SectionWriter<'c, W> {
    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.container.inner.write_all(bytes)?;

        Ok(())
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write(&value.to_le_bytes())
    }

    pub fn write_timestamp(&mut self, date: DateTime<Utc>) -> Result<()> {
        self.write_i64(to_ticks(date))
    }

    /// Write a length that has to fit in 32 bits.
    fn write_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| malformed(self.kind, format!("{len} elements don't fit a u32")))?;

        self.write_u32(len)
    }

    /// Write a string: its UTF-8 byte length 7 bits at a time, low bits first,
    /// then the bytes.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        let mut len = u32::try_from(value.len())
            .map_err(|_| malformed(self.kind, "string is too long"))?;
        while len >= 0x80 {
            self.write(&[(len as u8) | 0x80])?;
            len >>= 7;
        }

        self.write(&[len as u8])?;
        self.write(value.as_bytes())
    }

    /// Write an opaque blob prefixed with its length.
    pub fn write_blob(&mut self, blob: &[u8]) -> Result<()> {
        self.write_len(blob.len())?;
        self.write(blob)
    }

    /// Write a count followed by every item.
    pub fn write_list<T: Encode>(&mut self, items: &[T]) -> Result<()> {
        self.write_len(items.len())?;
        for item in items {
            item.encode(self)?;
        }

        Ok(())
    }

    /// Close the section: its end offset is backpatched in the table, and the
    /// next section will start right here.
    pub fn end(self) -> Result<()> {
        let inner = &mut self.container.inner;
        let end = inner.stream_position()?;
        inner.seek(SeekFrom::Start(self.kind.slot_offset()))?;
        inner.write_all(&end.to_le_bytes())?;
        inner.seek(SeekFrom::Start(end))?;
        self.container.end = end;
        self.container.next = self.kind.index() + 1;

        trace!(section = self.kind.name(), end, "section closed");

        Ok(())
    }
}

/// Reads the content of one section.
#[derive(Debug)]
pub struct SectionReader {
    kind: SectionKind,
    bytes: Vec<u8>,
    pos: usize,
}

impl SectionReader {
    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    /// How many bytes haven't been read yet.
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn field<T>(&mut self, read: impl FnOnce(&mut FieldReader) -> Option<T>) -> Result<T> {
        let mut reader = FieldReader::new(&self.bytes[self.pos..]);
        let value =
            read(&mut reader).ok_or_else(|| malformed(self.kind, "section is truncated"))?;
        self.pos += reader.position();

        Ok(value)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.field(|reader| reader.u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        self.field(|reader| reader.u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.field(|reader| reader.u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.field(|reader| reader.u64())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.field(|reader| reader.i64())
    }

    pub fn read_timestamp(&mut self) -> Result<DateTime<Utc>> {
        let ticks = self.read_i64()?;

        from_ticks(ticks).ok_or_else(|| malformed(self.kind, format!("{ticks} ticks is not a date")))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.field(|reader| reader.bytes(len).map(<[u8]>::to_vec))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let mut len = 0u32;
        for shift in (0..32).step_by(7) {
            let byte = self.read_u8()?;
            len |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                let bytes = self.read_bytes(len as usize)?;
                return String::from_utf8(bytes)
                    .map_err(|e| malformed(self.kind, format!("string is not UTF-8: {e}")));
            }
        }

        Err(malformed(self.kind, "string length is too long"))
    }

    pub fn read_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()?;

        self.read_bytes(len as usize)
    }

    /// Read a count followed by that many items.
    pub fn read_list<T: Decode>(&mut self) -> Result<Vec<T>> {
        let count = self.read_u32()? as usize;
        // Every item takes at least a byte.
        if count > self.remaining() {
            return Err(malformed(
                self.kind,
                format!("{count} items can't fit in {} bytes", self.remaining()),
            ));
        }

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(self)?);
        }

        Ok(items)
    }

    /// Make sure the whole section has been consumed.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(malformed(self.kind, format!("{n} trailing bytes"))),
        }
    }
}

/// Something that can be written in a section.
pub trait Encode {
    fn encode<W: Write + Seek>(&self, section: &mut SectionWriter<'_, W>) -> Result<()>;
}

/// Something that can be read back from a section.
pub trait Decode: Sized {
    fn decode(section: &mut SectionReader) -> Result<Self>;
}

impl Encode for Module {
    fn encode<W: Write + Seek>(&self, section: &mut SectionWriter<'_, W>) -> Result<()> {
        section.write_string(&self.name)?;
        section.write_u64(self.base)?;
        section.write_u32(self.size)?;
        section.write_timestamp(self.timestamp)?;
        section.write_u32(self.version.major.into())?;
        section.write_u32(self.version.minor.into())?;
        section.write_u32(self.version.build.into())?;
        section.write_u32(self.version.revision.into())?;
        section.write_blob(&self.debug_info)
    }
}

impl Decode for Module {
    fn decode(section: &mut SectionReader) -> Result<Self> {
        let name = section.read_string()?;
        let base = section.read_u64()?;
        let size = section.read_u32()?;
        let timestamp = section.read_timestamp()?;
        let mut component = || -> Result<u16> {
            let value = section.read_u32()?;
            u16::try_from(value).map_err(|_| {
                malformed(SectionKind::Modules, format!("version component {value} is too big"))
            })
        };
        let version = ModuleVersion {
            major: component()?,
            minor: component()?,
            build: component()?,
            revision: component()?,
        };
        let debug_info = section.read_blob()?;

        Ok(Self {
            name,
            base,
            size,
            timestamp,
            version,
            debug_info,
        })
    }
}

impl Encode for Thread {
    fn encode<W: Write + Seek>(&self, section: &mut SectionWriter<'_, W>) -> Result<()> {
        section.write_u32(self.id)?;
        section.write_string(&self.name)?;
        section.write_u32(self.suspend_count)?;
        section.write_u32(self.priority_class)?;
        section.write_u32(self.priority)?;
        section.write_blob(&self.context)?;
        section.write_u64(self.teb)
    }
}

impl Decode for Thread {
    fn decode(section: &mut SectionReader) -> Result<Self> {
        Ok(Self {
            id: section.read_u32()?,
            name: section.read_string()?,
            suspend_count: section.read_u32()?,
            priority_class: section.read_u32()?,
            priority: section.read_u32()?,
            context: section.read_blob()?,
            teb: section.read_u64()?,
        })
    }
}

impl Encode for MemoryRegion {
    fn encode<W: Write + Seek>(&self, section: &mut SectionWriter<'_, W>) -> Result<()> {
        section.write_u64(self.base)?;
        section.write_u64(self.allocation_base)?;
        section.write_u32(self.allocation_protect.bits())?;
        section.write_u64(self.size)?;
        section.write_u32(self.state.as_u32())?;
        section.write_u32(self.protect.bits())?;
        section.write_u32(self.type_.as_u32())
    }
}

impl Decode for MemoryRegion {
    fn decode(section: &mut SectionReader) -> Result<Self> {
        Ok(Self {
            base: section.read_u64()?,
            allocation_base: section.read_u64()?,
            allocation_protect: MemoryProtection::from_bits_retain(section.read_u32()?),
            size: section.read_u64()?,
            state: MemoryState::from(section.read_u32()?),
            protect: MemoryProtection::from_bits_retain(section.read_u32()?),
            type_: MemoryType::from(section.read_u32()?),
        })
    }
}

/// The content of the info section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub path: path::PathBuf,
    pub timestamp: DateTime<Utc>,
    pub dump_type: DumpType,
    pub architecture: Architecture,
}

/// Write every section of `dump` into `inner`, and give it back.
pub fn serialize<W: Write + Seek>(dump: &Dump, inner: W) -> Result<W> {
    let mut container = ContainerWriter::new(inner)?;

    let mut section = container.begin_section(SectionKind::Info)?;
    section.write_string(&dump.path().to_string_lossy())?;
    section.write_timestamp(dump.timestamp())?;
    section.write_u64(dump.dump_type().bits())?;
    section.write_u16(dump.architecture().into())?;
    section.end()?;

    let mut section = container.begin_section(SectionKind::Modules)?;
    section.write_list(dump.modules())?;
    section.end()?;

    let mut section = container.begin_section(SectionKind::Threads)?;
    section.write_list(dump.threads())?;
    section.end()?;

    let mut section = container.begin_section(SectionKind::MemoryRegions)?;
    section.write_list(dump.memory_regions())?;
    section.end()?;

    container.into_inner()
}

/// Reads the offset table of a container, then any section on demand.
#[derive(Debug)]
pub struct ContainerReader<R: Read + Seek> {
    inner: R,
    /// Size of the container.
    len: u64,
    /// The end offset of every section.
    ends: [u64; SectionKind::COUNT],
}

impl<R: Read + Seek> ContainerReader<R> {
    /// Read the version and the offset table.
    pub fn open(mut inner: R) -> Result<Self> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let mut table = [0; SECTIONS_START as usize];
        inner.read_exact(&mut table)?;

        let mut reader = FieldReader::new(&table);
        let version = reader.u32().unwrap_or_default();
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedFormatVersion(version));
        }

        let mut ends = [0; SectionKind::COUNT];
        for end in &mut ends {
            *end = reader.u64().unwrap_or_default();
        }

        debug!(len, ?ends, "opened container");

        Ok(Self { inner, len, ends })
    }

    /// The end offsets as stored in the table.
    pub fn section_ends(&self) -> &[u64; SectionKind::COUNT] {
        &self.ends
    }

    /// Where the section `kind` lives.
    pub fn section_range(&self, kind: SectionKind) -> Result<ops::Range<u64>> {
        // Sections that were skipped have no end.
        let start = self.ends[..kind.index()]
            .iter()
            .rev()
            .copied()
            .find(|&end| end != 0)
            .unwrap_or(SECTIONS_START);
        let end = self.ends[kind.index()];

        if end == 0 {
            return Err(malformed(kind, "section was never written"));
        }

        if start < SECTIONS_START || start > end || end > self.len {
            return Err(malformed(
                kind,
                format!("bounds {start:#x}..{end:#x} are invalid (len {:#x})", self.len),
            ));
        }

        Ok(start..end)
    }

    /// Read the whole section `kind` in memory.
    pub fn section(&mut self, kind: SectionKind) -> Result<SectionReader> {
        let range = self.section_range(kind)?;
        let len = usize::try_from(range.end - range.start)
            .map_err(|_| malformed(kind, "section is too large"))?;

        self.inner.seek(SeekFrom::Start(range.start))?;
        let mut bytes = vec![0; len];
        self.inner.read_exact(&mut bytes)?;

        Ok(SectionReader {
            kind,
            bytes,
            pos: 0,
        })
    }

    pub fn read_info(&mut self) -> Result<Info> {
        let mut section = self.section(SectionKind::Info)?;
        let info = Info {
            path: section.read_string()?.into(),
            timestamp: section.read_timestamp()?,
            dump_type: DumpType::from_bits_retain(section.read_u64()?),
            architecture: Architecture::from(section.read_u16()?),
        };
        section.finish()?;

        Ok(info)
    }

    fn read_list<T: Decode>(&mut self, kind: SectionKind) -> Result<Vec<T>> {
        let mut section = self.section(kind)?;
        let items = section.read_list()?;
        section.finish()?;

        Ok(items)
    }

    pub fn read_modules(&mut self) -> Result<Vec<Module>> {
        self.read_list(SectionKind::Modules)
    }

    pub fn read_threads(&mut self) -> Result<Vec<Thread>> {
        self.read_list(SectionKind::Threads)
    }

    pub fn read_memory_regions(&mut self) -> Result<Vec<MemoryRegion>> {
        self.read_list(SectionKind::MemoryRegions)
    }

    /// Rebuild the [`Dump`] out of every section.
    pub fn read_dump(&mut self) -> Result<Dump> {
        let info = self.read_info()?;
        let modules = self.read_modules()?;
        let threads = self.read_threads()?;
        let memory_regions = self.read_memory_regions()?;

        Ok(Dump::new(
            info.path,
            info.timestamp,
            info.dump_type,
            info.architecture,
            modules,
            threads,
            memory_regions,
        ))
    }
}

impl Dump {
    /// Write the dump into a container at `path`. If anything fails, the
    /// partially written file is removed.
    pub fn save<P: AsRef<path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = fs::File::create(path)?;
        let result = serialize(self, io::BufWriter::new(file))
            .and_then(|writer| writer.into_inner().map_err(|e| e.into_error().into()));

        if let Err(error) = result {
            if let Err(remove_error) = fs::remove_file(path) {
                warn!(path = %path.display(), %remove_error, "failed to remove partial container");
            }

            return Err(error);
        }

        debug!(path = %path.display(), "saved container");

        Ok(())
    }

    /// Read back a dump saved with [`Dump::save`].
    pub fn load<P: AsRef<path::Path>>(path: P) -> Result<Dump> {
        let file = fs::File::open(path)?;

        ContainerReader::open(io::BufReader::new(file))?.read_dump()
    }
}
