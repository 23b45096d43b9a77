//! This is where all the raw Windows user-dump structures are stored in. They
//! are little-endian, packed on 4 bytes, and each of them knows how to decode
//! itself field by field (cf [`Record`]).
use strum::FromRepr;

use crate::decode::{FieldReader, ListHeader, Record};

pub const EXPECTED_DUMP_SIGNATURE: u32 = 0x504d_444d;

/// The stream types a directory entry can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
#[repr(u32)]
pub enum StreamType {
    Unused = 0,
    Reserved0 = 1,
    Reserved1 = 2,
    ThreadList = 3,
    ModuleList = 4,
    MemoryList = 5,
    Exception = 6,
    SystemInfo = 7,
    ThreadExList = 8,
    Memory64List = 9,
    CommentA = 10,
    CommentW = 11,
    HandleData = 12,
    FunctionTable = 13,
    UnloadedModuleList = 14,
    MiscInfo = 15,
    MemoryInfoList = 16,
    ThreadInfoList = 17,
    HandleOperationList = 18,
    Token = 19,
    JavaScriptData = 20,
    SystemMemoryInfo = 21,
    ProcessVmCounters = 22,
    IptTrace = 23,
    ThreadNames = 24,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub signature: u32,
    pub version: u32,
    pub number_of_streams: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub flags: u64,
}

impl Record for Header {
    const SIZE: usize = 0x20;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            signature: reader.u32()?,
            version: reader.u32()?,
            number_of_streams: reader.u32()?,
            stream_directory_rva: reader.u32()?,
            checksum: reader.u32()?,
            time_date_stamp: reader.u32()?,
            flags: reader.u64()?,
        })
    }
}

/// Where a stream or a sub-record lives in the file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LocationDescriptor32 {
    pub data_size: u32,
    pub rva: u32,
}

impl Record for LocationDescriptor32 {
    const SIZE: usize = 0x8;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            data_size: reader.u32()?,
            rva: reader.u32()?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Directory {
    pub stream_type: u32,
    pub location: LocationDescriptor32,
}

impl Record for Directory {
    const SIZE: usize = 0xc;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            stream_type: reader.u32()?,
            location: LocationDescriptor32::read(reader)?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuInformation {
    pub vendor_id: [u32; 3],
    pub version_information: u32,
    pub feature_information: u32,
    pub amd_extended_cpu_features: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfoStream {
    pub processor_arch: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
    pub cpu: CpuInformation,
}

impl Record for SystemInfoStream {
    const SIZE: usize = 0x38;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        let processor_arch = reader.u16()?;
        let processor_level = reader.u16()?;
        let processor_revision = reader.u16()?;
        let number_of_processors = reader.u8()?;
        let product_type = reader.u8()?;
        let major_version = reader.u32()?;
        let minor_version = reader.u32()?;
        let build_number = reader.u32()?;
        let platform_id = reader.u32()?;
        let csd_version_rva = reader.u32()?;
        let suite_mask = reader.u16()?;
        // reserved2
        reader.skip(2)?;
        let cpu = CpuInformation {
            vendor_id: [reader.u32()?, reader.u32()?, reader.u32()?],
            version_information: reader.u32()?,
            feature_information: reader.u32()?,
            amd_extended_cpu_features: reader.u32()?,
        };

        Some(Self {
            processor_arch,
            processor_level,
            processor_revision,
            number_of_processors,
            product_type,
            major_version,
            minor_version,
            build_number,
            platform_id,
            csd_version_rva,
            suite_mask,
            cpu,
        })
    }
}

/// The header of the module, thread and thread name lists.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CountHeader {
    pub count: u32,
}

impl Record for CountHeader {
    const SIZE: usize = 0x4;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            count: reader.u32()?,
        })
    }
}

impl ListHeader for CountHeader {
    fn count(&self) -> u64 {
        self.count.into()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfoListStream {
    pub size_of_header: u32,
    pub size_of_entry: u32,
    pub number_of_entries: u64,
}

impl Record for MemoryInfoListStream {
    const SIZE: usize = 0x10;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            size_of_header: reader.u32()?,
            size_of_entry: reader.u32()?,
            number_of_entries: reader.u64()?,
        })
    }
}

impl ListHeader for MemoryInfoListStream {
    fn count(&self) -> u64 {
        self.number_of_entries
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub type_: u32,
}

impl Record for MemoryInfo {
    const SIZE: usize = 0x30;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        let base_address = reader.u64()?;
        let allocation_base = reader.u64()?;
        let allocation_protect = reader.u32()?;
        // alignment1
        reader.skip(4)?;
        let region_size = reader.u64()?;
        let state = reader.u32()?;
        let protect = reader.u32()?;
        let type_ = reader.u32()?;
        // alignment2
        reader.skip(4)?;

        Some(Self {
            base_address,
            allocation_base,
            allocation_protect,
            region_size,
            state,
            protect,
            type_,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub start_of_memory_range: u64,
    pub memory: LocationDescriptor32,
}

impl Record for MemoryDescriptor {
    const SIZE: usize = 0x10;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            start_of_memory_range: reader.u64()?,
            memory: LocationDescriptor32::read(reader)?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub stack: MemoryDescriptor,
    pub thread_context: LocationDescriptor32,
}

impl Record for ThreadEntry {
    const SIZE: usize = 0x30;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            thread_id: reader.u32()?,
            suspend_count: reader.u32()?,
            priority_class: reader.u32()?,
            priority: reader.u32()?,
            teb: reader.u64()?,
            stack: MemoryDescriptor::read(reader)?,
            thread_context: LocationDescriptor32::read(reader)?,
        })
    }
}

/// An entry of the thread names stream; the name is a string stored elsewhere.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThreadNameEntry {
    pub thread_id: u32,
    pub rva_of_thread_name: u64,
}

impl Record for ThreadNameEntry {
    const SIZE: usize = 0xc;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            thread_id: reader.u32()?,
            rva_of_thread_name: reader.u64()?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FixedFileInfo {
    pub signature: u32,
    pub struc_version: u32,
    pub file_version_ms: u32,
    pub file_version_ls: u32,
    pub product_version_ms: u32,
    pub product_version_ls: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_ms: u32,
    pub file_date_ls: u32,
}

impl Record for FixedFileInfo {
    const SIZE: usize = 0x34;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        Some(Self {
            signature: reader.u32()?,
            struc_version: reader.u32()?,
            file_version_ms: reader.u32()?,
            file_version_ls: reader.u32()?,
            product_version_ms: reader.u32()?,
            product_version_ls: reader.u32()?,
            file_flags_mask: reader.u32()?,
            file_flags: reader.u32()?,
            file_os: reader.u32()?,
            file_type: reader.u32()?,
            file_subtype: reader.u32()?,
            file_date_ms: reader.u32()?,
            file_date_ls: reader.u32()?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: u32,
    pub version_info: FixedFileInfo,
    pub cv_record: LocationDescriptor32,
    pub misc_record: LocationDescriptor32,
}

impl Record for ModuleEntry {
    const SIZE: usize = 0x6c;

    fn read(reader: &mut FieldReader) -> Option<Self> {
        let entry = Self {
            base_of_image: reader.u64()?,
            size_of_image: reader.u32()?,
            checksum: reader.u32()?,
            time_date_stamp: reader.u32()?,
            module_name_rva: reader.u32()?,
            version_info: FixedFileInfo::read(reader)?,
            cv_record: LocationDescriptor32::read(reader)?,
            misc_record: LocationDescriptor32::read(reader)?,
        };

        // reserved0 / reserved1
        reader.skip(16)?;

        Some(entry)
    }
}
