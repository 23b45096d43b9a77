//! Builds synthetic minidumps for the integration tests.
#![allow(dead_code)]

use std::io::Write;

use tempfile::NamedTempFile;

pub const SIGNATURE: u32 = 0x504d_444d;
pub const THREAD_LIST: u32 = 3;
pub const MODULE_LIST: u32 = 4;
pub const SYSTEM_INFO: u32 = 7;
pub const MEMORY_INFO_LIST: u32 = 16;
pub const THREAD_NAMES: u32 = 24;

/// Room reserved for the directory right after the header.
const MAX_STREAMS: usize = 16;
const HEADER_SIZE: usize = 0x20;
const DATA_START: usize = HEADER_SIZE + MAX_STREAMS * 0xc;

pub struct TestModule {
    pub name: &'static str,
    pub base: u64,
    pub size: u32,
    pub timestamp: u32,
    pub version_ms: u32,
    pub version_ls: u32,
    pub cv: Vec<u8>,
}

pub struct TestThread {
    pub id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub context: Vec<u8>,
}

pub struct TestRegion {
    pub base: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub size: u64,
    pub state: u32,
    pub protect: u32,
    pub type_: u32,
}

/// Lays out a header, a directory and the data the streams point to.
#[derive(Default)]
pub struct DumpBuilder {
    time_date_stamp: u32,
    flags: u64,
    streams: Vec<(u32, u32, u32)>,
    data: Vec<u8>,
}

impl DumpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_date_stamp(&mut self, time_date_stamp: u32) -> &mut Self {
        self.time_date_stamp = time_date_stamp;
        self
    }

    pub fn flags(&mut self, flags: u64) -> &mut Self {
        self.flags = flags;
        self
    }

    /// Append `bytes` to the data area and return their rva.
    pub fn push(&mut self, bytes: &[u8]) -> u32 {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }

        let rva = (DATA_START + self.data.len()) as u32;
        self.data.extend_from_slice(bytes);
        rva
    }

    /// Append a length-prefixed UTF-16 string.
    pub fn string(&mut self, value: &str) -> u32 {
        let units = value.encode_utf16().collect::<Vec<_>>();
        let mut bytes = ((units.len() * 2) as u32).to_le_bytes().to_vec();
        for unit in units {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }

        self.push(&bytes)
    }

    /// Declare a stream made of `bytes`.
    pub fn stream(&mut self, stream_type: u32, bytes: &[u8]) -> &mut Self {
        self.stream_with_size(stream_type, bytes, bytes.len() as u32)
    }

    /// Declare a stream made of `bytes` whose directory entry says it is
    /// `data_size` bytes long.
    pub fn stream_with_size(&mut self, stream_type: u32, bytes: &[u8], data_size: u32) -> &mut Self {
        let rva = self.push(bytes);
        self.streams.push((stream_type, data_size, rva));
        self
    }

    pub fn system_info(&mut self, processor_arch: u16) -> &mut Self {
        let mut bytes = vec![0; 0x38];
        bytes[..2].copy_from_slice(&processor_arch.to_le_bytes());
        // number of processors
        bytes[6] = 4;
        // major / minor / build
        bytes[8..12].copy_from_slice(&10u32.to_le_bytes());
        bytes[16..20].copy_from_slice(&19045u32.to_le_bytes());
        self.stream(SYSTEM_INFO, &bytes)
    }

    /// Push the names and CodeView records, and return the module list.
    pub fn module_list(&mut self, modules: &[TestModule]) -> Vec<u8> {
        let mut bytes = (modules.len() as u32).to_le_bytes().to_vec();
        for module in modules {
            let name_rva = self.string(module.name);
            let cv_rva = if module.cv.is_empty() {
                0
            } else {
                self.push(&module.cv)
            };

            bytes.extend_from_slice(&module.base.to_le_bytes());
            bytes.extend_from_slice(&module.size.to_le_bytes());
            // checksum
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&module.timestamp.to_le_bytes());
            bytes.extend_from_slice(&name_rva.to_le_bytes());
            // fixed file info
            bytes.extend_from_slice(&0xfeef_04bdu32.to_le_bytes());
            bytes.extend_from_slice(&0x1_0000u32.to_le_bytes());
            bytes.extend_from_slice(&module.version_ms.to_le_bytes());
            bytes.extend_from_slice(&module.version_ls.to_le_bytes());
            bytes.extend_from_slice(&[0; 9 * 4]);
            // cv record
            bytes.extend_from_slice(&(module.cv.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&cv_rva.to_le_bytes());
            // misc record and reserved fields
            bytes.extend_from_slice(&[0; 8 + 16]);
        }

        bytes
    }

    pub fn modules(&mut self, modules: &[TestModule]) -> &mut Self {
        let bytes = self.module_list(modules);
        self.stream(MODULE_LIST, &bytes)
    }

    pub fn threads(&mut self, threads: &[TestThread]) -> &mut Self {
        let mut bytes = (threads.len() as u32).to_le_bytes().to_vec();
        for thread in threads {
            let context_rva = if thread.context.is_empty() {
                0
            } else {
                self.push(&thread.context)
            };

            bytes.extend_from_slice(&thread.id.to_le_bytes());
            bytes.extend_from_slice(&thread.suspend_count.to_le_bytes());
            bytes.extend_from_slice(&thread.priority_class.to_le_bytes());
            bytes.extend_from_slice(&thread.priority.to_le_bytes());
            bytes.extend_from_slice(&thread.teb.to_le_bytes());
            // stack
            bytes.extend_from_slice(&[0; 0x10]);
            bytes.extend_from_slice(&(thread.context.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&context_rva.to_le_bytes());
        }

        self.stream(THREAD_LIST, &bytes)
    }

    pub fn thread_names(&mut self, names: &[(u32, &str)]) -> &mut Self {
        let mut bytes = (names.len() as u32).to_le_bytes().to_vec();
        for (id, name) in names {
            let rva = self.string(name);
            bytes.extend_from_slice(&id.to_le_bytes());
            bytes.extend_from_slice(&u64::from(rva).to_le_bytes());
        }

        self.stream(THREAD_NAMES, &bytes)
    }

    pub fn memory_info(&mut self, regions: &[TestRegion]) -> &mut Self {
        let bytes = memory_info_list(regions);
        self.stream(MEMORY_INFO_LIST, &bytes)
    }

    pub fn build(&self) -> Vec<u8> {
        assert!(self.streams.len() <= MAX_STREAMS);
        let mut bytes = Vec::with_capacity(DATA_START + self.data.len());
        bytes.extend_from_slice(&SIGNATURE.to_le_bytes());
        bytes.extend_from_slice(&0xa793u32.to_le_bytes());
        bytes.extend_from_slice(&(self.streams.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        // checksum
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&self.time_date_stamp.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        for (stream_type, data_size, rva) in &self.streams {
            bytes.extend_from_slice(&stream_type.to_le_bytes());
            bytes.extend_from_slice(&data_size.to_le_bytes());
            bytes.extend_from_slice(&rva.to_le_bytes());
        }

        bytes.resize(DATA_START, 0);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Write the dump in a temporary file.
    pub fn write(&self) -> NamedTempFile {
        create_temp_file(&self.build())
    }
}

/// The memory info list stream: a 16-byte header, then one 48-byte entry per
/// region.
pub fn memory_info_list(regions: &[TestRegion]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&0x10u32.to_le_bytes());
    bytes.extend_from_slice(&0x30u32.to_le_bytes());
    bytes.extend_from_slice(&(regions.len() as u64).to_le_bytes());
    for region in regions {
        bytes.extend_from_slice(&region.base.to_le_bytes());
        bytes.extend_from_slice(&region.allocation_base.to_le_bytes());
        bytes.extend_from_slice(&region.allocation_protect.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
        bytes.extend_from_slice(&region.size.to_le_bytes());
        bytes.extend_from_slice(&region.state.to_le_bytes());
        bytes.extend_from_slice(&region.protect.to_le_bytes());
        bytes.extend_from_slice(&region.type_.to_le_bytes());
        bytes.extend_from_slice(&[0; 4]);
    }

    bytes
}

/// Creates a temporary file with the given content.
pub fn create_temp_file(content: &[u8]) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

/// A small x64 process: two modules, two threads (one of them named) and
/// three regions.
pub fn x64_process() -> DumpBuilder {
    let mut builder = DumpBuilder::new();
    builder
        .time_date_stamp(1_690_000_000)
        .flags(0x1826)
        .system_info(9)
        .modules(&[
            TestModule {
                name: r"C:\Windows\System32\ntdll.dll",
                base: 0x7ffb_5000_0000,
                size: 0x1f_8000,
                timestamp: 0x5a00_0000,
                version_ms: 0x000a_0000,
                version_ls: 0x4a65_0d0d,
                cv: b"RSDS0123456789abcdef\x01\x00\x00\x00ntdll.pdb\x00".to_vec(),
            },
            TestModule {
                name: r"C:\app\app.exe",
                base: 0x7ff7_1000_0000,
                size: 0x2_0000,
                timestamp: 0x64b5_8a1c,
                version_ms: 0x0007_0008,
                version_ls: 0x0000_0001,
                cv: Vec::new(),
            },
        ])
        .threads(&[
            TestThread {
                id: 7,
                suspend_count: 1,
                priority_class: 0x20,
                priority: 0,
                teb: 0x2f_0000_1000,
                context: vec![0xcc; 0x4d0],
            },
            TestThread {
                id: 0x1337,
                suspend_count: 0,
                priority_class: 0x20,
                priority: 2,
                teb: 0x2f_0000_3000,
                context: vec![0xaa; 0x4d0],
            },
        ])
        .thread_names(&[(0x1337, "worker")])
        .memory_info(&[
            TestRegion {
                base: 0x7ff7_1000_0000,
                allocation_base: 0x7ff7_1000_0000,
                allocation_protect: 0x80,
                size: 0x1000,
                state: 0x1000,
                protect: 0x02,
                type_: 0x100_0000,
            },
            TestRegion {
                base: 0x7ff7_1000_1000,
                allocation_base: 0x7ff7_1000_0000,
                allocation_protect: 0x80,
                size: 0x1_0000,
                state: 0x1000,
                protect: 0x20,
                type_: 0x100_0000,
            },
            TestRegion {
                base: 0x7ff7_1002_0000,
                allocation_base: 0,
                allocation_protect: 0,
                size: 0x7ff8_0000_0000,
                state: 0x1_0000,
                protect: 0x01,
                type_: 0,
            },
        ]);

    builder
}
