//! The normalized view of a dump: what the analyzer produces, what the
//! container persists and what callers consume.
use std::{fmt, ops, path};

use bitflags::bitflags;
use chrono::{DateTime, Utc};

/// Processor architecture of the dumped process, as stored in the system info
/// stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    #[default]
    X86,
    Mips,
    Alpha,
    Ppc,
    Shx,
    Arm,
    Ia64,
    Alpha64,
    Msil,
    X64,
    Ia32OnWin64,
    Neutral,
    Arm64,
    Arm32OnWin64,
    Ia32OnArm64,
    /// A value that isn't in the list, kept as is.
    Unknown(u16),
}

impl Architecture {
    /// Size of a pointer in bytes. Only x86/x64/ARM64/IA64 flavors are known.
    pub fn pointer_width(self) -> Option<u8> {
        match self {
            Self::X86 | Self::Ia32OnWin64 | Self::Ia32OnArm64 => Some(4),
            Self::X64 | Self::Arm64 | Self::Ia64 => Some(8),
            _ => None,
        }
    }

    /// Mask that truncates an address to the pointer width.
    pub fn address_mask(self) -> Option<u64> {
        self.pointer_width().map(|width| match width {
            4 => 0xffff_ffff,
            _ => u64::MAX,
        })
    }
}

impl From<u16> for Architecture {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::X86,
            1 => Self::Mips,
            2 => Self::Alpha,
            3 => Self::Ppc,
            4 => Self::Shx,
            5 => Self::Arm,
            6 => Self::Ia64,
            7 => Self::Alpha64,
            8 => Self::Msil,
            9 => Self::X64,
            10 => Self::Ia32OnWin64,
            11 => Self::Neutral,
            12 => Self::Arm64,
            13 => Self::Arm32OnWin64,
            14 => Self::Ia32OnArm64,
            raw => Self::Unknown(raw),
        }
    }
}

impl From<Architecture> for u16 {
    fn from(architecture: Architecture) -> Self {
        match architecture {
            Architecture::X86 => 0,
            Architecture::Mips => 1,
            Architecture::Alpha => 2,
            Architecture::Ppc => 3,
            Architecture::Shx => 4,
            Architecture::Arm => 5,
            Architecture::Ia64 => 6,
            Architecture::Alpha64 => 7,
            Architecture::Msil => 8,
            Architecture::X64 => 9,
            Architecture::Ia32OnWin64 => 10,
            Architecture::Neutral => 11,
            Architecture::Arm64 => 12,
            Architecture::Arm32OnWin64 => 13,
            Architecture::Ia32OnArm64 => 14,
            Architecture::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(raw) => write!(f, "Unknown({raw:#x})"),
            known => write!(f, "{known:?}"),
        }
    }
}

bitflags! {
    /// The kind of capture. Unknown bits are carried around untouched.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DumpType: u64 {
        const WITH_DATA_SEGS = 0x0000_0001;
        const WITH_FULL_MEMORY = 0x0000_0002;
        const WITH_HANDLE_DATA = 0x0000_0004;
        const FILTER_MEMORY = 0x0000_0008;
        const SCAN_MEMORY = 0x0000_0010;
        const WITH_UNLOADED_MODULES = 0x0000_0020;
        const WITH_INDIRECTLY_REFERENCED_MEMORY = 0x0000_0040;
        const FILTER_MODULE_PATHS = 0x0000_0080;
        const WITH_PROCESS_THREAD_DATA = 0x0000_0100;
        const WITH_PRIVATE_READ_WRITE_MEMORY = 0x0000_0200;
        const WITHOUT_OPTIONAL_DATA = 0x0000_0400;
        const WITH_FULL_MEMORY_INFO = 0x0000_0800;
        const WITH_THREAD_INFO = 0x0000_1000;
        const WITH_CODE_SEGS = 0x0000_2000;
        const WITHOUT_AUXILIARY_STATE = 0x0000_4000;
        const WITH_FULL_AUXILIARY_STATE = 0x0000_8000;
        const WITH_PRIVATE_WRITE_COPY_MEMORY = 0x0001_0000;
        const IGNORE_INACCESSIBLE_MEMORY = 0x0002_0000;
        const WITH_TOKEN_INFORMATION = 0x0004_0000;
        const WITH_MODULE_HEADERS = 0x0008_0000;
        const FILTER_TRIAGE = 0x0010_0000;
        const WITH_AVX_XSTATE_CONTEXT = 0x0020_0000;
        const WITH_IPT_TRACE = 0x0040_0000;
        const SCAN_INACCESSIBLE_PARTIAL_PAGES = 0x0080_0000;
    }
}

bitflags! {
    /// Page protection of a memory region.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProtection: u32 {
        const NOACCESS = 0x01;
        const READONLY = 0x02;
        const READWRITE = 0x04;
        const WRITECOPY = 0x08;
        const EXECUTE = 0x10;
        const EXECUTE_READ = 0x20;
        const EXECUTE_READWRITE = 0x40;
        const EXECUTE_WRITECOPY = 0x80;
        const GUARD = 0x100;
        const NOCACHE = 0x200;
        const WRITECOMBINE = 0x400;
    }
}

impl MemoryProtection {
    /// A page is readable if it is protected with any of these rights.
    pub const READABLE: Self = Self::READONLY
        .union(Self::READWRITE)
        .union(Self::WRITECOPY)
        .union(Self::EXECUTE_READ)
        .union(Self::EXECUTE_READWRITE)
        .union(Self::EXECUTE_WRITECOPY);

    /// A page is writable if it is protected with any of these rights.
    pub const WRITABLE: Self = Self::READWRITE
        .union(Self::WRITECOPY)
        .union(Self::EXECUTE_READWRITE)
        .union(Self::EXECUTE_WRITECOPY);

    /// A page is executable if it is protected with any of these rights.
    pub const EXECUTABLE: Self = Self::EXECUTE
        .union(Self::EXECUTE_READ)
        .union(Self::EXECUTE_READWRITE)
        .union(Self::EXECUTE_WRITECOPY);

    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    pub fn is_executable(self) -> bool {
        self.intersects(Self::EXECUTABLE)
    }
}

/// Display the protection the way the Windows headers name it, eg.
/// `PAGE_GUARD | PAGE_READWRITE`.
impl fmt::Display for MemoryProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::GUARD, "PAGE_GUARD"),
            (Self::NOCACHE, "PAGE_NOCACHE"),
            (Self::WRITECOMBINE, "PAGE_WRITECOMBINE"),
            (Self::NOACCESS, "PAGE_NOACCESS"),
            (Self::READONLY, "PAGE_READONLY"),
            (Self::READWRITE, "PAGE_READWRITE"),
            (Self::WRITECOPY, "PAGE_WRITECOPY"),
            (Self::EXECUTE, "PAGE_EXECUTE"),
            (Self::EXECUTE_READ, "PAGE_EXECUTE_READ"),
            (Self::EXECUTE_READWRITE, "PAGE_EXECUTE_READWRITE"),
            (Self::EXECUTE_WRITECOPY, "PAGE_EXECUTE_WRITECOPY"),
        ];

        let mut parts = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| name.to_string())
            .collect::<Vec<_>>();

        let unknown = self.bits() & !Self::all().bits();
        if unknown != 0 {
            parts.push(format!("{unknown:#x}"));
        }

        f.write_str(&parts.join(" | "))
    }
}

/// State of a memory region. A region is in exactly one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryState {
    Committed,
    Reserved,
    Free,
    /// A value none of the above, kept as is.
    Unknown(u32),
}

impl MemoryState {
    pub const MEM_COMMIT: u32 = 0x1000;
    pub const MEM_RESERVE: u32 = 0x2000;
    pub const MEM_FREE: u32 = 0x1_0000;

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Committed => Self::MEM_COMMIT,
            Self::Reserved => Self::MEM_RESERVE,
            Self::Free => Self::MEM_FREE,
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<u32> for MemoryState {
    fn from(value: u32) -> Self {
        match value {
            Self::MEM_COMMIT => Self::Committed,
            Self::MEM_RESERVE => Self::Reserved,
            Self::MEM_FREE => Self::Free,
            raw => Self::Unknown(raw),
        }
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => f.write_str("MEM_COMMIT"),
            Self::Reserved => f.write_str("MEM_RESERVE"),
            Self::Free => f.write_str("MEM_FREE"),
            Self::Unknown(raw) => write!(f, "UNKNOWN({raw:#x})"),
        }
    }
}

/// What backs a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    Private,
    Mapped,
    Image,
    /// A value none of the above (free regions carry 0), kept as is.
    Unknown(u32),
}

impl MemoryType {
    pub const MEM_PRIVATE: u32 = 0x2_0000;
    pub const MEM_MAPPED: u32 = 0x4_0000;
    pub const MEM_IMAGE: u32 = 0x100_0000;

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Private => Self::MEM_PRIVATE,
            Self::Mapped => Self::MEM_MAPPED,
            Self::Image => Self::MEM_IMAGE,
            Self::Unknown(raw) => raw,
        }
    }
}

impl From<u32> for MemoryType {
    fn from(value: u32) -> Self {
        match value {
            Self::MEM_PRIVATE => Self::Private,
            Self::MEM_MAPPED => Self::Mapped,
            Self::MEM_IMAGE => Self::Image,
            raw => Self::Unknown(raw),
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => f.write_str("MEM_PRIVATE"),
            Self::Mapped => f.write_str("MEM_MAPPED"),
            Self::Image => f.write_str("MEM_IMAGE"),
            Self::Unknown(raw) => write!(f, "UNKNOWN({raw:#x})"),
        }
    }
}

/// File version of a module.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleVersion {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl ModuleVersion {
    /// Unpack the two 32-bit halves of a `VS_FIXEDFILEINFO` file version:
    /// `ms` holds major/minor and `ls` build/revision, high word first.
    pub fn from_packed(ms: u32, ls: u32) -> Self {
        Self {
            major: (ms >> 16) as u16,
            minor: ms as u16,
            build: (ls >> 16) as u16,
            revision: ls as u16,
        }
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

/// A module loaded in the address space.
#[allow(clippy::len_without_is_empty)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// The module path as recorded by the dump producer.
    pub name: String,
    /// Where the module is loaded at.
    pub base: u64,
    /// Size of the image in memory.
    pub size: u32,
    /// Link timestamp of the image.
    pub timestamp: DateTime<Utc>,
    pub version: ModuleVersion,
    /// The CodeView record, verbatim. Empty if the dump has none.
    pub debug_info: Vec<u8>,
}

impl Module {
    /// Get the range of memory the module is loaded at.
    pub fn range(&self) -> ops::Range<u64> {
        self.base..self.base.saturating_add(self.size.into())
    }

    /// Get the address of the last byte of the module.
    pub fn end_addr(&self) -> u64 {
        self.range().end.saturating_sub(1)
    }

    pub fn len(&self) -> u64 {
        self.size.into()
    }

    /// Get the file name of the module. Windows paths are split on both
    /// separators regardless of the host.
    pub fn file_name(&self) -> &str {
        self.name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(self.name.as_str())
    }
}

/// A thread that was running when the dump was generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    /// The thread ID.
    pub id: u32,
    /// Its name; empty when the dump has no name for it.
    pub name: String,
    /// The suspend count counter cf [Freezing and Suspending Threads](https://learn.microsoft.com/en-us/windows-hardware/drivers/debugger/controlling-processes-and-threads).
    pub suspend_count: u32,
    /// The priority class cf [Priority Class](https://learn.microsoft.com/en-us/windows/win32/procthread/scheduling-priorities).
    pub priority_class: u32,
    /// Thread priority cf [Priority level](https://learn.microsoft.com/en-us/windows/win32/procthread/scheduling-priorities).
    pub priority: u32,
    /// The raw CPU context, verbatim.
    pub context: Vec<u8>,
    /// The thread environment block address.
    pub teb: u64,
}

/// A region of the virtual address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    /// The base of the allocation that gave life to this region.
    pub allocation_base: u64,
    /// The page protection used at allocation time.
    pub allocation_protect: MemoryProtection,
    pub size: u64,
    pub state: MemoryState,
    /// The page protection currently applied to the region.
    pub protect: MemoryProtection,
    pub type_: MemoryType,
}

impl MemoryRegion {
    /// Range over the start/end address of the region.
    pub fn range(&self) -> ops::Range<u64> {
        self.base..self.base.saturating_add(self.size)
    }
}

/// Everything extracted out of a dump. Built once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dump {
    path: path::PathBuf,
    timestamp: DateTime<Utc>,
    dump_type: DumpType,
    architecture: Architecture,
    modules: Vec<Module>,
    threads: Vec<Thread>,
    memory_regions: Vec<MemoryRegion>,
}

impl Dump {
    pub(crate) fn new(
        path: path::PathBuf,
        timestamp: DateTime<Utc>,
        dump_type: DumpType,
        architecture: Architecture,
        modules: Vec<Module>,
        threads: Vec<Thread>,
        memory_regions: Vec<MemoryRegion>,
    ) -> Self {
        Self {
            path,
            timestamp,
            dump_type,
            architecture,
            modules,
            threads,
            memory_regions,
        }
    }

    /// Path of the dump this was extracted from.
    pub fn path(&self) -> &path::Path {
        &self.path
    }

    /// When the dump was captured.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn dump_type(&self) -> DumpType {
        self.dump_type
    }

    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Modules in directory order.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Threads in directory order.
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    /// Memory regions in directory order.
    pub fn memory_regions(&self) -> &[MemoryRegion] {
        &self.memory_regions
    }

    /// Find a [`Module`] that includes `address` in its range.
    pub fn find_module(&self, address: u64) -> Option<&Module> {
        self.modules
            .iter()
            .find(|module| module.range().contains(&address))
    }

    /// Find a [`Thread`] with a specific TID.
    pub fn find_thread(&self, id: u32) -> Option<&Thread> {
        self.threads.iter().find(|thread| thread.id == id)
    }

    /// Find a [`MemoryRegion`] that includes `address` in its range.
    pub fn find_memory_region(&self, address: u64) -> Option<&MemoryRegion> {
        self.memory_regions
            .iter()
            .find(|region| region.range().contains(&address))
    }
}
