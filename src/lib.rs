#![doc = include_str!("../README.md")]
mod analyzer;
pub use analyzer::{analyze, Analyzer, AnalyzerConfig, DEFAULT_STRING_PROBE};

mod container;
pub use container::{
    from_ticks, serialize, to_ticks, ContainerReader, ContainerWriter, Decode, Encode, Info,
    SectionKind, SectionReader, SectionWriter, FORMAT_VERSION, SECTIONS_START,
};

pub mod decode;

mod directory;
pub use directory::StreamDirectory;

mod error;
pub use error::{Error, Result};

mod map;
pub use map::{ByteSource, ByteWindow, DEFAULT_MIN_WINDOW};

mod model;
pub use model::{
    Architecture, Dump, DumpType, MemoryProtection, MemoryRegion, MemoryState, MemoryType, Module,
    ModuleVersion, Thread,
};

pub mod structs;
