//! This module is where the extraction logic is implemented. The [`Analyzer`]
//! maps a dump through a [`ByteWindow`] by default, but it can also run over
//! any [`ByteSource`] such as a slice the caller got from somewhere else.
use std::collections::hash_map::Entry;
use std::{collections, path};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::decode::{decode_counted_list, decode_list, decode_struct, read_blob, read_string};
use crate::directory::StreamDirectory;
use crate::error::{Error, Result};
use crate::map::{ByteSource, ByteWindow, DEFAULT_MIN_WINDOW};
use crate::model::{
    Architecture, Dump, DumpType, MemoryProtection, MemoryRegion, MemoryState, MemoryType, Module,
    ModuleVersion, Thread,
};
use crate::structs::{
    MemoryInfo, MemoryInfoListStream, ModuleEntry, StreamType, SystemInfoStream, ThreadEntry,
    ThreadNameEntry,
};

/// How many bytes are read up front when decoding a string. Strings longer
/// than this are read a second time.
pub const DEFAULT_STRING_PROBE: usize = 4096;

/// Knobs of the [`Analyzer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerConfig {
    /// The smallest window mapped when reading a dump off the disk.
    pub min_window: usize,
    /// How many bytes to read first when decoding a string.
    pub string_probe: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_window: DEFAULT_MIN_WINDOW,
            string_probe: DEFAULT_STRING_PROBE,
        }
    }
}

/// Map a thread id to its name.
type ThreadNames = collections::HashMap<u32, String>;

/// Convert a `time_t` into a date.
pub(crate) fn from_time_t(time_t: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(time_t.into(), 0).unwrap_or_default()
}

/// Turns the streams of a dump into a [`Dump`].
#[derive(Debug, Default, Clone)]
pub struct Analyzer {
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Map the dump at `path` and extract it (cf [`Analyzer::analyze_source`]).
    /// The file is unmapped and closed before returning, whether it succeeded
    /// or not.
    pub fn analyze<P: AsRef<path::Path>>(&self, path: P) -> Result<Dump> {
        let path = path.as_ref();
        let mut window = ByteWindow::with_min_window(path, self.config.min_window)?;

        self.analyze_source(&mut window, path)
    }

    /// Extract the dump held by `source`; `path` is only recorded in the
    /// result.
    ///
    /// Module bases, TEBs and region addresses are all truncated to the pointer
    /// width of the architecture. A dump whose architecture has no known
    /// pointer width fails with [`Error::UnsupportedArchitecture`] as soon as
    /// one of those lists is non-empty, even if it has no memory info stream.
    pub fn analyze_source<S: ByteSource>(
        &self,
        source: &mut S,
        path: impl Into<path::PathBuf>,
    ) -> Result<Dump> {
        let path = path.into();
        let directory = StreamDirectory::parse(source)?;
        let header = directory.header();
        let timestamp = from_time_t(header.time_date_stamp);
        let dump_type = DumpType::from_bits_retain(header.flags);

        // A missing system info stream reads as the default record, which says
        // x86.
        let system_info = decode_struct::<SystemInfoStream, _>(
            source,
            directory.resolve(StreamType::SystemInfo)?,
        )?;
        let architecture = Architecture::from(system_info.processor_arch);

        let modules = self.extract_modules(source, &directory, architecture)?;
        let threads = self.extract_threads(source, &directory, architecture)?;
        let memory_regions = Self::extract_memory_regions(source, &directory, architecture)?;

        debug!(
            path = %path.display(),
            %architecture,
            modules = modules.len(),
            threads = threads.len(),
            memory_regions = memory_regions.len(),
            "extracted dump"
        );

        Ok(Dump::new(
            path,
            timestamp,
            dump_type,
            architecture,
            modules,
            threads,
            memory_regions,
        ))
    }

    /// Get the mask that truncates addresses to the pointer width of
    /// `architecture`.
    fn address_mask(architecture: Architecture) -> Result<u64> {
        architecture
            .address_mask()
            .ok_or(Error::UnsupportedArchitecture(architecture))
    }

    /// Parse the module list and read the names / CodeView records it points
    /// to.
    fn extract_modules<S: ByteSource>(
        &self,
        source: &mut S,
        directory: &StreamDirectory,
        architecture: Architecture,
    ) -> Result<Vec<Module>> {
        let entries = decode_counted_list::<ModuleEntry, _>(
            source,
            directory.resolve(StreamType::ModuleList)?,
        )?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mask = Self::address_mask(architecture)?;
        let mut modules = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = read_string(
                source,
                entry.module_name_rva.into(),
                self.config.string_probe,
            )?;
            let debug_info = read_blob(source, entry.cv_record)?;
            let version = ModuleVersion::from_packed(
                entry.version_info.file_version_ms,
                entry.version_info.file_version_ls,
            );

            modules.push(Module {
                name,
                base: entry.base_of_image & mask,
                size: entry.size_of_image,
                timestamp: from_time_t(entry.time_date_stamp),
                version,
                debug_info,
            });
        }

        Ok(modules)
    }

    /// Parse the thread names stream. Threads named more than once keep their
    /// first name.
    fn extract_thread_names<S: ByteSource>(
        &self,
        source: &mut S,
        directory: &StreamDirectory,
    ) -> Result<ThreadNames> {
        let entries = decode_counted_list::<ThreadNameEntry, _>(
            source,
            directory.resolve(StreamType::ThreadNames)?,
        )?;

        let mut names = ThreadNames::with_capacity(entries.len());
        for entry in entries {
            match names.entry(entry.thread_id) {
                Entry::Occupied(_) => {
                    warn!(tid = entry.thread_id, "thread is named twice, keeping the first name");
                }
                Entry::Vacant(vacant) => {
                    let name =
                        read_string(source, entry.rva_of_thread_name, self.config.string_probe)?;
                    vacant.insert(name);
                }
            }
        }

        Ok(names)
    }

    /// Parse the thread list and join it with the thread names.
    fn extract_threads<S: ByteSource>(
        &self,
        source: &mut S,
        directory: &StreamDirectory,
        architecture: Architecture,
    ) -> Result<Vec<Thread>> {
        let names = self.extract_thread_names(source, directory)?;
        let entries = decode_counted_list::<ThreadEntry, _>(
            source,
            directory.resolve(StreamType::ThreadList)?,
        )?;

        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mask = Self::address_mask(architecture)?;
        let mut threads = Vec::with_capacity(entries.len());
        for entry in entries {
            let context = read_blob(source, entry.thread_context)?;

            threads.push(Thread {
                id: entry.thread_id,
                name: names.get(&entry.thread_id).cloned().unwrap_or_default(),
                suspend_count: entry.suspend_count,
                priority_class: entry.priority_class,
                priority: entry.priority,
                context,
                teb: entry.teb & mask,
            });
        }

        Ok(threads)
    }

    /// Parse the memory info list stream.
    fn extract_memory_regions<S: ByteSource>(
        source: &mut S,
        directory: &StreamDirectory,
        architecture: Architecture,
    ) -> Result<Vec<MemoryRegion>> {
        let infos = decode_list::<MemoryInfoListStream, MemoryInfo, _>(
            source,
            directory.resolve(StreamType::MemoryInfoList)?,
        )?;

        if infos.is_empty() {
            return Ok(Vec::new());
        }

        let mask = Self::address_mask(architecture)?;
        let regions = infos
            .into_iter()
            .map(|info| MemoryRegion {
                base: info.base_address & mask,
                allocation_base: info.allocation_base & mask,
                allocation_protect: MemoryProtection::from_bits_retain(info.allocation_protect),
                size: info.region_size,
                state: MemoryState::from(info.state),
                protect: MemoryProtection::from_bits_retain(info.protect),
                type_: MemoryType::from(info.type_),
            })
            .collect();

        Ok(regions)
    }
}

/// Extract the dump at `path` with the default configuration.
pub fn analyze<P: AsRef<path::Path>>(path: P) -> Result<Dump> {
    Analyzer::new().analyze(path)
}
