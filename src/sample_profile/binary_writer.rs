use crate::sample_profile::binary_profile::*;
use crate::sample_profile::*;
use crate::summary::{ProfileSummary, DEFAULT_CUTOFFS};
use crate::util::{write_leb128, write_string_list};
use std::collections::{BTreeMap, BTreeSet};
use std::convert::TryFrom;
use std::io::{self, Write};
use tracing::debug;

/// The `BinaryProfWriter` writes out the symbols and their summary as a binary sample profile.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct BinaryProfWriter {
    version: FormatVersion,
    compress_names: bool,
    include_summary: bool,
}

impl Default for BinaryProfWriter {
    fn default() -> Self {
        Self::new(FormatVersion::LATEST)
    }
}

impl BinaryProfWriter {
    pub fn new(version: FormatVersion) -> Self {
        Self {
            version,
            compress_names: false,
            include_summary: true,
        }
    }

    /// Compress the name table. Only versions with a compressible name table are affected.
    pub fn with_compressed_names(mut self, compress: bool) -> Self {
        self.compress_names = compress;
        self
    }

    /// Whether to write the summary section, on by default.
    pub fn with_summary(mut self, include: bool) -> Self {
        self.include_summary = include;
        self
    }

    pub fn version(&self) -> FormatVersion {
        self.version
    }
}

impl SampleProfWriter for BinaryProfWriter {
    fn write(&self, symbols: &SymbolMap, writer: &mut impl Write) -> Result<(), ProfileError> {
        check_inline_depth(symbols)?;
        let summary = if self.include_summary {
            Some(ProfileSummary::compute(symbols, &DEFAULT_CUTOFFS)?)
        } else {
            None
        };
        let layout = self.version.layout();
        let names = NameTable::new(layout, symbols);
        debug!(
            "Writing version {} profile with {} functions",
            self.version,
            symbols.len()
        );

        writer.write_all(&MAGIC)?;
        writer.write_all(&u64::from(self.version).to_le_bytes())?;
        layout.write_summary(writer, summary.as_ref())?;
        names.write(writer, self.compress_names)?;
        layout.write_small(writer, symbols.len() as u64, "function count")?;
        for func in symbols.iter() {
            layout.write_function(writer, func, &names)?;
        }
        Ok(())
    }
}

/// Maps every name in the profile to its index in the name table. Empty for layouts that store
/// names inline.
struct NameTable<'a> {
    layout: Layout,
    indices: BTreeMap<&'a str, u64>,
}

impl<'a> NameTable<'a> {
    fn new(layout: Layout, symbols: &'a SymbolMap) -> Self {
        let mut names = BTreeSet::new();
        if layout.names != NameEncoding::Inline {
            for func in symbols.iter() {
                collect_names(func, &mut names);
            }
        }
        let indices = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, i as u64))
            .collect();
        Self { layout, indices }
    }

    fn write(&self, writer: &mut impl Write, compress: bool) -> Result<(), ProfileError> {
        match self.layout.names {
            NameEncoding::Inline => Ok(()),
            NameEncoding::Table => {
                self.layout
                    .write_small(writer, self.indices.len() as u64, "name count")?;
                for name in self.indices.keys() {
                    self.layout
                        .write_small(writer, name.len() as u64, "name length")?;
                    writer.write_all(name.as_bytes())?;
                }
                Ok(())
            }
            NameEncoding::CompressibleTable => {
                let names = self.indices.keys().copied().collect::<Vec<_>>();
                write_string_list(writer, &names, compress)?;
                Ok(())
            }
        }
    }

    fn write_name(&self, writer: &mut impl Write, name: &str) -> Result<(), ProfileError> {
        match self.layout.names {
            NameEncoding::Inline => {
                self.layout
                    .write_small(writer, name.len() as u64, "name length")?;
                writer.write_all(name.as_bytes())?;
                Ok(())
            }
            NameEncoding::Table | NameEncoding::CompressibleTable => {
                let index = self.indices.get(name).copied().ok_or_else(|| {
                    // Every name is collected up front so this is a bug in the writer
                    ProfileError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} missing from name table", name),
                    ))
                })?;
                self.layout.write_small(writer, index, "name index")
            }
        }
    }
}

fn collect_names<'a>(func: &'a FunctionSamples, names: &mut BTreeSet<&'a str>) {
    names.insert(&func.name);
    names.insert(&func.dir_name);
    names.insert(&func.file_name);
    for pos in func.pos_counts.values() {
        names.extend(pos.targets.keys().map(String::as_str));
    }
    for callee in func.callsites.values() {
        collect_names(callee, names);
    }
}

impl Layout {
    fn write_small(
        &self,
        writer: &mut impl Write,
        value: u64,
        what: &'static str,
    ) -> Result<(), ProfileError> {
        match self.ints {
            IntEncoding::Narrow => {
                let value = u32::try_from(value).map_err(|_| ProfileError::TooLarge {
                    version: u64::from(self.version),
                    what,
                })?;
                writer.write_all(&value.to_le_bytes())?;
            }
            IntEncoding::Wide => writer.write_all(&value.to_le_bytes())?,
            IntEncoding::Leb128 => write_leb128(writer, value)?,
        }
        Ok(())
    }

    fn write_count(&self, writer: &mut impl Write, value: u64) -> Result<(), ProfileError> {
        match self.ints {
            IntEncoding::Narrow | IntEncoding::Wide => writer.write_all(&value.to_le_bytes())?,
            IntEncoding::Leb128 => write_leb128(writer, value)?,
        }
        Ok(())
    }

    fn write_summary(
        &self,
        writer: &mut impl Write,
        summary: Option<&ProfileSummary>,
    ) -> Result<(), ProfileError> {
        let summary = match summary {
            Some(s) => s,
            None => {
                writer.write_all(&[0])?;
                return Ok(());
            }
        };
        writer.write_all(&[1])?;
        self.write_count(writer, summary.total_count)?;
        self.write_count(writer, summary.max_count)?;
        self.write_count(writer, summary.max_function_count)?;
        self.write_small(writer, summary.num_counts, "number of counts")?;
        self.write_small(writer, summary.num_functions, "number of functions")?;
        self.write_small(
            writer,
            summary.detailed_summaries.len() as u64,
            "number of cutoffs",
        )?;
        for entry in &summary.detailed_summaries {
            self.write_small(writer, u64::from(entry.cutoff), "cutoff")?;
            self.write_count(writer, entry.min_count)?;
            self.write_small(writer, entry.num_counts, "cutoff count")?;
        }
        Ok(())
    }

    fn write_function(
        &self,
        writer: &mut impl Write,
        func: &FunctionSamples,
        names: &NameTable<'_>,
    ) -> Result<(), ProfileError> {
        names.write_name(writer, &func.name)?;
        names.write_name(writer, &func.dir_name)?;
        names.write_name(writer, &func.file_name)?;
        self.write_small(writer, u64::from(func.start_line), "start line")?;
        self.write_count(writer, func.head_count)?;

        self.write_small(writer, func.pos_counts.len() as u64, "location count")?;
        for (offset, pos) in &func.pos_counts {
            self.write_small(writer, u64::from(*offset), "offset")?;
            self.write_count(writer, pos.count)?;
            self.write_count(writer, pos.num_inst)?;
            self.write_small(writer, pos.targets.len() as u64, "target count")?;
            for (target, count) in &pos.targets {
                names.write_name(writer, target)?;
                self.write_count(writer, *count)?;
            }
        }

        self.write_small(writer, func.callsites.len() as u64, "callsite count")?;
        for (key, callee) in &func.callsites {
            self.write_small(writer, u64::from(key.offset), "offset")?;
            self.write_function(writer, callee, names)?;
        }
        Ok(())
    }
}
