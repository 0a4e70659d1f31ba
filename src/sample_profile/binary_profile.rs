use crate::sample_profile::types::*;
use crate::sample_profile::*;
use crate::summary::{DetailedSummary, ProfileSummary};
use crate::ProfileFormat;
use crate::util::{checked_len, failure, parse_leb128, parse_string, parse_string_list};
use nom::error::{context, ErrorKind};
use nom::number::complete::{le_u32, le_u64, le_u8};
use std::convert::TryFrom;
use std::fmt;
use std::io::Read;
use tracing::debug;

/// `\xffsprofs\x81`
pub const MAGIC: [u8; 8] = [0xff, b's', b'p', b'r', b'o', b'f', b's', 0x81];

/// The binary format versions this crate can read and write. Each version only changes how
/// values are encoded, every version carries the same information.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum FormatVersion {
    /// 32 bit lengths and offsets, 64 bit counts, names stored inline
    Fixed = 1,
    /// Everything 64 bit, names stored once in a name table
    Wide = 2,
    /// Everything LEB128, names in an optionally compressed name table
    Compact = 3,
}

impl FormatVersion {
    pub const LATEST: Self = Self::Compact;

    pub const fn all() -> [Self; 3] {
        [Self::Fixed, Self::Wide, Self::Compact]
    }

    /// How each kind of value is encoded in this version
    pub fn layout(self) -> Layout {
        match self {
            Self::Fixed => Layout {
                version: self,
                ints: IntEncoding::Narrow,
                names: NameEncoding::Inline,
            },
            Self::Wide => Layout {
                version: self,
                ints: IntEncoding::Wide,
                names: NameEncoding::Table,
            },
            Self::Compact => Layout {
                version: self,
                ints: IntEncoding::Leb128,
                names: NameEncoding::CompressibleTable,
            },
        }
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::LATEST
    }
}

impl TryFrom<u64> for FormatVersion {
    type Error = u64;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Fixed),
            2 => Ok(Self::Wide),
            3 => Ok(Self::Compact),
            e => Err(e),
        }
    }
}

impl From<FormatVersion> for u64 {
    fn from(v: FormatVersion) -> u64 {
        v as u64
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u64)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum IntEncoding {
    /// Lengths, offsets and cutoffs are little endian u32, counts little endian u64
    Narrow,
    /// Little endian u64 for every integer
    Wide,
    /// Unsigned LEB128 for every integer
    Leb128,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum NameEncoding {
    /// Length prefixed string wherever a name appears
    Inline,
    /// Names are indices into a table of length prefixed strings
    Table,
    /// Names are indices into a table which may be zlib compressed
    CompressibleTable,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Layout {
    pub version: FormatVersion,
    pub ints: IntEncoding,
    pub names: NameEncoding,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Header {
    pub version: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BinarySampleProf;

impl Layout {
    /// Lengths, line numbers, offsets and cutoffs.
    fn parse_small<'a>(&self, input: &'a [u8]) -> ParseResult<'a, u64> {
        match self.ints {
            IntEncoding::Narrow => le_u32(input).map(|(b, v)| (b, u64::from(v))),
            IntEncoding::Wide => le_u64(input),
            IntEncoding::Leb128 => parse_leb128(input),
        }
    }

    fn parse_u32<'a>(&self, input: &'a [u8]) -> ParseResult<'a, u32> {
        let (bytes, value) = self.parse_small(input)?;
        match u32::try_from(value) {
            Ok(v) => Ok((bytes, v)),
            Err(_) => failure(input, "value exceeds 32 bits", ErrorKind::TooLarge),
        }
    }

    /// Sample and entry counts.
    fn parse_count<'a>(&self, input: &'a [u8]) -> ParseResult<'a, u64> {
        match self.ints {
            IntEncoding::Narrow | IntEncoding::Wide => le_u64(input),
            IntEncoding::Leb128 => parse_leb128(input),
        }
    }

    fn parse_name_table<'a>(&self, input: &'a [u8]) -> ParseResult<'a, Vec<String>> {
        match self.names {
            NameEncoding::Inline => Ok((input, vec![])),
            NameEncoding::Table => {
                let (mut input, len) = self.parse_small(input)?;
                // Every entry takes at least its length prefix
                let (_, len) = checked_len(input, len)?;
                let mut names = Vec::with_capacity(len);
                for _ in 0..len {
                    let (bytes, name_len) = self.parse_small(input)?;
                    let (bytes, name) = parse_string(bytes, name_len)?;
                    names.push(name);
                    input = bytes;
                }
                Ok((input, names))
            }
            NameEncoding::CompressibleTable => parse_string_list(input),
        }
    }

    fn parse_name<'a>(&self, input: &'a [u8], table: &[String]) -> ParseResult<'a, String> {
        match self.names {
            NameEncoding::Inline => {
                let (bytes, len) = self.parse_small(input)?;
                parse_string(bytes, len)
            }
            NameEncoding::Table | NameEncoding::CompressibleTable => {
                let (bytes, index) = self.parse_small(input)?;
                match usize::try_from(index).ok().and_then(|i| table.get(i)) {
                    Some(name) => Ok((bytes, name.clone())),
                    None => failure(input, "name index out of range", ErrorKind::MapOpt),
                }
            }
        }
    }

    fn parse_summary<'a>(&self, input: &'a [u8]) -> ParseResult<'a, Option<ProfileSummary>> {
        let (input, present) = le_u8(input)?;
        match present {
            0 => return Ok((input, None)),
            1 => {}
            _ => return failure(input, "invalid summary flag", ErrorKind::Tag),
        }
        let (input, total_count) = self.parse_count(input)?;
        let (input, max_count) = self.parse_count(input)?;
        let (input, max_function_count) = self.parse_count(input)?;
        let (input, num_counts) = self.parse_small(input)?;
        let (input, num_functions) = self.parse_small(input)?;
        let (mut input, num_detailed) = self.parse_small(input)?;
        let (_, num_detailed) = checked_len(input, num_detailed)?;
        let mut detailed_summaries = Vec::with_capacity(num_detailed);
        for _ in 0..num_detailed {
            let (bytes, cutoff) = self.parse_u32(input)?;
            let (bytes, min_count) = self.parse_count(bytes)?;
            let (bytes, entry_counts) = self.parse_small(bytes)?;
            detailed_summaries.push(DetailedSummary {
                cutoff,
                min_count,
                num_counts: entry_counts,
            });
            input = bytes;
        }
        let summary = ProfileSummary {
            total_count,
            max_count,
            max_function_count,
            num_counts,
            num_functions,
            detailed_summaries,
        };
        debug!("Read summary {:?}", summary);
        Ok((input, Some(summary)))
    }

    fn parse_function<'a>(
        &self,
        input: &'a [u8],
        names: &[String],
        depth: usize,
    ) -> ParseResult<'a, FunctionSamples> {
        if depth > MAX_INLINE_DEPTH {
            return failure(input, "inline depth exceeded", ErrorKind::TooLarge);
        }
        let (input, name) = self.parse_name(input, names)?;
        let (input, dir_name) = self.parse_name(input, names)?;
        let (input, file_name) = self.parse_name(input, names)?;
        let (input, start_line) = self.parse_u32(input)?;
        let (input, head_count) = self.parse_count(input)?;
        let mut func = FunctionSamples {
            name,
            dir_name,
            file_name,
            start_line,
            head_count,
            ..Default::default()
        };

        let (mut input, num_pos) = self.parse_small(input)?;
        for _ in 0..num_pos {
            let (bytes, offset) = self.parse_u32(input)?;
            let (bytes, count) = self.parse_count(bytes)?;
            let (bytes, num_inst) = self.parse_count(bytes)?;
            let (mut bytes, num_targets) = self.parse_small(bytes)?;
            let mut pos = PositionCount {
                count,
                num_inst,
                ..Default::default()
            };
            for _ in 0..num_targets {
                let (b, target) = self.parse_name(bytes, names)?;
                let (b, target_count) = self.parse_count(b)?;
                if pos.targets.insert(target, target_count).is_some() {
                    return failure(bytes, "duplicate call target", ErrorKind::Verify);
                }
                bytes = b;
            }
            if func.pos_counts.insert(offset, pos).is_some() {
                return failure(input, "duplicate location", ErrorKind::Verify);
            }
            input = bytes;
        }

        let (mut input, num_callsites) = self.parse_small(input)?;
        for _ in 0..num_callsites {
            let (bytes, offset) = self.parse_u32(input)?;
            let (bytes, callee) = self.parse_function(bytes, names, depth + 1)?;
            let key = CallsiteKey::new(offset, callee.name.clone());
            if func.callsites.insert(key, callee).is_some() {
                return failure(input, "duplicate callsite", ErrorKind::Verify);
            }
            input = bytes;
        }
        Ok((input, func))
    }

    /// Everything after the version number.
    pub(crate) fn parse_body<'a>(&self, input: &'a [u8]) -> ParseResult<'a, SampleProfile> {
        let (input, summary) = context("summary section", |i| self.parse_summary(i))(input)?;
        let (input, names) = context("name table", |i| self.parse_name_table(i))(input)?;
        let (mut input, num_functions) = self.parse_small(input)?;
        let mut symbols = SymbolMap::new();
        for _ in 0..num_functions {
            let (bytes, func) =
                context("function", |i| self.parse_function(i, &names, 0))(input)?;
            debug!("Parsed function {}", func.name);
            if symbols.contains(&func.name) {
                return failure(input, "duplicate function", ErrorKind::Verify);
            }
            symbols.insert(func);
            input = bytes;
        }
        if !input.is_empty() {
            return failure(input, "trailing data after profile", ErrorKind::Eof);
        }
        let profile = SampleProfile {
            format: Some(ProfileFormat::Binary),
            version: Some(u64::from(self.version)),
            symbols,
            summary,
        };
        Ok((input, profile))
    }
}

impl BinarySampleProf {
    /// Decodes a binary profile reporting unsupported versions as their own error rather than
    /// a generic parse failure.
    pub fn read(data: &[u8]) -> Result<SampleProfile, ProfileError> {
        let (bytes, header) =
            Self::parse_header(data).map_err(|e| ProfileError::from_nom(data, e))?;
        let version = FormatVersion::try_from(header.version)
            .map_err(ProfileError::UnsupportedVersion)?;
        debug!("Reading version {} binary profile", version);
        version
            .layout()
            .parse_body(bytes)
            .map(|(_, profile)| profile)
            .map_err(|e| ProfileError::from_nom(data, e))
    }
}

impl SampleProfReader for BinarySampleProf {
    type Header = Header;

    fn parse_bytes(input: &[u8]) -> ParseResult<SampleProfile> {
        let (bytes, header) = Self::parse_header(input)?;
        match FormatVersion::try_from(header.version) {
            Ok(version) => version.layout().parse_body(bytes),
            Err(_) => failure(input, "unsupported version", ErrorKind::Tag),
        }
    }

    fn parse_header(input: &[u8]) -> ParseResult<Self::Header> {
        if !Self::has_format(input) {
            return failure(input, "bad magic", ErrorKind::Tag);
        }
        let (bytes, version) = le_u64(&input[MAGIC.len()..])?;
        Ok((bytes, Header { version }))
    }

    fn has_format(mut input: impl Read) -> bool {
        let mut buffer: [u8; 8] = [0; 8];
        if input.read_exact(&mut buffer).is_ok() {
            buffer == MAGIC
        } else {
            false
        }
    }
}
