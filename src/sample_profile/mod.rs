use crate::sample_profile::binary_profile::*;
use crate::sample_profile::text_profile::*;
use crate::sample_profile::types::*;
use crate::summary::{ProfileSummary, SummaryError, DEFAULT_CUTOFFS};
use crate::ProfileFormat;
use nom::error::{VerboseError, VerboseErrorKind};
use nom::IResult;
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufWriter};
use std::io::prelude::*;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

pub mod binary_profile;
pub mod binary_writer;
pub mod text_profile;
pub mod types;

pub type ParseResult<'a, T> = IResult<&'a [u8], T, VerboseError<&'a [u8]>>;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Unsupported sample profile format")]
    UnrecognizedFormat,
    #[error("Unsupported binary profile version {0}")]
    UnsupportedVersion(u64),
    #[error("Malformed profile: {0}")]
    Malformed(String),
    #[error("{what} doesn't fit in a version {version} profile")]
    TooLarge { version: u64, what: &'static str },
    #[error("{name} has inlined callees {depth} deep which is more than the readers accept")]
    TooDeep { name: String, depth: usize },
    #[error(transparent)]
    Summary(#[from] SummaryError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProfileError {
    /// Flattens a nom error into something that doesn't borrow the input, recording where in
    /// `data` each step of the error occurred.
    pub(crate) fn from_nom(data: &[u8], err: nom::Err<VerboseError<&[u8]>>) -> Self {
        let message = match err {
            nom::Err::Incomplete(_) => "unexpected end of input".to_string(),
            nom::Err::Error(e) | nom::Err::Failure(e) => e
                .errors
                .iter()
                .map(|(input, kind)| {
                    // Text parsers work on single lines so position by address not length
                    let start = data.as_ptr() as usize;
                    let offset = match (input.as_ptr() as usize).checked_sub(start) {
                        Some(o) if o <= data.len() => o,
                        _ => data.len().saturating_sub(input.len()),
                    };
                    match kind {
                        VerboseErrorKind::Context(ctx) => format!("{} at byte {}", ctx, offset),
                        VerboseErrorKind::Char(c) => {
                            format!("expected '{}' at byte {}", c, offset)
                        }
                        VerboseErrorKind::Nom(kind) => format!("{:?} at byte {}", kind, offset),
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
        };
        Self::Malformed(message)
    }
}

/// Fails if any function inlines deeper than the readers accept.
pub(crate) fn check_inline_depth(symbols: &SymbolMap) -> Result<(), ProfileError> {
    for func in symbols.iter() {
        let depth = func.inline_depth();
        if depth > MAX_INLINE_DEPTH {
            return Err(ProfileError::TooDeep {
                name: func.name.clone(),
                depth,
            });
        }
    }
    Ok(())
}

/// A decoded profile. The summary is only present if the file carried one, it's never
/// recomputed on read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SampleProfile {
    pub format: Option<ProfileFormat>,
    pub version: Option<u64>,
    pub symbols: SymbolMap,
    pub summary: Option<ProfileSummary>,
}

impl SampleProfile {
    /// The persisted summary if there is one, otherwise one computed from the symbols with the
    /// default cutoffs.
    pub fn summary_or_compute(&self) -> Result<Cow<'_, ProfileSummary>, SummaryError> {
        match self.summary.as_ref() {
            Some(s) => Ok(Cow::Borrowed(s)),
            None => ProfileSummary::compute(&self.symbols, &DEFAULT_CUTOFFS).map(Cow::Owned),
        }
    }
}

pub fn parse(filename: impl AsRef<Path>) -> Result<SampleProfile, ProfileError> {
    let mut buffer = Vec::new();
    let mut f = File::open(filename)?;
    f.read_to_end(&mut buffer)?;
    parse_bytes(buffer.as_slice())
}

pub fn parse_bytes(data: &[u8]) -> Result<SampleProfile, ProfileError> {
    if BinarySampleProf::has_format(data) {
        BinarySampleProf::read(data)
    } else if TextSampleProf::has_format(data) {
        TextSampleProf::parse_bytes(data)
            .map(|(_bytes, res)| res)
            .map_err(|e| ProfileError::from_nom(data, e))
    } else {
        Err(ProfileError::UnrecognizedFormat)
    }
}

pub trait SampleProfReader {
    type Header;
    /// Parse the whole profile
    fn parse_bytes(input: &[u8]) -> ParseResult<SampleProfile>;
    /// Parses a header
    fn parse_header(input: &[u8]) -> ParseResult<Self::Header>;
    /// Detects that the bytes match the current reader format if it can't read the format it will
    /// return false
    fn has_format(input: impl Read) -> bool;
}

pub trait SampleProfWriter {
    fn write(&self, symbols: &SymbolMap, writer: &mut impl Write) -> Result<(), ProfileError>;

    /// Writes the profile to `path`. The data goes to a temporary file in the same directory
    /// which is only renamed over `path` once everything has been written.
    fn write_to_file(
        &self,
        symbols: &SymbolMap,
        path: impl AsRef<Path>,
    ) -> Result<(), ProfileError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(file.as_file_mut());
            self.write(symbols, &mut writer)?;
            writer.flush()?;
        }
        file.persist(path).map_err(|e| e.error)?;
        debug!("Wrote profile to {}", path.display());
        Ok(())
    }
}

/// Reads profiles into an existing `SymbolMap`. The persisted summary is kept as it was in the
/// file and is available through `summary_information`.
#[derive(Debug)]
pub struct ProfileReader<'a> {
    symbols: &'a mut SymbolMap,
    force_update: bool,
    version: Option<u64>,
    summary: Option<ProfileSummary>,
}

impl<'a> ProfileReader<'a> {
    /// When `force_update` is set functions in the profile replace functions of the same name
    /// already in `symbols`, otherwise the existing functions are kept.
    pub fn new(symbols: &'a mut SymbolMap, force_update: bool) -> Self {
        Self {
            symbols,
            force_update,
            version: None,
            summary: None,
        }
    }

    pub fn read_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), ProfileError> {
        let data = std::fs::read(path)?;
        self.read_bytes(&data)
    }

    /// Nothing is added to the symbol map unless the whole profile decodes. The version and
    /// summary of any earlier read are cleared either way.
    pub fn read_bytes(&mut self, data: &[u8]) -> Result<(), ProfileError> {
        self.version = None;
        self.summary = None;
        let profile = parse_bytes(data)?;
        for func in profile.symbols.iter() {
            if self.symbols.contains(&func.name) && !self.force_update {
                warn!("Keeping existing samples for {}", func.name);
                continue;
            }
            self.symbols.insert(func.clone());
        }
        self.version = profile.version;
        self.summary = profile.summary;
        Ok(())
    }

    pub fn version(&self) -> Option<u64> {
        self.version
    }

    /// The summary stored in the last profile read, `None` if nothing has been read or the
    /// profile had no summary.
    pub fn summary_information(&self) -> Option<&ProfileSummary> {
        self.summary.as_ref()
    }
}
