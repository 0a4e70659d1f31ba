use crate::sample_profile::ParseResult;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use nom::error::{context, ContextError, ErrorKind, ParseError, VerboseError};
use nom::Err;
use std::convert::TryFrom;
use std::io::{self, Read, Write};

pub(crate) fn failure<'a, T>(
    input: &'a [u8],
    ctx: &'static str,
    kind: ErrorKind,
) -> ParseResult<'a, T> {
    let inner = VerboseError::from_error_kind(input, kind);
    Err(Err::Failure(VerboseError::add_context(input, ctx, inner)))
}

pub fn parse_leb128(input: &[u8]) -> ParseResult<'_, u64> {
    let mut bytes = input;
    match leb128::read::unsigned(&mut bytes) {
        Ok(x) => Ok((bytes, x)),
        Err(leb128::read::Error::Overflow) => {
            failure(input, "leb128 overflow", ErrorKind::TooLarge)
        }
        Err(leb128::read::Error::IoError(_)) => {
            failure(input, "truncated leb128", ErrorKind::Eof)
        }
    }
}

pub fn write_leb128(writer: &mut impl Write, value: u64) -> io::Result<()> {
    leb128::write::unsigned(writer, value).map(|_| ())
}

/// Converts a length read from the file into a `usize` making sure there's enough input left
/// to satisfy it.
pub fn checked_len(input: &[u8], len: u64) -> ParseResult<'_, usize> {
    match usize::try_from(len) {
        Ok(len) if len <= input.len() => Ok((input, len)),
        _ => failure(input, "length exceeds remaining input", ErrorKind::Eof),
    }
}

/// Reads `len` bytes as a UTF-8 string.
pub fn parse_string(input: &[u8], len: u64) -> ParseResult<'_, String> {
    let (input, len) = checked_len(input, len)?;
    match std::str::from_utf8(&input[..len]) {
        Ok(s) => Ok((&input[len..], s.to_string())),
        Err(_) => failure(input, "invalid utf-8 in name", ErrorKind::Char),
    }
}

/// Parses a string list prefixed by the number of strings, the uncompressed size and the
/// compressed size. If the compressed size is zero the payload is stored uncompressed otherwise
/// it's a zlib stream. The payload is a sequence of leb128 length prefixed strings.
pub fn parse_string_list(input: &[u8]) -> ParseResult<'_, Vec<String>> {
    let (input, list_length) = parse_leb128(input)?;
    let (input, uncompressed_size) = parse_leb128(input)?;
    let (input, compressed_size) = parse_leb128(input)?;

    let (input, payload_len) = if compressed_size == 0 {
        checked_len(input, uncompressed_size)?
    } else {
        checked_len(input, compressed_size)?
    };
    let payload = &input[..payload_len];
    let values = if compressed_size == 0 {
        context("string list", parse_uncompressed_list)(payload)?.1
    } else {
        // Never inflate past the declared size, one extra byte is enough to spot a liar
        let mut decoder = ZlibDecoder::new(payload).take(uncompressed_size.saturating_add(1));
        let mut output = Vec::with_capacity(uncompressed_size.min(1 << 20) as usize);
        if decoder.read_to_end(&mut output).is_err() || output.len() as u64 != uncompressed_size {
            return failure(input, "failed to decompress string list", ErrorKind::Verify);
        }
        match parse_uncompressed_list(&output) {
            Ok((_, v)) => v,
            // Errors point into the decompressed buffer so report the payload start instead
            Err(_) => {
                return failure(input, "malformed compressed string list", ErrorKind::Verify)
            }
        }
    };
    if values.len() as u64 != list_length {
        return failure(input, "string list length mismatch", ErrorKind::Count);
    }
    Ok((&input[payload_len..], values))
}

fn parse_uncompressed_list(mut input: &[u8]) -> ParseResult<'_, Vec<String>> {
    let mut res = vec![];
    while !input.is_empty() {
        let (bytes, len) = parse_leb128(input)?;
        let (bytes, string) = parse_string(bytes, len)?;
        res.push(string);
        input = bytes;
    }
    Ok((input, res))
}

/// Writes a string list in the format `parse_string_list` reads.
pub fn write_string_list(
    writer: &mut impl Write,
    names: &[&str],
    compress: bool,
) -> io::Result<()> {
    let mut payload = vec![];
    for name in names {
        write_leb128(&mut payload, name.len() as u64)?;
        payload.extend_from_slice(name.as_bytes());
    }
    write_leb128(writer, names.len() as u64)?;
    write_leb128(writer, payload.len() as u64)?;
    if compress && !payload.is_empty() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;
        write_leb128(writer, compressed.len() as u64)?;
        writer.write_all(&compressed)
    } else {
        write_leb128(writer, 0)?;
        writer.write_all(&payload)
    }
}
