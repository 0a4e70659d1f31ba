//! A line oriented text rendition of a sample profile. Each function starts with an unindented
//! `name:total:head` line followed by its body indented beneath it:
//!
//! ```text
//! foo:750:200
//!  55: 450
//!  50: bar:300
//!   25: baz:300
//!    20: qux:300
//!     10: 300
//!    30: 0
//! ```
//!
//! Body lines are either `OFFSET[.DISCRIMINATOR]: COUNT [TARGET:COUNT]...` for samples or
//! `OFFSET[.DISCRIMINATOR]: CALLEE:TOTAL` for an inlined callsite whose body follows with a
//! deeper indent. Totals are informational and ignored on read. Source file information isn't
//! represented in this format.
use crate::sample_profile::types::*;
use crate::sample_profile::*;
use crate::util::failure;
use crate::ProfileFormat;
use nom::bytes::complete::tag;
use nom::character::complete::{digit1, space1};
use nom::combinator::{eof, map_res, opt};
use nom::error::{ContextError, ErrorKind, ParseError, VerboseError};
use nom::sequence::{preceded, terminated, tuple};
use std::fmt;
use std::io::{self, Read, Write};
use tracing::debug;

#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TextSampleProf;

/// Text profiles have no header, only leading comments which are skipped.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Header;

type LineResult<'a, T> = Result<T, nom::Err<VerboseError<&'a [u8]>>>;

fn line_failure<'a, T>(line: &'a [u8], ctx: &'static str, kind: ErrorKind) -> LineResult<'a, T> {
    let inner = VerboseError::from_error_kind(line, kind);
    Err(nom::Err::Failure(VerboseError::add_context(line, ctx, inner)))
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Line<'a> {
    indent: usize,
    content: &'a [u8],
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum BodyLine {
    Samples {
        offset: u32,
        count: u64,
        targets: Vec<(String, u64)>,
    },
    Callsite {
        offset: u32,
        callee: String,
    },
}

fn is_comment_or_blank(content: &[u8]) -> bool {
    content.is_empty() || content[0] == b'#'
}

/// Splits the input into lines dropping blank lines and comments.
fn content_lines(input: &[u8]) -> Vec<Line<'_>> {
    input
        .split(|c| *c == b'\n')
        .filter_map(|line| {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let indent = line
                .iter()
                .take_while(|c| **c == b' ' || **c == b'\t')
                .count();
            let content = &line[indent..];
            if is_comment_or_blank(content) {
                None
            } else {
                Some(Line { indent, content })
            }
        })
        .collect()
}

fn str_to_digit(bytes: &[u8]) -> Result<u64, std::num::ParseIntError> {
    // Only called on runs of ascii digits
    std::str::from_utf8(bytes).unwrap_or_default().parse()
}

fn read_decimal(s: &[u8]) -> ParseResult<'_, u64> {
    map_res(digit1, str_to_digit)(s)
}

fn read_u16(s: &[u8]) -> ParseResult<'_, u32> {
    let (bytes, value) = read_decimal(s)?;
    if value > 0xffff {
        failure(s, "value exceeds 16 bits", ErrorKind::TooLarge)
    } else {
        Ok((bytes, value as u32))
    }
}

/// `LINE[.DISCRIMINATOR]:`
fn read_location(s: &[u8]) -> ParseResult<'_, u32> {
    tuple((read_u16, opt(preceded(tag(b"."), read_u16)), tag(b":")))(s)
        .map(|(b, (line, disc, _))| (b, join_offset(line, disc.unwrap_or_default())))
}

/// Splits `name:count` at the last colon so names may contain colons themselves.
fn read_name_count(s: &[u8]) -> ParseResult<'_, (String, u64)> {
    let split = match s.iter().rposition(|c| *c == b':') {
        Some(i) => i,
        None => return failure(s, "expected name:count", ErrorKind::Char),
    };
    let name = match std::str::from_utf8(&s[..split]) {
        Ok(n) => n.to_string(),
        Err(_) => return failure(s, "invalid utf-8 in name", ErrorKind::Char),
    };
    let (bytes, count) = terminated(read_decimal, eof)(&s[split + 1..])?;
    Ok((bytes, (name, count)))
}

fn read_function_header(s: &[u8]) -> ParseResult<'_, (String, u64, u64)> {
    let split = match s.iter().rposition(|c| *c == b':') {
        Some(i) => i,
        None => return failure(s, "expected name:total:head", ErrorKind::Char),
    };
    let (_, head) = terminated(read_decimal, eof)(&s[split + 1..])?;
    let (bytes, (name, total)) = read_name_count(&s[..split])?;
    Ok((bytes, (name, total, head)))
}

fn read_body_line(s: &[u8]) -> ParseResult<'_, BodyLine> {
    let (rest, (offset, _)) = tuple((read_location, space1))(s)?;
    if let Ok((bytes, count)) = terminated(read_decimal, eof)(rest) {
        let line = BodyLine::Samples {
            offset,
            count,
            targets: vec![],
        };
        return Ok((bytes, line));
    }
    if let Ok((targets, (count, _))) = tuple((read_decimal, space1))(rest) {
        let targets = targets
            .split(|c| *c == b' ' || *c == b'\t')
            .filter(|x| !x.is_empty())
            .map(|x| read_name_count(x).map(|(_, v)| v))
            .collect::<Result<Vec<_>, _>>()?;
        let line = BodyLine::Samples {
            offset,
            count,
            targets,
        };
        return Ok((&rest[rest.len()..], line));
    }
    let (bytes, (callee, _total)) = read_name_count(rest)?;
    Ok((bytes, BodyLine::Callsite { offset, callee }))
}

/// Parses the lines belonging to `node` returning the index of the first line after them.
fn parse_body<'a>(
    lines: &[Line<'a>],
    mut idx: usize,
    parent_indent: usize,
    node: &mut FunctionSamples,
    depth: usize,
) -> LineResult<'a, usize> {
    let mut body_indent = None;
    while let Some(line) = lines.get(idx) {
        if line.indent <= parent_indent {
            break;
        }
        let indent = *body_indent.get_or_insert(line.indent);
        if line.indent != indent {
            return line_failure(line.content, "inconsistent indentation", ErrorKind::Space);
        }
        idx += 1;
        match read_body_line(line.content)?.1 {
            BodyLine::Samples {
                offset,
                count,
                targets,
            } => {
                let pos = PositionCount {
                    count,
                    num_inst: 1,
                    targets: targets.into_iter().collect(),
                };
                if node.pos_counts.insert(offset, pos).is_some() {
                    return line_failure(line.content, "duplicate location", ErrorKind::Verify);
                }
            }
            BodyLine::Callsite { offset, callee } => {
                if depth >= MAX_INLINE_DEPTH {
                    let kind = ErrorKind::TooLarge;
                    return line_failure(line.content, "inline depth exceeded", kind);
                }
                let mut child = FunctionSamples::new(callee.clone());
                idx = parse_body(lines, idx, indent, &mut child, depth + 1)?;
                let key = CallsiteKey::new(offset, callee);
                if node.callsites.insert(key, child).is_some() {
                    return line_failure(line.content, "duplicate callsite", ErrorKind::Verify);
                }
            }
        }
    }
    Ok(idx)
}

impl SampleProfReader for TextSampleProf {
    type Header = Header;

    fn parse_bytes(input: &[u8]) -> ParseResult<SampleProfile> {
        let (input, _header) = Self::parse_header(input)?;
        let lines = content_lines(input);
        let mut symbols = SymbolMap::new();
        let mut idx = 0;
        while let Some(line) = lines.get(idx) {
            if line.indent != 0 {
                return failure(line.content, "expected a function", ErrorKind::Space);
            }
            let (_, (name, total, head)) = read_function_header(line.content)?;
            let mut func = FunctionSamples::new(name);
            func.head_count = head;
            idx = parse_body(&lines, idx + 1, 0, &mut func, 0)?;
            if func.total_count() != total {
                debug!(
                    "{} has a total of {} but its samples add up to {}",
                    func.name,
                    total,
                    func.total_count()
                );
            }
            if symbols.contains(&func.name) {
                return failure(line.content, "duplicate function", ErrorKind::Verify);
            }
            symbols.insert(func);
        }
        let profile = SampleProfile {
            format: Some(ProfileFormat::Text),
            version: None,
            symbols,
            summary: None,
        };
        Ok((&input[input.len()..], profile))
    }

    fn parse_header(mut input: &[u8]) -> ParseResult<Self::Header> {
        loop {
            let end = input
                .iter()
                .position(|c| *c == b'\n')
                .map(|i| i + 1)
                .unwrap_or_else(|| input.len());
            let line = &input[..end];
            let content = line
                .iter()
                .position(|c| !c.is_ascii_whitespace())
                .map(|i| &line[i..])
                .unwrap_or_default();
            if end == 0 || !is_comment_or_blank(content) {
                return Ok((input, Header));
            }
            input = &input[end..];
        }
    }

    fn has_format(mut input: impl Read) -> bool {
        let mut s = String::new();
        input.read_to_string(&mut s).is_ok() && !s.is_empty()
    }
}

struct Location(u32);

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match split_offset(self.0) {
            (line, 0) => write!(f, "{}", line),
            (line, disc) => write!(f, "{}.{}", line, disc),
        }
    }
}

/// Writes profiles in the text format. There's no summary section so only the symbols are
/// written.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub struct TextProfWriter;

impl TextProfWriter {
    pub fn new() -> Self {
        Default::default()
    }
}

fn write_body(writer: &mut impl Write, func: &FunctionSamples, depth: usize) -> io::Result<()> {
    let indent = " ".repeat(depth);
    for (offset, pos) in &func.pos_counts {
        write!(writer, "{}{}: {}", indent, Location(*offset), pos.count)?;
        for (target, count) in &pos.targets {
            write!(writer, " {}:{}", target, count)?;
        }
        writeln!(writer)?;
    }
    for (key, callee) in &func.callsites {
        writeln!(
            writer,
            "{}{}: {}:{}",
            indent,
            Location(key.offset),
            key.callee,
            callee.total_count()
        )?;
        write_body(writer, callee, depth + 1)?;
    }
    Ok(())
}

impl SampleProfWriter for TextProfWriter {
    fn write(&self, symbols: &SymbolMap, writer: &mut impl Write) -> Result<(), ProfileError> {
        check_inline_depth(symbols)?;
        for func in symbols.iter() {
            writeln!(
                writer,
                "{}:{}:{}",
                func.name,
                func.total_count(),
                func.head_count
            )?;
            write_body(writer, func, 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FOO: &str = "# A comment\n\nfoo:750:200\n 55: 450\n 50: bar:300\n  25: baz:300\n   20: qux:300\n    10: 300\n   30: 0\n";

    #[test]
    fn parse_nested() {
        let (_, profile) = TextSampleProf::parse_bytes(FOO.as_bytes()).unwrap();
        assert_eq!(profile.format, Some(ProfileFormat::Text));
        assert_eq!(profile.summary, None);
        let foo = profile.symbols.get("foo").unwrap();
        assert_eq!(foo.head_count, 200);
        assert_eq!(foo.total_count(), 750);
        assert_eq!(foo.pos_counts[&(55 << 16)].count, 450);
        let baz = foo
            .callsite(50 << 16, "bar")
            .and_then(|x| x.callsite(25 << 16, "baz"))
            .unwrap();
        assert_eq!(baz.pos_counts[&(30 << 16)].count, 0);
        let qux = baz.callsite(20 << 16, "qux").unwrap();
        assert_eq!(qux.pos_counts[&(10 << 16)].count, 300);
    }

    #[test]
    fn write_then_read() {
        let (_, profile) = TextSampleProf::parse_bytes(FOO.as_bytes()).unwrap();
        let mut buffer = vec![];
        TextProfWriter::new()
            .write(&profile.symbols, &mut buffer)
            .unwrap();
        let expected = "foo:750:200\n 55: 450\n 50: bar:300\n  25: baz:300\n   30: 0\n   20: qux:300\n    10: 300\n";
        assert_eq!(String::from_utf8_lossy(&buffer), expected);
        let (_, reread) = TextSampleProf::parse_bytes(&buffer).unwrap();
        assert_eq!(reread.symbols, profile.symbols);
    }

    #[test]
    fn discriminators_and_targets() {
        let text = "main:30:1\n 3.2: 10 foo:4 ns::bar:6\n 4: 20\n";
        let (_, profile) = TextSampleProf::parse_bytes(text.as_bytes()).unwrap();
        let main = profile.symbols.get("main").unwrap();
        let pos = &main.pos_counts[&join_offset(3, 2)];
        assert_eq!(pos.count, 10);
        assert_eq!(pos.targets["foo"], 4);
        assert_eq!(pos.targets["ns::bar"], 6);

        let mut buffer = vec![];
        TextProfWriter::new()
            .write(&profile.symbols, &mut buffer)
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&buffer), text);
    }

    #[test]
    fn names_with_colons() {
        let text = "ns::foo:5:2\n 1: ns::bar:5\n  2: 5\n";
        let (_, profile) = TextSampleProf::parse_bytes(text.as_bytes()).unwrap();
        let foo = profile.symbols.get("ns::foo").unwrap();
        assert_eq!(foo.head_count, 2);
        assert!(foo.callsite(1 << 16, "ns::bar").is_some());
    }

    #[test]
    fn header_skips_comments() {
        let (rest, _) = TextSampleProf::parse_header(b"# one\n  \n# two\nfoo:0:0\n").unwrap();
        assert_eq!(rest, b"foo:0:0\n");
        let (rest, _) = TextSampleProf::parse_header(b"# only comments").unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn malformed() {
        let bad = [
            " 1: 10\n",
            "foo:1\n",
            "foo:1:1\n 1: 10\n  2: 10\n",
            "foo:1:1\n   1: 10\n  2: 10\n",
            "foo:1:1\n 1: 10\n 1: 11\n",
            "foo:1:1\nfoo:1:1\n",
            "foo:1:1\n 70000: 1\n",
            "foo:1:1\n x: 1\n",
        ];
        for input in bad.iter() {
            let res = TextSampleProf::parse_bytes(input.as_bytes());
            assert!(res.is_err(), "Parsed {:?}: {:?}", input, res);
        }
    }

    fn nested_text(levels: usize) -> String {
        let mut text = "f:1:0\n".to_string();
        for level in 1..=levels {
            text.push_str(&" ".repeat(level));
            text.push_str("1: g:1\n");
        }
        text.push_str(&" ".repeat(levels + 1));
        text.push_str("2: 1\n");
        text
    }

    #[test]
    fn inline_depth_limit() {
        let text = nested_text(MAX_INLINE_DEPTH);
        let (_, profile) = TextSampleProf::parse_bytes(text.as_bytes()).unwrap();
        let func = profile.symbols.get("f").unwrap();
        assert_eq!(func.inline_depth(), MAX_INLINE_DEPTH);
        assert_eq!(func.total_count(), 1);

        let text = nested_text(MAX_INLINE_DEPTH + 1);
        assert!(TextSampleProf::parse_bytes(text.as_bytes()).is_err());
    }
}
