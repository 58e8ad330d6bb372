//! Streaming validation and rule counting for filter lists.
//!
//! Filter data is checked and copied in a single forward pass: every chunk is
//! tested for non-printable bytes, the first 4 KiB are sniffed for HTML, rule
//! lines are counted, and the accepted bytes are written to the staging file.
//! The payload is never held in memory as a whole.

use std::io::{self, Read, Write};

use crate::error::{Error, Result};

/// Read buffer size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Number of leading bytes inspected for HTML markers.
const SNIFF_LEN: usize = 4 * 1024;

/// Validate `reader`, copy it verbatim into `out` and return the rule count.
///
/// Fails with [`Error::NonPrintable`] if any chunk contains control or binary
/// bytes, and with [`Error::HtmlContent`] if the first 4 KiB look like a web
/// page. On failure `out` may hold a partial copy; the caller owns its cleanup.
pub fn write_filter<R: Read, W: Write>(mut reader: R, mut out: W) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sniff: Option<Vec<u8>> = Some(Vec::with_capacity(SNIFF_LEN));
    let mut counter = RuleCounter::default();
    let mut total = 0usize;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        let chunk = &buf[..n];
        let eof = n == 0;

        if !is_printable(chunk) {
            return Err(Error::NonPrintable);
        }

        if let Some(prefix) = sniff.as_mut() {
            let take = n.min(SNIFF_LEN - prefix.len());
            prefix.extend_from_slice(&chunk[..take]);
            if prefix.len() == SNIFF_LEN || eof {
                if is_html(prefix) {
                    return Err(Error::HtmlContent);
                }
                sniff = None;
            }
        }

        if eof {
            break;
        }

        out.write_all(chunk)?;
        counter.feed(chunk);
        total += n;
    }
    out.flush()?;

    let rules = counter.finish();
    log::debug!("Validated filter data: {} bytes, {} rules", total, rules);
    Ok(rules)
}

/// Count rule lines of already stored filter data, without validating it.
pub fn count_rules<R: Read>(mut reader: R) -> Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut counter = RuleCounter::default();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => counter.feed(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(counter.finish())
}

/// Printable text: anything from space upwards except DEL, plus CR, LF and TAB.
///
/// Bytes above 0x7F are allowed so UTF-8 encoded comments pass.
pub fn is_printable(data: &[u8]) -> bool {
    data.iter()
        .all(|&c| (c >= b' ' && c != 0x7f) || c == b'\n' || c == b'\r' || c == b'\t')
}

/// Case-insensitive search for `<html` or `<!doctype`.
pub fn is_html(data: &[u8]) -> bool {
    contains_ignore_case(data, b"<html") || contains_ignore_case(data, b"<!doctype")
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Incremental line counter that tolerates lines split across chunks.
#[derive(Debug, Default)]
struct RuleCounter {
    /// Tail of the previous chunk with no line break yet
    partial: Vec<u8>,
    rules: u64,
}

impl RuleCounter {
    fn feed(&mut self, mut chunk: &[u8]) {
        while let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            if self.partial.is_empty() {
                self.count_line(&chunk[..pos]);
            } else {
                self.partial.extend_from_slice(&chunk[..pos]);
                let line = std::mem::take(&mut self.partial);
                self.count_line(&line);
            }
            chunk = &chunk[pos + 1..];
        }
        self.partial.extend_from_slice(chunk);
    }

    fn finish(mut self) -> u64 {
        let line = std::mem::take(&mut self.partial);
        self.count_line(&line);
        self.rules
    }

    fn count_line(&mut self, line: &[u8]) {
        if is_rule(line) {
            self.rules += 1;
        }
    }
}

/// Non-blank lines that don't start with `#` or `!` are rules. Blank means
/// Unicode whitespace only, so a line of no-break spaces is not a rule.
fn is_rule(line: &[u8]) -> bool {
    let line = String::from_utf8_lossy(line);
    match line.trim().chars().next() {
        None | Some('#') | Some('!') => false,
        Some(_) => true,
    }
}
