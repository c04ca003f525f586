/*!
Scanning of header blocks, both from clients and from CGI programs.

Lines are accumulated into an owned buffer with explicit size checks; once
the blank terminator line arrives the whole block is tokenized by `httparse`.
*/
use std::fmt;

use httparse::{parse_headers, Status, EMPTY_HEADER};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanError {
    /// A single line ran past `Limits::max_line` without a newline.
    HeaderTooLarge,
    /// More than `Limits::max_fields` fields.
    TooManyHeaders,
    /// The whole block ran past `Limits::max_block`.
    HeaderBlockTooLarge,
    /// A non-blank line without a `name: value` shape.
    Malformed,
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanError::HeaderTooLarge => "header line too large",
            ScanError::TooManyHeaders => "too many header fields",
            ScanError::HeaderBlockTooLarge => "header block too large",
            ScanError::Malformed => "malformed header line",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ScanError {}

#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_line: usize,
    pub max_fields: usize,
    pub max_block: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_line: 8192,
            max_fields: 64,
            max_block: 16384,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: Vec<u8>,
}

impl Field {
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// What a line read from a stream turned out to be.
#[derive(Debug, Eq, PartialEq)]
pub enum Line {
    /// A complete line, terminator included.
    Full(usize),
    /// End of stream before any byte of the line.
    Eof,
    /// End of stream partway through the line.
    Truncated,
}

/**
Read one `\n`-terminated line into `buf`, reading at most `max` bytes.

Returns `Err(ScanError::HeaderTooLarge)` if `max` bytes go by without a
newline. I/O errors are reported separately through the outer `Result`.
*/
pub async fn read_line_bounded<R>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<Result<Line, ScanError>>
where
    R: AsyncBufRead + Unpin,
{
    let start = buf.len();
    let n = (&mut *r).take(max as u64).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(Ok(Line::Eof));
    }
    if buf.last() == Some(&b'\n') {
        return Ok(Ok(Line::Full(buf.len() - start)));
    }
    if n >= max {
        Ok(Err(ScanError::HeaderTooLarge))
    } else {
        Ok(Ok(Line::Truncated))
    }
}

/// True for a line holding nothing but its terminator.
pub fn is_blank(line: &[u8]) -> bool {
    matches!(line, b"\n" | b"\r\n")
}

/**
Returns the index just past the blank line ending the header block at the
start of `buf`, if the block is complete. Accepts `\n` and `\r\n` endings,
mixed freely.
*/
pub fn find_block_end(buf: &[u8]) -> Option<usize> {
    let mut line_start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b == b'\n' {
            if is_blank(&buf[line_start..=i]) {
                return Some(i + 1);
            }
            line_start = i + 1;
        }
    }
    None
}

/**
Accumulates header lines and enforces `Limits` as it goes.

The caller pushes lines (terminators included) until `push_line` reports the
blank terminator, then calls `finish` to get the fields.
*/
#[derive(Debug)]
pub struct HeaderScanner {
    limits: Limits,
    block: Vec<u8>,
    fields: usize,
}

impl HeaderScanner {
    pub fn new(limits: Limits) -> HeaderScanner {
        HeaderScanner {
            limits,
            block: Vec::new(),
            fields: 0,
        }
    }

    /// Returns `Ok(true)` when `line` was the blank end of the block.
    pub fn push_line(&mut self, line: &[u8]) -> Result<bool, ScanError> {
        if line.len() > self.limits.max_line {
            return Err(ScanError::HeaderTooLarge);
        }
        if self.block.len() + line.len() > self.limits.max_block {
            return Err(ScanError::HeaderBlockTooLarge);
        }

        if is_blank(line) || line.is_empty() {
            self.block.extend_from_slice(b"\r\n");
            return Ok(true);
        }
        if !line.contains(&b':') {
            return Err(ScanError::Malformed);
        }

        self.fields += 1;
        if self.fields > self.limits.max_fields {
            return Err(ScanError::TooManyHeaders);
        }
        self.block.extend_from_slice(line);
        Ok(false)
    }

    /**
    Push every line of an already-delimited block (as found by
    `find_block_end`), then tokenize it.
    */
    pub fn scan_block(mut self, block: &[u8]) -> Result<Vec<Field>, ScanError> {
        for line in block.split_inclusive(|&b| b == b'\n') {
            if self.push_line(line)? {
                break;
            }
        }
        self.finish()
    }

    /// Read lines from `r` until the blank terminator and tokenize them.
    ///
    /// `Ok(None)` means the stream ended before the block did.
    pub async fn read_block<R>(
        mut self,
        r: &mut R,
    ) -> std::io::Result<Result<Option<Vec<Field>>, ScanError>>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line: Vec<u8> = Vec::with_capacity(256);
        loop {
            line.clear();
            match read_line_bounded(r, &mut line, self.limits.max_line + 1).await? {
                Err(e) => return Ok(Err(e)),
                Ok(Line::Eof) | Ok(Line::Truncated) => return Ok(Ok(None)),
                Ok(Line::Full(_)) => match self.push_line(&line) {
                    Err(e) => return Ok(Err(e)),
                    Ok(true) => return Ok(self.finish().map(Some)),
                    Ok(false) => {}
                },
            }
        }
    }

    /// Tokenize the accumulated block into fields, in order of appearance.
    pub fn finish(self) -> Result<Vec<Field>, ScanError> {
        if self.fields == 0 {
            return Ok(Vec::new());
        }

        let mut empties = vec![EMPTY_HEADER; self.fields];
        let parsed = match parse_headers(&self.block, &mut empties) {
            Ok(Status::Complete((_, hdz))) => hdz,
            Ok(Status::Partial) => {
                return Err(ScanError::Malformed);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(ScanError::TooManyHeaders);
            }
            Err(e) => {
                log::debug!("header block rejected by parser: {}", &e);
                return Err(ScanError::Malformed);
            }
        };

        Ok(parsed
            .iter()
            .map(|h| Field {
                name: h.name.to_string(),
                value: h.value.to_vec(),
            })
            .collect())
    }
}

/**
Translate a header name into its environment-variable spelling:
ASCII letters and digits are uppercased, everything else becomes `_`.
*/
pub fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
