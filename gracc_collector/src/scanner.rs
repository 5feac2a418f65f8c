//! Bundle Scanner (SPEC_FULL.md §4.1): splits a byte payload on the `|`
//! character, except where that pipe falls inside a single- or
//! double-quoted, backslash-escaped span.
//!
//! Ported from `original_source/collector.go`'s `ScanBundle`, which is a
//! `bufio.SplitFunc`. Here the whole payload already lives in memory (it
//! arrived as one HTTP form field), so there is no need for `bufio`'s
//! incremental, buffer-growing machinery — the scanner is a plain iterator
//! over slice views into the input, allocating nothing per token.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("token of {len} bytes exceeds max buffer size of {max} bytes")]
    TokenTooLarge { len: usize, max: usize },
}

/// Buffer sizing knobs carried over from the source's `bufio.Scanner.Buffer`
/// call. `start` has no effect on this zero-copy implementation (nothing is
/// grown), but both fields round-trip through configuration so the surface
/// stays compatible with SPEC_FULL.md §6.
#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub start_buffer_size: usize,
    pub max_buffer_size: usize,
}

/// Iterates the top-level tokens of `data`, splitting on `|` outside of
/// quoted spans.
pub struct BundleScanner<'a> {
    data: &'a [u8],
    pos: usize,
    max_buffer_size: usize,
    done: bool,
}

impl<'a> BundleScanner<'a> {
    pub fn new(data: &'a [u8], limits: ScanLimits) -> Self {
        Self {
            data,
            pos: 0,
            max_buffer_size: limits.max_buffer_size,
            done: data.is_empty(),
        }
    }

    fn emit(&mut self, token: &'a [u8]) -> Result<&'a [u8], ScanError> {
        if token.len() > self.max_buffer_size {
            return Err(ScanError::TokenTooLarge {
                len: token.len(),
                max: self.max_buffer_size,
            });
        }
        Ok(token)
    }
}

impl<'a> Iterator for BundleScanner<'a> {
    type Item = Result<&'a [u8], ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let rest = &self.data[self.pos..];
        match find_unquoted_pipe(rest) {
            Some(i) => {
                let token = &rest[..i];
                self.pos += i + 1;
                Some(self.emit(token))
            }
            None => {
                self.done = true;
                Some(self.emit(rest))
            }
        }
    }
}

/// Returns the byte offset of the first `|` in `data` that falls outside of
/// a quoted span, or `None` if there isn't one.
///
/// A single or double quote opens a string; the matching quote closes it.
/// A backslash escapes the next character, and the escape state itself
/// toggles (so `\\` is not an escape of whatever follows it).
fn find_unquoted_pipe(data: &[u8]) -> Option<usize> {
    let mut in_string = false;
    let mut escape = false;
    let mut delim = 0u8;
    for (i, &b) in data.iter().enumerate() {
        match b {
            b'|' if !in_string => return Some(i),
            b'\'' | b'"' => {
                if in_string && !escape && b == delim {
                    in_string = false;
                } else if !in_string {
                    in_string = true;
                    delim = b;
                }
            }
            _ => {}
        }
        escape = b == b'\\' && !escape;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan<'a>(data: &'a [u8], max: usize) -> Result<Vec<&'a [u8]>, ScanError> {
        BundleScanner::new(
            data,
            ScanLimits {
                start_buffer_size: 64,
                max_buffer_size: max,
            },
        )
        .collect()
    }

    #[test]
    fn empty_input_is_empty_sequence() {
        assert_eq!(scan(b"", 1024).unwrap(), Vec::<&[u8]>::new());
    }

    #[test]
    fn single_pipe_is_two_empty_tokens() {
        assert_eq!(scan(b"|", 1024).unwrap(), vec![b"".as_slice(), b""]);
    }

    #[test]
    fn quoted_pipe_is_one_token() {
        let data = br#""a|b""#;
        assert_eq!(scan(data, 1024).unwrap(), vec![data.as_slice()]);
    }

    #[test]
    fn escaped_quote_inside_matching_quote_is_one_token() {
        let data = br#""a\"b""#;
        assert_eq!(scan(data, 1024).unwrap(), vec![data.as_slice()]);
    }

    #[test]
    fn unterminated_quote_at_eof_is_one_token() {
        let data = br#""abc"#;
        assert_eq!(scan(data, 1024).unwrap(), vec![data.as_slice()]);
    }

    #[test]
    fn trailing_pipe_yields_trailing_empty_token() {
        assert_eq!(scan(b"a|", 1024).unwrap(), vec![b"a".as_slice(), b""]);
    }

    #[test]
    fn replication_group_splits_into_four_tokens() {
        assert_eq!(
            scan(b"replication|<rec/>|raw text|extra", 1024).unwrap(),
            vec![
                b"replication".as_slice(),
                b"<rec/>".as_slice(),
                b"raw text".as_slice(),
                b"extra".as_slice(),
            ]
        );
    }

    #[test]
    fn double_backslash_is_not_an_escape() {
        // `\\` toggles escape twice (cancelling out), so the quote that
        // follows is not escaped and closes the string normally.
        let data = br#""a\\"|b"#;
        assert_eq!(
            scan(data, 1024).unwrap(),
            vec![br#""a\\""#.as_slice(), b"b".as_slice()]
        );
    }

    #[test]
    fn oversized_token_is_a_scan_error() {
        let err = scan(b"abcdef|ghi", 3).unwrap_err();
        assert_eq!(
            err,
            ScanError::TokenTooLarge { len: 6, max: 3 }
        );
    }

    #[test]
    fn round_trip_join_recovers_input_without_quoting() {
        let data = b"replication|rec|raw|extra||done";
        let tokens = scan(data, 4096).unwrap();
        let joined = tokens
            .iter()
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .collect::<Vec<_>>()
            .join("|");
        assert_eq!(joined.as_bytes(), data);
    }
}
