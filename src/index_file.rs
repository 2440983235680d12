// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Codec for the `<target>.teemo` sidecar index.
//!
//! The sidecar is a UTF-8, LF-terminated text file:
//!
//! ```text
//! 1                    schema version
//! <url>
//! <total_size>         -1 when unknown
//! <saved_at_unix>
//! <begin>,<end>,<captured>     one line per slice; end -1 when open-ended
//! ```
//!
//! The codec never touches the filesystem. Unknown trailing lines are
//! ignored for forward compatibility; missing required fields fail with
//! `INVALID_INDEX_FORMAT`.

use snafu::ensure;

use crate::error::{DownloadError, InvalidIndexFormatSnafu};

/// Schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

/// Persisted view of one slice.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SliceRecord {
    /// First byte of the range, inclusive.
    pub begin:    u64,
    /// Last byte of the range, inclusive; `None` for an open-ended
    /// streaming slice.
    pub end:      Option<u64>,
    /// Bytes of the range already flushed to the temporary file.
    pub captured: u64,
}

impl SliceRecord {
    /// Length of the range when bounded.
    #[must_use]
    pub fn len(&self) -> Option<u64> { self.end.map(|end| end - self.begin + 1) }

    #[must_use]
    pub fn is_complete(&self) -> bool { self.len().is_some_and(|len| self.captured == len) }
}

/// Decoded sidecar content; the single source of truth for resumption.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IndexRecord {
    pub version:       u32,
    pub url:           String,
    /// `None` when the resource size was unknown (chunked transfer).
    pub total_size:    Option<u64>,
    pub saved_at_unix: i64,
    pub slices:        Vec<SliceRecord>,
}

impl IndexRecord {
    /// Serialize to the sidecar text form.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(64 + self.slices.len() * 24);
        out.push_str(&format!("{}\n", self.version));
        out.push_str(&format!("{}\n", self.url));
        out.push_str(&format!("{}\n", encode_size(self.total_size)));
        out.push_str(&format!("{}\n", self.saved_at_unix));
        for slice in &self.slices {
            out.push_str(&format!(
                "{},{},{}\n",
                slice.begin,
                encode_size(slice.end),
                slice.captured
            ));
        }
        out
    }

    /// Parse sidecar bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DownloadError> {
        let text = std::str::from_utf8(bytes).map_err(|_| {
            InvalidIndexFormatSnafu { reason: "index file is not valid utf-8" }.build()
        })?;
        let mut lines = text.lines();

        let version: u32 = required(lines.next(), "schema version")?
            .trim()
            .parse()
            .map_err(|_| InvalidIndexFormatSnafu { reason: "schema version is not a number" }.build())?;
        ensure!(
            version == SCHEMA_VERSION,
            InvalidIndexFormatSnafu { reason: format!("unsupported schema version {version}") }
        );

        let url = required(lines.next(), "url")?.trim().to_string();
        let total_size = decode_size(required(lines.next(), "total size")?)
            .ok_or_else(|| InvalidIndexFormatSnafu { reason: "total size is not a number" }.build())?;
        let saved_at_unix: i64 = required(lines.next(), "saved-at timestamp")?
            .trim()
            .parse()
            .map_err(|_| {
                InvalidIndexFormatSnafu { reason: "saved-at timestamp is not a number" }.build()
            })?;

        let mut slices = Vec::new();
        let mut in_tail = false;
        for line in lines {
            // The first line that is not a slice triple starts the ignored
            // forward-compatibility tail. A triple after the tail began
            // means the table was interrupted, not extended.
            let Some(record) = parse_slice_line(line) else {
                in_tail = true;
                continue;
            };
            ensure!(
                !in_tail,
                InvalidIndexFormatSnafu { reason: "slice table interrupted by foreign line" }
            );
            if let Some(len) = record.len() {
                ensure!(
                    record.captured <= len,
                    InvalidIndexFormatSnafu {
                        reason: format!(
                            "slice {}..={} captured {} exceeds its length",
                            record.begin,
                            record.end.unwrap_or_default(),
                            record.captured
                        ),
                    }
                );
            }
            slices.push(record);
        }

        Ok(Self { version, url, total_size, saved_at_unix, slices })
    }

    /// Collapse runs of adjacent complete slices into single records.
    /// Purely cosmetic; the decoded plan stays equivalent.
    #[must_use]
    pub fn merge_adjacent_done(mut self) -> Self {
        let mut merged: Vec<SliceRecord> = Vec::with_capacity(self.slices.len());
        for slice in self.slices.drain(..) {
            if let Some(last) = merged.last_mut() {
                let contiguous = last.end.is_some_and(|end| end + 1 == slice.begin);
                if contiguous && last.is_complete() && slice.is_complete() {
                    last.end = slice.end;
                    last.captured += slice.captured;
                    continue;
                }
            }
            merged.push(slice);
        }
        self.slices = merged;
        self
    }
}

fn required<'a>(line: Option<&'a str>, what: &str) -> Result<&'a str, DownloadError> {
    line.ok_or_else(|| InvalidIndexFormatSnafu { reason: format!("missing {what}") }.build())
}

fn encode_size(size: Option<u64>) -> String {
    match size {
        Some(size) => size.to_string(),
        None => "-1".to_string(),
    }
}

fn decode_size(field: &str) -> Option<Option<u64>> {
    let field = field.trim();
    if field == "-1" {
        return Some(None);
    }
    field.parse::<u64>().ok().map(Some)
}

fn parse_slice_line(line: &str) -> Option<SliceRecord> {
    let mut parts = line.trim().splitn(3, ',');
    let begin: u64 = parts.next()?.parse().ok()?;
    let end = decode_size(parts.next()?)?;
    let captured: u64 = parts.next()?.parse().ok()?;
    if let Some(end) = end {
        if end < begin {
            return None;
        }
    }
    Some(SliceRecord { begin, end, captured })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DownloadResult;

    fn sample() -> IndexRecord {
        IndexRecord {
            version:       SCHEMA_VERSION,
            url:           "http://example.com/file.bin".to_string(),
            total_size:    Some(1000),
            saved_at_unix: 1_700_000_000,
            slices:        vec![
                SliceRecord { begin: 0, end: Some(249), captured: 250 },
                SliceRecord { begin: 250, end: Some(499), captured: 100 },
                SliceRecord { begin: 500, end: Some(999), captured: 0 },
            ],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let record = sample();
        let decoded = IndexRecord::decode(record.encode().as_bytes()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn unknown_total_size_round_trips() {
        let record = IndexRecord {
            total_size: None,
            slices: vec![SliceRecord { begin: 0, end: None, captured: 4096 }],
            ..sample()
        };
        let decoded = IndexRecord::decode(record.encode().as_bytes()).unwrap();
        assert_eq!(decoded.total_size, None);
        assert_eq!(decoded.slices[0].end, None);
    }

    #[test]
    fn trailing_unknown_lines_are_ignored() {
        let mut text = sample().encode();
        text.push_str("some-future-field=1\nmore garbage\n");
        let decoded = IndexRecord::decode(text.as_bytes()).unwrap();
        assert_eq!(decoded.slices.len(), 3);
    }

    #[test]
    fn missing_required_fields_fail() {
        let err = IndexRecord::decode(b"1\nhttp://example.com\n").unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidIndexFormat);

        let err = IndexRecord::decode(b"").unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidIndexFormat);
    }

    #[test]
    fn byte_mutations_never_decode_silently_wrong() {
        // Mutating the captured count above the slice length must be
        // rejected rather than adopted.
        let corrupted = sample().encode().replace("0,249,250", "0,249,999");
        let err = IndexRecord::decode(corrupted.as_bytes()).unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidIndexFormat);

        let corrupted = sample().encode().replace('\n', "");
        assert!(IndexRecord::decode(corrupted.as_bytes()).is_err());

        // A garbage line inside the slice table is corruption, not a
        // forward-compatibility tail.
        let corrupted = sample().encode().replace("250,499,100", "250,4x9,100");
        let err = IndexRecord::decode(corrupted.as_bytes()).unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidIndexFormat);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let text = sample().encode().replacen('1', "9", 1);
        let err = IndexRecord::decode(text.as_bytes()).unwrap_err();
        assert_eq!(err.code(), DownloadResult::InvalidIndexFormat);
    }

    #[test]
    fn merge_collapses_adjacent_complete_slices() {
        let record = IndexRecord {
            slices: vec![
                SliceRecord { begin: 0, end: Some(249), captured: 250 },
                SliceRecord { begin: 250, end: Some(499), captured: 250 },
                SliceRecord { begin: 500, end: Some(999), captured: 10 },
            ],
            ..sample()
        };
        let merged = record.merge_adjacent_done();
        assert_eq!(merged.slices.len(), 2);
        assert_eq!(merged.slices[0], SliceRecord {
            begin:    0,
            end:      Some(499),
            captured: 500,
        });
        assert_eq!(merged.slices[1].begin, 500);
    }

    #[test]
    fn merge_keeps_incomplete_neighbors_apart() {
        let record = sample();
        let merged = record.clone().merge_adjacent_done();
        assert_eq!(merged.slices, record.slices);
    }
}
