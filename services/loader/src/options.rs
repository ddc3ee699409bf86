//! Per-stage retrieve options and their resolution.
//!
//! Options are registered in a two-level table keyed by transfer syntax UID
//! and then retrieve type, with `"default"` usable on either level.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Wildcard key on either level of the options table
pub const DEFAULT_KEY: &str = "default";

/// Transfer syntax key used when the image has none
pub const UNKNOWN_TRANSFER_SYNTAX: &str = "unknown";

/// HTJ2K lossless-or-lossy transfer syntax
pub const HTJ2K_TRANSFER_SYNTAX: &str = "3.2.840.10008.1.2.4.96";

/// Quality tag attached to delivered results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityStatus {
    FullResolution,
    Lossy,
    Subresolution,
}

impl QualityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityStatus::FullResolution => "full resolution",
            QualityStatus::Lossy => "lossy",
            QualityStatus::Subresolution => "sub-resolution",
        }
    }
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid byte range '{0}', expected <start>-<end> or <start>-")]
pub struct ByteRangeError(String);

/// Byte range sent as `Range: bytes=<start>-<end>`, both ends inclusive
///
/// A range without an end runs to the end of the representation, so a
/// `0-65535` head chunk followed by `65536-` completes the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Everything from `start` onwards.
    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Whether the range runs to the end of the representation.
    pub fn is_open_ended(&self) -> bool {
        self.end.is_none()
    }

    /// Value for the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}", String::from(*self))
    }

    /// Number of bytes covered, if the range has an end.
    pub fn byte_count(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }
}

impl FromStr for ByteRange {
    type Err = ByteRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ByteRangeError(s.to_string());
        let text = s.trim();
        let text = text.strip_prefix("bytes=").unwrap_or(text);
        let (start, end) = text.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end = match end.trim() {
            "" => None,
            end => Some(end.parse::<u64>().map_err(|_| invalid())?),
        };
        if end.is_some_and(|end| end < start) {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for ByteRange {
    type Error = ByteRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByteRange> for String {
    fn from(range: ByteRange) -> Self {
        match range.end {
            Some(end) => format!("{}-{}", range.start, end),
            None => format!("{}-", range.start),
        }
    }
}

/// HTTP and decode parameters for one retrieve stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOptions {
    /// Extra query arguments, e.g. `lossy=jhc`
    #[serde(default, alias = "url_arguments", skip_serializing_if = "Option::is_none")]
    pub url_arguments: Option<String>,
    /// Replacement for the `/frames/` path segment
    #[serde(default, alias = "frames_path", skip_serializing_if = "Option::is_none")]
    pub frames_path: Option<String>,
    /// Hint that the decoder may stream-decode this response
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, alias = "byte_range", skip_serializing_if = "Option::is_none")]
    pub byte_range: Option<ByteRange>,
    #[serde(default, alias = "decode_level", skip_serializing_if = "Option::is_none")]
    pub decode_level: Option<u32>,
    /// Results of this stage are lossy
    #[serde(default, alias = "is_lossy")]
    pub is_lossy: bool,
    /// Explicit quality tag, overrides `is_lossy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<QualityStatus>,
    /// `Accept` media type override
    #[serde(default, alias = "media_type", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl StageOptions {
    pub fn quality_status(&self) -> QualityStatus {
        match self.status {
            Some(status) => status,
            None if self.is_lossy => QualityStatus::Lossy,
            None => QualityStatus::FullResolution,
        }
    }

    /// Rewrite a frame URI with this stage's path override and arguments.
    pub fn apply_to_uri(&self, uri: &str) -> String {
        let mut uri = match self.frames_path.as_deref() {
            Some(path) if uri.contains("/frames/") => {
                let mut segment = String::with_capacity(path.len() + 2);
                if !path.starts_with('/') {
                    segment.push('/');
                }
                segment.push_str(path);
                if !path.ends_with('/') {
                    segment.push('/');
                }
                uri.replacen("/frames/", &segment, 1)
            }
            _ => uri.to_string(),
        };

        if let Some(arguments) = self.url_arguments.as_deref() {
            let arguments = arguments.trim_start_matches(['?', '&']);
            if !arguments.is_empty() {
                uri.push(if uri.contains('?') { '&' } else { '?' });
                uri.push_str(arguments);
            }
        }

        uri
    }
}

type OptionsTable = HashMap<String, HashMap<String, StageOptions>>;

/// Two-level options table: transfer syntax -> retrieve type -> options
///
/// Retrieve type ids are matched case-insensitively; configuration sources
/// may fold key case, so `singleFast` and `singlefast` name the same entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "OptionsTable", into = "OptionsTable")]
pub struct RetrieveOptions {
    entries: OptionsTable,
}

fn retrieve_type_key(retrieve_type_id: &str) -> String {
    retrieve_type_id.to_ascii_lowercase()
}

impl From<OptionsTable> for RetrieveOptions {
    fn from(table: OptionsTable) -> Self {
        let mut options = Self::new();
        for (transfer_syntax_uid, by_type) in table {
            for (retrieve_type_id, stage) in by_type {
                options.insert(transfer_syntax_uid.clone(), retrieve_type_id, stage);
            }
        }
        options
    }
}

impl From<RetrieveOptions> for OptionsTable {
    fn from(options: RetrieveOptions) -> Self {
        options.entries
    }
}

impl RetrieveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The options table shipped with the loader.
    pub fn builtin() -> Self {
        Self::new()
            .with(
                HTJ2K_TRANSFER_SYNTAX,
                DEFAULT_KEY,
                StageOptions {
                    streaming: true,
                    ..Default::default()
                },
            )
            .with(DEFAULT_KEY, "lossy", StageOptions::default())
            .with(
                HTJ2K_TRANSFER_SYNTAX,
                "lossy",
                StageOptions {
                    is_lossy: true,
                    streaming: false,
                    ..Default::default()
                },
            )
            .with(
                HTJ2K_TRANSFER_SYNTAX,
                "final",
                StageOptions {
                    is_lossy: false,
                    streaming: false,
                    ..Default::default()
                },
            )
    }

    pub fn with(
        mut self,
        transfer_syntax_uid: impl Into<String>,
        retrieve_type_id: impl Into<String>,
        options: StageOptions,
    ) -> Self {
        self.insert(transfer_syntax_uid, retrieve_type_id, options);
        self
    }

    pub fn insert(
        &mut self,
        transfer_syntax_uid: impl Into<String>,
        retrieve_type_id: impl Into<String>,
        options: StageOptions,
    ) {
        let retrieve_type_id: String = retrieve_type_id.into();
        self.entries
            .entry(transfer_syntax_uid.into())
            .or_default()
            .insert(retrieve_type_key(&retrieve_type_id), options);
    }

    /// Exact lookup, no fallback.
    pub fn get(&self, transfer_syntax_uid: &str, retrieve_type_id: &str) -> Option<&StageOptions> {
        self.entries
            .get(transfer_syntax_uid)
            .and_then(|by_type| by_type.get(&retrieve_type_key(retrieve_type_id)))
    }

    /// Apply overrides; an override entry replaces the whole existing entry.
    pub fn merge(&mut self, overrides: RetrieveOptions) {
        for (transfer_syntax_uid, by_type) in overrides.entries {
            for (retrieve_type_id, options) in by_type {
                self.insert(transfer_syntax_uid.clone(), retrieve_type_id, options);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(
        &self,
        transfer_syntax_uid: Option<&str>,
        retrieve_type_id: Option<&str>,
    ) -> Option<&StageOptions> {
        resolve_options(Some(self), transfer_syntax_uid, retrieve_type_id)
    }
}

/// Most specific options for a transfer syntax and retrieve type.
///
/// Lookup order: exact, default transfer syntax, default retrieve type, then
/// default/default. `None` for `table` means no staged retrieval was
/// configured.
pub fn resolve_options<'a>(
    table: Option<&'a RetrieveOptions>,
    transfer_syntax_uid: Option<&str>,
    retrieve_type_id: Option<&str>,
) -> Option<&'a StageOptions> {
    let table = table?;
    let transfer_syntax_uid = transfer_syntax_uid
        .filter(|uid| !uid.is_empty())
        .unwrap_or(UNKNOWN_TRANSFER_SYNTAX);
    let retrieve_type_id = retrieve_type_id
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_KEY);

    [
        (transfer_syntax_uid, retrieve_type_id),
        (DEFAULT_KEY, retrieve_type_id),
        (transfer_syntax_uid, DEFAULT_KEY),
        (DEFAULT_KEY, DEFAULT_KEY),
    ]
    .into_iter()
    .find_map(|(uid, id)| table.get(uid, id))
}
