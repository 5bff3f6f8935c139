use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Zlib,
    Annas,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Zlib => "zlib",
            Source::Annas => "annas",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SourceSelection {
    Zlib,
    Annas,
    #[default]
    Auto,
}

impl From<Source> for SourceSelection {
    fn from(source: Source) -> Self {
        match source {
            Source::Zlib => SourceSelection::Zlib,
            Source::Annas => SourceSelection::Annas,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Search,
    Info,
    Download,
}

/// A book as reported by either backend, reduced to one shape.
///
/// `id` is only ever set for Z-Library records; Anna's Archive identifies
/// books by hash alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRecord {
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesize: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl BookRecord {
    pub fn new(source: Source, hash: impl Into<String>) -> Self {
        Self {
            source,
            id: None,
            hash: hash.into(),
            title: None,
            author: None,
            publisher: None,
            year: None,
            language: None,
            extension: None,
            filesize: None,
            cover: None,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct YearRange {
    pub from: Option<u32>,
    pub to: Option<u32>,
}

impl YearRange {
    pub fn validate(&self) -> Result<(), BookError> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(BookError::Invalid(format!(
                    "--year-from {from} is after --year-to {to}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchQuery {
    pub text: String,
    pub limit: Option<u32>,
    pub language: Option<String>,
    pub extension: Option<String>,
    pub years: YearRange,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), BookError> {
        if self.text.trim().is_empty() {
            return Err(BookError::Invalid("search query is empty".to_string()));
        }
        if self.limit == Some(0) {
            return Err(BookError::Invalid("--limit must be at least 1".to_string()));
        }
        self.years.validate()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub source: Source,
    pub count: usize,
    pub books: Vec<BookRecord>,
}

impl SearchResult {
    pub fn new(source: Source, books: Vec<BookRecord>) -> Self {
        Self {
            source,
            count: books.len(),
            books,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InfoResult {
    pub source: Source,
    pub book: Option<BookRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// What the caller knows about the book to download.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadRequest {
    pub id: Option<String>,
    pub hash: String,
    pub filename: Option<String>,
}

impl DownloadRequest {
    pub fn validate(&self, source: Source) -> Result<(), BookError> {
        if self.hash.trim().is_empty() {
            return Err(BookError::Invalid("--hash must not be empty".to_string()));
        }
        if source == Source::Zlib && self.id.as_deref().is_none_or(|id| id.trim().is_empty()) {
            return Err(BookError::Invalid(
                "--id is required when downloading from zlib".to_string(),
            ));
        }
        if let Some(filename) = &self.filename {
            if filename.trim().is_empty() {
                return Err(BookError::Invalid("--filename must not be empty".to_string()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Ok,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub downloads_today: u32,
    pub downloads_limit: u32,
    pub remaining: u32,
}

impl Quota {
    pub fn new(downloads_today: u32, downloads_limit: u32) -> Self {
        Self {
            downloads_today,
            downloads_limit,
            remaining: downloads_limit.saturating_sub(downloads_today),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub source: Source,
    pub status: DownloadStatus,
    pub path: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<Quota>,
}
