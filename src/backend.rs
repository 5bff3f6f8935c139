use std::collections::BTreeMap;
use std::io::Read;

use serde::Serialize;
use serde_json::Value;

use crate::domain::{BookRecord, DownloadRequest, InfoResult, Quota, SearchQuery, Source};
use crate::error::BookError;

/// Readiness flags reported by `setup`.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub configured: bool,
    #[serde(flatten)]
    pub flags: BTreeMap<String, Value>,
}

impl Readiness {
    pub fn new(configured: bool) -> Self {
        Self {
            configured,
            flags: BTreeMap::new(),
        }
    }

    pub fn flag(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.flags.insert(name.to_string(), value.into());
        self
    }
}

/// Bytes of a book on their way to disk.
pub struct Payload {
    pub filename: Option<String>,
    pub expected_len: Option<u64>,
    pub reader: Box<dyn Read>,
}

impl Payload {
    pub fn new(reader: impl Read + 'static) -> Self {
        Self {
            filename: None,
            expected_len: None,
            reader: Box::new(reader),
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_expected_len(mut self, len: Option<u64>) -> Self {
        self.expected_len = len;
        self
    }
}

/// Operations every book source offers. Failures are already mapped into
/// [`BookError`] when they leave an implementation.
pub trait Backend {
    fn source(&self) -> Source;

    fn readiness(&self) -> Readiness;

    /// Returns a `NotConfigured` error describing what is missing, if anything.
    fn ensure_configured(&self) -> Result<(), BookError>;

    fn search(&self, query: &SearchQuery) -> Result<Vec<BookRecord>, BookError>;

    fn info(&self, id: &str, hash: &str) -> Result<InfoResult, BookError>;

    /// `request.filename` is already resolved when the backend needs one up front.
    fn fetch(&self, request: &DownloadRequest) -> Result<Payload, BookError>;

    fn quota(&self) -> Option<Quota> {
        None
    }
}

impl<B: Backend + ?Sized> Backend for &B {
    fn source(&self) -> Source {
        (**self).source()
    }

    fn readiness(&self) -> Readiness {
        (**self).readiness()
    }

    fn ensure_configured(&self) -> Result<(), BookError> {
        (**self).ensure_configured()
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<BookRecord>, BookError> {
        (**self).search(query)
    }

    fn info(&self, id: &str, hash: &str) -> Result<InfoResult, BookError> {
        (**self).info(id, hash)
    }

    fn fetch(&self, request: &DownloadRequest) -> Result<Payload, BookError> {
        (**self).fetch(request)
    }

    fn quota(&self) -> Option<Quota> {
        (**self).quota()
    }
}
