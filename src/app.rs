use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::backend::{Backend, Readiness};
use crate::config::Credentials;
use crate::domain::{
    DownloadReport, DownloadRequest, InfoResult, Operation, SearchQuery, SearchResult, Source,
    SourceSelection,
};
use crate::download::{self, OutputDirs};
use crate::error::BookError;
use crate::selector;

#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    #[serde(flatten)]
    pub backends: BTreeMap<String, Readiness>,
}

/// Wires the two book sources to the selector and download pipeline.
pub struct App<Z: Backend, A: Backend> {
    credentials: Credentials,
    zlib: Z,
    annas: A,
    fallback_dir: Option<PathBuf>,
}

impl<Z: Backend, A: Backend> App<Z, A> {
    pub fn new(credentials: Credentials, zlib: Z, annas: A) -> Self {
        Self {
            credentials,
            zlib,
            annas,
            fallback_dir: None,
        }
    }

    /// Overrides `~/Downloads` as the last-resort download directory.
    pub fn with_fallback_dir(mut self, dir: PathBuf) -> Self {
        self.fallback_dir = Some(dir);
        self
    }

    fn backend(&self, source: Source) -> &dyn Backend {
        match source {
            Source::Zlib => &self.zlib,
            Source::Annas => &self.annas,
        }
    }

    fn plan(
        &self,
        requested: SourceSelection,
        op: Operation,
    ) -> Result<Vec<&dyn Backend>, BookError> {
        let sources = selector::select(requested, op)?;
        debug!(?requested, ?sources, "backend plan");
        Ok(sources.into_iter().map(|source| self.backend(source)).collect())
    }

    pub fn search(
        &self,
        query: &SearchQuery,
        requested: SourceSelection,
    ) -> Result<SearchResult, BookError> {
        query.validate()?;
        let plan = self.plan(requested, Operation::Search)?;
        let (source, books) = selector::run(requested, &plan, |backend| backend.search(query))?;
        Ok(SearchResult::new(source, books))
    }

    pub fn info(
        &self,
        requested: SourceSelection,
        id: &str,
        hash: &str,
    ) -> Result<InfoResult, BookError> {
        if id.trim().is_empty() || hash.trim().is_empty() {
            return Err(BookError::Invalid(
                "info needs both --id and --hash".to_string(),
            ));
        }
        let plan = self.plan(requested, Operation::Info)?;
        let (_, result) = selector::run(requested, &plan, |backend| backend.info(id, hash))?;
        Ok(result)
    }

    pub fn download(
        &self,
        source: Source,
        request: &DownloadRequest,
        output_dir: Option<PathBuf>,
    ) -> Result<DownloadReport, BookError> {
        request.validate(source)?;
        let requested = SourceSelection::from(source);
        let plan = self.plan(requested, Operation::Download)?;
        let dirs = OutputDirs {
            explicit: output_dir,
            configured: self.credentials.default_download_dir.as_ref().map(PathBuf::from),
            backend_default: match source {
                Source::Annas => self
                    .credentials
                    .annas_download_path
                    .as_ref()
                    .map(PathBuf::from),
                Source::Zlib => None,
            },
            fallback: self.fallback_dir.clone(),
        };
        let (_, mut report) = selector::run(requested, &plan, |backend| {
            download::download(backend, request, &dirs)
        })?;
        report.quota = self.backend(source).quota();
        Ok(report)
    }

    pub fn setup(&self) -> SetupReport {
        let backends = [&self.zlib as &dyn Backend, &self.annas as &dyn Backend]
            .into_iter()
            .map(|backend| (backend.source().to_string(), backend.readiness()))
            .collect();
        SetupReport { backends }
    }
}
