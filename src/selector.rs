use tracing::{debug, warn};

use crate::backend::Backend;
use crate::domain::{Operation, Source, SourceSelection};
use crate::error::BookError;

/// Ordered list of backends to try for `requested`.
///
/// `Auto` prefers Z-Library because it yields ids and richer metadata.
pub fn select(requested: SourceSelection, op: Operation) -> Result<Vec<Source>, BookError> {
    match (requested, op) {
        (SourceSelection::Auto, Operation::Search) => Ok(vec![Source::Zlib, Source::Annas]),
        (SourceSelection::Auto, Operation::Download) => Err(BookError::Invalid(
            "download needs an explicit --source (zlib or annas)".to_string(),
        )),
        (SourceSelection::Auto, Operation::Info) | (SourceSelection::Zlib, _) => {
            Ok(vec![Source::Zlib])
        }
        (SourceSelection::Annas, Operation::Info) => Err(BookError::Invalid(
            "info is only available with --source zlib".to_string(),
        )),
        (SourceSelection::Annas, _) => Ok(vec![Source::Annas]),
    }
}

/// Runs `attempt` against `plan` in order.
///
/// With an explicit selection the single backend must be configured. Under
/// `Auto`, unconfigured or failing backends are skipped, while a successful
/// attempt ends the run even when it found nothing.
pub fn run<T, F>(
    requested: SourceSelection,
    plan: &[&dyn Backend],
    mut attempt: F,
) -> Result<(Source, T), BookError>
where
    F: FnMut(&dyn Backend) -> Result<T, BookError>,
{
    if requested != SourceSelection::Auto {
        let backend = plan.first().ok_or_else(|| {
            BookError::Invalid("no backend selected".to_string())
        })?;
        backend.ensure_configured()?;
        return attempt(*backend).map(|value| (backend.source(), value));
    }

    let mut attempts = Vec::new();
    let mut last_error = None;
    for backend in plan {
        let source = backend.source();
        if let Err(err) = backend.ensure_configured() {
            debug!(%source, "skipping unconfigured backend");
            attempts.push(format!("{source}: {err}"));
            continue;
        }
        match attempt(*backend) {
            Ok(value) => return Ok((source, value)),
            Err(err) => {
                warn!(%source, "backend failed, trying next: {err}");
                attempts.push(format!("{source}: {err}"));
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(with_attempts(err, attempts)),
        None => Err(BookError::NoBackendAvailable { attempts }),
    }
}

fn with_attempts(err: BookError, attempts: Vec<String>) -> BookError {
    let summary = attempts.join("; ");
    match err {
        BookError::AuthFailed { backend, .. } => BookError::AuthFailed {
            backend,
            detail: Some(summary),
        },
        BookError::QuotaExceeded { backend, .. } => BookError::QuotaExceeded {
            backend,
            detail: Some(summary),
        },
        BookError::Unavailable {
            backend, message, ..
        } => BookError::Unavailable {
            backend,
            message,
            detail: Some(summary),
        },
        other => other,
    }
}
