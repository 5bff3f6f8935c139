use std::sync::Mutex;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use book_tools::backend::{Backend, Payload};
use book_tools::config::Credentials;
use book_tools::domain::{DownloadRequest, SearchQuery, Source, YearRange};
use book_tools::error::BookError;
use book_tools::session::{SessionCache, SessionToken};
use book_tools::store::Store;
use book_tools::zlib::{ApiError, ZlibBackend, ZlibraryApi, classify_message};

#[derive(Default)]
struct Calls {
    logins: usize,
    searches: Vec<String>,
}

/// Accepts only the token issued by its most recent login.
struct MockApi {
    calls: Mutex<Calls>,
    valid_key: Mutex<Option<String>>,
    login_result: Result<(), ApiError>,
    reject_every_token: bool,
    books: Vec<Value>,
    search_error: Option<ApiError>,
}

impl MockApi {
    fn new(books: Vec<Value>) -> Self {
        Self {
            calls: Mutex::new(Calls::default()),
            valid_key: Mutex::new(None),
            login_result: Ok(()),
            reject_every_token: false,
            books,
            search_error: None,
        }
    }

    fn logins(&self) -> usize {
        self.calls.lock().unwrap().logins
    }

    fn searches(&self) -> usize {
        self.calls.lock().unwrap().searches.len()
    }

    fn check(&self, token: &SessionToken) -> Result<(), ApiError> {
        let valid = self.valid_key.lock().unwrap();
        if self.reject_every_token || valid.as_deref() != Some(token.remix_userkey.as_str()) {
            return Err(ApiError::Auth("Please login".to_string()));
        }
        Ok(())
    }
}

impl ZlibraryApi for MockApi {
    fn login(&self, _email: &str, _password: &str) -> Result<SessionToken, ApiError> {
        let mut calls = self.calls.lock().unwrap();
        calls.logins += 1;
        self.login_result.clone()?;
        let key = format!("fresh-key-{}", calls.logins);
        *self.valid_key.lock().unwrap() = Some(key.clone());
        Ok(SessionToken::new("1001", key))
    }

    fn search(&self, token: &SessionToken, query: &SearchQuery) -> Result<Vec<Value>, ApiError> {
        self.calls.lock().unwrap().searches.push(query.text.clone());
        self.check(token)?;
        if let Some(err) = &self.search_error {
            return Err(err.clone());
        }
        Ok(self.books.clone())
    }

    fn book_info(
        &self,
        token: &SessionToken,
        id: &str,
        hash: &str,
    ) -> Result<Option<Value>, ApiError> {
        self.check(token)?;
        Ok(self
            .books
            .iter()
            .find(|book| book["id"] == json!(id) && book["hash"] == json!(hash))
            .cloned())
    }

    fn download_book(
        &self,
        token: &SessionToken,
        _id: &str,
        _hash: &str,
    ) -> Result<Payload, ApiError> {
        self.check(token)?;
        Err(ApiError::Quota("Daily limit reached".to_string()))
    }

    fn profile(&self, token: &SessionToken) -> Result<Value, ApiError> {
        self.check(token)?;
        Ok(json!({"downloads_today": 3, "downloads_limit": 10}))
    }
}

fn temp_store() -> (tempfile::TempDir, Store) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("book-tools")).unwrap();
    (temp, Store::new_with_root(root))
}

fn login_credentials() -> Credentials {
    Credentials {
        email: Some("reader@example.com".to_string()),
        password: Some("pw".to_string()),
        ..Credentials::default()
    }
}

fn sample_books() -> Vec<Value> {
    vec![
        json!({"id": "11", "hash": "aaa", "title": "Deep Learning", "year": "2016"}),
        json!({"id": "12", "hash": "bbb", "title": "Pattern Recognition"}),
    ]
}

#[test]
fn first_use_logs_in_and_caches_token() {
    let (_temp, store) = temp_store();
    let backend = ZlibBackend::new(
        MockApi::new(sample_books()),
        login_credentials(),
        SessionCache::new(store.clone()),
    );

    let books = backend.search(&SearchQuery::new("deep learning")).unwrap();
    assert_eq!(books.len(), 2);
    assert!(books.iter().all(|book| book.source == Source::Zlib && book.id.is_some()));
    assert_eq!(backend.api().logins(), 1);
    assert!(SessionCache::new(store).get().unwrap().is_some());

    backend.search(&SearchQuery::new("again")).unwrap();
    assert_eq!(backend.api().logins(), 1);
}

#[test]
fn stale_token_triggers_exactly_one_login_and_retry() {
    let (_temp, store) = temp_store();
    let session = SessionCache::new(store.clone());
    session.put(&SessionToken::new("1001", "expired")).unwrap();
    let backend = ZlibBackend::new(MockApi::new(sample_books()), login_credentials(), session);

    let books = backend.search(&SearchQuery::new("deep learning")).unwrap();
    assert_eq!(books.len(), 2);
    assert_eq!(backend.api().logins(), 1);
    assert_eq!(backend.api().searches(), 2);

    let cached = SessionCache::new(store).get().unwrap().unwrap();
    assert_eq!(cached.remix_userkey, "fresh-key-1");
}

#[test]
fn second_auth_failure_is_fatal() {
    let (_temp, store) = temp_store();
    let session = SessionCache::new(store);
    session.put(&SessionToken::new("1001", "expired")).unwrap();
    let mut api = MockApi::new(sample_books());
    api.reject_every_token = true;
    let backend = ZlibBackend::new(api, login_credentials(), session);

    let err = backend.search(&SearchQuery::new("anything")).unwrap_err();
    assert_matches!(err, BookError::AuthFailed { backend: Source::Zlib, .. });
    assert_eq!(backend.api().logins(), 1);
    assert_eq!(backend.api().searches(), 2);
}

#[test]
fn fresh_login_rejected_is_not_retried() {
    let (_temp, store) = temp_store();
    let mut api = MockApi::new(sample_books());
    api.reject_every_token = true;
    let backend = ZlibBackend::new(api, login_credentials(), SessionCache::new(store));

    let err = backend.search(&SearchQuery::new("anything")).unwrap_err();
    assert_matches!(err, BookError::AuthFailed { .. });
    assert_eq!(backend.api().logins(), 1);
    assert_eq!(backend.api().searches(), 1);
}

#[test]
fn rejected_password_is_auth_failed() {
    let (_temp, store) = temp_store();
    let mut api = MockApi::new(sample_books());
    api.login_result = Err(ApiError::Auth("Incorrect email or password".to_string()));
    let backend = ZlibBackend::new(api, login_credentials(), SessionCache::new(store.clone()));

    let err = backend.search(&SearchQuery::new("anything")).unwrap_err();
    assert_matches!(err, BookError::AuthFailed { .. });
    assert_eq!(backend.api().searches(), 0);
    assert!(SessionCache::new(store).get().unwrap().is_none());
}

#[test]
fn missing_credentials_are_not_configured() {
    let (_temp, store) = temp_store();
    let backend = ZlibBackend::new(
        MockApi::new(sample_books()),
        Credentials::default(),
        SessionCache::new(store),
    );

    assert!(!backend.readiness().configured);
    assert_matches!(
        backend.ensure_configured(),
        Err(BookError::NotConfigured { backend: Source::Zlib, .. })
    );
    assert_matches!(
        backend.search(&SearchQuery::new("anything")),
        Err(BookError::NotConfigured { .. })
    );
    assert_eq!(backend.api().logins(), 0);
}

#[test]
fn cached_session_alone_counts_as_configured() {
    let (_temp, store) = temp_store();
    let session = SessionCache::new(store);
    session.put(&SessionToken::new("1001", "key")).unwrap();
    let backend = ZlibBackend::new(MockApi::new(Vec::new()), Credentials::default(), session);
    assert!(backend.ensure_configured().is_ok());
    assert!(backend.readiness().configured);
}

#[test]
fn quota_exceeded_is_distinct() {
    let (_temp, store) = temp_store();
    let backend = ZlibBackend::new(
        MockApi::new(sample_books()),
        login_credentials(),
        SessionCache::new(store),
    );
    let request = DownloadRequest {
        id: Some("11".to_string()),
        hash: "aaa".to_string(),
        filename: None,
    };
    let err = backend.fetch(&request).err().unwrap();
    assert_matches!(err, BookError::QuotaExceeded { backend: Source::Zlib, .. });
}

#[test]
fn transport_failure_is_unavailable() {
    let (_temp, store) = temp_store();
    let mut api = MockApi::new(Vec::new());
    api.search_error = Some(ApiError::Timeout("operation timed out".to_string()));
    let backend = ZlibBackend::new(api, login_credentials(), SessionCache::new(store));

    let err = backend.search(&SearchQuery::new("slow")).unwrap_err();
    assert_matches!(err, BookError::Unavailable { .. });
    assert_eq!(err.detail().as_deref(), Some("operation timed out"));
}

#[test]
fn non_auth_error_keeps_cached_session() {
    let (_temp, store) = temp_store();
    let session = SessionCache::new(store.clone());
    session.put(&SessionToken::new("1001", "fresh-key-0")).unwrap();
    let api = MockApi::new(Vec::new());
    *api.valid_key.lock().unwrap() = Some("fresh-key-0".to_string());
    let api = MockApi {
        search_error: Some(classify_message("Author not found".to_string())),
        ..api
    };
    let backend = ZlibBackend::new(api, login_credentials(), session);

    let err = backend.search(&SearchQuery::new("unknown author")).unwrap_err();
    assert_matches!(err, BookError::Unavailable { backend: Source::Zlib, .. });
    assert_eq!(backend.api().logins(), 0);
    assert_eq!(backend.api().searches(), 1);
    let cached = SessionCache::new(store).get().unwrap().unwrap();
    assert_eq!(cached.remix_userkey, "fresh-key-0");
}

#[test]
fn inverted_years_rejected_before_any_call() {
    let (_temp, store) = temp_store();
    let backend = ZlibBackend::new(
        MockApi::new(sample_books()),
        login_credentials(),
        SessionCache::new(store),
    );
    let query = SearchQuery {
        years: YearRange {
            from: Some(2020),
            to: Some(2000),
        },
        ..SearchQuery::new("history")
    };
    assert_matches!(backend.search(&query), Err(BookError::Invalid(_)));
    assert_eq!(backend.api().logins(), 0);
    assert_eq!(backend.api().searches(), 0);
}

#[test]
fn info_returns_normalized_record_or_none() {
    let (_temp, store) = temp_store();
    let backend = ZlibBackend::new(
        MockApi::new(sample_books()),
        login_credentials(),
        SessionCache::new(store),
    );

    let found = backend.info("11", "aaa").unwrap();
    let book = found.book.unwrap();
    assert_eq!(book.title.as_deref(), Some("Deep Learning"));
    assert!(found.details.is_some());

    let missing = backend.info("99", "zzz").unwrap();
    assert!(missing.book.is_none());
}

#[test]
fn quota_reported_from_profile() {
    let (_temp, store) = temp_store();
    let backend = ZlibBackend::new(
        MockApi::new(Vec::new()),
        login_credentials(),
        SessionCache::new(store),
    );
    let quota = backend.quota().unwrap();
    assert_eq!(quota.remaining, 7);
}
