use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{COOKIE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{Backend, Payload, Readiness};
use crate::config::Credentials;
use crate::domain::{BookRecord, DownloadRequest, InfoResult, Quota, SearchQuery, Source};
use crate::error::BookError;
use crate::normalize;
use crate::session::{SessionCache, SessionToken};

pub const DEFAULT_BASE_URL: &str = "https://z-library.sk";

/// Failure reported by the Z-Library client before it is mapped for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Auth(String),
    Quota(String),
    Timeout(String),
    Transport(String),
    Remote(String),
}

/// Capability set of the Z-Library EAPI client.
pub trait ZlibraryApi {
    fn login(&self, email: &str, password: &str) -> Result<SessionToken, ApiError>;
    fn search(&self, token: &SessionToken, query: &SearchQuery) -> Result<Vec<Value>, ApiError>;
    fn book_info(&self, token: &SessionToken, id: &str, hash: &str)
    -> Result<Option<Value>, ApiError>;
    fn download_book(&self, token: &SessionToken, id: &str, hash: &str)
    -> Result<Payload, ApiError>;
    fn profile(&self, token: &SessionToken) -> Result<Value, ApiError>;
}

#[derive(Clone)]
pub struct ZlibraryHttpClient {
    client: Client,
    file_client: Client,
    base_url: String,
}

impl ZlibraryHttpClient {
    pub fn new() -> Result<Self, BookError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, BookError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("book-tools/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BookError::unavailable(Source::Zlib, err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| BookError::unavailable(Source::Zlib, err.to_string()))?;
        let file_client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| BookError::unavailable(Source::Zlib, err.to_string()))?;
        Ok(Self {
            client,
            file_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorized(&self, request: RequestBuilder, token: &SessionToken) -> RequestBuilder {
        request.header(
            COOKIE,
            format!(
                "remix_userid={}; remix_userkey={}",
                token.remix_user_id, token.remix_userkey
            ),
        )
    }

    fn send_json(&self, request: RequestBuilder) -> Result<Value, ApiError> {
        let response = request.send().map_err(map_transport)?;
        parse_envelope(response)
    }
}

impl ZlibraryApi for ZlibraryHttpClient {
    fn login(&self, email: &str, password: &str) -> Result<SessionToken, ApiError> {
        let request = self
            .client
            .post(self.url("/eapi/user/login"))
            .form(&[("email", email), ("password", password)]);
        let body = self.send_json(request)?;
        let user = body
            .get("user")
            .ok_or_else(|| ApiError::Remote("login response has no user".to_string()))?;
        let user_id = match user.get("id") {
            Some(Value::Number(id)) => id.to_string(),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => return Err(ApiError::Remote("login response has no user id".to_string())),
        };
        let userkey = user
            .get("remix_userkey")
            .and_then(Value::as_str)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| ApiError::Remote("login response has no remix_userkey".to_string()))?;
        Ok(SessionToken::new(user_id, userkey))
    }

    fn search(&self, token: &SessionToken, query: &SearchQuery) -> Result<Vec<Value>, ApiError> {
        let mut form = vec![("message", query.text.clone())];
        if let Some(limit) = query.limit {
            form.push(("limit", limit.to_string()));
        }
        if let Some(language) = &query.language {
            form.push(("languages", language.clone()));
        }
        if let Some(extension) = &query.extension {
            form.push(("extensions", extension.clone()));
        }
        if let Some(from) = query.years.from {
            form.push(("yearFrom", from.to_string()));
        }
        if let Some(to) = query.years.to {
            form.push(("yearTo", to.to_string()));
        }
        let request = self
            .authorized(self.client.post(self.url("/eapi/book/search")), token)
            .form(&form);
        let body = self.send_json(request)?;
        Ok(body
            .get("books")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn book_info(
        &self,
        token: &SessionToken,
        id: &str,
        hash: &str,
    ) -> Result<Option<Value>, ApiError> {
        let request = self.authorized(
            self.client.get(self.url(&format!("/eapi/book/{id}/{hash}"))),
            token,
        );
        let response = request.send().map_err(map_transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = parse_envelope(response)?;
        Ok(body.get("book").filter(|book| book.is_object()).cloned())
    }

    fn download_book(
        &self,
        token: &SessionToken,
        id: &str,
        hash: &str,
    ) -> Result<Payload, ApiError> {
        let request = self.authorized(
            self.client
                .get(self.url(&format!("/eapi/book/{id}/{hash}/file"))),
            token,
        );
        let body = self.send_json(request)?;
        let file = body
            .get("file")
            .ok_or_else(|| ApiError::Remote("no file returned".to_string()))?;
        let link = file
            .get("downloadLink")
            .and_then(Value::as_str)
            .filter(|link| !link.is_empty())
            .ok_or_else(|| ApiError::Remote("file has no download link".to_string()))?;

        debug!(%id, "fetching book file");
        let response = self.file_client.get(link).send().map_err(map_transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, format!("file transfer returned {status}")));
        }
        let expected_len = response.content_length();
        let mut payload = Payload::new(response).with_expected_len(expected_len);
        if let Some(filename) = suggested_filename(file) {
            payload = payload.with_filename(filename);
        }
        Ok(payload)
    }

    fn profile(&self, token: &SessionToken) -> Result<Value, ApiError> {
        let request = self.authorized(self.client.get(self.url("/eapi/user/profile")), token);
        let body = self.send_json(request)?;
        body.get("user")
            .cloned()
            .ok_or_else(|| ApiError::Remote("profile response has no user".to_string()))
    }
}

fn parse_envelope(response: Response) -> Result<Value, ApiError> {
    let status = response.status();
    let body = response.json::<Value>().ok();
    classify_envelope(status, body)
}

/// Decides whether an EAPI response succeeded. Auth, rate-limit and timeout
/// statuses win over whatever the body says.
fn classify_envelope(status: StatusCode, body: Option<Value>) -> Result<Value, ApiError> {
    let error_message = |body: Option<&Value>| {
        body.and_then(|body| body.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("server returned {status}"))
    };

    if matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::REQUEST_TIMEOUT
            | StatusCode::GATEWAY_TIMEOUT
    ) {
        return Err(classify_status(status, error_message(body.as_ref())));
    }

    let Some(body) = body else {
        return Err(if status.is_success() {
            ApiError::Remote("unreadable response body".to_string())
        } else {
            classify_status(status, error_message(None))
        });
    };

    let success = match body.get("success") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(flag)) => flag.as_i64() == Some(1),
        _ => status.is_success() && body.get("error").is_none(),
    };
    if success {
        return Ok(body);
    }
    Err(classify_message(error_message(Some(&body))))
}

fn classify_status(status: StatusCode, message: String) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::Quota(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ApiError::Timeout(message),
        _ => ApiError::Remote(message),
    }
}

static QUOTA_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(quota|(daily |download )?limit (reached|exceeded|is over)|too many requests)\b",
    )
    .expect("valid regex")
});

static AUTH_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(please log ?in|log ?in required|not logged in|unauthori[sz]ed|authentication|authori[sz]ation|(invalid|expired) (token|session|credentials|userkey)|(incorrect|invalid|wrong) (email|password|email or password))\b",
    )
    .expect("valid regex")
});

/// Sorts an EAPI error message into the auth / quota / generic buckets.
pub fn classify_message(message: String) -> ApiError {
    if QUOTA_MESSAGE.is_match(&message) {
        ApiError::Quota(message)
    } else if AUTH_MESSAGE.is_match(&message) {
        ApiError::Auth(message)
    } else {
        ApiError::Remote(message)
    }
}

fn map_transport(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout(err.to_string())
    } else {
        ApiError::Transport(err.to_string())
    }
}

fn suggested_filename(file: &Value) -> Option<String> {
    let title = file
        .get("description")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|title| !title.is_empty())?;
    let mut name = title.to_string();
    if let Some(author) = file
        .get("author")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|author| !author.is_empty())
    {
        name.push_str(&format!(" ({author})"));
    }
    if let Some(extension) = file
        .get("extension")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|ext| !ext.is_empty())
    {
        name.push('.');
        name.push_str(extension);
    }
    Some(name)
}

/// Z-Library behind the session-token protocol: use the cached token, and on
/// an auth failure log in once more and retry the operation exactly once.
pub struct ZlibBackend<A: ZlibraryApi> {
    api: A,
    credentials: Credentials,
    session: SessionCache,
}

impl<A: ZlibraryApi> ZlibBackend<A> {
    pub fn new(api: A, credentials: Credentials, session: SessionCache) -> Self {
        Self {
            api,
            credentials,
            session,
        }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn login(&self) -> Result<SessionToken, BookError> {
        let (Some(email), Some(password)) = (&self.credentials.email, &self.credentials.password)
        else {
            return Err(not_configured());
        };
        info!("logging in to zlib");
        let token = match self.api.login(email, password) {
            Ok(token) => token,
            Err(ApiError::Auth(detail)) => {
                return Err(BookError::AuthFailed {
                    backend: Source::Zlib,
                    detail: Some(detail),
                });
            }
            Err(err) => return Err(map_api_error(err)),
        };
        self.session.put(&token)
    }

    fn with_session<T, F>(&self, op: F) -> Result<T, BookError>
    where
        F: Fn(&SessionToken) -> Result<T, ApiError>,
    {
        let (token, from_cache) = match self.session.get()? {
            Some(token) => {
                debug!("reusing cached zlib session");
                (token, true)
            }
            None => (self.login()?, false),
        };

        match op(&token) {
            Err(ApiError::Auth(detail)) if from_cache => {
                warn!(%detail, "cached zlib session rejected, logging in again");
                self.session.clear()?;
                let token = self.login()?;
                op(&token).map_err(map_api_error)
            }
            result => result.map_err(map_api_error),
        }
    }
}

fn not_configured() -> BookError {
    BookError::NotConfigured {
        backend: Source::Zlib,
        message: "email and password are not set".to_string(),
        hint: "book config set --zlib-email <email> --zlib-password <password>".to_string(),
    }
}

fn map_api_error(err: ApiError) -> BookError {
    match err {
        ApiError::Auth(detail) => BookError::AuthFailed {
            backend: Source::Zlib,
            detail: Some(detail),
        },
        ApiError::Quota(detail) => BookError::QuotaExceeded {
            backend: Source::Zlib,
            detail: Some(detail),
        },
        ApiError::Timeout(detail) => BookError::Unavailable {
            backend: Source::Zlib,
            message: "request timed out".to_string(),
            detail: Some(detail),
        },
        ApiError::Transport(detail) => BookError::Unavailable {
            backend: Source::Zlib,
            message: "service unreachable".to_string(),
            detail: Some(detail),
        },
        ApiError::Remote(detail) => BookError::Unavailable {
            backend: Source::Zlib,
            message: "request failed".to_string(),
            detail: Some(detail),
        },
    }
}

fn quota_from_profile(profile: &Value) -> Option<Quota> {
    let number = |key: &str| match profile.get(key)? {
        Value::Number(value) => value.as_u64(),
        Value::String(value) => value.trim().parse().ok(),
        _ => None,
    };
    let today = u32::try_from(number("downloads_today")?).ok()?;
    let limit = u32::try_from(number("downloads_limit")?).ok()?;
    Some(Quota::new(today, limit))
}

impl<A: ZlibraryApi> Backend for ZlibBackend<A> {
    fn source(&self) -> Source {
        Source::Zlib
    }

    fn readiness(&self) -> Readiness {
        let credentials_present = self.credentials.has_zlib_login();
        let session_cached = matches!(self.session.get(), Ok(Some(_)));
        Readiness::new(credentials_present || session_cached)
            .flag("credentials_present", credentials_present)
            .flag("session_cached", session_cached)
    }

    fn ensure_configured(&self) -> Result<(), BookError> {
        if self.credentials.has_zlib_login() || self.session.get()?.is_some() {
            Ok(())
        } else {
            Err(not_configured())
        }
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<BookRecord>, BookError> {
        query.validate()?;
        let raw = self.with_session(|token| self.api.search(token, query))?;
        debug!(count = raw.len(), "zlib search returned");
        Ok(normalize::zlib_records(&raw))
    }

    fn info(&self, id: &str, hash: &str) -> Result<InfoResult, BookError> {
        let raw = self.with_session(|token| self.api.book_info(token, id, hash))?;
        Ok(InfoResult {
            source: Source::Zlib,
            book: raw.as_ref().and_then(normalize::zlib_record),
            details: raw,
        })
    }

    fn fetch(&self, request: &DownloadRequest) -> Result<Payload, BookError> {
        request.validate(Source::Zlib)?;
        let id = request.id.as_deref().unwrap_or_default();
        self.with_session(|token| self.api.download_book(token, id, &request.hash))
    }

    fn quota(&self) -> Option<Quota> {
        match self.with_session(|token| self.api.profile(token)) {
            Ok(profile) => quota_from_profile(&profile),
            Err(err) => {
                debug!("quota lookup failed: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn classify_eapi_messages() {
        assert!(matches!(
            classify_message("Please login".to_string()),
            ApiError::Auth(_)
        ));
        assert!(matches!(
            classify_message("Daily limit reached".to_string()),
            ApiError::Quota(_)
        ));
        assert!(matches!(
            classify_message("Book not available".to_string()),
            ApiError::Remote(_)
        ));
        assert!(matches!(
            classify_message("Incorrect email or password".to_string()),
            ApiError::Auth(_)
        ));
        assert!(matches!(
            classify_message("Invalid token".to_string()),
            ApiError::Auth(_)
        ));
    }

    #[test]
    fn lookalike_words_are_not_auth_or_quota() {
        for message in [
            "Author not found",
            "Authors list is empty",
            "Token bucket refilled",
            "Password-protected archive",
            "Unlimited access books only",
        ] {
            assert!(
                matches!(classify_message(message.to_string()), ApiError::Remote(_)),
                "{message}"
            );
        }
    }

    #[test]
    fn envelope_success_flag_shapes() {
        let ok = StatusCode::OK;
        assert!(classify_envelope(ok, Some(json!({"success": 1, "books": []}))).is_ok());
        assert!(classify_envelope(ok, Some(json!({"success": true}))).is_ok());
        assert!(classify_envelope(ok, Some(json!({"books": []}))).is_ok());
        assert_eq!(
            classify_envelope(ok, Some(json!({"success": 0, "error": "Book not available"}))),
            Err(ApiError::Remote("Book not available".to_string()))
        );
        assert_eq!(
            classify_envelope(ok, Some(json!({"success": 0, "error": "Please login"}))),
            Err(ApiError::Auth("Please login".to_string()))
        );
        assert_matches!(
            classify_envelope(ok, Some(json!({"error": "Daily limit reached"}))),
            Err(ApiError::Quota(_))
        );
        assert_matches!(classify_envelope(ok, None), Err(ApiError::Remote(_)));
    }

    #[test]
    fn envelope_status_wins_over_body() {
        assert_matches!(
            classify_envelope(StatusCode::UNAUTHORIZED, None),
            Err(ApiError::Auth(_))
        );
        assert_matches!(
            classify_envelope(StatusCode::FORBIDDEN, Some(json!({"success": 1}))),
            Err(ApiError::Auth(_))
        );
        assert_eq!(
            classify_envelope(
                StatusCode::TOO_MANY_REQUESTS,
                Some(json!({"success": 0, "error": "Too many requests"}))
            ),
            Err(ApiError::Quota("Too many requests".to_string()))
        );
        assert_matches!(
            classify_envelope(StatusCode::TOO_MANY_REQUESTS, None),
            Err(ApiError::Quota(_))
        );
        assert_matches!(
            classify_envelope(StatusCode::GATEWAY_TIMEOUT, None),
            Err(ApiError::Timeout(_))
        );
        assert_matches!(
            classify_envelope(StatusCode::INTERNAL_SERVER_ERROR, None),
            Err(ApiError::Remote(_))
        );
    }

    #[test]
    fn filename_from_file_descriptor() {
        let file = json!({"description": "Deep Learning", "author": "Goodfellow", "extension": "pdf"});
        assert_eq!(
            suggested_filename(&file).as_deref(),
            Some("Deep Learning (Goodfellow).pdf")
        );
        assert_eq!(suggested_filename(&json!({"extension": "pdf"})), None);
    }

    #[test]
    fn quota_parses_mixed_number_shapes() {
        let profile = json!({"downloads_today": "4", "downloads_limit": 10});
        assert_eq!(quota_from_profile(&profile), Some(Quota::new(4, 10)));
        assert_eq!(quota_from_profile(&json!({})), None);
    }
}
