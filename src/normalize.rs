//! Mapping of backend-specific raw records into [`BookRecord`].
//!
//! Missing values stay `None`; nothing is re-ordered.

use serde_json::Value;
use tracing::debug;

use crate::annas::AnnasListing;
use crate::domain::{BookRecord, Source};

pub fn zlib_records(raw: &[Value]) -> Vec<BookRecord> {
    raw.iter().filter_map(zlib_record).collect()
}

pub fn zlib_record(raw: &Value) -> Option<BookRecord> {
    let Some(hash) = text_field(raw, "hash") else {
        debug!("dropping zlib record without hash");
        return None;
    };
    let Some(id) = text_field(raw, "id") else {
        debug!(%hash, "dropping zlib record without id");
        return None;
    };
    Some(BookRecord {
        source: Source::Zlib,
        id: Some(id),
        hash,
        title: text_field(raw, "title"),
        author: text_field(raw, "author"),
        publisher: text_field(raw, "publisher"),
        year: year_field(raw),
        language: text_field(raw, "language"),
        extension: text_field(raw, "extension"),
        filesize: text_field(raw, "filesizeString"),
        cover: text_field(raw, "cover"),
        url: None,
    })
}

pub fn annas_records(listings: Vec<AnnasListing>) -> Vec<BookRecord> {
    listings.into_iter().filter_map(annas_record).collect()
}

pub fn annas_record(listing: AnnasListing) -> Option<BookRecord> {
    let hash = clean(listing.hash).or_else(|| listing.url.as_deref().and_then(md5_from_url))?;
    Some(BookRecord {
        title: clean(listing.title),
        author: clean(listing.author),
        publisher: clean(listing.publisher),
        language: clean(listing.language),
        extension: clean(listing.format).map(|ext| ext.trim_start_matches('.').to_lowercase()),
        filesize: clean(listing.size),
        url: clean(listing.url),
        ..BookRecord::new(Source::Annas, hash)
    })
}

fn text_field(raw: &Value, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(value) => clean(Some(value.clone())),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

fn year_field(raw: &Value) -> Option<String> {
    let year = text_field(raw, "year")?;
    match year.parse::<u32>() {
        Ok(0) => None,
        _ => Some(year),
    }
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn md5_from_url(url: &str) -> Option<String> {
    let (_, tail) = url.split_once("/md5/")?;
    let hash: String = tail
        .chars()
        .take_while(|ch| ch.is_ascii_hexdigit())
        .collect();
    (hash.len() == 32).then(|| hash.to_lowercase())
}
