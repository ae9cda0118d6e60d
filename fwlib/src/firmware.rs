use std::{
    str,
    time::Duration,
};

use log::{debug, trace};
use reqwest::{
    header::{HeaderName, HeaderValue, CONTENT_LENGTH},
    Method,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::transport::{HttpTransport, RequestOptions, TransportError};

pub const DEFAULT_BASE_URL: &str = "http://dl.8bitdo.com:8080";
pub const LISTING_PATH: &str = "/firmware/select";
const NON_UTF8_MSG: &str = "[Non-UTF-8 data]";

/// Bound on the listing request and on reading its response body.
pub const LISTING_TIMEOUT: Duration = Duration::from_secs(10);

fn to_utf8_or_error_string(data: &[u8]) -> &str {
    str::from_utf8(data).unwrap_or(NON_UTF8_MSG)
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Firmware listing request failed: {0}")]
    RequestFailed(#[from] TransportError),
    #[error("Invalid firmware listing payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
    #[error("The server returned no usable firmware entries")]
    EmptyCatalog,
}

/// Metadata for one downloadable firmware image.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct FirmwareRecord {
    #[serde(rename = "fileName")]
    pub file_name: String,
    /// Server-relative download path
    #[serde(rename = "filePathName", default)]
    pub file_path_name: String,
    /// Opaque ordering key. Larger is newer, but it is not necessarily a
    /// timestamp.
    #[serde(default, deserialize_with = "deserialize_date")]
    pub date: i64,
    /// Human-readable version, if the server provides one
    #[serde(default)]
    pub version: Option<Value>,
}

impl FirmwareRecord {
    /// Version string suitable for display.
    pub fn version_label(&self) -> Option<String> {
        match &self.version {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(v) => Some(v.to_string()),
        }
    }

    /// Full download URL for this firmware. Returns `None` if the server did
    /// not provide a download path.
    pub fn download_url(&self, base_url: &str) -> Option<String> {
        let path = self.file_path_name.trim();
        if path.is_empty() {
            return None;
        }

        let base = base_url.trim_end_matches('/');
        if path.starts_with('/') {
            Some(format!("{base}{path}"))
        } else {
            Some(format!("{base}/{path}"))
        }
    }
}

/// The `date` field has been observed as an integer. Floats are truncated and
/// numeric strings are accepted so that a change in encoding does not cause
/// every entry to be dropped.
fn deserialize_date<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let value = Value::deserialize(deserializer)?;
    let date = match &value {
        Value::Null => Some(0),
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    };

    date.ok_or_else(|| D::Error::custom(format!("invalid date: {value}")))
}

/// A single element of the listing array. The server encodes some entries as
/// objects and others as strings containing JSON objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Record(FirmwareRecord),
    Encoded(String),
    Other(Value),
}

impl RawEntry {
    fn into_record(self) -> Option<FirmwareRecord> {
        match self {
            Self::Record(r) => Some(r),
            Self::Encoded(s) => match serde_json::from_str(&s) {
                Ok(r) => Some(r),
                Err(e) => {
                    debug!("Dropping undecodable firmware entry {s:?}: {e}");
                    None
                }
            },
            Self::Other(v) => {
                debug!("Dropping unrecognized firmware entry: {v}");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct Listing {
    list: Vec<Value>,
}

/// Convert raw listing entries into records, dropping anything that cannot be
/// interpreted. The result is sorted newest first. Entries with equal dates
/// keep their original order.
pub fn normalize_entries(entries: Vec<Value>) -> Vec<FirmwareRecord> {
    let mut records: Vec<FirmwareRecord> = entries.into_iter()
        .filter_map(|v| serde_json::from_value::<RawEntry>(v).ok())
        .filter_map(RawEntry::into_record)
        .collect();

    records.sort_by(|a, b| b.date.cmp(&a.date));
    records
}

/// Parse a listing response body.
pub fn parse_listing(data: &[u8]) -> Result<Vec<FirmwareRecord>, CatalogError> {
    let listing: Listing = serde_json::from_slice(data)
        .map_err(CatalogError::InvalidPayload)?;
    let total = listing.list.len();

    let records = normalize_entries(listing.list);
    debug!("Normalized {} of {} firmware entries", records.len(), total);

    if records.is_empty() {
        return Err(CatalogError::EmptyCatalog);
    }

    Ok(records)
}

/// Pick a firmware from a listing sorted by [`normalize_entries`]. `None`
/// selects the latest firmware. Otherwise, `index` is 1-based.
pub fn select_firmware(records: &[FirmwareRecord], index: Option<usize>) -> Option<&FirmwareRecord> {
    match index {
        None => records.first(),
        Some(i) => i.checked_sub(1).and_then(|i| records.get(i)),
    }
}

/// Client for the firmware listing endpoint.
#[derive(Clone)]
pub struct FirmwareClient {
    transport: HttpTransport,
    base_url: String,
    timeout: Duration,
}

impl FirmwareClient {
    pub fn new(transport: HttpTransport, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout: LISTING_TIMEOUT,
        }
    }

    /// Override the timeout for receiving the response headers and for
    /// reading the response body.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get all firmware available for a device type, newest first.
    pub async fn list_firmware(&self, type_code: u32) -> Result<Vec<FirmwareRecord>, CatalogError> {
        let url = format!("{}{LISTING_PATH}", self.base_url);
        debug!("Listing firmware for type {type_code} from: {url}");

        let options = RequestOptions::new()
            .header(HeaderName::from_static("type"), HeaderValue::from(type_code))
            .header(HeaderName::from_static("beta"), HeaderValue::from_static("1"))
            .header(CONTENT_LENGTH, HeaderValue::from(0u32))
            .timeout(self.timeout);

        let data = self.transport.execute_bytes(Method::POST, &url, &options).await?;

        trace!("Listing response: {:?}", to_utf8_or_error_string(&data));

        parse_listing(&data)
    }

    /// Download URL for a record from this client's server.
    pub fn download_url(&self, record: &FirmwareRecord) -> Option<String> {
        record.download_url(&self.base_url)
    }
}
