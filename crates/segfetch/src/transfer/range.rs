use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap};

/// Parsed `Content-Range` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes <start>-<end>/<total>`; total is `None` for `*`.
    Bytes {
        start: u64,
        end: u64,
        total: Option<u64>,
    },
    /// `bytes */<total>`, sent with 416.
    Unsatisfied { total: u64 },
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = spec.split_once('/')?;
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().ok()?),
        };

        if range.trim() == "*" {
            return total.map(|total| Self::Unsatisfied { total });
        }
        let (start, end) = range.split_once('-')?;
        let start = start.trim().parse::<u64>().ok()?;
        let end = end.trim().parse::<u64>().ok()?;
        if end < start || total.is_some_and(|t| end >= t) {
            return None;
        }
        Some(Self::Bytes { start, end, total })
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        Self::parse(headers.get(CONTENT_RANGE)?.to_str().ok()?)
    }

    /// Complete length of the resource, when the server stated it.
    pub fn total(&self) -> Option<u64> {
        match self {
            Self::Bytes { total, .. } => *total,
            Self::Unsatisfied { total } => Some(*total),
        }
    }
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Authoritative length of the remote file after a GET.
///
/// `Content-Range` wins; otherwise `Content-Length`, shifted by `offset`
/// for a partial response.
pub fn remote_length(status: StatusCode, headers: &HeaderMap, offset: u64) -> Option<u64> {
    if let Some(total) = ContentRange::from_headers(headers).and_then(|r| r.total()) {
        return Some(total);
    }
    let length = content_length(headers)?;
    if status == StatusCode::PARTIAL_CONTENT {
        Some(length + offset)
    } else {
        Some(length)
    }
}

pub fn range_header(offset: u64) -> String {
    format!("bytes={offset}-")
}
