use super::video::VideoReader;
use crate::core::{Result, VlmError};
use base64::Engine;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// Where a media item comes from.
pub enum MediaSource {
    Path(PathBuf),
    Url(String),
    Bytes(Vec<u8>),
    /// `data:<mime>;base64,<payload>`
    DataUri(String),
    /// Frame-addressable video, e.g. a decoder owned by the caller.
    Reader(Box<dyn VideoReader>),
}

impl MediaSource {
    /// Classifies a CLI-style argument: URL, data URI, or filesystem path.
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            MediaSource::Url(input.to_string())
        } else if input.starts_with("data:") {
            MediaSource::DataUri(input.to_string())
        } else {
            MediaSource::Path(PathBuf::from(input))
        }
    }

    /// Raw encoded bytes of the source. Readers have no byte form.
    pub fn read_bytes(&self, proxy: Option<&str>) -> Result<Vec<u8>> {
        match self {
            MediaSource::Path(path) => Ok(std::fs::read(path)?),
            MediaSource::Url(url) => fetch_url(url, proxy),
            MediaSource::Bytes(bytes) => Ok(bytes.clone()),
            MediaSource::DataUri(uri) => decode_data_uri(uri),
            MediaSource::Reader(_) => Err(VlmError::UnsupportedMedia(
                "frame reader has no encoded bytes".to_string(),
            )),
        }
    }
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            MediaSource::Url(u) => f.debug_tuple("Url").field(u).finish(),
            MediaSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            MediaSource::DataUri(u) => write!(f, "DataUri({} chars)", u.len()),
            MediaSource::Reader(r) => write!(f, "Reader({:?})", r.metadata()),
        }
    }
}

impl From<&str> for MediaSource {
    fn from(input: &str) -> Self {
        MediaSource::parse(input)
    }
}

impl From<PathBuf> for MediaSource {
    fn from(path: PathBuf) -> Self {
        MediaSource::Path(path)
    }
}

impl From<Vec<u8>> for MediaSource {
    fn from(bytes: Vec<u8>) -> Self {
        MediaSource::Bytes(bytes)
    }
}

/// Single blocking GET, no retries.
pub fn fetch_url(url: &str, proxy: Option<&str>) -> Result<Vec<u8>> {
    let mut builder = reqwest::blocking::Client::builder();
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }
    let client = builder.build()?;

    debug!(url, "fetching media");
    let response = client.get(url).send()?.error_for_status()?;
    Ok(response.bytes()?.to_vec())
}

fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| VlmError::UnsupportedMedia("not a data uri".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| VlmError::UnsupportedMedia("data uri without payload".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(VlmError::UnsupportedMedia(format!(
            "data uri must be base64 encoded, got {}",
            header
        )));
    }

    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| VlmError::UnsupportedMedia(format!("invalid base64 payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source_kinds() {
        assert!(matches!(MediaSource::parse("https://x/y.png"), MediaSource::Url(_)));
        assert!(matches!(MediaSource::parse("data:image/png;base64,AAAA"), MediaSource::DataUri(_)));
        assert!(matches!(MediaSource::parse("cat.png"), MediaSource::Path(_)));
    }

    #[test]
    fn test_data_uri_roundtrip() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
        let source = MediaSource::DataUri(format!("data:image/png;base64,{}", encoded));
        assert_eq!(source.read_bytes(None).unwrap(), b"hello");

        let plain = MediaSource::DataUri("data:text/plain,hello".to_string());
        assert!(matches!(plain.read_bytes(None), Err(VlmError::UnsupportedMedia(_))));
    }
}
