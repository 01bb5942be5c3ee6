//! RTMFP URLs

use std::fmt;
use url::Url;

use crate::error::{ClientError, Result};

/// Parsed `rtmfp://host[:port]/app[/...]` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmfpUrl {
    url: Url,
    host: String,
    port: u16,
}

impl RtmfpUrl {
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", input, e)))?;
        if !url.scheme().eq_ignore_ascii_case("rtmfp") {
            return Err(ClientError::InvalidUrl(format!(
                "{}: scheme must be rtmfp",
                input
            )));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ClientError::InvalidUrl(format!("{}: missing host", input)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port().unwrap_or(rtmfp_core::DEFAULT_PORT);
        Ok(Self { url, host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Application path without the leading slash
    pub fn app(&self) -> &str {
        self.url.path().trim_start_matches('/')
    }

    /// Full URL as sent in the `connect` command and the hello
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for RtmfpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Split `rtmfp://host/app/stream` into (`rtmfp://host/app`, `stream`) at the
/// last `/` or `\`
pub fn publication_and_url(uri: &str) -> Option<(String, String)> {
    let split = uri.rfind(['/', '\\'])?;
    let publication = &uri[split + 1..];
    if publication.is_empty() {
        return None;
    }
    Some((uri[..split].to_string(), publication.to_string()))
}
