//! Range-Support Probe (§4.I): a HEAD request establishing the remote file's
//! size and whether the server honours `Range` requests, before any Segment
//! is planned.

use std::str;
use std::time::Duration;

use super::error::DownloadError;
use super::fetcher::USER_AGENT;

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub total_size: u64,
    pub range_supported: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Runs a blocking HEAD request against `url`. Call from `spawn_blocking`
/// when invoked from async code (the curl transfer below is synchronous).
pub fn probe(url: &str, connect_timeout: Duration, timeout: Duration) -> Result<ProbeResult, DownloadError> {
    let mut header_lines: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(DownloadError::from)?;
    easy.nobody(true).map_err(DownloadError::from)?;
    easy.follow_location(true).map_err(DownloadError::from)?;
    easy.connect_timeout(connect_timeout).map_err(DownloadError::from)?;
    easy.timeout(timeout).map_err(DownloadError::from)?;
    easy.useragent(USER_AGENT).map_err(DownloadError::from)?;
    let mut headers = curl::easy::List::new();
    headers.append("Accept: */*").map_err(DownloadError::from)?;
    easy.http_headers(headers).map_err(DownloadError::from)?;

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    header_lines.push(s.trim_end().to_string());
                }
                true
            })
            .map_err(DownloadError::from)?;
        transfer.perform().map_err(DownloadError::from)?;
    }

    let code = easy.response_code().map_err(DownloadError::from)?;
    if !(200..300).contains(&code) {
        return Err(DownloadError::HttpStatus { code });
    }

    Ok(parse_probe_headers(&header_lines))
}

fn parse_probe_headers(lines: &[String]) -> ProbeResult {
    let mut content_length = None;
    let mut range_supported = false;
    let mut etag = None;
    let mut last_modified = None;
    let mut has_content_range = false;
    let mut status_206 = false;

    for line in lines {
        let line = line.trim();
        if line.starts_with("HTTP/") {
            status_206 = line.split_whitespace().nth(1) == Some("206");
            continue;
        }
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<u64>().ok();
        } else if name.eq_ignore_ascii_case("accept-ranges") {
            range_supported = value.eq_ignore_ascii_case("bytes");
        } else if name.eq_ignore_ascii_case("content-range") {
            has_content_range = true;
        } else if name.eq_ignore_ascii_case("etag") {
            etag = Some(value.trim_matches('"').to_string());
        } else if name.eq_ignore_ascii_case("last-modified") {
            last_modified = Some(value.to_string());
        }
    }

    ProbeResult {
        total_size: content_length.unwrap_or(0),
        range_supported: range_supported || has_content_range || status_206,
        etag,
        last_modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_content_length_and_accept_ranges() {
        let lines = [
            "HTTP/1.1 200 OK".to_string(),
            "Content-Length: 1048576".to_string(),
            "Accept-Ranges: bytes".to_string(),
            "ETag: \"xyz\"".to_string(),
        ];
        let r = parse_probe_headers(&lines);
        assert_eq!(r.total_size, 1_048_576);
        assert!(r.range_supported);
        assert_eq!(r.etag.as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_accept_ranges_means_unsupported() {
        let lines = ["Content-Length: 500".to_string()];
        let r = parse_probe_headers(&lines);
        assert_eq!(r.total_size, 500);
        assert!(!r.range_supported);
    }

    #[test]
    fn explicit_none_means_unsupported() {
        let lines = ["Accept-Ranges: none".to_string()];
        let r = parse_probe_headers(&lines);
        assert!(!r.range_supported);
    }
}
