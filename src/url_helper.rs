//! Fetching user-data includes and seed files from URLs or local paths
//!
//! Retries are bounded and sleep-based; the caller simply awaits.

use crate::CloudInitError;
use reqwest::Client;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};

/// Retry and timeout policy for a fetch
#[derive(Debug, Clone)]
pub struct UrlOptions {
    /// Extra attempts after the first
    pub retries: u32,
    pub sec_between: Duration,
    pub timeout: Duration,
}

impl Default for UrlOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            sec_between: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// A successfully fetched document
#[derive(Debug, Clone)]
pub struct UrlResponse {
    pub url: String,
    pub status: u16,
    pub contents: Vec<u8>,
}

/// Read `url`, which may be an http(s) URL, a `file://` URL or an absolute path
pub async fn read_file_or_url(
    url: &str,
    opts: &UrlOptions,
) -> Result<UrlResponse, CloudInitError> {
    let url = url.trim();
    if let Some(path) = local_path(url) {
        debug!("Reading local file {}", path);
        return match fs::read(path).await {
            Ok(contents) => Ok(UrlResponse {
                url: url.to_string(),
                status: 200,
                contents,
            }),
            Err(e) => Err(CloudInitError::url_fetch(url, e.to_string())),
        };
    }

    let client = Client::builder().timeout(opts.timeout).build()?;

    let attempts = opts.retries + 1;
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        debug!("[{}/{}] open '{}'", attempt, attempts, url);
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                let status = response.status().as_u16();
                let contents = response.bytes().await?.to_vec();
                debug!("Read from {} ({}, {}b)", url, status, contents.len());
                return Ok(UrlResponse {
                    url: url.to_string(),
                    status,
                    contents,
                });
            }
            Ok(response) => {
                last_error = format!("HTTP status {}", response.status());
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            warn!(
                "Please wait {:?} while we retry {}: {}",
                opts.sec_between, url, last_error
            );
            tokio::time::sleep(opts.sec_between).await;
        }
    }

    Err(CloudInitError::url_fetch(url, last_error))
}

fn local_path(url: &str) -> Option<&str> {
    if let Some(path) = url.strip_prefix("file://") {
        Some(path)
    } else if url.starts_with('/') {
        Some(url)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_read_local_path_and_file_url() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("ud");
        std::fs::write(&file, "#cloud-config\n").unwrap();

        let plain = read_file_or_url(file.to_str().unwrap(), &UrlOptions::default())
            .await
            .unwrap();
        assert_eq!(plain.contents, b"#cloud-config\n");

        let url = format!("file://{}", file.display());
        let via_url = read_file_or_url(&url, &UrlOptions::default())
            .await
            .unwrap();
        assert_eq!(via_url.contents, plain.contents);
    }

    #[tokio::test]
    async fn test_missing_local_file_is_error() {
        let err = read_file_or_url("/nonexistent/really", &UrlOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CloudInitError::UrlFetch { .. }));
    }

    #[tokio::test]
    async fn test_http_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ud"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let resp = read_file_or_url(&format!("{}/ud", server.uri()), &UrlOptions::default())
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.contents, b"hello");
    }

    #[tokio::test]
    async fn test_http_error_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(2)
            .mount(&server)
            .await;

        let opts = UrlOptions {
            retries: 1,
            sec_between: Duration::from_millis(10),
            ..Default::default()
        };
        let err = read_file_or_url(&format!("{}/missing", server.uri()), &opts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
    }
}
