//! Server probing: size, range support, filename, protocol support.
//!
//! The probe prefers a HEAD request and falls back to a `Range: bytes=0-0`
//! GET when the HEAD fails or is ambiguous. Mirror probing runs the same
//! probe concurrently against every candidate; a mirror is valid only when
//! it reports the same size and supports ranges.

use reqwest::header;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::RuntimeOptions;
use crate::error::ProbeError;
use crate::utils;

/// How many body bytes the GET fallback inspects for magic signatures
const SNIFF_BYTES: usize = 512;

/// Metadata gathered from the probe step, used to select the download
/// strategy and size the workforce.
#[derive(Clone, Debug)]
pub struct ProbeOutcome {
    /// Object size in bytes (0 when the server did not report one)
    pub size: u64,
    /// Whether the server honors byte-range requests
    pub supports_range: bool,
    /// Derived output filename
    pub filename: String,
    /// Whether HTTP/2 was negotiated
    pub supports_h2: bool,
    /// Whether the server advertised HTTP/3 via Alt-Svc
    pub supports_h3: bool,
}

/// Build the short-timeout client used for probing
pub(crate) fn probe_client(runtime: &RuntimeOptions) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(runtime.probe_timeout)
        .redirect(reqwest::redirect::Policy::limited(10))
        .user_agent(runtime.user_agent.clone())
        .build()
        .map_err(|e| ProbeError::Network {
            url: String::new(),
            reason: format!("failed to build probe client: {e}"),
        })
}

/// Probe a URL for size, range support, filename, and protocol support.
///
/// `name_hint` short-circuits filename derivation when it already carries an
/// extension; otherwise the header/URL/magic-byte chain runs.
pub(crate) async fn probe(
    client: &reqwest::Client,
    url: &str,
    name_hint: Option<&str>,
    headers: &HashMap<String, String>,
) -> Result<ProbeOutcome, ProbeError> {
    // HEAD first; many servers answer it fully
    match head_probe(client, url, name_hint, headers).await {
        Ok(outcome) if outcome.size > 0 && outcome.supports_range => return Ok(outcome),
        Ok(partial) => {
            // Ambiguous: confirm with a ranged GET, reusing what we learned
            tracing::debug!(
                url,
                size = partial.size,
                supports_range = partial.supports_range,
                "HEAD ambiguous, falling back to ranged GET"
            );
        }
        Err(e) => {
            tracing::debug!(url, error = %e, "HEAD failed, falling back to ranged GET");
        }
    }

    get_probe(client, url, name_hint, headers).await
}

async fn head_probe(
    client: &reqwest::Client,
    url: &str,
    name_hint: Option<&str>,
    headers: &HashMap<String, String>,
) -> Result<ProbeOutcome, ProbeError> {
    let mut request = client.head(url);
    for (key, value) in headers {
        request = request.header(key, value);
    }

    let response = request.send().await.map_err(|e| network_err(url, &e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let size = content_length(response.headers());
    let supports_range = accept_ranges_bytes(response.headers());
    let supports_h2 = response.version() == reqwest::Version::HTTP_2;
    let supports_h3 = alt_svc_advertises_h3(response.headers());
    let filename = resolve_filename(url, response.headers(), name_hint, &[]);

    Ok(ProbeOutcome {
        size,
        supports_range,
        filename,
        supports_h2,
        supports_h3,
    })
}

async fn get_probe(
    client: &reqwest::Client,
    url: &str,
    name_hint: Option<&str>,
    headers: &HashMap<String, String>,
) -> Result<ProbeOutcome, ProbeError> {
    let mut request = client.get(url).header(header::RANGE, "bytes=0-0");
    for (key, value) in headers {
        request = request.header(key, value);
    }

    let response = request.send().await.map_err(|e| network_err(url, &e))?;
    let status = response.status();

    let (size, supports_range) = if status == reqwest::StatusCode::PARTIAL_CONTENT {
        let total = response
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| ProbeError::Parse {
                url: url.to_string(),
                detail: "206 reply without a parseable Content-Range total".to_string(),
            })?;
        (total, true)
    } else if status.is_success() {
        // 200: the server ignored the range; range support may still be
        // advertised via Accept-Ranges
        (content_length(response.headers()), accept_ranges_bytes(response.headers()))
    } else {
        return Err(ProbeError::HttpStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    };

    let supports_h2 = response.version() == reqwest::Version::HTTP_2;
    let supports_h3 = alt_svc_advertises_h3(response.headers());
    let response_headers = response.headers().clone();

    // Sniff the first body bytes for magic signatures when the name is
    // still unresolved
    let sniff = read_sniff_bytes(response).await;
    let filename = resolve_filename(url, &response_headers, name_hint, &sniff);

    Ok(ProbeOutcome {
        size,
        supports_range,
        filename,
        supports_h2,
        supports_h3,
    })
}

/// Probe every candidate (including the primary) concurrently.
///
/// Returns the URLs that are valid mirrors — same size, range support — and
/// a map of failures for the rest.
pub(crate) async fn probe_mirrors(
    client: &reqwest::Client,
    urls: &[String],
    expected_size: u64,
    timeout: Duration,
) -> (Vec<String>, HashMap<String, ProbeError>) {
    let empty_headers = HashMap::new();
    let probes = urls.iter().map(|url| {
        let client = client.clone();
        let empty_headers = &empty_headers;
        async move {
            let result = tokio::time::timeout(
                timeout,
                probe(&client, url, None, empty_headers),
            )
            .await;
            let outcome = match result {
                Ok(inner) => inner,
                Err(_) => Err(ProbeError::Timeout {
                    url: url.clone(),
                    timeout_secs: timeout.as_secs(),
                }),
            };
            (url.clone(), outcome)
        }
    });

    let mut valid = Vec::new();
    let mut errors = HashMap::new();
    for (url, outcome) in futures::future::join_all(probes).await {
        match outcome {
            Ok(probe) if probe.supports_range && probe.size == expected_size => {
                valid.push(url);
            }
            Ok(probe) => {
                errors.insert(
                    url.clone(),
                    ProbeError::Parse {
                        url,
                        detail: format!(
                            "mirror mismatch: size={} range={} (expected size {})",
                            probe.size, probe.supports_range, expected_size
                        ),
                    },
                );
            }
            Err(e) => {
                errors.insert(url, e);
            }
        }
    }
    (valid, errors)
}

async fn read_sniff_bytes(mut response: reqwest::Response) -> Vec<u8> {
    let mut sniff = Vec::with_capacity(SNIFF_BYTES);
    while sniff.len() < SNIFF_BYTES {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = (SNIFF_BYTES - sniff.len()).min(chunk.len());
                sniff.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    sniff
}

fn resolve_filename(
    url: &str,
    headers: &header::HeaderMap,
    name_hint: Option<&str>,
    sniff: &[u8],
) -> String {
    // A caller-supplied name with an extension wins outright
    if let Some(hint) = name_hint {
        let hint = utils::sanitize_filename(hint);
        if std::path::Path::new(&hint).extension().is_some() {
            return hint;
        }
    }

    let disposition = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok());
    let candidate = utils::filename_from_headers_and_url(url, disposition);
    let derived = utils::filename_from_magic(sniff, candidate);

    match name_hint {
        Some(hint) if !hint.is_empty() => {
            utils::ensure_filename_ext(&utils::sanitize_filename(hint), &derived)
        }
        _ => derived,
    }
}

fn content_length(headers: &header::HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn accept_ranges_bytes(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"))
}

/// Whether an Alt-Svc header advertises an h3 endpoint
pub(crate) fn alt_svc_advertises_h3(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::ALT_SVC)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|entry| entry.trim_start().starts_with("h3"))
        })
}

/// Extract the total size from a Content-Range value like `bytes 0-0/12345`
pub(crate) fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn network_err(url: &str, e: &reqwest::Error) -> ProbeError {
    ProbeError::Network {
        url: url.to_string(),
        reason: e.to_string(),
    }
}
