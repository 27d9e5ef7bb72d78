//! Endpoint URL derivation
//!
//! The streaming endpoint lives at a fixed path relative to the page the
//! client was served from. Plain pages talk to the plain transport, secure
//! pages to the secure one.

use crate::error::RelayError;
use tokio_tungstenite::tungstenite::http::Uri;

/// Relative path of the video endpoint
pub const DEFAULT_WS_PATH: &str = "./ws/video";

/// Derive the WebSocket endpoint from the page location.
///
/// `relative_path` is resolved against `page_url` the way a browser resolves
/// a relative reference; query and fragment are dropped. `http` maps to `ws`
/// and `https` to `wss`.
///
/// # Example
/// ```rust
/// use camrelay_core::endpoint::derive_endpoint;
///
/// let url = derive_endpoint("https://cam.example.com/app/index.html", "./ws/video")?;
/// assert_eq!(url, "wss://cam.example.com/app/ws/video");
/// # Ok::<(), camrelay_core::RelayError>(())
/// ```
pub fn derive_endpoint(page_url: &str, relative_path: &str) -> Result<String, RelayError> {
    let page: Uri = page_url
        .parse()
        .map_err(|e| invalid(page_url, format!("{}", e)))?;

    let scheme = match page.scheme_str() {
        Some("http") | Some("ws") => "ws",
        Some("https") | Some("wss") => "wss",
        Some(other) => {
            return Err(invalid(page_url, format!("unsupported scheme '{}'", other)));
        }
        None => return Err(invalid(page_url, "missing scheme")),
    };

    let authority = page
        .authority()
        .ok_or_else(|| invalid(page_url, "missing host"))?;

    let path = resolve_path(page.path(), relative_path);
    Ok(format!("{}://{}{}", scheme, authority, path))
}

/// Whether the endpoint uses the secure transport
pub fn is_secure(endpoint: &str) -> bool {
    endpoint.starts_with("wss://")
}

fn invalid(url: &str, reason: impl Into<String>) -> RelayError {
    RelayError::InvalidEndpoint {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn resolve_path(base: &str, reference: &str) -> String {
    let reference = reference
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or_default();

    let merged = if reference.starts_with('/') {
        reference.to_string()
    } else {
        let base_dir = match base.rfind('/') {
            Some(idx) => &base[..=idx],
            None => "/",
        };
        format!("{}{}", base_dir, reference)
    };

    remove_dot_segments(&merged)
}

fn remove_dot_segments(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').skip(1).collect();
    let last = segments.len().saturating_sub(1);
    let mut output: Vec<&str> = Vec::with_capacity(segments.len());
    let mut trailing_slash = false;

    for (i, segment) in segments.iter().enumerate() {
        match *segment {
            "." => trailing_slash = i == last,
            ".." => {
                output.pop();
                trailing_slash = i == last;
            }
            other => {
                output.push(other);
                trailing_slash = false;
            }
        }
    }

    let mut resolved = String::from("/");
    resolved.push_str(&output.join("/"));
    if trailing_slash && !resolved.ends_with('/') {
        resolved.push('/');
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_page_maps_to_ws() {
        let url = derive_endpoint("http://localhost:8888/", DEFAULT_WS_PATH).unwrap();
        assert_eq!(url, "ws://localhost:8888/ws/video");
        assert!(!is_secure(&url));
    }

    #[test]
    fn test_secure_page_maps_to_wss() {
        let url = derive_endpoint("https://example.com/index.html", DEFAULT_WS_PATH).unwrap();
        assert_eq!(url, "wss://example.com/ws/video");
        assert!(is_secure(&url));
    }

    #[test]
    fn test_page_without_path() {
        let url = derive_endpoint("http://10.0.0.5:8080", DEFAULT_WS_PATH).unwrap();
        assert_eq!(url, "ws://10.0.0.5:8080/ws/video");
    }

    #[test]
    fn test_relative_to_nested_page() {
        let url = derive_endpoint("https://example.com/app/view/index.html?cam=1#top", "./ws/video")
            .unwrap();
        assert_eq!(url, "wss://example.com/app/view/ws/video");

        let url = derive_endpoint("http://example.com/a/b/", "../ws").unwrap();
        assert_eq!(url, "ws://example.com/a/ws");

        let url = derive_endpoint("http://example.com/a/b/c.html", "/ws/video").unwrap();
        assert_eq!(url, "ws://example.com/ws/video");
    }

    #[test]
    fn test_dot_segments_never_escape_root() {
        let url = derive_endpoint("http://example.com/", "../../ws/video").unwrap();
        assert_eq!(url, "ws://example.com/ws/video");
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let err = derive_endpoint("ftp://example.com/", DEFAULT_WS_PATH).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ENDPOINT");

        let err = derive_endpoint("localhost:8888", DEFAULT_WS_PATH).unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ENDPOINT");
    }
}
