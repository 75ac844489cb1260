//! HTTP fetch through the overlay.
//!
//! Validates and rewrites overlay URLs, screens the HTTP method, then
//! resolves the name, opens a stream to the device, and performs one
//! minimal HTTP/1.1 exchange over it. URL and method screening happen
//! before any session is started.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use weft_common::base58;
use weft_common::types::BlockHeader;

use crate::blocks::MemoryBlockStore;
use crate::calls::CallError;
use crate::config::ClientConfig;
use crate::session::Session;
use crate::trace::ClientTrace;

/// Overlay name suffixes, longest first so `name.weft.link` is not
/// mistaken for a device called `name.weft` under `link`.
pub const OVERLAY_SUFFIXES: &[&str] = &["weft.link", "weft.ws", "weft"];

/// Errors from the fetch front-end, each with a distinct exit code.
#[derive(Debug, Error)]
pub enum FetchError {
    /// No URL given.
    #[error("request URL is required")]
    UrlRequired,
    /// The URL does not name an overlay destination.
    #[error("please use curl for good old web2 sites")]
    Web2Url,
    /// The HTTP method is not in the allowed set.
    #[error("http method was not allowed")]
    MethodNotAllowed,
    /// Name resolution returned no devices.
    #[error("no device found for {0}")]
    NoDevice(String),
    /// The client configuration could not be resolved.
    #[error("configuration error: {0}")]
    Config(String),
    /// An RPC failed.
    #[error(transparent)]
    Rpc(#[from] CallError),
    /// The overlay transport failed.
    #[error("transport error: {0}")]
    Transport(std::io::Error),
    /// Writing the response locally failed.
    #[error("cannot write output: {0}")]
    Output(std::io::Error),
}

impl FetchError {
    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UrlRequired | Self::Web2Url => 2,
            Self::MethodNotAllowed => 3,
            Self::NoDevice(_) => 4,
            Self::Config(_) | Self::Rpc(_) | Self::Transport(_) => 5,
            Self::Output(_) => 6,
        }
    }
}

/// A validated overlay URL.
#[derive(Debug, PartialEq, Eq)]
pub struct OverlayUrl {
    /// Effective scheme after rewriting (`weft://` becomes `http`).
    pub scheme: &'static str,
    /// Full overlay host, `<name>.<suffix>`.
    pub host: String,
    /// The name part, without the suffix.
    pub name: String,
    /// Destination port (defaults: http 80, https 443).
    pub port: u16,
}

/// Parses and rewrites an overlay URL.
///
/// The accepted shape is `<scheme>://<name>.<suffix>[:<port>]` with
/// `scheme ∈ {http, https, weft}`; anything else is a web2 URL and is
/// rejected.
///
/// # Errors
///
/// [`FetchError::UrlRequired`] for an empty URL, [`FetchError::Web2Url`]
/// for everything that does not match the overlay shape.
pub fn parse_overlay_url(url: &str) -> Result<OverlayUrl, FetchError> {
    if url.is_empty() {
        return Err(FetchError::UrlRequired);
    }
    let (scheme, rest) = url.split_once("://").ok_or(FetchError::Web2Url)?;
    let scheme = match scheme {
        // weft:// is sugar for plain http through the overlay
        "http" | "weft" => "http",
        "https" => "https",
        _ => return Err(FetchError::Web2Url),
    };
    if rest.is_empty() || rest.contains('/') {
        return Err(FetchError::Web2Url);
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| FetchError::Web2Url)?;
            (host, port)
        }
        None => (rest, if scheme == "https" { 443 } else { 80 }),
    };
    let name = OVERLAY_SUFFIXES
        .iter()
        .find_map(|suffix| {
            host.strip_suffix(suffix)
                .and_then(|prefix| prefix.strip_suffix('.'))
        })
        .ok_or(FetchError::Web2Url)?;
    if name.is_empty() {
        return Err(FetchError::Web2Url);
    }
    Ok(OverlayUrl {
        scheme,
        host: host.to_string(),
        name: name.to_string(),
        port,
    })
}

/// Uppercases and screens the HTTP method.
///
/// # Errors
///
/// [`FetchError::MethodNotAllowed`] for anything outside the allowed
/// set. PATCH is recognized but rejected.
pub fn normalize_method(method: &str) -> Result<String, FetchError> {
    let upper = method.to_uppercase();
    match upper.as_str() {
        "GET" | "POST" | "PUT" | "DELETE" | "OPTION" => Ok(upper),
        _ => Err(FetchError::MethodNotAllowed),
    }
}

/// One fetch invocation.
pub struct FetchRequest {
    /// HTTP method.
    pub method: String,
    /// Request body.
    pub data: String,
    /// Extra headers, `name: value`.
    pub headers: Vec<String>,
    /// The overlay URL.
    pub url: String,
    /// Response body destination; stdout when unset.
    pub output: Option<PathBuf>,
    /// Print connection details to stderr.
    pub verbose: bool,
}

fn verbose_trace(verbose: bool) -> ClientTrace {
    if !verbose {
        return ClientTrace::default();
    }
    ClientTrace {
        bns_done: Some(Box::new(|tickets| {
            for ticket in tickets {
                eprintln!(
                    "Found device {} connected to {}",
                    base58::encode(&ticket.device_id),
                    ticket.node
                );
            }
        })),
        got_conn: Some(Box::new(|device, port| {
            eprintln!("Connected to {} {}", base58::encode(device), port);
        })),
        e2e_handshake_start: Some(Box::new(|device| {
            eprintln!("Start E2E handshake to {}", base58::encode(device));
        })),
        e2e_handshake_done: Some(Box::new(|device, error| match error {
            Some(error) => eprintln!(
                "Failed E2E handshake to {} {}",
                base58::encode(device),
                error
            ),
            None => eprintln!("Finish E2E handshake to {}", base58::encode(device)),
        })),
    }
}

fn request_head(method: &str, url: &OverlayUrl, headers: &[String], body_len: usize) -> String {
    let mut head = format!(
        "{method} / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
        url.host
    );
    if body_len > 0 {
        head.push_str(&format!("Content-Length: {body_len}\r\n"));
    }
    for header in headers {
        // there might be : sep in value
        if let Some((name, value)) = header.split_once(':') {
            head.push_str(&format!("{}: {}\r\n", name.trim(), value.trim()));
        }
    }
    head.push_str("\r\n");
    head
}

fn response_body(response: &[u8]) -> &[u8] {
    response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map_or(response, |at| &response[at + 4..])
}

/// Makes one HTTP request through the overlay.
///
/// # Errors
///
/// See [`FetchError`]; the variant's `exit_code` is the process exit
/// status.
pub async fn run_fetch(config: &ClientConfig, request: FetchRequest) -> Result<(), FetchError> {
    // Reject bad input before any session is started.
    let url = parse_overlay_url(&request.url)?;
    let method = normalize_method(&request.method)?;

    let session_config = config
        .session_config()
        .map_err(|e| FetchError::Config(e.to_string()))?;
    let connector = config
        .connector()
        .map_err(|e| FetchError::Config(e.to_string()))?;
    let store = Arc::new(MemoryBlockStore::new(BlockHeader {
        number: 0,
        hash: [0; 32],
        parent: [0; 32],
    }));
    let session = Session::connect(
        session_config,
        connector,
        store,
        verbose_trace(request.verbose),
    )
    .await
    .map_err(FetchError::Transport)?;
    session.start();

    let result = fetch_over(&session, &url, &method, &request).await;
    session.close().await;
    session.wait().await;
    result
}

async fn fetch_over(
    session: &Session,
    url: &OverlayUrl,
    method: &str,
    request: &FetchRequest,
) -> Result<(), FetchError> {
    let tickets = session.resolve_bns(&url.host).await?;
    let Some(ticket) = tickets.first() else {
        return Err(FetchError::NoDevice(url.host.clone()));
    };

    let mut stream = session.open_stream(ticket.device_id, url.port).await?;
    let head = request_head(method, url, &request.headers, request.data.len());
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(FetchError::Transport)?;
    if !request.data.is_empty() {
        stream
            .write_all(request.data.as_bytes())
            .await
            .map_err(FetchError::Transport)?;
    }

    let mut response = Vec::new();
    while let Some(chunk) = stream.read_chunk().await {
        response.extend_from_slice(&chunk);
    }
    stream.close().await;
    info!(bytes = response.len(), host = %url.host, "fetch complete");

    let body = response_body(&response);
    match &request.output {
        Some(path) => {
            std::fs::write(path, body).map_err(FetchError::Output)?;
            if request.verbose {
                eprintln!("Wrote {} bytes to {}", body.len(), path.display());
            }
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(body).map_err(FetchError::Output)?;
            stdout.write_all(b"\n").map_err(FetchError::Output)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_web2_url_is_rejected() {
        assert!(matches!(
            parse_overlay_url("https://example.com/"),
            Err(FetchError::Web2Url)
        ));
        assert!(matches!(
            parse_overlay_url("https://example.com"),
            Err(FetchError::Web2Url)
        ));
    }

    #[test]
    fn empty_url_is_required_error() {
        assert!(matches!(
            parse_overlay_url(""),
            Err(FetchError::UrlRequired)
        ));
    }

    #[test]
    fn weft_scheme_rewrites_to_http() {
        let url = parse_overlay_url("weft://myname.weft").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.name, "myname");
        assert_eq!(url.host, "myname.weft");
        assert_eq!(url.port, 80);
    }

    #[test]
    fn https_defaults_to_port_443() {
        let url = parse_overlay_url("https://myname.weft.link").unwrap();
        assert_eq!(url.scheme, "https");
        assert_eq!(url.port, 443);
    }

    #[test]
    fn explicit_port_is_honored() {
        let url = parse_overlay_url("http://myname.weft.ws:8080").unwrap();
        assert_eq!(url.port, 8080);
        assert_eq!(url.name, "myname");
    }

    #[test]
    fn url_with_path_is_rejected() {
        assert!(matches!(
            parse_overlay_url("http://myname.weft/index.html"),
            Err(FetchError::Web2Url)
        ));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(matches!(
            parse_overlay_url("ftp://myname.weft"),
            Err(FetchError::Web2Url)
        ));
    }

    #[test]
    fn bare_suffix_is_rejected() {
        assert!(matches!(
            parse_overlay_url("http://weft"),
            Err(FetchError::Web2Url)
        ));
        assert!(matches!(
            parse_overlay_url("http://.weft"),
            Err(FetchError::Web2Url)
        ));
    }

    #[test]
    fn allowed_methods_are_normalized() {
        for method in ["get", "POST", "Put", "delete", "option"] {
            assert!(normalize_method(method).is_ok(), "{method} should pass");
        }
        assert_eq!(normalize_method("get").unwrap(), "GET");
    }

    #[test]
    fn patch_is_recognized_but_rejected() {
        assert!(matches!(
            normalize_method("PATCH"),
            Err(FetchError::MethodNotAllowed)
        ));
        assert!(matches!(
            normalize_method("BREW"),
            Err(FetchError::MethodNotAllowed)
        ));
    }

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        assert_eq!(FetchError::UrlRequired.exit_code(), 2);
        assert_eq!(FetchError::Web2Url.exit_code(), 2);
        assert_eq!(FetchError::MethodNotAllowed.exit_code(), 3);
        assert_eq!(FetchError::NoDevice("x.weft".into()).exit_code(), 4);
        assert_eq!(
            FetchError::Rpc(CallError::Rpc("boom".into())).exit_code(),
            5
        );
    }

    #[test]
    fn request_head_includes_host_and_headers() {
        let url = parse_overlay_url("http://myname.weft").unwrap();
        let head = request_head(
            "POST",
            &url,
            &["content-type: application/json".to_string()],
            12,
        );
        assert!(head.starts_with("POST / HTTP/1.1\r\n"));
        assert!(head.contains("Host: myname.weft\r\n"));
        assert!(head.contains("Content-Length: 12\r\n"));
        assert!(head.contains("content-type: application/json\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn response_body_splits_after_header_block() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(response_body(raw), b"hello");
        assert_eq!(response_body(b"no header block"), b"no header block");
    }
}
