//! Request routing and capability handlers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::find::{find, FindOptions, MetaPredicate};
use wash_kernel::{Context, Entry, EntryRef, JournalId, Registry};
use wash_types::{EntryPath, ExecCommand, WashError};

type Body = BoxBody<Bytes, Infallible>;

/// Dispatch one request.
pub async fn handle(
    registry: Arc<Registry>,
    peer: SocketAddr,
    call_deadline: Duration,
    req: Request<Incoming>,
) -> Result<Response<Body>, Infallible> {
    let journal = req
        .headers()
        .get("wash-journal-id")
        .and_then(|v| v.to_str().ok())
        .map(JournalId::new)
        .unwrap_or_else(|| JournalId::new(format!("http-{}", peer.ip())));
    let ctx = Context::background()
        .with_timeout(call_deadline)
        .with_journal(journal);

    let method = req.method().clone();
    let uri_path = req.uri().path().to_string();
    let params = query_params(req.uri());
    debug!(%method, %uri_path, "control request");

    let response = match (method, uri_path.as_str()) {
        (Method::GET, "/fs/list") => fs_list(&registry, &ctx, &params).await,
        (Method::GET, "/fs/read") => fs_read(&registry, &ctx, &params).await,
        (Method::GET, "/fs/metadata") => fs_metadata(&registry, &ctx, &params).await,
        (Method::GET, "/fs/stream") => fs_stream(&registry, &ctx, &params).await,
        (Method::POST, "/fs/exec") => fs_exec(&registry, &ctx, &params, req).await,
        (Method::POST, "/fs/write") => fs_write(&registry, &ctx, &params, req).await,
        (Method::POST, "/fs/delete") => fs_delete(&registry, &ctx, &params).await,
        (Method::POST, "/fs/signal") => fs_signal(&registry, &ctx, &params).await,
        (Method::GET, "/find") => find_entries(&registry, &ctx, &params).await,
        (Method::GET, "/tail") => tail_entries(&registry, &ctx, &params).await,
        (Method::GET, "/history") => history_list(&registry),
        (Method::GET, path) if path.starts_with("/history/") => {
            history_read(&registry, &path["/history/".len()..])
        }
        (Method::POST, "/cache/clear") => cache_clear(&registry, &params),
        _ => Ok(plain(StatusCode::NOT_FOUND, "no such endpoint\n")),
    };

    Ok(response.unwrap_or_else(|e| error_response(&e)))
}

// ============================================================
// Capability endpoints
// ============================================================

/// What the JSON endpoints say about an entry.
#[derive(Debug, Serialize)]
struct EntryView {
    name: String,
    path: String,
    actions: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtime: Option<u64>,
}

fn entry_view(entry: &EntryRef) -> EntryView {
    let attr = entry.attributes();
    EntryView {
        name: entry.name().to_string(),
        path: entry.path().to_string(),
        actions: entry.supported_actions().names(),
        size: attr.size,
        mtime: attr
            .mtime
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs()),
    }
}

async fn fs_list(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let entry = registry.resolve(ctx, &path).await?;
    let children = registry.list(ctx, &entry).await?;
    let views: Vec<EntryView> = children.iter().map(entry_view).collect();
    Ok(json(StatusCode::OK, &views))
}

async fn fs_read(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let entry = registry.resolve(ctx, &path).await?;
    let data = registry.read(ctx, &entry).await?;
    Ok(octets(StatusCode::OK, data))
}

async fn fs_metadata(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let entry = registry.resolve(ctx, &path).await?;
    let metadata = registry.metadata(ctx, &entry).await?;
    Ok(json(StatusCode::OK, &*metadata))
}

async fn fs_stream(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let entry = registry.resolve(ctx, &path).await?;
    let handle = registry.stream(ctx, &entry).await?;

    // Chunked pass-through: each read becomes one frame; EOF or a read
    // error closes the handle (releasing the plugin subprocess).
    let body = stream::unfold(Some(handle), |state| async move {
        let mut handle = state?;
        let mut buf = vec![0u8; 8192];
        match handle.reader().read(&mut buf).await {
            Ok(0) | Err(_) => {
                handle.close();
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some((
                    Ok::<_, Infallible>(Frame::data(Bytes::from(buf))),
                    Some(handle),
                ))
            }
        }
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/octet-stream")
        .body(BoxBody::new(StreamBody::new(body)))
        .expect("static response construction");
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// Base64-encoded stdin for the remote command.
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    tty: bool,
}

#[derive(Debug, Serialize)]
struct ExecResponse {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

async fn fs_exec(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
    req: Request<Incoming>,
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let body = read_body(req).await?;
    let exec_req: ExecRequest = serde_json::from_slice(&body)
        .map_err(|e| WashError::Transient(format!("invalid exec request body: {}", e)))?;

    let stdin = match &exec_req.stdin {
        Some(encoded) => Some(Bytes::from(BASE64.decode(encoded).map_err(|e| {
            WashError::Transient(format!("exec stdin is not valid base64: {}", e))
        })?)),
        None => None,
    };
    let cmd = ExecCommand {
        command: exec_req.command,
        args: exec_req.args,
        stdin,
        tty: exec_req.tty,
    };

    let entry = registry.resolve(ctx, &path).await?;
    let outcome = registry.exec(ctx, &entry, cmd).await?;
    Ok(json(
        StatusCode::OK,
        &ExecResponse {
            exit_code: outcome.exit_code,
            stdout: String::from_utf8_lossy(&outcome.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&outcome.stderr).into_owned(),
        },
    ))
}

async fn fs_write(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
    req: Request<Incoming>,
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let body = read_body(req).await?;
    let entry = registry.resolve(ctx, &path).await?;
    registry.write(ctx, &entry, body).await?;
    Ok(empty(StatusCode::NO_CONTENT))
}

async fn fs_delete(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let entry = registry.resolve(ctx, &path).await?;
    registry.delete(ctx, &entry).await?;
    Ok(empty(StatusCode::NO_CONTENT))
}

async fn fs_signal(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let signal = param(params, "signal")
        .ok_or_else(|| WashError::Transient("missing signal parameter".into()))?;
    let entry = registry.resolve(ctx, &path).await?;
    registry.signal(ctx, &entry, &signal).await?;
    Ok(empty(StatusCode::NO_CONTENT))
}

// ============================================================
// find / history / cache
// ============================================================

async fn find_entries(
    registry: &Registry,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;

    let mut options = FindOptions::default();
    if let Some(depth) = param(params, "maxdepth") {
        options.maxdepth = Some(depth.parse().map_err(|_| {
            WashError::Transient(format!("maxdepth {:?} is not an integer", depth))
        })?);
    }
    if let Some(pattern) = param(params, "name") {
        options.name = Some(regex::Regex::new(&pattern).map_err(|e| {
            WashError::Transient(format!("invalid name pattern: {}", e))
        })?);
    }
    for (key, value) in params {
        if let Some(meta_key) = key.strip_prefix("meta.") {
            options.meta.push(MetaPredicate {
                key: meta_key.to_string(),
                value: value.clone(),
            });
        }
    }

    let matches = find(ctx, registry, &path, &options).await?;
    let views: Vec<EntryView> = matches.iter().map(entry_view).collect();
    Ok(json(StatusCode::OK, &views))
}

async fn tail_entries(
    registry: &Arc<Registry>,
    ctx: &Context,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let paths: Vec<EntryPath> = params
        .iter()
        .filter(|(key, _)| key == "path")
        .map(|(_, value)| EntryPath::parse(value))
        .collect();
    if paths.is_empty() {
        return Err(WashError::Transient("missing path parameter".into()));
    }

    // The multiplexer writes into a duplex pipe; the read half becomes the
    // chunked response body. A disconnecting client breaks the pipe, which
    // ends the tail task and releases its streams.
    let (mut writer, reader) = tokio::io::duplex(8192);
    let registry = registry.clone();
    // Following has no deadline: it runs until the client disconnects.
    let mut task_ctx = Context::background();
    if let Some(id) = ctx.journal() {
        task_ctx = task_ctx.with_journal(id.clone());
    }
    tokio::spawn(async move {
        if let Err(e) = crate::tail::tail(&task_ctx, &registry, &paths, &mut writer).await {
            debug!("tail ended: {}", e);
        }
    });

    let body = stream::unfold(Some(reader), |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; 8192];
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((
                    Ok::<_, Infallible>(Frame::data(Bytes::from(buf))),
                    Some(reader),
                ))
            }
        }
    });
    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .body(BoxBody::new(StreamBody::new(body)))
        .expect("static response construction");
    Ok(response)
}

fn history_list(registry: &Registry) -> Result<Response<Body>, WashError> {
    let infos = registry
        .journal()
        .list()
        .map_err(|e| WashError::Transient(format!("failed to enumerate journals: {}", e)))?;
    Ok(json(StatusCode::OK, &infos))
}

fn history_read(registry: &Registry, id: &str) -> Result<Response<Body>, WashError> {
    let id = JournalId::new(id);
    match registry.journal().read(&id) {
        Ok(content) => Ok(plain(StatusCode::OK, content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(plain(
            StatusCode::NOT_FOUND,
            format!("no journal named {}\n", id),
        )),
        Err(e) => Err(WashError::Transient(format!(
            "failed to read journal: {}",
            e
        ))),
    }
}

fn cache_clear(
    registry: &Registry,
    params: &[(String, String)],
) -> Result<Response<Body>, WashError> {
    let path = require_path(params)?;
    let cleared = registry.clear(&path);
    Ok(json(StatusCode::OK, &serde_json::json!({ "cleared": cleared })))
}

// ============================================================
// Plumbing
// ============================================================

fn require_path(params: &[(String, String)]) -> Result<EntryPath, WashError> {
    param(params, "path")
        .map(|p| EntryPath::parse(&p))
        .ok_or_else(|| WashError::Transient("missing path parameter".into()))
}

fn param(params: &[(String, String)], name: &str) -> Option<String> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

fn query_params(uri: &hyper::Uri) -> Vec<(String, String)> {
    let Some(query) = uri.query() else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (url_decode(key), url_decode(value)),
            None => (url_decode(pair), String::new()),
        })
        .collect()
}

fn url_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'+' => out.push(b' '),
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                    (Some(h), Some(l)) => out.push(h << 4 | l),
                    _ => {
                        // Malformed escape passes through untouched.
                        out.push(b'%');
                        out.extend(hi);
                        out.extend(lo);
                    }
                }
            }
            other => out.push(other),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, WashError> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| WashError::Transient(format!("failed to read request body: {}", e)))
}

/// Map the error taxonomy onto HTTP status codes.
fn status_for(err: &WashError) -> StatusCode {
    match err {
        WashError::NotFound(_) => StatusCode::NOT_FOUND,
        WashError::CapabilityUnsupported { .. } => StatusCode::METHOD_NOT_ALLOWED,
        WashError::Decode(_) => StatusCode::BAD_GATEWAY,
        WashError::Plugin(_) => StatusCode::INTERNAL_SERVER_ERROR,
        // 499: client closed request, the conventional cancellation status.
        WashError::Cancelled => StatusCode::from_u16(499).expect("static status"),
        WashError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: &WashError) -> Response<Body> {
    json(
        status_for(err),
        &serde_json::json!({
            "error": err.to_string(),
            "category": err.category(),
        }),
    )
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(Bytes::from(body)))
        .expect("static response construction")
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(full(Bytes::from(body.into())))
        .expect("static response construction")
}

fn octets(status: StatusCode, body: Bytes) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/octet-stream")
        .body(full(body))
        .expect("static response construction")
}

fn empty(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(full(Bytes::new()))
        .expect("static response construction")
}

fn full(bytes: Bytes) -> Body {
    BoxBody::new(Full::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("a%2Fb"), "a/b");
        assert_eq!(url_decode("hello+world"), "hello world");
        assert_eq!(url_decode("plain"), "plain");
        assert_eq!(url_decode("broken%2"), "broken%2");
        assert_eq!(url_decode("%zz"), "%zz");
    }

    #[test]
    fn test_query_params() {
        let uri: hyper::Uri = "/find?path=%2Fdocker&maxdepth=2&meta.state=running"
            .parse()
            .unwrap();
        let params = query_params(&uri);
        assert_eq!(param(&params, "path").as_deref(), Some("/docker"));
        assert_eq!(param(&params, "maxdepth").as_deref(), Some("2"));
        assert_eq!(param(&params, "meta.state").as_deref(), Some("running"));
        assert_eq!(param(&params, "missing"), None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&WashError::NotFound(EntryPath::root())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&WashError::CapabilityUnsupported {
                path: EntryPath::root(),
                action: wash_types::Action::Exec,
            }),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(status_for(&WashError::Decode("x".into())), StatusCode::BAD_GATEWAY);
        assert_eq!(
            status_for(&WashError::Plugin("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(status_for(&WashError::Cancelled).as_u16(), 499);
        assert_eq!(
            status_for(&WashError::Transient("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
