//! Static file serving with RFC 7232 conditional and RFC 7233 range
//! semantics, sandboxed under a canonical root directory.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tracing::debug;

use crate::body::Body;
use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;
use crate::router::RouteHandler;

/// Link encoding for directory listings: everything outside
/// `A-Za-z0-9-_.~` is escaped.
const LINK_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Resolves a file path to a `Content-Type`.
pub type ContentTypeResolver = Arc<dyn Fn(&Path) -> Option<String> + Send + Sync>;

/// Configuration for [`StaticFileHandler`].
#[derive(Clone)]
pub struct StaticFileConfig {
    pub root: PathBuf,
    /// File served when a directory is requested, e.g. `index.html`.
    pub default_index: Option<String>,
    pub enable_range: bool,
    pub enable_conditional: bool,
    pub emit_last_modified: bool,
    pub emit_etag: bool,
    pub default_content_type: String,
    pub content_type_resolver: Option<ContentTypeResolver>,
    pub directory_listing: bool,
    pub show_hidden: bool,
    pub max_listing_entries: usize,
}

impl std::fmt::Debug for StaticFileConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFileConfig")
            .field("root", &self.root)
            .field("default_index", &self.default_index)
            .field("enable_range", &self.enable_range)
            .field("enable_conditional", &self.enable_conditional)
            .field("directory_listing", &self.directory_listing)
            .field("show_hidden", &self.show_hidden)
            .finish()
    }
}

impl StaticFileConfig {
    pub fn new(root: impl Into<PathBuf>) -> StaticFileConfig {
        StaticFileConfig {
            root: root.into(),
            default_index: Some("index.html".to_owned()),
            enable_range: true,
            enable_conditional: true,
            emit_last_modified: true,
            emit_etag: true,
            default_content_type: "application/octet-stream".to_owned(),
            content_type_resolver: None,
            directory_listing: false,
            show_hidden: false,
            max_listing_entries: 1000,
        }
    }

    pub fn with_default_index(mut self, index: Option<String>) -> Self {
        self.default_index = index;
        self
    }

    pub fn with_range(mut self, on: bool) -> Self {
        self.enable_range = on;
        self
    }

    pub fn with_conditional(mut self, on: bool) -> Self {
        self.enable_conditional = on;
        self
    }

    pub fn with_last_modified(mut self, on: bool) -> Self {
        self.emit_last_modified = on;
        self
    }

    pub fn with_etag(mut self, on: bool) -> Self {
        self.emit_etag = on;
        self
    }

    pub fn with_default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_content_type = content_type.into();
        self
    }

    pub fn with_content_type_resolver(mut self, resolver: ContentTypeResolver) -> Self {
        self.content_type_resolver = Some(resolver);
        self
    }

    pub fn with_directory_listing(mut self, on: bool) -> Self {
        self.directory_listing = on;
        self
    }

    pub fn with_show_hidden(mut self, on: bool) -> Self {
        self.show_hidden = on;
        self
    }

    pub fn with_max_listing_entries(mut self, max: usize) -> Self {
        self.max_listing_entries = max;
        self
    }
}

/// Serves files from a sandboxed root.
pub struct StaticFileHandler {
    config: StaticFileConfig,
    root: PathBuf,
}

impl std::fmt::Debug for StaticFileHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticFileHandler")
            .field("root", &self.root)
            .finish()
    }
}

impl StaticFileHandler {
    /// Canonicalizes the root; a missing or non-directory root is a
    /// configuration error.
    pub fn new(config: StaticFileConfig) -> Result<StaticFileHandler> {
        let root = config
            .root
            .canonicalize()
            .map_err(|err| Error::new_config("static file root does not resolve").with(err))?;
        if !root.is_dir() {
            return Err(Error::new_config("static file root is not a directory"));
        }
        Ok(StaticFileHandler { config, root })
    }

    /// Wraps the handler for router registration.
    pub fn into_route(self) -> RouteHandler {
        let handler = Arc::new(self);
        RouteHandler::sync(move |req| handler.handle(req))
    }

    pub fn handle(&self, req: &Request) -> Response {
        match *req.method() {
            Method::GET | Method::HEAD => {}
            _ => {
                return with_header(
                    Response::error_status(StatusCode::METHOD_NOT_ALLOWED),
                    http::header::ALLOW,
                    HeaderValue::from_static("GET, HEAD"),
                );
            }
        }

        let raw_path = req.path();
        let Some(relative) = self.sanitize(raw_path) else {
            return Response::error_status(StatusCode::NOT_FOUND);
        };
        let target = self.root.join(&relative);

        let metadata = match fs::metadata(&target) {
            Ok(metadata) => metadata,
            Err(_) => return Response::error_status(StatusCode::NOT_FOUND),
        };

        if metadata.is_dir() {
            return self.serve_directory(req, raw_path, &target);
        }
        if !metadata.is_file() {
            return Response::error_status(StatusCode::NOT_FOUND);
        }
        self.serve_file(req, &target, &metadata)
    }

    /// Percent-decodes and validates the request path, rejecting `..`
    /// traversal and (optionally) hidden entries.
    fn sanitize(&self, path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        let mut sanitized = PathBuf::new();
        for segment in decoded.split('/') {
            if segment.is_empty() || segment == "." {
                continue;
            }
            if segment == ".." {
                debug!(path, "rejected traversal attempt");
                return None;
            }
            if segment.starts_with('.') && !self.config.show_hidden {
                return None;
            }
            sanitized.push(segment);
        }
        Some(sanitized)
    }

    fn serve_directory(&self, req: &Request, raw_path: &str, dir: &Path) -> Response {
        if let Some(ref index) = self.config.default_index {
            let candidate = dir.join(index);
            if let Ok(metadata) = fs::metadata(&candidate) {
                if metadata.is_file() {
                    return self.serve_file(req, &candidate, &metadata);
                }
            }
        }
        if self.config.directory_listing {
            if !raw_path.ends_with('/') {
                let location = format!("{}/", raw_path);
                return match HeaderValue::from_str(&location) {
                    Ok(value) => with_header(
                        Response::error_status(StatusCode::MOVED_PERMANENTLY),
                        http::header::LOCATION,
                        value,
                    ),
                    Err(_) => Response::error_status(StatusCode::NOT_FOUND),
                };
            }
            return self.render_listing(raw_path, dir);
        }
        Response::error_status(StatusCode::NOT_FOUND)
    }

    fn serve_file(&self, req: &Request, path: &Path, metadata: &fs::Metadata) -> Response {
        let file_size = metadata.len();
        let modified = metadata.modified().ok();
        let etag = if self.config.emit_etag {
            modified.map(|modified| strong_etag(file_size, modified))
        } else {
            None
        };

        if self.config.enable_conditional {
            if let Some(status) = evaluate_conditionals(req, etag.as_deref(), modified) {
                let mut response = Response::error_status(status);
                if status == StatusCode::NOT_MODIFIED {
                    response = Response::new(StatusCode::NOT_MODIFIED);
                    response = self.attach_validators(response, etag.as_deref(), modified);
                }
                return response;
            }
        }

        let range = if self.config.enable_range {
            match requested_range(req, file_size, etag.as_deref(), modified) {
                RangeOutcome::Full => None,
                RangeOutcome::Partial(start, len) => Some((start, len)),
                RangeOutcome::Unsatisfiable => {
                    let content_range = format!("bytes */{}", file_size);
                    let mut response =
                        Response::error_status(StatusCode::RANGE_NOT_SATISFIABLE);
                    if let Ok(value) = HeaderValue::from_str(&content_range) {
                        response = with_header(response, http::header::CONTENT_RANGE, value);
                    }
                    return response;
                }
            }
        } else {
            None
        };

        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "file open failed");
                return Response::error_status(StatusCode::NOT_FOUND);
            }
        };

        let mut response = match range {
            Some((start, len)) => {
                let content_range =
                    format!("bytes {}-{}/{}", start, start + len - 1, file_size);
                let mut response = Response::new(StatusCode::PARTIAL_CONTENT)
                    .with_body(Body::file_range(file, start, len));
                if let Ok(value) = HeaderValue::from_str(&content_range) {
                    response = with_header(response, http::header::CONTENT_RANGE, value);
                }
                response
            }
            None => Response::new(StatusCode::OK).with_body(Body::file_range(file, 0, file_size)),
        };

        response = with_header(
            response,
            http::header::ACCEPT_RANGES,
            HeaderValue::from_static("bytes"),
        );
        let content_type = self.resolve_content_type(path);
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response = with_header(response, http::header::CONTENT_TYPE, value);
        }
        self.attach_validators(response, etag.as_deref(), modified)
    }

    fn attach_validators(
        &self,
        mut response: Response,
        etag: Option<&str>,
        modified: Option<SystemTime>,
    ) -> Response {
        if let Some(etag) = etag {
            if let Ok(value) = HeaderValue::from_str(etag) {
                response = with_header(response, http::header::ETAG, value);
            }
        }
        if self.config.emit_last_modified {
            if let Some(modified) = modified {
                let formatted = httpdate::fmt_http_date(modified);
                if let Ok(value) = HeaderValue::from_str(&formatted) {
                    response = with_header(response, http::header::LAST_MODIFIED, value);
                }
            }
        }
        response
    }

    fn resolve_content_type(&self, path: &Path) -> String {
        if let Some(ref resolver) = self.config.content_type_resolver {
            if let Some(content_type) = resolver(path) {
                return content_type;
            }
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(mime_for_extension)
            .map(str::to_owned)
            .unwrap_or_else(|| self.config.default_content_type.clone())
    }

    fn render_listing(&self, raw_path: &str, dir: &Path) -> Response {
        let mut entries: Vec<ListingEntry> = Vec::new();
        let mut truncated = false;
        match fs::read_dir(dir) {
            Ok(iter) => {
                for entry in iter.flatten() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with('.') && !self.config.show_hidden {
                        continue;
                    }
                    if entries.len() >= self.config.max_listing_entries {
                        truncated = true;
                        break;
                    }
                    let metadata = entry.metadata().ok();
                    let is_dir = metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false);
                    entries.push(ListingEntry {
                        name,
                        is_dir,
                        size: metadata
                            .as_ref()
                            .filter(|m| m.is_file())
                            .map(|m| m.len()),
                        modified: metadata.and_then(|m| m.modified().ok()),
                    });
                }
            }
            Err(_) => return Response::error_status(StatusCode::NOT_FOUND),
        }
        // Directories first, then by name.
        entries.sort_by(|lhs, rhs| {
            rhs.is_dir.cmp(&lhs.is_dir).then_with(|| lhs.name.cmp(&rhs.name))
        });

        let mut html = String::with_capacity(512 + entries.len() * 128);
        let title = html_escape(raw_path);
        let _ = write!(
            html,
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
             <title>Index of {title}</title>\n\
             <style>body{{font-family:monospace}}th,td{{padding:0 1em;text-align:left}}\
             td.size,td.modified{{text-align:right}}</style>\n\
             </head>\n<body>\n<h1>Index of {title}</h1>\n<table>\n\
             <thead><tr><th>Name</th><th class=\"size\">Size</th>\
             <th class=\"modified\">Last Modified</th></tr></thead>\n<tbody>\n"
        );
        if raw_path != "/" {
            html.push_str(
                "<tr><td><a href=\"../\">../</a></td>\
                 <td class=\"size\">-</td><td class=\"modified\">-</td></tr>\n",
            );
        }
        for entry in &entries {
            let suffix = if entry.is_dir { "/" } else { "" };
            let href = utf8_percent_encode(&entry.name, LINK_ENCODE).to_string();
            let size = match entry.size {
                Some(size) if !entry.is_dir => format_size(size),
                _ => "-".to_owned(),
            };
            let modified = match entry.modified {
                Some(modified) => httpdate::fmt_http_date(modified),
                None => "-".to_owned(),
            };
            let _ = write!(
                html,
                "<tr><td><a href=\"{href}{suffix}\">{}{suffix}</a></td>\
                 <td class=\"size\">{size}</td><td class=\"modified\">{modified}</td></tr>\n",
                html_escape(&entry.name),
            );
        }
        html.push_str("</tbody>\n</table>\n");
        if truncated {
            html.push_str("<p>listing truncated</p>\n");
        }
        html.push_str("</body>\n</html>\n");
        Response::html(StatusCode::OK, html)
    }
}

struct ListingEntry {
    name: String,
    is_dir: bool,
    size: Option<u64>,
    modified: Option<SystemTime>,
}

/// Human-readable size in binary units: integer bytes below 1 KB, one
/// decimal place while the value is under 10, rounded integers above.
fn format_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut unit = 0;
    let mut divisor: u64 = 1;
    while unit + 1 < UNITS.len() && size >= divisor * 1024 {
        divisor *= 1024;
        unit += 1;
    }
    if unit == 0 {
        return format!("{} {}", size, UNITS[0]);
    }
    if size < divisor * 10 {
        let int_part = size / divisor;
        // One rounded fractional digit; 9.96 carries to the integer form.
        let frac = (size % divisor * 10 + divisor / 2) / divisor;
        let (int_part, frac) = if frac >= 10 { (int_part + 1, 0) } else { (int_part, frac) };
        if int_part >= 10 {
            return format!("{} {}", int_part, UNITS[unit]);
        }
        return format!("{}.{} {}", int_part, frac, UNITS[unit]);
    }
    format!("{} {}", (size + divisor / 2) / divisor, UNITS[unit])
}

fn with_header(response: Response, name: HeaderName, value: HeaderValue) -> Response {
    // None of the headers attached here are reserved.
    response.with_header(name, value).expect("static header is not reserved")
}

/// `"<size_hex>-<mtime_ns_hex>"`, a strong validator.
fn strong_etag(size: u64, modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    format!("\"{:x}-{:x}\"", size, nanos)
}

/// Evaluates RFC 7232 preconditions in specification order. Returns a
/// terminal status, or `None` to continue with the normal response.
fn evaluate_conditionals(
    req: &Request,
    etag: Option<&str>,
    modified: Option<SystemTime>,
) -> Option<StatusCode> {
    let headers = req.headers();

    if let Some(if_match) = headers.get_str("if-match") {
        let matched = if_match.trim() == "*"
            || etag.is_some_and(|etag| etag_list_matches(if_match, etag, true));
        if !matched {
            return Some(StatusCode::PRECONDITION_FAILED);
        }
    }

    if let Some(if_unmodified) = headers.get_str("if-unmodified-since") {
        if let (Ok(parsed), Some(modified)) = (httpdate::parse_http_date(if_unmodified), modified)
        {
            if truncate_to_seconds(modified) > parsed {
                return Some(StatusCode::PRECONDITION_FAILED);
            }
        }
    }

    if let Some(if_none_match) = headers.get_str("if-none-match") {
        let matched = if_none_match.trim() == "*" && etag.is_some()
            || etag.is_some_and(|etag| etag_list_matches(if_none_match, etag, false));
        if matched {
            // GET/HEAD only reach this point, so 304 is always right here.
            return Some(StatusCode::NOT_MODIFIED);
        }
        // If-None-Match being present suppresses If-Modified-Since.
        return None;
    }

    if let Some(if_modified) = headers.get_str("if-modified-since") {
        if let (Ok(parsed), Some(modified)) = (httpdate::parse_http_date(if_modified), modified) {
            if truncate_to_seconds(modified) <= parsed {
                return Some(StatusCode::NOT_MODIFIED);
            }
        }
    }

    None
}

/// Matches an entity-tag list against a target. Strong comparison refuses
/// weak validators; weak comparison ignores the `W/` prefix on both sides.
fn etag_list_matches(list: &str, target: &str, strong: bool) -> bool {
    list.split(',').any(|candidate| {
        let candidate = candidate.trim();
        if strong {
            candidate == target
        } else {
            candidate.strip_prefix("W/").unwrap_or(candidate)
                == target.strip_prefix("W/").unwrap_or(target)
        }
    })
}

/// HTTP dates carry one-second resolution.
fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => UNIX_EPOCH + std::time::Duration::from_secs(duration.as_secs()),
        Err(_) => time,
    }
}

enum RangeOutcome {
    Full,
    /// `(start, length)`, length > 0.
    Partial(u64, u64),
    Unsatisfiable,
}

/// Parses a single-range `Range: bytes=…` request, honoring `If-Range`.
fn requested_range(
    req: &Request,
    file_size: u64,
    etag: Option<&str>,
    modified: Option<SystemTime>,
) -> RangeOutcome {
    let Some(raw) = req.headers().get_str("range") else {
        return RangeOutcome::Full;
    };

    if let Some(if_range) = req.headers().get_str("if-range") {
        if !if_range_allows(if_range, etag, modified) {
            return RangeOutcome::Full;
        }
    }

    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Unsatisfiable;
    };
    if spec.contains(',') {
        // Multi-range is out of scope; a 416 tells the client to retry
        // without ranges.
        return RangeOutcome::Unsatisfiable;
    }
    if file_size == 0 {
        return RangeOutcome::Unsatisfiable;
    }

    let spec = spec.trim();
    let Some((start_text, end_text)) = spec.split_once('-') else {
        return RangeOutcome::Unsatisfiable;
    };

    if start_text.is_empty() {
        // Suffix form: last N bytes.
        let Ok(suffix) = end_text.parse::<u64>() else {
            return RangeOutcome::Unsatisfiable;
        };
        if suffix == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let len = suffix.min(file_size);
        return RangeOutcome::Partial(file_size - len, len);
    }

    let Ok(start) = start_text.parse::<u64>() else {
        return RangeOutcome::Unsatisfiable;
    };
    if start >= file_size {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if end_text.is_empty() {
        file_size - 1
    } else {
        match end_text.parse::<u64>() {
            Ok(end) if end >= start => end.min(file_size - 1),
            _ => return RangeOutcome::Unsatisfiable,
        }
    };
    RangeOutcome::Partial(start, end - start + 1)
}

/// Partial responses need the stored entity to match what the client has:
/// the token must equal the strong ETag, or the date must be no older than
/// the current modification time.
fn if_range_allows(if_range: &str, etag: Option<&str>, modified: Option<SystemTime>) -> bool {
    let if_range = if_range.trim();
    if if_range.starts_with('"') || if_range.starts_with("W/") {
        return etag.is_some_and(|etag| if_range == etag);
    }
    match (httpdate::parse_http_date(if_range), modified) {
        (Ok(parsed), Some(modified)) => parsed >= truncate_to_seconds(modified),
        _ => false,
    }
}

fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    Some(match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "text/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "csv" => "text/csv; charset=utf-8",
        "md" => "text/markdown; charset=utf-8",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "avif" => "image/avif",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "wasm" => "application/wasm",
        "gz" => "application/gzip",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        _ => return None,
    })
}
