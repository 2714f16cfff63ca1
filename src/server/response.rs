//! HTTP reply helpers.

use std::path::Path;

use tiny_http::{Header, Request, Response, StatusCode};

use crate::error::RspError;
use crate::log;
use crate::logger::is_dev_mode;
use crate::template::escape_html;
use crate::util::mime;

const ERR_BODY_404: &str = "<html><body><h1>404 not found</h1></body></html>\n";
const ERR_BODY_500: &str = "<html><body><h1>500 internal server error</h1></body></html>\n";

pub fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("static header")
}

/// 200 with a file's contents and guessed content type.
pub fn reply_file(request: Request, path: &Path) -> std::io::Result<()> {
    let body = std::fs::read(path)?;
    let response = Response::from_data(body)
        .with_header(header("Content-Type", mime::from_path(path)));
    request.respond(response)
}

pub fn reply_html(request: Request, status: u16, body: String) -> std::io::Result<()> {
    let response = Response::from_string(body)
        .with_status_code(StatusCode(status))
        .with_header(header("Content-Type", mime::types::HTML));
    request.respond(response)
}

pub fn reply_not_found(request: Request) -> std::io::Result<()> {
    reply_html(request, 404, ERR_BODY_404.to_string())
}

/// 500; in development mode the body carries the message and any
/// multi-line diagnostics.
pub fn reply_error(request: Request, err: &RspError) -> std::io::Result<()> {
    log!("error"; "500 internal server error: {}", err);

    let body = if is_dev_mode() {
        format!(
            "<html><body><h1>500 internal server error</h1>\
             <pre style='white-space:pre-wrap'>{}\n\n{}\n</pre></body></html>\n",
            escape_html(&err.to_string()),
            escape_html(err.details().unwrap_or_default()),
        )
    } else {
        ERR_BODY_500.to_string()
    };

    reply_html(request, 500, body)
}

/// 301 to `location`, preserving the query string.
pub fn reply_redirect(request: Request, location: &str) -> std::io::Result<()> {
    let location = match request.url().split_once('?') {
        Some((_, q)) => format!("{location}?{q}"),
        None => location.to_string(),
    };
    let response = Response::empty(StatusCode(301)).with_header(header("Location", &location));
    request.respond(response)
}
