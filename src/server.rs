/// Minimal HTTP/1.1 front end for the single submission endpoint.
///
/// One request per connection, handled sequentially; the supervisor is
/// single-tenant and the gate serializes admission anyway. Only the pieces
/// of HTTP this endpoint needs are implemented: a request line, headers, a
/// Content-Length body, and multipart/form-data decoding for the three
/// fields the endpoint accepts. Responses are always JSON.
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use tempfile::NamedTempFile;

use crate::gate::{GateStatus, RequestGate, Submission};
use crate::types::{Result, SandboxError};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 128 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpRequest {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Accept loop. Runs until the listener fails; per-request failures are
/// logged and answered with an `error` status where the socket still works.
pub fn serve(addr: &str, mut gate: RequestGate) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .map_err(|e| SandboxError::Config(format!("cannot listen on {}: {}", addr, e)))?;
    log::info!("listening on {}", addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(err) = handle_connection(&mut gate, stream) {
                    log::warn!("request handling failed: {}", err);
                }
            }
            Err(err) => log::warn!("accept failed: {}", err),
        }
    }
    Ok(())
}

fn handle_connection(gate: &mut RequestGate, mut stream: TcpStream) -> Result<()> {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            log::warn!("malformed request: {}", err);
            return write_response(&mut stream, GateStatus::Error);
        }
    };

    // The spool must outlive the gate call: the runner copies the upload
    // into the work directory before start() returns.
    let mut spool: Option<NamedTempFile> = None;
    let submission = if request.method == "POST" {
        match decode_submission(&request, &mut spool) {
            Ok(submission) => submission,
            Err(err) => {
                log::warn!("cannot spool upload: {}", err);
                return write_response(&mut stream, GateStatus::Error);
            }
        }
    } else {
        Submission::default()
    };

    let status = gate.handle(&request.method, &submission);
    write_response(&mut stream, status)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    // Headers first: read until the blank line, keeping whatever body bytes
    // arrived in the same chunks.
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n", 0) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(SandboxError::Process("request headers too large".to_string()));
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(SandboxError::Process("connection closed mid-request".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| SandboxError::Process("request head is not UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| SandboxError::Process("empty request".to_string()))?;
    let method = request_line
        .split_whitespace()
        .next()
        .ok_or_else(|| SandboxError::Process("malformed request line".to_string()))?
        .to_string();

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let request = HttpRequest {
        method,
        headers,
        body: Vec::new(),
    };

    let content_length: usize = request
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return Err(SandboxError::Process(format!(
            "request body too large: {} bytes",
            content_length
        )));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(SandboxError::Process("connection closed mid-body".to_string()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(HttpRequest { body, ..request })
}

fn write_response(stream: &mut TcpStream, status: GateStatus) -> Result<()> {
    let body = status.body();
    let head = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status.http_code(),
        status.reason(),
        body.len()
    );
    stream.write_all(head.as_bytes())?;
    stream.write_all(body.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Decode the multipart form into a Submission, spooling the `file` field to
/// a temp file. A request that does not decode to a file upload yields an
/// archive-less submission, which the gate answers with `bad_request`.
fn decode_submission(
    request: &HttpRequest,
    spool: &mut Option<NamedTempFile>,
) -> Result<Submission> {
    let mut submission = Submission::default();

    let Some(boundary) = request
        .header("content-type")
        .and_then(multipart_boundary)
    else {
        return Ok(submission);
    };

    let Some(fields) = parse_multipart(&request.body, &boundary) else {
        return Ok(submission);
    };

    for field in fields {
        match field.name.as_str() {
            "file" => {
                let mut file = NamedTempFile::new()?;
                file.write_all(&field.data)?;
                file.flush()?;
                submission.archive = Some(file.path().to_path_buf());
                *spool = Some(file);
            }
            "notify" => {
                submission.notify = Some(String::from_utf8_lossy(&field.data).into_owned())
            }
            "token" => {
                submission.token = Some(String::from_utf8_lossy(&field.data).into_owned())
            }
            other => log::debug!("ignoring unknown form field {}", other),
        }
    }

    Ok(submission)
}

pub(crate) struct MultipartField {
    pub name: String,
    pub data: Vec<u8>,
}

/// Extract the boundary parameter from a Content-Type header value.
pub(crate) fn multipart_boundary(content_type: &str) -> Option<String> {
    let (media_type, params) = content_type.split_once(';')?;
    if !media_type.trim().eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    for param in params.split(';') {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            return Some(value.trim().trim_matches('"').to_string());
        }
    }
    None
}

/// Decode the parts of a multipart/form-data body. Returns None when the
/// body does not follow the boundary framing.
pub(crate) fn parse_multipart(body: &[u8], boundary: &str) -> Option<Vec<MultipartField>> {
    let delimiter = format!("--{boundary}");
    let closing = format!("\r\n--{boundary}");
    let mut fields = Vec::new();

    let mut pos = find(body, delimiter.as_bytes(), 0)? + delimiter.len();
    loop {
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        }

        let headers_end = find(body, b"\r\n\r\n", pos)?;
        let headers = std::str::from_utf8(&body[pos..headers_end]).ok()?;
        let name = headers
            .lines()
            .find(|line| {
                line.to_ascii_lowercase()
                    .starts_with("content-disposition:")
            })
            .and_then(|line| disposition_param(line, "name"))?;

        let data_start = headers_end + 4;
        let data_end = find(body, closing.as_bytes(), data_start)?;
        fields.push(MultipartField {
            name,
            data: body[data_start..data_end].to_vec(),
        });
        pos = data_end + closing.len();
    }

    Some(fields)
}

fn disposition_param(line: &str, key: &str) -> Option<String> {
    let marker = format!("{key}=\"");
    let start = line.find(&marker)? + marker.len();
    let end = line[start..].find('"')? + start;
    Some(line[start..end].to_string())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}
