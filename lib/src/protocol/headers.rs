//! A pragmatic header block parser.
//!
//! The whole accumulated buffer is rescanned on every call, so feeding a
//! message in pieces and parsing after each piece ends up with exactly the
//! same result as parsing it in one go. This is not an RFC 7230 parser:
//! obsolete line folding, trailers and the like are not handled.
use memchr::memmem;

const HEADER_END: &[u8] = b"\r\n\r\n";
const LINE_END: &[u8] = b"\r\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// 0 for requests
    status_code: u16,
    /// in arrival order, names are case sensitive
    fields: Vec<(String, String)>,
    body_offset: Option<usize>,
}

impl Headers {
    /// Parses the header block at the start of `buffer`.
    ///
    /// Returns `false` while the `\r\n\r\n` terminator has not been seen,
    /// in which case the headers stay cleared.
    pub fn parse(&mut self, buffer: &[u8]) -> bool {
        self.clear();

        let Some(end) = memmem::find(buffer, HEADER_END) else {
            return false;
        };

        if buffer.starts_with(super::RESPONSE_PREFIX) {
            self.status_code = buffer
                .get(9..12)
                .and_then(|code| std::str::from_utf8(code).ok())
                .and_then(|code| code.parse().ok())
                .unwrap_or(0);
        }

        // the request or status line is not a header
        let mut position = match memmem::find(buffer, LINE_END) {
            Some(first_line_end) => first_line_end + LINE_END.len(),
            None => return false,
        };

        while position < end + LINE_END.len() {
            let line_end = match memmem::find(&buffer[position..], LINE_END) {
                Some(offset) => position + offset,
                None => break,
            };
            if let Some(field) = split_field(&buffer[position..line_end]) {
                self.fields.push(field);
            }
            position = line_end + LINE_END.len();
        }

        self.body_offset = Some(end + HEADER_END.len());
        true
    }

    /// true once a complete header block was parsed
    pub fn is_ok(&self) -> bool {
        self.body_offset.is_some()
    }

    pub fn clear(&mut self) {
        self.status_code = 0;
        self.fields.clear();
        self.body_offset = None;
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn body_offset(&self) -> Option<usize> {
        self.body_offset
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// removes every occurrence, returns the first value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let mut removed = None;
        self.fields.retain(|(field, value)| {
            if field != name {
                return true;
            }
            if removed.is_none() {
                removed = Some(value.clone());
            }
            false
        });
        removed
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.fields.push((name.to_owned(), value.to_owned()));
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get("Content-Length")
            .and_then(|value| value.trim().parse().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map(|value| value.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }

    /// `Connection: close` or `Proxy-Connection: close` disable keep-alive
    pub fn keep_alive(&self) -> bool {
        ["Connection", "Proxy-Connection"]
            .iter()
            .filter_map(|name| self.get(name))
            .all(|value| !value.trim().eq_ignore_ascii_case("close"))
    }

    /// responses that never carry a body
    pub fn finished_by_status_code(&self) -> bool {
        matches!(self.status_code, 100..=199 | 204 | 304)
    }

    /// appends `Name: value\r\n` for every field, then the empty line
    pub fn write_fields(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.fields {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(LINE_END);
        }
        out.extend_from_slice(LINE_END);
    }
}

/// Looks for the end of a header block in `buffer`, knowing that none ends
/// before `scanned`. Returns the offset of the body.
pub fn find_header_end(buffer: &[u8], scanned: usize) -> Option<usize> {
    // the terminator may straddle the already scanned part
    let from = scanned.saturating_sub(HEADER_END.len() - 1).min(buffer.len());
    memmem::find(&buffer[from..], HEADER_END).map(|offset| from + offset + HEADER_END.len())
}

/// Splits on the first `": "`, or on the first `:` followed by optional
/// whitespace. Lines without a colon are skipped.
fn split_field(line: &[u8]) -> Option<(String, String)> {
    let (name, value) = match memmem::find(line, b": ") {
        Some(colon) => (&line[..colon], &line[colon + 2..]),
        None => {
            let colon = memchr::memchr(b':', line)?;
            let value = &line[colon + 1..];
            let start = value
                .iter()
                .position(|byte| !byte.is_ascii_whitespace())
                .unwrap_or(value.len());
            (&line[..colon], &value[start..])
        }
    };
    Some((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

/// Splits `host[:port]` on its last colon.
///
/// Bracketed IPv6 literals lose their brackets, a bare IPv6 literal is taken
/// as a host without port. Returns `None` for an empty host or a port that
/// is not a number.
pub fn split_host(authority: &str, default_port: u16) -> Option<(String, u16)> {
    let authority = authority.trim();

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        return (!host.is_empty()).then(|| (host.to_owned(), port));
    }

    let (host, port) = match authority.rsplit_once(':') {
        // more than one colon without brackets, an IPv6 literal
        Some((host, _)) if host.contains(':') => (authority, default_port),
        Some((host, port)) => (host, port.parse().ok()?),
        None => (authority, default_port),
    };

    (!host.is_empty()).then(|| (host.to_owned(), port))
}

/// The authority of an absolute-form target, `GET http://host:8080/ HTTP/1.1`
pub fn absolute_authority(request_line: &str) -> Option<&str> {
    let target = request_line.split(' ').nth(1)?;
    let rest = strip_http_scheme(target)?;
    let end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Rewrites an absolute-form request line to origin form:
/// `GET http://example.com/a?b HTTP/1.1` becomes `GET /a?b HTTP/1.1`.
/// Other lines are returned unchanged.
pub fn to_origin_form(request_line: &str) -> String {
    let mut parts = request_line.splitn(3, ' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return request_line.to_owned();
    };

    let Some(rest) = strip_http_scheme(target) else {
        return request_line.to_owned();
    };

    let path = match rest.find(|c: char| c == '/' || c == '?') {
        Some(start) if rest[start..].starts_with('/') => rest[start..].to_owned(),
        Some(start) => format!("/{}", &rest[start..]),
        None => "/".to_owned(),
    };
    format!("{method} {path} {version}")
}

fn strip_http_scheme(target: &str) -> Option<&str> {
    let scheme = target.get(..7)?;
    scheme
        .eq_ignore_ascii_case("http://")
        .then(|| &target[7..])
}

#[cfg(test)]
mod tests {
    use quickcheck::{QuickCheck, TestResult};

    use super::*;

    #[test]
    fn parse_request() {
        let mut headers = Headers::default();
        let buffer = b"POST /upload HTTP/1.1\r\nHost: example.com\r\nContent-Length: 5\r\n\r\nhello";

        assert!(headers.parse(buffer));
        assert!(headers.is_ok());
        assert_eq!(headers.status_code(), 0);
        assert_eq!(headers.get("Host"), Some("example.com"));
        assert_eq!(headers.get("host"), None);
        assert_eq!(headers.content_length(), Some(5));
        assert_eq!(headers.body_offset(), Some(buffer.len() - 5));
    }

    #[test]
    fn incomplete_block() {
        let mut headers = Headers::default();
        assert!(!headers.parse(b"GET / HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(!headers.is_ok());
        assert_eq!(headers.get("Host"), None);
    }

    #[test]
    fn request_without_fields() {
        let mut headers = Headers::default();
        let buffer = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        assert!(headers.parse(buffer));
        assert!(headers.is_ok());
        assert_eq!(headers.fields().count(), 0);
        assert_eq!(headers.body_offset(), Some(buffer.len()));
    }

    #[test]
    fn parse_response() {
        let mut headers = Headers::default();
        assert!(headers.parse(b"HTTP/1.1 304 Not Modified\r\nETag: \"x\"\r\n\r\n"));
        assert_eq!(headers.status_code(), 304);
        assert!(headers.finished_by_status_code());

        assert!(headers.parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, Chunked\r\n\r\n"));
        assert_eq!(headers.status_code(), 200);
        assert!(!headers.finished_by_status_code());
        assert!(headers.is_chunked());
    }

    #[test]
    fn colon_fallback_and_skipped_lines() {
        let mut headers = Headers::default();
        assert!(headers.parse(
            b"GET / HTTP/1.1\r\nHost:example.com\r\nnot a header\r\nX-Empty: \r\nX-Time: 12:30\r\n\r\n"
        ));
        assert_eq!(headers.get("Host"), Some("example.com"));
        assert_eq!(headers.get("X-Empty"), Some(""));
        assert_eq!(headers.get("X-Time"), Some("12:30"));
        assert_eq!(headers.fields().count(), 3);
    }

    #[test]
    fn keep_alive() {
        let mut headers = Headers::default();
        headers.parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert!(headers.keep_alive());
        headers.parse(b"GET / HTTP/1.1\r\nProxy-Connection: Close\r\n\r\n");
        assert!(!headers.keep_alive());
        headers.parse(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert!(headers.keep_alive());
    }

    #[test]
    fn remove_insert_and_write() {
        let mut headers = Headers::default();
        headers.parse(
            b"GET / HTTP/1.1\r\nHost: a\r\nProxy-Connection: keep-alive\r\nProxy-Connection: x\r\n\r\n",
        );
        assert_eq!(headers.remove("Proxy-Connection").as_deref(), Some("keep-alive"));
        assert!(!headers.contains("Proxy-Connection"));
        headers.insert("Connection", "keep-alive");

        let mut out = Vec::new();
        headers.write_fields(&mut out);
        assert_eq!(out, b"Host: a\r\nConnection: keep-alive\r\n\r\n");
    }

    #[test]
    fn header_end_search_resumes() {
        let message = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nbody";
        let body = message.len() - 4;
        assert_eq!(find_header_end(message, 0), Some(body));
        // the terminator straddles the previous scan
        for scanned in 0..body {
            assert_eq!(find_header_end(&message[..body], scanned), Some(body));
        }
        assert_eq!(find_header_end(&message[..body - 1], body - 1), None);
        assert_eq!(find_header_end(b"", 10), None);
    }

    #[test]
    fn host_splitting() {
        assert_eq!(split_host("example.com", 80), Some(("example.com".into(), 80)));
        assert_eq!(split_host("example.com:8080", 80), Some(("example.com".into(), 8080)));
        assert_eq!(split_host("[::1]:443", 80), Some(("::1".into(), 443)));
        assert_eq!(split_host("[::1]", 443), Some(("::1".into(), 443)));
        assert_eq!(split_host("::1", 443), Some(("::1".into(), 443)));
        assert_eq!(split_host("example.com:http", 80), None);
        assert_eq!(split_host(":80", 80), None);
        assert_eq!(split_host("", 80), None);
    }

    #[test]
    fn origin_form() {
        assert_eq!(to_origin_form("GET http://example.com/ HTTP/1.1"), "GET / HTTP/1.1");
        assert_eq!(
            to_origin_form("GET HTTP://example.com:8080/a/b?c=d HTTP/1.1"),
            "GET /a/b?c=d HTTP/1.1"
        );
        assert_eq!(to_origin_form("GET http://example.com HTTP/1.0"), "GET / HTTP/1.0");
        assert_eq!(to_origin_form("GET http://example.com?x HTTP/1.1"), "GET /?x HTTP/1.1");
        assert_eq!(to_origin_form("GET /already HTTP/1.1"), "GET /already HTTP/1.1");
        assert_eq!(to_origin_form("garbage"), "garbage");

        assert_eq!(
            absolute_authority("GET http://example.com:8080/x HTTP/1.1"),
            Some("example.com:8080")
        );
        assert_eq!(absolute_authority("GET /x HTTP/1.1"), None);
    }

    fn sanitize_name(name: String) -> String {
        name.chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect()
    }

    fn sanitize_value(value: String) -> String {
        value
            .chars()
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect::<String>()
            .trim_start()
            .to_owned()
    }

    fn split_invariance(fields: Vec<(String, String)>, body: Vec<u8>, cuts: Vec<usize>) -> TestResult {
        let fields: Vec<(String, String)> = fields
            .into_iter()
            .map(|(name, value)| (sanitize_name(name), sanitize_value(value)))
            .filter(|(name, _)| !name.is_empty())
            .collect();

        let mut message = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        for (name, value) in &fields {
            message.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        message.extend_from_slice(b"\r\n");
        message.extend_from_slice(&body);

        let mut reference = Headers::default();
        if !reference.parse(&message) {
            return TestResult::failed();
        }
        let parsed: Vec<(String, String)> = reference
            .fields()
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();
        if parsed != fields {
            return TestResult::failed();
        }

        let mut cuts: Vec<usize> = cuts
            .into_iter()
            .map(|cut| cut % (message.len() + 1))
            .collect();
        cuts.push(message.len());
        cuts.sort_unstable();

        let mut accumulated = Vec::new();
        let mut headers = Headers::default();
        let mut start = 0;
        for cut in cuts {
            accumulated.extend_from_slice(&message[start..cut]);
            start = cut;

            let complete = headers.parse(&accumulated);
            if complete != memmem::find(&accumulated, HEADER_END).is_some() {
                return TestResult::failed();
            }
            if complete && headers != reference {
                return TestResult::failed();
            }
        }

        TestResult::from_bool(headers == reference)
    }

    #[test]
    fn parse_is_split_invariant() {
        QuickCheck::new()
            .tests(500)
            .quickcheck(split_invariance as fn(Vec<(String, String)>, Vec<u8>, Vec<usize>) -> TestResult);
    }
}
