//! HTTP/1.x framing, as much of it as a forwarding proxy needs
pub mod chunked;
pub mod headers;

pub use chunked::ChunkedFraming;
pub use headers::{absolute_authority, find_header_end, split_host, to_origin_form, Headers};

/// a browser request starting with this is a tunnel request
pub const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// every upstream response starts with this
pub const RESPONSE_PREFIX: &[u8] = b"HTTP/";

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// a browser header block larger than this ends the request
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

pub const HTTP_DEFAULT_PORT: u16 = 80;
pub const HTTPS_DEFAULT_PORT: u16 = 443;
