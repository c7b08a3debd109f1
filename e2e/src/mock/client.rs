use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use crate::BUFFER_SIZE;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A browser stand-in: one blocking connection to the proxy
pub struct Client {
    pub name: String,
    pub proxy: SocketAddr,
    stream: Option<TcpStream>,
}

impl Client {
    pub fn new<S: Into<String>>(name: S, proxy: SocketAddr) -> Self {
        Self {
            name: name.into(),
            proxy,
            stream: None,
        }
    }

    pub fn connect(&mut self) {
        let stream = TcpStream::connect(self.proxy)
            .unwrap_or_else(|error| panic!("{}: could not connect: {error}", self.name));
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("could not set read timeout");
        stream.set_nodelay(true).expect("could not set nodelay");
        self.stream = Some(stream);
    }

    fn stream(&mut self) -> &mut TcpStream {
        match self.stream.as_mut() {
            Some(stream) => stream,
            None => panic!("{}: not connected", self.name),
        }
    }

    pub fn send(&mut self, data: &[u8]) {
        self.stream()
            .write_all(data)
            .expect("could not write to the proxy");
    }

    /// Reads one HTTP response framed by its Content-Length. `None` when the
    /// proxy closed the connection or nothing came back in time.
    pub fn receive_response(&mut self) -> Option<String> {
        let mut response = Vec::new();
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            if let Some(expected) = expected_length(&response) {
                if response.len() >= expected {
                    return Some(String::from_utf8_lossy(&response).into_owned());
                }
            }
            match self.stream().read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => response.extend_from_slice(&buf[..n]),
                Err(error) => {
                    println!("{}: read error: {error}", self.name);
                    return None;
                }
            }
        }
    }

    /// Reads exactly `count` bytes
    pub fn receive_exact(&mut self, count: usize) -> Option<Vec<u8>> {
        let mut data = vec![0u8; count];
        self.stream().read_exact(&mut data).ok()?;
        Some(data)
    }

    /// true once the proxy closed its side
    pub fn is_closed(&mut self) -> bool {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            match self.stream().read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(error) => {
                    return matches!(
                        error.kind(),
                        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe
                    )
                }
            }
        }
    }
}

/// header length plus Content-Length, once the header block is complete
fn expected_length(data: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(data);
    let header_end = text.find("\r\n\r\n")? + 4;
    let content_length = text[..header_end]
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    Some(header_end + content_length)
}
