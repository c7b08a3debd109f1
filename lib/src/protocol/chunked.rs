//! Follows the framing of a `Transfer-Encoding: chunked` body as it is
//! relayed, without decoding it, to find where the body ends.

/// longest chunk size line accepted, in hex digits
const MAX_SIZE_DIGITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size { size: u64, digits: usize },
    /// chunk extensions or padding until the end of the size line
    SizeLine { size: u64 },
    Data { remaining: u64 },
    /// the line break closing a chunk's data
    DataEnd { seen_cr: bool },
    /// trailer fields after the last chunk, `empty` while the current line is
    Trailer { empty: bool },
    Done,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedFraming {
    state: State,
}

impl Default for ChunkedFraming {
    fn default() -> Self {
        ChunkedFraming {
            state: State::Size { size: 0, digits: 0 },
        }
    }
}

impl ChunkedFraming {
    /// Advances over `data`. Returns how many bytes belong to the body, which
    /// is less than `data.len()` when the body ended inside `data`.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        let mut position = 0;
        while position < data.len() {
            match self.state {
                State::Done | State::Malformed => break,
                State::Data { remaining } => {
                    let available = (data.len() - position) as u64;
                    let taken = remaining.min(available);
                    position += taken as usize;
                    self.state = match remaining - taken {
                        0 => State::DataEnd { seen_cr: false },
                        remaining => State::Data { remaining },
                    };
                }
                state => {
                    self.state = next_state(state, data[position]);
                    position += 1;
                }
            }
        }
        position
    }

    /// the terminating chunk and its trailer were seen
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// the body does not follow the chunked framing, its end is unknown
    pub fn is_malformed(&self) -> bool {
        self.state == State::Malformed
    }
}

fn next_state(state: State, byte: u8) -> State {
    match (state, byte) {
        (State::Size { size, digits }, byte) if byte.is_ascii_hexdigit() => {
            if digits == MAX_SIZE_DIGITS {
                return State::Malformed;
            }
            let digit = (byte as char).to_digit(16).unwrap_or(0) as u64;
            State::Size {
                size: (size << 4) | digit,
                digits: digits + 1,
            }
        }
        (State::Size { digits: 0, .. }, _) => State::Malformed,
        (State::Size { size, .. } | State::SizeLine { size }, b'\n') => match size {
            0 => State::Trailer { empty: true },
            size => State::Data { remaining: size },
        },
        (State::Size { size, .. } | State::SizeLine { size }, _) => State::SizeLine { size },

        (State::DataEnd { seen_cr: false }, b'\r') => State::DataEnd { seen_cr: true },
        (State::DataEnd { .. }, b'\n') => State::Size { size: 0, digits: 0 },
        (State::DataEnd { .. }, _) => State::Malformed,

        (State::Trailer { empty: true }, b'\n') => State::Done,
        (State::Trailer { .. }, b'\n') => State::Trailer { empty: true },
        (State::Trailer { empty }, b'\r') => State::Trailer { empty },
        (State::Trailer { .. }, _) => State::Trailer { empty: false },

        (state @ (State::Data { .. } | State::Done | State::Malformed), _) => state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framing_of(pieces: &[&[u8]]) -> (ChunkedFraming, usize) {
        let mut framing = ChunkedFraming::default();
        let consumed = pieces.iter().map(|piece| framing.feed(piece)).sum();
        (framing, consumed)
    }

    #[test]
    fn whole_body() {
        let body = b"5\r\nhello\r\nb;ext=1\r\n world, bye\r\n0\r\n\r\n";
        let (framing, consumed) = framing_of(&[body]);
        assert!(framing.is_done());
        assert_eq!(consumed, body.len());
    }

    #[test]
    fn data_looking_like_the_last_chunk() {
        let (framing, _) = framing_of(&[b"5\r\nab0\r\n", b"\r\n"]);
        assert!(!framing.is_done());

        let (framing, _) = framing_of(&[b"5\r\nab0\r\n", b"\r\n", b"0\r\n\r\n"]);
        assert!(framing.is_done());
    }

    #[test]
    fn split_everywhere() {
        let body = b"A\r\n0123456789\r\n0\r\nX-Checksum: 1\r\n\r\n";
        for cut in 0..=body.len() {
            let (framing, consumed) = framing_of(&[&body[..cut], &body[cut..]]);
            assert!(framing.is_done(), "cut at {cut}");
            assert_eq!(consumed, body.len());
        }
    }

    #[test]
    fn trailing_bytes_are_not_body() {
        let mut framing = ChunkedFraming::default();
        let data = b"3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\n";
        assert_eq!(framing.feed(data), 13);
        assert!(framing.is_done());
        assert_eq!(framing.feed(b"more"), 0);
    }

    #[test]
    fn broken_framing() {
        let (framing, _) = framing_of(&[b"zz\r\n"]);
        assert!(framing.is_malformed());

        let (framing, _) = framing_of(&[b"2\r\nabc\r\n"]);
        assert!(framing.is_malformed());

        let (framing, _) = framing_of(&[b"11111111111111111\r\n"]);
        assert!(framing.is_malformed());
    }
}
