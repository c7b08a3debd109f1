/// Accumulates what a mock backend saw, handed back when it stops
pub trait Aggregator {
    fn new() -> Self;
    fn add_request(&mut self, raw: &[u8]);
    fn add_response(&mut self);
}

/// Keeps every raw request, lossily decoded
#[derive(Debug, Clone, Default)]
pub struct RecordingAggregator {
    pub requests: Vec<String>,
    pub responses_sent: usize,
}

impl Aggregator for RecordingAggregator {
    fn new() -> Self {
        Self::default()
    }
    fn add_request(&mut self, raw: &[u8]) {
        self.requests.push(String::from_utf8_lossy(raw).into_owned());
    }
    fn add_response(&mut self) {
        self.responses_sent += 1;
    }
}
