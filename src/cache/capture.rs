/// Bounded sink for response bytes on their way to the client. The relay
/// loop feeds every chunk in here as well as to the socket; once the
/// cumulative size would exceed the limit the buffer is dropped and the
/// capture is marked as overflowed for the rest of the response.
#[derive(Debug)]
pub struct CaptureBuffer {
    limit: usize,
    buffer: Vec<u8>,
    overflowed: bool,
}

impl CaptureBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buffer: Vec::new(),
            overflowed: false,
        }
    }

    pub fn record(&mut self, chunk: &[u8]) {
        if self.overflowed {
            return;
        }
        if self.buffer.len() + chunk.len() > self.limit {
            self.overflowed = true;
            self.buffer = Vec::new();
            return;
        }
        self.buffer.extend_from_slice(chunk);
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    /// The captured body, or `None` if the response outgrew the limit.
    pub fn body(self) -> Option<Vec<u8>> {
        if self.overflowed { None } else { Some(self.buffer) }
    }
}
