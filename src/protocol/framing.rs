use super::ProtocolError;

/// Every message on the control channel ends with this sequence
pub const TERMINATOR_STR: &str = "\r\n";
pub const TERMINATOR: &[u8] = TERMINATOR_STR.as_bytes();

/* Anything longer than this without a terminator is garbage */
const MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn encode_frame(message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + TERMINATOR.len());
    out.extend_from_slice(message.as_bytes());
    out.extend_from_slice(TERMINATOR);
    return out;
}

/// Accumulates stream bytes and hands out complete frames.
///
/// A frame split over several reads stays buffered until its terminator
/// arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, `None` when only a partial frame is left.
    /// Empty frames are skipped.
    pub fn next_frame(&mut self) -> Option<Result<String, ProtocolError>> {
        loop {
            let pos = match find_terminator(&self.buf) {
                Some(p) => p,
                None => {
                    if self.buf.len() > MAX_FRAME_LEN {
                        let len = self.buf.len();
                        self.buf.clear();
                        return Some(Err(ProtocolError::FrameTooLarge(len)));
                    }
                    return None;
                }
            };

            let frame: Vec<u8> = self.buf.drain(..pos + TERMINATOR.len()).take(pos).collect();
            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }

            return Some(String::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8));
        }
    }

    pub fn pending_len(&self) -> usize {
        return self.buf.len();
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(TERMINATOR.len()).position(|w| w == TERMINATOR)
}
