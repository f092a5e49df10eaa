//! UTF-8 validation for text messages
//!
//! Bulk validation goes through `simdutf8`. Text messages arrive in pieces
//! (frames, physical reads, inflater output), so [`Utf8Validator`] carries a
//! code point split across pieces over to the next call.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Check if data is valid UTF-8 apart from an unfinished sequence at the end.
///
/// Returns `(true, n)` where `n` is the number of trailing bytes forming a
/// valid but incomplete code point (0-3), or `(false, 0)` on invalid input.
pub fn validate_utf8_incomplete(data: &[u8]) -> (bool, usize) {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => (true, 0),
        Err(e) if e.error_len().is_none() => (true, data.len() - e.valid_up_to()),
        Err(_) => (false, 0),
    }
}

/// Width of the code point introduced by a lead byte
#[inline]
fn sequence_width(lead: u8) -> usize {
    match lead {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 1,
    }
}

/// Incremental validator for one message
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    /// Create a validator at the start of a message
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next piece of the message. Returns false once the input can
    /// no longer be valid UTF-8.
    pub fn write(&mut self, mut data: &[u8]) -> bool {
        if self.pending_len > 0 {
            let width = sequence_width(self.pending[0]);
            let take = (width - self.pending_len).min(data.len());
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&data[..take]);
            self.pending_len += take;
            data = &data[take..];

            let (valid, incomplete) = validate_utf8_incomplete(&self.pending[..self.pending_len]);
            if !valid {
                return false;
            }
            if incomplete > 0 {
                // Still short; data must be exhausted here
                return data.is_empty();
            }
            self.pending_len = 0;
        }

        let (valid, incomplete) = validate_utf8_incomplete(data);
        if !valid {
            return false;
        }
        if incomplete > 0 {
            let tail = &data[data.len() - incomplete..];
            self.pending[..incomplete].copy_from_slice(tail);
            self.pending_len = incomplete;
        }
        true
    }

    /// Called at the end of the message. False if a code point was cut off.
    pub fn finish(&mut self) -> bool {
        let complete = self.pending_len == 0;
        self.reset();
        complete
    }

    /// Forget any carried bytes
    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}
