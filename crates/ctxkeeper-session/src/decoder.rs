//! Incremental UTF-8 reassembly for streamed tokens.
//!
//! A token's text piece can end in the middle of a multi-byte character, so
//! the decoder keeps the dangling bytes until the rest of the character
//! arrives and only ever emits whole characters.

/// Classification of a single byte by its leading bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteClass {
    /// `0xxxxxxx`
    Ascii,
    /// `110xxxxx`
    Lead2,
    /// `1110xxxx`
    Lead3,
    /// `11110xxx`
    Lead4,
    /// `10xxxxxx`
    Continuation,
    /// `11111xxx`
    Invalid,
}

impl ByteClass {
    fn of(byte: u8) -> Self {
        match byte {
            0x00..=0x7F => ByteClass::Ascii,
            0x80..=0xBF => ByteClass::Continuation,
            0xC0..=0xDF => ByteClass::Lead2,
            0xE0..=0xEF => ByteClass::Lead3,
            0xF0..=0xF7 => ByteClass::Lead4,
            0xF8..=0xFF => ByteClass::Invalid,
        }
    }

    /// Total length of the character this byte starts, if it starts one.
    fn sequence_len(self) -> Option<usize> {
        match self {
            ByteClass::Ascii => Some(1),
            ByteClass::Lead2 => Some(2),
            ByteClass::Lead3 => Some(3),
            ByteClass::Lead4 => Some(4),
            ByteClass::Continuation | ByteClass::Invalid => None,
        }
    }
}

/// Scanner state while walking the pending buffer.
#[derive(Debug, Clone, Copy)]
enum ScanState {
    /// Expecting the first byte of a character.
    Start,
    /// Inside a character that began at `start` and needs `remaining` more bytes.
    Inside { start: usize, remaining: usize },
}

/// Outcome of one scan over the pending buffer.
struct Scan {
    /// Byte ranges of complete characters, in order.
    complete: Vec<std::ops::Range<usize>>,
    /// Bytes consumed (emitted or discarded) from the front of the buffer.
    consumed: usize,
}

/// Streaming decoder holding the incomplete tail of the byte stream.
#[derive(Debug, Default, Clone)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token's bytes and return every character now complete.
    ///
    /// An empty string means the buffer ends mid-character and more bytes are
    /// needed.
    pub fn feed(&mut self, fragment: &[u8]) -> String {
        self.pending.extend_from_slice(fragment);

        let scan = self.scan();
        let mut emitted = Vec::with_capacity(scan.consumed);
        for range in scan.complete {
            emitted.extend_from_slice(&self.pending[range]);
        }
        self.pending.drain(..scan.consumed);

        match String::from_utf8(emitted) {
            Ok(text) => text,
            // Overlong forms and surrogates pass the length check above.
            Err(err) => String::from_utf8_lossy(err.as_bytes()).into_owned(),
        }
    }

    /// Discard any buffered partial character.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Bytes waiting for the rest of their character.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn scan(&self) -> Scan {
        let bytes = &self.pending;
        let mut complete = Vec::new();
        let mut state = ScanState::Start;
        let mut consumed = 0;
        let mut i = 0;

        while i < bytes.len() {
            let class = ByteClass::of(bytes[i]);
            state = match state {
                ScanState::Start => match class.sequence_len() {
                    Some(1) => {
                        complete.push(i..i + 1);
                        consumed = i + 1;
                        ScanState::Start
                    }
                    Some(len) => ScanState::Inside {
                        start: i,
                        remaining: len - 1,
                    },
                    // Stray continuation or invalid byte: skip it.
                    None => {
                        consumed = i + 1;
                        ScanState::Start
                    }
                },
                ScanState::Inside { start, remaining } => {
                    if class != ByteClass::Continuation {
                        // The leader was malformed. Drop it and rescan this byte.
                        consumed = start + 1;
                        i = start + 1;
                        state = ScanState::Start;
                        continue;
                    }
                    if remaining == 1 {
                        complete.push(start..i + 1);
                        consumed = i + 1;
                        ScanState::Start
                    } else {
                        ScanState::Inside {
                            start,
                            remaining: remaining - 1,
                        }
                    }
                }
            };
            i += 1;
        }

        Scan { complete, consumed }
    }
}
