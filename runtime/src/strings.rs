//! String transfer between host and guest memory.
//!
//! Guest strings are UTF-8, either length-delimited or NUL-terminated.
//! Decoding never fails: malformed input turns into U+FFFD.

/// Characters decoded per chunk on the pure-ASCII fast path.
const ASCII_CHUNK: usize = 1024;

/// Decode a guest string.
///
/// With `len` the span is exactly `len` bytes (clipped to memory), otherwise
/// it runs to the first NUL. A null pointer or a zero length gives `""`.
pub fn decode(mem: &[u8], ptr: u32, len: Option<u32>) -> String {
    if ptr == 0 || len == Some(0) {
        return String::new();
    }
    let start = ptr as usize;
    if start >= mem.len() {
        return String::new();
    }

    let tail = &mem[start..];
    let span = match len {
        Some(len) => &tail[..tail.len().min(len as usize)],
        None => {
            let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
            &tail[..end]
        }
    };

    if span.is_ascii() {
        decode_ascii(span)
    } else {
        decode_legacy(span)
    }
}

fn decode_ascii(span: &[u8]) -> String {
    let mut out = String::with_capacity(span.len());
    for chunk in span.chunks(ASCII_CHUNK) {
        out.extend(chunk.iter().map(|&b| b as char));
    }
    out
}

/// Decoder accepting the legacy 1 to 6 byte UTF-8 lead patterns.
///
/// Continuation bytes are taken as-is; the decoded value is replaced when it
/// is not a Unicode scalar value.
fn decode_legacy(span: &[u8]) -> String {
    let mut out = String::with_capacity(span.len());
    let mut i = 0;

    while i < span.len() {
        let lead = span[i] as u32;
        if lead == 0 {
            break;
        }

        let (extra, init) = match lead {
            0x01..=0x7F => (0, lead),
            0xC0..=0xDF => (1, lead & 0x1F),
            0xE0..=0xEF => (2, lead & 0x0F),
            0xF0..=0xF7 => (3, lead & 0x07),
            0xF8..=0xFB => (4, lead & 0x03),
            0xFC..=0xFD => (5, lead & 0x01),
            // Stray continuation byte, 0xFE or 0xFF.
            _ => {
                out.push(char::REPLACEMENT_CHARACTER);
                i += 1;
                continue;
            }
        };

        if i + extra >= span.len() {
            out.push(char::REPLACEMENT_CHARACTER);
            break;
        }

        let mut value = init;
        for &byte in &span[i + 1..=i + extra] {
            value = (value << 6) | (byte as u32 & 0x3F);
        }
        i += 1 + extra;

        out.push(char::from_u32(value).unwrap_or(char::REPLACEMENT_CHARACTER));
    }

    out
}

/// Encode `text` at `ptr` followed by a NUL terminator.
///
/// The payload is at most `max_len - 1` bytes (or whatever fits before the
/// end of memory) and is cut at a character boundary. Returns the number of
/// payload bytes written.
pub fn encode(mem: &mut [u8], text: &str, ptr: u32, max_len: Option<u32>) -> u32 {
    let start = ptr as usize;
    if start >= mem.len() || max_len == Some(0) {
        return 0;
    }

    let room = mem.len() - start - 1;
    let capacity = match max_len {
        Some(max_len) => room.min(max_len as usize - 1),
        None => room,
    };

    let mut n = text.len().min(capacity);
    while !text.is_char_boundary(n) {
        n -= 1;
    }

    mem[start..start + n].copy_from_slice(&text.as_bytes()[..n]);
    mem[start + n] = 0;
    n as u32
}
