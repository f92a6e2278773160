//! Minimal DER reader.
//!
//! Only definite-length decoding and a forward scan for the next SEQUENCE are
//! supported. That is all the certificate walk in [`crate::cert`] needs, and
//! the scan tolerates optional fields we do not care about.

/// Universal SEQUENCE tag (constructed).
pub const TAG_SEQUENCE: u8 = 0x30;
/// Universal INTEGER tag.
pub const TAG_INTEGER: u8 = 0x02;
/// Context-specific constructed `[0]`, used for the certificate version.
pub const TAG_CONTEXT_0: u8 = 0xA0;

/// A located DER element inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Element {
    /// Offset of the tag byte.
    pub pos: usize,
    /// Length of the content octets.
    pub length: usize,
    /// Tag + length octets + content.
    pub total: usize,
}

impl Element {
    /// Offset of the first content byte.
    pub fn content_start(&self) -> usize {
        self.pos + (self.total - self.length)
    }

    /// Offset one past the last content byte.
    pub fn end(&self) -> usize {
        self.pos + self.total
    }

    /// The full encoding (tag, length and content).
    ///
    /// `buf` must be the buffer the element was read from.
    pub fn encoded<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.pos..self.end()]
    }
}

/// Decode the DER length octets starting at `pos`.
///
/// Returns `(length, bytes_consumed)`, or `None` when the buffer ends
/// mid-read or the encoding is the (non-DER) indefinite form.
pub fn read_length(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *buf.get(pos)?;
    if first & 0x80 == 0 {
        return Some((usize::from(first), 1));
    }

    let count = usize::from(first & 0x7f);
    if count == 0 || count > std::mem::size_of::<usize>() {
        return None;
    }

    let octets = buf.get(pos + 1..pos + 1 + count)?;
    let length = octets
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Some((length, 1 + count))
}

/// Decode the element whose tag byte is at `pos`.
///
/// Fails when the declared content runs past the end of `buf`.
pub fn read_element(buf: &[u8], pos: usize) -> Option<Element> {
    buf.get(pos)?;
    let (length, consumed) = read_length(buf, pos + 1)?;
    let total = (1 + consumed).checked_add(length)?;
    if pos.checked_add(total)? > buf.len() {
        return None;
    }
    Some(Element { pos, length, total })
}

/// Scan forward from `from` for the next SEQUENCE tag and decode it.
///
/// Returns `None` when no SEQUENCE tag remains or the one found does not
/// fit in the buffer.
pub fn find_sequence(buf: &[u8], from: usize) -> Option<Element> {
    let offset = buf.get(from..)?.iter().position(|b| *b == TAG_SEQUENCE)?;
    read_element(buf, from + offset)
}

/// A byte-offset cursor over a read-only DER buffer.
///
/// Entering a SEQUENCE narrows the cursor to that SEQUENCE's content: later
/// reads never see bytes past its end.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    /// Cursor positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            end: buf.len(),
        }
    }

    /// Current offset.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Offset one past the last byte the cursor may read.
    pub fn end(&self) -> usize {
        self.end
    }

    /// The underlying buffer.
    pub fn buf(&self) -> &'a [u8] {
        self.buf
    }

    fn window(&self) -> &'a [u8] {
        &self.buf[..self.end]
    }

    /// Tag byte at the current offset.
    pub fn peek_tag(&self) -> Option<u8> {
        self.window().get(self.pos).copied()
    }

    /// Skip the element at the cursor if its tag is `tag`.
    ///
    /// Returns `Some(true)` when skipped, `Some(false)` when the tag differs,
    /// and `None` when the element is present but truncated.
    pub fn skip_if(&mut self, tag: u8) -> Option<bool> {
        if self.peek_tag() != Some(tag) {
            return Some(false);
        }
        let element = read_element(self.window(), self.pos)?;
        self.pos = element.end();
        Some(true)
    }

    /// Find the next SEQUENCE and move into its content.
    pub fn enter_sequence(&mut self) -> Option<Element> {
        let element = find_sequence(self.window(), self.pos)?;
        self.pos = element.content_start();
        self.end = element.end();
        Some(element)
    }

    /// Find the next SEQUENCE and move past it.
    pub fn skip_sequence(&mut self) -> Option<Element> {
        let element = find_sequence(self.window(), self.pos)?;
        self.pos = element.end();
        Some(element)
    }
}
