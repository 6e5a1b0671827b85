//! Authored text buffers.
//!
//! A chunk keeps the text of a document together with the id of the
//! user that wrote each run of it. The encoding of the stored bytes is
//! declared once and fixed for the lifetime of the chunk; character
//! offsets count code points for UTF-8 and bytes for single-byte
//! encodings.
use crate::error::OtError;
use crate::id::UserId;
use smallvec::SmallVec;

#[derive(Clone, Debug, Eq, PartialEq)]
struct Segment {
    author: UserId,
    text: Vec<u8>,
}

/// One authored run yielded by [`TextChunk::iter`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SegmentRef<'a> {
    /// User that wrote the run.
    pub author: UserId,
    /// Character offset of the run within the chunk.
    pub offset: u32,
    /// Character count of the run.
    pub length: u32,
    /// The run's bytes in the chunk's encoding.
    pub text: &'a [u8],
}

/// An ordered sequence of authored text runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TextChunk {
    segments: Vec<Segment>,
    length: u32,
    encoding: String,
    utf8: bool,
}

impl TextChunk {
    /// Creates an empty chunk holding text in the given encoding.
    pub fn new(encoding: &str) -> Self {
        Self {
            segments: Vec::new(),
            length: 0,
            utf8: encoding.eq_ignore_ascii_case("utf-8"),
            encoding: encoding.to_string(),
        }
    }

    /// Creates a chunk containing `text` authored by `author`.
    pub fn from_text(encoding: &str, text: &str, author: UserId) -> Self {
        let mut chunk = Self::new(encoding);
        chunk.push_segment(author, text.as_bytes().to_vec());
        chunk
    }

    /// Returns the character encoding of the stored bytes.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    /// Returns the number of characters in the chunk.
    pub fn len(&self) -> u32 {
        self.length
    }

    /// Returns whether the chunk contains no text.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Appends a run, coalescing it with the last one if the author
    /// matches. Empty runs are dropped.
    pub fn push_segment(&mut self, author: UserId, text: Vec<u8>) {
        if text.is_empty() {
            return;
        }
        self.length += self.char_len(&text);
        match self.segments.last_mut() {
            Some(last) if last.author == author => last.text.extend_from_slice(&text),
            _ => self.segments.push(Segment { author, text }),
        }
    }

    /// Splices `text` in at character offset `pos`. Insertion at
    /// exactly [`len`](Self::len) appends.
    pub fn insert(&mut self, pos: u32, text: &[u8], author: UserId) -> Result<(), OtError> {
        let mut piece = Self::new(&self.encoding);
        piece.push_segment(author, text.to_vec());
        self.insert_chunk(pos, &piece)
    }

    /// Splices another chunk in at character offset `pos`, preserving
    /// its authorship.
    pub fn insert_chunk(&mut self, pos: u32, chunk: &TextChunk) -> Result<(), OtError> {
        if pos > self.length {
            return Err(OtError::OutOfBounds {
                pos,
                len: chunk.len(),
                buffer_len: self.length,
            });
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let tail = self.split_off(pos);
        for segment in &chunk.segments {
            self.push_segment(segment.author, segment.text.clone());
        }
        for segment in tail {
            self.push_segment(segment.author, segment.text);
        }
        Ok(())
    }

    /// Removes `len` characters starting at `pos` and returns them as
    /// an independent chunk with mirrored authorship.
    pub fn erase(&mut self, pos: u32, len: u32) -> Result<TextChunk, OtError> {
        if u64::from(pos) + u64::from(len) > u64::from(self.length) {
            return Err(OtError::OutOfBounds {
                pos,
                len,
                buffer_len: self.length,
            });
        }
        let tail = self.split_off(pos + len);
        let erased_segments = self.split_off(pos);
        let mut erased = Self::new(&self.encoding);
        for segment in erased_segments {
            erased.push_segment(segment.author, segment.text);
        }
        for segment in tail {
            self.push_segment(segment.author, segment.text);
        }
        Ok(erased)
    }

    /// Returns an independent copy of `len` characters starting at
    /// `pos`, with mirrored authorship.
    pub fn substring(&self, pos: u32, len: u32) -> Result<TextChunk, OtError> {
        if u64::from(pos) + u64::from(len) > u64::from(self.length) {
            return Err(OtError::OutOfBounds {
                pos,
                len,
                buffer_len: self.length,
            });
        }
        let mut result = Self::new(&self.encoding);
        if len == 0 {
            return Ok(result);
        }
        let end = pos + len;
        let mut offset = 0u32;
        for segment in &self.segments {
            let seg_len = self.char_len(&segment.text);
            let seg_end = offset + seg_len;
            if seg_end > pos && offset < end {
                let from = pos.saturating_sub(offset);
                let to = seg_len.min(end - offset);
                let from_byte = self.byte_index(&segment.text, from);
                let to_byte = self.byte_index(&segment.text, to);
                result.push_segment(segment.author, segment.text[from_byte..to_byte].to_vec());
            }
            offset = seg_end;
            if offset >= end {
                break;
            }
        }
        Ok(result)
    }

    /// Iterates over the authored runs in order. Offsets are monotone
    /// increasing and cover `0..len` without gap.
    pub fn iter(&self) -> impl Iterator<Item = SegmentRef<'_>> + '_ {
        let mut offset = 0u32;
        self.segments.iter().map(move |segment| {
            let length = self.char_len(&segment.text);
            let current = offset;
            offset += length;
            SegmentRef {
                author: segment.author,
                offset: current,
                length,
                text: &segment.text,
            }
        })
    }

    /// Returns the text of the chunk, assuming UTF-8 content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            out.push_str(&String::from_utf8_lossy(&segment.text));
        }
        out
    }

    /// Splits the chunk at `pos`, keeping the head in place and
    /// returning the tail segments. `pos` must be within bounds.
    fn split_off(&mut self, pos: u32) -> SmallVec<[Segment; 4]> {
        debug_assert!(pos <= self.length);
        let utf8 = self.utf8;
        let mut offset = 0u32;
        let mut split = self.segments.len();
        let mut tail = SmallVec::new();
        for (index, segment) in self.segments.iter_mut().enumerate() {
            let seg_len = Self::char_len_in(utf8, &segment.text);
            if offset + seg_len > pos {
                let byte = Self::byte_index_in(utf8, &segment.text, pos - offset);
                if byte < segment.text.len() {
                    tail.push(Segment {
                        author: segment.author,
                        text: segment.text.split_off(byte),
                    });
                }
                split = if segment.text.is_empty() { index } else { index + 1 };
                break;
            }
            offset += seg_len;
        }
        tail.extend(self.segments.drain(split.min(self.segments.len())..));
        self.segments.retain(|segment| !segment.text.is_empty());
        self.length = pos;
        tail
    }

    fn char_len(&self, bytes: &[u8]) -> u32 {
        Self::char_len_in(self.utf8, bytes)
    }

    fn char_len_in(utf8: bool, bytes: &[u8]) -> u32 {
        if utf8 {
            String::from_utf8_lossy(bytes).chars().count() as u32
        } else {
            bytes.len() as u32
        }
    }

    fn byte_index(&self, bytes: &[u8], chars: u32) -> usize {
        Self::byte_index_in(self.utf8, bytes, chars)
    }

    /// Byte offset of the `chars`-th character in `bytes`.
    fn byte_index_in(utf8: bool, bytes: &[u8], chars: u32) -> usize {
        if !utf8 {
            return chars as usize;
        }
        if chars == 0 {
            return 0;
        }
        let text = std::str::from_utf8(bytes).unwrap_or_default();
        text.char_indices()
            .nth(chars as usize)
            .map(|(index, _)| index)
            .unwrap_or(bytes.len())
    }
}
