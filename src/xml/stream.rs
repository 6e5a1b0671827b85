//! Delimits XML fragments in a raw byte stream.
//!
//! A connection's byte stream is a concatenation of self-contained
//! fragments with no enclosing document element. The reader consumes
//! bytes fragment by fragment: when the root element of the current
//! fragment closes, the fragment is complete and the stream resumes at
//! the following byte. There is no preamble between fragments.
use crate::error::{Error, TransportError};
use crate::xml::Element;
use quick_xml::events::Event;
use quick_xml::Reader;

/// Incremental fragment parser over a growing byte buffer.
///
/// Bytes are handed in with [`feed`](Self::feed); complete fragments
/// come out of [`next_fragment`](Self::next_fragment). The reader
/// keeps count of the bytes consumed by completed fragments so a
/// caller owning the buffer can resume at the right offset.
#[derive(Debug, Default)]
pub struct FragmentReader {
    buffer: Vec<u8>,
    consumed: u64,
}

impl FragmentReader {
    /// Returns a reader with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends incoming bytes to the buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Total bytes consumed by completed fragments.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Tries to parse the next complete fragment from the buffer.
    ///
    /// Returns `Ok(None)` when the buffered bytes end before the
    /// current fragment's root element closes; feeding more bytes and
    /// calling again resumes. A malformed fragment fails with
    /// [`TransportError::XmlParse`] carrying the byte offset, counted
    /// from the start of the stream, at which parsing failed.
    pub fn next_fragment(&mut self) -> Result<Option<Element>, Error> {
        let mut reader = Reader::from_reader(self.buffer.as_slice());
        reader.check_end_names(true);
        let mut buf = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        loop {
            let event = match reader.read_event(&mut buf) {
                Ok(event) => event,
                // The buffer ends inside a tag; resume once more
                // bytes arrive.
                Err(quick_xml::Error::UnexpectedEof(_)) => return Ok(None),
                Err(err) => {
                    return Err(TransportError::XmlParse {
                        offset: self.consumed + reader.buffer_position() as u64,
                        message: err.to_string(),
                    }
                    .into());
                }
            };
            match event {
                Event::Start(start) => {
                    let element = self.open(&reader, &start)?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    let element = self.open(&reader, &start)?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    } else {
                        return Ok(Some(self.complete(element, reader.buffer_position())));
                    }
                }
                Event::End(_) => {
                    let element = stack.pop().ok_or_else(|| {
                        Error::from(TransportError::Framing(
                            "close tag without open tag".to_string(),
                        ))
                    })?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(element);
                    } else {
                        return Ok(Some(self.complete(element, reader.buffer_position())));
                    }
                }
                Event::Text(text) => {
                    let decoded =
                        text.unescape_and_decode(&reader)
                            .map_err(|err| TransportError::XmlParse {
                                offset: self.consumed + reader.buffer_position() as u64,
                                message: err.to_string(),
                            })?;
                    match stack.last_mut() {
                        Some(parent) => parent.text.push_str(&decoded),
                        // Stray whitespace between fragments is legal.
                        None if decoded.trim().is_empty() => {}
                        None => {
                            return Err(TransportError::Framing(
                                "character data outside of a fragment".to_string(),
                            )
                            .into());
                        }
                    }
                }
                Event::CData(_) | Event::Comment(_) | Event::Decl(_) | Event::PI(_)
                | Event::DocType(_) => {}
                Event::Eof => return Ok(None),
            }
            buf.clear();
        }
    }

    /// Converts a start tag into an element.
    fn open(&self, reader: &Reader<&[u8]>, start: &quick_xml::events::BytesStart) -> Result<Element, Error> {
        let name = String::from_utf8_lossy(start.name()).to_string();
        let mut element = Element::new(&name);
        for attr in start.attributes() {
            let attr = attr.map_err(|err| TransportError::XmlParse {
                offset: self.consumed + reader.buffer_position() as u64,
                message: err.to_string(),
            })?;
            let key = String::from_utf8_lossy(attr.key).to_string();
            let value =
                attr.unescape_and_decode_value(reader)
                    .map_err(|err| TransportError::XmlParse {
                        offset: self.consumed + reader.buffer_position() as u64,
                        message: err.to_string(),
                    })?;
            element.attrs.push((key, value));
        }
        Ok(element)
    }

    /// Books the fragment's bytes as consumed and drops them from the
    /// buffer.
    fn complete(&mut self, element: Element, end: usize) -> Element {
        self.buffer.drain(..end);
        self.consumed += end as u64;
        element
    }
}
