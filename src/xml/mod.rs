//! XML fragments as in-memory trees.
//!
//! The wire exchanges self-contained fragments, each a single root
//! element. [`Element`] is the tree a fragment parses into and the
//! builder messages are serialised from; [`stream::FragmentReader`]
//! delimits fragments in a raw byte stream.
pub mod stream;

use crate::error::{Error, RequestError, TransportError};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::str::FromStr;

/// One XML element: name, attributes in document order, child
/// elements and concatenated character data.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Element {
    /// Tag name.
    pub name: String,
    /// Attributes in document order.
    pub attrs: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<Element>,
    /// Concatenated character data of the element itself.
    pub text: String,
}

impl Element {
    /// Creates an element with the given tag name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Adds an attribute. Builder style.
    pub fn attr(mut self, name: &str, value: impl ToString) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    /// Adds a child element. Builder style.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    /// Sets character data. Builder style.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Returns an attribute value if present.
    pub fn attr_opt(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Returns an attribute value or the missing-attribute error the
    /// protocol mandates.
    pub fn required_attr(&self, name: &str) -> Result<&str, Error> {
        self.attr_opt(name)
            .ok_or_else(|| RequestError::MissingAttribute(name.to_string()).into())
    }

    /// Parses a required numeric attribute.
    pub fn number_attr<T: FromStr>(&self, name: &str) -> Result<T, Error> {
        self.required_attr(name)?
            .parse()
            .map_err(|_| RequestError::InvalidNumber(name.to_string()).into())
    }

    /// Parses an optional numeric attribute.
    pub fn opt_number_attr<T: FromStr>(&self, name: &str) -> Result<Option<T>, Error> {
        match self.attr_opt(name) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| RequestError::InvalidNumber(name.to_string()).into()),
        }
    }

    /// Returns the first child with the given tag name.
    pub fn first_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    /// Iterates over the children with the given tag name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    /// Serialises the element as one self-contained fragment.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new(Vec::new());
        self.write(&mut writer)
            .expect("writing to an in-memory buffer cannot fail");
        writer.into_inner()
    }

    fn write(&self, writer: &mut Writer<Vec<u8>>) -> quick_xml::Result<()> {
        let mut start = BytesStart::owned(self.name.as_bytes().to_vec(), self.name.len());
        for (key, value) in &self.attrs {
            start.push_attribute((key.as_str(), value.as_str()));
        }
        if self.children.is_empty() && self.text.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
        writer.write_event(Event::Start(start))?;
        if !self.text.is_empty() {
            writer.write_event(Event::Text(BytesText::from_plain_str(&self.text)))?;
        }
        for child in &self.children {
            child.write(writer)?;
        }
        writer.write_event(Event::End(BytesEnd::owned(self.name.as_bytes().to_vec())))?;
        Ok(())
    }

    /// Parses a byte buffer that contains exactly one fragment.
    pub fn parse(bytes: &[u8]) -> Result<Element, Error> {
        let mut reader = stream::FragmentReader::new();
        reader.feed(bytes);
        reader
            .next_fragment()?
            .ok_or_else(|| TransportError::Framing("truncated fragment".to_string()).into())
    }
}
