//! Minimal XML document model.
//!
//! Service arguments are written with [`XmlWriter`] and replies are read
//! back as an [`XmlElement`] tree. Lookups take a restricted path syntax:
//!
//! - `a/b/c` selects the first `c` under `b` under `a`
//! - `a/b[@id='7']` keeps only `b` elements whose `id` attribute is `7`
//! - a trailing `/@attr` (or a bare `@attr`) selects an attribute instead of
//!   element text

use chrono::NaiveDateTime;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fmt;
use thiserror::Error;

/// Date format used by the server for date values.
pub const DATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S";

/// XML model errors.
#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed XML: {0}")]
    Parse(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid value at {path:?}: {value:?}")]
    InvalidValue { path: String, value: String },
}

/// An element of a parsed or constructed XML document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    name: String,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<XmlElement>,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(child);
        self
    }

    /// Parses a complete document and returns its root element.
    pub fn parse(text: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_str(text);
        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| XmlError::Parse(e.to_string()))?;
            match event {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    let mut element = stack
                        .pop()
                        .ok_or_else(|| XmlError::Parse("unbalanced end tag".to_string()))?;
                    element.normalize_text();
                    attach(&mut stack, &mut root, element)?;
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                        current.append_text(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.append_text(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(XmlError::Parse("unexpected end of document".to_string()));
        }
        root.ok_or_else(|| XmlError::Parse("document has no root element".to_string()))
    }

    /// Parses a document from UTF-8 bytes.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, XmlError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| XmlError::Parse(format!("invalid UTF-8: {}", e)))?;
        Self::parse(text)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Text content of this element.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn children(&self) -> &[XmlElement] {
        &self.children
    }

    pub fn add_child(&mut self, child: XmlElement) {
        self.children.push(child);
    }

    /// Returns the first element matching `path`.
    pub fn element(&self, path: &str) -> Result<Option<&XmlElement>, XmlError> {
        Ok(self.elements(path)?.into_iter().next())
    }

    /// Returns all elements matching `path`.
    pub fn elements(&self, path: &str) -> Result<Vec<&XmlElement>, XmlError> {
        if path.contains('@') && attribute_split(path).is_some() {
            return Err(XmlError::InvalidPath(format!(
                "element path selects an attribute: {}",
                path
            )));
        }
        let steps = parse_steps(path)?;
        Ok(self.select(&steps))
    }

    /// Returns the text (or attribute value) at `path`.
    pub fn value(&self, path: &str) -> Result<Option<String>, XmlError> {
        Ok(self.values(path)?.into_iter().next())
    }

    /// Returns the texts (or attribute values) of every node matching `path`.
    pub fn values(&self, path: &str) -> Result<Vec<String>, XmlError> {
        match attribute_split(path) {
            Some((element_path, attr)) => {
                let holders = if element_path.is_empty() {
                    vec![self]
                } else {
                    self.select(&parse_steps(element_path)?)
                };
                Ok(holders
                    .into_iter()
                    .filter_map(|e| e.attribute(attr).map(str::to_string))
                    .collect())
            }
            None => Ok(self
                .select(&parse_steps(path)?)
                .into_iter()
                .map(|e| e.text.clone().unwrap_or_default())
                .collect()),
        }
    }

    pub fn int_value(&self, path: &str) -> Result<Option<i64>, XmlError> {
        self.typed_value(path, |v| v.trim().parse::<i64>().ok())
    }

    pub fn float_value(&self, path: &str) -> Result<Option<f64>, XmlError> {
        self.typed_value(path, |v| v.trim().parse::<f64>().ok())
    }

    /// Boolean value at `path`: `yes`, `true` and `1` are true, anything
    /// else is false.
    pub fn bool_value(&self, path: &str) -> Result<Option<bool>, XmlError> {
        self.typed_value(path, |v| {
            Some(matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "yes" | "true" | "1"
            ))
        })
    }

    pub fn date_value(&self, path: &str) -> Result<Option<NaiveDateTime>, XmlError> {
        self.typed_value(path, |v| NaiveDateTime::parse_from_str(v.trim(), DATE_FORMAT).ok())
    }

    fn typed_value<T>(
        &self,
        path: &str,
        convert: impl FnOnce(&str) -> Option<T>,
    ) -> Result<Option<T>, XmlError> {
        match self.value(path)? {
            Some(value) => match convert(&value) {
                Some(v) => Ok(Some(v)),
                None => Err(XmlError::InvalidValue {
                    path: path.to_string(),
                    value,
                }),
            },
            None => Ok(None),
        }
    }

    fn select(&self, steps: &[Step<'_>]) -> Vec<&XmlElement> {
        let mut current = vec![self];
        for step in steps {
            current = current
                .into_iter()
                .flat_map(|e| e.children.iter())
                .filter(|c| step.matches(c))
                .collect();
            if current.is_empty() {
                break;
            }
        }
        current
    }

    fn append_text(&mut self, text: &str) {
        match self.text {
            Some(ref mut existing) => existing.push_str(text),
            None => self.text = Some(text.to_string()),
        }
    }

    /// Drops whitespace-only text between child elements.
    fn normalize_text(&mut self) {
        if self.text.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.text = None;
        }
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.text.is_none() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        if let Some(ref text) = self.text {
            out.push_str(&escape(text.as_str()));
        }
        for child in &self.children {
            child.write_to(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Serializes the element and its subtree (no XML declaration).
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }
}

impl fmt::Display for XmlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<XmlElement, XmlError> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Parse(e.to_string()))?;
        element.attributes.push((key, value.into_owned()));
    }
    Ok(element)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    element: XmlElement,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(element);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(element);
            Ok(())
        }
        None => Err(XmlError::Parse("multiple root elements".to_string())),
    }
}

/// One `/`-separated step of a path.
#[derive(Debug, PartialEq)]
struct Step<'a> {
    name: &'a str,
    predicate: Option<(&'a str, &'a str)>,
}

impl Step<'_> {
    fn matches(&self, element: &XmlElement) -> bool {
        if element.name != self.name {
            return false;
        }
        match self.predicate {
            Some((attr, value)) => element.attribute(attr) == Some(value),
            None => true,
        }
    }
}

/// Splits `a/b/@attr` into (`a/b`, `attr`) and `@attr` into (``, `attr`).
fn attribute_split(path: &str) -> Option<(&str, &str)> {
    if let Some(attr) = path.strip_prefix('@') {
        return Some(("", attr));
    }
    path.rfind("/@").map(|idx| (&path[..idx], &path[idx + 2..]))
}

fn parse_steps(path: &str) -> Result<Vec<Step<'_>>, XmlError> {
    let invalid = || XmlError::InvalidPath(path.to_string());
    let mut steps = Vec::new();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let step = match segment.find('[') {
            None => Step {
                name: segment,
                predicate: None,
            },
            Some(open) => {
                let inner = segment[open..]
                    .strip_prefix("[@")
                    .and_then(|s| s.strip_suffix(']'))
                    .ok_or_else(invalid)?;
                let (attr, quoted) = inner.split_once('=').ok_or_else(invalid)?;
                let value = quoted
                    .strip_prefix('\'')
                    .and_then(|v| v.strip_suffix('\''))
                    .or_else(|| quoted.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                    .ok_or_else(invalid)?;
                Step {
                    name: &segment[..open],
                    predicate: Some((attr, value)),
                }
            }
        };
        if step.name.is_empty() {
            return Err(invalid());
        }
        steps.push(step);
    }

    if steps.is_empty() {
        return Err(invalid());
    }
    Ok(steps)
}

/// Incremental writer for XML documents.
///
/// Elements are opened with [`push`](Self::push), closed with
/// [`pop`](Self::pop), and leaves are added with [`add`](Self::add).
/// Attributes with a `None` value are omitted.
#[derive(Debug, Default)]
pub struct XmlWriter {
    stack: Vec<String>,
    out: String,
}

impl XmlWriter {
    /// Creates a writer with `root` already opened.
    pub fn new(root: &str) -> Self {
        let mut writer = Self::default();
        writer.push(root);
        writer
    }

    pub fn push(&mut self, name: &str) -> &mut Self {
        self.push_with(name, &[])
    }

    pub fn push_with(&mut self, name: &str, attributes: &[(&str, Option<&str>)]) -> &mut Self {
        self.open_tag(name, attributes);
        self.out.push('>');
        self.stack.push(name.to_string());
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        if let Some(name) = self.stack.pop() {
            self.out.push_str("</");
            self.out.push_str(&name);
            self.out.push('>');
        }
        self
    }

    pub fn add(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        self.add_with(name, value, &[])
    }

    pub fn add_with(
        &mut self,
        name: &str,
        value: impl fmt::Display,
        attributes: &[(&str, Option<&str>)],
    ) -> &mut Self {
        self.open_tag(name, attributes);
        self.out.push('>');
        self.out.push_str(&escape(value.to_string().as_str()));
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
        self
    }

    /// Writes `element` and its subtree at the current position.
    pub fn add_element(&mut self, element: &XmlElement) -> &mut Self {
        element.write_to(&mut self.out);
        self
    }

    /// Writes only the children of `element` at the current position.
    pub fn add_children(&mut self, element: &XmlElement) -> &mut Self {
        for child in element.children() {
            child.write_to(&mut self.out);
        }
        self
    }

    /// Closes every open element and returns the document text.
    pub fn doc_text(mut self) -> String {
        while !self.stack.is_empty() {
            self.pop();
        }
        self.out
    }

    /// Closes every open element and parses the result.
    pub fn doc_elem(self) -> Result<XmlElement, XmlError> {
        XmlElement::parse(&self.doc_text())
    }

    fn open_tag(&mut self, name: &str, attributes: &[(&str, Option<&str>)]) {
        self.out.push('<');
        self.out.push_str(name);
        for (key, value) in attributes {
            if let Some(value) = value {
                self.out.push(' ');
                self.out.push_str(key);
                self.out.push_str("=\"");
                self.out.push_str(&escape(*value));
                self.out.push('"');
            }
        }
    }
}
