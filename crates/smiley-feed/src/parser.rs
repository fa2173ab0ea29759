use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// One feed record with untyped, trimmed field values keyed by element name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    /// Zero-based position of the record in the feed.
    pub position: usize,
    fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(position: usize) -> Self {
        Self {
            position,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed xml at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("malformed xml at byte {position}: {message}")]
    Malformed { position: u64, message: String },
    #[error("payload contains no root element")]
    NoRootElement,
    #[error("payload ended with {open} unclosed element(s)")]
    UnexpectedEof { open: usize },
}

/// Field currently being collected inside a record.
struct OpenField {
    name: String,
    value: String,
}

/// Decodes the payload into records named `record_element`, in document order.
///
/// Direct children of a record become fields. Deeper nesting is flattened into
/// the enclosing field's text.
pub fn parse_records(payload: &str, record_element: &str) -> Result<Vec<RawRecord>, ParseError> {
    // Text is trimmed once per field at its closing tag, so whitespace between
    // nested pieces survives.
    let mut reader = Reader::from_str(payload);

    let mut records = Vec::new();
    let mut depth = 0usize;
    let mut saw_root = false;
    let mut record: Option<(usize, RawRecord)> = None;
    let mut field: Option<OpenField> = None;

    loop {
        let event = reader.read_event().map_err(|source| ParseError::Xml {
            position: reader.buffer_position() as u64,
            source,
        })?;

        match event {
            Event::Start(start) => {
                depth += 1;
                saw_root = true;
                let name = element_name(&start, &reader)?;
                match record.as_ref().map(|(record_depth, _)| *record_depth) {
                    None if name == record_element => {
                        record = Some((depth, RawRecord::new(records.len())));
                    }
                    Some(record_depth) if field.is_none() && depth == record_depth + 1 => {
                        field = Some(OpenField {
                            name,
                            value: String::new(),
                        });
                    }
                    _ => {}
                }
            }
            Event::Empty(start) => {
                saw_root = true;
                let name = element_name(&start, &reader)?;
                match record.as_mut() {
                    None if name == record_element => {
                        records.push(RawRecord::new(records.len()));
                    }
                    Some((record_depth, current)) if field.is_none() && depth == *record_depth => {
                        current.insert(name, String::new());
                    }
                    _ => {}
                }
            }
            Event::Text(text) => {
                if let Some(open) = field.as_mut() {
                    let value = text.unescape().map_err(|err| ParseError::Malformed {
                        position: reader.buffer_position() as u64,
                        message: err.to_string(),
                    })?;
                    open.value.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(open) = field.as_mut() {
                    let value = std::str::from_utf8(&data).map_err(|err| ParseError::Malformed {
                        position: reader.buffer_position() as u64,
                        message: err.to_string(),
                    })?;
                    open.value.push_str(value);
                }
            }
            Event::End(_) => {
                if depth == 0 {
                    return Err(ParseError::Malformed {
                        position: reader.buffer_position() as u64,
                        message: "closing tag without an open element".to_string(),
                    });
                }
                match record.as_ref().map(|(record_depth, _)| *record_depth) {
                    Some(record_depth) if depth == record_depth + 1 => {
                        if let (Some(open), Some((_, current))) = (field.take(), record.as_mut()) {
                            current.insert(open.name, open.value.trim().to_string());
                        }
                    }
                    Some(record_depth) if depth == record_depth => {
                        if let Some((_, done)) = record.take() {
                            records.push(done);
                        }
                    }
                    _ => {}
                }
                depth -= 1;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth != 0 {
        return Err(ParseError::UnexpectedEof { open: depth });
    }
    if !saw_root {
        return Err(ParseError::NoRootElement);
    }
    Ok(records)
}

fn element_name(start: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<String, ParseError> {
    std::str::from_utf8(start.name().as_ref())
        .map(str::to_string)
        .map_err(|err| ParseError::Malformed {
            position: reader.buffer_position() as u64,
            message: err.to_string(),
        })
}
