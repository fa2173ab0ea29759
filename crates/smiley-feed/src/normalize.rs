use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use smiley_core::{CanonicalDocument, DocumentId, Inspection, Rank};
use thiserror::Error;

use crate::mapping::FieldMapping;
use crate::parser::RawRecord;

const FEED_DATE_FORMAT: &str = "%d-%m-%Y";
const FEED_DATETIME_FORMAT: &str = "%d-%m-%Y %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordFault {
    #[error("identity field `{field}` is missing or empty")]
    MissingId { field: String },
    #[error("field `{field}` is not an integer: {value:?}")]
    InvalidInteger { field: String, value: String },
    #[error("field `{field}` is not a DD-MM-YYYY date: {value:?}")]
    InvalidDate { field: String, value: String },
}

/// A single feed record that could not be normalized. The rest of the batch is unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record #{position} rejected: {fault}")]
pub struct MalformedRecordError {
    pub position: usize,
    /// Raw identity value, when the record carried one.
    pub raw_id: Option<String>,
    pub fault: RecordFault,
}

/// Maps raw feed records onto canonical documents stamped with one ingestion time.
#[derive(Debug, Clone)]
pub struct Normalizer {
    mapping: FieldMapping,
    ingested_at: DateTime<Utc>,
}

impl Normalizer {
    pub fn new(mapping: FieldMapping, ingested_at: DateTime<Utc>) -> Self {
        Self {
            mapping,
            ingested_at,
        }
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn ingested_at(&self) -> DateTime<Utc> {
        self.ingested_at
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<CanonicalDocument, MalformedRecordError> {
        let m = &self.mapping;
        let reject = |fault: RecordFault| MalformedRecordError {
            position: raw.position,
            raw_id: raw.get(&m.id).map(str::to_string),
            fault,
        };

        let id: DocumentId = integer_field(raw, &m.id)
            .map_err(reject)?
            .ok_or_else(|| reject(RecordFault::MissingId { field: m.id.clone() }))?;

        let elite = integer_field(raw, &m.elite).map_err(reject)? == Some(1);

        let mut inspections = [Inspection::default(); smiley_core::RANKS];
        for rank in Rank::ALL {
            let fields = m.inspection(rank);
            inspections[rank.index()] = Inspection {
                result: integer_field(raw, &fields.result).map_err(reject)?,
                date: date_field(raw, &fields.date).map_err(reject)?,
            };
        }

        Ok(CanonicalDocument {
            id,
            name: text_field(raw, &m.name),
            street_address: text_field(raw, &m.street_address),
            postal_code: text_field(raw, &m.postal_code),
            city: text_field(raw, &m.city),
            latitude: text_field(raw, &m.latitude),
            longitude: text_field(raw, &m.longitude),
            elite,
            inspections,
            ingested_at: self.ingested_at,
        })
    }
}

fn text_field(raw: &RawRecord, field: &str) -> Option<String> {
    raw.get(field).map(str::to_string)
}

fn present<'a>(raw: &'a RawRecord, field: &str) -> Option<&'a str> {
    raw.get(field).filter(|value| !value.is_empty())
}

fn integer_field(raw: &RawRecord, field: &str) -> Result<Option<i64>, RecordFault> {
    present(raw, field)
        .map(|value| {
            value.parse::<i64>().map_err(|_| RecordFault::InvalidInteger {
                field: field.to_string(),
                value: value.to_string(),
            })
        })
        .transpose()
}

fn date_field(raw: &RawRecord, field: &str) -> Result<Option<NaiveDate>, RecordFault> {
    present(raw, field)
        .map(|value| {
            parse_feed_date(value).ok_or_else(|| RecordFault::InvalidDate {
                field: field.to_string(),
                value: value.to_string(),
            })
        })
        .transpose()
}

/// Parses the feed's day-month-year date, tolerating a trailing time of day.
pub fn parse_feed_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, FEED_DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(value, FEED_DATETIME_FORMAT).map(|dt| dt.date()))
        .ok()
}
