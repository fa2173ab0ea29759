//! XML feed decoding and normalization into canonical inspection documents.

mod mapping;
mod normalize;
mod parser;

pub use mapping::{FieldMapping, InspectionFields};
pub use normalize::{parse_feed_date, MalformedRecordError, Normalizer, RecordFault};
pub use parser::{parse_records, ParseError, RawRecord};

use smiley_core::CanonicalDocument;
use tracing::warn;

pub const CRATE_NAME: &str = "smiley-feed";

/// Outcome of decoding one payload: accepted documents in feed order plus rejected records.
#[derive(Debug, Clone, Default)]
pub struct DecodedFeed {
    pub records_seen: usize,
    pub documents: Vec<CanonicalDocument>,
    pub rejected: Vec<MalformedRecordError>,
}

/// Parses the payload and normalizes every record.
///
/// Structural problems abort with [`ParseError`]; a record that cannot be
/// normalized is logged, counted and skipped.
pub fn decode_feed(payload: &str, normalizer: &Normalizer) -> Result<DecodedFeed, ParseError> {
    let records = parse_records(payload, &normalizer.mapping().record_element)?;
    let mut decoded = DecodedFeed {
        records_seen: records.len(),
        documents: Vec::with_capacity(records.len()),
        rejected: Vec::new(),
    };

    for raw in &records {
        match normalizer.normalize(raw) {
            Ok(doc) => decoded.documents.push(doc),
            Err(err) => {
                warn!(
                    position = err.position,
                    raw_id = err.raw_id.as_deref().unwrap_or(""),
                    fault = %err.fault,
                    "skipping malformed feed record"
                );
                decoded.rejected.push(err);
            }
        }
    }

    Ok(decoded)
}
