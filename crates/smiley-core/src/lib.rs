//! Canonical inspection model, snapshots and change sets for the smiley lookup.

use std::collections::btree_map::{self, BTreeMap};
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod reconcile;

pub use reconcile::reconcile;

pub const CRATE_NAME: &str = "smiley-core";

/// Stable business identifier taken from the feed.
pub type DocumentId = i64;

/// Number of ranked inspection results carried per establishment.
pub const RANKS: usize = 4;

/// Position of an inspection result, most recent first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rank {
    Last,
    SecondLast,
    ThirdLast,
    FourthLast,
}

impl Rank {
    pub const ALL: [Rank; RANKS] = [
        Rank::Last,
        Rank::SecondLast,
        Rank::ThirdLast,
        Rank::FourthLast,
    ];

    pub const fn index(self) -> usize {
        match self {
            Self::Last => 0,
            Self::SecondLast => 1,
            Self::ThirdLast => 2,
            Self::FourthLast => 3,
        }
    }
}

/// One ranked inspection outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Inspection {
    pub result: Option<i64>,
    pub date: Option<NaiveDate>,
}

impl Inspection {
    pub fn new(result: Option<i64>, date: Option<NaiveDate>) -> Self {
        Self { result, date }
    }
}

/// Normalized, persisted representation of one establishment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "DocumentWire", from = "DocumentWire")]
pub struct CanonicalDocument {
    pub id: DocumentId,
    pub name: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub elite: bool,
    pub inspections: [Inspection; RANKS],
    pub ingested_at: DateTime<Utc>,
}

/// Borrowed projection over the fields that participate in change detection.
/// Identity and ingestion time are left out.
#[derive(Debug, PartialEq, Eq)]
pub struct ComparedFields<'a> {
    name: Option<&'a str>,
    street_address: Option<&'a str>,
    postal_code: Option<&'a str>,
    city: Option<&'a str>,
    latitude: Option<&'a str>,
    longitude: Option<&'a str>,
    elite: bool,
    inspections: &'a [Inspection; RANKS],
}

impl CanonicalDocument {
    /// Document with only an id; every other field absent.
    pub fn bare(id: DocumentId, ingested_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: None,
            street_address: None,
            postal_code: None,
            city: None,
            latitude: None,
            longitude: None,
            elite: false,
            inspections: [Inspection::default(); RANKS],
            ingested_at,
        }
    }

    pub fn inspection(&self, rank: Rank) -> &Inspection {
        &self.inspections[rank.index()]
    }

    pub fn compared_fields(&self) -> ComparedFields<'_> {
        ComparedFields {
            name: self.name.as_deref(),
            street_address: self.street_address.as_deref(),
            postal_code: self.postal_code.as_deref(),
            city: self.city.as_deref(),
            latitude: self.latitude.as_deref(),
            longitude: self.longitude.as_deref(),
            elite: self.elite,
            inspections: &self.inspections,
        }
    }

    /// Value equality over the compared fields only.
    pub fn same_content(&self, other: &Self) -> bool {
        self.compared_fields() == other.compared_fields()
    }
}

/// Flat wire layout exposed to API consumers and stored as the document body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentWire {
    #[serde(rename = "_id")]
    id: DocumentId,
    name: Option<String>,
    street_address: Option<String>,
    postal_code: Option<String>,
    city: Option<String>,
    latitude: Option<String>,
    longitude: Option<String>,
    #[serde(default)]
    elite: bool,
    last_result: Option<i64>,
    last_date: Option<NaiveDate>,
    second_last_result: Option<i64>,
    second_last_date: Option<NaiveDate>,
    third_last_result: Option<i64>,
    third_last_date: Option<NaiveDate>,
    fourth_last_result: Option<i64>,
    fourth_last_date: Option<NaiveDate>,
    date: DateTime<Utc>,
}

impl From<CanonicalDocument> for DocumentWire {
    fn from(doc: CanonicalDocument) -> Self {
        let [last, second, third, fourth] = doc.inspections;
        Self {
            id: doc.id,
            name: doc.name,
            street_address: doc.street_address,
            postal_code: doc.postal_code,
            city: doc.city,
            latitude: doc.latitude,
            longitude: doc.longitude,
            elite: doc.elite,
            last_result: last.result,
            last_date: last.date,
            second_last_result: second.result,
            second_last_date: second.date,
            third_last_result: third.result,
            third_last_date: third.date,
            fourth_last_result: fourth.result,
            fourth_last_date: fourth.date,
            date: doc.ingested_at,
        }
    }
}

impl From<DocumentWire> for CanonicalDocument {
    fn from(wire: DocumentWire) -> Self {
        Self {
            id: wire.id,
            name: wire.name,
            street_address: wire.street_address,
            postal_code: wire.postal_code,
            city: wire.city,
            latitude: wire.latitude,
            longitude: wire.longitude,
            elite: wire.elite,
            inspections: [
                Inspection::new(wire.last_result, wire.last_date),
                Inspection::new(wire.second_last_result, wire.second_last_date),
                Inspection::new(wire.third_last_result, wire.third_last_date),
                Inspection::new(wire.fourth_last_result, wire.fourth_last_date),
            ],
            ingested_at: wire.date,
        }
    }
}

/// Point-in-time mapping of identity to document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    documents: BTreeMap<DocumentId, CanonicalDocument>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot where a later document replaces an earlier one with the same id.
    /// Returns the snapshot and the number of documents that were superseded.
    pub fn from_documents(documents: impl IntoIterator<Item = CanonicalDocument>) -> (Self, usize) {
        let mut snapshot = Self::new();
        let mut superseded = 0usize;
        for doc in documents {
            if snapshot.insert(doc).is_some() {
                superseded += 1;
            }
        }
        (snapshot, superseded)
    }

    pub fn insert(&mut self, doc: CanonicalDocument) -> Option<CanonicalDocument> {
        self.documents.insert(doc.id, doc)
    }

    pub fn get(&self, id: DocumentId) -> Option<&CanonicalDocument> {
        self.documents.get(&id)
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.documents.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DocumentId> + '_ {
        self.documents.keys().copied()
    }

    pub fn iter(&self) -> btree_map::Values<'_, DocumentId, CanonicalDocument> {
        self.documents.values()
    }

    pub fn into_documents(self) -> Vec<CanonicalDocument> {
        self.documents.into_values().collect()
    }
}

impl FromIterator<CanonicalDocument> for Snapshot {
    fn from_iter<I: IntoIterator<Item = CanonicalDocument>>(iter: I) -> Self {
        Self::from_documents(iter).0
    }
}

/// Minimal set of operations that moves the store from one snapshot to another.
///
/// `unchanged` records the ids present on both sides with equal content. Those
/// ids are informational only and never reach the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub to_insert: Vec<CanonicalDocument>,
    pub to_replace: Vec<CanonicalDocument>,
    pub to_delete: Vec<DocumentId>,
    pub unchanged: BTreeSet<DocumentId>,
}

impl ChangeSet {
    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_replace.is_empty() && self.to_delete.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.to_insert.len() + self.to_replace.len() + self.to_delete.len()
    }

    pub fn insert_ids(&self) -> Vec<DocumentId> {
        self.to_insert.iter().map(|d| d.id).collect()
    }

    pub fn replace_ids(&self) -> Vec<DocumentId> {
        self.to_replace.iter().map(|d| d.id).collect()
    }

    /// Counts the applier is expected to report when the whole set commits.
    pub fn planned_counts(&self) -> ApplyCounts {
        ApplyCounts {
            inserted: self.to_insert.len(),
            replaced: self.to_replace.len(),
            deleted: self.to_delete.len(),
        }
    }
}

/// Per-category counts of committed writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounts {
    pub inserted: usize,
    pub replaced: usize,
    pub deleted: usize,
}

impl ApplyCounts {
    pub fn total(&self) -> usize {
        self.inserted + self.replaced + self.deleted
    }
}

impl fmt::Display for ApplyCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} replaced={} deleted={}",
            self.inserted, self.replaced, self.deleted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn ingestion_time_is_not_compared() {
        let mut a = CanonicalDocument::bare(7, ts(1));
        a.name = Some("Kro".into());
        let mut b = a.clone();
        b.ingested_at = ts(2);
        assert!(a.same_content(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn inspection_order_matters() {
        let d1 = NaiveDate::from_ymd_opt(2021, 3, 15).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2020, 1, 2).unwrap();
        let mut a = CanonicalDocument::bare(7, ts(1));
        a.inspections[0] = Inspection::new(Some(1), Some(d1));
        a.inspections[1] = Inspection::new(Some(2), Some(d2));
        let mut b = a.clone();
        b.inspections.swap(0, 1);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn wire_schema_uses_public_field_names() {
        let mut doc = CanonicalDocument::bare(42, ts(3));
        doc.name = Some("Cafe".into());
        doc.elite = true;
        doc.inspections[Rank::SecondLast.index()] =
            Inspection::new(Some(2), NaiveDate::from_ymd_opt(2021, 3, 15));

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_id"], 42);
        assert_eq!(value["name"], "Cafe");
        assert_eq!(value["elite"], true);
        assert_eq!(value["secondLastResult"], 2);
        assert_eq!(value["secondLastDate"], "2021-03-15");
        assert!(value["lastResult"].is_null());
        assert!(value.get("date").is_some());
        assert!(value.get("ingested_at").is_none());

        let back: CanonicalDocument = serde_json::from_value(value).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn snapshot_keeps_last_duplicate() {
        let mut first = CanonicalDocument::bare(1, ts(1));
        first.name = Some("old".into());
        let mut second = CanonicalDocument::bare(1, ts(1));
        second.name = Some("new".into());
        let (snapshot, superseded) = Snapshot::from_documents([first, second]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(superseded, 1);
        assert_eq!(snapshot.get(1).unwrap().name.as_deref(), Some("new"));
    }

    #[test]
    fn counts_display_is_stable() {
        let counts = ApplyCounts {
            inserted: 1,
            replaced: 2,
            deleted: 3,
        };
        assert_eq!(counts.to_string(), "inserted=1 replaced=2 deleted=3");
        assert_eq!(counts.total(), 6);
    }

    #[test]
    fn rank_index_follows_position() {
        assert!(Rank::ALL.iter().enumerate().all(|(i, r)| r.index() == i));
    }

    #[test]
    fn every_compared_field_is_detected() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 15).unwrap();
        let mut base = CanonicalDocument::bare(7, ts(1));
        base.name = Some("Kro".into());
        base.street_address = Some("Torvet 1".into());
        base.postal_code = Some("8000".into());
        base.city = Some("Aarhus C".into());
        base.latitude = Some("56.15".into());
        base.longitude = Some("10.21".into());
        for rank in Rank::ALL {
            base.inspections[rank.index()] = Inspection::new(Some(1), Some(date));
        }

        let edits: [(&str, fn(&mut CanonicalDocument)); 9] = [
            ("name", |d| d.name = Some("Kroen".into())),
            ("street_address", |d| d.street_address = None),
            ("postal_code", |d| d.postal_code = Some("8200".into())),
            ("city", |d| d.city = Some("Aarhus N".into())),
            ("latitude", |d| d.latitude = Some("56.16".into())),
            ("longitude", |d| d.longitude = Some("".into())),
            ("elite", |d| d.elite = !d.elite),
            ("last result", |d| d.inspections[0].result = Some(2)),
            ("fourth last date", |d| d.inspections[3].date = None),
        ];
        for (field, edit) in edits {
            let mut changed = base.clone();
            edit(&mut changed);
            assert!(!base.same_content(&changed), "{field} change went unnoticed");
        }
        assert!(base.same_content(&base.clone()));
    }
}
