//! Raw batch loading, record grouping and per-key entity merging.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use caliber_core::{
    parse_observation_date, parse_price_minor_units, CanonicalEntity, EntityKey, RawObservation,
    SkippableInputError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "caliber-ingest";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("raw input {} does not exist", .path.display())]
    Missing { path: PathBuf },
    #[error("reading raw input {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing raw input {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One element of a raw batch as it was read from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Parsed(RawObservation),
    /// The element is not a listing object; carries the decode error.
    Unreadable(String),
}

impl From<RawObservation> for RawRecord {
    fn from(record: RawObservation) -> Self {
        RawRecord::Parsed(record)
    }
}

/// Load one crawler output file: a JSON array of listing records.
///
/// Only a missing file or a file that is not a JSON array fails the load. Elements that do not
/// decode as listings come back as [`RawRecord::Unreadable`] at their original position.
pub fn load_raw_batch(path: impl AsRef<Path>) -> Result<Vec<RawRecord>, LoadError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            LoadError::Missing {
                path: path.to_path_buf(),
            }
        } else {
            LoadError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let elements: Vec<serde_json::Value> =
        serde_json::from_str(&data).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(elements
        .into_iter()
        .map(|element| match serde_json::from_value::<RawObservation>(element) {
            Ok(record) => RawRecord::Parsed(record),
            Err(err) => RawRecord::Unreadable(err.to_string()),
        })
        .collect())
}

/// A raw record that carries every field required for grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Index of the record in the raw batch.
    pub position: usize,
    pub brand: String,
    pub reference: String,
    pub price: String,
    /// Remaining fields; `brand`, `reference` and `price` have been moved out.
    pub record: RawObservation,
}

impl Observation {
    pub fn from_raw(
        position: usize,
        mut record: RawObservation,
    ) -> Result<(EntityKey, Self), SkippableInputError> {
        let brand = record
            .brand
            .take()
            .ok_or(SkippableInputError::MissingField("brand"))?;
        let reference = record
            .reference
            .take()
            .ok_or(SkippableInputError::MissingField("reference"))?;
        let price = record
            .price
            .take()
            .ok_or(SkippableInputError::MissingField("price"))?;
        let key = EntityKey::derive(&brand, &reference)
            .ok_or(SkippableInputError::MissingField("reference"))?;
        Ok((
            key,
            Self {
                position,
                brand,
                reference,
                price,
                record,
            },
        ))
    }
}

/// An observation dropped before it could contribute to an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedObservation {
    pub position: usize,
    pub key: Option<EntityKey>,
    pub url: Option<String>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct GroupedBatch {
    pub groups: BTreeMap<EntityKey, Vec<Observation>>,
    pub skipped: Vec<SkippedObservation>,
}

impl GroupedBatch {
    pub fn observation_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

/// Group a raw batch by entity key, keeping arrival order inside each group.
pub fn group_observations<I>(raw: I) -> GroupedBatch
where
    I: IntoIterator,
    I::Item: Into<RawRecord>,
{
    let mut batch = GroupedBatch::default();
    for (position, record) in raw.into_iter().enumerate() {
        let record: RawRecord = record.into();
        let (url, grouped) = match record {
            RawRecord::Parsed(record) => (record.url.clone(), Observation::from_raw(position, record)),
            RawRecord::Unreadable(reason) => (None, Err(SkippableInputError::Unreadable(reason))),
        };
        match grouped {
            Ok((key, observation)) => batch.groups.entry(key).or_default().push(observation),
            Err(reason) => {
                debug!(position, %reason, "dropping raw observation");
                batch.skipped.push(SkippedObservation {
                    position,
                    key: None,
                    url,
                    reason: reason.to_string(),
                });
            }
        }
    }
    batch
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// `None` when no observation in the group survived price/date parsing.
    pub entity: Option<CanonicalEntity>,
    pub skipped: Vec<SkippedObservation>,
}

/// Fold one key's observations, in order, into a canonical entity.
pub fn merge(key: &EntityKey, observations: &[Observation]) -> MergeOutcome {
    let mut entity: Option<CanonicalEntity> = None;
    let mut skipped = Vec::new();

    for observation in observations {
        let parsed = parse_price_minor_units(&observation.price).and_then(|price| {
            let date = observation
                .record
                .date
                .as_deref()
                .map(parse_observation_date)
                .transpose()?;
            Ok((price, date))
        });
        let (price, date) = match parsed {
            Ok(parsed) => parsed,
            Err(reason) => {
                warn!(%key, position = observation.position, %reason, "skipping observation");
                skipped.push(SkippedObservation {
                    position: observation.position,
                    key: Some(key.clone()),
                    url: observation.record.url.clone(),
                    reason: reason.to_string(),
                });
                continue;
            }
        };

        let incoming = observation.record.attributes();
        let current = entity.get_or_insert_with(|| {
            CanonicalEntity::new(&observation.brand, &observation.reference, incoming.clone())
        });
        for field in current.attributes.hydrate_from(&incoming) {
            debug!(%key, field = field.as_str(), "hydrated null field");
        }
        current.record_price(observation.record.price_observation(price, date));
    }

    MergeOutcome { entity, skipped }
}

/// Entities for one run, keyed by entity key. Passed between pipeline stages.
#[derive(Debug, Default, Serialize)]
pub struct MergedBatch {
    pub entities: BTreeMap<EntityKey, CanonicalEntity>,
    pub skipped: Vec<SkippedObservation>,
}

pub fn merge_groups(grouped: GroupedBatch) -> MergedBatch {
    let mut merged = MergedBatch {
        entities: BTreeMap::new(),
        skipped: grouped.skipped,
    };
    for (key, observations) in grouped.groups {
        let outcome = merge(&key, &observations);
        merged.skipped.extend(outcome.skipped);
        if let Some(entity) = outcome.entity {
            merged.entities.insert(key, entity);
        }
    }
    merged.skipped.sort_by_key(|s| s.position);
    merged
}

/// Group then merge a raw batch in one call.
pub fn ingest<I>(raw: I) -> MergedBatch
where
    I: IntoIterator,
    I::Item: Into<RawRecord>,
{
    merge_groups(group_observations(raw))
}
