//! Core domain model for watch price reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "caliber-core";

/// Name of the array field carrying price history in stored documents.
pub const PRICE_HISTORY_FIELD: &str = "price_history";

/// Why a single raw observation was dropped. Never fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkippableInputError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unparseable price {0:?}")]
    InvalidPrice(String),
    #[error("unparseable date {0:?}")]
    InvalidDate(String),
    #[error("unreadable record: {0}")]
    Unreadable(String),
}

/// Canonical identifier for one (brand, reference) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    /// Derive the key for a brand/reference pair, or `None` when either side is blank.
    pub fn derive(brand: &str, reference: &str) -> Option<Self> {
        let brand = normalize_key_fragment(brand)?;
        let reference = normalize_key_fragment(reference)?;
        Some(Self(format!("{brand}{reference}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn normalize_key(brand: &str, reference: &str) -> Option<EntityKey> {
    EntityKey::derive(brand, reference)
}

/// Lowercase, collapse whitespace runs to `_` and replace path separators with `_`.
pub fn normalize_key_fragment(input: &str) -> Option<String> {
    let joined = input.split_whitespace().collect::<Vec<_>>().join("_");
    if joined.is_empty() {
        return None;
    }
    Some(
        joined
            .to_lowercase()
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect(),
    )
}

/// Parse a listing price such as `"$8,500"` or `"USD 1,299.50"` into cents.
pub fn parse_price_minor_units(text: &str) -> Result<i64, SkippableInputError> {
    let invalid = || SkippableInputError::InvalidPrice(text.to_string());

    let core = text.trim_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'));
    let digits: String = core
        .chars()
        .filter(|c| !matches!(c, ',' | '\'' | '_') && !c.is_whitespace())
        .collect();
    if digits.is_empty() || digits.starts_with('-') {
        return Err(invalid());
    }

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits.as_str(), ""),
    };
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if whole.is_empty() || !all_digits(whole) || !all_digits(fraction) || fraction.len() > 2 {
        return Err(invalid());
    }

    let whole: i64 = whole.parse().map_err(|_| invalid())?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => fraction.parse().map_err(|_| invalid())?,
    };
    whole
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(invalid)
}

pub fn parse_observation_date(text: &str) -> Result<NaiveDate, SkippableInputError> {
    NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
        .map_err(|_| SkippableInputError::InvalidDate(text.to_string()))
}

/// Entity-level attributes that are sticky once set and hydratable while null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeField {
    Model,
    Nickname,
    CaseSize,
    Movement,
    Caliber,
    PowerReserve,
    Gender,
    LugWidth,
    MaxWristSize,
    CaseThickness,
}

impl AttributeField {
    pub const ALL: [AttributeField; 10] = [
        AttributeField::Model,
        AttributeField::Nickname,
        AttributeField::CaseSize,
        AttributeField::Movement,
        AttributeField::Caliber,
        AttributeField::PowerReserve,
        AttributeField::Gender,
        AttributeField::LugWidth,
        AttributeField::MaxWristSize,
        AttributeField::CaseThickness,
    ];

    /// Field name as written in store documents.
    pub fn as_str(self) -> &'static str {
        match self {
            AttributeField::Model => "model",
            AttributeField::Nickname => "nickname",
            AttributeField::CaseSize => "case_size",
            AttributeField::Movement => "movement",
            AttributeField::Caliber => "caliber",
            AttributeField::PowerReserve => "power_reserve",
            AttributeField::Gender => "gender",
            AttributeField::LugWidth => "lug_width",
            AttributeField::MaxWristSize => "max_wrist_size",
            AttributeField::CaseThickness => "case_thickness",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub model: Option<String>,
    pub nickname: Option<String>,
    pub case_size: Option<String>,
    pub movement: Option<String>,
    pub caliber: Option<String>,
    pub power_reserve: Option<String>,
    pub gender: Option<String>,
    pub lug_width: Option<String>,
    pub max_wrist_size: Option<String>,
    pub case_thickness: Option<String>,
}

impl Attributes {
    pub fn get(&self, field: AttributeField) -> Option<&str> {
        let slot = match field {
            AttributeField::Model => &self.model,
            AttributeField::Nickname => &self.nickname,
            AttributeField::CaseSize => &self.case_size,
            AttributeField::Movement => &self.movement,
            AttributeField::Caliber => &self.caliber,
            AttributeField::PowerReserve => &self.power_reserve,
            AttributeField::Gender => &self.gender,
            AttributeField::LugWidth => &self.lug_width,
            AttributeField::MaxWristSize => &self.max_wrist_size,
            AttributeField::CaseThickness => &self.case_thickness,
        };
        slot.as_deref()
    }

    fn slot_mut(&mut self, field: AttributeField) -> &mut Option<String> {
        match field {
            AttributeField::Model => &mut self.model,
            AttributeField::Nickname => &mut self.nickname,
            AttributeField::CaseSize => &mut self.case_size,
            AttributeField::Movement => &mut self.movement,
            AttributeField::Caliber => &mut self.caliber,
            AttributeField::PowerReserve => &mut self.power_reserve,
            AttributeField::Gender => &mut self.gender,
            AttributeField::LugWidth => &mut self.lug_width,
            AttributeField::MaxWristSize => &mut self.max_wrist_size,
            AttributeField::CaseThickness => &mut self.case_thickness,
        }
    }

    /// Fill `field` with `value` only if it is currently null. Returns whether it changed.
    pub fn hydrate(&mut self, field: AttributeField, value: Option<&str>) -> bool {
        let slot = self.slot_mut(field);
        match (slot.as_ref(), value) {
            (None, Some(value)) => {
                *slot = Some(value.to_string());
                true
            }
            _ => false,
        }
    }

    /// Hydrate every null field from `other`, returning the fields that were filled.
    pub fn hydrate_from(&mut self, other: &Attributes) -> Vec<AttributeField> {
        AttributeField::ALL
            .into_iter()
            .filter(|field| self.hydrate(*field, other.get(*field)))
            .collect()
    }
}

/// One dated price point. Equality is structural over every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PriceObservation {
    /// Amount in minor currency units.
    pub price: i64,
    pub date: Option<NaiveDate>,
    pub condition: Option<String>,
    pub url: Option<String>,
    #[serde(rename = "box")]
    pub has_box: Option<bool>,
    #[serde(rename = "paper")]
    pub has_paper: Option<bool>,
    #[serde(rename = "manual")]
    pub has_manual: Option<bool>,
    pub paper_date: Option<String>,
    pub approximate_age: Option<String>,
    pub dial_color: Option<String>,
    pub year: Option<String>,
    pub case_material: Option<String>,
    pub bracelet: Option<String>,
    pub case_back: Option<String>,
}

impl PriceObservation {
    pub fn new(price: i64, date: Option<NaiveDate>) -> Self {
        Self {
            price,
            date,
            condition: None,
            url: None,
            has_box: None,
            has_paper: None,
            has_manual: None,
            paper_date: None,
            approximate_age: None,
            dial_color: None,
            year: None,
            case_material: None,
            bracelet: None,
            case_back: None,
        }
    }

    pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Reconciled record for one [`EntityKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub brand: String,
    pub reference: String,
    #[serde(flatten)]
    pub attributes: Attributes,
    #[serde(default)]
    pub price_history: Vec<PriceObservation>,
}

impl CanonicalEntity {
    pub fn new(brand: impl Into<String>, reference: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            brand: brand.into(),
            reference: reference.into(),
            attributes,
            price_history: Vec::new(),
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        EntityKey::derive(&self.brand, &self.reference)
    }

    /// Append `observation` unless a structurally identical entry is already present.
    pub fn record_price(&mut self, observation: PriceObservation) -> bool {
        if self.price_history.contains(&observation) {
            return false;
        }
        self.price_history.push(observation);
        true
    }

    /// Full document representation; null attributes are written explicitly.
    pub fn to_document(&self) -> Result<serde_json::Map<String, JsonValue>, serde_json::Error> {
        match serde_json::to_value(self)? {
            JsonValue::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "entity serialized to non-object {other}"
            ))),
        }
    }
}

/// One crawler record as delivered, with typed known fields and an extras bag.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawObservation {
    #[serde(default, deserialize_with = "lenient_text")]
    pub brand: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub condition: Option<String>,

    #[serde(default, deserialize_with = "lenient_text")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub nickname: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub case_size: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub movement: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub caliber: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub power_reserve: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub lug_width: Option<String>,
    #[serde(
        default,
        rename = "max._wrist_size",
        alias = "max_wrist_size",
        deserialize_with = "lenient_text"
    )]
    pub max_wrist_size: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub case_thickness: Option<String>,

    #[serde(default, rename = "box", deserialize_with = "lenient_flag")]
    pub has_box: Option<bool>,
    #[serde(default, rename = "paper", deserialize_with = "lenient_flag")]
    pub has_paper: Option<bool>,
    #[serde(default, rename = "manual", deserialize_with = "lenient_flag")]
    pub has_manual: Option<bool>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub paper_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub approximate_age: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub dial_color: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub case_material: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub bracelet: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub case_back: Option<String>,

    /// Keys the schema does not recognize.
    #[serde(flatten)]
    pub extras: BTreeMap<String, JsonValue>,
}

impl RawObservation {
    pub fn attributes(&self) -> Attributes {
        Attributes {
            model: self.model.clone(),
            nickname: self.nickname.clone(),
            case_size: self.case_size.clone(),
            movement: self.movement.clone(),
            caliber: self.caliber.clone(),
            power_reserve: self.power_reserve.clone(),
            gender: self.gender.clone(),
            lug_width: self.lug_width.clone(),
            max_wrist_size: self.max_wrist_size.clone(),
            case_thickness: self.case_thickness.clone(),
        }
    }

    /// Build the price entry for this record from an already-parsed amount and date.
    pub fn price_observation(&self, price: i64, date: Option<NaiveDate>) -> PriceObservation {
        PriceObservation {
            price,
            date,
            condition: self.condition.clone(),
            url: self.url.clone(),
            has_box: self.has_box,
            has_paper: self.has_paper,
            has_manual: self.has_manual,
            paper_date: self.paper_date.clone(),
            approximate_age: self.approximate_age.clone(),
            dial_color: self.dial_color.clone(),
            year: self.year.clone(),
            case_material: self.case_material.clone(),
            bracelet: self.bracelet.clone(),
            case_back: self.case_back.clone(),
        }
    }
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => text_or_none(&s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(true)) => Some("Yes".to_string()),
        Some(JsonValue::Bool(false)) => Some("No".to_string()),
        _ => None,
    })
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::Bool(b)) => Some(b),
        Some(JsonValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    })
}
