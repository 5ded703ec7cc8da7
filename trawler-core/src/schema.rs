//! Field specifications shared by the indexing helper and the query
//! compiler.
//!
//! Deep schema introspection lives outside the data plane; this is the
//! minimal registry the core needs: a type, a value slot, a term prefix
//! and the configured accuracy levels per field.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::backend::Document;
use crate::errors::{Error, Result};
use crate::query::terms as generate_terms;
use crate::serialise::{fnv1a64, prefixed, sortable_serialise};

pub const CTYPE_INTEGER: u8 = b'N';
pub const CTYPE_FLOAT: u8 = b'N';
pub const CTYPE_BOOLEAN: u8 = b'B';
pub const CTYPE_KEYWORD: u8 = b'K';
pub const CTYPE_TEXT: u8 = b'S';
pub const CTYPE_DATE: u8 = b'D';
pub const CTYPE_UUID: u8 = b'U';
pub const CTYPE_GEO: u8 = b'G';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Positive,
    Float,
    Boolean,
    Keyword,
    Text,
    Date,
    Time,
    Timedelta,
    Uuid,
    Geo,
    Empty,
}

impl FieldType {
    pub fn ctype(self) -> u8 {
        match self {
            FieldType::Integer | FieldType::Positive | FieldType::Time | FieldType::Timedelta => {
                CTYPE_INTEGER
            }
            FieldType::Float => CTYPE_FLOAT,
            FieldType::Boolean => CTYPE_BOOLEAN,
            FieldType::Keyword | FieldType::Empty => CTYPE_KEYWORD,
            FieldType::Text => CTYPE_TEXT,
            FieldType::Date => CTYPE_DATE,
            FieldType::Uuid => CTYPE_UUID,
            FieldType::Geo => CTYPE_GEO,
        }
    }
}

/// Calendar units for date accuracy buckets, coarse to fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnitTime {
    Millennium,
    Century,
    Decade,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl UnitTime {
    pub fn from_name(name: &str) -> Option<UnitTime> {
        Some(match name {
            "millennium" => UnitTime::Millennium,
            "century" => UnitTime::Century,
            "decade" => UnitTime::Decade,
            "year" => UnitTime::Year,
            "month" => UnitTime::Month,
            "day" => UnitTime::Day,
            "hour" => UnitTime::Hour,
            "minute" => UnitTime::Minute,
            "second" => UnitTime::Second,
            _ => return None,
        })
    }

    /// Approximate span in seconds, used to order levels against a range.
    pub fn span_secs(self) -> f64 {
        match self {
            UnitTime::Second => 1.0,
            UnitTime::Minute => 60.0,
            UnitTime::Hour => 3600.0,
            UnitTime::Day => 86_400.0,
            UnitTime::Month => 2_678_400.0,
            UnitTime::Year => 31_536_000.0,
            UnitTime::Decade => 315_360_000.0,
            UnitTime::Century => 3_153_600_000.0,
            UnitTime::Millennium => 31_536_000_000.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub ty: FieldType,
    pub slot: u32,
    pub prefix: Vec<u8>,
    /// Bucket sizes for numeric fields, HTM levels for geo.
    pub accuracy: Vec<u64>,
    /// Calendar units for date fields.
    pub date_accuracy: Vec<UnitTime>,
    pub acc_prefixes: Vec<Vec<u8>>,
    /// Queries against this field resolve through a synthetic prefix
    /// computed from the value's guessed type.
    pub namespace: bool,
    /// Language code handed to the external stemmer; identity when unset.
    pub stem_language: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, ty: FieldType, slot: u32) -> FieldSpec {
        let name = name.into();
        let prefix = field_prefix(&name);
        FieldSpec {
            name,
            ty,
            slot,
            prefix,
            accuracy: Vec::new(),
            date_accuracy: Vec::new(),
            acc_prefixes: Vec::new(),
            namespace: false,
            stem_language: None,
        }
    }

    pub fn with_accuracy(mut self, accuracy: Vec<u64>) -> FieldSpec {
        self.acc_prefixes = accuracy
            .iter()
            .map(|acc| accuracy_prefix(&self.name, &acc.to_string()))
            .collect();
        self.accuracy = accuracy;
        self
    }

    pub fn with_date_accuracy(mut self, accuracy: Vec<UnitTime>) -> FieldSpec {
        self.acc_prefixes = accuracy
            .iter()
            .map(|unit| accuracy_prefix(&self.name, &format!("{unit:?}").to_lowercase()))
            .collect();
        self.date_accuracy = accuracy;
        self
    }

    pub fn namespaced(mut self) -> FieldSpec {
        self.namespace = true;
        self
    }

    pub fn ctype(&self) -> u8 {
        self.ty.ctype()
    }

    /// Exact term for a serialised value.
    pub fn term(&self, serialised: &[u8]) -> Vec<u8> {
        prefixed(serialised, &self.prefix, self.ctype())
    }
}

/// Term prefix for a field name.
pub fn field_prefix(name: &str) -> Vec<u8> {
    let mut prefix = b"X".to_vec();
    prefix.extend_from_slice(&fnv1a64(name.as_bytes()).to_be_bytes()[4..]);
    prefix
}

/// Term prefix for one accuracy level of a field.
pub fn accuracy_prefix(name: &str, level: &str) -> Vec<u8> {
    field_prefix(&format!("{name}\x00{level}"))
}

/// Synthetic prefix for namespace fields.
pub fn namespace_prefix(path: &str) -> Vec<u8> {
    let mut prefix = b"Y".to_vec();
    prefix.extend_from_slice(&fnv1a64(path.as_bytes()).to_be_bytes()[4..]);
    prefix
}

#[derive(Default)]
pub struct Schema {
    fields: HashMap<String, FieldSpec>,
}

impl Schema {
    pub fn new() -> Schema {
        Schema::default()
    }

    pub fn insert(&mut self, spec: FieldSpec) {
        self.fields.insert(spec.name.clone(), spec);
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Resolves a query path into its field spec, splitting off a trailing
    /// accuracy component (`field._100`, `field._month`, `field._geo5`)
    /// when present. Unknown paths resolve to a namespace spec.
    pub fn get_data_field(&self, path: &str) -> (FieldSpec, Option<String>) {
        if let Some(spec) = self.fields.get(path) {
            return (spec.clone(), None);
        }
        if let Some(pos) = path.rfind('.') {
            let (head, tail) = (&path[..pos], &path[pos + 1..]);
            if tail.starts_with('_') {
                if let Some(spec) = self.fields.get(head) {
                    return (spec.clone(), Some(tail.to_string()));
                }
            }
        }
        let mut spec = FieldSpec::new(path, FieldType::Empty, u32::MAX);
        spec.prefix = namespace_prefix(path);
        spec.namespace = true;
        (spec, None)
    }
}

/// Parses the accepted date shapes: epoch numbers, RFC 3339, and the
/// common `YYYY-MM-DD[ HH:MM:SS]` forms.
pub fn parse_datetime(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| Error::Serialisation("bad epoch number".into()))?;
            Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32)
                .single()
                .ok_or_else(|| Error::Serialisation("epoch out of range".into()))
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Ok(dt.with_timezone(&Utc));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Ok(Utc.from_utc_datetime(&dt));
            }
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
                return Ok(Utc.from_utc_datetime(&dt));
            }
            if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0).unwrap()));
            }
            Err(Error::Serialisation(format!("invalid date: {s}")))
        }
        other => Err(Error::Serialisation(format!("invalid date: {other}"))),
    }
}

/// `HH:MM[:SS]` or a bare number of seconds.
pub fn parse_time_seconds(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| Error::Serialisation("bad time number".into())),
        Value::String(s) => {
            let parts: Vec<&str> = s.split(':').collect();
            if parts.len() < 2 || parts.len() > 3 {
                return Err(Error::Serialisation(format!("invalid time: {s}")));
            }
            let mut seconds = 0.0;
            for part in &parts {
                seconds = seconds * 60.0
                    + part
                        .parse::<f64>()
                        .map_err(|_| Error::Serialisation(format!("invalid time: {s}")))?;
            }
            Ok(seconds)
        }
        other => Err(Error::Serialisation(format!("invalid time: {other}"))),
    }
}

/// Serialises a JSON literal under the declared field type; used for both
/// slot values and exact terms.
pub fn serialise_value(ty: FieldType, value: &Value) -> Result<Vec<u8>> {
    match ty {
        FieldType::Integer | FieldType::Positive | FieldType::Float => {
            let number = match value {
                Value::Number(n) => n
                    .as_f64()
                    .ok_or_else(|| Error::Serialisation("bad number".into()))?,
                Value::String(s) => s
                    .parse::<f64>()
                    .map_err(|_| Error::Serialisation(format!("not a number: {s}")))?,
                other => {
                    return Err(Error::Serialisation(format!("not a number: {other}")));
                }
            };
            if ty == FieldType::Positive && number < 0.0 {
                return Err(Error::Serialisation(format!("not positive: {number}")));
            }
            Ok(sortable_serialise(number))
        }
        FieldType::Boolean => match value {
            Value::Bool(true) => Ok(b"t".to_vec()),
            Value::Bool(false) => Ok(b"f".to_vec()),
            Value::String(s) if s == "true" => Ok(b"t".to_vec()),
            Value::String(s) if s == "false" => Ok(b"f".to_vec()),
            other => Err(Error::Serialisation(format!("not a boolean: {other}"))),
        },
        FieldType::Keyword | FieldType::Empty => match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            Value::Number(n) => Ok(n.to_string().into_bytes()),
            Value::Bool(b) => Ok(if *b { b"true".to_vec() } else { b"false".to_vec() }),
            other => Err(Error::Serialisation(format!("not a keyword: {other}"))),
        },
        FieldType::Text => match value {
            Value::String(s) => Ok(s.as_bytes().to_vec()),
            other => Err(Error::Serialisation(format!("not text: {other}"))),
        },
        FieldType::Date => {
            let dt = parse_datetime(value)?;
            Ok(sortable_serialise(timestamp_of(&dt)))
        }
        FieldType::Time | FieldType::Timedelta => {
            Ok(sortable_serialise(parse_time_seconds(value)?))
        }
        FieldType::Uuid => match value {
            Value::String(s) => {
                let uuid = uuid::Uuid::parse_str(s)
                    .map_err(|_| Error::Serialisation(format!("invalid uuid: {s}")))?;
                Ok(uuid.as_bytes().to_vec())
            }
            other => Err(Error::Serialisation(format!("not a uuid: {other}"))),
        },
        FieldType::Geo => Err(Error::Serialisation(
            "geo values serialise through their shape".into(),
        )),
    }
}

pub fn timestamp_of(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9
}

/// Splits text into lowercase word terms.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '*')
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

/// Indexes one field value into a document: slot value, exact terms and
/// accuracy-bucket terms.
pub fn index_field(doc: &mut Document, spec: &FieldSpec, value: &Value) -> Result<()> {
    match spec.ty {
        FieldType::Geo => {
            let shape = crate::geo::shape_from_json(value)?;
            let ranges = shape.trixel_ranges_auto(true);
            let centroids = shape.centroids();
            doc.add_value(spec.slot, crate::geo::serialise_ranges(&ranges, &centroids));
            generate_terms::geo(doc, &spec.accuracy, &spec.acc_prefixes, &ranges);
            Ok(())
        }
        FieldType::Text => {
            let serialised = serialise_value(spec.ty, value)?;
            doc.add_value(spec.slot, serialised.clone());
            for token in tokenize(&String::from_utf8_lossy(&serialised)) {
                doc.add_term(prefixed(token.as_bytes(), &spec.prefix, CTYPE_TEXT));
            }
            Ok(())
        }
        FieldType::Date => {
            let dt = parse_datetime(value)?;
            let serialised = sortable_serialise(timestamp_of(&dt));
            doc.add_value(spec.slot, serialised.clone());
            doc.add_term(spec.term(&serialised));
            generate_terms::date(doc, &spec.date_accuracy, &spec.acc_prefixes, &dt);
            Ok(())
        }
        FieldType::Integer | FieldType::Positive | FieldType::Float => {
            let serialised = serialise_value(spec.ty, value)?;
            doc.add_value(spec.slot, serialised.clone());
            doc.add_term(spec.term(&serialised));
            let number = crate::serialise::sortable_unserialise(&serialised);
            generate_terms::numeric_terms(
                doc,
                &spec.accuracy,
                &spec.acc_prefixes,
                number as i64,
            );
            Ok(())
        }
        FieldType::Time | FieldType::Timedelta => {
            let serialised = serialise_value(spec.ty, value)?;
            doc.add_value(spec.slot, serialised.clone());
            doc.add_term(spec.term(&serialised));
            let seconds = crate::serialise::sortable_unserialise(&serialised);
            generate_terms::numeric_terms(
                doc,
                &spec.accuracy,
                &spec.acc_prefixes,
                seconds as i64,
            );
            Ok(())
        }
        _ => {
            let serialised = serialise_value(spec.ty, value)?;
            doc.add_value(spec.slot, serialised.clone());
            doc.add_term(spec.term(&serialised));
            Ok(())
        }
    }
}

/// Namespace variant: terms under the synthetic prefix, typed by a guess
/// at the literal.
pub fn index_namespace_field(doc: &mut Document, path: &str, value: &Value) -> Result<()> {
    let (ty, serialised) = guess_serialise(value)?;
    doc.add_term(prefixed(&serialised, &namespace_prefix(path), ty.ctype()));
    Ok(())
}

/// Best-effort typing of a literal for namespace fields.
pub fn guess_serialise(value: &Value) -> Result<(FieldType, Vec<u8>)> {
    match value {
        Value::Number(_) => Ok((FieldType::Float, serialise_value(FieldType::Float, value)?)),
        Value::Bool(_) => Ok((
            FieldType::Boolean,
            serialise_value(FieldType::Boolean, value)?,
        )),
        Value::String(_) => Ok((
            FieldType::Keyword,
            serialise_value(FieldType::Keyword, value)?,
        )),
        other => Err(Error::Serialisation(format!(
            "cannot guess type of {other}"
        ))),
    }
}
