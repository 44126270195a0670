//! Metric kinds and payload normalization
//!
//! A metric is a kind ("acquisition", "revenue", ...) plus one or more
//! records. Records are opaque key/value maps forwarded to the collector
//! verbatim; nothing here validates field names or value types.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{Error, Result};

/// Words used for control envelopes on the delivery queue.
const RESERVED_KINDS: [&str; 2] = ["flush", "exit"];

/// Kind of business event being reported
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Acquisition,
    Activation,
    Retention,
    Revenue,
    Referral,
    /// Any kind the collector knows about that has no named variant yet
    Custom(String),
}

impl MetricKind {
    /// The five documented business metrics
    pub const BUSINESS: [MetricKind; 5] = [
        MetricKind::Acquisition,
        MetricKind::Activation,
        MetricKind::Retention,
        MetricKind::Revenue,
        MetricKind::Referral,
    ];

    /// Wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            MetricKind::Acquisition => "acquisition",
            MetricKind::Activation => "activation",
            MetricKind::Retention => "retention",
            MetricKind::Revenue => "revenue",
            MetricKind::Referral => "referral",
            MetricKind::Custom(name) => name,
        }
    }

    /// Collector path this kind is posted to, e.g. `/api/v1/acquisitions`
    pub fn path(&self) -> String {
        format!("/api/v1/{}s", self.as_str())
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::InvalidPayload("metric kind is empty".to_string()));
        }
        if RESERVED_KINDS.contains(&name.as_str()) {
            return Err(Error::InvalidPayload(format!(
                "'{}' is reserved for queue control",
                name
            )));
        }

        Ok(match name.as_str() {
            "acquisition" => MetricKind::Acquisition,
            "activation" => MetricKind::Activation,
            "retention" => MetricKind::Retention,
            "revenue" => MetricKind::Revenue,
            "referral" => MetricKind::Referral,
            _ => MetricKind::Custom(name),
        })
    }
}

/// One customer record: field name to scalar value
pub type Record = serde_json::Map<String, Value>;

/// Non-empty ordered sequence of records submitted under one metric
#[derive(Debug, Clone, PartialEq)]
pub struct Payload(Vec<Record>);

impl Payload {
    /// Build a payload, rejecting an empty sequence
    pub fn new(records: Vec<Record>) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::InvalidPayload("payload has no records".to_string()));
        }
        Ok(Self(records))
    }

    pub fn records(&self) -> &[Record] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Normalizes what callers pass to the agent into a [`Payload`]
///
/// Implemented for a single [`Record`], a `Vec<Record>`, a JSON object or
/// array of objects, and `Payload` itself.
pub trait IntoPayload {
    fn into_payload(self) -> Result<Payload>;
}

impl IntoPayload for Payload {
    fn into_payload(self) -> Result<Payload> {
        Ok(self)
    }
}

impl IntoPayload for Record {
    fn into_payload(self) -> Result<Payload> {
        Ok(Payload(vec![self]))
    }
}

impl IntoPayload for Vec<Record> {
    fn into_payload(self) -> Result<Payload> {
        Payload::new(self)
    }
}

impl IntoPayload for Value {
    fn into_payload(self) -> Result<Payload> {
        match self {
            Value::Object(record) => record.into_payload(),
            Value::Array(items) => {
                let records = items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        Value::Object(record) => Ok(record),
                        other => Err(Error::InvalidPayload(format!(
                            "element {} is {}, expected an object",
                            i,
                            json_type(&other)
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Payload::new(records)
            }
            other => Err(Error::InvalidPayload(format!(
                "expected an object or array of objects, got {}",
                json_type(&other)
            ))),
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
