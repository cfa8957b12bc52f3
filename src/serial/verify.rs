use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::params::{Field, PacingMode, ParameterRecord};

/// Absolute tolerance for amplitude comparison, in volts
pub const FLOAT_TOLERANCE: f64 = 0.01;

/// A compared value, serialized as a bare number
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub sent: FieldValue,
    pub received: FieldValue,
}

/// Outcome of a program → interrogate → compare cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoVerification {
    pub passed: bool,
    pub message: String,
    pub differences: BTreeMap<String, FieldDiff>,
}

impl EchoVerification {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            differences: BTreeMap::new(),
        }
    }
}

fn field_value(record: &ParameterRecord, field: Field) -> FieldValue {
    if field.is_float() {
        FieldValue::Float(record.get(field))
    } else {
        FieldValue::Int(record.get(field) as i64)
    }
}

fn matches(field: Field, sent: f64, received: f64) -> bool {
    if field.is_float() {
        (sent - received).abs() <= FLOAT_TOLERANCE
    } else {
        sent == received
    }
}

/// Compare the mode code and every field active for `mode`.
pub fn compare_records(mode: PacingMode, sent: &ParameterRecord, received: &ParameterRecord) -> EchoVerification {
    let mut differences = BTreeMap::new();

    if sent.mode != received.mode {
        differences.insert(
            "mode".to_string(),
            FieldDiff {
                sent: FieldValue::Int(sent.mode as i64),
                received: FieldValue::Int(received.mode as i64),
            },
        );
    }

    for field in mode.active_fields() {
        if !matches(field, sent.get(field), received.get(field)) {
            differences.insert(
                field.name().to_string(),
                FieldDiff {
                    sent: field_value(sent, field),
                    received: field_value(received, field),
                },
            );
        }
    }

    if differences.is_empty() {
        EchoVerification {
            passed: true,
            message: "All parameters match".to_string(),
            differences,
        }
    } else {
        log::warn!("Echo test found {} mismatches: {:?}", differences.len(), differences.keys());
        EchoVerification {
            passed: false,
            message: format!("Found {} mismatches", differences.len()),
            differences,
        }
    }
}
