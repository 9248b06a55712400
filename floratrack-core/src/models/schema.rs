//! Payload validation for crop, task and order mutations.
//!
//! The same rules run on the client before a write is journaled and on the
//! server before it is applied, so a payload accepted locally is only
//! rejected remotely when the two sides disagree about state.

use chrono::NaiveDate;
use serde_json::Value;
use thiserror::Error;

use super::entity::{EntityType, Fields};
use super::mutation::Operation;

const PRIORITIES: &[&str] = &["low", "medium", "high", "urgent"];

/// Payload fields holding the id of another entity, with that entity's type.
pub const REFERENCE_FIELDS: &[(&str, EntityType)] = &[
    ("crop_id", EntityType::Crop),
    ("order_id", EntityType::Order),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{entity_type} is missing required field '{field}'")]
    MissingField {
        entity_type: EntityType,
        field: &'static str,
    },

    #[error("unknown {entity_type} field '{field}'")]
    UnknownField {
        entity_type: EntityType,
        field: String,
    },

    #[error("invalid value for {entity_type} field '{field}': {reason}")]
    InvalidValue {
        entity_type: EntityType,
        field: String,
        reason: String,
    },

    #[error("{entity_type} update must set at least one field")]
    EmptyUpdate { entity_type: EntityType },

    #[error("{entity_type} delete must not carry a payload")]
    DeleteWithPayload { entity_type: EntityType },
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text { min_len: usize, max_len: usize },
    Date,
    Number { min: f64, max: f64 },
    Integer { min: i64 },
    Bool,
    Choice(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy)]
struct FieldRule {
    name: &'static str,
    kind: FieldKind,
    required: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        name,
        kind,
        required: false,
    }
}

const fn text(min_len: usize, max_len: usize) -> FieldKind {
    FieldKind::Text { min_len, max_len }
}

const CROP_RULES: &[FieldRule] = &[
    required("name", text(1, 100)),
    required("variety", text(1, 100)),
    required("propagation_method", text(1, 50)),
    required("current_stage", text(1, 50)),
    required("planted_date", FieldKind::Date),
    optional("location", text(0, 100)),
    optional("expected_germination", FieldKind::Date),
    optional(
        "temperature",
        FieldKind::Number {
            min: -50.0,
            max: 100.0,
        },
    ),
    optional(
        "humidity",
        FieldKind::Number {
            min: 0.0,
            max: 100.0,
        },
    ),
    optional("watered", FieldKind::Date),
    optional("notes", text(0, 2000)),
];

const TASK_RULES: &[FieldRule] = &[
    required("task", text(1, 200)),
    required("due_date", FieldKind::Date),
    optional("completed", FieldKind::Bool),
    optional("priority", FieldKind::Choice(PRIORITIES)),
    optional("notes", text(0, 2000)),
    optional("crop_id", text(1, 100)),
    optional("order_id", text(1, 100)),
];

const ORDER_RULES: &[FieldRule] = &[
    required("client_name", text(1, 100)),
    required("crop_type", text(1, 100)),
    required("variety", text(1, 100)),
    required("propagation_method", text(1, 50)),
    required("total_quantity", FieldKind::Integer { min: 1 }),
    optional("contact_person", text(0, 100)),
    optional("phone", text(0, 20)),
    optional("email", text(0, 200)),
    optional("requested_delivery", FieldKind::Date),
    optional(
        "unit_price",
        FieldKind::Number {
            min: 0.0,
            max: f64::MAX,
        },
    ),
    optional("priority", FieldKind::Choice(PRIORITIES)),
    optional("status", text(1, 50)),
    optional("current_section", text(0, 50)),
    optional("current_stage_quantity", FieldKind::Integer { min: 0 }),
    optional("completed_quantity", FieldKind::Integer { min: 0 }),
    optional("notes", text(0, 2000)),
];

fn rules(entity_type: EntityType) -> &'static [FieldRule] {
    match entity_type {
        EntityType::Crop => CROP_RULES,
        EntityType::Task => TASK_RULES,
        EntityType::Order => ORDER_RULES,
    }
}

/// Names of the fields an entity type accepts.
pub fn known_fields(entity_type: EntityType) -> Vec<&'static str> {
    rules(entity_type).iter().map(|rule| rule.name).collect()
}

/// Checks the shape of a mutation payload.
pub fn validate_payload(
    entity_type: EntityType,
    operation: Operation,
    payload: &Fields,
) -> Result<(), ValidationError> {
    let rules = rules(entity_type);

    match operation {
        Operation::Delete => {
            if !payload.is_empty() {
                return Err(ValidationError::DeleteWithPayload { entity_type });
            }
            return Ok(());
        }
        Operation::Update if payload.is_empty() => {
            return Err(ValidationError::EmptyUpdate { entity_type });
        }
        _ => {}
    }

    for (name, value) in payload {
        let rule = rules.iter().find(|rule| rule.name == name).ok_or_else(|| {
            ValidationError::UnknownField {
                entity_type,
                field: name.clone(),
            }
        })?;

        if value.is_null() {
            if rule.required {
                return Err(ValidationError::MissingField {
                    entity_type,
                    field: rule.name,
                });
            }
            continue;
        }

        check_value(rule.kind, value).map_err(|reason| ValidationError::InvalidValue {
            entity_type,
            field: name.clone(),
            reason,
        })?;
    }

    if operation == Operation::Create {
        if let Some(rule) = rules
            .iter()
            .find(|rule| rule.required && !payload.contains_key(rule.name))
        {
            return Err(ValidationError::MissingField {
                entity_type,
                field: rule.name,
            });
        }
    }

    Ok(())
}

fn check_value(kind: FieldKind, value: &Value) -> Result<(), String> {
    match kind {
        FieldKind::Text { min_len, max_len } => {
            let s = value.as_str().ok_or("expected a string")?;
            let len = s.trim().chars().count();
            if len < min_len {
                return Err("must not be empty".to_string());
            }
            if len > max_len {
                return Err(format!("must be at most {} characters", max_len));
            }
            Ok(())
        }
        FieldKind::Date => {
            let s = value.as_str().ok_or("expected a date string")?;
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|_| ())
                .map_err(|_| format!("'{}' is not a YYYY-MM-DD date", s))
        }
        FieldKind::Number { min, max } => {
            let n = value.as_f64().ok_or("expected a number")?;
            if n < min || n > max {
                return Err(format!("{} is out of range", n));
            }
            Ok(())
        }
        FieldKind::Integer { min } => {
            let n = value.as_i64().ok_or("expected an integer")?;
            if n < min {
                return Err(format!("must be at least {}", min));
            }
            Ok(())
        }
        FieldKind::Bool => value
            .as_bool()
            .map(|_| ())
            .ok_or_else(|| "expected true or false".to_string()),
        FieldKind::Choice(options) => {
            let s = value.as_str().ok_or("expected a string")?;
            if options.contains(&s) {
                Ok(())
            } else {
                Err(format!("expected one of {}", options.join(", ")))
            }
        }
    }
}
