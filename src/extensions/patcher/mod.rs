//! Generic JSON-Patch-style mutation of protobuf messages.
//!
//! A [`Patch`] is an `add`/`remove` op plus a `/`-delimited field path and an
//! optional value. [`patch_struct`] resolves the path against the message's
//! schema ([`schema`]), coercing the value to the terminal field's exact
//! type. `add` auto-initializes unset intermediate messages; `remove` never
//! does, so removing through an absent path is a no-op. Setting a message
//! field from a map replaces the whole message (PUT semantics), then applies
//! the map's keys.

pub mod schema;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{Error, Result};
use schema::{FieldAccessor, FieldSpec, MessageSchema, Patchable, ScalarKind, ScalarValue};

/// Supported patch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Remove,
}

/// One mutation to apply to a message.
#[derive(Debug, Clone)]
pub struct Patch {
    pub op: PatchOp,
    pub path: String,
    pub value: Option<PatchValue>,
}

/// A patch value decoded from JSON. Numbers keep the widest representation
/// they parse as (signed first, then unsigned, then float) and are cast to
/// the target field's width on application.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Str(String),
    List(Vec<PatchValue>),
    Map(BTreeMap<String, PatchValue>),
}

impl PatchValue {
    /// Decode a JSON value. `null` decodes to `None`; nulls nested inside
    /// lists or maps are an error.
    pub fn from_json(value: &serde_json::Value) -> Result<Option<Self>> {
        match value {
            serde_json::Value::Null => Ok(None),
            other => Self::from_json_inner(other).map(Some),
        }
    }

    fn from_json_inner(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => {
                Err(Error::patch("null is not a valid patch value inside a list or map"))
            }
            serde_json::Value::Bool(b) => Ok(PatchValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(PatchValue::Int(i))
                } else if let Some(u) = n.as_u64() {
                    Ok(PatchValue::Uint(u))
                } else if let Some(f) = n.as_f64() {
                    Ok(PatchValue::Float(f))
                } else {
                    Err(Error::patch(format!("unrepresentable number {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(PatchValue::Str(s.clone())),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(Self::from_json_inner(item)?);
                }
                Ok(PatchValue::List(out))
            }
            serde_json::Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), Self::from_json_inner(v)?);
                }
                Ok(PatchValue::Map(out))
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PatchValue::Bool(_) => "bool",
            PatchValue::Int(_) => "int",
            PatchValue::Uint(_) => "uint",
            PatchValue::Float(_) => "float",
            PatchValue::Str(_) => "string",
            PatchValue::List(_) => "list",
            PatchValue::Map(_) => "map",
        }
    }
}

/// Apply one patch to a message. `debug` expands error field listings past
/// the first ten entries.
pub fn patch_struct<M: Patchable>(message: &mut M, patch: &Patch, debug: bool) -> Result<()> {
    let schema = M::schema();
    let segments = parse_path(&patch.path, schema, debug)?;

    let mut current: &mut dyn std::any::Any = message;
    let mut current_schema = schema;
    for segment in &segments[..segments.len() - 1] {
        let spec = resolve_field(current_schema, segment, debug)?;
        match &spec.accessor {
            FieldAccessor::Message { schema, get_mut, .. } => {
                let child = match get_mut(current, patch.op == PatchOp::Add) {
                    Some(child) => child,
                    // Removing through an absent message is a no-op.
                    None => return Ok(()),
                };
                current = child;
                current_schema = schema();
            }
            other => return Err(intermediate_error(segment, other)),
        }
    }

    let terminal = segments[segments.len() - 1];
    let spec = resolve_field(current_schema, terminal, debug)?;
    match patch.op {
        PatchOp::Remove => clear_field(current, spec),
        PatchOp::Add => {
            let value = patch.value.as_ref().ok_or_else(|| {
                Error::patch(
                    "non-nil Value is required; use an empty map to reset all fields on a \
                     message or the 'remove' op to unset fields",
                )
            })?;
            apply_value(current, spec, value, debug)
        }
    }
}

fn parse_path<'a>(
    path: &'a str,
    schema: &MessageSchema,
    debug: bool,
) -> Result<Vec<&'a str>> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(Error::PathResolution(format!(
            "non-empty, non-root Path is required;\n{}",
            field_list_str(schema, debug)
        )));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::PathResolution("empty field name in path".to_string()));
    }
    Ok(segments)
}

fn resolve_field<'a>(
    schema: &'a MessageSchema,
    name: &str,
    debug: bool,
) -> Result<&'a FieldSpec> {
    schema.field(name).ok_or_else(|| {
        Error::PathResolution(format!(
            "no match for field '{name}'!\n{}",
            field_list_str(schema, debug)
        ))
    })
}

fn field_list_str(schema: &MessageSchema, debug: bool) -> String {
    let mut out = format!("available {} fields:\n", schema.type_name);
    let total = schema.fields.len();
    let shown = if debug { total } else { total.min(10) };
    for field in &schema.fields[..shown] {
        out.push_str(field.name);
        out.push('\n');
    }
    if shown < total {
        out.push_str(
            "First 10 fields for this message included, configure with `Debug = true` to print all.",
        );
    }
    out
}

fn intermediate_error(name: &str, accessor: &FieldAccessor) -> Error {
    match accessor {
        FieldAccessor::ScalarList { .. } => {
            Error::PathResolution(format!(
                "path contains member of repeated field '{name}'; repeated field member \
                 access is not supported"
            ))
        }
        FieldAccessor::Unsupported { type_name, .. } => {
            if type_name.starts_with("repeated ") {
                Error::PathResolution(format!(
                    "path contains member of repeated field '{name}'; repeated field member \
                     access is not supported"
                ))
            } else if type_name.starts_with("map<") {
                Error::PathResolution(format!(
                    "path contains member of map field '{name}'; map field member access is \
                     not supported"
                ))
            } else if type_name.contains("google.protobuf.Any") {
                Error::PathResolution(
                    "variant-type message fields (google.protobuf.Any) are not supported"
                        .to_string(),
                )
            } else {
                non_message_error(name, type_name)
            }
        }
        FieldAccessor::Scalar { kind, .. } => non_message_error(name, kind.name()),
        FieldAccessor::Enum { enum_name, .. } => non_message_error(name, enum_name),
        FieldAccessor::Wrapper { kind, .. } => non_message_error(name, kind.wrapper_name()),
        FieldAccessor::Message { .. } => Error::internal("message accessor treated as terminal"),
    }
}

fn non_message_error(name: &str, type_name: &str) -> Error {
    Error::PathResolution(format!(
        "path contains member of non-message field '{name}' (type '{type_name}'); this type \
         does not support child fields"
    ))
}

fn clear_field(target: &mut dyn std::any::Any, spec: &FieldSpec) -> Result<()> {
    let cleared = match &spec.accessor {
        FieldAccessor::Scalar { clear, .. }
        | FieldAccessor::ScalarList { clear, .. }
        | FieldAccessor::Enum { clear, .. }
        | FieldAccessor::Wrapper { clear, .. }
        | FieldAccessor::Message { clear, .. }
        | FieldAccessor::Unsupported { clear, .. } => clear(target),
    };
    if !cleared {
        return Err(Error::internal(format!("schema accessor mismatch for '{}'", spec.name)));
    }
    Ok(())
}

fn apply_value(
    target: &mut dyn std::any::Any,
    spec: &FieldSpec,
    value: &PatchValue,
    debug: bool,
) -> Result<()> {
    match &spec.accessor {
        FieldAccessor::Scalar { kind, set, .. } => {
            if matches!(value, PatchValue::Map(_)) {
                return Err(map_on_non_message(kind.name()));
            }
            let coerced = coerce_scalar(value, *kind)
                .ok_or_else(|| type_mismatch(value, kind.name()))?;
            applied(set(target, coerced), spec)
        }
        FieldAccessor::Wrapper { kind, set, .. } => {
            let coerced = coerce_scalar(value, *kind)
                .ok_or_else(|| type_mismatch(value, kind.wrapper_name()))?;
            applied(set(target, coerced), spec)
        }
        FieldAccessor::ScalarList { kind, set, .. } => {
            if matches!(value, PatchValue::Map(_)) {
                return Err(map_on_non_message(&format!("repeated {}", kind.name())));
            }
            let PatchValue::List(items) = value else {
                return Err(type_mismatch(value, &format!("repeated {}", kind.name())));
            };
            let mut coerced = Vec::with_capacity(items.len());
            for item in items {
                coerced.push(
                    coerce_scalar(item, *kind)
                        .ok_or_else(|| type_mismatch(item, kind.name()))?,
                );
            }
            applied(set(target, coerced), spec)
        }
        FieldAccessor::Enum { enum_name, from_name, valid, set, .. } => {
            if matches!(value, PatchValue::Map(_)) {
                return Err(map_on_non_message(enum_name));
            }
            let ordinal = match value {
                PatchValue::Str(name) => from_name(name)
                    .ok_or_else(|| type_mismatch(value, enum_name))?,
                PatchValue::Int(i) => *i as i32,
                PatchValue::Uint(u) => *u as i32,
                _ => return Err(type_mismatch(value, enum_name)),
            };
            if !valid(ordinal) {
                return Err(type_mismatch(value, enum_name));
            }
            applied(set(target, ordinal), spec)
        }
        FieldAccessor::Message { schema, get_mut, reset, .. } => {
            let PatchValue::Map(entries) = value else {
                return Err(type_mismatch(value, schema().type_name));
            };
            // PUT semantics: start from a fresh message, then set each key.
            applied(reset(target), spec)?;
            let child = get_mut(target, true).ok_or_else(|| {
                Error::internal(format!("schema accessor mismatch for '{}'", spec.name))
            })?;
            let child_schema = schema();
            for (key, entry) in entries {
                let child_spec = resolve_field(child_schema, key, debug)?;
                apply_value(child, child_spec, entry, debug)?;
            }
            Ok(())
        }
        FieldAccessor::Unsupported { type_name, .. } => {
            Err(Error::UnsupportedField(type_name.to_string()))
        }
    }
}

fn applied(ok: bool, spec: &FieldSpec) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::internal(format!("schema accessor mismatch for '{}'", spec.name)))
    }
}

fn map_on_non_message(field_type: &str) -> Error {
    Error::patch(format!("non-message field type '{field_type}' cannot be set via a map"))
}

fn type_mismatch(value: &PatchValue, field_type: &str) -> Error {
    Error::TypeMismatch {
        value_type: value.type_name().to_string(),
        field_type: field_type.to_string(),
    }
}

/// Blind-cast numeric coercion: any JSON number applies to any numeric
/// field, truncated or widened to the target width.
fn coerce_scalar(value: &PatchValue, kind: ScalarKind) -> Option<ScalarValue> {
    match (kind, value) {
        (ScalarKind::Bool, PatchValue::Bool(b)) => Some(ScalarValue::Bool(*b)),
        (ScalarKind::String, PatchValue::Str(s)) => Some(ScalarValue::Str(s.clone())),
        (ScalarKind::Int32, PatchValue::Int(i)) => Some(ScalarValue::I32(*i as i32)),
        (ScalarKind::Int32, PatchValue::Uint(u)) => Some(ScalarValue::I32(*u as i32)),
        (ScalarKind::Int32, PatchValue::Float(f)) => Some(ScalarValue::I32(*f as i32)),
        (ScalarKind::Int64, PatchValue::Int(i)) => Some(ScalarValue::I64(*i)),
        (ScalarKind::Int64, PatchValue::Uint(u)) => Some(ScalarValue::I64(*u as i64)),
        (ScalarKind::Int64, PatchValue::Float(f)) => Some(ScalarValue::I64(*f as i64)),
        (ScalarKind::Uint32, PatchValue::Int(i)) => Some(ScalarValue::U32(*i as u32)),
        (ScalarKind::Uint32, PatchValue::Uint(u)) => Some(ScalarValue::U32(*u as u32)),
        (ScalarKind::Uint32, PatchValue::Float(f)) => Some(ScalarValue::U32(*f as u32)),
        (ScalarKind::Uint64, PatchValue::Int(i)) => Some(ScalarValue::U64(*i as u64)),
        (ScalarKind::Uint64, PatchValue::Uint(u)) => Some(ScalarValue::U64(*u)),
        (ScalarKind::Uint64, PatchValue::Float(f)) => Some(ScalarValue::U64(*f as u64)),
        (ScalarKind::Double, PatchValue::Int(i)) => Some(ScalarValue::F64(*i as f64)),
        (ScalarKind::Double, PatchValue::Uint(u)) => Some(ScalarValue::F64(*u as f64)),
        (ScalarKind::Double, PatchValue::Float(f)) => Some(ScalarValue::F64(*f)),
        _ => None,
    }
}
