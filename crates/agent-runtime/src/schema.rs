//! Tool descriptors derived from a tool's typed argument struct.
//!
//! Rust has no runtime signature reflection, so a tool's "signature" is the
//! argument type it deserializes. The type's JSON schema is generated once,
//! inlined, and flattened into an ordered parameter list. The invocation path
//! only ever validates against that precomputed [`ToolDescriptor`].

use std::fmt;

use schemars::gen::SchemaSettings;
use schemars::schema::{InstanceType, Schema, SchemaObject, SingleOrVec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};

use crate::error::{SchemaError, ToolError};

const MAX_TOOL_NAME_LEN: usize = 64;

/// Parameter kinds exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
    List,
    Object,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::List => "list",
            Self::Object => "object",
        }
    }

    /// JSON-Schema `type` keyword used when rendering for providers.
    pub fn json_type(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "number",
            Self::Boolean => "boolean",
            Self::List => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub kind: ParamKind,
    /// Element kind for [`ParamKind::List`] parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ParamKind>,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Immutable description of a tool as presented to the completion service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDescriptor {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|param| param.name == name)
    }

    pub fn required_parameters(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.iter().filter(|param| param.required)
    }

    /// JSON-Schema object for the `parameters`/`input_schema` slot of a tool
    /// definition.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for param in &self.parameters {
            let mut schema = Map::new();
            schema.insert("type".into(), json!(param.kind.json_type()));
            if let Some(items) = param.items {
                schema.insert("items".into(), json!({ "type": items.json_type() }));
            }
            if let Some(description) = &param.description {
                schema.insert("description".into(), json!(description));
            }
            if let Some(default) = &param.default {
                schema.insert("default".into(), default.clone());
            }
            properties.insert(param.name.clone(), Value::Object(schema));
        }
        let required: Vec<&str> = self
            .required_parameters()
            .map(|param| param.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false
        })
    }

    /// Validate model-supplied arguments against the descriptor.
    ///
    /// Missing optional parameters receive their default, scalars are coerced
    /// when the conversion is unambiguous, unknown keys are rejected.
    pub fn validate_arguments(&self, args: Value) -> Result<Value, ToolError> {
        let mut supplied = match args {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            Value::String(raw) if raw.trim().is_empty() => Map::new(),
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(other) => {
                    return Err(ToolError::invalid(
                        &self.name,
                        format!("arguments must be a JSON object, got {}", json_kind(&other)),
                    ))
                }
                Err(err) => {
                    return Err(ToolError::invalid(
                        &self.name,
                        format!("arguments are not valid JSON: {err}"),
                    ))
                }
            },
            other => {
                return Err(ToolError::invalid(
                    &self.name,
                    format!("arguments must be a JSON object, got {}", json_kind(&other)),
                ))
            }
        };

        if let Some(unknown) = supplied.keys().find(|key| self.parameter(key).is_none()) {
            return Err(ToolError::invalid(
                &self.name,
                format!("unexpected argument `{unknown}`"),
            ));
        }

        let mut validated = Map::new();
        for param in &self.parameters {
            match supplied.remove(&param.name) {
                Some(Value::Null) | None if param.required => {
                    return Err(ToolError::invalid(
                        &self.name,
                        format!("missing required argument `{}`", param.name),
                    ));
                }
                Some(Value::Null) | None => {
                    if let Some(default) = &param.default {
                        validated.insert(param.name.clone(), default.clone());
                    }
                }
                Some(value) => {
                    let value = coerce(param.kind, param.items, value).map_err(|reason| {
                        ToolError::invalid(&self.name, format!("argument `{}`: {reason}", param.name))
                    })?;
                    validated.insert(param.name.clone(), value);
                }
            }
        }
        Ok(Value::Object(validated))
    }
}

/// Derives [`ToolDescriptor`]s from argument types.
pub struct SchemaGenerator;

impl SchemaGenerator {
    /// Build the descriptor for a tool whose arguments deserialize into `A`.
    pub fn describe<A: JsonSchema>(
        name: &str,
        description: &str,
    ) -> Result<ToolDescriptor, SchemaError> {
        validate_tool_name(name)?;

        let generator = SchemaSettings::draft07()
            .with(|settings| settings.inline_subschemas = true)
            .into_generator();
        let root = generator.into_root_schema_for::<A>();
        let schema = root.schema;

        if schema.subschemas.is_some() || !has_single_type(&schema, InstanceType::Object) {
            return Err(SchemaError::new(
                name,
                "arguments must be a struct with named fields",
            ));
        }

        let Some(object) = schema.object.as_deref() else {
            return Ok(ToolDescriptor {
                name: name.to_string(),
                description: description.to_string(),
                parameters: Vec::new(),
            });
        };

        let mut parameters = Vec::with_capacity(object.properties.len());
        for (field, field_schema) in &object.properties {
            let resolved = resolve(field_schema)
                .map_err(|reason| SchemaError::new(name, format!("parameter `{field}`: {reason}")))?;
            let metadata = match field_schema {
                Schema::Object(obj) => obj.metadata.as_deref(),
                Schema::Bool(_) => None,
            };
            let default = metadata.and_then(|meta| meta.default.clone());
            parameters.push(ParameterSpec {
                name: field.clone(),
                kind: resolved.kind,
                items: resolved.items,
                required: object.required.contains(field)
                    && !resolved.nullable
                    && default.is_none(),
                default,
                description: metadata.and_then(|meta| meta.description.clone()),
            });
        }

        Ok(ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        })
    }
}

fn validate_tool_name(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() || name.len() > MAX_TOOL_NAME_LEN {
        return Err(SchemaError::new(
            name,
            format!("tool names must be 1-{MAX_TOOL_NAME_LEN} characters"),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(SchemaError::new(
            name,
            format!("tool names may not contain `{bad}`"),
        ));
    }
    Ok(())
}

struct Resolved {
    kind: ParamKind,
    items: Option<ParamKind>,
    nullable: bool,
}

fn resolve(schema: &Schema) -> Result<Resolved, String> {
    let obj = match schema {
        Schema::Bool(_) => return Err("no resolvable type".into()),
        Schema::Object(obj) => obj,
    };

    if let Some(subschemas) = obj.subschemas.as_deref() {
        // `Option<T>` around a schema without its own `type` shows up as
        // `anyOf: [T, null]`.
        if let Some(any_of) = &subschemas.any_of {
            let non_null: Vec<&Schema> = any_of.iter().filter(|s| !is_null_schema(s)).collect();
            if non_null.len() == 1 && any_of.len() == 2 {
                let mut inner = resolve(non_null[0])?;
                inner.nullable = true;
                return Ok(inner);
            }
        }
        if subschemas.all_of.as_ref().is_some_and(|all| all.len() == 1) {
            if let Some(all_of) = &subschemas.all_of {
                return resolve(&all_of[0]);
            }
        }
        return Err("unsupported composite type".into());
    }

    if obj.reference.is_some() {
        // Only recursive types keep a `$ref` once subschemas are inlined.
        return Ok(Resolved {
            kind: ParamKind::Object,
            items: None,
            nullable: false,
        });
    }

    let (instance, nullable) = match &obj.instance_type {
        None => match &obj.enum_values {
            Some(values) if !values.is_empty() && values.iter().all(Value::is_string) => {
                (InstanceType::String, false)
            }
            _ => return Err("no resolvable type".into()),
        },
        Some(SingleOrVec::Single(instance)) => (**instance, false),
        Some(SingleOrVec::Vec(types)) => {
            let concrete: Vec<InstanceType> = types
                .iter()
                .copied()
                .filter(|t| *t != InstanceType::Null)
                .collect();
            match concrete.as_slice() {
                [single] => (*single, concrete.len() != types.len()),
                _ => return Err("mixed-type values are not supported".into()),
            }
        }
    };

    let kind = match instance {
        InstanceType::String => ParamKind::String,
        InstanceType::Integer => ParamKind::Integer,
        InstanceType::Number => ParamKind::Float,
        InstanceType::Boolean => ParamKind::Boolean,
        InstanceType::Object => ParamKind::Object,
        InstanceType::Array => ParamKind::List,
        InstanceType::Null => return Err("unit values carry no data".into()),
    };

    let items = if kind == ParamKind::List {
        Some(resolve_items(obj)?)
    } else {
        None
    };

    Ok(Resolved {
        kind,
        items,
        nullable,
    })
}

fn resolve_items(obj: &SchemaObject) -> Result<ParamKind, String> {
    let array = obj
        .array
        .as_deref()
        .ok_or_else(|| "list element type is unknown".to_string())?;
    match &array.items {
        Some(SingleOrVec::Single(item)) => {
            let item = resolve(item).map_err(|reason| format!("list element: {reason}"))?;
            Ok(item.kind)
        }
        Some(SingleOrVec::Vec(_)) => Err("tuples are not supported, use a struct".into()),
        None => Err("list element type is unknown".into()),
    }
}

fn has_single_type(obj: &SchemaObject, expected: InstanceType) -> bool {
    matches!(&obj.instance_type, Some(SingleOrVec::Single(t)) if **t == expected)
}

fn is_null_schema(schema: &Schema) -> bool {
    match schema {
        Schema::Object(obj) => has_single_type(obj, InstanceType::Null),
        Schema::Bool(_) => false,
    }
}

fn coerce(kind: ParamKind, items: Option<ParamKind>, value: Value) -> Result<Value, String> {
    match (kind, value) {
        (ParamKind::String, Value::String(s)) => Ok(Value::String(s)),
        (ParamKind::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ParamKind::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

        (ParamKind::Integer, Value::Number(n)) => {
            if n.is_i64() || n.is_u64() {
                return Ok(Value::Number(n));
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                    Ok(Value::from(f as i64))
                }
                _ => Err(format!("expected integer, got {n}")),
            }
        }
        (ParamKind::Integer, Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("expected integer, got string {s:?}")),

        (ParamKind::Float, Value::Number(n)) => Ok(Value::Number(n)),
        (ParamKind::Float, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("expected float, got string {s:?}")),

        (ParamKind::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (ParamKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("expected boolean, got string {s:?}")),
        },

        (ParamKind::List, Value::Array(values)) => match items {
            Some(item_kind) => values
                .into_iter()
                .enumerate()
                .map(|(idx, v)| {
                    coerce(item_kind, None, v).map_err(|reason| format!("element {idx}: {reason}"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            None => Ok(Value::Array(values)),
        },

        (ParamKind::Object, Value::Object(map)) => Ok(Value::Object(map)),

        (kind, other) => Err(format!("expected {kind}, got {}", json_kind(&other))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
