//! Schema-gated payload validation
//!
//! Every known action has a request and a response schema, keyed by
//! `(action, role)` and loaded once from `<Action><Role>.json` files. The
//! presence of a schema is what makes an action known: a lookup miss is
//! reported as [`OcppError::UnknownAction`], never as a validation failure.
//!
//! The validator covers the JSON-Schema keywords used by the OCPP 2.0.1
//! schema set and collects every violation instead of stopping at the first.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::OcppError;

/// Nesting limit for `$ref` chains and combinators
const MAX_DEPTH: usize = 64;

/// Which side of an exchange a payload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    Request,
    Response,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Lookup key for one schema document
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaKey {
    pub action: String,
    pub role: Role,
}

impl SchemaKey {
    pub fn new(action: impl Into<String>, role: Role) -> Self {
        Self {
            action: action.into(),
            role,
        }
    }

    /// Split a file stem such as `HeartbeatRequest` into its key
    pub fn from_file_stem(stem: &str) -> Option<Self> {
        for role in [Role::Request, Role::Response] {
            let suffix = role.to_string();
            if let Some(action) = stem.strip_suffix(suffix.as_str()) {
                if !action.is_empty() {
                    return Some(Self::new(action, role));
                }
            }
        }
        None
    }

    pub fn file_name(&self) -> String {
        format!("{}{}.json", self.action, self.role)
    }
}

/// A single schema violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    /// Location in the payload, e.g. `instance.chargingStation.model`
    pub path: String,
    /// Schema keyword that failed
    pub keyword: &'static str,
    pub message: String,
}

impl Violation {
    pub fn new(path: impl Into<String>, keyword: &'static str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            keyword,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path, self.message)
    }
}

/// In-memory schema table, populated once at startup
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<SchemaKey, Value>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<Action><Role>.json` file in a directory
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, OcppError> {
        let dir = dir.as_ref();
        let mut registry = Self::new();

        let entries = fs::read_dir(dir).map_err(|e| OcppError::SchemaLoad {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let key = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(SchemaKey::from_file_stem)
            {
                Some(key) => key,
                None => {
                    debug!("Skipping {}: not an <Action><Role>.json name", path.display());
                    continue;
                }
            };

            let schema_error = |reason: String| OcppError::SchemaLoad {
                path: path.display().to_string(),
                reason,
            };
            let text = fs::read_to_string(&path).map_err(|e| schema_error(e.to_string()))?;
            let schema: Value =
                serde_json::from_str(&text).map_err(|e| schema_error(e.to_string()))?;

            registry.schemas.insert(key, schema);
        }

        info!(
            "Loaded {} schemas ({} actions) from {}",
            registry.len(),
            registry.actions().len(),
            dir.display()
        );
        Ok(registry)
    }

    /// Add or replace one schema
    pub fn insert(&mut self, action: impl Into<String>, role: Role, schema: Value) {
        self.schemas.insert(SchemaKey::new(action, role), schema);
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with_schema(mut self, action: impl Into<String>, role: Role, schema: Value) -> Self {
        self.insert(action, role, schema);
        self
    }

    pub fn get(&self, action: &str, role: Role) -> Option<&Value> {
        self.schemas.get(&SchemaKey::new(action, role))
    }

    pub fn contains(&self, action: &str, role: Role) -> bool {
        self.get(action, role).is_some()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Sorted list of action names with at least one schema
    pub fn actions(&self) -> Vec<String> {
        self.schemas
            .keys()
            .map(|k| k.action.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Validate `payload` against the schema for `(action, role)`
    pub fn validate(&self, action: &str, role: Role, payload: &Value) -> Result<(), OcppError> {
        let schema = self
            .get(action, role)
            .ok_or_else(|| OcppError::UnknownAction(action.to_string()))?;

        let violations = Validator::new(schema).run(payload);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(OcppError::Validation {
                action: action.to_string(),
                role,
                violations,
            })
        }
    }
}

/// Walks one payload against one schema document
struct Validator<'a> {
    root: &'a Value,
    violations: Vec<Violation>,
}

impl<'a> Validator<'a> {
    fn new(root: &'a Value) -> Self {
        Self {
            root,
            violations: Vec::new(),
        }
    }

    fn run(mut self, instance: &Value) -> Vec<Violation> {
        self.check(self.root, instance, "instance", 0);
        self.violations
    }

    fn fail(&mut self, path: &str, keyword: &'static str, message: String) {
        self.violations.push(Violation::new(path, keyword, message));
    }

    /// Run a subschema in isolation and report whether it passed
    fn passes(&self, schema: &Value, instance: &Value, path: &str, depth: usize) -> bool {
        let mut scratch = Validator::new(self.root);
        scratch.check(schema, instance, path, depth);
        scratch.violations.is_empty()
    }

    fn check(&mut self, schema: &Value, instance: &Value, path: &str, depth: usize) {
        if depth > MAX_DEPTH {
            self.fail(path, "$ref", "schema nesting is too deep".to_string());
            return;
        }

        let schema = match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                self.fail(path, "false", "is not allowed".to_string());
                return;
            }
            Value::Object(map) => map,
            _ => return,
        };

        if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
            match self.resolve(reference) {
                Some(target) => self.check(target, instance, path, depth + 1),
                None => self.fail(path, "$ref", format!("cannot resolve {}", reference)),
            }
            // Siblings of $ref are ignored in draft-06
            return;
        }

        if let Some(types) = schema.get("type") {
            self.check_type(types, instance, path);
        }

        if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(instance) {
                let names: Vec<String> = allowed.iter().map(Value::to_string).collect();
                self.fail(path, "enum", format!("is not one of enum values: {}", names.join(",")));
            }
        }

        if let Some(expected) = schema.get("const") {
            if expected != instance {
                self.fail(path, "const", format!("does not exactly match expected constant: {}", expected));
            }
        }

        match instance {
            Value::Object(object) => self.check_object(schema, object, path, depth),
            Value::Array(items) => self.check_array(schema, items, path, depth),
            Value::String(s) => self.check_string(schema, s, path),
            Value::Number(_) => self.check_number(schema, instance, path),
            _ => {}
        }

        self.check_combinators(schema, instance, path, depth);
    }

    fn resolve(&self, reference: &str) -> Option<&'a Value> {
        match reference.strip_prefix('#') {
            Some("") => Some(self.root),
            Some(pointer) => self.root.pointer(pointer),
            None => None,
        }
    }

    fn check_type(&mut self, types: &Value, instance: &Value, path: &str) {
        let names: Vec<&str> = match types {
            Value::String(t) => vec![t.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => return,
        };

        if !names.iter().any(|t| type_matches(t, instance)) {
            self.fail(path, "type", format!("is not of a type(s) {}", names.join(",")));
        }
    }

    fn check_object(&mut self, schema: &Map<String, Value>, object: &Map<String, Value>, path: &str, depth: usize) {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    self.fail(path, "required", format!("requires property \"{}\"", name));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(properties) = properties {
            for (name, subschema) in properties {
                if let Some(value) = object.get(name) {
                    let child = format!("{}.{}", path, name);
                    self.check(subschema, value, &child, depth + 1);
                }
            }
        }

        match schema.get("additionalProperties") {
            Some(Value::Bool(false)) => {
                for name in object.keys() {
                    if !properties.is_some_and(|p| p.contains_key(name)) {
                        self.fail(
                            path,
                            "additionalProperties",
                            format!("is not allowed to have the additional property \"{}\"", name),
                        );
                    }
                }
            }
            Some(extra @ Value::Object(_)) => {
                for (name, value) in object {
                    if !properties.is_some_and(|p| p.contains_key(name)) {
                        let child = format!("{}.{}", path, name);
                        self.check(extra, value, &child, depth + 1);
                    }
                }
            }
            _ => {}
        }
    }

    fn check_array(&mut self, schema: &Map<String, Value>, items: &[Value], path: &str, depth: usize) {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                self.fail(path, "minItems", format!("does not meet minimum length of {}", min));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if items.len() as u64 > max {
                self.fail(path, "maxItems", format!("does not meet maximum length of {}", max));
            }
        }

        match schema.get("items") {
            Some(Value::Array(tuple)) => {
                for (index, (subschema, item)) in tuple.iter().zip(items).enumerate() {
                    self.check(subschema, item, &format!("{}[{}]", path, index), depth + 1);
                }
            }
            Some(subschema) => {
                for (index, item) in items.iter().enumerate() {
                    self.check(subschema, item, &format!("{}[{}]", path, index), depth + 1);
                }
            }
            None => {}
        }
    }

    fn check_string(&mut self, schema: &Map<String, Value>, s: &str, path: &str) {
        let length = s.chars().count() as u64;

        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if length < min {
                self.fail(path, "minLength", format!("does not meet minimum length of {}", min));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if length > max {
                self.fail(path, "maxLength", format!("does not meet maximum length of {}", max));
            }
        }

        if schema.get("format").and_then(Value::as_str) == Some("date-time")
            && chrono::DateTime::parse_from_rfc3339(s).is_err()
        {
            self.fail(path, "format", "does not conform to the \"date-time\" format".to_string());
        }
    }

    fn check_number(&mut self, schema: &Map<String, Value>, instance: &Value, path: &str) {
        let Some(n) = instance.as_f64() else {
            return;
        };

        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                self.fail(path, "minimum", format!("must be greater than or equal to {}", min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                self.fail(path, "maximum", format!("must be less than or equal to {}", max));
            }
        }
        if let Some(min) = schema.get("exclusiveMinimum").and_then(Value::as_f64) {
            if n <= min {
                self.fail(path, "exclusiveMinimum", format!("must be greater than {}", min));
            }
        }
        if let Some(max) = schema.get("exclusiveMaximum").and_then(Value::as_f64) {
            if n >= max {
                self.fail(path, "exclusiveMaximum", format!("must be less than {}", max));
            }
        }
    }

    fn check_combinators(&mut self, schema: &Map<String, Value>, instance: &Value, path: &str, depth: usize) {
        if let Some(all) = schema.get("allOf").and_then(Value::as_array) {
            for subschema in all {
                self.check(subschema, instance, path, depth + 1);
            }
        }

        if let Some(any) = schema.get("anyOf").and_then(Value::as_array) {
            if !any.iter().any(|s| self.passes(s, instance, path, depth + 1)) {
                self.fail(path, "anyOf", "is not any of the allowed subschemas".to_string());
            }
        }

        if let Some(one) = schema.get("oneOf").and_then(Value::as_array) {
            let matched = one
                .iter()
                .filter(|s| self.passes(s, instance, path, depth + 1))
                .count();
            if matched != 1 {
                self.fail(
                    path,
                    "oneOf",
                    format!("must match exactly one subschema, matched {}", matched),
                );
            }
        }
    }
}

fn type_matches(name: &str, instance: &Value) -> bool {
    match name {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}
