use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ParseError, SchemaViolation};
use crate::version::Version;

/// Maximum payload size accepted by [`parse`], in bytes.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// Maximum nesting depth accepted by [`parse`].
pub const MAX_NESTING_DEPTH: usize = 32;
/// Maximum number of free-form tags a capability may carry.
pub const MAX_TAGS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCodeDef {
	pub code: String,
	pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoContract {
	pub input_schema: Value,
	pub output_schema: Value,
	pub error_codes: Vec<ErrorCodeDef>,
}

/// A typed capability contract a worker advertises and the controller routes on.
///
/// `(id, version)` is unique within a registry; this type itself does not
/// enforce uniqueness, as that is a property of the registry the definition
/// is inserted into, not of the definition in isolation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
	pub id: String,
	pub version: Version,
	pub io_contract: IoContract,
	#[serde(default)]
	pub constraints: BTreeMap<String, String>,
	#[serde(default)]
	pub tags: Vec<String>,
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["id", "version", "io_contract", "constraints", "tags"];

/// Validates a capability definition against the schema's structural rules.
/// Returns every violation found rather than failing on the first.
pub fn validate(def: &CapabilityDefinition) -> Result<(), Vec<SchemaViolation>> {
	let mut violations = Vec::new();

	if def.id.trim().is_empty() {
		violations.push(SchemaViolation::MissingField("id"));
	}

	let mut seen_codes = std::collections::HashSet::new();
	for ec in &def.io_contract.error_codes {
		if !seen_codes.insert(ec.code.clone()) {
			violations.push(SchemaViolation::DuplicateErrorCode(ec.code.clone()));
		}
	}

	if def.tags.len() > MAX_TAGS {
		violations.push(SchemaViolation::TooManyTags {
			limit: MAX_TAGS,
			actual: def.tags.len(),
		});
	}

	for (field, schema) in [
		("io_contract.input_schema", &def.io_contract.input_schema),
		("io_contract.output_schema", &def.io_contract.output_schema),
	] {
		if let Err(reason) = check_json_schema_shape(schema) {
			violations.push(SchemaViolation::InvalidJsonSchema {
				field: leak_field_name(field),
				reason,
			});
		}
	}

	if violations.is_empty() {
		Ok(())
	} else {
		Err(violations)
	}
}

// Field names above are 'static string literals already; this indirection only
// exists so the match arms read naturally without repeating the literal twice.
fn leak_field_name(s: &'static str) -> &'static str {
	s
}

/// A minimal structural check that a JSON value is plausibly a JSON Schema
/// document: it must be an object, and if it declares a `type`, that type must
/// be one of the JSON Schema primitive types (or an array of such).
fn check_json_schema_shape(schema: &Value) -> Result<(), String> {
	let Value::Object(map) = schema else {
		return Err("schema root must be a JSON object".to_string());
	};
	const PRIMITIVES: &[&str] = &[
		"null", "boolean", "object", "array", "number", "string", "integer",
	];
	if let Some(ty) = map.get("type") {
		let valid = match ty {
			Value::String(s) => PRIMITIVES.contains(&s.as_str()),
			Value::Array(arr) => arr
				.iter()
				.all(|v| matches!(v, Value::String(s) if PRIMITIVES.contains(&s.as_str()))),
			_ => false,
		};
		if !valid {
			return Err(format!("unrecognized \"type\" value: {ty}"));
		}
	}
	Ok(())
}

/// A compatibility check between a requested capability shape and one a
/// worker advertises: major versions must match exactly, the advertised
/// minor.patch must be greater than or equal to what was requested, and every
/// requested constraint must be present (and equal) in the advertised set.
pub fn is_compatible(
	requested_version: &Version,
	requested_constraints: &BTreeMap<String, String>,
	advertised: &CapabilityDefinition,
) -> bool {
	if !advertised.version.satisfies(requested_version) {
		return false;
	}
	requested_constraints
		.iter()
		.all(|(k, v)| advertised.constraints.get(k) == Some(v))
}

/// A strict parser for wire-provided capability definitions. Before any typed
/// deserialization happens, the raw bytes are checked for UTF-8 validity,
/// size, and nesting depth, and the raw JSON object is checked for unknown
/// top-level keys — an adversarial payload never reaches serde's recursive
/// descent into [`CapabilityDefinition`].
pub fn parse(bytes: &[u8]) -> Result<CapabilityDefinition, ParseError> {
	if bytes.len() >= MAX_PAYLOAD_BYTES {
		return Err(ParseError::TooLarge {
			limit: MAX_PAYLOAD_BYTES,
			actual: bytes.len(),
		});
	}
	let text = std::str::from_utf8(bytes).map_err(|_| ParseError::NotUtf8)?;
	let raw: Value = serde_json::from_str(text)?;

	if depth(&raw) >= MAX_NESTING_DEPTH {
		return Err(ParseError::TooDeep {
			limit: MAX_NESTING_DEPTH,
			actual: depth(&raw),
		});
	}

	if let Value::Object(map) = &raw {
		for key in map.keys() {
			if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
				return Err(ParseError::UnknownKey(key.clone()));
			}
		}
	}

	Ok(serde_json::from_value(raw)?)
}

fn depth(value: &Value) -> usize {
	match value {
		Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
		Value::Array(arr) => 1 + arr.iter().map(depth).max().unwrap_or(0),
		_ => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn sample() -> CapabilityDefinition {
		CapabilityDefinition {
			id: "document.convert".to_string(),
			version: Version::new(1, 2, 0),
			io_contract: IoContract {
				input_schema: json!({"type": "object"}),
				output_schema: json!({"type": "object"}),
				error_codes: vec![ErrorCodeDef {
					code: "BAD_INPUT".to_string(),
					description: "input could not be parsed".to_string(),
				}],
			},
			constraints: BTreeMap::from([("arch".to_string(), "x64".to_string())]),
			tags: vec!["documents".to_string()],
		}
	}

	#[test]
	fn validates_clean_definition() {
		assert!(validate(&sample()).is_ok());
	}

	#[test]
	fn rejects_duplicate_error_codes() {
		let mut def = sample();
		def.io_contract.error_codes.push(ErrorCodeDef {
			code: "BAD_INPUT".to_string(),
			description: "dup".to_string(),
		});
		let errs = validate(&def).unwrap_err();
		assert!(matches!(errs[0], SchemaViolation::DuplicateErrorCode(_)));
	}

	#[test]
	fn rejects_too_many_tags() {
		let mut def = sample();
		def.tags = (0..MAX_TAGS + 1).map(|i| i.to_string()).collect();
		let errs = validate(&def).unwrap_err();
		assert!(matches!(errs[0], SchemaViolation::TooManyTags { .. }));
	}

	#[test]
	fn rejects_non_object_schema() {
		let mut def = sample();
		def.io_contract.input_schema = json!("not-a-schema");
		let errs = validate(&def).unwrap_err();
		assert!(matches!(errs[0], SchemaViolation::InvalidJsonSchema { .. }));
	}

	#[test]
	fn compatibility_requires_equal_major_and_constraint_subset() {
		let def = sample();
		assert!(is_compatible(
			&Version::new(1, 0, 0),
			&BTreeMap::from([("arch".to_string(), "x64".to_string())]),
			&def
		));
		assert!(!is_compatible(&Version::new(2, 0, 0), &BTreeMap::new(), &def));
		assert!(!is_compatible(
			&Version::new(1, 0, 0),
			&BTreeMap::from([("gpu".to_string(), "true".to_string())]),
			&def
		));
	}

	#[test]
	fn parse_round_trips_valid_definition() {
		let def = sample();
		let bytes = serde_json::to_vec(&def).unwrap();
		let parsed = parse(&bytes).unwrap();
		assert_eq!(parsed, def);
	}

	#[test]
	fn parse_rejects_unknown_top_level_key() {
		let mut value = serde_json::to_value(sample()).unwrap();
		value
			.as_object_mut()
			.unwrap()
			.insert("extra".to_string(), json!("nope"));
		let bytes = serde_json::to_vec(&value).unwrap();
		assert!(matches!(parse(&bytes), Err(ParseError::UnknownKey(_))));
	}

	#[test]
	fn parse_rejects_oversized_payload() {
		let huge = vec![b'a'; MAX_PAYLOAD_BYTES + 1];
		assert!(matches!(parse(&huge), Err(ParseError::TooLarge { .. }) | Err(ParseError::Malformed(_))));
	}

	#[test]
	fn parse_rejects_deep_nesting() {
		let mut value = json!("leaf");
		for _ in 0..MAX_NESTING_DEPTH + 1 {
			value = json!({"nested": value});
		}
		let bytes = serde_json::to_vec(&value).unwrap();
		assert!(matches!(parse(&bytes), Err(ParseError::TooDeep { .. }) | Err(ParseError::UnknownKey(_))));
	}

	#[test]
	fn parse_rejects_non_utf8() {
		let bytes = vec![0xff, 0xfe, 0xfd];
		assert!(matches!(parse(&bytes), Err(ParseError::NotUtf8)));
	}
}
