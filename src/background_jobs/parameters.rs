//! Declarative parameter schemas for job templates.

use super::job::ValidationError;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Integer { min: i64, max: i64 },
    Boolean,
    String,
    Enum { values: &'static [&'static str] },
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    pub description: &'static str,
}

impl ParameterSpec {
    pub fn integer(name: &'static str, min: i64, max: i64, description: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Integer { min, max },
            required: false,
            default: None,
            description,
        }
    }

    pub fn boolean(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::Boolean,
            required: false,
            default: None,
            description,
        }
    }

    pub fn string(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind: ParamKind::String,
            required: false,
            default: None,
            description,
        }
    }

    pub fn one_of(
        name: &'static str,
        values: &'static [&'static str],
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: ParamKind::Enum { values },
            required: false,
            default: None,
            description,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: impl Into<JsonValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    fn check(&self, value: &JsonValue) -> Result<(), String> {
        match (&self.kind, value) {
            (ParamKind::Integer { min, max }, JsonValue::Number(n)) => match n.as_i64() {
                Some(v) if v < *min || v > *max => {
                    Err(format!("must be between {} and {}, got {}", min, max, v))
                }
                Some(_) => Ok(()),
                None => Err("must be an integer".to_string()),
            },
            (ParamKind::Integer { .. }, _) => Err("must be an integer".to_string()),
            (ParamKind::Boolean, JsonValue::Bool(_)) => Ok(()),
            (ParamKind::Boolean, _) => Err("must be a boolean".to_string()),
            (ParamKind::String, JsonValue::String(_)) => Ok(()),
            (ParamKind::String, _) => Err("must be a string".to_string()),
            (ParamKind::Enum { values }, JsonValue::String(s)) if values.contains(&s.as_str()) => {
                Ok(())
            }
            (ParamKind::Enum { values }, _) => Err(format!("must be one of {}", values.join(", "))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ParameterSchema {
    pub parameters: Vec<ParameterSpec>,
}

impl ParameterSchema {
    pub fn new(parameters: Vec<ParameterSpec>) -> Self {
        Self { parameters }
    }

    pub fn defaults(&self) -> Map<String, JsonValue> {
        self.parameters
            .iter()
            .filter_map(|p| p.default.clone().map(|d| (p.name.to_string(), d)))
            .collect()
    }

    /// Overlays `params` on top of the schema defaults. `null` means "use the
    /// default"; any other non-object value is rejected.
    pub fn with_defaults(&self, params: &JsonValue) -> Result<Map<String, JsonValue>, ValidationError> {
        let mut merged = self.defaults();
        match params {
            JsonValue::Null => {}
            JsonValue::Object(map) => {
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
            _ => {
                return Err(ValidationError::InvalidParameters(
                    "parameters must be a JSON object".to_string(),
                ))
            }
        }
        Ok(merged)
    }

    pub fn validate(&self, params: &JsonValue) -> Result<(), ValidationError> {
        let map = match params {
            JsonValue::Object(map) => map,
            _ => {
                return Err(ValidationError::InvalidParameters(
                    "parameters must be a JSON object".to_string(),
                ))
            }
        };

        if let Some(unknown) = map
            .keys()
            .find(|k| !self.parameters.iter().any(|p| p.name == k.as_str()))
        {
            return Err(ValidationError::InvalidParameters(format!(
                "unknown parameter '{}'",
                unknown
            )));
        }

        for spec in &self.parameters {
            match map.get(spec.name) {
                None | Some(JsonValue::Null) if spec.required => {
                    return Err(ValidationError::InvalidParameters(format!(
                        "missing required parameter '{}'",
                        spec.name
                    )))
                }
                None | Some(JsonValue::Null) => {}
                Some(value) => spec.check(value).map_err(|msg| {
                    ValidationError::InvalidParameters(format!("'{}' {}", spec.name, msg))
                })?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ParameterSchema {
        ParameterSchema::new(vec![
            ParameterSpec::integer("batchSize", 1, 500, "Entries per run").with_default(50),
            ParameterSpec::boolean("testMode", "Send everything to testRecipient")
                .with_default(false),
            ParameterSpec::string("label", "Free text").required(),
            ParameterSpec::one_of("mode", &["fast", "slow"], "Mode"),
        ])
    }

    #[test]
    fn test_defaults_are_merged() {
        let merged = schema().with_defaults(&json!({"label": "x"})).unwrap();
        assert_eq!(merged["batchSize"], json!(50));
        assert_eq!(merged["testMode"], json!(false));
        assert_eq!(merged["label"], json!("x"));

        let merged = schema().with_defaults(&JsonValue::Null).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(schema().with_defaults(&json!([1])).is_err());
    }

    #[test]
    fn test_valid_parameters() {
        schema()
            .validate(&json!({"label": "x", "batchSize": 500, "mode": "fast"}))
            .unwrap();
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let s = schema();
        let cases = [
            json!("not an object"),
            json!({"batchSize": 10}),
            json!({"label": "x", "batchSize": 0}),
            json!({"label": "x", "batchSize": 501}),
            json!({"label": "x", "batchSize": "10"}),
            json!({"label": "x", "testMode": 1}),
            json!({"label": 7}),
            json!({"label": "x", "mode": "medium"}),
            json!({"label": "x", "extra": true}),
        ];
        for case in cases {
            assert!(s.validate(&case).is_err(), "expected rejection of {}", case);
        }
    }
}
