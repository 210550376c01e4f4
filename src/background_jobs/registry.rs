//! Catalog of job templates keyed by template type.

use super::job::{JobTemplate, ValidationError};
use super::parameters::ParameterSchema;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Template metadata exposed to the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
    pub template_type: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameter_schema: ParameterSchema,
    pub default_parameters: Map<String, JsonValue>,
}

impl From<&Arc<dyn JobTemplate>> for TemplateInfo {
    fn from(template: &Arc<dyn JobTemplate>) -> Self {
        let schema = template.parameter_schema();
        TemplateInfo {
            template_type: template.template_type().to_string(),
            name: template.name().to_string(),
            description: template.description().to_string(),
            category: template.category().to_string(),
            default_parameters: schema.defaults(),
            parameter_schema: schema,
        }
    }
}

/// Registry of executable job templates. Populated at startup and read-only
/// afterwards.
#[derive(Default)]
pub struct JobTemplateRegistry {
    templates: HashMap<String, Arc<dyn JobTemplate>>,
}

impl JobTemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, template: Arc<dyn JobTemplate>) -> Result<(), ValidationError> {
        let key = template.template_type().to_string();
        if self.templates.contains_key(&key) {
            return Err(ValidationError::DuplicateTemplateType(key));
        }
        self.templates.insert(key, template);
        Ok(())
    }

    pub fn resolve(&self, template_type: &str) -> Result<Arc<dyn JobTemplate>, ValidationError> {
        self.templates
            .get(template_type)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownTemplateType(template_type.to_string()))
    }

    pub fn validate_parameters(
        &self,
        template_type: &str,
        params: &JsonValue,
    ) -> Result<(), ValidationError> {
        let template = self.resolve(template_type)?;
        template.parameter_schema().validate(params)?;
        match params {
            JsonValue::Object(map) => template.validate(map),
            _ => Ok(()),
        }
    }

    /// Merges the template's defaults under `params` and validates the result.
    pub fn prepare_parameters(
        &self,
        template_type: &str,
        params: &JsonValue,
    ) -> Result<Map<String, JsonValue>, ValidationError> {
        let template = self.resolve(template_type)?;
        let merged = template.parameter_schema().with_defaults(params)?;
        self.validate_parameters(template_type, &JsonValue::Object(merged.clone()))?;
        Ok(merged)
    }

    pub fn list(&self) -> Vec<TemplateInfo> {
        let mut infos: Vec<TemplateInfo> = self.templates.values().map(TemplateInfo::from).collect();
        infos.sort_by(|a, b| a.template_type.cmp(&b.template_type));
        infos
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
