//! Form configuration: the declarative schema plus the runtime hooks

use crate::error::{FormError, Result};
use crate::handlers::SubmitHandler;
use crate::state::{CustomCheck, FieldDefinition, FormData};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// When a field is validated before it has been validated once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// On every change and on blur
    #[default]
    OnChange,
    /// On blur only
    OnBlur,
    /// Not before the first submit
    OnSubmit,
    /// On blur, and on change once the field has been touched
    OnTouched,
}

/// When a field is validated again after its first validation or a submit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevalidateMode {
    /// On every change and on blur
    #[default]
    OnChange,
    /// On blur only
    OnBlur,
}

/// Serializable part of a form's configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormSchema {
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub initial_values: FormData,
    #[serde(default)]
    pub validation_mode: ValidationMode,
    #[serde(default)]
    pub revalidate_mode: RevalidateMode,
}

impl FormSchema {
    /// Get the default schema file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("io", "formyx", "formyx").map(|dirs| dirs.config_dir().join("form.json"))
    }

    /// Load a schema from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let schema: FormSchema = serde_json::from_str(&content)?;
        schema.check()?;
        Ok(schema)
    }

    /// Load the schema at the default path, if there is one
    pub fn load_default() -> Result<Option<Self>> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path).map(Some),
            _ => Ok(None),
        }
    }

    /// Save the schema as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Reject duplicate names and dependencies on unknown fields
    pub fn check(&self) -> Result<()> {
        let mut names = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() {
                return Err(FormError::Config("field with an empty name".to_string()));
            }
            if !names.insert(field.name.as_str()) {
                return Err(FormError::Config(format!("duplicate field `{}`", field.name)));
            }
        }
        for field in &self.fields {
            if let Some(missing) = field
                .dependencies
                .iter()
                .find(|dep| !names.contains(dep.as_str()))
            {
                return Err(FormError::Config(format!(
                    "field `{}` depends on unknown field `{missing}`",
                    field.name
                )));
            }
        }
        Ok(())
    }
}

/// Cross-field validator run on submit; returns messages keyed by field
pub type FormValidator = dyn Fn(&FormData) -> BTreeMap<String, String> + Send + Sync;

/// Everything the engine needs to run a form
#[derive(Clone, Default)]
pub struct FormConfig {
    pub schema: FormSchema,
    pub(crate) form_validator: Option<Arc<FormValidator>>,
    pub(crate) submit_handler: Option<Arc<dyn SubmitHandler>>,
}

impl FormConfig {
    pub fn new(schema: FormSchema) -> Self {
        Self {
            schema,
            ..Default::default()
        }
    }

    /// Set the cross-field validator run on submit
    pub fn with_form_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&FormData) -> BTreeMap<String, String> + Send + Sync + 'static,
    {
        self.form_validator = Some(Arc::new(validator));
        self
    }

    pub fn with_submit_handler(mut self, handler: Arc<dyn SubmitHandler>) -> Self {
        self.submit_handler = Some(handler);
        self
    }

    /// Attach a custom predicate to a field's rule
    pub fn with_check(mut self, field: &str, check: CustomCheck) -> Result<Self> {
        let definition = self
            .schema
            .fields
            .iter_mut()
            .find(|f| f.name == field)
            .ok_or_else(|| FormError::Config(format!("unknown field `{field}`")))?;
        definition
            .validation
            .get_or_insert_with(Default::default)
            .validate = Some(check);
        Ok(self)
    }
}

impl fmt::Debug for FormConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormConfig")
            .field("schema", &self.schema)
            .field("form_validator", &self.form_validator.is_some())
            .field("submit_handler", &self.submit_handler.is_some())
            .finish()
    }
}
