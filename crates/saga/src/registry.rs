//! Step registry and saga definitions.
//!
//! Steps are registered once with their compensating action, then sagas
//! are defined as ordered sequences of registered steps. Every definition
//! is validated when it is added, so a running engine never meets an
//! unknown step.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::messages::KEY_SEPARATOR;

/// A registered step and its compensating action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    pub name: String,
    /// Action that undoes the step, `None` if the step has nothing to undo.
    pub compensation: Option<String>,
    /// Overrides the engine's default step deadline.
    pub timeout: Option<Duration>,
}

impl StepDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            compensation: None,
            timeout: None,
        }
    }

    pub fn compensated_by(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// An ordered sequence of steps run for one process type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDefinition {
    process_type: String,
    steps: Vec<String>,
}

impl SagaDefinition {
    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    pub fn first_step(&self) -> Option<&str> {
        self.steps.first().map(String::as_str)
    }

    /// Returns the step that follows `step`, `None` if it is the last one.
    pub fn next_after(&self, step: &str) -> Option<&str> {
        let position = self.steps.iter().position(|s| s == step)?;
        self.steps.get(position + 1).map(String::as_str)
    }
}

/// JSON manifest for loading a registry from disk.
///
/// ```json
/// {
///   "steps": [
///     { "name": "ReserveInventory", "compensation": "ReleaseInventory", "timeout_secs": 30 }
///   ],
///   "sagas": [
///     { "process_type": "OrderFulfillment", "steps": ["ReserveInventory"] }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryManifest {
    #[serde(default)]
    pub steps: Vec<StepManifest>,
    #[serde(default)]
    pub sagas: Vec<SagaManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepManifest {
    pub name: String,
    #[serde(default)]
    pub compensation: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaManifest {
    pub process_type: String,
    pub steps: Vec<String>,
}

/// Registered steps and saga definitions.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepDescriptor>,
    sagas: HashMap<String, SagaDefinition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a step. Names must be non-empty, unique and free of
    /// [`KEY_SEPARATOR`].
    pub fn register_step(&mut self, descriptor: StepDescriptor) -> Result<()> {
        if descriptor.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "step name must not be empty".to_string(),
            ));
        }
        if descriptor.name.contains(KEY_SEPARATOR) {
            return Err(SagaError::InvalidDefinition(format!(
                "step name '{}' must not contain '{KEY_SEPARATOR}'",
                descriptor.name
            )));
        }
        if descriptor
            .compensation
            .as_deref()
            .is_some_and(|action| action.trim().is_empty())
        {
            return Err(SagaError::InvalidDefinition(format!(
                "step '{}' has an empty compensation action",
                descriptor.name
            )));
        }
        if self.steps.contains_key(&descriptor.name) {
            return Err(SagaError::InvalidDefinition(format!(
                "step '{}' is already registered",
                descriptor.name
            )));
        }
        self.steps.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Defines a saga as an ordered sequence of registered steps.
    pub fn define_saga<I, T>(&mut self, process_type: impl Into<String>, steps: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let process_type = process_type.into();
        let steps: Vec<String> = steps.into_iter().map(Into::into).collect();

        if process_type.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "process type must not be empty".to_string(),
            ));
        }
        if self.sagas.contains_key(&process_type) {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{process_type}' is already defined"
            )));
        }
        if steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{process_type}' has no steps"
            )));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !self.steps.contains_key(step) {
                return Err(SagaError::UnknownStep(step.clone()));
            }
            if !seen.insert(step.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{process_type}' lists step '{step}' twice"
                )));
            }
        }

        self.sagas.insert(
            process_type.clone(),
            SagaDefinition {
                process_type,
                steps,
            },
        );
        Ok(())
    }

    pub fn step(&self, name: &str) -> Result<&StepDescriptor> {
        self.steps
            .get(name)
            .ok_or_else(|| SagaError::UnknownStep(name.to_string()))
    }

    pub fn saga(&self, process_type: &str) -> Result<&SagaDefinition> {
        self.sagas
            .get(process_type)
            .ok_or_else(|| SagaError::UnknownProcessType(process_type.to_string()))
    }

    pub fn process_types(&self) -> impl Iterator<Item = &str> {
        self.sagas.keys().map(String::as_str)
    }

    /// Builds a registry from a manifest, validating every entry.
    pub fn from_manifest(manifest: RegistryManifest) -> Result<Self> {
        let mut registry = Self::new();
        for step in manifest.steps {
            let mut descriptor = StepDescriptor::new(step.name);
            descriptor.compensation = step.compensation;
            descriptor.timeout = step.timeout_secs.map(Duration::from_secs);
            registry.register_step(descriptor)?;
        }
        for saga in manifest.sagas {
            registry.define_saga(saga.process_type, saga.steps)?;
        }
        Ok(registry)
    }

    /// Parses a JSON manifest.
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: RegistryManifest = serde_json::from_str(json)?;
        Self::from_manifest(manifest)
    }

    /// Reads a JSON manifest from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SagaError::InvalidDefinition(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_registry() -> StepRegistry {
        let mut registry = StepRegistry::new();
        registry
            .register_step(StepDescriptor::new("ReserveInventory").compensated_by("ReleaseInventory"))
            .unwrap();
        registry
            .register_step(StepDescriptor::new("ChargePayment").compensated_by("RefundPayment"))
            .unwrap();
        registry
            .register_step(StepDescriptor::new("CreateShipment"))
            .unwrap();
        registry
            .define_saga(
                "OrderFulfillment",
                ["ReserveInventory", "ChargePayment", "CreateShipment"],
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_step_sequence() {
        let registry = order_registry();
        let saga = registry.saga("OrderFulfillment").unwrap();
        assert_eq!(saga.first_step(), Some("ReserveInventory"));
        assert_eq!(saga.next_after("ReserveInventory"), Some("ChargePayment"));
        assert_eq!(saga.next_after("CreateShipment"), None);
        assert_eq!(saga.next_after("Unknown"), None);
    }

    #[test]
    fn test_unknown_step_rejected_at_definition() {
        let mut registry = order_registry();
        let result = registry.define_saga("Broken", ["ReserveInventory", "Teleport"]);
        assert!(matches!(result, Err(SagaError::UnknownStep(step)) if step == "Teleport"));
    }

    #[test]
    fn test_invalid_definitions() {
        let mut registry = order_registry();
        assert!(matches!(
            registry.define_saga("Empty", Vec::<String>::new()),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            registry.define_saga("Twice", ["ChargePayment", "ChargePayment"]),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            registry.define_saga("OrderFulfillment", ["ChargePayment"]),
            Err(SagaError::InvalidDefinition(_))
        ));
        assert!(matches!(
            registry.register_step(StepDescriptor::new("ChargePayment")),
            Err(SagaError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_step_name_with_key_separator_rejected() {
        let mut registry = StepRegistry::new();
        let result = registry.register_step(StepDescriptor::new("Charge:Payment"));
        assert!(matches!(result, Err(SagaError::InvalidDefinition(msg)) if msg.contains("Charge:Payment")));
        assert!(registry.step("Charge:Payment").is_err());
    }

    #[test]
    fn test_lookup_errors() {
        let registry = order_registry();
        assert!(matches!(
            registry.saga("Missing"),
            Err(SagaError::UnknownProcessType(_))
        ));
        assert!(matches!(
            registry.step("Missing"),
            Err(SagaError::UnknownStep(_))
        ));
        assert_eq!(
            registry.step("CreateShipment").unwrap().compensation,
            None
        );
    }

    #[test]
    fn test_from_json_manifest() {
        let registry = StepRegistry::from_json(
            r#"{
                "steps": [
                    {"name": "ReserveInventory", "compensation": "ReleaseInventory", "timeout_secs": 30},
                    {"name": "ChargePayment", "compensation": "RefundPayment"}
                ],
                "sagas": [
                    {"process_type": "OrderFulfillment", "steps": ["ReserveInventory", "ChargePayment"]}
                ]
            }"#,
        )
        .unwrap();

        let step = registry.step("ReserveInventory").unwrap();
        assert_eq!(step.timeout, Some(Duration::from_secs(30)));
        assert_eq!(step.compensation.as_deref(), Some("ReleaseInventory"));
        assert_eq!(
            registry.saga("OrderFulfillment").unwrap().steps().len(),
            2
        );
    }

    #[test]
    fn test_manifest_with_unknown_step_fails() {
        let result = StepRegistry::from_json(
            r#"{"steps": [], "sagas": [{"process_type": "X", "steps": ["Nope"]}]}"#,
        );
        assert!(matches!(result, Err(SagaError::UnknownStep(_))));
    }
}
