//! Validation of composed environments.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::composer::{ComposedEnvironment, ResolvedInstance};
use crate::error::{SpecError, SpecResult};
use crate::models::{Attributes, ModuleDefinition};
use crate::reader::ModuleCatalog;
use crate::reference;
use crate::schema::SchemaValidator;

/// Result of validating an environment.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(message.into());
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: ValidationReport) {
        if !other.valid {
            self.valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Validate `inputs` against `module`'s schema, returning coerced inputs or a
/// [`SpecError::Schema`] listing every failure.
///
/// Values of inputs named in `sensitive` are masked in the errors.
pub fn check_inputs(
    target: &str,
    module: &ModuleDefinition,
    inputs: &Attributes,
    sensitive: &BTreeSet<String>,
    allow_references: bool,
) -> SpecResult<Attributes> {
    SchemaValidator::new(&module.inputs)
        .with_sensitive(sensitive)
        .allow_references(allow_references)
        .validate(inputs)
        .map_err(|errors| SpecError::Schema {
            target: target.to_string(),
            errors,
        })
}

/// Structural validator: runs before any dependency output exists.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate every instance of a composed environment.
    pub fn validate_environment(
        env: &ComposedEnvironment,
        catalog: &ModuleCatalog,
    ) -> ValidationReport {
        let mut report = ValidationReport::new();
        info!("Validating environment {}", env.name);

        for warning in &env.warnings {
            report.add_warning(warning.clone());
        }
        for instance in &env.instances {
            report.merge(Self::validate_instance(instance, env, catalog));
        }

        debug!(
            "Validation of {} finished: {} error(s), {} warning(s)",
            env.name,
            report.errors.len(),
            report.warnings.len()
        );
        report
    }

    fn validate_instance(
        instance: &ResolvedInstance,
        env: &ComposedEnvironment,
        catalog: &ModuleCatalog,
    ) -> ValidationReport {
        let mut report = ValidationReport::new();
        let name = instance.name();

        let Some(module) = catalog.get(&instance.module) else {
            report.add_error(format!("{}: module '{}' not found", name, instance.module));
            return report;
        };

        if let Err(SpecError::Schema { errors, .. }) = check_inputs(
            name,
            module,
            &instance.effective_inputs(),
            &instance.sensitive_inputs,
            true,
        ) {
            for error in errors {
                report.add_error(format!("{}: {}", name, error));
            }
        }

        let mut seen_aliases = std::collections::HashSet::new();
        for dep in &instance.dependencies {
            if !seen_aliases.insert(dep.name.as_str()) {
                report.add_error(format!("{}: dependency '{}' declared twice", name, dep.name));
            }
            let Some(target) = env.instance(dep.target_instance()) else {
                report.add_error(format!(
                    "{}: dependency '{}' points at unknown instance '{}'",
                    name,
                    dep.name,
                    dep.target_instance()
                ));
                continue;
            };
            if let Some(target_module) = catalog.get(&target.module) {
                for output in dep.mock_outputs.keys() {
                    if !target_module.outputs.contains_key(output) {
                        report.add_warning(format!(
                            "{}: mock output '{}' of dependency '{}' is not declared by module '{}'",
                            name, output, dep.name, target.module
                        ));
                    }
                }
            }
        }

        for value in instance.inputs.values() {
            for reference in reference::find_references(value) {
                let Some(dep) = instance.dependency(&reference.dependency) else {
                    report.add_error(format!(
                        "{}: reference {} names an undeclared dependency",
                        name, reference
                    ));
                    continue;
                };
                let declared = env
                    .instance(dep.target_instance())
                    .and_then(|target| catalog.get(&target.module))
                    .map(|m| m.outputs.contains_key(&reference.output));
                if declared == Some(false) {
                    report.add_error(format!(
                        "{}: reference {} names output '{}' that instance '{}' does not declare",
                        name,
                        reference,
                        reference.output,
                        dep.target_instance()
                    ));
                }
            }
        }

        report
    }
}
