//! Service resolution: from a trigger to the run's build units.

use std::collections::BTreeSet;

use drydock_core::{DrydockError, PipelineConfig, Result, ServiceImageSpec, Trigger};

/// Resolve the trigger's services against the configured ones.
///
/// An empty service list selects every configured service. Unknown or
/// repeated names are configuration errors. The result follows the order of
/// the configuration file.
pub fn resolve_services(config: &PipelineConfig, trigger: &Trigger) -> Result<Vec<ServiceImageSpec>> {
    if trigger.revision.trim().is_empty() {
        return Err(DrydockError::config("trigger carries no revision"));
    }

    let requested: BTreeSet<&str> = if trigger.services.is_empty() {
        config.services.iter().map(|s| s.name.as_str()).collect()
    } else {
        let mut seen = BTreeSet::new();
        for name in &trigger.services {
            if config.service(name).is_none() {
                return Err(DrydockError::config(format!(
                    "unknown service '{name}' (configured: {})",
                    config.service_names().join(", ")
                )));
            }
            if !seen.insert(name.as_str()) {
                return Err(DrydockError::config(format!(
                    "service '{name}' requested twice"
                )));
            }
        }
        seen
    };

    if requested.is_empty() {
        return Err(DrydockError::config("no services configured"));
    }

    Ok(config
        .services
        .iter()
        .filter(|s| requested.contains(s.name.as_str()))
        .map(|s| config.image_spec(s, &trigger.revision))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use drydock_core::ErrorClass;

    const CONFIG: &str = r#"
[registry]
repository_prefix = "registry.local/voting"
tag = "{short_revision}"

[[services]]
name = "vote"
context = "vote"

[[services]]
name = "result"
context = "result"

[[services]]
name = "worker"
context = "worker"
dockerfile = "Dockerfile.worker"
"#;

    fn config() -> PipelineConfig {
        PipelineConfig::from_toml_str(CONFIG).unwrap()
    }

    const REV: &str = "3f2a9c0d1e4b5a6978c0d1e2f3a4b5c6d7e8f901";

    #[test]
    fn test_empty_selection_means_all() {
        let specs = resolve_services(&config(), &Trigger::new(REV, vec![])).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["vote", "result", "worker"]);
        assert_eq!(specs[0].target.repository, "registry.local/voting/vote");
        assert_eq!(specs[0].target.tag, "3f2a9c0d1e4b");
        assert_eq!(
            specs[2].dockerfile.as_deref(),
            Some(std::path::Path::new("Dockerfile.worker"))
        );
    }

    #[test]
    fn test_selection_keeps_config_order() {
        let trigger = Trigger::new(REV, vec!["worker".into(), "vote".into()]);
        let specs = resolve_services(&config(), &trigger).unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["vote", "worker"]);
    }

    #[test]
    fn test_unknown_service_is_configuration_error() {
        let trigger = Trigger::new(REV, vec!["billing".into()]);
        let err = resolve_services(&config(), &trigger).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn test_duplicate_service_is_configuration_error() {
        let trigger = Trigger::new(REV, vec!["vote".into(), "vote".into()]);
        let err = resolve_services(&config(), &trigger).unwrap_err();
        assert!(err.to_string().contains("twice"));
    }

    #[test]
    fn test_missing_revision() {
        let err = resolve_services(&config(), &Trigger::new("  ", vec![])).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Configuration);
    }
}
