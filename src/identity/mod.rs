//! Stable workload identity.
//!
//! Restart accounting and quarantine must survive container recreation, so
//! every durable key is derived from labels and name rather than the runtime
//! container id. This is the only implementation of the rule; nothing else
//! in the codebase derives identifiers from snapshots.

use std::collections::HashMap;

use crate::runtime::ContainerSnapshot;

/// Explicit identity override set by the operator.
pub const ID_LABEL: &str = "monitoring.id";

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Swarm stack services already carry a `stack_service` style name.
pub const SWARM_SERVICE_LABEL: &str = "com.docker.swarm.service.name";

pub fn resolve(snapshot: &ContainerSnapshot) -> String {
    stable_id(&snapshot.labels, &snapshot.name)
}

/// Derive the stable identifier for a container.
///
/// Priority: explicit `monitoring.id` label, then compose
/// `project_service`, then the swarm service name, then the container name.
pub fn stable_id(labels: &HashMap<String, String>, name: &str) -> String {
    if let Some(id) = labels.get(ID_LABEL) {
        let id = id.trim();
        if !id.is_empty() {
            return id.to_string();
        }
    }

    if let (Some(project), Some(service)) = (
        labels.get(COMPOSE_PROJECT_LABEL),
        labels.get(COMPOSE_SERVICE_LABEL),
    ) {
        if !project.is_empty() && !service.is_empty() {
            return format!("{}_{}", project, service);
        }
    }

    if let Some(service) = labels.get(SWARM_SERVICE_LABEL) {
        if !service.is_empty() {
            return service.clone();
        }
    }

    name.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_custom_label_wins() {
        let l = labels(&[
            (ID_LABEL, "payments"),
            (COMPOSE_PROJECT_LABEL, "shop"),
            (COMPOSE_SERVICE_LABEL, "api"),
        ]);
        assert_eq!(stable_id(&l, "shop_api_1"), "payments");
    }

    #[test]
    fn test_custom_label_trimmed() {
        let l = labels(&[(ID_LABEL, "  payments  ")]);
        assert_eq!(stable_id(&l, "x"), "payments");
    }

    #[test]
    fn test_empty_custom_label_ignored() {
        let l = labels(&[
            (ID_LABEL, "   "),
            (COMPOSE_PROJECT_LABEL, "shop"),
            (COMPOSE_SERVICE_LABEL, "api"),
        ]);
        assert_eq!(stable_id(&l, "shop_api_1"), "shop_api");
    }

    #[test]
    fn test_compose_project_service() {
        let l = labels(&[
            (COMPOSE_PROJECT_LABEL, "shop"),
            (COMPOSE_SERVICE_LABEL, "api"),
        ]);
        // Must be project_service, never bare service.
        assert_eq!(stable_id(&l, "shop-api-1"), "shop_api");
    }

    #[test]
    fn test_compose_requires_both_labels() {
        let l = labels(&[(COMPOSE_SERVICE_LABEL, "api")]);
        assert_eq!(stable_id(&l, "lonely"), "lonely");
    }

    #[test]
    fn test_swarm_stack_service() {
        let l = labels(&[(SWARM_SERVICE_LABEL, "prod_web")]);
        assert_eq!(stable_id(&l, "prod_web.1.abc123"), "prod_web");
    }

    #[test]
    fn test_plain_name_fallback() {
        let l = labels(&[]);
        assert_eq!(stable_id(&l, "/standalone"), "standalone");
    }

    #[test]
    fn test_recreation_yields_same_id() {
        let l = labels(&[
            (COMPOSE_PROJECT_LABEL, "shop"),
            (COMPOSE_SERVICE_LABEL, "api"),
        ]);
        let first = stable_id(&l, "shop-api-1");
        let second = stable_id(&l, "shop-api-2");
        assert_eq!(first, second);
    }
}
