use stevedore::{Definition, Run};
use uuid::Uuid;

/// Mint a run with a unique id, ready for submission against
/// [`test_definition`](crate::test_definition).
pub fn test_run(definition_id: &str) -> Run {
    Run {
        run_id: format!("run-{}", Uuid::new_v4()),
        definition_id: definition_id.to_string(),
        cluster_name: "test-cluster".to_string(),
        group_name: "test-group".to_string(),
        image: "repo/image:1".to_string(),
        command: Some("echo hello".to_string()),
        ..Run::default()
    }
}

/// A plain definition with modest resource defaults.
pub fn test_definition(definition_id: &str) -> Definition {
    Definition {
        definition_id: definition_id.to_string(),
        image: "repo/image:1".to_string(),
        cpu: Some(1000),
        memory: Some(2048),
        ..Definition::default()
    }
}
