use serde::{Deserialize, Serialize};

use crate::cluster::{NodeAffinity, NodeSelectorRequirement, SelectorOperator};
use crate::run::{Definition, NodeLifecycle, Run};

/// Node label carrying the instance type.
pub const INSTANCE_TYPE_LABEL: &str = "beta.kubernetes.io/instance-type";

/// Node label carrying the lifecycle class.
pub const LIFECYCLE_LABEL: &str = "kubernetes.io/lifecycle";

/// Lifecycle label value for on-demand nodes.
const ONDEMAND_LIFECYCLE_VALUE: &str = "normal";

/// Lifecycle label value for spot nodes.
const SPOT_LIFECYCLE_VALUE: &str = "spot";

/// Millicores per MiB at or above which a shape counts as CPU-heavy.
const CPU_HEAVY_RATIO: f64 = 0.5;

/// Instance-class lists the synthesizer steers runs with.
///
/// These are deployment configuration, not invariants; the defaults match
/// the fleet the engine was first built for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AffinityConfig {
    /// Instance types reserved for GPU workloads; non-GPU runs are kept off
    /// these.
    pub gpu_instance_types: Vec<String>,
    /// Instance types CPU-heavy runs are pinned onto.
    pub cpu_instance_types: Vec<String>,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            gpu_instance_types: vec![
                "p3.2xlarge".to_string(),
                "p3.8xlarge".to_string(),
                "p3.16xlarge".to_string(),
            ],
            cpu_instance_types: vec![
                "c5.2xlarge".to_string(),
                "c5.4xlarge".to_string(),
                "c5.9xlarge".to_string(),
            ],
        }
    }
}

/// Produces required-during-scheduling node selection from a run's shape.
#[derive(Clone, Debug, Default)]
pub struct AffinitySynthesizer {
    config: AffinityConfig,
}

impl AffinitySynthesizer {
    /// Create a synthesizer over the given instance-class lists.
    pub fn new(config: AffinityConfig) -> Self {
        Self { config }
    }

    /// Synthesize node affinity for a run.
    ///
    /// Non-GPU runs are excluded from GPU instance types; CPU-heavy shapes
    /// (granted millicores per MiB at or above the threshold) are pinned to
    /// the CPU instance class; every run is pinned to its lifecycle class.
    pub fn synthesize(&self, definition: &Definition, run: &Run) -> NodeAffinity {
        let mut required = Vec::new();

        if definition.gpu_count() <= 0 {
            required.push(NodeSelectorRequirement {
                key: INSTANCE_TYPE_LABEL.to_string(),
                operator: SelectorOperator::NotIn,
                values: self.config.gpu_instance_types.clone(),
            });

            if let (Some(cpu), Some(memory)) = (run.cpu, run.memory) {
                if cpu > 0 && memory > 0 && cpu as f64 / memory as f64 >= CPU_HEAVY_RATIO {
                    required.push(NodeSelectorRequirement {
                        key: INSTANCE_TYPE_LABEL.to_string(),
                        operator: SelectorOperator::In,
                        values: self.config.cpu_instance_types.clone(),
                    });
                }
            }
        }

        let lifecycle_value = match run.node_lifecycle.unwrap_or_default() {
            NodeLifecycle::Ondemand => ONDEMAND_LIFECYCLE_VALUE,
            NodeLifecycle::Spot => SPOT_LIFECYCLE_VALUE,
        };
        required.push(NodeSelectorRequirement {
            key: LIFECYCLE_LABEL.to_string(),
            operator: SelectorOperator::In,
            values: vec![lifecycle_value.to_string()],
        });

        NodeAffinity { required }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirement<'a>(
        affinity: &'a NodeAffinity,
        operator: SelectorOperator,
        key: &str,
    ) -> Option<&'a NodeSelectorRequirement> {
        affinity
            .required
            .iter()
            .find(|r| r.operator == operator && r.key == key)
    }

    #[test]
    fn non_gpu_runs_avoid_gpu_instances() {
        let affinity =
            AffinitySynthesizer::default().synthesize(&Definition::default(), &Run::default());

        let exclusion = requirement(&affinity, SelectorOperator::NotIn, INSTANCE_TYPE_LABEL)
            .expect("gpu exclusion present");
        assert_eq!(exclusion.values, AffinityConfig::default().gpu_instance_types);

        let lifecycle = requirement(&affinity, SelectorOperator::In, LIFECYCLE_LABEL)
            .expect("lifecycle pin present");
        assert_eq!(lifecycle.values, vec!["spot".to_string()]);
    }

    #[test]
    fn cpu_heavy_shapes_pin_to_cpu_instances() {
        let run = Run {
            cpu: Some(1024),
            memory: Some(2048),
            ..Run::default()
        };
        let affinity = AffinitySynthesizer::default().synthesize(&Definition::default(), &run);

        let pin = requirement(&affinity, SelectorOperator::In, INSTANCE_TYPE_LABEL)
            .expect("cpu pin present");
        assert_eq!(pin.values, AffinityConfig::default().cpu_instance_types);
    }

    #[test]
    fn balanced_shapes_are_not_pinned() {
        let run = Run {
            cpu: Some(1000),
            memory: Some(4096),
            ..Run::default()
        };
        let affinity = AffinitySynthesizer::default().synthesize(&Definition::default(), &run);

        assert!(requirement(&affinity, SelectorOperator::In, INSTANCE_TYPE_LABEL).is_none());
    }

    #[test]
    fn gpu_definitions_skip_instance_steering() {
        let definition = Definition {
            gpu: Some(2),
            ..Definition::default()
        };
        let run = Run {
            cpu: Some(4000),
            memory: Some(4096),
            node_lifecycle: Some(crate::run::NodeLifecycle::Ondemand),
            ..Run::default()
        };
        let affinity = AffinitySynthesizer::default().synthesize(&definition, &run);

        assert!(requirement(&affinity, SelectorOperator::NotIn, INSTANCE_TYPE_LABEL).is_none());
        let lifecycle = requirement(&affinity, SelectorOperator::In, LIFECYCLE_LABEL)
            .expect("lifecycle pin present");
        assert_eq!(lifecycle.values, vec!["normal".to_string()]);
        assert_eq!(affinity.required.len(), 1);
    }

    #[test]
    fn instance_lists_come_from_configuration() {
        let config = AffinityConfig {
            gpu_instance_types: vec!["g5.xlarge".to_string()],
            cpu_instance_types: vec!["c7i.4xlarge".to_string()],
        };
        let run = Run {
            cpu: Some(2048),
            memory: Some(2048),
            ..Run::default()
        };
        let affinity = AffinitySynthesizer::new(config).synthesize(&Definition::default(), &run);

        let exclusion = requirement(&affinity, SelectorOperator::NotIn, INSTANCE_TYPE_LABEL)
            .expect("gpu exclusion present");
        assert_eq!(exclusion.values, vec!["g5.xlarge".to_string()]);
        let pin = requirement(&affinity, SelectorOperator::In, INSTANCE_TYPE_LABEL)
            .expect("cpu pin present");
        assert_eq!(pin.values, vec!["c7i.4xlarge".to_string()]);
    }
}
