use chrono::{Duration, SecondsFormat, Utc};
use std::collections::BTreeMap;

use crate::cluster::{ResourceList, ResourceRequirements};
use crate::config::ResourceBounds;
use crate::manager::{RunQuery, SortOrder, StateManager};
use crate::run::{Definition, NodeLifecycle, Run, RunStatus, KUBERNETES_ENGINE};

/// Memory band, MiB, in which CPU is raised to hold the 8:1 memory-to-CPU
/// ratio of the large-memory instance class.
const LARGE_MEMORY_FLOOR_MIB: i64 = 36_864;
const LARGE_MEMORY_CEILING_MIB: i64 = 131_072;
const LARGE_MEMORY_MIB_PER_CPU: i64 = 8;

/// Growth factor applied to memory after an OOM kill.
const OOM_MEMORY_GROWTH: f64 = 1.75;

/// Days of history consulted when sizing from prior runs.
const HISTORY_WINDOW_DAYS: i64 = 7;

const OOM_KILLED: &str = "OOMKilled";

/// Decides CPU/memory requests and limits for a new run.
///
/// One pass blends three signals: static configuration (the global bounds),
/// live overrides (run-level, then definition-level defaults), and posterior
/// evidence (the definition's recent history, when adaptive allocation is
/// on). OOM history is asymmetric on purpose: an OOM kill is a hard lower
/// bound on memory but says nothing trustworthy about CPU, since the job
/// likely never reached steady state.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResourcePlanner {
    bounds: ResourceBounds,
}

impl ResourcePlanner {
    /// Create a planner over the given global bounds.
    pub fn new(bounds: ResourceBounds) -> Self {
        Self { bounds }
    }

    /// The bounds this planner clamps into.
    pub fn bounds(&self) -> ResourceBounds {
        self.bounds
    }

    /// Plan requests and limits for a run, feeding the granted request back
    /// into the returned run.
    ///
    /// When the definition has a GPU count the extended resource is added to
    /// both requests and limits and the run is forced onto on-demand
    /// capacity.
    pub async fn plan<M>(
        &self,
        definition: &Definition,
        mut run: Run,
        manager: &M,
        ara_enabled: bool,
    ) -> (ResourceRequirements, Run)
    where
        M: StateManager + ?Sized,
    {
        let (mut cpu_limit, mut memory_limit) = self.seed_defaults(definition, &run);
        let (mut cpu_request, mut memory_request) = (cpu_limit, memory_limit);

        if ara_enabled && definition.adaptive_resource_allocation == Some(true) {
            match self.last_terminal_run(manager, &run).await {
                // Only grow memory off an OOM-killed run; its CPU history is
                // tainted, so the prior grant is carried through unchanged.
                Some(prior)
                    if prior
                        .exit_reason
                        .as_deref()
                        .is_some_and(|reason| reason.contains(OOM_KILLED)) =>
                {
                    if let (Some(prior_memory), Some(prior_cpu)) = (prior.memory, prior.cpu) {
                        memory_request = (prior_memory as f64 * OOM_MEMORY_GROWTH).ceil() as i64;
                        cpu_request = prior_cpu;
                    }
                }
                _ => {
                    if let Ok(estimated) = manager
                        .estimate_run_resources(&definition.definition_id, &run.run_id)
                        .await
                    {
                        cpu_request = estimated.cpu;
                        memory_request = estimated.memory;
                    }
                }
            }
        }

        if cpu_request > cpu_limit {
            cpu_limit = cpu_request;
        }
        if memory_request > memory_limit {
            memory_limit = memory_request;
        }

        cpu_request = self.bounds.clamp_cpu(cpu_request);
        cpu_limit = self.bounds.clamp_cpu(cpu_limit);
        memory_request = self.bounds.clamp_memory(memory_request);
        memory_limit = self.bounds.clamp_memory(memory_limit);

        let gpu = (definition.gpu_count() > 0).then(|| definition.gpu_count());
        if gpu.is_some() {
            run.node_lifecycle = Some(NodeLifecycle::Ondemand);
        }

        run.cpu = Some(cpu_request);
        run.memory = Some(memory_request);

        let requirements = ResourceRequirements {
            limits: ResourceList {
                cpu_millis: Some(cpu_limit),
                memory_mib: Some(memory_limit),
                gpu,
            },
            requests: ResourceList {
                cpu_millis: Some(cpu_request),
                memory_mib: Some(memory_request),
                gpu,
            },
        };
        (requirements, run)
    }

    /// Seed CPU/memory from the override chain: run-level, then
    /// definition-level, then the global minimum. Zero counts as missing.
    fn seed_defaults(&self, definition: &Definition, run: &Run) -> (i64, i64) {
        let mut cpu = self.bounds.min_cpu_millis;
        let mut memory = self.bounds.min_memory_mib;

        match run.cpu {
            Some(run_cpu) if run_cpu != 0 => cpu = run_cpu,
            _ => {
                if let Some(definition_cpu) = definition.cpu.filter(|c| *c != 0) {
                    cpu = definition_cpu;
                }
            }
        }
        match run.memory {
            Some(run_memory) if run_memory != 0 => memory = run_memory,
            _ => {
                if let Some(definition_memory) = definition.memory.filter(|m| *m != 0) {
                    memory = definition_memory;
                }
            }
        }

        // Memory-heavy, GPU-less shapes get CPU raised to the instance
        // class ratio so they land on the right nodes.
        if (LARGE_MEMORY_FLOOR_MIB..LARGE_MEMORY_CEILING_MIB).contains(&memory)
            && definition.gpu_count() == 0
        {
            let cpu_for_ratio = memory / LARGE_MEMORY_MIB_PER_CPU;
            if cpu_for_ratio > cpu {
                cpu = cpu_for_ratio;
            }
        }

        (cpu, memory)
    }

    /// Most recent terminal run of the same definition and exact command
    /// within the history window, restricted to this engine.
    async fn last_terminal_run<M>(&self, manager: &M, run: &Run) -> Option<Run>
    where
        M: StateManager + ?Sized,
    {
        let since = (Utc::now() - Duration::days(HISTORY_WINDOW_DAYS))
            .to_rfc3339_opts(SecondsFormat::Secs, true);
        let command = escape_command(run.command.as_deref().unwrap_or(""));

        let mut filters = BTreeMap::new();
        filters.insert("queued_at_since".to_string(), vec![since]);
        filters.insert(
            "status".to_string(),
            vec![RunStatus::Stopped.as_str().to_string()],
        );
        filters.insert("command".to_string(), vec![command]);
        filters.insert("definition_id".to_string(), vec![run.definition_id.clone()]);

        let query = RunQuery {
            limit: 1,
            offset: 0,
            sort_by: "started_at".to_string(),
            order: SortOrder::Desc,
            filters,
            group_by: None,
            engines: vec![KUBERNETES_ENGINE.to_string()],
        };

        match manager.list_runs(&query).await {
            Ok(page) => page.runs.into_iter().next(),
            Err(error) => {
                tracing::debug!(
                    run_id = %run.run_id,
                    error = %error,
                    "historical run lookup failed, keeping defaults"
                );
                None
            }
        }
    }
}

/// Escape a command for use as an exact-match filter value.
fn escape_command(command: &str) -> String {
    command.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ResourceEstimate, RunPage};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted state manager: canned history page and estimate.
    struct ScriptedManager {
        last_run: Option<Run>,
        estimate: Option<ResourceEstimate>,
        queries: Mutex<Vec<RunQuery>>,
    }

    impl ScriptedManager {
        fn empty() -> Self {
            Self {
                last_run: None,
                estimate: None,
                queries: Mutex::new(Vec::new()),
            }
        }

        fn with_last_run(last_run: Run) -> Self {
            Self {
                last_run: Some(last_run),
                ..Self::empty()
            }
        }

        fn with_estimate(estimate: ResourceEstimate) -> Self {
            Self {
                estimate: Some(estimate),
                ..Self::empty()
            }
        }
    }

    #[async_trait]
    impl StateManager for ScriptedManager {
        async fn list_runs(&self, query: &RunQuery) -> anyhow::Result<RunPage> {
            self.queries.lock().unwrap().push(query.clone());
            let runs: Vec<Run> = self.last_run.iter().cloned().collect();
            let total = runs.len();
            Ok(RunPage { runs, total })
        }

        async fn estimate_run_resources(
            &self,
            _definition_id: &str,
            _run_id: &str,
        ) -> anyhow::Result<ResourceEstimate> {
            match self.estimate {
                Some(estimate) => Ok(estimate),
                None => bail!("no estimate available"),
            }
        }
    }

    fn definition(cpu: i64, memory: i64) -> Definition {
        Definition {
            definition_id: "A".to_string(),
            image: "repo/image:1".to_string(),
            cpu: Some(cpu),
            memory: Some(memory),
            ..Definition::default()
        }
    }

    fn ara_definition(cpu: i64, memory: i64) -> Definition {
        Definition {
            adaptive_resource_allocation: Some(true),
            ..definition(cpu, memory)
        }
    }

    fn planner() -> ResourcePlanner {
        ResourcePlanner::new(ResourceBounds::default())
    }

    #[tokio::test]
    async fn plain_run_gets_definition_defaults() {
        let (requirements, run) = planner()
            .plan(&definition(1000, 2048), Run::default(), &ScriptedManager::empty(), false)
            .await;

        assert_eq!(requirements.requests.cpu_millis, Some(1000));
        assert_eq!(requirements.requests.memory_mib, Some(2048));
        assert_eq!(requirements.limits, requirements.requests);
        assert_eq!(requirements.requests.gpu, None);
        assert_eq!(run.cpu, Some(1000));
        assert_eq!(run.memory, Some(2048));
        assert_eq!(run.node_lifecycle, None);
    }

    #[tokio::test]
    async fn run_override_beats_definition_and_zero_falls_through() {
        let run = Run {
            cpu: Some(2000),
            memory: Some(0),
            ..Run::default()
        };
        let (requirements, _) = planner()
            .plan(&definition(1000, 2048), run, &ScriptedManager::empty(), false)
            .await;

        assert_eq!(requirements.requests.cpu_millis, Some(2000));
        assert_eq!(requirements.requests.memory_mib, Some(2048));
    }

    #[tokio::test]
    async fn missing_everything_falls_to_global_minimum() {
        let (requirements, _) = planner()
            .plan(&Definition::default(), Run::default(), &ScriptedManager::empty(), false)
            .await;

        let bounds = ResourceBounds::default();
        assert_eq!(requirements.requests.cpu_millis, Some(bounds.min_cpu_millis));
        assert_eq!(requirements.requests.memory_mib, Some(bounds.min_memory_mib));
    }

    #[tokio::test]
    async fn large_memory_raises_cpu_to_ratio() {
        let (requirements, _) = planner()
            .plan(&definition(500, 40_000), Run::default(), &ScriptedManager::empty(), false)
            .await;

        assert_eq!(requirements.requests.cpu_millis, Some(5000));
        assert_eq!(requirements.limits.cpu_millis, Some(5000));
        assert_eq!(requirements.requests.memory_mib, Some(40_000));
    }

    #[tokio::test]
    async fn large_memory_override_skips_gpu_definitions() {
        let mut gpu_definition = definition(500, 40_000);
        gpu_definition.gpu = Some(1);
        let (requirements, _) = planner()
            .plan(&gpu_definition, Run::default(), &ScriptedManager::empty(), false)
            .await;

        assert_eq!(requirements.requests.cpu_millis, Some(500));
    }

    #[tokio::test]
    async fn oom_history_grows_memory_and_keeps_cpu() {
        let prior = Run {
            exit_reason: Some("OOMKilled".to_string()),
            memory: Some(4000),
            cpu: Some(1500),
            ..Run::default()
        };
        let manager = ScriptedManager::with_last_run(prior);

        let (requirements, run) = planner()
            .plan(&ara_definition(1000, 2048), Run::default(), &manager, true)
            .await;

        assert_eq!(requirements.requests.memory_mib, Some(7000));
        assert_eq!(requirements.requests.cpu_millis, Some(1500));
        // Limits rise to meet the requests.
        assert_eq!(requirements.limits.memory_mib, Some(7000));
        assert_eq!(requirements.limits.cpu_millis, Some(1500));
        assert_eq!(run.memory, Some(7000));
        assert_eq!(run.cpu, Some(1500));
    }

    #[tokio::test]
    async fn oom_growth_rounds_up() {
        let prior = Run {
            exit_reason: Some("OOMKilled".to_string()),
            memory: Some(1001),
            cpu: Some(500),
            ..Run::default()
        };
        let manager = ScriptedManager::with_last_run(prior);

        let (requirements, _) = planner()
            .plan(&ara_definition(1000, 2048), Run::default(), &manager, true)
            .await;

        // 1001 * 1.75 = 1751.75, rounded up.
        assert_eq!(requirements.requests.memory_mib, Some(1752));
    }

    #[tokio::test]
    async fn estimate_is_adopted_without_oom_history() {
        let manager = ScriptedManager::with_estimate(ResourceEstimate {
            cpu: 3000,
            memory: 6000,
        });

        let (requirements, _) = planner()
            .plan(&ara_definition(1000, 2048), Run::default(), &manager, true)
            .await;

        assert_eq!(requirements.requests.cpu_millis, Some(3000));
        assert_eq!(requirements.requests.memory_mib, Some(6000));
    }

    #[tokio::test]
    async fn estimate_errors_keep_defaults() {
        let manager = ScriptedManager::empty();

        let (requirements, _) = planner()
            .plan(&ara_definition(1000, 2048), Run::default(), &manager, true)
            .await;

        assert_eq!(requirements.requests.cpu_millis, Some(1000));
        assert_eq!(requirements.requests.memory_mib, Some(2048));
    }

    #[tokio::test]
    async fn adaptive_path_requires_both_flags() {
        let manager = ScriptedManager::with_estimate(ResourceEstimate {
            cpu: 3000,
            memory: 6000,
        });

        // Engine-level flag off.
        let (requirements, _) = planner()
            .plan(&ara_definition(1000, 2048), Run::default(), &manager, false)
            .await;
        assert_eq!(requirements.requests.cpu_millis, Some(1000));

        // Definition-level flag off.
        let (requirements, _) = planner()
            .plan(&definition(1000, 2048), Run::default(), &manager, true)
            .await;
        assert_eq!(requirements.requests.cpu_millis, Some(1000));
    }

    #[tokio::test]
    async fn grants_are_clamped_into_bounds() {
        let prior = Run {
            exit_reason: Some("OOMKilled".to_string()),
            memory: Some(200_000),
            cpu: Some(100),
            ..Run::default()
        };
        let manager = ScriptedManager::with_last_run(prior);

        let (requirements, _) = planner()
            .plan(&ara_definition(1000, 2048), Run::default(), &manager, true)
            .await;

        let bounds = ResourceBounds::default();
        assert_eq!(requirements.requests.memory_mib, Some(bounds.max_memory_mib));
        assert_eq!(requirements.limits.memory_mib, Some(bounds.max_memory_mib));
        assert_eq!(requirements.requests.cpu_millis, Some(bounds.min_cpu_millis));

        let cpu_request = requirements.requests.cpu_millis.unwrap();
        let cpu_limit = requirements.limits.cpu_millis.unwrap();
        assert!(bounds.min_cpu_millis <= cpu_request && cpu_request <= cpu_limit);
        assert!(cpu_limit <= bounds.max_cpu_millis);
    }

    #[tokio::test]
    async fn gpu_definitions_get_extended_resource_and_ondemand() {
        let mut gpu_definition = definition(1000, 2048);
        gpu_definition.gpu = Some(2);

        let (requirements, run) = planner()
            .plan(&gpu_definition, Run::default(), &ScriptedManager::empty(), false)
            .await;

        assert_eq!(requirements.requests.gpu, Some(2));
        assert_eq!(requirements.limits.gpu, Some(2));
        assert_eq!(run.node_lifecycle, Some(NodeLifecycle::Ondemand));
    }

    #[tokio::test]
    async fn history_query_filters_on_definition_and_escaped_command() {
        let manager = ScriptedManager::empty();
        let run = Run {
            run_id: "run-1".to_string(),
            definition_id: "A".to_string(),
            command: Some("echo 'hi'".to_string()),
            ..Run::default()
        };

        planner().plan(&ara_definition(1000, 2048), run, &manager, true).await;

        let queries = manager.queries.lock().unwrap();
        assert_eq!(queries.len(), 1);
        let query = &queries[0];
        assert_eq!(query.limit, 1);
        assert_eq!(query.sort_by, "started_at");
        assert_eq!(query.order, SortOrder::Desc);
        assert_eq!(query.engines, vec![KUBERNETES_ENGINE.to_string()]);
        assert_eq!(
            query.filters.get("command"),
            Some(&vec!["echo ''hi''".to_string()])
        );
        assert_eq!(
            query.filters.get("status"),
            Some(&vec!["stopped".to_string()])
        );
        assert_eq!(
            query.filters.get("definition_id"),
            Some(&vec!["A".to_string()])
        );
        assert!(query.filters.contains_key("queued_at_since"));
    }
}
