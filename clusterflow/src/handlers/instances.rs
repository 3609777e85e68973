//! Instance launch and readiness steps.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{required_param, step_params, StepContext, StepHandler};
use crate::concurrency::fan_out;
use crate::core::Step;
use crate::errors::{ClusterflowError, ProviderError};
use crate::polling::{loop_do_with_last_check, Probe};
use crate::provider::{InstanceRequest, InstanceState, NodeProvider};
use crate::retry::retry_if;
use crate::task::{
    apply_batch_outcome, keys, AddNodesParams, BatchOutcome, PartialFailurePolicy, TaskState,
};

/// Launches the requested number of instances.
///
/// Writes the new ids to `instanceIDs`. When that key is already set the
/// instances exist from an earlier run and nothing is launched. The launch
/// call carries a client token derived from task and step, so a provider
/// that honors it will not double-launch either.
pub struct ApplyInstancesHandler {
    nodes: Arc<dyn NodeProvider>,
}

impl ApplyInstancesHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeProvider>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl StepHandler for ApplyInstancesHandler {
    fn name(&self) -> &str {
        super::steps::APPLY_INSTANCES
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut TaskState,
        step: &Step,
    ) -> Result<(), ClusterflowError> {
        let existing = AddNodesParams::new(state.params_mut()).instance_ids();
        if !existing.is_empty() {
            info!(count = existing.len(), "instances already created, skipping");
            return Ok(());
        }

        let raw = required_param(step, step_params::INSTANCE_COUNT)?;
        let count: usize = raw
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| ClusterflowError::Handler(format!("invalid instance count '{raw}'")))?;

        let task = state.task();
        let request = InstanceRequest {
            cluster_id: task.cluster_id.clone(),
            node_group_id: task.node_group_id.clone(),
            count,
            instance_type: step
                .param(step_params::INSTANCE_TYPE)
                .unwrap_or_default()
                .to_string(),
            subnet_id: state.params().get(keys::SUBNET_ID).unwrap_or_default().to_string(),
            client_token: format!("{}-{}", ctx.task_id(), ctx.step()),
        };

        let ids = retry_if(
            &ctx.config().retry,
            "create_instances",
            || self.nodes.create_instances(&request),
            ProviderError::is_transient,
        )
        .await?;
        info!(requested = count, created = ids.len(), "instances created");

        AddNodesParams::new(state.params_mut()).set_instance_ids(&ids);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Observed {
    states: BTreeMap<String, InstanceState>,
    errors: BTreeMap<String, String>,
}

impl Observed {
    fn is_settled(&self, id: &str) -> bool {
        self.states.get(id).is_some_and(InstanceState::is_settled)
    }
}

/// Waits until the launched instances run.
///
/// Instances still not running when the poll deadline passes, after one
/// last check, count as failed. The split is applied with the configured
/// [`PartialFailurePolicy`]: survivors go to `successInstanceIDs`, and
/// under `RetryFailedSubset` a re-run only waits on `failedInstanceIDs`.
pub struct WaitInstancesHandler {
    nodes: Arc<dyn NodeProvider>,
}

impl WaitInstancesHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeProvider>) -> Self {
        Self { nodes }
    }

    async fn probe(
        &self,
        pool: usize,
        targets: &[String],
        observed: &Mutex<Observed>,
    ) -> Probe<ProviderError> {
        let unsettled: Vec<String> = {
            let seen = observed.lock();
            targets
                .iter()
                .filter(|id| !seen.is_settled(id))
                .cloned()
                .collect()
        };
        if unsettled.is_empty() {
            return Probe::Done;
        }

        let nodes = &self.nodes;
        let outcome = fan_out(pool, unsettled, |id: String| async move {
            nodes.describe_instance(&id).await
        })
        .await;

        let mut seen = observed.lock();
        for info in outcome.succeeded {
            seen.errors.remove(&info.id);
            seen.states.insert(info.id, info.state);
        }
        for (id, cause) in outcome.failed {
            seen.errors.insert(id, cause);
        }

        let remaining = targets.iter().filter(|id| !seen.is_settled(id)).count();
        debug!(total = targets.len(), remaining, "waiting for instances");
        if remaining == 0 {
            Probe::Done
        } else {
            Probe::Continue
        }
    }
}

#[async_trait]
impl StepHandler for WaitInstancesHandler {
    fn name(&self) -> &str {
        super::steps::WAIT_INSTANCES
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut TaskState,
        _step: &Step,
    ) -> Result<(), ClusterflowError> {
        let policy = ctx.partial_failure(state.task());
        let params = AddNodesParams::new(state.params_mut());
        let retry_subset = policy == PartialFailurePolicy::RetryFailedSubset
            && !params.failed_instance_ids().is_empty();
        let (targets, previous) = if retry_subset {
            (params.failed_instance_ids(), params.success_instance_ids())
        } else {
            (params.instance_ids(), Vec::new())
        };
        if targets.is_empty() {
            return Err(ClusterflowError::Handler(
                "no instances to wait for".to_string(),
            ));
        }

        let observed = Mutex::new(Observed::default());
        let poll = ctx.poll_context("instances-running");
        let pool = ctx.config().worker_pool_size;
        let result = loop_do_with_last_check(&poll, ctx.config().poll.interval(), || {
            self.probe(pool, &targets, &observed)
        })
        .await;

        match result {
            Ok(()) => {}
            Err(e) if e.is_deadline_exceeded() => {
                warn!(error = %e, "instances did not all settle in time");
            }
            Err(e) => return Err(e.into()),
        }

        let observed = observed.into_inner();
        let mut outcome: BatchOutcome<String> = BatchOutcome::new();
        for id in previous {
            outcome.push_success(id);
        }
        for id in targets {
            match observed.states.get(&id) {
                Some(InstanceState::Running) => outcome.push_success(id),
                Some(other) => {
                    let cause = format!("instance is {other}");
                    outcome.push_failure(id, cause);
                }
                None => {
                    let cause = observed
                        .errors
                        .get(&id)
                        .cloned()
                        .unwrap_or_else(|| "no state observed".to_string());
                    outcome.push_failure(id, cause);
                }
            }
        }

        apply_batch_outcome(
            state,
            &outcome,
            policy,
            keys::SUCCESS_INSTANCE_IDS,
            keys::FAILED_INSTANCE_IDS,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::config::EngineConfig;
    use crate::core::Task;
    use crate::polling::PollConfig;
    use crate::retry::RetryPolicy;
    use crate::task::InMemoryTaskStore;
    use crate::testing::FakeNodeProvider;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn ctx(config: EngineConfig) -> StepContext {
        StepContext::new(
            "t-1",
            "step",
            Arc::new(config),
            Arc::new(CancellationToken::new()),
        )
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_poll(PollConfig::new(Duration::from_secs(5), Duration::from_secs(60)))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(100)))
    }

    fn state() -> TaskState {
        let task = Task::new("t-1", "add-nodes")
            .with_cluster("c-1")
            .with_node_group("ng-1");
        TaskState::new(task, Arc::new(InMemoryTaskStore::new()))
    }

    fn apply_step(count: &str) -> Step {
        Step::new("applyInstances", "cvm").with_param("count", count)
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_creates_and_records_ids() {
        let nodes = Arc::new(FakeNodeProvider::new().with_transient_create_failures(1));
        let handler = ApplyInstancesHandler::new(nodes.clone());
        let mut state = state();

        handler
            .execute(&ctx(config()), &mut state, &apply_step("3"))
            .await
            .unwrap();

        assert_eq!(
            state.params().get_list(keys::INSTANCE_IDS),
            vec!["ins-0000", "ins-0001", "ins-0002"]
        );
        assert_eq!(nodes.create_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_checks_bus_before_creating() {
        let nodes = Arc::new(FakeNodeProvider::new());
        let handler = ApplyInstancesHandler::new(nodes.clone());
        let mut state = state();
        state.params_mut().set_list(keys::INSTANCE_IDS, &["ins-9"]);

        handler
            .execute(&ctx(config()), &mut state, &apply_step("3"))
            .await
            .unwrap();

        assert_eq!(nodes.create_calls(), 0);
        assert_eq!(state.params().get_list(keys::INSTANCE_IDS), vec!["ins-9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_rejects_bad_count() {
        let handler = ApplyInstancesHandler::new(Arc::new(FakeNodeProvider::new()));
        let mut state = state();
        for count in ["0", "many"] {
            let err = handler
                .execute(&ctx(config()), &mut state, &apply_step(count))
                .await
                .unwrap_err();
            assert!(matches!(err, ClusterflowError::Handler(_)));
        }
    }

    async fn launched(nodes: &FakeNodeProvider, state: &mut TaskState, count: usize) {
        let request = InstanceRequest {
            cluster_id: "c-1".to_string(),
            node_group_id: "ng-1".to_string(),
            count,
            instance_type: String::new(),
            subnet_id: String::new(),
            client_token: String::new(),
        };
        let ids = nodes.create_instances(&request).await.unwrap();
        state.params_mut().set_list(keys::INSTANCE_IDS, &ids);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_all_running() {
        let nodes = Arc::new(FakeNodeProvider::new().with_pending_polls(2));
        let mut state = state();
        launched(&nodes, &mut state, 4).await;

        WaitInstancesHandler::new(nodes.clone())
            .execute(&ctx(config()), &mut state, &Step::new("waitInstances", "cvm"))
            .await
            .unwrap();

        assert_eq!(state.params().get_list(keys::SUCCESS_INSTANCE_IDS).len(), 4);
        assert!(!state.task().part_failure);
        // three rounds of four describes
        assert_eq!(nodes.describe_calls(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_records_partial_failure() {
        let nodes = Arc::new(FakeNodeProvider::new().with_failing_indices(&[3, 7]));
        let mut state = state();
        launched(&nodes, &mut state, 10).await;

        WaitInstancesHandler::new(nodes)
            .execute(&ctx(config()), &mut state, &Step::new("waitInstances", "cvm"))
            .await
            .unwrap();

        let survivors = state.params().get_list(keys::SUCCESS_INSTANCE_IDS);
        assert_eq!(survivors.len(), 8);
        assert!(!survivors.contains(&"ins-0003".to_string()));
        assert!(!survivors.contains(&"ins-0007".to_string()));
        assert!(state.task().part_failure);
        assert!(state.task().message.contains("ins-0003"));
        assert!(state.task().message.contains("ins-0007"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_counts_pending_as_failed() {
        // pending far longer than the 60s deadline
        let nodes = Arc::new(FakeNodeProvider::new().with_pending_polls(1000));
        let mut state = state();
        launched(&nodes, &mut state, 2).await;

        let err = WaitInstancesHandler::new(nodes)
            .execute(&ctx(config()), &mut state, &Step::new("waitInstances", "cvm"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("all items failed"));
        assert!(err.to_string().contains("pending"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_fail_step_policy() {
        let nodes = Arc::new(FakeNodeProvider::new().with_failing_indices(&[0]));
        let mut state = state();
        launched(&nodes, &mut state, 3).await;

        let config = config().with_partial_failure(PartialFailurePolicy::FailStep);
        let err = WaitInstancesHandler::new(nodes)
            .execute(&ctx(config), &mut state, &Step::new("waitInstances", "cvm"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1/3 items failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_retry_only_failed_subset() {
        let nodes = Arc::new(FakeNodeProvider::new());
        let mut state = state();
        launched(&nodes, &mut state, 3).await;
        state
            .params_mut()
            .set_list(keys::SUCCESS_INSTANCE_IDS, &["ins-0000", "ins-0001"]);
        state.params_mut().set_list(keys::FAILED_INSTANCE_IDS, &["ins-0002"]);

        let config = config().with_partial_failure(PartialFailurePolicy::RetryFailedSubset);
        WaitInstancesHandler::new(nodes.clone())
            .execute(&ctx(config), &mut state, &Step::new("waitInstances", "cvm"))
            .await
            .unwrap();

        assert_eq!(nodes.describe_calls(), 1);
        assert_eq!(
            state.params().get_list(keys::SUCCESS_INSTANCE_IDS),
            vec!["ins-0000", "ins-0001", "ins-0002"]
        );
        assert!(!state.params().contains(keys::FAILED_INSTANCE_IDS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_without_instances() {
        let err = WaitInstancesHandler::new(Arc::new(FakeNodeProvider::new()))
            .execute(&ctx(config()), &mut state(), &Step::new("waitInstances", "cvm"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterflowError::Handler(_)));
    }
}
