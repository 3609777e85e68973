//! Node IP resolution and instance deletion steps.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::{StepContext, StepHandler};
use crate::concurrency::fan_out;
use crate::core::Step;
use crate::errors::{ClusterflowError, ProviderError, ProviderErrorKind};
use crate::polling::{loop_do_with_last_check, Probe};
use crate::provider::{InstanceState, NodeProvider};
use crate::retry::retry_if;
use crate::task::{apply_batch_outcome, keys, AddNodesParams, RemoveNodesParams, TaskState};

/// Resolves the private IP of every surviving instance.
///
/// Describes run concurrently, bounded by `worker_pool_size`. IPs go to
/// the bus (`nodeIPs`) and to the task's node IP list; instances without
/// an IP are handled by the partial-failure policy.
pub struct ResolveNodeIpsHandler {
    nodes: Arc<dyn NodeProvider>,
}

impl ResolveNodeIpsHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeProvider>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl StepHandler for ResolveNodeIpsHandler {
    fn name(&self) -> &str {
        super::steps::RESOLVE_NODE_IPS
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut TaskState,
        _step: &Step,
    ) -> Result<(), ClusterflowError> {
        let policy = ctx.partial_failure(state.task());
        let params = AddNodesParams::new(state.params_mut());
        let mut ids = params.success_instance_ids();
        if ids.is_empty() {
            ids = params.instance_ids();
        }
        if ids.is_empty() {
            return Err(ClusterflowError::Handler(
                "no instances to resolve".to_string(),
            ));
        }

        let nodes = &self.nodes;
        let retry = &ctx.config().retry;
        let outcome = fan_out(ctx.config().worker_pool_size, ids, |id: String| async move {
            retry_if(
                retry,
                "describe_instance",
                || nodes.describe_instance(&id),
                ProviderError::is_transient,
            )
            .await
            .and_then(|info| match (info.state, info.private_ip) {
                (InstanceState::Running, Some(ip)) => Ok(ip),
                (other, _) => Err(ProviderError::new(
                    ProviderErrorKind::Fatal,
                    format!("no private ip (instance is {other})"),
                )),
            })
        })
        .await;

        apply_batch_outcome(
            state,
            &outcome,
            policy,
            keys::NODE_IPS,
            keys::UNRESOLVED_INSTANCE_IDS,
        )?;
        info!(resolved = outcome.succeeded.len(), "node ips resolved");
        state.set_node_ips(outcome.succeeded);
        Ok(())
    }
}

/// Deletes the instances listed in `deleteInstanceIDs` and waits until
/// they are gone.
///
/// Instances the provider no longer knows count as deleted, so re-running
/// the step after a partial deletion is safe.
pub struct DeleteInstancesHandler {
    nodes: Arc<dyn NodeProvider>,
}

impl DeleteInstancesHandler {
    /// Creates the handler.
    #[must_use]
    pub fn new(nodes: Arc<dyn NodeProvider>) -> Self {
        Self { nodes }
    }

    async fn probe_gone(
        &self,
        pool: usize,
        ids: &[String],
        gone: &Mutex<BTreeSet<String>>,
    ) -> Probe<ProviderError> {
        let remaining: Vec<String> = {
            let gone = gone.lock();
            ids.iter().filter(|id| !gone.contains(*id)).cloned().collect()
        };
        if remaining.is_empty() {
            return Probe::Done;
        }

        let nodes = &self.nodes;
        let outcome = fan_out(pool, remaining, |id: String| async move {
            match nodes.describe_instance(&id).await {
                Ok(info) => Ok((id, info.state == InstanceState::Terminated)),
                Err(e) if e.is_not_found() => Ok((id, true)),
                Err(e) => Err(e),
            }
        })
        .await;

        let mut gone = gone.lock();
        for (id, deleted) in outcome.succeeded {
            if deleted {
                gone.insert(id);
            }
        }
        for (id, cause) in &outcome.failed {
            debug!(instance_id = %id, error = %cause, "describe failed while waiting for deletion");
        }

        if gone.len() == ids.len() {
            Probe::Done
        } else {
            Probe::Continue
        }
    }
}

#[async_trait]
impl StepHandler for DeleteInstancesHandler {
    fn name(&self) -> &str {
        super::steps::DELETE_INSTANCES
    }

    async fn execute(
        &self,
        ctx: &StepContext,
        state: &mut TaskState,
        _step: &Step,
    ) -> Result<(), ClusterflowError> {
        let ids = RemoveNodesParams::new(state.params_mut()).delete_instance_ids();
        if ids.is_empty() {
            info!("no instances to delete");
            return Ok(());
        }

        let nodes = &self.nodes;
        let retry = &ctx.config().retry;
        let pool = ctx.config().worker_pool_size;
        let requested = fan_out(pool, ids.clone(), |id: String| async move {
            let result = retry_if(
                retry,
                "delete_instances",
                || nodes.delete_instances(std::slice::from_ref(&id)),
                ProviderError::is_transient,
            )
            .await;
            match result {
                Err(e) if e.is_not_found() => {
                    debug!(instance_id = %id, "instance already gone");
                    Ok(())
                }
                other => other,
            }
        })
        .await;
        if !requested.failed.is_empty() {
            return Err(ClusterflowError::Handler(format!(
                "delete request failed: {}",
                requested.failure_message()
            )));
        }

        let gone = Mutex::new(BTreeSet::new());
        let poll = ctx.poll_context("instances-gone");
        loop_do_with_last_check(&poll, ctx.config().poll.interval(), || {
            self.probe_gone(pool, &ids, &gone)
        })
        .await?;

        info!(deleted = ids.len(), "instances deleted");
        Ok(())
    }
}
