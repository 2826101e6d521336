//! The deployment state machine.
//!
//! Every public method is serialised per stack through a mutex, so persisted
//! events stay consistent with in-memory resource states from any single
//! observer's point of view.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Mutex;
use weft_core::Value;

use crate::backend::Backend;
use crate::error::EngineError;
use crate::state::{
    now_millis, AuditAction, AuditEntry, DeploymentState, DeploymentStatus, NodeRecord,
    ResourceState,
};

/// Deployment lifecycle manager over a backend.
pub struct StateMachine {
    backend: Rc<dyn Backend>,
    user: Option<String>,
    locks: RefCell<HashMap<String, Rc<Mutex<()>>>>,
    resource_states: RefCell<HashMap<String, ResourceState>>,
}

impl StateMachine {
    /// Wrap a backend.
    pub fn new(backend: Rc<dyn Backend>, user: Option<String>) -> Rc<Self> {
        Rc::new(Self {
            backend,
            user,
            locks: RefCell::new(HashMap::new()),
            resource_states: RefCell::new(HashMap::new()),
        })
    }

    /// The backend this machine persists through.
    pub fn backend(&self) -> Rc<dyn Backend> {
        Rc::clone(&self.backend)
    }

    fn stack_mutex(&self, stack: &str) -> Rc<Mutex<()>> {
        Rc::clone(
            self.locks
                .borrow_mut()
                .entry(stack.to_string())
                .or_default(),
        )
    }

    /// In-memory state of one resource.
    pub fn resource_state(&self, id: &str) -> Option<ResourceState> {
        self.resource_states.borrow().get(id).copied()
    }

    /// Set the in-memory state of one resource.
    pub fn set_resource_state(&self, id: &str, state: ResourceState) {
        self.resource_states.borrow_mut().insert(id.to_string(), state);
    }

    /// Rebuild in-memory resource states from loaded nodes: a node with
    /// outputs starts deployed, anything else pending.
    pub fn rehydrate(&self, nodes: &[NodeRecord]) {
        let mut states = self.resource_states.borrow_mut();
        states.clear();
        for node in nodes {
            let state = if node.outputs.is_empty() {
                ResourceState::Pending
            } else {
                ResourceState::Deployed
            };
            states.insert(node.id.clone(), node.state.unwrap_or(state));
        }
    }

    async fn append_audit(&self, stack: &str, action: AuditAction, node_id: Option<&str>, details: Option<String>) {
        let entry = AuditEntry {
            timestamp: now_millis(),
            action,
            node_id: node_id.map(String::from),
            user: self.user.clone(),
            details,
        };
        if let Err(err) = self.backend.append_audit(stack, &entry).await {
            tracing::warn!(stack, error = %err, "failed to append audit entry");
        }
    }

    async fn load(&self, stack: &str) -> Result<Option<DeploymentState>, EngineError> {
        Ok(self.backend.get_state(stack).await?)
    }

    async fn save(&self, state: &DeploymentState) -> Result<(), EngineError> {
        self.backend.save_state(&state.stack_name, state).await?;
        Ok(())
    }

    fn blank(&self, stack: &str, status: DeploymentStatus) -> DeploymentState {
        DeploymentState {
            stack_name: stack.to_string(),
            nodes: Vec::new(),
            status,
            applying_node_ids: Vec::new(),
            last_deployed_at: now_millis(),
            user: self.user.clone(),
        }
    }

    /// Persist the start of a deployment.
    pub async fn start_deployment(
        &self,
        stack: &str,
        nodes: Vec<NodeRecord>,
    ) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        let mut state = self
            .load(stack)
            .await?
            .unwrap_or_else(|| self.blank(stack, DeploymentStatus::Applying));
        let details = format!("{} nodes", nodes.len());
        state.status = DeploymentStatus::Applying;
        state.nodes = nodes;
        state.last_deployed_at = now_millis();
        state.user = self.user.clone();
        self.save(&state).await?;
        tracing::info!(stack, "deployment started");
        self.append_audit(stack, AuditAction::DeployStart, None, Some(details)).await;
        Ok(())
    }

    /// Update one node's persisted outputs.
    pub async fn update_node_outputs(
        &self,
        stack: &str,
        id: &str,
        outputs: IndexMap<String, Value>,
    ) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        let Some(mut state) = self.load(stack).await? else {
            return Ok(());
        };
        if let Some(node) = state.nodes.iter_mut().find(|node| node.id == id) {
            node.outputs = outputs;
        }
        self.save(&state).await
    }

    /// Record that a handler is in flight, for crash recovery.
    pub async fn add_applying(&self, stack: &str, id: &str) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        let Some(mut state) = self.load(stack).await? else {
            return Ok(());
        };
        if !state.applying_node_ids.iter().any(|existing| existing == id) {
            state.applying_node_ids.push(id.to_string());
            self.save(&state).await?;
        }
        Ok(())
    }

    /// Record that a handler settled.
    pub async fn remove_applying(&self, stack: &str, id: &str) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        let Some(mut state) = self.load(stack).await? else {
            return Ok(());
        };
        let before = state.applying_node_ids.len();
        state.applying_node_ids.retain(|existing| existing != id);
        if state.applying_node_ids.len() != before {
            self.save(&state).await?;
        }
        Ok(())
    }

    /// Mark a resource applied in memory and append the audit event.
    pub async fn record_resource_applied(
        &self,
        stack: &str,
        id: &str,
        outputs: &IndexMap<String, Value>,
    ) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        self.set_resource_state(id, ResourceState::Deployed);
        let details = (!outputs.is_empty()).then(|| format!("{} outputs", outputs.len()));
        self.append_audit(stack, AuditAction::ResourceApplied, Some(id), details).await;
        Ok(())
    }

    /// Forget a destroyed resource and append the audit event.
    pub async fn record_resource_destroyed(&self, stack: &str, id: &str) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        self.resource_states.borrow_mut().remove(id);
        self.append_audit(stack, AuditAction::ResourceDestroyed, Some(id), None).await;
        Ok(())
    }

    /// Persist a completed deployment.
    pub async fn complete_deployment(
        &self,
        stack: &str,
        nodes: Vec<NodeRecord>,
    ) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        let mut state = self
            .load(stack)
            .await?
            .unwrap_or_else(|| self.blank(stack, DeploymentStatus::Deployed));
        state.status = DeploymentStatus::Deployed;
        state.nodes = nodes;
        state.applying_node_ids.clear();
        state.last_deployed_at = now_millis();
        self.save(&state).await?;
        tracing::info!(stack, "deployment complete");
        self.append_audit(stack, AuditAction::DeployComplete, None, None).await;
        Ok(())
    }

    /// Persist a failed deployment.
    pub async fn fail_deployment(&self, stack: &str, error: &EngineError) -> Result<(), EngineError> {
        let mutex = self.stack_mutex(stack);
        let _guard = mutex.lock().await;
        let mut state = self
            .load(stack)
            .await?
            .unwrap_or_else(|| self.blank(stack, DeploymentStatus::Failed));
        state.status = DeploymentStatus::Failed;
        state.last_deployed_at = now_millis();
        self.save(&state).await?;
        tracing::error!(stack, error = %error, "deployment failed");
        self.append_audit(stack, AuditAction::DeployFailed, None, Some(error.to_string())).await;
        Ok(())
    }

    /// `true` iff the persisted status says a deployment was interrupted.
    pub async fn can_resume(&self, stack: &str) -> Result<bool, EngineError> {
        Ok(self
            .load(stack)
            .await?
            .map(|state| state.status == DeploymentStatus::Applying)
            .unwrap_or(false))
    }

    /// Advisory lock passthrough.
    pub async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, EngineError> {
        Ok(self.backend.acquire_lock(stack, holder, ttl).await?)
    }

    /// Advisory unlock passthrough.
    pub async fn release_lock(&self, stack: &str) -> Result<(), EngineError> {
        Ok(self.backend.release_lock(stack).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use weft_core::props;

    fn record(id: &str) -> NodeRecord {
        NodeRecord {
            id: id.to_string(),
            path: vec![id.to_string()],
            props: props! {},
            outputs: IndexMap::new(),
            state: None,
        }
    }

    fn machine() -> (Rc<MemoryBackend>, Rc<StateMachine>) {
        let backend = Rc::new(MemoryBackend::new());
        let machine = StateMachine::new(backend.clone(), Some("ops".into()));
        (backend, machine)
    }

    #[tokio::test]
    async fn start_then_complete() {
        let (backend, machine) = machine();
        machine.start_deployment("s", vec![record("a")]).await.unwrap();
        assert_eq!(backend.peek("s").unwrap().status, DeploymentStatus::Applying);
        assert!(machine.can_resume("s").await.unwrap());

        machine.complete_deployment("s", vec![record("a")]).await.unwrap();
        let state = backend.peek("s").unwrap();
        assert_eq!(state.status, DeploymentStatus::Deployed);
        assert!(!machine.can_resume("s").await.unwrap());

        let audit = backend.audit_log("s", None).await.unwrap();
        let actions: Vec<_> = audit.iter().map(|entry| entry.action).collect();
        assert_eq!(actions, [AuditAction::DeployStart, AuditAction::DeployComplete]);
        assert_eq!(audit[0].user.as_deref(), Some("ops"));
    }

    #[tokio::test]
    async fn applying_ids_track_in_flight_handlers() {
        let (backend, machine) = machine();
        machine.start_deployment("s", vec![record("a"), record("b")]).await.unwrap();
        machine.add_applying("s", "a").await.unwrap();
        machine.add_applying("s", "b").await.unwrap();
        machine.add_applying("s", "a").await.unwrap();
        assert_eq!(backend.peek("s").unwrap().applying_node_ids, ["a", "b"]);

        machine.remove_applying("s", "a").await.unwrap();
        assert_eq!(backend.peek("s").unwrap().applying_node_ids, ["b"]);
    }

    #[tokio::test]
    async fn update_node_outputs_persists() {
        let (backend, machine) = machine();
        machine.start_deployment("s", vec![record("a")]).await.unwrap();
        let outputs: IndexMap<String, Value> =
            [("url".to_string(), Value::str("https://x"))].into_iter().collect();
        machine.update_node_outputs("s", "a", outputs.clone()).await.unwrap();
        assert_eq!(backend.peek("s").unwrap().nodes[0].outputs, outputs);
    }

    #[tokio::test]
    async fn rehydrate_marks_nodes_with_outputs_deployed() {
        let (_backend, machine) = machine();
        let mut with_outputs = record("a");
        with_outputs.outputs.insert("k".into(), Value::Int(1));
        machine.rehydrate(&[with_outputs, record("b")]);
        assert_eq!(machine.resource_state("a"), Some(ResourceState::Deployed));
        assert_eq!(machine.resource_state("b"), Some(ResourceState::Pending));
    }

    #[tokio::test]
    async fn fail_deployment_persists_status_and_audit() {
        let (backend, machine) = machine();
        machine.start_deployment("s", vec![record("a")]).await.unwrap();
        let err = EngineError::Handler {
            id: "a".into(),
            message: "boom".into(),
        };
        machine.fail_deployment("s", &err).await.unwrap();
        assert_eq!(backend.peek("s").unwrap().status, DeploymentStatus::Failed);
        let audit = backend.audit_log("s", None).await.unwrap();
        assert_eq!(audit.last().unwrap().action, AuditAction::DeployFailed);
        assert!(audit.last().unwrap().details.as_deref().unwrap().contains("boom"));
    }
}
