//! Per-orchestrator plan registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{PivotError, Result};
use crate::model::Plan;
use crate::scheduler::{ExecutionControl, SharedPlan};

/// A stored plan together with the signals that steer its execution.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub plan: SharedPlan,
    pub control: ExecutionControl,
}

/// Plans owned by one orchestrator. Independent stores never share state.
#[derive(Debug, Default)]
pub struct PlanStore {
    plans: RwLock<HashMap<Uuid, PlanEntry>>,
}

impl PlanStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, plan: Plan) -> PlanEntry {
        let entry = PlanEntry {
            plan: Arc::new(Mutex::new(plan)),
            control: ExecutionControl::new(),
        };
        let id = entry.plan.lock().await.id;
        self.plans.write().await.insert(id, entry.clone());
        entry
    }

    pub async fn get(&self, id: Uuid) -> Result<PlanEntry> {
        self.plans
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| PivotError::plan_not_found(id))
    }

    pub async fn remove(&self, id: Uuid) -> Option<PlanEntry> {
        self.plans.write().await.remove(&id)
    }

    /// Ids of all stored plans, sorted.
    pub async fn ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.plans.read().await.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.plans.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.plans.read().await.is_empty()
    }
}
