//! Change dispatcher: upstream event intake with per-tenant serialization.
//!
//! Tenants (organizations) own disjoint graph keyspaces, so batches for
//! different tenants run on parallel rayon workers with no shared mutable
//! state. Within one tenant, derived state (origins, inherited profiles) is
//! read-modify-write and not safe under concurrent fixpoint iteration, so a
//! per-tenant mutex serializes batches in commit order.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rayon::prelude::*;

use crate::engine::{BatchOutcome, Engine, Event};
use crate::error::ArgusResult;
use crate::store::Timestamp;

/// Tenant identifier: one per organization, one per graph keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        TenantId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One committed batch of upstream events for one tenant.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub tenant: TenantId,
    pub events: Vec<Event>,
    pub valid_time: Timestamp,
}

/// A tenant's engine plus the mutex that serializes its batches.
struct TenantWorker {
    engine: Engine,
    gate: Mutex<()>,
}

/// Factory producing a fresh engine (and therefore a fresh keyspace) per
/// tenant.
pub type EngineFactory = dyn Fn(&TenantId) -> ArgusResult<Engine> + Send + Sync;

/// Routes event batches to tenant engines.
pub struct ChangeDispatcher {
    tenants: DashMap<TenantId, Arc<TenantWorker>>,
    factory: Box<EngineFactory>,
}

impl ChangeDispatcher {
    /// Create a dispatcher with a custom engine factory.
    pub fn new(factory: Box<EngineFactory>) -> Self {
        Self {
            tenants: DashMap::new(),
            factory,
        }
    }

    /// Dispatcher whose tenants each get an in-memory engine with the
    /// built-in schema and rules.
    pub fn in_memory() -> Self {
        Self::new(Box::new(|_| Engine::new(Default::default())))
    }

    fn worker(&self, tenant: &TenantId) -> ArgusResult<Arc<TenantWorker>> {
        if let Some(worker) = self.tenants.get(tenant) {
            return Ok(Arc::clone(worker.value()));
        }
        let engine = (self.factory)(tenant)?;
        let worker = Arc::new(TenantWorker {
            engine,
            gate: Mutex::new(()),
        });
        // Two threads may race to create the same tenant; the entry API
        // keeps exactly one.
        let entry = self
            .tenants
            .entry(tenant.clone())
            .or_insert_with(|| worker);
        Ok(Arc::clone(entry.value()))
    }

    /// Number of known tenants.
    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    /// Run a read-only operation against a tenant's engine.
    pub fn with_engine<T>(
        &self,
        tenant: &TenantId,
        op: impl FnOnce(&Engine) -> T,
    ) -> ArgusResult<T> {
        let worker = self.worker(tenant)?;
        Ok(op(&worker.engine))
    }

    /// Process one batch, serialized against other batches of the same
    /// tenant.
    pub fn dispatch(&self, batch: EventBatch) -> ArgusResult<BatchOutcome> {
        let worker = self.worker(&batch.tenant)?;
        let _serialized = worker.gate.lock().expect("tenant gate poisoned");
        tracing::debug!(tenant = %batch.tenant, events = batch.events.len(), "dispatching batch");
        worker.engine.process(batch.events, batch.valid_time)
    }

    /// Process many batches: tenants in parallel, batches of one tenant in
    /// the order given.
    pub fn dispatch_all(
        &self,
        batches: Vec<EventBatch>,
    ) -> Vec<(TenantId, Vec<ArgusResult<BatchOutcome>>)> {
        // Group by tenant, preserving per-tenant commit order.
        let mut groups: Vec<(TenantId, Vec<EventBatch>)> = Vec::new();
        for batch in batches {
            match groups.iter_mut().find(|(tenant, _)| *tenant == batch.tenant) {
                Some((_, group)) => group.push(batch),
                None => groups.push((batch.tenant.clone(), vec![batch])),
            }
        }

        groups
            .into_par_iter()
            .map(|(tenant, group)| {
                let outcomes = group
                    .into_iter()
                    .map(|batch| self.dispatch(batch))
                    .collect();
                (tenant, outcomes)
            })
            .collect()
    }
}

impl std::fmt::Debug for ChangeDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDispatcher")
            .field("tenants", &self.tenants.len())
            .finish()
    }
}
