use std::fmt;
use thiserror::Error;

use pkg_cloud::GatewayError;

/// Why an entity could not be reconciled.
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    /// A gateway call failed. Aborts the affected entity only.
    #[error("{operation} failed for {resource}: {source}")]
    RemoteApi {
        operation: &'static str,
        resource: String,
        source: GatewayError,
    },

    /// A rule names a service without a target group. Recoverable: the rule
    /// forwards to the first target group instead.
    #[error("no target group for service {service} in {ingress_id}, using the first target group")]
    LookupMiss { ingress_id: String, service: String },

    /// A contract of the resource tree was broken. Fatal for the entity.
    #[error("invariant violated for {resource}: {reason}")]
    InvariantViolation { resource: String, reason: String },

    /// The Ingress cannot be turned into a load balancer tree.
    #[error("ingress {ingress_id} skipped: {reason}")]
    InvalidIngress { ingress_id: String, reason: String },
}

impl ReconcileError {
    pub fn remote(
        operation: &'static str,
        resource: impl Into<String>,
        source: GatewayError,
    ) -> Self {
        ReconcileError::RemoteApi {
            operation,
            resource: resource.into(),
            source,
        }
    }

    pub fn invariant(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        ReconcileError::InvariantViolation {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Whether the next cycle has a fair chance of succeeding without any change.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReconcileError::RemoteApi { source, .. } if source.is_transient())
    }
}

/// An entity that failed to reconcile during a cycle.
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub entity: String,
    pub error: ReconcileError,
}

/// Outcome of one sync cycle.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Recoverable problems: lookup misses, skipped Ingresses.
    pub warnings: Vec<ReconcileError>,
    pub failures: Vec<EntityFailure>,
    /// Ingress ids whose tree reconciled without a top-level error.
    pub reconciled: Vec<String>,
    /// Ingress ids whose tree was swept this cycle.
    pub torn_down: Vec<String>,
}

impl CycleReport {
    pub fn warn(&mut self, warning: ReconcileError) {
        self.warnings.push(warning);
    }

    pub fn fail(&mut self, entity: impl Into<String>, error: ReconcileError) {
        self.failures.push(EntityFailure {
            entity: entity.into(),
            error,
        });
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn lookup_misses(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| matches!(w, ReconcileError::LookupMiss { .. }))
            .count()
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} reconciled, {} torn down, {} failures, {} warnings",
            self.reconciled.len(),
            self.torn_down.len(),
            self.failures.len(),
            self.warnings.len()
        )
    }
}
