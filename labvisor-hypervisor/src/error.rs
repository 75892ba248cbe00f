//! Error types for the hypervisor orchestration core.

use thiserror::Error;

use crate::types::{VmOperation, VmState};

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// No backend owns the VM id.
    #[error("VM not found: {0}")]
    VmNotFound(String),

    /// The requested operation is illegal from the VM's current state.
    #[error("Cannot {operation} VM {vm_id} while it is {state}")]
    InvalidTransition {
        vm_id: String,
        state: VmState,
        operation: VmOperation,
    },

    /// More than one backend claims the same VM id.
    #[error("VM {vm_id} is claimed by multiple backends: {}", backends.join(", "))]
    AmbiguousOwnership {
        vm_id: String,
        backends: Vec<String>,
    },

    /// VLAN demand exceeds free supply.
    #[error("VLAN pool exhausted: requested {requested}, available {available}")]
    PoolExhausted { requested: usize, available: usize },

    /// Disk, network or VM creation failed on a backend.
    #[error("Provisioning failed for {target}: {reason}")]
    Provisioning { target: String, reason: String },

    /// The operation is not part of this implementation's contract.
    #[error("Operation not supported by {backend}: {operation}")]
    Unsupported { backend: String, operation: String },

    /// The caller cancelled the operation before this step ran.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Disk store failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HypervisorError {
    /// Shorthand for a provisioning failure.
    pub fn provisioning(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Provisioning {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an unsupported operation.
    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// True for the not-found variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::VmNotFound(_))
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
