//! Error context helpers
//!
//! Traits for attaching the failing operation to lower-level errors so that
//! storage and codec failures surface with a readable description.

use crate::error::{VirtanceError, VirtanceResult};

/// Wrap storage-layer errors with the operation that was running
pub trait StorageContext<T> {
    fn storage_context(self, operation: &str) -> VirtanceResult<T>;
}

impl<T, E> StorageContext<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn storage_context(self, operation: &str) -> VirtanceResult<T> {
        self.map_err(|e| VirtanceError::Storage {
            operation: operation.to_string(),
            source: Box::new(e),
        })
    }
}

/// Wrap JSON codec errors with the operation that was running
pub trait JsonContext<T> {
    fn json_context(self, operation: &str) -> VirtanceResult<T>;
}

impl<T> JsonContext<T> for Result<T, serde_json::Error> {
    fn json_context(self, operation: &str) -> VirtanceResult<T> {
        self.map_err(|e| VirtanceError::Serialization {
            operation: operation.to_string(),
            source: Box::new(e),
        })
    }
}

/// Extension trait for Options to convert to errors with context
pub trait OptionContext<T> {
    /// Convert None to an internal error
    fn context(self, msg: &str) -> VirtanceResult<T>;

    /// Convert None to a NotFound error
    fn not_found(self, resource: impl Into<String>) -> VirtanceResult<T>;
}

impl<T> OptionContext<T> for Option<T> {
    fn context(self, msg: &str) -> VirtanceResult<T> {
        self.ok_or_else(|| VirtanceError::Internal {
            message: msg.to_string(),
        })
    }

    fn not_found(self, resource: impl Into<String>) -> VirtanceResult<T> {
        self.ok_or_else(|| VirtanceError::NotFound {
            resource: resource.into(),
        })
    }
}

/// Log an error result without changing it
pub trait ResultContext<T> {
    fn log_error(self, context: &str) -> VirtanceResult<T>;
}

impl<T> ResultContext<T> for VirtanceResult<T> {
    fn log_error(self, context: &str) -> VirtanceResult<T> {
        if let Err(ref e) = self {
            tracing::error!("{}: {}", context, e);
        }
        self
    }
}
