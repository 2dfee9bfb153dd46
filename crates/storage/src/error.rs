/// All errors a `Store` implementation can return.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// No document exists at the requested path.
    #[error("storage path not found: /{}", path.join("/"))]
    NotFound { path: Vec<String> },

    /// A reference contained a segment that cannot address storage
    /// (non-scalar, or a root the store does not serve).
    #[error("invalid storage path segment: {segment}")]
    InvalidPath { segment: String },

    /// A backend-specific error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Discriminates "document absent" from real failures. Absent
    /// documents are ordinary control flow for the evaluator: the read
    /// resolves to undefined.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_discrimination() {
        let nf = StorageError::NotFound {
            path: vec!["a".into(), "b".into()],
        };
        assert!(nf.is_not_found());
        assert!(!StorageError::Backend("boom".into()).is_not_found());
        assert_eq!(nf.to_string(), "storage path not found: /a/b");
    }
}
