use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Type alias for Arc<RwLock<T>>, a common pattern for shared mutable state
pub type RwArc<T> = Arc<RwLock<T>>;

/// Domain-separated SHA256 hash for cryptographic namespacing
///
/// Computes: H(domain || H(arg1 || arg2 || ...))
///
/// Usage:
/// ```ignore
/// let hash = sha256_namespaced!(
///     b"mcp402.work-proof",
///     task_id.as_bytes(),
///     tool_name.as_bytes(),
/// );
/// ```
#[macro_export]
macro_rules! sha256_namespaced {
    ($domain:expr, $($data:expr),+ $(,)?) => {{
        use sha2::Digest;
        let mut inner = sha2::Sha256::new();
        $(
            inner.update($data);
        )+
        let inner_hash = inner.finalize();

        let mut outer = sha2::Sha256::new();
        outer.update($domain);
        outer.update(&inner_hash);
        outer.finalize()
    }};
}

/// Milliseconds since the Unix epoch (0 if the clock is before 1970)
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch (0 if the clock is before 1970)
pub fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Load a secret from either an inline value or `@path/to/file`
pub fn load_inline_or_file(value: &str) -> anyhow::Result<String> {
    match value.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| anyhow::anyhow!("Failed to read '{}': {}", path, e)),
        None => Ok(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_hash_differs_by_domain() {
        let a = sha256_namespaced!(b"domain.a", b"payload");
        let b = sha256_namespaced!(b"domain.b", b"payload");
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_inline_value_passes_through() {
        assert_eq!(load_inline_or_file("0xabc").unwrap(), "0xabc");
    }

    #[test]
    fn test_missing_key_file_errors() {
        assert!(load_inline_or_file("@/definitely/not/here").is_err());
    }
}
