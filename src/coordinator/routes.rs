//! Protected routes and key validation.

use crate::core::config::CoordinatorConfig;
use crate::core::error::{IdemError, IdemResult};
use http::Method;
use std::str::FromStr;

/// Method allow-list and path prefixes subject to coordination.
#[derive(Debug, Clone)]
pub struct ProtectedRoutes {
    prefixes: Vec<String>,
    methods: Vec<Method>,
}

impl ProtectedRoutes {
    /// Create a route set.
    pub fn new(prefixes: Vec<String>, methods: Vec<Method>) -> Self {
        Self { prefixes, methods }
    }

    /// Route set from configuration. Unparseable methods are skipped.
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        let methods = config
            .protected_methods
            .iter()
            .filter_map(|m| match Method::from_str(&m.to_ascii_uppercase()) {
                Ok(method) => Some(method),
                Err(_) => {
                    tracing::warn!(method = %m, "ignoring invalid protected method");
                    None
                }
            })
            .collect();
        Self::new(config.protected_paths.clone(), methods)
    }

    /// Check if a request is subject to coordination.
    ///
    /// A prefix matches the path itself and anything below it
    /// (`/api/v1/tasks` matches `/api/v1/tasks/42` but not `/api/v1/tasksets`).
    pub fn is_protected(&self, method: &Method, path: &str) -> bool {
        self.methods.contains(method) && self.prefixes.iter().any(|p| prefix_matches(p, path))
    }

    /// Protected path prefixes.
    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Protected methods.
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// Validate a client-supplied key: non-empty, at most `max_len`
/// characters, no control characters.
pub fn validate_key(key: &str, max_len: usize) -> IdemResult<()> {
    if key.trim().is_empty() {
        return Err(IdemError::invalid_key("key must not be empty"));
    }
    let len = key.chars().count();
    if len > max_len {
        return Err(IdemError::invalid_key(format!(
            "key is {len} characters; the limit is {max_len}"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(IdemError::invalid_key("key contains control characters"));
    }
    Ok(())
}
