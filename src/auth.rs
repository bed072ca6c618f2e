use std::collections::HashSet;
use std::sync::Arc;

/// Shared-secret tokens accepted by the server.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    tokens: Arc<HashSet<String>>,
}

impl AllowList {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: Arc::new(
                tokens
                    .into_iter()
                    .map(Into::into)
                    .filter(|t: &String| !t.is_empty())
                    .collect(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Check a raw `Authorization` header value. A `Bearer ` prefix is optional.
    pub fn allows(&self, header: &str) -> bool {
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();
        !token.is_empty() && self.tokens.contains(token)
    }
}
