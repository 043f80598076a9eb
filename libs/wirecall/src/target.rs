//! Targets bind a resolved template to a concrete base URL.

use crate::error::InvokeError;
use crate::request::{Request, RequestTemplate};

/// Produces the final [`Request`] from a resolved template. Implementations
/// may route per call (mirrors, canary hosts); the stock implementation
/// prepends a fixed base URL.
pub trait Target: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Base URL this target routes to.
    fn url(&self) -> &str;

    /// Finalizes a resolved template into an immutable request.
    fn apply(&self, template: RequestTemplate) -> Result<Request, InvokeError> {
        template.into_request(Some(self.url()))
    }
}

/// A target with a fixed base URL.
#[derive(Debug, Clone)]
pub struct HardCodedTarget {
    name: String,
    url: String,
}

impl HardCodedTarget {
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        HardCodedTarget {
            name: name.into(),
            url: url.into(),
        }
    }
}

impl Target for HardCodedTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn url(&self) -> &str {
        &self.url
    }
}
