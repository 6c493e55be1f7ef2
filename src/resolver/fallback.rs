//! Ordered fallback lookups.
//!
//! Several lookups try a primary source and then progressively older or
//! cheaper ones (a recorded comment id, then a scan, then a legacy location).
//! `FallbackChain` runs such steps in order and stops at the first hit.
//! Errors from optional steps are logged and skipped; errors from required
//! steps abort the chain.

use futures::future::BoxFuture;
use std::fmt::Display;
use std::future::Future;
use tracing::{debug, warn};

/// A value found by a chain, with the name of the step that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: &'static str,
}

type Attempt<'a, T, E> = Box<dyn FnOnce() -> BoxFuture<'a, Result<Option<T>, E>> + Send + 'a>;

struct Step<'a, T, E> {
    name: &'static str,
    required: bool,
    attempt: Attempt<'a, T, E>,
}

pub struct FallbackChain<'a, T, E> {
    label: &'static str,
    steps: Vec<Step<'a, T, E>>,
}

impl<'a, T, E> FallbackChain<'a, T, E>
where
    T: Send + 'a,
    E: Display + Send + 'a,
{
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            steps: Vec::new(),
        }
    }

    /// Append a step. `Ok(None)` means "not here, try the next step".
    pub fn step<F, Fut>(mut self, name: &'static str, required: bool, attempt: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'a,
    {
        self.steps.push(Step {
            name,
            required,
            attempt: Box::new(move || Box::pin(attempt())),
        });
        self
    }

    /// Run the steps in order.
    pub async fn resolve(self) -> Result<Option<Resolved<T>>, E> {
        let label = self.label;
        for step in self.steps {
            match (step.attempt)().await {
                Ok(Some(value)) => {
                    debug!(chain = label, source = step.name, "Fallback chain resolved");
                    return Ok(Some(Resolved {
                        value,
                        source: step.name,
                    }));
                }
                Ok(None) => {
                    debug!(chain = label, step = step.name, "Step found nothing");
                }
                Err(e) if !step.required => {
                    warn!(chain = label, step = step.name, error = %e, "Optional step failed, trying next");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
