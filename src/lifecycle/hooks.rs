//! Startup and shutdown hooks.
//!
//! # Design Decisions
//! - Every hook has one shape: a named async fn returning `Result`
//! - Startup runs in registration order and stops at the first error
//! - Shutdown runs in reverse order; errors are logged and the rest still run

use std::future::Future;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::ResilienceError;

pub type Hook = Box<dyn Fn() -> BoxFuture<'static, Result<(), ResilienceError>> + Send + Sync>;

/// Box an async closure into a [`Hook`].
pub fn hook<F, Fut>(f: F) -> Hook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ResilienceError>> + Send + 'static,
{
    Box::new(move || f().boxed())
}

#[derive(Default)]
pub struct LifecycleHooks {
    startup: Vec<(String, Hook)>,
    shutdown: Vec<(String, Hook)>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_startup(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.startup.push((name.into(), hook));
        self
    }

    pub fn on_shutdown(&mut self, name: impl Into<String>, hook: Hook) -> &mut Self {
        self.shutdown.push((name.into(), hook));
        self
    }

    pub async fn run_startup(&self) -> Result<(), ResilienceError> {
        for (name, hook) in &self.startup {
            tracing::debug!(hook = %name, "Running startup hook");
            if let Err(err) = hook().await {
                tracing::error!(hook = %name, error = %err, "Startup hook failed");
                return Err(err);
            }
        }
        tracing::info!(hooks = self.startup.len(), "Startup complete");
        Ok(())
    }

    /// Run every shutdown hook, returning how many failed.
    pub async fn run_shutdown(&self) -> usize {
        let mut failed = 0;
        for (name, hook) in self.shutdown.iter().rev() {
            tracing::debug!(hook = %name, "Running shutdown hook");
            if let Err(err) = hook().await {
                tracing::warn!(hook = %name, error = %err, "Shutdown hook failed; continuing");
                failed += 1;
            }
        }
        tracing::info!(hooks = self.shutdown.len(), failed, "Shutdown complete");
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str, fail: bool) -> Hook {
        let log = log.clone();
        hook(move || {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                if fail {
                    Err(ResilienceError::Validation(format!("{} failed", name)))
                } else {
                    Ok(())
                }
            }
        })
    }

    #[tokio::test]
    async fn test_startup_fails_fast_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();
        hooks
            .on_startup("config", recording(&log, "config", false))
            .on_startup("store", recording(&log, "store", true))
            .on_startup("clients", recording(&log, "clients", false));

        assert!(hooks.run_startup().await.is_err());
        assert_eq!(*log.lock().unwrap(), vec!["config", "store"]);
    }

    #[tokio::test]
    async fn test_shutdown_continues_past_errors_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = LifecycleHooks::new();
        hooks
            .on_shutdown("first", recording(&log, "first", false))
            .on_shutdown("second", recording(&log, "second", true))
            .on_shutdown("third", recording(&log, "third", false));

        assert_eq!(hooks.run_shutdown().await, 1);
        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }
}
