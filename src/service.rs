use std::{future::Future, sync::Arc, time::Duration};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::store::{EntityStore, StoreResult};

/// Holds the store handle and the per-call timeout. Course composition,
/// enrollment and progress operations are implemented on this type in their
/// own modules.
#[derive(Clone)]
pub struct Service {
    store: Arc<dyn EntityStore>,
    timeout: Duration,
}

impl Service {
    pub fn new(store: Arc<dyn EntityStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub(crate) fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }

    /// Runs one store call under the configured timeout. An expired call is
    /// reported as `Timeout` and never retried here.
    pub(crate) async fn timed<T, F>(&self, call: F) -> AppResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        self.bounded(async { call.await.map_err(AppError::from) }).await
    }

    /// Same deadline as [`Service::timed`] for lookups that already speak
    /// `AppError`, such as session resolution.
    pub(crate) async fn bounded<T, F>(&self, call: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(res) => res,
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "store call timed out");
                Err(AppError::Timeout)
            }
        }
    }
}

/// Parses a required identifier, naming `field` in the error.
pub fn parse_id(raw: &str, field: &str) -> AppResult<Uuid> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::invalid(format!("{field} is required")));
    }
    Uuid::parse_str(raw).map_err(|_| AppError::invalid(format!("invalid {field}")))
}

/// Trims and rejects blank values of a required text field.
pub fn required(value: &str, field: &str) -> AppResult<String> {
    let value = value.trim();
    if value.is_empty() {
        Err(AppError::invalid(format!("{field} is required")))
    } else {
        Ok(value.to_string())
    }
}
