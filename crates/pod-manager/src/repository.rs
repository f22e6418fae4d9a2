//! The `Repository` consumed contract: durable append of exchange outcomes.

use async_trait::async_trait;

use crate::exchange::ExchangeResult;
use crate::status::PodState;

/// Persists one exchange outcome per call. `perform_exchange` calls `save`
/// exactly once per exchange, on every termination path.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn save(&self, pod: &PodState, result: &ExchangeResult) -> pod_common::Result<()>;
}
