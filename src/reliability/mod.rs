pub mod circuit_breaker;
pub mod idempotency;
pub mod retry;
pub mod state;
pub mod streaming_retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitState};
pub use idempotency::IdempotencyCache;
pub use retry::{RetryManager, RetryPolicy, RetryableError};
pub use state::{ChunkMetadata, StreamState, StreamStateManager};
pub use streaming_retry::{StreamingRetryConfig, StreamingRetryManager};
