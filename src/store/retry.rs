// ============================================================================
// Redis Retry Logic
// ============================================================================
//
// Execute Redis operations with retry on connection-level failures.
// The ConnectionManager reconnects on its own; this adds bounded retries with
// exponential backoff so a brief outage does not surface as a failed
// iteration. Command errors (NOGROUP, script errors, wrong type) are returned
// immediately.
//
// ============================================================================

use courier_redis::{RedisClient, RedisError};
use std::future::Future;
use tracing::{info, warn};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

fn is_retriable(err: &RedisError) -> bool {
    err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal()
}

/// Execute a Redis operation with retry logic
///
/// # Arguments
/// * `client` - Redis client; every attempt gets its own clone of the managed connection
/// * `operation_name` - Name of the operation for logging
/// * `operation` - Closure producing the Redis future
///
/// # Returns
/// The operation result, or the last error once retries are exhausted
pub async fn execute_redis_with_retry<F, Fut, T>(
    client: &RedisClient,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RedisError>
where
    F: FnMut(RedisClient) -> Fut,
    Fut: Future<Output = Result<T, RedisError>>,
{
    let mut attempt = 1;
    loop {
        match operation(client.clone()).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        operation = operation_name,
                        attempt = attempt,
                        "Redis operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_retriable(&e) && attempt < MAX_RETRIES => {
                warn!(
                    operation = operation_name,
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Redis operation failed, will retry"
                );

                // Exponential backoff
                let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_errors_are_not_retried() {
        let err = RedisError::from((courier_redis::ErrorKind::ResponseError, "NOGROUP"));
        assert!(!is_retriable(&err));

        let io = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_retriable(&io));
    }
}
