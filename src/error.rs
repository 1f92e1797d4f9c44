// ============================================================================
// HTTP Error Mapping
// ============================================================================
//
// Domain errors -> courier_error::AppError, so handlers can use `?`.
//
//   StoreError::Unavailable             -> 503 STORE_UNAVAILABLE
//   other StoreError                    -> 500 STORE_ERROR
//   QueueError::Invalid                 -> 400 VALIDATION_ERROR
//   anyhow chains wrapping the above    -> same as the wrapped error
//
// ============================================================================

pub use courier_error::{AppError, AppResult};

use crate::delivery_worker::QueueError;
use crate::store::StoreError;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            AppError::store_unavailable(err.to_string())
        } else {
            AppError::store(err.to_string())
        }
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Invalid(msg) => AppError::validation(msg),
            QueueError::Encode(e) => AppError::internal(e.to_string()),
            QueueError::Store(e) => e.into(),
        }
    }
}

/// Map an anyhow chain from the worker/admin layer, keeping store availability
/// visible to the client
pub fn from_anyhow(err: anyhow::Error) -> AppError {
    for cause in err.chain() {
        if let Some(store_err) = cause.downcast_ref::<StoreError>() {
            if store_err.is_unavailable() {
                return AppError::store_unavailable(format!("{:#}", err));
            }
            return AppError::store(format!("{:#}", err));
        }
        if let Some(QueueError::Store(store_err)) = cause.downcast_ref::<QueueError>()
            && store_err.is_unavailable()
        {
            return AppError::store_unavailable(format!("{:#}", err));
        }
    }
    AppError::Unknown(err)
}
