use thiserror::Error;

#[derive(Debug, Error, Default)]
pub enum AppError {
  #[error("Operation completed successfully.")]
  #[default]
  Ok,

  #[error(transparent)]
  Internal(#[from] anyhow::Error),

  #[error("Record not found:{0}")]
  RecordNotFound(String),

  #[error("Record already exist:{0}")]
  RecordAlreadyExists(String),

  #[error("Invalid request:{0}")]
  InvalidRequest(String),

  /// The grant store or the resource tree could not be read.
  #[error("Grant store unavailable:{0}")]
  StoreUnavailable(String),

  /// Unknown resource id or path.
  #[error("Invalid resource:{0}")]
  InvalidResource(String),

  #[error("Requested depth {requested} exceeds the maximum tree depth {max}")]
  DepthExceeded { requested: usize, max: usize },

  #[error("Requested {requested} resources exceeds the maximum batch size {max}")]
  BatchTooLarge { requested: usize, max: usize },

  /// Non-fatal, the permission cache is best effort.
  #[error("Permission cache unavailable:{0}")]
  CacheUnavailable(String),

  #[cfg(feature = "sqlx_error")]
  #[error("{0}")]
  SqlxError(String),

  #[error(transparent)]
  SerdeError(#[from] serde_json::Error),

}

impl AppError {
  /// Failures of the durable grant store. Resolution degrades to denial on these.
  pub fn is_store_unavailable(&self) -> bool {
    match self {
      AppError::StoreUnavailable(_) => true,
      #[cfg(feature = "sqlx_error")]
      AppError::SqlxError(_) => true,
      _ => false,
    }
  }

  pub fn is_invalid_resource(&self) -> bool {
    matches!(self, AppError::InvalidResource(_))
  }

  pub fn code(&self) -> ErrorCode {
    match self {
      AppError::Ok => ErrorCode::Ok,
      AppError::Internal(_) => ErrorCode::Internal,
      AppError::RecordNotFound(_) => ErrorCode::RecordNotFound,
      AppError::RecordAlreadyExists(_) => ErrorCode::RecordAlreadyExists,
      AppError::InvalidRequest(_) => ErrorCode::InvalidRequest,
      AppError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
      AppError::InvalidResource(_) => ErrorCode::InvalidResource,
      AppError::DepthExceeded { .. } => ErrorCode::DepthExceeded,
      AppError::BatchTooLarge { .. } => ErrorCode::BatchTooLarge,
      AppError::CacheUnavailable(_) => ErrorCode::CacheUnavailable,
      #[cfg(feature = "sqlx_error")]
      AppError::SqlxError(_) => ErrorCode::SqlxError,
      AppError::SerdeError(_) => ErrorCode::SerdeError,
    }
  }
}

#[cfg(feature = "sqlx_error")]
impl From<sqlx::Error> for AppError {
  fn from(value: sqlx::Error) -> Self {
    let msg = value.to_string();
    match value {
      sqlx::Error::RowNotFound => {
        AppError::RecordNotFound(format!("Record not exist in db. {})", msg))
      },
      sqlx::Error::Io(_)
      | sqlx::Error::Tls(_)
      | sqlx::Error::PoolTimedOut
      | sqlx::Error::PoolClosed
      | sqlx::Error::WorkerCrashed => AppError::StoreUnavailable(msg),
      sqlx::Error::Database(ref db_err) if db_err.is_foreign_key_violation() => {
        AppError::InvalidResource(msg)
      },
      sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
        AppError::RecordAlreadyExists(msg)
      },
      _ => AppError::SqlxError(msg),
    }
  }
}

#[cfg(feature = "redis_error")]
impl From<redis::RedisError> for AppError {
  fn from(value: redis::RedisError) -> Self {
    AppError::CacheUnavailable(value.to_string())
  }
}

#[derive(
  Eq,
  PartialEq,
  Copy,
  Debug,
  Clone,
  serde_repr::Serialize_repr,
  serde_repr::Deserialize_repr,
  Default,
)]
#[repr(i32)]
pub enum ErrorCode {
  #[default]
  Ok = 0,
  RecordNotFound = -2,
  RecordAlreadyExists = -3,
  InvalidRequest = 1008,
  Internal = 1017,
  #[cfg(feature = "sqlx_error")]
  SqlxError = 1020,
  SerdeError = 1022,
  StoreUnavailable = 1040,
  InvalidResource = 1041,
  DepthExceeded = 1042,
  BatchTooLarge = 1043,
  CacheUnavailable = 1044,
}

impl ErrorCode {
  pub fn value(&self) -> i32 {
    *self as i32
  }
}
