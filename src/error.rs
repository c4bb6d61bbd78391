use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Database,
    Table,
    Index,
    Column,
    AlterJob,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Database => write!(f, "database"),
            ResourceType::Table => write!(f, "table"),
            ResourceType::Index => write!(f, "index"),
            ResourceType::Column => write!(f, "column"),
            ResourceType::AlterJob => write!(f, "alter job"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    Corruption,
    DatabaseAlreadyExists,
    TableAlreadyExists,
    IndexAlreadyExists,
    ColumnAlreadyExists,
    AlterJobAlreadyExists,
    DatabaseNotFound,
    TableNotFound,
    IndexNotFound,
    ColumnNotFound,
    AlterJobNotFound,
    DuplicateColumn,
    UnknownColumn,
    UnsupportedEngine,
    ConcurrentModification,
    HasActiveJobs,
    InvalidStateTransition,
    JobAlreadyFinal,
    Worker,
    Timeout,
    Shutdown,
}

impl FeErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FeErrorCode::Io => "io",
            FeErrorCode::Encode => "encode",
            FeErrorCode::Decode => "decode",
            FeErrorCode::Validation => "validation",
            FeErrorCode::InvalidConfig => "invalid_config",
            FeErrorCode::Corruption => "corruption",
            FeErrorCode::DatabaseAlreadyExists => "database_already_exists",
            FeErrorCode::TableAlreadyExists => "table_already_exists",
            FeErrorCode::IndexAlreadyExists => "index_already_exists",
            FeErrorCode::ColumnAlreadyExists => "column_already_exists",
            FeErrorCode::AlterJobAlreadyExists => "alter_job_already_exists",
            FeErrorCode::DatabaseNotFound => "database_not_found",
            FeErrorCode::TableNotFound => "table_not_found",
            FeErrorCode::IndexNotFound => "index_not_found",
            FeErrorCode::ColumnNotFound => "column_not_found",
            FeErrorCode::AlterJobNotFound => "alter_job_not_found",
            FeErrorCode::DuplicateColumn => "duplicate_column",
            FeErrorCode::UnknownColumn => "unknown_column",
            FeErrorCode::UnsupportedEngine => "unsupported_engine",
            FeErrorCode::ConcurrentModification => "concurrent_modification",
            FeErrorCode::HasActiveJobs => "has_active_jobs",
            FeErrorCode::InvalidStateTransition => "invalid_state_transition",
            FeErrorCode::JobAlreadyFinal => "job_already_final",
            FeErrorCode::Worker => "worker",
            FeErrorCode::Timeout => "timeout",
            FeErrorCode::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Error)]
pub enum FeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("corruption: {message}")]
    Corruption { message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error("table '{table}' uses engine {engine}, which does not support this operation")]
    UnsupportedEngine { table: String, engine: String },
    #[error("table '{table}' is busy: {state} job {job_id} is in progress")]
    ConcurrentModification {
        table: String,
        state: String,
        job_id: u64,
    },
    #[error("database '{database}' has {active} active alter job(s)")]
    HasActiveJobs { database: String, active: usize },
    #[error("alter job {job_id}: invalid state transition {from} -> {to}")]
    InvalidStateTransition {
        job_id: u64,
        from: String,
        to: String,
    },
    #[error("alter job {job_id} is already {state}")]
    JobAlreadyFinal { job_id: u64, state: String },
    #[error("worker error: {0}")]
    Worker(String),
    #[error("timeout")]
    Timeout,
    #[error("frontend is shutting down")]
    Shutdown,
}

impl FeError {
    pub fn code(&self) -> FeErrorCode {
        match self {
            FeError::Io(_) => FeErrorCode::Io,
            FeError::Encode(_) => FeErrorCode::Encode,
            FeError::Decode(_) => FeErrorCode::Decode,
            FeError::Validation(_) => FeErrorCode::Validation,
            FeError::InvalidConfig { .. } => FeErrorCode::InvalidConfig,
            FeError::Corruption { .. } => FeErrorCode::Corruption,
            FeError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Database => FeErrorCode::DatabaseAlreadyExists,
                ResourceType::Table => FeErrorCode::TableAlreadyExists,
                ResourceType::Index => FeErrorCode::IndexAlreadyExists,
                ResourceType::Column => FeErrorCode::ColumnAlreadyExists,
                ResourceType::AlterJob => FeErrorCode::AlterJobAlreadyExists,
            },
            FeError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Database => FeErrorCode::DatabaseNotFound,
                ResourceType::Table => FeErrorCode::TableNotFound,
                ResourceType::Index => FeErrorCode::IndexNotFound,
                ResourceType::Column => FeErrorCode::ColumnNotFound,
                ResourceType::AlterJob => FeErrorCode::AlterJobNotFound,
            },
            FeError::DuplicateColumn { .. } => FeErrorCode::DuplicateColumn,
            FeError::UnknownColumn { .. } => FeErrorCode::UnknownColumn,
            FeError::UnsupportedEngine { .. } => FeErrorCode::UnsupportedEngine,
            FeError::ConcurrentModification { .. } => FeErrorCode::ConcurrentModification,
            FeError::HasActiveJobs { .. } => FeErrorCode::HasActiveJobs,
            FeError::InvalidStateTransition { .. } => FeErrorCode::InvalidStateTransition,
            FeError::JobAlreadyFinal { .. } => FeErrorCode::JobAlreadyFinal,
            FeError::Worker(_) => FeErrorCode::Worker,
            FeError::Timeout => FeErrorCode::Timeout,
            FeError::Shutdown => FeErrorCode::Shutdown,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Errors the scheduler retries with backoff instead of failing the job.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeError::Io(_) | FeError::Worker(_) | FeError::Timeout)
    }

    pub(crate) fn not_found(resource_type: ResourceType, resource_id: impl Into<String>) -> Self {
        FeError::NotFound {
            resource_type,
            resource_id: resource_id.into(),
        }
    }

    pub(crate) fn already_exists(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
    ) -> Self {
        FeError::AlreadyExists {
            resource_type,
            resource_id: resource_id.into(),
        }
    }
}
