use thiserror::Error;

/// Classified pipeline failures. Every variant is fatal for the run that raised it.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("{table}: missing required columns {missing:?}")]
    SchemaViolation { table: String, missing: Vec<String> },
    #[error("{entity} {key}: cannot coerce `{field}`: {detail}")]
    Coercion {
        entity: &'static str,
        field: &'static str,
        key: String,
        detail: String,
    },
    #[error("extract failed: {0:#}")]
    Extract(#[source] anyhow::Error),
    #[error("load failed: {0:#}")]
    Load(#[source] anyhow::Error),
    #[error("audit log update failed: {0:#}")]
    Audit(#[source] anyhow::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("pipeline `{0}` already has a run in flight")]
    AlreadyRunning(String),
}

impl EtlError {
    pub fn coercion(
        entity: &'static str,
        field: &'static str,
        key: impl ToString,
        detail: impl Into<String>,
    ) -> Self {
        Self::Coercion {
            entity,
            field,
            key: key.to_string(),
            detail: detail.into(),
        }
    }
}
