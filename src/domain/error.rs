use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid quota limits: {message}")]
    InvalidLimits { message: String },
    #[error("tier priority {priority} is shared by `{first}` and `{second}`")]
    DuplicatePriority {
        priority: u32,
        first: String,
        second: String,
    },
    #[error("unknown tier `{name}`")]
    UnknownTier { name: String },
}

impl DomainError {
    pub fn invalid_limits(message: impl Into<String>) -> Self {
        Self::InvalidLimits {
            message: message.into(),
        }
    }

    pub fn unknown_tier(name: impl Into<String>) -> Self {
        Self::UnknownTier { name: name.into() }
    }
}
