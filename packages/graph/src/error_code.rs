//! Classification of Graph API error codes.

/// What a structured error code means to the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphErrorKind {
    /// Application or user request limit reached.
    RateLimit,
    /// The metric name or period is not supported for this node.
    UnsupportedMetric,
    /// The token lacks the required permission.
    Permission,
    /// The token is invalid or expired.
    InvalidToken,
    /// Any other code.
    Other(i64),
}

impl GraphErrorKind {
    /// Maps an integer error code to its kind.
    #[must_use]
    pub const fn from_code(code: i64) -> Self {
        match code {
            4 | 17 | 32 | 613 => Self::RateLimit,
            100 => Self::UnsupportedMetric,
            10 | 200..=299 => Self::Permission,
            190 => Self::InvalidToken,
            other => Self::Other(other),
        }
    }

    /// Whether the error denies access to the whole resource rather than
    /// a single metric.
    #[must_use]
    pub const fn is_resource_wide(self) -> bool {
        matches!(self, Self::Permission | Self::InvalidToken)
    }
}
