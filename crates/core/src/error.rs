use thiserror::Error;

/// Validation failures for producer- or operator-supplied input.
///
/// These map to a 4xx response at the admin surface and are never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("label name must not be empty")]
    EmptyLabelName,

    #[error("label {0:?} has an empty value")]
    EmptyLabelValue(String),

    #[error("alert has no labels")]
    EmptyLabelSet,

    #[error("invalid matcher {0:?}: expected name<op>\"value\" with op one of =, !=, =~, !~")]
    InvalidMatcher(String),

    #[error("invalid regex in matcher {name:?}: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("silence must have at least one matcher")]
    NoMatchers,

    #[error("at least one matcher must match a non-empty string")]
    AllMatchersMatchEmpty,

    #[error("silence window is invalid: ends_at must be after starts_at")]
    InvalidWindow,

    #[error("time range is invalid: {0}")]
    InvalidTimeRange(String),

    #[error("route {0:?}: {1}")]
    InvalidRoute(String, String),
}
