use std::fmt;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Rate Limited - retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    #[error("Upstream Error - status {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Malformed Response - {0}")]
    MalformedResponse(Malformed),

    #[error("Serialization Error - {0}")]
    Serialization(String),

    #[error("Missing Credential - {0} is not set")]
    MissingCredential(&'static str),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Kafka Error - {0}")]
    Kafka(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Metrics Error - {0}")]
    Metrics(String),
}

impl Error {
    /// Short label used as a log field and as the `kind` metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Decode(_) => "decode",
            Error::RateLimit { .. } => "rate_limit",
            Error::Upstream { .. } => "upstream",
            Error::MalformedResponse(_) => "malformed_response",
            Error::Serialization(_) => "serialization",
            Error::MissingCredential(_) => "missing_credential",
            Error::Config(_) => "config",
            Error::Kafka(_) => "kafka",
            Error::Watermark(_) => "watermark",
            Error::Metrics(_) => "metrics",
        }
    }

    /// Whether calling the same endpoint again may succeed without anything changing on our side.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) | Error::RateLimit { .. } => true,
            Error::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// What was wrong with a summarizer response that came back with a success status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Malformed {
    /// Body is not JSON, or is JSON of the wrong shape.
    Invalid(String),
    MissingChoices,
    EmptyChoices,
    MissingMessage,
    MissingContent,
    ContentNotString,
    EmptyContent,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformed::Invalid(e) => write!(f, "response body is not valid: {e}"),
            Malformed::MissingChoices => write!(f, "`choices` is absent"),
            Malformed::EmptyChoices => write!(f, "`choices` is empty"),
            Malformed::MissingMessage => write!(f, "`choices[0].message` is absent"),
            Malformed::MissingContent => write!(f, "`choices[0].message.content` is absent"),
            Malformed::ContentNotString => {
                write!(f, "`choices[0].message.content` is not a string")
            }
            Malformed::EmptyContent => write!(f, "`choices[0].message.content` is blank"),
        }
    }
}

impl From<issue_relay_kafka::Error> for Error {
    fn from(value: issue_relay_kafka::Error) -> Self {
        Error::Kafka(value.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(value.to_string())
    }
}
