use std::fmt;

use crate::cache::CacheError;
use crate::harmonization::HarmonizationError;
use crate::message::MessageError;
use crate::pipeline::PipelineError;

/// Error type for everything a bot iteration can run into
#[derive(Debug, Clone, PartialEq)]
pub enum BotError {
    Harmonization(HarmonizationError),
    Message(MessageError),
    Pipeline(PipelineError),
    Cache(CacheError),
    /// Reported by processing logic about something outside this crate.
    External { message: String, transient: bool },
    /// A transient error kept failing until the attempt budget ran out.
    RetryExhausted { attempts: u32, last: Box<BotError> },
    /// The dump sink could not record a failed message.
    Dump(String),
    Config(String),
    Other(String),
}

impl BotError {
    /// Failure of an external dependency that may succeed on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        BotError::External {
            message: message.into(),
            transient: true,
        }
    }

    /// Failure of an external dependency that retrying will not fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        BotError::External {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether retrying the same message can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BotError::Pipeline(e) => e.is_transient(),
            BotError::Cache(CacheError::Unavailable(_)) => true,
            BotError::External { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Short machine-readable name recorded in dump records.
    pub fn kind(&self) -> &'static str {
        match self {
            BotError::Harmonization(_) => "harmonization",
            BotError::Message(MessageError::Decode(_)) => "decode",
            BotError::Message(e) if e.is_schema_violation() => "schema_violation",
            BotError::Message(_) => "message",
            BotError::Pipeline(PipelineError::QueueFull { .. }) => "queue_full",
            BotError::Pipeline(_) => "pipeline",
            BotError::Cache(_) => "cache",
            BotError::External { .. } => "external",
            BotError::RetryExhausted { .. } => "retry_exhausted",
            BotError::Dump(_) => "dump",
            BotError::Config(_) => "config",
            BotError::Other(_) => "other",
        }
    }
}

impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotError::Harmonization(e) => write!(f, "{}", e),
            BotError::Message(e) => write!(f, "{}", e),
            BotError::Pipeline(e) => write!(f, "{}", e),
            BotError::Cache(e) => write!(f, "{}", e),
            BotError::External { message, transient } => {
                let class = if *transient { "transient" } else { "permanent" };
                write!(f, "External error ({}): {}", class, message)
            }
            BotError::RetryExhausted { attempts, last } => {
                write!(f, "Gave up after {} attempts: {}", attempts, last)
            }
            BotError::Dump(msg) => write!(f, "Dump failed: {}", msg),
            BotError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BotError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BotError {}

impl From<HarmonizationError> for BotError {
    fn from(err: HarmonizationError) -> Self {
        BotError::Harmonization(err)
    }
}

impl From<MessageError> for BotError {
    fn from(err: MessageError) -> Self {
        BotError::Message(err)
    }
}

impl From<PipelineError> for BotError {
    fn from(err: PipelineError) -> Self {
        BotError::Pipeline(err)
    }
}

impl From<CacheError> for BotError {
    fn from(err: CacheError) -> Self {
        BotError::Cache(err)
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::permanent(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::transient(format!("I/O error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(BotError::Pipeline(PipelineError::Transport("down".into())).is_transient());
        assert!(BotError::Pipeline(PipelineError::QueueFull {
            queue: "q".into(),
            max_length: 1
        })
        .is_transient());
        assert!(BotError::Cache(CacheError::Unavailable("down".into())).is_transient());
        assert!(BotError::transient("timeout").is_transient());

        assert!(!BotError::permanent("bad input").is_transient());
        assert!(!BotError::Message(MessageError::Decode("x".into())).is_transient());
        assert!(!BotError::Message(MessageError::SchemaViolation {
            field: "source.ip".into(),
            value: "x".into()
        })
        .is_transient());
        assert!(!BotError::Cache(CacheError::Codec("x".into())).is_transient());
        assert!(!BotError::Other("boom".into()).is_transient());
    }

    #[test]
    fn test_exhausted_is_permanent_and_names_cause() {
        let err = BotError::RetryExhausted {
            attempts: 3,
            last: Box::new(BotError::transient("timeout")),
        };
        assert!(!err.is_transient());
        assert_eq!(err.kind(), "retry_exhausted");
        assert!(err.to_string().contains("timeout"));
    }
}
