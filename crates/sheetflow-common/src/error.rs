//! Engine-wide error representation shared by the query engine and the
//! indexing pipeline.
//!
//! - **`FlowErrorKind`** : the canonical set of error codes
//! - **`FlowErrorExtra`**: per-kind "extension slot" (e.g. `Firewall`)
//! - **`FlowError`**     : one struct that glues the pieces together
//!
//! The top-level entry points reject with a `FlowError` whose `kind`
//! renders as the stable code (`Formula.Firewall`, `AbortError`, …) and
//! whose `message` is the human explanation. When a future error needs
//! its own payload, add another variant to `FlowErrorExtra`; existing
//! code does not break.

use std::{error::Error, fmt};

/// All recognised error codes.
///
/// **Note:** names are CamelCase (idiomatic Rust) while `Display`
/// renders the stable dotted codes callers match on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlowErrorKind {
    /// An operation referenced a column the table does not have.
    UnknownColumn,
    /// A malformed operation or call parameter.
    InvalidArgument,
    /// A privacy violation detected before any fetch.
    Firewall,
    /// Embedder output failed validation (count, shape, or finiteness).
    EmbedderMismatch,
    /// Store dimension vs. vector length disagreement.
    VectorDimensionMismatch,
    /// Cooperative cancellation observed at a suspension point.
    Abort,
    CronParse,
    CronNoMatchWithinHorizon,
    /// Internal fall-back signal from the folding planner; never surfaced.
    FoldingUnsupported,
    SourceNotFound,
    SourceTimeout,
    SourceHttp,
    /// Script or expression text that could not be parsed.
    Parse,
    /// Persistent store blob could not be read back.
    Storage,
}

impl fmt::Display for FlowErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UnknownColumn => "UnknownColumn",
            Self::InvalidArgument => "InvalidArgument",
            Self::Firewall => "Formula.Firewall",
            Self::EmbedderMismatch => "EmbedderMismatch",
            Self::VectorDimensionMismatch => "VectorDimensionMismatch",
            Self::Abort => "AbortError",
            Self::CronParse => "Cron.ParseError",
            Self::CronNoMatchWithinHorizon => "Cron.NoMatchWithinHorizon",
            Self::FoldingUnsupported => "Folding.Unsupported",
            Self::SourceNotFound => "Source.NotFound",
            Self::SourceTimeout => "Source.Timeout",
            Self::SourceHttp => "Source.Http",
            Self::Parse => "ParseError",
            Self::Storage => "StorageError",
        })
    }
}

/// Kind-specific payloads.
///
/// Only variants that need extra data get it; the rest stay at `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum FlowErrorExtra {
    /// No additional payload (the vast majority of errors).
    #[default]
    None,

    /// `Formula.Firewall` – the source ids whose combination was rejected.
    Firewall { sources: Vec<String> },

    /// `Source.Http` – the status code the remote returned.
    Http { status: u16 },
}

/// The single error struct the public API passes around.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowError {
    pub kind: FlowErrorKind,
    pub message: Option<String>,
    pub extra: FlowErrorExtra,
}

/* ───────────────────── Constructors & helpers ─────────────────────── */

impl From<FlowErrorKind> for FlowError {
    fn from(kind: FlowErrorKind) -> Self {
        Self {
            kind,
            message: None,
            extra: FlowErrorExtra::None,
        }
    }
}

impl FlowError {
    /// Basic constructor (no message, no extra).
    pub fn new(kind: FlowErrorKind) -> Self {
        kind.into()
    }

    /// Attach a human-readable explanation.
    pub fn with_message<S: Into<String>>(mut self, msg: S) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Attach kind-specific extra data.
    pub fn with_extra(mut self, extra: FlowErrorExtra) -> Self {
        self.extra = extra;
        self
    }

    /// Shorthand for the ubiquitous missing-column case.
    pub fn unknown_column<S: fmt::Display>(name: S) -> Self {
        Self::new(FlowErrorKind::UnknownColumn).with_message(format!("column '{name}' not found"))
    }

    /// Shorthand for a bad operation parameter.
    pub fn invalid_argument<S: fmt::Display, R: fmt::Display>(field: S, reason: R) -> Self {
        Self::new(FlowErrorKind::InvalidArgument).with_message(format!("{field}: {reason}"))
    }

    pub fn abort() -> Self {
        Self::new(FlowErrorKind::Abort).with_message("operation aborted")
    }

    pub fn firewall(sources: Vec<String>) -> Self {
        let msg = format!(
            "cannot combine sources with incompatible privacy levels: {}",
            sources.join(", ")
        );
        Self::new(FlowErrorKind::Firewall)
            .with_message(msg)
            .with_extra(FlowErrorExtra::Firewall { sources })
    }

    pub fn http(status: u16) -> Self {
        Self::new(FlowErrorKind::SourceHttp)
            .with_message(format!("request failed with status {status}"))
            .with_extra(FlowErrorExtra::Http { status })
    }

    pub fn is_abort(&self) -> bool {
        self.kind == FlowErrorKind::Abort
    }
}

/* ───────────────────────── Display / Error ────────────────────────── */

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref msg) = self.message {
            write!(f, ": {msg}")?;
        }
        match &self.extra {
            FlowErrorExtra::None => {}
            FlowErrorExtra::Firewall { sources } => {
                write!(f, " [{}]", sources.join(" <> "))?;
            }
            FlowErrorExtra::Http { status } => {
                write!(f, " [{status}]")?;
            }
        }
        Ok(())
    }
}

impl Error for FlowError {}

impl From<FlowError> for String {
    fn from(error: FlowError) -> Self {
        format!("{error}")
    }
}

impl PartialEq<str> for FlowErrorKind {
    fn eq(&self, other: &str) -> bool {
        format!("{self}") == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_stable_codes() {
        assert_eq!(FlowErrorKind::Firewall.to_string(), "Formula.Firewall");
        assert_eq!(FlowErrorKind::Abort.to_string(), "AbortError");
        assert_eq!(FlowErrorKind::CronParse.to_string(), "Cron.ParseError");
    }

    #[test]
    fn firewall_carries_offending_sources() {
        let e = FlowError::firewall(vec!["file:/a.csv".into(), "http:api/x".into()]);
        match &e.extra {
            FlowErrorExtra::Firewall { sources } => assert_eq!(sources.len(), 2),
            other => panic!("unexpected extra: {other:?}"),
        }
        assert!(e.to_string().contains("Formula.Firewall"));
    }
}
