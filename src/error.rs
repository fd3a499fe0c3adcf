//! Error taxonomy of the redaction pipeline

use thiserror::Error;

use crate::pipeline::state::State;

/// Failure to connect two ports
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no stage named {0}")]
    UnknownStage(String),
    #[error("stage {stage} has no port {port}")]
    UnknownPort { stage: String, port: String },
    #[error("port {0} is already linked")]
    AlreadyLinked(String),
    #[error("{from} and {to} are in different bins")]
    WrongHierarchy { from: String, to: String },
    #[error("caps {produced} of {from} do not match caps {accepted} of {to}")]
    IncompatibleCaps {
        from: String,
        to: String,
        produced: String,
        accepted: String,
    },
    #[error("bin {0} has no ghost port")]
    NoGhostPort(String),
    #[error("port {port} of {stage} has the wrong direction")]
    WrongDirection { stage: String, port: String },
}

/// Errors raised while building or running a pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required stage or bin could not be constructed
    #[error("failed to create stage {stage}: {reason}")]
    Build { stage: String, reason: String },

    /// Two ports could not be connected
    #[error("failed to link {from} to {to}: {source}")]
    Link {
        from: String,
        to: String,
        #[source]
        source: LinkError,
    },

    /// A stage refused a state change
    #[error("stage {stage} failed to change state {from} -> {to}: {reason}")]
    StateChange {
        stage: String,
        from: State,
        to: State,
        reason: String,
    },

    /// Error reported on the bus during playback
    #[error("{origin}: {message}")]
    Runtime {
        origin: String,
        message: String,
        debug: Option<String>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn build(stage: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::Build {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn link(from: impl Into<String>, to: impl Into<String>, source: LinkError) -> Self {
        PipelineError::Link {
            from: from.into(),
            to: to.into(),
            source,
        }
    }

    /// Line written to stderr when a run fails, debug details included
    pub fn diagnostic(&self) -> String {
        match self {
            PipelineError::Runtime {
                debug: Some(debug), ..
            } => format!("Error: {}: {}", self, debug),
            _ => format!("Error: {}", self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_carries_debug() {
        let err = PipelineError::Runtime {
            origin: "decoder".to_string(),
            message: "could not decode frame".to_string(),
            debug: Some("expected value at line 1".to_string()),
        };
        assert_eq!(
            err.diagnostic(),
            "Error: decoder: could not decode frame: expected value at line 1"
        );

        let err = PipelineError::build("encoder", "no such element");
        assert_eq!(err.diagnostic(), "Error: failed to create stage encoder: no such element");

        let err = PipelineError::link("a:src", "b:sink", LinkError::AlreadyLinked("b:sink".into()));
        assert!(err.diagnostic().ends_with("port b:sink is already linked"));
    }
}
