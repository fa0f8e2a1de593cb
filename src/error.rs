#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{kind} {namespace}/{name} not found")]
    MissingDependency {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("Unsupported configuration: {0}")]
    Configuration(String),

    #[error("previous job {0} is still running")]
    JobStillRunning(String),

    #[error("Error serializing {kind}: {source}")]
    Serialization {
        kind: &'static str,
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<Error>,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// Configuration errors fail identically until the user changes the
    /// resource, so they are never retried on a timer.
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::Configuration(_) => true,
            Error::Context { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::MissingDependency { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            Error::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Adds a description of the failing step to an error, like
/// `anyhow::Context` does at the process edge.
pub trait ResultExt<T> {
    fn context(self, context: &str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: context.to_string(),
            source: Box::new(e.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_keeps_configuration_kind() {
        let result: Result<()> = Err(Error::configuration("multiple targets is not supported now"));
        let err = result.context("failed to build job").unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "failed to build job: Unsupported configuration: multiple targets is not supported now"
        );
    }

    #[test]
    fn test_missing_dependency_is_not_found() {
        let err = Error::MissingDependency {
            kind: "ImageFlowTemplate",
            namespace: "default".into(),
            name: "test".into(),
        };
        assert!(err.is_not_found());
        assert!(!err.is_configuration());
        assert_eq!(err.to_string(), "ImageFlowTemplate default/test not found");
    }
}
