//! Unified error types for Drydock

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Main error type for Drydock operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    // Mount errors
    #[error("Failed to stat '{path}': {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("Failed to bind mount '{from}' on '{target}': {source}")]
    Mount {
        from: PathBuf,
        target: PathBuf,
        source: io::Error,
    },

    #[error("Failed to unmount '{path}': {source}")]
    Unmount { path: PathBuf, source: io::Error },

    #[error("Failed to create directory '{path}': {source}")]
    DirCreate { path: PathBuf, source: io::Error },

    #[error("Failed to create file '{path}': {source}")]
    FileCreate { path: PathBuf, source: io::Error },

    #[error("Failed to remove file '{path}': {source}")]
    FileRemove { path: PathBuf, source: io::Error },

    #[error("Jail '{0}' is already prepared")]
    AlreadyPrepared(PathBuf),

    #[error("Bind target '{target}' escapes jail root '{root}'")]
    BindEscape { target: PathBuf, root: PathBuf },

    // Root switch errors
    #[error("Failed to resolve jail path '{path}': {source}")]
    PathResolution { path: PathBuf, source: io::Error },

    #[error("{op} '{path}' failed: {source}")]
    RootSwitch {
        op: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to restore original root ({op}): {source}")]
    Restore { op: &'static str, source: io::Error },

    #[error("Callback failed: {0}")]
    Callback(#[source] Box<dyn std::error::Error + Send + Sync>),

    // Process errors
    #[error("Failed to start '{command}': {source}")]
    CommandStart { command: String, source: io::Error },

    #[error("Command '{command}' failed: {status}")]
    CommandExit {
        command: String,
        status: ExitStatus,
        output: Vec<u8>,
    },

    #[error("Command '{command}' cancelled: {reason}")]
    Cancelled {
        command: String,
        reason: &'static str,
    },

    #[error("Failed to open {stream} pipe for '{command}': {source}")]
    Pipe {
        command: String,
        stream: &'static str,
        source: io::Error,
    },

    #[error("Failed to wait on '{command}': {source}")]
    Wait { command: String, source: io::Error },

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Wrap an error produced by caller-supplied work
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Callback(err.into())
    }

    /// Compose independent failures into one error, preserving order.
    ///
    /// Nested aggregates are flattened. Returns `None` for no errors and the
    /// error itself when there is exactly one.
    pub fn join(errors: impl IntoIterator<Item = Error>) -> Option<Error> {
        let mut flat: Vec<Error> = errors.into_iter().flat_map(Error::into_parts).collect();

        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate(flat)),
        }
    }

    /// Append further failures to this one, keeping it first
    pub fn with(self, others: impl IntoIterator<Item = Error>) -> Error {
        let mut parts = self.into_parts();
        parts.extend(others.into_iter().flat_map(Error::into_parts));

        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Error::Aggregate(parts)
        }
    }

    fn into_parts(self) -> Vec<Error> {
        match self {
            Error::Aggregate(inner) => inner,
            other => vec![other],
        }
    }

    /// The individual failures this error is composed of
    pub fn errors(&self) -> &[Error] {
        match self {
            Error::Aggregate(inner) => inner,
            other => std::slice::from_ref(other),
        }
    }
}

fn join_messages(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Result type alias for Drydock operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn unmount_error(path: &str) -> Error {
        Error::Unmount {
            path: PathBuf::from(path),
            source: io::Error::other("device busy"),
        }
    }

    #[test]
    fn test_join_empty() {
        assert!(Error::join(Vec::new()).is_none());
    }

    #[test]
    fn test_join_single_is_unchanged() {
        let err = Error::join(vec![Error::callback("boom")]).unwrap();
        assert!(matches!(err, Error::Callback(_)));
        assert_eq!(err.to_string(), "Callback failed: boom");
    }

    #[test]
    fn test_join_flattens_nested() {
        let inner = Error::join(vec![unmount_error("/a"), unmount_error("/b")]).unwrap();
        let err = Error::join(vec![Error::callback("boom"), inner]).unwrap();

        assert_eq!(err.errors().len(), 3);
        assert!(matches!(err.errors()[0], Error::Callback(_)));
    }

    #[test]
    fn test_with_keeps_primary_first() {
        let err = Error::callback("boom").with(vec![unmount_error("/jail/proc")]);
        let message = err.to_string();

        assert_eq!(err.errors().len(), 2);
        assert!(message.starts_with("Callback failed: boom"));
        assert!(message.contains("/jail/proc"));
    }

    #[test]
    fn test_with_nothing_appended() {
        let err = unmount_error("/x").with(Vec::new());
        assert!(matches!(err, Error::Unmount { .. }));
    }

    #[test]
    fn test_errors_of_single() {
        let err = unmount_error("/x");
        assert_eq!(err.errors().len(), 1);
    }
}
