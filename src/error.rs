use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SnapError {
    #[error("failed to load config from {path}")]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The external snapshot/instance API rejected a call or was unreachable.
    #[error("{operation} failed: {message}")]
    Api { operation: String, message: String },

    #[error("command failed on {base}: {command} (exit={exit_code})\n{output}")]
    #[diagnostic(help("re-run the layer with Invalidate::Always once the command is fixed"))]
    CommandFailed {
        base: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("connection lost before {command} reported an exit code on {base}\n{output}")]
    #[diagnostic(help("the remote instance may have been stopped; retry with Invalidate::Always"))]
    ConnectionLost {
        base: String,
        command: String,
        output: String,
    },

    #[error("source path does not exist: {path}")]
    SourceNotFound { path: String },

    #[error("cannot copy to {dest}: {message}")]
    CopyTarget { dest: String, message: String },

    #[error("agent did not complete on {base}: {instructions}")]
    #[diagnostic(help("verification errors were reported to the agent; retry with Invalidate::Always"))]
    AgentIncomplete { base: String, instructions: String },

    #[error("verification failed: {}", format_failures(.failures))]
    VerificationFailed { failures: Vec<(String, String)> },

    #[error("kernel {kernel_id} ({language}) crashed [{crash_type}]: {message}")]
    KernelCrashed {
        crash_type: String,
        kernel_id: String,
        language: String,
        message: String,
    },

    #[error("crash history of snapshot {snapshot_id} is unreadable: {message}")]
    CrashHistory {
        snapshot_id: String,
        message: String,
    },

    #[error("prompt failed: {message}")]
    Prompt { message: String },
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(name, message)| format!("{name}: {message}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl SnapError {
    /// Shorthand for wrapping an external API failure.
    pub fn api(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SnapError::Api {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}
