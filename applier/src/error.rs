//! Errors raised by the firewall control interface

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("`{command}` produced non-UTF-8 output")]
    Utf8 { command: String },
}
