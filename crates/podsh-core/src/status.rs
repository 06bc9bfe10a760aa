//! Terminal status reported on the error/status channel.
//!
//! The remote side sends a single JSON `Status` object when the exec'd
//! process ends:
//!
//! ```json
//! {"metadata":{},"status":"Success"}
//! {"metadata":{},"status":"Failure","message":"command terminated with non-zero exit code",
//!  "reason":"NonZeroExitCode","details":{"causes":[{"reason":"ExitCode","message":"2"}]}}
//! ```

use std::fmt;

use serde::Deserialize;

use crate::error::PodshResult;

#[derive(Debug, Deserialize)]
struct StatusObject {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    details: Option<StatusDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Outcome of the remote shell process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure {
        /// Exit code, when the status carries an `ExitCode` cause.
        code: Option<i32>,
        /// Machine-readable reason (e.g. `NonZeroExitCode`).
        reason: Option<String>,
        message: String,
    },
}

impl ExitStatus {
    /// Parse a JSON status payload.
    pub fn parse(payload: &[u8]) -> PodshResult<Self> {
        let obj: StatusObject = serde_json::from_slice(payload)?;
        if obj.status == "Success" {
            return Ok(Self::Success);
        }

        let code = obj
            .details
            .unwrap_or_default()
            .causes
            .into_iter()
            .find(|c| c.reason.as_deref() == Some("ExitCode"))
            .and_then(|c| c.message)
            .and_then(|m| m.trim().parse::<i32>().ok());

        Ok(Self::Failure {
            code,
            reason: obj.reason,
            message: obj.message.unwrap_or_else(|| obj.status.clone()),
        })
    }

    /// Parse a status payload, falling back to a failure carrying the raw text
    /// when the payload is not a JSON status object.
    pub fn from_payload(payload: &[u8]) -> Self {
        match Self::parse(payload) {
            Ok(status) => status,
            Err(e) => {
                tracing::debug!("unstructured status payload: {}", e);
                Self::Failure {
                    code: None,
                    reason: None,
                    message: String::from_utf8_lossy(payload).trim().to_string(),
                }
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Exit code of the remote process. `Success` maps to `0`.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Success => Some(0),
            Self::Failure { code, .. } => *code,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failure {
                code: Some(code),
                message,
                ..
            } => write!(f, "exit code {code}: {message}"),
            Self::Failure { message, .. } => write!(f, "failure: {message}"),
        }
    }
}
