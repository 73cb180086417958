//! Structured error taxonomy returned to callers.
//!
//! Every failure the bridge can produce, whether parsed from tool output or
//! detected before a process was spawned, is expressed as one or more
//! [`ClassifiedError`] values inside a [`CommandResponse::Failure`]. The serde
//! shape of these types is a compatibility contract with consumers: field
//! names are stable and must not be renamed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Exit code reported for operations aborted through a cancellation signal.
///
/// Real processes killed by a signal are reported as `128 + signal` on Unix,
/// so this value never collides with a genuine tool exit.
pub const CANCELLED_EXIT_CODE: i32 = -1;

/// Maximum characters of stderr attached to an error's `data.stderr`.
pub const MAX_ERROR_EXCERPT_CHARS: usize = 500;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Compilation,
    Build,
    Package,
    #[serde(rename = "SDK")]
    Sdk,
    Validation,
    Capability,
    Concurrency,
    Cancellation,
    ProcessStart,
    Unknown,
}

impl ErrorCategory {
    /// JSON-RPC style error code used by the outer protocol layer.
    #[must_use]
    pub fn protocol_error_code(self) -> i32 {
        match self {
            ErrorCategory::Validation => -32602,
            ErrorCategory::Capability => -32601,
            ErrorCategory::Concurrency => -32001,
            ErrorCategory::ProcessStart => -32002,
            ErrorCategory::Cancellation => -32800,
            ErrorCategory::Compilation
            | ErrorCategory::Build
            | ErrorCategory::Package
            | ErrorCategory::Sdk => -32000,
            ErrorCategory::Unknown => -32603,
        }
    }

    /// Short generic hint for diagnostics without a knowledge-base entry.
    #[must_use]
    pub fn default_hint(self) -> &'static str {
        match self {
            ErrorCategory::Compilation => "Fix the reported source error and rebuild.",
            ErrorCategory::Build => "Check the project file and build configuration.",
            ErrorCategory::Package => "Check package ids, versions and configured feeds.",
            ErrorCategory::Sdk => "Check the installed SDKs and the project's target framework.",
            ErrorCategory::Validation => "Correct the request parameters and retry.",
            ErrorCategory::Capability => "This operation is not available in this environment.",
            ErrorCategory::Concurrency => {
                "Wait for the conflicting operation to finish or cancel it, then retry."
            }
            ErrorCategory::Cancellation => "The operation was cancelled before it completed.",
            ErrorCategory::ProcessStart => "The tool process could not be started.",
            ErrorCategory::Unknown => "Inspect the command output for details.",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCategory::Compilation => "Compilation",
            ErrorCategory::Build => "Build",
            ErrorCategory::Package => "Package",
            ErrorCategory::Sdk => "SDK",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::Capability => "Capability",
            ErrorCategory::Concurrency => "Concurrency",
            ErrorCategory::Cancellation => "Cancellation",
            ErrorCategory::ProcessStart => "ProcessStart",
            ErrorCategory::Unknown => "Unknown",
        };
        f.write_str(label)
    }
}

/// Execution context attached to an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_data: BTreeMap<String, String>,
}

/// One parsed diagnostic or pre-flight failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub code: String,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_fixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    pub protocol_error_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

impl ClassifiedError {
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            category,
            hint: None,
            explanation: None,
            documentation_url: None,
            suggested_fixes: Vec::new(),
            raw_output: None,
            protocol_error_code: category.protocol_error_code(),
            file: None,
            line: None,
            column: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = Some(raw.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: ErrorData) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_location(mut self, file: impl Into<String>, line: u32, column: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    /// Bad caller input; never reaches a subprocess.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        let category = ErrorCategory::Validation;
        Self::new("INVALID_PARAMS", message, category).with_hint(category.default_hint())
    }

    /// A conflicting operation holds the lock for this target.
    #[must_use]
    pub fn concurrency_conflict(requested: &str, blocking: &str) -> Self {
        let category = ErrorCategory::Concurrency;
        let mut data = ErrorData::default();
        data.additional_data
            .insert("conflictingOperation".to_string(), blocking.to_string());
        Self::new(
            "OPERATION_CONFLICT",
            format!("Cannot start {requested}: conflicting operation in progress: {blocking}"),
            category,
        )
        .with_hint(category.default_hint())
        .with_data(data)
    }

    /// The tool or feature cannot run here (e.g. the executable is missing).
    #[must_use]
    pub fn capability_unavailable(message: impl Into<String>, command: Option<String>) -> Self {
        let category = ErrorCategory::Capability;
        Self::new("CAPABILITY_NOT_AVAILABLE", message, category)
            .with_hint(category.default_hint())
            .with_data(ErrorData {
                command,
                ..ErrorData::default()
            })
    }

    /// The OS refused to start the process for a reason other than absence.
    #[must_use]
    pub fn process_start_failed(message: impl Into<String>, command: Option<String>) -> Self {
        let category = ErrorCategory::ProcessStart;
        Self::new("PROCESS_START_FAILED", message, category)
            .with_hint(category.default_hint())
            .with_data(ErrorData {
                command,
                ..ErrorData::default()
            })
    }

    /// The operation was aborted; partial (already redacted) output is kept.
    #[must_use]
    pub fn cancelled(command: Option<String>, partial_stdout: &str, partial_stderr: &str) -> Self {
        let category = ErrorCategory::Cancellation;
        let mut raw = String::new();
        raw.push_str(partial_stdout);
        if !partial_stderr.is_empty() {
            if !raw.is_empty() && !raw.ends_with('\n') {
                raw.push('\n');
            }
            raw.push_str(partial_stderr);
        }
        let mut error = Self::new("OPERATION_CANCELLED", "Operation was cancelled", category)
            .with_hint(category.default_hint())
            .with_data(ErrorData {
                command,
                exit_code: Some(CANCELLED_EXIT_CODE),
                stderr: (!partial_stderr.is_empty())
                    .then(|| truncate_chars(partial_stderr, MAX_ERROR_EXCERPT_CHARS)),
                additional_data: BTreeMap::new(),
            });
        if !raw.is_empty() {
            error.raw_output = Some(raw);
        }
        error
    }
}

/// Result of one operation as seen by the caller.
///
/// Serialized with a boolean `success` flag: successes carry `output` and
/// `command`, failures carry a non-empty `errors` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "ResponseWire", try_from = "ResponseWire")]
pub enum CommandResponse {
    Success {
        output: String,
        command: String,
        exit_code: i32,
    },
    Failure {
        errors: Vec<ClassifiedError>,
        exit_code: i32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseWire {
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<ClassifiedError>>,
    exit_code: i32,
}

impl From<CommandResponse> for ResponseWire {
    fn from(value: CommandResponse) -> Self {
        match value {
            CommandResponse::Success {
                output,
                command,
                exit_code,
            } => ResponseWire {
                success: true,
                output: Some(output),
                command: Some(command),
                errors: None,
                exit_code,
            },
            CommandResponse::Failure { errors, exit_code } => ResponseWire {
                success: false,
                output: None,
                command: None,
                errors: Some(errors),
                exit_code,
            },
        }
    }
}

impl TryFrom<ResponseWire> for CommandResponse {
    type Error = String;

    fn try_from(wire: ResponseWire) -> Result<Self, Self::Error> {
        if wire.success {
            Ok(CommandResponse::Success {
                output: wire.output.unwrap_or_default(),
                command: wire.command.unwrap_or_default(),
                exit_code: wire.exit_code,
            })
        } else {
            match wire.errors {
                Some(errors) if !errors.is_empty() => Ok(CommandResponse::Failure {
                    errors,
                    exit_code: wire.exit_code,
                }),
                _ => Err("failure response must carry at least one error".to_string()),
            }
        }
    }
}

impl CommandResponse {
    #[must_use]
    pub fn success(output: impl Into<String>, command: impl Into<String>) -> Self {
        CommandResponse::Success {
            output: output.into(),
            command: command.into(),
            exit_code: 0,
        }
    }

    /// Failure carrying a single error, with the given exit code.
    #[must_use]
    pub fn failure(error: ClassifiedError, exit_code: i32) -> Self {
        CommandResponse::Failure {
            errors: vec![error],
            exit_code,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, CommandResponse::Success { .. })
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandResponse::Success { exit_code, .. }
            | CommandResponse::Failure { exit_code, .. } => *exit_code,
        }
    }

    /// Errors of a failure; empty for success.
    #[must_use]
    pub fn errors(&self) -> &[ClassifiedError] {
        match self {
            CommandResponse::Success { .. } => &[],
            CommandResponse::Failure { errors, .. } => errors,
        }
    }

    /// Category of the first error, if any.
    #[must_use]
    pub fn primary_category(&self) -> Option<ErrorCategory> {
        self.errors().first().map(|e| e.category)
    }
}

/// Truncate to at most `max_chars` characters on a char boundary.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
