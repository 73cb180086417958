//! Translate raw tool output into a [`CommandResponse`].
//!
//! Classification is a pure function of its inputs: identical stdout, stderr,
//! exit code and command always yield an identical response.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::error_codes::{self, category_for_code};
use crate::error_taxonomy::{
    ClassifiedError, CommandResponse, ErrorCategory, ErrorData, MAX_ERROR_EXCERPT_CHARS,
    truncate_chars,
};
use crate::redact::SecretRedactor;

/// `file(line,col): error CODE: message`, the compiler diagnostic format.
fn compiler_diagnostic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(?P<file>[^(\r\n]+?)\((?P<line>\d+),(?P<col>\d+)(?:,\d+,\d+)?\)\s*:\s*(?P<severity>(?i:error|warning))\s+(?P<code>[A-Za-z]+\d+)\s*:\s*(?P<message>.+?)\s*$",
        )
        .expect("compiler diagnostic regex should compile")
    })
}

/// `NU1101: message`, optionally preceded by a project path and severity.
fn package_diagnostic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<before>.*?)\b(?P<code>NU\d{4})\s*:\s*(?P<message>.+?)\s*$")
            .expect("package diagnostic regex should compile")
    })
}

/// `error CODE: message` anywhere in the line.
fn bare_diagnostic() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?P<severity>(?i:error|warning))\s+(?P<code>[A-Za-z]+\d+)\s*:\s*(?P<message>.+?)\s*$",
        )
        .expect("bare diagnostic regex should compile")
    })
}

/// MSBuild appends the owning project as ` [/path/app.csproj]`.
fn project_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\s+\[[^\[\]\r\n]+\]$").expect("project suffix regex should compile")
    })
}

fn warning_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bwarn(?:ing)?\b").expect("warning regex should compile"))
}

/// One diagnostic recognised on a single output line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedDiagnostic {
    code: String,
    message: String,
    location: Option<(String, u32, u32)>,
    is_error: bool,
}

/// Stateless classifier of tool output.
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    redactor: SecretRedactor,
}

impl ErrorClassifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_redactor(redactor: SecretRedactor) -> Self {
        Self { redactor }
    }

    #[must_use]
    pub fn redactor(&self) -> &SecretRedactor {
        &self.redactor
    }

    /// Classify a finished process.
    ///
    /// A zero exit code is always a success; stdout becomes the payload and
    /// stderr is not inspected. Any other exit code yields a failure with at
    /// least one error.
    #[must_use]
    pub fn classify(
        &self,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        command: &str,
    ) -> CommandResponse {
        let redacted_command = self.redactor.redact_owned(command);
        if exit_code == 0 {
            return CommandResponse::success(stdout, redacted_command);
        }

        let mut seen = HashSet::new();
        let mut errors = Vec::new();

        for line in stdout.lines().chain(stderr.lines()) {
            let Some(diagnostic) = parse_line(line) else {
                continue;
            };
            if !diagnostic.is_error {
                continue;
            }
            let key = (
                diagnostic.code.clone(),
                diagnostic.message.clone(),
                diagnostic.location.clone(),
            );
            if !seen.insert(key) {
                continue;
            }
            errors.push(self.build_error(diagnostic, line, exit_code, &redacted_command));
        }

        if errors.is_empty() {
            errors.push(self.fallback_error(stdout, stderr, exit_code, &redacted_command));
        }

        CommandResponse::Failure { errors, exit_code }
    }

    fn build_error(
        &self,
        diagnostic: ParsedDiagnostic,
        line: &str,
        exit_code: i32,
        command: &str,
    ) -> ClassifiedError {
        let code = error_codes::normalize_code(&diagnostic.code);
        let category = category_for_code(&code);
        let message = self.redactor.redact_owned(&diagnostic.message);

        let mut error = ClassifiedError::new(code.clone(), message, category)
            .with_raw_output(self.redactor.redact_owned(line.trim_end()))
            .with_data(ErrorData {
                command: Some(command.to_string()),
                exit_code: Some(exit_code),
                ..ErrorData::default()
            });

        if let Some((file, line_no, column)) = diagnostic.location {
            error = error.with_location(self.redactor.redact_owned(&file), line_no, column);
        }

        match error_codes::lookup(&code) {
            Some(info) => {
                error.hint = Some(info.title.to_string());
                error.explanation = Some(info.explanation.to_string());
                error.suggested_fixes = info
                    .suggested_fixes
                    .iter()
                    .map(|fix| (*fix).to_string())
                    .collect();
                error.documentation_url = Some(info.documentation_url.to_string());
            }
            None => {
                error.hint = Some(category.default_hint().to_string());
                error.documentation_url = error_codes::documentation_url(&code);
            }
        }

        error
    }

    fn fallback_error(
        &self,
        stdout: &str,
        stderr: &str,
        exit_code: i32,
        command: &str,
    ) -> ClassifiedError {
        let stderr_trimmed = stderr.trim();
        let stdout_trimmed = stdout.trim();
        let excerpt_source = if stderr_trimmed.is_empty() {
            stdout_trimmed
        } else {
            stderr_trimmed
        };

        let message = if excerpt_source.is_empty() {
            format!("Command failed with exit code {exit_code} and produced no error output")
        } else {
            truncate_chars(
                &self.redactor.redact(excerpt_source),
                MAX_ERROR_EXCERPT_CHARS,
            )
        };

        let category = ErrorCategory::Unknown;
        let mut error = ClassifiedError::new(format!("EXIT_{exit_code}"), message, category)
            .with_hint(category.default_hint())
            .with_data(ErrorData {
                command: Some(command.to_string()),
                exit_code: Some(exit_code),
                stderr: (!stderr_trimmed.is_empty()).then(|| {
                    truncate_chars(
                        &self.redactor.redact(stderr_trimmed),
                        MAX_ERROR_EXCERPT_CHARS,
                    )
                }),
                ..ErrorData::default()
            });

        let combined = combine_output(stdout, stderr);
        if !combined.is_empty() {
            error.raw_output = Some(self.redactor.redact_owned(&combined));
        }
        error
    }
}

/// Try the three diagnostic shapes from most to least specific.
fn parse_line(line: &str) -> Option<ParsedDiagnostic> {
    if let Some(caps) = compiler_diagnostic().captures(line) {
        let line_no = caps["line"].parse().unwrap_or(0);
        let column = caps["col"].parse().unwrap_or(0);
        return Some(ParsedDiagnostic {
            code: caps["code"].to_string(),
            message: strip_project_suffix(&caps["message"]),
            location: Some((caps["file"].trim().to_string(), line_no, column)),
            is_error: caps["severity"].eq_ignore_ascii_case("error"),
        });
    }

    if let Some(caps) = package_diagnostic().captures(line) {
        let is_warning = warning_marker().is_match(&caps["before"]);
        return Some(ParsedDiagnostic {
            code: caps["code"].to_string(),
            message: strip_project_suffix(&caps["message"]),
            location: None,
            is_error: !is_warning,
        });
    }

    if let Some(caps) = bare_diagnostic().captures(line) {
        return Some(ParsedDiagnostic {
            code: caps["code"].to_string(),
            message: strip_project_suffix(&caps["message"]),
            location: None,
            is_error: caps["severity"].eq_ignore_ascii_case("error"),
        });
    }

    None
}

fn strip_project_suffix(message: &str) -> String {
    project_suffix().replace(message, "").trim().to_string()
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut combined = String::with_capacity(stdout.len() + stderr.len() + 1);
    combined.push_str(stdout);
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(stderr);
    }
    combined
}
