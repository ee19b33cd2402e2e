//! Crash classification from exit codes and stderr.
//!
//! Maps raw worker output onto [`ErrorType`] and derives a normalized
//! signature so repeated crashes with the same root cause can be recognized.

use regex::Regex;
use std::sync::LazyLock;

use crate::core::ErrorType;

/// Import and dependency resolution failures across common runtimes.
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(ImportError|ModuleNotFoundError|No module named|Cannot find module|unresolved import|missing dependency|cannot load such file)\b",
    )
    .unwrap()
});

static TIMEOUT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(TimeoutError|timed out|timeout expired|deadline exceeded)\b").unwrap()
});

static RUNTIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(Error|Exception|panicked at|FATAL|Segmentation fault|Traceback)").unwrap()
});

/// Start of a multi-line trace in stderr.
static TRACE_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(Traceback \(most recent call last\)|stack backtrace:|\s+at .+\(.+:\d+:\d+\))")
        .unwrap()
});

static HEX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Exit code used by `timeout(1)`.
const TIMEOUT_EXIT_CODE: i32 = 124;
const MAX_SIGNATURE_LEN: usize = 160;
const MAX_TRACE_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub error_type: ErrorType,
    /// Root-cause excerpt.
    pub message: String,
    pub stack_trace: Option<String>,
    pub signature: String,
}

impl Classification {
    /// A failure observed by the orchestrator rather than read from output.
    pub fn observed(error_type: ErrorType, message: &str) -> Self {
        Self {
            error_type,
            message: message.to_string(),
            stack_trace: None,
            signature: signature(error_type, message),
        }
    }
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, exit_code: Option<i32>, stderr: &str) -> Classification;
}

/// Regex-based classifier.
#[derive(Debug, Default, Clone)]
pub struct PatternClassifier;

impl ErrorClassifier for PatternClassifier {
    fn classify(&self, exit_code: Option<i32>, stderr: &str) -> Classification {
        let (error_type, excerpt) = if let Some(line) = first_matching(&IMPORT_RE, stderr) {
            (ErrorType::ImportError, line)
        } else if let Some(line) = first_matching(&TIMEOUT_RE, stderr) {
            (ErrorType::Timeout, line)
        } else if exit_code == Some(TIMEOUT_EXIT_CODE) {
            (ErrorType::Timeout, format!("exit code {}", TIMEOUT_EXIT_CODE))
        } else if let Some(line) = first_matching(&RUNTIME_RE, stderr) {
            (ErrorType::RuntimeError, line)
        } else {
            let fallback = last_line(stderr).unwrap_or_else(|| match exit_code {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            });
            (ErrorType::Unknown, fallback)
        };

        Classification {
            error_type,
            signature: signature(error_type, &excerpt),
            message: excerpt,
            stack_trace: stack_trace(stderr),
        }
    }
}

fn first_matching(re: &Regex, text: &str) -> Option<String> {
    text.lines()
        .find(|line| re.is_match(line))
        .map(|line| line.trim().to_string())
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(String::from)
}

fn stack_trace(stderr: &str) -> Option<String> {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return None;
    }
    let start = TRACE_START_RE
        .find(trimmed)
        .map(|m| m.start())
        .unwrap_or(0);
    let trace = &trimmed[start..];
    if trace.len() <= MAX_TRACE_LEN {
        return Some(trace.to_string());
    }
    // Keep the tail; the innermost frame and the error line come last.
    let mut cut = trace.len() - MAX_TRACE_LEN;
    while !trace.is_char_boundary(cut) {
        cut += 1;
    }
    Some(trace[cut..].to_string())
}

/// Normalized fingerprint: error type plus the excerpt with volatile parts
/// (addresses, numbers, whitespace runs) folded away.
pub fn signature(error_type: ErrorType, message: &str) -> String {
    let lowered = message.to_lowercase();
    let folded = HEX_RE.replace_all(&lowered, "0x_");
    let folded = DIGITS_RE.replace_all(&folded, "N");
    let folded = SPACE_RE.replace_all(folded.trim(), " ");
    let mut sig = format!("{}:{}", error_type, folded);
    if sig.len() > MAX_SIGNATURE_LEN {
        let mut end = MAX_SIGNATURE_LEN;
        while !sig.is_char_boundary(end) {
            end -= 1;
        }
        sig.truncate(end);
    }
    sig
}
