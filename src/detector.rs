//! Output completion detection for agent terminal output.
//!
//! Decides whether buffered output is an in-progress animation or a
//! stable result worth delivering:
//! - Processing markers (interrupt hint, spinner + elapsed timer, status text)
//! - Threshold gate on the pending buffer size
//! - Normalized comparison against the last flushed buffer
//!
//! Everything here is a pure function of its inputs.

use crate::error::SessionError;
use regex::Regex;
use std::sync::OnceLock;

/// Characters of recent raw output inspected for processing markers
pub const PROCESSING_TAIL_CHARS: usize = 500;

/// Spinner frames drawn in front of an in-progress turn
const SPINNER_GLYPHS: &str = "✻✽✶✳✢⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// Glyphs used purely for decoration (borders, bullets, prompt cursors)
const DECORATIVE_GLYPHS: &str = "⏺⎿●•❯›▐▛▜▌▝▘█";

/// Regex patterns (compiled once)
static PATTERNS: OnceLock<Result<Patterns, String>> = OnceLock::new();

struct Patterns {
    ansi: Regex,
    interrupt_hint: Regex,
    spinner_timer: Regex,
    status: Regex,
    turn_marker: Regex,
    elapsed: Regex,
    decorative: Regex,
    whitespace: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            ansi: Regex::new(
                r"\x1B\[[0-9;?<>=]*[ -/]*[@-~]|\x1B\][^\x07\x1B]*(?:\x07|\x1B\\)|\x1B[()][A-Za-z0-9]|\x1B[=>78DEHMNOc]",
            )?,
            interrupt_hint: Regex::new(r"(?i)(?:esc|ctrl\+c) to interrupt")?,
            spinner_timer: Regex::new(&format!(r"[{}][^\n]*\(\s*\d+s", SPINNER_GLYPHS))?,
            status: Regex::new(r"(?i)\b(?:waiting|running|processing)(?:…|\.\.\.)")?,
            turn_marker: Regex::new(&format!(r"[{}]", SPINNER_GLYPHS))?,
            elapsed: Regex::new(r"\(\s*\d+(?:\.\d+)?\s*[smh]\b[^)\n]*\)")?,
            decorative: Regex::new(&format!(r"[{}\x{{2500}}-\x{{257F}}]", DECORATIVE_GLYPHS))?,
            whitespace: Regex::new(r"\s+")?,
        })
    }
}

fn patterns() -> Result<&'static Patterns, SessionError> {
    PATTERNS
        .get_or_init(|| Patterns::compile().map_err(|e| e.to_string()))
        .as_ref()
        .map_err(|e| SessionError::DetectionTransient(e.clone()))
}

/// Gates applied to non-forced checks
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Pending buffer must exceed this many characters
    pub flush_threshold: usize,
    /// Normalized length must move by more than this many characters
    pub noise_threshold: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            flush_threshold: 1000,
            noise_threshold: 50,
        }
    }
}

/// Everything the detector looks at for one pass
#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    /// Output accumulated since the last flush
    pub pending: &'a str,
    /// Tail of everything the process has emitted
    pub raw_tail: &'a str,
    /// Normalized form of the last flushed buffer
    pub last_flushed_normalized: &'a str,
    /// Final pass after process exit: skips the processing veto and threshold gate
    pub forced: bool,
}

/// Result of a detection pass. `reason` is diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushDecision {
    pub should_flush: bool,
    pub reason: String,
}

impl FlushDecision {
    fn flush(reason: impl Into<String>) -> Self {
        Self {
            should_flush: true,
            reason: reason.into(),
        }
    }

    fn hold(reason: impl Into<String>) -> Self {
        Self {
            should_flush: false,
            reason: reason.into(),
        }
    }
}

/// Decide whether pending output should be delivered now
pub fn classify_buffer(
    input: &DetectionInput<'_>,
    thresholds: Thresholds,
) -> Result<FlushDecision, SessionError> {
    let normalized = normalize(input.pending)?;

    if input.forced {
        if normalized.is_empty() {
            return Ok(FlushDecision::hold("forced pass: nothing substantive pending"));
        }
        if normalized == input.last_flushed_normalized {
            return Ok(FlushDecision::hold("forced pass: unchanged since last flush"));
        }
        return Ok(FlushDecision::flush("forced pass after exit"));
    }

    if is_processing(input.raw_tail)? {
        return Ok(FlushDecision::hold("agent still processing"));
    }

    let pending_chars = input.pending.chars().count();
    if pending_chars <= thresholds.flush_threshold {
        return Ok(FlushDecision::hold(format!(
            "pending {} chars, threshold {}",
            pending_chars, thresholds.flush_threshold
        )));
    }

    if normalized == input.last_flushed_normalized {
        return Ok(FlushDecision::hold("unchanged since last flush"));
    }

    let current_len = normalized.chars().count();
    let last_len = input.last_flushed_normalized.chars().count();
    let diff = current_len.abs_diff(last_len);
    if diff <= thresholds.noise_threshold {
        return Ok(FlushDecision::hold(format!(
            "normalized length moved {} chars, noise threshold {}",
            diff, thresholds.noise_threshold
        )));
    }

    Ok(FlushDecision::flush(format!(
        "stable output, normalized length {} (was {})",
        current_len, last_len
    )))
}

/// Check the tail of the output for signs of an unfinished turn
pub fn is_processing(raw_tail: &str) -> Result<bool, SessionError> {
    let p = patterns()?;
    let clean = p.ansi.replace_all(raw_tail, "");
    Ok(p.interrupt_hint.is_match(&clean)
        || p.spinner_timer.is_match(&clean)
        || p.status.is_match(&clean))
}

/// Reduce output to its substantive text for comparison
pub fn normalize(text: &str) -> Result<String, SessionError> {
    let p = patterns()?;
    let clean = strip_ansi(text)?;

    let kept: Vec<&str> = clean
        .lines()
        .filter(|line| !p.turn_marker.is_match(line) && !p.interrupt_hint.is_match(line))
        .collect();
    let joined = kept.join("\n");

    let without_elapsed = p.elapsed.replace_all(&joined, "");
    let without_glyphs = p.decorative.replace_all(&without_elapsed, "");
    let collapsed = p.whitespace.replace_all(&without_glyphs, " ");

    Ok(collapsed.trim().to_string())
}

/// Strip ANSI escape sequences and stray control characters.
/// Carriage returns become line breaks.
pub fn strip_ansi(text: &str) -> Result<String, SessionError> {
    let p = patterns()?;
    let stripped = p.ansi.replace_all(text, "");
    Ok(stripped
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect())
}

/// Last `max_chars` characters of `text`, cut on a char boundary
pub fn tail_window(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let start = text
        .char_indices()
        .nth(total - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}
