//! Output-based activity detection.
//!
//! Classifies terminal output with a few regex sets:
//! - error markers anywhere in the chunk mean `Error`
//! - a confirmation or password prompt at the end means `Waiting`
//! - a shell prompt at the end means `Idle`
//! - anything else means `Busy`

use dashmap::DashMap;
use regex::{Regex, RegexSet};

use super::ActivityDetector;
use crate::session::{ActivityStatus, SessionId};

const ERROR_PATTERNS: &[&str] = &[
    r"(?im)^\s*error(\[\w+\])?:",
    r"(?i)traceback \(most recent call last\)",
    r"panicked at",
    r"(?i)command not found",
    r"(?i)permission denied",
    r"(?i)segmentation fault",
];

const WAITING_PATTERNS: &[&str] = &[
    r"(?i)[\(\[]y/n[\)\]]\s*$",
    r"(?i)password[^\n]*:\s*$",
    r"(?i)(continue|proceed)\?\s*$",
    r"(?i)press (enter|any key)[^\n]*$",
];

const PROMPT_PATTERNS: &[&str] = &[r"[$#%>❯]\s*$"];

/// CSI and OSC escape sequences.
const ANSI_PATTERN: &str = r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)";

/// Regex-based [`ActivityDetector`]. Remembers the last status per session
/// and only reports changes.
pub struct PatternDetector {
    errors: RegexSet,
    waiting: RegexSet,
    prompt: RegexSet,
    ansi: Regex,
    last: DashMap<SessionId, ActivityStatus>,
}

impl PatternDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            errors: RegexSet::new(ERROR_PATTERNS)?,
            waiting: RegexSet::new(WAITING_PATTERNS)?,
            prompt: RegexSet::new(PROMPT_PATTERNS)?,
            ansi: Regex::new(ANSI_PATTERN)?,
            last: DashMap::new(),
        })
    }

    /// Classifies a chunk of output on its own.
    pub fn classify(&self, data: &[u8]) -> ActivityStatus {
        let text = String::from_utf8_lossy(data);
        let text = self.ansi.replace_all(&text, "");
        let tail = text.trim_end_matches(['\r', '\n']);

        if self.errors.is_match(&text) {
            ActivityStatus::Error
        } else if self.waiting.is_match(tail) {
            ActivityStatus::Waiting
        } else if self.prompt.is_match(tail) {
            ActivityStatus::Idle
        } else {
            ActivityStatus::Busy
        }
    }

    /// Last status reported for a session.
    pub fn current(&self, id: &str) -> ActivityStatus {
        self.last.get(id).map(|s| *s).unwrap_or_default()
    }
}

impl ActivityDetector for PatternDetector {
    fn detect(&self, id: &str, data: &[u8]) -> Option<ActivityStatus> {
        if data.is_empty() {
            return None;
        }

        let status = self.classify(data);
        let previous = self.last.insert(id.to_string(), status).unwrap_or_default();
        (previous != status).then_some(status)
    }

    fn clear_session(&self, id: &str) {
        self.last.remove(id);
    }

    fn shutdown(&self) {
        self.last.clear();
    }
}
