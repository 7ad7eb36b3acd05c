use serde::{Deserialize, Serialize};
use std::fmt;

/// One "Viewstate verification failed" occurrence, or an ad-hoc payload.
///
/// Metadata fields are passed through untouched; they are `None` for
/// payloads supplied directly on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewStateEvent {
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub requested_page: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub viewstate: String,
}

impl ViewStateEvent {
    pub fn from_payload(viewstate: impl Into<String>) -> Self {
        ViewStateEvent {
            viewstate: viewstate.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub found: bool,
    /// Hex MD5 of the carved image. Absent when nothing was found or the
    /// artifact could not be written.
    pub fingerprint: Option<String>,
    pub offset: Option<usize>,
    pub size: Option<usize>,
}

impl ExtractionResult {
    pub fn not_found() -> Self {
        ExtractionResult::default()
    }
}

/// Names of the catalog rules that matched a blob, in catalog order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GadgetMatchResult {
    pub names: Vec<String>,
}

impl GadgetMatchResult {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Columnar form: `None` when nothing matched, never an empty string.
    pub fn display(&self) -> Option<String> {
        if self.names.is_empty() {
            None
        } else {
            Some(self.names.join(", "))
        }
    }
}

/// The unit of output, one per input event.
///
/// `extraction` and `gadgets` are `None` when the payload never reached the
/// scanners (decryption failed), which is distinct from a scan that found
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForensicRecord {
    pub event: ViewStateEvent,
    pub decrypted: Option<Vec<u8>>,
    pub decryption_error: Option<String>,
    pub extraction: Option<ExtractionResult>,
    pub gadgets: Option<GadgetMatchResult>,
}

impl ForensicRecord {
    pub fn has_executable(&self) -> bool {
        self.extraction.as_ref().map_or(false, |e| e.found)
    }

    pub fn has_gadgets(&self) -> bool {
        self.gadgets.as_ref().map_or(false, |g| !g.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub decrypted: usize,
    pub decryption_errors: usize,
    pub executables: usize,
    pub gadgets: usize,
}

impl RunSummary {
    pub fn from_records(records: &[ForensicRecord]) -> Self {
        let decrypted = records.iter().filter(|r| r.decrypted.is_some()).count();
        RunSummary {
            total: records.len(),
            decrypted,
            decryption_errors: records.len() - decrypted,
            executables: records.iter().filter(|r| r.has_executable()).count(),
            gadgets: records.iter().filter(|r| r.has_gadgets()).count(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Stats")?;
        writeln!(f, "\tTotal ViewStates: {}", self.total)?;
        writeln!(f, "\tDecrypted ViewStates: {}", self.decrypted)?;
        writeln!(f, "\tDecryption Errors: {}", self.decryption_errors)?;
        writeln!(f, "\tExecutables: {}", self.executables)?;
        write!(f, "\tSuspicious Gadgets: {}", self.gadgets)
    }
}
