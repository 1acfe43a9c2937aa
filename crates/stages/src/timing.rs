use crate::id::StageId;
use std::time::Duration;

/// Which phase of a stage a timing entry measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingKind {
    /// Forward execution.
    Forward,
    /// Revert pass.
    Revert,
    /// Cleanup pass.
    CleanUp,
}

/// How long one phase of one stage took during a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// The stage measured.
    pub stage: StageId,
    /// The phase measured.
    pub kind: TimingKind,
    /// Wall-clock duration of the phase.
    pub took: Duration,
}

impl Timing {
    /// Render the entry the way the cycle log prints it.
    pub(crate) fn label(&self) -> String {
        match self.kind {
            TimingKind::Forward => self.stage.as_str().to_string(),
            TimingKind::Revert => format!("Revert {}", self.stage),
            TimingKind::CleanUp => format!("CleanUp {}", self.stage),
        }
    }
}

/// Human-readable byte count.
pub(crate) fn byte_count(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{bytes}B")
    }
    let (mut div, mut exp) = (UNIT, 0);
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1}{}B", bytes as f64 / div as f64, ["K", "M", "G", "T", "P", "E"][exp])
}
