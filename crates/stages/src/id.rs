use std::fmt;

/// The id of a sync stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StageId {
    /// Determine the cycle target height from peer head probes.
    Heads,
    /// Download block bodies into worker scratch databases.
    Bodies,
    /// Verify downloaded blocks and insert them into the chain store.
    States,
    /// Clear auxiliary buckets at the end of the cycle.
    Finish,
}

impl StageId {
    /// The persisted name of the stage.
    pub const fn as_str(&self) -> &'static str {
        match self {
            StageId::Heads => "Heads",
            StageId::Bodies => "Bodies",
            StageId::States => "States",
            StageId::Finish => "Finish",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The forward execution order.
pub const DEFAULT_STAGE_ORDER: [StageId; 4] =
    [StageId::Heads, StageId::Bodies, StageId::States, StageId::Finish];

/// The revert pass order.
pub const DEFAULT_REVERT_ORDER: [StageId; 4] =
    [StageId::Finish, StageId::States, StageId::Bodies, StageId::Heads];

/// The cleanup pass order.
pub const DEFAULT_CLEANUP_ORDER: [StageId; 4] =
    [StageId::Heads, StageId::Bodies, StageId::States, StageId::Finish];
