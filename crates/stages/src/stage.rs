use crate::{
    error::StageError,
    id::StageId,
    state::{CleanUpState, RevertState, StageState, SyncState},
};
use async_trait::async_trait;

/// The behavior of a sync stage.
///
/// A stage is a named, ordered unit of sync work. The engine calls
/// [`exec`](StageHandler::exec) during the forward pass,
/// [`revert`](StageHandler::revert) when a revert point is pending, and
/// [`clean_up`](StageHandler::clean_up) after the forward pass completes.
/// Handlers may spawn their own parallelism but must complete before
/// returning, and must return promptly with [`StageError::Cancelled`] when
/// the state's cancellation context fires.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// The id of the stage.
    fn id(&self) -> StageId;

    /// Forward execution for one cycle.
    async fn exec(
        &self,
        first_cycle: bool,
        invalid_block_revert: bool,
        stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError>;

    /// Undo the stage's effects above the revert point.
    async fn revert(
        &self,
        first_cycle: bool,
        revert: &RevertState,
        stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError>;

    /// Post-cycle cleanup.
    async fn clean_up(
        &self,
        first_cycle: bool,
        cleanup: &CleanUpState,
        state: &SyncState,
    ) -> Result<(), StageError>;
}

/// A stage queued in the engine.
pub struct Stage {
    /// The id of the stage.
    pub id: StageId,
    /// The stage behavior.
    pub handler: Box<dyn StageHandler>,
    /// A disabled stage is skipped but still advanced past.
    pub disabled: bool,
    /// Human description of why the stage is disabled.
    pub disabled_description: String,
}

impl Stage {
    /// Queue a handler under its id.
    pub fn new<H: StageHandler + 'static>(handler: H) -> Self {
        Self {
            id: handler.id(),
            handler: Box::new(handler),
            disabled: false,
            disabled_description: String::new(),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("disabled", &self.disabled)
            .finish()
    }
}
