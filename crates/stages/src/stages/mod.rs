//! The long-range sync stages.

mod bodies;
mod finish;
mod heads;
mod states;

pub use bodies::BodiesStage;
pub use finish::FinishStage;
pub use heads::HeadsStage;
pub use states::StatesStage;

use crate::stage::Stage;
use std::time::Duration;

/// Timeout applied to every outbound transport call.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The default long-range sync pipeline, in forward order.
pub fn default_stages() -> Vec<Stage> {
    vec![
        Stage::new(HeadsStage),
        Stage::new(BodiesStage),
        Stage::new(StatesStage),
        Stage::new(FinishStage),
    ]
}
