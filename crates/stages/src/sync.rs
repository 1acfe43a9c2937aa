use crate::{
    config::Config,
    error::{StageError, SyncError},
    id::StageId,
    metrics,
    stage::Stage,
    state::{CleanUpState, RevertState, SyncState},
    timing::{byte_count, Timing, TimingKind},
};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use strata_db::{mem::MemDb, Bucket, Database, DbTx};
use strata_interfaces::{chain::ChainStore, p2p::error::RequestError, p2p::protocol::SyncProtocol};
use strata_primitives::{BlockHash, BlockNumber};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

/// Timing entries above this threshold are flushed to the cycle log.
const TIMING_LOG_THRESHOLD: Duration = Duration::from_millis(50);

/// The staged sync engine.
///
/// Drives a totally ordered list of stages through sync cycles: a forward
/// pass over every enabled stage, a revert pass in the declared revert
/// order whenever a revert point is pending, and a cleanup pass in the
/// declared cleanup order once the forward pass completes. Per-stage
/// progress is persisted so cycles resume.
///
/// [`run`](StagedSync::run) executes one cycle to completion and is not
/// re-entrant; an external scheduler drives it once per cycle.
pub struct StagedSync {
    state: SyncState,
    stages: Vec<Stage>,
    revert_order: Vec<StageId>,
    cleanup_order: Vec<StageId>,
    current_stage: usize,
    prev_revert_point: Option<BlockNumber>,
    timings: Vec<Timing>,
    log_prefixes: Vec<String>,
}

impl std::fmt::Debug for StagedSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedSync")
            .field("stages", &self.stages)
            .field("current_stage", &self.current_stage)
            .finish()
    }
}

impl StagedSync {
    /// Create an engine over the given stages and pass orders.
    ///
    /// `revert_order` and `cleanup_order` are independent permutations of
    /// the stage ids; ids missing from a permutation are silently skipped
    /// in that phase. Worker scratch databases default to in-memory ones;
    /// callers running with `use_mem_db` off inject their own through
    /// [`with_block_dbs`](Self::with_block_dbs).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stages: Vec<Stage>,
        revert_order: Vec<StageId>,
        cleanup_order: Vec<StageId>,
        chain: Arc<dyn ChainStore>,
        db: Arc<dyn Database>,
        protocol: Arc<dyn SyncProtocol>,
        mut config: Config,
        is_beacon: bool,
        use_mem_db: bool,
    ) -> Self {
        config.use_mem_db = use_mem_db;
        let block_dbs: Vec<Arc<dyn Database>> = (0..config.concurrency.max(1))
            .map(|_| Arc::new(MemDb::new()) as Arc<dyn Database>)
            .collect();
        let log_prefixes = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| format!("{}/{} {}", i + 1, stages.len(), stage.id))
            .collect();

        Self {
            state: SyncState::new(chain, db, protocol, block_dbs, config, is_beacon),
            stages,
            revert_order,
            cleanup_order,
            current_stage: 0,
            prev_revert_point: None,
            timings: Vec::new(),
            log_prefixes,
        }
    }

    /// Replace the worker scratch databases.
    pub fn with_block_dbs(mut self, block_dbs: Vec<Arc<dyn Database>>) -> Self {
        self.state.set_block_dbs(block_dbs);
        self
    }

    /// The state shared with stage handlers.
    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Set the cancellation context propagated to stage handlers.
    pub fn set_context(&mut self, ctx: CancellationToken) {
        self.state.set_ctx(ctx);
    }

    /// Toggle long-range init sync mode.
    pub fn set_init_sync(&mut self, init_sync: bool) {
        self.state.set_init_sync(init_sync);
    }

    /// The timing entries recorded during the last cycle.
    pub fn timings(&self) -> &[Timing] {
        &self.timings
    }

    /// Index of the stage the engine is currently at.
    pub fn current_stage(&self) -> usize {
        self.current_stage
    }

    /// The revert point honoured during the last cycle, if any.
    pub fn prev_revert_point(&self) -> Option<BlockNumber> {
        self.prev_revert_point
    }

    /// Set the pending revert to be honoured at the next loop turn.
    pub fn revert_to(&self, revert_point: BlockNumber, invalid: BlockHash) {
        self.state.revert_to(revert_point, invalid);
    }

    /// Disable the given stages; their reverts and cleanups are skipped
    /// too.
    pub fn disable_stages(&mut self, ids: &[StageId]) {
        for stage in &mut self.stages {
            if ids.contains(&stage.id) {
                stage.disabled = true;
            }
        }
    }

    /// Re-enable the given stages.
    pub fn enable_stages(&mut self, ids: &[StageId]) {
        for stage in &mut self.stages {
            if ids.contains(&stage.id) {
                stage.disabled = false;
            }
        }
    }

    /// Disable every stage, returning the ids that were enabled.
    pub fn disable_all_stages(&mut self) -> Vec<StageId> {
        let enabled: Vec<StageId> =
            self.stages.iter().filter(|stage| !stage.disabled).map(|stage| stage.id).collect();
        for stage in &mut self.stages {
            stage.disabled = true;
        }
        enabled
    }

    /// Whether `first` comes before `second` in the forward order.
    pub fn is_before(&self, first: StageId, second: StageId) -> bool {
        self.stage_position(first) < self.stage_position(second)
    }

    /// Whether `first` comes after `second` in the forward order.
    pub fn is_after(&self, first: StageId, second: StageId) -> bool {
        self.stage_position(first) > self.stage_position(second)
    }

    fn stage_position(&self, id: StageId) -> i64 {
        self.stage_index(id).map_or(-1, |idx| idx as i64)
    }

    fn stage_index(&self, id: StageId) -> Option<usize> {
        self.stages.iter().position(|stage| stage.id == id)
    }

    fn set_current_stage(&mut self, id: StageId) -> Result<(), SyncError> {
        match self.stage_index(id) {
            Some(idx) => {
                self.current_stage = idx;
                Ok(())
            }
            None => {
                error!(target: "sync::stages", stage = %id, "stage not found");
                Err(SyncError::StageNotFound(id))
            }
        }
    }

    fn is_done(&self) -> bool {
        self.current_stage >= self.stages.len() && self.state.pending_revert_point().is_none()
    }

    fn check_have_enough_streams(&self) -> Result<(), SyncError> {
        let actual = self.state.protocol().num_streams();
        let min = self.state.config().min_streams.max(1);
        if actual < min {
            return Err(RequestError::NotEnoughStreams { actual, min }.into())
        }
        Ok(())
    }

    /// Execute one sync cycle to completion.
    pub async fn run(&mut self, mut first_cycle: bool) -> Result<(), SyncError> {
        if self.stages.is_empty() {
            return Ok(())
        }
        self.check_have_enough_streams()?;

        let cycle_number = self.state.begin_cycle();
        metrics::record_cycle();
        debug!(target: "sync::stages", cycle = cycle_number, "starting sync cycle");

        self.prev_revert_point = None;
        self.timings.clear();
        self.current_stage = 0;
        let mut invalid_block_revert = false;

        while !self.is_done() {
            if self.state.ctx().is_cancelled() {
                return Err(StageError::Cancelled.into())
            }

            if let Some(revert_point) = self.state.pending_revert_point() {
                for id in self.revert_order.clone() {
                    // Ids missing from the permutation are skipped.
                    let Some(idx) = self.stage_index(id) else { continue };
                    if self.stages[idx].disabled {
                        continue
                    }
                    self.revert_stage(idx, revert_point, first_cycle).await?;
                }
                let (point, was_invalid) = self.state.take_revert();
                self.prev_revert_point = point;
                invalid_block_revert = was_invalid;
                self.set_current_stage(self.stages[0].id)?;
                first_cycle = false;
                continue
            }

            let idx = self.current_stage;
            if self.stages[idx].disabled {
                trace!(
                    target: "sync::stages",
                    stage = %self.stages[idx].id,
                    description = %self.stages[idx].disabled_description,
                    "stage disabled, skipping"
                );
                self.current_stage += 1;
                continue
            }

            self.run_stage(idx, first_cycle, invalid_block_revert).await?;
            self.current_stage += 1;
        }

        self.clean_up(0, first_cycle).await?;
        self.set_current_stage(self.stages[0].id)?;
        self.print_logs()?;
        self.current_stage = 0;
        Ok(())
    }

    async fn run_stage(
        &mut self,
        idx: usize,
        first_cycle: bool,
        invalid_block_revert: bool,
    ) -> Result<(), SyncError> {
        let started = Instant::now();
        let id = self.stages[idx].id;
        let stage_state = self.state.stage_state(id)?;

        let result = {
            let stage = &self.stages[idx];
            stage
                .handler
                .exec(first_cycle, invalid_block_revert, &stage_state, &self.state)
                .instrument(info_span!("Running", stage = %id))
                .await
        };
        if let Err(err) = result {
            error!(
                target: "sync::stages",
                prefix = %self.log_prefixes[idx],
                %err,
                "stage failed"
            );
            return Err(err.into())
        }

        info!(target: "sync::stages", stage = %id, "stage executed successfully");
        self.timings.push(Timing { stage: id, kind: TimingKind::Forward, took: started.elapsed() });
        Ok(())
    }

    async fn revert_stage(
        &mut self,
        idx: usize,
        revert_point: BlockNumber,
        first_cycle: bool,
    ) -> Result<(), SyncError> {
        let started = Instant::now();
        let id = self.stages[idx].id;
        let stage_state = self.state.stage_state(id)?;
        if stage_state.block_number <= revert_point {
            return Ok(())
        }

        self.current_stage = idx;
        let invalid = self.state.invalid_block();
        let revert = RevertState {
            id,
            revert_point,
            current_progress: stage_state.block_number,
            invalid_block_hash: if invalid.active { invalid.hash } else { BlockHash::ZERO },
        };

        let result = {
            let stage = &self.stages[idx];
            stage
                .handler
                .revert(first_cycle, &revert, &stage_state, &self.state)
                .instrument(info_span!("Reverting", stage = %id))
                .await
        };
        if let Err(err) = result {
            error!(
                target: "sync::stages",
                prefix = %self.log_prefixes[idx],
                %err,
                "stage revert failed"
            );
            return Err(err.into())
        }

        self.timings.push(Timing { stage: id, kind: TimingKind::Revert, took: started.elapsed() });
        Ok(())
    }

    /// Run the cleanup pass over `cleanup_order[from_stage..]`.
    ///
    /// A cleanup failure aborts the cycle with an error; persisted progress
    /// of earlier stages remains.
    async fn clean_up(&mut self, from_stage: usize, first_cycle: bool) -> Result<(), SyncError> {
        for id in self.cleanup_order.clone().into_iter().skip(from_stage) {
            // Ids missing from the permutation are skipped.
            let Some(idx) = self.stage_index(id) else { continue };
            if self.stages[idx].disabled {
                continue
            }
            self.cleanup_stage(idx, first_cycle).await?;
        }
        Ok(())
    }

    async fn cleanup_stage(&mut self, idx: usize, first_cycle: bool) -> Result<(), SyncError> {
        let started = Instant::now();
        let id = self.stages[idx].id;
        let stage_state = self.state.stage_state(id)?;
        let cleanup = CleanUpState {
            id,
            forward_progress: stage_state.block_number,
            cleanup_progress: self.state.cleanup_progress(id)?,
        };

        self.current_stage = idx;
        let result = {
            let stage = &self.stages[idx];
            stage
                .handler
                .clean_up(first_cycle, &cleanup, &self.state)
                .instrument(info_span!("CleaningUp", stage = %id))
                .await
        };
        if let Err(err) = result {
            error!(
                target: "sync::stages",
                prefix = %self.log_prefixes[idx],
                %err,
                "stage cleanup failed"
            );
            return Err(err.into())
        }

        self.timings.push(Timing { stage: id, kind: TimingKind::CleanUp, took: started.elapsed() });
        Ok(())
    }

    /// Flush slow timing entries and per-bucket sizes to the log.
    fn print_logs(&self) -> Result<(), SyncError> {
        let mut entries = Vec::new();
        for timing in &self.timings {
            if timing.took < TIMING_LOG_THRESHOLD {
                continue
            }
            if entries.len() == 50 {
                break
            }
            entries.push(format!("{} {:?}", timing.label(), timing.took));
        }
        if entries.is_empty() {
            return Ok(())
        }
        info!(target: "sync::stages", timings = ?entries, "cycle timings (slower than 50ms)");

        let view = self.state.db().begin_ro().map_err(StageError::from)?;
        let mut sizes = Vec::with_capacity(Bucket::ALL.len());
        for bucket in Bucket::ALL {
            let size = view.bucket_size(bucket).map_err(StageError::from)?;
            sizes.push(format!("{bucket}={}", byte_count(size)));
        }
        info!(target: "sync::stages", tables = ?sizes, "bucket sizes");
        view.collect_metrics();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::{DEFAULT_CLEANUP_ORDER, DEFAULT_REVERT_ORDER},
        stages::default_stages,
        test_utils::{
            encode_block, test_block, TestAction, TestChain, TestProtocol, TestStage,
        },
    };
    use strata_db::{block_number_key, DbTxMut};
    use strata_primitives::{Bytes, StreamId};

    fn test_config() -> Config {
        Config { concurrency: 2, blocks_per_request: 10, min_streams: 1, ..Default::default() }
    }

    fn engine_with(
        stages: Vec<Stage>,
        revert_order: Vec<StageId>,
        cleanup_order: Vec<StageId>,
        chain: Arc<TestChain>,
        protocol: Arc<TestProtocol>,
    ) -> StagedSync {
        StagedSync::new(
            stages,
            revert_order,
            cleanup_order,
            chain,
            Arc::new(MemDb::new()),
            protocol,
            test_config(),
            false,
            true,
        )
    }

    fn kinds(timings: &[Timing]) -> Vec<(StageId, TimingKind)> {
        timings.iter().map(|timing| (timing.stage, timing.kind)).collect()
    }

    #[tokio::test]
    async fn runs_stages_in_forward_order() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let heads = Arc::new(TestStage::new(StageId::Heads).add_exec(TestAction::Progress(20)));
        let bodies = Arc::new(TestStage::new(StageId::Bodies).add_exec(TestAction::Progress(10)));

        let mut engine = engine_with(
            vec![Stage::new(heads), Stage::new(bodies)],
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            protocol,
        );
        engine.run(true).await.unwrap();

        assert_eq!(
            kinds(engine.timings()),
            vec![
                (StageId::Heads, TimingKind::Forward),
                (StageId::Bodies, TimingKind::Forward),
                (StageId::Heads, TimingKind::CleanUp),
                (StageId::Bodies, TimingKind::CleanUp),
            ]
        );
        assert_eq!(engine.state().stage_progress(StageId::Heads).unwrap(), 20);
        assert_eq!(engine.state().stage_progress(StageId::Bodies).unwrap(), 10);
        assert_eq!(engine.current_stage(), 0);
        assert!(engine.state().pending_revert_point().is_none());
    }

    #[tokio::test]
    async fn revert_pass_resumes_forward_from_first_stage() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let heads = Arc::new(
            TestStage::new(StageId::Heads)
                .add_exec(TestAction::Progress(10))
                .add_exec(TestAction::Progress(10)),
        );
        let bodies = Arc::new(TestStage::new(StageId::Bodies).add_exec(TestAction::RevertTo {
            point: 0,
            number: 5,
            hash: BlockHash::repeat_byte(0x55),
            stream: StreamId(9),
        }));

        let mut engine = engine_with(
            vec![Stage::new(heads.clone()), Stage::new(bodies.clone())],
            vec![StageId::Bodies, StageId::Heads],
            vec![StageId::Heads, StageId::Bodies],
            chain,
            protocol,
        );
        engine.run(true).await.unwrap();

        assert_eq!(
            kinds(engine.timings()),
            vec![
                (StageId::Heads, TimingKind::Forward),
                (StageId::Bodies, TimingKind::Forward),
                (StageId::Heads, TimingKind::Revert),
                (StageId::Heads, TimingKind::Forward),
                (StageId::Bodies, TimingKind::Forward),
                (StageId::Heads, TimingKind::CleanUp),
                (StageId::Bodies, TimingKind::CleanUp),
            ]
        );
        // The invalid-block flag reaches the forward pass after the revert.
        assert_eq!(*bodies.invalid_flags.lock(), vec![false, true]);
        assert_eq!(engine.prev_revert_point(), Some(0));
        assert_eq!(engine.current_stage(), 0);
        assert!(engine.state().pending_revert_point().is_none());
        // The record survives deactivated for the re-download path.
        let invalid = engine.state().invalid_block();
        assert!(!invalid.active);
        assert_eq!(invalid.number, 5);
        assert_eq!(invalid.stream_ids, vec![StreamId(9)]);
    }

    #[tokio::test]
    async fn cleanup_runs_in_declared_order() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let stages = vec![
            Stage::new(Arc::new(TestStage::new(StageId::Heads))),
            Stage::new(Arc::new(TestStage::new(StageId::Bodies))),
            Stage::new(Arc::new(TestStage::new(StageId::States))),
        ];

        let mut engine = engine_with(
            stages,
            vec![StageId::States, StageId::Bodies, StageId::Heads],
            vec![StageId::States, StageId::Heads, StageId::Bodies],
            chain,
            protocol,
        );
        engine.run(true).await.unwrap();

        let cleanups: Vec<StageId> = engine
            .timings()
            .iter()
            .filter(|timing| timing.kind == TimingKind::CleanUp)
            .map(|timing| timing.stage)
            .collect();
        assert_eq!(cleanups, vec![StageId::States, StageId::Heads, StageId::Bodies]);
    }

    #[tokio::test]
    async fn disabled_stage_is_skipped_but_advanced() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let stages = vec![
            Stage::new(Arc::new(TestStage::new(StageId::Heads).add_exec(TestAction::Progress(3)))),
            Stage::new(Arc::new(TestStage::new(StageId::Bodies))),
        ];

        let mut engine = engine_with(
            stages,
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            protocol,
        );
        engine.disable_stages(&[StageId::Bodies]);
        engine.run(true).await.unwrap();

        assert!(engine.timings().iter().all(|timing| timing.stage != StageId::Bodies));
        assert_eq!(engine.state().stage_progress(StageId::Heads).unwrap(), 3);
        assert_eq!(engine.current_stage(), 0);
    }

    #[tokio::test]
    async fn preflight_refuses_without_streams() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        protocol.set_num_streams(0);
        let stages = vec![Stage::new(Arc::new(TestStage::new(StageId::Heads)))];

        // Even a zero minimum refuses to sync against zero streams.
        let mut engine = StagedSync::new(
            stages,
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            Arc::new(MemDb::new()),
            protocol,
            Config { min_streams: 0, ..test_config() },
            false,
            true,
        );
        let err = engine.run(true).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Request(RequestError::NotEnoughStreams { actual: 0, .. })
        ));
    }

    #[tokio::test]
    async fn stage_error_aborts_the_cycle() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let stages = vec![
            Stage::new(Arc::new(TestStage::new(StageId::Heads).add_exec(TestAction::Progress(5)))),
            Stage::new(Arc::new(TestStage::new(StageId::Bodies).add_exec(TestAction::Error(
                StageError::ReadHashesFailed("hash index not built".into()),
            )))),
        ];

        let mut engine = engine_with(
            stages,
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            protocol,
        );
        let err = engine.run(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Stage(StageError::ReadHashesFailed(_))));

        // Progress persisted by earlier stages remains.
        assert_eq!(engine.state().stage_progress(StageId::Heads).unwrap(), 5);
        assert_eq!(kinds(engine.timings()), vec![(StageId::Heads, TimingKind::Forward)]);
    }

    #[tokio::test]
    async fn cancelled_context_aborts_the_cycle() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let stages = vec![Stage::new(Arc::new(TestStage::new(StageId::Heads)))];

        let mut engine = engine_with(
            stages,
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            protocol,
        );
        let ctx = CancellationToken::new();
        engine.set_context(ctx.clone());
        ctx.cancel();

        let err = engine.run(true).await.unwrap_err();
        assert!(matches!(err, SyncError::Stage(StageError::Cancelled)));
    }

    #[tokio::test]
    async fn position_queries_follow_forward_order() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let stages = vec![
            Stage::new(Arc::new(TestStage::new(StageId::Heads))),
            Stage::new(Arc::new(TestStage::new(StageId::Bodies))),
        ];
        let engine = engine_with(
            stages,
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            protocol,
        );

        assert!(engine.is_before(StageId::Heads, StageId::Bodies));
        assert!(engine.is_after(StageId::Bodies, StageId::Heads));
        // Ids not in the pipeline sort before everything.
        assert!(engine.is_before(StageId::States, StageId::Heads));
    }

    #[tokio::test]
    async fn disable_all_returns_previously_enabled() {
        let chain = Arc::new(TestChain::new(0));
        let protocol = Arc::new(TestProtocol::default());
        let stages = vec![
            Stage::new(Arc::new(TestStage::new(StageId::Heads))),
            Stage::new(Arc::new(TestStage::new(StageId::Bodies))),
        ];
        let mut engine = engine_with(
            stages,
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain,
            protocol,
        );
        engine.disable_stages(&[StageId::Bodies]);

        let enabled = engine.disable_all_stages();
        assert_eq!(enabled, vec![StageId::Heads]);

        engine.enable_stages(&[StageId::Heads, StageId::Bodies]);
        assert!(engine.disable_all_stages().contains(&StageId::Bodies));
    }

    fn chained_blocks(start: BlockNumber, end: BlockNumber) -> Vec<strata_primitives::Block> {
        let mut parent = BlockHash::repeat_byte(0xee);
        (start..=end)
            .map(|bn| {
                let block = test_block(bn, parent);
                parent = block.hash();
                block
            })
            .collect()
    }

    fn seed_pipeline(
        engine: &StagedSync,
        protocol: &TestProtocol,
        blocks: &[strata_primitives::Block],
    ) {
        let mut tx = engine.state().db().begin_rw().unwrap();
        for block in blocks {
            tx.put(
                Bucket::BlockHashes,
                &block_number_key(block.number()),
                Bytes::copy_from_slice(block.hash().as_slice()),
            )
            .unwrap();
            protocol.insert_block(
                block.number(),
                block.hash(),
                encode_block(block),
                Bytes::from_static(b"sig"),
            );
        }
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn full_pipeline_syncs_to_the_target() {
        let chain = Arc::new(TestChain::new(10));
        let protocol = Arc::new(TestProtocol::default());
        protocol.set_head(12);
        protocol.set_serving_stream(StreamId(1));

        let mut engine = StagedSync::new(
            default_stages(),
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain.clone(),
            Arc::new(MemDb::new()),
            protocol.clone(),
            test_config(),
            false,
            true,
        );
        seed_pipeline(&engine, &protocol, &chained_blocks(11, 12));

        engine.run(true).await.unwrap();

        assert_eq!(chain.inserted(), vec![11, 12]);
        assert_eq!(chain.current_block_number(), 12);
        assert_eq!(engine.state().stage_progress(StageId::Bodies).unwrap(), 12);
        assert!(engine
            .timings()
            .iter()
            .any(|timing| timing.stage == StageId::Bodies && timing.kind == TimingKind::Forward));
        assert_eq!(engine.current_stage(), 0);

        // The cleanup pass cleared the worker scratch databases.
        for block_db in engine.state().block_dbs() {
            let view = block_db.begin_ro().unwrap();
            assert_eq!(view.bucket_size(Bucket::Blocks).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn invalid_block_is_redownloaded_from_another_stream() {
        let chain = Arc::new(TestChain::new(10));
        let protocol = Arc::new(TestProtocol::default());
        protocol.set_head(12);
        protocol.set_serving_stream(StreamId(1));
        protocol.set_num_streams(2);

        let blocks = chained_blocks(11, 12);
        let bad = blocks[1].clone();
        chain.fail_verification(bad.hash(), 1);

        // Re-download attempts: first served by the blacklisted stream,
        // then by a fresh one.
        protocol.push_canned_by_number(
            vec![encode_block(&bad)],
            vec![Bytes::from_static(b"sig")],
            StreamId(1),
        );
        protocol.push_canned_by_number(
            vec![encode_block(&bad)],
            vec![Bytes::from_static(b"sig")],
            StreamId(2),
        );

        let mut engine = StagedSync::new(
            default_stages(),
            DEFAULT_REVERT_ORDER.to_vec(),
            DEFAULT_CLEANUP_ORDER.to_vec(),
            chain.clone(),
            Arc::new(MemDb::new()),
            protocol.clone(),
            test_config(),
            false,
            true,
        );
        seed_pipeline(&engine, &protocol, &blocks);

        engine.run(true).await.unwrap();

        assert_eq!(chain.inserted(), vec![11, 12]);
        assert_eq!(chain.current_block_number(), 12);
        assert_eq!(engine.prev_revert_point(), Some(10));
        assert!(protocol.failed().contains(&StreamId(1)));

        let invalid = engine.state().invalid_block();
        assert!(!invalid.active);
        assert_eq!(invalid.number, 12);
        assert_eq!(invalid.stream_ids, vec![StreamId(1)]);
        assert_eq!(engine.current_stage(), 0);
        assert!(engine.state().pending_revert_point().is_none());
    }
}
