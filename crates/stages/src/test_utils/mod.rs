//! Test primitives for staged sync: scripted stages, a scripted transport,
//! and an in-memory chain store.

use crate::{
    config::Config,
    error::StageError,
    id::StageId,
    stage::StageHandler,
    state::{CleanUpState, RevertState, StageState, SyncState},
};
use alloy_rlp::Decodable;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};
use strata_db::{block_number_key, mem::MemDb, Bucket, Database, DbTxMut};
use strata_interfaces::{
    chain::{BlockValidationError, ChainError, ChainStore},
    p2p::{
        options::RequestOptions,
        protocol::{ProtocolError, ProtocolResult, SyncProtocol},
    },
};
use strata_primitives::{Block, BlockHash, BlockNumber, Bytes, Header, ShardId, StreamId};

/// A deterministic block at the given height.
pub fn test_block(number: BlockNumber, parent_hash: BlockHash) -> Block {
    Block::new(
        Header {
            parent_hash,
            number,
            timestamp: 1_700_000_000 + number,
            extra: Bytes::new(),
        },
        vec![Bytes::from_static(b"tx")],
    )
}

/// RLP-encode a block the way raw responses carry it.
pub fn encode_block(block: &Block) -> Bytes {
    Bytes::from(alloy_rlp::encode(block))
}

/// A sync state over in-memory storage, suitable for driving stages
/// directly.
pub fn test_state(chain: Arc<TestChain>, protocol: Arc<TestProtocol>) -> SyncState {
    test_state_with_config(
        chain,
        protocol,
        Config { concurrency: 2, min_streams: 0, ..Default::default() },
    )
}

/// Like [`test_state`] with an explicit config.
pub fn test_state_with_config(
    chain: Arc<TestChain>,
    protocol: Arc<TestProtocol>,
    config: Config,
) -> SyncState {
    let block_dbs: Vec<Arc<dyn Database>> = (0..config.concurrency.max(1))
        .map(|_| Arc::new(MemDb::new()) as Arc<dyn Database>)
        .collect();
    SyncState::new(chain, Arc::new(MemDb::new()), protocol, block_dbs, config, false)
}

/// Seed the hash index with `(number, hash)` entries.
pub fn seed_block_hashes(state: &SyncState, blocks: &[(BlockNumber, BlockHash, Bytes, Bytes)]) {
    let mut tx = state.db().begin_rw().unwrap();
    for (bn, hash, _, _) in blocks {
        tx.put(Bucket::BlockHashes, &block_number_key(*bn), Bytes::copy_from_slice(hash.as_slice()))
            .unwrap();
    }
    tx.commit().unwrap();
}

/// Store a block in a worker's scratch database.
pub fn store_worker_block(
    state: &SyncState,
    worker_id: usize,
    bn: BlockNumber,
    block_bytes: Bytes,
    sig_bytes: Bytes,
) {
    let mut tx = state.block_dbs()[worker_id].begin_rw().unwrap();
    let key = block_number_key(bn);
    tx.put(Bucket::Blocks, &key, block_bytes).unwrap();
    tx.put(Bucket::BlockSignatures, &key, sig_bytes).unwrap();
    tx.commit().unwrap();
}

/// One scripted behavior of a [`TestStage`] exec call.
#[derive(Debug)]
pub enum TestAction {
    /// Succeed without touching progress.
    Ok,
    /// Persist the given progress and succeed.
    Progress(BlockNumber),
    /// Fail with the given error.
    Error(StageError),
    /// Record an invalid block, request a revert, and succeed.
    RevertTo {
        /// The revert point.
        point: BlockNumber,
        /// The invalid block height.
        number: BlockNumber,
        /// The invalid block hash.
        hash: BlockHash,
        /// The stream that served the block.
        stream: StreamId,
    },
}

/// A stage whose behaviors are scripted per call. Unscripted calls succeed.
#[derive(Debug, Default)]
pub struct TestStage {
    id: Option<StageId>,
    exec_actions: Mutex<VecDeque<TestAction>>,
    revert_outputs: Mutex<VecDeque<Result<(), StageError>>>,
    cleanup_outputs: Mutex<VecDeque<Result<(), StageError>>>,
    /// The `invalid_block_revert` flag seen by each exec call.
    pub invalid_flags: Mutex<Vec<bool>>,
}

impl TestStage {
    /// A scripted stage under the given id.
    pub fn new(id: StageId) -> Self {
        Self { id: Some(id), ..Default::default() }
    }

    /// Queue the next exec behavior.
    pub fn add_exec(self, action: TestAction) -> Self {
        self.exec_actions.lock().push_back(action);
        self
    }

    /// Queue the next revert outcome.
    pub fn add_revert(self, output: Result<(), StageError>) -> Self {
        self.revert_outputs.lock().push_back(output);
        self
    }

    /// Queue the next cleanup outcome.
    pub fn add_clean_up(self, output: Result<(), StageError>) -> Self {
        self.cleanup_outputs.lock().push_back(output);
        self
    }

    fn stage_id(&self) -> StageId {
        self.id.expect("TestStage built without an id")
    }
}

#[async_trait]
impl StageHandler for Arc<TestStage> {
    fn id(&self) -> StageId {
        self.stage_id()
    }

    async fn exec(
        &self,
        _first_cycle: bool,
        invalid_block_revert: bool,
        _stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        self.invalid_flags.lock().push(invalid_block_revert);
        let action = self.exec_actions.lock().pop_front();
        match action {
            None | Some(TestAction::Ok) => Ok(()),
            Some(TestAction::Progress(progress)) => {
                state.save_stage_progress(self.stage_id(), progress)
            }
            Some(TestAction::Error(err)) => Err(err),
            Some(TestAction::RevertTo { point, number, hash, stream }) => {
                state.mark_invalid_block(number, hash, Some(stream));
                state.revert_to(point, hash);
                Ok(())
            }
        }
    }

    async fn revert(
        &self,
        _first_cycle: bool,
        revert: &RevertState,
        _stage: &StageState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        let output = self.revert_outputs.lock().pop_front();
        output.unwrap_or(Ok(()))?;
        revert.done(state)
    }

    async fn clean_up(
        &self,
        _first_cycle: bool,
        cleanup: &CleanUpState,
        state: &SyncState,
    ) -> Result<(), StageError> {
        let output = self.cleanup_outputs.lock().pop_front();
        output.unwrap_or(Ok(()))?;
        cleanup.done(state)
    }
}

/// A scripted sync transport.
///
/// Serves blocks out of in-memory maps, with optional injected failures and
/// canned raw responses consumed ahead of the lookup path.
#[derive(Debug)]
pub struct TestProtocol {
    head: AtomicU64,
    num_streams: AtomicUsize,
    serving_stream: Mutex<StreamId>,
    by_hash: Mutex<HashMap<BlockHash, (Bytes, Bytes)>>,
    by_number: Mutex<HashMap<BlockNumber, (Bytes, Bytes)>>,
    failures: Mutex<VecDeque<ProtocolError>>,
    canned_by_hashes: Mutex<VecDeque<(Vec<Bytes>, Vec<Bytes>, StreamId)>>,
    canned_by_number: Mutex<VecDeque<(Vec<Bytes>, Vec<Bytes>, StreamId)>>,
    failed_streams: Mutex<Vec<(StreamId, String)>>,
    removed_streams: Mutex<Vec<StreamId>>,
    calls: AtomicUsize,
}

impl Default for TestProtocol {
    fn default() -> Self {
        Self {
            head: AtomicU64::new(0),
            num_streams: AtomicUsize::new(1),
            serving_stream: Mutex::new(StreamId(1)),
            by_hash: Mutex::new(HashMap::new()),
            by_number: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            canned_by_hashes: Mutex::new(VecDeque::new()),
            canned_by_number: Mutex::new(VecDeque::new()),
            failed_streams: Mutex::new(Vec::new()),
            removed_streams: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TestProtocol {
    /// Set the head height returned by probes.
    pub fn set_head(&self, head: BlockNumber) {
        self.head.store(head, Ordering::Relaxed);
    }

    /// Set the reported stream count.
    pub fn set_num_streams(&self, count: usize) {
        self.num_streams.store(count, Ordering::Relaxed);
    }

    /// Set the stream id stamped on lookup responses.
    pub fn set_serving_stream(&self, stream_id: StreamId) {
        *self.serving_stream.lock() = stream_id;
    }

    /// Serve the given block for both by-number and by-hash lookups.
    pub fn insert_block(&self, bn: BlockNumber, hash: BlockHash, block: Bytes, sig: Bytes) {
        self.by_hash.lock().insert(hash, (block.clone(), sig.clone()));
        self.by_number.lock().insert(bn, (block, sig));
    }

    /// Fail the next raw request with the given error.
    pub fn push_failure(&self, err: ProtocolError) {
        self.failures.lock().push_back(err);
    }

    /// Answer the next raw by-hashes request with a canned response.
    pub fn push_canned_by_hashes(&self, blocks: Vec<Bytes>, sigs: Vec<Bytes>, stream_id: StreamId) {
        self.canned_by_hashes.lock().push_back((blocks, sigs, stream_id));
    }

    /// Answer the next raw by-number request with a canned response.
    pub fn push_canned_by_number(&self, blocks: Vec<Bytes>, sigs: Vec<Bytes>, stream_id: StreamId) {
        self.canned_by_number.lock().push_back((blocks, sigs, stream_id));
    }

    /// Streams reported failed, in order.
    pub fn failed(&self) -> Vec<StreamId> {
        self.failed_streams.lock().iter().map(|(stream_id, _)| *stream_id).collect()
    }

    /// Streams removed, in order.
    pub fn removed(&self) -> Vec<StreamId> {
        self.removed_streams.lock().clone()
    }

    /// How many transport queries were issued.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn serving(&self) -> StreamId {
        *self.serving_stream.lock()
    }

    fn raw_response(
        &self,
        canned: &Mutex<VecDeque<(Vec<Bytes>, Vec<Bytes>, StreamId)>>,
        lookup: impl Fn() -> (Vec<Bytes>, Vec<Bytes>),
    ) -> ProtocolResult<(Vec<Bytes>, Vec<Bytes>, StreamId)> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err)
        }
        if let Some(response) = canned.lock().pop_front() {
            return Ok(response)
        }
        let (blocks, sigs) = lookup();
        Ok((blocks, sigs, self.serving()))
    }
}

#[async_trait]
impl SyncProtocol for TestProtocol {
    async fn get_current_block_number(
        &self,
        _opts: RequestOptions,
    ) -> ProtocolResult<(BlockNumber, StreamId)> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok((self.head.load(Ordering::Relaxed), self.serving()))
    }

    async fn get_blocks_by_number(
        &self,
        bns: Vec<BlockNumber>,
        _opts: RequestOptions,
    ) -> ProtocolResult<(Vec<Option<Block>>, StreamId)> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let by_number = self.by_number.lock();
        let blocks = bns
            .iter()
            .map(|bn| {
                by_number.get(bn).and_then(|(bytes, sig)| {
                    let mut block = Block::decode(&mut bytes.as_ref()).ok()?;
                    if !sig.is_empty() {
                        block.set_commit_sig(sig.clone());
                    }
                    Some(block)
                })
            })
            .collect();
        Ok((blocks, self.serving()))
    }

    async fn get_raw_blocks_by_number(
        &self,
        bns: Vec<BlockNumber>,
        _opts: RequestOptions,
    ) -> ProtocolResult<(Vec<Bytes>, Vec<Bytes>, StreamId)> {
        self.raw_response(&self.canned_by_number, || {
            let by_number = self.by_number.lock();
            bns.iter()
                .map(|bn| by_number.get(bn).cloned().unwrap_or_default())
                .unzip()
        })
    }

    async fn get_raw_blocks_by_hashes(
        &self,
        hashes: Vec<BlockHash>,
        _opts: RequestOptions,
    ) -> ProtocolResult<(Vec<Bytes>, Vec<Bytes>, StreamId)> {
        self.raw_response(&self.canned_by_hashes, || {
            let by_hash = self.by_hash.lock();
            hashes
                .iter()
                .map(|hash| by_hash.get(hash).cloned().unwrap_or_default())
                .unzip()
        })
    }

    fn num_streams(&self) -> usize {
        self.num_streams.load(Ordering::Relaxed)
    }

    fn stream_failed(&self, stream_id: StreamId, reason: &str) {
        self.failed_streams.lock().push((stream_id, reason.to_string()));
    }

    fn remove_stream(&self, stream_id: StreamId) {
        self.removed_streams.lock().push(stream_id);
    }
}

/// An in-memory chain store with scripted verification failures.
#[derive(Debug)]
pub struct TestChain {
    shard_id: ShardId,
    head: AtomicU64,
    inserted: Mutex<Vec<BlockNumber>>,
    fail_verify: Mutex<HashMap<BlockHash, usize>>,
}

impl TestChain {
    /// A chain at the given head height.
    pub fn new(head: BlockNumber) -> Self {
        Self {
            shard_id: 0,
            head: AtomicU64::new(head),
            inserted: Mutex::new(Vec::new()),
            fail_verify: Mutex::new(HashMap::new()),
        }
    }

    /// Make verification of the given hash fail `times` times.
    pub fn fail_verification(&self, hash: BlockHash, times: usize) {
        self.fail_verify.lock().insert(hash, times);
    }

    /// The heights accepted by `insert_block`, in order.
    pub fn inserted(&self) -> Vec<BlockNumber> {
        self.inserted.lock().clone()
    }

    /// The current head height.
    pub fn current_block_number(&self) -> BlockNumber {
        self.head.load(Ordering::Relaxed)
    }
}

impl ChainStore for TestChain {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn current_block_number(&self) -> BlockNumber {
        self.head.load(Ordering::Relaxed)
    }

    fn verify_block(&self, block: &Block) -> Result<(), BlockValidationError> {
        let mut fail_verify = self.fail_verify.lock();
        if let Some(budget) = fail_verify.get_mut(&block.hash()) {
            if *budget > 0 {
                *budget -= 1;
                return Err(BlockValidationError::InvalidCommitSig { number: block.number() })
            }
        }
        Ok(())
    }

    fn insert_block(&self, block: Block) -> Result<BlockNumber, ChainError> {
        let number = block.number();
        self.head.store(number, Ordering::Relaxed);
        self.inserted.lock().push(number);
        Ok(number)
    }
}
