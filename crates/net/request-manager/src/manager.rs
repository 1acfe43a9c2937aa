use crate::{config::RequestManagerConfig, queues::RequestQueues, stream::StreamEntry};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use strata_interfaces::p2p::{
    error::RequestError,
    options::RequestOptions,
    priority::Priority,
    protocol::ProtocolError,
    request::{Request, RequestId, Response},
    stream::{StreamEvent, StreamManager, SyncStream},
};
use strata_primitives::StreamId;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const NEW_REQUEST_BUFFER: usize = 128;
const DELIVERY_BUFFER: usize = 128;
const CANCEL_BUFFER: usize = 16;
const WRITE_FAILURE_BUFFER: usize = 16;

/// Outcome of a request: the response and the serving stream, or the
/// failure tagged with the stream it was assigned to, if any.
pub type RequestOutcome = Result<(Box<dyn Response>, StreamId), ProtocolError>;

struct NewRequest {
    token: u64,
    request: Box<dyn Request>,
    options: RequestOptions,
    respond_to: oneshot::Sender<RequestOutcome>,
}

struct ResponseData {
    stream_id: StreamId,
    response: Box<dyn Response>,
}

struct CancelRequest {
    token: u64,
    err: RequestError,
}

struct WriteFailure {
    req_id: RequestId,
    stream_id: StreamId,
    err: RequestError,
}

/// A request submitted by a caller but not yet assigned to a stream.
pub(crate) struct WaitingRequest {
    pub(crate) token: u64,
    request: Box<dyn Request>,
    options: RequestOptions,
    respond_to: oneshot::Sender<RequestOutcome>,
}

/// A request written to a stream and awaiting its response.
struct PendingRequest {
    token: u64,
    owner: StreamId,
    /// Taken when the caller has been signalled; the entry itself is
    /// reclaimed by the delivery, cancel, or stream-removal path.
    respond_to: Option<oneshot::Sender<RequestOutcome>>,
}

/// Handle to the stream request manager.
///
/// Serves each caller's abstract request by selecting a stream that
/// supports the request's protocol spec, writing the encoded request on
/// that stream, and pairing the eventual delivery with the caller. All
/// state lives in a dedicated event-loop task; the handle is cheap to share
/// and all operations are safe to call concurrently.
pub struct RequestManager {
    new_request_tx: mpsc::Sender<NewRequest>,
    delivery_tx: mpsc::Sender<ResponseData>,
    cancel_tx: mpsc::Sender<CancelRequest>,
    stop: CancellationToken,
    next_token: AtomicU64,
    deliver_timeout: Duration,
    event_loop: Mutex<Option<EventLoop>>,
}

impl fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestManager").field("closed", &self.stop.is_cancelled()).finish()
    }
}

impl RequestManager {
    /// Create a new request manager over the given stream pool.
    ///
    /// Subscribes to pool events at construction so streams added before
    /// [`start`](Self::start) are not missed.
    pub fn new(stream_manager: Arc<dyn StreamManager>, config: RequestManagerConfig) -> Self {
        let stream_events = stream_manager.subscribe();
        let (new_request_tx, new_request_rx) = mpsc::channel(NEW_REQUEST_BUFFER);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_BUFFER);
        let (cancel_tx, cancel_rx) = mpsc::channel(CANCEL_BUFFER);
        let (write_failure_tx, write_failure_rx) = mpsc::channel(WRITE_FAILURE_BUFFER);
        let stop = CancellationToken::new();

        let deliver_timeout = config.deliver_timeout;
        let state = ManagerState::new(stream_manager, write_failure_tx, config);
        let event_loop = EventLoop {
            state,
            new_request_rx,
            delivery_rx,
            cancel_rx,
            write_failure_rx,
            stream_events,
            stop: stop.clone(),
        };

        Self {
            new_request_tx,
            delivery_tx,
            cancel_tx,
            stop,
            next_token: AtomicU64::new(0),
            deliver_timeout,
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    /// Launch the event loop. Subsequent calls are no-ops.
    pub fn start(&self) {
        if let Some(event_loop) = self.event_loop.lock().take() {
            tokio::spawn(event_loop.run());
        }
    }

    /// Stop the event loop.
    ///
    /// Every pending request is failed with [`RequestError::Closed`] and
    /// subsequent [`do_request`](Self::do_request) calls fail the same way.
    pub fn close(&self) {
        self.stop.cancel();
    }

    /// Issue a request and wait for its delivery, a failure, or `ctx`
    /// cancellation.
    pub async fn do_request(
        &self,
        ctx: &CancellationToken,
        request: Box<dyn Request>,
        options: RequestOptions,
    ) -> RequestOutcome {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (respond_to, response) = oneshot::channel();
        self.new_request_tx
            .send(NewRequest { token, request, options, respond_to })
            .await
            .map_err(|_| ProtocolError::from(RequestError::Closed))?;

        tokio::select! {
            _ = ctx.cancelled() => {
                let cancel_tx = self.cancel_tx.clone();
                tokio::spawn(async move {
                    let _ = cancel_tx
                        .send(CancelRequest { token, err: RequestError::Cancelled })
                        .await;
                });
                Err(RequestError::Cancelled.into())
            }
            outcome = response => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(RequestError::Closed.into()),
            },
        }
    }

    /// Deliver an inbound response frame to the corresponding request.
    ///
    /// Non-blocking: the frame is handed to the event loop through a
    /// bounded buffer and dropped with a warning if the loop does not drain
    /// it within the configured deliver timeout.
    pub fn deliver_response(&self, stream_id: StreamId, response: Box<dyn Response>) {
        let delivery_tx = self.delivery_tx.clone();
        let timeout = self.deliver_timeout;
        tokio::spawn(async move {
            if delivery_tx.send_timeout(ResponseData { stream_id, response }, timeout).await.is_err()
            {
                warn!(
                    target: "net::request_manager",
                    %stream_id,
                    "delivery timeout, response dropped"
                );
            }
        });
    }
}

struct EventLoop {
    state: ManagerState,
    new_request_rx: mpsc::Receiver<NewRequest>,
    delivery_rx: mpsc::Receiver<ResponseData>,
    cancel_rx: mpsc::Receiver<CancelRequest>,
    write_failure_rx: mpsc::Receiver<WriteFailure>,
    stream_events: broadcast::Receiver<StreamEvent>,
    stop: CancellationToken,
}

impl EventLoop {
    async fn run(self) {
        let EventLoop {
            mut state,
            mut new_request_rx,
            mut delivery_rx,
            mut cancel_rx,
            mut write_failure_rx,
            mut stream_events,
            stop,
        } = self;

        // Catch streams connected before the loop launched.
        state.refresh_streams();

        let mut ticker = interval(state.config.throttle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    state.close();
                    info!(target: "net::request_manager", "request manager stopped");
                    return
                }
                _ = ticker.tick() => state.assign_waitings(),
                Some(new) = new_request_rx.recv() => {
                    if state.handle_new_request(new) {
                        state.assign_waitings();
                    }
                }
                Some(data) = delivery_rx.recv() => state.handle_delivery(data),
                Some(cancel) = cancel_rx.recv() => state.handle_cancel(cancel),
                Some(failure) = write_failure_rx.recv() => state.handle_write_failure(failure),
                event = stream_events.recv(), if events_open => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => state.refresh_streams(),
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },
            }
        }
    }
}

/// The maps and queues owned by the event loop.
struct ManagerState {
    /// Every known live stream.
    streams: HashMap<StreamId, StreamEntry>,
    /// Streams with no in-flight request.
    available: HashSet<StreamId>,
    /// Requests written to a stream and awaiting response.
    pendings: HashMap<RequestId, PendingRequest>,
    /// Requests not yet assigned to a stream.
    waitings: RequestQueues,
    stream_manager: Arc<dyn StreamManager>,
    write_failure_tx: mpsc::Sender<WriteFailure>,
    config: RequestManagerConfig,
}

impl ManagerState {
    fn new(
        stream_manager: Arc<dyn StreamManager>,
        write_failure_tx: mpsc::Sender<WriteFailure>,
        config: RequestManagerConfig,
    ) -> Self {
        Self {
            streams: HashMap::new(),
            available: HashSet::new(),
            pendings: HashMap::new(),
            waitings: RequestQueues::new(config.waiting_capacity),
            stream_manager,
            write_failure_tx,
            config,
        }
    }

    /// Queue a submitted request. Returns whether it was accepted.
    fn handle_new_request(&mut self, new: NewRequest) -> bool {
        let NewRequest { token, request, options, respond_to } = new;
        let priority = options.priority();
        debug!(target: "net::request_manager", token, "add new outgoing request to waiting queue");
        match self.waitings.push(WaitingRequest { token, request, options, respond_to }, priority) {
            Ok(()) => true,
            Err(rejected) => {
                warn!(target: "net::request_manager", token, "waiting queue full, rejecting request");
                let _ = rejected.respond_to.send(Err(RequestError::QueueFull.into()));
                false
            }
        }
    }

    /// One throttle pulse: attempt up to `throttle_batch` assignments.
    fn assign_waitings(&mut self) {
        for _ in 0..self.config.throttle_batch {
            let Some((req, stream_id)) = self.next_request() else { break };
            self.dispatch(req, stream_id);
        }
    }

    /// Pop the next live waiting request together with a stream that can
    /// serve it.
    fn next_request(&mut self) -> Option<(WaitingRequest, StreamId)> {
        loop {
            let req = self.waitings.pop()?;
            if req.respond_to.is_closed() {
                // Caller gave up while the request was queued.
                continue
            }
            match self.pick_available_stream(&req) {
                Some(stream_id) => return Some((req, stream_id)),
                None => {
                    debug!(
                        target: "net::request_manager",
                        token = req.token,
                        "no available stream fits request"
                    );
                    if let Err(rejected) = self.waitings.push(req, Priority::High) {
                        let _ = rejected.respond_to.send(Err(RequestError::QueueFull.into()));
                    }
                    return None
                }
            }
        }
    }

    fn pick_available_stream(&self, req: &WaitingRequest) -> Option<StreamId> {
        for id in self.available.iter().copied() {
            if !req.options.is_stream_allowed(id) {
                continue
            }
            let Some(entry) = self.streams.get(&id) else { continue };
            if entry.req.is_some() {
                continue
            }
            if req.request.is_supported_by(&entry.inner.proto_spec()) {
                return Some(id)
            }
        }
        None
    }

    /// Assign a request to a stream and fire the write.
    fn dispatch(&mut self, req: WaitingRequest, stream_id: StreamId) {
        let req_id = gen_req_id(&self.pendings, rand::random);
        let stream = match self.streams.get_mut(&stream_id) {
            Some(entry) => {
                entry.req = Some(req_id);
                entry.inner.clone()
            }
            None => {
                if let Err(rejected) = self.waitings.push(req, Priority::High) {
                    let _ = rejected.respond_to.send(Err(RequestError::QueueFull.into()));
                }
                return
            }
        };
        self.available.remove(&stream_id);
        debug!(target: "net::request_manager", %req_id, %stream_id, "assigning request to stream");

        let encoded = req.request.encode_with_id(req_id);
        self.pendings.insert(
            req_id,
            PendingRequest { token: req.token, owner: stream_id, respond_to: Some(req.respond_to) },
        );

        match encoded {
            Ok(bytes) => {
                let write_failure_tx = self.write_failure_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = stream.write_bytes(bytes).await {
                        warn!(
                            target: "net::request_manager",
                            %stream_id,
                            %err,
                            "write bytes failed"
                        );
                        let _ =
                            write_failure_tx.send(WriteFailure { req_id, stream_id, err }).await;
                    }
                });
            }
            Err(err) => {
                warn!(target: "net::request_manager", %req_id, %err, "request encode error");
                self.fail_write(req_id, stream_id, err);
            }
        }
    }

    fn handle_delivery(&mut self, data: ResponseData) {
        let req_id = data.response.req_id();
        if let Err(reason) = self.validate_delivery(data.stream_id, req_id) {
            debug!(
                target: "net::request_manager",
                %req_id,
                stream_id = %data.stream_id,
                reason,
                "dropping stale delivery"
            );
            return
        }
        if let Some(mut pending) = self.pendings.remove(&req_id) {
            if let Some(respond_to) = pending.respond_to.take() {
                let _ = respond_to.send(Ok((data.response, data.stream_id)));
            }
            self.release_stream(data.stream_id);
        }
    }

    fn validate_delivery(&self, stream_id: StreamId, req_id: RequestId) -> Result<(), &'static str> {
        let Some(entry) = self.streams.get(&stream_id) else {
            return Err("data delivered from dead stream")
        };
        let Some(pending) = self.pendings.get(&req_id) else {
            return Err("no pending request with this id")
        };
        if pending.owner != stream_id {
            return Err("unexpected delivery stream")
        }
        if entry.req != Some(req_id) {
            // Possible when the request was cancelled.
            return Err("request no longer assigned to stream")
        }
        Ok(())
    }

    fn handle_cancel(&mut self, cancel: CancelRequest) {
        let CancelRequest { token, err } = cancel;
        if let Some(req) = self.waitings.remove(token) {
            let _ = req.respond_to.send(Err(err.into()));
            return
        }
        let req_id = self.pendings.iter().find_map(|(id, p)| (p.token == token).then_some(*id));
        if let Some(req_id) = req_id {
            if let Some(mut pending) = self.pendings.remove(&req_id) {
                let owner = pending.owner;
                if let Some(respond_to) = pending.respond_to.take() {
                    let _ = respond_to.send(Err(ProtocolError::on_stream(err, owner)));
                }
                self.release_stream(owner);
            }
        }
    }

    fn handle_write_failure(&mut self, failure: WriteFailure) {
        let WriteFailure { req_id, stream_id, err } = failure;
        self.fail_write(req_id, stream_id, err);
    }

    /// Signal the caller about a failed write. The request stays owned by
    /// the stream until the delivery, cancel, or stream-removal path
    /// reclaims it.
    fn fail_write(&mut self, req_id: RequestId, stream_id: StreamId, err: RequestError) {
        if let Some(pending) = self.pendings.get_mut(&req_id) {
            if pending.owner == stream_id {
                if let Some(respond_to) = pending.respond_to.take() {
                    let _ = respond_to.send(Err(ProtocolError::on_stream(err, stream_id)));
                }
            }
        }
    }

    /// Mark a stream idle again.
    fn release_stream(&mut self, stream_id: StreamId) {
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.req = None;
            self.available.insert(stream_id);
        }
    }

    /// Reconcile against the stream pool snapshot to catch missed events.
    fn refresh_streams(&mut self) {
        let mut target: HashMap<StreamId, Arc<dyn SyncStream>> =
            self.stream_manager.streams().into_iter().map(|st| (st.id(), st)).collect();

        let removed: Vec<StreamId> =
            self.streams.keys().filter(|id| !target.contains_key(id)).copied().collect();
        for stream_id in removed {
            info!(target: "net::request_manager", %stream_id, "removing stream");
            self.remove_stream(stream_id);
        }
        for (stream_id, stream) in target.drain() {
            if !self.streams.contains_key(&stream_id) {
                info!(target: "net::request_manager", %stream_id, "adding new stream");
                self.streams.insert(stream_id, StreamEntry::new(stream));
                self.available.insert(stream_id);
            }
        }
    }

    /// Drop a stream; an in-flight request on it is failed with
    /// `StreamRemoved`.
    fn remove_stream(&mut self, stream_id: StreamId) {
        self.available.remove(&stream_id);
        let Some(entry) = self.streams.remove(&stream_id) else { return };
        if let Some(req_id) = entry.req {
            if let Some(mut pending) = self.pendings.remove(&req_id) {
                if let Some(respond_to) = pending.respond_to.take() {
                    let _ = respond_to
                        .send(Err(ProtocolError::on_stream(RequestError::StreamRemoved, stream_id)));
                }
            }
        }
    }

    /// Fail every pending request and reset all state.
    fn close(&mut self) {
        for (_, mut pending) in self.pendings.drain() {
            if let Some(respond_to) = pending.respond_to.take() {
                let _ = respond_to.send(Err(RequestError::Closed.into()));
            }
        }
        self.streams.clear();
        self.available.clear();
        self.waitings.clear();
    }
}

/// Generate a request id not currently in `pendings`.
fn gen_req_id(
    pendings: &HashMap<RequestId, PendingRequest>,
    mut gen: impl FnMut() -> RequestId,
) -> RequestId {
    loop {
        let id = gen();
        if !pendings.contains_key(&id) {
            return id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::{any::Any, collections::VecDeque};
    use strata_interfaces::p2p::{error::RequestResult, request::ProtoSpec};
    use strata_primitives::Bytes;

    #[derive(Debug)]
    struct TestStream {
        id: StreamId,
        shard_id: u32,
        fail_writes: bool,
        writes: parking_lot::Mutex<Vec<Bytes>>,
    }

    impl TestStream {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: StreamId(id),
                shard_id: 0,
                fail_writes: false,
                writes: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn failing(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id: StreamId(id),
                shard_id: 0,
                fail_writes: true,
                writes: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn last_req_id(&self) -> Option<RequestId> {
            self.writes
                .lock()
                .last()
                .map(|bytes| u64::from_be_bytes(bytes[..8].try_into().unwrap()))
        }
    }

    #[async_trait]
    impl SyncStream for TestStream {
        fn id(&self) -> StreamId {
            self.id
        }

        fn proto_spec(&self) -> ProtoSpec {
            ProtoSpec { shard_id: self.shard_id, version: 1 }
        }

        async fn write_bytes(&self, bytes: Bytes) -> RequestResult<()> {
            if self.fail_writes {
                return Err(RequestError::WriteFailed("refused".into()))
            }
            self.writes.lock().push(bytes);
            Ok(())
        }
    }

    struct TestStreamManager {
        streams: parking_lot::Mutex<Vec<Arc<dyn SyncStream>>>,
        events: broadcast::Sender<StreamEvent>,
    }

    impl TestStreamManager {
        fn new() -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self { streams: parking_lot::Mutex::new(Vec::new()), events })
        }

        fn add(&self, stream: Arc<dyn SyncStream>) {
            let id = stream.id();
            self.streams.lock().push(stream);
            let _ = self.events.send(StreamEvent::Added(id));
        }

        fn remove(&self, id: StreamId) {
            self.streams.lock().retain(|stream| stream.id() != id);
            let _ = self.events.send(StreamEvent::Removed(id));
        }
    }

    impl StreamManager for TestStreamManager {
        fn streams(&self) -> Vec<Arc<dyn SyncStream>> {
            self.streams.lock().clone()
        }

        fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
            self.events.subscribe()
        }
    }

    #[derive(Debug, Default)]
    struct TestRequest;

    impl Request for TestRequest {
        fn encode_with_id(&self, req_id: RequestId) -> RequestResult<Bytes> {
            Ok(Bytes::copy_from_slice(&req_id.to_be_bytes()))
        }

        fn is_supported_by(&self, _spec: &ProtoSpec) -> bool {
            true
        }
    }

    #[derive(Debug)]
    struct TestResponse {
        req_id: RequestId,
    }

    impl Response for TestResponse {
        fn req_id(&self) -> RequestId {
            self.req_id
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    fn pending(token: u64) -> PendingRequest {
        PendingRequest { token, owner: StreamId(0), respond_to: None }
    }

    async fn wait_for_req_id(stream: &TestStream) -> RequestId {
        for _ in 0..1_000 {
            if let Some(req_id) = stream.last_req_id() {
                return req_id
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("request never written to stream");
    }

    /// Let the event loop drain whatever is queued.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    #[test]
    fn gen_req_id_skips_pending_ids() {
        let mut pendings = HashMap::new();
        pendings.insert(1, pending(10));
        pendings.insert(2, pending(11));
        pendings.insert(3, pending(12));

        let mut scripted = VecDeque::from([1u64, 2, 3, 4]);
        let id = gen_req_id(&mut pendings, || scripted.pop_front().unwrap());
        assert_eq!(id, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_matched_response() {
        let sm = TestStreamManager::new();
        let stream = TestStream::new(1);
        sm.add(stream.clone());

        let rm = Arc::new(RequestManager::new(sm.clone(), RequestManagerConfig::default()));
        rm.start();

        let issued = tokio::spawn({
            let rm = rm.clone();
            async move {
                rm.do_request(
                    &CancellationToken::new(),
                    Box::new(TestRequest),
                    RequestOptions::new(),
                )
                .await
            }
        });

        let req_id = wait_for_req_id(&stream).await;
        rm.deliver_response(StreamId(1), Box::new(TestResponse { req_id }));

        let (response, stream_id) = issued.await.unwrap().unwrap();
        assert_eq!(stream_id, StreamId(1));
        assert_eq!(response.req_id(), req_id);
    }

    #[tokio::test(start_paused = true)]
    async fn request_waits_until_stream_appears() {
        let sm = TestStreamManager::new();
        let rm = Arc::new(RequestManager::new(sm.clone(), RequestManagerConfig::default()));
        rm.start();

        let issued = tokio::spawn({
            let rm = rm.clone();
            async move {
                rm.do_request(
                    &CancellationToken::new(),
                    Box::new(TestRequest),
                    RequestOptions::new(),
                )
                .await
            }
        });

        // No streams yet; the request sits in the waiting queue.
        settle().await;
        assert!(!issued.is_finished());

        let stream = TestStream::new(7);
        sm.add(stream.clone());

        let req_id = wait_for_req_id(&stream).await;
        rm.deliver_response(StreamId(7), Box::new(TestResponse { req_id }));
        let (_, stream_id) = issued.await.unwrap().unwrap();
        assert_eq!(stream_id, StreamId(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_delivery_after_cancel_is_dropped() {
        let sm = TestStreamManager::new();
        let stream = TestStream::new(1);
        sm.add(stream.clone());

        let rm = Arc::new(RequestManager::new(sm.clone(), RequestManagerConfig::default()));
        rm.start();

        let ctx = CancellationToken::new();
        let issued = tokio::spawn({
            let rm = rm.clone();
            let ctx = ctx.clone();
            async move {
                rm.do_request(&ctx, Box::new(TestRequest), RequestOptions::new()).await
            }
        });

        let req_id = wait_for_req_id(&stream).await;
        ctx.cancel();
        let err = issued.await.unwrap().unwrap_err();
        assert_eq!(err.kind, RequestError::Cancelled);

        // The late response for the cancelled request is dropped and the
        // stream is usable again.
        settle().await;
        rm.deliver_response(StreamId(1), Box::new(TestResponse { req_id }));
        settle().await;

        let issued = tokio::spawn({
            let rm = rm.clone();
            async move {
                rm.do_request(
                    &CancellationToken::new(),
                    Box::new(TestRequest),
                    RequestOptions::new(),
                )
                .await
            }
        });
        let second_id = wait_for_req_id(&stream).await;
        assert_ne!(second_id, req_id);
        rm.deliver_response(StreamId(1), Box::new(TestResponse { req_id: second_id }));
        assert!(issued.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_removal_fails_inflight_request() {
        let sm = TestStreamManager::new();
        let stream = TestStream::new(3);
        sm.add(stream.clone());

        let rm = Arc::new(RequestManager::new(sm.clone(), RequestManagerConfig::default()));
        rm.start();

        let issued = tokio::spawn({
            let rm = rm.clone();
            async move {
                rm.do_request(
                    &CancellationToken::new(),
                    Box::new(TestRequest),
                    RequestOptions::new(),
                )
                .await
            }
        });

        wait_for_req_id(&stream).await;
        sm.remove(StreamId(3));

        let err = issued.await.unwrap().unwrap_err();
        assert_eq!(err.kind, RequestError::StreamRemoved);
        assert_eq!(err.stream_id, Some(StreamId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_signals_caller() {
        let sm = TestStreamManager::new();
        sm.add(TestStream::failing(9));

        let rm = Arc::new(RequestManager::new(sm.clone(), RequestManagerConfig::default()));
        rm.start();

        let err = rm
            .do_request(&CancellationToken::new(), Box::new(TestRequest), RequestOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err.kind, RequestError::WriteFailed(_)));
        assert_eq!(err.stream_id, Some(StreamId(9)));
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_pending_and_subsequent_requests() {
        let sm = TestStreamManager::new();
        let stream = TestStream::new(1);
        sm.add(stream.clone());

        let rm = Arc::new(RequestManager::new(sm.clone(), RequestManagerConfig::default()));
        rm.start();

        let issued = tokio::spawn({
            let rm = rm.clone();
            async move {
                rm.do_request(
                    &CancellationToken::new(),
                    Box::new(TestRequest),
                    RequestOptions::new(),
                )
                .await
            }
        });

        wait_for_req_id(&stream).await;
        rm.close();

        let err = issued.await.unwrap().unwrap_err();
        assert_eq!(err.kind, RequestError::Closed);

        let err = rm
            .do_request(&CancellationToken::new(), Box::new(TestRequest), RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RequestError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn full_waiting_queue_rejects_request() {
        let sm = TestStreamManager::new();
        let config = RequestManagerConfig { waiting_capacity: 0, ..Default::default() };
        let rm = Arc::new(RequestManager::new(sm.clone(), config));
        rm.start();

        let err = rm
            .do_request(&CancellationToken::new(), Box::new(TestRequest), RequestOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, RequestError::QueueFull);
    }

    fn test_state(sm: Arc<TestStreamManager>, config: RequestManagerConfig) -> ManagerState {
        let (write_failure_tx, _write_failure_rx) = mpsc::channel(WRITE_FAILURE_BUFFER);
        ManagerState::new(sm, write_failure_tx, config)
    }

    fn submit(state: &mut ManagerState, token: u64, options: RequestOptions) {
        let (respond_to, rx) = oneshot::channel();
        // Keep the caller side alive for the duration of the test.
        std::mem::forget(rx);
        assert!(state.handle_new_request(NewRequest {
            token,
            request: Box::new(TestRequest),
            options,
            respond_to,
        }));
    }

    fn in_flight(state: &ManagerState) -> usize {
        state.streams.values().filter(|entry| entry.req.is_some()).count()
    }

    #[tokio::test]
    async fn available_and_inflight_partition_streams() {
        let sm = TestStreamManager::new();
        sm.add(TestStream::new(1));
        sm.add(TestStream::new(2));

        let mut state = test_state(sm.clone(), RequestManagerConfig::default());
        state.refresh_streams();
        assert_eq!(state.available.len() + in_flight(&state), state.streams.len());

        submit(&mut state, 100, RequestOptions::new());
        state.assign_waitings();
        assert_eq!(state.pendings.len(), 1);
        assert_eq!(state.available.len() + in_flight(&state), state.streams.len());

        // Invariant: the owning stream's request id equals the pending id.
        for (req_id, pending) in &state.pendings {
            assert_eq!(state.streams[&pending.owner].req, Some(*req_id));
        }

        // Deliver and check the stream went back to available.
        let (&req_id, pending) = state.pendings.iter().next().unwrap();
        let owner = pending.owner;
        state.handle_delivery(ResponseData {
            stream_id: owner,
            response: Box::new(TestResponse { req_id }),
        });
        assert!(state.pendings.is_empty());
        assert_eq!(state.available.len(), state.streams.len());
    }

    #[tokio::test]
    async fn high_priority_requests_assigned_first() {
        let sm = TestStreamManager::new();
        let mut state = test_state(sm.clone(), RequestManagerConfig::default());

        submit(&mut state, 1, RequestOptions::new());
        submit(&mut state, 2, RequestOptions::new().with_high_priority());

        sm.add(TestStream::new(1));
        state.refresh_streams();
        // Single stream: only one request can be assigned.
        state.assign_waitings();

        assert_eq!(state.pendings.len(), 1);
        assert_eq!(state.pendings.values().next().unwrap().token, 2);
        assert_eq!(state.waitings.len(), 1);
    }

    #[tokio::test]
    async fn whitelist_narrows_stream_choice() {
        let sm = TestStreamManager::new();
        sm.add(TestStream::new(1));
        sm.add(TestStream::new(2));

        let mut state = test_state(sm.clone(), RequestManagerConfig::default());
        state.refresh_streams();

        submit(&mut state, 5, RequestOptions::new().with_whitelist([StreamId(2)]));
        state.assign_waitings();

        assert_eq!(state.pendings.len(), 1);
        assert_eq!(state.pendings.values().next().unwrap().owner, StreamId(2));
    }

    #[tokio::test]
    async fn cancel_removes_waiting_request() {
        let sm = TestStreamManager::new();
        let mut state = test_state(sm.clone(), RequestManagerConfig::default());

        submit(&mut state, 42, RequestOptions::new());
        assert_eq!(state.waitings.len(), 1);

        state.handle_cancel(CancelRequest { token: 42, err: RequestError::Cancelled });
        assert_eq!(state.waitings.len(), 0);
    }
}
