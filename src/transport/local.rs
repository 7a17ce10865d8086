//! In-process transport where every rank is a thread.
//!
//! Each rank owns one `crossbeam` inbox and a sender to every rank's inbox. A message
//! is an envelope: the source rank, a context (user tag or collective sequence
//! number) and the payload bytes.
//!
//! # Matching
//!
//! Incoming envelopes are drained into an *unexpected queue*. Posted receives are
//! matched in posting order against that queue, each taking the earliest matching
//! envelope, which preserves per-source ordering. Collectives never use user tags:
//! each collective call takes the next sequence number of the communicator, and since
//! every rank calls collectives in the same order the numbers line up across ranks.
//!
//! # Collectives
//!
//! A collective is a *schedule*: the local contribution is sent eagerly when the
//! collective is issued, the parts expected from other ranks are filled in whenever
//! the rank makes progress (any `test`, `wait` or probe), and the result is built once
//! the last part arrived. Blocking collectives are "issue and wait".
//!
//! ```rust
//! use admpi_rs::transport::{LocalWorld, Transport};
//! use std::thread;
//!
//! let handles: Vec<_> = LocalWorld::new(2)
//!     .into_iter()
//!     .map(|endpoint| {
//!         thread::spawn(move || {
//!             let comm = endpoint.into_comm();
//!             let parts = comm.allgather(vec![comm.rank() as u8]).unwrap();
//!             assert_eq!(parts, vec![vec![0], vec![1]]);
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! ```

use super::{
    status, Payload, RawCompletion, RawRequest, SendMode, Source, Status, Tag, Transport,
    TransportError, TransportResult, WireOp, ANY_TAG,
};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::trace;

/// Tunables of the in-process transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// How long a blocked rank waits for any traffic before failing with `ERR_OTHER`.
    pub recv_timeout: Duration,
    /// Granularity of the blocking loop used while waiting for progress.
    pub poll_interval: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            recv_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_micros(50),
        }
    }
}

impl LocalConfig {
    /// Default configuration, overridden by `ADMPI_RECV_TIMEOUT_MS` and
    /// `ADMPI_POLL_INTERVAL_US` when they are set to valid integers.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("ADMPI_RECV_TIMEOUT_MS") {
            config.recv_timeout = Duration::from_millis(ms);
        }
        if let Some(us) = env_u64("ADMPI_POLL_INTERVAL_US") {
            config.poll_interval = Duration::from_micros(us.max(1));
        }
        config
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Point(Tag),
    Collective(u64),
}

#[derive(Debug)]
struct Envelope {
    source: usize,
    context: Context,
    payload: Vec<u8>,
}

/// Factory for a set of connected in-process ranks.
pub struct LocalWorld;

impl LocalWorld {
    /// Creates `size` connected endpoints with the default configuration.
    pub fn new(size: usize) -> Vec<LocalEndpoint> {
        Self::with_config(size, LocalConfig::default())
    }

    /// Creates `size` connected endpoints.
    ///
    /// Endpoints are `Send`; move each one to its rank thread and turn it into a
    /// [`LocalComm`] there.
    pub fn with_config(size: usize, config: LocalConfig) -> Vec<LocalEndpoint> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| LocalEndpoint {
                rank,
                inbox,
                peers: senders.clone(),
                config: config.clone(),
            })
            .collect()
    }
}

/// One rank's connection, before it is bound to its thread.
pub struct LocalEndpoint {
    rank: usize,
    inbox: Receiver<Envelope>,
    peers: Vec<Sender<Envelope>>,
    config: LocalConfig,
}

impl LocalEndpoint {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn into_comm(self) -> LocalComm {
        LocalComm {
            rank: self.rank,
            size: self.peers.len(),
            inbox: self.inbox,
            peers: self.peers,
            config: self.config,
            state: RefCell::new(State::default()),
        }
    }
}

enum Finish {
    Bcast { root: usize },
    Gather,
    Scatter { root: usize },
    Collect,
    Reduce(WireOp),
    Prefix { op: WireOp, upto: usize },
    Barrier,
}

struct Schedule {
    seq: u64,
    parts: Vec<Option<Vec<u8>>>,
    missing: Vec<usize>,
    finish: Finish,
}

enum Pending {
    Complete(RawCompletion),
    Failed(TransportError),
    Recv {
        source: Source,
        tag: Tag,
        capacity: usize,
    },
    Collective(Schedule),
}

#[derive(Default)]
struct State {
    unexpected: VecDeque<Envelope>,
    posted: VecDeque<u64>,
    requests: HashMap<u64, Pending>,
    next_request: u64,
    next_collective: u64,
}

impl State {
    fn insert(&mut self, pending: Pending) -> RawRequest {
        let id = self.next_request;
        self.next_request += 1;
        self.requests.insert(id, pending);
        RawRequest(id)
    }

    fn take_point(&mut self, source: Source, tag: Tag) -> Option<Envelope> {
        let pos = self.unexpected.iter().position(|env| {
            source.matches(env.source)
                && matches!(env.context, Context::Point(t) if tag == ANY_TAG || t == tag)
        })?;
        self.unexpected.remove(pos)
    }

    fn take_collective(&mut self, source: usize, seq: u64) -> Option<Envelope> {
        let pos = self
            .unexpected
            .iter()
            .position(|env| env.source == source && env.context == Context::Collective(seq))?;
        self.unexpected.remove(pos)
    }

    /// Matches posted receives and fills collective schedules from the unexpected queue.
    fn match_pending(&mut self) {
        let posted: Vec<u64> = self.posted.iter().copied().collect();
        for id in posted {
            let Some(Pending::Recv {
                source,
                tag,
                capacity,
            }) = self.requests.get(&id)
            else {
                continue;
            };
            let (source, tag, capacity) = (*source, *tag, *capacity);
            if let Some(env) = self.take_point(source, tag) {
                let Context::Point(actual_tag) = env.context else {
                    unreachable!("point matching only returns point envelopes")
                };
                let pending = if env.payload.len() > capacity {
                    Pending::Failed(TransportError::new("recv", status::ERR_TRUNCATE))
                } else {
                    Pending::Complete(RawCompletion {
                        status: Status {
                            source: env.source,
                            tag: actual_tag,
                            bytes: env.payload.len(),
                        },
                        payload: Payload::Bytes(env.payload),
                    })
                };
                self.requests.insert(id, pending);
                self.posted.retain(|p| *p != id);
            }
        }

        let ids: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, p)| matches!(p, Pending::Collective(s) if !s.missing.is_empty()))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(Pending::Collective(mut schedule)) = self.requests.remove(&id) else {
                continue;
            };
            let missing = std::mem::take(&mut schedule.missing);
            for source in missing {
                match self.take_collective(source, schedule.seq) {
                    Some(env) => schedule.parts[source] = Some(env.payload),
                    None => schedule.missing.push(source),
                }
            }
            self.requests.insert(id, Pending::Collective(schedule));
        }
    }
}

/// A rank of a [`LocalWorld`].
pub struct LocalComm {
    rank: usize,
    size: usize,
    inbox: Receiver<Envelope>,
    peers: Vec<Sender<Envelope>>,
    config: LocalConfig,
    state: RefCell<State>,
}

impl LocalComm {
    pub fn config(&self) -> &LocalConfig {
        &self.config
    }

    fn check_rank(&self, call: &'static str, rank: usize, code: i32) -> TransportResult<()> {
        if rank >= self.size {
            return Err(TransportError::new(call, code));
        }
        Ok(())
    }

    fn post(
        &self,
        call: &'static str,
        dest: usize,
        context: Context,
        payload: Vec<u8>,
    ) -> TransportResult<()> {
        let envelope = Envelope {
            source: self.rank,
            context,
            payload,
        };
        self.peers[dest]
            .send(envelope)
            .map_err(|_| TransportError::new(call, status::ERR_OTHER))
    }

    /// Moves everything currently in the inbox to the unexpected queue.
    fn drain(&self, state: &mut State) {
        loop {
            match self.inbox.try_recv() {
                Ok(env) => state.unexpected.push_back(env),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn progress(&self) {
        let mut state = self.state.borrow_mut();
        self.drain(&mut state);
        state.match_pending();
    }

    /// Blocks until at least one new envelope arrived, or fails after the receive timeout.
    fn block_for_traffic(&self) -> TransportResult<()> {
        let deadline = std::time::Instant::now() + self.config.recv_timeout;
        loop {
            match self.inbox.recv_timeout(self.config.poll_interval) {
                Ok(env) => {
                    self.state.borrow_mut().unexpected.push_back(env);
                    return Ok(());
                }
                Err(RecvTimeoutError::Timeout) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(TransportError::new("wait", status::ERR_OTHER));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::new("wait", status::ERR_OTHER));
                }
            }
        }
    }

    fn schedule(
        &self,
        seq: u64,
        own: Option<Vec<u8>>,
        missing: Vec<usize>,
        finish: Finish,
    ) -> RawRequest {
        let mut parts = vec![None; self.size];
        parts[self.rank] = own;
        self.state.borrow_mut().insert(Pending::Collective(Schedule {
            seq,
            parts,
            missing,
            finish,
        }))
    }

    fn next_collective(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        let seq = state.next_collective;
        state.next_collective += 1;
        seq
    }

    fn others(&self) -> Vec<usize> {
        (0..self.size).filter(|r| *r != self.rank).collect()
    }

    fn complete_now(&self, payload: Payload) -> RawRequest {
        self.state.borrow_mut().insert(Pending::Complete(RawCompletion {
            payload,
            status: Status {
                source: self.rank,
                ..Status::default()
            },
        }))
    }

    fn finish(&self, schedule: Schedule) -> TransportResult<RawCompletion> {
        let rank = self.rank;
        let mut parts: Vec<Vec<u8>> =
            schedule.parts.into_iter().map(Option::unwrap_or_default).collect();
        let payload = match schedule.finish {
            Finish::Bcast { root } | Finish::Scatter { root } => {
                Payload::Bytes(std::mem::take(&mut parts[root]))
            }
            Finish::Gather | Finish::Collect => Payload::Parts(parts),
            Finish::Reduce(op) => Payload::Bytes(fold(&parts, &op)?),
            Finish::Prefix { op, upto } => {
                if upto == 0 {
                    Payload::Empty
                } else {
                    Payload::Bytes(fold(&parts[..upto], &op)?)
                }
            }
            Finish::Barrier => Payload::Empty,
        };
        Ok(RawCompletion {
            payload,
            status: Status {
                source: rank,
                ..Status::default()
            },
        })
    }
}

/// Folds payloads in rank order: `x0 ∘ (x1 ∘ (… ∘ xn-1))`.
fn fold(parts: &[Vec<u8>], op: &WireOp) -> TransportResult<Vec<u8>> {
    let Some((last, rest)) = parts.split_last() else {
        return Ok(Vec::new());
    };
    let mut acc = last.clone();
    for part in rest.iter().rev() {
        if part.len() != acc.len() {
            return Err(TransportError::new("reduce", status::ERR_COUNT));
        }
        op(part, &mut acc);
    }
    Ok(acc)
}

impl Transport for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(
        &self,
        data: Vec<u8>,
        dest: usize,
        tag: Tag,
        mode: SendMode,
    ) -> TransportResult<RawRequest> {
        self.check_rank("send", dest, status::ERR_RANK)?;
        if tag < 0 {
            return Err(TransportError::new("send", status::ERR_TAG));
        }
        let bytes = data.len();
        trace!(rank = self.rank, dest, tag, bytes, ?mode, "isend");
        self.post("send", dest, Context::Point(tag), data)?;
        // Delivery is eager for every mode, so the send is complete right away.
        Ok(self.state.borrow_mut().insert(Pending::Complete(RawCompletion {
            payload: Payload::Empty,
            status: Status {
                source: self.rank,
                tag,
                bytes,
            },
        })))
    }

    fn irecv(&self, source: Source, tag: Tag, capacity: usize) -> TransportResult<RawRequest> {
        if let Source::Rank(r) = source {
            self.check_rank("recv", r, status::ERR_RANK)?;
        }
        if tag < ANY_TAG {
            return Err(TransportError::new("recv", status::ERR_TAG));
        }
        let mut state = self.state.borrow_mut();
        let request = state.insert(Pending::Recv {
            source,
            tag,
            capacity,
        });
        state.posted.push_back(request.0);
        Ok(request)
    }

    fn probe(&self, source: Source, tag: Tag) -> TransportResult<Status> {
        loop {
            if let Some(status) = self.iprobe(source, tag)? {
                return Ok(status);
            }
            self.block_for_traffic()?;
        }
    }

    fn iprobe(&self, source: Source, tag: Tag) -> TransportResult<Option<Status>> {
        self.progress();
        let state = self.state.borrow();
        Ok(state.unexpected.iter().find_map(|env| match env.context {
            Context::Point(t) if source.matches(env.source) && (tag == ANY_TAG || t == tag) => {
                Some(Status {
                    source: env.source,
                    tag: t,
                    bytes: env.payload.len(),
                })
            }
            _ => None,
        }))
    }

    fn test(&self, request: RawRequest) -> TransportResult<Option<RawCompletion>> {
        self.progress();
        let mut state = self.state.borrow_mut();
        let ready = match state.requests.get(&request.0) {
            None => return Err(TransportError::new("test", status::ERR_REQUEST)),
            Some(Pending::Complete(_)) | Some(Pending::Failed(_)) => true,
            Some(Pending::Recv { .. }) => false,
            Some(Pending::Collective(schedule)) => schedule.missing.is_empty(),
        };
        if !ready {
            return Ok(None);
        }
        let removed = state.requests.remove(&request.0);
        drop(state);
        match removed {
            Some(Pending::Complete(completion)) => Ok(Some(completion)),
            Some(Pending::Failed(err)) => Err(err),
            Some(Pending::Collective(schedule)) => self.finish(schedule).map(Some),
            _ => Err(TransportError::new("test", status::ERR_INTERN)),
        }
    }

    fn wait(&self, request: RawRequest) -> TransportResult<RawCompletion> {
        loop {
            if let Some(completion) = self.test(request)? {
                return Ok(completion);
            }
            self.block_for_traffic()?;
        }
    }

    fn wait_for_traffic(&self) -> TransportResult<()> {
        self.block_for_traffic()
    }

    fn request_free(&self, request: RawRequest) -> TransportResult<()> {
        let mut state = self.state.borrow_mut();
        if state.requests.remove(&request.0).is_none() {
            return Err(TransportError::new("request_free", status::ERR_REQUEST));
        }
        state.posted.retain(|p| *p != request.0);
        Ok(())
    }

    fn ibcast(&self, data: Option<Vec<u8>>, root: usize) -> TransportResult<RawRequest> {
        self.check_rank("bcast", root, status::ERR_ROOT)?;
        let seq = self.next_collective();
        if self.rank == root {
            let data = data.ok_or(TransportError::new("bcast", status::ERR_BUFFER))?;
            for dest in self.others() {
                self.post("bcast", dest, Context::Collective(seq), data.clone())?;
            }
            return Ok(self.complete_now(Payload::Bytes(data)));
        }
        Ok(self.schedule(seq, None, vec![root], Finish::Bcast { root }))
    }

    fn igather(&self, data: Vec<u8>, root: usize) -> TransportResult<RawRequest> {
        self.check_rank("gather", root, status::ERR_ROOT)?;
        let seq = self.next_collective();
        if self.rank != root {
            self.post("gather", root, Context::Collective(seq), data)?;
            return Ok(self.complete_now(Payload::Empty));
        }
        Ok(self.schedule(seq, Some(data), self.others(), Finish::Gather))
    }

    fn iscatter(&self, parts: Option<Vec<Vec<u8>>>, root: usize) -> TransportResult<RawRequest> {
        self.check_rank("scatter", root, status::ERR_ROOT)?;
        let seq = self.next_collective();
        if self.rank == root {
            let mut parts = parts.ok_or(TransportError::new("scatter", status::ERR_BUFFER))?;
            if parts.len() != self.size {
                return Err(TransportError::new("scatter", status::ERR_COUNT));
            }
            for dest in self.others() {
                let part = std::mem::take(&mut parts[dest]);
                self.post("scatter", dest, Context::Collective(seq), part)?;
            }
            let own = std::mem::take(&mut parts[root]);
            return Ok(self.complete_now(Payload::Bytes(own)));
        }
        Ok(self.schedule(seq, None, vec![root], Finish::Scatter { root }))
    }

    fn iallgather(&self, data: Vec<u8>) -> TransportResult<RawRequest> {
        let seq = self.next_collective();
        for dest in self.others() {
            self.post("allgather", dest, Context::Collective(seq), data.clone())?;
        }
        Ok(self.schedule(seq, Some(data), self.others(), Finish::Collect))
    }

    fn ialltoall(&self, mut parts: Vec<Vec<u8>>) -> TransportResult<RawRequest> {
        if parts.len() != self.size {
            return Err(TransportError::new("alltoall", status::ERR_COUNT));
        }
        let seq = self.next_collective();
        for dest in self.others() {
            let part = std::mem::take(&mut parts[dest]);
            self.post("alltoall", dest, Context::Collective(seq), part)?;
        }
        let own = std::mem::take(&mut parts[self.rank]);
        Ok(self.schedule(seq, Some(own), self.others(), Finish::Collect))
    }

    fn ireduce(&self, data: Vec<u8>, op: WireOp, root: usize) -> TransportResult<RawRequest> {
        self.check_rank("reduce", root, status::ERR_ROOT)?;
        let seq = self.next_collective();
        if self.rank != root {
            self.post("reduce", root, Context::Collective(seq), data)?;
            return Ok(self.complete_now(Payload::Empty));
        }
        Ok(self.schedule(seq, Some(data), self.others(), Finish::Reduce(op)))
    }

    fn iallreduce(&self, data: Vec<u8>, op: WireOp) -> TransportResult<RawRequest> {
        let seq = self.next_collective();
        for dest in self.others() {
            self.post("allreduce", dest, Context::Collective(seq), data.clone())?;
        }
        Ok(self.schedule(seq, Some(data), self.others(), Finish::Reduce(op)))
    }

    fn iscan(&self, data: Vec<u8>, op: WireOp) -> TransportResult<RawRequest> {
        self.prefix("scan", data, op, self.rank + 1)
    }

    fn iexscan(&self, data: Vec<u8>, op: WireOp) -> TransportResult<RawRequest> {
        self.prefix("exscan", data, op, self.rank)
    }

    fn ibarrier(&self) -> TransportResult<RawRequest> {
        let seq = self.next_collective();
        for dest in self.others() {
            self.post("barrier", dest, Context::Collective(seq), Vec::new())?;
        }
        Ok(self.schedule(seq, Some(Vec::new()), self.others(), Finish::Barrier))
    }
}

impl LocalComm {
    /// Prefix reductions only need contributions from lower ranks.
    fn prefix(
        &self,
        call: &'static str,
        data: Vec<u8>,
        op: WireOp,
        upto: usize,
    ) -> TransportResult<RawRequest> {
        let seq = self.next_collective();
        for dest in self.rank + 1..self.size {
            self.post(call, dest, Context::Collective(seq), data.clone())?;
        }
        let lower: Vec<usize> = (0..self.rank).collect();
        Ok(self.schedule(seq, Some(data), lower, Finish::Prefix { op, upto }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use std::thread;

    fn run<F>(size: usize, f: F)
    where
        F: Fn(LocalComm) + Send + Sync + Clone + 'static,
    {
        let handles: Vec<_> = LocalWorld::new(size)
            .into_iter()
            .map(|endpoint| {
                let f = f.clone();
                thread::spawn(move || f(endpoint.into_comm()))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    fn byte_sum() -> WireOp {
        Rc::new(|input: &[u8], inout: &mut [u8]| {
            for (a, b) in input.iter().zip(inout.iter_mut()) {
                *b += *a;
            }
        })
    }

    #[test]
    fn test_point_to_point_order_is_kept() {
        run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[1], 1, 7, SendMode::Standard).unwrap();
                comm.send(&[2], 1, 7, SendMode::Standard).unwrap();
            } else {
                let (a, _) = comm.recv(Source::Rank(0), 7, 8).unwrap();
                let (b, status) = comm.recv(Source::Any, ANY_TAG, 8).unwrap();
                assert_eq!(a, vec![1]);
                assert_eq!(b, vec![2]);
                assert_eq!(status.source, 0);
                assert_eq!(status.tag, 7);
            }
        });
    }

    #[test]
    fn test_posted_receives_match_in_order() {
        run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[10], 1, 3, SendMode::Standard).unwrap();
                comm.send(&[20], 1, 3, SendMode::Standard).unwrap();
            } else {
                let first = comm.irecv(Source::Rank(0), 3, 1).unwrap();
                let second = comm.irecv(Source::Rank(0), 3, 1).unwrap();
                let b = comm.wait(second).unwrap();
                let a = comm.wait(first).unwrap();
                assert_eq!(a.payload, Payload::Bytes(vec![10]));
                assert_eq!(b.payload, Payload::Bytes(vec![20]));
            }
        });
    }

    #[test]
    fn test_truncation_is_reported() {
        run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[1, 2, 3], 1, 0, SendMode::Standard).unwrap();
            } else {
                let err = comm.recv(Source::Rank(0), 0, 2).unwrap_err();
                assert_eq!(err.code, status::ERR_TRUNCATE);
            }
        });
    }

    #[test]
    fn test_invalid_rank_and_request() {
        let comm = LocalWorld::new(1).pop().unwrap().into_comm();
        let err = comm.send(&[1], 3, 0, SendMode::Standard).unwrap_err();
        assert_eq!(err.code, status::ERR_RANK);
        let err = comm.test(RawRequest(99)).unwrap_err();
        assert_eq!(err.code, status::ERR_REQUEST);
    }

    #[test]
    fn test_reduce_scan_exscan() {
        run(3, |comm| {
            let rank = comm.rank();
            let value = vec![rank as u8 + 1];
            let reduced = comm.reduce(value.clone(), byte_sum(), 1).unwrap();
            if rank == 1 {
                assert_eq!(reduced, vec![6]);
            } else {
                assert!(reduced.is_empty());
            }
            let all = comm.allreduce(value.clone(), byte_sum()).unwrap();
            assert_eq!(all, vec![6]);
            let scan = comm.scan(value.clone(), byte_sum()).unwrap();
            assert_eq!(scan, vec![[1u8, 3, 6][rank]]);
            let exscan = comm.exscan(value, byte_sum()).unwrap();
            match rank {
                0 => assert!(exscan.is_empty()),
                1 => assert_eq!(exscan, vec![1]),
                _ => assert_eq!(exscan, vec![3]),
            }
        });
    }

    #[test]
    fn test_scatter_gather_alltoall() {
        run(3, |comm| {
            let rank = comm.rank();
            let parts = (rank == 2).then(|| vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
            let mine = comm.scatter(parts, 2).unwrap();
            assert_eq!(mine.len(), rank + 1);

            let gathered = comm.gather(mine, 0).unwrap();
            if rank == 0 {
                assert_eq!(gathered, vec![vec![0], vec![1, 1], vec![2, 2, 2]]);
            }

            let outgoing = (0..3).map(|dest| vec![(rank * 10 + dest) as u8]).collect();
            let incoming = comm.alltoall(outgoing).unwrap();
            let expected: Vec<Vec<u8>> = (0..3).map(|src| vec![(src * 10 + rank) as u8]).collect();
            assert_eq!(incoming, expected);
            comm.barrier().unwrap();
        });
    }

    #[test]
    fn test_nonblocking_collective_completes_on_test() {
        run(2, |comm| {
            let data = (comm.rank() == 0).then(|| vec![42]);
            let request = comm.ibcast(data, 0).unwrap();
            let completion = loop {
                if let Some(c) = comm.test(request).unwrap() {
                    break c;
                }
                std::thread::yield_now();
            };
            assert_eq!(completion.payload.into_bytes(), vec![42]);
        });
    }

    #[test]
    fn test_iprobe_and_free() {
        run(2, |comm| {
            if comm.rank() == 0 {
                comm.send(&[9, 9], 1, 5, SendMode::Ready).unwrap();
            } else {
                let status = comm.probe(Source::Any, 5).unwrap();
                assert_eq!(status.bytes, 2);
                assert_eq!(status.source, 0);
                let request = comm.irecv(Source::Rank(0), 6, 2).unwrap();
                comm.request_free(request).unwrap();
                assert!(comm.test(request).is_err());
                let (data, _) = comm.recv(Source::Rank(0), 5, 2).unwrap();
                assert_eq!(data, vec![9, 9]);
            }
        });
    }

    #[test]
    fn test_config_from_env_defaults() {
        let config = LocalConfig::default().with_recv_timeout(Duration::from_millis(5));
        assert_eq!(config.recv_timeout, Duration::from_millis(5));
        assert_eq!(LocalConfig::default().poll_interval, Duration::from_micros(50));
    }
}
