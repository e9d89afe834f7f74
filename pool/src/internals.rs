use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::api::{Builder, ManageResource};
use crate::lock::Mutex;

/// The guts of a `Pool`.
#[allow(missing_debug_implementations)]
pub(crate) struct SharedPool<M>
where
    M: ManageResource,
{
    pub(crate) statics: Builder<M>,
    pub(crate) manager: M,
    pub(crate) internals: Mutex<PoolInternals<M::Resource>>,
}

impl<M> SharedPool<M>
where
    M: ManageResource,
{
    pub(crate) fn new(statics: Builder<M>, manager: M) -> Self {
        Self {
            statics,
            manager,
            internals: Mutex::new(PoolInternals::default()),
        }
    }

    pub(crate) fn forward_error(&self, err: M::Error) {
        tracing::warn!(error = ?err, "resource management failed");
        self.statics.error_sink.sink(err);
    }
}

/// The capacity bounds admission is decided against. `None` is unbounded.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_size: Option<u32>,
    pub(crate) max_waiters: Option<u32>,
}

/// The outcome of a single admission decision.
pub(crate) enum Admission<C: Send> {
    /// An idle resource was checked out.
    Idle(Conn<C>),
    /// A slot was reserved; the caller must create the resource.
    Create(Approval),
    /// The request was queued; the receiver resolves with its `Grant`.
    Wait(u64, oneshot::Receiver<Grant<C>>),
    /// At capacity with a full waiter queue.
    Reject { live: u32, waiters: usize },
    Closed,
}

/// What a queued waiter is eventually handed.
pub(crate) enum Grant<C: Send> {
    /// A resource released by another caller, already checked out.
    Resource(Conn<C>),
    /// A reservation freed by a failed creation or a closed resource.
    Create(Approval),
}

struct Waiter<C: Send> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
    enqueued: Instant,
}

/// The pool data that must be protected by a lock.
#[allow(missing_debug_implementations)]
pub(crate) struct PoolInternals<C>
where
    C: Send,
{
    conns: VecDeque<IdleConn<C>>,
    waiters: VecDeque<Waiter<C>>,
    in_use: HashSet<u64>,
    num_conns: u32,
    pending_conns: u32,
    next_id: u64,
    closed: bool,
}

impl<C> PoolInternals<C>
where
    C: Send,
{
    pub(crate) fn admit(&mut self, limits: Limits) -> Admission<C> {
        if self.closed {
            return Admission::Closed;
        }

        if let Some(idle) = self.conns.pop_front() {
            self.in_use.insert(idle.conn.id);
            return Admission::Idle(idle.conn);
        }

        let live = self.num_conns + self.pending_conns;
        if limits.max_size.map_or(true, |max| live < max) {
            // Reserve before creation starts so concurrent admissions can
            // never start more than `max_size - live` creations.
            self.pending_conns += 1;
            return Admission::Create(Approval { _priv: () });
        }

        let queued = self.waiters.len();
        if limits.max_waiters.map_or(true, |max| queued < max as usize) {
            let (tx, rx) = oneshot::channel();
            let id = self.next_id();
            self.waiters.push_back(Waiter {
                id,
                tx,
                enqueued: Instant::now(),
            });
            return Admission::Wait(id, rx);
        }

        Admission::Reject {
            live,
            waiters: queued,
        }
    }

    /// Turns one pending reservation into a live, checked out resource.
    pub(crate) fn created(&mut self, resource: C) -> Conn<C> {
        self.pending_conns -= 1;
        self.num_conns += 1;
        let conn = Conn::new(resource, self.next_id());
        self.in_use.insert(conn.id);
        conn
    }

    pub(crate) fn connect_failed(&mut self, approval: Approval) {
        if self.hand_off(Grant::Create(approval)).is_err() {
            self.pending_conns -= 1;
        }
    }

    /// Returns a checked out resource. Yields the resource back when the
    /// caller has to close it.
    pub(crate) fn check_in(&mut self, conn: Conn<C>, broken: bool) -> Option<Conn<C>> {
        self.release(conn, broken, Instant::now())
    }

    /// Returns a resource the sweep checked out, keeping the time it went
    /// idle so validation does not reset its idle clock.
    pub(crate) fn check_in_idle(&mut self, conn: Conn<C>, idle_start: Instant) -> Option<Conn<C>> {
        self.release(conn, false, idle_start)
    }

    fn release(&mut self, conn: Conn<C>, broken: bool, idle_start: Instant) -> Option<Conn<C>> {
        if !self.in_use.remove(&conn.id) {
            tracing::warn!(id = conn.id, "ignoring release of a resource that is not checked out");
            return None;
        }

        if broken || self.closed {
            self.free_slot();
            return Some(conn);
        }

        let id = conn.id;
        match self.hand_off(Grant::Resource(conn)) {
            Ok(()) => {
                self.in_use.insert(id);
            }
            Err(Grant::Resource(conn)) => self.conns.push_back(IdleConn { conn, idle_start }),
            // hand_off gives back exactly what it was given
            Err(Grant::Create(_)) => {}
        }
        None
    }

    /// Discards a checked out resource that failed validation and runs
    /// admission again as if it had never existed.
    pub(crate) fn invalidated(&mut self, id: u64, limits: Limits) -> Admission<C> {
        if self.in_use.remove(&id) {
            self.num_conns -= 1;
        }
        self.admit(limits)
    }

    /// Removes a waiter that gave up. Returns `false` if it was already
    /// dequeued and handed a grant.
    pub(crate) fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(idx) => {
                self.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Takes back a grant whose waiter went away before using it.
    pub(crate) fn reclaim(&mut self, grant: Grant<C>) -> Option<Conn<C>> {
        match grant {
            Grant::Resource(conn) => self.check_in(conn, false),
            Grant::Create(approval) => {
                self.connect_failed(approval);
                None
            }
        }
    }

    /// Detaches a checked out resource from the pool's bookkeeping.
    pub(crate) fn forget(&mut self, id: u64) {
        if self.in_use.remove(&id) {
            self.free_slot();
        }
    }

    /// Marks the pool closed, fails every waiter and hands back the idle
    /// resources for closing.
    pub(crate) fn close(&mut self) -> Vec<Conn<C>> {
        self.closed = true;
        // Dropping the senders resolves every waiter with an error.
        self.waiters.clear();
        let idle = self.conns.drain(..).map(Conn::from).collect::<Vec<_>>();
        self.num_conns -= idle.len() as u32;
        idle
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Removes idle resources that sat unused for at least `idle_timeout`.
    pub(crate) fn reap(&mut self, idle_timeout: Duration) -> Vec<Conn<C>> {
        let now = Instant::now();
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = self
            .conns
            .drain(..)
            .partition(|idle| now - idle.idle_start >= idle_timeout);
        self.conns = kept;

        for _ in &expired {
            self.free_slot();
        }
        expired.into_iter().map(Conn::from).collect()
    }

    /// Checks out every idle resource for background validation, along with
    /// the time each went idle.
    pub(crate) fn check_out_idle(&mut self) -> Vec<(Conn<C>, Instant)> {
        let conns = self
            .conns
            .drain(..)
            .map(|idle| (idle.conn, idle.idle_start))
            .collect::<Vec<_>>();
        self.in_use.extend(conns.iter().map(|(conn, _)| conn.id));
        conns
    }

    pub(crate) fn state(&self) -> State {
        State {
            resources: self.num_conns,
            pending: self.pending_conns,
            idle: self.conns.len() as u32,
            in_use: self.in_use.len() as u32,
            waiters: self.waiters.len() as u32,
        }
    }

    /// A live resource went away; its slot goes to the head waiter as a
    /// creation permit, or back to spare capacity.
    fn free_slot(&mut self) {
        self.num_conns -= 1;
        self.pending_conns += 1;
        if self.hand_off(Grant::Create(Approval { _priv: () })).is_err() {
            self.pending_conns -= 1;
        }
    }

    /// Resolves the oldest live waiter with `grant`.
    fn hand_off(&mut self, mut grant: Grant<C>) -> Result<(), Grant<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => {
                    tracing::trace!(
                        waiter = waiter.id,
                        waited = ?waiter.enqueued.elapsed(),
                        "handed off to waiter"
                    );
                    return Ok(());
                }
                // That receiver was gone. Loop and try again.
                Err(returned) => grant = returned,
            }
        }
        Err(grant)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl<C> Default for PoolInternals<C>
where
    C: Send,
{
    fn default() -> Self {
        Self {
            conns: VecDeque::new(),
            waiters: VecDeque::new(),
            in_use: HashSet::new(),
            num_conns: 0,
            pending_conns: 0,
            next_id: 0,
            closed: false,
        }
    }
}

/// A reserved slot of pool capacity.
#[must_use]
pub(crate) struct Approval {
    _priv: (),
}

#[derive(Debug)]
pub(crate) struct Conn<C>
where
    C: Send,
{
    pub(crate) resource: C,
    pub(crate) id: u64,
}

impl<C: Send> Conn<C> {
    pub(crate) fn new(resource: C, id: u64) -> Self {
        Self { resource, id }
    }
}

impl<C: Send> From<IdleConn<C>> for Conn<C> {
    fn from(conn: IdleConn<C>) -> Self {
        conn.conn
    }
}

struct IdleConn<C>
where
    C: Send,
{
    conn: Conn<C>,
    idle_start: Instant,
}

/// Information about the state of a `Pool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct State {
    /// The number of live resources, idle or in use.
    pub resources: u32,
    /// The number of resources currently being created.
    pub pending: u32,
    /// The number of idle resources.
    pub idle: u32,
    /// The number of resources currently checked out.
    pub in_use: u32,
    /// The number of queued requests.
    pub waiters: u32,
}
