use std::sync::{Arc, Weak};
use std::time::Instant;

use futures_util::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::{interval_at, timeout};

use crate::api::{Builder, ManageResource, PoolError, PooledResource};
use crate::internals::{Admission, Approval, Conn, Grant, SharedPool, State};

pub(crate) struct PoolInner<M>
where
    M: ManageResource,
{
    inner: Arc<SharedPool<M>>,
}

impl<M> PoolInner<M>
where
    M: ManageResource,
{
    pub(crate) fn new(builder: Builder<M>, manager: M) -> Self {
        let inner = Arc::new(SharedPool::new(builder, manager));

        if let Some(rate) = inner.statics.sweep_rate() {
            let start = tokio::time::Instant::now() + rate;
            let mut interval = interval_at(start, rate);
            let weak_shared = Arc::downgrade(&inner);
            tokio::spawn(async move {
                loop {
                    let _ = interval.tick().await;
                    if !PoolInner::sweep(&weak_shared).await {
                        break;
                    }
                }
            });
        }

        Self { inner }
    }

    pub(crate) async fn get(&self) -> Result<PooledResource<'_, M>, PoolError<M::Error>> {
        let limits = self.inner.statics.limits();
        let mut admission = self.inner.internals.lock().admit(limits);

        loop {
            let conn = match admission {
                Admission::Idle(conn) => conn,
                Admission::Create(approval) => return self.create(approval).await,
                Admission::Wait(id, rx) => match self.wait(id, rx).await? {
                    Grant::Resource(conn) => conn,
                    Grant::Create(approval) => return self.create(approval).await,
                },
                Admission::Reject { live, waiters } => {
                    tracing::warn!(live, waiters, "pool exhausted, rejecting request");
                    return Err(PoolError::CapacityExceeded { live, waiters });
                }
                Admission::Closed => return Err(PoolError::Closed),
            };

            let id = conn.id;
            let mut conn = PooledResource::new(self, conn);
            if !self.inner.statics.test_on_check_out
                || self.inner.manager.is_valid(&mut *conn).await
            {
                return Ok(conn);
            }

            tracing::debug!(id, "discarding resource that failed validation");
            let discarded = conn.take();
            admission = self.inner.internals.lock().invalidated(id, limits);
            if let Some(conn) = discarded {
                self.spawn_close(conn);
            }
        }
    }

    async fn create(
        &self,
        approval: Approval,
    ) -> Result<PooledResource<'_, M>, PoolError<M::Error>> {
        let reservation = Reservation {
            pool: self,
            approval: Some(approval),
        };

        let created = match self.inner.statics.timeout {
            Some(limit) => match timeout(limit, self.inner.manager.create()).await {
                Ok(result) => result.map_err(PoolError::Create),
                Err(_) => Err(PoolError::TimedOut(limit)),
            },
            None => self.inner.manager.create().await.map_err(PoolError::Create),
        };

        match created {
            Ok(resource) => {
                let conn = reservation.fulfil(resource);
                tracing::debug!(id = conn.id, "created resource");
                Ok(PooledResource::new(self, conn))
            }
            Err(e) => {
                tracing::warn!(error = ?e, "resource creation failed");
                Err(e)
            }
        }
    }

    async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<Grant<M::Resource>>,
    ) -> Result<Grant<M::Resource>, PoolError<M::Error>> {
        tracing::trace!(waiter = id, "pool at capacity, queueing request");
        let mut waiting = Waiting {
            pool: self,
            id,
            rx,
            done: false,
        };

        let received = match self.inner.statics.timeout {
            Some(limit) => match timeout(limit, &mut waiting.rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!(waiter = id, "timed out waiting for a resource");
                    return Err(PoolError::TimedOut(limit));
                }
            },
            None => (&mut waiting.rx).await,
        };

        waiting.done = true;
        // The sender only goes away without a grant when the pool closes.
        received.map_err(|_| PoolError::Closed)
    }

    /// Returns a checked out resource to the pool.
    pub(crate) fn put_back(&self, mut conn: Conn<M::Resource>, invalid: bool) {
        // Supposed to be fast, but do it before locking anyways.
        let broken = invalid || self.inner.manager.has_broken(&mut conn.resource);

        let discarded = self.inner.internals.lock().check_in(conn, broken);
        if let Some(conn) = discarded {
            self.spawn_close(conn);
        }
    }

    /// Returns a resource that passed background validation, with the time
    /// it originally went idle.
    fn put_back_idle(&self, mut conn: Conn<M::Resource>, idle_start: Instant) {
        let discarded = if self.inner.manager.has_broken(&mut conn.resource) {
            self.inner.internals.lock().check_in(conn, true)
        } else {
            self.inner.internals.lock().check_in_idle(conn, idle_start)
        };
        if let Some(conn) = discarded {
            self.spawn_close(conn);
        }
    }

    pub(crate) fn forget(&self, id: u64) {
        tracing::debug!(id, "detaching resource from the pool");
        self.inner.internals.lock().forget(id);
    }

    fn spawn_close(&self, conn: Conn<M::Resource>) {
        tracing::debug!(id = conn.id, "closing resource");
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(id = conn.id, "no runtime to close resource, dropping it");
            return;
        };

        let shared = self.inner.clone();
        handle.spawn(async move {
            if let Err(e) = shared.manager.close(conn.resource).await {
                shared.forward_error(e);
            }
        });
    }

    pub(crate) async fn close(&self) {
        let idle = self.inner.internals.lock().close();
        tracing::info!(idle = idle.len(), "closing pool");

        let shared = &self.inner;
        join_all(idle.into_iter().map(|conn| async move {
            if let Err(e) = shared.manager.close(conn.resource).await {
                shared.forward_error(e);
            }
        }))
        .await;
    }

    /// One round of the background sweep. Returns `false` once the pool is
    /// gone or closed.
    async fn sweep(weak_shared: &Weak<SharedPool<M>>) -> bool {
        let Some(inner) = weak_shared.upgrade() else {
            return false;
        };
        let pool = PoolInner { inner };
        let statics = &pool.inner.statics;

        let (expired, checked_out) = {
            let mut locked = pool.inner.internals.lock();
            if locked.is_closed() {
                return false;
            }

            let expired = match statics.idle_timeout {
                Some(idle_timeout) => locked.reap(idle_timeout),
                None => Vec::new(),
            };
            let checked_out = match statics.validation_interval {
                Some(_) => locked.check_out_idle(),
                None => Vec::new(),
            };
            (expired, checked_out)
        };

        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "reaping idle resources");
        }
        for conn in expired {
            pool.spawn_close(conn);
        }

        join_all(checked_out.into_iter().map(|(conn, idle_start)| {
            let pool = &pool;
            async move {
                let mut conn = PooledResource::new(pool, conn);
                let valid = pool.inner.manager.is_valid(&mut *conn).await;
                if let Some(conn) = conn.take() {
                    if valid {
                        pool.put_back_idle(conn, idle_start);
                    } else {
                        tracing::debug!(id = conn.id, "idle resource failed validation");
                        pool.put_back(conn, true);
                    }
                }
            }
        }))
        .await;

        true
    }

    pub(crate) fn manager(&self) -> &M {
        &self.inner.manager
    }

    pub(crate) fn state(&self) -> State {
        self.inner.internals.lock().state()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.internals.lock().is_closed()
    }
}

impl<M> Clone for PoolInner<M>
where
    M: ManageResource,
{
    fn clone(&self) -> Self {
        PoolInner {
            inner: self.inner.clone(),
        }
    }
}

/// A creation slot held while the manager builds a resource. Released as a
/// failed creation unless fulfilled.
struct Reservation<'a, M>
where
    M: ManageResource,
{
    pool: &'a PoolInner<M>,
    approval: Option<Approval>,
}

impl<'a, M> Reservation<'a, M>
where
    M: ManageResource,
{
    fn fulfil(mut self, resource: M::Resource) -> Conn<M::Resource> {
        self.approval = None;
        self.pool.inner.internals.lock().created(resource)
    }
}

impl<'a, M> Drop for Reservation<'a, M>
where
    M: ManageResource,
{
    fn drop(&mut self) {
        if let Some(approval) = self.approval.take() {
            self.pool.inner.internals.lock().connect_failed(approval);
        }
    }
}

/// A queued request. Leaves the queue when dropped before it was served, and
/// passes on anything granted to it in the meantime.
struct Waiting<'a, M>
where
    M: ManageResource,
{
    pool: &'a PoolInner<M>,
    id: u64,
    rx: oneshot::Receiver<Grant<M::Resource>>,
    done: bool,
}

impl<'a, M> Drop for Waiting<'a, M>
where
    M: ManageResource,
{
    fn drop(&mut self) {
        if self.done {
            return;
        }

        let discarded = {
            let mut locked = self.pool.inner.internals.lock();
            if locked.remove_waiter(self.id) {
                return;
            }

            // Already dequeued: the grant was sent under the lock, so it is
            // in the channel by now.
            self.rx.close();
            match self.rx.try_recv() {
                Ok(grant) => locked.reclaim(grant),
                Err(_) => None,
            }
        };

        if let Some(conn) = discarded {
            self.pool.spawn_close(conn);
        }
    }
}
