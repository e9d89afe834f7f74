use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;

use crate::inner::PoolInner;
use crate::internals::{Conn, Limits, State};

/// A bounded pool of asynchronously created resources.
pub struct Pool<M>
where
    M: ManageResource,
{
    pub(crate) inner: PoolInner<M>,
}

impl<M> Clone for Pool<M>
where
    M: ManageResource,
{
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for Pool<M>
where
    M: ManageResource,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("state", &self.inner.state())
            .finish()
    }
}

impl<M: ManageResource> Pool<M> {
    /// Returns a `Builder` instance to configure a new pool.
    pub fn builder() -> Builder<M> {
        Builder::new()
    }

    /// Returns information about the current state of the pool.
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Retrieves a resource from the pool.
    ///
    /// Serves an idle resource if one passes validation, creates a new one
    /// while the pool is below `max_size`, and otherwise waits in FIFO order
    /// behind earlier requests. Fails immediately with
    /// `PoolError::CapacityExceeded` when the waiter queue is full.
    ///
    /// The resource is returned to the pool when the guard is dropped.
    pub async fn get(&self) -> Result<PooledResource<'_, M>, PoolError<M::Error>> {
        self.inner.get().await
    }

    /// Runs `work` with a resource from the pool.
    ///
    /// `work` is invoked exactly once, and only if a resource was obtained.
    /// The resource goes back to the pool as soon as the guard handed to
    /// `work` is dropped, so the returned future should own it until it
    /// completes. Failures from `work` come back as `RunError::User`; a
    /// failure to obtain a resource as `RunError::Pool`.
    pub async fn run<'a, F, Fut, T, E>(&'a self, work: F) -> Result<T, RunError<E, M::Error>>
    where
        F: FnOnce(PooledResource<'a, M>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let conn = self.inner.get().await.map_err(RunError::Pool)?;
        work(conn).await.map_err(RunError::User)
    }

    /// Closes the pool.
    ///
    /// Queued requests fail with `PoolError::Closed`, idle resources are
    /// closed before this returns, and resources still in use are closed when
    /// they are released. Any later `get` or `run` fails with
    /// `PoolError::Closed`.
    pub async fn close(&self) {
        self.inner.close().await
    }

    /// Whether `close` has been called on this pool or one of its clones.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Get a new dedicated resource that will not be managed by the pool.
    ///
    /// This method allows reusing the manager's configuration but otherwise
    /// bypassing the pool.
    pub async fn dedicated_resource(&self) -> Result<M::Resource, M::Error> {
        self.inner.manager().create().await
    }
}

/// A builder for a resource pool.
#[derive(Debug)]
pub struct Builder<M: ManageResource> {
    /// The maximum number of live resources, if bounded.
    pub(crate) max_size: Option<u32>,
    /// The maximum number of queued requests, if bounded.
    pub(crate) max_waiters: Option<u32>,
    /// The longest a creation or a queued wait may take.
    pub(crate) timeout: Option<Duration>,
    /// Whether or not to test the resource on checkout.
    pub(crate) test_on_check_out: bool,
    /// The period, if any, at which idle resources are revalidated.
    pub(crate) validation_interval: Option<Duration>,
    /// The duration, if any, after which idle resources are closed.
    pub(crate) idle_timeout: Option<Duration>,
    /// The error sink.
    pub(crate) error_sink: Box<dyn ErrorSink<M::Error>>,
    _p: PhantomData<M>,
}

impl<M: ManageResource> Default for Builder<M> {
    fn default() -> Self {
        Builder {
            max_size: None,
            max_waiters: None,
            timeout: None,
            test_on_check_out: true,
            validation_interval: None,
            idle_timeout: None,
            error_sink: Box::new(NopErrorSink),
            _p: PhantomData,
        }
    }
}

impl<M: ManageResource> Builder<M> {
    /// Constructs a new `Builder`.
    ///
    /// Parameters are initialized with their default values.
    pub fn new() -> Builder<M> {
        Default::default()
    }

    /// Sets the maximum number of resources that may be live at once,
    /// counting those being created, idle and in use.
    ///
    /// Defaults to `None`, which never limits creation.
    pub fn max_size(mut self, max_size: Option<u32>) -> Builder<M> {
        assert!(max_size != Some(0), "max_size must be greater than zero!");
        self.max_size = max_size;
        self
    }

    /// Sets the maximum number of requests queued once `max_size` is
    /// reached. Requests beyond it fail with `PoolError::CapacityExceeded`.
    ///
    /// Defaults to `None`, which never rejects.
    pub fn max_waiters(mut self, max_waiters: Option<u32>) -> Builder<M> {
        self.max_waiters = max_waiters;
        self
    }

    /// Sets how long a resource creation, or a request queued behind a full
    /// pool, may take before failing with `PoolError::TimedOut`.
    ///
    /// Defaults to `None`.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Builder<M> {
        assert!(
            timeout != Some(Duration::from_secs(0)),
            "timeout must be non-zero"
        );
        self.timeout = timeout;
        self
    }

    /// If true, the health of an idle resource will be verified through a
    /// call to `ManageResource::is_valid` before it is provided to a pool
    /// user.
    ///
    /// Defaults to true.
    pub fn test_on_check_out(mut self, test_on_check_out: bool) -> Builder<M> {
        self.test_on_check_out = test_on_check_out;
        self
    }

    /// Sets the period at which idle resources are revalidated in the
    /// background. Resources failing `ManageResource::is_valid` are closed.
    ///
    /// Defaults to `None`.
    pub fn validation_interval(mut self, validation_interval: Option<Duration>) -> Builder<M> {
        assert!(
            validation_interval != Some(Duration::from_secs(0)),
            "validation_interval must be greater than zero!"
        );
        self.validation_interval = validation_interval;
        self
    }

    /// Sets the idle timeout used by the pool.
    ///
    /// If set, resources that remain idle past this duration are closed by
    /// the background sweep.
    ///
    /// Defaults to `None`.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Builder<M> {
        assert!(
            idle_timeout != Some(Duration::from_secs(0)),
            "idle_timeout must be greater than zero!"
        );
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the sink for errors that are not associated with any particular
    /// operation on the pool. This can be used to log and monitor failures.
    ///
    /// Defaults to `NopErrorSink`.
    pub fn error_sink(mut self, error_sink: Box<dyn ErrorSink<M::Error>>) -> Builder<M> {
        self.error_sink = error_sink;
        self
    }

    /// Consumes the builder, returning a new `Pool`.
    ///
    /// No resource is created until the first request. If a validation
    /// interval or an idle timeout is set, the background sweep is spawned
    /// onto the current tokio runtime.
    pub fn build(self, manager: M) -> Pool<M> {
        Pool {
            inner: PoolInner::new(self, manager),
        }
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits {
            max_size: self.max_size,
            max_waiters: self.max_waiters,
        }
    }

    /// The sweep period, if there is anything to sweep.
    pub(crate) fn sweep_rate(&self) -> Option<Duration> {
        self.validation_interval.or(self.idle_timeout)
    }
}

/// A trait which provides resource-specific functionality.
#[async_trait]
pub trait ManageResource: Sized + Send + Sync + 'static {
    /// The resource type this manager deals with.
    type Resource: Send + 'static;
    /// The error type returned by `Resource`s.
    type Error: fmt::Debug + Send + 'static;

    /// Attempts to create a new resource.
    async fn create(&self) -> Result<Self::Resource, Self::Error>;
    /// Determines if the resource is still usable.
    async fn is_valid(&self, resource: &mut Self::Resource) -> bool;
    /// Tears a resource down. Called at most once per resource.
    ///
    /// The default implementation drops it.
    async fn close(&self, resource: Self::Resource) -> Result<(), Self::Error> {
        drop(resource);
        Ok(())
    }
    /// Synchronously determine if the resource is no longer usable, if
    /// possible. Broken resources are closed instead of going back to the
    /// pool.
    #[allow(unused_variables)]
    fn has_broken(&self, resource: &mut Self::Resource) -> bool {
        false
    }
}

/// A smart pointer wrapping a resource. Releases it when dropped.
pub struct PooledResource<'a, M>
where
    M: ManageResource,
{
    pool: &'a PoolInner<M>,
    conn: Option<Conn<M::Resource>>,
}

impl<'a, M> PooledResource<'a, M>
where
    M: ManageResource,
{
    pub(crate) fn new(pool: &'a PoolInner<M>, conn: Conn<M::Resource>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    /// The pool's bookkeeping identity for this resource.
    pub fn id(&self) -> u64 {
        self.conn.as_ref().unwrap().id
    }

    /// Takes the resource out of the pool for good, freeing its slot.
    pub fn detach(mut self) -> M::Resource {
        let conn = self.conn.take().unwrap();
        self.pool.forget(conn.id);
        conn.resource
    }

    pub(crate) fn take(mut self) -> Option<Conn<M::Resource>> {
        self.conn.take()
    }
}

impl<'a, M> Deref for PooledResource<'a, M>
where
    M: ManageResource,
{
    type Target = M::Resource;

    fn deref(&self) -> &M::Resource {
        &self.conn.as_ref().unwrap().resource
    }
}

impl<'a, M> DerefMut for PooledResource<'a, M>
where
    M: ManageResource,
{
    fn deref_mut(&mut self) -> &mut M::Resource {
        &mut self.conn.as_mut().unwrap().resource
    }
}

impl<'a, M> fmt::Debug for PooledResource<'a, M>
where
    M: ManageResource,
    M::Resource: fmt::Debug,
{
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(&self.conn.as_ref().unwrap().resource, fmt)
    }
}

impl<'a, M> Drop for PooledResource<'a, M>
where
    M: ManageResource,
{
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, false);
        }
    }
}

/// Failures to obtain a resource from the pool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError<E> {
    /// The pool is at `max_size` and `max_waiters` requests are queued.
    #[error("pool capacity exceeded ({live} live resources, {waiters} queued requests)")]
    CapacityExceeded {
        /// Live resources at the time of rejection.
        live: u32,
        /// Queued requests at the time of rejection.
        waiters: usize,
    },
    /// The manager failed to create a resource for this request.
    #[error("failed to create resource: {0:?}")]
    Create(E),
    /// A creation or a queued wait took longer than the configured timeout.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// The pool has been closed.
    #[error("pool is closed")]
    Closed,
}

/// The error type of `Pool::run`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError<E, P> {
    /// An error returned from user code.
    #[error("{0}")]
    User(E),
    /// No resource could be obtained; user code never ran.
    #[error("{0}")]
    Pool(PoolError<P>),
}

/// A trait to receive errors generated by resource management that aren't
/// tied to any particular caller.
pub trait ErrorSink<E>: fmt::Debug + Send + Sync + 'static {
    /// Receive an error
    fn sink(&self, error: E);

    /// Clone this sink.
    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>>;
}

/// An `ErrorSink` implementation that does nothing.
#[derive(Debug, Clone, Copy)]
pub struct NopErrorSink;

impl<E> ErrorSink<E> for NopErrorSink {
    fn sink(&self, _: E) {}

    fn boxed_clone(&self) -> Box<dyn ErrorSink<E>> {
        Box::new(*self)
    }
}
