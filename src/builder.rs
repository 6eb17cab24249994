use std::marker::PhantomData;
use std::time::Duration;

use crate::{EventSink, ManageConnection, NopEventSink, Pool};

/// The frozen configuration a [`Builder`] produces, shared between the
/// [`Pool`](crate::Pool) facade and every worker it spawns.
pub(crate) struct Options<E> {
    pub(crate) pool_size: u32,
    /// `Duration::ZERO` means wait forever.
    pub(crate) connection_timeout: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) max_lifetime: Duration,
    pub(crate) validation_timeout: Duration,
    pub(crate) throw_on_connection_timeout: bool,
    pub(crate) validate_on_checkout: bool,
    pub(crate) event_sink: Box<dyn EventSink<E>>,
}

impl<E> Options<E> {
    /// `validation_timeout` converted to whole seconds for drivers that
    /// only accept second-granularity timeouts, per this crate's decision
    /// to treat a sub-second value as "one second" rather than truncating
    /// it to zero.
    pub(crate) fn validation_timeout_secs(&self) -> u64 {
        let secs = self.validation_timeout.as_millis() as u64 / 1000;
        secs.max(1)
    }

    /// `None` when `connection_timeout` is zero, meaning `acquire` should
    /// wait indefinitely.
    pub(crate) fn connection_timeout(&self) -> Option<Duration> {
        if self.connection_timeout.is_zero() {
            None
        } else {
            Some(self.connection_timeout)
        }
    }
}

/// A builder for a [`Pool`].
#[derive(Debug)]
pub struct Builder<M: ManageConnection> {
    pool_size: u32,
    connection_timeout: Duration,
    idle_timeout: Duration,
    max_lifetime: Duration,
    validation_timeout: Duration,
    throw_on_connection_timeout: bool,
    validate_on_checkout: bool,
    event_sink: Box<dyn EventSink<M::Error>>,
    _p: PhantomData<fn() -> M>,
}

impl<M: ManageConnection> Default for Builder<M> {
    fn default() -> Self {
        Builder {
            pool_size: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
            validation_timeout: Duration::from_secs(5),
            throw_on_connection_timeout: true,
            validate_on_checkout: true,
            event_sink: Box::new(NopEventSink),
            _p: PhantomData,
        }
    }
}

impl<M: ManageConnection> Builder<M> {
    /// Constructs a new `Builder`, with every field set to its documented
    /// default.
    pub fn new() -> Builder<M> {
        Default::default()
    }

    /// Sets the number of workers (and therefore the maximum number of
    /// reusable connections) the pool maintains.
    ///
    /// Unlike most pool designs, `0` is a valid value: every `acquire`
    /// then takes the overflow path. Defaults to 10.
    pub fn pool_size(mut self, pool_size: u32) -> Builder<M> {
        self.pool_size = pool_size;
        self
    }

    /// Sets how long `acquire` waits for a reusable connection before
    /// falling back to the overflow path (or failing, if
    /// `throw_on_connection_timeout` is set).
    ///
    /// `Duration::ZERO` means wait forever. Defaults to 30 seconds.
    pub fn connection_timeout(mut self, connection_timeout: Duration) -> Builder<M> {
        self.connection_timeout = connection_timeout;
        self
    }

    /// Sets how long a worker leaves its slot offered before treating it
    /// as idle and running a validity check.
    ///
    /// Defaults to 10 minutes.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Builder<M> {
        assert!(
            idle_timeout > Duration::from_secs(0),
            "idle_timeout must be greater than zero"
        );
        self.idle_timeout = idle_timeout;
        self
    }

    /// Sets the age at which a worker replenishes its slot regardless of
    /// validity.
    ///
    /// Defaults to 30 minutes.
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Builder<M> {
        assert!(
            max_lifetime > Duration::from_secs(0),
            "max_lifetime must be greater than zero"
        );
        self.max_lifetime = max_lifetime;
        self
    }

    /// Sets the timeout passed to [`PhysicalConnection::is_valid`](crate::PhysicalConnection::is_valid).
    ///
    /// Values under one second are rounded up to one second rather than
    /// truncated to zero; see this crate's design notes for why. Defaults
    /// to 5 seconds.
    pub fn validation_timeout(mut self, validation_timeout: Duration) -> Builder<M> {
        self.validation_timeout = validation_timeout;
        self
    }

    /// If true, `acquire` fails with [`PoolError::AcquireTimeout`](crate::PoolError::AcquireTimeout)
    /// once `connection_timeout` elapses. If false, it instead opens a
    /// non-reusable overflow connection.
    ///
    /// Defaults to true.
    pub fn throw_on_connection_timeout(mut self, throw: bool) -> Builder<M> {
        self.throw_on_connection_timeout = throw;
        self
    }

    /// If true, connections are validated with
    /// [`PhysicalConnection::is_valid`](crate::PhysicalConnection::is_valid)
    /// at checkout. If false, only the cheaper
    /// [`PhysicalConnection::is_closed`](crate::PhysicalConnection::is_closed)
    /// is consulted.
    ///
    /// Defaults to true.
    pub fn validate_on_checkout(mut self, validate: bool) -> Builder<M> {
        self.validate_on_checkout = validate;
        self
    }

    /// Sets the sink for pool events that aren't tied to any particular
    /// caller. This is independent of the `tracing` events this crate
    /// always emits.
    ///
    /// Defaults to a no-op sink.
    pub fn event_sink(mut self, event_sink: Box<dyn EventSink<M::Error>>) -> Builder<M> {
        self.event_sink = event_sink;
        self
    }

    pub(crate) fn into_options(self) -> Options<M::Error> {
        Options {
            pool_size: self.pool_size,
            connection_timeout: self.connection_timeout,
            idle_timeout: self.idle_timeout,
            max_lifetime: self.max_lifetime,
            validation_timeout: self.validation_timeout,
            throw_on_connection_timeout: self.throw_on_connection_timeout,
            validate_on_checkout: self.validate_on_checkout,
            event_sink: self.event_sink,
        }
    }

    /// Consumes the builder, spawning workers and returning the new
    /// `Pool`.
    ///
    /// Unlike a pool that eagerly warms up a minimum number of idle
    /// connections, this never waits for a connection to be opened:
    /// workers open their physical connection lazily, on first real
    /// use, so a freshly built pool with no traffic has opened zero
    /// connections.
    pub fn build(self, manager: M) -> Pool<M> {
        Pool::new(self.into_options(), manager)
    }
}
