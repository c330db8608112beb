use crate::ActorName;
use futures::Future;
use futures::FutureExt;
use std::error::Error;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;
use tracing::Instrument;
use xtra::Address;
use xtra::Context;

/// A supervising actor reacts to messages from the actor it is supervising and restarts it based on
/// a given policy.
pub struct Supervisor<T, R> {
    context: Context<T>,
    ctor: Box<dyn Fn() -> T + Send + 'static>,
    restart_policy: AsyncClosure<R>,
    metrics: Metrics,
}

type AsyncClosure<R> = Box<
    dyn for<'a> FnMut(&'a R) -> Pin<Box<dyn Future<Output = bool> + 'a + Send + Sync>>
        + Send
        + Sync,
>;

/// Closure that configures the supervisor to restart on every kind of error
pub fn always_restart<E>() -> AsyncClosure<E>
where
    E: Error + Send + Sync + 'static,
{
    Box::new(|_: &E| Box::pin(async move { true }))
}

/// Closure that configures the supervisor to restart on every kind of error,
/// after waiting for the specified `wait_time`.
///
/// Useful for preventing tight loops.
pub fn always_restart_after<E>(wait_time: Duration) -> AsyncClosure<E>
where
    E: Error + Send + Sync + 'static,
{
    let wait_time = wait_time;
    Box::new(move |_: &E| {
        Box::pin(async move {
            tokio_extras::time::sleep(wait_time)
                .instrument(tracing::trace_span!("Wait before restarting actor"))
                .await;
            true
        })
    })
}

#[derive(Default, Clone, Copy, Debug)]
pub struct Metrics {
    /// How many times the supervisor spawned an instance of the actor.
    pub num_spawns: u64,
    /// How many times the actor shut down due to a panic.
    pub num_panics: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct UnitReason {}

impl fmt::Display for UnitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "()")
    }
}

impl Error for UnitReason {}

impl From<()> for UnitReason {
    fn from(_: ()) -> Self {
        UnitReason {}
    }
}

impl<T> Supervisor<T, UnitReason>
where
    T: xtra::Actor<Stop = ()>,
{
    /// Construct a new supervisor for an [`Actor`] with an [`xtra::Actor::Stop`] value of `()`.
    ///
    /// The actor will always be restarted if it stops. If you don't want this behaviour, don't use
    /// a supervisor. If you want more fine-granular control in which circumstances the actor
    /// should be restarted, set [`xtra::Actor::Stop`] to a more descriptive value and use
    /// [`Actor::with_policy`].
    pub fn new(ctor: impl (Fn() -> T) + Send + 'static) -> (Self, Address<T>) {
        let (address, context) = Context::new(None);

        let supervisor = Self {
            context,
            ctor: Box::new(ctor),
            restart_policy: always_restart(),
            metrics: Metrics::default(),
        };

        (supervisor, address)
    }
}

impl<T, R, S> Supervisor<T, R>
where
    T: xtra::Actor<Stop = S>,
    R: Error + Send + Sync + 'static,
    S: Into<R> + Send + 'static,
{
    /// Construct a new supervisor.
    ///
    /// The supervisor needs to know two things:
    /// 1. How to construct an instance of the actor.
    /// 2. When to construct an instance of the actor.
    pub fn with_policy(
        ctor: impl (Fn() -> T) + Send + 'static,
        restart_policy: AsyncClosure<R>,
    ) -> (Self, Address<T>) {
        let (address, context) = Context::new(None);

        let supervisor = Self {
            context,
            ctor: Box::new(ctor),
            restart_policy,
            metrics: Metrics::default(),
        };

        (supervisor, address)
    }

    pub async fn run_log_summary(self) {
        let weak = self.context.weak_address();
        let (exit, metrics) = self.run().await;

        tracing::info!(
            ?metrics,
            actor = %std::any::type_name::<T>(),
            reason = %format!("{:#}", exit), // Format entire chain of errors with alternate Display
            connected = %weak.is_connected(),
            "Supervisor exited"
        );
    }

    pub async fn run(mut self) -> (anyhow::Error, Metrics) {
        let mut actor = self.spawn_new().await;

        loop {
            if !self.context.running {
                let reason = actor.stopped().await.into();
                let restart = (self.restart_policy)(&reason).await;
                let err = anyhow::Error::new(reason);
                let connected = self.context.weak_address().is_connected();

                tracing::info!(
                    actor = %T::name(),
                    // Format entire chain of errors by using alternate Display (#)
                    reason = %format!("{:#}", err),
                    %restart,
                    %connected,
                    "Actor stopped"
                );

                if restart && connected {
                    // Spawn the actor and continue to check context.running again
                    actor = self.spawn_new().await;
                    continue;
                } else {
                    tracing::info!("Ending supervisor loop");
                    break (err, self.metrics);
                }
            }

            let msg = self.context.next_message().await;

            match AssertUnwindSafe(self.context.tick(msg, &mut actor))
                .catch_unwind()
                .await
            {
                Ok(ControlFlow::Continue(())) => (),
                Ok(ControlFlow::Break(())) => (), // This will run `if !self.context.running` above
                Err(error) => {
                    let actor_name = T::name();
                    let reason = match error.downcast::<&'static str>() {
                        Ok(reason) => *reason,
                        Err(_) => "unknown",
                    };

                    tracing::info!(actor = %&actor_name, %reason, restart = true, "Actor panicked");

                    self.metrics.num_panics += 1;
                    actor = self.spawn_new().await;
                }
            }
        }
    }

    async fn spawn_new(&mut self) -> T {
        let actor_name = T::name();
        tracing::info!(actor = %&actor_name, "Spawning new actor instance");
        self.metrics.num_spawns += 1;
        let mut actor = (self.ctor)();
        self.context.running = true;
        actor.started(&mut self.context).await;
        actor
    }
}

/// Return the metrics tracked by this supervisor.
///
/// Currently private because it is a feature only used for testing. If we want to expose metrics
/// about the supervisor, we should look into creating a [`tracing::Subscriber`] that processes the
/// events we are emitting.
#[derive(Debug)]
struct GetMetrics;
