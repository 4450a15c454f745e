use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::statsd::SystemGauges;

/// Interval for recording backlog metrics on service channels.
const BACKLOG_INTERVAL: Duration = Duration::from_secs(1);

/// A message interface for [services](Service).
///
/// Most commonly, this interface is an enumeration of messages, but it can also be implemented on a
/// single message. For each individual message, this type needs to implement the [`FromMessage`]
/// trait.
///
/// # Implementating Interfaces
///
/// There are three main ways to implement interfaces, which depends on the number of messages and
/// their return values. The simplest way is an interface consisting of a **single message** with
/// **no return value**. For this case, use the message directly as interface and choose
/// [`NoResponse`] as response:
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse};
///
/// #[derive(Debug)]
/// pub struct FlushBuckets;
///
/// impl Interface for FlushBuckets {}
///
/// impl FromMessage<Self> for FlushBuckets {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
/// ```
///
/// If there is a **single message with a return value**, implement the interface as a wrapper for
/// the message and the return [`Sender`]:
///
/// ```
/// use tally_system::{AsyncResponse, FromMessage, Interface, Sender};
///
/// #[derive(Debug)]
/// pub struct CountEntries;
///
/// #[derive(Debug)]
/// pub struct CountEntriesMessage(CountEntries, Sender<usize>);
///
/// impl Interface for CountEntriesMessage {}
///
/// impl FromMessage<CountEntries> for CountEntriesMessage {
///     type Response = AsyncResponse<usize>;
///
///     fn from_message(message: CountEntries, sender: Sender<usize>) -> Self {
///         Self(message, sender)
///     }
/// }
/// ```
///
/// Finally, interfaces can contain **multiple messages**. For this, create an enumeration with a
/// variant for each message, optionally carrying a sender:
///
/// ```
/// use tally_system::{AsyncResponse, FromMessage, Interface, NoResponse, Sender};
///
/// #[derive(Debug)]
/// pub struct Observe(pub i64);
///
/// #[derive(Debug)]
/// pub struct Total;
///
/// #[derive(Debug)]
/// pub enum Counter {
///     Observe(Observe),
///     Total(Total, Sender<i64>),
/// }
///
/// impl Interface for Counter {}
///
/// impl FromMessage<Observe> for Counter {
///     type Response = NoResponse;
///
///     fn from_message(message: Observe, _: ()) -> Self {
///         Self::Observe(message)
///     }
/// }
///
/// impl FromMessage<Total> for Counter {
///     type Response = AsyncResponse<i64>;
///
///     fn from_message(message: Total, sender: Sender<i64>) -> Self {
///         Self::Total(message, sender)
///     }
/// }
/// ```
pub trait Interface: Send + 'static {}

/// Services without messages can use `()` as their interface.
impl Interface for () {}

/// An error when [sending](Addr::send) a message to a service fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendError;

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to send message to service")
    }
}

impl std::error::Error for SendError {}

/// Response behavior of an [`Interface`] message.
///
/// It defines how a service handles and responds to messages, such as through asynchronous
/// responses or fire-and-forget without responding. [`FromMessage`] implementations declare this
/// behavior on the interface.
pub trait MessageResponse {
    /// Sends responses from the service back to the waiting recipient.
    type Sender;

    /// The type returned from [`Addr::send`].
    ///
    /// This type can be either synchronous and asynchronous based on the responder.
    type Output;

    /// Returns the response channel for an interface message.
    fn channel() -> (Self::Sender, Self::Output);
}

/// The request when sending an asynchronous message to a service.
///
/// This is returned from [`Addr::send`] when the message responds asynchronously through
/// [`AsyncResponse`]. It is a future that should be awaited. The message still runs to
/// completion if this future is dropped.
pub struct Request<T>(oneshot::Receiver<T>);

impl<T> fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request").finish_non_exhaustive()
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0)
            .poll(cx)
            .map(|result| result.map_err(|_| SendError))
    }
}

/// Sends a message response from a service back to the waiting [`Request`].
///
/// The sender is part of an [`AsyncResponse`] and should be moved into the service interface
/// type. If this sender is dropped without calling [`send`](Self::send), the request fails with
/// [`SendError`].
pub struct Sender<T>(oneshot::Sender<T>);

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("open", &!self.0.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends the response value and closes the [`Request`].
    ///
    /// This silently drops the value if the request has been dropped.
    pub fn send(self, value: T) {
        self.0.send(value).ok();
    }
}

/// Message response resulting in an asynchronous [`Request`].
///
/// The sender must be placed on the interface in [`FromMessage::from_message`].
pub struct AsyncResponse<T>(std::marker::PhantomData<T>);

impl<T> fmt::Debug for AsyncResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AsyncResponse")
    }
}

impl<T> MessageResponse for AsyncResponse<T> {
    type Sender = Sender<T>;
    type Output = Request<T>;

    fn channel() -> (Self::Sender, Self::Output) {
        let (tx, rx) = oneshot::channel();
        (Sender(tx), Request(rx))
    }
}

/// Message response for fire-and-forget messages.
///
/// Use this type if the message does not produce a return value. [`Addr::send`] returns
/// immediately.
#[derive(Debug)]
pub struct NoResponse;

impl MessageResponse for NoResponse {
    type Sender = ();
    type Output = ();

    fn channel() -> (Self::Sender, Self::Output) {
        ((), ())
    }
}

/// Declares a message as part of an [`Interface`].
///
/// Messages have an associated `Response` type that determines the return value of sending the
/// message. Within an interface, the responder can vary for each message. See [`Interface`] for
/// examples.
pub trait FromMessage<M>: Interface {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Converts the message into the service interface.
    fn from_message(message: M, sender: <Self::Response as MessageResponse>::Sender) -> Self;
}

/// Abstraction over address types for service channels.
trait SendDispatch<M>: Send + Sync {
    /// The behavior declaring the return value when sending this message.
    type Response: MessageResponse;

    /// Sends a message to the service and returns the response.
    fn send(&self, message: M) -> <Self::Response as MessageResponse>::Output;

    /// Returns a trait object of this type.
    fn to_trait_object(&self) -> Box<dyn SendDispatch<M, Response = Self::Response>>;
}

/// An address to a [`Service`] implementing any interface that takes a given message.
///
/// This is similar to an [`Addr`], but it is bound to a single message rather than an interface. A
/// recipient can be constructed from any address that implements [`FromMessage`] for the message
/// via [`Addr::recipient`]. This allows components to depend on a single message instead of the
/// entire interface of another service.
pub struct Recipient<M, R> {
    inner: Box<dyn SendDispatch<M, Response = R>>,
}

impl<M, R> Recipient<M, R>
where
    R: MessageResponse,
{
    /// Sends a message to the service and returns the response.
    ///
    /// See [`Addr::send`] for more information on the behavior.
    pub fn send(&self, message: M) -> R::Output {
        self.inner.send(message)
    }
}

impl<M, R: MessageResponse> Clone for Recipient<M, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.to_trait_object(),
        }
    }
}

impl<M, R> fmt::Debug for Recipient<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recipient")
            .field("message", &std::any::type_name::<M>())
            .finish_non_exhaustive()
    }
}

/// The address of a [`Service`].
///
/// Addresses allow to [send](Self::send) messages to a service that implements a corresponding
/// [`Interface`] as long as the service is running.
///
/// Addresses can be freely cloned. When the last clone of an address is dropped, the message
/// channel of the service closes permanently, which signals to the service that it can shut down.
pub struct Addr<I: Interface> {
    tx: mpsc::UnboundedSender<I>,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Addr<I> {
    /// Sends a message to the service and returns the response.
    ///
    /// Depending on the message's response behavior, this either returns a future resolving to
    /// the return value, or does not return anything for fire-and-forget messages. The
    /// communication channel with the service is unbounded, so backlogs could occur when sending
    /// too many messages.
    ///
    /// Sending asynchronous messages can fail with `Err(SendError)` if the service has shut down.
    /// The result of asynchronous messages does not have to be awaited. The message will be
    /// delivered and handled regardless.
    pub fn send<M>(&self, message: M) -> <I::Response as MessageResponse>::Output
    where
        I: FromMessage<M>,
    {
        let (tx, rx) = I::Response::channel();
        self.queue_size.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(I::from_message(message, tx)).is_err() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
        }
        rx
    }

    /// Returns a handle that can receive a given message independent of the interface.
    ///
    /// See [`Recipient`] for more information and examples.
    pub fn recipient<M>(self) -> Recipient<M, I::Response>
    where
        I: FromMessage<M>,
    {
        Recipient {
            inner: Box::new(self),
        }
    }

    /// Returns the number of messages queued and not yet picked up by the service.
    pub fn len(&self) -> u64 {
        self.queue_size.load(Ordering::Relaxed)
    }

    /// Returns `true` if no messages are queued for the service.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the service has stopped and dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Custom address used for testing.
    ///
    /// Returns the receiving end of the channel for inspection.
    pub fn custom() -> (Self, mpsc::UnboundedReceiver<I>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let addr = Addr {
            tx,
            queue_size: Default::default(),
        };
        (addr, rx)
    }

    /// Dummy address used for testing.
    ///
    /// Messages sent to this address are dropped.
    pub fn dummy() -> Self {
        Self::custom().0
    }
}

impl<I: Interface> fmt::Debug for Addr<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr")
            .field("open", &!self.tx.is_closed())
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

// Manually derive `Clone` since we do not require `I: Clone` and the Clone derive adds this
// constraint.
impl<I: Interface> Clone for Addr<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            queue_size: self.queue_size.clone(),
        }
    }
}

impl<I, M> SendDispatch<M> for Addr<I>
where
    I: Interface + FromMessage<M>,
{
    type Response = <I as FromMessage<M>>::Response;

    fn send(&self, message: M) -> <Self::Response as MessageResponse>::Output {
        Addr::send(self, message)
    }

    fn to_trait_object(&self) -> Box<dyn SendDispatch<M, Response = Self::Response>> {
        Box::new(self.clone())
    }
}

/// Inbound channel for messages sent through an [`Addr`].
///
/// This channel is meant to be polled in a [`Service`].
///
/// Instances are created automatically when [spawning](Service::start_detached) a service, or
/// can be created through [`channel`]. The channel closes when all associated [`Addr`]s are
/// dropped.
pub struct Receiver<I: Interface> {
    rx: mpsc::UnboundedReceiver<I>,
    name: &'static str,
    interval: tokio::time::Interval,
    queue_size: Arc<AtomicU64>,
}

impl<I: Interface> Receiver<I> {
    /// Receives the next value for this receiver.
    ///
    /// This method returns `None` if the channel has been closed and there are no remaining
    /// messages in the channel's buffer. This indicates that no further values can ever be
    /// received from this `Receiver`. The channel is closed when all senders have been dropped.
    ///
    /// If there are no messages in the channel's buffer, but the channel has not yet been closed,
    /// this method will sleep until a message is sent or the channel is closed.
    pub async fn recv(&mut self) -> Option<I> {
        loop {
            tokio::select! {
                biased;

                _ = self.interval.tick() => {
                    let backlog = self.queue_size.load(Ordering::Relaxed);
                    tally_statsd::metric!(
                        gauge(SystemGauges::ServiceBackPressure) = backlog,
                        service = self.name
                    );
                },
                message = self.rx.recv() => {
                    if message.is_some() {
                        self.queue_size.fetch_sub(1, Ordering::SeqCst);
                    }
                    return message;
                },
            }
        }
    }
}

impl<I: Interface> fmt::Debug for Receiver<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("name", &self.name)
            .field("queue_size", &self.queue_size.load(Ordering::Relaxed))
            .finish()
    }
}

/// Creates an unbounded channel for communicating with a [`Service`].
///
/// The `Addr` as the sending part provides public access to the service, while the `Receiver`
/// should remain internal to the service.
pub fn channel<I: Interface>(name: &'static str) -> (Addr<I>, Receiver<I>) {
    let queue_size = Arc::new(AtomicU64::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let addr = Addr {
        tx,
        queue_size: queue_size.clone(),
    };

    let mut interval = tokio::time::interval(BACKLOG_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let receiver = Receiver {
        rx,
        name,
        interval,
        queue_size,
    };

    (addr, receiver)
}

/// An asynchronous unit responding to messages.
///
/// Services receive messages conforming to some [`Interface`] through an [`Addr`] and handle them
/// one by one. Internally, services are free to concurrently process these messages or not, most
/// probably should.
///
/// Individual messages can have a response which will be sent once the message is handled by the
/// service. The sender can asynchronously await the responses of such messages.
///
/// To start a service, create an instance of the service and use [`Service::start_detached`].
///
/// # Implementing Services
///
/// The standard way to implement services is through the `run` function. It receives an inbound
/// channel for all messages sent through the service's address. Note that this function is
/// asynchronous, so the service runs in its own task.
///
/// ```
/// use tally_system::{FromMessage, Interface, NoResponse, Receiver, Service};
///
/// #[derive(Debug)]
/// struct MyMessage;
///
/// impl Interface for MyMessage {}
///
/// impl FromMessage<Self> for MyMessage {
///     type Response = NoResponse;
///
///     fn from_message(message: Self, _: ()) -> Self {
///         message
///     }
/// }
///
/// struct MyService;
///
/// impl Service for MyService {
///     type Interface = MyMessage;
///
///     async fn run(self, mut rx: Receiver<Self::Interface>) {
///         while let Some(message) = rx.recv().await {
///             // handle the message
///         }
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let addr = MyService.start_detached();
/// # }
/// ```
pub trait Service: Sized {
    /// The interface of messages this service implements.
    ///
    /// The interface can be a single message type or an enumeration of all the messages that
    /// can be handled by this service.
    type Interface: Interface;

    /// Defines the main task of this service.
    ///
    /// `run` typically contains a loop that reads from `rx`, or a `select!` that reads
    /// from multiple sources at once.
    fn run(self, rx: Receiver<Self::Interface>) -> impl Future<Output = ()> + Send + 'static;

    /// Starts the service in the current runtime and returns an address for it.
    ///
    /// The service runs in a detached tokio task that cannot be joined on. This is mainly useful
    /// for tests.
    fn start_detached(self) -> Addr<Self::Interface> {
        let (addr, rx) = channel(Self::name());
        tokio::spawn(self.run(rx));
        addr
    }

    /// Returns a unique name for this service implementation.
    ///
    /// This is used for internal diagnostics and uses the fully qualified type name of the service
    /// implementor by default.
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Owns the join handles of all services started through it.
///
/// The runner allows to wait for all services to complete after a shutdown was initiated through
/// the [`Controller`](crate::Controller). Services that panic are logged when joined.
#[derive(Default)]
pub struct ServiceRunner {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceRunner {
    /// Creates a new service runner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a service and starts tracking its join handle, exposing an [`Addr`] for message
    /// passing.
    pub fn start<S: Service>(&mut self, service: S) -> Addr<S::Interface> {
        let (addr, rx) = channel(S::name());
        self.start_with(service, rx);
        addr
    }

    /// Starts a service with an existing [`Receiver`].
    ///
    /// This is useful when the address of a service is needed before the service itself can be
    /// constructed, for instance to wire services that reference each other.
    pub fn start_with<S: Service>(&mut self, service: S, rx: Receiver<S::Interface>) {
        let handle = tokio::spawn(service.run(rx));
        self.handles.push((S::name(), handle));
    }

    /// Returns the number of services tracked by this runner.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if no services have been started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns a future that resolves once all services have terminated.
    pub fn join(self) -> BoxFuture<'static, ()> {
        let futures = self.handles.into_iter().map(|(name, handle)| {
            handle.map(move |result| {
                if let Err(error) = result {
                    tally_log::error!(
                        error = &error as &dyn std::error::Error,
                        service = name,
                        "service terminated abnormally"
                    );
                }
            })
        });

        futures::future::join_all(futures).map(|_| ()).boxed()
    }
}

impl fmt::Debug for ServiceRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.handles.iter().map(|(name, _)| *name).collect();
        f.debug_struct("ServiceRunner")
            .field("services", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Observe(i64);

    #[derive(Debug)]
    struct Total;

    #[derive(Debug)]
    enum Counter {
        Observe(Observe),
        Total(Total, Sender<i64>),
    }

    impl Interface for Counter {}

    impl FromMessage<Observe> for Counter {
        type Response = NoResponse;

        fn from_message(message: Observe, _: ()) -> Self {
            Self::Observe(message)
        }
    }

    impl FromMessage<Total> for Counter {
        type Response = AsyncResponse<i64>;

        fn from_message(message: Total, sender: Sender<i64>) -> Self {
            Self::Total(message, sender)
        }
    }

    struct CounterService {
        total: i64,
    }

    impl Service for CounterService {
        type Interface = Counter;

        async fn run(mut self, mut rx: Receiver<Self::Interface>) {
            while let Some(message) = rx.recv().await {
                match message {
                    Counter::Observe(Observe(value)) => self.total += value,
                    Counter::Total(Total, sender) => sender.send(self.total),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_send_and_respond() {
        let addr = CounterService { total: 0 }.start_detached();

        addr.send(Observe(2));
        addr.send(Observe(40));

        assert_eq!(addr.send(Total).await, Ok(42));
    }

    #[tokio::test]
    async fn test_recipient() {
        let addr = CounterService { total: 1 }.start_detached();

        let observe: Recipient<Observe, NoResponse> = addr.clone().recipient();
        let total: Recipient<Total, AsyncResponse<i64>> = addr.recipient();

        observe.clone().send(Observe(1));
        observe.send(Observe(1));

        assert_eq!(total.clone().send(Total).await, Ok(3));
    }

    #[tokio::test]
    async fn test_dropped_sender_fails_request() {
        let (addr, mut rx) = Addr::<Counter>::custom();

        let request = addr.send(Total);
        match rx.recv().await {
            Some(Counter::Total(_, sender)) => drop(sender),
            other => panic!("unexpected message {other:?}"),
        }

        assert_eq!(request.await, Err(SendError));
    }

    #[tokio::test]
    async fn test_runner_joins_after_addresses_drop() {
        let mut runner = ServiceRunner::new();
        let addr = runner.start(CounterService { total: 0 });
        assert_eq!(runner.len(), 1);

        addr.send(Observe(1));
        drop(addr);

        runner.join().await;
    }

    #[test]
    fn test_backpressure_metrics() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();

        let _guard = rt.enter();
        let (addr, mut rx) = channel::<Counter>("counter");

        let captures = tally_statsd::with_capturing_test_client(|| {
            rt.block_on(async {
                addr.send(Observe(1));
                addr.send(Observe(2));
                assert_eq!(addr.len(), 2);

                // The interval ticks immediately, recording the backlog before the first message.
                assert!(rx.recv().await.is_some());
                assert_eq!(addr.len(), 1);

                tokio::time::sleep(BACKLOG_INTERVAL).await;
                assert!(rx.recv().await.is_some());
                assert!(addr.is_empty());
            });
        });

        assert_eq!(
            captures,
            [
                "service.back_pressure:2|g|#service:counter",
                "service.back_pressure:1|g|#service:counter",
            ]
        );
    }
}
