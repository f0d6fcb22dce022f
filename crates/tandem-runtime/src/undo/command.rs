#![forbid(unsafe_code)]

//! Asynchronous undoable commands.
//!
//! A [`Command`] pairs an async body (apply + unapply) with a list of
//! [`ResourceLock`]s. Requests to execute or revert it are queued per command
//! and serviced one at a time; each serviced request acquires every lock,
//! runs the body, and releases the locks before the next request starts.
//!
//! # State machine
//!
//! ```text
//!          execute()                    lock(s) held              body ok
//! Ready ───────────► PreparingForExecution ───► Executing ─────────► Executed
//!   ▲                                                                    │
//!   │   body ok                lock(s) held                 revert()     │
//!   └────────── Reverting ◄──────────── PreparingForRevert ◄────────────┘
//! ```
//!
//! A failed or panicking body rolls the state back to the settled state it
//! started from.
//!
//! # Invariants
//!
//! - Requests for one command are serviced in call order, never overlapping.
//! - A request whose target state is already the settled state skips the body
//!   but still round-trips lock acquisition, so it completes only after every
//!   earlier holder of those locks is done.
//! - Lock tickets are registered synchronously when a request starts, so
//!   requests issued back-to-back are admitted in issue order on shared locks.
//!
//! # Failure Modes
//!
//! - **No runtime**: requests made outside a Tokio runtime fail with
//!   [`CommandError::NoRuntime`].
//! - **Runtime shutdown**: a request whose task is dropped before it settles
//!   resolves to [`CommandError::Abandoned`].

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, JoinAll, join_all};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, debug_span, trace, warn};
use web_time::Instant;

use crate::lock::{self, Acquire, ResourceLock};
use crate::reactive::{Subscription, ValueCell};

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CommandState {
    /// Not applied. Initial state, and the state after a revert.
    #[default]
    Ready,
    /// An execute request is waiting for its locks.
    PreparingForExecution,
    /// The apply body is running.
    Executing,
    /// Applied.
    Executed,
    /// A revert request is waiting for its locks.
    PreparingForRevert,
    /// The unapply body is running.
    Reverting,
}

impl CommandState {
    /// `Ready` or `Executed`.
    #[must_use]
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Executed)
    }

    #[must_use]
    pub const fn is_preparing(self) -> bool {
        matches!(self, Self::PreparingForExecution | Self::PreparingForRevert)
    }

    /// A body is running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Executing | Self::Reverting)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::PreparingForExecution => "preparing-for-execution",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::PreparingForRevert => "preparing-for-revert",
            Self::Reverting => "reverting",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of executing or reverting a command.
pub type CommandResult = Result<(), CommandError>;

/// Errors surfaced through a [`CommandHandle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    /// The body reported a failure.
    #[error("command body failed: {0}")]
    Body(String),
    /// The body panicked.
    #[error("command body panicked: {0}")]
    BodyPanicked(String),
    /// The request was dropped before it settled.
    #[error("command request abandoned before it settled")]
    Abandoned,
    /// No Tokio runtime was available to service the request.
    #[error("no tokio runtime available to run the command")]
    NoRuntime,
    /// The command cannot run in its current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// A text position lies outside the target text.
    #[error("position {position} out of bounds (length {length})")]
    PositionOutOfBounds { position: usize, length: usize },
}

impl CommandError {
    /// Wrap any displayable failure as [`CommandError::Body`].
    pub fn body(error: impl fmt::Display) -> Self {
        Self::Body(error.to_string())
    }
}

/// Who or what triggered a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandSource {
    /// Direct user action.
    #[default]
    User,
    /// Application code.
    Programmatic,
    /// Replayed from a recording.
    Macro,
    /// An external system or API.
    External,
}

impl CommandSource {
    /// Lower-case name, as recorded in tracing fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Programmatic => "programmatic",
            Self::Macro => "macro",
            Self::External => "external",
        }
    }
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to every command for tracing and UI display.
#[derive(Debug, Clone)]
pub struct CommandMetadata {
    /// Human-readable description (e.g. "Insert text").
    pub description: String,
    /// When the command was created.
    pub created: Instant,
    pub source: CommandSource,
}

impl CommandMetadata {
    #[must_use]
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            created: Instant::now(),
            source: CommandSource::User,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: CommandSource) -> Self {
        self.source = source;
        self
    }
}

impl Default for CommandMetadata {
    fn default() -> Self {
        Self::new("Command")
    }
}

/// Callback receiving state transitions.
pub type StateCallback = Arc<dyn Fn(CommandState) + Send + Sync>;

/// Anything that can be executed, reverted and observed.
///
/// Implemented by [`Command`], [`CompoundCommand`](super::CompoundCommand) and
/// the text edit commands. Both request methods return immediately; the work
/// happens on the Tokio runtime and the returned [`CommandHandle`] resolves
/// once the request has settled.
pub trait UndoableCmd: Send + Sync {
    /// Request application. A no-op (after lock round-trip) if already executed.
    fn execute(&self) -> CommandHandle;

    /// Request reversal. A no-op (after lock round-trip) if already ready.
    fn revert(&self) -> CommandHandle;

    /// Current state snapshot.
    fn state(&self) -> CommandState;

    /// Observe state transitions until the guard is dropped.
    fn subscribe_state(&self, callback: StateCallback) -> Subscription;

    fn metadata(&self) -> &CommandMetadata;

    fn description(&self) -> &str {
        &self.metadata().description
    }

    /// Locks held while a body runs.
    fn dependencies(&self) -> Vec<ResourceLock>;

    /// Downcast support for history batching.
    fn as_any(&self) -> &dyn Any;

    fn debug_name(&self) -> &'static str {
        "UndoableCmd"
    }
}

impl fmt::Debug for dyn UndoableCmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.debug_name())
            .field("description", &self.description())
            .field("state", &self.state())
            .finish()
    }
}

/// The side-effecting part of a [`Command`].
///
/// Bodies may suspend freely. A body runs only while the command holds all of
/// its locks.
#[async_trait]
pub trait CommandBody: Send + Sync + 'static {
    async fn apply(&self) -> CommandResult;
    async fn unapply(&self) -> CommandResult;
}

/// A [`CommandBody`] built from two closures returning futures.
pub struct FnBody<A, U> {
    apply: A,
    unapply: U,
}

impl<A, U> FnBody<A, U> {
    pub fn new(apply: A, unapply: U) -> Self {
        Self { apply, unapply }
    }
}

#[async_trait]
impl<A, AF, U, UF> CommandBody for FnBody<A, U>
where
    A: Fn() -> AF + Send + Sync + 'static,
    AF: Future<Output = CommandResult> + Send + 'static,
    U: Fn() -> UF + Send + Sync + 'static,
    UF: Future<Output = CommandResult> + Send + 'static,
{
    async fn apply(&self) -> CommandResult {
        (self.apply)().await
    }

    async fn unapply(&self) -> CommandResult {
        (self.unapply)().await
    }
}

/// Completion handle for an execute or revert request.
///
/// Dropping the handle does not cancel the request.
pub struct CommandHandle {
    inner: BoxFuture<'static, CommandResult>,
}

impl CommandHandle {
    pub fn new(future: impl Future<Output = CommandResult> + Send + 'static) -> Self {
        Self {
            inner: future.boxed(),
        }
    }

    /// An already-settled handle.
    pub fn ready(result: CommandResult) -> Self {
        Self::new(std::future::ready(result))
    }

    /// Settle once every handle has settled; report the first failure in
    /// the order given.
    pub fn join(handles: Vec<CommandHandle>) -> Self {
        let all: JoinAll<CommandHandle> = join_all(handles);
        Self::new(async move {
            all.await
                .into_iter()
                .find(Result::is_err)
                .unwrap_or(Ok(()))
        })
    }

    fn from_reply(reply: oneshot::Receiver<CommandResult>) -> Self {
        Self::new(async move { reply.await.unwrap_or(Err(CommandError::Abandoned)) })
    }
}

impl Future for CommandHandle {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<CommandResult> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandle").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Execute,
    Revert,
}

impl Direction {
    const fn settled(self) -> CommandState {
        match self {
            Self::Execute => CommandState::Executed,
            Self::Revert => CommandState::Ready,
        }
    }

    const fn preparing(self) -> CommandState {
        match self {
            Self::Execute => CommandState::PreparingForExecution,
            Self::Revert => CommandState::PreparingForRevert,
        }
    }

    const fn active(self) -> CommandState {
        match self {
            Self::Execute => CommandState::Executing,
            Self::Revert => CommandState::Reverting,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Execute => "execute",
            Self::Revert => "revert",
        }
    }
}

struct Request {
    direction: Direction,
    reply: oneshot::Sender<CommandResult>,
}

#[derive(Default)]
struct RequestQueue {
    pending: VecDeque<Request>,
    /// A request is being serviced.
    active: bool,
}

/// A lock-coordinated asynchronous command.
///
/// Commands are shared by wrapping them in an `Arc`; configure them with the
/// `with_*` builders before the first request.
pub struct Command {
    core: Arc<CommandCore>,
}

struct CommandCore {
    metadata: CommandMetadata,
    dependencies: Vec<ResourceLock>,
    body: Arc<dyn CommandBody>,
    state: ValueCell<CommandState>,
    queue: Mutex<RequestQueue>,
}

impl Command {
    /// Command depending on the [application lock](ResourceLock::application).
    pub fn new(body: impl CommandBody) -> Self {
        Self::from_body(Arc::new(body))
    }

    /// Command from an apply closure and an unapply closure.
    pub fn from_fns<A, AF, U, UF>(apply: A, unapply: U) -> Self
    where
        A: Fn() -> AF + Send + Sync + 'static,
        AF: Future<Output = CommandResult> + Send + 'static,
        U: Fn() -> UF + Send + Sync + 'static,
        UF: Future<Output = CommandResult> + Send + 'static,
    {
        Self::new(FnBody::new(apply, unapply))
    }

    pub(crate) fn from_body(body: Arc<dyn CommandBody>) -> Self {
        Self {
            core: Arc::new(CommandCore {
                metadata: CommandMetadata::default(),
                dependencies: vec![ResourceLock::application()],
                body,
                state: ValueCell::new(CommandState::Ready),
                queue: Mutex::new(RequestQueue::default()),
            }),
        }
    }

    #[must_use]
    pub fn with_description(self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.configure(|core| core.metadata.description = description)
    }

    #[must_use]
    pub fn with_source(self, source: CommandSource) -> Self {
        self.configure(|core| core.metadata.source = source)
    }

    /// Replace the lock list. An empty list leaves the body unserialized.
    #[must_use]
    pub fn with_dependencies(self, locks: impl IntoIterator<Item = ResourceLock>) -> Self {
        let locks: Vec<ResourceLock> = locks.into_iter().collect();
        self.configure(|core| core.dependencies = locks)
    }

    /// Requests queued behind the one in progress.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.core.queue().pending.len()
    }

    /// Builders on a command that was already shared with a running request
    /// produce a fresh command around the same body.
    fn configure(mut self, f: impl FnOnce(&mut CommandCore)) -> Self {
        if let Some(core) = Arc::get_mut(&mut self.core) {
            f(core);
            return self;
        }
        let mut core = self.core.detached();
        f(&mut core);
        Self {
            core: Arc::new(core),
        }
    }
}

impl UndoableCmd for Command {
    fn execute(&self) -> CommandHandle {
        self.core.enqueue(Direction::Execute)
    }

    fn revert(&self) -> CommandHandle {
        self.core.enqueue(Direction::Revert)
    }

    fn state(&self) -> CommandState {
        self.core.state.get()
    }

    fn subscribe_state(&self, callback: StateCallback) -> Subscription {
        self.core.state.subscribe(move |state| callback(*state))
    }

    fn metadata(&self) -> &CommandMetadata {
        &self.core.metadata
    }

    fn dependencies(&self) -> Vec<ResourceLock> {
        self.core.dependencies.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn debug_name(&self) -> &'static str {
        "Command"
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("description", &self.core.metadata.description)
            .field("state", &self.core.state.get())
            .field("dependencies", &self.core.dependencies.len())
            .finish()
    }
}

impl CommandCore {
    fn queue(&self) -> MutexGuard<'_, RequestQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn detached(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            dependencies: self.dependencies.clone(),
            body: Arc::clone(&self.body),
            state: ValueCell::new(CommandState::Ready),
            queue: Mutex::new(RequestQueue::default()),
        }
    }

    fn enqueue(self: &Arc<Self>, direction: Direction) -> CommandHandle {
        let (reply, outcome) = oneshot::channel();
        let idle = {
            let mut queue = self.queue();
            queue.pending.push_back(Request { direction, reply });
            !std::mem::replace(&mut queue.active, true)
        };
        if idle {
            self.start_next();
        }
        CommandHandle::from_reply(outcome)
    }

    /// Begin servicing the head request, or go idle if there is none.
    fn start_next(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            self.fail_pending(CommandError::NoRuntime);
            return;
        };

        let request = {
            let mut queue = self.queue();
            let next = queue.pending.pop_front();
            if next.is_none() {
                queue.active = false;
            }
            next
        };
        let Some(request) = request else {
            return;
        };

        let settled = self.state.get();
        debug_assert!(settled.is_settled(), "request started from {settled}");
        let redundant = settled == request.direction.settled();
        if !redundant {
            self.state.set(request.direction.preparing());
        }
        let tickets = lock::acquire_all(&self.dependencies);
        runtime.spawn(Arc::clone(self).service(request, settled, redundant, tickets));
    }

    fn fail_pending(&self, error: CommandError) {
        let drained: Vec<Request> = {
            let mut queue = self.queue();
            queue.active = false;
            queue.pending.drain(..).collect()
        };
        warn!(
            target: "tandem.command",
            command = %self.metadata.description,
            requests = drained.len(),
            %error,
            "failing queued requests"
        );
        for request in drained {
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    async fn service(
        self: Arc<Self>,
        request: Request,
        settled: CommandState,
        redundant: bool,
        tickets: JoinAll<Acquire>,
    ) {
        let Request { direction, reply } = request;
        let span = debug_span!(
            target: "tandem.command",
            "command.request",
            description = %self.metadata.description,
            source = self.metadata.source.as_str(),
            request = direction.as_str(),
            state = %settled
        );
        let outcome = self
            .run(direction, settled, redundant, tickets)
            .instrument(span)
            .await;
        if reply.send(outcome).is_err() {
            trace!(target: "tandem.command", "handle dropped before settle");
        }
        self.start_next();
    }

    async fn run(
        &self,
        direction: Direction,
        settled: CommandState,
        redundant: bool,
        tickets: JoinAll<Acquire>,
    ) -> CommandResult {
        let guards = tickets.await;
        if redundant {
            drop(guards);
            debug!(target: "tandem.command", redundant = true, "already settled; body skipped");
            return Ok(());
        }

        self.state.set(direction.active());
        let started = Instant::now();
        let outcome = self.invoke(direction).await;
        drop(guards);

        let elapsed_us = started.elapsed().as_micros() as u64;
        match &outcome {
            Ok(()) => {
                debug!(target: "tandem.command", elapsed_us, "settled");
                self.state.set(direction.settled());
            }
            Err(error) => {
                warn!(
                    target: "tandem.command",
                    elapsed_us,
                    %error,
                    "body failed; state rolled back"
                );
                self.state.set(settled);
            }
        }
        outcome
    }

    async fn invoke(&self, direction: Direction) -> CommandResult {
        let body = match direction {
            Direction::Execute => self.body.apply(),
            Direction::Revert => self.body.unapply(),
        };
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(CommandError::BodyPanicked(panic_message(payload.as_ref()))),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}
