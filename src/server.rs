//! [`TenuredServer`]: the accept side of the engine (spec §4.3/§4.4/§4.7) —
//! auth gate, code-routed dispatch onto executor pools, idle heartbeats,
//! and a two-tier shutdown (graceful drain vs. immediate interrupt).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::auth::{AuthChecker, AuthHeader};
use crate::channel::{ChannelHandler, RemotingChannel};
use crate::command::{TenuredCommand, REQUEST_CODE_AUTH};
use crate::error::TenuredError;
use crate::executor::ExecutorManager;

const HEARTBEAT_WRITE_DEADLINE: Duration = Duration::from_secs(3);
const RESPONSE_WRITE_DEADLINE: Duration = Duration::from_secs(3);

const STATE_RUNNING: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// What a registered command handler returns: `(header, body)` of the
/// success response. Errors are surfaced by returning `Err`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, channel: RemotingChannel, request: TenuredCommand) -> Result<(Vec<u8>, Vec<u8>), TenuredError>;
}

struct Registration {
    handler: Arc<dyn CommandHandler>,
    executor: String,
}

/// Per-channel bookkeeping the idle heartbeat needs.
struct Tracked {
    channel: RemotingChannel,
    last_activity_ms: AtomicU64,
}

pub struct TenuredServer {
    self_weak: Weak<TenuredServer>,
    auth_checker: Arc<dyn AuthChecker>,
    auth_header: AuthHeader,
    handlers: DashMap<u16, Registration>,
    executors: Arc<ExecutorManager>,
    channels: DashMap<u64, Arc<Tracked>>,
    state: AtomicU8,
    stop: Arc<Notify>,
    idle_window: Duration,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl TenuredServer {
    /// `auth_header` identifies this server (module, address) and is
    /// returned to a client on a successful AUTH handshake (spec §4.3).
    pub fn new(auth_checker: Arc<dyn AuthChecker>, auth_header: AuthHeader, idle_window: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            auth_checker,
            auth_header,
            handlers: DashMap::new(),
            executors: Arc::new(ExecutorManager::new()),
            channels: DashMap::new(),
            state: AtomicU8::new(STATE_RUNNING),
            stop: Arc::new(Notify::new()),
            idle_window,
        })
    }

    pub fn executors(&self) -> &Arc<ExecutorManager> {
        &self.executors
    }

    /// Register (or replace) the handler for `code`, dispatched on the
    /// named executor (spec §4.4 "re-registration replaces the prior
    /// handler").
    pub fn register(&self, code: u16, handler: Arc<dyn CommandHandler>, executor: impl Into<String>) {
        assert!(
            code > 0x00FF,
            "command code {code:#06x} is reserved for protocol-internal use (0x0000..=0x00FF)"
        );
        self.handlers.insert(code, Registration { handler, executor: executor.into() });
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    fn arc(&self) -> Arc<TenuredServer> {
        self.self_weak.upgrade().expect("server outlives its own channels and tasks")
    }

    /// Accept connections on `listener` until [`shutdown`](Self::shutdown) or
    /// [`interrupt_shutdown`](Self::interrupt_shutdown) is called.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let heartbeat = tokio::spawn(self.arc().run_heartbeat());
        loop {
            tokio::select! {
                _ = self.stop.notified() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    self.accept_stream(stream, addr.to_string());
                }
            }
        }
        heartbeat.abort();
        Ok(())
    }

    fn accept_stream(&self, stream: TcpStream, remote_addr: String) {
        let (read_half, write_half) = stream.into_split();
        let channel = RemotingChannel::new(remote_addr, Box::new(write_half));
        self.channels.insert(
            channel.id(),
            Arc::new(Tracked {
                channel: channel.clone(),
                last_activity_ms: AtomicU64::new(now_ms()),
            }),
        );
        tokio::spawn(crate::channel::run_reader(channel, read_half, self.arc()));
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.idle_window);
        loop {
            tokio::select! {
                _ = self.stop.notified() => return,
                _ = ticker.tick() => {}
            }
            let cutoff = now_ms().saturating_sub(self.idle_window.as_millis() as u64);
            for entry in self.channels.iter() {
                let tracked = entry.value();
                if tracked.channel.is_closed() {
                    continue;
                }
                if tracked.last_activity_ms.load(Ordering::Relaxed) <= cutoff {
                    let channel = tracked.channel.clone();
                    tokio::spawn(async move {
                        // Transport-closed errors on a heartbeat are expected
                        // background noise, not a failure worth surfacing.
                        let _ = channel.write(&TenuredCommand::idle(), HEARTBEAT_WRITE_DEADLINE).await;
                    });
                }
            }
        }
    }

    fn dispatch(&self, channel: RemotingChannel, command: TenuredCommand) {
        if command.code == REQUEST_CODE_AUTH {
            let server = self.arc();
            tokio::spawn(async move { server.handle_auth(channel, command).await });
            return;
        }

        if !self.auth_checker.is_authed(&channel) {
            let server = self.arc();
            tokio::spawn(async move { server.reject_unauthed(channel, command).await });
            return;
        }

        let Some((handler, executor_name)) = self.handlers.get(&command.code).map(|r| (r.handler.clone(), r.executor.clone())) else {
            tokio::spawn(async move {
                let response = TenuredCommand::error_response(command.id, command.code, "0404", "no handler");
                let _ = channel.write(&response, RESPONSE_WRITE_DEADLINE).await;
            });
            return;
        };

        // Transport-level ACK fast-path (spec §4.2 step 1), then enqueue the
        // actual handler invocation on its bound executor.
        let ack_channel = channel.clone();
        let ack = TenuredCommand::ack(command.id);
        tokio::spawn(async move {
            let _ = ack_channel.write(&ack, RESPONSE_WRITE_DEADLINE).await;
        });

        let request_id = command.id;
        let code = command.code;
        let executor = self.executors.get(&executor_name);
        let submit_channel = channel.clone();
        let submitted = executor.try_submit(async move {
            run_handler(handler, submit_channel, command).await;
        });

        if submitted.is_err() {
            tokio::spawn(async move {
                let response = TenuredCommand::error_response(request_id, code, "0429", "overloaded");
                let _ = channel.write(&response, RESPONSE_WRITE_DEADLINE).await;
            });
        }
    }

    async fn handle_auth(self: Arc<Self>, channel: RemotingChannel, command: TenuredCommand) {
        let response = match self.auth_checker.auth(&channel, &command) {
            Ok(()) => TenuredCommand::response(command.id, command.code, Vec::new(), self.auth_header.encode()),
            Err(err) => TenuredCommand::error_response(command.id, command.code, err.wire_code().unwrap_or("1001"), &err.to_string()),
        };
        let _ = channel.write(&response, RESPONSE_WRITE_DEADLINE).await;
    }

    async fn reject_unauthed(self: Arc<Self>, channel: RemotingChannel, command: TenuredCommand) {
        let response = TenuredCommand::error_response(command.id, command.code, "1000", "not found auth info");
        let _ = channel.write(&response, RESPONSE_WRITE_DEADLINE).await;
        channel.close().await;
    }

    /// Graceful shutdown: stop accepting, let every queued/in-flight handler
    /// task finish, then close every tracked channel (spec §4.7 `Shutdown`).
    pub async fn shutdown(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        self.stop.notify_waiters();
        self.executors.shutdown().await;
        for entry in self.channels.iter() {
            entry.value().channel.mark_closed();
        }
    }

    /// Immediate shutdown: stop accepting and close every channel without
    /// waiting for in-flight handlers (spec §4.7 `InterruptShutdown`).
    pub async fn interrupt_shutdown(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.stop.notify_waiters();
        for entry in self.channels.iter() {
            entry.value().channel.mark_closed();
        }
    }
}

async fn run_handler(handler: Arc<dyn CommandHandler>, channel: RemotingChannel, command: TenuredCommand) {
    use futures::FutureExt;
    let request_id = command.id;
    let code = command.code;
    let channel_for_response = channel.clone();

    let outcome = std::panic::AssertUnwindSafe(handler.handle(channel, command)).catch_unwind().await;

    let response = match outcome {
        Ok(Ok((header, body))) => TenuredCommand::response(request_id, code, header, body),
        Ok(Err(err)) => TenuredCommand::error_response(request_id, code, err.wire_code().unwrap_or("0500"), &err.to_string()),
        Err(_panic) => {
            tracing::error!(code, request_id, "command handler panicked");
            TenuredCommand::error_response(request_id, code, "0500", "internal error")
        }
    };

    let _ = channel_for_response.write(&response, RESPONSE_WRITE_DEADLINE).await;
}

impl ChannelHandler for TenuredServer {
    fn on_message(&self, channel: &RemotingChannel, cmd: TenuredCommand) {
        if let Some(tracked) = self.channels.get(&channel.id()) {
            tracked.last_activity_ms.store(now_ms(), Ordering::Relaxed);
        }
        if !self.is_running() {
            return;
        }
        self.dispatch(channel.clone(), cmd);
    }

    fn on_close(&self, channel: &RemotingChannel) {
        self.channels.remove(&channel.id());
    }

    fn max_frame_size(&self) -> u32 {
        crate::codec::DEFAULT_MAX_FRAME_SIZE
    }
}
