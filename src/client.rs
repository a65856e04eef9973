//! [`TenuredClient`]: the dialing side of the engine (spec §4.2) — binds a
//! [`CorrelationTable`] to one [`RemotingChannel`] and exposes `invoke`
//! (await the response) and `invoke_async` (fire a callback).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelHandler, RemotingChannel};
use crate::command::TenuredCommand;
use crate::correlation::CorrelationTable;
use crate::error::TenuredError;

const STATE_RUNNING: u8 = 0;
const STATE_CLOSED: u8 = 1;

/// One dialed connection plus its correlation table. Incoming ACK frames
/// are routed to pending waiters; a non-ACK inbound frame means the peer
/// is itself issuing a request back over this channel, which is handed to
/// `request_handler` if one was supplied.
pub struct TenuredClient {
    channel: RemotingChannel,
    correlation: CorrelationTable,
    state: AtomicU8,
    request_handler: Option<Arc<dyn Fn(RemotingChannel, TenuredCommand) + Send + Sync>>,
}

impl TenuredClient {
    pub fn new(channel: RemotingChannel) -> Arc<Self> {
        Arc::new(Self {
            channel,
            correlation: CorrelationTable::new(),
            state: AtomicU8::new(STATE_RUNNING),
            request_handler: None,
        })
    }

    /// As [`new`](Self::new), but inbound non-ACK frames (the peer issuing
    /// its own request over this same channel) are handed to `handler`
    /// instead of being silently dropped.
    pub fn with_request_handler(
        channel: RemotingChannel,
        handler: Arc<dyn Fn(RemotingChannel, TenuredCommand) + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            correlation: CorrelationTable::new(),
            state: AtomicU8::new(STATE_RUNNING),
            request_handler: Some(handler),
        })
    }

    pub fn channel(&self) -> &RemotingChannel {
        &self.channel
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Send `command` and await its correlated response up to `timeout`
    /// (spec §4.2 `invoke`).
    pub async fn invoke(&self, mut command: TenuredCommand, timeout: Duration) -> Result<TenuredCommand, TenuredError> {
        if !self.is_running() {
            return Err(TenuredError::Closed);
        }

        let id = self.correlation.next_id();
        command = rebind_id(command, id);
        let rx = self.correlation.register(id);

        if let Err(err) = self.channel.write(&command, timeout).await {
            self.correlation.remove(id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                if response.is_error() {
                    Err(TenuredError::from_wire(&response.error_code, &response.error_message))
                } else {
                    Ok(response)
                }
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_recv_error)) => Err(TenuredError::ChannelClosed),
            Err(_elapsed) => {
                self.correlation.remove(id);
                Err(TenuredError::Timeout)
            }
        }
    }

    /// As [`invoke`](Self::invoke), but runs on a detached task and calls
    /// `callback` exactly once with the outcome (spec §4.2 step 5).
    pub fn invoke_async<F>(self: &Arc<Self>, command: TenuredCommand, timeout: Duration, callback: F)
    where
        F: FnOnce(Result<TenuredCommand, TenuredError>) + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            let result = client.invoke(command, timeout).await;
            callback(result);
        });
    }

    /// One-way send: writes the frame with the ONEWAY bit set and does not
    /// wait for or expect a response.
    pub async fn send_oneway(&self, command: TenuredCommand, timeout: Duration) -> Result<(), TenuredError> {
        if !self.is_running() {
            return Err(TenuredError::Closed);
        }
        self.channel.write(&command.set_oneway(true), timeout).await
    }
}

fn rebind_id(command: TenuredCommand, id: u32) -> TenuredCommand {
    TenuredCommand::request(id, command.code, command.header, command.body)
}

/// A bare transport ACK (spec §4.2 step 1): the server's acknowledgment
/// that a request was received, sent before the handler runs. It carries
/// no code, header, or body and is not the handler's response — only a
/// delivery signal, so it must not complete the waiting `invoke`.
fn is_transport_ack(cmd: &TenuredCommand) -> bool {
    cmd.code == 0 && !cmd.is_error() && cmd.header.is_empty() && cmd.body.is_empty()
}

impl ChannelHandler for TenuredClient {
    fn on_message(&self, _channel: &RemotingChannel, cmd: TenuredCommand) {
        if cmd.is_ack() {
            if is_transport_ack(&cmd) {
                return;
            }
            // A late response after the waiter already timed out is a
            // silent no-op, not an error (spec §4.2).
            self.correlation.complete(cmd.id, cmd);
            return;
        }
        if let Some(handler) = &self.request_handler {
            handler(self.channel.clone(), cmd);
        }
    }

    fn on_close(&self, _channel: &RemotingChannel) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.correlation.fail_all_closed();
    }

    fn max_frame_size(&self) -> u32 {
        crate::codec::DEFAULT_MAX_FRAME_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::sink;

    fn test_channel() -> RemotingChannel {
        RemotingChannel::new("test".to_string(), Box::new(sink()))
    }

    #[tokio::test]
    async fn invoke_times_out_and_clears_its_slot() {
        let client = TenuredClient::new(test_channel());
        let result = client
            .invoke(TenuredCommand::request(0, 0x1000, vec![], b"ping".to_vec()), Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(TenuredError::Timeout)));
        assert_eq!(client.correlation.len(), 0);
    }

    #[tokio::test]
    async fn inbound_ack_completes_the_waiting_invoke() {
        let client = TenuredClient::new(test_channel());
        let client_for_invoke = client.clone();
        let invoke = tokio::spawn(async move {
            client_for_invoke
                .invoke(TenuredCommand::request(0, 0x1000, vec![], b"ping".to_vec()), Duration::from_secs(1))
                .await
        });

        // `invoke` allocates id 1 from a fresh table; wait for its slot to
        // register, then simulate the peer's response arriving on the
        // reader loop.
        while client.correlation.is_empty() {
            tokio::task::yield_now().await;
        }
        client.on_message(&client.channel.clone(), TenuredCommand::response(1, 0x1000, vec![], b"pong".to_vec()));

        let response = invoke.await.unwrap().unwrap();
        assert_eq!(response.body, b"pong");
    }

    #[tokio::test]
    async fn bare_transport_ack_does_not_complete_the_invoke_but_the_response_after_it_does() {
        let client = TenuredClient::new(test_channel());
        let client_for_invoke = client.clone();
        let invoke = tokio::spawn(async move {
            client_for_invoke
                .invoke(TenuredCommand::request(0, 0x1000, vec![], b"ping".to_vec()), Duration::from_secs(1))
                .await
        });

        while client.correlation.is_empty() {
            tokio::task::yield_now().await;
        }

        // The transport-level ACK the server sends before the handler runs
        // (spec §4.2 step 1): same id, code 0, empty body.
        client.on_message(&client.channel.clone(), TenuredCommand::ack(1));
        assert_eq!(client.correlation.len(), 1, "bare ack must not complete the slot");

        client.on_message(&client.channel.clone(), TenuredCommand::response(1, 0x1000, vec![], b"pong".to_vec()));
        let response = invoke.await.unwrap().unwrap();
        assert_eq!(response.body, b"pong");
    }

    #[tokio::test]
    async fn on_close_fails_every_pending_invoke() {
        let client = TenuredClient::new(test_channel());
        let client_for_invoke = client.clone();
        let invoke = tokio::spawn(async move {
            client_for_invoke
                .invoke(TenuredCommand::request(0, 0x1000, vec![], vec![]), Duration::from_secs(5))
                .await
        });
        // give the spawned invoke a chance to register its slot before close
        while client.correlation.is_empty() {
            tokio::task::yield_now().await;
        }
        client.on_close(&client.channel.clone());
        assert!(matches!(invoke.await.unwrap(), Err(TenuredError::ChannelClosed)));
    }
}
