//! Consumer group runtime.
//!
//! A [`ConsumerGroup`] joins a Kafka consumer group, fans fetched messages
//! out to one task per assigned partition and hands every decoded payload to a
//! [`MessageHandler`]. Offsets are stored only after the handler succeeded and
//! are committed by the client's auto-commit timer, so delivery is
//! at-least-once.
//!
//! A handler error abandons the whole session: claim tasks stop, the group is
//! left and joined again after a backoff, and the failed message is fetched
//! again from the last committed offset. Undecodable messages are logged and
//! skipped so they cannot block their partition.
//!
//! Each claim buffers a bounded number of messages. A full buffer stalls
//! fetching until its handler catches up or the session is cancelled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaArgs;
use crate::registry::{RegistryError, SchemaRegistry};
use crate::wire::{self, WireError};

const CLAIM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    JoiningGroup,
    Ready,
    ConsumingClaims,
    Rebalancing,
    Draining,
    Closed,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("handler failed for {topic}[{partition}]@{offset}: {reason}")]
    Handler {
        topic: String,
        partition: i32,
        offset: i64,
        reason: String,
    },

    #[error("claim task stopped: {0}")]
    ClaimAborted(String),

    #[error("consumer closed before joining the group")]
    Closed,
}

/// Domain reaction to one decoded message.
///
/// Returning an error makes the runtime redeliver the message. Handlers that
/// already logged a business-level problem they cannot fix by retrying
/// (an unparsable payload, say) should return `Ok` instead.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: serde_json::Value) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Malformed(#[from] WireError),

    #[error("writer schema {0} is unknown to the registry")]
    UnknownSchema(u32),

    #[error(transparent)]
    Registry(RegistryError),
}

/// Envelope + registry decoding, shared by all claims of a consumer.
pub struct MessageDecoder {
    registry: Arc<dyn SchemaRegistry>,
}

impl MessageDecoder {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub async fn decode(&self, message: &[u8]) -> Result<serde_json::Value, DecodeError> {
        let (schema_id, binary) = wire::decode(message)?;
        let codec = match self.registry.resolve(schema_id).await {
            Ok(codec) => codec,
            Err(RegistryError::SchemaNotFound(id)) => return Err(DecodeError::UnknownSchema(id)),
            Err(RegistryError::Schema(e)) => return Err(DecodeError::Malformed(e)),
            Err(e) => return Err(DecodeError::Registry(e)),
        };
        Ok(codec.json_from_binary(binary)?)
    }
}

/// A fetched message detached from the client's buffers.
#[derive(Debug, Clone)]
pub struct ClaimedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

impl From<&BorrowedMessage<'_>> for ClaimedMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        }
    }
}

/// Records that a message has been fully processed.
pub trait OffsetMarker: Send + Sync + 'static {
    fn mark(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError>;
}

impl OffsetMarker for StreamConsumer<GroupContext> {
    fn mark(&self, topic: &str, partition: i32, offset: i64) -> Result<(), KafkaError> {
        let mut offsets = TopicPartitionList::new();
        // The stored offset is the next one to read.
        offsets.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
        self.store_offsets(&offsets)
    }
}

fn mark_processed(marker: &dyn OffsetMarker, message: &ClaimedMessage) {
    if let Err(e) = marker.mark(&message.topic, message.partition, message.offset) {
        // The message stays uncommitted and may be seen again.
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            error = %e,
            "Failed to store offset"
        );
    }
}

/// Processes one partition claim until the claim is revoked, the channel
/// closes, or the handler fails.
///
/// Cancellation is only observed between messages: a handler call that has
/// started is always allowed to finish.
pub async fn process_claim(
    mut messages: mpsc::Receiver<ClaimedMessage>,
    decoder: Arc<MessageDecoder>,
    handler: Arc<dyn MessageHandler>,
    marker: Arc<dyn OffsetMarker>,
    stop: CancellationToken,
) -> Result<(), ConsumerError> {
    loop {
        let message = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(()),
            message = messages.recv() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        let Some(payload) = message.payload.as_deref() else {
            warn!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Skipping message without payload"
            );
            mark_processed(marker.as_ref(), &message);
            continue;
        };

        let decoded = match decoder.decode(payload).await {
            Ok(decoded) => decoded,
            Err(DecodeError::Registry(e)) => return Err(ConsumerError::Registry(e)),
            Err(e) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Skipping undecodable message"
                );
                mark_processed(marker.as_ref(), &message);
                continue;
            }
        };

        debug!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Message claimed"
        );

        if let Err(e) = handler.handle(decoded).await {
            return Err(ConsumerError::Handler {
                topic: message.topic,
                partition: message.partition,
                offset: message.offset,
                reason: format!("{e:#}"),
            });
        }

        mark_processed(marker.as_ref(), &message);
    }
}

pub type ClaimKey = (String, i32);

#[derive(Debug)]
enum RebalanceEvent {
    Assigned(Vec<ClaimKey>),
    Revoked(Vec<ClaimKey>),
}

fn claim_keys(partitions: &TopicPartitionList) -> Vec<ClaimKey> {
    partitions
        .elements()
        .iter()
        .map(|element| (element.topic().to_string(), element.partition()))
        .collect()
}

struct Claim {
    messages: mpsc::Sender<ClaimedMessage>,
    stop: CancellationToken,
}

/// The partition claims of one session: one [`process_claim`] task per
/// partition, started on the first message for it.
pub struct ClaimSet {
    claims: HashMap<ClaimKey, Claim>,
    tasks: JoinSet<(ClaimKey, Result<(), ConsumerError>)>,
    session: CancellationToken,
    decoder: Arc<MessageDecoder>,
    handler: Arc<dyn MessageHandler>,
    marker: Arc<dyn OffsetMarker>,
    buffer: usize,
}

impl ClaimSet {
    pub fn new(
        session: CancellationToken,
        decoder: Arc<MessageDecoder>,
        handler: Arc<dyn MessageHandler>,
        marker: Arc<dyn OffsetMarker>,
        buffer: usize,
    ) -> Self {
        Self {
            claims: HashMap::new(),
            tasks: JoinSet::new(),
            session,
            decoder,
            handler,
            marker,
            buffer: buffer.max(1),
        }
    }

    /// Partitions with a live claim.
    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    fn start(&mut self, key: &ClaimKey) -> &Claim {
        let (tx, rx) = mpsc::channel(self.buffer);
        let stop = self.session.child_token();

        let decoder = Arc::clone(&self.decoder);
        let handler = Arc::clone(&self.handler);
        let marker = Arc::clone(&self.marker);
        let claim_stop = stop.clone();
        let claim_key = key.clone();
        self.tasks.spawn(async move {
            let result = process_claim(rx, decoder, handler, marker, claim_stop).await;
            (claim_key, result)
        });

        debug!(topic = %key.0, partition = key.1, "Claim started");
        self.claims.entry(key.clone()).or_insert(Claim {
            messages: tx,
            stop,
        })
    }

    /// Hands `message` to its partition's claim, waiting for buffer space.
    /// Returns `false` when the session was cancelled first.
    pub async fn dispatch(&mut self, message: ClaimedMessage) -> bool {
        if self.session.is_cancelled() {
            return false;
        }
        let key = (message.topic.clone(), message.partition);

        let stale = self
            .claims
            .get(&key)
            .map_or(true, |claim| claim.messages.is_closed() || claim.stop.is_cancelled());
        if stale {
            self.claims.remove(&key);
        }
        let session = self.session.clone();
        let tx = match self.claims.get(&key) {
            Some(claim) => claim.messages.clone(),
            None => self.start(&key).messages.clone(),
        };

        tokio::select! {
            biased;
            _ = session.cancelled() => false,
            sent = tx.send(message) => {
                if sent.is_err() {
                    // The claim ended; its result arrives through `join_next`.
                    debug!(topic = %key.0, partition = key.1, "Claim closed, message dropped");
                }
                true
            }
        }
    }

    /// Stops the claims of revoked partitions after their current message.
    pub fn revoke(&mut self, keys: &[ClaimKey]) {
        for key in keys {
            if let Some(claim) = self.claims.remove(key) {
                claim.stop.cancel();
            }
        }
    }

    /// Result of the next claim task to finish; `None` while none run.
    pub async fn join_next(&mut self) -> Option<Result<(), ConsumerError>> {
        let joined = self.tasks.join_next().await?;
        Some(match joined {
            Ok((_, result)) => result,
            Err(e) => Err(ConsumerError::ClaimAborted(e.to_string())),
        })
    }

    /// Cancels every claim and waits for in-flight handler calls.
    pub async fn close(mut self) {
        self.session.cancel();
        self.claims.clear();
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok((key, Err(e))) = joined {
                warn!(topic = %key.0, partition = key.1, error = %e, "Claim failed while draining");
            }
        }
    }
}

/// Client context that routes librdkafka logs into `tracing` and reports
/// group membership changes to the runtime.
pub struct GroupContext {
    state: Arc<watch::Sender<ConsumerState>>,
    rebalances: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for GroupContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(target: "librdkafka", fac, "{log_message}"),
            RDKafkaLogLevel::Warning => warn!(target: "librdkafka", fac, "{log_message}"),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(target: "librdkafka", fac, "{log_message}")
            }
            RDKafkaLogLevel::Debug => debug!(target: "librdkafka", fac, "{log_message}"),
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(partitions = partitions.count(), "Partitions revoked");
            self.state.send_replace(ConsumerState::Rebalancing);
            let _ = self
                .rebalances
                .send(RebalanceEvent::Revoked(claim_keys(partitions)));
        }
    }

    fn post_rebalance<'a>(&self, rebalance: &Rebalance<'a>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "Partitions assigned");
                self.state.send_replace(ConsumerState::Ready);
                let _ = self
                    .rebalances
                    .send(RebalanceEvent::Assigned(claim_keys(partitions)));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!(error = %e, "Rebalance failed"),
        }
    }
}

/// Operator handle for a running [`ConsumerGroup`].
#[derive(Clone)]
pub struct ConsumerControl {
    paused: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerControl {
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Flips between paused and resumed; returns whether consumption is now
    /// paused.
    pub fn toggle(&self) -> bool {
        let mut now_paused = false;
        self.paused.send_modify(|paused| {
            *paused = !*paused;
            now_paused = *paused;
        });
        now_paused
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Resolves once the group has assigned partitions to this member.
    pub async fn wait_ready(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| {
                matches!(
                    s,
                    ConsumerState::Ready | ConsumerState::ConsumingClaims | ConsumerState::Closed
                )
            })
            .await
            .map_err(|_| ConsumerError::Closed)?;

        if *reached == ConsumerState::Closed {
            return Err(ConsumerError::Closed);
        }
        Ok(())
    }
}

enum SessionEnd {
    Cancelled,
    Failed(ConsumerError),
}

pub struct ConsumerGroup {
    consumer: Arc<StreamConsumer<GroupContext>>,
    topics: Vec<String>,
    decoder: Arc<MessageDecoder>,
    handler: Arc<dyn MessageHandler>,
    state: Arc<watch::Sender<ConsumerState>>,
    paused: watch::Receiver<bool>,
    rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    rejoin_backoff: Duration,
}

impl ConsumerGroup {
    pub fn new(
        args: &KafkaArgs,
        group_id: &str,
        topics: &[&str],
        registry: Arc<dyn SchemaRegistry>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(Self, ConsumerControl), ConsumerError> {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Created);
        let state = Arc::new(state_tx);
        let (paused_tx, paused_rx) = watch::channel(false);
        let (rebalance_tx, rebalance_rx) = mpsc::unbounded_channel();

        let context = GroupContext {
            state: Arc::clone(&state),
            rebalances: rebalance_tx,
        };
        let consumer: StreamConsumer<GroupContext> =
            args.consumer_config(group_id).create_with_context(context)?;

        let group = Self {
            consumer: Arc::new(consumer),
            topics: topics.iter().map(|t| (*t).to_string()).collect(),
            decoder: Arc::new(MessageDecoder::new(registry)),
            handler,
            state,
            paused: paused_rx,
            rebalances: rebalance_rx,
            rejoin_backoff: args.rejoin_backoff(),
        };
        let control = ConsumerControl {
            paused: Arc::new(paused_tx),
            state: state_rx,
        };

        Ok((group, control))
    }

    /// Runs sessions until `shutdown` is cancelled, rejoining the group after
    /// every failed session.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let topics = self.topics.clone();

        loop {
            self.state.send_replace(ConsumerState::JoiningGroup);
            let subscription: Vec<&str> = topics.iter().map(String::as_str).collect();
            self.consumer.subscribe(&subscription)?;
            info!(topics = ?self.topics, "Joined consumer group");

            let end = self.run_session(&shutdown).await;
            self.consumer.unsubscribe();

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(e) => {
                    error!(error = %e, "Consumer session abandoned, rejoining group");
                    self.state.send_replace(ConsumerState::Rebalancing);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.rejoin_backoff) => {}
                    }
                }
            }
        }

        self.state.send_replace(ConsumerState::Closed);
        info!(topics = ?self.topics, "Consumer closed");
        Ok(())
    }

    fn apply_pause(&self, paused: bool) {
        let assignment = match self.consumer.assignment() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(error = %e, "Failed to read assignment");
                return;
            }
        };

        let result = if paused {
            self.consumer.pause(&assignment)
        } else {
            self.consumer.resume(&assignment)
        };

        match result {
            Ok(()) if paused => info!("Pausing consumption"),
            Ok(()) => info!("Resuming consumption"),
            Err(e) => warn!(error = %e, "Failed to toggle consumption"),
        }
    }

    async fn run_session(&mut self, shutdown: &CancellationToken) -> SessionEnd {
        let marker: Arc<dyn OffsetMarker> = self.consumer.clone();
        let mut claims = ClaimSet::new(
            shutdown.child_token(),
            Arc::clone(&self.decoder),
            Arc::clone(&self.handler),
            marker,
            CLAIM_BUFFER,
        );

        let failure = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break None,
                Some(event) = self.rebalances.recv() => match event {
                    RebalanceEvent::Revoked(keys) => claims.revoke(&keys),
                    RebalanceEvent::Assigned(_) => {
                        if *self.paused.borrow() {
                            self.apply_pause(true);
                        }
                    }
                },
                Ok(()) = self.paused.changed() => {
                    let paused = *self.paused.borrow_and_update();
                    self.apply_pause(paused);
                }
                Some(result) = claims.join_next() => {
                    if let Err(e) = result {
                        break Some(e);
                    }
                }
                received = self.consumer.recv() => {
                    let message = match received {
                        Ok(message) => ClaimedMessage::from(&message),
                        Err(e) => {
                            warn!(error = %e, "Kafka error while consuming");
                            continue;
                        }
                    };

                    if *self.state.borrow() == ConsumerState::Ready {
                        self.state.send_replace(ConsumerState::ConsumingClaims);
                    }
                    if !claims.dispatch(message).await {
                        break None;
                    }
                }
            }
        };

        // Stop pulling; in-flight handler calls finish, buffered messages stay
        // unmarked and are redelivered to whoever owns the partition next.
        if failure.is_none() {
            self.state.send_replace(ConsumerState::Draining);
        }
        claims.close().await;

        match failure {
            None => SessionEnd::Cancelled,
            Some(e) => SessionEnd::Failed(e),
        }
    }
}

/// Builds a control handle detached from any Kafka client.
#[cfg(test)]
fn detached_control() -> (ConsumerControl, watch::Sender<ConsumerState>) {
    let (state_tx, state_rx) = watch::channel(ConsumerState::Created);
    let (paused_tx, _) = watch::channel(false);
    (
        ConsumerControl {
            paused: Arc::new(paused_tx),
            state: state_rx,
        },
        state_tx,
    )
}
