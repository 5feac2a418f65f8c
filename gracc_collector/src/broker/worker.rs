//! Publisher Worker (SPEC_FULL.md §4.4): a short-lived wrapper around one
//! confirm-mode AMQP channel. Tracks delivery tags, waits for confirms, and
//! surfaces returns, nacks, flow pauses, and channel closes as failures.
//!
//! lapin does not expose the four notification streams of the source's
//! `streadway/amqp` client as raw channels the way the original does. The
//! only lapin surface this crate has actual grounding for (see
//! `examples/other_examples/...szabgab-amqp-lapin-helper__src-lib.rs.rs`) is
//! `Channel::basic_publish(...).await` returning a `PublisherConfirm` future,
//! which itself resolves to `Result<Confirmation, lapin::Error>`. This
//! worker synthesizes the four streams SPEC_FULL.md §9 calls for entirely
//! from that one future, rather than from unverified callbacks:
//!
//! - confirms: the resolved `Confirmation::Ack`/`Nack` feeds the confirms
//!   channel, keyed by the delivery tag assigned at publish time.
//! - returns: `Confirmation::Ack`/`Nack` both carry an
//!   `Option<Box<BasicReturnMessage>>` — a *present* inner message means the
//!   broker couldn't route a mandatory publish and returned it (it is still
//!   acked-or-nacked independently). That case also feeds the returns
//!   channel.
//! - channel-close: if the confirmation future itself resolves to `Err`, the
//!   channel broke while we were waiting on it; that feeds the close
//!   channel.
//! - flow: no grounded push or pull signal for `channel.flow` exists
//!   anywhere in the retrieval pack (RabbitMQ doesn't implement it in
//!   practice; connection-level backpressure is the closer analogue, and
//!   [`super::BrokerSession`]'s `Inner.blocked` is itself synthesized for the
//!   same reason), so the flow channel is wired up but never fed, i.e.
//!   modeled as always-false (never paused), exactly as SPEC_FULL.md §9
//!   allows for a missing stream.

use std::time::Duration;

use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::{BasicProperties, Channel};
use tokio::sync::mpsc;

use libgracc::Record;

use crate::encoder::{self, EncodeError, WireFormat};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("under flow control")]
    FlowControl,
    #[error("error encoding record for publish: {0}")]
    Encode(#[from] EncodeError),
    #[error("error publishing to channel: {0}")]
    Publish(#[from] lapin::Error),
    #[error("timed out while waiting for confirms")]
    Timeout,
    #[error("channel closed while waiting for confirms")]
    ChannelClosed,
    #[error("{0} records were returned")]
    Returned(usize),
    #[error("{0} records were not successfully sent")]
    Nacked(usize),
}

/// The pure decision state behind `wait` (SPEC_FULL.md §8 properties):
/// tag bookkeeping, plus return/nack counting. Kept free of any transport so
/// it can be unit-tested without a broker.
#[derive(Debug, Default)]
struct ConfirmTracker {
    last_tag: u64,
    returns: usize,
    nacks: usize,
}

enum Progress {
    Continue,
    Done,
}

impl ConfirmTracker {
    fn on_publish(&mut self) -> u64 {
        self.last_tag += 1;
        self.last_tag
    }

    fn on_confirm(&mut self, tag: u64, ack: bool) -> Progress {
        if !ack {
            self.nacks += 1;
        }
        if tag >= self.last_tag {
            Progress::Done
        } else {
            Progress::Continue
        }
    }

    fn on_return(&mut self) {
        self.returns += 1;
    }

    fn outcome(&self) -> Result<(), WorkerError> {
        if self.returns > 0 {
            return Err(WorkerError::Returned(self.returns));
        }
        if self.nacks > 0 {
            return Err(WorkerError::Nacked(self.nacks));
        }
        Ok(())
    }
}

struct Confirm {
    tag: u64,
    ack: bool,
}

/// Owns exactly one confirm-mode channel. Single-threaded from the caller's
/// perspective: publish and wait are never called concurrently on one
/// worker (invariant, SPEC_FULL.md §3).
pub struct PublisherWorker {
    channel: Channel,
    exchange: String,
    format: WireFormat,
    tracker: ConfirmTracker,
    confirms_tx: mpsc::Sender<Confirm>,
    confirms_rx: mpsc::Receiver<Confirm>,
    returns_tx: mpsc::Sender<()>,
    returns_rx: mpsc::Receiver<()>,
    close_tx: mpsc::Sender<()>,
    close_rx: mpsc::Receiver<()>,
    flow_rx: mpsc::Receiver<bool>,
    _flow_tx: mpsc::Sender<bool>,
}

impl PublisherWorker {
    /// Wraps `channel` (already in confirm mode) as a worker for a bundle of
    /// `bundle_size_hint` records. Buffer capacities scale with the hint,
    /// per SPEC_FULL.md §4.3. `returns_tx`/`close_tx` are cloned into each
    /// publish's spawned confirmation-await task; there is no callback-based
    /// feed for either (see the module doc comment).
    pub(super) fn new(
        channel: Channel,
        exchange: String,
        format: WireFormat,
        bundle_size_hint: usize,
    ) -> Self {
        let capacity = bundle_size_hint.max(1);
        let (confirms_tx, confirms_rx) = mpsc::channel(capacity);
        let (returns_tx, returns_rx) = mpsc::channel(capacity);
        let (close_tx, close_rx) = mpsc::channel(1);
        let (flow_tx, flow_rx) = mpsc::channel(1);

        Self {
            channel,
            exchange,
            format,
            tracker: ConfirmTracker::default(),
            confirms_tx,
            confirms_rx,
            returns_tx,
            returns_rx,
            close_tx,
            close_rx,
            flow_rx,
            _flow_tx: flow_tx,
        }
    }

    /// Number of successful publish calls so far (`lastTag` in SPEC_FULL.md
    /// §4.4).
    pub fn last_tag(&self) -> u64 {
        self.tracker.last_tag
    }

    /// Publishes one record. Non-blocking except for the broker's TCP
    /// write; does not wait for the confirm.
    pub async fn publish<R: Record>(&mut self, record: &R) -> Result<(), WorkerError> {
        check_flow(&mut self.flow_rx)?;

        let encoded = encoder::encode(record, self.format)?;
        let props = BasicProperties::default().with_content_type(encoded.content_type.into());

        tracing::debug!(exchange = %self.exchange, record = record.id(), "publishing record");

        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                "", // fixed: empty routing key, see SPEC_FULL.md §9
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                &encoded.body,
                props,
            )
            .await?;

        let tag = self.tracker.on_publish();
        let confirms_tx = self.confirms_tx.clone();
        let returns_tx = self.returns_tx.clone();
        let close_tx = self.close_tx.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(returned)) => {
                    if returned.is_some() {
                        let _ = returns_tx.send(()).await;
                    }
                    let _ = confirms_tx.send(Confirm { tag, ack: true }).await;
                }
                Ok(Confirmation::Nack(returned)) => {
                    if returned.is_some() {
                        let _ = returns_tx.send(()).await;
                    }
                    let _ = confirms_tx.send(Confirm { tag, ack: false }).await;
                }
                Ok(Confirmation::NotRequested) => {
                    let _ = confirms_tx.send(Confirm { tag, ack: true }).await;
                }
                Err(_) => {
                    // The confirmation future itself failed: the channel
                    // broke while this publish was in flight. There is no
                    // other grounded close signal (see module doc comment),
                    // so this is what feeds `close_rx`.
                    let _ = close_tx.send(()).await;
                }
            }
        });

        tracing::debug!(exchange = %self.exchange, record = record.id(), tag, "record sent");
        return Ok(());
    }

    /// Waits for confirms covering every publish issued so far. A `timeout`
    /// of `Duration::ZERO` means wait forever.
    pub async fn wait(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        if self.tracker.last_tag == 0 {
            tracing::warn!("no records were sent");
            return Ok(());
        }

        let mut sleep = (timeout > Duration::ZERO).then(|| Box::pin(tokio::time::sleep(timeout)));

        loop {
            tokio::select! {
                _ = async { sleep.as_mut().unwrap().await }, if sleep.is_some() => {
                    tracing::warn!(?timeout, "timed out while waiting for confirms");
                    return Err(WorkerError::Timeout);
                }
                closed = self.close_rx.recv() => {
                    if closed.is_some() {
                        tracing::error!("channel closed while waiting for confirms");
                        return Err(WorkerError::ChannelClosed);
                    }
                }
                ret = self.returns_rx.recv() => {
                    if ret.is_some() {
                        tracing::warn!("record returned");
                        self.tracker.on_return();
                    }
                }
                confirm = self.confirms_rx.recv() => {
                    if let Some(c) = confirm {
                        tracing::debug!(tag = c.tag, ack = c.ack, "confirm");
                        if let Progress::Done = self.tracker.on_confirm(c.tag, c.ack) {
                            break;
                        }
                    }
                }
            }
        }

        let outcome = self.tracker.outcome();
        if outcome.is_ok() {
            tracing::debug!("all records sent successfully");
        }
        return outcome;
    }

    /// Closes the underlying channel. Does not wait on any notification
    /// stream — call [`Self::wait`] first if atomicity is required.
    pub async fn close(self) {
        if let Err(err) = self.channel.close(200, "worker done").await {
            tracing::debug!(error = %err, "error closing worker channel");
        }
    }
}

fn check_flow(flow_rx: &mut mpsc::Receiver<bool>) -> Result<(), WorkerError> {
    if let Ok(false) = flow_rx.try_recv() {
        return Err(WorkerError::FlowControl);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_monotonicity_after_n_publishes() {
        let mut tracker = ConfirmTracker::default();
        for expected in 1..=5u64 {
            assert_eq!(tracker.on_publish(), expected);
        }
        assert_eq!(tracker.last_tag, 5);
    }

    #[test]
    fn wait_sufficiency_single_confirm_covers_all_prior_publishes() {
        let mut tracker = ConfirmTracker::default();
        for _ in 0..3 {
            tracker.on_publish();
        }
        // Confirms are cumulative: observing tag == last_tag with no
        // returns/nacks is success, even though only one confirm arrived.
        assert!(matches!(tracker.on_confirm(3, true), Progress::Done));
        assert!(tracker.outcome().is_ok());
    }

    #[test]
    fn early_confirm_does_not_end_the_wait() {
        let mut tracker = ConfirmTracker::default();
        for _ in 0..3 {
            tracker.on_publish();
        }
        assert!(matches!(tracker.on_confirm(1, true), Progress::Continue));
    }

    #[test]
    fn returns_fail_even_with_final_ack() {
        let mut tracker = ConfirmTracker::default();
        tracker.on_publish();
        tracker.on_return();
        tracker.on_confirm(1, true);
        let err = tracker.outcome().unwrap_err();
        assert!(matches!(err, WorkerError::Returned(1)));
    }

    #[test]
    fn nacks_fail_when_no_returns() {
        let mut tracker = ConfirmTracker::default();
        tracker.on_publish();
        tracker.on_confirm(1, false);
        let err = tracker.outcome().unwrap_err();
        assert!(matches!(err, WorkerError::Nacked(1)));
    }

    #[test]
    fn returns_take_priority_over_nacks_in_error_message() {
        let mut tracker = ConfirmTracker::default();
        tracker.on_publish();
        tracker.on_return();
        tracker.on_confirm(1, false);
        let err = tracker.outcome().unwrap_err();
        assert!(matches!(err, WorkerError::Returned(1)));
    }

    #[tokio::test]
    async fn flow_control_signal_fails_fast() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.send(false).await.unwrap();
        assert!(matches!(check_flow(&mut rx), Err(WorkerError::FlowControl)));
    }

    #[tokio::test]
    async fn no_flow_signal_passes() {
        let (_tx, mut rx) = mpsc::channel::<bool>(1);
        assert!(check_flow(&mut rx).is_ok());
    }
}
