//! Broker Session (SPEC_FULL.md §4.3): owns the single long-lived AMQP
//! connection, (re)dials it with decorrelated jitter backoff, declares the
//! exchange, and hands out confirm-mode channels wrapped as
//! [`PublisherWorker`]s. Mirrors the source's `AMQPOutput`/`setup()`, with
//! the mutex released across the backoff sleep exactly as the original does.
//!
//! Reconnect is driven by `Connection::on_error`, the one lapin 2.x hook the
//! retrieval pack confirms exists. Block-state (source: `NotifyBlocked`) has
//! no equivalent in the pack, so `Inner::blocked` is carried but synthesized
//! as always-false rather than backed by a poll or callback that doesn't
//! exist on lapin's `ConnectionStatus`.

use std::sync::Arc;
use std::time::Duration;

use lapin::options::{ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_amqp::LapinTokioExt;

use crate::config::BrokerConfig;

use super::worker::PublisherWorker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("error connecting to broker: {0}")]
    Connect(#[from] lapin::Error),
    #[error("error declaring exchange {exchange:?}: {source}")]
    DeclareExchange {
        exchange: String,
        #[source]
        source: lapin::Error,
    },
    #[error("unknown exchange type {0:?} (expected direct, fanout, topic, or headers)")]
    UnknownExchangeType(String),
    #[error("connection not open")]
    NotConnected,
    #[error("blocked by broker")]
    Blocked,
}

struct Inner {
    connection: Option<Connection>,
    /// Toggled by a broker block notification (SPEC_FULL.md §4.3 invariant
    /// ii). No example in the retrieval pack demonstrates a push or pull
    /// lapin API for `connection.blocked` (lapin's `ConnectionStatus` has no
    /// `blocked()` accessor), so this is synthesized as always-false — never
    /// blocked — the same treatment SPEC_FULL.md §9 permits for a missing
    /// flow stream. `new_worker` still consults it, so wiring in a real
    /// signal later (should lapin or a successor crate expose one) is a
    /// one-line change.
    blocked: bool,
}

/// Holds the collector's single AMQP connection. Reconnects transparently in
/// the background on connection error; callers of [`Self::new_worker`] only
/// ever see [`BrokerError::NotConnected`] during the brief window a
/// reconnect is in flight.
pub struct BrokerSession {
    config: BrokerConfig,
    inner: Mutex<Inner>,
}

impl BrokerSession {
    /// Dials the broker and declares the exchange once, failing fast if
    /// either step doesn't succeed. Once started, connection loss is
    /// handled by an unattended background reconnect loop that never gives
    /// up, matching the source's `setup()`.
    pub async fn start(config: BrokerConfig) -> Result<Arc<Self>, BrokerError> {
        let connection = try_connect(&config).await?;
        let session = Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                connection: Some(connection),
                blocked: false,
            }),
        });
        session.clone().install_close_watcher().await;
        Ok(session)
    }

    /// Opens a fresh confirm-mode channel sized for a bundle of
    /// `bundle_size_hint` records and wraps it as a [`PublisherWorker`].
    /// Refuses while the connection is blocked or not yet (re)established
    /// (SPEC_FULL.md §4.3 invariant ii), rather than opening a channel that
    /// would only stall.
    pub async fn new_worker(&self, bundle_size_hint: usize) -> Result<PublisherWorker, BrokerError> {
        let guard = self.inner.lock().await;
        if guard.blocked {
            return Err(BrokerError::Blocked);
        }
        let connection = guard.connection.as_ref().ok_or(BrokerError::NotConnected)?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(PublisherWorker::new(
            channel,
            self.config.exchange_name.clone(),
            self.config.format,
            bundle_size_hint,
        ))
    }

    /// Registers the connection-error hook that drives reconnect. Run once,
    /// right after a successful dial.
    async fn install_close_watcher(self: Arc<Self>) {
        let guard = self.inner.lock().await;
        if let Some(conn) = guard.connection.as_ref() {
            let watcher = Arc::clone(&self);
            conn.on_error(move |err| {
                tracing::error!(error = %err, "broker connection closed, reconnecting");
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move { watcher.reconnect().await });
            });
        }
    }

    async fn reconnect(self: Arc<Self>) {
        {
            let mut guard = self.inner.lock().await;
            guard.connection = None;
            guard.blocked = false;
        }
        let connection = connect_forever(&self.config).await;
        let mut guard = self.inner.lock().await;
        guard.connection = Some(connection);
        drop(guard);
        tracing::info!("broker connection reestablished");
        self.clone().install_close_watcher().await;
    }

}

fn exchange_kind(name: &str) -> Result<ExchangeKind, BrokerError> {
    Ok(match name {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        other => return Err(BrokerError::UnknownExchangeType(other.to_owned())),
    })
}

async fn declare_exchange(connection: &Connection, config: &BrokerConfig) -> Result<(), BrokerError> {
    let channel = connection.create_channel().await?;
    let kind = exchange_kind(&config.exchange_type)?;
    channel
        .exchange_declare(
            &config.exchange_name,
            kind,
            ExchangeDeclareOptions {
                durable: config.exchange_durable,
                auto_delete: config.exchange_auto_delete,
                internal: config.exchange_internal,
                nowait: false,
                passive: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|source| BrokerError::DeclareExchange {
            exchange: config.exchange_name.clone(),
            source,
        })
}

/// Dials once, retrying network errors forever with decorrelated jitter
/// backoff. Returns as soon as the exchange is declared; an exchange-declare
/// failure (bad exchange type, a durability mismatch against an existing
/// exchange, ...) is returned rather than retried, since retrying it would
/// never succeed.
async fn try_connect(config: &BrokerConfig) -> Result<Connection, BrokerError> {
    let mut delay = config.initial_retry_delay;
    loop {
        let dial = Connection::connect(&config.uri(), ConnectionProperties::default().with_tokio()).await;
        match dial {
            Ok(connection) => return declare_exchange(&connection, config).await.map(|_| connection),
            Err(err) => {
                tracing::warn!(error = %err, ?delay, "error connecting to broker, retrying");
                tokio::time::sleep(delay).await;
                delay = decorrelated_jitter(delay, config.initial_retry_delay, config.max_retry_delay);
            }
        }
    }
}

/// Like [`try_connect`], but an exchange-declare failure is retried instead
/// of returned: used by the background reconnect loop, where giving up
/// isn't an option.
async fn connect_forever(config: &BrokerConfig) -> Connection {
    let mut delay = config.initial_retry_delay;
    loop {
        match try_connect(config).await {
            Ok(connection) => return connection,
            Err(err) => {
                tracing::error!(error = %err, ?delay, "error reestablishing broker session, retrying");
                tokio::time::sleep(delay).await;
                delay = decorrelated_jitter(delay, config.initial_retry_delay, config.max_retry_delay);
            }
        }
    }
}

/// Decorrelated jitter backoff (SPEC_FULL.md §4.3/§8): next delay is drawn
/// uniformly from `[base, 3 * last]`, clamped to `max`. Not strictly
/// monotonic by construction (it's randomized); see DESIGN.md for why this
/// crate follows the source's algorithm rather than forcing a
/// non-decreasing sequence.
fn decorrelated_jitter(last: Duration, base: Duration, max: Duration) -> Duration {
    let base_ms = (base.as_millis() as u64).max(1);
    let last_ms = (last.as_millis() as u64).max(base_ms);
    let upper = last_ms.saturating_mul(3).max(base_ms);
    let next_ms = rand::thread_rng().gen_range(base_ms..=upper);
    Duration::from_millis(next_ms).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_kind_maps_known_names() {
        assert!(matches!(exchange_kind("direct"), Ok(ExchangeKind::Direct)));
        assert!(matches!(exchange_kind("fanout"), Ok(ExchangeKind::Fanout)));
        assert!(matches!(exchange_kind("topic"), Ok(ExchangeKind::Topic)));
        assert!(matches!(exchange_kind("headers"), Ok(ExchangeKind::Headers)));
    }

    #[test]
    fn exchange_kind_rejects_unknown_names() {
        assert!(matches!(
            exchange_kind("bogus"),
            Err(BrokerError::UnknownExchangeType(_))
        ));
    }

    #[test]
    fn decorrelated_jitter_stays_within_base_and_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        let mut last = base;
        for _ in 0..500 {
            let next = decorrelated_jitter(last, base, max);
            assert!(next >= base);
            assert!(next <= max);
            last = next;
        }
    }

    #[test]
    fn decorrelated_jitter_eventually_clamps_to_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(500);
        let mut last = base;
        let mut hit_max = false;
        for _ in 0..200 {
            last = decorrelated_jitter(last, base, max);
            if last == max {
                hit_max = true;
                break;
            }
        }
        assert!(hit_max, "backoff never reached the configured max");
    }
}
