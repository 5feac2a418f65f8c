//! Bundle Processor (SPEC_FULL.md §4.5): turns one `bundle` request body
//! into a scanned sequence of records, publishes each, and waits for the
//! broker's confirms. Mirrors the source's `ProcessBundle`.

use std::time::Duration;

use libgracc::{JobUsageRecord, Record, RecordParseError};

use crate::broker::{PublisherWorker, WorkerError};
use crate::scanner::{BundleScanner, ScanError, ScanLimits};
use crate::stats::{Event, StatsBus};

/// What a bundle processor needs from a worker. [`PublisherWorker`]
/// implements this directly; tests use an in-memory fake so SPEC_FULL.md
/// §8's bundle-processor scenarios don't need a live broker.
#[async_trait::async_trait]
pub trait Worker: Send {
    async fn publish(&mut self, record: &JobUsageRecord) -> Result<(), WorkerError>;
    async fn wait(&mut self, timeout: Duration) -> Result<(), WorkerError>;
    async fn close(self);
}

#[async_trait::async_trait]
impl Worker for PublisherWorker {
    async fn publish(&mut self, record: &JobUsageRecord) -> Result<(), WorkerError> {
        PublisherWorker::publish(self, record).await
    }

    async fn wait(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        PublisherWorker::wait(self, timeout).await
    }

    async fn close(self) {
        PublisherWorker::close(self).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("error scanning bundle: {0}")]
    Scan(#[from] ScanError),
    #[error("error parsing record: {0}")]
    RecordParse(#[from] RecordParseError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("unexpected end of bundle while reading a replication group")]
    TruncatedGroup,
    #[error("actual bundle size ({actual}) different than expected ({expected})")]
    SizeMismatch { expected: usize, actual: usize },
}

/// Scans `payload` for `replication` groups, publishes each record found,
/// and waits for the broker's confirms. The worker is closed on every exit
/// path, success or failure, per SPEC_FULL.md §4.5.
pub async fn process_bundle<W: Worker>(
    mut worker: W,
    payload: &[u8],
    declared_size: usize,
    limits: ScanLimits,
    wait_timeout: Duration,
    stats: &StatsBus,
) -> Result<(), BundleError> {
    let outcome = run(&mut worker, payload, declared_size, limits, wait_timeout, stats).await;
    worker.close().await;
    outcome
}

async fn run<W: Worker>(
    worker: &mut W,
    payload: &[u8],
    declared_size: usize,
    limits: ScanLimits,
    wait_timeout: Duration,
    stats: &StatsBus,
) -> Result<(), BundleError> {
    let mut scanner = BundleScanner::new(payload, limits);
    let mut received = 0usize;

    loop {
        let token = match scanner.next() {
            Some(tok) => tok?,
            None => break,
        };
        if token.is_empty() {
            continue;
        }
        if token != b"replication".as_slice() {
            continue;
        }

        let record_token = next_group_token(&mut scanner)?;
        let _raw_token = next_group_token(&mut scanner)?;
        let _extra_token = next_group_token(&mut scanner)?;

        stats.emit(Event::GotRecord);
        let record = match JobUsageRecord::parse_xml(record_token) {
            Ok(record) => record,
            Err(err) => {
                stats.emit(Event::RecordError);
                return Err(BundleError::RecordParse(err));
            }
        };

        if let Err(err) = worker.publish(&record).await {
            stats.emit(Event::RecordError);
            return Err(BundleError::Worker(err));
        }
        received += 1;
    }

    if received != declared_size {
        return Err(BundleError::SizeMismatch {
            expected: declared_size,
            actual: received,
        });
    }

    worker.wait(wait_timeout).await?;
    Ok(())
}

fn next_group_token<'a>(
    scanner: &mut BundleScanner<'a>,
) -> Result<&'a [u8], BundleError> {
    match scanner.next() {
        Some(tok) => Ok(tok?),
        None => Err(BundleError::TruncatedGroup),
    }
}
