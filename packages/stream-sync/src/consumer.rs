use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::broker::{bounded, StreamBroker, StreamEntry, StreamRead, NEW_ENTRIES, PENDING_ORIGIN};
use crate::config::ConsumerSettings;
use crate::error::{BrokerError, SyncError};
use crate::handler::{Disposition, RequestHandler};
use crate::metrics::SyncMetrics;

/// Where the next read on a stream starts.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Cursor {
    /// Replaying this consumer's unacknowledged entries, after the given id.
    Pending(String),
    /// Reading entries never delivered to the group.
    New,
}

/// Consumer-group reader for the input streams.
///
/// On start it replays the entries it claimed before a restart but never
/// acknowledged, then blocks on new entries. Entries are handled one at a
/// time in the order the broker returned them.
pub struct GroupConsumer {
    broker: Arc<dyn StreamBroker>,
    handler: RequestHandler,
    settings: ConsumerSettings,
    cursors: Vec<(String, Cursor)>,
    metrics: SyncMetrics,
}

impl GroupConsumer {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        handler: RequestHandler,
        settings: ConsumerSettings,
        metrics: SyncMetrics,
    ) -> Self {
        let cursors = settings
            .input_streams
            .iter()
            .map(|stream| (stream.clone(), Cursor::Pending(PENDING_ORIGIN.to_string())))
            .collect();

        Self {
            broker,
            handler,
            settings,
            cursors,
            metrics,
        }
    }

    /// Creates the consumer group on every input stream. Failures, including
    /// an already existing group, are logged and ignored.
    pub async fn ensure_groups(&self) {
        for stream in &self.settings.input_streams {
            let created = bounded(
                "create_group",
                self.settings.operation_timeout,
                self.broker.create_group(stream, &self.settings.group),
            )
            .await;

            match created {
                Ok(()) => info!(stream = %stream, group = %self.settings.group, "Created consumer group"),
                Err(e) => warn!(stream = %stream, error = %e, "Error creating consumer group"),
            }
        }
    }

    /// Claims the next batch.
    ///
    /// While pending entries remain they are returned first, without
    /// blocking. Afterwards the read blocks for up to the configured block
    /// time; an empty batch means nothing arrived in that window.
    pub async fn poll(&mut self) -> Result<Vec<StreamEntry>, BrokerError> {
        let backlog: Vec<StreamRead> = self
            .cursors
            .iter()
            .filter_map(|(stream, cursor)| match cursor {
                Cursor::Pending(after) => Some(StreamRead {
                    stream: stream.clone(),
                    after: after.clone(),
                }),
                Cursor::New => None,
            })
            .collect();

        if !backlog.is_empty() {
            let entries = bounded(
                "read_group",
                self.settings.operation_timeout,
                self.broker.read_group(
                    &self.settings.group,
                    &self.settings.consumer,
                    &backlog,
                    self.settings.batch_size,
                    None,
                ),
            )
            .await?;

            for (stream, cursor) in self.cursors.iter_mut() {
                if let Cursor::Pending(after) = cursor {
                    match entries.iter().rev().find(|e| &e.stream == stream) {
                        Some(last) => *after = last.id.clone(),
                        None => {
                            info!(stream = %stream, "Pending entries replayed, reading new entries");
                            *cursor = Cursor::New;
                        }
                    }
                }
            }

            if !entries.is_empty() {
                debug!(count = entries.len(), "Replaying pending entries");
                return Ok(entries);
            }
        }

        let reads: Vec<StreamRead> = self
            .cursors
            .iter()
            .map(|(stream, _)| StreamRead {
                stream: stream.clone(),
                after: NEW_ENTRIES.to_string(),
            })
            .collect();

        bounded(
            "read_group",
            self.settings.block + self.settings.operation_timeout,
            self.broker.read_group(
                &self.settings.group,
                &self.settings.consumer,
                &reads,
                self.settings.batch_size,
                Some(self.settings.block),
            ),
        )
        .await
    }

    /// Handles every entry of a batch in order and acknowledges those whose
    /// terminal action succeeded. Returns the number acknowledged.
    pub async fn process_batch(&self, batch: &[StreamEntry]) -> Result<usize, BrokerError> {
        let mut acked = 0;
        for entry in batch {
            if self.handler.handle(entry).await? == Disposition::Ack {
                bounded(
                    "ack",
                    self.settings.operation_timeout,
                    self.broker.ack(&entry.stream, &self.settings.group, &entry.id),
                )
                .await?;
                self.metrics.acks.add(1, &[]);
                acked += 1;
            }
        }
        Ok(acked)
    }

    /// Runs until `shutdown` resolves or a broker error occurs.
    ///
    /// Shutdown is only observed between batches, so a batch that has
    /// started is always finished.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        self.ensure_groups().await;
        info!(
            streams = ?self.settings.input_streams,
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "Consumer started"
        );

        tokio::pin!(shutdown);
        loop {
            let batch = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                batch = self.poll() => batch?,
            };

            if batch.is_empty() {
                continue;
            }

            debug!(count = batch.len(), "Consumed batch");
            self.process_batch(&batch).await?;
        }

        info!("Consumer stopped");
        Ok(())
    }
}
