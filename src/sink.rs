/// Notification sink: the one-way hand-off from the pipeline to whatever
/// speaks or displays notifications.
///
/// The pipeline pushes `NotificationRequest`s into a bounded channel; the
/// sink task drains it in order and hands each request to a
/// [`NotificationSink`]. Speech arbitration (dropping overlapping
/// low-priority lines and so on) belongs to the consumer behind the sink.
use crate::config::NotificationOutput;
use crate::engine::NotificationRequest;
use anyhow::{Context, Result};
use std::io::Write;
use tokio::sync::mpsc::Receiver;

pub trait NotificationSink: Send {
    fn deliver(&mut self, request: &NotificationRequest) -> Result<()>;
}

/// Writes every notification to the application log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn deliver(&mut self, request: &NotificationRequest) -> Result<()> {
        tracing::info!(
            rule = %request.rule_id,
            priority = request.priority,
            "NOTIFY: {}",
            request.message
        );
        Ok(())
    }
}

/// One JSON object per line, for an external speech process reading a pipe.
pub struct JsonLineSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLineSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> NotificationSink for JsonLineSink<W> {
    fn deliver(&mut self, request: &NotificationRequest) -> Result<()> {
        serde_json::to_writer(&mut self.writer, request)
            .context("failed to encode notification")?;
        self.writer.write_all(b"\n")?;
        self.writer.flush().context("failed to flush notification output")?;
        Ok(())
    }
}

pub fn for_output(output: NotificationOutput) -> Box<dyn NotificationSink> {
    match output {
        NotificationOutput::Log        => Box::new(TracingSink),
        NotificationOutput::JsonStdout => Box::new(JsonLineSink::stdout()),
    }
}

/// Drain the notification queue until every sender is gone. Delivery
/// failures are logged and skipped. Returns the number delivered.
pub async fn run(
    mut rx:   Receiver<NotificationRequest>,
    mut sink: Box<dyn NotificationSink>,
) -> Result<u64> {
    let mut delivered = 0;
    while let Some(request) = rx.recv().await {
        match sink.deliver(&request) {
            Ok(()) => delivered += 1,
            Err(e) => tracing::warn!("Failed to deliver notification '{}': {:#}", request.rule_id, e),
        }
    }
    tracing::debug!("Notification queue closed after {} deliveries", delivered);
    Ok(delivered)
}
