//! Decode sink seam.
//!
//! The loader never decodes; it hands each refinement to a [`DecodeSink`].

use crate::channel::ProgressiveChannel;
use crate::error::{ChannelError, SinkError};
use crate::loader::FrameResult;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Instant;
use tracing::{info, warn};

/// Receiver of delivered frame refinements
#[async_trait]
pub trait DecodeSink: Send + Sync {
    /// Decode or otherwise consume one refinement
    async fn deliver(&self, frame: &FrameResult) -> Result<(), SinkError>;

    /// Called when the frame's stream fails
    async fn on_error(&self, channel: &str, error: &ChannelError) {
        warn!(channel = %channel, error = %error, "Frame stream failed");
    }
}

/// Drain `channel` into `sink`, returning the number of refinements the sink
/// accepted.
///
/// A sink error skips that refinement; a stream failure is reported to the
/// sink and returned.
pub async fn consume<S>(
    channel: &ProgressiveChannel<FrameResult>,
    sink: &S,
) -> Result<usize, ChannelError>
where
    S: DecodeSink + ?Sized,
{
    let drain = channel.drain();
    futures::pin_mut!(drain);

    let mut delivered = 0usize;
    while let Some(item) = drain.next().await {
        match item {
            Ok(frame) => match sink.deliver(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    metrics::counter!("loader.sink.errors").increment(1);
                    warn!(
                        image_id = %frame.image_id,
                        stage_id = %frame.stage_id,
                        error = %e,
                        "Sink rejected frame"
                    );
                }
            },
            Err(e) => {
                sink.on_error(channel.name(), &e).await;
                return Err(e);
            }
        }
    }

    Ok(delivered)
}

/// Sink that logs every refinement instead of decoding it
#[derive(Debug)]
pub struct LoggingSink {
    started: Instant,
}

impl Default for LoggingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingSink {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl DecodeSink for LoggingSink {
    async fn deliver(&self, frame: &FrameResult) -> Result<(), SinkError> {
        info!(
            image_id = %frame.image_id,
            frame_index = frame.frame_index,
            stage_id = %frame.stage_id,
            status = %frame.fetch.quality_status,
            transfer_syntax = frame.transfer_syntax_uid.as_deref().unwrap_or("unknown"),
            content_type = %frame.fetch.content_type,
            bytes = frame.fetch.payload.len(),
            is_final = frame.fetch.is_final,
            load_time_ms = frame.load_time.as_millis() as u64,
            sink_time_ms = self.started.elapsed().as_millis() as u64,
            "Frame delivered"
        );
        Ok(())
    }
}
