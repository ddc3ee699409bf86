//! Progressive load orchestration.
//!
//! [`ProgressiveLoader::load`] resolves the retrieve plan for a set of
//! frames and runs it stage by stage, pushing every fetched refinement into
//! the frame's [`ProgressiveChannel`]. Stage order is the only delivery
//! order guarantee; frames within a stage complete in network order.

use crate::channel::ProgressiveChannel;
use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::fetcher::{FetchRequest, FetchResult, RangeFetcher};
use crate::options::{resolve_options, RetrieveOptions, StageOptions};
use crate::reassembly::PartialBuffers;
use crate::stages::{RetrieveConfiguration, StagePlan, StageResolver};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-load state: partial buffers, cancellation and the frame channels in
/// flight
#[derive(Debug)]
pub struct LoadSession {
    id: Uuid,
    buffers: PartialBuffers,
    cancel: CancellationToken,
    channels: Mutex<Vec<ProgressiveChannel<FrameResult>>>,
}

impl Default for LoadSession {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            buffers: PartialBuffers::new(),
            cancel: CancellationToken::new(),
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn buffers(&self) -> &PartialBuffers {
        &self.buffers
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drop all partial state and stop the load. Frame channels still in
    /// flight fail with [`LoadError::Purged`].
    pub fn purge(&self) {
        self.cancel.cancel();
        self.buffers.purge();

        let channels = std::mem::take(&mut *self.channels.lock());
        let mut failed = 0usize;
        for channel in channels {
            if !channel.is_done() && !channel.has_failed() {
                channel.fail(LoadError::Purged);
                failed += 1;
            }
        }
        info!(session_id = %self.id, failed_channels = failed, "Purged load session");
    }

    /// Track `channel` for purging, dropping channels that have settled.
    fn track(&self, channel: ProgressiveChannel<FrameResult>) {
        let mut channels = self.channels.lock();
        channels.retain(|tracked| !tracked.is_done() && !tracked.has_failed());
        channels.push(channel);
    }

    /// Frame channels a purge would still reach.
    pub fn tracked_channels(&self) -> usize {
        self.channels.lock().len()
    }
}

/// A frame to load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTarget {
    pub image_id: String,
    /// Frame URI containing a `/frames/` path segment
    pub uri: String,
}

impl FrameTarget {
    pub fn new(image_id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            uri: uri.into(),
        }
    }
}

/// Frames of one image set plus the plan to load them with
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub frames: Vec<FrameTarget>,
    pub transfer_syntax_uid: Option<String>,
    pub configuration: RetrieveConfiguration,
}

impl LoadRequest {
    pub fn new(frames: Vec<FrameTarget>) -> Self {
        Self {
            frames,
            transfer_syntax_uid: None,
            configuration: RetrieveConfiguration::default(),
        }
    }

    pub fn with_transfer_syntax(mut self, transfer_syntax_uid: impl Into<String>) -> Self {
        self.transfer_syntax_uid = Some(transfer_syntax_uid.into());
        self
    }

    pub fn with_configuration(mut self, configuration: RetrieveConfiguration) -> Self {
        self.configuration = configuration;
        self
    }
}

/// One delivered refinement, as handed to the decoder
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    pub image_id: String,
    pub frame_index: usize,
    pub stage_id: String,
    pub transfer_syntax_uid: Option<String>,
    pub fetch: FetchResult,
    /// Time from issuing the request to a parsed payload
    pub load_time: Duration,
    pub streaming: bool,
    pub decode_level: Option<u32>,
}

/// Progress of a load, pushed after every stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub stage_id: Option<String>,
    pub stages_completed: usize,
    pub frames_delivered: usize,
    pub frames_failed: usize,
    pub cancelled: bool,
}

/// Channels of a running load
#[derive(Debug)]
pub struct LoadHandle {
    /// One channel per requested frame, in request order
    pub frames: Vec<ProgressiveChannel<FrameResult>>,
    pub progress: ProgressiveChannel<LoadSummary>,
    session: Arc<LoadSession>,
}

impl LoadHandle {
    pub fn session(&self) -> &Arc<LoadSession> {
        &self.session
    }

    /// Wait until every stage has run, returning the last summary.
    pub async fn finished(&self) -> Option<LoadSummary> {
        self.progress.last().await.ok()
    }
}

/// Runs retrieve plans against a [`RangeFetcher`]
#[derive(Debug, Clone)]
pub struct ProgressiveLoader {
    fetcher: RangeFetcher,
    options: Option<Arc<RetrieveOptions>>,
}

impl ProgressiveLoader {
    /// `options` of `None` disables per-stage options; every stage then
    /// fetches the plain frame URI at full resolution.
    pub fn new(fetcher: RangeFetcher, options: Option<RetrieveOptions>) -> Self {
        Self {
            fetcher,
            options: options.map(Arc::new),
        }
    }

    pub fn from_config(config: &LoaderConfig) -> Result<Self, LoadError> {
        let fetcher = RangeFetcher::new(config.http.clone())?;
        Ok(Self::new(fetcher, Some(config.effective_options())))
    }

    /// Start loading `request` within `session`. Must be called within a
    /// Tokio runtime.
    pub fn load(&self, request: LoadRequest, session: Arc<LoadSession>) -> LoadHandle {
        let frames: Vec<ProgressiveChannel<FrameResult>> = request
            .frames
            .iter()
            .map(|target| {
                let channel = ProgressiveChannel::new(format!("{}:{}", session.id(), target.image_id));
                session.track(channel.clone());
                channel
            })
            .collect();
        let progress = ProgressiveChannel::new(format!("{}:progress", session.id()));

        info!(
            session_id = %session.id(),
            frames = request.frames.len(),
            stages = request.configuration.stages.len(),
            "Starting progressive load"
        );

        let driver = Driver {
            loader: self.clone(),
            request,
            session: session.clone(),
            frames: frames.clone(),
        };
        let producer = progress.clone();
        tokio::spawn(async move {
            producer
                .run_producer(move |progress| driver.run(progress))
                .await;
        });

        LoadHandle {
            frames,
            progress,
            session,
        }
    }

    fn stage_options(&self, transfer_syntax_uid: Option<&str>, plan: &StagePlan) -> StageOptions {
        resolve_options(
            self.options.as_deref(),
            transfer_syntax_uid,
            plan.retrieve_type_id.as_deref(),
        )
        .cloned()
        .unwrap_or_default()
    }
}

/// State of one load while its stages run
struct Driver {
    loader: ProgressiveLoader,
    request: LoadRequest,
    session: Arc<LoadSession>,
    frames: Vec<ProgressiveChannel<FrameResult>>,
}

impl Driver {
    async fn run(self, progress: ProgressiveChannel<LoadSummary>) -> Result<(), LoadError> {
        let plans = StageResolver::resolve(&self.request.configuration, self.request.frames.len());
        let mut summary = LoadSummary::default();

        for plan in &plans {
            if self.session.is_cancelled() {
                self.stop_cancelled(&progress, summary);
                return Ok(());
            }
            self.run_stage(plan, &mut summary).await;

            summary.stage_id = Some(plan.stage_id.clone());
            summary.stages_completed += 1;
            progress.push(summary.clone(), false);
        }

        if self.session.is_cancelled() {
            self.stop_cancelled(&progress, summary);
            return Ok(());
        }

        for channel in &self.frames {
            if !channel.is_done() && !channel.has_failed() {
                channel.finish();
            }
        }

        info!(
            session_id = %self.session.id(),
            stages = summary.stages_completed,
            delivered = summary.frames_delivered,
            failed = summary.frames_failed,
            "Progressive load complete"
        );
        Ok(())
    }

    async fn run_stage(&self, plan: &StagePlan, summary: &mut LoadSummary) {
        let transfer_syntax_uid = self.request.transfer_syntax_uid.as_deref();
        let options = self.loader.stage_options(transfer_syntax_uid, plan);
        let concurrency = self.loader.fetcher.config().max_concurrent_requests.max(1);

        debug!(
            stage_id = %plan.stage_id,
            retrieve_type = ?plan.retrieve_type_id,
            frames = plan.frames.len(),
            status = %options.quality_status(),
            "Running retrieve stage"
        );

        // Failed frames stay failed and done frames already hold their best
        // result.
        let pending = plan.frames.iter().copied().filter(|&index| {
            let channel = &self.frames[index];
            !channel.has_failed() && !channel.is_done()
        });

        let mut outcomes = stream::iter(pending)
            .map(|index| {
                let target = &self.request.frames[index];
                let mut request = FetchRequest::new(options.apply_to_uri(&target.uri), &target.image_id)
                    .with_quality(options.quality_status());
                request.media_type = options.media_type.clone();
                request.range = options.byte_range;

                let fetch = self.loader.fetcher.fetch(&self.session, request);
                async move {
                    let started = Instant::now();
                    (index, fetch.await, started.elapsed())
                }
            })
            .buffer_unordered(concurrency);

        while let Some((index, outcome, load_time)) = outcomes.next().await {
            let target = &self.request.frames[index];
            match outcome {
                Ok(fetch) => {
                    let is_final = fetch.is_final;
                    debug!(
                        image_id = %target.image_id,
                        stage_id = %plan.stage_id,
                        status = %fetch.quality_status,
                        is_final,
                        "Delivering frame"
                    );
                    self.frames[index].push(
                        FrameResult {
                            image_id: target.image_id.clone(),
                            frame_index: index,
                            stage_id: plan.stage_id.clone(),
                            transfer_syntax_uid: self.request.transfer_syntax_uid.clone(),
                            fetch,
                            load_time,
                            streaming: options.streaming,
                            decode_level: options.decode_level,
                        },
                        is_final,
                    );
                    metrics::counter!("loader.frames.delivered").increment(1);
                    summary.frames_delivered += 1;
                }
                Err(e) => {
                    warn!(
                        image_id = %target.image_id,
                        stage_id = %plan.stage_id,
                        error = %e,
                        "Frame fetch failed"
                    );
                    self.frames[index].fail(e);
                    metrics::counter!("loader.frames.failed").increment(1);
                    summary.frames_failed += 1;
                }
            }
        }
    }

    fn stop_cancelled(&self, progress: &ProgressiveChannel<LoadSummary>, mut summary: LoadSummary) {
        self.session.purge();
        summary.cancelled = true;
        info!(
            session_id = %self.session.id(),
            stages = summary.stages_completed,
            "Progressive load cancelled"
        );
        progress.push(summary, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpConfig;
    use crate::options::{QualityStatus, HTJ2K_TRANSFER_SYNTAX};
    use crate::stages::RetrieveStage;

    fn loader() -> ProgressiveLoader {
        ProgressiveLoader::new(
            RangeFetcher::new(HttpConfig::default()).unwrap(),
            Some(RetrieveOptions::builtin()),
        )
    }

    #[test]
    fn test_stage_options_fall_back_to_defaults() {
        let loader = loader();
        let plan = StagePlan {
            stage_id: "lossy".to_string(),
            retrieve_type_id: Some("lossy".to_string()),
            remove: false,
            frames: vec![0],
        };

        let htj2k = loader.stage_options(Some(HTJ2K_TRANSFER_SYNTAX), &plan);
        assert_eq!(htj2k.quality_status(), QualityStatus::Lossy);

        let other = loader.stage_options(Some("1.2.840.10008.1.2.1"), &plan);
        assert_eq!(other, StageOptions::default());

        let unconfigured = ProgressiveLoader::new(loader.fetcher.clone(), None);
        assert_eq!(
            unconfigured.stage_options(Some(HTJ2K_TRANSFER_SYNTAX), &plan),
            StageOptions::default()
        );
    }

    #[tokio::test]
    async fn test_purge_fails_tracked_channels() {
        let session = LoadSession::new();
        let in_flight = ProgressiveChannel::<FrameResult>::new("in-flight");
        let finished = ProgressiveChannel::<FrameResult>::new("finished");
        finished.finish();
        session.track(in_flight.clone());
        session.track(finished.clone());

        session.purge();

        assert!(session.is_cancelled());
        assert!(matches!(
            in_flight.peek_latest().unwrap_err().load_error(),
            Some(LoadError::Purged)
        ));
        assert!(!finished.has_failed());
    }

    #[test]
    fn test_track_prunes_settled_channels() {
        let session = LoadSession::new();
        let finished = ProgressiveChannel::<FrameResult>::new("finished");
        let failed = ProgressiveChannel::<FrameResult>::new("failed");
        let in_flight = ProgressiveChannel::<FrameResult>::new("in-flight");
        session.track(finished.clone());
        session.track(failed.clone());
        session.track(in_flight.clone());
        assert_eq!(session.tracked_channels(), 3);

        finished.finish();
        failed.fail(LoadError::Cancelled);
        session.track(ProgressiveChannel::new("next"));
        assert_eq!(session.tracked_channels(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_session_stops_before_first_stage() {
        let session = Arc::new(LoadSession::new());
        session.cancel();

        let request = LoadRequest::new(vec![FrameTarget::new("img-1", "http://127.0.0.1:9/frames/1")])
            .with_configuration(RetrieveConfiguration::new(vec![RetrieveStage::new("all")]));
        let handle = loader().load(request, session);

        let summary = handle.finished().await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.stages_completed, 0);
        assert!(handle.frames[0].first().await.is_err());
    }

    #[tokio::test]
    async fn test_empty_request_completes() {
        let handle = loader().load(LoadRequest::new(Vec::new()), Arc::new(LoadSession::new()));
        let summary = handle.finished().await.unwrap();
        assert_eq!(summary.stages_completed, 1);
        assert_eq!(summary.frames_delivered, 0);
        assert!(handle.progress.is_done());
    }
}
