// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! OTA agent state machine.
//!
//! ```text
//! Idle -> RequestingJob -> Downloading -> Verifying -> Activating
//!   (restart)  SelfTesting -> Accepted | RolledBack -> Idle
//! any job in flight -> Aborting -> Idle
//! ```
//!
//! The agent runs on its own task and is driven one [`AgentEvent`] at a time,
//! so an abort is honored between two steps and never in the middle of one.

use crate::{
    blocks::{BlockOutcome, BlockTransfer, FirmwareBlock},
    config::{BusyPolicy, Config},
    error::{BlockError, ConfigError, OtaError},
    job::{self, JobDocument},
    retry::Attempts,
    sink::{ImageSink, Partition, PlatformImageState},
    stats::{OtaStatistics, Statistics},
    transport::{PubSub, QoS, TransportAdapter},
    verify::{self, EcdsaP256Verify, PublicKey, Verified},
    version::AppVersion,
};
use alloc::string::String;
use consts::{MAX_MSG_SIZE, UPDATE_STATUS_FREQUENCY};
use core::fmt::Write;
use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use ota_protocol::{JobStatus, JobStatusUpdate, MessageKind, SelfTestStep, StatusDetails, StreamBlock};
use serde::Serialize;

/// State of the agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OtaState {
    #[default]
    Idle,
    RequestingJob,
    Downloading,
    Verifying,
    Activating,
    SelfTesting,
    Accepted,
    RolledBack,
    Aborting,
}

impl OtaState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => OtaState::RequestingJob,
            2 => OtaState::Downloading,
            3 => OtaState::Verifying,
            4 => OtaState::Activating,
            5 => OtaState::SelfTesting,
            6 => OtaState::Accepted,
            7 => OtaState::RolledBack,
            8 => OtaState::Aborting,
            _ => OtaState::Idle,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OtaState::Idle => "idle",
            OtaState::RequestingJob => "requesting_job",
            OtaState::Downloading => "downloading",
            OtaState::Verifying => "verifying",
            OtaState::Activating => "activating",
            OtaState::SelfTesting => "self_testing",
            OtaState::Accepted => "accepted",
            OtaState::RolledBack => "rolled_back",
            OtaState::Aborting => "aborting",
        }
    }
}

/// Verdict of the application on the image under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageState {
    /// Self test passed, keep the image
    Accepted,
    /// Self test failed, go back to the previous image
    Rejected,
    /// Stop whatever the agent is doing
    Aborted,
}

/// Work item of the agent task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Look for a new job
    Start,
    /// Message from a subscribed topic
    Message {
        kind: MessageKind,
        payload: heapless::Vec<u8, MAX_MSG_SIZE>,
    },
    /// No answer to the last job or block request in time
    RequestTimeout,
    /// The image under test did not confirm itself in time
    SelfTestTimeout,
    Abort,
    SetImageState(ImageState),
    Shutdown,
}

/// Notification to the hosting application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobEvent {
    /// Download progress, in blocks
    Progress { received: u32, total: u32 },
    /// The image is verified and about to be activated
    Activate,
    /// The new image booted; run the self test and report with
    /// [`ImageState`]
    StartTest,
    /// The image under test is committed
    Accepted,
    /// The job ended without success. `state` is where it failed.
    Failed { state: OtaState, error: OtaError },
}

/// Receiver of [`JobEvent`]s.
pub trait OtaObserver {
    fn on_event(&mut self, event: JobEvent);
}

impl OtaObserver for () {
    fn on_event(&mut self, _event: JobEvent) {}
}

/// Everything tied to the job being downloaded.
pub struct OtaContext {
    pub job: JobDocument,
    pub transfer: BlockTransfer,
    /// Partition the image is written to
    pub partition: Partition,
}

/// The OTA agent. One instance per device, owned by the agent task.
pub struct OtaAgent<'a, C, D, S, V, O> {
    config: Config,
    transport: TransportAdapter<C, D>,
    sink: S,
    verifier: V,
    trusted_key: PublicKey,
    observer: O,
    stats: &'a Statistics,
    state: OtaState,
    context: Option<OtaContext>,
    job_requests: Attempts,
    deferred_request: bool,
    /// Job whose image is under test
    self_test_job: Option<String>,
    /// Self test window of the running image
    self_test_wait_ms: u64,
    /// Bumped whenever the request timer restarts
    request_timer: u32,
}

impl<'a, C, D, S, V, O> OtaAgent<'a, C, D, S, V, O>
where
    C: PubSub,
    D: DelayNs,
    S: ImageSink,
    V: EcdsaP256Verify,
    O: OtaObserver,
{
    pub fn new(
        config: Config,
        transport: TransportAdapter<C, D>,
        sink: S,
        verifier: V,
        trusted_key: PublicKey,
        observer: O,
        stats: &'a Statistics,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        stats.set_state(OtaState::Idle);
        Ok(Self {
            job_requests: Attempts::new(config.max_job_request_attempts),
            self_test_wait_ms: config.self_test_wait_ms,
            request_timer: 0,
            config,
            transport,
            sink,
            verifier,
            trusted_key,
            observer,
            stats,
            state: OtaState::Idle,
            context: None,
            deferred_request: false,
            self_test_job: None,
        })
    }

    pub fn state(&self) -> OtaState {
        self.state
    }

    pub fn context(&self) -> Option<&OtaContext> {
        self.context.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn transport(&self) -> &TransportAdapter<C, D> {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut TransportAdapter<C, D> {
        &mut self.transport
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn statistics(&self) -> OtaStatistics {
        self.stats.snapshot()
    }

    /// How long to wait for an answer to the last request, if one is
    /// outstanding.
    pub fn request_wait(&self) -> Option<Duration> {
        match self.state {
            OtaState::RequestingJob => Some(Duration::from_millis(self.config.job_request_wait_ms)),
            OtaState::Downloading => Some(Duration::from_millis(self.config.file_request_wait_ms)),
            OtaState::SelfTesting
                if self.self_test_job.is_none() && !self.job_requests.exhausted() =>
            {
                Some(Duration::from_millis(self.config.job_request_wait_ms))
            }
            _ => None,
        }
    }

    /// Changes every time the request timer has to start over: a request
    /// went out, a block was stored or the state changed.
    pub fn request_timer(&self) -> u32 {
        self.request_timer
    }

    /// Self test window, while an image is under test.
    pub fn self_test_window(&self) -> Option<Duration> {
        (self.state == OtaState::SelfTesting).then(|| Duration::from_millis(self.self_test_wait_ms))
    }

    fn set_state(&mut self, state: OtaState) {
        if self.state != state {
            info!("{:?} -> {:?}", self.state, state);
            self.state = state;
            self.request_timer = self.request_timer.wrapping_add(1);
            self.stats.set_state(state);
        }
    }

    /// Subscribe to the job topics and pick up an image waiting for its self
    /// test verdict.
    pub async fn init(&mut self) -> Result<(), OtaError> {
        self.transport.subscribe_jobs().await?;
        match self.sink.image_state()? {
            PlatformImageState::PendingCommit => {
                info!("booted a new image, waiting for its self test job");
                self.self_test_wait_ms = match self.sink.begin_self_test() {
                    Ok(window_ms) => window_ms.into(),
                    Err(e) => {
                        warn!("no self test window recorded: {}", e);
                        self.config.self_test_wait_ms
                    }
                };
                if self.self_test_wait_ms == 0 {
                    warn!("restarted during the self test, no time left");
                }
                self.set_state(OtaState::SelfTesting);
                self.job_requests.reset();
                self.request_self_test_job().await;
            }
            PlatformImageState::Invalid => warn!("running image is the result of a rollback"),
            _ => {}
        }
        Ok(())
    }

    /// Process one event.
    pub async fn handle(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::Start => self.on_start().await,
            AgentEvent::Message { kind, payload } => {
                self.stats.add_processed(1);
                match kind {
                    MessageKind::Job => self.on_job_message(&payload).await,
                    MessageKind::Stream => self.on_stream_message(&payload).await,
                }
            }
            AgentEvent::RequestTimeout => self.on_request_timeout().await,
            AgentEvent::SelfTestTimeout => self.on_self_test_timeout().await,
            AgentEvent::Abort => self.abort().await,
            AgentEvent::SetImageState(state) => self.set_image_state(state).await,
            AgentEvent::Shutdown => self.shutdown().await,
        }
        if self.state == OtaState::Idle && self.deferred_request {
            self.deferred_request = false;
            self.on_start().await;
        }
    }

    async fn on_start(&mut self) {
        match self.state {
            OtaState::Idle => {
                self.job_requests.reset();
                self.request_job().await;
            }
            _ => self.busy(),
        }
    }

    fn busy(&mut self) {
        match self.config.busy_policy {
            BusyPolicy::Reject => warn!("job notification while busy in {:?}, ignored", self.state),
            BusyPolicy::Defer => {
                info!("job notification while busy, deferred");
                self.deferred_request = true;
            }
        }
    }

    async fn request_job(&mut self) {
        if !self.job_requests.try_next() {
            error!("no answer to {} job requests", self.job_requests.made());
            self.stats.add_failed(1);
            self.observer.on_event(JobEvent::Failed {
                state: self.state,
                error: OtaError::JobRequestExhausted,
            });
            self.set_state(OtaState::Idle);
            return;
        }
        self.set_state(OtaState::RequestingJob);
        self.request_timer = self.request_timer.wrapping_add(1);
        if let Err(e) = self.transport.request_job().await {
            // Retried when the request timer expires.
            warn!("job request failed: {}", e);
        }
    }

    /// Ask for the job of the image under test, until it arrives or the
    /// attempts run out. The self test window keeps running either way.
    async fn request_self_test_job(&mut self) {
        if self.self_test_job.is_some() || !self.job_requests.try_next() {
            return;
        }
        self.request_timer = self.request_timer.wrapping_add(1);
        if let Err(e) = self.transport.request_job().await {
            warn!("job request failed: {}", e);
        }
    }

    async fn on_request_timeout(&mut self) {
        match self.state {
            OtaState::RequestingJob => {
                warn!("job request timed out");
                self.request_job().await;
            }
            OtaState::SelfTesting => {
                warn!("no self test job yet");
                self.request_self_test_job().await;
            }
            OtaState::Downloading => {
                warn!("no data in time");
                self.request_blocks().await;
            }
            _ => {}
        }
    }

    async fn on_job_message(&mut self, raw: &[u8]) {
        let parsed = job::parse_job_message(raw, self.config.block_size);
        match self.state {
            OtaState::Idle | OtaState::RequestingJob => {
                self.set_state(OtaState::RequestingJob);
                match parsed {
                    Ok(None) => {
                        info!("no pending job");
                        self.set_state(OtaState::Idle);
                    }
                    Err(e) => {
                        error!("job document rejected: {}", e);
                        self.stats.add_failed(1);
                        self.observer.on_event(JobEvent::Failed {
                            state: OtaState::RequestingJob,
                            error: e.into(),
                        });
                        self.set_state(OtaState::Idle);
                    }
                    Ok(Some(job)) if job.self_test.is_some() => {
                        warn!("self test job without an image under test");
                        self.report_failure(&job.job_id, OtaError::ImageStateMismatch)
                            .await;
                        self.stats.add_failed(1);
                        self.observer.on_event(JobEvent::Failed {
                            state: OtaState::RequestingJob,
                            error: OtaError::ImageStateMismatch,
                        });
                        self.set_state(OtaState::Idle);
                    }
                    Ok(Some(job)) => self.start_download(job).await,
                }
            }
            OtaState::Downloading | OtaState::Activating => match parsed {
                Ok(Some(job))
                    if self
                        .context
                        .as_ref()
                        .is_some_and(|ctx| ctx.job.job_id == job.job_id) =>
                {
                    debug!("update of the current job ignored");
                }
                Ok(Some(_)) => self.busy(),
                _ => {}
            },
            OtaState::SelfTesting => match parsed {
                Ok(Some(job)) => self.on_self_test_job(job).await,
                Ok(None) => warn!("no job for the image under test"),
                Err(e) => warn!("self test job rejected: {}", e),
            },
            _ => {}
        }
    }

    async fn start_download(&mut self, job: JobDocument) {
        info!(
            "job {}: {} bytes in {} blocks from stream {}",
            job.job_id.as_str(),
            job.file_size,
            job.block_count(),
            job.stream_name.as_str()
        );
        let transfer = match BlockTransfer::new(
            job.file_id,
            job.file_size,
            job.block_size,
            self.config.max_block_retries,
        ) {
            Ok(transfer) => transfer,
            Err(e) => {
                self.report_failure(&job.job_id, e.into()).await;
                self.stats.add_failed(1);
                self.observer.on_event(JobEvent::Failed {
                    state: OtaState::RequestingJob,
                    error: e.into(),
                });
                self.set_state(OtaState::Idle);
                return;
            }
        };
        let partition = self.sink.pending_partition();
        let stream = job.stream_name.clone();
        self.context = Some(OtaContext {
            job,
            transfer,
            partition,
        });
        self.set_state(OtaState::Downloading);

        if let Err(e) = self.sink.erase(partition) {
            return self.fail_job(e.into()).await;
        }
        if let Err(e) = self.transport.subscribe_stream(&stream).await {
            return self.fail_job(e.into()).await;
        }
        self.request_blocks().await;
    }

    /// Ask for the next window of missing blocks.
    async fn request_blocks(&mut self) {
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let before = ctx.transfer.counters().retries_issued;
        let window = match ctx.transfer.next_request(self.config.request_window) {
            Ok(Some(window)) => window,
            Ok(None) => return,
            Err(e) => return self.fail_job(e.into()).await,
        };
        let retried = ctx.transfer.counters().retries_issued - before;
        if retried > 0 {
            warn!("asking again for {} blocks", retried);
            self.stats.add_retries(retried);
        }
        self.request_timer = self.request_timer.wrapping_add(1);
        let result = self
            .transport
            .request_blocks(
                &ctx.job.stream_name,
                ctx.job.file_id,
                ctx.job.block_size,
                &window,
            )
            .await;
        if let Err(e) = result {
            warn!("block request failed: {}", e);
        }
    }

    async fn on_stream_message(&mut self, raw: &[u8]) {
        if self.state != OtaState::Downloading {
            debug!("stream data in {:?} dropped", self.state);
            return;
        }
        let Some(ctx) = self.context.as_mut() else {
            return;
        };
        let Ok(block) = StreamBlock::decode(raw) else {
            return self.fail_job(BlockError::Malformed.into()).await;
        };
        if block.file_id != ctx.transfer.file_id() {
            warn!("block for file {} dropped", block.file_id);
            return;
        }
        let result = ctx.transfer.on_block_received(
            FirmwareBlock {
                index: block.block_index,
                payload: block.payload,
            },
            &mut self.sink,
        );
        match result {
            Ok(BlockOutcome::Accepted) => {
                self.stats.add_blocks(1);
                self.request_timer = self.request_timer.wrapping_add(1);
                let received = ctx.transfer.received_blocks();
                let total = ctx.transfer.total_blocks();
                debug!("block {} stored, {}/{}", block.block_index, received, total);
                self.observer
                    .on_event(JobEvent::Progress { received, total });
                if received == 1 || received % UPDATE_STATUS_FREQUENCY == 0 {
                    self.report_progress(received, total).await;
                }
                let (complete, window_received) = self
                    .context
                    .as_ref()
                    .map_or((false, false), |ctx| {
                        (ctx.transfer.is_complete(), ctx.transfer.window_received())
                    });
                if complete {
                    self.verify().await;
                } else if window_received {
                    self.request_blocks().await;
                }
            }
            Ok(BlockOutcome::Duplicate) => {
                debug!("block {} duplicate", block.block_index);
                self.stats.add_duplicates(1);
            }
            Err(BlockError::SinkWrite { index, error }) => {
                warn!("block {} not stored: {}", index, error);
                self.stats.add_retries(1);
                self.request_timer = self.request_timer.wrapping_add(1);
                let result = self
                    .transport
                    .request_block(
                        &ctx.job.stream_name,
                        ctx.job.file_id,
                        ctx.job.block_size,
                        index,
                    )
                    .await;
                if let Err(e) = result {
                    warn!("block request failed: {}", e);
                }
            }
            Err(e) => self.fail_job(e.into()).await,
        }
    }

    async fn verify(&mut self) {
        self.set_state(OtaState::Verifying);
        let Some(ctx) = self.context.as_ref() else {
            return;
        };
        let result = match ctx.transfer.digest() {
            Ok(digest) => verify::finalize(
                digest,
                ctx.job.signature_algorithm,
                &ctx.job.signature,
                &self.trusted_key,
                &self.verifier,
            )
            .map_err(OtaError::from),
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(verified) => self.activate(verified).await,
            Err(e) => self.fail_job(e).await,
        }
    }

    /// Stage and boot the verified image. Only reachable with a [`Verified`]
    /// proof from [`verify::finalize`].
    async fn activate(&mut self, verified: Verified) {
        self.set_state(OtaState::Activating);
        let Some(ctx) = self.context.as_ref() else {
            return;
        };
        let (partition, image_size) = (ctx.partition, ctx.job.file_size);
        let (job_id, stream) = (ctx.job.job_id.clone(), ctx.job.stream_name.clone());
        debug!("image digest {:?}", verified.digest());

        if let Err(e) = self.transport.unsubscribe_stream(&stream).await {
            warn!("unsubscribe from stream failed: {}", e);
        }
        let updated_by = hex_version(self.config.app_version);
        self.publish_status(
            &job_id,
            JobStatus::InProgress,
            StatusDetails {
                self_test: Some(SelfTestStep::Ready),
                updated_by: Some(updated_by.as_str()),
                ..Default::default()
            },
            QoS::AtLeastOnce,
        )
        .await;
        self.observer.on_event(JobEvent::Activate);

        let window_ms = u32::try_from(self.config.self_test_wait_ms).unwrap_or(u32::MAX);
        if let Err(e) = self.sink.set_pending_activation(partition, image_size, window_ms) {
            return self.fail_job(e.into()).await;
        }
        let mut attempts = Attempts::new(self.config.max_activation_attempts.max(1));
        while attempts.try_next() {
            match self.sink.activate_and_reset() {
                Ok(()) => {
                    info!("image in partition {} activated", partition.0);
                    return;
                }
                Err(e) => warn!("activation attempt {} failed: {}", attempts.made(), e),
            }
        }
        if let Err(e) = self.sink.rollback_to_previous() {
            warn!("unstaging the image failed: {}", e);
        }
        self.fail_job(OtaError::ActivationExhausted).await;
    }

    async fn on_self_test_job(&mut self, job: JobDocument) {
        if self.self_test_job.is_some() {
            debug!("self test already started");
            return;
        }
        if job.self_test.is_none() {
            warn!("job {} is not in self test", job.job_id.as_str());
            return;
        }
        let running = self.config.app_version;
        match job.updated_by {
            Some(previous) if previous < running => {
                info!("self test of {} started, updated from {}", running, previous);
                let updated_by = hex_version(previous);
                self.publish_status(
                    &job.job_id,
                    JobStatus::InProgress,
                    StatusDetails {
                        self_test: Some(SelfTestStep::Active),
                        updated_by: Some(updated_by.as_str()),
                        ..Default::default()
                    },
                    QoS::AtLeastOnce,
                )
                .await;
                self.self_test_job = Some(job.job_id);
                self.observer.on_event(JobEvent::StartTest);
            }
            Some(previous) if previous > running => {
                self.self_test_job = Some(job.job_id);
                self.reject_image(OtaError::DowngradeNotAllowed).await;
            }
            Some(_) => {
                self.self_test_job = Some(job.job_id);
                self.reject_image(OtaError::SameFirmwareVersion).await;
            }
            None => {
                self.self_test_job = Some(job.job_id);
                self.reject_image(OtaError::ImageStateMismatch).await;
            }
        }
    }

    /// Report the application's verdict on the image under test.
    pub async fn set_image_state(&mut self, verdict: ImageState) {
        match (self.state, verdict) {
            (OtaState::SelfTesting, ImageState::Accepted) => {
                if let Err(e) = self.sink.mark_self_test_passed() {
                    error!("commit of the image failed: {}", e);
                    return self.reject_image(e.into()).await;
                }
                self.set_state(OtaState::Accepted);
                if let Some(job_id) = self.self_test_job.take() {
                    let mut reason = heapless::String::<32>::new();
                    let _ = write!(reason, "accepted v{}", self.config.app_version);
                    self.publish_status(
                        &job_id,
                        JobStatus::Succeeded,
                        StatusDetails {
                            reason: Some(reason.as_str()),
                            ..Default::default()
                        },
                        QoS::AtLeastOnce,
                    )
                    .await;
                }
                self.stats.add_completed(1);
                self.observer.on_event(JobEvent::Accepted);
                self.set_state(OtaState::Idle);
            }
            (OtaState::SelfTesting, ImageState::Rejected) => {
                self.reject_image(OtaError::ImageRejected).await
            }
            (_, ImageState::Aborted) => self.abort().await,
            (state, _) => warn!("no image under test in {:?}", state),
        }
    }

    async fn on_self_test_timeout(&mut self) {
        if self.state == OtaState::SelfTesting {
            error!("self test window expired");
            self.reject_image(OtaError::SelfTestTimeout).await;
        }
    }

    /// Go back to the previous image and restart.
    async fn reject_image(&mut self, error: OtaError) {
        let from = self.state;
        if let Err(e) = self.sink.rollback_to_previous() {
            error!("rollback failed: {}", e);
        }
        self.set_state(OtaState::RolledBack);
        if let Some(job_id) = self.self_test_job.take() {
            self.report_failure(&job_id, error).await;
        }
        self.stats.add_failed(1);
        self.observer.on_event(JobEvent::Failed { state: from, error });
        self.sink.reset();
        self.set_state(OtaState::Idle);
    }

    /// Stop the current job. The partial image is erased before the agent is
    /// idle again.
    pub async fn abort(&mut self) {
        match self.state {
            OtaState::RequestingJob | OtaState::Downloading | OtaState::Verifying => {
                self.fail_job(OtaError::UserAbort).await
            }
            OtaState::Activating => {
                if let Err(e) = self.sink.rollback_to_previous() {
                    warn!("rollback of the staged image failed: {}", e);
                }
                self.fail_job(OtaError::UserAbort).await
            }
            OtaState::SelfTesting => self.reject_image(OtaError::UserAbort).await,
            state => debug!("nothing to abort in {:?}", state),
        }
    }

    async fn fail_job(&mut self, error: OtaError) {
        let from = self.state;
        self.set_state(OtaState::Aborting);
        error!("job failed in {:?}: {}", from, error);
        if let Some(ctx) = self.context.take() {
            if let Err(e) = self.transport.unsubscribe_stream(&ctx.job.stream_name).await {
                warn!("unsubscribe from stream failed: {}", e);
            }
            if let Err(e) = self.sink.erase(ctx.partition) {
                error!("erase of partition {} failed: {}", ctx.partition.0, e);
                self.observer.on_event(JobEvent::Failed {
                    state: OtaState::Aborting,
                    error: e.into(),
                });
            }
            self.report_failure(&ctx.job.job_id, error).await;
        }
        self.stats.add_failed(1);
        self.observer.on_event(JobEvent::Failed { state: from, error });
        self.set_state(OtaState::Idle);
    }

    /// Leave the job topics, cleaning up a download in flight first.
    pub async fn shutdown(&mut self) {
        if matches!(
            self.state,
            OtaState::RequestingJob | OtaState::Downloading | OtaState::Verifying
        ) {
            self.fail_job(OtaError::UserAbort).await;
        }
        self.deferred_request = false;
        if let Err(e) = self.transport.unsubscribe_jobs().await {
            warn!("unsubscribe from jobs failed: {}", e);
        }
        info!("agent shut down");
    }

    async fn report_progress(&mut self, received: u32, total: u32) {
        let Some(job_id) = self.context.as_ref().map(|ctx| ctx.job.job_id.clone()) else {
            return;
        };
        let mut receive = heapless::String::<24>::new();
        let _ = write!(receive, "{received}/{total}");
        self.publish_status(
            &job_id,
            JobStatus::InProgress,
            StatusDetails {
                receive: Some(receive.as_str()),
                ..Default::default()
            },
            QoS::AtMostOnce,
        )
        .await;
    }

    async fn report_failure(&mut self, job_id: &str, error: OtaError) {
        let mut reason = heapless::String::<40>::new();
        let status = match error {
            OtaError::UserAbort => {
                let _ = write!(reason, "aborted: 0x{:08x}", error.code());
                JobStatus::Failed
            }
            OtaError::DowngradeNotAllowed
            | OtaError::SameFirmwareVersion
            | OtaError::ImageStateMismatch => {
                let _ = write!(reason, "rejected: 0x{:08x}", error.code());
                JobStatus::Rejected
            }
            _ => {
                let _ = write!(reason, "0x{:08x}: 0x{:08x}", error.code(), sub_code(&error));
                JobStatus::Failed
            }
        };
        self.publish_status(
            job_id,
            status,
            StatusDetails {
                reason: Some(reason.as_str()),
                ..Default::default()
            },
            QoS::AtLeastOnce,
        )
        .await;
    }

    async fn publish_status(
        &mut self,
        job_id: &str,
        status: JobStatus,
        status_details: StatusDetails<'_>,
        qos: QoS,
    ) {
        let update = JobStatusUpdate {
            status,
            status_details,
        };
        if let Err(e) = self.transport.update_job_status(job_id, &update, qos).await {
            warn!("status update of job {} failed: {}", job_id, e);
        }
    }
}

fn hex_version(version: AppVersion) -> heapless::String<12> {
    let mut s = heapless::String::new();
    let _ = write!(s, "0x{:x}", version.to_u32());
    s
}

/// Detail carried next to the error code in failure reasons.
fn sub_code(error: &OtaError) -> u32 {
    match error {
        OtaError::Block(
            BlockError::OutOfRange { index }
            | BlockError::SizeMismatch { index, .. }
            | BlockError::SinkWrite { index, .. }
            | BlockError::SinkRead { index, .. }
            | BlockError::RetriesExhausted { index },
        ) => *index,
        _ => 0,
    }
}
