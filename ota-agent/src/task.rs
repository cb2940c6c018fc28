//! Agent task and the queue feeding it.
//!
//! The transport callback and the application only ever touch the
//! [`Mailbox`]. The agent itself lives on the task running [`run`].

use crate::{
    agent::{AgentEvent, ImageState, OtaAgent, OtaObserver, OtaState},
    error::OtaError,
    sink::ImageSink,
    stats::{OtaStatistics, Statistics},
    transport::PubSub,
    verify::EcdsaP256Verify,
};
use consts::MSG_QUEUE_DEPTH;
use embassy_futures::select::{select, Either};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::{Duration, Instant, Timer};
use embedded_hal_async::delay::DelayNs;
use ota_protocol::classify;

/// Bounded event queue of the agent.
pub struct Mailbox<const N: usize = MSG_QUEUE_DEPTH> {
    queue: Channel<CriticalSectionRawMutex, AgentEvent, N>,
    stats: Statistics,
}

impl<const N: usize> Default for Mailbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Mailbox<N> {
    pub const fn new() -> Self {
        Self {
            queue: Channel::new(),
            stats: Statistics::new(),
        }
    }

    /// Hand over an inbound message. Never blocks: messages on unknown
    /// topics, oversized ones and those arriving while the queue is full are
    /// dropped and counted. Returns whether the message was queued.
    pub fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        self.stats.add_received(1);
        let Some(kind) = classify(topic) else {
            debug!("message on {} dropped", topic);
            self.stats.add_dropped(1);
            return false;
        };
        let Ok(payload) = heapless::Vec::from_slice(payload) else {
            warn!("message of {} bytes dropped", payload.len());
            self.stats.add_dropped(1);
            return false;
        };
        match self.queue.try_send(AgentEvent::Message { kind, payload }) {
            Ok(()) => {
                self.stats.add_queued(1);
                true
            }
            Err(_) => {
                warn!("queue full, message dropped");
                self.stats.add_dropped(1);
                false
            }
        }
    }

    /// Ask the agent to look for a job.
    pub async fn start(&self) {
        self.queue.send(AgentEvent::Start).await;
    }

    /// Stop the job in flight.
    pub async fn abort(&self) {
        self.queue.send(AgentEvent::Abort).await;
    }

    /// Report the self test verdict on the running image.
    pub async fn set_image_state(&self, state: ImageState) {
        self.queue.send(AgentEvent::SetImageState(state)).await;
    }

    /// Stop the agent task.
    pub async fn shutdown(&self) {
        self.queue.send(AgentEvent::Shutdown).await;
    }

    /// Counters to hand to [`OtaAgent::new`].
    pub fn counters(&self) -> &Statistics {
        &self.stats
    }

    pub fn statistics(&self) -> OtaStatistics {
        self.stats.snapshot()
    }

    pub fn state(&self) -> OtaState {
        self.stats.state()
    }

    pub(crate) async fn receive(&self) -> AgentEvent {
        self.queue.receive().await
    }
}

/// Drive `agent` from `mailbox` until a shutdown request.
///
/// The wait for the next event is bounded while an answer is expected, and
/// while an image is under test. A wait running out becomes a timeout event.
pub async fn run<C, D, S, V, O, const N: usize>(
    agent: &mut OtaAgent<'_, C, D, S, V, O>,
    mailbox: &Mailbox<N>,
) -> Result<(), OtaError>
where
    C: PubSub,
    D: DelayNs,
    S: ImageSink,
    V: EcdsaP256Verify,
    O: OtaObserver,
{
    agent.init().await?;
    let mut self_test_deadline = None;
    // Generation of the request timer and when it fires.
    let mut request_timer: Option<(u32, Instant)> = None;

    loop {
        let now = Instant::now();
        if agent.state() == OtaState::SelfTesting {
            // Runs from the first time the image under test is seen.
            self_test_deadline.get_or_insert_with(|| {
                now + agent.self_test_window().unwrap_or(Duration::from_ticks(0))
            });
        } else {
            self_test_deadline = None;
        }
        let request_deadline = match agent.request_wait() {
            Some(wait) => match request_timer {
                Some((generation, deadline)) if generation == agent.request_timer() => deadline,
                _ => {
                    let deadline = now + wait;
                    request_timer = Some((agent.request_timer(), deadline));
                    deadline
                }
            },
            None => {
                request_timer = None;
                Instant::MAX
            }
        };
        let deadline = request_deadline.min(self_test_deadline.unwrap_or(Instant::MAX));

        let event = if deadline == Instant::MAX {
            mailbox.receive().await
        } else {
            match select(mailbox.receive(), Timer::at(deadline)).await {
                Either::First(event) => event,
                Either::Second(()) if self_test_deadline == Some(deadline) => {
                    AgentEvent::SelfTestTimeout
                }
                Either::Second(()) => {
                    request_timer = None;
                    AgentEvent::RequestTimeout
                }
            }
        };

        let shutdown = event == AgentEvent::Shutdown;
        agent.handle(event).await;
        if shutdown {
            return Ok(());
        }
    }
}
