//! Messaging side of the agent: job requests, block requests and status
//! updates go out through a publish/subscribe client. Inbound messages come
//! back through [`crate::task::Mailbox::deliver`].

use crate::{bitmap::Window, config::Config, error::TransportError, retry::RetryPolicy};
use consts::{MAX_THING_NAME_LEN, STREAM_CLIENT_TOKEN};
use core::fmt::Write;
use embedded_hal_async::delay::DelayNs;
use ota_protocol::{topic, GetNextJob, JobStatusUpdate, StreamRequest, MAX_STREAM_REQUEST_SIZE};

/// MQTT quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// Publish/subscribe client of the platform's MQTT stack.
/// Each call completes once the broker acknowledged it, or fails with
/// [`TransportError::Timeout`] after the client's own timeout.
#[allow(async_fn_in_trait)]
pub trait PubSub {
    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS)
        -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Whether the client holds a broker session. Publishes are not
    /// attempted without one.
    fn is_connected(&self) -> bool;
}

/// Builds the agent's messages and publishes them with bounded retries.
pub struct TransportAdapter<C, D> {
    client: C,
    delay: D,
    thing_name: heapless::String<MAX_THING_NAME_LEN>,
    retry: RetryPolicy,
    request_seq: u32,
}

impl<C: PubSub, D: DelayNs> TransportAdapter<C, D> {
    pub fn new(client: C, delay: D, config: &Config) -> Self {
        Self {
            client,
            delay,
            thing_name: config.thing_name.clone(),
            retry: config.publish_retry,
            request_seq: 0,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), TransportError> {
        let mut attempts = self.retry.attempts();
        let mut last_error = TransportError::Timeout;
        while attempts.try_next() {
            let result = if self.client.is_connected() {
                self.client.publish(topic, payload, qos).await
            } else {
                Err(TransportError::NotConnected)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("publish to {} failed: {}", topic, e);
                    last_error = e;
                }
            }
            if !attempts.exhausted() {
                let backoff = self.retry.backoff_ms(attempts.made() - 1);
                self.delay.delay_ms(backoff).await;
            }
        }
        Err(last_error)
    }

    /// Subscribe to job pushes and to job request responses.
    pub async fn subscribe_jobs(&mut self) -> Result<(), TransportError> {
        let accepted = topic::job_get_accepted(&self.thing_name)?;
        self.client.subscribe(&accepted, QoS::AtLeastOnce).await?;
        let notify = topic::job_notify_next(&self.thing_name)?;
        self.client.subscribe(&notify, QoS::AtLeastOnce).await
    }

    pub async fn unsubscribe_jobs(&mut self) -> Result<(), TransportError> {
        let accepted = topic::job_get_accepted(&self.thing_name)?;
        self.client.unsubscribe(&accepted).await?;
        let notify = topic::job_notify_next(&self.thing_name)?;
        self.client.unsubscribe(&notify).await
    }

    pub async fn subscribe_stream(&mut self, stream: &str) -> Result<(), TransportError> {
        let data = topic::stream_data(&self.thing_name, stream)?;
        self.client.subscribe(&data, QoS::AtMostOnce).await
    }

    pub async fn unsubscribe_stream(&mut self, stream: &str) -> Result<(), TransportError> {
        let data = topic::stream_data(&self.thing_name, stream)?;
        self.client.unsubscribe(&data).await
    }

    /// Ask the job service for the next job. The answer arrives on the
    /// `get/accepted` topic.
    pub async fn request_job(&mut self) -> Result<(), TransportError> {
        self.request_seq = self.request_seq.wrapping_add(1);
        let mut token = heapless::String::<{ MAX_THING_NAME_LEN + 12 }>::new();
        write!(token, "{}:{}", self.request_seq, self.thing_name)
            .map_err(|_| TransportError::ProtocolError)?;
        let body = serde_json::to_vec(&GetNextJob {
            client_token: &token,
        })
        .map_err(|_| TransportError::ProtocolError)?;
        let topic = topic::job_get_next(&self.thing_name)?;
        debug!("requesting next job, token {}", token.as_str());
        self.publish(&topic, &body, QoS::AtLeastOnce).await
    }

    /// Ask for the single block `index` of `file_id`.
    pub async fn request_block(
        &mut self,
        stream: &str,
        file_id: u32,
        block_size: u32,
        index: u32,
    ) -> Result<(), TransportError> {
        self.send_stream_request(
            stream,
            &StreamRequest {
                client_token: STREAM_CLIENT_TOKEN,
                file_id,
                block_size,
                block_offset: index,
                number_of_blocks: 1,
                bitmap: &[0x01],
            },
        )
        .await
    }

    /// Ask for the missing blocks of `window`.
    pub async fn request_blocks(
        &mut self,
        stream: &str,
        file_id: u32,
        block_size: u32,
        window: &Window,
    ) -> Result<(), TransportError> {
        self.send_stream_request(
            stream,
            &StreamRequest {
                client_token: STREAM_CLIENT_TOKEN,
                file_id,
                block_size,
                block_offset: window.offset,
                number_of_blocks: window.count,
                bitmap: &window.bits,
            },
        )
        .await
    }

    async fn send_stream_request(
        &mut self,
        stream: &str,
        request: &StreamRequest<'_>,
    ) -> Result<(), TransportError> {
        let mut buf = [0; MAX_STREAM_REQUEST_SIZE];
        let len = request
            .encode(&mut buf)
            .map_err(|_| TransportError::ProtocolError)?
            .len();
        let topic = topic::stream_get(&self.thing_name, stream)?;
        debug!(
            "requesting {} blocks from {}",
            request.number_of_blocks, request.block_offset
        );
        self.publish(&topic, &buf[..len], QoS::AtMostOnce).await
    }

    /// Report the status of job `job_id`.
    pub async fn update_job_status(
        &mut self,
        job_id: &str,
        update: &JobStatusUpdate<'_>,
        qos: QoS,
    ) -> Result<(), TransportError> {
        let body = serde_json::to_vec(update).map_err(|_| TransportError::ProtocolError)?;
        let topic = topic::job_update(&self.thing_name, job_id)?;
        self.publish(&topic, &body, qos).await
    }

    /// Publish a metrics report built by [`crate::metrics::MetricsReport`].
    pub async fn publish_metrics(&mut self, report: &[u8]) -> Result<(), TransportError> {
        let topic = topic::metrics(&self.thing_name)?;
        self.publish(&topic, report, QoS::AtMostOnce).await
    }
}
