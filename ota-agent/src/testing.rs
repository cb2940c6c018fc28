//! Test doubles for the platform seams.

use crate::{
    agent::{JobEvent, OtaObserver},
    error::{SinkError, TransportError},
    flash::SystemReset,
    sink::{ImageSink, Partition, PlatformImageState},
    transport::{PubSub, QoS},
};
use alloc::{
    string::{String, ToString},
    vec,
    vec::Vec,
};
use embedded_hal_async::delay::DelayNs;
use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};

/// Image sink keeping the pending partition in RAM.
#[derive(Debug)]
pub struct MemorySink {
    pub bank: Vec<u8>,
    pub writes: u32,
    pub reads: u32,
    /// Writes at this offset fail
    pub fail_writes_at: Option<u32>,
    /// Activation attempts left to fail
    pub fail_activations: u8,
    pub erases: Vec<Partition>,
    pub state: PlatformImageState,
    pub staged: Option<(Partition, u32)>,
    /// Self test window not claimed yet
    pub self_test_window_ms: u32,
    pub activations: u32,
    pub rollbacks: u32,
    pub resets: u32,
}

impl MemorySink {
    pub fn new(size: usize) -> Self {
        Self {
            bank: vec![0xFF; size],
            writes: 0,
            reads: 0,
            fail_writes_at: None,
            fail_activations: 0,
            erases: Vec::new(),
            state: PlatformImageState::Valid,
            staged: None,
            self_test_window_ms: 0,
            activations: 0,
            rollbacks: 0,
            resets: 0,
        }
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, SinkError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.bank.len() {
            return Err(SinkError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl ImageSink for MemorySink {
    fn pending_partition(&self) -> Partition {
        Partition(1)
    }

    fn erase(&mut self, partition: Partition) -> Result<(), SinkError> {
        self.erases.push(partition);
        self.bank.fill(0xFF);
        if self.state == PlatformImageState::Invalid {
            self.state = PlatformImageState::Valid;
        }
        Ok(())
    }

    fn write_at(&mut self, offset: u32, bytes: &[u8]) -> Result<(), SinkError> {
        if self.fail_writes_at == Some(offset) {
            return Err(SinkError::Write);
        }
        let range = self.range(offset, bytes.len())?;
        self.bank[range].copy_from_slice(bytes);
        self.writes += 1;
        Ok(())
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), SinkError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bank[range]);
        self.reads += 1;
        Ok(())
    }

    fn set_pending_activation(
        &mut self,
        partition: Partition,
        image_size: u32,
        self_test_window_ms: u32,
    ) -> Result<(), SinkError> {
        self.staged = Some((partition, image_size));
        self.self_test_window_ms = self_test_window_ms;
        self.state = PlatformImageState::PendingActivation;
        Ok(())
    }

    fn activate_and_reset(&mut self) -> Result<(), SinkError> {
        if self.fail_activations > 0 {
            self.fail_activations -= 1;
            return Err(SinkError::Activation);
        }
        if self.staged.take().is_none() {
            return Err(SinkError::NoPendingImage);
        }
        self.activations += 1;
        self.state = PlatformImageState::PendingCommit;
        self.resets += 1;
        Ok(())
    }

    fn begin_self_test(&mut self) -> Result<u32, SinkError> {
        if self.state != PlatformImageState::PendingCommit {
            return Err(SinkError::BadImageState);
        }
        Ok(core::mem::take(&mut self.self_test_window_ms))
    }

    fn mark_self_test_passed(&mut self) -> Result<(), SinkError> {
        if self.state != PlatformImageState::PendingCommit {
            return Err(SinkError::BadImageState);
        }
        self.state = PlatformImageState::Valid;
        Ok(())
    }

    fn rollback_to_previous(&mut self) -> Result<(), SinkError> {
        self.rollbacks += 1;
        self.state = match self.state {
            PlatformImageState::PendingCommit => PlatformImageState::Invalid,
            PlatformImageState::PendingActivation => {
                self.staged = None;
                PlatformImageState::Valid
            }
            _ => return Err(SinkError::BadImageState),
        };
        Ok(())
    }

    fn image_state(&mut self) -> Result<PlatformImageState, SinkError> {
        Ok(self.state)
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}

/// NOR flash in RAM. Writes can only clear bits.
#[derive(Debug)]
pub struct RamFlash {
    pub data: Vec<u8>,
}

impl RamFlash {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0xFF; size],
        }
    }
}

impl ErrorType for RamFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for RamFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        let src = self
            .data
            .get(start..start + bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for RamFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let (from, to) = (from as usize, to as usize);
        if from % Self::ERASE_SIZE != 0 || to % Self::ERASE_SIZE != 0 || from > to {
            return Err(NorFlashErrorKind::NotAligned);
        }
        self.data
            .get_mut(from..to)
            .ok_or(NorFlashErrorKind::OutOfBounds)?
            .fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        if start % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let dst = self
            .data
            .get_mut(start..start + bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        for (d, s) in dst.iter_mut().zip(bytes) {
            *d &= *s;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CountingReset {
    pub resets: u32,
}

impl SystemReset for CountingReset {
    fn reset(&mut self) {
        self.resets += 1;
    }
}

/// Publish/subscribe client recording every call.
#[derive(Debug)]
pub struct MockClient {
    pub published: Vec<(String, Vec<u8>)>,
    pub subscriptions: Vec<String>,
    /// Publishes left to fail
    pub fail_publishes: u32,
    pub connected: bool,
}

impl Default for MockClient {
    fn default() -> Self {
        Self {
            published: Vec::new(),
            subscriptions: Vec::new(),
            fail_publishes: 0,
            connected: true,
        }
    }
}

impl MockClient {
    /// Payloads published on topics ending with `suffix`.
    pub fn published_on<'a>(&'a self, suffix: &'a str) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.published
            .iter()
            .filter(move |(topic, _)| topic.ends_with(suffix))
            .map(|(_, payload)| payload.as_slice())
    }

    /// Job status updates, parsed.
    pub fn job_updates(&self) -> Vec<serde_json::Value> {
        self.published_on("/update")
            .filter_map(|payload| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub fn clear(&mut self) {
        self.published.clear();
    }
}

impl PubSub for MockClient {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        _qos: QoS,
    ) -> Result<(), TransportError> {
        if self.fail_publishes > 0 {
            self.fail_publishes -= 1;
            return Err(TransportError::Timeout);
        }
        self.published.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.subscriptions.retain(|t| t != topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Delay that returns at once.
#[derive(Debug, Default)]
pub struct NoDelay {
    pub total_ms: u64,
}

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.total_ms += u64::from(ns) / 1_000_000;
    }
}

/// Observer keeping every event.
#[derive(Debug, Default)]
pub struct EventLog(pub Vec<JobEvent>);

impl OtaObserver for EventLog {
    fn on_event(&mut self, event: JobEvent) {
        self.0.push(event);
    }
}
