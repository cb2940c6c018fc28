// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error taxonomy of the agent. Every component has its own closed set of
//! errors; [`OtaError`] is what a failed job reports.

use core::fmt;

/// Failure of the messaging transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// No acknowledgement or response in time
    Timeout,
    /// The client has no connection to the broker
    NotConnected,
    /// The broker refused the operation or a message could not be encoded
    ProtocolError,
    /// A topic does not fit in the topic buffer
    TopicTooLong,
}

/// Structural violation in a job document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// Not JSON, or a field has the wrong type
    Malformed,
    /// A required field is absent
    MissingField(&'static str),
    /// The document format version is not understood
    UnsupportedVersion,
    /// A field is present but its value is unusable
    InvalidValue(&'static str),
}

/// Failure while assembling the image from blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BlockError {
    /// Block index past the last block of the file
    OutOfRange { index: u32 },
    /// Block payload length differs from what its position requires
    SizeMismatch { index: u32, len: u32 },
    /// The sink failed to store the block
    SinkWrite { index: u32, error: SinkError },
    /// The sink failed to return a stored block for hashing
    SinkRead { index: u32, error: SinkError },
    /// A block was requested too many times
    RetriesExhausted { index: u32 },
    /// The file needs more blocks than the bitmap can track
    TooManyBlocks,
    /// A stream message could not be decoded
    Malformed,
    /// The digest was asked for before all blocks arrived
    Incomplete,
}

/// Failure of the platform image sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkError {
    Write,
    Read,
    Erase,
    /// Access outside of the partition
    OutOfBounds,
    /// Flash alignment requirements not met
    Unaligned,
    /// No verified image is waiting for activation
    NoPendingImage,
    /// Switching to the new image failed
    Activation,
    /// The boot metadata record could not be stored
    Metadata,
    /// The operation is not valid in the current image state
    BadImageState,
}

/// Failure of the final image verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyError {
    /// The signature does not match the image digest
    SignatureMismatch,
    /// The job asks for a signature scheme this device cannot check
    UnsupportedAlgorithm,
    /// The signature bytes are not a valid encoding
    MalformedSignature,
    /// The trusted key could not be decoded
    InvalidKey,
}

/// Invalid agent configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    ThingNameTooLong,
    EmptyThingName,
    /// Block size zero or larger than a message can carry
    BlockSize,
    /// Request window zero or wider than the bitmap
    RequestWindow,
}

/// Reason a job or a self test ended without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaError {
    Transport(TransportError),
    Parse(ParseError),
    Block(BlockError),
    Sink(SinkError),
    Verify(VerifyError),
    Config(ConfigError),
    /// The application aborted the job
    UserAbort,
    /// No answer to any of the job requests
    JobRequestExhausted,
    /// Every activation attempt failed
    ActivationExhausted,
    /// A self test job arrived while no image is under test
    ImageStateMismatch,
    /// The job would install an older image
    DowngradeNotAllowed,
    /// The job would install the running image again
    SameFirmwareVersion,
    /// The image did not confirm itself within the self test window
    SelfTestTimeout,
    /// The application rejected the image under test
    ImageRejected,
}

impl OtaError {
    /// Stable numeric code, reported to the job service in failure reasons.
    /// The high byte is the component, the low byte the variant.
    pub fn code(&self) -> u32 {
        match self {
            OtaError::Transport(e) => 0x0100 | *e as u32,
            OtaError::Parse(e) => {
                0x0200
                    | match e {
                        ParseError::Malformed => 0,
                        ParseError::MissingField(_) => 1,
                        ParseError::UnsupportedVersion => 2,
                        ParseError::InvalidValue(_) => 3,
                    }
            }
            OtaError::Block(e) => {
                0x0300
                    | match e {
                        BlockError::OutOfRange { .. } => 0,
                        BlockError::SizeMismatch { .. } => 1,
                        BlockError::SinkWrite { .. } => 2,
                        BlockError::SinkRead { .. } => 3,
                        BlockError::RetriesExhausted { .. } => 4,
                        BlockError::TooManyBlocks => 5,
                        BlockError::Malformed => 6,
                        BlockError::Incomplete => 7,
                    }
            }
            OtaError::Sink(e) => 0x0400 | *e as u32,
            OtaError::Verify(e) => 0x0500 | *e as u32,
            OtaError::Config(e) => 0x0600 | *e as u32,
            OtaError::UserAbort => 0x0700,
            OtaError::JobRequestExhausted => 0x0701,
            OtaError::ActivationExhausted => 0x0702,
            OtaError::ImageStateMismatch => 0x0703,
            OtaError::DowngradeNotAllowed => 0x0704,
            OtaError::SameFirmwareVersion => 0x0705,
            OtaError::SelfTestTimeout => 0x0706,
            OtaError::ImageRejected => 0x0707,
        }
    }
}

impl From<TransportError> for OtaError {
    fn from(e: TransportError) -> Self {
        OtaError::Transport(e)
    }
}

impl From<ParseError> for OtaError {
    fn from(e: ParseError) -> Self {
        OtaError::Parse(e)
    }
}

impl From<BlockError> for OtaError {
    fn from(e: BlockError) -> Self {
        OtaError::Block(e)
    }
}

impl From<SinkError> for OtaError {
    fn from(e: SinkError) -> Self {
        OtaError::Sink(e)
    }
}

impl From<VerifyError> for OtaError {
    fn from(e: VerifyError) -> Self {
        OtaError::Verify(e)
    }
}

impl From<ConfigError> for OtaError {
    fn from(e: ConfigError) -> Self {
        OtaError::Config(e)
    }
}

impl From<ota_protocol::TopicTooLong> for TransportError {
    fn from(_: ota_protocol::TopicTooLong) -> Self {
        TransportError::TopicTooLong
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "transport timeout"),
            TransportError::NotConnected => write!(f, "not connected"),
            TransportError::ProtocolError => write!(f, "protocol error"),
            TransportError::TopicTooLong => write!(f, "topic too long"),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Malformed => write!(f, "malformed job document"),
            ParseError::MissingField(field) => write!(f, "missing field {field}"),
            ParseError::UnsupportedVersion => write!(f, "unsupported job document version"),
            ParseError::InvalidValue(field) => write!(f, "invalid value for {field}"),
        }
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockError::OutOfRange { index } => write!(f, "block {index} out of range"),
            BlockError::SizeMismatch { index, len } => {
                write!(f, "block {index} has unexpected size {len}")
            }
            BlockError::SinkWrite { index, error } => {
                write!(f, "failed to write block {index}: {error}")
            }
            BlockError::SinkRead { index, error } => {
                write!(f, "failed to read back block {index}: {error}")
            }
            BlockError::RetriesExhausted { index } => {
                write!(f, "retries exhausted for block {index}")
            }
            BlockError::TooManyBlocks => write!(f, "file has too many blocks"),
            BlockError::Malformed => write!(f, "malformed stream message"),
            BlockError::Incomplete => write!(f, "image incomplete"),
        }
    }
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SinkError::Write => write!(f, "flash write failed"),
            SinkError::Read => write!(f, "flash read failed"),
            SinkError::Erase => write!(f, "flash erase failed"),
            SinkError::OutOfBounds => write!(f, "access outside of partition"),
            SinkError::Unaligned => write!(f, "unaligned flash access"),
            SinkError::NoPendingImage => write!(f, "no pending image"),
            SinkError::Activation => write!(f, "image activation failed"),
            SinkError::Metadata => write!(f, "boot metadata update failed"),
            SinkError::BadImageState => write!(f, "operation invalid in current image state"),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VerifyError::SignatureMismatch => write!(f, "signature mismatch"),
            VerifyError::UnsupportedAlgorithm => write!(f, "unsupported signature algorithm"),
            VerifyError::MalformedSignature => write!(f, "malformed signature"),
            VerifyError::InvalidKey => write!(f, "invalid public key"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ThingNameTooLong => write!(f, "thing name too long"),
            ConfigError::EmptyThingName => write!(f, "thing name empty"),
            ConfigError::BlockSize => write!(f, "invalid block size"),
            ConfigError::RequestWindow => write!(f, "invalid request window"),
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OtaError::Transport(e) => write!(f, "{e}"),
            OtaError::Parse(e) => write!(f, "{e}"),
            OtaError::Block(e) => write!(f, "{e}"),
            OtaError::Sink(e) => write!(f, "{e}"),
            OtaError::Verify(e) => write!(f, "{e}"),
            OtaError::Config(e) => write!(f, "{e}"),
            OtaError::UserAbort => write!(f, "aborted by application"),
            OtaError::JobRequestExhausted => write!(f, "no response to job requests"),
            OtaError::ActivationExhausted => write!(f, "image activation failed repeatedly"),
            OtaError::ImageStateMismatch => write!(f, "self test job without image under test"),
            OtaError::DowngradeNotAllowed => write!(f, "downgrade not allowed"),
            OtaError::SameFirmwareVersion => write!(f, "same firmware version"),
            OtaError::SelfTestTimeout => write!(f, "self test window expired"),
            OtaError::ImageRejected => write!(f, "image rejected by application"),
        }
    }
}
