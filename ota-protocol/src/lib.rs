// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device to cloud OTA protocol.
//! The device runs the OTA agent, the cloud side runs a job service handing out
//! update jobs and a stream service handing out firmware blocks.
//! Job traffic is JSON, stream traffic is `postcard`.

#![no_std]
use serde::{Deserialize, Serialize};

pub mod topic;

pub use topic::{classify, MessageKind, Topic, TopicTooLong};

/// Maximum size of a serialized [`StreamRequest`].
pub const MAX_STREAM_REQUEST_SIZE: usize = 64 + consts::MAX_BLOCK_BITMAP_SIZE;

/// Request for a run of blocks of one file, sent on the stream `get` topic.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamRequest<'a> {
    /// Token echoed by the stream service
    pub client_token: &'a str,
    /// File within the job the blocks belong to
    pub file_id: u32,
    /// Size of every block but the last one
    pub block_size: u32,
    /// Index of the block bit 0 of `bitmap` refers to
    pub block_offset: u32,
    /// Number of blocks covered by `bitmap`
    pub number_of_blocks: u32,
    /// Bit `i` (LSB first) set means block `block_offset + i` is wanted
    pub bitmap: &'a [u8],
}

/// One firmware block, received on the stream `data` topic.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamBlock<'a> {
    /// File within the job the block belongs to
    pub file_id: u32,
    /// Position of the block in the file
    pub block_index: u32,
    /// Block data, at most one block size long
    pub payload: &'a [u8],
}

impl<'a> StreamBlock<'a> {
    /// Decode a block from a stream `data` message.
    pub fn decode(raw: &'a [u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(raw)
    }
}

impl<'a> StreamRequest<'a> {
    /// Encode the request into `buf`, returning the used part.
    pub fn encode<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8], postcard::Error> {
        postcard::to_slice(self, buf)
    }
}

/// Body of a job request, sent on the `$next/get` topic.
#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct GetNextJob<'a> {
    /// `<sequence>:<thing name>`, echoed in the response
    #[serde(rename = "clientToken")]
    pub client_token: &'a str,
}

/// Status of a job execution as reported to the job service.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Download, verification or self test under way
    InProgress,
    /// The job failed on this device
    Failed,
    /// The new image passed its self test
    Succeeded,
    /// The job was refused by this device
    Rejected,
}

/// Step of the self test carried in the status details.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "lowercase")]
pub enum SelfTestStep {
    /// Image verified and about to be activated
    Ready,
    /// Image booted and running its self test
    Active,
}

/// Free-form details attached to a status update. Absent fields are omitted.
#[derive(Serialize, Default, Clone, Debug, Eq, PartialEq)]
pub struct StatusDetails<'a> {
    /// Progress as `received/total` blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub self_test: Option<SelfTestStep>,
    /// Version of the image that requested the update, as `0x<hex>`
    #[serde(rename = "updatedBy", skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'a str>,
}

/// Body of a job execution update, sent on the `<job id>/update` topic.
#[derive(Serialize, Clone, Debug, Eq, PartialEq)]
pub struct JobStatusUpdate<'a> {
    pub status: JobStatus,
    #[serde(rename = "statusDetails")]
    pub status_details: StatusDetails<'a>,
}
