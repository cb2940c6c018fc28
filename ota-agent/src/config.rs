// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::{error::ConfigError, retry::RetryPolicy, version::AppVersion};
use consts::{
    FILE_BLOCK_SIZE, FILE_REQUEST_WAIT_MS, JOB_REQUEST_WAIT_MS, MAX_ACTIVATION_ATTEMPTS,
    MAX_BLOCKS, MAX_BLOCK_RETRIES, MAX_JOB_REQUEST_ATTEMPTS, MAX_THING_NAME_LEN, REQUEST_WINDOW,
    SELF_TEST_WAIT_MS,
};
use serde::Deserialize;

/// What to do with a job notification while another job is in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Drop it
    #[default]
    Reject,
    /// Ask for the next job once the current one is done
    Defer,
}

/// Runtime configuration of the agent.
/// Missing fields take the defaults from the `consts` crate when loaded with
/// serde.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this device in topics
    pub thing_name: heapless::String<MAX_THING_NAME_LEN>,
    /// Block size used when the job document does not set one
    pub block_size: u32,
    /// Times a single block is asked for again before the job fails
    pub max_block_retries: u8,
    /// Blocks asked for per stream request
    pub request_window: u32,
    pub file_request_wait_ms: u64,
    pub job_request_wait_ms: u64,
    pub max_job_request_attempts: u8,
    pub self_test_wait_ms: u64,
    /// Retries of every publish
    pub publish_retry: RetryPolicy,
    pub max_activation_attempts: u8,
    pub busy_policy: BusyPolicy,
    /// Version of the running image
    pub app_version: AppVersion,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thing_name: heapless::String::new(),
            block_size: FILE_BLOCK_SIZE as u32,
            max_block_retries: MAX_BLOCK_RETRIES,
            request_window: REQUEST_WINDOW,
            file_request_wait_ms: FILE_REQUEST_WAIT_MS,
            job_request_wait_ms: JOB_REQUEST_WAIT_MS,
            max_job_request_attempts: MAX_JOB_REQUEST_ATTEMPTS,
            self_test_wait_ms: SELF_TEST_WAIT_MS,
            publish_retry: RetryPolicy::default(),
            max_activation_attempts: MAX_ACTIVATION_ATTEMPTS,
            busy_policy: BusyPolicy::default(),
            app_version: AppVersion::default(),
        }
    }
}

impl Config {
    /// Default configuration for the device called `thing_name`.
    pub fn new(thing_name: &str, app_version: AppVersion) -> Result<Self, ConfigError> {
        let mut name = heapless::String::new();
        name.push_str(thing_name)
            .map_err(|_| ConfigError::ThingNameTooLong)?;
        let config = Self {
            thing_name: name,
            app_version,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thing_name.is_empty() {
            return Err(ConfigError::EmptyThingName);
        }
        if self.block_size == 0 || self.block_size as usize > FILE_BLOCK_SIZE {
            return Err(ConfigError::BlockSize);
        }
        if self.request_window == 0 || self.request_window as usize > MAX_BLOCKS {
            return Err(ConfigError::RequestWindow);
        }
        Ok(())
    }
}
