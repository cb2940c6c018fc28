// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Over-the-air firmware update agent.
//!
//! The agent asks a job service for update jobs, downloads the image in
//! blocks from a stream service into the inactive bank, checks its ECDSA
//! P-256 signature and switches banks. After the reboot the new image must
//! pass a self test, otherwise the previous image is restored.
//!
//! Platform services are traits: [`transport::PubSub`] for MQTT,
//! [`sink::ImageSink`] for flash and boot state, [`verify::EcdsaP256Verify`]
//! for the signature primitive.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
mod fmt;

pub mod agent;
pub mod bitmap;
pub mod blocks;
pub mod config;
pub mod error;
pub mod flash;
pub mod job;
pub mod metrics;
pub mod retry;
pub mod sink;
pub mod stats;
pub mod task;
pub mod transport;
pub mod verify;
pub mod version;

#[cfg(test)]
mod testing;

pub use agent::{AgentEvent, ImageState, JobEvent, OtaAgent, OtaObserver, OtaState};
pub use config::{BusyPolicy, Config};
pub use error::OtaError;
pub use sink::{ImageSink, Partition, PlatformImageState};
pub use task::{run, Mailbox};
pub use transport::{PubSub, QoS, TransportAdapter};
pub use verify::{P256Verifier, PublicKey};
pub use version::AppVersion;
