// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! MQTT topics of the job and stream services.

use core::fmt::{self, Write};
use consts::MAX_TOPIC_LEN;

/// A topic built by the agent.
pub type Topic = heapless::String<MAX_TOPIC_LEN>;

/// The topic does not fit in [`Topic`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TopicTooLong;

/// Kind of an inbound message, decided from its topic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageKind {
    /// Job document, either pushed or in response to a job request
    Job,
    /// Firmware block
    Stream,
}

fn build(args: fmt::Arguments) -> Result<Topic, TopicTooLong> {
    let mut topic = Topic::new();
    topic.write_fmt(args).map_err(|_| TopicTooLong)?;
    Ok(topic)
}

/// Topic the agent publishes job requests on.
pub fn job_get_next(thing: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/jobs/$next/get"))
}

/// Topic carrying the responses to job requests.
pub fn job_get_accepted(thing: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/jobs/$next/get/accepted"))
}

/// Topic the job service pushes new jobs on.
pub fn job_notify_next(thing: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/jobs/notify-next"))
}

/// Topic the agent publishes job status updates on.
pub fn job_update(thing: &str, job_id: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/jobs/{job_id}/update"))
}

/// Topic the agent publishes block requests on.
pub fn stream_get(thing: &str, stream: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/streams/{stream}/get"))
}

/// Topic carrying the blocks of a stream.
pub fn stream_data(thing: &str, stream: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/streams/{stream}/data"))
}

/// Topic the agent publishes metric reports on.
pub fn metrics(thing: &str) -> Result<Topic, TopicTooLong> {
    build(format_args!("$aws/things/{thing}/defender/metrics/json"))
}

/// Decide what an inbound message is from its topic. Topics the agent never
/// subscribes to yield `None`.
pub fn classify(topic: &str) -> Option<MessageKind> {
    let rest = topic.strip_prefix("$aws/things/")?;
    let (_thing, rest) = rest.split_once('/')?;
    if rest == "jobs/notify-next" || rest == "jobs/$next/get/accepted" {
        return Some(MessageKind::Job);
    }
    let stream = rest.strip_prefix("streams/")?.strip_suffix("/data")?;
    if stream.is_empty() || stream.contains('/') {
        return None;
    }
    Some(MessageKind::Stream)
}
