// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundationdevices.com>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device metrics report built from the agent statistics.

use crate::{
    error::TransportError,
    stats::{OtaStatistics, Statistics},
    transport::{PubSub, TransportAdapter},
};
use alloc::vec::Vec;
use embedded_hal_async::delay::DelayNs;
use serde::{ser::SerializeMap, Serialize, Serializer};

/// Value of one metric in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Counter(u32),
    Text(&'static str),
}

/// One entry of the metrics report.
pub trait MetricSource {
    /// Key of the metric in the report
    fn name(&self) -> &'static str;

    /// Sample the value reported next.
    fn refresh(&mut self);

    fn report_get(&self) -> MetricValue;
}

/// Counter taken from the agent statistics.
pub struct CounterMetric<'a> {
    name: &'static str,
    stats: &'a Statistics,
    read: fn(&OtaStatistics) -> u32,
    value: u32,
}

impl<'a> CounterMetric<'a> {
    pub fn new(name: &'static str, stats: &'a Statistics, read: fn(&OtaStatistics) -> u32) -> Self {
        Self {
            name,
            stats,
            read,
            value: 0,
        }
    }
}

impl MetricSource for CounterMetric<'_> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn refresh(&mut self) {
        self.value = (self.read)(&self.stats.snapshot());
    }

    fn report_get(&self) -> MetricValue {
        MetricValue::Counter(self.value)
    }
}

/// Current state of the agent.
pub struct StateMetric<'a> {
    stats: &'a Statistics,
    value: &'static str,
}

impl<'a> StateMetric<'a> {
    pub fn new(stats: &'a Statistics) -> Self {
        Self {
            stats,
            value: stats.state().name(),
        }
    }
}

impl MetricSource for StateMetric<'_> {
    fn name(&self) -> &'static str {
        "ota_state"
    }

    fn refresh(&mut self) {
        self.value = self.stats.state().name();
    }

    fn report_get(&self) -> MetricValue {
        MetricValue::Text(self.value)
    }
}

#[derive(Serialize)]
struct Header {
    report_id: u32,
    version: &'static str,
}

struct Metrics<'s, 'm>(&'s [&'m mut dyn MetricSource]);

impl Serialize for Metrics<'_, '_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for source in self.0 {
            map.serialize_entry(source.name(), &source.report_get())?;
        }
        map.end()
    }
}

#[derive(Serialize)]
struct Report<'s, 'm> {
    header: Header,
    metrics: Metrics<'s, 'm>,
}

/// Builds numbered metrics reports.
#[derive(Debug, Default)]
pub struct MetricsReport {
    report_id: u32,
}

impl MetricsReport {
    pub const fn new() -> Self {
        Self { report_id: 0 }
    }

    /// Id of the last report built.
    pub fn report_id(&self) -> u32 {
        self.report_id
    }

    /// Refresh every source and serialize them into the next report.
    pub fn build(&mut self, sources: &mut [&mut dyn MetricSource]) -> Result<Vec<u8>, serde_json::Error> {
        for source in sources.iter_mut() {
            source.refresh();
        }
        self.report_id = self.report_id.wrapping_add(1);
        serde_json::to_vec(&Report {
            header: Header {
                report_id: self.report_id,
                version: "1.0",
            },
            metrics: Metrics(sources),
        })
    }

    /// Build the next report and publish it.
    pub async fn publish<C: PubSub, D: DelayNs>(
        &mut self,
        transport: &mut TransportAdapter<C, D>,
        sources: &mut [&mut dyn MetricSource],
    ) -> Result<(), TransportError> {
        let report = self
            .build(sources)
            .map_err(|_| TransportError::ProtocolError)?;
        debug!("publishing metrics report {}", self.report_id);
        transport.publish_metrics(&report).await
    }
}
