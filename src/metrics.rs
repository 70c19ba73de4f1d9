//! Sensor state publishing.
//!
//! The sampling side fills a [`MetricsSnapshot`]; this module turns it into
//! state messages for the sensor entities announced by discovery. Each sensor
//! is a [`SensorKind`] and reads its own value from the snapshot, so the
//! catalog announced to Home Assistant and the values published for it come
//! from the same table.

use crate::mqtt::discovery::{state_topic, EntityKind};
use crate::mqtt::error::SessionError;
use crate::mqtt::message_manager::QoS;
use crate::mqtt::mqtt_handler::{ConnectionState, PublishOutcome, SessionHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    On,
    Off,
    Sleep,
    Hibernate,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerState::On => "on",
            PowerState::Off => "off",
            PowerState::Sleep => "sleep",
            PowerState::Hibernate => "hibernate",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sample of the local performance counters. RAM values are in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub total_ram: f64,
    pub free_ram: f64,
    pub used_ram: f64,
    pub power_state: PowerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    CpuUsage,
    MemoryUsage,
    TotalRam,
    FreeRam,
    UsedRam,
    PowerState,
}

impl SensorKind {
    pub const ALL: [SensorKind; 6] = [
        SensorKind::CpuUsage,
        SensorKind::MemoryUsage,
        SensorKind::TotalRam,
        SensorKind::FreeRam,
        SensorKind::UsedRam,
        SensorKind::PowerState,
    ];

    pub fn entity_id(self) -> &'static str {
        match self {
            SensorKind::CpuUsage => "cpu_usage",
            SensorKind::MemoryUsage => "memory_usage",
            SensorKind::TotalRam => "total_ram",
            SensorKind::FreeRam => "free_ram",
            SensorKind::UsedRam => "used_ram",
            SensorKind::PowerState => "power_state",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SensorKind::CpuUsage => "CPU Usage",
            SensorKind::MemoryUsage => "Memory Usage",
            SensorKind::TotalRam => "Total RAM",
            SensorKind::FreeRam => "Free RAM",
            SensorKind::UsedRam => "Used RAM",
            SensorKind::PowerState => "Power State",
        }
    }

    pub fn unit(self) -> Option<&'static str> {
        match self {
            SensorKind::CpuUsage | SensorKind::MemoryUsage => Some("%"),
            SensorKind::TotalRam | SensorKind::FreeRam | SensorKind::UsedRam => Some("MB"),
            SensorKind::PowerState => None,
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            SensorKind::CpuUsage => "mdi:cpu-64-bit",
            SensorKind::PowerState => "mdi:power",
            _ => "mdi:memory",
        }
    }

    /// State payload for this sensor, numbers with two decimals.
    pub fn read(self, snapshot: &MetricsSnapshot) -> String {
        match self {
            SensorKind::CpuUsage => format!("{:.2}", snapshot.cpu_usage),
            SensorKind::MemoryUsage => format!("{:.2}", snapshot.memory_usage),
            SensorKind::TotalRam => format!("{:.2}", snapshot.total_ram),
            SensorKind::FreeRam => format!("{:.2}", snapshot.free_ram),
            SensorKind::UsedRam => format!("{:.2}", snapshot.used_ram),
            SensorKind::PowerState => snapshot.power_state.as_str().to_string(),
        }
    }
}

/// Publishes every sensor value of `snapshot` through the session.
///
/// While the session is offline the states are buffered like any other
/// publish, so the returned outcomes tell which ones went out directly.
pub async fn publish_snapshot(
    session: &SessionHandle,
    device_id: &str,
    snapshot: &MetricsSnapshot,
) -> Result<Vec<PublishOutcome>, SessionError> {
    let mut outcomes = Vec::with_capacity(SensorKind::ALL.len());
    for sensor in SensorKind::ALL {
        let topic = state_topic(EntityKind::Sensor, device_id, sensor.entity_id());
        let outcome = session
            .publish(topic, sensor.read(snapshot), QoS::AtLeastOnce, false)
            .await?;
        outcomes.push(outcome);
    }
    debug!("Published metrics snapshot for {}: {:?}", device_id, outcomes);
    Ok(outcomes)
}

/// Reports the power state ahead of a shutdown, standby or hibernate.
pub async fn publish_power_state(
    session: &SessionHandle,
    device_id: &str,
    state: PowerState,
) -> Result<PublishOutcome, SessionError> {
    let topic = state_topic(
        EntityKind::Sensor,
        device_id,
        SensorKind::PowerState.entity_id(),
    );
    session
        .publish(topic, state.as_str(), QoS::AtLeastOnce, false)
        .await
}

/// Publishes the latest snapshot from `snapshots` every `interval`.
///
/// Ticks are skipped while the session is not connected; a sample is only
/// worth sending while it is current. The task ends once the session has
/// shut down.
pub fn start_publisher_task(
    session: SessionHandle,
    device_id: String,
    snapshots: watch::Receiver<MetricsSnapshot>,
    interval: Duration,
) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(100));
    info!("Starting metrics publisher with interval: {:?}", interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            if session.is_closed() {
                debug!("Session closed, stopping metrics publisher");
                break;
            }
            if session.state() != ConnectionState::Connected {
                continue;
            }

            let snapshot = snapshots.borrow().clone();
            if let Err(e) = publish_snapshot(&session, &device_id, &snapshot).await {
                error!("Failed to publish metrics: {}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            cpu_usage: 12.346,
            memory_usage: 50.0,
            total_ram: 16384.0,
            free_ram: 8191.996,
            used_ram: 8192.004,
            power_state: PowerState::On,
        }
    }

    #[test]
    fn numeric_sensors_use_two_decimals() {
        let snap = snapshot();
        assert_eq!(SensorKind::CpuUsage.read(&snap), "12.35");
        assert_eq!(SensorKind::MemoryUsage.read(&snap), "50.00");
        assert_eq!(SensorKind::TotalRam.read(&snap), "16384.00");
        assert_eq!(SensorKind::FreeRam.read(&snap), "8192.00");
        assert_eq!(SensorKind::UsedRam.read(&snap), "8192.00");
    }

    #[test]
    fn power_state_reads_as_word() {
        let mut snap = snapshot();
        assert_eq!(SensorKind::PowerState.read(&snap), "on");
        snap.power_state = PowerState::Hibernate;
        assert_eq!(SensorKind::PowerState.read(&snap), "hibernate");
    }

    #[test]
    fn entity_ids_are_unique() {
        let mut ids: Vec<&str> = SensorKind::ALL.iter().map(|s| s.entity_id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), SensorKind::ALL.len());
    }

    #[test]
    fn units_and_icons() {
        assert_eq!(SensorKind::CpuUsage.unit(), Some("%"));
        assert_eq!(SensorKind::FreeRam.unit(), Some("MB"));
        assert_eq!(SensorKind::PowerState.unit(), None);
        assert_eq!(SensorKind::CpuUsage.icon(), "mdi:cpu-64-bit");
        assert_eq!(SensorKind::UsedRam.icon(), "mdi:memory");
    }
}
