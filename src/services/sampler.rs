//! Telemetry sampler
//!
//! Read-only polling of one device at a fixed period, exposed as an
//! infinite iterator. A failed tick yields a [`SampleError`] and the next
//! tick tries again; only the stop signal ends the sequence.

use crate::domain::{ClockDomain, TelemetrySample};
use crate::error::{NvmlError, SampleError};
use crate::nvml::{DeviceSession, GpuDevice};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Read one sample from a device
///
/// Temperature and clocks are required; power draw, utilization and the
/// per-fan readings are left out when the board does not report them.
pub fn read_sample(device: &dyn GpuDevice) -> Result<TelemetrySample, NvmlError> {
    let temperature = device.temperature()?;
    let core_clock = device.clock_speed(ClockDomain::Core)?;
    let mem_clock = device.clock_speed(ClockDomain::Memory)?;

    let fan_count = device.fan_count().unwrap_or(0);
    let fan_rpm = (0..fan_count)
        .filter_map(|i| device.fan_rpm(i).ok())
        .collect();
    let fan_duty_percent = (0..fan_count)
        .filter_map(|i| device.fan_speed(i).ok())
        .map(|s| s.as_percentage())
        .collect();

    Ok(TelemetrySample {
        device_index: device.index(),
        timestamp: Utc::now(),
        temperature_c: temperature.as_celsius(),
        power_watts: device
            .power_usage()
            .ok()
            .map(|p| p.as_milliwatts() as f64 / 1000.0),
        core_clock_mhz: core_clock.as_mhz(),
        mem_clock_mhz: mem_clock.as_mhz(),
        fan_rpm,
        fan_duty_percent,
        utilization_percent: device.utilization().ok().map(|u| u.gpu),
    })
}

/// Cooperative stop flag that can also be waited on
///
/// Clones share the flag. Waiting returns early as soon as the flag is set,
/// so a loop sleeping between ticks stops promptly.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake every waiter
    pub fn stop(&self) {
        let (flag, cvar) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `timeout`; returns true if a stop was requested
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Periodic sample stream for one device
pub struct Sampler {
    session: Arc<DeviceSession>,
    interval: Duration,
    stop: StopSignal,
    next_tick: Option<Instant>,
}

impl Sampler {
    pub fn new(session: Arc<DeviceSession>, interval: Duration, stop: StopSignal) -> Self {
        Self {
            session,
            interval,
            stop,
            next_tick: None,
        }
    }

    /// Take one sample now, outside the schedule
    pub fn sample(&self) -> Result<TelemetrySample, SampleError> {
        let device = self.session.index();
        self.session
            .call(|d| read_sample(d))
            .map_err(|e| SampleError::Transient {
                device,
                reason: e.to_string(),
            })
    }

    /// Start the schedule over: the next item is sampled immediately
    pub fn restart(&mut self) {
        self.next_tick = None;
    }
}

impl Iterator for Sampler {
    type Item = Result<TelemetrySample, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stop.is_stopped() {
            return None;
        }

        if let Some(deadline) = self.next_tick {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.stop.wait_timeout(remaining) {
                return None;
            }
        }

        let now = Instant::now();
        // Fixed rate; if a tick overran, restart the schedule from now
        self.next_tick = Some(match self.next_tick {
            Some(deadline) if deadline + self.interval > now => deadline + self.interval,
            _ => now + self.interval,
        });

        Some(self.sample())
    }
}

/// Latest telemetry per device as seen by monitoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedEntry {
    Fresh {
        sample: TelemetrySample,
    },
    /// The last tick failed; `last` is the most recent good sample, if any
    Stale {
        last: Option<TelemetrySample>,
        reason: String,
        since: DateTime<Utc>,
    },
}

impl FeedEntry {
    /// Most recent good sample regardless of freshness
    pub fn sample(&self) -> Option<&TelemetrySample> {
        match self {
            FeedEntry::Fresh { sample } => Some(sample),
            FeedEntry::Stale { last, .. } => last.as_ref(),
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, FeedEntry::Stale { .. })
    }
}

/// Shared store of the latest [`FeedEntry`] per device
#[derive(Debug, Clone, Default)]
pub struct TelemetryFeed {
    entries: Arc<RwLock<BTreeMap<u32, FeedEntry>>>,
}

impl TelemetryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, sample: TelemetrySample) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(sample.device_index, FeedEntry::Fresh { sample });
    }

    /// Record a failed tick; keeps the previous good sample for display
    pub fn mark_stale(&self, error: &SampleError) {
        let SampleError::Transient { device, reason } = error;
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = match entries.remove(device) {
            Some(FeedEntry::Fresh { sample }) => FeedEntry::Stale {
                last: Some(sample),
                reason: reason.clone(),
                since: Utc::now(),
            },
            Some(FeedEntry::Stale { last, since, .. }) => FeedEntry::Stale {
                last,
                reason: reason.clone(),
                since,
            },
            None => FeedEntry::Stale {
                last: None,
                reason: reason.clone(),
                since: Utc::now(),
            },
        };
        entries.insert(*device, entry);
    }

    pub fn latest(&self, device: u32) -> Option<FeedEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Temperature;
    use crate::mock::{MockDevice, MockOp};

    fn session(device: MockDevice) -> Arc<DeviceSession> {
        Arc::new(DeviceSession::spawn(device, Duration::from_secs(1)).unwrap())
    }

    #[test]
    fn test_read_sample() {
        let device = MockDevice::new(0);
        device.set_temperature(Temperature::new(66));

        let sample = read_sample(&device).unwrap();
        assert_eq!(sample.temperature_c, 66);
        assert_eq!(sample.fan_duty_percent, vec![50, 50]);
        assert_eq!(sample.fan_rpm.len(), 2);
        assert_eq!(sample.power_watts, Some(150.0));
        assert_eq!(sample.core_clock_mhz, 1800);
    }

    #[test]
    fn test_sampler_yields_every_interval() {
        let sampler = Sampler::new(
            session(MockDevice::new(0)),
            Duration::from_millis(10),
            StopSignal::new(),
        );

        let start = Instant::now();
        let samples: Vec<_> = sampler.take(3).collect();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|s| s.is_ok()));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_transient_error_does_not_end_stream() {
        let device = MockDevice::new(0);
        let hw = device.clone();
        let mut sampler =
            Sampler::new(session(device), Duration::from_millis(5), StopSignal::new());

        hw.fail_on(MockOp::Temperature);
        let err = sampler.next().unwrap().unwrap_err();
        assert!(matches!(err, SampleError::Transient { device: 0, .. }));

        hw.clear_failure(MockOp::Temperature);
        assert!(sampler.next().unwrap().is_ok());
    }

    #[test]
    fn test_stop_ends_stream() {
        let stop = StopSignal::new();
        let mut sampler = Sampler::new(
            session(MockDevice::new(0)),
            Duration::from_secs(60),
            stop.clone(),
        );

        assert!(sampler.next().is_some());
        stop.stop();
        // Would otherwise wait a full minute
        assert!(sampler.next().is_none());
    }

    #[test]
    fn test_restart_samples_immediately() {
        let mut sampler = Sampler::new(
            session(MockDevice::new(0)),
            Duration::from_secs(60),
            StopSignal::new(),
        );
        assert!(sampler.next().is_some());

        sampler.restart();
        let start = Instant::now();
        assert!(sampler.next().is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_stop_signal_wait() {
        let stop = StopSignal::new();
        assert!(!stop.wait_timeout(Duration::from_millis(1)));

        let other = stop.clone();
        let handle = std::thread::spawn(move || other.wait_timeout(Duration::from_secs(30)));
        stop.stop();
        assert!(handle.join().unwrap());
        assert!(stop.is_stopped());
    }

    #[test]
    fn test_feed_marks_stale_and_keeps_last_sample() {
        let feed = TelemetryFeed::new();
        assert!(feed.latest(0).is_none());

        let sample = read_sample(&MockDevice::new(0)).unwrap();
        feed.publish(sample.clone());
        assert!(!feed.latest(0).unwrap().is_stale());

        feed.mark_stale(&SampleError::Transient {
            device: 0,
            reason: "timed out".into(),
        });
        let entry = feed.latest(0).unwrap();
        assert!(entry.is_stale());
        assert_eq!(entry.sample(), Some(&sample));
    }
}
