//! Fan curve controller
//!
//! [`FanController`] is a pure per-tick state machine: feed it samples and
//! it says which duty to write, if any. [`FanControlLoop`] runs it against
//! a live device in a background thread and routes every write through the
//! apply gateway.

use crate::domain::{FanSpeed, TelemetrySample, ValidatedFan};
use crate::error::{ApplyError, Result};
use crate::services::gateway::{ApplyGateway, FanModeChange};
use crate::services::sampler::{Sampler, StopSignal, TelemetryFeed};

use chrono::{DateTime, Utc};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Hysteresis and drift settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanTuning {
    /// A curve change at least this large is committed at once
    pub min_step_percent: u8,
    /// After this long without a change, any difference is committed
    pub min_dwell: Duration,
    /// Manual mode re-issues its duty when a fan drifts further than this
    pub drift_tolerance_percent: u8,
}

impl Default for FanTuning {
    fn default() -> Self {
        Self {
            min_step_percent: 2,
            min_dwell: Duration::from_secs(2),
            drift_tolerance_percent: 3,
        }
    }
}

/// Controller state between ticks; never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanControllerState {
    pub mode: ValidatedFan,
    pub last_duty: Option<FanSpeed>,
    pub last_temperature: Option<i32>,
    pub last_change: Option<DateTime<Utc>>,
    /// Manual duty has not been written since the mode was entered
    entry_pending: bool,
}

/// Per-tick fan control policy
#[derive(Debug, Clone)]
pub struct FanController {
    tuning: FanTuning,
    state: FanControllerState,
}

impl FanController {
    /// Start in `Auto`
    pub fn new(tuning: FanTuning) -> Self {
        Self {
            tuning,
            state: FanControllerState {
                mode: ValidatedFan::Auto,
                last_duty: None,
                last_temperature: None,
                last_change: None,
                entry_pending: false,
            },
        }
    }

    pub fn state(&self) -> &FanControllerState {
        &self.state
    }

    pub fn mode(&self) -> &ValidatedFan {
        &self.state.mode
    }

    /// Enter a new mode
    ///
    /// `written` is the duty already put on the fans as part of the mode
    /// change, if any; it counts as the first commit of the new mode.
    pub fn set_mode(&mut self, mode: ValidatedFan, written: Option<FanSpeed>, at: DateTime<Utc>) {
        self.state.entry_pending = matches!(mode, ValidatedFan::Manual { .. }) && written.is_none();
        self.state.mode = mode;
        self.state.last_duty = written;
        self.state.last_change = written.map(|_| at);
    }

    /// Decide what to write for this sample
    ///
    /// Does not assume the write happens: call [`commit`](Self::commit)
    /// once it succeeded. A failed write is simply decided again on the
    /// next tick with the newer temperature.
    pub fn tick(&mut self, sample: &TelemetrySample) -> Option<FanSpeed> {
        self.state.last_temperature = Some(sample.temperature_c);

        match &self.state.mode {
            ValidatedFan::Auto => None,
            ValidatedFan::Manual { duty } => {
                let duty = *duty;
                if self.state.entry_pending {
                    return Some(duty);
                }
                match sample.duty_drift(duty) {
                    Some(drift) if drift > self.tuning.drift_tolerance_percent => Some(duty),
                    _ => None,
                }
            }
            ValidatedFan::Custom { curve } => {
                let target = curve.duty_at(sample.temperature_c);
                let Some(last) = self.state.last_duty else {
                    return Some(target);
                };
                if target == last {
                    return None;
                }

                let step_ok = target.distance(last) >= self.tuning.min_step_percent;
                let dwell_ok = self.state.last_change.map_or(true, |changed| {
                    (sample.timestamp - changed)
                        .to_std()
                        .is_ok_and(|elapsed| elapsed >= self.tuning.min_dwell)
                });

                (step_ok || dwell_ok).then_some(target)
            }
        }
    }

    /// Record a duty that reached the hardware
    pub fn commit(&mut self, duty: FanSpeed, at: DateTime<Utc>) {
        self.state.last_duty = Some(duty);
        self.state.last_change = Some(at);
        self.state.entry_pending = false;
    }
}

/// Background control loop for one device
///
/// Samples at the configured period, publishes every sample to the feed,
/// and writes the controller's decisions through the gateway. Mode changes
/// arrive from the gateway after a successful apply. Stopping is
/// cooperative: the in-flight tick always completes.
pub struct FanControlLoop {
    device_index: u32,
    stop: StopSignal,
    handle: Option<thread::JoinHandle<()>>,
}

impl FanControlLoop {
    pub fn spawn(
        gateway: Arc<ApplyGateway>,
        device_index: u32,
        interval: Duration,
        tuning: FanTuning,
        feed: TelemetryFeed,
    ) -> Result<Self> {
        let session = gateway.session(device_index)?;
        let modes = gateway.subscribe_fan(device_index)?;
        let stop = StopSignal::new();
        let sampler = Sampler::new(session, interval, stop.clone());

        let mut controller = FanController::new(tuning);
        // Pick up a custom mode that was applied before the loop existed
        if let Ok(applied) = gateway.current_fan_mode(device_index) {
            controller.set_mode(applied, None, Utc::now());
        }

        let handle = thread::Builder::new()
            .name(format!("nvoc-fan{}", device_index))
            .spawn(move || run_loop(gateway, device_index, sampler, controller, modes, feed))?;

        log::info!("Fan control loop started for GPU {}", device_index);
        Ok(Self {
            device_index,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop after the current tick and wait for the thread
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Fan control loop for GPU {} panicked", self.device_index);
            }
            log::info!("Fan control loop stopped for GPU {}", self.device_index);
        }
    }
}

impl Drop for FanControlLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(
    gateway: Arc<ApplyGateway>,
    device_index: u32,
    sampler: Sampler,
    mut controller: FanController,
    modes: Receiver<FanModeChange>,
    feed: TelemetryFeed,
) {
    let mut modes_open = true;

    for result in sampler {
        while modes_open {
            match modes.try_recv() {
                Ok(change) => {
                    log::debug!("GPU {}: fan mode -> {:?}", device_index, change.fan);
                    controller.set_mode(change.fan, change.written, change.at);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => modes_open = false,
            }
        }

        let sample = match result {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("{}", e);
                feed.mark_stale(&e);
                continue;
            }
        };
        feed.publish(sample.clone());

        let Some(duty) = controller.tick(&sample) else {
            continue;
        };
        match gateway.apply_fan_duty(device_index, duty) {
            Ok(applied) => {
                log::debug!(
                    "GPU {}: {}°C -> {}",
                    device_index,
                    sample.temperature_c,
                    applied
                );
                controller.commit(applied, sample.timestamp);
            }
            // The mode change is already queued for the next tick
            Err(ApplyError::FanModeMismatch { .. }) => {
                log::debug!("GPU {}: duty dropped, fans back in automatic mode", device_index)
            }
            Err(e) => log::warn!(
                "GPU {}: fan write failed, retrying next tick: {}",
                device_index,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CurvePoint, FanCurve, FanRequest, SettingRequest, Temperature};
    use crate::mock::{MockDevice, MockOp, MockWrite};
    use crate::nvml::DeviceSession;
    use crate::services::gateway::GatewayConfig;
    use crate::services::sampler::FeedEntry;
    use chrono::TimeDelta;
    use std::time::Instant;

    const TICK: Duration = Duration::from_millis(20);

    fn sample_at(start: DateTime<Utc>, secs: i64, temperature_c: i32) -> TelemetrySample {
        TelemetrySample {
            device_index: 0,
            timestamp: start + TimeDelta::seconds(secs),
            temperature_c,
            power_watts: None,
            core_clock_mhz: 1800,
            mem_clock_mhz: 9500,
            fan_rpm: vec![],
            fan_duty_percent: vec![],
            utilization_percent: None,
        }
    }

    fn scenario_curve() -> FanCurve {
        FanCurve::new(vec![
            CurvePoint::new(40, 30),
            CurvePoint::new(60, 50),
            CurvePoint::new(80, 90),
        ])
        .unwrap()
    }

    fn custom_controller() -> FanController {
        let mut controller = FanController::new(FanTuning::default());
        controller.set_mode(
            ValidatedFan::Custom {
                curve: scenario_curve(),
            },
            None,
            Utc::now(),
        );
        controller
    }

    /// Feed samples and commit every decision; returns committed duties
    fn run(controller: &mut FanController, samples: &[TelemetrySample]) -> Vec<Option<u8>> {
        samples
            .iter()
            .map(|s| {
                let decision = controller.tick(s);
                if let Some(duty) = decision {
                    controller.commit(duty, s.timestamp);
                }
                decision.map(|d| d.as_percentage())
            })
            .collect()
    }

    #[test]
    fn test_auto_issues_nothing() {
        let mut controller = FanController::new(FanTuning::default());
        let start = Utc::now();
        for (i, t) in [30, 60, 90].into_iter().enumerate() {
            assert_eq!(controller.tick(&sample_at(start, i as i64, t)), None);
        }
        assert_eq!(controller.state().last_temperature, Some(90));
    }

    #[test]
    fn test_manual_issues_once_per_entry() {
        let mut controller = FanController::new(FanTuning::default());
        let start = Utc::now();
        let duty = FanSpeed::new(60).unwrap();
        controller.set_mode(ValidatedFan::Manual { duty }, None, start);

        let mut sample = sample_at(start, 0, 50);
        sample.fan_duty_percent = vec![50, 50];
        assert_eq!(controller.tick(&sample), Some(duty));
        // Not committed yet: asked again
        assert_eq!(controller.tick(&sample), Some(duty));
        controller.commit(duty, sample.timestamp);

        let mut sample = sample_at(start, 1, 50);
        sample.fan_duty_percent = vec![61, 59];
        assert_eq!(controller.tick(&sample), None);

        // Drift beyond the 3% tolerance triggers a re-issue
        sample.fan_duty_percent = vec![60, 55];
        assert_eq!(controller.tick(&sample), Some(duty));
    }

    #[test]
    fn test_manual_entry_already_written() {
        let mut controller = FanController::new(FanTuning::default());
        let start = Utc::now();
        let duty = FanSpeed::new(45).unwrap();
        controller.set_mode(ValidatedFan::Manual { duty }, Some(duty), start);

        let mut sample = sample_at(start, 1, 50);
        sample.fan_duty_percent = vec![45];
        assert_eq!(controller.tick(&sample), None);
    }

    #[test]
    fn test_custom_scenario_sequence() {
        // Curve (40,30) (60,50) (80,90); 2% step, 2 s dwell, 1 Hz samples.
        // Every step here is at least 2%, so each reading commits its
        // interpolated duty.
        let mut controller = custom_controller();
        let start = Utc::now();
        let samples = [
            sample_at(start, 0, 35),
            sample_at(start, 1, 55),
            sample_at(start, 2, 58),
            sample_at(start, 3, 80),
        ];

        assert_eq!(
            run(&mut controller, &samples),
            vec![Some(30), Some(45), Some(48), Some(90)]
        );
    }

    #[test]
    fn test_custom_holds_through_sensor_noise() {
        let mut controller = custom_controller();
        let start = Utc::now();
        let samples = [
            sample_at(start, 0, 55), // 45%, first commit
            sample_at(start, 1, 56), // 46%: 1% step, 1 s dwell -> hold
            sample_at(start, 1, 55), // back on target -> nothing to do
            sample_at(start, 1, 54), // 44%: 1% step -> hold
            sample_at(start, 3, 56), // 46%: dwell elapsed -> commit
        ];

        assert_eq!(
            run(&mut controller, &samples),
            vec![Some(45), None, None, None, Some(46)]
        );
    }

    #[test]
    fn test_custom_monotonic_temperatures_never_oscillate() {
        let mut controller = custom_controller();
        let start = Utc::now();
        let tuning = FanTuning::default();

        // Slow 1°C ramp at 2 Hz across the whole curve
        let samples: Vec<_> = (0..120)
            .map(|i| sample_at(start, 0, 30 + i / 2))
            .enumerate()
            .map(|(i, mut s)| {
                s.timestamp = start + TimeDelta::milliseconds(500 * i as i64);
                s
            })
            .collect();

        let mut commits: Vec<(DateTime<Utc>, u8)> = Vec::new();
        for s in &samples {
            if let Some(duty) = controller.tick(s) {
                controller.commit(duty, s.timestamp);
                commits.push((s.timestamp, duty.as_percentage()));
            }
        }

        assert!(commits.len() > 2);
        for pair in commits.windows(2) {
            let ((t0, d0), (t1, d1)) = (pair[0], pair[1]);
            assert!(d1 >= d0, "duty decreased on rising temperature");
            let step_ok = d1 - d0 >= tuning.min_step_percent;
            let dwell_ok = (t1 - t0).to_std().unwrap() >= tuning.min_dwell;
            assert!(step_ok || dwell_ok, "commit inside the hysteresis window");
        }
        assert_eq!(commits.last().unwrap().1, 90);
    }

    #[test]
    fn test_failed_write_is_retried_next_tick() {
        let mut controller = custom_controller();
        let start = Utc::now();

        // First decision is never committed
        assert_eq!(controller.tick(&sample_at(start, 0, 60)), Some(FanSpeed::new(50).unwrap()));
        // Next tick decides again from the newer reading
        assert_eq!(controller.tick(&sample_at(start, 1, 70)), Some(FanSpeed::new(70).unwrap()));
    }

    #[test]
    fn test_switching_to_auto_stops_commands() {
        let mut controller = custom_controller();
        let start = Utc::now();
        assert!(controller.tick(&sample_at(start, 0, 70)).is_some());

        controller.set_mode(ValidatedFan::Auto, None, start);
        assert_eq!(controller.tick(&sample_at(start, 5, 90)), None);
        assert_eq!(controller.state().last_duty, None);
    }

    fn live_loop(device: &MockDevice) -> (Arc<ApplyGateway>, TelemetryFeed, FanControlLoop) {
        let config = GatewayConfig::default();
        let session = DeviceSession::spawn(device.clone(), config.call_timeout).unwrap();
        let gateway =
            Arc::new(ApplyGateway::with_sessions(vec![Arc::new(session)], &config).unwrap());
        let feed = TelemetryFeed::new();
        let control =
            FanControlLoop::spawn(gateway.clone(), 0, TICK, FanTuning::default(), feed.clone())
                .unwrap();
        (gateway, feed, control)
    }

    /// Poll until `check` holds or two seconds pass
    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn duty_writes(device: &MockDevice) -> Vec<u8> {
        device
            .writes()
            .into_iter()
            .filter_map(|w| match w {
                MockWrite::FanSpeed(_, duty) => Some(duty),
                _ => None,
            })
            .collect()
    }

    fn apply_custom(gateway: &ApplyGateway) {
        gateway
            .apply(0, &SettingRequest::new().with_fan(FanRequest::custom(scenario_curve())))
            .unwrap();
    }

    #[test]
    fn test_loop_follows_mode_changes() {
        let device = MockDevice::new(0);
        device.set_temperature(Temperature::new(70));
        let (gateway, _feed, mut control) = live_loop(&device);

        // Auto: the loop only watches
        thread::sleep(TICK * 5);
        assert!(duty_writes(&device).is_empty());

        apply_custom(&gateway);
        assert_eq!(duty_writes(&device), vec![70, 70]);
        device.clear_writes();

        device.set_temperature(Temperature::new(80));
        assert!(eventually(|| duty_writes(&device).contains(&90)));

        gateway
            .apply(0, &SettingRequest::new().with_fan(FanRequest::Auto))
            .unwrap();
        device.clear_writes();
        device.set_temperature(Temperature::new(40));
        thread::sleep(TICK * 5);
        assert!(duty_writes(&device).is_empty());

        control.stop();
    }

    #[test]
    fn test_loop_marks_feed_stale_and_keeps_sampling() {
        let device = MockDevice::new(0);
        let (_gateway, feed, mut control) = live_loop(&device);
        assert!(eventually(|| feed.latest(0).is_some_and(|e| !e.is_stale())));

        device.fail_on(MockOp::Temperature);
        assert!(eventually(|| feed.latest(0).is_some_and(|e| e.is_stale())));
        // The last good reading is kept for display
        assert!(feed.latest(0).unwrap().sample().is_some());

        device.clear_failure(MockOp::Temperature);
        device.set_temperature(Temperature::new(63));
        assert!(eventually(|| matches!(
            feed.latest(0),
            Some(FeedEntry::Fresh { sample }) if sample.temperature_c == 63
        )));

        control.stop();
    }

    #[test]
    fn test_loop_retries_failed_duty_write() {
        let device = MockDevice::new(0);
        device.set_temperature(Temperature::new(70));
        let (gateway, _feed, mut control) = live_loop(&device);
        apply_custom(&gateway);
        device.clear_writes();

        device.fail_on(MockOp::SetFanSpeed);
        device.set_temperature(Temperature::new(80));
        thread::sleep(TICK * 5);
        assert!(duty_writes(&device).is_empty());

        device.clear_failure(MockOp::SetFanSpeed);
        assert!(eventually(|| duty_writes(&device).contains(&90)));

        control.stop();
    }

    #[test]
    fn test_stop_finishes_tick_then_goes_quiet() {
        let device = MockDevice::new(0);
        device.set_temperature(Temperature::new(70));
        let (gateway, feed, mut control) = live_loop(&device);
        apply_custom(&gateway);
        assert!(eventually(|| feed.latest(0).is_some()));

        // Slow calls keep a tick in flight when stop is requested
        device.set_latency(Duration::from_millis(15));
        control.stop();
        let last = feed.latest(0);
        device.clear_writes();

        device.set_latency(Duration::ZERO);
        device.set_temperature(Temperature::new(85));
        thread::sleep(TICK * 5);
        assert!(device.writes().is_empty());
        assert_eq!(feed.latest(0), last);
    }
}
