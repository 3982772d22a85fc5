// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! The control loop.
//!
//! Task topology:
//! - the temperature poller reads sensors on a fixed interval and sends the
//!   curve evaluations to the evaluator,
//! - the evaluator asks the actor which evaluations to apply, then commands
//!   the device,
//! - the refresh scheduler reads RPMs on an adaptive cadence,
//! - the actor owns `active`, `pending` and the monitor subscribers; every
//!   state change goes through its event channel.

use crate::config::FanSettings;
use crate::curve::{CurveShaper, Evaluation};
use crate::hwmon::{Collector, Readings};
use crate::openfan::{self, DummyController, FanId, FirmwareInfo, HardwareInfo};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Capacity of the actor's event channel.
const EVENT_BUFFER: usize = 10;

/// Payloads a monitor may lag behind before it is disconnected.
pub const WATCHER_BUFFER: usize = 20;

/// RPM moves within this band are not logged.
const RPM_TOLERANCE: u16 = 5;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// What the control loop needs from a fan controller.
pub trait FanDevice: Send + Sync + 'static {
    fn port(&self) -> &str;
    fn hardware_info(&self) -> openfan::Result<HardwareInfo>;
    fn firmware_info(&self) -> openfan::Result<FirmwareInfo>;
    fn rpms(&self) -> openfan::Result<BTreeMap<FanId, u16>>;
    fn set_pwm(&self, fan: FanId, percent: u8) -> openfan::Result<u8>;
}

impl<P: Read + Write + Send + 'static> FanDevice for openfan::Controller<P> {
    fn port(&self) -> &str {
        openfan::Controller::port(self)
    }

    fn hardware_info(&self) -> openfan::Result<HardwareInfo> {
        openfan::Controller::hardware_info(self)
    }

    fn firmware_info(&self) -> openfan::Result<FirmwareInfo> {
        openfan::Controller::firmware_info(self)
    }

    fn rpms(&self) -> openfan::Result<BTreeMap<FanId, u16>> {
        openfan::Controller::rpms(self)
    }

    fn set_pwm(&self, fan: FanId, percent: u8) -> openfan::Result<u8> {
        openfan::Controller::set_pwm(self, fan, percent)
    }
}

impl FanDevice for DummyController {
    fn port(&self) -> &str {
        DummyController::port(self)
    }

    fn hardware_info(&self) -> openfan::Result<HardwareInfo> {
        Ok(DummyController::hardware_info(self))
    }

    fn firmware_info(&self) -> openfan::Result<FirmwareInfo> {
        Ok(DummyController::firmware_info(self))
    }

    fn rpms(&self) -> openfan::Result<BTreeMap<FanId, u16>> {
        Ok(DummyController::rpms(self))
    }

    fn set_pwm(&self, fan: FanId, percent: u8) -> openfan::Result<u8> {
        Ok(DummyController::set_pwm(self, fan, percent))
    }
}

/// Where temperature readings come from.
pub trait TemperatureSource: Send + Sync + 'static {
    fn temperatures(&self) -> Readings;
}

impl TemperatureSource for Collector {
    fn temperatures(&self) -> Readings {
        Collector::temperatures(self)
    }
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct FanPolicy {
    label: String,
    step_up: Duration,
    step_down: Duration,
}

/// Last applied evaluations and not yet confirmed ones, per fan.
pub struct ControlState {
    policies: HashMap<FanId, FanPolicy>,
    active: BTreeMap<FanId, Evaluation>,
    pending: HashMap<FanId, Evaluation>,
}

impl ControlState {
    pub fn new(fans: &[FanSettings]) -> Self {
        let policies = fans
            .iter()
            .map(|f| {
                (
                    f.id,
                    FanPolicy {
                        label: f.label.clone(),
                        step_up: f.step_up,
                        step_down: f.step_down,
                    },
                )
            })
            .collect();

        Self {
            policies,
            active: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Debounce one batch of evaluations and return those to apply now.
    ///
    /// A changed PWM is applied once it has been seen for the fan's ramp
    /// duration (up or down); a PWM equal to the active one cancels any wait.
    pub fn decide(&mut self, evals: BTreeMap<FanId, Evaluation>) -> Vec<Evaluation> {
        let mut apply = Vec::new();

        for (fan, eval) in evals {
            if let Some(active) = self.active.get(&fan) {
                if eval.pwm == active.pwm {
                    self.pending.remove(&fan);
                    continue;
                }

                let policy = self.policies.get(&fan).cloned().unwrap_or_default();
                let ramp = if eval.pwm > active.pwm {
                    policy.step_up
                } else {
                    policy.step_down
                };

                if !ramp.is_zero() {
                    match self.pending.get(&fan) {
                        None => {
                            self.pending.insert(fan, eval);
                            continue;
                        }
                        Some(first)
                            if eval.evaluated_at.saturating_duration_since(first.evaluated_at)
                                < ramp =>
                        {
                            continue;
                        }
                        Some(_) => {
                            self.pending.remove(&fan);
                        }
                    }
                }
            }

            apply.push(eval);
        }

        apply
    }

    /// Record an applied evaluation, keeping the last known RPM.
    pub fn apply(&mut self, mut eval: Evaluation) {
        if let Some(current) = self.active.get(&eval.id) {
            eval.rpm = current.rpm;
        }
        self.active.insert(eval.id, eval);
    }

    /// Merge fresh RPMs. Returns whether a known speed moved outside the
    /// tolerance band.
    pub fn update_rpms(&mut self, rpms: &BTreeMap<FanId, u16>) -> bool {
        let mut changed = false;
        for (&fan, &rpm) in rpms {
            let label = self.label(fan).to_string();
            let eval = self
                .active
                .entry(fan)
                .or_insert_with(|| Evaluation::idle(fan, &label));

            if eval.rpm != 0 && rpm.abs_diff(eval.rpm) > RPM_TOLERANCE {
                changed = true;
            }
            eval.rpm = rpm;
        }
        changed
    }

    /// `fan1(CPU): 1200 - fan3(Rear): 800`, skipping stopped fans.
    pub fn speeds(&self, rpms: &BTreeMap<FanId, u16>) -> String {
        rpms.iter()
            .filter(|&(_, &rpm)| rpm != 0)
            .map(|(&fan, rpm)| format!("{fan}({}): {rpm}", self.label(fan)))
            .collect::<Vec<_>>()
            .join(" - ")
    }

    /// JSON array of every active record, ordered by fan.
    pub fn snapshot(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.active.values().collect::<Vec<_>>())
    }

    pub fn active(&self) -> &BTreeMap<FanId, Evaluation> {
        &self.active
    }

    pub fn is_pending(&self, fan: FanId) -> bool {
        self.pending.contains_key(&fan)
    }

    fn label(&self, fan: FanId) -> &str {
        self.policies.get(&fan).map(|p| p.label.as_str()).unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

pub type WatcherId = u64;

/// A serialized state snapshot, shared by every watcher.
pub type Payload = Arc<[u8]>;

/// Messages understood by the actor.
pub enum Event {
    /// Debounce a batch of evaluations; the reply lists those to apply.
    Evaluated {
        evals: BTreeMap<FanId, Evaluation>,
        reply: oneshot::Sender<Vec<Evaluation>>,
    },
    UpdateEval(Evaluation),
    UpdateRpms(BTreeMap<FanId, u16>),
    RefreshWatchers,
    Watch {
        id: WatcherId,
        tx: mpsc::Sender<Payload>,
    },
    Unwatch(WatcherId),
}

#[derive(Debug, Error)]
#[error("control loop stopped")]
pub struct Stopped;

/// Sending side of the actor. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<Event>,
}

static NEXT_WATCHER: AtomicU64 = AtomicU64::new(1);

impl ControlHandle {
    async fn send(&self, event: Event) -> Result<(), Stopped> {
        self.tx.send(event).await.map_err(|_| Stopped)
    }

    pub async fn evaluated(
        &self,
        evals: BTreeMap<FanId, Evaluation>,
    ) -> Result<Vec<Evaluation>, Stopped> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Evaluated { evals, reply }).await?;
        rx.await.map_err(|_| Stopped)
    }

    pub async fn update_eval(&self, eval: Evaluation) -> Result<(), Stopped> {
        self.send(Event::UpdateEval(eval)).await
    }

    pub async fn update_rpms(&self, rpms: BTreeMap<FanId, u16>) -> Result<(), Stopped> {
        self.send(Event::UpdateRpms(rpms)).await
    }

    pub async fn refresh_watchers(&self) -> Result<(), Stopped> {
        self.send(Event::RefreshWatchers).await
    }

    /// Subscribe to state snapshots. The current state is delivered right away.
    pub async fn watch(&self) -> Result<(WatcherId, mpsc::Receiver<Payload>), Stopped> {
        let id = NEXT_WATCHER.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);
        self.send(Event::Watch { id, tx }).await?;
        Ok((id, rx))
    }

    pub async fn unwatch(&self, id: WatcherId) -> Result<(), Stopped> {
        self.send(Event::Unwatch(id)).await
    }
}

/// Single owner of the control state and the watcher registry.
pub struct Actor {
    state: ControlState,
    watchers: HashMap<WatcherId, mpsc::Sender<Payload>>,
    rx: mpsc::Receiver<Event>,
}

impl Actor {
    pub fn new(state: ControlState) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let actor = Self {
            state,
            watchers: HashMap::new(),
            rx,
        };
        (actor, ControlHandle { tx })
    }

    /// Process events in arrival order until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.handle(event);
        }
        log::debug!("Control loop stopped");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Evaluated { evals, reply } => {
                let apply = self.state.decide(evals);
                // The evaluator only goes away on shutdown.
                let _ = reply.send(apply);
            }
            Event::UpdateEval(eval) => self.state.apply(eval),
            Event::UpdateRpms(rpms) => {
                if self.state.update_rpms(&rpms) {
                    log::info!("{}", self.state.speeds(&rpms));
                }
                self.refresh_watchers();
            }
            Event::RefreshWatchers => self.refresh_watchers(),
            Event::Watch { id, tx } => {
                self.watchers.insert(id, tx);
                self.refresh_watchers();
            }
            Event::Unwatch(id) => {
                self.watchers.remove(&id);
            }
        }
    }

    /// Push the current state to every watcher without waiting on any of them.
    fn refresh_watchers(&mut self) {
        if self.watchers.is_empty() {
            return;
        }

        let payload: Payload = match self.state.snapshot() {
            Ok(p) => p.into(),
            Err(e) => {
                log::error!("Could not serialize fan states: {e}");
                return;
            }
        };

        self.watchers
            .retain(|id, tx| match tx.try_send(payload.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Monitor {id} is not keeping up, disconnecting it");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }
}

// ---------------------------------------------------------------------------
// RPM refresh scheduling
// ---------------------------------------------------------------------------

/// Cadence of RPM reads: slow by default, fast for a while after a PWM change
/// so the reported speeds converge quickly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSchedule {
    Baseline,
    /// Fast reads left after the current one.
    Burst(u8),
}

impl RefreshSchedule {
    pub const BASELINE_INTERVAL: Duration = Duration::from_secs(10);
    pub const BURST_INTERVAL: Duration = Duration::from_millis(500);
    /// 8 reads over 4s is enough for fans to settle on a new speed.
    pub const BURST_LEN: u8 = 8;

    pub fn burst() -> Self {
        RefreshSchedule::Burst(Self::BURST_LEN)
    }

    /// The schedule after a read, and the delay until the next one.
    pub fn after_tick(self) -> (Self, Duration) {
        match self {
            RefreshSchedule::Baseline | RefreshSchedule::Burst(0) => {
                (RefreshSchedule::Baseline, Self::BASELINE_INTERVAL)
            }
            RefreshSchedule::Burst(n) => (RefreshSchedule::Burst(n - 1), Self::BURST_INTERVAL),
        }
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Everything the control loop runs on.
pub struct ControlLoop {
    device: Arc<dyn FanDevice>,
    source: Arc<dyn TemperatureSource>,
    shaper: Arc<CurveShaper>,
    fans: Vec<FanSettings>,
    poll_interval: Duration,
}

impl ControlLoop {
    pub fn new(
        fans: Vec<FanSettings>,
        device: Arc<dyn FanDevice>,
        source: Arc<dyn TemperatureSource>,
        shaper: CurveShaper,
        poll_interval: Duration,
    ) -> Self {
        Self {
            device,
            source,
            shaper: Arc::new(shaper),
            fans,
            poll_interval,
        }
    }

    /// Spawn the control tasks on `tracker`. They stop when `token` is
    /// cancelled; the actor stops once every returned handle is dropped too.
    pub fn launch(self, token: CancellationToken, tracker: &TaskTracker) -> ControlHandle {
        let (actor, handle) = Actor::new(ControlState::new(&self.fans));
        let (eval_tx, eval_rx) = mpsc::channel(1);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);

        tracker.spawn(actor.run());
        tracker.spawn(poll_temperatures(
            self.source,
            self.shaper,
            eval_tx,
            self.poll_interval,
            token.clone(),
        ));
        tracker.spawn(apply_evaluations(
            self.device.clone(),
            handle.clone(),
            eval_rx,
            refresh_tx,
        ));
        tracker.spawn(refresh_rpms(self.device, handle.clone(), refresh_rx, token));

        handle
    }
}

/// Read temperatures every `interval` and forward the curve evaluations.
async fn poll_temperatures(
    source: Arc<dyn TemperatureSource>,
    shaper: Arc<CurveShaper>,
    tx: mpsc::Sender<BTreeMap<FanId, Evaluation>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let src = source.clone();
        let readings = match tokio::task::spawn_blocking(move || src.temperatures()).await {
            Ok(r) => r,
            Err(e) => {
                log::error!("Temperature collection panicked: {e}");
                continue;
            }
        };

        for e in &readings.errors {
            log::warn!("Could not read temperature sensor: {e}");
        }
        if readings.is_failure() {
            log::error!("Could not read temperature sensors");
            continue;
        }

        let evals = shaper.eval(&readings.temperatures);
        tokio::select! {
            _ = token.cancelled() => break,
            sent = tx.send(evals) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    log::debug!("Temperature poller stopped");
}

/// Debounce each batch through the actor and command the device.
async fn apply_evaluations(
    device: Arc<dyn FanDevice>,
    handle: ControlHandle,
    mut rx: mpsc::Receiver<BTreeMap<FanId, Evaluation>>,
    refresh: mpsc::Sender<()>,
) {
    while let Some(evals) = rx.recv().await {
        let Ok(apply) = handle.evaluated(evals).await else {
            break;
        };
        if apply.is_empty() {
            continue;
        }

        for eval in apply {
            let (fan, pwm) = (eval.id, eval.pwm);
            log::info!(
                "Set PWM {pwm} for {fan}({}) on {:?} of {:.0}°C",
                eval.label,
                eval.temperature_name,
                eval.temperature
            );
            if handle.update_eval(eval).await.is_err() {
                return;
            }

            let dev = device.clone();
            match tokio::task::spawn_blocking(move || dev.set_pwm(fan, pwm)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::error!("Could not set PWM for {fan}: {e}"),
                Err(e) => log::error!("Setting PWM for {fan} panicked: {e}"),
            }
        }

        // A burst already queued covers this change too.
        let _ = refresh.try_send(());
    }

    log::debug!("Evaluator stopped");
}

/// Read RPMs on the adaptive schedule and hand them to the actor.
async fn refresh_rpms(
    device: Arc<dyn FanDevice>,
    handle: ControlHandle,
    mut changes: mpsc::Receiver<()>,
    token: CancellationToken,
) {
    let mut schedule = RefreshSchedule::Baseline;
    let next = time::sleep(Duration::ZERO);
    tokio::pin!(next);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            Some(()) = changes.recv() => {
                schedule = RefreshSchedule::burst();
                next.as_mut().reset(Instant::now());
            }
            _ = &mut next => {
                let dev = device.clone();
                match tokio::task::spawn_blocking(move || dev.rpms()).await {
                    Ok(Ok(rpms)) => {
                        if handle.update_rpms(rpms).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => log::error!("Could not read RPMs: {e}"),
                    Err(e) => log::error!("Reading RPMs panicked: {e}"),
                }

                let (after, delay) = schedule.after_tick();
                schedule = after;
                next.as_mut().reset(Instant::now() + delay);
            }
        }
    }

    log::debug!("RPM refresh stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CurvePoint;
    use crate::hwmon::{Temperature, TemperatureId};
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;

    fn fan_id(i: u8) -> FanId {
        FanId::new(i).unwrap()
    }

    fn settings(step_up: Duration, step_down: Duration) -> Vec<FanSettings> {
        vec![FanSettings {
            id: fan_id(0),
            label: "CPU".to_string(),
            step_up,
            step_down,
            curve_points: vec![CurvePoint {
                pwm: 20,
                thresholds: [("cpu".to_string(), 40)].into_iter().collect(),
            }],
        }]
    }

    fn eval(pwm: u8, at: StdInstant) -> Evaluation {
        Evaluation {
            pwm,
            evaluated_at: at,
            ..Evaluation::idle(fan_id(0), "CPU")
        }
    }

    fn batch(e: Evaluation) -> BTreeMap<FanId, Evaluation> {
        [(e.id, e)].into_iter().collect()
    }

    /// Run one decision round and apply what it returns, as the evaluator does.
    fn round(state: &mut ControlState, e: Evaluation) -> Option<u8> {
        let mut applied = state.decide(batch(e));
        let applied = applied.pop()?;
        let pwm = applied.pwm;
        state.apply(applied);
        Some(pwm)
    }

    #[test]
    fn test_first_evaluation_applies_immediately() {
        let mut state = ControlState::new(&settings(Duration::from_secs(5), Duration::ZERO));
        assert_eq!(round(&mut state, eval(40, StdInstant::now())), Some(40));
        assert_eq!(state.active()[&fan_id(0)].pwm, 40);
    }

    #[test]
    fn test_ramp_up_waits_for_duration() {
        let d = Duration::from_secs(5);
        let mut state = ControlState::new(&settings(d, Duration::ZERO));
        let t0 = StdInstant::now();
        round(&mut state, eval(40, t0));

        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(1))), None);
        assert!(state.is_pending(fan_id(0)));
        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(4))), None);
        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(5))), None);
        // 5s after the first differing evaluation, seen at t0 + 1s.
        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(6))), Some(60));
        assert!(!state.is_pending(fan_id(0)));
        assert_eq!(state.active()[&fan_id(0)].pwm, 60);
    }

    #[test]
    fn test_equal_pwm_clears_pending() {
        let d = Duration::from_secs(5);
        let mut state = ControlState::new(&settings(d, d));
        let t0 = StdInstant::now();
        round(&mut state, eval(40, t0));

        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(1))), None);
        assert!(state.is_pending(fan_id(0)));
        assert_eq!(round(&mut state, eval(40, t0 + Duration::from_secs(2))), None);
        assert!(!state.is_pending(fan_id(0)));

        // The wait starts over.
        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(7))), None);
        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(10))), None);
        assert_eq!(round(&mut state, eval(60, t0 + Duration::from_secs(12))), Some(60));
    }

    #[test]
    fn test_zero_ramp_down_applies_immediately() {
        let mut state = ControlState::new(&settings(Duration::from_secs(5), Duration::ZERO));
        let t0 = StdInstant::now();
        round(&mut state, eval(60, t0));
        assert_eq!(round(&mut state, eval(30, t0 + Duration::from_millis(500))), Some(30));
    }

    #[test]
    fn test_ramp_down_uses_its_own_duration() {
        let mut state =
            ControlState::new(&settings(Duration::ZERO, Duration::from_secs(3)));
        let t0 = StdInstant::now();
        round(&mut state, eval(60, t0));
        assert_eq!(round(&mut state, eval(70, t0 + Duration::from_secs(1))), Some(70));
        assert_eq!(round(&mut state, eval(30, t0 + Duration::from_secs(2))), None);
        assert_eq!(round(&mut state, eval(30, t0 + Duration::from_secs(5))), Some(30));
    }

    #[test]
    fn test_rpm_merge_and_change_detection() {
        let mut state = ControlState::new(&settings(Duration::ZERO, Duration::ZERO));
        let rpms: BTreeMap<FanId, u16> = [(fan_id(0), 1000), (fan_id(5), 0)].into_iter().collect();

        // Unknown speeds are not a change.
        assert!(!state.update_rpms(&rpms));
        assert_eq!(state.active().len(), 2);
        assert_eq!(state.active()[&fan_id(5)].id, fan_id(5));
        assert_eq!(state.active()[&fan_id(0)].label, "CPU");

        let within: BTreeMap<FanId, u16> = [(fan_id(0), 1004)].into_iter().collect();
        assert!(!state.update_rpms(&within));
        let beyond: BTreeMap<FanId, u16> = [(fan_id(0), 1010)].into_iter().collect();
        assert!(state.update_rpms(&beyond));
        assert_eq!(state.speeds(&rpms), "fan1(CPU): 1000");
    }

    #[test]
    fn test_apply_keeps_rpm() {
        let mut state = ControlState::new(&settings(Duration::ZERO, Duration::ZERO));
        state.update_rpms(&[(fan_id(0), 900)].into_iter().collect());
        state.apply(eval(50, StdInstant::now()));
        assert_eq!(state.active()[&fan_id(0)].rpm, 900);
        assert_eq!(state.active()[&fan_id(0)].pwm, 50);
    }

    #[test]
    fn test_refresh_schedule() {
        let mut schedule = RefreshSchedule::burst();
        let mut fast = 0;
        loop {
            let (next, delay) = schedule.after_tick();
            schedule = next;
            if delay == RefreshSchedule::BASELINE_INTERVAL {
                break;
            }
            assert_eq!(delay, RefreshSchedule::BURST_INTERVAL);
            fast += 1;
        }
        assert_eq!(fast, RefreshSchedule::BURST_LEN);
        assert_eq!(schedule, RefreshSchedule::Baseline);
        assert_eq!(
            RefreshSchedule::Baseline.after_tick(),
            (RefreshSchedule::Baseline, RefreshSchedule::BASELINE_INTERVAL)
        );
    }

    #[tokio::test]
    async fn test_watch_receives_current_state() {
        let (actor, handle) = Actor::new(ControlState::new(&settings(
            Duration::ZERO,
            Duration::ZERO,
        )));
        let task = tokio::spawn(actor.run());

        handle.update_eval(eval(42, StdInstant::now())).await.unwrap();
        let (id, mut rx) = handle.watch().await.unwrap();

        let payload = rx.recv().await.unwrap();
        let evals: Vec<Evaluation> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(evals.len(), 1);
        assert_eq!(evals[0].pwm, 42);
        assert_eq!(evals[0].label, "CPU");

        handle
            .update_rpms([(fan_id(0), 700)].into_iter().collect())
            .await
            .unwrap();
        let evals: Vec<Evaluation> = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(evals[0].rpm, 700);

        handle.unwatch(id).await.unwrap();
        assert!(rx.recv().await.is_none());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_watcher_is_disconnected() {
        let (actor, handle) = Actor::new(ControlState::new(&settings(
            Duration::ZERO,
            Duration::ZERO,
        )));
        let task = tokio::spawn(actor.run());

        let (_slow, mut slow_rx) = handle.watch().await.unwrap();
        let (_fast, mut fast_rx) = handle.watch().await.unwrap();

        for _ in 0..WATCHER_BUFFER + 5 {
            handle.refresh_watchers().await.unwrap();
            // Keep the fast watcher drained.
            while let Ok(p) = fast_rx.try_recv() {
                assert!(!p.is_empty());
            }
        }
        // Let the actor catch up with the last refresh.
        let (_last, mut last_rx) = handle.watch().await.unwrap();
        last_rx.recv().await.unwrap();

        let mut received = 0;
        while slow_rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, WATCHER_BUFFER);
        assert!(fast_rx.recv().await.is_some());

        drop(handle);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_decisions_through_actor() {
        let (actor, handle) = Actor::new(ControlState::new(&settings(
            Duration::from_secs(5),
            Duration::ZERO,
        )));
        let task = tokio::spawn(actor.run());
        let t0 = StdInstant::now();

        let apply = handle.evaluated(batch(eval(40, t0))).await.unwrap();
        assert_eq!(apply.len(), 1);
        handle.update_eval(apply[0].clone()).await.unwrap();

        let apply = handle
            .evaluated(batch(eval(80, t0 + Duration::from_secs(1))))
            .await
            .unwrap();
        assert!(apply.is_empty());

        drop(handle);
        task.await.unwrap();
    }

    /// Dummy device whose `set_pwm` fails for one fan.
    struct FlakyDevice {
        inner: DummyController,
        broken: FanId,
    }

    impl FanDevice for FlakyDevice {
        fn port(&self) -> &str {
            self.inner.port()
        }

        fn hardware_info(&self) -> openfan::Result<HardwareInfo> {
            Ok(self.inner.hardware_info())
        }

        fn firmware_info(&self) -> openfan::Result<FirmwareInfo> {
            Ok(self.inner.firmware_info())
        }

        fn rpms(&self) -> openfan::Result<BTreeMap<FanId, u16>> {
            Ok(self.inner.rpms())
        }

        fn set_pwm(&self, fan: FanId, percent: u8) -> openfan::Result<u8> {
            if fan == self.broken {
                return Err(openfan::Error::NotFound);
            }
            Ok(self.inner.set_pwm(fan, percent))
        }
    }

    #[tokio::test]
    async fn test_failed_set_pwm_keeps_batch_going() {
        let mut fans = settings(Duration::ZERO, Duration::ZERO);
        let rear = FanSettings {
            id: fan_id(3),
            label: "Rear".to_string(),
            ..fans[0].clone()
        };
        fans.push(rear);
        let (actor, handle) = Actor::new(ControlState::new(&fans));
        let actor_task = tokio::spawn(actor.run());

        let device = Arc::new(FlakyDevice {
            inner: DummyController::new(),
            broken: fan_id(0),
        });
        let (eval_tx, eval_rx) = mpsc::channel(1);
        let (refresh_tx, _refresh_rx) = mpsc::channel(1);
        let evaluator = tokio::spawn(apply_evaluations(
            device.clone(),
            handle.clone(),
            eval_rx,
            refresh_tx,
        ));

        let now = StdInstant::now();
        let rear = Evaluation {
            pwm: 45,
            evaluated_at: now,
            ..Evaluation::idle(fan_id(3), "Rear")
        };
        let mut evals = batch(eval(70, now));
        evals.insert(rear.id, rear);
        eval_tx.send(evals).await.unwrap();
        drop(eval_tx);
        time::timeout(Duration::from_secs(2), evaluator)
            .await
            .unwrap()
            .unwrap();

        // fan1 was refused; fan4 still reached the device.
        assert_eq!(device.inner.rpms()[&fan_id(0)], 0);
        assert_eq!(device.inner.rpms()[&fan_id(3)], 675);

        let (_id, mut rx) = handle.watch().await.unwrap();
        let evals: Vec<Evaluation> = serde_json::from_slice(&rx.recv().await.unwrap()).unwrap();
        let pwms: BTreeMap<FanId, u8> = evals.iter().map(|e| (e.id, e.pwm)).collect();
        assert_eq!(pwms[&fan_id(0)], 70);
        assert_eq!(pwms[&fan_id(3)], 45);

        drop(rx);
        drop(handle);
        actor_task.await.unwrap();
    }

    // -----------------------------------------------------------------------
    // Whole loop
    // -----------------------------------------------------------------------

    struct FixedSource(Mutex<f64>);

    impl TemperatureSource for FixedSource {
        fn temperatures(&self) -> Readings {
            Readings {
                temperatures: vec![Temperature {
                    id: TemperatureId(0),
                    name: "cpu".to_string(),
                    temperature: *self.0.lock().unwrap(),
                    ..Default::default()
                }],
                errors: Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_control_loop_drives_device() {
        let fans = vec![FanSettings {
            id: fan_id(0),
            label: "CPU".to_string(),
            step_up: Duration::ZERO,
            step_down: Duration::ZERO,
            curve_points: vec![
                CurvePoint {
                    pwm: 20,
                    thresholds: [("cpu".to_string(), 40)].into_iter().collect(),
                },
                CurvePoint {
                    pwm: 100,
                    thresholds: [("cpu".to_string(), 80)].into_iter().collect(),
                },
            ],
        }];
        let source = Arc::new(FixedSource(Mutex::new(60.0)));
        let catalog = source.temperatures().temperatures;
        let shaper = CurveShaper::new(&fans, &catalog).unwrap();
        let device = Arc::new(DummyController::new());

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let control = ControlLoop::new(
            fans,
            device.clone(),
            source,
            shaper,
            Duration::from_millis(20),
        );
        let handle = control.launch(token.clone(), &tracker);
        let (_id, mut rx) = handle.watch().await.unwrap();

        let mut seen = None;
        for _ in 0..50 {
            let payload = time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let evals: Vec<Evaluation> = serde_json::from_slice(&payload).unwrap();
            if let Some(e) = evals.iter().find(|e| e.id == fan_id(0) && e.pwm == 60) {
                if e.rpm == 900 {
                    seen = Some(e.clone());
                    break;
                }
            }
        }
        let seen = seen.expect("fan1 never reported 60% / 900 RPM");
        assert_eq!(seen.temperature_name, "cpu");
        assert_eq!(device.rpms()[&fan_id(0)], 900);

        drop(rx);
        drop(handle);
        token.cancel();
        tracker.close();
        time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .unwrap();
    }
}
