//! Per-wake state machine.
//!
//! ```text
//! ColdStart ──timer wake + credentials──▶ Connect ──▶ Operate ──▶ SleepArm
//!     │                                      │                       ▲
//!     └──────────otherwise──────▶ Provision ─┴───────────────────────┘
//! ```
//!
//! One [`Orchestrator`] lives for exactly one wake cycle. [`Orchestrator::run_cycle`]
//! consumes it and returns a [`CycleReport`] carrying the suspension request;
//! anything the next cycle needs goes through the persistent store.

use crate::config::NodeConfig;
use crate::duty::SensorDutyConfig;
use crate::event::{Event, EventReceiver};
use crate::platform::{Platform, WakeCause};
use crate::provisioning::{ProvisioningLink, ProvisioningSession};
use crate::store::{PersistentStore, Storage};
use crate::telemetry::{
    format_log_line, Publisher, Reading, SensorReader, TelemetryPublisher, WindowReport,
};
use crate::wifi::{ConnectionManager, WifiNotice, WifiRadio, WirelessCredentials};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::timeout;

/// State the provisioning session borrows while it handles a request.
pub struct NodeContext<S: Storage, R: WifiRadio> {
    pub store: PersistentStore<S>,
    pub wifi: ConnectionManager<R>,
}

impl<S: Storage, R: WifiRadio> NodeContext<S, R> {
    pub fn new(store: PersistentStore<S>, wifi: ConnectionManager<R>) -> Self {
        Self { store, wifi }
    }
}

/// Wake cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    ColdStart,
    Provision,
    Connect,
    Operate,
    SleepArm,
}

/// What one wake cycle did, and how long to suspend for.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CycleReport {
    /// States in the order they ran.
    pub visited: Vec<CycleState>,
    /// Connected and addressed before the connect timeout.
    pub online: bool,
    pub window: Option<WindowReport>,
    /// Requested suspension.
    pub sleep_for: Duration,
    /// The wake timer was armed successfully.
    pub timer_armed: bool,
    /// Fatal fault that cut the cycle short.
    pub fault: Option<String>,
}

/// Orchestrates one wake cycle.
pub struct Orchestrator<S, R, L, P, X, Sn>
where
    S: Storage,
    R: WifiRadio,
    L: ProvisioningLink,
    P: Publisher,
    X: Platform,
    Sn: SensorReader,
{
    config: NodeConfig,
    ctx: NodeContext<S, R>,
    session: ProvisioningSession<L>,
    telemetry: TelemetryPublisher<P>,
    platform: X,
    sensor: Sn,
    credentials: Option<WirelessCredentials>,
    duty: SensorDutyConfig,
    duty_dirty: bool,
    readings: Vec<Reading>,
    radio_up: bool,
    report: CycleReport,
}

impl<S, R, L, P, X, Sn> Orchestrator<S, R, L, P, X, Sn>
where
    S: Storage,
    R: WifiRadio,
    L: ProvisioningLink,
    P: Publisher,
    X: Platform,
    Sn: SensorReader,
{
    pub fn new(
        config: NodeConfig,
        ctx: NodeContext<S, R>,
        link: L,
        publisher: P,
        platform: X,
        sensor: Sn,
    ) -> Self {
        let duty = config.default_duty_config();
        let telemetry = TelemetryPublisher::new(publisher, config.send_interval());
        Self {
            config,
            ctx,
            session: ProvisioningSession::new(link),
            telemetry,
            platform,
            sensor,
            credentials: None,
            duty,
            duty_dirty: false,
            readings: Vec::new(),
            radio_up: false,
            report: CycleReport::default(),
        }
    }

    /// Run one wake cycle to SleepArm.
    ///
    /// Events from the radio and link adapters are read from `events`; the
    /// receiver outlives the orchestrator so adapters built once at boot
    /// keep posting into the same channel across cycles.
    pub async fn run_cycle(mut self, events: &mut EventReceiver) -> CycleReport {
        let mut state = CycleState::ColdStart;
        loop {
            info!("Wake cycle: {:?}", state);
            self.report.visited.push(state);
            state = match state {
                CycleState::ColdStart => self.cold_start(),
                CycleState::Provision => self.provision(events).await,
                CycleState::Connect => self.connect(events).await,
                CycleState::Operate => self.operate(events).await,
                CycleState::SleepArm => {
                    self.sleep_arm();
                    break;
                }
            };
        }
        self.report
    }

    fn cold_start(&mut self) -> CycleState {
        let cause = self.platform.wake_cause();
        debug!("Wake cause: {:?}", cause);

        self.credentials = self.ctx.store.load_credentials();
        match self.ctx.store.load_duty_config() {
            Some(duty) => {
                self.duty = duty;
                self.readings = self.ctx.store.load_readings();
            }
            None => {
                // Buffered readings belong to the lost schedule.
                info!("Starting a fresh duty schedule");
                self.duty_dirty = true;
                self.readings.clear();
            }
        }

        match (cause, &self.credentials) {
            (WakeCause::Timer, Some(_)) => CycleState::Connect,
            (WakeCause::Timer, None) => {
                warn!("Timer wake without credentials");
                CycleState::Provision
            }
            (WakeCause::Other, _) => CycleState::Provision,
        }
    }

    async fn provision(&mut self, events: &mut EventReceiver) -> CycleState {
        if let Err(e) = self.session.start() {
            return self.fatal(format!("provisioning link: {}", e));
        }
        if let Some(credentials) = self.credentials.as_ref() {
            if let Err(e) = self.ctx.wifi.configure(credentials) {
                warn!("Saved credentials not applied: {}", e);
            }
        }
        if let Err(e) = self.ctx.wifi.start() {
            self.session.close();
            return self.fatal(format!("radio: {}", e));
        }
        self.radio_up = true;

        while !self.session.is_complete() {
            match events.recv().await {
                Some(event) => {
                    dispatch(&mut self.ctx, &mut self.session, event);
                }
                None => return self.fatal("event channel closed".to_string()),
            }
        }
        self.session.close();
        CycleState::SleepArm
    }

    async fn connect(&mut self, events: &mut EventReceiver) -> CycleState {
        let Some(credentials) = self.credentials.as_ref() else {
            return CycleState::Provision;
        };
        if let Err(e) = self.ctx.wifi.configure(credentials) {
            return self.fatal(format!("radio config: {}", e));
        }
        if let Err(e) = self.ctx.wifi.start() {
            return self.fatal(format!("radio: {}", e));
        }
        self.radio_up = true;
        self.ctx.wifi.connect();

        let limit = self.config.connect_timeout();
        let ctx = &mut self.ctx;
        let session = &mut self.session;
        let waited = timeout(limit, async {
            while !ctx.wifi.is_online() {
                match events.recv().await {
                    Some(event) => {
                        if dispatch(ctx, session, event) == Some(WifiNotice::JoinFailed) {
                            return false;
                        }
                    }
                    None => return false,
                }
            }
            true
        })
        .await;

        match waited {
            Ok(true) => {
                info!("Online");
                self.report.online = true;
            }
            Ok(false) => {
                let status = self.ctx.wifi.status();
                warn!(
                    "Join failed (rssi {:?}, reason {:?}), operating offline",
                    status.last_rssi, status.last_disconnect_reason
                );
            }
            Err(_) => warn!("No connection after {:?}, operating offline", limit),
        }
        CycleState::Operate
    }

    async fn operate(&mut self, events: &mut EventReceiver) -> CycleState {
        if self.duty.register_wake().reading_due {
            let reading = self.sensor.read();
            debug!("Reading: {:?}", reading);
            self.readings.push(reading);
            self.duty.record_reading();
        }
        self.duty_dirty = true;

        let line = format_log_line(&self.platform.device_mac(), &self.readings);
        info!("Telemetry line: {}", line);

        let ctx = &mut self.ctx;
        let session = &mut self.session;
        let window = self
            .telemetry
            .run_window(
                &self.config.telemetry_topic,
                line.as_bytes(),
                self.config.operate_window(),
                || {
                    while let Ok(event) = events.try_recv() {
                        dispatch(ctx, session, event);
                    }
                },
            )
            .await;
        self.report.window = Some(window);

        if self.duty.roll_over_if_complete() {
            info!("Reporting period complete, clearing buffered readings");
            self.readings.clear();
        }
        if let Err(e) = self.ctx.store.save_readings(&self.readings) {
            error!("Buffered readings not saved: {}", e);
        }
        CycleState::SleepArm
    }

    fn sleep_arm(&mut self) {
        if self.duty_dirty {
            match self.ctx.store.save_duty_config(&self.duty) {
                Ok(()) => debug!("Duty config saved: {:?}", self.duty),
                Err(e) => error!("Duty config not saved: {}", e),
            }
        }
        self.session.close();
        if self.radio_up {
            if let Err(e) = self.ctx.wifi.stop() {
                warn!("Radio stop failed: {}", e);
            }
            self.radio_up = false;
        }

        let sleep_for = self.config.wake_interval();
        match self.platform.arm_wake_timer(sleep_for) {
            Ok(()) => self.report.timer_armed = true,
            Err(e) => error!("{}", e),
        }
        self.report.sleep_for = sleep_for;
        info!("Suspending for {:?}", sleep_for);
    }

    fn fatal(&mut self, fault: String) -> CycleState {
        error!("Fatal fault, going to sleep: {}", fault);
        self.report.fault = Some(fault);
        CycleState::SleepArm
    }
}

/// Route one event to its handler.
fn dispatch<S, R, L>(
    ctx: &mut NodeContext<S, R>,
    session: &mut ProvisioningSession<L>,
    event: Event,
) -> Option<WifiNotice>
where
    S: Storage,
    R: WifiRadio,
    L: ProvisioningLink,
{
    match event {
        Event::Radio(event) => {
            let notice = ctx.wifi.handle_event(event)?;
            session.on_wifi_notice(&notice, &ctx.wifi);
            Some(notice)
        }
        Event::Link(event) => {
            session.handle_link_event(event, ctx);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KEY_CREDENTIALS, KEY_DUTY_CONFIG};
    use crate::event::{self, EventSender};
    use crate::platform::HostPlatform;
    use crate::provisioning::{LinkEvent, ProvisioningMessage, SecretBytes};
    use crate::sim::{ChannelLink, LogPublisher, SimulatedRadio};
    use crate::store::MemoryStorage;
    use crate::telemetry::StubSensor;

    type TestNode = Orchestrator<
        MemoryStorage,
        SimulatedRadio,
        ChannelLink,
        LogPublisher,
        HostPlatform,
        StubSensor,
    >;

    fn node(
        flash: &MemoryStorage,
        radio: SimulatedRadio,
        publisher: &LogPublisher,
        wake: WakeCause,
    ) -> TestNode {
        Orchestrator::new(
            NodeConfig::default(),
            NodeContext::new(
                PersistentStore::new(flash.clone()),
                ConnectionManager::new(radio),
            ),
            ChannelLink::new(),
            publisher.clone(),
            HostPlatform::new(wake),
            StubSensor,
        )
    }

    fn provisioned_flash() -> MemoryStorage {
        let flash = MemoryStorage::new();
        PersistentStore::new(flash.clone())
            .save_credentials(&WirelessCredentials::new("Lab", "pass1234").unwrap())
            .unwrap();
        flash
    }

    fn queue_provisioning(tx: &EventSender, frames: &[ProvisioningMessage]) {
        event::post(tx, LinkEvent::Linked);
        event::post(tx, LinkEvent::SecurityEstablished);
        for frame in frames {
            event::post(tx, LinkEvent::Frame(frame.encode()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_wake_with_credentials_skips_provisioning() {
        let flash = provisioned_flash();
        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        let publisher = LogPublisher::default();

        let report = node(&flash, radio, &publisher, WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        assert_eq!(
            report.visited,
            vec![
                CycleState::ColdStart,
                CycleState::Connect,
                CycleState::Operate,
                CycleState::SleepArm
            ]
        );
        assert!(report.online);
        assert!(report.timer_armed);
        assert_eq!(report.sleep_for, Duration::from_secs(20));
        assert_eq!(report.fault, None);
        let window = report.window.unwrap();
        assert_eq!(window.sent, 200);
        assert_eq!(publisher.published_count(), 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_waits_for_credentials() {
        let flash = MemoryStorage::new();
        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx.clone());
        let publisher = LogPublisher::default();
        queue_provisioning(
            &tx,
            &[ProvisioningMessage::SetNetworkName(b"Lab".to_vec())],
        );

        let cycle = node(&flash, radio, &publisher, WakeCause::Timer).run_cycle(&mut rx);
        let outcome = tokio::time::timeout(Duration::from_secs(3600), cycle).await;

        assert!(outcome.is_err());
        assert_eq!(flash.committed("saved_params", KEY_CREDENTIALS), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_device_provisions_then_connects() {
        let flash = MemoryStorage::new();
        let publisher = LogPublisher::default();

        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx.clone()).with_access_point("Lab", "pass1234");
        queue_provisioning(
            &tx,
            &[
                ProvisioningMessage::SetNetworkName(b"Lab".to_vec()),
                ProvisioningMessage::SetSecret(SecretBytes::new("pass1234")),
            ],
        );
        let report = node(&flash, radio, &publisher, WakeCause::Other)
            .run_cycle(&mut rx)
            .await;

        assert_eq!(
            report.visited,
            vec![
                CycleState::ColdStart,
                CycleState::Provision,
                CycleState::SleepArm
            ]
        );
        assert!(report.timer_armed);
        assert_eq!(publisher.published_count(), 0);
        let stored = PersistentStore::new(flash.clone()).load_credentials().unwrap();
        assert_eq!(stored.network_name(), b"Lab");
        assert_eq!(stored.secret(), b"pass1234");

        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        let report = node(&flash, radio, &publisher, WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        assert_eq!(report.visited[1], CycleState::Connect);
        assert!(report.online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_with_credentials_still_provisions() {
        let flash = provisioned_flash();
        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx.clone()).with_access_point("Lab", "pass1234");
        let stats = radio.stats();
        // The peer shows up after the radio has come up.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            queue_provisioning(
                &tx,
                &[
                    ProvisioningMessage::SetNetworkName(b"Lab".to_vec()),
                    ProvisioningMessage::SetSecret(SecretBytes::new("pass1234")),
                ],
            );
        });

        let report = node(&flash, radio, &LogPublisher::default(), WakeCause::Other)
            .run_cycle(&mut rx)
            .await;

        assert_eq!(report.visited[1], CycleState::Provision);
        // Saved credentials were applied, so the station joined on start.
        assert_eq!(stats.starts(), 1);
        assert_eq!(stats.joins(), 1);
        assert_eq!(stats.stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_period_rolls_over() {
        let flash = provisioned_flash();
        let mut duty = SensorDutyConfig::new(4, 1);
        duty.readings_done_this_period = 4;
        PersistentStore::new(flash.clone())
            .save_duty_config(&duty)
            .unwrap();

        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        node(&flash, radio, &LogPublisher::default(), WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        let mut store = PersistentStore::new(flash.clone());
        let saved = store.load_duty_config().unwrap();
        assert_eq!(saved.readings_done_this_period, 0);
        assert!(store.load_readings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readings_accumulate_across_cycles() {
        let flash = provisioned_flash();
        let publisher = LogPublisher::default();
        for _ in 0..2 {
            let (tx, mut rx) = event::channel();
            let radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
            node(&flash, radio, &publisher, WakeCause::Timer)
                .run_cycle(&mut rx)
                .await;
        }

        let mut store = PersistentStore::new(flash.clone());
        assert_eq!(store.load_duty_config().unwrap().readings_done_this_period, 2);
        assert_eq!(store.load_readings().len(), 2);
        let (topic, payload) = publisher.last().unwrap();
        assert_eq!(topic, "sensor/log");
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "02:00:00:00:00:01 2 30 7.0 30 7.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_failure_goes_to_sleep() {
        let flash = provisioned_flash();
        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).failing_start();
        let publisher = LogPublisher::default();

        let report = node(&flash, radio, &publisher, WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        assert_eq!(
            report.visited,
            vec![
                CycleState::ColdStart,
                CycleState::Connect,
                CycleState::SleepArm
            ]
        );
        assert!(report.fault.is_some());
        assert!(report.timer_armed);
        assert_eq!(publisher.published_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_failure_goes_to_sleep() {
        let flash = MemoryStorage::new();
        let (tx, mut rx) = event::channel();
        let link = ChannelLink::new();
        link.fail_start();
        let orchestrator = Orchestrator::new(
            NodeConfig::default(),
            NodeContext::new(
                PersistentStore::new(flash.clone()),
                ConnectionManager::new(SimulatedRadio::new(tx)),
            ),
            link,
            LogPublisher::default(),
            HostPlatform::new(WakeCause::Other),
            StubSensor,
        );

        let report = orchestrator.run_cycle(&mut rx).await;

        assert_eq!(
            report.visited,
            vec![
                CycleState::ColdStart,
                CycleState::Provision,
                CycleState::SleepArm
            ]
        );
        assert!(report.fault.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_network_times_out_then_operates() {
        let flash = provisioned_flash();
        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).unreachable();
        let publisher = LogPublisher::default();

        let started = tokio::time::Instant::now();
        let report = node(&flash, radio, &publisher, WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        assert!(!report.online);
        assert_eq!(report.visited[2], CycleState::Operate);
        assert!(started.elapsed() >= Duration::from_secs(40));
        assert!(report.window.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_secret_gives_up_early() {
        let flash = MemoryStorage::new();
        PersistentStore::new(flash.clone())
            .save_credentials(&WirelessCredentials::new("Lab", "wrongpass").unwrap())
            .unwrap();
        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        let stats = radio.stats();

        let started = tokio::time::Instant::now();
        let report = node(&flash, radio, &LogPublisher::default(), WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        assert!(!report.online);
        assert_eq!(stats.joins(), 3);
        // Only the operate window was spent.
        assert!(started.elapsed() < Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_duty_schedule_is_saved() {
        let flash = MemoryStorage::new();
        let (tx, mut rx) = event::channel();
        let link = ChannelLink::new();
        link.fail_start();
        let orchestrator = Orchestrator::new(
            NodeConfig::default(),
            NodeContext::new(
                PersistentStore::new(flash.clone()),
                ConnectionManager::new(SimulatedRadio::new(tx)),
            ),
            link,
            LogPublisher::default(),
            HostPlatform::new(WakeCause::Other),
            StubSensor,
        );
        orchestrator.run_cycle(&mut rx).await;

        assert!(flash.committed("saved_params", KEY_DUTY_CONFIG).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_duty_schedule_drops_stale_readings() {
        let flash = provisioned_flash();
        let stale = Reading {
            temperature: 99,
            ph: 1.0,
        };
        PersistentStore::new(flash.clone())
            .save_readings(&[stale, stale, stale])
            .unwrap();

        let (tx, mut rx) = event::channel();
        let radio = SimulatedRadio::new(tx).with_access_point("Lab", "pass1234");
        let publisher = LogPublisher::default();
        node(&flash, radio, &publisher, WakeCause::Timer)
            .run_cycle(&mut rx)
            .await;

        let mut store = PersistentStore::new(flash.clone());
        assert_eq!(store.load_duty_config().unwrap().readings_done_this_period, 1);
        assert_eq!(store.load_readings(), vec![Reading { temperature: 30, ph: 7.0 }]);
        let (_, payload) = publisher.last().unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            "02:00:00:00:00:01 1 30 7.0"
        );
    }
}
