use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::energy::{EnergyAccumulator, EnergyCheckpoint, ENERGY_CHANNELS};
use crate::error::{BridgeError, Result};
use crate::modbus_client::{wait_until_set, ModbusClient};
use crate::poller::poll_once;
use crate::snapshot::Snapshot;
use crate::wallbox::{WallboxControl, WallboxSwitch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Published,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateStatus {
    pub state: PollState,
    pub last_update_success: bool,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            state: PollState::Idle,
            last_update_success: false,
            last_success_at: None,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// Owns everything belonging to one physical device: the Modbus session,
/// the latest snapshot, the energy counters and wallbox control.
///
/// Run one per device; nothing is shared between coordinators.
pub struct Coordinator {
    config: Config,
    client: ModbusClient,
    wallbox: WallboxControl,
    snapshot: watch::Sender<Option<Arc<Snapshot>>>,
    status: watch::Sender<UpdateStatus>,
    // Serializes whole poll cycles; single requests are serialized by the client
    cycle: Mutex<()>,
    accumulators: Mutex<Vec<EnergyAccumulator>>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Builds a coordinator without touching the network. Energy counters are
    /// seeded from `restored`.
    pub fn new(config: Config, restored: &EnergyCheckpoint) -> Self {
        let now = Utc::now();
        let accumulators = ENERGY_CHANNELS
            .iter()
            .map(|channel| EnergyAccumulator::new(*channel, restored.get(channel.key), now))
            .collect();

        Self {
            client: ModbusClient::from_config(&config),
            wallbox: WallboxControl::new(config.wallbox_model, config.wallboxes),
            config,
            snapshot: watch::channel(None).0,
            status: watch::channel(UpdateStatus::default()).0,
            cycle: Mutex::new(()),
            accumulators: Mutex::new(accumulators),
            shutdown: watch::channel(false).0,
        }
    }

    /// Probes the device, then performs the first refresh. Either failing
    /// aborts setup.
    pub async fn setup(config: Config, restored: &EnergyCheckpoint) -> Result<Arc<Self>> {
        ModbusClient::probe(&config).await?;
        let coordinator = Arc::new(Self::new(config, restored));
        if let Err(err) = coordinator.refresh().await {
            coordinator.shutdown().await;
            return Err(err);
        }
        info!(
            "E3/DC at {} ready, polling every {:?}",
            coordinator.config.host, coordinator.config.scan_interval
        );
        Ok(coordinator)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &ModbusClient {
        &self.client
    }

    /// Latest published snapshot, `None` before the first successful cycle.
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.snapshot.subscribe()
    }

    pub fn status(&self) -> UpdateStatus {
        self.status.borrow().clone()
    }

    /// Runs one poll cycle and publishes its snapshot.
    ///
    /// On failure the previous snapshot stays published and the error is
    /// logged once here.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        let _cycle = self.cycle.lock().await;
        self.status.send_modify(|status| status.state = PollState::Polling);

        match poll_once(&self.client).await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                let now = Utc::now();
                for accumulator in self.accumulators.lock().await.iter_mut() {
                    accumulator.integrate(&snapshot, now);
                }
                self.snapshot.send_replace(Some(snapshot.clone()));
                self.status.send_modify(|status| {
                    status.state = PollState::Published;
                    status.last_update_success = true;
                    status.last_success_at = Some(snapshot.taken_at);
                    status.last_error = None;
                    status.consecutive_failures = 0;
                });
                debug!("Published snapshot with {} fields", snapshot.populated());
                Ok(snapshot)
            }
            Err(err) => {
                error!("Update of E3/DC at {} failed: {err}", self.config.host);
                self.status.send_modify(|status| {
                    status.state = if status.last_success_at.is_some() {
                        PollState::Published
                    } else {
                        PollState::Idle
                    };
                    status.last_update_success = false;
                    status.last_error = Some(err.to_string());
                    status.consecutive_failures += 1;
                });
                Err(err)
            }
        }
    }

    /// Polls on the configured interval until `shutdown` is called.
    pub async fn run(self: Arc<Self>) {
        let period = self.config.scan_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = self.shutdown.subscribe();

        info!("Polling {} every {:?}", self.config.host, period);
        loop {
            tokio::select! {
                biased;
                _ = wait_until_set(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if self.refresh().await.is_err() {
                        debug!("Retrying {} in {period:?}", self.config.host);
                    }
                }
            }
        }
        info!("Polling of {} stopped", self.config.host);
    }

    /// Stops the poll loop and closes the Modbus session. Idempotent.
    pub async fn shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("Shutting down coordinator for {}", self.config.host);
        }
        self.client.close().await;
    }

    /// Every wallbox switch consumers may expose for the configured model.
    pub fn switches(&self) -> Vec<WallboxSwitch> {
        self.wallbox.switches()
    }

    /// Device-acknowledged state of a control bit, from the latest snapshot.
    pub fn wallbox_bit(&self, wallbox: u8, bit: u8) -> Option<bool> {
        self.wallbox.check(wallbox, bit).ok()?;
        self.snapshot()?.wallbox_bit(wallbox, bit)
    }

    /// Sets or clears one whitelisted control bit, then refreshes the snapshot
    /// so the new state is what the device reports. Returns whether a write
    /// was issued.
    pub async fn set_wallbox_bit(&self, wallbox: u8, bit: u8, desired: bool) -> Result<bool> {
        let written = self
            .wallbox
            .set_bit(&self.client, wallbox, bit, desired)
            .await?;
        if let Err(err) = self.refresh().await {
            warn!("Refresh after wallbox {wallbox} change failed: {err}");
        }
        Ok(written)
    }

    /// Same as [`Coordinator::set_wallbox_bit`], addressed by switch name.
    pub async fn set_wallbox_switch(&self, wallbox: u8, key: &str, desired: bool) -> Result<bool> {
        let bit = self.wallbox.model().bit_by_name(key).ok_or_else(|| {
            BridgeError::control(
                wallbox,
                format!("no switch `{key}` on a {} wallbox", self.wallbox.model()),
            )
        })?;
        self.set_wallbox_bit(wallbox, bit, desired).await
    }

    /// Rounded kWh per energy channel; `None` means unknown.
    pub async fn energy(&self) -> BTreeMap<&'static str, Option<f64>> {
        self.accumulators
            .lock()
            .await
            .iter()
            .map(|acc| (acc.channel().key, acc.value()))
            .collect()
    }

    /// Current counter values for the caller to persist.
    pub async fn checkpoint(&self) -> EnergyCheckpoint {
        let accumulators = self.accumulators.lock().await;
        EnergyCheckpoint::from_accumulators(accumulators.iter(), Utc::now())
    }
}
