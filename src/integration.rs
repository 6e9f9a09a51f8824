use crate::config::{GatewayConfig, GatewayOptions};
use crate::coordinator::{UsageCoordinator, SCAN_INTERVAL};
use crate::duke_energy::{DukeEnergyClient, UsageApi};
use crate::entity::{ISSUE_URL, NAME};
use crate::error::SetupError;
use crate::realtime::{DukeEnergyRealtime, RealtimeStream};
use crate::sensor::{RealtimeUsageSensor, SensorState, UsageSensor};
use crate::types::{GatewayStatus, MeterInfo};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

static STARTUP: Once = Once::new();

fn log_startup_banner() {
    STARTUP.call_once(|| {
        info!(
            "{} {} starting. Report issues at {}",
            NAME,
            env!("CARGO_PKG_VERSION"),
            ISSUE_URL
        );
    });
}

/// Finds the first certified smart electric meter that has a gateway.
///
/// Failures while checking an account or a meter skip to the next one.
pub async fn discover_gateway(api: &dyn UsageApi) -> Option<(MeterInfo, GatewayStatus)> {
    let accounts = match api.get_account_list().await {
        Ok(accounts) => accounts,
        Err(e) => {
            debug!("Failed to list accounts: {e}");
            return None;
        }
    };

    for account in accounts {
        debug!("Checking account {} for gateway", account.src_acct_id);
        let details = match api.get_account_details(&account).await {
            Ok(details) => details,
            Err(e) => {
                debug!(
                    "Failed to find meter on account {}: {e}",
                    account.src_acct_id
                );
                continue;
            }
        };

        for meter in details.meter_infos {
            if !meter.is_gateway_candidate() {
                continue;
            }
            debug!("Checking meter {} for gateway", meter.serial_num);
            api.select_meter(&meter);
            match api.get_gateway_status().await {
                Ok(Some(gateway)) => {
                    debug!("Found meter {} with gateway {}", meter.serial_num, gateway.id);
                    return Some((meter, gateway));
                }
                Ok(None) => debug!("Meter {} has no gateway", meter.serial_num),
                Err(e) => debug!("Failed to get gateway for meter {}: {e}", meter.serial_num),
            }
        }
    }

    None
}

/// One configured account: the selected meter/gateway, its coordinator and its sensors.
pub struct Integration {
    coordinator: Arc<UsageCoordinator>,
    meter: MeterInfo,
    gateway: GatewayStatus,
    options: GatewayOptions,
    usage_sensor: Arc<UsageSensor>,
    realtime_sensor: Arc<RealtimeUsageSensor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Integration {
    pub async fn setup(config: &GatewayConfig) -> Result<Self, SetupError> {
        log_startup_banner();

        let client = Arc::new(
            DukeEnergyClient::new(
                &config.api_url,
                &config.credentials.email,
                &config.credentials.password,
            )
            .map_err(SetupError::Client)?,
        );
        debug!("Setup Duke Energy API client");

        let realtime_api: Arc<dyn UsageApi> = client.clone();
        Self::setup_with(
            client,
            move |gateway| Arc::new(DukeEnergyRealtime::new(realtime_api, &gateway.id)),
            config.options.clone(),
        )
        .await
    }

    /// Sets up against any API facade. `realtime` builds the push stream for the found gateway.
    pub async fn setup_with<F>(
        api: Arc<dyn UsageApi>,
        realtime: F,
        options: GatewayOptions,
    ) -> Result<Self, SetupError>
    where
        F: FnOnce(&GatewayStatus) -> Arc<dyn RealtimeStream>,
    {
        let Some((meter, gateway)) = discover_gateway(api.as_ref()).await else {
            error!("Could not identify a smart meter on your account with gateway access.");
            return Err(SetupError::NoGateway);
        };
        info!(
            "Using meter {} with gateway {}",
            meter.serial_num, gateway.id
        );

        let stream = realtime(&gateway);
        let coordinator = Arc::new(UsageCoordinator::new(
            api,
            stream,
            options.realtime_interval,
        ));
        coordinator.refresh().await.map_err(|e| {
            warn!("Initial usage refresh failed, integration not ready");
            SetupError::NotReady(e)
        })?;

        Ok(Self {
            usage_sensor: Arc::new(UsageSensor::new(&meter, &gateway)),
            realtime_sensor: Arc::new(RealtimeUsageSensor::new(&meter, &gateway)),
            coordinator,
            meter,
            gateway,
            options,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn coordinator(&self) -> &Arc<UsageCoordinator> {
        &self.coordinator
    }

    pub fn meter(&self) -> &MeterInfo {
        &self.meter
    }

    pub fn gateway(&self) -> &GatewayStatus {
        &self.gateway
    }

    /// Current state of every sensor.
    pub fn sensor_states(&self) -> Vec<SensorState> {
        let mut states = vec![self.usage_sensor.state(&self.coordinator.state())];
        if self.options.realtime_enabled {
            states.push(self.realtime_sensor.state());
        }
        states
    }

    pub fn start(&self, sink: Sender<SensorState>) -> Result<(), SetupError> {
        self.start_with_interval(sink, SCAN_INTERVAL)
    }

    /// Starts polling every `scan_interval` and, if enabled, the realtime sensor.
    /// Every sensor update is sent to `sink`.
    pub fn start_with_interval(
        &self,
        sink: Sender<SensorState>,
        scan_interval: Duration,
    ) -> Result<(), SetupError> {
        self.coordinator.spawn_polling(scan_interval);

        let mut rx = self.coordinator.subscribe_state();
        let usage_sensor = self.usage_sensor.clone();
        let poll_sink = sink.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let state = usage_sensor.state(&rx.borrow_and_update());
                if poll_sink.send(state).await.is_err() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(forwarder);

        if self.options.realtime_enabled {
            self.realtime_sensor
                .attach(&self.coordinator, move |state| {
                    match sink.try_send(state) {
                        Ok(()) => {}
                        Err(TrySendError::Full(state)) => {
                            debug!("Dropping realtime update for {}, sink is full", state.entity_id)
                        }
                        Err(TrySendError::Closed(_)) => {}
                    }
                })?;
        } else {
            debug!("Realtime usage disabled by options");
        }
        Ok(())
    }

    /// Detaches the sensors and stops all background work.
    pub fn unload(&self) -> bool {
        self.realtime_sensor.detach(&self.coordinator);
        self.coordinator.shutdown();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
        info!("Unloaded gateway {}", self.gateway.id);
        true
    }

    pub async fn reload(self, config: &GatewayConfig) -> Result<Self, SetupError> {
        self.unload();
        Self::setup(config).await
    }
}

impl Drop for Integration {
    fn drop(&mut self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}
