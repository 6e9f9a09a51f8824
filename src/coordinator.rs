use crate::dispatcher::{Dispatcher, MeasurementCallback};
use crate::duke_energy::{get_usage_between, UsageApi};
use crate::error::{SubscriptionError, UpdateFailed};
use crate::realtime::{MessageCallback, RealtimeStream};
use crate::types::{RealtimeMessage, UsageMeasurement};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of the most recent poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoordinatorState {
    /// Usage for the current local day, oldest first. Kept across failed polls.
    pub data: Option<Vec<UsageMeasurement>>,
    pub last_update_success: bool,
    pub last_update_attempt: Option<DateTime<Local>>,
    /// Start of the window `data` was fetched for.
    pub window_start: Option<DateTime<Local>>,
}

/// Cancelling a subscription returns it to `Idle`; there is no separate cancelled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeStatus {
    Idle,
    Subscribed,
}

/// Local midnight of the day containing `now`.
///
/// Where a DST change skips midnight, this is the first valid local time of the day.
pub fn start_of_local_day<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let tz = now.timezone();
    let day = now.date_naive();
    let mut wall = day.and_time(NaiveTime::MIN);
    while wall.date() == day {
        if let Some(start) = tz.from_local_datetime(&wall).earliest() {
            return start;
        }
        wall += chrono::Duration::minutes(15);
    }
    now.clone()
}

/// The `[midnight, midnight + 24h)` window around `now`.
pub fn local_day_window<Tz: TimeZone>(now: &DateTime<Tz>) -> (DateTime<Tz>, DateTime<Tz>) {
    let start = start_of_local_day(now);
    let end = start.clone() + chrono::Duration::days(1);
    (start, end)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the polling cadence and the realtime subscription for one gateway.
pub struct UsageCoordinator {
    api: Arc<dyn UsageApi>,
    realtime: Arc<dyn RealtimeStream>,
    state: watch::Sender<CoordinatorState>,
    dispatcher: Arc<Mutex<Dispatcher>>,
    realtime_task: Mutex<Option<JoinHandle<()>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl UsageCoordinator {
    pub fn new(
        api: Arc<dyn UsageApi>,
        realtime: Arc<dyn RealtimeStream>,
        realtime_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::default());
        Self {
            api,
            realtime,
            state,
            dispatcher: Arc::new(Mutex::new(Dispatcher::new(realtime_interval))),
            realtime_task: Mutex::new(None),
            poll_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.borrow().clone()
    }

    /// A receiver that is notified after every poll.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn data(&self) -> Option<Vec<UsageMeasurement>> {
        self.state.borrow().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.state.borrow().last_update_success
    }

    pub async fn refresh(&self) -> Result<(), UpdateFailed> {
        self.refresh_at(Local::now()).await
    }

    /// Fetches the local day's usage as seen at `now`.
    pub async fn refresh_at(&self, now: DateTime<Local>) -> Result<(), UpdateFailed> {
        let (start, end) = local_day_window(&now);
        match get_usage_between(self.api.as_ref(), &start, &end).await {
            Ok(usage) => {
                debug!("Fetched {} usage measurements since {}", usage.len(), start);
                let recovered = {
                    let state = self.state.borrow();
                    state.last_update_attempt.is_some() && !state.last_update_success
                };
                if recovered {
                    info!("Fetching usage data recovered");
                }
                self.state.send_modify(|state| {
                    state.data = Some(usage);
                    state.last_update_success = true;
                    state.last_update_attempt = Some(now);
                    state.window_start = Some(start);
                });
                Ok(())
            }
            Err(source) => {
                let err = UpdateFailed { source };
                if self.last_update_success() {
                    error!("{err}");
                } else {
                    debug!("{err}");
                }
                self.state.send_modify(|state| {
                    state.last_update_success = false;
                    state.last_update_attempt = Some(now);
                });
                Err(err)
            }
        }
    }

    /// Polls every `period` on a background task. The first poll happens one period from now.
    pub fn spawn_polling(self: &Arc<Self>, period: Duration) {
        let mut poll_task = lock(&self.poll_task);
        if poll_task.as_ref().is_some_and(|task| !task.is_finished()) {
            warn!("Usage polling is already running");
            return;
        }

        let coordinator: Weak<Self> = Arc::downgrade(self);
        *poll_task = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                // Failures are recorded in the state and retried next tick
                let _ = coordinator.refresh().await;
            }
        }));
        debug!("Started usage polling every {:?}", period);
    }

    pub fn stop_polling(&self) {
        if let Some(task) = lock(&self.poll_task).take() {
            task.abort();
            debug!("Stopped usage polling");
        }
    }

    pub fn realtime_status(&self) -> RealtimeStatus {
        match lock(&self.realtime_task).as_ref() {
            Some(task) if !task.is_finished() => RealtimeStatus::Subscribed,
            _ => RealtimeStatus::Idle,
        }
    }

    /// Installs the message handler and starts the background subscription task.
    ///
    /// Does nothing if a subscription task is already running.
    pub fn realtime_initialize(&self) -> Result<(), SubscriptionError> {
        let mut task = lock(&self.realtime_task);
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            warn!("Real-time usage subscription already running, ignoring initialize");
            return Ok(());
        }

        let runtime = Handle::try_current().map_err(|e| {
            error!(
                "Failure trying to connect and subscribe to real-time usage: {}",
                e
            );
            SubscriptionError::NoRuntime
        })?;

        self.realtime.set_on_message(self.message_handler());
        let realtime = self.realtime.clone();
        *task = Some(runtime.spawn(async move {
            if let Err(e) = realtime.connect_and_subscribe().await {
                error!("Real-time usage subscription ended: {}", e);
            }
        }));
        debug!("Pushed real-time connect/subscribe to async task");
        Ok(())
    }

    /// Stops the background subscription task. Safe to call at any time.
    pub fn realtime_cancel(&self) {
        if let Some(task) = lock(&self.realtime_task).take() {
            task.abort();
            debug!("Cancelled real-time usage subscription");
        }
    }

    pub fn realtime_subscribe(&self, key: &str, callback: MeasurementCallback) -> bool {
        lock(&self.dispatcher).subscribe(key, callback)
    }

    pub fn realtime_unsubscribe(&self, key: &str) -> bool {
        lock(&self.dispatcher).unsubscribe(key)
    }

    pub fn realtime_unsubscribe_all(&self) {
        lock(&self.dispatcher).unsubscribe_all();
    }

    pub fn realtime_subscriber_count(&self) -> usize {
        lock(&self.dispatcher).len()
    }

    /// Decodes a raw push message and fans it out. Malformed messages are logged and dropped.
    pub fn handle_realtime_message(&self, msg: RealtimeMessage) {
        handle_message(&self.dispatcher, self.realtime.as_ref(), msg);
    }

    fn message_handler(&self) -> MessageCallback {
        let dispatcher = self.dispatcher.clone();
        let realtime: Weak<dyn RealtimeStream> = Arc::downgrade(&self.realtime);
        Arc::new(move |msg| {
            if let Some(realtime) = realtime.upgrade() {
                handle_message(&dispatcher, realtime.as_ref(), msg);
            }
        })
    }

    /// Stops all background work and drops every subscriber.
    pub fn shutdown(&self) {
        self.realtime_cancel();
        self.stop_polling();
        self.realtime_unsubscribe_all();
    }
}

impl Drop for UsageCoordinator {
    fn drop(&mut self) {
        self.realtime_cancel();
        self.stop_polling();
    }
}

fn handle_message(
    dispatcher: &Mutex<Dispatcher>,
    realtime: &dyn RealtimeStream,
    msg: RealtimeMessage,
) {
    let measurement = match realtime.decode(&msg) {
        Ok(measurement) => measurement,
        Err(e) => {
            error!(
                "Error while parsing real-time usage message: {} [Message='{}']",
                e,
                msg.payload_lossy()
            );
            return;
        }
    };

    // Callbacks run without the lock held
    let callbacks = lock(dispatcher).prepare(&measurement, Instant::now());
    for callback in callbacks.unwrap_or_default() {
        callback(&measurement);
    }
}
