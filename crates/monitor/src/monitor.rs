//! Device-change detection loop
//!
//! [`DeviceMonitor`] keeps a snapshot of known devices, listens to
//! `udevadm monitor` for add/remove events and, after each one, re-lists
//! devices from its [`DeviceSource`] and reconciles the listing against the
//! snapshot. Every resulting attach/detach is delivered to each registered
//! callback exactly once.
//!
//! Events are handled sequentially in a single task. If the udev process
//! dies while monitoring is active, the task waits, re-baselines the
//! snapshot from a fresh listing and respawns the process.

use crate::source::DeviceSource;
use crate::tracker::DeviceTracker;
use crate::udevadm::{self, DEFAULT_SUBSYSTEMS, UdevEvent};
use common::{
    CommandRunner, DeviceChangeEvent, DeviceRecord, Error, LineStream, ProcessLine, Result,
};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Callback invoked for every device transition
pub type DeviceChangeCallback<D> = Arc<dyn Fn(&DeviceChangeEvent<D>) + Send + Sync>;

/// Handle returned by [`DeviceMonitor::on_device_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Timing and process settings for the monitor loop
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Pause after a udev event before re-listing devices
    pub settle_delay: Duration,
    /// Pause before respawning a udev monitor that exited
    pub restart_delay: Duration,
    /// Subsystems passed to `udevadm monitor --subsystem-match`
    pub subsystems: Vec<String>,
    /// Run `udevadm` under `stdbuf -oL`
    pub line_buffered: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(100),
            restart_delay: Duration::from_millis(1000),
            subsystems: DEFAULT_SUBSYSTEMS.iter().map(|s| s.to_string()).collect(),
            line_buffered: true,
        }
    }
}

/// Why the event pump returned
enum PumpExit {
    Shutdown,
    Exited(Option<i32>),
}

/// Running monitor task
struct Running {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Shared<S: DeviceSource, R> {
    source: S,
    runner: Arc<R>,
    settings: MonitorSettings,
    callbacks: Mutex<Vec<(CallbackId, DeviceChangeCallback<S::Record>)>>,
    next_callback_id: AtomicU64,
    tracker: Mutex<DeviceTracker<S::Record>>,
    running: Mutex<Option<Running>>,
    monitoring: AtomicBool,
}

/// Owned by every [`DeviceMonitor`] clone; the monitor task only holds
/// [`Shared`], so dropping the last handle can signal it to shut down
struct Handle<S: DeviceSource, R>(Arc<Shared<S, R>>);

impl<S: DeviceSource, R> Deref for Handle<S, R> {
    type Target = Shared<S, R>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: DeviceSource, R> Drop for Handle<S, R> {
    fn drop(&mut self) {
        // No other lock holder can exist without a live handle
        let Ok(mut running) = self.0.running.try_lock() else {
            return;
        };
        if let Some(running) = running.take() {
            debug!("Last monitor handle dropped, stopping monitor task");
            self.0.monitoring.store(false, Ordering::SeqCst);
            let _ = running.shutdown_tx.send(());
        }
    }
}

/// Watches udev and reports devices appearing and disappearing
///
/// Clones share one monitor. Dropping the last clone stops monitoring.
pub struct DeviceMonitor<S: DeviceSource, R> {
    shared: Arc<Handle<S, R>>,
}

impl<S: DeviceSource, R> Clone for DeviceMonitor<S, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: DeviceSource, R: CommandRunner> DeviceMonitor<S, R> {
    /// Create a monitor; fails on anything but Linux
    pub fn new(source: S, runner: Arc<R>, settings: MonitorSettings) -> Result<Self> {
        common::ensure_linux()?;

        Ok(Self {
            shared: Arc::new(Handle(Arc::new(Shared {
                source,
                runner,
                settings,
                callbacks: Mutex::new(Vec::new()),
                next_callback_id: AtomicU64::new(1),
                tracker: Mutex::new(DeviceTracker::new()),
                running: Mutex::new(None),
                monitoring: AtomicBool::new(false),
            }))),
        })
    }

    /// Register a callback; the first registration starts monitoring
    ///
    /// If monitoring cannot be started the callback is unregistered again and
    /// the error is returned. Concurrent registrations wait for that start, so
    /// the next one retries it after a failure.
    pub async fn on_device_change<F>(&self, callback: F) -> Result<CallbackId>
    where
        F: Fn(&DeviceChangeEvent<S::Record>) + Send + Sync + 'static,
    {
        let id = CallbackId(self.shared.next_callback_id.fetch_add(1, Ordering::Relaxed));
        let mut callbacks = self.shared.callbacks.lock().await;
        callbacks.push((id, Arc::new(callback)));

        if callbacks.len() == 1
            && let Err(e) = self.start().await
        {
            error!("Failed to start monitoring: {}", e);
            callbacks.retain(|(cb_id, _)| *cb_id != id);
            return Err(e);
        }

        Ok(id)
    }

    /// Remove a callback; removing the last one stops monitoring
    ///
    /// Returns whether `id` was registered.
    pub async fn remove_device_change_listener(&self, id: CallbackId) -> bool {
        let (removed, now_empty) = {
            let mut callbacks = self.shared.callbacks.lock().await;
            let before = callbacks.len();
            callbacks.retain(|(cb_id, _)| *cb_id != id);
            (callbacks.len() != before, callbacks.is_empty())
        };

        if removed
            && now_empty
            && let Err(e) = self.stop().await
        {
            error!("Failed to stop monitoring: {}", e);
        }

        removed
    }

    pub async fn callback_count(&self) -> usize {
        self.shared.callbacks.lock().await.len()
    }

    pub fn is_monitoring(&self) -> bool {
        self.shared.monitoring.load(Ordering::SeqCst)
    }

    /// Devices currently in the snapshot
    pub async fn known_devices(&self) -> Vec<S::Record> {
        self.shared.tracker.lock().await.devices()
    }

    /// Baseline the snapshot and start following udev events
    ///
    /// Does nothing if already monitoring.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.shared.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        info!("Monitoring devices via {}...", self.shared.source.name());
        let stream = match self.shared.begin().await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.tracker.lock().await.clear();
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(Arc::clone(&self.shared.0).run(stream, shutdown_rx));

        *running = Some(Running { shutdown_tx, task });
        self.shared.monitoring.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop following udev events and forget the snapshot
    ///
    /// Does nothing if not monitoring.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.shared.running.lock().await.take() else {
            return Ok(());
        };

        self.shared.monitoring.store(false, Ordering::SeqCst);
        let _ = running.shutdown_tx.send(());

        let joined = running.task.await;
        self.shared.tracker.lock().await.clear();

        if let Err(e) = joined
            && e.is_panic()
        {
            return Err(Error::Monitor(format!("Monitor task panicked: {}", e)));
        }

        info!("USB device monitoring stopped");
        Ok(())
    }

    /// Stop monitoring and drop every callback
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.stop().await;
        self.shared.callbacks.lock().await.clear();
        result
    }
}

impl<S: DeviceSource, R: CommandRunner> Shared<S, R> {
    /// Baseline the snapshot from a fresh listing and spawn `udevadm monitor`
    async fn begin(&self) -> Result<LineStream> {
        let devices = self.source.list().await?;
        info!("Found {} devices", devices.len());
        self.tracker.lock().await.baseline(devices);

        let (program, args) =
            udevadm::monitor_command(&self.settings.subsystems, self.settings.line_buffered);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.spawn_lines(&program, &args).await
    }

    /// Monitor task: pump events, restarting the udev process when it dies
    async fn run(self: Arc<Self>, mut stream: LineStream, mut shutdown_rx: oneshot::Receiver<()>) {
        loop {
            let code = match self.pump(&mut stream, &mut shutdown_rx).await {
                PumpExit::Shutdown => {
                    stream.kill();
                    return;
                }
                PumpExit::Exited(code) => code,
            };

            error!("Udev monitor closed unexpectedly (exit code {:?})", code);

            stream = loop {
                tokio::select! {
                    _ = &mut shutdown_rx => return,
                    _ = tokio::time::sleep(self.settings.restart_delay) => {}
                }

                self.tracker.lock().await.clear();
                match self.begin().await {
                    Ok(stream) => {
                        info!("Udev monitor restarted");
                        break stream;
                    }
                    Err(e) => error!("Failed to restart monitoring: {}", e),
                }
            };
        }
    }

    /// Handle udev output until shutdown or until the process exits
    async fn pump(
        &self,
        stream: &mut LineStream,
        shutdown_rx: &mut oneshot::Receiver<()>,
    ) -> PumpExit {
        loop {
            let line = tokio::select! {
                _ = &mut *shutdown_rx => return PumpExit::Shutdown,
                line = stream.next() => line,
            };

            let event = match line {
                None => return PumpExit::Exited(None),
                Some(ProcessLine::Exited(code)) => return PumpExit::Exited(code),
                Some(ProcessLine::Stderr(line)) => {
                    warn!("Udev monitor error: {}", line);
                    continue;
                }
                Some(ProcessLine::Stdout(line)) => match udevadm::parse_monitor_line(&line) {
                    Some(event) => event,
                    None => {
                        trace!("Ignoring udev output: {}", line);
                        continue;
                    }
                },
            };
            log_event(&event);

            // Let the system settle before listing
            tokio::select! {
                _ = &mut *shutdown_rx => return PumpExit::Shutdown,
                _ = tokio::time::sleep(self.settings.settle_delay) => {}
            }

            // One listing covers every event that arrived while settling
            let mut exited = None;
            while let Some(line) = stream.try_next() {
                match line {
                    ProcessLine::Stdout(line) => {
                        if let Some(event) = udevadm::parse_monitor_line(&line) {
                            log_event(&event);
                        }
                    }
                    ProcessLine::Stderr(line) => warn!("Udev monitor error: {}", line),
                    ProcessLine::Exited(code) => {
                        exited = Some(code);
                        break;
                    }
                }
            }

            self.refresh().await;

            if let Some(code) = exited {
                return PumpExit::Exited(code);
            }
        }
    }

    /// Re-list devices, reconcile and dispatch the resulting transitions
    async fn refresh(&self) {
        let devices = match self.source.list().await {
            Ok(devices) => devices,
            Err(e) => {
                error!("Error handling device change: {}", e);
                return;
            }
        };

        let events = self.tracker.lock().await.reconcile(devices);
        for event in &events {
            self.notify(event).await;
        }
    }

    /// Invoke every callback with `event`; a panicking callback is logged
    async fn notify(&self, event: &DeviceChangeEvent<S::Record>) {
        info!("Device {}: {}", event.kind, event.device.summary());

        let callbacks: Vec<_> = self
            .callbacks
            .lock()
            .await
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(event)));
            if let Err(panic) = result {
                error!("Error in device change callback: {}", panic_message(panic.as_ref()));
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "callback panicked"
    }
}

fn log_event(event: &UdevEvent) {
    debug!(
        "Udev event: {:?} {} ({})",
        event.action,
        event.devpath,
        event.subsystem.as_deref().unwrap_or("-")
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.settle_delay, Duration::from_millis(100));
        assert_eq!(settings.restart_delay, Duration::from_secs(1));
        assert_eq!(settings.subsystems, vec!["tty", "usb"]);
        assert!(settings.line_buffered);
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom");

        let panic = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "code 7");

        let panic = std::panic::catch_unwind(|| std::panic::panic_any(7u8)).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "callback panicked");
    }

    #[test]
    fn test_callback_ids_distinct() {
        assert_ne!(CallbackId(1), CallbackId(2));
    }
}
