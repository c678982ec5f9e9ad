//! The printer connection
//!
//! [`PrinterConnection`] owns the engine state, the open transport and the
//! background workers of one printer. Every operation locks the state, does
//! its work through an [`EngineCtx`] and publishes the resulting events on
//! the [`EventBus`] after the lock is released.
//!
//! Two locks are involved: the engine state and the transport. When both are
//! needed the state lock is taken first. The reader only holds the transport
//! while it reads.

use super::config::ConnectionConfig;
use super::control::StopOutcome;
use super::job::{FileProgramLoader, JobStore, MemoryJobStore, ProgramLoader};
use super::leveling::LevelingTransform;
use super::state::{EngineCtx, EngineState};
use crate::transport::{SerialTransportFactory, Transport, TransportFactory};
use parking_lot::Mutex;
use printlink_core::event_bus::ConnectionEvent;
use printlink_core::{
    AppEvent, Clock, CommunicationState, ConnectionError, DetailedPrintingState, Error, EventBus,
    FirmwareInfo, JobError, Position, PrintJobRecord, Result, SettingsSource, SystemClock,
    TemperatureState,
};
use std::collections::HashMap;
use std::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Slicers note the filament used near the end of a file
const SLICER_TRAILER_BYTES: u64 = 32_000;

const RESET_PULSE: Duration = Duration::from_millis(100);

/// A machine axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Builder for [`PrinterConnection`]
///
/// Every collaborator has a production default: the system clock, serial
/// ports, files on disk and an in-memory job history.
pub struct PrinterConnectionBuilder {
    config: ConnectionConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    transports: Arc<dyn TransportFactory>,
    settings: Arc<dyn SettingsSource>,
    loader: Arc<dyn ProgramLoader>,
    jobs: Arc<dyn JobStore>,
}

impl Default for PrinterConnectionBuilder {
    fn default() -> Self {
        Self {
            config: ConnectionConfig::default(),
            clock: Arc::new(SystemClock::new()),
            bus: Arc::new(EventBus::new()),
            transports: Arc::new(SerialTransportFactory::new()),
            settings: Arc::new(HashMap::<String, String>::new()),
            loader: Arc::new(FileProgramLoader),
            jobs: Arc::new(MemoryJobStore::new()),
        }
    }
}

impl PrinterConnectionBuilder {
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn transports(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    pub fn settings(mut self, settings: Arc<dyn SettingsSource>) -> Self {
        self.settings = settings;
        self
    }

    pub fn program_loader(mut self, loader: Arc<dyn ProgramLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn job_store(mut self, jobs: Arc<dyn JobStore>) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn build(self) -> Arc<PrinterConnection> {
        let state = EngineState::new(Arc::clone(&self.clock), &self.config);
        Arc::new(PrinterConnection {
            config: self.config,
            bus: self.bus,
            transports: self.transports,
            settings: self.settings,
            loader: self.loader,
            jobs: self.jobs,
            inner: Mutex::new(state),
            transport: Mutex::new(None),
            generation: AtomicU64::new(0),
            reader: Mutex::new(None),
            watchdog: Mutex::new(None),
            cancel_connect: AtomicBool::new(false),
        })
    }
}

/// Connection to one printer
pub struct PrinterConnection {
    config: ConnectionConfig,
    bus: Arc<EventBus>,
    transports: Arc<dyn TransportFactory>,
    settings: Arc<dyn SettingsSource>,
    loader: Arc<dyn ProgramLoader>,
    jobs: Arc<dyn JobStore>,
    inner: Mutex<EngineState>,
    transport: Mutex<Option<Box<dyn Transport>>>,
    /// Bumped on every teardown; workers exit when theirs is stale
    generation: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    cancel_connect: AtomicBool,
}

impl fmt::Debug for PrinterConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrinterConnection")
            .field("state", &self.state())
            .field("port", &self.port_name())
            .finish()
    }
}

impl PrinterConnection {
    pub fn builder() -> PrinterConnectionBuilder {
        PrinterConnectionBuilder::default()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn settings(&self) -> &dyn SettingsSource {
        self.settings.as_ref()
    }

    pub fn job_store(&self) -> &dyn JobStore {
        self.jobs.as_ref()
    }

    pub(crate) fn transport_slot(&self) -> &Mutex<Option<Box<dyn Transport>>> {
        &self.transport
    }

    pub(crate) fn reader_slot(&self) -> &Mutex<Option<JoinHandle<()>>> {
        &self.reader
    }

    pub(crate) fn is_current_generation(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Invalidate the running workers; returns the new generation
    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn close_transport(&self) {
        if let Some(mut transport) = self.transport.lock().take() {
            if let Err(e) = transport.close() {
                debug!("Error closing {}: {}", transport.name(), e);
            }
        }
    }

    /// Run `f` on the locked engine, then publish what it emitted
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut EngineCtx<'_>) -> R) -> R {
        let (result, events) = {
            let mut guard = self.inner.lock();
            let mut ctx = EngineCtx {
                st: &mut guard,
                link: self,
            };
            let result = f(&mut ctx);
            (result, std::mem::take(&mut ctx.st.outbox))
        };
        if !events.is_empty() {
            self.bus.publish_all(events);
        }
        result
    }

    fn read<R>(&self, f: impl FnOnce(&EngineState) -> R) -> R {
        f(&self.inner.lock())
    }

    pub fn state(&self) -> CommunicationState {
        self.read(|st| st.state)
    }

    /// Status line for displays
    pub fn status_text(&self) -> String {
        self.read(|st| match st.state {
            CommunicationState::Printing => st.printing_state.describe(
                st.temperatures.target_bed,
                st.temperatures.target_extruder(0),
            ),
            state => state.verbose().to_string(),
        })
    }

    pub fn printing_state(&self) -> DetailedPrintingState {
        self.read(|st| st.printing_state)
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_printing(&self) -> bool {
        self.state().is_printing()
    }

    pub fn is_paused(&self) -> bool {
        self.state().is_paused()
    }

    pub fn print_is_active(&self) -> bool {
        self.state().is_print_active()
    }

    pub fn print_is_finished(&self) -> bool {
        self.read(|st| st.print_is_finished())
    }

    /// Why the last connection failed
    pub fn failure_message(&self) -> String {
        self.read(|st| st.failure_message.clone())
    }

    pub fn port_name(&self) -> Option<String> {
        self.read(|st| st.port_name.clone())
    }

    pub fn baud_rate(&self) -> u32 {
        self.read(|st| st.baud_rate)
    }

    pub fn firmware(&self) -> FirmwareInfo {
        self.read(|st| st.firmware.clone())
    }

    pub fn temperatures(&self) -> TemperatureState {
        self.read(|st| st.temperatures.clone())
    }

    pub fn actual_extruder_temperature(&self, extruder: usize) -> f64 {
        self.read(|st| st.temperatures.actual_extruder(extruder))
    }

    pub fn target_extruder_temperature(&self, extruder: usize) -> f64 {
        self.read(|st| st.temperatures.target_extruder(extruder))
    }

    pub fn actual_bed_temperature(&self) -> f64 {
        self.read(|st| st.temperatures.actual_bed)
    }

    pub fn target_bed_temperature(&self) -> f64 {
        self.read(|st| st.temperatures.target_bed)
    }

    pub fn fan_speed(&self) -> u8 {
        self.read(|st| st.fan_speed)
    }

    pub fn atx_power_on(&self) -> bool {
        self.read(|st| st.atx_power_on)
    }

    /// Position from the last `M114` reply
    pub fn last_reported_position(&self) -> Position {
        self.read(|st| st.last_reported_position)
    }

    /// Where the last sent move is headed
    pub fn current_destination(&self) -> Position {
        self.read(|st| st.motion.destination())
    }

    pub fn current_extruder_destination(&self) -> f64 {
        self.read(|st| st.motion.extruder_destination())
    }

    pub fn current_feed_rate(&self) -> f64 {
        self.read(|st| st.motion.feed_rate())
    }

    pub fn extrusion_ratio(&self) -> f64 {
        self.read(|st| st.motion.extrusion_ratio())
    }

    pub fn feed_rate_ratio(&self) -> f64 {
        self.read(|st| st.motion.feed_rate_ratio())
    }

    pub fn monitor_temperature(&self) -> bool {
        self.read(|st| st.monitor_temperature)
    }

    /// Lines waiting in the out-of-band queue
    pub fn queued_command_count(&self) -> usize {
        self.read(|st| st.queue.len())
    }

    /// Lines in the program, including injected ones
    pub fn total_program_lines(&self) -> usize {
        self.read(|st| st.program.len())
    }

    /// Index of the next program line to send
    pub fn program_cursor(&self) -> usize {
        self.read(|st| st.cursor)
    }

    pub fn print_name(&self) -> Option<String> {
        self.read(|st| st.print_name.clone())
    }

    /// Record of the print in progress
    pub fn active_job(&self) -> Option<PrintJobRecord> {
        self.read(|st| st.active_job.clone())
    }

    pub fn job_history(&self) -> Vec<PrintJobRecord> {
        self.jobs.records()
    }

    pub fn sd_bytes_printed(&self) -> u64 {
        self.read(|st| st.sd_bytes_printed)
    }

    pub fn sd_total_bytes(&self) -> u64 {
        self.read(|st| st.sd_total_bytes)
    }

    pub fn percent_complete(&self) -> f64 {
        self.read(|st| {
            let from_sd = st.state == CommunicationState::PrintingFromSd
                || (st.state.is_paused()
                    && st.pre_pause_state == CommunicationState::PrintingFromSd);
            if from_sd {
                if st.sd_total_bytes > 0 {
                    st.sd_bytes_printed as f64 / st.sd_total_bytes as f64 * 100.0
                } else {
                    0.0
                }
            } else if st.print_is_finished() {
                100.0
            } else {
                st.program.percent_complete(st.cursor)
            }
        })
    }

    /// Estimated seconds left, scaled by the feed-rate ratio
    ///
    /// Holds the last estimate once the cursor runs past the timed lines.
    pub fn seconds_remaining(&self) -> u64 {
        let mut st = self.inner.lock();
        if st.program.is_empty() {
            return 0;
        }
        let ratio = st.motion.feed_rate_ratio();
        if let Some(line) = st.program.get(st.cursor) {
            if line.seconds_to_end > 0.0 && ratio > 0.0 {
                st.last_remaining_seconds = (line.seconds_to_end / ratio) as u64;
            }
        }
        st.last_remaining_seconds
    }

    /// Seconds spent printing, excluding pauses
    pub fn seconds_printed(&self) -> u64 {
        self.read(|st| {
            let counting = st.state.is_printing()
                || st.state.is_paused()
                || st.print_is_finished();
            if counting {
                st.print_clock.elapsed().as_secs()
            } else {
                0
            }
        })
    }

    /// Open `port` and start the handshake
    ///
    /// Returns once the reader is running; the outcome of the handshake is
    /// announced with `ConnectionSucceeded` or `ConnectionFailed`.
    pub async fn connect(self: &Arc<Self>, port: &str, baud_rate: u32) -> Result<()> {
        self.with_state(|ctx| -> Result<()> {
            let state = ctx.st.state;
            if state.is_connected() || state == CommunicationState::AttemptingToConnect {
                return Err(ConnectionError::AlreadyConnected.into());
            }
            ctx.st.firmware = FirmwareInfo::default();
            ctx.st.queue.clear();
            ctx.st.failure_message = "Unknown Reason".to_string();
            ctx.st.port_name = Some(port.to_string());
            ctx.st.baud_rate = baud_rate;
            Ok(())
        })?;
        self.cancel_connect.store(false, Ordering::SeqCst);

        info!("Connecting to {} at {} baud", port, baud_rate);
        if let Err(e) = self.open_transport(port, baud_rate) {
            self.with_state(|ctx| {
                ctx.fail_connection(e.to_string(), CommunicationState::FailedToConnect)
            });
            return Err(e);
        }

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        let generation = self.with_state(|ctx| {
            ctx.set_state(CommunicationState::AttemptingToConnect);
            ctx.link.bump_generation()
        });
        self.spawn_reader(generation);
        self.with_state(|ctx| {
            ctx.send_line_now("M105");
            ctx.send_line_now("M115");
        });
        self.spawn_watchdog(generation);
        Ok(())
    }

    fn open_transport(&self, port: &str, baud_rate: u32) -> Result<()> {
        if !self.transports.is_port_available(port) {
            return Err(ConnectionError::port_not_found(port).into());
        }
        if self.transports.is_port_in_use(port) {
            return Err(ConnectionError::port_in_use(port).into());
        }
        let transport = self.transports.open(port, baud_rate)?;
        *self.transport.lock() = Some(transport);
        Ok(())
    }

    /// Watch the handshake: announce success, or tear down on cancel
    fn spawn_watchdog(self: &Arc<Self>, generation: u64) {
        let link = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(link.config.watchdog_interval);
            loop {
                ticker.tick().await;
                if !link.is_current_generation(generation) {
                    break;
                }
                let state = link.state();
                if state == CommunicationState::AttemptingToConnect {
                    if link.cancel_connect.load(Ordering::SeqCst) {
                        link.shutdown_transport(CommunicationState::Disconnected).await;
                        link.with_state(|ctx| {
                            ctx.fail_connection(
                                ConnectionError::Cancelled.to_string(),
                                CommunicationState::FailedToConnect,
                            )
                        });
                        break;
                    }
                    continue;
                }

                if state.is_connected() && state != CommunicationState::Disconnecting {
                    let port = link.port_name().unwrap_or_default();
                    info!("Connected to {}", port);
                    link.bus.publish_all([AppEvent::Connection(
                        ConnectionEvent::ConnectionSucceeded { port },
                    )]);
                }
                break;
            }
        });
        if let Some(previous) = self.watchdog.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Abandon a handshake in progress
    pub fn cancel_connect(&self) {
        self.cancel_connect.store(true, Ordering::SeqCst);
    }

    /// Stop the reader and close the port, ending in `final_state`
    pub(crate) async fn shutdown_transport(&self, final_state: CommunicationState) {
        self.with_state(|ctx| {
            ctx.close_active_job(false);
            ctx.set_state(CommunicationState::Disconnecting);
            ctx.link.bump_generation();
        });

        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            if tokio::time::timeout(self.config.join_timeout, reader)
                .await
                .is_err()
            {
                warn!("Reader did not stop within {:?}", self.config.join_timeout);
            }
        }

        self.with_state(|ctx| {
            ctx.link.close_transport();
            ctx.set_state(final_state);
        });
    }

    /// Make the printer safe and disconnect
    pub async fn disable(&self) {
        let connected = self.with_state(|ctx| {
            let connected = ctx.st.state.is_connected();
            if connected {
                ctx.st.force_immediate_writes = true;
                ctx.release_motors();
                ctx.turn_off_bed_and_extruders();
                ctx.set_fan_speed(0);
                ctx.st.force_immediate_writes = false;
            } else {
                ctx.turn_off_bed_and_extruders();
                ctx.set_fan_speed(0);
            }
            connected
        });

        if connected {
            self.shutdown_transport(CommunicationState::Disconnected).await;
            self.with_state(|ctx| ctx.st.queue.clear());
        }
    }

    /// Tear down a handshake that will not complete
    pub async fn abort_connection_attempt(&self, reason: &str) {
        self.shutdown_transport(CommunicationState::Disconnected).await;
        self.with_state(|ctx| {
            ctx.fail_connection(reason.to_string(), CommunicationState::Disconnected)
        });
    }

    /// Reset the controller board by pulsing DTR/RTS
    pub async fn reboot_board(&self) -> Result<()> {
        if self.transport.lock().is_some() {
            self.stop().await;
            if self.transport.lock().is_some() {
                self.with_state(|ctx| ctx.clear_queued_gcode());
                self.pulse_reset_lines().await?;
                self.with_state(|ctx| ctx.set_state(CommunicationState::Connected));
            }
            return Ok(());
        }

        let (port, baud_rate) = self.read(|st| (st.port_name.clone(), st.baud_rate));
        let port = port.ok_or(ConnectionError::NotConnected)?;
        let transport = self.transports.open(&port, baud_rate)?;
        *self.transport.lock() = Some(transport);
        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }
        let pulsed = self.pulse_reset_lines().await;
        self.close_transport();
        self.with_state(|ctx| ctx.set_state(CommunicationState::Disconnected));
        pulsed
    }

    async fn pulse_reset_lines(&self) -> Result<()> {
        for (level, hold) in [(true, Some(RESET_PULSE)), (false, Some(RESET_PULSE)), (true, None)] {
            {
                let mut transport = self.transport.lock();
                if let Some(transport) = transport.as_mut() {
                    transport.set_rts(level)?;
                    transport.set_dtr(level)?;
                }
            }
            if let Some(hold) = hold {
                tokio::time::sleep(hold).await;
            }
        }
        Ok(())
    }

    /// Send G-code as soon as the protocol allows. `\n` separates lines.
    pub fn send_line_now(&self, gcode: &str) {
        self.with_state(|ctx| ctx.send_line_now(gcode));
    }

    pub fn send_lines_now<S: AsRef<str>>(&self, lines: &[S]) {
        self.with_state(|ctx| ctx.send_lines_now(lines));
    }

    pub fn set_target_extruder_temperature(&self, extruder: usize, celsius: f64) {
        self.with_state(|ctx| ctx.set_target_extruder_temperature(extruder, celsius));
    }

    pub fn set_target_bed_temperature(&self, celsius: f64) {
        self.with_state(|ctx| ctx.set_target_bed_temperature(celsius));
    }

    pub fn set_fan_speed(&self, speed: u8) {
        self.with_state(|ctx| ctx.set_fan_speed(speed));
    }

    pub fn turn_off_bed_and_extruders(&self) {
        self.with_state(|ctx| ctx.turn_off_bed_and_extruders());
    }

    pub fn release_motors(&self) {
        self.with_state(|ctx| ctx.release_motors());
    }

    pub fn set_extrusion_ratio(&self, ratio: f64) {
        self.with_state(|ctx| ctx.st.motion.set_extrusion_ratio(ratio));
    }

    pub fn set_feed_rate_ratio(&self, ratio: f64) {
        self.with_state(|ctx| ctx.st.motion.set_feed_rate_ratio(ratio));
    }

    pub fn set_monitor_temperature(&self, monitor: bool) {
        self.with_state(|ctx| ctx.st.monitor_temperature = monitor);
    }

    /// Install or remove the leveling transform
    pub fn set_leveling(&self, leveling: Option<Arc<dyn LevelingTransform>>) {
        self.with_state(|ctx| {
            if let Some(leveling) = &leveling {
                info!("Bed leveling enabled: {}", leveling.name());
            }
            ctx.st.leveling = leveling;
        });
    }

    pub fn read_position(&self) {
        self.send_line_now("M114");
    }

    /// Home the given axes, or all of them when `axes` is empty
    pub fn home_axis(&self, axes: &[Axis]) {
        let mut command = String::from("G28");
        for axis in axes {
            command.push_str(&format!(" {}0", axis));
        }
        self.send_lines_now(&[command.as_str(), "M114"]);
    }

    pub fn move_absolute(&self, axis: Axis, position: f64, feed_rate: f64) {
        use crate::protocol::parse::format_number;
        self.send_lines_now(&[
            "G90".to_string(),
            format!("G1 F{}", format_number(feed_rate)),
            format!("G1 {}{}", axis, format_number(position)),
        ]);
    }

    pub fn move_relative(&self, axis: Axis, distance: f64, feed_rate: f64) {
        use crate::protocol::parse::format_number;
        if distance == 0.0 {
            return;
        }
        self.send_lines_now(&[
            "G91".to_string(),
            format!("G1 F{}", format_number(feed_rate)),
            format!("G1 {}{}", axis, format_number(distance)),
            "G90".to_string(),
        ]);
    }

    /// Extrude or retract on one extruder
    pub fn move_extruder_relative(&self, distance: f64, feed_rate: f64, extruder: usize) {
        use crate::protocol::parse::format_number;
        if distance == 0.0 {
            return;
        }
        let mut lines = vec!["G91".to_string()];
        if extruder > 0 {
            lines.push(format!("T{}", extruder));
        }
        lines.push(format!("G1 F{}", format_number(feed_rate)));
        lines.push(format!("G1 E{}", format_number(distance)));
        if extruder > 0 {
            lines.push("T0".to_string());
        }
        lines.push("G90".to_string());
        self.send_lines_now(&lines);
    }

    /// Splice G-code into the program at `index`; returns the index after it
    pub fn inject_gcode(&self, gcode: &str, index: usize) -> usize {
        self.with_state(|ctx| ctx.inject_gcode(gcode, index))
    }

    /// Periodic housekeeping; driven by the session ticker
    pub fn on_idle(self: &Arc<Self>) {
        self.with_state(|ctx| ctx.on_idle());
        self.ensure_reader();
    }

    /// Restart the reader if it stopped while the link is still up
    fn ensure_reader(self: &Arc<Self>) {
        let state = self.state();
        if !state.is_connected() || state == CommunicationState::Disconnecting {
            return;
        }
        let stopped = self
            .reader
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        if stopped {
            warn!("Reader stopped while connected, restarting it");
            self.spawn_reader(self.generation.load(Ordering::SeqCst));
        }
    }

    /// Load the program at `path` and stream it
    ///
    /// The print is named after the file unless `name` is given.
    pub async fn start_print(&self, path: impl AsRef<Path>, name: Option<String>) -> Result<()> {
        let path = path.as_ref();
        self.with_state(|ctx| -> Result<()> {
            let state = ctx.st.state;
            if !state.is_connected()
                || state.is_print_active()
                || state == CommunicationState::Disconnecting
            {
                return Err(JobError::NotReady {
                    state: state.verbose().to_string(),
                }
                .into());
            }
            ctx.st.print_canceled = false;
            ctx.st.motion.set_extrusion_ratio(1.0);
            ctx.st.motion.set_feed_rate_ratio(1.0);
            ctx.st.position_wait.stop();
            ctx.st.position_wait.reset();
            ctx.st.queue.clear();
            ctx.clear_queued_gcode();
            ctx.set_state(CommunicationState::PreparingToPrint);
            Ok(())
        })?;

        let loaded = self.loader.load(path).await;

        self.with_state(|ctx| -> Result<()> {
            if ctx.st.state != CommunicationState::PreparingToPrint {
                debug!("Print of {} abandoned while loading", path.display());
                return Ok(());
            }
            match loaded {
                Ok(program) => {
                    let name = name.unwrap_or_else(|| {
                        path.file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| path.display().to_string())
                    });
                    info!("Starting print {} ({} lines)", name, program.len());
                    ctx.st.program = program;
                    ctx.st.cursor = 0;
                    ctx.st.print_name = Some(name.clone());

                    let job = PrintJobRecord::start(name.clone(), Some(path.display().to_string()));
                    ctx.commit_job(&job);
                    ctx.st.active_job = Some(job);
                    ctx.emit(AppEvent::Job(printlink_core::event_bus::JobEvent::PrintStarted {
                        name,
                    }));
                    ctx.set_state(CommunicationState::Printing);
                    Ok(())
                }
                Err(e) => {
                    warn!("{}", e);
                    ctx.set_state(CommunicationState::Connected);
                    Err(e.into())
                }
            }
        })
    }

    /// Print a file from the printer's SD card
    pub fn start_sd_print(&self, file: &str) -> Result<()> {
        let file = file.to_lowercase();
        self.with_state(|ctx| ctx.start_sd_print(&file))
            .map_err(Error::from)
    }

    /// Hand a sliced file to firmware that can print it by URI, otherwise
    /// stream it from the host
    pub async fn sd_print_if_supported(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let supported = self.read(|st| st.firmware.uri_gcode_send);
        if supported && ends_with_slicer_trailer(path).await {
            let uri = path.display().to_string();
            info!("Printing {} from firmware storage", uri);
            return self
                .with_state(|ctx| ctx.start_sd_print(&uri))
                .map_err(Error::from);
        }
        self.start_print(path, None).await
    }

    pub fn delete_file_from_sd_card(&self, file: &str) {
        self.with_state(|ctx| ctx.delete_file_from_sd_card(file));
    }

    /// Pause at the current line
    pub fn request_pause(&self) {
        self.with_state(|ctx| ctx.request_pause(None));
    }

    pub fn resume(&self) {
        self.with_state(|ctx| ctx.resume());
    }

    /// Cancel the print, or abandon a handshake in progress
    pub async fn stop(&self) {
        if self.with_state(|ctx| ctx.stop_print()) == StopOutcome::AbandonConnect {
            self.shutdown_transport(CommunicationState::Disconnected).await;
        }
    }

    pub fn reset_to_ready_state(&self) -> Result<()> {
        self.with_state(|ctx| ctx.reset_to_ready_state())
            .map_err(Error::from)
    }

    /// Invalidate the workers and close the port without waiting for them
    ///
    /// Used where awaiting is impossible, such as a session being dropped.
    /// The reader exits at its next generation check.
    pub(crate) fn release(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        self.with_state(|ctx| {
            ctx.link.bump_generation();
            let open = ctx.link.transport_slot().lock().is_some();
            if open {
                ctx.close_active_job(false);
                ctx.link.close_transport();
                ctx.set_state(CommunicationState::Disconnected);
            }
        });
    }

    /// Stop the background workers without touching the printer
    pub(crate) async fn shutdown(&self) {
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }
        if self.transport.lock().is_some() {
            self.shutdown_transport(CommunicationState::Disconnected).await;
        }
    }
}

async fn ends_with_slicer_trailer(path: &Path) -> bool {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return false;
    };
    let len = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(_) => return false,
    };
    let start = len.saturating_sub(SLICER_TRAILER_BYTES);
    if file.seek(SeekFrom::Start(start)).await.is_err() {
        return false;
    }
    let mut tail = Vec::new();
    if file.read_to_end(&mut tail).await.is_err() {
        return false;
    }
    String::from_utf8_lossy(&tail).contains("filament used")
}

impl EngineCtx<'_> {
    /// Tear the session down from inside the lock
    ///
    /// Used by the reader and writer, which cannot wait for themselves to
    /// exit: the generation is bumped and the transport closed, and the
    /// workers notice at their next check.
    pub fn abort_locked(&mut self, reason: String, lost: bool) {
        self.close_active_job(false);
        self.set_state(CommunicationState::Disconnecting);
        self.link.bump_generation();
        self.link.close_transport();
        let final_state = if lost {
            CommunicationState::ConnectionLost
        } else {
            CommunicationState::Disconnected
        };
        self.fail_connection(reason, final_state);
    }
}
