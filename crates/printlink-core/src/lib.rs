//! # PrintLink Core
//!
//! Core types shared by the PrintLink crates.
//! Provides the error taxonomy, the event bus used to fan out printer
//! notifications, the printer data model, and the clock abstraction
//! that drives every protocol timeout.

pub mod clock;
pub mod data;
pub mod error;
pub mod event_bus;
pub mod settings;

pub use clock::{Clock, ManualClock, Stopwatch, SystemClock};

pub use data::{
    job::PrintJobRecord, CommunicationState, DetailedPrintingState, FirmwareInfo, FirmwareType,
    MovementMode, Position, TemperatureState, MAX_EXTRUDERS,
};

pub use error::{ConnectionError, Error, JobError, ProtocolError, Result};

pub use event_bus::{
    AppEvent, EventBus, EventBusConfig, EventBusError, EventCategory, EventFilter, SubscriptionId,
};

pub use settings::SettingsSource;
