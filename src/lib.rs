#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Velodrive 🚴
//!
//! A Rust library for controlling smart indoor-cycling trainers and sensors
//! via Bluetooth Low Energy.
//!
//! Velodrive connects to the four GATT service families that matter on an
//! indoor trainer setup — Heart Rate, Cycling Power, Cycling Speed & Cadence,
//! and the Fitness Machine Service (FTMS) — decodes their binary telemetry,
//! and drives the FTMS control point to hold target power (ERG), simulate
//! grade (SIM), or set a fixed resistance. On top of the device layer it
//! runs structured interval workouts: a wall-clock-accurate session timer
//! with pause/resume and skip, per-second telemetry logging with crash
//! recovery snapshots, and derived statistics over the ride.
//!
//! ## Architecture
//!
//! - [`codec`] — pure decode/encode of the binary GATT frames
//! - [`rates`] — cadence/speed derivation from cumulative revolution counters
//! - [`connection`] — per-device connect/reconnect lifecycle over [`transport`]
//! - [`hrm`] / [`trainer`] — per-sensor session facades with live values
//! - [`session`] — the workout state machine and recovery snapshots
//! - [`stats`] — interval resolution, target power, and ride aggregates
//!
//! Connection state, connect/disconnect events, and normalized telemetry
//! samples are published on an [`events::EventBus`] so consumers observe
//! everything without reaching into the owners' state.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use velodrive::{BleTransport, EventBus, TrainerSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(BleTransport::new().await?);
//!     let bus = EventBus::new();
//!
//!     let trainer = TrainerSession::new(transport, bus.clone());
//!     trainer.connect().await?;
//!
//!     // Hold 200 W once the machine grants control
//!     trainer.set_target_power(200).await;
//!
//!     Ok(())
//! }
//! ```

/// btleplug-backed transport implementation
pub mod ble;
/// Binary telemetry and control-frame codec
pub mod codec;
/// Connection lifecycle manager with auto-reconnect
pub mod connection;
/// Error types and handling
pub mod error;
/// Event bus and lifecycle/telemetry event types
pub mod events;
/// Heart rate monitor session
pub mod hrm;
/// Cadence and speed derivation from revolution counters
pub mod rates;
/// Workout session state machine and recovery snapshots
pub mod session;
/// Derived workout statistics
pub mod stats;
/// Smart trainer session and FTMS control
pub mod trainer;
/// Transport abstraction over the BLE stack
pub mod transport;
/// Workout definitions and the interval tree
pub mod workout;

// Re-export the main types for convenient usage
pub use ble::BleTransport;
pub use connection::{ConnectMode, ConnectionConfig, ConnectionManager, ServiceConfig};
pub use error::{Result, VeloError};
pub use events::{ConnectionState, DeviceSlot, Event, EventBus, SampleKind, TelemetrySample};
pub use hrm::HrmSession;
pub use session::{
    DataPoint, FileSnapshotStore, LiveSample, MemorySnapshotStore, SnapshotStore, WorkoutSession,
};
pub use stats::{PowerAdjustments, ResolvedInterval, SessionStats};
pub use trainer::{ControlState, TrainerMode, TrainerSession};
pub use workout::{Interval, IntervalNode, Workout};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement characteristic (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power service (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement characteristic (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Speed and Cadence service (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement characteristic (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine service (0x1826)
pub const FITNESS_MACHINE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point characteristic (0x2AD9)
pub const FTMS_CONTROL_POINT_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);
