//! # Overview
//!
//! Serialized, awaitable GATT operations on top of a callback-driven
//! Bluetooth LE driver.
//!
//! Platform drivers report the outcome of every request through a callback,
//! and most of them misbehave when a second request is issued before the
//! first one has completed. This crate turns that into plain async calls:
//! every request is an operation on a FIFO queue, and each queue runs one
//! operation at a time.
//!
//! # Getting started
//!
//! Implement [`Transport`](transport::Transport) and
//! [`Link`](transport::Link) for your platform's driver and hand it to a
//! [`Client`]. From there, [`Client::scan_for_devices`] finds [`Device`]s and
//! [`Device::connect`] opens a [`Connection`] with its services discovered.
//!
//! ```ignore
//! let client = Client::new(driver)?;
//! let device = client.get_device("C0:FF:EE:00:00:01")?;
//! let connection = device.connect().await?;
//!
//! let measurement = connection.characteristic(profile::HEART_RATE_MEASUREMENT_UUID)?;
//! let mut beats = connection.subscribe(&measurement).await?.stream();
//! while let Some(value) = beats.next().await {
//!     println!("{:?}", profile::HeartRateMeasurement::parse(&value?)?);
//! }
//! ```
//!
//! # Queues
//!
//! Connecting, disconnecting and scanning share the client's queue. Each
//! [`Connection`] gets a queue of its own for reads, writes, subscriptions
//! and the like, so a slow device never holds up another one.
//!
//! Dropping the future or stream of an operation cancels it. An operation
//! that has not started yet is skipped; one that is running is abandoned and
//! the queue moves on.
//!
//! # Readiness
//!
//! [`Client::observe_readiness`] reports whether Bluetooth can be used at
//! all. The driver should call [`Client::refresh_readiness`] whenever the
//! adapter, location services or permissions change.

pub use address::*;
pub use client::{Client, NotReadyReason, Readiness};
pub use config::ClientConfig;
pub use connection::Connection;
pub use device::Device;
pub use ops::{Notifications, OperationKind};
pub use result::{Error, Result};
pub use session::ConnectionState;
pub use util::*;

pub mod client;
pub mod config;
pub mod gatt;
pub mod ops;
pub mod profile;
pub mod transport;

mod address;
mod connection;
mod connector;
mod device;
mod result;
mod session;
mod util;
