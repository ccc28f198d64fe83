//! An asynchronous wrapper for the `gatt-peripheral` crate.
//!
//! This crate provides `async` functions and streams for publishing services, advertising and
//! serving requests with a [`PeripheralManager`](gatt_peripheral::PeripheralManager).
//!
//! See the `examples` directory for more complete usage examples.

pub mod error;
mod peripheral_manager;
mod util;

pub use gatt_peripheral::{
    AttError, AttRequest, AttributePermissions, Central, Characteristic, CharacteristicId,
    CharacteristicProperties, IncomingWrite, Link, ManagerState, Notification,
    PeripheralManagerOptions, RestoredState, Service, Transport, advertisement_data, executor,
};
pub use peripheral_manager::*;
