//! The peripheral role of Bluetooth Low Energy: a local GATT server plus an advertiser.
//!
//! A [`PeripheralManager`] publishes [`Service`]s, advertises, answers read and write requests
//! from connected [`Central`]s through a [`PeripheralManagerDelegate`], and pushes characteristic
//! updates to subscribers through a bounded outbound queue.
//!
//! The radio side is abstracted behind the [`Transport`] trait; the layer below reports back to
//! the manager through a [`Link`].
//!
//! See the `examples` directory for more complete usage examples.

pub mod advertisement_data;
mod central;
mod characteristic;
pub mod error;
mod notify_queue;
mod options;
mod peripheral_manager;
mod request;
mod service;
mod state;
mod transport;

pub use central::*;
pub use characteristic::*;
pub use error::{AttError, Error, ErrorKind, Result};
pub use notify_queue::Notification;
pub use options::*;
pub use peripheral_manager::*;
pub use request::*;
pub use service::*;
pub use state::*;
pub use transport::*;

pub use btuuid::BluetoothUuid;
pub use serial_executor as executor;
