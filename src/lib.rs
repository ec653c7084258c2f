//! Bluetooth Low Energy central role on top of a raw HCI transport.
//!
//! The crate speaks the controller-facing protocols itself: GAP scanning, connection
//! management, the ATT/GATT client, the L2CAP signaling channel and legacy SMP pairing.
//! The transport that moves HCI commands and events is supplied by the user through the
//! [`Transport`](hci/trait.Transport.html) trait, decoded controller events are fed back
//! with [`Central::handle_event`](central/struct.Central.html#method.handle_event) or
//! [`Central::run`](central/struct.Central.html#method.run).
//!
//! Every operation is available in two forms. The fire-and-forget form on
//! [`Central`](central/struct.Central.html) validates synchronously and reports the outcome
//! as a [`CentralEvent`](central/enum.CentralEvent.html). The awaitable form on the
//! attribute objects returns a [`Request`](request/struct.Request.html) that resolves with
//! the outcome, honoring timeouts, retries and cancellation.
//!
//! # Example
//!
//! Reads the battery level of the first peripheral advertising the battery service.
//!
//! ```no_run
//! use ble_central::central::*;
//! use ble_central::error::{Error, ErrorKind, Result};
//! use ble_central::hci::{AdapterState, HciEvent, Transport};
//! use ble_central::sync::Receiver;
//! use ble_central::uuid::Uuid;
//!
//! async fn battery_level(transport: impl Transport + 'static, hci: Receiver<HciEvent>)
//!     -> Result<u8>
//! {
//!     let battery = Uuid::from_u16(0x180f);
//!     let level = Uuid::from_u16(0x2a19);
//!
//!     let (central, mut events) = Central::new(transport);
//!     let pump = central.clone();
//!     tokio::spawn(async move { pump.run(hci).await });
//!     central.init();
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             CentralEvent::StateChanged { new_state: AdapterState::PoweredOn } =>
//!                 central.start_scanning(&ScanOptions::default().services(&[battery]))?,
//!             CentralEvent::PeripheralDiscovered { peripheral, .. } => {
//!                 central.stop_scanning()?;
//!                 peripheral.connect().await?;
//!                 let (_, characteristics) =
//!                     peripheral.discover_all_services_and_characteristics().await?;
//!                 if let Some(c) = characteristics.iter().find(|c| c.uuid() == level) {
//!                     let value = c.read().await?;
//!                     return Ok(value.first().copied().unwrap_or(0));
//!                 }
//!             }
//!             _ => {}
//!         }
//!     }
//!     Err(Error::new(ErrorKind::Detached, "central is gone"))
//! }
//! ```
#![deny(non_snake_case)]
#![deny(unused_must_use)]

#[macro_use]
mod macros;

pub mod central;
pub mod error;
pub mod hci;
pub mod request;
pub mod sync;
pub mod uuid;
mod util;

pub use central::{Central, CentralBuilder, CentralEvent};
pub use error::{Error, ErrorKind, Result};
pub use request::{Request, RequestOptions};
