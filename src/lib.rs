//! Audio ownership handoff for `AirPods` on Linux.
//!
//! The accessory is shared between every controller it is paired with. This
//! crate speaks AACP over the L2CAP control channel, watches the accessory's
//! LE broadcasts and decides when this controller should take the audio route,
//! give it up, or stay away.

pub mod airpods;
pub mod audio;
pub mod bluetooth;
pub mod config;
pub mod controller;
pub mod dbus;
pub mod error;
pub mod event;
