//! Bluetooth communication layer.
//!
//! This module provides the L2CAP control channel transport, AACP session
//! establishment and the LE advertisement scanner.

pub mod l2cap;
pub mod scanner;
pub mod session;
