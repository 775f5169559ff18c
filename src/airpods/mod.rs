//! AACP protocol and ownership logic.
//!
//! This module contains the transport-independent parts of the service: the
//! wire codec, typed payload parsing, the broadcast decoder, the control
//! command store, the ownership arbitrator and the stem press router.

pub mod arbitrator;
pub mod broadcast;
pub mod codec;
pub mod parser;
pub mod protocol;
pub mod status;
pub mod stem;
