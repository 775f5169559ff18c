//! Event handling system for ownership and accessory status updates.
//!
//! This module provides the event type the controller emits for the host to
//! render or act on, and the bus trait used to deliver it.

use std::sync::Arc;

use smol_str::SmolStr;

use crate::airpods::{
   arbitrator::SkipReason,
   broadcast::AccessoryStatus,
   parser::DeviceInformation,
   protocol::{BatteryInfo, ControlCommandId, EarDetectionStatus, StemAction},
   status::CommandValue,
};

/// Events that can be emitted by the handoff service.
#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
pub enum HandoffEvent {
   OwnershipGained,
   OwnershipLost,
   /// A peer won while our claim was still unconfirmed.
   OwnershipContested,
   MovedToPeer {
      peer: SmolStr,
      reversed: bool,
   },
   PeerAnnounced {
      peer: SmolStr,
   },
   ConnectionFailed(SmolStr),
   Connected,
   Disconnected,
   BatteryUpdated(BatteryInfo),
   EarStateChanged(EarDetectionStatus),
   StemAction(StemAction),
   ControlCommandUpdated {
      id: ControlCommandId,
      value: CommandValue,
   },
   ClaimTimedOut,
   ClaimSkipped(SkipReason),
   SendDropped(&'static str),
   LidChanged(bool),
   AccessoryDisappeared,
   AccessoryStatus(AccessoryStatus),
   DeviceInformation(Box<DeviceInformation>),
   ConversationAwareness(u8),
}

impl HandoffEvent {
   pub fn name(&self) -> &'static str {
      self.into()
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: HandoffEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

#[cfg(test)]
pub(crate) mod testing {
   use parking_lot::Mutex;

   use super::*;

   /// Bus recording every event for later inspection.
   #[derive(Default)]
   pub struct RecordingBus(Mutex<Vec<HandoffEvent>>);

   impl RecordingBus {
      pub fn events(&self) -> Vec<HandoffEvent> {
         self.0.lock().clone()
      }
   }

   impl EventBus for RecordingBus {
      fn emit(&self, event: HandoffEvent) {
         self.0.lock().push(event);
      }
   }
}
