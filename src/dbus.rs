use std::str::FromStr;

use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   airpods::protocol::{ControlCommandId, TakeoverReason},
   controller::Controller,
};

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

/// Accepts a command name (`listening_mode`) or its hex identifier (`0x0d`).
fn parse_command_id(id: &str) -> Option<ControlCommandId> {
   if let Ok(id) = ControlCommandId::from_str(id) {
      return Some(id);
   }
   let digits = id.strip_prefix("0x").unwrap_or(id);
   u8::from_str_radix(digits, 16).ok().map(ControlCommandId::from_id)
}

pub struct HandoffService {
   controller: Controller,
}

impl HandoffService {
   pub const fn new(controller: Controller) -> Self {
      Self { controller }
   }
}

#[interface(name = "org.kairpods.handoff")]
impl HandoffService {
   async fn take_over(&self, reason: String) -> zbus::fdo::Result<bool> {
      let reason = TakeoverReason::from_str(&reason).map_err(|_| {
         zbus::fdo::Error::InvalidArgs(format!("Unknown takeover reason: {reason}"))
      })?;
      self.controller.take_over(reason).await.map_err(failed)?;
      Ok(true)
   }

   async fn manual_override(&self) -> zbus::fdo::Result<bool> {
      info!("Manual takeover requested over D-Bus");
      self.controller.manual_override().await.map_err(failed)?;
      Ok(true)
   }

   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let status = self.controller.status().await.map_err(failed)?;
      Ok(status.to_string())
   }

   async fn get_control_command(&self, id: String) -> zbus::fdo::Result<String> {
      let command = parse_command_id(&id)
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Unknown control command: {id}")))?;
      let status = self
         .controller
         .control_command(command)
         .ok_or_else(|| failed(format!("{command} has not been reported")))?;
      Ok(serde_json::json!({
         "id": status.identifier.to_str(),
         "value": hex::encode(&status.value),
         "age_ms": status.last_updated.elapsed().as_millis() as u64,
      })
      .to_string())
   }

   async fn disconnect(&self) -> zbus::fdo::Result<bool> {
      self.controller.disconnect().await.map_err(failed)?;
      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn ownership_gained(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ownership_lost(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ownership_contested(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn moved_to_peer(
      emitter: &SignalEmitter<'_>,
      peer: &str,
      reversed: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn peer_announced(emitter: &SignalEmitter<'_>, peer: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connection_failed(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connected(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn disconnected(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(emitter: &SignalEmitter<'_>, battery: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_state_changed(
      emitter: &SignalEmitter<'_>,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stem_action(emitter: &SignalEmitter<'_>, action: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn control_command_updated(
      emitter: &SignalEmitter<'_>,
      id: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn claim_timed_out(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn claim_skipped(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn send_dropped(emitter: &SignalEmitter<'_>, command: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn lid_changed(emitter: &SignalEmitter<'_>, open: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn accessory_disappeared(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn accessory_status(emitter: &SignalEmitter<'_>, status: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_information(emitter: &SignalEmitter<'_>, info: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn conversation_awareness(
      emitter: &SignalEmitter<'_>,
      level: u8,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn status(&self) -> String {
      self.get_status().await.unwrap_or_default()
   }
}
