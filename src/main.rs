//! `AirPods` audio handoff daemon
//!
//! This service arbitrates ownership of the accessory's audio route with the
//! other controllers it is paired to, and exposes the arbitration over D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use kairpods_handoff::{
   airpods::{parser, protocol::ControlCommandId},
   audio::BluerAudioRoute,
   bluetooth::scanner,
   config::Config,
   controller::{Controller, ControllerConfig, L2CapConnector},
   dbus::{HandoffService, HandoffServiceSignals},
   error::{HandoffError, Result},
   event::{EventBus, HandoffEvent},
};

const BUS_NAME: &str = "org.kairpods.handoff";
const OBJECT_PATH: &str = "/org/kairpods/handoff";

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting kAirPods handoff service...");

   // Load configuration
   let config = Config::load()?;

   let session = bluer::Session::new().await?;
   let adapter = session.default_adapter().await?;

   let accessory = match config.device_address()? {
      Some(addr) => addr,
      None => scanner::find_paired_accessory(&adapter)
         .await?
         .ok_or(HandoffError::NoAccessoryConfigured)?,
   };
   let self_mac = match config.self_address()? {
      Some(addr) => addr,
      None => adapter.address().await?,
   };
   info!("Arbitrating {accessory} as {self_mac}");

   // Create event channel
   let event_bus = EventProcessor::new();

   let controller = Controller::spawn(
      ControllerConfig {
         accessory,
         arbitrator: config.arbitrator(self_mac),
         stem: config.stem,
      },
      Arc::new(L2CapConnector::new(accessory)),
      Arc::new(BluerAudioRoute::new(session.clone(), accessory)),
      event_bus.clone(),
   );
   controller
      .store()
      .subscribe(ControlCommandId::LISTENING_MODE, |status| {
         match parser::parse_noise_mode(&status.value) {
            Ok(mode) => info!("Listening mode changed to {mode}"),
            Err(e) => warn!("Unrecognized listening mode: {e}"),
         }
      });

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, HandoffService::new(controller.clone()))?
      .build()
      .await?;

   info!("kAirPods handoff service started at {BUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection).await?;

   let scan = tokio::spawn(scanner::run(
      adapter,
      controller.status_cell().clone(),
      controller.clone(),
      config.disappear_timeout(),
   ));

   // Wait for shutdown signal
   tokio::select! {
      res = signal::ctrl_c() => res?,
      res = scan => match res {
         Ok(Ok(())) => warn!("Scanner stopped"),
         Ok(Err(e)) => error!("Scanner failed: {e}"),
         Err(e) => error!("Scanner task failed: {e}"),
      },
   }
   info!("Shutting down kAirPods handoff service...");

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<HandoffEvent>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<HandoffEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<HandoffService>,
      event: HandoffEvent,
   ) -> Result<()> {
      match event {
         HandoffEvent::OwnershipGained => iface.ownership_gained().await?,
         HandoffEvent::OwnershipLost => iface.ownership_lost().await?,
         HandoffEvent::OwnershipContested => iface.ownership_contested().await?,
         HandoffEvent::MovedToPeer { peer, reversed } => {
            iface.moved_to_peer(&peer, reversed).await?;
         },
         HandoffEvent::PeerAnnounced { peer } => iface.peer_announced(&peer).await?,
         HandoffEvent::ConnectionFailed(reason) => iface.connection_failed(&reason).await?,
         HandoffEvent::Connected => iface.connected().await?,
         HandoffEvent::Disconnected => iface.disconnected().await?,
         HandoffEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(&battery.to_json().to_string())
               .await?;
         },
         HandoffEvent::EarStateChanged(ear) => {
            iface
               .ear_state_changed(&ear.to_json().to_string())
               .await?;
         },
         HandoffEvent::StemAction(action) => iface.stem_action(action.into()).await?,
         HandoffEvent::ControlCommandUpdated { id, value } => {
            iface
               .control_command_updated(id.to_str(), &hex::encode(&value))
               .await?;
         },
         HandoffEvent::ClaimTimedOut => iface.claim_timed_out().await?,
         HandoffEvent::ClaimSkipped(reason) => iface.claim_skipped(reason.into()).await?,
         HandoffEvent::SendDropped(command) => iface.send_dropped(command).await?,
         HandoffEvent::LidChanged(open) => iface.lid_changed(open).await?,
         HandoffEvent::AccessoryDisappeared => iface.accessory_disappeared().await?,
         HandoffEvent::AccessoryStatus(status) => {
            iface
               .accessory_status(&status.to_json().to_string())
               .await?;
         },
         HandoffEvent::DeviceInformation(info) => {
            iface
               .device_information(&serde_json::to_string(&info).unwrap_or_default())
               .await?;
         },
         HandoffEvent::ConversationAwareness(level) => {
            iface.conversation_awareness(level).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, HandoffService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            let name = event.name();
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching {name} event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: HandoffEvent) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
