//! Single-writer controller for one accessory.
//!
//! All mutable state (the ownership arbitrator, the control command store,
//! session bookkeeping) lives in one actor task. Host requests, scanner
//! reports, session lifecycle notifications and inbound packets all arrive as
//! messages and are handled one at a time.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::Address;
use futures::future::BoxFuture;
use log::{debug, error, info, warn};
use rand::Rng;
use serde_json::json;
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   airpods::{
      arbitrator::{Action, ArbitratorConfig, ClaimToken, OwnershipArbitrator, OwnershipState},
      broadcast::{AccessoryStatus, BroadcastEdge, Edges, StatusCell},
      codec::Packet,
      parser::{self, DeviceInformation, ProximityKey},
      protocol::{BatteryInfo, ControlCommandId, EarDetectionStatus, PacketKind, TakeoverReason},
      status::{CommandStatusStore, ControlCommandStatus},
      stem::{StemActionRouter, StemConfig},
   },
   audio::AudioRoutePort,
   bluetooth::{
      l2cap::{L2CapReceiver, L2CapSender},
      session,
   },
   error::{HandoffError, Result},
   event::{EventSender, HandoffEvent},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;
/// Maximum delay between automatic connection attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Opens AACP sessions to the accessory.
pub trait Connector: Send + Sync + 'static {
   fn connect<'a>(
      &'a self,
      jset: &'a mut JoinSet<()>,
      stem_mask: u8,
   ) -> BoxFuture<'a, Result<(L2CapReceiver, L2CapSender)>>;
}

/// Connects over the L2CAP control channel.
pub struct L2CapConnector {
   address: Address,
}

impl L2CapConnector {
   pub const fn new(address: Address) -> Self {
      Self { address }
   }
}

impl Connector for L2CapConnector {
   fn connect<'a>(
      &'a self,
      jset: &'a mut JoinSet<()>,
      stem_mask: u8,
   ) -> BoxFuture<'a, Result<(L2CapReceiver, L2CapSender)>> {
      Box::pin(session::open(jset, self.address, stem_mask))
   }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
   pub accessory: Address,
   pub arbitrator: ArbitratorConfig,
   pub stem: StemConfig,
}

#[derive(Debug)]
enum ControllerCommand {
   // Host requests
   Trigger(TakeoverReason),
   ManualOverride,
   Disconnect,
   GetStatus(oneshot::Sender<serde_json::Value>),
   GetOwnership(oneshot::Sender<OwnershipState>),

   // Scanner reports
   Broadcast(Option<AccessoryStatus>, Edges),

   // Session lifecycle
   SessionUp(u64, L2CapSender),
   SessionFailed(u64, SmolStr),
   SessionDown(u64, SmolStr),
   Inbound(u64, Packet),
   ClaimDeadline(ClaimToken),
}

/// Handle to the controller actor. This type is cheaply cloneable.
#[derive(Clone)]
pub struct Controller {
   inbox: mpsc::Sender<ControllerCommand>,
   store: CommandStatusStore,
   cell: StatusCell,
}

impl Controller {
   pub fn spawn(
      config: ControllerConfig,
      connector: Arc<dyn Connector>,
      audio: Arc<dyn AudioRoutePort>,
      events: EventSender,
   ) -> Self {
      let (inbox, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let store = CommandStatusStore::new();
      let cell = StatusCell::new();
      let actor = ControllerActor::new(
         config,
         connector,
         audio,
         events,
         store.clone(),
         cell.clone(),
         command_rx,
      );
      tokio::spawn(actor.run());
      Self { inbox, store, cell }
   }

   async fn request(&self, cmd: ControllerCommand) -> Result<()> {
      self
         .inbox
         .send(cmd)
         .await
         .map_err(|_| HandoffError::ControllerShutdown)
   }

   pub async fn take_over(&self, reason: TakeoverReason) -> Result<()> {
      self.request(ControllerCommand::Trigger(reason)).await
   }

   pub async fn manual_override(&self) -> Result<()> {
      self.request(ControllerCommand::ManualOverride).await
   }

   pub async fn disconnect(&self) -> Result<()> {
      self.request(ControllerCommand::Disconnect).await
   }

   pub async fn report_broadcast(&self, status: Option<AccessoryStatus>, edges: Edges) {
      if self
         .request(ControllerCommand::Broadcast(status, edges))
         .await
         .is_err()
      {
         debug!("Dropping broadcast report, controller is gone");
      }
   }

   pub async fn status(&self) -> Result<serde_json::Value> {
      let (tx, rx) = oneshot::channel();
      self.request(ControllerCommand::GetStatus(tx)).await?;
      rx.await.map_err(|_| HandoffError::ControllerShutdown)
   }

   pub async fn ownership(&self) -> Result<OwnershipState> {
      let (tx, rx) = oneshot::channel();
      self.request(ControllerCommand::GetOwnership(tx)).await?;
      rx.await.map_err(|_| HandoffError::ControllerShutdown)
   }

   pub fn store(&self) -> &CommandStatusStore {
      &self.store
   }

   pub fn control_command(&self, id: ControlCommandId) -> Option<ControlCommandStatus> {
      self.store.query(id)
   }

   pub fn status_cell(&self) -> &StatusCell {
      &self.cell
   }
}

struct ControllerActor {
   accessory: Address,
   arbitrator: OwnershipArbitrator,
   router: StemActionRouter,
   store: CommandStatusStore,
   cell: StatusCell,
   events: EventSender,
   audio: Arc<dyn AudioRoutePort>,
   connector: Arc<dyn Connector>,
   command_rx: mpsc::Receiver<ControllerCommand>,
   loopback_rx: mpsc::Receiver<ControllerCommand>,
   loopback_tx: mpsc::Sender<ControllerCommand>,

   // Session
   generation: u64,
   sender: Option<L2CapSender>,
   session_tasks: JoinSet<()>,
   timers: JoinSet<()>,
   connect_failures: u32,

   // Session-derived state
   battery: Option<BatteryInfo>,
   ear: Option<EarDetectionStatus>,
   device_info: Option<DeviceInformation>,
   proximity_keys: SmallVec<[ProximityKey; 2]>,
}

impl ControllerActor {
   fn new(
      config: ControllerConfig,
      connector: Arc<dyn Connector>,
      audio: Arc<dyn AudioRoutePort>,
      events: EventSender,
      store: CommandStatusStore,
      cell: StatusCell,
      command_rx: mpsc::Receiver<ControllerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         accessory: config.accessory,
         arbitrator: OwnershipArbitrator::new(config.arbitrator),
         router: StemActionRouter::new(config.stem),
         store,
         cell,
         events,
         audio,
         connector,
         command_rx,
         loopback_rx,
         loopback_tx,
         generation: 0,
         sender: None,
         session_tasks: JoinSet::new(),
         timers: JoinSet::new(),
         connect_failures: 0,
         battery: None,
         ear: None,
         device_info: None,
         proximity_keys: SmallVec::new(),
      }
   }

   async fn run(mut self) {
      info!("Controller for {} starting up", self.accessory);
      loop {
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Controller shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd);
            }
            Some(res) = self.session_tasks.join_next(), if !self.session_tasks.is_empty() => {
               if let Err(e) = res
                  && e.is_panic()
               {
                  error!("Session task panicked: {e}");
               }
            }
            Some(res) = self.timers.join_next(), if !self.timers.is_empty() => {
               if let Err(e) = res
                  && e.is_panic()
               {
                  error!("Timer task panicked: {e}");
               }
            }
         }
      }
      self.teardown();
   }

   fn handle_command(&mut self, cmd: ControllerCommand) {
      let now = Instant::now();
      match cmd {
         ControllerCommand::Trigger(reason) => {
            let actions = self.arbitrator.trigger(reason, now);
            self.execute(actions);
         },
         ControllerCommand::ManualOverride => {
            let actions = self.arbitrator.manual_override();
            self.execute(actions);
         },
         ControllerCommand::Disconnect => {
            if self.sender.is_some() || !self.session_tasks.is_empty() {
               info!("{}: Disconnecting on request", self.accessory);
               self.teardown();
               self.events.emit(HandoffEvent::Disconnected);
            }
         },
         ControllerCommand::GetStatus(tx) => {
            let _ = tx.send(self.status_json());
         },
         ControllerCommand::GetOwnership(tx) => {
            let _ = tx.send(self.arbitrator.state());
         },
         ControllerCommand::Broadcast(status, edges) => self.handle_broadcast(status, &edges, now),
         ControllerCommand::SessionUp(generation, sender) => {
            if generation != self.generation {
               return;
            }
            info!("{}: Session established", self.accessory);
            self.sender = Some(sender);
            self.connect_failures = 0;
            self.events.emit(HandoffEvent::Connected);
            let actions = self.arbitrator.on_session_up();
            self.execute(actions);
         },
         ControllerCommand::SessionFailed(generation, reason) => {
            if generation != self.generation {
               return;
            }
            warn!("{}: Connection failed: {reason}", self.accessory);
            self.session_tasks.abort_all();
            self.connect_failures += 1;
            self.events.emit(HandoffEvent::ConnectionFailed(reason));
            let backoff = calc_retry_delay(self.connect_failures);
            let actions = self.arbitrator.on_session_failed(now, backoff);
            self.execute(actions);
         },
         ControllerCommand::SessionDown(generation, reason) => {
            if generation != self.generation {
               return;
            }
            info!("{}: Session ended: {reason}", self.accessory);
            self.teardown();
            self.events.emit(HandoffEvent::Disconnected);
         },
         ControllerCommand::Inbound(generation, packet) => {
            if generation == self.generation {
               self.handle_packet(&packet, now);
            }
         },
         ControllerCommand::ClaimDeadline(token) => {
            let actions = self.arbitrator.on_claim_deadline(token);
            self.execute(actions);
         },
      }
   }

   fn execute(&mut self, actions: Vec<Action>) {
      for action in actions {
         match action {
            Action::Send(command) => {
               let result = match &self.sender {
                  Some(sender) => sender.post_command(&command),
                  None => Err(HandoffError::DeviceNotConnected),
               };
               if let Err(e) = result {
                  warn!("Dropping {}: {e}", command.name());
                  self.events.emit(HandoffEvent::SendDropped(command.name()));
               }
            },
            Action::Connect => self.start_session(),
            Action::ConnectAudio => self.audio.connect(),
            Action::DisconnectAudio => self.audio.disconnect(),
            Action::ArmClaimDeadline { token, after } => {
               let loopback = self.loopback_tx.clone();
               self.timers.spawn(async move {
                  time::sleep(after).await;
                  let _ = loopback.send(ControllerCommand::ClaimDeadline(token)).await;
               });
            },
            Action::Emit(event) => self.events.emit(event),
         }
      }
   }

   fn start_session(&mut self) {
      self.session_tasks.abort_all();
      self.generation += 1;
      let generation = self.generation;
      let connector = self.connector.clone();
      let loopback = self.loopback_tx.clone();
      let stem_mask = self.router.stem_config_mask();
      info!("{}: Opening AACP session", self.accessory);
      self
         .session_tasks
         .spawn(run_session(connector, generation, stem_mask, loopback));
   }

   /// Ends the current session. The session's I/O tasks are aborted, which closes the socket.
   fn teardown(&mut self) {
      self.generation += 1;
      self.sender = None;
      self.session_tasks.abort_all();
      self.store.clear();
      self.battery = None;
      self.ear = None;
      self.device_info = None;
      self.proximity_keys.clear();
      let actions = self.arbitrator.on_session_down();
      self.execute(actions);
   }

   fn handle_broadcast(
      &mut self,
      status: Option<AccessoryStatus>,
      edges: &[BroadcastEdge],
      now: Instant,
   ) {
      let actions = self.arbitrator.on_broadcast(status, now);
      self.execute(actions);

      let mut status_changed = false;
      for edge in edges {
         match edge {
            BroadcastEdge::LidOpened => self.events.emit(HandoffEvent::LidChanged(true)),
            BroadcastEdge::LidClosed => self.events.emit(HandoffEvent::LidChanged(false)),
            BroadcastEdge::DeviceDisappeared => {
               self.events.emit(HandoffEvent::AccessoryDisappeared);
            },
            BroadcastEdge::NewAddress(addr) => debug!("Accessory now advertises as {addr}"),
            BroadcastEdge::BatteryChanged
            | BroadcastEdge::EarStateChanged
            | BroadcastEdge::StatusChanged => status_changed = true,
         }
      }
      if status_changed && let Some(status) = status {
         self.events.emit(HandoffEvent::AccessoryStatus(status));
      }
   }

   fn handle_packet(&mut self, packet: &Packet, now: Instant) {
      if let Err(e) = self.dispatch(packet, now) {
         warn!(
            "{}: Failed to handle {} packet ({}): {e}",
            self.accessory,
            packet.kind,
            hex::encode(&packet.payload)
         );
      }
   }

   fn dispatch(&mut self, packet: &Packet, now: Instant) -> Result<()> {
      let payload = packet.payload.as_slice();
      match packet.kind {
         PacketKind::Battery => {
            let battery = parser::parse_battery_status(payload)?;
            self.battery = Some(battery);
            self.events.emit(HandoffEvent::BatteryUpdated(battery));
            let actions = self.arbitrator.on_battery(battery);
            self.execute(actions);
         },
         PacketKind::EarDetection => {
            let ear = parser::parse_ear_detection(payload)?;
            self.ear = Some(ear);
            self.arbitrator.on_ear_detection(ear);
            self.events.emit(HandoffEvent::EarStateChanged(ear));
         },
         PacketKind::ControlCommand => {
            self.record_control_command(payload)?;
         },
         PacketKind::OwnershipChange => {
            let status = self.record_control_command(payload)?;
            let owns = parser::parse_ownership(&status.value)?;
            let actions = self.arbitrator.on_ownership_status(owns, now);
            self.execute(actions);
         },
         PacketKind::OwnershipClaimRequest => {
            let request = parser::parse_claim_request(payload)?;
            let actions = self.arbitrator.on_claim_request(request);
            self.execute(actions);
         },
         PacketKind::ShowNearbyUI => {
            let sender = parser::parse_nearby_ui(payload)?;
            let actions = self.arbitrator.on_nearby_ui(sender);
            self.execute(actions);
         },
         PacketKind::ConnectedDevicesList => {
            let peers = parser::parse_connected_devices(payload)?;
            let actions = self.arbitrator.on_connected_devices(peers);
            self.execute(actions);
         },
         PacketKind::AudioSource => {
            let source = parser::parse_audio_source(payload)?;
            let actions = self.arbitrator.on_audio_source(source);
            self.execute(actions);
         },
         PacketKind::StemPress => {
            let press = parser::parse_stem_press(payload)?;
            if let Some(action) = self.router.on_press(&self.arbitrator, press.bud, press.press) {
               self.events.emit(HandoffEvent::StemAction(action));
            }
         },
         PacketKind::DeviceInformation => {
            let info = parser::parse_device_info(payload)?;
            info!("{}: Accessory is {} ({})", self.accessory, info.name, info.model_number);
            self.events.emit(HandoffEvent::DeviceInformation(Box::new(info.clone())));
            self.device_info = Some(info);
         },
         PacketKind::ConversationAwareness => {
            let level = parser::parse_conversation_awareness(payload)?;
            self.events.emit(HandoffEvent::ConversationAwareness(level));
         },
         PacketKind::ProximityKeys => {
            self.proximity_keys = parser::parse_proximity_keys(payload)?;
            info!(
               "{}: Received {} proximity keys",
               self.accessory,
               self.proximity_keys.len()
            );
         },
         PacketKind::HeadTracking | PacketKind::HandshakeAck | PacketKind::FeaturesAck => {},
         PacketKind::Unknown => {
            debug!(
               "{}: Unhandled opcode {}: {}",
               self.accessory,
               packet.opcode,
               hex::encode(payload)
            );
         },
      }
      Ok(())
   }

   fn record_control_command(&mut self, payload: &[u8]) -> Result<ControlCommandStatus> {
      let update = parser::parse_control_command(payload)?;
      debug!("Control command {} = {}", update.id, hex::encode(&update.value));
      let status = self.store.record_update(update.id, &update.value);
      self.events.emit(HandoffEvent::ControlCommandUpdated {
         id: update.id,
         value: update.value,
      });
      Ok(status)
   }

   fn status_json(&self) -> serde_json::Value {
      let commands: serde_json::Map<String, serde_json::Value> = self
         .store
         .snapshot()
         .into_iter()
         .map(|s| (s.identifier.to_str().to_string(), hex::encode(&s.value).into()))
         .collect();
      let listening_mode = self
         .store
         .query(ControlCommandId::LISTENING_MODE)
         .and_then(|s| parser::parse_noise_mode(&s.value).ok())
         .map(|m| m.to_str());
      json!({
         "accessory": self.accessory.to_string(),
         "ownership": self.arbitrator.state().name(),
         "connected": self.sender.is_some(),
         "battery": self.battery.map(BatteryInfo::to_json),
         "ear_detection": self.ear.map(EarDetectionStatus::to_json),
         "listening_mode": listening_mode,
         "broadcast": self.cell.load().map(AccessoryStatus::to_json),
         "device_info": self.device_info,
         "proximity_keys": self
            .proximity_keys
            .iter()
            .map(|k| k.kind.to_string())
            .collect::<Vec<_>>(),
         "peers": self.arbitrator.peers().iter().map(|p| p.mac.to_string()).collect::<Vec<_>>(),
         "control_commands": commands,
      })
   }
}

async fn run_session(
   connector: Arc<dyn Connector>,
   generation: u64,
   stem_mask: u8,
   loopback: mpsc::Sender<ControllerCommand>,
) {
   // I/O tasks live here so aborting this task closes the socket
   let mut jset = JoinSet::new();
   let (mut receiver, sender) = match connector.connect(&mut jset, stem_mask).await {
      Ok(halves) => halves,
      Err(e) => {
         let _ = loopback
            .send(ControllerCommand::SessionFailed(generation, e.to_smolstr()))
            .await;
         return;
      },
   };
   if loopback
      .send(ControllerCommand::SessionUp(generation, sender))
      .await
      .is_err()
   {
      return;
   }
   loop {
      match receiver.recv().await {
         Ok(packet) => {
            if loopback
               .send(ControllerCommand::Inbound(generation, packet))
               .await
               .is_err()
            {
               return;
            }
         },
         Err(e) => {
            let _ = loopback
               .send(ControllerCommand::SessionDown(generation, e.to_smolstr()))
               .await;
            return;
         },
      }
   }
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(6));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
