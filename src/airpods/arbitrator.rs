//! Audio ownership arbitration.
//!
//! The accessory lets exactly one of its paired controllers own the audio
//! route. [`OwnershipArbitrator`] decides when this controller claims it,
//! concedes it, or refuses to take it back, and which AACP messages to send in
//! each case. It performs no I/O: every input returns the ordered list of
//! [`Action`]s the caller must carry out.

use std::time::{Duration, Instant};

use bluer::Address;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   airpods::{
      broadcast::AccessoryStatus,
      parser::{AudioSource, ClaimRequest, PeerDevice, PeerList},
      protocol::{
         AudioSourceKind, BatteryInfo, Command, ConnectionState, EarDetectionStatus,
         TakeoverReason,
      },
      stem::OwnershipGate,
   },
   event::HandoffEvent,
};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(3);
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer name used when the sender is absent from the connected devices list.
pub const UNKNOWN_PEER_NAME: &str = "Other device";

/// Which `(reason, connection state)` combinations permit an automatic claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverPolicy {
   #[serde(default = "enabled")]
   pub when_disconnected: bool,
   #[serde(default = "enabled")]
   pub when_idle: bool,
   #[serde(default)]
   pub when_music: bool,
   /// Also covers ringing and hanging up.
   #[serde(default = "enabled")]
   pub when_call: bool,
   #[serde(default = "enabled")]
   pub on_media_start: bool,
   #[serde(default = "enabled")]
   pub on_call_ringing: bool,
}

const fn enabled() -> bool {
   true
}

impl Default for TakeoverPolicy {
   fn default() -> Self {
      Self {
         when_disconnected: true,
         when_idle: true,
         when_music: false,
         when_call: true,
         on_media_start: true,
         on_call_ringing: true,
      }
   }
}

impl TakeoverPolicy {
   pub const fn allows_reason(&self, reason: TakeoverReason) -> bool {
      match reason {
         TakeoverReason::MusicStart => self.on_media_start,
         TakeoverReason::CallRinging => self.on_call_ringing,
      }
   }

   pub const fn allows_state(&self, state: ConnectionState) -> bool {
      match state {
         ConnectionState::Disconnected => self.when_disconnected,
         ConnectionState::Idle => self.when_idle,
         ConnectionState::Music => self.when_music,
         ConnectionState::Call | ConnectionState::Ringing | ConnectionState::HangingUp => {
            self.when_call
         },
      }
   }
}

#[derive(Debug, Clone)]
pub struct ArbitratorConfig {
   pub self_mac: Address,
   pub policy: TakeoverPolicy,
   pub cooldown: Duration,
   pub claim_timeout: Duration,
   pub connect_when_unclaimed: bool,
}

impl ArbitratorConfig {
   pub fn new(self_mac: Address) -> Self {
      Self {
         self_mac,
         policy: TakeoverPolicy::default(),
         cooldown: DEFAULT_COOLDOWN,
         claim_timeout: DEFAULT_CLAIM_TIMEOUT,
         connect_when_unclaimed: false,
      }
   }
}

/// Identifies one claim attempt so stale deadlines can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrigin {
   Trigger(TakeoverReason),
   ManualOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
   Unowned,
   ClaimInFlight { origin: ClaimOrigin, token: ClaimToken },
   Owned,
   /// A peer reversed the route away from us; no automatic claims.
   RefusedLocked,
}

impl OwnershipState {
   pub const fn name(&self) -> &'static str {
      match self {
         Self::Unowned => "unowned",
         Self::ClaimInFlight { .. } => "claim_in_flight",
         Self::Owned => "owned",
         Self::RefusedLocked => "refused_locked",
      }
   }
}

/// Why an automatic claim was not attempted.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr, Serialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
   Locked,
   AlreadyOwned,
   ClaimInFlight,
   Cooldown,
   ReasonDisabled,
   StateDisabled,
   UnknownConnectionState,
   NotInEar,
}

/// Side effect requested by the arbitrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
   Send(Command),
   /// Open the AACP session.
   Connect,
   ConnectAudio,
   DisconnectAudio,
   ArmClaimDeadline { token: ClaimToken, after: Duration },
   Emit(HandoffEvent),
}

pub type Actions = Vec<Action>;

pub struct OwnershipArbitrator {
   config: ArbitratorConfig,
   state: OwnershipState,
   session_up: bool,
   connecting: bool,
   connect_not_before: Option<Instant>,
   pending: Option<ClaimOrigin>,
   cooldown_until: Option<Instant>,
   peers: PeerList,
   broadcast: Option<AccessoryStatus>,
   session_ear: Option<EarDetectionStatus>,
   last_foreign_source: Option<Address>,
   /// Audio route dropped while both buds sit in the case.
   parked: bool,
   next_token: u64,
}

impl OwnershipArbitrator {
   pub fn new(config: ArbitratorConfig) -> Self {
      Self {
         config,
         state: OwnershipState::Unowned,
         session_up: false,
         connecting: false,
         connect_not_before: None,
         pending: None,
         cooldown_until: None,
         peers: PeerList::new(),
         broadcast: None,
         session_ear: None,
         last_foreign_source: None,
         parked: false,
         next_token: 0,
      }
   }

   pub fn state(&self) -> OwnershipState {
      self.state
   }

   pub fn config(&self) -> &ArbitratorConfig {
      &self.config
   }

   pub fn is_session_up(&self) -> bool {
      self.session_up
   }

   pub fn peers(&self) -> &PeerList {
      &self.peers
   }

   /// Host signal that this controller would like the audio route.
   pub fn trigger(&mut self, reason: TakeoverReason, now: Instant) -> Actions {
      if let Err(skip) = self.evaluate(reason, now) {
         debug!("Not taking over for {reason}: {skip}");
         return vec![Action::Emit(HandoffEvent::ClaimSkipped(skip))];
      }
      info!("Taking over audio for {reason}");
      self.claim(ClaimOrigin::Trigger(reason))
   }

   /// Clears a reverse lock and claims regardless of policy, ear state and cooldown.
   pub fn manual_override(&mut self) -> Actions {
      match self.state {
         OwnershipState::Owned => {
            return vec![Action::Emit(HandoffEvent::ClaimSkipped(
               SkipReason::AlreadyOwned,
            ))];
         },
         OwnershipState::ClaimInFlight { .. } => {
            return vec![Action::Emit(HandoffEvent::ClaimSkipped(
               SkipReason::ClaimInFlight,
            ))];
         },
         OwnershipState::RefusedLocked => {
            info!("Manual override clears the reverse lock");
            self.state = OwnershipState::Unowned;
         },
         OwnershipState::Unowned => {},
      }
      self.cooldown_until = None;
      self.claim(ClaimOrigin::ManualOverride)
   }

   fn evaluate(&self, reason: TakeoverReason, now: Instant) -> Result<(), SkipReason> {
      match self.state {
         OwnershipState::RefusedLocked => return Err(SkipReason::Locked),
         OwnershipState::Owned => return Err(SkipReason::AlreadyOwned),
         OwnershipState::ClaimInFlight { .. } => return Err(SkipReason::ClaimInFlight),
         OwnershipState::Unowned => {},
      }
      if self.pending.is_some() {
         return Err(SkipReason::ClaimInFlight);
      }
      if self.cooldown_until.is_some_and(|until| now < until) {
         return Err(SkipReason::Cooldown);
      }
      if !self.config.policy.allows_reason(reason) {
         return Err(SkipReason::ReasonDisabled);
      }
      let Some(state) = self.broadcast.and_then(|s| s.connection_state) else {
         return Err(SkipReason::UnknownConnectionState);
      };
      if !self.config.policy.allows_state(state) {
         return Err(SkipReason::StateDisabled);
      }
      if !self.any_in_ear() {
         return Err(SkipReason::NotInEar);
      }
      Ok(())
   }

   fn any_in_ear(&self) -> bool {
      match (self.session_up, self.session_ear) {
         (true, Some(ear)) => ear.any_in_ear(),
         _ => self.broadcast.is_some_and(|s| s.any_in_ear()),
      }
   }

   fn claim(&mut self, origin: ClaimOrigin) -> Actions {
      if !self.session_up {
         self.pending = Some(origin);
         return self.request_connect();
      }

      let token = ClaimToken(self.next_token);
      self.next_token += 1;
      self.state = OwnershipState::ClaimInFlight { origin, token };

      let me = self.config.self_mac;
      vec![
         Action::Send(Command::OwnershipClaim(true)),
         Action::Send(Command::MediaInformation {
            sender: me,
            target: me,
         }),
         Action::Send(Command::HijackRequest { sender: me }),
         Action::ArmClaimDeadline {
            token,
            after: self.config.claim_timeout,
         },
      ]
   }

   fn request_connect(&mut self) -> Actions {
      if self.connecting {
         return Vec::new();
      }
      self.connecting = true;
      vec![Action::Connect]
   }

   /// The AACP handshake completed.
   pub fn on_session_up(&mut self) -> Actions {
      self.session_up = true;
      self.connecting = false;
      self.connect_not_before = None;
      match self.pending.take() {
         Some(origin) => self.claim(origin),
         None => Vec::new(),
      }
   }

   /// The session could not be established; the next automatic connect waits `backoff`.
   pub fn on_session_failed(&mut self, now: Instant, backoff: Duration) -> Actions {
      self.connecting = false;
      self.connect_not_before = Some(now + backoff);
      if let Some(origin) = self.pending.take() {
         warn!("Dropping pending claim ({origin:?}): session could not be established");
      }
      Vec::new()
   }

   /// The session ended. Ownership resets, a reverse lock survives.
   pub fn on_session_down(&mut self) -> Actions {
      let mut actions = Vec::new();
      if self.state == OwnershipState::Owned {
         actions.push(Action::DisconnectAudio);
         actions.push(Action::Emit(HandoffEvent::OwnershipLost));
      }
      if self.state != OwnershipState::RefusedLocked {
         self.state = OwnershipState::Unowned;
      }
      self.session_up = false;
      self.connecting = false;
      self.pending = None;
      self.peers.clear();
      self.session_ear = None;
      self.last_foreign_source = None;
      actions
   }

   /// The accessory reported the `OWNS_CONNECTION` value.
   pub fn on_ownership_status(&mut self, owns: bool, now: Instant) -> Actions {
      match (self.state, owns) {
         (OwnershipState::ClaimInFlight { .. } | OwnershipState::Unowned, true) => {
            info!("Accessory confirmed audio ownership");
            self.state = OwnershipState::Owned;
            self.last_foreign_source = None;
            self.parked = false;
            vec![
               Action::ConnectAudio,
               Action::Emit(HandoffEvent::OwnershipGained),
            ]
         },
         (OwnershipState::Owned, false) => {
            info!("Another controller took over audio");
            self.state = OwnershipState::Unowned;
            self.cooldown_until = Some(now + self.config.cooldown);
            vec![
               Action::DisconnectAudio,
               Action::Emit(HandoffEvent::OwnershipLost),
            ]
         },
         (OwnershipState::ClaimInFlight { .. }, false) => {
            info!("Claim abandoned, accessory reports another owner");
            self.state = OwnershipState::Unowned;
            self.cooldown_until = Some(now + self.config.cooldown);
            vec![Action::Emit(HandoffEvent::OwnershipContested)]
         },
         (OwnershipState::RefusedLocked, true) => {
            debug!("Ignoring ownership grant while locked");
            Vec::new()
         },
         _ => Vec::new(),
      }
   }

   fn peer_name(&self, mac: Address) -> SmolStr {
      self
         .peers
         .iter()
         .find(|p| p.mac == mac)
         .map_or(SmolStr::new_static(UNKNOWN_PEER_NAME), PeerDevice::display_name)
   }

   /// A peer asked us to give up the route.
   pub fn on_claim_request(&mut self, request: ClaimRequest) -> Actions {
      let peer = self.peer_name(request.sender);
      info!(
         "{peer} requested ownership (reversed: {})",
         request.reversed
      );

      // the platform audio link can be up without AACP ownership
      let mut actions = vec![
         Action::Send(Command::OwnershipClaim(false)),
         Action::DisconnectAudio,
      ];
      if matches!(self.state, OwnershipState::ClaimInFlight { .. }) {
         actions.push(Action::Emit(HandoffEvent::OwnershipContested));
      }
      actions.push(Action::Emit(HandoffEvent::MovedToPeer {
         peer,
         reversed: request.reversed,
      }));

      self.pending = None;
      self.state = if request.reversed || self.state == OwnershipState::RefusedLocked {
         OwnershipState::RefusedLocked
      } else {
         OwnershipState::Unowned
      };
      actions
   }

   pub fn on_nearby_ui(&mut self, sender: Address) -> Actions {
      vec![Action::Emit(HandoffEvent::PeerAnnounced {
         peer: self.peer_name(sender),
      })]
   }

   /// Introduces this controller to every peer that was not in the previous list.
   pub fn on_connected_devices(&mut self, peers: PeerList) -> Actions {
      let me = self.config.self_mac;
      let mut actions = Vec::new();
      for peer in &peers {
         if peer.mac == me || self.peers.iter().any(|p| p.mac == peer.mac) {
            continue;
         }
         debug!("New peer connected to accessory: {}", peer.mac);
         actions.push(Action::Send(Command::MediaInformation {
            sender: me,
            target: peer.mac,
         }));
         actions.push(Action::Send(Command::AddPeer {
            sender: me,
            target: peer.mac,
         }));
      }
      self.peers = peers;
      actions
   }

   /// Yields AACP control when another controller becomes the audio source.
   pub fn on_audio_source(&mut self, source: AudioSource) -> Actions {
      let foreign = source.mac != self.config.self_mac && source.kind != AudioSourceKind::None;
      let idle = matches!(
         self.state,
         OwnershipState::Unowned | OwnershipState::RefusedLocked
      );
      if !foreign || !idle {
         if !foreign {
            self.last_foreign_source = None;
         }
         return Vec::new();
      }
      if self.last_foreign_source == Some(source.mac) {
         return Vec::new();
      }
      self.last_foreign_source = Some(source.mac);
      debug!("{} is the audio source, releasing control", source.mac);
      vec![Action::Send(Command::OwnershipClaim(false))]
   }

   pub fn on_claim_deadline(&mut self, token: ClaimToken) -> Actions {
      match self.state {
         OwnershipState::ClaimInFlight { token: current, .. } if current == token => {
            warn!("Claim was not confirmed in time");
            self.state = OwnershipState::Unowned;
            vec![Action::Emit(HandoffEvent::ClaimTimedOut)]
         },
         _ => Vec::new(),
      }
   }

   /// Parks the audio route while both buds charge, restores it once one leaves the case.
   pub fn on_battery(&mut self, battery: BatteryInfo) -> Actions {
      let charging = battery.left.is_charging() && battery.right.is_charging();
      if self.state != OwnershipState::Owned || charging == self.parked {
         return Vec::new();
      }
      self.parked = charging;
      if charging {
         info!("Both buds are charging, releasing the audio route");
         vec![Action::DisconnectAudio]
      } else {
         vec![Action::ConnectAudio]
      }
   }

   pub fn on_ear_detection(&mut self, status: EarDetectionStatus) {
      self.session_ear = Some(status);
   }

   /// Latest broadcast snapshot, `None` once the accessory disappeared.
   pub fn on_broadcast(&mut self, status: Option<AccessoryStatus>, now: Instant) -> Actions {
      self.broadcast = status;
      let Some(status) = status else {
         return Vec::new();
      };
      let unclaimed = status.connection_state == Some(ConnectionState::Disconnected);
      let backing_off = self.connect_not_before.is_some_and(|t| now < t);
      if self.config.connect_when_unclaimed
         && unclaimed
         && !self.session_up
         && !backing_off
         && self.state != OwnershipState::RefusedLocked
      {
         return self.request_connect();
      }
      Vec::new()
   }
}

impl OwnershipGate for OwnershipArbitrator {
   fn owns_route(&self) -> bool {
      self.state == OwnershipState::Owned
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::airpods::protocol::BatteryStatus;

   const SELF_MAC: Address = Address::new([0x11, 0x11, 0x11, 0x11, 0x11, 0x11]);
   const PEER_MAC: Address = Address::new([0x22, 0x22, 0x22, 0x22, 0x22, 0x22]);

   fn status(state: ConnectionState, left_in_ear: bool) -> AccessoryStatus {
      AccessoryStatus {
         address: Address::new([0x33; 6]),
         model: 0x2014,
         primary_left: true,
         left_battery: Some(80),
         right_battery: Some(80),
         case_battery: None,
         left_charging: false,
         right_charging: false,
         case_charging: false,
         left_in_ear,
         right_in_ear: false,
         lid_open: false,
         connection_state: Some(state),
      }
   }

   fn connected_arbitrator(now: Instant) -> OwnershipArbitrator {
      let mut arb = OwnershipArbitrator::new(ArbitratorConfig::new(SELF_MAC));
      assert!(arb.on_session_up().is_empty());
      arb.on_broadcast(Some(status(ConnectionState::Idle, true)), now);
      arb
   }

   fn sends(actions: &[Action]) -> Vec<Command> {
      actions
         .iter()
         .filter_map(|a| match a {
            Action::Send(cmd) => Some(cmd.clone()),
            _ => None,
         })
         .collect()
   }

   fn owned_arbitrator(now: Instant) -> OwnershipArbitrator {
      let mut arb = connected_arbitrator(now);
      arb.trigger(TakeoverReason::MusicStart, now);
      arb.on_ownership_status(true, now);
      assert_eq!(arb.state(), OwnershipState::Owned);
      arb
   }

   fn peers(macs: &[Address]) -> PeerList {
      macs
         .iter()
         .map(|&mac| PeerDevice {
            mac,
            info1: 0x01,
            info2: 0x00,
         })
         .collect()
   }

   fn battery(left_charging: bool, right_charging: bool) -> BatteryInfo {
      let status = |charging| {
         if charging {
            BatteryStatus::Charging
         } else {
            BatteryStatus::Discharging
         }
      };
      let mut info = BatteryInfo::new();
      info.left.level = 90;
      info.left.status = status(left_charging);
      info.right.level = 90;
      info.right.status = status(right_charging);
      info
   }

   #[test]
   fn test_music_start_claims_in_order() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);

      let actions = arb.trigger(TakeoverReason::MusicStart, now);
      assert_eq!(
         sends(&actions),
         vec![
            Command::OwnershipClaim(true),
            Command::MediaInformation {
               sender: SELF_MAC,
               target: SELF_MAC
            },
            Command::HijackRequest { sender: SELF_MAC },
         ]
      );
      assert!(matches!(
         actions.last(),
         Some(Action::ArmClaimDeadline { after, .. }) if *after == DEFAULT_CLAIM_TIMEOUT
      ));
      assert!(matches!(arb.state(), OwnershipState::ClaimInFlight { .. }));
      assert!(!arb.owns_route());

      let actions = arb.on_ownership_status(true, now);
      assert_eq!(
         actions,
         vec![
            Action::ConnectAudio,
            Action::Emit(HandoffEvent::OwnershipGained)
         ]
      );
      assert!(arb.owns_route());
   }

   #[test]
   fn test_claim_while_owned_is_noop() {
      let now = Instant::now();
      let mut arb = owned_arbitrator(now);
      let actions = arb.trigger(TakeoverReason::CallRinging, now);
      assert!(sends(&actions).is_empty());
      assert_eq!(
         actions,
         vec![Action::Emit(HandoffEvent::ClaimSkipped(
            SkipReason::AlreadyOwned
         ))]
      );
      assert!(arb.on_ownership_status(true, now).is_empty());
      assert!(sends(&arb.manual_override()).is_empty());
      assert_eq!(arb.state(), OwnershipState::Owned);
   }

   #[test]
   fn test_policy_gates() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);

      arb.on_broadcast(Some(status(ConnectionState::Music, true)), now);
      assert_eq!(
         arb.trigger(TakeoverReason::MusicStart, now),
         vec![Action::Emit(HandoffEvent::ClaimSkipped(
            SkipReason::StateDisabled
         ))]
      );

      arb.on_broadcast(Some(status(ConnectionState::Idle, false)), now);
      assert_eq!(
         arb.trigger(TakeoverReason::MusicStart, now),
         vec![Action::Emit(HandoffEvent::ClaimSkipped(SkipReason::NotInEar))]
      );

      let mut unknown = status(ConnectionState::Idle, true);
      unknown.connection_state = None;
      arb.on_broadcast(Some(unknown), now);
      assert_eq!(
         arb.trigger(TakeoverReason::MusicStart, now),
         vec![Action::Emit(HandoffEvent::ClaimSkipped(
            SkipReason::UnknownConnectionState
         ))]
      );
      assert_eq!(arb.state(), OwnershipState::Unowned);
   }

   #[test]
   fn test_session_ear_detection_overrides_broadcast() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);
      arb.on_ear_detection(EarDetectionStatus::new(false, false));
      assert_eq!(
         arb.trigger(TakeoverReason::MusicStart, now),
         vec![Action::Emit(HandoffEvent::ClaimSkipped(SkipReason::NotInEar))]
      );
      arb.on_ear_detection(EarDetectionStatus::new(false, true));
      assert_eq!(sends(&arb.trigger(TakeoverReason::MusicStart, now)).len(), 3);
   }

   #[test]
   fn test_claim_without_session_connects_first() {
      let now = Instant::now();
      let mut arb = OwnershipArbitrator::new(ArbitratorConfig::new(SELF_MAC));
      arb.on_broadcast(Some(status(ConnectionState::Disconnected, true)), now);

      assert_eq!(arb.trigger(TakeoverReason::MusicStart, now), vec![Action::Connect]);
      assert_eq!(arb.state(), OwnershipState::Unowned);
      // a second trigger does not open another connection
      assert!(sends(&arb.trigger(TakeoverReason::MusicStart, now)).is_empty());

      let actions = arb.on_session_up();
      assert_eq!(sends(&actions)[0], Command::OwnershipClaim(true));
      assert!(matches!(arb.state(), OwnershipState::ClaimInFlight { .. }));
   }

   #[test]
   fn test_failed_session_drops_pending_claim() {
      let now = Instant::now();
      let mut arb = OwnershipArbitrator::new(ArbitratorConfig::new(SELF_MAC));
      arb.on_broadcast(Some(status(ConnectionState::Idle, true)), now);
      assert_eq!(arb.trigger(TakeoverReason::MusicStart, now), vec![Action::Connect]);
      arb.on_session_failed(now, Duration::from_secs(2));
      assert!(arb.on_session_up().is_empty());
   }

   #[test]
   fn test_concession_sets_cooldown() {
      let now = Instant::now();
      let mut arb = owned_arbitrator(now);
      let actions = arb.on_ownership_status(false, now);
      assert_eq!(
         actions,
         vec![
            Action::DisconnectAudio,
            Action::Emit(HandoffEvent::OwnershipLost)
         ]
      );
      assert_eq!(arb.state(), OwnershipState::Unowned);

      assert_eq!(
         arb.trigger(TakeoverReason::MusicStart, now + Duration::from_secs(1)),
         vec![Action::Emit(HandoffEvent::ClaimSkipped(SkipReason::Cooldown))]
      );
      let later = now + DEFAULT_COOLDOWN;
      assert_eq!(sends(&arb.trigger(TakeoverReason::MusicStart, later)).len(), 3);
   }

   #[test]
   fn test_reverse_locks_until_manual_override() {
      let now = Instant::now();
      let mut arb = owned_arbitrator(now);
      arb.on_connected_devices(peers(&[PEER_MAC]));

      let actions = arb.on_claim_request(ClaimRequest {
         sender: PEER_MAC,
         reversed: true,
      });
      assert_eq!(
         actions,
         vec![
            Action::Send(Command::OwnershipClaim(false)),
            Action::DisconnectAudio,
            Action::Emit(HandoffEvent::MovedToPeer {
               peer: SmolStr::new("22:22:22:22:22:22 (01:00)"),
               reversed: true,
            }),
         ]
      );
      assert_eq!(arb.state(), OwnershipState::RefusedLocked);

      for _ in 0..5 {
         assert!(sends(&arb.trigger(TakeoverReason::MusicStart, now)).is_empty());
      }
      // lock survives the session going away
      arb.on_session_down();
      arb.on_session_up();
      assert!(sends(&arb.trigger(TakeoverReason::CallRinging, now)).is_empty());
      assert!(arb.on_ownership_status(true, now).is_empty());
      assert_eq!(arb.state(), OwnershipState::RefusedLocked);

      let actions = arb.manual_override();
      assert_eq!(sends(&actions)[0], Command::OwnershipClaim(true));
      assert!(matches!(
         arb.state(),
         OwnershipState::ClaimInFlight {
            origin: ClaimOrigin::ManualOverride,
            ..
         }
      ));
   }

   #[test]
   fn test_plain_revocation_stays_eligible() {
      let now = Instant::now();
      let mut arb = owned_arbitrator(now);
      let actions = arb.on_claim_request(ClaimRequest {
         sender: PEER_MAC,
         reversed: false,
      });
      assert!(actions.contains(&Action::Emit(HandoffEvent::MovedToPeer {
         peer: SmolStr::new_static(UNKNOWN_PEER_NAME),
         reversed: false,
      })));
      assert_eq!(arb.state(), OwnershipState::Unowned);
      assert_eq!(sends(&arb.trigger(TakeoverReason::MusicStart, now)).len(), 3);
   }

   #[test]
   fn test_revocation_while_unowned_drops_audio() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);
      let actions = arb.on_claim_request(ClaimRequest {
         sender: PEER_MAC,
         reversed: true,
      });
      assert_eq!(
         actions,
         vec![
            Action::Send(Command::OwnershipClaim(false)),
            Action::DisconnectAudio,
            Action::Emit(HandoffEvent::MovedToPeer {
               peer: SmolStr::new_static(UNKNOWN_PEER_NAME),
               reversed: true,
            }),
         ]
      );
      assert_eq!(arb.state(), OwnershipState::RefusedLocked);

      // still replies and drops audio once locked
      let actions = arb.on_claim_request(ClaimRequest {
         sender: PEER_MAC,
         reversed: false,
      });
      assert_eq!(
         &actions[..2],
         &[
            Action::Send(Command::OwnershipClaim(false)),
            Action::DisconnectAudio
         ]
      );
      assert_eq!(arb.state(), OwnershipState::RefusedLocked);
   }

   #[test]
   fn test_charging_parks_audio_route() {
      let now = Instant::now();
      let mut unowned = connected_arbitrator(now);
      assert!(unowned.on_battery(battery(true, true)).is_empty());

      let mut arb = owned_arbitrator(now);
      assert!(arb.on_battery(battery(false, false)).is_empty());
      assert!(arb.on_battery(battery(true, false)).is_empty());
      assert_eq!(arb.on_battery(battery(true, true)), vec![Action::DisconnectAudio]);
      assert!(arb.on_battery(battery(true, true)).is_empty());
      assert_eq!(arb.on_battery(battery(false, true)), vec![Action::ConnectAudio]);
      assert!(arb.on_battery(battery(false, true)).is_empty());
      assert_eq!(arb.state(), OwnershipState::Owned);
   }

   #[test]
   fn test_revocation_races_claim() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);
      arb.trigger(TakeoverReason::MusicStart, now);
      let actions = arb.on_claim_request(ClaimRequest {
         sender: PEER_MAC,
         reversed: false,
      });
      assert!(actions.contains(&Action::Emit(HandoffEvent::OwnershipContested)));
      assert_eq!(arb.state(), OwnershipState::Unowned);

      arb.trigger(TakeoverReason::MusicStart, now);
      assert_eq!(
         arb.on_ownership_status(false, now),
         vec![Action::Emit(HandoffEvent::OwnershipContested)]
      );
      assert_eq!(arb.state(), OwnershipState::Unowned);
   }

   #[test]
   fn test_claim_deadline() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);
      let actions = arb.trigger(TakeoverReason::MusicStart, now);
      let Some(&Action::ArmClaimDeadline { token, .. }) = actions.last() else {
         panic!("no deadline armed");
      };

      assert_eq!(
         arb.on_claim_deadline(token),
         vec![Action::Emit(HandoffEvent::ClaimTimedOut)]
      );
      assert_eq!(arb.state(), OwnershipState::Unowned);

      // a stale deadline does not affect a newer claim
      arb.trigger(TakeoverReason::MusicStart, now);
      assert!(arb.on_claim_deadline(token).is_empty());
      assert!(matches!(arb.state(), OwnershipState::ClaimInFlight { .. }));
   }

   #[test]
   fn test_connected_devices_idempotent() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);
      let list = peers(&[SELF_MAC, PEER_MAC]);

      let actions = arb.on_connected_devices(list.clone());
      assert_eq!(
         sends(&actions),
         vec![
            Command::MediaInformation {
               sender: SELF_MAC,
               target: PEER_MAC
            },
            Command::AddPeer {
               sender: SELF_MAC,
               target: PEER_MAC
            },
         ]
      );
      assert!(arb.on_connected_devices(list.clone()).is_empty());
      assert!(arb.on_connected_devices(list).is_empty());
      assert_eq!(arb.state(), OwnershipState::Unowned);
   }

   #[test]
   fn test_nearby_ui_is_informational() {
      let now = Instant::now();
      let mut arb = owned_arbitrator(now);
      assert_eq!(
         arb.on_nearby_ui(PEER_MAC),
         vec![Action::Emit(HandoffEvent::PeerAnnounced {
            peer: SmolStr::new_static(UNKNOWN_PEER_NAME)
         })]
      );
      assert_eq!(arb.state(), OwnershipState::Owned);
   }

   #[test]
   fn test_foreign_audio_source_releases_once() {
      let now = Instant::now();
      let mut arb = connected_arbitrator(now);
      let source = AudioSource {
         mac: PEER_MAC,
         kind: AudioSourceKind::Media,
      };
      assert_eq!(
         arb.on_audio_source(source),
         vec![Action::Send(Command::OwnershipClaim(false))]
      );
      assert!(arb.on_audio_source(source).is_empty());

      let mut owned = owned_arbitrator(now);
      assert!(owned.on_audio_source(source).is_empty());
   }

   #[test]
   fn test_session_down_resets() {
      let now = Instant::now();
      let mut arb = owned_arbitrator(now);
      arb.on_connected_devices(peers(&[PEER_MAC]));
      let actions = arb.on_session_down();
      assert_eq!(
         actions,
         vec![
            Action::DisconnectAudio,
            Action::Emit(HandoffEvent::OwnershipLost)
         ]
      );
      assert_eq!(arb.state(), OwnershipState::Unowned);
      assert!(arb.peers().is_empty());
      assert!(!arb.is_session_up());
   }

   #[test]
   fn test_connect_when_unclaimed() {
      let now = Instant::now();
      let mut config = ArbitratorConfig::new(SELF_MAC);
      config.connect_when_unclaimed = true;
      let mut arb = OwnershipArbitrator::new(config);

      let idle = status(ConnectionState::Disconnected, false);
      assert_eq!(arb.on_broadcast(Some(idle), now), vec![Action::Connect]);
      assert!(arb.on_broadcast(Some(idle), now).is_empty());

      arb.on_session_failed(now, Duration::from_secs(4));
      assert!(arb.on_broadcast(Some(idle), now + Duration::from_secs(1)).is_empty());
      assert_eq!(
         arb.on_broadcast(Some(idle), now + Duration::from_secs(4)),
         vec![Action::Connect]
      );
   }
}
