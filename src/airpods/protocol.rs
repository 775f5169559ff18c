//! AACP protocol definitions and data structures.
//!
//! This module contains the frame layout constants, opcodes, control command
//! identifiers and the value types shared by the codec, the parsers and the
//! ownership arbitration logic.

use std::{fmt, num::NonZeroU8, str::FromStr, sync::LazyLock};

use bluer::Address;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Channel used by the connect request.
pub const CHANNEL_CONNECT: u16 = 0x0000;
/// Channel used by the accessory to acknowledge the connect request.
pub const CHANNEL_CONNECT_ACK: u16 = 0x0001;
/// Channel carrying all regular AACP traffic.
pub const CHANNEL_DATA: u16 = 0x0004;
/// Protocol marker following the channel in every frame.
pub const FRAME_MARKER: u16 = 0x0004;
/// `[channel:2][marker:2][opcode:2][payload_len:2]`
pub const FRAME_HEADER_LEN: usize = 8;
/// L2CAP MTU (672) minus the frame header.
pub const MAX_PAYLOAD_LEN: usize = 664;

/// Opcode of an AACP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Opcode(u16);

impl Opcode {
   pub const HANDSHAKE: Self = Self(0x01);
   pub const BATTERY: Self = Self(0x04);
   pub const EAR_DETECTION: Self = Self(0x06);
   pub const CONTROL_COMMAND: Self = Self(0x09);
   pub const AUDIO_SOURCE: Self = Self(0x0E);
   pub const REQUEST_NOTIFY: Self = Self(0x0F);
   pub const SMART_ROUTING: Self = Self(0x10);
   pub const SMART_ROUTING_RESP: Self = Self(0x11);
   pub const HEAD_TRACKING: Self = Self(0x17);
   pub const STEM_PRESS: Self = Self(0x19);
   pub const DEVICE_INFO: Self = Self(0x1D);
   pub const FEATURES_ACK: Self = Self(0x2B);
   pub const CONNECTED_DEVICES: Self = Self(0x2E);
   pub const PROXIMITY_KEYS_REQ: Self = Self(0x30);
   pub const PROXIMITY_KEYS_RSP: Self = Self(0x31);
   pub const CONVERSATION_AWARENESS: Self = Self(0x4B);
   pub const SET_FEATURES: Self = Self(0x4D);

   pub const fn from_raw(raw: u16) -> Self {
      Self(raw)
   }

   pub const fn raw(self) -> u16 {
      self.0
   }
}

impl fmt::Display for Opcode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "0x{:04x}", self.0)
   }
}

/// Kind of a decoded inbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum PacketKind {
   HandshakeAck,
   FeaturesAck,
   Battery,
   EarDetection,
   ConversationAwareness,
   ControlCommand,
   OwnershipChange,
   OwnershipClaimRequest,
   ShowNearbyUI,
   DeviceInformation,
   HeadTracking,
   ProximityKeys,
   StemPress,
   AudioSource,
   ConnectedDevicesList,
   Unknown,
}

pub const KNOWN_CONTROL_COMMANDS: &[(u8, &str)] = &[
   (ControlCommandId::MIC_MODE.id(), "mic_mode"),
   (ControlCommandId::OWNS_CONNECTION.id(), "owns_connection"),
   (ControlCommandId::EAR_DETECTION_CONFIG.id(), "ear_detection"),
   (ControlCommandId::LISTENING_MODE.id(), "listening_mode"),
   (ControlCommandId::ONE_BUD_ANC.id(), "one_bud_anc"),
   (ControlCommandId::VOLUME_SWIPE_INTERVAL.id(), "volume_interval"),
   (ControlCommandId::VOLUME_SWIPE.id(), "volume_swipe"),
   (ControlCommandId::ADAPTIVE_VOLUME.id(), "adaptive_volume"),
   (ControlCommandId::CONVERSATION_DETECT.id(), "conversational"),
   (ControlCommandId::HEARING_ASSIST.id(), "hearing_assist"),
   (ControlCommandId::ALLOW_OFF.id(), "allow_off"),
   (ControlCommandId::STEM_CONFIG.id(), "stem_config"),
];

/// Identifier of a control command (opcode 0x09) setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ControlCommandId(u8);

impl FromStr for ControlCommandId {
   type Err = strum::ParseError;

   fn from_str(s: &str) -> Result<Self, Self::Err> {
      for (repr, name) in KNOWN_CONTROL_COMMANDS {
         if name.eq_ignore_ascii_case(s) {
            return Ok(Self(*repr));
         }
      }
      Err(strum::ParseError::VariantNotFound)
   }
}

static U8_TO_HEX: LazyLock<[[u8; 2]; 256]> = LazyLock::new(|| {
   let mut ids = [[0u8; 2]; 256];
   for i in 0..=255u8 {
      const fn nibble_to_hex(n: u8) -> u8 {
         if n < 10 { n + b'0' } else { n - 10 + b'a' }
      }
      ids[i as usize] = [nibble_to_hex(i >> 4), nibble_to_hex(i & 0x0f)];
   }
   ids
});

impl ControlCommandId {
   pub const MIC_MODE: Self = Self(0x01);
   pub const OWNS_CONNECTION: Self = Self(0x06);
   pub const EAR_DETECTION_CONFIG: Self = Self(0x0A);
   pub const LISTENING_MODE: Self = Self(0x0D);
   pub const ONE_BUD_ANC: Self = Self(0x1B);
   pub const VOLUME_SWIPE_INTERVAL: Self = Self(0x23);
   pub const VOLUME_SWIPE: Self = Self(0x25);
   pub const ADAPTIVE_VOLUME: Self = Self(0x26);
   pub const CONVERSATION_DETECT: Self = Self(0x28);
   pub const HEARING_ASSIST: Self = Self(0x33);
   pub const ALLOW_OFF: Self = Self(0x34);
   pub const STEM_CONFIG: Self = Self(0x39);

   pub const fn from_id(repr: u8) -> Self {
      Self(repr)
   }

   pub const fn id(self) -> u8 {
      self.0
   }

   pub fn try_to_str(self) -> Option<&'static str> {
      KNOWN_CONTROL_COMMANDS
         .iter()
         .find(|(repr, _)| *repr == self.0)
         .map(|(_, name)| *name)
   }

   pub fn to_str(self) -> &'static str {
      if let Some(name) = self.try_to_str() {
         name
      } else {
         let bytes = &U8_TO_HEX[self.0 as usize];
         str::from_utf8(bytes).unwrap_or("??")
      }
   }
}

impl fmt::Display for ControlCommandId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.to_str())
   }
}

/// Represents different components of `AirPods`.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery status for `AirPods` components.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Noise control modes supported by `AirPods`.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0x01,
   #[strum(serialize = "nc")]
   NC = 0x02,
   #[strum(serialize = "trans", serialize = "transparency")]
   Trans = 0x03,
   #[strum(serialize = "adapt", serialize = "adaptive")]
   Adapt = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Battery state for a single `AirPods` component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

/// Complete battery information for all `AirPods` components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         left: BatteryState::new(),
         right: BatteryState::new(),
         case: BatteryState::new(),
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": u32::from(self.left.level),
          "right_level": u32::from(self.right.level),
          "case_level": u32::from(self.case.level),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

impl fmt::Display for BatteryInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "L:{}% R:{}% C:{}%",
         self.left.level, self.right.level, self.case.level
      )
   }
}

/// Ear detection status for left and right `AirPods`.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct EarDetectionStatus(NonZeroU8);

impl EarDetectionStatus {
   pub const LEFT: u8 = 1 << 0;
   pub const RIGHT: u8 = 1 << 1;
   pub const VALID: u8 = 0x80;

   pub const fn new(left_in_ear: bool, right_in_ear: bool) -> Self {
      let mut flags = Self::VALID;
      if left_in_ear {
         flags |= Self::LEFT;
      }
      if right_in_ear {
         flags |= Self::RIGHT;
      }
      match NonZeroU8::new(flags) {
         Some(flags) => Self(flags),
         None => unreachable!(),
      }
   }

   pub const fn is_left_in_ear(&self) -> bool {
      self.0.get() & Self::LEFT != 0
   }

   pub const fn is_right_in_ear(&self) -> bool {
      self.0.get() & Self::RIGHT != 0
   }

   pub const fn any_in_ear(&self) -> bool {
      self.is_left_in_ear() || self.is_right_in_ear()
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_in_ear": self.is_left_in_ear(),
          "right_in_ear": self.is_right_in_ear(),
      })
   }
}

/// Accessory connection state as reported in proximity broadcasts.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
   Disconnected = 0x00,
   Idle = 0x04,
   Music = 0x05,
   Call = 0x06,
   Ringing = 0x07,
   HangingUp = 0x09,
}

/// Why the host asks the controller to take over the audio route.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TakeoverReason {
   MusicStart,
   CallRinging,
}

/// Which bud a stem press originated from.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum Bud {
   Left = 0x01,
   Right = 0x02,
}

/// Stem press gesture.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumIter,
)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum PressType {
   Single = 0x05,
   Double = 0x06,
   Triple = 0x07,
   Long = 0x08,
}

impl PressType {
   /// Bit used for this press in the stem configuration mask.
   pub const fn config_bit(self) -> u8 {
      match self {
         Self::Single => 0x01,
         Self::Double => 0x02,
         Self::Triple => 0x04,
         Self::Long => 0x08,
      }
   }
}

/// Abstract action bound to a stem press.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StemAction {
   PlayPause,
   PreviousTrack,
   NextTrack,
   DigitalAssistant,
   CycleNoiseControlModes,
}

impl StemAction {
   /// Action the accessory performs on its own when the press is not forwarded.
   pub const fn default_for(press: PressType) -> Self {
      match press {
         PressType::Single => Self::PlayPause,
         PressType::Double => Self::NextTrack,
         PressType::Triple => Self::PreviousTrack,
         PressType::Long => Self::CycleNoiseControlModes,
      }
   }

   /// Whether the action drives media shared with the other controllers.
   pub const fn affects_shared_media(self) -> bool {
      matches!(self, Self::PlayPause | Self::PreviousTrack | Self::NextTrack)
   }
}

/// Kind of the accessory's current audio source.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum AudioSourceKind {
   None = 0x00,
   Call = 0x01,
   Media = 0x02,
}

/// Proximity key types exchanged over AACP.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum ProximityKeyKind {
   Irk = 0x01,
   EncKey = 0x04,
}

/// Outbound AACP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   /// Capability/identification message opening the session.
   Handshake,
   SetFeatureFlags,
   RequestNotifications,
   /// Bitwise OR of [`ProximityKeyKind`] values.
   RequestProximityKeys(u8),
   ControlCommand {
      id: ControlCommandId,
      value: [u8; 4],
   },
   /// Claims (`true`) or releases (`false`) audio ownership.
   OwnershipClaim(bool),
   MediaInformation {
      sender: Address,
      target: Address,
   },
   HijackRequest {
      sender: Address,
   },
   /// Introduces this controller to a newly connected peer.
   AddPeer {
      sender: Address,
      target: Address,
   },
   /// Bitmask of [`PressType::config_bit`] presses forwarded to the host.
   StemConfig(u8),
}

impl Command {
   pub const fn name(&self) -> &'static str {
      match self {
         Self::Handshake => "handshake",
         Self::SetFeatureFlags => "set_feature_flags",
         Self::RequestNotifications => "request_notifications",
         Self::RequestProximityKeys(_) => "request_proximity_keys",
         Self::ControlCommand { .. } => "control_command",
         Self::OwnershipClaim(_) => "ownership_claim",
         Self::MediaInformation { .. } => "media_information",
         Self::HijackRequest { .. } => "hijack_request",
         Self::AddPeer { .. } => "add_peer",
         Self::StemConfig(_) => "stem_config",
      }
   }
}

// Smart routing markers carried in 0x10/0x11 bodies
pub const SR_SET_OWNERSHIP_TO_FALSE: &[u8] = b"SetOwnershipToFalse";
pub const SR_REVERSE_BANNER_TAPPED: &[u8] = b"ReverseBannerTapped";
pub const SR_SHOW_NEARBY_UI: &[u8] = b"ShowNearbyUI";

/// Writes an address in the little-endian byte order used on the wire.
pub fn mac_to_wire(address: Address) -> [u8; 6] {
   let mut bytes = address.0;
   bytes.reverse();
   bytes
}

/// Reads an address from its little-endian wire representation.
pub fn mac_from_wire(bytes: [u8; 6]) -> Address {
   let mut bytes = bytes;
   bytes.reverse();
   Address::new(bytes)
}
