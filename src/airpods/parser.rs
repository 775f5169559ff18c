//! Typed payload parsing for AACP packets.
//!
//! The codec hands out packets with their payload already isolated from the
//! frame header; the functions here turn those payloads into typed values.

use std::str;

use bluer::Address;
use log::{debug, warn};
use serde::Serialize;
use smallvec::SmallVec;
use smol_str::{SmolStr, format_smolstr};
use thiserror::Error;

use crate::{
   airpods::protocol::{
      AudioSourceKind, BatteryInfo, BatteryState, BatteryStatus, Bud, Component,
      ControlCommandId, EarDetectionStatus, NoiseControlMode, PressType, ProximityKeyKind,
      SR_REVERSE_BANNER_TAPPED, mac_from_wire,
   },
   error::Result,
};

/// Error type for protocol parsing.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 0-3)")]
   InvalidBatteryCount { count: u8 },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   /// Unknown noise control mode
   #[error("Unknown noise control mode: 0x{mode:02x}")]
   UnknownNoiseMode { mode: u8 },

   #[error("Unknown stem press: type=0x{press:02x} bud=0x{bud:02x}")]
   UnknownStemPress { press: u8, bud: u8 },

   #[error("Unknown audio source type: 0x{kind:02x}")]
   UnknownAudioSource { kind: u8 },

   /// Generic invalid packet format
   #[error("Invalid packet format: {reason}")]
   InvalidFormat { reason: &'static str },
}

fn ensure_len(data: &[u8], expected: usize) -> Result<()> {
   if data.len() < expected {
      return Err(
         ProtoError::PacketTooShort {
            expected,
            actual: data.len(),
         }
         .into(),
      );
   }
   Ok(())
}

fn read_mac(data: &[u8]) -> Result<Address> {
   ensure_len(data, 6)?;
   let mut mac = [0u8; 6];
   mac.copy_from_slice(&data[..6]);
   Ok(mac_from_wire(mac))
}

/// Parses a battery status payload.
///
/// The payload contains battery information for up to 3 components
/// (left, right, case).
pub fn parse_battery_status(data: &[u8]) -> Result<BatteryInfo> {
   ensure_len(data, 1)?;

   let battery_count = data[0];
   let expected_length = 1 + 5 * battery_count as usize;

   debug!("Battery payload: {}", hex::encode(data));

   if battery_count > 3 {
      return Err(
         ProtoError::InvalidBatteryCount {
            count: battery_count,
         }
         .into(),
      );
   }

   if data.len() != expected_length {
      return Err(
         ProtoError::PacketSizeMismatch {
            expected: expected_length,
            actual: data.len(),
         }
         .into(),
      );
   }

   let mut battery_info = BatteryInfo::new();

   for entry in data[1..].chunks_exact(5) {
      let &[id, _, level, status, _] = entry else {
         continue;
      };

      let Some(component) = Component::from_repr(id) else {
         warn!("Unknown component type 0x{id:02x}");
         continue;
      };

      let bat_status = BatteryStatus::from_repr(status).unwrap_or_else(|| {
         warn!(
            "Unknown battery status 0x{status:02x} for component {component}, treating as Normal"
         );
         BatteryStatus::Normal
      });

      if bat_status != BatteryStatus::Disconnected {
         let battery_state = BatteryState {
            level: level.min(100),
            status: bat_status,
         };

         match component {
            Component::Left => battery_info.left = battery_state,
            Component::Right => battery_info.right = battery_state,
            Component::Case => battery_info.case = battery_state,
         }
      }
   }
   debug!("Battery parsed - {battery_info}");
   Ok(battery_info)
}

/// Parses an ear detection payload: `[primary][secondary]`, 0x00 = in ear.
pub fn parse_ear_detection(data: &[u8]) -> Result<EarDetectionStatus> {
   ensure_len(data, 2)?;
   Ok(EarDetectionStatus::new(data[0] == 0x00, data[1] == 0x00))
}

/// A control command setting as reported by the accessory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommandUpdate {
   pub id: ControlCommandId,
   pub value: SmallVec<[u8; 4]>,
}

/// Parses a control command payload: `[id][value:1..4]`.
pub fn parse_control_command(data: &[u8]) -> Result<ControlCommandUpdate> {
   ensure_len(data, 2)?;
   let end = data.len().min(5);
   Ok(ControlCommandUpdate {
      id: ControlCommandId::from_id(data[0]),
      value: SmallVec::from_slice(&data[1..end]),
   })
}

/// Interprets an `OWNS_CONNECTION` value.
pub fn parse_ownership(value: &[u8]) -> Result<bool> {
   match value.first() {
      Some(0x01) => Ok(true),
      Some(0x00) => Ok(false),
      Some(_) => Err(
         ProtoError::InvalidFormat {
            reason: "ownership value out of range",
         }
         .into(),
      ),
      None => Err(
         ProtoError::PacketTooShort {
            expected: 1,
            actual: 0,
         }
         .into(),
      ),
   }
}

/// Interprets a `LISTENING_MODE` value.
pub fn parse_noise_mode(value: &[u8]) -> Result<NoiseControlMode> {
   ensure_len(value, 1)?;
   let mode = value[0];
   let Some(mode) = NoiseControlMode::from_repr(mode) else {
      return Err(ProtoError::UnknownNoiseMode { mode }.into());
   };
   Ok(mode)
}

/// A peer controller asking this controller to give up ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
   pub sender: Address,
   /// The user tapped the reverse banner on the peer.
   pub reversed: bool,
}

pub fn parse_claim_request(data: &[u8]) -> Result<ClaimRequest> {
   let sender = read_mac(data)?;
   let reversed = data[6..]
      .windows(SR_REVERSE_BANNER_TAPPED.len())
      .any(|w| w == SR_REVERSE_BANNER_TAPPED);
   Ok(ClaimRequest { sender, reversed })
}

/// Parses the announcing peer out of a `ShowNearbyUI` payload.
pub fn parse_nearby_ui(data: &[u8]) -> Result<Address> {
   read_mac(data)
}

/// Current audio source of the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSource {
   pub mac: Address,
   pub kind: AudioSourceKind,
}

/// Parses an audio source payload: `[mac:6][type]`.
pub fn parse_audio_source(data: &[u8]) -> Result<AudioSource> {
   ensure_len(data, 7)?;
   let mac = read_mac(data)?;
   let Some(kind) = AudioSourceKind::from_repr(data[6]) else {
      return Err(ProtoError::UnknownAudioSource { kind: data[6] }.into());
   };
   Ok(AudioSource { mac, kind })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StemPress {
   pub bud: Bud,
   pub press: PressType,
}

/// Parses a stem press payload: `[press type][bud]`.
pub fn parse_stem_press(data: &[u8]) -> Result<StemPress> {
   ensure_len(data, 2)?;
   match (PressType::from_repr(data[0]), Bud::from_repr(data[1])) {
      (Some(press), Some(bud)) => Ok(StemPress { bud, press }),
      _ => Err(
         ProtoError::UnknownStemPress {
            press: data[0],
            bud: data[1],
         }
         .into(),
      ),
   }
}

/// Another controller currently connected to the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDevice {
   pub mac: Address,
   pub info1: u8,
   pub info2: u8,
}

impl PeerDevice {
   /// Name shown for the peer: its address and the two info bytes the accessory reports.
   pub fn display_name(&self) -> SmolStr {
      format_smolstr!("{} ({:02x}:{:02x})", self.mac, self.info1, self.info2)
   }
}

pub const MAX_PEERS: usize = 16;

pub type PeerList = heapless::Vec<PeerDevice, MAX_PEERS>;

/// Parses a connected devices payload: `[reserved:2][count]` followed by
/// `[mac:6][info1][info2]` entries.
pub fn parse_connected_devices(data: &[u8]) -> Result<PeerList> {
   ensure_len(data, 3)?;
   let count = data[2] as usize;
   let expected = 3 + count * 8;
   if data.len() < expected {
      return Err(
         ProtoError::PacketSizeMismatch {
            expected,
            actual: data.len(),
         }
         .into(),
      );
   }

   let mut peers = PeerList::new();
   for entry in data[3..expected].chunks_exact(8) {
      let peer = PeerDevice {
         mac: read_mac(entry)?,
         info1: entry[6],
         info2: entry[7],
      };
      if peers.push(peer).is_err() {
         warn!("Connected devices list exceeds {MAX_PEERS} entries, truncating");
         break;
      }
   }
   Ok(peers)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityKey {
   pub kind: ProximityKeyKind,
   pub key: SmallVec<[u8; 16]>,
}

/// Parses a proximity keys response: `[count]` followed by
/// `[type][reserved][len][reserved][key:len]` entries.
pub fn parse_proximity_keys(data: &[u8]) -> Result<SmallVec<[ProximityKey; 2]>> {
   ensure_len(data, 1)?;
   let count = data[0];
   let mut keys = SmallVec::new();
   let mut rest = &data[1..];
   for _ in 0..count {
      ensure_len(rest, 4)?;
      let kind = rest[0];
      let len = rest[2] as usize;
      ensure_len(rest, 4 + len)?;
      let key = &rest[4..4 + len];
      match ProximityKeyKind::from_repr(kind) {
         Some(kind) => keys.push(ProximityKey {
            kind,
            key: SmallVec::from_slice(key),
         }),
         None => debug!("Skipping proximity key of type 0x{kind:02x}"),
      }
      rest = &rest[4 + len..];
   }
   Ok(keys)
}

/// Parses a conversation awareness payload into its level byte.
pub fn parse_conversation_awareness(data: &[u8]) -> Result<u8> {
   ensure_len(data, 1)?;
   Ok(data[0])
}

/// Identification strings reported by the accessory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInformation {
   pub name: SmolStr,
   pub model_number: SmolStr,
   pub manufacturer: SmolStr,
   pub serial_number: SmolStr,
   pub firmware_version: SmolStr,
   pub left_serial: SmolStr,
   pub right_serial: SmolStr,
}

/// Parses a device information payload made of null separated strings.
pub fn parse_device_info(data: &[u8]) -> Result<DeviceInformation> {
   let mut fields = data
      .split(|&b| b == 0)
      .filter(|s| !s.is_empty())
      .filter_map(|s| str::from_utf8(s).ok())
      .filter(|s| s.chars().all(|c| !c.is_control()))
      .map(SmolStr::new);

   let name = fields.next().ok_or(ProtoError::InvalidFormat {
      reason: "device information carries no strings",
   })?;
   let mut next = || fields.next().unwrap_or_default();
   Ok(DeviceInformation {
      name,
      model_number: next(),
      manufacturer: next(),
      serial_number: next(),
      firmware_version: next(),
      left_serial: next(),
      right_serial: next(),
   })
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::error::HandoffError;

   #[test]
   fn test_parse_battery() {
      let payload = [
         0x03, 0x04, 0x01, 0x55, 0x02, 0x01, 0x02, 0x01, 0x50, 0x01, 0x01, 0x08, 0x01, 0x20,
         0x01, 0x01,
      ];
      let info = parse_battery_status(&payload).unwrap();
      assert_eq!(info.left.level, 85);
      assert_eq!(info.left.status, BatteryStatus::Discharging);
      assert_eq!(info.right.level, 80);
      assert!(info.right.is_charging());
      assert_eq!(info.case.level, 32);
   }

   #[test]
   fn test_parse_battery_rejects_bad_count() {
      let err = parse_battery_status(&[0x04]).unwrap_err();
      assert!(matches!(
         err,
         HandoffError::Proto(ProtoError::InvalidBatteryCount { count: 4 })
      ));
      assert!(parse_battery_status(&[0x01, 0x04, 0x01]).is_err());
   }

   #[test]
   fn test_parse_ear_detection() {
      let status = parse_ear_detection(&[0x00, 0x02]).unwrap();
      assert!(status.is_left_in_ear());
      assert!(!status.is_right_in_ear());
      assert!(parse_ear_detection(&[0x00]).is_err());
   }

   #[test]
   fn test_parse_control_command_and_ownership() {
      let update = parse_control_command(&[0x06, 0x01, 0x00, 0x00, 0x00]).unwrap();
      assert_eq!(update.id, ControlCommandId::OWNS_CONNECTION);
      assert!(parse_ownership(&update.value).unwrap());
      assert!(!parse_ownership(&[0x00]).unwrap());
      assert!(parse_ownership(&[0x07]).is_err());
   }

   #[test]
   fn test_parse_noise_mode() {
      assert_eq!(parse_noise_mode(&[0x02]).unwrap(), NoiseControlMode::NC);
      assert!(parse_noise_mode(&[0x09]).is_err());
   }

   #[test]
   fn test_parse_claim_request() {
      let mut payload = vec![0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
      payload.extend_from_slice(b"SetOwnershipToFalse ReverseBannerTapped");
      let req = parse_claim_request(&payload).unwrap();
      assert_eq!(req.sender.to_string(), "11:22:33:44:55:66");
      assert!(req.reversed);

      payload.truncate(6);
      payload.extend_from_slice(b"SetOwnershipToFalse");
      assert!(!parse_claim_request(&payload).unwrap().reversed);
   }

   #[test]
   fn test_parse_audio_source() {
      let source =
         parse_audio_source(&[0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x02]).unwrap();
      assert_eq!(source.mac.to_string(), "01:02:03:04:05:06");
      assert_eq!(source.kind, AudioSourceKind::Media);
   }

   #[test]
   fn test_parse_stem_press() {
      let press = parse_stem_press(&[0x06, 0x02]).unwrap();
      assert_eq!(press.press, PressType::Double);
      assert_eq!(press.bud, Bud::Right);
      assert!(parse_stem_press(&[0x01, 0x02]).is_err());
   }

   #[test]
   fn test_parse_connected_devices() {
      let payload = [
         0x00, 0x00, 0x02, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 0x01, 0x00, 0xff, 0xee, 0xdd,
         0xcc, 0xbb, 0xaa, 0x02, 0x01,
      ];
      let peers = parse_connected_devices(&payload).unwrap();
      assert_eq!(peers.len(), 2);
      assert_eq!(peers[0].mac.to_string(), "01:02:03:04:05:06");
      assert_eq!(peers[1].mac.to_string(), "AA:BB:CC:DD:EE:FF");
      assert_eq!(peers[1].info1, 0x02);
      assert!(parse_connected_devices(&payload[..10]).is_err());
   }

   #[test]
   fn test_parse_proximity_keys() {
      let mut payload = vec![0x02, 0x01, 0x00, 0x04, 0x00, 1, 2, 3, 4];
      payload.extend_from_slice(&[0x04, 0x00, 0x02, 0x00, 9, 9]);
      let keys = parse_proximity_keys(&payload).unwrap();
      assert_eq!(keys.len(), 2);
      assert_eq!(keys[0].kind, ProximityKeyKind::Irk);
      assert_eq!(keys[0].key.as_slice(), &[1, 2, 3, 4]);
      assert_eq!(keys[1].kind, ProximityKeyKind::EncKey);
      assert!(parse_proximity_keys(&payload[..7]).is_err());
   }

   #[test]
   fn test_parse_device_info() {
      let payload = b"Jane's AirPods\0A2084\0Apple Inc.\0GX1234\06F21\0";
      let info = parse_device_info(payload).unwrap();
      assert_eq!(info.name, "Jane's AirPods");
      assert_eq!(info.model_number, "A2084");
      assert_eq!(info.firmware_version, "6F21");
      assert_eq!(info.left_serial, "");
      assert!(parse_device_info(&[0, 0]).is_err());
   }
}
