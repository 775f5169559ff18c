//! Passive accessory status from Apple proximity-pairing advertisements.
//!
//! The accessory advertises a compact status record in its LE manufacturer
//! data whenever it is out of the case or the lid is open. This module decodes
//! that record, tracks edges between consecutive records, and shares the
//! latest snapshot with the rest of the service.

use std::{
   sync::Arc,
   time::{Duration, Instant},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::debug;
use serde_json::json;
use smallvec::SmallVec;

use crate::airpods::protocol::ConnectionState;

/// Apple company ID for manufacturer data
pub const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type in manufacturer data
pub const PP_TYPE: u8 = 0x07;

/// Shortest proximity-pairing record carrying a connection state
pub const MIN_PAYLOAD_LEN: usize = 11;

/// Reported silence after which the accessory is considered gone
pub const DEFAULT_DISAPPEAR_TIMEOUT: Duration = Duration::from_secs(10);

/// Apple headphone product ids known to speak AACP
pub const AIRPOD_PIDS: &[u16] = &[
   0x2002, // AirPods (1st gen)
   0x200E, // AirPods Pro
   0x200F, // AirPods (2nd gen)
   0x2013, // AirPods (3rd gen)
   0x2014, // AirPods Pro (2nd gen)
   0x2024, // AirPods Pro (2nd gen, USB-C)
   0x200A, // AirPods Max
   0x201F, // AirPods Max (USB-C)
   0x2019, // AirPods 4
   0x201B, // AirPods 4 ANC
];

/// Snapshot of the accessory decoded from one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessoryStatus {
   pub address: Address,
   pub model: u16,
   pub primary_left: bool,
   pub left_battery: Option<u8>,
   pub right_battery: Option<u8>,
   pub case_battery: Option<u8>,
   pub left_charging: bool,
   pub right_charging: bool,
   pub case_charging: bool,
   pub left_in_ear: bool,
   pub right_in_ear: bool,
   pub lid_open: bool,
   /// `None` when the accessory reported a state we do not know.
   pub connection_state: Option<ConnectionState>,
}

impl AccessoryStatus {
   pub fn any_in_ear(&self) -> bool {
      self.left_in_ear || self.right_in_ear
   }

   pub fn is_known_model(&self) -> bool {
      AIRPOD_PIDS.contains(&self.model)
   }

   fn battery_eq(&self, other: &Self) -> bool {
      (
         self.left_battery,
         self.right_battery,
         self.case_battery,
         self.left_charging,
         self.right_charging,
         self.case_charging,
      ) == (
         other.left_battery,
         other.right_battery,
         other.case_battery,
         other.left_charging,
         other.right_charging,
         other.case_charging,
      )
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "address": self.address.to_string(),
          "model": format!("0x{:04x}", self.model),
          "left_battery": self.left_battery,
          "right_battery": self.right_battery,
          "case_battery": self.case_battery,
          "left_charging": self.left_charging,
          "right_charging": self.right_charging,
          "case_charging": self.case_charging,
          "left_in_ear": self.left_in_ear,
          "right_in_ear": self.right_in_ear,
          "lid_open": self.lid_open,
          "connection_state": self.connection_state.map(<&'static str>::from),
      })
   }
}

fn battery_level(nibble: u8) -> Option<u8> {
   match nibble {
      0..=10 => Some(nibble * 10),
      _ => None,
   }
}

/// Decodes the Apple manufacturer data (company id already stripped).
///
/// Returns `None` when the record is not a proximity-pairing status or is too
/// short to carry one.
pub fn decode(address: Address, data: &[u8]) -> Option<AccessoryStatus> {
   if data.len() < MIN_PAYLOAD_LEN || data[0] != PP_TYPE {
      debug!(
         "Ignoring manufacturer data from {address}: {}",
         hex::encode(data)
      );
      return None;
   }

   let model = u16::from_be_bytes([data[3], data[4]]);
   let status = data[5];
   let batteries = data[6];
   let charging = data[7] >> 4;
   let lid = data[8];

   let primary_left = status & 0x20 != 0;
   let primary_battery = battery_level(batteries & 0x0f);
   let secondary_battery = battery_level(batteries >> 4);
   let primary_in_ear = status & 0x02 != 0;
   let secondary_in_ear = status & 0x08 != 0;
   let primary_charging = charging & 0x01 != 0;
   let secondary_charging = charging & 0x02 != 0;

   let (left_battery, right_battery) = if primary_left {
      (primary_battery, secondary_battery)
   } else {
      (secondary_battery, primary_battery)
   };
   let (left_in_ear, right_in_ear) = if primary_left {
      (primary_in_ear, secondary_in_ear)
   } else {
      (secondary_in_ear, primary_in_ear)
   };
   let (left_charging, right_charging) = if primary_left {
      (primary_charging, secondary_charging)
   } else {
      (secondary_charging, primary_charging)
   };

   Some(AccessoryStatus {
      address,
      model,
      primary_left,
      left_battery,
      right_battery,
      case_battery: battery_level(data[7] & 0x0f),
      left_charging,
      right_charging,
      case_charging: charging & 0x04 != 0,
      left_in_ear,
      right_in_ear,
      lid_open: lid & 0x08 == 0,
      connection_state: ConnectionState::from_repr(data[10]),
   })
}

/// Shared latest-snapshot cell. Readers always see a whole snapshot.
#[derive(Clone, Default)]
pub struct StatusCell(Arc<AtomicCell<Option<AccessoryStatus>>>);

impl StatusCell {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn load(&self) -> Option<AccessoryStatus> {
      self.0.load()
   }

   pub fn store(&self, status: Option<AccessoryStatus>) {
      self.0.store(status);
   }
}

/// Transition detected between consecutive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum BroadcastEdge {
   LidOpened,
   LidClosed,
   BatteryChanged,
   EarStateChanged,
   DeviceDisappeared,
   /// The accessory rotated its resolvable private address.
   NewAddress(Address),
   StatusChanged,
}

pub type Edges = SmallVec<[BroadcastEdge; 4]>;

/// Tracks consecutive snapshots and reports edges between them.
pub struct BroadcastTracker {
   cell: StatusCell,
   last_seen: Option<Instant>,
   timeout: Duration,
}

impl BroadcastTracker {
   pub fn new(cell: StatusCell, timeout: Duration) -> Self {
      Self {
         cell,
         last_seen: None,
         timeout,
      }
   }

   pub fn cell(&self) -> &StatusCell {
      &self.cell
   }

   /// Publishes `status` and returns the edges relative to the previous one.
   pub fn observe(&mut self, status: AccessoryStatus, now: Instant) -> Edges {
      let previous = self.cell.load();
      self.cell.store(Some(status));
      self.last_seen = Some(now);

      let mut edges = Edges::new();
      let Some(prev) = previous else {
         if status.lid_open {
            edges.push(BroadcastEdge::LidOpened);
         }
         edges.push(BroadcastEdge::StatusChanged);
         return edges;
      };
      if prev == status {
         return edges;
      }

      if prev.address != status.address {
         edges.push(BroadcastEdge::NewAddress(status.address));
      }
      match (prev.lid_open, status.lid_open) {
         (false, true) => edges.push(BroadcastEdge::LidOpened),
         (true, false) => edges.push(BroadcastEdge::LidClosed),
         _ => {},
      }
      if !prev.battery_eq(&status) {
         edges.push(BroadcastEdge::BatteryChanged);
      }
      if (prev.left_in_ear, prev.right_in_ear) != (status.left_in_ear, status.right_in_ear) {
         edges.push(BroadcastEdge::EarStateChanged);
      }
      edges.push(BroadcastEdge::StatusChanged);
      edges
   }

   /// Reports `DeviceDisappeared` once the accessory has been silent too long.
   pub fn check_timeout(&mut self, now: Instant) -> Option<BroadcastEdge> {
      let last = self.last_seen?;
      if now.saturating_duration_since(last) < self.timeout {
         return None;
      }
      self.last_seen = None;
      self.cell.store(None);
      Some(BroadcastEdge::DeviceDisappeared)
   }
}
