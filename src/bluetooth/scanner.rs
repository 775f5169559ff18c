//! LE advertisement scanning and accessory recognition.
//!
//! The scanner keeps a discovery session open on the adapter, decodes every
//! proximity-pairing record it sees and reports the resulting snapshots and
//! edges to the controller.

use std::time::{Duration, Instant};

use bluer::{
   Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport,
};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::{self, MissedTickBehavior};
use uuid::Uuid;

use crate::{
   airpods::broadcast::{self, APPLE_CID, AIRPOD_PIDS, BroadcastTracker, StatusCell},
   controller::Controller,
   error::Result,
};

/// Interval between disappearance checks
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Apple vendor ID
const APPLE_VID: u32 = 0x004C;

/// Patterns to match `AirPods` devices (case-insensitive)
const AIRPOD_PATTERNS: &[&str] = &["airpods", "beats", "powerbeats"];

/// Apple service UUIDs - Note: Not always advertised by AirPods
static APPLE_SERVICES: [Uuid; 2] = [
   Uuid::from_u128(0x0000fd6f_0000_1000_8000_00805f9b34fb), // Find My
   Uuid::from_u128(0x74ec2172_0bad_4d01_8f77_997b2be0722a), // AACP service record
];

/// Runs the scan loop until the adapter's event stream ends.
pub async fn run(
   adapter: Adapter,
   cell: StatusCell,
   controller: Controller,
   disappear_timeout: Duration,
) -> Result<()> {
   adapter
      .set_discovery_filter(DiscoveryFilter {
         transport: DiscoveryTransport::Le,
         duplicate_data: true,
         ..Default::default()
      })
      .await?;
   let mut events = adapter.discover_devices_with_changes().await?;
   info!("Scanning for accessory broadcasts on {}", adapter.name());

   let mut tracker = BroadcastTracker::new(cell, disappear_timeout);
   let mut tick = time::interval(TIMEOUT_CHECK_INTERVAL);
   tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

   loop {
      tokio::select! {
         _ = tick.tick() => {
            if let Some(edge) = tracker.check_timeout(Instant::now()) {
               info!("Accessory broadcasts stopped");
               controller.report_broadcast(None, [edge].into_iter().collect()).await;
            }
         }
         event = events.next() => {
            let Some(event) = event else {
               warn!("Discovery stream on {} ended", adapter.name());
               return Ok(());
            };
            let AdapterEvent::DeviceAdded(addr) = event else {
               continue;
            };
            let Some(data) = apple_manufacturer_data(&adapter, addr).await else {
               continue;
            };
            let Some(status) = broadcast::decode(addr, &data) else {
               continue;
            };
            if !status.is_known_model() {
               debug!("Ignoring proximity record of model 0x{:04x}", status.model);
               continue;
            }
            let edges = tracker.observe(status, Instant::now());
            if !edges.is_empty() {
               controller.report_broadcast(Some(status), edges).await;
            }
         }
      }
   }
}

async fn apple_manufacturer_data(adapter: &Adapter, addr: Address) -> Option<Vec<u8>> {
   let device = adapter.device(addr).ok()?;
   let mut data = device.manufacturer_data().await.ok().flatten()?;
   data.remove(&APPLE_CID)
}

/// Check if a paired device is an AACP accessory
pub async fn is_accessory(dev: &bluer::Device) -> bool {
   if let Ok(Some(modalias)) = dev.modalias().await
      && modalias.vendor == APPLE_VID
      && AIRPOD_PIDS.iter().any(|&pid| u32::from(pid) == modalias.product)
   {
      debug!(
         "Accessory detected via modalias: product={:#06x}",
         modalias.product
      );
      return true;
   }

   if let Ok(Some(uuids)) = dev.uuids().await
      && uuids.iter().any(|u| APPLE_SERVICES.contains(u))
   {
      debug!("Accessory detected via Apple service UUID");
      return true;
   }

   let name = match dev.name().await {
      Ok(Some(name)) => name,
      _ => dev.alias().await.unwrap_or_default(),
   };
   let name = name.to_ascii_lowercase();
   AIRPOD_PATTERNS.iter().any(|p| name.contains(p))
}

/// Finds the first paired accessory on `adapter`.
pub async fn find_paired_accessory(adapter: &Adapter) -> Result<Option<Address>> {
   for addr in adapter.device_addresses().await? {
      let Ok(device) = adapter.device(addr) else {
         continue;
      };
      if device.is_paired().await.unwrap_or(false) && is_accessory(&device).await {
         info!("Found paired accessory {addr}");
         return Ok(Some(addr));
      }
   }
   Ok(None)
}
