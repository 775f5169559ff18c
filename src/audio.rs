//! Audio route control.
//!
//! Owning the AACP route is only half of a takeover; the host must also bring
//! the A2DP profile up or down. [`AudioRoutePort`] is the capability the
//! controller drives for that.

use bluer::{Address, Session};
use log::{info, warn};
use uuid::Uuid;

/// Advanced Audio Distribution Profile sink
pub const A2DP_SINK_UUID: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);

/// Connects and disconnects the platform audio route to the accessory.
///
/// Calls must not block; implementations run the work in the background.
pub trait AudioRoutePort: Send + Sync {
   fn connect(&self);
   fn disconnect(&self);
}

/// Drives the A2DP profile of the accessory through BlueZ.
pub struct BluerAudioRoute {
   session: Session,
   address: Address,
}

impl BluerAudioRoute {
   pub fn new(session: Session, address: Address) -> Self {
      Self { session, address }
   }
}

impl AudioRoutePort for BluerAudioRoute {
   fn connect(&self) {
      let session = self.session.clone();
      let address = self.address;
      tokio::spawn(async move {
         let result = async {
            let adapter = session.default_adapter().await?;
            adapter.device(address)?.connect_profile(&A2DP_SINK_UUID).await
         }
         .await;
         match result {
            Ok(()) => info!("{address}: Audio route connected"),
            Err(e) => warn!("{address}: Failed to connect audio route: {e}"),
         }
      });
   }

   fn disconnect(&self) {
      let session = self.session.clone();
      let address = self.address;
      tokio::spawn(async move {
         let result = async {
            let adapter = session.default_adapter().await?;
            adapter.device(address)?.disconnect_profile(&A2DP_SINK_UUID).await
         }
         .await;
         match result {
            Ok(()) => info!("{address}: Audio route disconnected"),
            Err(e) => warn!("{address}: Failed to disconnect audio route: {e}"),
         }
      });
   }
}
