//! AACP session establishment.
//!
//! Opening a session means connecting the control channel and running the
//! handshake sequence that makes the accessory start reporting state.

use std::time::Duration;

use bluer::Address;
use log::{error, info, warn};
use tokio::{
   io::{AsyncRead, AsyncWrite},
   sync::mpsc,
   task::JoinSet,
   time,
};

use crate::{
   airpods::protocol::{Command, PacketKind, ProximityKeyKind},
   bluetooth::l2cap::{self, Hooks, L2CapReceiver, L2CapSender},
   error::{HandoffError, Result},
};

/// Silence after which a handshake step is considered unanswered
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Handshake attempts before giving up
const HANDSHAKE_ATTEMPTS: usize = 2;

struct Acks {
   handshake: mpsc::UnboundedReceiver<()>,
   features: mpsc::UnboundedReceiver<()>,
}

fn ack_hooks() -> (Hooks, Acks) {
   let (hs_tx, handshake) = mpsc::unbounded_channel();
   let (feat_tx, features) = mpsc::unbounded_channel();
   let hooks = Hooks::new()
      .on_kind(PacketKind::HandshakeAck, move |_| {
         let _ = hs_tx.send(());
      })
      .on_kind(PacketKind::FeaturesAck, move |_| {
         let _ = feat_tx.send(());
      });
   (hooks, Acks { handshake, features })
}

async fn wait_for_ack(rx: &mut mpsc::UnboundedReceiver<()>) -> Result<()> {
   time::timeout(ACK_TIMEOUT, rx.recv())
      .await
      .map_err(|_| HandoffError::RequestTimeout)?
      .ok_or(HandoffError::ConnectionClosed)
}

/// Connects to `address` and completes the handshake.
pub async fn open(
   jset: &mut JoinSet<()>,
   address: Address,
   stem_mask: u8,
) -> Result<(L2CapReceiver, L2CapSender)> {
   let (hooks, acks) = ack_hooks();
   let (receiver, sender) = l2cap::connect(jset, hooks, address, None).await?;
   handshake(&sender, acks, address, stem_mask).await?;
   Ok((receiver, sender))
}

/// Runs the handshake over an already connected stream.
pub async fn open_stream<S>(
   jset: &mut JoinSet<()>,
   address: Address,
   stream: S,
   stem_mask: u8,
) -> Result<(L2CapReceiver, L2CapSender)>
where
   S: AsyncRead + AsyncWrite + Send + 'static,
{
   let (hooks, acks) = ack_hooks();
   let (receiver, sender) = l2cap::spawn(jset, hooks, address, stream);
   handshake(&sender, acks, address, stem_mask).await?;
   Ok((receiver, sender))
}

async fn handshake(
   sender: &L2CapSender,
   mut acks: Acks,
   address: Address,
   stem_mask: u8,
) -> Result<()> {
   info!("{address}: Starting handshake sequence...");

   let mut acknowledged = false;
   for attempt in 1..=HANDSHAKE_ATTEMPTS {
      if let Err(e) = sender.send_command(&Command::Handshake).await {
         error!("{address}: Failed to send handshake: {e:?}");
         return Err(e);
      }
      match wait_for_ack(&mut acks.handshake).await {
         Ok(()) => {
            info!("{address}: Handshake acknowledged");
            acknowledged = true;
            break;
         },
         Err(HandoffError::RequestTimeout) => {
            warn!(
               "{address}: No handshake acknowledgment (attempt {attempt}/{HANDSHAKE_ATTEMPTS})"
            );
         },
         Err(e) => return Err(e),
      }
   }
   if !acknowledged {
      return Err(HandoffError::RequestTimeout);
   }

   sender.send_command(&Command::SetFeatureFlags).await?;
   match wait_for_ack(&mut acks.features).await {
      Ok(()) => info!("{address}: Features acknowledged"),
      Err(HandoffError::RequestTimeout) => {
         warn!("{address}: No features acknowledgment received, continuing anyway...");
      },
      Err(e) => return Err(e),
   }

   sender
      .send_command(&Command::RequestNotifications)
      .await?;
   let keys = ProximityKeyKind::Irk as u8 | ProximityKeyKind::EncKey as u8;
   sender
      .send_command(&Command::RequestProximityKeys(keys))
      .await?;
   sender.send_command(&Command::StemConfig(stem_mask)).await?;

   info!("{address}: Handshake sequence completed");
   Ok(())
}
