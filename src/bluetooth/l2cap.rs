//! L2CAP stream transport for the AACP control channel.
//!
//! This module owns the socket, splits it into a read task that deframes
//! incoming bytes into packets and a write task that serializes outbound
//! frames, and exposes the receiving and sending halves to the session.

use std::time::Duration;

use bluer::{
   Address, AddressType,
   l2cap::{Socket, SocketAddr},
};
use log::{debug, warn};
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   airpods::{
      codec::{self, Frame, Packet, PacketCodec},
      protocol::{Command, PacketKind},
   },
   error::{HandoffError, Result},
};

/// PSM (Protocol Service Multiplexer) for the AACP control channel
pub const PSM_CONTROL: u16 = 0x1001;
/// Size of a single socket read
const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection attempts
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Outbound queue depth
const SEND_QUEUE: usize = 128;

enum Outbound {
   Send {
      data: Frame,
      then: oneshot::Sender<Result<()>>,
   },
   Post {
      data: Frame,
   },
}

/// Receiver half of an AACP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   /// Next decoded packet, or the error that ended the connection.
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(HandoffError::ConnectionClosed)?
   }
}

/// Sender half of an AACP connection.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Outbound>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   /// Writes `data` and waits until the socket accepted it.
   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(HandoffError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Outbound::Send {
            data: Frame::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| HandoffError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| HandoffError::RequestTimeout)?
         .map_err(|_| HandoffError::ConnectionClosed)?
   }

   pub async fn send_command(&self, command: &Command) -> Result<()> {
      self.send(&codec::encode(command)).await
   }

   /// Queues `data` without waiting. Fails instead of queueing when the
   /// connection is gone.
   pub fn post(&self, data: &[u8]) -> Result<()> {
      self
         .tx
         .try_send(Outbound::Post {
            data: Frame::from_slice(data),
         })
         .map_err(|e| match e {
            mpsc::error::TrySendError::Closed(_) => HandoffError::ConnectionClosed,
            mpsc::error::TrySendError::Full(_) => HandoffError::RequestTimeout,
         })
   }

   pub fn post_command(&self, command: &Command) -> Result<()> {
      self.post(&codec::encode(command))
   }
}

/// Callbacks run by the read task before packets are delivered.
pub struct Hooks {
   hooks: Vec<Hook>,
}

impl Default for Hooks {
   fn default() -> Self {
      Self::new()
   }
}

impl Hooks {
   pub const fn new() -> Self {
      Self { hooks: Vec::new() }
   }

   pub fn install(mut self, hook: Hook) -> Self {
      self.hooks.push(hook);
      self
   }

   pub fn on_kind<F>(self, kind: PacketKind, cb: F) -> Self
   where
      F: FnMut(&Packet) + Send + 'static,
   {
      self.install(Hook::every(cb).kind(kind))
   }

   pub fn passthrough(&mut self, packet: &Packet) {
      for hook in &mut self.hooks {
         hook.passthrough(packet);
      }
   }
}

pub type Callback = Box<dyn FnMut(&Packet) + Send>;

pub struct Hook {
   kind: Option<PacketKind>,
   cb: Callback,
}

impl Hook {
   pub fn every<F>(cb: F) -> Self
   where
      F: FnMut(&Packet) + Send + 'static,
   {
      Self {
         kind: None,
         cb: Box::new(cb),
      }
   }

   pub fn kind(mut self, kind: PacketKind) -> Self {
      self.kind = Some(kind);
      self
   }

   pub fn passthrough(&mut self, packet: &Packet) {
      if self.kind.is_none_or(|k| k == packet.kind) {
         (self.cb)(packet);
      }
   }
}

/// Opens the control channel to `address` and spawns its I/O tasks on `jset`.
pub async fn connect(
   jset: &mut JoinSet<()>,
   hooks: Hooks,
   address: Address,
   psm: Option<u16>,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_stream()?;
   let psm = psm.unwrap_or(PSM_CONTROL);
   let addr = SocketAddr::new(address, AddressType::BrEdr, psm);
   debug!("Connecting to {address}:{psm}");

   let stream = time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
      .await
      .map_err(|_| HandoffError::RequestTimeout)??;

   Ok(spawn(jset, hooks, address, stream))
}

/// Runs the transport over an already connected byte stream.
pub fn spawn<S>(
   jset: &mut JoinSet<()>,
   hooks: Hooks,
   address: Address,
   stream: S,
) -> (L2CapReceiver, L2CapSender)
where
   S: AsyncRead + AsyncWrite + Send + 'static,
{
   let (cmd_tx, cmd_rx) = mpsc::channel(SEND_QUEUE);
   let (in_tx, in_rx) = mpsc::channel(128);

   let (reader, writer) = tokio::io::split(stream);
   jset.spawn(recv_thread(address, in_tx, reader, hooks));
   jset.spawn(send_thread(address, cmd_rx, writer));

   (L2CapReceiver { rx: in_rx }, L2CapSender { tx: cmd_tx })
}

async fn recv_thread<R>(
   adr: Address,
   tx: mpsc::Sender<Result<Packet>>,
   mut reader: R,
   mut hooks: Hooks,
) where
   R: AsyncRead + Unpin,
{
   let mut codec = PacketCodec::new();
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      let n = match reader.read(&mut stack).await {
         Ok(0) => {
            warn!("{adr}: Connection closed by peer");
            let _ = tx.send(Err(HandoffError::ConnectionClosed)).await;
            return;
         },
         Ok(n) => n,
         Err(e) => {
            warn!("{adr}: Connection lost: {e}");
            let _ = tx.send(Err(HandoffError::ConnectionLost)).await;
            return;
         },
      };
      debug!("← {adr}: {}", hex::encode(&stack[..n]));
      for packet in codec.feed(&stack[..n]) {
         hooks.passthrough(&packet);
         if let Err(e) = tx.send(Ok(packet)).await {
            debug!("{adr}: Receiver dropped: {e:?}");
            return;
         }
      }
   }
}

async fn send_thread<W>(adr: Address, mut rx: mpsc::Receiver<Outbound>, mut writer: W)
where
   W: AsyncWrite + Unpin,
{
   async fn write<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
      time::timeout(WRITE_TIMEOUT, async {
         writer.write_all(data).await?;
         writer.flush().await
      })
      .await
      .map_err(|_| HandoffError::RequestTimeout)??;
      Ok(())
   }

   while let Some(cmd) = rx.recv().await {
      match cmd {
         Outbound::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            let result = write(&mut writer, &data).await;
            if let Err(e) = &result {
               warn!("{adr}: Failed to send data: {e}");
            }
            let _ = then.send(result);
         },
         Outbound::Post { data } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = write(&mut writer, &data).await {
               warn!("{adr}: Failed to send data: {e}");
            }
         },
      }
   }
   debug!("{adr}: Sender shut down");
   let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
   use std::sync::{
      Arc,
      atomic::{AtomicUsize, Ordering},
   };

   use tokio::io::duplex;

   use super::*;
   use crate::airpods::protocol::Opcode;

   #[tokio::test]
   async fn test_receive_split_packets() {
      let mut jset = JoinSet::new();
      let (local, mut remote) = duplex(1024);
      let (mut rx, _tx) = spawn(&mut jset, Hooks::new(), Address::any(), local);

      let frame = codec::encode(&Command::OwnershipClaim(true));
      remote.write_all(&frame[..5]).await.unwrap();
      remote.flush().await.unwrap();
      tokio::task::yield_now().await;
      remote.write_all(&frame[5..]).await.unwrap();

      let packet = rx.recv().await.unwrap();
      assert_eq!(packet.kind, PacketKind::OwnershipChange);
   }

   #[tokio::test]
   async fn test_send_reaches_peer() {
      let mut jset = JoinSet::new();
      let (local, mut remote) = duplex(1024);
      let (_rx, tx) = spawn(&mut jset, Hooks::new(), Address::any(), local);

      tx.send_command(&Command::RequestNotifications).await.unwrap();
      tx.post_command(&Command::StemConfig(0x01)).unwrap();

      let expected: Vec<u8> = codec::encode(&Command::RequestNotifications)
         .into_iter()
         .chain(codec::encode(&Command::StemConfig(0x01)))
         .collect();
      let mut buf = vec![0u8; expected.len()];
      remote.read_exact(&mut buf).await.unwrap();
      assert_eq!(buf, expected);
   }

   #[tokio::test]
   async fn test_hooks_run_before_delivery() {
      let mut jset = JoinSet::new();
      let (local, mut remote) = duplex(1024);
      let acks = Arc::new(AtomicUsize::new(0));
      let batteries = Arc::new(AtomicUsize::new(0));
      let hooks = Hooks::new()
         .on_kind(PacketKind::Battery, {
            let batteries = batteries.clone();
            move |_| {
               batteries.fetch_add(1, Ordering::SeqCst);
            }
         })
         .on_kind(PacketKind::HandshakeAck, {
            let acks = acks.clone();
            move |_| {
               acks.fetch_add(1, Ordering::SeqCst);
            }
         });
      let (mut rx, _tx) = spawn(&mut jset, hooks, Address::any(), local);

      let ack = codec::frame(0x0001, Opcode::HANDSHAKE, &[]);
      remote.write_all(&ack).await.unwrap();
      remote.write_all(&ack).await.unwrap();
      rx.recv().await.unwrap();
      rx.recv().await.unwrap();
      assert_eq!(acks.load(Ordering::SeqCst), 2);
      assert_eq!(batteries.load(Ordering::SeqCst), 0);
   }

   #[tokio::test]
   async fn test_eof_and_closed_sender() {
      let mut jset = JoinSet::new();
      let (local, remote) = duplex(1024);
      let (mut rx, tx) = spawn(&mut jset, Hooks::new(), Address::any(), local);

      drop(remote);
      assert!(matches!(rx.recv().await, Err(HandoffError::ConnectionClosed)));

      jset.abort_all();
      while jset.join_next().await.is_some() {}
      assert!(!tx.is_connected());
      assert!(matches!(
         tx.post_command(&Command::Handshake),
         Err(HandoffError::ConnectionClosed)
      ));
   }
}
