//! Stream framing for the AACP control channel.
//!
//! Frames are laid out as:
//!
//! ```text
//! [channel:2][marker:2 = 0x0004][opcode:2][payload_len:2][payload:N]
//! ```
//!
//! All integers are little endian. The codec keeps a reassembly buffer so
//! reads may split or merge frames arbitrarily, and it drops bytes that cannot
//! start a frame until it finds the next plausible header.

use log::{debug, warn};
use smallvec::SmallVec;

use crate::airpods::protocol::{
   CHANNEL_CONNECT, CHANNEL_CONNECT_ACK, CHANNEL_DATA, Command, ControlCommandId, FRAME_HEADER_LEN,
   FRAME_MARKER, MAX_PAYLOAD_LEN, Opcode, PacketKind, SR_SET_OWNERSHIP_TO_FALSE, SR_SHOW_NEARBY_UI,
   mac_to_wire,
};

/// Raw encoded frame or payload bytes.
pub type Frame = SmallVec<[u8; 32]>;

/// A single decoded AACP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
   pub kind: PacketKind,
   pub channel: u16,
   pub opcode: Opcode,
   pub payload: Frame,
}

impl Packet {
   /// Builds a data channel packet, classifying it the same way the decoder does.
   pub fn data(opcode: Opcode, payload: &[u8]) -> Self {
      Self::classified(CHANNEL_DATA, opcode, payload)
   }

   fn classified(channel: u16, opcode: Opcode, payload: &[u8]) -> Self {
      Self {
         kind: classify(channel, opcode, payload),
         channel,
         opcode,
         payload: Frame::from_slice(payload),
      }
   }

   /// Serializes the packet back into a wire frame.
   pub fn to_frame(&self) -> Frame {
      frame(self.channel, self.opcode, &self.payload)
   }
}

enum Scan {
   NeedMore,
   Skip,
   Frame(usize),
}

/// Incremental AACP frame decoder and command encoder.
#[derive(Debug, Default)]
pub struct PacketCodec {
   buf: Vec<u8>,
   dropped: usize,
   malformed: u64,
}

impl PacketCodec {
   pub fn new() -> Self {
      Self::default()
   }

   /// Appends `bytes` to the reassembly buffer and returns every complete packet.
   pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
      self.buf.extend_from_slice(bytes);

      let mut packets = Vec::new();
      let mut pos = 0;
      loop {
         match scan(&self.buf[pos..]) {
            Scan::NeedMore => break,
            Scan::Skip => {
               self.dropped += 1;
               pos += 1;
            },
            Scan::Frame(len) => {
               self.flush_dropped();
               let raw = &self.buf[pos..pos + len];
               let channel = u16::from_le_bytes([raw[0], raw[1]]);
               let opcode = Opcode::from_raw(u16::from_le_bytes([raw[4], raw[5]]));
               packets.push(Packet::classified(
                  channel,
                  opcode,
                  &raw[FRAME_HEADER_LEN..],
               ));
               pos += len;
            },
         }
      }
      self.buf.drain(..pos);
      packets
   }

   /// Encodes an outbound command into a wire frame.
   pub fn encode(&self, command: &Command) -> Frame {
      encode(command)
   }

   /// Number of malformed byte runs discarded so far.
   pub fn malformed_frames(&self) -> u64 {
      self.malformed
   }

   /// Bytes currently buffered waiting for the rest of a frame.
   pub fn pending(&self) -> usize {
      self.buf.len()
   }

   fn flush_dropped(&mut self) {
      if self.dropped > 0 {
         warn!(
            "Dropped {} bytes while resynchronizing to the next frame",
            self.dropped
         );
         self.malformed += 1;
         self.dropped = 0;
      }
   }
}

/// Decides what the bytes at the start of `rest` are.
///
/// Every decision depends only on bytes already present, so feeding the same
/// stream in different chunkings yields identical results.
fn scan(rest: &[u8]) -> Scan {
   const VALID_CHANNEL_LO: [u8; 3] = [
      CHANNEL_CONNECT as u8,
      CHANNEL_CONNECT_ACK as u8,
      CHANNEL_DATA as u8,
   ];
   let marker = FRAME_MARKER.to_le_bytes();

   let checks: [&dyn Fn(u8) -> bool; 4] = [
      &|b| VALID_CHANNEL_LO.contains(&b),
      &|b| b == 0x00,
      &|b| b == marker[0],
      &|b| b == marker[1],
   ];
   for (i, check) in checks.iter().enumerate() {
      match rest.get(i) {
         None => return Scan::NeedMore,
         Some(&b) if !check(b) => return Scan::Skip,
         Some(_) => {},
      }
   }

   if rest.len() < FRAME_HEADER_LEN {
      return Scan::NeedMore;
   }
   let payload_len = u16::from_le_bytes([rest[6], rest[7]]) as usize;
   if payload_len > MAX_PAYLOAD_LEN {
      debug!("Frame declares oversized payload ({payload_len} bytes)");
      return Scan::Skip;
   }
   let total = FRAME_HEADER_LEN + payload_len;
   if rest.len() < total {
      Scan::NeedMore
   } else {
      Scan::Frame(total)
   }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
   haystack.windows(needle.len()).any(|w| w == needle)
}

/// Maps a well-formed frame to its packet kind.
pub fn classify(channel: u16, opcode: Opcode, payload: &[u8]) -> PacketKind {
   match channel {
      CHANNEL_CONNECT_ACK => return PacketKind::HandshakeAck,
      CHANNEL_DATA => {},
      _ => return PacketKind::Unknown,
   }
   match opcode {
      Opcode::BATTERY => PacketKind::Battery,
      Opcode::EAR_DETECTION => PacketKind::EarDetection,
      Opcode::CONTROL_COMMAND => {
         if payload.first() == Some(&ControlCommandId::OWNS_CONNECTION.id()) {
            PacketKind::OwnershipChange
         } else {
            PacketKind::ControlCommand
         }
      },
      Opcode::AUDIO_SOURCE => PacketKind::AudioSource,
      Opcode::SMART_ROUTING_RESP => {
         if contains(payload, SR_SET_OWNERSHIP_TO_FALSE) {
            PacketKind::OwnershipClaimRequest
         } else if contains(payload, SR_SHOW_NEARBY_UI) {
            PacketKind::ShowNearbyUI
         } else {
            PacketKind::Unknown
         }
      },
      Opcode::HEAD_TRACKING => PacketKind::HeadTracking,
      Opcode::STEM_PRESS => PacketKind::StemPress,
      Opcode::DEVICE_INFO => PacketKind::DeviceInformation,
      Opcode::FEATURES_ACK => PacketKind::FeaturesAck,
      Opcode::CONNECTED_DEVICES => PacketKind::ConnectedDevicesList,
      Opcode::PROXIMITY_KEYS_RSP => PacketKind::ProximityKeys,
      Opcode::CONVERSATION_AWARENESS => PacketKind::ConversationAwareness,
      _ => PacketKind::Unknown,
   }
}

/// Builds a wire frame from its parts.
pub fn frame(channel: u16, opcode: Opcode, payload: &[u8]) -> Frame {
   debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
   let len = payload.len().min(MAX_PAYLOAD_LEN);
   channel
      .to_le_bytes()
      .into_iter()
      .chain(FRAME_MARKER.to_le_bytes())
      .chain(opcode.raw().to_le_bytes())
      .chain((len as u16).to_le_bytes())
      .chain(payload[..len].iter().copied())
      .collect()
}

fn control_packet(id: ControlCommandId, value: [u8; 4]) -> Frame {
   let payload: Frame = [id.id()].into_iter().chain(value).collect();
   frame(CHANNEL_DATA, Opcode::CONTROL_COMMAND, &payload)
}

/// Smart routing body: `[target:6][count:1]` followed by
/// `[key_len:1][key][value_len:1][value]` entries.
fn smart_routing(target: bluer::Address, entries: &[(&str, &str)]) -> Frame {
   let mut body = Frame::new();
   body.extend_from_slice(&mac_to_wire(target));
   body.push(entries.len() as u8);
   for (key, value) in entries {
      for s in [key, value] {
         let bytes = &s.as_bytes()[..s.len().min(u8::MAX as usize)];
         body.push(bytes.len() as u8);
         body.extend_from_slice(bytes);
      }
   }
   frame(CHANNEL_DATA, Opcode::SMART_ROUTING, &body)
}

/// Encodes an outbound command.
pub fn encode(command: &Command) -> Frame {
   match command {
      Command::Handshake => frame(
         CHANNEL_CONNECT,
         Opcode::HANDSHAKE,
         &[0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
      ),
      Command::SetFeatureFlags => frame(
         CHANNEL_DATA,
         Opcode::SET_FEATURES,
         &[0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
      ),
      Command::RequestNotifications => {
         frame(CHANNEL_DATA, Opcode::REQUEST_NOTIFY, &[0xff, 0xff, 0xff, 0xff])
      },
      Command::RequestProximityKeys(mask) => {
         frame(CHANNEL_DATA, Opcode::PROXIMITY_KEYS_REQ, &[*mask, 0x00])
      },
      Command::ControlCommand { id, value } => control_packet(*id, *value),
      Command::OwnershipClaim(owns) => {
         control_packet(ControlCommandId::OWNS_CONNECTION, [u8::from(*owns), 0, 0, 0])
      },
      Command::StemConfig(mask) => control_packet(ControlCommandId::STEM_CONFIG, [*mask, 0, 0, 0]),
      Command::MediaInformation { sender, target } => {
         let sender = sender.to_string();
         smart_routing(
            *target,
            &[
               ("type", "MediaInformation"),
               ("btAddress", &sender),
               ("HostStreamingState", "NO"),
            ],
         )
      },
      Command::HijackRequest { sender } => {
         let addr = sender.to_string();
         smart_routing(
            *sender,
            &[
               ("type", "HijackRequest"),
               ("btAddress", &addr),
               ("reason", "Hijackv2"),
               ("localscore", "1"),
            ],
         )
      },
      Command::AddPeer { sender, target } => {
         let sender = sender.to_string();
         smart_routing(*target, &[("type", "TiPiAdd"), ("btAddress", &sender)])
      },
   }
}

#[cfg(test)]
mod tests {
   use bluer::Address;
   use proptest::prelude::*;

   use super::*;

   fn sample_stream() -> Vec<u8> {
      let packets = [
         Packet::data(
            Opcode::BATTERY,
            &[0x02, 0x02, 0x01, 0x55, 0x02, 0x01, 0x04, 0x01, 0x50, 0x01, 0x01],
         ),
         Packet::data(Opcode::EAR_DETECTION, &[0x00, 0x01]),
         Packet::data(Opcode::CONTROL_COMMAND, &[0x06, 0x01, 0x00, 0x00, 0x00]),
         Packet::data(Opcode::from_raw(0x77), &[0xde, 0xad]),
         Packet::data(Opcode::STEM_PRESS, &[0x05, 0x01]),
      ];
      packets.iter().flat_map(|p| p.to_frame()).collect()
   }

   #[test]
   fn test_feed_single_frame() {
      let mut codec = PacketCodec::new();
      let bytes = encode(&Command::OwnershipClaim(true));
      let packets = codec.feed(&bytes);
      assert_eq!(packets.len(), 1);
      assert_eq!(packets[0].kind, PacketKind::OwnershipChange);
      assert_eq!(packets[0].payload.as_slice(), &[0x06, 0x01, 0x00, 0x00, 0x00]);
      assert_eq!(codec.pending(), 0);
   }

   #[test]
   fn test_split_frame_is_buffered() {
      let mut codec = PacketCodec::new();
      let bytes = encode(&Command::StemConfig(0x03));
      assert!(codec.feed(&bytes[..3]).is_empty());
      assert!(codec.feed(&bytes[3..9]).is_empty());
      let packets = codec.feed(&bytes[9..]);
      assert_eq!(packets.len(), 1);
      assert_eq!(packets[0].kind, PacketKind::ControlCommand);
   }

   #[test]
   fn test_resync_after_garbage() {
      let mut codec = PacketCodec::new();
      let mut bytes = vec![0xaa, 0x13, 0x00, 0x04];
      bytes.extend_from_slice(&sample_stream());
      let packets = codec.feed(&bytes);
      assert_eq!(packets.len(), 5);
      assert_eq!(packets[0].kind, PacketKind::Battery);
      assert_eq!(codec.malformed_frames(), 1);
   }

   #[test]
   fn test_oversized_length_is_skipped() {
      let mut codec = PacketCodec::new();
      let mut bytes = vec![0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0xff, 0xff];
      bytes.extend_from_slice(&encode(&Command::OwnershipClaim(false)));
      let packets = codec.feed(&bytes);
      assert_eq!(packets.len(), 1);
      assert_eq!(packets[0].payload[1], 0x00);
   }

   #[test]
   fn test_unknown_opcode_decodes_as_unknown() {
      let mut codec = PacketCodec::new();
      let packets = codec.feed(&frame(CHANNEL_DATA, Opcode::from_raw(0x1234), &[1, 2, 3]));
      assert_eq!(packets.len(), 1);
      assert_eq!(packets[0].kind, PacketKind::Unknown);
      assert_eq!(packets[0].opcode.raw(), 0x1234);
   }

   #[test]
   fn test_handshake_ack_channel() {
      let mut codec = PacketCodec::new();
      let packets = codec.feed(&frame(CHANNEL_CONNECT_ACK, Opcode::HANDSHAKE, &[0x00]));
      assert_eq!(packets[0].kind, PacketKind::HandshakeAck);
   }

   #[test]
   fn test_smart_routing_classification() {
      let sender = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
      let mut body = sender.to_vec();
      body.extend_from_slice(b"\x01\x04typeSetOwnershipToFalse ReverseBannerTapped");
      assert_eq!(
         classify(CHANNEL_DATA, Opcode::SMART_ROUTING_RESP, &body),
         PacketKind::OwnershipClaimRequest
      );

      let mut body = sender.to_vec();
      body.extend_from_slice(b"ShowNearbyUI");
      assert_eq!(
         classify(CHANNEL_DATA, Opcode::SMART_ROUTING_RESP, &body),
         PacketKind::ShowNearbyUI
      );
   }

   #[test]
   fn test_encode_layouts() {
      assert_eq!(
         encode(&Command::Handshake).as_slice(),
         &[
            0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x0a, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00
         ]
      );
      assert_eq!(
         encode(&Command::RequestProximityKeys(0x05)).as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x30, 0x00, 0x02, 0x00, 0x05, 0x00]
      );

      let sender: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
      let target: Address = "01:02:03:04:05:06".parse().unwrap();
      let bytes = encode(&Command::AddPeer { sender, target });
      assert_eq!(&bytes[4..6], &[0x10, 0x00]);
      assert_eq!(&bytes[8..14], &[0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
      assert!(contains(&bytes, b"AA:BB:CC:DD:EE:FF"));
   }

   #[test]
   fn test_packet_round_trip() {
      let original = Packet::data(Opcode::CONNECTED_DEVICES, &[0x00, 0x00, 0x00]);
      let mut codec = PacketCodec::new();
      let decoded = codec.feed(&original.to_frame());
      assert_eq!(decoded, vec![original]);
   }

   proptest! {
      #[test]
      fn test_chunk_size_invariance(cuts in proptest::collection::vec(0usize..200, 0..16)) {
         let stream = sample_stream();
         let expected = PacketCodec::new().feed(&stream);

         let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c % (stream.len() + 1)).collect();
         cuts.sort_unstable();
         let mut codec = PacketCodec::new();
         let mut got = Vec::new();
         let mut start = 0;
         for cut in cuts.into_iter().chain([stream.len()]) {
            got.extend(codec.feed(&stream[start..cut]));
            start = cut;
         }
         prop_assert_eq!(got, expected);
      }

      #[test]
      fn test_chunking_with_noise(
         noise in proptest::collection::vec(any::<u8>(), 0..64),
         chunk in 1usize..17,
      ) {
         let mut stream = noise;
         stream.extend_from_slice(&sample_stream());
         let expected = PacketCodec::new().feed(&stream);

         let mut codec = PacketCodec::new();
         let got: Vec<_> = stream.chunks(chunk).flat_map(|c| codec.feed(c)).collect();
         prop_assert_eq!(got, expected);
      }

      #[test]
      fn test_no_panic_on_random_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..1024)) {
         let mut codec = PacketCodec::new();
         let _ = codec.feed(&bytes);
      }
   }
}
