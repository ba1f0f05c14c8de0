use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use glam::{Quat, Vec3};
use tracing::trace;
use uuid::Uuid;

use crate::config::HostConfig;
use crate::net::{NodeDirectory, NodeType, PacketType};

/// Avatar state owned by the simulation; a host only ever borrows it
pub trait AvatarData: Send + Sync {
    fn position(&self) -> Vec3;
    fn head_orientation(&self) -> Quat;
    /// Serialized avatar state, appended after the packet header
    fn to_byte_array(&self) -> Vec<u8>;
    fn send_identity_packet(&self);
    fn send_billboard_packet(&self);
}

/// Mono 16-bit little-endian PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sound {
    pcm: Vec<u8>,
}

impl Sound {
    pub fn from_pcm_bytes(pcm: Vec<u8>) -> Self {
        Self { pcm }
    }

    pub fn from_samples(samples: &[i16]) -> Self {
        let mut pcm = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut pcm);
        Self { pcm }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }

    pub fn len_bytes(&self) -> usize {
        self.pcm.len()
    }
}

/// One tick's worth of outgoing avatar audio
#[derive(Debug, Clone, PartialEq)]
pub enum AudioFrame {
    /// No audible samples this tick; tells the mixer how many samples to hold
    Silent {
        samples: u16,
        position: Vec3,
        orientation: Quat,
    },
    /// Raw mono PCM
    Voiced {
        position: Vec3,
        orientation: Quat,
        pcm: Vec<u8>,
    },
}

impl AudioFrame {
    pub fn packet_type(&self) -> PacketType {
        match self {
            AudioFrame::Silent { .. } => PacketType::SilentAudioFrame,
            AudioFrame::Voiced { .. } => PacketType::MicrophoneAudioNoEcho,
        }
    }

    /// Number of samples this frame accounts for
    pub fn sample_count(&self) -> usize {
        match self {
            AudioFrame::Silent { samples, .. } => *samples as usize,
            AudioFrame::Voiced { pcm, .. } => pcm.len() / 2,
        }
    }

    /// Append the frame to `header`, leaving a zeroed 2-byte sequence slot.
    ///
    /// Returns the packet and the offset of the sequence slot.
    pub fn write_packet(&self, header: Vec<u8>) -> (Vec<u8>, usize) {
        let mut packet = header;
        let sequence_offset = packet.len();
        // Writes into a Vec cannot fail
        let _ = packet.write_u16::<LittleEndian>(0);

        match self {
            AudioFrame::Silent {
                samples,
                position,
                orientation,
            } => {
                let _ = packet.write_u16::<LittleEndian>(*samples);
                write_pose(&mut packet, *position, *orientation);
            }
            AudioFrame::Voiced {
                position,
                orientation,
                pcm,
            } => {
                // scripted avatar audio is always mono
                let _ = packet.write_u8(0);
                write_pose(&mut packet, *position, *orientation);
                let _ = packet.write_all(pcm);
            }
        }

        (packet, sequence_offset)
    }
}

fn write_pose(packet: &mut Vec<u8>, position: Vec3, orientation: Quat) {
    for component in position.to_array() {
        let _ = packet.write_f32::<LittleEndian>(component);
    }
    // x, y, z, w
    for component in orientation.to_array() {
        let _ = packet.write_f32::<LittleEndian>(component);
    }
}

/// What one call to [`AvatarStreamer::stream_tick`] put on the wire
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub avatar_packets: usize,
    pub audio_packets: usize,
}

/// Per-tick construction of avatar-state and audio packets for one host
pub struct AvatarStreamer {
    is_avatar: bool,
    avatar: Option<Weak<dyn AvatarData>>,
    listening: bool,
    sound: Option<Arc<Sound>>,
    sent_bytes: usize,
    samples_per_tick: usize,
    sequence_numbers: HashMap<Uuid, u16>,
    identity_interval: Duration,
    billboard_interval: Duration,
    next_identity: Option<Instant>,
    next_billboard: Option<Instant>,
}

impl AvatarStreamer {
    pub fn new(config: &HostConfig) -> Self {
        Self {
            is_avatar: false,
            avatar: None,
            listening: false,
            sound: None,
            sent_bytes: 0,
            samples_per_tick: config.samples_per_tick(),
            sequence_numbers: HashMap::new(),
            identity_interval: config.identity_packet_interval(),
            billboard_interval: config.billboard_packet_interval(),
            next_identity: None,
            next_billboard: None,
        }
    }

    /// Turn avatar mode on or off. Turning it on arms the identity and billboard schedules.
    pub fn set_is_avatar(&mut self, is_avatar: bool, now: Instant) {
        self.is_avatar = is_avatar;
        if is_avatar {
            self.next_identity.get_or_insert(now + self.identity_interval);
            self.next_billboard.get_or_insert(now + self.billboard_interval);
        } else {
            self.next_identity = None;
            self.next_billboard = None;
        }
    }

    pub fn is_avatar(&self) -> bool {
        self.is_avatar
    }

    pub fn set_avatar_data(&mut self, avatar: Option<Weak<dyn AvatarData>>) {
        self.avatar = avatar;
    }

    /// The attached avatar, if it is still alive
    pub fn avatar_data(&self) -> Option<Arc<dyn AvatarData>> {
        self.avatar.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_listening_to_audio_stream(&mut self, listening: bool) {
        self.listening = listening;
    }

    pub fn is_listening_to_audio_stream(&self) -> bool {
        self.listening
    }

    /// Attach (or detach) the sound to stream; the cursor restarts at zero
    pub fn set_sound(&mut self, sound: Option<Arc<Sound>>) {
        self.sound = sound;
        self.sent_bytes = 0;
    }

    pub fn has_sound(&self) -> bool {
        self.sound.is_some()
    }

    /// Byte offset into the attached sound
    pub fn sent_bytes(&self) -> usize {
        self.sent_bytes
    }

    pub fn samples_per_tick(&self) -> usize {
        self.samples_per_tick
    }

    /// Forget the sequence counter of a peer that went away
    pub fn node_killed(&mut self, id: &Uuid) {
        self.sequence_numbers.remove(id);
    }

    /// Next sequence number that will be sent to a peer
    pub fn next_sequence(&self, id: &Uuid) -> u16 {
        self.sequence_numbers.get(id).copied().unwrap_or(0)
    }

    /// Build and send this tick's packets. Does nothing unless avatar mode is
    /// on and the avatar data is still attached.
    pub fn stream_tick(&mut self, nodes: &dyn NodeDirectory, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        if !self.is_avatar {
            return report;
        }
        let Some(avatar) = self.avatar_data() else {
            return report;
        };

        self.send_periodic_packets(avatar.as_ref(), now);

        let mut avatar_packet = nodes.populate_header(PacketType::AvatarData);
        avatar_packet.extend_from_slice(&avatar.to_byte_array());
        nodes.broadcast_to_nodes(&avatar_packet, NodeType::AvatarMixer);
        report.avatar_packets = 1;

        if self.listening || self.sound.is_some() {
            if let Some(frame) = self.next_audio_frame(avatar.as_ref()) {
                report.audio_packets = self.send_audio_frame(nodes, &frame);
            }
        }

        report
    }

    /// Slice the next chunk out of the attached sound.
    ///
    /// Returns `None` when the frame would be silent and nobody asked for a
    /// silent stream.
    pub fn next_audio_frame(&mut self, avatar: &dyn AvatarData) -> Option<AudioFrame> {
        let budget_bytes = self.samples_per_tick * 2;
        let mut silent = true;
        let mut pcm = Vec::new();

        if let Some(sound) = self.sound.clone() {
            let bytes = sound.as_bytes();
            let available = (bytes.len() - self.sent_bytes).min(budget_bytes);
            let samples = available / 2;
            let chunk = &bytes[self.sent_bytes..self.sent_bytes + samples * 2];

            silent = chunk.chunks_exact(2).all(|sample| sample == [0, 0]);
            if !silent {
                pcm = chunk.to_vec();
            }

            self.sent_bytes += available;
            if self.sent_bytes == bytes.len() {
                trace!(target: "scripting", "Finished streaming sound ({} bytes)", bytes.len());
                self.sound = None;
                self.sent_bytes = 0;
            }
        }

        let position = avatar.position();
        let orientation = avatar.head_orientation();
        if silent {
            if !self.listening {
                return None;
            }
            return Some(AudioFrame::Silent {
                samples: u16::try_from(self.samples_per_tick).unwrap_or(u16::MAX),
                position,
                orientation,
            });
        }

        Some(AudioFrame::Voiced {
            position,
            orientation,
            pcm,
        })
    }

    fn send_audio_frame(&mut self, nodes: &dyn NodeDirectory, frame: &AudioFrame) -> usize {
        let header = nodes.populate_header(frame.packet_type());
        let (mut packet, sequence_offset) = frame.write_packet(header);

        let mixers = nodes.nodes_of_type(NodeType::AudioMixer);
        for node in &mixers {
            let counter = self.sequence_numbers.entry(node.id).or_insert(0);
            let sequence = *counter;
            *counter = counter.wrapping_add(1);

            LittleEndian::write_u16(
                &mut packet[sequence_offset..sequence_offset + 2],
                sequence,
            );
            nodes.send_datagram(&packet, node);
        }
        mixers.len()
    }

    fn send_periodic_packets(&mut self, avatar: &dyn AvatarData, now: Instant) {
        if let Some(next) = self.next_identity {
            if now >= next {
                avatar.send_identity_packet();
                self.next_identity = Some(now + self.identity_interval);
            }
        }
        if let Some(next) = self.next_billboard {
            if now >= next {
                avatar.send_billboard_packet();
                self.next_billboard = Some(now + self.billboard_interval);
            }
        }
    }
}
