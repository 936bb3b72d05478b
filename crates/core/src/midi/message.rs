use serde::{Deserialize, Serialize};

/// Decoded MIDI message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MidiMessage {
    NoteOn { channel: u8, note: u8, velocity: u8 },
    NoteOff { channel: u8, note: u8 },
    ControlChange { channel: u8, controller: u8, value: u8 },
    ProgramChange { channel: u8, program: u8 },
    PitchBend { channel: u8, value: u16 },
    Clock,
    Start,
    Stop,
    Continue,
}

pub(crate) const CONTROL_CHANGE: u8 = 0xB0;
pub(crate) const PROGRAM_CHANGE: u8 = 0xC0;
pub(crate) const TIMING_CLOCK: u8 = 0xF8;

impl MidiMessage {
    /// Parses a raw payload.
    ///
    /// System real-time bytes are accepted on their own; every channel
    /// message needs a status byte plus at least one data byte. A missing
    /// second data byte reads as zero.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let status = *bytes.first()?;

        match status {
            TIMING_CLOCK => return Some(Self::Clock),
            0xFA => return Some(Self::Start),
            0xFB => return Some(Self::Continue),
            0xFC => return Some(Self::Stop),
            _ => {}
        }

        let data1 = *bytes.get(1)?;
        let data2 = bytes.get(2).copied().unwrap_or(0);
        let channel = status & 0x0F;

        match status & 0xF0 {
            0x80 => Some(Self::NoteOff {
                channel,
                note: data1,
            }),
            // Note On with velocity 0 means Note Off.
            0x90 if data2 == 0 => Some(Self::NoteOff {
                channel,
                note: data1,
            }),
            0x90 => Some(Self::NoteOn {
                channel,
                note: data1,
                velocity: data2,
            }),
            CONTROL_CHANGE => Some(Self::ControlChange {
                channel,
                controller: data1,
                value: data2,
            }),
            PROGRAM_CHANGE => Some(Self::ProgramChange {
                channel,
                program: data1,
            }),
            0xE0 => Some(Self::PitchBend {
                channel,
                value: ((data2 as u16) << 7) | data1 as u16,
            }),
            _ => None,
        }
    }

    /// Encodes the message, masking channels to 4 bits and data to 7 bits.
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Self::NoteOn {
                channel,
                note,
                velocity,
            } => vec![0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F],
            Self::NoteOff { channel, note } => vec![0x80 | (channel & 0x0F), note & 0x7F, 0],
            Self::ControlChange {
                channel,
                controller,
                value,
            } => vec![
                CONTROL_CHANGE | (channel & 0x0F),
                controller & 0x7F,
                value & 0x7F,
            ],
            Self::ProgramChange { channel, program } => {
                vec![PROGRAM_CHANGE | (channel & 0x0F), program & 0x7F]
            }
            Self::PitchBend { channel, value } => vec![
                0xE0 | (channel & 0x0F),
                (value & 0x7F) as u8,
                ((value >> 7) & 0x7F) as u8,
            ],
            Self::Clock => vec![TIMING_CLOCK],
            Self::Start => vec![0xFA],
            Self::Stop => vec![0xFC],
            Self::Continue => vec![0xFB],
        }
    }

    /// Channel nibble for channel messages.
    pub fn channel(&self) -> Option<u8> {
        match *self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::ProgramChange { channel, .. }
            | Self::PitchBend { channel, .. } => Some(channel),
            Self::Clock | Self::Start | Self::Stop | Self::Continue => None,
        }
    }

    pub fn is_realtime(&self) -> bool {
        self.channel().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_channel_messages() {
        assert_eq!(
            MidiMessage::from_bytes(&[0xB3, 10, 64]),
            Some(MidiMessage::ControlChange {
                channel: 3,
                controller: 10,
                value: 64
            })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0xC7, 25]),
            Some(MidiMessage::ProgramChange {
                channel: 7,
                program: 25
            })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0x92, 60, 0]),
            Some(MidiMessage::NoteOff {
                channel: 2,
                note: 60
            })
        );
        assert_eq!(
            MidiMessage::from_bytes(&[0xE0, 0x00, 0x40]),
            Some(MidiMessage::PitchBend {
                channel: 0,
                value: 8192
            })
        );
    }

    #[test]
    fn realtime_bytes_stand_alone() {
        assert_eq!(MidiMessage::from_bytes(&[0xF8]), Some(MidiMessage::Clock));
        assert_eq!(MidiMessage::from_bytes(&[0xFA]), Some(MidiMessage::Start));
        assert!(MidiMessage::Clock.is_realtime());
    }

    #[test]
    fn rejects_truncated_and_unknown_payloads() {
        assert_eq!(MidiMessage::from_bytes(&[]), None);
        assert_eq!(MidiMessage::from_bytes(&[0xB0]), None);
        assert_eq!(MidiMessage::from_bytes(&[0xF0, 0x7E, 0xF7]), None);
    }

    #[test]
    fn encoding_masks_out_of_range_values() {
        let cc = MidiMessage::ControlChange {
            channel: 0x13,
            controller: 0x8A,
            value: 0xFF,
        };
        assert_eq!(cc.to_bytes(), vec![0xB3, 0x0A, 0x7F]);
        assert_eq!(
            MidiMessage::from_bytes(&cc.to_bytes()),
            Some(MidiMessage::ControlChange {
                channel: 3,
                controller: 10,
                value: 127
            })
        );
    }
}
