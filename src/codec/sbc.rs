//! SBC capability negotiation
//!
//! Capability blob layout (4 bytes):
//!
//! ```text
//! byte 0: frequency (high nibble) | channel mode (low nibble)
//! byte 1: block length (high nibble) | subbands (bits 3-2) | allocation (bits 1-0)
//! byte 2: min bitpool
//! byte 3: max bitpool
//! ```

use std::cmp::Ordering;

use super::{AudioInfo, CodecKind, MediaCodec};
use crate::error::CodecError;

pub const SBC_CODEC_ID: u8 = 0x00;
pub const SBC_MIN_BITPOOL: u8 = 2;
pub const SBC_MAX_BITPOOL: u8 = 250;

/// Sampling frequency bits
pub mod freq {
    pub const HZ_16000: u8 = 0x08;
    pub const HZ_32000: u8 = 0x04;
    pub const HZ_44100: u8 = 0x02;
    pub const HZ_48000: u8 = 0x01;
}

/// Channel mode bits
pub mod mode {
    pub const MONO: u8 = 0x08;
    pub const DUAL_CHANNEL: u8 = 0x04;
    pub const STEREO: u8 = 0x02;
    pub const JOINT_STEREO: u8 = 0x01;
}

pub mod block {
    pub const BLOCKS_4: u8 = 0x08;
    pub const BLOCKS_8: u8 = 0x04;
    pub const BLOCKS_12: u8 = 0x02;
    pub const BLOCKS_16: u8 = 0x01;
}

pub mod subbands {
    pub const SUBBANDS_4: u8 = 0x02;
    pub const SUBBANDS_8: u8 = 0x01;
}

pub mod alloc {
    pub const SNR: u8 = 0x02;
    pub const LOUDNESS: u8 = 0x01;
}

/// Decoded SBC capability or configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbcCaps {
    pub frequency: u8,
    pub channel_mode: u8,
    pub block_length: u8,
    pub subbands: u8,
    pub allocation: u8,
    pub min_bitpool: u8,
    pub max_bitpool: u8,
}

impl SbcCaps {
    pub fn parse(caps: &[u8]) -> Result<Self, CodecError> {
        if caps.len() < 4 {
            return Err(CodecError::IncompatibleCaps(format!("sbc caps too short: {}", caps.len())));
        }
        Ok(Self {
            frequency: caps[0] >> 4,
            channel_mode: caps[0] & 0x0f,
            block_length: caps[1] >> 4,
            subbands: (caps[1] >> 2) & 0x03,
            allocation: caps[1] & 0x03,
            min_bitpool: caps[2],
            max_bitpool: caps[3],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        vec![
            (self.frequency << 4) | (self.channel_mode & 0x0f),
            (self.block_length << 4) | ((self.subbands & 0x03) << 2) | (self.allocation & 0x03),
            self.min_bitpool,
            self.max_bitpool,
        ]
    }

    pub fn rate(&self) -> Option<u32> {
        match self.frequency {
            freq::HZ_48000 => Some(48000),
            freq::HZ_44100 => Some(44100),
            freq::HZ_32000 => Some(32000),
            freq::HZ_16000 => Some(16000),
            _ => None,
        }
    }

    pub fn channels(&self) -> u16 {
        if self.channel_mode == mode::MONO {
            1
        } else {
            2
        }
    }
}

const FREQUENCIES: [(u8, u32); 4] = [
    (freq::HZ_48000, 48000),
    (freq::HZ_44100, 44100),
    (freq::HZ_32000, 32000),
    (freq::HZ_16000, 16000),
];

const CHANNEL_MODES: [(u8, u16); 4] = [
    (mode::JOINT_STEREO, 2),
    (mode::STEREO, 2),
    (mode::DUAL_CHANNEL, 2),
    (mode::MONO, 1),
];

/// Highest-priority supported entry, preferring an exact match for `want`
fn select_bit<T: PartialEq + Copy>(table: &[(u8, T)], supported: u8, want: T) -> Option<u8> {
    table
        .iter()
        .find(|(bit, v)| supported & bit != 0 && *v == want)
        .or_else(|| table.iter().find(|(bit, _)| supported & bit != 0))
        .map(|(bit, _)| *bit)
}

/// High-quality bitpool for a configuration
fn default_bitpool(frequency: u8, channel_mode: u8) -> u8 {
    let mono = channel_mode == mode::MONO || channel_mode == mode::DUAL_CHANNEL;
    match (frequency, mono) {
        (freq::HZ_16000 | freq::HZ_32000, _) => 53,
        (freq::HZ_44100, true) => 31,
        (freq::HZ_44100, false) => 53,
        (_, true) => 29,
        (_, false) => 51,
    }
}

/// SBC, the mandatory A2DP codec
#[derive(Debug, Clone, Copy, Default)]
pub struct Sbc;

impl MediaCodec for Sbc {
    fn name(&self) -> &'static str {
        "sbc"
    }

    fn kind(&self) -> CodecKind {
        CodecKind::A2dp
    }

    fn codec_id(&self) -> u8 {
        SBC_CODEC_ID
    }

    fn fill_caps(&self, _sink: bool) -> Vec<u8> {
        SbcCaps {
            frequency: freq::HZ_16000 | freq::HZ_32000 | freq::HZ_44100 | freq::HZ_48000,
            channel_mode: mode::MONO | mode::DUAL_CHANNEL | mode::STEREO | mode::JOINT_STEREO,
            block_length: block::BLOCKS_4 | block::BLOCKS_8 | block::BLOCKS_12 | block::BLOCKS_16,
            subbands: subbands::SUBBANDS_4 | subbands::SUBBANDS_8,
            allocation: alloc::SNR | alloc::LOUDNESS,
            min_bitpool: SBC_MIN_BITPOOL,
            max_bitpool: SBC_MAX_BITPOOL,
        }
        .to_bytes()
    }

    fn select_config(&self, _sink: bool, caps: &[u8], info: &AudioInfo) -> Result<Vec<u8>, CodecError> {
        let caps = SbcCaps::parse(caps)?;
        let unsupported = |what: &str| CodecError::IncompatibleCaps(format!("sbc: no common {what}"));

        let frequency = select_bit(&FREQUENCIES, caps.frequency, info.rate).ok_or_else(|| unsupported("frequency"))?;
        let channel_mode =
            select_bit(&CHANNEL_MODES, caps.channel_mode, info.channels).ok_or_else(|| unsupported("channel mode"))?;

        let block_length = [block::BLOCKS_16, block::BLOCKS_12, block::BLOCKS_8, block::BLOCKS_4]
            .into_iter()
            .find(|b| caps.block_length & b != 0)
            .ok_or_else(|| unsupported("block length"))?;
        let subbands = [subbands::SUBBANDS_8, subbands::SUBBANDS_4]
            .into_iter()
            .find(|s| caps.subbands & s != 0)
            .ok_or_else(|| unsupported("subbands"))?;
        let allocation = [alloc::LOUDNESS, alloc::SNR]
            .into_iter()
            .find(|a| caps.allocation & a != 0)
            .ok_or_else(|| unsupported("allocation"))?;

        let min_bitpool = caps.min_bitpool.max(SBC_MIN_BITPOOL);
        let max_bitpool = caps.max_bitpool.min(default_bitpool(frequency, channel_mode));
        if min_bitpool > max_bitpool {
            return Err(CodecError::IncompatibleCaps(format!(
                "sbc: bitpool range {min_bitpool}..{max_bitpool} empty"
            )));
        }

        Ok(SbcCaps {
            frequency,
            channel_mode,
            block_length,
            subbands,
            allocation,
            min_bitpool,
            max_bitpool,
        }
        .to_bytes())
    }

    fn has_caps_preference(&self) -> bool {
        true
    }

    fn caps_preference_cmp(&self, sink: bool, caps1: &[u8], caps2: &[u8], info: &AudioInfo) -> Ordering {
        let conf1 = self.select_config(sink, caps1, info).and_then(|c| SbcCaps::parse(&c));
        let conf2 = self.select_config(sink, caps2, info).and_then(|c| SbcCaps::parse(&c));
        let (a, b) = match (conf1, conf2) {
            (Ok(a), Ok(b)) => (a, b),
            (Ok(_), Err(_)) => return Ordering::Less,
            (Err(_), Ok(_)) => return Ordering::Greater,
            (Err(_), Err(_)) => return Ordering::Equal,
        };

        // Greater key is better, so compare b against a
        let key = |c: &SbcCaps| (c.rate() == Some(info.rate), c.channels() == info.channels, c.max_bitpool);
        key(&b).cmp(&key(&a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: AudioInfo = AudioInfo {
        rate: 48000,
        channels: 2,
    };

    #[test]
    fn test_fill_caps_parses_back() {
        let caps = SbcCaps::parse(&Sbc.fill_caps(false)).unwrap();
        assert_eq!(caps.frequency, 0x0f);
        assert_eq!(caps.max_bitpool, SBC_MAX_BITPOOL);
    }

    #[test]
    fn test_select_config_prefers_requested_format() {
        let config = Sbc.select_config(false, &Sbc.fill_caps(false), &INFO).unwrap();
        let conf = SbcCaps::parse(&config).unwrap();
        assert_eq!(conf.rate(), Some(48000));
        assert_eq!(conf.channel_mode, mode::JOINT_STEREO);
        assert_eq!(conf.block_length, block::BLOCKS_16);
        assert_eq!(conf.subbands, subbands::SUBBANDS_8);
        assert_eq!(conf.allocation, alloc::LOUDNESS);
        assert_eq!(conf.max_bitpool, 51);
    }

    #[test]
    fn test_select_config_falls_back_to_supported_rate() {
        let caps = SbcCaps {
            frequency: freq::HZ_44100,
            channel_mode: mode::MONO,
            block_length: block::BLOCKS_8,
            subbands: subbands::SUBBANDS_4,
            allocation: alloc::SNR,
            min_bitpool: 2,
            max_bitpool: 35,
        };
        let conf = SbcCaps::parse(&Sbc.select_config(false, &caps.to_bytes(), &INFO).unwrap()).unwrap();
        assert_eq!(conf.rate(), Some(44100));
        assert_eq!(conf.channels(), 1);
        assert_eq!(conf.max_bitpool, 31);
    }

    #[test]
    fn test_select_config_rejects_empty_fields() {
        let mut caps = Sbc.fill_caps(false);
        caps[0] &= 0x0f;
        assert!(Sbc.select_config(false, &caps, &INFO).is_err());
        assert!(Sbc.select_config(false, &[0xff], &INFO).is_err());
    }

    #[test]
    fn test_preference_orders_valid_and_matching_first() {
        let full = Sbc.fill_caps(false);
        let only_44k = SbcCaps {
            frequency: freq::HZ_44100,
            ..SbcCaps::parse(&full).unwrap()
        }
        .to_bytes();
        assert_eq!(Sbc.caps_preference_cmp(false, &full, &only_44k, &INFO), Ordering::Less);
        assert_eq!(Sbc.caps_preference_cmp(false, &[0], &full, &INFO), Ordering::Greater);
        assert_eq!(Sbc.caps_preference_cmp(false, &full, &full, &INFO), Ordering::Equal);
    }
}
