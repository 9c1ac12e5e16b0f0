//! Bluetooth audio profile bitmask and UUID mapping
//!
//! Every profile a device advertises, connects or a transport carries is
//! tracked as a bit in [`Profiles`]. The masks describe the *remote* role,
//! e.g. `A2DP_SINK` means the peer renders audio we send.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::{uuid, Uuid};

use crate::error::ConfigError;

pub const UUID_A2DP_SOURCE: Uuid = uuid!("0000110a-0000-1000-8000-00805f9b34fb");
pub const UUID_A2DP_SINK: Uuid = uuid!("0000110b-0000-1000-8000-00805f9b34fb");
pub const UUID_HSP_HS: Uuid = uuid!("00001108-0000-1000-8000-00805f9b34fb");
pub const UUID_HSP_AG: Uuid = uuid!("00001112-0000-1000-8000-00805f9b34fb");
pub const UUID_HFP_HF: Uuid = uuid!("0000111e-0000-1000-8000-00805f9b34fb");
pub const UUID_HFP_AG: Uuid = uuid!("0000111f-0000-1000-8000-00805f9b34fb");
pub const UUID_BAP_SINK: Uuid = uuid!("00002bc9-0000-1000-8000-00805f9b34fb");
pub const UUID_BAP_SOURCE: Uuid = uuid!("00002bcb-0000-1000-8000-00805f9b34fb");
pub const UUID_BAP_BROADCAST_SOURCE: Uuid = uuid!("00001852-0000-1000-8000-00805f9b34fb");
pub const UUID_BAP_BROADCAST_SINK: Uuid = uuid!("00001851-0000-1000-8000-00805f9b34fb");

const UUIDS: [(Profiles, Uuid); 10] = [
    (Profiles::A2DP_SOURCE, UUID_A2DP_SOURCE),
    (Profiles::A2DP_SINK, UUID_A2DP_SINK),
    (Profiles::HSP_HS, UUID_HSP_HS),
    (Profiles::HSP_AG, UUID_HSP_AG),
    (Profiles::HFP_HF, UUID_HFP_HF),
    (Profiles::HFP_AG, UUID_HFP_AG),
    (Profiles::BAP_SINK, UUID_BAP_SINK),
    (Profiles::BAP_SOURCE, UUID_BAP_SOURCE),
    (Profiles::BAP_BROADCAST_SOURCE, UUID_BAP_BROADCAST_SOURCE),
    (Profiles::BAP_BROADCAST_SINK, UUID_BAP_BROADCAST_SINK),
];

/// Set of Bluetooth audio profiles
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profiles(u32);

impl Profiles {
    pub const NONE: Profiles = Profiles(0);
    pub const BAP_SINK: Profiles = Profiles(1 << 0);
    pub const BAP_SOURCE: Profiles = Profiles(1 << 1);
    pub const A2DP_SINK: Profiles = Profiles(1 << 2);
    pub const A2DP_SOURCE: Profiles = Profiles(1 << 3);
    pub const HSP_HS: Profiles = Profiles(1 << 4);
    pub const HSP_AG: Profiles = Profiles(1 << 5);
    pub const HFP_HF: Profiles = Profiles(1 << 6);
    pub const HFP_AG: Profiles = Profiles(1 << 7);
    pub const BAP_BROADCAST_SOURCE: Profiles = Profiles(1 << 8);
    pub const BAP_BROADCAST_SINK: Profiles = Profiles(1 << 9);

    pub const A2DP_DUPLEX: Profiles = Profiles(Self::A2DP_SINK.0 | Self::A2DP_SOURCE.0);
    pub const BAP_DUPLEX: Profiles = Profiles(Self::BAP_SINK.0 | Self::BAP_SOURCE.0);
    pub const BAP_BROADCAST: Profiles =
        Profiles(Self::BAP_BROADCAST_SINK.0 | Self::BAP_BROADCAST_SOURCE.0);
    pub const BAP_AUDIO: Profiles = Profiles(Self::BAP_DUPLEX.0 | Self::BAP_BROADCAST.0);
    pub const HEADSET_HEAD_UNIT: Profiles = Profiles(Self::HSP_HS.0 | Self::HFP_HF.0);
    pub const HEADSET_AUDIO_GATEWAY: Profiles = Profiles(Self::HSP_AG.0 | Self::HFP_AG.0);
    pub const HEADSET_AUDIO: Profiles =
        Profiles(Self::HEADSET_HEAD_UNIT.0 | Self::HEADSET_AUDIO_GATEWAY.0);
    pub const MEDIA_SINK: Profiles =
        Profiles(Self::A2DP_SINK.0 | Self::BAP_SINK.0 | Self::BAP_BROADCAST_SINK.0);
    pub const MEDIA_SOURCE: Profiles =
        Profiles(Self::A2DP_SOURCE.0 | Self::BAP_SOURCE.0 | Self::BAP_BROADCAST_SOURCE.0);
    pub const ALL: Profiles = Profiles((1 << 10) - 1);

    const NAMES: [(&'static str, Profiles); 10] = [
        ("bap_sink", Self::BAP_SINK),
        ("bap_source", Self::BAP_SOURCE),
        ("a2dp_sink", Self::A2DP_SINK),
        ("a2dp_source", Self::A2DP_SOURCE),
        ("hsp_hs", Self::HSP_HS),
        ("hsp_ag", Self::HSP_AG),
        ("hfp_hf", Self::HFP_HF),
        ("hfp_ag", Self::HFP_AG),
        ("bap_bcast_source", Self::BAP_BROADCAST_SOURCE),
        ("bap_bcast_sink", Self::BAP_BROADCAST_SINK),
    ];

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Profiles(bits & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Profiles) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Profiles) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Profiles) {
        self.0 &= !other.0;
    }

    pub fn insert(&mut self, other: Profiles) {
        self.0 |= other.0;
    }

    /// Iterate over the single-profile bits in this set
    pub fn iter(self) -> impl Iterator<Item = Profiles> {
        (0..10).map(|i| Profiles(1 << i)).filter(move |p| self.intersects(*p))
    }

    /// Profile of a UUID, `NONE` for UUIDs without an audio role
    pub fn from_uuid(uuid: &Uuid) -> Profiles {
        UUIDS
            .iter()
            .find(|(_, u)| u == uuid)
            .map(|(p, _)| *p)
            .unwrap_or(Self::NONE)
    }

    /// Union of the profiles of the parseable UUID strings in `uuids`
    pub fn from_uuid_strs<'a>(uuids: impl IntoIterator<Item = &'a str>) -> Profiles {
        uuids
            .into_iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .fold(Self::NONE, |acc, u| acc | Self::from_uuid(&u))
    }

    /// UUID of a single-bit profile
    pub fn uuid(self) -> Option<Uuid> {
        UUIDS.iter().find(|(p, _)| *p == self).map(|(_, u)| *u)
    }

    /// Counterpart role of every profile in the set (sink <-> source, HF <-> AG)
    pub fn swapped(self) -> Profiles {
        const PAIRS: [(Profiles, Profiles); 5] = [
            (Profiles::A2DP_SINK, Profiles::A2DP_SOURCE),
            (Profiles::BAP_SINK, Profiles::BAP_SOURCE),
            (Profiles::BAP_BROADCAST_SINK, Profiles::BAP_BROADCAST_SOURCE),
            (Profiles::HSP_HS, Profiles::HSP_AG),
            (Profiles::HFP_HF, Profiles::HFP_AG),
        ];
        let mut out = Profiles::NONE;
        for (a, b) in PAIRS {
            if self.intersects(a) {
                out |= b;
            }
            if self.intersects(b) {
                out |= a;
            }
        }
        out
    }

    /// Profiles whose media flows from us to the peer
    pub fn is_sink_role(self) -> bool {
        self.intersects(Self::MEDIA_SINK | Self::HEADSET_HEAD_UNIT)
    }

    pub fn name(self) -> Option<&'static str> {
        Self::NAMES.iter().find(|(_, p)| *p == self).map(|(n, _)| *n)
    }
}

impl FromStr for Profiles {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "a2dp" => return Ok(Self::A2DP_DUPLEX),
            "bap" => return Ok(Self::BAP_DUPLEX),
            "hsp" => return Ok(Self::HSP_HS | Self::HSP_AG),
            "hfp" => return Ok(Self::HFP_HF | Self::HFP_AG),
            _ => {}
        }
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == s)
            .map(|(_, p)| *p)
            .ok_or_else(|| ConfigError::UnknownRole(s.to_string()))
    }
}

impl BitOr for Profiles {
    type Output = Profiles;
    fn bitor(self, rhs: Self) -> Self {
        Profiles(self.0 | rhs.0)
    }
}

impl BitOrAssign for Profiles {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Profiles {
    type Output = Profiles;
    fn bitand(self, rhs: Self) -> Self {
        Profiles(self.0 & rhs.0)
    }
}

impl BitAndAssign for Profiles {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for Profiles {
    type Output = Profiles;
    fn not(self) -> Self {
        Profiles(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for Profiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Profiles({:#05x})", self.0)
    }
}

impl fmt::Display for Profiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().filter_map(|p| p.name()).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Direction requirements: a device is usable once every advertised,
/// connectable profile of one of these groups is connected.
pub const DIRECTION_MASKS: [Profiles; 3] = [
    Profiles(Profiles::MEDIA_SINK.0 | Profiles::HEADSET_HEAD_UNIT.0),
    Profiles::MEDIA_SOURCE,
    Profiles::HEADSET_AUDIO_GATEWAY,
];
