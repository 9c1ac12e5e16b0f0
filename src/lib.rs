//! # Bluetooth media back-end
//!
//! Discovers Bluetooth adapters and devices over the system Bluetooth
//! service, negotiates codecs and transports with remote peers, and moves
//! encoded audio between kernel sockets and a rate-controlled buffer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── CONTROL CONTEXT (tokio) ───────────────────────────────┐
//! │                                                                                        │
//! │   BluezBus (RPC seam) ──signals──> Monitor (monitor) <──commands── MonitorHandle        │
//! │        ^                            │                                                  │
//! │        │  Acquire / Release         ├── adapters, application registration            │
//! │        │  SetConfiguration          ├── devices: INIT -> PROFILE -> STOP reconnect      │
//! │        │  ConnectProfile            ├── remote endpoints, endpoint server role          │
//! │        └────────────────────────────┼── codec switch jobs (rate limited)                │
//! │                                     └── transports: refcount, ERROR circuit breaker     │
//! │                                                │                                       │
//! └────────────────────────────────────────────────┼───────────────────────────────────────┘
//!                                                  │ invoke (synchronous, cross-thread)
//!                                                  ▼
//! ┌──────────────────────────────── DATA CONTEXT (data_loop) ──────────────────────────────┐
//! │                                                                                        │
//! │   socket ──> MediaSource ──> DecodeBuffer + RateController ──> PCM out                  │
//! │   PCM in ──> MediaSink ──> encoded packets up to the write MTU ──> socket               │
//! │   IsoScheduler: one absolute timer per CIG/BIG, send staged + pull next per tick        │
//! │                                                                                        │
//! └────────────────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod bus;
pub mod codec;
pub mod config;
pub mod data_loop;
pub mod error;
pub mod iso;
pub mod logging;
pub mod monitor;
pub mod profile;

pub use error::{Error, Result};

/// Back-end wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Averaging window of the rate controller
    pub const BUFFERING_SHORT_MSEC: u32 = 1000;

    /// Window of the long spike tracker
    pub const BUFFERING_LONG_MSEC: u32 = 120_000;

    /// Largest rate correction, as a fraction of the nominal rate
    pub const RATE_DIFF_MAX: f64 = 0.005;

    /// Lost packets concealed before giving up
    pub const MAX_PLC_PACKETS: u32 = 16;
}
