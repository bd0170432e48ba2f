//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS parameters as defined in
//! RFC 9113 Section 6.5: the settings a client advertises, and the peer's
//! settings as they evolve over the life of a connection.

use super::error::{Error, Result};
use super::{
    DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, MAX_MAX_FRAME_SIZE, MAX_WINDOW_SIZE,
};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    /// Allows the sender to inform the remote endpoint of the maximum size
    /// of the header compression table
    HeaderTableSize = 0x1,

    /// SETTINGS_ENABLE_PUSH (0x2)
    /// Used to disable server push
    EnablePush = 0x2,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    /// Indicates the maximum number of concurrent streams
    MaxConcurrentStreams = 0x3,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    /// Indicates the sender's initial window size for stream-level flow control
    InitialWindowSize = 0x4,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    /// Indicates the size of the largest frame payload
    MaxFrameSize = 0x5,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    /// Advises peer of the maximum size of header list
    MaxHeaderListSize = 0x6,

    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x8) - RFC 8441
    /// Enables support for CONNECT requests with the :protocol pseudo-header
    EnableConnectProtocol = 0x8,

    /// SETTINGS_NO_RFC7540_PRIORITIES (0x9) - RFC 9218
    /// Indicates that HTTP/2 priorities defined in RFC 7540 are not supported
    NoRfc7540Priorities = 0x9,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0x8 => Some(SettingsParameter::EnableConnectProtocol),
            0x9 => Some(SettingsParameter::NoRfc7540Priorities),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
            SettingsParameter::NoRfc7540Priorities => "NO_RFC7540_PRIORITIES",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// Settings a client advertises in its preface
#[derive(Debug, Clone)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings {
            header_table_size: None,
            enable_push: None,
            max_concurrent_streams: None,
            initial_window_size: None,
            max_frame_size: None,
            max_header_list_size: None,
        }
    }

    /// The client preface settings: 100 streams, the given stream window,
    /// 16384-byte frames, push disabled
    pub fn client(initial_window_size: u32) -> Self {
        Settings {
            max_concurrent_streams: Some(DEFAULT_MAX_CONCURRENT_STREAMS),
            initial_window_size: Some(initial_window_size),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            enable_push: Some(false),
            ..Settings::new()
        }
    }

    /// Get initial window size (with default)
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Get max frame size (with default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > MAX_WINDOW_SIZE {
                return Err(Error::FlowControl(format!(
                    "Initial window size {} exceeds maximum (2^31-1)",
                    initial_window_size
                )));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&max_frame_size) {
                return Err(Error::Protocol(format!(
                    "Max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Wire form as (identifier, value) pairs
    pub fn encode(&self) -> Vec<(u16, u32)> {
        let mut pairs = Vec::with_capacity(6);
        if let Some(v) = self.header_table_size {
            pairs.push((SettingsParameter::HeaderTableSize.as_u16(), v));
        }
        if let Some(v) = self.max_concurrent_streams {
            pairs.push((SettingsParameter::MaxConcurrentStreams.as_u16(), v));
        }
        if let Some(v) = self.initial_window_size {
            pairs.push((SettingsParameter::InitialWindowSize.as_u16(), v));
        }
        if let Some(v) = self.max_frame_size {
            pairs.push((SettingsParameter::MaxFrameSize.as_u16(), v));
        }
        if let Some(v) = self.enable_push {
            pairs.push((SettingsParameter::EnablePush.as_u16(), u32::from(v)));
        }
        if let Some(v) = self.max_header_list_size {
            pairs.push((SettingsParameter::MaxHeaderListSize.as_u16(), v));
        }
        pairs
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

/// Builder for HTTP/2 settings
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What changed when a SETTINGS frame was applied
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SettingsDelta {
    /// New INITIAL_WINDOW_SIZE minus the old one, if the setting was present
    pub initial_window_delta: Option<i64>,
    pub max_frame_size: Option<u32>,
    pub header_table_size: Option<u32>,
    pub max_concurrent_streams: Option<u32>,
}

/// The peer's settings, shared between the reader loop, the writer loop and
/// admission
///
/// Until the peer says otherwise the RFC defaults apply; the stream limit
/// and the header list size start unbounded.
#[derive(Debug)]
pub struct RemoteSettings {
    header_table_size: AtomicU32,
    max_concurrent_streams: AtomicU32,
    initial_window_size: AtomicU32,
    max_frame_size: AtomicU32,
    max_header_list_size: AtomicU32,
}

impl RemoteSettings {
    pub fn new() -> Self {
        RemoteSettings {
            header_table_size: AtomicU32::new(DEFAULT_HEADER_TABLE_SIZE),
            max_concurrent_streams: AtomicU32::new(u32::MAX),
            initial_window_size: AtomicU32::new(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: AtomicU32::new(u32::MAX),
        }
    }

    pub fn header_table_size(&self) -> u32 {
        self.header_table_size.load(Ordering::Acquire)
    }

    pub fn max_concurrent_streams(&self) -> u32 {
        self.max_concurrent_streams.load(Ordering::Acquire)
    }

    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size.load(Ordering::Acquire)
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size.load(Ordering::Acquire)
    }

    pub fn max_header_list_size(&self) -> u32 {
        self.max_header_list_size.load(Ordering::Acquire)
    }

    /// Validate and apply the pairs of one SETTINGS frame
    ///
    /// The whole frame is validated before anything is applied. Unknown
    /// identifiers are ignored. When a setting repeats, the last value wins.
    pub fn apply(&self, pairs: &[(u16, u32)]) -> Result<SettingsDelta> {
        for &(id, value) in pairs {
            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::EnablePush) if value > 1 => {
                    return Err(Error::Protocol(format!("Invalid ENABLE_PUSH: {}", value)));
                }
                Some(SettingsParameter::InitialWindowSize) if value > MAX_WINDOW_SIZE => {
                    return Err(Error::FlowControl(format!(
                        "Invalid INITIAL_WINDOW_SIZE: {}",
                        value
                    )));
                }
                Some(SettingsParameter::MaxFrameSize)
                    if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) =>
                {
                    return Err(Error::Protocol(format!("Invalid MAX_FRAME_SIZE: {}", value)));
                }
                _ => {}
            }
        }

        let mut delta = SettingsDelta::default();
        for &(id, value) in pairs {
            match SettingsParameter::from_u16(id) {
                Some(SettingsParameter::HeaderTableSize) => {
                    self.header_table_size.store(value, Ordering::Release);
                    delta.header_table_size = Some(value);
                }
                Some(SettingsParameter::MaxConcurrentStreams) => {
                    self.max_concurrent_streams.store(value, Ordering::Release);
                    delta.max_concurrent_streams = Some(value);
                }
                Some(SettingsParameter::InitialWindowSize) => {
                    let old = self.initial_window_size.swap(value, Ordering::AcqRel);
                    let change = i64::from(value) - i64::from(old);
                    delta.initial_window_delta =
                        Some(delta.initial_window_delta.unwrap_or(0) + change);
                }
                Some(SettingsParameter::MaxFrameSize) => {
                    self.max_frame_size.store(value, Ordering::Release);
                    delta.max_frame_size = Some(value);
                }
                Some(SettingsParameter::MaxHeaderListSize) => {
                    self.max_header_list_size.store(value, Ordering::Release);
                }
                _ => {}
            }
        }
        Ok(delta)
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self::new()
    }
}
