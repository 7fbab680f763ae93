//! Core constants and types: event attributes, station policies, wait
//! modes, and the ids that cross the session boundary.
//!
//! Everything that travels over the wire is represented by a stable
//! integer; the enums here own those mappings so the codec never deals in
//! raw magic values.

use crate::errors::EtError;
use std::time::Duration;

// =============================================================================
// SYSTEM LIMITS
// =============================================================================

/// Selection integers carried by every event and every station.
/// Fixed at build time; both sides of a session must agree (checked in
/// the handshake).
pub const NSELECTS: usize = 6;

/// Wildcard value in a station's select words: matches any control word.
pub const SELECT_WILDCARD: i32 = -1;

/// Maximum stations (grand central included).
pub const STATIONS_MAX: usize = 200;

/// Maximum concurrent attachments, system-wide.
pub const ATTACHMENTS_MAX: usize = 110;

/// Broker name length cap (goes into discovery and handshake frames).
pub const NAME_LENGTH_MAX: usize = 100;

/// Station name length cap.
pub const STATION_NAME_MAX: usize = 47;

/// Hostname cap, uniform across platforms since unames cross the wire.
pub const HOSTNAME_MAX: usize = 256;

/// Grand central is always station 0 at position 0.
pub const GRAND_CENTRAL: StatId = 0;

/// Default port for both the TCP server and UDP discovery.
pub const DEFAULT_PORT: u16 = 11111;

/// Largest event length a 32-bit peer is allowed to receive.
pub const WIDTH_LIMIT_32BIT: u64 = (u32::MAX as u64) / 5;

pub type StatId = usize;
pub type AttId = usize;

/// Stable pool index of an event; the only identity carried across the
/// wire.
pub type Place = usize;

// =============================================================================
// EVENT ATTRIBUTES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Low,
    High,
}

impl Priority {
    pub fn to_i32(self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::High => 1,
        }
    }

    pub fn from_i32(v: i32) -> Priority {
        if v & PRIORITY_MASK != 0 { Priority::High } else { Priority::Low }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataStatus {
    #[default]
    Ok,
    Corrupt,
    PossiblyCorrupt,
}

impl DataStatus {
    pub fn to_i32(self) -> i32 {
        match self {
            DataStatus::Ok => 0,
            DataStatus::Corrupt => 1,
            DataStatus::PossiblyCorrupt => 2,
        }
    }

    pub fn from_i32(v: i32) -> DataStatus {
        match v {
            1 => DataStatus::Corrupt,
            2 => DataStatus::PossiblyCorrupt,
            _ => DataStatus::Ok,
        }
    }
}

/// Priority and data status share one wire word:
/// `priority | datastatus << DATA_SHIFT`.
pub const PRIORITY_MASK: i32 = 0x1;
pub const DATA_SHIFT: i32 = 8;
pub const DATA_MASK: i32 = 0x300;

/// Normal events use their fixed pool buffer; oversized ones carry a
/// side buffer until they return to grand central.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Temp {
    #[default]
    Normal,
    Oversized,
}

/// How a remote getter intends to change the event. Controls whether the
/// server expects payload bytes back on put and whether it auto-puts
/// after streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modify {
    #[default]
    None,
    Header,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    System,
    Attachment(AttId),
}

// =============================================================================
// WAIT MODES
// =============================================================================

/// Wait behavior for get/new. The wire carries the discriminant in the
/// low mode bits plus an explicit seconds/nanos pair for `Timed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sleep,
    Timed(Duration),
    Async,
}

pub const WAIT_SLEEP: i32 = 0;
pub const WAIT_TIMED: i32 = 1;
pub const WAIT_ASYNC: i32 = 2;
pub const WAIT_MASK: i32 = 0x3;

/// Flag bits OR'd onto the wait mode by remote clients.
pub const MODIFY_FULL: i32 = 1 << 2;
pub const MODIFY_HEADER: i32 = 1 << 3;
pub const MODE_DUMP: i32 = 1 << 4;
pub const MODE_NOALLOC: i32 = 1 << 5;

impl Mode {
    pub fn wait_code(&self) -> i32 {
        match self {
            Mode::Sleep => WAIT_SLEEP,
            Mode::Timed(_) => WAIT_TIMED,
            Mode::Async => WAIT_ASYNC,
        }
    }
}

pub fn modify_from_bits(bits: i32) -> Modify {
    // Full modification has precedence when both bits are set.
    if bits & MODIFY_FULL != 0 {
        Modify::Full
    } else if bits & MODIFY_HEADER != 0 {
        Modify::Header
    } else {
        Modify::None
    }
}

pub fn modify_to_bits(modify: Modify) -> i32 {
    match modify {
        Modify::None => 0,
        Modify::Header => MODIFY_HEADER,
        Modify::Full => MODIFY_FULL,
    }
}

// =============================================================================
// STATION POLICIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowMode {
    /// Ordinary member of the main chain.
    #[default]
    Serial,
    /// First station of a parallel group.
    ParallelHead,
    /// Additional sibling joining an existing group.
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserMode {
    #[default]
    Multi,
    Single,
}

/// Where events still owned by a detaching attachment go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    /// Onto the station's output, then dispatched downstream.
    #[default]
    Output,
    /// Back at the head of the station's input.
    Input,
    /// Straight to the grand-central used list.
    GrandCentral,
    /// Dropped back into circulation without bookkeeping.
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockMode {
    /// At a full cue the event skips the station.
    Nonblocking,
    /// At a full cue the producer waits for space.
    #[default]
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectMode {
    /// Every event matches.
    #[default]
    All,
    /// Elementwise control == select, -1 a per-word wildcard.
    Match,
    /// Named predicate resolved in the in-process registry.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    Idle,
    Creating,
    Active,
    Removing,
}

macro_rules! wire_enum {
    ($ty:ident { $($variant:ident = $val:expr),+ $(,)? }) => {
        impl $ty {
            pub fn to_i32(self) -> i32 {
                match self { $($ty::$variant => $val),+ }
            }

            pub fn from_i32(v: i32) -> Result<$ty, EtError> {
                match v {
                    $($val => Ok($ty::$variant),)+
                    _ => Err(EtError::BadArg),
                }
            }
        }
    };
}

wire_enum!(FlowMode { Serial = 0, ParallelHead = 1, Parallel = 2 });
wire_enum!(UserMode { Multi = 0, Single = 1 });
wire_enum!(RestoreMode { Output = 0, Input = 1, GrandCentral = 2, Discard = 3 });
wire_enum!(BlockMode { Nonblocking = 0, Blocking = 1 });
wire_enum!(SelectMode { All = 1, Match = 2, Custom = 3 });
wire_enum!(StationState { Idle = 0, Creating = 1, Active = 2, Removing = 3 });
wire_enum!(Temp { Normal = 0, Oversized = 1 });
wire_enum!(Modify { None = 0, Header = 1, Full = 2 });

// =============================================================================
// STATION PLACEMENT
// =============================================================================

/// Wire value for "append at the end of the chain / group".
pub const POSITION_END: i32 = -1;

/// Wire value for "become the new head of the parallel group".
pub const POSITION_HEAD: i32 = -2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    End,
    At(usize),
}

impl Position {
    pub fn to_i32(self) -> i32 {
        match self {
            Position::End => POSITION_END,
            Position::At(n) => n as i32,
        }
    }

    pub fn from_i32(v: i32) -> Result<Position, EtError> {
        match v {
            POSITION_END => Ok(Position::End),
            n if n >= 0 => Ok(Position::At(n as usize)),
            _ => Err(EtError::BadArg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelPos {
    End,
    Head,
    At(usize),
}

impl ParallelPos {
    pub fn to_i32(self) -> i32 {
        match self {
            ParallelPos::End => POSITION_END,
            ParallelPos::Head => POSITION_HEAD,
            ParallelPos::At(n) => n as i32,
        }
    }

    pub fn from_i32(v: i32) -> Result<ParallelPos, EtError> {
        match v {
            POSITION_END => Ok(ParallelPos::End),
            POSITION_HEAD => Ok(ParallelPos::Head),
            n if n >= 0 => Ok(ParallelPos::At(n as usize)),
            _ => Err(EtError::BadArg),
        }
    }
}

// =============================================================================
// DISCOVERY POLICIES
// =============================================================================

/// Where the client expects the broker to live.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HostSpec {
    #[default]
    Anywhere,
    Local,
    Remote,
    /// A specific host name or dotted-decimal address.
    Host(String),
}

/// How to pick among multiple discovery responders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponsePolicy {
    /// First responder wins.
    #[default]
    First,
    /// Prefer a responder on this host, else first.
    Local,
    /// More than one distinct responding host is an error.
    Error,
}

/// How the client reaches out for a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CastMode {
    #[default]
    Broadcast,
    Multicast,
    BroadAndMulticast,
    /// Skip discovery; connect straight to host:port.
    Direct,
}
