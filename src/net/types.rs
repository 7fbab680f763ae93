//! Wire constants: magic gate, protocol version, the opcode namespace,
//! and frame layout numbers shared by server and client.
//!
//! Every multi-byte integer on the wire is big-endian. The opcode space
//! is dense and partitioned into ranges; the server dispatches on the
//! range first (see the category comments below).

use crate::types::NSELECTS;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Three-word magic gate opening every UDP frame and TCP connection.
/// A peer that cannot produce these within the probe deadline is dropped
/// without a reply.
pub const MAGIC: [u32; 3] = [0x4576_6e74, 0x466c_6f77, 0x4272_6b72];

/// Protocol version; both the discovery and session handshakes require
/// an exact match.
pub const VERSION: u32 = 3;

/// Implementation language tag carried in the handshake reply.
pub const LANG_NATIVE: u32 = 0;

pub const ENDIAN_BIG: u32 = 0;
pub const ENDIAN_LITTLE: u32 = 1;

/// This build's endian word for the handshake.
pub const fn local_endian() -> u32 {
    if cfg!(target_endian = "big") { ENDIAN_BIG } else { ENDIAN_LITTLE }
}

/// This build's word-width flag for the handshake.
pub const fn local_bit64() -> u32 {
    if usize::BITS == 64 { 1 } else { 0 }
}

// =============================================================================
// DISCOVERY FRAME
// =============================================================================

/// Legacy cast-type word in the reply; informational only.
pub const CAST_MULTICAST: u32 = 2;

/// Parse guard on the reply's address table.
pub const RESPONSE_ADDRS_MAX: usize = 20;

/// A discovery datagram never legitimately exceeds this.
pub const DISCOVERY_BUF_SIZE: usize = 4096;

// =============================================================================
// SESSION HANDSHAKE
// =============================================================================

/// Words in the client descriptor after the magic gate:
/// endian | name-len | bit64 | reserved | reserved.
pub const HANDSHAKE_REQUEST_WORDS: usize = 5;

/// Words in the server reply:
/// status | endian | nevents | eventsize-hi | eventsize-lo | version |
/// nselects | language | bit64 | reserved.
pub const HANDSHAKE_REPLY_WORDS: usize = 10;

/// Per-event header words on a get/new stream (no leading status):
/// length-hi | length-lo | memsize-hi | memsize-lo | priority-status |
/// place | reserved | byteorder | reserved | control[NSELECTS].
pub const EVENT_HEADER_WORDS: usize = 9 + NSELECTS;

/// Per-event header words on a put:
/// place | reserved | length-hi | length-lo | priority-status |
/// byteorder | reserved | control[NSELECTS].
pub const PUT_HEADER_WORDS: usize = 7 + NSELECTS;

// =============================================================================
// OPCODES
// =============================================================================
// Mixed commands: event transfer and the station/system verbs with
// irregular frames.

pub const EV_GET: u32 = 20;
pub const EVS_GET: u32 = 21;
pub const EV_PUT: u32 = 22;
pub const EVS_PUT: u32 = 23;
pub const EV_NEW: u32 = 24;
pub const EVS_NEW: u32 = 25;
pub const EV_DUMP: u32 = 26;
pub const EVS_DUMP: u32 = 27;
pub const EVS_NEW_GRP: u32 = 28;

pub const ALIVE: u32 = 40;
pub const WAIT_ALIVE: u32 = 41;
pub const CLOSE: u32 = 42;
pub const FCLOSE: u32 = 43;
pub const WAKE_ATT: u32 = 44;
pub const WAKE_ALL: u32 = 45;
pub const KILL: u32 = 46;

pub const STAT_ATT: u32 = 60;
pub const STAT_DET: u32 = 61;
pub const STAT_CRAT: u32 = 62;
pub const STAT_RM: u32 = 63;
pub const STAT_SPOS: u32 = 64;
pub const STAT_GPOS: u32 = 65;
pub const STAT_ISAT: u32 = 66;
pub const STAT_EX: u32 = 67;
pub const STAT_SSW: u32 = 68;
pub const STAT_GSW: u32 = 69;
pub const STAT_LIB: u32 = 70;
pub const STAT_FUNC: u32 = 71;
pub const STAT_CLASS: u32 = 72;

// Station int-getters: one stat-id in, err + int out.
pub const STAT_GATTS: u32 = 100;
pub const STAT_STATUS: u32 = 101;
pub const STAT_INCNT: u32 = 102;
pub const STAT_OUTCNT: u32 = 103;
pub const STAT_GBLOCK: u32 = 104;
pub const STAT_GUSER: u32 = 105;
pub const STAT_GRESTORE: u32 = 106;
pub const STAT_GPRE: u32 = 107;
pub const STAT_GCUE: u32 = 108;
pub const STAT_GSELECT: u32 = 109;

// Station int-setters: stat-id + int in, err out.
pub const STAT_SBLOCK: u32 = 115;
pub const STAT_SUSER: u32 = 116;
pub const STAT_SRESTORE: u32 = 117;
pub const STAT_SPRE: u32 = 118;
pub const STAT_SCUE: u32 = 119;

// Attachment 64-bit counter getters: att-id in, err + hi + lo out.
pub const ATT_PUT: u32 = 130;
pub const ATT_GET: u32 = 131;
pub const ATT_DUMP: u32 = 132;
pub const ATT_MAKE: u32 = 133;

// System int-getters: nothing in, err + int out.
pub const SYS_TMP: u32 = 150;
pub const SYS_TMPMAX: u32 = 151;
pub const SYS_STAT: u32 = 152;
pub const SYS_STATMAX: u32 = 153;
pub const SYS_PROC: u32 = 154;
pub const SYS_PROCMAX: u32 = 155;
pub const SYS_ATT: u32 = 156;
pub const SYS_ATTMAX: u32 = 157;
pub const SYS_HBEAT: u32 = 158;
pub const SYS_PID: u32 = 159;
pub const SYS_GRP: u32 = 160;

// Bulk data dumps.
pub const SYS_DATA: u32 = 170;
pub const SYS_HIST: u32 = 171;
pub const SYS_GRPS: u32 = 172;

/// Splits a u64 into the hi/lo wire pair.
pub const fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

pub const fn lo(v: u64) -> u32 {
    v as u32
}

pub const fn join(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hi_lo_round_trip() {
        for v in [0u64, 1, u32::MAX as u64, u32::MAX as u64 + 1, u64::MAX] {
            assert_eq!(join(hi(v), lo(v)), v);
        }
    }

    #[test]
    fn opcode_ranges_are_ordered() {
        // The server dispatches on these boundaries; they must stay sorted.
        assert!(EVS_NEW_GRP < STAT_GATTS);
        assert!(STAT_GSELECT < STAT_SBLOCK);
        assert!(STAT_SCUE < ATT_PUT);
        assert!(ATT_MAKE < SYS_TMP);
        assert!(SYS_GRP < SYS_DATA);
    }
}
