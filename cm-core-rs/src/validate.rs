//! Header validation for received packets
//!
//! Both packet kinds share one validator driven by a per-kind table of
//! expected packet lengths, indexed by protocol version. Supporting a new
//! version only means appending its length to the table.

use crate::protocol::{
    PacketHeader, COMMAND_V1_LEN, COMMAND_VERSION, COMMAND_VERSION_MIN, HEADER_LEN, PACKET_MAGIC,
    STATE_V1_LEN, STATE_V2_LEN, STATE_V3_LEN, STATE_VERSION, STATE_VERSION_MIN,
};
use thiserror::Error;

// v2 reuses the reserved byte of v1, so both have the same size.
const COMMAND_PACKET_LENGTHS: [u16; COMMAND_VERSION as usize + 1] = [
    HEADER_LEN as u16,
    (HEADER_LEN + COMMAND_V1_LEN) as u16,
    (HEADER_LEN + COMMAND_V1_LEN) as u16,
];

const STATE_PACKET_LENGTHS: [u16; STATE_VERSION as usize + 1] = [
    HEADER_LEN as u16,
    (HEADER_LEN + STATE_V1_LEN) as u16,
    (HEADER_LEN + STATE_V1_LEN + STATE_V2_LEN) as u16,
    (HEADER_LEN + STATE_V1_LEN + STATE_V2_LEN + STATE_V3_LEN) as u16,
];

pub const COMMAND_LAYOUT: PacketLayout = PacketLayout {
    name: "command",
    min_version: COMMAND_VERSION_MIN,
    lengths: &COMMAND_PACKET_LENGTHS,
};

pub const STATE_LAYOUT: PacketLayout = PacketLayout {
    name: "state",
    min_version: STATE_VERSION_MIN,
    lengths: &STATE_PACKET_LENGTHS,
};

/// Reasons a received packet is dropped
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("truncated header with {received} bytes")]
    TruncatedHeader { received: usize },

    #[error("invalid magic, got {magic}")]
    InvalidMagic { magic: u32 },

    #[error("protocol version {version} too old, need at least version {min}")]
    VersionTooOld { version: u8, min: u8 },

    #[error("invalid {kind} packet length for known protocol version {version}: {length} bytes, expected {expected} bytes")]
    InvalidLength {
        kind: &'static str,
        version: u8,
        length: u16,
        expected: u16,
    },

    #[error("invalid {kind} packet length for protocol version {version} from the future: {length} bytes")]
    InvalidFutureLength {
        kind: &'static str,
        version: u8,
        length: u16,
    },

    #[error("received truncated {kind} packet for protocol version {version}: {received}/{length} bytes")]
    Truncated {
        kind: &'static str,
        version: u8,
        received: usize,
        length: u16,
    },
}

impl ValidationError {
    /// True if the packet was cut short on the network rather than malformed
    pub fn is_truncation(&self) -> bool {
        matches!(
            self,
            ValidationError::TruncatedHeader { .. } | ValidationError::Truncated { .. }
        )
    }
}

/// Version and length rules for one packet kind
#[derive(Debug, Clone, Copy)]
pub struct PacketLayout {
    pub name: &'static str,
    pub min_version: u8,
    /// Expected total packet length, indexed by version
    pub lengths: &'static [u16],
}

impl PacketLayout {
    pub fn max_known_version(&self) -> u8 {
        (self.lengths.len() - 1) as u8
    }

    /// Expected packet length for a known version
    pub fn packet_len(&self, version: u8) -> Option<u16> {
        self.lengths.get(version as usize).copied()
    }

    /// Length of the newest known version, also the receive buffer size
    pub fn max_known_len(&self) -> u16 {
        self.lengths[self.lengths.len() - 1]
    }

    /// Check a received header against the number of bytes actually received.
    pub fn validate(&self, header: &PacketHeader, received: usize) -> Result<(), ValidationError> {
        if received < HEADER_LEN {
            return Err(ValidationError::TruncatedHeader { received });
        }

        if header.magic != PACKET_MAGIC {
            return Err(ValidationError::InvalidMagic {
                magic: header.magic,
            });
        }

        if header.version < self.min_version {
            return Err(ValidationError::VersionTooOld {
                version: header.version,
                min: self.min_version,
            });
        }

        let truncated = ValidationError::Truncated {
            kind: self.name,
            version: header.version,
            received,
            length: header.length,
        };

        match self.packet_len(header.version) {
            Some(expected) => {
                if header.length != expected {
                    return Err(ValidationError::InvalidLength {
                        kind: self.name,
                        version: header.version,
                        length: header.length,
                        expected,
                    });
                }

                // The receive buffer holds every known version completely.
                if received != header.length as usize {
                    return Err(truncated);
                }
            }
            None => {
                let max_known_len = self.max_known_len();
                if header.length < max_known_len {
                    return Err(ValidationError::InvalidFutureLength {
                        kind: self.name,
                        version: header.version,
                        length: header.length,
                    });
                }

                // Unknown trailing fields are cut off by the receive buffer;
                // any other truncation is an error.
                if received != max_known_len as usize {
                    return Err(truncated);
                }
            }
        }

        Ok(())
    }
}
