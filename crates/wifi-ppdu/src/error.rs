//! Error types for PPDU construction and header decoding.

use crate::{ModulationClass, PreambleType, StaId};
use thiserror::Error;

/// A TXVECTOR that cannot describe a valid transmission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxVectorError {
    #[error("preamble {preamble} cannot carry a {class} mode")]
    PreambleMismatch {
        preamble: PreambleType,
        class: ModulationClass,
    },

    #[error("{class} does not support a {width} MHz channel")]
    UnsupportedWidth { class: ModulationClass, width: u16 },

    #[error("{class} does not support a {gi} ns guard interval")]
    InvalidGuardInterval { class: ModulationClass, gi: u16 },

    #[error("invalid number of spatial streams {nss} for {class}")]
    InvalidNss { class: ModulationClass, nss: u8 },

    #[error("mode {mode} is not allowed at {width} MHz with {nss} spatial streams")]
    ModeNotAllowed { mode: String, width: u16, nss: u8 },

    #[error("MU preamble {0} needs at least one user")]
    MissingUsers(PreambleType),

    #[error("HE TB PPDU must carry exactly one user, got {0}")]
    TbUserCount(usize),

    #[error("SU preamble {0} must not carry MU user info")]
    UnexpectedUsers(PreambleType),

    #[error("invalid RU for STA {sta_id} in a {width} MHz channel")]
    InvalidRu { sta_id: StaId, width: u16 },

    #[error("overlapping RUs in MU allocation")]
    OverlappingRu,

    #[error("invalid HE MCS {mcs} for STA {sta_id}")]
    InvalidUserMcs { sta_id: StaId, mcs: u8 },

    #[error("invalid HE-SIG-B MCS {0}")]
    InvalidSigBMcs(u8),

    #[error("invalid HE-LTF type {0}")]
    InvalidLtfType(u8),

    #[error("invalid BSS color {0}")]
    InvalidBssColor(u8),

    #[error("L-SIG length {0} exceeds 12 bits")]
    LengthOverflow(u32),
}

/// A header field that fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("L-SIG parity check failed")]
    Parity,

    #[error("L-SIG reserved bit set")]
    ReservedBit,

    #[error("L-SIG tail bits not zero")]
    Tail,

    #[error("invalid L-SIG rate code {0:#06b}")]
    InvalidRate(u8),

    #[error("invalid channel width encoding {0}")]
    InvalidBandwidth(u8),

    #[error("unknown mode {0}")]
    UnknownMode(String),

    #[error("invalid TXVECTOR in header: {0}")]
    TxVector(#[from] TxVectorError),
}

/// A PPDU that cannot be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PpduError {
    #[error("invalid TXVECTOR: {0}")]
    TxVector(#[from] TxVectorError),

    #[error("header error: {0}")]
    Header(#[from] HeaderError),

    #[error("PPDU carries no PSDU")]
    NoPsdu,

    #[error("SU PPDU must carry exactly one PSDU under SU_STA_ID")]
    InvalidSuPsdu,

    #[error("PSDU for STA {0} has no matching user allocation")]
    UnallocatedStation(StaId),

    #[error("PSDU of {0} bytes does not fit the L-SIG length field")]
    PsduTooLarge(u32),

    #[error("PPDU duration of {0} ns does not fit the L-SIG length field")]
    DurationTooLong(u128),
}
