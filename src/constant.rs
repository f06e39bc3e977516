use std::time::Duration;

/// Magic bytes opening the V1_0 handshake, sent before any JSON exchange.
pub const HANDSHAKE_MAGIC: [u8; 4] = [0xc3, 0xbd, 0xc2, 0x34];

/// Sub-protocol version negotiated inside the handshake JSON.
pub const SUB_PROTOCOL_VERSION: u64 = 0;

/// The only authentication method the server speaks in V1_0.
pub const AUTHENTICATION_METHOD: &str = "SCRAM-SHA-256";

/// Handshake error codes in this range are authentication failures.
pub const AUTH_ERROR_CODES: std::ops::RangeInclusive<i64> = 10..=20;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 28015;
pub const DEFAULT_USER: &str = "admin";

/// Bound on the whole connect + handshake dialogue.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Per-query deadline used when the caller passes [`Deadline::Default`](crate::Deadline).
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Bound on any single call into the driver task itself.
pub const DRIVER_CALL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Sanity bound on the declared payload length of an inbound frame.
/// A larger declared length means the stream is corrupt and cannot be resynced.
pub const MAX_FRAME_LENGTH: usize = 64 << 20;

/// First element of the outbound query array.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
    ServerInfo = 5,
}

/// Term-type codes for the handful of terms the driver assembles itself.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermType {
    Db = 14,
    Table = 15,
    Filter = 39,
    Insert = 56,
    DbList = 59,
}

/// The `t` field of a response document.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// `r` holds exactly one value.
    SuccessAtom = 1,
    /// `r` holds the final (or only) batch of a sequence.
    SuccessSequence = 2,
    /// `r` holds one batch; more batches follow after a continuation.
    SuccessPartial = 3,
    WaitComplete = 4,
    ServerInfo = 5,
    ClientError = 16,
    CompileError = 17,
    RuntimeError = 18,
}

impl ResponseType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::SuccessAtom),
            2 => Some(Self::SuccessSequence),
            3 => Some(Self::SuccessPartial),
            4 => Some(Self::WaitComplete),
            5 => Some(Self::ServerInfo),
            16 => Some(Self::ClientError),
            17 => Some(Self::CompileError),
            18 => Some(Self::RuntimeError),
            _ => None,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::ClientError | Self::CompileError | Self::RuntimeError
        )
    }
}

/// Runtime-error subtype carried in the `e` field of a `RuntimeError` response.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Internal = 1_000_000,
    ResourceLimit = 2_000_000,
    QueryLogic = 3_000_000,
    NonExistence = 3_100_000,
    OpFailed = 4_100_000,
    OpIndeterminate = 4_200_000,
    User = 5_000_000,
    PermissionError = 6_000_000,
}

impl ErrorType {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1_000_000 => Some(Self::Internal),
            2_000_000 => Some(Self::ResourceLimit),
            3_000_000 => Some(Self::QueryLogic),
            3_100_000 => Some(Self::NonExistence),
            4_100_000 => Some(Self::OpFailed),
            4_200_000 => Some(Self::OpIndeterminate),
            5_000_000 => Some(Self::User),
            6_000_000 => Some(Self::PermissionError),
            _ => None,
        }
    }
}
