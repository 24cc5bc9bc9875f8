use core::{fmt::Display, panic::Location};

use xhci::ring::trb::event::CompletionCode;

pub type Result<T = ()> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("ring is full")]
    Full,
    #[error("ring is empty")]
    Empty,
    #[error("not enough DMA memory")]
    NoEnoughMemory,
    #[error("index out of range")]
    IndexOutOfRange,
    #[error("host controller did not halt")]
    HostControllerNotHalted,
    #[error("invalid slot id")]
    InvalidSlotId,
    #[error("port not connected")]
    PortNotConnected,
    #[error("port did not enable after reset")]
    PortResetFailed,
    #[error("invalid endpoint number")]
    InvalidEndpointNumber,
    #[error("transfer ring not set")]
    TransferRingNotSet,
    #[error("slot already allocated")]
    AlreadyAllocated,
    #[error("not implemented")]
    NotImplemented,
    #[error("invalid descriptor")]
    InvalidDescriptor,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("unknown device")]
    UnknownDevice,
    #[error("no setup stage for the completed TRB")]
    NoCorrespondingSetupStage,
    #[error("transfer failed")]
    TransferFailed,
    #[error("invalid port configuration phase")]
    InvalidPhase,
    #[error("unknown xHCI speed id")]
    UnknownXhciSpeedId,
    #[error("no class driver waits for this transfer")]
    NoWaiter,
    #[error("controller not initialized")]
    NotInitialized,
    #[error("timeout")]
    Timeout,
    #[error("interface not supported")]
    UnsupportedInterface,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Full => "Full",
            ErrorKind::Empty => "Empty",
            ErrorKind::NoEnoughMemory => "NoEnoughMemory",
            ErrorKind::IndexOutOfRange => "IndexOutOfRange",
            ErrorKind::HostControllerNotHalted => "HostControllerNotHalted",
            ErrorKind::InvalidSlotId => "InvalidSlotID",
            ErrorKind::PortNotConnected => "PortNotConnected",
            ErrorKind::PortResetFailed => "PortResetFailed",
            ErrorKind::InvalidEndpointNumber => "InvalidEndpointNumber",
            ErrorKind::TransferRingNotSet => "TransferRingNotSet",
            ErrorKind::AlreadyAllocated => "AlreadyAllocated",
            ErrorKind::NotImplemented => "NotImplemented",
            ErrorKind::InvalidDescriptor => "InvalidDescriptor",
            ErrorKind::BufferTooSmall => "BufferTooSmall",
            ErrorKind::UnknownDevice => "UnknownDevice",
            ErrorKind::NoCorrespondingSetupStage => "NoCorrespondingSetupStage",
            ErrorKind::TransferFailed => "TransferFailed",
            ErrorKind::InvalidPhase => "InvalidPhase",
            ErrorKind::UnknownXhciSpeedId => "UnknownXHCISpeedID",
            ErrorKind::NoWaiter => "NoWaiter",
            ErrorKind::NotInitialized => "NotInitialized",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::UnsupportedInterface => "UnsupportedInterface",
        }
    }
}

/// A failure together with the source location that raised it.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    file: &'static str,
    line: u32,
}

impl Error {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        let loc = Location::caller();
        Self::at(kind, loc.file(), loc.line())
    }

    pub const fn at(kind: ErrorKind, file: &'static str, line: u32) -> Self {
        Self { kind, file, line }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} at {}:{}", self.name(), self.file, self.line)
    }
}

impl From<ErrorKind> for Error {
    #[track_caller]
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

pub trait ConvertXhciError {
    fn to_result(self) -> Result;
}

impl ConvertXhciError for CompletionCode {
    #[track_caller]
    fn to_result(self) -> Result {
        match self {
            CompletionCode::Success => Ok(()),
            CompletionCode::ShortPacket => Ok(()),
            _ => Err(Error::new(ErrorKind::TransferFailed)),
        }
    }
}

impl ConvertXhciError for core::result::Result<CompletionCode, u8> {
    #[track_caller]
    fn to_result(self) -> Result {
        match self {
            Ok(code) => code.to_result(),
            Err(_) => Err(Error::new(ErrorKind::TransferFailed)),
        }
    }
}
