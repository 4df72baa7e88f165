// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Protocol error codes and the decode errors that map onto them.

use net::port::PortNo;

/// An OpenFlow error `(type, code)` pair as carried by an ERROR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode {
    /// Error type.
    pub kind: u16,
    /// Error code within the type.
    pub code: u16,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "type {} code {}", self.kind, self.code)
    }
}

/// Error types.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// The request was not understood.
    BadRequest = 1,
    /// An action list was rejected.
    BadAction = 2,
    /// A flow-mod could not be applied.
    FlowModFailed = 3,
    /// A vport-mod could not be applied.
    VportModFailed = 6,
}

macro_rules! error_codes {
    ($(#[$doc:meta])* $name:ident: $kind:ident { $($(#[$vdoc:meta])* $variant:ident = $value:literal,)* }) => {
        $(#[$doc])*
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($(#[$vdoc])* $variant = $value,)*
        }

        impl From<$name> for ErrorCode {
            fn from(value: $name) -> Self {
                ErrorCode {
                    kind: ErrorType::$kind as u16,
                    code: value as u16,
                }
            }
        }
    };
}

error_codes! {
    /// Codes of [`ErrorType::BadRequest`].
    BadRequestCode: BadRequest {
        /// Unsupported protocol version.
        BadVersion = 0,
        /// Unknown or unsupported message type.
        BadType = 1,
        /// Unknown vendor.
        BadVendor = 3,
        /// Wrong message length.
        BadLen = 6,
        /// The referenced buffered packet does not exist (any more).
        BufferUnknown = 8,
    }
}

error_codes! {
    /// Codes of [`ErrorType::BadAction`].
    BadActionCode: BadAction {
        /// Unknown action type.
        BadType = 0,
        /// Wrong action length.
        BadLen = 1,
        /// Unknown vendor id.
        BadVendor = 2,
        /// Unknown vendor subtype.
        BadVendorType = 3,
        /// Illegal output port.
        BadOutPort = 4,
        /// Argument out of range.
        BadArgument = 5,
    }
}

error_codes! {
    /// Codes of [`ErrorType::FlowModFailed`].
    FlowModFailedCode: FlowModFailed {
        /// The flow table is full.
        AllTablesFull = 0,
        /// Unknown command.
        BadCommand = 4,
    }
}

error_codes! {
    /// Codes of [`ErrorType::VportModFailed`].
    VportModFailedCode: VportModFailed {
        /// The virtual port already exists.
        Exists = 0,
        /// The parent port is neither physical nor a registered virtual port.
        BadParent = 1,
        /// The port number is not in the virtual port range.
        BadVport = 2,
        /// The virtual port table is full.
        TableFull = 3,
        /// The virtual port does not exist.
        Unknown = 4,
        /// Unknown command.
        BadCommand = 5,
        /// The virtual port is the parent of another one.
        InUse = 6,
    }
}

/// Errors found while validating an action list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
    /// Length not a multiple of 8, too short, past the end of the list or wrong for the type.
    #[error("bad action length {len} at offset {offset}")]
    BadLen {
        /// Offset of the action in the list.
        offset: usize,
        /// Recorded length.
        len: u16,
    },
    /// Unknown action type.
    #[error("unknown action type {0:#06x}")]
    BadType(u16),
    /// Unknown vendor id.
    #[error("unknown action vendor {0:#010x}")]
    BadVendor(u32),
    /// Unknown vendor subtype or sub-subtype.
    #[error("unknown vendor action subtype {subtype}/{command}")]
    BadVendorType {
        /// Vendor subtype.
        subtype: u16,
        /// Sub-subtype.
        command: u16,
    },
    /// Output port not legal where the action list is used.
    #[error("illegal output port {0}")]
    BadOutPort(PortNo),
    /// An argument is out of range.
    #[error("action argument out of range: {0}")]
    BadArgument(&'static str),
}

impl ActionError {
    /// The protocol error code reported for this error.
    #[must_use]
    pub fn code(&self) -> BadActionCode {
        match self {
            ActionError::BadLen { .. } => BadActionCode::BadLen,
            ActionError::BadType(_) => BadActionCode::BadType,
            ActionError::BadVendor(_) => BadActionCode::BadVendor,
            ActionError::BadVendorType { .. } => BadActionCode::BadVendorType,
            ActionError::BadOutPort(_) => BadActionCode::BadOutPort,
            ActionError::BadArgument(_) => BadActionCode::BadArgument,
        }
    }
}

/// Errors which may occur while decoding a control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The header names another protocol version.
    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),
    /// Unknown message type.
    #[error("unknown message type {0}")]
    BadType(u8),
    /// The message is shorter than its header says, or than its fixed part.
    #[error("bad message length: {0}")]
    BadLen(usize),
    /// Unknown flow-mod command.
    #[error("unknown flow-mod command {0}")]
    BadFlowModCommand(u16),
    /// Unknown vport-mod command.
    #[error("unknown vport-mod command {0}")]
    BadVportModCommand(u16),
    /// The action list was rejected.
    #[error(transparent)]
    Action(#[from] ActionError),
}

impl DecodeError {
    /// The protocol error code reported for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            DecodeError::BadVersion(_) => BadRequestCode::BadVersion.into(),
            DecodeError::BadType(_) => BadRequestCode::BadType.into(),
            DecodeError::BadLen(_) => BadRequestCode::BadLen.into(),
            DecodeError::BadFlowModCommand(_) => FlowModFailedCode::BadCommand.into(),
            DecodeError::BadVportModCommand(_) => VportModFailedCode::BadCommand.into(),
            DecodeError::Action(e) => e.code().into(),
        }
    }
}
