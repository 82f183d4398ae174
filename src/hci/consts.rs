/// HCI status codes ([Vol 1] Part F, Section 1.3). These are also used as the
/// result of GATT client operations and events.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    num_enum::FromPrimitive,
    num_enum::IntoPrimitive,
    strum::Display,
    thiserror::Error,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    UnknownCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    HardwareFailure = 0x03,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    ConnectionAlreadyExists = 0x0B,
    CommandDisallowed = 0x0C,
    UnsupportedFeatureOrParameterValue = 0x11,
    InvalidCommandParameters = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    ConnectionTerminatedByLocalHost = 0x16,
    #[num_enum(default)] // [Vol 4] Part E, Section 1.2
    UnspecifiedError = 0x1F,
    InsufficientSecurity = 0x2F,
    ParameterOutOfMandatoryRange = 0x30,
    ControllerBusy = 0x3A,
    LimitReached = 0x43,
    OperationCancelledByHost = 0x44,
}

impl Status {
    /// Returns whether status is `Success`.
    #[inline]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Converts `Success` into `Ok(())` and any other status into an error.
    #[inline]
    pub const fn ok(self) -> Result<(), Self> {
        match self {
            Self::Success => Ok(()),
            st => Err(st),
        }
    }
}

impl Default for Status {
    #[inline]
    fn default() -> Self {
        Self::Success
    }
}
