//! Sense data parsing and the closed device error set.
//!
//! Sense keys and ASC/ASCQ pairs are translated exactly once, here, into
//! [`DeviceError`]. Callers never see raw sense again; the error value is
//! re-thrown unwrapped all the way to the public operation boundary.

use std::fmt;

/// Parsed fixed-format sense data.
#[derive(Debug, Clone, Copy, Default)]
pub struct SenseData {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// Filemark bit: the command stopped at a filemark.
    pub filemark: bool,
    /// End-of-medium bit: early warning territory.
    pub eom: bool,
    /// Incorrect-length indicator.
    pub ili: bool,
    /// Information field, the residual count for READ/WRITE/SPACE.
    pub info: i32,
}

impl SenseData {
    /// Parse a fixed-format (0x70/0x71) sense buffer. Short or descriptor
    /// format buffers yield a zeroed "no sense" value.
    pub fn parse(sense: &[u8]) -> SenseData {
        if sense.len() < 14 || (sense[0] & 0x7F) != 0x70 && (sense[0] & 0x7F) != 0x71 {
            return SenseData::default();
        }
        SenseData {
            key: sense[2] & 0x0F,
            asc: sense[12],
            ascq: sense[13],
            filemark: sense[2] & 0x80 != 0,
            eom: sense[2] & 0x40 != 0,
            ili: sense[2] & 0x20 != 0,
            info: i32::from_be_bytes([sense[3], sense[4], sense[5], sense[6]]),
        }
    }

    pub fn is_no_sense(&self) -> bool {
        self.key == 0 && self.asc == 0 && self.ascq == 0 && !self.filemark && !self.ili
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key {:#04x} asc/ascq {:#04x}/{:#04x}",
            self.key, self.asc, self.ascq
        )
    }
}

/// How a decoded condition affects the operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The command completed; nothing to report.
    Clean,
    /// The command completed with a condition the caller may care about
    /// (filemark hit, early warning, short read). Not a failure.
    Noise,
    /// The command failed.
    Error,
}

/// Closed device-level error code set, the only shape in which drive
/// conditions travel above the SCSI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    NoSense,
    RecoveredError,
    // Positional / length conditions
    FilemarkDetected,
    EodDetected,
    EodNotFound,
    BopDetected,
    EomDetected,
    EarlyWarning,
    ProgEarlyWarning,
    Overrun,
    Underrun,
    LengthMismatch,
    // Readiness
    NotReady,
    BecomingReady,
    NoMedium,
    MediumRemoval,
    LoadUnloadError,
    // Medium / hardware
    MediumError,
    HardwareError,
    ReadPerm,
    WritePerm,
    CleaningRequired,
    CleaningCartridge,
    UnsupportedMedium,
    WriteProtected,
    NoSpace,
    // Attention conditions
    UnitAttention,
    PowerOnReset,
    MediumChanged,
    ModeParamChanged,
    ReservationPreempted,
    ReservationConflict,
    // Crypto
    CryptoError,
    KeyRequired,
    KeyChanged,
    // Request shape
    IllegalRequest,
    InvalidField,
    AbortedCommand,
    // Transport / layered conditions synthesized above raw sense
    Timeout,
    ConnectionLost,
    NeedFailover,
    DeviceFenced,
    LbpReadError,
    LbpWriteError,
    BufferOverflow,
    /// Sense combination with no dedicated code; kept for diagnostics.
    Unhandled { key: u8, asc: u8, ascq: u8 },
}

impl DeviceError {
    pub fn class(&self) -> ErrorClass {
        use DeviceError::*;
        match self {
            NoSense => ErrorClass::Clean,
            RecoveredError | FilemarkDetected | EodDetected | BopDetected | EomDetected
            | EarlyWarning | ProgEarlyWarning | Underrun | CleaningRequired => ErrorClass::Noise,
            _ => ErrorClass::Error,
        }
    }

    /// Errors that should capture a drive dump before surfacing.
    pub fn wants_dump(&self) -> bool {
        matches!(
            self,
            DeviceError::MediumError
                | DeviceError::HardwareError
                | DeviceError::ReadPerm
                | DeviceError::WritePerm
                | DeviceError::LbpReadError
                | DeviceError::LbpWriteError
        )
    }

    /// Errors after which the device is fenced until revalidated.
    pub fn wants_fence(&self) -> bool {
        matches!(
            self,
            DeviceError::HardwareError
                | DeviceError::PowerOnReset
                | DeviceError::ConnectionLost
                | DeviceError::NeedFailover
        )
    }
}

impl fmt::Display for DeviceError {
    // The codes are symbolic identifiers, not prose; the debug name is the
    // message.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Map parsed sense to a device error.
pub fn decode(sense: &SenseData) -> DeviceError {
    use DeviceError::*;

    if sense.filemark {
        return FilemarkDetected;
    }

    match (sense.key, sense.asc, sense.ascq) {
        // Crypto conditions first: drives report them under several keys.
        (_, 0xEE, 0x13) | (_, 0xEF, 0x13) => KeyChanged,
        (_, 0xEE, _) => CryptoError,
        (_, 0x26, 0x12) => KeyRequired,

        (0x00, 0x00, 0x00) if sense.ili => LengthMismatch,
        (0x00, 0x00, 0x00) if sense.eom => EarlyWarning,
        (0x00, 0x00, 0x00) => NoSense,
        (0x00, 0x00, 0x01) => FilemarkDetected,
        (0x00, 0x00, 0x02) => EomDetected,
        (0x00, 0x00, 0x04) => BopDetected,
        (0x00, 0x00, 0x05) => EodDetected,
        (0x00, 0x00, 0x07) => ProgEarlyWarning,

        (0x01, 0x00, 0x17) => CleaningRequired,
        (0x01, 0x0C, _) | (0x01, 0x11, _) => RecoveredError,
        (0x01, _, _) => RecoveredError,

        (0x02, 0x04, 0x00) => NotReady,
        (0x02, 0x04, 0x01) => BecomingReady,
        (0x02, 0x04, 0x02) | (0x02, 0x04, 0x03) => LoadUnloadError,
        (0x02, 0x30, 0x03) => CleaningCartridge,
        (0x02, 0x30, _) => UnsupportedMedium,
        (0x02, 0x3A, _) => NoMedium,
        (0x02, 0x53, 0x00) => LoadUnloadError,
        (0x02, _, _) => NotReady,

        (0x03, 0x00, 0x02) => EomDetected,
        (0x03, 0x09, 0x00) => ReadPerm,
        (0x03, 0x0C, 0x00) => WritePerm,
        (0x03, 0x11, _) => ReadPerm,
        (0x03, 0x14, 0x03) => EodNotFound,
        (0x03, 0x30, 0x00) => UnsupportedMedium,
        (0x03, 0x31, 0x00) => MediumError,
        (0x03, 0x51, 0x00) => MediumError, // erase failure
        (0x03, 0x52, 0x00) => MediumError, // cartridge fault
        (0x03, _, _) => MediumError,

        (0x04, 0x40, _) | (0x04, 0x44, _) => HardwareError,
        (0x04, 0x15, _) => HardwareError, // mechanical positioning error
        (0x04, 0x53, 0x00) => LoadUnloadError,
        (0x04, _, _) => HardwareError,

        (0x05, 0x1A, 0x00) => InvalidField, // parameter list length error
        (0x05, 0x20, 0x00) => IllegalRequest, // invalid opcode
        (0x05, 0x24, 0x00) => InvalidField, // invalid field in CDB
        (0x05, 0x25, 0x00) => IllegalRequest, // unsupported LUN
        (0x05, 0x26, _) => InvalidField, // invalid field in parameter list
        (0x05, 0x2C, 0x00) => IllegalRequest, // command sequence error
        (0x05, 0x53, 0x02) => MediumRemoval,
        (0x05, _, _) => IllegalRequest,

        (0x06, 0x28, 0x00) => MediumChanged,
        (0x06, 0x29, _) => PowerOnReset,
        (0x06, 0x2A, 0x01) => ModeParamChanged,
        (0x06, 0x2A, 0x03) | (0x06, 0x2A, 0x04) => ReservationPreempted,
        (0x06, 0x2A, 0x11) => KeyChanged, // data encryption parameters changed
        (0x06, _, _) => UnitAttention,

        (0x07, 0x27, _) => WriteProtected,
        (0x07, _, _) => WriteProtected,

        (0x08, 0x00, 0x05) => EodDetected,
        (0x08, 0x14, 0x03) => EodNotFound,
        (0x08, _, _) => EodDetected,

        (0x0B, 0x10, _) => LbpWriteError, // information unit CRC mismatch
        (0x0B, 0x08, _) => ConnectionLost, // LUN communication failure
        (0x0B, 0x3E, 0x01) => NeedFailover, // logical unit failure
        (0x0B, 0x4B, _) => ConnectionLost, // data phase error
        (0x0B, _, _) => AbortedCommand,

        (0x0D, _, _) => NoSpace, // volume overflow

        (0x0A, _, _) => BufferOverflow,

        (key, asc, ascq) => Unhandled { key, asc, ascq },
    }
}

/// Interpret the ILI/residual combination of a READ that returned
/// length-mismatch sense. Positive residual means the tape block was shorter
/// than the transfer: an underrun, which succeeds with the short count.
/// Negative means the block was longer: an overrun.
pub fn classify_ili(sense: &SenseData, requested: usize) -> DeviceError {
    if sense.info > 0 && (sense.info as usize) <= requested {
        DeviceError::Underrun
    } else {
        DeviceError::Overrun
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(key: u8, asc: u8, ascq: u8, flags: u8, info: i32) -> Vec<u8> {
        let mut buf = vec![0u8; 18];
        buf[0] = 0x70;
        buf[2] = key | flags;
        buf[3..7].copy_from_slice(&info.to_be_bytes());
        buf[12] = asc;
        buf[13] = ascq;
        buf
    }

    #[test]
    fn no_tape_maps_to_no_medium() {
        let sense = SenseData::parse(&fixed(0x02, 0x3A, 0x00, 0, 0));
        assert_eq!(decode(&sense), DeviceError::NoMedium);
        assert_eq!(decode(&sense).class(), ErrorClass::Error);
    }

    #[test]
    fn filemark_bit_wins() {
        let sense = SenseData::parse(&fixed(0x00, 0x00, 0x01, 0x80, 1));
        assert_eq!(decode(&sense), DeviceError::FilemarkDetected);
        assert_eq!(decode(&sense).class(), ErrorClass::Noise);
    }

    #[test]
    fn ili_underrun_and_overrun() {
        let short = SenseData::parse(&fixed(0x00, 0x00, 0x00, 0x20, 100));
        assert_eq!(classify_ili(&short, 512), DeviceError::Underrun);
        let long = SenseData::parse(&fixed(0x00, 0x00, 0x00, 0x20, -100));
        assert_eq!(classify_ili(&long, 512), DeviceError::Overrun);
    }

    #[test]
    fn early_warning_is_noise() {
        let sense = SenseData::parse(&fixed(0x00, 0x00, 0x00, 0x40, 0));
        let err = decode(&sense);
        assert_eq!(err, DeviceError::EarlyWarning);
        assert_eq!(err.class(), ErrorClass::Noise);
    }

    #[test]
    fn medium_error_wants_dump_and_por_wants_fence() {
        assert!(DeviceError::MediumError.wants_dump());
        assert!(!DeviceError::MediumError.wants_fence());
        assert!(DeviceError::PowerOnReset.wants_fence());
    }

    #[test]
    fn unknown_combination_is_preserved() {
        let sense = SenseData::parse(&fixed(0x09, 0x77, 0x42, 0, 0));
        assert_eq!(
            decode(&sense),
            DeviceError::Unhandled {
                key: 0x09,
                asc: 0x77,
                ascq: 0x42
            }
        );
    }
}
