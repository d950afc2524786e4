//! The CDB pass-through seam.
//!
//! A [`ScsiTransport`] moves one CDB and its data phase to a device and
//! reports SCSI status, host/driver status and raw sense. Everything else in
//! the crate is transport-agnostic; the simulated cartridge in
//! [`crate::scsi::sim`] plugs in here, and so does the Windows
//! `DeviceIoControl` pass-through below.

use crate::error::{LtfsError, Result};
use crate::scsi::SENSE_LEN;

/// Data phase direction and buffer for one command.
pub enum DataDir<'a> {
    None,
    /// Device-to-host transfer.
    In(&'a mut [u8]),
    /// Host-to-device transfer.
    Out(&'a [u8]),
}

impl DataDir<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataDir::None => 0,
            DataDir::In(buf) => buf.len(),
            DataDir::Out(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Host/driver-level outcome, distinct from SCSI status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Ok,
    /// Transient busy; retried once by the issue loop.
    Busy,
    /// Host suggests a retry; retried once.
    SoftError,
    /// Host asks for an immediate reissue; retried without counting.
    ImmediateRetry,
    /// Host requeued the command; retried without counting.
    Requeue,
    Timeout,
    ConnectionLost,
}

/// Raw completion of one pass-through request.
pub struct CmdStatus {
    /// SCSI status byte (0x00 good, 0x02 check condition, 0x08 busy,
    /// 0x18 reservation conflict).
    pub status: u8,
    pub driver: DriverStatus,
    /// Bytes actually moved in the data phase.
    pub transferred: usize,
    /// Raw sense bytes when a check condition was reported.
    pub sense: Option<[u8; SENSE_LEN]>,
}

impl CmdStatus {
    pub fn good(transferred: usize) -> Self {
        CmdStatus {
            status: 0x00,
            driver: DriverStatus::Ok,
            transferred,
            sense: None,
        }
    }

    pub fn check_condition(sense_buf: &[u8], transferred: usize) -> Self {
        let mut sense = [0u8; SENSE_LEN];
        let n = sense_buf.len().min(SENSE_LEN);
        sense[..n].copy_from_slice(&sense_buf[..n]);
        CmdStatus {
            status: 0x02,
            driver: DriverStatus::Ok,
            transferred,
            sense: Some(sense),
        }
    }
}

pub trait ScsiTransport: Send {
    /// Issue one CDB. Transport-level failure (device node vanished) is an
    /// `Err`; any command-level outcome, including check condition, is `Ok`.
    fn issue(&mut self, cdb: &[u8], data: DataDir<'_>, timeout_secs: u32) -> Result<CmdStatus>;

    /// Close and re-open the underlying device after a connection loss,
    /// re-enumerating by serial number where the host supports it.
    fn reconnect(&mut self) -> Result<()>;

    /// Stable identifier for logs and dump file names.
    fn identifier(&self) -> String;
}

/// SCSI pass-through over the Windows tape device interface.
#[cfg(windows)]
pub mod windows {
    use super::*;
    use std::ffi::CString;
    use tracing::{debug, warn};
    use winapi::shared::minwindef::{DWORD, UCHAR, ULONG, USHORT};
    use winapi::shared::ntdef::{HANDLE, PVOID};
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::{CreateFileA, OPEN_EXISTING};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::ioapiset::DeviceIoControl;
    use winapi::um::winnt::{GENERIC_READ, GENERIC_WRITE};

    const IOCTL_SCSI_PASS_THROUGH_DIRECT: DWORD = 0x4D014;
    const SCSI_IOCTL_DATA_OUT: UCHAR = 0;
    const SCSI_IOCTL_DATA_IN: UCHAR = 1;
    const SCSI_IOCTL_DATA_UNSPECIFIED: UCHAR = 2;

    #[repr(C)]
    struct ScsiPassThroughDirect {
        length: USHORT,
        scsi_status: UCHAR,
        path_id: UCHAR,
        target_id: UCHAR,
        lun: UCHAR,
        cdb_length: UCHAR,
        sense_info_length: UCHAR,
        data_in: UCHAR,
        data_transfer_length: ULONG,
        timeout_value: ULONG,
        data_buffer: PVOID,
        sense_info_offset: ULONG,
        cdb: [UCHAR; 16],
    }

    pub struct WindowsTransport {
        handle: HANDLE,
        device_path: String,
    }

    // The handle is only touched through &mut self.
    unsafe impl Send for WindowsTransport {}

    impl WindowsTransport {
        pub fn open(device_path: &str) -> Result<Self> {
            let full_path = if device_path.starts_with(r"\\.\") {
                device_path.to_string()
            } else {
                format!(r"\\.\{}", device_path)
            };
            debug!("opening tape device {}", full_path);

            let path_cstring = CString::new(full_path.clone())
                .map_err(|e| LtfsError::bad_arg(format!("device path: {}", e)))?;

            let handle = unsafe {
                CreateFileA(
                    path_cstring.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0, // exclusive access
                    std::ptr::null_mut(),
                    OPEN_EXISTING,
                    0,
                    std::ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                let code = unsafe { GetLastError() };
                return Err(LtfsError::Io(std::io::Error::from_raw_os_error(
                    code as i32,
                )));
            }

            Ok(WindowsTransport {
                handle,
                device_path: full_path,
            })
        }
    }

    impl Drop for WindowsTransport {
        fn drop(&mut self) {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }

    impl ScsiTransport for WindowsTransport {
        fn issue(
            &mut self,
            cdb: &[u8],
            mut data: DataDir<'_>,
            timeout_secs: u32,
        ) -> Result<CmdStatus> {
            let (data_in, data_ptr, data_len) = match &mut data {
                DataDir::None => (SCSI_IOCTL_DATA_UNSPECIFIED, std::ptr::null_mut(), 0usize),
                DataDir::In(buf) => (SCSI_IOCTL_DATA_IN, buf.as_mut_ptr() as PVOID, buf.len()),
                DataDir::Out(buf) => (
                    SCSI_IOCTL_DATA_OUT,
                    buf.as_ptr() as *mut _ as PVOID,
                    buf.len(),
                ),
            };

            let mut request =
                vec![0u8; std::mem::size_of::<ScsiPassThroughDirect>() + SENSE_LEN];
            let outcome = unsafe {
                let sptd = request.as_mut_ptr() as *mut ScsiPassThroughDirect;
                (*sptd).length = std::mem::size_of::<ScsiPassThroughDirect>() as USHORT;
                (*sptd).cdb_length = cdb.len() as UCHAR;
                (*sptd).sense_info_length = SENSE_LEN as UCHAR;
                (*sptd).sense_info_offset =
                    std::mem::size_of::<ScsiPassThroughDirect>() as ULONG;
                (*sptd).data_buffer = data_ptr;
                (*sptd).data_transfer_length = data_len as ULONG;
                (*sptd).timeout_value = timeout_secs;
                (*sptd).data_in = data_in;
                std::ptr::copy_nonoverlapping(cdb.as_ptr(), (*sptd).cdb.as_mut_ptr(), cdb.len());

                let mut bytes_returned: DWORD = 0;
                let ok = DeviceIoControl(
                    self.handle,
                    IOCTL_SCSI_PASS_THROUGH_DIRECT,
                    request.as_mut_ptr() as PVOID,
                    request.len() as DWORD,
                    request.as_mut_ptr() as PVOID,
                    request.len() as DWORD,
                    &mut bytes_returned,
                    std::ptr::null_mut(),
                ) != 0;

                if !ok {
                    let code = GetLastError();
                    warn!(
                        "pass-through ioctl failed on {}: {:#010x}",
                        self.device_path, code
                    );
                    return Ok(CmdStatus {
                        status: 0,
                        driver: DriverStatus::ConnectionLost,
                        transferred: 0,
                        sense: None,
                    });
                }

                let status = (*sptd).scsi_status;
                let transferred = (*sptd).data_transfer_length as usize;
                if status == 0x02 {
                    let sense_start = std::mem::size_of::<ScsiPassThroughDirect>();
                    CmdStatus::check_condition(&request[sense_start..], transferred)
                } else {
                    CmdStatus {
                        status,
                        driver: DriverStatus::Ok,
                        transferred,
                        sense: None,
                    }
                }
            };

            Ok(outcome)
        }

        fn reconnect(&mut self) -> Result<()> {
            let path = self.device_path.clone();
            let reopened = WindowsTransport::open(&path)?;
            // Swap handles; the old one closes on drop.
            let old = std::mem::replace(self, reopened);
            drop(old);
            Ok(())
        }

        fn identifier(&self) -> String {
            self.device_path.clone()
        }
    }
}
