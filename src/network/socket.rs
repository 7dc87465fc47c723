//! Raw socket management for crafted TCP probes

use crate::{Result, ScanError};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Raw IPv4 socket carrying TCP with a caller-built IP header
pub struct RawSocket {
    socket: Socket,
}

impl RawSocket {
    /// Create a new raw TCP socket
    pub fn new_tcp() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::from(libc::SOCK_RAW), Some(Protocol::TCP))
            .map_err(map_open_error)?;

        let raw = Self { socket };
        raw.set_header_included()?;
        Ok(raw)
    }

    /// Whether this process may open raw sockets at all
    pub fn is_available() -> bool {
        match Self::new_tcp() {
            Ok(_) => true,
            Err(e) => {
                log::debug!("raw sockets unavailable: {}", e);
                false
            }
        }
    }

    fn set_header_included(&self) -> Result<()> {
        let enable: libc::c_int = 1;
        // SAFETY: fd is owned by `self.socket`, option value outlives the call.
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &enable as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(ScanError::RawSocketError(format!(
                "IP_HDRINCL: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Send a raw packet to the specified destination
    pub fn send_to(&self, packet: &[u8], dest: SocketAddr) -> Result<usize> {
        self.socket
            .send_to(packet, &dest.into())
            .map_err(|e| ScanError::NetworkError(e.to_string()))
    }

    /// Receive one datagram. `Ok(None)` means the read timeout elapsed.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        match (&self.socket).read(buf) {
            Ok(size) => Ok(Some(size)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(ScanError::NetworkError(format!("Socket receive error: {}", e))),
        }
    }

    /// Set receive timeout
    pub fn set_read_timeout(&self, timeout: Duration) -> Result<()> {
        // A zero timeout would mean "block forever" to the kernel
        let timeout = timeout.max(Duration::from_millis(1));
        self.socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| ScanError::NetworkError(e.to_string()))
    }
}

fn map_open_error(e: io::Error) -> ScanError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        ScanError::PermissionError("Permission denied for raw socket".to_string())
    } else {
        ScanError::RawSocketError(e.to_string())
    }
}
