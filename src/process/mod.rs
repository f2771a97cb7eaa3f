//! Source-socket process lookup
//!
//! Maps a flow's source endpoint to the owning process so
//! `PROCESS-NAME` / `PROCESS-PATH` / `UID` rules can match. On Linux
//! this walks `/proc/net/{tcp,udp}{,6}` for the socket's uid and inode,
//! then scans `/proc/*/fd` for the process holding that inode. The
//! lookup is attempted at most once per flow; the dispatcher caches the
//! outcome on the metadata either way.

use std::net::IpAddr;

use thiserror::Error;

use crate::metadata::Network;

/// Process lookup failure
#[derive(Debug, Error)]
pub enum ProcessError {
    /// No socket table entry matched the source endpoint
    #[error("no socket entry for source port")]
    NotFound,

    /// The platform has no lookup implementation
    #[error("process lookup not supported on this platform")]
    Unsupported,

    /// procfs read failure
    #[error("procfs error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved process identity
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Socket owner uid
    pub uid: u32,
    /// Executable path, when the fd scan finds the owner
    pub path: Option<String>,
    /// Executable base name
    pub name: Option<String>,
}

/// Find the process owning the socket at `src_ip:src_port`
///
/// # Errors
///
/// `NotFound` when no socket matches, `Unsupported` off Linux.
pub fn find_process(
    network: Network,
    src_ip: IpAddr,
    src_port: u16,
) -> Result<ProcessInfo, ProcessError> {
    imp::find_process(network, src_ip, src_port)
}

#[cfg(target_os = "linux")]
mod imp {
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    use std::path::Path;

    use tracing::trace;

    use super::{ProcessError, ProcessInfo};
    use crate::metadata::Network;

    pub fn find_process(
        network: Network,
        src_ip: IpAddr,
        src_port: u16,
    ) -> Result<ProcessInfo, ProcessError> {
        let tables: &[&str] = match network {
            Network::Tcp => &["/proc/net/tcp", "/proc/net/tcp6"],
            Network::Udp => &["/proc/net/udp", "/proc/net/udp6"],
        };

        for table in tables {
            let Ok(content) = fs::read_to_string(table) else {
                continue;
            };
            if let Some((uid, inode)) = scan_table(&content, src_ip, src_port) {
                let (path, name) = find_owner(inode)
                    .map_or((None, None), |p| {
                        let name = Path::new(&p)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned());
                        (Some(p), name)
                    });
                trace!(port = src_port, uid, ?name, "process lookup hit");
                return Ok(ProcessInfo { uid, path, name });
            }
        }

        Err(ProcessError::NotFound)
    }

    /// Find a `(uid, inode)` entry whose local endpoint matches
    fn scan_table(content: &str, src_ip: IpAddr, src_port: u16) -> Option<(u32, u64)> {
        content
            .lines()
            .skip(1)
            .find_map(|line| parse_entry(line, src_ip, src_port))
    }

    fn parse_entry(line: &str, src_ip: IpAddr, src_port: u16) -> Option<(u32, u64)> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            return None;
        }
        let (addr_hex, port_hex) = fields[1].split_once(':')?;
        let port = u16::from_str_radix(port_hex, 16).ok()?;
        if port != src_port {
            return None;
        }
        let local_ip = parse_proc_addr(addr_hex)?;
        if !addr_matches(local_ip, src_ip) {
            return None;
        }
        let uid: u32 = fields[7].parse().ok()?;
        let inode: u64 = fields[9].parse().ok()?;
        Some((uid, inode))
    }

    /// procfs encodes addresses as little-endian 32-bit hex groups
    fn parse_proc_addr(hex: &str) -> Option<IpAddr> {
        match hex.len() {
            8 => {
                let raw = u32::from_str_radix(hex, 16).ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(raw.swap_bytes())))
            }
            32 => {
                let mut octets = [0u8; 16];
                for (group, chunk) in octets.chunks_exact_mut(4).enumerate() {
                    let raw =
                        u32::from_str_radix(&hex[group * 8..group * 8 + 8], 16).ok()?;
                    chunk.copy_from_slice(&raw.swap_bytes().to_be_bytes());
                }
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    /// Wildcard binds and v4-mapped entries count as matches
    fn addr_matches(local: IpAddr, src: IpAddr) -> bool {
        if local == src {
            return true;
        }
        match local {
            IpAddr::V4(v4) => v4 == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(v6) => {
                v6 == Ipv6Addr::UNSPECIFIED
                    || v6.to_ipv4_mapped().is_some_and(|v4| IpAddr::V4(v4) == src)
            }
        }
    }

    /// Scan `/proc/*/fd` for the process holding `inode`
    fn find_owner(inode: u64) -> Option<String> {
        let target = format!("socket:[{inode}]");
        for entry in fs::read_dir("/proc").ok()?.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str().filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            else {
                continue;
            };
            let fd_dir = format!("/proc/{pid}/fd");
            let Ok(fds) = fs::read_dir(&fd_dir) else {
                continue;
            };
            for fd in fds.flatten() {
                if let Ok(link) = fs::read_link(fd.path()) {
                    if link.to_string_lossy() == target {
                        return fs::read_link(format!("/proc/{pid}/exe"))
                            .ok()
                            .map(|p| p.to_string_lossy().into_owned());
                    }
                }
            }
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_parse_proc_addr_v4() {
            // 0100007F is 127.0.0.1 little-endian
            assert_eq!(
                parse_proc_addr("0100007F"),
                Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
            );
            assert_eq!(
                parse_proc_addr("00000000"),
                Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            );
            assert_eq!(parse_proc_addr("xyz"), None);
        }

        #[test]
        fn test_parse_proc_addr_v6() {
            let parsed = parse_proc_addr("00000000000000000000000001000000");
            assert_eq!(parsed, Some(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        }

        #[test]
        fn test_scan_table() {
            let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 100 0 0 10 0\n";
            let hit = scan_table(table, "127.0.0.1".parse().unwrap(), 0x1F90);
            assert_eq!(hit, Some((1000, 123_456)));

            // wrong port misses
            assert_eq!(scan_table(table, "127.0.0.1".parse().unwrap(), 80), None);
        }

        #[test]
        fn test_scan_table_wildcard_bind() {
            let table = "\
  sl  local_address rem_address   st uid inode\n\
   0: 00000000:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   102        0 999 2\n";
            let hit = scan_table(table, "192.168.1.10".parse().unwrap(), 53);
            assert_eq!(hit, Some((102, 999)));
        }

        #[test]
        fn test_find_own_socket() {
            // bind a real socket and look ourselves up
            let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            let port = socket.local_addr().unwrap().port();

            let info =
                find_process(Network::Udp, "127.0.0.1".parse().unwrap(), port).unwrap();
            // the socket belongs to this test process
            assert!(info.path.is_some());
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::net::IpAddr;

    use super::{ProcessError, ProcessInfo};
    use crate::metadata::Network;

    pub fn find_process(
        _network: Network,
        _src_ip: IpAddr,
        _src_port: u16,
    ) -> Result<ProcessInfo, ProcessError> {
        Err(ProcessError::Unsupported)
    }
}
