//! # Virtual Interface
//!
//! The overlay's data-plane endpoint on a node is an OS-level TUN device.
//! The daemon only ever sees it through the [`TunDevice`] trait: a byte-stream
//! pair (`read_packet` / `write_packet`) plus address and route plumbing.
//!
//! Two implementations live here:
//!
//! - [`LinuxTun`]: a real `/dev/net/tun` device. The fd is opened with
//!   `TUNSETIFF` (IFF_TUN | IFF_NO_PI), switched to non-blocking, and driven
//!   through tokio's `AsyncFd`. Address and route changes shell out to
//!   `ip(8)`, which keeps the daemon free of netlink plumbing.
//! - [`MemoryTun`]: an in-memory pair for tests. Packets "read from the
//!   interface" are whatever the test injected, packets "written to the
//!   interface" can be awaited, and every address/route call is recorded.

use std::collections::VecDeque;

use anyhow::Result;
use async_trait::async_trait;

use crate::routes::Prefix;

/// The OS-facing surface of the overlay's virtual interface.
#[async_trait]
pub trait TunDevice: Send + Sync + 'static {
    /// Read one IP packet into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one raw IP packet to the interface.
    async fn write_packet(&self, packet: &[u8]) -> Result<()>;

    /// Assign interface addresses, given in `addr/prefix_len` form.
    async fn set_addresses(&self, addrs: &[String]) -> Result<()>;

    async fn add_route(&self, prefix: &Prefix) -> Result<()>;

    async fn remove_route(&self, prefix: &Prefix) -> Result<()>;

    fn name(&self) -> &str;

    fn mtu(&self) -> usize;
}

// ============================================================================
// Linux TUN
// ============================================================================

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "linux")]
mod linux {
    use super::TunDevice;
    use crate::routes::Prefix;
    use crate::streams::MAX_PACKET_SIZE;

    use std::io;
    use std::os::fd::AsRawFd;
    use std::process::Stdio;

    use anyhow::{bail, Context, Result};
    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tracing::debug;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TUN: libc::c_short = 0x0001;
    const IFF_NO_PI: libc::c_short = 0x1000;

    #[repr(C)]
    struct IfReq {
        ifr_name: [u8; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
        _pad: [u8; 22],
    }

    /// A `/dev/net/tun` device owned by the daemon.
    pub struct LinuxTun {
        fd: AsyncFd<std::fs::File>,
        name: String,
        mtu: usize,
    }

    impl LinuxTun {
        /// Open and bring up the named TUN interface.
        pub async fn create(name: &str) -> Result<Self> {
            if name.len() >= libc::IFNAMSIZ {
                bail!("interface name {name:?} too long");
            }

            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/net/tun")
                .context("failed to open /dev/net/tun")?;

            let mut req = IfReq {
                ifr_name: [0; libc::IFNAMSIZ],
                ifr_flags: IFF_TUN | IFF_NO_PI,
                _pad: [0; 22],
            };
            req.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

            // SAFETY: valid fd and a properly initialized ifreq.
            let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &req) };
            if rc < 0 {
                return Err(io::Error::last_os_error()).context("ioctl(TUNSETIFF) failed");
            }

            // SAFETY: plain fcntl on a fd we own.
            unsafe {
                let fd = file.as_raw_fd();
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(io::Error::last_os_error()).context("failed to set O_NONBLOCK");
                }
            }

            let device = Self {
                fd: AsyncFd::new(file).context("failed to register TUN fd")?,
                name: name.to_string(),
                mtu: MAX_PACKET_SIZE,
            };

            ip(&["link", "set", "dev", name, "mtu", &device.mtu.to_string()]).await?;
            ip(&["link", "set", "dev", name, "up"]).await?;
            debug!(interface = name, mtu = device.mtu, "TUN device up");
            Ok(device)
        }
    }

    async fn ip(args: &[&str]) -> Result<()> {
        let status = tokio::process::Command::new("ip")
            .args(args)
            .stdout(Stdio::null())
            .status()
            .await
            .context("failed to run ip(8)")?;
        if !status.success() {
            bail!("ip {} exited with {status}", args.join(" "));
        }
        Ok(())
    }

    #[async_trait]
    impl TunDevice for LinuxTun {
        async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let rc = unsafe {
                        libc::read(
                            inner.get_ref().as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if rc < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(rc as usize)
                    }
                }) {
                    Ok(result) => return result.context("TUN read failed"),
                    Err(_would_block) => continue,
                }
            }
        }

        async fn write_packet(&self, packet: &[u8]) -> Result<()> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let rc = unsafe {
                        libc::write(
                            inner.get_ref().as_raw_fd(),
                            packet.as_ptr() as *const libc::c_void,
                            packet.len(),
                        )
                    };
                    if rc < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(())
                    }
                }) {
                    Ok(result) => return result.context("TUN write failed"),
                    Err(_would_block) => continue,
                }
            }
        }

        async fn set_addresses(&self, addrs: &[String]) -> Result<()> {
            for addr in addrs {
                ip(&["addr", "add", addr, "dev", &self.name]).await?;
            }
            Ok(())
        }

        async fn add_route(&self, prefix: &Prefix) -> Result<()> {
            ip(&["route", "add", &prefix.to_string(), "dev", &self.name]).await
        }

        async fn remove_route(&self, prefix: &Prefix) -> Result<()> {
            ip(&["route", "del", &prefix.to_string(), "dev", &self.name]).await
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn mtu(&self) -> usize {
            self.mtu
        }
    }
}

// ============================================================================
// In-memory TUN for tests
// ============================================================================

/// Test double: packets flow through channels instead of a kernel device.
pub struct MemoryTun {
    name: String,
    /// Packets the daemon will "read from the interface".
    inbound: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
    inbound_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    /// Packets the daemon "wrote to the interface".
    outbound_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    outbound: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
    /// Every set_addresses / add_route / remove_route call, in order.
    pub calls: std::sync::Mutex<Vec<String>>,
    /// Routes currently applied, for rollback assertions.
    pub routes: std::sync::Mutex<VecDeque<Prefix>>,
    /// When set, route mutations fail; exercises rollback paths.
    pub fail_route_ops: std::sync::atomic::AtomicBool,
}

impl MemoryTun {
    pub fn new(name: &str) -> std::sync::Arc<Self> {
        let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(256);
        let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(256);
        std::sync::Arc::new(Self {
            name: name.to_string(),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            inbound_tx,
            outbound_tx,
            outbound: tokio::sync::Mutex::new(outbound_rx),
            calls: std::sync::Mutex::new(Vec::new()),
            routes: std::sync::Mutex::new(VecDeque::new()),
            fail_route_ops: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Inject a packet as if the OS wrote it to the interface.
    pub async fn inject(&self, packet: Vec<u8>) {
        self.inbound_tx.send(packet).await.expect("MemoryTun closed");
    }

    /// Await the next packet the daemon delivered to the interface.
    pub async fn delivered(&self) -> Option<Vec<u8>> {
        self.outbound.lock().await.recv().await
    }

    pub fn applied_routes(&self) -> Vec<Prefix> {
        self.routes.lock().unwrap().iter().copied().collect()
    }

    fn route_ops_fail(&self) -> bool {
        self.fail_route_ops.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl TunDevice for MemoryTun {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("MemoryTun closed"))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<()> {
        self.outbound_tx
            .send(packet.to_vec())
            .await
            .map_err(|_| anyhow::anyhow!("MemoryTun closed"))
    }

    async fn set_addresses(&self, addrs: &[String]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("set_addresses {}", addrs.join(" ")));
        Ok(())
    }

    async fn add_route(&self, prefix: &Prefix) -> Result<()> {
        if self.route_ops_fail() {
            anyhow::bail!("interface route add refused");
        }
        self.calls.lock().unwrap().push(format!("add_route {prefix}"));
        self.routes.lock().unwrap().push_back(*prefix);
        Ok(())
    }

    async fn remove_route(&self, prefix: &Prefix) -> Result<()> {
        if self.route_ops_fail() {
            anyhow::bail!("interface route del refused");
        }
        self.calls.lock().unwrap().push(format!("remove_route {prefix}"));
        self.routes.lock().unwrap().retain(|p| p != prefix);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        crate::streams::MAX_PACKET_SIZE
    }
}
