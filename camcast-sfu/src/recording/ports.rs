//! RTP/RTCP port pairs for recording destinations.
//!
//! A pair is handed out only if it is not reserved by another session and
//! both ports can currently be bound on the recording host. The reservation
//! is released when the returned guard drops.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, SfuError};

struct AllocatorState {
    reserved: BTreeSet<u16>,
    /// Next even port to try
    cursor: u16,
}

pub struct PortAllocator {
    host: IpAddr,
    min_port: u16,
    max_port: u16,
    state: Arc<Mutex<AllocatorState>>,
}

impl PortAllocator {
    /// `min_port` is rounded up to the next even port
    #[must_use]
    pub fn new(host: IpAddr, min_port: u16, max_port: u16) -> Self {
        let first = min_port.saturating_add(min_port % 2);
        Self {
            host,
            min_port: first,
            max_port,
            state: Arc::new(Mutex::new(AllocatorState {
                reserved: BTreeSet::new(),
                cursor: first,
            })),
        }
    }

    /// Reserve an even RTP port and the RTCP port right after it
    pub fn reserve(&self) -> Result<PortReservation> {
        let mut state = self.state.lock();
        let candidates = (u32::from(self.max_port) + 1).saturating_sub(u32::from(self.min_port)) / 2;

        for _ in 0..candidates {
            let rtp_port = state.cursor;
            let next = u32::from(rtp_port) + 2;
            state.cursor = if next + 1 > u32::from(self.max_port) {
                self.min_port
            } else {
                // next <= max_port - 1 < u16::MAX
                next as u16
            };

            if state.reserved.contains(&rtp_port) {
                continue;
            }
            if !self.is_free(rtp_port) || !self.is_free(rtp_port + 1) {
                debug!(rtp_port, "Port pair busy on host, skipping");
                continue;
            }

            state.reserved.insert(rtp_port);
            return Ok(PortReservation {
                rtp_port,
                state: Arc::clone(&self.state),
            });
        }

        Err(SfuError::NoPortAvailable {
            min: self.min_port,
            max: self.max_port,
        })
    }

    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.state.lock().reserved.len()
    }

    fn is_free(&self, port: u16) -> bool {
        UdpSocket::bind(SocketAddr::new(self.host, port)).is_ok()
    }
}

/// A reserved port pair, released on drop
#[derive(Debug)]
pub struct PortReservation {
    rtp_port: u16,
    state: Arc<Mutex<AllocatorState>>,
}

impl PortReservation {
    #[must_use]
    pub const fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    #[must_use]
    pub const fn rtcp_port(&self) -> u16 {
        self.rtp_port + 1
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.state.lock().reserved.remove(&self.rtp_port);
    }
}

impl std::fmt::Debug for AllocatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorState")
            .field("reserved", &self.reserved.len())
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_pairs_are_even_and_distinct() {
        let allocator = PortAllocator::new(LOCALHOST, 31001, 31020);
        let a = allocator.reserve().unwrap();
        let b = allocator.reserve().unwrap();

        assert_eq!(a.rtp_port() % 2, 0);
        assert_eq!(a.rtcp_port(), a.rtp_port() + 1);
        assert_ne!(a.rtp_port(), b.rtp_port());
        assert_eq!(allocator.reserved_count(), 2);

        drop(a);
        assert_eq!(allocator.reserved_count(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new(LOCALHOST, 31100, 31103);
        let _a = allocator.reserve().unwrap();
        let _b = allocator.reserve().unwrap();
        assert!(matches!(
            allocator.reserve(),
            Err(SfuError::NoPortAvailable { .. })
        ));
    }

    #[test]
    fn test_skips_ports_bound_by_others() {
        let _busy = UdpSocket::bind((LOCALHOST, 31200)).unwrap();
        let allocator = PortAllocator::new(LOCALHOST, 31200, 31210);
        let reservation = allocator.reserve().unwrap();
        assert_ne!(reservation.rtp_port(), 31200);
    }
}
