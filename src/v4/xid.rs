//! Transaction id generators.

use rand::{rngs::OsRng, rngs::StdRng, RngCore, SeedableRng, TryRngCore};
use std::{
    io,
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

/// Source of transaction ids. Shared generators must serialize their draws.
pub trait XidGenerator: Send + Sync {
    fn next_xid(&self) -> io::Result<u32>;
}

impl<F> XidGenerator for F
where
    F: Fn() -> io::Result<u32> + Send + Sync,
{
    fn next_xid(&self) -> io::Result<u32> {
        self()
    }
}

/// Draws every id from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoXid;

impl XidGenerator for CryptoXid {
    fn next_xid(&self) -> io::Result<u32> {
        let mut xid = [0u8; 4];
        OsRng.try_fill_bytes(&mut xid).map_err(io::Error::other)?;
        Ok(u32::from_be_bytes(xid))
    }
}

/// A pseudorandom stream seeded once from the hardware address and the
/// current time.
#[derive(Debug)]
pub struct SeededXid {
    rng: Mutex<StdRng>,
}

impl SeededXid {
    pub fn new(hardware_addr: &[u8]) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        Self::from_seed(seed(hardware_addr, nanos))
    }

    fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl XidGenerator for SeededXid {
    fn next_xid(&self) -> io::Result<u32> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rng.next_u32())
    }
}

/// FNV-1a over the hardware address followed by the timestamp.
fn seed(hardware_addr: &[u8], nanos: u128) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    hardware_addr
        .iter()
        .copied()
        .chain(nanos.to_le_bytes())
        .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME))
}
