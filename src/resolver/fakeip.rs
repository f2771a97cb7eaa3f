//! Fake-IP pool
//!
//! Maintains a bijection between hostnames and virtual IPv4 addresses
//! drawn from a configured CIDR. The mapping is bounded: once the pool
//! holds `capacity` hosts, the least recently used mapping is evicted
//! and its address recycled. Eviction and reverse-map removal happen in
//! one critical section so the bijection never dangles.
//!
//! The pool state can be persisted to a snapshot file and reloaded at
//! construction, so allocations survive a process restart.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::iter::Cycle;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use ipnet::{Ipv4AddrRange, Ipv4Net};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

/// Snapshot file magic bytes
const STORE_MAGIC: &[u8; 4] = b"FKIP";
/// Snapshot format version
const STORE_VERSION: u8 = 1;

struct PoolState {
    /// host -> address, recency-ordered and bounded
    cache: LruCache<String, Ipv4Addr>,
    /// address -> host reverse side of the bijection
    reverse: HashMap<Ipv4Addr, String>,
    /// cycling allocator over the range
    cycle: Cycle<Ipv4AddrRange>,
}

/// LRU-bounded hostname ↔ virtual-IPv4 bijection
pub struct FakeIpPool {
    network: Ipv4Net,
    capacity: usize,
    state: Mutex<PoolState>,
    store_path: Option<PathBuf>,
}

impl FakeIpPool {
    /// Create a pool over `network`, holding at most `size` live
    /// mappings (clamped to the number of usable addresses). When
    /// `store_path` names an existing snapshot for the same range, the
    /// previous mappings are restored.
    #[must_use]
    pub fn new(network: Ipv4Net, size: usize, store_path: Option<PathBuf>) -> Self {
        let host_count = network.hosts().count();
        let capacity = size.min(host_count).max(1);
        let pool = Self {
            network,
            capacity,
            state: Mutex::new(PoolState {
                cache: LruCache::new(
                    NonZeroUsize::new(capacity).expect("capacity is at least 1"),
                ),
                reverse: HashMap::new(),
                cycle: network.hosts().cycle(),
            }),
            store_path,
        };

        if let Some(path) = pool.store_path.clone() {
            if path.exists() {
                match pool.load(&path) {
                    Ok(n) => debug!(count = n, path = %path.display(), "fake-ip pool restored"),
                    Err(e) => warn!(path = %path.display(), "fake-ip snapshot load failed: {e}"),
                }
            }
        }

        pool
    }

    /// The configured range
    #[must_use]
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    /// Maximum number of live mappings
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `ip` falls inside the configured range
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.network.contains(&ip)
    }

    /// Whether `ip` is currently mapped to a host
    #[must_use]
    pub fn exist(&self, ip: Ipv4Addr) -> bool {
        self.state.lock().reverse.contains_key(&ip)
    }

    /// Get or allocate the virtual address for `host`
    ///
    /// An existing mapping is refreshed (moved to most-recently-used).
    /// Allocation recycles evicted addresses before advancing the
    /// cycling allocator, and evicts the LRU mapping once the pool is
    /// at capacity.
    pub fn lookup(&self, host: &str) -> Ipv4Addr {
        let mut state = self.state.lock();

        if let Some(ip) = state.cache.get(host) {
            trace!(host, ip = %ip, "fake-ip hit");
            return *ip;
        }

        let ip = Self::allocate(&mut state, self.capacity);
        state.reverse.insert(ip, host.to_string());
        state.cache.put(host.to_string(), ip);
        trace!(host, ip = %ip, "fake-ip allocated");
        ip
    }

    /// Reverse lookup: the host mapped to `ip`, refreshing its recency
    #[must_use]
    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        let mut state = self.state.lock();
        let host = state.reverse.get(&ip).cloned()?;
        // a flow that addressed the virtual IP keeps the mapping warm
        state.cache.get(&host);
        Some(host)
    }

    fn allocate(state: &mut PoolState, capacity: usize) -> Ipv4Addr {
        if state.cache.len() >= capacity {
            // single step: evict and recycle, keeping the bijection intact
            if let Some((evicted_host, ip)) = state.cache.pop_lru() {
                state.reverse.remove(&ip);
                trace!(host = %evicted_host, ip = %ip, "fake-ip evicted");
                return ip;
            }
        }

        // skip addresses still in use; bounded by the pool capacity
        for _ in 0..=capacity {
            let ip = state.cycle.next().expect("fake-ip range is not empty");
            if !state.reverse.contains_key(&ip) {
                return ip;
            }
        }
        // every address in the range is mapped; reclaim the oldest
        let (_, ip) = state
            .cache
            .pop_lru()
            .expect("pool at capacity has an LRU entry");
        state.reverse.remove(&ip);
        ip
    }

    /// Current number of live mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().cache.len()
    }

    /// Whether the pool holds no mappings
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the pool to the configured snapshot file
    ///
    /// Pairs are written oldest-first so a reload restores recency
    /// order. The snapshot is written to a sibling temp file and moved
    /// into place with an atomic rename.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from writing or renaming the snapshot.
    pub fn store(&self) -> io::Result<()> {
        let Some(path) = &self.store_path else {
            return Ok(());
        };

        let mut buf = Vec::new();
        buf.extend_from_slice(STORE_MAGIC);
        buf.push(STORE_VERSION);
        buf.extend_from_slice(&self.network.addr().octets());
        buf.push(self.network.prefix_len());

        let state = self.state.lock();
        let pairs: Vec<(&String, &Ipv4Addr)> = state.cache.iter().collect();
        buf.extend_from_slice(&u32::try_from(pairs.len()).unwrap_or(u32::MAX).to_be_bytes());
        // LruCache iterates MRU-first; reverse for oldest-first on disk
        for (host, ip) in pairs.into_iter().rev() {
            let host_bytes = host.as_bytes();
            buf.extend_from_slice(&u16::try_from(host_bytes.len()).unwrap_or(0).to_be_bytes());
            buf.extend_from_slice(host_bytes);
            buf.extend_from_slice(&ip.octets());
        }
        drop(state);

        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "fake-ip pool stored");
        Ok(())
    }

    /// Load a snapshot written by [`store`](Self::store)
    fn load(&self, path: &Path) -> io::Result<usize> {
        fn take<'a>(data: &'a [u8], cursor: &mut usize, n: usize) -> io::Result<&'a [u8]> {
            let end = *cursor + n;
            let slice = data.get(*cursor..end).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "truncated snapshot")
            })?;
            *cursor = end;
            Ok(slice)
        }

        let mut data = Vec::new();
        fs::File::open(path)?.read_to_end(&mut data)?;
        let mut cursor = 0usize;

        if take(&data, &mut cursor, 4)? != STORE_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        if take(&data, &mut cursor, 1)?[0] != STORE_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad version"));
        }
        let addr_octets: [u8; 4] = take(&data, &mut cursor, 4)?.try_into().unwrap();
        let prefix = take(&data, &mut cursor, 1)?[0];
        if Ipv4Addr::from(addr_octets) != self.network.addr()
            || prefix != self.network.prefix_len()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "snapshot range does not match configured range",
            ));
        }

        let count = u32::from_be_bytes(take(&data, &mut cursor, 4)?.try_into().unwrap()) as usize;
        let mut state = self.state.lock();
        let mut restored = 0usize;
        for _ in 0..count {
            let host_len =
                u16::from_be_bytes(take(&data, &mut cursor, 2)?.try_into().unwrap()) as usize;
            let host = String::from_utf8(take(&data, &mut cursor, host_len)?.to_vec())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 host"))?;
            let octets: [u8; 4] = take(&data, &mut cursor, 4)?.try_into().unwrap();
            let ip = Ipv4Addr::from(octets);
            if !self.network.contains(&ip) {
                continue;
            }
            state.reverse.insert(ip, host.clone());
            state.cache.put(host, ip);
            restored += 1;
        }
        Ok(restored)
    }
}

impl std::fmt::Debug for FakeIpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeIpPool")
            .field("network", &self.network)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
