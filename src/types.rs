//! Domain primitives shared across the control core.
//!
//! These types are deliberately small and value-like: the distributor holds
//! teams and ranges by copy, and every identifier is a plain UUID alias so
//! that persisted metadata rows round-trip through serde without wrappers.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A key in the unbounded byte-key space.
pub type Key = Bytes;

/// Identifier of a storage server.
pub type ServerId = Uuid;

/// Identifier of a distributor incarnation.
pub type DistributorId = Uuid;

/// Identifier of a tracked data move.
pub type DataMoveId = Uuid;

/// Identifier of a consistency audit.
pub type AuditId = Uuid;

/// Identifier of a cluster snapshot.
pub type SnapshotId = Uuid;

/// Identifier of a datacenter (region role is carried separately).
pub type DcId = String;

/// Name of a tenant, for storage-quota reporting.
pub type TenantName = String;

/// The distinguished data-move id meaning "no tracked move".
pub const ANONYMOUS_DATA_MOVE: DataMoveId = Uuid::nil();

/// High half of the id namespace reserved for the blob migrator.
pub const BLOB_MIGRATOR_ID_HIGH: u64 = 0x626c_6f62_6d69_6772;

/// True if the server id belongs to the blob migrator's reserved namespace.
pub fn is_blob_migrator(id: &ServerId) -> bool {
    id.as_u64_pair().0 == BLOB_MIGRATOR_ID_HIGH
}

/// Mint a server id inside the blob migrator's reserved namespace.
pub fn blob_migrator_id(low: u64) -> ServerId {
    Uuid::from_u64_pair(BLOB_MIGRATOR_ID_HIGH, low)
}

/// The exclusive upper bound of the user keyspace.
///
/// All user keys are strictly below a single `0xff` byte; the partition of
/// [`KeyRange::all`] therefore tiles `["", "\xff")`.
pub fn max_key() -> Key {
    Bytes::from_static(b"\xff")
}

/// A half-open interval `[begin, end)` over the byte-key space.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    /// Create a range. `begin` must not exceed `end`.
    pub fn new(begin: impl Into<Key>, end: impl Into<Key>) -> Self {
        let begin = begin.into();
        let end = end.into();
        assert!(begin <= end, "range begin must not exceed end");
        Self { begin, end }
    }

    /// The full keyspace, `["", "\xff")`.
    pub fn all() -> Self {
        Self {
            begin: Bytes::new(),
            end: max_key(),
        }
    }

    /// True if the range contains no keys.
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// True if `key` falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.begin && *key < self.end
    }

    /// True if `other` is fully inside this range.
    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.begin >= self.begin && other.end <= self.end
    }

    /// True if the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

fn fmt_key(f: &mut fmt::Formatter<'_>, key: &Key) -> fmt::Result {
    if key.is_empty() {
        return write!(f, "''");
    }
    for b in key.iter() {
        if b.is_ascii_graphic() {
            write!(f, "{}", *b as char)?;
        } else {
            write!(f, "\\x{b:02x}")?;
        }
    }
    Ok(())
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        fmt_key(f, &self.begin)?;
        write!(f, ", ")?;
        fmt_key(f, &self.end)?;
        write!(f, ")")
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A set of storage servers jointly responsible for a shard's replicas in
/// one region. Held by value; ordering of members is canonicalized so that
/// equality and subset checks are structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Team {
    servers: Vec<ServerId>,
    primary: bool,
}

impl Team {
    /// Create a team from its members; duplicates are removed and members
    /// are stored sorted.
    pub fn new(mut servers: Vec<ServerId>, primary: bool) -> Self {
        servers.sort_unstable();
        servers.dedup();
        Self { servers, primary }
    }

    pub fn servers(&self) -> &[ServerId] {
        &self.servers
    }

    pub fn is_primary(&self) -> bool {
        self.primary
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: &ServerId) -> bool {
        self.servers.binary_search(id).is_ok()
    }

    /// True if every member of `self` is also a member of `other`.
    pub fn is_subset_of(&self, other: &Team) -> bool {
        self.servers.iter().all(|s| other.contains(s))
    }
}

/// Storage engine backing a storage server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum KeyValueStoreType {
    Memory,
    SsdBtreeV2,
    SsdRocksdbV1,
    SsdRedwoodV1,
}

/// Per-server metadata driving the wiggle order.
///
/// Ordering is the wiggle priority: wrongly-configured servers sort strictly
/// before correctly-configured ones regardless of age; within each class,
/// least-recently-created first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMetadata {
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub store_type: KeyValueStoreType,
    pub wrong_configured: bool,
}

impl StorageMetadata {
    pub fn new(created_at_ms: u64, store_type: KeyValueStoreType) -> Self {
        Self {
            created_at_ms,
            store_type,
            wrong_configured: false,
        }
    }

    pub fn wrongly_configured(created_at_ms: u64, store_type: KeyValueStoreType) -> Self {
        Self {
            created_at_ms,
            store_type,
            wrong_configured: true,
        }
    }
}

impl Ord for StorageMetadata {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // true < false: misconfigured servers jump the queue
        other
            .wrong_configured
            .cmp(&self.wrong_configured)
            .then(self.created_at_ms.cmp(&other.created_at_ms))
            .then(self.store_type.cmp(&other.store_type))
    }
}

impl PartialOrd for StorageMetadata {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Directory entry for a storage server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerInfo {
    pub id: ServerId,
    pub dc_id: Option<DcId>,
    /// Testing storage servers may not obey consistency rules and are
    /// excluded from audits.
    pub is_tss: bool,
    pub address: SocketAddr,
    pub secondary_address: Option<SocketAddr>,
}

/// Replica locations for one sub-range, grouped by region role.
#[derive(Debug, Clone)]
pub struct RangeLocations {
    pub range: KeyRange,
    /// Replicas in the primary datacenter.
    pub primary_servers: Vec<StorageServerInfo>,
    /// Replicas in each remote datacenter, keyed by DC id.
    pub remote_servers: BTreeMap<DcId, Vec<StorageServerInfo>>,
}

/// An operator-supplied exclusion target: an IP with an optional port.
/// A bare IP excludes every process on the machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressExclusion {
    pub ip: std::net::IpAddr,
    pub port: Option<u16>,
}

impl AddressExclusion {
    pub fn machine(ip: std::net::IpAddr) -> Self {
        Self { ip, port: None }
    }

    pub fn process(ip: std::net::IpAddr, port: u16) -> Self {
        Self {
            ip,
            port: Some(port),
        }
    }

    /// True if the exclusion covers the given address.
    pub fn excludes(&self, addr: &SocketAddr) -> bool {
        self.ip == addr.ip() && self.port.map_or(true, |p| p == addr.port())
    }
}

/// Size metrics for one shard, as reported by the shard tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMetric {
    pub range: KeyRange,
    pub shard_bytes: u64,
}
