//! The on-disk persistent cache: an A-record map, an NS-record map,
//! and an AAAA-record map, each keyed by domain name and holding a
//! list of (value, expiry) pairs.
//!
//! Expiry is an absolute Unix timestamp rather than a `TTL` or an
//! `Instant`, because the cache is persisted to JSON between runs and
//! a relative duration would not survive a restart.

use std::collections::HashMap;
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use dns_types::protocol::types::{DomainName, RecordType, RecordTypeWithData, ResourceRecord};

pub const MUTEX_POISON_MESSAGE: &str = "cache mutex poisoned";

/// An absolute expiry time, in seconds since the Unix epoch.  `Never`
/// is written to disk as the sentinel `-1` and never becomes stale.
///
/// `Ord`/`PartialOrd` are hand-written rather than derived: a derive
/// orders variants by declaration order before field values, which
/// would make every `At(_)` compare less than `Never` regardless of
/// its timestamp. Comparisons here must instead follow the numeric
/// value each variant represents (`Never` is `-1`, the smallest
/// possible expiry), so that `merge_insert`'s `max` matches spec.md's
/// literal `max(stored, new)` over the numbers, not over the enum tag.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Expiry {
    At(i64),
    Never,
}

impl Expiry {
    pub fn from_ttl(now: i64, ttl: u32) -> Self {
        Expiry::At(now + i64::from(ttl))
    }

    pub fn is_live(self, now: i64) -> bool {
        match self {
            Expiry::Never => true,
            Expiry::At(t) => t > now,
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Expiry::Never => -1,
            Expiry::At(t) => t,
        }
    }
}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_i64().cmp(&other.as_i64())
    }
}

impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_i64())
    }
}

impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let n = i64::deserialize(deserializer)?;
        if n == -1 {
            Ok(Expiry::Never)
        } else if n < -1 {
            Err(D::Error::custom(format!("negative expiry '{n}' other than the -1 sentinel")))
        } else {
            Ok(Expiry::At(n))
        }
    }
}

/// Current time as seconds since the Unix epoch.  The only place this
/// resolver calls into the system clock for cache bookkeeping; kept
/// as a single function so tests can avoid it.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs() as i64
}

fn merge_insert<V: PartialEq>(entries: &mut Vec<(V, Expiry)>, value: V, expiry: Expiry) {
    if let Some(existing) = entries.iter_mut().find(|(v, _)| *v == value) {
        if expiry > existing.1 {
            existing.1 = expiry;
        }
    } else {
        entries.push((value, expiry));
    }
}

fn sweep_entries<V>(entries: &mut HashMap<DomainName, Vec<(V, Expiry)>>, now: i64) {
    entries.retain(|_, vs| {
        vs.retain(|(_, expiry)| expiry.is_live(now));
        !vs.is_empty()
    });
}

/// The in-memory cache.  Wrapped in `SharedCache` for use from async
/// code; this type is the plain, lock-free core so its logic can be
/// unit tested directly.
#[derive(Debug, Clone, Default)]
pub struct Cache {
    pub a: HashMap<DomainName, Vec<(Ipv4Addr, Expiry)>>,
    pub aaaa: HashMap<DomainName, Vec<(Ipv6Addr, Expiry)>>,
    pub ns: HashMap<DomainName, Vec<(DomainName, Expiry)>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_a(&mut self, name: DomainName, address: Ipv4Addr, expiry: Expiry) {
        merge_insert(self.a.entry(name).or_default(), address, expiry);
    }

    pub fn insert_aaaa(&mut self, name: DomainName, address: Ipv6Addr, expiry: Expiry) {
        merge_insert(self.aaaa.entry(name).or_default(), address, expiry);
    }

    pub fn insert_ns(&mut self, zone: DomainName, nsdname: DomainName, expiry: Expiry) {
        merge_insert(self.ns.entry(zone).or_default(), nsdname, expiry);
    }

    /// Folds every A, NS, and AAAA record in a response's answer,
    /// authority, and additional sections into the cache. Records of
    /// any other type are skipped silently, as are records whose
    /// expiry has already passed by the time they are ingested.
    ///
    /// AAAA is ingested alongside A and NS even though upstream
    /// servers only ever deliver it in the additional section (this
    /// resolver never issues an AAAA query of its own): since the
    /// wire codec already decodes it, discarding it here would throw
    /// away glue a later AAAA lookup could otherwise serve from cache.
    pub fn ingest(&mut self, now: i64, rrs: &[ResourceRecord]) {
        for rr in rrs {
            let expiry = Expiry::from_ttl(now, rr.ttl);
            match &rr.rtype_with_data {
                RecordTypeWithData::A { address } => {
                    self.insert_a(rr.name.clone(), *address, expiry);
                }
                RecordTypeWithData::NS { nsdname } => {
                    self.insert_ns(rr.name.clone(), nsdname.clone(), expiry);
                }
                RecordTypeWithData::AAAA { address } => {
                    self.insert_aaaa(rr.name.clone(), *address, expiry);
                }
                RecordTypeWithData::Unknown { .. } => {}
            }
        }
    }

    pub fn lookup_a(&self, now: i64, name: &DomainName) -> Vec<Ipv4Addr> {
        self.lookup_a_with_expiry(now, name)
            .into_iter()
            .map(|(addr, _)| addr)
            .collect()
    }

    pub fn lookup_aaaa(&self, now: i64, name: &DomainName) -> Vec<Ipv6Addr> {
        self.lookup_aaaa_with_expiry(now, name)
            .into_iter()
            .map(|(addr, _)| addr)
            .collect()
    }

    /// Like `lookup_a`, but keeps each entry's expiry so a cache-hit
    /// response can be given a TTL reflecting its remaining lifetime
    /// rather than the TTL it was originally ingested with.
    pub fn lookup_a_with_expiry(&self, now: i64, name: &DomainName) -> Vec<(Ipv4Addr, Expiry)> {
        self.a
            .get(name)
            .into_iter()
            .flatten()
            .filter(|(_, expiry)| expiry.is_live(now))
            .copied()
            .collect()
    }

    pub fn lookup_aaaa_with_expiry(&self, now: i64, name: &DomainName) -> Vec<(Ipv6Addr, Expiry)> {
        self.aaaa
            .get(name)
            .into_iter()
            .flatten()
            .filter(|(_, expiry)| expiry.is_live(now))
            .copied()
            .collect()
    }

    /// Like `lookup_ns_exact`, but keeps each entry's expiry.
    pub fn lookup_ns_exact_with_expiry(
        &self,
        now: i64,
        zone: &DomainName,
    ) -> Vec<(DomainName, Expiry)> {
        self.ns
            .get(zone)
            .into_iter()
            .flatten()
            .filter(|(_, expiry)| expiry.is_live(now))
            .cloned()
            .collect()
    }

    /// Nameservers stored directly against this exact zone name, in
    /// insertion order, live entries only.
    pub fn lookup_ns_exact(&self, now: i64, zone: &DomainName) -> Vec<DomainName> {
        self.ns
            .get(zone)
            .into_iter()
            .flatten()
            .filter(|(_, expiry)| expiry.is_live(now))
            .map(|(ns, _)| ns.clone())
            .collect()
    }

    /// The longest suffix of `name` (including the root) that has a
    /// live NS entry, along with the nameservers for it. Always
    /// succeeds: the root zone `""` is the final fallback, though it
    /// may have no servers if even the root hints are missing.
    pub fn lookup_ns_zone(&self, now: i64, name: &DomainName) -> (DomainName, Vec<DomainName>) {
        let mut candidate = name.clone();
        loop {
            let servers = self.lookup_ns_exact(now, &candidate);
            if !servers.is_empty() || candidate.is_root() {
                return (candidate, servers);
            }
            candidate = candidate.parent().unwrap_or_else(DomainName::root_domain);
        }
    }

    /// Removes every entry (across all three maps) whose expiry has
    /// passed. Entries with the `Never` sentinel are never swept.
    pub fn sweep(&mut self, now: i64) {
        sweep_entries(&mut self.a, now);
        sweep_entries(&mut self.aaaa, now);
        sweep_entries(&mut self.ns, now);
    }

    /// Seeds the A-cache with each root hint's address, as a
    /// `Never`-expiring entry. Per spec.md, the caller should only do
    /// this when the A-cache file was absent at load time, so a real
    /// loaded cache isn't reseeded over on every restart.
    pub fn seed_a_from_hints(&mut self, hints: &HashMap<DomainName, Ipv4Addr>) {
        for (server, address) in hints {
            self.insert_a(server.clone(), *address, Expiry::Never);
        }
    }

    /// Seeds the NS-cache's root zone with the bootstrap server names,
    /// as `Never`-expiring entries. Per spec.md, the caller should only
    /// do this when the NS-cache file was absent at load time.
    pub fn seed_ns_from_hints(&mut self, hints: &HashMap<DomainName, Ipv4Addr>) {
        let root = DomainName::root_domain();
        for server in hints.keys() {
            self.insert_ns(root.clone(), server.clone(), Expiry::Never);
        }
    }

    /// Seeds both maps from the root hints: a convenience for a fresh
    /// install where neither cache file exists yet.
    pub fn seed_from_hints(&mut self, hints: &HashMap<DomainName, Ipv4Addr>) {
        self.seed_a_from_hints(hints);
        self.seed_ns_from_hints(hints);
    }
}

#[derive(Serialize, Deserialize)]
struct ARecordsFile(HashMap<DomainName, Vec<(Ipv4Addr, Expiry)>>);

#[derive(Serialize, Deserialize)]
struct AaaaRecordsFile(HashMap<DomainName, Vec<(Ipv6Addr, Expiry)>>);

#[derive(Serialize, Deserialize)]
struct NsRecordsFile(HashMap<DomainName, Vec<(DomainName, Expiry)>>);

/// Errors loading or persisting the cache files.
#[derive(Debug)]
pub enum CacheFileError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for CacheFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CacheFileError::Io(e) => write!(f, "I/O error: {e}"),
            CacheFileError::Json(e) => write!(f, "JSON error: {e}"),
        }
    }
}

impl std::error::Error for CacheFileError {}

impl From<std::io::Error> for CacheFileError {
    fn from(e: std::io::Error) -> Self {
        CacheFileError::Io(e)
    }
}

impl From<serde_json::Error> for CacheFileError {
    fn from(e: serde_json::Error) -> Self {
        CacheFileError::Json(e)
    }
}

/// Paths to the two on-disk cache files.
pub struct CachePaths {
    pub a: std::path::PathBuf,
    pub ns: std::path::PathBuf,
    pub aaaa: Option<std::path::PathBuf>,
}

impl Cache {
    /// Loads the A-records and NS-records caches from disk. A missing
    /// file is treated as an empty cache, not an error, since a fresh
    /// install has none yet.
    pub fn load(paths: &CachePaths) -> Result<Self, CacheFileError> {
        let a = load_or_default::<ARecordsFile>(&paths.a)?.0;
        let ns = load_or_default::<NsRecordsFile>(&paths.ns)?.0;
        let aaaa = match &paths.aaaa {
            Some(p) => load_or_default::<AaaaRecordsFile>(p)?.0,
            None => HashMap::new(),
        };
        Ok(Cache { a, aaaa, ns })
    }

    /// Writes both cache files to disk, overwriting whatever is
    /// there. The AAAA cache is only written if a path for it was
    /// configured, since its file is a supplement to the documented
    /// two-file layout rather than a mandated third file.
    pub fn persist(&self, paths: &CachePaths) -> Result<(), CacheFileError> {
        write_json(&paths.a, &ARecordsFile(self.a.clone()))?;
        write_json(&paths.ns, &NsRecordsFile(self.ns.clone()))?;
        if let Some(p) = &paths.aaaa {
            write_json(p, &AaaaRecordsFile(self.aaaa.clone()))?;
        }
        Ok(())
    }
}

fn load_or_default<T: for<'de> Deserialize<'de> + Default>(
    path: &Path,
) -> Result<T, CacheFileError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

impl Default for ARecordsFile {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl Default for AaaaRecordsFile {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl Default for NsRecordsFile {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CacheFileError> {
    let serialised = serde_json::to_string(value)?;
    fs::write(path, serialised)?;
    Ok(())
}

/// A `Cache` behind a mutex, cloneable and shareable across the
/// single-threaded server loop and its recursive resolution calls.
#[derive(Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

impl SharedCache {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    pub fn ingest(&self, now: i64, rrs: &[ResourceRecord]) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).ingest(now, rrs);
    }

    pub fn lookup_a(&self, now: i64, name: &DomainName) -> Vec<Ipv4Addr> {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).lookup_a(now, name)
    }

    pub fn lookup_aaaa(&self, now: i64, name: &DomainName) -> Vec<Ipv6Addr> {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).lookup_aaaa(now, name)
    }

    pub fn lookup_ns_zone(&self, now: i64, name: &DomainName) -> (DomainName, Vec<DomainName>) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).lookup_ns_zone(now, name)
    }

    pub fn sweep(&self, now: i64) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).sweep(now);
    }

    pub fn persist(&self, paths: &CachePaths) -> Result<(), CacheFileError> {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).persist(paths)
    }

    /// Used only by tests and by the one-shot qtype-restricted cache
    /// lookup in the resolver, which needs to distinguish "checked
    /// the cache and it was empty" from "this qtype isn't cacheable".
    pub fn snapshot(&self) -> Cache {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    #[test]
    fn insert_merges_by_max_expiry() {
        let mut cache = Cache::new();
        let name = domain("example.com.");
        let addr = Ipv4Addr::new(93, 184, 216, 34);
        cache.insert_a(name.clone(), addr, Expiry::At(100));
        cache.insert_a(name.clone(), addr, Expiry::At(200));
        let entries = &cache.a[&name];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, Expiry::At(200));
    }

    #[test]
    fn insert_merges_even_when_first_expiry_is_later() {
        let mut cache = Cache::new();
        let name = domain("example.com.");
        let addr = Ipv4Addr::new(93, 184, 216, 34);
        cache.insert_a(name.clone(), addr, Expiry::At(200));
        cache.insert_a(name.clone(), addr, Expiry::At(100));
        let entries = &cache.a[&name];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, Expiry::At(200));
    }

    #[test]
    fn expiry_never_is_numerically_smaller_than_any_at() {
        // `Never` is the on-disk `-1` sentinel, which must be the
        // smallest possible value for `merge_insert`'s max to behave
        // like spec.md's literal `max(stored, now + ttl)`.
        assert!(Expiry::Never < Expiry::At(0));
        assert!(Expiry::Never < Expiry::At(-100));
        assert!(Expiry::At(100) > Expiry::Never);
    }

    #[test]
    fn insert_a_real_ttl_overrides_a_never_expiring_hint() {
        let mut cache = Cache::new();
        let name = domain("a.root-servers.net.");
        let addr = Ipv4Addr::new(198, 41, 0, 4);
        cache.insert_a(name.clone(), addr, Expiry::Never);
        cache.insert_a(name.clone(), addr, Expiry::At(500));
        let entries = &cache.a[&name];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, Expiry::At(500));
    }

    #[test]
    fn sweep_removes_expired_entries_only() {
        let mut cache = Cache::new();
        let live = domain("live.example.");
        let dead = domain("dead.example.");
        cache.insert_a(live.clone(), Ipv4Addr::new(1, 1, 1, 1), Expiry::At(1000));
        cache.insert_a(dead.clone(), Ipv4Addr::new(2, 2, 2, 2), Expiry::At(10));
        cache.sweep(500);
        assert!(cache.a.contains_key(&live));
        assert!(!cache.a.contains_key(&dead));
    }

    #[test]
    fn sweep_never_removes_sentinel_entries() {
        let mut cache = Cache::new();
        let name = domain("forever.example.");
        cache.insert_a(name.clone(), Ipv4Addr::new(1, 1, 1, 1), Expiry::Never);
        cache.sweep(i64::MAX);
        assert!(cache.a.contains_key(&name));
    }

    #[test]
    fn ingest_processes_a_ns_and_aaaa() {
        let mut cache = Cache::new();
        let rrs = vec![
            a_record("example.com.", Ipv4Addr::new(93, 184, 216, 34)),
            aaaa_record("example.com.", "2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()),
            ns_record("com.", "a.gtld-servers.net."),
            unknown_record("example.com.", 15, b"unused"),
        ];
        cache.ingest(0, &rrs);
        assert_eq!(cache.lookup_a(0, &domain("example.com.")).len(), 1);
        assert_eq!(cache.lookup_aaaa(0, &domain("example.com.")).len(), 1);
        assert_eq!(cache.lookup_ns_exact(0, &domain("com.")).len(), 1);
    }

    #[test]
    fn longest_suffix_match_prefers_most_specific_zone() {
        let mut cache = Cache::new();
        cache.insert_ns(domain("."), domain("a.root-servers.net."), Expiry::Never);
        cache.insert_ns(domain("com."), domain("a.gtld-servers.net."), Expiry::Never);
        cache.insert_ns(
            domain("example.com."),
            domain("ns1.example.com."),
            Expiry::Never,
        );

        let (zone, servers) = cache.lookup_ns_zone(0, &domain("www.example.com."));
        assert_eq!(zone, domain("example.com."));
        assert_eq!(servers, vec![domain("ns1.example.com.")]);

        let (zone, _) = cache.lookup_ns_zone(0, &domain("other.net."));
        assert_eq!(zone, domain("."));
    }

    #[test]
    fn longest_suffix_match_falls_back_to_root_with_no_servers() {
        let cache = Cache::new();
        let (zone, servers) = cache.lookup_ns_zone(0, &domain("example.com."));
        assert_eq!(zone, domain("."));
        assert!(servers.is_empty());
    }

    #[test]
    fn seed_from_hints_populates_root_ns_and_a() {
        let mut cache = Cache::new();
        let mut hints = HashMap::new();
        hints.insert(domain("a.root-servers.net."), Ipv4Addr::new(198, 41, 0, 4));
        cache.seed_from_hints(&hints);

        let (zone, servers) = cache.lookup_ns_zone(0, &domain("example.com."));
        assert_eq!(zone, domain("."));
        assert_eq!(servers, vec![domain("a.root-servers.net.")]);
        assert_eq!(
            cache.lookup_a(0, &domain("a.root-servers.net.")),
            vec![Ipv4Addr::new(198, 41, 0, 4)]
        );
    }

    #[test]
    fn expiry_json_uses_sentinel() {
        assert_eq!(serde_json::to_string(&Expiry::Never).unwrap(), "-1");
        assert_eq!(serde_json::to_string(&Expiry::At(42)).unwrap(), "42");
        assert_eq!(
            serde_json::from_str::<Expiry>("-1").unwrap(),
            Expiry::Never
        );
        assert_eq!(
            serde_json::from_str::<Expiry>("42").unwrap(),
            Expiry::At(42)
        );
    }
}
