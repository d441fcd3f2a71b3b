//! Data model: typed entity indices, entity records and DNS enums.
//!
//! Entities reference each other through dense, zero-based indices that stay
//! valid for the lifetime of the process. Indices are plain `Copy` newtypes
//! so they can be stored anywhere without borrowing the tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placeholder stored instead of a domain name when privacy hides domains.
pub const HIDDEN_DOMAIN: &str = "hidden";

/// Placeholder stored instead of a client address when privacy hides clients.
pub const HIDDEN_CLIENT: &str = "0.0.0.0";

/// Common behaviour of the typed entity indices.
pub trait EntityId: Copy + Eq + Ord + fmt::Debug {
    /// Human-readable entity kind, used in error messages.
    const KIND: &'static str;

    /// Creates an id from a table position, or `None` if it does not fit.
    fn from_index(index: usize) -> Option<Self>;

    /// Returns the table position of this id.
    fn index(self) -> usize;
}

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Creates an id from a raw index.
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            /// Returns the raw index.
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl EntityId for $name {
            const KIND: &'static str = $kind;

            fn from_index(index: usize) -> Option<Self> {
                u32::try_from(index).ok().map(Self)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", $kind, self.0)
            }
        }
    };
}

entity_id!(
    /// Index of a [`Domain`] in the domain table.
    DomainId,
    "domain"
);
entity_id!(
    /// Index of a [`Client`] in the client table.
    ClientId,
    "client"
);
entity_id!(
    /// Index of an [`Upstream`] in the upstream table.
    UpstreamId,
    "upstream"
);
entity_id!(
    /// Index of a [`Query`] in the query table.
    QueryId,
    "query"
);

/// DNS query type, as counted in the per-type histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    /// IPv4 address.
    A,
    /// IPv6 address.
    Aaaa,
    /// Any record.
    Any,
    /// Service locator.
    Srv,
    /// Start of authority.
    Soa,
    /// Reverse lookup.
    Ptr,
    /// Text record.
    Txt,
    /// Naming authority pointer.
    Naptr,
    /// Mail exchange.
    Mx,
    /// Delegation signer.
    Ds,
    /// DNSSEC signature.
    Rrsig,
    /// DNSSEC key.
    Dnskey,
    /// Name server.
    Ns,
    /// Everything not listed here.
    Other,
    /// Service binding.
    Svcb,
    /// HTTPS binding.
    Https,
}

impl QueryType {
    /// Number of query types.
    pub const COUNT: usize = 16;

    /// All query types in histogram order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::A,
        Self::Aaaa,
        Self::Any,
        Self::Srv,
        Self::Soa,
        Self::Ptr,
        Self::Txt,
        Self::Naptr,
        Self::Mx,
        Self::Ds,
        Self::Rrsig,
        Self::Dnskey,
        Self::Ns,
        Self::Other,
        Self::Svcb,
        Self::Https,
    ];

    /// Returns the wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Any => "ANY",
            Self::Srv => "SRV",
            Self::Soa => "SOA",
            Self::Ptr => "PTR",
            Self::Txt => "TXT",
            Self::Naptr => "NAPTR",
            Self::Mx => "MX",
            Self::Ds => "DS",
            Self::Rrsig => "RRSIG",
            Self::Dnskey => "DNSKEY",
            Self::Ns => "NS",
            Self::Other => "OTHER",
            Self::Svcb => "SVCB",
            Self::Https => "HTTPS",
        }
    }

    /// Position of this type in [`QueryType::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Persisted integer code (1-based).
    pub fn code(self) -> i64 {
        self as i64 + 1
    }

    /// Maps a persisted code back to a type; unknown codes become `Other`.
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code - 1)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(Self::Other)
    }
}

/// How a query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    /// Status not (yet) known.
    Unknown,
    /// Blocked by the gravity blocklist.
    Gravity,
    /// Forwarded to an upstream server.
    Forwarded,
    /// Answered from the local cache.
    Cache,
    /// Blocked by a regex deny rule.
    Regex,
    /// Blocked by an exact deny rule.
    Denylist,
    /// Upstream answered with a known blocking IP.
    ExternalBlockedIp,
    /// Upstream answered with the null address.
    ExternalBlockedNull,
    /// Upstream answered NXDOMAIN without recursion-available.
    ExternalBlockedNxra,
    /// CNAME target blocked by gravity.
    GravityCname,
    /// CNAME target blocked by regex.
    RegexCname,
    /// CNAME target blocked by an exact deny rule.
    DenylistCname,
    /// Forwarded again after a retry.
    Retried,
    /// Retried because of DNSSEC.
    RetriedDnssec,
    /// Still being resolved.
    InProgress,
    /// Blocked because the blocklist database was busy.
    Dbbusy,
    /// Blocked as a special-purpose domain.
    SpecialDomain,
    /// Answered from the cache with a stale record.
    CacheStale,
    /// Upstream signalled blocking with extended error 15.
    ExternalBlockedEde15,
}

impl QueryStatus {
    /// Number of statuses.
    pub const COUNT: usize = 19;

    /// All statuses in histogram order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Unknown,
        Self::Gravity,
        Self::Forwarded,
        Self::Cache,
        Self::Regex,
        Self::Denylist,
        Self::ExternalBlockedIp,
        Self::ExternalBlockedNull,
        Self::ExternalBlockedNxra,
        Self::GravityCname,
        Self::RegexCname,
        Self::DenylistCname,
        Self::Retried,
        Self::RetriedDnssec,
        Self::InProgress,
        Self::Dbbusy,
        Self::SpecialDomain,
        Self::CacheStale,
        Self::ExternalBlockedEde15,
    ];

    /// Returns the wire name of this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Gravity => "GRAVITY",
            Self::Forwarded => "FORWARDED",
            Self::Cache => "CACHE",
            Self::Regex => "REGEX",
            Self::Denylist => "DENYLIST",
            Self::ExternalBlockedIp => "EXTERNAL_BLOCKED_IP",
            Self::ExternalBlockedNull => "EXTERNAL_BLOCKED_NULL",
            Self::ExternalBlockedNxra => "EXTERNAL_BLOCKED_NXRA",
            Self::GravityCname => "GRAVITY_CNAME",
            Self::RegexCname => "REGEX_CNAME",
            Self::DenylistCname => "DENYLIST_CNAME",
            Self::Retried => "RETRIED",
            Self::RetriedDnssec => "RETRIED_DNSSEC",
            Self::InProgress => "IN_PROGRESS",
            Self::Dbbusy => "DBBUSY",
            Self::SpecialDomain => "SPECIAL_DOMAIN",
            Self::CacheStale => "CACHE_STALE",
            Self::ExternalBlockedEde15 => "EXTERNAL_BLOCKED_EDE15",
        }
    }

    /// Position of this status in [`QueryStatus::ALL`], also its persisted code.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Persisted integer code.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Maps a persisted code back to a status; unknown codes become `Unknown`.
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(Self::Unknown)
    }

    /// Returns true if this status means the answer was blocked.
    pub fn is_blocked(self) -> bool {
        matches!(
            self,
            Self::Gravity
                | Self::Regex
                | Self::Denylist
                | Self::ExternalBlockedIp
                | Self::ExternalBlockedNull
                | Self::ExternalBlockedNxra
                | Self::GravityCname
                | Self::RegexCname
                | Self::DenylistCname
                | Self::Dbbusy
                | Self::SpecialDomain
                | Self::ExternalBlockedEde15
        )
    }

    /// Returns true if this status means the query went to an upstream.
    pub fn is_forwarded(self) -> bool {
        matches!(self, Self::Forwarded | Self::Retried | Self::RetriedDnssec)
    }

    /// Returns true if this status means the answer came from the cache.
    pub fn is_cached(self) -> bool {
        matches!(self, Self::Cache | Self::CacheStale)
    }
}

/// Shape of the reply that was sent back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyType {
    /// No reply recorded.
    Unknown,
    /// Empty answer section.
    Nodata,
    /// Name does not exist.
    Nxdomain,
    /// CNAME answer.
    Cname,
    /// Address answer.
    Ip,
    /// Domain answer (PTR and friends).
    Domain,
    /// Resource-record name answer.
    Rrname,
    /// Server failure.
    Servfail,
    /// Refused.
    Refused,
    /// Not implemented.
    Notimp,
    /// Any other reply code.
    Other,
    /// DNSSEC record.
    Dnssec,
    /// No reply sent.
    None,
    /// Binary data.
    Blob,
}

impl ReplyType {
    /// Number of reply types.
    pub const COUNT: usize = 14;

    /// All reply types in histogram order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Unknown,
        Self::Nodata,
        Self::Nxdomain,
        Self::Cname,
        Self::Ip,
        Self::Domain,
        Self::Rrname,
        Self::Servfail,
        Self::Refused,
        Self::Notimp,
        Self::Other,
        Self::Dnssec,
        Self::None,
        Self::Blob,
    ];

    /// Returns the wire name of this reply type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Nodata => "NODATA",
            Self::Nxdomain => "NXDOMAIN",
            Self::Cname => "CNAME",
            Self::Ip => "IP",
            Self::Domain => "DOMAIN",
            Self::Rrname => "RRNAME",
            Self::Servfail => "SERVFAIL",
            Self::Refused => "REFUSED",
            Self::Notimp => "NOTIMP",
            Self::Other => "OTHER",
            Self::Dnssec => "DNSSEC",
            Self::None => "NONE",
            Self::Blob => "BLOB",
        }
    }

    /// Position of this reply type in [`ReplyType::ALL`], also its persisted code.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Persisted integer code.
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Maps a persisted code back to a reply type; unknown codes become `Unknown`.
    pub fn from_code(code: i64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(Self::Unknown)
    }
}

/// Upstream server address as reported by the resolution engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamAddr {
    /// Server IP address.
    pub ip: String,
    /// Optional host name of the server.
    #[serde(default)]
    pub name: Option<String>,
    /// Server port.
    pub port: u16,
}

/// A completed query as produced by the resolution engine.
///
/// The same record is the unit of durable storage: one row per query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// Unix timestamp (seconds) at which the query arrived.
    pub timestamp: i64,
    /// Requested domain.
    pub domain: String,
    /// Requesting client's IP address.
    pub client_ip: String,
    /// Requesting client's host name, if known.
    #[serde(default)]
    pub client_name: Option<String>,
    /// Upstream that answered, or `None` for cache/blocklist answers.
    #[serde(default)]
    pub upstream: Option<UpstreamAddr>,
    /// Query type.
    pub query_type: QueryType,
    /// How the query was answered.
    pub status: QueryStatus,
    /// Reply shape.
    #[serde(default = "default_reply")]
    pub reply: ReplyType,
    /// Upstream response time in seconds, if the query was timed.
    #[serde(default)]
    pub response_time: Option<f64>,
}

fn default_reply() -> ReplyType {
    ReplyType::Unknown
}

/// Persistence progress of an in-memory query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// Completed, not yet handed to the persistence worker.
    Pending,
    /// Sitting in the durable-write queue.
    Queued,
    /// Written to durable storage.
    Stored,
}

/// One resolved query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    /// Requested domain.
    pub domain: DomainId,
    /// Requesting client.
    pub client: ClientId,
    /// Answering upstream, `None` for cache and blocklist answers.
    pub upstream: Option<UpstreamId>,
    /// Query type.
    pub query_type: QueryType,
    /// Answer status.
    pub status: QueryStatus,
    /// Reply shape.
    pub reply: ReplyType,
    /// Whether the answer was blocked.
    pub blocked: bool,
    /// Upstream response time in seconds, if timed.
    pub response_time: Option<f64>,
    pub(crate) persistence: Persistence,
}

impl Query {
    /// Returns how far this query has progressed towards durable storage.
    pub fn persistence(&self) -> Persistence {
        self.persistence
    }
}

/// An interned domain with its answer counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    /// Domain name (or [`HIDDEN_DOMAIN`]).
    pub name: String,
    /// Permitted answers.
    pub count: u32,
    /// Blocked answers.
    pub blocked_count: u32,
}

impl Domain {
    /// Total answers for this domain.
    pub fn total(&self) -> u32 {
        self.count.saturating_add(self.blocked_count)
    }
}

/// A client host (or a virtual alias client aggregating several hosts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// IP address (or [`HIDDEN_CLIENT`], or `aliasclient-<id>` for alias clients).
    pub ip: String,
    /// Host name, if known.
    pub name: Option<String>,
    /// Total queries.
    pub count: u32,
    /// Blocked queries.
    pub blocked_count: u32,
    /// Per-bucket query totals, parallel to the global OverTime ring.
    pub over_time: Vec<u32>,
    /// Alias client this client's traffic is aggregated into.
    pub alias_id: Option<ClientId>,
    /// Whether this entity is itself an alias client.
    pub is_alias: bool,
    /// Hardware address learned from the neighbor cache.
    pub hwaddr: Option<String>,
    /// Vendor of the hardware address, if known.
    pub vendor: Option<String>,
}

impl Client {
    pub(crate) fn new(ip: String, name: Option<String>, slots: usize) -> Self {
        Self {
            ip,
            name,
            count: 0,
            blocked_count: 0,
            over_time: vec![0; slots],
            alias_id: None,
            is_alias: false,
            hwaddr: None,
            vendor: None,
        }
    }

    /// Returns true if this client's traffic is represented by an alias client.
    ///
    /// Such clients are left out of every client-level read endpoint so their
    /// queries are not counted twice.
    pub fn is_alias_managed(&self) -> bool {
        !self.is_alias && self.alias_id.is_some()
    }
}

/// An upstream DNS server with response-time accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    /// Server IP address.
    pub ip: String,
    /// Server host name, if known.
    pub name: Option<String>,
    /// Server port.
    pub port: u16,
    /// Queries forwarded to this server.
    pub count: u32,
    /// Sum of all timed response times (seconds).
    pub response_time_sum: f64,
    /// Sum of squared deviations from the running mean.
    pub response_variance: f64,
    /// Number of timed responses.
    pub responses: u32,
}

impl Upstream {
    pub(crate) fn new(addr: &UpstreamAddr) -> Self {
        Self {
            ip: addr.ip.clone(),
            name: addr.name.clone(),
            port: addr.port,
            count: 0,
            response_time_sum: 0.0,
            response_variance: 0.0,
            responses: 0,
        }
    }

    /// Folds one timed response into the accumulators.
    pub(crate) fn add_response(&mut self, seconds: f64) {
        self.responses = self.responses.saturating_add(1);
        self.response_time_sum += seconds;
        let mean = self.response_time_sum / f64::from(self.responses);
        self.response_variance += (seconds - mean) * (seconds - mean);
    }

    /// Mean response time in seconds, `0.0` without timed responses.
    pub fn mean_response(&self) -> f64 {
        if self.responses == 0 {
            return 0.0;
        }
        self.response_time_sum / f64::from(self.responses)
    }

    /// Uncertainty of the mean, defined only with more than one response.
    pub fn uncertainty(&self) -> Option<f64> {
        if self.responses < 2 {
            return None;
        }
        let n = f64::from(self.responses);
        Some((self.response_variance / n / (n - 1.0)).sqrt())
    }
}

/// One row of the local neighbor (ARP) cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    /// IP address of the neighbor.
    pub ip: String,
    /// Hardware address, lower-case colon-separated.
    pub hwaddr: String,
    /// Interface the neighbor was seen on.
    pub interface: String,
}

/// Definition of an alias client as kept in durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasClientDef {
    /// Persistent alias-client id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// IP addresses of the physical clients aggregated into this alias.
    pub members: Vec<String>,
}

impl AliasClientDef {
    /// Synthetic address under which the alias client is interned.
    pub fn address(&self) -> String {
        format!("aliasclient-{}", self.id)
    }
}
