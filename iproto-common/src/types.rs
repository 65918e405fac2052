//! # Wire Vocabulary
//!
//! Request codes, header/body keys, negotiated features, and the small
//! newtypes used to keep sync ids, stream ids, and versions from being mixed
//! up at call sites.
//!
//! ## Design Principles
//!
//! 1. **Numeric Stability**: Every constant matches the on-wire value; these
//!    are a compatibility contract with the server.
//! 2. **Bitfield Features**: Negotiated capabilities fit in one `u32`, so a
//!    feature check is a single mask test on the request path.
//! 3. **Newtypes Over Raw Integers**: `SyncId` and `StreamId` cannot be passed
//!    where the other is expected.
//!
//! ## Frame Layout
//!
//! ```text
//! +-------------------+----------------------+---------------------+
//! | len: msgpack uint | header: msgpack map  | body: msgpack map   |
//! +-------------------+----------------------+---------------------+
//! header keys: 0x00 code | 0x01 sync | 0x05 schema version | 0x0a stream id
//! ```

use std::fmt;

/// Header key: request type (requests) or response status (responses).
pub const KEY_REQUEST_TYPE: u8 = 0x00;
/// Header key: per-request correlation id.
pub const KEY_SYNC: u8 = 0x01;
/// Header key: schema version the request was built against / server reports.
pub const KEY_SCHEMA_VERSION: u8 = 0x05;
/// Header key: stream id for ordered transactional contexts.
pub const KEY_STREAM_ID: u8 = 0x0a;

/// Body key: numeric space id.
pub const KEY_SPACE_ID: u8 = 0x10;
/// Body key: numeric index id.
pub const KEY_INDEX_ID: u8 = 0x11;
/// Body key: select limit.
pub const KEY_LIMIT: u8 = 0x12;
/// Body key: select offset.
pub const KEY_OFFSET: u8 = 0x13;
/// Body key: select iterator.
pub const KEY_ITERATOR: u8 = 0x14;
/// Body key: index key.
pub const KEY_KEY: u8 = 0x20;
/// Body key: tuple or argument list.
pub const KEY_TUPLE: u8 = 0x21;
/// Body key: stored function name.
pub const KEY_FUNCTION_NAME: u8 = 0x22;
/// Body key: user name (auth).
pub const KEY_USER_NAME: u8 = 0x23;
/// Body key: expression for eval.
pub const KEY_EXPR: u8 = 0x27;
/// Body key: update/upsert operations.
pub const KEY_OPS: u8 = 0x28;
/// Body key: response data array.
pub const KEY_DATA: u8 = 0x30;
/// Body key: legacy error message string.
pub const KEY_ERROR_24: u8 = 0x31;
/// Body key: extended error stack.
pub const KEY_ERROR: u8 = 0x52;
/// Body key: protocol version (ID request/response).
pub const KEY_VERSION: u8 = 0x54;
/// Body key: feature list (ID request/response).
pub const KEY_FEATURES: u8 = 0x55;
/// Body key: transaction timeout in seconds (BEGIN).
pub const KEY_TIMEOUT: u8 = 0x56;
/// Body key: watcher event key.
pub const KEY_EVENT_KEY: u8 = 0x57;
/// Body key: watcher event payload.
pub const KEY_EVENT_DATA: u8 = 0x58;
/// Body key: authentication method name (ID response).
pub const KEY_AUTH_TYPE: u8 = 0x5b;
/// Body key: space name (requires the names feature).
pub const KEY_SPACE_NAME: u8 = 0x5e;
/// Body key: index name (requires the names feature).
pub const KEY_INDEX_NAME: u8 = 0x5f;

/// Key inside an extended error map holding the error stack.
pub const ERROR_KEY_STACK: u8 = 0x00;
/// Key inside one error stack entry holding the message.
pub const ERROR_FIELD_MESSAGE: u8 = 0x03;
/// Key inside one error stack entry holding the numeric code.
pub const ERROR_FIELD_CODE: u8 = 0x05;

/// Response status: success.
pub const STATUS_OK: u32 = 0x00;
/// Response status: out-of-band push chunk for an in-flight request.
pub const STATUS_CHUNK: u32 = 0x80;
/// Response status bit marking an error; the low bits carry the error code.
pub const STATUS_ERROR_BIT: u32 = 0x8000;

/// Server error: index does not exist.
pub const ER_NO_SUCH_INDEX: u32 = 35;
/// Server error: space does not exist.
pub const ER_NO_SUCH_SPACE: u32 = 36;
/// Server error: request type is unknown (old servers answering `ID`).
pub const ER_UNKNOWN_REQUEST_TYPE: u32 = 48;
/// Server error: credentials rejected.
pub const ER_CREDENTIALS: u32 = 47;
/// Server error: request schema version does not match the server's.
pub const ER_WRONG_SCHEMA_VERSION: u32 = 109;

/// System view listing spaces visible to the session user.
pub const VSPACE_ID: u32 = 281;
/// System view listing indexes visible to the session user.
pub const VINDEX_ID: u32 = 289;

/// Protocol version this client advertises during negotiation.
pub const CLIENT_PROTOCOL_VERSION: u64 = 6;

/// Lowest negotiated protocol version that understands `WATCH_ONCE`.
pub const WATCH_ONCE_MIN_VERSION: u64 = 6;

/// Request types understood by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestType {
    Select = 1,
    Insert = 2,
    Replace = 3,
    Update = 4,
    Delete = 5,
    Auth = 7,
    Eval = 8,
    Upsert = 9,
    Call = 10,
    Begin = 14,
    Commit = 15,
    Rollback = 16,
    Ping = 64,
    Id = 73,
    Watch = 74,
    Unwatch = 75,
    Event = 76,
    WatchOnce = 77,
}

impl RequestType {
    /// Returns the numeric wire code.
    #[inline]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Maps a wire code back to a request type.
    pub fn from_code(code: u32) -> Option<Self> {
        let kind = match code {
            1 => RequestType::Select,
            2 => RequestType::Insert,
            3 => RequestType::Replace,
            4 => RequestType::Update,
            5 => RequestType::Delete,
            7 => RequestType::Auth,
            8 => RequestType::Eval,
            9 => RequestType::Upsert,
            10 => RequestType::Call,
            14 => RequestType::Begin,
            15 => RequestType::Commit,
            16 => RequestType::Rollback,
            64 => RequestType::Ping,
            73 => RequestType::Id,
            74 => RequestType::Watch,
            75 => RequestType::Unwatch,
            76 => RequestType::Event,
            77 => RequestType::WatchOnce,
            _ => return None,
        };
        Some(kind)
    }

    /// Returns true for requests the server never answers.
    ///
    /// `WATCH` and `UNWATCH` are fire-and-forget; a pending waiter for them
    /// would only ever resolve by timeout.
    #[inline]
    pub const fn expects_response(self) -> bool {
        !matches!(self, RequestType::Watch | RequestType::Unwatch)
    }
}

/// Select iterator types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IteratorType {
    #[default]
    Eq = 0,
    Req = 1,
    All = 2,
    Lt = 3,
    Le = 4,
    Ge = 5,
    Gt = 6,
}

/// Negotiable protocol capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Feature {
    Streams = 0,
    Transactions = 1,
    ErrorExtension = 2,
    Watchers = 3,
    Pagination = 4,
    SpaceAndIndexNames = 5,
    WatchOnce = 6,
}

impl Feature {
    /// Every feature the client knows about, in wire-id order.
    pub const ALL: [Feature; 7] = [
        Feature::Streams,
        Feature::Transactions,
        Feature::ErrorExtension,
        Feature::Watchers,
        Feature::Pagination,
        Feature::SpaceAndIndexNames,
        Feature::WatchOnce,
    ];

    /// Returns the numeric wire id.
    #[inline]
    pub const fn id(self) -> u8 {
        self as u8
    }

    /// Maps a wire id to a known feature; unknown ids are ignored by callers.
    pub fn from_id(id: u64) -> Option<Self> {
        Feature::ALL.iter().copied().find(|f| f.id() as u64 == id)
    }

    /// Upper-case protocol name, used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Feature::Streams => "STREAMS",
            Feature::Transactions => "TRANSACTIONS",
            Feature::ErrorExtension => "ERROR_EXTENSION",
            Feature::Watchers => "WATCHERS",
            Feature::Pagination => "PAGINATION",
            Feature::SpaceAndIndexNames => "SPACE_AND_INDEX_NAMES",
            Feature::WatchOnce => "WATCH_ONCE",
        }
    }
}

/// Set of negotiated features stored as a bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FeatureSet(u32);

impl FeatureSet {
    /// Creates an empty set (nothing negotiated).
    #[inline]
    pub const fn empty() -> Self {
        FeatureSet(0)
    }

    /// Creates a set containing every known feature.
    pub fn all() -> Self {
        Feature::ALL.iter().copied().collect()
    }

    /// Returns true if the feature is present.
    #[inline]
    pub const fn contains(&self, feature: Feature) -> bool {
        (self.0 & (1 << feature.id())) != 0
    }

    /// Adds a feature.
    #[inline]
    pub fn insert(&mut self, feature: Feature) {
        self.0 |= 1 << feature.id();
    }

    /// Removes a feature.
    #[inline]
    pub fn remove(&mut self, feature: Feature) {
        self.0 &= !(1 << feature.id());
    }

    /// Features present in both sets.
    #[inline]
    pub const fn intersect(&self, other: FeatureSet) -> FeatureSet {
        FeatureSet(self.0 & other.0)
    }

    /// Iterates features in wire-id order.
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.iter().copied().filter(|f| self.contains(*f))
    }

    /// Builds a set from raw wire ids, skipping unknown ones.
    pub fn from_ids<I: IntoIterator<Item = u64>>(ids: I) -> Self {
        ids.into_iter().filter_map(Feature::from_id).collect()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<T: IntoIterator<Item = Feature>>(iter: T) -> Self {
        let mut set = FeatureSet::empty();
        for feature in iter {
            set.insert(feature);
        }
        set
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(Feature::name)).finish()
    }
}

/// Per-connection request correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncId(pub u64);

impl SyncId {
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an ordered request stream on one connection.
///
/// Zero is reserved for "no stream" and never allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}
