//! # Request Targets and Capability Guards
//!
//! Purpose: Decide, before anything touches the network, whether a request
//! can be expressed on a connection with a given negotiated protocol.
//!
//! A space or index can be addressed by id or by name. Names only go on the
//! wire when the server negotiated `SPACE_AND_INDEX_NAMES`; watchers,
//! streams, and `WATCH_ONCE` have their own requirements. All checks here
//! are pure functions of the negotiated `(version, features)` pair.

use std::fmt;

use crate::protocol::Body;
use crate::types::*;

/// Rejection text when a space is addressed by name without name support.
pub const SPACE_NAME_UNSUPPORTED: &str = "Space name addressing requires the server to support the SPACE_AND_INDEX_NAMES feature; use a numeric space id";
/// Rejection text when an index is addressed by name without name support.
pub const INDEX_NAME_UNSUPPORTED: &str = "Index name addressing requires the server to support the SPACE_AND_INDEX_NAMES feature; use a numeric index id";
/// Rejection text for watch/unwatch without the watchers feature.
pub const WATCHERS_UNSUPPORTED: &str =
    "Watchers are not supported by the server: the WATCHERS feature was not negotiated";
/// Rejection text for stream creation without the streams feature.
pub const STREAMS_UNSUPPORTED: &str =
    "Streams are not supported by the server: the STREAMS feature was not negotiated";
/// Rejection text for `WATCH_ONCE` on an older protocol.
pub const WATCH_ONCE_UNSUPPORTED: &str = "watch_once requires protocol version 6 or newer";

/// How a request names its space or index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestTarget {
    ById(u32),
    ByName(String),
}

impl RequestTarget {
    /// Returns true for name-based targets.
    #[inline]
    pub fn is_name(&self) -> bool {
        matches!(self, RequestTarget::ByName(_))
    }

    /// Numeric id, if this target is one.
    #[inline]
    pub fn id(&self) -> Option<u32> {
        match self {
            RequestTarget::ById(id) => Some(*id),
            RequestTarget::ByName(_) => None,
        }
    }

    /// Writes this target into a body as the space field.
    pub fn write_space(&self, body: &mut Body) {
        match self {
            RequestTarget::ById(id) => body.insert(KEY_SPACE_ID, *id),
            RequestTarget::ByName(name) => body.insert(KEY_SPACE_NAME, name.as_str()),
        }
    }

    /// Writes this target into a body as the index field.
    pub fn write_index(&self, body: &mut Body) {
        match self {
            RequestTarget::ById(id) => body.insert(KEY_INDEX_ID, *id),
            RequestTarget::ByName(name) => body.insert(KEY_INDEX_NAME, name.as_str()),
        }
    }
}

impl Default for RequestTarget {
    /// The primary index.
    fn default() -> Self {
        RequestTarget::ById(0)
    }
}

impl From<u32> for RequestTarget {
    fn from(id: u32) -> Self {
        RequestTarget::ById(id)
    }
}

impl From<&str> for RequestTarget {
    fn from(name: &str) -> Self {
        RequestTarget::ByName(name.to_string())
    }
}

impl From<String> for RequestTarget {
    fn from(name: String) -> Self {
        RequestTarget::ByName(name)
    }
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestTarget::ById(id) => write!(f, "#{}", id),
            RequestTarget::ByName(name) => write!(f, "{}", name),
        }
    }
}

/// Operations whose availability depends on negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SpaceByName,
    IndexByName,
    Watch,
    Stream,
    WatchOnce,
}

/// What the server agreed to during the `ID` exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Negotiated {
    pub version: u64,
    pub features: FeatureSet,
}

impl Negotiated {
    pub fn new(version: u64, features: FeatureSet) -> Self {
        Negotiated { version, features }
    }

    /// Checks one capability; `Err` carries the user-facing rejection text.
    pub fn check(&self, capability: Capability) -> Result<(), &'static str> {
        let allowed = match capability {
            Capability::SpaceByName | Capability::IndexByName => {
                self.features.contains(Feature::SpaceAndIndexNames)
            }
            Capability::Watch => self.features.contains(Feature::Watchers),
            Capability::Stream => self.features.contains(Feature::Streams),
            Capability::WatchOnce => self.version >= WATCH_ONCE_MIN_VERSION,
        };
        if allowed {
            Ok(())
        } else {
            Err(rejection(capability))
        }
    }

    /// Checks the targets of a data request; the space is checked first.
    pub fn check_targets(
        &self,
        space: &RequestTarget,
        index: Option<&RequestTarget>,
    ) -> Result<(), &'static str> {
        if space.is_name() {
            self.check(Capability::SpaceByName)?;
        }
        if index.is_some_and(RequestTarget::is_name) {
            self.check(Capability::IndexByName)?;
        }
        Ok(())
    }
}

/// Rejection text for a capability.
pub const fn rejection(capability: Capability) -> &'static str {
    match capability {
        Capability::SpaceByName => SPACE_NAME_UNSUPPORTED,
        Capability::IndexByName => INDEX_NAME_UNSUPPORTED,
        Capability::Watch => WATCHERS_UNSUPPORTED,
        Capability::Stream => STREAMS_UNSUPPORTED,
        Capability::WatchOnce => WATCH_ONCE_UNSUPPORTED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy() -> Negotiated {
        Negotiated::new(0, FeatureSet::empty())
    }

    #[test]
    fn numeric_targets_always_pass() {
        let result = legacy().check_targets(&RequestTarget::ById(512), Some(&RequestTarget::ById(0)));
        assert!(result.is_ok());
    }

    #[test]
    fn space_name_rejected_without_feature() {
        let err = legacy()
            .check_targets(&"users".into(), Some(&RequestTarget::ById(0)))
            .unwrap_err();
        assert_eq!(err, SPACE_NAME_UNSUPPORTED);
    }

    #[test]
    fn index_name_rejected_without_feature() {
        let err = legacy()
            .check_targets(&RequestTarget::ById(512), Some(&"primary".into()))
            .unwrap_err();
        assert_eq!(err, INDEX_NAME_UNSUPPORTED);
    }

    #[test]
    fn names_pass_with_feature() {
        let features: FeatureSet = [Feature::SpaceAndIndexNames].into_iter().collect();
        let negotiated = Negotiated::new(6, features);
        assert!(negotiated
            .check_targets(&"users".into(), Some(&"primary".into()))
            .is_ok());
    }

    #[test]
    fn capability_table_matches_negotiation() {
        let old = Negotiated::new(3, FeatureSet::empty());
        assert_eq!(old.check(Capability::Watch), Err(WATCHERS_UNSUPPORTED));
        assert_eq!(old.check(Capability::Stream), Err(STREAMS_UNSUPPORTED));
        assert_eq!(old.check(Capability::WatchOnce), Err(WATCH_ONCE_UNSUPPORTED));

        let modern = Negotiated::new(6, FeatureSet::all());
        for capability in [
            Capability::SpaceByName,
            Capability::IndexByName,
            Capability::Watch,
            Capability::Stream,
            Capability::WatchOnce,
        ] {
            assert!(modern.check(capability).is_ok(), "{:?}", capability);
        }
    }

    #[test]
    fn targets_write_the_matching_keys() {
        let mut body = Body::new();
        RequestTarget::from("users").write_space(&mut body);
        RequestTarget::from(2u32).write_index(&mut body);
        assert_eq!(body.get_str(KEY_SPACE_NAME), Some("users"));
        assert_eq!(body.get_u64(KEY_INDEX_ID), Some(2));
    }
}
