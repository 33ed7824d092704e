//! Canonical identity normalization for transport addresses.
//!
//! The platform addresses the same person through several forms (phone-number
//! chats, business linked-device ids, optional `:device` suffixes). Every
//! keyed lookup in the bridge uses [`CanonicalIdentity`], never the raw address.

use std::fmt;

use serde::{Deserialize, Serialize};

const DIRECT_SUFFIX: &str = "@s.whatsapp.net";
const LEGACY_DIRECT_SUFFIX: &str = "@c.us";
const LINKED_DEVICE_SUFFIX: &str = "@lid";
const GROUP_SUFFIX: &str = "@g.us";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AddressKind` values.
pub enum AddressKind {
    Direct,
    LinkedDevice,
    Group,
    Bare,
}

impl AddressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::LinkedDevice => "linked_device",
            Self::Group => "group",
            Self::Bare => "bare",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
/// Normalized sender or group key shared by mode, session, and log lookups.
pub struct CanonicalIdentity(String);

impl CanonicalIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub identity: CanonicalIdentity,
    pub kind: AddressKind,
}

pub fn is_group_address(raw: &str) -> bool {
    raw.trim().ends_with(GROUP_SUFFIX)
}

/// Parses a raw transport address into its canonical identity and addressing form.
pub fn parse_transport_address(raw: &str) -> Option<ParsedAddress> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (user_part, kind) = if let Some(user) = trimmed.strip_suffix(DIRECT_SUFFIX) {
        (user, AddressKind::Direct)
    } else if let Some(user) = trimmed.strip_suffix(LEGACY_DIRECT_SUFFIX) {
        (user, AddressKind::Direct)
    } else if let Some(user) = trimmed.strip_suffix(LINKED_DEVICE_SUFFIX) {
        (user, AddressKind::LinkedDevice)
    } else if let Some(user) = trimmed.strip_suffix(GROUP_SUFFIX) {
        (user, AddressKind::Group)
    } else {
        (trimmed, AddressKind::Bare)
    };
    // "5511999:12" carries a device index that is not part of the identity.
    let user_part = user_part.split(':').next().unwrap_or_default().trim();
    if user_part.is_empty() {
        return None;
    }
    Some(ParsedAddress {
        identity: CanonicalIdentity(user_part.to_string()),
        kind,
    })
}

pub fn canonical_identity(raw: &str) -> Option<CanonicalIdentity> {
    parse_transport_address(raw).map(|parsed| parsed.identity)
}
