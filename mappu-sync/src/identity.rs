//! Local identity, peer ids and share-link fragments.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Awareness field carrying the identity.
pub const USER_FIELD: &str = "user";

/// Prefix of every mesh peer id.
pub const PEER_ID_PREFIX: &str = "mappu_";

const FRAGMENT_KEY: &str = "peer";

/// A user's long-lived identity. Key management lives outside this crate;
/// only the public half travels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Public key, base64.
    pub public_key: String,
    pub name: String,
}

impl Identity {
    pub fn new(public_key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
            name: name.into(),
        }
    }

    /// Identity with a random public key, for tests and anonymous sessions.
    pub fn anonymous() -> Self {
        Self::new(uuid::Uuid::new_v4().simple().to_string(), "Anonymous")
    }

    /// First 16 characters of the public key with non-alphanumerics removed.
    pub fn key_fragment(&self) -> String {
        self.public_key
            .chars()
            .take(16)
            .filter(|c| c.is_ascii_alphanumeric())
            .collect()
    }

    /// A fresh peer id: `mappu_<key16>_<millis><rand>`.
    ///
    /// The random suffix keeps two sessions of the same identity opened in
    /// the same millisecond apart.
    pub fn peer_id(&self) -> String {
        let rand = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{PEER_ID_PREFIX}{}_{}{}",
            self.key_fragment(),
            crate::unix_millis(),
            &rand[..8]
        )
    }

    /// Value written to the `user` awareness field.
    pub fn user_field(&self) -> Value {
        json!({ "pub": self.public_key, "name": self.name })
    }
}

/// Add `peer=<id>` to a URL fragment unless one is already there.
///
/// ```
/// use mappu_sync::identity::share_fragment;
/// assert_eq!(share_fragment("", "mappu_a_1"), "peer=mappu_a_1");
/// assert_eq!(share_fragment("#inv=tok", "mappu_a_1"), "inv=tok&peer=mappu_a_1");
/// ```
pub fn share_fragment(fragment: &str, peer_id: &str) -> String {
    let fragment = fragment.trim_start_matches('#');
    if fragment_value(fragment, FRAGMENT_KEY).is_some() {
        fragment.to_string()
    } else if fragment.is_empty() {
        format!("{FRAGMENT_KEY}={peer_id}")
    } else {
        format!("{fragment}&{FRAGMENT_KEY}={peer_id}")
    }
}

/// Extract the invite peer hint from a URL fragment.
pub fn peer_hint_from_fragment(fragment: &str) -> Option<String> {
    fragment_value(fragment, FRAGMENT_KEY)
        .filter(|hint| !hint.is_empty())
        .map(str::to_string)
}

/// Value of the first `key=value` pair whose key is exactly `key`.
fn fragment_value<'a>(fragment: &'a str, key: &str) -> Option<&'a str> {
    fragment
        .trim_start_matches('#')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}
