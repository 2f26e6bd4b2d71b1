//! Name derivation for generated volumes and annotation keys
//!
//! Every name is `prefix + sha1_hex(input)`, cut to 63 characters after
//! formatting. The result is a pure function of the input.

use sha1::{Digest, Sha1};

use bindings_common::{LEDGER_KEY_PREFIX, MAX_NAME_LENGTH};

/// Prefix of every volume the engine creates
pub const VOLUME_NAME_PREFIX: &str = "binding-";

/// Cut a name to the 63 character limit
pub fn truncate_at_63(name: &str) -> String {
    match name.char_indices().nth(MAX_NAME_LENGTH) {
        Some((idx, _)) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

fn sha1_hex(input: &str) -> String {
    format!("{:x}", Sha1::digest(input.as_bytes()))
}

/// Volume name for a mounted secret
pub fn volume_name(secret_name: &str) -> String {
    truncate_at_63(&format!("{VOLUME_NAME_PREFIX}{}", sha1_hex(secret_name)))
}

/// Owner annotation key recording what a binding injected
pub fn ledger_key(identity: &str) -> String {
    truncate_at_63(&format!("{LEDGER_KEY_PREFIX}{}", sha1_hex(identity)))
}

/// Pod template annotation holding a binding's type override
pub fn type_annotation_key(identity: &str) -> String {
    format!("{}-type", ledger_key(identity))
}

/// Pod template annotation holding a binding's provider override
pub fn provider_annotation_key(identity: &str) -> String {
    format!("{}-provider", ledger_key(identity))
}

/// Downward API field path resolving a pod annotation
pub fn annotation_field_path(annotation_key: &str) -> String {
    format!("metadata.annotations['{annotation_key}']")
}
