//! Node identities.

use curator_pki::ExtendedKeyUsage;
use curator_pki::Template;
use snafu::ensure;

use crate::error::CuratorError;
use crate::error::InvalidArgumentSnafu;

/// Identity of the cluster owner, used for its certificate name and CN.
pub const OWNER_IDENTITY: &str = "owner";

/// The node ID for a public key: `node-` followed by the hex of its first 16 bytes.
pub fn node_id(public_key: &[u8; 32]) -> String {
    format!("node-{}", hex::encode(&public_key[..16]))
}

/// Interpret `bytes` as a raw ed25519 public key.
pub fn public_key(bytes: &[u8], field: &str) -> Result<[u8; 32], CuratorError> {
    ensure!(
        bytes.len() == 32,
        InvalidArgumentSnafu {
            message: format!("{field} must be 32 bytes, got {}", bytes.len()),
        }
    );
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Ok(key)
}

/// Template of a node's identity certificate, used both as server and client.
pub fn node_certificate_template(node_id: &str) -> Template {
    Template::server(vec![node_id.to_string()], Vec::new()).with_extended_key_usage(ExtendedKeyUsage::ClientAuth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_uses_first_half_of_key() {
        let mut key = [0u8; 32];
        key[0] = 0xde;
        key[15] = 0xad;
        key[16] = 0xff;
        assert_eq!(node_id(&key), "node-de0000000000000000000000000000ad");
    }

    #[test]
    fn public_key_length_is_checked() {
        assert!(public_key(&[1u8; 32], "join_key").is_ok());
        let err = public_key(&[1u8; 31], "join_key").unwrap_err();
        assert_eq!(err.to_string(), "join_key must be 32 bytes, got 31");
    }

    #[test]
    fn node_template_is_server_and_client() {
        let template = node_certificate_template("node-01");
        assert_eq!(template.dns_names, vec!["node-01".to_string()]);
        assert!(template.extended_key_usages.contains(&ExtendedKeyUsage::ServerAuth));
        assert!(template.extended_key_usages.contains(&ExtendedKeyUsage::ClientAuth));
        assert!(!template.is_ca);
    }
}
