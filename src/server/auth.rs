//! Resolving the calling peer of an HTTP request.
//!
//! TLS is terminated in front of the curator. The terminating proxy
//! verifies client certificates and forwards what it learned as headers.

use axum::http::HeaderMap;
use snafu::ensure;

use crate::authz::Peer;
use crate::error::CuratorError;
use crate::error::UnauthenticatedSnafu;
use crate::identity::node_id;

/// Hex public key of a caller holding a node certificate.
pub const NODE_HEADER: &str = "x-curator-node";
/// Identity of a caller holding a user certificate.
pub const USER_HEADER: &str = "x-curator-user";
/// Hex public key of a self-signed certificate presented by the caller.
pub const TRANSPORT_KEY_HEADER: &str = "x-curator-transport-key";

pub trait PeerAuthenticator: Send + Sync + 'static {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Peer, CuratorError>;
}

/// Trusts identity headers set by a TLS-terminating front end.
///
/// Must only be exposed behind such a front end, which strips these headers
/// from incoming requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderAuthenticator;

impl PeerAuthenticator for HeaderAuthenticator {
    fn authenticate(&self, headers: &HeaderMap) -> Result<Peer, CuratorError> {
        let node = header(headers, NODE_HEADER)?;
        let user = header(headers, USER_HEADER)?;
        ensure!(
            node.is_none() || user.is_none(),
            UnauthenticatedSnafu {
                message: "both node and user credentials presented",
            }
        );

        if let Some(node) = node {
            let public_key = hex_key(node, NODE_HEADER)?;
            return Ok(Peer::Node {
                id: node_id(&public_key),
                public_key,
            });
        }
        if let Some(identity) = user {
            ensure!(
                !identity.is_empty(),
                UnauthenticatedSnafu {
                    message: "empty user identity",
                }
            );
            return Ok(Peer::User {
                identity: identity.to_string(),
            });
        }
        let transport_key = header(headers, TRANSPORT_KEY_HEADER)?
            .map(|key| hex_key(key, TRANSPORT_KEY_HEADER))
            .transpose()?;
        Ok(Peer::Unauthenticated { transport_key })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, CuratorError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value.to_str().map(|v| Some(v.trim())).map_err(|_| {
        UnauthenticatedSnafu {
            message: format!("{name} is not valid ASCII"),
        }
        .build()
    })
}

fn hex_key(value: &str, name: &str) -> Result<[u8; 32], CuratorError> {
    let mut key = [0u8; 32];
    hex::decode_to_slice(value, &mut key).map_err(|_| {
        UnauthenticatedSnafu {
            message: format!("{name} must be a hex-encoded 32-byte key"),
        }
        .build()
    })?;
    Ok(key)
}
