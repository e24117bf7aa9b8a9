//! X.509 PKI backed by the curator key-value store.
//!
//! Certificates are declared as [`Certificate`] promises and materialized
//! with [`Certificate::ensure`]. Issued certificates, private keys of Managed
//! certificates and CRLs live in the store under a [`Namespace`], so every
//! node sharing the store sees the same material. All keys are ed25519.
//!
//! ```ignore
//! let ca = Arc::new(Certificate::managed(CLUSTER_PKI, "ca", Template::ca("Cluster CA")));
//! let node = Certificate::external(CLUSTER_PKI, node_id, Template::server(names, vec![]), node_pubkey)
//!     .issued_by(ca.clone());
//! let der = node.ensure(&store).await?;
//! ca.revoke(&store, &node_id).await?;
//! ```

mod certificate;
mod crl;
mod error;
mod keys;
mod namespace;
mod template;
pub mod verify;

pub use certificate::Certificate;
pub use certificate::CertificateMode;
pub use certificate::IssuedCertificate;
pub use certificate::Issuer;
pub use crl::Crl;
pub use crl::RevokedEntry;
pub use error::PkiError;
pub use keys::generate_key;
pub use namespace::Namespace;
pub use template::ExtendedKeyUsage;
pub use template::KeyUsage;
pub use template::Template;
pub use template::UNKNOWN_NOT_AFTER;
