//! Error types for certificate issuance and revocation.

use curator_kv::KeyValueStoreError;
use curator_kv::KeyspaceError;
use snafu::Snafu;

/// Errors from the PKI store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PkiError {
    /// Managed and External certificates are persisted by name.
    #[snafu(display("{mode} certificate must have a name"))]
    EmptyName {
        /// The mode of the offending certificate.
        mode: &'static str,
    },

    /// The certificate in the store was issued for another key.
    #[snafu(display("certificate '{name}' stored for different public key"))]
    PublicKeyMismatch {
        /// Certificate name.
        name: String,
    },

    /// Signing requires the issuer's private key.
    #[snafu(display("issuer '{name}' has no private key"))]
    IssuerWithoutKey {
        /// Issuer certificate name.
        name: String,
    },

    /// CRLs are only kept for Managed self-signed CAs.
    #[snafu(display("certificate '{name}' is not a managed certificate authority"))]
    NotManagedCa {
        /// Certificate name.
        name: String,
    },

    /// No certificate issued by this CA carries the hostname.
    #[snafu(display("could not find requested hostname '{hostname}'"))]
    HostnameNotFound {
        /// The DNS name that was looked up.
        hostname: String,
    },

    /// The CRL changed between read and write.
    #[snafu(display("CRL save transaction failed, retry possible"))]
    CrlConflict,

    /// A create-guarded write lost and the winner vanished before read-back.
    #[snafu(display("concurrent write to '{key}' lost and value disappeared"))]
    ConcurrentWrite {
        /// The contended key.
        key: String,
    },

    /// A stored private key is not a 32-byte seed.
    #[snafu(display("stored private key at '{key}' has invalid size {len}"))]
    InvalidStoredKey {
        /// Key under which the seed is stored.
        key: String,
        /// Actual length.
        len: usize,
    },

    /// Public keys must be raw 32-byte ed25519 keys.
    #[snafu(display("invalid ed25519 public key of length {len}"))]
    InvalidPublicKey {
        /// Actual length.
        len: usize,
    },

    /// DER data could not be parsed.
    #[snafu(display("failed to parse {what}: {reason}"))]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Parser message.
        reason: String,
    },

    /// A certificate signature did not verify against its issuer.
    #[snafu(display("signature verification failed: {reason}"))]
    Verify {
        /// Verifier message.
        reason: String,
    },

    /// Certificate or CRL generation failed.
    #[snafu(display("failed to generate {what}: {source}"))]
    Generate {
        /// What was being generated.
        what: &'static str,
        /// The underlying error.
        source: rcgen::Error,
    },

    /// The private key could not be encoded for signing.
    #[snafu(display("failed to encode private key: {source}"))]
    KeyEncoding {
        /// The underlying error.
        source: ed25519_dalek::pkcs8::Error,
    },

    /// A certificate name produced an invalid key.
    #[snafu(display("invalid certificate key: {source}"))]
    Keyspace {
        /// The underlying error.
        source: KeyspaceError,
    },

    /// Underlying store error.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The underlying error.
        source: KeyValueStoreError,
    },
}
