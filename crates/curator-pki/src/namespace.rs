use curator_kv::KeyspaceError;
use curator_kv::KeyspacePrefix;

/// A subtree of the store holding one family of certificates.
///
/// Within namespace `N`:
/// - `N/issued/<name>-cert.der` holds issued certificates,
/// - `N/keys/<name>-privkey.bin` holds private key seeds of Managed certificates,
/// - `N/<name>-crl.der` holds the CRL of a Managed CA.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    prefix: KeyspacePrefix,
}

impl Namespace {
    pub const fn from_static(prefix: &'static str) -> Self {
        Self {
            prefix: KeyspacePrefix::from_static(prefix),
        }
    }

    pub fn new(prefix: KeyspacePrefix) -> Self {
        Self { prefix }
    }

    pub fn prefix(&self) -> &KeyspacePrefix {
        &self.prefix
    }

    pub fn certificate_key(&self, name: &str) -> Result<String, KeyspaceError> {
        self.issued()?.key(&format!("{name}-cert.der"))
    }

    pub fn private_key_key(&self, name: &str) -> Result<String, KeyspaceError> {
        self.prefix.child("keys")?.key(&format!("{name}-privkey.bin"))
    }

    pub fn crl_key(&self, name: &str) -> Result<String, KeyspaceError> {
        self.prefix.key(&format!("{name}-crl.der"))
    }

    /// Bounds covering every issued certificate.
    pub fn issued_range(&self) -> Result<(String, String), KeyspaceError> {
        Ok(self.issued()?.range())
    }

    fn issued(&self) -> Result<KeyspacePrefix, KeyspaceError> {
        self.prefix.child("issued")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: Namespace = Namespace::from_static("/cluster-pki/");

    #[test]
    fn layout() {
        assert_eq!(NS.certificate_key("ca").unwrap(), "/cluster-pki/issued/ca-cert.der");
        assert_eq!(NS.private_key_key("ca").unwrap(), "/cluster-pki/keys/ca-privkey.bin");
        assert_eq!(NS.crl_key("ca").unwrap(), "/cluster-pki/ca-crl.der");
        let (start, end) = NS.issued_range().unwrap();
        assert_eq!(start, "/cluster-pki/issued/");
        assert_eq!(end, "/cluster-pki/issued0");
    }

    #[test]
    fn crl_is_outside_issued_range() {
        let (start, end) = NS.issued_range().unwrap();
        let crl = NS.crl_key("ca").unwrap();
        assert!(!(crl >= start && crl < end));
    }

    #[test]
    fn names_with_slashes_are_rejected() {
        assert!(NS.certificate_key("a/b").is_err());
    }
}
