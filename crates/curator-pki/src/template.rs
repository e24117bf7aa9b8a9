//! Certificate templates.

use std::net::IpAddr;

use rcgen::BasicConstraints;
use rcgen::CertificateParams;
use rcgen::DistinguishedName;
use rcgen::DnType;
use rcgen::DnValue;
use rcgen::ExtendedKeyUsagePurpose;
use rcgen::IsCa;
use rcgen::KeyUsagePurpose;
use rcgen::SanType;
use rcgen::SerialNumber;
use time::OffsetDateTime;
use time::macros::datetime;

/// Expiry used for every certificate and CRL: "no well-defined expiration date".
pub const UNKNOWN_NOT_AFTER: OffsetDateTime = datetime!(9999-12-31 23:59:59 UTC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    CertSign,
    CrlSign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsage {
    ServerAuth,
    ClientAuth,
    OcspSigning,
}

/// The subject-describing part of a certificate.
///
/// Validity and serial are filled in at issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    pub is_ca: bool,
    pub key_usages: Vec<KeyUsage>,
    pub extended_key_usages: Vec<ExtendedKeyUsage>,
}

impl Template {
    /// A certificate authority able to sign certificates and CRLs.
    pub fn ca(common_name: impl Into<String>) -> Self {
        Self {
            common_name: Some(common_name.into()),
            is_ca: true,
            key_usages: vec![KeyUsage::CertSign, KeyUsage::CrlSign, KeyUsage::DigitalSignature],
            extended_key_usages: vec![
                ExtendedKeyUsage::ClientAuth,
                ExtendedKeyUsage::ServerAuth,
                ExtendedKeyUsage::OcspSigning,
            ],
            ..Self::default()
        }
    }

    /// A client certificate. `group` becomes the subject organization.
    pub fn client(identity: impl Into<String>, group: Option<&str>) -> Self {
        Self {
            common_name: Some(identity.into()),
            organization: group.map(str::to_string),
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usages: vec![ExtendedKeyUsage::ClientAuth],
            ..Self::default()
        }
    }

    /// A server certificate for the given names and addresses.
    pub fn server(dns_names: Vec<String>, ip_addresses: Vec<IpAddr>) -> Self {
        Self {
            dns_names,
            ip_addresses,
            key_usages: vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment],
            extended_key_usages: vec![ExtendedKeyUsage::ServerAuth],
            ..Self::default()
        }
    }

    pub fn with_extended_key_usage(mut self, usage: ExtendedKeyUsage) -> Self {
        if !self.extended_key_usages.contains(&usage) {
            self.extended_key_usages.push(usage);
        }
        self
    }

    pub(crate) fn to_params(&self, serial: &[u8], allow_ca: bool) -> Result<CertificateParams, rcgen::Error> {
        let mut params = CertificateParams::default();
        params.not_before = OffsetDateTime::now_utc();
        params.not_after = UNKNOWN_NOT_AFTER;
        params.serial_number = Some(SerialNumber::from_slice(serial));

        let mut name = DistinguishedName::new();
        if let Some(cn) = &self.common_name {
            name.push(DnType::CommonName, DnValue::Utf8String(cn.clone()));
        }
        if let Some(org) = &self.organization {
            name.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        params.distinguished_name = name;

        for dns in &self.dns_names {
            params.subject_alt_names.push(SanType::DnsName(dns.clone().try_into()?));
        }
        for ip in &self.ip_addresses {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        params.is_ca = if self.is_ca && allow_ca {
            IsCa::Ca(BasicConstraints::Unconstrained)
        } else {
            IsCa::NoCa
        };
        params.key_usages = self
            .key_usages
            .iter()
            .map(|usage| match usage {
                KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
                KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
                KeyUsage::CertSign => KeyUsagePurpose::KeyCertSign,
                KeyUsage::CrlSign => KeyUsagePurpose::CrlSign,
            })
            .collect();
        params.extended_key_usages = self
            .extended_key_usages
            .iter()
            .map(|usage| match usage {
                ExtendedKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsage::OcspSigning => ExtendedKeyUsagePurpose::OcspSigning,
            })
            .collect();
        Ok(params)
    }
}
