//! X.509v3 extension sections such as `[v3_ca]` and `[usr_cert]`.

use crate::{
    cnf::Section,
    errors::{Error, Result},
};
use const_oid::{AssociatedOid, ObjectIdentifier};
use der::{
    asn1::{Ia5String, OctetString},
    Encode,
};
use digest::Digest;
use flagset::FlagSet;
use sha1::Sha1;
use spki::SubjectPublicKeyInfoOwned;
use std::net::IpAddr;
use x509_cert::{
    ext::{
        pkix::{
            name::GeneralName, AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage,
            KeyUsage, KeyUsages, SubjectAltName, SubjectKeyIdentifier,
        },
        Extension,
    },
    name::Name,
    serial_number::SerialNumber,
};

/// `id-kp-serverAuth`
pub const ID_KP_SERVER_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.1");
/// `id-kp-clientAuth`
pub const ID_KP_CLIENT_AUTH: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.2");
const ID_KP_CODE_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3");
const ID_KP_EMAIL_PROTECTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4");
const ID_KP_TIME_STAMPING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.8");
const ID_KP_OCSP_SIGNING: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.9");

/// When an `authorityKeyIdentifier` component is emitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Inclusion {
    /// Not requested.
    #[default]
    Never,
    /// Emitted when available.
    IfAvailable,
    /// Emitted unconditionally.
    Always,
}

/// Subject alternative name entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AltName {
    /// `DNS:`
    Dns(String),
    /// `IP:`
    Ip(IpAddr),
    /// `email:`
    Email(String),
    /// `URI:`
    Uri(String),
}

/// One extension line of a section, in declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExtensionSpec {
    /// `basicConstraints`
    BasicConstraints {
        /// Marked critical.
        critical: bool,
        /// `CA:true`.
        ca: bool,
        /// `pathlen:N`.
        path_len: Option<u8>,
    },
    /// `keyUsage`
    KeyUsage {
        /// Marked critical.
        critical: bool,
        /// Permitted key usages.
        usages: FlagSet<KeyUsages>,
    },
    /// `extendedKeyUsage`
    ExtendedKeyUsage {
        /// Marked critical.
        critical: bool,
        /// Purpose OIDs, e.g. `serverAuth`.
        purposes: Vec<ObjectIdentifier>,
    },
    /// `subjectKeyIdentifier = hash`
    SubjectKeyIdentifier,
    /// `authorityKeyIdentifier`
    AuthorityKeyIdentifier {
        /// Whether to include the issuer key identifier.
        keyid: Inclusion,
        /// Whether to include the issuer name and serial.
        issuer: Inclusion,
    },
    /// `subjectAltName`
    SubjectAltName {
        /// Marked critical.
        critical: bool,
        /// Alternative names in declaration order.
        names: Vec<AltName>,
    },
}

/// Issuer details needed to render `authorityKeyIdentifier`.
#[derive(Clone, Debug)]
pub struct IssuerRef<'a> {
    /// Issuer public key.
    pub public_key: &'a SubjectPublicKeyInfoOwned,
    /// Issuer subject name.
    pub name: &'a Name,
    /// Serial number of the issuer certificate.
    pub serial: &'a SerialNumber,
}

/// Named set of extensions attached to every certificate issued with it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtensionSet {
    name: String,
    specs: Vec<ExtensionSpec>,
}

impl ExtensionSet {
    /// Build from explicit specs, checking the CA invariant.
    pub fn new(name: impl Into<String>, specs: Vec<ExtensionSpec>) -> Result<Self> {
        let set = Self {
            name: name.into(),
            specs,
        };
        set.validate()?;
        Ok(set)
    }

    /// Set with no extensions; certificates signed with it are plain v3.
    pub fn empty() -> Self {
        Self {
            name: String::new(),
            specs: Vec::new(),
        }
    }

    /// Read an extension section.
    pub fn from_section(section: &Section) -> Result<Self> {
        let mut specs = Vec::new();
        for (key, value) in section.entries() {
            let invalid = |reason: String| Error::InvalidSetting {
                section: section.name().to_owned(),
                key: key.to_owned(),
                reason,
            };
            let spec = parse_spec(key, value).map_err(invalid)?;
            specs.push(spec);
        }
        Self::new(section.name(), specs)
    }

    /// Section name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared extensions, in order.
    pub fn specs(&self) -> &[ExtensionSpec] {
        &self.specs
    }

    /// Whether certificates issued with this set may sign other certificates.
    pub fn is_ca(&self) -> bool {
        self.specs
            .iter()
            .any(|s| matches!(s, ExtensionSpec::BasicConstraints { ca: true, .. }))
    }

    fn key_cert_sign(&self) -> bool {
        self.specs.iter().any(|s| match s {
            ExtensionSpec::KeyUsage { usages, .. } => usages.contains(KeyUsages::KeyCertSign),
            _ => false,
        })
    }

    /// `CA:true` and `keyCertSign` must appear together or not at all.
    pub fn validate(&self) -> Result<()> {
        let inconsistent = |reason: &str| Error::InconsistentExtensions {
            section: self.name.clone(),
            reason: reason.to_owned(),
        };
        match (self.is_ca(), self.key_cert_sign()) {
            (true, false) => Err(inconsistent("CA:true requires keyUsage keyCertSign")),
            (false, true) => Err(inconsistent("keyCertSign requires basicConstraints CA:true")),
            _ => Ok(()),
        }
    }

    /// Render DER extensions for a certificate over `subject_key`.
    pub fn to_extensions(
        &self,
        subject_key: &SubjectPublicKeyInfoOwned,
        issuer: &IssuerRef<'_>,
    ) -> Result<Vec<Extension>> {
        let mut out = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let ext = match spec {
                ExtensionSpec::BasicConstraints {
                    critical,
                    ca,
                    path_len,
                } => encode(
                    &BasicConstraints {
                        ca: *ca,
                        path_len_constraint: *path_len,
                    },
                    *critical,
                )?,
                ExtensionSpec::KeyUsage { critical, usages } => {
                    encode(&KeyUsage(*usages), *critical)?
                }
                ExtensionSpec::ExtendedKeyUsage { critical, purposes } => {
                    encode(&ExtendedKeyUsage(purposes.clone()), *critical)?
                }
                ExtensionSpec::SubjectKeyIdentifier => encode(
                    &SubjectKeyIdentifier(OctetString::new(key_identifier(subject_key))?),
                    false,
                )?,
                ExtensionSpec::AuthorityKeyIdentifier { keyid, issuer: inc } => {
                    let mut akid = AuthorityKeyIdentifier::default();
                    if *keyid != Inclusion::Never {
                        akid.key_identifier =
                            Some(OctetString::new(key_identifier(issuer.public_key))?);
                    }
                    // Plain `issuer` only applies when no key id is emitted.
                    let forced = *inc == Inclusion::Always;
                    let fallback = akid.key_identifier.is_none() && *inc != Inclusion::Never;
                    if forced || fallback {
                        akid.authority_cert_issuer =
                            Some(vec![GeneralName::DirectoryName(issuer.name.clone())]);
                        akid.authority_cert_serial_number = Some(issuer.serial.clone());
                    }
                    encode(&akid, false)?
                }
                ExtensionSpec::SubjectAltName { critical, names } => {
                    let names = names
                        .iter()
                        .map(|n| -> der::Result<GeneralName> {
                            Ok(match n {
                                AltName::Dns(v) => GeneralName::DnsName(Ia5String::new(v)?),
                                AltName::Email(v) => GeneralName::Rfc822Name(Ia5String::new(v)?),
                                AltName::Uri(v) => {
                                    GeneralName::UniformResourceIdentifier(Ia5String::new(v)?)
                                }
                                AltName::Ip(ip) => GeneralName::from(*ip),
                            })
                        })
                        .collect::<der::Result<Vec<_>>>()?;
                    encode(&SubjectAltName(names), *critical)?
                }
            };
            out.push(ext);
        }
        Ok(out)
    }
}

/// RFC 5280 method 1 key identifier: SHA-1 of the subjectPublicKey bits.
pub fn key_identifier(spki: &SubjectPublicKeyInfoOwned) -> Vec<u8> {
    Sha1::digest(spki.subject_public_key.raw_bytes()).to_vec()
}

fn encode<T: AssociatedOid + Encode>(value: &T, critical: bool) -> Result<Extension> {
    Ok(Extension {
        extn_id: T::OID,
        critical,
        extn_value: OctetString::new(value.to_der()?)?,
    })
}

/// Split a comma-separated value, pulling out a leading `critical` flag.
fn split_critical(value: &str) -> (bool, Vec<&str>) {
    let mut critical = false;
    let mut items = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if item == "critical" {
            critical = true;
        } else {
            items.push(item);
        }
    }
    (critical, items)
}

fn parse_bool(v: &str) -> core::result::Result<bool, String> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" => Ok(true),
        "false" | "no" | "n" => Ok(false),
        _ => Err(format!("expected boolean, got `{v}`")),
    }
}

fn parse_spec(key: &str, value: &str) -> core::result::Result<ExtensionSpec, String> {
    let (critical, items) = split_critical(value);
    match key {
        "basicConstraints" => {
            let mut ca = false;
            let mut path_len = None;
            for item in items {
                match item.split_once(':') {
                    Some(("CA", v)) => ca = parse_bool(v)?,
                    Some(("pathlen", v)) => {
                        path_len = Some(v.parse::<u8>().map_err(|e| format!("pathlen: {e}"))?)
                    }
                    _ => return Err(format!("unknown basicConstraints item `{item}`")),
                }
            }
            if path_len.is_some() && !ca {
                return Err("pathlen requires CA:true".into());
            }
            Ok(ExtensionSpec::BasicConstraints {
                critical,
                ca,
                path_len,
            })
        }
        "keyUsage" => {
            let mut usages = FlagSet::<KeyUsages>::default();
            for item in items {
                usages |= match item {
                    "digitalSignature" => KeyUsages::DigitalSignature,
                    "nonRepudiation" => KeyUsages::NonRepudiation,
                    "keyEncipherment" => KeyUsages::KeyEncipherment,
                    "dataEncipherment" => KeyUsages::DataEncipherment,
                    "keyAgreement" => KeyUsages::KeyAgreement,
                    "keyCertSign" => KeyUsages::KeyCertSign,
                    "cRLSign" => KeyUsages::CRLSign,
                    "encipherOnly" => KeyUsages::EncipherOnly,
                    "decipherOnly" => KeyUsages::DecipherOnly,
                    other => return Err(format!("unknown key usage `{other}`")),
                };
            }
            if usages.is_empty() {
                return Err("keyUsage lists no usages".into());
            }
            Ok(ExtensionSpec::KeyUsage { critical, usages })
        }
        "extendedKeyUsage" => {
            let purposes = items
                .into_iter()
                .map(|item| match item {
                    "serverAuth" => Ok(ID_KP_SERVER_AUTH),
                    "clientAuth" => Ok(ID_KP_CLIENT_AUTH),
                    "codeSigning" => Ok(ID_KP_CODE_SIGNING),
                    "emailProtection" => Ok(ID_KP_EMAIL_PROTECTION),
                    "timeStamping" => Ok(ID_KP_TIME_STAMPING),
                    "OCSPSigning" => Ok(ID_KP_OCSP_SIGNING),
                    other => ObjectIdentifier::new(other)
                        .map_err(|_| format!("unknown extended key usage `{other}`")),
                })
                .collect::<core::result::Result<Vec<_>, _>>()?;
            Ok(ExtensionSpec::ExtendedKeyUsage { critical, purposes })
        }
        "subjectKeyIdentifier" => match items.as_slice() {
            ["hash"] => Ok(ExtensionSpec::SubjectKeyIdentifier),
            _ => Err(format!("only `hash` is supported, got `{value}`")),
        },
        "authorityKeyIdentifier" => {
            let mut keyid = Inclusion::Never;
            let mut issuer = Inclusion::Never;
            for item in items {
                let (name, always) = match item.split_once(':') {
                    Some((name, "always")) => (name, true),
                    Some(_) => return Err(format!("unknown qualifier in `{item}`")),
                    None => (item, false),
                };
                let inclusion = if always {
                    Inclusion::Always
                } else {
                    Inclusion::IfAvailable
                };
                match name {
                    "keyid" => keyid = inclusion,
                    "issuer" => issuer = inclusion,
                    other => return Err(format!("unknown authorityKeyIdentifier item `{other}`")),
                }
            }
            Ok(ExtensionSpec::AuthorityKeyIdentifier { keyid, issuer })
        }
        "subjectAltName" => {
            let names = items
                .into_iter()
                .map(|item| match item.split_once(':') {
                    Some(("DNS", v)) => Ok(AltName::Dns(v.to_owned())),
                    Some(("email", v)) => Ok(AltName::Email(v.to_owned())),
                    Some(("URI", v)) => Ok(AltName::Uri(v.to_owned())),
                    Some(("IP", v)) => v
                        .parse()
                        .map(AltName::Ip)
                        .map_err(|_| format!("invalid IP address `{v}`")),
                    _ => Err(format!("unsupported subjectAltName entry `{item}`")),
                })
                .collect::<core::result::Result<Vec<_>, _>>()?;
            Ok(ExtensionSpec::SubjectAltName { critical, names })
        }
        other => Err(format!("unsupported extension `{other}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cnf::Conf;
    use der::Decode;

    fn fixture(section: &str) -> Result<ExtensionSet> {
        let conf = Conf::parse(include_str!("../fixtures/ca/openssl.cnf")).unwrap();
        ExtensionSet::from_section(conf.section(section).unwrap())
    }

    #[test]
    fn v3_ca_is_a_ca() {
        let set = fixture("v3_ca").unwrap();
        assert!(set.is_ca());
        assert_eq!(set.specs().len(), 4);
        assert!(set.specs().contains(&ExtensionSpec::BasicConstraints {
            critical: true,
            ca: true,
            path_len: None
        }));
    }

    #[test]
    fn usr_cert_is_not_a_ca() {
        let set = fixture("usr_cert").unwrap();
        assert!(!set.is_ca());
        assert!(set.specs().contains(&ExtensionSpec::ExtendedKeyUsage {
            critical: false,
            purposes: vec![ID_KP_SERVER_AUTH, ID_KP_CLIENT_AUTH],
        }));
    }

    #[test]
    fn ca_without_key_cert_sign_is_rejected() {
        let conf = Conf::parse(
            "[bad]\nbasicConstraints = critical, CA:true\nkeyUsage = digitalSignature\n",
        )
        .unwrap();
        assert!(matches!(
            ExtensionSet::from_section(conf.section("bad").unwrap()),
            Err(Error::InconsistentExtensions { .. })
        ));

        let conf = Conf::parse("[bad]\nbasicConstraints = CA:true\n").unwrap();
        assert!(matches!(
            ExtensionSet::from_section(conf.section("bad").unwrap()),
            Err(Error::InconsistentExtensions { .. })
        ));
    }

    #[test]
    fn key_cert_sign_without_ca_is_rejected() {
        let conf = Conf::parse("[bad]\nkeyUsage = keyCertSign\n").unwrap();
        assert!(matches!(
            ExtensionSet::from_section(conf.section("bad").unwrap()),
            Err(Error::InconsistentExtensions { .. })
        ));
    }

    #[test]
    fn rejects_unknown_items() {
        for text in [
            "[s]\nkeyUsage = frobnicate\n",
            "[s]\nbasicConstraints = CA:maybe\n",
            "[s]\nnsComment = hello\n",
            "[s]\nsubjectAltName = RID:1.2.3\n",
            "[s]\nbasicConstraints = CA:false, pathlen:1\n",
        ] {
            let conf = Conf::parse(text).unwrap();
            assert!(
                matches!(
                    ExtensionSet::from_section(conf.section("s").unwrap()),
                    Err(Error::InvalidSetting { .. })
                ),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn parses_subject_alt_names() {
        let conf =
            Conf::parse("[s]\nsubjectAltName = DNS:localhost, IP:127.0.0.1, email:a@b.c\n")
                .unwrap();
        let set = ExtensionSet::from_section(conf.section("s").unwrap()).unwrap();
        assert_eq!(
            set.specs(),
            &[ExtensionSpec::SubjectAltName {
                critical: false,
                names: vec![
                    AltName::Dns("localhost".into()),
                    AltName::Ip("127.0.0.1".parse().unwrap()),
                    AltName::Email("a@b.c".into()),
                ],
            }]
        );
    }

    #[test]
    fn basic_constraints_der() {
        let ext = encode(
            &BasicConstraints {
                ca: true,
                path_len_constraint: None,
            },
            true,
        )
        .unwrap();
        assert_eq!(ext.extn_id, BasicConstraints::OID);
        assert!(ext.critical);
        let decoded = BasicConstraints::from_der(ext.extn_value.as_bytes()).unwrap();
        assert!(decoded.ca);
    }
}
