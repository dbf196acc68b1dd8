//! Typed views over the `[ca]` and `[req]` sections of a configuration file.

use crate::{
    cnf::Conf,
    errors::{Error, Result},
    extensions::ExtensionSet,
    name::{DistinguishedName, Field},
    policy::PolicyRuleSet,
};
use std::path::{Path, PathBuf};

/// Key size for newly generated keys when `default_bits` is unset.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// Certificate lifetime when `default_days` is unset.
pub const DEFAULT_DAYS: u32 = 365;

/// Digest names accepted for `default_md`.
const SUPPORTED_DIGESTS: &[&str] = &["sha256", "default"];

/// Settings of one CA section, e.g. `[CA_default]`.
#[derive(Clone, Debug)]
pub struct CaSettings {
    /// Section the settings were read from.
    pub name: String,
    /// Directory that receives issued certificates named `<SERIAL>.pem`.
    pub new_certs_dir: PathBuf,
    /// Directory for CA-owned certificates, if configured.
    pub certs: Option<PathBuf>,
    /// Index file (`index.txt`).
    pub database: PathBuf,
    /// Serial counter file.
    pub serial: PathBuf,
    /// CA private key (PEM).
    pub private_key: PathBuf,
    /// CA certificate (PEM).
    pub certificate: PathBuf,
    /// Validity of issued certificates, in days.
    pub default_days: u32,
    /// Subject policy.
    pub policy: PolicyRuleSet,
    /// Extensions added to issued certificates.
    pub extensions: Option<ExtensionSet>,
    /// Keep the request subject verbatim instead of rebuilding it from the policy.
    pub preserve: bool,
    /// Refuse a subject that already has a valid certificate.
    pub unique_subject: bool,
    /// Keep `emailAddress` in the issued subject.
    pub email_in_dn: bool,
}

impl CaSettings {
    /// Read the CA section named `name`, or the one referenced by
    /// `[ca] default_ca`. Relative paths are resolved against `base`.
    pub fn from_conf(conf: &Conf, name: Option<&str>, base: &Path) -> Result<Self> {
        let section = match name {
            Some(name) => name,
            None => conf.require("ca", "default_ca")?,
        };
        conf.require_section(section, ("ca", "default_ca"))?;

        let path = |key: &str| -> Result<PathBuf> { Ok(base.join(conf.require(section, key)?)) };

        check_digest(conf, section)?;

        let policy_name = conf.require(section, "policy")?;
        let policy =
            PolicyRuleSet::from_section(conf.require_section(policy_name, (section, "policy"))?)?;

        let extensions = match conf.get(section, "x509_extensions") {
            Some(ext) => Some(ExtensionSet::from_section(
                conf.require_section(ext, (section, "x509_extensions"))?,
            )?),
            None => None,
        };

        let default_days = match conf.get(section, "default_days") {
            Some(v) => v.parse::<u32>().map_err(|e| Error::InvalidSetting {
                section: section.to_owned(),
                key: "default_days".into(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_DAYS,
        };

        Ok(Self {
            name: section.to_owned(),
            new_certs_dir: path("new_certs_dir")?,
            certs: conf.get(section, "certs").map(|p| base.join(p)),
            database: path("database")?,
            serial: path("serial")?,
            private_key: path("private_key")?,
            certificate: path("certificate")?,
            default_days,
            policy,
            extensions,
            preserve: flag(conf, section, "preserve", false)?,
            unique_subject: flag(conf, section, "unique_subject", true)?,
            email_in_dn: flag(conf, section, "email_in_dn", true)?,
        })
    }
}

/// Settings of the `[req]` section.
#[derive(Clone, Debug)]
pub struct ReqSettings {
    /// Size of generated keys.
    pub default_bits: usize,
    /// Where a generated key is written when no path is given.
    pub default_keyfile: Option<PathBuf>,
    /// Default subject for new requests.
    pub subject: DistinguishedName,
    /// Extensions for self-signed certificates (`-x509`).
    pub extensions: Option<ExtensionSet>,
}

impl ReqSettings {
    /// Read `[req]` and the distinguished-name section it references.
    ///
    /// Only unencrypted keys are produced, so `encrypt_key = no` is required.
    /// Such keys are fit for test fixtures and nothing else.
    pub fn from_conf(conf: &Conf, base: &Path) -> Result<Self> {
        const SECTION: &str = "req";
        check_digest(conf, SECTION)?;

        let default_bits = match conf.get(SECTION, "default_bits") {
            Some(v) => v.parse::<usize>().map_err(|e| Error::InvalidSetting {
                section: SECTION.into(),
                key: "default_bits".into(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_KEY_BITS,
        };

        if flag(conf, SECTION, "encrypt_key", true)? {
            return Err(Error::InvalidSetting {
                section: SECTION.into(),
                key: "encrypt_key".into(),
                reason: "encrypted private keys are not supported; set `encrypt_key = no`".into(),
            });
        }
        tracing::warn!(
            "private keys are written unencrypted (encrypt_key = no); do not use for production key custody"
        );

        let prompt = flag(conf, SECTION, "prompt", true)?;
        let subject = match conf.get(SECTION, "distinguished_name") {
            Some(dn) => read_subject(conf, dn, prompt)?,
            None => DistinguishedName::new(),
        };

        let extensions = match conf.get(SECTION, "x509_extensions") {
            Some(ext) => Some(ExtensionSet::from_section(
                conf.require_section(ext, (SECTION, "x509_extensions"))?,
            )?),
            None => None,
        };

        Ok(Self {
            default_bits,
            default_keyfile: conf.get(SECTION, "default_keyfile").map(|p| base.join(p)),
            subject,
            extensions,
        })
    }
}

/// Build the default subject from a distinguished-name section.
///
/// With `prompt = no` the entries are the values themselves. Otherwise the
/// `<field>_default` entries supply them and the bare entries are prompt
/// text, which is ignored.
fn read_subject(conf: &Conf, section_name: &str, prompt: bool) -> Result<DistinguishedName> {
    let section = conf.require_section(section_name, ("req", "distinguished_name"))?;
    let mut dn = DistinguishedName::new();

    for (key, value) in section.entries() {
        // `0.organizationName` style prefixes allow repeated fields.
        let key = match key.split_once('.') {
            Some((n, rest)) if n.chars().all(|c| c.is_ascii_digit()) => rest,
            _ => key,
        };
        let field_name = if prompt {
            match key.strip_suffix("_default") {
                Some(f) => f,
                None => continue,
            }
        } else {
            key
        };
        if field_name.ends_with("_min") || field_name.ends_with("_max") {
            continue;
        }
        let field = Field::from_name(field_name).ok_or_else(|| Error::InvalidSetting {
            section: section_name.to_owned(),
            key: key.to_owned(),
            reason: "unknown DN field".into(),
        })?;
        dn.set(field, value);
    }
    Ok(dn)
}

fn check_digest(conf: &Conf, section: &str) -> Result<()> {
    match conf.get(section, "default_md") {
        Some(md) if !SUPPORTED_DIGESTS.contains(&md) => Err(Error::UnsupportedDigest(md.to_owned())),
        _ => Ok(()),
    }
}

fn flag(conf: &Conf, section: &str, key: &str, default: bool) -> Result<bool> {
    let Some(value) = conf.get(section, key) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" => Ok(true),
        "no" | "n" | "false" => Ok(false),
        _ => Err(Error::InvalidSetting {
            section: section.to_owned(),
            key: key.to_owned(),
            reason: format!("expected yes or no, got `{value}`"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Requirement;

    fn fixture() -> Conf {
        Conf::parse(include_str!("../fixtures/ca/openssl.cnf")).unwrap()
    }

    #[test]
    fn ca_settings_from_fixture() {
        let base = Path::new("/srv/ca");
        let ca = CaSettings::from_conf(&fixture(), None, base).unwrap();
        assert_eq!(ca.name, "CA_default");
        assert_eq!(ca.database, base.join("./index.txt"));
        assert_eq!(ca.new_certs_dir, base.join("./newcerts"));
        assert_eq!(ca.private_key, base.join("./private/ca.key.pem"));
        assert_eq!(ca.default_days, 365);
        assert!(!ca.preserve);
        assert!(!ca.unique_subject);
        assert!(ca.email_in_dn);
        assert_eq!(
            ca.policy.requirement(Field::CommonName),
            Some(Requirement::Supplied)
        );
        assert_eq!(ca.extensions.as_ref().map(|e| e.name()), Some("usr_cert"));
    }

    #[test]
    fn req_settings_from_fixture() {
        let req = ReqSettings::from_conf(&fixture(), Path::new(".")).unwrap();
        assert_eq!(req.default_bits, 4096);
        assert_eq!(req.subject.to_string(), "/C=US/ST=New York/L=New York/O=Vector/CN=Vector CA");
        assert!(req.extensions.unwrap().is_ca());
    }

    #[test]
    fn prompt_mode_uses_defaults() {
        let conf = Conf::parse(
            "[req]\nencrypt_key = no\ndistinguished_name = dn\n\
             [dn]\ncommonName = Common Name\ncommonName_default = fixture\ncommonName_max = 64\n\
             0.organizationName_default = Org\n",
        )
        .unwrap();
        let req = ReqSettings::from_conf(&conf, Path::new(".")).unwrap();
        assert_eq!(req.subject.to_string(), "/CN=fixture/O=Org");
        assert_eq!(req.default_bits, DEFAULT_KEY_BITS);
    }

    #[test]
    fn encrypted_keys_are_refused() {
        let conf = Conf::parse("[req]\ndefault_bits = 2048\n").unwrap();
        assert!(matches!(
            ReqSettings::from_conf(&conf, Path::new(".")),
            Err(Error::InvalidSetting { key, .. }) if key == "encrypt_key"
        ));
    }

    #[test]
    fn only_sha256_is_accepted() {
        let text = include_str!("../fixtures/ca/openssl.cnf").replace(
            "default_md = sha256\ndefault_days",
            "default_md = sha1\ndefault_days",
        );
        let conf = Conf::parse(&text).unwrap();
        assert!(matches!(
            CaSettings::from_conf(&conf, None, Path::new(".")),
            Err(Error::UnsupportedDigest(md)) if md == "sha1"
        ));
    }

    #[test]
    fn missing_sections_are_reported() {
        let conf = Conf::parse("[ca]\ndefault_ca = nowhere\n").unwrap();
        assert!(matches!(
            CaSettings::from_conf(&conf, None, Path::new(".")),
            Err(Error::InvalidSetting { .. })
        ));
        let conf = Conf::parse("[other]\n").unwrap();
        assert!(matches!(
            CaSettings::from_conf(&conf, None, Path::new(".")),
            Err(Error::MissingSetting { .. })
        ));
    }
}
