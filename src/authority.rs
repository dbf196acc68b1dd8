//! Certificate issuance against an on-disk CA directory.

use crate::{
    cnf::Conf,
    database::{self, Database, DatabaseLock, Entry, Serial, SerialFile},
    errors::{Error, Result},
    extensions::{ExtensionSet, IssuerRef},
    keys,
    name::{DistinguishedName, Field},
    request::CertificateRequest,
    settings::{CaSettings, ReqSettings},
};
use der::{
    asn1::{GeneralizedTime, UtcTime},
    pem::LineEnding,
    DateTime, DecodePem, Encode, EncodePem,
};
use rand_core::CryptoRngCore;
use rsa::RsaPrivateKey;
use spki::SubjectPublicKeyInfoOwned;
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::SystemTime,
};
use x509_cert::{
    certificate::{Certificate, TbsCertificate, Version},
    name::Name,
    time::{Time, Validity},
};

/// A certificate produced by [`CertificateAuthority::sign`].
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    /// Serial allocated to the certificate.
    pub serial: Serial,
    /// Subject as issued, after policy processing.
    pub subject: DistinguishedName,
    /// `notAfter`.
    pub not_after: DateTime,
    /// Where the PEM copy was written.
    pub path: PathBuf,
    /// The certificate.
    pub certificate: Certificate,
}

impl IssuedCertificate {
    /// PEM encoding with LF line endings.
    pub fn to_pem(&self) -> Result<String> {
        Ok(self.certificate.to_pem(LineEnding::LF)?)
    }
}

/// A CA with its key, certificate and settings loaded.
#[derive(Debug)]
pub struct CertificateAuthority {
    settings: CaSettings,
    key: RsaPrivateKey,
    certificate: Certificate,
    subject: DistinguishedName,
}

impl CertificateAuthority {
    /// Create a new CA directory: key, self-signed certificate, empty
    /// database and a serial counter starting at `01`.
    ///
    /// Refuses to run if any of those files already exists.
    ///
    /// The certificate uses the `[req]` subject and `x509_extensions`, which
    /// must describe a CA.
    pub fn init<R: CryptoRngCore + ?Sized>(
        rng: &mut R,
        conf: &Conf,
        ca_name: Option<&str>,
        base: &Path,
        now: SystemTime,
    ) -> Result<Self> {
        let settings = CaSettings::from_conf(conf, ca_name, base)?;
        let req = ReqSettings::from_conf(conf, base)?;

        let targets = [
            settings.database.clone(),
            database::attr_path(&settings.database),
            settings.serial.clone(),
            settings.private_key.clone(),
            settings.certificate.clone(),
        ];
        if let Some(existing) = targets.iter().find(|path| path.exists()) {
            return Err(Error::io(
                existing,
                io::Error::new(io::ErrorKind::AlreadyExists, "CA file already exists"),
            ));
        }
        let extensions = req.extensions.as_ref().ok_or_else(|| Error::MissingSetting {
            section: "req".into(),
            key: "x509_extensions".into(),
        })?;
        if !extensions.is_ca() {
            return Err(Error::InconsistentExtensions {
                section: extensions.name().to_owned(),
                reason: "a CA certificate needs basicConstraints CA:true".into(),
            });
        }
        if req.subject.common_name().is_none() {
            return Err(Error::PolicyViolation {
                field: Field::CommonName.long_name().to_owned(),
                reason: "is required for the CA certificate".into(),
            });
        }

        for dir in [Some(&settings.new_certs_dir), settings.certs.as_ref()]
            .into_iter()
            .flatten()
        {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }

        let key = keys::generate_private_key(rng, req.default_bits)?;
        keys::write_private_key(&settings.private_key, &key)?;

        let mut serial_bytes = [0u8; 8];
        rng.fill_bytes(&mut serial_bytes);
        serial_bytes[0] &= 0x7f;
        let serial = Serial::from_be_bytes(&serial_bytes);

        let spki = keys::public_key_info(&key)?;
        let name = req.subject.to_name()?;
        let serial_number = serial.to_serial_number()?;
        let issuer = IssuerRef {
            public_key: &spki,
            name: &name,
            serial: &serial_number,
        };
        let (not_before, not_after) = database::expiry(now, settings.default_days)?;
        let certificate = build_certificate(
            &key,
            &serial,
            &issuer,
            &name,
            &spki,
            (not_before, not_after),
            extensions,
        )?;

        write_file(
            &settings.certificate,
            certificate.to_pem(LineEnding::LF)?.as_bytes(),
        )?;
        Database::create(&settings.database, settings.unique_subject)?;
        SerialFile::new(&settings.serial).create(&Serial::from(1))?;

        tracing::info!(
            subject = %req.subject,
            certificate = %settings.certificate.display(),
            "initialized certificate authority"
        );
        Ok(Self {
            settings,
            key,
            certificate,
            subject: req.subject,
        })
    }

    /// Load an existing CA described by `conf`.
    pub fn open(conf: &Conf, ca_name: Option<&str>, base: &Path) -> Result<Self> {
        let settings = CaSettings::from_conf(conf, ca_name, base)?;
        let key = keys::read_private_key(&settings.private_key)?;

        let pem = fs::read_to_string(&settings.certificate)
            .map_err(|e| Error::io(&settings.certificate, e))?;
        let certificate = Certificate::from_pem(pem.trim_start())?;
        if keys::public_key_info(&key)? != certificate.tbs_certificate.subject_public_key_info {
            return Err(Error::InvalidSetting {
                section: settings.name.clone(),
                key: "private_key".into(),
                reason: "does not match the CA certificate".into(),
            });
        }
        let subject = DistinguishedName::from_name(&certificate.tbs_certificate.subject)?;

        tracing::debug!(%subject, section = %settings.name, "opened certificate authority");
        Ok(Self {
            settings,
            key,
            certificate,
            subject,
        })
    }

    /// Load the configuration at `path` and open its default CA. Relative
    /// paths in the file resolve against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conf = Conf::load(path)?;
        Self::open(&conf, None, &config_base(path))
    }

    /// Settings in effect.
    pub fn settings(&self) -> &CaSettings {
        &self.settings
    }

    /// The CA certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Subject of the CA certificate.
    pub fn subject(&self) -> &DistinguishedName {
        &self.subject
    }

    /// Sign `request` with the configured `x509_extensions`.
    pub fn sign(&self, request: &CertificateRequest, now: SystemTime) -> Result<IssuedCertificate> {
        self.sign_with(request, self.settings.extensions.as_ref(), now)
    }

    /// Sign `request` with an explicit extension set, e.g. `[v3_ca]` for an
    /// intermediate.
    ///
    /// Nothing is written unless every check passes. The database lock is
    /// held from the uniqueness check until the serial file is advanced.
    pub fn sign_with(
        &self,
        request: &CertificateRequest,
        extensions: Option<&ExtensionSet>,
        now: SystemTime,
    ) -> Result<IssuedCertificate> {
        request.verify()?;
        let requested = request.subject()?;
        let mut subject =
            self.settings
                .policy
                .apply(&requested, &self.subject, self.settings.preserve)?;
        if !self.settings.email_in_dn {
            subject.remove(Field::Email);
        }
        if let Some(extensions) = extensions {
            extensions.validate()?;
        }

        let _lock = DatabaseLock::acquire(&self.settings.database)?;
        let mut db = Database::load(&self.settings.database)?;
        let serial_file = SerialFile::new(&self.settings.serial);
        let serial = serial_file.read()?;
        if let Some(last) = db.last_serial().filter(|last| serial <= **last) {
            return Err(Error::corrupt(
                serial_file.path(),
                format!("next serial {serial} is not above the last issued serial {last}"),
            ));
        }

        let line = subject.to_string();
        let unique = db.unique_subject().unwrap_or(self.settings.unique_subject);
        if unique && db.find_valid(&line).is_some() {
            return Err(Error::DuplicateSubject(line));
        }
        tracing::info!(%serial, subject = %line, "allocated serial");

        let tbs = &self.certificate.tbs_certificate;
        let issuer = IssuerRef {
            public_key: &tbs.subject_public_key_info,
            name: &tbs.subject,
            serial: &tbs.serial_number,
        };
        let validity = database::expiry(now, self.settings.default_days)?;
        let certificate = build_certificate(
            &self.key,
            &serial,
            &issuer,
            &subject.to_name()?,
            request.public_key(),
            validity,
            extensions.unwrap_or(&ExtensionSet::empty()),
        )?;

        let path = self
            .settings
            .new_certs_dir
            .join(format!("{}.pem", serial.to_hex()));
        write_file(&path, certificate.to_pem(LineEnding::LF)?.as_bytes())?;
        db.append(Entry::valid(serial.clone(), validity.1, line))?;
        serial_file.write(&serial.next())?;

        tracing::info!(%serial, path = %path.display(), "wrote certificate");
        Ok(IssuedCertificate {
            serial,
            subject,
            not_after: validity.1,
            path,
            certificate,
        })
    }
}

/// Directory that relative paths in the config file at `path` resolve
/// against.
pub fn config_base(path: &Path) -> PathBuf {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
        _ => PathBuf::from("."),
    }
}

fn build_certificate(
    key: &RsaPrivateKey,
    serial: &Serial,
    issuer: &IssuerRef<'_>,
    subject: &Name,
    subject_key: &SubjectPublicKeyInfoOwned,
    (not_before, not_after): (DateTime, DateTime),
    extensions: &ExtensionSet,
) -> Result<Certificate> {
    let extensions = extensions.to_extensions(subject_key, issuer)?;
    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: serial.to_serial_number()?,
        signature: keys::sha256_with_rsa(),
        issuer: issuer.name.clone(),
        validity: Validity {
            not_before: to_time(not_before)?,
            not_after: to_time(not_after)?,
        },
        subject: subject.clone(),
        subject_public_key_info: subject_key.clone(),
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: (!extensions.is_empty()).then_some(extensions),
    };
    let signature = keys::sign_sha256(key, &tbs_certificate.to_der()?)?;
    Ok(Certificate {
        tbs_certificate,
        signature_algorithm: keys::sha256_with_rsa(),
        signature,
    })
}

/// UTCTime through 2049, GeneralizedTime after.
fn to_time(t: DateTime) -> Result<Time> {
    if t.year() <= UtcTime::MAX_YEAR {
        Ok(UtcTime::from_date_time(t)?.into())
    } else {
        Ok(GeneralizedTime::from_date_time(t).into())
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| Error::io(path, e))
}
