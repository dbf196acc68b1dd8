//! PKCS#10 certificate signing requests.

use crate::{
    errors::{Error, Result},
    keys,
    name::DistinguishedName,
};
use der::{pem::LineEnding, Decode, DecodePem, Encode, EncodePem};
use rsa::RsaPrivateKey;
use spki::SubjectPublicKeyInfoOwned;
use x509_cert::request::{CertReq, CertReqInfo, Version};

/// A signing request, as produced by `openssl req -new`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateRequest {
    inner: CertReq,
}

impl CertificateRequest {
    /// Build and self-sign a request for `subject` over `key`.
    pub fn generate(key: &RsaPrivateKey, subject: &DistinguishedName) -> Result<Self> {
        let info = CertReqInfo {
            version: Version::V1,
            subject: subject.to_name()?,
            public_key: keys::public_key_info(key)?,
            attributes: Default::default(),
        };
        let signature = keys::sign_sha256(key, &info.to_der()?)?;

        tracing::debug!(%subject, "generated certificate request");
        Ok(Self {
            inner: CertReq {
                info,
                algorithm: keys::sha256_with_rsa(),
                signature,
            },
        })
    }

    /// Decode a `CERTIFICATE REQUEST` PEM block. The signature is not
    /// checked; see [`CertificateRequest::verify`].
    pub fn from_pem(pem: &str) -> Result<Self> {
        let inner = CertReq::from_pem(pem.trim_start())
            .map_err(|e| Error::InvalidRequest(format!("cannot decode request: {e}")))?;
        Ok(Self { inner })
    }

    /// Decode DER bytes.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let inner = CertReq::from_der(der)
            .map_err(|e| Error::InvalidRequest(format!("cannot decode request: {e}")))?;
        Ok(Self { inner })
    }

    /// PEM encoding with LF line endings.
    pub fn to_pem(&self) -> Result<String> {
        Ok(self.inner.to_pem(LineEnding::LF)?)
    }

    /// Check the request was signed by the key it carries.
    pub fn verify(&self) -> Result<()> {
        keys::verify_signature(
            &self.inner.info.public_key,
            &self.inner.algorithm,
            &self.inner.info.to_der()?,
            &self.inner.signature,
        )
    }

    /// Requested subject.
    pub fn subject(&self) -> Result<DistinguishedName> {
        DistinguishedName::from_name(&self.inner.info.subject)
    }

    /// Public key to certify.
    pub fn public_key(&self) -> &SubjectPublicKeyInfoOwned {
        &self.inner.info.public_key
    }

    /// Underlying PKCS#10 structure.
    pub fn as_cert_req(&self) -> &CertReq {
        &self.inner
    }
}

impl From<CertReq> for CertificateRequest {
    fn from(inner: CertReq) -> Self {
        Self { inner }
    }
}
