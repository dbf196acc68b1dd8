//! Error types.

use std::path::PathBuf;

/// Alias for [`core::result::Result`] with the `fixture-ca` error type.
pub type Result<T> = core::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration file.
    #[error("config parse error at line {line}: {reason}")]
    ConfigParse {
        /// 1-based line number.
        line: usize,
        /// What is wrong with the line.
        reason: String,
    },

    /// A required configuration key is absent.
    #[error("missing setting `{key}` in section [{section}]")]
    MissingSetting {
        /// Section that was searched.
        section: String,
        /// Key that was not found.
        key: String,
    },

    /// A configuration key holds a value this crate cannot interpret.
    #[error("invalid value for `{key}` in section [{section}]: {reason}")]
    InvalidSetting {
        /// Section holding the key.
        section: String,
        /// Offending key.
        key: String,
        /// Why the value was refused.
        reason: String,
    },

    /// Message digest other than SHA-256.
    #[error("unsupported message digest `{0}`")]
    UnsupportedDigest(String),

    /// The request subject does not satisfy the signing policy.
    #[error("policy violation: field `{field}` {reason}")]
    PolicyViolation {
        /// Long name of the DN field.
        field: String,
        /// How the field failed its rule.
        reason: String,
    },

    /// The extension set declares a CA without `keyCertSign`, or the reverse.
    #[error("inconsistent extensions in [{section}]: {reason}")]
    InconsistentExtensions {
        /// Extension section name.
        section: String,
        /// Which constraint is broken.
        reason: String,
    },

    /// A CSR that cannot be decoded or whose self-signature does not verify.
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    /// `unique_subject = yes` and the subject has already been issued.
    #[error("subject `{0}` already has a valid certificate")]
    DuplicateSubject(String),

    /// The index or serial file is unreadable as an OpenSSL CA database.
    #[error("CA database corrupt ({}): {reason}", path.display())]
    DatabaseCorrupt {
        /// Index or serial file.
        path: PathBuf,
        /// What could not be read.
        reason: String,
    },

    /// Another issuance holds the database lock.
    #[error("CA database is locked by another issuer ({})", .0.display())]
    DatabaseLocked(PathBuf),

    /// The compose definition does not satisfy the invocation contract.
    #[error("invalid compose definition: {0}")]
    InvalidCompose(String),

    /// A secret was placed where it would be baked into the image.
    #[error("secret `{0}` must be passed through the environment, not the image build")]
    SecretInBuild(String),

    /// A required environment variable is unset at run time.
    #[error("required environment variable `{0}` is not set")]
    MissingEnvironment(String),

    /// Key generation or signing failure.
    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    /// Signature creation or verification failure.
    #[error("signature error: {0}")]
    Signature(#[from] signature::Error),

    /// DER/PEM encoding failure.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// PKCS#8 key encoding failure.
    #[error("PKCS#8 error: {0}")]
    Pkcs8(#[from] pkcs8::Error),

    /// PKCS#1 key encoding failure.
    #[error("PKCS#1 error: {0}")]
    Pkcs1(#[from] pkcs1::Error),

    /// SubjectPublicKeyInfo encoding failure.
    #[error("SPKI error: {0}")]
    Spki(#[from] spki::Error),

    /// YAML (de)serialization failure.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Filesystem or process failure, with the path involved.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// Path being accessed, or the program being launched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::DatabaseCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
