#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

//! # Usage
//!
//! ## Issuing a fixture certificate
//!
//! ```no_run
//! # fn main() -> fixture_ca::Result<()> {
//! use fixture_ca::{
//!     keys, CertificateAuthority, CertificateRequest, DistinguishedName, Field,
//! };
//! use std::time::SystemTime;
//!
//! let ca = CertificateAuthority::load("fixtures/ca/openssl.cnf")?;
//!
//! let mut rng = rand_core::OsRng;
//! let key = keys::generate_private_key(&mut rng, 4096)?;
//! let subject = DistinguishedName::new()
//!     .with(Field::Country, "US")
//!     .with(Field::CommonName, "localhost");
//! let csr = CertificateRequest::generate(&key, &subject)?;
//!
//! let issued = ca.sign(&csr, SystemTime::now())?;
//! println!("{} -> {}", issued.serial, issued.path.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Running the integration suite
//!
//! ```no_run
//! # fn main() -> fixture_ca::Result<()> {
//! use fixture_ca::compose::{ComposeFile, Runner, SystemExecutor, TestInvocation};
//!
//! let path = "fixtures/integration/docker-compose.yml";
//! let invocation = TestInvocation::from_compose(&ComposeFile::load(path)?)?;
//! let code = Runner::new(SystemExecutor, path).run(&invocation)?;
//! std::process::exit(code);
//! # }
//! ```

pub use rand_core;
pub use rsa;
pub use x509_cert;

pub mod authority;
pub mod cnf;
pub mod compose;
pub mod database;
pub mod errors;
pub mod extensions;
pub mod keys;
pub mod name;
pub mod policy;
pub mod request;
pub mod settings;

pub use crate::{
    authority::{CertificateAuthority, IssuedCertificate},
    cnf::Conf,
    database::Serial,
    errors::{Error, Result},
    extensions::ExtensionSet,
    name::{DistinguishedName, Field},
    policy::{PolicyRuleSet, Requirement},
    request::CertificateRequest,
    settings::{CaSettings, ReqSettings},
};
