//! End-to-end issuance against a CA directory built from the shipped config.

use fixture_ca::{
    database::Database, keys, CertificateAuthority, CertificateRequest, Conf, DistinguishedName,
    Error, ExtensionSet, Field, Serial,
};
use proptest::prelude::*;
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use p256::pkcs8::EncodePublicKey;
use rsa::{pkcs1v15, RsaPrivateKey};
use sha2::Sha384;
use signature::{SignatureEncoding, Signer};
use std::{
    fs,
    path::Path,
    sync::OnceLock,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use x509_cert::{
    attr::AttributeTypeAndValue,
    der::{
        asn1::{Any, BitString},
        Decode, DecodePem, Encode, Tag,
    },
    ext::pkix::BasicConstraints,
    request::{CertReq, CertReqInfo, Version},
    spki::{AlgorithmIdentifierOwned, ObjectIdentifier, SubjectPublicKeyInfoOwned},
    Certificate,
};

const CNF: &str = include_str!("../fixtures/ca/openssl.cnf");

fn now() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_760_000_000)
}

fn conf() -> Conf {
    // WARNING: small keys keep the tests fast; never use these sizes for real.
    Conf::parse(&CNF.replace("default_bits = 4096", "default_bits = 1024")).unwrap()
}

fn new_ca(dir: &Path) -> CertificateAuthority {
    let mut rng = ChaCha8Rng::from_seed([42; 32]);
    CertificateAuthority::init(&mut rng, &conf(), None, dir, now()).unwrap()
}

fn request_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = ChaCha8Rng::from_seed([7; 32]);
        keys::generate_private_key(&mut rng, 1024).unwrap()
    })
}

fn request(subject: &DistinguishedName) -> CertificateRequest {
    CertificateRequest::generate(request_key(), subject).unwrap()
}

/// Self-sign a request over `public_key` with an arbitrary algorithm.
fn signed_request(
    subject: &DistinguishedName,
    public_key: SubjectPublicKeyInfoOwned,
    algorithm: AlgorithmIdentifierOwned,
    sign: impl FnOnce(&[u8]) -> Vec<u8>,
) -> CertificateRequest {
    let info = CertReqInfo {
        version: Version::V1,
        subject: subject.to_name().unwrap(),
        public_key,
        attributes: Default::default(),
    };
    let signature = BitString::from_bytes(&sign(&info.to_der().unwrap())).unwrap();
    CertReq {
        info,
        algorithm,
        signature,
    }
    .into()
}

fn basic_constraints(cert: &Certificate) -> Option<BasicConstraints> {
    cert.tbs_certificate
        .get::<BasicConstraints>()
        .unwrap()
        .map(|(_, bc)| bc)
}

#[test]
fn csr_pem_round_trips_through_signing() {
    let dir = tempfile::tempdir().unwrap();
    let ca = new_ca(dir.path());

    let subject = DistinguishedName::new()
        .with(Field::Country, "US")
        .with(Field::Organization, "Vector")
        .with(Field::CommonName, "localhost");
    let pem = request(&subject).to_pem().unwrap();
    let issued = ca
        .sign(&CertificateRequest::from_pem(&pem).unwrap(), now())
        .unwrap();

    let on_disk = Certificate::from_pem(fs::read_to_string(&issued.path).unwrap()).unwrap();
    assert_eq!(on_disk.to_der().unwrap(), issued.certificate.to_der().unwrap());
    assert_eq!(
        DistinguishedName::from_name(&on_disk.tbs_certificate.subject).unwrap(),
        subject
    );
}

#[test]
fn subject_attributes_outside_the_policy_are_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let ca = new_ca(dir.path());

    let mut subject = DistinguishedName::new();
    subject.push_opaque(AttributeTypeAndValue {
        oid: ObjectIdentifier::new_unwrap("0.9.2342.19200300.100.1.25"),
        value: Any::new(Tag::Ia5String, b"com".as_slice()).unwrap(),
    });
    subject.set(Field::CommonName, "host");
    let req = request(&subject);
    req.verify().unwrap();

    let issued = ca.sign(&req, now()).unwrap();
    assert_eq!(issued.subject.to_string(), "/CN=host");
    assert_eq!(
        issued.certificate.tbs_certificate.subject,
        DistinguishedName::new()
            .with(Field::CommonName, "host")
            .to_name()
            .unwrap()
    );
}

#[test]
fn sha384_rsa_request_is_issued() {
    let dir = tempfile::tempdir().unwrap();
    let ca = new_ca(dir.path());
    let subject = DistinguishedName::new().with(Field::CommonName, "sha384");

    let signer = pkcs1v15::SigningKey::<Sha384>::new(request_key().clone());
    let req = signed_request(
        &subject,
        keys::public_key_info(request_key()).unwrap(),
        AlgorithmIdentifierOwned {
            oid: keys::SHA384_WITH_RSA_ENCRYPTION,
            parameters: Some(Any::null()),
        },
        |msg| signer.sign(msg).to_vec(),
    );

    let issued = ca.sign(&req, now()).unwrap();
    assert_eq!(issued.certificate.signature_algorithm, keys::sha256_with_rsa());
}

#[test]
fn ecdsa_request_is_issued_with_its_own_key() {
    let dir = tempfile::tempdir().unwrap();
    let ca = new_ca(dir.path());
    let subject = DistinguishedName::new().with(Field::CommonName, "ecdsa");

    let mut rng = ChaCha8Rng::from_seed([13; 32]);
    let signer = p256::ecdsa::SigningKey::random(&mut rng);
    let der = signer.verifying_key().to_public_key_der().unwrap();
    let public_key = SubjectPublicKeyInfoOwned::from_der(der.as_bytes()).unwrap();
    let req = signed_request(
        &subject,
        public_key.clone(),
        AlgorithmIdentifierOwned {
            oid: keys::ECDSA_WITH_SHA256,
            parameters: None,
        },
        |msg| {
            let signature: p256::ecdsa::Signature = signer.sign(msg);
            signature.to_der().as_bytes().to_vec()
        },
    );

    let issued = ca.sign(&req, now()).unwrap();
    assert_eq!(
        issued.certificate.tbs_certificate.subject_public_key_info,
        public_key
    );
    assert_eq!(issued.certificate.signature_algorithm, keys::sha256_with_rsa());
}

#[test]
fn missing_common_name_fails_with_policy_violation() {
    let dir = tempfile::tempdir().unwrap();
    let ca = new_ca(dir.path());

    for subject in [
        DistinguishedName::new().with(Field::Country, "US"),
        DistinguishedName::new().with(Field::CommonName, ""),
        DistinguishedName::new(),
    ] {
        assert!(matches!(
            ca.sign(&request(&subject), now()),
            Err(Error::PolicyViolation { .. })
        ));
    }
    assert!(Database::load(dir.path().join("index.txt"))
        .unwrap()
        .entries()
        .is_empty());
}

#[test]
fn ca_flag_only_with_v3_ca_extensions() {
    let dir = tempfile::tempdir().unwrap();
    let ca = new_ca(dir.path());
    let conf = conf();
    let subject = DistinguishedName::new().with(Field::CommonName, "sub");

    let leaf = ca.sign(&request(&subject), now()).unwrap();
    assert!(!basic_constraints(&leaf.certificate).unwrap().ca);

    let v3_ca = ExtensionSet::from_section(conf.section("v3_ca").unwrap()).unwrap();
    let intermediate = ca
        .sign_with(&request(&subject), Some(&v3_ca), now())
        .unwrap();
    assert!(basic_constraints(&intermediate.certificate).unwrap().ca);

    let usr_cert = ExtensionSet::from_section(conf.section("usr_cert").unwrap()).unwrap();
    let leaf = ca
        .sign_with(&request(&subject), Some(&usr_cert), now())
        .unwrap();
    assert!(!basic_constraints(&leaf.certificate).unwrap().ca);

    assert!(basic_constraints(ca.certificate()).unwrap().ca);
}

#[test]
fn reopened_ca_continues_the_serial_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let subject = DistinguishedName::new().with(Field::CommonName, "again");
    new_ca(dir.path()).sign(&request(&subject), now()).unwrap();

    let cnf = dir.path().join("openssl.cnf");
    fs::write(&cnf, CNF).unwrap();
    let ca = CertificateAuthority::load(&cnf).unwrap();
    let issued = ca.sign(&request(&subject), now()).unwrap();
    assert_eq!(issued.serial, Serial::from(2));
    assert!(dir.path().join("newcerts/02.pem").exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn serials_strictly_increase(names in prop::collection::vec("[a-z][a-z0-9-]{0,15}", 1..5)) {
        let dir = tempfile::tempdir().unwrap();
        let ca = new_ca(dir.path());
        let index = dir.path().join("index.txt");

        for name in names {
            let previous = Database::load(&index).unwrap().last_serial().cloned();
            let subject = DistinguishedName::new().with(Field::CommonName, name);
            let issued = ca.sign(&request(&subject), now()).unwrap();

            if let Some(previous) = previous {
                prop_assert!(issued.serial > previous);
            }
            let db = Database::load(&index).unwrap();
            prop_assert_eq!(db.last_serial(), Some(&issued.serial));
        }
    }
}
