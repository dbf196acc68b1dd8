#![feature(test)]

extern crate test;

use fixture_ca::{
    keys, CertificateAuthority, CertificateRequest, Conf, DistinguishedName, Field,
};
use rand_chacha::{rand_core::SeedableRng, ChaCha8Rng};
use std::time::SystemTime;
use test::Bencher;

const CNF: &str = include_str!("../fixtures/ca/openssl.cnf");

fn request(bits: usize) -> CertificateRequest {
    let mut rng = ChaCha8Rng::from_seed([3; 32]);
    let key = keys::generate_private_key(&mut rng, bits).unwrap();
    let subject = DistinguishedName::new().with(Field::CommonName, "bench");
    CertificateRequest::generate(&key, &subject).unwrap()
}

#[bench]
fn bench_verify_request_2048(b: &mut Bencher) {
    let req = request(2048);
    b.iter(|| {
        req.verify().unwrap();
    });
}

#[bench]
fn bench_sign_2048(b: &mut Bencher) {
    let dir = tempfile::tempdir().unwrap();
    let conf = Conf::parse(&CNF.replace("default_bits = 4096", "default_bits = 2048")).unwrap();
    let mut rng = ChaCha8Rng::from_seed([5; 32]);
    let ca = CertificateAuthority::init(&mut rng, &conf, None, dir.path(), SystemTime::now())
        .unwrap();
    let req = request(2048);

    b.iter(|| {
        test::black_box(ca.sign(&req, SystemTime::now()).unwrap());
    });
}
