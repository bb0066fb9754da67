//! Certificate store integration tests
//!
//! Exercise the store through its public API only: CA lifecycle across store
//! instances, issuance, persistence round trips and verification of persisted
//! leaves against persisted CAs.

use std::fs;

use pretty_assertions::assert_eq;
use trustgate::Error;
use trustgate::config::PkiConfig;
use trustgate::identity::CertIdentity;
use trustgate::pki::{AltNames, CA_PAIR_NAME, CertStore, KeyRole, TrustPool, load_certs};

fn open(dir: &std::path::Path) -> CertStore {
    CertStore::new(dir, PkiConfig::default()).unwrap()
}

#[test]
fn issued_leaf_verifies_against_persisted_ca_only() {
    // GIVEN: two CAs in one directory
    let dir = tempfile::tempdir().unwrap();
    let mut api = open(dir.path());
    api.init_ca("apiserver").unwrap();
    let mut db = open(dir.path());
    db.init_ca("database").unwrap();

    // WHEN: apiserver issues and persists a client pair
    let pair = api.new_client_cert_pair(&AltNames::dns("rudro")).unwrap();
    let paths = api.write_pair("rudro", &pair).unwrap();

    // THEN: it verifies against apiserver's CA file and not database's
    let chain = load_certs(&paths.cert).unwrap();
    let api_pool = TrustPool::from_der(load_certs(&api.cert_file(CA_PAIR_NAME)).unwrap()).unwrap();
    let db_pool = TrustPool::from_der(load_certs(&db.cert_file(CA_PAIR_NAME)).unwrap()).unwrap();
    assert!(api_pool.verify(&chain, KeyRole::Client).is_ok());
    assert!(db_pool.verify(&chain, KeyRole::Client).is_err());

    let id = CertIdentity::from_der(&chain[0]).unwrap();
    assert_eq!(id.common_name.as_deref(), Some("rudro"));
    assert_eq!(id.issuer_common_name.as_deref(), Some("apiserver"));
}

#[test]
fn reopening_the_store_keeps_old_leaves_valid() {
    // GIVEN: a leaf issued before a restart
    let dir = tempfile::tempdir().unwrap();
    let mut first = open(dir.path());
    first.init_ca("database").unwrap();
    let pair = first
        .new_server_cert_pair(&AltNames::ip("127.0.0.2".parse().unwrap()))
        .unwrap();
    let paths = first.write_pair("tls", &pair).unwrap();
    drop(first);

    // WHEN: a new store instance initialises the same CA
    let mut second = open(dir.path());
    second.init_ca("database").unwrap();

    // THEN: the old leaf still chains to it
    let pool = TrustPool::from_pem(&second.ca_cert_bytes().unwrap()).unwrap();
    let chain = load_certs(&paths.cert).unwrap();
    assert!(pool.verify(&chain, KeyRole::Server).is_ok());
}

#[test]
fn written_pair_reads_back_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path());
    store.init_ca("requestheader").unwrap();
    let pair = store
        .new_client_cert_pair(&AltNames::dns("apiserver.rudro"))
        .unwrap();

    store.write_pair("apiserver.rudro", &pair).unwrap();

    let cert = fs::read_to_string(store.cert_file("apiserver.rudro")).unwrap();
    let key = fs::read_to_string(store.key_file("apiserver.rudro")).unwrap();
    assert_eq!(cert, pair.cert_pem);
    assert_eq!(key, pair.key_pem);
}

#[test]
fn loading_a_peer_ca_without_its_key_is_verify_only() {
    // GIVEN: the apiserver CA with its key file removed, as a peer would see it
    let dir = tempfile::tempdir().unwrap();
    let mut owner = open(dir.path());
    owner.init_ca("apiserver").unwrap();
    fs::remove_file(owner.key_file(CA_PAIR_NAME)).unwrap();

    // WHEN: another store loads it
    let mut peer = open(dir.path());
    let ca = peer.load_ca("apiserver").unwrap();
    assert!(!ca.can_sign());

    // THEN: it can feed a trust pool but not issue
    assert!(TrustPool::from_pem(&peer.ca_cert_bytes().unwrap()).is_ok());
    assert!(matches!(
        peer.new_client_cert_pair(&AltNames::dns("x")),
        Err(Error::MissingSigningKey(_))
    ));
}

#[test]
fn unknown_ca_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = open(dir.path());
    assert!(matches!(store.load_ca("database"), Err(Error::NotFound(_))));
}

#[test]
fn issuance_before_init_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path());
    assert!(matches!(
        store.new_server_cert_pair(&AltNames::dns("db.local")),
        Err(Error::NoActiveAuthority)
    ));
}
