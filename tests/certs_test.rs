use paddock::trust::{fingerprint_pem, ClusterCertificate, ServerCertificate};
use tempfile::TempDir;

#[test]
fn test_cluster_certificate_generate() {
    let cert = ClusterCertificate::generate("pasture").unwrap();
    assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
    assert!(cert.key_pem().contains("PRIVATE KEY"));
}

#[test]
fn test_cluster_certificate_save_load() {
    let dir = TempDir::new().unwrap();
    let cert = ClusterCertificate::generate("pasture").unwrap();
    cert.save(dir.path()).unwrap();

    assert!(ClusterCertificate::exists(dir.path()));

    let loaded = ClusterCertificate::load(dir.path()).unwrap();
    assert_eq!(loaded.cert_pem, cert.cert_pem);
    assert_eq!(loaded.fingerprint().unwrap(), cert.fingerprint().unwrap());
}

#[test]
fn test_cluster_certificate_remove() {
    let dir = TempDir::new().unwrap();
    let cert = ClusterCertificate::generate("pasture").unwrap();
    cert.save(dir.path()).unwrap();

    ClusterCertificate::remove(dir.path()).unwrap();
    assert!(!ClusterCertificate::exists(dir.path()));

    // Removing twice is fine.
    ClusterCertificate::remove(dir.path()).unwrap();
}

#[test]
fn test_cluster_certificate_from_pem_roundtrip() {
    let cert = ClusterCertificate::generate("pasture").unwrap();
    let reparsed = ClusterCertificate::from_pem(&cert.cert_pem, &cert.key_pem()).unwrap();
    assert_eq!(reparsed.fingerprint().unwrap(), cert.fingerprint().unwrap());
}

#[test]
fn test_fingerprints_differ_between_certificates() {
    let a = ClusterCertificate::generate("one").unwrap();
    let b = ClusterCertificate::generate("two").unwrap();
    assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());

    // SHA-256, hex encoded.
    assert_eq!(a.fingerprint().unwrap().len(), 64);
}

#[test]
fn test_server_certificate_generate() {
    let cert = ServerCertificate::generate(
        "n1",
        vec!["10.0.0.1:8443".to_string(), "host1.example:8443".to_string()],
    )
    .unwrap();

    assert_eq!(cert.server_name, "n1");
    assert!(cert.cert_pem.contains("BEGIN CERTIFICATE"));
    assert_eq!(cert.fingerprint().unwrap(), fingerprint_pem(&cert.cert_pem).unwrap());
}

#[test]
fn test_server_certificate_load_or_generate_is_stable() {
    let dir = TempDir::new().unwrap();

    let first =
        ServerCertificate::load_or_generate(dir.path(), "n1", vec!["10.0.0.1:8443".to_string()])
            .unwrap();
    let second =
        ServerCertificate::load_or_generate(dir.path(), "n1", vec!["10.0.0.1:8443".to_string()])
            .unwrap();

    assert_eq!(first.fingerprint().unwrap(), second.fingerprint().unwrap());
    assert_eq!(second.server_name, "n1");
}
