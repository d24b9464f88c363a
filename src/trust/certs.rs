use anyhow::{anyhow, Context, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::path::Path;

pub const CLUSTER_CERT_FILE: &str = "cluster.crt";
pub const CLUSTER_KEY_FILE: &str = "cluster.key";
pub const SERVER_CERT_FILE: &str = "server.crt";
pub const SERVER_KEY_FILE: &str = "server.key";

// Certificate files are written via a temporary file and rename so that a
// crash can never leave a half-written key on disk.
fn write_atomic<P: AsRef<Path>>(path: P, contents: &str) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to rename into {:?}", path))?;
    Ok(())
}

pub fn fingerprint_pem(cert_pem: &str) -> Result<String> {
    let parsed = pem::parse(cert_pem)?;
    let mut hasher = Sha256::new();
    hasher.update(parsed.contents());
    Ok(hex::encode(hasher.finalize()))
}

fn extract_cn_from_pem(pem_str: &str) -> Result<String> {
    let parsed = pem::parse(pem_str)?;
    let (_, cert) = x509_parser::parse_x509_certificate(parsed.contents())
        .map_err(|e| anyhow!("Failed to parse certificate: {:?}", e))?;

    for attr in cert.subject().iter_common_name() {
        if let Ok(cn) = attr.as_str() {
            return Ok(cn.to_string());
        }
    }

    Err(anyhow!("No CN found in certificate"))
}

// The shared cluster certificate: acts as both the cluster CA and the
// serving certificate on every member. The private key is only ever held by
// voters and stand-bys; it travels once, inside the accept response.
pub struct ClusterCertificate {
    key_pair: KeyPair,
    cn: String,
    pub cert_pem: String,
}

impl Clone for ClusterCertificate {
    fn clone(&self) -> Self {
        Self {
            key_pair: KeyPair::from_pem(&self.key_pair.serialize_pem()).unwrap(),
            cn: self.cn.clone(),
            cert_pem: self.cert_pem.clone(),
        }
    }
}

impl ClusterCertificate {
    fn make_params(cn: &str) -> CertificateParams {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        dn.push(DnType::OrganizationName, "Paddock");
        params.distinguished_name = dn;
        params
    }

    pub fn generate(cluster_name: &str) -> Result<Self> {
        let cn = format!("paddock cluster {}", cluster_name);
        let params = Self::make_params(&cn);

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            key_pair,
            cn,
            cert_pem: cert.pem(),
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let cn = extract_cn_from_pem(cert_pem)?;
        Ok(Self {
            key_pair,
            cn,
            cert_pem: cert_pem.to_string(),
        })
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(dir.as_ref().join(CLUSTER_CERT_FILE))?;
        let key_pem = std::fs::read_to_string(dir.as_ref().join(CLUSTER_KEY_FILE))?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        write_atomic(dir.as_ref().join(CLUSTER_CERT_FILE), &self.cert_pem)?;
        write_atomic(
            dir.as_ref().join(CLUSTER_KEY_FILE),
            &self.key_pair.serialize_pem(),
        )?;
        Ok(())
    }

    pub fn remove<P: AsRef<Path>>(dir: P) -> Result<()> {
        for file in [CLUSTER_CERT_FILE, CLUSTER_KEY_FILE] {
            let path = dir.as_ref().join(file);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {:?}", path))?;
            }
        }
        Ok(())
    }

    pub fn exists<P: AsRef<Path>>(dir: P) -> bool {
        dir.as_ref().join(CLUSTER_CERT_FILE).exists()
            && dir.as_ref().join(CLUSTER_KEY_FILE).exists()
    }

    pub fn key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    pub fn fingerprint(&self) -> Result<String> {
        fingerprint_pem(&self.cert_pem)
    }
}

// Per-node server identity, present on every member regardless of role.
// Self-signed; the cluster trusts it by fingerprint after a successful
// token exchange.
#[derive(Clone)]
pub struct ServerCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    pub server_name: String,
}

impl ServerCertificate {
    pub fn generate(server_name: &str, addresses: Vec<String>) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name);
        dn.push(DnType::OrganizationName, "Paddock");
        params.distinguished_name = dn;

        let mut sans = vec![SanType::DnsName(server_name.try_into()?)];
        for address in addresses {
            let host = address
                .rsplit_once(':')
                .map(|(h, _)| h)
                .unwrap_or(address.as_str());
            if let Ok(ip) = host.parse() {
                sans.push(SanType::IpAddress(ip));
            } else if let Ok(name) = host.to_string().try_into() {
                sans.push(SanType::DnsName(name));
            }
        }
        params.subject_alt_names = sans;

        let key_pair = KeyPair::generate()?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
            server_name: server_name.to_string(),
        })
    }

    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(dir.as_ref().join(SERVER_CERT_FILE))?;
        let key_pem = std::fs::read_to_string(dir.as_ref().join(SERVER_KEY_FILE))?;
        let server_name = extract_cn_from_pem(&cert_pem)?;

        Ok(Self {
            cert_pem,
            key_pem,
            server_name,
        })
    }

    pub fn load_or_generate<P: AsRef<Path>>(
        dir: P,
        server_name: &str,
        addresses: Vec<String>,
    ) -> Result<Self> {
        if dir.as_ref().join(SERVER_CERT_FILE).exists() {
            return Self::load(dir);
        }

        let cert = Self::generate(server_name, addresses)?;
        cert.save(&dir)?;
        Ok(cert)
    }

    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        write_atomic(dir.as_ref().join(SERVER_CERT_FILE), &self.cert_pem)?;
        write_atomic(dir.as_ref().join(SERVER_KEY_FILE), &self.key_pem)?;
        Ok(())
    }

    pub fn fingerprint(&self) -> Result<String> {
        fingerprint_pem(&self.cert_pem)
    }
}
