//! X.509 helpers: hostname verification for scraped auth hosts, and the
//! deliberately unverified client TLS config used against the base station
//! (its certificate chain is issued by an Arlo-local CA that no default
//! trust store carries).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{self, Certificate, ClientConfig, PrivateKey};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use crate::error::{Error, Result};

/// Check that `hostname` is covered by the PEM certificate's subject
/// alternative names (or, failing that, its subject common name).
pub fn verify_cert_hostname(cert_pem: &str, hostname: &str) -> Result<()> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|err| Error::tls(format!("could not decode cert PEM: {err}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|err| Error::tls(format!("could not parse cert: {err}")))?;

    let ip: Option<IpAddr> = hostname.parse().ok();

    let san = cert
        .subject_alternative_name()
        .map_err(|err| Error::tls(format!("invalid subjectAltName: {err}")))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(pattern) if ip.is_none() => {
                    if hostname_matches(pattern, hostname) {
                        return Ok(());
                    }
                }
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip {
                        if ip_matches(bytes, &ip) {
                            return Ok(());
                        }
                    }
                }
                _ => {}
            }
        }
        return Err(Error::tls(format!(
            "certificate is not valid for {hostname}"
        )));
    }

    // No SAN extension: legacy fallback to the subject CN.
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok());
    match cn {
        Some(pattern) if hostname_matches(pattern, hostname) => Ok(()),
        _ => Err(Error::tls(format!(
            "certificate is not valid for {hostname}"
        ))),
    }
}

/// DNS name matching with a leftmost-label wildcard, per RFC 6125.
fn hostname_matches(pattern: &str, hostname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let hostname = hostname.trim_end_matches('.');

    if let Some(suffix) = pattern.strip_prefix("*.") {
        match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(hostname)
    }
}

fn ip_matches(san_bytes: &[u8], ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => san_bytes == v4.octets(),
        IpAddr::V6(v6) => san_bytes == v6.octets(),
    }
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Client TLS config presenting the caller-supplied identity and skipping
/// server certificate verification.
pub(crate) fn insecure_client_config(cert_pem: &str, key_pem: &str) -> Result<Arc<ClientConfig>> {
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .map_err(|err| Error::tls(format!("could not read certificate PEM: {err}")))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(Error::tls("no certificate found in PEM"));
    }

    let key = read_private_key(key_pem)?;

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(certs, key)
        .map_err(|err| Error::tls(format!("could not load TLS certificate and key: {err}")))?;
    Ok(Arc::new(config))
}

fn read_private_key(key_pem: &str) -> Result<PrivateKey> {
    let mut reader = key_pem.as_bytes();
    if let Some(key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|err| Error::tls(format!("could not read key PEM: {err}")))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    let mut reader = key_pem.as_bytes();
    if let Some(key) = rustls_pemfile::rsa_private_keys(&mut reader)
        .map_err(|err| Error::tls(format!("could not read key PEM: {err}")))?
        .into_iter()
        .next()
    {
        return Ok(PrivateKey(key));
    }

    Err(Error::tls("no private key found in PEM"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostname_matching_exact_and_wildcard() {
        assert!(hostname_matches("ocapi-app.arlo.com", "ocapi-app.arlo.com"));
        assert!(hostname_matches("OCAPI-APP.ARLO.COM", "ocapi-app.arlo.com"));
        assert!(hostname_matches("*.arlo.com", "ocapi-app.arlo.com"));
        assert!(!hostname_matches("*.arlo.com", "a.b.arlo.com"));
        assert!(!hostname_matches("*.arlo.com", "arlo.com"));
        assert!(!hostname_matches("other.arlo.com", "ocapi-app.arlo.com"));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let err = verify_cert_hostname("not a pem", "example.com").unwrap_err();
        assert!(err.to_string().contains("could not decode cert PEM"));
    }

    #[test]
    fn missing_identity_is_rejected() {
        assert!(insecure_client_config("", "").is_err());
    }
}
