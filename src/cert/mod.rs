//! On-demand factory for the ephemeral identity presented by the TLS
//! server side.
//!
//! The peer never validates the chain, so the leaf exists only to
//! satisfy the TLS machinery; a fresh keypair and certificate are
//! generated for every session.

use rand_core::{OsRng, RngCore};
use rcgen::{
    BasicConstraints,
    CertificateParams,
    DistinguishedName,
    DnType,
    ExtendedKeyUsagePurpose,
    IsCa,
    KeyPair,
    KeyUsagePurpose,
    SerialNumber,
    PKCS_ED25519,
};
use time::{Duration, OffsetDateTime};

use crate::error::*;

/// Name embedded in the subject and SAN of every generated leaf.
const NAME: &str = "tete";

/// How long a generated leaf stays valid.
const VALIDITY: Duration = Duration::days(7);

/// A self-signed leaf and the key that signed it.
pub struct Identity {
    /// DER encoded certificate.
    pub der: Vec<u8>,
    /// PKCS#8 DER encoded Ed25519 private key.
    pub key_der: Vec<u8>,
}

/// Generates a fresh Ed25519 keypair and a matching self-signed leaf.
///
/// The certificate carries a 128 bit random serial, a digital
/// signature key usage, a server auth extended key usage, and is valid
/// for seven days from the moment of creation.
pub fn generate() -> Result<Identity> {
    let key_pair = KeyPair::generate_for(&PKCS_ED25519).wrapped(ErrorKind::Certificate)?;

    let mut serial = [0; 16];
    OsRng.fill_bytes(&mut serial[..]);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, NAME);

    let not_before = OffsetDateTime::now_utc();

    let mut params = CertificateParams::new(vec![NAME.into()]).wrapped(ErrorKind::Certificate)?;
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&serial[..]));
    params.not_before = not_before;
    params.not_after = not_before + VALIDITY;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);

    let cert = params.self_signed(&key_pair).wrapped(ErrorKind::Certificate)?;

    Ok(Identity {
        der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_parses_as_an_end_entity_cert() {
        let identity = generate().unwrap();
        webpki::EndEntityCert::from(&identity.der[..]).unwrap();
    }

    #[test]
    fn every_call_mints_a_fresh_identity() {
        let a = generate().unwrap();
        let b = generate().unwrap();
        assert_ne!(a.der, b.der);
        assert_ne!(a.key_der, b.key_der);
    }

    #[test]
    fn rustls_accepts_the_identity_as_a_server_cert() {
        let identity = generate().unwrap();
        let mut config = rustls::ServerConfig::new(rustls::NoClientAuth::new());
        config
            .set_single_cert(
                vec![rustls::Certificate(identity.der)],
                rustls::PrivateKey(identity.key_der),
            )
            .unwrap();
    }
}
