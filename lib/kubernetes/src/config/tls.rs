use rustls::pki_types::{CertificateDer, PrivateKeyDer};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("identity PEM is invalid: {0}")]
    InvalidIdentityPem(#[source] rustls::pki_types::pem::Error),

    #[error("identity PEM is missing a private key, it must be PKCS8, PKCS1 or SEC1")]
    MissingPrivateKey,

    #[error("identity PEM is missing a certificate")]
    MissingCertificate,

    #[error("unknown section in identity PEM")]
    UnknownSection,
}

/// Split a concatenated identity PEM into the certificate chain and the
/// private key.
pub fn client_identity(
    data: &[u8],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
    use rustls::pki_types::pem::{self, SectionKind};

    let mut chain = Vec::new();
    let mut key = None;
    let mut reader = std::io::Cursor::new(data);
    while let Some((kind, der)) = pem::from_buf(&mut reader).map_err(Error::InvalidIdentityPem)? {
        match kind {
            SectionKind::Certificate => chain.push(der.into()),
            SectionKind::PrivateKey => key = Some(PrivateKeyDer::Pkcs8(der.into())),
            SectionKind::RsaPrivateKey => key = Some(PrivateKeyDer::Pkcs1(der.into())),
            SectionKind::EcPrivateKey => key = Some(PrivateKeyDer::Sec1(der.into())),
            _ => return Err(Error::UnknownSection),
        }
    }

    if chain.is_empty() {
        return Err(Error::MissingCertificate);
    }

    match key {
        Some(key) => Ok((chain, key)),
        None => Err(Error::MissingPrivateKey),
    }
}
