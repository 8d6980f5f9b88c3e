//! End-to-end handshake tests over a real loopback socket.

#![allow(clippy::unwrap_used)]

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use bytes::Bytes;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
};
use sssonector_transport::{Error, Timeouts, TlsMaterial, TlsSettings, connect, listen};

struct TestPki {
    dir: tempfile::TempDir,
    issuer: Issuer<'static, KeyPair>,
}

impl TestPki {
    fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "tunnel test ca");
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.crt"), ca_cert.pem()).unwrap();

        Self {
            dir,
            issuer: Issuer::new(ca_params, ca_key),
        }
    }

    /// Issues a leaf certificate and returns (cert, key, ca) paths.
    fn issue(&self, cn: &str) -> (PathBuf, PathBuf, PathBuf) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_owned()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, cn);
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.signed_by(&key, &self.issuer).unwrap();

        let cert_path = self.dir.path().join(format!("{cn}.crt"));
        let key_path = self.dir.path().join(format!("{cn}.key"));
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();

        (cert_path, key_path, self.dir.path().join("ca.crt"))
    }

    fn material(&self, cn: &str) -> TlsMaterial {
        let (cert, key, ca) = self.issue(cn);

        TlsMaterial::load(&cert, &key, &ca, TlsSettings::default()).unwrap()
    }
}

fn any_loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

#[tokio::test]
async fn mutually_authenticated_session_carries_frames() {
    let pki = TestPki::new();
    let server_material = pki.material("tunnel-server");
    let client_material = pki.material("tunnel-client");

    let listener = listen(any_loopback(), &server_material, 1600, Timeouts::default())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (session, _remote) = listener.accept().await.unwrap();

        assert_eq!(session.peer().common_name, "tunnel-client");

        let (mut reader, mut writer) = session.split();
        let frame = reader.read_frame().await.unwrap();
        writer.write_frame(frame).await.unwrap(); // Echo.
        writer.close().await.unwrap();
    });

    let session = connect(
        &format!("localhost:{port}"),
        &client_material,
        1600,
        Timeouts::default(),
    )
    .await
    .unwrap();

    assert_eq!(session.peer().common_name, "tunnel-server");

    let (mut reader, mut writer) = session.split();
    writer
        .write_frame(Bytes::from_static(b"ping across tls"))
        .await
        .unwrap();

    assert_eq!(reader.read_frame().await.unwrap().as_ref(), b"ping across tls");

    server.await.unwrap();
}

#[tokio::test]
async fn client_from_a_foreign_ca_is_rejected() {
    let pki = TestPki::new();
    let foreign = TestPki::new();

    let server_material = pki.material("tunnel-server");
    let client_material = foreign.material("tunnel-client");

    let listener = listen(any_loopback(), &server_material, 1600, Timeouts::default())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // The handshake must fail; the exact error side varies with timing.
        assert!(listener.accept().await.is_err());
    });

    // The client additionally distrusts the server's CA, but mutual-auth
    // failure surfaces either way.
    let result = connect(
        &format!("localhost:{port}"),
        &client_material,
        1600,
        Timeouts::default(),
    )
    .await;

    assert!(matches!(
        result,
        Err(Error::TlsHandshake(_) | Error::Closed | Error::Io(_))
    ));

    server.await.unwrap();
}

#[tokio::test]
async fn anonymous_client_is_rejected_when_mutual_auth_is_on() {
    let pki = TestPki::new();
    let server_material = pki.material("tunnel-server");

    let (cert, key, ca) = pki.issue("tunnel-client");
    let client_material = TlsMaterial::load(
        &cert,
        &key,
        &ca,
        TlsSettings {
            mutual_auth: false, // Presents no client certificate.
            ..TlsSettings::default()
        },
    )
    .unwrap();

    let listener = listen(any_loopback(), &server_material, 1600, Timeouts::default())
        .await
        .unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        assert!(listener.accept().await.is_err());
    });

    // Depending on TLS version and timing, the client sees the rejection
    // either during the handshake or on its first read.
    match connect(
        &format!("localhost:{port}"),
        &client_material,
        1600,
        Timeouts::default(),
    )
    .await
    {
        Err(_) => {}
        Ok(session) => {
            let (mut reader, _writer) = session.split();

            assert!(reader.read_frame().await.is_err());
        }
    }

    server.await.unwrap();
}
