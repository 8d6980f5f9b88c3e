//! Certificate generation for first-time setup.
//!
//! Produces a private CA plus one server and one client certificate, all
//! PEM-encoded. The CA key stays on whatever machine ran this; only the CA
//! certificate needs to travel to both tunnel ends.

use std::fs;
use std::path::Path;

use anyhow::{Context as _, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
};

const CA_COMMON_NAME: &str = "sssonector-ca";

pub(crate) struct GeneratedFiles {
    pub names: Vec<String>,
}

pub(crate) fn generate(dir: &Path) -> Result<GeneratedFiles> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create `{}`", dir.display()))?;

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, CA_COMMON_NAME);

    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut names = Vec::new();
    write_pem(dir, "ca.crt", &ca_cert.pem(), false, &mut names)?;
    write_pem(dir, "ca.key", &ca_key.serialize_pem(), true, &mut names)?;

    let issuer = Issuer::new(ca_params, ca_key);

    for role in ["server", "client"] {
        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(vec!["localhost".to_owned()])?;
        params
            .distinguished_name
            .push(DnType::CommonName, format!("sssonector-{role}"));
        // Both ends authenticate each other, so every leaf gets both usages.
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let cert = params.signed_by(&key, &issuer)?;

        write_pem(dir, &format!("{role}.crt"), &cert.pem(), false, &mut names)?;
        write_pem(
            dir,
            &format!("{role}.key"),
            &key.serialize_pem(),
            true,
            &mut names,
        )?;
    }

    Ok(GeneratedFiles { names })
}

fn write_pem(
    dir: &Path,
    name: &str,
    pem: &str,
    private: bool,
    names: &mut Vec<String>,
) -> Result<()> {
    let path = dir.join(name);

    fs::write(&path, pem).with_context(|| format!("Failed to write `{}`", path.display()))?;

    if private {
        use std::os::unix::fs::PermissionsExt as _;

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict permissions on `{}`", path.display()))?;
    }

    names.push(name.to_owned());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sssonector_transport::{TlsMaterial, TlsSettings};

    #[test]
    fn generated_material_loads_for_both_roles() {
        let dir = tempfile::tempdir().unwrap();

        let files = generate(dir.path()).unwrap();

        assert_eq!(
            files.names,
            vec![
                "ca.crt",
                "ca.key",
                "server.crt",
                "server.key",
                "client.crt",
                "client.key"
            ]
        );

        for role in ["server", "client"] {
            TlsMaterial::load(
                &dir.path().join(format!("{role}.crt")),
                &dir.path().join(format!("{role}.key")),
                &dir.path().join("ca.crt"),
                TlsSettings::default(),
            )
            .expect("generated material must load");
        }
    }

    #[test]
    fn key_files_are_private() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        generate(dir.path()).unwrap();

        let mode = std::fs::metadata(dir.path().join("server.key"))
            .unwrap()
            .permissions()
            .mode();

        assert_eq!(mode & 0o777, 0o600);
    }
}
