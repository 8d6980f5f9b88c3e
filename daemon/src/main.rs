//! The tunnel daemon binary.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod certs;
mod pid;
mod run;
mod signals;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;

/// Exit codes for the operator; `systemd` restart rules key off these.
mod exit_code {
    pub const OK: u8 = 0;
    pub const INVALID_CONFIG: u8 = 2;
    pub const RUNTIME: u8 = 3;
    pub const PERMISSION: u8 = 4;
    pub const INTERFACE: u8 = 5;
    /// The peer broke the wire protocol; deliberately distinct from a
    /// clean shutdown and from transient runtime errors.
    pub const CORRUPT: u8 = 6;
}

/// Point-to-point secure tunnel daemon.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (YAML, or JSON with a .json extension).
    #[arg(short, long, env = "SSSONECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Check the configuration and exit without starting the tunnel.
    #[arg(long)]
    validate_config: bool,

    /// Generate a CA plus server and client certificates into DIR, then exit.
    #[arg(long, value_name = "DIR")]
    generate_certs: Option<PathBuf>,

    /// Ask a running instance to reload its configuration, then exit.
    #[arg(long)]
    reload: bool,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() -> ExitCode {
    match try_main() {
        Ok(()) => ExitCode::from(exit_code::OK),
        Err(e) => {
            // Print the chain of errors manually so it doesn't look like a crash.
            eprintln!("{e:#}");

            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn try_main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    if let Some(dir) = &cli.generate_certs {
        let files = certs::generate(dir)?;
        print_generated(dir, &files);

        return Ok(());
    }

    if cli.reload {
        return pid::signal_reload();
    }

    let config_path = cli
        .config
        .context("missing --config PATH (or $SSSONECTOR_CONFIG)")?;

    if cli.validate_config {
        let config = sssonector_config::Config::load(&config_path)?;
        sssonector_tunnel::validate_throttle(&config.throttle, config.network.mtu)?;
        print_config_ok();

        return Ok(());
    }

    run::run(&config_path)
}

#[expect(
    clippy::print_stdout,
    reason = "This command is designed to print to stdout for user interaction."
)]
fn print_generated(dir: &std::path::Path, files: &certs::GeneratedFiles) {
    println!("Generated in {}:", dir.display());
    for name in &files.names {
        println!("  {name}");
    }
    println!("\nCopy ca.crt to both ends; keep the .key files private.");
}

#[expect(
    clippy::print_stdout,
    reason = "This command is designed to print to stdout for user interaction."
)]
fn print_config_ok() {
    println!("Configuration OK");
}

/// Maps the error chain onto the operator-facing exit codes.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    use sssonector_transport::Error as TransportError;
    use sssonector_tun::Error as TunError;
    use sssonector_tunnel::EngineError;

    for cause in err.chain() {
        if cause.downcast_ref::<sssonector_config::Error>().is_some() {
            return exit_code::INVALID_CONFIG;
        }

        if let Some(e) = cause.downcast_ref::<TunError>() {
            return match e {
                TunError::Permission => exit_code::PERMISSION,
                TunError::InUse(_)
                | TunError::Unsupported
                | TunError::InvalidAddress(_)
                | TunError::Closed
                | TunError::TooLarge { .. }
                | TunError::Io(_) => exit_code::INTERFACE,
            };
        }

        if let Some(EngineError::Corrupt(_)) = cause.downcast_ref::<EngineError>() {
            return exit_code::CORRUPT;
        }

        match cause.downcast_ref::<TransportError>() {
            Some(TransportError::Corrupt { .. }) => return exit_code::CORRUPT,
            Some(TransportError::Pem { .. }) => return exit_code::INVALID_CONFIG,
            Some(_) | None => {}
        }
    }

    exit_code::RUNTIME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_the_documented_surface() {
        let cli = Cli::try_parse_from([
            "sssonector",
            "--config",
            "/etc/sssonector/config.yaml",
            "--validate-config",
        ])
        .unwrap();

        assert_eq!(
            cli.config,
            Some(PathBuf::from("/etc/sssonector/config.yaml"))
        );
        assert!(cli.validate_config);
        assert!(!cli.reload);

        let cli = Cli::try_parse_from(["sssonector", "--generate-certs", "/tmp/pki"]).unwrap();
        assert_eq!(cli.generate_certs, Some(PathBuf::from("/tmp/pki")));

        let cli = Cli::try_parse_from(["sssonector", "--reload"]).unwrap();
        assert!(cli.reload);
    }

    #[test]
    fn config_errors_map_to_code_2() {
        let err = anyhow::Error::new(sssonector_config::Error::Invalid {
            field: "network.mtu",
            reason: "too small".to_owned(),
        });

        assert_eq!(exit_code_for(&err), exit_code::INVALID_CONFIG);
    }

    #[test]
    fn tun_permission_maps_to_code_4_other_tun_errors_to_5() {
        let err = anyhow::Error::new(sssonector_tun::Error::Permission);
        assert_eq!(exit_code_for(&err), exit_code::PERMISSION);

        let err = anyhow::Error::new(sssonector_tun::Error::Unsupported);
        assert_eq!(exit_code_for(&err), exit_code::INTERFACE);
    }

    #[test]
    fn corrupt_frames_map_to_their_own_code() {
        let err = anyhow::Error::new(sssonector_tunnel::EngineError::Corrupt(
            sssonector_transport::Error::Corrupt {
                len: 0xffff,
                max: 1628,
            },
        ));

        assert_eq!(exit_code_for(&err), exit_code::CORRUPT);
    }

    #[test]
    fn anything_else_is_a_runtime_error() {
        assert_eq!(exit_code_for(&anyhow!("weird")), exit_code::RUNTIME);
    }

    #[test]
    fn context_does_not_hide_the_code() {
        let err = anyhow::Error::new(sssonector_config::Error::Invalid {
            field: "mode",
            reason: "bogus".to_owned(),
        })
        .context("while starting up");

        assert_eq!(exit_code_for(&err), exit_code::INVALID_CONFIG);
    }
}
