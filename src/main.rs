//! trustgate - gateway and backend joined by a mutual-TLS chain of trust

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use trustgate::{
    cli::{Cli, Command, TlsCommand},
    config::Config,
    pki::{AltNames, CA_PAIR_NAME, CertStore, KeyRole, PairPaths},
    setup_tracing, startup,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = cli.store_dir {
        config.store.dir = dir;
    }

    match cli.command {
        Command::Gateway {
            send_proxy_request,
            bind,
        } => {
            if let Some(addr) = bind {
                config.gateway.bind = addr;
            }
            run_service(startup::gateway(&config, send_proxy_request)).await
        }
        Command::Backend {
            receive_proxy_request,
            bind,
        } => {
            if let Some(addr) = bind {
                config.backend.bind = addr;
            }
            run_service(startup::backend(&config, receive_proxy_request)).await
        }
        Command::Tls(cmd) => run_tls_command(&config, cmd),
    }
}

/// Serve an initialised service; any startup failure is fatal
async fn run_service(service: trustgate::Result<startup::Service>) -> ExitCode {
    let service = match service {
        Ok(s) => s,
        Err(e) => {
            error!("Startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let name = service.name();
    info!(
        service = name,
        addr = %service.bind_addr(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting"
    );

    match service.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(service = name, "Server error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run certificate store commands
fn run_tls_command(config: &Config, cmd: TlsCommand) -> ExitCode {
    let mut store = match CertStore::new(&config.store.dir, config.pki) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ Failed to open certificate store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cmd {
        TlsCommand::InitCa { name } => match store.init_ca(&name) {
            Ok(_) => {
                println!("✅ CA '{name}' ready: {}", store.cert_file(CA_PAIR_NAME).display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ {e}");
                ExitCode::FAILURE
            }
        },
        TlsCommand::Issue {
            ca,
            role,
            dns_names,
            ip_addresses,
            name,
        } => {
            let alt_names = AltNames {
                ip_addresses,
                dns_names,
            };
            let issued = issue_pair(&mut store, &ca, role, &alt_names, &name);
            match issued {
                Ok(paths) => {
                    println!("✅ Issued {role} pair '{name}' from CA '{ca}'");
                    println!("   Certificate: {}", paths.cert.display());
                    println!("   Key:         {}", paths.key.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ {e}");
                    ExitCode::FAILURE
                }
            }
        }
        TlsCommand::Show { name } => match store.load_ca(&name) {
            Ok(ca) => {
                print!("{}", ca.cert_pem());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn issue_pair(
    store: &mut CertStore,
    ca: &str,
    role: KeyRole,
    alt_names: &AltNames,
    name: &str,
) -> trustgate::Result<PairPaths> {
    store.load_ca(ca)?;
    let pair = match role {
        KeyRole::Server => store.new_server_cert_pair(alt_names)?,
        KeyRole::Client => store.new_client_cert_pair(alt_names)?,
    };
    store.write_pair(name, &pair)
}
