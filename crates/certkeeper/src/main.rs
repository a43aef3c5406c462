//! certkeeper: keep a state directory of ACME certificates reconciled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use certkeeper::acme::client::HttpAcmeClient;
use certkeeper::crypto;
use certkeeper::notify::LogNotifier;
use certkeeper::responder;
use certkeeper::solver::SolverConfig;
use certkeeper::storage::{Store, Target, RECOMMENDED_PATH};

#[derive(Parser)]
#[command(
    name = "certkeeper",
    about = "Declarative ACME certificate store: keeps live/ pointed at fresh certificates for the hostnames you want",
    version
)]
struct Cli {
    /// State directory
    #[arg(long, default_value = RECOMMENDED_PATH, global = true)]
    state: PathBuf,

    /// Additional webroot paths to install http-01 challenges into
    #[arg(long, global = true)]
    webroot: Vec<String>,

    /// Listen addresses for the http-01 responder (bare port or address)
    #[arg(long, global = true)]
    listen: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Obtain, renew and relink certificates until every target is covered
    Reconcile,
    /// Show the active configuration and per-target certificate status
    Status,
    /// Add a target covering the given hostnames
    Want {
        #[arg(required = true)]
        hostnames: Vec<String>,
        /// Provider directory URL for this target
        #[arg(long)]
        provider: Option<String>,
        /// Priority used when targets overlap (higher wins)
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Remove a hostname from every target
    Unwant { hostname: String },
    /// Import a PEM private key into the key store
    ImportKey { file: PathBuf },
    /// Record a certificate URL; the body downloads on the next reconcile
    ImportCert { url: String },
    /// Import an account private key for a provider
    ImportAccountKey { provider_url: String, file: PathBuf },
    /// Set the webroot paths http-01 challenges are installed into
    SetWebroot {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Set the preferred size for newly generated RSA keys
    SetRsaKeySize { bits: u32 },
    /// Print the JWK thumbprint of every account key
    AccountThumbprint,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let mut store = Store::open(&cli.state, Arc::new(LogNotifier))?;

    match cli.command {
        Commands::Reconcile => {
            responder::register_builtin();
            let acme = HttpAcmeClient::new()?;

            let mut web_paths = store.webroot_paths().to_vec();
            web_paths.extend(cli.webroot.iter().cloned());
            let solver_cfg = SolverConfig {
                web_paths,
                http_ports: cli.listen.clone(),
                prior_key: Some(store.prior_key_lookup()),
                self_test: true,
            };

            store.reconcile(&acme, &solver_cfg).await?;
        }

        Commands::Status => print!("{}", store.status()),

        Commands::Want {
            hostnames,
            provider,
            priority,
        } => {
            let mut target = Target::default();
            target.satisfy.names = hostnames;
            target.request.provider = provider;
            target.priority = priority;
            store.add_target(target)?;
        }

        Commands::Unwant { hostname } => store.remove_target_hostname(&hostname)?,

        Commands::ImportKey { file } => {
            let pem = std::fs::read(&file).with_context(|| format!("read {:?}", file))?;
            store.import_key(&pem)?;
        }

        Commands::ImportCert { url } => store.import_certificate(&url)?,

        Commands::ImportAccountKey { provider_url, file } => {
            let pem = std::fs::read(&file).with_context(|| format!("read {:?}", file))?;
            store.import_account_key(&provider_url, &pem)?;
        }

        Commands::SetWebroot { paths } => store.set_webroot_paths(paths)?,

        Commands::SetRsaKeySize { bits } => store.set_preferred_rsa_key_size(bits)?,

        Commands::AccountThumbprint => {
            for account in store.accounts() {
                println!(
                    "{} {}",
                    crypto::jwk_thumbprint(&account.private_key)?,
                    account.id
                );
            }
        }
    }

    Ok(())
}
