//! WolfGuard CLI - exercise the trust layer from a terminal.
//!
//! Every command that touches secrets works against a file store
//! (`--store`, default `.wolfguard/`) encrypted with this machine's
//! device key, so enrolling on one machine and verifying on another fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use wolfguard_core::{
    EncryptionService, ExecutableIdentity, GuardConfig, HostCapabilities, HostDeviceInfo,
    IntrusionDetector, LicenseVerifier, ProcStatusProbe, SecurityOrchestrator, StaticNetwork,
    SystemClock, TerminationHandler, TwoFactorAuthenticator,
};
use wolfguard_keyring::{FileStore, KeyValueStore};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_STORE_DIR: &str = ".wolfguard";
const BUILD_NUMBER: &str = "0";

/// WolfGuard - device-bound encryption, 2FA, intrusion detection and license gating.
#[derive(Parser)]
#[command(name = "wolfguard")]
#[command(version = VERSION)]
#[command(about = "Client-side trust layer: encryption, TOTP, intrusion detection, anti-tamper, licensing")]
#[command(long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Directory of the encrypted store
    #[arg(long)]
    store: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the current TOTP code for a Base32 secret
    Totp {
        /// Base32 secret
        secret: String,

        /// Unix time to compute the code for (default: now)
        #[arg(long)]
        at: Option<i64>,
    },

    /// Enable 2FA for a user and print the provisioning URI and recovery codes
    Enroll {
        /// User id
        user: String,
    },

    /// Verify a TOTP code (or a recovery code with --recovery)
    VerifyTotp {
        /// User id
        user: String,

        /// Six-digit code
        code: String,

        /// Treat the code as a recovery code
        #[arg(long)]
        recovery: bool,
    },

    /// Check input for SQL, XSS or command injection
    Scan {
        /// Input to scan
        input: String,
    },

    /// Encrypt text with the device key
    Encrypt {
        /// Plaintext
        text: String,

        /// Salt (default: configured default salt)
        #[arg(long)]
        salt: Option<String>,
    },

    /// Decrypt text produced by `encrypt`
    Decrypt {
        /// Ciphertext
        ciphertext: String,

        /// Salt used for encryption
        #[arg(long)]
        salt: Option<String>,
    },

    /// Initialize every service and run the security check
    Check,

    /// Verify a license key
    License {
        /// License key
        key: String,

        /// Skip the cached record and ask the backend
        #[arg(long)]
        force_online: bool,
    },
}

/// Termination handler for a one-shot CLI: report, never exit mid-output.
struct ReportOnly;

impl TerminationHandler for ReportOnly {
    fn terminate(&self, reason: &str) {
        tracing::error!(reason = %reason, "termination requested");
    }
}

fn init_logging(verbose: bool, json_output: bool) {
    // JSON mode keeps stdout clean for the document.
    let default_level = if json_output {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json_output {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GuardConfig> {
    match path {
        Some(p) => GuardConfig::from_json_file(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(GuardConfig::default()),
    }
}

async fn open_store(cli_dir: Option<&PathBuf>, config: &GuardConfig) -> Result<Arc<dyn KeyValueStore>> {
    let dir = cli_dir
        .cloned()
        .or_else(|| config.storage_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_DIR));
    let store = FileStore::open(&dir)
        .await
        .with_context(|| format!("opening store at {}", dir.display()))?;
    Ok(Arc::new(store))
}

fn device_info() -> Arc<HostDeviceInfo> {
    Arc::new(HostDeviceInfo::new(VERSION, BUILD_NUMBER))
}

async fn encryption(store: Arc<dyn KeyValueStore>, config: &GuardConfig) -> Result<Arc<EncryptionService>> {
    let svc = EncryptionService::new(store, device_info(), config);
    svc.initialize().await?;
    if svc.is_fallback_key() {
        tracing::warn!("no machine id found, using the fallback key");
    }
    Ok(Arc::new(svc))
}

fn emit(json_output: bool, value: serde_json::Value, text: impl FnOnce()) -> Result<()> {
    if json_output {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        text();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_output = cli.format == "json";
    init_logging(cli.verbose, json_output);

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Totp { secret, at } => {
            let at = at.unwrap_or_else(|| chrono::Utc::now().timestamp());
            let code = wolfguard_crypto::totp_base32(&secret, at, &Default::default())
                .context("invalid Base32 secret")?;
            emit(json_output, json!({ "code": code, "at": at }), || println!("{code}"))?;
        },

        Commands::Enroll { user } => {
            let store = open_store(cli.store.as_ref(), &config).await?;
            let tfa = TwoFactorAuthenticator::new(encryption(store, &config).await?, Arc::new(SystemClock), &config);
            tfa.initialize().await?;
            let enrollment = tfa.enable_2fa(&user).await?;
            let codes = tfa.generate_recovery_codes(&user, None).await?;
            emit(
                json_output,
                json!({
                    "user": user,
                    "secret": enrollment.secret,
                    "provisioningUri": enrollment.provisioning_uri,
                    "recoveryCodes": codes,
                }),
                || {
                    println!("2FA enabled for {user}");
                    println!("  Secret:  {}", enrollment.secret);
                    println!("  URI:     {}", enrollment.provisioning_uri);
                    println!("  Recovery codes (each works once):");
                    for code in &codes {
                        println!("    {code}");
                    }
                },
            )?;
        },

        Commands::VerifyTotp { user, code, recovery } => {
            let store = open_store(cli.store.as_ref(), &config).await?;
            let tfa = TwoFactorAuthenticator::new(encryption(store, &config).await?, Arc::new(SystemClock), &config);
            tfa.initialize().await?;
            let valid = if recovery {
                tfa.verify_recovery_code(&user, &code).await?
            } else {
                tfa.verify_totp(&user, &code).await?
            };
            emit(json_output, json!({ "user": user, "valid": valid }), || {
                println!("{}", if valid { "valid" } else { "invalid" });
            })?;
            if !valid {
                std::process::exit(1);
            }
        },

        Commands::Scan { input } => {
            let category = IntrusionDetector::classify_injection(&input);
            emit(
                json_output,
                json!({ "suspicious": category.is_some(), "category": category.map(|c| c.as_str()) }),
                || match category {
                    Some(c) => println!("suspicious: {} injection", c.as_str()),
                    None => println!("clean"),
                },
            )?;
        },

        Commands::Encrypt { text, salt } => {
            let store = open_store(cli.store.as_ref(), &config).await?;
            let enc = encryption(store, &config).await?;
            let sealed = enc.encrypt(&text, salt.as_deref())?;
            emit(json_output, json!({ "ciphertext": sealed }), || println!("{sealed}"))?;
        },

        Commands::Decrypt { ciphertext, salt } => {
            let store = open_store(cli.store.as_ref(), &config).await?;
            let enc = encryption(store, &config).await?;
            let plain = enc
                .decrypt(&ciphertext, salt.as_deref())
                .context("decryption failed (wrong device, salt or corrupted input)")?;
            emit(json_output, json!({ "plaintext": plain }), || println!("{plain}"))?;
        },

        Commands::Check => {
            let store = open_store(cli.store.as_ref(), &config).await?;
            let app_version = format!("{VERSION} ({BUILD_NUMBER})");
            let host = HostCapabilities::new(
                store,
                device_info(),
                Arc::new(ExecutableIdentity::new(config.app_package.clone(), app_version)),
            )
            .with_probe(Arc::new(ProcStatusProbe))
            .with_terminator(Arc::new(ReportOnly));

            let guard = SecurityOrchestrator::new(config, host)?;
            let status = guard.initialize().await?;
            guard.stop_services();

            emit(json_output, serde_json::to_value(&status)?, || {
                println!("\nSECURITY CHECK");
                println!("==============\n");
                for result in &status.tamper.results {
                    println!("  {:<14} {:?}", result.check.as_str(), result.outcome);
                }
                match &status.license {
                    Some(v) => println!("  {:<14} {} ({:?})", "license", v.message, v.source),
                    None => println!("  {:<14} no license stored", "license"),
                }
                println!("\n  Result: {}", if status.passed() { "PASSED" } else { "FAILED" });
            })?;
            if !status.passed() {
                std::process::exit(wolfguard_core::host::VIOLATION_EXIT_CODE);
            }
        },

        Commands::License { key, force_online } => {
            let store = open_store(cli.store.as_ref(), &config).await?;
            let enc = encryption(store, &config).await?;
            let transport = Arc::new(wolfguard_core::HttpsLicenseClient::new(
                &config.license_endpoint,
                config.request_timeout,
            )?);
            let verifier = LicenseVerifier::new(
                enc,
                transport,
                Arc::new(StaticNetwork::new(true)),
                device_info(),
                Arc::new(SystemClock),
                &config,
            );
            verifier.initialize().await?;
            let verdict = verifier.verify_license(&key, force_online).await?;
            emit(json_output, serde_json::to_value(&verdict)?, || {
                println!("{} ({:?}): {}", if verdict.is_valid { "VALID" } else { "INVALID" }, verdict.source, verdict.message);
            })?;
            if !verdict.is_valid {
                bail!("license rejected");
            }
        },
    }

    Ok(())
}
