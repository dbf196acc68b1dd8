//! fixture-ca - test certificate authority and integration-test runner

use std::{
    fs,
    path::{Path, PathBuf},
    process,
    time::SystemTime,
};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fixture_ca::{
    authority::config_base,
    compose::{ComposeFile, Runner, SystemExecutor, TestInvocation},
    keys, CertificateAuthority, CertificateRequest, Conf, DistinguishedName, Error, ExtensionSet,
    ReqSettings, Result,
};

/// Mint test TLS certificates from an OpenSSL-style CA configuration and run
/// the containerized integration suite
#[derive(Parser, Debug)]
#[command(name = "fixture-ca", version, about, long_about = None)]
struct Cli {
    /// CA configuration file
    #[arg(
        short,
        long,
        env = "FIXTURE_CA_CONFIG",
        default_value = "fixtures/ca/openssl.cnf"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the CA directory, key and self-signed certificate
    Init {
        /// CA section to use instead of `[ca] default_ca`
        #[arg(long)]
        name: Option<String>,
    },

    /// Generate a key (if missing) and a certificate signing request
    Req(ReqArgs),

    /// Sign a certificate signing request
    Sign(SignArgs),

    /// Render, check or run the integration-test compose file
    #[command(subcommand)]
    Compose(ComposeCommands),
}

#[derive(Parser, Debug)]
struct ReqArgs {
    /// Private key; generated with `default_bits` when the file does not exist.
    /// Defaults to `default_keyfile`.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Subject in oneline form, e.g. `/C=US/CN=localhost`. Defaults to the
    /// configured distinguished name.
    #[arg(long)]
    subject: Option<String>,

    /// Write the request here instead of stdout
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct SignArgs {
    /// Request to sign (PEM)
    #[arg(short, long = "in")]
    input: PathBuf,

    /// Extension section to apply instead of `x509_extensions`, e.g. `v3_ca`
    #[arg(long)]
    extensions: Option<String>,

    /// CA section to use instead of `[ca] default_ca`
    #[arg(long)]
    name: Option<String>,

    /// Also write the certificate here
    #[arg(short, long)]
    out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ComposeCommands {
    /// Print or write the default integration compose file
    Render {
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a compose file satisfies the invocation contract
    Check {
        /// Compose file
        file: PathBuf,
    },

    /// Run the test service of a compose file and exit with its status
    Run {
        /// Compose file
        file: PathBuf,
    },
}

fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init { name } => {
            let conf = Conf::load(&cli.config)?;
            let ca = CertificateAuthority::init(
                &mut rand_core::OsRng,
                &conf,
                name.as_deref(),
                &config_base(&cli.config),
                SystemTime::now(),
            )?;
            println!("{}", ca.settings().certificate.display());
            Ok(0)
        }
        Commands::Req(args) => req(&cli.config, args),
        Commands::Sign(args) => sign(&cli.config, args),
        Commands::Compose(cmd) => compose(cmd),
    }
}

fn req(config: &Path, args: ReqArgs) -> Result<i32> {
    let conf = Conf::load(config)?;
    let base = config_base(config);
    let settings = ReqSettings::from_conf(&conf, &base)?;

    let key_path = args
        .key
        .or(settings.default_keyfile)
        .ok_or_else(|| Error::MissingSetting {
            section: "req".into(),
            key: "default_keyfile".into(),
        })?;
    let key = if key_path.exists() {
        keys::read_private_key(&key_path)?
    } else {
        let key = keys::generate_private_key(&mut rand_core::OsRng, settings.default_bits)?;
        keys::write_private_key(&key_path, &key)?;
        key
    };

    let subject = match args.subject {
        Some(s) => DistinguishedName::parse_oneline(&s)?,
        None => settings.subject,
    };
    let pem = CertificateRequest::generate(&key, &subject)?.to_pem()?;
    emit(args.out.as_deref(), &pem)?;
    Ok(0)
}

fn sign(config: &Path, args: SignArgs) -> Result<i32> {
    let conf = Conf::load(config)?;
    let ca = CertificateAuthority::open(&conf, args.name.as_deref(), &config_base(config))?;

    let pem = fs::read_to_string(&args.input).map_err(|e| Error::Io {
        path: args.input.clone(),
        source: e,
    })?;
    let request = CertificateRequest::from_pem(&pem)?;

    let issued = match args.extensions {
        Some(section) => {
            let set = ExtensionSet::from_section(
                conf.require_section(&section, ("sign", "--extensions"))?,
            )?;
            ca.sign_with(&request, Some(&set), SystemTime::now())?
        }
        None => ca.sign(&request, SystemTime::now())?,
    };

    match args.out {
        Some(out) => emit(Some(&out), &issued.to_pem()?)?,
        None => println!("{}", issued.path.display()),
    }
    Ok(0)
}

fn compose(cmd: ComposeCommands) -> Result<i32> {
    match cmd {
        ComposeCommands::Render { output } => {
            emit(output.as_deref(), &TestInvocation::default().render()?)?;
            Ok(0)
        }
        ComposeCommands::Check { file } => {
            let invocation = TestInvocation::from_compose(&ComposeFile::load(&file)?)?;
            println!("{}: service `{}` ok", file.display(), invocation.service);
            Ok(0)
        }
        ComposeCommands::Run { file } => {
            let invocation = TestInvocation::from_compose(&ComposeFile::load(&file)?)?;
            Runner::new(SystemExecutor, file).run(&invocation)
        }
    }
}

fn emit(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(path) => fs::write(path, text).map_err(|e| Error::Io {
            path: path.to_owned(),
            source: e,
        }),
        None => {
            print!("{text}");
            Ok(())
        }
    }
}
