use anyhow::Context;
use api_shared::auth::DEFAULT_TOKEN_TTL_SECS;
use api_shared::TokenKeys;
use clap::{Parser, Subcommand};
use emr_core::repositories::patients::{NewPatient, PatientService};
use emr_core::{db, spawn_writer, AccountService, AuditLog, CoreConfig, Role, Store};
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "emr")]
#[command(about = "EMR clinical records operator CLI")]
struct Cli {
    /// SQLite database URL
    #[arg(long, env = "EMR_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Register a staff user
    CreateUser {
        username: String,
        full_name: String,
        /// admin, physician, front_desk or nurse
        role: String,
    },
    /// Open a new session for a user and print a bearer token for it
    ///
    /// Any token issued earlier for the same user stops working.
    IssueToken {
        username: String,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_SECS)]
        ttl: i64,
        #[arg(long, env = "EMR_JWT_SECRET", hide_env_values = true)]
        secret: String,
    },
    /// Register a patient
    CreatePatient {
        /// Eight-digit national ID
        dni: String,
        first_names: String,
        paternal_surname: String,
        /// Date of birth (YYYY-MM-DD)
        birth_date: String,
        /// M or F
        sex: String,
        #[arg(long)]
        maternal_surname: Option<String>,
        /// Username recorded as the author of the change
        #[arg(long = "as")]
        actor: String,
    },
    /// Search patients by name or national-ID prefix
    List {
        query: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("emr_core=warn".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        println!("No command given. Use --help for usage.");
        return Ok(());
    };

    let cfg = CoreConfig::from_env_values(
        cli.database_url,
        std::env::var("EMR_DB_MAX_CONNECTIONS").ok(),
    )?;
    let pool = db::connect(&cfg).await.context("failed to open database")?;
    if let Commands::Migrate = command {
        db::migrate(&pool).await?;
        println!("Database is up to date: {}", cfg.database_url());
        return Ok(());
    }

    let (audit, receiver) = AuditLog::channel();
    let writer = spawn_writer(pool.clone(), receiver);
    let store = Store::new(pool, audit);
    let outcome = run(command, &store).await;

    drop(store);
    writer.await.context("audit writer stopped unexpectedly")?;
    outcome
}

async fn run(command: Commands, store: &Store) -> anyhow::Result<()> {
    let accounts = AccountService::new(store.clone());
    match command {
        Commands::Migrate => {}
        Commands::CreateUser {
            username,
            full_name,
            role,
        } => {
            let role = Role::from_str(&role)?;
            let user = accounts.create_user(&username, &full_name, role).await?;
            println!("Created user {} ({}) with ID: {}", user.username, user.role, user.id);
        }
        Commands::IssueToken {
            username,
            ttl,
            secret,
        } => {
            let keys = TokenKeys::from_secret(&secret)?;
            let user = accounts
                .find_by_username(&username)
                .await?
                .with_context(|| format!("no user named '{username}'"))?;
            let session = accounts.open_session(user.id).await?;
            let sid = session
                .session_id
                .context("session was not recorded")?;
            println!("{}", keys.issue(user.id, session.role.as_str(), &sid, ttl)?);
        }
        Commands::CreatePatient {
            dni,
            first_names,
            paternal_surname,
            birth_date,
            sex,
            maternal_surname,
            actor,
        } => {
            let actor = accounts
                .find_by_username(&actor)
                .await?
                .with_context(|| format!("no user named '{actor}'"))?;
            let input = NewPatient {
                national_id: dni,
                first_names,
                paternal_surname,
                maternal_surname,
                birth_date,
                sex,
                ..NewPatient::default()
            };
            let patient = PatientService::new(store.clone())
                .create(actor.id, input)
                .await?;
            println!(
                "Registered {} (DNI {}) with ID: {}",
                patient.full_name(),
                patient.national_id,
                patient.id
            );
        }
        Commands::List { query } => {
            let patients = PatientService::new(store.clone())
                .search(query.as_deref())
                .await?;
            if patients.is_empty() {
                println!("No patients found.");
            } else {
                for patient in patients {
                    println!(
                        "ID: {}, DNI: {}, Name: {}, Age: {}",
                        patient.id,
                        patient.national_id,
                        patient.full_name(),
                        patient.age
                    );
                }
            }
        }
    }
    Ok(())
}
