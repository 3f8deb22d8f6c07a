use clap::Parser;
use groupbuy_engine::application::manager::SessionManager;
use groupbuy_engine::application::settlement::{EscalationQueue, SettlementService};
use groupbuy_engine::application::sweeper::TimeoutSweeper;
use groupbuy_engine::domain::money::Balance;
use groupbuy_engine::domain::ports::{
    SessionStore, SharedClock, SharedNotificationDispatcher, SharedPickupCodeIssuer,
    SharedProductCatalog, SharedSessionStore, SharedWalletLedger,
};
use groupbuy_engine::domain::session::{SessionCode, SessionId};
use groupbuy_engine::infrastructure::in_memory::{
    InMemorySessionStore, InMemoryWallet, ManualClock, SequentialPickupCodes, StaticCatalog,
    TracingDispatcher,
};
use groupbuy_engine::interfaces::csv::command_reader::{Command, CommandOp, CommandReader};
use groupbuy_engine::interfaces::csv::product_reader::ProductReader;
use groupbuy_engine::interfaces::csv::session_writer::{SessionRow, SessionWriter};
use miette::{IntoDiagnostic, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input command CSV file
    input: PathBuf,

    /// Product catalog CSV file
    #[arg(long)]
    products: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[cfg(feature = "storage-rocksdb")]
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let store = open_store(&cli)?;

    let products = ProductReader::new(File::open(&cli.products).into_diagnostic()?)
        .products()
        .collect::<groupbuy_engine::error::Result<Vec<_>>>()
        .into_diagnostic()?;
    let catalog: SharedProductCatalog = Arc::new(StaticCatalog::new(products));

    let wallet = Arc::new(InMemoryWallet::new());
    let wallet_port: SharedWalletLedger = wallet.clone();
    let clock = Arc::new(ManualClock::new(0));
    let clock_port: SharedClock = clock.clone();
    let pickup_codes: SharedPickupCodeIssuer = Arc::new(SequentialPickupCodes::default());
    let notifier: SharedNotificationDispatcher = Arc::new(TracingDispatcher);
    let escalations = EscalationQueue::default();

    let settlement = Arc::new(SettlementService::new(
        store.clone(),
        wallet_port.clone(),
        pickup_codes,
        notifier,
        escalations.clone(),
    ));
    let manager = SessionManager::new(
        store.clone(),
        catalog,
        wallet_port,
        clock_port.clone(),
        settlement.clone(),
        escalations,
    );
    let sweeper = TimeoutSweeper::new(store.clone(), settlement, clock_port);

    // Labels from the input file, in first-seen order, bound to the
    // generated session at create time. Output echoes them back.
    let mut order: Vec<String> = Vec::new();
    let mut sessions: HashMap<String, (SessionId, SessionCode)> = HashMap::new();

    let file = File::open(&cli.input).into_diagnostic()?;
    for command in CommandReader::new(file).commands() {
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                eprintln!("Error reading command: {e}");
                continue;
            }
        };
        clock.set(command.at);
        match apply(&command, &manager, &sweeper, &wallet, &mut order, &mut sessions).await {
            Ok(()) => {}
            Err(e) if e.is_admission_rejection() => eprintln!("Command rejected: {e}"),
            Err(e) => eprintln!("Error processing command: {e}"),
        }
    }

    let mut rows = Vec::with_capacity(order.len());
    for label in &order {
        let (session_id, _) = &sessions[label];
        let state = manager.session_state(*session_id).await.into_diagnostic()?;
        rows.push(SessionRow::from_state(label, &state.session, state.result.as_ref()));
    }

    // Sessions recovered from a persistent store have no label in this
    // input; list them under their shareable code, sorted for determinism.
    let labelled: std::collections::HashSet<SessionId> =
        sessions.values().map(|(id, _)| *id).collect();
    let mut recovered = store.all_sessions().await.into_diagnostic()?;
    recovered.retain(|s| !labelled.contains(&s.id));
    recovered.sort_by(|a, b| a.code.as_str().cmp(b.code.as_str()));
    for session in recovered {
        let state = manager.session_state(session.id).await.into_diagnostic()?;
        rows.push(SessionRow::from_state(
            state.session.code.as_str(),
            &state.session,
            state.result.as_ref(),
        ));
    }

    let stdout = io::stdout();
    let mut writer = SessionWriter::new(stdout.lock());
    writer.write_sessions(rows).into_diagnostic()?;

    Ok(())
}

async fn apply(
    command: &Command,
    manager: &SessionManager,
    sweeper: &TimeoutSweeper,
    wallet: &InMemoryWallet,
    order: &mut Vec<String>,
    sessions: &mut HashMap<String, (SessionId, SessionCode)>,
) -> groupbuy_engine::error::Result<()> {
    use groupbuy_engine::error::EngineError;

    match command.op {
        CommandOp::Fund => {
            wallet
                .fund(command.user()?, Balance::new(command.amount()?))
                .await;
        }
        CommandOp::Create => {
            let label = command.session()?.to_string();
            if sessions.contains_key(&label) {
                return Err(EngineError::Validation(format!(
                    "session label {label} already used"
                )));
            }
            let (session, _) = manager
                .create_session(command.user()?, command.product()?)
                .await?;
            order.push(label.clone());
            sessions.insert(label, (session.id, session.code));
        }
        CommandOp::Join => {
            let label = command.session()?;
            let (_, code) = sessions
                .get(label)
                .ok_or_else(|| EngineError::Validation(format!("unknown session label {label}")))?;
            manager.join_session(command.user()?, code).await?;
        }
        CommandOp::Cancel => {
            let label = command.session()?;
            let (session_id, _) = sessions
                .get(label)
                .ok_or_else(|| EngineError::Validation(format!("unknown session label {label}")))?;
            manager.cancel_session(*session_id).await?;
        }
        CommandOp::Sweep => {
            sweeper.sweep_once().await?;
        }
    }
    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_store(cli: &Cli) -> Result<SharedSessionStore> {
    use groupbuy_engine::infrastructure::rocksdb::RocksDbSessionStore;

    Ok(match &cli.db_path {
        Some(path) => Arc::new(RocksDbSessionStore::open(path).into_diagnostic()?),
        None => Arc::new(InMemorySessionStore::new()),
    })
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_store(_cli: &Cli) -> Result<SharedSessionStore> {
    Ok(Arc::new(InMemorySessionStore::new()))
}
