use anyhow::{anyhow, Context, Result};
use bletab::domain::models::{
    ChainKind, CredentialPair, PeripheralIdentity, SessionMode, SessionState,
};
use bletab::domain::settings::SettingsService;
use bletab::domain::store::SessionStore;
use bletab::infrastructure::bluetooth::service::spawn_btleplug_service;
use bletab::infrastructure::bluetooth::{
    AppEvent, BleError, BluetoothCommand, MessageSeverity, ServiceHandle, StatusMessage,
};
use bletab::infrastructure::logging;
use bletab::infrastructure::lookup::PatientApiClient;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "bletab")]
#[command(about = "Provision tab peripherals over Bluetooth LE", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nearby tabs
    Scan {
        /// Scan length in seconds (defaults to the configured duration)
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// Subscribe to a tab and print values as it pushes them
    Watch {
        /// Peripheral address (defaults to the last connected tab)
        address: Option<String>,
    },
    /// Read both values from a tab
    Read { address: Option<String> },
    /// Write both values to a tab
    Write {
        address: Option<String>,
        #[arg(long)]
        admin_key: String,
        #[arg(long)]
        search_text: String,
    },
    /// Show the stored values
    Show,
    /// Look up patients with the stored values
    Lookup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings_service = SettingsService::new().context("Failed to load settings")?;
    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    let store = Arc::new(SessionStore::open_default().context("Failed to open session store")?);

    match cli.command {
        Commands::Scan { duration } => {
            let duration = duration
                .map(Duration::from_secs)
                .unwrap_or_else(|| settings_service.get().scan_duration());
            cmd_scan(&settings_service, store, duration).await
        }
        Commands::Watch { address } => {
            let target = resolve_target(&settings_service, address)?;
            cmd_watch(&mut settings_service, store, target).await
        }
        Commands::Read { address } => {
            let target = resolve_target(&settings_service, address)?;
            cmd_read(&mut settings_service, store, target).await
        }
        Commands::Write {
            address,
            admin_key,
            search_text,
        } => {
            let target = resolve_target(&settings_service, address)?;
            cmd_write(&mut settings_service, store, target, admin_key, search_text).await
        }
        Commands::Show => {
            print_pair(&store.get());
            Ok(())
        }
        Commands::Lookup => cmd_lookup(&settings_service, &store).await,
    }
}

fn resolve_target(settings: &SettingsService, address: Option<String>) -> Result<PeripheralIdentity> {
    let address = address
        .or_else(|| settings.get().last_connected_address.clone())
        .ok_or_else(|| anyhow!("No address given and no tab connected before"))?;
    Ok(PeripheralIdentity {
        display_name: "Tab".to_string(),
        address,
    })
}

async fn cmd_scan(
    settings: &SettingsService,
    store: Arc<SessionStore>,
    duration: Duration,
) -> Result<()> {
    let mut service = spawn_btleplug_service(store, settings.get().scan_duration()).await?;
    service.send(BluetoothCommand::StartScan {
        duration: Some(duration),
    });

    let mut count = 0;
    let outcome = loop {
        match service.events.recv().await {
            Some(AppEvent::DeviceFound(identity)) => {
                count += 1;
                println!("{}", identity);
            }
            Some(AppEvent::ScanFinished) | None => break Ok(()),
            Some(AppEvent::OperationFailed(e)) => break Err(e),
            Some(AppEvent::LogMessage(status)) => print_status(&status),
            Some(_) => {}
        }
    };
    service.shutdown().await;
    outcome?;

    if count == 0 {
        println!("No tabs found");
    }
    Ok(())
}

async fn cmd_watch(
    settings: &mut SettingsService,
    store: Arc<SessionStore>,
    target: PeripheralIdentity,
) -> Result<()> {
    let mut service = connect(store, settings, &target, SessionMode::Subscribe).await?;
    println!("Watching {} (Ctrl-C to stop)", target.address);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let outcome = loop {
        tokio::select! {
            _ = &mut ctrl_c => break Ok(()),
            event = service.events.recv() => match event {
                Some(AppEvent::CredentialsUpdated(pair)) => print_pair(&pair),
                Some(AppEvent::OperationFailed(e)) if is_fatal(&e) => break Err(e),
                Some(AppEvent::OperationFailed(e)) => warn!("{}", e),
                Some(AppEvent::LogMessage(status)) => print_status(&status),
                Some(AppEvent::SessionState(SessionState::Idle)) | None => {
                    break Err(BleError::LinkLost)
                }
                Some(_) => {}
            },
        }
    };

    service.send(BluetoothCommand::Disconnect);
    service.shutdown().await;
    Ok(outcome?)
}

async fn cmd_read(
    settings: &mut SettingsService,
    store: Arc<SessionStore>,
    target: PeripheralIdentity,
) -> Result<()> {
    // Edit mode reads both values back right after discovery.
    let mut service = connect(store, settings, &target, SessionMode::Edit).await?;
    let outcome = wait_for_chain(&mut service, ChainKind::ReadAll).await;
    service.shutdown().await;

    print_pair(&outcome?);
    Ok(())
}

async fn cmd_write(
    settings: &mut SettingsService,
    store: Arc<SessionStore>,
    target: PeripheralIdentity,
    admin_key: String,
    search_text: String,
) -> Result<()> {
    let mut service = connect(store, settings, &target, SessionMode::Edit).await?;

    let outcome = async {
        match wait_for_chain(&mut service, ChainKind::ReadAll).await {
            Ok(current) => print_pair(&current),
            // A failed read-back leaves the session usable.
            Err(e) if !is_fatal(&e) => warn!("Could not read current values: {}", e),
            Err(e) => return Err(e),
        }
        service.send(BluetoothCommand::WriteAll {
            admin_key,
            search_text,
        });
        wait_for_chain(&mut service, ChainKind::WriteAll).await
    }
    .await;
    service.shutdown().await;

    let written = outcome?;
    println!("Values saved successfully");
    print_pair(&written);
    Ok(())
}

async fn cmd_lookup(settings: &SettingsService, store: &SessionStore) -> Result<()> {
    let credentials = store.get();
    let client = PatientApiClient::from_settings(settings.get())?;
    let patients = client.fetch_patients(&credentials).await?;

    if patients.is_empty() {
        println!("No patients found");
    }
    for patient in patients {
        println!(
            "{}  {}  {} / {}  age {}  {}",
            patient.patient_id,
            patient.name,
            patient.ipd_number,
            patient.opd_number,
            patient.age,
            patient.contact_number
        );
    }
    Ok(())
}

/// Start the service and bring a session up to the point where `mode` takes over.
async fn connect(
    store: Arc<SessionStore>,
    settings: &mut SettingsService,
    target: &PeripheralIdentity,
    mode: SessionMode,
) -> Result<ServiceHandle> {
    let mut service = spawn_btleplug_service(store, settings.get().scan_duration()).await?;
    service.send(BluetoothCommand::Connect {
        identity: target.clone(),
        mode,
    });

    let outcome = loop {
        match service.events.recv().await {
            Some(AppEvent::SessionState(SessionState::DiscoveringServices)) => break Ok(()),
            Some(AppEvent::OperationFailed(e)) => break Err(e),
            Some(AppEvent::LogMessage(status)) => print_status(&status),
            Some(_) => {}
            None => break Err(BleError::LinkLost),
        }
    };
    if let Err(e) = outcome {
        service.shutdown().await;
        return Err(e.into());
    }

    info!("Connected to {}", target);
    if let Err(e) = settings.remember_address(&target.address) {
        warn!("Failed to remember address: {:#}", e);
    }
    Ok(service)
}

/// Wait for `chain` to finish and return the values seen along the way.
async fn wait_for_chain(
    service: &mut ServiceHandle,
    chain: ChainKind,
) -> Result<CredentialPair, BleError> {
    let mut latest = CredentialPair::default();
    loop {
        match service.events.recv().await {
            Some(AppEvent::CredentialsUpdated(pair)) => latest = pair,
            Some(AppEvent::ChainCompleted(done)) if done == chain => return Ok(latest),
            Some(AppEvent::OperationFailed(e)) => return Err(e),
            Some(AppEvent::LogMessage(status)) => print_status(&status),
            Some(_) => {}
            None => return Err(BleError::LinkLost),
        }
    }
}

/// Failures that end the session rather than one chain.
fn is_fatal(error: &BleError) -> bool {
    error.field().is_none()
}

fn print_pair(pair: &CredentialPair) {
    println!("Admin Key:   {}", pair.admin_key.as_deref().unwrap_or("-"));
    println!("Search Text: {}", pair.search_text.as_deref().unwrap_or("-"));
}

fn print_status(status: &StatusMessage) {
    match status.severity {
        MessageSeverity::Info => eprintln!("{}", status.message),
        MessageSeverity::Success => eprintln!("ok: {}", status.message),
        MessageSeverity::Warning => eprintln!("warning: {}", status.message),
        MessageSeverity::Error => eprintln!("error: {}", status.message),
    }
}
