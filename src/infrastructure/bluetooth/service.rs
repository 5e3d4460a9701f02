//! Bluetooth Service Module
//!
//! Main service that owns the scanner and the GATT session and applies
//! commands and link events one at a time.

use crate::domain::models::{PeripheralIdentity, SessionMode};
use crate::domain::store::SessionStore;
use crate::infrastructure::bluetooth::btleplug_backend::{
    default_adapter, BtleplugLink, BtleplugScanBackend,
};
use crate::infrastructure::bluetooth::error::BleError;
use crate::infrastructure::bluetooth::events::{AppEvent, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::link::{GattLink, LinkEvent};
use crate::infrastructure::bluetooth::scanner::{PeripheralScanner, ScanBackend, ScanRun};
use crate::infrastructure::bluetooth::session::GattSession;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub enum BluetoothCommand {
    StartScan { duration: Option<Duration> },
    StopScan,
    Connect {
        identity: PeripheralIdentity,
        mode: SessionMode,
    },
    ReadAll,
    WriteAll {
        admin_key: String,
        search_text: String,
    },
    Disconnect,
    Shutdown,
}

/// Main Bluetooth service coordinating all BLE operations
pub struct BluetoothService<L: GattLink, B: ScanBackend> {
    session: GattSession<L>,
    scanner: PeripheralScanner<B>,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    scan_duration: Duration,
    scan_run: Option<ScanRun>,
}

impl<L: GattLink, B: ScanBackend> BluetoothService<L, B> {
    pub fn new(
        link: L,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        scan_backend: B,
        store: Arc<SessionStore>,
        event_sender: mpsc::UnboundedSender<AppEvent>,
        scan_duration: Duration,
    ) -> Self {
        Self {
            session: GattSession::new(link, store, event_sender.clone()),
            scanner: PeripheralScanner::new(scan_backend),
            link_events,
            event_sender,
            scan_duration,
            scan_run: None,
        }
    }

    pub fn session(&self) -> &GattSession<L> {
        &self.session
    }

    /// Process commands until `Shutdown` or until every command sender is gone.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<BluetoothCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(BluetoothCommand::Shutdown) => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.link_events.recv() => {
                    self.session.handle_link_event(event);
                }
                item = next_scan_item(&mut self.scan_run) => match item {
                    Some(Ok(identity)) => {
                        let _ = self.event_sender.send(AppEvent::DeviceFound(identity));
                    }
                    Some(Err(e)) => self.report(e),
                    None => {
                        self.scan_run = None;
                        self.send_log("Scan Completed", MessageSeverity::Info);
                        let _ = self.event_sender.send(AppEvent::ScanFinished);
                    }
                },
            }
        }

        info!("Bluetooth service shutting down");
        self.scanner.stop().await;
        self.session.shutdown().await;
    }

    async fn handle_command(&mut self, command: BluetoothCommand) {
        match command {
            BluetoothCommand::StartScan { duration } => {
                let duration = duration.unwrap_or(self.scan_duration);
                match self.scanner.start(duration).await {
                    Ok(run) => {
                        self.scan_run = Some(run);
                        self.send_log("Scanning...", MessageSeverity::Info);
                    }
                    Err(e) => self.report(e),
                }
            }
            BluetoothCommand::StopScan => self.scanner.stop().await,
            BluetoothCommand::Connect { identity, mode } => {
                // Scanning and connecting share the radio.
                self.scanner.stop().await;
                if let Err(e) = self.session.connect(identity, mode) {
                    self.report(e);
                }
            }
            BluetoothCommand::ReadAll => {
                if let Err(e) = self.session.read_all() {
                    self.report(e);
                }
            }
            BluetoothCommand::WriteAll {
                admin_key,
                search_text,
            } => {
                if let Err(e) = self.session.write_all(&admin_key, &search_text) {
                    self.report(e);
                }
            }
            BluetoothCommand::Disconnect => self.session.disconnect(),
            BluetoothCommand::Shutdown => {}
        }
    }

    fn report(&self, error: BleError) {
        error!("{}", error);
        self.send_log(&error.to_string(), MessageSeverity::Error);
        let _ = self.event_sender.send(AppEvent::OperationFailed(error));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

async fn next_scan_item(run: &mut Option<ScanRun>) -> Option<Result<PeripheralIdentity, BleError>> {
    match run {
        Some(run) => run.next().await,
        None => std::future::pending().await,
    }
}

/// Channels for talking to a running service.
pub struct ServiceHandle {
    pub commands: mpsc::UnboundedSender<BluetoothCommand>,
    pub events: mpsc::UnboundedReceiver<AppEvent>,
    pub task: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn send(&self, command: BluetoothCommand) {
        let _ = self.commands.send(command);
    }

    /// Ask the service to stop and wait for it to release the radio.
    pub async fn shutdown(self) {
        let _ = self.commands.send(BluetoothCommand::Shutdown);
        let _ = self.task.await;
    }
}

/// Spawn a service on the platform's default adapter.
pub async fn spawn_btleplug_service(
    store: Arc<SessionStore>,
    scan_duration: Duration,
) -> Result<ServiceHandle, BleError> {
    let adapter = default_adapter().await?;
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let (event_tx, events) = mpsc::unbounded_channel();
    let (commands, command_rx) = mpsc::unbounded_channel();

    let service = BluetoothService::new(
        BtleplugLink::new(adapter.clone(), link_tx, scan_duration),
        link_rx,
        BtleplugScanBackend::new(adapter),
        store,
        event_tx,
        scan_duration,
    );
    let task = tokio::spawn(service.run(command_rx));

    Ok(ServiceHandle {
        commands,
        events,
        task,
    })
}
