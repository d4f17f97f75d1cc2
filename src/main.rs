mod app;
mod cli;
mod ui;

use anyhow::Result;
use app::{poll_event, App, AppAction, HISTORY_ROWS, STATS_WINDOW_DAYS};
use clap::Parser;
use cli::Cli;
use crossterm::event::Event;
use rand::rngs::StdRng;
use rand::SeedableRng;
use ratatui::DefaultTerminal;
use speedgauge::client_info::{self, ClientInfo, LOOKUP_URL};
use speedgauge::logger::init_logging;
use speedgauge::speedtest::format_speed;
use speedgauge::speedtest::transport::HttpTransport;
use speedgauge::{
    ConfigError, EndpointDescriptor, EngineConfig, EngineError, JsonFileStore, MeasurementRecord,
    Orchestrator, ProgressEvent, ProgressReporter, ResultsStore, ServerCatalog, Settings,
    StaticCatalog, TestPhase, UploadRate,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ui::draw_ui;
use url::Url;

type RunHandle = JoinHandle<Result<Option<MeasurementRecord>, EngineError>>;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);
    settings.validate()?;

    let log_file = (!cli.is_batch()).then(|| settings.log_path());
    init_logging(cli.verbose, log_file.as_deref());

    let catalog = Arc::new(
        StaticCatalog::with_builtin(settings.servers.clone())
            .with_custom_file(settings.custom_servers_path())?,
    );
    if let Some(raw) = &cli.custom_server {
        let url = Url::parse(raw).map_err(|source| ConfigError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        let name = cli.server_name.as_deref().unwrap_or("Custom");
        let custom = catalog.add_custom(name, url)?;
        info!("using custom server {} ({})", custom.id, custom.display_name);
        settings.server = Some(custom.id);
    }
    if let Some(id) = &cli.remove_server {
        return remove_server(&catalog, &mut settings, id);
    }
    let store = Arc::new(JsonFileStore::new(
        settings.history_path(),
        settings.history_limit,
    ));

    if cli.list_servers {
        return list_servers(catalog.as_ref()).await;
    }
    if cli.clear_history {
        store.clear().await?;
        println!("cleared {}", store.path().display());
        return Ok(());
    }
    if let Some(n) = cli.history {
        return print_history(store.as_ref(), n).await;
    }
    if let Some(days) = cli.stats {
        return print_stats(store.as_ref(), days).await;
    }

    let transport = Arc::new(HttpTransport::new(settings.connect_timeout())?);
    let rng = match settings.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let orchestrator = Orchestrator::new(
        transport,
        catalog.clone(),
        store,
        EngineConfig::from(&settings),
        rng,
    );
    orchestrator.select_server(settings.server.clone());

    let data_dir = settings.data_dir();
    let lookup = settings.client_lookup.then_some(LOOKUP_URL);

    if cli.headless {
        let client = client_info::detect(&data_dir, lookup).await;
        orchestrator.set_client_info(client);
        return run_headless(&orchestrator).await;
    }

    let (client_tx, client_rx) = oneshot::channel();
    tokio::spawn(async move {
        let client = client_info::detect(&data_dir, lookup).await;
        let _ = client_tx.send(client);
    });

    let servers = catalog.list_active().await?;
    let mut terminal = ratatui::init();
    terminal.clear()?;

    let result = run_app(
        &mut terminal,
        orchestrator.clone(),
        catalog,
        settings,
        servers,
        client_rx,
    )
    .await;

    ratatui::restore();
    orchestrator.cancel();
    result
}

async fn run_app(
    terminal: &mut DefaultTerminal,
    orchestrator: Orchestrator,
    catalog: Arc<StaticCatalog>,
    settings: Settings,
    servers: Vec<EndpointDescriptor>,
    mut client_rx: oneshot::Receiver<ClientInfo>,
) -> Result<()> {
    let mut app = App::new(settings, servers);
    let mut test_rx: Option<mpsc::Receiver<ProgressEvent>> = None;
    let mut run: Option<RunHandle> = None;
    let mut client_pending = true;

    load_history(&mut app, &orchestrator).await;

    loop {
        terminal.draw(|frame| draw_ui(frame, &app))?;

        if client_pending {
            match client_rx.try_recv() {
                Ok(client) => {
                    orchestrator.set_client_info(client.clone());
                    app.client = client;
                    client_pending = false;
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => client_pending = false,
            }
        }

        // Drain test updates
        if let Some(rx) = test_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => app.apply_event(event),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        test_rx = None;
                        break;
                    }
                }
            }
        }

        if run.as_ref().is_some_and(|handle| handle.is_finished()) {
            if let Some(handle) = run.take() {
                match handle.await {
                    Ok(Ok(_)) => app.run_ended(None),
                    Ok(Err(err)) => app.run_ended(Some(err.to_string())),
                    Err(err) => app.run_ended(Some(err.to_string())),
                }
            }
        }

        // Handle input
        if let Some(Event::Key(key)) = poll_event(Duration::from_millis(30))? {
            if let Some(action) = app.handle_key_event(key) {
                match action {
                    AppAction::Quit => break,
                    AppAction::StartTest => {
                        if run.is_some() {
                            continue;
                        }
                        app.reset_for_new_test();
                        app.phase = TestPhase::Probing;

                        let (tx, rx) = mpsc::channel(64);
                        test_rx = Some(rx);

                        let engine = orchestrator.clone();
                        run = Some(tokio::spawn(async move {
                            engine.start(ProgressReporter::new(tx)).await
                        }));
                    }
                    AppAction::CancelTest => {
                        orchestrator.cancel();
                        app.cancel_test();
                    }
                    AppAction::ApplySettings => {
                        orchestrator.set_config(EngineConfig::from(&app.settings));
                        orchestrator.select_server(app.settings.server.clone());
                        info!(
                            "settings applied: download {}s, upload {}s, server {}",
                            app.settings.download_duration_secs,
                            app.settings.upload_duration_secs,
                            app.server_label()
                        );
                    }
                    AppAction::LoadHistory => load_history(&mut app, &orchestrator).await,
                    AppAction::RemoveServer(id) => {
                        if let Err(err) = catalog.remove_custom(&id) {
                            warn!("could not remove server {}: {}", id, err);
                        }
                        orchestrator.select_server(app.settings.server.clone());
                    }
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    Ok(())
}

async fn load_history(app: &mut App, orchestrator: &Orchestrator) {
    let store = orchestrator.store();
    match store.recent(HISTORY_ROWS).await {
        Ok(records) => app.history = records,
        Err(err) => warn!("could not read history: {}", err),
    }
    match store.aggregate(STATS_WINDOW_DAYS).await {
        Ok(stats) => app.stats = Some(stats),
        Err(err) => warn!("could not aggregate history: {}", err),
    }
}

async fn run_headless(orchestrator: &Orchestrator) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let engine = orchestrator.clone();
    let run = tokio::spawn(async move { engine.start(ProgressReporter::new(tx)).await });

    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::Phase(phase) if phase.is_active() => eprintln!("{}...", phase.label()),
            ProgressEvent::LatencyComplete(est) if !est.has_signal() => {
                eprintln!("latency: no reply from server")
            }
            _ => {}
        }
    }

    match run.await?? {
        Some(record) => {
            print_record(&record);
            Ok(())
        }
        None => {
            println!("measurement cancelled");
            Ok(())
        }
    }
}

fn upload_text(upload: Option<UploadRate>) -> String {
    match upload {
        Some(UploadRate::Measured(bps)) => format_speed(bps),
        Some(UploadRate::Simulated(bps)) => format!("~{} (estimated)", format_speed(bps)),
        None => "n/a".to_string(),
    }
}

fn print_record(record: &MeasurementRecord) {
    println!("server:    {}", record.target_label);
    if record.has_latency() {
        println!(
            "latency:   {:.1} ms (jitter {:.1} ms)",
            record.latency_ms, record.jitter_ms
        );
    } else {
        println!("latency:   —");
    }
    println!("download:  {}", format_speed(record.download_bps));
    println!("upload:    {}", upload_text(record.upload));
    if let Some(address) = &record.client_address {
        match &record.client_provider {
            Some(provider) => println!("client:    {} ({})", address, provider),
            None => println!("client:    {}", address),
        }
    }
}

async fn print_history(store: &dyn ResultsStore, n: usize) -> Result<()> {
    let records = store.recent(n).await?;
    if records.is_empty() {
        println!("no measurements yet");
        return Ok(());
    }
    for record in records {
        let latency = if record.has_latency() {
            format!("{:.0} ms", record.latency_ms)
        } else {
            "—".to_string()
        };
        println!(
            "{}  {:<14} {:>8}  down {:>12}  up {}",
            record
                .timestamp
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M"),
            record.target_label,
            latency,
            format_speed(record.download_bps),
            upload_text(record.upload),
        );
    }
    Ok(())
}

async fn print_stats(store: &dyn ResultsStore, days: u32) -> Result<()> {
    let stats = store.aggregate(days).await?;
    if stats.count == 0 {
        println!("no measurements in the last {} days", days);
        return Ok(());
    }
    println!("last {} days, {} measurements", days, stats.count);
    println!(
        "download:  avg {}  max {}",
        format_speed(stats.mean_download_bps),
        format_speed(stats.max_download_bps)
    );
    if let Some(bps) = stats.mean_upload_bps {
        println!(
            "upload:    avg {} over {} measured",
            format_speed(bps),
            stats.measured_upload_count
        );
    }
    if let Some(bps) = stats.mean_simulated_upload_bps {
        println!(
            "upload:    avg ~{} over {} estimated",
            format_speed(bps),
            stats.simulated_upload_count
        );
    }
    match (stats.mean_latency_ms, stats.min_latency_ms) {
        (Some(avg), Some(min)) => println!("latency:   avg {:.1} ms  min {:.1} ms", avg, min),
        _ => println!("latency:   —"),
    }
    Ok(())
}

/// Forgets a saved custom server. A selection pointing at it goes back to the default.
fn remove_server(catalog: &StaticCatalog, settings: &mut Settings, id: &str) -> Result<()> {
    if !catalog.remove_custom(id)? {
        anyhow::bail!("no custom server with id '{}'", id);
    }
    if settings.server.as_deref() == Some(id) {
        settings.server = None;
    }
    println!("removed {}", id);
    Ok(())
}

async fn list_servers(catalog: &dyn ServerCatalog) -> Result<()> {
    for endpoint in catalog.list_active().await? {
        let upload = if endpoint.upload_target.is_some() {
            ""
        } else {
            " (no upload)"
        };
        let default = if endpoint.is_default { " *" } else { "" };
        println!("{:<12} {}{}{}", endpoint.id, endpoint.display_name, upload, default);
    }
    Ok(())
}
