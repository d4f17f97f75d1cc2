use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use speedgauge::client_info::ClientInfo;
use speedgauge::settings::{SettingsField, MAX_DURATION_SECS, MIN_DURATION_SECS};
use speedgauge::speedtest::ping::LatencyEstimate;
use speedgauge::speedtest::Direction;
use speedgauge::{
    AggregateStats, EndpointDescriptor, MeasurementRecord, ProgressEvent, Settings, TestPhase,
    UploadRate,
};
use std::time::Duration;

const DURATION_STEP_SECS: u64 = 2;
const MAX_RATE_SAMPLES: usize = 200;
const MAX_PING_SAMPLES: usize = 100;
pub const HISTORY_ROWS: usize = 20;
pub const STATS_WINDOW_DAYS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppView {
    Main,
    Settings,
    History,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Panel {
    Download,
    Upload,
    Ping,
}

impl Panel {
    pub fn next(self) -> Self {
        match self {
            Panel::Download => Panel::Upload,
            Panel::Upload => Panel::Ping,
            Panel::Ping => Panel::Download,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            Panel::Download => Panel::Ping,
            Panel::Upload => Panel::Download,
            Panel::Ping => Panel::Upload,
        }
    }
}

pub struct App {
    pub phase: TestPhase,
    pub should_quit: bool,

    // UI state
    pub view: AppView,
    pub selected_panel: Panel,
    pub expanded: bool,

    // Settings
    pub settings: Settings,
    pub selected_setting: SettingsField,
    pub servers: Vec<EndpointDescriptor>,

    /// Run-wide progress, 0 to 100.
    pub progress: f64,
    pub latency: Option<LatencyEstimate>,
    pub download_bps: Option<f64>,
    pub upload: Option<UploadRate>,
    pub upload_done: bool,
    pub last_record: Option<MeasurementRecord>,
    pub error: Option<String>,
    pub client: ClientInfo,

    // Rate samples for charts, in Mbps; latency in ms
    pub download_samples: Vec<f64>,
    pub upload_samples: Vec<f64>,
    pub ping_samples: Vec<f64>,

    pub history: Vec<MeasurementRecord>,
    pub stats: Option<AggregateStats>,
}

impl App {
    pub fn new(settings: Settings, servers: Vec<EndpointDescriptor>) -> Self {
        Self {
            phase: TestPhase::Idle,
            should_quit: false,
            view: AppView::Main,
            selected_panel: Panel::Download,
            expanded: false,
            settings,
            selected_setting: SettingsField::DownloadDuration,
            servers,
            progress: 0.0,
            latency: None,
            download_bps: None,
            upload: None,
            upload_done: false,
            last_record: None,
            error: None,
            client: ClientInfo::default(),
            download_samples: Vec::new(),
            upload_samples: Vec::new(),
            ping_samples: Vec::new(),
            history: Vec::new(),
            stats: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_active()
    }

    /// Display name of the server the next run will use.
    pub fn server_label(&self) -> String {
        self.current_server()
            .map(|s| s.display_name.clone())
            .unwrap_or_else(|| "no server".to_string())
    }

    fn current_server(&self) -> Option<&EndpointDescriptor> {
        match &self.settings.server {
            Some(id) => self.servers.iter().find(|s| &s.id == id),
            None => self
                .servers
                .iter()
                .find(|s| s.is_default)
                .or_else(|| self.servers.first()),
        }
    }

    pub fn handle_key_event(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        if key.kind != KeyEventKind::Press {
            return None;
        }

        match self.view {
            AppView::Main => self.handle_main_key(key),
            AppView::Settings => self.handle_settings_key(key),
            AppView::History => self.handle_history_key(key),
        }
    }

    fn handle_main_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') => {
                self.should_quit = true;
                Some(AppAction::Quit)
            }
            KeyCode::Char('s') => {
                if !self.is_running() {
                    self.view = AppView::Settings;
                }
                None
            }
            KeyCode::Char('h') => {
                if !self.is_running() {
                    self.view = AppView::History;
                    Some(AppAction::LoadHistory)
                } else {
                    None
                }
            }
            KeyCode::Enter => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if !self.is_running() {
                    Some(AppAction::StartTest)
                } else {
                    self.expanded = true;
                    None
                }
            }
            KeyCode::Esc => {
                if self.expanded {
                    self.expanded = false;
                    None
                } else if self.is_running() {
                    Some(AppAction::CancelTest)
                } else {
                    None
                }
            }
            KeyCode::Tab | KeyCode::Right | KeyCode::Char('j') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.next();
                }
                None
            }
            KeyCode::BackTab | KeyCode::Left | KeyCode::Char('k') => {
                if !self.expanded {
                    self.selected_panel = self.selected_panel.prev();
                }
                None
            }
            KeyCode::Char(' ') => {
                self.expanded = !self.expanded;
                None
            }
            _ => None,
        }
    }

    fn handle_settings_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter => {
                self.view = AppView::Main;
                Some(AppAction::ApplySettings)
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.selected_setting = self.selected_setting.prev();
                None
            }
            KeyCode::Down | KeyCode::Char('j') | KeyCode::Tab => {
                self.selected_setting = self.selected_setting.next();
                None
            }
            KeyCode::Left | KeyCode::Char('h') => {
                self.adjust_setting(false);
                None
            }
            KeyCode::Right | KeyCode::Char('l') => {
                self.adjust_setting(true);
                None
            }
            KeyCode::Char('d') | KeyCode::Delete
                if self.selected_setting == SettingsField::Server =>
            {
                self.remove_current_server()
            }
            _ => None,
        }
    }

    /// Drops the selected server if it is a custom one and falls back to the default.
    fn remove_current_server(&mut self) -> Option<AppAction> {
        let id = self.current_server().filter(|s| s.is_custom())?.id.clone();
        self.servers.retain(|s| s.id != id);
        self.settings.server = None;
        Some(AppAction::RemoveServer(id))
    }

    fn handle_history_key(&mut self, key: event::KeyEvent) -> Option<AppAction> {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter | KeyCode::Char('h') => {
                self.view = AppView::Main;
                None
            }
            _ => None,
        }
    }

    fn adjust_setting(&mut self, up: bool) {
        match self.selected_setting {
            SettingsField::DownloadDuration => {
                self.settings.download_duration_secs =
                    step_duration(self.settings.download_duration_secs, up);
            }
            SettingsField::UploadDuration => {
                self.settings.upload_duration_secs =
                    step_duration(self.settings.upload_duration_secs, up);
            }
            SettingsField::Server => self.cycle_server(up),
        }
    }

    fn cycle_server(&mut self, forward: bool) {
        if self.servers.is_empty() {
            return;
        }
        let len = self.servers.len();
        let current = self
            .current_server()
            .and_then(|cur| self.servers.iter().position(|s| s.id == cur.id))
            .unwrap_or(0);
        let next = if forward {
            (current + 1) % len
        } else {
            (current + len - 1) % len
        };
        self.settings.server = Some(self.servers[next].id.clone());
    }

    pub fn reset_for_new_test(&mut self) {
        self.phase = TestPhase::Idle;
        self.progress = 0.0;
        self.latency = None;
        self.download_bps = None;
        self.upload = None;
        self.upload_done = false;
        self.last_record = None;
        self.error = None;
        self.download_samples.clear();
        self.upload_samples.clear();
        self.ping_samples.clear();
        self.expanded = false;
    }

    pub fn apply_event(&mut self, event: ProgressEvent) {
        match event {
            // The engine drops back to idle after completing; keep the results on screen.
            ProgressEvent::Phase(TestPhase::Idle) if self.phase == TestPhase::Complete => {}
            ProgressEvent::Phase(phase) => self.phase = phase,
            ProgressEvent::Progress(p) => self.progress = p.clamp(0.0, 100.0),
            ProgressEvent::LatencySample(Some(ms)) => {
                push_capped(&mut self.ping_samples, ms, MAX_PING_SAMPLES);
            }
            ProgressEvent::LatencySample(None) => {}
            ProgressEvent::LiveRate { direction, bps } => {
                let mbps = bps / 1_000_000.0;
                match direction {
                    Direction::Download => {
                        push_capped(&mut self.download_samples, mbps, MAX_RATE_SAMPLES)
                    }
                    Direction::Upload => {
                        push_capped(&mut self.upload_samples, mbps, MAX_RATE_SAMPLES)
                    }
                }
            }
            ProgressEvent::LatencyComplete(estimate) => self.latency = Some(estimate),
            ProgressEvent::DownloadComplete { bps } => self.download_bps = Some(bps),
            ProgressEvent::UploadComplete(rate) => {
                self.upload = rate;
                self.upload_done = true;
            }
            ProgressEvent::Completed(record) => {
                self.phase = TestPhase::Complete;
                self.progress = 100.0;
                self.history.insert(0, record.clone());
                self.history.truncate(HISTORY_ROWS);
                self.last_record = Some(record);
            }
        }
    }

    /// The run stopped without a record: cancelled or failed.
    pub fn run_ended(&mut self, error: Option<String>) {
        if let Some(error) = error {
            self.phase = TestPhase::Failed;
            self.error = Some(error);
        } else if self.phase != TestPhase::Complete {
            self.phase = TestPhase::Idle;
        }
    }

    pub fn cancel_test(&mut self) {
        self.phase = TestPhase::Idle;
        self.progress = 0.0;
    }

    /// Progress through one phase as 0..1, derived from the run-wide figure.
    pub fn phase_fraction(&self, phase: TestPhase) -> f64 {
        let (from, to) = match phase {
            TestPhase::Probing => (0.0, 10.0),
            TestPhase::Downloading => (10.0, 70.0),
            TestPhase::Uploading => (70.0, 100.0),
            _ => return 0.0,
        };
        if self.phase == TestPhase::Complete {
            return 1.0;
        }
        ((self.progress - from) / (to - from)).clamp(0.0, 1.0)
    }
}

fn step_duration(current: u64, up: bool) -> u64 {
    let next = if up {
        current + DURATION_STEP_SECS
    } else {
        current.saturating_sub(DURATION_STEP_SECS)
    };
    next.clamp(MIN_DURATION_SECS, MAX_DURATION_SECS)
}

fn push_capped(samples: &mut Vec<f64>, value: f64, cap: usize) {
    samples.push(value);
    if samples.len() > cap {
        samples.remove(0);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppAction {
    Quit,
    StartTest,
    CancelTest,
    ApplySettings,
    LoadHistory,
    RemoveServer(String),
}

pub fn poll_event(timeout: Duration) -> Result<Option<Event>> {
    if event::poll(timeout)? {
        Ok(Some(event::read()?))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crossterm::event::{KeyEvent, KeyModifiers};
    use speedgauge::catalog::builtin_endpoints;

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    fn app() -> App {
        App::new(Settings::default(), builtin_endpoints())
    }

    fn record() -> MeasurementRecord {
        MeasurementRecord {
            timestamp: Utc::now(),
            target_id: "cloudflare".to_string(),
            target_label: "Cloudflare".to_string(),
            latency_ms: 12.0,
            latency_samples: 5,
            jitter_ms: 1.5,
            download_bps: 90_000_000.0,
            upload: Some(UploadRate::Simulated(20_000_000.0)),
            client_address: None,
            client_provider: None,
            client_device_id: None,
        }
    }

    #[test]
    fn enter_starts_only_when_idle() {
        let mut app = app();
        assert_eq!(app.handle_key_event(press(KeyCode::Enter)), Some(AppAction::StartTest));

        app.apply_event(ProgressEvent::Phase(TestPhase::Downloading));
        assert_eq!(app.handle_key_event(press(KeyCode::Enter)), None);
        assert!(app.expanded);
        assert_eq!(app.handle_key_event(press(KeyCode::Esc)), None);
        assert_eq!(app.handle_key_event(press(KeyCode::Esc)), Some(AppAction::CancelTest));
    }

    #[test]
    fn completion_survives_the_trailing_idle() {
        let mut app = app();
        app.apply_event(ProgressEvent::Phase(TestPhase::Uploading));
        app.apply_event(ProgressEvent::Completed(record()));
        app.apply_event(ProgressEvent::Phase(TestPhase::Idle));

        assert_eq!(app.phase, TestPhase::Complete);
        assert_eq!(app.history.len(), 1);
        assert_eq!(app.phase_fraction(TestPhase::Uploading), 1.0);
        assert_eq!(app.handle_key_event(press(KeyCode::Enter)), Some(AppAction::StartTest));
    }

    #[test]
    fn live_rates_are_charted_in_mbps() {
        let mut app = app();
        app.apply_event(ProgressEvent::LiveRate {
            direction: Direction::Download,
            bps: 50_000_000.0,
        });
        app.apply_event(ProgressEvent::LiveRate {
            direction: Direction::Upload,
            bps: 5_000_000.0,
        });
        app.apply_event(ProgressEvent::LatencySample(None));

        assert_eq!(app.download_samples, vec![50.0]);
        assert_eq!(app.upload_samples, vec![5.0]);
        assert!(app.ping_samples.is_empty());
    }

    #[test]
    fn phase_fraction_maps_run_progress() {
        let mut app = app();
        app.apply_event(ProgressEvent::Phase(TestPhase::Downloading));
        app.apply_event(ProgressEvent::Progress(40.0));
        assert!((app.phase_fraction(TestPhase::Downloading) - 0.5).abs() < 1e-9);
        assert_eq!(app.phase_fraction(TestPhase::Probing), 1.0);
        assert_eq!(app.phase_fraction(TestPhase::Uploading), 0.0);
    }

    #[test]
    fn settings_durations_step_within_bounds() {
        let mut app = app();
        app.handle_key_event(press(KeyCode::Char('s')));
        assert_eq!(app.view, AppView::Settings);

        for _ in 0..20 {
            app.handle_key_event(press(KeyCode::Right));
        }
        assert_eq!(app.settings.download_duration_secs, MAX_DURATION_SECS);

        for _ in 0..20 {
            app.handle_key_event(press(KeyCode::Left));
        }
        assert_eq!(app.settings.download_duration_secs, MIN_DURATION_SECS);

        assert_eq!(
            app.handle_key_event(press(KeyCode::Enter)),
            Some(AppAction::ApplySettings)
        );
        assert_eq!(app.view, AppView::Main);
    }

    #[test]
    fn server_setting_cycles_through_catalog() {
        let mut app = app();
        let ids: Vec<String> = app.servers.iter().map(|s| s.id.clone()).collect();
        app.selected_setting = SettingsField::Server;
        app.view = AppView::Settings;

        app.handle_key_event(press(KeyCode::Right));
        assert_eq!(app.settings.server.as_deref(), Some(ids[1].as_str()));
        app.handle_key_event(press(KeyCode::Left));
        app.handle_key_event(press(KeyCode::Left));
        assert_eq!(app.settings.server.as_deref(), ids.last().map(String::as_str));
    }

    #[test]
    fn chart_series_keep_the_latest_readings() {
        let mut app = app();
        for i in 0..250 {
            app.apply_event(ProgressEvent::LiveRate {
                direction: Direction::Upload,
                bps: i as f64 * 1_000_000.0,
            });
        }
        assert_eq!(app.upload_samples.len(), MAX_RATE_SAMPLES);
        assert_eq!(app.upload_samples.first(), Some(&50.0));
        assert_eq!(app.upload_samples.last(), Some(&249.0));
        assert!(app.download_samples.is_empty());
    }

    #[test]
    fn deleting_a_custom_server_resets_the_selection() {
        let custom = EndpointDescriptor::custom(
            "Mirror",
            url::Url::parse("https://mirror.test/blob").unwrap(),
        );
        let mut servers = builtin_endpoints();
        servers.push(custom.clone());
        let mut settings = Settings::default();
        settings.server = Some(custom.id.clone());
        let mut app = App::new(settings, servers);
        app.view = AppView::Settings;
        app.selected_setting = SettingsField::Server;

        assert_eq!(
            app.handle_key_event(press(KeyCode::Char('d'))),
            Some(AppAction::RemoveServer(custom.id.clone()))
        );
        assert!(app.settings.server.is_none());
        assert!(app.servers.iter().all(|s| s.id != custom.id));
        assert_eq!(app.server_label(), "Cloudflare");

        // Built-in servers stay.
        assert_eq!(app.handle_key_event(press(KeyCode::Delete)), None);
        assert_eq!(app.servers.len(), builtin_endpoints().len());
    }

    #[test]
    fn failed_run_shows_error() {
        let mut app = app();
        app.apply_event(ProgressEvent::Phase(TestPhase::Probing));
        app.run_ended(Some("task panicked".to_string()));
        assert_eq!(app.phase, TestPhase::Failed);
        assert_eq!(app.error.as_deref(), Some("task panicked"));

        app.reset_for_new_test();
        assert!(app.error.is_none());
    }
}
