//! In-memory stand-in for an ESP32 with a two slot OTA partition table.
//!
//! Flash, server and restart state are shared behind `Arc<Mutex<_>>` so a
//! test can inspect them while the coordinator owns the collaborators.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ota_core::image::build_image_prefix;
use ota_core::{
    Collaborators, FirmwareDescriptor, FirmwareWriter, ImageSize, PartitionCatalog, PartitionError, PartitionRef,
    Restart, RunReport, Transport, TransportClient, TransportConfig, TransportError, UpdateCoordinator, WorkerConfig,
    WriterError,
};

pub const SLOT_SIZE: u32 = 0x10_0000;
/// Debug builds on the host need far more stack than the device default
pub const HOST_WORKER_STACK: usize = 256 * 1024;
const APP_TYPE: u32 = 0;
const FACTORY_SUBTYPE: u32 = 0x00;
const OTA_SUBTYPE_BASE: u32 = 0x10;

pub type SimCoordinator = UpdateCoordinator<SimTransport, SimCatalog, SimWriter, SimRestart>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Image as a build would produce it: header prefix then `body_len` bytes
pub fn firmware_image(version: &str, body_len: usize) -> Vec<u8> {
    let desc = FirmwareDescriptor {
        version: version.to_string(),
        project_name: "esp32-ota-updater".to_string(),
        compile_time: "12:00:00".to_string(),
        compile_date: "Oct 18 2026".to_string(),
        idf_version: "v5.3".to_string(),
        secure_version: 0,
    };
    let mut image = build_image_prefix(&desc);
    image.extend((0..body_len).map(|i| (i % 251) as u8));
    image
}

#[derive(Debug)]
pub struct FlashState {
    pub table: Vec<PartitionRef>,
    pub contents: HashMap<String, Vec<u8>>,
    pub boot: String,
    pub running: String,
    pub last_invalid: Option<String>,
    pub open_sessions: usize,
    pub max_open_sessions: usize,
    pub sessions_started: usize,
    pub aborted: usize,
}

impl FlashState {
    fn new(factory_image: Vec<u8>) -> Self {
        let table = vec![
            PartitionRef {
                label: "factory".to_string(),
                kind: APP_TYPE,
                subtype: FACTORY_SUBTYPE,
                address: 0x1_0000,
                size: SLOT_SIZE,
            },
            PartitionRef {
                label: "ota_0".to_string(),
                kind: APP_TYPE,
                subtype: OTA_SUBTYPE_BASE,
                address: 0x11_0000,
                size: SLOT_SIZE,
            },
            PartitionRef {
                label: "ota_1".to_string(),
                kind: APP_TYPE,
                subtype: OTA_SUBTYPE_BASE + 1,
                address: 0x21_0000,
                size: SLOT_SIZE,
            },
        ];
        let mut contents = HashMap::new();
        contents.insert("factory".to_string(), factory_image);

        Self {
            table,
            contents,
            boot: "factory".to_string(),
            running: "factory".to_string(),
            last_invalid: None,
            open_sessions: 0,
            max_open_sessions: 0,
            sessions_started: 0,
            aborted: 0,
        }
    }

    fn find(&self, label: &str) -> Option<PartitionRef> {
        self.table.iter().find(|p| p.label == label).cloned()
    }

    fn next_update(&self) -> Option<PartitionRef> {
        let next = match self.running.as_str() {
            "ota_0" => "ota_1",
            _ => "ota_0",
        };
        self.find(next)
    }
}

#[derive(Clone)]
pub struct SimCatalog {
    flash: Arc<Mutex<FlashState>>,
}

impl PartitionCatalog for SimCatalog {
    fn boot_partition(&self) -> Option<PartitionRef> {
        let flash = lock(&self.flash);
        flash.find(&flash.boot)
    }

    fn running_partition(&self) -> Option<PartitionRef> {
        let flash = lock(&self.flash);
        flash.find(&flash.running)
    }

    fn next_update_partition(&self) -> Option<PartitionRef> {
        lock(&self.flash).next_update()
    }

    fn last_invalid_partition(&self) -> Option<PartitionRef> {
        let flash = lock(&self.flash);
        flash.last_invalid.as_deref().and_then(|label| flash.find(label))
    }

    fn descriptor(&self, partition: &PartitionRef) -> Option<FirmwareDescriptor> {
        let flash = lock(&self.flash);
        let image = flash.contents.get(&partition.label)?;
        FirmwareDescriptor::from_image_prefix(image).ok()
    }

    fn set_boot_partition(&mut self, partition: &PartitionRef) -> Result<(), PartitionError> {
        let mut flash = lock(&self.flash);
        if !flash.contents.contains_key(&partition.label) {
            return Err(PartitionError::SetBoot(format!("{} holds no image", partition.label)));
        }
        flash.boot = partition.label.clone();
        Ok(())
    }
}

pub struct SimSession {
    label: String,
    data: Vec<u8>,
}

#[derive(Clone)]
pub struct SimWriter {
    flash: Arc<Mutex<FlashState>>,
}

impl FirmwareWriter for SimWriter {
    type Session = SimSession;

    fn begin(&mut self, partition: &PartitionRef, size: ImageSize) -> Result<SimSession, WriterError> {
        if let ImageSize::Known(n) = size {
            if n > partition.size as u64 {
                return Err(WriterError::Begin(format!("{} bytes do not fit", n)));
            }
        }

        let mut flash = lock(&self.flash);
        flash.open_sessions += 1;
        flash.sessions_started += 1;
        flash.max_open_sessions = flash.max_open_sessions.max(flash.open_sessions);
        // Erase happens on begin
        flash.contents.remove(&partition.label);

        Ok(SimSession {
            label: partition.label.clone(),
            data: Vec::new(),
        })
    }

    fn write(&mut self, session: &mut SimSession, data: &[u8]) -> Result<(), WriterError> {
        session.data.extend_from_slice(data);
        Ok(())
    }

    fn end(&mut self, session: SimSession) -> Result<(), WriterError> {
        let mut flash = lock(&self.flash);
        flash.open_sessions -= 1;
        FirmwareDescriptor::from_image_prefix(&session.data).map_err(|e| WriterError::Validate(e.to_string()))?;
        flash.contents.insert(session.label, session.data);
        Ok(())
    }

    fn abort(&mut self, _session: SimSession) {
        let mut flash = lock(&self.flash);
        flash.open_sessions -= 1;
        flash.aborted += 1;
    }
}

#[derive(Clone, Default)]
pub struct SimRestart {
    requested: Arc<Mutex<usize>>,
}

impl Restart for SimRestart {
    fn request_restart(&mut self) {
        *lock(&self.requested) += 1;
    }
}

/// Hold points for a run: the worker reports when it reaches the response
/// headers and waits there until released.
struct Gate {
    entered: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
struct ServerState {
    image: Option<Vec<u8>>,
    chunk_size: Option<usize>,
    // Truncate the body after this many bytes while still declaring the full length
    cut_after: Option<usize>,
    // Fail reads once this many bytes were delivered
    fail_after: Option<usize>,
    gate: Option<Gate>,
    requests: usize,
}

#[derive(Clone)]
pub struct SimTransport {
    server: Arc<Mutex<ServerState>>,
}

impl Transport for SimTransport {
    type Client = SimClient;

    fn open(&mut self, config: &TransportConfig) -> Result<SimClient, TransportError> {
        let mut server = lock(&self.server);
        server.requests += 1;
        let image = server
            .image
            .clone()
            .ok_or_else(|| TransportError::Open(format!("{} unreachable", config.url)))?;
        let declared = image.len();
        let body = match server.cut_after {
            Some(n) => image[..n.min(image.len())].to_vec(),
            None => image,
        };

        Ok(SimClient {
            body,
            declared: declared as u64,
            position: 0,
            chunk_size: server.chunk_size.unwrap_or(usize::MAX),
            fail_after: server.fail_after,
            gate: server.gate.take(),
        })
    }
}

pub struct SimClient {
    body: Vec<u8>,
    declared: u64,
    position: usize,
    chunk_size: usize,
    fail_after: Option<usize>,
    gate: Option<Gate>,
}

impl TransportClient for SimClient {
    fn fetch_headers(&mut self) -> Result<Option<u64>, TransportError> {
        if let Some(gate) = self.gate.take() {
            let _ = gate.entered.send(());
            gate.release
                .recv()
                .map_err(|_| TransportError::Headers("server went away".to_string()))?;
        }
        Ok(Some(self.declared))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.fail_after.is_some_and(|n| self.position >= n) {
            return Err(TransportError::Read("connection reset".to_string()));
        }
        let remaining = &self.body[self.position..];
        let n = remaining.len().min(buf.len()).min(self.chunk_size);
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }

    fn is_complete(&self) -> bool {
        self.position as u64 >= self.declared
    }

    fn close(&mut self) {}
}

/// Handle for releasing a run held at the response headers
pub struct HeldRun {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl HeldRun {
    /// Wait until the worker is inside the transport
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

pub struct SimDevice {
    flash: Arc<Mutex<FlashState>>,
    server: Arc<Mutex<ServerState>>,
    restarts: SimRestart,
}

impl SimDevice {
    /// Device booted from the factory slot running `version`
    pub fn new(version: &str) -> Self {
        Self {
            flash: Arc::new(Mutex::new(FlashState::new(firmware_image(version, 4096)))),
            server: Arc::new(Mutex::new(ServerState::default())),
            restarts: SimRestart::default(),
        }
    }

    pub fn serve(&self, image: Vec<u8>) {
        lock(&self.server).image = Some(image);
    }

    pub fn serve_in_chunks(&self, chunk_size: usize) {
        lock(&self.server).chunk_size = Some(chunk_size);
    }

    pub fn cut_body_after(&self, bytes: usize) {
        lock(&self.server).cut_after = Some(bytes);
    }

    pub fn fail_reads_after(&self, bytes: usize) {
        lock(&self.server).fail_after = Some(bytes);
    }

    /// Make the next request stop at the response headers
    pub fn hold_next_run(&self) -> HeldRun {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        lock(&self.server).gate = Some(Gate {
            entered: entered_tx,
            release: release_rx,
        });
        HeldRun {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Mark `label` as holding an image the bootloader rolled back from
    pub fn mark_invalid(&self, label: &str, version: &str) {
        let mut flash = lock(&self.flash);
        flash.contents.insert(label.to_string(), firmware_image(version, 1024));
        flash.last_invalid = Some(label.to_string());
    }

    pub fn coordinator(&self) -> Arc<SimCoordinator> {
        let parts = Collaborators {
            transport: SimTransport {
                server: Arc::clone(&self.server),
            },
            catalog: SimCatalog {
                flash: Arc::clone(&self.flash),
            },
            writer: SimWriter {
                flash: Arc::clone(&self.flash),
            },
            restart: self.restarts.clone(),
        };
        let worker = WorkerConfig {
            stack_size: HOST_WORKER_STACK,
            ..WorkerConfig::default()
        };
        UpdateCoordinator::new(parts, worker)
    }

    /// Simulate the reboot a restart request leads to
    pub fn reboot(&self) {
        let mut flash = lock(&self.flash);
        flash.running = flash.boot.clone();
    }

    pub fn flash(&self) -> MutexGuard<'_, FlashState> {
        lock(&self.flash)
    }

    pub fn running_version(&self) -> Option<String> {
        let flash = lock(&self.flash);
        let image = flash.contents.get(&flash.running)?;
        FirmwareDescriptor::from_image_prefix(image).ok().map(|d| d.version)
    }

    pub fn restart_requests(&self) -> usize {
        *lock(&self.restarts.requested)
    }

    pub fn requests(&self) -> usize {
        lock(&self.server).requests
    }
}

/// Poll until the coordinator has a report, or give up after `timeout`
pub fn wait_for_report(coordinator: &SimCoordinator, timeout: Duration) -> Option<RunReport> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(report) = coordinator.last_report() {
            return Some(report);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    None
}

/// Poll until no run holds the guard
pub fn wait_idle(coordinator: &SimCoordinator, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if !coordinator.is_running() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
