//! Shared test helpers: scriptable collaborators and an event recorder

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use hauler_client::{
    ChannelCommand, ChannelEvent, Collaborators, NegotiationRequest, NegotiationResponse,
    RelayChannel, RelayConnector, ResumableTransport, ResumptionStore, TransferConfig, TransferEvent,
    TransferHandle, Uploader, UploaderOptions, WorkerNegotiator,
};
use hauler_common::{
    BusEvent, EventBus, EventName, FileId, FileRegistry, Payload, RemoteSource, UploadFile,
};

pub const ENDPOINT: &str = "https://tus.example/files/";
pub const COMPANION: &str = "https://companion.example.com";

// ============================================================================
// Direct Transfers
// ============================================================================

/// One transfer created by the mock transport
pub struct TransferRecorder {
    pub config: TransferConfig,
    pub starts: AtomicUsize,
    pub aborts: AtomicUsize,
    pub url: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferRecorder {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = Some(url.to_string());
    }

    pub fn progress(&self, bytes_uploaded: u64, bytes_total: u64) {
        let _ = self.events.send(TransferEvent::Progress {
            bytes_uploaded,
            bytes_total,
        });
    }

    pub fn succeed(&self) {
        let _ = self.events.send(TransferEvent::Success);
    }

    pub fn fail(&self, message: &str) {
        let _ = self.events.send(TransferEvent::Error {
            message: message.to_string(),
        });
    }

    /// Whether this transfer was created for `file_id`
    pub fn is_for(&self, file_id: &str) -> bool {
        self.config.fingerprint == format!("tus-{file_id}-{}", self.config.endpoint)
    }
}

struct MockHandle {
    recorder: Arc<TransferRecorder>,
    /// Finish this long after `start` (auto mode only)
    auto_finish: Option<Duration>,
}

impl TransferHandle for MockHandle {
    fn start(&mut self) {
        self.recorder.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.auto_finish {
            let events = self.recorder.events.clone();
            let total = self.recorder.config.upload_size;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(TransferEvent::Progress {
                    bytes_uploaded: total,
                    bytes_total: total,
                });
                let _ = events.send(TransferEvent::Success);
            });
        }
    }

    fn abort(&mut self) {
        self.recorder.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn url(&self) -> Option<String> {
        self.recorder.url.lock().unwrap().clone()
    }
}

/// Resumable transport whose transfers are driven by the test
#[derive(Default)]
pub struct MockTransport {
    transfers: Mutex<Vec<Arc<TransferRecorder>>>,
    auto_finish: Option<Duration>,
}

impl MockTransport {
    /// Transfers only progress when the test says so
    pub fn manual() -> Self {
        Self::default()
    }

    /// Every started transfer succeeds after `delay`
    pub fn auto(delay: Duration) -> Self {
        Self {
            transfers: Mutex::new(Vec::new()),
            auto_finish: Some(delay),
        }
    }

    pub fn created(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    /// Most recent transfer created for `file_id`
    pub fn transfer(&self, file_id: &str) -> Option<Arc<TransferRecorder>> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|t| t.is_for(file_id))
            .cloned()
    }

    /// Creation order, as file ids
    pub fn creation_order(&self) -> Vec<String> {
        self.transfers
            .lock()
            .unwrap()
            .iter()
            .map(|t| {
                t.config
                    .fingerprint
                    .trim_start_matches("tus-")
                    .trim_end_matches(&format!("-{}", t.config.endpoint))
                    .to_string()
            })
            .collect()
    }
}

impl ResumableTransport for MockTransport {
    fn create(
        &self,
        _payload: Payload,
        config: TransferConfig,
    ) -> (Box<dyn TransferHandle>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(TransferRecorder {
            config,
            starts: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            url: Mutex::new(None),
            events: tx,
        });
        self.transfers.lock().unwrap().push(Arc::clone(&recorder));
        let handle = MockHandle {
            recorder,
            auto_finish: self.auto_finish,
        };
        (Box::new(handle), rx)
    }
}

// ============================================================================
// Remote Workers
// ============================================================================

/// Negotiator handing out `tok-1`, `tok-2`, ... or failing on demand
#[derive(Default)]
pub struct MockNegotiator {
    pub requests: Mutex<Vec<NegotiationRequest>>,
    pub failure: Mutex<Option<String>>,
}

impl MockNegotiator {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkerNegotiator for MockNegotiator {
    async fn negotiate(&self, request: NegotiationRequest) -> Result<NegotiationResponse, String> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        if let Some(failure) = self.failure.lock().unwrap().clone() {
            return Err(failure);
        }
        Ok(NegotiationResponse {
            token: format!("tok-{}", requests.len()),
        })
    }
}

/// One channel opened by the mock connector
pub struct ChannelRecorder {
    pub target: String,
    pub log: Arc<Mutex<Vec<&'static str>>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelRecorder {
    /// Commands sent so far, plus `close`
    pub fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log().contains(&"close")
    }

    pub fn push(&self, json: &str) {
        let event: ChannelEvent = serde_json::from_str(json).unwrap();
        let _ = self.events.send(event);
    }
}

struct MockChannel {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl RelayChannel for MockChannel {
    fn send(&mut self, command: ChannelCommand) {
        self.log.lock().unwrap().push(command.as_str());
    }

    fn close(&mut self) {
        self.log.lock().unwrap().push("close");
    }
}

#[derive(Default)]
pub struct MockConnector {
    channels: Mutex<Vec<Arc<ChannelRecorder>>>,
}

impl MockConnector {
    pub fn opened(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn channel(&self, index: usize) -> Option<Arc<ChannelRecorder>> {
        self.channels.lock().unwrap().get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<ChannelRecorder>> {
        self.channels.lock().unwrap().last().cloned()
    }
}

impl RelayConnector for MockConnector {
    fn open(
        &self,
        target: &str,
    ) -> Result<(Box<dyn RelayChannel>, mpsc::UnboundedReceiver<ChannelEvent>), String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        self.channels.lock().unwrap().push(Arc::new(ChannelRecorder {
            target: target.to_string(),
            log: Arc::clone(&log),
            events: tx,
        }));
        Ok((Box::new(MockChannel { log }), rx))
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Uploader wired to mock collaborators
pub struct Harness {
    pub bus: Arc<EventBus>,
    pub files: Arc<FileRegistry>,
    pub transport: Arc<MockTransport>,
    pub negotiator: Arc<MockNegotiator>,
    pub connector: Arc<MockConnector>,
    pub events: EventLog,
    pub uploader: Uploader,
}

impl Harness {
    pub fn new(options: UploaderOptions) -> Self {
        Self::with_transport(options, MockTransport::manual())
    }

    pub fn with_transport(options: UploaderOptions, transport: MockTransport) -> Self {
        let bus = Arc::new(EventBus::new());
        let files = Arc::new(FileRegistry::new());
        let transport = Arc::new(transport);
        let negotiator = Arc::new(MockNegotiator::default());
        let connector = Arc::new(MockConnector::default());
        let events = EventLog::attach(&bus);

        let collaborators = Collaborators {
            transport: transport.clone(),
            negotiator: negotiator.clone(),
            connector: connector.clone(),
        };
        let uploader = Uploader::new(options, Arc::clone(&bus), Arc::clone(&files), collaborators);

        Self {
            bus,
            files,
            transport,
            negotiator,
            connector,
            events,
            uploader,
        }
    }

    /// Persist resumption URLs through `store`
    pub fn with_checkpoints(mut self, store: ResumptionStore) -> Self {
        self.uploader = self.uploader.with_checkpoints(store);
        self
    }

    /// Register a local file and return it
    pub fn add_local(&self, id: &str) -> UploadFile {
        let file = UploadFile::local(id, &format!("{id}.bin"), vec![7u8; 64]);
        self.files.add(file.clone());
        file
    }

    /// Register a remote file and return it
    pub fn add_remote(&self, id: &str) -> UploadFile {
        let source = RemoteSource {
            companion_url: COMPANION.to_string(),
            url: format!("{COMPANION}/drive/get/{id}"),
            body: serde_json::Map::new(),
            provider: Some("drive".into()),
        };
        let file = UploadFile::remote(id, &format!("{id}.pdf"), 4096, source);
        self.files.add(file.clone());
        file
    }

    pub fn file(&self, id: &str) -> UploadFile {
        self.files.get(&FileId::new(id)).unwrap()
    }

    pub fn emit(&self, event: BusEvent) {
        self.bus.emit(event);
    }
}

pub fn options() -> UploaderOptions {
    UploaderOptions::with_endpoint(ENDPOINT)
}

// ============================================================================
// Event Recording
// ============================================================================

/// Records every event the uploader produces
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<BusEvent>>>,
}

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let log = Self::default();
        for name in [
            EventName::UploadStarted,
            EventName::UploadProgress,
            EventName::UploadError,
            EventName::UploadSuccess,
        ] {
            let events = Arc::clone(&log.events);
            bus.on(
                name,
                Arc::new(move |event: &BusEvent| events.lock().unwrap().push(event.clone())),
            );
        }
        log
    }

    pub fn all(&self) -> Vec<BusEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Events of one kind for one file
    pub fn of(&self, name: EventName, file_id: &str) -> Vec<BusEvent> {
        self.all()
            .into_iter()
            .filter(|e| e.name() == name && e.file_id().map(FileId::as_str) == Some(file_id))
            .collect()
    }

    pub fn count(&self, name: EventName) -> usize {
        self.all().iter().filter(|e| e.name() == name).count()
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// Yield to the sessions until `condition` holds
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

/// Give every session a few polls
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
