use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use syclone::packet::encode_frame;
use syclone::queue::Pop;
use syclone::transport::{Endpoint, TransportError};
use syclone::*;

const POLL: Duration = Duration::from_millis(5);

fn ts() -> SensorTimestamp {
    SensorTimestamp {
        year: 2025,
        month: 3,
        day: 14,
        hour: 9,
        minute: 30,
        second: 0,
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(POLL);
    }
    cond()
}

/// Replays a byte script in small chunks. Once drained it either fails or
/// asks the session to stop.
struct ReplayEndpoint {
    data: VecDeque<u8>,
    chunk: usize,
    fail_when_drained: bool,
    session: Session,
    closed: Arc<AtomicBool>,
}

impl ReplayEndpoint {
    fn new(data: Vec<u8>, session: &Session) -> Self {
        Self {
            data: data.into(),
            chunk: 7,
            fail_when_drained: false,
            session: session.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Endpoint for ReplayEndpoint {
    fn id(&self) -> &str {
        "replay"
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.data.len())
    }

    fn read_up_to(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        if self.data.is_empty() {
            if self.fail_when_drained {
                return Err(TransportError::Closed(String::from("replay")));
            }
            self.session.request_shutdown();
            return Ok(0);
        }
        let n = self.chunk.min(buf.len()).min(self.data.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.data.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

fn frames(raws: &[u32]) -> Vec<u8> {
    raws.iter()
        .flat_map(|&raw| encode_frame(raw, &ts()).as_bytes().to_vec())
        .collect()
}

#[test]
fn test_acquire_queues_samples_in_order() {
    let session = Session::new();
    // A corrupt frame in the middle is counted and skipped
    let mut stream = frames(&[1]);
    stream.extend_from_slice(&[0u8; 50]);
    stream.extend(frames(&[2, 3]));
    stream.extend_from_slice(&[0x43, 0x59, 0x00]);

    let mut endpoint = ReplayEndpoint::new(stream, &session);
    let (producer, consumer) = sample_queue();
    let mut seen = Vec::new();

    session
        .acquire(&mut endpoint, &producer, POLL, |sample| seen.push(sample.dose_nsv_per_h))
        .unwrap();

    let expected: Vec<f64> = [1u32, 2, 3].iter().map(|&r| f64::from(r) * 0.1 * 36.0).collect();
    assert_eq!(seen, expected);

    let mut queued = Vec::new();
    while let Ok(sample) = consumer.try_pop() {
        queued.push(sample.dose_nsv_per_h);
    }
    assert_eq!(queued, expected);

    let stats = session.acquisition_stats();
    assert_eq!(stats.bytes_read, 203);
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.samples, 3);
    assert_eq!(stats.invalid_frames, 1);
    assert!(session.has_first_sample());
}

#[test]
fn test_acquire_stops_when_consumer_is_gone() {
    let session = Session::new();
    let mut endpoint = ReplayEndpoint::new(frames(&[1, 2, 3]), &session);
    let (producer, consumer) = sample_queue();
    drop(consumer);

    session
        .acquire(&mut endpoint, &producer, POLL, |_| {})
        .unwrap();
    assert_eq!(session.acquisition_stats().samples, 1);
    assert!(!session.is_shutdown());
}

#[test]
fn test_acquisition_thread_failure_ends_session() {
    let session = Session::new();
    let mut endpoint = ReplayEndpoint::new(frames(&[4]), &session);
    endpoint.fail_when_drained = true;
    let closed = Arc::clone(&endpoint.closed);

    let (producer, consumer) = sample_queue();
    let handle = session
        .spawn_acquisition(endpoint, producer, POLL, |_| {})
        .unwrap();
    handle.join().unwrap();

    assert!(session.is_shutdown());
    assert!(closed.load(Ordering::SeqCst));
    assert!(consumer.try_pop().is_ok());
    assert_eq!(consumer.try_pop(), Err(Pop::Disconnected));
}

#[test]
fn test_wait_for_first_sample() {
    let session = Session::new();
    session.request_shutdown();
    assert!(!session.wait_for_first_sample(POLL));

    let session = Session::new();
    let mut endpoint = ReplayEndpoint::new(frames(&[1]), &session);
    let (producer, _consumer) = sample_queue();
    session.acquire(&mut endpoint, &producer, POLL, |_| {}).unwrap();
    assert!(session.wait_for_first_sample(POLL));
}

/// Sheet the test thread can inspect while the fill loop owns the engine.
#[derive(Clone, Default)]
struct SharedSheet(Arc<Mutex<MemorySheet>>);

impl CellSink for SharedSheet {
    fn set_value(&mut self, sheet: &str, pos: CellPos, value: CellValue) {
        if let Ok(mut inner) = self.0.lock() {
            inner.set_value(sheet, pos, value);
        }
    }

    fn get_value(&self, sheet: &str, pos: CellPos) -> CellValue {
        self.0
            .lock()
            .map(|inner| inner.get_value(sheet, pos))
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
struct SharedNotifier(Arc<AtomicU32>);

impl CompletionNotifier for SharedNotifier {
    fn notify_complete(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_fill_loop_applies_commands_and_samples() {
    let session = Session::new();
    let sheet = SharedSheet::default();
    let notifier = SharedNotifier::default();
    let (producer, consumer) = sample_queue();
    let (change_tx, change_rx) = crossbeam_channel::unbounded();

    let fill_session = session.clone();
    let fill_sheet = sheet.clone();
    let fill_notifier = notifier.clone();
    let fill = thread::spawn(move || {
        let mut engine = FillEngine::new(
            CommandParser::new("Syclone").unwrap(),
            fill_sheet,
            fill_notifier,
        );
        fill_session.run_fill(&mut engine, &consumer, &change_rx, POLL);
        *engine.stats()
    });

    change_tx
        .send(ChangeNotification::new("Sheet1", CellPos::new(1, 1), "Syclone 2"))
        .unwrap();
    // The timestamp cell appears once the grid exists
    assert!(wait_until(Duration::from_secs(5), || {
        sheet.get_value("Sheet1", CellPos::new(1, 1)).as_text().is_some()
    }));

    for raw in [10, 20, 30] {
        producer.push(decode_frame(raw));
    }
    assert!(wait_until(Duration::from_secs(5), || {
        notifier.0.load(Ordering::SeqCst) == 1
    }));

    // Host goes away: the fill loop ends the session
    drop(change_tx);
    let stats = fill.join().unwrap();

    assert!(session.is_shutdown());
    assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    assert_eq!(stats.grids_allocated, 1);
    assert_eq!(stats.samples_written, 2);
    assert_eq!(
        sheet.get_value("Sheet1", CellPos::new(1, 3)).as_number(),
        Some(20.0 * 0.1 * 36.0)
    );
}

fn decode_frame(raw: u32) -> Sample {
    encode_frame(raw, &ts()).decode().unwrap()
}

#[test]
fn test_fill_loop_exits_on_shutdown() {
    let session = Session::new();
    let (_producer, consumer) = sample_queue();
    let (_change_tx, change_rx) = crossbeam_channel::unbounded::<ChangeNotification>();

    let fill_session = session.clone();
    let fill = thread::spawn(move || {
        let mut engine = FillEngine::new(
            CommandParser::new("Syclone").unwrap(),
            MemorySheet::new(),
            SilentNotifier,
        );
        fill_session.run_fill(&mut engine, &consumer, &change_rx, POLL);
    });

    thread::sleep(Duration::from_millis(30));
    assert!(!fill.is_finished());

    session.request_shutdown();
    assert!(wait_until(Duration::from_secs(2), || fill.is_finished()));
    fill.join().unwrap();
}

#[test]
fn test_fill_loop_exits_when_acquisition_ends() {
    let session = Session::new();
    let (producer, consumer) = sample_queue();
    let (_change_tx, change_rx) = crossbeam_channel::unbounded::<ChangeNotification>();
    drop(producer);

    let mut engine = FillEngine::new(
        CommandParser::new("Syclone").unwrap(),
        MemorySheet::new(),
        SilentNotifier,
    );
    session.run_fill(&mut engine, &consumer, &change_rx, POLL);
    assert!(session.is_shutdown());
}

fn spawn_fill(
    session: &Session,
    sheet: &SharedSheet,
    notifier: &SharedNotifier,
    consumer: syclone::queue::SampleConsumer,
    changes: crossbeam_channel::Receiver<ChangeNotification>,
) -> thread::JoinHandle<syclone::engine::FillStats> {
    let session = session.clone();
    let sheet = sheet.clone();
    let notifier = notifier.clone();
    thread::spawn(move || {
        let mut engine = FillEngine::new(CommandParser::new("Syclone").unwrap(), sheet, notifier);
        session.run_fill(&mut engine, &consumer, &changes, POLL);
        *engine.stats()
    })
}

#[test]
fn test_command_mid_fill_moves_later_samples_to_new_grid() {
    let session = Session::new();
    let sheet = SharedSheet::default();
    let notifier = SharedNotifier::default();
    let (producer, consumer) = sample_queue();
    let (change_tx, change_rx) = crossbeam_channel::unbounded();
    let fill = spawn_fill(&session, &sheet, &notifier, consumer, change_rx);

    change_tx
        .send(ChangeNotification::new("Sheet1", CellPos::new(1, 1), "Syclone 3"))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        sheet.get_value("Sheet1", CellPos::new(1, 1)).as_text().is_some()
    }));
    producer.push(decode_frame(1));
    assert!(wait_until(Duration::from_secs(5), || {
        sheet.get_value("Sheet1", CellPos::new(1, 2)).as_number().is_some()
    }));

    change_tx
        .send(ChangeNotification::new("Sheet1", CellPos::new(10, 1), "Syclone 2"))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        sheet.get_value("Sheet1", CellPos::new(10, 1)).as_text().is_some()
    }));
    for raw in [2, 3, 4] {
        producer.push(decode_frame(raw));
    }
    assert!(wait_until(Duration::from_secs(5), || {
        notifier.0.load(Ordering::SeqCst) == 1
    }));

    drop(change_tx);
    let stats = fill.join().unwrap();

    // The retired grid keeps its one sample and receives nothing more
    assert_eq!(
        sheet.get_value("Sheet1", CellPos::new(1, 2)).as_number(),
        Some(1.0 * 0.1 * 36.0)
    );
    assert!(sheet.get_value("Sheet1", CellPos::new(1, 3)).is_empty());
    assert!(sheet.get_value("Sheet1", CellPos::new(1, 4)).is_empty());
    assert_eq!(
        sheet.get_value("Sheet1", CellPos::new(10, 2)).as_number(),
        Some(2.0 * 0.1 * 36.0)
    );
    assert_eq!(
        sheet.get_value("Sheet1", CellPos::new(10, 3)).as_number(),
        Some(3.0 * 0.1 * 36.0)
    );
    assert_eq!(stats.grids_allocated, 2);
    assert_eq!(stats.grids_retired, 1);
    assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
}

#[test]
fn test_oversized_command_does_not_stop_fill_loop() {
    let session = Session::new();
    let sheet = SharedSheet::default();
    let notifier = SharedNotifier::default();
    let (producer, consumer) = sample_queue();
    let (change_tx, change_rx) = crossbeam_channel::unbounded();
    let fill = spawn_fill(&session, &sheet, &notifier, consumer, change_rx);

    change_tx
        .send(ChangeNotification::new("Sheet1", CellPos::new(1, 1), "Syclone 1000000x1000000"))
        .unwrap();
    change_tx
        .send(ChangeNotification::new("Sheet1", CellPos::new(2, 1), "Syclone 1"))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        sheet.get_value("Sheet1", CellPos::new(2, 1)).as_text().is_some()
    }));
    producer.push(decode_frame(5));
    assert!(wait_until(Duration::from_secs(5), || {
        notifier.0.load(Ordering::SeqCst) == 1
    }));

    drop(change_tx);
    let stats = fill.join().unwrap();

    assert!(sheet.get_value("Sheet1", CellPos::new(1, 1)).is_empty());
    assert_eq!(stats.commands_ignored, 1);
    assert_eq!(stats.grids_allocated, 1);
    assert_eq!(stats.samples_written, 1);
}
