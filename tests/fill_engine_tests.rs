use chrono::NaiveDate;
use syclone::engine::{DiscardReason, FillOutcome};
use syclone::packet::{decode, encode_frame};
use syclone::*;

#[derive(Debug, Default)]
struct CountingNotifier {
    fired: u32,
}

impl CompletionNotifier for CountingNotifier {
    fn notify_complete(&mut self) {
        self.fired += 1;
    }
}

fn engine() -> FillEngine<MemorySheet, CountingNotifier> {
    let stamp = NaiveDate::from_ymd_opt(2025, 3, 14)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap();
    FillEngine::new(
        CommandParser::new("Syclone").unwrap(),
        MemorySheet::new(),
        CountingNotifier::default(),
    )
    .with_clock(move || stamp)
}

fn sample(raw: u32) -> Sample {
    let ts = SensorTimestamp {
        year: 2025,
        month: 3,
        day: 14,
        hour: 9,
        minute: 30,
        second: 0,
    };
    decode(encode_frame(raw, &ts).as_bytes()).unwrap()
}

fn dose(raw: u32) -> f64 {
    f64::from(raw) * 0.1 * 36.0
}

fn edit(row: u32, col: u32, text: &str) -> ChangeNotification {
    ChangeNotification::new("Sheet1", CellPos::new(row, col), text)
}

#[test]
fn test_samples_without_grid_are_discarded() {
    let mut engine = engine();
    assert_eq!(
        engine.on_sample(&sample(1)),
        FillOutcome::Discarded(DiscardReason::NoGrid)
    );
    assert_eq!(engine.stats().samples_discarded, 1);
    assert_eq!(engine.sink().writes(), 0);
}

#[test]
fn test_single_row_capture_fills_and_completes_once() {
    let mut engine = engine();
    let grid = engine.handle_change(&edit(2, 1, "Syclone 3")).unwrap();
    assert_eq!(grid.positions().len(), 3);

    assert_eq!(engine.on_sample(&sample(10)), FillOutcome::Written(CellPos::new(2, 2)));
    assert_eq!(engine.on_sample(&sample(20)), FillOutcome::Written(CellPos::new(2, 3)));
    assert_eq!(engine.on_sample(&sample(30)), FillOutcome::Completed(CellPos::new(2, 4)));
    assert_eq!(engine.notifier().fired, 1);

    // Extra samples are dropped and never re-fire completion
    assert_eq!(
        engine.on_sample(&sample(40)),
        FillOutcome::Discarded(DiscardReason::GridFull)
    );
    assert_eq!(engine.notifier().fired, 1);

    let sheet = engine.sink();
    assert_eq!(
        sheet.get_value("Sheet1", CellPos::new(2, 1)),
        CellValue::Text("2025-03-14 09:30:00".into())
    );
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(2, 2)), CellValue::Number(dose(10)));
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(2, 3)), CellValue::Number(dose(20)));
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(2, 4)), CellValue::Number(dose(30)));
    assert!(sheet.get_value("Sheet1", CellPos::new(2, 5)).is_empty());

    let stats = engine.stats();
    assert_eq!(stats.samples_written, 3);
    assert_eq!(stats.samples_discarded, 1);
    assert_eq!(stats.grids_completed, 1);
}

#[test]
fn test_grid_capture_fills_row_major_from_anchor() {
    let mut engine = engine();
    engine.handle_change(&edit(1, 1, "Syclone 2x2"));

    // Command text is consumed; the anchor is the first target
    assert!(engine.sink().get_value("Sheet1", CellPos::new(1, 1)).is_empty());

    for raw in 1..=4 {
        engine.on_sample(&sample(raw));
    }

    let sheet = engine.sink();
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(1, 1)).as_number(), Some(dose(1)));
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(1, 2)).as_number(), Some(dose(2)));
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(2, 1)).as_number(), Some(dose(3)));
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(2, 2)).as_number(), Some(dose(4)));
    assert!(engine.active_grid().unwrap().is_complete());
    assert_eq!(engine.notifier().fired, 1);
}

#[test]
fn test_non_command_edits_have_no_effect() {
    let mut engine = engine();
    for text in ["12.5", "Syclone 0", "Syclone abc", "notes"] {
        assert!(engine.handle_change(&edit(3, 3, text)).is_none());
    }
    assert!(engine.active_grid().is_none());
    assert_eq!(engine.sink().writes(), 0);
    assert_eq!(engine.stats().grids_allocated, 0);
}

#[test]
fn test_new_command_replaces_active_grid() {
    let mut engine = engine();
    engine.handle_change(&edit(1, 1, "Syclone 3"));
    engine.on_sample(&sample(1));

    let second = engine.handle_change(&edit(10, 1, "Syclone 1")).unwrap();
    assert_eq!(second.anchor(), CellPos::new(10, 1));

    assert_eq!(engine.on_sample(&sample(2)), FillOutcome::Completed(CellPos::new(10, 2)));
    assert_eq!(engine.stats().grids_retired, 1);

    // The abandoned grid keeps what it had and gets nothing more
    let sheet = engine.sink();
    assert_eq!(sheet.get_value("Sheet1", CellPos::new(1, 2)).as_number(), Some(dose(1)));
    assert!(sheet.get_value("Sheet1", CellPos::new(1, 3)).is_empty());
}

#[test]
fn test_repeating_the_same_command_starts_an_independent_grid() {
    let mut engine = engine();
    engine.handle_change(&edit(1, 1, "Syclone 1"));
    engine.on_sample(&sample(5));
    let first_id = engine.active_grid().unwrap().id();

    engine.handle_change(&edit(1, 1, "Syclone 1"));
    let grid = engine.active_grid().unwrap();
    assert_ne!(grid.id(), first_id);
    assert!(!grid.is_complete());
    assert!(engine.sink().get_value("Sheet1", CellPos::new(1, 2)).is_empty());

    engine.on_sample(&sample(6));
    assert_eq!(engine.notifier().fired, 2);
    assert_eq!(
        engine.sink().get_value("Sheet1", CellPos::new(1, 2)).as_number(),
        Some(dose(6))
    );
}

#[test]
fn test_samples_land_on_the_command_sheet() {
    let mut engine = engine();
    engine.handle_change(&ChangeNotification::new("Run 7", CellPos::new(4, 4), "Syclone 1x1"));
    engine.on_sample(&sample(9));

    assert_eq!(
        engine.sink().get_value("Run 7", CellPos::new(4, 4)).as_number(),
        Some(dose(9))
    );
    assert!(engine.sink().get_value("Sheet1", CellPos::new(4, 4)).is_empty());
}

#[test]
fn test_drain_applies_queued_samples_in_order() {
    let mut engine = engine();
    engine.handle_change(&edit(1, 1, "Syclone 1x3"));

    let (producer, consumer) = sample_queue();
    for raw in [7, 8, 9] {
        assert!(producer.push(sample(raw)));
    }

    assert_eq!(engine.drain(&consumer), 3);
    assert!(consumer.is_empty());
    let values: Vec<f64> = (1..=3)
        .filter_map(|col| engine.sink().get_value("Sheet1", CellPos::new(1, col)).as_number())
        .collect();
    assert_eq!(values, vec![dose(7), dose(8), dose(9)]);
}

#[test]
fn test_oversized_commands_are_ignored() {
    let mut engine = engine();
    engine.handle_change(&edit(1, 1, "Syclone 2"));
    let active = engine.active_grid().unwrap().id();
    let writes = engine.sink().writes();

    for text in ["Syclone 1000000x1000000", "Syclone 4000000000", "Syclone 1048576x16384"] {
        assert!(engine.handle_change(&edit(5, 5, text)).is_none(), "{text:?}");
    }

    // Nothing written, and the capture in progress is untouched
    assert_eq!(engine.sink().writes(), writes);
    assert_eq!(engine.active_grid().unwrap().id(), active);
    assert_eq!(engine.stats().commands_ignored, 3);
    assert_eq!(engine.stats().grids_allocated, 1);
    assert_eq!(engine.on_sample(&sample(1)), FillOutcome::Written(CellPos::new(1, 2)));
}

#[test]
fn test_max_targets_limits_command_size() {
    let mut engine = engine().with_max_targets(4);
    assert!(engine.handle_change(&edit(1, 1, "Syclone 5")).is_none());
    assert!(engine.handle_change(&edit(1, 1, "Syclone 2x2")).is_some());
    assert_eq!(engine.stats().commands_ignored, 1);
}
