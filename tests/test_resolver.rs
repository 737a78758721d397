mod fixtures;

use fixtures::*;

use evt::message::LANG_EN_US;
use evt::{EngineSettings, EventType, ResolutionStatus, Session, SourceRegistration};
use pretty_assertions::assert_eq;

const SOURCE: &str = "EvtTest";

fn store_with_messages(messages: &[(u32, &str)]) -> TestStore {
    let store = TestStore::new();
    let table = store.file("evttest.bin", &message_table(messages));
    store.install("Application", SOURCE, Some(table.display().to_string()));
    store
}

#[test]
fn test_every_event_type_is_rendered() {
    ensure_env_logger_initialized();
    let store = store_with_messages(&[(1, "Test %1 message.\r\n")]);

    for event_type in EventType::ALL {
        store.report(SOURCE, event_type, 1, &[event_type.as_str()]);
    }

    let published = drain(store.registry(), "Application", EngineSettings::new());
    assert_eq!(published.events.len(), 6);
    for (event, event_type) in published.events.iter().zip(EventType::ALL) {
        assert_eq!(event.event_type, event_type);
        assert_eq!(event.message, format!("Test {} message.", event_type.as_str()));
        assert_eq!(event.source_name, SOURCE);
        assert_eq!(event.computer_name, "TESTHOST");
        assert!(event.resolved_file().is_some());
    }
}

#[test]
fn test_unknown_event_id_falls_back() {
    let store = store_with_messages(&[(1, "Test %1 message.")]);
    store.report(SOURCE, EventType::Error, 42, &["first", "second"]);

    let published = drain(store.registry(), "Application", EngineSettings::new());
    let event = &published.events[0];
    assert_eq!(event.resolution, ResolutionStatus::Fallback);
    assert_eq!(
        event.message,
        "The description for Event ID (42) in Source (EvtTest) cannot be found. \
         The local computer may not have the necessary registry information or message DLL files \
         to display messages from a remote computer. \
         The following information is part of the event: first, second"
    );
}

#[test]
fn test_later_message_files_are_searched() {
    let store = TestStore::new();
    let a = store.file("a.bin", &message_table(&[(1, "from a")]));
    let b = store.file("b.bin", &message_table(&[(1, "shadowed"), (2, "from b: %1")]));
    store.install(
        "Application",
        SOURCE,
        Some(format!("{};{}", a.display(), b.display())),
    );

    store.report(SOURCE, EventType::Info, 1, &[]);
    store.report(SOURCE, EventType::Info, 2, &["x"]);

    let published = drain(store.registry(), SOURCE, EngineSettings::new());
    let messages: Vec<&str> = published.events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["from a", "from b: x"]);
    assert_eq!(published.events[0].resolved_file(), Some(&a));
    assert_eq!(published.events[1].resolved_file(), Some(&b));
}

#[test]
fn test_qualified_event_id_with_several_inserts() {
    let store = TestStore::new();
    let table = store.file(
        "netevent.bin",
        &message_table(&[(1073748860, "The %1 service entered the %2 state.%n")]),
    );
    store.install("System", "Service Control Manager", Some(table.display().to_string()));

    store.report(
        "Service Control Manager",
        EventType::Info,
        1073748860,
        &["Windows Update", "running"],
    );

    let published = drain(store.registry(), "System", EngineSettings::new());
    let event = &published.events[0];
    assert_eq!(event.event_id, 1073748860);
    assert_eq!(event.event_code(), 7036);
    assert_eq!(event.message, "The Windows Update service entered the running state.");
}

#[test]
fn test_unregistered_provider_reads_application() {
    let store = store_with_messages(&[(1, "hello %1")]);
    store.report(SOURCE, EventType::Warning, 1, &["world"]);

    let session = Session::open(&store.registry(), "No Such Provider", 0).unwrap();
    assert!(session.is_fallback());
    assert_eq!(session.log_name(), "Application");

    let published = drain(store.registry(), "No Such Provider", EngineSettings::new());
    assert_eq!(published.events.len(), 1);
    assert_eq!(published.events[0].log_name, "Application");
    assert_eq!(published.events[0].message, "hello world");
}

#[test]
fn test_clear_restarts_numbering() {
    let store = store_with_messages(&[(1, "hello %1")]);
    for _ in 0..3 {
        store.report(SOURCE, EventType::Info, 1, &["x"]);
    }

    let mut session = Session::open(&store.registry(), "Application", 0).unwrap();
    assert_eq!(session.record_count().unwrap(), 3);
    let backup = store.root().join("backup.evt");
    session.clear(Some(&backup)).unwrap();
    assert!(backup.exists());
    assert_eq!(session.record_count().unwrap(), 0);

    assert_eq!(store.report(SOURCE, EventType::Info, 1, &["y"]), 1);
    let batch = session.read_batch().unwrap();
    assert_eq!(batch.records.len(), 1);
    assert_eq!(batch.records[0].record_number, 1);
    assert_eq!(batch.records[0].parameters, vec!["y"]);
}

#[test]
fn test_message_dll_languages() {
    let store = TestStore::new();
    let dll = store.file(
        "messages.dll",
        &message_dll(&[
            (0x0407, message_table(&[(100, "Hallo %1")])),
            (LANG_EN_US, message_table(&[(100, "Hello %1"), (101, "Only English")])),
        ]),
    );
    store.install("Application", SOURCE, Some(dll.display().to_string()));
    store.report(SOURCE, EventType::Info, 100, &["Welt"]);
    store.report(SOURCE, EventType::Info, 101, &[]);

    let german = drain(
        store.registry(),
        SOURCE,
        EngineSettings::new().language_id(0x0407),
    );
    assert_eq!(german.events[0].message, "Hallo Welt");
    assert_eq!(german.events[1].message, "Only English");

    let neutral = drain(store.registry(), SOURCE, EngineSettings::new());
    assert_eq!(neutral.events[0].message, "Hello Welt");
}

#[test]
fn test_parameter_and_category_message_files() {
    let store = TestStore::new();
    let events = store.file("events.bin", &message_table(&[(10, "Access was %1.")]));
    let params = store.file("params.bin", &message_table(&[(5000, "denied\r\n")]));
    let categories = store.file("categories.bin", &message_table(&[(3, "Disk\r\n")]));
    store.install_with(
        "Application",
        SOURCE,
        SourceRegistration {
            event_message_file: Some(events.display().to_string()),
            parameter_message_file: Some(params.display().to_string()),
            category_message_file: Some(categories.display().to_string()),
            category_count: 3,
            types_supported: 7,
        },
    );

    store
        .writer(SOURCE)
        .report_with(EventType::AuditFailure, 3, 10, None, &["%%5000"], &[1, 2, 3])
        .unwrap();

    let published = drain(store.registry(), SOURCE, EngineSettings::new());
    let event = &published.events[0];
    assert_eq!(event.message, "Access was denied.");
    assert_eq!(event.category.as_deref(), Some("Disk"));
    assert_eq!(event.parameters, vec!["%%5000"]);
    assert_eq!(event.raw_data, vec![1, 2, 3]);
}

#[test]
fn test_missing_message_file_falls_back() {
    let store = TestStore::new();
    store.install("Application", SOURCE, Some("%SystemRoot%\\missing.dll".to_string()));
    store.report(SOURCE, EventType::Info, 7, &["a"]);

    let published = drain(store.registry(), SOURCE, EngineSettings::new());
    assert_eq!(published.events[0].resolution, ResolutionStatus::Fallback);
    assert!(published.events[0].message.ends_with("part of the event: a"));
}
