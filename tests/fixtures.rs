#![allow(dead_code)]
use evt::message::MessageTableBuilder;
use evt::{
    CollectingPublisher, EngineSettings, EngineState, EventLogWriter, EventType,
    MemoryCheckpointStore, Registry, SourceRegistration, StopSignal, TailingEngine,
};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Once;

use tempfile::TempDir;

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
pub fn ensure_env_logger_initialized() {
    use std::io::Write;

    LOGGER_INIT.call_once(|| {
        let mut builder = env_logger::Builder::from_default_env();
        builder
            .format(|buf, record| writeln!(buf, "[{}] - {}", record.level(), record.args()))
            .init();
    });
}

/// A log store in a temporary directory.
pub struct TestStore {
    dir: TempDir,
    registry: Registry,
}

impl TestStore {
    pub fn new() -> TestStore {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path());
        TestStore { dir, registry }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Register `source` in `log` with an event message file list.
    pub fn install(&self, log: &str, source: &str, event_message_file: Option<String>) {
        self.registry
            .install_source(
                log,
                source,
                SourceRegistration {
                    event_message_file,
                    types_supported: 7,
                    ..SourceRegistration::default()
                },
            )
            .unwrap();
    }

    pub fn install_with(&self, log: &str, source: &str, registration: SourceRegistration) {
        self.registry.install_source(log, source, registration).unwrap();
    }

    /// Write a file into the store directory and return its path.
    pub fn file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, data).unwrap();
        path
    }

    pub fn writer(&self, source: &str) -> EventLogWriter {
        EventLogWriter::open(&self.registry, source)
            .unwrap()
            .with_computer_name("TESTHOST")
    }

    pub fn report(&self, source: &str, event_type: EventType, event_id: u32, strings: &[&str]) -> u32 {
        self.writer(source).report(event_type, event_id, strings).unwrap()
    }

    pub fn log_path(&self, log: &str) -> PathBuf {
        self.registry.log_path(log).unwrap()
    }
}

/// A raw `MESSAGE_RESOURCE_DATA` blob with UTF-16 entries.
pub fn message_table(messages: &[(u32, &str)]) -> Vec<u8> {
    messages
        .iter()
        .fold(MessageTableBuilder::new(), |builder, (id, text)| {
            builder.message(*id, *text)
        })
        .build()
}

const FILE_ALIGNMENT: usize = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const RSRC_RVA: u32 = 0x1000;
const PE_POINTER: usize = 0x40;

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Resource section with one `RT_MESSAGETABLE` resource (id 1) in each of the given languages.
fn resource_section(tables: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let n = tables.len();
    let root = 0;
    let type_dir = root + 16 + 8;
    let name_dir = type_dir + 16 + 8;
    let data_entries = name_dir + 16 + 8 * n;
    let mut data_offset = data_entries + 16 * n;

    let mut blob_offsets = Vec::with_capacity(n);
    for (_, data) in tables {
        blob_offsets.push(data_offset);
        data_offset = align(data_offset + data.len(), 4);
    }
    let mut rsrc = vec![0_u8; data_offset];

    // Root: one id entry, type 11 -> type directory.
    put_u16(&mut rsrc, root + 14, 1);
    put_u32(&mut rsrc, root + 16, 11);
    put_u32(&mut rsrc, root + 20, 0x8000_0000 | type_dir as u32);

    // Type directory: resource id 1 -> language directory.
    put_u16(&mut rsrc, type_dir + 14, 1);
    put_u32(&mut rsrc, type_dir + 16, 1);
    put_u32(&mut rsrc, type_dir + 20, 0x8000_0000 | name_dir as u32);

    // Language directory: one data entry per language.
    put_u16(&mut rsrc, name_dir + 14, n as u16);
    for (i, ((lang, data), blob)) in tables.iter().zip(&blob_offsets).enumerate() {
        let entry = name_dir + 16 + 8 * i;
        let data_entry = data_entries + 16 * i;
        put_u32(&mut rsrc, entry, *lang);
        put_u32(&mut rsrc, entry + 4, data_entry as u32);

        put_u32(&mut rsrc, data_entry, RSRC_RVA + *blob as u32);
        put_u32(&mut rsrc, data_entry + 4, data.len() as u32);
        rsrc[*blob..*blob + data.len()].copy_from_slice(data);
    }
    rsrc
}

/// A minimal PE32 DLL whose only content is a `.rsrc` section with message tables.
pub fn message_dll(tables: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let rsrc = resource_section(tables);
    let raw_size = align(rsrc.len(), FILE_ALIGNMENT);
    let mut pe = vec![0_u8; FILE_ALIGNMENT + raw_size];

    // DOS header.
    pe[0..2].copy_from_slice(b"MZ");
    put_u32(&mut pe, 0x3c, PE_POINTER as u32);
    pe[PE_POINTER..PE_POINTER + 4].copy_from_slice(b"PE\0\0");

    // COFF header.
    let coff = PE_POINTER + 4;
    put_u16(&mut pe, coff, 0x14c);
    put_u16(&mut pe, coff + 2, 1);
    put_u16(&mut pe, coff + 16, 0xe0);
    put_u16(&mut pe, coff + 18, 0x2102);

    // Optional header (PE32).
    let opt = coff + 20;
    put_u16(&mut pe, opt, 0x10b);
    put_u32(&mut pe, opt + 28, 0x1000_0000);
    put_u32(&mut pe, opt + 32, SECTION_ALIGNMENT);
    put_u32(&mut pe, opt + 36, FILE_ALIGNMENT as u32);
    put_u16(&mut pe, opt + 40, 6);
    put_u16(&mut pe, opt + 48, 6);
    put_u32(
        &mut pe,
        opt + 56,
        RSRC_RVA + align(rsrc.len(), SECTION_ALIGNMENT as usize) as u32,
    );
    put_u32(&mut pe, opt + 60, FILE_ALIGNMENT as u32);
    put_u16(&mut pe, opt + 68, 2);
    put_u32(&mut pe, opt + 92, 16);
    // Data directory 2: resources.
    let data_dirs = opt + 96;
    put_u32(&mut pe, data_dirs + 2 * 8, RSRC_RVA);
    put_u32(&mut pe, data_dirs + 2 * 8 + 4, rsrc.len() as u32);

    // Section table.
    let section = opt + 0xe0;
    pe[section..section + 5].copy_from_slice(b".rsrc");
    put_u32(&mut pe, section + 8, rsrc.len() as u32);
    put_u32(&mut pe, section + 12, RSRC_RVA);
    put_u32(&mut pe, section + 16, raw_size as u32);
    put_u32(&mut pe, section + 20, FILE_ALIGNMENT as u32);
    put_u32(&mut pe, section + 36, 0x4000_0040);

    pe[FILE_ALIGNMENT..FILE_ALIGNMENT + rsrc.len()].copy_from_slice(&rsrc);
    pe
}

/// Run an engine over `provider` until it has caught up and return what it published.
pub fn drain(registry: Registry, provider: &str, settings: EngineSettings) -> CollectingPublisher {
    let mut engine = TailingEngine::new(
        registry,
        provider,
        settings,
        CollectingPublisher::default(),
        MemoryCheckpointStore::new(),
    );
    let stop = StopSignal::never();
    engine.start();
    loop {
        match engine.step(&stop).unwrap() {
            EngineState::Waiting | EngineState::Idle => break,
            _ => {}
        }
    }
    engine.into_publisher()
}
