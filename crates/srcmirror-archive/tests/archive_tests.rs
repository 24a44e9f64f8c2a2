//! End-to-end archive behavior over real files: a generator-backed
//! archive hosted behind the task manager, driven the way a monitor
//! drives it.

use srcmirror_archive::generator::Generator;
use srcmirror_archive::{Archive, GeneratorStore, LastModifiedStore};
use srcmirror_core::events::{FileEvent, FileEventKind};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use parking_lot::Mutex;
use tempfile::TempDir;

struct CopyGenerator {
    extensions: Vec<String>,
}

impl CopyGenerator {
    fn new() -> Self {
        Self {
            extensions: vec![".c".to_string(), ".cpp".to_string(), ".h".to_string()],
        }
    }
}

impl Generator for CopyGenerator {
    fn generate(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
        let body = fs::read_to_string(input)?;
        fs::write(output, format!("SRC:{}\n{body}", input.display()))?;
        Ok(())
    }

    fn supported_extensions(&self) -> &[String] {
        &self.extensions
    }

    fn embedded_source_path(&self, artifact: &Path) -> Option<PathBuf> {
        let file = fs::File::open(artifact).ok()?;
        let mut first = String::new();
        BufReader::new(file).read_line(&mut first).ok()?;
        first.trim_end().strip_prefix("SRC:").map(PathBuf::from)
    }
}

fn generator_archive(archive_dir: &Path) -> Archive {
    let store = GeneratorStore::new(archive_dir, "xml", true, Arc::new(CopyGenerator::new()))
        .expect("open generator store");
    Archive::new(Arc::new(store))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_async_mutations_emit_ordered_events() {
    let src_dir = TempDir::new().unwrap();
    let arc_dir = TempDir::new().unwrap();
    let archive = generator_archive(arc_dir.path());

    let events: Arc<Mutex<Vec<FileEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _sub = archive.on_file_changed(move |event| sink.lock().push(event.clone()));

    let mut sources = Vec::new();
    for i in 0..6 {
        let path = src_dir.path().join(format!("file{i}.c"));
        fs::write(&path, format!("body {i}")).unwrap();
        sources.push(path);
    }

    let mut handles = Vec::new();
    for source in &sources {
        handles.push(archive.add_or_update_file_async(source));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let events = events.lock();
    assert_eq!(events.len(), sources.len());
    for (event, source) in events.iter().zip(&sources) {
        assert_eq!(event.kind, FileEventKind::Added);
        assert_eq!(&event.path, source);
    }
    for source in &sources {
        assert!(archive.contains(source));
        assert!(!archive.is_outdated(source).unwrap());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_archive_survives_restart() {
    let src_dir = TempDir::new().unwrap();
    let arc_dir = TempDir::new().unwrap();
    let source = src_dir.path().join("persist.c");
    fs::write(&source, "persisted body").unwrap();

    {
        let archive = generator_archive(arc_dir.path());
        archive.add_or_update_file(&source).unwrap();
        archive.shutdown().unwrap();
    }

    let store = GeneratorStore::new(arc_dir.path(), "xml", true, Arc::new(CopyGenerator::new()))
        .expect("reopen generator store");
    let archive = Archive::new(Arc::new(store));
    assert!(archive.contains(&source));
    assert!(!archive.is_outdated(&source).unwrap());
    assert_eq!(archive.files(), vec![source.clone()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_and_rename_through_host() {
    let src_dir = TempDir::new().unwrap();
    let arc_dir = TempDir::new().unwrap();
    let archive = generator_archive(arc_dir.path());

    let old = src_dir.path().join("old.c");
    fs::write(&old, "body").unwrap();
    archive.add_or_update_file(&old).unwrap();

    let new = src_dir.path().join("new.c");
    fs::rename(&old, &new).unwrap();
    archive.rename_file(&old, &new).unwrap();
    assert!(!archive.contains(&old));
    assert!(archive.contains(&new));

    archive.delete_file(&new).unwrap();
    assert!(!archive.contains(&new));
    assert!(archive.files().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timestamp_archive_through_host() {
    let src_dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let source = src_dir.path().join("watched.c");
    fs::write(&source, "body").unwrap();

    let store = LastModifiedStore::new(state_dir.path().join("lastmodifiedmap.txt")).unwrap();
    let archive = Archive::new(Arc::new(store));

    assert!(archive.is_outdated(&source).unwrap());
    archive.add_or_update_file(&source).unwrap();
    assert!(!archive.is_outdated(&source).unwrap());

    filetime::set_file_mtime(&source, filetime::FileTime::from_unix_time(4_000_000_000, 0))
        .unwrap();
    assert!(archive.is_outdated(&source).unwrap());
    archive.shutdown().unwrap();
}
