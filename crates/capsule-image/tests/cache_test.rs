//! Concurrency tests for the shared image layer cache.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::fs::File;
use std::sync::{Arc, Barrier};

use capsule_common::config::Layout;
use capsule_image::ImageStore;

fn write_image(layout: &Layout, name: &str, files: usize) {
    std::fs::create_dir_all(layout.image_dir()).expect("mkdir");
    let file = File::create(layout.image_archive(name)).expect("create archive");
    let mut builder = tar::Builder::new(file);
    for i in 0..files {
        let data = format!("file {i}\n");
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("data/{i}.txt"), data.as_bytes())
            .expect("append");
    }
    builder.finish().expect("finish");
}

fn snapshot(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<_> = std::fs::read_dir(dir.join("data"))
        .expect("read_dir")
        .map(|e| {
            let e = e.expect("entry");
            (
                e.file_name().to_string_lossy().into_owned(),
                std::fs::read(e.path()).expect("read"),
            )
        })
        .collect();
    out.sort();
    out
}

#[test]
fn concurrent_first_use_extracts_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    write_image(&layout, "base", 200);
    let store = Arc::new(ImageStore::new(layout));

    let workers = 8;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let _ = barrier.wait();
                store.materialize("base").expect("materialize")
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("thread"))
        .collect();
    assert_eq!(results.iter().filter(|m| m.extracted).count(), 1);
    assert!(results.windows(2).all(|w| w[0].path == w[1].path));
    assert_eq!(snapshot(&results[0].path).len(), 200);
}

#[test]
fn repeated_materialize_leaves_cache_identical() {
    let dir = tempfile::tempdir().expect("tempdir");
    let layout = Layout::new(dir.path());
    write_image(&layout, "base", 5);
    let store = ImageStore::new(layout);

    let first = store.materialize("base").expect("first");
    let before = snapshot(&first.path);
    let second = store.materialize("base").expect("second");
    assert_eq!(before, snapshot(&second.path));
}
