//! Record-stream behavior against a stand-in depot client binary.

#![cfg(unix)]

use std::io::Write;
use std::os::unix::fs::PermissionsExt;

use depotsync::p4::marshal::{write_record, Record};
use depotsync::p4::P4;

/// A fake client that floods stdout with far more records than the pipe
/// buffer holds. If the reader stops early without stopping the child,
/// waiting on it never returns.
fn flooding_client(dir: &std::path::Path) -> std::path::PathBuf {
    let mut payload = Vec::new();
    let record = Record::from_pairs(&[("code", "stat"), ("depotFile", "//depot/main/a.rs")]);
    for _ in 0..20_000 {
        write_record(&mut payload, &record);
    }
    let data = dir.join("records.bin");
    std::fs::write(&data, &payload).unwrap();

    let script = dir.join("fake-p4");
    let mut file = std::fs::File::create(&script).unwrap();
    writeln!(file, "#!/bin/sh\nexec cat '{}'", data.display()).unwrap();
    drop(file);
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

#[test]
fn callback_error_surfaces_instead_of_hanging() {
    let dir = tempfile::tempdir().unwrap();
    let script = flooding_client(dir.path());

    std::env::set_var("DEPOTSYNC_P4_BIN", &script);
    let p4 = P4::new();
    std::env::remove_var("DEPOTSYNC_P4_BIN");

    let mut seen = 0u32;
    let err = p4
        .stream_records(&["print"], None, &mut |_record| {
            seen += 1;
            anyhow::bail!("unexpected record")
        })
        .unwrap_err();
    assert_eq!(seen, 1);
    assert!(err.to_string().contains("unexpected record"));
}
