//! End-to-end shape of the fast-import byte stream, captured in memory.

use depotsync::git::{parse_provenance, provenance_trailer};
use depotsync::import::{
    compose_message, file_mode, normalize_symlink_target, strip_keywords, write_commit_header,
    write_delete, write_file_entry, write_tag,
};
use depotsync::largefile::{LargeFilePolicy, LargeFileStore, Pointer};
use depotsync::models::{ChangeRecord, FileType, KeywordMode};

fn sample_record() -> ChangeRecord {
    ChangeRecord {
        id: 1042,
        author: "alice".to_string(),
        timestamp: 1_700_000_000,
        description: "Teach the parser about widgets\n".to_string(),
        files: Vec::new(),
        jobs: vec!["JOB-7".to_string()],
    }
}

#[test]
fn full_commit_stream_shape() {
    let record = sample_record();
    let depot_paths = vec!["//depot/main/".to_string()];
    let message = compose_message(&record, &depot_paths, true);

    let mut sink: Vec<u8> = Vec::new();
    write_commit_header(
        &mut sink,
        "refs/remotes/p4/master",
        "Alice Doe <alice@example.com>",
        record.timestamp,
        &message,
        None,
        None,
    )
    .unwrap();
    write_delete(&mut sink, "src/obsolete.rs").unwrap();
    write_file_entry(&mut sink, "100644", "src/widget.rs", b"pub struct Widget;\n").unwrap();

    let text = String::from_utf8(sink).unwrap();
    assert!(text.starts_with("commit refs/remotes/p4/master\n"));
    assert!(text.contains("committer Alice Doe <alice@example.com> 1700000000 "));
    assert!(text.contains("D src/obsolete.rs\n"));
    assert!(text.contains("M 100644 inline src/widget.rs\ndata 19\npub struct Widget;\n"));

    // The embedded message round-trips through the provenance parser.
    let (paths, change) = parse_provenance(&message).unwrap();
    assert_eq!(paths, depot_paths);
    assert_eq!(change, 1042);
}

#[test]
fn message_trailer_matches_generator() {
    let record = sample_record();
    let depot_paths = vec!["//depot/main/".to_string(), "//depot/lib/".to_string()];
    let message = compose_message(&record, &depot_paths, true);
    assert!(message.ends_with(&format!("{}\n", provenance_trailer(&depot_paths, 1042))));
    assert!(message.contains("Jobs: JOB-7\n"));
}

#[test]
fn tag_pins_the_ref_the_change_was_committed_to() {
    let mut sink: Vec<u8> = Vec::new();
    write_tag(
        &mut sink,
        "release-1.0",
        "refs/remotes/p4/branch1",
        "Alice Doe <alice@example.com>",
        1_700_000_000,
        "first release\n",
    )
    .unwrap();
    let text = String::from_utf8(sink).unwrap();
    assert!(text.starts_with("tag release-1.0\nfrom refs/remotes/p4/branch1\n"));
    assert!(text.contains("tagger Alice Doe <alice@example.com> 1700000000 "));
    assert!(text.contains("data 13\nfirst release"));
}

#[test]
fn keyword_stripping_preserves_surroundings() {
    let input = b"before $Id: //depot/a#1 $ middle $Author: alice $ after";
    let full = strip_keywords(input, KeywordMode::Full);
    assert_eq!(&full[..], b"before $Id$ middle $Author$ after" as &[u8]);

    let id_only = strip_keywords(input, KeywordMode::IdOnly);
    assert_eq!(
        &id_only[..],
        b"before $Id$ middle $Author: alice $ after" as &[u8]
    );

    let untouched = strip_keywords(input, KeywordMode::None);
    assert_eq!(&untouched[..], &input[..]);
}

#[test]
fn keyword_stripping_handles_binary_content() {
    let mut input = vec![0u8, 159, 146, 150];
    input.extend_from_slice(b"$Change: 9 $");
    input.push(0xFF);
    let output = strip_keywords(&input, KeywordMode::Full);
    let mut expected = vec![0u8, 159, 146, 150];
    expected.extend_from_slice(b"$Change$");
    expected.push(0xFF);
    assert_eq!(output, expected);
}

#[test]
fn symlink_modes_and_targets() {
    let link = FileType::parse("symlink").unwrap();
    assert_eq!(file_mode(&link), "120000");
    assert_eq!(
        normalize_symlink_target(b"../lib/libfoo.so\n".to_vec()),
        Some(b"../lib/libfoo.so".to_vec())
    );
}

#[test]
fn offloaded_file_streams_as_pointer() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = LargeFileStore::new(
        LargeFilePolicy {
            threshold: Some(4),
            ..Default::default()
        },
        dir.path().to_path_buf(),
    );
    let payload = b"0123456789";
    assert!(store.should_offload("assets/blob.bin", payload).unwrap());
    let pointer = store.ingest("assets/blob.bin", payload).unwrap();

    let mut sink: Vec<u8> = Vec::new();
    write_file_entry(&mut sink, "100644", "assets/blob.bin", &pointer.to_bytes()).unwrap();
    let text = String::from_utf8(sink).unwrap();
    assert!(text.contains("M 100644 inline assets/blob.bin\n"));
    assert!(text.contains("oid blake3:"));
    assert!(text.contains("size 10\n"));

    // The pointer inside the stream resolves back to the stored bytes.
    let data_start = text.find("version ").unwrap();
    let parsed = Pointer::parse(text[data_start..].trim_end().as_bytes()).unwrap();
    assert_eq!(store.fetch(&parsed).unwrap(), payload);
}
