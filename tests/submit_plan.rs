//! From raw diff-tree output to a workspace operation plan and a
//! changelist form.

use depotsync::git::parse_diff_tree;
use depotsync::p4::marshal::Record;
use depotsync::submit::{plan_from_diff, render_changelist_form, split_message, PlannedOp};

const SHA_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SHA_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

fn diff_line(src_mode: &str, dst_mode: &str, status: &str, paths: &str) -> String {
    format!(":{src_mode} {dst_mode} {SHA_A} {SHA_B} {status}\t{paths}")
}

#[test]
fn diff_to_plan_pipeline() {
    let raw = [
        diff_line("100644", "100644", "M", "src/lib.rs"),
        diff_line("000000", "100755", "A", "tools/gen.sh"),
        diff_line("100644", "000000", "D", "docs/old.md"),
        format!(":100644 100644 {SHA_A} {SHA_B} R100\tsrc/a.rs\tsrc/b.rs"),
    ]
    .join("\n");

    let entries = parse_diff_tree(&raw).unwrap();
    let plan = plan_from_diff(&entries).unwrap();
    assert_eq!(plan.len(), 4);
    assert_eq!(
        plan[0],
        PlannedOp::Edit {
            path: "src/lib.rs".to_string(),
            exec: None
        }
    );
    assert_eq!(
        plan[1],
        PlannedOp::Add {
            path: "tools/gen.sh".to_string(),
            exec: true
        }
    );
    assert_eq!(
        plan[2],
        PlannedOp::Delete {
            path: "docs/old.md".to_string()
        }
    );
    assert_eq!(
        plan[3],
        PlannedOp::Integrate {
            src: "src/a.rs".to_string(),
            dst: "src/b.rs".to_string(),
            rename: true,
            needs_edit: false,
            exec: None
        }
    );
}

#[test]
fn copy_with_divergent_content_needs_edit() {
    let raw = format!(":100644 100755 {SHA_A} {SHA_B} C073\tsrc/a.rs\tsrc/a_v2.rs");
    let entries = parse_diff_tree(&raw).unwrap();
    let plan = plan_from_diff(&entries).unwrap();
    assert_eq!(
        plan[0],
        PlannedOp::Integrate {
            src: "src/a.rs".to_string(),
            dst: "src/a_v2.rs".to_string(),
            rename: false,
            needs_edit: true,
            exec: Some(true)
        }
    );
}

#[test]
fn exec_bit_flip_is_tracked_on_edit() {
    let raw = diff_line("100755", "100644", "M", "tools/run.sh");
    let entries = parse_diff_tree(&raw).unwrap();
    let plan = plan_from_diff(&entries).unwrap();
    assert_eq!(
        plan[0],
        PlannedOp::Edit {
            path: "tools/run.sh".to_string(),
            exec: Some(false)
        }
    );
}

#[test]
fn commit_message_to_changelist_form() {
    let message = "\
Teach the parser about widgets

More detail on the widget grammar.

Jobs: JOB-7

[depotsync: depot-paths = \"//depot/main/\": change = 1042]
";
    let (description, jobs) = split_message(message);
    assert!(!description.contains("depotsync:"));
    assert!(!description.contains("Jobs:"));
    assert_eq!(jobs, vec!["JOB-7"]);

    let blank = Record::from_pairs(&[
        ("Change", "new"),
        ("Client", "alice-ws"),
        ("User", "alice"),
        ("Files0", "//depot/main/src/lib.rs"),
        ("Files1", "//depot/main/tools/gen.sh"),
        ("Files2", "//other/tree/file.c"),
    ]);
    let form = render_changelist_form(
        &blank,
        &["//depot/main/".to_string()],
        &description,
        &jobs,
        None,
    );
    assert!(form.contains("Description:\n\tTeach the parser about widgets\n"));
    assert!(form.contains("\tMore detail on the widget grammar.\n"));
    assert!(form.contains("Jobs:\n\tJOB-7\n"));
    assert!(form.contains("\t//depot/main/src/lib.rs\n"));
    assert!(form.contains("\t//depot/main/tools/gen.sh\n"));
    assert!(!form.contains("//other/tree/file.c"));
}
