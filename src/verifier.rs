//! External-boundary helper: confirms, after supervised termination, that no
//! process tagged with a given marker remains in the OS process table.
//!
//! Matching requires both a known payload marker and the caller's tag, not
//! the tag alone — an unrelated process that happens to carry the tag
//! substring in its own argv (or a different concurrent run's process)
//! must not be counted as a survivor of this run's tree.

use sysinfo::System;

/// Substring every `treekill-payload` invocation carries in its own
/// argv[0]/process name, used to narrow matches down from "any process
/// whose command line contains the tag" to "a payload process tagged with
/// it".
const PAYLOAD_MARKER: &str = "treekill-payload";

pub struct VerifierProbe;

impl VerifierProbe {
    /// Number of live payload processes whose command line contains `tag`.
    pub fn count_by_tag(tag: &str) -> usize {
        let mut system = System::new_all();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        system
            .processes()
            .values()
            .filter(|process| is_tagged_payload(process, tag))
            .count()
    }

    /// Cheaper than `count_by_tag(tag) > 0`: stops at the first match.
    pub fn any_left(tag: &str) -> bool {
        let mut system = System::new_all();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        system
            .processes()
            .values()
            .any(|process| is_tagged_payload(process, tag))
    }
}

fn is_tagged_payload(process: &sysinfo::Process, tag: &str) -> bool {
    is_payload_marker(process) && cmdline_contains(process, tag)
}

/// `process.name()` can be truncated on some platforms, so also check
/// argv[0] (the invoked path) before concluding this isn't a payload
/// process.
fn is_payload_marker(process: &sysinfo::Process) -> bool {
    if process.name().to_string_lossy().contains(PAYLOAD_MARKER) {
        return true;
    }
    process
        .cmd()
        .first()
        .is_some_and(|arg0| arg0.to_string_lossy().contains(PAYLOAD_MARKER))
}

fn cmdline_contains(process: &sysinfo::Process, tag: &str) -> bool {
    process
        .cmd()
        .iter()
        .any(|arg| arg.to_string_lossy().contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nothing_for_a_tag_no_process_uses() {
        let tag = "treekill-test-tag-that-nothing-will-ever-match-ab12cd34";
        assert_eq!(VerifierProbe::count_by_tag(tag), 0);
        assert!(!VerifierProbe::any_left(tag));
    }

    #[test]
    #[cfg(unix)]
    fn tag_in_argv_of_a_non_payload_process_is_not_counted_as_a_survivor() {
        // A live process with the tag on its command line but without the
        // payload marker (here, plain `yes`, which just echoes its argv
        // forever) must not be mistaken for a survivor of a supervised
        // payload tree.
        let tag = "treekill-test-tag-collision-marker-check-ef56gh78";
        let mut child = std::process::Command::new("yes")
            .arg(tag)
            .stdout(std::process::Stdio::null())
            .spawn()
            .expect("spawn yes");

        assert_eq!(VerifierProbe::count_by_tag(tag), 0);
        assert!(!VerifierProbe::any_left(tag));

        let _ = child.kill();
        let _ = child.wait();
    }
}
