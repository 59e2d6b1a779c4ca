//! Read-only process-table walk, used for diagnostics and for the Unix
//! no-session fallback kill path. Never the primary kill mechanism when a
//! platform kill-group primitive is available — walking the process table
//! races descendant creation.

use std::collections::{HashMap, HashSet};

use sysinfo::{Pid, System};

/// Cycle guard: a process table is untrusted input, cap the walk so a
/// pathological PPID cycle can't spin forever.
const MAX_DEPTH: usize = 64;

pub struct DescendantEnumerator;

impl DescendantEnumerator {
    /// All transitive descendants of `root_pid`, not including `root_pid`
    /// itself.
    pub fn descendants(root_pid: u32) -> HashSet<u32> {
        let mut system = System::new_all();
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        let mut children_of: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children_of.entry(pid_as_u32(parent)).or_default().push(pid_as_u32(*pid));
            }
        }

        let mut seen = HashSet::new();
        let mut stack = vec![(root_pid, 0usize)];
        while let Some((pid, depth)) = stack.pop() {
            if depth >= MAX_DEPTH {
                continue;
            }
            if let Some(children) = children_of.get(&pid) {
                for &child in children {
                    if seen.insert(child) {
                        stack.push((child, depth + 1));
                    }
                }
            }
        }
        seen
    }
}

fn pid_as_u32(pid: Pid) -> u32 {
    // sysinfo's Pid is a thin wrapper around the platform's native pid
    // width; every platform we target fits in u32.
    pid.as_u32()
}
