//! Kernel command-line configuration.
//!
//! The boot loader hands the kernel a single option string. Recognized
//! options mirror the classic teaching-kernel surface:
//!
//! - `-f`        format the filesystem before mounting
//! - `-q`        power off once the boot task list is done
//! - `-mlfqs`    select the multilevel-feedback-queue scheduler
//! - `-ul=N`     cap the user page pool at N frames
//! - anything else is forwarded to the in-kernel test runner as a task name

use alloc::{string::String, string::ToString, vec::Vec};

use crate::sched::SchedPolicy;

/// Default cap on user-pool frames when `-ul` is not given.
pub const DEFAULT_USER_FRAMES: usize = 1024;

/// Parsed boot configuration.
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Format the filesystem before mounting (`-f`).
    pub format_fs: bool,
    /// Power off when the boot task list completes (`-q`).
    pub power_off_on_done: bool,
    /// Scheduler policy (`-mlfqs` selects MLFQ).
    pub sched_policy: SchedPolicy,
    /// Maximum number of user-pool frames (`-ul=N`).
    pub user_frames: usize,
    /// Task names forwarded to the internal runner.
    pub tasks: Vec<String>,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            format_fs: false,
            power_off_on_done: false,
            sched_policy: SchedPolicy::Priority,
            user_frames: DEFAULT_USER_FRAMES,
            tasks: Vec::new(),
        }
    }
}

impl BootConfig {
    /// Parse a whitespace-separated kernel command line.
    ///
    /// Unknown `-` options are rejected; everything after the options is a
    /// task list for the internal runner.
    pub fn parse(cmdline: &str) -> Result<Self, &'static str> {
        let mut cfg = Self::default();
        let mut in_tasks = false;
        for word in cmdline.split_whitespace() {
            if in_tasks || !word.starts_with('-') {
                in_tasks = true;
                cfg.tasks.push(word.to_string());
                continue;
            }
            match word {
                "-f" => cfg.format_fs = true,
                "-q" => cfg.power_off_on_done = true,
                "-mlfqs" => cfg.sched_policy = SchedPolicy::Mlfqs,
                _ if word.starts_with("-ul=") => {
                    cfg.user_frames = word[4..]
                        .parse()
                        .map_err(|_| "bad -ul value")?;
                }
                _ => return Err("unknown kernel option"),
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_tasks() {
        let cfg = BootConfig::parse("-f -q -mlfqs -ul=64 args-none args-many").unwrap();
        assert!(cfg.format_fs);
        assert!(cfg.power_off_on_done);
        assert_eq!(cfg.sched_policy, SchedPolicy::Mlfqs);
        assert_eq!(cfg.user_frames, 64);
        assert_eq!(cfg.tasks, ["args-none", "args-many"]);
    }

    #[test]
    fn options_after_first_task_are_task_args() {
        let cfg = BootConfig::parse("run -q").unwrap();
        assert!(!cfg.power_off_on_done);
        assert_eq!(cfg.tasks, ["run", "-q"]);
    }

    #[test]
    fn rejects_unknown_option() {
        assert!(BootConfig::parse("-zap").is_err());
    }
}
