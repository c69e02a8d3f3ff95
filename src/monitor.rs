//! Adaptive memory monitor.
//!
//! Measuring process memory is far more expensive than appending a record, so the monitor only samples at
//! checkpoints. After each sample it projects, from the average growth per record, how many more records fit into
//! the remaining budget and schedules the next checkpoint halfway there. The interval therefore shrinks as the
//! ceiling gets closer.

use bytesize::ByteSize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Number of records between the first checkpoints.
pub const INITIAL_CHECK_INTERVAL: usize = 1000;

/// Source of process memory usage.
pub trait MemoryProbe {
    /// Returns current resident memory in bytes, or [`None`] if it can't be determined.
    fn resident_bytes(&mut self) -> Option<u64>;
}

/// Probe reading the current process resident set size.
pub struct ProcessMemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                log::debug!("current process id unavailable, memory probing disabled: {}", err);
                None
            }
        };

        ProcessMemoryProbe {
            system: System::new(),
            pid,
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        ProcessMemoryProbe::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|process| process.memory())
    }
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for Box<P> {
    fn resident_bytes(&mut self) -> Option<u64> {
        (**self).resident_bytes()
    }
}

/// Decides when a growing batch has to be flushed because of memory usage.
pub struct MemoryMonitor<P: MemoryProbe> {
    probe: P,
    /// Allowed growth over the baseline.
    limit: u64,
    /// Resident memory at the last (re)baseline.
    baseline: u64,
    initial_interval: usize,
    /// Records observed since the baseline was taken.
    records: usize,
    next_checkpoint: usize,
}

impl<P: MemoryProbe> MemoryMonitor<P> {
    /// Creates a monitor and captures the baseline.
    ///
    /// # Arguments
    /// * `probe` - Memory usage source
    /// * `limit` - Memory growth allowed over the baseline in bytes
    /// * `records_limit` - Fixed record count flush trigger; the first checkpoint never comes later than that
    pub fn new(probe: P, limit: u64, records_limit: usize) -> Self {
        let initial_interval = INITIAL_CHECK_INTERVAL.min(records_limit).max(1);
        let mut monitor = MemoryMonitor {
            probe,
            limit,
            baseline: 0,
            initial_interval,
            records: 0,
            next_checkpoint: initial_interval,
        };
        monitor.rebaseline();

        return monitor;
    }

    /// Captures a fresh baseline and restarts the checkpoint schedule.
    pub fn rebaseline(&mut self) {
        self.baseline = self.probe.resident_bytes().unwrap_or(0);
        self.records = 0;
        self.next_checkpoint = self.initial_interval;
    }

    /// Accounts one more record. Returns `true` if memory usage already exceeds the limit.
    pub fn record_added(&mut self) -> bool {
        self.records += 1;
        if self.records < self.next_checkpoint {
            return false;
        }

        let resident = match self.probe.resident_bytes() {
            Some(resident) => resident,
            None => {
                self.next_checkpoint = self.records + self.initial_interval;
                return false;
            }
        };

        let used = resident.saturating_sub(self.baseline);
        if used > self.limit {
            log::debug!(
                "memory limit exceeded after {} records (used: {}, limit: {})",
                self.records,
                ByteSize(used),
                ByteSize(self.limit)
            );
            return true;
        }

        let per_record = (used / self.records as u64).max(1);
        let projected = (self.limit - used) / per_record;
        let step = usize::try_from(projected / 2).unwrap_or(usize::MAX).max(1);
        self.next_checkpoint = self.records.saturating_add(step);

        log::trace!(
            "memory checkpoint at {} records (used: {}, next check at: {})",
            self.records,
            ByteSize(used),
            self.next_checkpoint
        );

        return false;
    }

    /// Record count at which the next sample is taken.
    pub fn next_checkpoint(&self) -> usize {
        self.next_checkpoint
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::cell::Cell;
    use std::rc::Rc;

    use rstest::*;

    use super::{MemoryMonitor, MemoryProbe, ProcessMemoryProbe};

    /// Probe returning a value controlled by the test, counting samples.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedProbe {
        pub(crate) resident: Rc<Cell<Option<u64>>>,
        pub(crate) samples: Rc<Cell<usize>>,
    }

    impl ScriptedProbe {
        pub(crate) fn new(resident: u64) -> Self {
            let probe = ScriptedProbe::default();
            probe.resident.set(Some(resident));
            probe
        }
    }

    impl MemoryProbe for ScriptedProbe {
        fn resident_bytes(&mut self) -> Option<u64> {
            self.samples.set(self.samples.get() + 1);
            self.resident.get()
        }
    }

    #[rstest]
    #[case(100_000, 1000)]
    #[case(300, 300)]
    #[case(0, 1)]
    fn test_initial_checkpoint(#[case] records_limit: usize, #[case] expected: usize) {
        let monitor = MemoryMonitor::new(ScriptedProbe::new(0), 1024, records_limit);
        assert_eq!(monitor.next_checkpoint(), expected);
    }

    #[test]
    fn test_no_sampling_between_checkpoints() {
        let probe = ScriptedProbe::new(1000);
        let mut monitor = MemoryMonitor::new(probe.clone(), 1_000_000, 10);
        assert_eq!(probe.samples.get(), 1);

        for _ in 0..9 {
            assert!(!monitor.record_added());
        }
        assert_eq!(probe.samples.get(), 1);

        assert!(!monitor.record_added());
        assert_eq!(probe.samples.get(), 2);
    }

    #[test]
    fn test_check_interval_shrinks_under_pressure() {
        let probe = ScriptedProbe::new(0);
        let mut monitor = MemoryMonitor::new(probe.clone(), 10_000, 100);

        // 100 records grew memory by 2000 bytes: 20 bytes per record, 8000 bytes left => 400 records => check in 200
        for _ in 0..99 {
            monitor.record_added();
        }
        probe.resident.set(Some(2000));
        assert!(!monitor.record_added());
        assert_eq!(monitor.next_checkpoint(), 300);

        // 300 records used 9000 bytes: 30 bytes per record, 1000 bytes left => 33 records => check in 16
        for _ in 0..199 {
            monitor.record_added();
        }
        probe.resident.set(Some(9000));
        assert!(!monitor.record_added());
        assert_eq!(monitor.next_checkpoint(), 316);
    }

    #[test]
    fn test_signals_only_when_limit_exceeded() {
        let probe = ScriptedProbe::new(500);
        let mut monitor = MemoryMonitor::new(probe.clone(), 1000, 2);

        monitor.record_added();
        probe.resident.set(Some(1500));
        assert!(!monitor.record_added(), "exactly at the limit is not over it");

        while monitor.next_checkpoint() > 3 {
            monitor.record_added();
        }
        probe.resident.set(Some(1501));
        let mut flushed = false;
        for _ in 0..monitor.next_checkpoint() {
            flushed |= monitor.record_added();
        }
        assert!(flushed);
    }

    #[test]
    fn test_rebaseline() {
        let probe = ScriptedProbe::new(0);
        let mut monitor = MemoryMonitor::new(probe.clone(), 100, 1);

        probe.resident.set(Some(200));
        assert!(monitor.record_added());

        monitor.rebaseline();
        assert_eq!(monitor.next_checkpoint(), 1);
        assert!(!monitor.record_added());
    }

    #[test]
    fn test_unavailable_probe_never_signals() {
        let probe = ScriptedProbe::default();
        let mut monitor = MemoryMonitor::new(probe.clone(), 0, 5);
        for _ in 0..50 {
            assert!(!monitor.record_added());
        }
        assert_eq!(probe.samples.get(), 11);
    }

    #[test]
    fn test_process_probe() {
        let mut probe = ProcessMemoryProbe::new();
        if let Some(resident) = probe.resident_bytes() {
            assert!(resident > 0);
        }
    }
}
