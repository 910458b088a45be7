//! Kernel composition root.
//!
//! [`Kernel`] owns the scheduler, mounted filesystem, VM state, and the
//! process table. Boot builds one global instance; tests build private
//! ones over a RAM disk and the simulated page directory, which is what
//! makes the whole stack drivable from the host test harness.

use alloc::{boxed::Box, sync::Arc};

use crate::config::BootConfig;
use crate::error::KernelResult;
use crate::fs::{BlockDevice, DiskLayout, FileSystem};
use crate::mm::{PageDir, SimPageDir, SwapTable, Vm};
use crate::process::{Pcb, ProcessTable};
use crate::sched::Scheduler;
use crate::sync::OnceLock;

/// Produces fresh page directories for new address spaces.
pub type PageDirFactory = Box<dyn Fn() -> Arc<dyn PageDir> + Send + Sync>;

/// The assembled kernel.
pub struct Kernel {
    pub config: BootConfig,
    pub sched: Arc<Scheduler>,
    pub fs: FileSystem,
    pub vm: Arc<Vm>,
    pub procs: ProcessTable,
    pagedir_factory: PageDirFactory,
}

impl Kernel {
    /// Assemble a kernel over `dev`, formatting or mounting per the boot
    /// configuration.
    pub fn new(
        config: BootConfig,
        dev: Arc<dyn BlockDevice>,
        layout: DiskLayout,
        pagedir_factory: PageDirFactory,
    ) -> KernelResult<Self> {
        let sched = Scheduler::new(config.sched_policy);
        let fs = if config.format_fs {
            FileSystem::format(dev.clone(), layout)?
        } else {
            FileSystem::mount(dev.clone(), layout)?
        };
        if let Some(report) = fs.recovery {
            log::info!(
                "recovery: {} committed, {} rolled back, {} redone, {} skipped",
                report.committed,
                report.rolled_back,
                report.redone,
                report.skipped
            );
        }
        let swap = SwapTable::new(dev, &layout);
        let vm = Vm::new(config.user_frames, swap);
        Ok(Self {
            config,
            sched,
            fs,
            vm,
            procs: ProcessTable::new(),
            pagedir_factory,
        })
    }

    /// A fully formed kernel over a fresh RAM disk, for the test suite.
    pub fn test_instance(sectors: u32, swap_pages: u32, user_frames: usize) -> KernelResult<Self> {
        let mut config = BootConfig::default();
        config.format_fs = true;
        config.user_frames = user_frames;
        let dev: Arc<dyn BlockDevice> = crate::fs::RamDisk::new(sectors);
        let layout = DiskLayout::new(sectors, swap_pages)?;
        let kernel = Self::new(
            config,
            dev,
            layout,
            Box::new(|| SimPageDir::new() as Arc<dyn PageDir>),
        )?;
        kernel.sched.bootstrap("main", crate::sched::PRI_DEFAULT);
        Ok(kernel)
    }

    /// Fresh page directory for a new address space.
    pub fn new_pagedir(&self) -> Arc<dyn PageDir> {
        (self.pagedir_factory)()
    }

    /// The process owning the running thread.
    pub fn current_process(&self) -> Option<Arc<Pcb>> {
        let tid = self.sched.current()?;
        let pid = self.sched.with_tcb(tid, |t| t.pid)??;
        self.procs.get(pid)
    }

    /// Create an empty process with a schedulable thread and the root as
    /// its working directory. Used for the initial boot task and tests.
    pub fn spawn_process(&self, name: &str) -> KernelResult<Arc<Pcb>> {
        let pid = self.procs.alloc_pid();
        let pvm = crate::mm::ProcessVm::new(pid, self.new_pagedir());
        self.vm.register(pvm.clone());
        let pcb = Pcb::new(pid, alloc::string::String::from(name), None, pvm);
        *pcb.cwd.lock() = Some(self.fs.inodes.reopen(self.fs.root()));
        self.procs.insert(pcb.clone());
        let tid = self.sched.spawn(name, crate::sched::PRI_DEFAULT);
        self.sched.with_tcb(tid, |t| t.pid = Some(pid));
        *pcb.main_tid.lock() = Some(tid);
        Ok(pcb)
    }

    /// Adopt the calling (bootstrap) thread as a process's main thread.
    pub fn adopt_current_thread(&self, pcb: &Arc<Pcb>) {
        if let Some(tid) = self.sched.current() {
            self.sched.with_tcb(tid, |t| t.pid = Some(pcb.pid));
            *pcb.main_tid.lock() = Some(tid);
        }
    }
}

static KERNEL: OnceLock<Kernel> = OnceLock::new();

/// Install the global kernel instance (boot path). The first call wins.
pub fn install(kernel: Kernel) -> &'static Kernel {
    let _ = KERNEL.set(kernel);
    KERNEL.get().expect("kernel just installed")
}

/// The global kernel, if booted.
pub fn global() -> Option<&'static Kernel> {
    KERNEL.get()
}
