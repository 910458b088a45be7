//! FerriteOS kernel binary.
//!
//! On bare metal, `bootloader_api` hands control to `kernel_main`, which
//! parses the command line, assembles the kernel over the boot disk, and
//! runs the configured boot tasks. The host build of this binary is a
//! stub; the interesting host entry points are the library's tests.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod bare {
    extern crate alloc;

    use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
    use core::panic::PanicInfo;

    use bootloader_api::{config::Mapping, entry_point, BootInfo, BootloaderConfig};

    use ferrite_kernel::{
        arch,
        config::BootConfig,
        fs::{BlockDevice, DiskLayout, RamDisk},
        kernel::{self, Kernel},
        mm::PageDir,
        println, process, sched, timer,
    };

    /// Boot-time RAM disk size in sectors (8 MiB data + swap tail).
    const BOOT_DISK_SECTORS: u32 = 20480;
    const BOOT_SWAP_PAGES: u32 = 256;

    /// Kernel heap arena.
    const HEAP_SIZE: usize = 32 * 1024 * 1024;
    static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        // SAFETY: the heap arena is used exactly once, here.
        unsafe {
            ferrite_kernel::heap_init(core::ptr::addr_of_mut!(HEAP) as *mut u8, HEAP_SIZE);
        }
        ferrite_kernel::logger::init(log::LevelFilter::Info);
        println!("FerriteOS v{}", env!("CARGO_PKG_VERSION"));

        if let Some(offset) = boot_info.physical_memory_offset.into_option() {
            arch::x86_64::paging::set_phys_offset(offset);
        }
        arch::x86_64::init();

        let cmdline = ""; // No loader-provided command line on this path.
        let config = BootConfig::parse(cmdline).unwrap_or_default();

        // Without an IDE adaptation bound yet, boot runs over a RAM disk
        // large enough for the test workloads.
        let dev: Arc<dyn BlockDevice> = RamDisk::new(BOOT_DISK_SECTORS);
        let layout = DiskLayout::new(BOOT_DISK_SECTORS, BOOT_SWAP_PAGES)
            .expect("boot disk layout");
        let mut config = config;
        config.format_fs = true;
        let tasks: Vec<String> = config.tasks.clone();
        let power_off = config.power_off_on_done;

        let kernel = Kernel::new(
            config,
            dev,
            layout,
            Box::new(|| arch::x86_64::paging::X86PageDir::new() as Arc<dyn PageDir>),
        )
        .expect("kernel assembly");
        let kernel = kernel::install(kernel);
        kernel.sched.bootstrap("main", sched::PRI_DEFAULT);

        // Background daemons: periodic cache flusher.
        sched::kthread::spawn(&kernel.sched, "flusher", sched::PRI_DEFAULT, flusher_entry);

        run_boot_tasks(kernel, &tasks);

        if power_off {
            let _ = kernel.fs.unmount();
            arch::power_off(0);
        }
        log::info!("boot complete; idling");
        loop {
            sched::relax();
        }
    }

    extern "C" fn flusher_entry() {
        let Some(kernel) = kernel::global() else {
            return;
        };
        loop {
            timer::sleep_ticks(kernel, sched::TICK_HZ);
            // Bottom-half worker: deferred flushes and read-ahead loads.
            ferrite_kernel::irq::drain(kernel);
            if timer::take_flush_due() {
                if let Err(e) = kernel.fs.flush() {
                    log::warn!("flusher: {}", e);
                }
            }
        }
    }

    fn run_boot_tasks(kernel: &'static Kernel, tasks: &[String]) {
        for task in tasks {
            log::info!("running boot task '{}'", task);
            let pcb = match kernel.spawn_process(task) {
                Ok(pcb) => pcb,
                Err(e) => {
                    log::warn!("{}: spawn failed: {}", task, e);
                    continue;
                }
            };
            let args = [task.clone()];
            match process::exec(kernel, &pcb, task, &args) {
                Ok(entry) => log::info!("{}: loaded, entry {:#x}", task, entry),
                Err(e) => {
                    log::warn!("{}: load failed: {}", task, e);
                    let _ = process::exit(kernel, &pcb, -1);
                }
            }
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!(
        "ferrite-kernel {}: host build; run `cargo test` to exercise the kernel",
        env!("CARGO_PKG_VERSION")
    );
}
