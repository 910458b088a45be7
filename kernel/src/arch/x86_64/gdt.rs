//! GDT and TSS setup.

use lazy_static::lazy_static;
use x86_64::{
    instructions::tables::load_tss,
    registers::segmentation::{Segment, CS, SS},
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 4096 * 5;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            static mut STACK: [u8; IST_STACK_SIZE] = [0; IST_STACK_SIZE];
            // SAFETY: the static stack is used only by the double-fault
            // IST entry; no other code references it.
            let start = VirtAddr::from_ptr(core::ptr::addr_of!(STACK));
            start + IST_STACK_SIZE as u64
        };
        tss
    };
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code = gdt.append(Descriptor::kernel_code_segment());
        let data = gdt.append(Descriptor::kernel_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let tss = gdt.append(Descriptor::tss_segment(&TSS));
        (
            gdt,
            Selectors {
                code,
                data,
                user_code,
                user_data,
                tss,
            },
        )
    };
}

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    #[allow(dead_code)]
    user_code: SegmentSelector,
    #[allow(dead_code)]
    user_data: SegmentSelector,
    tss: SegmentSelector,
}

pub fn init() {
    GDT.0.load();
    // SAFETY: the selectors come from the GDT just loaded.
    unsafe {
        CS::set_reg(GDT.1.code);
        SS::set_reg(GDT.1.data);
        load_tss(GDT.1.tss);
    }
}
