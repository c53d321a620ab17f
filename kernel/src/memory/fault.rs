//! Page-fault handling: demand paging and lazy file mappings.
//!
//! The exception handler gives us the CPU's error code and the faulting
//! address. A fault is recoverable only when it is a plain missing-page
//! fault inside one of the current task's registered regions; everything
//! else kills the faulting task (never the kernel).

use bitflags::bitflags;

use super::paging::VirtualAddress;
use crate::files::FileMapping;

bitflags! {
    /// CPU page-fault error code (consumed, not produced, by the kernel)
    pub struct PageFaultErrorCode: u64 {
        /// Fault on a present page (protection violation) when set;
        /// missing page when clear
        const PRESENT   = 1 << 0;
        /// Write access when set, read when clear
        const WRITE     = 1 << 1;
        /// Fault taken in user mode when set
        const USER      = 1 << 2;
        /// Reserved bit set in a page-map entry
        const RESERVED  = 1 << 3;
        /// Instruction fetch
        const INSTRUCTION = 1 << 4;
    }
}

/// What to do about one fault
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FaultDisposition {
    /// Commit one fresh frame inside the demand-paging region
    DemandPage,
    /// Commit one frame and fill it from the mapped file
    FileMap(FileMapping),
    /// Outside every registered region, or not a missing-page fault
    Unrecoverable,
}

/// Decide how to resolve a fault against a task's registered regions.
///
/// Reserved-bit violations and protection faults (present bit set) have no
/// recovery path here: demand paging only ever resolves accesses to pages
/// that were never committed.
pub fn classify_fault(
    error_code: PageFaultErrorCode,
    addr: u64,
    dpaging_begin: u64,
    dpaging_end: u64,
    file_maps: &[FileMapping],
) -> FaultDisposition {
    if error_code.contains(PageFaultErrorCode::RESERVED)
        || error_code.contains(PageFaultErrorCode::PRESENT)
    {
        return FaultDisposition::Unrecoverable;
    }

    if dpaging_begin <= addr && addr < dpaging_end {
        return FaultDisposition::DemandPage;
    }

    if let Some(m) = file_maps
        .iter()
        .find(|m| m.vaddr_begin <= addr && addr < m.vaddr_end)
    {
        return FaultDisposition::FileMap(*m);
    }

    FaultDisposition::Unrecoverable
}

/// Resolve a page fault for the current task.
///
/// Returns `Ok(())` if the mapping was installed and the faulting access
/// can be retried transparently; `Err(())` if the fault is unrecoverable
/// and the caller must terminate the task.
pub fn handle_page_fault(error_code: PageFaultErrorCode, addr: u64) -> Result<(), ()> {
    let (root, disposition) = {
        let snapshot = crate::task::current_fault_context();
        let Some(ctx) = snapshot else {
            // Fault before the task system is up is a kernel bug
            return Err(());
        };
        let disposition = classify_fault(
            error_code,
            addr,
            ctx.dpaging_begin,
            ctx.dpaging_end,
            &ctx.file_maps,
        );
        (ctx.root, disposition)
    };
    // A task without its own address space has nowhere to install pages
    let Some(root) = root else {
        return Err(());
    };

    let page = VirtualAddress(addr).align_down_to_page();
    match disposition {
        FaultDisposition::DemandPage => {
            super::map_demand_page(root, page).map_err(|_| ())
        }
        FaultDisposition::FileMap(mapping) => {
            super::map_demand_page(root, page).map_err(|_| ())?;
            prepare_page_cache(root, page, &mapping)
        }
        FaultDisposition::Unrecoverable => Err(()),
    }
}

/// Fill a freshly mapped page with the file content behind `mapping`.
///
/// The tail page of a mapping is zero past the end of the file.
fn prepare_page_cache(
    root: super::paging::NodeHandle,
    page: VirtualAddress,
    mapping: &FileMapping,
) -> Result<(), ()> {
    let frame = {
        let translation = super::translate(root, page).ok_or(())?;
        super::frame::FrameId::containing(translation.phys_addr)
    };
    let offset = (page.0 - mapping.vaddr_begin) as usize;

    super::frame::with_frame_bytes(frame, |bytes| {
        bytes.fill(0);
        crate::task::with_current_task(|task| {
            match task.file(mapping.fd) {
                Some(fd) => {
                    fd.load(bytes, offset);
                    Ok(())
                }
                None => Err(()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DP_BEGIN: u64 = 0xFFFF_8000_0010_0000;
    const DP_END: u64 = 0xFFFF_8000_0020_0000;

    fn missing_write() -> PageFaultErrorCode {
        PageFaultErrorCode::WRITE | PageFaultErrorCode::USER
    }

    #[test]
    fn test_demand_region_fault_is_recoverable() {
        let d = classify_fault(missing_write(), DP_BEGIN + 0x42, DP_BEGIN, DP_END, &[]);
        assert_eq!(d, FaultDisposition::DemandPage);
    }

    #[test]
    fn test_fault_outside_regions_is_fatal() {
        let d = classify_fault(missing_write(), DP_END + 1, DP_BEGIN, DP_END, &[]);
        assert_eq!(d, FaultDisposition::Unrecoverable);
    }

    #[test]
    fn test_reserved_bit_violation_is_fatal_even_in_region() {
        let ec = missing_write() | PageFaultErrorCode::RESERVED;
        let d = classify_fault(ec, DP_BEGIN, DP_BEGIN, DP_END, &[]);
        assert_eq!(d, FaultDisposition::Unrecoverable);
    }

    #[test]
    fn test_protection_violation_is_fatal() {
        let ec = missing_write() | PageFaultErrorCode::PRESENT;
        let d = classify_fault(ec, DP_BEGIN, DP_BEGIN, DP_END, &[]);
        assert_eq!(d, FaultDisposition::Unrecoverable);
    }

    #[test]
    fn test_file_mapping_fault_names_the_mapping() {
        let maps = [FileMapping {
            fd: 3,
            vaddr_begin: 0xFFFF_FFFF_0000_0000,
            vaddr_end: 0xFFFF_FFFF_0000_4000,
        }];
        let d = classify_fault(
            missing_write(),
            0xFFFF_FFFF_0000_1800,
            DP_BEGIN,
            DP_END,
            &maps,
        );
        assert_eq!(d, FaultDisposition::FileMap(maps[0]));
    }

    #[test]
    fn test_empty_demand_region_never_matches() {
        // begin == end: the region is empty, not a single byte wide
        let d = classify_fault(missing_write(), DP_BEGIN, DP_BEGIN, DP_BEGIN, &[]);
        assert_eq!(d, FaultDisposition::Unrecoverable);
    }

}
