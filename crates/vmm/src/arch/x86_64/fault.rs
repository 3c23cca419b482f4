//! Page-fault decoding for x86_64.

use x86_64::{registers::control::Cr2, structures::idt::PageFaultErrorCode};

use crate::{FaultCause, PageFault, VirtualAddress};

/// Builds a [`PageFault`] from the error code pushed by the CPU and the faulting CR2 value.
///
/// Must be called from the page-fault handler before anything else can fault and overwrite
/// CR2. A non-canonical CR2 cannot be produced by a translation fault, so it is reported as
/// address zero, which no mapping ever covers.
pub fn read_page_fault(error_code: PageFaultErrorCode, instruction_pointer: u64) -> PageFault {
    let address = Cr2::read()
        .map(|addr| VirtualAddress::new(addr.as_u64() as usize))
        .unwrap_or(VirtualAddress::new(0));

    let cause = FaultCause::classify(
        error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION),
        error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE),
        error_code.contains(PageFaultErrorCode::USER_MODE),
        error_code.contains(PageFaultErrorCode::MALFORMED_TABLE),
        error_code.contains(PageFaultErrorCode::INSTRUCTION_FETCH),
    );

    PageFault {
        address,
        instruction_pointer: instruction_pointer as usize,
        cause,
    }
}
