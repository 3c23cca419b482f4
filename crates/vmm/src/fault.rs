//! Page-fault dispatch.
//!
//! The architecture layer decodes the hardware report into a [`PageFault`]; everything from
//! there on is architecture-independent. A fault is either resolved by loading the page, or
//! the faulting thread is terminated. A fault that cannot be blamed on user code brings the
//! kernel down.

use core::fmt;

use bitflags::bitflags;

use crate::{AddressSpace, VirtualAddress, VmError};

bitflags! {
    /// Why a page fault happened.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultCause: u32 {
        /// The page was not present.
        const NON_PRESENT = 1 << 0;
        /// The page was present but the access violated its attributes.
        const PROTECTION = 1 << 1;
        const READ = 1 << 2;
        const WRITE = 1 << 3;
        /// The access came from user mode.
        const USER = 1 << 4;
        const SUPERVISOR = 1 << 5;
        const INSTRUCTION_FETCH = 1 << 6;
        /// A reserved bit was set in a table entry.
        const RESERVED_BIT = 1 << 7;
    }
}

impl FaultCause {
    /// Builds a cause from the individual bits a CPU reports.
    pub fn classify(
        protection_violation: bool,
        write: bool,
        user: bool,
        reserved_bit: bool,
        instruction_fetch: bool,
    ) -> Self {
        let mut cause = if protection_violation {
            Self::PROTECTION
        } else {
            Self::NON_PRESENT
        };
        cause |= if write { Self::WRITE } else { Self::READ };
        cause |= if user { Self::USER } else { Self::SUPERVISOR };
        cause.set(Self::RESERVED_BIT, reserved_bit);
        cause.set(Self::INSTRUCTION_FETCH, instruction_fetch);
        cause
    }

    pub fn is_user(self) -> bool {
        self.contains(Self::USER)
    }
}

/// A decoded page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The address whose access faulted.
    pub address: VirtualAddress,
    pub instruction_pointer: usize,
    pub cause: FaultCause,
}

/// Signal delivered to a thread whose fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The address is not mapped, or the mapping forbids the access.
    SegmentationViolation,
    /// The mapping exists but its content could not be produced.
    BusError,
}

impl Signal {
    fn for_error(error: VmError) -> Self {
        match error {
            VmError::NotFound | VmError::PermissionDenied => Self::SegmentationViolation,
            VmError::InvalidArgument | VmError::OutOfMemory => Self::BusError,
        }
    }
}

/// How a fault ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page is loaded; the faulting instruction can be retried.
    Resumed,
    /// The faulting thread was terminated with the given signal.
    Terminated(Signal),
}

/// Task state printed when a fault is reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDiagnostics {
    pub process: Option<u32>,
    pub thread: Option<u32>,
    /// The system call in progress, if the fault happened inside one.
    pub syscall: Option<usize>,
}

impl fmt::Display for TaskDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.process {
            Some(pid) => write!(f, "pid {}", pid)?,
            None => write!(f, "no process")?,
        }
        if let Some(tid) = self.thread {
            write!(f, ", tid {}", tid)?;
        }
        if let Some(syscall) = self.syscall {
            write!(f, ", in syscall {}", syscall)?;
        }
        Ok(())
    }
}

/// What the fault path needs from the scheduler.
pub trait FaultContext {
    /// The address space of the current process, or None before the first process exists.
    fn address_space(&self) -> Option<&AddressSpace>;

    /// Ends the current thread with `signal`. The thread never returns to the faulting
    /// instruction.
    fn terminate_current_thread(&self, signal: Signal);

    fn diagnostics(&self) -> TaskDiagnostics;

    /// True if `address` lies in a region of the current task that is not covered by a
    /// mapping but reads as zero on first touch, such as its heap or its initial stack.
    fn is_demand_zero(&self, _address: VirtualAddress) -> bool {
        false
    }
}

/// Handles a page fault reported by the architecture layer.
///
/// # Panics
///
/// Panics if the fault cannot be resolved and did not come from user mode in a process.
pub fn handle_page_fault(context: &dyn FaultContext, fault: &PageFault) -> FaultResolution {
    let Some(space) = context.address_space() else {
        panic!(
            "page fault at {} (ip {:#x}, {:?}) with no address space [{}]",
            fault.address,
            fault.instruction_pointer,
            fault.cause,
            context.diagnostics()
        );
    };

    let error = match space.resolve_fault(fault) {
        Ok(()) => return FaultResolution::Resumed,
        Err(VmError::NotFound) if grows_on_demand(context, fault) => {
            match space.map_zero_page(fault.address) {
                Ok(()) => {
                    log::debug!("zero page mapped at {} on first touch", fault.address);
                    return FaultResolution::Resumed;
                }
                Err(error) => error,
            }
        }
        Err(error) => error,
    };

    if !fault.cause.is_user() {
        panic!(
            "unhandled kernel page fault at {} (ip {:#x}, {:?}): {} [{}]",
            fault.address,
            fault.instruction_pointer,
            fault.cause,
            error,
            context.diagnostics()
        );
    }

    let signal = Signal::for_error(error);
    log::error!(
        "segmentation fault at {} (ip {:#x}, {:?}): {} [{}]",
        fault.address,
        fault.instruction_pointer,
        fault.cause,
        error,
        context.diagnostics()
    );
    context.terminate_current_thread(signal);
    FaultResolution::Terminated(signal)
}

/// User data accesses in the heap or stack of the current task. Fetches never qualify.
fn grows_on_demand(context: &dyn FaultContext, fault: &PageFault) -> bool {
    fault.cause.is_user()
        && !fault.cause.contains(FaultCause::INSTRUCTION_FETCH)
        && context.is_demand_zero(fault.address)
}
