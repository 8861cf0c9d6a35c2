//! Fatal error model of the heap.
//!
//! Nothing on the allocation path returns an error to its caller. Every
//! condition in [`HeapError`] ends in [`fatal`], which renders a [`Report`]
//! and panics; the kernel's panic handler is expected to halt.

use core::{fmt, panic::Location};

use snafu::{GenerateImplicitData, Snafu};

use crate::platform::{ContextId, VirtPageNum};

/// Source location of a heap operation or of the heap code that detected a
/// problem.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallSite(&'static Location<'static>);

impl CallSite {
    /// Location of the caller of the enclosing `#[track_caller]` function.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        Self(Location::caller())
    }

    #[must_use]
    pub fn file(self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(self) -> u32 {
        self.0.line()
    }
}

impl GenerateImplicitData for CallSite {
    #[track_caller]
    fn generate() -> Self {
        Self::caller()
    }
}

impl fmt::Debug for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Formats an optional call site, `<unknown>` when nothing was recorded.
pub(crate) struct MaybeSite<'a>(pub(crate) &'a Option<CallSite>);

impl fmt::Display for MaybeSite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(site) => fmt::Display::fmt(site, f),
            None => f.write_str("<unknown>"),
        }
    }
}

/// Every way the heap can fail.
///
/// Addresses in the variants are absolute virtual addresses. Segment
/// addresses point at the header, not at the payload.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapError {
    #[snafu(display("requested size {size:#x} does not fit in isize - requested too much memory"))]
    SizeOverflow {
        size: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("invalid free of address {addr:#x}, not inside the heap {start:#x}..{end:#x}"))]
    AddressOutOfRange {
        addr: usize,
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("address {addr:#x} cannot be a payload address of the heap"))]
    MisalignedAddress {
        addr: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("segment {segment:#x} is not in use and cannot be reallocated"))]
    NotAllocated {
        segment: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("kernel heap used with interrupts disabled on cpu {cpu}"))]
    InterruptsDisabled {
        cpu: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("{holder} re-entered the kernel heap, lock already taken at {taken_at}"))]
    RecursiveLock {
        holder: ContextId,
        taken_at: CallSite,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display(
        "memory corruption in heap segment {segment:#x}, size: {size:#x}, guard: {guard:#x} - \
         probably 'write after free' or an overflow of the preceding segment"
    ))]
    Corrupted {
        segment: usize,
        size: usize,
        guard: u32,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("heap segment {segment:#x} links to {link:#x}, outside the heap (top: {top:#x})"))]
    BrokenLink {
        segment: usize,
        link: usize,
        top: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("heap segment {segment:#x} breaks the segment list: {detail}"))]
    Inconsistent {
        segment: usize,
        detail: &'static str,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display(
        "freed memory modified at {addr:#x} (value: {value:#x}), the segment was freed at {freed_at}"
    ))]
    UseAfterFree {
        addr: usize,
        value: u8,
        freed_at: CallSite,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display(
        "double free of heap segment {segment:#x} (size: {size:#x}), previously freed at {}",
        MaybeSite(freed_at),
    ))]
    DoubleFree {
        segment: usize,
        size: usize,
        freed_at: Option<CallSite>,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display(
        "kernel heap is out of memory: {requested:#x} more bytes needed, heap size {size:#x} of \
         {max:#x}, {used:#x} bytes in {blocks} blocks in use - are we leaking memory?"
    ))]
    CeilingReached {
        requested: usize,
        size: usize,
        max: usize,
        used: usize,
        blocks: usize,
        #[snafu(implicit)]
        location: CallSite,
    },
    #[snafu(display("no physical frame left to back kernel heap page {page:#x}"))]
    OutOfFrames {
        page: VirtPageNum,
        #[snafu(implicit)]
        location: CallSite,
    },
}

impl HeapError {
    /// Where inside the heap the problem was detected.
    #[must_use]
    pub fn location(&self) -> CallSite {
        match self {
            Self::SizeOverflow { location, .. }
            | Self::AddressOutOfRange { location, .. }
            | Self::MisalignedAddress { location, .. }
            | Self::NotAllocated { location, .. }
            | Self::InterruptsDisabled { location, .. }
            | Self::RecursiveLock { location, .. }
            | Self::Corrupted { location, .. }
            | Self::BrokenLink { location, .. }
            | Self::Inconsistent { location, .. }
            | Self::UseAfterFree { location, .. }
            | Self::DoubleFree { location, .. }
            | Self::CeilingReached { location, .. }
            | Self::OutOfFrames { location, .. } => *location,
        }
    }
}

/// Who was running when a fatal error was detected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attribution {
    pub(crate) caller: CallSite,
    pub(crate) context: ContextId,
    pub(crate) cpu: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Yellow,
    DarkGray,
}

impl Color {
    fn fg(self) -> u8 {
        match self {
            Self::Red => 31,
            Self::Yellow => 33,
            Self::DarkGray => 90,
        }
    }
}

struct WithFg<T>(Color, T);

impl<T> fmt::Display for WithFg<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fg = self.0.fg();
        let value = &self.1;
        write!(f, "\x1B[{fg};1m{value}\x1B[0m")
    }
}

/// Human readable rendering of a fatal heap error.
pub struct Report<'a> {
    error: &'a HeapError,
    attribution: Attribution,
}

impl<'a> Report<'a> {
    pub(crate) fn new(error: &'a HeapError, attribution: Attribution) -> Self {
        Self { error, attribution }
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Attribution {
            caller,
            context,
            cpu,
        } = self.attribution;
        writeln!(f, "Error: {}", WithFg(Color::Red, self.error))?;
        writeln!(f, "  detected at {}", WithFg(Color::DarkGray, self.error.location()))?;
        writeln!(f, "  called from {}", WithFg(Color::Yellow, caller))?;
        writeln!(f, "  running {context} on cpu {cpu}")
    }
}

impl fmt::Debug for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Reports `error` and halts through the panic handler.
#[cold]
#[track_caller]
pub(crate) fn fatal(error: &HeapError, attribution: Attribution) -> ! {
    log::error!("kernel heap: {error}");
    let header = WithFg(Color::Red, "Kernel heap fatal error");
    let report = Report::new(error, attribution);
    panic!("{header}\n\n{report}");
}
