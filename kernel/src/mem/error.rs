#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// null, kernel, or otherwise unusable user address
    BadAddress,
    /// no page is declared at the address and it is not stack growth
    NotMapped,
    /// a mapping is already installed for the page
    AlreadyMapped,
    /// mmap range overlaps a declared page
    Overlap,
    /// mmap of a zero-length file
    EmptyFile,
    /// descriptor is not open
    BadFileDescriptor,
    /// console descriptors cannot be mapped
    ReservedDescriptor,
    /// address is not page aligned
    Misaligned,
    /// mapping id was never returned by mmap or was already unmapped
    UnknownMapping,
    /// pid has no address space
    NoSuchProcess,
    /// pid already has an address space
    ProcessExists,
    /// page was declared twice
    DuplicatePage,
    /// write to a read-only page
    ReadOnly,
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::BadAddress => write!(f, "bad user address"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::AlreadyMapped => write!(f, "page already mapped"),
            Self::Overlap => write!(f, "mapping overlaps existing pages"),
            Self::EmptyFile => write!(f, "cannot map an empty file"),
            Self::BadFileDescriptor => write!(f, "bad file descriptor"),
            Self::ReservedDescriptor => write!(f, "console descriptors cannot be mapped"),
            Self::Misaligned => write!(f, "address not page aligned"),
            Self::UnknownMapping => write!(f, "no such mapping"),
            Self::NoSuchProcess => write!(f, "no such process"),
            Self::ProcessExists => write!(f, "process already exists"),
            Self::DuplicatePage => write!(f, "page declared twice"),
            Self::ReadOnly => write!(f, "write to read-only page"),
        }
    }
}

impl core::error::Error for VmError {}

pub type Result<T> = core::result::Result<T, VmError>;
