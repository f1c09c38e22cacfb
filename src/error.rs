use crate::runtime::PyError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- invalid target --------------------------------------------
    #[error("code object has no bytecode")]
    NoBytecode,
    #[error("code object has no line table")]
    NoLineTable,
    #[error("code objects with more than {0:#x} constants not supported")]
    TooManyConstants(usize),
    #[error("line {0} not found in line table")]
    LineNotFound(u32),

    // --------------------------------- bytecode decoding -----------------------------------------
    #[error("bytecode buffer underflow at offset {0}")]
    TruncatedBytecode(usize),
    #[error("offset {0} is mid-instruction or out of range")]
    MidInstruction(usize),

    // --------------------------------- patch infeasible ------------------------------------------
    #[error("bytecode is not decodable, no patch strategy available")]
    Undecodable,
    #[error("too many instruction argument upgrades required")]
    CascadeDiverged,
    #[error("not enough instructions to relocate for the trampoline")]
    TrampolineSpace,
    #[error("cannot relocate {0}: instruction is pinned to its offset")]
    PinnedInstruction(&'static str),
    #[error("jump target {0} lands inside relocated instructions")]
    JumpIntoRelocation(usize),

    // --------------------------------- line table ------------------------------------------------
    #[error("line table is corrupted at entry {0}")]
    CorruptedLineTable(usize),
    #[error("line table format does not support updates")]
    ReadOnlyLineTable,

    // --------------------------------- sandbox ---------------------------------------------------
    #[error("only immutable code can be called from expressions")]
    MutableCode,
    #[error(transparent)]
    Python(#[from] PyError),

    // --------------------------------- third party errors ----------------------------------------
    #[error("event sink: {0}")]
    Sink(anyhow::Error),
}

impl Error {
    /// Return a hint to a caller - is there a chance that retrying the failed
    /// patch later (with a different breakpoint set) may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::CascadeDiverged
            | Error::TrampolineSpace
            | Error::PinnedInstruction(_)
            | Error::JumpIntoRelocation(_) => true,

            Error::NoBytecode
            | Error::NoLineTable
            | Error::TooManyConstants(_)
            | Error::LineNotFound(_)
            | Error::TruncatedBytecode(_)
            | Error::MidInstruction(_)
            | Error::Undecodable
            | Error::CorruptedLineTable(_)
            | Error::ReadOnlyLineTable
            | Error::MutableCode
            | Error::Python(_)
            | Error::Sink(_) => false,
        }
    }
}
