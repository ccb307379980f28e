use crate::instr::Instr;

/// Instruction and delivery forms that have fixed cycle costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleCostKind {
    /// Single-cycle register arithmetic, logic, moves and flag updates.
    Alu,
    /// Word arithmetic on a register pair (`ADIW`, `SBIW`).
    WordAlu,
    /// Direct or indirect data-space load.
    Load,
    /// Direct or indirect data-space store.
    Store,
    /// Program-memory load (`LPM`).
    ProgramLoad,
    /// Single-cycle I/O register transfer (`IN`, `OUT`).
    IoTransfer,
    /// I/O bit read-modify-write (`SBI`, `CBI`).
    IoBitWrite,
    /// Conditional branch when the predicate is false.
    BranchNotTaken,
    /// Conditional branch when the predicate is true.
    BranchTaken,
    /// Skip instruction when nothing is skipped.
    SkipNotTaken,
    /// Extra cost per skipped instruction word.
    SkipWord,
    /// Relative or indirect jump.
    RelativeJump,
    /// Absolute jump.
    Jump,
    /// Relative call.
    RelativeCall,
    /// Absolute call.
    Call,
    /// Return from subroutine or interrupt.
    Return,
    /// Stack push.
    Push,
    /// Stack pop.
    Pop,
    /// `SLEEP`, `BREAK`, `WDR`, `NOP`.
    Control,
    /// Interrupt delivery sequence.
    InterruptEntry,
}

/// Single source-of-truth cycle-cost table.
pub const CYCLE_COST_TABLE: &[(CycleCostKind, u64)] = &[
    (CycleCostKind::Alu, 1),
    (CycleCostKind::WordAlu, 2),
    (CycleCostKind::Load, 2),
    (CycleCostKind::Store, 2),
    (CycleCostKind::ProgramLoad, 3),
    (CycleCostKind::IoTransfer, 1),
    (CycleCostKind::IoBitWrite, 2),
    (CycleCostKind::BranchNotTaken, 1),
    (CycleCostKind::BranchTaken, 2),
    (CycleCostKind::SkipNotTaken, 1),
    (CycleCostKind::SkipWord, 1),
    (CycleCostKind::RelativeJump, 2),
    (CycleCostKind::Jump, 3),
    (CycleCostKind::RelativeCall, 3),
    (CycleCostKind::Call, 4),
    (CycleCostKind::Return, 4),
    (CycleCostKind::Push, 2),
    (CycleCostKind::Pop, 2),
    (CycleCostKind::Control, 1),
    (CycleCostKind::InterruptEntry, 4),
];

/// Looks up the cycle cost for a cycle-cost kind.
#[must_use]
pub fn cycle_cost(kind: CycleCostKind) -> Option<u64> {
    CYCLE_COST_TABLE
        .iter()
        .find_map(|(entry_kind, cycles)| (*entry_kind == kind).then_some(*cycles))
}

/// Same lookup for kinds that are always present in [`CYCLE_COST_TABLE`].
pub(crate) fn cost(kind: CycleCostKind) -> u64 {
    cycle_cost(kind).unwrap_or(1)
}

/// Base cost class of an instruction. Branches and skips report their not-taken
/// form; the interpreter adds the taken surcharge.
#[must_use]
pub const fn cost_kind(instr: Instr) -> CycleCostKind {
    match instr {
        Instr::Adiw { .. } | Instr::Sbiw { .. } => CycleCostKind::WordAlu,
        Instr::Lds { .. } | Instr::Ld { .. } => CycleCostKind::Load,
        Instr::Sts { .. } | Instr::St { .. } => CycleCostKind::Store,
        Instr::Lpm { .. } => CycleCostKind::ProgramLoad,
        Instr::In { .. } | Instr::Out { .. } => CycleCostKind::IoTransfer,
        Instr::Sbi { .. } | Instr::Cbi { .. } => CycleCostKind::IoBitWrite,
        Instr::Brbs { .. } | Instr::Brbc { .. } => CycleCostKind::BranchNotTaken,
        Instr::Sbic { .. } | Instr::Sbis { .. } => CycleCostKind::SkipNotTaken,
        Instr::Rjmp { .. } | Instr::Ijmp => CycleCostKind::RelativeJump,
        Instr::Jmp { .. } => CycleCostKind::Jump,
        Instr::Rcall { .. } => CycleCostKind::RelativeCall,
        Instr::Call { .. } => CycleCostKind::Call,
        Instr::Ret | Instr::Reti => CycleCostKind::Return,
        Instr::Push { .. } => CycleCostKind::Push,
        Instr::Pop { .. } => CycleCostKind::Pop,
        Instr::Nop | Instr::Sleep | Instr::Break | Instr::Wdr => CycleCostKind::Control,
        Instr::Mov { .. }
        | Instr::Movw { .. }
        | Instr::Ldi { .. }
        | Instr::Add { .. }
        | Instr::Adc { .. }
        | Instr::Sub { .. }
        | Instr::Sbc { .. }
        | Instr::And { .. }
        | Instr::Or { .. }
        | Instr::Eor { .. }
        | Instr::Cp { .. }
        | Instr::Cpc { .. }
        | Instr::Subi { .. }
        | Instr::Andi { .. }
        | Instr::Ori { .. }
        | Instr::Cpi { .. }
        | Instr::Com { .. }
        | Instr::Inc { .. }
        | Instr::Dec { .. }
        | Instr::Lsr { .. }
        | Instr::Bset { .. }
        | Instr::Bclr { .. } => CycleCostKind::Alu,
    }
}
