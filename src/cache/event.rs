use crate::cache::block::Status;
use crate::interconn::SourceKind;
use crate::mem_event::MemEvent;

/// An action scheduled on the self channel to model access latency or to
/// re-dispatch a deferred request. Carries everything the handler needs;
/// blocks are referred to by storage index.
#[derive(Debug, Clone)]
pub enum SelfEvent {
    /// Answer a CPU request from `block` after the access latency.
    SendCpuResponse { ev: MemEvent, block: usize },
    /// Hand `block`'s data to the peer that asked on `src`.
    SupplyData {
        ev: MemEvent,
        block: usize,
        src: SourceKind,
    },
    /// Feed a deferred request back through dispatch once its fill is done.
    ReDispatch { ev: MemEvent, src: SourceKind },
}

/// Continuation attached to a bus-queued event, run when the arbiter grants
/// the bus and the event goes out. Owned by the bus queue until the grant
/// (or a cancellation) returns it.
#[derive(Debug)]
pub enum BusContinuation {
    /// The invalidate went out on the bus: finish the broadcast on the
    /// point-to-point links and retry the write that wanted ownership.
    IssueInvalidate { ev: MemEvent, block: usize },
    /// A supply went out on the bus: release the block and stop tracking.
    SupplyData { block: usize, src: SourceKind },
    /// A writeback went out on the bus: forward it downstream and settle the
    /// block into its terminal status.
    Writeback {
        block: usize,
        new_status: Status,
        decrement_lock: bool,
    },
}
