use crate::components::{MatmulIdent, OperandStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Events that occur while a subgroup runs a mainloop.
///
/// `k_tile` is the absolute K tile index the operation targets.
pub enum MainloopEvent {
    /// Cache lines of a future K tile were requested
    Prefetch {
        ident: MatmulIdent,
        stream: OperandStream,
        k_tile: usize,
    },
    /// An operand tile was copied to registers
    Load {
        ident: MatmulIdent,
        stream: OperandStream,
        k_tile: usize,
    },
    /// An operand fragment was converted to the compute type
    Convert { ident: MatmulIdent, k_tile: usize },
    /// A tile matmul was accumulated
    Mma { stream: OperandStream, k_tile: usize },
    BarrierArrive { k_tile: usize },
    BarrierWait { k_tile: usize },
    /// The grouped mainloop rebound its operand views
    GroupSwitch { group: usize },
}

/// Function that is called at each [MainloopEvent]
pub trait MainloopEventListener: Send {
    fn on_event(&mut self, event: MainloopEvent);
}

#[derive(Default, Debug, Clone, Copy)]
/// Use when there is no event listening to do
pub struct NoEvent;

impl MainloopEventListener for NoEvent {
    fn on_event(&mut self, _event: MainloopEvent) {
        // Nothing to do
    }
}

impl MainloopEventListener for Vec<MainloopEvent> {
    fn on_event(&mut self, event: MainloopEvent) {
        self.push(event);
    }
}
