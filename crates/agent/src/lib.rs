//! Episode execution: the state machine that walks an episode through its
//! phases, the controller that bounds recursion into child episodes, and
//! checkpoint/resume.
//!
//! An episode runs as:
//!
//! 1. **Start** in `pending`, move to `running` if the budget allows
//! 2. **Walk phases** `intake → plan → act → verify → commit`, each
//!    producing its required outputs
//! 3. **Call tools** through the shared pipeline, charged to the
//!    episode's own budget guard
//! 4. **Spawn children** when inline work is not enough, each with at most
//!    half of what remains
//! 5. **End** in `completed`, `failed`, `escalated` or `cancelled`, with a
//!    terminal summary
//!
//! A checkpoint can be taken at any phase boundary and resumed later
//! without granting fresh budget.

pub mod checkpoint;
pub mod machine;
pub mod recursion;
pub mod runtime;

pub use checkpoint::{latest_checkpoint_id, load_and_resume, open_checkpoint_store};
pub use machine::{EpisodeMachine, PhaseTransition};
pub use recursion::{
    ChildOutcome, ChildPurpose, ChildRequest, DEFAULT_CHILD_FRACTION, RecursionController,
    SpawnDecision, SpawnTrigger,
};
pub use runtime::EpisodeRuntime;
