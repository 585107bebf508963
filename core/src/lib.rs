pub mod binding;
pub mod builder;
pub mod context;
pub mod definition;
pub mod delegate;
pub mod error;
pub mod event;
pub mod handle;
pub mod instance;
pub mod node;
pub mod object;
pub mod schematic;
pub mod shared;
pub mod state;
pub mod status;
pub mod tag;
pub mod value;

pub use binding::{CopyBatch, CopyReport, DataHandle, DataView};
pub use builder::{
    BindingSource, MAX_EXPRESSION_INDENT, NodeDesc, StateDesc, TargetDesc, TransitionDesc, TreeBuilder,
};
pub use context::{ContextData, ContextDescriptor, ContextKind, ExternalHandle};
pub use definition::{TreeDefinition, TreeLibrary, TreeSettings};
pub use delegate::{DelegateHub, DelegateId, ListenerId, ListenerOwner};
pub use error::{BindingError, LinkError, SelectionError, TreeError, TreeResult};
pub use event::{Event, EventDesc, EventQueue};
pub use handle::{
    BatchIndex, DefinitionId, FrameId, InstanceHandle, InstanceIndex, NodeIndex, NodeRange, SharedIndex,
    StateIndex, TransitionIndex,
};
pub use instance::InstanceStorage;
pub use node::{
    ChangeType, Condition, Consideration, Evaluator, Linker, Node, NodeBase, NodeContext, NodeKind,
    NodeRequests, Operand, PropertyFunction, Task, TaskFlags, TransitionInfo, TransitionRequest,
};
pub use object::{ObjectHandle, ObjectRegistry, SoftObjectPath};
pub use schematic::TreeSchematic;
pub use shared::{SharedInstanceCache, SharedInstancePool};
pub use state::{
    CompactState, CompactTransition, Priority, SelectionBehavior, SelectionFallback, StateKind,
    TransitionDelay, TransitionTarget, TransitionTrigger,
};
pub use status::{CompletionPolicy, RunStatus, TaskStatus, TasksCompletion, MAX_TASKS_PER_GROUP};
pub use tag::Tag;
pub use value::{FieldDesc, StructType, StructValue, Value, ValueType};

pub mod prelude {
    pub use crate::builder::{BindingSource, NodeDesc, StateDesc, TargetDesc, TransitionDesc, TreeBuilder};
    pub use crate::definition::{TreeDefinition, TreeLibrary};
    pub use crate::event::EventDesc;
    pub use crate::node::{
        Condition, Consideration, Evaluator, NodeBase, NodeContext, PropertyFunction, Task, TaskFlags, TransitionInfo,
    };
    pub use crate::state::{Priority, SelectionBehavior};
    pub use crate::status::{CompletionPolicy, RunStatus};
    pub use crate::tag::Tag;
    pub use crate::value::{FieldDesc, StructType, StructValue, Value, ValueType};
}
