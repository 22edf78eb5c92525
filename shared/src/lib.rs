pub mod change;
pub mod reconciler;
pub mod task;

pub use change::{ChangeEvent, ChangeKind, MalformedChange, RowChange, RowKey};
pub use reconciler::{LoadTicket, ReconcilerState, TaskReconciler};
pub use task::{sort_newest_first, NewTask, Task, TaskPatch, ValidationError};
