pub mod channel;
pub mod error;
pub mod fiber;
pub mod pool;
pub mod queue;
pub mod request;
pub mod scheduler;

pub use channel::{Channel, Subscriber, SubscriptionHandle};
pub use error::{QueueError, Result};
pub use fiber::{Disposable, Fiber, PoolFiber, Registry, ThreadFiber};
pub use pool::{DefaultThreadPool, WorkerPool};
pub use queue::{
    BatchExecutor, Command, DirectExecutor, ExecutionQueue, QueueConfig, TrappingExecutor,
};
pub use request::{Reply, Request, RequestChannel};
pub use scheduler::{ExecutionContext, Scheduler, TimerHandle, TimerThread};
