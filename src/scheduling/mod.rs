pub mod recurring_scheduler;
pub mod reentrancy_guard;
pub mod task_queue;
pub mod types;

pub use recurring_scheduler::RecurringScheduler;
pub use reentrancy_guard::ReentrancyGuard;
pub use task_queue::TaskQueue;
pub use types::Token;
