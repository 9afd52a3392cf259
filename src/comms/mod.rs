pub mod errors;
pub mod result;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod stop;
pub mod waiter;
pub mod writer;
