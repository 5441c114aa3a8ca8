mod hash_lock;
mod line_lock;

pub use hash_lock::HashLocks;
pub use line_lock::LineLocks;
