pub mod flusher;
pub mod kvstore;
pub mod memory;
pub mod mutation_log;
