pub mod memory_backend;

pub use memory_backend::MemoryBackend;
