pub mod entities;
pub mod memory;
pub mod traffic;

pub use memory::MemoryStore;
pub use traffic::TrafficStorage;
