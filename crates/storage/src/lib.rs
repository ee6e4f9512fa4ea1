pub mod placement;
pub mod policy;
pub mod registry;
pub mod volume;

pub use placement::{Part, PlacementEngine};
pub use policy::{PlacementResult, StoragePolicy};
pub use registry::{MemoryTransport, ObjectStoreFactory, StorageRegistry};
pub use volume::Volume;
