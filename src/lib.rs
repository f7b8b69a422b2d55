pub mod arena;
pub mod llrb;
pub mod tango;

pub use arena::FromSlice;
pub use arena::ZeroCopy;
pub use arena::SENTINEL;

pub use arena::NodeArena;
pub use llrb::Color;
pub use llrb::Llrb;
pub use llrb::LlrbNode;
pub use llrb::Mark;
pub use llrb::TreeError;
pub use tango::TangoTree;
