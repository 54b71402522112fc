//! Parameter storage: typed buffers, blocks, and the concurrent store

pub mod block;
pub mod store;
pub mod tensor;

pub use block::ParameterBlock;
pub use store::ParameterStore;
pub use tensor::{numel, ElementType, Tensor};
