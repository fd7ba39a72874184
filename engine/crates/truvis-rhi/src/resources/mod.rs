pub mod buffer;
pub mod deletion_queue;
pub mod image;
