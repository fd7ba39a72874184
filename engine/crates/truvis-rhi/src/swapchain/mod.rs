pub mod negotiate;
pub mod present_state;
pub mod surface;
#[allow(clippy::module_inception)]
pub mod swapchain;
